//! Queue draining.
//!
//! One pass pops chains until the ring is empty, completing each with
//! exactly one used element. While draining, guest kicks are suppressed
//! through `VIRTQ_USED_F_NO_NOTIFY`; the flag is cleared again before the
//! pass ends, and the ring is re-checked so a chain published in between is
//! not left waiting for a kick the driver will never send.
//!
//! A malformed chain is dropped and counted as detached. An available ring
//! the driver overran breaks the queue instead: nothing was consumed, so the
//! device raises a configuration change and reports `DEVICE_NEEDS_RESET`
//! until the driver resets it.

use std::time::Instant;

use log::{debug, error, log_enabled, trace, warn, Level};

use super::codec::{self, ProtocolError, Request};
use super::{Protocol, Translator, VirtioMemsplit};
use crate::devices::virtio::queue::{DescriptorChain, VirtqDesc};
use crate::devices::virtio::{InterruptKind, Virtqueue};
use crate::memory::GuestMemory;

/// Queue index of the only queue.
const REQUEST_QUEUE: u16 = 0;

enum Outcome {
    Completed,
    Failed,
}

impl VirtioMemsplit {
    /// Drain the request queue. Returns the number of completed chains.
    pub(super) fn process_queue(&mut self, now: Instant) -> usize {
        let memory = self.memory.clone();
        let Some(suppress) = self
            .queue
            .as_ref()
            .map(Virtqueue::supports_notification_suppression)
        else {
            return 0;
        };
        let mut completed = 0;

        loop {
            if suppress {
                self.set_notification(&memory, false);
            }

            loop {
                let popped = match self.queue.as_mut() {
                    Some(queue) => queue.pop(&memory),
                    None => return completed,
                };
                let chain = match popped {
                    Ok(Some(chain)) => chain,
                    Ok(None) => break,
                    Err(e) => {
                        self.set_notification(&memory, true);
                        if self.queue.as_ref().is_some_and(Virtqueue::is_broken) {
                            error!("virtio-memsplit: request queue needs reset: {}", e);
                            self.interrupt.signal(InterruptKind::ConfigChange);
                        } else {
                            warn!("virtio-memsplit: dropping chain: {}", e);
                            self.stats.detached += 1;
                        }
                        return completed;
                    }
                };

                match self.handle_chain(chain, &memory, now) {
                    Outcome::Completed => completed += 1,
                    Outcome::Failed => return completed,
                }
            }

            self.set_notification(&memory, true);
            if !suppress {
                break;
            }
            #[cfg(test)]
            if let Some(hook) = self.drain_hook.as_mut() {
                hook(&memory);
            }
            let empty = match self.queue.as_ref() {
                Some(queue) => queue.is_empty(&memory),
                None => Ok(true),
            };
            match empty {
                Ok(true) => break,
                Ok(false) => trace!("virtio-memsplit: chains arrived during drain"),
                Err(e) => {
                    warn!("virtio-memsplit: cannot re-check ring: {}", e);
                    break;
                }
            }
        }
        completed
    }

    fn set_notification(&self, memory: &GuestMemory, enable: bool) {
        let Some(queue) = self.queue.as_ref() else {
            return;
        };
        if let Err(e) = queue.set_notification(memory, enable) {
            warn!(
                "virtio-memsplit: cannot {} notifications: {}",
                if enable { "enable" } else { "suppress" },
                e
            );
        }
    }

    /// Complete or detach one chain.
    fn handle_chain(&mut self, chain: DescriptorChain, memory: &GuestMemory, now: Instant) -> Outcome {
        let (head, descs) = chain.into_parts();
        let result = respond(
            memory,
            self.config.protocol,
            self.translator.as_ref(),
            &descs,
        );
        let Some(queue) = self.queue.as_mut() else {
            return Outcome::Failed;
        };

        let written = match result {
            Ok(written) => written,
            Err(e) => {
                let index = queue.detach(head);
                warn!("virtio-memsplit: request {} abandoned: {}", index, e);
                self.stats.detached += 1;
                self.set_notification(memory, true);
                return Outcome::Failed;
            }
        };

        let index = head.index();
        if let Err(e) = queue.push(memory, head, written) {
            warn!("virtio-memsplit: cannot complete request {}: {}", index, e);
            self.stats.detached += 1;
            self.set_notification(memory, true);
            return Outcome::Failed;
        }
        self.stats.completed += 1;
        trace!("virtio-memsplit: completed {} ({} bytes)", index, written);

        self.notify(now);
        Outcome::Completed
    }

    /// One notification per completion, now or after the configured delay.
    fn notify(&mut self, now: Instant) {
        let target = InterruptKind::Queue(REQUEST_QUEUE);
        if !self.config.notify_delay.is_zero() {
            self.notifier
                .schedule(now, self.config.notify_delay, target);
            return;
        }

        let wanted = self
            .queue
            .as_ref()
            .is_some_and(|q| q.needs_interrupt(&self.memory));
        if wanted {
            self.interrupt.signal(target);
            self.stats.interrupts += 1;
        } else {
            trace!("virtio-memsplit: interrupt suppressed by driver");
        }
    }
}

/// Decode, interpret and answer one request. Returns the bytes written.
fn respond(
    memory: &GuestMemory,
    protocol: Protocol,
    translator: Option<&Translator>,
    descs: &[VirtqDesc],
) -> Result<u32, ProtocolError> {
    let request = codec::decode(REQUEST_QUEUE, descs)?;
    if let Some(translator) = translator {
        trace_buffers(translator, &request);
    }
    let payload = codec::interpret(&request, protocol, memory)?;
    debug!(
        "virtio-memsplit: {} ({} readable, {} writable bytes)",
        payload,
        request.readable_len(),
        request.writable_capacity()
    );
    codec::encode_response(&request, &payload, memory)
}

/// Log where each guest buffer lives in this process.
fn trace_buffers(translator: &Translator, request: &Request) {
    if !log_enabled!(Level::Debug) {
        return;
    }
    let buffers = request
        .readable
        .iter()
        .map(|b| ("in", b))
        .chain(request.writable.iter().map(|b| ("out", b)));
    for (dir, buf) in buffers {
        match translator.gpa_to_hva(buf.addr, buf.len as u64) {
            Ok(hva) => debug!(
                "virtio-memsplit:   {} gpa {:#x}+{:#x} at hva {:#x}",
                dir, buf.addr, buf.len, hva
            ),
            Err(e) => debug!("virtio-memsplit:   {} {}", dir, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::memsplit::{MemsplitConfig, RegionModel, RegionRegistry, QUEUE_SIZE};
    use crate::devices::virtio::queue::{VIRTQ_DESC_F_WRITE, VIRTQ_USED_F_NO_NOTIFY};
    use crate::devices::virtio::{Interrupt, VirtioDevice, VIRTIO_MMIO_INT_CONFIG};
    use crate::driver::{AVAIL_RING, DATA_BASE, DESC_TABLE, SLOT_SIZE, USED_RING};
    use crate::memory::{MemoryLayout, Subregion};
    use std::sync::Arc;

    fn setup() -> (GuestMemory, Translator) {
        let memory = GuestMemory::new(MemoryLayout::new(0x10_0000)).unwrap();
        let mut map = memory.memory_map().unwrap();
        map.add(Subregion::mmio("virtio-mmio", 0xd000_0000, 0x1000))
            .unwrap();
        let registry = RegionRegistry::discover(&map, RegionModel::Split).unwrap();
        (memory, Translator::new(map, registry))
    }

    #[test]
    fn test_respond_greeting() {
        let (memory, translator) = setup();
        let descs = [VirtqDesc {
            addr: 0x4000,
            len: 64,
            flags: VIRTQ_DESC_F_WRITE,
            next: 0,
        }];
        let written = respond(&memory, Protocol::Greeting, Some(&translator), &descs).unwrap();
        assert_eq!(written as usize, codec::GREETING.len());
    }

    #[test]
    fn test_respond_rejects_misordered_chain() {
        let (memory, translator) = setup();
        let descs = [
            VirtqDesc {
                addr: 0x4000,
                len: 8,
                flags: VIRTQ_DESC_F_WRITE,
                next: 0,
            },
            VirtqDesc {
                addr: 0x5000,
                len: 8,
                flags: 0,
                next: 0,
            },
        ];
        assert!(matches!(
            respond(&memory, Protocol::Echo, Some(&translator), &descs),
            Err(ProtocolError::Misordered { index: 1 })
        ));
    }

    #[test]
    fn test_respond_buffer_in_mmio_window() {
        let (memory, translator) = setup();
        let descs = [VirtqDesc {
            addr: 0xd000_0000,
            len: 4,
            flags: 0,
            next: 0,
        }];
        assert!(matches!(
            respond(&memory, Protocol::Echo, Some(&translator), &descs),
            Err(ProtocolError::GuestMemory(_))
        ));
    }

    /// A realized device whose queue uses the driver's ring layout, with
    /// one writable descriptor per slot.
    fn ready_device() -> (VirtioMemsplit, Arc<GuestMemory>, Arc<Interrupt>) {
        let memory = Arc::new(GuestMemory::new(MemoryLayout::new(0x10_0000)).unwrap());
        let map = memory.memory_map().unwrap();
        let interrupt = Arc::new(Interrupt::new(None));
        let mut dev = VirtioMemsplit::new(
            MemsplitConfig::default(),
            memory.clone(),
            map,
            interrupt.clone(),
        );
        dev.realize().unwrap();

        let queue = dev.queue.as_mut().unwrap();
        queue.desc_table = DESC_TABLE;
        queue.avail_ring = AVAIL_RING;
        queue.used_ring = USED_RING;
        queue.ready = true;

        for index in 0..QUEUE_SIZE {
            let desc = DESC_TABLE + index as u64 * VirtqDesc::SIZE as u64;
            memory
                .write_u64(desc, DATA_BASE + index as u64 * SLOT_SIZE as u64)
                .unwrap();
            memory.write_u32(desc + 8, 64).unwrap();
            memory.write_u16(desc + 12, VIRTQ_DESC_F_WRITE).unwrap();
            memory.write_u16(desc + 14, 0).unwrap();
        }
        (dev, memory, interrupt)
    }

    fn publish(memory: &GuestMemory, slot: u16, head: u16) {
        memory.write_u16(AVAIL_RING + 4 + slot as u64 * 2, head).unwrap();
        memory.write_u16(AVAIL_RING + 2, slot + 1).unwrap();
    }

    #[test]
    fn test_chain_published_while_kicks_reenabled_is_drained() {
        let (mut dev, memory, interrupt) = ready_device();
        publish(&memory, 0, 0);

        let mut late = Some(1u16);
        dev.drain_hook = Some(Box::new(move |memory: &GuestMemory| {
            if let Some(head) = late.take() {
                publish(memory, 1, head);
            }
        }));

        assert_eq!(dev.process_queue(Instant::now()), 2);
        assert_eq!(memory.read_u16(USED_RING + 2).unwrap(), 2);
        assert_eq!(memory.read_u32(USED_RING + 4).unwrap(), 0);
        assert_eq!(memory.read_u32(USED_RING + 12).unwrap(), 1);
        assert_eq!(memory.read_u16(USED_RING).unwrap() & VIRTQ_USED_F_NO_NOTIFY, 0);
        assert_eq!(dev.stats.completed, 2);
        assert_eq!(interrupt.raised(), 2);
    }

    #[test]
    fn test_avail_overrun_needs_reset_without_detaching() {
        let (mut dev, memory, interrupt) = ready_device();
        memory.write_u16(AVAIL_RING + 2, QUEUE_SIZE + 1).unwrap();

        for _ in 0..3 {
            assert_eq!(dev.process_queue(Instant::now()), 0);
        }
        assert_eq!(dev.stats.detached, 0);
        assert!(dev.needs_reset());
        assert_eq!(interrupt.raised(), 1);
        assert_eq!(interrupt.status(), VIRTIO_MMIO_INT_CONFIG);
        assert_eq!(memory.read_u16(USED_RING + 2).unwrap(), 0);

        dev.reset();
        assert!(!dev.needs_reset());
    }

    #[test]
    fn test_malformed_chain_counts_as_detached() {
        let (mut dev, memory, interrupt) = ready_device();
        publish(&memory, 0, QUEUE_SIZE + 3);

        assert_eq!(dev.process_queue(Instant::now()), 0);
        assert_eq!(dev.stats.detached, 1);
        assert!(!dev.needs_reset());
        assert_eq!(interrupt.raised(), 0);
    }
}
