//! In-process virtio-mmio driver.
//!
//! Plays the guest side of the protocol against the MMIO bus: device discovery,
//! feature negotiation, split virtqueue setup in guest RAM, posting
//! descriptor chains and collecting used elements. Each descriptor owns a
//! fixed data slot, so a chain of N segments uses N slots.
//!
//! ```text
//! 0x1_0000  descriptor table
//! 0x1_1000  available ring
//! 0x1_2000  used ring
//! 0x2_0000  data slots, SLOT_SIZE bytes per descriptor
//! ```

use std::collections::HashMap;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use log::{debug, info};
use thiserror::Error;

#[cfg(test)]
use crate::devices::virtio::queue::VIRTQ_AVAIL_F_NO_INTERRUPT;
use crate::devices::virtio::queue::{VirtqDesc, VIRTQ_DESC_F_NEXT, VIRTQ_DESC_F_WRITE};
use crate::devices::virtio::{
    MMIO_DEVICE_FEATURES, MMIO_DEVICE_FEATURES_SEL, MMIO_DEVICE_ID, MMIO_DRIVER_FEATURES,
    MMIO_DRIVER_FEATURES_SEL, MMIO_INTERRUPT_ACK, MMIO_INTERRUPT_STATUS, MMIO_MAGIC_VALUE,
    MMIO_QUEUE_DESC_HIGH, MMIO_QUEUE_DESC_LOW, MMIO_QUEUE_DEVICE_HIGH, MMIO_QUEUE_DEVICE_LOW,
    MMIO_QUEUE_DRIVER_HIGH, MMIO_QUEUE_DRIVER_LOW, MMIO_QUEUE_NOTIFY, MMIO_QUEUE_NUM,
    MMIO_QUEUE_NUM_MAX, MMIO_QUEUE_READY, MMIO_QUEUE_SEL, MMIO_STATUS, MMIO_VERSION,
    STATUS_ACKNOWLEDGE, STATUS_DRIVER, STATUS_DRIVER_OK, STATUS_FEATURES_OK, VIRTIO_F_VERSION_1,
    VIRTIO_MMIO_MAGIC, VIRTIO_MMIO_VERSION,
};
use crate::devices::MmioBus;
use crate::memory::{GuestMemory, MemoryError};

pub const DESC_TABLE: u64 = 0x1_0000;
pub const AVAIL_RING: u64 = 0x1_1000;
pub const USED_RING: u64 = 0x1_2000;
pub const DATA_BASE: u64 = 0x2_0000;
pub const SLOT_SIZE: u32 = 0x1000;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("No virtio-mmio device at {base:#x} (magic {magic:#x}, version {version})")]
    NoDevice { base: u64, magic: u32, version: u32 },

    #[error("Expected device type {expected}, found {found}")]
    WrongDevice { expected: u32, found: u32 },

    #[error("Device refused FEATURES_OK")]
    FeaturesRejected,

    #[error("Device does not offer VIRTIO_F_VERSION_1")]
    LegacyDevice,

    #[error("Queue 0 is not available")]
    QueueUnavailable,

    #[error("Need {needed} free descriptors, {free} left")]
    QueueFull { needed: usize, free: usize },

    #[error("Segment of {len} bytes does not fit a {max}-byte slot")]
    SegmentTooLarge { len: usize, max: u32 },

    #[error("Cannot post an empty chain")]
    EmptyChain,

    #[error("Device completed unknown chain {0}")]
    UnknownChain(u16),

    #[error("Guest memory access failed: {0}")]
    Memory(#[from] MemoryError),
}

/// One buffer of a chain to post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Device-readable bytes.
    Readable(Vec<u8>),
    /// Device-writable buffer of the given capacity.
    Writable(u32),
}

/// A completed chain, as the driver sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsedElem {
    /// Head descriptor index.
    pub id: u16,
    /// Length reported by the device.
    pub len: u32,
    /// The first `len` bytes of the chain's writable buffers.
    pub written: Vec<u8>,
}

/// Descriptors and writable buffers of a posted chain.
struct InFlight {
    descs: Vec<u16>,
    writable: Vec<(u64, u32)>,
}

pub struct GuestDriver {
    memory: Arc<GuestMemory>,
    base: u64,
    queue_size: u16,
    free: Vec<u16>,
    avail_idx: u16,
    last_used_idx: u16,
    in_flight: HashMap<u16, InFlight>,
}

fn read32(bus: &mut MmioBus, addr: u64) -> u32 {
    let mut data = [0u8; 4];
    bus.read(addr, &mut data);
    u32::from_le_bytes(data)
}

fn write32(bus: &mut MmioBus, addr: u64, value: u32) {
    bus.write(addr, &value.to_le_bytes());
}

impl GuestDriver {
    /// Initialize the virtio-mmio device at `base` and set up queue 0.
    ///
    /// # Errors
    ///
    /// Fails if the device is missing or of the wrong type, rejects the
    /// negotiated features, or has no queue 0.
    pub fn connect(
        bus: &mut MmioBus,
        memory: Arc<GuestMemory>,
        base: u64,
        device_type: u32,
        queue_size: u16,
    ) -> Result<Self, DriverError> {
        let magic = read32(bus, base + MMIO_MAGIC_VALUE);
        let version = read32(bus, base + MMIO_VERSION);
        if magic != VIRTIO_MMIO_MAGIC || version != VIRTIO_MMIO_VERSION {
            return Err(DriverError::NoDevice {
                base,
                magic,
                version,
            });
        }
        let found = read32(bus, base + MMIO_DEVICE_ID);
        if found != device_type {
            return Err(DriverError::WrongDevice {
                expected: device_type,
                found,
            });
        }

        write32(bus, base + MMIO_STATUS, 0);
        let mut status = STATUS_ACKNOWLEDGE | STATUS_DRIVER;
        write32(bus, base + MMIO_STATUS, status);

        // Feature negotiation
        write32(bus, base + MMIO_DEVICE_FEATURES_SEL, 0);
        let low = read32(bus, base + MMIO_DEVICE_FEATURES) as u64;
        write32(bus, base + MMIO_DEVICE_FEATURES_SEL, 1);
        let high = read32(bus, base + MMIO_DEVICE_FEATURES) as u64;
        let offered = (high << 32) | low;
        if offered & VIRTIO_F_VERSION_1 == 0 {
            return Err(DriverError::LegacyDevice);
        }
        let accepted = offered & VIRTIO_F_VERSION_1;
        write32(bus, base + MMIO_DRIVER_FEATURES_SEL, 0);
        write32(bus, base + MMIO_DRIVER_FEATURES, accepted as u32);
        write32(bus, base + MMIO_DRIVER_FEATURES_SEL, 1);
        write32(bus, base + MMIO_DRIVER_FEATURES, (accepted >> 32) as u32);

        status |= STATUS_FEATURES_OK;
        write32(bus, base + MMIO_STATUS, status);
        if read32(bus, base + MMIO_STATUS) & STATUS_FEATURES_OK == 0 {
            return Err(DriverError::FeaturesRejected);
        }

        // Queue setup
        write32(bus, base + MMIO_QUEUE_SEL, 0);
        let max = read32(bus, base + MMIO_QUEUE_NUM_MAX);
        if max == 0 {
            return Err(DriverError::QueueUnavailable);
        }
        let size = queue_size.min(max as u16);
        if size == 0 {
            return Err(DriverError::QueueUnavailable);
        }
        // Largest power of two that fits.
        let size = 1u16 << (u16::BITS - 1 - size.leading_zeros());

        memory.write(DESC_TABLE, &vec![0u8; size as usize * VirtqDesc::SIZE])?;
        memory.write(AVAIL_RING, &vec![0u8; 6 + size as usize * 2])?;
        memory.write(USED_RING, &vec![0u8; 6 + size as usize * 8])?;

        write32(bus, base + MMIO_QUEUE_NUM, size as u32);
        write32(bus, base + MMIO_QUEUE_DESC_LOW, DESC_TABLE as u32);
        write32(bus, base + MMIO_QUEUE_DESC_HIGH, (DESC_TABLE >> 32) as u32);
        write32(bus, base + MMIO_QUEUE_DRIVER_LOW, AVAIL_RING as u32);
        write32(bus, base + MMIO_QUEUE_DRIVER_HIGH, (AVAIL_RING >> 32) as u32);
        write32(bus, base + MMIO_QUEUE_DEVICE_LOW, USED_RING as u32);
        write32(bus, base + MMIO_QUEUE_DEVICE_HIGH, (USED_RING >> 32) as u32);
        write32(bus, base + MMIO_QUEUE_READY, 1);

        status |= STATUS_DRIVER_OK;
        write32(bus, base + MMIO_STATUS, status);
        info!(
            "driver: device {} at {:#x} ready, queue size {}",
            device_type, base, size
        );

        Ok(Self {
            memory,
            base,
            queue_size: size,
            free: (0..size).rev().collect(),
            avail_idx: 0,
            last_used_idx: 0,
            in_flight: HashMap::new(),
        })
    }

    pub fn queue_size(&self) -> u16 {
        self.queue_size
    }

    pub fn free_descriptors(&self) -> usize {
        self.free.len()
    }

    fn slot(index: u16) -> u64 {
        DATA_BASE + index as u64 * SLOT_SIZE as u64
    }

    /// Build a chain from `segments` and make it available.
    ///
    /// Returns the head descriptor index.
    pub fn post(&mut self, segments: &[Segment]) -> Result<u16, DriverError> {
        if segments.is_empty() {
            return Err(DriverError::EmptyChain);
        }
        if self.free.len() < segments.len() {
            return Err(DriverError::QueueFull {
                needed: segments.len(),
                free: self.free.len(),
            });
        }
        for segment in segments {
            let len = match segment {
                Segment::Readable(bytes) => bytes.len(),
                Segment::Writable(len) => *len as usize,
            };
            if len > SLOT_SIZE as usize {
                return Err(DriverError::SegmentTooLarge {
                    len,
                    max: SLOT_SIZE,
                });
            }
        }

        let descs: Vec<u16> = (0..segments.len()).filter_map(|_| self.free.pop()).collect();
        let mut writable = Vec::new();

        for (i, (segment, &index)) in segments.iter().zip(&descs).enumerate() {
            let addr = Self::slot(index);
            let (len, mut flags) = match segment {
                Segment::Readable(bytes) => {
                    self.memory.write(addr, bytes)?;
                    (bytes.len() as u32, 0)
                }
                Segment::Writable(len) => {
                    writable.push((addr, *len));
                    (*len, VIRTQ_DESC_F_WRITE)
                }
            };
            let next = descs.get(i + 1).copied().unwrap_or(0);
            if i + 1 < descs.len() {
                flags |= VIRTQ_DESC_F_NEXT;
            }
            self.write_descriptor(index, addr, len, flags, next)?;
        }

        let head = descs[0];
        self.in_flight.insert(head, InFlight { descs, writable });
        self.publish(head)?;
        Ok(head)
    }

    /// Overwrite descriptor `index` in the descriptor table.
    pub fn write_descriptor(
        &self,
        index: u16,
        addr: u64,
        len: u32,
        flags: u16,
        next: u16,
    ) -> Result<(), DriverError> {
        let desc = DESC_TABLE + index as u64 * VirtqDesc::SIZE as u64;
        self.memory.write_u64(desc, addr)?;
        self.memory.write_u32(desc + 8, len)?;
        self.memory.write_u16(desc + 12, flags)?;
        self.memory.write_u16(desc + 14, next)?;
        Ok(())
    }

    fn publish(&mut self, head: u16) -> Result<(), DriverError> {
        let entry = AVAIL_RING + 4 + (self.avail_idx % self.queue_size) as u64 * 2;
        self.memory.write_u16(entry, head)?;
        // Ring entry before the index that exposes it.
        fence(Ordering::Release);
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.memory.write_u16(AVAIL_RING + 2, self.avail_idx)?;
        debug!("driver: published head {} (avail idx {})", head, self.avail_idx);
        Ok(())
    }

    /// Tell the device queue 0 has new buffers.
    pub fn kick(&self, bus: &mut MmioBus) {
        write32(bus, self.base + MMIO_QUEUE_NOTIFY, 0);
    }

    /// Collect every used element published since the last call.
    pub fn used(&mut self) -> Result<Vec<UsedElem>, DriverError> {
        let used_idx = self.memory.read_u16(USED_RING + 2)?;
        fence(Ordering::Acquire);

        let mut elems = Vec::new();
        while self.last_used_idx != used_idx {
            let elem = USED_RING + 4 + (self.last_used_idx % self.queue_size) as u64 * 8;
            let id = self.memory.read_u32(elem)? as u16;
            let len = self.memory.read_u32(elem + 4)?;
            self.last_used_idx = self.last_used_idx.wrapping_add(1);

            let chain = self
                .in_flight
                .remove(&id)
                .ok_or(DriverError::UnknownChain(id))?;

            let mut written = Vec::new();
            let mut remaining = len as usize;
            for &(addr, cap) in &chain.writable {
                if remaining == 0 {
                    break;
                }
                let n = remaining.min(cap as usize);
                let mut buf = vec![0u8; n];
                self.memory.read(addr, &mut buf)?;
                written.extend_from_slice(&buf);
                remaining -= n;
            }
            self.free.extend(chain.descs);
            elems.push(UsedElem { id, len, written });
        }
        Ok(elems)
    }

    pub fn interrupt_status(&self, bus: &mut MmioBus) -> u32 {
        read32(bus, self.base + MMIO_INTERRUPT_STATUS)
    }

    pub fn ack_interrupt(&self, bus: &mut MmioBus, bits: u32) {
        write32(bus, self.base + MMIO_INTERRUPT_ACK, bits);
    }

    pub fn status(&self, bus: &mut MmioBus) -> u32 {
        read32(bus, self.base + MMIO_STATUS)
    }

    /// Reset the device. The driver has to connect again afterwards.
    pub fn reset(self, bus: &mut MmioBus) {
        write32(bus, self.base + MMIO_STATUS, 0);
    }
}

#[cfg(test)]
impl GuestDriver {
    /// Make `head` available without building a chain for it.
    pub fn post_raw(&mut self, head: u16) -> Result<(), DriverError> {
        self.publish(head)
    }

    /// Forget a chain the device dropped without completing it.
    pub fn reclaim(&mut self, head: u16) -> bool {
        match self.in_flight.remove(&head) {
            Some(chain) => {
                self.free.extend(chain.descs);
                true
            }
            None => false,
        }
    }

    /// Ask the device not to interrupt on used buffers.
    pub fn suppress_interrupts(&self, suppress: bool) -> Result<(), DriverError> {
        let flags = if suppress {
            VIRTQ_AVAIL_F_NO_INTERRUPT
        } else {
            0
        };
        self.memory.write_u16(AVAIL_RING, flags)?;
        Ok(())
    }

    /// Flags the device publishes in the used ring.
    pub fn used_flags(&self) -> Result<u16, DriverError> {
        Ok(self.memory.read_u16(USED_RING)?)
    }
}
