//! virtio-memsplit: a guest memory introspection device.
//!
//! At realize the device discovers which parts of the memory map are guest
//! RAM and where that RAM lives in this process, then reports for every
//! region the guest physical, host virtual and host physical addresses.
//! Afterwards it answers requests on its single virtqueue according to the
//! configured [`Protocol`].
//!
//! # Lifecycle
//!
//! ```text
//! Uninit ──realize──► Ready ──unrealize──► Draining ──► Stopped
//!    └────────────────────unrealize───────────────────────┘
//! ```

pub mod codec;
pub mod notifier;
pub mod pagemap;
mod processor;
pub mod registry;
pub mod translate;

pub use crate::config::{MemsplitConfig, Protocol, RegionModel};
pub use codec::GREETING;
pub use notifier::{Notifier, NotifyTarget};
pub use registry::{RegionRegistry, RegistryError};
pub use translate::Translator;

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, trace, warn};
use thiserror::Error;

use super::{Interrupt, InterruptKind, VirtioDevice, Virtqueue};
use crate::memory::{GuestMemory, MemoryMap};

/// Device type ID. Not assigned by the virtio specification.
pub const VIRTIO_ID_MEMSPLIT: u32 = 63;

/// Depth of the request queue.
pub const QUEUE_SIZE: u16 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Uninit,
    Ready,
    Draining,
    Stopped,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Uninit => "uninit",
            DeviceState::Ready => "ready",
            DeviceState::Draining => "draining",
            DeviceState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum MemsplitError {
    #[error("virtio-memsplit initialization failed: {0}")]
    FatalInit(#[from] RegistryError),

    #[error("virtio-memsplit is {actual}, expected {expected}")]
    InvalidState {
        expected: DeviceState,
        actual: DeviceState,
    },
}

/// Counters kept over the device's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemsplitStats {
    /// Chains completed with a used element.
    pub completed: u64,
    /// Chains dropped without completion.
    pub detached: u64,
    /// Used-buffer interrupts raised.
    pub interrupts: u64,
    /// Configuration-change heartbeats raised.
    pub heartbeats: u64,
}

pub struct VirtioMemsplit {
    config: MemsplitConfig,
    memory: Arc<GuestMemory>,
    memory_map: MemoryMap,
    state: DeviceState,
    translator: Option<Translator>,
    queue: Option<Virtqueue>,
    notifier: Notifier,
    interrupt: Arc<Interrupt>,
    stats: MemsplitStats,
    /// Runs after kicks are re-enabled, before the ring is re-checked.
    #[cfg(test)]
    drain_hook: Option<Box<dyn FnMut(&GuestMemory)>>,
}

impl VirtioMemsplit {
    pub fn new(
        config: MemsplitConfig,
        memory: Arc<GuestMemory>,
        memory_map: MemoryMap,
        interrupt: Arc<Interrupt>,
    ) -> Self {
        Self {
            config,
            memory,
            memory_map,
            state: DeviceState::Uninit,
            translator: None,
            queue: None,
            notifier: Notifier::new(),
            interrupt,
            stats: MemsplitStats::default(),
            #[cfg(test)]
            drain_hook: None,
        }
    }

    /// Log every region's addresses in all three address spaces.
    fn report_regions(translator: &Translator) {
        for region in translator.registry().iter() {
            info!(
                "virtio-memsplit: {} gpa {:#x}-{:#x} ({} MiB)",
                region.name,
                region.guest_base,
                region.guest_end(),
                region.size >> 20
            );

            match translator.gpa_to_hva(region.guest_base, region.size) {
                Ok(hva) => info!("virtio-memsplit:   gpa {:#x} -> hva {:#x}", region.guest_base, hva),
                Err(e) => warn!("virtio-memsplit:   {}", e),
            }
            match translator.hva_to_gpa(region.host_base) {
                Ok(gpa) => {
                    info!("virtio-memsplit:   hva {:#x} -> gpa {:#x}", region.host_base, gpa);
                    let owner = translator.registry().lookup_gpa(gpa).map(|r| r.name.as_str());
                    if owner != Some(region.name.as_str()) {
                        warn!(
                            "virtio-memsplit:   gpa {:#x} resolves to {:?}, not {}",
                            gpa, owner, region.name
                        );
                    }
                }
                Err(e) => warn!("virtio-memsplit:   {}", e),
            }
            match translator.hva_to_hpa(region.host_base) {
                Ok(hpa) => info!("virtio-memsplit:   hva {:#x} -> hpa {:#x}", region.host_base, hpa),
                Err(e) => warn!("virtio-memsplit:   hpa unavailable: {}", e),
            }
        }
    }

    /// Raise the interrupt a fired timer asked for.
    fn fire(&mut self, target: NotifyTarget, now: Instant) {
        match target {
            InterruptKind::Queue(index) => {
                let Some(queue) = self.queue.as_ref().filter(|q| q.is_usable()) else {
                    debug!("virtio-memsplit: dropping interrupt for unusable queue {}", index);
                    return;
                };
                if queue.needs_interrupt(&self.memory) {
                    self.interrupt.signal(target);
                    self.stats.interrupts += 1;
                } else {
                    trace!("virtio-memsplit: interrupt suppressed by driver");
                }
            }
            InterruptKind::ConfigChange => {
                self.interrupt.signal(target);
                self.stats.heartbeats += 1;
                if let Some(period) = self.config.heartbeat {
                    self.notifier.arm_heartbeat(now, period);
                }
            }
        }
    }
}

impl VirtioDevice for VirtioMemsplit {
    type Error = MemsplitError;

    fn device_type(&self) -> u32 {
        VIRTIO_ID_MEMSPLIT
    }

    fn queue_max_size(&self) -> u16 {
        QUEUE_SIZE
    }

    fn get_features(&self, offered: u64) -> u64 {
        debug!("virtio-memsplit: features {:#x}", offered);
        offered
    }

    fn realize(&mut self) -> Result<(), MemsplitError> {
        if self.state != DeviceState::Uninit {
            return Err(MemsplitError::InvalidState {
                expected: DeviceState::Uninit,
                actual: self.state,
            });
        }

        let registry = RegionRegistry::discover(&self.memory_map, self.config.region_model)?;
        info!(
            "virtio-memsplit: {} RAM regions ({:?} model)",
            registry.len(),
            self.config.region_model
        );
        let translator = Translator::new(self.memory_map.clone(), registry);
        Self::report_regions(&translator);

        self.translator = Some(translator);
        self.queue = Some(Virtqueue::new(QUEUE_SIZE));
        if let Some(period) = self.config.heartbeat {
            self.notifier.arm_heartbeat(Instant::now(), period);
        }
        self.state = DeviceState::Ready;
        info!(
            "virtio-memsplit: realized ({:?} protocol, queue size {})",
            self.config.protocol, QUEUE_SIZE
        );
        Ok(())
    }

    fn unrealize(&mut self) {
        match self.state {
            DeviceState::Stopped => return,
            DeviceState::Uninit => {
                self.state = DeviceState::Stopped;
                return;
            }
            DeviceState::Ready | DeviceState::Draining => {}
        }

        self.state = DeviceState::Draining;
        self.notifier.shutdown();
        self.queue = None;
        self.translator = None;
        self.state = DeviceState::Stopped;
        info!(
            "virtio-memsplit: unrealized (completed {}, detached {}, interrupts {}, heartbeats {})",
            self.stats.completed, self.stats.detached, self.stats.interrupts, self.stats.heartbeats
        );
    }

    fn queue(&self, index: u32) -> Option<&Virtqueue> {
        match index {
            0 => self.queue.as_ref(),
            _ => None,
        }
    }

    fn queue_mut(&mut self, index: u32) -> Option<&mut Virtqueue> {
        match index {
            0 => self.queue.as_mut(),
            _ => None,
        }
    }

    fn handle_queue_notify(&mut self, index: u16) {
        if self.state != DeviceState::Ready {
            debug!("virtio-memsplit: ignoring notify while {}", self.state);
            return;
        }
        if index != 0 {
            warn!("virtio-memsplit: notify for nonexistent queue {}", index);
            return;
        }
        let completed = self.process_queue(Instant::now());
        trace!("virtio-memsplit: pass completed {} chains", completed);
    }

    fn reset(&mut self) {
        if let Some(queue) = self.queue.as_mut() {
            queue.reset();
        }
        let canceled = self.notifier.cancel_queue_notifications();
        debug!(
            "virtio-memsplit: reset, {} pending interrupts canceled, {} timers left",
            canceled,
            self.notifier.pending()
        );
    }

    fn needs_reset(&self) -> bool {
        self.queue.as_ref().is_some_and(Virtqueue::is_broken)
    }

    fn tick(&mut self, now: Instant) -> Option<Instant> {
        if self.state != DeviceState::Ready {
            return None;
        }
        for target in self.notifier.expire(now) {
            self.fire(target, now);
        }
        self.notifier.next_deadline()
    }
}
