//! MMIO bus.
//!
//! Routes guest physical accesses to whichever device window contains them.
//! Only one window is populated today:
//!
//! ```text
//! 0xd000_0000 - 0xd000_0FFF  virtio-memsplit registers
//! ```

use std::time::Instant;

use log::{debug, trace};
use thiserror::Error;

/// Base address of the virtio-mmio window.
pub const VIRTIO_MMIO_BASE: u64 = 0xd000_0000;

/// One 4 KiB page of registers per device.
pub const VIRTIO_MMIO_SIZE: u64 = 0x1000;

/// Legacy IRQ line of the virtio-memsplit device, routed through the IOAPIC.
pub const VIRTIO_MEMSPLIT_IRQ: u32 = 5;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BusError {
    #[error("MMIO window {base:#x}+{size:#x} is empty or wraps")]
    InvalidWindow { base: u64, size: u64 },

    #[error("MMIO window {base:#x}+{size:#x} overlaps the device at {other:#x}")]
    Overlap { base: u64, size: u64, other: u64 },
}

/// A device that owns a window of MMIO space.
///
/// Offsets passed in are relative to the start of the window.
pub trait MmioDevice {
    fn read(&mut self, offset: u64, data: &mut [u8]);

    fn write(&mut self, offset: u64, data: &[u8]);

    /// Run whatever timers are due at `now` and return the next deadline.
    fn tick(&mut self, _now: Instant) -> Option<Instant> {
        None
    }

    /// The machine is going away.
    fn shutdown(&mut self) {}
}

struct Window {
    base: u64,
    end: u64,
    device: Box<dyn MmioDevice>,
}

/// Devices keyed by non-overlapping windows, sorted by base.
#[derive(Default)]
pub struct MmioBus {
    windows: Vec<Window>,
}

impl MmioBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `device` at `base..base + size`.
    ///
    /// # Errors
    ///
    /// Fails if the window is empty, wraps the address space, or overlaps an
    /// existing one.
    pub fn register(
        &mut self,
        base: u64,
        size: u64,
        device: Box<dyn MmioDevice>,
    ) -> Result<(), BusError> {
        let end = match base.checked_add(size) {
            Some(end) if size > 0 => end,
            _ => return Err(BusError::InvalidWindow { base, size }),
        };

        let pos = self.windows.partition_point(|w| w.base < base);
        let clash = [pos.checked_sub(1), Some(pos)]
            .into_iter()
            .flatten()
            .filter_map(|i| self.windows.get(i))
            .find(|w| w.base < end && base < w.end);
        if let Some(other) = clash {
            return Err(BusError::Overlap {
                base,
                size,
                other: other.base,
            });
        }

        self.windows.insert(pos, Window { base, end, device });
        debug!("mmio: window {:#x}-{:#x} registered", base, end);
        Ok(())
    }

    fn lookup(&mut self, addr: u64) -> Option<(&mut dyn MmioDevice, u64)> {
        let pos = self.windows.partition_point(|w| w.base <= addr);
        let window = self.windows.get_mut(pos.checked_sub(1)?)?;
        if addr >= window.end {
            return None;
        }
        Some((window.device.as_mut(), addr - window.base))
    }

    /// Guest read. Unclaimed addresses read as all ones.
    pub fn read(&mut self, addr: u64, data: &mut [u8]) {
        match self.lookup(addr) {
            Some((device, offset)) => device.read(offset, data),
            None => {
                trace!("mmio: read from unmapped {:#x}", addr);
                data.fill(0xff);
            }
        }
    }

    /// Guest write. Unclaimed addresses swallow the write.
    pub fn write(&mut self, addr: u64, data: &[u8]) {
        match self.lookup(addr) {
            Some((device, offset)) => device.write(offset, data),
            None => trace!("mmio: write to unmapped {:#x}", addr),
        }
    }

    /// Tick every device and return the earliest pending deadline.
    pub fn tick(&mut self, now: Instant) -> Option<Instant> {
        self.windows
            .iter_mut()
            .filter_map(|w| w.device.tick(now))
            .min()
    }

    pub fn shutdown(&mut self) {
        for window in &mut self.windows {
            window.device.shutdown();
        }
    }
}
