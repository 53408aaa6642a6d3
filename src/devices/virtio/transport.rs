//! virtio-mmio transport.
//!
//! Owns the register file of one virtio-mmio device (feature selection,
//! queue configuration, status, interrupt status/ack) and forwards the
//! device-specific events to a [`VirtioDevice`].

use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};

use super::{
    Interrupt, VirtioDevice, MMIO_CONFIG_GENERATION, MMIO_DEVICE_FEATURES,
    MMIO_DEVICE_FEATURES_SEL, MMIO_DEVICE_ID, MMIO_DRIVER_FEATURES, MMIO_DRIVER_FEATURES_SEL,
    MMIO_INTERRUPT_ACK, MMIO_INTERRUPT_STATUS, MMIO_MAGIC_VALUE, MMIO_QUEUE_DESC_HIGH,
    MMIO_QUEUE_DESC_LOW, MMIO_QUEUE_DEVICE_HIGH, MMIO_QUEUE_DEVICE_LOW, MMIO_QUEUE_DRIVER_HIGH,
    MMIO_QUEUE_DRIVER_LOW, MMIO_QUEUE_NOTIFY, MMIO_QUEUE_NUM, MMIO_QUEUE_NUM_MAX,
    MMIO_QUEUE_READY, MMIO_QUEUE_SEL, MMIO_STATUS, MMIO_VENDOR_ID, MMIO_VERSION,
    STATUS_ACKNOWLEDGE, STATUS_DEVICE_NEEDS_RESET, STATUS_DRIVER, STATUS_DRIVER_OK,
    STATUS_FAILED, STATUS_FEATURES_OK, VIRTIO_F_VERSION_1, VIRTIO_MMIO_MAGIC,
    VIRTIO_MMIO_VERSION, VIRTIO_VENDOR_ID,
};
use crate::devices::mmio::MmioDevice;

/// Feature bits the transport itself offers.
pub const TRANSPORT_FEATURES: u64 = VIRTIO_F_VERSION_1;

fn set_low(reg: &mut u64, value: u32) {
    *reg = (*reg & 0xFFFF_FFFF_0000_0000) | value as u64;
}

fn set_high(reg: &mut u64, value: u32) {
    *reg = (*reg & 0x0000_0000_FFFF_FFFF) | ((value as u64) << 32);
}

/// virtio-mmio transport state for one device.
pub struct VirtioMmioTransport<D: VirtioDevice> {
    /// The device behind this transport.
    device: D,
    /// Interrupt status shared with the device.
    interrupt: Arc<Interrupt>,

    /// Device features selection register.
    device_features_sel: u32,
    /// Driver features selection register.
    driver_features_sel: u32,
    /// Features acknowledged by the driver.
    driver_features: u64,

    /// Device status.
    status: u32,
    /// Queue selection register.
    queue_sel: u32,
}

impl<D: VirtioDevice> VirtioMmioTransport<D> {
    /// Realize `device` and put it behind a fresh register file.
    ///
    /// # Errors
    ///
    /// Returns the device's realize error; the device is dropped.
    pub fn realize(mut device: D, interrupt: Arc<Interrupt>) -> Result<Self, D::Error> {
        device.realize()?;
        Ok(Self {
            device,
            interrupt,
            device_features_sel: 0,
            driver_features_sel: 0,
            driver_features: 0,
            status: 0,
            queue_sel: 0,
        })
    }

    fn device_features(&self) -> u64 {
        self.device.get_features(TRANSPORT_FEATURES)
    }

    /// Read a 32-bit register value.
    fn read_register(&self, offset: u64) -> u32 {
        match offset {
            MMIO_MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            MMIO_VERSION => VIRTIO_MMIO_VERSION,
            MMIO_DEVICE_ID => self.device.device_type(),
            MMIO_VENDOR_ID => VIRTIO_VENDOR_ID,
            MMIO_DEVICE_FEATURES => match self.device_features_sel {
                0 => self.device_features() as u32,
                1 => (self.device_features() >> 32) as u32,
                _ => 0,
            },
            MMIO_QUEUE_NUM_MAX => match self.device.queue(self.queue_sel) {
                Some(_) => self.device.queue_max_size() as u32,
                None => 0,
            },
            MMIO_QUEUE_READY => self
                .device
                .queue(self.queue_sel)
                .map_or(0, |q| q.ready as u32),
            MMIO_INTERRUPT_STATUS => self.interrupt.status(),
            MMIO_STATUS => {
                if self.status != 0 && self.device.needs_reset() {
                    self.status | STATUS_DEVICE_NEEDS_RESET
                } else {
                    self.status
                }
            }
            MMIO_CONFIG_GENERATION => 0,
            _ => {
                debug!("virtio-mmio: unhandled register read {:#x}", offset);
                0
            }
        }
    }

    /// Write a 32-bit register value.
    fn write_register(&mut self, offset: u64, value: u32) {
        match offset {
            MMIO_DEVICE_FEATURES_SEL => self.device_features_sel = value,
            MMIO_DRIVER_FEATURES_SEL => self.driver_features_sel = value,
            MMIO_DRIVER_FEATURES => match self.driver_features_sel {
                0 => set_low(&mut self.driver_features, value),
                1 => set_high(&mut self.driver_features, value),
                _ => warn!(
                    "virtio-mmio: driver features write to page {}",
                    self.driver_features_sel
                ),
            },
            MMIO_QUEUE_SEL => self.queue_sel = value,
            MMIO_QUEUE_NOTIFY => {
                // Guest is notifying us that there are descriptors to process
                self.device.handle_queue_notify(value as u16);
            }
            MMIO_INTERRUPT_ACK => self.interrupt.ack(value),
            MMIO_STATUS => self.write_status(value),
            MMIO_QUEUE_NUM
            | MMIO_QUEUE_READY
            | MMIO_QUEUE_DESC_LOW
            | MMIO_QUEUE_DESC_HIGH
            | MMIO_QUEUE_DRIVER_LOW
            | MMIO_QUEUE_DRIVER_HIGH
            | MMIO_QUEUE_DEVICE_LOW
            | MMIO_QUEUE_DEVICE_HIGH => self.write_queue_register(offset, value),
            _ => {
                debug!(
                    "virtio-mmio: unhandled register write {:#x} = {:#x}",
                    offset, value
                );
            }
        }
    }

    fn write_queue_register(&mut self, offset: u64, value: u32) {
        let queue_sel = self.queue_sel;
        let Some(queue) = self.device.queue_mut(queue_sel) else {
            warn!(
                "virtio-mmio: write {:#x} to unavailable queue {}",
                offset, queue_sel
            );
            return;
        };

        match offset {
            MMIO_QUEUE_NUM => {
                // Split rings must be a power of two.
                if value.is_power_of_two() && value <= queue.max_size as u32 {
                    queue.size = value as u16;
                } else {
                    warn!("virtio-mmio: rejected queue size {}", value);
                }
            }
            MMIO_QUEUE_READY => {
                queue.ready = value != 0;
                if queue.ready {
                    info!(
                        "virtio-mmio: queue {} ready: size={} desc={:#x} avail={:#x} used={:#x}",
                        queue_sel, queue.size, queue.desc_table, queue.avail_ring, queue.used_ring
                    );
                }
            }
            MMIO_QUEUE_DESC_LOW => set_low(&mut queue.desc_table, value),
            MMIO_QUEUE_DESC_HIGH => set_high(&mut queue.desc_table, value),
            MMIO_QUEUE_DRIVER_LOW => set_low(&mut queue.avail_ring, value),
            MMIO_QUEUE_DRIVER_HIGH => set_high(&mut queue.avail_ring, value),
            MMIO_QUEUE_DEVICE_LOW => set_low(&mut queue.used_ring, value),
            MMIO_QUEUE_DEVICE_HIGH => set_high(&mut queue.used_ring, value),
            _ => {}
        }
    }

    fn write_status(&mut self, value: u32) {
        if value == 0 {
            self.status = 0;
            self.driver_features = 0;
            self.device_features_sel = 0;
            self.driver_features_sel = 0;
            self.queue_sel = 0;
            self.interrupt.ack(u32::MAX);
            self.device.reset();
            info!("virtio-mmio: device reset");
            return;
        }

        let mut value = value;
        let newly_set = value & !self.status;
        if newly_set & STATUS_FEATURES_OK != 0 {
            let unoffered = self.driver_features & !self.device_features();
            if unoffered != 0 {
                warn!(
                    "virtio-mmio: driver acked unoffered features {:#x}; refusing FEATURES_OK",
                    unoffered
                );
                value &= !STATUS_FEATURES_OK;
            }
        }
        self.status = value;

        // Log status transitions
        let mut flags = Vec::new();
        if value & STATUS_ACKNOWLEDGE != 0 {
            flags.push("ACK");
        }
        if value & STATUS_DRIVER != 0 {
            flags.push("DRIVER");
        }
        if value & STATUS_FEATURES_OK != 0 {
            flags.push("FEATURES_OK");
        }
        if value & STATUS_DRIVER_OK != 0 {
            flags.push("DRIVER_OK");
        }
        if value & STATUS_FAILED != 0 {
            flags.push("FAILED");
        }
        info!("virtio-mmio: status {} ({:#x})", flags.join("|"), value);
    }
}

impl<D: VirtioDevice> MmioDevice for VirtioMmioTransport<D> {
    fn read(&mut self, offset: u64, data: &mut [u8]) {
        let value = self.read_register(offset & !0x3); // Align to 4 bytes
        let bytes = value.to_le_bytes();

        // Handle sub-word reads
        let start = (offset & 0x3) as usize;
        let len = data.len().min(4 - start);
        data[..len].copy_from_slice(&bytes[start..start + len]);
    }

    fn write(&mut self, offset: u64, data: &[u8]) {
        // Only handle 4-byte aligned writes
        if data.len() != 4 || offset & 0x3 != 0 {
            warn!(
                "virtio-mmio: non-aligned write: offset={:#x} len={}",
                offset,
                data.len()
            );
            return;
        }

        let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        self.write_register(offset, value);
    }

    fn tick(&mut self, now: Instant) -> Option<Instant> {
        self.device.tick(now)
    }

    fn shutdown(&mut self) {
        self.device.unrealize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::{Virtqueue, VIRTIO_MMIO_INT_VRING, InterruptKind};

    /// Minimal device recording what the transport asks of it.
    struct MockDevice {
        realized: bool,
        queue: Option<Virtqueue>,
        notifies: Vec<u16>,
        resets: usize,
        wedged: bool,
    }

    impl MockDevice {
        fn new() -> Self {
            Self {
                realized: false,
                queue: None,
                notifies: Vec::new(),
                resets: 0,
                wedged: false,
            }
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("mock realize failure")]
    struct MockError;

    impl VirtioDevice for MockDevice {
        type Error = MockError;

        fn device_type(&self) -> u32 {
            42
        }

        fn queue_max_size(&self) -> u16 {
            8
        }

        fn get_features(&self, offered: u64) -> u64 {
            offered
        }

        fn realize(&mut self) -> Result<(), MockError> {
            self.realized = true;
            self.queue = Some(Virtqueue::new(8));
            Ok(())
        }

        fn unrealize(&mut self) {
            self.realized = false;
            self.queue = None;
        }

        fn queue(&self, index: u32) -> Option<&Virtqueue> {
            if index == 0 {
                self.queue.as_ref()
            } else {
                None
            }
        }

        fn queue_mut(&mut self, index: u32) -> Option<&mut Virtqueue> {
            if index == 0 {
                self.queue.as_mut()
            } else {
                None
            }
        }

        fn handle_queue_notify(&mut self, index: u16) {
            self.notifies.push(index);
        }

        fn reset(&mut self) {
            self.resets += 1;
            self.wedged = false;
            if let Some(queue) = self.queue.as_mut() {
                queue.reset();
            }
        }

        fn needs_reset(&self) -> bool {
            self.wedged
        }
    }

    fn transport() -> VirtioMmioTransport<MockDevice> {
        VirtioMmioTransport::realize(MockDevice::new(), Arc::new(Interrupt::new(None))).unwrap()
    }

    fn read32(t: &mut VirtioMmioTransport<MockDevice>, offset: u64) -> u32 {
        let mut data = [0u8; 4];
        t.read(offset, &mut data);
        u32::from_le_bytes(data)
    }

    fn write32(t: &mut VirtioMmioTransport<MockDevice>, offset: u64, value: u32) {
        t.write(offset, &value.to_le_bytes());
    }

    #[test]
    fn test_identity_registers() {
        let mut t = transport();
        assert!(t.device.realized);
        assert_eq!(read32(&mut t, MMIO_MAGIC_VALUE), VIRTIO_MMIO_MAGIC);
        assert_eq!(read32(&mut t, MMIO_VERSION), 2);
        assert_eq!(read32(&mut t, MMIO_DEVICE_ID), 42);
        assert_eq!(read32(&mut t, MMIO_QUEUE_NUM_MAX), 8);

        // Sub-word read of the magic value.
        let mut byte = [0u8; 1];
        t.read(MMIO_MAGIC_VALUE + 1, &mut byte);
        assert_eq!(byte[0], b'i');
    }

    #[test]
    fn test_feature_pages() {
        let mut t = transport();
        write32(&mut t, MMIO_DEVICE_FEATURES_SEL, 0);
        assert_eq!(read32(&mut t, MMIO_DEVICE_FEATURES), 0);
        write32(&mut t, MMIO_DEVICE_FEATURES_SEL, 1);
        assert_eq!(read32(&mut t, MMIO_DEVICE_FEATURES), 1); // VERSION_1
    }

    #[test]
    fn test_features_ok_accepts_offered_bits() {
        let mut t = transport();
        write32(&mut t, MMIO_DRIVER_FEATURES_SEL, 1);
        write32(&mut t, MMIO_DRIVER_FEATURES, 1);
        write32(
            &mut t,
            MMIO_STATUS,
            STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK,
        );
        assert_eq!(t.driver_features, VIRTIO_F_VERSION_1);
        assert_ne!(read32(&mut t, MMIO_STATUS) & STATUS_FEATURES_OK, 0);
    }

    #[test]
    fn test_features_ok_refused_for_unoffered_bits() {
        let mut t = transport();
        write32(&mut t, MMIO_DRIVER_FEATURES_SEL, 0);
        write32(&mut t, MMIO_DRIVER_FEATURES, 1 << 5);
        write32(
            &mut t,
            MMIO_STATUS,
            STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK,
        );
        assert_eq!(read32(&mut t, MMIO_STATUS) & STATUS_FEATURES_OK, 0);
    }

    #[test]
    fn test_queue_configuration_reaches_device() {
        let mut t = transport();
        write32(&mut t, MMIO_QUEUE_SEL, 0);
        write32(&mut t, MMIO_QUEUE_NUM, 4);
        write32(&mut t, MMIO_QUEUE_DESC_LOW, 0x1000);
        write32(&mut t, MMIO_QUEUE_DESC_HIGH, 0x1);
        write32(&mut t, MMIO_QUEUE_DRIVER_LOW, 0x2000);
        write32(&mut t, MMIO_QUEUE_DEVICE_LOW, 0x3000);
        write32(&mut t, MMIO_QUEUE_READY, 1);

        let queue = t.device.queue(0).unwrap();
        assert_eq!(queue.size, 4);
        assert_eq!(queue.desc_table, 0x1_0000_1000);
        assert_eq!(queue.avail_ring, 0x2000);
        assert_eq!(queue.used_ring, 0x3000);
        assert!(queue.ready);
        assert_eq!(read32(&mut t, MMIO_QUEUE_READY), 1);

        // Oversized, empty and non-power-of-two sizes are rejected.
        for bad in [16, 0, 3, 6] {
            write32(&mut t, MMIO_QUEUE_NUM, bad);
            assert_eq!(t.device.queue(0).unwrap().size, 4, "size {}", bad);
        }
        write32(&mut t, MMIO_QUEUE_NUM, 8);
        assert_eq!(t.device.queue(0).unwrap().size, 8);

        // Queue 1 does not exist.
        write32(&mut t, MMIO_QUEUE_SEL, 1);
        assert_eq!(read32(&mut t, MMIO_QUEUE_NUM_MAX), 0);
        write32(&mut t, MMIO_QUEUE_READY, 1);
    }

    #[test]
    fn test_notify_and_reset() {
        let mut t = transport();
        write32(&mut t, MMIO_QUEUE_NOTIFY, 0);
        assert_eq!(t.device.notifies, vec![0]);

        write32(&mut t, MMIO_QUEUE_READY, 1);
        t.interrupt.signal(InterruptKind::Queue(0));
        assert_eq!(read32(&mut t, MMIO_INTERRUPT_STATUS), VIRTIO_MMIO_INT_VRING);
        write32(&mut t, MMIO_INTERRUPT_ACK, VIRTIO_MMIO_INT_VRING);
        assert_eq!(read32(&mut t, MMIO_INTERRUPT_STATUS), 0);

        t.interrupt.signal(InterruptKind::Queue(0));
        write32(&mut t, MMIO_STATUS, 0);
        assert_eq!(t.device.resets, 1);
        assert!(!t.device.queue(0).unwrap().ready);
        assert_eq!(read32(&mut t, MMIO_INTERRUPT_STATUS), 0);
    }

    #[test]
    fn test_needs_reset_reported_until_reset() {
        let mut t = transport();
        let status = STATUS_ACKNOWLEDGE | STATUS_DRIVER | STATUS_FEATURES_OK | STATUS_DRIVER_OK;
        write32(&mut t, MMIO_STATUS, status);
        assert_eq!(read32(&mut t, MMIO_STATUS), status);

        t.device.wedged = true;
        assert_eq!(
            read32(&mut t, MMIO_STATUS),
            status | STATUS_DEVICE_NEEDS_RESET
        );

        write32(&mut t, MMIO_STATUS, 0);
        assert_eq!(read32(&mut t, MMIO_STATUS), 0);
        write32(&mut t, MMIO_STATUS, STATUS_ACKNOWLEDGE);
        assert_eq!(read32(&mut t, MMIO_STATUS), STATUS_ACKNOWLEDGE);
    }

    #[test]
    fn test_shutdown_unrealizes() {
        let mut t = transport();
        t.shutdown();
        assert!(!t.device.realized);
        assert_eq!(read32(&mut t, MMIO_QUEUE_NUM_MAX), 0);
    }

    #[test]
    fn test_unaligned_write_ignored() {
        let mut t = transport();
        t.write(MMIO_QUEUE_NOTIFY, &[0, 0]);
        assert!(t.device.notifies.is_empty());
    }
}
