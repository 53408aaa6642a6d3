//! Virtio device infrastructure.
//!
//! This module implements the parts of the virtio specification shared by
//! every device: the virtio-mmio register layout, split virtqueues, the
//! interrupt status register, and the capability trait a device implements
//! to be driven by the transport.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Guest                                   │
//! │   ┌─────────────────────────────────────────────────────────┐  │
//! │   │                  virtio Driver                          │  │
//! │   │   - Writes requests to descriptor ring                  │  │
//! │   │   - Updates available ring                              │  │
//! │   │   - Notifies device via MMIO write                      │  │
//! │   └─────────────────────────────────────────────────────────┘  │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            │ Shared Memory (virtqueue)
//! ┌──────────────────────────▼──────────────────────────────────────┐
//! │                         VMM                                     │
//! │   ┌──────────────────────┐    ┌─────────────────────────────┐  │
//! │   │ VirtioMmioTransport  │───►│ VirtioDevice (memsplit)     │  │
//! │   │ - register file      │    │ - realize / unrealize       │  │
//! │   │ - feature handshake  │    │ - handle_queue_notify       │  │
//! │   │ - queue config       │    │ - drains used ring          │  │
//! │   └──────────────────────┘    └─────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reference: <https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.html>

pub mod memsplit;
pub mod queue;
pub mod transport;

pub use queue::Virtqueue;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use log::{trace, warn};

// ============================================================================
// MMIO Register Offsets (virtio-mmio v2)
// ============================================================================

/// Magic value register - always reads as "virt" (0x74726976).
pub const MMIO_MAGIC_VALUE: u64 = 0x000;

/// Version register - we implement version 2.
pub const MMIO_VERSION: u64 = 0x004;

/// Device type ID register.
pub const MMIO_DEVICE_ID: u64 = 0x008;

/// Vendor ID register.
pub const MMIO_VENDOR_ID: u64 = 0x00c;

/// Device features register (read).
pub const MMIO_DEVICE_FEATURES: u64 = 0x010;

/// Device features selection register (write).
pub const MMIO_DEVICE_FEATURES_SEL: u64 = 0x014;

/// Driver features register (write).
pub const MMIO_DRIVER_FEATURES: u64 = 0x020;

/// Driver features selection register (write).
pub const MMIO_DRIVER_FEATURES_SEL: u64 = 0x024;

/// Queue selection register (write).
pub const MMIO_QUEUE_SEL: u64 = 0x030;

/// Maximum queue size register (read).
pub const MMIO_QUEUE_NUM_MAX: u64 = 0x034;

/// Queue size register (write).
pub const MMIO_QUEUE_NUM: u64 = 0x038;

/// Queue ready register (read/write).
pub const MMIO_QUEUE_READY: u64 = 0x044;

/// Queue notify register (write).
pub const MMIO_QUEUE_NOTIFY: u64 = 0x050;

/// Interrupt status register (read).
pub const MMIO_INTERRUPT_STATUS: u64 = 0x060;

/// Interrupt acknowledge register (write).
pub const MMIO_INTERRUPT_ACK: u64 = 0x064;

/// Device status register (read/write).
pub const MMIO_STATUS: u64 = 0x070;

/// Queue descriptor low address register (write).
pub const MMIO_QUEUE_DESC_LOW: u64 = 0x080;

/// Queue descriptor high address register (write).
pub const MMIO_QUEUE_DESC_HIGH: u64 = 0x084;

/// Queue driver (available) low address register (write).
pub const MMIO_QUEUE_DRIVER_LOW: u64 = 0x090;

/// Queue driver (available) high address register (write).
pub const MMIO_QUEUE_DRIVER_HIGH: u64 = 0x094;

/// Queue device (used) low address register (write).
pub const MMIO_QUEUE_DEVICE_LOW: u64 = 0x0a0;

/// Queue device (used) high address register (write).
pub const MMIO_QUEUE_DEVICE_HIGH: u64 = 0x0a4;

/// Configuration atomicity value (read).
pub const MMIO_CONFIG_GENERATION: u64 = 0x0fc;

// ============================================================================
// Magic and Version
// ============================================================================

/// Magic value "virt" (little-endian).
pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;

/// MMIO version we support.
pub const VIRTIO_MMIO_VERSION: u32 = 2;

/// Our vendor ID (arbitrary, not registered).
pub const VIRTIO_VENDOR_ID: u32 = 0x0;

// ============================================================================
// Device Status Flags
// ============================================================================

/// Guest has acknowledged the device.
pub const STATUS_ACKNOWLEDGE: u32 = 1;

/// Guest has loaded a driver.
pub const STATUS_DRIVER: u32 = 2;

/// Driver is ready.
pub const STATUS_DRIVER_OK: u32 = 4;

/// Feature negotiation complete.
pub const STATUS_FEATURES_OK: u32 = 8;

/// Device hit an error it cannot recover from without a reset.
pub const STATUS_DEVICE_NEEDS_RESET: u32 = 64;

/// Driver gave up on the device.
pub const STATUS_FAILED: u32 = 128;

// ============================================================================
// Features and Interrupts
// ============================================================================

/// VIRTIO_F_VERSION_1 - Required for virtio-mmio v2 devices.
pub const VIRTIO_F_VERSION_1: u64 = 1 << 32;

/// Interrupt status bit: a used buffer was published.
pub const VIRTIO_MMIO_INT_VRING: u32 = 1 << 0;

/// Interrupt status bit: device configuration changed.
pub const VIRTIO_MMIO_INT_CONFIG: u32 = 1 << 1;

/// Why the device is interrupting the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptKind {
    /// Used buffers are available on the given queue.
    Queue(u16),
    /// Configuration change (also used as a liveness heartbeat).
    ConfigChange,
}

impl InterruptKind {
    fn status_bit(self) -> u32 {
        match self {
            InterruptKind::Queue(_) => VIRTIO_MMIO_INT_VRING,
            InterruptKind::ConfigChange => VIRTIO_MMIO_INT_CONFIG,
        }
    }
}

/// Something that can raise the device's interrupt line.
pub trait IrqTrigger: Send + Sync {
    fn trigger(&self) -> std::io::Result<()>;
}

/// Interrupt status register shared by the transport and the device.
///
/// The device sets status bits and fires the trigger; the transport
/// exposes the bits through `InterruptStatus` and clears them on
/// `InterruptACK`.
pub struct Interrupt {
    status: AtomicU32,
    raised: AtomicU64,
    trigger: Option<Box<dyn IrqTrigger>>,
}

impl Interrupt {
    /// Create an interrupt register. Without a trigger, interrupts only
    /// show up in the status register.
    pub fn new(trigger: Option<Box<dyn IrqTrigger>>) -> Self {
        Self {
            status: AtomicU32::new(0),
            raised: AtomicU64::new(0),
            trigger,
        }
    }

    /// Latch the status bit for `kind` and fire the trigger.
    pub fn signal(&self, kind: InterruptKind) {
        self.status.fetch_or(kind.status_bit(), Ordering::SeqCst);
        self.raised.fetch_add(1, Ordering::Relaxed);
        trace!("interrupt: {:?}", kind);
        if let Some(trigger) = &self.trigger {
            if let Err(e) = trigger.trigger() {
                warn!("Failed to raise interrupt for {:?}: {}", kind, e);
            }
        }
    }

    pub fn status(&self) -> u32 {
        self.status.load(Ordering::SeqCst)
    }

    /// Clear the acknowledged bits.
    pub fn ack(&self, bits: u32) {
        self.status.fetch_and(!bits, Ordering::SeqCst);
    }

    /// Total interrupts raised since creation.
    pub fn raised(&self) -> u64 {
        self.raised.load(Ordering::Relaxed)
    }
}

/// Capability interface between the transport and a virtio device.
///
/// The transport owns the register file and the feature handshake; the
/// device owns its queues and decides what a queue notification means.
pub trait VirtioDevice {
    type Error: std::error::Error;

    /// Virtio device type ID.
    fn device_type(&self) -> u32;

    /// Largest queue size the driver may configure.
    fn queue_max_size(&self) -> u16;

    /// Filter the feature bits the transport offers.
    fn get_features(&self, offered: u64) -> u64;

    /// Acquire the device's resources. Called once before the device is
    /// exposed to the guest.
    fn realize(&mut self) -> Result<(), Self::Error>;

    /// Release everything `realize` acquired.
    fn unrealize(&mut self);

    fn queue(&self, index: u32) -> Option<&Virtqueue>;

    fn queue_mut(&mut self, index: u32) -> Option<&mut Virtqueue>;

    /// The driver wrote `index` to QueueNotify.
    fn handle_queue_notify(&mut self, index: u16);

    /// The driver wrote 0 to the status register.
    fn reset(&mut self);

    /// Whether the device can only continue after a reset.
    fn needs_reset(&self) -> bool {
        false
    }

    /// Run timers due at `now`. Returns the next deadline, if any.
    fn tick(&mut self, _now: Instant) -> Option<Instant> {
        None
    }
}
