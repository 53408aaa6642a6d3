//! Device emulation for the VMM.

mod mmio;
pub mod virtio;

pub use mmio::{MmioBus, VIRTIO_MEMSPLIT_IRQ, VIRTIO_MMIO_BASE, VIRTIO_MMIO_SIZE};
pub use virtio::memsplit::VirtioMemsplit;
pub use virtio::transport::VirtioMmioTransport;
