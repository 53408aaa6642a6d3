//! KVM (Kernel-based Virtual Machine) wrapper module.
//!
//! The memsplit VMM uses KVM for two things: registering guest RAM as memory
//! slots, so the host virtual ranges the device reports are the ones KVM
//! maps into the guest, and delivering the device's interrupt through the
//! in-kernel IRQ chip.
//!
//! ```text
//! User Space (VMM)                    Kernel Space (KVM)
//! ┌──────────────┐                   ┌──────────────────┐
//! │  memsplit    │                   │   KVM Module     │
//! │   (VMM)      │    ioctl()        │  ┌────────────┐  │
//! │  VmFd ───────┼──────────────────►│  │ VM State   │  │
//! │  IrqLine ────┼──────────────────►│  │ PIC/IOAPIC │  │
//! └──────────────┘                   │  └────────────┘  │
//!                                    └──────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! let vm = Arc::new(kvm::create_vm()?);
//! unsafe { vm.register_memory(&memory)? };
//! let irq = IrqLine::new(vm.clone(), VIRTIO_MEMSPLIT_IRQ);
//! ```

mod vm;

pub use vm::{IrqLine, VmFd};

use kvm_ioctls::Kvm;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KvmError {
    /// `/dev/kvm` is missing, not accessible, or nested virtualization is off.
    #[error("Cannot open /dev/kvm: {0}")]
    OpenKvm(#[source] kvm_ioctls::Error),

    #[error("KVM_CREATE_VM failed: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("KVM_SET_USER_MEMORY_REGION failed for slot {slot}: {source}")]
    SetMemoryRegion {
        slot: u32,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("KVM_SET_TSS_ADDR failed: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    #[error("KVM_CREATE_IRQCHIP failed: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    #[error("KVM_IRQ_LINE failed for GSI {gsi}: {source}")]
    IrqLine {
        gsi: u32,
        #[source]
        source: kvm_ioctls::Error,
    },
}

/// Create a VM with an in-kernel IRQ chip and no vCPUs.
///
/// # Errors
///
/// Returns an error if KVM is not available or the VM cannot be set up.
pub fn create_vm() -> Result<VmFd, KvmError> {
    let kvm = Kvm::new().map_err(KvmError::OpenKvm)?;
    let vm = kvm.create_vm().map_err(KvmError::CreateVm)?;
    VmFd::new(vm)
}
