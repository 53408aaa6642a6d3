//! Virtual Machine creation, memory slots and interrupt lines.
//!
//! # IRQ Chip (Interrupt Controllers)
//!
//! x86 PCs use two types of interrupt controllers:
//!
//! - **PIC** (8259A): Legacy Programmable Interrupt Controller, handles IRQ 0-15
//! - **IOAPIC**: Modern interrupt controller for PCI devices, IRQ routing
//!
//! KVM emulates both in-kernel. The virtio-mmio device sits on a legacy IRQ
//! line which we pulse (assert, then deassert) for every interrupt.
//!
//! # Memory Regions
//!
//! Guest memory is managed through "memory slots". Each slot maps a range of
//! guest physical addresses to host virtual addresses:
//!
//! ```text
//! Guest Physical          Host Virtual
//! ┌──────────────┐       ┌──────────────┐
//! │ ram-below-4g │ ────► │ mmap'd region│  slot 0
//! ├──────────────┤       └──────────────┘
//! │ hole         │
//! ├──────────────┤       ┌──────────────┐
//! │ ram-above-4g │ ────► │ mmap'd region│  slot 1
//! └──────────────┘       └──────────────┘
//! ```

use std::sync::Arc;

use kvm_bindings::kvm_userspace_memory_region;
use log::info;

use super::KvmError;
use crate::devices::virtio::IrqTrigger;
use crate::memory::GuestMemory;

/// TSS address in the hole below 4 GiB (required by Intel VT-x).
const TSS_ADDRESS: usize = 0xfffb_d000;

/// A VM used only as a memory consumer and interrupt sink.
pub struct VmFd {
    vm: kvm_ioctls::VmFd,
}

impl VmFd {
    /// Set the TSS address and create the in-kernel PIC and IOAPIC.
    pub fn new(vm: kvm_ioctls::VmFd) -> Result<Self, KvmError> {
        // The TSS address must be set before the IRQ chip on Intel hosts.
        vm.set_tss_address(TSS_ADDRESS)
            .map_err(KvmError::SetTssAddress)?;

        vm.create_irq_chip().map_err(KvmError::CreateIrqChip)?;

        Ok(Self { vm })
    }

    /// Map `memory_size` bytes at host address `userspace_addr` into the
    /// guest at `guest_addr`, using memory slot `slot`.
    ///
    /// # Safety
    ///
    /// The host range must stay mapped for the lifetime of the VM and must
    /// not overlap another registered slot.
    pub unsafe fn set_user_memory_region(
        &self,
        slot: u32,
        guest_addr: u64,
        memory_size: u64,
        userspace_addr: u64,
    ) -> Result<(), KvmError> {
        let region = kvm_userspace_memory_region {
            slot,
            guest_phys_addr: guest_addr,
            memory_size,
            userspace_addr,
            flags: 0,
        };

        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(|source| KvmError::SetMemoryRegion { slot, source })
        }
    }

    /// Register every RAM region of `memory`, one slot each.
    ///
    /// # Safety
    ///
    /// `memory` must outlive the VM.
    pub unsafe fn register_memory(&self, memory: &GuestMemory) -> Result<(), KvmError> {
        for (slot, (guest_addr, size, host_addr)) in memory.as_raw_regions().into_iter().enumerate()
        {
            unsafe { self.set_user_memory_region(slot as u32, guest_addr, size, host_addr)? };
            info!(
                "kvm: slot {} gpa {:#x} size {:#x} -> hva {:#x}",
                slot, guest_addr, size, host_addr
            );
        }
        Ok(())
    }

    /// Assert or deassert an IRQ line.
    pub fn set_irq_line(&self, gsi: u32, level: bool) -> Result<(), KvmError> {
        self.vm
            .set_irq_line(gsi, level)
            .map_err(|source| KvmError::IrqLine { gsi, source })
    }
}

/// Edge-triggered interrupt line on the in-kernel IRQ chip.
pub struct IrqLine {
    vm: Arc<VmFd>,
    gsi: u32,
}

impl IrqLine {
    pub fn new(vm: Arc<VmFd>, gsi: u32) -> Self {
        Self { vm, gsi }
    }
}

impl IrqTrigger for IrqLine {
    fn trigger(&self) -> std::io::Result<()> {
        self.vm
            .set_irq_line(self.gsi, true)
            .and_then(|()| self.vm.set_irq_line(self.gsi, false))
            .map_err(std::io::Error::other)
    }
}
