//! Split virtqueue state and ring mechanics.
//!
//! Ring layout in guest memory (virtio 1.1, 2.6):
//!
//! ```text
//! desc_table:  [addr u64 | len u32 | flags u16 | next u16] × size
//! avail_ring:  flags u16 | idx u16 | ring[size] u16 | used_event u16
//! used_ring:   flags u16 | idx u16 | ring[size] {id u32, len u32} | avail_event u16
//! ```
//!
//! Chains popped from the available ring are represented by a move-only
//! [`ChainHead`]. Returning a chain to the guest (`push`) or dropping it
//! without a used element (`detach`) consumes the head, so the same chain
//! cannot be completed twice.

use std::sync::atomic::{fence, Ordering};

use crate::memory::{GuestMemory, MemoryError};
use log::{debug, trace};
use thiserror::Error;

/// Descriptor flag: buffer continues in next descriptor.
pub const VIRTQ_DESC_F_NEXT: u16 = 1;

/// Descriptor flag: buffer is device-writable (vs device-readable).
pub const VIRTQ_DESC_F_WRITE: u16 = 2;

/// Descriptor flag: buffer holds a table of indirect descriptors.
pub const VIRTQ_DESC_F_INDIRECT: u16 = 4;

/// Used ring flag: device does not want QUEUE_NOTIFY kicks.
pub const VIRTQ_USED_F_NO_NOTIFY: u16 = 1;

/// Available ring flag: driver does not want used-buffer interrupts.
pub const VIRTQ_AVAIL_F_NO_INTERRUPT: u16 = 1;

/// Errors raised while walking or updating the rings.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Virtqueue ring access failed: {0}")]
    Memory(#[from] MemoryError),

    #[error("Available index {avail} is more than {size} entries ahead of {last}")]
    AvailOverrun { avail: u16, last: u16, size: u16 },

    #[error("Malformed descriptor chain at head {head}: {reason}")]
    MalformedChain { head: u16, reason: &'static str },
}

/// A virtqueue descriptor.
///
/// Each descriptor points to a buffer in guest memory and optionally
/// chains to another descriptor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtqDesc {
    /// Guest physical address of the buffer.
    pub addr: u64,
    /// Length of the buffer in bytes.
    pub len: u32,
    /// Flags (NEXT, WRITE, INDIRECT).
    pub flags: u16,
    /// Index of next descriptor if NEXT flag is set.
    pub next: u16,
}

impl VirtqDesc {
    /// Size of descriptor in bytes.
    pub const SIZE: usize = 16;

    /// Read a descriptor from guest memory.
    pub fn read_from(memory: &GuestMemory, addr: u64) -> Result<Self, MemoryError> {
        let mut buf = [0u8; Self::SIZE];
        memory.read(addr, &mut buf)?;
        Ok(Self {
            addr: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            flags: u16::from_le_bytes([buf[12], buf[13]]),
            next: u16::from_le_bytes([buf[14], buf[15]]),
        })
    }

    pub fn has_next(&self) -> bool {
        self.flags & VIRTQ_DESC_F_NEXT != 0
    }

    pub fn is_write_only(&self) -> bool {
        self.flags & VIRTQ_DESC_F_WRITE != 0
    }
}

/// Head of a popped descriptor chain.
///
/// Not `Clone`: it is consumed by [`Virtqueue::push`] or
/// [`Virtqueue::detach`].
#[derive(Debug, PartialEq, Eq)]
pub struct ChainHead(u16);

impl ChainHead {
    /// Descriptor table index of the chain head.
    pub fn index(&self) -> u16 {
        self.0
    }
}

/// A descriptor chain popped from the available ring.
#[derive(Debug)]
pub struct DescriptorChain {
    head: ChainHead,
    descs: Vec<VirtqDesc>,
}

impl DescriptorChain {
    pub fn into_parts(self) -> (ChainHead, Vec<VirtqDesc>) {
        (self.head, self.descs)
    }
}

/// Virtqueue state.
///
/// A virtqueue is the communication channel between guest and device.
/// It consists of three parts:
/// - Descriptor table: array of buffer descriptors
/// - Available ring: guest tells device which descriptors are ready
/// - Used ring: device tells guest which descriptors are complete
#[derive(Debug)]
pub struct Virtqueue {
    /// Largest size the driver may configure.
    pub max_size: u16,
    /// Queue size (number of descriptors).
    pub size: u16,
    /// Whether the queue is ready for use.
    pub ready: bool,
    /// Guest physical address of descriptor table.
    pub desc_table: u64,
    /// Guest physical address of available ring.
    pub avail_ring: u64,
    /// Guest physical address of used ring.
    pub used_ring: u64,
    /// Last available index we processed.
    last_avail_idx: u16,
    /// Next used index we will publish.
    next_used_idx: u16,
    /// Whether kicks may be suppressed through the used ring flags.
    notification_suppression: bool,
    /// The available ring could not be trusted; only a reset clears this.
    broken: bool,
}

impl Virtqueue {
    /// Create a new virtqueue with the given maximum size.
    pub fn new(max_size: u16) -> Self {
        Self {
            max_size,
            size: max_size,
            ready: false,
            desc_table: 0,
            avail_ring: 0,
            used_ring: 0,
            last_avail_idx: 0,
            next_used_idx: 0,
            notification_suppression: true,
            broken: false,
        }
    }

    /// Return to the post-allocation state (driver reset).
    pub fn reset(&mut self) {
        *self = Self {
            notification_suppression: self.notification_suppression,
            ..Self::new(self.max_size)
        };
    }

    fn is_configured(&self) -> bool {
        self.ready && self.size > 0
    }

    /// Whether the queue is configured, enabled and not broken.
    pub fn is_usable(&self) -> bool {
        self.is_configured() && !self.broken
    }

    /// Whether the driver must reset the device before the queue works again.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn supports_notification_suppression(&self) -> bool {
        self.notification_suppression
    }

    fn avail_idx(&self, memory: &GuestMemory) -> Result<u16, QueueError> {
        Ok(memory.read_u16(self.avail_ring + 2)?)
    }

    /// Check whether the driver has made chains available that we have not popped.
    pub fn is_empty(&self, memory: &GuestMemory) -> Result<bool, QueueError> {
        if !self.is_usable() {
            return Ok(true);
        }
        Ok(self.avail_idx(memory)? == self.last_avail_idx)
    }

    /// Enable or disable guest kicks by toggling `VIRTQ_USED_F_NO_NOTIFY`.
    pub fn set_notification(&self, memory: &GuestMemory, enable: bool) -> Result<(), QueueError> {
        if !self.is_configured() {
            return Ok(());
        }
        let flags = memory.read_u16(self.used_ring)?;
        let flags = if enable {
            flags & !VIRTQ_USED_F_NO_NOTIFY
        } else {
            flags | VIRTQ_USED_F_NO_NOTIFY
        };
        memory.write_u16(self.used_ring, flags)?;
        if enable {
            // Order the flag update before the caller re-reads avail->idx.
            fence(Ordering::SeqCst);
        }
        Ok(())
    }

    /// Whether the driver wants a used-buffer interrupt right now.
    ///
    /// Ring read failures err on the side of interrupting.
    pub fn needs_interrupt(&self, memory: &GuestMemory) -> bool {
        match memory.read_u16(self.avail_ring) {
            Ok(flags) => flags & VIRTQ_AVAIL_F_NO_INTERRUPT == 0,
            Err(_) => true,
        }
    }

    /// Pop the next descriptor chain from the available ring.
    ///
    /// The available entry is consumed before the chain is validated, so a
    /// malformed chain is dropped rather than retried forever. Failures
    /// before an entry is consumed mark the queue broken; it then stays
    /// empty until [`Virtqueue::reset`].
    ///
    /// # Errors
    ///
    /// `AvailOverrun` if the driver published more entries than the ring
    /// holds, `Memory` if the available ring cannot be read (both break the
    /// queue), `MalformedChain` if the chain references descriptors outside
    /// the table, loops, or uses indirect descriptors.
    pub fn pop(&mut self, memory: &GuestMemory) -> Result<Option<DescriptorChain>, QueueError> {
        if !self.is_usable() {
            return Ok(None);
        }
        match self.next_head(memory) {
            Ok(Some(head)) => {
                let descs = self.walk_chain(memory, head)?;
                trace!(
                    "virtqueue: popped head {} ({} descriptors)",
                    head,
                    descs.len()
                );
                Ok(Some(DescriptorChain {
                    head: ChainHead(head),
                    descs,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.broken = true;
                Err(e)
            }
        }
    }

    /// Consume the next available ring entry and return its head index.
    fn next_head(&mut self, memory: &GuestMemory) -> Result<Option<u16>, QueueError> {
        let avail_idx = self.avail_idx(memory)?;
        let pending = avail_idx.wrapping_sub(self.last_avail_idx);
        if pending == 0 {
            return Ok(None);
        }
        if pending > self.size {
            return Err(QueueError::AvailOverrun {
                avail: avail_idx,
                last: self.last_avail_idx,
                size: self.size,
            });
        }

        // Read ring contents only after observing the index.
        fence(Ordering::Acquire);

        let ring_offset = 4 + (self.last_avail_idx % self.size) as u64 * 2;
        let head = memory.read_u16(self.avail_ring + ring_offset)?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);
        Ok(Some(head))
    }

    fn walk_chain(&self, memory: &GuestMemory, head: u16) -> Result<Vec<VirtqDesc>, QueueError> {
        let malformed = |reason| QueueError::MalformedChain { head, reason };

        let mut descs = Vec::new();
        let mut idx = head;
        loop {
            if idx >= self.size {
                return Err(malformed("descriptor index out of range"));
            }
            if descs.len() >= self.size as usize {
                return Err(malformed("descriptor chain loops"));
            }
            let desc = self.read_desc(memory, idx)?;
            if desc.flags & VIRTQ_DESC_F_INDIRECT != 0 {
                return Err(malformed("indirect descriptors are not negotiated"));
            }
            descs.push(desc);
            if !desc.has_next() {
                return Ok(descs);
            }
            idx = desc.next;
        }
    }

    /// Read a descriptor from the descriptor table.
    pub fn read_desc(&self, memory: &GuestMemory, idx: u16) -> Result<VirtqDesc, QueueError> {
        let desc_addr = self.desc_table + idx as u64 * VirtqDesc::SIZE as u64;
        Ok(VirtqDesc::read_from(memory, desc_addr)?)
    }

    /// Add a completed chain to the used ring.
    ///
    /// # Arguments
    ///
    /// * `memory` - Guest memory
    /// * `head` - Head of the completed chain (consumed)
    /// * `len` - Total bytes written to the guest buffers
    pub fn push(&mut self, memory: &GuestMemory, head: ChainHead, len: u32) -> Result<(), QueueError> {
        // Used ring element: id (4 bytes) + len (4 bytes)
        let ring_offset = 4 + (self.next_used_idx % self.size) as u64 * 8;
        let elem_addr = self.used_ring + ring_offset;

        memory.write_u32(elem_addr, head.0 as u32)?;
        memory.write_u32(elem_addr + 4, len)?;

        // Element must be visible before the index that publishes it.
        fence(Ordering::Release);

        self.next_used_idx = self.next_used_idx.wrapping_add(1);
        memory.write_u16(self.used_ring + 2, self.next_used_idx)?;
        Ok(())
    }

    /// Drop a chain without publishing a used element.
    pub fn detach(&mut self, head: ChainHead) -> u16 {
        debug!("virtqueue: detached chain {} without completion", head.0);
        head.0
    }
}
