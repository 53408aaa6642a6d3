//! Guest physical memory management using vm-memory crate.
//!
//! This module wraps `vm_memory::GuestMemoryMmap` to provide guest RAM for
//! the virtual machine, laid out the way a PC machine model lays it out:
//! one region starting at guest physical address 0 and, when the guest has
//! more memory than fits below the 32-bit PCI hole, a second region starting
//! at 4 GiB.
//!
//! # Address Spaces
//!
//! - **Guest physical addresses (GPA)**: What the guest kernel sees as physical RAM
//! - **Host virtual addresses (HVA)**: Where the VMM (us) sees the same bytes
//! - **Host physical addresses (HPA)**: The host frames backing those pages
//!
//! ```text
//! Guest Virtual → Guest Physical → Host Virtual → Host Physical
//!     (kernel)       (GPA)         (vm-memory)      (pagemap)
//! ```
//!
//! # Memory Layout
//!
//! ```text
//! 0x0000_0000 ┌──────────────────┐
//!             │ ram-below-4g     │ ← min(size, below_4g_limit)
//! limit       ├──────────────────┤
//!             │ hole (MMIO)      │ ← virtio-mmio window lives here
//! 0x1_0000_0000├─────────────────┤
//!             │ ram-above-4g     │ ← size - below_4g_limit (if any)
//!             └──────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let memory = GuestMemory::new(MemoryLayout::new(512 * 1024 * 1024))?;
//!
//! memory.write(0x7000, &[1, 2, 3, 4])?;
//! memory.write_u32(0x10_0000, 0xDEADBEEF)?;
//!
//! // Authoritative map of RAM subregions, with host base pointers
//! let map = memory.memory_map()?;
//! ```

mod map;

pub use map::{MemoryMap, Subregion, SubregionKind};

use thiserror::Error;
use vm_memory::{
    Bytes, GuestAddress, GuestMemory as GuestMemoryTrait, GuestMemoryMmap, GuestMemoryRegion,
};

/// Start of the guest physical range used for RAM above the 32-bit hole.
pub const FOUR_GIB: u64 = 1 << 32;

/// Name of the RAM region that starts at guest physical address 0.
pub const RAM_BELOW_4G: &str = "ram-below-4g";

/// Name of the RAM region that starts at 4 GiB.
pub const RAM_ABOVE_4G: &str = "ram-above-4g";

/// Granularity every region size and boundary must be aligned to.
pub const GUEST_PAGE_SIZE: u64 = 0x1000;

/// Default end of low RAM (3 GiB), leaving a 1 GiB hole for MMIO.
pub const DEFAULT_BELOW_4G_LIMIT: u64 = 3 << 30;

/// Errors that can occur while allocating or accessing guest memory.
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to allocate guest memory: {0}")]
    Allocation(#[source] std::io::Error),

    #[error("Invalid memory layout: {0}")]
    InvalidLayout(String),

    #[error("Guest memory access of {len} bytes at {addr:#x} failed: {reason}")]
    Access {
        addr: u64,
        len: usize,
        reason: String,
    },

    #[error("Subregion {name} at {base:#x} overlaps {other}")]
    Overlap {
        name: String,
        base: u64,
        other: String,
    },
}

/// How guest RAM is split around the 32-bit hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryLayout {
    /// Total guest RAM in bytes.
    pub size: u64,
    /// RAM below this guest physical address starts at 0; the rest moves to 4 GiB.
    pub below_4g_limit: u64,
}

impl MemoryLayout {
    /// Layout with the default 3 GiB low RAM limit.
    pub fn new(size: u64) -> Self {
        Self {
            size,
            below_4g_limit: DEFAULT_BELOW_4G_LIMIT,
        }
    }

    /// Compute the named `(name, base, size)` ranges for this layout.
    ///
    /// # Errors
    ///
    /// Returns `InvalidLayout` if the size or limit is zero, unaligned, or
    /// the limit lies above 4 GiB.
    pub fn ranges(&self) -> Result<Vec<(&'static str, GuestAddress, u64)>, MemoryError> {
        if self.size == 0 || self.size % GUEST_PAGE_SIZE != 0 {
            return Err(MemoryError::InvalidLayout(format!(
                "size {:#x} must be a non-zero multiple of {:#x}",
                self.size, GUEST_PAGE_SIZE
            )));
        }
        if self.below_4g_limit == 0
            || self.below_4g_limit > FOUR_GIB
            || self.below_4g_limit % GUEST_PAGE_SIZE != 0
        {
            return Err(MemoryError::InvalidLayout(format!(
                "below-4g limit {:#x} must be page aligned and within (0, 4 GiB]",
                self.below_4g_limit
            )));
        }

        let below = self.size.min(self.below_4g_limit);
        let mut ranges = vec![(RAM_BELOW_4G, GuestAddress(0), below)];

        let above = self.size - below;
        if above > 0 {
            ranges.push((RAM_ABOVE_4G, GuestAddress(FOUR_GIB), above));
        }
        Ok(ranges)
    }
}

/// Guest physical memory backed by vm-memory.
///
/// The underlying memory is allocated using anonymous private mmap
/// regions, one per entry in the layout.
pub struct GuestMemory {
    /// The underlying vm-memory guest memory.
    inner: GuestMemoryMmap,
    /// Named ranges this memory was allocated from.
    ranges: Vec<(&'static str, GuestAddress, u64)>,
}

impl GuestMemory {
    /// Allocate guest RAM according to `layout`.
    ///
    /// # Errors
    ///
    /// Returns an error if the layout is invalid or the mmap fails.
    pub fn new(layout: MemoryLayout) -> Result<Self, MemoryError> {
        let ranges = layout.ranges()?;
        let mmap_ranges: Vec<(GuestAddress, usize)> = ranges
            .iter()
            .map(|&(_, base, size)| (base, size as usize))
            .collect();

        let inner = GuestMemoryMmap::from_ranges(&mmap_ranges).map_err(|e| {
            MemoryError::Allocation(std::io::Error::other(format!(
                "Failed to create guest memory: {}",
                e
            )))
        })?;

        Ok(Self { inner, ranges })
    }

    /// Total bytes of guest RAM.
    pub fn size(&self) -> u64 {
        self.ranges.iter().map(|&(_, _, size)| size).sum()
    }

    /// Raw `(guest_addr, size, host_addr)` triples for every RAM region.
    ///
    /// Used for KVM memory slot registration. The host addresses are valid
    /// only while this `GuestMemory` exists.
    pub fn as_raw_regions(&self) -> Vec<(u64, u64, u64)> {
        self.inner
            .iter()
            .map(|region| {
                (
                    region.start_addr().0,
                    region.len(),
                    region.as_ptr() as u64,
                )
            })
            .collect()
    }

    /// Build the authoritative memory map for this guest's RAM.
    ///
    /// Every allocated range becomes a `Ram` subregion carrying its host
    /// base pointer. Callers add MMIO and ROM subregions on top.
    pub fn memory_map(&self) -> Result<MemoryMap, MemoryError> {
        let mut map = MemoryMap::new();
        for &(name, base, size) in &self.ranges {
            let region = self
                .inner
                .iter()
                .find(|region| region.start_addr() == base)
                .ok_or_else(|| {
                    MemoryError::InvalidLayout(format!("no mapping backs {} at {:#x}", name, base.0))
                })?;
            map.add(Subregion::ram(name, base.0, size, region.as_ptr() as u64))?;
        }
        Ok(map)
    }

    /// Write bytes at a guest physical address.
    ///
    /// # Errors
    ///
    /// Returns an error if the write would leave guest RAM.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|e| MemoryError::Access {
                addr,
                len: data.len(),
                reason: e.to_string(),
            })
    }

    /// Write a 16-bit value at a guest physical address (little-endian).
    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Write a 32-bit value at a guest physical address (little-endian).
    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Write a 64-bit value at a guest physical address (little-endian).
    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Read bytes from a guest physical address into a buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if the read would leave guest RAM.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        let len = data.len();
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|e| MemoryError::Access {
                addr,
                len,
                reason: e.to_string(),
            })
    }

    /// Read a 16-bit value from a guest physical address (little-endian).
    pub fn read_u16(&self, addr: u64) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Read a 32-bit value from a guest physical address (little-endian).
    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    /// Helper to read and return a Vec for test assertions.
    fn read_vec(mem: &GuestMemory, addr: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        mem.read(addr, &mut data).unwrap();
        data
    }

    fn split_layout() -> MemoryLayout {
        MemoryLayout {
            size: 2 * MIB,
            below_4g_limit: MIB,
        }
    }

    #[test]
    fn test_allocate_single_region() {
        let mem = GuestMemory::new(MemoryLayout::new(MIB)).unwrap();
        let regions = mem.as_raw_regions();
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].0, 0);
        assert_eq!(regions[0].1, MIB);
        assert_eq!(mem.size(), MIB);
    }

    #[test]
    fn test_allocate_split_regions() {
        let mem = GuestMemory::new(split_layout()).unwrap();
        let regions = mem.as_raw_regions();
        assert_eq!(regions.len(), 2);
        assert_eq!((regions[0].0, regions[0].1), (0, MIB));
        assert_eq!((regions[1].0, regions[1].1), (FOUR_GIB, MIB));
        assert_eq!(mem.size(), 2 * MIB);
    }

    #[test]
    fn test_invalid_layouts() {
        assert!(MemoryLayout::new(0).ranges().is_err());
        assert!(MemoryLayout::new(4097).ranges().is_err());
        let layout = MemoryLayout {
            size: MIB,
            below_4g_limit: FOUR_GIB + GUEST_PAGE_SIZE,
        };
        assert!(matches!(
            layout.ranges(),
            Err(MemoryError::InvalidLayout(_))
        ));
    }

    #[test]
    fn test_memory_map_matches_allocation() {
        let mem = GuestMemory::new(split_layout()).unwrap();
        let map = mem.memory_map().unwrap();
        let subregions: Vec<_> = map.iter().collect();
        assert_eq!(subregions.len(), 2);
        assert_eq!(subregions[0].name, RAM_BELOW_4G);
        assert_eq!(subregions[1].name, RAM_ABOVE_4G);
        assert_eq!(subregions[1].base, FOUR_GIB);

        for (sub, raw) in subregions.iter().zip(mem.as_raw_regions()) {
            assert_eq!(sub.kind, SubregionKind::Ram { host_base: raw.2 });
        }
    }

    #[test]
    fn test_write_read() {
        let mem = GuestMemory::new(split_layout()).unwrap();
        mem.write(0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(read_vec(&mem, 0, 4), vec![1, 2, 3, 4]);

        mem.write(FOUR_GIB + 16, &[9, 8]).unwrap();
        assert_eq!(read_vec(&mem, FOUR_GIB + 16, 2), vec![9, 8]);
    }

    #[test]
    fn test_typed_accessors() {
        let mem = GuestMemory::new(MemoryLayout::new(MIB)).unwrap();
        mem.write_u16(100, 0xbeef).unwrap();
        mem.write_u32(200, 0x12345678).unwrap();
        mem.write_u64(300, 0x123456789abcdef0).unwrap();
        assert_eq!(read_vec(&mem, 200, 4), vec![0x78, 0x56, 0x34, 0x12]);
        assert_eq!(mem.read_u16(100).unwrap(), 0xbeef);
        assert_eq!(mem.read_u32(200).unwrap(), 0x12345678);
        assert_eq!(
            read_vec(&mem, 300, 8),
            0x123456789abcdef0u64.to_le_bytes().to_vec()
        );
    }

    #[test]
    fn test_hole_is_not_accessible() {
        let mem = GuestMemory::new(split_layout()).unwrap();
        assert!(mem.write(MIB, &[1]).is_err());
        let mut buf = [0u8; 2];
        assert!(mem.read(MIB - 1, &mut buf).is_err());
    }

    #[test]
    fn test_write_out_of_bounds() {
        let mem = GuestMemory::new(MemoryLayout::new(GUEST_PAGE_SIZE)).unwrap();
        assert!(mem.write(GUEST_PAGE_SIZE - 1, &[1, 2]).is_err());
    }
}
