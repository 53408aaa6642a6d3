//! Authoritative guest physical memory map.
//!
//! The map lists every named subregion of the guest physical address space,
//! not just RAM: MMIO windows and ROM-as-device ranges appear here too, so a
//! translation against the map can tell "not mapped" apart from "mapped, but
//! not backed by host RAM".

use super::MemoryError;

/// What backs a subregion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubregionKind {
    /// Directly mapped host memory starting at `host_base`.
    Ram { host_base: u64 },
    /// ROM handled as a device (no direct host mapping).
    Rom,
    /// Device registers.
    Mmio,
}

/// A named range of guest physical addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subregion {
    pub name: String,
    /// First guest physical address of the range.
    pub base: u64,
    /// Length in bytes (never zero).
    pub size: u64,
    pub kind: SubregionKind,
}

impl Subregion {
    pub fn ram(name: &str, base: u64, size: u64, host_base: u64) -> Self {
        Self {
            name: name.to_string(),
            base,
            size,
            kind: SubregionKind::Ram { host_base },
        }
    }

    pub fn rom(name: &str, base: u64, size: u64) -> Self {
        Self {
            name: name.to_string(),
            base,
            size,
            kind: SubregionKind::Rom,
        }
    }

    pub fn mmio(name: &str, base: u64, size: u64) -> Self {
        Self {
            name: name.to_string(),
            base,
            size,
            kind: SubregionKind::Mmio,
        }
    }

    /// One past the last guest physical address.
    ///
    /// Cannot overflow for subregions accepted by `MemoryMap::add`.
    pub fn end(&self) -> u64 {
        self.base + self.size
    }

    pub fn contains(&self, gpa: u64) -> bool {
        gpa >= self.base && gpa < self.end()
    }

    /// Host base pointer if this subregion is host RAM.
    pub fn host_base(&self) -> Option<u64> {
        match self.kind {
            SubregionKind::Ram { host_base } => Some(host_base),
            SubregionKind::Rom | SubregionKind::Mmio => None,
        }
    }
}

/// Subregions sorted by base address, pairwise disjoint.
#[derive(Debug, Clone, Default)]
pub struct MemoryMap {
    subregions: Vec<Subregion>,
}

impl MemoryMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a subregion, keeping the map sorted.
    ///
    /// # Errors
    ///
    /// Rejects empty subregions, subregions that wrap the address space, and
    /// subregions overlapping an existing one.
    pub fn add(&mut self, subregion: Subregion) -> Result<(), MemoryError> {
        if subregion.size == 0 {
            return Err(MemoryError::InvalidLayout(format!(
                "subregion {} is empty",
                subregion.name
            )));
        }
        if subregion.base.checked_add(subregion.size).is_none() {
            return Err(MemoryError::InvalidLayout(format!(
                "subregion {} at {:#x} wraps the address space",
                subregion.name, subregion.base
            )));
        }

        let pos = self
            .subregions
            .partition_point(|s| s.base < subregion.base);

        let overlaps_prev = pos > 0 && self.subregions[pos - 1].end() > subregion.base;
        let overlaps_next = self
            .subregions
            .get(pos)
            .is_some_and(|next| subregion.end() > next.base);
        if overlaps_prev || overlaps_next {
            let other = if overlaps_prev {
                &self.subregions[pos - 1]
            } else {
                &self.subregions[pos]
            };
            return Err(MemoryError::Overlap {
                name: subregion.name,
                base: subregion.base,
                other: other.name.clone(),
            });
        }

        self.subregions.insert(pos, subregion);
        Ok(())
    }

    /// Find the subregion covering `gpa`.
    pub fn find(&self, gpa: u64) -> Option<&Subregion> {
        let pos = self.subregions.partition_point(|s| s.base <= gpa);
        let candidate = self.subregions.get(pos.checked_sub(1)?)?;
        candidate.contains(gpa).then_some(candidate)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Subregion> {
        self.subregions.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> MemoryMap {
        let mut map = MemoryMap::new();
        map.add(Subregion::mmio("virtio-mmio", 0xd000_0000, 0x1000))
            .unwrap();
        map.add(Subregion::ram("ram-below-4g", 0, 0x10_0000, 0x7f00_0000_0000))
            .unwrap();
        map.add(Subregion::rom("bios", 0xfff0_0000, 0x10_0000)).unwrap();
        map
    }

    #[test]
    fn test_add_keeps_order() {
        let map = sample_map();
        let bases: Vec<u64> = map.iter().map(|s| s.base).collect();
        assert_eq!(bases, vec![0, 0xd000_0000, 0xfff0_0000]);
        assert_eq!(map.subregions.len(), 3);
    }

    #[test]
    fn test_find() {
        let map = sample_map();
        assert_eq!(map.find(0).unwrap().name, "ram-below-4g");
        assert_eq!(map.find(0xf_ffff).unwrap().name, "ram-below-4g");
        assert!(map.find(0x10_0000).is_none());
        assert_eq!(map.find(0xd000_0fff).unwrap().kind, SubregionKind::Mmio);
        assert!(map.find(0xd000_1000).is_none());
        assert_eq!(map.find(0xffff_ffff).unwrap().name, "bios");
    }

    #[test]
    fn test_overlap_rejected() {
        let mut map = sample_map();
        let err = map
            .add(Subregion::mmio("clash", 0xf_f000, 0x2000))
            .unwrap_err();
        assert!(matches!(err, MemoryError::Overlap { ref other, .. } if other == "ram-below-4g"));

        let err = map
            .add(Subregion::mmio("clash", 0xcfff_f000, 0x2000))
            .unwrap_err();
        assert!(matches!(err, MemoryError::Overlap { ref other, .. } if other == "virtio-mmio"));

        // Touching ranges are fine.
        map.add(Subregion::mmio("adjacent", 0x10_0000, 0x1000))
            .unwrap();
    }

    #[test]
    fn test_degenerate_subregions_rejected() {
        let mut map = MemoryMap::new();
        assert!(map.add(Subregion::mmio("empty", 0x1000, 0)).is_err());
        assert!(map.add(Subregion::mmio("wrap", u64::MAX, 2)).is_err());
        assert!(map.subregions.is_empty());
    }
}
