//! Address translation between guest physical, host virtual and host
//! physical addresses.

use std::io;

use log::{debug, trace};
use thiserror::Error;

use super::pagemap::{self, Pagemap, PagemapEntry};
use super::registry::RegionRegistry;
use crate::memory::{MemoryMap, SubregionKind};

#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("GPA {0:#x} is not mapped")]
    Unmapped(u64),

    #[error("GPA {gpa:#x} lies in {name}, which is not host RAM")]
    NotRam { gpa: u64, name: String },

    #[error("GPA range {gpa:#x}+{len:#x} runs past the end of {name}")]
    OutOfBounds { gpa: u64, len: u64, name: String },

    #[error("HVA {0:#x} is not inside a registered RAM region")]
    NotInRegistry(u64),

    #[error("Host page backing HVA {0:#x} is not present")]
    PageNotPresent(u64),

    #[error("Failed to read host page tables: {0}")]
    Io(#[from] io::Error),
}

/// Translator over a memory map and the RAM regions discovered from it.
pub struct Translator {
    map: MemoryMap,
    registry: RegionRegistry,
}

impl Translator {
    pub fn new(map: MemoryMap, registry: RegionRegistry) -> Self {
        Self { map, registry }
    }

    pub fn registry(&self) -> &RegionRegistry {
        &self.registry
    }

    /// Host virtual address of `gpa`, checking that `len` bytes from there
    /// stay inside the same RAM subregion.
    ///
    /// A zero `len` only checks that `gpa` is covered.
    pub fn gpa_to_hva(&self, gpa: u64, len: u64) -> Result<u64, TranslateError> {
        let sub = self.map.find(gpa).ok_or(TranslateError::Unmapped(gpa))?;
        let host_base = match sub.kind {
            SubregionKind::Ram { host_base } => host_base,
            SubregionKind::Rom | SubregionKind::Mmio => {
                return Err(TranslateError::NotRam {
                    gpa,
                    name: sub.name.clone(),
                })
            }
        };

        let out_of_bounds = || TranslateError::OutOfBounds {
            gpa,
            len,
            name: sub.name.clone(),
        };
        let end = gpa.checked_add(len).ok_or_else(out_of_bounds)?;
        if end > sub.end() {
            return Err(out_of_bounds());
        }

        let hva = host_base + (gpa - sub.base);
        trace!("gpa {:#x} -> hva {:#x} ({})", gpa, hva, sub.name);
        Ok(hva)
    }

    /// Guest physical address of a host virtual address inside guest RAM.
    pub fn hva_to_gpa(&self, hva: u64) -> Result<u64, TranslateError> {
        let region = self
            .registry
            .lookup_hva(hva)
            .ok_or(TranslateError::NotInRegistry(hva))?;
        let offset = hva
            .checked_sub(region.host_base)
            .filter(|&offset| offset < region.size)
            .ok_or(TranslateError::NotInRegistry(hva))?;
        Ok(region.guest_base + offset)
    }

    /// Host physical address backing `hva`.
    ///
    /// Faults the page in first. Without `CAP_SYS_ADMIN` the kernel hides
    /// frame numbers and the result is just the offset within the page.
    pub fn hva_to_hpa(&self, hva: u64) -> Result<u64, TranslateError> {
        if self.registry.lookup_hva(hva).is_none() {
            return Err(TranslateError::NotInRegistry(hva));
        }

        let pagemap = Pagemap::open()?;
        let page_size = pagemap.page_size();
        if !pagemap::populate_write(hva, page_size)? {
            debug!("MADV_POPULATE_WRITE unsupported; reading pagemap without prefault");
        }

        frame_address(pagemap.entry(hva)?, page_size, hva)
    }
}

/// Physical address of `hva` given the pagemap entry of its page.
fn frame_address(entry: PagemapEntry, page_size: u64, hva: u64) -> Result<u64, TranslateError> {
    if !entry.present {
        if entry.swapped {
            debug!("hva {:#x} is swapped out", hva);
        }
        return Err(TranslateError::PageNotPresent(hva));
    }
    let base = entry.pfn.checked_mul(page_size).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("PFN {:#x} overflows a 64-bit address", entry.pfn),
        )
    })?;
    Ok(base + hva % page_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::virtio::memsplit::RegionModel;
    use crate::memory::{GuestMemory, MemoryLayout, Subregion, FOUR_GIB};

    const MIB: u64 = 1024 * 1024;

    fn translator(memory: &GuestMemory) -> Translator {
        let mut map = memory.memory_map().unwrap();
        map.add(Subregion::mmio("virtio-mmio", 0xd000_0000, 0x1000))
            .unwrap();
        map.add(Subregion::rom("bios", 0xfff0_0000, 0x10_0000)).unwrap();
        let registry = RegionRegistry::discover(&map, RegionModel::Split).unwrap();
        Translator::new(map, registry)
    }

    fn split_memory() -> GuestMemory {
        GuestMemory::new(MemoryLayout {
            size: 2 * MIB,
            below_4g_limit: MIB,
        })
        .unwrap()
    }

    #[test]
    fn test_round_trip_inside_every_region() {
        let memory = split_memory();
        let t = translator(&memory);

        for region in t.registry().iter() {
            for offset in [1, 0x1000, region.size / 2, region.size - 1] {
                let hva = region.host_base + offset;
                let gpa = t.hva_to_gpa(hva).unwrap();
                assert_eq!(gpa, region.guest_base + offset);
                let back = t.gpa_to_hva(gpa, 1).unwrap();
                assert_eq!(back, hva);
                assert!(region.contains_hva(back));
            }
        }
    }

    #[test]
    fn test_gpa_to_hva_matches_guest_memory() {
        let memory = split_memory();
        let t = translator(&memory);
        memory.write(FOUR_GIB + 0x10, &[0xab]).unwrap();

        let hva = t.gpa_to_hva(FOUR_GIB + 0x10, 1).unwrap();
        // SAFETY: the HVA was just resolved into live guest RAM.
        let byte = unsafe { *(hva as *const u8) };
        assert_eq!(byte, 0xab);
    }

    #[test]
    fn test_out_of_bounds() {
        let memory = split_memory();
        let t = translator(&memory);

        for region in t.registry().iter() {
            for len in [region.size + 1, region.size * 2] {
                assert!(matches!(
                    t.gpa_to_hva(region.guest_base, len),
                    Err(TranslateError::OutOfBounds { .. })
                ));
            }
            assert!(t.gpa_to_hva(region.guest_base, region.size).is_ok());
            assert!(matches!(
                t.gpa_to_hva(region.guest_end() - 1, 2),
                Err(TranslateError::OutOfBounds { .. })
            ));
        }
        assert!(matches!(
            t.gpa_to_hva(0x10, u64::MAX),
            Err(TranslateError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_unmapped_and_not_ram() {
        let memory = split_memory();
        let t = translator(&memory);

        assert!(matches!(
            t.gpa_to_hva(MIB, 0),
            Err(TranslateError::Unmapped(addr)) if addr == MIB
        ));
        assert!(matches!(
            t.gpa_to_hva(0xd000_0010, 4),
            Err(TranslateError::NotRam { ref name, .. }) if name == "virtio-mmio"
        ));
        assert!(matches!(
            t.gpa_to_hva(0xffff_fff0, 0),
            Err(TranslateError::NotRam { .. })
        ));
    }

    #[test]
    fn test_hva_outside_registry() {
        let memory = split_memory();
        let t = translator(&memory);
        let outside = 0x10u64;

        assert!(matches!(
            t.hva_to_gpa(outside),
            Err(TranslateError::NotInRegistry(_))
        ));
        assert!(matches!(
            t.hva_to_hpa(outside),
            Err(TranslateError::NotInRegistry(_))
        ));
    }

    #[test]
    fn test_hva_to_hpa_keeps_page_offset() {
        let memory = split_memory();
        let t = translator(&memory);
        let region = t.registry().iter().next().unwrap();
        let hva = region.host_base + 0x1234;

        match t.hva_to_hpa(hva) {
            Ok(hpa) => {
                let page_size = pagemap::host_page_size();
                assert_eq!(hpa % page_size, hva % page_size);
            }
            // Pagemap may be unavailable in restricted environments.
            Err(TranslateError::Io(_)) | Err(TranslateError::PageNotPresent(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    #[test]
    fn test_frame_address() {
        let entry = |raw| PagemapEntry::from_raw(raw);
        let present = 1u64 << 63;

        assert_eq!(
            frame_address(entry(present | 0x1234), 0x1000, 0x7f00_0000_0abc).unwrap(),
            0x123_4abc
        );
        assert!(matches!(
            frame_address(entry(1 << 62), 0x1000, 0x5000),
            Err(TranslateError::PageNotPresent(0x5000))
        ));

        // A 55-bit frame number times a 4 KiB page does not fit in 64 bits.
        let huge = present | ((1 << 55) - 1);
        assert!(matches!(
            frame_address(entry(huge), 0x1000, 0),
            Err(TranslateError::Io(_))
        ));
    }
}
