//! RAM regions the device knows about.
//!
//! Discovered once at realize from the memory map and read-only afterwards.
//! Regions are kept sorted by guest physical address, with a second index
//! sorted by host virtual address for reverse lookups.

use log::{debug, warn};
use thiserror::Error;

use super::RegionModel;
use crate::memory::{MemoryMap, RAM_ABOVE_4G, RAM_BELOW_4G};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No RAM-backed subregion found in the memory map")]
    NoRamFound,
}

/// A RAM-backed range of guest physical memory and where it lives in the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RamRegion {
    pub name: String,
    pub guest_base: u64,
    /// Never zero.
    pub size: u64,
    pub host_base: u64,
}

impl RamRegion {
    pub fn guest_end(&self) -> u64 {
        self.guest_base + self.size
    }

    pub fn host_end(&self) -> u64 {
        self.host_base + self.size
    }

    pub fn contains_gpa(&self, gpa: u64) -> bool {
        gpa >= self.guest_base && gpa < self.guest_end()
    }

    pub fn contains_hva(&self, hva: u64) -> bool {
        hva >= self.host_base && hva < self.host_end()
    }
}

#[derive(Debug, Clone)]
pub struct RegionRegistry {
    /// Sorted by `guest_base`.
    regions: Vec<RamRegion>,
    /// Indices into `regions`, sorted by `host_base`.
    by_host: Vec<usize>,
}

impl RegionRegistry {
    /// Collect the RAM regions of `map` according to `model`.
    ///
    /// # Errors
    ///
    /// `NoRamFound` if no subregion qualifies.
    pub fn discover(map: &MemoryMap, model: RegionModel) -> Result<Self, RegistryError> {
        let mut regions: Vec<RamRegion> = Vec::new();

        for sub in map.iter() {
            let Some(host_base) = sub.host_base() else {
                continue;
            };
            if model == RegionModel::Split {
                if sub.name != RAM_BELOW_4G && sub.name != RAM_ABOVE_4G {
                    debug!("registry: skipping RAM subregion {}", sub.name);
                    continue;
                }
                if regions.iter().any(|r| r.name == sub.name) {
                    warn!(
                        "registry: duplicate {} at {:#x} ignored",
                        sub.name, sub.base
                    );
                    continue;
                }
            }
            regions.push(RamRegion {
                name: sub.name.clone(),
                guest_base: sub.base,
                size: sub.size,
                host_base,
            });
        }

        if regions.is_empty() {
            return Err(RegistryError::NoRamFound);
        }

        // The map is already sorted by base address.
        let mut by_host: Vec<usize> = (0..regions.len()).collect();
        by_host.sort_by_key(|&i| regions[i].host_base);

        Ok(Self { regions, by_host })
    }

    /// Region containing guest physical address `gpa`.
    pub fn lookup_gpa(&self, gpa: u64) -> Option<&RamRegion> {
        let pos = self.regions.partition_point(|r| r.guest_base <= gpa);
        let region = self.regions.get(pos.checked_sub(1)?)?;
        region.contains_gpa(gpa).then_some(region)
    }

    /// Region containing host virtual address `hva`.
    pub fn lookup_hva(&self, hva: u64) -> Option<&RamRegion> {
        let pos = self
            .by_host
            .partition_point(|&i| self.regions[i].host_base <= hva);
        let region = &self.regions[*self.by_host.get(pos.checked_sub(1)?)?];
        region.contains_hva(hva).then_some(region)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RamRegion> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Subregion, FOUR_GIB};

    fn map_with(subregions: Vec<Subregion>) -> MemoryMap {
        let mut map = MemoryMap::new();
        for sub in subregions {
            map.add(sub).unwrap();
        }
        map
    }

    fn pc_map() -> MemoryMap {
        map_with(vec![
            Subregion::ram(RAM_BELOW_4G, 0, 0x10_0000, 0x7f00_0020_0000),
            Subregion::mmio("virtio-mmio", 0xd000_0000, 0x1000),
            Subregion::ram(RAM_ABOVE_4G, FOUR_GIB, 0x10_0000, 0x7f00_0000_0000),
            Subregion::ram("pc.ram-extra", 0x20_0000, 0x1000, 0x7f00_1000_0000),
        ])
    }

    #[test]
    fn test_split_model_takes_named_regions() {
        let registry = RegionRegistry::discover(&pc_map(), RegionModel::Split).unwrap();
        let names: Vec<&str> = registry.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec![RAM_BELOW_4G, RAM_ABOVE_4G]);
    }

    #[test]
    fn test_all_ram_model_takes_every_ram_region() {
        let registry = RegionRegistry::discover(&pc_map(), RegionModel::AllRam).unwrap();
        assert_eq!(registry.len(), 3);
        assert!(registry.iter().all(|r| r.size > 0));
    }

    #[test]
    fn test_no_ram_found() {
        let map = map_with(vec![
            Subregion::mmio("virtio-mmio", 0xd000_0000, 0x1000),
            Subregion::rom("bios", 0xfff0_0000, 0x10_0000),
        ]);
        assert_eq!(
            RegionRegistry::discover(&map, RegionModel::AllRam).unwrap_err(),
            RegistryError::NoRamFound
        );

        // RAM exists, but not under the names the split model looks for.
        let map = map_with(vec![Subregion::ram("other", 0, 0x1000, 0x1000_0000)]);
        assert_eq!(
            RegionRegistry::discover(&map, RegionModel::Split).unwrap_err(),
            RegistryError::NoRamFound
        );
    }

    #[test]
    fn test_duplicate_names_first_wins() {
        let map = map_with(vec![
            Subregion::ram(RAM_BELOW_4G, 0, 0x1000, 0x1000_0000),
            Subregion::ram(RAM_BELOW_4G, 0x2000, 0x1000, 0x2000_0000),
        ]);
        let registry = RegionRegistry::discover(&map, RegionModel::Split).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.iter().next().unwrap().guest_base, 0);
    }

    #[test]
    fn test_lookups() {
        let registry = RegionRegistry::discover(&pc_map(), RegionModel::Split).unwrap();

        assert_eq!(registry.lookup_gpa(0x1234).unwrap().name, RAM_BELOW_4G);
        assert!(registry.lookup_gpa(0x10_0000).is_none());
        assert_eq!(
            registry.lookup_gpa(FOUR_GIB + 0xf_ffff).unwrap().name,
            RAM_ABOVE_4G
        );
        assert!(registry.lookup_gpa(FOUR_GIB + 0x10_0000).is_none());

        // Host order differs from guest order.
        assert_eq!(
            registry.lookup_hva(0x7f00_0000_0010).unwrap().name,
            RAM_ABOVE_4G
        );
        assert_eq!(
            registry.lookup_hva(0x7f00_0020_0000).unwrap().name,
            RAM_BELOW_4G
        );
        assert!(registry.lookup_hva(0x7f00_0010_0000).is_none());
        assert!(registry.lookup_hva(0).is_none());
    }
}
