//! The region arena and its address index.

use std::collections::BTreeMap;

use crate::memory::{MemoryRegion, RegionId, RegionType};

/// Ordered snapshot of one process's address space.
///
/// Regions live in a `Vec` in strictly increasing base-address order, so a
/// [`RegionId`] doubles as the list position. The `BTreeMap` maps every base
/// address to its id and answers "which region contains this address".
#[derive(Debug, Default)]
pub struct MemoryRegionList {
    process_id: u32,
    regions: Vec<MemoryRegion>,
    index: BTreeMap<u64, RegionId>,
}

impl MemoryRegionList {
    pub fn new(process_id: u32) -> Self {
        Self {
            process_id,
            regions: Vec::new(),
            index: BTreeMap::new(),
        }
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Appends a region. Bases must be pushed in increasing order.
    pub(crate) fn push(&mut self, region: MemoryRegion) -> RegionId {
        debug_assert!(
            self.regions
                .last()
                .is_none_or(|last| last.base_address < region.base_address),
            "regions must be pushed in increasing address order"
        );

        let id = RegionId(self.regions.len());
        self.index.insert(region.base_address, id);
        self.regions.push(region);
        id
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn get(&self, id: RegionId) -> Option<&MemoryRegion> {
        self.regions.get(id.0)
    }

    pub fn get_mut(&mut self, id: RegionId) -> Option<&mut MemoryRegion> {
        self.regions.get_mut(id.0)
    }

    pub fn ids(&self) -> impl Iterator<Item = RegionId> + use<> {
        (0..self.regions.len()).map(RegionId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (RegionId, &MemoryRegion)> {
        self.regions
            .iter()
            .enumerate()
            .map(|(i, region)| (RegionId(i), region))
    }

    pub fn regions(&self) -> &[MemoryRegion] {
        &self.regions
    }

    /// The region following `id` in address order.
    pub fn next_of(&self, id: RegionId) -> Option<RegionId> {
        let next = id.0 + 1;
        (next < self.regions.len()).then_some(RegionId(next))
    }

    /// Finds the region with `base <= address < base + size`.
    pub fn lookup(&self, address: u64) -> Option<RegionId> {
        let (_, &id) = self.index.range(..=address).next_back()?;
        self.regions[id.0].contains(address).then_some(id)
    }

    /// The region that starts exactly at `address`.
    pub fn find_by_base(&self, address: u64) -> Option<RegionId> {
        self.index.get(&address).copied()
    }

    /// The contiguous run of regions, starting at `base_item`, whose
    /// allocation base item is `base_item`.
    pub fn allocation_members(&self, base_item: RegionId) -> impl Iterator<Item = RegionId> + '_ {
        self.regions[base_item.0.min(self.regions.len())..]
            .iter()
            .take_while(move |region| region.allocation_base_item == Some(base_item))
            .enumerate()
            .map(move |(offset, _)| RegionId(base_item.0 + offset))
    }

    /// Human readable role of a region. Heap segments name their heap.
    pub fn describe(&self, id: RegionId) -> String {
        let Some(region) = self.get(id) else {
            return String::new();
        };

        match &region.region_type {
            RegionType::HeapSegment { heap } | RegionType::HeapSegment32 { heap } => {
                match self.get(*heap) {
                    Some(heap_region) => format!(
                        "{} (heap at {:#x})",
                        region.region_type, heap_region.base_address
                    ),
                    None => region.region_type.to_string(),
                }
            }
            other => other.to_string(),
        }
    }
}
