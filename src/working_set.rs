//! Working-set residency counters per region.

use serde::Serialize;
use tracing::{debug, trace};

use crate::memory::{MemoryRegion, RegionId, WorkingSetExEntry};
use crate::process_operations::TargetProcess;
use crate::region_list::MemoryRegionList;

/// Size of one `MEMORY_WORKING_SET_EX_INFORMATION` entry.
pub const WORKING_SET_EX_ENTRY_SIZE: u64 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkingSetStrategy {
    /// Per-page attribute queries, batched one page worth of entries at a time.
    Ex,
    /// One flat query returning every resident page; has no locked counter.
    Legacy,
}

/// Entries per working-set-ex round trip.
pub fn request_count(page_size: u64) -> usize {
    (page_size / WORKING_SET_EX_ENTRY_SIZE).max(1) as usize
}

/// Accumulates working-set counters onto every region.
pub fn sample<P: TargetProcess + ?Sized>(
    list: &mut MemoryRegionList,
    process: &P,
    strategy: WorkingSetStrategy,
) {
    match strategy {
        WorkingSetStrategy::Ex => sample_ex(list, process),
        WorkingSetStrategy::Legacy => sample_legacy(list, process),
    }
}

/// Remembers the region that owned the previous page, so consecutive pages
/// skip the index lookup.
struct OwnerCursor {
    current: Option<RegionId>,
}

impl OwnerCursor {
    fn new() -> Self {
        Self { current: None }
    }

    fn owner<'a>(&mut self, list: &'a mut MemoryRegionList, address: u64) -> Option<&'a mut MemoryRegion> {
        let same = self
            .current
            .and_then(|id| list.get(id))
            .is_some_and(|region| region.contains(address));

        if !same {
            self.current = list.lookup(address);
        }

        list.get_mut(self.current?)
    }
}

fn sample_ex<P: TargetProcess + ?Sized>(list: &mut MemoryRegionList, process: &P) {
    let page_size = process.system_info().page_size;
    let batch_len = request_count(page_size);
    let mut batch: Vec<WorkingSetExEntry> = Vec::with_capacity(batch_len);
    let mut cursor = OwnerCursor::new();

    let committed: Vec<(u64, u64)> = list
        .regions()
        .iter()
        .filter(|region| region.is_committed())
        .map(|region| (region.base_address, region.region_size / page_size))
        .collect();

    for (base, pages) in committed {
        for page in 0..pages {
            batch.push(WorkingSetExEntry::new(base + page * page_size));
            if batch.len() == batch_len {
                flush_ex(list, process, &mut batch, &mut cursor);
            }
        }
    }

    if !batch.is_empty() {
        flush_ex(list, process, &mut batch, &mut cursor);
    }
}

fn flush_ex<P: TargetProcess + ?Sized>(
    list: &mut MemoryRegionList,
    process: &P,
    batch: &mut Vec<WorkingSetExEntry>,
    cursor: &mut OwnerCursor,
) {
    if let Err(err) = process.query_working_set_ex(batch) {
        trace!(
            error = %err,
            pages = batch.len(),
            "working set batch at {:#x} failed",
            batch[0].virtual_address
        );
        batch.clear();
        return;
    }

    for entry in batch.iter() {
        let block = entry.attributes;
        if !block.valid {
            continue;
        }
        let Some(region) = cursor.owner(list, entry.virtual_address) else {
            continue;
        };

        let counters = &mut region.working_set;
        counters.total += 1;
        if block.share_count > 1 {
            counters.shared += 1;
        }
        if block.share_count == 0 {
            counters.private += 1;
        }
        if block.shared {
            counters.shareable += 1;
        }
        if block.locked {
            counters.locked += 1;
        }
    }

    batch.clear();
}

fn sample_legacy<P: TargetProcess + ?Sized>(list: &mut MemoryRegionList, process: &P) {
    let page_size = process.system_info().page_size;
    let blocks = match process.query_working_set() {
        Ok(blocks) => blocks,
        Err(err) => {
            debug!(pid = list.process_id(), error = %err, "working set query failed");
            return;
        }
    };

    let mut cursor = OwnerCursor::new();
    for block in blocks {
        let Some(address) = block.virtual_page.checked_mul(page_size) else {
            continue;
        };
        let Some(region) = cursor.owner(list, address) else {
            continue;
        };

        let counters = &mut region.working_set;
        counters.total += 1;
        if block.share_count > 1 {
            counters.shared += 1;
        }
        if block.share_count == 0 {
            counters.private += 1;
        }
        if block.shared {
            counters.shareable += 1;
        }
    }
}
