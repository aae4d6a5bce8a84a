//! Walks a process's address space into a [`MemoryRegionList`].

use tracing::{debug, trace};

use crate::error::{RegionError, Result};
use crate::memory::{BasicInfo, MemoryRegion, RegionId, RegionType, WorkingSetExEntry};
use crate::process_operations::TargetProcess;
use crate::region_list::MemoryRegionList;
use crate::utils::{align_up, is_aligned};

/// Queries regions from address 0 upward until the query fails.
///
/// A failure on the very first query is an error; any later failure marks
/// the end of the address space. Misaligned free regions are split into an
/// `Unusable` gap up to the next allocation-granularity boundary and a free
/// remainder.
pub fn enumerate<P: TargetProcess + ?Sized>(
    process: &P,
    process_id: u32,
    include_free: bool,
) -> Result<MemoryRegionList> {
    let granularity = process.system_info().allocation_granularity;
    let mut list = MemoryRegionList::new(process_id);
    let mut allocation_item: Option<RegionId> = None;
    let mut address = 0u64;
    let mut first = true;

    loop {
        let Some(mut info) = process.query_basic(address) else {
            if first {
                return Err(RegionError::FirstQueryFailed { pid: process_id });
            }
            trace!("end of address space at {:#x}", address);
            break;
        };
        first = false;

        if info.region_size == 0 {
            debug!("zero sized region at {:#x}, stopping", address);
            break;
        }

        let next = info.base_address.checked_add(info.region_size);

        if info.is_free() {
            if !include_free {
                match next {
                    Some(next) => {
                        address = next;
                        continue;
                    }
                    None => break,
                }
            }
            info.allocation_base = info.base_address;
        }

        let mut region = MemoryRegion::from_basic_info(&info);
        let (valid, bad) = probe_page(process, info.base_address);
        region.valid = valid;
        region.bad = bad;

        let split = info.is_free() && !is_aligned(info.base_address, granularity);
        let id = push_linked(&mut list, region, &mut allocation_item);

        if split {
            split_unusable(&mut list, id, &info, granularity, &mut allocation_item);
        }

        match next {
            Some(next) => address = next,
            None => break,
        }
    }

    debug!(pid = process_id, regions = list.len(), "enumerated memory regions");
    Ok(list)
}

fn push_linked(
    list: &mut MemoryRegionList,
    region: MemoryRegion,
    allocation_item: &mut Option<RegionId>,
) -> RegionId {
    let starts_allocation = region.allocation_base == region.base_address;
    let allocation_base = region.allocation_base;
    let id = list.push(region);

    if starts_allocation {
        *allocation_item = Some(id);
    }

    let current = allocation_item.filter(|current| {
        list.get(*current)
            .is_some_and(|item| item.base_address == allocation_base)
    });
    if let Some(region) = list.get_mut(id) {
        region.allocation_base_item = current;
    }
    id
}

fn split_unusable(
    list: &mut MemoryRegionList,
    id: RegionId,
    info: &BasicInfo,
    granularity: u64,
    allocation_item: &mut Option<RegionId>,
) {
    let next_allocation_base = align_up(info.base_address, granularity);
    let unusable_size = next_allocation_base.wrapping_sub(info.base_address);

    let Some(region) = list.get_mut(id) else {
        return;
    };
    region.region_type = RegionType::Unusable;

    if next_allocation_base == 0 || unusable_size >= info.region_size {
        return;
    }
    region.region_size = unusable_size;

    let mut remainder = MemoryRegion::from_basic_info(info);
    remainder.base_address = next_allocation_base;
    remainder.allocation_base = next_allocation_base;
    remainder.region_size = info.region_size - unusable_size;

    trace!(
        unusable = unusable_size,
        "split misaligned free region at {:#x}",
        info.base_address
    );
    push_linked(list, remainder, allocation_item);
}

/// Single-page working-set-ex probe. Failure reads as not valid, not bad.
fn probe_page<P: TargetProcess + ?Sized>(process: &P, address: u64) -> (bool, bool) {
    let mut entry = [WorkingSetExEntry::new(address)];
    match process.query_working_set_ex(&mut entry) {
        Ok(()) => (entry[0].attributes.valid, entry[0].attributes.bad),
        Err(err) => {
            trace!(error = %err, "page probe at {:#x} failed", address);
            (false, false)
        }
    }
}
