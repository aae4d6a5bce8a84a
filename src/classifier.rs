//! Tags regions with their semantic role.
//!
//! Classification runs in fixed passes over a finished [`MemoryRegionList`].
//! A region keeps the first type any pass gives it, so later passes only
//! ever fill in regions that are still `Unknown`. Every step reads live and
//! possibly hostile target memory; a failed read simply leaves the affected
//! regions untouched.

use tracing::{debug, trace};

use crate::layout::{
    heap_segment_candidate, HeapSegmentCandidate, NtTib, PebLayout, SystemDllInitBlock,
    HEAP_SEGMENT_READ_SIZE, MAX_HEAPS,
};
use crate::memory::{RegionId, RegionType};
use crate::process_operations::TargetProcess;
use crate::region_list::MemoryRegionList;

/// Fixed address of `KUSER_SHARED_DATA` in every process.
pub const USER_SHARED_DATA: u64 = 0x7ffe_0000;

/// First build with TEB/PEB sub-VAD segments (Windows 10 RS2).
pub const BUILD_RS2: u32 = 15063;
/// First build exposing the hypervisor shared page (Windows 10 RS4).
pub const BUILD_RS4: u32 = 17134;

/// How PEB and TEB pointers are mapped to regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PebTebTagging {
    /// Tag the allocation that contains the block.
    WholeAllocation,
    /// Tag only the region containing the block; newer systems carve the
    /// PEB/TEB allocation into separate segments.
    SubRegion,
}

impl PebTebTagging {
    fn go_to_allocation_base(self) -> bool {
        matches!(self, PebTebTagging::WholeAllocation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierPolicy {
    pub peb_teb_tagging: PebTebTagging,
    pub hypervisor_shared_data: bool,
    /// Only meaningful for 64-bit targets.
    pub cfg_bitmap: bool,
}

impl ClassifierPolicy {
    pub fn for_build(build: u32, is_64bit: bool) -> Self {
        Self {
            peb_teb_tagging: if build >= BUILD_RS2 {
                PebTebTagging::SubRegion
            } else {
                PebTebTagging::WholeAllocation
            },
            hypervisor_shared_data: build >= BUILD_RS4,
            cfg_bitmap: is_64bit,
        }
    }
}

impl Default for ClassifierPolicy {
    fn default() -> Self {
        Self::for_build(u32::MAX, cfg!(target_pointer_width = "64"))
    }
}

/// Sets the type of the region containing `address`, or of its allocation
/// base region when `go_to_allocation_base` is set.
///
/// Returns the region only if it was still `Unknown`; an already classified
/// region is left alone and `None` is returned.
pub fn tag(
    list: &mut MemoryRegionList,
    address: u64,
    go_to_allocation_base: bool,
    region_type: RegionType,
) -> Option<RegionId> {
    let mut id = list.lookup(address)?;

    if go_to_allocation_base {
        if let Some(base_item) = list.get(id).and_then(|region| region.allocation_base_item) {
            id = base_item;
        }
    }

    let region = list.get_mut(id)?;
    if !region.region_type.is_unknown() {
        return None;
    }
    region.region_type = region_type;
    Some(id)
}

/// Runs every classification pass.
pub fn classify<P: TargetProcess + ?Sized>(
    list: &mut MemoryRegionList,
    process: &P,
    policy: &ClassifierPolicy,
) {
    tag_fixed_addresses(list, process, policy);
    tag_peb_and_heaps(list, process, policy);
    let is_wow64 = tag_peb32_and_heaps(list, process);
    tag_threads(list, process, policy, is_wow64);
    tag_remaining(list, process);

    if policy.cfg_bitmap {
        tag_cfg_bitmaps(list, process, is_wow64);
    }
}

fn tag_fixed_addresses<P: TargetProcess + ?Sized>(
    list: &mut MemoryRegionList,
    process: &P,
    policy: &ClassifierPolicy,
) {
    tag(list, USER_SHARED_DATA, true, RegionType::UserSharedData);

    if policy.hypervisor_shared_data {
        if let Some(va) = process.hypervisor_shared_va().filter(|va| *va != 0) {
            tag(list, va, true, RegionType::HypervisorSharedData);
        }
    }
}

fn tag_peb_and_heaps<P: TargetProcess + ?Sized>(
    list: &mut MemoryRegionList,
    process: &P,
    policy: &ClassifierPolicy,
) {
    let Some(peb) = process.peb_address().filter(|peb| *peb != 0) else {
        debug!(pid = list.process_id(), "no PEB address");
        return;
    };

    tag(
        list,
        peb,
        policy.peb_teb_tagging.go_to_allocation_base(),
        RegionType::Peb,
    );

    tag_heaps_and_api_set_map(list, process, peb, PebLayout::native(), |index| {
        RegionType::Heap { index }
    });
}

/// Returns whether the target is a WOW64 process.
fn tag_peb32_and_heaps<P: TargetProcess + ?Sized>(list: &mut MemoryRegionList, process: &P) -> bool {
    let Some(peb32) = process.peb32_address().filter(|peb| *peb != 0) else {
        return false;
    };

    tag(list, peb32, true, RegionType::Peb32);
    tag_heaps_and_api_set_map(list, process, peb32, PebLayout::PEB32, |index| {
        RegionType::Heap32 { index }
    });

    true
}

fn tag_heaps_and_api_set_map<P, F>(
    list: &mut MemoryRegionList,
    process: &P,
    peb: u64,
    layout: PebLayout,
    heap_type: F,
) where
    P: TargetProcess + ?Sized,
    F: Fn(u32) -> RegionType,
{
    match read_heap_pointers(process, peb, layout) {
        Some(heaps) => {
            for (index, heap) in heaps.into_iter().enumerate() {
                if heap != 0 {
                    tag(list, heap, true, heap_type(index as u32));
                }
            }
        }
        None => trace!("could not read the heap list at PEB {:#x}", peb),
    }

    let api_set_map = read_pointer(process, peb.wrapping_add(layout.api_set_map), layout);
    if let Some(api_set_map) = api_set_map.filter(|address| *address != 0) {
        tag(list, api_set_map, true, RegionType::ApiSetMap);
    }
}

fn read_pointer<P: TargetProcess + ?Sized>(process: &P, address: u64, layout: PebLayout) -> Option<u64> {
    let mut bytes = [0u8; 8];
    let bytes = &mut bytes[..layout.pointer_size];
    process.read_exact(address, bytes).ok()?;
    layout.pointer(bytes, 0)
}

/// Reads `ProcessHeaps[0..NumberOfHeaps]` from a PEB.
fn read_heap_pointers<P: TargetProcess + ?Sized>(
    process: &P,
    peb: u64,
    layout: PebLayout,
) -> Option<Vec<u64>> {
    let count = process.read_u32(peb.wrapping_add(layout.number_of_heaps)).ok()?;
    if count >= MAX_HEAPS {
        debug!(count, "implausible heap count");
        return None;
    }

    let array = read_pointer(process, peb.wrapping_add(layout.process_heaps), layout)?;
    let mut buffer = vec![0u8; count as usize * layout.pointer_size];
    process.read_exact(array, &mut buffer).ok()?;

    Some(
        buffer
            .chunks_exact(layout.pointer_size)
            .map(|chunk| layout.pointer(chunk, 0).unwrap_or(0))
            .collect(),
    )
}

/// Reads an `NT_TIB`, 64-bit or 32-bit.
fn read_tib<P: TargetProcess + ?Sized>(process: &P, address: u64, wide: bool) -> Option<NtTib> {
    if wide {
        let mut buffer = [0u8; NtTib::SIZE];
        process.read_exact(address, &mut buffer).ok()?;
        NtTib::parse(&buffer)
    } else {
        let mut buffer = [0u8; NtTib::SIZE32];
        process.read_exact(address, &mut buffer).ok()?;
        NtTib::parse32(&buffer)
    }
}

fn tag_threads<P: TargetProcess + ?Sized>(
    list: &mut MemoryRegionList,
    process: &P,
    policy: &ClassifierPolicy,
    is_wow64: bool,
) {
    let threads = match process.threads() {
        Ok(threads) => threads,
        Err(err) => {
            debug!(pid = list.process_id(), error = %err, "thread snapshot unavailable");
            return;
        }
    };

    for thread in threads.iter().filter(|thread| thread.teb_base != 0) {
        let thread_id = thread.thread_id;

        tag(
            list,
            thread.teb_base,
            policy.peb_teb_tagging.go_to_allocation_base(),
            RegionType::Teb { thread_id },
        );

        let Some(tib) = read_tib(process, thread.teb_base, cfg!(target_pointer_width = "64")) else {
            trace!(thread_id, "could not read TIB");
            continue;
        };

        if tib.has_valid_stack() {
            tag(list, tib.stack_limit, true, RegionType::Stack { thread_id });
        } else {
            trace!(thread_id, "TIB stack bounds are not usable");
        }

        // The 64-bit TIB's ExceptionList points at the 32-bit TEB. Both TEBs
        // normally share one region, so only the 32-bit stack is tagged.
        if is_wow64 && tib.exception_list != 0 {
            let teb32 = tib.exception_list as u32 as u64;
            if let Some(tib32) = read_tib(process, teb32, false).filter(NtTib::has_valid_stack) {
                tag(list, tib32.stack_limit, true, RegionType::Stack32 { thread_id });
            }
        }
    }
}

/// Mapped file names and heap segments for whatever is still unknown.
fn tag_remaining<P: TargetProcess + ?Sized>(list: &mut MemoryRegionList, process: &P) {
    for id in list.ids() {
        let Some(region) = list.get(id) else {
            continue;
        };
        if !region.region_type.is_unknown() {
            continue;
        }

        let base = region.base_address;
        let starts_mapping = region.is_mapped_or_image() && region.allocation_base_item == Some(id);
        let readable = region.is_committed() && region.valid && !region.bad;

        if starts_mapping {
            if let Some(name) = process.mapped_file_name(base) {
                let name = process.resolve_device_path(&name).unwrap_or(name);
                if let Some(region) = list.get_mut(id) {
                    region.region_type = RegionType::MappedFile { name };
                }
                continue;
            }
        }

        if !readable {
            continue;
        }

        let mut buffer = [0u8; HEAP_SEGMENT_READ_SIZE];
        if process.read_exact(base, &mut buffer).is_err() {
            continue;
        }

        let segment_type = match heap_segment_candidate(&buffer) {
            Some(HeapSegmentCandidate::Native(heap)) => list
                .find_by_base(heap)
                .filter(|heap_id| {
                    matches!(list.get(*heap_id).map(|r| &r.region_type), Some(RegionType::Heap { .. }))
                })
                .map(|heap| RegionType::HeapSegment { heap }),
            Some(HeapSegmentCandidate::Wow64(heap)) => list
                .find_by_base(heap)
                .filter(|heap_id| {
                    matches!(list.get(*heap_id).map(|r| &r.region_type), Some(RegionType::Heap32 { .. }))
                })
                .map(|heap| RegionType::HeapSegment32 { heap }),
            None => None,
        };

        if let Some(segment_type) = segment_type {
            trace!("heap segment at {:#x}", base);
            if let Some(region) = list.get_mut(id) {
                region.region_type = segment_type;
            }
        }
    }
}

fn tag_cfg_bitmaps<P: TargetProcess + ?Sized>(
    list: &mut MemoryRegionList,
    process: &P,
    is_wow64: bool,
) {
    let Some(block_address) = process.remote_symbol("ntdll.dll", "LdrSystemDllInitBlock") else {
        debug!(pid = list.process_id(), "LdrSystemDllInitBlock not found");
        return;
    };

    let mut buffer = [0u8; SystemDllInitBlock::READ_SIZE];
    if let Err(err) = process.read_exact(block_address, &mut buffer) {
        debug!(error = %err, "could not read LdrSystemDllInitBlock");
        return;
    }

    let Some((native, wow64)) = SystemDllInitBlock::parse(&buffer)
        .and_then(|block| block.cfg_bitmaps())
    else {
        return;
    };

    if native != 0 {
        tag_allocation_run(list, native, RegionType::CfgBitmap);
    }
    if is_wow64 && wow64 != 0 {
        tag_allocation_run(list, wow64, RegionType::CfgBitmap32);
    }
}

/// Tags the region at `address` and every following region that belongs to
/// the same allocation.
fn tag_allocation_run(list: &mut MemoryRegionList, address: u64, region_type: RegionType) {
    let Some(start) = list.lookup(address) else {
        return;
    };

    let members: Vec<RegionId> = list.allocation_members(start).collect();
    for id in members {
        if let Some(region) = list.get_mut(id) {
            if region.region_type.is_unknown() {
                region.region_type = region_type.clone();
            }
        }
    }
}
