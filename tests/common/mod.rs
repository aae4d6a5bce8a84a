//! In-memory stand-in for a live process.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};

use memregions::error::{RegionError, Result};
use memregions::memory::{
    BasicInfo, WorkingSetBlock, WorkingSetExBlock, WorkingSetExEntry, MEM_COMMIT, MEM_FREE,
    MEM_IMAGE, MEM_PRIVATE, MEM_RESERVE, PAGE_READWRITE,
};
use memregions::{ProcessAccess, ProcessOpener, SystemInfo, TargetProcess, ThreadInfo};

pub const PAGE: u64 = 0x1000;
pub const GRANULARITY: u64 = 0x10000;

#[derive(Clone, Default)]
pub struct FakeProcess {
    pub system: SystemInfo,
    pub regions: Vec<BasicInfo>,
    pub memory: BTreeMap<u64, Vec<u8>>,
    pub working_set_ex: HashMap<u64, WorkingSetExBlock>,
    pub working_set: Vec<WorkingSetBlock>,
    pub fail_working_set_ex: bool,
    pub fail_working_set: bool,
    pub peb: Option<u64>,
    pub peb32: Option<u64>,
    pub threads: Vec<ThreadInfo>,
    pub fail_threads: bool,
    pub mapped_files: HashMap<u64, String>,
    pub devices: Vec<(String, String)>,
    pub symbols: HashMap<(String, String), u64>,
    pub hypervisor_va: Option<u64>,
    /// Fail queries at or above this address.
    pub query_limit: Option<u64>,
    pub working_set_ex_calls: Cell<usize>,
    pub largest_batch: Cell<usize>,
    pub queried_addresses: RefCell<Vec<u64>>,
}

impl FakeProcess {
    pub fn new() -> Self {
        Self {
            system: SystemInfo {
                page_size: PAGE,
                allocation_granularity: GRANULARITY,
            },
            ..Default::default()
        }
    }

    /// Appends a region directly after the last one.
    pub fn region(mut self, size: u64, allocation_base: Option<u64>, state: u32, kind: u32) -> Self {
        let base = self
            .regions
            .last()
            .map(|last| last.base_address + last.region_size)
            .unwrap_or(0);
        let allocation_base = allocation_base.unwrap_or(base);
        self.regions.push(BasicInfo {
            base_address: base,
            allocation_base: if state == MEM_FREE { 0 } else { allocation_base },
            allocation_protect: if state == MEM_FREE { 0 } else { PAGE_READWRITE },
            region_size: size,
            state,
            protect: if state == MEM_COMMIT { PAGE_READWRITE } else { 0 },
            kind: if state == MEM_FREE { 0 } else { kind },
        });
        self
    }

    pub fn free(self, size: u64) -> Self {
        self.region(size, None, MEM_FREE, 0)
    }

    pub fn private(self, size: u64) -> Self {
        self.region(size, None, MEM_COMMIT, MEM_PRIVATE)
    }

    /// Committed private region continuing the allocation at `allocation_base`.
    pub fn private_in(self, size: u64, allocation_base: u64) -> Self {
        self.region(size, Some(allocation_base), MEM_COMMIT, MEM_PRIVATE)
    }

    pub fn reserved_in(self, size: u64, allocation_base: u64) -> Self {
        self.region(size, Some(allocation_base), MEM_RESERVE, MEM_PRIVATE)
    }

    pub fn image(self, size: u64) -> Self {
        self.region(size, None, MEM_COMMIT, MEM_IMAGE)
    }

    /// Base address the next appended region will get.
    pub fn next_base(&self) -> u64 {
        self.regions
            .last()
            .map(|last| last.base_address + last.region_size)
            .unwrap_or(0)
    }

    pub fn write(&mut self, address: u64, bytes: &[u8]) {
        self.memory.insert(address, bytes.to_vec());
    }

    pub fn write_u32(&mut self, address: u64, value: u32) {
        self.write(address, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, address: u64, value: u64) {
        self.write(address, &value.to_le_bytes());
    }

    /// Marks every page of `[base, base + size)` resident with `block`.
    pub fn resident(&mut self, base: u64, size: u64, block: WorkingSetExBlock) {
        let mut page = base;
        while page < base + size {
            self.working_set_ex.insert(page, block);
            page += PAGE;
        }
    }

    pub fn valid_page() -> WorkingSetExBlock {
        WorkingSetExBlock {
            valid: true,
            ..Default::default()
        }
    }
}

impl TargetProcess for FakeProcess {
    fn system_info(&self) -> SystemInfo {
        self.system
    }

    fn query_basic(&self, address: u64) -> Option<BasicInfo> {
        self.queried_addresses.borrow_mut().push(address);
        if self.query_limit.is_some_and(|limit| address >= limit) {
            return None;
        }
        self.regions
            .iter()
            .find(|info| address >= info.base_address && address - info.base_address < info.region_size)
            .copied()
    }

    fn query_working_set_ex(&self, entries: &mut [WorkingSetExEntry]) -> Result<()> {
        self.working_set_ex_calls.set(self.working_set_ex_calls.get() + 1);
        self.largest_batch.set(self.largest_batch.get().max(entries.len()));
        if self.fail_working_set_ex {
            return Err(RegionError::Os {
                call: "QueryWorkingSetEx",
                code: 5,
            });
        }
        for entry in entries.iter_mut() {
            let page = entry.virtual_address & !(PAGE - 1);
            entry.attributes = self.working_set_ex.get(&page).copied().unwrap_or_default();
        }
        Ok(())
    }

    fn query_working_set(&self) -> Result<Vec<WorkingSetBlock>> {
        if self.fail_working_set {
            return Err(RegionError::Os {
                call: "QueryWorkingSet",
                code: 5,
            });
        }
        Ok(self.working_set.clone())
    }

    /// Copies from the chunk that starts at or before `address`; reads past
    /// the end of a chunk are short.
    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<usize> {
        if buffer.is_empty() {
            return Ok(0);
        }
        let Some((&start, bytes)) = self.memory.range(..=address).next_back() else {
            return Err(RegionError::Os {
                call: "ReadProcessMemory",
                code: 299,
            });
        };
        let offset = (address - start) as usize;
        if offset >= bytes.len() {
            return Err(RegionError::Os {
                call: "ReadProcessMemory",
                code: 299,
            });
        }
        let available = &bytes[offset..];
        let count = available.len().min(buffer.len());
        buffer[..count].copy_from_slice(&available[..count]);
        Ok(count)
    }

    fn peb_address(&self) -> Option<u64> {
        self.peb
    }

    fn peb32_address(&self) -> Option<u64> {
        self.peb32
    }

    fn threads(&self) -> Result<Vec<ThreadInfo>> {
        if self.fail_threads {
            return Err(RegionError::Os {
                call: "CreateToolhelp32Snapshot",
                code: 5,
            });
        }
        Ok(self.threads.clone())
    }

    fn mapped_file_name(&self, address: u64) -> Option<String> {
        self.mapped_files.get(&address).cloned()
    }

    fn resolve_device_path(&self, path: &str) -> Option<String> {
        memregions::utils::replace_device_prefix(path, &self.devices)
    }

    fn remote_symbol(&self, module: &str, symbol: &str) -> Option<u64> {
        self.symbols
            .get(&(module.to_string(), symbol.to_string()))
            .copied()
    }

    fn hypervisor_shared_va(&self) -> Option<u64> {
        self.hypervisor_va
    }
}

/// Hands out clones of a template process, optionally refusing access.
pub struct FakeOpener {
    pub process: FakeProcess,
    pub deny_full_access: bool,
    pub deny_all: bool,
    pub attempts: RefCell<Vec<ProcessAccess>>,
}

impl FakeOpener {
    pub fn new(process: FakeProcess) -> Self {
        Self {
            process,
            deny_full_access: false,
            deny_all: false,
            attempts: RefCell::new(Vec::new()),
        }
    }
}

impl ProcessOpener for FakeOpener {
    type Process = FakeProcess;

    fn open(&self, _process_id: u32, access: ProcessAccess) -> Result<FakeProcess> {
        self.attempts.borrow_mut().push(access);
        let denied = self.deny_all || (self.deny_full_access && access == ProcessAccess::QueryAndRead);
        if denied {
            return Err(RegionError::Os {
                call: "OpenProcess",
                code: 5,
            });
        }
        Ok(self.process.clone())
    }
}

impl ProcessOpener for &FakeOpener {
    type Process = FakeProcess;

    fn open(&self, process_id: u32, access: ProcessAccess) -> Result<FakeProcess> {
        (**self).open(process_id, access)
    }
}

/// Asserts bases increase, regions do not overlap and every region is
/// reachable through the index.
pub fn assert_well_formed(list: &memregions::MemoryRegionList) {
    let regions = list.regions();
    for pair in regions.windows(2) {
        assert!(
            pair[0].base_address < pair[1].base_address,
            "bases not increasing: {:#x} then {:#x}",
            pair[0].base_address,
            pair[1].base_address
        );
        assert!(
            pair[0].base_address + pair[0].region_size <= pair[1].base_address,
            "regions overlap at {:#x}",
            pair[1].base_address
        );
    }
    for (id, region) in list.iter() {
        assert_eq!(list.lookup(region.base_address), Some(id));
        if let Some(base_item) = region.allocation_base_item {
            assert_eq!(
                list.get(base_item).unwrap().base_address,
                region.allocation_base
            );
        }
    }
}
