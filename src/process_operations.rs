//! The boundary between the region provider and the operating system.
//!
//! [`TargetProcess`] is everything the enumerator, classifier and sampler
//! need from an opened process; [`ProcessOpener`] produces one from a pid.
//! The Windows backend implements both on top of windows-sys; tests use an
//! in-memory process.

use tracing::{debug, warn};

use crate::classifier::{self, ClassifierPolicy};
use crate::enumerator;
use crate::error::{RegionError, Result};
use crate::memory::{BasicInfo, WorkingSetBlock, WorkingSetExEntry};
use crate::region_list::MemoryRegionList;
use crate::working_set::{self, WorkingSetStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemInfo {
    pub page_size: u64,
    pub allocation_granularity: u64,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            page_size: 0x1000,
            allocation_granularity: 0x10000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadInfo {
    pub thread_id: u32,
    pub teb_base: u64,
}

/// An opened target process.
///
/// Every method may fail for ordinary reasons (the process exited, access
/// was denied, the address is unmapped). Optional lookups answer `None`.
pub trait TargetProcess {
    fn system_info(&self) -> SystemInfo;

    /// Basic information about the region containing `address`, or `None`
    /// past the end of the address space.
    fn query_basic(&self, address: u64) -> Option<BasicInfo>;

    /// Fills in the attributes of every entry in one round trip.
    fn query_working_set_ex(&self, entries: &mut [WorkingSetExEntry]) -> Result<()>;

    /// Every resident page of the process.
    fn query_working_set(&self) -> Result<Vec<WorkingSetBlock>>;

    /// Reads target memory, returning the number of bytes copied.
    fn read_memory(&self, address: u64, buffer: &mut [u8]) -> Result<usize>;

    fn peb_address(&self) -> Option<u64>;

    /// The 32-bit PEB of a WOW64 process.
    fn peb32_address(&self) -> Option<u64>;

    fn threads(&self) -> Result<Vec<ThreadInfo>>;

    /// Native (device) path of the file mapped at `address`.
    fn mapped_file_name(&self, address: u64) -> Option<String>;

    /// Rewrites a device path into a drive-letter path.
    fn resolve_device_path(&self, path: &str) -> Option<String>;

    /// Address of an export of a module loaded in the target.
    fn remote_symbol(&self, module: &str, symbol: &str) -> Option<u64>;

    fn hypervisor_shared_va(&self) -> Option<u64>;

    /// Reads exactly `buffer.len()` bytes.
    fn read_exact(&self, address: u64, buffer: &mut [u8]) -> Result<()> {
        let actual = self.read_memory(address, buffer)?;
        if actual != buffer.len() {
            return Err(RegionError::PartialRead {
                address,
                expected: buffer.len(),
                actual,
            });
        }
        Ok(())
    }

    fn read_u32(&self, address: u64) -> Result<u32> {
        let mut bytes = [0u8; 4];
        self.read_exact(address, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn read_u64(&self, address: u64) -> Result<u64> {
        let mut bytes = [0u8; 8];
        self.read_exact(address, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessAccess {
    /// Query information and read memory.
    QueryAndRead,
    QueryOnly,
}

pub trait ProcessOpener {
    type Process: TargetProcess;

    fn open(&self, process_id: u32, access: ProcessAccess) -> Result<Self::Process>;
}

/// What a snapshot should compute besides the bare region walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOptions {
    pub include_free: bool,
    pub region_types: bool,
    pub working_set: Option<WorkingSetStrategy>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            include_free: true,
            region_types: true,
            working_set: None,
        }
    }
}

pub struct ProcessOperations<O> {
    opener: O,
    policy: ClassifierPolicy,
}

impl<O: ProcessOpener> ProcessOperations<O> {
    pub fn new(opener: O, policy: ClassifierPolicy) -> Self {
        Self { opener, policy }
    }

    pub fn policy(&self) -> &ClassifierPolicy {
        &self.policy
    }

    /// Opens with query and read rights, falling back to query-only.
    pub fn open_process(&self, process_id: u32) -> Result<O::Process> {
        match self.opener.open(process_id, ProcessAccess::QueryAndRead) {
            Ok(process) => Ok(process),
            Err(err) => {
                debug!(pid = process_id, error = %err, "full access denied, retrying query-only");
                self.opener
                    .open(process_id, ProcessAccess::QueryOnly)
                    .map_err(|err| {
                        warn!(pid = process_id, error = %err, "failed to open process");
                        RegionError::OpenFailed {
                            pid: process_id,
                            source: Box::new(err),
                        }
                    })
            }
        }
    }

    /// Takes one point-in-time snapshot of a process's address space.
    pub fn query_memory_regions(
        &self,
        process_id: u32,
        options: &QueryOptions,
    ) -> Result<MemoryRegionList> {
        let process = self.open_process(process_id)?;
        snapshot(&process, process_id, options, &self.policy)
    }
}

/// Builds a snapshot from an already opened process.
pub fn snapshot<P: TargetProcess + ?Sized>(
    process: &P,
    process_id: u32,
    options: &QueryOptions,
    policy: &ClassifierPolicy,
) -> Result<MemoryRegionList> {
    let mut list = enumerator::enumerate(process, process_id, options.include_free)?;

    if options.region_types {
        classifier::classify(&mut list, process, policy);
    }

    if let Some(strategy) = options.working_set {
        working_set::sample(&mut list, process, strategy);
    }

    debug!(pid = process_id, regions = list.len(), "memory snapshot complete");
    Ok(list)
}
