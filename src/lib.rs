//! Process memory-region provider.
//!
//! Takes a point-in-time snapshot of a process's virtual address space:
//! every region in address order, indexed by base address, optionally
//! classified by role (heap, stack, TEB/PEB, mapped file, CFG bitmap, ...)
//! and annotated with working-set residency counters.
//!
//! ```no_run
//! # #[cfg(windows)]
//! # fn main() -> Result<(), memregions::RegionError> {
//! use memregions::{ProcessOperations, QueryOptions, WorkingSetStrategy};
//! use memregions::windows::{current_policy, WindowsOpener};
//!
//! let operations = ProcessOperations::new(WindowsOpener, current_policy());
//! let options = QueryOptions {
//!     working_set: Some(WorkingSetStrategy::Ex),
//!     ..QueryOptions::default()
//! };
//! let list = operations.query_memory_regions(std::process::id(), &options)?;
//! for (id, region) in list.iter() {
//!     println!("{:#x} {}", region.base_address, list.describe(id));
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(windows))]
//! # fn main() {}
//! ```

pub mod classifier;
pub mod enumerator;
pub mod error;
pub mod layout;
pub mod memory;
pub mod process_operations;
pub mod region_list;
pub mod utils;
pub mod working_set;

#[cfg(windows)]
pub mod raw_ptr;
#[cfg(windows)]
pub mod windows;

pub use classifier::{tag, ClassifierPolicy, PebTebTagging};
pub use error::RegionError;
pub use memory::{MemoryRegion, RegionId, RegionType, WorkingSetCounters};
pub use process_operations::{
    snapshot, ProcessAccess, ProcessOpener, ProcessOperations, QueryOptions, SystemInfo,
    TargetProcess, ThreadInfo,
};
pub use region_list::MemoryRegionList;
pub use working_set::WorkingSetStrategy;
