//! Region records and the raw memory-information values they are built from.
//!
//! The numeric constants mirror the values Windows reports from
//! `VirtualQueryEx` so that the platform backend can copy them straight
//! through without translation.

use serde::Serialize;
use std::fmt;

pub const MEM_COMMIT: u32 = 0x1000;
pub const MEM_RESERVE: u32 = 0x2000;
pub const MEM_FREE: u32 = 0x10000;

pub const MEM_PRIVATE: u32 = 0x20000;
pub const MEM_MAPPED: u32 = 0x40000;
pub const MEM_IMAGE: u32 = 0x100_0000;

pub const PAGE_NOACCESS: u32 = 0x01;
pub const PAGE_READONLY: u32 = 0x02;
pub const PAGE_READWRITE: u32 = 0x04;
pub const PAGE_WRITECOPY: u32 = 0x08;
pub const PAGE_EXECUTE: u32 = 0x10;
pub const PAGE_EXECUTE_READ: u32 = 0x20;
pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
pub const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;
pub const PAGE_GUARD: u32 = 0x100;
pub const PAGE_NOCACHE: u32 = 0x200;
pub const PAGE_WRITECOMBINE: u32 = 0x400;

/// One answer of a basic memory query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BasicInfo {
    pub base_address: u64,
    pub allocation_base: u64,
    pub allocation_protect: u32,
    pub region_size: u64,
    pub state: u32,
    pub protect: u32,
    pub kind: u32,
}

impl BasicInfo {
    pub fn is_free(&self) -> bool {
        self.state & MEM_FREE != 0
    }
}

/// Page attributes returned by a working-set-ex query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkingSetExBlock {
    pub valid: bool,
    pub share_count: u32,
    pub shared: bool,
    pub locked: bool,
    pub bad: bool,
}

impl WorkingSetExBlock {
    /// Decodes the `MEMORY_WORKING_SET_EX_BLOCK` bitfield.
    pub fn from_bits(bits: u64) -> Self {
        Self {
            valid: bits & 1 != 0,
            share_count: ((bits >> 1) & 0x7) as u32,
            shared: (bits >> 15) & 1 != 0,
            locked: (bits >> 22) & 1 != 0,
            bad: (bits >> 31) & 1 != 0,
        }
    }
}

/// One page of a working-set-ex request: the caller fills in the address,
/// the query fills in the attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkingSetExEntry {
    pub virtual_address: u64,
    pub attributes: WorkingSetExBlock,
}

impl WorkingSetExEntry {
    pub fn new(virtual_address: u64) -> Self {
        Self {
            virtual_address,
            attributes: WorkingSetExBlock::default(),
        }
    }
}

/// One resident page from the legacy flat working-set query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkingSetBlock {
    pub virtual_page: u64,
    pub share_count: u32,
    pub shared: bool,
}

impl WorkingSetBlock {
    /// Decodes the `MEMORY_WORKING_SET_BLOCK` bitfield.
    pub fn from_bits(bits: u64) -> Self {
        Self {
            share_count: ((bits >> 5) & 0x7) as u32,
            shared: (bits >> 8) & 1 != 0,
            virtual_page: bits >> 12,
        }
    }
}

/// Stable index of a region inside its [`MemoryRegionList`](crate::region_list::MemoryRegionList).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct RegionId(pub(crate) usize);

impl RegionId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Semantic role of a region, with the payload specific to that role.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionType {
    #[default]
    Unknown,
    Custom { text: String },
    Unusable,
    MappedFile { name: String },
    UserSharedData,
    HypervisorSharedData,
    Peb,
    Peb32,
    Teb { thread_id: u32 },
    Stack { thread_id: u32 },
    Stack32 { thread_id: u32 },
    Heap { index: u32 },
    Heap32 { index: u32 },
    HeapSegment { heap: RegionId },
    HeapSegment32 { heap: RegionId },
    CfgBitmap,
    CfgBitmap32,
    ApiSetMap,
}

impl RegionType {
    pub fn is_unknown(&self) -> bool {
        matches!(self, RegionType::Unknown)
    }
}

impl fmt::Display for RegionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionType::Unknown => Ok(()),
            RegionType::Custom { text } => f.write_str(text),
            RegionType::Unusable => f.write_str("Unusable"),
            RegionType::MappedFile { name } => f.write_str(name),
            RegionType::UserSharedData => f.write_str("USER_SHARED_DATA"),
            RegionType::HypervisorSharedData => f.write_str("HYPERVISOR_SHARED_DATA"),
            RegionType::Peb => f.write_str("PEB"),
            RegionType::Peb32 => f.write_str("32-bit PEB"),
            RegionType::Teb { thread_id } => write!(f, "TEB (thread {})", thread_id),
            RegionType::Stack { thread_id } => write!(f, "Stack (thread {})", thread_id),
            RegionType::Stack32 { thread_id } => write!(f, "32-bit stack (thread {})", thread_id),
            RegionType::Heap { index } => write!(f, "Heap (ID {})", index + 1),
            RegionType::Heap32 { index } => write!(f, "32-bit heap (ID {})", index + 1),
            RegionType::HeapSegment { .. } => f.write_str("Heap segment"),
            RegionType::HeapSegment32 { .. } => f.write_str("32-bit heap segment"),
            RegionType::CfgBitmap => f.write_str("CFG bitmap"),
            RegionType::CfgBitmap32 => f.write_str("32-bit CFG bitmap"),
            RegionType::ApiSetMap => f.write_str("ApiSetMap"),
        }
    }
}

/// Residency counters, in pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct WorkingSetCounters {
    pub total: u64,
    pub shared: u64,
    pub private: u64,
    pub shareable: u64,
    pub locked: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryRegion {
    pub base_address: u64,
    pub region_size: u64,
    pub allocation_base: u64,
    pub allocation_protect: u32,
    pub state: u32,
    pub protect: u32,
    #[serde(rename = "type")]
    pub kind: u32,
    pub region_type: RegionType,
    pub allocation_base_item: Option<RegionId>,
    pub committed_size: u64,
    pub private_size: u64,
    pub valid: bool,
    pub bad: bool,
    pub working_set: WorkingSetCounters,
}

impl MemoryRegion {
    pub fn from_basic_info(info: &BasicInfo) -> Self {
        let committed = info.state & MEM_COMMIT != 0;
        Self {
            base_address: info.base_address,
            region_size: info.region_size,
            allocation_base: info.allocation_base,
            allocation_protect: info.allocation_protect,
            state: info.state,
            protect: info.protect,
            kind: info.kind,
            region_type: RegionType::Unknown,
            allocation_base_item: None,
            committed_size: if committed { info.region_size } else { 0 },
            private_size: if committed && info.kind & MEM_PRIVATE != 0 {
                info.region_size
            } else {
                0
            },
            valid: false,
            bad: false,
            working_set: WorkingSetCounters::default(),
        }
    }

    pub fn end_address(&self) -> u64 {
        self.base_address.saturating_add(self.region_size)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address - self.base_address < self.region_size
    }

    pub fn is_committed(&self) -> bool {
        self.state & MEM_COMMIT != 0
    }

    pub fn is_free(&self) -> bool {
        self.state & MEM_FREE != 0
    }

    pub fn is_mapped_or_image(&self) -> bool {
        self.kind & (MEM_MAPPED | MEM_IMAGE) != 0
    }

    pub fn state_str(&self) -> &'static str {
        state_str(self.state)
    }

    pub fn type_str(&self) -> &'static str {
        type_str(self.kind)
    }

    pub fn protection_string(&self) -> String {
        protection_string(self.protect)
    }
}

pub fn state_str(state: u32) -> &'static str {
    if state & MEM_COMMIT != 0 {
        "Commit"
    } else if state & MEM_RESERVE != 0 {
        "Reserved"
    } else if state & MEM_FREE != 0 {
        "Free"
    } else {
        "Unknown"
    }
}

pub fn type_str(kind: u32) -> &'static str {
    if kind & MEM_PRIVATE != 0 {
        "Private"
    } else if kind & MEM_MAPPED != 0 {
        "Mapped"
    } else if kind & MEM_IMAGE != 0 {
        "Image"
    } else {
        "Unknown"
    }
}

/// Short protection string, e.g. `RW`, `RX+G`.
pub fn protection_string(protect: u32) -> String {
    if protect == 0 {
        return String::new();
    }

    let base = if protect & PAGE_NOACCESS != 0 {
        "NA"
    } else if protect & PAGE_READONLY != 0 {
        "R"
    } else if protect & PAGE_READWRITE != 0 {
        "RW"
    } else if protect & PAGE_WRITECOPY != 0 {
        "WC"
    } else if protect & PAGE_EXECUTE != 0 {
        "X"
    } else if protect & PAGE_EXECUTE_READ != 0 {
        "RX"
    } else if protect & PAGE_EXECUTE_READWRITE != 0 {
        "RWX"
    } else if protect & PAGE_EXECUTE_WRITECOPY != 0 {
        "WCX"
    } else {
        "?"
    };

    let mut s = String::from(base);
    if protect & PAGE_GUARD != 0 {
        s.push_str("+G");
    }
    if protect & PAGE_NOCACHE != 0 {
        s.push_str("+NC");
    }
    if protect & PAGE_WRITECOMBINE != 0 {
        s.push_str("+WCM");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protection_string() {
        assert_eq!(protection_string(0), "");
        assert_eq!(protection_string(PAGE_READWRITE), "RW");
        assert_eq!(protection_string(PAGE_EXECUTE_READ | PAGE_GUARD), "RX+G");
        assert_eq!(
            protection_string(PAGE_READONLY | PAGE_NOCACHE | PAGE_WRITECOMBINE),
            "R+NC+WCM"
        );
        assert_eq!(protection_string(0x800), "?");
    }

    #[test]
    fn test_state_and_type_strings() {
        assert_eq!(state_str(MEM_COMMIT), "Commit");
        assert_eq!(state_str(MEM_RESERVE), "Reserved");
        assert_eq!(state_str(MEM_FREE), "Free");
        assert_eq!(state_str(0), "Unknown");
        assert_eq!(type_str(MEM_IMAGE), "Image");
        assert_eq!(type_str(MEM_MAPPED), "Mapped");
        assert_eq!(type_str(MEM_PRIVATE), "Private");
    }

    #[test]
    fn test_working_set_ex_block_bits() {
        // valid, share count 2, shared, locked, bad
        let bits = 1 | (2 << 1) | (1 << 15) | (1 << 22) | (1 << 31);
        let block = WorkingSetExBlock::from_bits(bits);
        assert!(block.valid);
        assert_eq!(block.share_count, 2);
        assert!(block.shared);
        assert!(block.locked);
        assert!(block.bad);

        assert_eq!(WorkingSetExBlock::from_bits(0), WorkingSetExBlock::default());
    }

    #[test]
    fn test_working_set_block_bits() {
        let bits = (0x7ff6_1234u64 << 12) | (1 << 8) | (3 << 5) | 0x4;
        let block = WorkingSetBlock::from_bits(bits);
        assert_eq!(block.virtual_page, 0x7ff6_1234);
        assert_eq!(block.share_count, 3);
        assert!(block.shared);
    }

    #[test]
    fn test_committed_and_private_size() {
        let info = BasicInfo {
            base_address: 0x10000,
            allocation_base: 0x10000,
            region_size: 0x3000,
            state: MEM_COMMIT,
            kind: MEM_PRIVATE,
            ..Default::default()
        };
        let region = MemoryRegion::from_basic_info(&info);
        assert_eq!(region.committed_size, 0x3000);
        assert_eq!(region.private_size, 0x3000);

        let reserved = MemoryRegion::from_basic_info(&BasicInfo {
            state: MEM_RESERVE,
            ..info
        });
        assert_eq!(reserved.committed_size, 0);
        assert_eq!(reserved.private_size, 0);
    }

    #[test]
    fn test_contains_is_half_open() {
        let region = MemoryRegion::from_basic_info(&BasicInfo {
            base_address: 0x1000,
            region_size: 0x1000,
            ..Default::default()
        });
        assert!(region.contains(0x1000));
        assert!(region.contains(0x1fff));
        assert!(!region.contains(0x2000));
        assert!(!region.contains(0xfff));
    }

    #[test]
    fn test_region_type_display() {
        assert_eq!(RegionType::Heap { index: 0 }.to_string(), "Heap (ID 1)");
        assert_eq!(RegionType::Stack { thread_id: 42 }.to_string(), "Stack (thread 42)");
        assert_eq!(RegionType::Unknown.to_string(), "");
    }
}
