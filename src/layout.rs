//! Offsets and decoders for the OS structures read out of the target.
//!
//! Only the fields the classifier needs are described. Native layouts are
//! the x64 ones; the `*32` variants are what a WOW64 process sees.

use crate::utils::{read_u32_le, read_u64_le};

/// Field offsets of a PEB plus the pointer width they are read with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PebLayout {
    pub api_set_map: u64,
    pub number_of_heaps: u64,
    pub process_heaps: u64,
    pub pointer_size: usize,
}

impl PebLayout {
    pub const PEB64: PebLayout = PebLayout {
        api_set_map: 0x68,
        number_of_heaps: 0xe8,
        process_heaps: 0xf0,
        pointer_size: 8,
    };

    pub const PEB32: PebLayout = PebLayout {
        api_set_map: 0x38,
        number_of_heaps: 0x88,
        process_heaps: 0x90,
        pointer_size: 4,
    };

    /// Layout of a PEB with the same bitness as this build.
    pub const fn native() -> PebLayout {
        if cfg!(target_pointer_width = "64") {
            Self::PEB64
        } else {
            Self::PEB32
        }
    }

    /// Decodes one pointer-sized little-endian value at `offset`.
    pub fn pointer(&self, buffer: &[u8], offset: usize) -> Option<u64> {
        match self.pointer_size {
            8 => read_u64_le(buffer, offset),
            _ => read_u32_le(buffer, offset).map(u64::from),
        }
    }
}

/// Upper bound on a believable heap count.
pub const MAX_HEAPS: u32 = 1000;

/// The leading `NT_TIB` of a TEB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtTib {
    pub exception_list: u64,
    pub stack_base: u64,
    pub stack_limit: u64,
}

impl NtTib {
    pub const SIZE: usize = 24;
    pub const SIZE32: usize = 12;

    pub fn parse(buffer: &[u8]) -> Option<Self> {
        Some(Self {
            exception_list: read_u64_le(buffer, 0)?,
            stack_base: read_u64_le(buffer, 8)?,
            stack_limit: read_u64_le(buffer, 16)?,
        })
    }

    pub fn parse32(buffer: &[u8]) -> Option<Self> {
        Some(Self {
            exception_list: read_u32_le(buffer, 0)? as u64,
            stack_base: read_u32_le(buffer, 4)? as u64,
            stack_limit: read_u32_le(buffer, 8)? as u64,
        })
    }

    /// A usable stack has its limit strictly below its base.
    pub fn has_valid_stack(&self) -> bool {
        self.stack_limit < self.stack_base
    }
}

pub const HEAP_SEGMENT_SIGNATURE: u32 = 0xffee_ffee;
/// Bytes read from the start of a region to test for a heap segment.
pub const HEAP_SEGMENT_READ_SIZE: usize = 0x40;

const SEGMENT_SIGNATURE_OFFSET: usize = 0x10;
const SEGMENT_HEAP_OFFSET: usize = 0x28;
const SEGMENT32_SIGNATURE_OFFSET: usize = 0x08;
const SEGMENT32_HEAP_OFFSET: usize = 0x18;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapSegmentCandidate {
    Native(u64),
    Wow64(u64),
}

/// Looks for a `HEAP_SEGMENT` header at the start of `buffer`.
///
/// The native layout wins when its signature matches with a non-null heap
/// pointer; the 32-bit layout is only consulted otherwise.
pub fn heap_segment_candidate(buffer: &[u8]) -> Option<HeapSegmentCandidate> {
    let native = match read_u32_le(buffer, SEGMENT_SIGNATURE_OFFSET) {
        Some(HEAP_SEGMENT_SIGNATURE) => read_u64_le(buffer, SEGMENT_HEAP_OFFSET).unwrap_or(0),
        _ => 0,
    };
    if native != 0 {
        return Some(HeapSegmentCandidate::Native(native));
    }

    let wow64 = match read_u32_le(buffer, SEGMENT32_SIGNATURE_OFFSET) {
        Some(HEAP_SEGMENT_SIGNATURE) => read_u32_le(buffer, SEGMENT32_HEAP_OFFSET).unwrap_or(0),
        _ => 0,
    };
    (wow64 != 0).then_some(HeapSegmentCandidate::Wow64(wow64 as u64))
}

/// The part of ntdll's `LdrSystemDllInitBlock` that locates the CFG bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemDllInitBlock {
    pub size: u32,
    pub cfg_bitmap: u64,
    pub wow64_cfg_bitmap: u64,
}

impl SystemDllInitBlock {
    // Preceded by Wow64SharedInformation, a ULONG_PTR[16] at 0x30.
    const CFG_BITMAP_OFFSET: usize = 0xb0;
    const WOW64_CFG_BITMAP_OFFSET: usize = 0xc0;
    /// Bytes up to and including `Wow64CfgBitMap`.
    pub const READ_SIZE: usize = 0xc8;

    pub fn parse(buffer: &[u8]) -> Option<Self> {
        Some(Self {
            size: read_u32_le(buffer, 0)?,
            cfg_bitmap: read_u64_le(buffer, Self::CFG_BITMAP_OFFSET)?,
            wow64_cfg_bitmap: read_u64_le(buffer, Self::WOW64_CFG_BITMAP_OFFSET)?,
        })
    }

    /// `(native, wow64)` bitmap addresses, when this OS's block is large
    /// enough to carry them.
    pub fn cfg_bitmaps(&self) -> Option<(u64, u64)> {
        (self.size as usize >= Self::READ_SIZE).then_some((self.cfg_bitmap, self.wow64_cfg_bitmap))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_u32(buffer: &mut [u8], offset: usize, value: u32) {
        buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u64(buffer: &mut [u8], offset: usize, value: u64) {
        buffer[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn test_nt_tib_parse() {
        let mut buffer = [0u8; NtTib::SIZE];
        put_u64(&mut buffer, 0, 0xffff_ffff_ffff_ffff);
        put_u64(&mut buffer, 8, 0x20_0000);
        put_u64(&mut buffer, 16, 0x1f_c000);
        let tib = NtTib::parse(&buffer).unwrap();
        assert_eq!(tib.stack_base, 0x20_0000);
        assert_eq!(tib.stack_limit, 0x1f_c000);
        assert!(tib.has_valid_stack());
        assert!(NtTib::parse(&buffer[..16]).is_none());
    }

    #[test]
    fn test_nt_tib32_parse() {
        let mut buffer = [0u8; NtTib::SIZE32];
        put_u32(&mut buffer, 0, 0x7efd_d000);
        put_u32(&mut buffer, 4, 0x30_0000);
        put_u32(&mut buffer, 8, 0x30_0000);
        let tib = NtTib::parse32(&buffer).unwrap();
        assert_eq!(tib.exception_list, 0x7efd_d000);
        assert!(!tib.has_valid_stack());
    }

    #[test]
    fn test_heap_segment_native() {
        let mut buffer = [0u8; HEAP_SEGMENT_READ_SIZE];
        put_u32(&mut buffer, 0x10, HEAP_SEGMENT_SIGNATURE);
        put_u64(&mut buffer, 0x28, 0x2a0_0000);
        assert_eq!(
            heap_segment_candidate(&buffer),
            Some(HeapSegmentCandidate::Native(0x2a0_0000))
        );
    }

    #[test]
    fn test_heap_segment_wow64_only_without_native_pointer() {
        let mut buffer = [0u8; HEAP_SEGMENT_READ_SIZE];
        put_u32(&mut buffer, 0x08, HEAP_SEGMENT_SIGNATURE);
        put_u32(&mut buffer, 0x18, 0x50_0000);
        assert_eq!(
            heap_segment_candidate(&buffer),
            Some(HeapSegmentCandidate::Wow64(0x50_0000))
        );

        // a native match with a heap pointer takes precedence
        put_u32(&mut buffer, 0x10, HEAP_SEGMENT_SIGNATURE);
        put_u64(&mut buffer, 0x28, 0x2a0_0000);
        assert_eq!(
            heap_segment_candidate(&buffer),
            Some(HeapSegmentCandidate::Native(0x2a0_0000))
        );
    }

    #[test]
    fn test_heap_segment_no_signature() {
        let buffer = [0u8; HEAP_SEGMENT_READ_SIZE];
        assert_eq!(heap_segment_candidate(&buffer), None);
        assert_eq!(heap_segment_candidate(&buffer[..4]), None);
    }

    #[test]
    fn test_init_block_size_gate() {
        let mut buffer = [0u8; SystemDllInitBlock::READ_SIZE];
        put_u32(&mut buffer, 0, 0xf0);
        // Wow64SharedInformation entries must not be mistaken for bitmaps
        for index in 0..16 {
            put_u64(&mut buffer, 0x30 + index * 8, 0x7ffb_0000_0000 + index as u64);
        }
        put_u64(&mut buffer, 0xb0, 0x7df5_0000_0000);
        put_u64(&mut buffer, 0xc0, 0x7df4_0000_0000);
        let block = SystemDllInitBlock::parse(&buffer).unwrap();
        assert_eq!(block.cfg_bitmaps(), Some((0x7df5_0000_0000, 0x7df4_0000_0000)));

        // a block that stops short of Wow64CfgBitMap
        put_u32(&mut buffer, 0, 0xc0);
        let old = SystemDllInitBlock::parse(&buffer).unwrap();
        assert_eq!(old.cfg_bitmaps(), None);

        assert!(SystemDllInitBlock::parse(&buffer[..0xc0]).is_none());
    }

    #[test]
    fn test_native_peb_layout_follows_pointer_width() {
        #[cfg(target_pointer_width = "64")]
        assert_eq!(PebLayout::native(), PebLayout::PEB64);
        #[cfg(target_pointer_width = "32")]
        assert_eq!(PebLayout::native(), PebLayout::PEB32);
    }

    #[test]
    fn test_peb_layout_pointer_width() {
        let mut buffer = [0u8; 16];
        put_u64(&mut buffer, 0, 0x1234_5678_9abc_def0);
        assert_eq!(PebLayout::PEB64.pointer(&buffer, 0), Some(0x1234_5678_9abc_def0));
        assert_eq!(PebLayout::PEB32.pointer(&buffer, 0), Some(0x9abc_def0));
        assert_eq!(PebLayout::PEB64.pointer(&buffer, 12), None);
    }
}
