use std::num::ParseIntError;

/// Rounds `value` up to a multiple of `alignment` (a power of two).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value.wrapping_add(alignment - 1) & !(alignment - 1)
}

pub fn is_aligned(value: u64, alignment: u64) -> bool {
    value & (alignment - 1) == 0
}

/// Parses an address given as hex, with or without a `0x` prefix.
pub fn parse_address(text: &str) -> Result<u64, ParseIntError> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits: String = digits.chars().filter(|c| *c != '_' && *c != '`').collect();
    u64::from_str_radix(&digits, 16)
}

pub fn read_u32_le(buffer: &[u8], offset: usize) -> Option<u32> {
    let bytes = buffer.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes(bytes.try_into().ok()?))
}

pub fn read_u64_le(buffer: &[u8], offset: usize) -> Option<u64> {
    let bytes = buffer.get(offset..offset.checked_add(8)?)?;
    Some(u64::from_le_bytes(bytes.try_into().ok()?))
}

/// Rewrites a native device path (`\Device\HarddiskVolume2\...`) into a
/// drive-letter path using `(device, drive)` pairs such as
/// `("\Device\HarddiskVolume2", "C:")`. The device prefix is matched
/// case-insensitively and must end at a path separator.
pub fn replace_device_prefix<S: AsRef<str>>(path: &str, mappings: &[(S, S)]) -> Option<String> {
    for (device, drive) in mappings {
        let device = device.as_ref();
        if device.is_empty() {
            continue;
        }
        let Some((head, tail)) = path.split_at_checked(device.len()) else {
            continue;
        };
        if !head.eq_ignore_ascii_case(device) {
            continue;
        }
        if tail.is_empty() || tail.starts_with('\\') {
            return Some(format!("{}{}", drive.as_ref(), tail));
        }
    }
    None
}
