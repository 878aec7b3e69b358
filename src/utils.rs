use axaddrspace::device::AccessWidth;

use crate::error::{IpacError, IpacResult};

/// Bytes covered by one access of `width`.
pub(crate) fn width_bytes(width: AccessWidth) -> usize {
    match width {
        AccessWidth::Byte => 1,
        AccessWidth::Word => 2,
        AccessWidth::Dword => 4,
        AccessWidth::Qword => 8,
    }
}

/// Checks that `[offset, offset + width)` lies inside a window of `len` bytes
/// and is naturally aligned.
pub(crate) fn check_access(offset: usize, width: AccessWidth, len: usize) -> IpacResult<()> {
    let size = width_bytes(width);
    match offset.checked_add(size) {
        Some(end) if end <= len && offset % size == 0 => Ok(()),
        _ => Err(IpacError::BadAddress),
    }
}

/// Volatile read from a mapped host address.
///
/// # Safety
///
/// `addr` must point into a live mapping valid for `width` bytes.
pub(crate) unsafe fn perform_mmio_read(addr: usize, width: AccessWidth) -> usize {
    let addr = addr as *const u8;

    match width {
        AccessWidth::Byte => addr.read_volatile() as _,
        AccessWidth::Word => (addr as *const u16).read_volatile() as _,
        AccessWidth::Dword => (addr as *const u32).read_volatile() as _,
        AccessWidth::Qword => (addr as *const u64).read_volatile() as _,
    }
}

/// Volatile write to a mapped host address.
///
/// # Safety
///
/// `addr` must point into a live, writable mapping valid for `width` bytes.
pub(crate) unsafe fn perform_mmio_write(addr: usize, width: AccessWidth, val: usize) {
    let addr = addr as *mut u8;

    match width {
        AccessWidth::Byte => addr.write_volatile(val as _),
        AccessWidth::Word => (addr as *mut u16).write_volatile(val as _),
        AccessWidth::Dword => (addr as *mut u32).write_volatile(val as _),
        AccessWidth::Qword => (addr as *mut u64).write_volatile(val as _),
    }
}

/// Parses an unsigned integer the way C's `%i` does: `0x` prefix for hex,
/// anything else decimal.
pub(crate) fn parse_auto(text: &str) -> Option<u64> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => parse_hex(hex),
        None => parse_dec(text),
    }
}

pub(crate) fn parse_dec(text: &str) -> Option<u64> {
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse().ok()
}

/// Hex with an optional `0x` prefix.
pub(crate) fn parse_hex(text: &str) -> Option<u64> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_bounds() {
        assert!(check_access(0, AccessWidth::Word, 2).is_ok());
        assert_eq!(check_access(1, AccessWidth::Word, 4), Err(IpacError::BadAddress));
        assert_eq!(check_access(4, AccessWidth::Dword, 6), Err(IpacError::BadAddress));
        assert_eq!(check_access(usize::MAX, AccessWidth::Byte, 8), Err(IpacError::BadAddress));
    }

    #[test]
    fn number_forms() {
        assert_eq!(parse_auto("0x9000"), Some(0x9000));
        assert_eq!(parse_auto("36864"), Some(36864));
        assert_eq!(parse_auto("-1"), None);
        assert_eq!(parse_hex("fc00"), Some(0xfc00));
        assert_eq!(parse_hex("0x"), None);
        assert_eq!(parse_dec("3a"), None);
    }

    #[test]
    fn volatile_access_on_local_buffer() {
        let mut buf = [0u32; 2];
        let base = buf.as_mut_ptr() as usize;
        unsafe {
            perform_mmio_write(base + 4, AccessWidth::Dword, 0xdead_beef);
            assert_eq!(perform_mmio_read(base + 4, AccessWidth::Dword), 0xdead_beef);
            perform_mmio_write(base, AccessWidth::Word, 0x1234);
            assert_eq!(perform_mmio_read(base, AccessWidth::Word), 0x1234);
        }
        assert_eq!(buf[1], 0xdead_beef);
    }
}
