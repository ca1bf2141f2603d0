//! Encode/decode boundary for on-disk integers.
//!
//! Every multi-byte integer stored in a page is little-endian. Plain byte
//! slices go through the `get_*`/`put_*` pair; header fields shared between
//! processes are accessed as atomics and converted with `to_le`/`from_le`.

use std::sync::atomic::{AtomicU32, AtomicU64};

#[inline]
pub fn get_u16(buf: &[u8], off: usize) -> u16 {
    let mut b = [0u8; 2];
    b.copy_from_slice(&buf[off..off + 2]);
    u16::from_le_bytes(b)
}

#[inline]
pub fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

#[inline]
pub fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

#[inline]
pub fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

#[inline]
pub fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// Reference a 4-byte aligned field of a shared mapping as an atomic.
///
/// # Safety
/// `base + off` must be 4-aligned and stay mapped for `'a`.
#[inline]
pub unsafe fn atomic_u32<'a>(base: *mut u8, off: usize) -> &'a AtomicU32 {
    debug_assert_eq!(off % 4, 0);
    &*(base.add(off) as *const AtomicU32)
}

/// Reference an 8-byte aligned field of a shared mapping as an atomic.
///
/// # Safety
/// `base + off` must be 8-aligned and stay mapped for `'a`.
#[inline]
pub unsafe fn atomic_u64<'a>(base: *mut u8, off: usize) -> &'a AtomicU64 {
    debug_assert_eq!(off % 8, 0);
    &*(base.add(off) as *const AtomicU64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_byte_order() {
        let mut buf = [0u8; 16];
        put_u32(&mut buf, 0, 0x0102_0304);
        put_u64(&mut buf, 8, 0x1122_3344_5566_7788);
        assert_eq!(&buf[..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(buf[8], 0x88);
        assert_eq!(get_u32(&buf, 0), 0x0102_0304);
        assert_eq!(get_u64(&buf, 8), 0x1122_3344_5566_7788);
        put_u16(&mut buf, 4, 0xbeef);
        assert_eq!(get_u16(&buf, 4), 0xbeef);
    }
}
