//! Little-endian encoding helpers for on-page structures.
//!
//! Every persisted structure in the engine (rollback segment headers, undo
//! log segment headers, undo records) is hand-encoded through these helpers
//! so that the byte layout is explicit at every call site.

/// Append a `u8`.
#[inline]
pub fn append_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

/// Append a `u16` in little-endian order.
#[inline]
pub fn append_u16_le(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append a `u32` in little-endian order.
#[inline]
pub fn append_u32_le(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Append a `u64` in little-endian order.
#[inline]
pub fn append_u64_le(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// Read a `u8` at `at`. Returns `None` on short input.
#[inline]
#[must_use]
pub fn read_u8(buf: &[u8], at: usize) -> Option<u8> {
    buf.get(at).copied()
}

/// Read a little-endian `u16` at `at`. Returns `None` on short input.
#[inline]
#[must_use]
pub fn read_u16_le(buf: &[u8], at: usize) -> Option<u16> {
    let bytes = buf.get(at..at + 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Read a little-endian `u32` at `at`. Returns `None` on short input.
#[inline]
#[must_use]
pub fn read_u32_le(buf: &[u8], at: usize) -> Option<u32> {
    let bytes = buf.get(at..at + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Read a little-endian `u64` at `at`. Returns `None` on short input.
#[inline]
#[must_use]
pub fn read_u64_le(buf: &[u8], at: usize) -> Option<u64> {
    let bytes = buf.get(at..at + 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Some(u64::from_le_bytes(raw))
}

/// Write `v` into `buf` at `at` as little-endian `u16`.
///
/// # Panics
///
/// Panics if `buf` is too short; page buffers are fixed-size and callers
/// write only at offsets they have validated.
#[inline]
pub fn put_u16_le(buf: &mut [u8], at: usize, v: u16) {
    buf[at..at + 2].copy_from_slice(&v.to_le_bytes());
}

/// Write `v` into `buf` at `at` as little-endian `u32`.
#[inline]
pub fn put_u32_le(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

/// Write `v` into `buf` at `at` as little-endian `u64`.
#[inline]
pub fn put_u64_le(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

/// Append an unsigned LEB128 varint.
pub fn write_varint(buf: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Read an unsigned LEB128 varint at `at`.
///
/// Returns `(value, bytes_consumed)`, or `None` if the input is truncated
/// or the varint is longer than 10 bytes.
#[must_use]
pub fn read_varint(buf: &[u8], at: usize) -> Option<(u64, usize)> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    for (i, &byte) in buf.get(at..)?.iter().enumerate() {
        if i >= 10 {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// Number of bytes `write_varint` would emit for `v`.
#[must_use]
pub fn varint_len(v: u64) -> usize {
    let bits = 64 - v.max(1).leading_zeros() as usize;
    bits.div_ceil(7)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixed_width_round_trip() {
        let mut buf = Vec::new();
        append_u8(&mut buf, 0xab);
        append_u16_le(&mut buf, 0x1234);
        append_u32_le(&mut buf, 0xdead_beef);
        append_u64_le(&mut buf, u64::MAX - 7);
        assert_eq!(read_u8(&buf, 0), Some(0xab));
        assert_eq!(read_u16_le(&buf, 1), Some(0x1234));
        assert_eq!(read_u32_le(&buf, 3), Some(0xdead_beef));
        assert_eq!(read_u64_le(&buf, 7), Some(u64::MAX - 7));
    }

    #[test]
    fn test_reads_fail_on_short_input() {
        let buf = [0u8; 3];
        assert_eq!(read_u32_le(&buf, 0), None);
        assert_eq!(read_u16_le(&buf, 2), None);
        assert_eq!(read_u64_le(&buf, 0), None);
        assert_eq!(read_u8(&buf, 3), None);
    }

    #[test]
    fn test_put_overwrites_in_place() {
        let mut page = vec![0u8; 16];
        put_u16_le(&mut page, 2, 0xbeef);
        put_u32_le(&mut page, 4, 7);
        put_u64_le(&mut page, 8, 42);
        assert_eq!(read_u16_le(&page, 2), Some(0xbeef));
        assert_eq!(read_u32_le(&page, 4), Some(7));
        assert_eq!(read_u64_le(&page, 8), Some(42));
    }

    #[test]
    fn test_varint_truncated_input() {
        // Continuation bit set, but nothing follows.
        assert_eq!(read_varint(&[0x80], 0), None);
        assert_eq!(read_varint(&[], 0), None);
    }

    #[test]
    fn test_varint_len_matches_encoding() {
        for v in [0u64, 1, 127, 128, 16_383, 16_384, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(&mut buf, v);
            assert_eq!(buf.len(), varint_len(v), "varint_len mismatch for {v}");
        }
    }

    proptest! {
        #[test]
        fn prop_varint_round_trip(v in any::<u64>(), prefix in 0usize..4) {
            let mut buf = vec![0u8; prefix];
            write_varint(&mut buf, v);
            let (decoded, used) = read_varint(&buf, prefix).expect("decode");
            prop_assert_eq!(decoded, v);
            prop_assert_eq!(used, buf.len() - prefix);
        }
    }
}
