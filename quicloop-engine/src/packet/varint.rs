//! Variable-length integer encoding (RFC 9000 Section 16).

use crate::error::{Error, Result};
use bytes::BufMut;

/// Maximum value that can be encoded (2^62 - 1)
pub const MAX: u64 = (1u64 << 62) - 1;

/// Decode a varint from the front of `data`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode(data: &[u8]) -> Result<(u64, usize)> {
    let first = *data.first().ok_or(Error::BufferTooShort)?;
    let len = 1usize << (first >> 6);
    if data.len() < len {
        return Err(Error::BufferTooShort);
    }

    let mut value = (first & 0x3f) as u64;
    for byte in &data[1..len] {
        value = (value << 8) | *byte as u64;
    }
    Ok((value, len))
}

/// Append `value` to `buf` as a varint.
pub fn encode<B: BufMut>(value: u64, buf: &mut B) -> Result<usize> {
    let len = encoded_len(value);
    if value > MAX {
        return Err(Error::InvalidFrame);
    }
    if buf.remaining_mut() < len {
        return Err(Error::BufferTooShort);
    }
    match len {
        1 => buf.put_u8(value as u8),
        2 => buf.put_u16(0x4000 | value as u16),
        4 => buf.put_u32(0x8000_0000 | value as u32),
        _ => buf.put_u64(0xc000_0000_0000_0000 | value),
    }
    Ok(len)
}

/// Encoded length of a varint without encoding it.
pub fn encoded_len(value: u64) -> usize {
    if value < 64 {
        1
    } else if value < 16384 {
        2
    } else if value < 1_073_741_824 {
        4
    } else {
        8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc9000_sample_values() {
        // RFC 9000 Appendix A.1
        assert_eq!(decode(&[0x25]).unwrap(), (37, 1));
        assert_eq!(decode(&[0x7b, 0xbd]).unwrap(), (15293, 2));
        assert_eq!(decode(&[0x9d, 0x7f, 0x3e, 0x7d]).unwrap(), (494_878_333, 4));
        assert_eq!(
            decode(&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]).unwrap(),
            (151_288_809_941_952_652, 8)
        );
    }

    #[test]
    fn test_boundaries() {
        for value in [0, 63, 64, 16383, 16384, 1_073_741_823, 1_073_741_824, MAX] {
            let mut buf = Vec::new();
            let written = encode(value, &mut buf).unwrap();
            assert_eq!(written, encoded_len(value));
            assert_eq!(decode(&buf).unwrap(), (value, written));
        }
    }

    #[test]
    fn test_truncated_input() {
        assert_eq!(decode(&[]), Err(Error::BufferTooShort));
        assert_eq!(decode(&[0x40]), Err(Error::BufferTooShort));
    }

    #[test]
    fn test_encode_into_short_slice() {
        let mut storage = [0u8; 1];
        let mut slice = &mut storage[..];
        assert_eq!(encode(300, &mut slice), Err(Error::BufferTooShort));
    }
}
