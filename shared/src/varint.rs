//! Compressed integer encoding used for counts, entity ids and timestamps
//!
//! Unsigned values use LEB128: seven data bits per byte, least significant
//! group first, with the high bit of each byte set while more groups follow.
//! Signed values are ZigZag-mapped first so small magnitudes of either sign
//! stay short (`0 → 0, -1 → 1, 1 → 2, -2 → 3, ...`).
//!
//! Decoding is strict: truncated input and encodings that do not fit the
//! requested width are rejected instead of being silently wrapped.

use crate::error::CodecError;

/// Longest LEB128 encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Appends the LEB128 encoding of `value` to `out`.
pub fn write_u64(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decodes a LEB128 value of at most `bits` significant bits.
///
/// Returns the value and the number of bytes consumed.
pub fn read_bits(input: &[u8], bits: u32) -> Result<(u64, usize), CodecError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;

    for (index, byte) in input.iter().enumerate() {
        if index >= MAX_VARINT_LEN {
            return Err(CodecError::VarintOverflow { bits });
        }

        let group = u64::from(byte & 0x7f);
        if shift >= 64 || (shift > 0 && group >> (64 - shift) != 0) {
            return Err(CodecError::VarintOverflow { bits });
        }
        value |= group << shift;

        if byte & 0x80 == 0 {
            if bits < 64 && value >> bits != 0 {
                return Err(CodecError::VarintOverflow { bits });
            }
            return Ok((value, index + 1));
        }
        shift += 7;
    }

    Err(CodecError::UnexpectedEnd)
}

/// Decodes a full-width LEB128 `u64`.
pub fn read_u64(input: &[u8]) -> Result<(u64, usize), CodecError> {
    read_bits(input, 64)
}

/// Number of bytes `value` occupies once encoded.
pub fn encoded_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        write_u64(&mut out, value);
        out
    }

    #[test]
    fn test_small_values_use_one_byte() {
        assert_eq!(encode(0), vec![0x00]);
        assert_eq!(encode(1), vec![0x01]);
        assert_eq!(encode(127), vec![0x7f]);
    }

    #[test]
    fn test_known_multi_byte_encodings() {
        assert_eq!(encode(128), vec![0x80, 0x01]);
        assert_eq!(encode(300), vec![0xac, 0x02]);
        assert_eq!(encode(16_384), vec![0x80, 0x80, 0x01]);
        assert_eq!(encode(u64::MAX).len(), MAX_VARINT_LEN);
    }

    #[test]
    fn test_encoded_len_matches_output() {
        for value in [0, 1, 127, 128, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            assert_eq!(encoded_len(value), encode(value).len(), "value {}", value);
        }
    }

    #[test]
    fn test_read_reports_consumed_bytes() {
        let mut bytes = encode(300);
        bytes.push(0xff);
        assert_eq!(read_u64(&bytes).unwrap(), (300, 2));
    }

    #[test]
    fn test_truncated_input_is_rejected() {
        assert_eq!(read_u64(&[0x80]), Err(CodecError::UnexpectedEnd));
        assert_eq!(read_u64(&[]), Err(CodecError::UnexpectedEnd));
    }

    #[test]
    fn test_value_wider_than_target_is_rejected() {
        let bytes = encode(u32::MAX as u64 + 1);
        assert_eq!(
            read_bits(&bytes, 32),
            Err(CodecError::VarintOverflow { bits: 32 })
        );
        assert_eq!(read_bits(&encode(u32::MAX as u64), 32).unwrap().0, u32::MAX as u64);
    }

    #[test]
    fn test_overlong_encoding_is_rejected() {
        let bytes = [0xff; 11];
        assert!(matches!(
            read_u64(&bytes),
            Err(CodecError::VarintOverflow { .. })
        ));
    }

    #[test]
    fn test_zigzag_mapping() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_encode(-2), 3);
        assert_eq!(zigzag_encode(i64::MIN), u64::MAX);

        for value in [0, -1, 1, -64, 64, i64::MIN, i64::MAX] {
            assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
    }
}
