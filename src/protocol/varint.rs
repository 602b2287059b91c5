//! Variable-length integer codec used in voice packet headers
//!
//! | Prefix bits   | Bytes | Value                                   |
//! |---------------|-------|-----------------------------------------|
//! | `0xxxxxxx`    | 1     | 7-bit positive                          |
//! | `10xxxxxx`    | 2     | 14-bit positive                         |
//! | `110xxxxx`    | 3     | 21-bit positive                         |
//! | `1110xxxx`    | 4     | 28-bit positive                         |
//! | `111100__`    | 5     | 32-bit positive in the next 4 bytes     |
//! | `111101__`    | 9     | 64-bit (rejected)                       |
//! | `111110__`    | 1 + n | negative of the following varint        |
//! | `111111xx`    | 1     | `!xx`, i.e. -1 to -4                    |

use bytes::BufMut;

use crate::error::VarintError;

/// Longest encoding this codec produces (negative escape + 5-byte positive)
pub const MAX_VARINT_LEN: usize = 6;

/// Encode `value` and append it to `buf`
///
/// Supports `-(2^32)..=2^32 - 1`; anything else is out of range.
pub fn write_varint<B: BufMut>(buf: &mut B, value: i64) -> Result<usize, VarintError> {
    if value < 0 {
        let inverted = !value;
        if inverted <= 0x3 {
            buf.put_u8(0xFC | inverted as u8);
            return Ok(1);
        }
        if inverted > u32::MAX as i64 {
            return Err(VarintError::OutOfRange(value));
        }
        buf.put_u8(0xF8);
        return Ok(1 + write_positive(buf, inverted as u32));
    }

    let positive = u32::try_from(value).map_err(|_| VarintError::OutOfRange(value))?;
    Ok(write_positive(buf, positive))
}

fn write_positive<B: BufMut>(buf: &mut B, value: u32) -> usize {
    if value < 0x80 {
        buf.put_u8(value as u8);
        1
    } else if value < 0x4000 {
        buf.put_u8((value >> 8) as u8 | 0x80);
        buf.put_u8(value as u8);
        2
    } else if value < 0x20_0000 {
        buf.put_u8((value >> 16) as u8 | 0xC0);
        buf.put_u8((value >> 8) as u8);
        buf.put_u8(value as u8);
        3
    } else if value < 0x1000_0000 {
        buf.put_u8((value >> 24) as u8 | 0xE0);
        buf.put_u8((value >> 16) as u8);
        buf.put_u8((value >> 8) as u8);
        buf.put_u8(value as u8);
        4
    } else {
        buf.put_u8(0xF0);
        buf.put_u32(value);
        5
    }
}

/// Encode `value` into a fresh buffer
pub fn encode_varint(value: i64) -> Result<Vec<u8>, VarintError> {
    let mut out = Vec::with_capacity(MAX_VARINT_LEN);
    write_varint(&mut out, value)?;
    Ok(out)
}

/// Decode a varint from the front of `input`
///
/// Returns the value and the number of bytes consumed.
pub fn decode_varint(input: &[u8]) -> Result<(i64, usize), VarintError> {
    let first = first_byte(input)?;
    match first & 0xFC {
        0xFC => Ok((!((first & 0x03) as i64), 1)),
        0xF8 => {
            // The escape wraps exactly one positive form
            let (inner, len) = decode_positive(&input[1..])?;
            Ok((!inner, len + 1))
        }
        _ => decode_positive(input),
    }
}

fn decode_positive(input: &[u8]) -> Result<(i64, usize), VarintError> {
    let first = first_byte(input)?;

    if first & 0x80 == 0x00 {
        return Ok(((first & 0x7F) as i64, 1));
    }
    if first & 0xC0 == 0x80 {
        let rest = take(input, 2)?;
        return Ok(((((first & 0x3F) as i64) << 8) | rest[1] as i64, 2));
    }
    if first & 0xE0 == 0xC0 {
        let rest = take(input, 3)?;
        let value = ((first & 0x1F) as i64) << 16 | (rest[1] as i64) << 8 | rest[2] as i64;
        return Ok((value, 3));
    }
    if first & 0xF0 == 0xE0 {
        let rest = take(input, 4)?;
        let value = ((first & 0x0F) as i64) << 24
            | (rest[1] as i64) << 16
            | (rest[2] as i64) << 8
            | rest[3] as i64;
        return Ok((value, 4));
    }

    match first & 0xFC {
        0xF0 => {
            let rest = take(input, 5)?;
            let value = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]);
            Ok((value as i64, 5))
        }
        0xF4 => Err(VarintError::Unsupported64Bit),
        // 0xF8 and 0xFC: a negative form where a positive one is required
        _ => Err(VarintError::NestedNegative(first)),
    }
}

fn first_byte(input: &[u8]) -> Result<u8, VarintError> {
    input.first().copied().ok_or(VarintError::Truncated {
        needed: 1,
        available: 0,
    })
}

fn take(input: &[u8], needed: usize) -> Result<&[u8], VarintError> {
    input.get(..needed).ok_or(VarintError::Truncated {
        needed,
        available: input.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_length_table() {
        let cases: &[(i64, usize)] = &[
            (0, 1),
            (0x7F, 1),
            (0x80, 2),
            (0x3FFF, 2),
            (0x4000, 3),
            (0x1F_FFFF, 3),
            (0x20_0000, 4),
            (0x0FFF_FFFF, 4),
            (0x1000_0000, 5),
            (u32::MAX as i64, 5),
            (-1, 1),
            (-4, 1),
            (-5, 2),
        ];
        for &(value, len) in cases {
            let encoded = encode_varint(value).unwrap();
            assert_eq!(encoded.len(), len, "length of {value}");
        }
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(encode_varint(5).unwrap(), vec![0x05]);
        assert_eq!(encode_varint(0x1234).unwrap(), vec![0x92, 0x34]);
        assert_eq!(encode_varint(-1).unwrap(), vec![0xFC]);
        assert_eq!(encode_varint(-4).unwrap(), vec![0xFF]);
        assert_eq!(encode_varint(-5).unwrap(), vec![0xF8, 0x04]);
        assert_eq!(
            encode_varint(0x1234_5678).unwrap(),
            vec![0xF0, 0x12, 0x34, 0x56, 0x78]
        );
    }

    #[test]
    fn test_64_bit_rejected() {
        let input = [0xF4, 0, 0, 0, 0, 0, 0, 0, 1];
        assert_eq!(decode_varint(&input), Err(VarintError::Unsupported64Bit));
    }

    #[test]
    fn test_out_of_range() {
        assert_eq!(
            encode_varint(1 << 32),
            Err(VarintError::OutOfRange(1 << 32))
        );
    }

    #[test]
    fn test_truncated() {
        assert!(matches!(
            decode_varint(&[0xE1, 0x00]),
            Err(VarintError::Truncated { needed: 4, available: 2 })
        ));
        assert!(matches!(
            decode_varint(&[]),
            Err(VarintError::Truncated { needed: 1, .. })
        ));
    }

    #[test]
    fn test_negative_escape_does_not_nest() {
        let mut chain = vec![0xF8; 100_000];
        chain.push(0x00);
        assert_eq!(decode_varint(&chain), Err(VarintError::NestedNegative(0xF8)));
        assert_eq!(decode_varint(&[0xF8, 0xFD]), Err(VarintError::NestedNegative(0xFD)));
        assert!(matches!(
            decode_varint(&[0xF8]),
            Err(VarintError::Truncated { needed: 1, available: 0 })
        ));
        assert_eq!(decode_varint(&[0xF8, 0x04]), Ok((-5, 2)));
    }

    #[test]
    fn test_decode_ignores_trailing_bytes() {
        let (value, len) = decode_varint(&[0x92, 0x34, 0xFF, 0xFF]).unwrap();
        assert_eq!(value, 0x1234);
        assert_eq!(len, 2);
    }

    proptest! {
        #[test]
        fn prop_roundtrip(value in -(u32::MAX as i64)..=u32::MAX as i64) {
            let encoded = encode_varint(value).unwrap();
            let (decoded, len) = decode_varint(&encoded).unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(len, encoded.len());
        }
    }
}
