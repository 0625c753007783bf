//! QUIC variable-length integer codec (RFC 9000 section 16).
//!
//! The two most significant bits of the first byte select the encoded
//! length (00=1, 01=2, 10=4, 11=8 bytes); the remaining bits hold the value
//! in network byte order.

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Largest value representable as a varint (2^62 - 1).
pub const MAX: u64 = (1u64 << 62) - 1;

/// Longest possible encoding.
pub const MAX_LEN: usize = 8;

/// Number of bytes needed to encode `value`, or `None` if it exceeds [`MAX`].
pub fn encoded_len(value: u64) -> Option<usize> {
    match value {
        0..=0x3f => Some(1),
        0x40..=0x3fff => Some(2),
        0x4000..=0x3fff_ffff => Some(4),
        0x4000_0000..=MAX => Some(8),
        _ => None,
    }
}

/// Length of a varint given its first byte.
pub fn len_from_prefix(first: u8) -> usize {
    1 << (first >> 6)
}

/// Encode `value` into the front of `buf` using the shortest form.
///
/// Returns the number of bytes written.
pub fn encode(value: u64, buf: &mut [u8]) -> Result<usize> {
    let len = encoded_len(value).ok_or(Error::OutOfRange { value })?;
    if buf.len() < len {
        return Err(Error::Truncated {
            needed: len,
            available: buf.len(),
        });
    }

    let tag: u64 = match len {
        1 => 0,
        2 => 0b01,
        4 => 0b10,
        _ => 0b11,
    };
    let tagged = value | (tag << (len * 8 - 2));
    buf[..len].copy_from_slice(&tagged.to_be_bytes()[MAX_LEN - len..]);
    Ok(len)
}

/// Encode `value` into a freshly allocated vector.
pub fn encode_vec(value: u64) -> Result<Vec<u8>> {
    let mut out = [0u8; MAX_LEN];
    let len = encode(value, &mut out)?;
    Ok(out[..len].to_vec())
}

/// Decode a varint from the front of `data`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode(data: &[u8]) -> Result<(u64, usize)> {
    let Some(&first) = data.first() else {
        return Err(Error::Truncated {
            needed: 1,
            available: 0,
        });
    };

    let len = len_from_prefix(first);
    if data.len() < len {
        return Err(Error::Truncated {
            needed: len,
            available: data.len(),
        });
    }

    let mut raw = [0u8; MAX_LEN];
    raw[MAX_LEN - len..].copy_from_slice(&data[..len]);
    raw[MAX_LEN - len] &= 0x3f;
    Ok((u64::from_be_bytes(raw), len))
}

/// Encode `value` into a [`BufMut`].
pub fn encode_buf<B: BufMut>(value: u64, buf: &mut B) -> Result<()> {
    let mut out = [0u8; MAX_LEN];
    let len = encode(value, &mut out)?;
    buf.put_slice(&out[..len]);
    Ok(())
}

/// Decode a varint from a [`Buf`], advancing it past the encoding.
pub fn decode_buf<B: Buf>(buf: &mut B) -> Result<u64> {
    if !buf.has_remaining() {
        return Err(Error::Truncated {
            needed: 1,
            available: 0,
        });
    }

    let len = len_from_prefix(buf.chunk()[0]);
    if buf.remaining() < len {
        return Err(Error::Truncated {
            needed: len,
            available: buf.remaining(),
        });
    }

    let mut raw = [0u8; MAX_LEN];
    buf.copy_to_slice(&mut raw[MAX_LEN - len..]);
    raw[MAX_LEN - len] &= 0x3f;
    Ok(u64::from_be_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn rfc9000_sample_values() {
        // RFC 9000 appendix A.1
        let cases: &[(&[u8], u64)] = &[
            (&[0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c], 151_288_809_941_952_652),
            (&[0x9d, 0x7f, 0x3e, 0x7d], 494_878_333),
            (&[0x7b, 0xbd], 15_293),
            (&[0x25], 37),
        ];
        for (bytes, value) in cases {
            assert_eq!(decode(bytes).unwrap(), (*value, bytes.len()));
            assert_eq!(encode_vec(*value).unwrap(), bytes.to_vec());
        }
    }

    #[test]
    fn non_minimal_encoding_decodes() {
        // 37 in two bytes
        assert_eq!(decode(&[0x40, 0x25]).unwrap(), (37, 2));
    }

    #[test]
    fn boundaries() {
        assert_eq!(encoded_len(63), Some(1));
        assert_eq!(encoded_len(64), Some(2));
        assert_eq!(encoded_len(16_383), Some(2));
        assert_eq!(encoded_len(16_384), Some(4));
        assert_eq!(encoded_len(1_073_741_823), Some(4));
        assert_eq!(encoded_len(1_073_741_824), Some(8));
        assert_eq!(encoded_len(MAX), Some(8));
        assert_eq!(encoded_len(MAX + 1), None);
    }

    #[test]
    fn encode_out_of_range() {
        let mut buf = [0u8; 8];
        let err = encode(1 << 62, &mut buf).unwrap_err();
        assert!(matches!(err, Error::OutOfRange { value } if value == 1 << 62));
    }

    #[test]
    fn encode_short_buffer() {
        let mut buf = [0u8; 1];
        let err = encode(300, &mut buf).unwrap_err();
        assert!(matches!(
            err,
            Error::Truncated {
                needed: 2,
                available: 1
            }
        ));
    }

    #[test]
    fn decode_empty_and_truncated() {
        assert!(matches!(decode(&[]), Err(Error::Truncated { needed: 1, .. })));
        assert!(matches!(
            decode(&[0x80, 0x01]),
            Err(Error::Truncated {
                needed: 4,
                available: 2
            })
        ));
    }

    #[test]
    fn buf_helpers_advance() {
        let mut out = bytes::BytesMut::new();
        encode_buf(0x42, &mut out).unwrap();
        encode_buf(70_000, &mut out).unwrap();
        out.put_slice(b"tail");

        let mut input = out.freeze();
        assert_eq!(decode_buf(&mut input).unwrap(), 0x42);
        assert_eq!(decode_buf(&mut input).unwrap(), 70_000);
        assert_eq!(&input[..], b"tail");
    }

    proptest! {
        #[test]
        fn round_trip_is_minimal(value in 0..=MAX) {
            let encoded = encode_vec(value).unwrap();
            prop_assert_eq!(Some(encoded.len()), encoded_len(value));
            prop_assert_eq!(len_from_prefix(encoded[0]), encoded.len());
            let (decoded, used) = decode(&encoded).unwrap();
            prop_assert_eq!(decoded, value);
            prop_assert_eq!(used, encoded.len());
        }

        #[test]
        fn decode_ignores_trailing_bytes(value in 0..=MAX, tail in proptest::collection::vec(any::<u8>(), 0..16)) {
            let mut encoded = encode_vec(value).unwrap();
            let len = encoded.len();
            encoded.extend_from_slice(&tail);
            prop_assert_eq!(decode(&encoded).unwrap(), (value, len));
        }
    }
}
