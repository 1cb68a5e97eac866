//! # Value Codecs
//!
//! A [`Codec`] converts between a typed value and its byte encoding, isolating
//! the store from value representation. The store is parametrized over a codec
//! at construction time; one storage engine serves strings, integers, or
//! custom binary blobs without runtime type dispatch.
//!
//! ## Framing Contract
//!
//! Records carry no store-level framing: the codec's encoding must be
//! self-delimiting (length-prefixed or fixed-size), and `decode` must report
//! exactly how many bytes it consumed so a sequential scan can advance to the
//! next record without the store knowing the codec's internals.
//!
//! `decode` receives a window into the file that may be shorter than the full
//! record. A codec that cannot decide yet returns [`Decoded::NeedBytes`] with
//! the total window size it needs, and the store retries with a larger window.
//! This is how variable-length encodings whose exact length is not known a
//! priori (e.g. a length prefix followed by a payload) are read without the
//! store over-fetching every time.
//!
//! ## Determinism
//!
//! `encode` must be deterministic: identical values must always encode to
//! identical bytes within one store. Byte-level record comparison
//! (`check_bytes_are_the_same`) relies on this.

use eyre::{ensure, Result};

use crate::config::LENGTH_PREFIX_SIZE;

/// Outcome of a [`Codec::decode`] attempt over a byte window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<V> {
    /// A full record was decoded from the front of the window.
    Value {
        value: V,
        /// Total encoded size of the record, including any prefix.
        consumed: usize,
    },
    /// The window is too short; retry with at least this many bytes.
    NeedBytes(usize),
}

/// Strategy object converting between a value of type `V` and its byte
/// encoding.
pub trait Codec<V>: Send + Sync {
    /// Appends the encoding of `value` to `out`.
    ///
    /// Must be deterministic for a given value.
    fn encode(&self, value: &V, out: &mut Vec<u8>) -> Result<()>;

    /// Decodes one record from the front of `bytes`, or reports how many
    /// bytes a retry needs.
    ///
    /// `offset` is the record's absolute position in the store, a hint for
    /// codecs whose framing depends on where a record sits; the built-in
    /// codecs ignore it. A decode failure on a sufficient window means the
    /// bytes are not a record; the store surfaces that as a corrupt-record
    /// error.
    fn decode(&self, bytes: &[u8], offset: u64) -> Result<Decoded<V>>;
}

fn read_length_prefix(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < LENGTH_PREFIX_SIZE {
        return None;
    }
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&bytes[..LENGTH_PREFIX_SIZE]);
    Some(u32::from_le_bytes(prefix) as usize)
}

fn write_length_prefix(len: usize, out: &mut Vec<u8>) -> Result<()> {
    ensure!(
        len <= u32::MAX as usize,
        "payload of {} bytes exceeds the u32 length prefix",
        len
    );
    out.extend_from_slice(&(len as u32).to_le_bytes());
    Ok(())
}

/// Reference codec: u32-LE length prefix followed by a UTF-8 payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec<String> for StringCodec {
    fn encode(&self, value: &String, out: &mut Vec<u8>) -> Result<()> {
        write_length_prefix(value.len(), out)?;
        out.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn decode(&self, bytes: &[u8], _offset: u64) -> Result<Decoded<String>> {
        let Some(len) = read_length_prefix(bytes) else {
            return Ok(Decoded::NeedBytes(LENGTH_PREFIX_SIZE));
        };
        let total = LENGTH_PREFIX_SIZE + len;
        if bytes.len() < total {
            return Ok(Decoded::NeedBytes(total));
        }

        let payload = &bytes[LENGTH_PREFIX_SIZE..total];
        let value = std::str::from_utf8(payload)
            .map_err(|e| eyre::eyre!("payload of {} bytes is not valid UTF-8: {}", len, e))?
            .to_owned();

        Ok(Decoded::Value {
            value,
            consumed: total,
        })
    }
}

/// u32-LE length prefix followed by the raw payload bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec<Vec<u8>> for BytesCodec {
    fn encode(&self, value: &Vec<u8>, out: &mut Vec<u8>) -> Result<()> {
        write_length_prefix(value.len(), out)?;
        out.extend_from_slice(value);
        Ok(())
    }

    fn decode(&self, bytes: &[u8], _offset: u64) -> Result<Decoded<Vec<u8>>> {
        let Some(len) = read_length_prefix(bytes) else {
            return Ok(Decoded::NeedBytes(LENGTH_PREFIX_SIZE));
        };
        let total = LENGTH_PREFIX_SIZE + len;
        if bytes.len() < total {
            return Ok(Decoded::NeedBytes(total));
        }

        Ok(Decoded::Value {
            value: bytes[LENGTH_PREFIX_SIZE..total].to_vec(),
            consumed: total,
        })
    }
}

/// Fixed-size codec: 8-byte LE integers.
///
/// Eight divides every power-of-two page size, so records written through
/// this codec tile pages exactly, making it the codec of choice for the
/// page-aligned values mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct U64Codec;

impl Codec<u64> for U64Codec {
    fn encode(&self, value: &u64, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&value.to_le_bytes());
        Ok(())
    }

    fn decode(&self, bytes: &[u8], _offset: u64) -> Result<Decoded<u64>> {
        if bytes.len() < 8 {
            return Ok(Decoded::NeedBytes(8));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes[..8]);
        Ok(Decoded::Value {
            value: u64::from_le_bytes(raw),
            consumed: 8,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<V, C: Codec<V>>(codec: &C, value: &V) -> Vec<u8> {
        let mut out = Vec::new();
        codec.encode(value, &mut out).unwrap();
        out
    }

    #[test]
    fn string_round_trip() {
        let codec = StringCodec;
        let bytes = encode(&codec, &"hello, store".to_string());

        match codec.decode(&bytes, 0).unwrap() {
            Decoded::Value { value, consumed } => {
                assert_eq!(value, "hello, store");
                assert_eq!(consumed, bytes.len());
            }
            other => panic!("expected a value, got {:?}", other),
        }
    }

    #[test]
    fn string_encoding_layout() {
        let bytes = encode(&StringCodec, &"abc".to_string());

        assert_eq!(&bytes[..4], &3u32.to_le_bytes());
        assert_eq!(&bytes[4..], b"abc");
    }

    #[test]
    fn empty_string_is_a_valid_record() {
        let codec = StringCodec;
        let bytes = encode(&codec, &String::new());

        assert_eq!(bytes.len(), LENGTH_PREFIX_SIZE);
        match codec.decode(&bytes, 0).unwrap() {
            Decoded::Value { value, consumed } => {
                assert_eq!(value, "");
                assert_eq!(consumed, LENGTH_PREFIX_SIZE);
            }
            other => panic!("expected a value, got {:?}", other),
        }
    }

    #[test]
    fn short_window_signals_needed_bytes() {
        let codec = StringCodec;
        let bytes = encode(&codec, &"a longer payload than the window".to_string());

        // Too short for the prefix itself.
        assert_eq!(
            codec.decode(&bytes[..2], 0).unwrap(),
            Decoded::NeedBytes(LENGTH_PREFIX_SIZE)
        );

        // Prefix visible, payload cut off: ask for the exact total.
        assert_eq!(
            codec.decode(&bytes[..10], 0).unwrap(),
            Decoded::NeedBytes(bytes.len())
        );
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&[0xFF, 0xFE]);

        let err = StringCodec.decode(&bytes, 0).unwrap_err();
        assert!(err.to_string().contains("UTF-8"));
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let codec = StringCodec;
        let mut bytes = encode(&codec, &"first".to_string());
        let first_len = bytes.len();
        codec.encode(&"second".to_string(), &mut bytes).unwrap();

        match codec.decode(&bytes, 0).unwrap() {
            Decoded::Value { value, consumed } => {
                assert_eq!(value, "first");
                assert_eq!(consumed, first_len);
            }
            other => panic!("expected a value, got {:?}", other),
        }
    }

    #[test]
    fn bytes_round_trip() {
        let codec = BytesCodec;
        let payload = vec![0u8, 255, 1, 254, 7];
        let bytes = encode(&codec, &payload);

        match codec.decode(&bytes, 0).unwrap() {
            Decoded::Value { value, consumed } => {
                assert_eq!(value, payload);
                assert_eq!(consumed, bytes.len());
            }
            other => panic!("expected a value, got {:?}", other),
        }
    }

    #[test]
    fn u64_is_fixed_size() {
        let codec = U64Codec;
        let bytes = encode(&codec, &0xDEAD_BEEF_u64);

        assert_eq!(bytes.len(), 8);
        assert_eq!(codec.decode(&bytes[..3], 0).unwrap(), Decoded::NeedBytes(8));
        match codec.decode(&bytes, 0).unwrap() {
            Decoded::Value { value, consumed } => {
                assert_eq!(value, 0xDEAD_BEEF);
                assert_eq!(consumed, 8);
            }
            other => panic!("expected a value, got {:?}", other),
        }
    }

    #[test]
    fn encode_is_deterministic() {
        let codec = StringCodec;
        let value = "same value".to_string();

        assert_eq!(encode(&codec, &value), encode(&codec, &value));
    }
}
