use std::cmp::Ordering;

use crate::errdata;
use crate::error::{Error, Result};

/// The capability a tree element provides: total order, a serialized
/// size, and a byte form bounded by the node's per-element cap.
pub trait Element: Ord + Clone {
    /// Serialized length in bytes. The overflow predicate sums this.
    fn size(&self) -> usize;

    /// Appends the element's byte form to `buf`. Fails with
    /// `PayloadTooLarge` when the form exceeds `cap`.
    fn encode(&self, cap: usize, buf: &mut Vec<u8>) -> Result<()>;

    /// Parses an element from exactly its byte span.
    fn decode(bytes: &[u8]) -> Result<Self>;
}

/// A key/value pair, the concrete element indexed by the tree. Ordering
/// and equality consider the key only, so a value-less probe compares
/// equal to the stored pair.
///
/// Byte form: key length (u8), key, value. Keys are capped at 255 bytes.
#[derive(Debug, Clone)]
pub struct Pair {
    key: Vec<u8>,
    val: Vec<u8>,
}

impl Pair {
    pub fn new(key: impl Into<Vec<u8>>, val: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            val: val.into(),
        }
    }

    /// A key-only pair for lookups and deletes.
    pub fn probe(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            val: Vec::new(),
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.val
    }

    pub fn into_value(self) -> Vec<u8> {
        self.val
    }
}

impl PartialEq for Pair {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Pair {}

impl PartialOrd for Pair {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pair {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl Element for Pair {
    fn size(&self) -> usize {
        1 + self.key.len() + self.val.len()
    }

    fn encode(&self, cap: usize, buf: &mut Vec<u8>) -> Result<()> {
        if self.key.len() > u8::MAX as usize {
            return Err(Error::PayloadTooLarge(u8::MAX as usize));
        }
        if self.size() > cap {
            return Err(Error::PayloadTooLarge(cap));
        }
        buf.push(self.key.len() as u8);
        buf.extend_from_slice(&self.key);
        buf.extend_from_slice(&self.val);
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let key_len = *bytes
            .first()
            .ok_or_else(|| Error::Malformed("empty pair".into()))? as usize;
        if bytes.len() < 1 + key_len {
            return errdata!("pair key truncated: want {key_len} bytes, have {}", bytes.len() - 1);
        }
        Ok(Self {
            key: bytes[1..1 + key_len].to_vec(),
            val: bytes[1 + key_len..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_round_trip() {
        let pair = Pair::new("name", "ember");
        assert_eq!(pair.size(), 10);

        let mut buf = Vec::new();
        pair.encode(64, &mut buf).expect("encode failed");
        assert_eq!(buf.len(), pair.size());

        let decoded = Pair::decode(&buf).expect("decode failed");
        assert_eq!(decoded.key(), b"name");
        assert_eq!(decoded.value(), b"ember");
    }

    #[test]
    fn test_pair_orders_by_key_only() {
        let a = Pair::new("aa", "zzzz");
        let b = Pair::new("bb", "aaaa");
        assert!(a < b);
        assert_eq!(a, Pair::probe("aa"));
    }

    #[test]
    fn test_encode_respects_cap() {
        let pair = Pair::new("key", "a long value that will not fit");
        assert_eq!(
            pair.encode(8, &mut Vec::new()),
            Err(Error::PayloadTooLarge(8))
        );
    }

    #[test]
    fn test_decode_truncated() {
        assert!(matches!(Pair::decode(&[]), Err(Error::Malformed(_))));
        assert!(matches!(Pair::decode(&[5, b'a']), Err(Error::Malformed(_))));
    }
}
