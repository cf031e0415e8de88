use byteorder::{BigEndian, ByteOrder};

use super::{Version, V1_0_0};
use crate::error::{Error, Result};

/// Length of the magic tag at offset 0.
pub const MAGIC_SIZE: usize = 16;
/// Length of the metadata record at offset 16. Only the first 20 bytes
/// carry fields; the rest is reserved zero.
pub const META_SIZE: usize = 104;
/// Offset of block 0. Blocks live at `DATA_START + block_size * idx`.
pub const DATA_START: u64 = 128;

/// The 16-byte ASCII file tag, constant across versions.
pub const MAGIC: [u8; MAGIC_SIZE] = *b"ember.blk\0\0\0\0\0\0\0";

/// The metadata record: block geometry, free-list endpoints, allocation
/// high-water mark and format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
    pub block_size: u16,
    pub free_head: u32,
    pub free_tail: u32,
    /// Index of the last allocated block, so the file length is
    /// `128 + block_size * (total + 1)`.
    pub total: u32,
    pub version: Version,
}

impl Meta {
    pub fn new(version: Version, block_size: u16) -> Self {
        Self {
            block_size,
            free_head: 0,
            free_tail: 0,
            total: 0,
            version,
        }
    }

    /// Encodes the record into `buf`, which must be exactly `META_SIZE`
    /// bytes. Reserved bytes are left as the caller provides them (the
    /// store hands in zeroed pool buffers).
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() != META_SIZE {
            return Err(Error::Malformed(format!(
                "metadata buffer must be {META_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        BigEndian::write_u16(&mut buf[0..2], self.block_size);
        BigEndian::write_u32(&mut buf[2..6], self.free_head);
        BigEndian::write_u32(&mut buf[6..10], self.free_tail);
        BigEndian::write_u32(&mut buf[10..14], self.total);
        buf[14..20].copy_from_slice(self.version.as_bytes());
        Ok(())
    }

    /// Decodes a metadata record. The version must match the supported
    /// version exactly.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_SIZE {
            return Err(Error::Malformed(format!(
                "metadata record truncated at {} bytes",
                buf.len()
            )));
        }
        let mut version = [0u8; 6];
        version.copy_from_slice(&buf[14..20]);
        let version = Version(version);
        if version != V1_0_0 {
            return Err(Error::UnsupportedVersion(version.to_string()));
        }
        Ok(Self {
            block_size: BigEndian::read_u16(&buf[0..2]),
            free_head: BigEndian::read_u32(&buf[2..6]),
            free_tail: BigEndian::read_u32(&buf[6..10]),
            total: BigEndian::read_u32(&buf[10..14]),
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_meta_round_trip() {
        let meta = Meta {
            block_size: 512,
            free_head: 3,
            free_tail: 7,
            total: 12,
            version: V1_0_0,
        };

        let mut buf = vec![0u8; META_SIZE];
        meta.encode(&mut buf).expect("Failed to encode metadata");
        assert!(buf[20..].iter().all(|b| *b == 0));

        let decoded = Meta::decode(&buf).expect("Failed to decode metadata");
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_meta_rejects_unknown_version() {
        let meta = Meta::new(V1_0_0, 512);
        let mut buf = vec![0u8; META_SIZE];
        meta.encode(&mut buf).unwrap();
        buf[15] = 9; // major 9.0.0

        match Meta::decode(&buf) {
            Err(Error::UnsupportedVersion(v)) => assert_eq!(v, "v09.00.00"),
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_meta_rejects_short_buffer() {
        assert!(matches!(
            Meta::decode(&[0u8; 32]),
            Err(Error::Malformed(_))
        ));
    }
}
