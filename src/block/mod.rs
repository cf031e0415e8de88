pub mod meta;
pub mod store;

pub use store::BlockStore;

use std::fmt::Display;

use byteorder::{BigEndian, ByteOrder};

use crate::error::Error;

/// On-disk block type tag, the first byte of every block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// A free block on the free list.
    Empty = 0,
    /// The reserved block at index 0. Never freed, never chained.
    Super = 1,
    /// A standalone payload block.
    Single = 2,
    /// A payload block linked to a successor through `next`.
    Chained = 3,
}

impl TryFrom<u8> for BlockType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(BlockType::Empty),
            1 => Ok(BlockType::Super),
            2 => Ok(BlockType::Single),
            3 => Ok(BlockType::Chained),
            t => Err(Error::Malformed(format!("unknown block type {t}"))),
        }
    }
}

/// An in-memory view of one block. `kind`, `next` and `data` are caller
/// facing; the index and the allocate flag are assigned by the store when
/// the block is planned by `acquire` or read by `get`.
#[derive(Debug, Clone)]
pub struct Block {
    pub kind: BlockType,
    pub next: u32,
    pub data: Vec<u8>,

    pub(crate) size: u16,
    pub(crate) idx: u32,
    pub(crate) allocate: bool,
}

impl Block {
    /// The block's index in the file. Identity: two views of the same
    /// index round-trip to equal on-disk content.
    pub fn index(&self) -> u32 {
        self.idx
    }

    /// Payload capacity on an acquire plan; actual payload length after a
    /// read.
    pub fn size(&self) -> u16 {
        self.size
    }

    /// A standalone view of an existing block, for in-place rewrites.
    pub(crate) fn single(idx: u32, data: Vec<u8>) -> Self {
        Self {
            kind: BlockType::Single,
            next: 0,
            size: data.len() as u16,
            data,
            idx,
            allocate: false,
        }
    }
}

/// A six-byte format version: three big-endian u16 fields, major.minor.patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version(pub(crate) [u8; 6]);

/// The initial and only supported format version, 1.0.0.
pub const V1_0_0: Version = Version([0, 1, 0, 0, 0, 0]);

impl Version {
    pub fn major(&self) -> u16 {
        BigEndian::read_u16(&self.0[0..2])
    }

    pub fn minor(&self) -> u16 {
        BigEndian::read_u16(&self.0[2..4])
    }

    pub fn patch(&self) -> u16 {
        BigEndian::read_u16(&self.0[4..6])
    }

    pub(crate) fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "v{:02}.{:02}.{:02}",
            self.major(),
            self.minor(),
            self.patch()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        assert_eq!(V1_0_0.to_string(), "v01.00.00");
        assert_eq!(V1_0_0.major(), 1);
        assert_eq!(V1_0_0.minor(), 0);
        assert_eq!(V1_0_0.patch(), 0);
    }

    #[test]
    fn test_block_type_round_trip() {
        for t in [
            BlockType::Empty,
            BlockType::Super,
            BlockType::Single,
            BlockType::Chained,
        ] {
            assert_eq!(BlockType::try_from(t as u8).unwrap(), t);
        }
        assert!(BlockType::try_from(9).is_err());
    }
}
