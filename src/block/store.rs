use std::io::Write;

use byteorder::{BigEndian, ByteOrder};
use log::{debug, trace};

use super::meta::{Meta, DATA_START, MAGIC, MAGIC_SIZE, META_SIZE};
use super::{Block, BlockType, Version};
use crate::errdata;
use crate::error::{Error, Result};
use crate::file::{ByteStore, ByteStoreFactory};
use crate::pool::BufferPool;

// Smallest geometry that leaves room for a chained header and one payload
// byte.
const MIN_BLOCK_SIZE: u16 = 8;

/// A fixed-size block allocator over a positioned byte store.
///
/// The file starts with a 16-byte magic tag and a 104-byte metadata record;
/// blocks follow at `128 + block_size * idx`. Block 0 is the reserved super
/// block. Freed blocks form a singly-linked list threaded through their
/// `next` field, headed at `free_head` and tailed at `free_tail`; `acquire`
/// consumes the list head-first and extends the file when it runs dry.
///
/// The store is not internally synchronized; callers sharing one across
/// threads must wrap it.
pub struct BlockStore {
    version: Version,
    block_size: u16,
    factory: ByteStoreFactory,

    rws: Option<Box<dyn ByteStore>>,
    free_head: u32,
    free_tail: u32,
    total: u32,
    page_pool: BufferPool,
    meta_pool: BufferPool,
    prepared: bool,
}

impl BlockStore {
    /// Creates an unprepared store around a byte-store factory. Call
    /// `create` or `open` before any other operation.
    pub fn new(factory: ByteStoreFactory) -> Self {
        Self {
            version: super::V1_0_0,
            block_size: 0,
            factory,
            rws: None,
            free_head: 0,
            free_tail: 0,
            total: 0,
            page_pool: BufferPool::new(0),
            meta_pool: BufferPool::new(META_SIZE),
            prepared: false,
        }
    }

    /// Initializes a fresh file: magic, metadata with an empty free list,
    /// and the super block at index 0. The byte store must be empty.
    pub fn create(&mut self, version: Version, block_size: u16) -> Result<()> {
        if block_size < MIN_BLOCK_SIZE {
            return Err(Error::InvariantViolation(format!(
                "block size must be at least {MIN_BLOCK_SIZE}"
            )));
        }
        self.version = version;
        self.block_size = block_size;
        self.rws = Some((self.factory)()?);
        if self.rws()?.len()? != 0 {
            return Err(Error::Exists);
        }
        self.rws()?.write_at(0, &MAGIC)?;
        self.sync_meta()?;
        self.page_pool = BufferPool::new(block_size as usize);
        // The super block is permanent and never enters the free list.
        self.put_page(0, BlockType::Super, 0, &[])?;
        self.prepared = true;
        debug!("created block store {version}, block size {block_size}");
        Ok(())
    }

    /// Reads back an existing file: the magic must match and the version
    /// must equal the supported version exactly.
    pub fn open(&mut self) -> Result<()> {
        self.rws = Some((self.factory)()?);
        if self.rws()?.len()? == 0 {
            return Err(Error::NotExists);
        }
        let mut header = vec![0u8; MAGIC_SIZE + META_SIZE];
        let n = self.rws()?.read_at(0, &mut header)?;
        if n < header.len() {
            return errdata!("file header truncated at {n} bytes");
        }
        if header[..MAGIC_SIZE] != MAGIC {
            return errdata!("bad magic");
        }
        let meta = Meta::decode(&header[MAGIC_SIZE..])?;
        self.version = meta.version;
        self.block_size = meta.block_size;
        self.free_head = meta.free_head;
        self.free_tail = meta.free_tail;
        self.total = meta.total;
        self.page_pool = BufferPool::new(self.block_size as usize);
        self.prepared = true;
        debug!(
            "opened block store {}, block size {}, {} blocks",
            self.version, self.block_size, self.total
        );
        Ok(())
    }

    /// Closes the underlying byte store, if prepared.
    pub fn close(&mut self) -> Result<()> {
        if self.prepared {
            return self.rws()?.close();
        }
        Ok(())
    }

    /// The uniform per-block user payload capacity, `block_size - 7`.
    pub fn data_size(&self) -> u16 {
        self.block_size.saturating_sub(7)
    }

    /// Index of the last allocated block.
    pub fn total(&self) -> u32 {
        self.total
    }

    /// Plans a chain of blocks able to hold `len` bytes of payload. Free
    /// blocks are reused head-first; once the free list is exhausted, the
    /// remaining blocks extend the file at `total + 1, total + 2, ...` and
    /// carry the allocate mark. Each block's `next` is wired to its
    /// successor in the plan; the last block's `next` is 0. Chained when
    /// the plan spans more than one block, Single otherwise.
    ///
    /// Acquire mutates no persisted state; the plan takes effect in `put`.
    pub fn acquire(&self, len: usize) -> Result<Vec<Block>> {
        self.ensure()?;
        let data_size = self.data_size() as usize;
        let count = len.div_ceil(data_size);
        let kind = if count > 1 {
            BlockType::Chained
        } else {
            BlockType::Single
        };

        let mut blocks = Vec::with_capacity(count);
        let mut free_idx = self.free_head;
        while blocks.len() < count {
            if free_idx == 0 || free_idx == self.total + 1 {
                break;
            }
            let mut next = self.next_free(free_idx)?;
            if blocks.len() == count - 1 {
                next = 0;
            } else if next == 0 {
                // The free list runs dry mid-plan; bridge to the first
                // extension index.
                next = self.total + 1;
            }
            blocks.push(Block {
                kind,
                next,
                data: Vec::new(),
                size: self.data_size(),
                idx: free_idx,
                allocate: false,
            });
            free_idx = next;
        }

        let reused = blocks.len();
        for i in reused..count {
            let idx = self.total + (i - reused) as u32 + 1;
            let next = if i == count - 1 { 0 } else { idx + 1 };
            blocks.push(Block {
                kind,
                next,
                data: Vec::new(),
                size: self.data_size(),
                idx,
                allocate: true,
            });
        }
        Ok(blocks)
    }

    /// Writes a planned chain. Blocks are validated and persisted in input
    /// order: reused blocks must be consumed from the running free head in
    /// the order the allocator returned them, fresh blocks advance `total`.
    /// Metadata is flushed once at the end.
    pub fn put(&mut self, blocks: &[Block]) -> Result<()> {
        self.ensure()?;
        let mut free_head = self.free_head;
        for (i, block) in blocks.iter().enumerate() {
            if block.kind == BlockType::Empty {
                return Err(Error::InvariantViolation(
                    "can not put a free block".into(),
                ));
            }
            if block.kind == BlockType::Super && block.idx != 0 {
                return Err(Error::InvariantViolation(
                    "super block must be at index 0".into(),
                ));
            }
            if !block.allocate && block.idx != free_head {
                return Err(Error::InvariantViolation(format!(
                    "put must begin at the free head: block {}, head {}",
                    block.idx, free_head
                )));
            }
            // The reused block is about to be overwritten; capture its
            // free-list successor first.
            let free_next = if !block.allocate && free_head != 0 {
                self.next_free(free_head)?
            } else {
                0
            };
            self.put_page(block.idx, block.kind, block.next, &block.data)?;
            if block.allocate {
                self.total += 1;
            } else {
                free_head = free_next;
            }
            if let Some(following) = blocks.get(i + 1) {
                if following.allocate {
                    // Reuse is over; the rest of the chain is fresh
                    // extension.
                    free_head = 0;
                    self.free_tail = 0;
                }
            }
        }
        self.free_head = free_head;
        if self.free_head == 0 {
            self.free_tail = 0;
        }
        trace!(
            "put {} blocks, free head {}, total {}",
            blocks.len(),
            self.free_head,
            self.total
        );
        self.sync_meta()
    }

    /// Reads one block. The returned view's `size` is the stored payload
    /// length.
    pub fn get(&self, idx: u32) -> Result<Block> {
        self.ensure()?;
        if idx > self.total {
            return errdata!("block {idx} out of range, total {}", self.total);
        }
        let mut buf = self.page_pool.get();
        let n = self.rws()?.read_at(self.block_at(idx), &mut buf)?;
        if n < self.block_size as usize {
            return errdata!("block {idx} truncated at {n} bytes");
        }
        let kind = BlockType::try_from(buf[0])?;
        let size = BigEndian::read_u16(&buf[1..3]);
        let (next, header_len) = match kind {
            BlockType::Empty | BlockType::Chained => (BigEndian::read_u32(&buf[3..7]), 7),
            BlockType::Super | BlockType::Single => (0, 3),
        };
        if size as usize > self.block_size as usize - header_len {
            return errdata!("block {idx} payload length {size} out of range");
        }
        let data = buf[header_len..header_len + size as usize].to_vec();
        self.page_pool.put(buf);
        Ok(Block {
            kind,
            next,
            data,
            size,
            idx,
            allocate: false,
        })
    }

    /// Returns a block to the tail of the free list. The super block is
    /// protected; erasing out-of-range or already-free blocks is refused
    /// to keep the free chain acyclic.
    pub fn erase(&mut self, idx: u32) -> Result<()> {
        self.ensure()?;
        if idx == 0 {
            return Err(Error::Protected);
        }
        if idx > self.total {
            return Err(Error::InvariantViolation(format!(
                "erase of block {idx} out of range, total {}",
                self.total
            )));
        }
        let mut tag = [0u8; 1];
        self.rws()?.read_at(self.block_at(idx), &mut tag)?;
        if tag[0] == BlockType::Empty as u8 {
            return Err(Error::InvariantViolation(format!(
                "block {idx} is already free"
            )));
        }
        self.put_page(idx, BlockType::Empty, 0, &[])?;
        if self.free_tail != 0 {
            self.put_page(self.free_tail, BlockType::Empty, idx, &[])?;
        }
        self.free_tail = idx;
        if self.free_head == 0 {
            self.free_head = idx;
        }
        trace!("erased block {idx}, free list {}..{}", self.free_head, self.free_tail);
        self.sync_meta()
    }

    /// Follows a chain from `idx`: accumulates blocks while the type is
    /// Chained and `next` is nonzero.
    pub fn from(&self, idx: u32) -> Result<Vec<Block>> {
        let mut blocks = Vec::new();
        let mut i = idx;
        loop {
            let block = self.get(i)?;
            let (kind, next) = (block.kind, block.next);
            blocks.push(block);
            if kind != BlockType::Chained || next == 0 {
                break;
            }
            if blocks.len() > self.total as usize {
                return errdata!("chain from block {idx} does not terminate");
            }
            i = next;
        }
        Ok(blocks)
    }

    /// Copies the payloads of the chain starting at `idx`, in order, into
    /// `w`. Returns the traversed blocks.
    pub fn write_to<W: Write>(&self, w: &mut W, idx: u32) -> Result<Vec<Block>> {
        let blocks = self.from(idx)?;
        for block in &blocks {
            w.write_all(&block.data)?;
        }
        Ok(blocks)
    }

    /// Rewrites an existing, already-owned block in place. Used for blocks
    /// whose content changes after they left the free list (e.g. a dirty
    /// tree node); such rewrites cannot flow through `put`, whose contract
    /// only admits free-head reuse and fresh extension. Metadata is
    /// unaffected.
    pub fn update(&mut self, block: &Block) -> Result<()> {
        self.ensure()?;
        if block.kind == BlockType::Empty {
            return Err(Error::InvariantViolation(
                "blocks are freed through erase, not update".into(),
            ));
        }
        if block.kind == BlockType::Super && block.idx != 0 {
            return Err(Error::InvariantViolation(
                "super block must be at index 0".into(),
            ));
        }
        if block.idx > self.total {
            return Err(Error::InvariantViolation(format!(
                "update of block {} out of range, total {}",
                block.idx, self.total
            )));
        }
        self.put_page(block.idx, block.kind, block.next, &block.data)
    }

    /// Writes one full-width block slot: type byte, payload length, `next`
    /// for Empty and Chained types, payload, zero padding.
    fn put_page(&mut self, idx: u32, kind: BlockType, next: u32, data: &[u8]) -> Result<()> {
        let header_len = match kind {
            BlockType::Empty | BlockType::Chained => 7,
            BlockType::Super | BlockType::Single => 3,
        };
        let max = self.block_size as usize - header_len;
        if data.len() > max {
            return Err(Error::PayloadTooLarge(max));
        }
        let mut buf = self.page_pool.get();
        buf[0] = kind as u8;
        BigEndian::write_u16(&mut buf[1..3], data.len() as u16);
        if header_len == 7 {
            BigEndian::write_u32(&mut buf[3..7], next);
        }
        buf[header_len..header_len + data.len()].copy_from_slice(data);
        self.rws()?.write_at(self.block_at(idx), &buf)?;
        self.page_pool.put(buf);
        Ok(())
    }

    /// Reads the free-list successor of the Empty block at `idx`.
    fn next_free(&self, idx: u32) -> Result<u32> {
        let mut header = [0u8; 7];
        let n = self.rws()?.read_at(self.block_at(idx), &mut header)?;
        if n < header.len() {
            return errdata!("free block {idx} truncated");
        }
        if header[0] != BlockType::Empty as u8 {
            return Err(Error::InvariantViolation(format!(
                "block {idx} is not on the free list"
            )));
        }
        Ok(BigEndian::read_u32(&header[3..7]))
    }

    /// Writes the 104-byte metadata record at offset 16.
    fn sync_meta(&self) -> Result<()> {
        let meta = Meta {
            block_size: self.block_size,
            free_head: self.free_head,
            free_tail: self.free_tail,
            total: self.total,
            version: self.version,
        };
        let mut buf = self.meta_pool.get();
        meta.encode(&mut buf)?;
        self.rws()?.write_at(MAGIC_SIZE as u64, &buf)?;
        self.meta_pool.put(buf);
        Ok(())
    }

    fn block_at(&self, idx: u32) -> u64 {
        DATA_START + self.block_size as u64 * idx as u64
    }

    fn ensure(&self) -> Result<()> {
        if !self.prepared {
            return Err(Error::NotPrepared);
        }
        Ok(())
    }

    fn rws(&self) -> Result<&dyn ByteStore> {
        self.rws.as_deref().ok_or(Error::NotPrepared)
    }
}
