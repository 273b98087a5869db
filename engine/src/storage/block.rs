//! Block types shared by the MDF, VLF and SLF.
//!
//! A block is the fixed-size unit of I/O for all three physical files; the
//! version-log record format (§3) is identical whether the block lives in
//! the MDF or the VLF.

use crate::config::StorageStrategy;
use crate::ids::{BlockId, Timestamp};

/// Category stored in a block's header, distinguishing version records from
/// the structural blocks (PBCT nodes/leaves, file header, free-list nodes).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BlockCategory {
    /// The oldest surviving version of a page (only valid inside the MDF).
    FirstVersion = 0x01,
    /// A version neither oldest nor newest in its chain.
    Intermediate = 0x02,
    /// The newest version of a page.
    Latest = 0x03,
    /// Interior PBCT node.
    PbctNode = 0x04,
    /// PBCT leaf.
    PbctLeaf = 0x05,
    /// One of the three multiplexed file-header replicas.
    FileHeader = 0x06,
    /// A block on the VLF free list.
    FreeListBlock = 0x07,
    /// An SLF pre-image of an MDF block about to be overwritten by `sync`.
    PreImage = 0x08,
}

impl TryFrom<u8> for BlockCategory {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::FirstVersion),
            0x02 => Ok(Self::Intermediate),
            0x03 => Ok(Self::Latest),
            0x04 => Ok(Self::PbctNode),
            0x05 => Ok(Self::PbctLeaf),
            0x06 => Ok(Self::FileHeader),
            0x07 => Ok(Self::FreeListBlock),
            0x08 => Ok(Self::PreImage),
            _ => Err(value),
        }
    }
}

/// The header common to every block, per the §6 file format.
///
/// ```text
/// offset 0 : category              (1 byte)
/// offset 1 : flags                 (1 byte)
/// offset 2 : reserved               (2 bytes)
/// offset 4 : last-modification-ts  (8 bytes, little-endian)
/// offset 12: older-block-id        (8 bytes)
/// offset 20: older-timestamp       (8 bytes)
/// ```
#[derive(Debug, Clone, Copy)]
pub struct BlockHeader {
    pub category: BlockCategory,
    pub flags: u8,
    pub last_modification: Timestamp,
    pub older_block_id: BlockId,
    pub older_timestamp: Timestamp,
}

impl BlockHeader {
    pub const SIZE: usize = 28;

    #[must_use]
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.category as u8;
        buf[1] = self.flags;
        buf[4..12].copy_from_slice(&self.last_modification.get().to_le_bytes());
        buf[12..20].copy_from_slice(&self.older_block_id.get().to_le_bytes());
        buf[20..28].copy_from_slice(&self.older_timestamp.get().to_le_bytes());
        buf
    }

    /// # Errors
    /// Returns `BlockError::InvalidCategory` if byte 0 is not a recognized category.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BlockError> {
        let category = BlockCategory::try_from(bytes[0]).map_err(BlockError::InvalidCategory)?;
        let flags = bytes[1];
        let last_modification = Timestamp::new(u64::from_le_bytes(
            bytes[4..12].try_into().expect("slice is 8 bytes"),
        ));
        let older_block_id = BlockId::new(u64::from_le_bytes(
            bytes[12..20].try_into().expect("slice is 8 bytes"),
        ));
        let older_timestamp = Timestamp::new(u64::from_le_bytes(
            bytes[20..28].try_into().expect("slice is 8 bytes"),
        ));
        Ok(Self {
            category,
            flags,
            last_modification,
            older_block_id,
            older_timestamp,
        })
    }
}

/// A raw, owned block buffer: header plus payload, laid out contiguously.
///
/// The block size is a per-file runtime constant (§6), so unlike the
/// teacher's fixed-size page buffer, blocks here are heap allocated with a
/// caller-chosen length.
#[derive(Clone)]
pub struct Block {
    data: Box<[u8]>,
}

impl Block {
    /// Allocate a zeroed block of `block_size` bytes.
    #[must_use]
    pub fn zeroed(block_size: usize) -> Self {
        Self {
            data: vec![0u8; block_size].into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: data.into_boxed_slice(),
        }
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// # Errors
    /// See [`BlockHeader::from_bytes`].
    pub fn header(&self) -> Result<BlockHeader, BlockError> {
        BlockHeader::from_bytes(&self.data)
    }

    pub fn set_header(&mut self, header: BlockHeader) {
        self.data[..BlockHeader::SIZE].copy_from_slice(&header.to_bytes());
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.data[BlockHeader::SIZE..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[BlockHeader::SIZE..]
    }
}

impl std::fmt::Debug for Block {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Block")
            .field("len", &self.data.len())
            .finish_non_exhaustive()
    }
}

/// Usable payload length for a given `StorageStrategy`.
#[must_use]
pub fn payload_len(strategy: &StorageStrategy) -> usize {
    strategy.block_size - BlockHeader::SIZE
}

#[derive(Debug)]
pub enum BlockError {
    InvalidCategory(u8),
}

impl std::fmt::Display for BlockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidCategory(v) => write!(f, "invalid block category: 0x{v:02x}"),
        }
    }
}

impl std::error::Error for BlockError {}
