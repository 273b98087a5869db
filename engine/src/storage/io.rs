//! Storage abstraction letting the engine swap real file I/O for a
//! deterministic in-memory simulation (see `simulated`).
//!
//! # Design
//!
//! Each of the MDF, VLF and SLF is an independent array of fixed-size
//! blocks. `Storage` is implemented once per physical file — a versioned
//! file descriptor holds up to three `Box<dyn Storage>` instances.

use crate::ids::BlockId;
use crate::storage::block::Block;

/// Errors a `Storage` implementation can raise.
#[derive(Debug)]
pub enum StorageError {
    Io(std::io::Error),
    BlockOutOfBounds { block_id: BlockId, total_blocks: u64 },
    InjectedFault(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::BlockOutOfBounds {
                block_id,
                total_blocks,
            } => write!(f, "{block_id} out of bounds (total blocks: {total_blocks})"),
            Self::InjectedFault(msg) => write!(f, "injected fault: {msg}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Abstraction over one physical block-array file (MDF, VLF or SLF).
///
/// # Implementation Notes
///
/// Implementations must ensure:
/// - `read_block` returns the last `write_block`-written content, or a
///   zeroed block if the block was allocated but never written;
/// - `sync` makes all previous writes durable;
/// - `allocate_blocks` extends capacity and is itself not durable until
///   the next `sync`.
pub trait Storage: Send {
    /// Read a block. Errors if `block_id >= total_blocks()`.
    fn read_block(&mut self, block_id: BlockId) -> Result<Block, StorageError>;

    /// Write a block. The write may be buffered until `sync`.
    fn write_block(&mut self, block_id: BlockId, block: &Block) -> Result<(), StorageError>;

    /// Make all prior writes durable.
    fn sync(&mut self) -> Result<(), StorageError>;

    /// Extend the file by `count` blocks, returning the id of the first new block.
    fn allocate_blocks(&mut self, count: u64) -> Result<BlockId, StorageError>;

    /// Truncate the file to exactly `total_blocks` blocks.
    fn truncate(&mut self, total_blocks: u64) -> Result<(), StorageError>;

    /// Delete the underlying physical file entirely.
    fn delete(self: Box<Self>) -> Result<(), StorageError>;

    /// Total number of blocks currently allocated.
    fn total_blocks(&self) -> u64;
}
