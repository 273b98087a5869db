//! Real file-backed `Storage` implementation for the MDF/VLF/SLF.

use std::fs::{File, OpenOptions};
#[cfg(not(unix))]
use std::io::{Seek, SeekFrom, Write};
#[cfg(unix)]
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use crate::ids::BlockId;
use crate::storage::block::Block;
use crate::storage::io::{Storage, StorageError};

/// A block-array file with pread/pwrite-based I/O.
pub struct FileStorage {
    file: File,
    path: PathBuf,
    block_size: usize,
    total_blocks: u64,
}

impl FileStorage {
    /// Create a new, empty block-array file.
    ///
    /// # Errors
    /// Returns `StorageError::Io` if the file already exists or cannot be created.
    pub fn create(path: &Path, block_size: usize) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_size,
            total_blocks: 0,
        })
    }

    /// Open an existing block-array file.
    ///
    /// # Errors
    /// Returns `StorageError::Io` if the file cannot be opened.
    pub fn open(path: &Path, block_size: usize) -> Result<Self, StorageError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let total_blocks = len / block_size as u64;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_size,
            total_blocks,
        })
    }

    fn offset(&self, block_id: BlockId) -> u64 {
        block_id.get() * self.block_size as u64
    }

    fn check_bounds(&self, block_id: BlockId) -> Result<(), StorageError> {
        if block_id.get() >= self.total_blocks {
            return Err(StorageError::BlockOutOfBounds {
                block_id,
                total_blocks: self.total_blocks,
            });
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn read_block(&mut self, block_id: BlockId) -> Result<Block, StorageError> {
        self.check_bounds(block_id)?;
        let mut buf = vec![0u8; self.block_size];
        let offset = self.offset(block_id);
        #[cfg(unix)]
        self.file.read_exact_at(&mut buf, offset)?;
        #[cfg(not(unix))]
        {
            self.file.seek(SeekFrom::Start(offset))?;
            std::io::Read::read_exact(&mut self.file, &mut buf)?;
        }
        Ok(Block::from_bytes(buf))
    }

    fn write_block(&mut self, block_id: BlockId, block: &Block) -> Result<(), StorageError> {
        self.check_bounds(block_id)?;
        let offset = self.offset(block_id);
        #[cfg(unix)]
        self.file.write_all_at(block.as_bytes(), offset)?;
        #[cfg(not(unix))]
        {
            self.file.seek(SeekFrom::Start(offset))?;
            self.file.write_all(block.as_bytes())?;
        }
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.file.sync_all()?;
        Ok(())
    }

    fn allocate_blocks(&mut self, count: u64) -> Result<BlockId, StorageError> {
        let first = self.total_blocks;
        let new_total = self.total_blocks + count;
        self.file
            .set_len(new_total * self.block_size as u64)?;
        self.total_blocks = new_total;
        Ok(BlockId::new(first))
    }

    fn truncate(&mut self, total_blocks: u64) -> Result<(), StorageError> {
        self.file.set_len(total_blocks * self.block_size as u64)?;
        self.total_blocks = total_blocks;
        Ok(())
    }

    fn delete(self: Box<Self>) -> Result<(), StorageError> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    fn total_blocks(&self) -> u64 {
        self.total_blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::block::{Block, BlockCategory, BlockHeader};
    use crate::ids::Timestamp;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mdf");
        let mut storage = FileStorage::create(&path, 64).expect("create");
        storage.allocate_blocks(2).expect("allocate");

        let mut block = Block::zeroed(64);
        block.set_header(BlockHeader {
            category: BlockCategory::FirstVersion,
            flags: 0,
            last_modification: Timestamp::new(10),
            older_block_id: BlockId::INVALID,
            older_timestamp: Timestamp::ILLEGAL,
        });
        block.payload_mut()[0] = 0x42;
        storage.write_block(BlockId::new(1), &block).expect("write");

        let read_back = storage.read_block(BlockId::new(1)).expect("read");
        assert_eq!(read_back.payload()[0], 0x42);
        assert_eq!(read_back.header().expect("header").last_modification, Timestamp::new(10));
    }

    #[test]
    fn out_of_bounds_read_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mdf");
        let mut storage = FileStorage::create(&path, 64).expect("create");
        assert!(matches!(
            storage.read_block(BlockId::new(0)),
            Err(StorageError::BlockOutOfBounds { .. })
        ));
    }

    #[test]
    fn reopening_recovers_total_block_count() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vlf");
        {
            let mut storage = FileStorage::create(&path, 64).expect("create");
            storage.allocate_blocks(3).expect("allocate");
        }
        let storage = FileStorage::open(&path, 64).expect("reopen");
        assert_eq!(storage.total_blocks(), 3);
    }
}
