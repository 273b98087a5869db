//! In-memory `Storage` implementation with deterministic fault injection,
//! used to drive the crash-recovery scenarios (S4, S5) without touching a
//! real filesystem.
//!
//! Faults are drawn from a seeded `rand::rngs::StdRng` so a failing test
//! reproduces exactly from its seed.

use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::ids::BlockId;
use crate::storage::block::Block;
use crate::storage::io::{Storage, StorageError};

/// Fault injection rates, each in `[0.0, 1.0]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultConfig {
    /// Probability a `write_block` call corrupts the write (bit flip) before storing.
    pub torn_write_rate: f64,
    /// Probability a `write_block` call is silently dropped (pre-sync crash simulation).
    pub lost_write_rate: f64,
    /// Probability `read_block`/`write_block` returns an injected I/O error.
    pub io_error_rate: f64,
}

impl FaultConfig {
    #[must_use]
    pub const fn none() -> Self {
        Self {
            torn_write_rate: 0.0,
            lost_write_rate: 0.0,
            io_error_rate: 0.0,
        }
    }
}

/// Deterministic in-memory block store.
pub struct SimulatedStorage {
    block_size: usize,
    blocks: Vec<Vec<u8>>,
    durable: Vec<Vec<u8>>,
    rng: StdRng,
    faults: FaultConfig,
}

impl SimulatedStorage {
    #[must_use]
    pub fn new(block_size: usize, seed: u64, faults: FaultConfig) -> Self {
        Self {
            block_size,
            blocks: Vec::new(),
            durable: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
            faults,
        }
    }

    /// Zero the first `n` bytes of the durable copy of `block_id`,
    /// simulating the torn-header-replica scenario (S5) directly, without
    /// going through the probabilistic fault path.
    pub fn tear_durable_block(&mut self, block_id: BlockId, n: usize) {
        if let Some(b) = self.durable.get_mut(block_id.get() as usize) {
            b[..n.min(b.len())].fill(0);
        }
    }

    /// Roll back to the last `sync`ed state, simulating a crash after some
    /// writes were issued but before the next sync (used to set up S4).
    pub fn crash_and_lose_unsynced_writes(&mut self) {
        self.blocks.clone_from(&self.durable);
    }

    fn maybe_fault(&mut self) -> Result<(), StorageError> {
        if self.faults.io_error_rate > 0.0 && self.rng.random_bool(self.faults.io_error_rate) {
            return Err(StorageError::InjectedFault("simulated I/O error".into()));
        }
        Ok(())
    }
}

impl Storage for SimulatedStorage {
    fn read_block(&mut self, block_id: BlockId) -> Result<Block, StorageError> {
        self.maybe_fault()?;
        let idx = block_id.get() as usize;
        if idx >= self.blocks.len() {
            return Err(StorageError::BlockOutOfBounds {
                block_id,
                total_blocks: self.blocks.len() as u64,
            });
        }
        Ok(Block::from_bytes(self.blocks[idx].clone()))
    }

    fn write_block(&mut self, block_id: BlockId, block: &Block) -> Result<(), StorageError> {
        self.maybe_fault()?;
        let idx = block_id.get() as usize;
        if idx >= self.blocks.len() {
            return Err(StorageError::BlockOutOfBounds {
                block_id,
                total_blocks: self.blocks.len() as u64,
            });
        }
        if self.faults.lost_write_rate > 0.0 && self.rng.random_bool(self.faults.lost_write_rate) {
            return Ok(());
        }
        let mut bytes = block.as_bytes().to_vec();
        if self.faults.torn_write_rate > 0.0 && self.rng.random_bool(self.faults.torn_write_rate) {
            let flip = self.rng.random_range(0..bytes.len());
            bytes[flip] ^= 0xFF;
        }
        self.blocks[idx] = bytes;
        Ok(())
    }

    fn sync(&mut self) -> Result<(), StorageError> {
        self.maybe_fault()?;
        self.durable.clone_from(&self.blocks);
        Ok(())
    }

    fn allocate_blocks(&mut self, count: u64) -> Result<BlockId, StorageError> {
        let first = self.blocks.len() as u64;
        for _ in 0..count {
            self.blocks.push(vec![0u8; self.block_size]);
            self.durable.push(vec![0u8; self.block_size]);
        }
        Ok(BlockId::new(first))
    }

    fn truncate(&mut self, total_blocks: u64) -> Result<(), StorageError> {
        self.blocks.truncate(total_blocks as usize);
        self.durable.truncate(total_blocks as usize);
        Ok(())
    }

    fn delete(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }

    fn total_blocks(&self) -> u64 {
        self.blocks.len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::block::{Block, BlockCategory, BlockHeader};
    use crate::ids::Timestamp;

    fn sample_block(block_size: usize) -> Block {
        let mut block = Block::zeroed(block_size);
        block.set_header(BlockHeader {
            category: BlockCategory::Latest,
            flags: 0,
            last_modification: Timestamp::new(1),
            older_block_id: BlockId::INVALID,
            older_timestamp: Timestamp::ILLEGAL,
        });
        block
    }

    #[test]
    fn writes_are_visible_without_fault_injection() {
        let mut storage = SimulatedStorage::new(64, 1, FaultConfig::none());
        let first = storage.allocate_blocks(1).expect("allocate");
        storage.write_block(first, &sample_block(64)).expect("write");
        let read = storage.read_block(first).expect("read");
        assert_eq!(read.header().expect("header").last_modification, Timestamp::new(1));
    }

    #[test]
    fn crash_rolls_back_to_last_sync() {
        let mut storage = SimulatedStorage::new(64, 2, FaultConfig::none());
        let first = storage.allocate_blocks(1).expect("allocate");
        storage.sync().expect("sync");
        storage.write_block(first, &sample_block(64)).expect("write");
        storage.crash_and_lose_unsynced_writes();
        let read = storage.read_block(first).expect("read");
        assert_eq!(read.header().expect("header").last_modification, Timestamp::ILLEGAL);
    }

    #[test]
    fn tear_durable_block_zeroes_a_prefix() {
        let mut storage = SimulatedStorage::new(64, 3, FaultConfig::none());
        let first = storage.allocate_blocks(1).expect("allocate");
        storage.write_block(first, &sample_block(64)).expect("write");
        storage.sync().expect("sync");
        storage.tear_durable_block(first, 8);
        assert_eq!(storage.durable[0][..8], [0u8; 8]);
    }

    #[test]
    fn deterministic_fault_seed_reproduces_injected_errors() {
        let faults = FaultConfig {
            io_error_rate: 1.0,
            ..FaultConfig::none()
        };
        let mut a = SimulatedStorage::new(64, 42, faults);
        let mut b = SimulatedStorage::new(64, 42, faults);
        assert!(matches!(a.sync(), Err(StorageError::InjectedFault(_))));
        assert!(matches!(b.sync(), Err(StorageError::InjectedFault(_))));
    }
}
