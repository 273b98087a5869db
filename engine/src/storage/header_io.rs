//! Reads and writes the VLF header replicas (blocks 0, 1, 2) through a
//! `Storage` instance, applying the quorum rule in
//! [`crate::storage::header`].

use crate::error::{VersionError, VersionResult};
use crate::ids::{BlockId, Timestamp};
use crate::storage::block::{Block, BlockCategory, BlockHeader};
use crate::storage::header::{FileHeader, HeaderCopy};
use crate::storage::io::Storage;

const REPLICA_BLOCK_IDS: [u64; 3] = [0, 1, 2];

/// Read the three header replicas and form the quorum-selected header.
///
/// A replica this call cannot even read (I/O error, not yet allocated) is
/// treated the same as a torn replica: absent from the vote (§9, P7).
///
/// # Errors
/// Returns `VersionError::LogItemCorrupted` if no replica is consistent.
pub fn read_header(vlf: &mut dyn Storage) -> VersionResult<FileHeader> {
    let mut payloads: Vec<Vec<u8>> = Vec::with_capacity(3);
    for id in REPLICA_BLOCK_IDS {
        let payload = vlf
            .read_block(BlockId::new(id))
            .map(|block| block.payload().to_vec())
            .unwrap_or_default();
        payloads.push(payload);
    }
    FileHeader::from_replicas([&payloads[0], &payloads[1], &payloads[2]])
        .map_err(|e| VersionError::LogItemCorrupted(e.to_string()))
}

/// Write the next generation of all three replicas, in the fixed block
/// order required by §5, and return the header that now reflects them.
///
/// # Errors
/// Propagates the first I/O error from writing any replica.
pub fn write_header(
    vlf: &mut dyn Storage,
    current: &FileHeader,
    block_size: usize,
    updated: HeaderCopy,
) -> VersionResult<FileHeader> {
    let next = current.next_generation(updated);
    for (id, copy) in REPLICA_BLOCK_IDS.into_iter().zip(next) {
        let mut block = Block::zeroed(block_size);
        block.set_header(BlockHeader {
            category: BlockCategory::FileHeader,
            flags: 0,
            last_modification: Timestamp::ILLEGAL,
            older_block_id: BlockId::INVALID,
            older_timestamp: Timestamp::ILLEGAL,
        });
        copy.write_into(block.payload_mut());
        vlf.write_block(BlockId::new(id), &block)
            .map_err(|e| VersionError::Unexpected(e.to_string()))?;
    }
    Ok(FileHeader {
        copies: next,
        master: 0,
    })
}

/// Ensure VLF blocks 0, 1, 2 (the header replicas) exist; called once when
/// the VLF is first materialized.
///
/// # Errors
/// Propagates the underlying allocation error.
pub fn ensure_replica_blocks_allocated(vlf: &mut dyn Storage) -> VersionResult<()> {
    if vlf.total_blocks() < 3 {
        vlf.allocate_blocks(3 - vlf.total_blocks())
            .map_err(|e| VersionError::Unexpected(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::simulated::{FaultConfig, SimulatedStorage};

    #[test]
    fn write_then_read_round_trips_through_storage() {
        let mut vlf: Box<dyn Storage> = Box::new(SimulatedStorage::new(64, 1, FaultConfig::none()));
        ensure_replica_blocks_allocated(vlf.as_mut()).expect("allocate");
        let current = FileHeader::fresh();
        let updated = HeaderCopy {
            page_count: 3,
            ..HeaderCopy::fresh()
        };
        let written = write_header(vlf.as_mut(), &current, 64, updated).expect("write");
        assert_eq!(written.current().page_count, 3);

        let read_back = read_header(vlf.as_mut()).expect("read");
        assert_eq!(read_back.current().page_count, 3);
        assert_eq!(read_back.current().generation, written.current().generation);
    }

    #[test]
    fn generation_increases_across_writes() {
        let mut vlf: Box<dyn Storage> = Box::new(SimulatedStorage::new(64, 2, FaultConfig::none()));
        ensure_replica_blocks_allocated(vlf.as_mut()).expect("allocate");
        let current = FileHeader::fresh();
        let first = write_header(vlf.as_mut(), &current, 64, HeaderCopy::fresh()).expect("write 1");
        let second = write_header(vlf.as_mut(), &first, 64, HeaderCopy::fresh()).expect("write 2");
        assert!(second.current().generation > first.current().generation);
    }
}
