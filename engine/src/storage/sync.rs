//! `sync(tx)` (§4.5): opportunistically migrates versions from the VLF back
//! into the MDF and reclaims their VLF blocks.
//!
//! A page's PBCT leaf entry only ever stores the timestamp of its *newest*
//! version (see [`crate::storage::pbct::LeafEntry`]), so `entry.timestamp <
//! eldest` means the page's *entire* older-chain predates `eldest` — nobody
//! live or yet to start will ever need anything but the newest surviving
//! version in that chain. That lets each candidate collapse to a single
//! migration: the chain's current top is copied into the MDF and the whole
//! chain is freed, rather than peeling one version off at a time.

use crate::error::{VersionError, VersionResult};
use crate::ids::{BlockId, PageId, Timestamp};
use crate::storage::block::{self, Block, BlockCategory, BlockHeader};
use crate::storage::collaborators::{CheckpointManager, Transaction};
use crate::storage::descriptor::VersionedFile;
use crate::storage::freelist::FreeListState;
use crate::storage::header::HeaderCopy;
use crate::storage::header_io;
use crate::storage::io::Storage;
use crate::storage::pbct::io::PbctState;
use crate::storage::pbct::{self, LeafEntry};
use crate::storage::slf;

/// Outcome of one `sync` pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOutcome {
    /// `true` if the pass stopped early (backup in progress, or cancellation).
    pub incomplete: bool,
    pub pages_migrated: usize,
    /// `true` if the pass left the PBCT empty and dropped the VLF entirely
    /// (§4.5 step 7).
    pub vlf_deleted: bool,
}

fn open_or_create(path: &std::path::Path, block_size: usize) -> VersionResult<crate::storage::file::FileStorage> {
    use crate::storage::file::FileStorage;
    match FileStorage::create(path, block_size) {
        Ok(s) => Ok(s),
        Err(_) => FileStorage::open(path, block_size).map_err(|e| VersionError::Unexpected(e.to_string())),
    }
}

/// Run one batched `sync` pass (§4.5).
///
/// `oldest_in_progress_version_tx_start` is the caller-supplied lower bound
/// on in-progress version-using transaction start timestamps (`Timestamp::ILLEGAL`
/// if none are in progress); it and `checkpoint_mgr.second_most_recent`
/// together form `eldest`.
///
/// # Errors
/// Propagates I/O or corruption errors. Cancellation is reported through
/// `SyncOutcome::incomplete`, not as an `Err`.
pub fn sync(
    file: &VersionedFile,
    tx: &dyn Transaction,
    checkpoint_mgr: &dyn CheckpointManager,
    oldest_in_progress_version_tx_start: Timestamp,
    max_candidates: usize,
) -> VersionResult<SyncOutcome> {
    let _span = tracing::info_span!("sync", lock_name = %file.lock_name).entered();

    if file.state.read().backup_in_progress {
        tracing::debug!("sync deferred: backup in progress");
        return Ok(SyncOutcome {
            incomplete: true,
            pages_migrated: 0,
            vlf_deleted: false,
        });
    }

    let strategy = file.strategy.read().clone();
    let mut state = file.state.write();

    if state.files.vlf.is_none() {
        return Ok(SyncOutcome::default());
    }

    let payload_len = block::payload_len(&strategy);
    let eldest = checkpoint_mgr
        .second_most_recent(&file.lock_name)
        .min(oldest_in_progress_version_tx_start);

    let leaf_fanout = pbct::leaf_fanout(payload_len);
    let interior_fanout = pbct::interior_fanout(payload_len);

    let vlf = state.files.vlf.as_mut().expect("checked above");
    let header = header_io::read_header(vlf)?;
    let current = header.current();
    let mut pbct_state = PbctState {
        root: current.pbct_root,
        height: current.pbct_height,
        free_list: FreeListState { head: current.free_list_head },
    };

    let total_leaves = current.page_count.div_ceil(leaf_fanout as u64).max(1);

    let mut candidates: Vec<PageId> = Vec::new();
    'scan: for leaf_index in 0..total_leaves {
        if tx.is_canceled_statement() {
            break 'scan;
        }
        let representative = PageId::new(leaf_index * leaf_fanout as u64);
        let Some((_, leaf)) = pbct::io::leaf_for_page(vlf, &pbct_state, representative, payload_len)? else {
            continue;
        };
        for (slot, entry) in leaf.entries.iter().enumerate() {
            if entry.is_invalid() || entry.timestamp >= eldest {
                continue;
            }
            candidates.push(PageId::new(leaf_index * leaf_fanout as u64 + slot as u64));
            if candidates.len() >= max_candidates {
                break 'scan;
            }
        }
    }

    if candidates.is_empty() {
        tracing::debug!("sync pass found no stale candidates");
        return Ok(SyncOutcome::default());
    }
    tracing::debug!(candidates = candidates.len(), "sync pass found candidates");

    if state.files.slf.is_none() {
        state.files.slf = Some(Box::new(open_or_create(&strategy.slf_path, strategy.block_size)?));
    }

    let crate::storage::descriptor::MountedFiles { mdf, vlf, slf: slf_slot } = &mut state.files;
    let mdf = mdf.as_mut().expect("mdf mounted alongside vlf");
    let vlf = vlf.as_mut().expect("checked above");
    let slf = slf_slot.as_mut().expect("opened above");

    for &page_id in &candidates {
        let mdf_block = mdf
            .read_block(BlockId::new(page_id.get()))
            .map_err(|e| VersionError::Unexpected(e.to_string()))?;
        slf::write_preimage(slf.as_mut(), page_id, &mdf_block)?;
    }
    slf.sync().map_err(|e| VersionError::Unexpected(e.to_string()))?;

    let mut migrated = 0usize;
    let mut header = header;
    for &page_id in &candidates {
        if tx.is_canceled_statement() {
            tracing::debug!(migrated, "sync pass canceled mid-batch");
            break;
        }

        let slot = pbct::traversal_path(page_id, pbct_state.height, interior_fanout, leaf_fanout).leaf_slot;
        let representative = PageId::new((page_id.get() / leaf_fanout as u64) * leaf_fanout as u64);
        let Some((leaf_block_id, mut leaf)) = pbct::io::leaf_for_page(vlf, &pbct_state, representative, payload_len)?
        else {
            continue;
        };
        let entry = leaf.entries[slot];
        if entry.is_invalid() {
            continue;
        }

        let top_block_id = entry.latest_block_id;
        let top_block = vlf
            .read_block(top_block_id)
            .map_err(|e| VersionError::Unexpected(e.to_string()))?;
        let top_header = top_block
            .header()
            .map_err(|e| VersionError::LogItemCorrupted(e.to_string()))?;

        let mut new_mdf_block = Block::zeroed(strategy.block_size);
        new_mdf_block.payload_mut().copy_from_slice(top_block.payload());
        new_mdf_block.set_header(BlockHeader {
            category: BlockCategory::FirstVersion,
            flags: 0,
            last_modification: top_header.last_modification,
            older_block_id: BlockId::INVALID,
            older_timestamp: Timestamp::ILLEGAL,
        });
        mdf.write_block(BlockId::new(page_id.get()), &new_mdf_block)
            .map_err(|e| VersionError::Unexpected(e.to_string()))?;

        let mut chain_block_id = top_block_id;
        loop {
            let block = vlf
                .read_block(chain_block_id)
                .map_err(|e| VersionError::Unexpected(e.to_string()))?;
            let next = block
                .header()
                .map_err(|e| VersionError::LogItemCorrupted(e.to_string()))?
                .older_block_id;
            pbct::io::push_free_block(vlf, &mut pbct_state, strategy.block_size, chain_block_id)?;
            if !next.is_valid() {
                break;
            }
            chain_block_id = next;
        }

        leaf.entries[slot] = LeafEntry::invalid();
        pbct::io::write_leaf_block(vlf, leaf_block_id, &leaf, strategy.block_size)?;
        pbct::io::prune_empty_leaf(vlf, &mut pbct_state, page_id, payload_len, strategy.block_size)?;

        let updated_copy = HeaderCopy {
            page_count: header.current().page_count,
            pbct_height: pbct_state.height,
            pbct_root: pbct_state.root,
            free_list_head: pbct_state.free_list.head,
            newest_ts: header.current().newest_ts,
            generation: header.current().generation,
        };
        header = header_io::write_header(vlf, &header, strategy.block_size, updated_copy)?;
        migrated += 1;
    }

    if pbct_state.root.is_valid() {
        shrink_vlf_to_used_prefix(vlf, &mut pbct_state, strategy.block_size)?;
        let updated_copy = HeaderCopy {
            page_count: header.current().page_count,
            pbct_height: pbct_state.height,
            pbct_root: pbct_state.root,
            free_list_head: pbct_state.free_list.head,
            newest_ts: header.current().newest_ts,
            generation: header.current().generation,
        };
        header = header_io::write_header(vlf, &header, strategy.block_size, updated_copy)?;
    }

    mdf.sync().map_err(|e| VersionError::Unexpected(e.to_string()))?;

    if let Some(slf) = slf_slot.take() {
        slf.delete().map_err(|e| VersionError::Unexpected(e.to_string()))?;
    }

    let mut vlf_deleted = false;
    if !pbct_state.root.is_valid() {
        let surviving_page_count = header.current().page_count;
        if let Some(mdf) = state.files.mdf.as_mut() {
            mdf.truncate(surviving_page_count)
                .map_err(|e| VersionError::Unexpected(e.to_string()))?;
        }
        if let Some(vlf) = state.files.vlf.take() {
            vlf.delete().map_err(|e| VersionError::Unexpected(e.to_string()))?;
        }
        vlf_deleted = true;
        tracing::info!("sync pass emptied the PBCT and dropped the VLF");
    }

    tracing::info!(pages_migrated = migrated, incomplete = migrated < candidates.len(), "sync pass finished");
    Ok(SyncOutcome {
        incomplete: migrated < candidates.len(),
        pages_migrated: migrated,
        vlf_deleted,
    })
}

/// Truncate the VLF down to the blocks still in use: the header replicas
/// and anything not on the free list. Trailing free blocks are dropped and
/// the free chain is rebuilt to exclude them (§4.5 step 7). Shared with
/// [`super::truncate`], which empties leaves the same way a migration pass does.
pub(crate) fn shrink_vlf_to_used_prefix(vlf: &mut dyn Storage, pbct_state: &mut PbctState, block_size: usize) -> VersionResult<()> {
    const HEADER_BLOCKS: u64 = 3;
    let total = vlf.total_blocks();
    if total <= HEADER_BLOCKS {
        return Ok(());
    }

    let mut free_ids: std::collections::HashSet<u64> = std::collections::HashSet::new();
    let mut cursor = pbct_state.free_list.head;
    while cursor.is_valid() && free_ids.insert(cursor.get()) {
        let block = vlf.read_block(cursor).map_err(|e| VersionError::Unexpected(e.to_string()))?;
        cursor = block.header().map(|h| h.older_block_id).unwrap_or(BlockId::INVALID);
    }

    let mut new_total = total;
    while new_total > HEADER_BLOCKS && free_ids.contains(&(new_total - 1)) {
        new_total -= 1;
    }
    if new_total == total {
        return Ok(());
    }

    let mut kept: Vec<BlockId> = Vec::new();
    let mut cursor = pbct_state.free_list.head;
    let mut seen = std::collections::HashSet::new();
    while cursor.is_valid() && seen.insert(cursor.get()) {
        let block = vlf.read_block(cursor).map_err(|e| VersionError::Unexpected(e.to_string()))?;
        let next = block.header().map(|h| h.older_block_id).unwrap_or(BlockId::INVALID);
        if cursor.get() < new_total {
            kept.push(cursor);
        }
        cursor = next;
    }
    for (i, &id) in kept.iter().enumerate() {
        let next = kept.get(i + 1).copied().unwrap_or(BlockId::INVALID);
        let mut block = Block::zeroed(block_size);
        block.set_header(BlockHeader {
            category: BlockCategory::FreeListBlock,
            flags: 0,
            last_modification: Timestamp::ILLEGAL,
            older_block_id: next,
            older_timestamp: Timestamp::ILLEGAL,
        });
        vlf.write_block(id, &block).map_err(|e| VersionError::Unexpected(e.to_string()))?;
    }
    pbct_state.free_list.head = kept.first().copied().unwrap_or(BlockId::INVALID);

    vlf.truncate(new_total).map_err(|e| VersionError::Unexpected(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TxId;
    use crate::storage::collaborators::TransactionCategory;
    use crate::storage::fix::{fix, unfix, FixMode};

    struct FakeTx {
        id: TxId,
        start: Timestamp,
        category: TransactionCategory,
    }

    impl Transaction for FakeTx {
        fn id(&self) -> TxId {
            self.id
        }
        fn start_timestamp(&self) -> Timestamp {
            self.start
        }
        fn category(&self) -> TransactionCategory {
            self.category
        }
        fn is_read_only(&self) -> bool {
            false
        }
        fn is_canceled_statement(&self) -> bool {
            false
        }
        fn overlaps(&self, other: TxId) -> bool {
            other.0 > self.id.0
        }
    }

    struct FixedCheckpoints {
        second_most_recent: Timestamp,
    }

    impl CheckpointManager for FixedCheckpoints {
        fn most_recent(&self, _lock_name: &str) -> Timestamp {
            self.second_most_recent
        }
        fn second_most_recent(&self, _lock_name: &str) -> Timestamp {
            self.second_most_recent
        }
    }

    fn strategy(dir: &std::path::Path) -> crate::config::StorageStrategy {
        crate::config::StorageStrategy {
            mdf_path: dir.join("t.mdf"),
            vlf_path: dir.join("t.vlf"),
            slf_path: dir.join("t.slf"),
            block_size: 64,
            max_file_size: 1 << 30,
            extension_size: 1 << 12,
            versioning: true,
        }
    }

    #[test]
    fn sync_migrates_a_stale_version_back_into_the_mdf() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = VersionedFile::new("t".to_string(), strategy(dir.path()));

        let writer = FakeTx {
            id: TxId::new(1),
            start: Timestamp::new(100),
            category: TransactionCategory::VersionUsing,
        };
        let mut view = fix(&file, &writer, PageId::new(0), FixMode::Allocate).expect("allocate");
        view.block.payload_mut()[0] = 0x42;
        unfix(&file, &writer, view, true).expect("unfix");

        let sync_tx = FakeTx {
            id: TxId::new(2),
            start: Timestamp::new(9_999),
            category: TransactionCategory::NoVersion,
        };
        let checkpoints = FixedCheckpoints {
            second_most_recent: Timestamp::new(9_999),
        };
        let outcome = sync(&file, &sync_tx, &checkpoints, Timestamp::ILLEGAL, 16).expect("sync");
        assert_eq!(outcome.pages_migrated, 1);
        assert!(!outcome.incomplete);

        let reader = FakeTx {
            id: TxId::new(3),
            start: Timestamp::new(20_000),
            category: TransactionCategory::VersionUsing,
        };
        let read_view = fix(&file, &reader, PageId::new(0), FixMode::ReadOnly).expect("read");
        assert_eq!(read_view.block.payload()[0], 0x42);
        assert_eq!(read_view.location, crate::storage::fix::BlockLocation::Mdf);
    }

    #[test]
    fn sync_leaves_versions_needed_by_in_progress_readers_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = VersionedFile::new("t".to_string(), strategy(dir.path()));

        let writer = FakeTx {
            id: TxId::new(1),
            start: Timestamp::new(100),
            category: TransactionCategory::VersionUsing,
        };
        let mut view = fix(&file, &writer, PageId::new(0), FixMode::Allocate).expect("allocate");
        view.block.payload_mut()[0] = 0x11;
        unfix(&file, &writer, view, true).expect("unfix");

        let sync_tx = FakeTx {
            id: TxId::new(2),
            start: Timestamp::new(9_999),
            category: TransactionCategory::NoVersion,
        };
        let checkpoints = FixedCheckpoints {
            second_most_recent: Timestamp::new(50),
        };
        // eldest = min(50, 100) = 50; the version at ts=100 is newer than
        // eldest, so it must not be migrated.
        let outcome = sync(&file, &sync_tx, &checkpoints, Timestamp::new(100), 16).expect("sync");
        assert_eq!(outcome.pages_migrated, 0);
    }
}
