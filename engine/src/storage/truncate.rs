//! `truncate(tx, from_page_id)` (§4.1): drops every page at or above
//! `from_page_id`, shrinking `page_count` and reclaiming the PBCT leaves and
//! VLF chains those pages held (P8: afterward, `fix` on a truncated page
//! fails as not allocated). Leans on the same leaf-invalidate-and-free-chain
//! pattern [`super::sync`] and [`super::recovery::restore`] already use, plus
//! [`super::sync::shrink_vlf_to_used_prefix`] for the tail-trim step.

use crate::error::{VersionError, VersionResult};
use crate::ids::PageId;
use crate::storage::block;
use crate::storage::collaborators::Transaction;
use crate::storage::descriptor::VersionedFile;
use crate::storage::freelist::FreeListState;
use crate::storage::header::HeaderCopy;
use crate::storage::header_io;
use crate::storage::io::Storage;
use crate::storage::pbct::io::PbctState;
use crate::storage::pbct::{self, LeafEntry};
use crate::storage::sync::shrink_vlf_to_used_prefix;

/// Outcome of `truncate` (§4.1).
#[derive(Debug, Clone, Copy, Default)]
pub struct TruncateOutcome {
    pub pages_truncated: usize,
    pub vlf_deleted: bool,
}

/// `truncate(tx, from_page_id)` (§4.1): every page `>= from_page_id` becomes
/// not-allocated; pages below it are untouched.
///
/// # Errors
/// Returns `VersionError::ReadOnlyTransaction` for a read-only `tx`;
/// otherwise propagates I/O or corruption errors encountered walking the
/// PBCT, VLF free list, or MDF.
pub fn truncate(file: &VersionedFile, tx: &dyn Transaction, from_page_id: PageId) -> VersionResult<TruncateOutcome> {
    if tx.is_read_only() {
        return Err(VersionError::ReadOnlyTransaction);
    }
    let _span =
        tracing::info_span!("truncate", lock_name = %file.lock_name, from_page_id = from_page_id.get()).entered();

    let strategy = file.strategy.read().clone();
    let mut state = file.state.write();

    if state.files.vlf.is_none() {
        let truncated = if let Some(mdf) = state.files.mdf.as_mut() {
            let before = mdf.total_blocks();
            if from_page_id.get() < before {
                mdf.truncate(from_page_id.get())
                    .map_err(|e| VersionError::Unexpected(e.to_string()))?;
            }
            before.saturating_sub(from_page_id.get()) as usize
        } else {
            0
        };
        drop(state);
        file.truncate_modifier_lists_from(from_page_id);
        tracing::info!(pages_truncated = truncated, "truncate finished (no VLF mounted)");
        return Ok(TruncateOutcome {
            pages_truncated: truncated,
            vlf_deleted: false,
        });
    }

    let payload_len = block::payload_len(&strategy);
    let vlf = state.files.vlf.as_mut().expect("checked above");
    let header = header_io::read_header(vlf)?;
    let current = header.current();

    if from_page_id.get() >= current.page_count {
        tracing::debug!("truncate: from_page_id is already beyond page_count");
        return Ok(TruncateOutcome::default());
    }

    let mut pbct_state = PbctState {
        root: current.pbct_root,
        height: current.pbct_height,
        free_list: FreeListState { head: current.free_list_head },
    };

    let leaf_fanout = pbct::leaf_fanout(payload_len);
    let total_leaves = current.page_count.div_ceil(leaf_fanout as u64).max(1);
    let first_leaf = from_page_id.get() / leaf_fanout as u64;

    let mut truncated = 0usize;
    for leaf_index in first_leaf..total_leaves {
        let representative = PageId::new(leaf_index * leaf_fanout as u64);
        let Some((leaf_block_id, mut leaf)) = pbct::io::leaf_for_page(vlf, &pbct_state, representative, payload_len)?
        else {
            continue;
        };

        let mut changed = false;
        for (slot, entry) in leaf.entries.clone().into_iter().enumerate() {
            let page_id = PageId::new(leaf_index * leaf_fanout as u64 + slot as u64);
            if page_id.get() < from_page_id.get() || entry.is_invalid() {
                continue;
            }

            let mut chain_block_id = entry.latest_block_id;
            while chain_block_id.is_valid() {
                let block = vlf
                    .read_block(chain_block_id)
                    .map_err(|e| VersionError::Unexpected(e.to_string()))?;
                let next = block
                    .header()
                    .map_err(|e| VersionError::LogItemCorrupted(e.to_string()))?
                    .older_block_id;
                pbct::io::push_free_block(vlf, &mut pbct_state, strategy.block_size, chain_block_id)?;
                chain_block_id = next;
            }
            leaf.entries[slot] = LeafEntry::invalid();
            changed = true;
            truncated += 1;
        }

        if changed {
            pbct::io::write_leaf_block(vlf, leaf_block_id, &leaf, strategy.block_size)?;
            pbct::io::prune_empty_leaf(vlf, &mut pbct_state, representative, payload_len, strategy.block_size)?;
        }
    }

    shrink_vlf_to_used_prefix(vlf, &mut pbct_state, strategy.block_size)?;

    let new_page_count = from_page_id.get();
    let updated_copy = HeaderCopy {
        page_count: new_page_count,
        pbct_height: pbct_state.height,
        pbct_root: pbct_state.root,
        free_list_head: pbct_state.free_list.head,
        newest_ts: current.newest_ts,
        generation: current.generation,
    };
    header_io::write_header(vlf, &header, strategy.block_size, updated_copy)?;
    vlf.sync().map_err(|e| VersionError::Unexpected(e.to_string()))?;

    if let Some(mdf) = state.files.mdf.as_mut() {
        mdf.truncate(new_page_count).map_err(|e| VersionError::Unexpected(e.to_string()))?;
        mdf.sync().map_err(|e| VersionError::Unexpected(e.to_string()))?;
    }

    let mut vlf_deleted = false;
    if new_page_count == 0 && !pbct_state.root.is_valid() {
        if let Some(vlf) = state.files.vlf.take() {
            vlf.delete().map_err(|e| VersionError::Unexpected(e.to_string()))?;
        }
        vlf_deleted = true;
    }

    drop(state);
    file.truncate_modifier_lists_from(from_page_id);

    tracing::info!(pages_truncated = truncated, vlf_deleted, "truncate finished");
    Ok(TruncateOutcome {
        pages_truncated: truncated,
        vlf_deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageStrategy;
    use crate::ids::{Timestamp, TxId};
    use crate::storage::collaborators::TransactionCategory;
    use crate::storage::fix::{fix, unfix, FixMode};

    struct FakeTx {
        id: TxId,
        start: Timestamp,
        read_only: bool,
    }

    impl Transaction for FakeTx {
        fn id(&self) -> TxId {
            self.id
        }
        fn start_timestamp(&self) -> Timestamp {
            self.start
        }
        fn category(&self) -> TransactionCategory {
            TransactionCategory::VersionUsing
        }
        fn is_read_only(&self) -> bool {
            self.read_only
        }
        fn is_canceled_statement(&self) -> bool {
            false
        }
        fn overlaps(&self, other: TxId) -> bool {
            other.0 > self.id.0
        }
    }

    fn tx(id: u64, start: u64) -> FakeTx {
        FakeTx {
            id: TxId::new(id),
            start: Timestamp::new(start),
            read_only: false,
        }
    }

    fn strategy(dir: &std::path::Path) -> StorageStrategy {
        StorageStrategy {
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
    fn truncated_pages_are_no_longer_allocated_p8() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = VersionedFile::new("t".to_string(), strategy(dir.path()));

        let writer = tx(1, 100);
        for page in 0..3u64 {
            let mut view = fix(&file, &writer, PageId::new(page), FixMode::Allocate).expect("allocate");
            view.block.payload_mut()[0] = page as u8;
            unfix(&file, &writer, view, true).expect("unfix");
        }

        let truncator = tx(2, 200);
        let outcome = truncate(&file, &truncator, PageId::new(1)).expect("truncate");
        assert_eq!(outcome.pages_truncated, 2);
        assert!(!outcome.vlf_deleted);

        let user = tx(3, 300);
        let err = fix(&file, &user, PageId::new(1), FixMode::Write).expect_err("page 1 must be gone");
        assert!(err.to_string().contains("not allocated"), "{err}");
        let err = fix(&file, &user, PageId::new(2), FixMode::Write).expect_err("page 2 must be gone");
        assert!(err.to_string().contains("not allocated"), "{err}");

        let read_view = fix(&file, &user, PageId::new(0), FixMode::ReadOnly).expect("page 0 survives");
        assert_eq!(read_view.block.payload()[0], 0);
    }

    #[test]
    fn truncating_to_zero_drops_the_vlf() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = VersionedFile::new("t".to_string(), strategy(dir.path()));

        let writer = tx(1, 100);
        let mut view = fix(&file, &writer, PageId::new(0), FixMode::Allocate).expect("allocate");
        view.block.payload_mut()[0] = 0xAB;
        unfix(&file, &writer, view, true).expect("unfix");

        let truncator = tx(2, 200);
        let outcome = truncate(&file, &truncator, PageId::new(0)).expect("truncate");
        assert_eq!(outcome.pages_truncated, 1);
        assert!(outcome.vlf_deleted);
        assert!(file.state.read().files.vlf.is_none());
    }

    #[test]
    fn read_only_transaction_cannot_truncate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = VersionedFile::new("t".to_string(), strategy(dir.path()));
        let mut reader = tx(1, 100);
        reader.read_only = true;
        assert!(matches!(
            truncate(&file, &reader, PageId::new(0)),
            Err(VersionError::ReadOnlyTransaction)
        ));
    }

    #[test]
    fn truncate_past_page_count_is_a_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = VersionedFile::new("t".to_string(), strategy(dir.path()));

        let writer = tx(1, 100);
        let view = fix(&file, &writer, PageId::new(0), FixMode::Allocate).expect("allocate");
        unfix(&file, &writer, view, true).expect("unfix");

        let truncator = tx(2, 200);
        let outcome = truncate(&file, &truncator, PageId::new(5)).expect("truncate");
        assert_eq!(outcome.pages_truncated, 0);
    }
}
