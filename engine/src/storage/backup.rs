//! `start-backup`/`end-backup` (§4.6).

use crate::error::VersionResult;
use crate::storage::collaborators::Transaction;
use crate::storage::descriptor::VersionedFile;
use crate::storage::fix::{fix, unfix, FixMode};

/// `start-backup(tx, restorable)` (§4.6).
///
/// When `restorable` is `true`, every page with a non-empty modifier list
/// gets a fresh VLF version stamped at `tx`'s snapshot before the file is
/// flushed, so the on-disk VLF alone (without the in-memory modifier lists)
/// still identifies the version visible at backup time. When `false`, the
/// file is simply marked "in backup" so later `sync` is suppressed.
///
/// # Errors
/// Propagates I/O errors encountered while re-fixing pages or flushing.
pub fn start_backup(file: &VersionedFile, tx: &dyn Transaction, restorable: bool) -> VersionResult<()> {
    if restorable {
        let modified: Vec<_> = file
            .pages
            .lock()
            .iter()
            .filter(|(_, descriptor)| !descriptor.modifier_list.lock().is_empty())
            .map(|(page_id, _)| *page_id)
            .collect();

        for page_id in modified {
            let view = fix(file, tx, page_id, FixMode::Write)?;
            unfix(file, tx, view, true)?;
        }
    } else {
        file.state.write().backup_in_progress = true;
    }

    file.flush()
}

/// `end-backup(tx)` (§4.6): clear the in-backup mark.
///
/// # Errors
/// Propagates I/O errors from the final flush.
pub fn end_backup(file: &VersionedFile, _tx: &dyn Transaction) -> VersionResult<()> {
    file.state.write().backup_in_progress = false;
    file.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageStrategy;
    use crate::ids::{PageId, Timestamp, TxId};
    use crate::storage::collaborators::TransactionCategory;
    use crate::storage::fix::FixMode as Mode;

    struct FakeTx {
        id: TxId,
        start: Timestamp,
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
            false
        }
        fn is_canceled_statement(&self) -> bool {
            false
        }
        fn overlaps(&self, other: TxId) -> bool {
            other.0 > self.id.0
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
    fn restorable_backup_flushes_without_error_when_nothing_modified() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = VersionedFile::new("t".to_string(), strategy(dir.path()));
        let tx = FakeTx {
            id: TxId::new(1),
            start: Timestamp::new(1),
        };
        start_backup(&file, &tx, true).expect("start-backup");
        end_backup(&file, &tx).expect("end-backup");
    }

    #[test]
    fn non_restorable_backup_sets_and_clears_the_flag() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = VersionedFile::new("t".to_string(), strategy(dir.path()));
        let tx = FakeTx {
            id: TxId::new(1),
            start: Timestamp::new(1),
        };
        start_backup(&file, &tx, false).expect("start-backup");
        assert!(file.state.read().backup_in_progress);
        end_backup(&file, &tx).expect("end-backup");
        assert!(!file.state.read().backup_in_progress);
    }

    #[test]
    fn restorable_backup_materializes_a_fresh_version_for_modified_pages() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = VersionedFile::new("t".to_string(), strategy(dir.path()));
        let writer = FakeTx {
            id: TxId::new(1),
            start: Timestamp::new(100),
        };
        let mut view = fix(&file, &writer, PageId::new(0), Mode::Allocate).expect("allocate");
        view.block.payload_mut()[0] = 0x11;
        unfix(&file, &writer, view, true).expect("unfix");

        let backup_tx = FakeTx {
            id: TxId::new(2),
            start: Timestamp::new(200),
        };
        start_backup(&file, &backup_tx, true).expect("start-backup");
        end_backup(&file, &backup_tx).expect("end-backup");

        let reader = FakeTx {
            id: TxId::new(3),
            start: Timestamp::new(300),
        };
        let read_view = fix(&file, &reader, PageId::new(0), Mode::ReadOnly).expect("read");
        assert_eq!(read_view.block.payload()[0], 0x11);
    }
}
