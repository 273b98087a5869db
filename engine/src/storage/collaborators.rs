//! Trait contracts for the external collaborators named in §6: the
//! transaction manager and the checkpoint manager. The core never
//! implements these itself — it only consumes them — so only the surface
//! needed to exercise tests lives here, alongside a `FakeTransactionManager`
//! grounded on the teacher's `ActiveSnapshots` pattern (tracked by a
//! `BTreeSet` of in-progress start timestamps).

use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::ids::{Timestamp, TxId};

/// A transaction's category, named by `tx.getCategory()` in §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionCategory {
    /// Reads a snapshot fixed at `start_timestamp`.
    VersionUsing,
    /// Reads whatever is currently on disk; used by `sync`.
    NoVersion,
}

/// What the versioning core needs from a transaction handle (§6).
pub trait Transaction {
    fn id(&self) -> TxId;
    fn start_timestamp(&self) -> Timestamp;
    fn category(&self) -> TransactionCategory;
    fn is_read_only(&self) -> bool;
    fn is_canceled_statement(&self) -> bool;

    /// `tx.overlaps(other)`: `other` is in-progress at `self`'s start
    /// timestamp, or `other.id > self.id` (§4.2 step 2).
    fn overlaps(&self, other: TxId) -> bool;
}

/// What the versioning core needs from the transaction manager (§6).
pub trait TransactionManager {
    /// In-progress transaction ids for a database, restricted to
    /// version-using ones when `version_using_only` is set.
    fn in_progress_list(&self, db_id: u64, version_using_only: bool) -> Vec<TxId>;

    /// The oldest still-reachable transaction id for a database, used to
    /// bound cleanup of historical state.
    fn beginning_id(&self, db_id: u64) -> TxId;
}

/// What the versioning core needs from the checkpoint manager (§6).
pub trait CheckpointManager {
    fn most_recent(&self, lock_name: &str) -> Timestamp;
    fn second_most_recent(&self, lock_name: &str) -> Timestamp;
}

/// A minimal in-process `TransactionManager` used by tests, grounded on the
/// `ActiveSnapshots` registry pattern: a `BTreeSet` of in-progress
/// start-timestamps gives the "oldest in-progress version-using tx" needed
/// by sync's eldest-timestamp computation (§4.5 step 1) in O(log n).
#[derive(Default)]
pub struct FakeTransactionManager {
    in_progress: Mutex<BTreeSet<Timestamp>>,
}

impl FakeTransactionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&self, start_timestamp: Timestamp) {
        self.in_progress.lock().insert(start_timestamp);
    }

    pub fn end(&self, start_timestamp: Timestamp) {
        self.in_progress.lock().remove(&start_timestamp);
    }

    /// The oldest birth timestamp among still in-progress version-using
    /// transactions, or `Timestamp::ILLEGAL` if none are in progress — the
    /// direct input to sync's `eldest` computation (§4.5 step 1).
    #[must_use]
    pub fn oldest_in_progress_start(&self) -> Timestamp {
        self.in_progress
            .lock()
            .iter()
            .next()
            .copied()
            .unwrap_or(Timestamp::ILLEGAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oldest_in_progress_start_tracks_the_minimum() {
        let mgr = FakeTransactionManager::new();
        mgr.begin(Timestamp::new(200));
        mgr.begin(Timestamp::new(100));
        assert_eq!(mgr.oldest_in_progress_start(), Timestamp::new(100));
        mgr.end(Timestamp::new(100));
        assert_eq!(mgr.oldest_in_progress_start(), Timestamp::new(200));
    }

    #[test]
    fn empty_manager_reports_illegal_timestamp() {
        let mgr = FakeTransactionManager::new();
        assert_eq!(mgr.oldest_in_progress_start(), Timestamp::ILLEGAL);
    }
}
