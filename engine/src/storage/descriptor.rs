//! Versioned-file descriptor and page descriptor (§3, §4.1).
//!
//! Page → File is a many-to-one back reference; file handles are ref-counted
//! and live in a global table keyed by lock name, per the §9 design note.
//! Lock order follows §5: file table bucket mutex, then the file-level
//! `RwLock`, then the per-page latch guarding a page descriptor's modifier
//! list.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};

use crate::config::StorageStrategy;
use crate::error::{VersionError, VersionResult};
use crate::ids::{PageId, TxId};
use crate::storage::io::Storage;

/// Physical files mounted for one versioned file. `vlf`/`slf` are absent
/// until first needed (§4.1 `create`: "No physical file is materialized yet").
pub struct MountedFiles {
    pub mdf: Option<Box<dyn Storage>>,
    pub vlf: Option<Box<dyn Storage>>,
    pub slf: Option<Box<dyn Storage>>,
}

impl MountedFiles {
    const fn empty() -> Self {
        Self {
            mdf: None,
            vlf: None,
            slf: None,
        }
    }
}

/// State protected by the file-level `RwLock` (lock-order position 2 of §5):
/// readers hold it during normal fix/sync/backup, writers during
/// create/destroy/move/restore/recover.
pub struct FileState {
    pub files: MountedFiles,
    /// The transaction that created or most recently mounted this file;
    /// transactions that started earlier cannot see it (§5, §9 open question).
    pub creator: Option<TxId>,
    pub batch_insert: bool,
    pub backup_in_progress: bool,
}

/// A ref-counted versioned-file handle (§4.1). `attach` returns one of
/// these; equivalent calls with the same lock name return the same
/// descriptor.
pub struct VersionedFile {
    pub lock_name: String,
    pub strategy: RwLock<StorageStrategy>,
    pub state: RwLock<FileState>,
    pub ref_count: AtomicUsize,
    pub reserved: AtomicBool,
    /// Per-page descriptors for pages fixed through this file. Modeled as a
    /// single bucket mutex per file rather than a globally (file,page)-hash
    /// bucketed table, since all access to it is already serialized behind
    /// this file's own `RwLock` acquisition in normal operation — see
    /// DESIGN.md for the deliberate simplification.
    pub pages: Mutex<HashMap<PageId, Arc<PageDescriptor>>>,
}

impl VersionedFile {
    pub(crate) fn new(lock_name: String, strategy: StorageStrategy) -> Self {
        Self {
            lock_name,
            strategy: RwLock::new(strategy),
            state: RwLock::new(FileState {
                files: MountedFiles::empty(),
                creator: None,
                batch_insert: false,
                backup_in_progress: false,
            }),
            ref_count: AtomicUsize::new(0),
            reserved: AtomicBool::new(false),
            pages: Mutex::new(HashMap::new()),
        }
    }

    /// `create(tx)` (§4.1): record the creator transaction; no physical
    /// file is materialized yet.
    pub fn create(&self, tx: TxId) {
        let mut state = self.state.write();
        state.creator = Some(tx);
    }

    /// `mount(tx)` (§4.1): establishes the creator id so the file becomes
    /// visible to `tx` and later transactions but stays invisible to
    /// transactions that started earlier (§5, resolved per §9: remount
    /// always installs a fresh creator id).
    pub fn mount(&self, tx: TxId, mdf: Box<dyn Storage>, vlf: Option<Box<dyn Storage>>) {
        let mut state = self.state.write();
        state.files.mdf = Some(mdf);
        state.files.vlf = vlf;
        state.creator = Some(tx);
    }

    /// `unmount(tx)` (§4.1).
    pub fn unmount(&self) {
        let mut state = self.state.write();
        state.files = MountedFiles::empty();
    }

    /// Whether `viewer` can see this file, per the creator-id visibility
    /// rule (§5, §9): invisible to transactions that started before the
    /// creator was installed.
    #[must_use]
    pub fn visible_to(&self, viewer: &dyn crate::storage::collaborators::Transaction) -> bool {
        let state = self.state.read();
        match state.creator {
            None => true,
            Some(creator) => creator == viewer.id() || !viewer.overlaps(creator),
        }
    }

    /// Fetch or create the in-memory descriptor for `page_id`.
    pub fn page_descriptor(&self, page_id: PageId) -> Arc<PageDescriptor> {
        let mut pages = self.pages.lock();
        Arc::clone(
            pages
                .entry(page_id)
                .or_insert_with(|| Arc::new(PageDescriptor::new(page_id))),
        )
    }

    /// `flush(tx)` (§4.1): forward to whichever physical files are mounted.
    ///
    /// # Errors
    /// Propagates the first I/O error encountered.
    pub fn flush(&self) -> VersionResult<()> {
        let mut state = self.state.write();
        if let Some(mdf) = state.files.mdf.as_mut() {
            mdf.sync().map_err(|e| VersionError::Unexpected(e.to_string()))?;
        }
        if let Some(vlf) = state.files.vlf.as_mut() {
            vlf.sync().map_err(|e| VersionError::Unexpected(e.to_string()))?;
        }
        Ok(())
    }

    /// Clear modifier lists for every page at or above `from_page_id`. Only
    /// the in-memory half of `truncate(tx, from_page_id)` (§4.1): the
    /// VLF/PBCT/MDF side is [`crate::storage::truncate::truncate`], which
    /// calls this once it has committed the on-disk change.
    pub fn truncate_modifier_lists_from(&self, from_page_id: PageId) {
        let pages = self.pages.lock();
        for (page_id, descriptor) in pages.iter() {
            if *page_id >= from_page_id {
                descriptor.modifier_list.lock().clear();
            }
        }
    }

    /// `move(tx, new_paths)` (§4.1): re-home the physical paths recorded in
    /// the strategy. Re-attaching under the new master path is the caller's
    /// responsibility (the registry bucket is keyed by lock name, which
    /// does not change on a path move within the same logical file).
    pub fn move_paths(&self, new_strategy: StorageStrategy) {
        *self.strategy.write() = new_strategy;
    }
}

/// Per-page in-memory descriptor (§3, §4.2).
pub struct PageDescriptor {
    pub page_id: PageId,
    /// Ordered, sorted-by-insertion, deduplicated modifier list; the per-
    /// descriptor latch (§5 lock-order position 3).
    pub modifier_list: Mutex<Vec<TxId>>,
}

impl PageDescriptor {
    #[must_use]
    pub fn new(page_id: PageId) -> Self {
        Self {
            page_id,
            modifier_list: Mutex::new(Vec::new()),
        }
    }

    /// Register `tx` as having modified this page, unless batch-insert mode
    /// is active. Duplicate insertions are no-ops; new entries are appended
    /// so the list stays newest-insertion-last (§4.2).
    pub fn register_modifier(&self, tx: TxId, batch_insert: bool) {
        if batch_insert {
            return;
        }
        let mut list = self.modifier_list.lock();
        if !list.contains(&tx) {
            list.push(tx);
        }
    }
}

/// Global registry of versioned-file descriptors keyed by lock name,
/// bucketed by a simple hash-mod-shard-count mutex (§5 lock-order
/// position 1: "hash-table bucket mutex (file table, then page table)").
pub struct FileTable {
    shards: Vec<Mutex<HashMap<String, Arc<VersionedFile>>>>,
}

impl FileTable {
    const SHARD_COUNT: usize = 16;

    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: (0..Self::SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard_for(&self, lock_name: &str) -> &Mutex<HashMap<String, Arc<VersionedFile>>> {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in lock_name.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0000_0100_0000_01B3);
        }
        &self.shards[(hash as usize) % self.shards.len()]
    }

    /// `attach(storage_strategy, lock_name) -> file_ref` (§4.1).
    ///
    /// `batch_insert` enforces the §4.1 invariant that a batch-mode file
    /// must have refcount exactly 1: a second `attach` while one is active
    /// fails (S6).
    ///
    /// # Errors
    /// Returns `VersionError::Unexpected` if a descriptor already exists
    /// under `lock_name` with a strategy whose master path differs — a
    /// stale handle left by a prior drop+create — or if `batch_insert` is
    /// requested while the descriptor is already attached.
    pub fn attach(
        &self,
        strategy: StorageStrategy,
        lock_name: &str,
        batch_insert: bool,
    ) -> VersionResult<Arc<VersionedFile>> {
        let shard = self.shard_for(lock_name);
        let mut map = shard.lock();
        if let Some(existing) = map.get(lock_name) {
            if existing.strategy.read().mdf_path != strategy.mdf_path {
                return Err(VersionError::Unexpected(format!(
                    "stale descriptor for lock name {lock_name}: master path differs"
                )));
            }
            let already_batched = existing.state.read().batch_insert;
            if (batch_insert || already_batched) && existing.ref_count.load(Ordering::SeqCst) > 0 {
                return Err(VersionError::Unexpected(format!(
                    "{lock_name} is in batch-insert mode: refcount must stay 1"
                )));
            }
            existing.ref_count.fetch_add(1, Ordering::SeqCst);
            return Ok(Arc::clone(existing));
        }
        let file = Arc::new(VersionedFile::new(lock_name.to_string(), strategy));
        file.state.write().batch_insert = batch_insert;
        file.ref_count.fetch_add(1, Ordering::SeqCst);
        map.insert(lock_name.to_string(), Arc::clone(&file));
        Ok(file)
    }

    /// `detach(file_ref, reserve)` (§4.1): decrement refcount; destroy when
    /// it reaches zero, `reserve` is false, and no in-progress read-write
    /// transaction matches the creator id.
    pub fn detach(&self, file: &Arc<VersionedFile>, reserve: bool, creator_still_live: bool) {
        file.reserved.store(reserve, Ordering::SeqCst);
        let prev = file.ref_count.fetch_sub(1, Ordering::SeqCst);
        if prev != 1 || reserve || creator_still_live {
            return;
        }
        let shard = self.shard_for(&file.lock_name);
        let mut map = shard.lock();
        if let Some(entry) = map.get(&file.lock_name) {
            if entry.ref_count.load(Ordering::SeqCst) == 0 {
                map.remove(&file.lock_name);
            }
        }
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}
