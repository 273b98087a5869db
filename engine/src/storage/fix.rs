//! `fix`/`unfix` and `allocate-log` (§4.2, §4.3): the page-level read/write
//! path built on top of the header quorum, PBCT and free list.

use crate::config::StorageStrategy;
use crate::error::{VersionError, VersionResult};
use crate::ids::{BlockId, PageId, Timestamp};
use crate::storage::block::{self, Block, BlockCategory, BlockHeader};
use crate::storage::collaborators::Transaction;
use crate::storage::descriptor::{FileState, MountedFiles, PageDescriptor, VersionedFile};
use crate::storage::file::FileStorage;
use crate::storage::header::HeaderCopy;
use crate::storage::header_io;
use crate::storage::io::Storage;
use crate::storage::freelist::FreeListState;
use crate::storage::pbct::io::PbctState;
use crate::storage::pbct::{self, LeafEntry};

/// Fix mode (§4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixMode {
    ReadOnly,
    Write,
    /// Initialize-for-first-use: materializes the page if it is beyond the
    /// current page count.
    Allocate,
}

/// Where a fixed block physically lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLocation {
    Mdf,
    Vlf,
}

/// A fixed page view (§4.2). Holds the raw block; the caller mutates
/// `block.payload_mut()` directly and calls `unfix` with `dirty=true` (or
/// `touch()`s it first) to persist.
pub struct FixedPage {
    pub page_id: PageId,
    pub location: BlockLocation,
    pub block_id: BlockId,
    pub block: Block,
    pub mode: FixMode,
    touched: bool,
}

impl FixedPage {
    /// Mark this view dirty regardless of the `dirty` flag later passed to
    /// `unfix` (§4.2: "if `touch` was called").
    pub fn touch(&mut self) {
        self.touched = true;
    }
}

/// `fix(tx, file-ref, page-id, mode, priority) -> page-view` (§4.2).
/// `priority` is accepted by the buffer-pool collaborator, not modeled here.
///
/// # Errors
/// Returns `VersionError::ReadOnlyTransaction` if a read-only transaction
/// requests `Write`/`Allocate`; otherwise propagates I/O or corruption
/// errors encountered while navigating the header/PBCT/older-chain.
pub fn fix(
    file: &VersionedFile,
    tx: &dyn Transaction,
    page_id: PageId,
    mode: FixMode,
) -> VersionResult<FixedPage> {
    if matches!(mode, FixMode::Write | FixMode::Allocate) && tx.is_read_only() {
        return Err(VersionError::ReadOnlyTransaction);
    }

    let strategy = file.strategy.read().clone();
    let mut state = file.state.write();

    if !strategy.versioning {
        return fix_mdf(&mut state, &strategy, page_id, mode, matches!(mode, FixMode::Allocate));
    }

    match mode {
        FixMode::ReadOnly => fix_read_only(file, &mut state, &strategy, tx, page_id),
        FixMode::Write | FixMode::Allocate => fix_write_or_allocate(file, &mut state, &strategy, tx, page_id, mode),
    }
}

/// `unfix(view, dirty)` (§4.2).
///
/// # Errors
/// Propagates I/O errors writing the block back.
pub fn unfix(
    file: &VersionedFile,
    tx: &dyn Transaction,
    mut fixed: FixedPage,
    dirty: bool,
) -> VersionResult<()> {
    if !dirty && !fixed.touched {
        return Ok(());
    }
    fixed.touched = true;

    let batch_insert = file.state.read().batch_insert;
    let descriptor = file.page_descriptor(fixed.page_id);
    descriptor.register_modifier(tx.id(), batch_insert);

    let mut state = file.state.write();
    let target: &mut Box<dyn Storage> = match fixed.location {
        BlockLocation::Mdf => state
            .files
            .mdf
            .as_mut()
            .ok_or_else(|| VersionError::Unexpected("MDF not mounted".into()))?,
        BlockLocation::Vlf => state
            .files
            .vlf
            .as_mut()
            .ok_or_else(|| VersionError::Unexpected("VLF not mounted".into()))?,
    };
    target
        .write_block(fixed.block_id, &fixed.block)
        .map_err(|e| VersionError::Unexpected(e.to_string()))
}

fn open_or_create(path: &std::path::Path, block_size: usize) -> VersionResult<FileStorage> {
    match FileStorage::create(path, block_size) {
        Ok(s) => Ok(s),
        Err(_) => FileStorage::open(path, block_size).map_err(|e| VersionError::Unexpected(e.to_string())),
    }
}

fn ensure_mdf(state: &mut FileState, strategy: &StorageStrategy) -> VersionResult<()> {
    if state.files.mdf.is_some() {
        return Ok(());
    }
    state.files.mdf = Some(Box::new(open_or_create(&strategy.mdf_path, strategy.block_size)?));
    Ok(())
}

fn ensure_vlf(state: &mut FileState, strategy: &StorageStrategy) -> VersionResult<()> {
    if state.files.vlf.is_some() {
        return Ok(());
    }
    let mut storage = open_or_create(&strategy.vlf_path, strategy.block_size)?;
    header_io::ensure_replica_blocks_allocated(&mut storage)?;
    state.files.vlf = Some(Box::new(storage));
    Ok(())
}

fn fix_mdf(
    state: &mut FileState,
    strategy: &StorageStrategy,
    page_id: PageId,
    mode: FixMode,
    allocate: bool,
) -> VersionResult<FixedPage> {
    ensure_mdf(state, strategy)?;
    let mdf = state.files.mdf.as_mut().expect("ensured above");
    if allocate && page_id.get() >= mdf.total_blocks() {
        let needed = page_id.get() + 1 - mdf.total_blocks();
        mdf.allocate_blocks(needed)
            .map_err(|e| VersionError::Unexpected(e.to_string()))?;
    }
    if page_id.get() >= mdf.total_blocks() {
        return Err(VersionError::Unexpected(format!("{page_id} not allocated")));
    }
    let block_id = BlockId::new(page_id.get());
    let block = mdf
        .read_block(block_id)
        .map_err(|e| VersionError::Unexpected(e.to_string()))?;
    Ok(FixedPage {
        page_id,
        location: BlockLocation::Mdf,
        block_id,
        block,
        mode,
        touched: false,
    })
}

/// The first version in the older-chain, starting at `start`, whose
/// `last_modification` is strictly before `before` (§4.2 step 2). Also used
/// by `sync` (§4.5 step 4) to locate the version to migrate into the MDF.
pub(crate) fn select_version(
    vlf: &mut dyn Storage,
    before: Timestamp,
    start: BlockId,
) -> VersionResult<Option<(BlockId, Block)>> {
    let mut current = start;
    while current.is_valid() {
        let block = vlf
            .read_block(current)
            .map_err(|e| VersionError::Unexpected(e.to_string()))?;
        let header = block
            .header()
            .map_err(|e| VersionError::LogItemCorrupted(e.to_string()))?;
        if header.last_modification < before {
            return Ok(Some((current, block)));
        }
        current = header.older_block_id;
    }
    Ok(None)
}

fn fix_read_only(
    file: &VersionedFile,
    state: &mut FileState,
    strategy: &StorageStrategy,
    tx: &dyn Transaction,
    page_id: PageId,
) -> VersionResult<FixedPage> {
    if state.files.vlf.is_none() {
        return fix_mdf(state, strategy, page_id, FixMode::ReadOnly, false);
    }

    let payload_len = block::payload_len(strategy);
    let descriptor = file.page_descriptor(page_id);

    let found = {
        let vlf = state.files.vlf.as_mut().expect("checked above");
        let header = header_io::read_header(vlf)?;
        let pbct_state = PbctState {
            root: header.current().pbct_root,
            height: header.current().pbct_height,
            free_list: FreeListState { head: header.current().free_list_head },
        };
        match pbct::io::leaf_for_page(vlf, &pbct_state, page_id, payload_len)? {
            None => None,
            Some((_, leaf)) => {
                let slot = pbct::traversal_path(
                    page_id,
                    pbct_state.height,
                    pbct::interior_fanout(payload_len),
                    pbct::leaf_fanout(payload_len),
                )
                .leaf_slot;
                let entry = leaf.entries[slot];
                let blocked = descriptor.modifier_list.lock().iter().any(|&t| tx.overlaps(t));
                if entry.is_invalid() || blocked {
                    None
                } else {
                    select_version(vlf, tx.start_timestamp(), entry.latest_block_id)?
                }
            }
        }
    };

    match found {
        Some((block_id, block)) => Ok(FixedPage {
            page_id,
            location: BlockLocation::Vlf,
            block_id,
            block,
            mode: FixMode::ReadOnly,
            touched: false,
        }),
        None => fix_mdf(state, strategy, page_id, FixMode::ReadOnly, false),
    }
}

fn newer(a: Timestamp, b: Timestamp) -> Timestamp {
    if !a.is_legal() {
        b
    } else if !b.is_legal() {
        a
    } else {
        a.max(b)
    }
}

fn allocate_log(
    vlf: &mut dyn Storage,
    tx: &dyn Transaction,
    pbct_state: &mut PbctState,
    strategy: &StorageStrategy,
    descriptor: &PageDescriptor,
    src_block_id: BlockId,
    src_block: &Block,
    src_in_mdf: bool,
) -> VersionResult<(BlockId, Block, bool)> {
    if !src_in_mdf {
        let header = src_block
            .header()
            .map_err(|e| VersionError::LogItemCorrupted(e.to_string()))?;
        let written_by_this_tx = descriptor
            .modifier_list
            .lock()
            .last()
            .is_some_and(|&t| t == tx.id());
        if written_by_this_tx && header.last_modification == tx.start_timestamp() {
            return Ok((src_block_id, src_block.clone(), true));
        }
    }

    let dst_id = pbct::io::pop_free_block(vlf, pbct_state, strategy.block_size, strategy.extension_size)?;
    let src_header = src_block
        .header()
        .map_err(|e| VersionError::LogItemCorrupted(e.to_string()))?;
    let mut dst = Block::zeroed(strategy.block_size);
    dst.payload_mut().copy_from_slice(src_block.payload());
    dst.set_header(BlockHeader {
        category: BlockCategory::Latest,
        flags: 0,
        last_modification: tx.start_timestamp(),
        older_block_id: if src_in_mdf { BlockId::INVALID } else { src_block_id },
        older_timestamp: src_header.last_modification,
    });
    vlf.write_block(dst_id, &dst)
        .map_err(|e| VersionError::Unexpected(e.to_string()))?;
    Ok((dst_id, dst, false))
}

fn fix_write_or_allocate(
    file: &VersionedFile,
    state: &mut FileState,
    strategy: &StorageStrategy,
    tx: &dyn Transaction,
    page_id: PageId,
    mode: FixMode,
) -> VersionResult<FixedPage> {
    let payload_len = block::payload_len(strategy);
    ensure_mdf(state, strategy)?;
    ensure_vlf(state, strategy)?;

    let descriptor = file.page_descriptor(page_id);

    let MountedFiles { mdf, vlf, .. } = &mut state.files;
    let mdf = mdf.as_mut().expect("ensured above");
    let vlf = vlf.as_mut().expect("ensured above");

    let header = header_io::read_header(vlf)?;
    let mut current = header.current();

    if matches!(mode, FixMode::Allocate) && page_id.get() >= current.page_count {
        let needed = page_id.get() + 1 - current.page_count;
        mdf.allocate_blocks(needed)
            .map_err(|e| VersionError::Unexpected(e.to_string()))?;
        current.page_count = page_id.get() + 1;
    }
    if page_id.get() >= current.page_count {
        return Err(VersionError::Unexpected(format!("{page_id} not allocated")));
    }

    let mut pbct_state = PbctState {
        root: current.pbct_root,
        height: current.pbct_height,
        free_list: FreeListState { head: current.free_list_head },
    };

    let (leaf_block_id, mut leaf) = pbct::io::ensure_leaf_for_page(
        vlf,
        &mut pbct_state,
        page_id,
        payload_len,
        strategy.block_size,
        strategy.extension_size,
    )?;

    let slot = pbct::traversal_path(
        page_id,
        pbct_state.height,
        pbct::interior_fanout(payload_len),
        pbct::leaf_fanout(payload_len),
    )
    .leaf_slot;
    let entry = leaf.entries[slot];

    let (src_block_id, src_block, src_in_mdf) = if entry.is_invalid() {
        let block_id = BlockId::new(page_id.get());
        let block = mdf
            .read_block(block_id)
            .map_err(|e| VersionError::Unexpected(e.to_string()))?;
        (block_id, block, true)
    } else {
        let block = vlf
            .read_block(entry.latest_block_id)
            .map_err(|e| VersionError::Unexpected(e.to_string()))?;
        (entry.latest_block_id, block, false)
    };

    let (dst_block_id, dst_block, _reused) = allocate_log(
        vlf,
        tx,
        &mut pbct_state,
        strategy,
        &descriptor,
        src_block_id,
        &src_block,
        src_in_mdf,
    )?;

    if entry.latest_block_id != dst_block_id {
        leaf.entries[slot] = LeafEntry {
            latest_block_id: dst_block_id,
            timestamp: tx.start_timestamp(),
        };
        pbct::io::write_leaf_block(vlf, leaf_block_id, &leaf, strategy.block_size)?;
    }

    let updated_copy = HeaderCopy {
        page_count: current.page_count,
        pbct_height: pbct_state.height,
        pbct_root: pbct_state.root,
        free_list_head: pbct_state.free_list.head,
        newest_ts: newer(current.newest_ts, tx.start_timestamp()),
        generation: current.generation,
    };
    header_io::write_header(vlf, &header, strategy.block_size, updated_copy)?;

    Ok(FixedPage {
        page_id,
        location: BlockLocation::Vlf,
        block_id: dst_block_id,
        block: dst_block,
        mode,
        touched: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TxId;
    use crate::storage::collaborators::TransactionCategory;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering;

    struct FakeTx {
        id: TxId,
        start: Timestamp,
        read_only: bool,
        in_progress: Vec<TxId>,
        canceled: AtomicBool,
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
            self.canceled.load(Ordering::SeqCst)
        }
        fn overlaps(&self, other: TxId) -> bool {
            self.in_progress.contains(&other) || other.0 > self.id.0
        }
    }

    fn tx(id: u64, start: u64) -> FakeTx {
        FakeTx {
            id: TxId::new(id),
            start: Timestamp::new(start),
            read_only: false,
            in_progress: Vec::new(),
            canceled: AtomicBool::new(false),
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
    fn allocate_then_write_then_read_round_trips_p4() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = VersionedFile::new("test".to_string(), strategy(dir.path()));

        let writer = tx(1, 100);
        let mut view = fix(&file, &writer, PageId::new(0), FixMode::Allocate).expect("allocate");
        view.block.payload_mut()[0] = 0x99;
        unfix(&file, &writer, view, true).expect("unfix");

        let reader = tx(2, 200);
        let read_view = fix(&file, &reader, PageId::new(0), FixMode::ReadOnly).expect("read");
        assert_eq!(read_view.block.payload()[0], 0x99);
    }

    #[test]
    fn earlier_snapshot_does_not_see_a_later_write_p3() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = VersionedFile::new("test".to_string(), strategy(dir.path()));

        let first_writer = tx(1, 100);
        let mut view = fix(&file, &first_writer, PageId::new(0), FixMode::Allocate).expect("allocate");
        view.block.payload_mut()[0] = 0xAA;
        unfix(&file, &first_writer, view, true).expect("unfix");

        let second_writer = tx(2, 200);
        let mut view2 = fix(&file, &second_writer, PageId::new(0), FixMode::Write).expect("write");
        view2.block.payload_mut()[0] = 0xBB;
        unfix(&file, &second_writer, view2, true).expect("unfix");

        let early_reader = tx(3, 150);
        let read_view = fix(&file, &early_reader, PageId::new(0), FixMode::ReadOnly).expect("read");
        assert_eq!(read_view.block.payload()[0], 0xAA);

        let late_reader = tx(4, 250);
        let read_view = fix(&file, &late_reader, PageId::new(0), FixMode::ReadOnly).expect("read");
        assert_eq!(read_view.block.payload()[0], 0xBB);
    }

    #[test]
    fn read_only_transaction_cannot_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = VersionedFile::new("test".to_string(), strategy(dir.path()));
        let mut reader = tx(1, 100);
        reader.read_only = true;
        assert!(matches!(
            fix(&file, &reader, PageId::new(0), FixMode::Allocate),
            Err(VersionError::ReadOnlyTransaction)
        ));
    }
}
