//! `recover`/`restore` (§4.7): crash recovery and point-in-time rollback.
//!
//! Both operations lean on primitives already built for [`super::sync`]:
//! the header quorum (§3, P7) does the heavy lifting of "VLF recovers
//! itself", and [`super::slf`] holds whatever pre-images `sync` captured
//! before an interrupted migration pass.

use crate::error::{VersionError, VersionResult};
use crate::ids::{BlockId, PageId, Timestamp};
use crate::storage::block;
use crate::storage::collaborators::Transaction;
use crate::storage::descriptor::VersionedFile;
use crate::storage::file::FileStorage;
use crate::storage::header::HeaderCopy;
use crate::storage::freelist::FreeListState;
use crate::storage::header_io;
use crate::storage::io::Storage;
use crate::storage::pbct::io::PbctState;
use crate::storage::pbct::{self, LeafEntry};
use crate::storage::slf;

/// Outcome of `recover` (§4.7).
#[derive(Debug, Clone, Copy, Default)]
pub struct RecoverOutcome {
    pub pages_restored_from_preimage: usize,
    pub vlf_deleted: bool,
}

/// Outcome of `restore` (§4.7).
#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOutcome {
    pub pages_rolled_back: usize,
    pub vlf_deleted: bool,
}

fn open_slf_if_present(path: &std::path::Path, block_size: usize) -> Option<Box<dyn Storage>> {
    FileStorage::open(path, block_size)
        .ok()
        .map(|s| Box::new(s) as Box<dyn Storage>)
}

fn replay_preimages(slf: &mut dyn Storage, mdf: &mut dyn Storage) -> VersionResult<usize> {
    let mut restored = 0usize;
    for raw in 0..slf.total_blocks() {
        let page_id = PageId::new(raw);
        if let Some(block) = slf::read_preimage(slf, page_id)? {
            mdf.write_block(BlockId::new(raw), &block)
                .map_err(|e| VersionError::Unexpected(e.to_string()))?;
            restored += 1;
        }
    }
    Ok(restored)
}

/// `recover(tx)` (§4.7): undo an interrupted `sync` and/or rebuild after a
/// crash.
///
/// The presence of any SLF content is itself the signal that `sync` did not
/// reach its unconditional SLF deletion (the last step of §4.5); `recover`
/// always replays it and discards it, never attempting to tell a
/// fully-migrated candidate apart from a half-migrated one. A candidate's
/// VLF-side commit (leaf invalidation + chain free) and its header write
/// happen together in the same call, so an un-replayed pre-image never
/// coexists with a VLF chain that still thinks it owns the page.
///
/// # Errors
/// Propagates I/O or corruption errors encountered while reading the VLF
/// header or replaying pre-images.
pub fn recover(file: &VersionedFile, _tx: &dyn Transaction) -> VersionResult<RecoverOutcome> {
    let _span = tracing::info_span!("recover", lock_name = %file.lock_name).entered();
    let strategy = file.strategy.read().clone();
    let mut state = file.state.write();

    if state.files.vlf.is_some() {
        let vlf = state.files.vlf.as_mut().expect("checked above");
        let header = header_io::read_header(vlf)?;

        if header.current().page_count == 0 {
            if let Some(mdf) = state.files.mdf.as_mut() {
                mdf.truncate(0).map_err(|e| VersionError::Unexpected(e.to_string()))?;
            }
            if let Some(vlf) = state.files.vlf.take() {
                vlf.delete().map_err(|e| VersionError::Unexpected(e.to_string()))?;
            }
            tracing::info!(vlf_deleted = true, "recover found an empty VLF and dropped it");
            return Ok(RecoverOutcome {
                pages_restored_from_preimage: 0,
                vlf_deleted: true,
            });
        }
    }

    if state.files.slf.is_none() {
        state.files.slf = open_slf_if_present(&strategy.slf_path, strategy.block_size);
    }

    let mut restored = 0usize;
    if let Some(mut slf) = state.files.slf.take() {
        if let Some(mdf) = state.files.mdf.as_mut() {
            restored = replay_preimages(slf.as_mut(), mdf.as_mut())?;
            mdf.sync().map_err(|e| VersionError::Unexpected(e.to_string()))?;
        }
        slf.delete().map_err(|e| VersionError::Unexpected(e.to_string()))?;
    }

    tracing::info!(pages_restored_from_preimage = restored, "recover finished replaying the SLF");
    Ok(RecoverOutcome {
        pages_restored_from_preimage: restored,
        vlf_deleted: false,
    })
}

/// `restore(tx, point)` (§4.7): roll the file back to the snapshot a
/// version-using transaction starting at `point` would have seen, discarding
/// every version newer than that. If no page retains a version older than
/// `point`, the VLF is dropped entirely (nothing in it predates `point`).
///
/// # Errors
/// Propagates I/O or corruption errors.
pub fn restore(file: &VersionedFile, _tx: &dyn Transaction, point: Timestamp) -> VersionResult<RestoreOutcome> {
    let _span = tracing::info_span!("restore", lock_name = %file.lock_name, point = point.0).entered();
    let strategy = file.strategy.read().clone();
    let mut state = file.state.write();

    if state.files.vlf.is_none() {
        return Ok(RestoreOutcome::default());
    }

    let payload_len = block::payload_len(&strategy);
    let vlf = state.files.vlf.as_mut().expect("checked above");
    let header = header_io::read_header(vlf)?;
    let current = header.current();
    let mut pbct_state = PbctState {
        root: current.pbct_root,
        height: current.pbct_height,
        free_list: FreeListState { head: current.free_list_head },
    };

    let leaf_fanout = pbct::leaf_fanout(payload_len);
    let total_leaves = current.page_count.div_ceil(leaf_fanout as u64).max(1);

    let mut rolled_back = 0usize;
    let mut any_survivor = false;

    for leaf_index in 0..total_leaves {
        let representative = PageId::new(leaf_index * leaf_fanout as u64);
        let Some((leaf_block_id, mut leaf)) = pbct::io::leaf_for_page(vlf, &pbct_state, representative, payload_len)?
        else {
            continue;
        };

        let mut changed = false;
        for (slot, entry) in leaf.entries.clone().into_iter().enumerate() {
            if entry.is_invalid() {
                continue;
            }

            match crate::storage::fix::select_version(vlf, point, entry.latest_block_id)? {
                Some((found_block_id, _found_block)) if found_block_id == entry.latest_block_id => {
                    any_survivor = true;
                }
                Some((found_block_id, found_block)) => {
                    let found_header = found_block
                        .header()
                        .map_err(|e| VersionError::LogItemCorrupted(e.to_string()))?;
                    let mut chain_block_id = entry.latest_block_id;
                    while chain_block_id != found_block_id {
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
                    leaf.entries[slot] = LeafEntry {
                        latest_block_id: found_block_id,
                        timestamp: found_header.last_modification,
                    };
                    changed = true;
                    rolled_back += 1;
                    any_survivor = true;
                }
                None => {
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
                    rolled_back += 1;
                }
            }
        }

        if changed {
            pbct::io::write_leaf_block(vlf, leaf_block_id, &leaf, strategy.block_size)?;
        }
    }

    if !any_survivor {
        if let Some(vlf) = state.files.vlf.take() {
            vlf.delete().map_err(|e| VersionError::Unexpected(e.to_string()))?;
        }
        tracing::info!(pages_rolled_back = rolled_back, vlf_deleted = true, "restore found no surviving version and dropped the VLF");
        return Ok(RestoreOutcome {
            pages_rolled_back: rolled_back,
            vlf_deleted: true,
        });
    }

    let updated_copy = HeaderCopy {
        page_count: current.page_count,
        pbct_height: pbct_state.height,
        pbct_root: pbct_state.root,
        free_list_head: pbct_state.free_list.head,
        newest_ts: current.newest_ts,
        generation: current.generation,
    };
    let vlf = state.files.vlf.as_mut().expect("checked above");
    header_io::write_header(vlf, &header, strategy.block_size, updated_copy)?;
    vlf.sync().map_err(|e| VersionError::Unexpected(e.to_string()))?;

    tracing::info!(pages_rolled_back = rolled_back, "restore finished rolling back to the requested point");
    Ok(RestoreOutcome {
        pages_rolled_back: rolled_back,
        vlf_deleted: false,
    })
}
