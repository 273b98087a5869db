//! PBCT traversal and allocation wired to a `Storage` instance (§4.4).
//!
//! Unlike the in-memory-only arithmetic in [`super::tree`], this module
//! performs the actual node/leaf reads and writes, and owns the free-list
//! pop/push used to materialize new tree nodes.

use crate::error::{VersionError, VersionResult};
use crate::ids::{BlockId, PageId, Timestamp};
use crate::storage::block::{Block, BlockCategory, BlockHeader};
use crate::storage::freelist::{rounded_extension_size, FreeListState};
use crate::storage::io::Storage;
use crate::storage::pbct::node::{InteriorNode, Leaf, interior_fanout, leaf_fanout};
use crate::storage::pbct::tree::{height_needed_for, traversal_path};

/// The three header fields the PBCT mutates together, threaded through a
/// single fix/allocate-log call so the net change is applied in one header
/// write (§9: "height promotion... sequence these updates").
#[derive(Debug, Clone, Copy)]
pub struct PbctState {
    pub root: BlockId,
    pub height: u32,
    pub free_list: FreeListState,
}

fn read_node(vlf: &mut dyn Storage, id: BlockId) -> VersionResult<Block> {
    vlf.read_block(id)
        .map_err(|e| VersionError::Unexpected(e.to_string()))
}

fn write_node(vlf: &mut dyn Storage, id: BlockId, block: &Block) -> VersionResult<()> {
    vlf.write_block(id, block)
        .map_err(|e| VersionError::Unexpected(e.to_string()))
}

fn structural_header(category: BlockCategory) -> BlockHeader {
    BlockHeader {
        category,
        flags: 0,
        last_modification: Timestamp::ILLEGAL,
        older_block_id: BlockId::INVALID,
        older_timestamp: Timestamp::ILLEGAL,
    }
}

/// Pop one block off the free list, extending the VLF by `extension_size`
/// (rounded per §4.3) first if the list is empty.
///
/// # Errors
/// Propagates I/O errors from the underlying storage.
pub fn pop_free_block(
    vlf: &mut dyn Storage,
    state: &mut PbctState,
    block_size: usize,
    extension_size: u64,
) -> VersionResult<BlockId> {
    if state.free_list.is_empty() {
        extend_free_list(vlf, state, block_size, extension_size)?;
    }
    let head = state.free_list.head;
    let block = read_node(vlf, head)?;
    let header = block
        .header()
        .map_err(|e| VersionError::LogItemCorrupted(e.to_string()))?;
    let (popped, rest) = state.free_list.pop(header.older_block_id);
    state.free_list = rest;
    Ok(popped)
}

/// Return `id` to the front of the free list.
///
/// # Errors
/// Propagates I/O errors from the underlying storage.
pub fn push_free_block(
    vlf: &mut dyn Storage,
    state: &mut PbctState,
    block_size: usize,
    id: BlockId,
) -> VersionResult<()> {
    let mut block = Block::zeroed(block_size);
    let mut header = structural_header(BlockCategory::FreeListBlock);
    header.older_block_id = state.free_list.head;
    block.set_header(header);
    write_node(vlf, id, &block)?;
    state.free_list = state.free_list.push(id);
    Ok(())
}

fn extend_free_list(
    vlf: &mut dyn Storage,
    state: &mut PbctState,
    block_size: usize,
    extension_size: u64,
) -> VersionResult<()> {
    let file_size = vlf.total_blocks() * block_size as u64;
    let extension_bytes = rounded_extension_size(file_size.max(block_size as u64), extension_size.max(1));
    let extension_blocks = (extension_bytes / block_size as u64).max(1);

    let first = vlf
        .allocate_blocks(extension_blocks)
        .map_err(|e| VersionError::Unexpected(e.to_string()))?;

    for i in 0..extension_blocks {
        let id = BlockId::new(first.get() + i);
        let next = if i + 1 < extension_blocks {
            BlockId::new(first.get() + i + 1)
        } else {
            BlockId::INVALID
        };
        let mut block = Block::zeroed(block_size);
        let mut header = structural_header(BlockCategory::FreeListBlock);
        header.older_block_id = next;
        block.set_header(header);
        write_node(vlf, id, &block)?;
    }
    state.free_list = state.free_list.push(first);
    Ok(())
}

fn write_fresh_leaf(vlf: &mut dyn Storage, id: BlockId, leaf_fanout: usize, block_size: usize) -> VersionResult<()> {
    let leaf = Leaf::empty(leaf_fanout);
    let mut block = Block::zeroed(block_size);
    block.set_header(structural_header(BlockCategory::PbctLeaf));
    leaf.encode_into(block.payload_mut());
    write_node(vlf, id, &block)
}

fn write_fresh_interior(
    vlf: &mut dyn Storage,
    id: BlockId,
    interior_fanout: usize,
    block_size: usize,
    child0: BlockId,
) -> VersionResult<()> {
    let mut node = InteriorNode::empty(interior_fanout);
    if !node.children.is_empty() {
        node.children[0] = child0;
    }
    let mut block = Block::zeroed(block_size);
    block.set_header(structural_header(BlockCategory::PbctNode));
    node.encode_into(block.payload_mut());
    write_node(vlf, id, &block)
}

/// Read-only traversal: returns `None` if the tree does not yet cover
/// `page_id` (no allocation performed).
///
/// # Errors
/// Propagates I/O / corruption errors encountered while walking the tree.
pub fn leaf_for_page(
    vlf: &mut dyn Storage,
    state: &PbctState,
    page_id: PageId,
    payload_len: usize,
) -> VersionResult<Option<(BlockId, Leaf)>> {
    if !state.root.is_valid() {
        return Ok(None);
    }
    let path = traversal_path(
        page_id,
        state.height,
        interior_fanout(payload_len),
        leaf_fanout(payload_len),
    );
    let mut current = state.root;
    for idx in &path.child_indices {
        let block = read_node(vlf, current)?;
        let node = InteriorNode::decode(block.payload());
        current = node.children[*idx];
        if !current.is_valid() {
            return Ok(None);
        }
    }
    let block = read_node(vlf, current)?;
    Ok(Some((current, Leaf::decode(block.payload()))))
}

/// Traverse to the leaf covering `page_id`, allocating interior nodes, the
/// leaf itself, and promoting the tree height as needed (§4.4).
///
/// # Errors
/// Propagates I/O / corruption errors, or free-list exhaustion errors.
pub fn ensure_leaf_for_page(
    vlf: &mut dyn Storage,
    state: &mut PbctState,
    page_id: PageId,
    payload_len: usize,
    block_size: usize,
    extension_size: u64,
) -> VersionResult<(BlockId, Leaf)> {
    let interior_f = interior_fanout(payload_len);
    let leaf_f = leaf_fanout(payload_len);

    if !state.root.is_valid() {
        let leaf_id = pop_free_block(vlf, state, block_size, extension_size)?;
        write_fresh_leaf(vlf, leaf_id, leaf_f, block_size)?;
        state.root = leaf_id;
        state.height = 0;
    }

    let needed_height = height_needed_for(page_id, state.height, interior_f, leaf_f);
    while state.height < needed_height {
        let new_root_id = pop_free_block(vlf, state, block_size, extension_size)?;
        write_fresh_interior(vlf, new_root_id, interior_f, block_size, state.root)?;
        state.root = new_root_id;
        state.height += 1;
    }

    let path = traversal_path(page_id, state.height, interior_f, leaf_f);
    let levels = path.child_indices.len();
    let mut current = state.root;
    for (level, idx) in path.child_indices.iter().enumerate() {
        let block = read_node(vlf, current)?;
        let mut node = InteriorNode::decode(block.payload());
        let mut child = node.children[*idx];
        if !child.is_valid() {
            child = pop_free_block(vlf, state, block_size, extension_size)?;
            if level + 1 == levels {
                write_fresh_leaf(vlf, child, leaf_f, block_size)?;
            } else {
                write_fresh_interior(vlf, child, interior_f, block_size, BlockId::INVALID)?;
            }
            node.children[*idx] = child;
            let mut updated = Block::zeroed(block_size);
            updated.set_header(block.header().map_err(|e| VersionError::LogItemCorrupted(e.to_string()))?);
            node.encode_into(updated.payload_mut());
            write_node(vlf, current, &updated)?;
        }
        current = child;
    }

    let block = read_node(vlf, current)?;
    Ok((current, Leaf::decode(block.payload())))
}

/// Persist a modified leaf back to its block.
///
/// # Errors
/// Propagates I/O errors from the underlying storage.
pub fn write_leaf_block(vlf: &mut dyn Storage, leaf_id: BlockId, leaf: &Leaf, block_size: usize) -> VersionResult<()> {
    let mut block = Block::zeroed(block_size);
    block.set_header(structural_header(BlockCategory::PbctLeaf));
    leaf.encode_into(block.payload_mut());
    write_node(vlf, leaf_id, &block)
}

/// If the leaf covering `page_id` has become all-invalid, free it and
/// cascade the pruning up through any ancestor interior node that is left
/// with no valid children, demoting the tree height if the root ends up
/// with a single child (§4.4 "Freeing"). A no-op if the leaf still holds a
/// live entry, or if the tree does not yet cover `page_id`.
///
/// # Errors
/// Propagates I/O / corruption errors.
pub fn prune_empty_leaf(
    vlf: &mut dyn Storage,
    state: &mut PbctState,
    page_id: PageId,
    payload_len: usize,
    block_size: usize,
) -> VersionResult<()> {
    if !state.root.is_valid() {
        return Ok(());
    }
    let interior_f = interior_fanout(payload_len);
    let leaf_f = leaf_fanout(payload_len);
    let path = traversal_path(page_id, state.height, interior_f, leaf_f);

    let mut ancestors: Vec<(BlockId, usize)> = Vec::with_capacity(path.child_indices.len());
    let mut current = state.root;
    for idx in &path.child_indices {
        let block = read_node(vlf, current)?;
        let node = InteriorNode::decode(block.payload());
        let child = node.children[*idx];
        if !child.is_valid() {
            return Ok(());
        }
        ancestors.push((current, *idx));
        current = child;
    }

    let leaf_id = current;
    let leaf_block = read_node(vlf, leaf_id)?;
    let leaf = Leaf::decode(leaf_block.payload());
    if !leaf.all_invalid() {
        return Ok(());
    }

    push_free_block(vlf, state, block_size, leaf_id)?;
    let mut freed_child = true;

    while let Some((node_id, idx)) = ancestors.pop() {
        let block = read_node(vlf, node_id)?;
        let mut node = InteriorNode::decode(block.payload());
        if freed_child {
            node.children[idx] = BlockId::INVALID;
        }
        if node.children.iter().any(|c| c.is_valid()) {
            let mut updated = Block::zeroed(block_size);
            updated.set_header(block.header().map_err(|e| VersionError::LogItemCorrupted(e.to_string()))?);
            node.encode_into(updated.payload_mut());
            write_node(vlf, node_id, &updated)?;
            freed_child = false;
        } else {
            push_free_block(vlf, state, block_size, node_id)?;
            freed_child = true;
        }
    }

    if freed_child {
        // Every level up to and including the root was freed: the tree is empty.
        state.root = BlockId::INVALID;
        state.height = 0;
        return Ok(());
    }

    demote_height(vlf, state, block_size)
}

/// While the root has exactly one valid child, free the root block and
/// promote that child to root, shrinking `state.height` (§4.4: "height
/// demotion when the root has a single child").
fn demote_height(vlf: &mut dyn Storage, state: &mut PbctState, block_size: usize) -> VersionResult<()> {
    while state.height > 0 {
        let block = read_node(vlf, state.root)?;
        let node = InteriorNode::decode(block.payload());
        let mut valid = node.children.iter().copied().filter(|c| c.is_valid());
        let Some(only_child) = valid.next() else { break };
        if valid.next().is_some() {
            break;
        }
        push_free_block(vlf, state, block_size, state.root)?;
        state.root = only_child;
        state.height -= 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::simulated::{FaultConfig, SimulatedStorage};

    fn vlf() -> Box<dyn Storage> {
        Box::new(SimulatedStorage::new(64, 7, FaultConfig::none()))
    }

    #[test]
    fn ensure_leaf_for_page_creates_the_initial_leaf() {
        let mut vlf = vlf();
        let mut state = PbctState {
            root: BlockId::INVALID,
            height: 0,
            free_list: FreeListState::empty(),
        };
        let (leaf_id, leaf) = ensure_leaf_for_page(vlf.as_mut(), &mut state, PageId::new(0), 64, 64, 4096).expect("ensure");
        assert!(leaf_id.is_valid());
        assert!(leaf.all_invalid());
        assert_eq!(state.root, leaf_id);
        assert_eq!(state.height, 0);
    }

    #[test]
    fn ensure_leaf_for_page_promotes_height_when_needed() {
        let mut vlf = vlf();
        let mut state = PbctState {
            root: BlockId::INVALID,
            height: 0,
            free_list: FreeListState::empty(),
        };
        let leaf_fanout_at_64 = leaf_fanout(64);
        let far_page = PageId::new((leaf_fanout_at_64 as u64) * 5);
        let (leaf_id, _) = ensure_leaf_for_page(vlf.as_mut(), &mut state, far_page, 64, 64, 4096).expect("ensure");
        assert!(state.height >= 1);
        assert!(leaf_id.is_valid());

        let found = leaf_for_page(vlf.as_mut(), &state, far_page, 64).expect("lookup").expect("present");
        assert_eq!(found.0, leaf_id);
    }

    #[test]
    fn leaf_for_page_returns_none_before_any_allocation() {
        let mut vlf = vlf();
        let state = PbctState {
            root: BlockId::INVALID,
            height: 0,
            free_list: FreeListState::empty(),
        };
        assert!(leaf_for_page(vlf.as_mut(), &state, PageId::new(0), 64).expect("lookup").is_none());
    }

    #[test]
    fn free_list_round_trips_through_push_and_pop() {
        let mut vlf = vlf();
        let mut state = PbctState {
            root: BlockId::INVALID,
            height: 0,
            free_list: FreeListState::empty(),
        };
        let a = pop_free_block(vlf.as_mut(), &mut state, 64, 4096).expect("pop extends and returns a block");
        push_free_block(vlf.as_mut(), &mut state, 64, a).expect("push");
        let b = pop_free_block(vlf.as_mut(), &mut state, 64, 4096).expect("pop reuses freed block");
        assert_eq!(a, b);
    }
}
