//! PBCT traversal arithmetic (§4.4).
//!
//! The PBCT is navigated by pure integer arithmetic, never by comparing
//! keys: at level `l` (counting down from the root) the child index is
//! `(page_id / interior_fanout^l) mod interior_fanout`, and the final leaf
//! slot is `page_id mod leaf_fanout`.

use crate::ids::PageId;

/// The path from root to leaf for a given `PageId`: one child index per
/// interior level (root-to-parent-of-leaf order), plus the leaf slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraversalPath {
    pub child_indices: Vec<usize>,
    pub leaf_slot: usize,
}

/// Compute the traversal path for `page_id` through a tree of the given
/// `height` (0 = the leaf is the header itself, per §4.4).
#[must_use]
pub fn traversal_path(
    page_id: PageId,
    height: u32,
    interior_fanout: usize,
    leaf_fanout: usize,
) -> TraversalPath {
    let leaf_fanout = leaf_fanout.max(1);
    let interior_fanout = interior_fanout.max(1);

    // Which leaf (numbered 0, 1, 2, ...) covers this page, and the slot
    // inside it.
    let leaf_index = page_id.get() / leaf_fanout as u64;
    let leaf_slot = (page_id.get() % leaf_fanout as u64) as usize;

    let mut child_indices = Vec::with_capacity(height as usize);
    let mut remaining = leaf_index;
    for _ in 0..height {
        child_indices.push((remaining % interior_fanout as u64) as usize);
        remaining /= interior_fanout as u64;
    }
    child_indices.reverse();

    TraversalPath {
        child_indices,
        leaf_slot,
    }
}

/// Highest `PageId` (exclusive upper bound) addressable by a tree of the
/// given height, used to decide whether a write needs height promotion.
#[must_use]
pub fn capacity(height: u32, interior_fanout: usize, leaf_fanout: usize) -> u64 {
    let mut cap = leaf_fanout as u64;
    for _ in 0..height {
        cap = cap.saturating_mul(interior_fanout as u64);
    }
    cap
}

/// The minimal height covering `page_id`, given the current height as a
/// starting point — height only ever grows one level at a time (§4.4), but
/// this returns however many promotions are needed in one step for callers
/// that batch allocation.
#[must_use]
pub fn height_needed_for(
    page_id: PageId,
    mut height: u32,
    interior_fanout: usize,
    leaf_fanout: usize,
) -> u32 {
    while page_id.get() >= capacity(height, interior_fanout, leaf_fanout) {
        height += 1;
    }
    height
}
