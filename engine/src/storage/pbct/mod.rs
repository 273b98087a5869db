//! Page-Block-Correspondence Tree: the fixed-fanout index mapping PageID to
//! the latest VLF BlockID for that page (§4.4).
//!
//! Unlike a key-comparison B-tree, the PBCT is navigated by pure integer
//! arithmetic on the `PageId` (see [`tree::traversal_path`]); node/leaf
//! on-disk encoding lives in [`node`].

pub mod io;
mod node;
mod tree;

pub use node::{InteriorNode, Leaf, LeafEntry, interior_fanout, leaf_fanout};
pub use tree::{TraversalPath, capacity, height_needed_for, traversal_path};
