//! PBCT node/leaf encoding (§3, §4.4, §6).
//!
//! Interior nodes hold `F` child `BlockId`s indexed positionally; leaves
//! hold `F_leaf` `{latest_block_id, timestamp}` entries. Both fanouts are
//! derived from the block's payload size, not hardcoded, since block size
//! is a per-file runtime constant (§6).

use crate::ids::{BlockId, Timestamp};

const CHILD_ENTRY_SIZE: usize = 8; // one BlockId
const LEAF_ENTRY_SIZE: usize = 16; // BlockId + Timestamp

/// Fan-out of an interior node for a payload of `payload_len` bytes.
#[must_use]
pub const fn interior_fanout(payload_len: usize) -> usize {
    payload_len / CHILD_ENTRY_SIZE
}

/// Fan-out of a leaf for a payload of `payload_len` bytes.
#[must_use]
pub const fn leaf_fanout(payload_len: usize) -> usize {
    payload_len / LEAF_ENTRY_SIZE
}

/// In-memory view of an interior PBCT node.
#[derive(Debug, Clone)]
pub struct InteriorNode {
    pub children: Vec<BlockId>,
}

impl InteriorNode {
    #[must_use]
    pub fn empty(fanout: usize) -> Self {
        Self {
            children: vec![BlockId::INVALID; fanout],
        }
    }

    #[must_use]
    pub fn decode(payload: &[u8]) -> Self {
        let fanout = interior_fanout(payload.len());
        let mut children = Vec::with_capacity(fanout);
        for i in 0..fanout {
            let off = i * CHILD_ENTRY_SIZE;
            let bytes: [u8; 8] = payload[off..off + 8].try_into().expect("8-byte slice");
            children.push(BlockId::new(u64::from_le_bytes(bytes)));
        }
        Self { children }
    }

    pub fn encode_into(&self, payload: &mut [u8]) {
        for (i, child) in self.children.iter().enumerate() {
            let off = i * CHILD_ENTRY_SIZE;
            payload[off..off + 8].copy_from_slice(&child.get().to_le_bytes());
        }
    }
}

/// One leaf entry: the latest `BlockId` for a page and its newest (or, in
/// format v1, oldest) timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafEntry {
    pub latest_block_id: BlockId,
    pub timestamp: Timestamp,
}

impl LeafEntry {
    #[must_use]
    pub const fn invalid() -> Self {
        Self {
            latest_block_id: BlockId::INVALID,
            timestamp: Timestamp::ILLEGAL,
        }
    }

    #[must_use]
    pub const fn is_invalid(self) -> bool {
        !self.latest_block_id.is_valid()
    }
}

/// In-memory view of a PBCT leaf.
#[derive(Debug, Clone)]
pub struct Leaf {
    pub entries: Vec<LeafEntry>,
}

impl Leaf {
    #[must_use]
    pub fn empty(fanout: usize) -> Self {
        Self {
            entries: vec![LeafEntry::invalid(); fanout],
        }
    }

    #[must_use]
    pub fn decode(payload: &[u8]) -> Self {
        let fanout = leaf_fanout(payload.len());
        let mut entries = Vec::with_capacity(fanout);
        for i in 0..fanout {
            let off = i * LEAF_ENTRY_SIZE;
            let block_bytes: [u8; 8] = payload[off..off + 8].try_into().expect("8-byte slice");
            let ts_bytes: [u8; 8] = payload[off + 8..off + 16].try_into().expect("8-byte slice");
            entries.push(LeafEntry {
                latest_block_id: BlockId::new(u64::from_le_bytes(block_bytes)),
                timestamp: Timestamp::new(u64::from_le_bytes(ts_bytes)),
            });
        }
        Self { entries }
    }

    pub fn encode_into(&self, payload: &mut [u8]) {
        for (i, entry) in self.entries.iter().enumerate() {
            let off = i * LEAF_ENTRY_SIZE;
            payload[off..off + 8].copy_from_slice(&entry.latest_block_id.get().to_le_bytes());
            payload[off + 8..off + 16].copy_from_slice(&entry.timestamp.get().to_le_bytes());
        }
    }

    #[must_use]
    pub fn all_invalid(&self) -> bool {
        self.entries.iter().all(|e| e.is_invalid())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interior_node_round_trips() {
        let mut node = InteriorNode::empty(interior_fanout(64));
        node.children[2] = BlockId::new(99);
        let mut buf = vec![0u8; 64];
        node.encode_into(&mut buf);
        let restored = InteriorNode::decode(&buf);
        assert_eq!(restored.children[2], BlockId::new(99));
        assert!(!restored.children[0].is_valid());
    }

    #[test]
    fn leaf_round_trips() {
        let fanout = leaf_fanout(64);
        let mut leaf = Leaf::empty(fanout);
        leaf.entries[1] = LeafEntry {
            latest_block_id: BlockId::new(5),
            timestamp: Timestamp::new(77),
        };
        let mut buf = vec![0u8; 64];
        leaf.encode_into(&mut buf);
        let restored = Leaf::decode(&buf);
        assert_eq!(restored.entries[1].latest_block_id, BlockId::new(5));
        assert_eq!(restored.entries[1].timestamp, Timestamp::new(77));
        assert!(restored.entries[0].is_invalid());
    }

    #[test]
    fn all_invalid_detects_an_empty_leaf() {
        let leaf = Leaf::empty(leaf_fanout(64));
        assert!(leaf.all_invalid());
    }
}
