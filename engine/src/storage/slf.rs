//! Sync Log File pre-image encoding, shared by [`super::sync`] and
//! [`super::recovery`] (§4.5, §4.7).
//!
//! An SLF mirrors the MDF's block numbering: pre-image block `p` (if
//! present) holds the MDF contents of PageID `p` exactly as they stood
//! before `sync` overwrote them.

use crate::error::{VersionError, VersionResult};
use crate::ids::{BlockId, PageId, Timestamp};
use crate::storage::block::{Block, BlockCategory, BlockHeader};
use crate::storage::io::Storage;

/// Whether `page_id` has a pre-image recorded in `slf`.
///
/// # Errors
/// Propagates I/O errors from the underlying storage.
pub fn has_preimage(slf: &mut dyn Storage, page_id: PageId) -> VersionResult<bool> {
    if page_id.get() >= slf.total_blocks() {
        return Ok(false);
    }
    let block = slf
        .read_block(BlockId::new(page_id.get()))
        .map_err(|e| VersionError::Unexpected(e.to_string()))?;
    Ok(matches!(block.header(), Ok(h) if h.category == BlockCategory::PreImage))
}

/// Record `mdf_block` as the pre-image of `page_id`, extending the SLF if needed.
///
/// # Errors
/// Propagates I/O errors from the underlying storage.
pub fn write_preimage(slf: &mut dyn Storage, page_id: PageId, mdf_block: &Block) -> VersionResult<()> {
    if page_id.get() >= slf.total_blocks() {
        let needed = page_id.get() + 1 - slf.total_blocks();
        slf.allocate_blocks(needed)
            .map_err(|e| VersionError::Unexpected(e.to_string()))?;
    }
    let mut block = mdf_block.clone();
    let mut header = block.header().unwrap_or(BlockHeader {
        category: BlockCategory::FirstVersion,
        flags: 0,
        last_modification: Timestamp::ILLEGAL,
        older_block_id: BlockId::INVALID,
        older_timestamp: Timestamp::ILLEGAL,
    });
    header.category = BlockCategory::PreImage;
    block.set_header(header);
    slf.write_block(BlockId::new(page_id.get()), &block)
        .map_err(|e| VersionError::Unexpected(e.to_string()))
}

/// Read back the pre-image for `page_id`, restoring its original MDF
/// category (`FirstVersion`) so it can be written straight back into the MDF.
///
/// # Errors
/// Propagates I/O / corruption errors.
pub fn read_preimage(slf: &mut dyn Storage, page_id: PageId) -> VersionResult<Option<Block>> {
    if !has_preimage(slf, page_id)? {
        return Ok(None);
    }
    let mut block = slf
        .read_block(BlockId::new(page_id.get()))
        .map_err(|e| VersionError::Unexpected(e.to_string()))?;
    let mut header = block
        .header()
        .map_err(|e| VersionError::LogItemCorrupted(e.to_string()))?;
    header.category = BlockCategory::FirstVersion;
    block.set_header(header);
    Ok(Some(block))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::simulated::{FaultConfig, SimulatedStorage};

    #[test]
    fn preimage_round_trips_and_is_detected() {
        let mut slf: Box<dyn Storage> = Box::new(SimulatedStorage::new(64, 1, FaultConfig::none()));
        let page = PageId::new(3);
        assert!(!has_preimage(slf.as_mut(), page).expect("check"));

        let mut mdf_block = Block::zeroed(64);
        mdf_block.payload_mut()[0] = 0x77;
        write_preimage(slf.as_mut(), page, &mdf_block).expect("write");
        assert!(has_preimage(slf.as_mut(), page).expect("check"));

        let restored = read_preimage(slf.as_mut(), page).expect("read").expect("present");
        assert_eq!(restored.payload()[0], 0x77);
        assert_eq!(restored.header().expect("header").category, BlockCategory::FirstVersion);
    }
}
