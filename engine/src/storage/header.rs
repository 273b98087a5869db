//! The VLF file header: payload of VLF blocks 0, 1 and 2, multiplexed three
//! ways so a torn write on one copy can be tolerated (§3, §9).
//!
//! Per the design note in §9, the three copies are represented as a sum
//! type `[HeaderCopy; 3]` with an explicit `master` index chosen by the
//! quorum rule; a copy is never mutated in place.

use crate::ids::{BlockId, Timestamp};

/// Magic identifying a VLF header replica.
pub const MAGIC: [u8; 4] = *b"VLF1";

/// VLF header format version. Version 2+ adds `newest_ts`; this engine
/// always writes version 2.
pub const FORMAT_VERSION: u32 = 2;

mod offsets {
    pub const MAGIC: usize = 0;
    pub const FORMAT_VERSION: usize = 4;
    pub const PAGE_COUNT: usize = 8;
    pub const PBCT_HEIGHT: usize = 16;
    pub const PBCT_ROOT: usize = 24;
    pub const FREE_LIST_HEAD: usize = 32;
    pub const NEWEST_TS: usize = 40;
    pub const GENERATION: usize = 48;
    pub const CHECKSUM: usize = 56;
    pub const LEN: usize = 60;
}

/// One physical replica of the VLF file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderCopy {
    pub page_count: u64,
    pub pbct_height: u32,
    pub pbct_root: BlockId,
    pub free_list_head: BlockId,
    pub newest_ts: Timestamp,
    pub generation: u64,
}

impl HeaderCopy {
    #[must_use]
    pub const fn fresh() -> Self {
        Self {
            page_count: 0,
            pbct_height: 0,
            pbct_root: BlockId::INVALID,
            free_list_head: BlockId::INVALID,
            newest_ts: Timestamp::ILLEGAL,
            generation: 0,
        }
    }

    /// Serialize into a payload buffer; `buf` must be at least `offsets::LEN` bytes.
    pub fn write_into(&self, buf: &mut [u8]) {
        buf[offsets::MAGIC..offsets::MAGIC + 4].copy_from_slice(&MAGIC);
        buf[offsets::FORMAT_VERSION..offsets::FORMAT_VERSION + 4]
            .copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[offsets::PAGE_COUNT..offsets::PAGE_COUNT + 8]
            .copy_from_slice(&self.page_count.to_le_bytes());
        buf[offsets::PBCT_HEIGHT..offsets::PBCT_HEIGHT + 4]
            .copy_from_slice(&self.pbct_height.to_le_bytes());
        buf[offsets::PBCT_ROOT..offsets::PBCT_ROOT + 8]
            .copy_from_slice(&self.pbct_root.get().to_le_bytes());
        buf[offsets::FREE_LIST_HEAD..offsets::FREE_LIST_HEAD + 8]
            .copy_from_slice(&self.free_list_head.get().to_le_bytes());
        buf[offsets::NEWEST_TS..offsets::NEWEST_TS + 8]
            .copy_from_slice(&self.newest_ts.get().to_le_bytes());
        buf[offsets::GENERATION..offsets::GENERATION + 8]
            .copy_from_slice(&self.generation.to_le_bytes());

        let checksum = Self::checksum_of(&buf[..offsets::CHECKSUM]);
        buf[offsets::CHECKSUM..offsets::CHECKSUM + 4].copy_from_slice(&checksum.to_le_bytes());
    }

    /// Parse a replica, validating magic, version and checksum.
    ///
    /// Returns `None` (rather than an error) when the replica is torn or
    /// zeroed — the caller's quorum rule treats an inconsistent replica as
    /// simply absent from the vote, per §3/§9/P7.
    #[must_use]
    pub fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < offsets::LEN {
            return None;
        }
        if buf[offsets::MAGIC..offsets::MAGIC + 4] != MAGIC {
            return None;
        }
        let format_version =
            u32::from_le_bytes(buf[offsets::FORMAT_VERSION..offsets::FORMAT_VERSION + 4].try_into().ok()?);
        if format_version != FORMAT_VERSION {
            return None;
        }
        let stored_checksum =
            u32::from_le_bytes(buf[offsets::CHECKSUM..offsets::CHECKSUM + 4].try_into().ok()?);
        if Self::checksum_of(&buf[..offsets::CHECKSUM]) != stored_checksum {
            return None;
        }

        Some(Self {
            page_count: u64::from_le_bytes(
                buf[offsets::PAGE_COUNT..offsets::PAGE_COUNT + 8].try_into().ok()?,
            ),
            pbct_height: u32::from_le_bytes(
                buf[offsets::PBCT_HEIGHT..offsets::PBCT_HEIGHT + 4].try_into().ok()?,
            ),
            pbct_root: BlockId::new(u64::from_le_bytes(
                buf[offsets::PBCT_ROOT..offsets::PBCT_ROOT + 8].try_into().ok()?,
            )),
            free_list_head: BlockId::new(u64::from_le_bytes(
                buf[offsets::FREE_LIST_HEAD..offsets::FREE_LIST_HEAD + 8].try_into().ok()?,
            )),
            newest_ts: Timestamp::new(u64::from_le_bytes(
                buf[offsets::NEWEST_TS..offsets::NEWEST_TS + 8].try_into().ok()?,
            )),
            generation: u64::from_le_bytes(
                buf[offsets::GENERATION..offsets::GENERATION + 8].try_into().ok()?,
            ),
        })
    }

    fn checksum_of(bytes: &[u8]) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(bytes);
        hasher.finalize()
    }
}

/// The three multiplexed header replicas plus the index of the currently
/// selected master, per the §9 design note.
#[derive(Debug, Clone)]
pub struct FileHeader {
    pub copies: [HeaderCopy; 3],
    pub master: usize,
}

impl FileHeader {
    #[must_use]
    pub const fn fresh() -> Self {
        Self {
            copies: [HeaderCopy::fresh(), HeaderCopy::fresh(), HeaderCopy::fresh()],
            master: 0,
        }
    }

    /// The currently authoritative header contents.
    #[must_use]
    pub fn current(&self) -> HeaderCopy {
        self.copies[self.master]
    }

    /// Quorum rule (§3): pick the internally consistent replica with the
    /// highest generation counter. `raw` holds the three on-disk payloads in
    /// block order (0, 1, 2); a replica that fails to parse (torn/zeroed,
    /// §9/P7) does not participate in the vote.
    ///
    /// # Errors
    /// Returns `HeaderError::NoQuorum` if every replica is inconsistent.
    pub fn from_replicas(raw: [&[u8]; 3]) -> Result<Self, HeaderError> {
        let parsed: [Option<HeaderCopy>; 3] = [
            HeaderCopy::read_from(raw[0]),
            HeaderCopy::read_from(raw[1]),
            HeaderCopy::read_from(raw[2]),
        ];

        let master = parsed
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.map(|c| (i, c)))
            .max_by_key(|(_, c)| c.generation)
            .map(|(i, _)| i)
            .ok_or(HeaderError::NoQuorum)?;

        let winner = parsed[master].expect("master index came from a Some entry");
        let copies = [
            parsed[0].unwrap_or(winner),
            parsed[1].unwrap_or(winner),
            parsed[2].unwrap_or(winner),
        ];

        Ok(Self { copies, master })
    }

    /// Produce the next generation's three replica payloads, ready to be
    /// written to VLF blocks 0, 1, 2 in that fixed order (§5: "writing them
    /// in a fixed order").
    #[must_use]
    pub fn next_generation(&self, updated: HeaderCopy) -> [HeaderCopy; 3] {
        let mut next = updated;
        next.generation = self.current().generation.wrapping_add(1);
        [next, next, next]
    }
}

#[derive(Debug)]
pub enum HeaderError {
    /// No replica was internally consistent; the VLF header cannot be trusted.
    NoQuorum,
}

impl std::fmt::Display for HeaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoQuorum => write!(f, "no internally consistent header replica found"),
        }
    }
}

impl std::error::Error for HeaderError {}
