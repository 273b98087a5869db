//! MVCC page-level storage engine.
//!
//! A versioned file is three physical files — Master Data File (MDF),
//! Version Log File (VLF) and Sync Log File (SLF) — managed together so a
//! version-using transaction can `fix` a page and see the snapshot visible
//! at its start timestamp, while writers `allocate-log` new versions into
//! the VLF rather than overwriting the MDF in place.
//!
//! # File Format
//!
//! Every block (MDF, VLF or SLF) shares one header layout (see [`block`]);
//! VLF blocks 0-2 are the multiplexed file-header replicas (see [`header`]),
//! the remainder are PBCT nodes/leaves (see [`pbct`]), free-list links (see
//! [`freelist`]) or version records.

pub mod backup;
pub mod block;
pub mod cleanup;
pub mod collaborators;
pub mod descriptor;
pub mod file;
pub mod fix;
pub mod freelist;
pub mod header;
pub mod header_io;
pub mod io;
pub mod pbct;
pub mod recovery;
pub mod simulated;
pub mod slf;
pub mod sync;
pub mod truncate;
pub mod verify;

pub use backup::{end_backup, start_backup};
pub use block::{Block, BlockCategory, BlockError, BlockHeader};
pub use cleanup::{spawn_daemon, sweep_once, CleanupOutcome, Shutdown};
pub use collaborators::{CheckpointManager, FakeTransactionManager, Transaction, TransactionCategory, TransactionManager};
pub use descriptor::{FileTable, PageDescriptor, VersionedFile};
pub use file::FileStorage;
pub use fix::{fix, unfix, BlockLocation, FixMode, FixedPage};
pub use freelist::{rounded_extension_size, FreeListState};
pub use header::{FileHeader, HeaderCopy, HeaderError};
pub use io::{Storage, StorageError};
pub use recovery::{recover, restore, RecoverOutcome, RestoreOutcome};
pub use simulated::{FaultConfig, SimulatedStorage};
pub use slf::{has_preimage, read_preimage, write_preimage};
pub use sync::{sync as run_sync, SyncOutcome};
pub use truncate::{truncate as truncate_file, TruncateOutcome};
pub use verify::{start_verification, Fault, Treatment, VerificationReport};
