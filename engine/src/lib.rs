#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
//! MVCC page-level storage engine: three physical files per logical file
//! (Master Data File, Version Log File, Sync Log File) giving version-using
//! transactions a stable snapshot without overwriting pages in place.
//!
//! - [`storage`] is the engine core: attach/fix/unfix, allocate-log, PBCT
//!   traversal, sync, backup, recover/restore, verification and the
//!   background cleanup daemon.
//! - [`config`] carries the caller-supplied and environment-sourced
//!   tunables.
//! - [`error`] and [`ids`] are the shared error and identifier types used
//!   throughout.

pub mod config;
pub mod error;
pub mod ids;
pub mod storage;
