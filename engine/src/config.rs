//! Configuration surfaces for the versioning engine.
//!
//! # Invariants
//! - `StorageStrategy::block_size` is a power of two and at least
//!   `MIN_BLOCK_SIZE` (the assumed OS page size floor).
//! - `EngineConfig`'s tunables are all non-zero.

use std::path::PathBuf;
use std::time::Duration;

/// Smallest block size the engine accepts, matching a typical OS page size.
pub const MIN_BLOCK_SIZE: usize = 4096;

/// Caller-supplied parameters for one versioned file, passed to `attach`.
///
/// # Environment Variables
/// None — `StorageStrategy` is always constructed explicitly by the caller,
/// unlike `EngineConfig` which may be sourced from the environment.
#[derive(Debug, Clone)]
pub struct StorageStrategy {
    /// Path to the Master Data File.
    pub mdf_path: PathBuf,
    /// Path to the Version Log File.
    pub vlf_path: PathBuf,
    /// Path to the Sync Log File (created lazily on first sync).
    pub slf_path: PathBuf,
    /// Block size in bytes; power of two, `>= MIN_BLOCK_SIZE`.
    pub block_size: usize,
    /// Maximum size in bytes any one physical file may grow to.
    pub max_file_size: u64,
    /// Extension granularity used when the VLF free list runs dry (§4.3).
    pub extension_size: u64,
    /// When `false`, `fix` always delegates to the MDF block directly
    /// (the "no-version case" of §4.2 step 1) and the VLF is never created.
    pub versioning: bool,
}

/// Error returned when a `StorageStrategy` fails validation.
#[derive(Debug)]
pub enum ConfigError {
    /// `block_size` was zero, not a power of two, or below `MIN_BLOCK_SIZE`.
    InvalidBlockSize(usize),
    /// An environment variable required by `EngineConfig::from_env` was present but malformed.
    InvalidValue {
        name: &'static str,
        value: String,
        reason: &'static str,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidBlockSize(n) => {
                write!(f, "invalid block size {n}: must be a power of two >= {MIN_BLOCK_SIZE}")
            }
            Self::InvalidValue { name, value, reason } => write!(
                f,
                "invalid value for environment variable {name}='{value}': {reason}"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

impl StorageStrategy {
    /// Validate block-size invariants.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidBlockSize` if `block_size` is not a
    /// power of two or is smaller than `MIN_BLOCK_SIZE`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.block_size < MIN_BLOCK_SIZE || !self.block_size.is_power_of_two() {
            return Err(ConfigError::InvalidBlockSize(self.block_size));
        }
        Ok(())
    }
}

/// Engine-wide tunables named throughout the spec as constants.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// How often the cleanup daemon sweeps for detached page descriptors.
    pub detached_page_cleaner_period: Duration,
    /// Cap on the recycled page-descriptor free-list size.
    pub page_instance_cache_size: usize,
    /// Max candidate pages considered per `sync` pass (reduced 10x under contention).
    pub sync_page_count_max: usize,
    /// Upper bound on the rounded VLF extension size (§4.3).
    pub max_extension_size: u64,
}

impl EngineConfig {
    const DEFAULT_CLEANER_PERIOD_SECS: u64 = 60;
    const DEFAULT_PAGE_INSTANCE_CACHE_SIZE: usize = 1024;
    const DEFAULT_SYNC_PAGE_COUNT_MAX: usize = 4096;
    const DEFAULT_MAX_EXTENSION_SIZE: u64 = 64 * 1024 * 1024;

    /// Load configuration, falling back to documented defaults for any
    /// tunable whose environment variable is unset.
    ///
    /// # Environment Variables
    /// - `VPAGE_CLEANER_PERIOD_SECS`
    /// - `VPAGE_PAGE_INSTANCE_CACHE_SIZE`
    /// - `VPAGE_SYNC_PAGE_COUNT_MAX`
    /// - `VPAGE_MAX_EXTENSION_SIZE`
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidValue` if a set variable fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let cleaner_period_secs = Self::env_u64(
            "VPAGE_CLEANER_PERIOD_SECS",
            Self::DEFAULT_CLEANER_PERIOD_SECS,
        )?;
        let page_instance_cache_size = Self::env_usize(
            "VPAGE_PAGE_INSTANCE_CACHE_SIZE",
            Self::DEFAULT_PAGE_INSTANCE_CACHE_SIZE,
        )?;
        let sync_page_count_max = Self::env_usize(
            "VPAGE_SYNC_PAGE_COUNT_MAX",
            Self::DEFAULT_SYNC_PAGE_COUNT_MAX,
        )?;
        let max_extension_size = Self::env_u64(
            "VPAGE_MAX_EXTENSION_SIZE",
            Self::DEFAULT_MAX_EXTENSION_SIZE,
        )?;

        Ok(Self {
            detached_page_cleaner_period: Duration::from_secs(cleaner_period_secs),
            page_instance_cache_size,
            sync_page_count_max,
            max_extension_size,
        })
    }

    fn env_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
        match std::env::var(name) {
            Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
                name,
                value: v,
                reason: "must be a valid u64",
            }),
            Err(_) => Ok(default),
        }
    }

    fn env_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
        match std::env::var(name) {
            Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
                name,
                value: v,
                reason: "must be a valid usize",
            }),
            Err(_) => Ok(default),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            detached_page_cleaner_period: Duration::from_secs(Self::DEFAULT_CLEANER_PERIOD_SECS),
            page_instance_cache_size: Self::DEFAULT_PAGE_INSTANCE_CACHE_SIZE,
            sync_page_count_max: Self::DEFAULT_SYNC_PAGE_COUNT_MAX,
            max_extension_size: Self::DEFAULT_MAX_EXTENSION_SIZE,
        }
    }
}
