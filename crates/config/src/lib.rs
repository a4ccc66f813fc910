//! # Config - sieve construction parameters
//!
//! All knobs a sieve needs at construction time, with defaults suitable for a
//! single crawler process and an environment override layer:
//!
//! ```text
//! SIEVE_DIR              sieve directory (store + side file)   (default: "data/sieve")
//! SIEVE_FLOW_DIR         new-flow segment directory            (default: "data/flow")
//! SIEVE_BUCKET_CAPACITY  keys per flush                        (default: 1048576)
//! SIEVE_STORE_BUFFER_KB  store read/write buffer in KiB        (default: 1024)
//! SIEVE_AUX_BUFFER_KB    side-file / segment buffer in KiB     (default: 256)
//! ```
//!
//! Unparsable values fall back to the default.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default number of keys accumulated before a flush.
pub const DEFAULT_BUCKET_CAPACITY: usize = 1 << 20;
/// Default store I/O buffer (1 MiB).
pub const DEFAULT_STORE_BUFFER_SIZE: usize = 1024 * 1024;
/// Default side-file and segment I/O buffer (256 KiB).
pub const DEFAULT_AUX_BUFFER_SIZE: usize = 256 * 1024;

/// A configuration value that cannot be used.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("bucket capacity must be > 0")]
    ZeroCapacity,
    #[error("bucket capacity {0} exceeds the u32 index space")]
    CapacityTooLarge(usize),
    #[error("{0} buffer size must be > 0")]
    ZeroBuffer(&'static str),
    #[error("sieve dir and flow dir must differ ({0})")]
    SharedDir(PathBuf),
}

/// Construction parameters for a sieve and its disk-backed new flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SieveConfig {
    /// Holds the store and the bucket side file.
    pub dir: PathBuf,
    /// Holds the new-flow segment files. Kept apart from `dir` so sieve state
    /// and downstream-pending state can be inspected independently.
    pub flow_dir: PathBuf,
    /// Keys per bucket; the enqueue that fills the bucket triggers a flush.
    pub bucket_capacity: usize,
    /// Buffer size for reading and rewriting the store.
    pub store_buffer_size: usize,
    /// Buffer size for the bucket side file and flow segments.
    pub aux_buffer_size: usize,
}

impl Default for SieveConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/sieve"),
            flow_dir: PathBuf::from("data/flow"),
            bucket_capacity: DEFAULT_BUCKET_CAPACITY,
            store_buffer_size: DEFAULT_STORE_BUFFER_SIZE,
            aux_buffer_size: DEFAULT_AUX_BUFFER_SIZE,
        }
    }
}

/// Reads a configuration value from the environment, falling back to `default`.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// A KiB count from the environment, in bytes. Unparsable or overflowing
/// values yield `default_bytes`.
fn kib_or(key: &str, default_bytes: usize) -> usize {
    env_or(key, "")
        .parse::<usize>()
        .ok()
        .and_then(|kb| kb.checked_mul(1024))
        .unwrap_or(default_bytes)
}

impl SieveConfig {
    /// Defaults rooted at `root`: the sieve uses `root/sieve` and the flow
    /// uses `root/flow`.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        Self {
            dir: root.join("sieve"),
            flow_dir: root.join("flow"),
            ..Self::default()
        }
    }

    /// Defaults overridden by `SIEVE_*` environment variables.
    pub fn from_env() -> Self {
        let d = Self::default();
        let dir = env_or("SIEVE_DIR", &d.dir.to_string_lossy());
        let flow_dir = env_or("SIEVE_FLOW_DIR", &d.flow_dir.to_string_lossy());
        let bucket_capacity: usize = env_or("SIEVE_BUCKET_CAPACITY", "")
            .parse()
            .unwrap_or(d.bucket_capacity);

        Self {
            dir: PathBuf::from(dir),
            flow_dir: PathBuf::from(flow_dir),
            bucket_capacity,
            store_buffer_size: kib_or("SIEVE_STORE_BUFFER_KB", d.store_buffer_size),
            aux_buffer_size: kib_or("SIEVE_AUX_BUFFER_KB", d.aux_buffer_size),
        }
    }

    pub fn with_bucket_capacity(mut self, capacity: usize) -> Self {
        self.bucket_capacity = capacity;
        self
    }

    pub fn with_store_buffer_size(mut self, bytes: usize) -> Self {
        self.store_buffer_size = bytes;
        self
    }

    pub fn with_aux_buffer_size(mut self, bytes: usize) -> Self {
        self.aux_buffer_size = bytes;
        self
    }

    pub fn with_flow_dir<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.flow_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Checks that the configuration can back a working sieve.
    ///
    /// Bucket indices are kept as `u32` during the flush sort, which bounds
    /// the capacity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bucket_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        if self.bucket_capacity > u32::MAX as usize {
            return Err(ConfigError::CapacityTooLarge(self.bucket_capacity));
        }
        if self.store_buffer_size == 0 {
            return Err(ConfigError::ZeroBuffer("store"));
        }
        if self.aux_buffer_size == 0 {
            return Err(ConfigError::ZeroBuffer("aux"));
        }
        if self.dir == self.flow_dir {
            return Err(ConfigError::SharedDir(self.dir.clone()));
        }
        Ok(())
    }
}
