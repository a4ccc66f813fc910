//! # Sieve - disk-backed URL deduplication
//!
//! The sieve decides, for a continuous stream of discovered keys, which are
//! genuinely new. New keys are handed to a [`NewFlowReceiver`] exactly once,
//! in the order they were enqueued; keys whose hash was already seen are
//! dropped.
//!
//! ## Architecture
//!
//! ```text
//! producers
//!   │ enqueue(key, value)
//!   v
//! ┌────────────────────────────────────────────────────────┐
//! │                    MercatorSieve                       │
//! │                                                        │
//! │  Bucket  ── hashes[] in memory + bucket.aux side file  │
//! │    │                                                   │
//! │    │ (full / flush() / close())                        │
//! │    v                                                   │
//! │  flush ── sort bucket ─► merge with Store ─► store.tmp │
//! │    │                          (rename over `store`)    │
//! │    v                                                   │
//! │  re-walk side file in arrival order, emit new keys     │
//! └────┬───────────────────────────────────────────────────┘
//!      │ prepare_to_append / append / finished_appending
//!      v
//!  NewFlowReceiver (e.g. DiskNewFlow) ──► dequeue_key() consumers
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module       | Purpose                                                |
//! |--------------|--------------------------------------------------------|
//! | `lib.rs`     | `Sieve` trait, `SieveEntry`, `SieveError`              |
//! | [`strategy`] | hashing and value-update strategies                    |
//! | [`mercator`] | `MercatorSieve`: locking, lifecycle, `Debug`, `Drop`   |
//! | [`flush`]    | the sort/merge/emit pass over bucket and store         |
//! | [`identity`] | `IdentitySieve`: pass-through, no deduplication        |
//!
//! ## Identity is by hash
//!
//! Two keys with the same 64-bit hash are treated as the same key. Full keys
//! are never kept resident or compared, which is what keeps memory bounded;
//! the price is a small, non-zero chance that a genuinely new key is dropped
//! as a duplicate.
//!
//! ## Values
//!
//! `enqueue` accepts a value alongside every key, but values live only for
//! the duration of the call: the store persists hashes, not values, so
//! nothing is carried across flushes and the configured [`UpdateStrategy`] is
//! never consulted by the merge. A key re-enqueued with a different value is
//! simply a duplicate.

mod flush;
mod identity;
mod mercator;
mod strategy;

pub use flush::FlushOutcome;
pub use identity::IdentitySieve;
pub use mercator::{MercatorSieve, AUX_FILENAME};
pub use strategy::{Fnv1aHashing, HashingStrategy, KeepNewest, UpdateStrategy};

pub use codec::{CodecError, Serializer};
pub use config::{ConfigError, SieveConfig};
pub use flow::{DiskNewFlow, FlowError, NewFlowReceiver};

use thiserror::Error;

/// Errors surfaced by sieve operations.
#[derive(Debug, Error)]
pub enum SieveError {
    /// `enqueue`, `flush` or `close` after `close()`.
    #[error("sieve is closed")]
    Closed,

    /// A previous enqueue or flush failed part-way; the bucket or store can
    /// no longer be trusted.
    #[error("sieve is unusable after a failed write")]
    Broken,

    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("new-flow receiver failed: {0}")]
    Flow(#[from] FlowError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O or consistency failure in the bucket or store.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// An immutable key/value pair, as handed to a sieve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SieveEntry<K, V> {
    key: K,
    value: V,
}

impl<K, V> SieveEntry<K, V> {
    pub fn new(key: K, value: V) -> Self {
        Self { key, value }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_parts(self) -> (K, V) {
        (self.key, self.value)
    }
}

/// The public sieve contract.
///
/// Implementations are shared between producer threads, so every operation
/// takes `&self`.
pub trait Sieve<K, V> {
    /// Records one key. Returns `true` if this call triggered a flush.
    ///
    /// Blocks while another thread holds the sieve (including for the
    /// duration of a flush). Never drops a key silently.
    fn enqueue(&self, key: &K, value: V) -> Result<bool, SieveError>;

    /// Forces processing of everything buffered so far. A no-op when nothing
    /// is buffered.
    fn flush(&self) -> Result<(), SieveError>;

    /// Final flush, then refuses further `enqueue`/`flush` and tells the
    /// receiver no more batches will come.
    fn close(&self) -> Result<(), SieveError>;

    /// [`enqueue`](Sieve::enqueue) for a prebuilt entry.
    fn enqueue_entry(&self, entry: SieveEntry<K, V>) -> Result<bool, SieveError> {
        let (key, value) = entry.into_parts();
        self.enqueue(&key, value)
    }
}

#[cfg(test)]
mod tests;
