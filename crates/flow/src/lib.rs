//! # Flow - delivery of newly-seen keys
//!
//! A flush certifies a set of keys as first-seen and hands them, in their
//! original enqueue order, to a [`NewFlowReceiver`]. The protocol is driven
//! exclusively by the sieve:
//!
//! ```text
//! prepare_to_append ──► append(hash, key)* ──► finished_appending     (one batch)
//!        ▲                                            │
//!        └────────────────────────────────────────────┘
//!                                                     │
//!                                              no_more_append          (sieve closed)
//! ```
//!
//! [`DiskNewFlow`] is the reference receiver: it spills every batch to its
//! own segment file and lets consumer threads block on
//! [`dequeue_key`](DiskNewFlow::dequeue_key).

mod disk;

pub use disk::{DiskNewFlow, SEGMENT_EXTENSION, SEGMENT_TMP_EXTENSION};

use codec::CodecError;
use std::io;
use thiserror::Error;

/// Errors raised by new-flow receivers.
#[derive(Debug, Error)]
pub enum FlowError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A key could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The flow is closed and every item has been dequeued.
    #[error("no more elements")]
    Exhausted,

    /// A protocol call arrived out of order (e.g. `append` outside a batch,
    /// or anything after `no_more_append`).
    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    /// A segment file ended mid-record or carried an impossible length.
    #[error("corrupt segment {path}: {reason}")]
    Corrupt {
        /// Segment file that failed to decode.
        path: String,
        /// What was wrong with it.
        reason: String,
    },
}

/// Consumer of the keys a sieve certifies as new.
///
/// All methods take `&self`: the sieve calls them from inside its flush while
/// consumers may be reading concurrently, so implementations synchronize
/// internally.
pub trait NewFlowReceiver<K>: Send + Sync {
    /// A new batch is about to start.
    fn prepare_to_append(&self) -> Result<(), FlowError>;

    /// One confirmed-new key, in emission order.
    fn append(&self, hash: u64, key: &K) -> Result<(), FlowError>;

    /// The current batch is complete; its keys may now be observed.
    fn finished_appending(&self) -> Result<(), FlowError>;

    /// The sieve is closed; no further batches will arrive.
    fn no_more_append(&self) -> Result<(), FlowError>;
}
