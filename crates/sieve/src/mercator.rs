//! `MercatorSieve`: the disk-backed sieve.
//!
//! One mutex guards the bucket, the store and the lifecycle flags, so
//! enqueues and flushes are totally ordered: a flush sees exactly the keys
//! enqueued before it took the lock, and keys enqueued while it runs wait
//! for the next one.
use bucket::Bucket;
use codec::Serializer;
use config::SieveConfig;
use flow::NewFlowReceiver;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use store::Store;
use tracing::{info, warn};

use crate::flush::{flush_bucket, FlushOutcome};
use crate::strategy::{HashingStrategy, UpdateStrategy};
use crate::{Sieve, SieveError};

/// File name of the bucket side file inside the sieve directory.
pub const AUX_FILENAME: &str = "bucket.aux";

/// State guarded by the sieve mutex.
struct Inner<K> {
    bucket: Bucket<K>,
    store: Store,
    closed: bool,
    /// Set when an append or flush fails part-way.
    broken: bool,
    flushes: u64,
    last_flush: FlushOutcome,
}

impl<K> Inner<K> {
    fn check_usable(&self) -> Result<(), SieveError> {
        if self.broken {
            return Err(SieveError::Broken);
        }
        if self.closed {
            return Err(SieveError::Closed);
        }
        Ok(())
    }
}

/// A sieve that buffers keys in a bucket and merges them into an on-disk
/// store of known hashes whenever the bucket fills.
///
/// # Write path
///
/// 1. Hash the key (outside the lock).
/// 2. Append `(hash, key)` to the bucket.
/// 3. If the bucket is now full, flush it before returning `true`.
///
/// # Recovery
///
/// Opening a sieve on a directory that already holds a store keeps every
/// hash recorded there: keys seen by an earlier instance stay duplicates.
/// The bucket side file is always started empty.
pub struct MercatorSieve<K, V> {
    dir: PathBuf,
    inner: Mutex<Inner<K>>,
    hashing: Arc<dyn HashingStrategy<K>>,
    receiver: Arc<dyn NewFlowReceiver<K>>,
    update: Option<Arc<dyn UpdateStrategy<K, V>>>,
}

impl<K, V> MercatorSieve<K, V> {
    /// Creates a sieve in `config.dir`, bound to `receiver`.
    ///
    /// # Errors
    ///
    /// Fails on an invalid configuration, a corrupted store, or if the
    /// directory or side file cannot be created.
    pub fn new(
        config: &SieveConfig,
        receiver: Arc<dyn NewFlowReceiver<K>>,
        key_serializer: Arc<dyn Serializer<K>>,
        hashing: Arc<dyn HashingStrategy<K>>,
    ) -> Result<Self, SieveError> {
        config.validate()?;

        let store = Store::new(&config.dir, config.store_buffer_size)?;
        let bucket = Bucket::new(
            config.dir.join(AUX_FILENAME),
            config.bucket_capacity,
            config.aux_buffer_size,
            key_serializer,
        )?;

        info!(
            dir = %config.dir.display(),
            capacity = config.bucket_capacity,
            known_hashes = store.len(),
            "opened sieve"
        );

        Ok(Self {
            dir: config.dir.clone(),
            inner: Mutex::new(Inner {
                bucket,
                store,
                closed: false,
                broken: false,
                flushes: 0,
                last_flush: FlushOutcome::default(),
            }),
            hashing,
            receiver,
            update: None,
        })
    }

    /// Attaches a value-update strategy.
    ///
    /// Values are not persisted by this sieve, so the strategy is retained
    /// for callers that inspect it but never invoked by the merge.
    pub fn with_update_strategy(mut self, strategy: Arc<dyn UpdateStrategy<K, V>>) -> Self {
        self.update = Some(strategy);
        self
    }

    #[must_use]
    pub fn update_strategy(&self) -> Option<&Arc<dyn UpdateStrategy<K, V>>> {
        self.update.as_ref()
    }

    /// Directory holding the store and the side file.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of completed (non-empty) flushes.
    #[must_use]
    pub fn flush_count(&self) -> u64 {
        self.inner.lock().flushes
    }

    /// Outcome of the most recent non-empty flush.
    #[must_use]
    pub fn last_flush(&self) -> FlushOutcome {
        self.inner.lock().last_flush
    }

    /// Entries waiting in the bucket.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.inner.lock().bucket.len()
    }

    /// Hashes in the committed store.
    #[must_use]
    pub fn store_len(&self) -> u64 {
        self.inner.lock().store.len()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Flushes under an already-held lock, marking the sieve broken on error.
    fn flush_locked(&self, inner: &mut Inner<K>) -> Result<(), SieveError> {
        if inner.bucket.is_empty() {
            return Ok(());
        }
        match flush_bucket(&mut inner.bucket, &mut inner.store, self.receiver.as_ref()) {
            Ok(outcome) => {
                inner.flushes += 1;
                inner.last_flush = outcome;
                Ok(())
            }
            Err(e) => {
                inner.broken = true;
                Err(e)
            }
        }
    }
}

impl<K, V> Sieve<K, V> for MercatorSieve<K, V> {
    /// Values are accepted and dropped; see the crate docs.
    fn enqueue(&self, key: &K, _value: V) -> Result<bool, SieveError> {
        let hash = self.hashing.hash(key);

        let mut inner = self.inner.lock();
        inner.check_usable()?;
        if let Err(e) = inner.bucket.append(hash, key) {
            // A partial key may already sit in the side file.
            inner.broken = true;
            return Err(e.into());
        }

        if inner.bucket.is_full() {
            self.flush_locked(&mut inner)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn flush(&self) -> Result<(), SieveError> {
        let mut inner = self.inner.lock();
        inner.check_usable()?;
        self.flush_locked(&mut inner)
    }

    fn close(&self) -> Result<(), SieveError> {
        let mut inner = self.inner.lock();
        inner.check_usable()?;
        self.flush_locked(&mut inner)?;
        inner.closed = true;
        self.receiver.no_more_append()?;

        info!(
            dir = %self.dir.display(),
            flushes = inner.flushes,
            known_hashes = inner.store.len(),
            "closed sieve"
        );
        Ok(())
    }
}

impl<K, V> std::fmt::Debug for MercatorSieve<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MercatorSieve")
            .field("dir", &self.dir)
            .field("bucket", &inner.bucket)
            .field("store", &inner.store)
            .field("flushes", &inner.flushes)
            .field("closed", &inner.closed)
            .field("broken", &inner.broken)
            .finish()
    }
}

/// Best-effort close on drop.
///
/// A sieve dropped without `close()` still merges its bucket so the keys are
/// emitted and recorded, then tells the receiver no more batches will come.
/// Errors are logged because `Drop` cannot return them. A broken sieve sends
/// nothing: its receiver batch is left open, so consumers of a broken sieve
/// should wait with a timeout.
impl<K, V> Drop for MercatorSieve<K, V> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.closed || inner.broken {
            return;
        }
        if !inner.bucket.is_empty() {
            if let Err(e) =
                flush_bucket(&mut inner.bucket, &mut inner.store, self.receiver.as_ref())
            {
                warn!(error = %e, dir = %self.dir.display(), "flush on drop failed");
                return;
            }
        }
        inner.closed = true;
        if let Err(e) = self.receiver.no_more_append() {
            warn!(error = %e, dir = %self.dir.display(), "no_more_append on drop failed");
        }
    }
}
