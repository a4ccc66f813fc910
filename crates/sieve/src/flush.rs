//! The flush pass: merges one bucket into the store and emits the keys that
//! turned out to be new.
//!
//! # Steps
//!
//! 1. Empty bucket: return without touching store or receiver.
//! 2. Open the store pass and tell the receiver a batch is starting.
//! 3. Sort bucket indices by hash, ties broken by arrival index.
//! 4. Within each run of equal hashes only the first (earliest) index is a
//!    candidate; the rest are same-batch duplicates.
//! 5. Three-way merge candidates against the ascending store stream,
//!    carrying every store hash forward and appending new ones.
//! 6. Put the new indices back in arrival order.
//! 7. Walk the side file once: consume new keys and hand them to the
//!    receiver, skip everything else.
//! 8. Finish the batch, clear the bucket, commit the store.
//!
//! Memory stays proportional to the bucket: the store is only ever streamed.
use anyhow::Result;
use bucket::Bucket;
use flow::NewFlowReceiver;
use store::Store;
use tracing::debug;

use crate::SieveError;

/// What one flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOutcome {
    /// Entries in the bucket when the flush started.
    pub items: usize,
    /// Keys handed to the receiver.
    pub emitted: usize,
    /// Entries suppressed because an earlier entry in the same bucket had the
    /// same hash.
    pub batch_duplicates: usize,
    /// Hashes in the store after the flush.
    pub store_len: u64,
}

/// Next committed hash, or `None` once the old store is exhausted.
fn next_stored(store: &mut Store) -> Result<Option<u64>> {
    if store.remaining() == 0 {
        return Ok(None);
    }
    store.consume().map(Some)
}

/// Bucket indices ordered by hash; equal hashes keep arrival order.
fn sorted_indices(hashes: &[u64]) -> Vec<u32> {
    let mut order: Vec<u32> = (0..hashes.len() as u32).collect();
    order.sort_unstable_by_key(|&i| (hashes[i as usize], i));
    order
}

/// Runs one flush of `bucket` against `store`, emitting to `receiver`.
///
/// The caller holds the sieve lock. On error the store pass and the
/// receiver batch are left open; the sieve must not be used again.
pub(crate) fn flush_bucket<K>(
    bucket: &mut Bucket<K>,
    store: &mut Store,
    receiver: &dyn NewFlowReceiver<K>,
) -> Result<FlushOutcome, SieveError> {
    let items = bucket.len();
    if items == 0 {
        return Ok(FlushOutcome {
            store_len: store.len(),
            ..FlushOutcome::default()
        });
    }

    let store_before = store.open()?;
    receiver.prepare_to_append()?;
    bucket.prepare()?;

    // (arrival index, hash) of every new key, filled in hash order.
    let mut fresh: Vec<(u32, u64)> = Vec::new();
    let mut batch_duplicates = 0usize;
    {
        let hashes = bucket.hashes();
        let mut stored = next_stored(store)?;
        let mut prev: Option<u64> = None;

        for idx in sorted_indices(hashes) {
            let hash = hashes[idx as usize];
            if prev == Some(hash) {
                batch_duplicates += 1;
                continue;
            }
            prev = Some(hash);

            loop {
                match stored {
                    Some(s) if s < hash => {
                        store.append(s)?;
                        stored = next_stored(store)?;
                    }
                    Some(s) if s == hash => {
                        store.append(s)?;
                        stored = next_stored(store)?;
                        break;
                    }
                    _ => {
                        store.append(hash)?;
                        fresh.push((idx, hash));
                        break;
                    }
                }
            }
        }

        // Store tail, past the largest bucket hash.
        while let Some(s) = stored {
            store.append(s)?;
            stored = next_stored(store)?;
        }
    }

    fresh.sort_unstable_by_key(|&(idx, _)| idx);

    let mut pending = fresh.iter().peekable();
    for idx in 0..items as u32 {
        match pending.peek() {
            Some(&&(next, hash)) if next == idx => {
                let key = bucket.consume_key()?;
                receiver.append(hash, &key)?;
                pending.next();
            }
            _ => bucket.skip_key()?,
        }
    }
    bucket.finish_read()?;

    receiver.finished_appending()?;
    bucket.clear()?;
    store.close()?;

    let outcome = FlushOutcome {
        items,
        emitted: fresh.len(),
        batch_duplicates,
        store_len: store.len(),
    };
    debug!(
        items,
        emitted = outcome.emitted,
        batch_duplicates,
        store_before,
        store_after = outcome.store_len,
        "flushed bucket"
    );
    Ok(outcome)
}
