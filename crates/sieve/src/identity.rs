//! `IdentitySieve`: every key is new.
//!
//! Forwards each enqueued key straight to the receiver with no store and no
//! deduplication. Useful as a pass-through when the crawl frontier is known
//! to be duplicate-free, and as a test double for consumers.
//!
//! Receiver protocol:
//!
//! - `prepare_to_append` once at construction,
//! - `append` on every `enqueue`,
//! - `flush` publishes the open batch and starts a new one,
//! - `close` publishes the open batch and sends `no_more_append`.
use flow::NewFlowReceiver;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::strategy::HashingStrategy;
use crate::{Sieve, SieveError};

pub struct IdentitySieve<K, V> {
    receiver: Arc<dyn NewFlowReceiver<K>>,
    hashing: Arc<dyn HashingStrategy<K>>,
    /// `true` after `close()`. Also serializes calls into the receiver.
    closed: Mutex<bool>,
    _value: PhantomData<fn(V)>,
}

impl<K, V> IdentitySieve<K, V> {
    /// Binds the sieve to `receiver` and opens its first batch.
    pub fn new(
        receiver: Arc<dyn NewFlowReceiver<K>>,
        hashing: Arc<dyn HashingStrategy<K>>,
    ) -> Result<Self, SieveError> {
        receiver.prepare_to_append()?;
        Ok(Self {
            receiver,
            hashing,
            closed: Mutex::new(false),
            _value: PhantomData,
        })
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl<K, V> Sieve<K, V> for IdentitySieve<K, V> {
    fn enqueue(&self, key: &K, _value: V) -> Result<bool, SieveError> {
        let closed = self.closed.lock();
        if *closed {
            return Err(SieveError::Closed);
        }
        self.receiver.append(self.hashing.hash(key), key)?;
        Ok(false)
    }

    fn flush(&self) -> Result<(), SieveError> {
        let closed = self.closed.lock();
        if *closed {
            return Err(SieveError::Closed);
        }
        self.receiver.finished_appending()?;
        self.receiver.prepare_to_append()?;
        Ok(())
    }

    fn close(&self) -> Result<(), SieveError> {
        let mut closed = self.closed.lock();
        if *closed {
            return Err(SieveError::Closed);
        }
        *closed = true;
        self.receiver.finished_appending()?;
        self.receiver.no_more_append()?;
        Ok(())
    }
}

impl<K, V> std::fmt::Debug for IdentitySieve<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentitySieve")
            .field("closed", &*self.closed.lock())
            .finish()
    }
}
