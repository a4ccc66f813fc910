use crate::*;
use codec::{StringSerializer, U64Serializer};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// One receiver protocol call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event<K> {
    Prepare,
    Append(u64, K),
    Finished,
    NoMore,
}

/// Receiver that records every protocol call, optionally failing appends.
pub struct RecordingReceiver<K> {
    events: Mutex<Vec<Event<K>>>,
    fail_appends: bool,
}

impl<K: Clone> RecordingReceiver<K> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            fail_appends: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            fail_appends: true,
        })
    }

    pub fn events(&self) -> Vec<Event<K>> {
        self.events.lock().clone()
    }

    /// Keys appended so far, in order.
    pub fn appended(&self) -> Vec<K> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Append(_, k) => Some(k.clone()),
                _ => None,
            })
            .collect()
    }
}

impl<K: Clone + Send> NewFlowReceiver<K> for RecordingReceiver<K> {
    fn prepare_to_append(&self) -> Result<(), FlowError> {
        self.events.lock().push(Event::Prepare);
        Ok(())
    }

    fn append(&self, hash: u64, key: &K) -> Result<(), FlowError> {
        if self.fail_appends {
            return Err(FlowError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "receiver refused append",
            )));
        }
        self.events.lock().push(Event::Append(hash, key.clone()));
        Ok(())
    }

    fn finished_appending(&self) -> Result<(), FlowError> {
        self.events.lock().push(Event::Finished);
        Ok(())
    }

    fn no_more_append(&self) -> Result<(), FlowError> {
        self.events.lock().push(Event::NoMore);
        Ok(())
    }
}

pub fn small_config(root: &Path, capacity: usize) -> SieveConfig {
    SieveConfig::new(root)
        .with_bucket_capacity(capacity)
        .with_store_buffer_size(4096)
        .with_aux_buffer_size(4096)
}

/// String keys hashed with FNV-1a, recorded by a fresh receiver.
pub fn string_sieve(
    root: &Path,
    capacity: usize,
) -> (MercatorSieve<String, u64>, Arc<RecordingReceiver<String>>) {
    let rx = RecordingReceiver::new();
    let sieve = MercatorSieve::new(
        &small_config(root, capacity),
        rx.clone(),
        Arc::new(StringSerializer),
        Arc::new(Fnv1aHashing),
    )
    .unwrap();
    (sieve, rx)
}

/// `u64` keys that are their own hash, so tests control hash order exactly.
pub fn u64_sieve(
    root: &Path,
    capacity: usize,
) -> (MercatorSieve<u64, ()>, Arc<RecordingReceiver<u64>>) {
    let rx = RecordingReceiver::new();
    let sieve = MercatorSieve::new(
        &small_config(root, capacity),
        rx.clone(),
        Arc::new(U64Serializer),
        Arc::new(|k: &u64| *k),
    )
    .unwrap();
    (sieve, rx)
}

pub fn s(key: &str) -> String {
    key.to_string()
}
