//! End-to-end runs of a `MercatorSieve` feeding a `DiskNewFlow`.

use codec::StringSerializer;
use sieve::{
    DiskNewFlow, FlowError, Fnv1aHashing, MercatorSieve, NewFlowReceiver, Sieve, SieveConfig,
};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use tempfile::tempdir;

fn open(root: &Path, capacity: usize) -> (MercatorSieve<String, ()>, Arc<DiskNewFlow<String>>) {
    let config = SieveConfig::new(root)
        .with_bucket_capacity(capacity)
        .with_store_buffer_size(8192)
        .with_aux_buffer_size(8192);
    let flow: Arc<DiskNewFlow<String>> =
        Arc::new(DiskNewFlow::new(&config.flow_dir, Arc::new(StringSerializer), 8192).unwrap());
    let receiver: Arc<dyn NewFlowReceiver<String>> = flow.clone();
    let sieve = MercatorSieve::new(
        &config,
        receiver,
        Arc::new(StringSerializer),
        Arc::new(Fnv1aHashing),
    )
    .unwrap();
    (sieve, flow)
}

fn drain(flow: &DiskNewFlow<String>) -> Vec<String> {
    let mut out = Vec::new();
    loop {
        match flow.dequeue_key() {
            Ok(k) => out.push(k),
            Err(FlowError::Exhausted) => return out,
            Err(e) => panic!("unexpected flow error: {e}"),
        }
    }
}

fn keys(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{prefix}{i}")).collect()
}

#[test]
fn duplicates_within_a_batch_are_emitted_once() {
    let dir = tempdir().unwrap();
    let (sieve, flow) = open(dir.path(), 16);

    for k in ["A0", "A1", "A0", "A3"] {
        assert!(!sieve.enqueue(&k.to_string(), ()).unwrap());
    }
    sieve.close().unwrap();

    assert_eq!(drain(&flow), vec!["A0", "A1", "A3"]);
}

#[test]
fn keys_from_an_earlier_batch_are_suppressed() {
    let dir = tempdir().unwrap();
    let (sieve, flow) = open(dir.path(), 16);

    sieve.enqueue(&"x".to_string(), ()).unwrap();
    sieve.enqueue(&"y".to_string(), ()).unwrap();
    sieve.flush().unwrap();
    assert_eq!(flow.len(), 2);

    sieve.enqueue(&"y".to_string(), ()).unwrap();
    sieve.enqueue(&"x".to_string(), ()).unwrap();
    sieve.flush().unwrap();
    assert_eq!(flow.len(), 2);
    assert_eq!(sieve.last_flush().emitted, 0);

    sieve.close().unwrap();
    assert_eq!(drain(&flow), vec!["x", "y"]);
}

#[test]
fn full_buckets_flush_automatically_in_input_order() {
    let dir = tempdir().unwrap();
    let (sieve, flow) = open(dir.path(), 1000);
    let input = keys("url-", 2000);

    let mut flushed = 0;
    for k in &input {
        if sieve.enqueue(k, ()).unwrap() {
            flushed += 1;
        }
    }
    assert_eq!(flushed, 2);
    assert_eq!(sieve.flush_count(), 2);
    assert_eq!(sieve.pending(), 0);
    assert_eq!(sieve.store_len(), 2000);

    sieve.close().unwrap();
    assert_eq!(drain(&flow), input);
}

#[test]
fn close_flushes_a_partial_bucket_then_ends_the_flow() {
    let dir = tempdir().unwrap();
    let (sieve, flow) = open(dir.path(), 100);

    for k in keys("p", 7) {
        sieve.enqueue(&k, ()).unwrap();
    }
    assert_eq!(flow.len(), 0);
    sieve.close().unwrap();

    assert!(flow.is_closed());
    assert_eq!(drain(&flow), keys("p", 7));
    assert!(matches!(flow.dequeue_key(), Err(FlowError::Exhausted)));
    assert_eq!(flow.segment_count(), 0);
}

#[test]
fn concurrent_producers_and_consumer_see_each_key_once() {
    const PRODUCERS: usize = 4;
    const PER_PRODUCER: usize = 500;
    const DISTINCT: usize = 1200;

    let dir = tempdir().unwrap();
    let (sieve, flow) = open(dir.path(), 64);

    let consumer = {
        let flow = flow.clone();
        thread::spawn(move || drain(&flow))
    };

    thread::scope(|scope| {
        for t in 0..PRODUCERS {
            let sieve = &sieve;
            scope.spawn(move || {
                for i in 0..PER_PRODUCER {
                    let key = format!("k{}", (t * PER_PRODUCER + i) % DISTINCT);
                    sieve.enqueue(&key, ()).unwrap();
                }
            });
        }
    });
    sieve.close().unwrap();

    let emitted = consumer.join().unwrap();
    let unique: HashSet<&String> = emitted.iter().collect();
    assert_eq!(unique.len(), emitted.len(), "a key was emitted twice");

    let expected: HashSet<String> = (0..PRODUCERS * PER_PRODUCER)
        .map(|n| format!("k{}", n % DISTINCT))
        .collect();
    assert_eq!(unique.len(), expected.len());
    assert!(emitted.iter().all(|k| expected.contains(k)));
}

#[test]
fn undelivered_keys_survive_a_restart() {
    let dir = tempdir().unwrap();
    {
        let (sieve, flow) = open(dir.path(), 16);
        sieve.enqueue(&"x".to_string(), ()).unwrap();
        sieve.flush().unwrap();
        assert_eq!(flow.len(), 1);
    }

    let (sieve, flow) = open(dir.path(), 16);
    assert_eq!(flow.len(), 1);
    sieve.enqueue(&"x".to_string(), ()).unwrap();
    sieve.enqueue(&"y".to_string(), ()).unwrap();
    sieve.close().unwrap();

    assert_eq!(drain(&flow), vec!["x", "y"]);
}
