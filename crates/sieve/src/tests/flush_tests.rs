use super::helpers::*;
use crate::*;
use anyhow::Result;
use codec::StringSerializer;
use std::sync::Arc;
use store::{Store, RECORD_BYTES, STORE_FILENAME};
use tempfile::tempdir;

fn store_contents(dir: &std::path::Path) -> Result<Vec<u64>> {
    Store::new(dir, 4096)?.read_all()
}

// --------------------- Emission ---------------------

#[test]
fn same_batch_duplicate_is_emitted_once() -> Result<()> {
    let dir = tempdir()?;
    let (sieve, rx) = string_sieve(dir.path(), 8);

    sieve.enqueue(&s("A0"), 0)?;
    sieve.enqueue(&s("A1"), 1)?;
    sieve.enqueue(&s("A0"), 3)?;
    sieve.enqueue(&s("A3"), 2)?;
    sieve.flush()?;

    assert_eq!(rx.appended(), vec![s("A0"), s("A1"), s("A3")]);
    Ok(())
}

#[test]
fn batch_is_bracketed_by_prepare_and_finished() -> Result<()> {
    let dir = tempdir()?;
    let (sieve, rx) = u64_sieve(dir.path(), 8);

    sieve.enqueue(&2, ())?;
    sieve.enqueue(&1, ())?;
    sieve.flush()?;

    assert_eq!(
        rx.events(),
        vec![
            Event::Prepare,
            Event::Append(2, 2),
            Event::Append(1, 1),
            Event::Finished,
        ]
    );
    Ok(())
}

#[test]
fn emission_follows_arrival_not_hash_order() -> Result<()> {
    let dir = tempdir()?;
    let (sieve, rx) = u64_sieve(dir.path(), 16);

    for k in [50u64, 10, 40, 20, 30] {
        sieve.enqueue(&k, ())?;
    }
    sieve.flush()?;

    assert_eq!(rx.appended(), vec![50, 10, 40, 20, 30]);
    Ok(())
}

#[test]
fn earliest_of_duplicate_run_is_the_one_emitted() -> Result<()> {
    let dir = tempdir()?;
    let rx = RecordingReceiver::new();
    // Length hashing: "ab" and "cd" collide, so the second is a duplicate.
    let sieve: MercatorSieve<String, ()> = MercatorSieve::new(
        &small_config(dir.path(), 8),
        rx.clone(),
        Arc::new(StringSerializer),
        Arc::new(|k: &String| k.len() as u64),
    )?;

    sieve.enqueue(&s("xyz"), ())?;
    sieve.enqueue(&s("ab"), ())?;
    sieve.enqueue(&s("cd"), ())?;
    sieve.enqueue(&s("q"), ())?;
    sieve.flush()?;

    assert_eq!(rx.appended(), vec![s("xyz"), s("ab"), s("q")]);
    Ok(())
}

#[test]
fn key_seen_in_earlier_flush_is_not_emitted() -> Result<()> {
    let dir = tempdir()?;
    let (sieve, rx) = string_sieve(dir.path(), 8);

    sieve.enqueue(&s("A0"), 0)?;
    sieve.flush()?;
    sieve.enqueue(&s("A0"), 1)?;
    sieve.enqueue(&s("B0"), 2)?;
    sieve.flush()?;

    assert_eq!(rx.appended(), vec![s("A0"), s("B0")]);
    assert_eq!(sieve.last_flush().emitted, 1);
    Ok(())
}

#[test]
fn fully_duplicate_batch_emits_empty_batch() -> Result<()> {
    let dir = tempdir()?;
    let (sieve, rx) = u64_sieve(dir.path(), 8);

    sieve.enqueue(&7, ())?;
    sieve.flush()?;
    sieve.enqueue(&7, ())?;
    sieve.enqueue(&7, ())?;
    sieve.flush()?;

    assert_eq!(
        rx.events(),
        vec![
            Event::Prepare,
            Event::Append(7, 7),
            Event::Finished,
            Event::Prepare,
            Event::Finished,
        ]
    );
    Ok(())
}

// --------------------- Store maintenance ---------------------

#[test]
fn store_is_sorted_union_without_duplicates() -> Result<()> {
    let dir = tempdir()?;
    let (sieve, _rx) = u64_sieve(dir.path(), 16);

    for k in [9u64, 3, 7, 3] {
        sieve.enqueue(&k, ())?;
    }
    sieve.flush()?;
    for k in [5u64, 9, 1] {
        sieve.enqueue(&k, ())?;
    }
    sieve.flush()?;

    assert_eq!(store_contents(sieve.dir())?, vec![1, 3, 5, 7, 9]);
    assert_eq!(sieve.store_len(), 5);
    Ok(())
}

#[test]
fn store_tail_is_carried_forward() -> Result<()> {
    let dir = tempdir()?;
    let (sieve, rx) = u64_sieve(dir.path(), 16);

    for k in [300u64, 100, 200] {
        sieve.enqueue(&k, ())?;
    }
    sieve.flush()?;
    sieve.enqueue(&50, ())?;
    sieve.flush()?;

    assert_eq!(store_contents(sieve.dir())?, vec![50, 100, 200, 300]);
    assert_eq!(rx.appended(), vec![300, 100, 200, 50]);
    Ok(())
}

#[test]
fn interleaved_store_and_bucket_hashes() -> Result<()> {
    let dir = tempdir()?;
    let (sieve, rx) = u64_sieve(dir.path(), 16);

    for k in [10u64, 20, 30, 40] {
        sieve.enqueue(&k, ())?;
    }
    sieve.flush()?;
    for k in [45u64, 5, 30, 25, 10, 15] {
        sieve.enqueue(&k, ())?;
    }
    sieve.flush()?;

    assert_eq!(
        store_contents(sieve.dir())?,
        vec![5, 10, 15, 20, 25, 30, 40, 45]
    );
    assert_eq!(&rx.appended()[4..], &[45, 5, 25, 15]);
    Ok(())
}

#[test]
fn extreme_hashes_sort_as_unsigned() -> Result<()> {
    let dir = tempdir()?;
    let (sieve, rx) = u64_sieve(dir.path(), 8);

    for k in [u64::MAX, 0, 1 << 63] {
        sieve.enqueue(&k, ())?;
    }
    sieve.flush()?;

    assert_eq!(store_contents(sieve.dir())?, vec![0, 1 << 63, u64::MAX]);
    assert_eq!(rx.appended(), vec![u64::MAX, 0, 1 << 63]);
    Ok(())
}

// --------------------- Flush triggering ---------------------

#[test]
fn empty_flush_is_a_no_op() -> Result<()> {
    let dir = tempdir()?;
    let (sieve, rx) = string_sieve(dir.path(), 8);

    sieve.flush()?;
    sieve.flush()?;

    assert!(rx.events().is_empty());
    assert_eq!(sieve.flush_count(), 0);
    assert!(!sieve.dir().join(STORE_FILENAME).exists());
    Ok(())
}

#[test]
fn filling_enqueue_triggers_flush() -> Result<()> {
    let dir = tempdir()?;
    let (sieve, rx) = string_sieve(dir.path(), 3);

    assert!(!sieve.enqueue(&s("a"), 0)?);
    assert!(!sieve.enqueue(&s("b"), 0)?);
    assert!(rx.appended().is_empty());
    assert!(sieve.enqueue(&s("c"), 0)?);

    assert_eq!(sieve.flush_count(), 1);
    assert_eq!(sieve.pending(), 0);
    assert_eq!(rx.appended(), vec![s("a"), s("b"), s("c")]);
    Ok(())
}

#[test]
fn flush_outcome_reports_counts() -> Result<()> {
    let dir = tempdir()?;
    let (sieve, _rx) = u64_sieve(dir.path(), 16);

    sieve.enqueue(&1, ())?;
    sieve.flush()?;
    for k in [1u64, 2, 2, 3, 2] {
        sieve.enqueue(&k, ())?;
    }
    sieve.flush()?;

    assert_eq!(
        sieve.last_flush(),
        FlushOutcome {
            items: 5,
            emitted: 2,
            batch_duplicates: 2,
            store_len: 3,
        }
    );
    Ok(())
}

#[test]
fn side_file_is_truncated_after_flush() -> Result<()> {
    let dir = tempdir()?;
    let (sieve, _rx) = string_sieve(dir.path(), 8);

    sieve.enqueue(&s("http://example.com/a"), 0)?;
    sieve.enqueue(&s("http://example.com/b"), 0)?;
    sieve.flush()?;

    assert_eq!(std::fs::metadata(sieve.dir().join(AUX_FILENAME))?.len(), 0);
    Ok(())
}

// --------------------- Values ---------------------

#[test]
fn values_are_not_persisted_across_flushes() -> Result<()> {
    let dir = tempdir()?;
    let (sieve, rx) = string_sieve(dir.path(), 8);

    sieve.enqueue(&s("k"), 1)?;
    sieve.flush()?;
    sieve.enqueue(&s("k"), 2)?;
    sieve.flush()?;

    assert_eq!(rx.appended(), vec![s("k")]);
    // Hashes only: one 8-byte record, no value bytes.
    assert_eq!(
        std::fs::metadata(sieve.dir().join(STORE_FILENAME))?.len(),
        RECORD_BYTES
    );
    Ok(())
}

// --------------------- Order property ---------------------

#[test]
fn emissions_equal_first_occurrences_across_many_flushes() -> Result<()> {
    let dir = tempdir()?;
    let (sieve, rx) = u64_sieve(dir.path(), 37);

    // Deterministic LCG over a small key space to force heavy repetition.
    let mut x: u64 = 0x2545_f491_4f6c_dd1d;
    let mut input = Vec::new();
    for _ in 0..1000 {
        x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        input.push((x >> 33) % 300);
    }
    for k in &input {
        sieve.enqueue(k, ())?;
    }
    sieve.flush()?;

    let mut seen = std::collections::HashSet::new();
    let expected: Vec<u64> = input.iter().copied().filter(|k| seen.insert(*k)).collect();
    assert_eq!(rx.appended(), expected);

    let mut sorted = expected.clone();
    sorted.sort_unstable();
    assert_eq!(store_contents(sieve.dir())?, sorted);
    Ok(())
}
