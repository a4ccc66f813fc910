//! Pluggable hashing and value-update strategies.

/// Maps a key to the 64-bit hash the sieve deduplicates on.
///
/// Any `Fn(&K) -> u64` closure is a hashing strategy.
pub trait HashingStrategy<K: ?Sized>: Send + Sync {
    fn hash(&self, key: &K) -> u64;
}

impl<K: ?Sized, F> HashingStrategy<K> for F
where
    F: Fn(&K) -> u64 + Send + Sync,
{
    fn hash(&self, key: &K) -> u64 {
        self(key)
    }
}

/// FNV-1a over the key's bytes.
///
/// Fast and dependency-free, but not keyed: adequate for crawler-sized key
/// spaces, not for adversarial input.
#[derive(Debug, Default, Clone, Copy)]
pub struct Fnv1aHashing;

impl Fnv1aHashing {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x00000100000001b3;

    /// FNV-1a 64-bit hash of `data`.
    #[must_use]
    pub fn hash_bytes(data: &[u8]) -> u64 {
        let mut hash = Self::OFFSET_BASIS;
        for &byte in data {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(Self::PRIME);
        }
        hash
    }
}

impl<K: AsRef<[u8]> + ?Sized> HashingStrategy<K> for Fnv1aHashing {
    fn hash(&self, key: &K) -> u64 {
        Self::hash_bytes(key.as_ref())
    }
}

/// Decides which value to keep when a key is enqueued again.
pub trait UpdateStrategy<K, V>: Send + Sync {
    fn update(&self, key: &K, new_value: V, old_value: V) -> V;
}

/// Keeps the most recently enqueued value.
#[derive(Debug, Default, Clone, Copy)]
pub struct KeepNewest;

impl<K, V> UpdateStrategy<K, V> for KeepNewest {
    fn update(&self, _key: &K, new_value: V, _old_value: V) -> V {
        new_value
    }
}
