//! 32-bit hashing over sorted id sequences and the dedup map built on it.
//!
//! Archetypes and queries are identified by their type-id sets. The set is reduced to a
//! 32-bit rolling code, and colliding codes keep a short bucket that is resolved by an
//! exact comparison supplied by the caller.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

const SEED: u32 = 0x811C_9DC5;
const PRIME: u32 = 0x0100_0193;

/// Rolling 32-bit code (FNV-1a over whole words).
#[inline]
pub fn roll(hash: u32, value: u32) -> u32 {
    (hash ^ value).wrapping_mul(PRIME)
}

/// Hash an id sequence. Order matters, so callers pass sorted sequences.
pub fn hash_ids<I>(ids: I) -> u32
where
    I: IntoIterator<Item = u32>,
{
    ids.into_iter().fold(SEED, roll)
}

/// Open map keyed by 32-bit codes, storing every value that hashed to the code.
#[derive(Debug, Clone)]
pub struct DedupMap<V> {
    buckets: FxHashMap<u32, SmallVec<[V; 1]>>,
    len: usize,
}

impl<V> Default for DedupMap<V> {
    fn default() -> Self {
        Self {
            buckets: FxHashMap::default(),
            len: 0,
        }
    }
}

impl<V: Copy> DedupMap<V> {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut buckets = FxHashMap::default();
        buckets.reserve(capacity);
        Self { buckets, len: 0 }
    }

    /// Find the value under `code` accepted by `is_match`.
    pub fn find<F>(&self, code: u32, mut is_match: F) -> Option<V>
    where
        F: FnMut(V) -> bool,
    {
        self.buckets
            .get(&code)?
            .iter()
            .copied()
            .find(|&value| is_match(value))
    }

    pub fn insert(&mut self, code: u32, value: V) {
        self.buckets.entry(code).or_default().push(value);
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_order_sensitive() {
        assert_eq!(hash_ids([1, 2, 3]), hash_ids([1, 2, 3]));
        assert_ne!(hash_ids([1, 2, 3]), hash_ids([3, 2, 1]));
        assert_ne!(hash_ids([]), hash_ids([0]));
    }

    #[test]
    fn test_collisions_resolved_by_predicate() {
        let mut map = DedupMap::default();
        map.insert(7, 10u32);
        map.insert(7, 11u32);
        assert_eq!(map.len(), 2);
        assert_eq!(map.find(7, |v| v == 11), Some(11));
        assert_eq!(map.find(7, |v| v == 12), None);
        assert_eq!(map.find(8, |_| true), None);
    }
}
