//! Content-addressed dedup index for cacheable resource kinds.
//!
//! The index maps a structural hash to the slot keys whose description hashed
//! to it; the caller resolves hash collisions with a structural equality
//! check against the live slot. Lookups that hit bump the slot's refcount;
//! destruction of a cached slot removes its entry.

use fxhash::FxHashMap;
use std::hash::{Hash, Hasher};

pub(crate) fn structural_hash<T: Hash>(value: &T) -> u64 {
    let mut hasher = fxhash::FxHasher::default();
    value.hash(&mut hasher);
    hasher.finish()
}

pub(crate) struct DedupIndex<K: slotmap::Key> {
    buckets: FxHashMap<u64, Vec<K>>,
}

impl<K: slotmap::Key> Default for DedupIndex<K> {
    fn default() -> Self {
        DedupIndex {
            buckets: FxHashMap::default(),
        }
    }
}

impl<K: slotmap::Key> DedupIndex<K> {
    /// Returns the first key under `hash` whose slot compares structurally
    /// equal according to `eq`.
    pub(crate) fn find(&self, hash: u64, mut eq: impl FnMut(K) -> bool) -> Option<K> {
        self.buckets
            .get(&hash)?
            .iter()
            .copied()
            .find(|&key| eq(key))
    }

    pub(crate) fn insert(&mut self, hash: u64, key: K) {
        self.buckets.entry(hash).or_default().push(key);
    }

    pub(crate) fn remove(&mut self, hash: u64, key: K) {
        if let Some(bucket) = self.buckets.get_mut(&hash) {
            bucket.retain(|&k| k != key);
            if bucket.is_empty() {
                self.buckets.remove(&hash);
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    slotmap::new_key_type! {
        struct TestKey;
    }

    #[test]
    fn collisions_resolve_by_equality_check() {
        let mut map: slotmap::SlotMap<TestKey, u32> = slotmap::SlotMap::with_key();
        let a = map.insert(1);
        let b = map.insert(2);

        let mut index = DedupIndex::default();
        // force both keys into the same bucket
        index.insert(42, a);
        index.insert(42, b);

        assert_eq!(index.find(42, |k| map[k] == 2), Some(b));
        assert_eq!(index.find(42, |k| map[k] == 3), None);

        index.remove(42, a);
        assert_eq!(index.find(42, |k| map[k] == 1), None);
        index.remove(42, b);
        assert!(index.is_empty());
    }
}
