use std::cell::Cell;

use crate::utils::MyHash;

struct Entry<K, V> {
    hash: u64,
    key: K,
    value: V,
}

/// Direct-mapped result cache.
///
/// Each key goes to the single slot selected by the low bits of its hash, evicting the
/// previous occupant. A lookup hits only if the stored key is equal to the requested
/// one, so colliding hashes never return a wrong result.
pub struct Cache<K, V> {
    data: Vec<Option<Entry<K, V>>>,
    bitmask: u64,
    hits: Cell<usize>,
    misses: Cell<usize>,
}

impl<K, V> Cache<K, V> {
    /// Create a new table of size `2^bits`.
    pub fn new(bits: usize) -> Self {
        assert!(bits <= 31, "Bits should be in the range 0..=31");

        let size = 1 << bits;
        let bitmask = (size - 1) as u64;

        Self {
            data: std::iter::repeat_with(|| None).take(size).collect(),
            bitmask,
            hits: Cell::new(0),
            misses: Cell::new(0),
        }
    }

    /// Get the number of cache hits.
    pub fn hits(&self) -> usize {
        self.hits.get()
    }
    /// Get the number of cache misses.
    pub fn misses(&self) -> usize {
        self.misses.get()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.data.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reset the cache.
    pub fn clear(&mut self) {
        self.data.fill_with(|| None);
    }

    fn index(&self, hash: u64) -> usize {
        (hash & self.bitmask) as usize
    }

    /// Get the cached result.
    pub fn get(&self, key: &K) -> Option<&V>
    where
        K: MyHash + PartialEq,
    {
        let hash = key.hash();
        let index = self.index(hash);
        match &self.data[index] {
            Some(entry) if entry.hash == hash && entry.key == *key => {
                self.hits.set(self.hits.get() + 1);
                Some(&entry.value)
            }
            _ => {
                self.misses.set(self.misses.get() + 1);
                None
            }
        }
    }

    /// Insert a result into the cache.
    pub fn insert(&mut self, key: K, value: V)
    where
        K: MyHash,
    {
        let hash = key.hash();
        let index = self.index(hash);
        self.data[index] = Some(Entry { hash, key, value });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_hits_and_misses() {
        let mut cache = Cache::<(u64, u64), &str>::new(4);
        cache.insert((0, 7), "entry");
        cache.insert((2, 7), "loop");

        assert_eq!(cache.get(&(0, 7)), Some(&"entry"));
        assert_eq!(cache.get(&(2, 7)), Some(&"loop"));
        assert_eq!(cache.get(&(2, 8)), None);
        assert_eq!(cache.get(&(7, 0)), None);
        assert_eq!((cache.hits(), cache.misses()), (2, 2));

        cache.insert((2, 7), "loop, again");
        assert_eq!(cache.get(&(2, 7)), Some(&"loop, again"));
    }

    #[test]
    fn test_collision_evicts() {
        // A single slot: every key collides.
        let mut cache = Cache::<(u64, u64), i32>::new(0);
        cache.insert((1, 2), 3);
        cache.insert((5, 6), 7);
        assert_eq!(cache.get(&(1, 2)), None);
        assert_eq!(cache.get(&(5, 6)), Some(&7));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
