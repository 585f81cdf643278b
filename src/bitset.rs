//! Mark bits for the store's mark-and-sweep pass.
//!
//! One bit per store slot. Marking grows the set on demand; sweeping walks the
//! *clear* bits below a bound, which is exactly the set of slots to reclaim.

/// Bit set over slot indices, backed by 64-bit words.
#[derive(Debug, Clone, Default)]
pub struct MarkBits {
    words: Vec<u64>,
    count: usize,
}

impl MarkBits {
    const BITS: usize = 64;

    /// Creates mark bits able to hold `capacity` slots without growing.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(Self::BITS)],
            count: 0,
        }
    }

    /// Number of marked slots.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_marked(&self, index: usize) -> bool {
        match self.words.get(index / Self::BITS) {
            Some(word) => word & (1u64 << (index % Self::BITS)) != 0,
            None => false,
        }
    }

    /// Marks `index`. Returns `true` if it was not marked before.
    pub fn mark(&mut self, index: usize) -> bool {
        let w = index / Self::BITS;
        if w >= self.words.len() {
            self.words.resize(w + 1, 0);
        }
        let bit = 1u64 << (index % Self::BITS);
        if self.words[w] & bit != 0 {
            return false;
        }
        self.words[w] |= bit;
        self.count += 1;
        true
    }

    /// Iterates over the indices below `limit` that are *not* marked.
    pub fn unmarked(&self, limit: usize) -> impl Iterator<Item = usize> + '_ {
        (0..limit).filter(move |&i| !self.is_marked(i))
    }

    /// Iterates over marked indices in increasing order.
    pub fn marked(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let b = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(w * Self::BITS + b)
            })
        })
    }
}
