//! Hash mixing helpers.
//!
//! The machine keeps several hashcodes incrementally (sets, stores, static tables),
//! combining per-element hashes with XOR so that insertion order does not matter.
//! Per-element hashes must therefore be well spread; the functions here provide that.

/// Knuth's multiplicative hashing constant.
pub const MH_MULTIPLY: u64 = 2654435761;

/// Hash of a single 32-bit word.
pub fn hash_u32(x: u32) -> u64 {
    mix64((x as u64).wrapping_mul(MH_MULTIPLY))
}

/// Finalizer from SplitMix64.
pub fn mix64(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Order-dependent combination of two hashes.
pub fn mix2(a: u64, b: u64) -> u64 {
    mix64(a.wrapping_mul(MH_MULTIPLY) ^ b.rotate_left(17))
}

/// Order-dependent combination of three hashes.
pub fn mix3(a: u64, b: u64, c: u64) -> u64 {
    mix2(mix2(a, b), c)
}

/// FNV-1a over the bytes of `s`.
pub fn hash_str(s: &str) -> u64 {
    let mut h: u64 = 0xCBF2_9CE4_8422_2325;
    for b in s.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x0100_0000_01B3);
    }
    h
}

pub trait MyHash {
    /// Hash used by the machine's own incremental hashcodes.
    ///
    /// Must be stable across runs: it takes part in frame hashcodes that key caches.
    fn hash(&self) -> u64;
}

impl MyHash for u32 {
    fn hash(&self) -> u64 {
        hash_u32(*self)
    }
}

impl MyHash for (u64, u64) {
    fn hash(&self) -> u64 {
        mix2(self.0, self.1)
    }
}

impl MyHash for (u64, u64, u64) {
    fn hash(&self) -> u64 {
        mix3(self.0, self.1, self.2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashSet;

    use test_log::test;

    #[test]
    fn test_hash_u32_spreads() {
        let hashes: HashSet<u64> = (0..10_000u32).map(hash_u32).collect();
        assert_eq!(hashes.len(), 10_000);
    }

    #[test]
    fn test_mix2_order_dependent() {
        assert_ne!(mix2(1, 2), mix2(2, 1));
        assert_eq!(mix2(1, 2), mix2(1, 2));
    }

    #[test]
    fn test_hash_str() {
        assert_eq!(hash_str(""), 0xCBF2_9CE4_8422_2325);
        assert_ne!(hash_str("Ljava/lang/Object;"), hash_str("Ljava/lang/String;"));
    }

    #[test]
    fn test_myhash_tuples() {
        assert_eq!((1u64, 2u64).hash(), mix2(1, 2));
        assert_eq!((1u64, 2u64, 3u64).hash(), mix3(1, 2, 3));
    }
}
