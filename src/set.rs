//! Abstract value sets.
//!
//! A [`Set`] is an element of the powerset lattice over [`Addr`]: every address a
//! register or field might hold. Sets are shared by reference and duplicated on the
//! first write to a shared copy, so [`Set::fork`] is O(1).
//!
//! Members are kept sorted and unique. All constant lattice points are folded into a
//! single constant member, so two sets describing the same values are always equal:
//!
//! ```text
//! push(#obj(3)); push({-}); push({+})   =>   [#obj(3), {-+}]
//! ```
//!
//! The hashcode is the XOR of per-member hashes, maintained on every mutation,
//! plus the hash of the carried [`TagSet`].

use std::fmt::{Debug, Display, Formatter};
use std::rc::Rc;

use crate::address::Addr;
use crate::tag::{Tag, TagSet};
use crate::utils::MyHash;

#[derive(Clone, Default)]
struct SetData {
    members: Vec<Addr>,
    /// XOR of member hashes.
    hash: u64,
    tags: TagSet,
}

/// Powerset of addresses with copy-on-write sharing.
#[derive(Clone, Default)]
pub struct Set {
    inner: Rc<SetData>,
}

impl Set {
    /// The empty set.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn singleton(addr: Addr) -> Self {
        let mut set = Self::empty();
        set.push(addr);
        set
    }

    /// Shares this set with a new owner.
    pub fn fork(&self) -> Self {
        self.clone()
    }

    /// Whether other owners share this set.
    pub fn is_shared(&self) -> bool {
        Rc::strong_count(&self.inner) > 1
    }

    pub fn len(&self) -> usize {
        self.inner.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.members.is_empty()
    }

    /// Membership test.
    ///
    /// For a constant address, tests whether *all* its lattice points are possible.
    pub fn contains(&self, addr: Addr) -> bool {
        match addr.const_bits() {
            Some(bits) => self.constant_bits().is_some_and(|own| own & bits == bits),
            None => self.inner.members.binary_search(&addr).is_ok(),
        }
    }

    /// Union of all constant lattice points in the set.
    pub fn constant_bits(&self) -> Option<u8> {
        self.inner.members.last().and_then(|a| a.const_bits())
    }

    /// Inserts an address. Returns `true` if the set changed.
    pub fn push(&mut self, addr: Addr) -> bool {
        if let Some(bits) = addr.const_bits() {
            return self.push_constant(bits);
        }
        match self.inner.members.binary_search(&addr) {
            Ok(_) => false,
            Err(pos) => {
                let data = Rc::make_mut(&mut self.inner);
                data.members.insert(pos, addr);
                data.hash ^= MyHash::hash(&addr);
                true
            }
        }
    }

    fn push_constant(&mut self, bits: u8) -> bool {
        let old = self.constant_bits();
        let merged = old.unwrap_or(0) | bits;
        if old == Some(merged) {
            return false;
        }
        let data = Rc::make_mut(&mut self.inner);
        if let Some(old) = old {
            let prev = Addr::constant(old);
            data.members.pop();
            data.hash ^= MyHash::hash(&prev);
        }
        let addr = Addr::constant(merged);
        data.members.push(addr);
        data.hash ^= MyHash::hash(&addr);
        true
    }

    /// Removes an address. Returns `true` if it was present.
    pub fn remove(&mut self, addr: Addr) -> bool {
        match self.inner.members.binary_search(&addr) {
            Ok(pos) => {
                let data = Rc::make_mut(&mut self.inner);
                data.members.remove(pos);
                data.hash ^= MyHash::hash(&addr);
                true
            }
            Err(_) => false,
        }
    }

    /// Unions `other` into `self`, tags included. Returns `true` if `self` changed.
    pub fn merge(&mut self, other: &Set) -> bool {
        if Rc::ptr_eq(&self.inner, &other.inner) {
            return false;
        }
        if self.is_empty() && self.inner.tags.is_empty() {
            *self = other.fork();
            return !other.is_empty() || !other.inner.tags.is_empty();
        }
        let mut changed = false;
        for addr in other.iter() {
            changed |= self.push(addr);
        }
        if !other.inner.tags.is_subset_of(&self.inner.tags) {
            Rc::make_mut(&mut self.inner).tags.union_with(&other.inner.tags);
            changed = true;
        }
        changed
    }

    /// Restartable iterator over members in address order.
    pub fn iter(&self) -> SetIter<'_> {
        SetIter {
            members: &self.inner.members,
            pos: 0,
        }
    }

    /// Members that live in the store, directly or through relocation.
    pub fn heap_addrs(&self) -> impl Iterator<Item = Addr> + '_ {
        self.iter().filter(|a| a.is_heap())
    }

    pub fn tags(&self) -> &TagSet {
        &self.inner.tags
    }

    pub fn add_tag(&mut self, tag: Tag) -> bool {
        if self.inner.tags.contains(tag) {
            return false;
        }
        Rc::make_mut(&mut self.inner).tags.insert(tag)
    }

    /// Incrementally maintained hashcode.
    pub fn hashcode(&self) -> u64 {
        self.inner.hash ^ MyHash::hash(&self.inner.tags)
    }

    /// Hashcode recomputed from the members.
    pub fn compute_hashcode(&self) -> u64 {
        let members = self.inner.members.iter().fold(0, |acc, a| acc ^ MyHash::hash(a));
        members ^ MyHash::hash(&self.inner.tags)
    }
}

impl PartialEq for Set {
    fn eq(&self, other: &Self) -> bool {
        if Rc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        self.inner.hash == other.inner.hash && self.inner.members == other.inner.members && self.inner.tags == other.inner.tags
    }
}

impl Eq for Set {}

impl MyHash for Set {
    fn hash(&self) -> u64 {
        self.hashcode()
    }
}

impl FromIterator<Addr> for Set {
    fn from_iter<I: IntoIterator<Item = Addr>>(iter: I) -> Self {
        let mut set = Set::empty();
        for a in iter {
            set.push(a);
        }
        set
    }
}

impl<'a> IntoIterator for &'a Set {
    type Item = Addr;
    type IntoIter = SetIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over the members of a [`Set`].
#[derive(Clone)]
pub struct SetIter<'a> {
    members: &'a [Addr],
    pos: usize,
}

impl Iterator for SetIter<'_> {
    type Item = Addr;

    fn next(&mut self) -> Option<Self::Item> {
        let a = self.members.get(self.pos).copied()?;
        self.pos += 1;
        Some(a)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.members.len() - self.pos;
        (n, Some(n))
    }
}

impl ExactSizeIterator for SetIter<'_> {}

impl Display for Set {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, a) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", a)?;
        }
        write!(f, "]")?;
        if !self.inner.tags.is_empty() {
            write!(f, "{}", self.inner.tags)?;
        }
        Ok(())
    }
}

impl Debug for Set {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Set{}", self)
    }
}
