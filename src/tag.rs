//! Opaque tag sets.
//!
//! The taint layer attaches tags to values; the machine never interprets them.
//! It only unions them on merge and carries them through fork and duplication.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use crate::utils::{hash_u32, MyHash};

/// Opaque tag identifier.
pub type Tag = u32;

#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct TagSet {
    tags: BTreeSet<Tag>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(tag: Tag) -> Self {
        let mut set = Self::new();
        set.insert(tag);
        set
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.tags.contains(&tag)
    }

    /// Returns `true` if the tag was not present.
    pub fn insert(&mut self, tag: Tag) -> bool {
        self.tags.insert(tag)
    }

    /// Unions `other` into `self`. Returns `true` if anything was added.
    pub fn union_with(&mut self, other: &TagSet) -> bool {
        let before = self.tags.len();
        self.tags.extend(other.tags.iter().copied());
        self.tags.len() != before
    }

    pub fn is_subset_of(&self, other: &TagSet) -> bool {
        self.tags.is_subset(&other.tags)
    }

    pub fn iter(&self) -> impl Iterator<Item = Tag> + '_ {
        self.tags.iter().copied()
    }
}

impl MyHash for TagSet {
    fn hash(&self) -> u64 {
        self.tags.iter().fold(0, |acc, &t| acc ^ hash_u32(t).rotate_left(7))
    }
}

impl FromIterator<Tag> for TagSet {
    fn from_iter<I: IntoIterator<Item = Tag>>(iter: I) -> Self {
        Self {
            tags: iter.into_iter().collect(),
        }
    }
}

impl Display for TagSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "<")?;
        for (i, t) in self.tags.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", t)?;
        }
        write!(f, ">")
    }
}
