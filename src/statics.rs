//! Static field table.
//!
//! Static fields live at [`Addr::static_field`] addresses, a region disjoint from
//! registers and store slots. The table is shared by reference between frames and
//! duplicated on first write. A field is initialized from its default constant on
//! first access.
//!
//! A field still holding its default counts the same as an untouched one, both for
//! equality and for the hashcode, so lazy initialization is not an observable change.

use std::collections::BTreeMap;
use std::rc::Rc;

use log::{debug, warn};

use crate::address::Addr;
use crate::set::Set;
use crate::utils::{hash_u32, mix2};

#[derive(Debug, Clone, Default)]
struct StaticData {
    fields: BTreeMap<u32, Set>,
    hash: u64,
}

/// Copy-on-write table of static field values.
#[derive(Debug, Clone)]
pub struct StaticTable {
    inner: Rc<StaticData>,
    defaults: Rc<[Addr]>,
}

impl Default for StaticTable {
    fn default() -> Self {
        Self::new(Rc::from(Vec::new()))
    }
}

impl StaticTable {
    /// A table whose field `i` defaults to the constant `defaults[i]`.
    ///
    /// A `NULL` default stands for the empty set.
    pub fn new(defaults: Rc<[Addr]>) -> Self {
        Self {
            inner: Rc::new(StaticData::default()),
            defaults,
        }
    }

    pub fn len(&self) -> usize {
        self.defaults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defaults.is_empty()
    }

    /// Whether other frames share this table.
    pub fn is_shared(&self) -> bool {
        Rc::strong_count(&self.inner) > 1
    }

    fn index_of(&self, addr: Addr) -> Option<u32> {
        let Some(index) = addr.static_index() else {
            warn!("statics: {} is not a static field address", addr);
            return None;
        };
        if index as usize >= self.defaults.len() {
            warn!("statics: {} is out of range ({} fields)", addr, self.defaults.len());
            return None;
        }
        Some(index)
    }

    fn default_set(&self, index: u32) -> Set {
        match self.defaults.get(index as usize) {
            Some(&a) if !a.is_null() => Set::singleton(a),
            _ => Set::empty(),
        }
    }

    fn contribution(&self, index: u32, value: &Set) -> u64 {
        if *value == self.default_set(index) {
            0
        } else {
            mix2(hash_u32(index), value.hashcode())
        }
    }

    /// Value of the field at `addr`, initializing it on first access.
    pub fn get(&mut self, addr: Addr) -> Option<&Set> {
        let index = self.index_of(addr)?;
        if !self.inner.fields.contains_key(&index) {
            debug!("statics: lazy init of {}", addr);
            let value = self.default_set(index);
            Rc::make_mut(&mut self.inner).fields.insert(index, value);
        }
        self.inner.fields.get(&index)
    }

    /// Value of the field at `addr` without initializing it.
    pub fn peek(&self, addr: Addr) -> Option<Set> {
        let index = self.index_of(addr)?;
        Some(match self.inner.fields.get(&index) {
            Some(s) => s.fork(),
            None => self.default_set(index),
        })
    }

    /// Writes the field at `addr`, returning the previous value.
    pub fn put(&mut self, addr: Addr, value: Set) -> Option<Set> {
        let index = self.index_of(addr)?;
        let old = self.peek(addr)?;
        let delta = self.contribution(index, &old) ^ self.contribution(index, &value);
        debug!("statics: put({}, {})", addr, value);
        let data = Rc::make_mut(&mut self.inner);
        data.fields.insert(index, value);
        data.hash ^= delta;
        Some(old)
    }

    /// Fields that have been accessed, with their addresses.
    pub fn iter(&self) -> impl Iterator<Item = (Addr, &Set)> + '_ {
        self.inner.fields.iter().map(|(&i, s)| (Addr::static_field(i), s))
    }

    pub fn hashcode(&self) -> u64 {
        self.inner.hash
    }

    pub fn compute_hashcode(&self) -> u64 {
        self.inner
            .fields
            .iter()
            .fold(0, |acc, (&i, s)| acc ^ self.contribution(i, s))
    }
}

impl PartialEq for StaticTable {
    fn eq(&self, other: &Self) -> bool {
        if Rc::ptr_eq(&self.inner, &other.inner) {
            return true;
        }
        if self.inner.hash != other.inner.hash || self.defaults.len() != other.defaults.len() {
            return false;
        }
        let keys = self.inner.fields.keys().chain(other.inner.fields.keys());
        for &i in keys {
            let a = Addr::static_field(i);
            if self.peek(a) != other.peek(a) {
                return false;
            }
        }
        true
    }
}
