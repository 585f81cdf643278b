//! Relocation of allocations across heaps.
//!
//! A diff computed against one frame must replay against a sibling frame whose store
//! placed its objects elsewhere. Allocations are therefore named symbolically:
//!
//! ```text
//!   AllocSite (inst, parent, field) --RelocTable--> #reloc(r)        per analysis
//!   #reloc(r) <--------AllocTable--------> #obj(o)                   per store
//! ```
//!
//! [`RelocTable`] hands out one relocated id per allocation site. Each [`Store`] keeps
//! its own [`AllocTable`], a bijection between relocated ids and the slots that store
//! chose, so the same `#reloc(r)` resolves to different slots in different stores.

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};

use crate::address::{Addr, MAX_RELOC_ID};
use crate::error::StoreError;
use crate::store::{AllocSite, Store};
use crate::utils::{hash_u32, mix2};
use crate::value::Value;

/// Bijection between relocated ids and slot indices of one store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocTable {
    forward: BTreeMap<u32, u32>,
    reverse: HashMap<u32, u32>,
    hash: u64,
}

fn entry_hash(r: u32, index: u32) -> u64 {
    mix2(hash_u32(r), hash_u32(index))
}

impl AllocTable {
    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    /// Slot of relocated id `r`.
    pub fn object_of(&self, r: u32) -> Option<u32> {
        self.forward.get(&r).copied()
    }

    /// Relocated id living at slot `index`.
    pub fn reloc_of(&self, index: u32) -> Option<u32> {
        self.reverse.get(&index).copied()
    }

    /// Maps `r` to `index` in both directions, replacing stale pairs.
    pub fn insert(&mut self, r: u32, index: u32) {
        self.remove(r);
        if let Some(old) = self.reverse.get(&index).copied() {
            self.remove(old);
        }
        self.forward.insert(r, index);
        self.reverse.insert(index, r);
        self.hash ^= entry_hash(r, index);
    }

    pub fn remove(&mut self, r: u32) -> Option<u32> {
        let index = self.forward.remove(&r)?;
        self.reverse.remove(&index);
        self.hash ^= entry_hash(r, index);
        Some(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.forward.iter().map(|(&r, &i)| (r, i))
    }

    pub fn hashcode(&self) -> u64 {
        self.hash
    }

    pub fn compute_hashcode(&self) -> u64 {
        self.forward.iter().fold(0, |acc, (&r, &i)| acc ^ entry_hash(r, i))
    }
}

/// Per-analysis table of relocated ids, keyed by allocation site.
#[derive(Debug, Clone)]
pub struct RelocTable {
    ids: HashMap<AllocSite, u32>,
    sites: Vec<AllocSite>,
    limit: u32,
}

impl Default for RelocTable {
    fn default() -> Self {
        Self::with_limit(MAX_RELOC_ID)
    }
}

impl RelocTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table handing out ids up to `limit` included.
    pub fn with_limit(limit: u32) -> Self {
        Self {
            ids: HashMap::new(),
            sites: Vec::new(),
            limit: limit.min(MAX_RELOC_ID),
        }
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Relocated address for `site`, reserving a fresh id on first request.
    ///
    /// No store is touched: this is the dry-run half of an allocation.
    /// Returns [`Addr::NULL`] once every id is taken.
    pub fn allocate(&mut self, site: AllocSite) -> Addr {
        if let Some(&r) = self.ids.get(&site) {
            return Addr::relocated(r);
        }
        let r = match u32::try_from(self.sites.len()) {
            Ok(r) if r <= self.limit => r,
            _ => {
                warn!("reloc allocate({:?}): ids exhausted after {} sites", site, self.sites.len());
                return Addr::NULL;
            }
        };
        debug!("reloc allocate({:?}) => #reloc({})", site, r);
        self.ids.insert(site.clone(), r);
        self.sites.push(site);
        Addr::relocated(r)
    }

    /// Allocation site of a relocated address.
    pub fn site(&self, addr: Addr) -> Option<&AllocSite> {
        self.sites.get(addr.reloc_id()? as usize)
    }

    /// Allocates a slot for the site of `addr` in `store` and records the mapping,
    /// leaving the slot without a value. Returns the object address.
    pub fn reserve(&self, store: &mut Store, addr: Addr) -> Result<Addr, StoreError> {
        let r = addr.reloc_id().ok_or(StoreError::NotHeap(addr))?;
        if store.alloc_table().object_of(r).is_some() {
            return Err(StoreError::AlreadyAllocated(addr));
        }
        let site = self.site(addr).ok_or(StoreError::Unmapped(addr))?.clone();
        let obj = store
            .allocate(site)
            .ok_or(StoreError::Exhausted { blocks: store.num_blocks() })?;
        let index = obj.object_index().ok_or(StoreError::NotHeap(obj))?;
        store.map_reloc(r, index);
        // A slot handed out again for the same site is a fresh allocation here.
        store.set_reuse(obj, false)?;
        debug!("reserve({}) => {}", addr, obj);
        Ok(obj)
    }

    /// Concretizes `addr` in `store`: allocates a slot for its site, records the mapping
    /// and attaches `value`. Returns the object address.
    pub fn install(&self, store: &mut Store, addr: Addr, value: Value) -> Result<Addr, StoreError> {
        let obj = self.reserve(store, addr)?;
        store.attach(obj, value)?;
        Ok(obj)
    }

    /// Allocates `site` and installs it into `store` in one step.
    pub fn allocate_in(&mut self, store: &mut Store, site: AllocSite, value: Value) -> Result<Addr, StoreError> {
        let r = self.allocate(site);
        if r.is_null() {
            return Err(StoreError::RelocExhausted(self.len()));
        }
        self.install(store, r, value)?;
        Ok(r)
    }

    /// Translates between relocated and object addresses of `store`, in either direction.
    pub fn query(&self, store: &Store, addr: Addr) -> Option<Addr> {
        if let Some(r) = addr.reloc_id() {
            return store.alloc_table().object_of(r).map(Addr::object);
        }
        let index = addr.object_index()?;
        store.alloc_table().reloc_of(index).map(Addr::relocated)
    }
}
