//! The abstract heap.
//!
//! A [`Store`] is a growable sequence of fixed-size blocks of [`Slot`]s.
//! Blocks are shared by reference between stores, so [`Store::fork`] is O(1);
//! the first write to a shared block duplicates it. Values inside slots are shared
//! the same way.
//!
//! ```text
//!   store A: [ blk0 ] [ blk1 ] [ blk2 ]
//!               |        |        |
//!   store B: [ blk0 ] [ blk1'] [ blk2 ]     after B writes into blk1
//! ```
//!
//! Each slot holds:
//! - a reference count of the addresses pointing at it (registers, statics, and other
//!   values), distinct from the sharing count of the value itself,
//! - the allocation site that produced it, so re-executing the same site yields the
//!   same slot,
//! - a "reuse" flag, set when a site is visited again,
//! - the value, once attached.
//!
//! # Reclamation
//!
//! A slot whose reference count drops to zero is released, and so are the addresses
//! its value held, transitively. Reference cycles survive this; [`Store::gc`] is the
//! authoritative reclamation pass: it marks everything reachable from a root set and
//! releases every other allocated slot.
//!
//! # Hashcode
//!
//! The store hashcode is the XOR of per-slot hashes (external name, value hash, reuse
//! flag). A slot's external name is its relocated address when it has one, so two
//! stores that placed the same allocations at different indices hash and compare
//! equal. The hashcode is updated on every mutation and must always equal
//! [`Store::compute_hashcode`]. Reference counts are derived data and take no part in
//! hashing or equality.

use std::fmt::{Debug, Formatter};
use std::rc::Rc;

use log::{debug, trace, warn};

use crate::address::{Addr, AddrKind, MAX_OBJECT_INDEX};
use crate::bitset::MarkBits;
use crate::error::StoreError;
use crate::reloc::AllocTable;
use crate::utils::{hash_u32, mix3, MyHash};
use crate::value::Value;

/// Store layout parameters.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct StoreConfig {
    /// Number of slots in a block.
    pub block_slots: usize,
    /// Maximum number of blocks; allocation fails past it.
    pub max_blocks: usize,
    /// Probe attempts per block before moving on.
    pub probe_limit: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            block_slots: 64,
            max_blocks: 4096,
            probe_limit: 8,
        }
    }
}

/// Allocation site key: which instruction allocated the slot, and for field slots,
/// the owning object and the field name.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct AllocSite {
    pub inst: u32,
    pub parent: Addr,
    pub field: Option<Rc<str>>,
}

impl AllocSite {
    /// Site of an object allocated by instruction `inst`.
    pub fn object(inst: u32) -> Self {
        Self {
            inst,
            parent: Addr::NULL,
            field: None,
        }
    }

    /// Site of the slot of field `field` of the object `parent`.
    pub fn field(inst: u32, parent: Addr, field: &str) -> Self {
        Self {
            inst,
            parent,
            field: Some(field.into()),
        }
    }
}

impl MyHash for AllocSite {
    fn hash(&self) -> u64 {
        let field = self.field.as_deref().map(crate::utils::hash_str).unwrap_or(0);
        mix3(hash_u32(self.inst), MyHash::hash(&self.parent), field)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Slot {
    allocated: bool,
    refcnt: u32,
    reuse: bool,
    site: Option<AllocSite>,
    value: Option<Rc<Value>>,
}

impl Slot {
    pub fn is_allocated(&self) -> bool {
        self.allocated
    }
    pub fn refcnt(&self) -> u32 {
        self.refcnt
    }
    pub fn reuse(&self) -> bool {
        self.reuse
    }
    pub fn site(&self) -> Option<&AllocSite> {
        self.site.as_ref()
    }
    pub fn value(&self) -> Option<&Value> {
        self.value.as_deref()
    }

    fn hash(&self, name: Addr) -> u64 {
        if !self.allocated {
            return 0;
        }
        let v = self.value.as_ref().map(|v| v.hashcode()).unwrap_or(0);
        mix3(MyHash::hash(&name), v, self.reuse as u64)
    }

    fn compute_hash(&self, name: Addr) -> u64 {
        if !self.allocated {
            return 0;
        }
        let v = self.value.as_ref().map(|v| v.compute_hashcode()).unwrap_or(0);
        mix3(MyHash::hash(&name), v, self.reuse as u64)
    }
}

#[derive(Debug, Clone)]
struct Block {
    slots: Vec<Slot>,
    used: usize,
}

impl Block {
    fn new(size: usize) -> Self {
        Self {
            slots: vec![Slot::default(); size],
            used: 0,
        }
    }
}

/// A slot freed while the store was journaling.
#[derive(Debug, Clone)]
pub struct Freed {
    /// External name of the slot, see [`Store::external_addr`].
    pub addr: Addr,
    pub value: Value,
    pub reuse: bool,
}

/// Copy-on-write abstract heap.
#[derive(Clone)]
pub struct Store {
    config: StoreConfig,
    blocks: Vec<Rc<Block>>,
    alloc: Rc<AllocTable>,
    used: usize,
    hash: u64,
    journal: Option<Vec<Freed>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        debug!("new store with {:?}", config);
        Self {
            config,
            blocks: Vec::new(),
            alloc: Rc::new(AllocTable::default()),
            used: 0,
            hash: 0,
            journal: None,
        }
    }

    /// A new store sharing every block with `self`.
    pub fn fork(&self) -> Self {
        trace!("fork store ({} blocks)", self.blocks.len());
        let mut store = self.clone();
        store.journal = None;
        store
    }

    /// Starts recording every freed slot. No-op if already recording.
    pub fn start_journal(&mut self) {
        if self.journal.is_none() {
            self.journal = Some(Vec::new());
        }
    }

    /// Stops recording and returns the slots freed since [`Store::start_journal`],
    /// in the order they were freed.
    pub fn take_journal(&mut self) -> Vec<Freed> {
        self.journal.take().unwrap_or_default()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Number of allocated slots.
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Number of slots over all blocks.
    pub fn capacity(&self) -> usize {
        self.blocks.len() * self.config.block_slots
    }

    /// Whether block `b` is physically shared with `other`.
    pub fn shares_block(&self, other: &Store, b: usize) -> bool {
        match (self.blocks.get(b), other.blocks.get(b)) {
            (Some(x), Some(y)) => Rc::ptr_eq(x, y),
            _ => false,
        }
    }

    pub fn alloc_table(&self) -> &AllocTable {
        &self.alloc
    }

    /// Whether both stores resolve relocated addresses identically.
    pub fn shares_alloc_table(&self, other: &Store) -> bool {
        Rc::ptr_eq(&self.alloc, &other.alloc) || self.alloc == other.alloc
    }

    fn split(&self, index: u32) -> (usize, usize) {
        let i = index as usize;
        (i / self.config.block_slots, i % self.config.block_slots)
    }

    /// Slot index for a store address, translating relocated addresses.
    ///
    /// Logs and returns `None` for addresses that do not name a slot.
    pub fn resolve(&self, addr: Addr) -> Option<u32> {
        match addr.kind() {
            AddrKind::Object => addr.object_index(),
            AddrKind::Relocated => {
                let r = addr.reloc_id()?;
                let index = self.alloc.object_of(r);
                if index.is_none() {
                    trace!("resolve: {} is not mapped in this store", addr);
                }
                index
            }
            _ => {
                warn!("resolve: {} does not name a store slot", addr);
                None
            }
        }
    }

    /// External name of slot `index`.
    fn name_of(&self, index: u32) -> Addr {
        match self.alloc.reloc_of(index) {
            Some(r) => Addr::relocated(r),
            None => Addr::object(index),
        }
    }

    fn slot_hash(&self, index: u32) -> u64 {
        self.slot(index).map(|s| s.hash(self.name_of(index))).unwrap_or(0)
    }

    fn slot(&self, index: u32) -> Option<&Slot> {
        let (b, o) = self.split(index);
        self.blocks.get(b).map(|blk| &blk.slots[o])
    }

    /// Writable slot. Duplicates the owning block if it is shared.
    fn slot_mut(&mut self, index: u32) -> Option<&mut Slot> {
        let (b, o) = self.split(index);
        let blk = self.blocks.get_mut(b)?;
        Some(&mut Rc::make_mut(blk).slots[o])
    }

    fn allocated_slot(&self, addr: Addr) -> Result<(u32, &Slot), StoreError> {
        let index = match addr.kind() {
            AddrKind::Relocated => self.resolve(addr).ok_or(StoreError::Unmapped(addr))?,
            AddrKind::Object => addr.object_index().ok_or(StoreError::NotHeap(addr))?,
            _ => return Err(StoreError::NotHeap(addr)),
        };
        match self.slot(index) {
            Some(slot) if slot.allocated => Ok((index, slot)),
            _ => Err(StoreError::Unallocated(addr)),
        }
    }

    /// Read-only view of the slot behind `addr`, if allocated.
    pub fn get_slot(&self, addr: Addr) -> Option<&Slot> {
        let index = self.resolve(addr)?;
        self.slot(index).filter(|s| s.allocated)
    }

    /// Read-only access to the value at `addr`.
    pub fn get(&self, addr: Addr) -> Option<&Value> {
        self.get_slot(addr).and_then(|s| s.value())
    }

    pub fn is_allocated(&self, addr: Addr) -> bool {
        self.get_slot(addr).is_some()
    }

    pub fn refcount(&self, addr: Addr) -> Option<u32> {
        self.get_slot(addr).map(|s| s.refcnt)
    }

    pub fn is_reused(&self, addr: Addr) -> bool {
        self.get_slot(addr).is_some_and(|s| s.reuse)
    }

    /// Allocates a slot for `site`.
    ///
    /// Each block is searched along a quadratic probe sequence seeded by the site hash.
    /// A slot already allocated for the same site is returned again with its reuse flag
    /// set. Otherwise the first free probed slot is taken, and a new block is added when
    /// every probe failed. Returns `None` once the store is at its block limit.
    pub fn allocate(&mut self, site: AllocSite) -> Option<Addr> {
        let h = MyHash::hash(&site);
        let n = self.config.block_slots;
        let mut free = None;
        for b in 0..self.blocks.len() {
            let blk = &self.blocks[b];
            for i in 0..self.config.probe_limit {
                let o = (h.wrapping_add((i * i) as u64) % n as u64) as usize;
                let slot = &blk.slots[o];
                if slot.allocated && slot.site.as_ref() == Some(&site) {
                    let index = (b * n + o) as u32;
                    debug!("allocate({:?}) => reuse #obj({})", site, index);
                    self.set_reuse_at(index, true);
                    return Some(Addr::object(index));
                }
                if !slot.allocated && free.is_none() {
                    free = Some(b * n + o);
                }
            }
        }
        let index = match free {
            Some(i) => i,
            None => {
                if self.blocks.len() >= self.config.max_blocks || !self.block_addressable(self.blocks.len()) {
                    warn!("allocate: store is full ({} blocks)", self.blocks.len());
                    return None;
                }
                self.blocks.push(Rc::new(Block::new(n)));
                let b = self.blocks.len() - 1;
                b * n + (h % n as u64) as usize
            }
        };
        let index = index as u32;
        self.occupy(index, Some(site));
        debug!("allocate => #obj({})", index);
        Some(Addr::object(index))
    }

    /// Whether every slot of block `b` has an object address.
    fn block_addressable(&self, b: usize) -> bool {
        (b + 1)
            .checked_mul(self.config.block_slots)
            .is_some_and(|end| end <= MAX_OBJECT_INDEX as usize + 1)
    }

    /// Allocates the specific object address `addr`, growing the store as needed.
    pub fn allocate_at(&mut self, addr: Addr, site: Option<AllocSite>) -> Result<(), StoreError> {
        let index = addr.object_index().ok_or(StoreError::NotHeap(addr))?;
        let (b, _) = self.split(index);
        if b >= self.config.max_blocks {
            return Err(StoreError::Exhausted { blocks: self.blocks.len() });
        }
        while self.blocks.len() <= b {
            self.blocks.push(Rc::new(Block::new(self.config.block_slots)));
        }
        if self.slot(index).is_some_and(|s| s.allocated) {
            return Err(StoreError::AlreadyAllocated(addr));
        }
        self.occupy(index, site);
        debug!("allocate_at({})", addr);
        Ok(())
    }

    fn occupy(&mut self, index: u32, site: Option<AllocSite>) {
        let (b, _) = self.split(index);
        if let Some(blk) = self.blocks.get_mut(b) {
            Rc::make_mut(blk).used += 1;
        }
        let name = self.name_of(index);
        if let Some(slot) = self.slot_mut(index) {
            *slot = Slot {
                allocated: true,
                refcnt: 0,
                reuse: false,
                site,
                value: None,
            };
            let h = slot.hash(name);
            self.hash ^= h;
            self.used += 1;
        }
    }

    fn set_reuse_at(&mut self, index: u32, flag: bool) {
        let name = self.name_of(index);
        let Some(slot) = self.slot_mut(index) else {
            return;
        };
        if slot.reuse == flag {
            return;
        }
        let before = slot.hash(name);
        slot.reuse = flag;
        let after = slot.hash(name);
        self.hash ^= before ^ after;
    }

    /// Sets the reuse flag of the slot at `addr`.
    pub fn set_reuse(&mut self, addr: Addr, flag: bool) -> Result<(), StoreError> {
        let (index, _) = self.allocated_slot(addr)?;
        debug!("set_reuse({}, {})", addr, flag);
        self.set_reuse_at(index, flag);
        Ok(())
    }

    /// Installs `value` at `addr`, releasing any prior occupant.
    pub fn attach(&mut self, addr: Addr, value: Value) -> Result<(), StoreError> {
        let (index, _) = self.allocated_slot(addr)?;
        debug!("attach({}, {})", addr, value);
        self.replace(index, Some(Rc::new(value)));
        Ok(())
    }

    /// Installs `value` at `addr` without releasing the prior occupant.
    ///
    /// References held by `value` are counted right away. The references held by the
    /// old value are returned instead of dropped: the caller must [`Store::decref`] each
    /// of them once it is done writing.
    pub fn replace_value(&mut self, addr: Addr, value: Value) -> Result<Vec<Addr>, StoreError> {
        let (index, _) = self.allocated_slot(addr)?;
        debug!("replace_value({}, {})", addr, value);
        for a in value.referenced_addrs() {
            self.incref(a);
        }
        let name = self.name_of(index);
        let Some(slot) = self.slot_mut(index) else {
            return Ok(Vec::new());
        };
        let before = slot.hash(name);
        let old = slot.value.replace(Rc::new(value));
        let after = slot.hash(name);
        self.hash ^= before ^ after;
        Ok(old.map(|v| v.referenced_addrs()).unwrap_or_default())
    }

    /// Writable access to the value at `addr`.
    ///
    /// The value is duplicated first if another store shares it, and so is its block.
    /// Reference counts of the addresses the value gains or loses are adjusted after `f`.
    pub fn update<R>(&mut self, addr: Addr, f: impl FnOnce(&mut Value) -> R) -> Result<R, StoreError> {
        let (index, slot) = self.allocated_slot(addr)?;
        let Some(old) = slot.value.clone() else {
            return Err(StoreError::Empty(addr));
        };
        let mut value = old;
        let name = self.name_of(index);
        // Drop the slot's reference first so the value is not needlessly duplicated.
        if let Some(slot) = self.slot_mut(index) {
            let before = slot.hash(name);
            slot.value = None;
            self.hash ^= before ^ slot.hash(name);
        }
        let before_refs = value.referenced_addrs();
        let res = f(Rc::make_mut(&mut value));
        let after_refs = value.referenced_addrs();
        if let Some(slot) = self.slot_mut(index) {
            let before = slot.hash(name);
            slot.value = Some(value);
            self.hash ^= before ^ slot.hash(name);
        }
        for a in after_refs {
            self.incref(a);
        }
        for a in before_refs {
            self.decref(a);
        }
        Ok(res)
    }

    /// Puts `new` into slot `index` and fixes up hash and reference counts.
    fn replace(&mut self, index: u32, new: Option<Rc<Value>>) {
        let new_refs = new.as_ref().map(|v| v.referenced_addrs()).unwrap_or_default();
        let name = self.name_of(index);
        let Some(slot) = self.slot_mut(index) else {
            return;
        };
        let before = slot.hash(name);
        let old = std::mem::replace(&mut slot.value, new);
        let after = slot.hash(name);
        self.hash ^= before ^ after;
        for a in new_refs {
            self.incref(a);
        }
        if let Some(old) = old {
            for a in old.referenced_addrs() {
                self.decref(a);
            }
        }
    }

    /// Increments the reference count of `addr`. Returns the new count.
    pub fn incref(&mut self, addr: Addr) -> Option<u32> {
        let index = self.resolve(addr)?;
        let slot = self.slot_mut(index).filter(|s| s.allocated)?;
        slot.refcnt += 1;
        trace!("incref({}) => {}", addr, slot.refcnt);
        Some(slot.refcnt)
    }

    /// Decrements the reference count of `addr`, releasing the slot when it reaches zero.
    /// Returns the new count.
    pub fn decref(&mut self, addr: Addr) -> Option<u32> {
        let index = self.resolve(addr)?;
        let slot = self.slot_mut(index).filter(|s| s.allocated)?;
        if slot.refcnt == 0 {
            warn!("decref({}): reference count is already zero", addr);
            return Some(0);
        }
        slot.refcnt -= 1;
        let cnt = slot.refcnt;
        trace!("decref({}) => {}", addr, cnt);
        if cnt == 0 {
            self.release(index);
        }
        Some(cnt)
    }

    /// Frees slot `index` and drops the references its value held, cascading.
    fn release(&mut self, index: u32) {
        let mut pending = vec![index];
        while let Some(i) = pending.pop() {
            let Some(old) = self.free_slot(i) else {
                continue;
            };
            for a in old.referenced_addrs() {
                let Some(j) = self.resolve(a) else {
                    continue;
                };
                if let Some(slot) = self.slot_mut(j).filter(|s| s.allocated && s.refcnt > 0) {
                    slot.refcnt -= 1;
                    if slot.refcnt == 0 {
                        pending.push(j);
                    }
                }
            }
        }
    }

    /// Clears slot `index`, returning its value. Returns `None` if it was free.
    fn free_slot(&mut self, index: u32) -> Option<Rc<Value>> {
        let (b, _) = self.split(index);
        let name = self.name_of(index);
        let slot = self.slot_mut(index).filter(|s| s.allocated)?;
        let before = slot.hash(name);
        let reuse = slot.reuse;
        let value = slot.value.take();
        *slot = Slot::default();
        self.hash ^= before;
        self.used -= 1;
        if let Some(blk) = self.blocks.get_mut(b) {
            Rc::make_mut(blk).used -= 1;
        }
        if let Some(r) = name.reloc_id() {
            self.unmap_reloc(r);
        }
        debug!("release #obj({}) ({})", index, name);
        let value = value.unwrap_or_else(|| Rc::new(Value::Set(Default::default())));
        if let Some(journal) = &mut self.journal {
            journal.push(Freed {
                addr: name,
                value: (*value).clone(),
                reuse,
            });
        }
        Some(value)
    }

    /// Frees `addr` regardless of its reference count.
    ///
    /// References held by the value are dropped as by [`Store::decref`].
    /// Returns `false` if the slot was already free.
    pub fn deallocate(&mut self, addr: Addr) -> bool {
        let Some(index) = self.resolve(addr) else {
            return false;
        };
        if !self.slot(index).is_some_and(|s| s.allocated) {
            return false;
        }
        debug!("deallocate({})", addr);
        let Some(old) = self.free_slot(index) else {
            return false;
        };
        for a in old.referenced_addrs() {
            self.decref(a);
        }
        true
    }

    /// Records that relocated id `r` lives at slot `index` in this store.
    ///
    /// Slots losing or gaining a name are rehashed under their new name.
    pub fn map_reloc(&mut self, r: u32, index: u32) {
        let mut touched = vec![index];
        touched.extend(self.alloc.object_of(r));
        let before = touched.iter().fold(0, |h, &i| h ^ self.slot_hash(i));
        Rc::make_mut(&mut self.alloc).insert(r, index);
        let after = touched.iter().fold(0, |h, &i| h ^ self.slot_hash(i));
        self.hash ^= before ^ after;
    }

    fn unmap_reloc(&mut self, r: u32) {
        let touched = self.alloc.object_of(r);
        let before = touched.map(|i| self.slot_hash(i)).unwrap_or(0);
        Rc::make_mut(&mut self.alloc).remove(r);
        let after = touched.map(|i| self.slot_hash(i)).unwrap_or(0);
        self.hash ^= before ^ after;
    }

    /// Mark-and-sweep from `roots`. Returns the number of released slots.
    ///
    /// Every allocated slot not reachable from the roots is freed and left with a zero
    /// reference count; references from freed slots into live ones are dropped.
    pub fn gc(&mut self, roots: impl IntoIterator<Item = Addr>) -> usize {
        let marks = self.mark(roots);
        let garbage: Vec<u32> = marks
            .unmarked(self.capacity())
            .map(|i| i as u32)
            .filter(|&i| self.slot(i).is_some_and(|s| s.allocated))
            .collect();
        let mut freed = Vec::with_capacity(garbage.len());
        for &i in &garbage {
            if let Some(v) = self.free_slot(i) {
                freed.push(v);
            }
        }
        for v in freed {
            for a in v.referenced_addrs() {
                if let Some(j) = self.resolve_quiet(a) {
                    if marks.is_marked(j as usize) {
                        if let Some(slot) = self.slot_mut(j) {
                            slot.refcnt = slot.refcnt.saturating_sub(1);
                        }
                    }
                }
            }
        }
        debug!("gc: {} live, {} released", marks.count(), garbage.len());
        garbage.len()
    }

    /// Marks every allocated slot reachable from `roots`.
    pub fn mark(&self, roots: impl IntoIterator<Item = Addr>) -> MarkBits {
        let mut marks = MarkBits::with_capacity(self.capacity());
        let mut stack: Vec<u32> = roots.into_iter().filter_map(|a| self.resolve_quiet(a)).collect();
        while let Some(i) = stack.pop() {
            let Some(slot) = self.slot(i).filter(|s| s.allocated) else {
                continue;
            };
            if !marks.mark(i as usize) {
                continue;
            }
            if let Some(v) = slot.value() {
                stack.extend(v.referenced_addrs().into_iter().filter_map(|a| self.resolve_quiet(a)));
            }
        }
        marks
    }

    /// Whether the slot behind `addr` was marked by [`Store::mark`].
    pub fn is_marked(&self, marks: &MarkBits, addr: Addr) -> bool {
        self.resolve_quiet(addr).is_some_and(|i| marks.is_marked(i as usize))
    }

    fn resolve_quiet(&self, addr: Addr) -> Option<u32> {
        match addr.kind() {
            AddrKind::Object => addr.object_index(),
            AddrKind::Relocated => addr.reloc_id().and_then(|r| self.alloc.object_of(r)),
            _ => None,
        }
    }

    /// Allocated slots with their object address.
    pub fn iter(&self) -> impl Iterator<Item = (Addr, &Slot)> + '_ {
        let n = self.config.block_slots;
        self.blocks.iter().enumerate().flat_map(move |(b, blk)| {
            blk.slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.allocated)
                .map(move |(o, s)| (Addr::object((b * n + o) as u32), s))
        })
    }

    /// Allocated slots of block `b`.
    pub fn iter_block(&self, b: usize) -> impl Iterator<Item = (Addr, &Slot)> + '_ {
        let n = self.config.block_slots;
        self.blocks.get(b).into_iter().flat_map(move |blk| {
            blk.slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.allocated)
                .map(move |(o, s)| (Addr::object((b * n + o) as u32), s))
        })
    }

    /// The address under which `index` should be named outside this store:
    /// its relocated address if it has one.
    pub fn external_addr(&self, addr: Addr) -> Addr {
        match addr.object_index().and_then(|i| self.alloc.reloc_of(i)) {
            Some(r) => Addr::relocated(r),
            None => addr,
        }
    }

    /// Incrementally maintained hashcode.
    pub fn hashcode(&self) -> u64 {
        self.hash
    }

    /// Hashcode recomputed from every slot.
    pub fn compute_hashcode(&self) -> u64 {
        self.iter()
            .fold(0, |h, (addr, slot)| h ^ slot.compute_hash(self.external_addr(addr)))
    }

    /// Allocated slots as `(external name, reuse, value)`, sorted by name.
    fn named_slots(&self) -> Vec<(Addr, bool, Option<&Value>)> {
        let mut out: Vec<_> = self
            .iter()
            .map(|(addr, slot)| (self.external_addr(addr), slot.reuse, slot.value()))
            .collect();
        out.sort_by_key(|t| t.0);
        out
    }
}

impl PartialEq for Store {
    /// Slots are compared under their external names, not their indices.
    fn eq(&self, other: &Self) -> bool {
        if self.hash != other.hash || self.used != other.used {
            return false;
        }
        self.named_slots() == other.named_slots()
    }
}

impl Debug for Store {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Store(blocks = {}, used = {})", self.blocks.len(), self.used)?;
        for (addr, slot) in self.iter() {
            let name = self.external_addr(addr);
            write!(f, "  {}", addr)?;
            if name != addr {
                write!(f, " ({})", name)?;
            }
            write!(f, " rc={}", slot.refcnt)?;
            if slot.reuse {
                write!(f, " reuse")?;
            }
            match slot.value() {
                Some(v) => writeln!(f, " = {}", v)?,
                None => writeln!(f, " = <empty>")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::set::Set;

    use test_log::test;

    fn set(addrs: &[Addr]) -> Value {
        Value::Set(addrs.iter().copied().collect())
    }

    #[test]
    fn test_allocate_same_site_twice() {
        let mut store = Store::new();
        let a = store.allocate(AllocSite::object(7)).unwrap();
        assert!(!store.is_reused(a));
        let b = store.allocate(AllocSite::object(7)).unwrap();
        assert_eq!(a, b);
        assert!(store.is_reused(b));
        assert_eq!(store.len(), 1);
        assert_eq!(store.hashcode(), store.compute_hashcode());
    }

    #[test]
    fn test_allocate_distinct_sites() {
        let mut store = Store::new();
        let a = store.allocate(AllocSite::object(1)).unwrap();
        let b = store.allocate(AllocSite::object(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_blocks_stay_addressable() {
        let store = Store::with_config(StoreConfig {
            block_slots: 1 << 30,
            max_blocks: usize::MAX,
            probe_limit: 1,
        });
        assert!(store.block_addressable(0));
        assert!(store.block_addressable(1));
        assert!(!store.block_addressable(2));
        assert!(!store.block_addressable(usize::MAX));
    }

    #[test]
    fn test_allocate_fills_blocks() {
        let config = StoreConfig {
            block_slots: 4,
            max_blocks: 3,
            probe_limit: 4,
        };
        let mut store = Store::with_config(config);
        let mut addrs = Vec::new();
        for i in 0..100 {
            match store.allocate(AllocSite::object(i)) {
                Some(a) => addrs.push(a),
                None => break,
            }
        }
        assert!(addrs.len() <= 12);
        assert!(store.num_blocks() <= 3);
        assert!(store.allocate(AllocSite::object(1000)).is_none() || addrs.len() < 12);
        let mut unique = addrs.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), addrs.len());
    }

    #[test]
    fn test_attach_and_get() {
        let mut store = Store::new();
        let a = store.allocate(AllocSite::object(1)).unwrap();
        store.attach(a, set(&[Addr::POS])).unwrap();
        assert_eq!(store.get(a), Some(&set(&[Addr::POS])));
        assert_eq!(store.hashcode(), store.compute_hashcode());
        assert_eq!(store.attach(Addr::object(999), set(&[])), Err(StoreError::Unallocated(Addr::object(999))));
        assert_eq!(store.attach(Addr::POS, set(&[])), Err(StoreError::NotHeap(Addr::POS)));
    }

    #[test]
    fn test_attach_counts_references() {
        let mut store = Store::new();
        let a = store.allocate(AllocSite::object(1)).unwrap();
        let b = store.allocate(AllocSite::object(2)).unwrap();
        store.attach(b, set(&[])).unwrap();
        store.attach(a, set(&[b])).unwrap();
        assert_eq!(store.refcount(b), Some(1));
        store.attach(a, set(&[Addr::ZERO])).unwrap();
        // b dropped to zero and was released
        assert!(!store.is_allocated(b));
        assert_eq!(store.hashcode(), store.compute_hashcode());
    }

    #[test]
    fn test_decref_cascades() {
        let mut store = Store::new();
        let a = store.allocate(AllocSite::object(1)).unwrap();
        let b = store.allocate(AllocSite::object(2)).unwrap();
        let c = store.allocate(AllocSite::object(3)).unwrap();
        store.attach(c, set(&[Addr::POS])).unwrap();
        store.attach(b, set(&[c])).unwrap();
        store.attach(a, set(&[b])).unwrap();
        store.incref(a);
        assert_eq!(store.decref(a), Some(0));
        assert!(store.is_empty());
        assert_eq!(store.hashcode(), store.compute_hashcode());
    }

    #[test]
    fn test_fork_isolation() {
        let mut store = Store::new();
        let a = store.allocate(AllocSite::object(1)).unwrap();
        store.attach(a, set(&[Addr::POS])).unwrap();
        let hash = store.hashcode();

        let mut other = store.fork();
        assert!(other.shares_block(&store, 0));
        other.attach(a, set(&[Addr::NEG])).unwrap();
        assert!(!other.shares_block(&store, 0));

        assert_eq!(store.get(a), Some(&set(&[Addr::POS])));
        assert_eq!(store.hashcode(), hash);
        assert_ne!(other.hashcode(), hash);
        assert_eq!(other.hashcode(), other.compute_hashcode());
        assert_ne!(store, other);
    }

    #[test]
    fn test_update_is_cow() {
        let mut store = Store::new();
        let a = store.allocate(AllocSite::object(1)).unwrap();
        store.attach(a, set(&[Addr::ZERO])).unwrap();
        let snapshot = store.fork();
        store
            .update(a, |v| {
                if let Value::Set(s) = v {
                    s.push(Addr::POS);
                }
            })
            .unwrap();
        assert_eq!(snapshot.get(a), Some(&set(&[Addr::ZERO])));
        assert_eq!(store.get(a), Some(&set(&[Addr::ZERO, Addr::POS])));
        assert_eq!(store.hashcode(), store.compute_hashcode());
    }

    #[test]
    fn test_update_adjusts_refcounts() {
        let mut store = Store::new();
        let a = store.allocate(AllocSite::object(1)).unwrap();
        let b = store.allocate(AllocSite::object(2)).unwrap();
        store.attach(b, set(&[])).unwrap();
        store.attach(a, set(&[])).unwrap();
        store
            .update(a, |v| {
                if let Value::Set(s) = v {
                    s.push(b);
                }
            })
            .unwrap();
        assert_eq!(store.refcount(b), Some(1));
    }

    #[test]
    fn test_deallocate() {
        let mut store = Store::new();
        let a = store.allocate(AllocSite::object(1)).unwrap();
        let b = store.allocate(AllocSite::object(2)).unwrap();
        store.attach(b, set(&[])).unwrap();
        store.attach(a, set(&[b])).unwrap();
        store.incref(a);
        assert!(store.deallocate(a));
        assert!(!store.deallocate(a));
        assert!(!store.is_allocated(a));
        assert!(!store.is_allocated(b));
        assert_eq!(store.hashcode(), store.compute_hashcode());
    }

    #[test]
    fn test_gc_collects_cycles() {
        let mut store = Store::new();
        let root = store.allocate(AllocSite::object(1)).unwrap();
        let a = store.allocate(AllocSite::object(2)).unwrap();
        let b = store.allocate(AllocSite::object(3)).unwrap();
        store.attach(root, set(&[Addr::POS])).unwrap();
        store.attach(a, set(&[])).unwrap();
        store.attach(b, set(&[a])).unwrap();
        store.update(a, |v| {
            if let Value::Set(s) = v {
                s.push(b);
            }
        })
        .unwrap();
        store.incref(root);
        assert_eq!(store.refcount(a), Some(1));
        assert_eq!(store.refcount(b), Some(1));

        let released = store.gc([root]);
        assert_eq!(released, 2);
        assert!(store.is_allocated(root));
        assert!(!store.is_allocated(a));
        assert!(!store.is_allocated(b));
        assert_eq!(store.refcount(root), Some(1));
        assert_eq!(store.hashcode(), store.compute_hashcode());
    }

    #[test]
    fn test_gc_drops_references_from_garbage() {
        let mut store = Store::new();
        let live = store.allocate(AllocSite::object(1)).unwrap();
        let dead = store.allocate(AllocSite::object(2)).unwrap();
        store.attach(live, set(&[])).unwrap();
        store.attach(dead, set(&[live])).unwrap();
        store.incref(live);
        assert_eq!(store.refcount(live), Some(2));
        store.gc([live]);
        assert_eq!(store.refcount(live), Some(1));
        assert!(!store.is_allocated(dead));
    }

    #[test]
    fn test_relocated_access() {
        let mut store = Store::new();
        let o = store.allocate(AllocSite::object(5)).unwrap();
        store.map_reloc(3, o.object_index().unwrap());
        let r = Addr::relocated(3);
        store.attach(r, set(&[Addr::TRUE])).unwrap();
        assert_eq!(store.get(o), Some(&set(&[Addr::TRUE])));
        assert_eq!(store.external_addr(o), r);
        assert_eq!(store.hashcode(), store.compute_hashcode());
        assert!(store.deallocate(r));
        assert_eq!(store.resolve(r), None);
        assert_eq!(store.hashcode(), store.compute_hashcode());
    }

    #[test]
    fn test_allocate_at() {
        let mut store = Store::new();
        store.allocate_at(Addr::object(130), None).unwrap();
        assert!(store.is_allocated(Addr::object(130)));
        assert_eq!(store.num_blocks(), 3);
        assert_eq!(store.allocate_at(Addr::object(130), None), Err(StoreError::AlreadyAllocated(Addr::object(130))));
        assert_eq!(store.hashcode(), store.compute_hashcode());
    }

    #[test]
    fn test_journal_records_cascade() {
        let mut store = Store::new();
        let a = store.allocate(AllocSite::object(1)).unwrap();
        let b = store.allocate(AllocSite::object(2)).unwrap();
        store.map_reloc(9, b.object_index().unwrap());
        store.attach(b, set(&[Addr::POS])).unwrap();
        store.attach(a, set(&[b])).unwrap();
        store.incref(a);
        store.start_journal();
        store.decref(a);
        let freed = store.take_journal();
        let names: Vec<_> = freed.iter().map(|f| f.addr).collect();
        assert_eq!(names, vec![a, Addr::relocated(9)]);
        assert_eq!(freed[1].value, set(&[Addr::POS]));
        assert!(store.take_journal().is_empty());
    }

    #[test]
    fn test_replace_value_defers_release() {
        let mut store = Store::new();
        let a = store.allocate(AllocSite::object(1)).unwrap();
        let b = store.allocate(AllocSite::object(2)).unwrap();
        store.attach(b, set(&[])).unwrap();
        store.attach(a, set(&[b])).unwrap();
        let released = store.replace_value(a, set(&[Addr::ZERO])).unwrap();
        assert_eq!(released, vec![b]);
        assert!(store.is_allocated(b));
        store.decref(b);
        assert!(!store.is_allocated(b));
        assert_eq!(store.hashcode(), store.compute_hashcode());
    }

    #[test]
    fn test_equality_ignores_refcounts() {
        let mut a = Store::new();
        let x = a.allocate(AllocSite::object(1)).unwrap();
        a.attach(x, Value::Set(Set::empty())).unwrap();
        let mut b = a.fork();
        b.incref(x);
        assert_eq!(a, b);
    }
}
