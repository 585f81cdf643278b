//! Abstract machine state at one program point.
//!
//! A [`Frame`] owns a register file of [`Set`]s, a [`Store`] and a [`StaticTable`]:
//!
//! ```text
//!   registers:  r0 (result) | r1 (exception) | r2 .. r(n+1) (general)
//!   store:      #obj / #reloc slots, shared block-wise with sibling frames
//!   statics:    #static(i), shared until first write
//! ```
//!
//! Registers and static fields share one key space in diff records: register `i` has
//! key `i`, static field `#static(i)` has its raw address as key.
//!
//! Every mutating operation takes an optional [`Recorder`]. When one is given, the
//! operation appends a forward record and its inverse, so a block of operations can be
//! frozen into a pair of [`Diff`]s. Slots released as a side effect (a register
//! dropped the last reference to an object) are recorded as explicit deallocations.

use std::fmt::{Debug, Display, Formatter};

use log::{debug, trace, warn};

use crate::address::{Addr, AddrKind};
use crate::class::ClassTable;
use crate::diff::{Diff, DiffBuffer, DiffKind, Key, Record};
use crate::error::{CeskError, DiffError, Result, StoreError};
use crate::object::{FieldRef, Object};
use crate::reloc::RelocTable;
use crate::set::Set;
use crate::statics::StaticTable;
use crate::store::{AllocSite, Store};
use crate::tag::Tag;
use crate::utils::{hash_u32, mix2};
use crate::value::Value;

/// Keeps the static table's contribution apart from the register with the same index.
const STATICS_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

/// Register receiving the result of the last invocation.
pub const RESULT: usize = 0;
/// Register receiving the thrown exception.
pub const EXCEPTION: usize = 1;
/// Number of reserved registers.
pub const RESERVED: usize = 2;

/// Index of general register `i`.
pub const fn general(i: usize) -> usize {
    i + RESERVED
}

/// Pair of buffers collecting the forward and inverse records of a run of operations.
#[derive(Debug, Clone)]
pub struct Recorder {
    pub forward: DiffBuffer,
    /// Reversed: the record pushed last is undone first.
    pub inverse: DiffBuffer,
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl Recorder {
    pub fn new() -> Self {
        Self {
            forward: DiffBuffer::new(),
            inverse: DiffBuffer::reversed(),
        }
    }

    pub fn record(&mut self, forward: Record, inverse: Record) {
        self.forward.push(forward);
        self.inverse.push(inverse);
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty() && self.inverse.is_empty()
    }

    /// Current lengths, for [`Recorder::rollback`].
    pub fn mark(&self) -> (usize, usize) {
        (self.forward.len(), self.inverse.len())
    }

    /// Forgets everything recorded after `mark`.
    pub fn rollback(&mut self, mark: (usize, usize)) {
        self.forward.truncate(mark.0);
        self.inverse.truncate(mark.1);
    }

    /// Freezes both buffers into `(forward, inverse)`.
    pub fn finish(self) -> std::result::Result<(Diff, Diff), DiffError> {
        Ok((self.forward.freeze()?, self.inverse.freeze()?))
    }
}

fn record(rec: &mut Option<&mut Recorder>, forward: Record, inverse: Record) {
    if let Some(r) = rec {
        r.record(forward, inverse);
    }
}

enum FieldTarget {
    Slot(Addr),
    Builtin,
}

#[derive(Clone)]
pub struct Frame {
    regs: Vec<Set>,
    store: Store,
    statics: StaticTable,
}

impl Frame {
    /// Empty frame with `nregs` general registers, plus the reserved ones.
    pub fn new(nregs: usize) -> Self {
        Self::with_store(nregs, Store::new(), StaticTable::default())
    }

    pub fn with_statics(nregs: usize, statics: StaticTable) -> Self {
        Self::with_store(nregs, Store::new(), statics)
    }

    pub fn with_store(nregs: usize, store: Store, statics: StaticTable) -> Self {
        debug!("new frame with {} registers", nregs);
        Self {
            regs: vec![Set::empty(); nregs + RESERVED],
            store,
            statics,
        }
    }

    /// A frame sharing registers, store and statics with `self`.
    pub fn fork(&self) -> Self {
        Self {
            regs: self.regs.iter().map(Set::fork).collect(),
            store: self.store.fork(),
            statics: self.statics.clone(),
        }
    }

    /// Number of registers, reserved ones included.
    pub fn num_regs(&self) -> usize {
        self.regs.len()
    }

    pub fn register(&self, reg: usize) -> Option<&Set> {
        self.regs.get(reg)
    }

    pub fn registers(&self) -> &[Set] {
        &self.regs
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn statics(&self) -> &StaticTable {
        &self.statics
    }

    pub fn statics_mut(&mut self) -> &mut StaticTable {
        &mut self.statics
    }

    /// Value under a register or static field key, without initializing statics.
    pub fn read_register(&self, key: u32) -> Option<Set> {
        let addr = Addr::from_raw(key);
        if addr.is_static() {
            self.statics.peek(addr)
        } else {
            self.regs.get(key as usize).map(Set::fork)
        }
    }

    /// Name under which `addr` appears in diff records.
    fn external(&self, addr: Addr) -> Addr {
        if addr.is_object() {
            self.store.external_addr(addr)
        } else {
            addr
        }
    }

    /// Installs `value` under `key` and returns the old value. References of the new
    /// value are counted; those of the old value are not dropped yet.
    fn swap_key(&mut self, key: u32, value: Set) -> Option<Set> {
        let addr = Addr::from_raw(key);
        if addr.is_static() {
            self.statics.peek(addr)?;
            for a in value.heap_addrs() {
                self.store.incref(a);
            }
            return self.statics.put(addr, value);
        }
        let i = key as usize;
        if i >= self.regs.len() {
            warn!("register {} out of range ({} registers)", key, self.regs.len());
            return None;
        }
        for a in value.heap_addrs() {
            self.store.incref(a);
        }
        Some(std::mem::replace(&mut self.regs[i], value))
    }

    fn write_key(&mut self, key: u32, value: Set) -> Option<Set> {
        let old = self.swap_key(key, value)?;
        for a in old.heap_addrs() {
            self.store.decref(a);
        }
        Some(old)
    }

    fn begin(&mut self, rec: &Option<&mut Recorder>) {
        if rec.is_some() {
            self.store.start_journal();
        }
    }

    /// Records the slots released since [`Frame::begin`].
    fn flush_releases(&mut self, rec: &mut Option<&mut Recorder>) {
        let Some(r) = rec else {
            return;
        };
        for freed in self.store.take_journal() {
            trace!("released {} during operation", freed.addr);
            if freed.reuse {
                r.inverse.push(Record::Reuse {
                    addr: freed.addr,
                    flag: true,
                });
            }
            r.record(
                Record::Deallocate { addr: freed.addr },
                Record::Allocate {
                    addr: freed.addr,
                    value: freed.value,
                },
            );
        }
    }

    fn assign_key(&mut self, key: u32, value: Set, rec: &mut Option<&mut Recorder>) -> Result<()> {
        self.begin(rec);
        let old = match self.write_key(key, value.fork()) {
            Some(old) => old,
            None if Addr::from_raw(key).is_static() => return Err(CeskError::BadStatic(Addr::from_raw(key))),
            None => return Err(CeskError::BadRegister(key)),
        };
        debug!("{} <- {}", Key::Register(key), value);
        record(rec, Record::Register { reg: key, value }, Record::Register { reg: key, value: old });
        self.flush_releases(rec);
        Ok(())
    }

    /// Replaces the content of register `reg`.
    pub fn register_assign(&mut self, reg: usize, value: Set, mut rec: Option<&mut Recorder>) -> Result<()> {
        self.assign_key(reg as u32, value, &mut rec)
    }

    pub fn register_move(&mut self, dst: usize, src: usize, mut rec: Option<&mut Recorder>) -> Result<()> {
        let value = self.regs.get(src).ok_or(CeskError::BadRegister(src as u32))?.fork();
        self.assign_key(dst as u32, value, &mut rec)
    }

    pub fn register_clear(&mut self, reg: usize, mut rec: Option<&mut Recorder>) -> Result<()> {
        self.assign_key(reg as u32, Set::empty(), &mut rec)
    }

    /// Loads the constant `value` into `reg`.
    pub fn register_load_const(&mut self, reg: usize, value: Addr, mut rec: Option<&mut Recorder>) -> Result<()> {
        if !value.is_constant() {
            warn!("load_const: {} is not a constant", value);
        }
        self.assign_key(reg as u32, Set::singleton(value), &mut rec)
    }

    /// Loads what the store holds at `addr`: the set of a field slot, or the address
    /// itself for an object.
    pub fn register_load(&mut self, reg: usize, addr: Addr, mut rec: Option<&mut Recorder>) -> Result<()> {
        let value = match self.store.get(addr) {
            Some(Value::Set(s)) => s.fork(),
            Some(Value::Object(_)) => Set::singleton(addr),
            None => return Err(StoreError::Unallocated(addr).into()),
        };
        self.assign_key(reg as u32, value, &mut rec)
    }

    /// Adds `addr` to the content of `reg`.
    pub fn register_push(&mut self, reg: usize, addr: Addr, mut rec: Option<&mut Recorder>) -> Result<()> {
        let mut value = self.regs.get(reg).ok_or(CeskError::BadRegister(reg as u32))?.fork();
        if value.push(addr) {
            self.assign_key(reg as u32, value, &mut rec)?;
        }
        Ok(())
    }

    /// Adds a provenance tag to the content of `reg`.
    pub fn tag_register(&mut self, reg: usize, tag: Tag, mut rec: Option<&mut Recorder>) -> Result<()> {
        let mut value = self.regs.get(reg).ok_or(CeskError::BadRegister(reg as u32))?.fork();
        if value.add_tag(tag) {
            self.assign_key(reg as u32, value, &mut rec)?;
        }
        Ok(())
    }

    /// Loads static field `field` into `reg`.
    pub fn static_get(&mut self, reg: usize, field: Addr, mut rec: Option<&mut Recorder>) -> Result<()> {
        let value = self.statics.get(field).map(Set::fork).ok_or(CeskError::BadStatic(field))?;
        self.assign_key(reg as u32, value, &mut rec)
    }

    /// Stores register `src` into static field `field`.
    pub fn static_put(&mut self, field: Addr, src: usize, mut rec: Option<&mut Recorder>) -> Result<()> {
        if !field.is_static() {
            return Err(CeskError::BadStatic(field));
        }
        let value = self.regs.get(src).ok_or(CeskError::BadRegister(src as u32))?.fork();
        self.assign_key(field.raw(), value, &mut rec)
    }

    /// Allocates a new object of `classpath` at instruction `inst`, one slot per user
    /// field, and returns its relocated address.
    ///
    /// Fields start as `{0}`, the abstraction of null and of numeric zero. A second
    /// visit to the same instruction yields the same object with its reuse flag set.
    pub fn store_new_object(
        &mut self,
        classes: &ClassTable,
        reloc: &mut RelocTable,
        inst: u32,
        classpath: &str,
        mut rec: Option<&mut Recorder>,
    ) -> Result<Addr> {
        let r = reloc.allocate(AllocSite::object(inst));
        if r.is_null() {
            return Err(StoreError::RelocExhausted(reloc.len()).into());
        }
        if self.store.is_allocated(r) {
            let old = self.store.is_reused(r);
            self.store.set_reuse(r, true)?;
            debug!("new {} at {}: reusing", classpath, r);
            record(
                &mut rec,
                Record::Reuse { addr: r, flag: true },
                Record::Reuse { addr: r, flag: old },
            );
            return Ok(r);
        }

        let mut fields = Vec::new();
        let object = Object::from_classpath(classes, classpath, |class, field| {
            let name = format!("{}.{}", class, field);
            let f = reloc.allocate(AllocSite::field(inst, r, &name));
            fields.push(f);
            f
        })
        .ok_or_else(|| CeskError::UnknownClass(classpath.to_string()))?;
        if fields.iter().any(|f| f.is_null()) {
            return Err(StoreError::RelocExhausted(reloc.len()).into());
        }

        let init = Value::Set(Set::singleton(Addr::ZERO));
        for f in fields {
            if self.store.is_allocated(f) {
                continue;
            }
            reloc.install(&mut self.store, f, init.clone())?;
            record(
                &mut rec,
                Record::Allocate {
                    addr: f,
                    value: init.clone(),
                },
                Record::Deallocate { addr: f },
            );
        }
        let value = Value::Object(object);
        reloc.install(&mut self.store, r, value.clone())?;
        debug!("new {} at {}", classpath, r);
        record(&mut rec, Record::Allocate { addr: r, value }, Record::Deallocate { addr: r });
        Ok(r)
    }

    /// Loads `field` of every object in register `obj` into `dst`.
    pub fn get_field(
        &mut self,
        dst: usize,
        obj: usize,
        classpath: &str,
        field: &str,
        mut rec: Option<&mut Recorder>,
    ) -> Result<()> {
        let targets: Vec<Addr> = self
            .regs
            .get(obj)
            .ok_or(CeskError::BadRegister(obj as u32))?
            .heap_addrs()
            .collect();
        let mut out = Set::empty();
        for a in targets {
            match self.store.get(a) {
                Some(Value::Object(o)) => match o.field(classpath, field) {
                    Some(FieldRef::Addr(fa)) => match self.store.get(fa) {
                        Some(Value::Set(s)) => {
                            out.merge(s);
                        }
                        Some(v) => warn!("get_field: {} holds {}, not a set", fa, v),
                        None => warn!("get_field: field slot {} is not allocated", fa),
                    },
                    Some(FieldRef::Builtin(inst)) => {
                        if let Some(s) = inst.get_field(field) {
                            out.merge(&s);
                        }
                    }
                    None => warn!("get_field: {} has no field {}.{}", a, classpath, field),
                },
                Some(v) => warn!("get_field: {} holds {}, not an object", a, v),
                None => warn!("get_field: {} is not allocated", a),
            }
        }
        self.assign_key(dst as u32, out, &mut rec)
    }

    /// Stores register `src` into `field` of every object in register `obj`.
    ///
    /// The update is weak (the old value is kept alongside the new one) when the
    /// register may point to several objects or the object was allocated more than once.
    pub fn put_field(
        &mut self,
        obj: usize,
        classpath: &str,
        field: &str,
        src: usize,
        mut rec: Option<&mut Recorder>,
    ) -> Result<()> {
        let value = self.regs.get(src).ok_or(CeskError::BadRegister(src as u32))?.fork();
        let targets: Vec<Addr> = self
            .regs
            .get(obj)
            .ok_or(CeskError::BadRegister(obj as u32))?
            .heap_addrs()
            .collect();
        if targets.is_empty() {
            debug!("put_field: r{} holds no object", obj);
            return Ok(());
        }
        let weak = targets.len() > 1 || targets.iter().any(|&a| self.store.is_reused(a));
        self.begin(&rec);
        for a in targets {
            let target = match self.store.get(a) {
                Some(Value::Object(o)) => match o.field(classpath, field) {
                    Some(FieldRef::Addr(fa)) => FieldTarget::Slot(fa),
                    Some(FieldRef::Builtin(_)) => FieldTarget::Builtin,
                    None => {
                        warn!("put_field: {} has no field {}.{}", a, classpath, field);
                        continue;
                    }
                },
                Some(v) => {
                    warn!("put_field: {} holds {}, not an object", a, v);
                    continue;
                }
                None => {
                    warn!("put_field: {} is not allocated", a);
                    continue;
                }
            };
            match target {
                FieldTarget::Slot(fa) => {
                    let old = self.store.get(fa).cloned().ok_or(StoreError::Unallocated(fa))?;
                    let new = if weak || self.store.is_reused(fa) {
                        let mut s = old.as_set().map(Set::fork).unwrap_or_default();
                        s.merge(&value);
                        s
                    } else {
                        value.fork()
                    };
                    let new = Value::Set(new);
                    if new == old {
                        continue;
                    }
                    debug!("put_field: {} <- {}{}", fa, new, if weak { " (weak)" } else { "" });
                    self.store.attach(fa, new.clone())?;
                    let key = self.external(fa);
                    record(
                        &mut rec,
                        Record::Store { addr: key, value: new },
                        Record::Store { addr: key, value: old },
                    );
                }
                FieldTarget::Builtin => {
                    let old = self.store.get(a).cloned().ok_or(StoreError::Unallocated(a))?;
                    let done = self.store.update(a, |v| {
                        v.as_object_mut()
                            .is_some_and(|o| o.put_builtin_field(classpath, field, &value, weak))
                    })?;
                    if !done {
                        warn!("put_field: built-in {}.{} rejected the write", classpath, field);
                        continue;
                    }
                    let new = self.store.get(a).cloned().ok_or(StoreError::Unallocated(a))?;
                    let key = self.external(a);
                    record(
                        &mut rec,
                        Record::Store { addr: key, value: new },
                        Record::Store { addr: key, value: old },
                    );
                }
            }
        }
        self.flush_releases(&mut rec);
        Ok(())
    }

    /// Frame for a callee with `nregs` general registers.
    ///
    /// The callee shares the caller's store and statics. Arguments go into the last
    /// general registers. They are moved in as they are: the shared store already
    /// counts the caller's references to them.
    pub fn make_invoke_frame(&self, nregs: usize, args: Vec<Set>) -> Result<Frame> {
        if args.len() > nregs {
            return Err(CeskError::TooManyArguments {
                args: args.len(),
                nregs,
            });
        }
        let mut frame = Frame::with_store(nregs, self.store.fork(), self.statics.clone());
        let first = general(nregs - args.len());
        for (i, arg) in args.into_iter().enumerate() {
            frame.regs[first + i] = arg;
        }
        debug!("invoke frame: {} registers, arguments from r{}", frame.regs.len(), first);
        Ok(frame)
    }

    /// Addresses reachable directly from registers and statics.
    pub fn roots(&self) -> Vec<Addr> {
        let regs = self.regs.iter().flat_map(|s| s.heap_addrs());
        let statics = self.statics.iter().flat_map(|(_, s)| s.heap_addrs());
        regs.chain(statics).collect()
    }

    /// Releases every slot unreachable from registers and statics.
    pub fn gc(&mut self, mut rec: Option<&mut Recorder>) -> usize {
        self.begin(&rec);
        let roots = self.roots();
        let released = self.store.gc(roots);
        self.flush_releases(&mut rec);
        released
    }

    pub fn hashcode(&self) -> u64 {
        let regs = self
            .regs
            .iter()
            .enumerate()
            .fold(0, |h, (i, s)| h ^ mix2(hash_u32(i as u32), s.hashcode()));
        regs ^ self.store.hashcode() ^ mix2(STATICS_SEED, self.statics.hashcode())
    }

    pub fn compute_hashcode(&self) -> u64 {
        let regs = self
            .regs
            .iter()
            .enumerate()
            .fold(0, |h, (i, s)| h ^ mix2(hash_u32(i as u32), s.compute_hashcode()));
        regs ^ self.store.compute_hashcode() ^ mix2(STATICS_SEED, self.statics.compute_hashcode())
    }

    /// Applies `diff`, concretizing relocated allocations through `reloc`.
    ///
    /// Either the whole diff applies or the frame is left untouched.
    pub fn apply(&mut self, diff: &Diff, reloc: &RelocTable) -> std::result::Result<(), DiffError> {
        let mut next = self.fork();
        next.apply_records(diff, reloc)?;
        debug!("applied {} records", diff.len());
        *self = next;
        Ok(())
    }

    fn apply_records(&mut self, diff: &Diff, reloc: &RelocTable) -> std::result::Result<(), DiffError> {
        // Slots first, values second: allocated values may refer to each other.
        let mut pending = Vec::new();
        for rec in diff.segment(DiffKind::Allocate) {
            let Record::Allocate { addr, value } = rec else {
                continue;
            };
            match addr.kind() {
                AddrKind::Relocated | AddrKind::Object if self.store.is_allocated(*addr) => {
                    trace!("apply: {} exists, joining", addr);
                    let mut joined = self.store.get(*addr).cloned().unwrap_or_else(|| value.clone());
                    joined.join(value);
                    self.store.set_reuse(*addr, true)?;
                    pending.push((*addr, joined));
                }
                AddrKind::Relocated => {
                    if reloc.site(*addr).is_none() {
                        return Err(DiffError::UnknownSite(*addr));
                    }
                    reloc.reserve(&mut self.store, *addr)?;
                    pending.push((*addr, value.clone()));
                }
                AddrKind::Object => {
                    self.store.allocate_at(*addr, None)?;
                    pending.push((*addr, value.clone()));
                }
                _ => warn!("apply: cannot allocate {}", addr),
            }
        }
        // Old references are dropped once every write is done.
        let mut released = Vec::new();
        for (addr, value) in pending {
            released.extend(self.store.replace_value(addr, value)?);
        }
        for rec in diff.segment(DiffKind::Reuse) {
            if let Record::Reuse { addr, flag } = rec {
                self.store.set_reuse(*addr, *flag)?;
            }
        }
        for rec in diff.segment(DiffKind::Register) {
            if let Record::Register { reg, value } = rec {
                let old = self.swap_key(*reg, value.fork()).ok_or(DiffError::BadRegister(*reg))?;
                released.extend(old.heap_addrs());
            }
        }
        for rec in diff.segment(DiffKind::Store) {
            if let Record::Store { addr, value } = rec {
                released.extend(self.store.replace_value(*addr, value.clone())?);
            }
        }
        for a in released {
            self.store.decref(a);
        }
        // A slot this frame can still reach outlives the record.
        let deallocs = diff.segment(DiffKind::Deallocate);
        if deallocs.is_empty() {
            return Ok(());
        }
        let live = self.store.mark(self.roots());
        for rec in deallocs {
            let Record::Deallocate { addr } = rec else {
                continue;
            };
            if self.store.is_marked(&live, *addr) {
                debug!("apply: {} is still reachable, keeping it", addr);
            } else if !self.store.deallocate(*addr) {
                trace!("apply: {} already free", addr);
            }
        }
        Ok(())
    }

    /// The diff that, applied to `self`, yields the join of `self` and `other`.
    ///
    /// Heap slots are matched by external name. Slots only `other` has are allocated;
    /// nothing is ever deallocated.
    pub fn join_diff(&self, other: &Frame) -> std::result::Result<Diff, DiffError> {
        let mut buf = DiffBuffer::new();
        if self.regs.len() != other.regs.len() {
            warn!(
                "join: register files differ in size ({} vs {})",
                self.regs.len(),
                other.regs.len()
            );
        }
        for (i, (mine, theirs)) in self.regs.iter().zip(&other.regs).enumerate() {
            if mine == theirs {
                continue;
            }
            let mut joined = mine.fork();
            if joined.merge(theirs) {
                buf.push(Record::Register {
                    reg: i as u32,
                    value: joined,
                });
            }
        }
        for (addr, theirs) in other.statics.iter() {
            let Some(mut joined) = self.statics.peek(addr) else {
                continue;
            };
            if joined.merge(theirs) {
                buf.push(Record::Register {
                    reg: addr.raw(),
                    value: joined,
                });
            }
        }

        let same_names = self.store.shares_alloc_table(&other.store);
        for b in 0..other.store.num_blocks() {
            if same_names && self.store.shares_block(&other.store, b) {
                continue;
            }
            for (addr, slot) in other.store.iter_block(b) {
                let Some(value) = slot.value() else {
                    continue;
                };
                let name = other.store.external_addr(addr);
                if self.store.is_allocated(name) {
                    if name.is_object() && self.store.external_addr(name) != name {
                        warn!("join: {} names different objects in the two frames", name);
                        continue;
                    }
                    let Some(mine) = self.store.get(name) else {
                        continue;
                    };
                    let mut joined = mine.clone();
                    if joined.join(value) {
                        buf.push(Record::Store { addr: name, value: joined });
                    }
                    if slot.reuse() && !self.store.is_reused(name) {
                        buf.push(Record::Reuse { addr: name, flag: true });
                    }
                } else {
                    buf.push(Record::Allocate {
                        addr: name,
                        value: value.clone(),
                    });
                    if slot.reuse() {
                        buf.push(Record::Reuse { addr: name, flag: true });
                    }
                }
            }
        }
        buf.freeze()
    }
}

impl PartialEq for Frame {
    fn eq(&self, other: &Self) -> bool {
        self.regs == other.regs && self.statics == other.statics && self.store == other.store
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for (i, s) in self.regs.iter().enumerate() {
            match i {
                RESULT => writeln!(f, "  result = {}", s)?,
                EXCEPTION => writeln!(f, "  exception = {}", s)?,
                _ => writeln!(f, "  r{} = {}", i - RESERVED, s)?,
            }
        }
        for (addr, s) in self.statics.iter() {
            writeln!(f, "  {} = {}", addr, s)?;
        }
        for (addr, slot) in self.store.iter() {
            if let Some(v) = slot.value() {
                writeln!(f, "  {} = {}", self.store.external_addr(addr), v)?;
            }
        }
        Ok(())
    }
}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Frame(hash = {:#018x})", self.hashcode())?;
        write!(f, "{}", self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::rc::Rc;

    use crate::class::ClassDef;

    use test_log::test;

    fn classes() -> ClassTable {
        let mut classes = ClassTable::new();
        classes.define(
            ClassDef::new("LNode;")
                .field("next")
                .field("val")
                .static_field("count", Addr::ZERO),
        );
        classes
    }

    fn frame(classes: &ClassTable) -> Frame {
        Frame::with_statics(3, StaticTable::new(classes.static_defaults()))
    }

    fn consistent(f: &Frame) {
        assert_eq!(f.hashcode(), f.compute_hashcode());
        assert_eq!(f.store().hashcode(), f.store().compute_hashcode());
    }

    #[test]
    fn test_load_const() {
        let mut f = Frame::new(3);
        assert_eq!(f.num_regs(), 5);
        f.register_load_const(general(0), Addr::POS, None).unwrap();
        let r = f.register(general(0)).unwrap();
        assert_eq!(r.len(), 1);
        assert!(r.contains(Addr::POS));
        consistent(&f);
    }

    #[test]
    fn test_bad_register() {
        let mut f = Frame::new(1);
        assert!(matches!(
            f.register_load_const(general(5), Addr::POS, None),
            Err(CeskError::BadRegister(_))
        ));
        assert!(matches!(f.register_move(general(0), 99, None), Err(CeskError::BadRegister(99))));
    }

    #[test]
    fn test_fork_isolation() {
        let classes = classes();
        let mut reloc = RelocTable::new();
        let mut f = frame(&classes);
        let o = f.store_new_object(&classes, &mut reloc, 1, "LNode;", None).unwrap();
        f.register_assign(general(0), Set::singleton(o), None).unwrap();
        let hash = f.hashcode();
        let snapshot = f.fork();

        let mut g = f.fork();
        g.register_load_const(general(1), Addr::NEG, None).unwrap();
        g.register_load_const(general(2), Addr::POS, None).unwrap();
        g.put_field(general(0), "LNode;", "val", general(2), None).unwrap();

        assert_eq!(f.hashcode(), hash);
        assert_eq!(f, snapshot);
        assert_ne!(g, f);
        consistent(&f);
        consistent(&g);
    }

    #[test]
    fn test_new_object_twice_reuses() {
        let classes = classes();
        let mut reloc = RelocTable::new();
        let mut f = frame(&classes);
        let a = f.store_new_object(&classes, &mut reloc, 7, "LNode;", None).unwrap();
        assert!(!f.store().is_reused(a));
        let b = f.store_new_object(&classes, &mut reloc, 7, "LNode;", None).unwrap();
        assert_eq!(a, b);
        assert!(f.store().is_reused(a));
        // object + two field slots
        assert_eq!(f.store().len(), 3);
        consistent(&f);
    }

    #[test]
    fn test_unknown_class() {
        let classes = classes();
        let mut reloc = RelocTable::new();
        let mut f = frame(&classes);
        assert!(matches!(
            f.store_new_object(&classes, &mut reloc, 1, "LMissing;", None),
            Err(CeskError::UnknownClass(_))
        ));
    }

    #[test]
    fn test_fields_and_weak_update() {
        let classes = classes();
        let mut reloc = RelocTable::new();
        let mut f = frame(&classes);
        let o = f.store_new_object(&classes, &mut reloc, 1, "LNode;", None).unwrap();
        f.register_assign(general(0), Set::singleton(o), None).unwrap();

        f.get_field(general(1), general(0), "LNode;", "val", None).unwrap();
        assert_eq!(f.register(general(1)), Some(&Set::singleton(Addr::ZERO)));

        // strong update
        f.register_load_const(general(2), Addr::POS, None).unwrap();
        f.put_field(general(0), "LNode;", "val", general(2), None).unwrap();
        f.get_field(general(1), general(0), "LNode;", "val", None).unwrap();
        assert_eq!(f.register(general(1)), Some(&Set::singleton(Addr::POS)));

        // the same site again: weak update
        f.store_new_object(&classes, &mut reloc, 1, "LNode;", None).unwrap();
        f.register_load_const(general(2), Addr::NEG, None).unwrap();
        f.put_field(general(0), "LNode;", "val", general(2), None).unwrap();
        f.get_field(general(1), general(0), "LNode;", "val", None).unwrap();
        let v = f.register(general(1)).unwrap();
        assert!(v.contains(Addr::POS));
        assert!(v.contains(Addr::NEG));
        consistent(&f);
    }

    #[test]
    fn test_statics() {
        let classes = classes();
        let mut f = frame(&classes);
        let count = classes.static_field("LNode;", "count").unwrap();
        f.static_get(general(0), count, None).unwrap();
        assert_eq!(f.register(general(0)), Some(&Set::singleton(Addr::ZERO)));
        let before = f.hashcode();
        f.register_load_const(general(1), Addr::POS, None).unwrap();
        f.static_put(count, general(1), None).unwrap();
        assert_eq!(f.read_register(count.raw()), Some(Set::singleton(Addr::POS)));
        assert_ne!(f.hashcode(), before);
        consistent(&f);
        assert!(matches!(f.static_put(Addr::POS, general(1), None), Err(CeskError::BadStatic(_))));
    }

    #[test]
    fn test_hash_separates_registers_from_statics() {
        let classes = classes();
        let count = classes.static_field("LNode;", "count").unwrap();

        let mut a = frame(&classes);
        a.register_load_const(general(0), Addr::NEG, None).unwrap();
        a.register_load_const(RESULT, Addr::NEG, None).unwrap();

        // Same sets, swapped between the result register and the static field.
        let mut b = frame(&classes);
        b.register_load_const(general(0), Addr::NEG, None).unwrap();
        b.static_put(count, general(0), None).unwrap();
        b.register_load_const(RESULT, Addr::ZERO, None).unwrap();

        assert_ne!(a, b);
        assert_ne!(a.hashcode(), b.hashcode());
        consistent(&a);
        consistent(&b);
    }

    #[test]
    fn test_register_release_is_recorded() {
        let classes = classes();
        let mut reloc = RelocTable::new();
        let mut f = frame(&classes);
        let o = f.store_new_object(&classes, &mut reloc, 1, "LNode;", None).unwrap();
        f.register_assign(general(0), Set::singleton(o), None).unwrap();
        let base = f.fork();

        let mut rec = Recorder::new();
        f.register_clear(general(0), Some(&mut rec)).unwrap();
        assert!(f.store().is_empty());
        let (fwd, inv) = rec.finish().unwrap();
        assert_eq!(fwd.segment(DiffKind::Deallocate).len(), 3);
        assert_eq!(inv.segment(DiffKind::Allocate).len(), 3);

        let mut g = f.fork();
        g.apply(&inv, &reloc).unwrap();
        assert_eq!(g, base);
        consistent(&g);
    }

    #[test]
    fn test_inverse_law() {
        let classes = classes();
        let mut reloc = RelocTable::new();
        let mut f = frame(&classes);
        let base = f.fork();

        let mut rec = Recorder::new();
        let o = f.store_new_object(&classes, &mut reloc, 1, "LNode;", Some(&mut rec)).unwrap();
        f.register_assign(general(0), Set::singleton(o), Some(&mut rec)).unwrap();
        f.register_load_const(general(1), Addr::POS, Some(&mut rec)).unwrap();
        f.put_field(general(0), "LNode;", "val", general(1), Some(&mut rec)).unwrap();
        f.put_field(general(0), "LNode;", "next", general(0), Some(&mut rec)).unwrap();
        let (fwd, inv) = rec.finish().unwrap();
        consistent(&f);

        let mut g = base.fork();
        g.apply(&fwd, &reloc).unwrap();
        assert_eq!(g, f);
        assert_eq!(g.hashcode(), f.hashcode());

        g.apply(&inv, &reloc).unwrap();
        assert_eq!(g, base);
        assert_eq!(g.hashcode(), base.hashcode());

        let computed = fwd.invert(&base).unwrap();
        let mut h = f.fork();
        h.apply(&computed, &reloc).unwrap();
        assert_eq!(h, base);
        consistent(&h);
    }

    #[test]
    fn test_apply_is_transactional() {
        let mut f = Frame::new(2);
        f.register_load_const(general(0), Addr::POS, None).unwrap();
        let snapshot = f.fork();

        let mut buf = DiffBuffer::new();
        buf.push(Record::Register {
            reg: general(1) as u32,
            value: Set::singleton(Addr::NEG),
        });
        buf.push(Record::Store {
            addr: Addr::object(3),
            value: Value::Set(Set::empty()),
        });
        let diff = buf.freeze().unwrap();
        assert!(f.apply(&diff, &RelocTable::new()).is_err());
        assert_eq!(f, snapshot);
        assert_eq!(f.register(general(1)), Some(&Set::empty()));
    }

    #[test]
    fn test_invoke_frame() {
        let f = Frame::new(2);
        let callee = f
            .make_invoke_frame(4, vec![Set::singleton(Addr::POS), Set::singleton(Addr::NEG)])
            .unwrap();
        assert_eq!(callee.num_regs(), 6);
        assert_eq!(callee.register(general(2)), Some(&Set::singleton(Addr::POS)));
        assert_eq!(callee.register(general(3)), Some(&Set::singleton(Addr::NEG)));
        assert_eq!(callee.register(general(0)), Some(&Set::empty()));
        assert!(matches!(
            f.make_invoke_frame(1, vec![Set::empty(), Set::empty()]),
            Err(CeskError::TooManyArguments { args: 2, nregs: 1 })
        ));
    }

    #[test]
    fn test_gc_reclaims_cycle() {
        let classes = classes();
        let mut reloc = RelocTable::new();
        let mut f = frame(&classes);
        let a = f.store_new_object(&classes, &mut reloc, 1, "LNode;", None).unwrap();
        let b = f.store_new_object(&classes, &mut reloc, 2, "LNode;", None).unwrap();
        f.register_assign(general(0), Set::singleton(a), None).unwrap();
        f.register_assign(general(1), Set::singleton(b), None).unwrap();
        // a.next = b, b.next = a
        f.put_field(general(0), "LNode;", "next", general(1), None).unwrap();
        f.put_field(general(1), "LNode;", "next", general(0), None).unwrap();
        f.register_clear(general(0), None).unwrap();
        f.register_clear(general(1), None).unwrap();
        // the cycle keeps both objects alive
        assert_eq!(f.store().len(), 6);

        assert_eq!(f.gc(None), 6);
        assert!(f.store().is_empty());
        assert!(f.store().iter().all(|(_, s)| s.refcnt() == 0));
        consistent(&f);
    }

    #[test]
    fn test_gc_keeps_reachable() {
        let classes = classes();
        let mut reloc = RelocTable::new();
        let mut f = frame(&classes);
        let a = f.store_new_object(&classes, &mut reloc, 1, "LNode;", None).unwrap();
        f.register_assign(general(0), Set::singleton(a), None).unwrap();
        let before = f.fork();
        assert_eq!(f.gc(None), 0);
        assert_eq!(f, before);
    }

    #[test]
    fn test_join_diff() {
        let classes = classes();
        let mut reloc = RelocTable::new();
        let mut base = frame(&classes);
        base.register_load_const(general(0), Addr::NEG, None).unwrap();

        let mut left = base.fork();
        left.register_load_const(general(0), Addr::POS, None).unwrap();
        let mut right = base.fork();
        let o = right.store_new_object(&classes, &mut reloc, 3, "LNode;", None).unwrap();
        right.register_assign(general(1), Set::singleton(o), None).unwrap();

        let diff = left.join_diff(&right).unwrap();
        let mut joined = left.fork();
        joined.apply(&diff, &reloc).unwrap();
        let r0 = joined.register(general(0)).unwrap();
        assert!(r0.contains(Addr::NEG) && r0.contains(Addr::POS));
        assert_eq!(joined.register(general(1)), Some(&Set::singleton(o)));
        assert!(joined.store().is_allocated(o));
        consistent(&joined);

        // joining again changes nothing
        assert!(joined.join_diff(&right).unwrap().is_empty());
        assert!(joined.join_diff(&left).unwrap().is_empty());
    }

    #[test]
    fn test_tag_register() {
        let mut f = Frame::new(1);
        f.register_load_const(general(0), Addr::POS, None).unwrap();
        f.tag_register(general(0), 5, None).unwrap();
        assert!(f.register(general(0)).unwrap().tags().contains(5));
        let g = f.fork();
        assert!(g.register(general(0)).unwrap().tags().contains(5));
    }

    #[test]
    fn test_display() {
        let statics = StaticTable::new(Rc::from(vec![Addr::ZERO]));
        let mut f = Frame::with_statics(1, statics);
        f.register_load_const(general(0), Addr::POS, None).unwrap();
        let s = f.to_string();
        assert!(s.contains("result = "));
        assert!(s.contains("r0 = "));
    }
}
