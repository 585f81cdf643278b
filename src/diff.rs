//! Diffs: composable, invertible logs of frame mutations.
//!
//! A [`Diff`] transforms one [`Frame`] into another. It is an immutable sequence of
//! [`Record`]s partitioned into segments, applied in this order:
//!
//! ```text
//!   | Allocate | Reuse | Register | Store | Deallocate |
//!   ^0         ^1      ^2         ^3      ^4           ^5   offsets
//! ```
//!
//! Within a segment keys are strictly increasing, so two diffs can be merged in one
//! linear scan. Heap records are keyed by address (relocated where the slot has a
//! relocated name), register records by register number; static fields use their
//! [`Addr::static_field`] value as register number.
//!
//! Diffs are built through a [`DiffBuffer`] and frozen once. Freezing folds all records
//! of the same key with [`reduce`]:
//!
//! | earlier \ later | Allocate | Reuse | Register | Store    | Deallocate |
//! |-----------------|----------|-------|----------|----------|------------|
//! | **Allocate**    | error    | both  | error    | Allocate | cancel     |
//! | **Reuse**       | error    | later | error    | both     | later      |
//! | **Register**    | error    | error | later    | error    | error      |
//! | **Store**       | error    | both  | error    | later    | later      |
//! | **Deallocate**  | Store+Reuse | error | error | error    | error      |
//!
//! A `Noop` on either side yields the other record. Errors mean a caller broke the
//! diff invariants and are never patched over.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display, Formatter};

use log::{debug, trace};

use crate::address::Addr;
use crate::error::DiffError;
use crate::frame::Frame;
use crate::reloc::RelocTable;
use crate::set::Set;
use crate::value::Value;

/// Kind of a diff record. Also the segment order.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum DiffKind {
    Allocate,
    Reuse,
    Register,
    Store,
    Deallocate,
    Noop,
}

impl DiffKind {
    /// Kinds that form segments, in application order.
    pub const SEGMENTS: [DiffKind; 5] = [
        DiffKind::Allocate,
        DiffKind::Reuse,
        DiffKind::Register,
        DiffKind::Store,
        DiffKind::Deallocate,
    ];

    fn segment(self) -> usize {
        self as usize
    }
}

/// One mutation.
#[derive(Clone, PartialEq)]
pub enum Record {
    /// Allocate a slot and attach a value.
    Allocate { addr: Addr, value: Value },
    /// Set the reuse flag of a slot.
    Reuse { addr: Addr, flag: bool },
    /// Set a register or static field.
    Register { reg: u32, value: Set },
    /// Replace the value of an allocated slot.
    Store { addr: Addr, value: Value },
    /// Free a slot.
    Deallocate { addr: Addr },
    Noop,
}

/// Key space of a record: registers and heap addresses may share numbers.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Key {
    Register(u32),
    Heap(Addr),
    None,
}

impl Display for Key {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Register(r) => match Addr::from_raw(*r) {
                a if a.is_static() => write!(f, "{}", a),
                _ => write!(f, "r{}", r),
            },
            Key::Heap(a) => write!(f, "{}", a),
            Key::None => write!(f, "-"),
        }
    }
}

impl Record {
    pub fn kind(&self) -> DiffKind {
        match self {
            Record::Allocate { .. } => DiffKind::Allocate,
            Record::Reuse { .. } => DiffKind::Reuse,
            Record::Register { .. } => DiffKind::Register,
            Record::Store { .. } => DiffKind::Store,
            Record::Deallocate { .. } => DiffKind::Deallocate,
            Record::Noop => DiffKind::Noop,
        }
    }

    pub fn key(&self) -> Key {
        match self {
            Record::Register { reg, .. } => Key::Register(*reg),
            Record::Allocate { addr, .. }
            | Record::Reuse { addr, .. }
            | Record::Store { addr, .. }
            | Record::Deallocate { addr } => Key::Heap(*addr),
            Record::Noop => Key::None,
        }
    }
}

impl Display for Record {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Record::Allocate { addr, value } => write!(f, "alloc {} = {}", addr, value),
            Record::Reuse { addr, flag } => write!(f, "reuse {} = {}", addr, flag),
            Record::Register { reg, value } => write!(f, "reg {} = {}", Key::Register(*reg), value),
            Record::Store { addr, value } => write!(f, "store {} = {}", addr, value),
            Record::Deallocate { addr } => write!(f, "dealloc {}", addr),
            Record::Noop => write!(f, "noop"),
        }
    }
}

impl Debug for Record {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// Outcome of reducing two records on the same key.
#[derive(Debug, Clone, PartialEq)]
pub enum Reduction {
    /// A single record replaces both.
    Keep(Record),
    /// Both survive, in separate segments: a main record and a reuse record.
    Both(Record, Record),
    /// The two records cancel out.
    Cancel,
}

fn illegal(earlier: &Record, later: &Record) -> DiffError {
    DiffError::IllegalTransition {
        key: later.key().to_string(),
        earlier: earlier.kind(),
        later: later.kind(),
    }
}

/// Combines two records on the same key, `earlier` happening first.
///
/// Never mutates anything: an illegal pair is reported as an error.
pub fn reduce(earlier: &Record, later: &Record) -> Result<Reduction, DiffError> {
    use DiffKind::*;
    if earlier.kind() != Noop && later.kind() != Noop && earlier.key() != later.key() {
        return Err(illegal(earlier, later));
    }
    let r = match (earlier, later) {
        (Record::Noop, x) | (x, Record::Noop) => Reduction::Keep(x.clone()),
        (Record::Allocate { addr, .. }, Record::Store { value, .. }) => Reduction::Keep(Record::Allocate {
            addr: *addr,
            value: value.clone(),
        }),
        (Record::Allocate { .. }, Record::Deallocate { .. }) => Reduction::Cancel,
        (Record::Allocate { .. } | Record::Store { .. }, Record::Reuse { .. })
        | (Record::Reuse { .. }, Record::Store { .. }) => {
            let (main, reuse) = if earlier.kind() == Reuse {
                (later, earlier)
            } else {
                (earlier, later)
            };
            Reduction::Both(main.clone(), reuse.clone())
        }
        (Record::Deallocate { .. }, Record::Allocate { addr, value }) => Reduction::Both(
            Record::Store {
                addr: *addr,
                value: value.clone(),
            },
            Record::Reuse { addr: *addr, flag: true },
        ),
        (Record::Reuse { .. }, Record::Reuse { .. })
        | (Record::Register { .. }, Record::Register { .. })
        | (Record::Store { .. }, Record::Store { .. })
        | (Record::Store { .. } | Record::Reuse { .. }, Record::Deallocate { .. }) => Reduction::Keep(later.clone()),
        _ => return Err(illegal(earlier, later)),
    };
    trace!("reduce({}, {}) => {:?}", earlier, later, r);
    Ok(r)
}

/// Append-only log of records, frozen into a [`Diff`].
///
/// A reversed buffer receives records in reverse time order: the last record pushed
/// happens first. This is how inverse diffs are accumulated during interpretation.
#[derive(Debug, Clone, Default)]
pub struct DiffBuffer {
    records: Vec<Record>,
    reverse: bool,
}

impl DiffBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reversed() -> Self {
        Self {
            records: Vec::new(),
            reverse: true,
        }
    }

    pub fn is_reversed(&self) -> bool {
        self.reverse
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn push(&mut self, record: Record) {
        trace!("push {}", record);
        self.records.push(record);
    }

    /// Drops records pushed after the buffer had `len` records.
    pub fn truncate(&mut self, len: usize) {
        self.records.truncate(len);
    }

    /// Folds the records into an immutable diff.
    pub fn freeze(self) -> Result<Diff, DiffError> {
        let n = self.records.len();
        let mut timed = self.records;
        if self.reverse {
            timed.reverse();
        }
        timed.retain(|r| r.kind() != DiffKind::Noop);
        // Stable: records of one key keep their time order.
        timed.sort_by_key(|r| r.key());

        let mut segments: [Vec<Record>; 5] = Default::default();
        let mut group = Vec::new();
        let mut it = timed.into_iter().peekable();
        while let Some(rec) = it.next() {
            let key = rec.key();
            group.push(rec);
            if it.peek().is_some_and(|next| next.key() == key) {
                continue;
            }
            let (main, reuse) = fold(std::mem::take(&mut group))?;
            for r in main.into_iter().chain(reuse) {
                segments[r.kind().segment()].push(r);
            }
        }
        let diff = Diff::from_segments(segments);
        debug!("freeze: {} records => {}", n, diff.len());
        Ok(diff)
    }
}

/// Folds the time-ordered records of one key into a main record and a reuse record.
fn fold(group: Vec<Record>) -> Result<(Option<Record>, Option<Record>), DiffError> {
    let mut main: Option<Record> = None;
    let mut reuse: Option<Record> = None;
    for rec in group {
        if rec.kind() == DiffKind::Reuse {
            if let Some(m) = &main {
                reduce(m, &rec)?;
            }
            reuse = Some(rec);
            continue;
        }
        if let Some(r) = &reuse {
            if let Reduction::Keep(_) = reduce(r, &rec)? {
                reuse = None;
            }
        }
        main = match main.take() {
            None => Some(rec),
            Some(m) => match reduce(&m, &rec)? {
                Reduction::Keep(x) => Some(x),
                Reduction::Both(x, r) => {
                    reuse = Some(r);
                    Some(x)
                }
                Reduction::Cancel => {
                    reuse = None;
                    None
                }
            },
        };
    }
    Ok((main, reuse))
}

/// Frozen, segmented, key-sorted sequence of records.
#[derive(Clone, Default, PartialEq)]
pub struct Diff {
    records: Vec<Record>,
    offsets: [usize; 6],
}

impl Diff {
    fn from_segments(segments: [Vec<Record>; 5]) -> Self {
        let mut records = Vec::with_capacity(segments.iter().map(|s| s.len()).sum());
        let mut offsets = [0; 6];
        for (k, seg) in segments.into_iter().enumerate() {
            records.extend(seg);
            offsets[k + 1] = records.len();
        }
        Self { records, offsets }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records of one segment, sorted by key.
    pub fn segment(&self, kind: DiffKind) -> &[Record] {
        match kind {
            DiffKind::Noop => &[],
            k => &self.records[self.offsets[k.segment()]..self.offsets[k.segment() + 1]],
        }
    }

    /// Offset of every segment start, plus the end.
    pub fn offsets(&self) -> &[usize; 6] {
        &self.offsets
    }

    /// All records in application order.
    pub fn iter(&self) -> impl Iterator<Item = &Record> + '_ {
        self.records.iter()
    }

    /// Records touching `key`.
    pub fn find(&self, key: Key) -> impl Iterator<Item = &Record> + '_ {
        DiffKind::SEGMENTS.into_iter().filter_map(move |k| {
            let seg = self.segment(k);
            seg.binary_search_by_key(&key, |r| r.key()).ok().map(|i| &seg[i])
        })
    }

    /// The diff equivalent to applying `diffs` one after another.
    pub fn compose(diffs: &[&Diff]) -> Result<Diff, DiffError> {
        let mut buf = DiffBuffer::new();
        for d in diffs {
            for r in d.iter() {
                buf.push(r.clone());
            }
        }
        buf.freeze()
    }

    /// The diff undoing `self`, given the frame `base` it applies to.
    pub fn invert(&self, base: &Frame) -> Result<Diff, DiffError> {
        let store = base.store();
        let mut buf = DiffBuffer::new();
        for rec in self.iter() {
            match rec {
                Record::Allocate { addr, .. } => {
                    if store.is_allocated(*addr) {
                        let old = store.get(*addr).cloned().ok_or(DiffError::NotInvertible(*addr))?;
                        buf.push(Record::Store { addr: *addr, value: old });
                        buf.push(Record::Reuse {
                            addr: *addr,
                            flag: store.is_reused(*addr),
                        });
                    } else {
                        buf.push(Record::Deallocate { addr: *addr });
                    }
                }
                Record::Reuse { addr, .. } => {
                    if store.is_allocated(*addr) {
                        buf.push(Record::Reuse {
                            addr: *addr,
                            flag: store.is_reused(*addr),
                        });
                    }
                }
                Record::Register { reg, .. } => {
                    let old = base.read_register(*reg).ok_or(DiffError::BadRegister(*reg))?;
                    buf.push(Record::Register { reg: *reg, value: old });
                }
                Record::Store { addr, .. } => {
                    let old = store.get(*addr).cloned().ok_or(DiffError::NotInvertible(*addr))?;
                    buf.push(Record::Store { addr: *addr, value: old });
                }
                Record::Deallocate { addr } => {
                    if let Some(old) = store.get(*addr) {
                        buf.push(Record::Allocate {
                            addr: *addr,
                            value: old.clone(),
                        });
                        if store.is_reused(*addr) {
                            buf.push(Record::Reuse { addr: *addr, flag: true });
                        }
                    }
                }
                Record::Noop => {}
            }
        }
        buf.freeze()
    }

    /// Applies the diff to `frame`. See [`Frame::apply`].
    pub fn apply(&self, frame: &mut Frame, reloc: &RelocTable) -> Result<(), DiffError> {
        frame.apply(self, reloc)
    }

    /// Joins several diffs over the same `base` frame.
    ///
    /// The result, applied to `base`, yields the join of the frames obtained by applying
    /// each diff to `base` separately. A key untouched by some diff keeps contributing its
    /// value in `base`. A slot is deallocated only if every diff deallocates it.
    pub fn factorize(diffs: &[&Diff], base: &Frame) -> Result<Diff, DiffError> {
        let n = diffs.len();
        match n {
            0 => return Ok(Diff::empty()),
            1 => return Ok(diffs[0].clone()),
            _ => {}
        }
        let store = base.store();

        let mut regs: BTreeMap<u32, Vec<&Set>> = BTreeMap::new();
        let mut heap: BTreeMap<Addr, Vec<&Record>> = BTreeMap::new();
        let mut reuse: BTreeMap<Addr, bool> = BTreeMap::new();
        for d in diffs {
            for rec in d.iter() {
                match rec {
                    Record::Register { reg, value } => regs.entry(*reg).or_default().push(value),
                    Record::Reuse { addr, flag } => *reuse.entry(*addr).or_default() |= *flag,
                    Record::Allocate { addr, .. } | Record::Store { addr, .. } | Record::Deallocate { addr } => {
                        heap.entry(*addr).or_default().push(rec)
                    }
                    Record::Noop => {}
                }
            }
        }

        let mut buf = DiffBuffer::new();
        for (reg, values) in regs {
            let old = base.read_register(reg).ok_or(DiffError::BadRegister(reg))?;
            let mut joined = if values.len() < n { old.fork() } else { Set::empty() };
            for v in values {
                joined.merge(v);
            }
            if joined != old {
                buf.push(Record::Register { reg, value: joined });
            }
        }
        for (addr, recs) in heap {
            let deallocs = recs.iter().filter(|r| r.kind() == DiffKind::Deallocate).count();
            if deallocs == n {
                buf.push(Record::Deallocate { addr });
                continue;
            }
            let allocates = recs.iter().any(|r| r.kind() == DiffKind::Allocate);
            let mut joined: Option<Value> = None;
            let mut join = |v: &Value| match joined {
                Some(ref mut j) => {
                    j.join(v);
                }
                None => joined = Some(v.clone()),
            };
            for r in &recs {
                if let Record::Allocate { value, .. } | Record::Store { value, .. } = r {
                    join(value);
                }
            }
            if recs.len() < n || deallocs > 0 {
                if let Some(old) = store.get(addr) {
                    join(old);
                }
            }
            let Some(value) = joined else {
                continue;
            };
            if allocates && !store.is_allocated(addr) {
                buf.push(Record::Allocate { addr, value });
            } else if store.get(addr) != Some(&value) {
                buf.push(Record::Store { addr, value });
            }
        }
        for (addr, flag) in reuse {
            if flag && !store.is_reused(addr) {
                buf.push(Record::Reuse { addr, flag });
            }
        }
        buf.freeze()
    }
}

impl Display for Diff {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Diff[")?;
        for (i, r) in self.records.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", r)?;
        }
        write!(f, "]")
    }
}

impl Debug for Diff {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}
