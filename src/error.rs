//! Error types.
//!
//! Resource exhaustion is reported by [`StoreError::Exhausted`] (or a `None` address
//! from [`Store::allocate`][crate::store::Store::allocate]) and only aborts the local
//! operation. Address-kind mismatches are logged and skipped at the call site and
//! never surface here. A [`DiffError`] means the diff algebra was misused upstream:
//! callers must not try to patch it over.

use thiserror::Error;

use crate::address::Addr;
use crate::diff::DiffKind;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store exhausted: no free slot in {blocks} blocks")]
    Exhausted { blocks: usize },

    #[error("address {0} is not allocated")]
    Unallocated(Addr),

    #[error("address {0} is already allocated")]
    AlreadyAllocated(Addr),

    #[error("relocated address {0} has no mapping in this store")]
    Unmapped(Addr),

    #[error("address {0} does not name a store slot")]
    NotHeap(Addr),

    #[error("slot {0} holds no value")]
    Empty(Addr),

    #[error("relocation ids exhausted after {0} sites")]
    RelocExhausted(usize),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiffError {
    #[error("illegal transition {earlier:?} -> {later:?} at {key}")]
    IllegalTransition { key: String, earlier: DiffKind, later: DiffKind },

    #[error("register {0} out of range")]
    BadRegister(u32),

    #[error("cannot invert: {0} holds no value in the base frame")]
    NotInvertible(Addr),

    #[error("relocated address {0} was never allocated by the relocation table")]
    UnknownSite(Addr),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum CeskError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Diff(#[from] DiffError),

    #[error("register {0} out of range")]
    BadRegister(u32),

    #[error("unknown class {0}")]
    UnknownClass(String),

    #[error("{0} is not a static field")]
    BadStatic(Addr),

    #[error("unknown static field {class}.{field}")]
    UnknownStatic { class: String, field: String },

    #[error("too many arguments: {args} for {nregs} registers")]
    TooManyArguments { args: usize, nregs: usize },

    #[error("built-in class {class} failed: {message}")]
    Builtin { class: String, message: String },

    #[error("block {0} does not exist")]
    NoBlock(usize),
}

pub type Result<T, E = CeskError> = std::result::Result<T, E>;
