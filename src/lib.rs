//! # cesk-rs: an abstract machine for Android bytecode
//!
//! **`cesk-rs`** is the state model and block interpreter of an abstract interpreter for
//! Dalvik bytecode. It executes method bodies over an abstract domain of sign constants
//! and allocation-site objects, and drives every method to a fixpoint.
//!
//! ## The machine state
//!
//! A [`Frame`][crate::frame::Frame] is one abstract machine state: a vector of
//! registers, a [`Store`][crate::store::Store] mapping heap addresses to values, and the
//! static fields. Every register and every field holds a [`Set`][crate::set::Set] of
//! [`Addr`][crate::address::Addr]esses: object references, relocated (allocation-site)
//! references, static-field references, or one folded constant from the sign lattice
//! `{-, 0, +, true, false}`.
//!
//! Frames are cheap to copy. Registers, sets, store blocks and the static table are all
//! reference-counted and copied on first write, so [`fork`][crate::frame::Frame::fork]
//! is O(number of registers) and two forks share everything they have not touched.
//!
//! ## Diffs
//!
//! Every state-changing operation may record what it did into a
//! [`Recorder`][crate::frame::Recorder], producing a *forward* and an *inverse*
//! [`Diff`][crate::diff::Diff]. Diffs are ordered segments of records
//! (allocate, reuse, register, store, deallocate), and form a small algebra:
//!
//! - [`Diff::compose`][crate::diff::Diff::compose] chains diffs,
//! - [`Diff::invert`][crate::diff::Diff::invert] undoes a diff against its base frame,
//! - [`Diff::factorize`][crate::diff::Diff::factorize] merges diffs that share a base into one join.
//!
//! Applying the forward diff of a block to its input yields its output, and applying
//! the inverse to the output gives the input back.
//!
//! ## Quick Start
//!
//! ```rust
//! use cesk_rs::address::Addr;
//! use cesk_rs::frame::{general, Frame, Recorder};
//!
//! let input = Frame::new(2);
//!
//! // Load the constant 0 into v0, recording the change.
//! let mut frame = input.fork();
//! let mut rec = Recorder::new();
//! frame.register_load_const(general(0), Addr::ZERO, Some(&mut rec)).unwrap();
//! let (forward, inverse) = rec.finish().unwrap();
//!
//! assert!(frame.register(general(0)).unwrap().contains(Addr::ZERO));
//! // The input frame is untouched.
//! assert!(input.register(general(0)).unwrap().is_empty());
//!
//! // Replaying the forward diff on the input gives the same frame.
//! let reloc = Default::default();
//! let mut replay = input.fork();
//! replay.apply(&forward, &reloc).unwrap();
//! assert_eq!(replay, frame);
//!
//! // And the inverse takes it back.
//! replay.apply(&inverse, &reloc).unwrap();
//! assert_eq!(replay, input);
//! ```
//!
//! ## Core Components
//!
//! - **[`frame`]**: The machine state and its operations.
//! - **[`store`]**: The copy-on-write, reference-counted heap.
//! - **[`diff`]**: State differences and their algebra.
//! - **[`interp`]**: The single-block interpreter.
//! - **[`analyzer`]**: The per-method fixpoint driver.

pub mod address;
pub mod analyzer;
pub mod arith;
pub mod bitset;
pub mod builtin;
pub mod cache;
pub mod class;
pub mod diff;
pub mod error;
pub mod frame;
pub mod insn;
pub mod interp;
pub mod object;
pub mod reloc;
pub mod set;
pub mod statics;
pub mod store;
pub mod tag;
pub mod utils;
pub mod value;
