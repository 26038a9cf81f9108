//! Multi-word compare-and-swap and lock-free data structures built on
//! it.
//!
//! The core of this crate is [`Casn`], a software multi-word
//! compare-and-swap over [`Aref`] atomic references: any number of
//! `(reference, expected, new)` cells are applied as one atomic,
//! lock-free transaction. Threads that run into an in-flight transaction
//! help it finish instead of waiting, so some thread always makes
//! progress.
//!
//! On top of the transaction core sits [`LockFreeList`], a concurrent
//! doubly-linked list whose every structural edit is a three-cell
//! transaction.
//!
//! Alongside it, and sharing the same discipline but not the transaction
//! machinery, live a few classic coordination primitives:
//!
//! * [`Exchanger`], a timed two-thread rendez-vous.
//! * The [`stack`](crate::stack) family: [`TreiberStack`],
//!   [`BackoffStack`], [`FlatCombiningStack`] and [`EliminationStack`].
//! * [`Backoff`], randomized exponential backoff for contended loops.
//! * [`ThreadIdPool`], dense thread ids for structures with per-thread
//!   slots.
//!
//! Memory reclamation throughout is epoch-based, via
//! [`crossbeam-epoch`](crossbeam_epoch): operations pin the current
//! thread and retired objects are destroyed once no pinned thread can
//! still reach them.
//!
//! # Examples
//!
//! ```
//! use crossbeam_epoch as epoch;
//! use mcas::{Aref, Casn};
//!
//! let r1 = Aref::new("v1");
//! let r2 = Aref::new("v2");
//!
//! let guard = epoch::pin();
//! let (v1, v2) = (r1.load(&guard), r2.load(&guard));
//!
//! let mut casn = Casn::new();
//! casn.compare_exchange(&r1, v1, Some("v1'"));
//! casn.compare_exchange(&r2, v2, Some("v2'"));
//! assert!(casn.exec(&guard));
//!
//! // A stale transaction fails without touching anything.
//! let mut stale = Casn::new();
//! stale.compare_exchange(&r1, v1, Some("v1''"));
//! assert!(!stale.exec(&guard));
//! assert_eq!(r1.load(&guard), Some(&"v1'"));
//! ```

#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]

mod backoff;
mod casn;
mod exchanger;
mod list;
pub mod stack;
mod thread_id;

pub use crate::backoff::Backoff;
pub use crate::casn::{Aref, Casn};
pub use crate::exchanger::{ExchangeError, Exchanger};
pub use crate::list::{Cursor, Iter, LockFreeList};
pub use crate::stack::{
    BackoffStack, EliminationStack, FlatCombiningStack, Stack, TreiberStack,
};
pub use crate::thread_id::ThreadIdPool;
