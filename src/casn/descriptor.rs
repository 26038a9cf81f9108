//! The multi-word compare-and-swap protocol.
//!
//! A transaction is described by a [`CasnDescriptor`]: an ordered list of
//! `(cell, old, new)` entries plus a status word that moves out of
//! `UNDECIDED` exactly once. The two-phase protocol follows Harris,
//! Fraser and Pratt's "A Practical Multi-Word Compare-and-Swap
//! Operation":
//!
//! 1. *Acquisition* — install the descriptor into each cell in order,
//!    conditional on the status still being `UNDECIDED` (an RDCSS per
//!    cell). A foreign descriptor found in a cell is helped to completion
//!    and the cell retried; an unexpected user word decides the
//!    transaction as failed.
//! 2. *Release* — after the status is decided, swing every cell from the
//!    descriptor to its new (success) or old (failure) word. Both phases
//!    are idempotent, so any interleaving of the owner and helpers leaves
//!    the same final cell contents.
//!
//! Any thread blocked by a foreign descriptor executes that descriptor's
//! work before retrying, which is what makes the whole protocol
//! lock-free.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::Guard;

use crate::casn::rdcss::{self, RdcssDescriptor};
use crate::casn::word::{self, Word};

pub(crate) const UNDECIDED: usize = 0;
pub(crate) const SUCCEEDED: usize = 1;
pub(crate) const FAILED: usize = 2;

/// One cell of a transaction.
#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) target: *const Word,
    pub(crate) old: usize,
    pub(crate) new: usize,
}

/// A multi-word transaction. The cell list is immutable after
/// construction; only the status word ever changes.
#[derive(Debug)]
pub(crate) struct CasnDescriptor {
    status: AtomicUsize,
    cells: Box<[Entry]>,
}

unsafe impl Send for CasnDescriptor {}
unsafe impl Sync for CasnDescriptor {}

impl CasnDescriptor {
    pub(crate) fn new(cells: Vec<Entry>) -> CasnDescriptor {
        debug_assert!(
            cells
                .iter()
                .enumerate()
                .all(|(i, a)| cells[..i].iter().all(|b| a.target != b.target)),
            "two cells of one transaction target the same reference"
        );
        CasnDescriptor {
            status: AtomicUsize::new(UNDECIDED),
            cells: cells.into_boxed_slice(),
        }
    }

    pub(crate) fn status_word(&self) -> *const AtomicUsize {
        &self.status
    }

    /// Drives this transaction to completion, cooperating with any other
    /// thread doing the same. Returns whether it succeeded.
    pub(crate) fn help(&self, guard: &Guard) -> bool {
        let tagged = word::tag_casn(self);

        // Phase 1: acquisition.
        if self.status.load(Ordering::SeqCst) == UNDECIDED {
            let mut decision = SUCCEEDED;
            'cells: for cell in self.cells.iter() {
                loop {
                    let d = RdcssDescriptor::new(
                        self.status_word(),
                        UNDECIDED,
                        cell.target,
                        cell.old,
                        tagged,
                    );
                    let observed = rdcss::install(d, guard);
                    if word::is_casn(observed) {
                        if observed != tagged {
                            // A foreign transaction holds the cell; do
                            // its work, then retry ours.
                            unsafe { (*word::untag_casn(observed)).help(guard) };
                            continue;
                        }
                        // A helper already installed us here.
                    } else if observed != cell.old {
                        decision = FAILED;
                    }
                    break;
                }
                if decision == FAILED {
                    break 'cells;
                }
            }
            let _ = self.status.compare_exchange(
                UNDECIDED,
                decision,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }

        // Phase 2: release. The status is terminal now.
        let succeeded = self.status.load(Ordering::SeqCst) == SUCCEEDED;
        for cell in self.cells.iter() {
            let replacement = if succeeded { cell.new } else { cell.old };
            unsafe { (*cell.target).raw_cas(tagged, replacement) };
        }
        succeeded
    }
}

/// Runs a transaction over raw word cells.
///
/// The caller keeps ownership of whatever the words point at; this only
/// moves words around. Targets must stay alive until the guard's epoch
/// is past, which holds for cells embedded in epoch-managed structures.
pub(crate) fn exec(cells: Vec<Entry>, guard: &Guard) -> bool {
    let ptr = Box::into_raw(Box::new(CasnDescriptor::new(cells)));
    let succeeded = unsafe { (*ptr).help(guard) };
    // Helpers may still hold the descriptor; reclaim it after they are
    // done.
    unsafe { guard.defer_unchecked(move || drop(Box::from_raw(ptr))) };
    succeeded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::casn::word::{from_count, to_count};
    use crossbeam_epoch as epoch;

    fn count_cell(target: &Word, old: usize, new: usize) -> Entry {
        Entry {
            target,
            old: from_count(old),
            new: from_count(new),
        }
    }

    #[test]
    fn empty_transaction_succeeds() {
        let guard = &epoch::pin();
        assert!(exec(Vec::new(), guard));
    }

    #[test]
    fn applies_all_or_nothing() {
        let guard = &epoch::pin();
        let a = Word::new(from_count(1));
        let b = Word::new(from_count(2));

        assert!(exec(
            vec![count_cell(&a, 1, 10), count_cell(&b, 2, 20)],
            guard
        ));
        assert_eq!(to_count(a.read_resolved(guard)), 10);
        assert_eq!(to_count(b.read_resolved(guard)), 20);

        // Second cell stale: nothing moves.
        assert!(!exec(
            vec![count_cell(&a, 10, 11), count_cell(&b, 2, 21)],
            guard
        ));
        assert_eq!(to_count(a.read_resolved(guard)), 10);
        assert_eq!(to_count(b.read_resolved(guard)), 20);
    }

    #[test]
    fn helper_finishes_acquired_transaction() {
        let guard = &epoch::pin();
        let a = Word::new(from_count(1));
        let b = Word::new(from_count(2));

        // Acquire the first cell by hand, as a stalled owner would have.
        let d = Box::leak(Box::new(CasnDescriptor::new(vec![
            count_cell(&a, 1, 10),
            count_cell(&b, 2, 20),
        ])));
        let installed = rdcss::install(
            RdcssDescriptor::new(
                d.status_word(),
                UNDECIDED,
                &a,
                from_count(1),
                word::tag_casn(d),
            ),
            guard,
        );
        assert_eq!(installed, from_count(1));

        // A reader of `a` must help the stalled transaction through.
        assert_eq!(to_count(a.read_resolved(guard)), 10);
        assert_eq!(to_count(b.read_resolved(guard)), 20);
        // The owner observes the decision a helper made for it.
        assert!(d.help(guard));
    }

    #[test]
    fn decided_transaction_does_not_reacquire() {
        let guard = &epoch::pin();
        let a = Word::new(from_count(1));

        let d = Box::leak(Box::new(CasnDescriptor::new(vec![count_cell(&a, 1, 10)])));
        assert!(d.help(guard));
        assert_eq!(to_count(a.read_resolved(guard)), 10);

        // Ran again (as a late helper would), the terminal status keeps
        // phase 1 from re-installing anything.
        assert!(d.help(guard));
        assert_eq!(to_count(a.read_resolved(guard)), 10);
    }
}
