//! Restricted double-compare single-swap.
//!
//! RDCSS swings a target cell from `old` to `new` only if a second word,
//! the condition, holds an expected value at the same time. The CASN
//! protocol uses it to install its descriptor into a cell conditional on
//! the transaction status still being undecided.
//!
//! The condition word is always a CASN status and never holds a
//! descriptor, so `complete` reads it raw. The choice between `new` and
//! rollback to `old` is determined entirely by that monotone word, which
//! is what makes helping idempotent: any number of threads may run
//! `complete` for the same descriptor and all of them pick the same side.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::Guard;

use crate::casn::word::{self, Word};

/// A pending conditional swap. Immutable once published; identified by
/// address, never by contents.
#[derive(Debug)]
pub(crate) struct RdcssDescriptor {
    /// The condition word, read raw.
    cond: *const AtomicUsize,
    /// Expected condition value.
    expect: usize,
    /// The cell being swapped.
    target: *const Word,
    /// Expected cell contents.
    old: usize,
    /// Replacement installed when the condition held.
    new: usize,
}

unsafe impl Send for RdcssDescriptor {}
unsafe impl Sync for RdcssDescriptor {}

impl RdcssDescriptor {
    pub(crate) fn new(
        cond: *const AtomicUsize,
        expect: usize,
        target: *const Word,
        old: usize,
        new: usize,
    ) -> RdcssDescriptor {
        RdcssDescriptor {
            cond,
            expect,
            target,
            old,
            new,
        }
    }
}

/// Runs the descriptor against its target cell.
///
/// Returns the user or CASN word observed in the cell: `old` means the
/// swap was installed (and then completed), anything else means the cell
/// had already moved on. Colliding RDCSS descriptors are helped and the
/// installation is retried, so the return value is never an RDCSS word.
pub(crate) fn install(d: RdcssDescriptor, guard: &Guard) -> usize {
    let ptr = Box::into_raw(Box::new(d));
    let tagged = word::tag_rdcss(ptr);
    loop {
        let observed = unsafe { (*(*ptr).target).raw_cas((*ptr).old, tagged) };
        if word::is_rdcss(observed) {
            unsafe { complete(word::untag_rdcss(observed), guard) };
            continue;
        }
        if observed == unsafe { (*ptr).old } {
            // Installed: finish our own swap. The descriptor is now
            // shared and is reclaimed by whichever thread removes it.
            unsafe { complete(ptr, guard) };
        } else {
            // Never published, still exclusively ours.
            drop(unsafe { Box::from_raw(ptr) });
        }
        return observed;
    }
}

/// Completes a published descriptor, removing it from its target cell.
///
/// # Safety
///
/// `ptr` must have been observed in a cell while `guard` was pinned.
pub(crate) unsafe fn complete(ptr: *const RdcssDescriptor, guard: &Guard) {
    let d = &*ptr;
    let tagged = word::tag_rdcss(ptr);
    let replacement = if (*d.cond).load(Ordering::SeqCst) == d.expect {
        d.new
    } else {
        d.old
    };
    // Racing helpers make the same choice; exactly one CAS wins and that
    // winner owns reclamation.
    if (*d.target).raw_cas(tagged, replacement) == tagged {
        let ptr = ptr as *mut RdcssDescriptor;
        guard.defer_unchecked(move || drop(Box::from_raw(ptr)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::casn::word::from_count;
    use crossbeam_epoch as epoch;

    const HELD: usize = 0;
    const BROKEN: usize = 1;

    #[test]
    fn swaps_when_condition_holds() {
        let guard = &epoch::pin();
        let cond = AtomicUsize::new(HELD);
        let cell = Word::new(from_count(5));

        let d = RdcssDescriptor::new(&cond, HELD, &cell, from_count(5), from_count(6));
        assert_eq!(install(d, guard), from_count(5));
        assert_eq!(cell.read_resolved(guard), from_count(6));
    }

    #[test]
    fn rolls_back_when_condition_broken() {
        let guard = &epoch::pin();
        let cond = AtomicUsize::new(BROKEN);
        let cell = Word::new(from_count(5));

        let d = RdcssDescriptor::new(&cond, HELD, &cell, from_count(5), from_count(6));
        assert_eq!(install(d, guard), from_count(5));
        assert_eq!(cell.read_resolved(guard), from_count(5));
    }

    #[test]
    fn reports_unexpected_cell_contents() {
        let guard = &epoch::pin();
        let cond = AtomicUsize::new(HELD);
        let cell = Word::new(from_count(9));

        let d = RdcssDescriptor::new(&cond, HELD, &cell, from_count(5), from_count(6));
        assert_eq!(install(d, guard), from_count(9));
        assert_eq!(cell.read_resolved(guard), from_count(9));
    }
}
