//! The tagged word cell underlying every CASN-capable reference.
//!
//! A `Word` holds a single machine word whose low two bits discriminate
//! what the rest of the word means:
//!
//! * `00` — a user word: either a pointer to a heap value (pointers are
//!   aligned to at least four bytes, so the low bits are free) or a small
//!   integer shifted left by the tag width.
//! * `01` — a pointer to an RDCSS descriptor, installed transiently while
//!   a conditional single-word swap is in flight.
//! * `10` — a pointer to a CASN descriptor, installed transiently while a
//!   multi-word transaction holds this cell.
//!
//! User code must never observe a descriptor word: reads go through
//! [`Word::read_resolved`], which helps whatever transaction is in the
//! way and retries until a user word is left in the cell.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::Guard;

use crate::casn::descriptor::CasnDescriptor;
use crate::casn::rdcss;

/// Number of low bits reserved for the tag.
pub(crate) const TAG_BITS: u32 = 2;

const TAG_MASK: usize = (1 << TAG_BITS) - 1;
const TAG_RDCSS: usize = 0b01;
const TAG_CASN: usize = 0b10;

/// Packs a small integer into a user word.
#[inline]
pub(crate) fn from_count(count: usize) -> usize {
    debug_assert!(count <= usize::MAX >> TAG_BITS);
    count << TAG_BITS
}

/// Unpacks a small integer from a user word.
#[inline]
pub(crate) fn to_count(word: usize) -> usize {
    debug_assert_eq!(word & TAG_MASK, 0);
    word >> TAG_BITS
}

/// Packs a heap pointer into a user word.
#[inline]
pub(crate) fn from_ptr<T>(ptr: *const T) -> usize {
    let word = ptr as usize;
    debug_assert_eq!(word & TAG_MASK, 0, "value pointer is underaligned");
    word
}

/// Unpacks a heap pointer from a user word.
#[inline]
pub(crate) fn to_ptr<T>(word: usize) -> *const T {
    debug_assert_eq!(word & TAG_MASK, 0);
    word as *const T
}

#[inline]
pub(crate) fn is_rdcss(word: usize) -> bool {
    word & TAG_MASK == TAG_RDCSS
}

#[inline]
pub(crate) fn is_casn(word: usize) -> bool {
    word & TAG_MASK == TAG_CASN
}

#[inline]
pub(crate) fn tag_rdcss(ptr: *const rdcss::RdcssDescriptor) -> usize {
    let word = ptr as usize;
    debug_assert_eq!(word & TAG_MASK, 0);
    word | TAG_RDCSS
}

#[inline]
pub(crate) fn untag_rdcss(word: usize) -> *const rdcss::RdcssDescriptor {
    debug_assert!(is_rdcss(word));
    (word & !TAG_MASK) as *const _
}

#[inline]
pub(crate) fn tag_casn(ptr: *const CasnDescriptor) -> usize {
    let word = ptr as usize;
    debug_assert_eq!(word & TAG_MASK, 0);
    word | TAG_CASN
}

#[inline]
pub(crate) fn untag_casn(word: usize) -> *const CasnDescriptor {
    debug_assert!(is_casn(word));
    (word & !TAG_MASK) as *const _
}

/// A single CASN-capable cell.
///
/// The protocol is specified against a total order over status and cell
/// transitions, so every access here is `SeqCst`.
#[derive(Debug)]
pub(crate) struct Word {
    bits: AtomicUsize,
}

impl Word {
    pub(crate) fn new(word: usize) -> Word {
        Word {
            bits: AtomicUsize::new(word),
        }
    }

    /// Reads the raw slot contents, descriptors included.
    #[inline]
    pub(crate) fn raw_load(&self) -> usize {
        self.bits.load(Ordering::SeqCst)
    }

    /// Overwrites the slot. Only for initialization, before the cell is
    /// shared.
    #[inline]
    pub(crate) fn raw_store(&self, word: usize) {
        self.bits.store(word, Ordering::SeqCst);
    }

    /// Single-word compare-and-swap returning the pre-existing contents.
    ///
    /// The swap took place iff the returned word equals `expected`.
    /// Callers need the observed word rather than a flag so they can tell
    /// which descriptor, if any, is in the way.
    #[inline]
    pub(crate) fn raw_cas(&self, expected: usize, new: usize) -> usize {
        match self
            .bits
            .compare_exchange(expected, new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(prev) => prev,
            Err(prev) => prev,
        }
    }

    /// Reads the current user word, helping any installed descriptor to
    /// completion first.
    pub(crate) fn read_resolved(&self, guard: &Guard) -> usize {
        loop {
            let word = self.raw_load();
            if is_rdcss(word) {
                // Safe: the descriptor stays alive for as long as any
                // pinned thread can observe it in a cell.
                unsafe { rdcss::complete(untag_rdcss(word), guard) };
            } else if is_casn(word) {
                unsafe { (*untag_casn(word)).help(guard) };
            } else {
                return word;
            }
        }
    }

    /// Like [`read_resolved`](Word::read_resolved), but only drains RDCSS
    /// descriptors. An installed CASN descriptor is returned as is.
    pub(crate) fn read_rdcss_resolved(&self, guard: &Guard) -> usize {
        loop {
            let word = self.raw_load();
            if is_rdcss(word) {
                unsafe { rdcss::complete(untag_rdcss(word), guard) };
            } else {
                return word;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_round_trip() {
        assert_eq!(to_count(from_count(0)), 0);
        assert_eq!(to_count(from_count(1)), 1);
        assert_eq!(to_count(from_count(12345)), 12345);
    }

    #[test]
    fn tags_are_disjoint() {
        let word = from_count(7);
        assert!(!is_rdcss(word));
        assert!(!is_casn(word));
    }

    #[test]
    fn raw_cas_reports_observed() {
        let w = Word::new(from_count(1));
        assert_eq!(w.raw_cas(from_count(1), from_count(2)), from_count(1));
        assert_eq!(w.raw_cas(from_count(1), from_count(3)), from_count(2));
        assert_eq!(w.raw_load(), from_count(2));
    }
}
