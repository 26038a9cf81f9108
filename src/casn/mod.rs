//! Multi-word compare-and-swap over atomic references.
//!
//! The building block is [`Aref`], an atomic reference whose slot may
//! transiently hold a transaction descriptor instead of a user value.
//! Readers never observe descriptors: they help the transaction in the
//! way to completion and re-read. [`Casn`] collects any number of
//! `(reference, expected, new)` cells and applies them as one atomic
//! transaction: either every cell moves from its expected value to its
//! new value, or none does.
//!
//! Expected values are compared by identity (the address obtained from
//! [`Aref::load`]), not by `==`. Two references holding equal but
//! distinct values are different for the purposes of a swap.
//!
//! # Examples
//!
//! ```
//! use crossbeam_epoch as epoch;
//! use mcas::{Aref, Casn};
//!
//! let a = Aref::new(1);
//! let b = Aref::new(2);
//!
//! let guard = epoch::pin();
//! let (x, y) = (a.load(&guard), b.load(&guard));
//!
//! let mut casn = Casn::new();
//! casn.compare_exchange(&a, x, Some(10));
//! casn.compare_exchange(&b, y, Some(20));
//! assert!(casn.exec(&guard));
//!
//! assert_eq!(a.load(&guard), Some(&10));
//! assert_eq!(b.load(&guard), Some(&20));
//! ```

pub(crate) mod descriptor;
pub(crate) mod rdcss;
pub(crate) mod word;

use std::fmt;
use std::marker::PhantomData;
use std::mem;

use crossbeam_epoch::Guard;

use self::descriptor::Entry;
use self::word::Word;

/// Heap cell for a user value.
///
/// The padding guarantees the pointer has tag bits to spare no matter
/// what `T` is.
#[repr(C, align(4))]
struct Value<T>(T);

#[inline]
fn alloc_value<T>(value: Option<T>) -> usize {
    match value {
        Some(v) => word::from_ptr(Box::into_raw(Box::new(Value(v)))),
        None => 0,
    }
}

#[inline]
fn value_word<T>(value: Option<&T>) -> usize {
    match value {
        // A `&T` handed out by `load` points at the first field of its
        // `Value`, which sits at offset zero.
        Some(v) => word::from_ptr(v as *const T as *const Value<T>),
        None => 0,
    }
}

/// Frees the heap cell behind a user word. Reclamation plans store the
/// monomorphized function pointer, type-erased.
unsafe fn free_value<T>(word: usize) {
    drop(Box::from_raw(word::to_ptr::<Value<T>>(word) as *mut Value<T>));
}

/// An atomic reference that can take part in multi-word swaps.
///
/// The reference owns its current value and may be empty. Replaced
/// values are reclaimed through the epoch collector once no pinned
/// thread can still be reading them.
///
/// # Examples
///
/// ```
/// use crossbeam_epoch as epoch;
/// use mcas::Aref;
///
/// let r = Aref::new("uno");
/// let guard = epoch::pin();
///
/// let cur = r.load(&guard);
/// assert_eq!(cur, Some(&"uno"));
/// assert!(r.compare_and_set(cur, Some("due"), &guard));
/// assert_eq!(r.load(&guard), Some(&"due"));
/// ```
pub struct Aref<T> {
    slot: Word,
    _marker: PhantomData<Box<T>>,
}

unsafe impl<T: Send> Send for Aref<T> {}
unsafe impl<T: Send + Sync> Sync for Aref<T> {}

impl<T> Aref<T> {
    /// Creates a reference holding `value`.
    pub fn new(value: T) -> Aref<T> {
        Aref {
            slot: Word::new(alloc_value(Some(value))),
            _marker: PhantomData,
        }
    }

    /// Creates an empty reference.
    pub fn null() -> Aref<T> {
        Aref {
            slot: Word::new(0),
            _marker: PhantomData,
        }
    }

    /// Returns the current value, helping any in-flight transaction to
    /// completion first.
    pub fn load<'g>(&self, guard: &'g Guard) -> Option<&'g T> {
        let w = self.slot.read_resolved(guard);
        if w == 0 {
            None
        } else {
            Some(unsafe { &(*word::to_ptr::<Value<T>>(w)).0 })
        }
    }

    /// Replaces the current value unconditionally.
    pub fn store(&self, value: Option<T>, guard: &Guard) {
        let new = alloc_value(value);
        loop {
            let cur = self.slot.read_resolved(guard);
            if self.slot.raw_cas(cur, new) == cur {
                self.retire(cur, guard);
                return;
            }
        }
    }

    /// Swaps the value to `new` if the current value is `current`.
    ///
    /// `current` is compared by identity, so it should be a reference
    /// obtained from [`load`](Aref::load) under the same guard. This is
    /// the one-cell case of [`Casn`]. On success the replaced value is
    /// retired; on failure `new` is dropped.
    pub fn compare_and_set(&self, current: Option<&T>, new: Option<T>, guard: &Guard) -> bool {
        let expected = value_word(current);
        let new = alloc_value(new);
        loop {
            let cur = self.slot.read_resolved(guard);
            if cur != expected {
                if new != 0 {
                    // Never published.
                    unsafe { free_value::<T>(new) };
                }
                return false;
            }
            if self.slot.raw_cas(cur, new) == cur {
                self.retire(cur, guard);
                return true;
            }
        }
    }

    fn retire(&self, old: usize, guard: &Guard) {
        if old != 0 {
            unsafe { guard.defer_unchecked(move || free_value::<T>(old)) };
        }
    }
}

impl<T> Drop for Aref<T> {
    fn drop(&mut self) {
        let w = self.slot.raw_load();
        debug_assert!(
            !word::is_rdcss(w) && !word::is_casn(w),
            "atomic reference dropped while a transaction is in flight"
        );
        if w != 0 {
            unsafe { free_value::<T>(w) };
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Aref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Aref { .. }")
    }
}

impl<T> Default for Aref<T> {
    fn default() -> Aref<T> {
        Aref::null()
    }
}

/// A reclamation plan for one typed cell: what to free on which outcome.
struct Plan {
    old: usize,
    new: usize,
    free: unsafe fn(usize),
}

/// A multi-word transaction under construction.
///
/// Cells are applied in the order they were added. When several threads
/// run transactions over overlapping references, they must add the
/// shared references in a consistent relative order, the usual
/// lock-ordering rule. Adding the same reference twice to one
/// transaction is a caller error.
///
/// Dropping an unexecuted transaction discards the new values.
pub struct Casn<'g> {
    cells: Vec<Entry>,
    plans: Vec<Plan>,
    _marker: PhantomData<&'g Guard>,
}

impl<'g> Casn<'g> {
    /// Creates an empty transaction. Executing it succeeds vacuously.
    pub fn new() -> Casn<'g> {
        Casn {
            cells: Vec::new(),
            plans: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Adds a cell: swap `target` from `current` to `new`.
    ///
    /// `current` is compared by identity, as in
    /// [`Aref::compare_and_set`].
    pub fn compare_exchange<T>(
        &mut self,
        target: &'g Aref<T>,
        current: Option<&'g T>,
        new: Option<T>,
    ) {
        let old = value_word(current);
        let new = alloc_value(new);
        self.cells.push(Entry {
            target: &target.slot,
            old,
            new,
        });
        self.plans.push(Plan {
            old,
            new,
            free: free_value::<T>,
        });
    }

    /// Atomically applies all cells.
    ///
    /// Returns `true` and retires the replaced values if every cell held
    /// its expected value; otherwise returns `false`, drops the new
    /// values and leaves every target unchanged.
    pub fn exec(mut self, guard: &Guard) -> bool {
        let cells = mem::take(&mut self.cells);
        let plans = mem::take(&mut self.plans);
        let succeeded = descriptor::exec(cells, guard);
        for plan in plans {
            if succeeded {
                if plan.old != 0 {
                    unsafe { guard.defer_unchecked(move || (plan.free)(plan.old)) };
                }
            } else if plan.new != 0 {
                unsafe { (plan.free)(plan.new) };
            }
        }
        succeeded
    }
}

impl Drop for Casn<'_> {
    fn drop(&mut self) {
        for plan in &self.plans {
            if plan.new != 0 {
                unsafe { (plan.free)(plan.new) };
            }
        }
    }
}

impl Default for Casn<'_> {
    fn default() -> Self {
        Casn::new()
    }
}

impl fmt::Debug for Casn<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Casn").field("cells", &self.cells.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch as epoch;

    #[test]
    fn identity_not_equality() {
        let r = Aref::new(String::from("uno"));
        let guard = &epoch::pin();

        // An equal but distinct value is not the current value.
        let other = String::from("uno");
        assert!(!r.compare_and_set(Some(&other), Some(String::from("due")), guard));

        let cur = r.load(guard);
        assert!(r.compare_and_set(cur, Some(String::from("due")), guard));
        assert_eq!(r.load(guard).map(String::as_str), Some("due"));
    }

    #[test]
    fn unexecuted_transaction_drops_new_values() {
        let r = Aref::new(1);
        let guard = &epoch::pin();
        let cur = r.load(guard);

        let mut casn = Casn::new();
        casn.compare_exchange(&r, cur, Some(2));
        drop(casn);

        assert_eq!(r.load(guard), Some(&1));
    }

    #[test]
    fn store_replaces_anything() {
        let r = Aref::null();
        let guard = &epoch::pin();
        assert_eq!(r.load(guard), None);
        r.store(Some(7), guard);
        assert_eq!(r.load(guard), Some(&7));
        r.store(None, guard);
        assert_eq!(r.load(guard), None);
    }
}
