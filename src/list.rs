//! A lock-free doubly-linked list driven by multi-word compare-and-swap.
//!
//! Every structural edit — insertion, unlinking, clearing — updates three
//! cells in one CASN transaction: the size counter and the two neighbour
//! links around the edit point. The transaction either lands completely
//! or not at all, which is what keeps the two structural invariants:
//! every reachable node's neighbours point back at it, and the size
//! counter equals the number of reachable nodes.
//!
//! The size cell leads every transaction's cell list. Since every edit
//! goes through it, any two overlapping edits acquire their first shared
//! cell in the same order.
//!
//! Value slots are ordinary atomic cells; overwriting a value needs no
//! transaction because the structural invariants do not mention values.
//!
//! # Examples
//!
//! ```
//! use mcas::LockFreeList;
//!
//! let list = LockFreeList::new();
//! list.push_back("uno");
//! list.push_back("due");
//! list.insert(1, "tre");
//!
//! assert_eq!(list.len(), 3);
//! assert_eq!(list.get(1), Some("tre"));
//! assert_eq!(list.index_of(&"due"), Some(2));
//! ```

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use crossbeam_utils::CachePadded;

use crate::backoff::Backoff;
use crate::casn::descriptor::{self, Entry};
use crate::casn::word::{self, Word};

/// List node. `prev` and `next` are CASN-capable cells holding node
/// pointers; `value` is a plain atomic slot, null only on the sentinel.
struct Node<E> {
    prev: Word,
    next: Word,
    value: Atomic<E>,
}

impl<E> Node<E> {
    fn load_prev(&self, guard: &Guard) -> *const Node<E> {
        word::to_ptr(self.prev.read_resolved(guard))
    }

    fn load_next(&self, guard: &Guard) -> *const Node<E> {
        word::to_ptr(self.next.read_resolved(guard))
    }
}

/// Frees a node together with the value it holds.
///
/// # Safety
///
/// The node must be unreachable, with no transaction still able to
/// target its cells.
unsafe fn free_node<E>(ptr: *const Node<E>) {
    let node = *Box::from_raw(ptr as *mut Node<E>);
    let value = node.value.load(Ordering::Relaxed, epoch::unprotected());
    if !value.is_null() {
        drop(value.into_owned());
    }
}

/// A concurrent doubly-linked list.
///
/// All operations are safe to call from any number of threads.
/// Structural edits are atomic and linearizable; composite operations
/// (resolving an index, then editing) re-validate through their retry
/// loop and are not linearizable as a whole.
///
/// Reading operations clone values out of the list, so the element type
/// must be `Clone` wherever a value crosses the API boundary.
pub struct LockFreeList<E> {
    /// Sentinel node closing the cycle; never unlinked, holds no value.
    head: *const Node<E>,
    /// Number of non-sentinel nodes, updated by every structural edit.
    size: CachePadded<Word>,
    _marker: PhantomData<Box<E>>,
}

unsafe impl<E: Send> Send for LockFreeList<E> {}
unsafe impl<E: Send + Sync> Sync for LockFreeList<E> {}

impl<E> LockFreeList<E> {
    /// Creates an empty list.
    pub fn new() -> LockFreeList<E> {
        let head: *const Node<E> = Box::into_raw(Box::new(Node {
            prev: Word::new(0),
            next: Word::new(0),
            value: Atomic::null(),
        }));
        let head_word = word::from_ptr(head);
        unsafe {
            (*head).prev.raw_store(head_word);
            (*head).next.raw_store(head_word);
        }
        LockFreeList {
            head,
            size: CachePadded::new(Word::new(word::from_count(0))),
            _marker: PhantomData,
        }
    }

    /// Returns the number of elements.
    pub fn len(&self) -> usize {
        let guard = epoch::pin();
        word::to_count(self.size.read_resolved(&guard))
    }

    /// Returns `true` if the list holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `value` at the end of the list.
    pub fn push_back(&self, value: E) {
        let guard = epoch::pin();
        let mut backoff = Backoff::default();
        let mut value = value;
        loop {
            match self.prepend(self.head, value, &guard) {
                Ok(()) => return,
                Err(v) => value = v,
            }
            backoff.backoff();
        }
    }

    /// Inserts `value` at position `index`, shifting everything after it.
    ///
    /// # Panics
    ///
    /// Panics if `index > len()`.
    pub fn insert(&self, index: usize, value: E) {
        let guard = epoch::pin();
        let mut backoff = Backoff::default();
        let mut value = value;
        loop {
            let node = match self.node_at(index, &guard) {
                Some(node) => node,
                None => panic!("index out of bounds"),
            };
            match self.prepend(node, value, &guard) {
                Ok(()) => return,
                Err(v) => value = v,
            }
            backoff.backoff();
        }
    }

    /// Returns a copy of the element at `index`, or `None` if the index
    /// is out of bounds.
    pub fn get(&self, index: usize) -> Option<E>
    where
        E: Clone,
    {
        let guard = epoch::pin();
        let node = self.node_at(index, &guard)?;
        if node == self.head {
            return None;
        }
        Some(self.value_of(node, &guard))
    }

    /// Replaces the element at `index`, returning the previous one.
    ///
    /// This is a plain value write; the structure is untouched.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`.
    pub fn set(&self, index: usize, value: E) -> E
    where
        E: Clone,
    {
        let guard = epoch::pin();
        let node = self.node_at(index, &guard).filter(|&n| n != self.head);
        match node {
            Some(node) => self.swap_value(node, value, &guard),
            None => panic!("index out of bounds"),
        }
    }

    /// Removes and returns the element at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= len()`, including when a concurrent removal
    /// shrinks the list below `index` mid-retry.
    pub fn remove(&self, index: usize) -> E
    where
        E: Clone,
    {
        let guard = epoch::pin();
        let mut backoff = Backoff::default();
        loop {
            let node = self
                .node_at(index, &guard)
                .filter(|&n| n != self.head)
                .unwrap_or_else(|| panic!("index out of bounds"));
            if self.unlink(node, &guard) {
                let value = self.value_of(node, &guard);
                unsafe { self.guard_retire(node, &guard) };
                return value;
            }
            backoff.backoff();
        }
    }

    /// Removes the first element equal to `value`. Returns whether one
    /// was found.
    pub fn remove_item(&self, value: &E) -> bool
    where
        E: PartialEq,
    {
        let guard = epoch::pin();
        let mut backoff = Backoff::default();
        'retry: loop {
            let mut node = unsafe { (*self.head).load_next(&guard) };
            while node != self.head {
                if unsafe { self.value_matches(node, value, &guard) } {
                    if self.unlink(node, &guard) {
                        unsafe { self.guard_retire(node, &guard) };
                        return true;
                    }
                    backoff.backoff();
                    continue 'retry;
                }
                node = unsafe { (*node).load_next(&guard) };
            }
            return false;
        }
    }

    /// Returns `true` if some element equals `value`.
    pub fn contains(&self, value: &E) -> bool
    where
        E: PartialEq,
    {
        self.index_of(value).is_some()
    }

    /// Returns the least index whose element equals `value`.
    pub fn index_of(&self, value: &E) -> Option<usize>
    where
        E: PartialEq,
    {
        let guard = epoch::pin();
        let mut index = 0;
        let mut node = unsafe { (*self.head).load_next(&guard) };
        while node != self.head {
            if unsafe { self.value_matches(node, value, &guard) } {
                return Some(index);
            }
            index += 1;
            node = unsafe { (*node).load_next(&guard) };
        }
        None
    }

    /// Returns the greatest index whose element equals `value`.
    pub fn last_index_of(&self, value: &E) -> Option<usize>
    where
        E: PartialEq,
    {
        let guard = epoch::pin();
        let mut found = None;
        let mut index = 0;
        let mut node = unsafe { (*self.head).load_next(&guard) };
        while node != self.head {
            if unsafe { self.value_matches(node, value, &guard) } {
                found = Some(index);
            }
            index += 1;
            node = unsafe { (*node).load_next(&guard) };
        }
        found
    }

    /// Unlinks every element in one transaction.
    pub fn clear(&self) {
        let guard = epoch::pin();
        let mut backoff = Backoff::default();
        loop {
            let head = self.head;
            let head_word = word::from_ptr(head);
            let (first, last, size) = unsafe {
                (
                    (*head).load_next(&guard),
                    (*head).load_prev(&guard),
                    self.size.read_resolved(&guard),
                )
            };
            let cells = vec![
                Entry {
                    target: &*self.size,
                    old: size,
                    new: word::from_count(0),
                },
                Entry {
                    target: unsafe { &(*head).prev },
                    old: word::from_ptr(last),
                    new: head_word,
                },
                Entry {
                    target: unsafe { &(*head).next },
                    old: word::from_ptr(first),
                    new: head_word,
                },
            ];
            if descriptor::exec(cells, &guard) {
                // The detached chain is ours to retire. Losing edits that
                // raced with the clear are still pinned while they roll
                // their cells back, so deferral cannot outrun them.
                let mut node = first;
                while node != head {
                    let next = unsafe { (*node).load_next(&guard) };
                    unsafe { self.guard_retire(node, &guard) };
                    node = next;
                }
                return;
            }
            backoff.backoff();
        }
    }

    /// Returns a forward iterator over copies of the elements.
    ///
    /// The iterator is single-threaded: it stays memory-safe under
    /// concurrent edits, but makes no promise about which of them it
    /// observes.
    pub fn iter(&self) -> Iter<'_, E> {
        Iter {
            cursor: self.cursor(),
        }
    }

    /// Returns a cursor positioned before the first element.
    pub fn cursor(&self) -> Cursor<'_, E> {
        self.cursor_at(0)
    }

    /// Returns a cursor positioned before the element at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index > len()`.
    pub fn cursor_at(&self, index: usize) -> Cursor<'_, E> {
        let guard = epoch::pin();
        let next = match self.node_at(index, &guard) {
            Some(node) => node,
            None => panic!("index out of bounds"),
        };
        Cursor {
            list: self,
            guard,
            last: self.head,
            next,
        }
    }

    /// Resolves `index` to the node currently holding it: the sentinel
    /// if `index` equals the length, `None` if the traversal runs out of
    /// nodes first.
    fn node_at(&self, index: usize, guard: &Guard) -> Option<*const Node<E>> {
        let head = self.head;
        let mut node = unsafe { (*head).load_next(guard) };
        for _ in 0..index {
            if node == head {
                return None;
            }
            node = unsafe { (*node).load_next(guard) };
        }
        Some(node)
    }

    /// Inserts a fresh node holding `value` before `node`, as one
    /// three-cell transaction. Gives `value` back if the transaction
    /// loses.
    fn prepend(&self, node: *const Node<E>, value: E, guard: &Guard) -> Result<(), E> {
        let (prev, size) = unsafe { ((*node).load_prev(guard), self.size.read_resolved(guard)) };
        let fresh: *const Node<E> = Box::into_raw(Box::new(Node {
            prev: Word::new(word::from_ptr(prev)),
            next: Word::new(word::from_ptr(node)),
            value: Atomic::new(value),
        }));
        let fresh_word = word::from_ptr(fresh);
        let cells = vec![
            Entry {
                target: &*self.size,
                old: size,
                new: word::from_count(word::to_count(size) + 1),
            },
            Entry {
                target: unsafe { &(*prev).next },
                old: word::from_ptr(node),
                new: fresh_word,
            },
            Entry {
                target: unsafe { &(*node).prev },
                old: word::from_ptr(prev),
                new: fresh_word,
            },
        ];
        if descriptor::exec(cells, guard) {
            Ok(())
        } else {
            // The node was never published; take the value back.
            let fresh = unsafe { *Box::from_raw(fresh as *mut Node<E>) };
            let value = unsafe { fresh.value.into_owned() };
            Err(*value.into_box())
        }
    }

    /// Unlinks `node` in one three-cell transaction.
    fn unlink(&self, node: *const Node<E>, guard: &Guard) -> bool {
        let (prev, next, size) = unsafe {
            (
                (*node).load_prev(guard),
                (*node).load_next(guard),
                self.size.read_resolved(guard),
            )
        };
        if word::to_count(size) == 0 {
            // A racing edit got between our reads; retry with fresh ones.
            return false;
        }
        let cells = vec![
            Entry {
                target: &*self.size,
                old: size,
                new: word::from_count(word::to_count(size) - 1),
            },
            Entry {
                target: unsafe { &(*prev).next },
                old: word::from_ptr(node),
                new: word::from_ptr(next),
            },
            Entry {
                target: unsafe { &(*next).prev },
                old: word::from_ptr(node),
                new: word::from_ptr(prev),
            },
        ];
        descriptor::exec(cells, guard)
    }

    fn value_of(&self, node: *const Node<E>, guard: &Guard) -> E
    where
        E: Clone,
    {
        let value = unsafe { (*node).value.load(Ordering::Acquire, guard) };
        unsafe { value.deref() }.clone()
    }

    fn swap_value(&self, node: *const Node<E>, value: E, guard: &Guard) -> E
    where
        E: Clone,
    {
        let old = unsafe { (*node).value.swap(Owned::new(value), Ordering::AcqRel, guard) };
        let replaced = unsafe { old.deref() }.clone();
        unsafe { guard.defer_destroy(old) };
        replaced
    }

    unsafe fn value_matches(&self, node: *const Node<E>, value: &E, guard: &Guard) -> bool
    where
        E: PartialEq,
    {
        (*node).value.load(Ordering::Acquire, guard).deref() == value
    }

    /// Retires an unlinked node.
    unsafe fn guard_retire(&self, node: *const Node<E>, guard: &Guard) {
        guard.defer_unchecked(move || free_node(node));
    }
}

impl<E> Drop for LockFreeList<E> {
    fn drop(&mut self) {
        unsafe {
            let guard = epoch::unprotected();
            let mut node = (*self.head).load_next(guard);
            while node != self.head {
                let next = (*node).load_next(guard);
                free_node(node);
                node = next;
            }
            drop(Box::from_raw(self.head as *mut Node<E>));
        }
    }
}

impl<E> Default for LockFreeList<E> {
    fn default() -> LockFreeList<E> {
        LockFreeList::new()
    }
}

impl<E> fmt::Debug for LockFreeList<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("LockFreeList { .. }")
    }
}

impl<'a, E: Clone> IntoIterator for &'a LockFreeList<E> {
    type Item = E;
    type IntoIter = Iter<'a, E>;

    fn into_iter(self) -> Iter<'a, E> {
        self.iter()
    }
}

/// A forward iterator over copies of a list's elements.
pub struct Iter<'a, E> {
    cursor: Cursor<'a, E>,
}

impl<E: Clone> Iterator for Iter<'_, E> {
    type Item = E;

    fn next(&mut self) -> Option<E> {
        self.cursor.next()
    }
}

impl<E> fmt::Debug for Iter<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Iter { .. }")
    }
}

/// A bidirectional cursor over a list.
///
/// The cursor is single-threaded. It keeps an epoch guard pinned for its
/// whole lifetime, so the nodes it remembers stay readable even when
/// concurrent threads unlink them — but no promise is made about which
/// concurrent edits it observes, and a long-lived cursor holds garbage
/// collection back. `remove` and `set` act on the element most recently
/// returned by `next` or `previous`.
pub struct Cursor<'a, E> {
    list: &'a LockFreeList<E>,
    guard: Guard,
    /// Last returned node; the sentinel when there is no current element.
    last: *const Node<E>,
    next: *const Node<E>,
}

impl<E> Cursor<'_, E> {
    /// Advances past the next element and returns a copy of it.
    pub fn next(&mut self) -> Option<E>
    where
        E: Clone,
    {
        if self.next == self.list.head {
            return None;
        }
        self.last = self.next;
        self.next = unsafe { (*self.next).load_next(&self.guard) };
        Some(self.list.value_of(self.last, &self.guard))
    }

    /// Steps back before the current element and returns a copy of its
    /// predecessor.
    pub fn previous(&mut self) -> Option<E>
    where
        E: Clone,
    {
        let prev = unsafe { (*self.last).load_prev(&self.guard) };
        if prev == self.list.head {
            return None;
        }
        self.last = prev;
        self.next = prev;
        Some(self.list.value_of(prev, &self.guard))
    }

    /// Removes the current element.
    ///
    /// # Panics
    ///
    /// Panics if no element has been returned yet.
    pub fn remove(&mut self) {
        assert!(self.last != self.list.head, "cursor has no current element");
        loop {
            let target = self.last;
            if self.list.unlink(target, &self.guard) {
                if self.next == target {
                    self.next = unsafe { (*target).load_next(&self.guard) };
                } else {
                    self.last = self.list.head;
                }
                unsafe { self.list.guard_retire(target, &self.guard) };
                return;
            }
        }
    }

    /// Replaces the current element, returning the previous value.
    ///
    /// # Panics
    ///
    /// Panics if no element has been returned yet.
    pub fn set(&mut self, value: E) -> E
    where
        E: Clone,
    {
        assert!(self.last != self.list.head, "cursor has no current element");
        self.list.swap_value(self.last, value, &self.guard)
    }

    /// Inserts `value` before the cursor position.
    pub fn insert(&mut self, value: E) {
        self.last = self.list.head;
        let mut value = value;
        loop {
            match self.list.prepend(self.next, value, &self.guard) {
                Ok(()) => return,
                Err(v) => value = v,
            }
        }
    }
}

impl<E> fmt::Debug for Cursor<'_, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Cursor { .. }")
    }
}
