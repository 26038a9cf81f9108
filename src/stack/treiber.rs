//! Treiber's lock-free stack.

use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned};
use crossbeam_utils::CachePadded;

use crate::stack::Stack;

/// A node in a stack. Immutable once linked; the payload is moved out by
/// whichever pop detaches the node.
pub(super) struct Node<T> {
    pub(super) value: ManuallyDrop<T>,
    pub(super) next: Atomic<Node<T>>,
}

impl<T> Node<T> {
    pub(super) fn new(value: T) -> Node<T> {
        Node {
            value: ManuallyDrop::new(value),
            next: Atomic::null(),
        }
    }
}

/// Treiber's lock-free stack.
///
/// Usable with any number of producers and consumers.
///
/// # Examples
///
/// ```
/// use mcas::TreiberStack;
///
/// let stack = TreiberStack::new();
/// stack.push(1);
/// stack.push(2);
/// assert_eq!(stack.peek(), Some(2));
/// assert_eq!(stack.pop(), Some(2));
/// assert_eq!(stack.pop(), Some(1));
/// assert_eq!(stack.pop(), None);
/// ```
pub struct TreiberStack<T> {
    head: CachePadded<Atomic<Node<T>>>,
}

impl<T> TreiberStack<T> {
    /// Creates a new, empty stack.
    pub fn new() -> TreiberStack<T> {
        TreiberStack {
            head: CachePadded::new(Atomic::null()),
        }
    }

    /// Pushes a value on top of the stack.
    pub fn push(&self, value: T) {
        let guard = epoch::pin();
        let mut node = Owned::new(Node::new(value));
        loop {
            let head = self.head.load(Relaxed, &guard);
            node.next.store(head, Relaxed);
            match self.head.compare_exchange(head, node, Release, Relaxed, &guard) {
                Ok(_) => return,
                Err(e) => node = e.new,
            }
        }
    }

    /// Attempts to pop the top value.
    ///
    /// Returns `None` if the stack is observed empty.
    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        loop {
            let head = self.head.load(Acquire, &guard);
            match unsafe { head.as_ref() } {
                Some(h) => {
                    let next = h.next.load(Relaxed, &guard);
                    if self
                        .head
                        .compare_exchange(head, next, Release, Relaxed, &guard)
                        .is_ok()
                    {
                        unsafe {
                            guard.defer_destroy(head);
                            return Some(ptr::read(&*h.value));
                        }
                    }
                }
                None => return None,
            }
        }
    }

    /// Returns a copy of the top value, or `None` if the stack is
    /// observed empty.
    pub fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        let guard = epoch::pin();
        let head = self.head.load(Acquire, &guard);
        unsafe { head.as_ref() }.map(|h| T::clone(&h.value))
    }

    /// Returns `true` if the stack is observed empty.
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.head.load(Acquire, &guard).is_null()
    }
}

impl<T> Stack<T> for TreiberStack<T> {
    fn push(&self, value: T) {
        TreiberStack::push(self, value);
    }

    fn pop(&self) -> Option<T> {
        TreiberStack::pop(self)
    }

    fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        TreiberStack::peek(self)
    }
}

impl<T> Drop for TreiberStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<T> Default for TreiberStack<T> {
    fn default() -> TreiberStack<T> {
        TreiberStack::new()
    }
}

impl<T> fmt::Debug for TreiberStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("TreiberStack { .. }")
    }
}

/// Detaches the top node, the shared pop fast path.
///
/// Returns `Err(())` when the CAS loses, so callers can decide how to
/// deal with the contention.
pub(super) fn try_pop<T>(
    head: &Atomic<Node<T>>,
    guard: &Guard,
) -> Result<Option<T>, ()> {
    let top = head.load(Acquire, guard);
    match unsafe { top.as_ref() } {
        Some(h) => {
            let next = h.next.load(Relaxed, guard);
            if head.compare_exchange(top, next, Release, Relaxed, guard).is_ok() {
                unsafe {
                    guard.defer_destroy(top);
                    Ok(Some(ptr::read(&*h.value)))
                }
            } else {
                Err(())
            }
        }
        None => Ok(None),
    }
}
