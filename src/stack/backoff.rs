//! A Treiber stack that backs off under contention.

use std::fmt;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};

use crossbeam_epoch::{self as epoch, Atomic, Owned};
use crossbeam_utils::CachePadded;

use crate::backoff::Backoff;
use crate::stack::treiber::{try_pop, Node};
use crate::stack::Stack;

const MIN_DELAY: usize = 1;
const MAX_DELAY: usize = 64;

/// A lock-free stack that answers contention with randomized
/// exponential backoff instead of immediate retry.
///
/// # Examples
///
/// ```
/// use mcas::BackoffStack;
///
/// let stack = BackoffStack::new();
/// stack.push("a");
/// assert_eq!(stack.pop(), Some("a"));
/// assert_eq!(stack.pop(), None);
/// ```
pub struct BackoffStack<T> {
    head: CachePadded<Atomic<Node<T>>>,
    min_delay: usize,
    max_delay: usize,
}

impl<T> BackoffStack<T> {
    /// Creates a new, empty stack.
    pub fn new() -> BackoffStack<T> {
        BackoffStack::with_backoff(MIN_DELAY, MAX_DELAY)
    }

    /// Creates a stack whose retries back off between `min` and `max`
    /// delay steps.
    pub fn with_backoff(min: usize, max: usize) -> BackoffStack<T> {
        BackoffStack {
            head: CachePadded::new(Atomic::null()),
            min_delay: min,
            max_delay: max,
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.min_delay, self.max_delay)
    }

    /// Pushes a value on top of the stack.
    pub fn push(&self, value: T) {
        let guard = epoch::pin();
        let mut backoff = self.backoff();
        let mut node = Owned::new(Node::new(value));
        loop {
            let head = self.head.load(Relaxed, &guard);
            node.next.store(head, Relaxed);
            match self.head.compare_exchange(head, node, Release, Relaxed, &guard) {
                Ok(_) => return,
                Err(e) => node = e.new,
            }
            backoff.backoff();
        }
    }

    /// Attempts to pop the top value.
    ///
    /// Returns `None` if the stack is observed empty.
    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        let mut backoff = self.backoff();
        loop {
            match try_pop(&self.head, &guard) {
                Ok(value) => return value,
                Err(()) => backoff.backoff(),
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

impl<T> Stack<T> for BackoffStack<T> {
    fn push(&self, value: T) {
        BackoffStack::push(self, value);
    }

    fn pop(&self) -> Option<T> {
        BackoffStack::pop(self)
    }

    fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        BackoffStack::peek(self)
    }
}

impl<T> Drop for BackoffStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<T> Default for BackoffStack<T> {
    fn default() -> BackoffStack<T> {
        BackoffStack::new()
    }
}

impl<T> fmt::Debug for BackoffStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("BackoffStack { .. }")
    }
}
