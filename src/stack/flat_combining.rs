//! A flat-combining stack.
//!
//! Threads publish their operations into a lock-free list and one of
//! them at a time, whoever wins `try_lock` on the combiner lock, applies
//! every published operation to a private array-backed stack. Everybody
//! else spins on their own `ready` flag. Under contention a single lock
//! acquisition pays for many operations.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::AtomicBool;
use std::sync::Mutex;
use std::thread;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::stack::Stack;

/// Combining rounds per lock acquisition. Empirical; override with
/// [`FlatCombiningStack::with_rounds`].
const DEFAULT_ROUNDS: usize = 20;

enum Kind {
    Push,
    Pop,
    Peek,
}

/// A published operation. The slot carries the operand in and the result
/// out; it belongs to the combiner until `ready` is set, then to the
/// publishing thread.
struct Op<T> {
    next: Atomic<Op<T>>,
    kind: Kind,
    slot: UnsafeCell<Option<T>>,
    ready: AtomicBool,
}

unsafe impl<T: Send> Send for Op<T> {}
unsafe impl<T: Send> Sync for Op<T> {}

/// A stack coordinated by flat combining.
///
/// Elements must be `Clone` so a combiner can hand out `peek` results.
///
/// # Examples
///
/// ```
/// use mcas::FlatCombiningStack;
///
/// let stack = FlatCombiningStack::new();
/// stack.push(1);
/// stack.push(2);
/// assert_eq!(stack.peek(), Some(2));
/// assert_eq!(stack.pop(), Some(2));
/// ```
pub struct FlatCombiningStack<T> {
    /// Publication list; new operations are prepended.
    queue: Atomic<Op<T>>,
    /// The combiner's private stack. The mutex is the combiner lock.
    items: Mutex<Vec<T>>,
    rounds: usize,
}

unsafe impl<T: Send> Send for FlatCombiningStack<T> {}
unsafe impl<T: Send> Sync for FlatCombiningStack<T> {}

impl<T> FlatCombiningStack<T> {
    /// Creates a new, empty stack.
    pub fn new() -> FlatCombiningStack<T> {
        FlatCombiningStack::with_rounds(DEFAULT_ROUNDS)
    }

    /// Creates a stack whose combiner runs up to `rounds` passes per
    /// lock acquisition.
    pub fn with_rounds(rounds: usize) -> FlatCombiningStack<T> {
        assert!(rounds > 0, "combining rounds must be non-zero");
        FlatCombiningStack {
            queue: Atomic::null(),
            items: Mutex::new(Vec::new()),
            rounds,
        }
    }
}

impl<T: Clone> FlatCombiningStack<T> {
    /// Pushes a value on top of the stack.
    pub fn push(&self, value: T) {
        self.run(Kind::Push, Some(value));
    }

    /// Removes and returns the top value, or `None` if the stack is
    /// empty.
    pub fn pop(&self) -> Option<T> {
        self.run(Kind::Pop, None)
    }

    /// Returns a copy of the top value, or `None` if the stack is
    /// empty.
    pub fn peek(&self) -> Option<T> {
        self.run(Kind::Peek, None)
    }

    /// Publishes an operation and waits for a combiner (possibly this
    /// thread) to apply it.
    fn run(&self, kind: Kind, input: Option<T>) -> Option<T> {
        // Pinned across the whole operation: a combiner may retire our
        // op node as soon as it detaches it from the list.
        let guard = epoch::pin();
        let op = Owned::new(Op {
            next: Atomic::null(),
            kind,
            slot: UnsafeCell::new(input),
            ready: AtomicBool::new(false),
        })
        .into_shared(&guard);
        let o = unsafe { op.deref() };

        loop {
            let head = self.queue.load(Acquire, &guard);
            o.next.store(head, Relaxed);
            if self
                .queue
                .compare_exchange(head, op, Release, Relaxed, &guard)
                .is_ok()
            {
                break;
            }
        }

        while !o.ready.load(Acquire) {
            if let Ok(mut items) = self.items.try_lock() {
                self.scan_combine(&mut items, &guard);
            } else {
                thread::yield_now();
            }
        }
        unsafe { (*o.slot.get()).take() }
    }

    /// The combining pass. Caller holds the combiner lock.
    fn scan_combine(&self, items: &mut Vec<T>, guard: &Guard) {
        let mut last_head = Shared::null();
        for _ in 0..self.rounds {
            let head = self.queue.load(Acquire, guard);
            if head == last_head {
                break;
            }

            // Apply everything published since the previous cut.
            let mut retired = Vec::new();
            let mut op = head;
            while op != last_head && !op.is_null() {
                let o = unsafe { op.deref() };
                if !o.ready.load(Acquire) {
                    self.apply(o, items);
                    o.ready.store(true, Release);
                }
                if op != head {
                    retired.push(op);
                }
                op = o.next.load(Acquire, guard);
            }

            // Detach the processed segment. Everything below `head` is
            // now unreachable, including the previous cut point, and can
            // be retired; `head` itself stays linked as the terminator
            // until the next cut.
            unsafe { head.deref() }.next.store(Shared::null(), Release);
            if !last_head.is_null() {
                retired.push(last_head);
            }
            for op in retired {
                unsafe { guard.defer_destroy(op) };
            }
            last_head = head;
        }
    }

    fn apply(&self, op: &Op<T>, items: &mut Vec<T>) {
        let slot = op.slot.get();
        match op.kind {
            Kind::Push => {
                let value = unsafe { (*slot).take() };
                items.push(value.expect("push operation without a value"));
            }
            Kind::Pop => unsafe { *slot = items.pop() },
            Kind::Peek => unsafe { *slot = items.last().cloned() },
        }
    }
}

impl<T: Clone> Stack<T> for FlatCombiningStack<T> {
    fn push(&self, value: T) {
        FlatCombiningStack::push(self, value);
    }

    fn pop(&self) -> Option<T> {
        FlatCombiningStack::pop(self)
    }

    fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        FlatCombiningStack::peek(self)
    }
}

impl<T> Drop for FlatCombiningStack<T> {
    fn drop(&mut self) {
        // Whatever is still linked was processed; free the nodes.
        unsafe {
            let guard = epoch::unprotected();
            let mut op = self.queue.load(Relaxed, guard);
            while !op.is_null() {
                let next = op.deref().next.load(Relaxed, guard);
                drop(Box::from_raw(op.as_raw() as *mut Op<T>));
                op = next;
            }
        }
    }
}

impl<T> Default for FlatCombiningStack<T> {
    fn default() -> FlatCombiningStack<T> {
        FlatCombiningStack::new()
    }
}

impl<T> fmt::Debug for FlatCombiningStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("FlatCombiningStack { .. }")
    }
}
