//! An elimination-backoff stack.
//!
//! A Treiber stack backed by an elimination array with one slot per
//! thread id. A thread that loses the CAS on the top pointer publishes
//! its operation in its own slot, picks a random partner, and tries to
//! collide: a concurrent push and pop cancel each other out and finish
//! without ever touching the top.
//!
//! A collision has an active and a passive side. The active side swaps
//! its own cell into the partner's slot; the passive side, failing to
//! withdraw its cell, finds the active's cell in its place and consumes
//! it. Unique thread ids bound the array occupancy and give every thread
//! a slot of its own.

use std::fmt;
use std::hint;
use std::ptr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_utils::CachePadded;
use rand::{thread_rng, Rng};

use crate::stack::treiber::{try_pop, Node};
use crate::stack::Stack;
use crate::thread_id::ThreadIdPool;

/// Bounded wait for a partner, in spin steps.
const SPIN_LIMIT: usize = 10_000;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Operation {
    Push,
    Pop,
}

/// A published elimination attempt.
struct Cell<T> {
    /// Slot index this cell was published at.
    owner: usize,
    operation: Operation,
    /// The node on offer; null for pop cells.
    node: Atomic<Node<T>>,
    /// Set by an active collider so the publisher stops spinning early.
    wakeup: AtomicBool,
}

/// A lock-free stack that eliminates colliding pushes and pops.
///
/// The elimination array is indexed by dense thread ids, so the stack
/// needs a [`ThreadIdPool`] covering every thread that will touch it.
///
/// # Examples
///
/// ```
/// use mcas::EliminationStack;
///
/// let stack = EliminationStack::new();
/// stack.push(1);
/// assert_eq!(stack.pop(), Some(1));
/// assert_eq!(stack.pop(), None);
/// ```
pub struct EliminationStack<T> {
    top: CachePadded<Atomic<Node<T>>>,
    slots: Box<[Atomic<Cell<T>>]>,
    pool: Arc<ThreadIdPool>,
}

impl<T> EliminationStack<T> {
    /// Creates a stack with a fresh thread id pool sized to the
    /// processor count.
    pub fn new() -> EliminationStack<T> {
        EliminationStack::with_thread_ids(Arc::new(ThreadIdPool::with_processors()))
    }

    /// Creates a stack whose elimination array is indexed by ids from
    /// `pool`.
    pub fn with_thread_ids(pool: Arc<ThreadIdPool>) -> EliminationStack<T> {
        let slots = (0..pool.max()).map(|_| Atomic::null()).collect();
        EliminationStack {
            top: CachePadded::new(Atomic::null()),
            slots,
            pool,
        }
    }

    /// Pushes a value on top of the stack.
    pub fn push(&self, value: T) {
        let guard = epoch::pin();
        let node = Owned::new(Node::new(value)).into_shared(&guard);
        loop {
            let head = self.top.load(Relaxed, &guard);
            unsafe { node.deref() }.next.store(head, Relaxed);
            if self
                .top
                .compare_exchange(head, node, Release, Relaxed, &guard)
                .is_ok()
            {
                return;
            }
            if self.eliminate(Operation::Push, node, &guard).is_some() {
                // A popper took the node off our hands.
                return;
            }
        }
    }

    /// Attempts to pop the top value.
    ///
    /// Returns `None` if the stack is observed empty.
    pub fn pop(&self) -> Option<T> {
        let guard = epoch::pin();
        loop {
            if let Ok(value) = try_pop(&self.top, &guard) {
                return value;
            }
            if let Some(node) = self.eliminate(Operation::Pop, Shared::null(), &guard) {
                debug_assert!(!node.is_null());
                unsafe {
                    let value = ptr::read(&*node.deref().value);
                    guard.defer_destroy(node);
                    return Some(value);
                }
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
        let head = self.top.load(Acquire, &guard);
        unsafe { head.as_ref() }.map(|h| T::clone(&h.value))
    }

    /// Returns `true` if the stack is observed empty.
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        self.top.load(Acquire, &guard).is_null()
    }

    /// One elimination attempt.
    ///
    /// For a push, `node` is the node on offer and `Some` means a popper
    /// took it. For a pop, `node` is null and `Some` carries the matched
    /// pusher's node. `None` means no collision; retry the top.
    fn eliminate<'g>(
        &self,
        operation: Operation,
        node: Shared<'g, Node<T>>,
        guard: &'g Guard,
    ) -> Option<Shared<'g, Node<T>>> {
        let idx = self.pool.current() - 1;
        let cell = Cell {
            owner: idx,
            operation,
            node: Atomic::null(),
            wakeup: AtomicBool::new(false),
        };
        cell.node.store(node, Relaxed);
        let cell = Owned::new(cell).into_shared(guard);
        self.slots[idx].store(cell, Release);

        if let Some((p_idx, p_cell)) = self.pick_partner(idx, guard) {
            if unsafe { p_cell.deref() }.operation != operation {
                // Withdraw our cell so it cannot be matched twice, then
                // go after the partner.
                return match self.withdraw(cell, idx, guard) {
                    Err(theirs) => self.passive_collide(operation, theirs, idx, guard),
                    Ok(()) => {
                        if let Some(result) =
                            self.active_collide(operation, cell, p_idx, p_cell, guard)
                        {
                            Some(result)
                        } else {
                            // Never reinstalled anywhere; ours to retire.
                            unsafe { guard.defer_destroy(cell) };
                            None
                        }
                    }
                };
            }
        }

        // Nobody suitable right now; wait briefly for a collider.
        self.spin(unsafe { cell.deref() });
        match self.withdraw(cell, idx, guard) {
            Ok(()) => {
                unsafe { guard.defer_destroy(cell) };
                None
            }
            Err(theirs) => self.passive_collide(operation, theirs, idx, guard),
        }
    }

    /// Removes our cell from our slot. `Err` carries the foreign cell an
    /// active collider left in its place.
    fn withdraw<'g>(
        &self,
        cell: Shared<'g, Cell<T>>,
        idx: usize,
        guard: &'g Guard,
    ) -> Result<(), Shared<'g, Cell<T>>> {
        match self.slots[idx].compare_exchange(cell, Shared::null(), Release, Acquire, guard) {
            Ok(_) => Ok(()),
            Err(e) => Err(e.current),
        }
    }

    /// Installs our withdrawn cell into the partner's slot.
    fn active_collide<'g>(
        &self,
        operation: Operation,
        our: Shared<'g, Cell<T>>,
        p_idx: usize,
        p_cell: Shared<'g, Cell<T>>,
        guard: &'g Guard,
    ) -> Option<Shared<'g, Node<T>>> {
        if self.slots[p_idx]
            .compare_exchange(p_cell, our, Release, Acquire, guard)
            .is_err()
        {
            return None;
        }
        // We unlinked the partner's cell; consume it and retire it. The
        // partner finds our cell in its slot and completes passively.
        let p = unsafe { p_cell.deref() };
        let result = if operation == Operation::Pop {
            let node = p.node.load(Acquire, guard);
            p.wakeup.store(true, Release);
            node
        } else {
            Shared::null()
        };
        unsafe { guard.defer_destroy(p_cell) };
        Some(result)
    }

    /// Consumes the active collider's cell found in our own slot.
    fn passive_collide<'g>(
        &self,
        operation: Operation,
        theirs: Shared<'g, Cell<T>>,
        idx: usize,
        guard: &'g Guard,
    ) -> Option<Shared<'g, Node<T>>> {
        if self.slots[idx]
            .compare_exchange(theirs, Shared::null(), Release, Acquire, guard)
            .is_err()
        {
            return None;
        }
        let t = unsafe { theirs.deref() };
        let result = if operation == Operation::Pop {
            t.node.load(Acquire, guard)
        } else {
            Shared::null()
        };
        unsafe { guard.defer_destroy(theirs) };
        Some(result)
    }

    /// Picks a random occupied slot other than our own. Foreign cells
    /// parked in a slot they do not own are skipped.
    fn pick_partner<'g>(
        &self,
        idx: usize,
        guard: &'g Guard,
    ) -> Option<(usize, Shared<'g, Cell<T>>)> {
        let len = self.slots.len();
        if len <= 1 {
            return None;
        }
        let p_idx = loop {
            let j = thread_rng().gen_range(0..len);
            if j != idx {
                break j;
            }
        };
        let p_cell = self.slots[p_idx].load(Acquire, guard);
        match unsafe { p_cell.as_ref() } {
            Some(p) if p.owner == p_idx => Some((p_idx, p_cell)),
            _ => None,
        }
    }

    fn spin(&self, cell: &Cell<T>) {
        for _ in 0..SPIN_LIMIT {
            if cell.wakeup.load(Acquire) {
                break;
            }
            hint::spin_loop();
        }
    }
}

impl<T> Stack<T> for EliminationStack<T> {
    fn push(&self, value: T) {
        EliminationStack::push(self, value);
    }

    fn pop(&self) -> Option<T> {
        EliminationStack::pop(self)
    }

    fn peek(&self) -> Option<T>
    where
        T: Clone,
    {
        EliminationStack::peek(self)
    }
}

impl<T> Drop for EliminationStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl<T> Default for EliminationStack<T> {
    fn default() -> EliminationStack<T> {
        EliminationStack::new()
    }
}

impl<T> fmt::Debug for EliminationStack<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("EliminationStack { .. }")
    }
}
