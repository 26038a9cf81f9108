//! Dense per-thread id allocation.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

/// Distinguishes pools from each other so a thread can hold an id in
/// several pools at once.
static POOL_SERIAL: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// Ids this thread holds, keyed by pool serial. Pools are few and
    /// long-lived, so a flat list beats a map.
    static IDS: RefCell<Vec<(usize, usize)>> = RefCell::new(Vec::new());
}

/// Hands out dense, stable, 1-based thread ids.
///
/// A pool is sized up front, typically to the processor count, and every
/// participating thread keeps the first id it is given for the pool's
/// lifetime. Structures that index per-thread slots, like the
/// elimination stack, take the pool as an explicit constructor argument.
///
/// There is no reset: ids handed out survive as long as the pool does,
/// and a fresh pool starts a fresh id namespace.
///
/// # Examples
///
/// ```
/// use mcas::ThreadIdPool;
///
/// let pool = ThreadIdPool::new(4);
/// let id = pool.current();
/// assert!(id >= 1 && id <= 4);
/// assert_eq!(pool.current(), id);
/// ```
pub struct ThreadIdPool {
    serial: usize,
    max: usize,
    next: AtomicUsize,
}

impl ThreadIdPool {
    /// Creates a pool handing out ids `1..=max`.
    ///
    /// # Panics
    ///
    /// Panics if `max` is zero.
    pub fn new(max: usize) -> ThreadIdPool {
        assert!(max > 0, "pool capacity must be non-zero");
        ThreadIdPool {
            serial: POOL_SERIAL.fetch_add(1, Ordering::Relaxed),
            max,
            next: AtomicUsize::new(0),
        }
    }

    /// Creates a pool sized to the processor count.
    pub fn with_processors() -> ThreadIdPool {
        let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        ThreadIdPool::new(cpus)
    }

    /// Returns the largest id this pool can hand out.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Returns the calling thread's id in this pool, allocating one on
    /// first use.
    ///
    /// # Panics
    ///
    /// Panics when more than [`max`](ThreadIdPool::max) distinct threads
    /// ask for an id.
    pub fn current(&self) -> usize {
        IDS.with(|ids| {
            let mut ids = ids.borrow_mut();
            if let Some(&(_, id)) = ids.iter().find(|&&(serial, _)| serial == self.serial) {
                return id;
            }
            let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
            assert!(id <= self.max, "thread id pool exhausted");
            ids.push((self.serial, id));
            id
        })
    }
}

impl fmt::Debug for ThreadIdPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadIdPool")
            .field("max", &self.max)
            .finish()
    }
}
