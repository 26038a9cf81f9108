//! Randomized exponential backoff for contended retry loops.

use std::hint;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use rand::{thread_rng, Rng};

/// Busy-wait iterations per delay step. Empirical; override with
/// [`Backoff::with_spin`] when it does not fit the workload.
const DEFAULT_SPIN: usize = 10_000;

const DEFAULT_MIN_DELAY: usize = 1;
const DEFAULT_MAX_DELAY: usize = 64;

fn is_multiprocessor() -> bool {
    // 0 = unknown, otherwise the processor count plus one.
    static CPUS: AtomicUsize = AtomicUsize::new(0);
    let mut cpus = CPUS.load(Ordering::Relaxed);
    if cpus == 0 {
        cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1) + 1;
        CPUS.store(cpus, Ordering::Relaxed);
    }
    cpus > 2
}

/// Makes a contended thread step back for a randomized, exponentially
/// growing delay, giving others a chance to finish their transactions.
///
/// Each loop keeps its own `Backoff`; the delay limit doubles on every
/// step until it reaches the configured maximum.
///
/// # Examples
///
/// ```
/// use mcas::Backoff;
///
/// let mut backoff = Backoff::new(1, 16);
/// for _ in 0..4 {
///     backoff.backoff();
/// }
/// ```
#[derive(Debug)]
pub struct Backoff {
    max_delay: usize,
    limit: usize,
    spin: usize,
}

impl Backoff {
    /// Creates a backoff ranging from `min` to `max` delay steps.
    ///
    /// # Panics
    ///
    /// Panics unless `0 < min <= max`.
    pub fn new(min: usize, max: usize) -> Backoff {
        Backoff::with_spin(min, max, DEFAULT_SPIN)
    }

    /// Like [`new`](Backoff::new), with a custom busy-wait multiplier.
    pub fn with_spin(min: usize, max: usize, spin: usize) -> Backoff {
        assert!(min > 0, "minimum delay must be non-zero");
        assert!(min <= max, "minimum delay must not exceed the maximum");
        Backoff {
            max_delay: max,
            limit: min,
            spin,
        }
    }

    /// Waits out one randomized delay step and widens the next one.
    pub fn backoff(&mut self) {
        let delay = thread_rng().gen_range(0..self.limit);
        if self.limit < self.max_delay {
            self.limit *= 2;
        }
        if is_multiprocessor() {
            for _ in 0..delay * self.spin {
                hint::spin_loop();
            }
        } else {
            // Spinning cannot make progress on a single processor.
            thread::yield_now();
        }
    }
}

impl Default for Backoff {
    fn default() -> Backoff {
        Backoff::new(DEFAULT_MIN_DELAY, DEFAULT_MAX_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_saturates() {
        let mut backoff = Backoff::with_spin(1, 8, 0);
        for _ in 0..32 {
            backoff.backoff();
        }
        assert_eq!(backoff.limit, 8);
    }

    #[test]
    #[should_panic(expected = "minimum delay must be non-zero")]
    fn zero_min_rejected() {
        let _ = Backoff::new(0, 8);
    }
}
