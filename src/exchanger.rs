//! A lock-free, timed two-thread rendez-vous.
//!
//! The exchanger is one tagged atomic slot. The tag is the state stamp:
//!
//! ```text
//! EMPTY ──(producer installs its offer)──▶ WAITING
//! WAITING ──(consumer swaps in its own offer)──▶ BUSY
//! BUSY ──(producer takes the consumer's offer)──▶ EMPTY
//! ```
//!
//! The waiting side spins; there is no parking, so this is meant for
//! short exchanges only.

use std::fmt;
use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

/// Stamp values carried in the slot's tag bits.
const EMPTY: usize = 0;
const WAITING: usize = 1;
const BUSY: usize = 2;

/// Heap cell for an offered value. The padding guarantees tag bits for
/// any `T`.
#[repr(C, align(4))]
struct Offer<T>(T);

/// An error returned from [`Exchanger::exchange`], carrying the value
/// that was not exchanged back to the caller.
#[derive(PartialEq, Eq, Clone, Copy)]
pub enum ExchangeError<T> {
    /// No partner arrived before the deadline.
    Timeout(T),
    /// The exchanger was closed.
    Closed(T),
}

impl<T> ExchangeError<T> {
    /// Unwraps the value that was offered for exchange.
    pub fn into_inner(self) -> T {
        match self {
            ExchangeError::Timeout(v) => v,
            ExchangeError::Closed(v) => v,
        }
    }
}

impl<T> fmt::Debug for ExchangeError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::Timeout(_) => "Timeout(..)".fmt(f),
            ExchangeError::Closed(_) => "Closed(..)".fmt(f),
        }
    }
}

impl<T> fmt::Display for ExchangeError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeError::Timeout(_) => "exchange timed out".fmt(f),
            ExchangeError::Closed(_) => "exchanging on a closed exchanger".fmt(f),
        }
    }
}

impl<T: Send> std::error::Error for ExchangeError<T> {}

/// A rendez-vous point where two threads swap values.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use mcas::{ExchangeError, Exchanger};
///
/// let ex = Exchanger::new();
///
/// // Nobody on the other side: the value comes back.
/// match ex.exchange("hello", Duration::from_millis(1)) {
///     Err(ExchangeError::Timeout(v)) => assert_eq!(v, "hello"),
///     other => panic!("unexpected: {:?}", other),
/// }
/// ```
pub struct Exchanger<T> {
    slot: Atomic<Offer<T>>,
    closed: AtomicBool,
}

unsafe impl<T: Send> Send for Exchanger<T> {}
unsafe impl<T: Send> Sync for Exchanger<T> {}

impl<T> Exchanger<T> {
    /// Creates an exchanger with nobody waiting.
    pub fn new() -> Exchanger<T> {
        Exchanger {
            slot: Atomic::null(),
            closed: AtomicBool::new(false),
        }
    }

    /// Offers `value` and waits up to `timeout` for a partner.
    ///
    /// Returns the partner's value on success. On timeout or closure the
    /// offer is withdrawn and `value` travels back inside the error —
    /// unless a partner claims it during withdrawal, in which case the
    /// exchange completes after all.
    pub fn exchange(&self, value: T, timeout: Duration) -> Result<T, ExchangeError<T>> {
        let guard = epoch::pin();
        let deadline = Instant::now() + timeout;
        let mut our = Owned::new(Offer(value));
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(ExchangeError::Closed(our.into_box().0));
            }
            let cur = self.slot.load(Ordering::Acquire, &guard);
            match cur.tag() {
                EMPTY => {
                    match self.slot.compare_exchange(
                        cur,
                        our.with_tag(WAITING),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        &guard,
                    ) {
                        Ok(installed) => return self.wait(installed, deadline, &guard),
                        Err(e) => our = e.new,
                    }
                }
                WAITING => {
                    // A partner is parked here: swap our offer in and
                    // take theirs.
                    match self.slot.compare_exchange(
                        cur,
                        our.with_tag(BUSY),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        &guard,
                    ) {
                        Ok(_) => return Ok(unsafe { take(cur) }),
                        Err(e) => our = e.new,
                    }
                }
                _ => {
                    // Another pair is completing; stay out of the way.
                    hint::spin_loop();
                }
            }
            if Instant::now() >= deadline {
                return Err(ExchangeError::Timeout(our.into_box().0));
            }
        }
    }

    /// Spin-waits for a partner after our offer was installed.
    fn wait(
        &self,
        our: Shared<'_, Offer<T>>,
        deadline: Instant,
        guard: &Guard,
    ) -> Result<T, ExchangeError<T>> {
        loop {
            let cur = self.slot.load(Ordering::Acquire, guard);
            if cur.tag() == BUSY {
                // Only our own WAITING can have turned BUSY; the slot
                // now holds the partner's offer, and it is ours.
                let theirs = self
                    .slot
                    .swap(Shared::<Offer<T>>::null().with_tag(EMPTY), Ordering::AcqRel, guard);
                return Ok(unsafe { take(theirs) });
            }
            let quit_closed = self.closed.load(Ordering::Acquire);
            if quit_closed || Instant::now() >= deadline {
                // Withdraw the offer; losing the race means a partner
                // claimed it, so finish the exchange instead.
                match self.slot.compare_exchange(
                    our,
                    Shared::<Offer<T>>::null().with_tag(EMPTY),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                ) {
                    Ok(_) => {
                        let value = unsafe { take(our.with_tag(0)) };
                        return if quit_closed {
                            Err(ExchangeError::Closed(value))
                        } else {
                            Err(ExchangeError::Timeout(value))
                        };
                    }
                    Err(_) => continue,
                }
            }
            hint::spin_loop();
        }
    }

    /// Closes the exchanger. Pending and future exchanges fail with
    /// [`ExchangeError::Closed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns `true` if [`close`](Exchanger::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Takes ownership of a claimed offer and moves the value out.
///
/// # Safety
///
/// The caller must be the unique claimant of the offer.
unsafe fn take<T>(offer: Shared<'_, Offer<T>>) -> T {
    (*Box::from_raw(offer.as_raw() as *mut Offer<T>)).0
}

impl<T> Default for Exchanger<T> {
    fn default() -> Exchanger<T> {
        Exchanger::new()
    }
}

impl<T> Drop for Exchanger<T> {
    fn drop(&mut self) {
        // Every exchange withdraws or consumes its offer on the way out,
        // so at rest the slot is empty; be tolerant anyway.
        let slot = unsafe { self.slot.load(Ordering::Relaxed, epoch::unprotected()) };
        if !slot.is_null() {
            drop(unsafe { Box::from_raw(slot.as_raw() as *mut Offer<T>) });
        }
    }
}

impl<T> fmt::Debug for Exchanger<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Exchanger { .. }")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_returns_value() {
        let ex = Exchanger::new();
        match ex.exchange(7, Duration::from_millis(1)) {
            Err(ExchangeError::Timeout(v)) => assert_eq!(v, 7),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn closed_returns_value() {
        let ex = Exchanger::new();
        ex.close();
        assert!(ex.is_closed());
        match ex.exchange(7, Duration::from_millis(1)) {
            Err(ExchangeError::Closed(v)) => assert_eq!(v, 7),
            other => panic!("unexpected: {:?}", other),
        }
    }
}
