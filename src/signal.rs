//! Settle-once broadcast latch.
//!
//! [`Signal`] is the `()`-valued counterpart of [`promise`](crate::promise):
//! it settles exactly once ([`Signal::set`]) and any number of waiters can
//! observe the settlement, before or after it happens. It backs the
//! `when_aborted`, `when_inactive` and queue-idle signals of the higher
//! primitives.
//!
//! # Cancel Safety
//!
//! `wait().await` is cancel-safe: a waiter dropped before the signal is
//! set releases its waker slot.

use parking_lot::Mutex;
use smallvec::SmallVec;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Slab-like storage for waiter wakers that reuses freed slots, so waiters
/// that come and go (e.g. race losers) do not grow the vector unboundedly.
#[derive(Debug, Default)]
struct WaiterSlab {
    entries: Vec<Option<Waker>>,
    /// Free-slot indices for reuse. SmallVec<4> avoids heap allocation for
    /// the common case of few concurrent waiters.
    free_slots: SmallVec<[usize; 4]>,
}

impl WaiterSlab {
    fn register(&mut self, waker: Waker) -> usize {
        if let Some(slot) = self.free_slots.pop() {
            self.entries[slot] = Some(waker);
            slot
        } else {
            self.entries.push(Some(waker));
            self.entries.len() - 1
        }
    }

    fn update(&mut self, slot: usize, waker: &Waker) {
        match &self.entries[slot] {
            Some(existing) if existing.will_wake(waker) => {}
            _ => self.entries[slot] = Some(waker.clone()),
        }
    }

    fn remove(&mut self, slot: usize) {
        if self.entries[slot].take().is_some() {
            self.free_slots.push(slot);
        }
    }

    fn drain(&mut self) -> Vec<Waker> {
        self.free_slots.clear();
        self.entries.drain(..).flatten().collect()
    }
}

#[derive(Debug, Default)]
struct SignalInner {
    set: bool,
    waiters: WaiterSlab,
}

/// A settle-once broadcast latch.
///
/// Cloning shares the latch. Once [`set`](Self::set), it stays set forever
/// and every current and future [`wait`](Self::wait) completes immediately.
///
/// # Example
///
/// ```
/// use coopsync::Signal;
///
/// let signal = Signal::new();
/// assert!(!signal.is_set());
/// assert!(signal.set());
/// assert!(!signal.set()); // idempotent
/// futures_lite::future::block_on(signal.wait());
/// ```
#[derive(Debug, Clone, Default)]
pub struct Signal {
    inner: Arc<Mutex<SignalInner>>,
}

impl Signal {
    /// Creates a new, unset signal.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a signal that is already set.
    #[must_use]
    pub fn new_set() -> Self {
        let signal = Self::new();
        signal.set();
        signal
    }

    /// Sets the signal, waking every registered waiter.
    ///
    /// Returns true if this call flipped the signal, false if it was
    /// already set (idempotent no-op).
    pub fn set(&self) -> bool {
        // Take wakers under the lock, wake outside it.
        let wakers = {
            let mut inner = self.inner.lock();
            if inner.set {
                return false;
            }
            inner.set = true;
            inner.waiters.drain()
        };
        for waker in wakers {
            waker.wake();
        }
        true
    }

    /// Returns true if the signal has been set.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.lock().set
    }

    /// Returns a future that completes once the signal is set.
    ///
    /// Completes immediately if the signal is already set. Any number of
    /// waits may be outstanding at once.
    #[must_use]
    pub fn wait(&self) -> Wait {
        Wait {
            signal: self.clone(),
            slot: None,
        }
    }
}

/// Future returned by [`Signal::wait`].
#[derive(Debug)]
pub struct Wait {
    signal: Signal,
    /// This waiter's slot in the slab, once registered.
    slot: Option<usize>,
}

impl Future for Wait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut inner = this.signal.inner.lock();

        if inner.set {
            // Slots were drained by `set`; nothing to release.
            this.slot = None;
            return Poll::Ready(());
        }

        match this.slot {
            Some(slot) => inner.waiters.update(slot, cx.waker()),
            None => this.slot = Some(inner.waiters.register(cx.waker().clone())),
        }
        Poll::Pending
    }
}

impl Drop for Wait {
    fn drop(&mut self) {
        // If dropped while pending (e.g. a race loser), release the slot
        // so it can be reused.
        if let Some(slot) = self.slot.take() {
            let mut inner = self.signal.inner.lock();
            if !inner.set {
                inner.waiters.remove(slot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;

    struct WakeCounter(Arc<AtomicUsize>);
    impl Wake for WakeCounter {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_waker() -> (Waker, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        (Arc::new(WakeCounter(Arc::clone(&counter))).into(), counter)
    }

    fn poll_wait(wait: &mut Wait, waker: &Waker) -> Poll<()> {
        let mut cx = Context::from_waker(waker);
        Pin::new(wait).poll(&mut cx)
    }

    #[test]
    fn set_is_idempotent() {
        let signal = Signal::new();
        assert!(signal.set());
        assert!(!signal.set());
        assert!(signal.is_set());
    }

    #[test]
    fn wait_after_set_is_immediate() {
        let signal = Signal::new_set();
        let (waker, counter) = counting_waker();
        let mut wait = signal.wait();
        assert!(poll_wait(&mut wait, &waker).is_ready());
        // Never registered, so never woken.
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn every_waiter_is_woken_exactly_once() {
        let signal = Signal::new();
        let (waker_a, counter_a) = counting_waker();
        let (waker_b, counter_b) = counting_waker();
        let mut wait_a = signal.wait();
        let mut wait_b = signal.wait();

        assert!(poll_wait(&mut wait_a, &waker_a).is_pending());
        assert!(poll_wait(&mut wait_b, &waker_b).is_pending());

        signal.set();
        assert_eq!(counter_a.load(Ordering::SeqCst), 1);
        assert_eq!(counter_b.load(Ordering::SeqCst), 1);

        assert!(poll_wait(&mut wait_a, &waker_a).is_ready());
        assert!(poll_wait(&mut wait_b, &waker_b).is_ready());

        // Setting again wakes nobody.
        signal.set();
        assert_eq!(counter_a.load(Ordering::SeqCst), 1);
        assert_eq!(counter_b.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropped_waiter_frees_its_slot() {
        let signal = Signal::new();
        let (waker, counter) = counting_waker();

        let mut wait = signal.wait();
        assert!(poll_wait(&mut wait, &waker).is_pending());
        drop(wait);

        // The freed slot is reused by the next waiter.
        let mut other = signal.wait();
        assert!(poll_wait(&mut other, &waker).is_pending());
        assert_eq!(other.slot, Some(0));

        signal.set();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repolling_does_not_leak_slots() {
        let signal = Signal::new();
        let (waker, _counter) = counting_waker();

        let mut wait = signal.wait();
        assert!(poll_wait(&mut wait, &waker).is_pending());
        assert!(poll_wait(&mut wait, &waker).is_pending());
        assert_eq!(signal.inner.lock().waiters.entries.len(), 1);
    }

    #[test]
    fn clones_share_state() {
        let a = Signal::new();
        let b = a.clone();
        a.set();
        assert!(b.is_set());
    }
}
