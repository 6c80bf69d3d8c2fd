//! Exclusive lock: one operation at a time, contenders turned away.
//!
//! [`ExclusiveLock::run`] either admits the caller's operation or returns
//! [`RunOutcome::Busy`] without invoking it. Contenders are never queued;
//! the change observable fires on every occupancy flip, so a rejected
//! caller can subscribe and retry when the holder releases.
//!
//! Exactly two change emissions per successful cycle: one on acquire, one
//! on release. A `Busy` rejection emits nothing.
//!
//! # Cancel Safety
//!
//! The admitted operation runs inside [`Running`], which releases the lock
//! when the body settles or when `Running` is dropped. The lock cannot be
//! left held by an abandoned future.

use crate::obs::Obs;
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Outcome of [`ExclusiveLock::run`]. Callers must branch; there is no
/// implicit wait.
#[must_use]
pub enum RunOutcome<Fut> {
    /// The operation was admitted; await the wrapper to completion.
    Ran(Running<Fut>),
    /// Another operation holds the lock; the closure was not invoked.
    Busy,
}

impl<Fut> RunOutcome<Fut> {
    /// Returns the admitted operation, if any.
    pub fn ran(self) -> Option<Running<Fut>> {
        match self {
            Self::Ran(running) => Some(running),
            Self::Busy => None,
        }
    }

    /// Returns true if the lock turned the caller away.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }
}

/// A lock admitting at most one operation, rejecting the rest.
///
/// Cloning shares the lock state and its change observable.
#[derive(Clone, Default)]
pub struct ExclusiveLock {
    held: Arc<Mutex<bool>>,
    change: Obs<()>,
}

impl std::fmt::Debug for ExclusiveLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExclusiveLock")
            .field("locked", &self.locked())
            .finish()
    }
}

impl ExclusiveLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while an operation holds the lock.
    #[must_use]
    pub fn locked(&self) -> bool {
        *self.held.lock()
    }

    /// Fires on every occupancy flip (idle to held and back).
    #[must_use]
    pub fn change(&self) -> &Obs<()> {
        &self.change
    }

    /// Attempts to admit an operation.
    ///
    /// If the lock is idle it flips to held, emits one change, invokes
    /// `f` for the body future and returns [`RunOutcome::Ran`]. If held,
    /// returns [`RunOutcome::Busy`] without invoking `f` or emitting.
    pub fn run<B, Fut>(&self, f: B) -> RunOutcome<Fut>
    where
        B: FnOnce() -> Fut,
        Fut: Future,
    {
        {
            let mut held = self.held.lock();
            if *held {
                return RunOutcome::Busy;
            }
            *held = true;
        }
        // Emit with the flag lock released.
        self.change.emit(&());
        log::trace!(target: "coopsync::lock", "exclusive lock acquired");
        RunOutcome::Ran(Running {
            body: f(),
            release: Some(Release {
                held: Arc::clone(&self.held),
                change: self.change.clone(),
            }),
        })
    }
}

struct Release {
    held: Arc<Mutex<bool>>,
    change: Obs<()>,
}

impl Release {
    fn release(self) {
        *self.held.lock() = false;
        self.change.emit(&());
        log::trace!(target: "coopsync::lock", "exclusive lock released");
    }
}

/// An admitted operation. Yields the body's output; releases the lock
/// when the body settles or the wrapper is dropped.
#[pin_project::pin_project(PinnedDrop)]
pub struct Running<Fut> {
    #[pin]
    body: Fut,
    release: Option<Release>,
}

impl<Fut: Future> Future for Running<Fut> {
    type Output = Fut::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.body.poll(cx) {
            Poll::Ready(out) => {
                if let Some(release) = this.release.take() {
                    release.release();
                }
                Poll::Ready(out)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[pin_project::pinned_drop]
impl<Fut> PinnedDrop for Running<Fut> {
    fn drop(self: Pin<&mut Self>) {
        if let Some(release) = self.project().release.take() {
            release.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::task::Wake;

    struct NoopWaker;
    impl Wake for NoopWaker {
        fn wake(self: Arc<Self>) {}
    }

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let waker = Arc::new(NoopWaker).into();
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    fn emission_counter(lock: &ExclusiveLock) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&count);
        lock.change().sub(move |()| {
            captured.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        count
    }

    #[test]
    fn admits_when_idle() {
        let lock = ExclusiveLock::new();
        let outcome = lock.run(|| async { 7 });
        let Some(running) = outcome.ran() else {
            unreachable!("idle lock must admit");
        };
        assert!(lock.locked());
        let mut running = Box::pin(running);
        assert!(matches!(poll_once(&mut running), Poll::Ready(7)));
        assert!(!lock.locked());
    }

    #[test]
    fn contender_is_turned_away_without_invocation() {
        let lock = ExclusiveLock::new();
        // Bind the admitted wrapper so the lock stays held.
        let first = lock.run(|| std::future::pending::<()>());
        assert!(!first.is_busy());

        let invoked = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&invoked);
        let second = lock.run(move || {
            captured.fetch_add(1, Ordering::SeqCst);
            async {}
        });
        assert!(second.is_busy());
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn two_emissions_per_cycle_and_none_for_busy() {
        let lock = ExclusiveLock::new();
        let count = emission_counter(&lock);

        let Some(running) = lock.run(|| async {}).ran() else {
            unreachable!("idle lock must admit");
        };
        assert_eq!(count.load(Ordering::SeqCst), 1);

        assert!(lock.run(|| async {}).is_busy());
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let mut running = Box::pin(running);
        let _ = poll_once(&mut running);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dropping_the_running_wrapper_releases() {
        let lock = ExclusiveLock::new();
        let count = emission_counter(&lock);

        let running = lock.run(|| std::future::pending::<()>()).ran();
        assert!(lock.locked());
        drop(running);
        assert!(!lock.locked());
        assert_eq!(count.load(Ordering::SeqCst), 2);

        assert!(matches!(lock.run(|| async {}), RunOutcome::Ran(_)));
    }

    #[test]
    fn release_happens_once_even_if_dropped_after_ready() {
        let lock = ExclusiveLock::new();
        let count = emission_counter(&lock);

        let Some(running) = lock.run(|| async { 1 }).ran() else {
            unreachable!("idle lock must admit");
        };
        let mut running = Box::pin(running);
        assert!(poll_once(&mut running).is_ready());
        drop(running);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
