//! Externally settled futures.
//!
//! A [`Promise`] is a future whose settlement is triggered by code holding
//! a separate [`Resolver`] handle, not by the future's own body:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      PROMISE SETTLEMENT                      │
//! │                                                              │
//! │   Resolver                              Promise              │
//! │     │                                      │                 │
//! │     │─── resolve(v) ─────────────────────► │ await ──► Ok(v) │
//! │     │─── reject(e) ──────────────────────► │ await ──► Err(e)│
//! │     │                                      │                 │
//! │   (all dropped) ─────────────────────────► │ await ──► Err   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Settle-once
//!
//! The first `resolve` or `reject` call (of either kind) wins; every later
//! call is a silent no-op. Settlement never fails and never panics.
//!
//! # Example
//!
//! ```
//! use coopsync::promise;
//!
//! let (future, control) = promise::<u32>();
//! control.resolve(42);
//! control.reject(coopsync::Error::user("too late")); // no-op
//! let value = futures_lite::future::block_on(future);
//! assert_eq!(value.unwrap(), 42);
//! ```

use crate::error::{Error, ErrorKind, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

/// Shared state between a [`Promise`] and its [`Resolver`] handles.
#[derive(Debug)]
struct PromiseInner<T> {
    /// The settled outcome, until the consumer takes it.
    outcome: Option<Result<T>>,
    /// Whether a settlement was accepted (stays true after the outcome
    /// is taken).
    settled: bool,
    /// Whether the consumer already took the outcome.
    taken: bool,
    /// Number of live `Resolver` handles.
    resolvers: usize,
    /// The consumer's registered waker.
    waker: Option<Waker>,
}

impl<T> PromiseInner<T> {
    fn new() -> Self {
        Self {
            outcome: None,
            settled: false,
            taken: false,
            resolvers: 1,
            waker: None,
        }
    }

    /// Returns true if no settlement can ever arrive.
    fn is_orphaned(&self) -> bool {
        self.resolvers == 0 && !self.settled
    }

    /// Accepts a settlement if none was accepted yet.
    ///
    /// Returns the waker to invoke (outside the lock) when this call won.
    fn settle(&mut self, outcome: Result<T>) -> Option<Waker> {
        if self.settled {
            return None;
        }
        self.settled = true;
        self.outcome = Some(outcome);
        self.waker.take()
    }
}

/// Creates an externally settled future, returning the future and its
/// control handle.
///
/// # Example
///
/// ```
/// let (future, control) = coopsync::promise::<&str>();
/// control.resolve("done");
/// assert!(control.is_settled());
/// ```
#[must_use]
pub fn promise<T>() -> (Promise<T>, Resolver<T>) {
    let inner = Arc::new(Mutex::new(PromiseInner::new()));
    (
        Promise {
            inner: Arc::clone(&inner),
        },
        Resolver { inner },
    )
}

/// The control handle of a [`Promise`].
///
/// Cloneable; any clone may settle. Only the first `resolve`/`reject`
/// across all clones has an effect. If every clone is dropped without
/// settling, the promise settles with [`ErrorKind::Unresolved`] so the
/// consumer never hangs on an unreachable value.
#[derive(Debug)]
pub struct Resolver<T> {
    inner: Arc<Mutex<PromiseInner<T>>>,
}

impl<T> Resolver<T> {
    /// Settles the promise with a success value.
    ///
    /// Returns true if this call settled the promise, false if it was a
    /// no-op because a settlement already happened.
    pub fn resolve(&self, value: T) -> bool {
        self.settle(Ok(value))
    }

    /// Settles the promise with an error.
    ///
    /// Returns true if this call settled the promise, false if it was a
    /// no-op because a settlement already happened.
    pub fn reject(&self, error: Error) -> bool {
        self.settle(Err(error))
    }

    /// Returns true if the promise has settled (by any handle).
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.inner.lock().settled
    }

    fn settle(&self, outcome: Result<T>) -> bool {
        // Take the waker under the lock, wake outside it, so an
        // inline-polling executor cannot deadlock against us.
        let (won, waker) = {
            let mut inner = self.inner.lock();
            let already = inner.settled;
            let waker = inner.settle(outcome);
            (!already, waker)
        };
        if let Some(waker) = waker {
            waker.wake();
        }
        won
    }
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        self.inner.lock().resolvers += 1;
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        let waker = {
            let mut inner = self.inner.lock();
            inner.resolvers -= 1;
            if inner.is_orphaned() {
                inner.waker.take()
            } else {
                None
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

/// The consuming half of an externally settled future.
///
/// Yields `Ok(value)` on `resolve`, `Err(error)` on `reject`, and
/// `Err(ErrorKind::Unresolved)` when every [`Resolver`] was dropped
/// without settling.
#[derive(Debug)]
pub struct Promise<T> {
    inner: Arc<Mutex<PromiseInner<T>>>,
}

impl<T> Promise<T> {
    /// Returns true if a settlement has been accepted.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.inner.lock().settled
    }

    /// Attempts to take the outcome without waiting.
    ///
    /// Returns `None` while the promise is pending and some resolver is
    /// still alive.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        let mut inner = self.inner.lock();
        if let Some(outcome) = inner.outcome.take() {
            inner.taken = true;
            inner.waker = None;
            return Some(outcome);
        }
        if inner.is_orphaned() {
            return Some(Err(Error::new(ErrorKind::Unresolved)));
        }
        None
    }
}

impl<T> Future for Promise<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.inner.lock();

        if let Some(outcome) = inner.outcome.take() {
            inner.taken = true;
            inner.waker = None;
            return Poll::Ready(outcome);
        }

        if inner.taken {
            // Polled again after yielding the outcome.
            return Poll::Ready(Err(Error::internal("promise polled after completion")));
        }

        if inner.is_orphaned() {
            inner.waker = None;
            return Poll::Ready(Err(Error::new(ErrorKind::Unresolved)));
        }

        // Register the waker, skipping the clone when unchanged.
        match &inner.waker {
            Some(existing) if existing.will_wake(cx.waker()) => {}
            _ => inner.waker = Some(cx.waker().clone()),
        }
        Poll::Pending
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        // Don't retain stale executor state if dropped while pending.
        self.inner.lock().waker = None;
    }
}
