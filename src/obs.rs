//! Broadcast observable with synchronous, isolated-failure dispatch.
//!
//! An [`Obs`] holds an ordered set of listeners. [`Obs::emit`] invokes
//! every currently subscribed listener synchronously, in subscription
//! order; a listener that fails (returns an error or panics) is isolated:
//! its failure goes to the observable's error hook and to the emit result
//! list, and the remaining listeners still run.
//!
//! Emission invariants:
//!
//! - the pass membership is fixed when `emit` starts: a listener
//!   subscribed at that moment runs exactly once in the pass, even if it
//!   (or a peer) unsubscribes it mid-pass
//! - a listener subscribed during an emit pass is not invoked in that pass
//!
//! # Example
//!
//! ```
//! use coopsync::Obs;
//!
//! let obs = Obs::<u32>::new();
//! let seen = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
//! let captured = std::sync::Arc::clone(&seen);
//! let id = obs.sub(move |v| {
//!     captured.store(*v, std::sync::atomic::Ordering::SeqCst);
//!     Ok(())
//! });
//! obs.emit(&7);
//! assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 7);
//! obs.unsub(id);
//! obs.emit(&9);
//! assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 7);
//! ```

use crate::error::{Error, ErrorKind, Result};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

type BoxedListener<T> = Box<dyn FnMut(&T) -> Result<()> + Send>;

/// Failure-observation hook invoked for every isolated listener failure.
pub type ErrorHook = Arc<dyn Fn(&Error) + Send + Sync>;

/// Identifies one subscription on one observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubId(u64);

struct ObsInner<T> {
    /// Subscription order is emission order.
    listeners: Vec<(SubId, Arc<Mutex<BoxedListener<T>>>)>,
    next_id: u64,
}

/// A broadcast observable.
///
/// Cloning shares the listener set. All methods take `&self`; listeners
/// may subscribe, unsubscribe and emit on the same observable from inside
/// a listener call.
pub struct Obs<T> {
    inner: Arc<Mutex<ObsInner<T>>>,
    hook: ErrorHook,
}

impl<T> Clone for Obs<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            hook: Arc::clone(&self.hook),
        }
    }
}

impl<T> std::fmt::Debug for Obs<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Obs").field("size", &self.size()).finish()
    }
}

impl<T> Default for Obs<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Obs<T> {
    /// Creates an observable whose error hook logs through [`log`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_error_hook(Arc::new(|error: &Error| {
            log::error!(target: "coopsync::obs", "listener failed: {error}");
        }))
    }

    /// Creates an observable with an injected failure-observation hook.
    ///
    /// The hook sees every isolated listener failure (error returns and
    /// caught panics) before it is pushed to the emit result list.
    #[must_use]
    pub fn with_error_hook(hook: ErrorHook) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ObsInner {
                listeners: Vec::new(),
                next_id: 0,
            })),
            hook,
        }
    }

    /// Subscribes a listener, returning its subscription id.
    pub fn sub(&self, listener: impl FnMut(&T) -> Result<()> + Send + 'static) -> SubId {
        let mut inner = self.inner.lock();
        let id = SubId(inner.next_id);
        inner.next_id += 1;
        inner
            .listeners
            .push((id, Arc::new(Mutex::new(Box::new(listener)))));
        id
    }

    /// Removes a subscription. Returns false if it was already gone.
    pub fn unsub(&self, id: SubId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(lid, _)| *lid != id);
        inner.listeners.len() != before
    }

    /// Returns the number of current subscriptions.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Emits a value to every listener subscribed at the start of the
    /// call, in subscription order, returning one result per listener.
    ///
    /// Mid-pass unsubscription affects later emits, not the one in
    /// flight. Listener failures are isolated: they are reported to the
    /// error hook, captured in the result list, and do not stop the pass.
    pub fn emit(&self, value: &T) -> Vec<Result<()>> {
        // Snapshot fixes the pass membership up front; the inner lock is
        // never held across a listener call.
        let snapshot: Vec<Arc<Mutex<BoxedListener<T>>>> = self
            .inner
            .lock()
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();

        let mut results = Vec::with_capacity(snapshot.len());
        for listener in snapshot {
            let outcome = match listener.try_lock() {
                Some(mut guard) => catch_unwind(AssertUnwindSafe(|| (*guard)(value)))
                    .unwrap_or_else(|payload| Err(Error::panicked(payload.as_ref()))),
                // A listener re-entering emit into itself would deadlock
                // on its own call lock; skip it with an error instead.
                None => Err(Error::new(ErrorKind::ListenerBusy)
                    .with_message("listener re-entered while executing")),
            };
            if let Err(error) = &outcome {
                (self.hook)(error);
            }
            results.push(outcome);
        }
        results
    }

    /// Subscribes a relay on `source` that forwards every emission to
    /// every target.
    ///
    /// The returned [`Pipe`] detaches only this relay; other subscribers
    /// of `source` are unaffected.
    pub fn pipe(source: &Self, targets: Vec<Self>) -> Pipe<T>
    where
        T: 'static,
    {
        let id = source.sub(move |value| {
            for target in &targets {
                target.emit(value);
            }
            Ok(())
        });
        Pipe {
            source: source.clone(),
            id,
        }
    }
}

/// A forwarding relay created by [`Obs::pipe`].
#[derive(Debug)]
pub struct Pipe<T> {
    source: Obs<T>,
    id: SubId,
}

impl<T> Pipe<T> {
    /// Detaches the relay from its source observable.
    pub fn unsub(self) -> bool {
        self.source.unsub(self.id)
    }
}
