//! Overridable lock: every acquisition succeeds by superseding the last.
//!
//! [`OptimisticLock::run`] never rejects and never queues. A new
//! acquisition displaces the current one: the displaced holder's
//! inactivity signal is set (and its [`LockStatus::is_active`] flips to
//! false) before the new holder is installed. Displaced work is never
//! cancelled; it keeps running and decides for itself what losing
//! currency means.
//!
//! Typical use is last-write-wins refresh: each refresh supersedes the
//! in-flight one, which checks `is_active()` before committing.
//!
//! Change emissions per acquisition: one for the supersession (only when
//! a previous holder existed), then one for the installation. Completion
//! of a still-current holder clears the slot with one more emission;
//! completion of a superseded holder emits nothing.

use crate::obs::Obs;
use crate::signal::{Signal, Wait};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

struct Slot {
    generation: u64,
    inactive: Signal,
}

#[derive(Default)]
struct LockInner {
    current: Option<Slot>,
    next_generation: u64,
}

/// A lock where the newest acquisition always wins.
///
/// Cloning shares the lock state and its change observable.
#[derive(Clone, Default)]
pub struct OptimisticLock {
    inner: Arc<Mutex<LockInner>>,
    change: Obs<()>,
}

impl std::fmt::Debug for OptimisticLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticLock")
            .field("locked", &self.locked())
            .finish()
    }
}

impl OptimisticLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while some acquisition is current.
    #[must_use]
    pub fn locked(&self) -> bool {
        self.inner.lock().current.is_some()
    }

    /// Fires on supersession, installation and slot clearing.
    #[must_use]
    pub fn change(&self) -> &Obs<()> {
        &self.change
    }

    /// Acquires the lock, superseding any current holder.
    ///
    /// The displaced holder (if any) is marked inactive and its
    /// `when_inactive` signal set *before* `f` is invoked, so the new
    /// body observes itself as the sole active acquisition from its
    /// first instruction. The returned [`Acquired`] yields the body's
    /// output.
    pub fn run<B, Fut>(&self, f: B) -> Acquired<Fut>
    where
        B: FnOnce(LockStatus) -> Fut,
        Fut: Future,
    {
        let inactive = Signal::new();
        // Displace and install in one critical section: a change listener
        // reentering `run` must find the new slot, never a half-swapped
        // one.
        let (displaced, generation) = {
            let mut inner = self.inner.lock();
            let displaced = inner.current.take();
            let generation = inner.next_generation;
            inner.next_generation += 1;
            inner.current = Some(Slot {
                generation,
                inactive: inactive.clone(),
            });
            (displaced, generation)
        };
        if let Some(previous) = displaced {
            previous.inactive.set();
            self.change.emit(&());
            log::trace!(
                target: "coopsync::lock",
                "optimistic acquisition superseded generation {}",
                previous.generation
            );
        }
        self.change.emit(&());

        let status = LockStatus {
            inner: Arc::clone(&self.inner),
            generation,
            inactive: inactive.clone(),
        };
        Acquired {
            body: f(status),
            finish: Some(Finish {
                inner: Arc::clone(&self.inner),
                change: self.change.clone(),
                generation,
                inactive,
            }),
        }
    }
}

/// One acquisition's view of its own currency.
///
/// Cheap to clone; clones stay readable after the body finishes.
#[derive(Clone)]
pub struct LockStatus {
    inner: Arc<Mutex<LockInner>>,
    generation: u64,
    inactive: Signal,
}

impl LockStatus {
    /// True only while this acquisition is the current one.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner
            .lock()
            .current
            .as_ref()
            .is_some_and(|slot| slot.generation == self.generation)
    }

    /// Resolves when this acquisition is superseded or completes.
    #[must_use]
    pub fn when_inactive(&self) -> Wait {
        self.inactive.wait()
    }
}

struct Finish {
    inner: Arc<Mutex<LockInner>>,
    change: Obs<()>,
    generation: u64,
    inactive: Signal,
}

impl Finish {
    fn finish(self) {
        self.inactive.set();
        let was_current = {
            let mut inner = self.inner.lock();
            match &inner.current {
                Some(slot) if slot.generation == self.generation => {
                    inner.current = None;
                    true
                }
                _ => false,
            }
        };
        if was_current {
            self.change.emit(&());
        }
    }
}

/// A body admitted by [`OptimisticLock::run`]. Yields the body's output;
/// marks the acquisition finished when the body settles or the wrapper
/// is dropped.
#[pin_project::pin_project(PinnedDrop)]
pub struct Acquired<Fut> {
    #[pin]
    body: Fut,
    finish: Option<Finish>,
}

impl<Fut: Future> Future for Acquired<Fut> {
    type Output = Fut::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.body.poll(cx) {
            Poll::Ready(out) => {
                if let Some(finish) = this.finish.take() {
                    finish.finish();
                }
                Poll::Ready(out)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[pin_project::pinned_drop]
impl<Fut> PinnedDrop for Acquired<Fut> {
    fn drop(self: Pin<&mut Self>) {
        if let Some(finish) = self.project().finish.take() {
            finish.finish();
        }
    }
}
