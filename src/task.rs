//! Abortable tasks: cooperative, advisory cancellation.
//!
//! [`abortable`] wraps a unit of async work together with an abort flag the
//! work can observe through its [`AbortStatus`]. Aborting is purely
//! advisory: it sets the flag and wakes anyone waiting on it, but never
//! preempts the body. The body decides if and when to wind down.
//!
//! ```text
//!            abortable(|status| async { ... })
//!                 |
//!        +--------+---------+
//!        v                  v
//!   Abortable<F>       AbortHandle
//!   (the future)       (.abort() sets the flag, no-op once done)
//! ```
//!
//! The task is *done* once its future settles or is dropped; aborting a
//! done task is a no-op, so a handle can always be fired safely.
//!
//! [`all`] and [`race`] combine homogeneous task vectors. `race` aborts the
//! losers the moment a winner settles.
//!
//! # Cancel Safety
//!
//! Dropping an [`Abortable`] marks the task done without running the rest
//! of the body. State shared with retained [`AbortStatus`] clones stays
//! readable after the drop.

use crate::signal::{Signal, Wait};
use smallvec::{smallvec, SmallVec};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

#[derive(Debug)]
struct TaskShared {
    aborted: Signal,
    done: AtomicBool,
}

impl TaskShared {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            aborted: Signal::new(),
            done: AtomicBool::new(false),
        })
    }

    fn abort(&self) {
        // Abort-after-done must not trip the flag for status holders.
        if !self.done.load(Ordering::SeqCst) && self.aborted.set() {
            log::trace!(target: "coopsync::task", "task aborted");
        }
    }
}

/// The abort flag as seen from inside the task body.
///
/// Cheap to clone; clones remain readable after the task finishes.
#[derive(Debug, Clone)]
pub struct AbortStatus {
    shared: Arc<TaskShared>,
}

impl AbortStatus {
    /// Returns true once the task has been aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.shared.aborted.is_set()
    }

    /// Resolves when the task is aborted. Never resolves if it is not.
    #[must_use]
    pub fn when_aborted(&self) -> Wait {
        self.shared.aborted.wait()
    }
}

/// Requests cooperative abort of one task (or of every member of a
/// combinator).
#[derive(Debug, Clone)]
pub struct AbortHandle {
    members: SmallVec<[Arc<TaskShared>; 1]>,
}

impl AbortHandle {
    /// Sets the abort flag of every task this handle covers.
    ///
    /// No-op for tasks that are already done.
    pub fn abort(&self) {
        for member in &self.members {
            member.abort();
        }
    }
}

/// Wraps `body` into an abortable task.
///
/// `body` is invoked immediately with the task's [`AbortStatus`] and must
/// return the future to run. The returned [`Abortable`] yields exactly
/// what that future yields; abort only informs, it never changes the
/// output path.
pub fn abortable<B, F>(body: B) -> (Abortable<F>, AbortHandle)
where
    B: FnOnce(AbortStatus) -> F,
    F: Future,
{
    let shared = TaskShared::new();
    let status = AbortStatus {
        shared: Arc::clone(&shared),
    };
    let fut = body(status);
    (
        Abortable {
            body: fut,
            shared: Arc::clone(&shared),
        },
        AbortHandle {
            members: smallvec![shared],
        },
    )
}

/// Future for an abortable task. See [`abortable`].
#[pin_project::pin_project(PinnedDrop)]
pub struct Abortable<F> {
    #[pin]
    body: F,
    shared: Arc<TaskShared>,
}

impl<F> Abortable<F> {
    /// The task's abort flag, for observers outside the body.
    #[must_use]
    pub fn status(&self) -> AbortStatus {
        AbortStatus {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: Future> Future for Abortable<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.body.poll(cx) {
            Poll::Ready(out) => {
                this.shared.done.store(true, Ordering::SeqCst);
                Poll::Ready(out)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[pin_project::pinned_drop]
impl<F> PinnedDrop for Abortable<F> {
    fn drop(self: Pin<&mut Self>) {
        // A dropped task counts as done: later aborts become no-ops.
        self.shared.done.store(true, Ordering::SeqCst);
    }
}

/// Combines tasks so they complete together, collecting outputs
/// positionally. The handle aborts every member at once.
pub fn all<F: Future>(tasks: Vec<Abortable<F>>) -> (All<F>, AbortHandle) {
    let members = tasks.iter().map(|t| Arc::clone(&t.shared)).collect();
    let outputs = tasks.iter().map(|_| None).collect();
    (
        All {
            tasks: tasks.into_iter().map(|t| Some(Box::pin(t))).collect(),
            outputs,
        },
        AbortHandle { members },
    )
}

/// Future for the [`all`] combinator.
pub struct All<F: Future> {
    tasks: Vec<Option<Pin<Box<Abortable<F>>>>>,
    outputs: Vec<Option<F::Output>>,
}

// Members are box-pinned; collected outputs are never pinned.
impl<F: Future> Unpin for All<F> {}

impl<F: Future> Future for All<F> {
    type Output = Vec<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut all_done = true;
        for (slot, output) in this.tasks.iter_mut().zip(this.outputs.iter_mut()) {
            if let Some(task) = slot {
                match task.as_mut().poll(cx) {
                    Poll::Ready(v) => {
                        *output = Some(v);
                        *slot = None;
                    }
                    Poll::Pending => all_done = false,
                }
            }
        }
        if all_done {
            Poll::Ready(this.outputs.iter_mut().flat_map(Option::take).collect())
        } else {
            Poll::Pending
        }
    }
}

/// Combines tasks so the first one to settle wins. The winner's output and
/// index are yielded and every other member is aborted at that moment;
/// when several settle in the same pass, the lowest index wins. The handle
/// aborts every member.
///
/// An empty vector never resolves.
pub fn race<F: Future>(tasks: Vec<Abortable<F>>) -> (Race<F>, AbortHandle) {
    let members: SmallVec<[Arc<TaskShared>; 1]> =
        tasks.iter().map(|t| Arc::clone(&t.shared)).collect();
    (
        Race {
            tasks: tasks.into_iter().map(Box::pin).collect(),
            members: members.clone(),
        },
        AbortHandle { members },
    )
}

/// Future for the [`race`] combinator.
pub struct Race<F: Future> {
    tasks: Vec<Pin<Box<Abortable<F>>>>,
    members: SmallVec<[Arc<TaskShared>; 1]>,
}

impl<F: Future> Future for Race<F> {
    type Output = (F::Output, usize);

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let mut winner: Option<(F::Output, usize)> = None;

        // Every member is polled on every pass, so that each body gets
        // started even when an earlier sibling settles in the same pass.
        for (i, task) in this.tasks.iter_mut().enumerate() {
            if let Poll::Ready(v) = task.as_mut().poll(cx) {
                if winner.is_none() {
                    winner = Some((v, i));
                }
            }
        }

        if let Some((value, index)) = winner {
            for (i, member) in this.members.iter().enumerate() {
                if i != index {
                    member.abort();
                }
            }
            return Poll::Ready((value, index));
        }
        Poll::Pending
    }
}
