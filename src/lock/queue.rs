//! Queue lock: unbounded FIFO serialization of async work.
//!
//! [`QueueLock::run`] appends a deferred unit of work and returns a
//! [`Queued`] future for its outcome. A single worker drains the queue in
//! submission order, one task at a time, inside a nested
//! [`ExclusiveLock`] critical section; a second submission while the
//! worker runs merely queues.
//!
//! Built from three smaller primitives: the exclusive lock guarantees the
//! one-worker invariant, a settle-once [`Signal`] marks idleness, and the
//! nested lock's change observable is piped into the queue's own so
//! subscribers see every transition through one stream.
//!
//! # Driving
//!
//! The worker has no thread of its own. [`Queued`] and [`WhenEmpty`]
//! futures drive it cooperatively from their `poll`; the queue makes
//! progress while at least one of them is being awaited. Every such
//! driver registers its waker, and the worker is polled through a waker
//! that fans out to all of them, so a wake meant for the queue reaches
//! every awaited submission, not just the one that happened to poll
//! last. After each task completes the worker emits one change and
//! yields for exactly one tick so subscribers observe the intermediate
//! state before the next task starts.
//!
//! Task panics (in the deferred closure or any poll of its future) are
//! caught, logged, and delivered as that task's rejection; the worker
//! moves on to the next entry.

use crate::error::{Error, Result};
use crate::lock::exclusive::{ExclusiveLock, Running, RunOutcome};
use crate::obs::{Obs, Pipe};
use crate::promise::{promise, Promise, Resolver};
use crate::signal::{Signal, Wait};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Wake, Waker};

type TaskFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// Wakers of the futures currently driving the worker. Slot-keyed like a
/// slab so each driver updates and releases only its own entry.
#[derive(Default)]
struct DriverSet {
    entries: Vec<Option<Waker>>,
    free_slots: SmallVec<[usize; 4]>,
}

impl DriverSet {
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

    /// Clones every registered waker; drivers stay registered so they
    /// can be woken again on the next transition.
    fn wakers(&self) -> Vec<Waker> {
        self.entries.iter().flatten().cloned().collect()
    }
}

struct QueueState {
    pending: VecDeque<TaskFn>,
    /// Set while the queue is idle; replaced with a fresh unset signal
    /// each time a worker run starts.
    finish: Signal,
    /// The live worker run, parked here between drives.
    worker: Option<Running<Worker>>,
    drivers: DriverSet,
}

struct QueueShared {
    state: Mutex<QueueState>,
    critical: ExclusiveLock,
    change: Obs<()>,
    _pipe: Pipe<()>,
}

/// A lock that serializes submitted work in FIFO order.
///
/// Cloning shares the queue, worker and change observable.
#[derive(Clone)]
pub struct QueueLock {
    shared: Arc<QueueShared>,
}

impl Default for QueueLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueueLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueLock")
            .field("length", &self.length())
            .finish()
    }
}

impl QueueLock {
    #[must_use]
    pub fn new() -> Self {
        let critical = ExclusiveLock::new();
        let change = Obs::new();
        let pipe = Obs::pipe(critical.change(), vec![change.clone()]);
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    finish: Signal::new_set(),
                    worker: None,
                    drivers: DriverSet::default(),
                }),
                critical,
                change,
                _pipe: pipe,
            }),
        }
    }

    /// Pending submissions plus one if a task is currently executing.
    #[must_use]
    pub fn length(&self) -> usize {
        self.shared.state.lock().pending.len() + usize::from(self.shared.critical.locked())
    }

    /// Fires on every queue transition: submission, per-task completion,
    /// and worker start/stop (relayed from the nested critical section).
    #[must_use]
    pub fn change(&self) -> &Obs<()> {
        &self.shared.change
    }

    /// Resolves once the queue has fully drained.
    ///
    /// Already settled while the queue is idle. Polling this future also
    /// drives the worker.
    #[must_use]
    pub fn when_empty(&self) -> WhenEmpty {
        let finish = self.shared.state.lock().finish.clone();
        WhenEmpty {
            shared: Arc::clone(&self.shared),
            wait: finish.wait(),
            slot: None,
        }
    }

    /// Submits deferred work to the back of the queue.
    ///
    /// `f` is invoked only when the worker reaches this entry. Emits one
    /// change for the submission and starts the worker if it is not
    /// already running. The returned [`Queued`] settles with the work's
    /// output, or with a rejection if the work panicked.
    pub fn run<B, Fut>(&self, f: B) -> Queued<Fut::Output>
    where
        B: FnOnce() -> Fut + Send + 'static,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let (settled, resolver) = promise();
        let entry: TaskFn = Box::new(move || {
            let task: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(CatchPanic {
                thunk: Some(f),
                body: None,
                resolver: Some(resolver),
            });
            task
        });

        self.shared.state.lock().pending.push_back(entry);
        self.shared.change.emit(&());
        ensure_worker(&self.shared);

        Queued {
            settled,
            shared: Arc::clone(&self.shared),
            slot: None,
        }
    }
}

/// Starts a worker run unless one is already live. Idempotent through the
/// nested exclusive lock.
fn ensure_worker(shared: &Arc<QueueShared>) {
    let worker = Worker {
        shared: Arc::downgrade(shared),
        phase: Phase::Next,
    };
    match shared.critical.run(move || worker) {
        RunOutcome::Ran(running) => {
            let mut state = shared.state.lock();
            state.finish = Signal::new();
            state.worker = Some(running);
        }
        RunOutcome::Busy => {}
    }
}

/// Wakes every registered driver. The worker is always polled through
/// this waker, so a wake aimed at the queue (a task's own wakeup or the
/// worker's one-tick yield) reaches every awaited [`Queued`] and
/// [`WhenEmpty`], not just the driver that polled last.
struct FanOut {
    shared: Weak<QueueShared>,
}

impl Wake for FanOut {
    fn wake(self: Arc<Self>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        // Clone under the lock, wake outside it.
        let wakers = shared.state.lock().drivers.wakers();
        for waker in wakers {
            waker.wake();
        }
    }
}

/// Polls the parked worker. The worker is taken out of the shared state
/// first so its own locking never re-enters.
fn drive(shared: &Arc<QueueShared>) {
    let taken = shared.state.lock().worker.take();
    let Some(mut running) = taken else { return };
    let waker = Waker::from(Arc::new(FanOut {
        shared: Arc::downgrade(shared),
    }));
    let mut cx = Context::from_waker(&waker);
    match Pin::new(&mut running).poll(&mut cx) {
        Poll::Pending => {
            shared.state.lock().worker = Some(running);
        }
        // The run is over; dropping the critical section already emitted
        // the release through the pipe.
        Poll::Ready(()) => {}
    }
}

/// Registers or refreshes one driver's waker slot.
fn register_driver(shared: &QueueShared, slot: &mut Option<usize>, waker: &Waker) {
    let mut state = shared.state.lock();
    match *slot {
        Some(slot) => state.drivers.update(slot, waker),
        None => *slot = Some(state.drivers.register(waker.clone())),
    }
}

/// Releases one driver's waker slot, if it holds one.
fn release_driver(shared: &QueueShared, slot: &mut Option<usize>) {
    if let Some(slot) = slot.take() {
        shared.state.lock().drivers.remove(slot);
    }
}

enum Phase {
    /// About to pop the next entry (or finish if none remain).
    Next,
    /// Executing one entry to completion.
    Driving(Pin<Box<dyn Future<Output = ()> + Send>>),
    /// One-tick pause after a completion so subscribers run.
    Yielding,
}

/// The critical-section body: drains the queue one entry at a time.
struct Worker {
    shared: Weak<QueueShared>,
    phase: Phase,
}

impl Future for Worker {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        loop {
            let Some(shared) = this.shared.upgrade() else {
                return Poll::Ready(());
            };
            match &mut this.phase {
                Phase::Next => {
                    let next = shared.state.lock().pending.pop_front();
                    match next {
                        Some(entry) => this.phase = Phase::Driving(entry()),
                        None => {
                            let finish = shared.state.lock().finish.clone();
                            finish.set();
                            log::trace!(target: "coopsync::lock", "queue drained");
                            return Poll::Ready(());
                        }
                    }
                }
                Phase::Driving(task) => match task.as_mut().poll(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(()) => {
                        this.phase = Phase::Yielding;
                        shared.change.emit(&());
                        // Yield exactly one tick before the next entry.
                        cx.waker().wake_by_ref();
                        return Poll::Pending;
                    }
                },
                Phase::Yielding => {
                    this.phase = Phase::Next;
                }
            }
        }
    }
}

/// Wraps one queued task so neither its construction nor any poll can
/// unwind into the worker loop. The outcome, including a caught panic,
/// goes to the task's resolver.
struct CatchPanic<B, Fut: Future> {
    thunk: Option<B>,
    body: Option<Pin<Box<Fut>>>,
    resolver: Option<Resolver<Fut::Output>>,
}

// Never projects into `thunk`; the body is box-pinned.
impl<B, Fut: Future> Unpin for CatchPanic<B, Fut> {}

impl<B, Fut> CatchPanic<B, Fut>
where
    Fut: Future,
{
    fn fail(&mut self, payload: &(dyn std::any::Any + Send)) {
        let error = Error::panicked(payload);
        log::error!(target: "coopsync::lock", "queued task panicked: {error}");
        if let Some(resolver) = self.resolver.take() {
            resolver.reject(error);
        }
    }
}

impl<B, Fut> Future for CatchPanic<B, Fut>
where
    B: FnOnce() -> Fut,
    Fut: Future,
{
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        if let Some(thunk) = this.thunk.take() {
            match catch_unwind(AssertUnwindSafe(thunk)) {
                Ok(fut) => this.body = Some(Box::pin(fut)),
                Err(payload) => {
                    this.fail(payload.as_ref());
                    return Poll::Ready(());
                }
            }
        }
        let Some(body) = this.body.as_mut() else {
            return Poll::Ready(());
        };
        match catch_unwind(AssertUnwindSafe(|| body.as_mut().poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(value)) => {
                this.body = None;
                if let Some(resolver) = this.resolver.take() {
                    resolver.resolve(value);
                }
                Poll::Ready(())
            }
            Err(payload) => {
                this.body = None;
                this.fail(payload.as_ref());
                Poll::Ready(())
            }
        }
    }
}

/// The outcome of one submission. Polling it drives the worker.
pub struct Queued<T> {
    settled: Promise<T>,
    shared: Arc<QueueShared>,
    slot: Option<usize>,
}

impl<T> Future for Queued<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        register_driver(&this.shared, &mut this.slot, cx.waker());
        drive(&this.shared);
        let outcome = Pin::new(&mut this.settled).poll(cx);
        if outcome.is_ready() {
            release_driver(&this.shared, &mut this.slot);
        }
        outcome
    }
}

impl<T> Drop for Queued<T> {
    fn drop(&mut self) {
        release_driver(&self.shared, &mut self.slot);
    }
}

/// Future for [`QueueLock::when_empty`]. Polling it drives the worker.
pub struct WhenEmpty {
    shared: Arc<QueueShared>,
    wait: Wait,
    slot: Option<usize>,
}

impl Future for WhenEmpty {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        register_driver(&this.shared, &mut this.slot, cx.waker());
        drive(&this.shared);
        let outcome = Pin::new(&mut this.wait).poll(cx);
        if outcome.is_ready() {
            release_driver(&this.shared, &mut this.slot);
        }
        outcome
    }
}

impl Drop for WhenEmpty {
    fn drop(&mut self) {
        release_driver(&self.shared, &mut self.slot);
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

    struct WakeCounter(Arc<AtomicUsize>);
    impl Wake for WakeCounter {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn poll_once<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let waker = Arc::new(NoopWaker).into();
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    fn poll_with<F: Future + Unpin>(fut: &mut F, waker: &Waker) -> Poll<F::Output> {
        let mut cx = Context::from_waker(waker);
        Pin::new(fut).poll(&mut cx)
    }

    /// Polls until ready, bounded so a livelock fails the test instead of
    /// hanging it.
    fn drive_to_ready<F: Future + Unpin>(fut: &mut F) -> F::Output {
        for _ in 0..64 {
            if let Poll::Ready(out) = poll_once(fut) {
                return out;
            }
        }
        unreachable!("future did not resolve within the poll budget");
    }

    #[test]
    fn idle_queue_is_empty_and_settled() {
        let lock = QueueLock::new();
        assert_eq!(lock.length(), 0);
        let mut when_empty = lock.when_empty();
        assert!(poll_once(&mut when_empty).is_ready());
    }

    #[test]
    fn single_submission_resolves_with_its_output() {
        let lock = QueueLock::new();
        let mut queued = lock.run(|| async { 21 * 2 });
        assert_eq!(drive_to_ready(&mut queued).ok(), Some(42));

        // The worker parks between tasks; drain it before checking.
        let mut when_empty = lock.when_empty();
        let () = drive_to_ready(&mut when_empty);
        assert_eq!(lock.length(), 0);
    }

    #[test]
    fn submissions_execute_in_fifo_order() {
        let lock = QueueLock::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for tag in 0..3u32 {
            let order = Arc::clone(&order);
            handles.push(lock.run(move || async move {
                order.lock().push(tag);
            }));
        }
        assert_eq!(lock.length(), 3);

        for mut handle in handles {
            let _ = drive_to_ready(&mut handle);
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn deferred_closure_runs_only_when_reached() {
        let lock = QueueLock::new();
        let started = Arc::new(AtomicUsize::new(0));

        let captured = Arc::clone(&started);
        let mut first = lock.run(move || {
            captured.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        });
        let captured = Arc::clone(&started);
        let _second = lock.run(move || {
            captured.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        });

        // Nothing has been driven: neither closure has been invoked.
        assert_eq!(started.load(Ordering::SeqCst), 0);

        let _ = drive_to_ready(&mut first);
        // Driving the first to completion never constructs the second
        // past its turn; at most it has just been reached.
        assert!(started.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn panicking_task_rejects_its_own_promise_only() {
        let lock = QueueLock::new();
        let mut bad = lock.run(|| async {
            panic!("task exploded");
        });
        let mut good = lock.run(|| async { "fine" });

        let failure = drive_to_ready(&mut bad);
        assert!(matches!(failure, Err(e) if e.is_panic()));
        assert_eq!(drive_to_ready(&mut good).ok(), Some("fine"));
    }

    #[test]
    fn panicking_thunk_rejects_too() {
        let lock = QueueLock::new();
        let mut bad = lock.run(|| -> std::future::Ready<()> {
            panic!("thunk exploded");
        });
        let failure = drive_to_ready(&mut bad);
        assert!(matches!(failure, Err(e) if e.is_panic()));

        let mut when_empty = lock.when_empty();
        let () = drive_to_ready(&mut when_empty);
        assert_eq!(lock.length(), 0);
    }

    #[test]
    fn when_empty_pends_while_work_remains() {
        let lock = QueueLock::new();
        let _queued = lock.run(|| async {});
        let mut when_empty = lock.when_empty();
        // Mid-drain the signal is unset; the worker yields between tasks.
        assert!(poll_once(&mut when_empty).is_pending());
        let () = drive_to_ready(&mut when_empty);
        assert_eq!(lock.length(), 0);
    }

    #[test]
    fn length_counts_executing_task() {
        let lock = QueueLock::new();
        let gate = Signal::new();
        let gate_in_task = gate.clone();
        let mut queued = lock.run(move || async move {
            gate_in_task.wait().await;
        });
        let mut second = lock.run(|| async {});

        assert!(poll_once(&mut queued).is_pending());
        // One executing (blocked on the gate) plus one pending.
        assert_eq!(lock.length(), 2);

        gate.set();
        let _ = drive_to_ready(&mut queued);
        let _ = drive_to_ready(&mut second);
        let mut when_empty = lock.when_empty();
        let () = drive_to_ready(&mut when_empty);
        assert_eq!(lock.length(), 0);
    }

    #[test]
    fn every_driver_is_woken_when_the_worker_advances() {
        let lock = QueueLock::new();
        let gate = Signal::new();
        let gate_in_task = gate.clone();
        let mut first = lock.run(move || async move {
            gate_in_task.wait().await;
        });
        let mut second = lock.run(|| async { "later" });

        let counter = Arc::new(AtomicUsize::new(0));
        let second_waker: Waker = Arc::new(WakeCounter(Arc::clone(&counter))).into();
        assert!(poll_with(&mut second, &second_waker).is_pending());
        // A different driver polls last; its waker must not become the
        // only route back to the second submission.
        assert!(poll_once(&mut first).is_pending());
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        gate.set();
        assert!(counter.load(Ordering::SeqCst) >= 1);

        let _ = drive_to_ready(&mut first);
        assert_eq!(drive_to_ready(&mut second).ok(), Some("later"));
    }

    #[test]
    fn nested_lock_transitions_relay_to_the_queue_observable() {
        let lock = QueueLock::new();
        let count = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&count);
        lock.change().sub(move |()| {
            captured.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let mut queued = lock.run(|| async {});
        // Submission emit plus relayed worker-start emit.
        assert_eq!(count.load(Ordering::SeqCst), 2);

        let _ = drive_to_ready(&mut queued);
        let mut when_empty = lock.when_empty();
        let () = drive_to_ready(&mut when_empty);
        // Task completion emit plus relayed worker-stop emit.
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }
}
