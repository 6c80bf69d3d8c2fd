//! Composable concurrency-control primitives for cooperative async
//! execution.
//!
//! Everything here assumes cooperative, task-based scheduling: code runs
//! until it awaits, so ordering guarantees hold without OS-level mutual
//! exclusion. The types are `Send + Sync` and internally synchronized,
//! but they coordinate *logical* operations, not threads.
//!
//! The toolkit, leaf first:
//!
//! - [`promise`] — a future settled from outside through a [`Resolver`]
//!   handle; first settlement wins.
//! - [`Signal`] — a settle-once broadcast latch any number of futures
//!   can wait on.
//! - [`task`] — abortable work with advisory cancellation, plus
//!   [`all`](task::all) and [`race`](task::race) combinators.
//! - [`Obs`] — synchronous broadcast with isolated listener failures.
//! - [`lock`] — three contention policies over the same idea:
//!   [`ExclusiveLock`] turns contenders away, [`OptimisticLock`] lets
//!   the newest acquisition supersede the current one, and [`QueueLock`]
//!   serializes submissions FIFO.
//!
//! ```
//! use coopsync::lock::QueueLock;
//! use futures_lite::future::block_on;
//!
//! let lock = QueueLock::new();
//! let shared = std::sync::Arc::new(parking_lot::Mutex::new(1));
//!
//! let a = std::sync::Arc::clone(&shared);
//! let add = lock.run(move || async move { *a.lock() += 3 });
//! let b = std::sync::Arc::clone(&shared);
//! let mul = lock.run(move || async move { *b.lock() *= 5 });
//!
//! block_on(async {
//!     add.await.ok();
//!     mul.await.ok();
//! });
//! assert_eq!(*shared.lock(), 20);
//! ```

pub mod error;
pub mod lock;
pub mod obs;
pub mod promise;
pub mod signal;
pub mod task;

pub use error::{Error, ErrorKind, Result};
pub use lock::{ExclusiveLock, OptimisticLock, QueueLock};
pub use obs::{Obs, Pipe, SubId};
pub use promise::{promise, Promise, Resolver};
pub use signal::Signal;
pub use task::{abortable, AbortHandle, AbortStatus, Abortable};
