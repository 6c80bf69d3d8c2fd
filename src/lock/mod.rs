//! Lock primitives with three contention policies.
//!
//! All three serialize access to some resource but answer "what happens to
//! the loser?" differently:
//!
//! - [`exclusive`] — the loser is turned away with a [`Busy`] outcome and
//!   must decide for itself whether to retry.
//! - [`optimistic`] — the *previous holder* loses: a new acquisition
//!   always succeeds and supersedes the current one, which is informed
//!   but never cancelled.
//! - [`queue`] — nobody loses: work is queued and executed one at a time
//!   in submission order.
//!
//! Each lock exposes a change observable that fires on every occupancy
//! transition, so callers can watch for a retry window instead of polling.
//!
//! [`Busy`]: exclusive::RunOutcome::Busy

pub mod exclusive;
pub mod optimistic;
pub mod queue;

pub use exclusive::{ExclusiveLock, RunOutcome, Running};
pub use optimistic::{Acquired, LockStatus, OptimisticLock};
pub use queue::{Queued, QueueLock, WhenEmpty};
