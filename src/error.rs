//! Error types and error handling strategy.
//!
//! Every failure in this crate is locally recoverable and follows a few
//! principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Settlement conflicts (settling a promise twice) are silent no-ops,
//!   never errors
//! - Panics in isolated execution slots (observable listeners, queued
//!   tasks) are caught and converted to [`ErrorKind::Panicked`]
//! - "Cannot run now" on the exclusive lock is a distinguished outcome
//!   variant, not an error

use core::fmt;
use std::any::Any;
use std::sync::Arc;

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Every control handle for a promise was dropped before settlement.
    Unresolved,
    /// An isolated execution slot (listener or queued task) panicked.
    Panicked,
    /// An observable listener could not be invoked because it was already
    /// executing (re-entrant emission into the same listener).
    ListenerBusy,
    /// Internal invariant violation (a bug in this crate).
    Internal,
    /// User-provided error.
    User,
}

impl ErrorKind {
    /// Returns true if this kind represents a caught panic.
    #[must_use]
    pub const fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked)
    }
}

/// The main error type for coopsync operations.
///
/// Carries a kind, an optional human-readable message, and an optional
/// source error. Errors are cheap to clone so a single failure can be
/// delivered to a promise consumer and to a failure-observation hook.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Creates a user-originated error.
    #[must_use]
    pub fn user(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_message(detail)
    }

    /// Creates an internal error (a bug in this crate).
    #[must_use]
    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal).with_message(detail)
    }

    /// Creates an error from a caught panic payload.
    ///
    /// The payload message is extracted when it is a `&str` or `String`
    /// (the overwhelmingly common cases for `panic!`).
    #[must_use]
    pub fn panicked(payload: &(dyn Any + Send)) -> Self {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_owned())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_owned());
        Self::new(ErrorKind::Panicked).with_message(msg)
    }

    /// Returns true if this error represents a caught panic.
    #[must_use]
    pub const fn is_panic(&self) -> bool {
        self.kind.is_panic()
    }

    /// Returns true if this error means the promise could never settle.
    #[must_use]
    pub const fn is_unresolved(&self) -> bool {
        matches!(self.kind, ErrorKind::Unresolved)
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// A specialized Result type for coopsync operations.
pub type Result<T> = core::result::Result<T, Error>;
