// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Error types for transaction bodies and for [`atomically`](crate::atomically).
//!
//! There are two layers. Inside a transaction body everything returns
//! [`StmResult`], whose error side is either the retry signal or a user failure. Neither is
//! meant to be handled by hand: propagate them with `?` and let [`Transaction::or_else`],
//! [`Transaction::catch`] or the driver decide what happens. The driver then turns whatever
//! survives into an [`Error`].
//!
//! [`Transaction::or_else`]: crate::Transaction::or_else
//! [`Transaction::catch`]: crate::Transaction::catch

use thiserror::Error;

/// A boxed user error raised from inside a transaction body.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The result type of transaction bodies and of every transactional operation.
pub type StmResult<T> = Result<T, StmError>;

/// Ways a transaction body can stop early.
#[derive(Debug, Error)]
pub enum StmError {
    /// Abandon this attempt and wait until one of the variables it read changes.
    ///
    /// Caught by [`Transaction::or_else`](crate::Transaction::or_else) (which then runs the
    /// alternative) and by the driver (which blocks). It never reaches the caller of
    /// [`atomically`](crate::atomically).
    #[error("transaction requested a retry")]
    Retry,

    /// The body failed with a user error.
    ///
    /// Only surfaces as [`Error::Failed`] if everything the body read was still current when
    /// it failed; otherwise the failure is treated as an artifact of a stale read and the
    /// transaction runs again.
    #[error("transaction body failed")]
    Failure(#[source] BoxError),
}

impl StmError {
    /// Wraps a user error into a [`StmError::Failure`].
    pub fn failure(error: impl Into<BoxError>) -> Self {
        Self::Failure(error.into())
    }

    /// Returns true for the retry signal.
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry)
    }
}

/// Errors returned by [`atomically`](crate::atomically).
#[derive(Debug, Error)]
pub enum Error {
    /// The body retried without having read a single variable, so nothing could ever wake it.
    #[error("transaction blocked indefinitely: it retried without reading any variable")]
    BlockedIndefinitely,

    /// The body failed while all of its reads were still consistent.
    #[error("transaction failed")]
    Failed(#[source] BoxError),
}

impl Error {
    /// Returns the user error of a [`Error::Failed`], if this is one.
    pub fn into_failure(self) -> Option<BoxError> {
        match self {
            Self::Failed(error) => Some(error),
            Self::BlockedIndefinitely => None,
        }
    }
}
