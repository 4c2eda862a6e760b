// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! # tmem: Software Transactional Memory
//!
//! This crate provides optimistic, composable, blocking software transactional memory.
//! Shared state lives in transactional variables ([`TVar`]), and code that reads and writes
//! them runs inside [`atomically`], which makes the whole body appear to happen at a single
//! instant to every other thread.
//!
//! Transaction bodies are ordinary closures over a [`Transaction`] handle. Nothing they write
//! is visible to others until they return and commit, so they may be run more than once; they
//! should not have side effects other than through transactional variables.
//!
//! ## Core Concepts
//!
//! - [`TVar`]: a shared mutable cell that is only changed by committed transactions.
//! - [`atomically`]: runs a body against a private log and commits it all-or-nothing,
//!   running it again when another transaction committed a conflicting change.
//! - [`retry`]: gives up on the current attempt and blocks until one of the variables the
//!   body read changes. This is how transactions wait for a condition.
//! - [`Transaction::or_else`] and [`Transaction::catch`]: run a nested alternative whose
//!   writes are rolled back if it retries or fails.
//! - [`Hamt`]: a hash array mapped trie built from transactional variables, the storage
//!   engine for transactional maps and sets.
//!
//! ## Getting Started: A Bounded Queue
//!
//! ```rust
//! use std::thread;
//! use tmem::{TVar, atomically, guard, retry};
//!
//! let queue = TVar::new(Vec::<u32>::new());
//!
//! let producer = {
//!     let queue = queue.clone();
//!     thread::spawn(move || {
//!         for n in 0..10 {
//!             atomically(|tx| {
//!                 let mut items = queue.read(tx);
//!                 // wait for room
//!                 guard(items.len() < 4)?;
//!                 items.push(n);
//!                 queue.write(tx, items)
//!             })
//!             .unwrap();
//!         }
//!     })
//! };
//!
//! let mut received = Vec::new();
//! while received.len() < 10 {
//!     let n = atomically(|tx| {
//!         let mut items = queue.read(tx);
//!         if items.is_empty() {
//!             return retry();
//!         }
//!         let n = items.remove(0);
//!         queue.write(tx, items)?;
//!         Ok(n)
//!     })
//!     .unwrap();
//!     received.push(n);
//! }
//!
//! producer.join().unwrap();
//! assert_eq!(received, (0..10).collect::<Vec<_>>());
//! ```
//!
//! ## Errors
//!
//! Inside a transaction everything is an [`StmResult`]: either a value or an [`StmError`],
//! which is the retry signal or a user failure. [`atomically`] turns that into an [`Error`]:
//! failures on a consistent view surface as [`Error::Failed`], and a body that retries
//! without having read anything gets [`Error::BlockedIndefinitely`], since nothing could ever
//! wake it.
//!
//! ## Observability
//!
//! The engine emits [`tracing`] events. Each [`atomically`] call runs in a `debug` span
//! carrying the transaction id; conflicts, suspensions and stale nested frames are logged at
//! `debug`, successful commits at `trace`.
//!
//! ## License
//!
//! This project is licensed under either of
//!
//! - Apache License, Version 2.0, ([LICENSE-APACHE](LICENSE-APACHE) or http://www.apache.org/licenses/LICENSE-2.0)
//! - MIT license ([LICENSE-MIT](LICENSE-MIT) or http://opensource.org/licenses/MIT)
//!
//! at your option.
#[cfg(test)]
#[macro_use(quickcheck)]
extern crate quickcheck_macros;

use ahash::RandomState;
use std::{
    hash::BuildHasher,
    sync::atomic::{AtomicBool, Ordering},
};

// Use a constant seed for hashing to make performance benchmarks have less variance.
pub(crate) const DETERMINISTIC_HASHER: RandomState = RandomState::with_seeds(48, 1516, 23, 42);

pub mod error;
pub use error::{BoxError, Error, StmError, StmResult};
pub mod hamt;
pub use hamt::Hamt;
/// Transaction handles, nesting combinators and the [`atomically`] driver.
pub mod transaction;
pub use transaction::{Transaction, atomically};
mod tvar;
pub use tvar::{TVar, VarId};

static ENABLE_DETERMINISM: AtomicBool = AtomicBool::new(false);

/// Makes all hashing behave deterministically.
///
/// This should only be enabled for testing and benchmarking, as it increases the odds of DoS
/// scenarios.
#[doc(hidden)]
pub fn enable_determinism() {
    ENABLE_DETERMINISM.store(true, Ordering::Release);
}

/// Checks if determinism is enabled.
///
/// Should be used internally and for testing.
#[doc(hidden)]
pub fn determinism_enabled() -> bool {
    ENABLE_DETERMINISM.load(Ordering::Acquire)
}

#[inline]
fn make_random_state() -> RandomState {
    if determinism_enabled() {
        DETERMINISTIC_HASHER
    } else {
        RandomState::new()
    }
}

/// A small wrapper around [`ahash::RandomState`] that can be switched to fixed seeds.
///
/// Used for transaction logs and for [`Hamt`] hashing. See [`enable_determinism`].
#[derive(Clone)]
pub struct StmRandomState {
    inner: RandomState,
}

impl Default for StmRandomState {
    #[inline]
    fn default() -> Self {
        Self {
            inner: make_random_state(),
        }
    }
}

impl BuildHasher for StmRandomState {
    type Hasher = <RandomState as BuildHasher>::Hasher;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        self.inner.build_hasher()
    }
}

/// Abandons the current attempt and blocks until a variable it read changes.
///
/// Returning this from a transaction body makes [`atomically`] suspend the calling thread
/// until another transaction commits a change to anything the body read, then run the body
/// again. Inside [`Transaction::or_else`] it instead switches to the alternative.
pub fn retry<T>() -> StmResult<T> {
    Err(StmError::Retry)
}

/// Retries unless `condition` holds.
///
/// ```
/// use tmem::{TVar, atomically, guard};
///
/// let stock = TVar::new(3);
/// atomically(|tx| {
///     let n = stock.read(tx);
///     guard(n > 0)?;
///     stock.write(tx, n - 1)
/// })
/// .unwrap();
/// assert_eq!(stock.read_atomic(), 2);
/// ```
pub fn guard(condition: bool) -> StmResult<()> {
    if condition { Ok(()) } else { retry() }
}

/// Unwraps `option`, retrying on `None`.
pub fn unwrap_or_retry<T>(option: Option<T>) -> StmResult<T> {
    option.map_or_else(retry, Ok)
}

/// Runs `f`, turning a retry into `None`.
///
/// Writes made by `f` before it retried are discarded.
pub fn optionally<T, F>(tx: &mut Transaction, mut f: F) -> StmResult<Option<T>>
where
    F: FnMut(&mut Transaction) -> StmResult<T>,
{
    tx.or_else(|tx| f(tx).map(Some), |_| Ok(None))
}

/// Fails the transaction with `error`.
///
/// [`atomically`] reports it as [`Error::Failed`] unless the body turns out to have run on a
/// stale view, in which case the failure is discarded and the body runs again.
pub fn abort<T>(error: impl Into<BoxError>) -> StmResult<T> {
    Err(StmError::failure(error))
}
