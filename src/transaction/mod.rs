// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! The transaction handle and its nested combinators.
//!
//! A transaction body receives a `&mut` [`Transaction`] and does all of its reads and writes
//! through it. Nothing is written to shared state until the body returns and the driver
//! commits, so a body may be run any number of times.
//!
//! # Frames
//!
//! Internally a transaction is a stack of frames. The bottom frame belongs to the current
//! attempt of [`atomically`](crate::atomically); [`Transaction::or_else`] and
//! [`Transaction::catch`] push a child frame for the nested body and pop it again once it is
//! decided what to keep:
//!
//! | nested body | child still valid                  | child stale     |
//! |-------------|------------------------------------|-----------------|
//! | `Ok`        | keep reads and writes              | run child again |
//! | retry       | keep reads, drop writes            | run child again |
//! | failure     | keep reads, drop writes            | run child again |
//!
//! Reads consult the child first and then its ancestors, so a nested body sees everything the
//! enclosing body wrote. Validation only ever looks at a single frame.
//!
//! # Example
//!
//! ```
//! use tmem::{TVar, atomically, retry};
//!
//! let left = TVar::new(0);
//! let right = TVar::new(5);
//!
//! // take from whichever side has something
//! let taken = atomically(|tx| {
//!     tx.or_else(
//!         |tx| {
//!             let n = left.read(tx);
//!             if n == 0 { return retry(); }
//!             left.write(tx, n - 1)?;
//!             Ok("left")
//!         },
//!         |tx| {
//!             let n = right.read(tx);
//!             if n == 0 { return retry(); }
//!             right.write(tx, n - 1)?;
//!             Ok("right")
//!         },
//!     )
//! })
//! .unwrap();
//!
//! assert_eq!(taken, "right");
//! assert_eq!(right.read_atomic(), 4);
//! ```

mod driver;
mod frame;

pub use driver::atomically;

use crate::error::{BoxError, StmError, StmResult};
use crate::tvar::{TxId, Value, VarCell};
use frame::{Entry, Frame};
use std::sync::Arc;
use tracing::debug;

/// The handle a transaction body uses to access transactional variables.
///
/// Obtained from [`atomically`]; there is no way to create one directly.
pub struct Transaction {
    id: TxId,
    current: Frame,
    // innermost last
    parents: Vec<Frame>,
}

impl Transaction {
    pub(crate) fn new(id: TxId) -> Self {
        Self {
            id,
            current: Frame::new(),
            parents: Vec::new(),
        }
    }

    /// Reads a variable, recording the live value on first access.
    pub(crate) fn read_value(&mut self, cell: &Arc<VarCell>) -> Value {
        let id = cell.id();
        if let Some(entry) = self.current.get(id) {
            return entry.value().clone();
        }
        if let Some(entry) = self.parents.iter().rev().find_map(|frame| frame.get(id)) {
            return entry.value().clone();
        }
        let live = cell.read();
        self.current
            .insert(Entry::read(Arc::clone(cell), live.clone()));
        live
    }

    /// Stages a write in the current frame.
    pub(crate) fn write_value(&mut self, cell: &Arc<VarCell>, value: Value) {
        let id = cell.id();
        if let Some(entry) = self.current.get_mut(id) {
            entry.current = Some(value);
            return;
        }
        // seed from the nearest ancestor observation so validation compares against live state
        let initial = match self.parents.iter().rev().find_map(|frame| frame.get(id)) {
            Some(entry) => entry.initial.clone(),
            None => cell.read(),
        };
        self.current.insert(Entry {
            cell: Arc::clone(cell),
            initial,
            current: Some(value),
        });
    }

    /// Abandons the current attempt, see [`retry`](crate::retry).
    pub fn retry<T>(&self) -> StmResult<T> {
        Err(StmError::Retry)
    }

    /// True iff every variable the current frame depends on still holds the value it saw.
    ///
    /// Calling this has no side effects, so without intervening commits by others it keeps
    /// returning the same answer.
    pub fn validate(&self) -> bool {
        self.current.validate()
    }

    /// Runs `first`; if it retries, runs `second` instead.
    ///
    /// Writes made by `first` before it retried are discarded, but what it read is kept, so
    /// if `second` retries as well the whole transaction waits for a change to any variable
    /// either branch looked at.
    ///
    /// `first` is run again (never blocking) if something it read changed while it ran.
    pub fn or_else<T, F, G>(&mut self, mut first: F, second: G) -> StmResult<T>
    where
        F: FnMut(&mut Transaction) -> StmResult<T>,
        G: FnOnce(&mut Transaction) -> StmResult<T>,
    {
        loop {
            let (result, child) = self.nested(&mut first);
            if !child.validate() {
                debug!(tx = %self.id, "or_else: nested frame went stale, running it again");
                continue;
            }
            return match result {
                Ok(value) => {
                    self.current.merge_all(child);
                    Ok(value)
                }
                Err(StmError::Retry) => {
                    self.current.merge_reads(child, &self.parents);
                    second(self)
                }
                Err(failure) => {
                    self.current.merge_reads(child, &self.parents);
                    Err(failure)
                }
            };
        }
    }

    /// Runs `body`; if it fails with a user error, runs `on_error` with that error instead.
    ///
    /// The retry signal is not an error and passes through unchanged. As with
    /// [`Transaction::or_else`], writes of the failed `body` are discarded and `body` is run
    /// again if it depended on something that changed meanwhile.
    pub fn catch<T, F, H>(&mut self, mut body: F, on_error: H) -> StmResult<T>
    where
        F: FnMut(&mut Transaction) -> StmResult<T>,
        H: FnOnce(&mut Transaction, BoxError) -> StmResult<T>,
    {
        loop {
            let (result, child) = self.nested(&mut body);
            if !child.validate() {
                debug!(tx = %self.id, "catch: nested frame went stale, running it again");
                continue;
            }
            return match result {
                Ok(value) => {
                    self.current.merge_all(child);
                    Ok(value)
                }
                Err(StmError::Retry) => {
                    self.current.merge_reads(child, &self.parents);
                    Err(StmError::Retry)
                }
                Err(StmError::Failure(error)) => {
                    self.current.merge_reads(child, &self.parents);
                    on_error(self, error)
                }
            };
        }
    }

    /// Runs `f` in a fresh child frame and hands back its result together with the frame.
    fn nested<T, F>(&mut self, f: &mut F) -> (StmResult<T>, Frame)
    where
        F: FnMut(&mut Transaction) -> StmResult<T>,
    {
        let parent = std::mem::replace(&mut self.current, Frame::new());
        self.parents.push(parent);
        let result = f(self);
        let parent = self
            .parents
            .pop()
            .expect("nested frames are popped exactly once");
        (result, std::mem::replace(&mut self.current, parent))
    }

    pub(crate) fn into_frame(self) -> Frame {
        debug_assert!(self.parents.is_empty());
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{TVar, retry};

    fn tx() -> Transaction {
        Transaction::new(TxId::next())
    }

    #[test]
    fn read_records_live_value_once() {
        let var = TVar::new(3u32);
        let mut tx = tx();
        assert_eq!(var.read(&mut tx), 3);
        var.write_atomic(4);
        // the first observation sticks for the rest of the attempt
        assert_eq!(var.read(&mut tx), 3);
        assert!(!tx.validate());
    }

    #[test]
    fn read_sees_own_write() {
        let var = TVar::new(1u32);
        let mut tx = tx();
        var.write(&mut tx, 2).unwrap();
        assert_eq!(var.read(&mut tx), 2);
        assert_eq!(var.read_atomic(), 1);
    }

    #[test]
    fn write_seeds_initial_value() {
        let var = TVar::new(1u32);
        let mut tx = tx();
        var.write(&mut tx, 2).unwrap();
        assert!(tx.validate());
        var.write_atomic(1);
        assert!(!tx.validate());
    }

    #[test]
    fn nested_read_sees_parent_write() {
        let var = TVar::new(1u32);
        let mut tx = tx();
        var.write(&mut tx, 5).unwrap();
        let seen = tx
            .or_else(|tx| Ok(var.read(tx)), |_| unreachable!())
            .unwrap();
        assert_eq!(seen, 5);
    }

    #[test]
    fn or_else_keeps_writes_of_successful_branch() {
        let var = TVar::new(1u32);
        let mut tx = tx();
        tx.or_else(|tx| var.write(tx, 2), |_| unreachable!())
            .unwrap();
        assert_eq!(var.read(&mut tx), 2);
        assert_eq!(tx.current.len(), 1);
    }

    #[test]
    fn or_else_drops_writes_of_retried_branch() {
        let var = TVar::new(1u32);
        let mut tx = tx();
        let seen = tx
            .or_else(
                |tx| {
                    var.write(tx, 99)?;
                    retry()
                },
                |tx| Ok(var.read(tx)),
            )
            .unwrap();
        assert_eq!(seen, 1);
        assert!(tx.current.get(var.id()).is_some_and(|e| !e.is_write()));
    }

    #[test]
    fn or_else_keeps_reads_of_retried_branch() {
        let first = TVar::new(0u32);
        let second = TVar::new(0u32);
        let mut tx = tx();
        let result: StmResult<()> = tx.or_else(
            |tx| {
                first.read(tx);
                retry()
            },
            |tx| {
                second.read(tx);
                retry()
            },
        );
        assert!(result.unwrap_err().is_retry());
        assert!(tx.current.get(first.id()).is_some());
        assert!(tx.current.get(second.id()).is_some());
    }

    #[test]
    fn or_else_reruns_stale_branch() {
        let var = TVar::new(0u32);
        let mut runs = 0;
        let mut tx = tx();
        let seen = tx
            .or_else(
                |tx| {
                    runs += 1;
                    let seen = var.read(tx);
                    if runs == 1 {
                        // a concurrent commit lands mid-branch
                        var.write_atomic(10);
                    }
                    Ok(seen)
                },
                |_| unreachable!(),
            )
            .unwrap();
        assert_eq!(runs, 2);
        assert_eq!(seen, 10);
    }

    #[test]
    fn catch_routes_failures_and_drops_writes() {
        let var = TVar::new(1u32);
        let mut tx = tx();
        let message = tx
            .catch(
                |tx| {
                    var.write(tx, 50)?;
                    crate::abort("boom")
                },
                |tx, error| {
                    assert_eq!(var.read(tx), 1);
                    Ok(error.to_string())
                },
            )
            .unwrap();
        assert_eq!(message, "boom");
    }

    #[test]
    fn catch_passes_retry_through() {
        let var = TVar::new(1u32);
        let mut tx = tx();
        let result: StmResult<()> = tx.catch(
            |tx| {
                var.read(tx);
                retry()
            },
            |_, _| unreachable!(),
        );
        assert!(result.unwrap_err().is_retry());
        assert!(tx.current.get(var.id()).is_some());
    }

    #[test]
    fn or_else_propagates_failures() {
        let mut tx = tx();
        let result: StmResult<()> =
            tx.or_else(|_| crate::abort("broken"), |_| unreachable!());
        assert!(matches!(result, Err(StmError::Failure(_))));
    }

    #[test]
    fn retried_grandchild_does_not_hide_outer_write() {
        let var = TVar::new(1u32);
        let mut tx = tx();
        var.write(&mut tx, 5).unwrap();
        let seen = tx
            .or_else(
                |tx| {
                    tx.or_else(
                        |tx| {
                            var.write(tx, 7)?;
                            retry()
                        },
                        |_| Ok(()),
                    )?;
                    Ok(var.read(tx))
                },
                |_| unreachable!(),
            )
            .unwrap();
        assert_eq!(seen, 5);
        assert_eq!(var.read(&mut tx), 5);
    }

    #[test]
    fn caught_grandchild_does_not_hide_outer_write() {
        let var = TVar::new(1u32);
        let mut tx = tx();
        var.write(&mut tx, 5).unwrap();
        let seen = tx
            .catch(
                |tx| {
                    tx.catch(
                        |tx| {
                            var.write(tx, 7)?;
                            crate::abort("undo")
                        },
                        |_, _| Ok(()),
                    )?;
                    Ok(var.read(tx))
                },
                |_, _| unreachable!(),
            )
            .unwrap();
        assert_eq!(seen, 5);
    }

    #[test]
    fn optionally_inside_or_else_keeps_outer_write() {
        let var = TVar::new(1u32);
        crate::atomically(|tx| {
            var.write(tx, 5)?;
            tx.or_else(
                |tx| {
                    crate::optionally(tx, |tx| {
                        var.write(tx, 9)?;
                        retry::<()>()
                    })?;
                    var.modify(tx, |n| n + 1)
                },
                |_| unreachable!(),
            )
        })
        .unwrap();
        assert_eq!(var.read_atomic(), 6);
    }

    /// Nests `depth` alternatives; the innermost one writes `value` and keeps it or retries.
    ///
    /// Returns whether every read along the way saw what the enclosing frames wrote.
    fn nest(
        tx: &mut Transaction,
        var: &TVar<u8>,
        depth: u8,
        value: u8,
        keep: bool,
        before: u8,
    ) -> StmResult<bool> {
        tx.or_else(
            |tx| {
                if var.read(tx) != before {
                    return Ok(false);
                }
                if depth == 1 {
                    var.write(tx, value)?;
                    return if keep { Ok(true) } else { retry() };
                }
                let inner = nest(tx, var, depth - 1, value, keep, before)?;
                let expected = if keep { value } else { before };
                Ok(inner && var.read(tx) == expected)
            },
            |tx| Ok(var.read(tx) == before),
        )
    }

    #[quickcheck]
    fn deep_nesting_reads_match_model(ops: Vec<(u8, u8, bool)>) -> bool {
        let var = TVar::new(0u8);
        let mut tx = tx();
        let mut model = 0u8;
        for (value, depth, keep) in ops {
            // an outer write before every nested call
            model = model.wrapping_add(1);
            var.write(&mut tx, model).unwrap();

            if !nest(&mut tx, &var, depth % 4 + 1, value, keep, model).unwrap() {
                return false;
            }
            if keep {
                model = value;
            }
            if var.read(&mut tx) != model {
                return false;
            }
        }
        true
    }

    #[quickcheck]
    fn nested_writes_only_survive_success(values: Vec<(u8, bool)>) -> bool {
        let var = TVar::new(0u8);
        let mut tx = tx();
        let mut expected = 0;
        for (value, keep) in values {
            let _ = tx.or_else(
                |tx| {
                    var.write(tx, value)?;
                    if keep { Ok(()) } else { retry() }
                },
                |_| Ok(()),
            );
            if keep {
                expected = value;
            }
        }
        var.read(&mut tx) == expected
    }
}
