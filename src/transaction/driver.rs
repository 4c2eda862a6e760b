// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use super::Transaction;
use crate::error::{Error, StmError, StmResult};
use crate::tvar::{TxId, Waiter};
use std::sync::Arc;
use tracing::{debug, debug_span, trace, warn};

/// Runs `f` as one atomic transaction and returns its result.
///
/// The body is run against a private frame and its writes are published all at once when it
/// returns `Ok`. Depending on how the body ends, the driver:
///
/// - **`Ok`**: validates and commits. If another transaction committed a conflicting change in
///   the meantime, the body is simply run again.
/// - **retry**: blocks the calling thread until any variable the body read is changed by
///   someone else, then runs the body again. A body that retries without having read anything
///   could never be woken and fails with [`Error::BlockedIndefinitely`] instead.
/// - **failure**: returns [`Error::Failed`] if everything the body read is still current.
///   Otherwise the failure may have been caused by an inconsistent view and the body runs again.
///
/// Since the body may run many times it should not have side effects other than through
/// transactional variables.
///
/// Calls to `atomically` must not be nested; compose transactional code by passing the
/// [`Transaction`] down instead.
///
/// # Example
///
/// ```
/// use tmem::{TVar, atomically, guard};
///
/// let from = TVar::new(100);
/// let to = TVar::new(0);
///
/// atomically(|tx| {
///     let balance = from.read(tx);
///     guard(balance >= 30)?;
///     from.write(tx, balance - 30)?;
///     to.modify(tx, |b| b + 30)
/// })
/// .unwrap();
///
/// assert_eq!((from.read_atomic(), to.read_atomic()), (70, 30));
/// ```
pub fn atomically<T, F>(mut f: F) -> Result<T, Error>
where
    F: FnMut(&mut Transaction) -> StmResult<T>,
{
    let id = TxId::next();
    let _span = debug_span!("atomically", tx = %id).entered();

    let mut attempt: u64 = 0;
    loop {
        attempt += 1;
        let mut tx = Transaction::new(id);
        let result = f(&mut tx);
        let frame = tx.into_frame();

        match result {
            Ok(value) => {
                if frame.validate_and_commit(id) {
                    trace!(attempt, vars = frame.len(), "committed");
                    return Ok(value);
                }
                debug!(attempt, "commit conflicted, running again");
            }
            Err(StmError::Retry) => {
                if frame.is_empty() {
                    warn!("retry without any read variable can never be woken");
                    return Err(Error::BlockedIndefinitely);
                }
                let waiter = Arc::new(Waiter::new(id));
                let (registered, complete) = frame.register_waiter(&waiter);
                if complete {
                    debug!(attempt, vars = registered.len(), "suspending until a read variable changes");
                    waiter.park();
                } else {
                    debug!(attempt, "a read variable changed before suspending, running again");
                }
                for cell in registered {
                    cell.remove_waiter(id);
                }
            }
            Err(StmError::Failure(error)) => {
                if frame.validate() {
                    return Err(Error::Failed(error));
                }
                debug!(attempt, %error, "discarding failure raised on stale reads");
            }
        }
    }
}
