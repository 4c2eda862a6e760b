// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! Transactional variables.
//!
//! A [`TVar`] is a shared mutable cell that can only be changed through a committed
//! transaction. Its value lives behind an [`Arc`], and the engine compares values by
//! *identity* (the address of that allocation), never structurally: every transactional
//! write installs a new allocation, so even writing an equal value counts as a change.
//!
//! The engine itself never sees `TVar<A>`. It works on the type-erased [`VarCell`], which
//! exposes the small contract the commit protocol needs: a live read, conditional locking,
//! release-with-publish, and waiter registration for blocking retries.

use crate::error::StmResult;
use crate::transaction::Transaction;
use parking_lot::{Condvar, Mutex};
use std::{
    any::Any,
    fmt,
    marker::PhantomData,
    ptr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

/// A type-erased value held by a variable.
pub(crate) type Value = Arc<dyn Any + Send + Sync>;

/// Identity comparison of two values.
#[inline]
pub(crate) fn same(a: &Value, b: &Value) -> bool {
    ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

static NEXT_VAR_ID: AtomicU64 = AtomicU64::new(0);
static NEXT_TX_ID: AtomicU64 = AtomicU64::new(0);

/// Unique identity of a transactional variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(u64);

impl VarId {
    fn next() -> Self {
        Self(NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for VarId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Identity of one run of [`atomically`](crate::atomically), used as lock and waiter owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct TxId(u64);

impl TxId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TX_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// A parked transaction waiting for any of the variables it read to change.
///
/// The same waiter is registered with every variable of the retrying frame. The `woken` flag
/// is the exactly-once guard: the first variable to notify flips it and signals the
/// condition variable, all later notifications are no-ops.
pub(crate) struct Waiter {
    owner: TxId,
    woken: Mutex<bool>,
    resumed: Condvar,
}

impl Waiter {
    pub(crate) fn new(owner: TxId) -> Self {
        Self {
            owner,
            woken: Mutex::new(false),
            resumed: Condvar::new(),
        }
    }

    pub(crate) fn owner(&self) -> TxId {
        self.owner
    }

    /// Resumes the parked transaction unless someone already did.
    ///
    /// Returns true if this call was the one that woke it.
    pub(crate) fn wake(&self) -> bool {
        let mut woken = self.woken.lock();
        if *woken {
            return false;
        }
        *woken = true;
        self.resumed.notify_one();
        true
    }

    /// Blocks the calling thread until [`Waiter::wake`] has been called.
    pub(crate) fn park(&self) {
        let mut woken = self.woken.lock();
        while !*woken {
            self.resumed.wait(&mut woken);
        }
    }
}

struct CellState {
    value: Value,
    // Set while a committing transaction holds the lock on this cell.
    owner: Option<TxId>,
    waiters: Vec<Arc<Waiter>>,
}

/// The type-erased storage behind a [`TVar`].
///
/// This is the variable contract the transaction engine is written against.
pub(crate) struct VarCell {
    id: VarId,
    state: Mutex<CellState>,
    unlocked: Condvar,
}

impl VarCell {
    fn new(value: Value) -> Self {
        Self {
            id: VarId::next(),
            state: Mutex::new(CellState {
                value,
                owner: None,
                waiters: Vec::new(),
            }),
            unlocked: Condvar::new(),
        }
    }

    pub(crate) fn id(&self) -> VarId {
        self.id
    }

    /// Reads the live value.
    ///
    /// While a committer holds the lock this waits for it to publish, so a reader never sees
    /// a commit halfway through.
    pub(crate) fn read(&self) -> Value {
        let mut state = self.state.lock();
        while state.owner.is_some() {
            self.unlocked.wait(&mut state);
        }
        state.value.clone()
    }

    /// Replaces the value outside of any transaction and wakes waiters.
    pub(crate) fn write(&self, value: Value) {
        let mut state = self.state.lock();
        while state.owner.is_some() {
            self.unlocked.wait(&mut state);
        }
        state.value = value;
        drop(state);
        self.notify_waiters();
    }

    /// Locks the cell for `owner` if it is unlocked and still holds `expected`.
    ///
    /// Never blocks.
    pub(crate) fn lock_if(&self, owner: TxId, expected: &Value) -> bool {
        let mut state = self.state.lock();
        if state.owner.is_none() && same(&state.value, expected) {
            state.owner = Some(owner);
            true
        } else {
            false
        }
    }

    /// Releases the lock held by `owner`, publishing `value`.
    ///
    /// Releasing with the value the cell already holds is how a failed commit backs out.
    pub(crate) fn release(&self, owner: TxId, value: Value) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.owner, Some(owner), "{} released {} it does not hold", owner, self.id);
        if state.owner == Some(owner) {
            state.value = value;
            state.owner = None;
            self.unlocked.notify_all();
        }
    }

    /// True if the cell is unlocked and holds `expected`.
    ///
    /// Unlike [`VarCell::read`] this never waits, which is what commit-time validation of
    /// read-only variables needs: a cell locked by another committer counts as changed.
    pub(crate) fn holds(&self, expected: &Value) -> bool {
        let state = self.state.lock();
        state.owner.is_none() && same(&state.value, expected)
    }

    /// Wakes every registered waiter and forgets them.
    pub(crate) fn notify_waiters(&self) {
        let waiters = std::mem::take(&mut self.state.lock().waiters);
        for waiter in waiters {
            waiter.wake();
        }
    }

    /// Registers `waiter` if the cell still holds `expected`.
    ///
    /// Returns false, without registering, if the value already changed.
    pub(crate) fn register_waiter(&self, waiter: &Arc<Waiter>, expected: &Value) -> bool {
        let mut state = self.state.lock();
        if same(&state.value, expected) {
            state.waiters.push(Arc::clone(waiter));
            true
        } else {
            false
        }
    }

    pub(crate) fn remove_waiter(&self, owner: TxId) {
        self.state.lock().waiters.retain(|w| w.owner() != owner);
    }

    #[cfg(test)]
    pub(crate) fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

/// A transactional variable holding a value of type `A`.
///
/// Cloning a `TVar` clones the handle; both handles refer to the same variable.
///
/// # Example
///
/// ```
/// use tmem::{TVar, atomically};
///
/// let balance = TVar::new(100);
/// atomically(|tx| balance.modify(tx, |b| b - 30)).unwrap();
/// assert_eq!(balance.read_atomic(), 70);
/// ```
pub struct TVar<A> {
    cell: Arc<VarCell>,
    _marker: PhantomData<fn() -> A>,
}

impl<A> TVar<A>
where
    A: Send + Sync + 'static,
{
    /// Creates a new variable.
    ///
    /// Creating a variable is not a transactional operation and can be done anywhere,
    /// including inside a transaction body.
    pub fn new(value: A) -> Self {
        Self {
            cell: Arc::new(VarCell::new(Arc::new(value))),
            _marker: PhantomData,
        }
    }

    /// The identity of this variable.
    pub fn id(&self) -> VarId {
        self.cell.id()
    }

    pub(crate) fn cell(&self) -> &Arc<VarCell> {
        &self.cell
    }

    /// Reads the variable inside a transaction, returning the shared value.
    pub fn read_arc(&self, tx: &mut Transaction) -> Arc<A> {
        downcast(tx.read_value(&self.cell))
    }

    /// Reads the variable inside a transaction.
    pub fn read(&self, tx: &mut Transaction) -> A
    where
        A: Clone,
    {
        A::clone(&self.read_arc(tx))
    }

    /// Writes the variable inside a transaction.
    ///
    /// The write only becomes visible to others once the transaction commits.
    pub fn write(&self, tx: &mut Transaction, value: A) -> StmResult<()> {
        self.stage(tx, value);
        Ok(())
    }

    /// [`TVar::write`] for callers that are not themselves fallible.
    pub(crate) fn stage(&self, tx: &mut Transaction, value: A) {
        tx.write_value(&self.cell, Arc::new(value));
    }

    /// Applies `f` to the current value and writes the result.
    pub fn modify<F>(&self, tx: &mut Transaction, f: F) -> StmResult<()>
    where
        F: FnOnce(&A) -> A,
    {
        let next = f(&self.read_arc(tx));
        self.write(tx, next)
    }

    /// Writes `value` and returns the previous value.
    pub fn replace(&self, tx: &mut Transaction, value: A) -> StmResult<A>
    where
        A: Clone,
    {
        let previous = self.read(tx);
        self.write(tx, value)?;
        Ok(previous)
    }

    /// Reads the live value outside of any transaction.
    ///
    /// This is a single atomic read; combining several of them is not atomic.
    pub fn read_atomic(&self) -> A
    where
        A: Clone,
    {
        A::clone(&downcast::<A>(self.cell.read()))
    }

    /// Overwrites the value outside of any transaction, waking blocked transactions.
    pub fn write_atomic(&self, value: A) {
        self.cell.write(Arc::new(value));
    }
}

fn downcast<A: Send + Sync + 'static>(value: Value) -> Arc<A> {
    match value.downcast::<A>() {
        Ok(value) => value,
        Err(_) => unreachable!("a TVar<A> cell only ever holds values of type A"),
    }
}

impl<A> Clone for TVar<A> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
            _marker: PhantomData,
        }
    }
}

impl<A> PartialEq for TVar<A> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<A> Eq for TVar<A> {}

impl<A> fmt::Debug for TVar<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TVar").field(&self.cell.id()).finish()
    }
}
