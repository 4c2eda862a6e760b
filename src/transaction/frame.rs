// (c) Copyright 2025 Helsing GmbH. All rights reserved.
use crate::StmRandomState;
use crate::tvar::{TxId, Value, VarCell, VarId, Waiter, same};
use smallvec::SmallVec;
use std::{
    collections::{HashMap, hash_map},
    sync::Arc,
};

/// What one frame knows about one variable.
pub(crate) struct Entry {
    pub(crate) cell: Arc<VarCell>,
    /// The value observed when the variable was first touched.
    pub(crate) initial: Value,
    /// The value written by this frame, if any.
    pub(crate) current: Option<Value>,
}

impl Entry {
    pub(crate) fn read(cell: Arc<VarCell>, initial: Value) -> Self {
        Self {
            cell,
            initial,
            current: None,
        }
    }

    /// The value a read through this entry sees.
    pub(crate) fn value(&self) -> &Value {
        self.current.as_ref().unwrap_or(&self.initial)
    }

    pub(crate) fn is_write(&self) -> bool {
        self.current.is_some()
    }

    fn is_valid(&self) -> bool {
        same(&self.cell.read(), &self.initial)
    }
}

/// The bookkeeping of one attempt (or one nested alternative) of a transaction.
#[derive(Default)]
pub(crate) struct Frame {
    entries: HashMap<VarId, Entry, StmRandomState>,
}

impl Frame {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, id: VarId) -> Option<&Entry> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: VarId) -> Option<&mut Entry> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn insert(&mut self, entry: Entry) {
        let previous = self.entries.insert(entry.cell.id(), entry);
        debug_assert!(previous.is_none(), "a variable appears at most once per frame");
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// True iff every variable this frame touched still holds the value it first observed.
    pub(crate) fn validate(&self) -> bool {
        self.entries.values().all(Entry::is_valid)
    }

    /// Takes over everything `child` read and wrote.
    pub(crate) fn merge_all(&mut self, child: Frame) {
        for (id, entry) in child.entries {
            match self.entries.entry(id) {
                hash_map::Entry::Occupied(mut occupied) => {
                    // the child seeded its initial value from ours, so only the write is news
                    if let Some(written) = entry.current {
                        occupied.get_mut().current = Some(written);
                    }
                }
                hash_map::Entry::Vacant(vacant) => {
                    vacant.insert(entry);
                }
            }
        }
    }

    /// Takes over what `child` observed, dropping everything it wrote.
    ///
    /// A variable the child wrote is still a dependency through the value it saw before
    /// writing, so it is kept as a plain read. Variables one of `ancestors` already knows are
    /// skipped: their entry there covers the dependency, and a copy here would shadow the
    /// ancestor's write on later reads.
    pub(crate) fn merge_reads(&mut self, child: Frame, ancestors: &[Frame]) {
        for (id, mut entry) in child.entries {
            if ancestors.iter().any(|frame| frame.get(id).is_some()) {
                continue;
            }
            entry.current = None;
            self.entries.entry(id).or_insert(entry);
        }
    }

    /// Publishes this frame's writes if nothing it depends on changed.
    ///
    /// Written variables are locked (without blocking) on their initial value; read-only
    /// variables are checked twice, once after locking and once more right before publishing,
    /// but never locked. Any failure releases every lock taken so far.
    pub(crate) fn validate_and_commit(&self, owner: TxId) -> bool {
        let mut locked: SmallVec<[&Entry; 8]> = SmallVec::new();

        for entry in self.entries.values().filter(|e| e.is_write()) {
            if !entry.cell.lock_if(owner, &entry.initial) {
                release_all(owner, &locked);
                return false;
            }
            locked.push(entry);
        }

        let reads_hold = || {
            self.entries
                .values()
                .filter(|e| !e.is_write())
                .all(|e| e.cell.holds(&e.initial))
        };
        // the second pass catches a commit that slipped in while we were still locking
        if !reads_hold() || !reads_hold() {
            release_all(owner, &locked);
            return false;
        }

        for entry in locked {
            entry.cell.release(owner, entry.value().clone());
            entry.cell.notify_waiters();
        }
        true
    }

    /// Registers `waiter` with every variable of this frame.
    ///
    /// Returns the cells it is now registered with, and whether all registrations succeeded.
    /// Registration stops at the first variable that already changed, since there is no
    /// point in waiting then.
    pub(crate) fn register_waiter(&self, waiter: &Arc<Waiter>) -> (Vec<Arc<VarCell>>, bool) {
        let mut registered = Vec::with_capacity(self.entries.len());
        for entry in self.entries.values() {
            if !entry.cell.register_waiter(waiter, &entry.initial) {
                return (registered, false);
            }
            registered.push(Arc::clone(&entry.cell));
        }
        (registered, true)
    }
}

fn release_all(owner: TxId, locked: &[&Entry]) {
    for entry in locked {
        entry.cell.release(owner, entry.initial.clone());
    }
}
