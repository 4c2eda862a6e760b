// (c) Copyright 2025 Helsing GmbH. All rights reserved.
//! A transactional hash array mapped trie.
//!
//! [`Hamt`] is the storage engine for keyed transactional collections. Each trie node is an
//! array of 32 slots held in its own [`TVar`], and every operation is expressed as reads and
//! writes of those variables. The trie therefore needs no locking of its own: it inherits
//! isolation, conflict detection and blocking retry from the enclosing transaction, and two
//! transactions touching different subtrees do not conflict with each other.
//!
//! The trie stores plain elements of type `A` and is agnostic to what a key is. Callers pass
//! the hash of the element they are interested in together with an equality `test`, which
//! makes it equally usable for maps (store `(K, V)` and compare the key) and sets.
//!
//! Each level consumes 5 bits of the 64-bit hash, least significant first. Elements with
//! identical hashes share a leaf bucket; elements whose hashes differ but agree on the bits
//! consumed so far are pushed down into a new level.
//!
//! # Example
//!
//! ```
//! use tmem::{Hamt, atomically};
//!
//! let trie = Hamt::<(String, u32)>::new();
//! let key = "apples".to_string();
//! let hash = trie.hash_of(&key);
//!
//! atomically(|tx| {
//!     trie.alter(tx, hash, |(k, _)| *k == key, |_| Some((key.clone(), 3)));
//!     Ok(())
//! })
//! .unwrap();
//!
//! let found = atomically(|tx| Ok(trie.lookup(tx, hash, |(k, _)| *k == key))).unwrap();
//! assert_eq!(found, Some(("apples".to_string(), 3)));
//! ```

use crate::StmRandomState;
use crate::TVar;
use crate::transaction::Transaction;
use smallvec::{SmallVec, smallvec};
use std::{
    fmt,
    hash::{BuildHasher, Hash},
    sync::Arc,
};

const BITS: u32 = 5;
const WIDTH: usize = 1 << BITS;
const MASK: u64 = WIDTH as u64 - 1;

/// The slot of `hash` at `depth`.
#[inline]
fn index(hash: u64, depth: u32) -> usize {
    (hash.checked_shr(depth).unwrap_or(0) & MASK) as usize
}

type Bucket<A> = SmallVec<[A; 1]>;

struct Leaf<A> {
    hash: u64,
    bucket: Bucket<A>,
}

enum Branch<A> {
    Leaf(Arc<Leaf<A>>),
    Branches(TVar<Node<A>>),
}

impl<A> Branch<A> {
    fn leaf(hash: u64, bucket: Bucket<A>) -> Self {
        debug_assert!(!bucket.is_empty());
        Self::Leaf(Arc::new(Leaf { hash, bucket }))
    }
}

impl<A> Clone for Branch<A> {
    fn clone(&self) -> Self {
        match self {
            Self::Leaf(leaf) => Self::Leaf(Arc::clone(leaf)),
            Self::Branches(node) => Self::Branches(node.clone()),
        }
    }
}

struct Node<A> {
    slots: [Option<Branch<A>>; WIDTH],
}

impl<A> Node<A> {
    fn empty() -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
        }
    }
}

impl<A> Clone for Node<A> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

/// A transactional hash array mapped trie of `A`s.
///
/// Cloning a `Hamt` clones the handle; both handles refer to the same trie.
pub struct Hamt<A> {
    root: TVar<Node<A>>,
    hasher: StmRandomState,
}

impl<A> Hamt<A>
where
    A: Clone + Send + Sync + 'static,
{
    /// Creates an empty trie.
    pub fn new() -> Self {
        Self {
            root: TVar::new(Node::empty()),
            hasher: StmRandomState::default(),
        }
    }

    /// Hashes `key` with this trie's hasher.
    ///
    /// All operations on one trie must agree on how elements are hashed, and since
    /// [`StmRandomState`] is randomly seeded (unless determinism is enabled), the hash of a key
    /// is only meaningful for the trie that produced it.
    pub fn hash_of<K>(&self, key: &K) -> u64
    where
        K: Hash + ?Sized,
    {
        self.hasher.hash_one(key)
    }

    /// Finds the element with the given `hash` that satisfies `test`.
    pub fn lookup<F>(&self, tx: &mut Transaction, hash: u64, mut test: F) -> Option<A>
    where
        F: FnMut(&A) -> bool,
    {
        let mut var = self.root.clone();
        let mut depth = 0;
        loop {
            let node = var.read_arc(tx);
            match &node.slots[index(hash, depth)] {
                None => return None,
                Some(Branch::Leaf(leaf)) => {
                    if leaf.hash != hash {
                        return None;
                    }
                    return leaf.bucket.iter().find(|a| test(a)).cloned();
                }
                Some(Branch::Branches(child)) => {
                    var = child.clone();
                    depth += BITS;
                }
            }
        }
    }

    /// Inserts, replaces or removes the element with the given `hash` that satisfies `test`.
    ///
    /// `update` receives the matching element, if there is one, and returns the element to
    /// store in its place, or `None` to remove it. Returns whether the trie was written to;
    /// asking to remove an element that is not there leaves the trie untouched.
    pub fn alter<F, U>(&self, tx: &mut Transaction, hash: u64, mut test: F, update: U) -> bool
    where
        F: FnMut(&A) -> bool,
        U: FnOnce(Option<&A>) -> Option<A>,
    {
        let mut var = self.root.clone();
        let mut depth = 0;
        loop {
            let node = var.read_arc(tx);
            let slot = index(hash, depth);
            let replacement = match &node.slots[slot] {
                None => match update(None) {
                    None => return false,
                    Some(value) => Some(Branch::leaf(hash, smallvec![value])),
                },
                Some(Branch::Leaf(leaf)) if leaf.hash == hash => {
                    match leaf.bucket.iter().position(|a| test(a)) {
                        // same hash, different element: a genuine hash collision
                        None => match update(None) {
                            None => return false,
                            Some(value) => {
                                let mut bucket = Bucket::with_capacity(leaf.bucket.len() + 1);
                                bucket.push(value);
                                bucket.extend(leaf.bucket.iter().cloned());
                                Some(Branch::leaf(hash, bucket))
                            }
                        },
                        Some(position) => match update(Some(&leaf.bucket[position])) {
                            None if leaf.bucket.len() == 1 => None,
                            None => {
                                let mut bucket = leaf.bucket.clone();
                                bucket.remove(position);
                                Some(Branch::leaf(hash, bucket))
                            }
                            Some(value) => {
                                let mut bucket = leaf.bucket.clone();
                                bucket[position] = value;
                                Some(Branch::leaf(hash, bucket))
                            }
                        },
                    }
                }
                Some(Branch::Leaf(leaf)) => match update(None) {
                    None => return false,
                    Some(value) => Some(Branch::Branches(Self::pair(
                        depth + BITS,
                        hash,
                        Branch::leaf(hash, smallvec![value]),
                        leaf.hash,
                        Branch::Leaf(Arc::clone(leaf)),
                    ))),
                },
                Some(Branch::Branches(child)) => {
                    var = child.clone();
                    depth += BITS;
                    continue;
                }
            };

            let mut next = (*node).clone();
            next.slots[slot] = replacement;
            var.stage(tx, next);
            return true;
        }
    }

    /// Builds the smallest subtree that holds two leaves whose hashes agree up to `depth`.
    fn pair(
        depth: u32,
        hash1: u64,
        branch1: Branch<A>,
        hash2: u64,
        branch2: Branch<A>,
    ) -> TVar<Node<A>> {
        debug_assert_ne!(hash1, hash2, "equal hashes belong in one bucket");
        let mut node = Node::empty();
        let (index1, index2) = (index(hash1, depth), index(hash2, depth));
        if index1 == index2 {
            let deeper = Self::pair(depth + BITS, hash1, branch1, hash2, branch2);
            node.slots[index1] = Some(Branch::Branches(deeper));
        } else {
            node.slots[index1] = Some(branch1);
            node.slots[index2] = Some(branch2);
        }
        TVar::new(node)
    }

    /// Removes every element.
    pub fn clear(&self, tx: &mut Transaction) {
        self.root.stage(tx, Node::empty());
    }

    /// Folds over every element, in no particular order.
    pub fn fold<B, F>(&self, tx: &mut Transaction, init: B, mut f: F) -> B
    where
        F: FnMut(B, &A) -> B,
    {
        let mut acc = init;
        let mut pending = vec![self.root.clone()];
        while let Some(var) = pending.pop() {
            let node = var.read_arc(tx);
            for branch in node.slots.iter().flatten() {
                match branch {
                    Branch::Leaf(leaf) => {
                        for element in &leaf.bucket {
                            acc = f(acc, element);
                        }
                    }
                    Branch::Branches(child) => pending.push(child.clone()),
                }
            }
        }
        acc
    }

    /// The number of elements.
    pub fn len(&self, tx: &mut Transaction) -> usize {
        self.fold(tx, 0, |n, _| n + 1)
    }

    pub fn is_empty(&self, tx: &mut Transaction) -> bool {
        self.len(tx) == 0
    }

    /// Collects every element, in no particular order.
    pub fn to_vec(&self, tx: &mut Transaction) -> Vec<A> {
        self.fold(tx, Vec::new(), |mut all, a| {
            all.push(a.clone());
            all
        })
    }

    #[cfg(test)]
    fn leaf_count(&self, tx: &mut Transaction) -> usize {
        let mut leaves = 0;
        let mut pending = vec![self.root.clone()];
        while let Some(var) = pending.pop() {
            for branch in var.read_arc(tx).slots.iter().flatten() {
                match branch {
                    Branch::Leaf(_) => leaves += 1,
                    Branch::Branches(child) => pending.push(child.clone()),
                }
            }
        }
        leaves
    }
}

impl<A> Default for Hamt<A>
where
    A: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Clone for Hamt<A> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            hasher: self.hasher.clone(),
        }
    }
}

impl<A> fmt::Debug for Hamt<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hamt").field("root", &self.root).finish()
    }
}
