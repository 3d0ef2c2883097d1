//! # Transaction Operation Tree
//!
//! The per-transaction, per-database record of pending operations. Every
//! mutation a transaction issues becomes an owned [`TxnOperation`] (key
//! and record copied) appended to an issue-ordered log and indexed by key
//! in an ordered map, so both questions the engine asks are cheap:
//!
//! - *commit*: replay the operations in exactly the order they were issued
//! - *visibility / conflict*: what does this transaction pend for key K,
//!   and does any other live transaction pend something for K?
//!
//! ## Key Ordering
//!
//! The map key carries the database's key type so the tree iterates in the
//! same order as the btree itself: integer keys numerically, floats in
//! IEEE total order, binary lexicographically. Cursors rely on this when
//! they merge pending operations into a btree walk.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::btree::compare_keys;
use crate::config::KeyType;

/// What a pending operation does to its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Insert,
    Overwrite,
    Erase,
}

/// Lifecycle of a pending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpState {
    #[default]
    Pending,
    Flushed,
    Aborted,
}

/// One pending operation, with owned copies of its key and record.
#[derive(Debug, Clone)]
pub struct TxnOperation {
    pub kind: OpKind,
    /// Raw insert flags as journaled (duplicate / overwrite bits).
    pub flags: u32,
    pub key: Vec<u8>,
    pub record: Vec<u8>,
    /// Referenced duplicate position; `u32::MAX` when none.
    pub dup_position: u32,
    /// LSN of the journaled logical record (0 without a journal).
    pub lsn: u64,
    pub state: OpState,
}

/// A key in the transaction tree, ordered by the database's comparator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnKey {
    pub bytes: Vec<u8>,
    kind: KeyType,
}

impl TxnKey {
    pub fn new(bytes: Vec<u8>, kind: KeyType) -> Self {
        Self { bytes, kind }
    }
}

impl PartialOrd for TxnKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TxnKey {
    fn cmp(&self, other: &Self) -> Ordering {
        debug_assert_eq!(self.kind, other.kind);
        compare_keys(self.kind, &self.bytes, &other.bytes)
    }
}

/// What the pending operations say about a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    /// The newest pending operation produces this record.
    Record(Vec<u8>),
    /// The newest pending operation erases the key.
    Erased,
}

/// Ordered set of pending operations for one (transaction, database) pair.
#[derive(Debug)]
pub struct TxnTree {
    key_type: KeyType,
    /// Issue-ordered operation log; commit replays it front to back.
    ops: Vec<TxnOperation>,
    /// Key -> indices into `ops`, insertion order within the key.
    by_key: BTreeMap<TxnKey, Vec<usize>>,
}

impl TxnTree {
    pub fn new(key_type: KeyType) -> Self {
        Self {
            key_type,
            ops: Vec::new(),
            by_key: BTreeMap::new(),
        }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn record_op(&mut self, op: TxnOperation) {
        let key = TxnKey::new(op.key.clone(), self.key_type);
        let idx = self.ops.len();
        self.ops.push(op);
        self.by_key.entry(key).or_default().push(idx);
    }

    /// True when any pending operation touches `key`.
    pub fn touches(&self, key: &[u8]) -> bool {
        self.by_key
            .contains_key(&TxnKey::new(key.to_vec(), self.key_type))
    }

    /// The newest pending operation's verdict on `key`, if any.
    pub fn visibility(&self, key: &[u8]) -> Option<Visibility> {
        let indices = self
            .by_key
            .get(&TxnKey::new(key.to_vec(), self.key_type))?;
        let newest = &self.ops[*indices.last()?];
        Some(match newest.kind {
            OpKind::Erase if newest.dup_position == u32::MAX => Visibility::Erased,
            // erasing one duplicate leaves the key visible; the first
            // record may have changed but pending state cannot tell, so
            // the btree's view stands
            OpKind::Erase => return None,
            _ => Visibility::Record(newest.record.clone()),
        })
    }

    /// Number of pending duplicate-adding operations for `key` (used when
    /// merging counts), minus pending single-duplicate erases.
    pub fn pending_count_delta(&self, key: &[u8]) -> i64 {
        let Some(indices) = self.by_key.get(&TxnKey::new(key.to_vec(), self.key_type)) else {
            return 0;
        };
        let mut delta = 0i64;
        for &idx in indices {
            match self.ops[idx].kind {
                OpKind::Insert => delta += 1,
                OpKind::Overwrite => {}
                OpKind::Erase if self.ops[idx].dup_position == u32::MAX => delta = i64::MIN / 2,
                OpKind::Erase => delta -= 1,
            }
        }
        delta
    }

    /// The operations in issue order, for the commit flush.
    pub fn ops(&self) -> &[TxnOperation] {
        &self.ops
    }

    pub fn ops_mut(&mut self) -> &mut [TxnOperation] {
        &mut self.ops
    }

    /// Keys with pending operations, in key order: the cursor merge input.
    pub fn keys(&self) -> impl Iterator<Item = &TxnKey> {
        self.by_key.keys()
    }

    /// The closest pending key strictly after `key` in database order.
    pub fn next_key_after(&self, key: &[u8]) -> Option<&TxnKey> {
        use std::ops::Bound;
        let probe = TxnKey::new(key.to_vec(), self.key_type);
        self.by_key
            .range((Bound::Excluded(probe), Bound::Unbounded))
            .next()
            .map(|(k, _)| k)
    }

    /// The closest pending key strictly before `key` in database order.
    pub fn prev_key_before(&self, key: &[u8]) -> Option<&TxnKey> {
        use std::ops::Bound;
        let probe = TxnKey::new(key.to_vec(), self.key_type);
        self.by_key
            .range((Bound::Unbounded, Bound::Excluded(probe)))
            .next_back()
            .map(|(k, _)| k)
    }

    pub fn first_key(&self) -> Option<&TxnKey> {
        self.by_key.keys().next()
    }

    pub fn last_key(&self) -> Option<&TxnKey> {
        self.by_key.keys().next_back()
    }

    pub fn mark_all(&mut self, state: OpState) {
        for op in &mut self.ops {
            op.state = state;
        }
    }
}
