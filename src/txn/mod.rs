//! # Transaction Manager
//!
//! Begin/commit/abort bookkeeping, conflict detection, and the read-side
//! visibility query over every live transaction's operation trees.
//!
//! ## Model
//!
//! A transaction owns per-database [`TxnTree`]s of pending operations; the
//! btree itself is untouched until commit. Reads consult the live
//! transactions newest-first before descending the btree: the first
//! pending operation for the key decides what is visible (a pending erase
//! makes the key invisible). Commit order across transactions is the
//! journal's commit-LSN order; within one transaction, operations flush in
//! the order they were issued.
//!
//! ## Conflict Rule
//!
//! A write fails with `txn-conflict` while a *different* live transaction
//! has any pending operation on the same key. The check is pessimistic and
//! key-granular: it catches write-write races at issue time rather than at
//! commit, which is the cheapest point to retry from for an embedded
//! caller.
//!
//! ## Lifetime
//!
//! The environment holds the manager; dropping an unfinished transaction
//! aborts it (the abort record is written on the environment's close path
//! if the journal is still open). Environment close auto-aborts every live
//! transaction.

pub mod tree;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::KeyType;
use crate::error::{typed, StoreError};

use tree::{OpState, TxnOperation, TxnTree, Visibility};

/// Transaction lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxnState {
    #[default]
    Active,
    Committed,
    Aborted,
}

/// Shared transaction body. The public `Transaction` handle in the
/// environment layer wraps one of these.
pub struct TxnInner {
    id: u64,
    state: Mutex<TxnState>,
    /// database name -> pending operations
    trees: Mutex<hashbrown::HashMap<u16, TxnTree>>,
}

impl TxnInner {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TxnState) {
        *self.state.lock() = state;
    }

    pub fn is_active(&self) -> bool {
        self.state() == TxnState::Active
    }

    /// Records a pending operation against a database.
    pub fn record_op(&self, db: u16, key_type: KeyType, op: TxnOperation) {
        let mut trees = self.trees.lock();
        trees
            .entry(db)
            .or_insert_with(|| TxnTree::new(key_type))
            .record_op(op);
    }

    pub fn touches(&self, db: u16, key: &[u8]) -> bool {
        self.trees
            .lock()
            .get(&db)
            .is_some_and(|tree| tree.touches(key))
    }

    pub fn visibility(&self, db: u16, key: &[u8]) -> Option<Visibility> {
        self.trees.lock().get(&db)?.visibility(key)
    }

    pub fn pending_count_delta(&self, db: u16, key: &[u8]) -> i64 {
        self.trees
            .lock()
            .get(&db)
            .map_or(0, |tree| tree.pending_count_delta(key))
    }

    /// Runs `f` over this transaction's tree for `db`, if one exists.
    pub fn with_tree<R>(&self, db: u16, f: impl FnOnce(&TxnTree) -> R) -> Option<R> {
        self.trees.lock().get(&db).map(f)
    }

    /// Drains the per-database trees for the commit flush, in database
    /// order.
    pub fn take_trees(&self) -> Vec<(u16, TxnTree)> {
        let mut trees: Vec<_> = self.trees.lock().drain().collect();
        trees.sort_by_key(|(db, _)| *db);
        trees
    }

    pub fn op_count(&self) -> usize {
        self.trees.lock().values().map(|t| t.len()).sum()
    }

    pub fn mark_all(&self, state: OpState) {
        for tree in self.trees.lock().values_mut() {
            tree.mark_all(state);
        }
    }
}

pub struct TransactionManager {
    next_id: AtomicU64,
    /// Live transactions, oldest first; reads walk it in reverse.
    live: Mutex<Vec<Arc<TxnInner>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            live: Mutex::new(Vec::new()),
        }
    }

    pub fn begin(&self) -> Arc<TxnInner> {
        let txn = Arc::new(TxnInner {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            state: Mutex::new(TxnState::Active),
            trees: Mutex::new(hashbrown::HashMap::new()),
        });
        self.live.lock().push(Arc::clone(&txn));
        txn
    }

    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }

    /// Removes a finished transaction from the live list.
    pub fn retire(&self, id: u64) {
        self.live.lock().retain(|txn| txn.id != id);
    }

    /// Fails with `txn-conflict` when a live transaction other than
    /// `requester` pends an operation on `(db, key)`.
    pub fn check_conflict(
        &self,
        db: u16,
        key: &[u8],
        requester: Option<u64>,
    ) -> eyre::Result<()> {
        let live = self.live.lock();
        for txn in live.iter() {
            if Some(txn.id) == requester || !txn.is_active() {
                continue;
            }
            if txn.touches(db, key) {
                return Err(typed(
                    StoreError::TxnConflict,
                    format!(
                        "transaction {} has a pending operation on the same key",
                        txn.id
                    ),
                ));
            }
        }
        Ok(())
    }

    /// The newest pending verdict on `(db, key)` across live transactions.
    pub fn visibility(&self, db: u16, key: &[u8]) -> Option<Visibility> {
        let live = self.live.lock();
        for txn in live.iter().rev() {
            if !txn.is_active() {
                continue;
            }
            if let Some(v) = txn.visibility(db, key) {
                return Some(v);
            }
        }
        None
    }

    /// Net duplicate-count adjustment for `(db, key)` across live
    /// transactions.
    pub fn pending_count_delta(&self, db: u16, key: &[u8]) -> i64 {
        let live = self.live.lock();
        live.iter()
            .filter(|txn| txn.is_active())
            .map(|txn| txn.pending_count_delta(db, key))
            .sum()
    }

    /// Runs `f` over every live transaction, newest first.
    pub fn for_each_live(&self, mut f: impl FnMut(&Arc<TxnInner>)) {
        let live = self.live.lock();
        for txn in live.iter().rev() {
            f(txn);
        }
    }

    /// Snapshot of live transactions, for close-time auto-abort.
    pub fn drain_live(&self) -> Vec<Arc<TxnInner>> {
        std::mem::take(&mut *self.live.lock())
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::store_error;
    use tree::OpKind;

    fn insert_op(key: &[u8]) -> TxnOperation {
        TxnOperation {
            kind: OpKind::Insert,
            flags: 0,
            key: key.to_vec(),
            record: b"v".to_vec(),
            dup_position: u32::MAX,
            lsn: 0,
            state: OpState::Pending,
        }
    }

    #[test]
    fn begin_assigns_increasing_ids() {
        let mgr = TransactionManager::new();
        let a = mgr.begin();
        let b = mgr.begin();
        assert!(b.id() > a.id());
        assert_eq!(mgr.live_count(), 2);
    }

    #[test]
    fn retire_removes_from_live_list() {
        let mgr = TransactionManager::new();
        let a = mgr.begin();
        mgr.retire(a.id());
        assert_eq!(mgr.live_count(), 0);
    }

    #[test]
    fn conflict_detected_across_transactions() {
        let mgr = TransactionManager::new();
        let a = mgr.begin();
        let b = mgr.begin();

        a.record_op(1, KeyType::Binary, insert_op(b"contested"));

        // b touching the same key conflicts
        let err = mgr
            .check_conflict(1, b"contested", Some(b.id()))
            .unwrap_err();
        assert_eq!(store_error(&err), Some(StoreError::TxnConflict));

        // a touching its own key does not
        mgr.check_conflict(1, b"contested", Some(a.id())).unwrap();

        // a non-transactional writer conflicts too
        let err = mgr.check_conflict(1, b"contested", None).unwrap_err();
        assert_eq!(store_error(&err), Some(StoreError::TxnConflict));
    }

    #[test]
    fn no_conflict_on_distinct_keys_or_databases() {
        let mgr = TransactionManager::new();
        let a = mgr.begin();
        let b = mgr.begin();

        a.record_op(1, KeyType::Binary, insert_op(b"one"));

        mgr.check_conflict(1, b"other", Some(b.id())).unwrap();
        mgr.check_conflict(2, b"one", Some(b.id())).unwrap();
    }

    #[test]
    fn visibility_prefers_newest_transaction() {
        let mgr = TransactionManager::new();
        let old = mgr.begin();
        let new = mgr.begin();

        let mut op_old = insert_op(b"k");
        op_old.record = b"old".to_vec();
        old.record_op(1, KeyType::Binary, op_old);

        let mut op_new = insert_op(b"k");
        op_new.record = b"new".to_vec();
        new.record_op(1, KeyType::Binary, op_new);

        assert_eq!(
            mgr.visibility(1, b"k"),
            Some(Visibility::Record(b"new".to_vec()))
        );
    }

    #[test]
    fn retired_transactions_stop_affecting_reads() {
        let mgr = TransactionManager::new();
        let txn = mgr.begin();
        txn.record_op(1, KeyType::Binary, insert_op(b"k"));

        assert!(mgr.visibility(1, b"k").is_some());
        txn.set_state(TxnState::Aborted);
        mgr.retire(txn.id());
        assert!(mgr.visibility(1, b"k").is_none());
    }

    #[test]
    fn take_trees_empties_the_transaction() {
        let mgr = TransactionManager::new();
        let txn = mgr.begin();
        txn.record_op(2, KeyType::Binary, insert_op(b"b"));
        txn.record_op(1, KeyType::Binary, insert_op(b"a"));

        let trees = txn.take_trees();
        assert_eq!(trees.len(), 2);
        assert_eq!(trees[0].0, 1); // database order
        assert_eq!(txn.op_count(), 0);
    }
}
