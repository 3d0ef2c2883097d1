//! # Database
//!
//! One named key space inside an environment: the orchestration of a
//! find/insert/erase across the transaction trees and the btree, the
//! operation scope (changeset flush or roll back), record-number key
//! generation, and poisoning after an integrity fault.
//!
//! ## Write Path
//!
//! ```text
//! insert(txn, k, v)
//!   ├─ conflict check against every other live transaction
//!   ├─ with txn:    journal the logical record, park the op in the
//!   │               transaction tree; the btree is untouched until commit
//!   └─ without txn: mutate the btree under the environment write lock,
//!                   journal the changeset, release it
//! ```
//!
//! ## Read Path
//!
//! Reads consult the live transactions newest-first; the first pending
//! operation on the key decides visibility (a pending erase hides the
//! key). Only then does the btree answer.
//!
//! ## Poisoning
//!
//! An `integrity-violated` fault marks the database unusable for the rest
//! of the process lifetime: further write operations are rejected with the
//! same code. Reopening the environment (and running recovery) clears the
//! state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::Result;

use crate::btree::node::DupePosition;
use crate::btree::tree::{BtreeIndex, InsertOptions};
use crate::btree::NodeConfig;
use crate::config::DatabaseOptions;
use crate::env::{EnvInner, Transaction};
use crate::error::{store_error, typed, StoreError};
use crate::journal::DUP_POSITION_NONE;
use crate::txn::tree::{OpKind, OpState, TxnOperation};

/// Insert flag bits as journaled and carried in transaction trees.
pub const INSERT_FLAG_OVERWRITE: u32 = 1 << 0;
pub const INSERT_FLAG_DUPLICATE: u32 = 1 << 1;
pub const INSERT_FLAG_DUP_FIRST: u32 = 1 << 2;
pub const INSERT_FLAG_DUP_BEFORE: u32 = 1 << 3;
pub const INSERT_FLAG_DUP_AFTER: u32 = 1 << 4;

/// Caller-facing insert options.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertFlags {
    pub overwrite: bool,
    pub duplicate: bool,
    /// Position within the duplicate set; append when unset.
    pub dup_position: Option<(DupePosition, u32)>,
}

impl InsertFlags {
    pub fn overwrite() -> Self {
        Self {
            overwrite: true,
            ..Default::default()
        }
    }

    pub fn duplicate() -> Self {
        Self {
            duplicate: true,
            ..Default::default()
        }
    }

    fn to_bits(self) -> (u32, u32) {
        let mut bits = 0;
        if self.overwrite {
            bits |= INSERT_FLAG_OVERWRITE;
        }
        if self.duplicate {
            bits |= INSERT_FLAG_DUPLICATE;
        }
        let dup_index = match self.dup_position {
            Some((DupePosition::First, _)) => {
                bits |= INSERT_FLAG_DUP_FIRST;
                DUP_POSITION_NONE
            }
            Some((DupePosition::Before, i)) => {
                bits |= INSERT_FLAG_DUP_BEFORE;
                i
            }
            Some((DupePosition::After, i)) => {
                bits |= INSERT_FLAG_DUP_AFTER;
                i
            }
            _ => DUP_POSITION_NONE,
        };
        (bits, dup_index)
    }

    pub(crate) fn from_bits(bits: u32, dup_index: u32) -> Self {
        let dup_position = if bits & INSERT_FLAG_DUP_FIRST != 0 {
            Some((DupePosition::First, 0))
        } else if bits & INSERT_FLAG_DUP_BEFORE != 0 {
            Some((DupePosition::Before, dup_index))
        } else if bits & INSERT_FLAG_DUP_AFTER != 0 {
            Some((DupePosition::After, dup_index))
        } else {
            None
        };
        Self {
            overwrite: bits & INSERT_FLAG_OVERWRITE != 0,
            duplicate: bits & INSERT_FLAG_DUPLICATE != 0,
            dup_position,
        }
    }
}

pub(crate) struct DatabaseInner {
    name: u16,
    options: DatabaseOptions,
    config: NodeConfig,
    tree: BtreeIndex,
    cached_root: AtomicU64,
    poisoned: AtomicBool,
    /// Next record number for record-number databases.
    recno: AtomicU64,
    /// Bumped on every btree mutation; cursors revalidate against it.
    mutation_gen: AtomicU64,
}

impl DatabaseInner {
    pub(crate) fn create(env: &EnvInner, name: u16, options: DatabaseOptions) -> Result<Self> {
        let config = NodeConfig::leaf(&options, env.options.page_size);
        let tree = BtreeIndex::create(env.ctx(), config)?;
        let root = tree.root_address();
        Ok(Self {
            name,
            options,
            config,
            tree,
            cached_root: AtomicU64::new(root),
            poisoned: AtomicBool::new(false),
            recno: AtomicU64::new(1),
            mutation_gen: AtomicU64::new(0),
        })
    }

    pub(crate) fn from_descriptor(
        env: &EnvInner,
        name: u16,
        descriptor: crate::env::DatabaseDescriptor,
    ) -> Result<Self> {
        let options = descriptor.to_options()?;
        let config = NodeConfig::leaf(&options, env.options.page_size);
        let tree = BtreeIndex::open(config, descriptor.root_page());

        let this = Self {
            name,
            options,
            config,
            cached_root: AtomicU64::new(descriptor.root_page()),
            poisoned: AtomicBool::new(false),
            recno: AtomicU64::new(1),
            mutation_gen: AtomicU64::new(0),
            tree,
        };

        if this.is_record_number() {
            let next = match this.tree.max_key(env.ctx())? {
                Some(key) => this.decode_recno(&key)? + 1,
                None => 1,
            };
            this.recno.store(next, Ordering::Release);
        }
        Ok(this)
    }

    pub(crate) fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    pub(crate) fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub(crate) fn tree(&self) -> &BtreeIndex {
        &self.tree
    }

    pub(crate) fn root_address(&self) -> u64 {
        self.tree.root_address()
    }

    pub(crate) fn mutation_generation(&self) -> u64 {
        self.mutation_gen.load(Ordering::Acquire)
    }

    fn is_record_number(&self) -> bool {
        self.options.flags.record_number_32 || self.options.flags.record_number_64
    }

    fn decode_recno(&self, key: &[u8]) -> Result<u64> {
        if self.options.flags.record_number_32 {
            Ok(u32::from_le_bytes(key.try_into().map_err(|_| {
                typed(StoreError::InvalidParameter, "record-number key must be 4 bytes")
            })?) as u64)
        } else {
            Ok(u64::from_le_bytes(key.try_into().map_err(|_| {
                typed(StoreError::InvalidParameter, "record-number key must be 8 bytes")
            })?))
        }
    }

    fn encode_recno(&self, value: u64) -> Vec<u8> {
        if self.options.flags.record_number_32 {
            (value as u32).to_le_bytes().to_vec()
        } else {
            value.to_le_bytes().to_vec()
        }
    }

    pub(crate) fn check_usable(&self) -> Result<()> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(typed(
                StoreError::IntegrityViolated,
                format!(
                    "database {} is poisoned after an integrity fault; reopen to recover",
                    self.name
                ),
            ));
        }
        Ok(())
    }

    /// Converts an integrity fault into a sticky poisoned state.
    fn note_fault<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if store_error(err) == Some(StoreError::IntegrityViolated) {
                self.poisoned.store(true, Ordering::Release);
                tracing::error!(db = self.name, "database poisoned by integrity fault");
            }
        }
        result
    }

    /// Applies one pending operation to the btree. Called with the
    /// environment write lock held, from commit and recovery replay.
    pub(crate) fn apply_op(&self, env: &EnvInner, op: &TxnOperation) -> Result<()> {
        let result = (|| -> Result<()> {
            match op.kind {
                OpKind::Insert | OpKind::Overwrite => {
                    let flags = InsertFlags::from_bits(op.flags, op.dup_position);
                    let options = InsertOptions {
                        overwrite: flags.overwrite || op.kind == OpKind::Overwrite,
                        duplicate: flags.duplicate,
                        dup_position: flags.dup_position,
                    };
                    self.tree.insert(env.ctx(), &op.key, &op.record, options)?;
                }
                OpKind::Erase => {
                    let dup = if op.dup_position == DUP_POSITION_NONE {
                        None
                    } else {
                        Some(op.dup_position)
                    };
                    self.tree.erase(env.ctx(), &op.key, dup)?;
                }
            }
            self.sync_root(env)?;
            Ok(())
        })();
        self.mutation_gen.fetch_add(1, Ordering::AcqRel);
        self.note_fault(result)
    }

    /// Propagates a root change into the descriptor (same changeset).
    fn sync_root(&self, env: &EnvInner) -> Result<()> {
        let root = self.tree.root_address();
        if self.cached_root.swap(root, Ordering::AcqRel) != root {
            let (slot, _) = env.find_descriptor(self.name)?.ok_or_else(|| {
                typed(
                    StoreError::DatabaseNotFound,
                    format!("descriptor for database {} vanished", self.name),
                )
            })?;
            env.update_descriptor(slot, |d| d.set_root_page(root))?;
        }
        Ok(())
    }

    /// Frees the whole tree; used by environment-level database erase.
    pub(crate) fn destroy(&self, env: &EnvInner) -> Result<()> {
        self.tree.destroy(env.ctx())
    }
}

/// A handle to one database. Obtained from
/// [`Environment::create_database`] or [`Environment::open_database`].
///
/// [`Environment::create_database`]: crate::Environment::create_database
/// [`Environment::open_database`]: crate::Environment::open_database
pub struct Database {
    env: Arc<EnvInner>,
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish()
    }
}

impl Database {
    pub(crate) fn new(env: Arc<EnvInner>, inner: Arc<DatabaseInner>) -> Self {
        Self { env, inner }
    }

    pub(crate) fn env(&self) -> &Arc<EnvInner> {
        &self.env
    }

    pub(crate) fn inner(&self) -> &Arc<DatabaseInner> {
        &self.inner
    }

    pub fn name(&self) -> u16 {
        self.inner.name
    }

    /// Inserts a unique key.
    pub fn insert(&self, txn: Option<&Transaction>, key: &[u8], record: &[u8]) -> Result<()> {
        self.insert_with(txn, key, record, InsertFlags::default())
            .map(|_| ())
    }

    /// Inserts with explicit overwrite/duplicate behavior. Returns the
    /// generated key for record-number databases (the input key otherwise).
    pub fn insert_with(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<Vec<u8>> {
        self.env.check_open()?;
        self.env.check_writable()?;
        self.inner.check_usable()?;

        let _guard = self.env.write_lock.lock();

        // record-number databases generate the key when none is supplied
        let key: Vec<u8> = if self.inner.is_record_number() && key.is_empty() {
            let value = self.inner.recno.fetch_add(1, Ordering::AcqRel);
            self.inner.encode_recno(value)
        } else {
            if self.inner.is_record_number() {
                // keep the counter ahead of explicit keys
                let value = self.inner.decode_recno(key)?;
                self.inner.recno.fetch_max(value + 1, Ordering::AcqRel);
            }
            key.to_vec()
        };

        self.inner.config.check_key(&key)?;
        self.inner.config.check_record(record)?;
        self.env
            .txns
            .check_conflict(self.inner.name, &key, txn.map(|t| t.inner.id()))?;

        let (flag_bits, dup_index) = flags.to_bits();

        if flags.duplicate && !self.inner.config.duplicates {
            return Err(typed(
                StoreError::InvalidParameter,
                "duplicate insert into a database without duplicates",
            ));
        }

        if let Some(txn) = txn {
            // unique-insert validation happens at issue time so a doomed
            // operation cannot wreck the commit flush later
            if !flags.overwrite && !flags.duplicate {
                let exists = match self.env.txns.visibility(self.inner.name, &key) {
                    Some(crate::txn::tree::Visibility::Record(_)) => true,
                    Some(crate::txn::tree::Visibility::Erased) => false,
                    None => self.inner.tree.find(self.env.ctx(), &key)?.is_some(),
                };
                if exists {
                    return Err(typed(
                        StoreError::DuplicateKey,
                        "key already exists and neither overwrite nor duplicate was requested",
                    ));
                }
            }

            let lsn = match &self.env.journal {
                Some(journal) => journal.append_insert(
                    txn.inner.id(),
                    self.inner.name,
                    flag_bits,
                    dup_index,
                    &key,
                    record,
                )?,
                None => 0,
            };
            txn.inner.record_op(
                self.inner.name,
                self.inner.options.key_type,
                TxnOperation {
                    kind: if flags.overwrite {
                        OpKind::Overwrite
                    } else {
                        OpKind::Insert
                    },
                    flags: flag_bits,
                    key: key.clone(),
                    record: record.to_vec(),
                    dup_position: dup_index,
                    lsn,
                    state: OpState::Pending,
                },
            );
            return Ok(key);
        }

        // non-transactional: mutate the btree under a scoped changeset
        let result = self.inner.apply_op(
            &self.env,
            &TxnOperation {
                kind: if flags.overwrite {
                    OpKind::Overwrite
                } else {
                    OpKind::Insert
                },
                flags: flag_bits,
                key: key.clone(),
                record: record.to_vec(),
                dup_position: dup_index,
                lsn: 0,
                state: OpState::Pending,
            },
        );
        self.env.finish_structural(result)?;
        Ok(key)
    }

    /// Point lookup. Pending transaction state is consulted first.
    pub fn find(&self, _txn: Option<&Transaction>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.env.check_open()?;
        self.inner.config.check_key(key)?;

        match self.env.txns.visibility(self.inner.name, key) {
            Some(crate::txn::tree::Visibility::Record(record)) => Ok(Some(record)),
            Some(crate::txn::tree::Visibility::Erased) => Ok(None),
            None => self.inner.tree.find(self.env.ctx(), key),
        }
    }

    /// Erases a key (all of its duplicates). `key-not-found` when absent.
    pub fn erase(&self, txn: Option<&Transaction>, key: &[u8]) -> Result<()> {
        self.erase_impl(txn, key, None)
    }

    /// Erases one duplicate of a key by index.
    pub fn erase_duplicate(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        dup_index: u32,
    ) -> Result<()> {
        self.erase_impl(txn, key, Some(dup_index))
    }

    fn erase_impl(
        &self,
        txn: Option<&Transaction>,
        key: &[u8],
        dup_index: Option<u32>,
    ) -> Result<()> {
        self.env.check_open()?;
        self.env.check_writable()?;
        self.inner.check_usable()?;
        self.inner.config.check_key(key)?;

        let _guard = self.env.write_lock.lock();
        self.env
            .txns
            .check_conflict(self.inner.name, key, txn.map(|t| t.inner.id()))?;

        if let Some(txn) = txn {
            // the key must be visible now for the erase to be accepted
            let visible = match self.env.txns.visibility(self.inner.name, key) {
                Some(crate::txn::tree::Visibility::Record(_)) => true,
                Some(crate::txn::tree::Visibility::Erased) => false,
                None => self.inner.tree.find(self.env.ctx(), key)?.is_some(),
            };
            if !visible {
                return Err(typed(
                    StoreError::KeyNotFound,
                    "erase of a key that is not visible",
                ));
            }

            let dup = dup_index.unwrap_or(DUP_POSITION_NONE);
            let lsn = match &self.env.journal {
                Some(journal) => {
                    journal.append_erase(txn.inner.id(), self.inner.name, 0, dup, key)?
                }
                None => 0,
            };
            txn.inner.record_op(
                self.inner.name,
                self.inner.options.key_type,
                TxnOperation {
                    kind: OpKind::Erase,
                    flags: 0,
                    key: key.to_vec(),
                    record: Vec::new(),
                    dup_position: dup,
                    lsn,
                    state: OpState::Pending,
                },
            );
            return Ok(());
        }

        let result = self.inner.apply_op(
            &self.env,
            &TxnOperation {
                kind: OpKind::Erase,
                flags: 0,
                key: key.to_vec(),
                record: Vec::new(),
                dup_position: dup_index.unwrap_or(DUP_POSITION_NONE),
                lsn: 0,
                state: OpState::Pending,
            },
        );
        self.env.finish_structural(result)
    }

    /// Number of records stored under `key`, merged with pending state.
    pub fn count(&self, _txn: Option<&Transaction>, key: &[u8]) -> Result<u32> {
        self.env.check_open()?;
        self.inner.config.check_key(key)?;

        let base = self.inner.tree.count(self.env.ctx(), key)? as i64;
        let delta = self.env.txns.pending_count_delta(self.inner.name, key);
        Ok(base.saturating_add(delta).max(0) as u32)
    }

    /// Opens a cursor over this database.
    pub fn cursor<'a>(&'a self, txn: Option<&'a Transaction>) -> Result<crate::Cursor<'a>> {
        self.env.check_open()?;
        crate::cursor::Cursor::new(self, txn)
    }

    /// Verifies the whole tree's invariants.
    pub fn check_integrity(&self) -> Result<()> {
        self.env.check_open()?;
        let result = self.inner.tree.check_integrity(self.env.ctx());
        self.inner.note_fault(result)
    }

    /// Diagnostic: the btree height (1 for a lone leaf root).
    pub fn tree_height(&self) -> Result<u32> {
        self.env.check_open()?;
        self.inner.tree.height(self.env.ctx())
    }

    /// Closes the handle. `txn-still-open` while live transactions pend
    /// operations against this database.
    pub fn close(self) -> Result<()> {
        self.env.check_no_txn_for_db(self.inner.name)?;
        self.env.forget_database(self.inner.name);
        Ok(())
    }
}
