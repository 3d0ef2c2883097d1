//! # Environment
//!
//! The single-file container: header page with database descriptors,
//! device + page manager + blob manager + journal + transaction manager
//! wiring, crash recovery on open, and the cooperative close protocol.
//!
//! ## Header Page Layout (page 0)
//!
//! After the 17-byte page header:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------
//! 0       4     magic "SETT"
//! 4       4     version {major, minor, rev, file format}
//! 8       4     page size
//! 12      2     max databases
//! 14      4     environment flags
//! 18      8     pager-state blob id (0 = none)
//! 26      6     reserved
//! 32      32*N  database descriptors
//! ```
//!
//! Each descriptor: name (2), key type (2), key size (2), flags (4), root
//! page (8), record size (4), compression (1), reserved (9). A name of 0
//! marks a free slot.
//!
//! ## Open Protocol
//!
//! 1. Read the first 49 bytes raw to learn the page size (the pager cannot
//!    exist before that).
//! 2. Build the device + pager, fetch and verify the header page.
//! 3. Open the journal pair. Non-empty journal + recovery disabled →
//!    `needs-recovery`; recovery enabled → replay (changeset redo, then
//!    committed logical operations not covered by any changeset), flush,
//!    clear.
//! 4. Load the persisted freelist from the pager-state blob.
//!
//! ## Close Protocol
//!
//! Live transactions are aborted; dirty pages flush; freed tail pages are
//! truncated away; the freelist is persisted; the journal is cleared
//! (a clean close needs no recovery); the background worker drains and
//! stops.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::blob::BlobManager;
use crate::btree::node::NodeContext;
use crate::config::constants::{
    DESCRIPTOR_SIZE, ENV_HEADER_SIZE, ENV_MAGIC, ENV_VERSION, PAGE_HEADER_SIZE,
};
use crate::config::{DatabaseOptions, EnvFlags, EnvOptions, KeyType, UNLIMITED};
use crate::db::{Database, DatabaseInner};
use crate::device::{Device, FileDevice, MappedDevice, MemoryDevice};
use crate::error::{store_error, typed, StoreError};
use crate::journal::{Journal, RecordPayload};
use crate::storage::{FetchMode, PageManager, PageType, PersistedPageHeader};
use crate::txn::tree::{OpKind, OpState};
use crate::txn::{TransactionManager, TxnInner, TxnState};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct EnvHeader {
    magic: [u8; 4],
    version: [u8; 4],
    page_size: U32,
    max_databases: U16,
    flags: U32,
    pager_state_blob: U64,
    reserved: [u8; 6],
}

impl EnvHeader {
    zerocopy_accessors! {
        page_size: u32,
        max_databases: u16,
        flags: u32,
        pager_state_blob: u64,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct DatabaseDescriptor {
    name: U16,
    key_type: U16,
    key_size: U16,
    flags: U32,
    root_page: U64,
    record_size: U32,
    compression: u8,
    reserved: [u8; 9],
}

impl DatabaseDescriptor {
    zerocopy_accessors! {
        name: u16,
        key_type: u16,
        key_size: u16,
        flags: u32,
        root_page: u64,
        record_size: u32,
    }

    pub(crate) fn to_options(self) -> Result<DatabaseOptions> {
        Ok(DatabaseOptions {
            key_type: KeyType::from_raw(self.key_type())?,
            key_size: if self.key_size() == 0 {
                UNLIMITED
            } else {
                self.key_size() as u32
            },
            record_size: self.record_size(),
            flags: crate::config::DbFlags::from_bits(self.flags()),
        })
    }
}

/// A transaction handle. Dropping it without committing aborts it.
pub struct Transaction {
    pub(crate) inner: Arc<TxnInner>,
    env: Arc<EnvInner>,
    finished: bool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").finish()
    }
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.inner.id()
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.env.commit_txn(&self.inner)
    }

    pub fn abort(mut self) -> Result<()> {
        self.finished = true;
        self.env.abort_txn(&self.inner)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && self.inner.is_active() {
            if let Err(err) = self.env.abort_txn(&self.inner) {
                tracing::warn!(txn = self.inner.id(), %err, "implicit abort on drop failed");
            }
        }
    }
}

pub(crate) struct EnvInner {
    pub(crate) options: EnvOptions,
    pub(crate) pager: PageManager,
    pub(crate) blobs: BlobManager,
    pub(crate) journal: Option<Journal>,
    pub(crate) txns: TransactionManager,
    databases: Mutex<HashMap<u16, Arc<DatabaseInner>>>,
    /// Serializes every write operation: single-writer model.
    pub(crate) write_lock: Mutex<()>,
    closed: AtomicBool,
}

/// An open environment: one file, many databases.
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").finish()
    }
}

impl Environment {
    // ------------------------------------------------------------------
    // construction
    // ------------------------------------------------------------------

    fn build_device(options: &EnvOptions, create: bool) -> Result<Arc<dyn Device>> {
        if options.flags.in_memory {
            return Ok(Arc::new(MemoryDevice::new()));
        }
        let path = &options.path;
        if path.as_os_str().is_empty() {
            return Err(typed_param("a file-backed environment needs a path"));
        }
        if options.flags.disable_mmap {
            Ok(if create {
                Arc::new(FileDevice::create(path)?)
            } else {
                Arc::new(FileDevice::open(path, options.flags.read_only)?)
            })
        } else {
            Ok(if create {
                Arc::new(MappedDevice::create(path)?)
            } else {
                Arc::new(MappedDevice::open(path, options.flags.read_only)?)
            })
        }
    }

    /// Creates a new environment file (truncating any existing one).
    pub fn create(options: EnvOptions) -> Result<Environment> {
        options.validate()?;
        if options.flags.read_only {
            return Err(typed_param("cannot create a read-only environment"));
        }

        let device = Self::build_device(&options, true)?;
        let durable = Arc::new(AtomicU64::new(u64::MAX));
        let pager = PageManager::new(
            Arc::clone(&device),
            options.page_size,
            options.effective_cache_size(),
            options.file_size_limit,
            false,
            Arc::clone(&durable),
        );

        let journal = if options.flags.enable_recovery {
            Some(Journal::open(
                &options.path,
                options.journal_switch_threshold,
                durable,
            )?)
        } else {
            None
        };
        if let Some(journal) = &journal {
            journal.clear()?;
        }

        // page 0: the environment header
        let header_addr = device.alloc_page(options.page_size)?;
        ensure!(header_addr == 0, "header page must sit at offset 0");
        let page = Arc::new(crate::storage::Page::new_zeroed(
            0,
            options.page_size,
            PageType::Header,
        ));
        {
            let mut guard = page.buffer();
            let mut header = EnvHeader {
                magic: ENV_MAGIC,
                version: ENV_VERSION,
                page_size: U32::new(0),
                max_databases: U16::new(0),
                flags: U32::new(0),
                pager_state_blob: U64::new(0),
                reserved: [0; 6],
            };
            header.set_page_size(options.page_size);
            header.set_max_databases(options.max_databases);
            header.set_flags(options.flags.to_bits());
            guard[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + ENV_HEADER_SIZE]
                .copy_from_slice(header.as_bytes());
        }
        pager.cache().insert(Arc::clone(&page));

        let inner = Arc::new(EnvInner {
            blobs: BlobManager::new(options.page_size),
            journal,
            txns: TransactionManager::new(),
            databases: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            pager,
            options,
        });

        crate::storage::worker::write_page_out(&**inner.pager.device(), &page)?;
        inner.pager.device().flush()?;
        tracing::info!(
            path = %inner.options.path.display(),
            page_size = inner.options.page_size,
            "environment created"
        );
        Ok(Environment { inner })
    }

    /// Opens an existing environment, running recovery when needed.
    pub fn open(options: EnvOptions) -> Result<Environment> {
        options.validate()?;
        if options.flags.in_memory {
            return Err(typed_param(
                "an in-memory environment cannot be reopened; use create",
            ));
        }

        // bootstrap: learn the page size before building the pager
        let probe = FileDevice::open(&options.path, true)?;
        let mut head = [0u8; PAGE_HEADER_SIZE + ENV_HEADER_SIZE];
        probe
            .read(0, &mut head)
            .wrap_err("failed to read the environment header")?;
        drop(probe);

        let header: &EnvHeader =
            crate::storage::parse_zerocopy(&head[PAGE_HEADER_SIZE..], "EnvHeader")?;
        if header.magic != ENV_MAGIC {
            return Err(typed(
                StoreError::IntegrityViolated,
                format!("bad file magic {:02x?}", header.magic),
            ));
        }
        if header.version[0] != ENV_VERSION[0] || header.version[3] != ENV_VERSION[3] {
            return Err(typed(
                StoreError::InvalidParameter,
                format!(
                    "incompatible file version {:?} (supported {:?})",
                    header.version, ENV_VERSION
                ),
            ));
        }
        let page_size = header.page_size();
        let max_databases = header.max_databases();
        let pager_state_blob = header.pager_state_blob();

        let mut options = options;
        options.page_size = page_size;
        options.max_databases = max_databases;

        let device = Self::build_device(&options, false)?;
        let durable = Arc::new(AtomicU64::new(u64::MAX));
        let pager = PageManager::new(
            Arc::clone(&device),
            page_size,
            options.effective_cache_size(),
            options.file_size_limit,
            options.flags.read_only,
            Arc::clone(&durable),
        );

        let journal = if options.flags.read_only {
            None
        } else {
            Some(Journal::open(
                &options.path,
                options.journal_switch_threshold,
                Arc::clone(&durable),
            )?)
        };

        let inner = Arc::new(EnvInner {
            blobs: BlobManager::new(page_size),
            journal,
            txns: TransactionManager::new(),
            databases: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            pager,
            options,
        });

        if let Some(journal) = &inner.journal {
            if !journal.is_empty() {
                if !inner.options.flags.enable_recovery {
                    return Err(typed(
                        StoreError::NeedsRecovery,
                        "journal is not empty and auto-recovery is disabled",
                    ));
                }
                inner.recover()?;
            }
        }

        // restore the durable watermark semantics: everything on disk is
        // covered now
        durable.store(u64::MAX, Ordering::Release);

        if pager_state_blob != 0 {
            let state = inner.blobs.read(&inner.pager, pager_state_blob)?;
            inner.pager.load_freelist(&state)?;
        }

        tracing::info!(
            path = %inner.options.path.display(),
            page_size,
            "environment opened"
        );
        Ok(Environment { inner })
    }

    // ------------------------------------------------------------------
    // public surface
    // ------------------------------------------------------------------

    pub fn page_size(&self) -> u32 {
        self.inner.options.page_size
    }

    pub fn flags(&self) -> EnvFlags {
        self.inner.options.flags
    }

    /// Creates a database under `name` (a number in 1..=0xF000).
    pub fn create_database(&self, name: u16, options: DatabaseOptions) -> Result<Database> {
        self.inner.check_open()?;
        self.inner.check_writable()?;
        options.validate(name, self.inner.options.page_size)?;

        let _guard = self.inner.write_lock.lock();
        let result = self.inner.create_database_locked(name, options, &self.inner);
        self.inner.finish_structural(result)
    }

    /// Opens an existing database.
    pub fn open_database(&self, name: u16) -> Result<Database> {
        self.inner.check_open()?;
        let _guard = self.inner.write_lock.lock();

        if self.inner.databases.lock().contains_key(&name) {
            return Err(typed(
                StoreError::DatabaseAlreadyOpen,
                format!("database {name} is already open"),
            ));
        }
        let db = self.inner.open_database_locked(name, &self.inner)?;
        Ok(Database::new(Arc::clone(&self.inner), db))
    }

    /// Erases a database and frees its pages. The database must be closed.
    pub fn erase_database(&self, name: u16) -> Result<()> {
        self.inner.check_open()?;
        self.inner.check_writable()?;
        let _guard = self.inner.write_lock.lock();

        if self.inner.databases.lock().contains_key(&name) {
            return Err(typed(
                StoreError::DatabaseAlreadyOpen,
                format!("database {name} must be closed before erase"),
            ));
        }

        let result = (|| -> Result<()> {
            let (slot, descriptor) = self.inner.find_descriptor(name)?.ok_or_else(|| {
                typed(
                    StoreError::DatabaseNotFound,
                    format!("database {name} does not exist"),
                )
            })?;

            // tear the tree down, freeing nodes and blobs
            let db = DatabaseInner::from_descriptor(&self.inner, name, descriptor)?;
            db.destroy(&self.inner)?;

            self.inner.update_descriptor(slot, |d| {
                d.set_name(0);
                d.set_key_type(0);
                d.set_key_size(0);
                d.set_flags(0);
                d.set_root_page(0);
                d.set_record_size(0);
            })?;
            Ok(())
        })();
        self.inner.finish_structural(result)?;
        tracing::info!(name, "database erased");
        Ok(())
    }

    /// Renames a database in place.
    pub fn rename_database(&self, old_name: u16, new_name: u16) -> Result<()> {
        self.inner.check_open()?;
        self.inner.check_writable()?;
        if new_name == 0 || new_name > crate::config::constants::MAX_DATABASE_NAME {
            return Err(typed_param("new database name out of range"));
        }
        let _guard = self.inner.write_lock.lock();

        let result = (|| -> Result<()> {
            if self.inner.find_descriptor(new_name)?.is_some() {
                return Err(typed(
                    StoreError::DatabaseAlreadyExists,
                    format!("database {new_name} already exists"),
                ));
            }
            let (slot, _) = self.inner.find_descriptor(old_name)?.ok_or_else(|| {
                typed(
                    StoreError::DatabaseNotFound,
                    format!("database {old_name} does not exist"),
                )
            })?;
            self.inner
                .update_descriptor(slot, |d| d.set_name(new_name))?;
            Ok(())
        })();
        self.inner.finish_structural(result)?;

        if let Some(db) = self.inner.databases.lock().remove(&old_name) {
            self.inner.databases.lock().insert(new_name, db);
        }
        Ok(())
    }

    /// The names of every database in the environment.
    pub fn database_names(&self) -> Result<Vec<u16>> {
        self.inner.check_open()?;
        let page = self.inner.pager.fetch(0, FetchMode::ReadOnly)?;
        let guard = page.buffer();
        let mut names = Vec::new();
        for slot in 0..self.inner.options.max_databases as usize {
            let descriptor = self.inner.descriptor_at(&guard, slot)?;
            if descriptor.name() != 0 {
                names.push(descriptor.name());
            }
        }
        Ok(names)
    }

    /// Begins an explicit transaction.
    pub fn begin_txn(&self) -> Result<Transaction> {
        self.inner.check_open()?;
        self.inner.check_writable()?;
        if !self.inner.options.flags.enable_transactions {
            return Err(typed(
                StoreError::InvalidParameter,
                "transactions are not enabled for this environment",
            ));
        }
        let inner = self.inner.txns.begin();
        if let Some(journal) = &self.inner.journal {
            journal.append_begin(inner.id())?;
        }
        Ok(Transaction {
            inner,
            env: Arc::clone(&self.inner),
            finished: false,
        })
    }

    /// Flushes dirty pages and the journal to the device.
    pub fn flush(&self) -> Result<()> {
        self.inner.check_open()?;
        let _guard = self.inner.write_lock.lock();
        self.inner.pager.flush_all()
    }

    /// Closes the environment: aborts live transactions, flushes, persists
    /// the pager state, truncates freed tail pages, stops the worker.
    pub fn close(self) -> Result<()> {
        self.inner.close()
    }
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            if let Err(err) = self.close_impl() {
                tracing::warn!(%err, "environment close on drop failed");
            }
        }
    }
}

fn typed_param(msg: &'static str) -> eyre::Report {
    typed(StoreError::InvalidParameter, msg)
}

impl EnvInner {
    pub(crate) fn ctx(&self) -> NodeContext<'_> {
        NodeContext {
            pager: &self.pager,
            blobs: &self.blobs,
        }
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        ensure!(
            !self.closed.load(Ordering::Acquire),
            "environment handle used after close"
        );
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.options.flags.read_only {
            return Err(typed(
                StoreError::WriteProtected,
                "environment is opened read-only",
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // descriptor plumbing
    // ------------------------------------------------------------------

    fn descriptor_at(&self, header_page: &[u8], slot: usize) -> Result<DatabaseDescriptor> {
        let at = PAGE_HEADER_SIZE + ENV_HEADER_SIZE + slot * DESCRIPTOR_SIZE;
        let descriptor: &DatabaseDescriptor =
            crate::storage::parse_zerocopy(&header_page[at..], "DatabaseDescriptor")?;
        Ok(*descriptor)
    }

    pub(crate) fn find_descriptor(
        &self,
        name: u16,
    ) -> Result<Option<(usize, DatabaseDescriptor)>> {
        let page = self.pager.fetch(0, FetchMode::ReadOnly)?;
        let guard = page.buffer();
        for slot in 0..self.options.max_databases as usize {
            let descriptor = self.descriptor_at(&guard, slot)?;
            if descriptor.name() == name {
                return Ok(Some((slot, descriptor)));
            }
        }
        Ok(None)
    }

    fn free_descriptor_slot(&self) -> Result<Option<usize>> {
        let page = self.pager.fetch(0, FetchMode::ReadOnly)?;
        let guard = page.buffer();
        for slot in 0..self.options.max_databases as usize {
            if self.descriptor_at(&guard, slot)?.name() == 0 {
                return Ok(Some(slot));
            }
        }
        Ok(None)
    }

    pub(crate) fn update_descriptor(
        &self,
        slot: usize,
        f: impl FnOnce(&mut DatabaseDescriptor),
    ) -> Result<()> {
        let page = self.pager.fetch(0, FetchMode::ReadWrite)?;
        let mut guard = page.buffer();
        let at = PAGE_HEADER_SIZE + ENV_HEADER_SIZE + slot * DESCRIPTOR_SIZE;
        let descriptor: &mut DatabaseDescriptor =
            crate::storage::parse_zerocopy_mut(&mut guard[at..], "DatabaseDescriptor")?;
        f(descriptor);
        Ok(())
    }

    fn update_env_header(&self, f: impl FnOnce(&mut EnvHeader)) -> Result<()> {
        let page = self.pager.fetch(0, FetchMode::ReadWrite)?;
        let mut guard = page.buffer();
        let header: &mut EnvHeader =
            crate::storage::parse_zerocopy_mut(&mut guard[PAGE_HEADER_SIZE..], "EnvHeader")?;
        f(header);
        Ok(())
    }

    // ------------------------------------------------------------------
    // operation scope
    // ------------------------------------------------------------------

    /// Journals and releases the current changeset. `covered_op_lsn`
    /// names the logical operation it realizes (0 for structural work).
    pub(crate) fn flush_operation(&self, covered_op_lsn: u64) -> Result<()> {
        let changeset = self.pager.take_changeset();
        if changeset.is_empty() {
            return Ok(());
        }
        if let Some(journal) = &self.journal {
            journal.append_changeset(&changeset, covered_op_lsn)?;
        }
        let addresses = changeset.release();
        self.pager.request_flush(addresses);
        Ok(())
    }

    /// Rolls the current changeset back.
    pub(crate) fn discard_operation(&self) {
        self.pager.discard_changeset();
    }

    /// Completes a structural operation: flush on success, roll back on
    /// error.
    pub(crate) fn finish_structural<T>(&self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) => {
                self.flush_operation(0)?;
                Ok(value)
            }
            Err(err) => {
                self.discard_operation();
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // databases
    // ------------------------------------------------------------------

    fn create_database_locked(
        &self,
        name: u16,
        options: DatabaseOptions,
        self_arc: &Arc<EnvInner>,
    ) -> Result<Database> {
        if self.find_descriptor(name)?.is_some() {
            return Err(typed(
                StoreError::DatabaseAlreadyExists,
                format!("database {name} already exists"),
            ));
        }
        let slot = self.free_descriptor_slot()?.ok_or_else(|| {
            typed(
                StoreError::LimitsReached,
                format!(
                    "all {} database descriptor slots are in use",
                    self.options.max_databases
                ),
            )
        })?;

        let db = DatabaseInner::create(self, name, options)?;

        let descriptor_options = db.options().clone();
        self.update_descriptor(slot, |d| {
            d.set_name(name);
            d.set_key_type(descriptor_options.key_type as u16);
            d.set_key_size(match descriptor_options.fixed_key_size() {
                Some(fixed) => fixed,
                None => 0,
            });
            d.set_flags(descriptor_options.flags.to_bits());
            d.set_root_page(db.root_address());
            d.set_record_size(descriptor_options.record_size);
        })?;

        let db = Arc::new(db);
        self.databases.lock().insert(name, Arc::clone(&db));
        tracing::info!(name, "database created");
        Ok(Database::new(Arc::clone(self_arc), db))
    }

    fn open_database_locked(&self, name: u16, _self_arc: &Arc<EnvInner>) -> Result<Arc<DatabaseInner>> {
        let (_, descriptor) = self.find_descriptor(name)?.ok_or_else(|| {
            typed(
                StoreError::DatabaseNotFound,
                format!("database {name} does not exist"),
            )
        })?;
        let db = Arc::new(DatabaseInner::from_descriptor(self, name, descriptor)?);
        self.databases.lock().insert(name, Arc::clone(&db));
        Ok(db)
    }

    /// A handle for the commit flush and recovery: the open one if present,
    /// else a transient one from the descriptor.
    fn database_for_replay(&self, name: u16) -> Result<Arc<DatabaseInner>> {
        if let Some(db) = self.databases.lock().get(&name) {
            return Ok(Arc::clone(db));
        }
        let (_, descriptor) = self.find_descriptor(name)?.ok_or_else(|| {
            typed(
                StoreError::DatabaseNotFound,
                format!("database {name} vanished mid-replay"),
            )
        })?;
        Ok(Arc::new(DatabaseInner::from_descriptor(
            self, name, descriptor,
        )?))
    }

    pub(crate) fn forget_database(&self, name: u16) {
        self.databases.lock().remove(&name);
    }

    /// `txn-still-open` when a live transaction pends operations on `name`.
    pub(crate) fn check_no_txn_for_db(&self, name: u16) -> Result<()> {
        let mut blocked = false;
        self.txns.for_each_live(|txn| {
            if txn.is_active() && txn.with_tree(name, |t| !t.is_empty()).unwrap_or(false) {
                blocked = true;
            }
        });
        if blocked {
            return Err(typed(
                StoreError::TxnStillOpen,
                format!("live transactions still reference database {name}"),
            ));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // transactions
    // ------------------------------------------------------------------

    pub(crate) fn commit_txn(&self, txn: &Arc<TxnInner>) -> Result<()> {
        self.check_open()?;
        ensure!(txn.is_active(), "commit of a finished transaction");
        let _guard = self.write_lock.lock();

        // the commit record is the durability point
        if let Some(journal) = &self.journal {
            journal.append_commit(txn.id())?;
        }

        // flush the pending operations into the btree in issue order
        for (db_name, mut tree) in txn.take_trees() {
            let db = self.database_for_replay(db_name)?;
            for op in tree.ops() {
                let result = db.apply_op(self, op);
                match result {
                    Ok(()) => self.flush_operation(op.lsn)?,
                    Err(err) => {
                        self.discard_operation();
                        return Err(err).wrap_err_with(|| {
                            format!("commit of transaction {} failed", txn.id())
                        });
                    }
                }
            }
            tree.mark_all(OpState::Flushed);
        }

        txn.set_state(TxnState::Committed);
        self.txns.retire(txn.id());
        tracing::debug!(txn = txn.id(), "transaction committed");

        self.maybe_checkpoint()?;
        Ok(())
    }

    pub(crate) fn abort_txn(&self, txn: &Arc<TxnInner>) -> Result<()> {
        ensure!(txn.is_active(), "abort of a finished transaction");
        if let Some(journal) = &self.journal {
            journal.append_abort(txn.id())?;
        }
        txn.mark_all(OpState::Aborted);
        txn.set_state(TxnState::Aborted);
        txn.take_trees();
        self.txns.retire(txn.id());
        tracing::debug!(txn = txn.id(), "transaction aborted");
        Ok(())
    }

    /// Rotates the journal behind a full page flush when the active file
    /// crossed the switch threshold.
    fn maybe_checkpoint(&self) -> Result<()> {
        let Some(journal) = &self.journal else {
            return Ok(());
        };
        if !journal.should_rotate() {
            return Ok(());
        }
        self.pager.flush_all()?;
        journal.rotate()?;
        tracing::debug!("checkpoint: pages flushed, journal rotated");
        Ok(())
    }

    // ------------------------------------------------------------------
    // recovery
    // ------------------------------------------------------------------

    fn recover(&self) -> Result<()> {
        let journal = self.journal.as_ref().expect("recover without a journal");
        let records = journal.scan()?;
        tracing::info!(records = records.len(), "recovery started");

        // pass 1: classify
        let mut committed: hashbrown::HashSet<u64> = hashbrown::HashSet::new();
        let mut covered_ops: hashbrown::HashSet<u64> = hashbrown::HashSet::new();
        let mut changesets: Vec<(u64, u64, Vec<(u64, Vec<u8>)>)> = Vec::new();

        let mut pending: Option<(u64, u64, u32, Vec<(u64, Vec<u8>)>)> = None;
        for record in &records {
            match &record.payload {
                RecordPayload::Commit { txn_id } => {
                    committed.insert(*txn_id);
                }
                RecordPayload::ChangesetStart {
                    covered_op_lsn,
                    page_count,
                    ..
                } => {
                    pending = Some((record.lsn, *covered_op_lsn, *page_count, Vec::new()));
                }
                RecordPayload::ChangesetPage { address, image } => {
                    if let Some((_, _, _, pages)) = pending.as_mut() {
                        pages.push((*address, image.clone()));
                    }
                }
                RecordPayload::ChangesetEnd { checksum, .. } => {
                    if let Some((lsn, covered, count, pages)) = pending.take() {
                        let images_crc = {
                            const CRC32: crc::Crc<u32> =
                                crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);
                            let mut digest = CRC32.digest();
                            for (_, image) in &pages {
                                digest.update(image);
                            }
                            digest.finalize()
                        };
                        if pages.len() == count as usize && images_crc == *checksum {
                            if covered != 0 {
                                covered_ops.insert(covered);
                            }
                            changesets.push((lsn, covered, pages));
                        } else {
                            tracing::warn!(
                                lsn,
                                "incomplete or corrupt changeset skipped during recovery"
                            );
                        }
                    }
                }
                _ => {}
            }
        }

        // pass 2: physical redo of complete changesets
        let device = self.pager.device();
        let mut redone = 0usize;
        for (lsn, _covered, pages) in &changesets {
            for (address, image) in pages {
                let on_disk_lsn = {
                    let mut head = [0u8; PAGE_HEADER_SIZE];
                    match device.read(*address, &mut head) {
                        Ok(()) => PersistedPageHeader::from_bytes(&head)?.lsn(),
                        Err(_) => 0, // the page never reached the file
                    }
                };
                if *lsn > on_disk_lsn {
                    device.write_page(*address, image)?;
                    redone += 1;
                }
            }
        }

        // pass 3: logical replay of committed operations whose changeset
        // never became durable
        let mut replayed = 0usize;
        for record in &records {
            let (txn_id, lsn) = match &record.payload {
                RecordPayload::Insert { txn_id, .. } | RecordPayload::Erase { txn_id, .. } => {
                    (*txn_id, record.lsn)
                }
                _ => continue,
            };
            if !committed.contains(&txn_id) || covered_ops.contains(&lsn) {
                continue;
            }

            match &record.payload {
                RecordPayload::Insert {
                    db,
                    flags,
                    dup_position,
                    key,
                    record: value,
                    ..
                } => {
                    let handle = self.database_for_replay(*db)?;
                    let op = crate::txn::tree::TxnOperation {
                        kind: if flags & crate::db::INSERT_FLAG_OVERWRITE != 0 {
                            OpKind::Overwrite
                        } else {
                            OpKind::Insert
                        },
                        flags: *flags,
                        key: key.clone(),
                        record: value.clone(),
                        dup_position: *dup_position,
                        lsn,
                        state: OpState::Pending,
                    };
                    let result = handle.apply_op(self, &op);
                    self.absorb_replay_result(result)?;
                }
                RecordPayload::Erase {
                    db,
                    dup_position,
                    key,
                    ..
                } => {
                    let handle = self.database_for_replay(*db)?;
                    let op = crate::txn::tree::TxnOperation {
                        kind: OpKind::Erase,
                        flags: 0,
                        key: key.clone(),
                        record: Vec::new(),
                        dup_position: *dup_position,
                        lsn,
                        state: OpState::Pending,
                    };
                    let result = handle.apply_op(self, &op);
                    self.absorb_replay_result(result)?;
                }
                _ => unreachable!(),
            }
            replayed += 1;
        }

        // everything is in memory now; make it durable and start clean
        self.pager.flush_all()?;
        journal.clear()?;
        tracing::info!(redone, replayed, "recovery finished");
        Ok(())
    }

    /// Replay tolerates already-applied operations (idempotence): a
    /// duplicate-key or key-not-found outcome means the effect is present.
    fn absorb_replay_result(&self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => {
                // recovery keeps no journal: release without re-journaling
                let changeset = self.pager.take_changeset();
                changeset.release();
                Ok(())
            }
            Err(err)
                if matches!(
                    store_error(&err),
                    Some(StoreError::DuplicateKey) | Some(StoreError::KeyNotFound)
                ) =>
            {
                self.discard_operation();
                tracing::debug!(%err, "replay skipped an already-applied operation");
                Ok(())
            }
            Err(err) => {
                self.discard_operation();
                Err(err)
            }
        }
    }

    // ------------------------------------------------------------------
    // close
    // ------------------------------------------------------------------

    fn close_impl(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _guard = self.write_lock.lock();

        // auto-abort whatever is still live
        for txn in self.txns.drain_live() {
            if txn.is_active() {
                if let Some(journal) = &self.journal {
                    journal.append_abort(txn.id())?;
                }
                txn.mark_all(OpState::Aborted);
                txn.set_state(TxnState::Aborted);
                tracing::debug!(txn = txn.id(), "transaction auto-aborted on close");
            }
        }

        if !self.options.flags.read_only && !self.options.flags.in_memory {
            self.pager.flush_all()?;
            self.pager.truncate_tail()?;
            self.persist_pager_state()?;
            self.pager.flush_all()?;
            self.pager.device().flush()?;
            if let Some(journal) = &self.journal {
                journal.clear()?;
            }
        }

        self.pager.shutdown();
        tracing::info!("environment closed");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.close_impl()
    }

    /// Writes the freelist into the pager-state blob referenced from the
    /// header. The blob is allocated with slack first, then overwritten in
    /// place with the post-allocation freelist, so the persisted runs
    /// describe the file as it actually is.
    fn persist_pager_state(&self) -> Result<()> {
        let result = (|| -> Result<()> {
            // drop the previous state blob
            let page = self.pager.fetch(0, FetchMode::ReadOnly)?;
            let old_blob = {
                let guard = page.buffer();
                let header: &EnvHeader =
                    crate::storage::parse_zerocopy(&guard[PAGE_HEADER_SIZE..], "EnvHeader")?;
                header.pager_state_blob()
            };
            drop(page);
            if old_blob != 0 {
                self.blobs.erase(&self.pager, old_blob)?;
            }

            let mut attempt = self.pager.freelist_snapshot();
            attempt.resize(attempt.len() + 64, 0);
            let blob_id = self.blobs.allocate(&self.pager, &attempt)?;

            let exact = self.pager.freelist_snapshot();
            ensure!(
                exact.len() <= attempt.len(),
                "freelist grew past its persistence slack"
            );
            let final_id = self.blobs.overwrite(&self.pager, blob_id, &exact)?;
            ensure!(final_id == blob_id, "pager state blob moved during overwrite");

            self.update_env_header(|h| h.set_pager_state_blob(blob_id))?;
            Ok(())
        })();
        self.finish_structural(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_header_is_32_bytes() {
        assert_eq!(std::mem::size_of::<EnvHeader>(), ENV_HEADER_SIZE);
    }

    #[test]
    fn database_descriptor_is_32_bytes() {
        assert_eq!(std::mem::size_of::<DatabaseDescriptor>(), DESCRIPTOR_SIZE);
    }

    #[test]
    fn create_and_reopen_round_trips_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("env.db");

        {
            let env = Environment::create(
                EnvOptions::new(&path).page_size(4096).max_databases(8),
            )
            .unwrap();
            env.close().unwrap();
        }

        let env = Environment::open(EnvOptions::new(&path)).unwrap();
        assert_eq!(env.page_size(), 4096);
        assert!(env.database_names().unwrap().is_empty());
        env.close().unwrap();
    }

    #[test]
    fn open_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err =
            Environment::open(EnvOptions::new(dir.path().join("absent.db"))).unwrap_err();
        assert_eq!(store_error(&err), Some(StoreError::Io));
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.db");
        std::fs::write(&path, vec![0xAAu8; 8192]).unwrap();

        let err = Environment::open(EnvOptions::new(&path)).unwrap_err();
        assert_eq!(store_error(&err), Some(StoreError::IntegrityViolated));
    }

    #[test]
    fn in_memory_environment_works_without_a_path() {
        let env = Environment::create(EnvOptions::in_memory()).unwrap();
        let db = env
            .create_database(1, DatabaseOptions::new())
            .unwrap();
        db.insert(None, b"k", b"v").unwrap();
        assert_eq!(db.find(None, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn begin_txn_requires_the_flag() {
        let env = Environment::create(EnvOptions::in_memory()).unwrap();
        let err = env.begin_txn().unwrap_err();
        assert_eq!(store_error(&err), Some(StoreError::InvalidParameter));
    }
}
