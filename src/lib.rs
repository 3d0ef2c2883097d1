//! # settdb: Embedded Transactional Key-Value Storage
//!
//! settdb is an embedded, transactional, ordered key-value engine backed by
//! a single-file paged B-tree. A sett is a badger's burrow: one entrance,
//! a lot of well-organized tunnels.
//!
//! - **Ordered databases**: up to N named key spaces per file, with
//!   numeric, float, or binary key types, fixed or variable-length keys
//!   and records, and optional duplicate keys
//! - **Crash safety**: a rotating write-ahead journal with changeset
//!   records; commit is an fsync point, recovery replays on open
//! - **Paged storage**: 1–64 KiB pages, slotted B-tree nodes with
//!   extended keys and extended duplicate tables in blob storage, a page
//!   cache with a background flush worker, and a file-wide freelist
//! - **In-memory mode**: the same engine over a RAM buffer
//!
//! ## Quick Start
//!
//! ```ignore
//! use settdb::{DatabaseOptions, EnvOptions, Environment};
//!
//! let env = Environment::create(
//!     EnvOptions::new("./data.db")
//!         .page_size(16384)
//!         .enable_transactions()
//!         .enable_recovery(),
//! )?;
//! let db = env.create_database(1, DatabaseOptions::new())?;
//!
//! let txn = env.begin_txn()?;
//! db.insert(Some(&txn), b"hello", b"world")?;
//! txn.commit()?;
//!
//! assert_eq!(db.find(None, b"hello")?, Some(b"world".to_vec()));
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Environment / Database / Cursor       │
//! ├─────────────────────────────────────────┤
//! │   Transaction trees + conflict checks   │
//! ├─────────────────────────────────────────┤
//! │   B-tree index   │  slotted node proxy  │
//! ├──────────────────┴──────────────────────┤
//! │   Blob manager   │  Journal + changesets│
//! ├──────────────────┴──────────────────────┤
//! │   Page manager: cache, freelist, worker │
//! ├─────────────────────────────────────────┤
//! │   Device: file / mmap / RAM             │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Every fallible call returns [`eyre::Result`]. Failures callers match on
//! programmatically carry a [`StoreError`] retrievable with
//! [`store_error`]; everything else is context for humans.
//!
//! ## Module Overview
//!
//! - [`config`]: environment and database options, layout constants
//! - [`device`]: block I/O over file, memory map, or RAM
//! - [`storage`]: pages, the cache, the freelist, the background worker
//! - [`blob`]: out-of-line payload storage
//! - [`journal`]: write-ahead logging, changesets, recovery inputs
//! - [`btree`]: the slotted node layout and tree algorithms
//! - [`txn`]: transaction trees and the transaction manager

#[macro_use]
mod macros;

pub mod blob;
pub mod btree;
pub mod config;
pub mod cursor;
pub mod db;
pub mod device;
mod env;
pub mod error;
pub mod journal;
pub mod storage;
pub mod txn;

pub use btree::node::DupePosition;
pub use config::{DatabaseOptions, EnvOptions, KeyType, UNLIMITED};
pub use cursor::{Cursor, MatchMode};
pub use db::{Database, InsertFlags};
pub use env::{Environment, Transaction};
pub use error::{store_error, StoreError};
