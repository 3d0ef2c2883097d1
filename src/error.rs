//! # Error Taxonomy
//!
//! This module defines the typed error surface of settdb. Internal code uses
//! `eyre::Result` throughout for rich context chains; failures that callers
//! need to match on programmatically are raised as a [`StoreError`] attached
//! to the report, so both worlds compose:
//!
//! ```ignore
//! use settdb::{store_error, StoreError};
//!
//! match db.erase(None, b"missing") {
//!     Err(report) if store_error(&report) == Some(StoreError::KeyNotFound) => {
//!         // expected outcome, not a fault
//!     }
//!     other => { other?; }
//! }
//! ```
//!
//! ## Error Classes
//!
//! | Class        | Variants                                   | Recovery    |
//! |--------------|--------------------------------------------|-------------|
//! | Argument     | InvalidParameter                           | fix input   |
//! | Logical      | KeyNotFound, DuplicateKey                  | expected    |
//! | Concurrency  | TxnConflict, TxnStillOpen                  | retry/abort |
//! | Environment  | DatabaseNotFound/AlreadyExists/AlreadyOpen | caller      |
//! | Resource     | LimitsReached, OutOfMemory                 | backoff     |
//! | Durability   | Io, NeedsRecovery, WriteProtected          | reopen      |
//! | Corruption   | IntegrityViolated                          | restore     |
//!
//! An `IntegrityViolated` fault additionally poisons the owning database for
//! the rest of the process lifetime: further write operations are rejected
//! until the file is reopened and recovered.

use thiserror::Error;

/// Typed failure codes surfaced by the public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("invalid parameter")]
    InvalidParameter,
    #[error("key not found")]
    KeyNotFound,
    #[error("duplicate key")]
    DuplicateKey,
    #[error("database integrity violated")]
    IntegrityViolated,
    #[error("environment is write protected")]
    WriteProtected,
    #[error("journal is not empty, recovery required")]
    NeedsRecovery,
    #[error("database not found")]
    DatabaseNotFound,
    #[error("database already exists")]
    DatabaseAlreadyExists,
    #[error("database already open")]
    DatabaseAlreadyOpen,
    #[error("resource limits reached")]
    LimitsReached,
    #[error("conflicting transaction operation on the same key")]
    TxnConflict,
    #[error("transactions are still open")]
    TxnStillOpen,
    #[error("i/o error")]
    Io,
    #[error("out of memory")]
    OutOfMemory,
}

/// Extracts the typed error code from a report, if one is attached.
///
/// Walks the chain so wrapped contexts (`wrap_err`) do not hide the code.
pub fn store_error(report: &eyre::Report) -> Option<StoreError> {
    for cause in report.chain() {
        if let Some(err) = cause.downcast_ref::<StoreError>() {
            return Some(*err);
        }
    }
    None
}

/// Builds a report carrying a typed code plus a human-readable context line.
///
/// The code stays downcastable through any further `wrap_err` layers.
pub(crate) fn typed<D>(code: StoreError, msg: D) -> eyre::Report
where
    D: std::fmt::Display + Send + Sync + 'static,
{
    eyre::Report::new(code).wrap_err(msg)
}

/// Wraps an OS-level failure as `StoreError::Io`, keeping the cause text.
pub(crate) fn io<D>(err: std::io::Error, msg: D) -> eyre::Report
where
    D: std::fmt::Display,
{
    typed(StoreError::Io, format!("{msg}: {err}"))
}
