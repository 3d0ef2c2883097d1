//! # Storage Layer
//!
//! The paged storage core: page representation, the page cache, the
//! file-wide freelist, the background flush worker, and the `PageManager`
//! facade tying them together over a [`Device`](crate::device::Device).
//!
//! ## Page Identity
//!
//! A page is identified by its byte offset in the environment file (the
//! "address"). Page 0 is always the environment header. Blob ids are byte
//! offsets too, which is why nothing in this layer assumes page-number
//! arithmetic.
//!
//! ## Page Lifecycle
//!
//! ```text
//!    alloc/fetch            mutate                journal             flush
//! ┌────────────┐   ┌─────────────────────┐   ┌──────────────┐   ┌───────────┐
//! │ cache miss │──>│ pinned in changeset │──>│ images fsync │──>│ worker or │
//! │ reads disk │   │ (cannot be evicted) │   │ to journal   │   │ close     │
//! └────────────┘   └─────────────────────┘   └──────────────┘   └───────────┘
//! ```
//!
//! A page that belongs to the current changeset is pinned; the purge scan
//! skips pinned pages unconditionally. A dirty page whose covering journal
//! record is not yet durable is also skipped, which is how the write-ahead
//! invariant ("no page with LSN N on disk before the journal holds LSN ≥ N")
//! is enforced mechanically rather than by convention.
//!
//! ## Module Organization
//!
//! - `page`: persisted 17-byte page header and the in-memory `Page`
//! - `cache`: arena-based cache with second-chance eviction
//! - `freelist`: file-wide free page runs with coalescing
//! - `worker`: the background flusher thread and its bounded queue
//! - `pager`: the `PageManager` facade used by every higher layer

pub mod cache;
pub mod freelist;
pub mod page;
pub mod pager;
pub mod worker;

pub use cache::PageCache;
pub use freelist::Freelist;
pub use page::{Page, PageType, PersistedPageHeader};
pub use pager::{FetchMode, PageManager};
pub use worker::{WorkerHandle, WorkerMessage};

use eyre::{ensure, Result};
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// Parses a zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy<'a, T: FromBytes + KnownLayout + Immutable>(
    bytes: &'a [u8],
    type_name: &str,
) -> Result<&'a T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::ref_from_bytes(&bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}

/// Parses a mutable zerocopy struct from a byte slice with size validation.
#[inline]
pub fn parse_zerocopy_mut<'a, T: FromBytes + KnownLayout + zerocopy::IntoBytes>(
    bytes: &'a mut [u8],
    type_name: &str,
) -> Result<&'a mut T> {
    let size = std::mem::size_of::<T>();
    ensure!(
        bytes.len() >= size,
        "buffer too small for {}: {} < {}",
        type_name,
        bytes.len(),
        size
    );
    T::mut_from_bytes(&mut bytes[..size])
        .map_err(|e| eyre::eyre!("failed to parse {}: {:?}", type_name, e))
}
