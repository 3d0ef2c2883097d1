//! # Configuration Constants
//!
//! This module centralizes the fixed layout and tuning constants, grouping
//! interdependent values together. Constants that depend on each other are
//! co-located to prevent mismatch bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE sizes (1 KiB .. 64 KiB, default 16 KiB, runtime-configurable)
//!       │
//!       ├─> PAGE_HEADER_SIZE (17 bytes, persisted: type, flags, lsn, crc)
//!       │
//!       ├─> NODE_LEADER_SIZE (33 bytes, after the page header on btree pages)
//!       │
//!       ├─> UPFRONT_HEADER_SIZE (12 bytes: capacity, freelist count,
//!       │       next offset; starts the node payload)
//!       │
//!       └─> BLOB_HEADER_SIZE (28 bytes, prefixes every blob)
//!
//! CACHE watermarks
//!       │
//!       ├─> PURGE_HIGH_WATERMARK: fraction of the configured cache size at
//!       │       which the main thread posts a purge request
//!       │
//!       └─> PURGE_LOW_WATERMARK: fraction to which the worker evicts
//!           (HIGH > LOW, or the worker would purge on every fetch)
//!
//! WORKER_QUEUE_CAPACITY
//!       │
//!       └─> FETCH_BLOCK_TIMEOUT_MS: how long a fetch waits for the worker to
//!           free capacity before failing with limits-reached
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `PAGE_HEADER_SIZE + NODE_LEADER_SIZE + UPFRONT_HEADER_SIZE` must leave
//!    room for at least four slot entries and their heap data on the smallest
//!    page (enforced by node-layout tests).
//! 2. In-page offsets are 16-bit; usable payload never exceeds `u16::MAX`
//!    because the maximum page size is 64 KiB minus the fixed headers.
//! 3. `PURGE_HIGH_WATERMARK > PURGE_LOW_WATERMARK`.

// ============================================================================
// PAGE GEOMETRY
// ============================================================================

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: u32 = 1024;

/// Largest supported page size. In-page offsets stay 16-bit at this size
/// because the fixed headers keep usable payload below `u16::MAX`.
pub const MAX_PAGE_SIZE: u32 = 65536;

/// Default page size when the caller does not configure one.
pub const DEFAULT_PAGE_SIZE: u32 = 16384;

/// Persisted page header: type tag (1), flags (4), lsn (8), crc (4).
pub const PAGE_HEADER_SIZE: usize = 17;

/// Btree node leader following the page header: flags (4), count (4),
/// ptr-down (8), left sibling (8), right sibling (8), level (1).
pub const NODE_LEADER_SIZE: usize = 33;

/// Upfront-index header starting the node payload: capacity (4),
/// freelist count (4), next offset (4).
pub const UPFRONT_HEADER_SIZE: usize = 12;

/// Blob header prefixing every out-of-line payload: id (8),
/// allocated size (8), size (8), flags (4).
pub const BLOB_HEADER_SIZE: usize = 28;

// ============================================================================
// ENVIRONMENT HEADER
// ============================================================================

/// File magic at the start of the environment header payload.
pub const ENV_MAGIC: [u8; 4] = *b"SETT";

/// Current file format version: major, minor, revision, file format.
pub const ENV_VERSION: [u8; 4] = [0, 3, 0, 1];

/// Fixed portion of the environment header payload before the descriptor
/// array.
pub const ENV_HEADER_SIZE: usize = 32;

/// One database descriptor: name (2), key type (2), key size (2), flags (4),
/// root page (8), record size (4), compression (1), reserved (9).
pub const DESCRIPTOR_SIZE: usize = 32;

/// Default number of descriptor slots in the header page.
pub const DEFAULT_MAX_DATABASES: u16 = 64;

/// Database names are u16 values in this range; 0 is reserved.
pub const MAX_DATABASE_NAME: u16 = 0xF000;

// ============================================================================
// CACHE AND BACKGROUND WORKER
// ============================================================================

/// Default page cache capacity in bytes (2 MiB).
pub const DEFAULT_CACHE_SIZE: usize = 2 * 1024 * 1024;

/// Fraction (percent) of the cache capacity at which a purge request is
/// posted to the background worker.
pub const PURGE_HIGH_WATERMARK: usize = 90;

/// Fraction (percent) of the cache capacity down to which the worker evicts.
pub const PURGE_LOW_WATERMARK: usize = 70;

const _: () = assert!(
    PURGE_HIGH_WATERMARK > PURGE_LOW_WATERMARK,
    "purge watermarks inverted: the worker would thrash"
);

/// Capacity of the bounded message queue feeding the background worker.
pub const WORKER_QUEUE_CAPACITY: usize = 64;

/// How long a fetch blocks waiting for the worker to free cache capacity
/// before failing with limits-reached.
pub const FETCH_BLOCK_TIMEOUT_MS: u64 = 2000;

// ============================================================================
// JOURNAL
// ============================================================================

/// Journal file header: magic (4), version (4), reserved (4).
pub const JOURNAL_FILE_HEADER_SIZE: usize = 12;

/// Magic at the start of each journal file.
pub const JOURNAL_MAGIC: [u8; 4] = *b"STJL";

/// Fixed portion of every journal record: size (4), lsn (8), kind (1).
pub const JOURNAL_RECORD_HEADER_SIZE: usize = 13;

/// Trailing checksum bytes of every journal record.
pub const JOURNAL_RECORD_TRAILER_SIZE: usize = 4;

/// Default size of the active journal file at which rotation is attempted.
pub const DEFAULT_JOURNAL_SWITCH_THRESHOLD: u64 = 4 * 1024 * 1024;

// ============================================================================
// BTREE TUNING
// ============================================================================

/// A node with at most this many keys is a merge candidate during erase.
pub const MERGE_LOW_WATERMARK: u32 = 3;

/// Estimated per-key heap bytes used to size the upfront index of
/// variable-length-key nodes.
pub const VARIABLE_KEY_ESTIMATE: usize = 24;

/// Inline record area width for variable-size records: an 8-byte region
/// (inline bytes or a blob id) plus one flags byte.
pub const INLINE_RECORD_AREA: usize = 8;

/// Largest fixed record size that is stored inline without the
/// force-records-inline flag.
pub const INLINE_RECORD_THRESHOLD: u32 = 8;

/// Returns the key size above which keys of a page this size are stored as
/// blobs with the extended-key flag.
pub fn extended_key_threshold(page_size: u32) -> usize {
    if page_size == 1024 {
        64
    } else if page_size <= 8 * 1024 {
        128
    } else {
        256
    }
}

/// Returns the number of inline duplicates a page this size tolerates before
/// the whole set migrates to an extended duplicate table.
pub fn duplicate_threshold(page_size: u32) -> usize {
    if page_size == 1024 {
        8
    } else if page_size <= 8 * 1024 {
        16
    } else {
        32
    }
}
