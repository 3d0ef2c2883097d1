//! # Environment and Database Configuration
//!
//! Builder-style option structs validated before any file is touched. Bad
//! combinations surface as `StoreError::InvalidParameter` with a context
//! message naming the offending option, so misconfiguration never mutates
//! state.
//!
//! ## Recognized Options
//!
//! Environment level:
//! - `cache_size`: page cache budget in bytes; 0 means unlimited
//! - `page_size`: one of 1024, 2048, 4096, 8192, 16384, 32768, 65536
//! - `max_databases`: descriptor slots reserved in the header page
//! - `journal_switch_threshold`: active journal file size at which
//!   rotation is attempted
//! - `file_size_limit`: refuse page allocation beyond this many bytes
//! - flags: in-memory, enable-recovery, enable-transactions, read-only,
//!   auto-cleanup-on-close, cache-unlimited, disable-mmap
//!
//! Database level:
//! - `key_type`: u8/u16/u32/u64, f32/f64, or binary
//! - `key_size`: fixed size, or unlimited (binary keys only)
//! - `record_size`: fixed size, or unlimited
//! - flags: enable-duplicates, record-number-32, record-number-64,
//!   force-records-inline

pub mod constants;

use std::path::PathBuf;

use eyre::Result;

use crate::error::{typed, StoreError};
use constants::{
    DEFAULT_CACHE_SIZE, DEFAULT_JOURNAL_SWITCH_THRESHOLD, DEFAULT_MAX_DATABASES,
    DEFAULT_PAGE_SIZE, MAX_DATABASE_NAME, MAX_PAGE_SIZE, MIN_PAGE_SIZE,
};

/// Sentinel for "no fixed size" in key/record size options.
pub const UNLIMITED: u32 = u32::MAX;

/// Key type of a database, selected at creation time. Determines the
/// comparator and, for the numeric types, the implied fixed key size.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyType {
    U8 = 1,
    U16 = 2,
    U32 = 3,
    U64 = 4,
    F32 = 5,
    F64 = 6,
    #[default]
    Binary = 7,
}

impl KeyType {
    pub fn from_raw(raw: u16) -> Result<Self> {
        Ok(match raw {
            1 => KeyType::U8,
            2 => KeyType::U16,
            3 => KeyType::U32,
            4 => KeyType::U64,
            5 => KeyType::F32,
            6 => KeyType::F64,
            7 => KeyType::Binary,
            _ => {
                return Err(typed(
                    StoreError::InvalidParameter,
                    format!("unknown key type tag {raw}"),
                ))
            }
        })
    }

    /// The implied fixed size of the type, or `None` for binary keys.
    pub fn implied_size(self) -> Option<u16> {
        match self {
            KeyType::U8 => Some(1),
            KeyType::U16 => Some(2),
            KeyType::U32 | KeyType::F32 => Some(4),
            KeyType::U64 | KeyType::F64 => Some(8),
            KeyType::Binary => None,
        }
    }
}

/// Environment flag set. Stored verbatim in the header page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EnvFlags {
    pub in_memory: bool,
    pub enable_recovery: bool,
    pub enable_transactions: bool,
    pub read_only: bool,
    pub auto_cleanup_on_close: bool,
    pub cache_unlimited: bool,
    pub disable_mmap: bool,
}

impl EnvFlags {
    const IN_MEMORY: u32 = 1 << 0;
    const ENABLE_RECOVERY: u32 = 1 << 1;
    const ENABLE_TRANSACTIONS: u32 = 1 << 2;
    const READ_ONLY: u32 = 1 << 3;
    const AUTO_CLEANUP: u32 = 1 << 4;
    const CACHE_UNLIMITED: u32 = 1 << 5;
    const DISABLE_MMAP: u32 = 1 << 6;

    pub fn to_bits(self) -> u32 {
        let mut bits = 0;
        if self.in_memory {
            bits |= Self::IN_MEMORY;
        }
        if self.enable_recovery {
            bits |= Self::ENABLE_RECOVERY;
        }
        if self.enable_transactions {
            bits |= Self::ENABLE_TRANSACTIONS;
        }
        if self.read_only {
            bits |= Self::READ_ONLY;
        }
        if self.auto_cleanup_on_close {
            bits |= Self::AUTO_CLEANUP;
        }
        if self.cache_unlimited {
            bits |= Self::CACHE_UNLIMITED;
        }
        if self.disable_mmap {
            bits |= Self::DISABLE_MMAP;
        }
        bits
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            in_memory: bits & Self::IN_MEMORY != 0,
            enable_recovery: bits & Self::ENABLE_RECOVERY != 0,
            enable_transactions: bits & Self::ENABLE_TRANSACTIONS != 0,
            read_only: bits & Self::READ_ONLY != 0,
            auto_cleanup_on_close: bits & Self::AUTO_CLEANUP != 0,
            cache_unlimited: bits & Self::CACHE_UNLIMITED != 0,
            disable_mmap: bits & Self::DISABLE_MMAP != 0,
        }
    }
}

/// Per-database flag set. Stored in the database descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DbFlags {
    pub enable_duplicates: bool,
    pub record_number_32: bool,
    pub record_number_64: bool,
    pub force_records_inline: bool,
}

impl DbFlags {
    const DUPLICATES: u32 = 1 << 0;
    const RECNO_32: u32 = 1 << 1;
    const RECNO_64: u32 = 1 << 2;
    const FORCE_INLINE: u32 = 1 << 3;

    pub fn to_bits(self) -> u32 {
        let mut bits = 0;
        if self.enable_duplicates {
            bits |= Self::DUPLICATES;
        }
        if self.record_number_32 {
            bits |= Self::RECNO_32;
        }
        if self.record_number_64 {
            bits |= Self::RECNO_64;
        }
        if self.force_records_inline {
            bits |= Self::FORCE_INLINE;
        }
        bits
    }

    pub fn from_bits(bits: u32) -> Self {
        Self {
            enable_duplicates: bits & Self::DUPLICATES != 0,
            record_number_32: bits & Self::RECNO_32 != 0,
            record_number_64: bits & Self::RECNO_64 != 0,
            force_records_inline: bits & Self::FORCE_INLINE != 0,
        }
    }
}

/// Options for creating or opening an environment.
#[derive(Debug, Clone)]
pub struct EnvOptions {
    pub path: PathBuf,
    pub page_size: u32,
    pub cache_size: usize,
    pub max_databases: u16,
    pub journal_switch_threshold: u64,
    pub file_size_limit: u64,
    pub flags: EnvFlags,
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            max_databases: DEFAULT_MAX_DATABASES,
            journal_switch_threshold: DEFAULT_JOURNAL_SWITCH_THRESHOLD,
            file_size_limit: u64::MAX,
            flags: EnvFlags::default(),
        }
    }
}

impl EnvOptions {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// An anonymous in-memory environment: no file, no journal.
    pub fn in_memory() -> Self {
        let mut opts = Self::default();
        opts.flags.in_memory = true;
        opts
    }

    pub fn page_size(mut self, size: u32) -> Self {
        self.page_size = size;
        self
    }

    pub fn cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = bytes;
        self
    }

    pub fn cache_unlimited(mut self) -> Self {
        self.flags.cache_unlimited = true;
        self
    }

    pub fn max_databases(mut self, count: u16) -> Self {
        self.max_databases = count;
        self
    }

    pub fn journal_switch_threshold(mut self, bytes: u64) -> Self {
        self.journal_switch_threshold = bytes;
        self
    }

    pub fn file_size_limit(mut self, bytes: u64) -> Self {
        self.file_size_limit = bytes;
        self
    }

    pub fn enable_recovery(mut self) -> Self {
        self.flags.enable_recovery = true;
        self
    }

    pub fn enable_transactions(mut self) -> Self {
        // durable commits additionally need enable_recovery; an in-memory
        // environment runs transactions without a journal
        self.flags.enable_transactions = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.flags.read_only = true;
        self
    }

    pub fn auto_cleanup_on_close(mut self) -> Self {
        self.flags.auto_cleanup_on_close = true;
        self
    }

    pub fn disable_mmap(mut self) -> Self {
        self.flags.disable_mmap = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(typed(
                StoreError::InvalidParameter,
                format!(
                    "page size {} is not a power of two in [{}, {}]",
                    self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
                ),
            ));
        }
        if self.max_databases == 0 {
            return Err(typed(
                StoreError::InvalidParameter,
                "max databases must be at least 1",
            ));
        }
        let descriptor_space = constants::ENV_HEADER_SIZE
            + self.max_databases as usize * constants::DESCRIPTOR_SIZE;
        let usable = self.page_size as usize - constants::PAGE_HEADER_SIZE;
        if descriptor_space > usable {
            return Err(typed(
                StoreError::InvalidParameter,
                format!(
                    "{} database descriptors do not fit a {}-byte header page",
                    self.max_databases, self.page_size
                ),
            ));
        }
        if self.flags.in_memory && self.flags.enable_recovery {
            return Err(typed(
                StoreError::InvalidParameter,
                "recovery has no meaning for an in-memory environment",
            ));
        }
        if self.flags.in_memory && self.flags.read_only {
            return Err(typed(
                StoreError::InvalidParameter,
                "a read-only in-memory environment would be empty forever",
            ));
        }
        Ok(())
    }

    /// Effective cache budget; 0 means unlimited.
    pub fn effective_cache_size(&self) -> usize {
        if self.flags.cache_unlimited {
            0
        } else {
            self.cache_size
        }
    }
}

/// Options for creating a database inside an environment.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub key_type: KeyType,
    pub key_size: u32,
    pub record_size: u32,
    pub flags: DbFlags,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            key_type: KeyType::Binary,
            key_size: UNLIMITED,
            record_size: UNLIMITED,
            flags: DbFlags::default(),
        }
    }
}

impl DatabaseOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = key_type;
        self
    }

    pub fn key_size(mut self, size: u32) -> Self {
        self.key_size = size;
        self
    }

    pub fn record_size(mut self, size: u32) -> Self {
        self.record_size = size;
        self
    }

    pub fn enable_duplicates(mut self) -> Self {
        self.flags.enable_duplicates = true;
        self
    }

    pub fn record_number_32(mut self) -> Self {
        self.flags.record_number_32 = true;
        self.key_type = KeyType::U32;
        self
    }

    pub fn record_number_64(mut self) -> Self {
        self.flags.record_number_64 = true;
        self.key_type = KeyType::U64;
        self
    }

    pub fn force_records_inline(mut self) -> Self {
        self.flags.force_records_inline = true;
        self
    }

    pub fn validate(&self, name: u16, page_size: u32) -> Result<()> {
        if name == 0 || name > MAX_DATABASE_NAME {
            return Err(typed(
                StoreError::InvalidParameter,
                format!("database name {name} outside the valid range 1..={MAX_DATABASE_NAME}"),
            ));
        }
        if self.flags.record_number_32 && self.flags.record_number_64 {
            return Err(typed(
                StoreError::InvalidParameter,
                "record-number-32 and record-number-64 are mutually exclusive",
            ));
        }
        if let Some(implied) = self.key_type.implied_size() {
            if self.key_size != UNLIMITED && self.key_size != implied as u32 {
                return Err(typed(
                    StoreError::InvalidParameter,
                    format!(
                        "key size {} contradicts the {}-byte key type",
                        self.key_size, implied
                    ),
                ));
            }
        } else if self.key_size != UNLIMITED {
            // fixed binary keys must stay inline; extended keys only exist
            // for the unlimited layout
            let threshold = constants::extended_key_threshold(page_size);
            if self.key_size as usize > threshold {
                return Err(typed(
                    StoreError::InvalidParameter,
                    format!(
                        "fixed key size {} exceeds the extended-key threshold {} \
                         for {}-byte pages",
                        self.key_size, threshold, page_size
                    ),
                ));
            }
            if self.key_size == 0 {
                return Err(typed(
                    StoreError::InvalidParameter,
                    "fixed key size must be nonzero",
                ));
            }
        }
        if self.flags.force_records_inline {
            if self.record_size == UNLIMITED {
                return Err(typed(
                    StoreError::InvalidParameter,
                    "force-records-inline requires a fixed record size",
                ));
            }
            let usable = page_size as usize / 4;
            if self.record_size as usize > usable {
                return Err(typed(
                    StoreError::InvalidParameter,
                    format!(
                        "inline record size {} too large for {}-byte pages",
                        self.record_size, page_size
                    ),
                ));
            }
        }
        Ok(())
    }

    /// The fixed key size in effect, or `None` for variable-length keys.
    pub fn fixed_key_size(&self) -> Option<u16> {
        self.key_type
            .implied_size()
            .or(if self.key_size != UNLIMITED {
                Some(self.key_size as u16)
            } else {
                None
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::store_error;

    #[test]
    fn env_options_default_page_size() {
        let opts = EnvOptions::new("/tmp/x.db");
        assert_eq!(opts.page_size, DEFAULT_PAGE_SIZE);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn env_options_rejects_odd_page_size() {
        let opts = EnvOptions::new("/tmp/x.db").page_size(3000);
        let err = opts.validate().unwrap_err();
        assert_eq!(store_error(&err), Some(StoreError::InvalidParameter));
    }

    #[test]
    fn env_options_rejects_too_small_page_size() {
        let opts = EnvOptions::new("/tmp/x.db").page_size(512);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn env_options_rejects_in_memory_recovery() {
        let mut opts = EnvOptions::in_memory();
        opts.flags.enable_recovery = true;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn env_options_descriptor_overflow() {
        let opts = EnvOptions::new("/tmp/x.db")
            .page_size(1024)
            .max_databases(200);
        let err = opts.validate().unwrap_err();
        assert_eq!(store_error(&err), Some(StoreError::InvalidParameter));
    }

    #[test]
    fn transactions_do_not_force_a_journal() {
        let opts = EnvOptions::in_memory().enable_transactions();
        assert!(!opts.flags.enable_recovery);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn env_flags_round_trip_bits() {
        let flags = EnvFlags {
            in_memory: true,
            enable_recovery: false,
            enable_transactions: true,
            read_only: false,
            auto_cleanup_on_close: true,
            cache_unlimited: false,
            disable_mmap: true,
        };
        assert_eq!(EnvFlags::from_bits(flags.to_bits()), flags);
    }

    #[test]
    fn db_flags_round_trip_bits() {
        let flags = DbFlags {
            enable_duplicates: true,
            record_number_32: false,
            record_number_64: true,
            force_records_inline: false,
        };
        assert_eq!(DbFlags::from_bits(flags.to_bits()), flags);
    }

    #[test]
    fn key_type_implied_sizes() {
        assert_eq!(KeyType::U8.implied_size(), Some(1));
        assert_eq!(KeyType::U64.implied_size(), Some(8));
        assert_eq!(KeyType::F32.implied_size(), Some(4));
        assert_eq!(KeyType::Binary.implied_size(), None);
    }

    #[test]
    fn key_type_raw_round_trip() {
        for raw in 1..=7u16 {
            let kt = KeyType::from_raw(raw).unwrap();
            assert_eq!(kt as u16, raw);
        }
        assert!(KeyType::from_raw(99).is_err());
    }

    #[test]
    fn database_options_rejects_zero_name() {
        let opts = DatabaseOptions::new();
        let err = opts.validate(0, 16384).unwrap_err();
        assert_eq!(store_error(&err), Some(StoreError::InvalidParameter));
    }

    #[test]
    fn database_options_rejects_conflicting_recno() {
        let mut opts = DatabaseOptions::new();
        opts.flags.record_number_32 = true;
        opts.flags.record_number_64 = true;
        assert!(opts.validate(1, 16384).is_err());
    }

    #[test]
    fn database_options_rejects_oversized_fixed_key() {
        let opts = DatabaseOptions::new().key_size(2048);
        assert!(opts.validate(1, 1024).is_err());
    }

    #[test]
    fn database_options_numeric_key_size_must_match() {
        let opts = DatabaseOptions::new().key_type(KeyType::U32).key_size(8);
        assert!(opts.validate(1, 16384).is_err());

        let opts = DatabaseOptions::new().key_type(KeyType::U32).key_size(4);
        assert!(opts.validate(1, 16384).is_ok());
    }

    #[test]
    fn fixed_key_size_resolution() {
        assert_eq!(
            DatabaseOptions::new()
                .key_type(KeyType::U64)
                .fixed_key_size(),
            Some(8)
        );
        assert_eq!(DatabaseOptions::new().fixed_key_size(), None);
        assert_eq!(
            DatabaseOptions::new().key_size(20).fixed_key_size(),
            Some(20)
        );
    }
}
