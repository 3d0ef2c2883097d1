//! # Write-Ahead Journal
//!
//! Two rotating append-only files (`<db>.jrn0`, `<db>.jrn1`) holding the
//! logical transaction records and the physical changeset images that make
//! crash recovery possible.
//!
//! ## Record Format
//!
//! Every record is length-prefixed and checksummed:
//!
//! ```text
//! +----------+----------+--------+------------------+-----------+
//! | size u32 | lsn u64  | kind u8| payload (size B) | crc32 u32 |
//! +----------+----------+--------+------------------+-----------+
//! ```
//!
//! The CRC covers the header and payload; a mismatch (or a short read)
//! marks the end of the valid log, the normal torn-tail signature after a
//! crash mid-write.
//!
//! ## Record Kinds
//!
//! | kind | name            | payload                                       |
//! |------|-----------------|-----------------------------------------------|
//! | 1    | begin-txn       | txn id                                        |
//! | 2    | commit-txn      | txn id                                        |
//! | 3    | abort-txn       | txn id                                        |
//! | 4    | insert          | txn id, db, flags, dup pos, key, record       |
//! | 5    | erase           | txn id, db, flags, dup pos, key               |
//! | 6    | changeset-start | covered-op lsn, page count, page size         |
//! | 7    | changeset-page  | page address, full page image                 |
//! | 8    | changeset-end   | highest lsn, crc32 over the page images       |
//!
//! ## Write Ordering
//!
//! A changeset is fully persisted (end record written, file fsynced)
//! before any of its member pages may reach the database file. The fsync
//! advances the shared durable-LSN watermark; the cache and the background
//! worker refuse to write any page whose LSN lies above it. Commit records
//! are fsynced at commit time, which is what makes scenario "crash after
//! commit, before page flush" recoverable.
//!
//! ## Rotation
//!
//! When the active file exceeds the switch threshold and the *other* file
//! has no live transactions, the environment checkpoints (flushes all dirty
//! pages) and the other file is truncated and becomes active. The
//! checkpoint is what licenses dropping the old records: every page they
//! covered is durable in the database file by then.
//!
//! ## Recovery Inputs
//!
//! [`Journal::scan`] parses both files and returns the records sorted by
//! LSN; the environment drives redo (changesets) and replay (committed
//! logical operations whose covering changeset never made it) from that.

pub mod changeset;

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use parking_lot::Mutex;

use crate::config::constants::{
    JOURNAL_FILE_HEADER_SIZE, JOURNAL_MAGIC, JOURNAL_RECORD_HEADER_SIZE,
    JOURNAL_RECORD_TRAILER_SIZE,
};
use crate::error::io;

use changeset::Changeset;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

const CRC32: crc::Crc<u32> = crc::Crc::<u32>::new(&crc::CRC_32_ISCSI);

/// Sentinel duplicate position meaning "the whole key" / "no position".
pub const DUP_POSITION_NONE: u32 = u32::MAX;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    BeginTxn = 1,
    CommitTxn = 2,
    AbortTxn = 3,
    Insert = 4,
    Erase = 5,
    ChangesetStart = 6,
    ChangesetPage = 7,
    ChangesetEnd = 8,
}

impl RecordKind {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            1 => RecordKind::BeginTxn,
            2 => RecordKind::CommitTxn,
            3 => RecordKind::AbortTxn,
            4 => RecordKind::Insert,
            5 => RecordKind::Erase,
            6 => RecordKind::ChangesetStart,
            7 => RecordKind::ChangesetPage,
            8 => RecordKind::ChangesetEnd,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordPayload {
    Begin {
        txn_id: u64,
    },
    Commit {
        txn_id: u64,
    },
    Abort {
        txn_id: u64,
    },
    Insert {
        txn_id: u64,
        db: u16,
        flags: u32,
        dup_position: u32,
        key: Vec<u8>,
        record: Vec<u8>,
    },
    Erase {
        txn_id: u64,
        db: u16,
        flags: u32,
        dup_position: u32,
        key: Vec<u8>,
    },
    ChangesetStart {
        covered_op_lsn: u64,
        page_count: u32,
        page_size: u32,
    },
    ChangesetPage {
        address: u64,
        image: Vec<u8>,
    },
    ChangesetEnd {
        highest_lsn: u64,
        checksum: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub lsn: u64,
    pub payload: RecordPayload,
}

// ---------------------------------------------------------------------
// encoding helpers
// ---------------------------------------------------------------------

fn put_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, v: &[u8]) {
    put_u32(out, v.len() as u32);
    out.extend_from_slice(v);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        ensure!(
            self.pos + n <= self.data.len(),
            "journal payload truncated: wanted {n} bytes at {}",
            self.pos
        );
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

fn encode_payload(payload: &RecordPayload) -> (RecordKind, Vec<u8>) {
    let mut out = Vec::new();
    let kind = match payload {
        RecordPayload::Begin { txn_id } => {
            put_u64(&mut out, *txn_id);
            RecordKind::BeginTxn
        }
        RecordPayload::Commit { txn_id } => {
            put_u64(&mut out, *txn_id);
            RecordKind::CommitTxn
        }
        RecordPayload::Abort { txn_id } => {
            put_u64(&mut out, *txn_id);
            RecordKind::AbortTxn
        }
        RecordPayload::Insert {
            txn_id,
            db,
            flags,
            dup_position,
            key,
            record,
        } => {
            put_u64(&mut out, *txn_id);
            put_u16(&mut out, *db);
            put_u32(&mut out, *flags);
            put_u32(&mut out, *dup_position);
            put_bytes(&mut out, key);
            put_bytes(&mut out, record);
            RecordKind::Insert
        }
        RecordPayload::Erase {
            txn_id,
            db,
            flags,
            dup_position,
            key,
        } => {
            put_u64(&mut out, *txn_id);
            put_u16(&mut out, *db);
            put_u32(&mut out, *flags);
            put_u32(&mut out, *dup_position);
            put_bytes(&mut out, key);
            RecordKind::Erase
        }
        RecordPayload::ChangesetStart {
            covered_op_lsn,
            page_count,
            page_size,
        } => {
            put_u64(&mut out, *covered_op_lsn);
            put_u32(&mut out, *page_count);
            put_u32(&mut out, *page_size);
            RecordKind::ChangesetStart
        }
        RecordPayload::ChangesetPage { address, image } => {
            put_u64(&mut out, *address);
            put_bytes(&mut out, image);
            RecordKind::ChangesetPage
        }
        RecordPayload::ChangesetEnd {
            highest_lsn,
            checksum,
        } => {
            put_u64(&mut out, *highest_lsn);
            put_u32(&mut out, *checksum);
            RecordKind::ChangesetEnd
        }
    };
    (kind, out)
}

fn decode_payload(kind: RecordKind, data: &[u8]) -> Result<RecordPayload> {
    let mut r = Reader::new(data);
    let payload = match kind {
        RecordKind::BeginTxn => RecordPayload::Begin { txn_id: r.u64()? },
        RecordKind::CommitTxn => RecordPayload::Commit { txn_id: r.u64()? },
        RecordKind::AbortTxn => RecordPayload::Abort { txn_id: r.u64()? },
        RecordKind::Insert => RecordPayload::Insert {
            txn_id: r.u64()?,
            db: r.u16()?,
            flags: r.u32()?,
            dup_position: r.u32()?,
            key: r.bytes()?,
            record: r.bytes()?,
        },
        RecordKind::Erase => RecordPayload::Erase {
            txn_id: r.u64()?,
            db: r.u16()?,
            flags: r.u32()?,
            dup_position: r.u32()?,
            key: r.bytes()?,
        },
        RecordKind::ChangesetStart => RecordPayload::ChangesetStart {
            covered_op_lsn: r.u64()?,
            page_count: r.u32()?,
            page_size: r.u32()?,
        },
        RecordKind::ChangesetPage => RecordPayload::ChangesetPage {
            address: r.u64()?,
            image: r.bytes()?,
        },
        RecordKind::ChangesetEnd => RecordPayload::ChangesetEnd {
            highest_lsn: r.u64()?,
            checksum: r.u32()?,
        },
    };
    Ok(payload)
}

fn record_crc(lsn: u64, kind: RecordKind, payload: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(&(payload.len() as u32).to_le_bytes());
    digest.update(&lsn.to_le_bytes());
    digest.update(&[kind as u8]);
    digest.update(payload);
    digest.finalize()
}

// ---------------------------------------------------------------------
// files
// ---------------------------------------------------------------------

struct JournalFile {
    file: File,
    path: PathBuf,
    len: u64,
}

impl JournalFile {
    fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| io(e, format!("failed to create journal file '{}'", path.display())))?;

        let mut this = Self {
            file,
            path: path.to_path_buf(),
            len: 0,
        };
        this.write_file_header()?;
        Ok(this)
    }

    fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Self::create(path);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| io(e, format!("failed to open journal file '{}'", path.display())))?;
        let len = file
            .metadata()
            .map_err(|e| io(e, format!("failed to stat '{}'", path.display())))?
            .len();

        let mut this = Self {
            file,
            path: path.to_path_buf(),
            len,
        };
        if len < JOURNAL_FILE_HEADER_SIZE as u64 {
            this.truncate_to_header()?;
        }
        Ok(this)
    }

    fn write_file_header(&mut self) -> Result<()> {
        let mut header = [0u8; JOURNAL_FILE_HEADER_SIZE];
        header[0..4].copy_from_slice(&JOURNAL_MAGIC);
        header[4..8].copy_from_slice(&1u32.to_le_bytes());
        self.file
            .write_all_at(&header, 0)
            .map_err(|e| io(e, format!("failed to write journal header to '{}'", self.path.display())))?;
        self.len = JOURNAL_FILE_HEADER_SIZE as u64;
        Ok(())
    }

    fn truncate_to_header(&mut self) -> Result<()> {
        self.file
            .set_len(0)
            .map_err(|e| io(e, format!("failed to truncate journal '{}'", self.path.display())))?;
        self.write_file_header()?;
        self.sync()
    }

    fn append(&mut self, lsn: u64, kind: RecordKind, payload: &[u8]) -> Result<()> {
        let crc = record_crc(lsn, kind, payload);
        let total = JOURNAL_RECORD_HEADER_SIZE + payload.len() + JOURNAL_RECORD_TRAILER_SIZE;
        let mut buf = Vec::with_capacity(total);
        put_u32(&mut buf, payload.len() as u32);
        put_u64(&mut buf, lsn);
        buf.push(kind as u8);
        buf.extend_from_slice(payload);
        put_u32(&mut buf, crc);

        self.file
            .write_all_at(&buf, self.len)
            .map_err(|e| io(e, format!("failed to append journal record at {}", self.len)))?;
        self.len += total as u64;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| io(e, format!("failed to sync journal '{}'", self.path.display())))
    }

    fn is_empty(&self) -> bool {
        self.len <= JOURNAL_FILE_HEADER_SIZE as u64
    }

    /// Parses every valid record; stops silently at the torn tail.
    fn scan(&self) -> Result<Vec<JournalRecord>> {
        let mut data = vec![0u8; self.len as usize];
        self.file
            .read_exact_at(&mut data, 0)
            .map_err(|e| io(e, format!("failed to read journal '{}'", self.path.display())))?;

        if data.len() < JOURNAL_FILE_HEADER_SIZE || data[0..4] != JOURNAL_MAGIC {
            bail!(
                "journal file '{}' has a bad header",
                self.path.display()
            );
        }

        let mut records = Vec::new();
        let mut pos = JOURNAL_FILE_HEADER_SIZE;
        let mut last_lsn = 0u64;

        while pos + JOURNAL_RECORD_HEADER_SIZE + JOURNAL_RECORD_TRAILER_SIZE <= data.len() {
            let size = u32::from_le_bytes(data[pos..pos + 4].try_into().unwrap()) as usize;
            let lsn = u64::from_le_bytes(data[pos + 4..pos + 12].try_into().unwrap());
            let kind_byte = data[pos + 12];
            let end = pos + JOURNAL_RECORD_HEADER_SIZE + size + JOURNAL_RECORD_TRAILER_SIZE;
            if end > data.len() {
                break; // torn tail
            }
            let Some(kind) = RecordKind::from_byte(kind_byte) else {
                break;
            };
            let payload = &data[pos + JOURNAL_RECORD_HEADER_SIZE
                ..pos + JOURNAL_RECORD_HEADER_SIZE + size];
            let stored_crc = u32::from_le_bytes(data[end - 4..end].try_into().unwrap());
            if stored_crc != record_crc(lsn, kind, payload) {
                break; // torn tail
            }
            if lsn <= last_lsn {
                break; // stale bytes from a previous rotation epoch
            }
            last_lsn = lsn;
            records.push(JournalRecord {
                lsn,
                payload: decode_payload(kind, payload)?,
            });
            pos = end;
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------
// journal
// ---------------------------------------------------------------------

struct JournalInner {
    files: [JournalFile; 2],
    active: usize,
    next_lsn: u64,
    /// Transactions with a begin record in each file and no commit/abort yet.
    open_txns: [HashSet<u64>; 2],
}

pub struct Journal {
    inner: Mutex<JournalInner>,
    durable_lsn: Arc<AtomicU64>,
    switch_threshold: u64,
}

impl Journal {
    pub fn paths(db_path: &Path) -> (PathBuf, PathBuf) {
        let base = db_path.as_os_str().to_os_string();
        let mut p0 = base.clone();
        p0.push(".jrn0");
        let mut p1 = base;
        p1.push(".jrn1");
        (PathBuf::from(p0), PathBuf::from(p1))
    }

    /// Opens (creating if absent) the journal pair next to the database
    /// file. The file holding the highest LSN becomes active.
    pub fn open(
        db_path: &Path,
        switch_threshold: u64,
        durable_lsn: Arc<AtomicU64>,
    ) -> Result<Self> {
        let (p0, p1) = Self::paths(db_path);
        let f0 = JournalFile::open(&p0)?;
        let f1 = JournalFile::open(&p1)?;

        let last0 = f0.scan().map(|r| r.last().map_or(0, |r| r.lsn)).unwrap_or(0);
        let last1 = f1.scan().map(|r| r.last().map_or(0, |r| r.lsn)).unwrap_or(0);

        let active = if last1 > last0 { 1 } else { 0 };
        let next_lsn = last0.max(last1) + 1;
        durable_lsn.store(next_lsn - 1, Ordering::Release);

        Ok(Self {
            inner: Mutex::new(JournalInner {
                files: [f0, f1],
                active,
                next_lsn,
                open_txns: [HashSet::new(), HashSet::new()],
            }),
            durable_lsn,
            switch_threshold,
        })
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock();
        inner.files[0].is_empty() && inner.files[1].is_empty()
    }

    pub fn durable_lsn(&self) -> u64 {
        self.durable_lsn.load(Ordering::Acquire)
    }

    fn append(
        inner: &mut JournalInner,
        payload: &RecordPayload,
    ) -> Result<u64> {
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        let (kind, bytes) = encode_payload(payload);
        let active = inner.active;
        inner.files[active].append(lsn, kind, &bytes)?;
        Ok(lsn)
    }

    pub fn append_begin(&self, txn_id: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let lsn = Self::append(&mut inner, &RecordPayload::Begin { txn_id })?;
        let active = inner.active;
        inner.open_txns[active].insert(txn_id);
        Ok(lsn)
    }

    /// Appends and fsyncs the commit record: the transaction's durability
    /// point.
    pub fn append_commit(&self, txn_id: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let lsn = Self::append(&mut inner, &RecordPayload::Commit { txn_id })?;
        let active = inner.active;
        inner.files[active].sync()?;
        self.durable_lsn.store(lsn, Ordering::Release);
        inner.open_txns[0].remove(&txn_id);
        inner.open_txns[1].remove(&txn_id);
        Ok(lsn)
    }

    pub fn append_abort(&self, txn_id: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let lsn = Self::append(&mut inner, &RecordPayload::Abort { txn_id })?;
        inner.open_txns[0].remove(&txn_id);
        inner.open_txns[1].remove(&txn_id);
        Ok(lsn)
    }

    pub fn append_insert(
        &self,
        txn_id: u64,
        db: u16,
        flags: u32,
        dup_position: u32,
        key: &[u8],
        record: &[u8],
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        Self::append(
            &mut inner,
            &RecordPayload::Insert {
                txn_id,
                db,
                flags,
                dup_position,
                key: key.to_vec(),
                record: record.to_vec(),
            },
        )
    }

    pub fn append_erase(
        &self,
        txn_id: u64,
        db: u16,
        flags: u32,
        dup_position: u32,
        key: &[u8],
    ) -> Result<u64> {
        let mut inner = self.inner.lock();
        Self::append(
            &mut inner,
            &RecordPayload::Erase {
                txn_id,
                db,
                flags,
                dup_position,
                key: key.to_vec(),
            },
        )
    }

    /// Writes a complete changeset (start, one record per page, end with a
    /// checksum over the images), fsyncs, stamps every member page with the
    /// changeset LSN, and advances the durable watermark.
    ///
    /// `covered_op_lsn` names the logical operation this changeset realizes
    /// (0 for structural work such as descriptor updates); recovery uses it
    /// to avoid replaying an operation whose effects were already redone
    /// physically.
    pub fn append_changeset(&self, changeset: &Changeset, covered_op_lsn: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        inner.next_lsn += 1;
        let active = inner.active;

        let page_count = changeset.len() as u32;
        let mut page_size = 0u32;
        let mut images_crc = CRC32.digest();

        // stamp first so the images carry the changeset LSN
        for page in changeset.pages() {
            let mut guard = page.buffer();
            page.stamp_lsn(&mut guard, lsn)
                .wrap_err("failed to stamp changeset LSN")?;
            page_size = guard.len() as u32;
        }

        let (kind, bytes) = encode_payload(&RecordPayload::ChangesetStart {
            covered_op_lsn,
            page_count,
            page_size,
        });
        inner.files[active].append(lsn, kind, &bytes)?;

        for page in changeset.pages() {
            let guard = page.buffer();
            images_crc.update(&guard);
            let (kind, bytes) = encode_payload(&RecordPayload::ChangesetPage {
                address: page.address(),
                image: guard.to_vec(),
            });
            drop(guard);
            let page_lsn = inner.next_lsn;
            inner.next_lsn += 1;
            inner.files[active].append(page_lsn, kind, &bytes)?;
        }

        let end_lsn = inner.next_lsn;
        inner.next_lsn += 1;
        let (kind, bytes) = encode_payload(&RecordPayload::ChangesetEnd {
            highest_lsn: end_lsn,
            checksum: images_crc.finalize(),
        });
        inner.files[active].append(end_lsn, kind, &bytes)?;
        inner.files[active].sync()?;
        self.durable_lsn.store(end_lsn, Ordering::Release);

        Ok(lsn)
    }

    /// True when the active file crossed the switch threshold and the
    /// inactive file has no live transactions.
    pub fn should_rotate(&self) -> bool {
        let inner = self.inner.lock();
        inner.files[inner.active].len >= self.switch_threshold
            && inner.open_txns[1 - inner.active].is_empty()
    }

    /// Truncates the inactive file and makes it active. The caller must
    /// have checkpointed (flushed all dirty pages) first; the dropped
    /// records are unrecoverable afterwards.
    pub fn rotate(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let other = 1 - inner.active;
        ensure!(
            inner.open_txns[other].is_empty(),
            "rotation with live transactions in the inactive journal file"
        );
        inner.files[other].truncate_to_header()?;
        inner.active = other;
        tracing::info!(active = other, "journal rotated");
        Ok(())
    }

    /// Truncates both files, e.g. after recovery or a clean close.
    pub fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.files[0].truncate_to_header()?;
        inner.files[1].truncate_to_header()?;
        inner.open_txns[0].clear();
        inner.open_txns[1].clear();
        Ok(())
    }

    pub fn active_len(&self) -> u64 {
        let inner = self.inner.lock();
        inner.files[inner.active].len
    }

    /// All valid records from both files, sorted by LSN.
    pub fn scan(&self) -> Result<Vec<JournalRecord>> {
        let inner = self.inner.lock();
        let mut records = inner.files[0].scan()?;
        records.extend(inner.files[1].scan()?);
        records.sort_by_key(|r| r.lsn);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{Page, PageType};

    fn journal(dir: &Path) -> Journal {
        Journal::open(
            &dir.join("env.db"),
            1024 * 1024,
            Arc::new(AtomicU64::new(0)),
        )
        .unwrap()
    }

    #[test]
    fn fresh_journal_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());
        assert!(j.is_empty());
        assert!(j.scan().unwrap().is_empty());
    }

    #[test]
    fn logical_records_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());

        j.append_begin(7).unwrap();
        j.append_insert(7, 1, 0, DUP_POSITION_NONE, b"key", b"value")
            .unwrap();
        j.append_erase(7, 1, 0, DUP_POSITION_NONE, b"old").unwrap();
        j.append_commit(7).unwrap();

        let records = j.scan().unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].payload, RecordPayload::Begin { txn_id: 7 });
        assert!(matches!(
            &records[1].payload,
            RecordPayload::Insert { txn_id: 7, db: 1, key, record, .. }
                if key == b"key" && record == b"value"
        ));
        assert!(matches!(
            &records[2].payload,
            RecordPayload::Erase { txn_id: 7, key, .. } if key == b"old"
        ));
        assert_eq!(records[3].payload, RecordPayload::Commit { txn_id: 7 });

        // LSNs are strictly increasing
        for pair in records.windows(2) {
            assert!(pair[0].lsn < pair[1].lsn);
        }
    }

    #[test]
    fn commit_advances_durable_watermark() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());

        assert_eq!(j.durable_lsn(), 0);
        j.append_begin(1).unwrap();
        let commit_lsn = j.append_commit(1).unwrap();
        assert_eq!(j.durable_lsn(), commit_lsn);
    }

    #[test]
    fn changeset_round_trips_with_images() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());

        let page = std::sync::Arc::new(Page::new_zeroed(1024, 1024, PageType::BtreeLeaf));
        page.buffer()[100] = 0xAB;
        let mut cs = Changeset::new();
        cs.add(&page, false);

        let op_lsn = j.append_insert(1, 1, 0, DUP_POSITION_NONE, b"k", b"v").unwrap();
        let cs_lsn = j.append_changeset(&cs, op_lsn).unwrap();
        cs.release();

        // the member page now carries the changeset LSN
        assert_eq!(page.lsn(), cs_lsn);
        assert!(j.durable_lsn() >= cs_lsn);

        let records = j.scan().unwrap();
        let start = records
            .iter()
            .find(|r| matches!(r.payload, RecordPayload::ChangesetStart { .. }))
            .unwrap();
        assert!(matches!(
            start.payload,
            RecordPayload::ChangesetStart { covered_op_lsn, page_count: 1, page_size: 1024 }
                if covered_op_lsn == op_lsn
        ));

        let image = records
            .iter()
            .find_map(|r| match &r.payload {
                RecordPayload::ChangesetPage { address, image } => Some((*address, image)),
                _ => None,
            })
            .unwrap();
        assert_eq!(image.0, 1024);
        assert_eq!(image.1[100], 0xAB);

        assert!(records
            .iter()
            .any(|r| matches!(r.payload, RecordPayload::ChangesetEnd { .. })));
    }

    #[test]
    fn torn_tail_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("env.db");
        {
            let j = Journal::open(&db, 1024 * 1024, Arc::new(AtomicU64::new(0))).unwrap();
            j.append_begin(1).unwrap();
            j.append_commit(1).unwrap();
            j.append_begin(2).unwrap();
        }

        // chop bytes off the active file to simulate a crash mid-write
        let (p0, _) = Journal::paths(&db);
        let file = OpenOptions::new().write(true).open(&p0).unwrap();
        let len = file.metadata().unwrap().len();
        file.set_len(len - 3).unwrap();

        let j = Journal::open(&db, 1024 * 1024, Arc::new(AtomicU64::new(0))).unwrap();
        let records = j.scan().unwrap();
        assert_eq!(records.len(), 2); // begin(1), commit(1); begin(2) lost
    }

    #[test]
    fn corrupted_record_stops_scan() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("env.db");
        {
            let j = Journal::open(&db, 1024 * 1024, Arc::new(AtomicU64::new(0))).unwrap();
            j.append_begin(1).unwrap();
            j.append_commit(1).unwrap();
        }

        // flip a payload byte of the second record
        let (p0, _) = Journal::paths(&db);
        let data = std::fs::read(&p0).unwrap();
        let mut data = data;
        let last = data.len() - 6;
        data[last] ^= 0xFF;
        std::fs::write(&p0, &data).unwrap();

        let j = Journal::open(&db, 1024 * 1024, Arc::new(AtomicU64::new(0))).unwrap();
        assert_eq!(j.scan().unwrap().len(), 1);
    }

    #[test]
    fn rotation_switches_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("env.db");
        let j = Journal::open(&db, 64, Arc::new(AtomicU64::new(0))).unwrap();

        j.append_begin(1).unwrap();
        j.append_commit(1).unwrap();
        assert!(j.should_rotate());

        j.rotate().unwrap();
        assert!(j.active_len() <= JOURNAL_FILE_HEADER_SIZE as u64);

        // records written after rotation land in the new active file
        j.append_begin(2).unwrap();
        j.append_commit(2).unwrap();
        assert_eq!(j.scan().unwrap().len(), 4); // 2 old + 2 new
    }

    #[test]
    fn rotation_blocked_by_live_txn_in_inactive_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("env.db");
        let j = Journal::open(&db, 64, Arc::new(AtomicU64::new(0))).unwrap();

        j.append_begin(1).unwrap(); // stays open in file 0
        j.append_commit(99).unwrap(); // sync pushes len over threshold
        assert!(j.should_rotate());
        j.rotate().unwrap(); // file 1 is empty of txns, fine

        // txn 1 is still open in file 0 (now inactive): no second rotation
        for _ in 0..10 {
            j.append_begin(2).unwrap();
            j.append_abort(2).unwrap();
        }
        assert!(!j.should_rotate());
    }

    #[test]
    fn clear_empties_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());

        j.append_begin(1).unwrap();
        j.append_commit(1).unwrap();
        assert!(!j.is_empty());

        j.clear().unwrap();
        assert!(j.is_empty());
        assert!(j.scan().unwrap().is_empty());
    }

    #[test]
    fn reopen_resumes_lsn_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("env.db");

        let last = {
            let j = Journal::open(&db, 1024 * 1024, Arc::new(AtomicU64::new(0))).unwrap();
            j.append_begin(1).unwrap();
            j.append_commit(1).unwrap()
        };

        let durable = Arc::new(AtomicU64::new(0));
        let j = Journal::open(&db, 1024 * 1024, Arc::clone(&durable)).unwrap();
        assert_eq!(durable.load(Ordering::Acquire), last);

        let next = j.append_begin(2).unwrap();
        assert!(next > last);
    }
}
