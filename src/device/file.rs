//! # Positional-I/O File Device
//!
//! The plain file device: every read and write is a positional syscall
//! against one file descriptor. Used when the environment is opened with
//! `disable_mmap`, and by the journal for its log files.
//!
//! The device length is tracked in an atomic rather than re-queried from the
//! filesystem because `alloc_page` must hand out distinct addresses even
//! while the background worker is writing behind it.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use eyre::Result;

use crate::error::io;

use super::Device;

#[cfg(unix)]
use std::os::unix::fs::FileExt;

pub struct FileDevice {
    file: File,
    len: AtomicU64,
}

impl std::fmt::Debug for FileDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDevice").finish()
    }
}

impl FileDevice {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| io(e, format!("failed to create database file '{}'", path.display())))?;

        Ok(Self {
            file,
            len: AtomicU64::new(0),
        })
    }

    pub fn open(path: &Path, read_only: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .map_err(|e| io(e, format!("failed to open database file '{}'", path.display())))?;

        let len = file
            .metadata()
            .map_err(|e| io(e, format!("failed to stat '{}'", path.display())))?
            .len();

        Ok(Self {
            file,
            len: AtomicU64::new(len),
        })
    }

    fn grow_to(&self, new_len: u64) -> Result<()> {
        self.file
            .set_len(new_len)
            .map_err(|e| io(e, format!("failed to extend file to {new_len} bytes")))?;
        self.len.fetch_max(new_len, Ordering::AcqRel);
        Ok(())
    }
}

impl Device for FileDevice {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| io(e, format!("failed to read {} bytes at offset {offset}", buf.len())))
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| io(e, format!("failed to write {} bytes at offset {offset}", buf.len())))?;

        let end = offset + buf.len() as u64;
        self.len.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    fn alloc_page(&self, page_size: u32) -> Result<u64> {
        let address = self.len.fetch_add(page_size as u64, Ordering::AcqRel);
        self.grow_to(address + page_size as u64)?;
        Ok(address)
    }

    fn flush(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| io(e, "failed to sync database file"))
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file
            .set_len(len)
            .map_err(|e| io(e, format!("failed to truncate file to {len} bytes")))?;
        self.len.store(len, Ordering::Release);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.len.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{store_error, StoreError};

    #[test]
    fn create_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.db");

        std::fs::write(&path, b"leftover bytes").unwrap();
        let device = FileDevice::create(&path).unwrap();

        assert_eq!(device.len().unwrap(), 0);
    }

    #[test]
    fn open_reads_existing_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.db");

        let device = FileDevice::create(&path).unwrap();
        device.alloc_page(1024).unwrap();
        device.alloc_page(1024).unwrap();
        drop(device);

        let reopened = FileDevice::open(&path, false).unwrap();
        assert_eq!(reopened.len().unwrap(), 2048);
    }

    #[test]
    fn alloc_page_returns_sequential_addresses() {
        let dir = tempfile::tempdir().unwrap();
        let device = FileDevice::create(&dir.path().join("dev.db")).unwrap();

        assert_eq!(device.alloc_page(4096).unwrap(), 0);
        assert_eq!(device.alloc_page(4096).unwrap(), 4096);
        assert_eq!(device.alloc_page(4096).unwrap(), 8192);
    }

    #[test]
    fn read_past_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let device = FileDevice::create(&dir.path().join("dev.db")).unwrap();
        device.alloc_page(1024).unwrap();

        let mut buf = [0u8; 64];
        assert!(device.read(2048, &mut buf).is_err());
    }

    #[test]
    fn open_missing_file_reports_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileDevice::open(&dir.path().join("absent.db"), false).unwrap_err();
        assert_eq!(store_error(&err), Some(StoreError::Io));
    }
}
