//! # Device Layer
//!
//! Block I/O abstraction underneath the page manager. A device addresses the
//! environment file (or its in-memory stand-in) by byte offset; the page
//! manager only ever asks for whole pages plus the occasional raw range
//! during recovery.
//!
//! ## Implementations
//!
//! - [`FileDevice`]: positional reads and writes against an open file
//!   descriptor. Positional I/O (`read_exact_at` / `write_all_at`) keeps the
//!   whole trait `&self`, which is what lets the background worker flush
//!   pages while the caller thread keeps allocating.
//! - [`MappedDevice`]: a `memmap2` mapping remapped on growth. Page reads
//!   copy out of the mapping (no syscall on the hot path); `flush` is an
//!   `msync`. Selected by default for file-backed environments unless
//!   `disable_mmap` is set.
//! - [`MemoryDevice`]: a growable RAM buffer for the in-memory mode; flush
//!   and truncate are bookkeeping only.
//!
//! ## Growth and Truncation
//!
//! `alloc_page` extends the device by exactly one page and returns the new
//! page's byte address. `truncate` is used on close to give tail pages freed
//! into the file-wide freelist back to the filesystem.
//!
//! ## Error Surface
//!
//! Every I/O failure is wrapped with `StoreError::Io` plus the OS-level
//! cause; a partial page write interrupted by a crash is tolerated because
//! recovery replays the covering journal record.

mod file;
mod mapped;
mod memory;

pub use file::FileDevice;
pub use mapped::MappedDevice;
pub use memory::MemoryDevice;

use eyre::Result;

/// Block I/O over the environment's backing storage.
///
/// All methods take `&self`; implementations synchronize internally so the
/// background worker and the caller thread can share one device handle.
pub trait Device: Send + Sync {
    /// Reads `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` at `offset`, extending the device if needed.
    fn write(&self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Reads one full page at `address` into `buf` (`buf.len()` is the page
    /// size).
    fn read_page(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        self.read(address, buf)
    }

    /// Writes one full page at `address`.
    fn write_page(&self, address: u64, buf: &[u8]) -> Result<()> {
        self.write(address, buf)
    }

    /// Extends the device by one page and returns the new page's address.
    fn alloc_page(&self, page_size: u32) -> Result<u64>;

    /// Durably flushes everything written so far.
    fn flush(&self) -> Result<()>;

    /// Shrinks the device to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;

    /// Current device length in bytes.
    fn len(&self) -> Result<u64>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Hints that `count` pages starting at `address` will be read soon.
    fn prefetch(&self, _address: u64, _count: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    // Shared contract checks run against every implementation.
    fn exercise_device(device: &dyn Device, page_size: u32) {
        let first = device.alloc_page(page_size).unwrap();
        let second = device.alloc_page(page_size).unwrap();
        assert_eq!(second - first, page_size as u64);

        let payload = vec![0xA5u8; page_size as usize];
        device.write_page(first, &payload).unwrap();

        let mut read_back = vec![0u8; page_size as usize];
        device.read_page(first, &mut read_back).unwrap();
        assert_eq!(read_back, payload);

        // raw range access inside a page
        let mut middle = [0u8; 16];
        device.read(first + 100, &mut middle).unwrap();
        assert_eq!(middle, [0xA5u8; 16]);

        device.flush().unwrap();

        device.truncate(first + page_size as u64).unwrap();
        assert_eq!(device.len().unwrap(), first + page_size as u64);
    }

    #[test]
    fn file_device_contract() {
        let dir = tempfile::tempdir().unwrap();
        let device = FileDevice::create(&dir.path().join("dev.db")).unwrap();
        exercise_device(&device, 4096);
    }

    #[test]
    fn mapped_device_contract() {
        let dir = tempfile::tempdir().unwrap();
        let device = MappedDevice::create(&dir.path().join("dev.db")).unwrap();
        exercise_device(&device, 4096);
    }

    #[test]
    fn memory_device_contract() {
        let device = MemoryDevice::new();
        exercise_device(&device, 4096);
    }
}
