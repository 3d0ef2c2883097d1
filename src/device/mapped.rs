//! # Memory-Mapped Device
//!
//! Maps the environment file into the process address space and serves page
//! reads by copying out of the mapping, so the hot read path never enters
//! the kernel. Writes land in the mapping as well; `flush` is an `msync`.
//!
//! ## Remapping on Growth
//!
//! A mapping becomes invalid when the file grows beyond it. The mapping
//! lives behind an `RwLock`: readers copy under the shared lock, `grow`
//! takes the exclusive lock, extends the file, and remaps. Because pages are
//! copied out rather than borrowed, no caller ever holds a pointer into a
//! stale mapping.
//!
//! Growth extends the file in chunks (at least 64 pages) so a bulk load does
//! not remap once per page.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::Result;
use memmap2::MmapMut;
use parking_lot::RwLock;

use crate::error::{io, typed, StoreError};

use super::Device;

/// Minimum number of pages added per remap.
const GROW_CHUNK_PAGES: u64 = 64;

struct Mapping {
    mmap: Option<MmapMut>,
    /// Bytes the caller has actually allocated; the file may be longer.
    logical_len: u64,
    /// Length of the current mapping (and the file).
    mapped_len: u64,
}

pub struct MappedDevice {
    file: File,
    mapping: RwLock<Mapping>,
}

impl MappedDevice {
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
            mapping: RwLock::new(Mapping {
                mmap: None,
                logical_len: 0,
                mapped_len: 0,
            }),
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

        let mmap = if len > 0 {
            // SAFETY: the environment holds this file exclusively for the
            // process lifetime; nothing external rewrites it while mapped.
            // All access is bounds-checked against mapped_len below.
            Some(unsafe {
                MmapMut::map_mut(&file)
                    .map_err(|e| io(e, format!("failed to memory-map '{}'", path.display())))?
            })
        } else {
            None
        };

        Ok(Self {
            file,
            mapping: RwLock::new(Mapping {
                mmap,
                logical_len: len,
                mapped_len: len,
            }),
        })
    }

    fn remap(&self, mapping: &mut Mapping, required_len: u64, page_size: u64) -> Result<()> {
        if let Some(old) = mapping.mmap.take() {
            old.flush_async()
                .map_err(|e| io(e, "failed to flush mapping before remap"))?;
            drop(old);
        }

        let chunk = GROW_CHUNK_PAGES * page_size.max(1);
        let new_len = required_len.max(mapping.mapped_len + chunk);

        self.file
            .set_len(new_len)
            .map_err(|e| io(e, format!("failed to extend file to {new_len} bytes")))?;

        // SAFETY: the old mapping was dropped above; the file was extended
        // before remapping, so the new mapping covers every address handed
        // out so far.
        mapping.mmap = Some(unsafe {
            MmapMut::map_mut(&self.file).map_err(|e| io(e, "failed to remap file after grow"))?
        });
        mapping.mapped_len = new_len;
        Ok(())
    }
}

impl Device for MappedDevice {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mapping = self.mapping.read();
        let end = offset + buf.len() as u64;
        if end > mapping.logical_len {
            return Err(typed(
                StoreError::Io,
                format!(
                    "read of {} bytes at offset {offset} beyond device end {}",
                    buf.len(),
                    mapping.logical_len
                ),
            ));
        }
        let mmap = mapping
            .mmap
            .as_ref()
            .ok_or_else(|| typed(StoreError::Io, "read from an empty mapping"))?;
        buf.copy_from_slice(&mmap[offset as usize..end as usize]);
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset + buf.len() as u64;
        {
            let mapping = self.mapping.read();
            if end <= mapping.mapped_len {
                let mmap = mapping
                    .mmap
                    .as_ref()
                    .ok_or_else(|| typed(StoreError::Io, "write into an empty mapping"))?;
                // SAFETY: distinct writers never touch overlapping ranges
                // (the page manager hands out unique page addresses and the
                // per-page lock serializes flushes of one page); the range
                // was bounds-checked against mapped_len above.
                unsafe {
                    let dst = mmap.as_ptr().add(offset as usize) as *mut u8;
                    std::ptr::copy_nonoverlapping(buf.as_ptr(), dst, buf.len());
                }
                return Ok(());
            }
        }

        let mut mapping = self.mapping.write();
        if end > mapping.mapped_len {
            self.remap(&mut mapping, end, 4096)?;
        }
        let mmap = mapping
            .mmap
            .as_mut()
            .ok_or_else(|| typed(StoreError::Io, "write into an empty mapping"))?;
        mmap[offset as usize..end as usize].copy_from_slice(buf);
        mapping.logical_len = mapping.logical_len.max(end);
        Ok(())
    }

    fn alloc_page(&self, page_size: u32) -> Result<u64> {
        let mut mapping = self.mapping.write();
        let address = mapping.logical_len;
        let required = address + page_size as u64;
        if required > mapping.mapped_len {
            self.remap(&mut mapping, required, page_size as u64)?;
        }
        mapping.logical_len = required;
        Ok(address)
    }

    fn flush(&self) -> Result<()> {
        let mapping = self.mapping.read();
        if let Some(mmap) = mapping.mmap.as_ref() {
            mmap.flush().map_err(|e| io(e, "failed to msync mapping"))?;
        }
        Ok(())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let mut mapping = self.mapping.write();
        if let Some(old) = mapping.mmap.take() {
            old.flush()
                .map_err(|e| io(e, "failed to flush mapping before truncate"))?;
            drop(old);
        }
        self.file
            .set_len(len)
            .map_err(|e| io(e, format!("failed to truncate file to {len} bytes")))?;
        mapping.logical_len = len;
        mapping.mapped_len = len;
        if len > 0 {
            // SAFETY: same exclusivity argument as in open(); the file now
            // has exactly `len` bytes.
            mapping.mmap = Some(unsafe {
                MmapMut::map_mut(&self.file)
                    .map_err(|e| io(e, "failed to remap file after truncate"))?
            });
        }
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.mapping.read().logical_len)
    }

    fn prefetch(&self, address: u64, count: u32) {
        #[cfg(unix)]
        {
            let mapping = self.mapping.read();
            let Some(mmap) = mapping.mmap.as_ref() else {
                return;
            };
            let len = ((count as u64) * 4096).min(mapping.logical_len.saturating_sub(address));
            if len == 0 || address >= mapping.logical_len {
                return;
            }
            // SAFETY: madvise is advisory; the range was clamped to the
            // mapping above.
            unsafe {
                libc::madvise(
                    mmap.as_ptr().add(address as usize) as *mut libc::c_void,
                    len as usize,
                    libc::MADV_WILLNEED,
                );
            }
        }
        #[cfg(not(unix))]
        {
            let _ = (address, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_keeps_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let device = MappedDevice::create(&dir.path().join("dev.db")).unwrap();

        let a = device.alloc_page(1024).unwrap();
        device.write_page(a, &vec![7u8; 1024]).unwrap();

        // force several remaps
        for _ in 0..200 {
            device.alloc_page(1024).unwrap();
        }

        let mut buf = vec![0u8; 1024];
        device.read_page(a, &mut buf).unwrap();
        assert_eq!(buf, vec![7u8; 1024]);
    }

    #[test]
    fn logical_len_ignores_mapping_slack() {
        let dir = tempfile::tempdir().unwrap();
        let device = MappedDevice::create(&dir.path().join("dev.db")).unwrap();

        device.alloc_page(4096).unwrap();
        assert_eq!(device.len().unwrap(), 4096);

        device.alloc_page(4096).unwrap();
        assert_eq!(device.len().unwrap(), 8192);
    }

    #[test]
    fn read_beyond_logical_end_fails() {
        let dir = tempfile::tempdir().unwrap();
        let device = MappedDevice::create(&dir.path().join("dev.db")).unwrap();
        device.alloc_page(1024).unwrap();

        let mut buf = [0u8; 16];
        assert!(device.read(1024, &mut buf).is_err());
    }

    #[test]
    fn reopen_sees_flushed_pages() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.db");

        {
            let device = MappedDevice::create(&path).unwrap();
            let a = device.alloc_page(1024).unwrap();
            device.write_page(a, &vec![3u8; 1024]).unwrap();
            device.truncate(1024).unwrap();
            device.flush().unwrap();
        }

        let device = MappedDevice::open(&path, false).unwrap();
        let mut buf = vec![0u8; 1024];
        device.read_page(0, &mut buf).unwrap();
        assert_eq!(buf, vec![3u8; 1024]);
    }
}
