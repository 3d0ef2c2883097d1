//! # Blob Manager
//!
//! Variable-length payload storage on pages of type `Blob`. Oversized keys,
//! oversized records, and extended duplicate tables all live here; the
//! btree layer only ever stores the 8-byte blob id (a byte offset into the
//! file).
//!
//! ## Layout
//!
//! Every blob is prefixed by a 28-byte header:
//!
//! ```text
//! Offset  Size  Field           Description
//! ------  ----  --------------  ---------------------------------
//! 0       8     id              Byte offset of this header
//! 8       8     allocated_size  Capacity reserved for the payload
//! 16      8     size            Live payload length
//! 24      4     flags           bit 0: freed, bit 1: spans pages
//! ```
//!
//! Small blobs are packed into shared blob pages. Each blob page carries a
//! 4-byte occupancy header after the page header (`used u16`,
//! `next_free u16`); the manager keeps a cursor to the page it is currently
//! filling. A blob page whose occupancy drops to zero returns to the
//! file-wide freelist whole.
//!
//! ```text
//! | page hdr (17) | used, next_free (4) | hdr+blob | hdr+blob | free... |
//! ```
//!
//! Large blobs get a dedicated run of physically contiguous pages. The blob
//! header sits at the start of the first page's payload; continuation pages
//! carry nothing but the page header and raw payload bytes, so every page
//! still checksums independently:
//!
//! ```text
//! page 0: | page hdr | occupancy | blob hdr | payload...............|
//! page 1: | page hdr | payload......................................|
//! page n: | page hdr | payload tail, zero padding....................|
//! ```
//!
//! ## Lifecycle
//!
//! `allocate` returns a fresh id; `overwrite` reuses the region when the
//! new payload fits `allocated_size` and relocates (new id) otherwise;
//! `erase` frees the region. Ids never alias live blobs: the header's `id`
//! field is verified on every access and a mismatch raises
//! `integrity-violated`.

use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::constants::{BLOB_HEADER_SIZE, PAGE_HEADER_SIZE};
use crate::error::{typed, StoreError};
use crate::storage::{parse_zerocopy, parse_zerocopy_mut, FetchMode, PageManager, PageType};

/// The blob was erased; its space awaits page-level reclamation.
pub const BLOB_FLAG_FREED: u32 = 1 << 0;
/// The blob owns a dedicated multi-page run.
pub const BLOB_FLAG_SPANNING: u32 = 1 << 1;

/// Occupancy header at the start of every blob page payload.
const BLOB_PAGE_HEADER_SIZE: usize = 4;

/// Payload capacities derived from the page size.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    page_size: usize,
    /// usable bytes in a blob page after page + occupancy headers
    page_capacity: usize,
    /// payload bytes in the first page of a spanning run
    first_capacity: usize,
    /// payload bytes per continuation page
    cont_capacity: usize,
}

impl Geometry {
    fn new(page_size: u32) -> Self {
        let page_size = page_size as usize;
        let page_capacity = page_size - PAGE_HEADER_SIZE - BLOB_PAGE_HEADER_SIZE;
        Self {
            page_size,
            page_capacity,
            first_capacity: page_capacity - BLOB_HEADER_SIZE,
            cont_capacity: page_size - PAGE_HEADER_SIZE,
        }
    }

    fn page_address(&self, blob_id: u64) -> u64 {
        blob_id - blob_id % self.page_size as u64
    }

    fn run_page_count(&self, allocated: usize) -> usize {
        if allocated <= self.first_capacity {
            1
        } else {
            1 + (allocated - self.first_capacity).div_ceil(self.cont_capacity)
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BlobHeader {
    id: U64,
    allocated_size: U64,
    size: U64,
    flags: U32,
}

impl BlobHeader {
    zerocopy_accessors! {
        id: u64,
        allocated_size: u64,
        size: u64,
        flags: u32,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct BlobPageHeader {
    used: zerocopy::little_endian::U16,
    next_free: zerocopy::little_endian::U16,
}

impl BlobPageHeader {
    zerocopy_accessors! {
        used: u16,
        next_free: u16,
    }
}

/// Rounds a payload size up to the in-place-overwrite granule.
fn padded(len: usize) -> usize {
    len.div_ceil(16) * 16
}

pub struct BlobManager {
    geometry: Geometry,
    /// The shared blob page currently being filled, if any.
    open_page: Mutex<Option<(u64, u16)>>,
}

impl BlobManager {
    pub fn new(page_size: u32) -> Self {
        Self {
            geometry: Geometry::new(page_size),
            open_page: Mutex::new(None),
        }
    }

    /// Stores `data` out of line and returns its blob id.
    pub fn allocate(&self, pager: &PageManager, data: &[u8]) -> Result<u64> {
        let padded_len = padded(data.len().max(1));
        if padded_len <= self.geometry.first_capacity {
            self.allocate_packed(pager, data, padded_len)
        } else {
            self.allocate_spanning(pager, data)
        }
    }

    fn allocate_packed(&self, pager: &PageManager, data: &[u8], padded_len: usize) -> Result<u64> {
        let need = BLOB_HEADER_SIZE + padded_len;
        let mut open = self.open_page.lock();

        let (address, offset) = match *open {
            Some((address, next_free))
                if next_free as usize + need <= self.geometry.page_size =>
            {
                (address, next_free)
            }
            _ => {
                let page = pager.alloc(PageType::Blob)?;
                let address = page.address();
                let offset = (PAGE_HEADER_SIZE + BLOB_PAGE_HEADER_SIZE) as u16;
                let mut guard = page.buffer();
                let header: &mut BlobPageHeader = parse_zerocopy_mut(
                    &mut guard[PAGE_HEADER_SIZE..],
                    "BlobPageHeader",
                )?;
                header.set_used(0);
                header.set_next_free(offset);
                drop(guard);
                (address, offset)
            }
        };

        let page = pager.fetch(address, FetchMode::ReadWrite)?;
        let blob_id = address + offset as u64;
        {
            let mut guard = page.buffer();
            let header: &mut BlobPageHeader =
                parse_zerocopy_mut(&mut guard[PAGE_HEADER_SIZE..], "BlobPageHeader")?;
            header.set_used(header.used() + 1);
            header.set_next_free(offset + need as u16);

            let mut blob = BlobHeader {
                id: Default::default(),
                allocated_size: Default::default(),
                size: Default::default(),
                flags: Default::default(),
            };
            blob.set_id(blob_id);
            blob.set_allocated_size(padded_len as u64);
            blob.set_size(data.len() as u64);
            blob.set_flags(0);

            let start = offset as usize;
            guard[start..start + BLOB_HEADER_SIZE].copy_from_slice(blob.as_bytes());
            let data_start = start + BLOB_HEADER_SIZE;
            guard[data_start..data_start + data.len()].copy_from_slice(data);
        }

        *open = Some((address, offset + need as u16));
        Ok(blob_id)
    }

    fn allocate_spanning(&self, pager: &PageManager, data: &[u8]) -> Result<u64> {
        let count = self.geometry.run_page_count(data.len());
        let allocated = self.geometry.first_capacity
            + (count - 1) * self.geometry.cont_capacity;
        let pages = pager.alloc_run(PageType::Blob, count)?;
        let base = pages[0].address();
        let blob_id = base + (PAGE_HEADER_SIZE + BLOB_PAGE_HEADER_SIZE) as u64;

        {
            let mut guard = pages[0].buffer();
            let occupancy: &mut BlobPageHeader =
                parse_zerocopy_mut(&mut guard[PAGE_HEADER_SIZE..], "BlobPageHeader")?;
            occupancy.set_used(1);
            occupancy.set_next_free(self.geometry.page_size as u16);

            let mut blob = BlobHeader {
                id: Default::default(),
                allocated_size: Default::default(),
                size: Default::default(),
                flags: Default::default(),
            };
            blob.set_id(blob_id);
            blob.set_allocated_size(allocated as u64);
            blob.set_size(data.len() as u64);
            blob.set_flags(BLOB_FLAG_SPANNING);

            let start = PAGE_HEADER_SIZE + BLOB_PAGE_HEADER_SIZE;
            guard[start..start + BLOB_HEADER_SIZE].copy_from_slice(blob.as_bytes());
        }

        self.write_spanning_payload(&pages, data)?;
        Ok(blob_id)
    }

    fn write_spanning_payload(
        &self,
        pages: &[Arc<crate::storage::Page>],
        data: &[u8],
    ) -> Result<()> {
        let mut written = 0usize;
        for (i, page) in pages.iter().enumerate() {
            let mut guard = page.buffer();
            let (start, capacity) = if i == 0 {
                (
                    PAGE_HEADER_SIZE + BLOB_PAGE_HEADER_SIZE + BLOB_HEADER_SIZE,
                    self.geometry.first_capacity,
                )
            } else {
                (PAGE_HEADER_SIZE, self.geometry.cont_capacity)
            };
            let chunk = capacity.min(data.len() - written);
            guard[start..start + chunk].copy_from_slice(&data[written..written + chunk]);
            // zero the rest so old payload never leaks past the new size
            guard[start + chunk..start + capacity].fill(0);
            written += chunk;
            if written == data.len() {
                break;
            }
        }
        ensure!(written == data.len(), "spanning blob run too short");
        Ok(())
    }

    fn read_header(&self, pager: &PageManager, blob_id: u64) -> Result<BlobHeader> {
        let address = self.geometry.page_address(blob_id);
        let page = pager
            .fetch(address, FetchMode::ReadOnly)
            .wrap_err_with(|| format!("blob {blob_id:#x}: failed to fetch its page"))?;
        let guard = page.buffer();
        let start = (blob_id - address) as usize;
        ensure!(
            start + BLOB_HEADER_SIZE <= guard.len(),
            "blob id {blob_id:#x} points past its page"
        );
        let header: &BlobHeader = parse_zerocopy(&guard[start..], "BlobHeader")?;
        if header.id() != blob_id || header.flags() & BLOB_FLAG_FREED != 0 {
            return Err(typed(
                StoreError::IntegrityViolated,
                format!(
                    "blob id {blob_id:#x} does not address a live blob \
                     (stored id {:#x}, flags {:#x})",
                    header.id(),
                    header.flags()
                ),
            ));
        }
        Ok(*header)
    }

    /// Returns a copy of the blob's payload.
    pub fn read(&self, pager: &PageManager, blob_id: u64) -> Result<Vec<u8>> {
        let header = self.read_header(pager, blob_id)?;
        let size = header.size() as usize;
        let mut out = vec![0u8; size];

        if header.flags() & BLOB_FLAG_SPANNING == 0 {
            let address = self.geometry.page_address(blob_id);
            let page = pager.fetch(address, FetchMode::ReadOnly)?;
            let guard = page.buffer();
            let start = (blob_id - address) as usize + BLOB_HEADER_SIZE;
            ensure!(
                start + size <= guard.len(),
                "blob {blob_id:#x} claims {size} bytes past its page end"
            );
            out.copy_from_slice(&guard[start..start + size]);
            return Ok(out);
        }

        let base = self.geometry.page_address(blob_id);
        let count = self.geometry.run_page_count(header.allocated_size() as usize);
        let mut read = 0usize;
        for i in 0..count {
            if read == size {
                break;
            }
            let page = pager.fetch(base + (i * self.geometry.page_size) as u64, FetchMode::ReadOnly)?;
            let guard = page.buffer();
            let (start, capacity) = if i == 0 {
                (
                    PAGE_HEADER_SIZE + BLOB_PAGE_HEADER_SIZE + BLOB_HEADER_SIZE,
                    self.geometry.first_capacity,
                )
            } else {
                (PAGE_HEADER_SIZE, self.geometry.cont_capacity)
            };
            let chunk = capacity.min(size - read);
            out[read..read + chunk].copy_from_slice(&guard[start..start + chunk]);
            read += chunk;
        }
        ensure!(read == size, "spanning blob truncated: {read} of {size} bytes");
        Ok(out)
    }

    /// The live payload length of a blob.
    pub fn size(&self, pager: &PageManager, blob_id: u64) -> Result<u64> {
        Ok(self.read_header(pager, blob_id)?.size())
    }

    /// Replaces the payload. Reuses the region when the new payload fits the
    /// allocation; otherwise frees it and allocates anew. Returns the
    /// (possibly changed) blob id.
    pub fn overwrite(&self, pager: &PageManager, blob_id: u64, data: &[u8]) -> Result<u64> {
        let header = self.read_header(pager, blob_id)?;

        if data.len() as u64 <= header.allocated_size() {
            let address = self.geometry.page_address(blob_id);
            let page = pager.fetch(address, FetchMode::ReadWrite)?;

            if header.flags() & BLOB_FLAG_SPANNING == 0 {
                let mut guard = page.buffer();
                let start = (blob_id - address) as usize;
                let blob: &mut BlobHeader = parse_zerocopy_mut(&mut guard[start..], "BlobHeader")?;
                blob.set_size(data.len() as u64);
                let data_start = start + BLOB_HEADER_SIZE;
                guard[data_start..data_start + data.len()].copy_from_slice(data);
            } else {
                {
                    let mut guard = page.buffer();
                    let start = (blob_id - address) as usize;
                    let blob: &mut BlobHeader =
                        parse_zerocopy_mut(&mut guard[start..], "BlobHeader")?;
                    blob.set_size(data.len() as u64);
                }
                let count = self.geometry.run_page_count(header.allocated_size() as usize);
                let mut pages = Vec::with_capacity(count);
                for i in 0..count {
                    pages.push(pager.fetch(
                        address + (i * self.geometry.page_size) as u64,
                        FetchMode::ReadWrite,
                    )?);
                }
                self.write_spanning_payload(&pages, data)?;
            }
            return Ok(blob_id);
        }

        self.erase(pager, blob_id)?;
        self.allocate(pager, data)
    }

    /// Frees the blob's region. Shared blob pages return to the freelist
    /// when their last blob dies; spanning runs are freed whole.
    pub fn erase(&self, pager: &PageManager, blob_id: u64) -> Result<()> {
        let header = self.read_header(pager, blob_id)?;
        let address = self.geometry.page_address(blob_id);

        if header.flags() & BLOB_FLAG_SPANNING != 0 {
            let count = self.geometry.run_page_count(header.allocated_size() as usize);
            pager.free_run(address, count)?;
            return Ok(());
        }

        let page = pager.fetch(address, FetchMode::ReadWrite)?;
        let remaining = {
            let mut guard = page.buffer();
            let start = (blob_id - address) as usize;
            let blob: &mut BlobHeader = parse_zerocopy_mut(&mut guard[start..], "BlobHeader")?;
            blob.set_flags(blob.flags() | BLOB_FLAG_FREED);

            let occupancy: &mut BlobPageHeader =
                parse_zerocopy_mut(&mut guard[PAGE_HEADER_SIZE..], "BlobPageHeader")?;
            let used = occupancy.used().saturating_sub(1);
            occupancy.set_used(used);
            used
        };

        if remaining == 0 {
            let mut open = self.open_page.lock();
            if matches!(*open, Some((open_addr, _)) if open_addr == address) {
                *open = None;
            }
            drop(open);
            pager.free_page(address)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, MemoryDevice};
    use crate::error::store_error;
    use std::sync::atomic::AtomicU64;

    fn setup() -> (PageManager, BlobManager) {
        let device: Arc<dyn Device> = Arc::new(MemoryDevice::new());
        device.alloc_page(1024).unwrap(); // header slot
        let pager = PageManager::new(
            device,
            1024,
            0,
            u64::MAX,
            false,
            Arc::new(AtomicU64::new(u64::MAX)),
        );
        (pager, BlobManager::new(1024))
    }

    #[test]
    fn allocate_and_read_small_blob() {
        let (pager, blobs) = setup();

        let id = blobs.allocate(&pager, b"hello blob").unwrap();
        assert_eq!(blobs.read(&pager, id).unwrap(), b"hello blob");
        assert_eq!(blobs.size(&pager, id).unwrap(), 10);
        pager.take_changeset().release();
    }

    #[test]
    fn small_blobs_pack_into_one_page() {
        let (pager, blobs) = setup();

        let a = blobs.allocate(&pager, b"first").unwrap();
        let b = blobs.allocate(&pager, b"second").unwrap();

        // same page, different offsets
        assert_eq!(a / 1024, b / 1024);
        assert_ne!(a, b);
        assert_eq!(blobs.read(&pager, a).unwrap(), b"first");
        assert_eq!(blobs.read(&pager, b).unwrap(), b"second");
        pager.take_changeset().release();
    }

    #[test]
    fn spanning_blob_round_trips() {
        let (pager, blobs) = setup();

        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let id = blobs.allocate(&pager, &data).unwrap();

        assert_eq!(blobs.read(&pager, id).unwrap(), data);
        pager.take_changeset().release();
    }

    #[test]
    fn overwrite_in_place_keeps_id() {
        let (pager, blobs) = setup();

        let id = blobs.allocate(&pager, b"0123456789abcdef").unwrap();
        // 16 bytes allocated; 10 fits in place
        let new_id = blobs.overwrite(&pager, id, b"short data").unwrap();

        assert_eq!(new_id, id);
        assert_eq!(blobs.read(&pager, id).unwrap(), b"short data");
        pager.take_changeset().release();
    }

    #[test]
    fn overwrite_with_growth_relocates() {
        let (pager, blobs) = setup();

        let id = blobs.allocate(&pager, b"tiny").unwrap();
        let big = vec![7u8; 3000];
        let new_id = blobs.overwrite(&pager, id, &big).unwrap();

        assert_ne!(new_id, id);
        assert_eq!(blobs.read(&pager, new_id).unwrap(), big);
        // the old id no longer addresses a live blob
        let err = blobs.read(&pager, id).unwrap_err();
        assert_eq!(store_error(&err), Some(StoreError::IntegrityViolated));
        pager.take_changeset().release();
    }

    #[test]
    fn erase_frees_page_when_last_blob_dies() {
        let (pager, blobs) = setup();

        let a = blobs.allocate(&pager, b"one").unwrap();
        let b = blobs.allocate(&pager, b"two").unwrap();
        let page_address = a / 1024 * 1024;
        pager.take_changeset().release();

        blobs.erase(&pager, a).unwrap();
        assert_eq!(blobs.read(&pager, b).unwrap(), b"two");

        blobs.erase(&pager, b).unwrap();
        // the page is free again: the next allocation reuses its address
        let c = blobs.allocate(&pager, b"recycled").unwrap();
        assert_eq!(c / 1024 * 1024, page_address);
        pager.take_changeset().release();
    }

    #[test]
    fn erase_spanning_blob_frees_whole_run() {
        let (pager, blobs) = setup();

        let data = vec![1u8; 4000];
        let id = blobs.allocate(&pager, &data).unwrap();
        let base = id / 1024 * 1024;
        pager.take_changeset().release();

        let free_before = pager.free_bytes();
        blobs.erase(&pager, id).unwrap();
        assert!(pager.free_bytes() > free_before);

        // a fresh spanning blob reuses the freed run
        let id2 = blobs.allocate(&pager, &data).unwrap();
        assert_eq!(id2 / 1024 * 1024, base);
        pager.take_changeset().release();
    }

    #[test]
    fn stale_id_is_rejected() {
        let (pager, blobs) = setup();

        let id = blobs.allocate(&pager, b"data").unwrap();
        pager.take_changeset().release();

        // an offset inside the page that is not a blob header
        let err = blobs.read(&pager, id + 4).unwrap_err();
        assert_eq!(store_error(&err), Some(StoreError::IntegrityViolated));
    }

    #[test]
    fn erased_id_is_rejected() {
        let (pager, blobs) = setup();

        let keep = blobs.allocate(&pager, b"keep").unwrap();
        let gone = blobs.allocate(&pager, b"gone").unwrap();
        pager.take_changeset().release();

        blobs.erase(&pager, gone).unwrap();
        let err = blobs.read(&pager, gone).unwrap_err();
        assert_eq!(store_error(&err), Some(StoreError::IntegrityViolated));
        assert_eq!(blobs.read(&pager, keep).unwrap(), b"keep");
    }
}
