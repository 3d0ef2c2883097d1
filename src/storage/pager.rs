//! # Page Manager
//!
//! The facade every higher layer allocates and fetches pages through. It
//! owns the cache, the file-wide freelist, the background worker handle,
//! and the current changeset, and it enforces the three rules that make the
//! rest of the engine simple:
//!
//! 1. every page fetched for writing lands in the current changeset (pinned,
//!    before-image captured) before the caller sees it;
//! 2. the cache never grows past its budget without a purge request being
//!    posted, and a saturated cache blocks the *caller* on the worker's
//!    progress, never on device I/O directly;
//! 3. page addresses come from the freelist first, the device second, and a
//!    freed tail run shrinks the file on close.
//!
//! ## Fetch Modes
//!
//! `ReadOnly` fetches return the page untouched. `ReadWrite` fetches join
//! the changeset and mark the page dirty; in a read-only environment they
//! fail with `write-protected`.
//!
//! ## Saturation
//!
//! When the cache is at capacity and nothing is evictable (every page
//! pinned, or dirty above the durable-LSN watermark), fetch posts a purge
//! and waits on worker progress up to a timeout, then fails with
//! `limits-reached`. The timeout turns a wedged configuration (cache
//! smaller than one operation's working set) into an error instead of a
//! deadlock.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;

use crate::config::constants::FETCH_BLOCK_TIMEOUT_MS;
use crate::device::Device;
use crate::error::{typed, StoreError};
use crate::journal::changeset::{AddressList, Changeset};

use super::cache::PageCache;
use super::freelist::Freelist;
use super::page::{verify_on_read, Page, PageType};
use super::worker::{write_page_out, WorkerHandle, WorkerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchMode {
    ReadOnly,
    ReadWrite,
}

pub struct PageManager {
    device: Arc<dyn Device>,
    cache: Arc<PageCache>,
    freelist: Mutex<Freelist>,
    /// Freelist image and device length from the start of the current
    /// operation; restored on discard so a failed operation cannot leave
    /// live pages marked free.
    freelist_backup: Mutex<Option<(Vec<u8>, u64)>>,
    worker: Mutex<Option<WorkerHandle>>,
    durable_lsn: Arc<AtomicU64>,
    changeset: Mutex<Changeset>,
    page_size: u32,
    file_size_limit: u64,
    read_only: bool,
}

impl PageManager {
    pub fn new(
        device: Arc<dyn Device>,
        page_size: u32,
        cache_size: usize,
        file_size_limit: u64,
        read_only: bool,
        durable_lsn: Arc<AtomicU64>,
    ) -> Self {
        let cache = Arc::new(PageCache::new(cache_size));
        let worker = WorkerHandle::spawn(
            Arc::clone(&cache),
            Arc::clone(&device),
            Arc::clone(&durable_lsn),
        );

        Self {
            device,
            cache,
            freelist: Mutex::new(Freelist::new()),
            freelist_backup: Mutex::new(None),
            worker: Mutex::new(Some(worker)),
            durable_lsn,
            changeset: Mutex::new(Changeset::new()),
            page_size,
            file_size_limit,
            read_only,
        }
    }

    /// Captures the freelist (and the device length) once per operation,
    /// before the first freelist mutation.
    fn backup_freelist(&self) -> Result<()> {
        let mut backup = self.freelist_backup.lock();
        if backup.is_none() {
            *backup = Some((self.freelist.lock().serialize(), self.device.len()?));
        }
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    pub fn cache(&self) -> &Arc<PageCache> {
        &self.cache
    }

    fn durable(&self) -> u64 {
        self.durable_lsn
            .load(std::sync::atomic::Ordering::Acquire)
    }

    /// Fetches the page at `address`, reading it from the device on a cache
    /// miss. `ReadWrite` joins the current changeset.
    pub fn fetch(&self, address: u64, mode: FetchMode) -> Result<Arc<Page>> {
        if mode == FetchMode::ReadWrite && self.read_only {
            return Err(typed(
                StoreError::WriteProtected,
                format!("write fetch of page {address:#x} in a read-only environment"),
            ));
        }

        let page = if let Some(page) = self.cache.get(address) {
            page
        } else {
            self.ensure_capacity()?;

            let mut buffer = vec![0u8; self.page_size as usize].into_boxed_slice();
            self.device
                .read_page(address, &mut buffer)
                .wrap_err_with(|| format!("failed to read page {address:#x}"))?;
            verify_on_read(&buffer)
                .map_err(|e| typed(StoreError::IntegrityViolated, e.to_string()))
                .wrap_err_with(|| format!("page {address:#x} failed checksum verification"))?;

            let page = Arc::new(Page::from_disk(address, self.page_size, buffer)?);
            // a racing fetch may have inserted it first; the cache copy wins
            if let Some(existing) = self.cache.get(address) {
                existing
            } else {
                self.cache.insert(Arc::clone(&page));
                page
            }
        };

        if mode == FetchMode::ReadWrite {
            self.changeset.lock().add(&page, false);
        }
        self.maybe_request_purge();
        Ok(page)
    }

    /// Allocates a zeroed, type-tagged page: freelist first, device second.
    /// The page joins the current changeset.
    pub fn alloc(&self, ty: PageType) -> Result<Arc<Page>> {
        if self.read_only {
            return Err(typed(
                StoreError::WriteProtected,
                "page allocation in a read-only environment",
            ));
        }
        self.ensure_capacity()?;

        self.backup_freelist()?;
        let recycled = self.freelist.lock().allocate(self.page_size as u64);
        let address = match recycled {
            Some(address) => address,
            None => {
                let file_len = self.device.len()?;
                if file_len + self.page_size as u64 > self.file_size_limit {
                    return Err(typed(
                        StoreError::LimitsReached,
                        format!(
                            "file size limit {} reached at {} bytes",
                            self.file_size_limit, file_len
                        ),
                    ));
                }
                self.device.alloc_page(self.page_size)?
            }
        };

        let page = Arc::new(Page::new_zeroed(address, self.page_size, ty));
        self.cache.insert(Arc::clone(&page));
        self.changeset.lock().add(&page, true);
        self.maybe_request_purge();
        Ok(page)
    }

    /// Allocates `count` physically contiguous pages (for multi-page
    /// blobs). All of them join the changeset.
    pub fn alloc_run(&self, ty: PageType, count: usize) -> Result<Vec<Arc<Page>>> {
        ensure!(count > 0, "empty page run requested");
        if count == 1 {
            return Ok(vec![self.alloc(ty)?]);
        }
        if self.read_only {
            return Err(typed(
                StoreError::WriteProtected,
                "page allocation in a read-only environment",
            ));
        }
        self.ensure_capacity()?;

        let run_bytes = self.page_size as u64 * count as u64;
        self.backup_freelist()?;
        let base = match self.freelist.lock().allocate(run_bytes) {
            Some(address) => address,
            None => {
                let file_len = self.device.len()?;
                if file_len + run_bytes > self.file_size_limit {
                    return Err(typed(
                        StoreError::LimitsReached,
                        format!("file size limit {} reached", self.file_size_limit),
                    ));
                }
                let base = self.device.alloc_page(self.page_size)?;
                for i in 1..count {
                    let next = self.device.alloc_page(self.page_size)?;
                    ensure!(
                        next == base + self.page_size as u64 * i as u64,
                        "device returned a non-contiguous page run"
                    );
                }
                base
            }
        };

        let mut pages = Vec::with_capacity(count);
        let mut changeset = self.changeset.lock();
        for i in 0..count {
            let address = base + self.page_size as u64 * i as u64;
            let page = Arc::new(Page::new_zeroed(address, self.page_size, ty));
            self.cache.insert(Arc::clone(&page));
            changeset.add(&page, true);
            pages.push(page);
        }
        drop(changeset);
        self.maybe_request_purge();
        Ok(pages)
    }

    /// Returns a page to the freelist. The page leaves the cache; its disk
    /// space becomes reusable immediately.
    pub fn free_page(&self, address: u64) -> Result<()> {
        ensure!(address != 0, "attempted to free the header page");
        self.backup_freelist()?;
        self.cache.remove(address);
        self.freelist.lock().free(address, self.page_size as u64);
        Ok(())
    }

    /// Frees a contiguous run previously produced by [`alloc_run`].
    ///
    /// [`alloc_run`]: PageManager::alloc_run
    pub fn free_run(&self, address: u64, count: usize) -> Result<()> {
        ensure!(address != 0 && count > 0, "invalid page run");
        self.backup_freelist()?;
        for i in 0..count {
            self.cache
                .remove(address + self.page_size as u64 * i as u64);
        }
        self.freelist
            .lock()
            .free(address, self.page_size as u64 * count as u64);
        Ok(())
    }

    // ------------------------------------------------------------------
    // changeset scope
    // ------------------------------------------------------------------

    /// Takes the current changeset for journaling, leaving an empty one.
    /// The operation's freelist backup is dropped: the mutations stand.
    pub fn take_changeset(&self) -> Changeset {
        self.freelist_backup.lock().take();
        std::mem::take(&mut *self.changeset.lock())
    }

    /// Discards the current changeset: every touched page rolls back to
    /// its before-image, freshly allocated pages leave the cache, and the
    /// freelist reverts to its start-of-operation image (freelist-sourced
    /// allocations become free again; device growth is reclaimed by the
    /// close-time tail truncation at the latest).
    pub fn discard_changeset(&self) {
        let backup = self.freelist_backup.lock().take();
        let changeset = std::mem::take(&mut *self.changeset.lock());
        let fresh = changeset.roll_back();
        for &address in &fresh {
            self.cache.remove(address);
        }
        // an allocation always captures a backup first, so fresh members
        // imply one exists; without a backup no freelist mutation happened
        if let Some((image, old_device_len)) = backup {
            match Freelist::deserialize(&image) {
                Ok(restored) => *self.freelist.lock() = restored,
                Err(err) => {
                    tracing::error!(%err, "freelist backup failed to restore");
                    return;
                }
            }
            // fresh pages carved out of device growth lie past the old
            // file end; give them straight back so the space is reusable
            let mut freelist = self.freelist.lock();
            for &address in &fresh {
                if address >= old_device_len {
                    freelist.free(address, self.page_size as u64);
                }
            }
        }
    }

    /// True when the current operation has touched any page.
    pub fn changeset_is_empty(&self) -> bool {
        self.changeset.lock().is_empty()
    }

    // ------------------------------------------------------------------
    // worker plumbing
    // ------------------------------------------------------------------

    fn maybe_request_purge(&self) {
        if self.cache.over_high_watermark() {
            if let Some(worker) = self.worker.lock().as_ref() {
                worker.post_purge();
            }
        }
    }

    /// Posts an asynchronous flush of the given pages to the worker.
    pub fn request_flush(&self, addresses: AddressList) {
        if addresses.is_empty() {
            return;
        }
        if let Some(worker) = self.worker.lock().as_ref() {
            worker.post(WorkerMessage::FlushRange(addresses));
        }
    }

    fn ensure_capacity(&self) -> Result<()> {
        if !self.cache.at_capacity(self.page_size) {
            return Ok(());
        }

        // evict synchronously when possible: cheaper than a worker round trip
        // and correct because clean victims need no I/O
        loop {
            match self.cache.evict_one(self.durable()) {
                Some(victim) if !victim.is_dirty() => {}
                Some(victim) => {
                    // dirty but journal-covered: hand it to the worker and
                    // keep it resident until written
                    self.cache.insert(Arc::clone(&victim));
                    if let Some(worker) = self.worker.lock().as_ref() {
                        worker.post(WorkerMessage::FlushPage(victim.address()));
                    }
                    break;
                }
                None => break,
            }
            if !self.cache.at_capacity(self.page_size) {
                return Ok(());
            }
        }

        // nothing synchronously evictable: wait for the worker
        let deadline = Instant::now() + Duration::from_millis(FETCH_BLOCK_TIMEOUT_MS);
        loop {
            if !self.cache.at_capacity(self.page_size) {
                return Ok(());
            }
            let worker_guard = self.worker.lock();
            let Some(worker) = worker_guard.as_ref() else {
                return Ok(()); // shutting down; admit the page
            };
            let seen = worker.progress_generation();
            worker.post_purge();
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(typed(
                    StoreError::LimitsReached,
                    format!(
                        "cache full ({} bytes) and no page evictable within {}ms",
                        self.cache.resident_bytes(),
                        FETCH_BLOCK_TIMEOUT_MS
                    ),
                ));
            }
            let progressed = worker.wait_for_progress(seen, remaining);
            drop(worker_guard);
            if !progressed && Instant::now() >= deadline {
                return Err(typed(
                    StoreError::LimitsReached,
                    "cache full and background worker made no progress",
                ));
            }
        }
    }

    // ------------------------------------------------------------------
    // freelist persistence and close
    // ------------------------------------------------------------------

    pub fn freelist_snapshot(&self) -> Vec<u8> {
        self.freelist.lock().serialize()
    }

    pub fn load_freelist(&self, data: &[u8]) -> Result<()> {
        *self.freelist.lock() = Freelist::deserialize(data)?;
        Ok(())
    }

    pub fn free_bytes(&self) -> u64 {
        self.freelist.lock().total_free_bytes()
    }

    /// Writes every dirty resident page to the device and syncs it.
    pub fn flush_all(&self) -> Result<()> {
        let durable = self.durable();
        for page in self.cache.snapshot() {
            if page.is_dirty() {
                ensure!(
                    page.lsn() <= durable,
                    "flush-all found page {:#x} with LSN {} above the durable \
                     watermark {durable}",
                    page.address(),
                    page.lsn()
                );
                write_page_out(&*self.device, &page)?;
            }
        }
        self.device.flush()?;
        Ok(())
    }

    /// Gives freelist runs at the file tail back to the filesystem.
    pub fn truncate_tail(&self) -> Result<()> {
        let mut freelist = self.freelist.lock();
        let mut file_len = self.device.len()?;
        while let Some(new_len) = freelist.truncate_tail(file_len) {
            self.device.truncate(new_len)?;
            tracing::debug!(from = file_len, to = new_len, "truncated freed tail");
            file_len = new_len;
        }
        Ok(())
    }

    /// Stops the background worker, draining mandatory flushes.
    pub fn shutdown(&self) {
        if let Some(mut worker) = self.worker.lock().take() {
            worker.shutdown();
        }
    }
}

impl Drop for PageManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;

    fn pager(cache_size: usize) -> PageManager {
        let device: Arc<dyn Device> = Arc::new(MemoryDevice::new());
        // reserve page 0 as the header slot the way the environment does
        device.alloc_page(1024).unwrap();
        PageManager::new(
            device,
            1024,
            cache_size,
            u64::MAX,
            false,
            Arc::new(AtomicU64::new(u64::MAX)),
        )
    }

    #[test]
    fn alloc_returns_distinct_typed_pages() {
        let pager = pager(0);

        let a = pager.alloc(PageType::BtreeLeaf).unwrap();
        let b = pager.alloc(PageType::Blob).unwrap();

        assert_ne!(a.address(), b.address());
        assert_eq!(a.ty(), PageType::BtreeLeaf);
        assert_eq!(b.ty(), PageType::Blob);
        assert!(a.is_pinned()); // member of the current changeset
    }

    #[test]
    fn fetch_read_only_does_not_join_changeset() {
        let pager = pager(0);
        let a = pager.alloc(PageType::BtreeLeaf).unwrap();
        let address = a.address();
        pager.take_changeset().release();

        let fetched = pager.fetch(address, FetchMode::ReadOnly).unwrap();
        assert!(!fetched.is_pinned());
        assert!(pager.changeset_is_empty());
    }

    #[test]
    fn fetch_read_write_joins_changeset() {
        let pager = pager(0);
        let a = pager.alloc(PageType::BtreeLeaf).unwrap();
        let address = a.address();
        pager.take_changeset().release();

        let fetched = pager.fetch(address, FetchMode::ReadWrite).unwrap();
        assert!(fetched.is_pinned());
        assert!(!pager.changeset_is_empty());
        pager.take_changeset().release();
    }

    #[test]
    fn freed_page_address_is_recycled() {
        let pager = pager(0);
        let a = pager.alloc(PageType::BtreeLeaf).unwrap();
        let address = a.address();
        pager.take_changeset().release();
        drop(a);

        pager.free_page(address).unwrap();
        let b = pager.alloc(PageType::Blob).unwrap();
        assert_eq!(b.address(), address);
        pager.take_changeset().release();
    }

    #[test]
    fn discard_rolls_back_buffer_mutations() {
        let pager = pager(0);
        let a = pager.alloc(PageType::BtreeLeaf).unwrap();
        let address = a.address();
        pager.take_changeset().release();

        let page = pager.fetch(address, FetchMode::ReadWrite).unwrap();
        page.buffer()[100] = 0xAB;
        pager.discard_changeset();

        let reread = pager.fetch(address, FetchMode::ReadOnly).unwrap();
        assert_eq!(reread.buffer()[100], 0);
    }

    #[test]
    fn discard_returns_fresh_pages_to_freelist() {
        let pager = pager(0);
        let a = pager.alloc(PageType::BtreeLeaf).unwrap();
        let address = a.address();
        drop(a);

        pager.discard_changeset();

        // the same address comes back on the next allocation
        let b = pager.alloc(PageType::BtreeLeaf).unwrap();
        assert_eq!(b.address(), address);
        pager.take_changeset().release();
    }

    #[test]
    fn read_only_pager_rejects_writes() {
        let device: Arc<dyn Device> = Arc::new(MemoryDevice::new());
        device.alloc_page(1024).unwrap();
        let pager = PageManager::new(
            device,
            1024,
            0,
            u64::MAX,
            true,
            Arc::new(AtomicU64::new(u64::MAX)),
        );

        let err = pager.alloc(PageType::BtreeLeaf).unwrap_err();
        assert_eq!(
            crate::error::store_error(&err),
            Some(StoreError::WriteProtected)
        );

        let err = pager.fetch(0, FetchMode::ReadWrite).unwrap_err();
        assert_eq!(
            crate::error::store_error(&err),
            Some(StoreError::WriteProtected)
        );
    }

    #[test]
    fn file_size_limit_stops_allocation() {
        let device: Arc<dyn Device> = Arc::new(MemoryDevice::new());
        device.alloc_page(1024).unwrap();
        let pager = PageManager::new(
            device,
            1024,
            0,
            2048,
            false,
            Arc::new(AtomicU64::new(u64::MAX)),
        );

        pager.alloc(PageType::BtreeLeaf).unwrap();
        let err = pager.alloc(PageType::BtreeLeaf).unwrap_err();
        assert_eq!(
            crate::error::store_error(&err),
            Some(StoreError::LimitsReached)
        );
        pager.take_changeset().release();
    }

    #[test]
    fn saturated_cache_of_pinned_pages_times_out() {
        // cache budget of two pages, both pinned by the changeset
        let pager = pager(2048);
        let _a = pager.alloc(PageType::BtreeLeaf).unwrap();
        let _b = pager.alloc(PageType::BtreeLeaf).unwrap();

        let err = pager.alloc(PageType::BtreeLeaf).unwrap_err();
        assert_eq!(
            crate::error::store_error(&err),
            Some(StoreError::LimitsReached)
        );
        pager.take_changeset().release();
    }

    #[test]
    fn flush_all_writes_dirty_pages() {
        let pager = pager(0);
        let a = pager.alloc(PageType::BtreeLeaf).unwrap();
        a.buffer()[200] = 0x5A;
        let address = a.address();
        pager.take_changeset().release();

        pager.flush_all().unwrap();
        assert!(!a.is_dirty());

        // drop the cache copy and re-read from the device
        pager.cache().remove(address);
        drop(a);
        let reread = pager.fetch(address, FetchMode::ReadOnly).unwrap();
        assert_eq!(reread.buffer()[200], 0x5A);
    }

    #[test]
    fn truncate_tail_shrinks_device() {
        let pager = pager(0);
        let a = pager.alloc(PageType::BtreeLeaf).unwrap();
        let b = pager.alloc(PageType::BtreeLeaf).unwrap();
        let (addr_a, addr_b) = (a.address(), b.address());
        pager.take_changeset().release();
        drop((a, b));

        pager.free_page(addr_b).unwrap();
        pager.truncate_tail().unwrap();
        assert_eq!(pager.device().len().unwrap(), addr_b);

        // interior free pages do not shrink the file
        pager.free_page(addr_a).unwrap();
        let len_before = pager.device().len().unwrap();
        assert_eq!(len_before, addr_b);
        pager.truncate_tail().unwrap();
        assert_eq!(pager.device().len().unwrap(), addr_a);
    }
}
