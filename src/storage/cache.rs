//! # Page Cache
//!
//! Cache of resident pages keyed by address. The original design's pair of
//! intrusive lists (global purge list + per-bucket chains) becomes an arena
//! of `Arc<Page>` entries plus a `hashbrown` index: the arena slot doubles
//! as the list node, and `swap_remove` keeps it dense.
//!
//! ## Eviction
//!
//! A second-chance clock sweeps the arena in place of a strict LRU tail
//! scan. Each `get` sets the page's visited flag; the clock hand clears it
//! once before a page becomes a victim, so recently-touched pages survive a
//! sweep and sequential scans cannot wipe the working set.
//!
//! A page is *never* a victim while:
//! - it is pinned (member of the current changeset),
//! - it is the environment header page (address 0),
//! - it is dirty and its LSN exceeds the durable-LSN watermark; evicting
//!   it would require writing it out, and writing it out before the journal
//!   fsync would break the write-ahead invariant.
//!
//! Dirty pages at or below the watermark are legal victims; the caller
//! (the background worker or the close path) writes them to the device
//! before dropping the last reference.
//!
//! ## Capacity Accounting
//!
//! Capacity is tracked in bytes, not pages, because the page size is a
//! runtime choice. A zero capacity disables purging entirely
//! (cache-unlimited mode).

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::config::constants::{PURGE_HIGH_WATERMARK, PURGE_LOW_WATERMARK};

use super::page::Page;

struct CacheInner {
    entries: Vec<Arc<Page>>,
    index: HashMap<u64, usize>,
    hand: usize,
    resident_bytes: usize,
}

impl CacheInner {
    fn remove_at(&mut self, idx: usize) -> Arc<Page> {
        let page = self.entries.swap_remove(idx);
        self.index.remove(&page.address());
        self.resident_bytes -= page.page_size() as usize;

        if idx < self.entries.len() {
            let moved = self.entries[idx].address();
            self.index.insert(moved, idx);
        }
        if self.hand >= self.entries.len() {
            self.hand = 0;
        }
        page
    }
}

pub struct PageCache {
    inner: Mutex<CacheInner>,
    capacity_bytes: usize,
}

impl PageCache {
    /// `capacity_bytes == 0` means unlimited: nothing is ever evicted.
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: Vec::new(),
                index: HashMap::new(),
                hand: 0,
                resident_bytes: 0,
            }),
            capacity_bytes,
        }
    }

    pub fn get(&self, address: u64) -> Option<Arc<Page>> {
        let inner = self.inner.lock();
        let idx = *inner.index.get(&address)?;
        let page = Arc::clone(&inner.entries[idx]);
        page.mark_visited();
        Some(page)
    }

    pub fn insert(&self, page: Arc<Page>) {
        let mut inner = self.inner.lock();
        debug_assert!(
            !inner.index.contains_key(&page.address()),
            "page {:#x} inserted twice",
            page.address()
        );
        page.mark_visited();
        inner.resident_bytes += page.page_size() as usize;
        let idx = inner.entries.len();
        inner.index.insert(page.address(), idx);
        inner.entries.push(page);
    }

    pub fn remove(&self, address: u64) -> Option<Arc<Page>> {
        let mut inner = self.inner.lock();
        let idx = *inner.index.get(&address)?;
        Some(inner.remove_at(idx))
    }

    /// Picks and removes one eviction victim, or `None` if every resident
    /// page is protected. The returned page may be dirty; the caller owns
    /// writing it out.
    pub fn evict_one(&self, durable_lsn: u64) -> Option<Arc<Page>> {
        let mut inner = self.inner.lock();
        if inner.entries.is_empty() {
            return None;
        }

        // Two full sweeps: the first may only clear visited flags.
        let mut remaining = inner.entries.len() * 2;
        while remaining > 0 {
            remaining -= 1;
            let idx = inner.hand;
            let page = &inner.entries[idx];

            let protected = page.is_pinned()
                || page.address() == 0
                || (page.is_dirty() && page.lsn() > durable_lsn);

            if protected {
                inner.hand = (inner.hand + 1) % inner.entries.len();
                continue;
            }

            if page.take_visited() {
                inner.hand = (inner.hand + 1) % inner.entries.len();
                continue;
            }

            return Some(inner.remove_at(idx));
        }

        None
    }

    pub fn resident_bytes(&self) -> usize {
        self.inner.lock().resident_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// True when a purge request should be posted to the worker.
    pub fn over_high_watermark(&self) -> bool {
        self.capacity_bytes != 0
            && self.resident_bytes() >= self.capacity_bytes / 100 * PURGE_HIGH_WATERMARK
    }

    /// The byte count the purge drives residency down to.
    pub fn low_watermark_bytes(&self) -> usize {
        self.capacity_bytes / 100 * PURGE_LOW_WATERMARK
    }

    /// True when the cache cannot admit another page without eviction.
    pub fn at_capacity(&self, page_size: u32) -> bool {
        self.capacity_bytes != 0
            && self.resident_bytes() + page_size as usize > self.capacity_bytes
    }

    /// Snapshot of every resident page, for flush-all on close.
    pub fn snapshot(&self) -> Vec<Arc<Page>> {
        self.inner.lock().entries.to_vec()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.index.clear();
        inner.hand = 0;
        inner.resident_bytes = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageType;

    fn page(address: u64) -> Arc<Page> {
        let p = Arc::new(Page::new_zeroed(address, 1024, PageType::BtreeLeaf));
        p.clear_dirty();
        p
    }

    #[test]
    fn insert_then_get_returns_same_page() {
        let cache = PageCache::new(0);
        cache.insert(page(1024));

        let found = cache.get(1024).unwrap();
        assert_eq!(found.address(), 1024);
        assert!(cache.get(2048).is_none());
    }

    #[test]
    fn resident_bytes_tracks_inserts_and_removes() {
        let cache = PageCache::new(0);
        cache.insert(page(1024));
        cache.insert(page(2048));
        assert_eq!(cache.resident_bytes(), 2048);

        cache.remove(1024);
        assert_eq!(cache.resident_bytes(), 1024);
    }

    #[test]
    fn evict_one_skips_pinned_pages() {
        let cache = PageCache::new(4096);
        let pinned = page(1024);
        pinned.pin();
        cache.insert(Arc::clone(&pinned));

        assert!(cache.evict_one(u64::MAX).is_none());

        pinned.unpin();
        let victim = cache.evict_one(u64::MAX).unwrap();
        assert_eq!(victim.address(), 1024);
    }

    #[test]
    fn evict_one_never_picks_header_page() {
        let cache = PageCache::new(4096);
        cache.insert(page(0));
        assert!(cache.evict_one(u64::MAX).is_none());
    }

    #[test]
    fn evict_one_respects_durable_lsn_gate() {
        let cache = PageCache::new(4096);
        let dirty = page(1024);
        dirty.mark_dirty();
        {
            let mut guard = dirty.buffer();
            dirty.stamp_lsn(&mut guard, 50).unwrap();
        }
        cache.insert(Arc::clone(&dirty));

        // journal only durable through LSN 10: the page must stay
        assert!(cache.evict_one(10).is_none());

        // once the journal catches up the page is a legal victim
        let victim = cache.evict_one(50).unwrap();
        assert_eq!(victim.address(), 1024);
        assert!(victim.is_dirty());
    }

    #[test]
    fn second_chance_spares_visited_pages_once() {
        let cache = PageCache::new(4096);
        cache.insert(page(1024));
        cache.insert(page(2048));

        // touch 1024 so it carries the visited flag
        cache.get(1024);
        // make sure 2048's insert-time visited flag is cleared by one sweep:
        // first eviction call clears both flags then takes the first
        // unvisited page it meets
        let first = cache.evict_one(u64::MAX).unwrap();
        let second = cache.evict_one(u64::MAX).unwrap();

        let mut evicted = [first.address(), second.address()];
        evicted.sort_unstable();
        assert_eq!(evicted, [1024, 2048]);
        assert!(cache.is_empty());
    }

    #[test]
    fn watermark_math() {
        let cache = PageCache::new(100 * 1024);
        assert!(!cache.over_high_watermark());

        for i in 0..90 {
            cache.insert(page((i + 1) * 1024));
        }
        assert!(cache.over_high_watermark());
        assert_eq!(cache.low_watermark_bytes(), 70 * 1024);
    }

    #[test]
    fn unlimited_cache_never_reports_pressure() {
        let cache = PageCache::new(0);
        for i in 0..1000 {
            cache.insert(page((i + 1) * 1024));
        }
        assert!(!cache.over_high_watermark());
        assert!(!cache.at_capacity(1024));
    }
}
