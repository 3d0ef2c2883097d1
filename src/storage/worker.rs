//! # Background Flush Worker
//!
//! One owned thread per environment performing cache purge and page
//! write-back, so the caller thread never does eviction I/O inline. The
//! caller posts requests through a bounded queue and keeps serving from the
//! cache; only a completely saturated cache makes a fetch wait, and that
//! wait is on the worker's progress signal, not on the device.
//!
//! ## Message Protocol
//!
//! ```text
//! Caller ──► bounded ring (Mutex + Condvar) ──► worker thread
//!
//!   Purge            opportunistic: evict down to the low watermark
//!   FlushPage(a)     mandatory: write one page out if its journal
//!                    coverage is durable
//!   FlushRange(v)    mandatory: write a batch (changeset tail)
//!   Shutdown         drain mandatory messages, skip purges, exit
//! ```
//!
//! Every handled message bumps a progress generation and notifies waiters;
//! `wait_for_progress` is what a saturated fetch blocks on, with a timeout
//! that turns starvation into `limits-reached` instead of a hang.
//!
//! ## Write-Ahead Gate
//!
//! The worker never writes a page whose LSN exceeds the shared durable-LSN
//! watermark. Pages reach the queue only after their changeset was fsynced,
//! so in practice the gate only fires when a flush request races a
//! still-running journal write; the page is simply skipped and the next
//! purge retries it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use eyre::Result;
use parking_lot::{Condvar, Mutex};

use crate::config::constants::WORKER_QUEUE_CAPACITY;
use crate::device::Device;
use crate::journal::changeset::AddressList;

use super::cache::PageCache;
use super::page::{seal_for_write, Page};

#[derive(Debug)]
pub enum WorkerMessage {
    Purge,
    FlushPage(u64),
    FlushRange(AddressList),
    Shutdown,
}

impl WorkerMessage {
    fn is_mandatory(&self) -> bool {
        matches!(
            self,
            WorkerMessage::FlushPage(_) | WorkerMessage::FlushRange(_)
        )
    }
}

struct QueueInner {
    ring: VecDeque<WorkerMessage>,
    shutting_down: bool,
}

struct Queue {
    inner: Mutex<QueueInner>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl Queue {
    fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                ring: VecDeque::with_capacity(WORKER_QUEUE_CAPACITY),
                shutting_down: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    fn post(&self, msg: WorkerMessage) {
        let mut inner = self.inner.lock();
        while inner.ring.len() >= WORKER_QUEUE_CAPACITY && !inner.shutting_down {
            self.not_full.wait(&mut inner);
        }
        if inner.shutting_down && !msg.is_mandatory() {
            return;
        }
        if matches!(msg, WorkerMessage::Shutdown) {
            inner.shutting_down = true;
        }
        inner.ring.push_back(msg);
        self.not_empty.notify_one();
    }

    /// Posts only if there is room; purge requests are best-effort.
    fn try_post(&self, msg: WorkerMessage) -> bool {
        let mut inner = self.inner.lock();
        if inner.ring.len() >= WORKER_QUEUE_CAPACITY || inner.shutting_down {
            return false;
        }
        inner.ring.push_back(msg);
        self.not_empty.notify_one();
        true
    }

    fn take(&self) -> WorkerMessage {
        let mut inner = self.inner.lock();
        loop {
            if let Some(msg) = inner.ring.pop_front() {
                self.not_full.notify_one();
                return msg;
            }
            self.not_empty.wait(&mut inner);
        }
    }
}

/// Writes one page image to the device, sealing the checksum. The buffer
/// lock is held for the duration so a concurrent mutation cannot tear the
/// image.
pub(crate) fn write_page_out(device: &dyn Device, page: &Page) -> Result<()> {
    let mut guard = page.buffer();
    seal_for_write(&mut guard)?;
    device.write_page(page.address(), &guard)?;
    page.clear_dirty();
    Ok(())
}

/// Worker-side variant: never blocks on a page lock held by an in-flight
/// operation. Returns false when the page was busy and stays dirty.
fn try_write_page_out(device: &dyn Device, page: &Page) -> Result<bool> {
    let Some(mut guard) = page.try_buffer() else {
        return Ok(false);
    };
    seal_for_write(&mut guard)?;
    device.write_page(page.address(), &guard)?;
    page.clear_dirty();
    Ok(true)
}

struct WorkerShared {
    queue: Queue,
    progress: Mutex<u64>,
    progress_cv: Condvar,
}

pub struct WorkerHandle {
    shared: Arc<WorkerShared>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(
        cache: Arc<PageCache>,
        device: Arc<dyn Device>,
        durable_lsn: Arc<AtomicU64>,
    ) -> Self {
        let shared = Arc::new(WorkerShared {
            queue: Queue::new(),
            progress: Mutex::new(0),
            progress_cv: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name("settdb-flusher".into())
            .spawn(move || {
                worker_loop(&thread_shared, &cache, &*device, &durable_lsn);
            })
            .expect("failed to spawn background worker thread");

        Self {
            shared,
            thread: Some(thread),
        }
    }

    pub fn post(&self, msg: WorkerMessage) {
        self.shared.queue.post(msg);
    }

    pub fn post_purge(&self) -> bool {
        self.shared.queue.try_post(WorkerMessage::Purge)
    }

    /// Current progress generation; pass it to [`wait_for_progress`].
    ///
    /// [`wait_for_progress`]: WorkerHandle::wait_for_progress
    pub fn progress_generation(&self) -> u64 {
        *self.shared.progress.lock()
    }

    /// Blocks until the worker finishes any message after `seen`, or the
    /// timeout elapses. Returns false on timeout.
    pub fn wait_for_progress(&self, seen: u64, timeout: Duration) -> bool {
        let mut progress = self.shared.progress.lock();
        if *progress > seen {
            return true;
        }
        !self
            .shared
            .progress_cv
            .wait_for(&mut progress, timeout)
            .timed_out()
    }

    /// Stops the worker: mandatory flushes drain, purges are skipped.
    pub fn shutdown(&mut self) {
        self.shared.queue.post(WorkerMessage::Shutdown);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shutdown();
        }
    }
}

fn bump_progress(shared: &WorkerShared) {
    let mut progress = shared.progress.lock();
    *progress += 1;
    shared.progress_cv.notify_all();
}

fn flush_address(cache: &PageCache, device: &dyn Device, durable: u64, address: u64) {
    let Some(page) = cache.get(address) else {
        return;
    };
    if !page.is_dirty() || page.lsn() > durable {
        return;
    }
    match try_write_page_out(device, &page) {
        Ok(_) => {}
        Err(err) => tracing::warn!(address, %err, "background page flush failed"),
    }
}

fn purge(cache: &PageCache, device: &dyn Device, durable: u64) {
    let target = cache.low_watermark_bytes();
    let mut evicted = 0usize;
    while cache.capacity_bytes() != 0 && cache.resident_bytes() > target {
        let Some(victim) = cache.evict_one(durable) else {
            break;
        };
        if victim.is_dirty() {
            match try_write_page_out(device, &victim) {
                Ok(true) => {}
                Ok(false) => {
                    // lock held by an in-flight operation; put it back and
                    // stop this pass
                    cache.insert(victim);
                    break;
                }
                Err(err) => {
                    tracing::warn!(address = victim.address(), %err,
                        "flush of eviction victim failed, page dropped back into cache");
                    cache.insert(victim);
                    break;
                }
            }
        }
        evicted += 1;
    }
    if evicted > 0 {
        tracing::debug!(evicted, resident = cache.resident_bytes(), "cache purge");
    }
}

fn worker_loop(
    shared: &WorkerShared,
    cache: &PageCache,
    device: &dyn Device,
    durable_lsn: &AtomicU64,
) {
    tracing::debug!("background worker started");
    let mut shutting_down = false;

    loop {
        let msg = shared.queue.take();
        let durable = durable_lsn.load(Ordering::Acquire);

        match msg {
            WorkerMessage::Purge => {
                if !shutting_down {
                    purge(cache, device, durable);
                }
            }
            WorkerMessage::FlushPage(address) => {
                flush_address(cache, device, durable, address);
            }
            WorkerMessage::FlushRange(addresses) => {
                for address in addresses {
                    flush_address(cache, device, durable, address);
                }
            }
            WorkerMessage::Shutdown => {
                shutting_down = true;
            }
        }

        bump_progress(shared);

        if shutting_down {
            // drain whatever is already queued; mandatory messages are
            // honored, opportunistic ones dropped
            let mut inner = shared.queue.inner.lock();
            let remaining: Vec<_> = inner.ring.drain(..).collect();
            drop(inner);

            for msg in remaining {
                match msg {
                    WorkerMessage::FlushPage(address) => {
                        flush_address(cache, device, durable, address)
                    }
                    WorkerMessage::FlushRange(addresses) => {
                        for address in addresses {
                            flush_address(cache, device, durable, address);
                        }
                    }
                    _ => {}
                }
            }
            bump_progress(shared);
            break;
        }
    }
    tracing::debug!("background worker stopped");
}
