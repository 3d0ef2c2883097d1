//! # File-Wide Freelist
//!
//! Tracks free regions of the environment file as an ordered map of byte
//! runs `address -> length`. Freed pages coalesce with adjacent runs, so a
//! dropped btree shows up as a handful of large runs rather than thousands
//! of single-page entries; multi-page blob allocations carve contiguous
//! space out of a single run.
//!
//! ## Persistence
//!
//! The freelist is persisted as the pager-state blob referenced from the
//! environment header: a flat array of `(address u64, length u64)`
//! little-endian pairs, sorted by address. It is rewritten at checkpoint and
//! close; on open it is deserialized back. A crash between checkpoints only
//! leaks free space until the next recovery, never corrupts it, because the
//! journal replays the allocation that mattered.
//!
//! ## Tail Truncation
//!
//! On close, a run that touches the end of the file is cut off and the file
//! is truncated, giving the space back to the filesystem.

use std::collections::BTreeMap;

use eyre::{ensure, Result};

#[derive(Debug, Default)]
pub struct Freelist {
    /// address -> run length in bytes
    runs: BTreeMap<u64, u64>,
}

impl Freelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes one `bytes`-sized region from the first run large enough.
    pub fn allocate(&mut self, bytes: u64) -> Option<u64> {
        let (&address, &len) = self.runs.iter().find(|(_, &len)| len >= bytes)?;
        self.runs.remove(&address);
        if len > bytes {
            self.runs.insert(address + bytes, len - bytes);
        }
        Some(address)
    }

    /// Returns a region to the freelist, coalescing with both neighbors.
    pub fn free(&mut self, address: u64, bytes: u64) {
        debug_assert!(bytes > 0);

        let mut start = address;
        let mut len = bytes;

        // neighbor to the left ends exactly at `address`
        if let Some((&prev_addr, &prev_len)) = self.runs.range(..address).next_back() {
            debug_assert!(
                prev_addr + prev_len <= address,
                "freed region {:#x}+{} overlaps existing run {:#x}+{}",
                address,
                bytes,
                prev_addr,
                prev_len
            );
            if prev_addr + prev_len == address {
                self.runs.remove(&prev_addr);
                start = prev_addr;
                len += prev_len;
            }
        }

        // neighbor to the right starts exactly at the end
        let end = address + bytes;
        if let Some(&next_len) = self.runs.get(&end) {
            self.runs.remove(&end);
            len += next_len;
        }

        self.runs.insert(start, len);
    }

    /// Cuts off a run touching the file tail. Returns the new file length if
    /// anything was cut.
    pub fn truncate_tail(&mut self, file_len: u64) -> Option<u64> {
        let (&address, &len) = self.runs.iter().next_back()?;
        if address + len == file_len {
            self.runs.remove(&address);
            Some(address)
        } else {
            None
        }
    }

    pub fn total_free_bytes(&self) -> u64 {
        self.runs.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.runs.len() * 16);
        for (&address, &len) in &self.runs {
            out.extend_from_slice(&address.to_le_bytes());
            out.extend_from_slice(&len.to_le_bytes());
        }
        out
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() % 16 == 0,
            "pager state blob length {} is not a multiple of 16",
            data.len()
        );
        let mut runs = BTreeMap::new();
        for pair in data.chunks_exact(16) {
            let address = u64::from_le_bytes(pair[0..8].try_into().unwrap());
            let len = u64::from_le_bytes(pair[8..16].try_into().unwrap());
            ensure!(len > 0, "pager state blob contains an empty run at {address:#x}");
            runs.insert(address, len);
        }
        Ok(Self { runs })
    }
}
