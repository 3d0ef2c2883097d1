//! # B-tree Node Proxy
//!
//! Semantic operations over one page's slotted layout: key search and
//! insertion, record encoding, duplicate sets, extended keys, split and
//! merge. The byte-level index mechanics live in [`layout`]; this module
//! decides what the bytes mean.
//!
//! ## Node Layout on the Page
//!
//! ```text
//! | page header (17) | node leader (33) | upfront index + heap ... |
//! ```
//!
//! The leader carries the slot count, the level (0 = leaf), the sibling
//! links used by cursors, and (for internal nodes) the pointer-down to
//! the leftmost child.
//!
//! ## Heap Entry Shape
//!
//! ```text
//! leaf, variable records:   | key or blob-id | rec area+flag | ... |
//! leaf, extended dup table: | key or blob-id | table blob-id |
//! leaf, fixed records:      | key            | rec | rec | ... |
//! internal:                 | key or blob-id | child address |
//! ```
//!
//! A variable record's 9 bytes are an 8-byte area plus a flags byte:
//! empty, tiny (length in the area's last byte), small (exactly 8 bytes),
//! or, with the flags clear, a blob id. This is what keeps records of 8 bytes or
//! less from ever touching the blob manager.
//!
//! ## Keys
//!
//! Variable-length keys above the page-size threshold live in a blob; the
//! slot keeps the 8-byte id and the extended-key flag. Fixed-size keys are
//! always inline (configuration validation refuses fixed sizes above the
//! threshold).
//!
//! ## Growth and Shrinkage
//!
//! Adding a duplicate grows a heap entry, which relocates it (allocate new
//! region, splice, release old). Removing one shrinks it in place and
//! releases the tail. Either path may trigger one rearrangement. The
//! leader carries a rearrangement counter; a node that keeps compacting
//! without gaining real room reports `requires_split` instead of going
//! quadratic on every insert.

use std::cmp::Ordering;

use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::blob::BlobManager;
use crate::config::constants::{MERGE_LOW_WATERMARK, NODE_LEADER_SIZE, PAGE_HEADER_SIZE};
use crate::error::{typed, StoreError};
use crate::storage::{parse_zerocopy, parse_zerocopy_mut, PageManager};

use super::layout::{
    IndexRef, IndexView, Slot, SLOT_FLAG_EXTENDED_DUPS, SLOT_FLAG_EXTENDED_KEY,
    SLOT_FLAG_INITIALIZED,
};
use super::{compare_keys, NodeConfig, RecordMode};

/// Record flags byte (variable-record layouts).
pub const REC_FLAG_EMPTY: u8 = 0x01;
pub const REC_FLAG_TINY: u8 = 0x02;
pub const REC_FLAG_SMALL: u8 = 0x04;

/// Width of the record area preceding the flags byte.
const REC_AREA: usize = 8;

/// After this many compactions a node that still cannot serve from the
/// heap tail or freelist is split rather than rearranged again.
const REARRANGE_LIMIT: u32 = 16;

/// Where a new duplicate lands relative to the existing set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupePosition {
    /// Replace the record at the given index.
    Overwrite,
    First,
    Last,
    Before,
    After,
}

/// The node leader following the page header on every btree page.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeLeader {
    flags: U32,
    count: U32,
    ptr_down: U64,
    left: U64,
    right: U64,
    level: u8,
}

impl NodeLeader {
    zerocopy_accessors! {
        flags: u32,
        count: u32,
        ptr_down: u64,
        left: u64,
        right: u64,
    }

    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn set_level(&mut self, level: u8) {
        self.level = level;
    }
}

/// Blob access handed into every operation that may touch extended keys,
/// blob records, or duplicate tables.
#[derive(Clone, Copy)]
pub struct NodeContext<'a> {
    pub pager: &'a PageManager,
    pub blobs: &'a BlobManager,
}

/// Mutable proxy over one btree page.
pub struct NodeProxy<'a> {
    buffer: &'a mut [u8],
    config: NodeConfig,
}

const DATA: usize = PAGE_HEADER_SIZE + NODE_LEADER_SIZE;

impl<'a> NodeProxy<'a> {
    pub fn from_page(buffer: &'a mut [u8], config: NodeConfig) -> Result<Self> {
        ensure!(
            buffer.len() == config.page_size as usize,
            "page buffer size {} does not match configured page size {}",
            buffer.len(),
            config.page_size
        );
        Ok(Self { buffer, config })
    }

    /// Formats a fresh node at the given level (0 = leaf).
    pub fn init(buffer: &'a mut [u8], config: NodeConfig, level: u8) -> Result<Self> {
        let mut node = Self::from_page(buffer, config)?;
        {
            let leader = node.leader_mut()?;
            leader.set_flags(0);
            leader.set_count(0);
            leader.set_ptr_down(0);
            leader.set_left(0);
            leader.set_right(0);
            leader.set_level(level);
        }
        let capacity = node.config.default_capacity();
        node.index().format(capacity);
        Ok(node)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    fn leader(&self) -> Result<&NodeLeader> {
        parse_zerocopy(&self.buffer[PAGE_HEADER_SIZE..], "NodeLeader")
    }

    fn leader_mut(&mut self) -> Result<&mut NodeLeader> {
        parse_zerocopy_mut(&mut self.buffer[PAGE_HEADER_SIZE..], "NodeLeader")
    }

    fn index(&mut self) -> IndexView<'_> {
        IndexView::new(
            &mut self.buffer[DATA..],
            self.config.slot_stride(),
            self.config.duplicates,
        )
    }

    fn index_ref(&self) -> IndexRef<'_> {
        IndexRef::new(
            &self.buffer[DATA..],
            self.config.slot_stride(),
            self.config.duplicates,
        )
    }

    pub fn count(&self) -> u32 {
        self.leader().map(|l| l.count()).unwrap_or(0)
    }

    /// Index slots this node can hold (fixed at initialization).
    pub fn capacity(&self) -> u32 {
        self.index_ref().capacity()
    }

    pub fn level(&self) -> u8 {
        self.leader().map(|l| l.level()).unwrap_or(0)
    }

    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    pub fn left_sibling(&self) -> u64 {
        self.leader().map(|l| l.left()).unwrap_or(0)
    }

    pub fn right_sibling(&self) -> u64 {
        self.leader().map(|l| l.right()).unwrap_or(0)
    }

    pub fn set_left_sibling(&mut self, address: u64) -> Result<()> {
        self.leader_mut()?.set_left(address);
        Ok(())
    }

    pub fn set_right_sibling(&mut self, address: u64) -> Result<()> {
        self.leader_mut()?.set_right(address);
        Ok(())
    }

    pub fn ptr_down(&self) -> u64 {
        self.leader().map(|l| l.ptr_down()).unwrap_or(0)
    }

    pub fn set_ptr_down(&mut self, address: u64) -> Result<()> {
        self.leader_mut()?.set_ptr_down(address);
        Ok(())
    }

    fn set_count(&mut self, count: u32) -> Result<()> {
        self.leader_mut()?.set_count(count);
        Ok(())
    }

    // ------------------------------------------------------------------
    // entry geometry
    // ------------------------------------------------------------------

    fn entry_size_for(config: &NodeConfig, slot: &Slot) -> usize {
        if slot.flags & SLOT_FLAG_INITIALIZED == 0 {
            // freed entry: the key_size field holds the region length
            return slot.key_size as usize;
        }
        let key_part = match config.fixed_key_size {
            Some(fixed) => fixed as usize,
            None if slot.is_extended_key() => 8,
            None => slot.key_size as usize,
        };
        let record_part = if slot.has_extended_dups() {
            8
        } else {
            let dups = if config.duplicates {
                slot.dup_count.max(1) as usize
            } else {
                1
            };
            dups * config.record.width()
        };
        key_part + record_part
    }

    fn entry_size(&self, slot: &Slot) -> usize {
        Self::entry_size_for(&self.config, slot)
    }

    fn entry_size_fn(&self) -> impl Fn(&Slot) -> usize {
        let config = self.config;
        move |slot| Self::entry_size_for(&config, slot)
    }

    fn key_part(&self, slot: &Slot) -> usize {
        match self.config.fixed_key_size {
            Some(fixed) => fixed as usize,
            None if slot.is_extended_key() => 8,
            None => slot.key_size as usize,
        }
    }

    fn slot(&self, pos: usize) -> Result<Slot> {
        ensure!(
            pos < self.count() as usize,
            "slot {pos} out of bounds (count {})",
            self.count()
        );
        Ok(self.index_ref().read_slot(pos))
    }

    // ------------------------------------------------------------------
    // keys
    // ------------------------------------------------------------------

    /// The key bytes as stored in the heap: inline bytes, or an 8-byte
    /// blob id for extended keys.
    fn stored_key_bytes(&self, slot: &Slot) -> Vec<u8> {
        let len = self.key_part(slot);
        self.index_ref().region(slot.offset, len).to_vec()
    }

    /// The full user key of a slot.
    pub fn key(&self, pos: usize, ctx: NodeContext<'_>) -> Result<Vec<u8>> {
        let slot = self.slot(pos)?;
        if slot.is_extended_key() {
            let id = u64::from_le_bytes(
                self.index_ref().region(slot.offset, 8).try_into().unwrap(),
            );
            ctx.blobs.read(ctx.pager, id)
        } else {
            Ok(self.stored_key_bytes(&slot))
        }
    }

    fn compare_at(&self, pos: usize, search: &[u8], ctx: NodeContext<'_>) -> Result<Ordering> {
        let slot = self.slot(pos)?;
        if slot.is_extended_key() {
            let stored = self.key(pos, ctx)?;
            Ok(compare_keys(self.config.key_type, &stored, search))
        } else {
            let len = self.key_part(&slot);
            let stored = self.index_ref().region(slot.offset, len);
            Ok(compare_keys(self.config.key_type, stored, search))
        }
    }

    /// Binary search. Returns the insertion position and the slot index on
    /// an exact hit.
    pub fn search(&self, key: &[u8], ctx: NodeContext<'_>) -> Result<(usize, Option<usize>)> {
        let mut lo = 0usize;
        let mut hi = self.count() as usize;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.compare_at(mid, key, ctx)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok((mid, Some(mid))),
            }
        }
        Ok((lo, None))
    }

    /// Exact-match search.
    pub fn find_exact(&self, key: &[u8], ctx: NodeContext<'_>) -> Result<Option<usize>> {
        Ok(self.search(key, ctx)?.1)
    }

    // ------------------------------------------------------------------
    // space management
    // ------------------------------------------------------------------

    fn rearrange_count(&self) -> u32 {
        self.leader().map(|l| l.flags()).unwrap_or(0)
    }

    fn bump_rearrange_count(&mut self) -> Result<()> {
        let leader = self.leader_mut()?;
        let count = leader.flags().saturating_add(1);
        leader.set_flags(count);
        Ok(())
    }

    fn allocate_entry(&mut self, needed: usize, used: usize) -> Result<u16> {
        let esize = self.entry_size_fn();
        {
            let mut index = self.index();
            if let Some(offset) = index.allocate_region(needed, used) {
                return Ok(offset);
            }
        }
        self.bump_rearrange_count()?;
        let mut index = self.index();
        index.rearrange(used, &esize)?;
        index.allocate_region(needed, used).ok_or_else(|| {
            eyre::eyre!("node heap exhausted even after rearrangement (needed {needed})")
        })
    }

    fn release_entry(&mut self, offset: u16, size: u16, used: usize) -> Result<()> {
        let esize = self.entry_size_fn();
        self.index().release_region(offset, size, used, &esize)
    }

    /// True when inserting `key` cannot succeed even after compaction,
    /// or when serving it would need yet another compaction on a node
    /// that has already rearranged itself past the churn limit.
    pub fn requires_split(&self, key: &[u8]) -> bool {
        let count = self.count() as usize;
        let index = self.index_ref();
        if count >= index.capacity() as usize {
            return true;
        }
        let esize = self.entry_size_fn();
        let live = index.live_heap_bytes(count, &esize);
        let needed = self.config.key_part_size(key.len()) + self.config.record.width();
        if live + needed > index.heap_len() {
            return true;
        }

        // room exists in principle; if claiming it means rearranging yet
        // again on a churning node, split instead
        let tail_fits = index.next_offset() as usize + needed <= index.heap_len();
        if tail_fits {
            return false;
        }
        let fc = index.freelist_count() as usize;
        let freelist_fits =
            (0..fc).any(|i| index.read_slot(count + i).key_size as usize >= needed);
        !freelist_fits && self.rearrange_count() >= REARRANGE_LIMIT
    }

    /// True when the heap cannot grow any entry by `extra` bytes even
    /// after compaction.
    pub fn lacks_room_for(&self, extra: usize) -> bool {
        let count = self.count() as usize;
        let index = self.index_ref();
        let esize = self.entry_size_fn();
        index.live_heap_bytes(count, &esize) + extra > index.heap_len()
    }

    /// Merge candidate per the erase path's low watermark.
    pub fn requires_merge(&self) -> bool {
        self.count() <= MERGE_LOW_WATERMARK
    }

    // ------------------------------------------------------------------
    // insert / erase
    // ------------------------------------------------------------------

    /// Inserts a new key at slot `pos` with an empty-initialized record;
    /// the caller follows up with [`set_record`].
    ///
    /// [`set_record`]: NodeProxy::set_record
    pub fn insert(&mut self, pos: usize, key: &[u8], ctx: NodeContext<'_>) -> Result<()> {
        self.config.check_key(key)?;
        let count = self.count() as usize;
        ensure!(pos <= count, "insert position {pos} out of bounds");
        ensure!(
            !self.requires_split(key),
            "insert into a node that requires a split"
        );

        // clearing the freelist is the cheapest way to guarantee index room
        if !self.index_ref().index_has_room(count) {
            let esize = self.entry_size_fn();
            self.index().rearrange(count, &esize)?;
        }

        let extended = self.config.fixed_key_size.is_none()
            && key.len() > self.config.extended_key_threshold();
        let key_part = self.config.key_part_size(key.len());
        let needed = key_part + self.config.record.width();

        let offset = self.allocate_entry(needed, count)?;

        // key bytes (or blob id) first
        if extended {
            let id = ctx.blobs.allocate(ctx.pager, key)?;
            self.index()
                .region_mut(offset, 8)
                .copy_from_slice(&id.to_le_bytes());
        } else if !key.is_empty() {
            self.index()
                .region_mut(offset, key.len())
                .copy_from_slice(key);
        }

        // empty-initialized record
        let rec_start = offset + key_part as u16;
        let width = self.config.record.width();
        self.index().region_mut(rec_start, width).fill(0);
        if self.config.record == RecordMode::Default {
            self.index().region_mut(rec_start, width)[REC_AREA] = REC_FLAG_EMPTY;
        }

        let mut flags = SLOT_FLAG_INITIALIZED;
        if extended {
            flags |= SLOT_FLAG_EXTENDED_KEY;
        }
        let slot = Slot {
            flags,
            key_size: if extended { 8 } else { key.len() as u16 },
            offset,
            dup_count: 1,
        };
        self.index().insert_slot_at(pos, slot, count);
        self.set_count(count as u32 + 1)?;
        Ok(())
    }

    /// Erases the whole entry at `pos`: key blob, record blobs, duplicate
    /// table, then the slot itself.
    pub fn erase_entry(&mut self, pos: usize, ctx: NodeContext<'_>) -> Result<()> {
        let slot = self.slot(pos)?;
        let count = self.count() as usize;

        // out-of-line storage first
        if slot.is_extended_key() {
            let id = u64::from_le_bytes(
                self.index_ref().region(slot.offset, 8).try_into().unwrap(),
            );
            ctx.blobs.erase(ctx.pager, id)?;
        }
        self.free_all_records(&slot, ctx)?;

        let size = self.entry_size(&slot) as u16;
        let offset = slot.offset;
        self.index().remove_slot_at(pos, count);
        self.set_count(count as u32 - 1)?;
        self.release_entry(offset, size, count - 1)?;
        Ok(())
    }

    fn free_all_records(&self, slot: &Slot, ctx: NodeContext<'_>) -> Result<()> {
        if slot.has_extended_dups() {
            let table_id = self.table_id(slot);
            if self.config.record == RecordMode::Default {
                let table = DupTable::load(ctx, table_id, self.config.record.width())?;
                for i in 0..table.count() {
                    let (area, flags) = table.entry(i);
                    free_record_blob(&area, flags, ctx)?;
                }
            }
            ctx.blobs.erase(ctx.pager, table_id)?;
            return Ok(());
        }
        if self.config.record == RecordMode::Default {
            let dups = if self.config.duplicates {
                slot.dup_count as usize
            } else {
                1
            };
            for i in 0..dups {
                let (area, flags) = self.inline_record(slot, i);
                free_record_blob(&area, flags, ctx)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // records
    // ------------------------------------------------------------------

    fn record_region_offset(&self, slot: &Slot) -> u16 {
        slot.offset + self.key_part(slot) as u16
    }

    fn inline_record(&self, slot: &Slot, dup_index: usize) -> ([u8; REC_AREA], u8) {
        debug_assert!(self.config.record == RecordMode::Default);
        let width = self.config.record.width();
        let start = self.record_region_offset(slot) + (dup_index * width) as u16;
        let bytes = self.index_ref().region(start, width).to_vec();
        let mut area = [0u8; REC_AREA];
        area.copy_from_slice(&bytes[..REC_AREA]);
        (area, bytes[REC_AREA])
    }

    fn table_id(&self, slot: &Slot) -> u64 {
        let start = self.record_region_offset(slot);
        u64::from_le_bytes(self.index_ref().region(start, 8).try_into().unwrap())
    }

    fn set_table_id(&mut self, slot: &Slot, id: u64) {
        let start = self.record_region_offset(slot);
        self.index()
            .region_mut(start, 8)
            .copy_from_slice(&id.to_le_bytes());
    }

    /// Number of records (duplicates) stored under the key at `pos`.
    pub fn record_count(&self, pos: usize, ctx: NodeContext<'_>) -> Result<u32> {
        let slot = self.slot(pos)?;
        if slot.has_extended_dups() {
            let table = DupTable::load(ctx, self.table_id(&slot), self.config.record.width())?;
            Ok(table.count() as u32)
        } else if self.config.duplicates {
            Ok(slot.dup_count as u32)
        } else {
            Ok(1)
        }
    }

    /// The record at `(pos, dup_index)`.
    pub fn record(&self, pos: usize, dup_index: u32, ctx: NodeContext<'_>) -> Result<Vec<u8>> {
        let slot = self.slot(pos)?;
        let total = self.record_count(pos, ctx)?;
        if dup_index >= total {
            return Err(typed(
                StoreError::KeyNotFound,
                format!("duplicate index {dup_index} out of range (count {total})")
            ));
        }

        match self.config.record {
            RecordMode::Inline { width } => {
                if slot.has_extended_dups() {
                    let table =
                        DupTable::load(ctx, self.table_id(&slot), width as usize)?;
                    Ok(table.entry_raw(dup_index as usize).to_vec())
                } else {
                    let start = self.record_region_offset(&slot)
                        + (dup_index as usize * width as usize) as u16;
                    Ok(self.index_ref().region(start, width as usize).to_vec())
                }
            }
            RecordMode::ChildId => {
                let start = self.record_region_offset(&slot);
                Ok(self.index_ref().region(start, 8).to_vec())
            }
            RecordMode::Default => {
                let (area, flags) = if slot.has_extended_dups() {
                    let table = DupTable::load(
                        ctx,
                        self.table_id(&slot),
                        self.config.record.width(),
                    )?;
                    table.entry(dup_index as usize)
                } else {
                    self.inline_record(&slot, dup_index as usize)
                };
                decode_record(&area, flags, ctx)
            }
        }
    }

    /// The record's size without copying blob payloads.
    pub fn record_size(&self, pos: usize, dup_index: u32, ctx: NodeContext<'_>) -> Result<u64> {
        let slot = self.slot(pos)?;
        match self.config.record {
            RecordMode::Inline { width } => Ok(width as u64),
            RecordMode::ChildId => Ok(8),
            RecordMode::Default => {
                let total = self.record_count(pos, ctx)?;
                if dup_index >= total {
                    return Err(typed(
                        StoreError::KeyNotFound,
                        format!("duplicate index {dup_index} out of range (count {total})")
                    ));
                }
                let (area, flags) = if slot.has_extended_dups() {
                    let table = DupTable::load(
                        ctx,
                        self.table_id(&slot),
                        self.config.record.width(),
                    )?;
                    table.entry(dup_index as usize)
                } else {
                    self.inline_record(&slot, dup_index as usize)
                };
                if flags & REC_FLAG_EMPTY != 0 {
                    Ok(0)
                } else if flags & REC_FLAG_TINY != 0 {
                    Ok(area[REC_AREA - 1] as u64)
                } else if flags & REC_FLAG_SMALL != 0 {
                    Ok(REC_AREA as u64)
                } else {
                    let id = u64::from_le_bytes(area);
                    ctx.blobs.size(ctx.pager, id)
                }
            }
        }
    }

    /// Writes a record: overwrite in place, or grow the duplicate set at
    /// the requested position. Returns the duplicate index the record
    /// landed at.
    pub fn set_record(
        &mut self,
        pos: usize,
        record: &[u8],
        dup_index: u32,
        position: DupePosition,
        ctx: NodeContext<'_>,
    ) -> Result<u32> {
        self.config.check_record(record)?;
        let slot = self.slot(pos)?;

        match self.config.record {
            RecordMode::ChildId => {
                ensure!(record.len() == 8, "child record must be 8 bytes");
                ensure!(
                    position == DupePosition::Overwrite,
                    "internal nodes have no duplicates"
                );
                let start = self.record_region_offset(&slot);
                self.index().region_mut(start, 8).copy_from_slice(record);
                Ok(0)
            }
            RecordMode::Inline { width } => {
                self.set_record_inline_fixed(pos, slot, record, dup_index, position, width, ctx)
            }
            RecordMode::Default => {
                if slot.has_extended_dups() {
                    self.set_record_in_table(pos, slot, record, dup_index, position, ctx)
                } else {
                    self.set_record_default(pos, slot, record, dup_index, position, ctx)
                }
            }
        }
    }

    fn set_record_inline_fixed(
        &mut self,
        pos: usize,
        slot: Slot,
        record: &[u8],
        dup_index: u32,
        position: DupePosition,
        width: u16,
        ctx: NodeContext<'_>,
    ) -> Result<u32> {
        let width = width as usize;

        if slot.has_extended_dups() {
            let table_id = self.table_id(&slot);
            let mut table = DupTable::load(ctx, table_id, width)?;
            let landed = if position == DupePosition::Overwrite {
                ensure!(
                    (dup_index as usize) < table.count(),
                    "overwrite of duplicate {dup_index} beyond table count {}",
                    table.count()
                );
                table.set_raw(dup_index as usize, record);
                dup_index as usize
            } else {
                let at = resolve_dup_insert(position, dup_index, table.count());
                table.insert_raw(at, record);
                at
            };
            let new_id = ctx.blobs.overwrite(ctx.pager, table_id, &table.serialize())?;
            if new_id != table_id {
                self.set_table_id(&slot, new_id);
            }
            return Ok(landed as u32);
        }

        if position == DupePosition::Overwrite {
            let dups = if self.config.duplicates {
                slot.dup_count as usize
            } else {
                1
            };
            ensure!(
                (dup_index as usize) < dups,
                "overwrite of duplicate {dup_index} beyond count {dups}"
            );
            let start = self.record_region_offset(&slot) + (dup_index as usize * width) as u16;
            self.index()
                .region_mut(start, width)
                .copy_from_slice(record);
            return Ok(dup_index);
        }

        ensure!(self.config.duplicates, "duplicates are disabled");
        let dups = slot.dup_count as usize;
        let insert_at = resolve_dup_insert(position, dup_index, dups);

        if dups + 1 > self.config.duplicate_threshold() {
            let mut table = DupTable::with_capacity((dups + 1) * 2, width);
            for i in 0..dups {
                let start = self.record_region_offset(&slot) + (i * width) as u16;
                let bytes = self.index_ref().region(start, width).to_vec();
                table.push_raw(&bytes);
            }
            table.insert_raw(insert_at, record);
            let id = ctx.blobs.allocate(ctx.pager, &table.serialize())?;
            self.shrink_to_table(pos, slot, id)?;
            return Ok(insert_at as u32);
        }

        self.grow_inline_dup(pos, slot, insert_at, &record[..width])?;
        Ok(insert_at as u32)
    }

    /// Rewrites the entry's record region as an 8-byte table id and
    /// releases the shrunk tail.
    fn shrink_to_table(&mut self, pos: usize, slot: Slot, table_id: u64) -> Result<()> {
        let count = self.count() as usize;
        let key_part = self.key_part(&slot);
        let old_size = self.entry_size(&slot);
        let new_size = key_part + 8;

        let mut updated = slot;
        updated.flags |= SLOT_FLAG_EXTENDED_DUPS;
        updated.dup_count = 0;
        self.index().write_slot(pos, updated);
        self.set_table_id(&updated, table_id);

        if old_size > new_size {
            self.release_entry(
                slot.offset + new_size as u16,
                (old_size - new_size) as u16,
                count,
            )?;
        }
        tracing::debug!("duplicate set migrated to extended table");
        Ok(())
    }

    fn set_record_default(
        &mut self,
        pos: usize,
        slot: Slot,
        record: &[u8],
        dup_index: u32,
        position: DupePosition,
        ctx: NodeContext<'_>,
    ) -> Result<u32> {
        let width = self.config.record.width();

        if position == DupePosition::Overwrite {
            let dups = if self.config.duplicates {
                slot.dup_count as usize
            } else {
                1
            };
            ensure!(
                (dup_index as usize) < dups,
                "overwrite of duplicate {dup_index} beyond count {dups}"
            );
            let (old_area, old_flags) = self.inline_record(&slot, dup_index as usize);
            free_record_blob(&old_area, old_flags, ctx)?;

            let (area, flags) = encode_record(record, ctx)?;
            let start = self.record_region_offset(&slot) + (dup_index as usize * width) as u16;
            let mut index = self.index();
            let region = index.region_mut(start, width);
            region[..REC_AREA].copy_from_slice(&area);
            region[REC_AREA] = flags;
            return Ok(dup_index);
        }

        ensure!(self.config.duplicates, "duplicates are disabled");
        let dups = slot.dup_count as usize;
        let insert_at = resolve_dup_insert(position, dup_index, dups);

        if dups + 1 > self.config.duplicate_threshold() {
            // migrate the whole set to an extended duplicate table
            self.migrate_to_table(pos, slot, record, insert_at, ctx)?;
            return Ok(insert_at as u32);
        }

        let (area, flags) = encode_record(record, ctx)?;
        let mut encoded = [0u8; REC_AREA + 1];
        encoded[..REC_AREA].copy_from_slice(&area);
        encoded[REC_AREA] = flags;
        self.grow_inline_dup(pos, slot, insert_at, &encoded)?;
        Ok(insert_at as u32)
    }

    /// Relocates the entry with one more record spliced in at `insert_at`.
    fn grow_inline_dup(
        &mut self,
        pos: usize,
        slot: Slot,
        insert_at: usize,
        encoded: &[u8],
    ) -> Result<()> {
        let width = self.config.record.width();
        ensure!(encoded.len() == width, "encoded record width mismatch");
        let count = self.count() as usize;
        let key_part = self.key_part(&slot);
        let old_size = self.entry_size(&slot);
        let new_size = old_size + width;

        ensure!(
            !self.lacks_room_for(width),
            "duplicate insert into a node that requires a split"
        );

        // scratch copy before any rearrangement moves the entry
        let mut scratch = self.index_ref().region(slot.offset, old_size).to_vec();
        let splice_at = key_part + insert_at * width;
        scratch.splice(splice_at..splice_at, encoded.iter().copied());

        let new_offset = self.allocate_entry(new_size, count)?;
        self.index()
            .region_mut(new_offset, new_size)
            .copy_from_slice(&scratch);

        // rearrangement may have moved the old region; re-read it
        let current = self.index_ref().read_slot(pos);
        let old_offset = current.offset;

        let mut updated = current;
        updated.offset = new_offset;
        updated.dup_count = current.dup_count + 1;
        self.index().write_slot(pos, updated);

        self.release_entry(old_offset, old_size as u16, count)?;
        Ok(())
    }

    fn migrate_to_table(
        &mut self,
        pos: usize,
        slot: Slot,
        record: &[u8],
        insert_at: usize,
        ctx: NodeContext<'_>,
    ) -> Result<()> {
        let dups = slot.dup_count as usize;
        let width = self.config.record.width();
        let mut table = DupTable::with_capacity((dups + 1) * 2, width);
        for i in 0..dups {
            let (area, flags) = self.inline_record(&slot, i);
            table.push(area, flags);
        }
        let (area, flags) = encode_record(record, ctx)?;
        table.insert(insert_at, area, flags);

        let id = ctx.blobs.allocate(ctx.pager, &table.serialize())?;
        self.shrink_to_table(pos, slot, id)
    }

    fn set_record_in_table(
        &mut self,
        _pos: usize,
        slot: Slot,
        record: &[u8],
        dup_index: u32,
        position: DupePosition,
        ctx: NodeContext<'_>,
    ) -> Result<u32> {
        let table_id = self.table_id(&slot);
        let mut table = DupTable::load(ctx, table_id, self.config.record.width())?;

        if position == DupePosition::Overwrite {
            ensure!(
                (dup_index as usize) < table.count(),
                "overwrite of duplicate {dup_index} beyond table count {}",
                table.count()
            );
            let (old_area, old_flags) = table.entry(dup_index as usize);
            free_record_blob(&old_area, old_flags, ctx)?;
            let (area, flags) = encode_record(record, ctx)?;
            table.set(dup_index as usize, area, flags);
            let new_id = ctx.blobs.overwrite(ctx.pager, table_id, &table.serialize())?;
            if new_id != table_id {
                self.set_table_id(&slot, new_id);
            }
            return Ok(dup_index);
        }

        let insert_at = resolve_dup_insert(position, dup_index, table.count());
        let (area, flags) = encode_record(record, ctx)?;
        table.insert(insert_at, area, flags);
        let new_id = ctx.blobs.overwrite(ctx.pager, table_id, &table.serialize())?;
        if new_id != table_id {
            self.set_table_id(&slot, new_id);
        }
        Ok(insert_at as u32)
    }

    /// Erases one duplicate from a set of two or more. Returns the number
    /// of records left. Erasing the last record is [`erase_entry`]'s job;
    /// it frees the key alongside.
    ///
    /// [`erase_entry`]: NodeProxy::erase_entry
    pub fn erase_record(
        &mut self,
        pos: usize,
        dup_index: u32,
        ctx: NodeContext<'_>,
    ) -> Result<u32> {
        let slot = self.slot(pos)?;
        let total = self.record_count(pos, ctx)?;
        if dup_index >= total {
            return Err(typed(
                StoreError::KeyNotFound,
                format!("duplicate index {dup_index} out of range (count {total})")
            ));
        }
        ensure!(
            total >= 2,
            "erase_record on the last record; erase_entry owns that case"
        );

        if slot.has_extended_dups() {
            let table_id = self.table_id(&slot);
            let mut table = DupTable::load(ctx, table_id, self.config.record.width())?;
            if self.config.record == RecordMode::Default {
                let (area, flags) = table.entry(dup_index as usize);
                free_record_blob(&area, flags, ctx)?;
            }
            table.remove(dup_index as usize);
            let new_id = ctx.blobs.overwrite(ctx.pager, table_id, &table.serialize())?;
            if new_id != table_id {
                self.set_table_id(&slot, new_id);
            }
            return Ok(table.count() as u32);
        }

        // inline: free a blob record, close the gap, shrink the entry
        let width = self.config.record.width();
        if self.config.record == RecordMode::Default {
            let (area, flags) = self.inline_record(&slot, dup_index as usize);
            free_record_blob(&area, flags, ctx)?;
        }

        let count = self.count() as usize;
        let old_size = self.entry_size(&slot);
        let rec_start = self.record_region_offset(&slot);
        let move_from = rec_start as usize + (dup_index as usize + 1) * width;
        let move_to = rec_start as usize + dup_index as usize * width;
        let tail_len = (total as usize - dup_index as usize - 1) * width;

        {
            let mut index = self.index();
            let heap = index.heap_mut();
            heap.copy_within(move_from..move_from + tail_len, move_to);
        }

        let mut updated = slot;
        updated.dup_count = slot.dup_count - 1;
        self.index().write_slot(pos, updated);

        self.release_entry(
            slot.offset + (old_size - width) as u16,
            width as u16,
            count,
        )?;
        Ok(total - 1)
    }

    // ------------------------------------------------------------------
    // internal-node children
    // ------------------------------------------------------------------

    /// The child address stored at slot `pos`.
    pub fn child(&self, pos: usize) -> Result<u64> {
        ensure!(!self.is_leaf(), "child lookup on a leaf node");
        let slot = self.slot(pos)?;
        let start = self.record_region_offset(&slot);
        Ok(u64::from_le_bytes(
            self.index_ref().region(start, 8).try_into().unwrap(),
        ))
    }

    pub fn set_child(&mut self, pos: usize, address: u64) -> Result<()> {
        ensure!(!self.is_leaf(), "child update on a leaf node");
        let slot = self.slot(pos)?;
        let start = self.record_region_offset(&slot);
        self.index()
            .region_mut(start, 8)
            .copy_from_slice(&address.to_le_bytes());
        Ok(())
    }

    /// Descent step: the slot whose subtree covers `key` (`None` means the
    /// pointer-down), plus the child address.
    pub fn find_child(&self, key: &[u8], ctx: NodeContext<'_>) -> Result<(Option<usize>, u64)> {
        ensure!(!self.is_leaf(), "find_child on a leaf node");
        let (pos, exact) = self.search(key, ctx)?;
        // slot i covers keys in [key(i), key(i+1)): an exact hit descends
        // into slot i, an inexact one into the slot before the insertion
        // point
        let slot = match exact {
            Some(i) => Some(i),
            None if pos == 0 => None,
            None => Some(pos - 1),
        };
        match slot {
            None => Ok((None, self.ptr_down())),
            Some(i) => Ok((Some(i), self.child(i)?)),
        }
    }

    // ------------------------------------------------------------------
    // split / merge
    // ------------------------------------------------------------------

    /// Appends a raw entry (slot metadata plus heap bytes) at the end of
    /// this node. Used by split and merge, where order is preserved by
    /// construction.
    fn append_raw(&mut self, mut slot: Slot, entry: &[u8]) -> Result<()> {
        let count = self.count() as usize;
        ensure!(
            count < self.index_ref().capacity() as usize,
            "append into a full node"
        );
        if !self.index_ref().index_has_room(count) {
            let esize = self.entry_size_fn();
            self.index().rearrange(count, &esize)?;
        }
        let offset = self.allocate_entry(entry.len(), count)?;
        self.index()
            .region_mut(offset, entry.len())
            .copy_from_slice(entry);
        slot.offset = offset;
        self.index().insert_slot_at(count, slot, count);
        self.set_count(count as u32 + 1)?;
        Ok(())
    }

    fn take_entry(&self, pos: usize) -> Result<(Slot, Vec<u8>)> {
        let slot = self.slot(pos)?;
        let size = self.entry_size(&slot);
        Ok((slot, self.index_ref().region(slot.offset, size).to_vec()))
    }

    /// Drops slots `[new_count, count)` from the index, releasing their
    /// heap regions.
    fn truncate_entries(&mut self, new_count: usize) -> Result<()> {
        let count = self.count() as usize;
        ensure!(new_count <= count, "truncate beyond count");

        let mut regions = Vec::with_capacity(count - new_count);
        for pos in new_count..count {
            let slot = self.slot(pos)?;
            regions.push((slot.offset, self.entry_size(&slot) as u16));
        }

        // remove from the back so earlier positions stay valid
        for pos in (new_count..count).rev() {
            let current = self.count() as usize;
            self.index().remove_slot_at(pos, current);
            self.set_count(current as u32 - 1)?;
        }
        for (offset, size) in regions {
            self.release_entry(offset, size, new_count)?;
        }
        Ok(())
    }

    /// Splits a leaf: entries `[pivot, count)` move to the empty node
    /// `other`. Returns the first key of `other` (the separator the caller
    /// promotes).
    pub fn split_leaf(
        &mut self,
        other: &mut NodeProxy<'_>,
        pivot: usize,
        ctx: NodeContext<'_>,
    ) -> Result<Vec<u8>> {
        ensure!(self.is_leaf() && other.is_leaf(), "split_leaf on non-leaves");
        let count = self.count() as usize;
        ensure!(pivot > 0 && pivot < count, "degenerate leaf pivot {pivot}");

        for pos in pivot..count {
            let (slot, entry) = self.take_entry(pos)?;
            other.append_raw(slot, &entry)?;
        }
        self.truncate_entries(pivot)?;
        other.key(0, ctx)
    }

    /// Splits an internal node: the pivot key is promoted (returned), its
    /// child becomes `other`'s pointer-down, and entries `[pivot+1, count)`
    /// move over.
    pub fn split_internal(
        &mut self,
        other: &mut NodeProxy<'_>,
        pivot: usize,
        ctx: NodeContext<'_>,
    ) -> Result<Vec<u8>> {
        ensure!(
            !self.is_leaf() && !other.is_leaf(),
            "split_internal on leaves"
        );
        let count = self.count() as usize;
        ensure!(pivot < count - 1, "degenerate internal pivot {pivot}");

        let promoted = self.key(pivot, ctx)?;
        other.set_ptr_down(self.child(pivot)?)?;

        for pos in pivot + 1..count {
            let (slot, entry) = self.take_entry(pos)?;
            other.append_raw(slot, &entry)?;
        }

        // free the promoted entry's out-of-line key before dropping it
        let pivot_slot = self.slot(pivot)?;
        if pivot_slot.is_extended_key() {
            let id = u64::from_le_bytes(
                self.index_ref().region(pivot_slot.offset, 8).try_into().unwrap(),
            );
            ctx.blobs.erase(ctx.pager, id)?;
        }
        self.truncate_entries(pivot)?;
        Ok(promoted)
    }

    /// Concatenates `other`'s entries onto this node. Every key of `other`
    /// is greater than every key here; the caller has verified room.
    pub fn merge_from(&mut self, other: &mut NodeProxy<'_>, _ctx: NodeContext<'_>) -> Result<()> {
        let other_count = other.count() as usize;
        for pos in 0..other_count {
            let (slot, entry) = other.take_entry(pos)?;
            self.append_raw(slot, &entry)?;
        }
        other.truncate_entries(0)?;
        Ok(())
    }

    /// True when `other`'s live entries would fit behind this node's.
    pub fn can_absorb(&self, other: &NodeProxy<'_>) -> bool {
        let my_count = self.count() as usize;
        let other_count = other.count() as usize;
        let index = self.index_ref();
        if my_count + other_count > index.capacity() as usize {
            return false;
        }
        let mine = index.live_heap_bytes(my_count, &self.entry_size_fn());
        let theirs = other
            .index_ref()
            .live_heap_bytes(other_count, &other.entry_size_fn());
        mine + theirs <= index.heap_len()
    }

    // ------------------------------------------------------------------
    // scan / integrity
    // ------------------------------------------------------------------

    /// Visits every key from `start`, with its record count. `distinct`
    /// reports each key once regardless of duplicates.
    pub fn scan(
        &self,
        ctx: NodeContext<'_>,
        start: usize,
        distinct: bool,
        visitor: &mut dyn FnMut(&[u8], u32),
    ) -> Result<()> {
        for pos in start..self.count() as usize {
            let key = self.key(pos, ctx)?;
            let records = if distinct {
                1
            } else {
                self.record_count(pos, ctx)?
            };
            visitor(&key, records);
        }
        Ok(())
    }

    /// Verifies the node's packing and ordering invariants. A violation is
    /// an `integrity-violated` fault.
    pub fn check_integrity(&self, ctx: NodeContext<'_>) -> Result<()> {
        let count = self.count() as usize;
        let index = self.index_ref();
        let capacity = index.capacity() as usize;
        let fc = index.freelist_count() as usize;

        if count + fc > capacity {
            return Err(typed(
                StoreError::IntegrityViolated,
                format!("index overflow: {count} used + {fc} freed > capacity {capacity}")
            ));
        }

        // collect regions: used entries and freelist entries
        let mut regions: Vec<(u16, usize)> = Vec::with_capacity(count + fc);
        for pos in 0..count {
            let slot = index.read_slot(pos);
            if slot.flags & SLOT_FLAG_INITIALIZED == 0 {
                return Err(typed(
                    StoreError::IntegrityViolated,
                    format!("used slot {pos} is not initialized")
                ));
            }
            regions.push((slot.offset, self.entry_size(&slot)));
        }
        for i in 0..fc {
            let slot = index.read_slot(count + i);
            regions.push((slot.offset, slot.key_size as usize));
        }

        regions.sort_by_key(|&(offset, _)| offset);
        let mut max_end = 0usize;
        let mut prev_end = 0usize;
        for (offset, size) in regions {
            if (offset as usize) < prev_end {
                return Err(typed(
                    StoreError::IntegrityViolated,
                    format!("overlapping heap regions at offset {offset}")
                ));
            }
            prev_end = offset as usize + size;
            max_end = max_end.max(prev_end);
        }
        if max_end != index.next_offset() as usize {
            return Err(typed(
                StoreError::IntegrityViolated,
                format!(
                    "next_offset {} does not equal the heap high-water mark {max_end}",
                    index.next_offset()
                )
            ));
        }

        // strict key ordering
        for pos in 1..count {
            let prev = self.key(pos - 1, ctx)?;
            let this = self.key(pos, ctx)?;
            if compare_keys(self.config.key_type, &prev, &this) != Ordering::Less {
                return Err(typed(
                    StoreError::IntegrityViolated,
                    format!("keys out of order at slot {pos}")
                ));
            }
        }

        if !self.is_leaf() && count > 0 && self.ptr_down() == 0 {
            return Err(typed(
                StoreError::IntegrityViolated,
                "internal node without a pointer-down child"
            ));
        }
        Ok(())
    }
}

fn resolve_dup_insert(position: DupePosition, dup_index: u32, count: usize) -> usize {
    match position {
        DupePosition::Overwrite => dup_index as usize,
        DupePosition::First => 0,
        DupePosition::Last => count,
        DupePosition::Before => (dup_index as usize).min(count),
        DupePosition::After => (dup_index as usize + 1).min(count),
    }
}

/// Encodes a record into the 8-byte area + flags byte.
fn encode_record(record: &[u8], ctx: NodeContext<'_>) -> Result<([u8; REC_AREA], u8)> {
    let mut area = [0u8; REC_AREA];
    match record.len() {
        0 => Ok((area, REC_FLAG_EMPTY)),
        1..=7 => {
            area[..record.len()].copy_from_slice(record);
            area[REC_AREA - 1] = record.len() as u8;
            Ok((area, REC_FLAG_TINY))
        }
        8 => {
            area.copy_from_slice(record);
            Ok((area, REC_FLAG_SMALL))
        }
        _ => {
            let id = ctx.blobs.allocate(ctx.pager, record)?;
            area.copy_from_slice(&id.to_le_bytes());
            Ok((area, 0))
        }
    }
}

fn decode_record(area: &[u8; REC_AREA], flags: u8, ctx: NodeContext<'_>) -> Result<Vec<u8>> {
    if flags & REC_FLAG_EMPTY != 0 {
        Ok(Vec::new())
    } else if flags & REC_FLAG_TINY != 0 {
        let len = area[REC_AREA - 1] as usize;
        ensure!(len < REC_AREA, "tiny record length {len} out of range");
        Ok(area[..len].to_vec())
    } else if flags & REC_FLAG_SMALL != 0 {
        Ok(area.to_vec())
    } else {
        let id = u64::from_le_bytes(*area);
        ctx.blobs.read(ctx.pager, id)
    }
}

fn free_record_blob(area: &[u8; REC_AREA], flags: u8, ctx: NodeContext<'_>) -> Result<()> {
    if flags & (REC_FLAG_EMPTY | REC_FLAG_TINY | REC_FLAG_SMALL) == 0 {
        let id = u64::from_le_bytes(*area);
        ctx.blobs.erase(ctx.pager, id)?;
    }
    Ok(())
}

/// An extended duplicate table: `{count u32, capacity u32, entries...}`
/// stored as a blob. The entry width matches the owning layout's record
/// width: an area-plus-flags pair for variable records, raw bytes for
/// fixed inline records.
struct DupTable {
    count: usize,
    capacity: usize,
    entry_width: usize,
    entries: Vec<u8>,
}

impl DupTable {
    fn with_capacity(capacity: usize, entry_width: usize) -> Self {
        Self {
            count: 0,
            capacity,
            entry_width,
            entries: vec![0u8; capacity * entry_width],
        }
    }

    fn load(ctx: NodeContext<'_>, id: u64, entry_width: usize) -> Result<Self> {
        let bytes = ctx.blobs.read(ctx.pager, id)?;
        ensure!(bytes.len() >= 8, "duplicate table shorter than its header");
        let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let capacity = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
        ensure!(
            bytes.len() >= 8 + capacity * entry_width && count <= capacity,
            "duplicate table header inconsistent: count {count}, capacity {capacity}, {} bytes",
            bytes.len()
        );
        Ok(Self {
            count,
            capacity,
            entry_width,
            entries: bytes[8..8 + capacity * entry_width].to_vec(),
        })
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.entries.len());
        out.extend_from_slice(&(self.count as u32).to_le_bytes());
        out.extend_from_slice(&(self.capacity as u32).to_le_bytes());
        out.extend_from_slice(&self.entries);
        out
    }

    fn count(&self) -> usize {
        self.count
    }

    fn entry_raw(&self, i: usize) -> &[u8] {
        let at = i * self.entry_width;
        &self.entries[at..at + self.entry_width]
    }

    fn set_raw(&mut self, i: usize, bytes: &[u8]) {
        debug_assert_eq!(bytes.len(), self.entry_width);
        let at = i * self.entry_width;
        self.entries[at..at + self.entry_width].copy_from_slice(bytes);
    }

    fn push_raw(&mut self, bytes: &[u8]) {
        self.ensure_room();
        let i = self.count;
        self.count += 1;
        self.set_raw(i, bytes);
    }

    fn insert_raw(&mut self, at: usize, bytes: &[u8]) {
        self.ensure_room();
        let from = at * self.entry_width;
        let to = self.count * self.entry_width;
        self.entries.copy_within(from..to, from + self.entry_width);
        self.count += 1;
        self.set_raw(at, bytes);
    }

    fn remove(&mut self, at: usize) {
        let from = (at + 1) * self.entry_width;
        let to = self.count * self.entry_width;
        self.entries.copy_within(from..to, at * self.entry_width);
        self.count -= 1;
    }

    fn ensure_room(&mut self) {
        if self.count == self.capacity {
            self.capacity = (self.capacity * 2).max(4);
            self.entries.resize(self.capacity * self.entry_width, 0);
        }
    }

    // area + flags convenience for the variable-record layout

    fn entry(&self, i: usize) -> ([u8; REC_AREA], u8) {
        debug_assert_eq!(self.entry_width, REC_AREA + 1);
        let raw = self.entry_raw(i);
        let mut area = [0u8; REC_AREA];
        area.copy_from_slice(&raw[..REC_AREA]);
        (area, raw[REC_AREA])
    }

    fn set(&mut self, i: usize, area: [u8; REC_AREA], flags: u8) {
        let mut raw = [0u8; REC_AREA + 1];
        raw[..REC_AREA].copy_from_slice(&area);
        raw[REC_AREA] = flags;
        self.set_raw(i, &raw);
    }

    fn push(&mut self, area: [u8; REC_AREA], flags: u8) {
        self.ensure_room();
        let i = self.count;
        self.count += 1;
        self.set(i, area, flags);
    }

    fn insert(&mut self, at: usize, area: [u8; REC_AREA], flags: u8) {
        let mut raw = [0u8; REC_AREA + 1];
        raw[..REC_AREA].copy_from_slice(&area);
        raw[REC_AREA] = flags;
        self.insert_raw(at, &raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseOptions;
    use crate::device::{Device, MemoryDevice};
    use crate::storage::PageType;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    const PAGE: u32 = 1024;

    struct Fixture {
        pager: PageManager,
        blobs: BlobManager,
    }

    impl Fixture {
        fn new() -> Self {
            let device: Arc<dyn Device> = Arc::new(MemoryDevice::new());
            device.alloc_page(PAGE).unwrap();
            Self {
                pager: PageManager::new(
                    device,
                    PAGE,
                    0,
                    u64::MAX,
                    false,
                    Arc::new(AtomicU64::new(u64::MAX)),
                ),
                blobs: BlobManager::new(PAGE),
            }
        }

        fn ctx(&self) -> NodeContext<'_> {
            NodeContext {
                pager: &self.pager,
                blobs: &self.blobs,
            }
        }
    }

    fn leaf_config() -> NodeConfig {
        NodeConfig::leaf(&DatabaseOptions::new(), PAGE)
    }

    fn dup_config() -> NodeConfig {
        NodeConfig::leaf(&DatabaseOptions::new().enable_duplicates(), PAGE)
    }

    fn page_buffer() -> Vec<u8> {
        let page = crate::storage::Page::new_zeroed(0, PAGE, PageType::BtreeLeaf);
        let guard = page.buffer();
        guard.to_vec()
    }

    fn insert_with_record(
        node: &mut NodeProxy<'_>,
        key: &[u8],
        record: &[u8],
        ctx: NodeContext<'_>,
    ) {
        let (pos, exact) = node.search(key, ctx).unwrap();
        assert!(exact.is_none(), "key already present");
        node.insert(pos, key, ctx).unwrap();
        node.set_record(pos, record, 0, DupePosition::Overwrite, ctx)
            .unwrap();
    }

    #[test]
    fn node_leader_is_33_bytes() {
        assert_eq!(std::mem::size_of::<NodeLeader>(), NODE_LEADER_SIZE);
    }

    #[test]
    fn init_formats_an_empty_leaf() {
        let fx = Fixture::new();
        let mut buf = page_buffer();
        let node = NodeProxy::init(&mut buf, leaf_config(), 0).unwrap();

        assert_eq!(node.count(), 0);
        assert!(node.is_leaf());
        node.check_integrity(fx.ctx()).unwrap();
    }

    #[test]
    fn insert_keeps_keys_sorted() {
        let fx = Fixture::new();
        let mut buf = page_buffer();
        let mut node = NodeProxy::init(&mut buf, leaf_config(), 0).unwrap();
        let ctx = fx.ctx();

        for key in [b"charlie".as_ref(), b"alpha", b"bravo"] {
            insert_with_record(&mut node, key, b"r", ctx);
        }

        assert_eq!(node.count(), 3);
        assert_eq!(node.key(0, ctx).unwrap(), b"alpha");
        assert_eq!(node.key(1, ctx).unwrap(), b"bravo");
        assert_eq!(node.key(2, ctx).unwrap(), b"charlie");
        node.check_integrity(ctx).unwrap();
    }

    #[test]
    fn search_finds_exact_and_insertion_points() {
        let fx = Fixture::new();
        let mut buf = page_buffer();
        let mut node = NodeProxy::init(&mut buf, leaf_config(), 0).unwrap();
        let ctx = fx.ctx();

        insert_with_record(&mut node, b"bb", b"1", ctx);
        insert_with_record(&mut node, b"dd", b"2", ctx);

        assert_eq!(node.search(b"bb", ctx).unwrap(), (0, Some(0)));
        assert_eq!(node.search(b"aa", ctx).unwrap(), (0, None));
        assert_eq!(node.search(b"cc", ctx).unwrap(), (1, None));
        assert_eq!(node.search(b"zz", ctx).unwrap(), (2, None));
    }

    #[test]
    fn record_encodings_round_trip() {
        let fx = Fixture::new();
        let mut buf = page_buffer();
        let mut node = NodeProxy::init(&mut buf, leaf_config(), 0).unwrap();
        let ctx = fx.ctx();

        let blob_record = vec![0xCD; 200];
        let cases: [(&[u8], &[u8]); 4] = [
            (b"empty", b""),
            (b"tiny", b"abc"),
            (b"small", b"12345678"),
            (b"blob", &blob_record),
        ];
        for (key, record) in cases {
            insert_with_record(&mut node, key, record, ctx);
        }

        for (key, record) in cases {
            let pos = node.find_exact(key, ctx).unwrap().unwrap();
            assert_eq!(node.record(pos, 0, ctx).unwrap(), record, "key {key:?}");
            assert_eq!(
                node.record_size(pos, 0, ctx).unwrap(),
                record.len() as u64
            );
        }
        node.check_integrity(ctx).unwrap();
    }

    #[test]
    fn overwrite_replaces_record_and_frees_blob() {
        let fx = Fixture::new();
        let mut buf = page_buffer();
        let mut node = NodeProxy::init(&mut buf, leaf_config(), 0).unwrap();
        let ctx = fx.ctx();

        insert_with_record(&mut node, b"k", &vec![1u8; 500], ctx);
        let free_before = fx.pager.free_bytes();

        let pos = node.find_exact(b"k", ctx).unwrap().unwrap();
        node.set_record(pos, b"now-small", 0, DupePosition::Overwrite, ctx)
            .unwrap();

        assert_eq!(node.record(pos, 0, ctx).unwrap(), b"now-small");
        // the 500-byte blob page went back to the freelist
        assert!(fx.pager.free_bytes() > free_before);
    }

    #[test]
    fn extended_key_goes_out_of_line() {
        let fx = Fixture::new();
        let mut buf = page_buffer();
        let mut node = NodeProxy::init(&mut buf, leaf_config(), 0).unwrap();
        let ctx = fx.ctx();

        // threshold for 1 KiB pages is 64
        let long_key = vec![b'x'; 200];
        insert_with_record(&mut node, &long_key, b"rec", ctx);
        insert_with_record(&mut node, b"short", b"rec2", ctx);

        let pos = node.find_exact(&long_key, ctx).unwrap().unwrap();
        let slot = node.slot(pos).unwrap();
        assert!(slot.is_extended_key());
        assert_eq!(node.key(pos, ctx).unwrap(), long_key);
        assert_eq!(node.record(pos, 0, ctx).unwrap(), b"rec");
        node.check_integrity(ctx).unwrap();
    }

    #[test]
    fn erase_entry_frees_extended_key_blob() {
        let fx = Fixture::new();
        let mut buf = page_buffer();
        let mut node = NodeProxy::init(&mut buf, leaf_config(), 0).unwrap();
        let ctx = fx.ctx();

        let long_key = vec![b'y'; 300];
        insert_with_record(&mut node, &long_key, b"r", ctx);
        fx.pager.take_changeset().release();
        let free_before = fx.pager.free_bytes();

        let pos = node.find_exact(&long_key, ctx).unwrap().unwrap();
        node.erase_entry(pos, ctx).unwrap();

        assert_eq!(node.count(), 0);
        assert!(fx.pager.free_bytes() > free_before);
        node.check_integrity(ctx).unwrap();
    }

    #[test]
    fn inline_duplicates_preserve_insertion_order() {
        let fx = Fixture::new();
        let mut buf = page_buffer();
        let mut node = NodeProxy::init(&mut buf, dup_config(), 0).unwrap();
        let ctx = fx.ctx();

        let (pos, _) = node.search(b"k", ctx).unwrap();
        node.insert(pos, b"k", ctx).unwrap();
        node.set_record(pos, b"first", 0, DupePosition::Overwrite, ctx)
            .unwrap();
        node.set_record(pos, b"second", 0, DupePosition::Last, ctx)
            .unwrap();
        node.set_record(pos, b"third", 0, DupePosition::Last, ctx)
            .unwrap();

        assert_eq!(node.record_count(pos, ctx).unwrap(), 3);
        assert_eq!(node.record(pos, 0, ctx).unwrap(), b"first");
        assert_eq!(node.record(pos, 1, ctx).unwrap(), b"second");
        assert_eq!(node.record(pos, 2, ctx).unwrap(), b"third");
        node.check_integrity(ctx).unwrap();
    }

    #[test]
    fn duplicate_positioning_flags() {
        let fx = Fixture::new();
        let mut buf = page_buffer();
        let mut node = NodeProxy::init(&mut buf, dup_config(), 0).unwrap();
        let ctx = fx.ctx();

        let (pos, _) = node.search(b"k", ctx).unwrap();
        node.insert(pos, b"k", ctx).unwrap();
        node.set_record(pos, b"b", 0, DupePosition::Overwrite, ctx)
            .unwrap();
        node.set_record(pos, b"a", 0, DupePosition::First, ctx).unwrap();
        node.set_record(pos, b"c", 1, DupePosition::After, ctx).unwrap();

        assert_eq!(node.record(pos, 0, ctx).unwrap(), b"a");
        assert_eq!(node.record(pos, 1, ctx).unwrap(), b"b");
        assert_eq!(node.record(pos, 2, ctx).unwrap(), b"c");
    }

    #[test]
    fn duplicates_migrate_to_extended_table() {
        let fx = Fixture::new();
        let mut buf = page_buffer();
        let mut node = NodeProxy::init(&mut buf, dup_config(), 0).unwrap();
        let ctx = fx.ctx();

        let (pos, _) = node.search(b"k", ctx).unwrap();
        node.insert(pos, b"k", ctx).unwrap();
        node.set_record(pos, b"dup-000", 0, DupePosition::Overwrite, ctx)
            .unwrap();

        // threshold for 1 KiB pages is 8: push past it
        for i in 1..20u32 {
            let record = format!("dup-{i:03}");
            node.set_record(pos, record.as_bytes(), 0, DupePosition::Last, ctx)
                .unwrap();
        }

        let slot = node.slot(pos).unwrap();
        assert!(slot.has_extended_dups());
        assert_eq!(node.record_count(pos, ctx).unwrap(), 20);
        for i in 0..20u32 {
            let expected = format!("dup-{i:03}");
            assert_eq!(node.record(pos, i, ctx).unwrap(), expected.as_bytes());
        }
        node.check_integrity(ctx).unwrap();
    }

    #[test]
    fn erase_record_shrinks_inline_set() {
        let fx = Fixture::new();
        let mut buf = page_buffer();
        let mut node = NodeProxy::init(&mut buf, dup_config(), 0).unwrap();
        let ctx = fx.ctx();

        let (pos, _) = node.search(b"k", ctx).unwrap();
        node.insert(pos, b"k", ctx).unwrap();
        node.set_record(pos, b"one", 0, DupePosition::Overwrite, ctx)
            .unwrap();
        node.set_record(pos, b"two", 0, DupePosition::Last, ctx).unwrap();
        node.set_record(pos, b"three", 0, DupePosition::Last, ctx)
            .unwrap();

        let left = node.erase_record(pos, 1, ctx).unwrap();
        assert_eq!(left, 2);
        assert_eq!(node.record(pos, 0, ctx).unwrap(), b"one");
        assert_eq!(node.record(pos, 1, ctx).unwrap(), b"three");
        node.check_integrity(ctx).unwrap();
    }

    #[test]
    fn erase_record_in_extended_table() {
        let fx = Fixture::new();
        let mut buf = page_buffer();
        let mut node = NodeProxy::init(&mut buf, dup_config(), 0).unwrap();
        let ctx = fx.ctx();

        let (pos, _) = node.search(b"k", ctx).unwrap();
        node.insert(pos, b"k", ctx).unwrap();
        node.set_record(pos, b"d00", 0, DupePosition::Overwrite, ctx)
            .unwrap();
        for i in 1..12u32 {
            node.set_record(pos, format!("d{i:02}").as_bytes(), 0, DupePosition::Last, ctx)
                .unwrap();
        }
        assert!(node.slot(pos).unwrap().has_extended_dups());

        let left = node.erase_record(pos, 0, ctx).unwrap();
        assert_eq!(left, 11);
        assert_eq!(node.record(pos, 0, ctx).unwrap(), b"d01");
    }

    #[test]
    fn requires_split_when_heap_fills() {
        let fx = Fixture::new();
        let mut buf = page_buffer();
        let mut node = NodeProxy::init(&mut buf, leaf_config(), 0).unwrap();
        let ctx = fx.ctx();

        let mut filled = 0u32;
        loop {
            let key = format!("key-{filled:04}");
            if node.requires_split(key.as_bytes()) {
                break;
            }
            insert_with_record(&mut node, key.as_bytes(), b"r", ctx);
            filled += 1;
            assert!(filled < 1000, "node never filled");
        }
        assert!(filled > 4);
        node.check_integrity(ctx).unwrap();
    }

    #[test]
    fn freed_slot_space_is_reused() {
        let fx = Fixture::new();
        let mut buf = page_buffer();
        let mut node = NodeProxy::init(&mut buf, leaf_config(), 0).unwrap();
        let ctx = fx.ctx();

        insert_with_record(&mut node, b"aaaa", b"r1", ctx);
        insert_with_record(&mut node, b"bbbb", b"r2", ctx);
        insert_with_record(&mut node, b"cccc", b"r3", ctx);

        let next_before = node.index_ref().next_offset();
        let pos = node.find_exact(b"bbbb", ctx).unwrap().unwrap();
        node.erase_entry(pos, ctx).unwrap();

        // same-size entry slots back into the freed region
        insert_with_record(&mut node, b"dddd", b"r4", ctx);
        assert_eq!(node.index_ref().next_offset(), next_before);
        node.check_integrity(ctx).unwrap();
    }

    #[test]
    fn split_leaf_moves_upper_half() {
        let fx = Fixture::new();
        let mut left_buf = page_buffer();
        let mut node = NodeProxy::init(&mut left_buf, leaf_config(), 0).unwrap();
        let ctx = fx.ctx();

        for i in 0..10u32 {
            insert_with_record(&mut node, format!("k{i:02}").as_bytes(), b"r", ctx);
        }

        let mut right_buf = page_buffer();
        let mut other = NodeProxy::init(&mut right_buf, leaf_config(), 0).unwrap();
        let separator = node.split_leaf(&mut other, 5, ctx).unwrap();

        assert_eq!(separator, b"k05");
        assert_eq!(node.count(), 5);
        assert_eq!(other.count(), 5);
        assert_eq!(node.key(4, ctx).unwrap(), b"k04");
        assert_eq!(other.key(0, ctx).unwrap(), b"k05");
        node.check_integrity(ctx).unwrap();
        other.check_integrity(ctx).unwrap();
    }

    #[test]
    fn split_internal_promotes_pivot() {
        let fx = Fixture::new();
        let config = leaf_config().internal();
        let mut left_buf = page_buffer();
        let mut node = NodeProxy::init(&mut left_buf, config, 1).unwrap();
        let ctx = fx.ctx();

        node.set_ptr_down(111).unwrap();
        for i in 0..7u32 {
            let key = format!("k{i:02}");
            let (pos, _) = node.search(key.as_bytes(), ctx).unwrap();
            node.insert(pos, key.as_bytes(), ctx).unwrap();
            node.set_record(
                pos,
                &(1000 + i as u64).to_le_bytes(),
                0,
                DupePosition::Overwrite,
                ctx,
            )
            .unwrap();
        }

        let mut right_buf = page_buffer();
        let mut other = NodeProxy::init(&mut right_buf, config, 1).unwrap();
        let promoted = node.split_internal(&mut other, 3, ctx).unwrap();

        assert_eq!(promoted, b"k03");
        assert_eq!(node.count(), 3);
        assert_eq!(other.count(), 3);
        assert_eq!(other.ptr_down(), 1003);
        assert_eq!(other.key(0, ctx).unwrap(), b"k04");
        node.check_integrity(ctx).unwrap();
        other.check_integrity(ctx).unwrap();
    }

    #[test]
    fn find_child_covers_ranges() {
        let fx = Fixture::new();
        let config = leaf_config().internal();
        let mut buf = page_buffer();
        let mut node = NodeProxy::init(&mut buf, config, 1).unwrap();
        let ctx = fx.ctx();

        node.set_ptr_down(100).unwrap();
        for (key, child) in [(b"g", 200u64), (b"m", 300u64)] {
            let (pos, _) = node.search(key, ctx).unwrap();
            node.insert(pos, key, ctx).unwrap();
            node.set_record(pos, &child.to_le_bytes(), 0, DupePosition::Overwrite, ctx)
                .unwrap();
        }

        assert_eq!(node.find_child(b"a", ctx).unwrap(), (None, 100));
        assert_eq!(node.find_child(b"g", ctx).unwrap(), (Some(0), 200));
        assert_eq!(node.find_child(b"k", ctx).unwrap(), (Some(0), 200));
        assert_eq!(node.find_child(b"m", ctx).unwrap(), (Some(1), 300));
        assert_eq!(node.find_child(b"z", ctx).unwrap(), (Some(1), 300));
    }

    #[test]
    fn merge_concatenates_siblings() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut left_buf = page_buffer();
        let mut left = NodeProxy::init(&mut left_buf, leaf_config(), 0).unwrap();
        let mut right_buf = page_buffer();
        let mut right = NodeProxy::init(&mut right_buf, leaf_config(), 0).unwrap();

        insert_with_record(&mut left, b"a", b"1", ctx);
        insert_with_record(&mut left, b"b", b"2", ctx);
        insert_with_record(&mut right, b"x", b"3", ctx);
        insert_with_record(&mut right, b"y", b"4", ctx);

        assert!(left.can_absorb(&right));
        left.merge_from(&mut right, ctx).unwrap();

        assert_eq!(left.count(), 4);
        assert_eq!(right.count(), 0);
        assert_eq!(left.key(2, ctx).unwrap(), b"x");
        assert_eq!(left.record(3, 0, ctx).unwrap(), b"4");
        left.check_integrity(ctx).unwrap();
    }

    #[test]
    fn scan_visits_keys_with_counts() {
        let fx = Fixture::new();
        let mut buf = page_buffer();
        let mut node = NodeProxy::init(&mut buf, dup_config(), 0).unwrap();
        let ctx = fx.ctx();

        let (pos, _) = node.search(b"multi", ctx).unwrap();
        node.insert(pos, b"multi", ctx).unwrap();
        node.set_record(pos, b"1", 0, DupePosition::Overwrite, ctx).unwrap();
        node.set_record(pos, b"2", 0, DupePosition::Last, ctx).unwrap();

        let (pos, _) = node.search(b"single", ctx).unwrap();
        node.insert(pos, b"single", ctx).unwrap();
        node.set_record(pos, b"x", 0, DupePosition::Overwrite, ctx).unwrap();

        let mut seen = Vec::new();
        node.scan(ctx, 0, false, &mut |key, count| {
            seen.push((key.to_vec(), count));
        })
        .unwrap();

        assert_eq!(
            seen,
            vec![(b"multi".to_vec(), 2), (b"single".to_vec(), 1)]
        );
    }

    #[test]
    fn fixed_inline_records_round_trip() {
        let fx = Fixture::new();
        let config = NodeConfig::leaf(&DatabaseOptions::new().record_size(4), PAGE);
        let mut buf = page_buffer();
        let mut node = NodeProxy::init(&mut buf, config, 0).unwrap();
        let ctx = fx.ctx();

        let (pos, _) = node.search(b"k", ctx).unwrap();
        node.insert(pos, b"k", ctx).unwrap();
        node.set_record(pos, b"abcd", 0, DupePosition::Overwrite, ctx)
            .unwrap();

        assert_eq!(node.record(pos, 0, ctx).unwrap(), b"abcd");
        assert_eq!(node.record_size(pos, 0, ctx).unwrap(), 4);

        // wrong width is an argument error
        assert!(node
            .set_record(pos, b"toolong", 0, DupePosition::Overwrite, ctx)
            .is_err());
    }
}
