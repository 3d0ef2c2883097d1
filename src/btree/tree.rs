//! # B-tree Index
//!
//! Root tracking, root-to-leaf descent, and the structural algorithms:
//! reactive splits propagated bottom-up through a saved path, merges on
//! the erase path when a node crosses the low watermark, and root
//! split/collapse.
//!
//! ## Descent and Grips
//!
//! Lookups descend with read-only page fetches. Mutations fetch only the
//! pages they actually change for writing (the leaf, plus whatever the
//! split or merge touches), so a point insert journals one page, not the
//! whole path.
//!
//! ## Split
//!
//! A leaf that cannot take one more entry splits at its midpoint; the new
//! right node's first key is promoted into the parent. An internal split
//! promotes its pivot key instead of copying it (the pivot's child becomes
//! the new node's pointer-down). When the propagation reaches a full root,
//! a new internal root is allocated and the tree grows one level.
//!
//! After a split the insert re-descends from the root rather than chasing
//! the half the key belongs to: one extra O(log n) walk on a path that
//! just paid for page allocation anyway, in exchange for not threading
//! split-direction bookkeeping through every caller.
//!
//! ## Merge
//!
//! Erase merges a node that fell to the low watermark into a sibling when
//! the combined entries fit, removes the separator from the parent, and
//! walks upward while parents keep crossing the watermark. An internal
//! root left with zero slots collapses into its only child and the tree
//! shrinks one level.

use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use parking_lot::Mutex;

use crate::storage::{FetchMode, Page, PageType, PersistedPageHeader};

use super::node::{DupePosition, NodeContext, NodeProxy};
use super::NodeConfig;

/// Positioning options for an insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InsertOptions {
    /// Replace the record when the key exists (without duplicates this is
    /// the only way to re-insert an existing key).
    pub overwrite: bool,
    /// Add a duplicate when the key exists.
    pub duplicate: bool,
    /// Where the duplicate lands; `Last` when unset.
    pub dup_position: Option<(DupePosition, u32)>,
}

/// One level of a saved descent path.
struct PathStep {
    address: u64,
}

pub struct BtreeIndex {
    leaf_config: NodeConfig,
    internal_config: NodeConfig,
    root: Mutex<u64>,
}

impl BtreeIndex {
    /// Allocates an empty leaf root.
    pub fn create(ctx: NodeContext<'_>, leaf_config: NodeConfig) -> Result<Self> {
        let page = ctx.pager.alloc(PageType::BtreeRoot)?;
        {
            let mut guard = page.buffer();
            NodeProxy::init(&mut guard, leaf_config, 0)?;
        }
        Ok(Self {
            leaf_config,
            internal_config: leaf_config.internal(),
            root: Mutex::new(page.address()),
        })
    }

    /// Attaches to an existing root.
    pub fn open(leaf_config: NodeConfig, root_address: u64) -> Self {
        Self {
            leaf_config,
            internal_config: leaf_config.internal(),
            root: Mutex::new(root_address),
        }
    }

    pub fn root_address(&self) -> u64 {
        *self.root.lock()
    }

    pub fn leaf_config(&self) -> &NodeConfig {
        &self.leaf_config
    }

    fn config_for(&self, level: u8) -> NodeConfig {
        if level == 0 {
            self.leaf_config
        } else {
            self.internal_config
        }
    }

    fn node_level(page: &Arc<Page>) -> Result<u8> {
        let guard = page.buffer();
        let leader: &super::node::NodeLeader =
            crate::storage::parse_zerocopy(&guard[crate::config::constants::PAGE_HEADER_SIZE..], "NodeLeader")?;
        Ok(leader.level())
    }

    /// Walks from the root to the leaf covering `key`, read-only, saving
    /// the internal path.
    fn descend(&self, ctx: NodeContext<'_>, key: &[u8]) -> Result<(u64, Vec<PathStep>)> {
        let mut path = Vec::new();
        let mut address = self.root_address();

        loop {
            let page = ctx.pager.fetch(address, FetchMode::ReadOnly)?;
            let level = Self::node_level(&page)?;
            if level == 0 {
                return Ok((address, path));
            }
            let child = {
                let mut guard = page.buffer();
                let node = NodeProxy::from_page(&mut guard, self.config_for(level))?;
                let (_, child) = node.find_child(key, ctx)?;
                child
            };
            ensure!(child != 0, "internal node at {address:#x} has a zero child");
            path.push(PathStep { address });
            address = child;
        }
    }

    /// Point lookup: the first record of `key`.
    pub fn find(&self, ctx: NodeContext<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.leaf_config.check_key(key)?;
        let (leaf_addr, _) = self.descend(ctx, key)?;
        let page = ctx.pager.fetch(leaf_addr, FetchMode::ReadOnly)?;
        let mut guard = page.buffer();
        let node = NodeProxy::from_page(&mut guard, self.leaf_config)?;
        match node.find_exact(key, ctx)? {
            Some(pos) => Ok(Some(node.record(pos, 0, ctx)?)),
            None => Ok(None),
        }
    }

    /// Cursor hook: the leaf and slot holding `key`, if present.
    pub fn locate(&self, ctx: NodeContext<'_>, key: &[u8]) -> Result<(u64, usize, Option<usize>)> {
        self.leaf_config.check_key(key)?;
        let (leaf_addr, _) = self.descend(ctx, key)?;
        let page = ctx.pager.fetch(leaf_addr, FetchMode::ReadOnly)?;
        let mut guard = page.buffer();
        let node = NodeProxy::from_page(&mut guard, self.leaf_config)?;
        let (pos, exact) = node.search(key, ctx)?;
        Ok((leaf_addr, pos, exact))
    }

    /// Number of records stored under `key` (0 when absent).
    pub fn count(&self, ctx: NodeContext<'_>, key: &[u8]) -> Result<u32> {
        let (leaf_addr, _) = self.descend(ctx, key)?;
        let page = ctx.pager.fetch(leaf_addr, FetchMode::ReadOnly)?;
        let mut guard = page.buffer();
        let node = NodeProxy::from_page(&mut guard, self.leaf_config)?;
        match node.find_exact(key, ctx)? {
            Some(pos) => node.record_count(pos, ctx),
            None => Ok(0),
        }
    }

    /// The leftmost leaf address (cursor start).
    pub fn leftmost_leaf(&self, ctx: NodeContext<'_>) -> Result<u64> {
        let mut address = self.root_address();
        loop {
            let page = ctx.pager.fetch(address, FetchMode::ReadOnly)?;
            let level = Self::node_level(&page)?;
            if level == 0 {
                return Ok(address);
            }
            let guard = page.buffer();
            let leader: &super::node::NodeLeader = crate::storage::parse_zerocopy(
                &guard[crate::config::constants::PAGE_HEADER_SIZE..],
                "NodeLeader",
            )?;
            address = leader.ptr_down();
            ensure!(address != 0, "internal node without a pointer-down child");
        }
    }

    /// The rightmost leaf address (cursor end).
    pub fn rightmost_leaf(&self, ctx: NodeContext<'_>) -> Result<u64> {
        let mut address = self.root_address();
        loop {
            let page = ctx.pager.fetch(address, FetchMode::ReadOnly)?;
            let level = Self::node_level(&page)?;
            if level == 0 {
                return Ok(address);
            }
            let mut guard = page.buffer();
            let node = NodeProxy::from_page(&mut guard, self.config_for(level))?;
            let count = node.count() as usize;
            address = if count == 0 {
                node.ptr_down()
            } else {
                node.child(count - 1)?
            };
            ensure!(address != 0, "internal node with a zero rightmost child");
        }
    }

    /// Tree height: 1 for a lone leaf root.
    pub fn height(&self, ctx: NodeContext<'_>) -> Result<u32> {
        let page = ctx.pager.fetch(self.root_address(), FetchMode::ReadOnly)?;
        Ok(Self::node_level(&page)? as u32 + 1)
    }

    // ------------------------------------------------------------------
    // insert
    // ------------------------------------------------------------------

    /// Inserts `key -> record`. Returns the duplicate index the record
    /// landed at (0 for fresh keys).
    pub fn insert(
        &self,
        ctx: NodeContext<'_>,
        key: &[u8],
        record: &[u8],
        options: InsertOptions,
    ) -> Result<u32> {
        self.leaf_config.check_key(key)?;
        self.leaf_config.check_record(record)?;

        // splits restart the descent; bounded by the tree height growing
        // at most once per iteration
        loop {
            let (leaf_addr, path) = self.descend(ctx, key)?;
            let page = ctx.pager.fetch(leaf_addr, FetchMode::ReadWrite)?;
            let mut guard = page.buffer();
            let mut node = NodeProxy::from_page(&mut guard, self.leaf_config)?;
            let (pos, exact) = node.search(key, ctx)?;

            if let Some(pos) = exact {
                if options.duplicate {
                    if !self.leaf_config.duplicates {
                        return Err(crate::error::typed(
                            crate::error::StoreError::InvalidParameter,
                            "duplicate insert into a database without duplicates",
                        ));
                    }
                    let width = self.leaf_config.record.width();
                    if node.lacks_room_for(width) {
                        drop(guard);
                        self.split_leaf(ctx, leaf_addr, path)?;
                        continue;
                    }
                    let (position, dup_index) = options
                        .dup_position
                        .unwrap_or((DupePosition::Last, 0));
                    return node.set_record(pos, record, dup_index, position, ctx);
                }
                if options.overwrite {
                    return node.set_record(pos, record, 0, DupePosition::Overwrite, ctx);
                }
                return Err(crate::error::typed(
                    crate::error::StoreError::DuplicateKey,
                    "key already exists and neither overwrite nor duplicate was requested"
                ));
            }

            if node.requires_split(key) {
                drop(guard);
                self.split_leaf(ctx, leaf_addr, path)?;
                continue;
            }

            node.insert(pos, key, ctx)
                .wrap_err("leaf insert failed after the split check")?;
            node.set_record(pos, record, 0, DupePosition::Overwrite, ctx)?;
            return Ok(0);
        }
    }

    fn retag(page: &Arc<Page>, ty: PageType) -> Result<()> {
        let mut guard = page.buffer();
        PersistedPageHeader::from_bytes_mut(&mut guard)?.set_ty(ty);
        page.mark_dirty();
        Ok(())
    }

    fn split_leaf(&self, ctx: NodeContext<'_>, leaf_addr: u64, path: Vec<PathStep>) -> Result<()> {
        let left_page = ctx.pager.fetch(leaf_addr, FetchMode::ReadWrite)?;
        let right_page = ctx.pager.alloc(PageType::BtreeLeaf)?;
        let right_addr = right_page.address();

        let (separator, old_right) = {
            let mut left_guard = left_page.buffer();
            let mut right_guard = right_page.buffer();
            let mut left = NodeProxy::from_page(&mut left_guard, self.leaf_config)?;
            let mut right = NodeProxy::init(&mut right_guard, self.leaf_config, 0)?;

            let count = left.count() as usize;
            ensure!(count >= 2, "splitting a leaf with fewer than two entries");
            let pivot = count / 2;
            let separator = left.split_leaf(&mut right, pivot, ctx)?;

            let old_right = left.right_sibling();
            right.set_right_sibling(old_right)?;
            right.set_left_sibling(leaf_addr)?;
            left.set_right_sibling(right_addr)?;
            (separator, old_right)
        };

        if old_right != 0 {
            let neighbor = ctx.pager.fetch(old_right, FetchMode::ReadWrite)?;
            let mut guard = neighbor.buffer();
            let mut node = NodeProxy::from_page(&mut guard, self.leaf_config)?;
            node.set_left_sibling(right_addr)?;
        }

        tracing::debug!(left = leaf_addr, right = right_addr, "leaf split");
        self.insert_into_parent(ctx, path, separator, leaf_addr, right_addr)
    }

    fn insert_into_parent(
        &self,
        ctx: NodeContext<'_>,
        mut path: Vec<PathStep>,
        separator: Vec<u8>,
        left_addr: u64,
        right_addr: u64,
    ) -> Result<()> {
        let mut separator = separator;
        let mut left_addr = left_addr;
        let mut right_addr = right_addr;

        loop {
            let Some(step) = path.pop() else {
                return self.grow_root(ctx, &separator, left_addr, right_addr);
            };

            let parent_page = ctx.pager.fetch(step.address, FetchMode::ReadWrite)?;
            let needs_split = {
                let mut guard = parent_page.buffer();
                let node = NodeProxy::from_page(&mut guard, self.internal_config)?;
                node.requires_split(&separator)
            };

            if !needs_split {
                let mut guard = parent_page.buffer();
                let mut node = NodeProxy::from_page(&mut guard, self.internal_config)?;
                let (pos, exact) = node.search(&separator, ctx)?;
                ensure!(exact.is_none(), "separator already present in the parent");
                node.insert(pos, &separator, ctx)?;
                node.set_record(
                    pos,
                    &right_addr.to_le_bytes(),
                    0,
                    DupePosition::Overwrite,
                    ctx,
                )?;
                return Ok(());
            }

            // split the parent, then insert the pending separator into the
            // half that covers it
            let new_page = ctx.pager.alloc(PageType::BtreeInternal)?;
            let new_addr = new_page.address();
            let promoted = {
                let mut parent_guard = parent_page.buffer();
                let mut new_guard = new_page.buffer();
                let mut parent = NodeProxy::from_page(&mut parent_guard, self.internal_config)?;
                let level = parent.level();
                let mut new_node = NodeProxy::init(&mut new_guard, self.internal_config, level)?;

                let count = parent.count() as usize;
                let pivot = count / 2;
                let promoted = parent.split_internal(&mut new_node, pivot, ctx)?;

                let target_is_new = super::compare_keys(
                    self.leaf_config.key_type,
                    &separator,
                    &promoted,
                ) == std::cmp::Ordering::Greater;
                let target = if target_is_new { &mut new_node } else { &mut parent };
                let (pos, exact) = target.search(&separator, ctx)?;
                ensure!(exact.is_none(), "separator already present after split");
                target.insert(pos, &separator, ctx)?;
                target.set_record(
                    pos,
                    &right_addr.to_le_bytes(),
                    0,
                    DupePosition::Overwrite,
                    ctx,
                )?;
                promoted
            };

            tracing::debug!(parent = step.address, new = new_addr, "internal split");
            separator = promoted;
            left_addr = step.address;
            right_addr = new_addr;
        }
    }

    fn grow_root(
        &self,
        ctx: NodeContext<'_>,
        separator: &[u8],
        left_addr: u64,
        right_addr: u64,
    ) -> Result<()> {
        let old_root_addr = self.root_address();
        ensure!(
            old_root_addr == left_addr,
            "root split propagated from a non-root page"
        );

        let old_root = ctx.pager.fetch(old_root_addr, FetchMode::ReadWrite)?;
        let old_level = Self::node_level(&old_root)?;
        Self::retag(
            &old_root,
            if old_level == 0 {
                PageType::BtreeLeaf
            } else {
                PageType::BtreeInternal
            },
        )?;

        let new_root = ctx.pager.alloc(PageType::BtreeRoot)?;
        {
            let mut guard = new_root.buffer();
            let mut node = NodeProxy::init(&mut guard, self.internal_config, old_level + 1)?;
            node.set_ptr_down(left_addr)?;
            let (pos, _) = node.search(separator, ctx)?;
            node.insert(pos, separator, ctx)?;
            node.set_record(
                pos,
                &right_addr.to_le_bytes(),
                0,
                DupePosition::Overwrite,
                ctx,
            )?;
        }

        *self.root.lock() = new_root.address();
        tracing::debug!(
            root = new_root.address(),
            height = old_level as u32 + 2,
            "root split"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // erase
    // ------------------------------------------------------------------

    /// Erases `key` (or one duplicate of it). Returns true when the key
    /// disappeared entirely. A missing key is a `key-not-found` error.
    pub fn erase(
        &self,
        ctx: NodeContext<'_>,
        key: &[u8],
        dup_index: Option<u32>,
    ) -> Result<bool> {
        self.leaf_config.check_key(key)?;
        let (leaf_addr, path) = self.descend(ctx, key)?;
        let page = ctx.pager.fetch(leaf_addr, FetchMode::ReadWrite)?;

        let gone = {
            let mut guard = page.buffer();
            let mut node = NodeProxy::from_page(&mut guard, self.leaf_config)?;
            let Some(pos) = node.find_exact(key, ctx)? else {
                return Err(crate::error::typed(
                    crate::error::StoreError::KeyNotFound,
                    "erase of a key that is not in the tree"
                ));
            };

            match dup_index {
                Some(idx) if node.record_count(pos, ctx)? > 1 => {
                    node.erase_record(pos, idx, ctx)?;
                    false
                }
                Some(idx) => {
                    // erasing the only record: validate the index, then
                    // drop the whole entry
                    let total = node.record_count(pos, ctx)?;
                    if idx >= total {
                        return Err(crate::error::typed(
                            crate::error::StoreError::KeyNotFound,
                            format!("duplicate index {idx} out of range (count {total})")
                        ));
                    }
                    node.erase_entry(pos, ctx)?;
                    true
                }
                None => {
                    node.erase_entry(pos, ctx)?;
                    true
                }
            }
        };

        if gone {
            self.rebalance_after_erase(ctx, leaf_addr, path)?;
        }
        Ok(gone)
    }

    fn rebalance_after_erase(
        &self,
        ctx: NodeContext<'_>,
        mut address: u64,
        mut path: Vec<PathStep>,
    ) -> Result<()> {
        loop {
            let Some(step) = path.pop() else {
                return self.maybe_collapse_root(ctx);
            };
            let parent_addr = step.address;

            let page = ctx.pager.fetch(address, FetchMode::ReadOnly)?;
            let needs_merge = {
                let mut guard = page.buffer();
                let level = Self::node_level(&page)?;
                let node = NodeProxy::from_page(&mut guard, self.config_for(level))?;
                node.requires_merge()
            };
            if !needs_merge {
                return Ok(());
            }

            let merged = self.try_merge(ctx, parent_addr, address)?;
            if !merged {
                // tolerate the underfill until a later erase
                return Ok(());
            }
            address = parent_addr;
        }
    }

    /// Attempts to merge `child` with a sibling under `parent`. Returns
    /// true when a merge happened (the parent lost a slot).
    fn try_merge(&self, ctx: NodeContext<'_>, parent_addr: u64, child_addr: u64) -> Result<bool> {
        let parent_page = ctx.pager.fetch(parent_addr, FetchMode::ReadOnly)?;
        let parent_level = Self::node_level(&parent_page)?;

        // locate the child among the parent's slots
        let (child_slot, parent_count) = {
            let mut guard = parent_page.buffer();
            let node = NodeProxy::from_page(&mut guard, self.config_for(parent_level))?;
            let count = node.count() as usize;
            let mut found: Option<Option<usize>> = None;
            if node.ptr_down() == child_addr {
                found = Some(None);
            } else {
                for i in 0..count {
                    if node.child(i)? == child_addr {
                        found = Some(Some(i));
                        break;
                    }
                }
            }
            let Some(slot) = found else {
                return Err(crate::error::typed(
                    crate::error::StoreError::IntegrityViolated,
                    format!("page {child_addr:#x} not found under its parent {parent_addr:#x}")
                ));
            };
            (slot, count)
        };

        // prefer absorbing the right sibling; fall back to merging into the
        // left one
        let (left_addr, right_addr, right_slot) = match child_slot {
            None if parent_count > 0 => {
                let guard_child = {
                    let mut guard = parent_page.buffer();
                    let node = NodeProxy::from_page(&mut guard, self.config_for(parent_level))?;
                    node.child(0)?
                };
                (child_addr, guard_child, 0usize)
            }
            Some(i) if i + 1 < parent_count => {
                let right = {
                    let mut guard = parent_page.buffer();
                    let node = NodeProxy::from_page(&mut guard, self.config_for(parent_level))?;
                    node.child(i + 1)?
                };
                (child_addr, right, i + 1)
            }
            Some(i) => {
                // last child: merge it into its left neighbor
                let left = {
                    let mut guard = parent_page.buffer();
                    let node = NodeProxy::from_page(&mut guard, self.config_for(parent_level))?;
                    if i == 0 {
                        node.ptr_down()
                    } else {
                        node.child(i - 1)?
                    }
                };
                (left, child_addr, i)
            }
            None => return Ok(false), // parent has only the pointer-down
        };

        let left_page = ctx.pager.fetch(left_addr, FetchMode::ReadWrite)?;
        let right_page = ctx.pager.fetch(right_addr, FetchMode::ReadWrite)?;
        let level = Self::node_level(&left_page)?;
        let config = self.config_for(level);

        // separator between the two, needed for internal merges
        let separator = {
            let mut guard = parent_page.buffer();
            let parent = NodeProxy::from_page(&mut guard, self.config_for(parent_level))?;
            parent.key(right_slot, ctx)?
        };

        let old_right_right = {
            let mut left_guard = left_page.buffer();
            let mut right_guard = right_page.buffer();
            let mut left = NodeProxy::from_page(&mut left_guard, config)?;
            let mut right = NodeProxy::from_page(&mut right_guard, config)?;

            if level > 0 {
                // pull the separator down so the right node's pointer-down
                // subtree stays addressable; the separator needs an index
                // slot of its own on top of what the merge absorbs
                let extra = config.key_part_size(separator.len()) + config.record.width();
                let combined = left.count() as usize + right.count() as usize + 1;
                if combined > left.capacity() as usize
                    || !left.can_absorb(&right)
                    || left.lacks_room_for(extra)
                    || left.requires_split(&separator)
                {
                    return Ok(false);
                }
                let (pos, exact) = left.search(&separator, ctx)?;
                ensure!(exact.is_none(), "separator already present in left sibling");
                left.insert(pos, &separator, ctx)?;
                left.set_record(
                    pos,
                    &right.ptr_down().to_le_bytes(),
                    0,
                    DupePosition::Overwrite,
                    ctx,
                )?;
            } else if !left.can_absorb(&right) {
                return Ok(false);
            }

            left.merge_from(&mut right, ctx)?;
            let old_right_right = right.right_sibling();
            left.set_right_sibling(old_right_right)?;
            old_right_right
        };

        if level == 0 && old_right_right != 0 {
            let neighbor = ctx.pager.fetch(old_right_right, FetchMode::ReadWrite)?;
            let mut guard = neighbor.buffer();
            let mut node = NodeProxy::from_page(&mut guard, config)?;
            node.set_left_sibling(left_addr)?;
        }

        // drop the separator slot from the parent, then the empty page
        {
            let parent_rw = ctx.pager.fetch(parent_addr, FetchMode::ReadWrite)?;
            let mut guard = parent_rw.buffer();
            let mut parent = NodeProxy::from_page(&mut guard, self.config_for(parent_level))?;
            parent.erase_entry(right_slot, ctx)?;
        }
        ctx.pager.free_page(right_addr)?;
        tracing::debug!(left = left_addr, right = right_addr, "nodes merged");
        Ok(true)
    }

    fn maybe_collapse_root(&self, ctx: NodeContext<'_>) -> Result<()> {
        let root_addr = self.root_address();
        let root_page = ctx.pager.fetch(root_addr, FetchMode::ReadOnly)?;
        let level = Self::node_level(&root_page)?;
        if level == 0 {
            return Ok(());
        }

        let (count, only_child) = {
            let mut guard = root_page.buffer();
            let node = NodeProxy::from_page(&mut guard, self.internal_config)?;
            (node.count(), node.ptr_down())
        };
        if count > 0 {
            return Ok(());
        }

        ensure!(only_child != 0, "empty internal root without a child");
        let child = ctx.pager.fetch(only_child, FetchMode::ReadWrite)?;
        Self::retag(&child, PageType::BtreeRoot)?;

        *self.root.lock() = only_child;
        ctx.pager.free_page(root_addr)?;
        tracing::debug!(root = only_child, "root collapsed");

        // the new root may itself be a single-child internal node
        self.maybe_collapse_root(ctx)
    }

    // ------------------------------------------------------------------
    // whole-tree helpers
    // ------------------------------------------------------------------

    /// The greatest key in the tree, if any (record-number databases seed
    /// their counter from it).
    pub fn max_key(&self, ctx: NodeContext<'_>) -> Result<Option<Vec<u8>>> {
        let mut address = self.rightmost_leaf(ctx)?;
        loop {
            let page = ctx.pager.fetch(address, FetchMode::ReadOnly)?;
            let mut guard = page.buffer();
            let node = NodeProxy::from_page(&mut guard, self.leaf_config)?;
            let count = node.count() as usize;
            if count > 0 {
                return Ok(Some(node.key(count - 1, ctx)?));
            }
            // an empty rightmost leaf can only appear transiently; fall
            // back through the sibling chain
            let left = node.left_sibling();
            if left == 0 {
                return Ok(None);
            }
            address = left;
        }
    }

    /// Frees every page and blob of the tree. The index is unusable
    /// afterwards; used by database erase.
    pub fn destroy(&self, ctx: NodeContext<'_>) -> Result<()> {
        self.destroy_subtree(ctx, self.root_address())
    }

    fn destroy_subtree(&self, ctx: NodeContext<'_>, address: u64) -> Result<()> {
        let page = ctx.pager.fetch(address, FetchMode::ReadWrite)?;
        let level = Self::node_level(&page)?;

        if level > 0 {
            let (ptr_down, children) = {
                let mut guard = page.buffer();
                let node = NodeProxy::from_page(&mut guard, self.internal_config)?;
                let mut children = Vec::with_capacity(node.count() as usize);
                for pos in 0..node.count() as usize {
                    children.push(node.child(pos)?);
                }
                (node.ptr_down(), children)
            };
            if ptr_down != 0 {
                self.destroy_subtree(ctx, ptr_down)?;
            }
            for child in children {
                self.destroy_subtree(ctx, child)?;
            }
        }

        // erase entries back to front so the out-of-line storage is freed
        {
            let mut guard = page.buffer();
            let config = self.config_for(level);
            let mut node = NodeProxy::from_page(&mut guard, config)?;
            while node.count() > 0 {
                let last = node.count() as usize - 1;
                node.erase_entry(last, ctx)?;
            }
        }
        ctx.pager.free_page(address)?;
        Ok(())
    }

    /// Visits every key in order with its duplicate count.
    pub fn scan(
        &self,
        ctx: NodeContext<'_>,
        distinct: bool,
        visitor: &mut dyn FnMut(&[u8], u32),
    ) -> Result<()> {
        let mut address = self.leftmost_leaf(ctx)?;
        while address != 0 {
            let page = ctx.pager.fetch(address, FetchMode::ReadOnly)?;
            let mut guard = page.buffer();
            let node = NodeProxy::from_page(&mut guard, self.leaf_config)?;
            node.scan(ctx, 0, distinct, visitor)?;
            address = node.right_sibling();
        }
        Ok(())
    }

    /// Verifies node invariants and separator ordering across the whole
    /// tree.
    pub fn check_integrity(&self, ctx: NodeContext<'_>) -> Result<()> {
        self.check_subtree(ctx, self.root_address(), None, None)
    }

    fn check_subtree(
        &self,
        ctx: NodeContext<'_>,
        address: u64,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) -> Result<()> {
        let page = ctx.pager.fetch(address, FetchMode::ReadOnly)?;
        let level = Self::node_level(&page)?;
        let config = self.config_for(level);

        let (count, keys, children, ptr_down) = {
            let mut guard = page.buffer();
            let node = NodeProxy::from_page(&mut guard, config)?;
            node.check_integrity(ctx)
                .wrap_err_with(|| format!("node {address:#x} failed its local invariants"))?;

            let count = node.count() as usize;
            let mut keys = Vec::with_capacity(count);
            for pos in 0..count {
                keys.push(node.key(pos, ctx)?);
            }
            let mut children = Vec::new();
            if level > 0 {
                for pos in 0..count {
                    children.push(node.child(pos)?);
                }
            }
            (count, keys, children, node.ptr_down())
        };

        use std::cmp::Ordering::Less;
        for key in &keys {
            if let Some(lower) = lower {
                if super::compare_keys(config.key_type, key, lower) == Less {
                    return Err(crate::error::typed(
                        crate::error::StoreError::IntegrityViolated,
                        format!("key below its subtree's lower bound in node {address:#x}"),
                    ));
                }
            }
            if let Some(upper) = upper {
                if super::compare_keys(config.key_type, key, upper) != Less {
                    return Err(crate::error::typed(
                        crate::error::StoreError::IntegrityViolated,
                        format!("key at or above its subtree's upper bound in node {address:#x}"),
                    ));
                }
            }
        }

        if level > 0 {
            if count == 0 && ptr_down == 0 {
                return Err(crate::error::typed(
                    crate::error::StoreError::IntegrityViolated,
                    format!("internal node {address:#x} has no children"),
                ));
            }
            // pointer-down subtree: keys strictly below key(0)
            self.check_subtree(ctx, ptr_down, lower, keys.first().map(|k| k.as_slice()))?;
            for (i, &child) in children.iter().enumerate() {
                let child_lower = Some(keys[i].as_slice());
                let child_upper = keys.get(i + 1).map(|k| k.as_slice()).or(upper);
                self.check_subtree(ctx, child, child_lower, child_upper)?;
            }
        }
        Ok(())
    }
}
