//! # Changeset
//!
//! The scoped collection of pages touched by one logical operation. A page
//! enters the changeset the moment it is fetched for writing (or freshly
//! allocated); entering pins it, so the cache cannot evict it mid-operation.
//!
//! ## Two Exits
//!
//! - **Flush**: the journal writes every member's image under one LSN and
//!   fsyncs; afterwards the pins drop and the pages become flushable by the
//!   background worker. This is the commit edge of the scope.
//! - **Discard**: the operation failed. Every member's buffer is restored
//!   from the before-image captured on entry, dirty flags and LSN mirrors
//!   roll back, pins drop, and freshly allocated pages leave the cache and
//!   return to the freelist. In-memory state ends exactly where the
//!   operation started, which is what makes mid-operation errors (including
//!   out-of-memory) non-corrupting.
//!
//! Capturing before-images costs one page copy per touched page, paid only
//! on write paths. The alternative of reloading members from the device
//! would resurrect stale on-disk state for pages whose last journaled image
//! had not been written back yet.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::storage::page::Page;

/// Most operations touch a handful of pages; the address lists stay on
/// the stack for those.
pub type AddressList = SmallVec<[u64; 8]>;

struct Member {
    page: Arc<Page>,
    before: Box<[u8]>,
    was_dirty: bool,
    before_lsn: u64,
    freshly_allocated: bool,
}

/// Pages touched by one logical operation.
#[derive(Default)]
pub struct Changeset {
    members: Vec<Member>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn contains(&self, address: u64) -> bool {
        self.members.iter().any(|m| m.page.address() == address)
    }

    /// Adds a page, capturing its before-image and pinning it. Adding the
    /// same page twice is a no-op; the first before-image wins.
    ///
    /// An address can be freed and re-allocated within one operation (a
    /// blob relocation does exactly that); the re-allocation produces a
    /// new `Page` object for the same address. The member is re-pointed at
    /// the live object so the journal writes the image that matters, while
    /// the original before-image keeps describing the operation's starting
    /// state for rollback.
    pub fn add(&mut self, page: &Arc<Page>, freshly_allocated: bool) {
        if let Some(member) = self
            .members
            .iter_mut()
            .find(|m| m.page.address() == page.address())
        {
            if !Arc::ptr_eq(&member.page, page) {
                member.page.unpin();
                page.pin();
                page.mark_dirty();
                member.page = Arc::clone(page);
            }
            return;
        }
        let before = {
            let guard = page.buffer();
            guard.to_vec().into_boxed_slice()
        };
        page.pin();
        self.members.push(Member {
            before,
            was_dirty: page.is_dirty(),
            before_lsn: page.lsn(),
            freshly_allocated,
            page: Arc::clone(page),
        });
        page.mark_dirty();
    }

    /// The member pages, for journaling.
    pub fn pages(&self) -> impl Iterator<Item = &Arc<Page>> {
        self.members.iter().map(|m| &m.page)
    }

    pub fn addresses(&self) -> AddressList {
        self.members.iter().map(|m| m.page.address()).collect()
    }

    /// Successful exit: drop before-images and release every pin. The pages
    /// stay dirty for the background worker.
    pub fn release(self) -> AddressList {
        let mut addresses = AddressList::with_capacity(self.members.len());
        for member in self.members {
            addresses.push(member.page.address());
            member.page.unpin();
        }
        addresses
    }

    /// Failed exit: restore every member to its before-image and release
    /// pins. Returns the addresses of freshly allocated members so the
    /// caller can drop them from the cache and give their space back.
    pub fn roll_back(self) -> AddressList {
        let mut fresh = AddressList::new();
        for member in self.members {
            {
                let mut guard = member.page.buffer();
                guard.copy_from_slice(&member.before);
            }
            member
                .page
                .stamp_lsn(&mut member.page.buffer(), member.before_lsn)
                .expect("before-image shorter than a page header");
            if member.was_dirty {
                member.page.mark_dirty();
            } else {
                member.page.clear_dirty();
            }
            member.page.unpin();
            if member.freshly_allocated {
                fresh.push(member.page.address());
            }
        }
        fresh
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
    fn add_pins_and_marks_dirty() {
        let mut cs = Changeset::new();
        let p = page(1024);

        cs.add(&p, false);

        assert!(p.is_pinned());
        assert!(p.is_dirty());
        assert!(cs.contains(1024));
        assert_eq!(cs.len(), 1);
    }

    #[test]
    fn double_add_pins_once() {
        let mut cs = Changeset::new();
        let p = page(1024);

        cs.add(&p, false);
        cs.add(&p, false);

        assert_eq!(cs.len(), 1);
        cs.release();
        assert!(!p.is_pinned());
    }

    #[test]
    fn release_unpins_and_keeps_mutations() {
        let mut cs = Changeset::new();
        let p = page(1024);
        cs.add(&p, false);

        p.buffer()[100] = 0xEE;
        let addresses = cs.release();

        assert_eq!(addresses.as_slice(), &[1024]);
        assert!(!p.is_pinned());
        assert!(p.is_dirty());
        assert_eq!(p.buffer()[100], 0xEE);
    }

    #[test]
    fn roll_back_restores_before_image() {
        let mut cs = Changeset::new();
        let p = page(1024);
        p.buffer()[100] = 0x11;
        cs.add(&p, false);

        p.buffer()[100] = 0x22;
        {
            let mut guard = p.buffer();
            p.stamp_lsn(&mut guard, 77).unwrap();
        }

        let fresh = cs.roll_back();

        assert!(fresh.is_empty());
        assert!(!p.is_pinned());
        assert!(!p.is_dirty());
        assert_eq!(p.buffer()[100], 0x11);
        assert_eq!(p.lsn(), 0);
    }

    #[test]
    fn roll_back_reports_fresh_allocations() {
        let mut cs = Changeset::new();
        let old = page(1024);
        let fresh = page(2048);

        cs.add(&old, false);
        cs.add(&fresh, true);

        let fresh_addrs = cs.roll_back();
        assert_eq!(fresh_addrs.as_slice(), &[2048]);
    }

    #[test]
    fn roll_back_preserves_prior_dirtiness() {
        let mut cs = Changeset::new();
        let p = page(1024);
        p.mark_dirty(); // dirty from an earlier, journaled operation
        cs.add(&p, false);

        p.buffer()[10] = 9;
        cs.roll_back();

        assert!(p.is_dirty());
    }
}
