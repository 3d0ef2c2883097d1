//! # Cursor
//!
//! Ordered traversal over one database, merging the btree's committed
//! state with the pending operation trees of live transactions on every
//! step. The cursor is in exactly one of three states:
//!
//! - **nil**: unpositioned (fresh, or after erasing its key)
//! - **coupled to the btree**: a (leaf page, slot, duplicate index) triple
//! - **coupled to a transaction**: the key exists only as a pending
//!   operation
//!
//! ## Revalidation
//!
//! Along with the coupling the cursor keeps its current key (the anchor).
//! Every database mutation bumps a generation counter; a cursor whose
//! cached generation is stale re-locates its anchor before touching page
//! state, so splits and merges can never leave it pointing into a moved
//! slot. If the anchor itself was erased by someone else, position-relative
//! moves still work: `move_next` from an erased key lands on the next key
//! in order, which is the behavior the erase-through-cursor contract
//! specifies.
//!
//! ## Approximate Matching
//!
//! `find(key, mode)` supports LT / LEQ / GT / GEQ / EQ. After an ordinary
//! search, an inexact hit steps one position in the allowed direction,
//! crossing leaf boundaries through the sibling links. Keys whose merged
//! visibility is "erased by a pending operation" are skipped in the
//! direction of travel.

use eyre::Result;

use crate::btree::node::NodeProxy;
use crate::db::Database;
use crate::env::Transaction;
use crate::error::{typed, StoreError};
use crate::storage::FetchMode;
use crate::txn::tree::Visibility;

/// Approximate-match flags for [`Cursor::find`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    /// Exact match only.
    Eq,
    /// Greatest key strictly below.
    Lt,
    /// Greatest key at or below.
    Leq,
    /// Smallest key strictly above.
    Gt,
    /// Smallest key at or above.
    Geq,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CursorState {
    Nil,
    Btree { leaf: u64, slot: usize, dup: u32 },
    Txn { dup: u32 },
}

pub struct Cursor<'a> {
    db: &'a Database,
    txn: Option<&'a Transaction>,
    state: CursorState,
    /// The key the cursor sits on (or sat on before erasing it).
    anchor: Option<Vec<u8>>,
    generation: u64,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(db: &'a Database, txn: Option<&'a Transaction>) -> Result<Self> {
        Ok(Self {
            db,
            txn,
            state: CursorState::Nil,
            anchor: None,
            generation: db.inner().mutation_generation(),
        })
    }

    fn name(&self) -> u16 {
        self.db.name()
    }

    pub fn is_nil(&self) -> bool {
        self.state == CursorState::Nil
    }

    /// The current duplicate index.
    pub fn duplicate_position(&self) -> Result<u32> {
        match &self.state {
            CursorState::Nil => Err(nil_cursor()),
            CursorState::Btree { dup, .. } | CursorState::Txn { dup } => Ok(*dup),
        }
    }

    // ------------------------------------------------------------------
    // positioning
    // ------------------------------------------------------------------

    /// Positions the cursor on `key`, or near it per `mode`.
    pub fn find(&mut self, key: &[u8], mode: MatchMode) -> Result<()> {
        self.db.inner().config().check_key(key)?;

        match mode {
            MatchMode::Eq => self.couple_exact(key),
            MatchMode::Geq => self.seek(Some(key), true, true),
            MatchMode::Gt => self.seek(Some(key), true, false),
            MatchMode::Leq => self.seek(Some(key), false, true),
            MatchMode::Lt => self.seek(Some(key), false, false),
        }
    }

    pub fn move_first(&mut self) -> Result<()> {
        self.seek(None, true, false)
    }

    pub fn move_last(&mut self) -> Result<()> {
        self.seek(None, false, false)
    }

    /// Steps to the next duplicate, or the next key.
    pub fn move_next(&mut self) -> Result<()> {
        let Some(anchor) = self.anchor.clone() else {
            return self.move_first();
        };

        if !self.is_nil() {
            let dup = self.duplicate_position()?;
            let total = self.merged_count(&anchor)?;
            if dup + 1 < total {
                return self.set_dup(dup + 1);
            }
        }
        self.seek(Some(&anchor), true, false)
    }

    /// Steps to the previous duplicate, or the previous key's last
    /// duplicate.
    pub fn move_previous(&mut self) -> Result<()> {
        let Some(anchor) = self.anchor.clone() else {
            return self.move_last();
        };

        if !self.is_nil() {
            let dup = self.duplicate_position()?;
            if dup > 0 {
                return self.set_dup(dup - 1);
            }
        }
        self.seek(Some(&anchor), false, false)?;
        // land on the last duplicate when entering a key backwards
        let anchor = self.anchor.clone().expect("seek left the cursor coupled");
        let total = self.merged_count(&anchor)?;
        if total > 1 {
            self.set_dup(total - 1)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // access
    // ------------------------------------------------------------------

    pub fn get_key(&mut self) -> Result<Vec<u8>> {
        if self.state == CursorState::Nil {
            return Err(nil_cursor());
        }
        self.anchor.clone().ok_or_else(nil_cursor)
    }

    pub fn get_record(&mut self) -> Result<Vec<u8>> {
        let anchor = self.require_anchor()?;
        match self.state.clone() {
            CursorState::Nil => Err(nil_cursor()),
            CursorState::Txn { .. } => match self.db.env().txns.visibility(self.name(), &anchor)
            {
                Some(Visibility::Record(record)) => Ok(record),
                _ => Err(typed(
                    StoreError::KeyNotFound,
                    "pending operation under the cursor disappeared",
                )),
            },
            CursorState::Btree { dup, .. } => {
                // a pending overwrite shadows the committed record
                if let Some(Visibility::Record(record)) =
                    self.db.env().txns.visibility(self.name(), &anchor)
                {
                    return Ok(record);
                }
                let (leaf, slot) = self.resolve(&anchor)?;
                let env = self.db.env();
                let page = env.pager.fetch(leaf, FetchMode::ReadOnly)?;
                let mut guard = page.buffer();
                let node = NodeProxy::from_page(&mut guard, *self.db.inner().config())?;
                node.record(slot, dup, env.ctx())
            }
        }
    }

    pub fn get_record_size(&mut self) -> Result<u64> {
        let anchor = self.require_anchor()?;
        match self.state.clone() {
            CursorState::Nil => Err(nil_cursor()),
            CursorState::Txn { .. } => Ok(self.get_record()?.len() as u64),
            CursorState::Btree { dup, .. } => {
                let (leaf, slot) = self.resolve(&anchor)?;
                let env = self.db.env();
                let page = env.pager.fetch(leaf, FetchMode::ReadOnly)?;
                let mut guard = page.buffer();
                let node = NodeProxy::from_page(&mut guard, *self.db.inner().config())?;
                node.record_size(slot, dup, env.ctx())
            }
        }
    }

    /// Number of duplicates under the cursor's key.
    pub fn get_record_count(&mut self) -> Result<u32> {
        let anchor = self.require_anchor()?;
        if self.state == CursorState::Nil {
            return Err(nil_cursor());
        }
        self.merged_count(&anchor)
    }

    // ------------------------------------------------------------------
    // mutation through the cursor
    // ------------------------------------------------------------------

    /// Inserts and positions the cursor on the new key.
    pub fn insert(&mut self, key: &[u8], record: &[u8], flags: crate::db::InsertFlags) -> Result<()> {
        let stored = self.db.insert_with(self.txn, key, record, flags)?;
        self.generation = self.db.inner().mutation_generation();
        self.couple_exact(&stored)
    }

    /// Erases the current duplicate (the whole key when it is the last
    /// one). The cursor uncouples; `move_next` resumes after the erased
    /// key.
    pub fn erase(&mut self) -> Result<()> {
        let anchor = self.require_anchor()?;
        if self.state == CursorState::Nil {
            return Err(nil_cursor());
        }
        let dup = self.duplicate_position()?;
        let total = self.merged_count(&anchor)?;

        if total > 1 {
            self.db.erase_duplicate(self.txn, &anchor, dup)?;
        } else {
            self.db.erase(self.txn, &anchor)?;
        }

        self.state = CursorState::Nil;
        self.generation = self.db.inner().mutation_generation();
        Ok(())
    }

    // ------------------------------------------------------------------
    // internals
    // ------------------------------------------------------------------

    fn require_anchor(&self) -> Result<Vec<u8>> {
        self.anchor.clone().ok_or_else(nil_cursor)
    }

    fn set_dup(&mut self, dup: u32) -> Result<()> {
        match &mut self.state {
            CursorState::Nil => Err(nil_cursor()),
            CursorState::Btree { dup: d, .. } => {
                *d = dup;
                Ok(())
            }
            CursorState::Txn { dup: d } => {
                *d = dup;
                Ok(())
            }
        }
    }

    /// Duplicate count merged with pending state.
    fn merged_count(&self, key: &[u8]) -> Result<u32> {
        self.db.count(self.txn, key)
    }

    /// Re-establishes (leaf, slot) for the anchor, tolerating splits and
    /// merges since the last touch.
    fn resolve(&mut self, anchor: &[u8]) -> Result<(u64, usize)> {
        let env = self.db.env();
        let current_gen = self.db.inner().mutation_generation();

        if self.generation == current_gen {
            if let CursorState::Btree { leaf, slot, .. } = self.state {
                return Ok((leaf, slot));
            }
        }

        let (leaf, slot, exact) = self.db.inner().tree().locate(env.ctx(), anchor)?;
        match exact {
            Some(slot_idx) => {
                let dup = match self.state {
                    CursorState::Btree { dup, .. } => dup,
                    _ => 0,
                };
                self.state = CursorState::Btree {
                    leaf,
                    slot: slot_idx,
                    dup,
                };
                self.generation = current_gen;
                Ok((leaf, slot_idx))
            }
            None => {
                let _ = slot;
                Err(typed(
                    StoreError::KeyNotFound,
                    "the cursor's key was erased from under it",
                ))
            }
        }
    }

    fn couple_exact(&mut self, key: &[u8]) -> Result<()> {
        let env = self.db.env();

        match env.txns.visibility(self.name(), key) {
            Some(Visibility::Erased) => {
                self.state = CursorState::Nil;
                return Err(typed(
                    StoreError::KeyNotFound,
                    "key is erased by a pending operation",
                ));
            }
            Some(Visibility::Record(_)) => {
                let (leaf, slot, exact) = self.db.inner().tree().locate(env.ctx(), key)?;
                self.anchor = Some(key.to_vec());
                self.generation = self.db.inner().mutation_generation();
                self.state = match exact {
                    Some(slot_idx) => CursorState::Btree {
                        leaf,
                        slot: slot_idx,
                        dup: 0,
                    },
                    None => CursorState::Txn { dup: 0 },
                };
                let _ = slot;
                return Ok(());
            }
            None => {}
        }

        let (leaf, slot, exact) = self.db.inner().tree().locate(env.ctx(), key)?;
        match exact {
            Some(slot_idx) => {
                self.anchor = Some(key.to_vec());
                self.generation = self.db.inner().mutation_generation();
                self.state = CursorState::Btree {
                    leaf,
                    slot: slot_idx,
                    dup: 0,
                };
                Ok(())
            }
            None => {
                let _ = slot;
                self.state = CursorState::Nil;
                Err(typed(StoreError::KeyNotFound, "exact match not found"))
            }
        }
    }

    /// The workhorse: the nearest key in the chosen direction whose merged
    /// visibility is live. `from == None` means "from the end of the
    /// keyspace" (first for forward, last for backward).
    fn seek(&mut self, from: Option<&[u8]>, forward: bool, inclusive: bool) -> Result<()> {
        let mut from: Option<Vec<u8>> = from.map(|k| k.to_vec());
        let mut inclusive = inclusive;

        loop {
            let btree_key = self.btree_candidate(from.as_deref(), forward, inclusive)?;
            let txn_key = self.txn_candidate(from.as_deref(), forward, inclusive);

            let candidate = match (btree_key, txn_key) {
                (None, None) => {
                    self.state = CursorState::Nil;
                    return Err(typed(StoreError::KeyNotFound, "no key in that direction"));
                }
                (Some(b), None) => b,
                (None, Some(t)) => t,
                (Some(b), Some(t)) => {
                    let key_type = self.db.inner().config().key_type;
                    let ordering = crate::btree::compare_keys(key_type, &b, &t);
                    let pick_b = if forward {
                        ordering != std::cmp::Ordering::Greater
                    } else {
                        ordering != std::cmp::Ordering::Less
                    };
                    if pick_b {
                        b
                    } else {
                        t
                    }
                }
            };

            // a pending erase hides the candidate; keep stepping
            if matches!(
                self.db.env().txns.visibility(self.name(), &candidate),
                Some(Visibility::Erased)
            ) {
                from = Some(candidate);
                inclusive = false;
                continue;
            }

            // couple
            let env = self.db.env();
            let (leaf, _, exact) = self.db.inner().tree().locate(env.ctx(), &candidate)?;
            self.generation = self.db.inner().mutation_generation();
            self.state = match exact {
                Some(slot_idx) => CursorState::Btree {
                    leaf,
                    slot: slot_idx,
                    dup: 0,
                },
                None => CursorState::Txn { dup: 0 },
            };
            self.anchor = Some(candidate);
            return Ok(());
        }
    }

    /// Nearest committed key in the chosen direction.
    fn btree_candidate(
        &self,
        from: Option<&[u8]>,
        forward: bool,
        inclusive: bool,
    ) -> Result<Option<Vec<u8>>> {
        let env = self.db.env();
        let ctx = env.ctx();
        let tree = self.db.inner().tree();
        let config = *self.db.inner().config();

        // establish a starting (leaf, position)
        let (mut leaf, mut pos): (u64, isize) = match from {
            None if forward => (tree.leftmost_leaf(ctx)?, 0),
            None => {
                let leaf = tree.rightmost_leaf(ctx)?;
                let page = env.pager.fetch(leaf, FetchMode::ReadOnly)?;
                let mut guard = page.buffer();
                let node = NodeProxy::from_page(&mut guard, config)?;
                (leaf, node.count() as isize - 1)
            }
            Some(key) => {
                let (leaf, pos, exact) = tree.locate(ctx, key)?;
                match (exact, forward) {
                    (Some(slot), _) if inclusive => (leaf, slot as isize),
                    (Some(slot), true) => (leaf, slot as isize + 1),
                    (Some(slot), false) => (leaf, slot as isize - 1),
                    // `pos` is the insertion point: the first key greater
                    (None, true) => (leaf, pos as isize),
                    (None, false) => (leaf, pos as isize - 1),
                }
            }
        };

        // walk the sibling chain until a slot materializes
        loop {
            let page = env.pager.fetch(leaf, FetchMode::ReadOnly)?;
            let mut guard = page.buffer();
            let node = NodeProxy::from_page(&mut guard, config)?;
            let count = node.count() as isize;

            if pos >= 0 && pos < count {
                return Ok(Some(node.key(pos as usize, ctx)?));
            }

            if forward {
                let next = node.right_sibling();
                if next == 0 {
                    return Ok(None);
                }
                leaf = next;
                pos = 0;
            } else {
                let prev = node.left_sibling();
                if prev == 0 {
                    return Ok(None);
                }
                drop(guard);
                let page = env.pager.fetch(prev, FetchMode::ReadOnly)?;
                let mut guard = page.buffer();
                let node = NodeProxy::from_page(&mut guard, config)?;
                pos = node.count() as isize - 1;
                leaf = prev;
            }
        }
    }

    /// Nearest pending key across live transactions.
    fn txn_candidate(
        &self,
        from: Option<&[u8]>,
        forward: bool,
        inclusive: bool,
    ) -> Option<Vec<u8>> {
        let key_type = self.db.inner().config().key_type;
        let name = self.name();
        let mut best: Option<Vec<u8>> = None;

        self.db.env().txns.for_each_live(|txn| {
            if !txn.is_active() {
                return;
            }
            let candidate = txn.with_tree(name, |tree| {
                let candidate = match (from, forward) {
                    (None, true) => tree.first_key().cloned(),
                    (None, false) => tree.last_key().cloned(),
                    (Some(key), true) => {
                        if inclusive && tree.touches(key) {
                            Some(crate::txn::tree::TxnKey::new(key.to_vec(), key_type))
                        } else {
                            tree.next_key_after(key).cloned()
                        }
                    }
                    (Some(key), false) => {
                        if inclusive && tree.touches(key) {
                            Some(crate::txn::tree::TxnKey::new(key.to_vec(), key_type))
                        } else {
                            tree.prev_key_before(key).cloned()
                        }
                    }
                };
                candidate.map(|k| k.bytes)
            });
            let Some(Some(candidate)) = candidate else {
                return;
            };
            best = match best.take() {
                None => Some(candidate),
                Some(current) => {
                    let ordering = crate::btree::compare_keys(key_type, &candidate, &current);
                    let replace = if forward {
                        ordering == std::cmp::Ordering::Less
                    } else {
                        ordering == std::cmp::Ordering::Greater
                    };
                    Some(if replace { candidate } else { current })
                }
            };
        });
        best
    }
}

fn nil_cursor() -> eyre::Report {
    typed(StoreError::InvalidParameter, "cursor is not positioned")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseOptions, EnvOptions};
    use crate::db::InsertFlags;
    use crate::error::store_error;
    use crate::Environment;

    fn env() -> Environment {
        Environment::create(EnvOptions::in_memory()).unwrap()
    }

    fn seeded_db(env: &Environment) -> crate::Database {
        let db = env.create_database(1, DatabaseOptions::new()).unwrap();
        for (k, v) in [("aa", "1"), ("bb", "2"), ("cc", "3")] {
            db.insert(None, k.as_bytes(), v.as_bytes()).unwrap();
        }
        db
    }

    #[test]
    fn full_forward_walk() {
        let env = env();
        let db = seeded_db(&env);
        let mut cursor = db.cursor(None).unwrap();

        let mut keys = Vec::new();
        cursor.move_first().unwrap();
        loop {
            keys.push(cursor.get_key().unwrap());
            match cursor.move_next() {
                Ok(()) => {}
                Err(err) => {
                    assert_eq!(store_error(&err), Some(StoreError::KeyNotFound));
                    break;
                }
            }
        }
        assert_eq!(keys, vec![b"aa".to_vec(), b"bb".to_vec(), b"cc".to_vec()]);
    }

    #[test]
    fn full_backward_walk() {
        let env = env();
        let db = seeded_db(&env);
        let mut cursor = db.cursor(None).unwrap();

        let mut keys = Vec::new();
        cursor.move_last().unwrap();
        loop {
            keys.push(cursor.get_key().unwrap());
            match cursor.move_previous() {
                Ok(()) => {}
                Err(err) => {
                    assert_eq!(store_error(&err), Some(StoreError::KeyNotFound));
                    break;
                }
            }
        }
        assert_eq!(keys, vec![b"cc".to_vec(), b"bb".to_vec(), b"aa".to_vec()]);
    }

    #[test]
    fn approximate_matching() {
        let env = env();
        let db = seeded_db(&env);
        let mut cursor = db.cursor(None).unwrap();

        cursor.find(b"b", MatchMode::Gt).unwrap();
        assert_eq!(cursor.get_key().unwrap(), b"bb");

        cursor.find(b"b", MatchMode::Lt).unwrap();
        assert_eq!(cursor.get_key().unwrap(), b"aa");

        cursor.find(b"bb", MatchMode::Geq).unwrap();
        assert_eq!(cursor.get_key().unwrap(), b"bb");

        cursor.find(b"bb", MatchMode::Gt).unwrap();
        assert_eq!(cursor.get_key().unwrap(), b"cc");

        cursor.find(b"bb", MatchMode::Leq).unwrap();
        assert_eq!(cursor.get_key().unwrap(), b"bb");

        let err = cursor.find(b"b", MatchMode::Eq).unwrap_err();
        assert_eq!(store_error(&err), Some(StoreError::KeyNotFound));
    }

    #[test]
    fn approximate_matching_at_the_edges() {
        let env = env();
        let db = seeded_db(&env);
        let mut cursor = db.cursor(None).unwrap();

        let err = cursor.find(b"aa", MatchMode::Lt).unwrap_err();
        assert_eq!(store_error(&err), Some(StoreError::KeyNotFound));

        let err = cursor.find(b"cc", MatchMode::Gt).unwrap_err();
        assert_eq!(store_error(&err), Some(StoreError::KeyNotFound));

        cursor.find(b"zz", MatchMode::Leq).unwrap();
        assert_eq!(cursor.get_key().unwrap(), b"cc");

        cursor.find(b"a", MatchMode::Geq).unwrap();
        assert_eq!(cursor.get_key().unwrap(), b"aa");
    }

    #[test]
    fn get_record_follows_the_cursor() {
        let env = env();
        let db = seeded_db(&env);
        let mut cursor = db.cursor(None).unwrap();

        cursor.find(b"bb", MatchMode::Eq).unwrap();
        assert_eq!(cursor.get_record().unwrap(), b"2");
        assert_eq!(cursor.get_record_size().unwrap(), 1);
    }

    #[test]
    fn duplicate_stepping() {
        let env = env();
        let db = env
            .create_database(1, DatabaseOptions::new().enable_duplicates())
            .unwrap();
        db.insert(None, b"k", b"a").unwrap();
        db.insert_with(None, b"k", b"b", InsertFlags::duplicate())
            .unwrap();
        db.insert_with(None, b"k", b"c", InsertFlags::duplicate())
            .unwrap();
        db.insert(None, b"z", b"end").unwrap();

        let mut cursor = db.cursor(None).unwrap();
        cursor.move_first().unwrap();

        let mut records = Vec::new();
        loop {
            records.push(cursor.get_record().unwrap());
            if cursor.move_next().is_err() {
                break;
            }
        }
        assert_eq!(
            records,
            vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"end".to_vec()]
        );
        assert_eq!(cursor.get_record_count().unwrap(), 1); // on "z"
    }

    #[test]
    fn erase_uncouples_and_next_resumes_in_order() {
        let env = env();
        let db = seeded_db(&env);
        let mut cursor = db.cursor(None).unwrap();

        cursor.find(b"bb", MatchMode::Eq).unwrap();
        cursor.erase().unwrap();
        assert!(cursor.is_nil());

        cursor.move_next().unwrap();
        assert_eq!(cursor.get_key().unwrap(), b"cc");
        assert_eq!(db.find(None, b"bb").unwrap(), None);
    }

    #[test]
    fn erase_single_duplicate_through_cursor() {
        let env = env();
        let db = env
            .create_database(1, DatabaseOptions::new().enable_duplicates())
            .unwrap();
        db.insert(None, b"k", b"a").unwrap();
        db.insert_with(None, b"k", b"b", InsertFlags::duplicate())
            .unwrap();

        let mut cursor = db.cursor(None).unwrap();
        cursor.find(b"k", MatchMode::Eq).unwrap();
        cursor.move_next().unwrap(); // onto duplicate 1
        assert_eq!(cursor.get_record().unwrap(), b"b");
        cursor.erase().unwrap();

        assert_eq!(db.count(None, b"k").unwrap(), 1);
        assert_eq!(db.find(None, b"k").unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn insert_through_cursor_positions_on_the_key() {
        let env = env();
        let db = env.create_database(1, DatabaseOptions::new()).unwrap();
        let mut cursor = db.cursor(None).unwrap();

        cursor
            .insert(b"hello", b"world", InsertFlags::default())
            .unwrap();
        assert_eq!(cursor.get_key().unwrap(), b"hello");
        assert_eq!(cursor.get_record().unwrap(), b"world");
    }

    #[test]
    fn cursor_survives_splits_behind_its_back() {
        let env = env();
        let db = env.create_database(1, DatabaseOptions::new()).unwrap();
        db.insert(None, b"anchor", b"v").unwrap();

        let mut cursor = db.cursor(None).unwrap();
        cursor.find(b"anchor", MatchMode::Eq).unwrap();

        // push enough keys to split the leaf the cursor points into
        for i in 0..500u32 {
            db.insert(None, format!("key-{i:05}").as_bytes(), b"x")
                .unwrap();
        }

        assert_eq!(cursor.get_record().unwrap(), b"v");
    }

    #[test]
    fn pending_transaction_keys_merge_into_the_walk() {
        let env =
            Environment::create(EnvOptions::in_memory().enable_transactions()).unwrap();
        let db = env.create_database(1, DatabaseOptions::new()).unwrap();
        db.insert(None, b"aa", b"1").unwrap();
        db.insert(None, b"cc", b"3").unwrap();

        let txn = env.begin_txn().unwrap();
        db.insert(Some(&txn), b"bb", b"2").unwrap();

        let mut cursor = db.cursor(Some(&txn)).unwrap();
        let mut keys = Vec::new();
        cursor.move_first().unwrap();
        loop {
            keys.push(cursor.get_key().unwrap());
            if cursor.move_next().is_err() {
                break;
            }
        }
        assert_eq!(keys, vec![b"aa".to_vec(), b"bb".to_vec(), b"cc".to_vec()]);

        cursor.find(b"bb", MatchMode::Eq).unwrap();
        assert_eq!(cursor.get_record().unwrap(), b"2");
        drop(cursor);
        txn.abort().unwrap();
    }

    #[test]
    fn pending_erase_skips_keys_during_the_walk() {
        let env =
            Environment::create(EnvOptions::in_memory().enable_transactions()).unwrap();
        let db = env.create_database(1, DatabaseOptions::new()).unwrap();
        for (k, v) in [("aa", "1"), ("bb", "2"), ("cc", "3")] {
            db.insert(None, k.as_bytes(), v.as_bytes()).unwrap();
        }

        let txn = env.begin_txn().unwrap();
        db.erase(Some(&txn), b"bb").unwrap();

        let mut cursor = db.cursor(Some(&txn)).unwrap();
        let mut keys = Vec::new();
        cursor.move_first().unwrap();
        loop {
            keys.push(cursor.get_key().unwrap());
            if cursor.move_next().is_err() {
                break;
            }
        }
        assert_eq!(keys, vec![b"aa".to_vec(), b"cc".to_vec()]);
        drop(cursor);
        txn.abort().unwrap();
    }
}
