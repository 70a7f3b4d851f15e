mod btree_cursor;
mod txn_cursor;

pub use btree_cursor::{BtreeCursorState, BtreePosition, CursorRegistry};
pub use txn_cursor::TxnCursor;

use std::cmp::Ordering;
use std::sync::Arc;

use log::debug;

use crate::{
    db::{Database, DupeLine, TxnKeyState},
    error::{ErrorKind, GroveError},
    flags::*,
    transaction::Transaction,
    types::{pod, GroveResult, Pod},
    utils::{key_repr, HandyRwLock},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorSide {
    None,
    Btree,
    Txn,
}

/// Where a merged seek landed.
struct Hit {
    key: Vec<u8>,
    btree: Option<(u64, usize)>,
    use_txn: bool,
}

/// A position over the merged order of the B+tree and the transaction
/// index. Exactly one side is active at a time (or neither, when nil);
/// on keys present on both sides the transaction side wins for its
/// owner, since it is the newer view.
pub struct Cursor {
    db: Arc<Database>,
    txn: Option<Pod<Transaction>>,

    position: Pod<BtreePosition>,
    txn_cursor: TxnCursor,
    active: CursorSide,

    /// merged duplicate view of the current key, materialized on demand
    dupecache: Vec<DupeLine>,
    dupe_index: usize,

    closed: bool,
}

impl Cursor {
    pub fn new(
        db: Arc<Database>,
        txn: Option<Pod<Transaction>>,
    ) -> GroveResult<Cursor> {
        if let Some(txn) = &txn {
            txn.wl().increment_cursor_refcount();
        }
        let position = pod(BtreePosition::nil());
        db.registry.wl().register(&position);
        Ok(Cursor {
            db,
            txn,
            position,
            txn_cursor: TxnCursor::nil(),
            active: CursorSide::None,
            dupecache: Vec::new(),
            dupe_index: 0,
            closed: false,
        })
    }

    fn reader(&self) -> Option<u64> {
        self.txn.as_ref().map(|t| t.rl().get_id())
    }

    fn txns_enabled(&self) -> GroveResult<bool> {
        Ok(self.db.env()?.config.transactions_enabled())
    }

    /// True when the cursor points nowhere. A cursor whose key was
    /// erased underneath it reads as nil as well.
    pub fn is_nil(&self) -> bool {
        match self.active {
            CursorSide::None => true,
            CursorSide::Btree => self.position.rl().is_nil(),
            CursorSide::Txn => self.txn_cursor.is_nil(),
        }
    }

    // === position plumbing ================================================

    fn couple_btree(&mut self, page: u64, slot: usize) -> GroveResult {
        self.uncouple_btree()?;
        let env = self.db.env()?;
        let page_pod = env.page_manager.wl().fetch_page(page, 0)?;
        page_pod.wl().couple_cursor();
        let mut pos = self.position.wl();
        pos.state = BtreeCursorState::Coupled { page, slot };
        pos.dupe_index = 0;
        Ok(())
    }

    fn uncouple_btree(&mut self) -> GroveResult {
        let coupled_page = {
            let pos = self.position.rl();
            match pos.state {
                BtreeCursorState::Coupled { page, .. } => Some(page),
                _ => None,
            }
        };
        if let Some(page) = coupled_page {
            let env = self.db.env()?;
            let page_pod = env.page_manager.wl().fetch_page(page, 0)?;
            page_pod.wl().uncouple_cursor();
        }
        let mut pos = self.position.wl();
        pos.state = BtreeCursorState::Nil;
        pos.dupe_index = 0;
        Ok(())
    }

    /// Resets the cursor to nil.
    pub fn set_nil(&mut self) -> GroveResult {
        self.uncouple_btree()?;
        self.txn_cursor.set_nil();
        self.active = CursorSide::None;
        self.dupecache.clear();
        self.dupe_index = 0;
        Ok(())
    }

    fn btree_key(&self) -> GroveResult<Option<Vec<u8>>> {
        let state = self.position.rl().state.clone();
        match state {
            BtreeCursorState::Nil => Ok(None),
            BtreeCursorState::Uncoupled { key } => Ok(Some(key)),
            BtreeCursorState::Coupled { page, slot } => {
                let env = self.db.env()?;
                let page_pod = env.page_manager.wl().fetch_page(page, 0)?;
                let p = page_pod.rl();
                let btree = self.db.btree.rl();
                Ok(Some(btree.proxy.key(&p, slot).to_vec()))
            }
        }
    }

    fn current_key(&self) -> GroveResult<Option<Vec<u8>>> {
        match self.active {
            CursorSide::None => Ok(None),
            CursorSide::Btree => self.btree_key(),
            CursorSide::Txn => {
                Ok(self.txn_cursor.key().map(|k| k.to_vec()))
            }
        }
    }

    // === merged seek ======================================================

    /// Finds the next (or previous) visible key of the merged order,
    /// starting strictly after (before) `from`, or from the boundary
    /// when `from` is None. Keys erased by visible pending operations
    /// are skipped, as are keys owned by conflicting transactions.
    fn merged_seek(
        &mut self,
        from: Option<&[u8]>,
        forward: bool,
    ) -> GroveResult<Option<Hit>> {
        let txns = self.txns_enabled()?;
        let mut from_key: Option<Vec<u8>> = from.map(|k| k.to_vec());

        loop {
            // the btree candidate
            let btree_candidate = {
                let mut btree = self.db.btree.wl();
                match &from_key {
                    None => {
                        let leaf = if forward {
                            btree.first_leaf()?
                        } else {
                            btree.last_leaf()?
                        };
                        let p = leaf.rl();
                        let count = btree.proxy.count(&p);
                        if count == 0 {
                            None
                        } else {
                            let slot = if forward { 0 } else { count - 1 };
                            Some((
                                btree.proxy.key(&p, slot).to_vec(),
                                p.get_address(),
                                slot,
                            ))
                        }
                    }
                    Some(k) => {
                        let flags = if forward {
                            FIND_GT_MATCH
                        } else {
                            FIND_LT_MATCH
                        };
                        match btree.find(k, flags) {
                            Ok(outcome) => Some((
                                outcome.key,
                                outcome.page_address,
                                outcome.slot,
                            )),
                            Err(_) => None,
                        }
                    }
                }
            };

            // the txn-index candidate
            let txn_candidate: Option<Vec<u8>> = if txns {
                let index = self.db.txn_index.rl();
                match &from_key {
                    None => {
                        if forward {
                            index.first().map(|n| n.key.clone())
                        } else {
                            index.last().map(|n| n.key.clone())
                        }
                    }
                    Some(k) => {
                        if forward {
                            index.next_after(k).map(|n| n.key.clone())
                        } else {
                            index.prev_before(k).map(|n| n.key.clone())
                        }
                    }
                }
            } else {
                None
            };

            let cmp = self.db.compare();
            let candidate: Vec<u8> = match (&btree_candidate, &txn_candidate)
            {
                (None, None) => return Ok(None),
                (Some((bk, _, _)), None) => bk.clone(),
                (None, Some(tk)) => tk.clone(),
                (Some((bk, _, _)), Some(tk)) => {
                    let ordering = cmp(bk, tk);
                    let take_btree = if forward {
                        ordering != Ordering::Greater
                    } else {
                        ordering != Ordering::Less
                    };
                    if take_btree {
                        bk.clone()
                    } else {
                        tk.clone()
                    }
                }
            };

            let btree_pos = match &btree_candidate {
                Some((bk, page, slot))
                    if cmp(bk, &candidate) == Ordering::Equal =>
                {
                    Some((*page, *slot))
                }
                _ => None,
            };

            if !txns {
                return Ok(Some(Hit {
                    key: candidate,
                    btree: btree_pos,
                    use_txn: false,
                }));
            }

            match self.db.txn_key_state(&candidate, self.reader())? {
                TxnKeyState::Record(_) | TxnKeyState::Duplicates => {
                    return Ok(Some(Hit {
                        key: candidate,
                        btree: btree_pos,
                        use_txn: true,
                    }));
                }
                TxnKeyState::UseBtree => {
                    if btree_pos.is_some() {
                        return Ok(Some(Hit {
                            key: candidate,
                            btree: btree_pos,
                            use_txn: false,
                        }));
                    }
                    // a node holding only nops or flushed ops; step over
                    from_key = Some(candidate);
                }
                TxnKeyState::Erased | TxnKeyState::Conflict => {
                    from_key = Some(candidate);
                }
            }
        }
    }

    fn position_at(&mut self, hit: Hit, backward: bool) -> GroveResult {
        match hit.btree {
            Some((page, slot)) => self.couple_btree(page, slot)?,
            None => self.uncouple_btree()?,
        }
        if hit.use_txn {
            self.txn_cursor.couple_to(&hit.key);
            self.active = CursorSide::Txn;
        } else {
            self.txn_cursor.set_nil();
            self.active = CursorSide::Btree;
        }

        self.rebuild_dupecache(&hit.key)?;
        self.dupe_index = if backward && !self.dupecache.is_empty() {
            self.dupecache.len() - 1
        } else {
            0
        };
        Ok(())
    }

    /// Materializes the merged duplicate view when the key has more than
    /// one visible record.
    fn rebuild_dupecache(&mut self, key: &[u8]) -> GroveResult {
        self.dupecache.clear();
        self.dupe_index = 0;

        if self.txns_enabled()? {
            let lines = self.db.build_dupe_list(key, self.reader())?;
            if lines.len() > 1 {
                self.dupecache = lines;
            }
            return Ok(());
        }

        let mut btree = self.db.btree.wl();
        if let Ok(outcome) = btree.find(key, 0) {
            let count = btree.duplicate_count(&outcome.record)?;
            if count > 1 {
                self.dupecache =
                    (0..count).map(DupeLine::Btree).collect();
            }
        }
        Ok(())
    }

    // === the public operations ============================================

    /// Positions the cursor on `key`, or on an approximate neighbor when
    /// the LT/GT/LEQ/GEQ flags allow it. Both layers are searched and
    /// the closer match wins; a key pending in another active
    /// transaction fails with `TxnConflict`.
    pub fn find(&mut self, key: &[u8], flags: u32) -> GroveResult {
        let txns = self.txns_enabled()?;
        let want_exact = flags & FIND_EXACT_MATCH != 0
            || flags & (FIND_LT_MATCH | FIND_GT_MATCH) == 0;
        let want_lt = flags & FIND_LT_MATCH != 0;
        let want_gt = flags & FIND_GT_MATCH != 0;

        if txns {
            if want_exact {
                match self.db.txn_key_state(key, self.reader())? {
                    TxnKeyState::Conflict => {
                        return Err(GroveError::new(
                            ErrorKind::TxnConflict,
                            "the key is modified by another active transaction",
                        ));
                    }
                    TxnKeyState::Record(_) | TxnKeyState::Duplicates => {
                        let btree_pos = {
                            let mut btree = self.db.btree.wl();
                            btree
                                .find(key, 0)
                                .ok()
                                .map(|o| (o.page_address, o.slot))
                        };
                        return self.position_at(
                            Hit {
                                key: key.to_vec(),
                                btree: btree_pos,
                                use_txn: true,
                            },
                            false,
                        );
                    }
                    TxnKeyState::UseBtree => {
                        let outcome = {
                            let mut btree = self.db.btree.wl();
                            btree.find(key, 0)
                        };
                        if let Ok(outcome) = outcome {
                            return self.position_at(
                                Hit {
                                    key: outcome.key,
                                    btree: Some((
                                        outcome.page_address,
                                        outcome.slot,
                                    )),
                                    use_txn: false,
                                },
                                false,
                            );
                        }
                    }
                    TxnKeyState::Erased => {}
                }
            }

            // approximate matching: the lower neighbor is preferred when
            // both directions are allowed
            if want_lt {
                if let Some(hit) = self.merged_seek(Some(key), false)? {
                    return self.position_at(hit, false);
                }
            }
            if want_gt {
                if let Some(hit) = self.merged_seek(Some(key), true)? {
                    return self.position_at(hit, false);
                }
            }
            debug!("cursor find: key {} not found", key_repr(key));
            return Err(GroveError::key_not_found());
        }

        let outcome = {
            let mut btree = self.db.btree.wl();
            btree.find(key, flags)?
        };
        self.position_at(
            Hit {
                key: outcome.key,
                btree: Some((outcome.page_address, outcome.slot)),
                use_txn: false,
            },
            false,
        )
    }

    /// Moves the cursor: first/last/next/previous, duplicate-aware.
    pub fn move_cursor(
        &mut self,
        flags: u32,
    ) -> GroveResult<(Vec<u8>, Vec<u8>)> {
        let skip_duplicates = flags & SKIP_DUPLICATES != 0;

        if flags & CURSOR_FIRST != 0 {
            match self.merged_seek(None, true)? {
                Some(hit) => self.position_at(hit, false)?,
                None => return Err(GroveError::key_not_found()),
            }
        } else if flags & CURSOR_LAST != 0 {
            match self.merged_seek(None, false)? {
                Some(hit) => self.position_at(hit, true)?,
                None => return Err(GroveError::key_not_found()),
            }
        } else if flags & CURSOR_NEXT != 0 {
            if self.is_nil() {
                return self.move_cursor(CURSOR_FIRST | (flags & SKIP_DUPLICATES));
            }
            if !skip_duplicates
                && !self.dupecache.is_empty()
                && self.dupe_index + 1 < self.dupecache.len()
            {
                self.dupe_index += 1;
            } else {
                let current = self
                    .current_key()?
                    .ok_or_else(|| GroveError::new(ErrorKind::CursorIsNil, "cursor is nil"))?;
                match self.merged_seek(Some(&current), true)? {
                    Some(hit) => self.position_at(hit, false)?,
                    None => return Err(GroveError::key_not_found()),
                }
            }
        } else if flags & CURSOR_PREVIOUS != 0 {
            if self.is_nil() {
                return self.move_cursor(CURSOR_LAST | (flags & SKIP_DUPLICATES));
            }
            if !skip_duplicates
                && !self.dupecache.is_empty()
                && self.dupe_index > 0
            {
                self.dupe_index -= 1;
            } else {
                let current = self
                    .current_key()?
                    .ok_or_else(|| GroveError::new(ErrorKind::CursorIsNil, "cursor is nil"))?;
                match self.merged_seek(Some(&current), false)? {
                    Some(hit) => self.position_at(hit, true)?,
                    None => return Err(GroveError::key_not_found()),
                }
            }
        } else {
            return Err(GroveError::inv_parameter(
                "no cursor direction flag was given",
            ));
        }

        self.get_key_and_record()
    }

    /// The current key and record; `CursorIsNil` when unpositioned.
    pub fn get_key_and_record(&self) -> GroveResult<(Vec<u8>, Vec<u8>)> {
        let key = self.current_key()?.ok_or_else(|| {
            GroveError::new(ErrorKind::CursorIsNil, "cursor is nil")
        })?;

        if !self.dupecache.is_empty() {
            let line = &self.dupecache[self.dupe_index];
            let record = self.db.resolve_dupe_line(&key, line)?;
            return Ok((key, record));
        }

        if self.active == CursorSide::Txn {
            match self.db.txn_key_state(&key, self.reader())? {
                TxnKeyState::Record(record) => return Ok((key, record)),
                TxnKeyState::Duplicates => {
                    let lines =
                        self.db.build_dupe_list(&key, self.reader())?;
                    let line = lines
                        .into_iter()
                        .next()
                        .ok_or_else(GroveError::key_not_found)?;
                    let record = self.db.resolve_dupe_line(&key, &line)?;
                    return Ok((key, record));
                }
                TxnKeyState::Conflict => {
                    return Err(GroveError::new(
                        ErrorKind::TxnConflict,
                        "the key is modified by another active transaction",
                    ));
                }
                TxnKeyState::Erased => {
                    return Err(GroveError::key_not_found());
                }
                TxnKeyState::UseBtree => {}
            }
        }

        // the btree side
        let state = self.position.rl().state.clone();
        let btree = self.db.btree.rl();
        match state {
            BtreeCursorState::Coupled { page, slot } => {
                let env = self.db.env()?;
                let page_pod = env.page_manager.wl().fetch_page(page, 0)?;
                let desc = {
                    let p = page_pod.rl();
                    btree.proxy.record(&p, slot)
                };
                let record = btree.read_record(&desc, None)?;
                Ok((key, record))
            }
            _ => {
                drop(btree);
                let outcome = self.db.btree.wl().find(&key, 0)?;
                let record =
                    self.db.btree.rl().read_record(&outcome.record, None)?;
                Ok((key, record))
            }
        }
    }

    /// Inserts through the cursor; afterwards the cursor is coupled to
    /// the just-touched position.
    pub fn insert(
        &mut self,
        key: &[u8],
        record: &[u8],
        flags: u32,
    ) -> GroveResult<Vec<u8>> {
        let dupe_position = if self.dupecache.is_empty() {
            -1
        } else {
            self.dupe_index as i32
        };
        let stored_key = self.db.insert_at(
            self.txn.as_ref(),
            key,
            record,
            flags,
            dupe_position,
        )?;

        // couple to the new position
        if self.txn.is_some() {
            self.uncouple_btree()?;
            self.txn_cursor.couple_to(&stored_key);
            self.active = CursorSide::Txn;
        } else {
            let outcome = {
                let mut btree = self.db.btree.wl();
                btree.find(&stored_key, 0)
            };
            if let Ok(outcome) = outcome {
                self.couple_btree(outcome.page_address, outcome.slot)?;
                self.txn_cursor.set_nil();
                self.active = CursorSide::Btree;
            }
        }

        let old_index = self.dupe_index;
        self.rebuild_dupecache(&stored_key)?;
        if !self.dupecache.is_empty() {
            self.dupe_index = if flags & DUPLICATE_INSERT_FIRST != 0 {
                0
            } else if flags & DUPLICATE_INSERT_BEFORE != 0 {
                old_index.min(self.dupecache.len() - 1)
            } else if flags & DUPLICATE_INSERT_AFTER != 0 {
                (old_index + 1).min(self.dupecache.len() - 1)
            } else {
                self.dupecache.len() - 1
            };
        }
        Ok(stored_key)
    }

    /// Overwrites the current record (or the current duplicate), keeping
    /// every coupled cursor on this key at its duplicate index.
    pub fn overwrite(&mut self, record: &[u8]) -> GroveResult {
        let key = self.current_key()?.ok_or_else(|| {
            GroveError::new(ErrorKind::CursorIsNil, "cursor is nil")
        })?;

        if let Some(txn) = self.txn.clone() {
            let dupe = if self.dupecache.is_empty() {
                -1
            } else {
                self.dupe_index as i32
            };
            self.db
                .insert_txn(&txn, &key, record, OVERWRITE, dupe)?;
        } else {
            let env = self.db.env()?;
            if self.dupecache.len() > 1 {
                self.db.btree.wl().overwrite_duplicate(
                    &key,
                    self.dupe_index as u32,
                    record,
                )?;
            } else {
                self.db.btree.wl().insert(&key, record, OVERWRITE, 0)?;
            }
            env.after_operation()?;
        }

        let index = self.dupe_index;
        self.rebuild_dupecache(&key)?;
        self.dupe_index = index.min(self.dupecache.len().saturating_sub(1));
        Ok(())
    }

    /// Erases the current duplicate (or the whole key when there is only
    /// one record). The cursor is nil afterwards.
    pub fn erase(&mut self, _flags: u32) -> GroveResult {
        let key = self.current_key()?.ok_or_else(|| {
            GroveError::new(ErrorKind::CursorIsNil, "cursor is nil")
        })?;

        let dupe = if self.dupecache.len() > 1 {
            Some(self.dupe_index as u32)
        } else {
            None
        };

        if let Some(txn) = self.txn.clone() {
            self.db.erase_txn(&txn, &key, dupe)?;
        } else {
            let env = self.db.env()?;
            self.db.btree.wl().erase(&key, dupe)?;
            env.after_operation()?;
        }

        if dupe.is_none() {
            self.db.registry.wl().nil_on_key(&key, self.db.compare());
        }
        self.set_nil()
    }

    pub fn get_record_size(&self) -> GroveResult<u64> {
        let (_, record) = self.get_key_and_record()?;
        Ok(record.len() as u64)
    }

    /// The number of records the current key holds in the merged view.
    pub fn get_duplicate_count(&self) -> GroveResult<u32> {
        let key = self.current_key()?.ok_or_else(|| {
            GroveError::new(ErrorKind::CursorIsNil, "cursor is nil")
        })?;
        if !self.dupecache.is_empty() {
            return Ok(self.dupecache.len() as u32);
        }
        if self.txns_enabled()? {
            let lines = self.db.build_dupe_list(&key, self.reader())?;
            return Ok(lines.len().max(1) as u32);
        }
        let mut btree = self.db.btree.wl();
        let outcome = btree.find(&key, 0)?;
        btree.duplicate_count(&outcome.record)
    }

    pub fn get_duplicate_position(&self) -> GroveResult<u32> {
        if self.is_nil() {
            return Err(GroveError::new(
                ErrorKind::CursorIsNil,
                "cursor is nil",
            ));
        }
        Ok(self.dupe_index as u32)
    }

    /// Deep-copies the position; the clone holds its own transaction
    /// reference.
    pub fn clone_cursor(&self) -> GroveResult<Cursor> {
        if let Some(txn) = &self.txn {
            txn.wl().increment_cursor_refcount();
        }

        let state = self.position.rl().state.clone();
        if let BtreeCursorState::Coupled { page, .. } = &state {
            let env = self.db.env()?;
            let page_pod = env.page_manager.wl().fetch_page(*page, 0)?;
            page_pod.wl().couple_cursor();
        }
        let position = pod(BtreePosition {
            state,
            dupe_index: self.position.rl().dupe_index,
        });
        self.db.registry.wl().register(&position);

        let mut txn_cursor = TxnCursor::nil();
        if let Some(key) = self.txn_cursor.key() {
            txn_cursor.couple_to(key);
        }

        Ok(Cursor {
            db: self.db.clone(),
            txn: self.txn.clone(),
            position,
            txn_cursor,
            active: self.active,
            dupecache: self.dupecache.clone(),
            dupe_index: self.dupe_index,
            closed: false,
        })
    }

    pub fn close(&mut self) -> GroveResult {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.uncouple_btree()?;
        self.db.registry.wl().unregister(&self.position);
        if let Some(txn) = &self.txn {
            txn.wl().decrement_cursor_refcount();
        }
        Ok(())
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
