use std::cmp::Ordering;
use std::sync::atomic::Ordering as AtomicOrdering;

use log::debug;

use crate::{
    duplicates::{
        DUPE_INSERT_AFTER, DUPE_INSERT_BEFORE, DUPE_INSERT_FIRST,
        DUPE_INSERT_LAST,
    },
    error::{ErrorKind, GroveError},
    flags::{
        DUPLICATE, DUPLICATE_INSERT_AFTER, DUPLICATE_INSERT_BEFORE,
        DUPLICATE_INSERT_FIRST, DUPLICATE_INSERT_LAST, HINT_APPEND,
        HINT_PREPEND, OVERWRITE,
    },
    page::{Page, PageType},
    page_manager::ALLOC_CLEAR_WITH_ZERO,
    types::{GroveResult, Pod},
    utils::{key_repr, HandyRwLock},
};

use super::{
    node::RecordDescriptor, stats::BTREE_SMO_SPLIT, BtreeIndex, DescentStep,
};

#[derive(Debug, Clone)]
pub struct InsertOutcome {
    pub page_address: u64,
    pub slot: usize,
    pub dupe_index: Option<u32>,
}

impl BtreeIndex {
    /// Inserts (or updates) a key/record pair. `dupe_position` is the
    /// reference index for the duplicate BEFORE/AFTER position flags
    /// (supplied by a coupled cursor, 0 otherwise).
    pub fn insert(
        &mut self,
        key: &[u8],
        record: &[u8],
        flags: u32,
        dupe_position: u32,
    ) -> GroveResult<InsertOutcome> {
        if key.len() > self.key_size {
            self.statistics.insert_failed();
            return Err(GroveError::new(
                ErrorKind::InvKeySize,
                &format!(
                    "key of {} bytes exceeds the maximum of {}",
                    key.len(),
                    self.key_size
                ),
            ));
        }

        let outcome = self.insert_impl(key, record, flags, dupe_position);
        if outcome.is_err() {
            self.statistics.insert_failed();
        }
        outcome
    }

    fn insert_impl(
        &mut self,
        key: &[u8],
        record: &[u8],
        flags: u32,
        dupe_position: u32,
    ) -> GroveResult<InsertOutcome> {
        let hints = self.statistics.get_insert_hints(flags);

        // append/prepend and hot-page fast tracks; all of them only when
        // the target leaf has room, so no split (and no parent path) is
        // needed
        if let Some(leaf) = self.fast_track_leaf(key, &hints.flags, hints.leaf_page)? {
            return self.insert_into_leaf(&leaf, key, record, flags, dupe_position);
        }

        let (leaf, mut path) = self.descend(key)?;

        let (full, existing) = {
            let p = leaf.rl();
            let count = self.proxy.count(&p);
            (
                count >= self.proxy.leaf_capacity(),
                self.proxy.search(&p, key, self.cmp).is_ok(),
            )
        };

        if !full || existing {
            return self.insert_into_leaf(&leaf, key, record, flags, dupe_position);
        }

        // the leaf is full: split it (and any full ancestors), then
        // insert into whichever half owns the key
        let append_bias = hints.flags & HINT_APPEND != 0;
        let prepend_bias = hints.flags & HINT_PREPEND != 0;
        let (left, right, promote) =
            self.split_node(&leaf, append_bias, prepend_bias)?;
        self.insert_into_parent(
            &mut path,
            &promote,
            left.rl().get_address(),
            right.rl().get_address(),
        )?;

        let target = if (self.cmp)(key, &promote) != Ordering::Greater {
            left
        } else {
            right
        };
        self.insert_into_leaf(&target, key, record, flags, dupe_position)
    }

    /// Returns a leaf with spare room that certainly owns `key`, or None.
    fn fast_track_leaf(
        &self,
        key: &[u8],
        flags: &u32,
        hinted: Option<u64>,
    ) -> GroveResult<Option<Pod<Page>>> {
        if flags & HINT_APPEND != 0 {
            let leaf = self.last_leaf()?;
            let fits = {
                let p = leaf.rl();
                let count = self.proxy.count(&p);
                count > 0
                    && count < self.proxy.leaf_capacity()
                    && (self.cmp)(key, self.proxy.key(&p, count - 1))
                        == Ordering::Greater
            };
            if fits {
                return Ok(Some(leaf));
            }
        }
        if flags & HINT_PREPEND != 0 {
            let leaf = self.first_leaf()?;
            let fits = {
                let p = leaf.rl();
                let count = self.proxy.count(&p);
                count > 0
                    && count < self.proxy.leaf_capacity()
                    && (self.cmp)(key, self.proxy.key(&p, 0)) == Ordering::Less
            };
            if fits {
                return Ok(Some(leaf));
            }
        }
        if let Some(address) = hinted {
            if let Ok(page) = self.fetch(address) {
                let usable = {
                    let p = page.rl();
                    let page_type = p.get_type();
                    (page_type == PageType::BtreeLeaf
                        || page_type == PageType::BtreeRoot)
                        && self.proxy.is_leaf(&p)
                        && self.proxy.count(&p) < self.proxy.leaf_capacity()
                        && self.leaf_covers_for_insert(&p, key)
                };
                if usable {
                    return Ok(Some(page));
                }
            }
        }
        Ok(None)
    }

    fn leaf_covers_for_insert(&self, p: &Page, key: &[u8]) -> bool {
        let count = self.proxy.count(p);
        if count == 0 {
            return false;
        }
        let above_first = self.proxy.left(p) == 0
            || (self.cmp)(key, self.proxy.key(p, 0)) != Ordering::Less;
        let below_last = self.proxy.right(p) == 0
            || (self.cmp)(key, self.proxy.key(p, count - 1))
                != Ordering::Greater;
        above_first && below_last
    }

    /// The actual slot-level insert; the leaf is guaranteed to have room
    /// for one more entry (unless the key already exists).
    fn insert_into_leaf(
        &mut self,
        leaf: &Pod<Page>,
        key: &[u8],
        record: &[u8],
        flags: u32,
        dupe_position: u32,
    ) -> GroveResult<InsertOutcome> {
        let search = {
            let p = leaf.rl();
            self.proxy.search(&p, key, self.cmp)
        };

        match search {
            Ok(slot) => {
                self.update_existing(leaf, slot, record, flags, dupe_position)
            }
            Err(pos) => {
                let desc = self.make_record(record)?;

                {
                    let mut p = leaf.wl();
                    self.registry.wl().uncouple_all(&mut p, &self.proxy);
                    self.proxy.insert_slot(&mut p, pos);
                    self.proxy.set_key(&mut p, pos, key);
                    self.proxy.set_record(&mut p, pos, &desc);
                }

                let (address, is_append, is_prepend) = {
                    let p = leaf.rl();
                    let count = self.proxy.count(&p);
                    (
                        p.get_address(),
                        self.proxy.right(&p) == 0 && pos == count - 1,
                        self.proxy.left(&p) == 0 && pos == 0,
                    )
                };
                self.statistics
                    .insert_succeeded(address, is_append, is_prepend);

                debug!(
                    "inserted key {} at page {} slot {}",
                    key_repr(key),
                    address,
                    pos
                );
                Ok(InsertOutcome {
                    page_address: address,
                    slot: pos,
                    dupe_index: None,
                })
            }
        }
    }

    /// The key exists: overwrite in place, or extend its duplicate
    /// table.
    fn update_existing(
        &mut self,
        leaf: &Pod<Page>,
        slot: usize,
        record: &[u8],
        flags: u32,
        dupe_position: u32,
    ) -> GroveResult<InsertOutcome> {
        let address = leaf.rl().get_address();
        let old = {
            let p = leaf.rl();
            self.proxy.record(&p, slot)
        };

        if flags & DUPLICATE != 0 {
            let new_desc = self.make_record(record)?;
            let dupe_flags = translate_dupe_flags(flags);

            let (table_id, index) = match old {
                RecordDescriptor::DupTable(id) => {
                    self.dupes.insert(id, new_desc, dupe_position, dupe_flags)?
                }
                existing => {
                    // promote the single record to a duplicate table
                    let entries = if dupe_flags
                        & (DUPE_INSERT_FIRST | DUPE_INSERT_BEFORE)
                        != 0
                    {
                        vec![new_desc, existing]
                    } else {
                        vec![existing, new_desc]
                    };
                    let index = if dupe_flags
                        & (DUPE_INSERT_FIRST | DUPE_INSERT_BEFORE)
                        != 0
                    {
                        0
                    } else {
                        1
                    };
                    (self.dupes.create_table(&entries)?, index)
                }
            };

            {
                let mut p = leaf.wl();
                self.proxy.set_record(
                    &mut p,
                    slot,
                    &RecordDescriptor::DupTable(table_id),
                );
            }
            self.statistics.insert_succeeded(address, false, false);
            return Ok(InsertOutcome {
                page_address: address,
                slot,
                dupe_index: Some(index),
            });
        }

        if flags & OVERWRITE != 0 {
            // try the cheap in-place paths first
            let new_desc = match (&old, RecordDescriptor::inline_from(record))
            {
                (RecordDescriptor::Blob(id), None) => {
                    RecordDescriptor::Blob(
                        self.blob_manager.wl().overwrite(*id, record)?,
                    )
                }
                _ => {
                    self.free_record(&old)?;
                    self.make_record(record)?
                }
            };
            {
                let mut p = leaf.wl();
                self.proxy.set_record(&mut p, slot, &new_desc);
            }
            self.statistics.insert_succeeded(address, false, false);
            return Ok(InsertOutcome {
                page_address: address,
                slot,
                dupe_index: None,
            });
        }

        Err(GroveError::new(
            ErrorKind::DuplicateKey,
            "key already exists",
        ))
    }

    /// Overwrites one duplicate of a key in place; the table keeps its
    /// order, so coupled cursors stay valid at their index.
    pub fn overwrite_duplicate(
        &mut self,
        key: &[u8],
        index: u32,
        record: &[u8],
    ) -> GroveResult<()> {
        let (leaf, _) = self.descend(key)?;
        let slot = {
            let p = leaf.rl();
            self.proxy
                .search(&p, key, self.cmp)
                .map_err(|_| GroveError::key_not_found())?
        };
        let desc = {
            let p = leaf.rl();
            self.proxy.record(&p, slot)
        };

        match desc {
            RecordDescriptor::DupTable(table_id) => {
                let new_desc = self.make_record(record)?;
                let (new_id, _) = self.dupes.insert(
                    table_id,
                    new_desc,
                    index,
                    crate::duplicates::DUPE_OVERWRITE,
                )?;
                let mut p = leaf.wl();
                self.proxy.set_record(
                    &mut p,
                    slot,
                    &RecordDescriptor::DupTable(new_id),
                );
                Ok(())
            }
            _ if index == 0 => self
                .update_existing(&leaf, slot, record, OVERWRITE, 0)
                .map(|_| ()),
            _ => Err(GroveError::key_not_found()),
        }
    }

    /// Splits a node into two and returns (left, right, promoted key).
    /// For leaves the promoted key is the new maximum of the left half;
    /// for internal nodes the pivot slot moves up and its child becomes
    /// the left node's ptr_down.
    pub(crate) fn split_node(
        &mut self,
        page: &Pod<Page>,
        append_bias: bool,
        prepend_bias: bool,
    ) -> GroveResult<(Pod<Page>, Pod<Page>, Vec<u8>)> {
        let is_leaf = {
            let p = page.rl();
            self.proxy.is_leaf(&p)
        };

        let sibling = self.page_manager.wl().alloc_page(
            if is_leaf {
                PageType::BtreeLeaf
            } else {
                PageType::BtreeInternal
            },
            ALLOC_CLEAR_WITH_ZERO,
        )?;

        let promote;
        {
            let mut p = page.wl();
            let mut sib = sibling.wl();
            self.proxy.init(&mut sib, is_leaf);

            self.registry.wl().uncouple_all(&mut p, &self.proxy);

            let count = self.proxy.count(&p);
            debug_assert!(count >= 3);

            // split near the middle, biased toward the end after an
            // append streak and toward the start after a prepend streak
            let pivot = if append_bias {
                count - 1
            } else if prepend_bias {
                2.min(count - 1)
            } else {
                count / 2
            };
            let pivot = pivot.max(1).min(count - 1);

            if is_leaf {
                promote = self.proxy.key(&p, pivot - 1).to_vec();
                self.proxy.copy_slots(&p, pivot, count - pivot, &mut sib, 0);
                self.proxy.set_count(&mut sib, count - pivot);
                self.proxy.set_count(&mut p, pivot);
            } else {
                // the pivot slot moves up; its child becomes the left
                // node's new rightmost child
                let pivot = pivot.min(count - 2).max(1);
                promote = self.proxy.key(&p, pivot).to_vec();
                let pivot_child = self.proxy.child(&p, pivot);

                self.proxy.copy_slots(
                    &p,
                    pivot + 1,
                    count - pivot - 1,
                    &mut sib,
                    0,
                );
                self.proxy.set_count(&mut sib, count - pivot - 1);
                self.proxy.set_ptr_down(&mut sib, self.proxy.ptr_down(&p));

                self.proxy.set_count(&mut p, pivot);
                self.proxy.set_ptr_down(&mut p, pivot_child);
            }

            // link the new node into the sibling chain
            let old_right = self.proxy.right(&p);
            self.proxy.set_right(&mut sib, old_right);
            self.proxy.set_left(&mut sib, p.get_address());
            self.proxy.set_right(&mut p, sib.get_address());
            p.set_dirty(true);
            sib.set_dirty(true);
        }

        // fix the left link of the former right neighbor
        let (sibling_address, old_right) = {
            let sib = sibling.rl();
            (sib.get_address(), self.proxy.right(&sib))
        };
        if old_right != 0 {
            let neighbor = self.fetch(old_right)?;
            let mut n = neighbor.wl();
            self.proxy.set_left(&mut n, sibling_address);
        }

        BTREE_SMO_SPLIT.fetch_add(1, AtomicOrdering::Relaxed);
        debug!(
            "split page {} into {} and {}",
            page.rl().get_address(),
            page.rl().get_address(),
            sibling_address
        );

        Ok((page.clone(), sibling, promote))
    }

    /// Inserts the separator produced by a split into the parent,
    /// splitting ancestors as needed; allocates a new root when the path
    /// is exhausted.
    pub(crate) fn insert_into_parent(
        &mut self,
        path: &mut Vec<DescentStep>,
        promote: &[u8],
        left_address: u64,
        right_address: u64,
    ) -> GroveResult {
        let step = match path.pop() {
            Some(step) => step,
            None => {
                return self.grow_new_root(promote, left_address, right_address);
            }
        };
        let parent = step.page;

        let full = {
            let p = parent.rl();
            self.proxy.count(&p) >= self.proxy.internal_capacity()
        };

        let parent = if full {
            let (left, right, parent_promote) =
                self.split_node(&parent, false, false)?;
            self.insert_into_parent(
                path,
                &parent_promote,
                left.rl().get_address(),
                right.rl().get_address(),
            )?;
            if (self.cmp)(promote, &parent_promote) != Ordering::Greater {
                left
            } else {
                right
            }
        } else {
            parent
        };

        let mut p = parent.wl();
        self.registry.wl().uncouple_all(&mut p, &self.proxy);

        let count = self.proxy.count(&p);
        let pos = match self.proxy.search(&p, promote, self.cmp) {
            Ok(_) => {
                return Err(GroveError::internal(
                    "split separator already exists in the parent",
                ));
            }
            Err(pos) => pos,
        };

        self.proxy.insert_slot(&mut p, pos);
        self.proxy.set_key(&mut p, pos, promote);
        self.proxy.set_child(&mut p, pos, left_address);

        // the slot (or ptr_down) that referenced the split page now
        // covers its right half
        if pos < count {
            self.proxy.set_child(&mut p, pos + 1, right_address);
        } else {
            self.proxy.set_ptr_down(&mut p, right_address);
        }
        Ok(())
    }

    fn grow_new_root(
        &mut self,
        promote: &[u8],
        left_address: u64,
        right_address: u64,
    ) -> GroveResult {
        let root = self
            .page_manager
            .wl()
            .alloc_page(PageType::BtreeRoot, ALLOC_CLEAR_WITH_ZERO)?;
        {
            let mut p = root.wl();
            self.proxy.init(&mut p, false);
            p.set_type(PageType::BtreeRoot);
            self.proxy.insert_slot(&mut p, 0);
            self.proxy.set_key(&mut p, 0, promote);
            self.proxy.set_child(&mut p, 0, left_address);
            self.proxy.set_ptr_down(&mut p, right_address);
        }

        // the old root is a plain node now
        let old_root = self.fetch(left_address)?;
        {
            let mut p = old_root.wl();
            let t = if self.proxy.is_leaf(&p) {
                PageType::BtreeLeaf
            } else {
                PageType::BtreeInternal
            };
            p.set_type(t);
            p.set_dirty(true);
        }

        let address = root.rl().get_address();
        debug!("grew a new root page {}", address);
        self.set_root_address(address)
    }
}

fn translate_dupe_flags(flags: u32) -> u32 {
    let mut out = 0;
    if flags & DUPLICATE_INSERT_BEFORE != 0 {
        out |= DUPE_INSERT_BEFORE;
    }
    if flags & DUPLICATE_INSERT_AFTER != 0 {
        out |= DUPE_INSERT_AFTER;
    }
    if flags & DUPLICATE_INSERT_FIRST != 0 {
        out |= DUPE_INSERT_FIRST;
    }
    if flags & DUPLICATE_INSERT_LAST != 0 {
        out |= DUPE_INSERT_LAST;
    }
    out
}
