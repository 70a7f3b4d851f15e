use std::sync::atomic::Ordering as AtomicOrdering;

use log::debug;

use crate::{
    error::GroveError,
    page::{Page, PageType},
    types::{GroveResult, Pod},
    utils::{key_repr, HandyRwLock},
};

use super::{
    node::RecordDescriptor,
    stats::{BTREE_SMO_MERGE, BTREE_SMO_SHIFT},
    BtreeIndex, DescentStep,
};

/// only shift if at least this many keys can be moved
const SHIFT_THRESHOLD: usize = 50;

/// pages smaller than this always equalize, regardless of the threshold
const SHIFT_SMALL_PAGE: usize = 20;

enum Rebalanced {
    Merged,
    Done,
}

impl BtreeIndex {
    /// Erases a key, one of its duplicates (`dupe_index`), or the whole
    /// entry, rebalancing the tree on the way back up.
    pub fn erase(
        &mut self,
        key: &[u8],
        dupe_index: Option<u32>,
    ) -> GroveResult {
        let result = self.erase_impl(key, dupe_index);
        match &result {
            Ok(leaf) => self.statistics.erase_succeeded(*leaf),
            Err(_) => self.statistics.erase_failed(),
        }
        result.map(|_| ())
    }

    fn erase_impl(
        &mut self,
        key: &[u8],
        dupe_index: Option<u32>,
    ) -> GroveResult<u64> {
        let (leaf, path) = self.descend(key)?;
        let leaf_address = leaf.rl().get_address();

        let slot = {
            let p = leaf.rl();
            match self.proxy.search(&p, key, self.cmp) {
                Ok(slot) => slot,
                Err(_) => {
                    debug!("erase: key {} not found", key_repr(key));
                    return Err(GroveError::key_not_found());
                }
            }
        };

        let desc = {
            let p = leaf.rl();
            self.proxy.record(&p, slot)
        };

        // only a single duplicate is erased, and others remain: no
        // structural change at all
        if let (Some(index), RecordDescriptor::DupTable(table_id)) =
            (dupe_index, &desc)
        {
            {
                let mut p = leaf.wl();
                self.registry.wl().adjust_duplicates(
                    &mut p, slot, key, self.cmp, index,
                );
            }
            let new_table = self.dupes.erase(*table_id, index, false)?;
            if new_table != 0 {
                let mut p = leaf.wl();
                self.proxy.set_record(
                    &mut p,
                    slot,
                    &RecordDescriptor::DupTable(new_table),
                );
                return Ok(leaf_address);
            }
            // the table is gone; fall through and remove the key
        } else {
            self.free_record(&desc)?;
        }

        {
            let mut p = leaf.wl();
            self.registry.wl().uncouple_all(&mut p, &self.proxy);
            self.proxy.remove_slot(&mut p, slot);
        }
        debug!(
            "erased key {} from page {} slot {}",
            key_repr(key),
            leaf_address,
            slot
        );

        self.rebalance_path(leaf, path)?;
        Ok(leaf_address)
    }

    /// Walks the recorded descent path from the leaf upward and
    /// re-establishes the fill invariants.
    fn rebalance_path(
        &mut self,
        node: Pod<Page>,
        mut path: Vec<DescentStep>,
    ) -> GroveResult {
        let mut node = node;
        loop {
            let step = match path.pop() {
                None => return self.maybe_collapse_root(&node),
                Some(step) => step,
            };

            let underflow = {
                let p = node.rl();
                let capacity = self.proxy.capacity(&p);
                self.proxy.count(&p) < capacity / 2
            };
            if !underflow {
                return Ok(());
            }

            match self.rebalance_node(&node, &step)? {
                Rebalanced::Merged => {
                    // the parent lost a slot; it may underflow as well
                    node = step.page;
                }
                Rebalanced::Done => return Ok(()),
            }
        }
    }

    /// An internal root without separators has a single child left; the
    /// child is promoted and the old root page freed.
    fn maybe_collapse_root(&mut self, root: &Pod<Page>) -> GroveResult {
        let (collapse, child, address) = {
            let p = root.rl();
            (
                !self.proxy.is_leaf(&p) && self.proxy.count(&p) == 0,
                self.proxy.ptr_down(&p),
                p.get_address(),
            )
        };
        if !collapse {
            return Ok(());
        }

        {
            let mut p = root.wl();
            self.registry.wl().uncouple_all(&mut p, &self.proxy);
        }
        self.statistics.reset_page(address);
        self.page_manager.wl().add_to_free_map(address, 1);

        let new_root = self.fetch(child)?;
        {
            let mut p = new_root.wl();
            p.set_type(PageType::BtreeRoot);
            p.set_dirty(true);
        }
        debug!("collapsed root {} into {}", address, child);
        self.set_root_address(child)
    }

    /// Merges or shifts an underflowing node with one of its siblings,
    /// reached through the parent recorded in `step`.
    fn rebalance_node(
        &mut self,
        node: &Pod<Page>,
        step: &DescentStep,
    ) -> GroveResult<Rebalanced> {
        let parent = &step.page;
        let c = step.child_index;
        let (parent_count, is_leaf_level) = {
            let p = parent.rl();
            (self.proxy.count(&p), {
                let n = node.rl();
                self.proxy.is_leaf(&n)
            })
        };

        let capacity = if is_leaf_level {
            self.proxy.leaf_capacity()
        } else {
            self.proxy.internal_capacity()
        };
        // an internal merge pulls the separator down into an extra slot
        let merge_overhead = if is_leaf_level { 0 } else { 1 };

        let node_count = self.proxy.count(&node.rl());

        // the right neighbor, when the node is not the ptr_down child
        if c < parent_count {
            let right = self.child_at(parent, c + 1)?;
            let right_count = self.proxy.count(&right.rl());
            if node_count + right_count + merge_overhead <= capacity {
                self.merge_right(parent, c, node, &right)?;
                return Ok(Rebalanced::Merged);
            }
        }

        // the left neighbor
        if c > 0 {
            let left = self.child_at(parent, c - 1)?;
            let left_count = self.proxy.count(&left.rl());
            if left_count + node_count + merge_overhead <= capacity {
                self.merge_right(parent, c - 1, &left, node)?;
                return Ok(Rebalanced::Merged);
            }
        }

        // no merge possible: equalize with the richer neighbor, unless
        // both pages are large and the gain would be marginal
        let left = if c > 0 {
            Some(self.child_at(parent, c - 1)?)
        } else {
            None
        };
        let right = if c < parent_count {
            Some(self.child_at(parent, c + 1)?)
        } else {
            None
        };

        let left_count =
            left.as_ref().map(|p| self.proxy.count(&p.rl())).unwrap_or(0);
        let right_count = right
            .as_ref()
            .map(|p| self.proxy.count(&p.rl()))
            .unwrap_or(0);

        let (sibling, from_right) = if right_count >= left_count {
            match right {
                Some(r) => (r, true),
                None => match left {
                    Some(l) => (l, false),
                    None => return Ok(Rebalanced::Done),
                },
            }
        } else {
            (left.unwrap(), false)
        };

        let sibling_count = self.proxy.count(&sibling.rl());
        if sibling_count <= node_count {
            return Ok(Rebalanced::Done);
        }
        let diff = sibling_count - node_count;

        // do not shift if both pages have (nearly) equal size; too much
        // effort for too little gain
        if node_count > SHIFT_SMALL_PAGE
            && sibling_count > SHIFT_SMALL_PAGE
            && diff < SHIFT_THRESHOLD
        {
            return Ok(Rebalanced::Done);
        }

        let moves = diff / 2;
        if moves == 0 {
            return Ok(Rebalanced::Done);
        }

        let sep = if from_right { c } else { c - 1 };
        for _ in 0..moves {
            if from_right {
                self.rotate_from_right(parent, sep)?;
            } else {
                self.rotate_from_left(parent, sep)?;
            }
        }

        BTREE_SMO_SHIFT.fetch_add(1, AtomicOrdering::Relaxed);
        Ok(Rebalanced::Done)
    }

    /// The child at `index` of an internal page; `index == count` is the
    /// ptr_down child.
    fn child_at(
        &self,
        parent: &Pod<Page>,
        index: usize,
    ) -> GroveResult<Pod<Page>> {
        let address = {
            let p = parent.rl();
            if index < self.proxy.count(&p) {
                self.proxy.child(&p, index)
            } else {
                self.proxy.ptr_down(&p)
            }
        };
        self.fetch(address)
    }

    /// Merges the child at `sep + 1` into the child at `sep`; the
    /// separator key at `sep` is removed from (or pulled down out of)
    /// the parent.
    fn merge_right(
        &mut self,
        parent: &Pod<Page>,
        sep: usize,
        a: &Pod<Page>,
        b: &Pod<Page>,
    ) -> GroveResult {
        let (a_address, b_address) =
            (a.rl().get_address(), b.rl().get_address());

        {
            let mut pa = a.wl();
            let mut pb = b.wl();
            let mut pp = parent.wl();
            self.registry.wl().uncouple_all(&mut pa, &self.proxy);
            self.registry.wl().uncouple_all(&mut pb, &self.proxy);
            self.registry.wl().uncouple_all(&mut pp, &self.proxy);

            let a_count = self.proxy.count(&pa);
            let b_count = self.proxy.count(&pb);
            let is_leaf = self.proxy.is_leaf(&pa);

            if !is_leaf {
                // pull the separator down; it bounds the old ptr_down
                // subtree of the left node
                let sep_key = self.proxy.key(&pp, sep).to_vec();
                self.proxy.insert_slot(&mut pa, a_count);
                self.proxy.set_key(&mut pa, a_count, &sep_key);
                let ptr_down = self.proxy.ptr_down(&pa);
                self.proxy.set_child(&mut pa, a_count, ptr_down);
                self.proxy.set_ptr_down(&mut pa, self.proxy.ptr_down(&pb));
            }

            let a_count = self.proxy.count(&pa);
            self.proxy.copy_slots(&pb, 0, b_count, &mut pa, a_count);
            self.proxy.set_count(&mut pa, a_count + b_count);

            // unlink b from the sibling chain
            let b_right = self.proxy.right(&pb);
            self.proxy.set_right(&mut pa, b_right);

            // drop the separator; the entry that referenced b now
            // references the merged node
            let parent_count = self.proxy.count(&pp);
            self.proxy.remove_slot(&mut pp, sep);
            if sep < parent_count - 1 {
                self.proxy.set_child(&mut pp, sep, a_address);
            } else {
                self.proxy.set_ptr_down(&mut pp, a_address);
            }
        }

        let b_right = {
            let pa = a.rl();
            self.proxy.right(&pa)
        };
        if b_right != 0 {
            let neighbor = self.fetch(b_right)?;
            self.proxy.set_left(&mut neighbor.wl(), a_address);
        }

        self.statistics.reset_page(b_address);
        self.page_manager.wl().add_to_free_map(b_address, 1);

        BTREE_SMO_MERGE.fetch_add(1, AtomicOrdering::Relaxed);
        debug!("merged page {} into {}", b_address, a_address);
        Ok(())
    }

    /// Moves one entry from the child right of separator `sep` to the
    /// child left of it.
    fn rotate_from_right(
        &mut self,
        parent: &Pod<Page>,
        sep: usize,
    ) -> GroveResult {
        let a = self.child_at(parent, sep)?;
        let b = self.child_at(parent, sep + 1)?;

        let mut pa = a.wl();
        let mut pb = b.wl();
        let mut pp = parent.wl();
        self.registry.wl().uncouple_all(&mut pa, &self.proxy);
        self.registry.wl().uncouple_all(&mut pb, &self.proxy);
        self.registry.wl().uncouple_all(&mut pp, &self.proxy);

        let a_count = self.proxy.count(&pa);

        if self.proxy.is_leaf(&pa) {
            let key = self.proxy.key(&pb, 0).to_vec();
            let record = self.proxy.record(&pb, 0);
            self.proxy.insert_slot(&mut pa, a_count);
            self.proxy.set_key(&mut pa, a_count, &key);
            self.proxy.set_record(&mut pa, a_count, &record);
            self.proxy.remove_slot(&mut pb, 0);
            self.proxy.set_key(&mut pp, sep, &key);
        } else {
            // the separator comes down over the left node's ptr_down,
            // the right node's first child takes its place
            let sep_key = self.proxy.key(&pp, sep).to_vec();
            self.proxy.insert_slot(&mut pa, a_count);
            self.proxy.set_key(&mut pa, a_count, &sep_key);
            let ptr_down = self.proxy.ptr_down(&pa);
            self.proxy.set_child(&mut pa, a_count, ptr_down);
            self.proxy.set_ptr_down(&mut pa, self.proxy.child(&pb, 0));
            let new_sep = self.proxy.key(&pb, 0).to_vec();
            self.proxy.set_key(&mut pp, sep, &new_sep);
            self.proxy.remove_slot(&mut pb, 0);
        }
        Ok(())
    }

    /// Moves one entry from the child left of separator `sep` to the
    /// child right of it.
    fn rotate_from_left(
        &mut self,
        parent: &Pod<Page>,
        sep: usize,
    ) -> GroveResult {
        let a = self.child_at(parent, sep)?;
        let b = self.child_at(parent, sep + 1)?;

        let mut pa = a.wl();
        let mut pb = b.wl();
        let mut pp = parent.wl();
        self.registry.wl().uncouple_all(&mut pa, &self.proxy);
        self.registry.wl().uncouple_all(&mut pb, &self.proxy);
        self.registry.wl().uncouple_all(&mut pp, &self.proxy);

        let a_count = self.proxy.count(&pa);
        debug_assert!(a_count > 0);

        if self.proxy.is_leaf(&pa) {
            let key = self.proxy.key(&pa, a_count - 1).to_vec();
            let record = self.proxy.record(&pa, a_count - 1);
            self.proxy.insert_slot(&mut pb, 0);
            self.proxy.set_key(&mut pb, 0, &key);
            self.proxy.set_record(&mut pb, 0, &record);
            self.proxy.remove_slot(&mut pa, a_count - 1);
            let new_sep = self.proxy.key(&pa, a_count - 2).to_vec();
            self.proxy.set_key(&mut pp, sep, &new_sep);
        } else {
            let sep_key = self.proxy.key(&pp, sep).to_vec();
            self.proxy.insert_slot(&mut pb, 0);
            self.proxy.set_key(&mut pb, 0, &sep_key);
            let ptr_down = self.proxy.ptr_down(&pa);
            self.proxy.set_child(&mut pb, 0, ptr_down);
            let last_key = self.proxy.key(&pa, a_count - 1).to_vec();
            let last_child = self.proxy.child(&pa, a_count - 1);
            self.proxy.set_ptr_down(&mut pa, last_child);
            self.proxy.set_key(&mut pp, sep, &last_key);
            self.proxy.remove_slot(&mut pa, a_count - 1);
        }
        Ok(())
    }
}
