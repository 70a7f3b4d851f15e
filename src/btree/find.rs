use log::debug;

use crate::{
    error::GroveError,
    flags::{FIND_EXACT_MATCH, FIND_GT_MATCH, FIND_LT_MATCH},
    page::{Page, PageType},
    types::{GroveResult, Pod},
    utils::{key_repr, HandyRwLock},
};

use super::{node::RecordDescriptor, BtreeIndex};

/// Whether an approximate find landed on the requested key, its lower
/// neighbor or its greater neighbor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApproxMatch {
    Exact,
    Lower,
    Greater,
}

#[derive(Debug, Clone)]
pub struct FindOutcome {
    pub page_address: u64,
    pub slot: usize,
    pub approx: ApproxMatch,
    pub key: Vec<u8>,
    pub record: RecordDescriptor,
}

impl BtreeIndex {
    /// Lookup with optional approximate matching. Without any of the
    /// LT/GT bits only an exact hit succeeds; with them, the nearest
    /// neighbor in the allowed direction is returned, crossing leaf
    /// boundaries via the sibling links when necessary. When both
    /// directions are allowed the in-page neighbor wins before a page
    /// boundary is crossed.
    pub fn find(&mut self, key: &[u8], flags: u32) -> GroveResult<FindOutcome> {
        let outcome = self.find_impl(key, flags);
        match &outcome {
            Ok(found) => {
                self.statistics.find_succeeded(found.page_address);
            }
            Err(_) => self.statistics.find_failed(),
        }
        outcome
    }

    fn find_impl(&mut self, key: &[u8], flags: u32) -> GroveResult<FindOutcome> {
        let hints = self.statistics.get_find_hints(flags);

        // the last leaf page touched by five consecutive finds becomes a
        // fast-track starting point
        let mut leaf = None;
        if let Some(address) = hints.leaf_page {
            if let Some(page) = self.try_fast_track(address, key)? {
                leaf = Some(page);
            }
        }
        let leaf = match leaf {
            Some(page) => page,
            None => self.descend(key)?.0,
        };

        let want_exact =
            flags & FIND_EXACT_MATCH != 0 || flags & (FIND_LT_MATCH | FIND_GT_MATCH) == 0;
        let want_lt = flags & FIND_LT_MATCH != 0;
        let want_gt = flags & FIND_GT_MATCH != 0;

        let (count, search) = {
            let p = leaf.rl();
            (self.proxy.count(&p), self.proxy.search(&p, key, self.cmp))
        };

        match search {
            Ok(slot) => {
                if want_exact {
                    return self.outcome_at(&leaf, slot, ApproxMatch::Exact);
                }
                // exclusive match: step to the requested neighbor
                if want_lt {
                    return self.lower_neighbor(&leaf, slot);
                }
                debug_assert!(want_gt);
                self.greater_neighbor(&leaf, slot + 1, count)
            }
            Err(pos) => {
                if !want_lt && !want_gt {
                    debug!("key {} not found", key_repr(key));
                    return Err(GroveError::key_not_found());
                }
                // pos is the first slot whose key is greater
                if want_lt && want_gt {
                    if pos > 0 {
                        return self.outcome_at(&leaf, pos - 1, ApproxMatch::Lower);
                    }
                    if pos < count {
                        return self.outcome_at(&leaf, pos, ApproxMatch::Greater);
                    }
                    // empty leaf: try both directions, lower side first
                    return self
                        .lower_neighbor(&leaf, 0)
                        .or_else(|_| self.greater_neighbor(&leaf, pos, count));
                }
                if want_lt {
                    return self.lower_neighbor(&leaf, pos);
                }
                self.greater_neighbor(&leaf, pos, count)
            }
        }
    }

    /// The greatest key strictly below slot `slot` of `leaf`, crossing to
    /// the left sibling when the slot is the first of its page.
    fn lower_neighbor(
        &self,
        leaf: &Pod<Page>,
        slot: usize,
    ) -> GroveResult<FindOutcome> {
        if slot > 0 {
            return self.outcome_at(leaf, slot - 1, ApproxMatch::Lower);
        }
        let mut address = leaf.rl().get_address();
        loop {
            let left = {
                let p = self.fetch(address)?;
                let left = self.proxy.left(&p.rl());
                left
            };
            if left == 0 {
                return Err(GroveError::key_not_found());
            }
            let page = self.fetch(left)?;
            let count = self.proxy.count(&page.rl());
            if count > 0 {
                return self.outcome_at(&page, count - 1, ApproxMatch::Lower);
            }
            address = left;
        }
    }

    /// The smallest key at or above slot `pos`, crossing to the right
    /// sibling when `pos` runs past the page.
    fn greater_neighbor(
        &self,
        leaf: &Pod<Page>,
        pos: usize,
        count: usize,
    ) -> GroveResult<FindOutcome> {
        if pos < count {
            return self.outcome_at(leaf, pos, ApproxMatch::Greater);
        }
        let mut address = leaf.rl().get_address();
        loop {
            let right = {
                let p = self.fetch(address)?;
                let right = self.proxy.right(&p.rl());
                right
            };
            if right == 0 {
                return Err(GroveError::key_not_found());
            }
            let page = self.fetch(right)?;
            let count = self.proxy.count(&page.rl());
            if count > 0 {
                return self.outcome_at(&page, 0, ApproxMatch::Greater);
            }
            address = right;
        }
    }

    fn outcome_at(
        &self,
        page: &Pod<Page>,
        slot: usize,
        approx: ApproxMatch,
    ) -> GroveResult<FindOutcome> {
        let p = page.rl();
        Ok(FindOutcome {
            page_address: p.get_address(),
            slot,
            approx,
            key: self.proxy.key(&p, slot).to_vec(),
            record: self.proxy.record(&p, slot),
        })
    }

    /// Checks whether the hinted leaf still covers `key`; a stale hint
    /// falls back to the regular descent.
    fn try_fast_track(
        &self,
        address: u64,
        key: &[u8],
    ) -> GroveResult<Option<Pod<Page>>> {
        let page = match self.page_manager.wl().fetch_page(address, 0) {
            Ok(page) => page,
            Err(_) => return Ok(None),
        };
        let usable = {
            let p = page.rl();
            let page_type = p.get_type();
            (page_type == PageType::BtreeLeaf || page_type == PageType::BtreeRoot)
                && self.proxy.is_leaf(&p)
                && self.covers(&p, key)
        };
        Ok(if usable { Some(page) } else { None })
    }

    /// True when `key` falls into the closed key range of the leaf (or
    /// beyond its bounds on a boundary leaf).
    fn covers(&self, p: &Page, key: &[u8]) -> bool {
        let count = self.proxy.count(p);
        if count == 0 {
            return false;
        }
        let first = self.proxy.key(p, 0);
        let last = self.proxy.key(p, count - 1);
        let above_first = self.proxy.left(p) == 0
            || (self.cmp)(key, first) != std::cmp::Ordering::Less;
        let below_last = self.proxy.right(p) == 0
            || (self.cmp)(key, last) != std::cmp::Ordering::Greater;
        above_first && below_last
    }
}
