use std::sync::{RwLock, Weak};

use crate::{
    btree::{node::NodeProxy, CompareFn},
    page::Page,
    types::Pod,
    utils::HandyRwLock,
};

/// Where the btree half of a cursor points.
///
/// A coupled position pins a (page, slot) pair and stays valid as long
/// as the page is not structurally modified; before any such
/// modification the tree uncouples every cursor on the page into a key
/// copy. A nil position points nowhere.
#[derive(Clone, Debug, PartialEq)]
pub enum BtreeCursorState {
    Nil,
    Coupled { page: u64, slot: usize },
    Uncoupled { key: Vec<u8> },
}

#[derive(Debug)]
pub struct BtreePosition {
    pub state: BtreeCursorState,
    /// btree-side duplicate index, adjusted when duplicates are erased
    pub dupe_index: u32,
}

impl BtreePosition {
    pub fn nil() -> Self {
        Self {
            state: BtreeCursorState::Nil,
            dupe_index: 0,
        }
    }

    pub fn is_nil(&self) -> bool {
        self.state == BtreeCursorState::Nil
    }

    pub fn is_coupled_to(&self, page: u64) -> bool {
        matches!(self.state, BtreeCursorState::Coupled { page: p, .. } if p == page)
    }
}

/// Every open cursor's btree position, weakly referenced. The tree asks
/// the registry to uncouple everything on a page before it restructures
/// that page, so no cursor is ever left pointing into moved slots.
#[derive(Debug)]
pub struct CursorRegistry {
    positions: Vec<Weak<RwLock<BtreePosition>>>,
}

impl CursorRegistry {
    pub fn new() -> Self {
        Self {
            positions: Vec::new(),
        }
    }

    pub fn register(&mut self, position: &Pod<BtreePosition>) {
        self.positions.retain(|w| w.upgrade().is_some());
        self.positions.push(std::sync::Arc::downgrade(position));
    }

    pub fn unregister(&mut self, position: &Pod<BtreePosition>) {
        self.positions.retain(|w| match w.upgrade() {
            Some(p) => !std::sync::Arc::ptr_eq(&p, position),
            None => false,
        });
    }

    /// Converts every position coupled to `page` into an uncoupled key
    /// copy. Called with the page already locked, right before slots
    /// move.
    pub fn uncouple_all(&mut self, page: &mut Page, proxy: &NodeProxy) {
        let address = page.get_address();
        for weak in &self.positions {
            let position = match weak.upgrade() {
                Some(p) => p,
                None => continue,
            };
            let mut pos = position.wl();
            if let BtreeCursorState::Coupled { page: p, slot } = pos.state {
                if p != address {
                    continue;
                }
                let key = proxy.key(page, slot).to_vec();
                pos.state = BtreeCursorState::Uncoupled { key };
                page.uncouple_cursor();
            }
        }
    }

    /// Sets every uncoupled position standing on `key` to nil; used
    /// after the key was fully erased.
    pub fn nil_on_key(&mut self, key: &[u8], cmp: CompareFn) {
        for weak in &self.positions {
            let position = match weak.upgrade() {
                Some(p) => p,
                None => continue,
            };
            let mut pos = position.wl();
            let matches = match &pos.state {
                BtreeCursorState::Uncoupled { key: k } => {
                    cmp(k, key) == std::cmp::Ordering::Equal
                }
                _ => false,
            };
            if matches {
                pos.state = BtreeCursorState::Nil;
                pos.dupe_index = 0;
            }
        }
    }

    /// A duplicate was erased: cursors standing on the same duplicate go
    /// nil, cursors on a later one slide down by one.
    pub fn adjust_duplicates(
        &mut self,
        page: &mut Page,
        slot: usize,
        key: &[u8],
        cmp: CompareFn,
        erased_index: u32,
    ) {
        let address = page.get_address();
        for weak in &self.positions {
            let position = match weak.upgrade() {
                Some(p) => p,
                None => continue,
            };
            let mut pos = position.wl();
            let (matches, coupled) = match &pos.state {
                BtreeCursorState::Coupled { page: p, slot: s } => {
                    (*p == address && *s == slot, true)
                }
                BtreeCursorState::Uncoupled { key: k } => {
                    (cmp(k, key) == std::cmp::Ordering::Equal, false)
                }
                BtreeCursorState::Nil => (false, false),
            };
            if !matches {
                continue;
            }
            if pos.dupe_index == erased_index {
                if coupled {
                    page.uncouple_cursor();
                }
                pos.state = BtreeCursorState::Nil;
                pos.dupe_index = 0;
            } else if pos.dupe_index > erased_index {
                pos.dupe_index -= 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.positions
            .iter()
            .filter(|w| w.upgrade().is_some())
            .count()
    }
}
