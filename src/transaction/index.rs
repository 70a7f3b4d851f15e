use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;

use crate::{
    btree::{ApproxMatch, CompareFn},
    flags::{FIND_EXACT_MATCH, FIND_GT_MATCH, FIND_LT_MATCH},
};

// operation kinds; FLUSHED is or-ed in once the op has been replayed
// into the btree
pub const TXN_OP_INSERT: u32 = 1;
pub const TXN_OP_INSERT_OVERWRITE: u32 = 2;
pub const TXN_OP_INSERT_DUPLICATE: u32 = 4;
pub const TXN_OP_ERASE: u32 = 8;
pub const TXN_OP_NOP: u32 = 16;
pub const TXN_OP_FLUSHED: u32 = 0x1000_0000;

const TXN_OP_KIND_MASK: u32 = 0xff;

/// A key wrapper carrying the database's comparator so the standard
/// ordered map can sort by it. The comparator is a plain function
/// pointer, so every key of one index orders consistently.
#[derive(Clone)]
#[derive(Debug)]
pub struct IndexKey {
    pub data: Vec<u8>,
    cmp: CompareFn,
}

impl IndexKey {
    fn new(data: Vec<u8>, cmp: CompareFn) -> Self {
        Self { data, cmp }
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        (self.cmp)(&self.data, &other.data) == Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.cmp)(&self.data, &other.data)
    }
}

/// One pending operation of a transaction on one key.
#[derive(Clone, Debug)]
pub struct TransactionOperation {
    pub seq: u64,
    pub txn_id: u64,
    pub flags: u32,
    pub orig_flags: u32,
    pub lsn: u64,
    pub record: Option<Vec<u8>>,
    /// duplicate index this op refers to; -1 = the whole key
    pub referenced_dupe: i32,
}

impl TransactionOperation {
    pub fn kind(&self) -> u32 {
        self.flags & TXN_OP_KIND_MASK
    }

    pub fn is_flushed(&self) -> bool {
        self.flags & TXN_OP_FLUSHED != 0
    }

    pub fn is_erase(&self) -> bool {
        self.kind() == TXN_OP_ERASE
    }

    pub fn is_insert(&self) -> bool {
        self.kind() & (TXN_OP_INSERT
            | TXN_OP_INSERT_OVERWRITE
            | TXN_OP_INSERT_DUPLICATE)
            != 0
    }

    pub fn is_nop(&self) -> bool {
        self.kind() == TXN_OP_NOP
    }
}

/// All pending operations on one key, oldest first. The node disappears
/// when its list becomes empty.
#[derive(Debug)]
pub struct TransactionNode {
    pub key: Vec<u8>,
    pub ops: Vec<TransactionOperation>,
}

impl TransactionNode {
    pub fn newest(&self) -> Option<&TransactionOperation> {
        self.ops.last()
    }

    /// Ops newest to oldest, the order visibility scans run in.
    pub fn ops_newest_first(
        &self,
    ) -> impl Iterator<Item = &TransactionOperation> {
        self.ops.iter().rev()
    }
}

/// The in-memory ordered index of per-key operation lists layered over
/// the B+tree of one database. Lookups support the same approximate
/// match semantics as the btree.
#[derive(Debug)]
pub struct TransactionIndex {
    nodes: BTreeMap<IndexKey, TransactionNode>,
    cmp: CompareFn,
}

impl TransactionIndex {
    pub fn new(cmp: CompareFn) -> Self {
        Self {
            nodes: BTreeMap::new(),
            cmp,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    fn wrap(&self, key: &[u8]) -> IndexKey {
        IndexKey::new(key.to_vec(), self.cmp)
    }

    pub fn get(&self, key: &[u8]) -> Option<&TransactionNode> {
        self.nodes.get(&self.wrap(key))
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut TransactionNode> {
        self.nodes.get_mut(&self.wrap(key))
    }

    pub fn get_or_create(&mut self, key: &[u8]) -> &mut TransactionNode {
        let wrapped = self.wrap(key);
        self.nodes
            .entry(wrapped)
            .or_insert_with(|| TransactionNode {
                key: key.to_vec(),
                ops: Vec::new(),
            })
    }

    pub fn remove(&mut self, key: &[u8]) {
        self.nodes.remove(&self.wrap(key));
    }

    /// Approximate lookup with the btree's LT/GT/LEQ/GEQ semantics.
    pub fn get_approx(
        &self,
        key: &[u8],
        flags: u32,
    ) -> Option<(&TransactionNode, ApproxMatch)> {
        let wrapped = self.wrap(key);
        let want_exact = flags & FIND_EXACT_MATCH != 0
            || flags & (FIND_LT_MATCH | FIND_GT_MATCH) == 0;
        let want_lt = flags & FIND_LT_MATCH != 0;
        let want_gt = flags & FIND_GT_MATCH != 0;

        if want_exact {
            if let Some(node) = self.nodes.get(&wrapped) {
                return Some((node, ApproxMatch::Exact));
            }
        }
        if want_lt {
            if let Some((_, node)) = self
                .nodes
                .range((Bound::Unbounded, Bound::Excluded(wrapped.clone())))
                .next_back()
            {
                return Some((node, ApproxMatch::Lower));
            }
        }
        if want_gt {
            if let Some((_, node)) = self
                .nodes
                .range((Bound::Excluded(wrapped), Bound::Unbounded))
                .next()
            {
                return Some((node, ApproxMatch::Greater));
            }
        }
        None
    }

    pub fn first(&self) -> Option<&TransactionNode> {
        self.nodes.values().next()
    }

    pub fn last(&self) -> Option<&TransactionNode> {
        self.nodes.values().next_back()
    }

    /// The smallest node strictly greater than `key`.
    pub fn next_after(&self, key: &[u8]) -> Option<&TransactionNode> {
        let wrapped = self.wrap(key);
        self.nodes
            .range((Bound::Excluded(wrapped), Bound::Unbounded))
            .next()
            .map(|(_, node)| node)
    }

    /// The greatest node strictly less than `key`.
    pub fn prev_before(&self, key: &[u8]) -> Option<&TransactionNode> {
        let wrapped = self.wrap(key);
        self.nodes
            .range((Bound::Unbounded, Bound::Excluded(wrapped)))
            .next_back()
            .map(|(_, node)| node)
    }

    /// Appends an operation to the key's chronological list.
    pub fn append(
        &mut self,
        key: &[u8],
        op: TransactionOperation,
    ) -> u64 {
        let seq = op.seq;
        let node = self.get_or_create(key);
        node.ops.push(op);
        seq
    }

    pub fn mark_flushed(&mut self, key: &[u8], seq: u64) {
        if let Some(node) = self.get_mut(key) {
            if let Some(op) = node.ops.iter_mut().find(|op| op.seq == seq) {
                op.flags |= TXN_OP_FLUSHED;
            }
        }
    }

    /// Removes one operation; drops the node once its list is empty.
    pub fn remove_op(&mut self, key: &[u8], seq: u64) {
        let empty = match self.get_mut(key) {
            Some(node) => {
                node.ops.retain(|op| op.seq != seq);
                node.ops.is_empty()
            }
            None => false,
        };
        if empty {
            self.remove(key);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &TransactionNode> {
        self.nodes.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary_cmp(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn op(seq: u64, txn_id: u64, flags: u32) -> TransactionOperation {
        TransactionOperation {
            seq,
            txn_id,
            flags,
            orig_flags: 0,
            lsn: 0,
            record: None,
            referenced_dupe: -1,
        }
    }

    #[test]
    fn test_nodes_are_ordered_by_comparator() {
        let mut index = TransactionIndex::new(binary_cmp);
        index.append(b"bb", op(1, 1, TXN_OP_INSERT));
        index.append(b"aa", op(2, 1, TXN_OP_INSERT));
        index.append(b"cc", op(3, 1, TXN_OP_INSERT));

        assert_eq!(index.first().unwrap().key, b"aa");
        assert_eq!(index.last().unwrap().key, b"cc");
        assert_eq!(index.next_after(b"aa").unwrap().key, b"bb");
        assert_eq!(index.prev_before(b"cc").unwrap().key, b"bb");
        assert!(index.next_after(b"cc").is_none());
    }

    #[test]
    fn test_approx_matching() {
        let mut index = TransactionIndex::new(binary_cmp);
        index.append(b"b", op(1, 1, TXN_OP_INSERT));
        index.append(b"d", op(2, 1, TXN_OP_INSERT));

        let (node, m) = index.get_approx(b"b", 0).unwrap();
        assert_eq!((node.key.as_slice(), m), (&b"b"[..], ApproxMatch::Exact));

        let (node, m) = index.get_approx(b"c", FIND_LT_MATCH).unwrap();
        assert_eq!((node.key.as_slice(), m), (&b"b"[..], ApproxMatch::Lower));

        let (node, m) = index.get_approx(b"c", FIND_GT_MATCH).unwrap();
        assert_eq!(
            (node.key.as_slice(), m),
            (&b"d"[..], ApproxMatch::Greater)
        );

        // exclusive: an exact hit steps over
        let (node, m) = index.get_approx(b"b", FIND_GT_MATCH).unwrap();
        assert_eq!(
            (node.key.as_slice(), m),
            (&b"d"[..], ApproxMatch::Greater)
        );

        assert!(index.get_approx(b"a", FIND_LT_MATCH).is_none());
    }

    #[test]
    fn test_ops_chronological_per_node() {
        let mut index = TransactionIndex::new(binary_cmp);
        index.append(b"k", op(1, 1, TXN_OP_INSERT));
        index.append(b"k", op(2, 2, TXN_OP_ERASE));

        let node = index.get(b"k").unwrap();
        assert_eq!(node.ops.len(), 2);
        assert_eq!(node.newest().unwrap().seq, 2);
        let newest_first: Vec<u64> =
            node.ops_newest_first().map(|o| o.seq).collect();
        assert_eq!(newest_first, vec![2, 1]);
    }

    #[test]
    fn test_remove_op_drops_empty_node() {
        let mut index = TransactionIndex::new(binary_cmp);
        index.append(b"k", op(1, 1, TXN_OP_INSERT));
        index.mark_flushed(b"k", 1);
        assert!(index.get(b"k").unwrap().ops[0].is_flushed());

        index.remove_op(b"k", 1);
        assert!(index.get(b"k").is_none());
        assert!(index.is_empty());
    }
}
