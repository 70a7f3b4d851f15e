pub mod index;

pub use index::{
    TransactionIndex, TransactionNode, TransactionOperation, TXN_OP_ERASE,
    TXN_OP_FLUSHED, TXN_OP_INSERT, TXN_OP_INSERT_DUPLICATE,
    TXN_OP_INSERT_OVERWRITE, TXN_OP_NOP,
};

use log::debug;

use crate::{
    error::{ErrorKind, GroveError},
    types::{pod, GroveResult, Pod},
    utils::HandyRwLock,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

/// Locates one operation of a transaction inside some database's
/// transaction index.
#[derive(Clone)]
pub struct OpHandle {
    pub db_name: u16,
    pub key: Vec<u8>,
    pub seq: u64,
}

pub struct Transaction {
    id: u64,
    name: Option<String>,
    state: TxnState,

    /// A transaction with coupled cursors may neither commit nor abort.
    cursor_refcount: u32,

    /// Chronological list of this transaction's operations.
    ops: Vec<OpHandle>,
}

impl Transaction {
    pub fn get_id(&self) -> u64 {
        self.id
    }

    pub fn get_name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn get_state(&self) -> TxnState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == TxnState::Active
    }

    pub fn is_committed(&self) -> bool {
        self.state == TxnState::Committed
    }

    pub fn is_aborted(&self) -> bool {
        self.state == TxnState::Aborted
    }

    pub(crate) fn set_state(&mut self, state: TxnState) {
        self.state = state;
    }

    pub fn get_cursor_refcount(&self) -> u32 {
        self.cursor_refcount
    }

    pub(crate) fn increment_cursor_refcount(&mut self) {
        self.cursor_refcount += 1;
    }

    pub(crate) fn decrement_cursor_refcount(&mut self) {
        debug_assert!(self.cursor_refcount > 0);
        self.cursor_refcount -= 1;
    }

    pub(crate) fn add_op(&mut self, handle: OpHandle) {
        self.ops.push(handle);
    }

    pub(crate) fn take_ops(&mut self) -> Vec<OpHandle> {
        std::mem::replace(&mut self.ops, Vec::new())
    }

    /// Guard shared by commit and abort.
    pub(crate) fn check_may_close(&self) -> GroveResult {
        if self.cursor_refcount > 0 {
            return Err(GroveError::new(
                ErrorKind::CursorStillOpen,
                "transaction still has attached cursors",
            ));
        }
        if !self.is_active() {
            return Err(GroveError::inv_parameter(
                "transaction was already committed or aborted",
            ));
        }
        Ok(())
    }
}

/// The global transaction list, oldest first. Committed transactions are
/// flushed in id order; a transaction flushes only when every older one
/// has flushed (the environment drives that loop).
pub struct TxnManager {
    txns: Vec<Pod<Transaction>>,
    next_txn_id: u64,
    next_op_seq: u64,
}

impl TxnManager {
    pub fn new() -> Self {
        Self {
            txns: Vec::new(),
            next_txn_id: 1,
            next_op_seq: 1,
        }
    }

    pub fn begin(&mut self, name: Option<String>) -> Pod<Transaction> {
        let id = self.next_txn_id;
        self.next_txn_id += 1;
        let txn = pod(Transaction {
            id,
            name,
            state: TxnState::Active,
            cursor_refcount: 0,
            ops: Vec::new(),
        });
        self.txns.push(txn.clone());
        debug!("began transaction {}", id);
        txn
    }

    pub fn next_op_seq(&mut self) -> u64 {
        let seq = self.next_op_seq;
        self.next_op_seq += 1;
        seq
    }

    pub fn get(&self, id: u64) -> Option<Pod<Transaction>> {
        self.txns
            .iter()
            .find(|t| t.rl().get_id() == id)
            .cloned()
    }

    /// The visibility state of a transaction by id. Ids that already left
    /// the list were fully flushed, which reads like committed.
    pub fn state_of(&self, id: u64) -> TxnState {
        match self.get(id) {
            Some(txn) => txn.rl().get_state(),
            None => TxnState::Committed,
        }
    }

    pub fn oldest(&self) -> Option<Pod<Transaction>> {
        self.txns.first().cloned()
    }

    pub fn remove(&mut self, id: u64) {
        self.txns.retain(|t| t.rl().get_id() != id);
    }

    pub fn active_count(&self) -> usize {
        self.txns.iter().filter(|t| t.rl().is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.txns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic() {
        let mut mgr = TxnManager::new();
        let a = mgr.begin(None);
        let b = mgr.begin(Some("named".to_string()));
        assert!(a.rl().get_id() < b.rl().get_id());
        assert_eq!(b.rl().get_name(), Some("named"));
    }

    #[test]
    fn test_state_of_unknown_id_reads_committed() {
        let mgr = TxnManager::new();
        assert_eq!(mgr.state_of(42), TxnState::Committed);
    }

    #[test]
    fn test_cursor_refcount_blocks_close() {
        let mut mgr = TxnManager::new();
        let txn = mgr.begin(None);
        txn.wl().increment_cursor_refcount();
        assert_eq!(
            txn.rl().check_may_close().unwrap_err().kind(),
            ErrorKind::CursorStillOpen
        );
        txn.wl().decrement_cursor_refcount();
        assert!(txn.rl().check_may_close().is_ok());
    }

    #[test]
    fn test_oldest_first() {
        let mut mgr = TxnManager::new();
        let a = mgr.begin(None);
        let _b = mgr.begin(None);
        assert_eq!(
            mgr.oldest().unwrap().rl().get_id(),
            a.rl().get_id()
        );
        mgr.remove(a.rl().get_id());
        assert_eq!(mgr.len(), 1);
    }
}
