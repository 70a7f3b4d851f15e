use crate::transaction::TransactionIndex;

/// The transaction half of a cursor. Positions are key copies into the
/// transaction index; the ordered map is re-entered by key on every
/// step, so pending operations may come and go without invalidating the
/// cursor.
pub struct TxnCursor {
    key: Option<Vec<u8>>,
}

impl TxnCursor {
    pub fn nil() -> Self {
        Self { key: None }
    }

    pub fn is_nil(&self) -> bool {
        self.key.is_none()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn couple_to(&mut self, key: &[u8]) {
        self.key = Some(key.to_vec());
    }

    pub fn set_nil(&mut self) {
        self.key = None;
    }

    /// The smallest node key, for `first` moves.
    pub fn seek_first(&mut self, index: &TransactionIndex) -> Option<Vec<u8>> {
        let key = index.first().map(|n| n.key.clone());
        self.key = key.clone();
        key
    }

    pub fn seek_last(&mut self, index: &TransactionIndex) -> Option<Vec<u8>> {
        let key = index.last().map(|n| n.key.clone());
        self.key = key.clone();
        key
    }

    pub fn seek_next(
        &mut self,
        index: &TransactionIndex,
        after: &[u8],
    ) -> Option<Vec<u8>> {
        let key = index.next_after(after).map(|n| n.key.clone());
        self.key = key.clone();
        key
    }

    pub fn seek_previous(
        &mut self,
        index: &TransactionIndex,
        before: &[u8],
    ) -> Option<Vec<u8>> {
        let key = index.prev_before(before).map(|n| n.key.clone());
        self.key = key.clone();
        key
    }
}
