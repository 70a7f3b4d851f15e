use std::cmp::Ordering;
use std::convert::TryInto;
use std::sync::{Arc, RwLock, Weak};

use log::debug;

use crate::{
    btree::{BtreeIndex, CompareFn},
    cursor::{Cursor, CursorRegistry},
    env::{DbDescriptor, Environment},
    error::{ErrorKind, GroveError},
    flags::*,
    transaction::{
        index::{
            TransactionOperation, TXN_OP_ERASE, TXN_OP_INSERT,
            TXN_OP_INSERT_DUPLICATE, TXN_OP_INSERT_OVERWRITE,
        },
        OpHandle, Transaction, TransactionIndex, TxnState,
    },
    types::{pod, GroveResult, Pod},
    utils::{key_repr, HandyRwLock},
};

/// The key types a database can be created with. Numeric types compare
/// by value; binary keys compare bytewise; custom keys through a caller
/// supplied function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum KeyType {
    Binary = 0,
    Custom = 1,
    UInt32 = 3,
    UInt64 = 5,
    Real32 = 7,
    Real64 = 8,
}

impl KeyType {
    pub fn from_u16(value: u16) -> KeyType {
        match value {
            1 => KeyType::Custom,
            3 => KeyType::UInt32,
            5 => KeyType::UInt64,
            7 => KeyType::Real32,
            8 => KeyType::Real64,
            _ => KeyType::Binary,
        }
    }

    /// The fixed key width, for types that have one.
    pub fn fixed_width(&self) -> Option<usize> {
        match self {
            KeyType::UInt32 | KeyType::Real32 => Some(4),
            KeyType::UInt64 | KeyType::Real64 => Some(8),
            _ => None,
        }
    }
}

pub fn binary_compare(lhs: &[u8], rhs: &[u8]) -> Ordering {
    lhs.cmp(rhs)
}

fn uint32_compare(lhs: &[u8], rhs: &[u8]) -> Ordering {
    let l = u32::from_le_bytes(lhs.try_into().unwrap_or([0; 4]));
    let r = u32::from_le_bytes(rhs.try_into().unwrap_or([0; 4]));
    l.cmp(&r)
}

fn uint64_compare(lhs: &[u8], rhs: &[u8]) -> Ordering {
    let l = u64::from_le_bytes(lhs.try_into().unwrap_or([0; 8]));
    let r = u64::from_le_bytes(rhs.try_into().unwrap_or([0; 8]));
    l.cmp(&r)
}

fn real32_compare(lhs: &[u8], rhs: &[u8]) -> Ordering {
    let l = f32::from_le_bytes(lhs.try_into().unwrap_or([0; 4]));
    let r = f32::from_le_bytes(rhs.try_into().unwrap_or([0; 4]));
    l.partial_cmp(&r).unwrap_or(Ordering::Equal)
}

fn real64_compare(lhs: &[u8], rhs: &[u8]) -> Ordering {
    let l = f64::from_le_bytes(lhs.try_into().unwrap_or([0; 8]));
    let r = f64::from_le_bytes(rhs.try_into().unwrap_or([0; 8]));
    l.partial_cmp(&r).unwrap_or(Ordering::Equal)
}

pub fn compare_fn_for(
    key_type: KeyType,
    custom: Option<CompareFn>,
) -> CompareFn {
    match key_type {
        KeyType::Binary => binary_compare,
        KeyType::UInt32 => uint32_compare,
        KeyType::UInt64 => uint64_compare,
        KeyType::Real32 => real32_compare,
        KeyType::Real64 => real64_compare,
        KeyType::Custom => custom.unwrap_or(binary_compare),
    }
}

/// What the transaction layer knows about one key, seen by one reader.
pub(crate) enum TxnKeyState {
    /// no decisive pending operation; the btree decides
    UseBtree,
    /// another still-active transaction touched the key
    Conflict,
    Erased,
    Record(Vec<u8>),
    /// the pending ops affect duplicates; a merged view is required
    Duplicates,
}

/// A single entry of the merged duplicate view of one key.
#[derive(Clone, Debug)]
pub(crate) enum DupeLine {
    /// index into the btree-side duplicate list
    Btree(u32),
    /// record carried by a pending transaction operation
    Txn(Option<Vec<u8>>),
}

/// One logically independent database inside an environment: an ordered
/// key/value store with optional duplicates, layered under the
/// transaction index when transactions are enabled.
#[derive(Debug)]
pub struct Database {
    pub name: u16,
    pub flags: u32,
    key_type: KeyType,
    descriptor_index: usize,

    env: Weak<Environment>,
    self_ref: Weak<Database>,

    pub(crate) btree: Pod<BtreeIndex>,
    pub(crate) txn_index: Pod<TransactionIndex>,
    pub(crate) registry: Pod<CursorRegistry>,

    /// most recently assigned record number
    recno: RwLock<u64>,
}

impl Database {
    pub(crate) fn bootstrap(
        env: &Arc<Environment>,
        descriptor_index: usize,
        descriptor: DbDescriptor,
        custom_compare: Option<CompareFn>,
        create: bool,
    ) -> GroveResult<Arc<Database>> {
        let key_type = KeyType::from_u16(descriptor.key_type);
        let cmp = compare_fn_for(key_type, custom_compare);
        let registry = pod(CursorRegistry::new());

        let rec_size = if descriptor.rec_size == u32::MAX {
            None
        } else {
            Some(descriptor.rec_size)
        };

        let btree = pod(BtreeIndex::new(
            descriptor.name,
            descriptor_index,
            descriptor.key_size as usize,
            rec_size,
            descriptor.root,
            cmp,
            env.page_manager.clone(),
            env.blob_manager.clone(),
            env.header.clone(),
            registry.clone(),
        ));
        if create {
            btree.wl().create()?;
        }

        Ok(Arc::new_cyclic(|self_ref| Database {
            name: descriptor.name,
            flags: descriptor.flags,
            key_type,
            descriptor_index,
            env: Arc::downgrade(env),
            self_ref: self_ref.clone(),
            btree,
            txn_index: pod(TransactionIndex::new(cmp)),
            registry,
            recno: RwLock::new(descriptor.recno),
        }))
    }

    pub(crate) fn env(&self) -> GroveResult<Arc<Environment>> {
        self.env.upgrade().ok_or_else(|| {
            GroveError::inv_parameter("the environment was already closed")
        })
    }

    fn arc(&self) -> GroveResult<Arc<Database>> {
        self.self_ref.upgrade().ok_or_else(|| {
            GroveError::internal("the database handle is gone")
        })
    }

    pub fn get_key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn is_record_number(&self) -> bool {
        self.flags & (DB_RECORD_NUMBER32 | DB_RECORD_NUMBER64) != 0
    }

    pub fn duplicates_enabled(&self) -> bool {
        self.flags & DB_ENABLE_DUPLICATE_KEYS != 0
    }

    pub(crate) fn compare(&self) -> CompareFn {
        self.btree.rl().cmp
    }

    fn check_writable(&self) -> GroveResult {
        let env = self.env()?;
        if env.get_flags() & ENV_READ_ONLY != 0 {
            return Err(GroveError::new(
                ErrorKind::WriteProtected,
                "the environment is read-only",
            ));
        }
        Ok(())
    }

    fn validate_key(&self, key: &[u8]) -> GroveResult {
        if let Some(width) = self.key_type.fixed_width() {
            if key.len() != width {
                return Err(GroveError::new(
                    ErrorKind::InvKeySize,
                    &format!(
                        "keys of this type are exactly {} bytes",
                        width
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Assigns the next record number when the caller passed an empty
    /// key; explicit keys advance the counter. Keys are big-endian so
    /// their byte order matches their numeric order.
    fn prepare_recno_key(&self, key: &[u8]) -> GroveResult<Vec<u8>> {
        let width = if self.flags & DB_RECORD_NUMBER32 != 0 {
            4
        } else {
            8
        };
        let max = if width == 4 {
            u32::MAX as u64
        } else {
            u64::MAX
        };

        if key.is_empty() {
            let mut recno = self.recno.wl();
            if *recno >= max {
                return Err(GroveError::new(
                    ErrorKind::LimitsReached,
                    "the record number counter is exhausted",
                ));
            }
            *recno += 1;
            let assigned = *recno;
            drop(recno);
            self.persist_recno(assigned)?;
            return Ok(if width == 4 {
                (assigned as u32).to_be_bytes().to_vec()
            } else {
                assigned.to_be_bytes().to_vec()
            });
        }

        if key.len() != width {
            return Err(GroveError::new(
                ErrorKind::InvKeySize,
                "record number keys have a fixed width",
            ));
        }
        let value = if width == 4 {
            u32::from_be_bytes(key.try_into().unwrap()) as u64
        } else {
            u64::from_be_bytes(key.try_into().unwrap())
        };
        {
            let mut recno = self.recno.wl();
            if value > *recno {
                *recno = value;
            }
        }
        self.persist_recno(value.max(*self.recno.rl()))?;
        Ok(key.to_vec())
    }

    fn persist_recno(&self, value: u64) -> GroveResult {
        let env = self.env()?;
        env.header.wl().set_recno(self.descriptor_index, value);
        Ok(())
    }

    pub fn get_recno(&self) -> u64 {
        *self.recno.rl()
    }

    // === the public operations ============================================

    /// Inserts a key/record pair; returns the key actually stored (the
    /// assigned number for record-number databases).
    pub fn insert(
        &self,
        txn: Option<&Pod<Transaction>>,
        key: &[u8],
        record: &[u8],
        flags: u32,
    ) -> GroveResult<Vec<u8>> {
        self.insert_at(txn, key, record, flags, -1)
    }

    /// Like `insert`, with the cursor's duplicate position for the
    /// BEFORE/AFTER duplicate placement flags.
    pub(crate) fn insert_at(
        &self,
        txn: Option<&Pod<Transaction>>,
        key: &[u8],
        record: &[u8],
        flags: u32,
        dupe_position: i32,
    ) -> GroveResult<Vec<u8>> {
        self.check_writable()?;
        if flags & DUPLICATE != 0 && !self.duplicates_enabled() {
            return Err(GroveError::inv_parameter(
                "the database was not created with duplicate support",
            ));
        }
        if flags & DUPLICATE != 0 && flags & OVERWRITE != 0 {
            return Err(GroveError::inv_parameter(
                "DUPLICATE and OVERWRITE are mutually exclusive",
            ));
        }

        let key = if self.is_record_number() {
            self.prepare_recno_key(key)?
        } else {
            self.validate_key(key)?;
            key.to_vec()
        };

        let env = self.env()?;
        if env.config.transactions_enabled() {
            match txn {
                Some(txn) => {
                    self.insert_txn(txn, &key, record, flags, dupe_position)?;
                }
                None => {
                    // wrap in a temporary transaction so the conflict
                    // rules apply uniformly
                    let temp = env.txn_begin(None)?;
                    match self
                        .insert_txn(&temp, &key, record, flags, dupe_position)
                    {
                        Ok(_) => env.txn_commit(&temp)?,
                        Err(e) => {
                            env.txn_abort(&temp)?;
                            return Err(e);
                        }
                    }
                }
            }
        } else {
            self.btree.wl().insert(
                &key,
                record,
                flags,
                dupe_position.max(0) as u32,
            )?;
            env.after_operation()?;
        }

        Ok(key)
    }

    /// Lookup; returns the matched key and its record. The LT/GT/LEQ/GEQ
    /// flags enable approximate matching.
    pub fn find(
        &self,
        txn: Option<&Pod<Transaction>>,
        key: &[u8],
        flags: u32,
    ) -> GroveResult<(Vec<u8>, Vec<u8>)> {
        self.validate_key(key).or_else(|e| {
            // approximate lookups may probe with shorter keys
            if is_approx_find(flags) {
                Ok(())
            } else {
                Err(e)
            }
        })?;

        if is_approx_find(flags) {
            // approximate matching reconciles both layers; the cursor
            // already knows how to do that
            let mut cursor = Cursor::new(self.arc()?, txn.cloned())?;
            cursor.find(key, flags)?;
            let result = cursor.get_key_and_record();
            cursor.close()?;
            return result;
        }

        let env = self.env()?;
        if env.config.transactions_enabled() {
            let reader = txn.map(|t| t.rl().get_id());
            match self.txn_key_state(key, reader)? {
                TxnKeyState::Conflict => {
                    return Err(GroveError::new(
                        ErrorKind::TxnConflict,
                        "the key is modified by another active transaction",
                    ));
                }
                TxnKeyState::Erased => {
                    return Err(GroveError::key_not_found());
                }
                TxnKeyState::Record(record) => {
                    return Ok((key.to_vec(), record));
                }
                TxnKeyState::Duplicates => {
                    let lines = self.build_dupe_list(key, reader)?;
                    let first = lines
                        .into_iter()
                        .next()
                        .ok_or_else(GroveError::key_not_found)?;
                    let record = self.resolve_dupe_line(key, &first)?;
                    return Ok((key.to_vec(), record));
                }
                TxnKeyState::UseBtree => {}
            }
        }

        let mut btree = self.btree.wl();
        let outcome = btree.find(key, 0)?;
        let record = btree.read_record(&outcome.record, None)?;
        Ok((outcome.key, record))
    }

    /// Erases a key (including all its duplicates).
    pub fn erase(
        &self,
        txn: Option<&Pod<Transaction>>,
        key: &[u8],
        _flags: u32,
    ) -> GroveResult {
        self.check_writable()?;
        self.validate_key(key)?;

        let env = self.env()?;
        if env.config.transactions_enabled() {
            match txn {
                Some(txn) => self.erase_txn(txn, key, None)?,
                None => {
                    let temp = env.txn_begin(None)?;
                    match self.erase_txn(&temp, key, None) {
                        Ok(_) => env.txn_commit(&temp)?,
                        Err(e) => {
                            env.txn_abort(&temp)?;
                            return Err(e);
                        }
                    }
                }
            }
        } else {
            self.btree.wl().erase(key, None)?;
            env.after_operation()?;
        }

        self.registry.wl().nil_on_key(key, self.compare());
        Ok(())
    }

    /// The number of keys, or of records when duplicates are counted.
    pub fn count(
        &self,
        txn: Option<&Pod<Transaction>>,
        flags: u32,
    ) -> GroveResult<u64> {
        let distinct = flags & SKIP_DUPLICATES != 0;
        let env = self.env()?;
        let mut total = self.btree.rl().count(distinct)?;

        if !env.config.transactions_enabled() {
            return Ok(total);
        }

        // walk the pending operations and adjust: the newest visible op
        // per key wins
        let reader = txn.map(|t| t.rl().get_id());
        let keys: Vec<Vec<u8>> = {
            let index = self.txn_index.rl();
            index.keys().map(|node| node.key.clone()).collect()
        };
        for key in keys {
            let in_btree = self.btree.wl().find(&key, 0).is_ok();
            match self.txn_key_state(&key, reader)? {
                TxnKeyState::Erased => {
                    if in_btree {
                        total = total.saturating_sub(1);
                    }
                }
                TxnKeyState::Record(_) => {
                    if !in_btree {
                        total += 1;
                    }
                }
                TxnKeyState::Duplicates => {
                    let lines = self.build_dupe_list(&key, reader)?;
                    let merged = lines.len() as u64;
                    let btree_side = if in_btree {
                        if distinct {
                            1
                        } else {
                            let outcome = self.btree.wl().find(&key, 0)?;
                            self.btree
                                .rl()
                                .duplicate_count(&outcome.record)?
                                as u64
                        }
                    } else {
                        0
                    };
                    let merged = if distinct && merged > 0 { 1 } else { merged };
                    total = total - btree_side + merged;
                }
                TxnKeyState::Conflict | TxnKeyState::UseBtree => {}
            }
        }
        Ok(total)
    }

    /// Creates a cursor over this database, optionally bound to a
    /// transaction.
    pub fn cursor(
        &self,
        txn: Option<&Pod<Transaction>>,
    ) -> GroveResult<Cursor> {
        Cursor::new(self.arc()?, txn.cloned())
    }

    /// Verifies the structural invariants of the underlying index: key
    /// order inside every node, separator bounds, the leaf sibling
    /// chain.
    pub fn check_integrity(&self) -> GroveResult {
        self.btree.rl().check_integrity()
    }

    // === transaction routing ==============================================

    pub(crate) fn insert_txn(
        &self,
        txn: &Pod<Transaction>,
        key: &[u8],
        record: &[u8],
        flags: u32,
        dupe_position: i32,
    ) -> GroveResult<u64> {
        let env = self.env()?;
        let reader = txn.rl().get_id();
        if !txn.rl().is_active() {
            return Err(GroveError::inv_parameter(
                "the transaction is no longer active",
            ));
        }

        // conflict detection and duplicate-key checking against the
        // pending operations, then against the btree
        match self.txn_key_state(key, Some(reader))? {
            TxnKeyState::Conflict => {
                return Err(GroveError::new(
                    ErrorKind::TxnConflict,
                    "the key is modified by another active transaction",
                ));
            }
            TxnKeyState::Record(_) | TxnKeyState::Duplicates => {
                if flags & (OVERWRITE | DUPLICATE) == 0 {
                    return Err(GroveError::new(
                        ErrorKind::DuplicateKey,
                        "key already exists",
                    ));
                }
            }
            TxnKeyState::Erased => {}
            TxnKeyState::UseBtree => {
                if flags & (OVERWRITE | DUPLICATE) == 0
                    && self.btree.wl().find(key, 0).is_ok()
                {
                    return Err(GroveError::new(
                        ErrorKind::DuplicateKey,
                        "key already exists",
                    ));
                }
            }
        }

        let kind = if flags & DUPLICATE != 0 {
            TXN_OP_INSERT_DUPLICATE
        } else if flags & OVERWRITE != 0 {
            TXN_OP_INSERT_OVERWRITE
        } else {
            TXN_OP_INSERT
        };

        let seq = env.txn_manager.wl().next_op_seq();
        let op = TransactionOperation {
            seq,
            txn_id: reader,
            flags: kind,
            orig_flags: flags,
            lsn: seq,
            record: Some(record.to_vec()),
            referenced_dupe: dupe_position,
        };
        self.txn_index.wl().append(key, op);
        txn.wl().add_op(OpHandle {
            db_name: self.name,
            key: key.to_vec(),
            seq,
        });
        debug!(
            "txn {} queued insert of key {}",
            reader,
            key_repr(key)
        );
        Ok(seq)
    }

    pub(crate) fn erase_txn(
        &self,
        txn: &Pod<Transaction>,
        key: &[u8],
        dupe_index: Option<u32>,
    ) -> GroveResult {
        let env = self.env()?;
        let reader = txn.rl().get_id();
        if !txn.rl().is_active() {
            return Err(GroveError::inv_parameter(
                "the transaction is no longer active",
            ));
        }

        match self.txn_key_state(key, Some(reader))? {
            TxnKeyState::Conflict => {
                return Err(GroveError::new(
                    ErrorKind::TxnConflict,
                    "the key is modified by another active transaction",
                ));
            }
            TxnKeyState::Erased => {
                return Err(GroveError::key_not_found());
            }
            TxnKeyState::Record(_) | TxnKeyState::Duplicates => {}
            TxnKeyState::UseBtree => {
                if self.btree.wl().find(key, 0).is_err() {
                    return Err(GroveError::key_not_found());
                }
            }
        }

        let seq = env.txn_manager.wl().next_op_seq();
        let op = TransactionOperation {
            seq,
            txn_id: reader,
            flags: TXN_OP_ERASE,
            orig_flags: 0,
            lsn: seq,
            record: None,
            referenced_dupe: dupe_index.map(|i| i as i32).unwrap_or(-1),
        };
        self.txn_index.wl().append(key, op);
        txn.wl().add_op(OpHandle {
            db_name: self.name,
            key: key.to_vec(),
            seq,
        });
        debug!("txn {} queued erase of key {}", reader, key_repr(key));
        Ok(())
    }

    /// Replays one committed operation into the btree and marks it
    /// flushed. The conflict checks already ran when the op was queued.
    pub(crate) fn flush_txn_op(
        &self,
        handle: &OpHandle,
    ) -> GroveResult {
        let op = {
            let index = self.txn_index.rl();
            index
                .get(&handle.key)
                .and_then(|node| {
                    node.ops.iter().find(|op| op.seq == handle.seq).cloned()
                })
        };
        let op = match op {
            Some(op) => op,
            None => return Ok(()),
        };
        if op.is_flushed() || op.is_nop() {
            return Ok(());
        }

        let result = match op.kind() {
            TXN_OP_INSERT_OVERWRITE if op.referenced_dupe >= 0 => {
                // an overwrite of one specific duplicate
                self.btree.wl().overwrite_duplicate(
                    &handle.key,
                    op.referenced_dupe as u32,
                    op.record.as_deref().unwrap_or(&[]),
                )
            }
            TXN_OP_INSERT | TXN_OP_INSERT_OVERWRITE => self
                .btree
                .wl()
                .insert(
                    &handle.key,
                    op.record.as_deref().unwrap_or(&[]),
                    OVERWRITE,
                    0,
                )
                .map(|_| ()),
            TXN_OP_INSERT_DUPLICATE => {
                let position_flags = op.orig_flags
                    & (DUPLICATE_INSERT_BEFORE
                        | DUPLICATE_INSERT_AFTER
                        | DUPLICATE_INSERT_FIRST
                        | DUPLICATE_INSERT_LAST);
                self.btree
                    .wl()
                    .insert(
                        &handle.key,
                        op.record.as_deref().unwrap_or(&[]),
                        DUPLICATE | position_flags,
                        op.referenced_dupe.max(0) as u32,
                    )
                    .map(|_| ())
            }
            TXN_OP_ERASE => {
                let dupe = if op.referenced_dupe >= 0 {
                    Some(op.referenced_dupe as u32)
                } else {
                    None
                };
                match self.btree.wl().erase(&handle.key, dupe) {
                    Err(ref e) if e.kind() == ErrorKind::KeyNotFound => {
                        Ok(())
                    }
                    other => other,
                }
            }
            _ => Ok(()),
        };
        result?;

        self.txn_index.wl().mark_flushed(&handle.key, handle.seq);
        Ok(())
    }

    // === merged visibility ================================================

    /// Scans a key's pending operations from newest to oldest and
    /// reports what the reader sees. The scan short-circuits at the
    /// first committed insert or erase visible to the reader; flushed
    /// ops are skipped (their effect is already in the btree), aborted
    /// ones are invisible, and any op of another still-active
    /// transaction is a conflict.
    pub(crate) fn txn_key_state(
        &self,
        key: &[u8],
        reader: Option<u64>,
    ) -> GroveResult<TxnKeyState> {
        let env = self.env()?;
        let index = self.txn_index.rl();
        let node = match index.get(key) {
            Some(node) => node,
            None => return Ok(TxnKeyState::UseBtree),
        };

        let txn_manager = env.txn_manager.rl();
        let mut saw_duplicates = false;

        for op in node.ops_newest_first() {
            if op.is_flushed() {
                continue;
            }
            match txn_manager.state_of(op.txn_id) {
                TxnState::Aborted => continue,
                TxnState::Active if reader != Some(op.txn_id) => {
                    return Ok(TxnKeyState::Conflict);
                }
                _ => {}
            }

            if op.is_erase() {
                if op.referenced_dupe >= 0 {
                    saw_duplicates = true;
                    continue;
                }
                return Ok(TxnKeyState::Erased);
            }
            match op.kind() {
                TXN_OP_INSERT | TXN_OP_INSERT_OVERWRITE => {
                    if saw_duplicates {
                        return Ok(TxnKeyState::Duplicates);
                    }
                    return Ok(TxnKeyState::Record(
                        op.record.clone().unwrap_or_default(),
                    ));
                }
                TXN_OP_INSERT_DUPLICATE => {
                    return Ok(TxnKeyState::Duplicates);
                }
                _ => continue,
            }
        }

        if saw_duplicates {
            Ok(TxnKeyState::Duplicates)
        } else {
            Ok(TxnKeyState::UseBtree)
        }
    }

    /// Builds the merged duplicate view of one key: the btree's
    /// duplicate table entries first, then every visible pending op
    /// applied in chronological order.
    pub(crate) fn build_dupe_list(
        &self,
        key: &[u8],
        reader: Option<u64>,
    ) -> GroveResult<Vec<DupeLine>> {
        let env = self.env()?;
        let mut lines: Vec<DupeLine> = Vec::new();

        {
            let mut btree = self.btree.wl();
            if let Ok(outcome) = btree.find(key, 0) {
                let count = btree.duplicate_count(&outcome.record)?;
                for i in 0..count {
                    lines.push(DupeLine::Btree(i));
                }
            }
        }

        let index = self.txn_index.rl();
        let node = match index.get(key) {
            Some(node) => node,
            None => return Ok(lines),
        };
        let txn_manager = env.txn_manager.rl();

        for op in node.ops.iter() {
            if op.is_flushed() {
                continue;
            }
            match txn_manager.state_of(op.txn_id) {
                TxnState::Aborted => continue,
                TxnState::Active if reader != Some(op.txn_id) => continue,
                _ => {}
            }

            match op.kind() {
                TXN_OP_ERASE => {
                    if op.referenced_dupe >= 0 {
                        let index = op.referenced_dupe as usize;
                        if index < lines.len() {
                            lines.remove(index);
                        }
                    } else {
                        lines.clear();
                    }
                }
                TXN_OP_INSERT | TXN_OP_INSERT_OVERWRITE => {
                    lines.clear();
                    lines.push(DupeLine::Txn(op.record.clone()));
                }
                TXN_OP_INSERT_DUPLICATE => {
                    let reference = op.referenced_dupe.max(0) as usize;
                    let position = if op.orig_flags & DUPLICATE_INSERT_FIRST
                        != 0
                    {
                        0
                    } else if op.orig_flags & DUPLICATE_INSERT_BEFORE != 0 {
                        reference.min(lines.len())
                    } else if op.orig_flags & DUPLICATE_INSERT_AFTER != 0 {
                        (reference + 1).min(lines.len())
                    } else {
                        lines.len()
                    };
                    lines.insert(position, DupeLine::Txn(op.record.clone()));
                }
                _ => {}
            }
        }

        Ok(lines)
    }

    pub(crate) fn resolve_dupe_line(
        &self,
        key: &[u8],
        line: &DupeLine,
    ) -> GroveResult<Vec<u8>> {
        match line {
            DupeLine::Txn(record) => Ok(record.clone().unwrap_or_default()),
            DupeLine::Btree(index) => {
                let mut btree = self.btree.wl();
                let outcome = btree.find(key, 0)?;
                btree.read_record(&outcome.record, Some(*index))
            }
        }
    }
}
