//! An embedded, ordered key/value storage engine.
//!
//! One file (or an in-memory arena) holds one or more logically
//! independent databases. Keys are typed and ordered; records are
//! variable-length; duplicates, multi-version transactions with
//! write-ahead logging, and record-number keys are optional features
//! enabled per database or environment. The consumer links the engine
//! directly; there is no server component.

mod blob;
mod device;
mod duplicates;
mod freelist;
mod io;
mod page;
mod page_manager;
mod tx_log;

mod btree;
mod cursor;
mod db;
mod env;
mod transaction;

pub mod error;
pub mod flags;
pub mod types;
pub mod utils;

pub use btree::{stats, ApproxMatch};
pub use cursor::Cursor;
pub use db::{Database, KeyType};
pub use env::{DbParameters, Environment, Parameters};
pub use error::{ErrorKind, GroveError};
pub use transaction::{Transaction, TxnState};
pub use types::{GroveResult, Pod};
pub use utils::HandyRwLock;

/// A snapshot of the engine's usage metrics.
pub struct Metrics {
    pub page_count_fetched: u64,
    pub page_count_flushed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub free_map_hits: u64,
    pub free_map_misses: u64,
    pub freelist_hits: u64,
    pub freelist_misses: u64,
    pub blobs_allocated: u64,
    pub blobs_freed: u64,
    pub btree_smo_split: u64,
    pub btree_smo_merge: u64,
    pub btree_smo_shift: u64,
}

impl Environment {
    pub fn get_metrics(&self) -> Metrics {
        let pm = self.page_manager.rl();
        let fl = self.freelist.rl();
        let bm = self.blob_manager.rl();
        Metrics {
            page_count_fetched: pm.page_count_fetched,
            page_count_flushed: pm.page_count_flushed,
            cache_hits: pm.cache_hits,
            cache_misses: pm.cache_misses,
            free_map_hits: pm.free_map_hits,
            free_map_misses: pm.free_map_misses,
            freelist_hits: fl.alloc_hits,
            freelist_misses: fl.alloc_misses,
            blobs_allocated: bm.blobs_allocated,
            blobs_freed: bm.blobs_freed,
            btree_smo_split: stats::smo_split(),
            btree_smo_merge: stats::smo_merge(),
            btree_smo_shift: stats::smo_shift(),
        }
    }
}
