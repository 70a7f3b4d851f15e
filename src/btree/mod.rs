pub mod node;
pub mod stats;

mod erase;
mod find;
mod insert;

use std::cmp::Ordering;

pub use find::{ApproxMatch, FindOutcome};
pub use insert::InsertOutcome;

use log::debug;

use crate::{
    blob::BlobManager,
    cursor::CursorRegistry,
    duplicates::DuplicateManager,
    env::EnvHeader,
    error::{ErrorKind, GroveError},
    page::{Page, PageType},
    page_manager::{PageManager, ALLOC_CLEAR_WITH_ZERO},
    types::{GroveResult, Pod},
    utils::HandyRwLock,
};

use node::{NodeProxy, RecordDescriptor};
use stats::BtreeStatistics;

pub type CompareFn = fn(&[u8], &[u8]) -> Ordering;

/// One step of a root-to-leaf descent. `child_index == count` stands for
/// the ptr_down child. The parent of a node during recursion is never
/// stored on the node itself; it lives in this path.
pub(crate) struct DescentStep {
    pub page: Pod<Page>,
    pub child_index: usize,
}

/// The ordered index of one database: lookup, insert with page splits,
/// erase with rebalance/merge, ordered iteration.
#[derive(Debug)]
pub struct BtreeIndex {
    pub name: u16,
    descriptor_index: usize,

    pub key_size: usize,
    /// fixed record size enforcement; None = unlimited
    pub rec_size: Option<u32>,

    root_address: u64,

    pub proxy: NodeProxy,
    pub cmp: CompareFn,
    pub statistics: BtreeStatistics,

    pub(crate) page_manager: Pod<PageManager>,
    pub(crate) blob_manager: Pod<BlobManager>,
    pub(crate) dupes: DuplicateManager,
    pub(crate) header: Pod<EnvHeader>,
    pub(crate) registry: Pod<CursorRegistry>,
}

impl BtreeIndex {
    pub fn new(
        name: u16,
        descriptor_index: usize,
        key_size: usize,
        rec_size: Option<u32>,
        root_address: u64,
        cmp: CompareFn,
        page_manager: Pod<PageManager>,
        blob_manager: Pod<BlobManager>,
        header: Pod<EnvHeader>,
        registry: Pod<CursorRegistry>,
    ) -> Self {
        let page_size = page_manager.rl().page_size();
        let dupes = DuplicateManager::new(blob_manager.clone());
        Self {
            name,
            descriptor_index,
            key_size,
            rec_size,
            root_address,
            proxy: NodeProxy::new(key_size, page_size),
            cmp,
            statistics: BtreeStatistics::new(),
            page_manager,
            blob_manager,
            dupes,
            header,
            registry,
        }
    }

    /// Creates the empty root leaf of a fresh database.
    pub fn create(&mut self) -> GroveResult {
        let page = self
            .page_manager
            .wl()
            .alloc_page(PageType::BtreeLeaf, ALLOC_CLEAR_WITH_ZERO)?;
        {
            let mut p = page.wl();
            self.proxy.init(&mut p, true);
            p.set_type(PageType::BtreeRoot);
        }
        self.root_address = page.rl().get_address();
        self.flush_descriptor()?;
        debug!(
            "created btree {} with root page {}",
            self.name, self.root_address
        );
        Ok(())
    }

    pub fn root_address(&self) -> u64 {
        self.root_address
    }

    pub(crate) fn set_root_address(&mut self, address: u64) -> GroveResult {
        self.root_address = address;
        self.flush_descriptor()
    }

    /// Writes the descriptor (root address) back into the environment
    /// header page.
    pub(crate) fn flush_descriptor(&self) -> GroveResult {
        self.header
            .wl()
            .set_root_address(self.descriptor_index, self.root_address)
    }

    pub(crate) fn fetch(&self, address: u64) -> GroveResult<Pod<Page>> {
        self.page_manager.wl().fetch_page(address, 0)
    }

    /// Descends from the root to the leaf that owns `key`, recording the
    /// path of internal nodes.
    pub(crate) fn descend(
        &self,
        key: &[u8],
    ) -> GroveResult<(Pod<Page>, Vec<DescentStep>)> {
        let mut path = Vec::new();
        let mut page = self.fetch(self.root_address)?;

        loop {
            let (is_leaf, child_index, child_address) = {
                let p = page.rl();
                if self.proxy.is_leaf(&p) {
                    (true, 0, 0)
                } else {
                    let count = self.proxy.count(&p);
                    let index = match self.proxy.search(&p, key, self.cmp) {
                        Ok(slot) => slot,
                        Err(pos) => pos,
                    };
                    let child = if index < count {
                        self.proxy.child(&p, index)
                    } else {
                        self.proxy.ptr_down(&p)
                    };
                    (false, index, child)
                }
            };

            if is_leaf {
                return Ok((page, path));
            }

            path.push(DescentStep {
                page: page.clone(),
                child_index,
            });
            page = self.fetch(child_address)?;
        }
    }

    /// The leftmost leaf of the tree.
    pub(crate) fn first_leaf(&self) -> GroveResult<Pod<Page>> {
        let mut page = self.fetch(self.root_address)?;
        loop {
            let (is_leaf, child) = {
                let p = page.rl();
                if self.proxy.is_leaf(&p) {
                    (true, 0)
                } else if self.proxy.count(&p) > 0 {
                    (false, self.proxy.child(&p, 0))
                } else {
                    (false, self.proxy.ptr_down(&p))
                }
            };
            if is_leaf {
                return Ok(page);
            }
            page = self.fetch(child)?;
        }
    }

    /// The rightmost leaf, reached by following the ptr_down chain.
    pub(crate) fn last_leaf(&self) -> GroveResult<Pod<Page>> {
        let mut page = self.fetch(self.root_address)?;
        loop {
            let (is_leaf, child) = {
                let p = page.rl();
                if self.proxy.is_leaf(&p) {
                    (true, 0)
                } else {
                    (false, self.proxy.ptr_down(&p))
                }
            };
            if is_leaf {
                return Ok(page);
            }
            page = self.fetch(child)?;
        }
    }

    /// Builds a record descriptor for `data`: inline when tiny, a blob
    /// otherwise.
    pub(crate) fn make_record(
        &self,
        data: &[u8],
    ) -> GroveResult<RecordDescriptor> {
        if let Some(rec_size) = self.rec_size {
            if data.len() as u32 != rec_size {
                return Err(GroveError::new(
                    ErrorKind::InvRecordSize,
                    &format!(
                        "record size {} does not match the fixed size {}",
                        data.len(),
                        rec_size
                    ),
                ));
            }
        }
        match RecordDescriptor::inline_from(data) {
            Some(desc) => Ok(desc),
            None => {
                let blob_id = self.blob_manager.wl().allocate(data)?;
                Ok(RecordDescriptor::Blob(blob_id))
            }
        }
    }

    /// Reads the record bytes behind a descriptor. For duplicate tables,
    /// `dupe_index` selects the entry (default 0).
    pub fn read_record(
        &self,
        desc: &RecordDescriptor,
        dupe_index: Option<u32>,
    ) -> GroveResult<Vec<u8>> {
        match desc {
            RecordDescriptor::Blob(id) => self.blob_manager.wl().read(*id),
            RecordDescriptor::DupTable(id) => {
                let entry =
                    self.dupes.get(*id, dupe_index.unwrap_or(0))?;
                match entry {
                    RecordDescriptor::DupTable(_) => Err(
                        GroveError::internal("nested duplicate table"),
                    ),
                    other => self.read_record(&other, None),
                }
            }
            inline => Ok(inline.inline_data().unwrap_or(&[]).to_vec()),
        }
    }

    pub fn record_size(
        &self,
        desc: &RecordDescriptor,
        dupe_index: Option<u32>,
    ) -> GroveResult<u64> {
        match desc {
            RecordDescriptor::Blob(id) => {
                self.blob_manager.wl().get_blob_size(*id)
            }
            RecordDescriptor::DupTable(id) => {
                let entry =
                    self.dupes.get(*id, dupe_index.unwrap_or(0))?;
                self.record_size(&entry, None)
            }
            inline => {
                Ok(inline.inline_data().map(|d| d.len()).unwrap_or(0) as u64)
            }
        }
    }

    /// Releases everything a descriptor owns.
    pub(crate) fn free_record(
        &self,
        desc: &RecordDescriptor,
    ) -> GroveResult {
        match desc {
            RecordDescriptor::Blob(id) => self.blob_manager.wl().free(*id),
            RecordDescriptor::DupTable(id) => {
                self.dupes.erase(*id, 0, true)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    pub fn duplicate_count(
        &self,
        desc: &RecordDescriptor,
    ) -> GroveResult<u32> {
        match desc {
            RecordDescriptor::DupTable(id) => self.dupes.count(*id),
            _ => Ok(1),
        }
    }

    /// Counts the keys (or records, when duplicates are included).
    pub fn count(&self, distinct: bool) -> GroveResult<u64> {
        let mut total = 0u64;
        let mut page = self.first_leaf()?;
        loop {
            let next = {
                let p = page.rl();
                let count = self.proxy.count(&p);
                if distinct {
                    total += count as u64;
                } else {
                    for slot in 0..count {
                        let desc = self.proxy.record(&p, slot);
                        total += self.duplicate_count(&desc)? as u64;
                    }
                }
                self.proxy.right(&p)
            };
            if next == 0 {
                return Ok(total);
            }
            page = self.fetch(next)?;
        }
    }

    /// Frees every page, blob and duplicate table of this index; used
    /// when a database is erased.
    pub fn release(&mut self) -> GroveResult {
        self.release_subtree(self.root_address)?;
        self.root_address = 0;
        Ok(())
    }

    fn release_subtree(&mut self, address: u64) -> GroveResult {
        let page = self.fetch(address)?;
        let (is_leaf, children, records) = {
            let p = page.rl();
            let count = self.proxy.count(&p);
            if self.proxy.is_leaf(&p) {
                let records: Vec<RecordDescriptor> =
                    (0..count).map(|s| self.proxy.record(&p, s)).collect();
                (true, Vec::new(), records)
            } else {
                let mut children: Vec<u64> =
                    (0..count).map(|s| self.proxy.child(&p, s)).collect();
                children.push(self.proxy.ptr_down(&p));
                (false, children, Vec::new())
            }
        };

        if is_leaf {
            for desc in &records {
                self.free_record(desc)?;
            }
        } else {
            for child in children {
                self.release_subtree(child)?;
            }
        }

        self.registry.wl().uncouple_all(&mut page.wl(), &self.proxy);
        self.page_manager.wl().add_to_free_map(address, 1);
        Ok(())
    }

    /// Structural self-check used by the tests: key order inside every
    /// node, separator invariants, the leaf sibling chain.
    pub fn check_integrity(&self) -> GroveResult {
        self.check_subtree(self.root_address, None, None)?;
        self.check_leaf_chain()?;
        Ok(())
    }

    fn check_subtree(
        &self,
        address: u64,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
    ) -> GroveResult {
        let page = self.fetch(address)?;
        let p = page.rl();
        let count = self.proxy.count(&p);

        let mut previous: Option<Vec<u8>> = lower.clone();
        for slot in 0..count {
            let key = self.proxy.key(&p, slot).to_vec();
            if let Some(prev) = &previous {
                if (self.cmp)(prev, &key) != Ordering::Less {
                    return Err(GroveError::internal(
                        "keys are not strictly ordered",
                    ));
                }
            }
            previous = Some(key);
        }
        if let (Some(last), Some(upper)) = (previous.as_ref(), upper.as_ref())
        {
            if (self.cmp)(last, upper) == Ordering::Greater {
                return Err(GroveError::internal(
                    "node key exceeds its upper bound",
                ));
            }
        }

        if !self.proxy.is_leaf(&p) {
            // every subtree i holds keys in (key[i-1], key[i]]
            let mut lo = lower;
            for slot in 0..count {
                let sep = self.proxy.key(&p, slot).to_vec();
                let child = self.proxy.child(&p, slot);
                self.check_subtree(child, lo.clone(), Some(sep.clone()))?;
                lo = Some(sep);
            }
            self.check_subtree(self.proxy.ptr_down(&p), lo, upper)?;
        }
        Ok(())
    }

    fn check_leaf_chain(&self) -> GroveResult {
        let mut page = self.first_leaf()?;
        let mut previous_address = 0u64;
        let mut previous_key: Option<Vec<u8>> = None;

        loop {
            let next = {
                let p = page.rl();
                if self.proxy.left(&p) != previous_address {
                    return Err(GroveError::internal(
                        "leaf chain left link is broken",
                    ));
                }
                let count = self.proxy.count(&p);
                if count > 0 {
                    let first = self.proxy.key(&p, 0).to_vec();
                    if let Some(prev) = &previous_key {
                        if (self.cmp)(prev, &first) != Ordering::Less {
                            return Err(GroveError::internal(
                                "leaf chain is not in key order",
                            ));
                        }
                    }
                    previous_key =
                        Some(self.proxy.key(&p, count - 1).to_vec());
                }
                previous_address = p.get_address();
                self.proxy.right(&p)
            };
            if next == 0 {
                return Ok(());
            }
            page = self.fetch(next)?;
        }
    }
}
