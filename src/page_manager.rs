use std::collections::{BTreeMap, HashMap};

use log::debug;

use crate::{
    error::{ErrorKind, GroveError},
    device::Device,
    io::{get_u32, get_u64, set_u32, set_u64},
    page::{Page, PageType, PAGE_HEADER_SIZE},
    tx_log::Changeset,
    types::{pod, GroveResult, Pod, ResultPod},
    utils::HandyRwLock,
};

// flags for PageManager::alloc_page()
pub const ALLOC_CLEAR_WITH_ZERO: u32 = 1;
pub const ALLOC_IGNORE_FREE_MAP: u32 = 2;
pub const ALLOC_DISABLE_STATE_FLUSH: u32 = 4;

// flags for PageManager::fetch_page()
pub const FETCH_ONLY_FROM_CACHE: u32 = 1;
pub const FETCH_READ_ONLY: u32 = 2;
/// Page is part of a multi-page blob and has no header; skips the
/// checksum verification (a blob payload overlays the header bytes).
pub const FETCH_NO_HEADER: u32 = 4;

/// The amount of pages that are at least flushed in purge_cache()
pub const PURGE_AT_LEAST: usize = 20;

/// Only pages above this age are purged
pub const PURGE_THRESHOLD: u64 = 100;

/// Maps page address to the unique in-memory page instance, with an
/// access clock for age-based purging.
#[derive(Debug)]
pub struct PageCache {
    pages: HashMap<u64, Pod<Page>>,
    last_access: HashMap<u64, u64>,
    tick: u64,
    capacity_bytes: u64,
    page_size: usize,
}

impl PageCache {
    pub fn new(capacity_bytes: u64, page_size: usize) -> Self {
        Self {
            pages: HashMap::new(),
            last_access: HashMap::new(),
            tick: 0,
            capacity_bytes,
            page_size,
        }
    }

    pub fn get(&mut self, address: u64) -> Option<Pod<Page>> {
        self.tick += 1;
        match self.pages.get(&address) {
            Some(p) => {
                self.last_access.insert(address, self.tick);
                Some(p.clone())
            }
            None => None,
        }
    }

    pub fn put(&mut self, page: Pod<Page>) {
        self.tick += 1;
        let address = page.rl().get_address();
        self.last_access.insert(address, self.tick);
        self.pages.insert(address, page);
    }

    pub fn remove(&mut self, address: u64) -> Option<Pod<Page>> {
        self.last_access.remove(&address);
        self.pages.remove(&address)
    }

    pub fn is_full(&self) -> bool {
        (self.pages.len() * self.page_size) as u64 > self.capacity_bytes
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity_bytes
    }

    fn all_pages(&self) -> Vec<Pod<Page>> {
        self.pages.values().cloned().collect()
    }

    /// Pages eligible for purging, oldest first. The header page (address
    /// 0) is pinned forever; pages with coupled cursors stay as well.
    fn purge_candidates(&self) -> Vec<(u64, u64)> {
        let mut candidates: Vec<(u64, u64)> = Vec::new();
        for (address, access) in self.last_access.iter() {
            if *address == 0 {
                continue;
            }
            if self.tick - access <= PURGE_THRESHOLD {
                continue;
            }
            candidates.push((*access, *address));
        }
        candidates.sort();
        candidates
    }
}

/// The PageManager allocates, fetches and frees pages. It owns the cache,
/// the map of free pages, and the persisted state chain whose head is
/// recorded in the environment header.
#[derive(Debug)]
pub struct PageManager {
    cache: PageCache,

    /// Maps page address to the length (in pages) of a free run
    free_pages: BTreeMap<u64, usize>,

    /// Whether `free_pages` must be persisted again
    needs_flush: bool,

    /// Address of the head of the page-manager-state chain (0 = none)
    state_page: u64,

    /// Cached page address where more blobs can be appended
    last_blob_page: u64,

    device: Pod<Device>,
    changeset: Pod<Changeset>,

    page_size: usize,
    in_memory: bool,
    recovery_enabled: bool,
    verify_crc: bool,

    /// Writes the state-chain head into the header page; installed by the
    /// environment at bootstrap (the header layout belongs to env.rs).
    state_writeback: Option<fn(&mut Page, u64)>,

    // usage metrics
    pub page_count_fetched: u64,
    pub page_count_flushed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub free_map_hits: u64,
    pub free_map_misses: u64,
}

impl PageManager {
    pub fn new(
        device: Pod<Device>,
        changeset: Pod<Changeset>,
        cache_size: u64,
        page_size: usize,
        in_memory: bool,
        recovery_enabled: bool,
        verify_crc: bool,
    ) -> Self {
        Self {
            cache: PageCache::new(cache_size, page_size),
            free_pages: BTreeMap::new(),
            needs_flush: false,
            state_page: 0,
            last_blob_page: 0,
            device,
            changeset,
            page_size,
            in_memory,
            recovery_enabled,
            verify_crc,
            state_writeback: None,
            page_count_fetched: 0,
            page_count_flushed: 0,
            cache_hits: 0,
            cache_misses: 0,
            free_map_hits: 0,
            free_map_misses: 0,
        }
    }

    pub fn set_state_writeback(&mut self, f: fn(&mut Page, u64)) {
        self.state_writeback = f.into();
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Fetches a page, reading it from the device on a cache miss.
    pub fn fetch_page(&mut self, address: u64, flags: u32) -> ResultPod<Page> {
        if let Some(page) = self.cache.get(address) {
            self.cache_hits += 1;
            if self.recovery_enabled && flags & FETCH_READ_ONLY == 0 {
                self.changeset.wl().add_page(&page);
            }
            return Ok(page);
        }

        if flags & FETCH_ONLY_FROM_CACHE != 0 {
            return Err(GroveError::new(
                ErrorKind::InternalError,
                &format!("page {} is not cached", address),
            ));
        }

        self.cache_misses += 1;

        let data = self.device.wl().read_page(address)?;
        let mut page = Page::from_bytes(address, data);
        if flags & FETCH_NO_HEADER != 0 {
            page.set_no_header(true);
        } else if self.verify_crc && !page.verify_crc() {
            return Err(GroveError::new(
                ErrorKind::IoError,
                &format!("crc mismatch in page {}", address),
            ));
        }

        let page = pod(page);
        self.cache.put(page.clone());
        if self.recovery_enabled && flags & FETCH_READ_ONLY == 0 {
            self.changeset.wl().add_page(&page);
        }
        self.page_count_fetched += 1;

        Ok(page)
    }

    /// Allocates a new page, first trying the free-page map, then
    /// extending the device.
    pub fn alloc_page(
        &mut self,
        page_type: PageType,
        flags: u32,
    ) -> ResultPod<Page> {
        let mut page: Option<Pod<Page>> = None;

        if flags & ALLOC_IGNORE_FREE_MAP == 0 && !self.free_pages.is_empty() {
            let (address, run) =
                self.free_pages.iter().next().map(|(a, r)| (*a, *r)).unwrap();
            debug_assert_eq!(address % self.page_size as u64, 0);

            self.free_pages.remove(&address);
            if run > 1 {
                self.free_pages
                    .insert(address + self.page_size as u64, run - 1);
            }
            self.needs_flush = true;
            self.free_map_hits += 1;

            // the page exists in the file; reuse the cached instance if
            // there is one
            let reused = match self.cache.get(address) {
                Some(p) => p,
                None => {
                    let data = self.device.wl().read_page(address)?;
                    pod(Page::from_bytes(address, data))
                }
            };
            page = Some(reused);
        } else {
            self.free_map_misses += 1;
        }

        let page = match page {
            Some(p) => p,
            None => {
                let address = self.device.wl().alloc_page()?;
                pod(Page::new(address, self.page_size))
            }
        };

        {
            let mut p = page.wl();
            if flags & ALLOC_CLEAR_WITH_ZERO != 0 {
                for b in p.raw_data_mut().iter_mut() {
                    *b = 0;
                }
            }
            p.set_type(page_type);
            p.set_no_header(false);
            // force logging of the fresh page
            p.set_dirty(true);
        }

        if self.recovery_enabled {
            self.changeset.wl().add_page(&page);
        }

        self.cache.put(page.clone());

        if flags & ALLOC_DISABLE_STATE_FLUSH == 0 {
            self.maybe_store_state(false)?;
        }

        debug!(
            "allocated page {} with type {:?}",
            page.rl().get_address(),
            page_type
        );

        Ok(page)
    }

    /// Allocates `num_pages` adjacent pages for a multi-page blob and
    /// returns the first one. All pages are typed as blob; the non-head
    /// pages carry no header so the blob payload may overlay their full
    /// content.
    pub fn alloc_multiple_blob_pages(
        &mut self,
        num_pages: usize,
    ) -> ResultPod<Page> {
        if num_pages == 1 {
            return self.alloc_page(PageType::Blob, 0);
        }

        let page_size = self.page_size as u64;

        // check the free map for a sufficiently long run
        let found = self
            .free_pages
            .iter()
            .find(|(_, run)| **run >= num_pages)
            .map(|(a, r)| (*a, *r));

        if let Some((address, run)) = found {
            self.free_pages.remove(&address);
            if run > num_pages {
                self.free_pages.insert(
                    address + num_pages as u64 * page_size,
                    run - num_pages,
                );
            }
            self.needs_flush = true;

            let mut head: Option<Pod<Page>> = None;
            for i in 0..num_pages {
                let flags = if i > 0 { FETCH_NO_HEADER } else { 0 };
                let page =
                    self.fetch_page(address + i as u64 * page_size, flags)?;
                {
                    let mut p = page.wl();
                    if i == 0 {
                        p.set_type(PageType::Blob);
                    }
                    p.set_no_header(i > 0);
                    p.set_dirty(true);
                }
                if i == 0 {
                    head = Some(page);
                }
            }
            return Ok(head.unwrap());
        }

        // no luck in the free map; allocate fresh pages. "store state" is
        // disabled so the page manager cannot allocate overflow pages in
        // the middle of our blob run.
        let flags = ALLOC_IGNORE_FREE_MAP | ALLOC_DISABLE_STATE_FLUSH;
        let mut head: Option<Pod<Page>> = None;
        for i in 0..num_pages {
            let page = self.alloc_page(PageType::Blob, flags)?;
            if i > 0 {
                page.wl().set_no_header(true);
            }
            if i == 0 {
                head = Some(page);
            }
        }

        self.maybe_store_state(false)?;

        Ok(head.unwrap())
    }

    /// Writes a page image through to the device if the page is dirty.
    pub fn flush_page(&mut self, page: &Pod<Page>) -> GroveResult {
        let mut p = page.wl();
        if !p.is_dirty() {
            return Ok(());
        }
        if p.has_header() {
            p.update_crc();
        }
        self.device.wl().write_page(p.get_address(), p.raw_data())?;
        p.set_dirty(false);
        self.page_count_flushed += 1;
        Ok(())
    }

    /// Flush all dirty pages to the device. Set `clear_cache` to drop the
    /// in-memory instances as well (never done for in-memory envs).
    pub fn flush_all_pages(&mut self, clear_cache: bool) -> GroveResult {
        for page in self.cache.all_pages() {
            self.flush_page(&page)?;
            if clear_cache && !self.in_memory {
                let address = page.rl().get_address();
                if address != 0 {
                    self.cache.remove(address);
                }
            }
        }
        Ok(())
    }

    /// Purges the cache when it exceeds its capacity. Only clean-up of
    /// old, uncoupled pages; dirty ones are flushed first. In-memory
    /// environments never purge - they would lose their data.
    pub fn purge_cache(&mut self) -> GroveResult {
        if self.in_memory || !self.cache.is_full() {
            return Ok(());
        }

        let mut purged = 0;
        for (_, address) in self.cache.purge_candidates() {
            if !self.cache.is_full() && purged >= PURGE_AT_LEAST {
                break;
            }
            let page = match self.cache.get(address) {
                Some(p) => p,
                None => continue,
            };
            // skip pages that are currently borrowed by an operation
            let skip = match page.try_read() {
                Ok(p) => p.coupled_cursors() > 0,
                Err(_) => true,
            };
            if skip {
                continue;
            }
            self.flush_page(&page)?;
            self.cache.remove(address);
            purged += 1;
        }

        if purged > 0 {
            debug!("purged {} pages from the cache", purged);
        }
        Ok(())
    }

    /// Adds a page (or a run of pages) to the free map; not persisted
    /// immediately - this change in the state is not relevant for logging.
    pub fn add_to_free_map(&mut self, address: u64, page_count: usize) {
        debug_assert!(page_count > 0);
        self.needs_flush = true;
        self.free_pages.insert(address, page_count);
        if self.last_blob_page == address {
            self.last_blob_page = 0;
        }
    }

    /// Returns true if a page is in the free map. Only for integrity
    /// checks and tests; ignores runs.
    pub fn is_page_free(&self, address: u64) -> bool {
        self.free_pages.contains_key(&address)
    }

    pub fn get_last_blob_page(&self) -> u64 {
        self.last_blob_page
    }

    pub fn set_last_blob_page(&mut self, address: u64) {
        self.last_blob_page = address;
    }

    /// Truncates any suffix of free pages that is flush with the file
    /// tail. In-memory environments never reclaim.
    pub fn reclaim_space(&mut self) -> GroveResult {
        if self.in_memory {
            return Ok(());
        }

        let page_size = self.page_size as u64;
        let mut file_size = self.device.rl().file_size()?;
        let mut do_truncate = false;

        loop {
            let tail = self
                .free_pages
                .iter()
                .find(|(address, run)| {
                    **address + **run as u64 * page_size == file_size
                })
                .map(|(a, r)| (*a, *r));

            match tail {
                Some((address, run)) => {
                    for i in 0..run {
                        self.cache.remove(address + i as u64 * page_size);
                    }
                    self.free_pages.remove(&address);
                    file_size = address;
                    do_truncate = true;
                }
                None => break,
            }
        }

        if do_truncate {
            // truncate before persisting the state: storing it may
            // allocate fresh state pages, and those must not end up in
            // the region being cut off
            self.device.wl().truncate(file_size)?;
            self.needs_flush = true;
            self.maybe_store_state(true)?;
            debug!("reclaimed file space down to {} bytes", file_size);
        }
        Ok(())
    }

    /// Loads the free map from the persisted state chain.
    pub fn load_state(&mut self, state_address: u64) -> GroveResult {
        self.state_page = state_address;
        self.free_pages.clear();

        let mut address = state_address;
        while address != 0 {
            let page = self.fetch_page(address, FETCH_READ_ONLY)?;
            let p = page.rl();
            if p.get_type() != PageType::PageManager {
                return Err(GroveError::new(
                    ErrorKind::InvFileHeader,
                    "page-manager state chain is corrupt",
                ));
            }
            let payload = p.payload();
            let counter = get_u32(payload, 0) as usize;
            let mut offset = 4;
            for _ in 0..counter {
                let addr = get_u64(payload, offset);
                let run = get_u32(payload, offset + 8) as usize;
                offset += 12;
                self.free_pages.insert(addr, run);
            }
            address = p.get_overflow();
        }
        self.needs_flush = false;
        Ok(())
    }

    /// Stores the free map into the state chain; returns the address of
    /// the head state page (0 when the map never needed one).
    pub fn store_state(&mut self) -> GroveResult<u64> {
        if !self.needs_flush {
            return Ok(self.state_page);
        }
        self.needs_flush = false;

        if self.state_page == 0 {
            if self.free_pages.is_empty() {
                return Ok(0);
            }
            let page = self.alloc_page(
                PageType::PageManager,
                ALLOC_IGNORE_FREE_MAP | ALLOC_DISABLE_STATE_FLUSH
                    | ALLOC_CLEAR_WITH_ZERO,
            )?;
            self.state_page = page.rl().get_address();
        }

        let entries: Vec<(u64, usize)> =
            self.free_pages.iter().map(|(a, r)| (*a, *r)).collect();
        let per_page = (self.page_size - PAGE_HEADER_SIZE - 4) / 12;

        let mut address = self.state_page;
        let mut cursor = 0;
        loop {
            // fetch_page adds the page to the changeset before we lock it
            let page = self.fetch_page(address, 0)?;
            let mut p = page.wl();
            p.set_dirty(true);

            let chunk = (entries.len() - cursor).min(per_page);
            {
                let payload = p.payload_mut();
                set_u32(payload, 0, chunk as u32);
                let mut offset = 4;
                for (addr, run) in &entries[cursor..cursor + chunk] {
                    set_u64(payload, offset, *addr);
                    set_u32(payload, offset + 8, *run as u32);
                    offset += 12;
                }
            }
            cursor += chunk;

            if cursor >= entries.len() {
                p.set_overflow(0);
                break;
            }

            // continue with the next page of the chain, allocating one
            // when the chain is too short
            let next = p.get_overflow();
            if next == 0 {
                drop(p);
                let new_page = self.alloc_page(
                    PageType::PageManager,
                    ALLOC_IGNORE_FREE_MAP | ALLOC_DISABLE_STATE_FLUSH
                        | ALLOC_CLEAR_WITH_ZERO,
                )?;
                let new_address = new_page.rl().get_address();
                let page = self.fetch_page(address, 0)?;
                page.wl().set_overflow(new_address);
                address = new_address;
            } else {
                drop(p);
                address = next;
            }
        }

        Ok(self.state_page)
    }

    /// If recovery is enabled then immediately persist the modified state
    /// and record the chain head in the environment header.
    pub fn maybe_store_state(&mut self, force: bool) -> GroveResult {
        if !(force || self.recovery_enabled) {
            return Ok(());
        }
        let new_state = self.store_state()?;
        if new_state == 0 {
            return Ok(());
        }
        if let Some(writeback) = self.state_writeback {
            let header = self.fetch_page(0, FETCH_READ_ONLY)?;
            {
                let mut h = header.wl();
                writeback(&mut h, new_state);
                h.set_dirty(true);
            }
            if self.recovery_enabled {
                self.changeset.wl().add_page(&header);
            }
        }
        Ok(())
    }

    pub fn free_page_count(&self) -> usize {
        self.free_pages.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_pm(cache_size: u64) -> PageManager {
        let device = pod(Device::in_memory(1024));
        let changeset = pod(Changeset::new(device.clone(), false));
        PageManager::new(device, changeset, cache_size, 1024, true, false, false)
    }

    #[test]
    fn test_alloc_and_fetch() {
        let mut pm = setup_pm(1 << 20);
        let page = pm.alloc_page(PageType::BtreeLeaf, 0).unwrap();
        let address = page.rl().get_address();

        let again = pm.fetch_page(address, 0).unwrap();
        assert_eq!(again.rl().get_type(), PageType::BtreeLeaf);
        assert_eq!(pm.cache_hits, 1);
    }

    #[test]
    fn test_free_map_reuse() {
        let mut pm = setup_pm(1 << 20);
        let page = pm.alloc_page(PageType::Blob, 0).unwrap();
        let address = page.rl().get_address();
        drop(page);

        pm.add_to_free_map(address, 1);
        assert!(pm.is_page_free(address));

        let again = pm.alloc_page(PageType::BtreeLeaf, 0).unwrap();
        assert_eq!(again.rl().get_address(), address);
        assert!(!pm.is_page_free(address));
    }

    #[test]
    fn test_multiple_blob_pages_are_adjacent() {
        let mut pm = setup_pm(1 << 20);
        let head = pm.alloc_multiple_blob_pages(3).unwrap();
        let head_address = head.rl().get_address();

        for i in 1..3u64 {
            let page = pm
                .fetch_page(head_address + i * 1024, FETCH_NO_HEADER)
                .unwrap();
            assert!(!page.rl().has_header());
        }
        assert!(head.rl().has_header());
        assert_eq!(head.rl().get_type(), PageType::Blob);
    }

    #[test]
    fn test_state_roundtrip() {
        let device = pod(Device::in_memory(1024));
        let changeset = pod(Changeset::new(device.clone(), false));
        let mut pm = PageManager::new(
            device.clone(),
            changeset.clone(),
            1 << 20,
            1024,
            false,
            false,
            false,
        );

        // pages must exist in the device before they can be freed
        let mut addresses = Vec::new();
        for _ in 0..5 {
            let page = pm.alloc_page(PageType::Blob, 0).unwrap();
            addresses.push(page.rl().get_address());
        }
        pm.add_to_free_map(addresses[1], 1);
        pm.add_to_free_map(addresses[3], 2);

        let state = pm.store_state().unwrap();
        assert_ne!(state, 0);
        pm.flush_all_pages(false).unwrap();

        let mut pm2 = PageManager::new(
            device,
            changeset,
            1 << 20,
            1024,
            false,
            false,
            false,
        );
        pm2.load_state(state).unwrap();
        assert!(pm2.is_page_free(addresses[1]));
        assert!(pm2.is_page_free(addresses[3]));
        assert_eq!(pm2.free_page_count(), 3);
    }

    #[test]
    fn test_purge_evicts_old_clean_pages() {
        let device = pod(Device::in_memory(1024));
        let changeset = pod(Changeset::new(device.clone(), false));
        // a 10-page cache over a persistent backend
        let mut pm = PageManager::new(
            device, changeset, 10 * 1024, 1024, false, false, false,
        );

        let mut addresses = Vec::new();
        for i in 0..30u8 {
            let page = pm.alloc_page(PageType::Blob, 0).unwrap();
            {
                let mut p = page.wl();
                p.payload_mut()[0] = i;
            }
            addresses.push(page.rl().get_address());
        }
        assert!(pm.cache.is_full());

        // age the early pages past the purge threshold
        for _ in 0..(PURGE_THRESHOLD + 50) {
            pm.fetch_page(addresses[29], 0).unwrap();
        }
        pm.purge_cache().unwrap();
        assert!(pm.cache.len() < 30);

        // evicted pages were flushed and can be fetched back intact
        for (i, address) in addresses.iter().enumerate() {
            let page = pm.fetch_page(*address, 0).unwrap();
            assert_eq!(page.rl().payload()[0], i as u8);
        }
    }

    #[test]
    fn test_purge_skips_pages_with_coupled_cursors() {
        let device = pod(Device::in_memory(1024));
        let changeset = pod(Changeset::new(device.clone(), false));
        let mut pm = PageManager::new(
            device, changeset, 2 * 1024, 1024, false, false, false,
        );

        let pinned = pm.alloc_page(PageType::BtreeLeaf, 0).unwrap();
        pinned.wl().couple_cursor();
        let pinned_address = pinned.rl().get_address();

        for _ in 0..10 {
            pm.alloc_page(PageType::Blob, 0).unwrap();
        }

        // age everything (the pinned page included) by hammering one
        // hot page
        let hot = pm.alloc_page(PageType::Blob, 0).unwrap();
        let hot_address = hot.rl().get_address();
        drop(hot);
        for _ in 0..(PURGE_THRESHOLD + 50) {
            pm.fetch_page(hot_address, 0).unwrap();
        }

        pm.purge_cache().unwrap();
        // the stale but coupled page is still cached
        assert!(pm.cache.get(pinned_address).is_some());
    }

    #[test]
    fn test_reclaim_truncates_tail() {
        let device = pod(Device::in_memory(1024));
        let changeset = pod(Changeset::new(device.clone(), false));
        let mut pm = PageManager::new(
            device.clone(),
            changeset,
            1 << 20,
            1024,
            false,
            false,
            false,
        );

        let mut addresses = Vec::new();
        for _ in 0..4 {
            let page = pm.alloc_page(PageType::Blob, 0).unwrap();
            addresses.push(page.rl().get_address());
        }
        let size_before = device.rl().file_size().unwrap();

        // free the last two pages; both should be truncated away
        pm.add_to_free_map(addresses[2], 1);
        pm.add_to_free_map(addresses[3], 1);
        pm.reclaim_space().unwrap();

        let size_after = device.rl().file_size().unwrap();
        assert_eq!(size_after, size_before - 2 * 1024);
        assert_eq!(pm.free_page_count(), 0);
    }
}
