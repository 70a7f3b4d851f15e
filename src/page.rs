use crate::io::{get_u32, get_u64, set_u32, set_u64};

/// Size of the persisted page header. The payload starts right after it.
pub const PAGE_HEADER_SIZE: usize = 24;

// header layout:
//   0  u8   page type
//   1  u8   reserved
//   2  u16  reserved
//   4  u32  crc32 of the payload (when crc checking is enabled)
//   8  u64  overflow pointer (freelist / page-manager state chains)
//   16 u32  count (entries stored in this page, meaning depends on type)
//   20 u32  padding
const OFF_TYPE: usize = 0;
const OFF_CRC: usize = 4;
const OFF_OVERFLOW: usize = 8;
const OFF_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Unknown = 0,
    Header = 1,
    BtreeRoot = 2,
    BtreeInternal = 3,
    BtreeLeaf = 4,
    Blob = 5,
    PageManager = 6,
    Freelist = 7,
}

impl PageType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => PageType::Header,
            2 => PageType::BtreeRoot,
            3 => PageType::BtreeInternal,
            4 => PageType::BtreeLeaf,
            5 => PageType::Blob,
            6 => PageType::PageManager,
            7 => PageType::Freelist,
            _ => PageType::Unknown,
        }
    }

    pub fn is_btree(&self) -> bool {
        matches!(
            self,
            PageType::BtreeRoot | PageType::BtreeInternal | PageType::BtreeLeaf
        )
    }
}

/// A fixed-size block identified by its byte offset in the file.
///
/// Exactly one live in-memory instance exists per on-disk page; the page
/// manager owns all of them. A page is either clean (image matches disk)
/// or dirty; dirty pages must be flushed before eviction.
#[derive(Debug)]
pub struct Page {
    address: u64,
    data: Vec<u8>,
    dirty: bool,

    /// Part of a multi-page blob: the page carries no header and its full
    /// extent belongs to the blob payload. Never persisted - the header
    /// bytes of such a page are overlaid by blob content, so the flag is
    /// re-established by whoever fetches the page.
    no_header: bool,

    /// Number of cursors currently coupled to this page. The cache never
    /// evicts a page while this is non-zero.
    coupled_cursors: u32,
}

impl Page {
    pub fn new(address: u64, page_size: usize) -> Self {
        Self {
            address,
            data: vec![0; page_size],
            dirty: false,
            no_header: false,
            coupled_cursors: 0,
        }
    }

    pub fn from_bytes(address: u64, data: Vec<u8>) -> Self {
        Self {
            address,
            data,
            dirty: false,
            no_header: false,
            coupled_cursors: 0,
        }
    }

    pub fn get_address(&self) -> u64 {
        self.address
    }

    pub fn page_size(&self) -> usize {
        self.data.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn get_type(&self) -> PageType {
        PageType::from_u8(self.data[OFF_TYPE])
    }

    pub fn set_type(&mut self, t: PageType) {
        self.data[OFF_TYPE] = t as u8;
    }

    pub fn has_header(&self) -> bool {
        !self.no_header
    }

    pub fn set_no_header(&mut self, no_header: bool) {
        self.no_header = no_header;
    }

    pub fn get_overflow(&self) -> u64 {
        get_u64(&self.data, OFF_OVERFLOW)
    }

    pub fn set_overflow(&mut self, address: u64) {
        set_u64(&mut self.data, OFF_OVERFLOW, address);
    }

    pub fn get_count(&self) -> u32 {
        get_u32(&self.data, OFF_COUNT)
    }

    pub fn set_count(&mut self, count: u32) {
        set_u32(&mut self.data, OFF_COUNT, count);
    }

    /// The full page image, header included. Used by the device, the log
    /// and no-header blob pages.
    pub fn raw_data(&self) -> &[u8] {
        &self.data
    }

    pub fn raw_data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// The page content after the header.
    pub fn payload(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..]
    }

    pub fn usable_size(&self) -> usize {
        self.data.len() - PAGE_HEADER_SIZE
    }

    pub fn couple_cursor(&mut self) {
        self.coupled_cursors += 1;
    }

    pub fn uncouple_cursor(&mut self) {
        debug_assert!(self.coupled_cursors > 0);
        self.coupled_cursors -= 1;
    }

    pub fn coupled_cursors(&self) -> u32 {
        self.coupled_cursors
    }

    /// Recomputes the payload checksum. Called by the page manager right
    /// before the page image goes to the device.
    pub fn update_crc(&mut self) {
        let crc = crc32c::crc32c(&self.data[PAGE_HEADER_SIZE..]);
        set_u32(&mut self.data, OFF_CRC, crc);
    }

    pub fn verify_crc(&self) -> bool {
        let stored = get_u32(&self.data, OFF_CRC);
        // freshly created files carry zeroed checksums
        if stored == 0 {
            return true;
        }
        stored == crc32c::crc32c(&self.data[PAGE_HEADER_SIZE..])
    }
}
