use std::cmp::Ordering;

use crate::{
    io::{get_u16, get_u32, get_u64, set_u16, set_u32, set_u64},
    page::{Page, PageType, PAGE_HEADER_SIZE},
};

/// Node header, stored at the beginning of the page payload. The entry
/// count lives in the page header itself.
///
///   0  u32  flags (bit 0 = leaf)
///   4  u32  padding
///   8  u64  left sibling address
///   16 u64  right sibling address
///   24 u64  ptr_down (rightmost child; internal nodes only)
pub const NODE_HEADER_SIZE: usize = 32;

const NODE_OFF_FLAGS: usize = 0;
const NODE_OFF_LEFT: usize = 8;
const NODE_OFF_RIGHT: usize = 16;
const NODE_OFF_PTR_DOWN: usize = 24;

const NODE_FLAG_LEAF: u32 = 1;

/// Size of an encoded record descriptor: a one-byte discriminator
/// followed by 8 bytes of payload.
pub const RECORD_DESCRIPTOR_SIZE: usize = 9;

const DESC_EMPTY: u8 = 0;
const DESC_TINY: u8 = 1;
const DESC_SMALL: u8 = 2;
const DESC_BLOB: u8 = 3;
const DESC_DUP_TABLE: u8 = 4;

/// Maximum record size that is stored inline in the leaf slot instead of
/// a blob.
pub const MAX_INLINE_RECORD_SIZE: usize = 8;

/// What a leaf slot holds for its key.
///
/// Tiny records keep their length in the last payload byte; small
/// records are exactly 8 bytes; blob and duplicate-table ids are
/// absolute byte offsets.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordDescriptor {
    Empty,
    Tiny(Vec<u8>),
    Small([u8; 8]),
    Blob(u64),
    DupTable(u64),
}

impl RecordDescriptor {
    /// Builds an inline descriptor when the record fits into the slot.
    pub fn inline_from(data: &[u8]) -> Option<RecordDescriptor> {
        match data.len() {
            0 => Some(RecordDescriptor::Empty),
            1..=7 => Some(RecordDescriptor::Tiny(data.to_vec())),
            8 => {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(data);
                Some(RecordDescriptor::Small(buf))
            }
            _ => None,
        }
    }

    pub fn encode(&self) -> [u8; RECORD_DESCRIPTOR_SIZE] {
        let mut buf = [0u8; RECORD_DESCRIPTOR_SIZE];
        match self {
            RecordDescriptor::Empty => {
                buf[0] = DESC_EMPTY;
            }
            RecordDescriptor::Tiny(data) => {
                debug_assert!(data.len() < 8);
                buf[0] = DESC_TINY;
                buf[1..1 + data.len()].copy_from_slice(data);
                buf[8] = data.len() as u8;
            }
            RecordDescriptor::Small(data) => {
                buf[0] = DESC_SMALL;
                buf[1..9].copy_from_slice(data);
            }
            RecordDescriptor::Blob(id) => {
                buf[0] = DESC_BLOB;
                buf[1..9].copy_from_slice(&id.to_le_bytes());
            }
            RecordDescriptor::DupTable(id) => {
                buf[0] = DESC_DUP_TABLE;
                buf[1..9].copy_from_slice(&id.to_le_bytes());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> RecordDescriptor {
        debug_assert!(buf.len() >= RECORD_DESCRIPTOR_SIZE);
        match buf[0] {
            DESC_TINY => {
                let len = buf[8] as usize;
                RecordDescriptor::Tiny(buf[1..1 + len].to_vec())
            }
            DESC_SMALL => {
                let mut data = [0u8; 8];
                data.copy_from_slice(&buf[1..9]);
                RecordDescriptor::Small(data)
            }
            DESC_BLOB => {
                let mut id = [0u8; 8];
                id.copy_from_slice(&buf[1..9]);
                RecordDescriptor::Blob(u64::from_le_bytes(id))
            }
            DESC_DUP_TABLE => {
                let mut id = [0u8; 8];
                id.copy_from_slice(&buf[1..9]);
                RecordDescriptor::DupTable(u64::from_le_bytes(id))
            }
            _ => RecordDescriptor::Empty,
        }
    }

    /// The inline payload, for descriptors that carry one.
    pub fn inline_data(&self) -> Option<&[u8]> {
        match self {
            RecordDescriptor::Empty => Some(&[]),
            RecordDescriptor::Tiny(data) => Some(data),
            RecordDescriptor::Small(data) => Some(data),
            _ => None,
        }
    }
}

/// Typed access to a B+tree node stored in a page.
///
/// Both node variants share the header; leaf slots hold
/// (key length, padded key bytes, record descriptor), internal slots
/// hold (key length, padded key bytes, child address). The proxy carries
/// the database's key size; the page supplies everything else.
#[derive(Clone, Copy)]
#[derive(Debug)]
pub struct NodeProxy {
    pub key_size: usize,
    pub page_size: usize,
}

impl NodeProxy {
    pub fn new(key_size: usize, page_size: usize) -> Self {
        Self {
            key_size,
            page_size,
        }
    }

    fn leaf_slot_size(&self) -> usize {
        2 + self.key_size + RECORD_DESCRIPTOR_SIZE
    }

    fn internal_slot_size(&self) -> usize {
        2 + self.key_size + 8
    }

    fn slot_size(&self, leaf: bool) -> usize {
        if leaf {
            self.leaf_slot_size()
        } else {
            self.internal_slot_size()
        }
    }

    fn usable(&self) -> usize {
        self.page_size - PAGE_HEADER_SIZE - NODE_HEADER_SIZE
    }

    pub fn leaf_capacity(&self) -> usize {
        self.usable() / self.leaf_slot_size()
    }

    pub fn internal_capacity(&self) -> usize {
        self.usable() / self.internal_slot_size()
    }

    pub fn capacity(&self, page: &Page) -> usize {
        if self.is_leaf(page) {
            self.leaf_capacity()
        } else {
            self.internal_capacity()
        }
    }

    /// Initializes an empty node in a freshly allocated page.
    pub fn init(&self, page: &mut Page, leaf: bool) {
        page.set_count(0);
        page.set_type(if leaf {
            PageType::BtreeLeaf
        } else {
            PageType::BtreeInternal
        });
        let payload = page.payload_mut();
        for b in payload[..NODE_HEADER_SIZE].iter_mut() {
            *b = 0;
        }
        set_u32(
            payload,
            NODE_OFF_FLAGS,
            if leaf { NODE_FLAG_LEAF } else { 0 },
        );
        page.set_dirty(true);
    }

    pub fn is_leaf(&self, page: &Page) -> bool {
        get_u32(page.payload(), NODE_OFF_FLAGS) & NODE_FLAG_LEAF != 0
    }

    pub fn count(&self, page: &Page) -> usize {
        page.get_count() as usize
    }

    pub fn set_count(&self, page: &mut Page, count: usize) {
        page.set_count(count as u32);
    }

    pub fn left(&self, page: &Page) -> u64 {
        get_u64(page.payload(), NODE_OFF_LEFT)
    }

    pub fn set_left(&self, page: &mut Page, address: u64) {
        set_u64(page.payload_mut(), NODE_OFF_LEFT, address);
        page.set_dirty(true);
    }

    pub fn right(&self, page: &Page) -> u64 {
        get_u64(page.payload(), NODE_OFF_RIGHT)
    }

    pub fn set_right(&self, page: &mut Page, address: u64) {
        set_u64(page.payload_mut(), NODE_OFF_RIGHT, address);
        page.set_dirty(true);
    }

    pub fn ptr_down(&self, page: &Page) -> u64 {
        get_u64(page.payload(), NODE_OFF_PTR_DOWN)
    }

    pub fn set_ptr_down(&self, page: &mut Page, address: u64) {
        set_u64(page.payload_mut(), NODE_OFF_PTR_DOWN, address);
        page.set_dirty(true);
    }

    fn slot_offset(&self, page: &Page, slot: usize) -> usize {
        NODE_HEADER_SIZE + slot * self.slot_size(self.is_leaf(page))
    }

    pub fn key<'a>(&self, page: &'a Page, slot: usize) -> &'a [u8] {
        debug_assert!(slot < self.count(page));
        let offset = self.slot_offset(page, slot);
        let payload = page.payload();
        let len = get_u16(payload, offset) as usize;
        &payload[offset + 2..offset + 2 + len]
    }

    pub fn set_key(&self, page: &mut Page, slot: usize, key: &[u8]) {
        debug_assert!(key.len() <= self.key_size);
        let offset = self.slot_offset(page, slot);
        let key_size = self.key_size;
        let payload = page.payload_mut();
        set_u16(payload, offset, key.len() as u16);
        payload[offset + 2..offset + 2 + key.len()].copy_from_slice(key);
        for b in payload[offset + 2 + key.len()..offset + 2 + key_size]
            .iter_mut()
        {
            *b = 0;
        }
        page.set_dirty(true);
    }

    pub fn record(&self, page: &Page, slot: usize) -> RecordDescriptor {
        debug_assert!(self.is_leaf(page));
        let offset = self.slot_offset(page, slot) + 2 + self.key_size;
        RecordDescriptor::decode(
            &page.payload()[offset..offset + RECORD_DESCRIPTOR_SIZE],
        )
    }

    pub fn set_record(
        &self,
        page: &mut Page,
        slot: usize,
        desc: &RecordDescriptor,
    ) {
        debug_assert!(self.is_leaf(page));
        let offset = self.slot_offset(page, slot) + 2 + self.key_size;
        let encoded = desc.encode();
        page.payload_mut()[offset..offset + RECORD_DESCRIPTOR_SIZE]
            .copy_from_slice(&encoded);
        page.set_dirty(true);
    }

    pub fn child(&self, page: &Page, slot: usize) -> u64 {
        debug_assert!(!self.is_leaf(page));
        let offset = self.slot_offset(page, slot) + 2 + self.key_size;
        get_u64(page.payload(), offset)
    }

    pub fn set_child(&self, page: &mut Page, slot: usize, address: u64) {
        debug_assert!(!self.is_leaf(page));
        let offset = self.slot_offset(page, slot) + 2 + self.key_size;
        set_u64(page.payload_mut(), offset, address);
        page.set_dirty(true);
    }

    /// Binary search for `key`. Returns `Ok(slot)` for an exact match or
    /// `Err(insertion point)` otherwise.
    pub fn search(
        &self,
        page: &Page,
        key: &[u8],
        cmp: fn(&[u8], &[u8]) -> Ordering,
    ) -> Result<usize, usize> {
        let mut lo = 0;
        let mut hi = self.count(page);
        while lo < hi {
            let mid = (lo + hi) / 2;
            match cmp(self.key(page, mid), key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    /// Opens a gap at `slot` by shifting all later slots one to the
    /// right. The gap's content is undefined until the caller fills it.
    pub fn insert_slot(&self, page: &mut Page, slot: usize) {
        let count = self.count(page);
        debug_assert!(slot <= count);
        debug_assert!(count < self.capacity(page));

        let slot_size = self.slot_size(self.is_leaf(page));
        let start = NODE_HEADER_SIZE + slot * slot_size;
        let end = NODE_HEADER_SIZE + count * slot_size;
        let payload = page.payload_mut();
        payload.copy_within(start..end, start + slot_size);

        self.set_count(page, count + 1);
        page.set_dirty(true);
    }

    pub fn remove_slot(&self, page: &mut Page, slot: usize) {
        let count = self.count(page);
        debug_assert!(slot < count);

        let slot_size = self.slot_size(self.is_leaf(page));
        let start = NODE_HEADER_SIZE + (slot + 1) * slot_size;
        let end = NODE_HEADER_SIZE + count * slot_size;
        let payload = page.payload_mut();
        payload.copy_within(start..end, start - slot_size);

        self.set_count(page, count - 1);
        page.set_dirty(true);
    }

    /// Copies the raw slots `[from, from+n)` of `src` to position `at` of
    /// `dst`, which must already provide the space (same node variant on
    /// both sides). Counts are not touched.
    pub fn copy_slots(
        &self,
        src: &Page,
        from: usize,
        n: usize,
        dst: &mut Page,
        at: usize,
    ) {
        debug_assert_eq!(self.is_leaf(src), self.is_leaf(dst));
        let slot_size = self.slot_size(self.is_leaf(src));
        let src_start = NODE_HEADER_SIZE + from * slot_size;
        let dst_start = NODE_HEADER_SIZE + at * slot_size;
        let len = n * slot_size;
        dst.payload_mut()[dst_start..dst_start + len]
            .copy_from_slice(&src.payload()[src_start..src_start + len]);
        dst.set_dirty(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 1024;

    fn proxy() -> NodeProxy {
        NodeProxy::new(16, PAGE_SIZE)
    }

    fn binary_cmp(a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    #[test]
    fn test_record_descriptor_roundtrip() {
        let descs = vec![
            RecordDescriptor::Empty,
            RecordDescriptor::Tiny(b"tiny".to_vec()),
            RecordDescriptor::Small(*b"exactly8"),
            RecordDescriptor::Blob(0xdeadbeef),
            RecordDescriptor::DupTable(77),
        ];
        for desc in descs {
            let encoded = desc.encode();
            assert_eq!(RecordDescriptor::decode(&encoded), desc);
        }
    }

    #[test]
    fn test_inline_from() {
        assert_eq!(
            RecordDescriptor::inline_from(b""),
            Some(RecordDescriptor::Empty)
        );
        assert_eq!(
            RecordDescriptor::inline_from(b"abc"),
            Some(RecordDescriptor::Tiny(b"abc".to_vec()))
        );
        assert_eq!(
            RecordDescriptor::inline_from(b"12345678"),
            Some(RecordDescriptor::Small(*b"12345678"))
        );
        assert_eq!(RecordDescriptor::inline_from(b"123456789"), None);
    }

    #[test]
    fn test_leaf_slots_sorted_insert() {
        let np = proxy();
        let mut page = Page::new(0, PAGE_SIZE);
        np.init(&mut page, true);
        assert!(np.is_leaf(&page));

        for (i, key) in [b"bbb", b"ddd", b"fff"].iter().enumerate() {
            np.insert_slot(&mut page, i);
            np.set_key(&mut page, i, *key);
            np.set_record(&mut page, i, &RecordDescriptor::Empty);
        }

        // insert in the middle
        let pos = np.search(&page, b"ccc", binary_cmp).unwrap_err();
        assert_eq!(pos, 1);
        np.insert_slot(&mut page, pos);
        np.set_key(&mut page, pos, b"ccc");
        np.set_record(
            &mut page,
            pos,
            &RecordDescriptor::Tiny(b"r".to_vec()),
        );

        assert_eq!(np.count(&page), 4);
        assert_eq!(np.key(&page, 0), b"bbb");
        assert_eq!(np.key(&page, 1), b"ccc");
        assert_eq!(np.key(&page, 2), b"ddd");
        assert_eq!(np.key(&page, 3), b"fff");
        assert_eq!(
            np.record(&page, 1),
            RecordDescriptor::Tiny(b"r".to_vec())
        );
        assert_eq!(np.search(&page, b"ddd", binary_cmp), Ok(2));
    }

    #[test]
    fn test_remove_slot() {
        let np = proxy();
        let mut page = Page::new(0, PAGE_SIZE);
        np.init(&mut page, true);

        for (i, key) in [b"a", b"b", b"c"].iter().enumerate() {
            np.insert_slot(&mut page, i);
            np.set_key(&mut page, i, *key);
            np.set_record(&mut page, i, &RecordDescriptor::Empty);
        }
        np.remove_slot(&mut page, 1);
        assert_eq!(np.count(&page), 2);
        assert_eq!(np.key(&page, 0), b"a");
        assert_eq!(np.key(&page, 1), b"c");
    }

    #[test]
    fn test_internal_children() {
        let np = proxy();
        let mut page = Page::new(0, PAGE_SIZE);
        np.init(&mut page, false);
        assert!(!np.is_leaf(&page));

        np.insert_slot(&mut page, 0);
        np.set_key(&mut page, 0, b"mmm");
        np.set_child(&mut page, 0, 4096);
        np.set_ptr_down(&mut page, 8192);

        assert_eq!(np.child(&page, 0), 4096);
        assert_eq!(np.ptr_down(&page), 8192);
    }

    #[test]
    fn test_copy_slots_between_pages() {
        let np = proxy();
        let mut src = Page::new(0, PAGE_SIZE);
        let mut dst = Page::new(PAGE_SIZE as u64, PAGE_SIZE);
        np.init(&mut src, true);
        np.init(&mut dst, true);

        for (i, key) in [b"k1", b"k2", b"k3", b"k4"].iter().enumerate() {
            np.insert_slot(&mut src, i);
            np.set_key(&mut src, i, *key);
            np.set_record(&mut src, i, &RecordDescriptor::Empty);
        }

        np.copy_slots(&src, 2, 2, &mut dst, 0);
        np.set_count(&mut dst, 2);
        assert_eq!(np.key(&dst, 0), b"k3");
        assert_eq!(np.key(&dst, 1), b"k4");
    }
}
