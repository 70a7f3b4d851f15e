use std::collections::HashMap;

use log::debug;

use crate::{
    error::{ErrorKind, GroveError},
    freelist::{Freelist, BLOB_ALIGNMENT},
    io::{get_u32, get_u64, set_u32, set_u64},
    page_manager::{PageManager, FETCH_NO_HEADER},
    types::{GroveResult, Pod},
    utils::{align_up, HandyRwLock},
};

/// On-disk blob header, stored right before the payload.
///
///   0  u64  allocated bytes (the reserved region, header included)
///   8  u32  payload size
///   12 u32  flags
pub const BLOB_HEADER_SIZE: u64 = 16;

const BLOB_FLAG_MULTI_PAGE: u32 = 1;

/// Offset of the first blob inside a fresh blob page; the page header
/// rounded up to the freelist alignment.
const FIRST_CHUNK_OFFSET: u64 = 32;

/// Stores variable-length records. Payloads that fit into a single page
/// are placed via the freelist; larger payloads span a run of contiguous
/// blob pages. A blob is addressed by its absolute byte offset.
///
/// In-memory environments keep blobs in a heap arena instead; the blob id
/// is an opaque handle into it.
#[derive(Debug)]
pub struct BlobManager {
    page_manager: Pod<PageManager>,
    freelist: Pod<Freelist>,
    page_size: usize,

    in_memory: bool,
    arena: HashMap<u64, Vec<u8>>,
    next_arena_id: u64,

    pub blobs_allocated: u64,
    pub blobs_freed: u64,
}

impl BlobManager {
    pub fn new(
        page_manager: Pod<PageManager>,
        freelist: Pod<Freelist>,
        page_size: usize,
        in_memory: bool,
    ) -> Self {
        Self {
            page_manager,
            freelist,
            page_size,
            in_memory,
            arena: HashMap::new(),
            next_arena_id: 1,
            blobs_allocated: 0,
            blobs_freed: 0,
        }
    }

    pub fn allocate(&mut self, data: &[u8]) -> GroveResult<u64> {
        self.blobs_allocated += 1;

        if self.in_memory {
            let id = self.next_arena_id;
            self.next_arena_id += 1;
            self.arena.insert(id, data.to_vec());
            return Ok(id);
        }

        let total = align_up(BLOB_HEADER_SIZE + data.len() as u64,
                             BLOB_ALIGNMENT);
        let max_single = (self.page_size as u64) - FIRST_CHUNK_OFFSET;

        let blob_id = if total <= max_single {
            self.allocate_single(total)?
        } else {
            self.allocate_multi(total)?
        };

        let mut header = [0u8; BLOB_HEADER_SIZE as usize];
        set_u64(&mut header, 0, total);
        set_u32(&mut header, 8, data.len() as u32);
        set_u32(
            &mut header,
            12,
            if total <= max_single {
                0
            } else {
                BLOB_FLAG_MULTI_PAGE
            },
        );

        self.write_chunk(blob_id, &header)?;
        self.write_chunk(blob_id + BLOB_HEADER_SIZE, data)?;

        debug!("allocated blob {} with {} bytes", blob_id, data.len());
        Ok(blob_id)
    }

    fn allocate_single(&mut self, total: u64) -> GroveResult<u64> {
        if let Some(address) =
            self.freelist.wl().alloc_area(total, false, 0)?
        {
            return Ok(address);
        }

        // no free area anywhere: open a fresh blob page and return the
        // unused remainder to the freelist
        let page = self
            .page_manager
            .wl()
            .alloc_page(crate::page::PageType::Blob, 0)?;
        let page_address = page.rl().get_address();

        let blob_id = page_address + FIRST_CHUNK_OFFSET;
        let remainder_start = blob_id + total;
        let page_end = page_address + self.page_size as u64;
        if remainder_start < page_end {
            self.freelist
                .wl()
                .free_area(remainder_start, page_end - remainder_start)?;
        }
        Ok(blob_id)
    }

    fn allocate_multi(&mut self, total: u64) -> GroveResult<u64> {
        let needed = FIRST_CHUNK_OFFSET + total;
        let num_pages =
            ((needed + self.page_size as u64 - 1) / self.page_size as u64)
                as usize;
        let head = self
            .page_manager
            .wl()
            .alloc_multiple_blob_pages(num_pages)?;
        let addr = head.rl().get_address() + FIRST_CHUNK_OFFSET;
        Ok(addr)
    }

    /// Returns the blob's payload.
    pub fn read(&mut self, blob_id: u64) -> GroveResult<Vec<u8>> {
        if self.in_memory {
            return self
                .arena
                .get(&blob_id)
                .cloned()
                .ok_or_else(|| GroveError::internal("unknown blob id"));
        }

        let (_allocated, size, _flags) = self.read_header(blob_id)?;
        self.read_chunk(blob_id + BLOB_HEADER_SIZE, size as usize)
    }

    pub fn get_blob_size(&mut self, blob_id: u64) -> GroveResult<u64> {
        if self.in_memory {
            return self
                .arena
                .get(&blob_id)
                .map(|b| b.len() as u64)
                .ok_or_else(|| GroveError::internal("unknown blob id"));
        }
        let (_allocated, size, _flags) = self.read_header(blob_id)?;
        Ok(size as u64)
    }

    /// Overwrites the blob in place when the new payload still fits the
    /// existing allocation, otherwise frees and re-allocates. Returns the
    /// (possibly new) blob id.
    pub fn overwrite(
        &mut self,
        blob_id: u64,
        data: &[u8],
    ) -> GroveResult<u64> {
        if self.in_memory {
            match self.arena.get_mut(&blob_id) {
                Some(slot) => {
                    *slot = data.to_vec();
                    return Ok(blob_id);
                }
                None => {
                    return Err(GroveError::internal("unknown blob id"));
                }
            }
        }

        let (allocated, _size, flags) = self.read_header(blob_id)?;
        let needed = BLOB_HEADER_SIZE + data.len() as u64;

        if needed <= allocated {
            let mut header = [0u8; BLOB_HEADER_SIZE as usize];
            set_u64(&mut header, 0, allocated);
            set_u32(&mut header, 8, data.len() as u32);
            set_u32(&mut header, 12, flags);
            self.write_chunk(blob_id, &header)?;
            self.write_chunk(blob_id + BLOB_HEADER_SIZE, data)?;
            return Ok(blob_id);
        }

        self.free(blob_id)?;
        self.allocate(data)
    }

    /// Releases the blob's allocation: bitmap bits for single-page blobs,
    /// whole pages for multi-page blobs.
    pub fn free(&mut self, blob_id: u64) -> GroveResult {
        self.blobs_freed += 1;

        if self.in_memory {
            self.arena.remove(&blob_id);
            return Ok(());
        }

        let (allocated, _size, flags) = self.read_header(blob_id)?;

        if flags & BLOB_FLAG_MULTI_PAGE != 0 {
            let head = blob_id - FIRST_CHUNK_OFFSET;
            debug_assert_eq!(head % self.page_size as u64, 0);
            let num_pages = ((FIRST_CHUNK_OFFSET + allocated
                + self.page_size as u64
                - 1)
                / self.page_size as u64) as usize;
            self.page_manager.wl().add_to_free_map(head, num_pages);
        } else {
            self.freelist.wl().free_area(blob_id, allocated)?;
        }

        debug!("freed blob {}", blob_id);
        Ok(())
    }

    fn read_header(&mut self, blob_id: u64) -> GroveResult<(u64, u32, u32)> {
        let header = self.read_chunk(blob_id, BLOB_HEADER_SIZE as usize)?;
        let allocated = get_u64(&header, 0);
        let size = get_u32(&header, 8);
        let flags = get_u32(&header, 12);
        if allocated == 0 {
            return Err(GroveError::new(
                ErrorKind::InternalError,
                &format!("blob {} has an empty header", blob_id),
            ));
        }
        Ok((allocated, size, flags))
    }

    /// Copies `data` into the pages covering `[address, address+len)`.
    /// The first page of a blob run carries a regular header; every later
    /// page belongs to the payload in full and is fetched without header
    /// semantics.
    fn write_chunk(&mut self, address: u64, data: &[u8]) -> GroveResult {
        let page_size = self.page_size as u64;
        let head_page = address - address % page_size;
        let mut cursor = 0usize;
        let mut address = address;

        while cursor < data.len() {
            let page_address = address - address % page_size;
            let offset = (address % page_size) as usize;
            let extent = (data.len() - cursor).min(self.page_size - offset);

            let fetch_flags = if page_address == head_page {
                0
            } else {
                FETCH_NO_HEADER
            };
            let page = self
                .page_manager
                .wl()
                .fetch_page(page_address, fetch_flags)?;
            {
                let mut p = page.wl();
                p.raw_data_mut()[offset..offset + extent]
                    .copy_from_slice(&data[cursor..cursor + extent]);
                p.set_dirty(true);
            }

            cursor += extent;
            address += extent as u64;
        }
        Ok(())
    }

    fn read_chunk(&mut self, address: u64, len: usize) -> GroveResult<Vec<u8>> {
        let page_size = self.page_size as u64;
        let head_page = address - address % page_size;
        let mut out = Vec::with_capacity(len);
        let mut address = address;

        while out.len() < len {
            let page_address = address - address % page_size;
            let offset = (address % page_size) as usize;
            let extent = (len - out.len()).min(self.page_size - offset);

            let fetch_flags = if page_address == head_page {
                0
            } else {
                FETCH_NO_HEADER
            };
            let page = self
                .page_manager
                .wl()
                .fetch_page(page_address, fetch_flags)?;
            {
                let p = page.rl();
                out.extend_from_slice(&p.raw_data()[offset..offset + extent]);
            }

            address += extent as u64;
        }
        Ok(out)
    }
}
