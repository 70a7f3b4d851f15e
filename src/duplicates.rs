use log::debug;

use crate::{
    blob::BlobManager,
    btree::node::{RecordDescriptor, RECORD_DESCRIPTOR_SIZE},
    error::{ErrorKind, GroveError},
    io::{get_u32, set_u32},
    types::{GroveResult, Pod},
    utils::HandyRwLock,
};

// insert flags, also used by the cursor layer
pub const DUPE_INSERT_BEFORE: u32 = 1;
pub const DUPE_INSERT_AFTER: u32 = 2;
pub const DUPE_INSERT_FIRST: u32 = 4;
pub const DUPE_INSERT_LAST: u32 = 8;
pub const DUPE_OVERWRITE: u32 = 16;

const INITIAL_CAPACITY: u32 = 8;

/// A duplicate table is a growable array of record descriptors stored as
/// a blob:
///
///   0  u32  capacity
///   4  u32  count
///   8  ...  capacity * record descriptors
///
/// Capacity doubles on overflow; the order of the entries is controlled
/// by the caller (insert first/last/before/after the given position).
#[derive(Debug)]
pub struct DuplicateManager {
    blob_manager: Pod<BlobManager>,
}

struct DupeTable {
    capacity: u32,
    entries: Vec<RecordDescriptor>,
}

impl DupeTable {
    fn decode(bytes: &[u8]) -> GroveResult<DupeTable> {
        if bytes.len() < 8 {
            return Err(GroveError::new(
                ErrorKind::InternalError,
                "duplicate table blob is too short",
            ));
        }
        let capacity = get_u32(bytes, 0);
        let count = get_u32(bytes, 4);
        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let offset = 8 + i * RECORD_DESCRIPTOR_SIZE;
            entries.push(RecordDescriptor::decode(
                &bytes[offset..offset + RECORD_DESCRIPTOR_SIZE],
            ));
        }
        Ok(DupeTable { capacity, entries })
    }

    fn encode(&self) -> Vec<u8> {
        let mut bytes =
            vec![0u8; 8 + self.capacity as usize * RECORD_DESCRIPTOR_SIZE];
        set_u32(&mut bytes, 0, self.capacity);
        set_u32(&mut bytes, 4, self.entries.len() as u32);
        for (i, entry) in self.entries.iter().enumerate() {
            let offset = 8 + i * RECORD_DESCRIPTOR_SIZE;
            bytes[offset..offset + RECORD_DESCRIPTOR_SIZE]
                .copy_from_slice(&entry.encode());
        }
        bytes
    }
}

impl DuplicateManager {
    pub fn new(blob_manager: Pod<BlobManager>) -> Self {
        Self { blob_manager }
    }

    fn load(&self, table_id: u64) -> GroveResult<DupeTable> {
        let bytes = self.blob_manager.wl().read(table_id)?;
        DupeTable::decode(&bytes)
    }

    /// Persists a modified table; grows the blob when the capacity
    /// changed. Returns the (possibly new) table id.
    fn store(&self, table_id: u64, table: &DupeTable) -> GroveResult<u64> {
        self.blob_manager.wl().overwrite(table_id, &table.encode())
    }

    /// Creates a table holding the given initial entries (typically the
    /// key's existing record plus the first duplicate).
    pub fn create_table(
        &self,
        entries: &[RecordDescriptor],
    ) -> GroveResult<u64> {
        let mut capacity = INITIAL_CAPACITY;
        while (entries.len() as u32) > capacity {
            capacity *= 2;
        }
        let table = DupeTable {
            capacity,
            entries: entries.to_vec(),
        };
        let id = self.blob_manager.wl().allocate(&table.encode())?;
        debug!("created duplicate table {}", id);
        Ok(id)
    }

    /// Inserts a descriptor. `position` is the reference index for
    /// BEFORE/AFTER; the default appends. Returns the new table id and
    /// the index the entry ended up at.
    pub fn insert(
        &self,
        table_id: u64,
        desc: RecordDescriptor,
        position: u32,
        flags: u32,
    ) -> GroveResult<(u64, u32)> {
        let mut table = self.load(table_id)?;
        let count = table.entries.len() as u32;

        if flags & DUPE_OVERWRITE != 0 {
            if position >= count {
                return Err(GroveError::key_not_found());
            }
            let old = table.entries[position as usize].clone();
            self.free_record(&old)?;
            table.entries[position as usize] = desc;
            let new_id = self.store(table_id, &table)?;
            return Ok((new_id, position));
        }

        let position = if flags & DUPE_INSERT_BEFORE != 0 {
            position.min(count)
        } else if flags & DUPE_INSERT_AFTER != 0 {
            (position + 1).min(count)
        } else if flags & DUPE_INSERT_FIRST != 0 {
            0
        } else {
            // DUPE_INSERT_LAST and the default
            count
        };

        if count + 1 > table.capacity {
            table.capacity *= 2;
        }
        table.entries.insert(position as usize, desc);

        let new_id = self.store(table_id, &table)?;
        Ok((new_id, position))
    }

    /// Erases the entry at `position`, or the whole table. Frees the
    /// referenced blob records. Returns the new table id, or 0 when the
    /// table itself is gone.
    pub fn erase(
        &self,
        table_id: u64,
        position: u32,
        erase_all: bool,
    ) -> GroveResult<u64> {
        let mut table = self.load(table_id)?;
        let count = table.entries.len() as u32;

        if erase_all || (count == 1 && position == 0) {
            for entry in &table.entries {
                self.free_record(entry)?;
            }
            self.blob_manager.wl().free(table_id)?;
            return Ok(0);
        }

        if position >= count {
            return Err(GroveError::key_not_found());
        }
        let removed = table.entries.remove(position as usize);
        self.free_record(&removed)?;

        if table.entries.is_empty() {
            self.blob_manager.wl().free(table_id)?;
            return Ok(0);
        }

        self.store(table_id, &table)
    }

    pub fn count(&self, table_id: u64) -> GroveResult<u32> {
        let table = self.load(table_id)?;
        Ok(table.entries.len() as u32)
    }

    pub fn get(
        &self,
        table_id: u64,
        position: u32,
    ) -> GroveResult<RecordDescriptor> {
        let table = self.load(table_id)?;
        table
            .entries
            .get(position as usize)
            .cloned()
            .ok_or_else(GroveError::key_not_found)
    }

    pub fn get_all(
        &self,
        table_id: u64,
    ) -> GroveResult<Vec<RecordDescriptor>> {
        let table = self.load(table_id)?;
        Ok(table.entries)
    }

    /// Frees the blob behind a record descriptor; inline records have
    /// nothing to free.
    pub fn free_record(&self, desc: &RecordDescriptor) -> GroveResult {
        if let RecordDescriptor::Blob(id) = desc {
            self.blob_manager.wl().free(*id)?;
        }
        Ok(())
    }
}
