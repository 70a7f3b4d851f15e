use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};

use log::{debug, info};

use crate::{
    blob::BlobManager,
    db::{Database, KeyType},
    device::Device,
    error::{ErrorKind, GroveError},
    flags::*,
    freelist::Freelist,
    io::{get_u16, get_u32, get_u64, set_u16, set_u32, set_u64},
    page::{Page, PageType, PAGE_HEADER_SIZE},
    page_manager::{PageManager, FETCH_READ_ONLY},
    transaction::{Transaction, TxnManager, TxnState},
    tx_log::{Changeset, LogManager},
    types::{pod, GroveResult, Pod},
    utils::HandyRwLock,
};

/// "GRV1", little-endian
const ENV_MAGIC: u32 = 0x31565247;
const ENV_VERSION: u32 = 4;

pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;
pub const MIN_PAGE_SIZE: usize = 1024;
pub const DEFAULT_CACHE_SIZE: u64 = 2 * 1024 * 1024;
pub const DEFAULT_MAX_DATABASES: u16 = 32;
pub const DEFAULT_KEY_SIZE: u16 = 32;

// header page payload layout
const HDR_OFF_MAGIC: usize = 0;
const HDR_OFF_VERSION: usize = 4;
const HDR_OFF_PAGE_SIZE: usize = 8;
const HDR_OFF_MAX_DBS: usize = 12;
const HDR_OFF_STATE: usize = 16;
const HDR_OFF_LSN: usize = 24;
const HDR_DESC_TABLE: usize = 32;
const DESC_SIZE: usize = 32;

// descriptor slot layout
const DESC_OFF_NAME: usize = 0;
const DESC_OFF_KEY_TYPE: usize = 2;
const DESC_OFF_KEY_SIZE: usize = 4;
const DESC_OFF_COMPRESSION: usize = 6;
const DESC_OFF_FLAGS: usize = 8;
const DESC_OFF_REC_SIZE: usize = 12;
const DESC_OFF_ROOT: usize = 16;
const DESC_OFF_RECNO: usize = 24;

const REC_SIZE_UNLIMITED: u32 = u32::MAX;

/// Installed into the page manager so it can record the head of its
/// state chain without knowing the header layout.
pub(crate) fn write_state_pageid(page: &mut Page, address: u64) {
    set_u64(page.payload_mut(), HDR_OFF_STATE, address);
}

/// Environment creation/open parameters.
#[derive(Clone)]
pub struct Parameters {
    pub page_size: usize,
    pub cache_size: u64,
    pub max_databases: u16,
    /// unix permission bits for the data file; advisory
    pub file_mode: u32,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            max_databases: DEFAULT_MAX_DATABASES,
            file_mode: 0o644,
        }
    }
}

/// Database creation/open parameters.
#[derive(Clone)]
pub struct DbParameters {
    pub key_type: KeyType,
    pub key_size: u16,
    pub record_size: Option<u32>,
    pub key_compression: u8,
    pub record_compression: u8,
    pub custom_compare: Option<crate::btree::CompareFn>,
}

impl Default for DbParameters {
    fn default() -> Self {
        Self {
            key_type: KeyType::Binary,
            key_size: DEFAULT_KEY_SIZE,
            record_size: None,
            key_compression: 0,
            record_compression: 0,
            custom_compare: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DbDescriptor {
    pub name: u16,
    pub key_type: u16,
    pub key_size: u16,
    pub compression: u8,
    pub flags: u32,
    pub rec_size: u32,
    pub root: u64,
    pub recno: u64,
}

/// Wraps the environment header page: magic, format version, page size,
/// the page-manager state pointer, the log lsn and the descriptor table.
/// The tail of the page backs the first freelist entry.
#[derive(Debug)]
pub struct EnvHeader {
    page: Pod<Page>,
    changeset: Pod<Changeset>,
    max_databases: u16,
    lsn: u64,
}

impl EnvHeader {
    pub fn new(
        page: Pod<Page>,
        changeset: Pod<Changeset>,
        max_databases: u16,
    ) -> Self {
        let lsn = get_u64(page.rl().payload(), HDR_OFF_LSN);
        Self {
            page,
            changeset,
            max_databases,
            lsn,
        }
    }

    pub fn init(
        page: &Pod<Page>,
        page_size: usize,
        max_databases: u16,
    ) {
        let mut p = page.wl();
        p.set_type(PageType::Header);
        let payload = p.payload_mut();
        set_u32(payload, HDR_OFF_MAGIC, ENV_MAGIC);
        set_u32(payload, HDR_OFF_VERSION, ENV_VERSION);
        set_u32(payload, HDR_OFF_PAGE_SIZE, page_size as u32);
        set_u16(payload, HDR_OFF_MAX_DBS, max_databases);
        set_u64(payload, HDR_OFF_STATE, 0);
        set_u64(payload, HDR_OFF_LSN, 0);
        p.set_dirty(true);
    }

    fn touch(&self) {
        self.page.wl().set_dirty(true);
        self.changeset.wl().add_page(&self.page);
    }

    pub fn verify(&self) -> GroveResult {
        let p = self.page.rl();
        let payload = p.payload();
        if get_u32(payload, HDR_OFF_MAGIC) != ENV_MAGIC {
            return Err(GroveError::new(
                ErrorKind::InvFileHeader,
                "file has an invalid magic",
            ));
        }
        if get_u32(payload, HDR_OFF_VERSION) != ENV_VERSION {
            return Err(GroveError::new(
                ErrorKind::InvFileHeader,
                "file has an unsupported format version",
            ));
        }
        Ok(())
    }

    pub fn page_size(&self) -> usize {
        get_u32(self.page.rl().payload(), HDR_OFF_PAGE_SIZE) as usize
    }

    pub fn max_databases(&self) -> u16 {
        get_u16(self.page.rl().payload(), HDR_OFF_MAX_DBS)
    }

    pub fn state_pageid(&self) -> u64 {
        get_u64(self.page.rl().payload(), HDR_OFF_STATE)
    }

    pub fn get_lsn(&self) -> u64 {
        self.lsn
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.lsn = lsn;
        set_u64(self.page.wl().payload_mut(), HDR_OFF_LSN, lsn);
        self.touch();
    }

    pub fn next_lsn(&mut self) -> u64 {
        let lsn = self.lsn + 1;
        self.set_lsn(lsn);
        lsn
    }

    /// Offset of the header freelist bitmap within the page payload.
    pub fn freelist_offset(max_databases: u16) -> usize {
        HDR_DESC_TABLE + max_databases as usize * DESC_SIZE
    }

    pub fn freelist_bytes(page_size: usize, max_databases: u16) -> usize {
        page_size - PAGE_HEADER_SIZE - Self::freelist_offset(max_databases)
    }

    fn desc_offset(&self, index: usize) -> usize {
        HDR_DESC_TABLE + index * DESC_SIZE
    }

    pub fn get_descriptor(&self, index: usize) -> DbDescriptor {
        let p = self.page.rl();
        let payload = p.payload();
        let offset = self.desc_offset(index);
        DbDescriptor {
            name: get_u16(payload, offset + DESC_OFF_NAME),
            key_type: get_u16(payload, offset + DESC_OFF_KEY_TYPE),
            key_size: get_u16(payload, offset + DESC_OFF_KEY_SIZE),
            compression: payload[offset + DESC_OFF_COMPRESSION],
            flags: get_u32(payload, offset + DESC_OFF_FLAGS),
            rec_size: get_u32(payload, offset + DESC_OFF_REC_SIZE),
            root: get_u64(payload, offset + DESC_OFF_ROOT),
            recno: get_u64(payload, offset + DESC_OFF_RECNO),
        }
    }

    pub fn set_descriptor(&self, index: usize, desc: &DbDescriptor) {
        {
            let mut p = self.page.wl();
            let offset = self.desc_offset(index);
            let payload = p.payload_mut();
            set_u16(payload, offset + DESC_OFF_NAME, desc.name);
            set_u16(payload, offset + DESC_OFF_KEY_TYPE, desc.key_type);
            set_u16(payload, offset + DESC_OFF_KEY_SIZE, desc.key_size);
            payload[offset + DESC_OFF_COMPRESSION] = desc.compression;
            set_u32(payload, offset + DESC_OFF_FLAGS, desc.flags);
            set_u32(payload, offset + DESC_OFF_REC_SIZE, desc.rec_size);
            set_u64(payload, offset + DESC_OFF_ROOT, desc.root);
            set_u64(payload, offset + DESC_OFF_RECNO, desc.recno);
        }
        self.touch();
    }

    pub fn find_descriptor(&self, name: u16) -> Option<usize> {
        (0..self.max_databases as usize)
            .find(|i| self.get_descriptor(*i).name == name)
    }

    pub fn free_descriptor_slot(&self) -> Option<usize> {
        (0..self.max_databases as usize)
            .find(|i| self.get_descriptor(*i).name == 0)
    }

    pub fn set_root_address(
        &mut self,
        index: usize,
        address: u64,
    ) -> GroveResult {
        {
            let mut p = self.page.wl();
            let offset = self.desc_offset(index);
            set_u64(p.payload_mut(), offset + DESC_OFF_ROOT, address);
        }
        self.touch();
        Ok(())
    }

    pub fn set_recno(&mut self, index: usize, recno: u64) {
        {
            let mut p = self.page.wl();
            let offset = self.desc_offset(index);
            set_u64(p.payload_mut(), offset + DESC_OFF_RECNO, recno);
        }
        self.touch();
    }

    pub fn erase_descriptor(&mut self, index: usize) {
        let empty = DbDescriptor {
            name: 0,
            key_type: 0,
            key_size: 0,
            compression: 0,
            flags: 0,
            rec_size: 0,
            root: 0,
            recno: 0,
        };
        self.set_descriptor(index, &empty);
    }
}

/// The environment: one file (or in-memory arena) holding one or more
/// logically independent databases. All structural state hangs off this
/// object; the engine is single-threaded cooperative, callers serialize
/// access externally.
#[derive(Debug)]
pub struct Environment {
    pub(crate) config: EnvConfig,
    pub(crate) device: Pod<Device>,
    pub(crate) page_manager: Pod<PageManager>,
    pub(crate) freelist: Pod<Freelist>,
    pub(crate) blob_manager: Pod<BlobManager>,
    pub(crate) header: Pod<EnvHeader>,
    pub(crate) changeset: Pod<Changeset>,
    pub(crate) log: Option<Pod<LogManager>>,
    pub(crate) txn_manager: Pod<TxnManager>,
    databases: RwLock<HashMap<u16, Arc<Database>>>,
    closed: RwLock<bool>,
    self_ref: RwLock<Weak<Environment>>,
}

#[derive(Clone, Debug)]
pub struct EnvConfig {
    pub flags: u32,
    pub page_size: usize,
    pub cache_size: u64,
    pub max_databases: u16,
    pub path: Option<PathBuf>,
}

impl EnvConfig {
    pub fn is_in_memory(&self) -> bool {
        self.flags & ENV_IN_MEMORY != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.flags & ENV_READ_ONLY != 0
    }

    pub fn transactions_enabled(&self) -> bool {
        self.flags & ENV_ENABLE_TRANSACTIONS != 0
    }

    pub fn recovery_enabled(&self) -> bool {
        self.flags & ENV_ENABLE_RECOVERY != 0
    }
}

fn validate_parameters(flags: u32, params: &Parameters) -> GroveResult {
    if !params.page_size.is_power_of_two()
        || params.page_size < MIN_PAGE_SIZE
    {
        return Err(GroveError::inv_parameter(
            "page size must be a power of two, at least 1 KiB",
        ));
    }
    let max_dbs = params.max_databases as usize;
    if max_dbs == 0
        || EnvHeader::freelist_offset(params.max_databases) + 128
            > params.page_size - PAGE_HEADER_SIZE
    {
        return Err(GroveError::inv_parameter(
            "max_databases does not fit the header page",
        ));
    }
    if flags & ENV_IN_MEMORY != 0 && flags & ENV_ENABLE_RECOVERY != 0 {
        return Err(GroveError::inv_parameter(
            "in-memory environments cannot use recovery",
        ));
    }
    if flags & ENV_IN_MEMORY != 0 && flags & ENV_READ_ONLY != 0 {
        return Err(GroveError::inv_parameter(
            "in-memory environments cannot be read-only",
        ));
    }
    Ok(())
}

impl Environment {
    /// Creates a new environment. An existing file is truncated.
    pub fn create<P: AsRef<Path>>(
        path: P,
        flags: u32,
        params: &Parameters,
    ) -> GroveResult<Arc<Environment>> {
        let mut flags = flags;
        if flags & ENV_AUTO_RECOVERY != 0 {
            flags |= ENV_ENABLE_RECOVERY;
        }
        validate_parameters(flags, params)?;

        let in_memory = flags & ENV_IN_MEMORY != 0;
        let device = if in_memory {
            pod(Device::in_memory(params.page_size))
        } else {
            pod(Device::create(path.as_ref(), params.page_size)?)
        };

        let recovery = flags & ENV_ENABLE_RECOVERY != 0;
        let changeset = pod(Changeset::new(device.clone(), recovery));

        let log = if recovery && !in_memory {
            let log = pod(LogManager::create(LogManager::log_path(
                path.as_ref(),
            ))?);
            changeset.wl().set_log(log.clone());
            Some(log)
        } else {
            None
        };

        let page_manager = pod(PageManager::new(
            device.clone(),
            changeset.clone(),
            params.cache_size,
            params.page_size,
            in_memory,
            recovery,
            flags & ENV_ENABLE_CRC32 != 0,
        ));
        page_manager.wl().set_state_writeback(write_state_pageid);

        // the header always occupies page 0
        let header_page = page_manager
            .wl()
            .alloc_page(PageType::Header, crate::page_manager::ALLOC_CLEAR_WITH_ZERO)?;
        debug_assert_eq!(header_page.rl().get_address(), 0);
        EnvHeader::init(&header_page, params.page_size, params.max_databases);
        let header = pod(EnvHeader::new(
            header_page,
            changeset.clone(),
            params.max_databases,
        ));

        let freelist = pod(Freelist::new(
            page_manager.clone(),
            params.page_size,
            EnvHeader::freelist_offset(params.max_databases),
            EnvHeader::freelist_bytes(params.page_size, params.max_databases),
        ));

        let blob_manager = pod(BlobManager::new(
            page_manager.clone(),
            freelist.clone(),
            params.page_size,
            in_memory,
        ));

        let env = Arc::new(Environment {
            config: EnvConfig {
                flags,
                page_size: params.page_size,
                cache_size: params.cache_size,
                max_databases: params.max_databases,
                path: if in_memory {
                    None
                } else {
                    Some(path.as_ref().to_path_buf())
                },
            },
            device,
            page_manager,
            freelist,
            blob_manager,
            header,
            changeset,
            log,
            txn_manager: pod(TxnManager::new()),
            databases: RwLock::new(HashMap::new()),
            closed: RwLock::new(false),
            self_ref: RwLock::new(Weak::new()),
        });
        *env.self_ref.write().unwrap() = Arc::downgrade(&env);

        env.flush_changeset()?;
        info!(
            "created environment, path: {:?}, page_size: {}",
            env.config.path, env.config.page_size
        );
        Ok(env)
    }

    /// Opens an existing environment file. A dirty log fails the open
    /// with `NeedRecovery` unless `ENV_AUTO_RECOVERY` is set, in which
    /// case the log is replayed first.
    pub fn open<P: AsRef<Path>>(
        path: P,
        flags: u32,
        params: &Parameters,
    ) -> GroveResult<Arc<Environment>> {
        let mut flags = flags;
        if flags & ENV_AUTO_RECOVERY != 0 {
            flags |= ENV_ENABLE_RECOVERY;
        }
        if flags & ENV_IN_MEMORY != 0 {
            return Err(GroveError::inv_parameter(
                "in-memory environments cannot be opened from a file",
            ));
        }

        let read_only = flags & ENV_READ_ONLY != 0;
        let device = pod(Device::open(
            path.as_ref(),
            MIN_PAGE_SIZE,
            read_only,
        )?);

        // probe the header for the real page size
        let mut probe = vec![0u8; PAGE_HEADER_SIZE + HDR_DESC_TABLE];
        device.wl().read(0, &mut probe)?;
        let payload = &probe[PAGE_HEADER_SIZE..];
        if get_u32(payload, HDR_OFF_MAGIC) != ENV_MAGIC {
            return Err(GroveError::new(
                ErrorKind::InvFileHeader,
                "file has an invalid magic",
            ));
        }
        let page_size = get_u32(payload, HDR_OFF_PAGE_SIZE) as usize;
        let max_databases = get_u16(payload, HDR_OFF_MAX_DBS);
        if !page_size.is_power_of_two() || page_size < MIN_PAGE_SIZE {
            return Err(GroveError::new(
                ErrorKind::InvFileHeader,
                "header page size is corrupt",
            ));
        }
        device.wl().set_page_size(page_size);

        // recovery handling happens before any page is interpreted
        let recovery = flags & ENV_ENABLE_RECOVERY != 0;
        let log_path = LogManager::log_path(path.as_ref());
        let mut log = None;

        if log_path.exists() {
            let mut manager = LogManager::open(&log_path)?;
            if !manager.is_empty()? {
                if flags & ENV_AUTO_RECOVERY != 0 {
                    manager.recover(&mut device.wl())?;
                } else {
                    return Err(GroveError::new(
                        ErrorKind::NeedRecovery,
                        "the environment was not shut down cleanly",
                    ));
                }
            }
            if recovery {
                log = Some(pod(manager));
            }
        } else if recovery {
            log = Some(pod(LogManager::create(&log_path)?));
        }

        let changeset = pod(Changeset::new(device.clone(), recovery));
        if let Some(log) = &log {
            changeset.wl().set_log(log.clone());
        }

        let page_manager = pod(PageManager::new(
            device.clone(),
            changeset.clone(),
            params.cache_size,
            page_size,
            false,
            recovery,
            flags & ENV_ENABLE_CRC32 != 0,
        ));
        page_manager.wl().set_state_writeback(write_state_pageid);

        let header_page = page_manager.wl().fetch_page(0, FETCH_READ_ONLY)?;
        let header = pod(EnvHeader::new(
            header_page,
            changeset.clone(),
            max_databases,
        ));
        header.rl().verify()?;

        let state_pageid = header.rl().state_pageid();
        if state_pageid != 0 {
            page_manager.wl().load_state(state_pageid)?;
        }

        let freelist = pod(Freelist::new(
            page_manager.clone(),
            page_size,
            EnvHeader::freelist_offset(max_databases),
            EnvHeader::freelist_bytes(page_size, max_databases),
        ));
        freelist.wl().open()?;

        let blob_manager = pod(BlobManager::new(
            page_manager.clone(),
            freelist.clone(),
            page_size,
            false,
        ));

        let env = Arc::new(Environment {
            config: EnvConfig {
                flags,
                page_size,
                cache_size: params.cache_size,
                max_databases,
                path: Some(path.as_ref().to_path_buf()),
            },
            device,
            page_manager,
            freelist,
            blob_manager,
            header,
            changeset,
            log,
            txn_manager: pod(TxnManager::new()),
            databases: RwLock::new(HashMap::new()),
            closed: RwLock::new(false),
            self_ref: RwLock::new(Weak::new()),
        });
        *env.self_ref.write().unwrap() = Arc::downgrade(&env);

        info!("opened environment, path: {:?}", path.as_ref());
        Ok(env)
    }

    pub fn get_flags(&self) -> u32 {
        self.config.flags
    }

    fn arc(&self) -> GroveResult<Arc<Environment>> {
        self.self_ref.rl().upgrade().ok_or_else(|| {
            GroveError::internal("the environment handle is gone")
        })
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    fn check_writable(&self) -> GroveResult {
        if self.config.is_read_only() {
            return Err(GroveError::new(
                ErrorKind::WriteProtected,
                "the environment is read-only",
            ));
        }
        Ok(())
    }

    pub(crate) fn next_lsn(&self) -> u64 {
        self.header.wl().next_lsn()
    }

    /// Commit point of a logical operation: the changeset goes to the
    /// log and then in place, and the cache is purged when it ran over
    /// its budget.
    pub(crate) fn after_operation(&self) -> GroveResult {
        self.flush_changeset()?;
        self.page_manager.wl().purge_cache()?;
        Ok(())
    }

    pub(crate) fn flush_changeset(&self) -> GroveResult {
        if !self.config.recovery_enabled() {
            self.changeset.wl().clear();
            return Ok(());
        }
        if self.changeset.rl().is_empty() {
            return Ok(());
        }
        let lsn = self.next_lsn();
        self.changeset.wl().flush(lsn)
    }

    // === database lifecycle ===============================================

    pub fn create_db(
        &self,
        name: u16,
        flags: u32,
        params: &DbParameters,
    ) -> GroveResult<Arc<Database>> {
        self.check_writable()?;
        if name == 0 || name >= 0xf000 {
            return Err(GroveError::inv_parameter(
                "database names must be in the range 1..0xf000",
            ));
        }
        if params.key_compression != 0 || params.record_compression != 0 {
            return Err(GroveError::inv_parameter(
                "compression is not supported by this build",
            ));
        }
        if self.header.rl().find_descriptor(name).is_some() {
            return Err(GroveError::inv_parameter(
                "a database with this name already exists",
            ));
        }

        let mut flags = flags;
        let mut key_size = params.key_size;
        let mut key_type = params.key_type;

        if flags & DB_RECORD_NUMBER32 != 0 {
            key_type = KeyType::Binary;
            key_size = 4;
        } else if flags & DB_RECORD_NUMBER64 != 0 {
            key_type = KeyType::Binary;
            key_size = 8;
        }
        match key_type {
            KeyType::UInt32 | KeyType::Real32 => key_size = 4,
            KeyType::UInt64 | KeyType::Real64 => key_size = 8,
            KeyType::Custom => {
                if params.custom_compare.is_none() {
                    return Err(GroveError::inv_parameter(
                        "custom key type requires a compare function",
                    ));
                }
            }
            KeyType::Binary => {}
        }
        if key_size == 0 {
            return Err(GroveError::new(
                ErrorKind::InvKeySize,
                "key size must not be zero",
            ));
        }
        if flags & DB_ENABLE_DUPLICATE_KEYS != 0
            && flags & (DB_RECORD_NUMBER32 | DB_RECORD_NUMBER64) != 0
        {
            return Err(GroveError::inv_parameter(
                "record number databases cannot store duplicates",
            ));
        }

        let index = self.header.rl().free_descriptor_slot().ok_or_else(
            || GroveError::new(ErrorKind::LimitsReached, "descriptor table is full"),
        )?;

        // the key slots must leave room for a reasonable fanout
        let proxy =
            crate::btree::node::NodeProxy::new(key_size as usize, self.config.page_size);
        if proxy.leaf_capacity() < 4 || proxy.internal_capacity() < 4 {
            return Err(GroveError::new(
                ErrorKind::InvKeySize,
                "key size is too large for the page size",
            ));
        }

        let descriptor = DbDescriptor {
            name,
            key_type: key_type as u16,
            key_size,
            compression: 0,
            flags,
            rec_size: params.record_size.unwrap_or(REC_SIZE_UNLIMITED),
            root: 0,
            recno: 0,
        };
        self.header.rl().set_descriptor(index, &descriptor);

        let db = Database::bootstrap(
            &self.arc()?,
            index,
            descriptor,
            params.custom_compare,
            true,
        )?;

        self.databases.wl().insert(name, db.clone());
        self.after_operation()?;
        debug!("created database {}", name);
        Ok(db)
    }

    pub fn open_db(
        &self,
        name: u16,
        params: &DbParameters,
    ) -> GroveResult<Arc<Database>> {
        if let Some(db) = self.databases.rl().get(&name) {
            return Ok(db.clone());
        }
        let index = self.header.rl().find_descriptor(name).ok_or_else(|| {
            GroveError::new(
                ErrorKind::KeyNotFound,
                "no database with this name exists",
            )
        })?;
        let descriptor = self.header.rl().get_descriptor(index);

        if descriptor.key_type == KeyType::Custom as u16
            && params.custom_compare.is_none()
        {
            return Err(GroveError::inv_parameter(
                "custom key type requires a compare function",
            ));
        }

        let db = Database::bootstrap(
            &self.arc()?,
            index,
            descriptor,
            params.custom_compare,
            false,
        )?;
        self.databases.wl().insert(name, db.clone());
        Ok(db)
    }

    pub fn close_db(&self, name: u16) -> GroveResult {
        self.databases.wl().remove(&name);
        Ok(())
    }

    pub fn rename_db(&self, old_name: u16, new_name: u16) -> GroveResult {
        self.check_writable()?;
        if new_name == 0 || new_name >= 0xf000 {
            return Err(GroveError::inv_parameter("invalid database name"));
        }
        if self.databases.rl().contains_key(&old_name) {
            return Err(GroveError::inv_parameter(
                "cannot rename an open database",
            ));
        }
        if self.header.rl().find_descriptor(new_name).is_some() {
            return Err(GroveError::inv_parameter(
                "the target name is already taken",
            ));
        }
        let index =
            self.header.rl().find_descriptor(old_name).ok_or_else(|| {
                GroveError::new(ErrorKind::KeyNotFound, "unknown database")
            })?;
        let mut descriptor = self.header.rl().get_descriptor(index);
        descriptor.name = new_name;
        self.header.rl().set_descriptor(index, &descriptor);
        self.after_operation()?;
        Ok(())
    }

    /// Erases a database: frees every page, blob and duplicate table it
    /// owns and clears its descriptor slot.
    pub fn erase_db(&self, name: u16) -> GroveResult {
        self.check_writable()?;
        if self.databases.rl().contains_key(&name) {
            return Err(GroveError::inv_parameter(
                "cannot erase an open database",
            ));
        }
        let index = self.header.rl().find_descriptor(name).ok_or_else(|| {
            GroveError::new(ErrorKind::KeyNotFound, "unknown database")
        })?;
        let descriptor = self.header.rl().get_descriptor(index);

        let db = Database::bootstrap(&self.arc()?, index, descriptor, None, false)?;
        db.btree.wl().release()?;
        self.header.wl().erase_descriptor(index);
        self.after_operation()?;
        debug!("erased database {}", name);
        Ok(())
    }

    pub(crate) fn get_open_db(&self, name: u16) -> Option<Arc<Database>> {
        self.databases.rl().get(&name).cloned()
    }

    // === transactions =====================================================

    pub fn txn_begin(
        &self,
        name: Option<&str>,
    ) -> GroveResult<Pod<Transaction>> {
        if !self.config.transactions_enabled() {
            return Err(GroveError::inv_parameter(
                "transactions are not enabled for this environment",
            ));
        }
        Ok(self
            .txn_manager
            .wl()
            .begin(name.map(|n| n.to_string())))
    }

    pub fn txn_commit(&self, txn: &Pod<Transaction>) -> GroveResult {
        txn.rl().check_may_close()?;
        txn.wl().set_state(TxnState::Committed);
        debug!("committed transaction {}", txn.rl().get_id());
        self.flush_committed_txns()
    }

    pub fn txn_abort(&self, txn: &Pod<Transaction>) -> GroveResult {
        txn.rl().check_may_close()?;
        txn.wl().set_state(TxnState::Aborted);

        // release the cached operations immediately
        let (id, ops) = {
            let mut t = txn.wl();
            (t.get_id(), t.take_ops())
        };
        for handle in &ops {
            if let Some(db) = self.get_open_db(handle.db_name) {
                db.txn_index.wl().remove_op(&handle.key, handle.seq);
            }
        }

        // an aborted transaction discards the uncommitted changeset
        self.changeset.wl().clear();
        self.txn_manager.wl().remove(id);
        debug!("aborted transaction {}", id);
        Ok(())
    }

    /// Drains the global list from the oldest end: while the oldest
    /// transaction is committed, its operations are replayed against the
    /// btrees (in chronological order) and marked flushed; afterwards the
    /// transaction is removed. A younger committed transaction never
    /// overtakes an older still-active one.
    pub fn flush_committed_txns(&self) -> GroveResult {
        loop {
            let head = match self.txn_manager.rl().oldest() {
                Some(head) => head,
                None => return Ok(()),
            };
            let (id, committed) = {
                let t = head.rl();
                (t.get_id(), t.is_committed())
            };
            if !committed {
                return Ok(());
            }

            let ops = head.wl().take_ops();
            for handle in &ops {
                let db = self.get_open_db(handle.db_name).ok_or_else(|| {
                    GroveError::internal(
                        "a pending transaction references a closed database",
                    )
                })?;
                db.flush_txn_op(handle)?;
                self.after_operation()?;
            }
            // the flushed operations are no longer needed
            for handle in &ops {
                if let Some(db) = self.get_open_db(handle.db_name) {
                    db.txn_index.wl().remove_op(&handle.key, handle.seq);
                }
            }
            self.txn_manager.wl().remove(id);
            debug!("flushed transaction {}", id);
        }
    }

    // === shutdown =========================================================

    /// Flushes everything, reclaims trailing free pages, truncates the
    /// log to its header and releases the file lock.
    pub fn close(&self) -> GroveResult {
        {
            let mut closed = self.closed.wl();
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        // abort transactions that are still active, flush the rest
        loop {
            let active = {
                let mgr = self.txn_manager.rl();
                mgr.oldest().filter(|t| t.rl().is_active())
            };
            match active {
                Some(txn) => {
                    // attached cursors die with the environment
                    while txn.rl().get_cursor_refcount() > 0 {
                        txn.wl().decrement_cursor_refcount();
                    }
                    self.txn_abort(&txn)?;
                }
                None => break,
            }
        }
        self.flush_committed_txns()?;

        self.databases.wl().clear();

        if !self.config.is_read_only() {
            let in_memory = self.config.is_in_memory();
            {
                let mut pm = self.page_manager.wl();
                if !in_memory && self.config.flags & ENV_DISABLE_RECLAIM == 0
                {
                    pm.reclaim_space()?;
                }
                pm.maybe_store_state(!in_memory)?;
            }

            // pages dirtied by the reclaim/state writes go through the
            // log before anything is written in place
            self.flush_changeset()?;
            self.page_manager.wl().flush_all_pages(false)?;
            self.device.wl().flush()?;

            if let Some(log) = &self.log {
                let mut log = log.wl();
                log.truncate_to_header()?;
                log.close()?;
            }
        }

        self.device.wl().close()?;
        info!("closed environment, path: {:?}", self.config.path);
        Ok(())
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
