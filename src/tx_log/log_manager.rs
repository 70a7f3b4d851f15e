use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::{debug, info};

use crate::{
    device::Device,
    error::{ErrorKind, GroveError},
    io::{get_u32, get_u64, set_u32, set_u64},
    types::GroveResult,
};

/// Log file header: magic, reserved, last known lsn.
pub const LOG_HEADER_SIZE: u64 = 16;

/// "GLG1", little-endian
const LOG_MAGIC: u32 = 0x31474c47;

/// "GREC", little-endian
const RECORD_MAGIC: u32 = 0x43455247;

const RECORD_HEADER_SIZE: usize = 32;

/// One page image in the log.
pub struct LogRecord {
    pub lsn: u64,
    pub page_address: u64,
    pub original_size: u32,
    pub flags: u32,
    pub data: Vec<u8>,
}

/// The write-ahead log. Sibling file of the data file (suffix `.log0`),
/// append-only within a checkpoint; on clean shutdown it is truncated back
/// to its header.
#[derive(Debug)]
pub struct LogManager {
    file: File,
    path: PathBuf,

    /// The last lsn written to (or recovered from) this log
    lsn: u64,

    /// The absolute position of the file descriptor cursor.
    current_offset: u64,
}

impl LogManager {
    pub fn log_path<P: AsRef<Path>>(db_path: P) -> PathBuf {
        let mut name = db_path
            .as_ref()
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".log0");
        db_path.as_ref().with_file_name(name)
    }

    pub fn create<P: AsRef<Path>>(path: P) -> GroveResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        let mut header = [0u8; LOG_HEADER_SIZE as usize];
        set_u32(&mut header, 0, LOG_MAGIC);
        set_u64(&mut header, 8, 0);
        file.write_all(&header)?;

        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            lsn: 0,
            current_offset: LOG_HEADER_SIZE,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P) -> GroveResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;

        let mut header = [0u8; LOG_HEADER_SIZE as usize];
        file.read_exact(&mut header).map_err(|_| {
            GroveError::new(
                ErrorKind::LogInvFileHeader,
                "log file is too short for its header",
            )
        })?;

        if get_u32(&header, 0) != LOG_MAGIC {
            return Err(GroveError::new(
                ErrorKind::LogInvFileHeader,
                "log file has an invalid magic",
            ));
        }

        let lsn = get_u64(&header, 8);
        let size = file.metadata()?.len();
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            lsn,
            current_offset: size,
        })
    }

    pub fn get_lsn(&self) -> u64 {
        self.lsn
    }

    /// True when the log holds no records beyond its header. A non-empty
    /// log at open time means the environment was not shut down cleanly.
    pub fn is_empty(&self) -> GroveResult<bool> {
        Ok(self.file.metadata()?.len() <= LOG_HEADER_SIZE)
    }

    /// Appends one page image. The caller groups all pages of one atomic
    /// commit under a single lsn and calls `flush()` once afterwards.
    pub fn append_page_image(
        &mut self,
        lsn: u64,
        page_address: u64,
        data: &[u8],
    ) -> GroveResult {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        set_u32(&mut header, 0, RECORD_MAGIC);
        set_u64(&mut header, 4, lsn);
        set_u64(&mut header, 12, page_address);
        set_u32(&mut header, 20, data.len() as u32); // original size
        set_u32(&mut header, 24, data.len() as u32); // payload size
        set_u32(&mut header, 28, 0); // flags

        self.file.seek(SeekFrom::Start(self.current_offset))?;
        self.file.write_all(&header)?;
        self.file.write_all(data)?;
        self.current_offset += (RECORD_HEADER_SIZE + data.len()) as u64;

        if lsn > self.lsn {
            self.lsn = lsn;
        }
        Ok(())
    }

    /// Makes all appended records durable.
    pub fn flush(&mut self) -> GroveResult {
        self.file.sync_data()?;
        Ok(())
    }

    /// Reads every complete record in the log. A torn group at the tail
    /// (crash in the middle of an append) is dropped entirely so that a
    /// half-written commit is never replayed.
    fn read_records(&mut self) -> GroveResult<Vec<LogRecord>> {
        let size = self.file.metadata()?.len();
        let mut records = Vec::new();
        let mut offset = LOG_HEADER_SIZE;
        let mut torn_lsn = None;

        while offset + RECORD_HEADER_SIZE as u64 <= size {
            self.file.seek(SeekFrom::Start(offset))?;
            let mut header = [0u8; RECORD_HEADER_SIZE];
            self.file.read_exact(&mut header)?;

            if get_u32(&header, 0) != RECORD_MAGIC {
                return Err(GroveError::new(
                    ErrorKind::LogInvFileHeader,
                    "log record has an invalid magic",
                ));
            }

            let lsn = get_u64(&header, 4);
            let page_address = get_u64(&header, 12);
            let original_size = get_u32(&header, 20);
            let payload_size = get_u32(&header, 24) as u64;
            let flags = get_u32(&header, 28);

            if offset + RECORD_HEADER_SIZE as u64 + payload_size > size {
                torn_lsn = Some(lsn);
                break;
            }

            let mut data = vec![0u8; payload_size as usize];
            self.file.read_exact(&mut data)?;
            offset += RECORD_HEADER_SIZE as u64 + payload_size;

            records.push(LogRecord {
                lsn,
                page_address,
                original_size,
                flags,
                data,
            });
        }

        if offset + RECORD_HEADER_SIZE as u64 > size && offset < size {
            // partial record header at the tail
            torn_lsn = records.last().map(|r| r.lsn);
        }

        if let Some(lsn) = torn_lsn {
            records.retain(|r| r.lsn != lsn);
        }

        Ok(records)
    }

    /// Redo recovery: iterates the log records backward by lsn and
    /// replays the most recent version of every page into the file.
    /// Recovering a file N times produces the same file as recovering it
    /// once.
    pub fn recover(&mut self, device: &mut Device) -> GroveResult {
        let records = self.read_records()?;
        info!("recovering from {} log records", records.len());

        let mut seen = std::collections::HashSet::new();
        let mut max_lsn = self.lsn;
        for record in records.iter().rev() {
            if record.lsn > max_lsn {
                max_lsn = record.lsn;
            }
            if !seen.insert(record.page_address) {
                continue;
            }
            debug!(
                "replaying page {} from lsn {}",
                record.page_address, record.lsn
            );
            device.write(record.page_address, &record.data)?;
        }

        device.flush()?;
        self.lsn = max_lsn;
        self.truncate_to_header()?;
        Ok(())
    }

    /// Drops all records, keeping the header with the current lsn.
    pub fn truncate_to_header(&mut self) -> GroveResult {
        self.file.set_len(LOG_HEADER_SIZE)?;

        let mut header = [0u8; LOG_HEADER_SIZE as usize];
        set_u32(&mut header, 0, LOG_MAGIC);
        set_u64(&mut header, 8, self.lsn);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&header)?;
        self.file.sync_data()?;

        self.current_offset = LOG_HEADER_SIZE;
        Ok(())
    }

    pub fn close(&mut self) -> GroveResult {
        self.file.sync_all()?;
        debug!("log closed, path: {:?}", self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_log() -> (tempfile::TempDir, LogManager) {
        let dir = tempfile::tempdir().unwrap();
        let log = LogManager::create(dir.path().join("test.log0")).unwrap();
        (dir, log)
    }

    #[test]
    fn test_create_then_open() {
        let (dir, mut log) = scratch_log();
        log.append_page_image(1, 0, &[1, 2, 3]).unwrap();
        log.flush().unwrap();
        log.close().unwrap();
        drop(log);

        let log = LogManager::open(dir.path().join("test.log0")).unwrap();
        assert_eq!(log.get_lsn(), 0); // lsn only persisted on truncate
        assert!(!log.is_empty().unwrap());
    }

    #[test]
    fn test_open_broken_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.log0");
        std::fs::write(&path, b"garbage here, much longer than header")
            .unwrap();

        match LogManager::open(&path) {
            Err(e) => assert_eq!(e.kind(), ErrorKind::LogInvFileHeader),
            Ok(_) => panic!("open should have failed"),
        }
    }

    #[test]
    fn test_recover_replays_newest_image() {
        let (_dir, mut log) = scratch_log();
        let mut device = Device::in_memory(16);
        device.alloc_page().unwrap();
        device.alloc_page().unwrap();

        log.append_page_image(1, 0, &[1u8; 16]).unwrap();
        log.append_page_image(2, 0, &[2u8; 16]).unwrap();
        log.append_page_image(2, 16, &[3u8; 16]).unwrap();
        log.flush().unwrap();

        log.recover(&mut device).unwrap();

        let mut buf = [0u8; 16];
        device.read(0, &mut buf).unwrap();
        assert_eq!(buf, [2u8; 16]);
        device.read(16, &mut buf).unwrap();
        assert_eq!(buf, [3u8; 16]);

        // the log is truncated to its header afterwards
        assert!(log.is_empty().unwrap());
        assert_eq!(log.get_lsn(), 2);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let (dir, mut log) = scratch_log();
        log.append_page_image(1, 0, &[7u8; 16]).unwrap();
        log.append_page_image(2, 16, &[8u8; 16]).unwrap();
        log.flush().unwrap();
        drop(log);

        // cut the last record short to simulate a crash mid-append
        let path = dir.path().join("test.log0");
        let size = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(size - 4).unwrap();
        drop(file);

        let mut log = LogManager::open(&path).unwrap();
        let mut device = Device::in_memory(16);
        device.alloc_page().unwrap();
        device.alloc_page().unwrap();
        log.recover(&mut device).unwrap();

        let mut buf = [0u8; 16];
        device.read(0, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 16]);
        // the torn lsn-2 group was not replayed
        device.read(16, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }
}
