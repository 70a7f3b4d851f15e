use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use log::debug;

use crate::{
    error::{ErrorKind, GroveError},
    types::GroveResult,
};

/// The raw storage backend.
///
/// Every page is page-size aligned; reads and writes are single,
/// uninterrupted calls. The file variant holds an exclusive advisory lock
/// for the lifetime of the device; a second open of the same file fails
/// with `WouldBlock`.
#[derive(Debug)]
pub enum Device {
    File(FileDevice),
    Mem(InMemoryDevice),
}

#[derive(Debug)]
pub struct FileDevice {
    file: File,
    path: PathBuf,
    page_size: usize,
}

#[derive(Debug)]
pub struct InMemoryDevice {
    arena: Vec<u8>,
    page_size: usize,
}

impl Device {
    pub fn create<P: AsRef<Path>>(
        path: P,
        page_size: usize,
    ) -> GroveResult<Device> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        file.try_lock_exclusive().map_err(|e| {
            GroveError::new(ErrorKind::WouldBlock, &e.to_string())
        })?;

        debug!("device created, path: {:?}", path.as_ref());

        Ok(Device::File(FileDevice {
            file,
            path: path.as_ref().to_path_buf(),
            page_size,
        }))
    }

    pub fn open<P: AsRef<Path>>(
        path: P,
        page_size: usize,
        read_only: bool,
    ) -> GroveResult<Device> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path.as_ref())?;

        file.try_lock_exclusive().map_err(|e| {
            GroveError::new(ErrorKind::WouldBlock, &e.to_string())
        })?;

        Ok(Device::File(FileDevice {
            file,
            path: path.as_ref().to_path_buf(),
            page_size,
        }))
    }

    pub fn in_memory(page_size: usize) -> Device {
        Device::Mem(InMemoryDevice {
            arena: Vec::new(),
            page_size,
        })
    }

    pub fn is_in_memory(&self) -> bool {
        match self {
            Device::File(_) => false,
            Device::Mem(_) => true,
        }
    }

    pub fn page_size(&self) -> usize {
        match self {
            Device::File(d) => d.page_size,
            Device::Mem(d) => d.page_size,
        }
    }

    /// Adjusts the page size after the header page was probed; opening a
    /// file starts with a tentative size because the real one is stored
    /// in the header itself.
    pub fn set_page_size(&mut self, page_size: usize) {
        match self {
            Device::File(d) => d.page_size = page_size,
            Device::Mem(d) => d.page_size = page_size,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Device::File(d) => Some(&d.path),
            Device::Mem(_) => None,
        }
    }

    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> GroveResult {
        match self {
            Device::File(d) => {
                d.file.seek(SeekFrom::Start(offset))?;
                d.file.read_exact(buf)?;
                Ok(())
            }
            Device::Mem(d) => {
                let start = offset as usize;
                let end = start + buf.len();
                if end > d.arena.len() {
                    return Err(GroveError::new(
                        ErrorKind::IoError,
                        "read past the end of the arena",
                    ));
                }
                buf.copy_from_slice(&d.arena[start..end]);
                Ok(())
            }
        }
    }

    pub fn write(&mut self, offset: u64, buf: &[u8]) -> GroveResult {
        match self {
            Device::File(d) => {
                d.file.seek(SeekFrom::Start(offset))?;
                d.file.write_all(buf)?;
                Ok(())
            }
            Device::Mem(d) => {
                let start = offset as usize;
                let end = start + buf.len();
                if end > d.arena.len() {
                    d.arena.resize(end, 0);
                }
                d.arena[start..end].copy_from_slice(buf);
                Ok(())
            }
        }
    }

    pub fn read_page(&mut self, address: u64) -> GroveResult<Vec<u8>> {
        let page_size = self.page_size();
        let mut buf = vec![0u8; page_size];
        self.read(address, &mut buf)?;
        Ok(buf)
    }

    pub fn write_page(&mut self, address: u64, data: &[u8]) -> GroveResult {
        debug_assert_eq!(data.len(), self.page_size());
        self.write(address, data)
    }

    /// Extends the backend by one page and returns the new page's address.
    pub fn alloc_page(&mut self) -> GroveResult<u64> {
        let page_size = self.page_size() as u64;
        let size = self.file_size()?;
        debug_assert_eq!(size % page_size, 0);

        match self {
            Device::File(d) => {
                d.file.set_len(size + page_size)?;
            }
            Device::Mem(d) => {
                let new_len = (size + page_size) as usize;
                d.arena.resize(new_len, 0);
            }
        }
        Ok(size)
    }

    pub fn truncate(&mut self, new_size: u64) -> GroveResult {
        match self {
            Device::File(d) => {
                d.file.set_len(new_size)?;
                Ok(())
            }
            Device::Mem(d) => {
                d.arena.truncate(new_size as usize);
                Ok(())
            }
        }
    }

    pub fn file_size(&self) -> GroveResult<u64> {
        match self {
            Device::File(d) => Ok(d.file.metadata()?.len()),
            Device::Mem(d) => Ok(d.arena.len() as u64),
        }
    }

    pub fn flush(&mut self) -> GroveResult {
        match self {
            Device::File(d) => {
                d.file.sync_all()?;
                Ok(())
            }
            Device::Mem(_) => Ok(()),
        }
    }

    pub fn close(&mut self) -> GroveResult {
        if let Device::File(d) = self {
            d.file.flush()?;
            // the advisory lock dies with the file descriptor, but release
            // it eagerly so a reopen in the same process succeeds
            let _ = d.file.unlock();
        }
        Ok(())
    }
}
