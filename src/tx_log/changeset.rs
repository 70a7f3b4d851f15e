use log::debug;

use crate::{
    device::Device,
    page::Page,
    tx_log::LogManager,
    types::{GroveResult, Pod},
    utils::HandyRwLock,
};

/// The ordered set of pages touched since the last commit point.
///
/// When recovery is enabled, every dirty page is routed through the
/// changeset; `flush()` writes all of them to the log under a single lsn,
/// makes the log durable, and only then writes the page images in place.
/// Pages reach the device in the same order their changes were appended
/// to the log.
#[derive(Debug)]
pub struct Changeset {
    pages: Vec<Pod<Page>>,
    device: Pod<Device>,
    log: Option<Pod<LogManager>>,
    enabled: bool,
}

impl Changeset {
    pub fn new(device: Pod<Device>, enabled: bool) -> Self {
        Self {
            pages: Vec::new(),
            device,
            log: None,
            enabled,
        }
    }

    pub fn set_log(&mut self, log: Pod<LogManager>) {
        self.log = Some(log);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn add_page(&mut self, page: &Pod<Page>) {
        if !self.enabled {
            return;
        }
        let address = page.rl().get_address();
        if self.contains(address) {
            return;
        }
        self.pages.push(page.clone());
    }

    pub fn contains(&self, address: u64) -> bool {
        self.pages.iter().any(|p| p.rl().get_address() == address)
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }

    /// Flushes the changeset as a single logical transaction: all dirty
    /// pages share the lsn, the log is fsynced, then the images go to the
    /// device in the same order and the set is cleared.
    pub fn flush(&mut self, lsn: u64) -> GroveResult {
        let dirty: Vec<Pod<Page>> = self
            .pages
            .iter()
            .filter(|p| p.rl().is_dirty())
            .cloned()
            .collect();

        if dirty.is_empty() {
            self.pages.clear();
            return Ok(());
        }

        debug!("changeset flush, lsn: {}, pages: {}", lsn, dirty.len());

        if let Some(log) = &self.log {
            let mut log = log.wl();
            for page in &dirty {
                let mut p = page.wl();
                if p.has_header() {
                    p.update_crc();
                }
                log.append_page_image(lsn, p.get_address(), p.raw_data())?;
            }
            log.flush()?;
        }

        {
            let mut device = self.device.wl();
            for page in &dirty {
                let mut p = page.wl();
                if p.has_header() {
                    p.update_crc();
                }
                device.write_page(p.get_address(), p.raw_data())?;
                p.set_dirty(false);
            }
        }

        self.pages.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::pod;

    #[test]
    fn test_add_page_dedup() {
        let device = pod(Device::in_memory(256));
        let mut cs = Changeset::new(device, true);

        let page = pod(Page::new(0, 256));
        cs.add_page(&page);
        cs.add_page(&page);
        assert_eq!(cs.len(), 1);

        cs.clear();
        assert!(cs.is_empty());
    }

    #[test]
    fn test_disabled_changeset_collects_nothing() {
        let device = pod(Device::in_memory(256));
        let mut cs = Changeset::new(device, false);
        let page = pod(Page::new(0, 256));
        cs.add_page(&page);
        assert!(cs.is_empty());
    }

    #[test]
    fn test_flush_writes_in_place_and_clears_dirty() {
        let device = pod(Device::in_memory(256));
        device.wl().alloc_page().unwrap();

        let mut cs = Changeset::new(device.clone(), true);
        let page = pod(Page::new(0, 256));
        {
            let mut p = page.wl();
            p.payload_mut()[0] = 42;
            p.set_dirty(true);
        }
        cs.add_page(&page);
        cs.flush(1).unwrap();

        assert!(!page.rl().is_dirty());
        assert!(cs.is_empty());

        let data = device.wl().read_page(0).unwrap();
        assert_eq!(data[crate::page::PAGE_HEADER_SIZE], 42);
    }
}
