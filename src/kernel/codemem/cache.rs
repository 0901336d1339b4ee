//! Single-page write-back cache
//!
//! Holds one flash page in RAM. At most one page is dirty at any time, so
//! RAM cost stays at one page no matter how many allocations exist.

/// The write cache
#[derive(Debug)]
pub struct WriteCache {
    /// Flash address of the mirrored page
    page: Option<u32>,
    data: Vec<u8>,
    dirty: bool,
}

impl WriteCache {
    pub fn new(page_size: usize) -> Self {
        Self {
            page: None,
            data: vec![0xFF; page_size],
            dirty: false,
        }
    }

    /// Address of the cached page, if any
    pub fn page(&self) -> Option<u32> {
        self.page
    }

    /// True when `page` is cached and modified
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// True if the cached page lies in `[start, end)`
    pub fn covers(&self, start: u32, end: u32) -> bool {
        matches!(self.page, Some(p) if p >= start && p < end)
    }

    /// Buffer to fill with a freshly read page; clears the dirty flag
    pub fn reload(&mut self, page: u32) -> &mut [u8] {
        self.page = Some(page);
        self.dirty = false;
        &mut self.data
    }

    /// Page contents for programming. `None` if clean.
    pub fn dirty_page(&self) -> Option<(u32, &[u8])> {
        match self.page {
            Some(page) if self.dirty => Some((page, &self.data)),
            _ => None,
        }
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Drop the cached page without writing it back
    pub fn invalidate(&mut self) {
        self.page = None;
        self.dirty = false;
    }

    pub fn write(&mut self, offset: usize, buf: &[u8]) {
        self.data[offset..offset + buf.len()].copy_from_slice(buf);
        self.dirty = true;
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
    }
}
