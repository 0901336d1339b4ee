//! Code Memory Manager
//!
//! Owns the flash code region: page allocation, a single-page write-back
//! cache, and the allocation table that hands out opaque [`CodeHandle`]s.
//!
//! Design principles:
//! - Allocations are whole runs of pages, found first-fit in a page bitmap
//! - Handles carry a salt that changes on every free, so a handle kept past
//!   `free` is rejected instead of reaching a reused slot
//! - Only one page is cached; touching another page flushes it first
//! - Anything that programs flash is split-phase: the call returns
//!   [`IoStatus::Pending`] and a [`FlashCompletion`] is queued for the
//!   scheduler to deliver

mod cache;
mod error;

pub use cache::WriteCache;
pub use error::{CodememError, CodememResult};

use super::ModuleId;
use super::config::{Config, ConfigError};
use crate::platform::FlashDevice;
use std::collections::VecDeque;

/// Opaque reference to a code allocation: `salt << 8 | index`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodeHandle(pub u16);

impl CodeHandle {
    /// Sentinel never returned by a successful allocation
    pub const INVALID: CodeHandle = CodeHandle(0xFFFF);

    fn new(index: usize, salt: u8) -> Self {
        debug_assert!(index < 0xFF);
        Self((u16::from(salt) << 8) | index as u16)
    }

    fn index(self) -> usize {
        (self.0 & 0xFF) as usize
    }

    fn salt(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn is_invalid(self) -> bool {
        self == Self::INVALID
    }
}

impl std::fmt::Display for CodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Code({}#{})", self.index(), self.salt())
    }
}

/// What an allocation will hold
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeKind {
    /// Relocatable module image; may be marked executable
    Executable,
    /// Read-only data (constant tables, bytecode)
    ReadOnly,
}

/// Outcome of an I/O call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// Finished without a flash cycle
    Done,
    /// A flash cycle ran; a completion will be delivered to the requester
    Pending,
}

/// Split-phase completion waiting to be posted to the requester
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashCompletion {
    pub handle: CodeHandle,
    pub requester: ModuleId,
}

/// A live allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    /// Flash byte address of the first page
    pub start_addr: u32,
    /// Requested size in bytes
    pub size: u16,
    pub salt: u8,
    pub kind: CodeKind,
    pub executable: bool,
}

/// Allocation table entry; the salt outlives the allocation
#[derive(Debug, Clone, Copy, Default)]
struct Slot {
    alloc: Option<Allocation>,
    salt: u8,
}

/// One bit per flash page, set = in use
#[derive(Debug, Clone)]
struct PageBitmap {
    bits: Vec<u8>,
    len: usize,
}

impl PageBitmap {
    fn new(len: usize) -> Self {
        Self {
            bits: vec![0; len.div_ceil(8)],
            len,
        }
    }

    fn is_set(&self, i: usize) -> bool {
        self.bits[i / 8] & (1 << (i % 8)) != 0
    }

    fn set_range(&mut self, start: usize, count: usize, used: bool) {
        for i in start..start + count {
            if used {
                self.bits[i / 8] |= 1 << (i % 8);
            } else {
                self.bits[i / 8] &= !(1 << (i % 8));
            }
        }
    }

    /// First run of `count` clear bits
    fn find_run(&self, count: usize) -> Option<usize> {
        let mut run_start = 0;
        let mut run_len = 0;
        for i in 0..self.len {
            if self.is_set(i) {
                run_len = 0;
                run_start = i + 1;
            } else {
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
        }
        None
    }

    fn free_count(&self) -> usize {
        (0..self.len).filter(|&i| !self.is_set(i)).count()
    }
}

/// The code memory manager
pub struct Codemem<F: FlashDevice> {
    flash: F,
    base: u32,
    page_size: usize,
    pages: PageBitmap,
    slots: Vec<Slot>,
    cache: WriteCache,
    completions: VecDeque<FlashCompletion>,
}

impl<F: FlashDevice> Codemem<F> {
    /// Take ownership of `flash` and manage the region described by `config`
    pub fn new(flash: F, config: &Config) -> CodememResult<Self> {
        config.validate().map_err(|e| match e {
            ConfigError::Invalid(reason) => CodememError::Geometry(reason),
            ConfigError::Parse(_) => CodememError::Geometry("unreadable configuration"),
        })?;
        if flash.page_size() != config.page_size {
            return Err(CodememError::Geometry("page size differs from device"));
        }
        let region_end = u64::from(config.flash_base) + config.code_region_size() as u64;
        let device_end = u64::from(flash.base_addr()) + flash.size() as u64;
        if config.flash_base < flash.base_addr() || region_end > device_end {
            return Err(CodememError::Geometry("code region outside device"));
        }
        if (config.flash_base - flash.base_addr()) as usize % config.page_size != 0 {
            return Err(CodememError::Geometry("code region not page aligned"));
        }
        Ok(Self {
            flash,
            base: config.flash_base,
            page_size: config.page_size,
            pages: PageBitmap::new(config.page_count),
            slots: vec![Slot::default(); config.max_allocations],
            cache: WriteCache::new(config.page_size),
            completions: VecDeque::new(),
        })
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Reserve at least `size` bytes of flash
    ///
    /// `NoSpace` and `TableFull` are back-pressure: retry later.
    pub fn allocate(&mut self, size: u16, kind: CodeKind) -> CodememResult<CodeHandle> {
        if size == 0 {
            return Err(CodememError::InvalidSize);
        }
        let index = self
            .slots
            .iter()
            .position(|s| s.alloc.is_none())
            .ok_or(CodememError::TableFull)?;

        let page_count = (size as usize).div_ceil(self.page_size);
        let first = self
            .pages
            .find_run(page_count)
            .ok_or(CodememError::NoSpace { requested: size })?;
        self.pages.set_range(first, page_count, true);

        let slot = &mut self.slots[index];
        slot.alloc = Some(Allocation {
            start_addr: self.base + (first * self.page_size) as u32,
            size,
            salt: slot.salt,
            kind,
            executable: false,
        });

        Ok(CodeHandle::new(index, slot.salt))
    }

    /// Release an allocation
    ///
    /// Cached bytes belonging to it are discarded; flash is left as is.
    pub fn free(&mut self, handle: CodeHandle) -> CodememResult<()> {
        let alloc = self.lookup(handle)?;
        let (start, end) = self.span(&alloc);
        if self.cache.covers(start, end) {
            self.cache.invalidate();
        }

        let first = ((alloc.start_addr - self.base) as usize) / self.page_size;
        self.pages.set_range(first, self.page_span(&alloc), false);

        let slot = &mut self.slots[handle.index()];
        slot.alloc = None;
        slot.salt = slot.salt.wrapping_add(1);
        Ok(())
    }

    /// Allow execution of a fully written, flushed executable allocation
    ///
    /// Idempotent.
    pub fn mark_executable(&mut self, handle: CodeHandle) -> CodememResult<()> {
        let alloc = self.lookup(handle)?;
        if alloc.kind != CodeKind::Executable {
            return Err(CodememError::NotExecutable);
        }
        let (start, end) = self.span(&alloc);
        if self.cache.is_dirty() && self.cache.covers(start, end) {
            return Err(CodememError::Unflushed);
        }
        if let Some(a) = self.slots[handle.index()].alloc.as_mut() {
            a.executable = true;
        }
        Ok(())
    }

    // ========================================================================
    // I/O
    // ========================================================================

    /// Write `buf` at `offset` within the allocation
    pub fn write(
        &mut self,
        handle: CodeHandle,
        requester: ModuleId,
        buf: &[u8],
        offset: usize,
    ) -> CodememResult<IoStatus> {
        let alloc = self.lookup(handle)?;
        self.check_bounds(&alloc, offset, buf.len())?;

        let mut flashed = false;
        let mut done = 0;
        while done < buf.len() {
            let addr = alloc.start_addr + (offset + done) as u32;
            let page = self.page_of(addr);
            let in_page = (addr - page) as usize;
            let chunk = (self.page_size - in_page).min(buf.len() - done);

            if self.cache.page() != Some(page) {
                flashed |= self.load_page(page)?;
            }
            self.cache.write(in_page, &buf[done..done + chunk]);
            done += chunk;
        }

        Ok(self.complete(handle, requester, flashed))
    }

    /// Read `buf.len()` bytes at `offset`, seeing unflushed cached writes
    pub fn read(
        &mut self,
        handle: CodeHandle,
        _requester: ModuleId,
        buf: &mut [u8],
        offset: usize,
    ) -> CodememResult<IoStatus> {
        let alloc = self.lookup(handle)?;
        self.check_bounds(&alloc, offset, buf.len())?;

        let mut done = 0;
        while done < buf.len() {
            let addr = alloc.start_addr + (offset + done) as u32;
            let page = self.page_of(addr);
            let in_page = (addr - page) as usize;
            let chunk = (self.page_size - in_page).min(buf.len() - done);
            let dst = &mut buf[done..done + chunk];

            if self.cache.page() == Some(page) {
                self.cache.read(in_page, dst);
            } else {
                self.flash.read(addr, dst)?;
            }
            done += chunk;
        }

        Ok(IoStatus::Done)
    }

    /// Write back the cached page if it belongs to this allocation
    pub fn flush(&mut self, handle: CodeHandle, requester: ModuleId) -> CodememResult<IoStatus> {
        let alloc = self.lookup(handle)?;
        let (start, end) = self.span(&alloc);
        let flashed = self.cache.covers(start, end) && self.flush_cache()?;
        Ok(self.complete(handle, requester, flashed))
    }

    /// Write back whatever is dirty. Used at shutdown; posts no completion.
    pub fn flush_all(&mut self) -> CodememResult<bool> {
        self.flush_cache()
    }

    /// Completions produced since the last call, oldest first
    pub fn take_completions(&mut self) -> Vec<FlashCompletion> {
        self.completions.drain(..).collect()
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Details of a live allocation
    pub fn info(&self, handle: CodeHandle) -> CodememResult<Allocation> {
        self.lookup(handle)
    }

    pub fn start_addr(&self, handle: CodeHandle) -> CodememResult<u32> {
        self.lookup(handle).map(|a| a.start_addr)
    }

    /// True if `handle` still names the allocation it was issued for
    pub fn is_live(&self, handle: CodeHandle) -> bool {
        self.lookup(handle).is_ok()
    }

    pub fn free_pages(&self) -> usize {
        self.pages.free_count()
    }

    pub fn allocation_count(&self) -> usize {
        self.slots.iter().filter(|s| s.alloc.is_some()).count()
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn lookup(&self, handle: CodeHandle) -> CodememResult<Allocation> {
        let stale = CodememError::StaleHandle { handle: handle.0 };
        let slot = self.slots.get(handle.index()).ok_or(stale.clone())?;
        match slot.alloc {
            Some(alloc) if alloc.salt == handle.salt() => Ok(alloc),
            _ => Err(stale),
        }
    }

    fn check_bounds(&self, alloc: &Allocation, offset: usize, len: usize) -> CodememResult<()> {
        if offset.checked_add(len).is_none_or(|end| end > alloc.size as usize) {
            return Err(CodememError::OutOfBounds {
                offset,
                len,
                size: alloc.size,
            });
        }
        Ok(())
    }

    fn page_span(&self, alloc: &Allocation) -> usize {
        (alloc.size as usize).div_ceil(self.page_size)
    }

    /// Flash address range `[start, end)` of the pages an allocation owns
    fn span(&self, alloc: &Allocation) -> (u32, u32) {
        let len = (self.page_span(alloc) * self.page_size) as u32;
        (alloc.start_addr, alloc.start_addr + len)
    }

    fn page_of(&self, addr: u32) -> u32 {
        let page_size = self.page_size as u32;
        self.base + (addr - self.base) / page_size * page_size
    }

    /// Program the dirty cache page. Returns true if flash was touched.
    fn flush_cache(&mut self) -> CodememResult<bool> {
        let Some((page, data)) = self.cache.dirty_page() else {
            return Ok(false);
        };
        self.flash.erase_page(page)?;
        self.flash.program(page, data)?;
        self.cache.mark_clean();
        Ok(true)
    }

    /// Make `page` the cached page, flushing the previous one first
    fn load_page(&mut self, page: u32) -> CodememResult<bool> {
        let flashed = self.flush_cache()?;
        let buf = self.cache.reload(page);
        if let Err(e) = self.flash.read(page, buf) {
            self.cache.invalidate();
            return Err(e.into());
        }
        Ok(flashed)
    }

    fn complete(&mut self, handle: CodeHandle, requester: ModuleId, flashed: bool) -> IoStatus {
        if flashed {
            self.completions.push_back(FlashCompletion { handle, requester });
            IoStatus::Pending
        } else {
            IoStatus::Done
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::sim::SimFlash;

    const REQ: ModuleId = 9;

    fn config() -> Config {
        Config {
            flash_base: 0x1000,
            page_size: 64,
            page_count: 8,
            max_allocations: 4,
            ..Config::default()
        }
    }

    fn codemem() -> Codemem<SimFlash> {
        Codemem::new(SimFlash::new(0x1000, 64, 8), &config()).unwrap()
    }

    #[test]
    fn test_allocate_first_fit() {
        let mut cm = codemem();
        let a = cm.allocate(100, CodeKind::Executable).unwrap();
        let b = cm.allocate(64, CodeKind::ReadOnly).unwrap();

        assert_eq!(cm.start_addr(a).unwrap(), 0x1000);
        assert_eq!(cm.start_addr(b).unwrap(), 0x1080);
        assert_eq!(cm.free_pages(), 5);

        // Freed hole is reused by a request that fits
        cm.free(a).unwrap();
        let c = cm.allocate(128, CodeKind::ReadOnly).unwrap();
        assert_eq!(cm.start_addr(c).unwrap(), 0x1000);
    }

    #[test]
    fn test_exhaustion_is_recoverable() {
        let mut cm = codemem();
        let big = cm.allocate(6 * 64, CodeKind::Executable).unwrap();

        let err = cm.allocate(3 * 64, CodeKind::Executable).unwrap_err();
        assert_eq!(err, CodememError::NoSpace { requested: 192 });
        assert!(err.is_recoverable());

        cm.free(big).unwrap();
        assert!(cm.allocate(3 * 64, CodeKind::Executable).is_ok());
    }

    #[test]
    fn test_table_full() {
        let mut cm = codemem();
        for _ in 0..4 {
            cm.allocate(1, CodeKind::ReadOnly).unwrap();
        }
        assert_eq!(
            cm.allocate(1, CodeKind::ReadOnly),
            Err(CodememError::TableFull)
        );
        assert_eq!(cm.allocate(0, CodeKind::ReadOnly), Err(CodememError::InvalidSize));
    }

    #[test]
    fn test_write_read_round_trip() {
        let mut cm = codemem();
        let h = cm.allocate(200, CodeKind::Executable).unwrap();

        // Crosses two page boundaries
        let data: Vec<u8> = (0..150).map(|i| i as u8).collect();
        cm.write(h, REQ, &data, 20).unwrap();

        let mut buf = vec![0u8; 150];
        assert_eq!(cm.read(h, REQ, &mut buf, 20).unwrap(), IoStatus::Done);
        assert_eq!(buf, data);

        // And again after everything reached flash
        cm.flush(h, REQ).unwrap();
        let mut buf = vec![0u8; 150];
        cm.read(h, REQ, &mut buf, 20).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn test_same_page_writes_stay_in_ram() {
        let mut cm = codemem();
        let h = cm.allocate(128, CodeKind::Executable).unwrap();

        // First touch loads the page; nothing is dirty yet so no program
        assert_eq!(cm.write(h, REQ, &[1, 2], 0).unwrap(), IoStatus::Done);
        assert_eq!(cm.write(h, REQ, &[3, 4], 10).unwrap(), IoStatus::Done);
        assert_eq!(cm.flash().program_count, 0);

        // Moving to the next page forces the flush
        assert_eq!(cm.write(h, REQ, &[5], 64).unwrap(), IoStatus::Pending);
        assert_eq!(cm.flash().program_count, 1);
        assert_eq!(
            cm.take_completions(),
            vec![FlashCompletion {
                handle: h,
                requester: REQ
            }]
        );
        assert!(cm.take_completions().is_empty());
    }

    #[test]
    fn test_flush_only_touches_own_page() {
        let mut cm = codemem();
        let a = cm.allocate(64, CodeKind::Executable).unwrap();
        let b = cm.allocate(64, CodeKind::Executable).unwrap();

        cm.write(a, REQ, &[0xAA], 0).unwrap();
        assert_eq!(cm.flush(b, REQ).unwrap(), IoStatus::Done);
        assert_eq!(cm.flush(a, REQ).unwrap(), IoStatus::Pending);
        assert_eq!(cm.flush(a, REQ).unwrap(), IoStatus::Done);
        assert_eq!(cm.flash().as_slice()[0], 0xAA);
    }

    #[test]
    fn test_out_of_bounds() {
        let mut cm = codemem();
        let h = cm.allocate(10, CodeKind::ReadOnly).unwrap();

        assert!(cm.write(h, REQ, &[0; 4], 6).is_ok());
        assert_eq!(
            cm.write(h, REQ, &[0; 4], 8),
            Err(CodememError::OutOfBounds {
                offset: 8,
                len: 4,
                size: 10
            })
        );
        let mut buf = [0u8; 1];
        assert!(cm.read(h, REQ, &mut buf, 10).is_err());
    }

    #[test]
    fn test_stale_handle_after_free_and_reuse() {
        let mut cm = codemem();
        let old = cm.allocate(32, CodeKind::Executable).unwrap();
        cm.free(old).unwrap();

        // Same slot, new salt
        let new = cm.allocate(32, CodeKind::Executable).unwrap();
        assert_ne!(old, new);
        assert!(cm.is_live(new));
        assert!(!cm.is_live(old));

        let stale = CodememError::StaleHandle { handle: old.0 };
        let mut buf = [0u8; 1];
        assert_eq!(cm.write(old, REQ, &[1], 0), Err(stale.clone()));
        assert_eq!(cm.read(old, REQ, &mut buf, 0), Err(stale.clone()));
        assert_eq!(cm.flush(old, REQ), Err(stale.clone()));
        assert_eq!(cm.mark_executable(old), Err(stale.clone()));
        assert_eq!(cm.free(old), Err(stale));
        assert!(cm.is_live(new));
    }

    #[test]
    fn test_invalid_handle_rejected() {
        let mut cm = codemem();
        assert!(CodeHandle::INVALID.is_invalid());
        assert!(cm.free(CodeHandle::INVALID).is_err());
        assert!(!cm.is_live(CodeHandle::INVALID));
    }

    #[test]
    fn test_free_discards_cached_writes() {
        let mut cm = codemem();
        let h = cm.allocate(64, CodeKind::Executable).unwrap();
        cm.write(h, REQ, &[0x11; 8], 0).unwrap();
        cm.free(h).unwrap();

        assert!(!cm.flush_all().unwrap());
        assert_eq!(cm.flash().program_count, 0);
    }

    #[test]
    fn test_mark_executable_rules() {
        let mut cm = codemem();
        let code = cm.allocate(64, CodeKind::Executable).unwrap();
        let data = cm.allocate(64, CodeKind::ReadOnly).unwrap();

        assert_eq!(cm.mark_executable(data), Err(CodememError::NotExecutable));

        cm.write(code, REQ, &[0x0C, 0x94], 0).unwrap();
        assert_eq!(cm.mark_executable(code), Err(CodememError::Unflushed));

        cm.flush(code, REQ).unwrap();
        cm.mark_executable(code).unwrap();
        cm.mark_executable(code).unwrap();
        assert!(cm.info(code).unwrap().executable);
    }

    #[test]
    fn test_geometry_checks() {
        let flash = SimFlash::new(0x1000, 32, 8);
        assert!(matches!(
            Codemem::new(flash, &config()),
            Err(CodememError::Geometry(_))
        ));

        let flash = SimFlash::new(0x1000, 64, 4);
        assert!(matches!(
            Codemem::new(flash, &config()),
            Err(CodememError::Geometry(_))
        ));
    }

    #[test]
    fn test_unvalidated_config_rejected() {
        // Device and config agree, but a zero page size is still refused
        let zero = Config {
            page_size: 0,
            ..config()
        };
        assert_eq!(
            Codemem::new(SimFlash::new(0x1000, 0, 8), &zero).err(),
            Some(CodememError::Geometry("page_size must be a power of two"))
        );

        let no_slots = Config {
            max_allocations: 0,
            ..config()
        };
        assert_eq!(
            Codemem::new(SimFlash::new(0x1000, 64, 8), &no_slots).err(),
            Some(CodememError::Geometry("max_allocations must be 1..=255"))
        );
    }

    #[test]
    fn test_page_bitmap_runs() {
        let mut bm = PageBitmap::new(10);
        bm.set_range(0, 2, true);
        bm.set_range(4, 1, true);
        assert_eq!(bm.find_run(2), Some(2));
        assert_eq!(bm.find_run(3), Some(5));
        assert_eq!(bm.find_run(6), None);
        assert_eq!(bm.free_count(), 7);
    }
}
