//! Page allocator.
//!
//! Owns the page-number space of one backing file. The header lives in
//! page 0, right after the page header:
//!
//! ```text
//! offset  size  field
//! ------  ----  -----------------------------------------------
//!      8     4  page size
//!     12     4  pages added per file growth
//!     16     4  head of the free list (PAGE_NONE when empty)
//!     20     4  reserved
//!     24     8  tail: low half next unused page, high half file end
//!     32     -  caller meta region
//! ```
//!
//! Pages come from two places. The tail is bumped with a CAS and may be
//! used by anyone. The free list and file growth need exclusive access.
//! Free-list pages chain through `next`; each holds a stack of page
//! numbers:
//!
//! ```text
//! +--------+--------+----------+-----------+---------------------+
//! | header |next u32| count u32| pages[..] |                     |
//! +--------+--------+----------+-----------+---------------------+
//! ```

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::codec::{atomic_u32, atomic_u64, get_u32, put_u32};
use crate::constants::{
    Flags, PageType, ALLOC_COUNT_OFFSET, ALLOC_FREE_OFFSET, ALLOC_PAGE_SIZE_OFFSET,
    ALLOC_TAIL_OFFSET, DEFAULT_ALLOC_COUNT, DEFAULT_PAGE_SIZE, FREE_COUNT_OFFSET,
    FREE_NEXT_OFFSET, FREE_PAGES_OFFSET, MAX_PAGE_SIZE, META_OFFSET, MIN_PAGE_SIZE, PAGE_NONE,
};
use crate::error::{Error, Result};
use crate::page::{page_type, Page};
use crate::types::{AllocInfo, PageNo};

/// Options used when the backing file is created
#[derive(Debug, Clone)]
pub struct AllocConfig {
    pub page_size: usize,
    pub alloc_count: usize,
    /// CREATE, NOSYNC and ASYNC are honored
    pub flags: Flags,
}

impl Default for AllocConfig {
    fn default() -> Self {
        AllocConfig {
            page_size: DEFAULT_PAGE_SIZE,
            alloc_count: DEFAULT_ALLOC_COUNT,
            flags: Flags::CREATE,
        }
    }
}

#[inline]
fn pack(tail: u64, end: u64) -> u64 {
    (end << 32) | tail
}

#[inline]
fn unpack(v: u64) -> (u64, u64) {
    (v & 0xffff_ffff, v >> 32)
}

pub(crate) fn check_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(Error::InvalidConfig("page size must be a power of two in 4096..=65536"));
    }
    Ok(())
}

#[derive(Debug)]
pub struct PageAlloc {
    file: File,
    path: PathBuf,
    hdr: Page,
    page_size: usize,
    alloc_count: usize,
    meta_size: usize,
    flags: Flags,
    /// Cached free-list head page
    free: Mutex<Option<Page>>,
    dirty: AtomicBool,
    free_dirty: AtomicBool,
}

impl PageAlloc {
    /// Open the allocator of `path`, creating the file when it is empty.
    ///
    /// `meta_size` bytes after the allocator header are reserved for the
    /// caller. An existing file keeps the page size it was created with.
    pub fn open(path: impl AsRef<Path>, meta_size: usize, config: &AllocConfig) -> Result<PageAlloc> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(config.flags.contains(Flags::CREATE))
            .open(&path)?;
        let len = file.metadata()?.len();

        let (page_size, fresh) = if len == 0 {
            check_page_size(config.page_size)?;
            if config.alloc_count == 0 {
                return Err(Error::InvalidConfig("allocation batch must be at least one page"));
            }
            file.set_len(config.page_size as u64)?;
            (config.page_size, true)
        } else {
            let mut head = [0u8; META_OFFSET];
            file.read_exact_at(&mut head, 0)?;
            if page_type(&head) != Some(PageType::Index) {
                return Err(Error::Invalid);
            }
            let page_size = get_u32(&head, ALLOC_PAGE_SIZE_OFFSET) as usize;
            check_page_size(page_size).map_err(|_| Error::Invalid)?;
            (page_size, false)
        };
        if META_OFFSET + meta_size > page_size {
            return Err(Error::InvalidConfig("meta region does not fit in the header page"));
        }

        let mut hdr = Page::map(&file, 0, 1, page_size)?;
        if fresh {
            hdr.init(PageType::Index);
            let buf = hdr.bytes_mut();
            put_u32(buf, ALLOC_PAGE_SIZE_OFFSET, page_size as u32);
            put_u32(buf, ALLOC_COUNT_OFFSET, config.alloc_count as u32);
            put_u32(buf, ALLOC_FREE_OFFSET, PAGE_NONE);
            buf[ALLOC_TAIL_OFFSET..ALLOC_TAIL_OFFSET + 8].copy_from_slice(&pack(1, 1).to_le_bytes());
            hdr.sync(config.flags)?;
            log::debug!("created page file {} with {}-byte pages", path.display(), page_size);
        }
        let alloc_count = get_u32(hdr.bytes(), ALLOC_COUNT_OFFSET).max(1) as usize;

        let alloc = PageAlloc {
            file,
            path,
            hdr,
            page_size,
            alloc_count,
            meta_size,
            flags: config.flags & (Flags::NOSYNC | Flags::ASYNC),
            free: Mutex::new(None),
            dirty: AtomicBool::new(false),
            free_dirty: AtomicBool::new(false),
        };
        let (tail, end) = alloc.tail_end();
        if tail > end || end * page_size as u64 > len.max(page_size as u64) {
            return Err(Error::corrupted(0, format!("tail {} / end {} outside the file", tail, end)));
        }
        Ok(alloc)
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn alloc_count(&self) -> usize {
        self.alloc_count
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Bytes of the caller meta region
    pub fn meta_size(&self) -> usize {
        self.meta_size
    }

    /// Map `count` pages of this file starting at `no`.
    pub fn map(&self, no: PageNo, count: u32) -> Result<Page> {
        if no == PAGE_NONE || no as u64 + count as u64 > self.tail_end().1 {
            return Err(Error::InvalidPageNumber(no));
        }
        Page::map(&self.file, no, count, self.page_size)
    }

    fn tail_atomic(&self) -> &AtomicU64 {
        // SAFETY: the header mapping lives as long as `self`; 24 is 8-aligned.
        unsafe { atomic_u64(self.hdr.as_mut_ptr(), ALLOC_TAIL_OFFSET) }
    }

    fn free_atomic(&self) -> &AtomicU32 {
        // SAFETY: as above; 16 is 4-aligned.
        unsafe { atomic_u32(self.hdr.as_mut_ptr(), ALLOC_FREE_OFFSET) }
    }

    fn tail_end(&self) -> (u64, u64) {
        unpack(u64::from_le(self.tail_atomic().load(Ordering::Acquire)))
    }

    fn free_list(&self) -> PageNo {
        u32::from_le(self.free_atomic().load(Ordering::Acquire))
    }

    fn set_free_list(&self, no: PageNo) {
        self.free_atomic().store(no.to_le(), Ordering::Release);
        self.dirty.store(true, Ordering::Release);
    }

    fn free_capacity(&self) -> usize {
        (self.page_size - FREE_PAGES_OFFSET) / 4
    }

    pub fn info(&self) -> AllocInfo {
        let (tail, end) = self.tail_end();
        AllocInfo {
            page_size: self.page_size,
            alloc_count: self.alloc_count,
            tail: tail as PageNo,
            end: end as PageNo,
            free_list: self.free_list(),
        }
    }

    /// Allocate `n` pages, appending their numbers to `out`.
    ///
    /// Without `exclusive` only the tail is used and the result may be
    /// short. With `exclusive` the caller must hold the exclusive lock; the
    /// shortfall comes from the free list, then from growing the file.
    pub fn alloc(&self, out: &mut Vec<PageNo>, n: usize, exclusive: bool) -> Result<usize> {
        if n == 0 {
            return Ok(0);
        }
        let mut got = self.alloc_tail(out, n);
        if got == n || !exclusive {
            return Ok(got);
        }
        let mut free = self.free.lock();
        match self.alloc_free(&mut free, out, n - got) {
            Ok(k) => got += k,
            Err(err) => {
                self.give_back(&mut free, out, got);
                return Err(err);
            }
        }
        if got < n {
            match self.alloc_grow(out, n - got) {
                Ok(k) => got += k,
                Err(err) => {
                    self.give_back(&mut free, out, got);
                    return Err(err);
                }
            }
        }
        Ok(got)
    }

    /// Return the last `got` pages of `out` after a failed exclusive alloc.
    fn give_back(&self, free: &mut Option<Page>, out: &mut Vec<PageNo>, got: usize) {
        let pages = out.split_off(out.len() - got);
        if let Err(err) = self.free_locked(free, &pages) {
            log::debug!("leaking {} pages after failed allocation: {}", pages.len(), err);
        }
    }

    fn alloc_tail(&self, out: &mut Vec<PageNo>, n: usize) -> usize {
        let tail = self.tail_atomic();
        let mut cur = tail.load(Ordering::Acquire);
        loop {
            let (t, e) = unpack(u64::from_le(cur));
            let take = (n as u64).min(e - t);
            if take == 0 {
                return 0;
            }
            let next = pack(t + take, e).to_le();
            match tail.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => {
                    out.extend((t..t + take).map(|no| no as PageNo));
                    self.dirty.store(true, Ordering::Release);
                    return take as usize;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    fn alloc_grow(&self, out: &mut Vec<PageNo>, mut need: usize) -> Result<usize> {
        let mut got = 0;
        while need > 0 {
            let cur = self.tail_atomic().load(Ordering::Acquire);
            let (t, e) = unpack(u64::from_le(cur));
            if t == e {
                let add = need.div_ceil(self.alloc_count) * self.alloc_count;
                let end = e + add as u64;
                if end >= PAGE_NONE as u64 {
                    return Err(Error::MapFull);
                }
                let len = end * self.page_size as u64;
                if self.file.metadata()?.len() < len {
                    self.file.set_len(len)?;
                }
                // A failed exchange means another thread moved the tail.
                let _ = self.tail_atomic().compare_exchange(
                    cur,
                    pack(t, end).to_le(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                self.dirty.store(true, Ordering::Release);
                log::debug!("grew {} to {} pages", self.path.display(), end);
            }
            let k = self.alloc_tail(out, need);
            got += k;
            need -= k;
        }
        Ok(got)
    }

    /// Make `head` the cached free-list page, mapping it if needed.
    fn load_free<'a>(&self, free: &'a mut Option<Page>, head: PageNo) -> Result<&'a mut Page> {
        if free.as_ref().map(Page::no) != Some(head) {
            self.release_free(free)?;
            let mut page = self.map(head, 1)?;
            match page.page_type() {
                Some(PageType::FreeHead) => {}
                Some(PageType::FreeChild) => {
                    page.init(PageType::FreeHead);
                    self.free_dirty.store(true, Ordering::Release);
                }
                other => {
                    return Err(Error::corrupted(head, format!("free list holds a {:?} page", other)))
                }
            }
            *free = Some(page);
        }
        free.as_mut().ok_or(Error::InvalidPageNumber(head))
    }

    /// Drop the cached free-list page, flushing it first if it was written.
    fn release_free(&self, free: &mut Option<Page>) -> Result<()> {
        if let Some(page) = free.take() {
            if self.free_dirty.swap(false, Ordering::AcqRel) {
                page.sync(self.flags)?;
            }
        }
        Ok(())
    }

    fn alloc_free(&self, free: &mut Option<Page>, out: &mut Vec<PageNo>, need: usize) -> Result<usize> {
        let mut got = 0;
        while got < need {
            let head = self.free_list();
            if head == PAGE_NONE {
                break;
            }
            let page = self.load_free(free, head)?;
            let buf = page.bytes_mut();
            let count = get_u32(buf, FREE_COUNT_OFFSET) as usize;
            if count > 0 {
                let take = count.min(need - got);
                for i in 0..take {
                    out.push(get_u32(buf, FREE_PAGES_OFFSET + (count - 1 - i) * 4));
                }
                put_u32(buf, FREE_COUNT_OFFSET, (count - take) as u32);
                self.free_dirty.store(true, Ordering::Release);
                got += take;
            } else {
                // The empty list page is itself handed out.
                let next = get_u32(buf, FREE_NEXT_OFFSET);
                *free = None;
                self.free_dirty.store(false, Ordering::Release);
                self.set_free_list(next);
                out.push(head);
                got += 1;
            }
        }
        Ok(got)
    }

    /// Put pages on the free list. The caller must hold exclusive access.
    pub fn free(&self, pages: &[PageNo]) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        let mut free = self.free.lock();
        self.free_locked(&mut free, pages)
    }

    fn free_locked(&self, free: &mut Option<Page>, pages: &[PageNo]) -> Result<()> {
        let (_, end) = self.tail_end();
        if let Some(&bad) = pages.iter().find(|&&no| no == 0 || no as u64 >= end) {
            return Err(Error::InvalidPageNumber(bad));
        }
        let cap = self.free_capacity();
        for &no in pages {
            let head = self.free_list();
            let full = if head == PAGE_NONE {
                true
            } else {
                let page = self.load_free(free, head)?;
                get_u32(page.bytes(), FREE_COUNT_OFFSET) as usize >= cap
            };
            if full {
                if let Some(old) = free.as_mut() {
                    old.init(PageType::FreeChild);
                    self.free_dirty.store(true, Ordering::Release);
                }
                self.release_free(free)?;
                let mut page = self.map(no, 1)?;
                page.init(PageType::FreeHead);
                put_u32(page.bytes_mut(), FREE_NEXT_OFFSET, head);
                put_u32(page.bytes_mut(), FREE_COUNT_OFFSET, 0);
                *free = Some(page);
                self.set_free_list(no);
            } else if let Some(page) = free.as_mut() {
                let buf = page.bytes_mut();
                let count = get_u32(buf, FREE_COUNT_OFFSET) as usize;
                put_u32(buf, FREE_PAGES_OFFSET + count * 4, no);
                put_u32(buf, FREE_COUNT_OFFSET, count as u32 + 1);
            }
            self.free_dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// Visit the free list: `f(page, is_list_page)` for every list page and
    /// every page number it holds.
    pub fn walk_free(&self, mut f: impl FnMut(PageNo, bool)) -> Result<()> {
        let _guard = self.free.lock();
        let mut no = self.free_list();
        let mut seen = 0u64;
        while no != PAGE_NONE {
            seen += 1;
            if seen > self.tail_end().1 {
                return Err(Error::corrupted(no, "free list loops"));
            }
            let page = self.map(no, 1)?;
            let buf = page.bytes();
            if !matches!(page_type(buf), Some(PageType::FreeHead) | Some(PageType::FreeChild)) {
                return Err(Error::corrupted(no, "free list link to a non-free page"));
            }
            f(no, true);
            let count = get_u32(buf, FREE_COUNT_OFFSET) as usize;
            for i in 0..count {
                f(get_u32(buf, FREE_PAGES_OFFSET + i * 4), false);
            }
            no = get_u32(buf, FREE_NEXT_OFFSET);
        }
        Ok(())
    }

    /// Number of pages available from the free list.
    pub fn free_count(&self) -> Result<usize> {
        let mut n = 0;
        self.walk_free(|_, _| n += 1)?;
        Ok(n)
    }

    /// Flush dirty allocator state to the file.
    pub fn sync(&self) -> Result<()> {
        if self.free_dirty.swap(false, Ordering::AcqRel) {
            if let Some(page) = self.free.lock().as_ref() {
                page.sync(self.flags)?;
            }
        }
        if self.dirty.swap(false, Ordering::AcqRel) {
            self.hdr.sync(self.flags)?;
        }
        Ok(())
    }

    /// Flush the header page, which also holds the caller meta region.
    pub fn sync_header(&self) -> Result<()> {
        self.dirty.store(false, Ordering::Release);
        self.hdr.sync(self.flags)
    }

    fn meta_off(&self, off: usize, len: usize) -> usize {
        assert!(off + len <= self.meta_size, "meta access {}+{} past {}", off, len, self.meta_size);
        META_OFFSET + off
    }

    /// Atomic view of a 4-aligned u32 in the meta region. Values are
    /// stored little-endian.
    pub fn meta_u32(&self, off: usize) -> &AtomicU32 {
        let off = self.meta_off(off, 4);
        // SAFETY: bounds checked above; the mapping lives as long as `self`.
        unsafe { atomic_u32(self.hdr.as_mut_ptr(), off) }
    }

    /// Atomic view of an 8-aligned u64 in the meta region.
    pub fn meta_u64(&self, off: usize) -> &AtomicU64 {
        let off = self.meta_off(off, 8);
        // SAFETY: as above.
        unsafe { atomic_u64(self.hdr.as_mut_ptr(), off) }
    }

    pub fn read_meta(&self, off: usize, out: &mut [u8]) {
        let off = self.meta_off(off, out.len());
        // SAFETY: bounds checked; byte fields are only written under the
        // exclusive lock or before the file is shared.
        unsafe {
            std::ptr::copy_nonoverlapping(self.hdr.as_mut_ptr().add(off), out.as_mut_ptr(), out.len())
        }
    }

    pub fn write_meta(&self, off: usize, data: &[u8]) {
        let off = self.meta_off(off, data.len());
        // SAFETY: as above.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.hdr.as_mut_ptr().add(off), data.len()) }
        self.dirty.store(true, Ordering::Release);
    }
}

impl Drop for PageAlloc {
    fn drop(&mut self) {
        if let Err(err) = self.sync() {
            log::debug!("sync of {} on close failed: {}", self.path.display(), err);
        }
    }
}
