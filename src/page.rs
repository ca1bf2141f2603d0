//! Page I/O.
//!
//! Pages are mapped one run at a time, `count` contiguous pages starting at
//! byte `no * page_size`. Dropping a [`Page`] unmaps it. Every page starts
//! with the same 8-byte header:
//!
//! ```text
//! +----------+----------+----------------------------+
//! | type u32 |  no u32  |  type-specific content ... |
//! +----------+----------+----------------------------+
//! ```

use std::fs::File;
use std::slice;

use memmap2::{MmapOptions, MmapRaw};

use crate::codec::{get_u32, put_u32};
use crate::constants::{Flags, PageType, PAGE_NO_OFFSET, PAGE_TYPE_OFFSET};
use crate::error::{Error, Result};
use crate::types::PageNo;

/// A mapped run of pages
#[derive(Debug)]
pub struct Page {
    map: MmapRaw,
    no: PageNo,
    count: u32,
}

impl Page {
    /// Map `count` pages starting at page `no`.
    pub fn map(file: &File, no: PageNo, count: u32, page_size: usize) -> Result<Page> {
        if count == 0 {
            return Err(Error::InvalidPageNumber(no));
        }
        let map = MmapOptions::new()
            .offset(no as u64 * page_size as u64)
            .len(count as usize * page_size)
            .map_raw(file)?;
        #[cfg(feature = "page-track")]
        crate::pgtrack::track(map.as_ptr() as usize, no, count);
        Ok(Page { map, no, count })
    }

    pub fn no(&self) -> PageNo {
        self.no
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.len() == 0
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping is valid for `len` bytes while `self` lives.
        unsafe { slice::from_raw_parts(self.map.as_ptr(), self.map.len()) }
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above; `&mut self` keeps this the only slice handed out.
        unsafe { slice::from_raw_parts_mut(self.map.as_mut_ptr(), self.map.len()) }
    }

    /// Base pointer, for fields accessed through atomics.
    pub(crate) fn as_mut_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    pub fn page_type(&self) -> Option<PageType> {
        page_type(self.bytes())
    }

    /// Stamp the page header with a type and this page's number.
    pub fn init(&mut self, ty: PageType) {
        let no = self.no;
        init_page(self.bytes_mut(), ty, no);
    }

    /// Flush the mapping according to `flags`.
    pub fn sync(&self, flags: Flags) -> Result<()> {
        if flags.contains(Flags::NOSYNC) {
            return Ok(());
        }
        if flags.contains(Flags::ASYNC) {
            self.map.flush_async()?;
        } else {
            self.map.flush()?;
        }
        Ok(())
    }
}

#[cfg(feature = "page-track")]
impl Drop for Page {
    fn drop(&mut self) {
        crate::pgtrack::untrack(self.map.as_ptr() as usize, self.no, self.count);
    }
}

pub fn page_type(buf: &[u8]) -> Option<PageType> {
    PageType::from_tag(get_u32(buf, PAGE_TYPE_OFFSET))
}

pub fn page_no(buf: &[u8]) -> PageNo {
    get_u32(buf, PAGE_NO_OFFSET)
}

pub fn init_page(buf: &mut [u8], ty: PageType, no: PageNo) {
    put_u32(buf, PAGE_TYPE_OFFSET, ty.tag());
    put_u32(buf, PAGE_NO_OFFSET, no);
}

/// Fail with `Corrupted` unless `buf` is page `no` of type `ty`.
pub fn expect_page(buf: &[u8], no: PageNo, ty: PageType) -> Result<()> {
    match page_type(buf) {
        Some(t) if t == ty && page_no(buf) == no => Ok(()),
        Some(t) if t == ty => Err(Error::corrupted(
            no,
            format!("page header claims number {}", page_no(buf)),
        )),
        Some(t) => Err(Error::corrupted(no, format!("expected {:?} page, found {:?}", ty, t))),
        None => Err(Error::corrupted(
            no,
            format!("unknown page type {:#x}", get_u32(buf, PAGE_TYPE_OFFSET)),
        )),
    }
}
