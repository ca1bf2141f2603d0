//! Deferred page reclamation.
//!
//! Pages replaced by a committed transaction cannot go straight back to the
//! allocator: a reader holding an older snapshot may still walk them. The
//! GC parks them in generations tagged with the freeing transaction id and
//! releases a generation only once the watermark (the oldest snapshot any
//! connection may still use) has moved past it.
//!
//! GC pages form a FIFO chain from `head` to `tail`:
//!
//! ```text
//! +--------+----------+----------+----------+------------+-----+-----------------+
//! | header | next u32 | head u16 | tail u16 | remain u16 | pad | records ...     |
//! +--------+----------+----------+----------+------------+-----+-----------------+
//!
//! record: | xid u64 | count u32 | pages[count] u32 |
//! ```
//!
//! `head` and `tail` are offsets into the record area: the oldest live
//! record and the end of the last one. A generation that does not fit in
//! the tail page continues in new pages as further records with the same
//! xid; consecutive equal-xid records are reclaimed as one generation.

use crate::alloc::PageAlloc;
use crate::codec::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};
use crate::constants::{
    PageType, GC_DATA_OFFSET, GC_HEAD_OFFSET, GC_NEXT_OFFSET, GC_RECORD_HEADER, GC_REMAIN_OFFSET,
    GC_TAIL_OFFSET, PAGE_NONE,
};
use crate::error::{Error, Result};
use crate::page::{expect_page, Page};
use crate::types::{PageNo, TxnId};

/// Persistent ends of the GC chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcRoots {
    pub head: PageNo,
    pub tail: PageNo,
}

impl GcRoots {
    pub const EMPTY: GcRoots = GcRoots {
        head: PAGE_NONE,
        tail: PAGE_NONE,
    };
}

impl Default for GcRoots {
    fn default() -> Self {
        GcRoots::EMPTY
    }
}

/// GC state kept between calls: the mapped head and tail pages.
#[derive(Debug, Default)]
pub struct Gc {
    head: Option<Page>,
    tail: Option<Page>,
}

fn data_size(page_size: usize) -> usize {
    page_size - GC_DATA_OFFSET
}

fn init_gc_page(page: &mut Page) {
    let size = data_size(page.len()) as u16;
    page.init(PageType::Gc);
    let buf = page.bytes_mut();
    put_u32(buf, GC_NEXT_OFFSET, PAGE_NONE);
    put_u16(buf, GC_HEAD_OFFSET, 0);
    put_u16(buf, GC_TAIL_OFFSET, 0);
    put_u16(buf, GC_REMAIN_OFFSET, size);
}

/// Append one record to `page`. The caller checked that it fits.
fn write_record(page: &mut Page, xid: TxnId, pages: &[PageNo]) {
    let buf = page.bytes_mut();
    let tail = get_u16(buf, GC_TAIL_OFFSET) as usize;
    let remain = get_u16(buf, GC_REMAIN_OFFSET) as usize;
    let at = GC_DATA_OFFSET + tail;
    put_u64(buf, at, xid);
    put_u32(buf, at + 8, pages.len() as u32);
    for (i, &no) in pages.iter().enumerate() {
        put_u32(buf, at + GC_RECORD_HEADER + i * 4, no);
    }
    let size = GC_RECORD_HEADER + pages.len() * 4;
    put_u16(buf, GC_TAIL_OFFSET, (tail + size) as u16);
    put_u16(buf, GC_REMAIN_OFFSET, (remain - size) as u16);
}

/// Page numbers a record can hold given `room` free bytes.
fn record_room(room: usize) -> usize {
    room.saturating_sub(GC_RECORD_HEADER) / 4
}

fn load<'a>(slot: &'a mut Option<Page>, alloc: &PageAlloc, no: PageNo) -> Result<&'a mut Page> {
    if slot.as_ref().map(Page::no) != Some(no) {
        let page = alloc.map(no, 1)?;
        expect_page(page.bytes(), no, PageType::Gc)?;
        *slot = Some(page);
    }
    slot.as_mut().ok_or(Error::InvalidPageNumber(no))
}

impl Gc {
    pub fn new() -> Gc {
        Gc::default()
    }

    /// Hand `pages`, freed by transaction `xid`, to the GC.
    ///
    /// Either the whole generation is recorded or nothing changes. The
    /// caller must hold exclusive access to the allocator.
    pub fn put(&mut self, alloc: &PageAlloc, roots: &mut GcRoots, xid: TxnId, pages: &[PageNo]) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }
        let per_page = record_room(data_size(alloc.page_size()));
        let in_tail = if roots.tail == PAGE_NONE {
            0
        } else {
            let tail = load(&mut self.tail, alloc, roots.tail)?;
            record_room(get_u16(tail.bytes(), GC_REMAIN_OFFSET) as usize).min(pages.len())
        };
        let spill = pages.len() - in_tail;
        let need = spill.div_ceil(per_page);

        let mut fresh = Vec::with_capacity(need);
        if need > 0 {
            alloc.alloc(&mut fresh, need, true)?;
        }
        let mapped: Result<Vec<Page>> = fresh.iter().map(|&no| alloc.map(no, 1)).collect();
        let mut mapped = match mapped {
            Ok(mapped) => mapped,
            Err(err) => {
                if let Err(free_err) = alloc.free(&fresh) {
                    log::warn!("dropping {} gc pages after a map failure: {}", fresh.len(), free_err);
                }
                return Err(err);
            }
        };

        let (first, mut rest) = pages.split_at(in_tail);
        if !first.is_empty() {
            if let Some(tail) = self.tail.as_mut() {
                write_record(tail, xid, first);
            }
        }
        for page in mapped.iter_mut() {
            init_gc_page(page);
            let take = rest.len().min(per_page);
            write_record(page, xid, &rest[..take]);
            rest = &rest[take..];
        }

        for page in mapped {
            let no = page.no();
            if roots.tail == PAGE_NONE {
                roots.head = no;
            } else if let Some(tail) = self.tail.as_mut() {
                put_u32(tail.bytes_mut(), GC_NEXT_OFFSET, no);
            }
            roots.tail = no;
            self.tail = Some(page);
        }
        log::trace!("gc put xid {} with {} pages", xid, pages.len());
        Ok(())
    }

    /// Release generations older than `watermark`, oldest first, stopping
    /// after `limit` generations or at the first one still in use.
    ///
    /// Returns the number of pages given back to the allocator. The caller
    /// must hold exclusive access and persist `roots` even on error.
    pub fn run(&mut self, alloc: &PageAlloc, roots: &mut GcRoots, watermark: TxnId, limit: usize) -> Result<usize> {
        let mut freed = 0;
        let mut gens = 0;
        let mut last: Option<TxnId> = None;
        let mut batch = Vec::new();

        while roots.head != PAGE_NONE {
            let no = roots.head;
            let page = load(&mut self.head, alloc, no)?;
            let buf = page.bytes_mut();
            let head = get_u16(buf, GC_HEAD_OFFSET) as usize;
            let tail = get_u16(buf, GC_TAIL_OFFSET) as usize;

            if head >= tail {
                if no == roots.tail {
                    put_u16(buf, GC_HEAD_OFFSET, 0);
                    put_u16(buf, GC_TAIL_OFFSET, 0);
                    put_u16(buf, GC_REMAIN_OFFSET, data_size(alloc.page_size()) as u16);
                    break;
                }
                let next = get_u32(buf, GC_NEXT_OFFSET);
                self.head = None;
                alloc.free(&[no])?;
                roots.head = next;
                continue;
            }

            let at = GC_DATA_OFFSET + head;
            let xid = get_u64(buf, at);
            let count = get_u32(buf, at + 8) as usize;
            if xid >= watermark {
                break;
            }
            if last != Some(xid) {
                if gens >= limit {
                    break;
                }
                gens += 1;
                last = Some(xid);
            }
            batch.clear();
            batch.extend((0..count).map(|i| get_u32(buf, at + GC_RECORD_HEADER + i * 4)));
            put_u16(buf, GC_HEAD_OFFSET, (head + GC_RECORD_HEADER + count * 4) as u16);
            alloc.free(&batch)?;
            freed += count;
        }
        if freed > 0 {
            log::debug!("gc released {} pages from {} generations below xid {}", freed, gens, watermark);
        }
        Ok(freed)
    }

    /// Visit every page the GC owns: `f(page, is_gc_page)`.
    pub fn walk(alloc: &PageAlloc, roots: &GcRoots, mut f: impl FnMut(PageNo, bool)) -> Result<()> {
        let mut no = roots.head;
        let mut seen = 0usize;
        while no != PAGE_NONE {
            seen += 1;
            if seen > alloc.info().end as usize {
                return Err(Error::corrupted(no, "gc chain loops"));
            }
            let page = alloc.map(no, 1)?;
            let buf = page.bytes();
            expect_page(buf, no, PageType::Gc)?;
            f(no, true);
            let mut off = get_u16(buf, GC_HEAD_OFFSET) as usize;
            let tail = get_u16(buf, GC_TAIL_OFFSET) as usize;
            while off < tail {
                let at = GC_DATA_OFFSET + off;
                let count = get_u32(buf, at + 8) as usize;
                for i in 0..count {
                    f(get_u32(buf, at + GC_RECORD_HEADER + i * 4), false);
                }
                off += GC_RECORD_HEADER + count * 4;
            }
            if no == roots.tail {
                break;
            }
            no = get_u32(buf, GC_NEXT_OFFSET);
        }
        Ok(())
    }

    /// Number of pages waiting for reclamation.
    pub fn pending(alloc: &PageAlloc, roots: &GcRoots) -> Result<usize> {
        let mut n = 0;
        Gc::walk(alloc, roots, |_, is_gc| {
            if !is_gc {
                n += 1;
            }
        })?;
        Ok(n)
    }
}
