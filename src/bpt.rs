//! B+tree page layout, capacity, verification and debug printing.
//!
//! Every tree page shares one header:
//!
//! ```text
//! offset  size  field
//! ------  ----  -----------------------------------
//!      0     8  page header (type, number)
//!      8     8  id of the transaction that wrote it
//!     16     4  overflow page (PAGE_NONE when none)
//!     20     2  number of keys
//!     22     2  padding
//!     24     -  data
//! ```
//!
//! Leaves store fixed-size entries whose first 8 bytes are the key. Branches
//! interleave 4-byte children and 8-byte separators:
//!
//! ```text
//! | child[0] | key[0] | child[1] | key[1] | ... | key[n-1] | child[n] |
//! ```
//!
//! `child[i]` holds keys below `key[i]`, `child[i+1]` keys at or above it.
//! Equal keys keep to a single leaf. When a leaf fills with one key the
//! older entries move to OVERFLOW pages chained from that leaf.

use std::collections::HashSet;
use std::io::Write;

use crate::alloc::PageAlloc;
use crate::codec::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};
use crate::constants::{
    PageType, BRANCH_SLOT_SIZE, DEFAULT_PAGE_SIZE, PAGE_NONE, TREE_HEADER_SIZE, TREE_NEXT_OFFSET,
    TREE_NKEYS_OFFSET, TREE_XID_OFFSET,
};
use crate::error::{Error, Result};
use crate::page::{init_page, page_no, page_type};
use crate::types::{PageNo, Stat, TxnId};

/// Entries that fit in one leaf
pub fn leaf_order(page_size: usize, entry_size: usize) -> usize {
    (page_size - TREE_HEADER_SIZE) / entry_size
}

/// Children that fit in one branch
pub fn branch_order(page_size: usize) -> usize {
    (page_size - TREE_HEADER_SIZE - 4) / BRANCH_SLOT_SIZE + 1
}

/// Maximum entries of a tree `depth` levels deep with the default page size.
///
/// With 64-byte entries: 63, 21420, 7282800 and 2476152000 for depths 1-4.
pub fn capacity(entry_size: usize, depth: usize) -> usize {
    capacity_for(DEFAULT_PAGE_SIZE, entry_size, depth)
}

pub fn capacity_for(page_size: usize, entry_size: usize, depth: usize) -> usize {
    if depth == 0 {
        return 0;
    }
    let fanout = branch_order(page_size);
    (1..depth).fold(leaf_order(page_size, entry_size), |n, _| n.saturating_mul(fanout))
}

#[inline]
pub(crate) fn entry_key(entry: &[u8]) -> u64 {
    get_u64(entry, 0)
}

#[inline]
pub(crate) fn nkeys(buf: &[u8]) -> usize {
    get_u16(buf, TREE_NKEYS_OFFSET) as usize
}

#[inline]
pub(crate) fn set_nkeys(buf: &mut [u8], n: usize) {
    put_u16(buf, TREE_NKEYS_OFFSET, n as u16);
}

#[inline]
pub(crate) fn node_xid(buf: &[u8]) -> TxnId {
    get_u64(buf, TREE_XID_OFFSET)
}

#[inline]
pub(crate) fn set_node_xid(buf: &mut [u8], xid: TxnId) {
    put_u64(buf, TREE_XID_OFFSET, xid);
}

#[inline]
pub(crate) fn overflow(buf: &[u8]) -> PageNo {
    get_u32(buf, TREE_NEXT_OFFSET)
}

#[inline]
pub(crate) fn set_overflow(buf: &mut [u8], no: PageNo) {
    put_u32(buf, TREE_NEXT_OFFSET, no);
}

pub(crate) fn init_node(buf: &mut [u8], ty: PageType, no: PageNo, xid: TxnId) {
    init_page(buf, ty, no);
    set_node_xid(buf, xid);
    set_overflow(buf, PAGE_NONE);
    set_nkeys(buf, 0);
    put_u16(buf, TREE_NKEYS_OFFSET + 2, 0);
}

#[inline]
fn child_off(i: usize) -> usize {
    TREE_HEADER_SIZE + i * BRANCH_SLOT_SIZE
}

#[inline]
pub(crate) fn branch_child(buf: &[u8], i: usize) -> PageNo {
    get_u32(buf, child_off(i))
}

#[inline]
pub(crate) fn set_branch_child(buf: &mut [u8], i: usize, no: PageNo) {
    put_u32(buf, child_off(i), no);
}

#[inline]
pub(crate) fn branch_key(buf: &[u8], i: usize) -> u64 {
    get_u64(buf, child_off(i) + 4)
}

#[inline]
pub(crate) fn set_branch_key(buf: &mut [u8], i: usize, key: u64) {
    put_u64(buf, child_off(i) + 4, key);
}

/// Child slot to follow for `key`: the number of separators `<= key`.
pub(crate) fn branch_search(buf: &[u8], key: u64) -> usize {
    let (mut lo, mut hi) = (0, nkeys(buf));
    while lo < hi {
        let mid = (lo + hi) / 2;
        if branch_key(buf, mid) <= key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Write a branch from separate key and child lists.
pub(crate) fn write_branch(buf: &mut [u8], keys: &[u64], children: &[PageNo]) {
    debug_assert_eq!(keys.len() + 1, children.len());
    for (i, &child) in children.iter().enumerate() {
        set_branch_child(buf, i, child);
    }
    for (i, &key) in keys.iter().enumerate() {
        set_branch_key(buf, i, key);
    }
    set_nkeys(buf, keys.len());
}

/// Read a branch into separate key and child lists.
pub(crate) fn read_branch(buf: &[u8]) -> (Vec<u64>, Vec<PageNo>) {
    let n = nkeys(buf);
    let keys = (0..n).map(|i| branch_key(buf, i)).collect();
    let children = (0..=n).map(|i| branch_child(buf, i)).collect();
    (keys, children)
}

#[inline]
pub(crate) fn entry_off(i: usize, entry_size: usize) -> usize {
    TREE_HEADER_SIZE + i * entry_size
}

#[inline]
pub(crate) fn leaf_entry(buf: &[u8], i: usize, entry_size: usize) -> &[u8] {
    let off = entry_off(i, entry_size);
    &buf[off..off + entry_size]
}

#[inline]
pub(crate) fn leaf_key(buf: &[u8], i: usize, entry_size: usize) -> u64 {
    get_u64(buf, entry_off(i, entry_size))
}

/// First entry slot whose key is `>= key`.
pub(crate) fn leaf_search(buf: &[u8], key: u64, entry_size: usize) -> usize {
    let (mut lo, mut hi) = (0, nkeys(buf));
    while lo < hi {
        let mid = (lo + hi) / 2;
        if leaf_key(buf, mid, entry_size) < key {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

/// Split point for `total` combined leaf entries held in `buf`.
///
/// Starts at the middle and moves outward, left first, to the nearest slot
/// where the key changes so equal keys stay together. `None` when every
/// key is the same.
pub(crate) fn split_point(buf: &[u8], total: usize, entry_size: usize) -> Option<usize> {
    let key = |i: usize| get_u64(buf, i * entry_size);
    let cut = |s: usize| s >= 1 && s < total && key(s - 1) != key(s);
    let mid = total / 2;
    for d in 0..total {
        if d <= mid && cut(mid - d) {
            return Some(mid - d);
        }
        if d > 0 && cut(mid + d) {
            return Some(mid + d);
        }
    }
    None
}

struct Verifier<'a> {
    alloc: &'a PageAlloc,
    entry_size: usize,
    seen: &'a mut HashSet<PageNo>,
    stat: Stat,
    leaf_depth: Option<u32>,
}

impl Verifier<'_> {
    fn claim(&mut self, no: PageNo) -> Result<()> {
        if !self.seen.insert(no) {
            return Err(Error::corrupted(no, "page is referenced more than once"));
        }
        Ok(())
    }

    fn walk(&mut self, no: PageNo, depth: u32, lo: Option<u64>, hi: Option<u64>) -> Result<()> {
        self.claim(no)?;
        let page = self.alloc.map(no, 1)?;
        let buf = page.bytes();
        if page_no(buf) != no {
            return Err(Error::corrupted(no, format!("header claims page {}", page_no(buf))));
        }
        let in_bounds = |k: u64| lo.map_or(true, |lo| k >= lo) && hi.map_or(true, |hi| k < hi);
        let n = nkeys(buf);
        match page_type(buf) {
            Some(PageType::Branch) => {
                self.stat.branch_pages += 1;
                for i in 0..n {
                    let k = branch_key(buf, i);
                    if !in_bounds(k) {
                        return Err(Error::corrupted(no, format!("separator {} outside its parent range", k)));
                    }
                    if i > 0 && branch_key(buf, i - 1) >= k {
                        return Err(Error::corrupted(no, format!("separators out of order at {}", i)));
                    }
                }
                let (keys, children) = read_branch(buf);
                drop(page);
                for (i, &child) in children.iter().enumerate() {
                    let clo = if i == 0 { lo } else { Some(keys[i - 1]) };
                    let chi = if i == keys.len() { hi } else { Some(keys[i]) };
                    self.walk(child, depth + 1, clo, chi)?;
                }
                Ok(())
            }
            Some(PageType::Leaf) => {
                self.stat.leaf_pages += 1;
                match self.leaf_depth {
                    Some(d) if d != depth => {
                        return Err(Error::corrupted(no, format!("leaf at depth {}, expected {}", depth, d)))
                    }
                    _ => self.leaf_depth = Some(depth),
                }
                if n == 0 {
                    return Err(Error::corrupted(no, "empty leaf"));
                }
                for i in 0..n {
                    let k = leaf_key(buf, i, self.entry_size);
                    if !in_bounds(k) {
                        return Err(Error::corrupted(no, format!("key {} outside its parent range", k)));
                    }
                    if i > 0 && leaf_key(buf, i - 1, self.entry_size) > k {
                        return Err(Error::corrupted(no, format!("keys out of order at {}", i)));
                    }
                }
                self.stat.entries += n;
                let next = overflow(buf);
                if next != PAGE_NONE {
                    let run = leaf_key(buf, 0, self.entry_size);
                    if leaf_key(buf, n - 1, self.entry_size) != run {
                        return Err(Error::corrupted(no, "leaf with overflow holds several keys"));
                    }
                    drop(page);
                    self.walk_overflow(next, run)?;
                }
                Ok(())
            }
            other => Err(Error::corrupted(no, format!("unexpected {:?} page in tree", other))),
        }
    }

    fn walk_overflow(&mut self, mut no: PageNo, run: u64) -> Result<()> {
        while no != PAGE_NONE {
            self.claim(no)?;
            let page = self.alloc.map(no, 1)?;
            let buf = page.bytes();
            if page_type(buf) != Some(PageType::Overflow) {
                return Err(Error::corrupted(no, "overflow link to a non-overflow page"));
            }
            let n = nkeys(buf);
            if n == 0 {
                return Err(Error::corrupted(no, "empty overflow page"));
            }
            if (0..n).any(|i| leaf_key(buf, i, self.entry_size) != run) {
                return Err(Error::corrupted(no, format!("overflow page mixes keys with {}", run)));
            }
            self.stat.overflow_pages += 1;
            self.stat.entries += n;
            no = overflow(buf);
        }
        Ok(())
    }
}

/// Check the tree under `root`: page types, key order, separator ranges,
/// uniform leaf depth, overflow runs and single ownership of every page.
pub fn verify(alloc: &PageAlloc, root: PageNo, entry_size: usize) -> Result<Stat> {
    let mut seen = HashSet::new();
    verify_pages(alloc, root, entry_size, &mut seen)
}

/// As [`verify`], adding every visited page to `seen`. A page already in
/// `seen` counts as a second reference.
pub fn verify_pages(alloc: &PageAlloc, root: PageNo, entry_size: usize, seen: &mut HashSet<PageNo>) -> Result<Stat> {
    let mut v = Verifier {
        alloc,
        entry_size,
        seen,
        stat: Stat {
            psize: alloc.page_size() as u32,
            ..Stat::default()
        },
        leaf_depth: None,
    };
    if root != PAGE_NONE {
        v.walk(root, 1, None, None)?;
    }
    v.stat.depth = v.leaf_depth.unwrap_or(0);
    Ok(v.stat)
}

/// Dump the tree under `root`, formatting leaf entries with `fmt`.
pub fn print<W, F>(alloc: &PageAlloc, root: PageNo, entry_size: usize, out: &mut W, fmt: F) -> Result<()>
where
    W: Write,
    F: Fn(&[u8]) -> String,
{
    if root == PAGE_NONE {
        writeln!(out, "(empty)")?;
        return Ok(());
    }
    print_node(alloc, root, entry_size, 0, out, &fmt)
}

fn print_node<W, F>(alloc: &PageAlloc, no: PageNo, entry_size: usize, level: usize, out: &mut W, fmt: &F) -> Result<()>
where
    W: Write,
    F: Fn(&[u8]) -> String,
{
    let page = alloc.map(no, 1)?;
    let buf = page.bytes();
    let pad = "    ".repeat(level);
    match page_type(buf) {
        Some(PageType::Branch) => {
            let (keys, children) = read_branch(buf);
            writeln!(out, "{}branch {} xid={} keys={:?}", pad, no, node_xid(buf), keys)?;
            drop(page);
            for child in children {
                print_node(alloc, child, entry_size, level + 1, out, fmt)?;
            }
        }
        Some(ty @ (PageType::Leaf | PageType::Overflow)) => {
            let name = if ty == PageType::Leaf { "leaf" } else { "overflow" };
            writeln!(out, "{}{} {} xid={} n={}", pad, name, no, node_xid(buf), nkeys(buf))?;
            for i in 0..nkeys(buf) {
                writeln!(out, "{}  {}", pad, fmt(leaf_entry(buf, i, entry_size)))?;
            }
            let next = overflow(buf);
            drop(page);
            if next != PAGE_NONE {
                print_node(alloc, next, entry_size, level, out, fmt)?;
            }
        }
        other => {
            return Err(Error::corrupted(no, format!("unexpected {:?} page in tree", other)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_reference_page() {
        assert_eq!(leaf_order(4096, 64), 63);
        assert_eq!(branch_order(4096), 340);
        assert_eq!(capacity(64, 1), 63);
        assert_eq!(capacity(64, 2), 21420);
        assert_eq!(capacity(64, 3), 7282800);
        assert_eq!(capacity(64, 4), 2476152000);
    }

    #[test]
    fn test_capacity_other_page_sizes() {
        let (p, e) = (8192, 24);
        let leaf = (p - 24) / e;
        let fan = (p - 28) / 12 + 1;
        assert_eq!(capacity_for(p, e, 1), leaf);
        assert_eq!(capacity_for(p, e, 3), leaf * fan * fan);
        assert_eq!(capacity_for(p, e, 0), 0);
    }

    fn entries(keys: &[u64], esize: usize) -> Vec<u8> {
        let mut buf = vec![0u8; keys.len() * esize];
        for (i, k) in keys.iter().enumerate() {
            put_u64(&mut buf, i * esize, *k);
        }
        buf
    }

    #[test]
    fn test_split_point_keeps_runs_together() {
        let buf = entries(&[1, 2, 3, 4, 5, 6], 16);
        assert_eq!(split_point(&buf, 6, 16), Some(3));
        let buf = entries(&[1, 2, 2, 2, 2, 3], 16);
        assert_eq!(split_point(&buf, 6, 16), Some(1));
        let buf = entries(&[1, 1, 1, 1, 2, 2], 16);
        assert_eq!(split_point(&buf, 6, 16), Some(4));
        let buf = entries(&[7, 7, 7, 7], 16);
        assert_eq!(split_point(&buf, 4, 16), None);
    }

    #[test]
    fn test_branch_search() {
        let mut page = vec![0u8; 4096];
        write_branch(&mut page, &[10, 20, 30], &[1, 2, 3, 4]);
        assert_eq!(branch_search(&page, 5), 0);
        assert_eq!(branch_search(&page, 10), 1);
        assert_eq!(branch_search(&page, 29), 2);
        assert_eq!(branch_search(&page, 30), 3);
        assert_eq!(branch_search(&page, u64::MAX), 3);
    }
}
