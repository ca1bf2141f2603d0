//! Tree operations on a transaction's per-database cursor.
//!
//! The cursor keeps the path from the root to the current leaf as a list
//! of [`Node`]s. Pages carry no parent links; the path is what lets splits
//! and merges walk back up. Every mutation first clones the path into pages
//! owned by the transaction, then edits those copies in place.

use std::io::Write;

use crate::bpt::{
    self, branch_child, branch_order, branch_search, entry_key, entry_off, leaf_entry, leaf_key,
    leaf_order, leaf_search, nkeys, overflow, read_branch, set_branch_child, set_nkeys,
    set_overflow, split_point, write_branch,
};
use crate::codec::get_u64;
use crate::constants::{PageType, PAGE_NONE, TREE_HEADER_SIZE};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::page::page_type;
use crate::transaction::{mapped, mapped_mut, Transaction};
use crate::types::{PageNo, Stat};

/// How a node was reached from the one before it on the path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Link {
    Root,
    /// Child slot of the parent branch
    Child(usize),
    /// Overflow link of the parent leaf or overflow page
    Overflow,
}

/// Page on the cursor path
#[derive(Debug, Clone, Copy)]
pub(crate) struct Node {
    pub(crate) no: PageNo,
    /// Index of the parent node on the path
    pub(crate) parent: Option<usize>,
    pub(crate) link: Link,
    /// Page belongs to this transaction and may be edited in place
    pub(crate) dirty: bool,
}

#[derive(Debug, Clone, Copy)]
enum Seek {
    Key(u64),
    First,
}

/// Cursor and root state of one database inside a transaction
#[derive(Debug)]
pub(crate) struct TxnDb {
    pub(crate) db: Database,
    /// Current root, published at commit when `root_dirty`
    pub(crate) root: PageNo,
    pub(crate) root_dirty: bool,
    /// Path from the root to the current leaf or overflow page
    pub(crate) nodes: Vec<Node>,
    /// Entry index in the last node
    index: usize,
    /// Key given to the last find
    key: u64,
    /// Key of the entry the traversal started from
    start: u64,
    /// Times the traversal wrapped past the last entry
    nloops: u32,
    /// Still iterating over entries equal to `key`
    haskey: bool,
    /// Cursor already stands on the successor of a deleted entry
    deleted: bool,
    positioned: bool,
    /// Page splits performed in this transaction
    nsplits: usize,
}

impl TxnDb {
    pub(crate) fn new(db: Database) -> TxnDb {
        TxnDb {
            db,
            root: PAGE_NONE,
            root_dirty: false,
            nodes: Vec::new(),
            index: 0,
            key: 0,
            start: 0,
            nloops: 0,
            haskey: false,
            deleted: false,
            positioned: false,
            nsplits: 0,
        }
    }

    pub(crate) fn reset(&mut self, root: PageNo) {
        self.clear();
        self.root = root;
    }

    pub(crate) fn clear(&mut self) {
        self.root_dirty = false;
        self.nodes.clear();
        self.index = 0;
        self.key = 0;
        self.start = 0;
        self.nloops = 0;
        self.haskey = false;
        self.deleted = false;
        self.positioned = false;
        self.nsplits = 0;
    }
}

impl Transaction {
    fn db_index(&self, db: usize) -> Result<usize> {
        if db >= self.dbs.len() {
            return Err(Error::InvalidConfig("database index out of range"));
        }
        Ok(db)
    }

    fn entry_size(&self, db: usize) -> usize {
        self.dbs[db].db.entry_size()
    }

    /// Root page of database `db` as seen by this transaction.
    pub fn root(&self, db: usize) -> PageNo {
        self.dbs.get(db).map_or(PAGE_NONE, |d| d.root)
    }

    /// Leaf and branch splits performed on `db` since `open`.
    pub fn splits(&self, db: usize) -> usize {
        self.dbs.get(db).map_or(0, |d| d.nsplits)
    }

    /// Entry under the cursor.
    pub fn entry(&self, db: usize) -> Option<&[u8]> {
        let d = self.dbs.get(db)?;
        let node = d.nodes.last()?;
        let buf = mapped(&self.maps, node.no).ok()?;
        if d.deleted || d.index >= nkeys(buf) {
            return None;
        }
        Some(leaf_entry(buf, d.index, d.db.entry_size()))
    }

    /// Key of the entry under the cursor.
    pub fn current_key(&self, db: usize) -> Option<u64> {
        self.entry(db).map(entry_key)
    }

    /// Position the cursor on the newest entry for `key`, or on the entry
    /// that follows it when absent. Returns whether `key` was found.
    pub fn find(&mut self, db: usize, key: u64) -> Result<bool> {
        self.check_open()?;
        let db = self.db_index(db)?;
        self.descend(db, Seek::Key(key))?;
        self.settle(db)?;
        let cur = self.current_key(db);
        let d = &mut self.dbs[db];
        d.key = key;
        d.haskey = true;
        d.deleted = false;
        d.positioned = true;
        d.nloops = 0;
        d.start = cur.unwrap_or(key);
        Ok(cur == Some(key))
    }

    /// Look up `key` and return its newest entry.
    pub fn get(&mut self, db: usize, key: u64) -> Result<Option<&[u8]>> {
        if self.find(db, key)? {
            Ok(self.entry(db))
        } else {
            Ok(None)
        }
    }

    /// Position the cursor on the smallest entry. Returns false when empty.
    pub fn first(&mut self, db: usize) -> Result<bool> {
        self.check_open()?;
        let db = self.db_index(db)?;
        self.descend(db, Seek::First)?;
        let cur = self.current_key(db);
        let d = &mut self.dbs[db];
        d.key = cur.unwrap_or(0);
        d.haskey = false;
        d.deleted = false;
        d.positioned = true;
        d.nloops = 0;
        d.start = d.key;
        Ok(cur.is_some())
    }

    /// Move to the next entry, wrapping from the last entry to the first.
    ///
    /// Returns true while the new entry still has the key passed to
    /// [`find`](Self::find). The first entry with another key, or a wrap,
    /// ends the match for good.
    pub fn next(&mut self, db: usize) -> Result<bool> {
        self.check_open()?;
        let db = self.db_index(db)?;
        if !self.dbs[db].positioned {
            self.first(db)?;
            return Ok(false);
        }
        if self.dbs[db].nodes.is_empty() {
            self.dbs[db].haskey = false;
            return Ok(false);
        }
        let loops = self.dbs[db].nloops;
        if self.dbs[db].deleted {
            self.dbs[db].deleted = false;
            self.resume(db)?;
        } else {
            self.step(db)?;
        }
        let cur = self.current_key(db);
        let d = &mut self.dbs[db];
        let matched = d.haskey && d.nloops == loops && cur == Some(d.key);
        if !matched {
            d.haskey = false;
        }
        Ok(matched)
    }

    /// True once a traversal has wrapped around to where it started. Also
    /// true for an empty tree.
    pub fn looped(&self, db: usize) -> bool {
        let Some(d) = self.dbs.get(db) else {
            return true;
        };
        match self.current_key(db) {
            None => d.nodes.is_empty(),
            Some(k) => d.nloops > 1 || (d.nloops == 1 && k >= d.start),
        }
    }

    /// Build the path for `seek` starting at the root.
    fn descend(&mut self, db: usize, seek: Seek) -> Result<()> {
        self.dbs[db].nodes.clear();
        self.dbs[db].index = 0;
        let root = self.dbs[db].root;
        if root == PAGE_NONE {
            return Ok(());
        }
        self.descend_from(db, root, None, Link::Root, seek)
    }

    fn descend_from(&mut self, db: usize, mut no: PageNo, mut parent: Option<usize>, mut link: Link, seek: Seek) -> Result<()> {
        let esize = self.entry_size(db);
        loop {
            self.load(no)?;
            let dirty = self.fresh.contains(&no);
            let d = &mut self.dbs[db];
            d.nodes.push(Node { no, parent, link, dirty });
            let at = d.nodes.len() - 1;
            let buf = mapped(&self.maps, no)?;
            match page_type(buf) {
                Some(PageType::Branch) => {
                    let slot = match seek {
                        Seek::Key(key) => branch_search(buf, key),
                        Seek::First => 0,
                    };
                    parent = Some(at);
                    link = Link::Child(slot);
                    no = branch_child(buf, slot);
                }
                Some(PageType::Leaf) => {
                    d.index = match seek {
                        Seek::Key(key) => leaf_search(buf, key, esize),
                        Seek::First => 0,
                    };
                    return Ok(());
                }
                other => {
                    return Err(Error::corrupted(no, format!("unexpected {:?} page in tree", other)));
                }
            }
        }
    }

    /// Move off a slot past the end of a leaf onto the next real entry.
    fn settle(&mut self, db: usize) -> Result<()> {
        let Some(node) = self.dbs[db].nodes.last() else {
            return Ok(());
        };
        if self.dbs[db].index >= nkeys(mapped(&self.maps, node.no)?) {
            self.next_leaf(db)?;
        }
        Ok(())
    }

    /// Advance one entry, following overflow chains.
    fn step(&mut self, db: usize) -> Result<()> {
        if self.dbs[db].nodes.is_empty() {
            return Ok(());
        }
        self.dbs[db].index += 1;
        self.resume(db)
    }

    /// From a slot past the end of the current page, move into the overflow
    /// page chained to it, or else to the following leaf.
    fn resume(&mut self, db: usize) -> Result<()> {
        let Some(&node) = self.dbs[db].nodes.last() else {
            return Ok(());
        };
        let buf = mapped(&self.maps, node.no)?;
        if self.dbs[db].index < nkeys(buf) {
            return Ok(());
        }
        let next = overflow(buf);
        if next == PAGE_NONE {
            return self.next_leaf(db);
        }
        self.push_overflow_node(db, next)
    }

    fn push_overflow_node(&mut self, db: usize, no: PageNo) -> Result<()> {
        self.load(no)?;
        let dirty = self.fresh.contains(&no);
        let d = &mut self.dbs[db];
        let parent = Some(d.nodes.len() - 1);
        d.nodes.push(Node {
            no,
            parent,
            link: Link::Overflow,
            dirty,
        });
        d.index = 0;
        Ok(())
    }

    /// Move to the first entry of the following leaf, skipping any
    /// overflow chain. Past the last leaf the cursor wraps to the first.
    fn next_leaf(&mut self, db: usize) -> Result<()> {
        loop {
            let d = &mut self.dbs[db];
            while d.nodes.last().map(|n| n.link) == Some(Link::Overflow) {
                d.nodes.pop();
            }
            let Some(node) = d.nodes.pop() else {
                return Ok(());
            };
            match (node.link, node.parent) {
                (Link::Child(slot), Some(p)) => {
                    let pno = d.nodes[p].no;
                    let buf = mapped(&self.maps, pno)?;
                    if slot < nkeys(buf) {
                        let child = branch_child(buf, slot + 1);
                        return self.descend_from(db, child, Some(p), Link::Child(slot + 1), Seek::First);
                    }
                }
                _ => {
                    d.nloops += 1;
                    let root = d.root;
                    d.index = 0;
                    return self.descend_from(db, root, None, Link::Root, Seek::First);
                }
            }
        }
    }

    /// Make node `i` of the path and all its ancestors writable.
    fn writable(&mut self, db: usize, i: usize) -> Result<()> {
        let node = self.dbs[db].nodes[i];
        if node.dirty {
            return Ok(());
        }
        if let Some(p) = node.parent {
            self.writable(db, p)?;
        }
        let new = self.clone_page(node.no)?;
        match (node.link, node.parent) {
            (Link::Child(slot), Some(p)) => {
                let pno = self.dbs[db].nodes[p].no;
                set_branch_child(mapped_mut(&mut self.maps, pno)?, slot, new);
            }
            (Link::Overflow, Some(p)) => {
                let pno = self.dbs[db].nodes[p].no;
                set_overflow(mapped_mut(&mut self.maps, pno)?, new);
            }
            _ => self.set_root(db, new),
        }
        let n = &mut self.dbs[db].nodes[i];
        n.no = new;
        n.dirty = true;
        Ok(())
    }

    fn set_root(&mut self, db: usize, no: PageNo) {
        let d = &mut self.dbs[db];
        d.root = no;
        d.root_dirty = true;
    }

    /// Insert `entry`, or overwrite the entry with the same key when
    /// `replace` is set and one exists. The cursor ends on the new entry.
    pub fn set(&mut self, db: usize, entry: &[u8], replace: bool) -> Result<()> {
        self.check_writable()?;
        let db = self.db_index(db)?;
        let esize = self.entry_size(db);
        if entry.len() != esize {
            return Err(Error::BadValSize {
                expected: esize,
                actual: entry.len(),
            });
        }
        let rc = self.set_entry(db, entry, replace);
        self.fail(rc)
    }

    fn set_entry(&mut self, db: usize, entry: &[u8], replace: bool) -> Result<()> {
        let key = entry_key(entry);
        let esize = self.entry_size(db);
        if replace {
            // Prefer the exact entry under the cursor, then the newest one.
            if self.current_key(db) != Some(key) {
                self.descend(db, Seek::Key(key))?;
                self.reposition(db, key);
            }
            if self.current_key(db) == Some(key) {
                let i = self.dbs[db].nodes.len() - 1;
                self.writable(db, i)?;
                let (no, index) = (self.dbs[db].nodes[i].no, self.dbs[db].index);
                let off = entry_off(index, esize);
                mapped_mut(&mut self.maps, no)?[off..off + esize].copy_from_slice(entry);
                return Ok(());
            }
        }
        self.insert(db, entry, key)?;
        self.descend(db, Seek::Key(key))?;
        self.reposition(db, key);
        Ok(())
    }

    /// Start a fresh traversal at the newest entry for `key`.
    fn reposition(&mut self, db: usize, key: u64) {
        let d = &mut self.dbs[db];
        d.key = key;
        d.start = key;
        d.nloops = 0;
        d.haskey = true;
        d.deleted = false;
        d.positioned = true;
    }

    fn insert(&mut self, db: usize, entry: &[u8], key: u64) -> Result<()> {
        self.descend(db, Seek::Key(key))?;
        let esize = self.entry_size(db);
        let order = leaf_order(self.page_size(), esize);

        if self.dbs[db].nodes.is_empty() {
            let no = self.take_page(PageType::Leaf)?;
            write_entries(mapped_mut(&mut self.maps, no)?, entry, esize);
            self.set_root(db, no);
            return Ok(());
        }

        let li = self.dbs[db].nodes.len() - 1;
        self.writable(db, li)?;
        let leaf = self.dbs[db].nodes[li].no;
        let idx = self.dbs[db].index;
        let buf = mapped(&self.maps, leaf)?;
        let (n, chain, run) = (nkeys(buf), overflow(buf), leaf_key(buf, 0, esize));
        let data = buf[TREE_HEADER_SIZE..TREE_HEADER_SIZE + n * esize].to_vec();

        if chain != PAGE_NONE {
            // The leaf holds a single key whose older entries overflow.
            if key == run && n < order {
                insert_entry(mapped_mut(&mut self.maps, leaf)?, 0, n, entry, esize);
                return Ok(());
            }
            if key == run {
                self.push_overflow(leaf, &data, chain, entry, esize)?;
                return Ok(());
            }
            let sib = self.take_page(PageType::Leaf)?;
            let sep = if key > run {
                write_entries(mapped_mut(&mut self.maps, sib)?, entry, esize);
                key
            } else {
                let sbuf = mapped_mut(&mut self.maps, sib)?;
                write_entries(sbuf, &data, esize);
                set_overflow(sbuf, chain);
                let lbuf = mapped_mut(&mut self.maps, leaf)?;
                write_entries(lbuf, entry, esize);
                set_overflow(lbuf, PAGE_NONE);
                run
            };
            self.dbs[db].nsplits += 1;
            return self.branch_insert(db, li, sep, sib);
        }

        if n < order {
            insert_entry(mapped_mut(&mut self.maps, leaf)?, idx, n, entry, esize);
            return Ok(());
        }

        let mut all = Vec::with_capacity((n + 1) * esize);
        all.extend_from_slice(&data[..idx * esize]);
        all.extend_from_slice(entry);
        all.extend_from_slice(&data[idx * esize..]);
        match split_point(&all, n + 1, esize) {
            Some(s) => {
                let sib = self.take_page(PageType::Leaf)?;
                write_entries(mapped_mut(&mut self.maps, leaf)?, &all[..s * esize], esize);
                write_entries(mapped_mut(&mut self.maps, sib)?, &all[s * esize..], esize);
                self.dbs[db].nsplits += 1;
                let sep = get_u64(&all, s * esize);
                self.branch_insert(db, li, sep, sib)
            }
            None => self.push_overflow(leaf, &data, PAGE_NONE, entry, esize),
        }
    }

    /// Move the entries of a full single-key leaf into a new overflow page
    /// chained in front of `chain`, leaving only `entry` in the leaf.
    fn push_overflow(&mut self, leaf: PageNo, data: &[u8], chain: PageNo, entry: &[u8], esize: usize) -> Result<()> {
        let ovf = self.take_page(PageType::Overflow)?;
        let obuf = mapped_mut(&mut self.maps, ovf)?;
        write_entries(obuf, data, esize);
        set_overflow(obuf, chain);
        let lbuf = mapped_mut(&mut self.maps, leaf)?;
        write_entries(lbuf, entry, esize);
        set_overflow(lbuf, ovf);
        Ok(())
    }

    /// Add separator `sep` and right sibling `right` after path node `ci`.
    fn branch_insert(&mut self, db: usize, ci: usize, sep: u64, right: PageNo) -> Result<()> {
        let node = self.dbs[db].nodes[ci];
        let (p, slot) = match (node.parent, node.link) {
            (None, _) => {
                let root = self.take_page(PageType::Branch)?;
                write_branch(mapped_mut(&mut self.maps, root)?, &[sep], &[node.no, right]);
                self.set_root(db, root);
                return Ok(());
            }
            (Some(p), Link::Child(slot)) => (p, slot),
            (Some(_), _) => return Err(Error::corrupted(node.no, "split of an overflow page")),
        };
        self.writable(db, p)?;
        let pno = self.dbs[db].nodes[p].no;
        let (mut keys, mut children) = read_branch(mapped(&self.maps, pno)?);
        keys.insert(slot, sep);
        children.insert(slot + 1, right);
        if keys.len() < branch_order(self.page_size()) {
            write_branch(mapped_mut(&mut self.maps, pno)?, &keys, &children);
            return Ok(());
        }

        // Left keeps the first half of the children; the key between the
        // halves moves up.
        let lc = children.len().div_ceil(2);
        let promoted = keys[lc - 1];
        let sib = self.take_page(PageType::Branch)?;
        write_branch(mapped_mut(&mut self.maps, pno)?, &keys[..lc - 1], &children[..lc]);
        write_branch(mapped_mut(&mut self.maps, sib)?, &keys[lc..], &children[lc..]);
        self.dbs[db].nsplits += 1;
        self.branch_insert(db, p, promoted, sib)
    }

    /// Remove the entry under the cursor. The cursor moves to the entry
    /// that followed it; the next [`next`](Self::next) returns that entry.
    pub fn del(&mut self, db: usize) -> Result<()> {
        self.check_writable()?;
        let db = self.db_index(db)?;
        let Some(key) = self.current_key(db) else {
            return Err(Error::NotFound);
        };
        let rc = self.remove_entry(db, key);
        self.fail(rc)
    }

    fn remove_entry(&mut self, db: usize, key: u64) -> Result<()> {
        let esize = self.entry_size(db);
        let ci = self.dbs[db].nodes.len() - 1;
        self.writable(db, ci)?;
        let node = self.dbs[db].nodes[ci];
        let idx = self.dbs[db].index;

        let buf = mapped_mut(&mut self.maps, node.no)?;
        let n = nkeys(buf);
        buf.copy_within(entry_off(idx + 1, esize)..entry_off(n, esize), entry_off(idx, esize));
        set_nkeys(buf, n - 1);
        let chain = overflow(buf);
        self.dbs[db].deleted = true;

        // While the page survives, the successor already sits at `idx`, or
        // past the end when it lives on the next page.
        if n > 1 {
            return Ok(());
        }
        match (node.link, node.parent) {
            (Link::Overflow, Some(p)) => {
                let pno = self.dbs[db].nodes[p].no;
                set_overflow(mapped_mut(&mut self.maps, pno)?, chain);
                self.retire(node.no);
                self.dbs[db].nodes.pop();
                if chain != PAGE_NONE {
                    return self.push_overflow_node(db, chain);
                }
                let pn = nkeys(mapped(&self.maps, pno)?);
                self.dbs[db].index = pn;
                Ok(())
            }
            _ if chain != PAGE_NONE => {
                // Pull the first overflow page up into the emptied leaf.
                self.load(chain)?;
                let obuf = mapped(&self.maps, chain)?;
                let on = nkeys(obuf);
                let data = obuf[TREE_HEADER_SIZE..TREE_HEADER_SIZE + on * esize].to_vec();
                let after = overflow(obuf);
                let lbuf = mapped_mut(&mut self.maps, node.no)?;
                write_entries(lbuf, &data, esize);
                set_overflow(lbuf, after);
                self.retire(chain);
                Ok(())
            }
            _ => {
                // The leaf is gone: find its successor from the root.
                self.remove_node(db, ci)?;
                self.collapse_root(db)?;
                self.descend(db, Seek::Key(key))?;
                let loops = self.dbs[db].nloops;
                self.settle(db)?;
                let d = &mut self.dbs[db];
                if d.nloops != loops {
                    d.haskey = false;
                }
                Ok(())
            }
        }
    }

    /// Unlink path node `i` from its parent, removing parents left empty.
    fn remove_node(&mut self, db: usize, i: usize) -> Result<()> {
        let node = self.dbs[db].nodes[i];
        self.retire(node.no);
        let (p, slot) = match (node.parent, node.link) {
            (Some(p), Link::Child(slot)) => (p, slot),
            _ => {
                self.set_root(db, PAGE_NONE);
                return Ok(());
            }
        };
        let pno = self.dbs[db].nodes[p].no;
        let (mut keys, mut children) = read_branch(mapped(&self.maps, pno)?);
        if keys.is_empty() {
            return self.remove_node(db, p);
        }
        children.remove(slot);
        keys.remove(slot.saturating_sub(1));
        write_branch(mapped_mut(&mut self.maps, pno)?, &keys, &children);
        Ok(())
    }

    /// Replace a root branch with a single child by that child.
    fn collapse_root(&mut self, db: usize) -> Result<()> {
        loop {
            let root = self.dbs[db].root;
            if root == PAGE_NONE {
                return Ok(());
            }
            self.load(root)?;
            let buf = mapped(&self.maps, root)?;
            if page_type(buf) != Some(PageType::Branch) || nkeys(buf) > 0 {
                return Ok(());
            }
            let child = branch_child(buf, 0);
            self.retire(root);
            self.set_root(db, child);
        }
    }

    /// Verify the tree of `db` as this transaction sees it.
    pub fn verify(&self, db: usize) -> Result<Stat> {
        let db = self.db_index(db)?;
        bpt::verify(self.ctx.alloc(), self.dbs[db].root, self.entry_size(db))
    }

    /// Print the tree of `db` as this transaction sees it.
    pub fn print<W, F>(&self, db: usize, out: &mut W, fmt: F) -> Result<()>
    where
        W: Write,
        F: Fn(&[u8]) -> String,
    {
        let db = self.db_index(db)?;
        bpt::print(self.ctx.alloc(), self.dbs[db].root, self.entry_size(db), out, fmt)
    }
}

/// Replace the entries of a tree page with `data`.
fn write_entries(buf: &mut [u8], data: &[u8], esize: usize) {
    buf[TREE_HEADER_SIZE..TREE_HEADER_SIZE + data.len()].copy_from_slice(data);
    set_nkeys(buf, data.len() / esize);
}

fn insert_entry(buf: &mut [u8], idx: usize, n: usize, entry: &[u8], esize: usize) {
    buf.copy_within(entry_off(idx, esize)..entry_off(n, esize), entry_off(idx + 1, esize));
    let off = entry_off(idx, esize);
    buf[off..off + esize].copy_from_slice(entry);
    set_nkeys(buf, n + 1);
}
