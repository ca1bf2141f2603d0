use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::bpt::{init_node, set_node_xid};
use crate::constants::{
    Flags, PageType, TxnFlags, LOCK_FLAGS, MAX_TXN_MAPS, PAGE_NONE,
};
use crate::cursor::TxnDb;
use crate::env::Context;
use crate::error::{Error, Result};
use crate::lock::LockMode;
use crate::page::{init_page, page_type, Page};
use crate::types::{PageNo, TxnId};

/// Mapped bytes of a page already loaded into `maps`.
pub(crate) fn mapped(maps: &HashMap<PageNo, Page>, no: PageNo) -> Result<&[u8]> {
    maps.get(&no).map(Page::bytes).ok_or(Error::InvalidPageNumber(no))
}

pub(crate) fn mapped_mut(maps: &mut HashMap<PageNo, Page>, no: PageNo) -> Result<&mut [u8]> {
    maps.get_mut(&no).map(Page::bytes_mut).ok_or(Error::InvalidPageNumber(no))
}

/// A coordinated change across the databases of one [`Context`].
///
/// The object is allocated once and then opened, mutated and committed or
/// closed any number of times. A read-write transaction holds the exclusive
/// lock from `open` until `commit`/`close`; a read-only one only holds the
/// shared lock while it takes its snapshot, and then pins that snapshot
/// through its connection slot.
#[derive(Debug)]
pub struct Transaction {
    /// Shared allocator, lock and header state
    pub(crate) ctx: Arc<Context>,
    /// Cursor state per database
    pub(crate) dbs: Vec<TxnDb>,
    /// Pages mapped by this transaction
    pub(crate) maps: HashMap<PageNo, Page>,
    /// Allocated pages not used yet
    pool: Vec<PageNo>,
    /// Every page taken from the allocator
    allocated: Vec<PageNo>,
    /// Pages written by this transaction and still in use
    pub(crate) fresh: HashSet<PageNo>,
    /// Published pages replaced by this transaction
    retired: Vec<PageNo>,
    /// Transaction ID; the snapshot id for readers
    pub(crate) xid: TxnId,
    pub(crate) flags: TxnFlags,
    /// Lock flags of the open call, reused to unlock
    lock_flags: Flags,
    open: bool,
    /// Connection slot, kept between opens
    slot: Option<usize>,
}

impl Transaction {
    /// Create a closed transaction over every database of `ctx`.
    pub fn new(ctx: Arc<Context>) -> Result<Transaction> {
        let dbs = ctx.databases().iter().map(|db| TxnDb::new(*db)).collect();
        Ok(Transaction {
            ctx,
            dbs,
            maps: HashMap::new(),
            pool: Vec::new(),
            allocated: Vec::new(),
            fresh: HashSet::new(),
            retired: Vec::new(),
            xid: 0,
            flags: TxnFlags::empty(),
            lock_flags: Flags::empty(),
            open: false,
            slot: None,
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn id(&self) -> TxnId {
        self.xid
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(TxnFlags::RDONLY)
    }

    /// Pages this transaction has taken from the allocator.
    pub fn page_count(&self) -> usize {
        self.allocated.len()
    }

    /// Open the transaction, read-only with `Flags::RDONLY`.
    ///
    /// NOTLCK, NOFLCK and NOBLOCK select how the lock is taken.
    pub fn open(&mut self, flags: Flags) -> Result<()> {
        if self.open {
            return Err(Error::BadTxn);
        }
        let rdonly = flags.contains(Flags::RDONLY);
        let lock_flags = (flags | self.ctx.config().flags) & LOCK_FLAGS;
        let mode = if rdonly { LockMode::Shared } else { LockMode::Exclusive };
        self.ctx.lock(mode, lock_flags)?;

        let snapshot = self.ctx.xid();
        let slot = match self.ctx.claim_slot(self.slot, snapshot) {
            Ok(slot) => slot,
            Err(err) => {
                self.ctx.lock(LockMode::Unlock, lock_flags)?;
                return Err(err);
            }
        };
        self.slot = Some(slot);
        for db in self.dbs.iter_mut() {
            let root = self.ctx.root(&db.db);
            db.reset(root);
        }
        self.lock_flags = lock_flags;
        if rdonly {
            self.xid = snapshot;
            self.flags = TxnFlags::RDONLY;
            self.ctx.lock(LockMode::Unlock, lock_flags)?;
        } else {
            self.xid = snapshot + 1;
            self.flags = TxnFlags::empty();
        }
        self.open = true;
        log::trace!("opened {} transaction {}", if rdonly { "read" } else { "write" }, self.xid);
        Ok(())
    }

    /// Publish every change and close.
    ///
    /// A failure before the roots are published aborts the transaction
    /// and leaves the published state untouched. With `Flags::RESET` the
    /// buffers are kept for the next `open`.
    pub fn commit(&mut self, flags: Flags) -> Result<()> {
        if !self.open {
            return Err(Error::BadTxn);
        }
        if self.flags.contains(TxnFlags::ERROR) {
            self.close(flags)?;
            return Err(Error::BadTxn);
        }
        if self.is_readonly() || !self.flags.contains(TxnFlags::DIRTY) {
            self.release();
            self.finish(flags);
            return Ok(());
        }

        let sync = (flags | self.ctx.config().flags) & (Flags::NOSYNC | Flags::ASYNC);
        if let Err(err) = self.prepare(sync) {
            if let Err(close_err) = self.close(flags) {
                log::debug!("abort after failed commit of {} failed: {}", self.xid, close_err);
            }
            return Err(err);
        }

        // Single commit point: roots first, then the transaction counter.
        for db in self.dbs.iter_mut().filter(|db| db.root_dirty) {
            self.ctx.set_root(&db.db, db.root);
            db.root_dirty = false;
        }
        self.ctx.set_xid(self.xid);
        log::trace!("committed transaction {}", self.xid);

        let synced = if sync.contains(Flags::NOSYNC) {
            Ok(())
        } else {
            self.ctx.alloc().sync().and_then(|_| self.ctx.alloc().sync_header())
        };
        self.allocated.clear();
        self.release();
        self.finish(flags);
        synced
    }

    /// Everything that can fail before the roots are published.
    fn prepare(&mut self, sync: Flags) -> Result<()> {
        for no in &self.fresh {
            if let Some(page) = self.maps.get(no) {
                page.sync(sync)?;
            }
        }

        let alloc = self.ctx.alloc();
        let mut gc = self.ctx.gc.lock();
        let mut roots = self.ctx.gc_roots();
        let watermark = self.ctx.watermark();
        let run = gc.run(alloc, &mut roots, watermark, self.ctx.config().gc_limit);
        self.ctx.set_gc_roots(roots);
        run?;

        // Unused pool pages were never visible; forget them before freeing
        // so a failure leaks them instead of freeing them twice.
        let pool = std::mem::take(&mut self.pool);
        if !pool.is_empty() {
            let unused: HashSet<PageNo> = pool.iter().copied().collect();
            self.allocated.retain(|no| !unused.contains(no));
            alloc.free(&pool)?;
        }

        // Last fallible step: after this the old pages belong to the GC.
        gc.put(alloc, &mut roots, self.xid, &self.retired)?;
        self.ctx.set_gc_roots(roots);
        Ok(())
    }

    /// Abandon the transaction. Pages it allocated go straight back to the
    /// free list since nothing published them.
    pub fn close(&mut self, flags: Flags) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        let mut rc = Ok(());
        if !self.is_readonly() && !self.allocated.is_empty() {
            rc = self.ctx.alloc().free(&self.allocated);
            log::trace!("aborted transaction {} returning {} pages", self.xid, self.allocated.len());
        }
        self.release();
        self.finish(flags);
        rc
    }

    /// Give back the connection slot and, for writers, the lock.
    fn release(&mut self) {
        if let Some(slot) = self.slot {
            self.ctx.release_slot(slot);
        }
        if !self.is_readonly() {
            if let Err(err) = self.ctx.lock(LockMode::Unlock, self.lock_flags) {
                log::debug!("unlock after transaction {} failed: {}", self.xid, err);
            }
        }
    }

    fn finish(&mut self, flags: Flags) {
        self.open = false;
        self.maps.clear();
        self.pool.clear();
        self.allocated.clear();
        self.fresh.clear();
        self.retired.clear();
        for db in self.dbs.iter_mut() {
            db.clear();
        }
        if !flags.contains(Flags::RESET) {
            self.maps.shrink_to_fit();
            self.pool.shrink_to_fit();
            self.allocated.shrink_to_fit();
            self.fresh.shrink_to_fit();
            self.retired.shrink_to_fit();
            for db in self.dbs.iter_mut() {
                db.nodes.shrink_to_fit();
            }
        }
        self.flags = TxnFlags::empty();
    }

    pub(crate) fn check_open(&self) -> Result<()> {
        if !self.open {
            return Err(Error::BadTxn);
        }
        Ok(())
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.is_readonly() {
            return Err(Error::TxnReadOnly);
        }
        if self.flags.contains(TxnFlags::ERROR) {
            return Err(Error::BadTxn);
        }
        Ok(())
    }

    pub(crate) fn page_size(&self) -> usize {
        self.ctx.alloc().page_size()
    }

    /// Map page `no` into this transaction.
    pub(crate) fn load(&mut self, no: PageNo) -> Result<()> {
        if self.maps.contains_key(&no) {
            return Ok(());
        }
        if self.maps.len() >= MAX_TXN_MAPS {
            self.evict();
        }
        let page = self.ctx.alloc().map(no, 1)?;
        self.maps.insert(no, page);
        Ok(())
    }

    /// Drop mappings no cursor stands on and this transaction did not write.
    fn evict(&mut self) {
        let keep: HashSet<PageNo> = self
            .dbs
            .iter()
            .flat_map(|db| db.nodes.iter().map(|n| n.no))
            .collect();
        let fresh = &self.fresh;
        self.maps.retain(|no, _| keep.contains(no) || fresh.contains(no));
    }

    /// Take a page from the pool, refilling it from the allocator, and
    /// initialize it as an empty tree node.
    pub(crate) fn take_page(&mut self, ty: PageType) -> Result<PageNo> {
        if self.pool.is_empty() {
            let limit = self.ctx.config().max_pages;
            let left = limit.saturating_sub(self.allocated.len());
            if left == 0 {
                return Err(Error::TxnFull { limit });
            }
            let n = self.ctx.alloc().alloc_count().min(left);
            let mut got = Vec::with_capacity(n);
            self.ctx.alloc().alloc(&mut got, n, true)?;
            self.allocated.extend_from_slice(&got);
            got.reverse();
            self.pool = got;
        }
        let no = self.pool.pop().ok_or(Error::TxnFull {
            limit: self.ctx.config().max_pages,
        })?;
        self.fresh.insert(no);
        self.load(no)?;
        let xid = self.xid;
        init_node(mapped_mut(&mut self.maps, no)?, ty, no, xid);
        self.flags |= TxnFlags::DIRTY;
        Ok(no)
    }

    /// Copy page `old` into a fresh page owned by this transaction.
    pub(crate) fn clone_page(&mut self, old: PageNo) -> Result<PageNo> {
        self.load(old)?;
        let copy = mapped(&self.maps, old)?.to_vec();
        let ty = page_type(&copy).ok_or_else(|| Error::corrupted(old, "unknown page type"))?;
        let new = self.take_page(ty)?;
        let xid = self.xid;
        let buf = mapped_mut(&mut self.maps, new)?;
        buf.copy_from_slice(&copy);
        init_page(buf, ty, new);
        set_node_xid(buf, xid);
        self.retire(old);
        Ok(new)
    }

    /// Stop using page `no`. Pages written by this transaction return to
    /// the pool; published pages are handed to the GC at commit.
    pub(crate) fn retire(&mut self, no: PageNo) {
        if no == PAGE_NONE {
            return;
        }
        if self.fresh.remove(&no) {
            self.pool.push(no);
        } else {
            self.retired.push(no);
        }
    }

    /// Record an error; the transaction can only be closed afterwards.
    pub(crate) fn fail<T>(&mut self, rc: Result<T>) -> Result<T> {
        if rc.is_err() {
            self.flags |= TxnFlags::ERROR;
        }
        rc
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.open {
            if let Err(err) = self.close(Flags::empty()) {
                log::debug!("closing transaction {} on drop failed: {}", self.xid, err);
            }
        }
    }
}
