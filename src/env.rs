use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::alloc::{AllocConfig, PageAlloc};
use crate::bpt;
use crate::constants::{
    txn_meta_size, Flags, BLOCK_ENTRY_SIZE, CONN_SIZE, DEFAULT_ALLOC_COUNT, DEFAULT_GC_LIMIT,
    DEFAULT_MAX_CONNS, DEFAULT_PAGE_SIZE, DEFAULT_TXN_PAGES, INDEX_BLOCK_TREE_OFFSET,
    INDEX_KEY_TREE_OFFSET, INDEX_META_SIZE, KEY_ENTRY_SIZE, INDEX_TXN_OFFSET, LOCK_FLAGS, PAGE_NONE,
    TXN_CONNS_OFFSET, TXN_GC_HEAD_OFFSET, TXN_GC_TAIL_OFFSET, TXN_NCONNS_OFFSET, TXN_XID_OFFSET,
};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::gc::{Gc, GcRoots};
use crate::lock::{Lock, LockMode};
use crate::meta::{self, IndexMeta};
use crate::transaction::Transaction;
use crate::types::{EnvInfo, PageAudit, PageNo, TxnId};

/// Index of the keys tree in an index transaction
pub const KEYS: usize = 0;
/// Index of the blocks tree in an index transaction
pub const BLOCKS: usize = 1;

/// Transaction behavior shared by every transaction of a [`Context`]
#[derive(Debug, Clone)]
pub struct TxnConfig {
    /// Default flags: NOSYNC, ASYNC, NOTLCK, NOFLCK, NOBLOCK
    pub flags: Flags,
    /// GC generations reclaimed per commit
    pub gc_limit: usize,
    /// Pages one transaction may take from the allocator
    pub max_pages: usize,
}

impl Default for TxnConfig {
    fn default() -> Self {
        TxnConfig {
            flags: Flags::empty(),
            gc_limit: DEFAULT_GC_LIMIT,
            max_pages: DEFAULT_TXN_PAGES,
        }
    }
}

/// State shared by all transactions over one backing file: allocator,
/// lock, GC and the transaction block stored in the allocator meta region.
///
/// Transaction block layout, relative to `txn_off`:
///
/// ```text
/// offset  size  field
/// ------  ----  -------------------------------
///      0     8  last committed transaction id
///      8     4  gc head
///     12     4  gc tail
///     16     4  connection slots
///     24  16*n  slots: pid u32, pad u32, xid u64
/// ```
#[derive(Debug)]
pub struct Context {
    alloc: PageAlloc,
    lock: Lock,
    pub(crate) gc: Mutex<Gc>,
    txn_off: usize,
    nconns: usize,
    config: TxnConfig,
    dbs: Vec<Database>,
}

fn getpid() -> u32 {
    // SAFETY: getpid has no preconditions.
    unsafe { libc::getpid() as u32 }
}

impl Context {
    /// Bind `dbs` to the transaction block at `txn_off` of the allocator
    /// meta region, formatting the block on first use.
    pub fn new(alloc: PageAlloc, txn_off: usize, nconns: usize, config: TxnConfig, dbs: &[Database]) -> Result<Context> {
        if txn_off % 8 != 0 || txn_off + txn_meta_size(nconns) > alloc.meta_size() {
            return Err(Error::InvalidConfig("transaction block must be 8-aligned inside the meta region"));
        }
        if nconns == 0 {
            return Err(Error::InvalidConfig("at least one connection slot is required"));
        }
        if config.max_pages == 0 {
            return Err(Error::InvalidConfig("transaction page budget must be positive"));
        }
        for db in dbs {
            db.validate(alloc.page_size(), alloc.meta_size())?;
            let root = db.root_offset();
            if root < txn_off + txn_meta_size(nconns) && root + 4 > txn_off {
                return Err(Error::InvalidConfig("database root overlaps the transaction block"));
            }
        }

        let lock = Lock::new(0, alloc.page_size() as u64);
        let ctx = Context {
            alloc,
            lock,
            gc: Mutex::new(Gc::new()),
            txn_off,
            nconns,
            config,
            dbs: dbs.to_vec(),
        };

        let flags = (ctx.config.flags & LOCK_FLAGS).difference(Flags::NOBLOCK);
        ctx.lock(LockMode::Exclusive, flags)?;
        let rc = ctx.format();
        ctx.lock(LockMode::Unlock, flags)?;
        rc?;
        Ok(ctx)
    }

    fn format(&self) -> Result<()> {
        let stored = u32::from_le(self.u32_at(TXN_NCONNS_OFFSET).load(Ordering::Acquire)) as usize;
        if stored == self.nconns {
            return Ok(());
        }
        if stored != 0 {
            return Err(Error::Invalid);
        }
        self.set_xid(0);
        self.set_gc_roots(GcRoots::EMPTY);
        for slot in 0..self.nconns {
            self.slot_pid(slot).store(0, Ordering::Release);
            self.slot_xid(slot).store(0, Ordering::Release);
        }
        for db in &self.dbs {
            self.set_root(db, PAGE_NONE);
        }
        self.u32_at(TXN_NCONNS_OFFSET)
            .store((self.nconns as u32).to_le(), Ordering::Release);
        self.alloc.sync_header()?;
        log::debug!("formatted transaction block with {} slots", self.nconns);
        Ok(())
    }

    pub fn alloc(&self) -> &PageAlloc {
        &self.alloc
    }

    pub fn config(&self) -> &TxnConfig {
        &self.config
    }

    pub fn databases(&self) -> &[Database] {
        &self.dbs
    }

    pub fn max_conns(&self) -> usize {
        self.nconns
    }

    pub(crate) fn lock(&self, mode: LockMode, flags: Flags) -> Result<()> {
        self.lock.lock(self.alloc.file(), mode, flags)
    }

    /// Run `f` holding the exclusive lock.
    pub(crate) fn exclusive<T>(&self, flags: Flags, f: impl FnOnce(&Context) -> Result<T>) -> Result<T> {
        let flags = (flags | self.config.flags) & LOCK_FLAGS;
        self.lock(LockMode::Exclusive, flags)?;
        let rc = f(self);
        self.lock(LockMode::Unlock, flags)?;
        rc
    }

    /// Run `f` holding the shared lock.
    pub(crate) fn shared<T>(&self, f: impl FnOnce(&Context) -> Result<T>) -> Result<T> {
        let flags = self.config.flags & LOCK_FLAGS;
        self.lock(LockMode::Shared, flags)?;
        let rc = f(self);
        self.lock(LockMode::Unlock, flags)?;
        rc
    }

    fn u32_at(&self, off: usize) -> &AtomicU32 {
        self.alloc.meta_u32(self.txn_off + off)
    }

    fn u64_at(&self, off: usize) -> &AtomicU64 {
        self.alloc.meta_u64(self.txn_off + off)
    }

    fn slot_pid(&self, slot: usize) -> &AtomicU32 {
        self.u32_at(TXN_CONNS_OFFSET + slot * CONN_SIZE)
    }

    fn slot_xid(&self, slot: usize) -> &AtomicU64 {
        self.u64_at(TXN_CONNS_OFFSET + slot * CONN_SIZE + 8)
    }

    /// Last committed transaction id.
    pub fn xid(&self) -> TxnId {
        u64::from_le(self.u64_at(TXN_XID_OFFSET).load(Ordering::Acquire))
    }

    pub(crate) fn set_xid(&self, xid: TxnId) {
        self.u64_at(TXN_XID_OFFSET).store(xid.to_le(), Ordering::Release);
    }

    pub fn gc_roots(&self) -> GcRoots {
        GcRoots {
            head: u32::from_le(self.u32_at(TXN_GC_HEAD_OFFSET).load(Ordering::Acquire)),
            tail: u32::from_le(self.u32_at(TXN_GC_TAIL_OFFSET).load(Ordering::Acquire)),
        }
    }

    pub(crate) fn set_gc_roots(&self, roots: GcRoots) {
        self.u32_at(TXN_GC_HEAD_OFFSET).store(roots.head.to_le(), Ordering::Release);
        self.u32_at(TXN_GC_TAIL_OFFSET).store(roots.tail.to_le(), Ordering::Release);
    }

    /// Published root of `db`.
    pub fn root(&self, db: &Database) -> PageNo {
        u32::from_le(self.alloc.meta_u32(db.root_offset()).load(Ordering::Acquire))
    }

    pub(crate) fn set_root(&self, db: &Database, root: PageNo) {
        self.alloc
            .meta_u32(db.root_offset())
            .store(root.to_le(), Ordering::Release);
    }

    /// Claimed connection slots as `(pid, xid)`.
    pub fn conns(&self) -> Vec<(u32, TxnId)> {
        (0..self.nconns)
            .filter_map(|slot| {
                let pid = u32::from_le(self.slot_pid(slot).load(Ordering::Acquire));
                (pid != 0).then(|| (pid, u64::from_le(self.slot_xid(slot).load(Ordering::Acquire))))
            })
            .collect()
    }

    /// Oldest snapshot any connection may still read; the last committed
    /// xid plus one when no slot is claimed.
    pub fn watermark(&self) -> TxnId {
        self.conns()
            .into_iter()
            .map(|(_, xid)| xid)
            .min()
            .unwrap_or_else(|| self.xid() + 1)
    }

    /// Claim a connection slot for snapshot `xid`, trying `hint` first.
    pub(crate) fn claim_slot(&self, hint: Option<usize>, xid: TxnId) -> Result<usize> {
        let pid = getpid().to_le();
        let order = hint
            .filter(|&slot| slot < self.nconns)
            .into_iter()
            .chain(0..self.nconns);
        for slot in order {
            if self
                .slot_pid(slot)
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.slot_xid(slot).store(xid.to_le(), Ordering::Release);
                return Ok(slot);
            }
        }
        Err(Error::ReadersFull)
    }

    pub(crate) fn release_slot(&self, slot: usize) {
        self.slot_xid(slot).store(0, Ordering::Release);
        self.slot_pid(slot).store(0, Ordering::Release);
    }

    /// Release the slots of processes that no longer exist. Returns how
    /// many were cleared.
    pub fn reader_check(&self) -> usize {
        let me = getpid();
        let mut cleared = 0;
        for slot in 0..self.nconns {
            let pid = u32::from_le(self.slot_pid(slot).load(Ordering::Acquire));
            if pid == 0 || pid == me {
                continue;
            }
            // SAFETY: signal 0 only checks that the process exists.
            let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
            if rc == -1 && std::io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH) {
                log::debug!("releasing slot {} of dead process {}", slot, pid);
                self.release_slot(slot);
                cleared += 1;
            }
        }
        cleared
    }

    /// Reclaim every GC generation below the watermark and flush the
    /// allocator. Returns the number of pages reclaimed.
    pub fn checkpoint(&self, flags: Flags) -> Result<usize> {
        self.exclusive(flags, |ctx| {
            let mut gc = ctx.gc.lock();
            let mut roots = ctx.gc_roots();
            let freed = gc.run(&ctx.alloc, &mut roots, ctx.watermark(), usize::MAX);
            ctx.set_gc_roots(roots);
            let freed = freed?;
            if !(flags | ctx.config.flags).contains(Flags::NOSYNC) {
                ctx.alloc.sync()?;
                ctx.alloc.sync_header()?;
            }
            log::debug!("checkpoint at xid {} reclaimed {} pages", ctx.xid(), freed);
            Ok(freed)
        })
    }
}

/// Options of [`Environment::open`]
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub page_size: usize,
    pub alloc_count: usize,
    pub flags: Flags,
    pub gc_limit: usize,
    pub max_txn_pages: usize,
    pub slab_path: Option<PathBuf>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        EnvConfig {
            page_size: DEFAULT_PAGE_SIZE,
            alloc_count: DEFAULT_ALLOC_COUNT,
            flags: Flags::CREATE,
            gc_limit: DEFAULT_GC_LIMIT,
            max_txn_pages: DEFAULT_TXN_PAGES,
            slab_path: None,
        }
    }
}

impl EnvConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn alloc_count(mut self, alloc_count: usize) -> Self {
        self.alloc_count = alloc_count;
        self
    }

    pub fn flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn gc_limit(mut self, gc_limit: usize) -> Self {
        self.gc_limit = gc_limit;
        self
    }

    pub fn max_txn_pages(mut self, max_txn_pages: usize) -> Self {
        self.max_txn_pages = max_txn_pages;
        self
    }

    pub fn slab_path(mut self, path: impl AsRef<Path>) -> Self {
        self.slab_path = Some(path.as_ref().to_path_buf());
        self
    }
}

/// An index file: the keys and blocks trees over one page allocator
#[derive(Debug, Clone)]
pub struct Environment {
    ctx: Arc<Context>,
    meta: IndexMeta,
}

impl Environment {
    /// Keys tree: `{hash u64, no u64, count u32, exp u32}`
    pub const KEYS_DB: Database = Database::new(INDEX_KEY_TREE_OFFSET, KEY_ENTRY_SIZE);
    /// Blocks tree: `{block u64, no u32, exp u32}`
    pub const BLOCKS_DB: Database = Database::new(INDEX_BLOCK_TREE_OFFSET, BLOCK_ENTRY_SIZE);

    /// Open or create the index file at `path`.
    pub fn open(path: impl AsRef<Path>, config: EnvConfig) -> Result<Environment> {
        let path = path.as_ref();
        let alloc_config = AllocConfig {
            page_size: config.page_size,
            alloc_count: config.alloc_count,
            flags: config.flags & (Flags::CREATE | Flags::NOSYNC | Flags::ASYNC),
        };
        let alloc = PageAlloc::open(path, INDEX_META_SIZE, &alloc_config)?;
        if meta::is_blank(&alloc) {
            let flags = (config.flags & (Flags::NOSYNC | Flags::ASYNC)).bits();
            meta::init(&alloc, flags, config.slab_path.as_deref())?;
            log::debug!("created index {}", path.display());
        } else {
            meta::validate(&alloc)?;
        }

        let txn_config = TxnConfig {
            flags: config.flags & (LOCK_FLAGS | Flags::NOSYNC | Flags::ASYNC),
            gc_limit: config.gc_limit,
            max_pages: config.max_txn_pages,
        };
        let meta = meta::read(&alloc);
        let ctx = Context::new(
            alloc,
            INDEX_TXN_OFFSET,
            DEFAULT_MAX_CONNS,
            txn_config,
            &[Self::KEYS_DB, Self::BLOCKS_DB],
        )?;
        log::debug!("opened index {} at xid {}", path.display(), ctx.xid());
        Ok(Environment {
            ctx: Arc::new(ctx),
            meta,
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn path(&self) -> &Path {
        self.ctx.alloc().path()
    }

    /// A closed transaction over [`KEYS`] and [`BLOCKS`].
    pub fn txn(&self) -> Result<Transaction> {
        Transaction::new(self.ctx.clone())
    }

    /// A transaction opened with `flags`.
    pub fn begin(&self, flags: Flags) -> Result<Transaction> {
        let mut txn = self.txn()?;
        txn.open(flags)?;
        Ok(txn)
    }

    pub fn checkpoint(&self, flags: Flags) -> Result<usize> {
        self.ctx.checkpoint(flags)
    }

    /// Flush the allocator state and the header.
    pub fn sync(&self) -> Result<()> {
        self.ctx.alloc().sync()?;
        self.ctx.alloc().sync_header()
    }

    pub fn info(&self) -> Result<EnvInfo> {
        self.ctx.shared(|ctx| {
            let alloc = ctx.alloc();
            Ok(EnvInfo {
                alloc: alloc.info(),
                last_txnid: ctx.xid(),
                watermark: ctx.watermark(),
                max_conns: ctx.max_conns() as u32,
                num_conns: ctx.conns().len() as u32,
                gc_pending: Gc::pending(alloc, &ctx.gc_roots())?,
                free_pages: alloc.free_count()?,
            })
        })
    }

    /// Check both trees and account for every page below the tail.
    ///
    /// A page owned twice is reported as corruption; pages owned by
    /// nothing are listed in the audit.
    pub fn verify(&self) -> Result<PageAudit> {
        self.ctx.shared(|ctx| {
            let alloc = ctx.alloc();
            let mut seen: HashSet<PageNo> = HashSet::new();
            seen.insert(0);
            let mut audit = PageAudit::default();
            for db in ctx.databases() {
                let before = seen.len();
                bpt::verify_pages(alloc, ctx.root(db), db.entry_size(), &mut seen)?;
                audit.tree_pages += seen.len() - before;
            }

            let mut dup = None;
            alloc.walk_free(|no, _| {
                if !seen.insert(no) {
                    dup.get_or_insert(no);
                }
                audit.free_pages += 1;
            })?;
            if let Some(no) = dup {
                return Err(Error::corrupted(no, "page on the free list is also in use"));
            }
            Gc::walk(alloc, &ctx.gc_roots(), |no, _| {
                if !seen.insert(no) {
                    dup.get_or_insert(no);
                }
                audit.gc_pages += 1;
            })?;
            if let Some(no) = dup {
                return Err(Error::corrupted(no, "page held by the gc is also in use"));
            }

            let tail = alloc.info().tail;
            audit.unreferenced = (1..tail).filter(|no| !seen.contains(no)).collect();
            Ok(audit)
        })
    }

    pub fn reader_check(&self) -> Result<usize> {
        self.ctx.exclusive(Flags::empty(), |ctx| Ok(ctx.reader_check()))
    }

    /// Allocate `n` pages outside the trees, for large objects.
    ///
    /// The tail is tried without locking; the rest is taken under the
    /// exclusive lock.
    pub fn alloc_pages(&self, n: usize) -> Result<Vec<PageNo>> {
        let mut pages = Vec::with_capacity(n);
        let got = self.ctx.alloc().alloc(&mut pages, n, false)?;
        if got < n {
            let rc = self.ctx.exclusive(Flags::empty(), |ctx| ctx.alloc().alloc(&mut pages, n - got, true));
            if let Err(err) = rc {
                if let Err(free_err) = self.ctx.exclusive(Flags::empty(), |ctx| ctx.alloc().free(&pages)) {
                    log::debug!("returning {} pages after failed allocation failed: {}", pages.len(), free_err);
                }
                return Err(err);
            }
        }
        Ok(pages)
    }

    /// Give back pages from [`alloc_pages`](Self::alloc_pages).
    ///
    /// They go through the GC and become reusable once every reader that
    /// predates this call is gone.
    pub fn free_pages(&self, pages: &[PageNo]) -> Result<()> {
        self.ctx.exclusive(Flags::empty(), |ctx| {
            let mut gc = ctx.gc.lock();
            let mut roots = ctx.gc_roots();
            gc.put(ctx.alloc(), &mut roots, ctx.xid() + 1, pages)?;
            ctx.set_gc_roots(roots);
            if !ctx.config().flags.contains(Flags::NOSYNC) {
                ctx.alloc().sync()?;
                ctx.alloc().sync_header()?;
            }
            Ok(())
        })
    }

    pub fn seed(&self) -> u64 {
        self.meta.seed
    }

    pub fn epoch(&self) -> u64 {
        self.meta.epoch
    }

    pub fn slab_path(&self) -> Option<&Path> {
        self.meta.slab_path.as_deref()
    }

    pub fn slab_ino(&self) -> u64 {
        self.meta.slab_ino
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }
}
