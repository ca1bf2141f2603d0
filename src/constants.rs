use bitflags::bitflags;

use crate::types::{PageNo, TxnId};

// Behavior flags shared by the lock, allocator and transaction calls
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        /// Open a read-only transaction
        const RDONLY = 0x01;
        /// Skip the thread-level half of the lock
        const NOTLCK = 0x02;
        /// Skip the file-level half of the lock
        const NOFLCK = 0x04;
        /// Fail with `WouldBlock` instead of waiting for a lock
        const NOBLOCK = 0x08;
        /// Never flush pages to disk
        const NOSYNC = 0x10;
        /// Flush pages asynchronously
        const ASYNC = 0x20;
        /// Keep transaction buffers after commit/close
        const RESET = 0x40;
        /// Create the backing file when missing
        const CREATE = 0x80;
    }
}

// Transaction state flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TxnFlags: u32 {
        const RDONLY = 0x01;
        /// An operation failed; the transaction can only be closed
        const ERROR = 0x02;
        /// At least one page was modified
        const DIRTY = 0x04;
    }
}

/// Flags that only affect lock acquisition
pub const LOCK_FLAGS: Flags = Flags::NOTLCK.union(Flags::NOFLCK).union(Flags::NOBLOCK);

/// Page number sentinel for "no page"
pub const PAGE_NONE: PageNo = u32::MAX;
/// Block number sentinel for "no block"
pub const BLOCK_NONE: u64 = u64::MAX;
/// Transaction id used before anything was committed
pub const TXN_NONE: TxnId = 0;

/// Default page size
pub const DEFAULT_PAGE_SIZE: usize = 4096;
pub const MIN_PAGE_SIZE: usize = 4096;
pub const MAX_PAGE_SIZE: usize = 65536;
/// Pages added to the file per growth step
pub const DEFAULT_ALLOC_COUNT: usize = 16;
/// Generations reclaimed by the GC on each commit
pub const DEFAULT_GC_LIMIT: usize = 4;
/// Pages a single transaction may take from the allocator
pub const DEFAULT_TXN_PAGES: usize = 4096;
/// Connection slots stored in an index header
pub const DEFAULT_MAX_CONNS: usize = 64;
/// Page mappings a transaction keeps before dropping idle ones
pub const MAX_TXN_MAPS: usize = 8192;

// Page base header: type u32, no u32
pub const PAGE_TYPE_OFFSET: usize = 0;
pub const PAGE_NO_OFFSET: usize = 4;
pub const PAGE_HEADER_SIZE: usize = 8;

// Allocator header, embedded in page 0 right after the page header
pub const ALLOC_PAGE_SIZE_OFFSET: usize = 8;
pub const ALLOC_COUNT_OFFSET: usize = 12;
pub const ALLOC_FREE_OFFSET: usize = 16;
pub const ALLOC_TAIL_OFFSET: usize = 24;
/// Start of the caller-owned meta region in page 0
pub const META_OFFSET: usize = 32;

// Free-list page: header, next u32, count u32, page numbers
pub const FREE_NEXT_OFFSET: usize = 8;
pub const FREE_COUNT_OFFSET: usize = 12;
pub const FREE_PAGES_OFFSET: usize = 16;

// GC page: header, next u32, head u16, tail u16, remain u16, pad
pub const GC_NEXT_OFFSET: usize = 8;
pub const GC_HEAD_OFFSET: usize = 12;
pub const GC_TAIL_OFFSET: usize = 14;
pub const GC_REMAIN_OFFSET: usize = 16;
pub const GC_DATA_OFFSET: usize = 24;
/// Generation record header: xid u64, count u32
pub const GC_RECORD_HEADER: usize = 12;

// Tree page: header, xid u64, overflow u32, nkeys u16, pad
pub const TREE_XID_OFFSET: usize = 8;
pub const TREE_NEXT_OFFSET: usize = 16;
pub const TREE_NKEYS_OFFSET: usize = 20;
pub const TREE_HEADER_SIZE: usize = 24;
/// Branch slot: child u32 followed by key u64
pub const BRANCH_SLOT_SIZE: usize = 12;
/// Leading key bytes of every tree entry
pub const KEY_SIZE: usize = 8;

// Transaction meta block: xid u64, gc head u32, gc tail u32, nconns u32, pad
pub const TXN_XID_OFFSET: usize = 0;
pub const TXN_GC_HEAD_OFFSET: usize = 8;
pub const TXN_GC_TAIL_OFFSET: usize = 12;
pub const TXN_NCONNS_OFFSET: usize = 16;
pub const TXN_CONNS_OFFSET: usize = 24;
/// Connection slot: pid u32, pad u32, xid u64
pub const CONN_SIZE: usize = 16;

// Index header fields, relative to META_OFFSET
pub const INDEX_MAGIC: [u8; 4] = *b"LMST";
pub const INDEX_ENDIAN: u8 = b'l';
pub const INDEX_MARK: u8 = 0xfc;
pub const INDEX_VERSION: u16 = 1;
pub const INDEX_MAGIC_OFFSET: usize = 0;
pub const INDEX_ENDIAN_OFFSET: usize = 4;
pub const INDEX_MARK_OFFSET: usize = 5;
pub const INDEX_VERSION_OFFSET: usize = 6;
pub const INDEX_FLAGS_OFFSET: usize = 8;
pub const INDEX_KEY_TREE_OFFSET: usize = 12;
pub const INDEX_BLOCK_TREE_OFFSET: usize = 16;
pub const INDEX_SEED_OFFSET: usize = 24;
pub const INDEX_EPOCH_OFFSET: usize = 32;
pub const INDEX_TXN_OFFSET: usize = 40;
pub const INDEX_SLAB_INO_OFFSET: usize = INDEX_TXN_OFFSET + TXN_CONNS_OFFSET + DEFAULT_MAX_CONNS * CONN_SIZE;
pub const INDEX_SLAB_PATH_OFFSET: usize = INDEX_SLAB_INO_OFFSET + 8;
pub const SLAB_PATH_MAX: usize = 1024;
pub const INDEX_META_SIZE: usize = INDEX_SLAB_PATH_OFFSET + SLAB_PATH_MAX;

// Entry sizes of the two index trees
pub const KEY_ENTRY_SIZE: usize = 24;
pub const BLOCK_ENTRY_SIZE: usize = 16;

/// Size of the transaction meta block for `nconns` slots
pub const fn txn_meta_size(nconns: usize) -> usize {
    TXN_CONNS_OFFSET + nconns * CONN_SIZE
}

const fn tag(b: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*b)
}

/// Page kinds, stored as a four-letter tag at the start of every page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PageType {
    Index = tag(b"INDX"),
    FreeHead = tag(b"FREH"),
    FreeChild = tag(b"FREC"),
    Branch = tag(b"BRCH"),
    Leaf = tag(b"LEAF"),
    Overflow = tag(b"OVFL"),
    Gc = tag(b"GCOL"),
}

impl PageType {
    pub fn from_tag(tag: u32) -> Option<PageType> {
        [
            PageType::Index,
            PageType::FreeHead,
            PageType::FreeChild,
            PageType::Branch,
            PageType::Leaf,
            PageType::Overflow,
            PageType::Gc,
        ]
        .into_iter()
        .find(|t| *t as u32 == tag)
    }

    pub fn tag(self) -> u32 {
        self as u32
    }
}
