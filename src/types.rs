use crate::codec::{get_u32, get_u64, put_u32, put_u64};
use crate::constants::{BLOCK_ENTRY_SIZE, KEY_ENTRY_SIZE};

/// Page number within a backing file
pub type PageNo = u32;
/// Transaction id
pub type TxnId = u64;

/// Shape of one B+tree, as reported by the verifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stat {
    pub psize: u32,
    pub depth: u32,
    pub branch_pages: usize,
    pub leaf_pages: usize,
    pub overflow_pages: usize,
    pub entries: usize,
}

/// Allocator header snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocInfo {
    pub page_size: usize,
    pub alloc_count: usize,
    /// Next never-used page number
    pub tail: PageNo,
    /// File size in pages
    pub end: PageNo,
    pub free_list: PageNo,
}

#[derive(Debug, Clone)]
pub struct EnvInfo {
    pub alloc: AllocInfo,
    pub last_txnid: TxnId,
    pub watermark: TxnId,
    pub max_conns: u32,
    pub num_conns: u32,
    /// Pages parked in the GC waiting for the watermark
    pub gc_pending: usize,
    /// Pages available on the free list
    pub free_pages: usize,
}

/// Page accounting of a whole index file
#[derive(Debug, Clone, Default)]
pub struct PageAudit {
    pub tree_pages: usize,
    pub free_pages: usize,
    pub gc_pages: usize,
    /// Pages below the tail owned by nothing
    pub unreferenced: Vec<PageNo>,
}

/// Entry of the keys tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyEntry {
    pub hash: u64,
    pub no: u64,
    pub count: u32,
    pub exp: u32,
}

impl KeyEntry {
    pub fn encode(&self) -> [u8; KEY_ENTRY_SIZE] {
        let mut buf = [0u8; KEY_ENTRY_SIZE];
        put_u64(&mut buf, 0, self.hash);
        put_u64(&mut buf, 8, self.no);
        put_u32(&mut buf, 16, self.count);
        put_u32(&mut buf, 20, self.exp);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<KeyEntry> {
        if buf.len() < KEY_ENTRY_SIZE {
            return None;
        }
        Some(KeyEntry {
            hash: get_u64(buf, 0),
            no: get_u64(buf, 8),
            count: get_u32(buf, 16),
            exp: get_u32(buf, 20),
        })
    }
}

/// Entry of the blocks tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    pub block: u64,
    pub no: u32,
    pub exp: u32,
}

impl BlockEntry {
    pub fn encode(&self) -> [u8; BLOCK_ENTRY_SIZE] {
        let mut buf = [0u8; BLOCK_ENTRY_SIZE];
        put_u64(&mut buf, 0, self.block);
        put_u32(&mut buf, 8, self.no);
        put_u32(&mut buf, 12, self.exp);
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<BlockEntry> {
        if buf.len() < BLOCK_ENTRY_SIZE {
            return None;
        }
        Some(BlockEntry {
            block: get_u64(buf, 0),
            no: get_u32(buf, 8),
            exp: get_u32(buf, 12),
        })
    }
}
