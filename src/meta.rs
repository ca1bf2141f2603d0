//! Index file header.
//!
//! Lives in the allocator meta region of page 0, so offsets below are
//! relative to that region:
//!
//! ```text
//! offset  size  field
//! ------  ----  ------------------------------------------
//!      0     4  magic "LMST"
//!      4     1  byte order marker, 'l'
//!      5     1  mark 0xfc
//!      6     2  format version
//!      8     4  flags
//!     12     4  keys tree root
//!     16     4  blocks tree root
//!     24     8  hash seed
//!     32     8  creation time, unix seconds
//!     40     -  transaction block (xid, gc roots, connection slots)
//!      -     8  slab inode
//!      -  1024  slab path, NUL terminated
//! ```

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::alloc::PageAlloc;
use crate::codec::{get_u16, get_u32, get_u64, put_u16, put_u32, put_u64};
use crate::constants::{
    INDEX_BLOCK_TREE_OFFSET, INDEX_ENDIAN, INDEX_ENDIAN_OFFSET, INDEX_EPOCH_OFFSET,
    INDEX_FLAGS_OFFSET, INDEX_KEY_TREE_OFFSET, INDEX_MAGIC, INDEX_MAGIC_OFFSET, INDEX_MARK,
    INDEX_MARK_OFFSET, INDEX_SEED_OFFSET, INDEX_SLAB_INO_OFFSET, INDEX_SLAB_PATH_OFFSET,
    INDEX_TXN_OFFSET, INDEX_VERSION, INDEX_VERSION_OFFSET, PAGE_NONE, SLAB_PATH_MAX,
};
use crate::error::{Error, Result};

/// Decoded index header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexMeta {
    /// Format version
    pub version: u16,
    pub flags: u32,
    /// Random seed chosen when the file was created
    pub seed: u64,
    /// Creation time in seconds since the unix epoch
    pub epoch: u64,
    /// Inode of the slab file when it was attached
    pub slab_ino: u64,
    pub slab_path: Option<PathBuf>,
}

fn fixed(alloc: &PageAlloc) -> [u8; INDEX_TXN_OFFSET] {
    let mut buf = [0u8; INDEX_TXN_OFFSET];
    alloc.read_meta(0, &mut buf);
    buf
}

/// True when no header was ever written.
pub(crate) fn is_blank(alloc: &PageAlloc) -> bool {
    let buf = fixed(alloc);
    buf[..8].iter().all(|&b| b == 0)
}

/// Check magic, byte order and version of an existing header.
pub(crate) fn validate(alloc: &PageAlloc) -> Result<()> {
    let buf = fixed(alloc);
    if buf[INDEX_MAGIC_OFFSET..INDEX_MAGIC_OFFSET + 4] != INDEX_MAGIC || buf[INDEX_MARK_OFFSET] != INDEX_MARK {
        return Err(Error::Invalid);
    }
    if buf[INDEX_ENDIAN_OFFSET] != INDEX_ENDIAN {
        return Err(Error::Incompatible);
    }
    let version = get_u16(&buf, INDEX_VERSION_OFFSET);
    if version != INDEX_VERSION {
        return Err(Error::VersionMismatch {
            found: version,
            expected: INDEX_VERSION,
        });
    }
    Ok(())
}

/// Write a fresh header. The transaction block is set up separately.
pub(crate) fn init(alloc: &PageAlloc, flags: u32, slab: Option<&Path>) -> Result<()> {
    let slab_bytes = slab.map(|p| p.as_os_str().as_bytes()).unwrap_or_default();
    if slab_bytes.len() >= SLAB_PATH_MAX {
        return Err(Error::InvalidConfig("slab path too long"));
    }
    let slab_ino = match slab {
        Some(path) => std::fs::metadata(path).map(|m| m.ino()).unwrap_or(0),
        None => 0,
    };
    let epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut buf = [0u8; INDEX_TXN_OFFSET];
    buf[INDEX_MAGIC_OFFSET..INDEX_MAGIC_OFFSET + 4].copy_from_slice(&INDEX_MAGIC);
    buf[INDEX_ENDIAN_OFFSET] = INDEX_ENDIAN;
    buf[INDEX_MARK_OFFSET] = INDEX_MARK;
    put_u16(&mut buf, INDEX_VERSION_OFFSET, INDEX_VERSION);
    put_u32(&mut buf, INDEX_FLAGS_OFFSET, flags);
    put_u32(&mut buf, INDEX_KEY_TREE_OFFSET, PAGE_NONE);
    put_u32(&mut buf, INDEX_BLOCK_TREE_OFFSET, PAGE_NONE);
    put_u64(&mut buf, INDEX_SEED_OFFSET, rand::random::<u64>());
    put_u64(&mut buf, INDEX_EPOCH_OFFSET, epoch);

    let mut path = [0u8; SLAB_PATH_MAX];
    path[..slab_bytes.len()].copy_from_slice(slab_bytes);
    let mut ino = [0u8; 8];
    put_u64(&mut ino, 0, slab_ino);

    alloc.write_meta(INDEX_SLAB_INO_OFFSET, &ino);
    alloc.write_meta(INDEX_SLAB_PATH_OFFSET, &path);
    // Magic last: a torn create reads back as blank.
    alloc.write_meta(8, &buf[8..]);
    alloc.write_meta(0, &buf[..8]);
    alloc.sync_header()
}

pub fn read(alloc: &PageAlloc) -> IndexMeta {
    let buf = fixed(alloc);
    let mut ino = [0u8; 8];
    alloc.read_meta(INDEX_SLAB_INO_OFFSET, &mut ino);
    let mut path = [0u8; SLAB_PATH_MAX];
    alloc.read_meta(INDEX_SLAB_PATH_OFFSET, &mut path);
    let len = path.iter().position(|&b| b == 0).unwrap_or(SLAB_PATH_MAX);
    IndexMeta {
        version: get_u16(&buf, INDEX_VERSION_OFFSET),
        flags: get_u32(&buf, INDEX_FLAGS_OFFSET),
        seed: get_u64(&buf, INDEX_SEED_OFFSET),
        epoch: get_u64(&buf, INDEX_EPOCH_OFFSET),
        slab_ino: get_u64(&ino, 0),
        slab_path: (len > 0).then(|| Path::new(OsStr::from_bytes(&path[..len])).to_path_buf()),
    }
}
