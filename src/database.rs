use crate::bpt;
use crate::constants::{KEY_SIZE, TREE_HEADER_SIZE};
use crate::env::Context;
use crate::error::{Error, Result};
use crate::types::{PageNo, Stat};

/// Database handle: where its root lives and how large its entries are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Database {
    /// Offset of the root page number in the allocator meta region
    root_offset: usize,
    /// Bytes per entry, key included
    entry_size: usize,
}

impl Database {
    pub const fn new(root_offset: usize, entry_size: usize) -> Database {
        Database {
            root_offset,
            entry_size,
        }
    }

    pub fn root_offset(&self) -> usize {
        self.root_offset
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Check the handle against a page size and meta region.
    pub(crate) fn validate(&self, page_size: usize, meta_size: usize) -> Result<()> {
        if self.root_offset % 4 != 0 || self.root_offset + 4 > meta_size {
            return Err(Error::InvalidConfig("root offset must be 4-aligned inside the meta region"));
        }
        if self.entry_size < KEY_SIZE || self.entry_size > (page_size - TREE_HEADER_SIZE) / 2 {
            return Err(Error::InvalidConfig("entry size must hold a key and fit twice in a leaf"));
        }
        Ok(())
    }

    /// Published root page.
    pub fn root(&self, ctx: &Context) -> PageNo {
        ctx.root(self)
    }

    /// Verify the published tree.
    pub fn stat(&self, ctx: &Context) -> Result<Stat> {
        bpt::verify(ctx.alloc(), ctx.root(self), self.entry_size)
    }
}
