//! Embedded page store: a page allocator, a copy-on-write B+tree, a
//! deferred garbage collector and a single-writer transaction manager over
//! memory-mapped files.

pub mod alloc;
pub mod bpt;
mod codec;
pub mod constants;
mod cursor;
pub mod database;
pub mod env;
pub mod error;
pub mod gc;
pub mod lock;
pub mod meta;
pub mod page;
#[cfg(feature = "page-track")]
pub mod pgtrack;
pub mod transaction;
pub mod types;

pub use alloc::{AllocConfig, PageAlloc};
pub use bpt::capacity;
pub use constants::{Flags, PAGE_NONE};
pub use database::Database;
pub use env::{Context, EnvConfig, Environment, TxnConfig, BLOCKS, KEYS};
pub use error::{Error, Result};
pub use gc::{Gc, GcRoots};
pub use lock::{Lock, LockMode};
pub use transaction::Transaction;
pub use types::{BlockEntry, EnvInfo, KeyEntry, PageAudit, PageNo, Stat, TxnId};
