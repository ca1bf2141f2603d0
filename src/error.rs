use std::io;
use std::result;

use thiserror::Error;

use crate::types::PageNo;

/// Result type for store operations
pub type Result<T> = result::Result<T, Error>;

/// Store error codes
#[derive(Debug, Error)]
pub enum Error {
    /// Map, unmap, sync or file extension failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// No matching entry under the cursor
    #[error("no matching entry found")]
    NotFound,
    /// Lock is held elsewhere and NOBLOCK was requested
    #[error("lock would block")]
    WouldBlock,
    /// Transaction exceeded its page budget and must be closed
    #[error("transaction exceeded its budget of {limit} pages")]
    TxnFull { limit: usize },
    /// Unexpected content found while traversing a page
    #[error("page {page} is corrupted: {reason}")]
    Corrupted { page: PageNo, reason: String },
    /// File is not a valid index
    #[error("file is not a valid index")]
    Invalid,
    #[error("index version {found} is not supported (expected {expected})")]
    VersionMismatch { found: u16, expected: u16 },
    /// Index was written with another byte order
    #[error("index uses an incompatible byte order")]
    Incompatible,
    /// Page number space of the file is exhausted
    #[error("page number space exhausted")]
    MapFull,
    /// All connection slots are claimed
    #[error("all connection slots are in use")]
    ReadersFull,
    /// Transaction is not open, or an earlier operation failed
    #[error("transaction must be closed or is in an invalid state")]
    BadTxn,
    #[error("operation not allowed in a read-only transaction")]
    TxnReadOnly,
    #[error("entry must be {expected} bytes, got {actual}")]
    BadValSize { expected: usize, actual: usize },
    #[error("invalid page number {0}")]
    InvalidPageNumber(PageNo),
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl Error {
    pub(crate) fn corrupted(page: PageNo, reason: impl Into<String>) -> Error {
        Error::Corrupted {
            page,
            reason: reason.into(),
        }
    }

    /// Negated host error code for this error
    pub fn code(&self) -> i32 {
        let errno = match self {
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Error::NotFound => libc::ENOENT,
            Error::WouldBlock => libc::EAGAIN,
            Error::TxnFull { .. } => libc::ENOSPC,
            Error::Corrupted { .. } | Error::Invalid => libc::EILSEQ,
            Error::VersionMismatch { .. } | Error::Incompatible => libc::ENOTSUP,
            Error::MapFull => libc::ENOMEM,
            Error::ReadersFull => libc::EMFILE,
            Error::BadTxn => libc::EINVAL,
            Error::TxnReadOnly => libc::EROFS,
            Error::BadValSize { .. } => libc::EMSGSIZE,
            Error::InvalidPageNumber(_) => libc::EFAULT,
            Error::InvalidConfig(_) => libc::EINVAL,
        };
        -errno
    }
}
