//! Hybrid thread and file lock.
//!
//! A [`Lock`] pairs a raw reader/writer lock, which orders threads of this
//! process, with an `fcntl` byte-range lock on the backing file, which orders
//! processes. Record locks are owned by the process, so the thread half is
//! what keeps two writers in one process apart, and the shared file lock is
//! taken by the first in-process reader and dropped by the last.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{Mutex, RawRwLock};

use crate::constants::Flags;
use crate::error::{Error, Result};

/// Lock request kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
    Unlock,
}

pub struct Lock {
    rw: RawRwLock,
    /// Holders of the shared file lock in this process
    readers: Mutex<usize>,
    start: i64,
    len: i64,
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("start", &self.start)
            .field("len", &self.len)
            .field("locked", &self.rw.is_locked())
            .field("readers", &*self.readers.lock())
            .finish()
    }
}

impl Lock {
    /// Lock covering `len` bytes of the file from `start`.
    pub fn new(start: u64, len: u64) -> Lock {
        Lock {
            rw: RawRwLock::INIT,
            readers: Mutex::new(0),
            start: start as i64,
            len: len as i64,
        }
    }

    /// Acquire or release the lock.
    ///
    /// `flags` may carry NOTLCK, NOFLCK and NOBLOCK; an unlock must pass the
    /// same NOTLCK/NOFLCK bits as the lock it releases.
    pub fn lock(&self, file: &File, mode: LockMode, flags: Flags) -> Result<()> {
        let thread = !flags.contains(Flags::NOTLCK);
        let process = !flags.contains(Flags::NOFLCK);
        let block = !flags.contains(Flags::NOBLOCK);

        if mode == LockMode::Unlock {
            let rc = if process { self.file_unlock(file) } else { Ok(()) };
            if thread {
                self.thread_unlock();
            }
            return rc;
        }

        if thread {
            self.thread_lock(mode, block)?;
        }
        if process {
            let rc = match mode {
                LockMode::Shared => self.file_share(file, block),
                _ => self.file_lock(file, mode, block),
            };
            if let Err(err) = rc {
                if thread {
                    self.thread_unlock();
                }
                return Err(err);
            }
        }
        Ok(())
    }

    fn thread_lock(&self, mode: LockMode, block: bool) -> Result<()> {
        let acquired = match (mode, block) {
            (LockMode::Shared, true) => {
                self.rw.lock_shared();
                true
            }
            (LockMode::Shared, false) => self.rw.try_lock_shared(),
            (LockMode::Exclusive, true) => {
                self.rw.lock_exclusive();
                true
            }
            (LockMode::Exclusive, false) => self.rw.try_lock_exclusive(),
            (LockMode::Unlock, _) => unreachable!("unlock goes through thread_unlock"),
        };
        if acquired {
            Ok(())
        } else {
            Err(Error::WouldBlock)
        }
    }

    fn thread_unlock(&self) {
        // SAFETY: callers pair every unlock with a successful lock of the
        // same mode; the mode is recovered from the lock state.
        unsafe {
            if self.rw.is_locked_exclusive() {
                self.rw.unlock_exclusive();
            } else if self.rw.is_locked() {
                self.rw.unlock_shared();
            } else {
                panic!("unlock of a lock that is not held");
            }
        }
    }

    /// Join the process's shared file lock, taking it on the first reader.
    fn file_share(&self, file: &File, block: bool) -> Result<()> {
        let mut readers = self.readers.lock();
        if *readers == 0 {
            self.file_lock(file, LockMode::Shared, block)?;
        }
        *readers += 1;
        Ok(())
    }

    /// Release a shared hold, or the exclusive lock when no reader holds one.
    ///
    /// With the thread half disabled the two cannot be told apart, and a
    /// pending shared hold is released first.
    fn file_unlock(&self, file: &File) -> Result<()> {
        let mut readers = self.readers.lock();
        match *readers {
            0 => self.file_lock(file, LockMode::Unlock, true),
            1 => {
                self.file_lock(file, LockMode::Unlock, true)?;
                *readers = 0;
                Ok(())
            }
            _ => {
                *readers -= 1;
                Ok(())
            }
        }
    }

    /// Threads of this process holding the shared file lock.
    pub fn readers(&self) -> usize {
        *self.readers.lock()
    }

    fn file_lock(&self, file: &File, mode: LockMode, block: bool) -> Result<()> {
        // SAFETY: flock is plain old data.
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = match mode {
            LockMode::Shared => libc::F_RDLCK,
            LockMode::Exclusive => libc::F_WRLCK,
            LockMode::Unlock => libc::F_UNLCK,
        } as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = self.start as libc::off_t;
        fl.l_len = self.len as libc::off_t;
        let cmd = if block { libc::F_SETLKW } else { libc::F_SETLK };

        loop {
            // SAFETY: valid descriptor and flock pointer for the call.
            let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &fl as *const libc::flock) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) if !block => return Err(Error::WouldBlock),
                _ => return Err(Error::Io(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> (tempfile::TempDir, File) {
        let dir = tempfile::TempDir::new().unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("lock"))
            .unwrap();
        (dir, file)
    }

    #[test]
    fn test_shared_admits_shared() {
        let (_dir, file) = scratch();
        let lock = Lock::new(0, 4096);
        lock.lock(&file, LockMode::Shared, Flags::empty()).unwrap();
        lock.lock(&file, LockMode::Shared, Flags::NOBLOCK).unwrap();
        let rc = lock.lock(&file, LockMode::Exclusive, Flags::NOBLOCK);
        assert!(matches!(rc, Err(Error::WouldBlock)));
        lock.lock(&file, LockMode::Unlock, Flags::empty()).unwrap();
        lock.lock(&file, LockMode::Unlock, Flags::empty()).unwrap();
        lock.lock(&file, LockMode::Exclusive, Flags::NOBLOCK).unwrap();
        lock.lock(&file, LockMode::Unlock, Flags::empty()).unwrap();
    }

    #[test]
    fn test_exclusive_blocks_threads() {
        let (_dir, file) = scratch();
        let lock = Lock::new(0, 4096);
        lock.lock(&file, LockMode::Exclusive, Flags::empty()).unwrap();
        std::thread::scope(|s| {
            s.spawn(|| {
                let rc = lock.lock(&file, LockMode::Shared, Flags::NOBLOCK);
                assert!(matches!(rc, Err(Error::WouldBlock)));
            });
        });
        lock.lock(&file, LockMode::Unlock, Flags::empty()).unwrap();
    }

    /// Whether another process would be refused a write lock on the range.
    fn foreign_writer_refused(file: &File) -> bool {
        // SAFETY: the child only calls fcntl and _exit.
        unsafe {
            let pid = libc::fork();
            assert!(pid >= 0);
            if pid == 0 {
                let mut fl: libc::flock = std::mem::zeroed();
                fl.l_type = libc::F_WRLCK as libc::c_short;
                fl.l_whence = libc::SEEK_SET as libc::c_short;
                fl.l_start = 0;
                fl.l_len = 4096;
                let rc = libc::fcntl(file.as_raw_fd(), libc::F_GETLK, &mut fl as *mut libc::flock);
                let refused = rc == 0 && fl.l_type != libc::F_UNLCK as libc::c_short;
                libc::_exit(if refused { 1 } else { 0 });
            }
            let mut status = 0;
            assert_eq!(libc::waitpid(pid, &mut status, 0), pid);
            libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 1
        }
    }

    #[test]
    fn test_shared_file_lock_outlives_first_reader() {
        let (_dir, file) = scratch();
        let lock = Lock::new(0, 4096);
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        std::thread::scope(|s| {
            let (other, f) = (&lock, &file);
            s.spawn(move || {
                other.lock(f, LockMode::Shared, Flags::empty()).unwrap();
                held_tx.send(()).unwrap();
                done_rx.recv().unwrap();
                other.lock(f, LockMode::Unlock, Flags::empty()).unwrap();
            });
            held_rx.recv().unwrap();
            lock.lock(&file, LockMode::Shared, Flags::empty()).unwrap();
            assert_eq!(lock.readers(), 2);

            lock.lock(&file, LockMode::Unlock, Flags::empty()).unwrap();
            assert_eq!(lock.readers(), 1);
            assert!(foreign_writer_refused(&file));
            done_tx.send(()).unwrap();
        });
        assert_eq!(lock.readers(), 0);
        assert!(!foreign_writer_refused(&file));
    }

    #[test]
    fn test_exclusive_file_lock_released() {
        let (_dir, file) = scratch();
        let lock = Lock::new(0, 4096);
        lock.lock(&file, LockMode::Exclusive, Flags::empty()).unwrap();
        assert!(foreign_writer_refused(&file));
        assert_eq!(lock.readers(), 0);
        lock.lock(&file, LockMode::Unlock, Flags::empty()).unwrap();
        assert!(!foreign_writer_refused(&file));
    }

    #[test]
    fn test_thread_layer_disabled() {
        let (_dir, file) = scratch();
        let lock = Lock::new(0, 4096);
        let flags = Flags::NOTLCK;
        lock.lock(&file, LockMode::Exclusive, flags).unwrap();
        // Record locks never conflict within one process.
        lock.lock(&file, LockMode::Exclusive, flags | Flags::NOBLOCK).unwrap();
        lock.lock(&file, LockMode::Unlock, flags).unwrap();
    }
}
