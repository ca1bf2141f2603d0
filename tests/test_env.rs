use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use lumostore::{BlockEntry, EnvConfig, Environment, Error, Flags, KeyEntry, BLOCKS, KEYS};
use tempfile::TempDir;

fn config() -> EnvConfig {
    EnvConfig::new().flags(Flags::CREATE | Flags::NOSYNC)
}

fn index_path(dir: &TempDir) -> PathBuf {
    dir.path().join("cache.idx")
}

fn patch(path: &PathBuf, off: u64, bytes: &[u8]) {
    let file = OpenOptions::new().write(true).open(path).unwrap();
    file.write_all_at(bytes, off).unwrap();
}

#[test]
fn test_create_and_reopen() {
    let dir = TempDir::new().unwrap();
    let path = index_path(&dir);
    let slab = dir.path().join("cache.slab");
    std::fs::write(&slab, b"").unwrap();

    let (seed, epoch) = {
        let env = Environment::open(&path, config().slab_path(&slab)).unwrap();
        assert!(env.epoch() > 0);
        assert_eq!(env.slab_path(), Some(slab.as_path()));
        assert_ne!(env.slab_ino(), 0);
        assert_eq!(env.meta().version, 1);

        let mut txn = env.begin(Flags::empty()).unwrap();
        for i in 0..300u64 {
            let k = KeyEntry {
                hash: i.wrapping_mul(0x9e37_79b9_7f4a_7c15),
                no: i,
                count: 1,
                exp: 0,
            };
            txn.set(KEYS, &k.encode(), false).unwrap();
            let b = BlockEntry {
                block: i * 4,
                no: i as u32,
                exp: 0,
            };
            txn.set(BLOCKS, &b.encode(), false).unwrap();
        }
        txn.commit(Flags::empty()).unwrap();
        env.sync().unwrap();
        (env.seed(), env.epoch())
    };

    let env = Environment::open(&path, config()).unwrap();
    assert_eq!(env.seed(), seed);
    assert_eq!(env.epoch(), epoch);
    assert_eq!(env.slab_path(), Some(slab.as_path()));
    assert_eq!(env.context().xid(), 1);

    let mut txn = env.begin(Flags::RDONLY).unwrap();
    let hash = 17u64.wrapping_mul(0x9e37_79b9_7f4a_7c15);
    let k = KeyEntry::decode(txn.get(KEYS, hash).unwrap().unwrap()).unwrap();
    assert_eq!(k.no, 17);
    let b = BlockEntry::decode(txn.get(BLOCKS, 68).unwrap().unwrap()).unwrap();
    assert_eq!(b.no, 17);
    assert_eq!(txn.verify(KEYS).unwrap().entries, 300);
    assert_eq!(txn.verify(BLOCKS).unwrap().entries, 300);
}

#[test]
fn test_seeds_differ() {
    let dir = TempDir::new().unwrap();
    let a = Environment::open(dir.path().join("a"), config()).unwrap();
    let b = Environment::open(dir.path().join("b"), config()).unwrap();
    assert_ne!(a.seed(), b.seed());
    assert_eq!(a.slab_path(), None);
}

#[test]
fn test_info() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(index_path(&dir), config()).unwrap();
    let info = env.info().unwrap();
    assert_eq!(info.last_txnid, 0);
    assert_eq!(info.watermark, 1);
    assert_eq!(info.max_conns, 64);
    assert_eq!(info.num_conns, 0);
    assert_eq!(info.alloc.page_size, 4096);
    assert_eq!(info.alloc.tail, 1);

    let reader = env.begin(Flags::RDONLY).unwrap();
    let info = env.info().unwrap();
    assert_eq!(info.num_conns, 1);
    assert_eq!(info.watermark, 0);
    drop(reader);
}

#[test]
fn test_verify_accounts_every_page() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(index_path(&dir), config()).unwrap();
    for round in 0..6u64 {
        let mut txn = env.begin(Flags::empty()).unwrap();
        for i in 0..800u64 {
            let k = KeyEntry {
                hash: i * 31 + round,
                no: round,
                count: 1,
                exp: 0,
            };
            txn.set(KEYS, &k.encode(), false).unwrap();
        }
        // Remove part of what the previous round wrote.
        for i in (0..800u64).step_by(3) {
            if txn.find(KEYS, i * 31 + round.saturating_sub(1)).unwrap() {
                txn.del(KEYS).unwrap();
            }
        }
        txn.commit(Flags::empty()).unwrap();
    }
    let audit = env.verify().unwrap();
    assert!(audit.unreferenced.is_empty(), "leaked {:?}", audit.unreferenced);
    assert!(audit.tree_pages > 0);
    assert!(audit.gc_pages > 0);

    env.checkpoint(Flags::empty()).unwrap();
    let audit = env.verify().unwrap();
    assert!(audit.unreferenced.is_empty());
    let info = env.info().unwrap();
    assert_eq!(info.gc_pending, 0);
    assert_eq!(audit.tree_pages + audit.free_pages + audit.gc_pages + 1, info.alloc.tail as usize);
}

#[test]
fn test_bulk_pages() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(index_path(&dir), config()).unwrap();
    let pages = env.alloc_pages(40).unwrap();
    assert_eq!(pages.len(), 40);
    let mut sorted = pages.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted.len(), 40);
    assert_eq!(env.verify().unwrap().unreferenced, sorted);

    env.free_pages(&pages).unwrap();
    assert_eq!(env.info().unwrap().gc_pending, 40);
    assert!(env.verify().unwrap().unreferenced.is_empty());

    // Not reclaimed until a transaction has committed past the free.
    assert_eq!(env.checkpoint(Flags::empty()).unwrap(), 0);
    let mut txn = env.begin(Flags::empty()).unwrap();
    let k = KeyEntry {
        hash: 1,
        no: 0,
        count: 1,
        exp: 0,
    };
    txn.set(KEYS, &k.encode(), false).unwrap();
    txn.commit(Flags::empty()).unwrap();
    assert_eq!(env.checkpoint(Flags::empty()).unwrap(), 40);
    assert_eq!(env.info().unwrap().gc_pending, 0);
}

#[test]
fn test_reader_check_keeps_live_slots() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(index_path(&dir), config()).unwrap();
    let _reader = env.begin(Flags::RDONLY).unwrap();
    assert_eq!(env.reader_check().unwrap(), 0);
    assert_eq!(env.info().unwrap().num_conns, 1);
}

#[test]
fn test_slots_run_out() {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(index_path(&dir), config()).unwrap();
    let readers: Vec<_> = (0..64).map(|_| env.begin(Flags::RDONLY).unwrap()).collect();
    assert!(matches!(env.begin(Flags::RDONLY), Err(Error::ReadersFull)));
    drop(readers);
    env.begin(Flags::RDONLY).unwrap();
}

#[test]
fn test_rejects_foreign_files() {
    let dir = TempDir::new().unwrap();
    let path = index_path(&dir);
    std::fs::write(&path, vec![0x5a; 8192]).unwrap();
    assert!(matches!(Environment::open(&path, config()), Err(Error::Invalid)));
}

#[test]
fn test_rejects_byte_order_and_version() {
    let dir = TempDir::new().unwrap();
    let path = index_path(&dir);
    drop(Environment::open(&path, config()).unwrap());

    // Header fields start at byte 32 of page 0.
    patch(&path, 32 + 4, b"b");
    assert!(matches!(Environment::open(&path, config()), Err(Error::Incompatible)));
    patch(&path, 32 + 4, b"l");
    patch(&path, 32 + 6, &7u16.to_le_bytes());
    assert!(matches!(
        Environment::open(&path, config()),
        Err(Error::VersionMismatch { found: 7, expected: 1 })
    ));
}

#[test]
fn test_error_codes() {
    let io = Error::Io(std::io::Error::from_raw_os_error(5));
    assert_eq!(io.code(), -5);
    for err in [Error::NotFound, Error::WouldBlock, Error::Invalid, Error::BadTxn, Error::MapFull] {
        assert!(err.code() < 0, "{}", err);
    }
    assert_ne!(Error::NotFound.code(), Error::WouldBlock.code());
}
