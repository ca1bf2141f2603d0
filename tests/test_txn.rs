use lumostore::{EnvConfig, Environment, Error, Flags, KeyEntry, Transaction, KEYS, PAGE_NONE};
use tempfile::TempDir;

fn setup(config: EnvConfig) -> (TempDir, Environment) {
    let dir = TempDir::new().unwrap();
    let env = Environment::open(dir.path().join("index"), config.flags(Flags::CREATE | Flags::NOSYNC)).unwrap();
    (dir, env)
}

fn key(hash: u64, no: u64) -> [u8; 24] {
    KeyEntry {
        hash,
        no,
        count: 1,
        exp: 0,
    }
    .encode()
}

fn no_of(txn: &mut Transaction, hash: u64) -> Option<u64> {
    let e = txn.get(KEYS, hash).unwrap()?;
    KeyEntry::decode(e).map(|k| k.no)
}

fn fill(env: &Environment, range: std::ops::Range<u64>, no: u64) {
    let mut txn = env.begin(Flags::empty()).unwrap();
    for h in range {
        txn.set(KEYS, &key(h, no), true).unwrap();
    }
    txn.commit(Flags::empty()).unwrap();
}

#[test]
fn test_commit_publishes() {
    let (_dir, env) = setup(EnvConfig::new());
    assert_eq!(env.context().xid(), 0);
    fill(&env, 0..100, 1);
    assert_eq!(env.context().xid(), 1);

    let mut txn = env.begin(Flags::RDONLY).unwrap();
    assert_eq!(txn.id(), 1);
    assert_eq!(no_of(&mut txn, 42), Some(1));
    assert!(matches!(txn.set(KEYS, &key(1, 1), false), Err(Error::TxnReadOnly)));
}

#[test]
fn test_commit_releases_slot() {
    let (_dir, env) = setup(EnvConfig::new());
    fill(&env, 0..10, 1);
    fill(&env, 10..20, 2);
    assert!(env.context().conns().is_empty());
    assert_eq!(env.context().watermark(), 3);

    let reader = env.begin(Flags::RDONLY).unwrap();
    assert_eq!(env.context().conns().len(), 1);
    fill(&env, 20..30, 3);
    // Only the reader's snapshot is left behind by the commit.
    assert_eq!(env.context().conns().len(), 1);
    assert_eq!(env.context().watermark(), reader.id());
    drop(reader);
    assert_eq!(env.context().watermark(), 4);
}

#[test]
fn test_close_discards() {
    let (_dir, env) = setup(EnvConfig::new());
    let mut txn = env.begin(Flags::empty()).unwrap();
    for h in 0..1000 {
        txn.set(KEYS, &key(h, 0), false).unwrap();
    }
    let used = txn.page_count();
    assert!(used > 0);
    txn.close(Flags::empty()).unwrap();

    assert_eq!(env.context().xid(), 0);
    assert_eq!(env.context().root(&Environment::KEYS_DB), PAGE_NONE);
    // Every page the transaction took is back on the free list.
    assert_eq!(env.info().unwrap().free_pages, used);
    assert!(env.verify().unwrap().unreferenced.is_empty());
}

#[test]
fn test_commit_without_changes() {
    let (_dir, env) = setup(EnvConfig::new());
    let mut txn = env.begin(Flags::empty()).unwrap();
    assert!(!txn.find(KEYS, 5).unwrap());
    txn.commit(Flags::empty()).unwrap();
    assert_eq!(env.context().xid(), 0);
}

#[test]
fn test_drop_aborts() {
    let (_dir, env) = setup(EnvConfig::new());
    {
        let mut txn = env.begin(Flags::empty()).unwrap();
        txn.set(KEYS, &key(1, 1), false).unwrap();
    }
    // The lock was released by the drop.
    let mut txn = env.begin(Flags::NOBLOCK).unwrap();
    assert_eq!(no_of(&mut txn, 1), None);
}

#[test]
fn test_single_writer() {
    let (_dir, env) = setup(EnvConfig::new());
    let writer = env.begin(Flags::empty()).unwrap();
    let mut other = env.txn().unwrap();
    assert!(matches!(other.open(Flags::NOBLOCK), Err(Error::WouldBlock)));
    assert!(matches!(other.open(Flags::RDONLY | Flags::NOBLOCK), Err(Error::WouldBlock)));
    assert!(!other.is_open());
    drop(writer);
    other.open(Flags::NOBLOCK).unwrap();
}

#[test]
fn test_writer_waits_in_other_thread() {
    let (_dir, env) = setup(EnvConfig::new());
    let mut writer = env.begin(Flags::empty()).unwrap();
    writer.set(KEYS, &key(1, 1), false).unwrap();

    let env2 = env.clone();
    let handle = std::thread::spawn(move || {
        // Blocks until the first writer commits, then sees its change.
        let mut txn = env2.begin(Flags::empty()).unwrap();
        let seen = no_of(&mut txn, 1);
        txn.set(KEYS, &key(2, 2), false).unwrap();
        txn.commit(Flags::empty()).unwrap();
        seen
    });
    std::thread::sleep(std::time::Duration::from_millis(50));
    writer.commit(Flags::empty()).unwrap();
    assert_eq!(handle.join().unwrap(), Some(1));
    assert_eq!(env.context().xid(), 2);
}

#[test]
fn test_reader_snapshot() {
    let (_dir, env) = setup(EnvConfig::new());
    fill(&env, 0..2000, 1);

    let mut reader = env.begin(Flags::RDONLY).unwrap();
    fill(&env, 0..2000, 2);
    fill(&env, 0..2000, 3);
    fill(&env, 2000..2100, 3);

    // The reader still walks the pages of its snapshot.
    for h in (0..2000).step_by(7) {
        assert_eq!(no_of(&mut reader, h), Some(1));
    }
    assert_eq!(no_of(&mut reader, 2050), None);
    assert_eq!(reader.verify(KEYS).unwrap().entries, 2000);
    let info = env.info().unwrap();
    assert_eq!(info.watermark, 1);
    assert!(info.gc_pending > 0);
    reader.close(Flags::empty()).unwrap();

    let mut fresh = env.begin(Flags::RDONLY).unwrap();
    assert_eq!(no_of(&mut fresh, 10), Some(3));
    assert_eq!(no_of(&mut fresh, 2050), Some(3));
}

#[test]
fn test_reader_pins_gc() {
    let (_dir, env) = setup(EnvConfig::new());
    fill(&env, 0..500, 1);
    let reader = env.begin(Flags::RDONLY).unwrap();
    fill(&env, 0..500, 2);
    fill(&env, 0..500, 3);
    let pending = env.info().unwrap().gc_pending;
    assert_eq!(env.checkpoint(Flags::empty()).unwrap(), 0);
    assert_eq!(env.info().unwrap().gc_pending, pending);

    drop(reader);
    assert_eq!(env.checkpoint(Flags::empty()).unwrap(), pending);
    let info = env.info().unwrap();
    assert_eq!(info.gc_pending, 0);
    assert_eq!(info.num_conns, 0);
    assert!(env.verify().unwrap().unreferenced.is_empty());
}

#[test]
fn test_page_budget() {
    let (_dir, env) = setup(EnvConfig::new().max_txn_pages(8));
    let mut txn = env.begin(Flags::empty()).unwrap();
    let mut failed = None;
    for h in 0..10_000 {
        if let Err(err) = txn.set(KEYS, &key(h, 0), false) {
            failed = Some(err);
            break;
        }
    }
    assert!(matches!(failed, Some(Error::TxnFull { limit: 8 })));
    // The transaction is poisoned until closed.
    assert!(matches!(txn.set(KEYS, &key(0, 0), false), Err(Error::BadTxn)));
    assert!(matches!(txn.commit(Flags::empty()), Err(Error::BadTxn)));
    assert!(!txn.is_open());

    assert_eq!(env.context().root(&Environment::KEYS_DB), PAGE_NONE);
    assert_eq!(env.context().xid(), 0);
    assert!(env.verify().unwrap().unreferenced.is_empty());
}

#[test]
fn test_reset_reuses_transaction() {
    let (_dir, env) = setup(EnvConfig::new());
    let mut txn = env.txn().unwrap();
    for round in 0..10u64 {
        txn.open(Flags::empty()).unwrap();
        assert_eq!(txn.id(), round + 1);
        txn.set(KEYS, &key(round, round), false).unwrap();
        txn.commit(Flags::RESET).unwrap();
        assert!(!txn.is_open());
    }
    txn.open(Flags::RDONLY).unwrap();
    for round in 0..10u64 {
        assert_eq!(no_of(&mut txn, round), Some(round));
    }
    txn.close(Flags::RESET).unwrap();
}

#[test]
fn test_bad_state() {
    let (_dir, env) = setup(EnvConfig::new());
    let mut txn = env.txn().unwrap();
    assert!(matches!(txn.find(KEYS, 1), Err(Error::BadTxn)));
    assert!(matches!(txn.commit(Flags::empty()), Err(Error::BadTxn)));
    txn.close(Flags::empty()).unwrap();
    txn.open(Flags::empty()).unwrap();
    assert!(matches!(txn.open(Flags::empty()), Err(Error::BadTxn)));
    assert!(matches!(txn.del(KEYS), Err(Error::NotFound)));
}
