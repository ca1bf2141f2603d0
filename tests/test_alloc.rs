use std::sync::atomic::Ordering;

use lumostore::{AllocConfig, Error, Flags, PageAlloc, PAGE_NONE};
use tempfile::TempDir;

fn config(alloc_count: usize) -> AllocConfig {
    AllocConfig {
        alloc_count,
        flags: Flags::CREATE | Flags::NOSYNC,
        ..AllocConfig::default()
    }
}

fn setup(alloc_count: usize) -> (TempDir, PageAlloc) {
    let dir = TempDir::new().unwrap();
    let alloc = PageAlloc::open(dir.path().join("pages"), 0, &config(alloc_count)).unwrap();
    (dir, alloc)
}

#[test]
fn test_fresh_file() {
    let (_dir, alloc) = setup(16);
    let info = alloc.info();
    assert_eq!(info.page_size, 4096);
    assert_eq!(info.tail, 1);
    assert_eq!(info.end, 1);
    assert_eq!(info.free_list, PAGE_NONE);
    assert_eq!(alloc.free_count().unwrap(), 0);
}

#[test]
fn test_alloc_grows_in_batches() {
    let (_dir, alloc) = setup(16);
    let mut pages = Vec::new();
    assert_eq!(alloc.alloc(&mut pages, 2, true).unwrap(), 2);
    assert_eq!(pages, vec![1, 2]);
    let info = alloc.info();
    assert_eq!(info.tail, 3);
    assert_eq!(info.end, 17);
    assert_eq!(alloc.file().metadata().unwrap().len(), 17 * 4096);
}

#[test]
fn test_lock_free_alloc_is_short() {
    let (_dir, alloc) = setup(4);
    let mut pages = Vec::new();
    alloc.alloc(&mut pages, 1, true).unwrap();

    // Only the rest of the current extent is available without exclusive access.
    let mut more = Vec::new();
    assert_eq!(alloc.alloc(&mut more, 10, false).unwrap(), 3);
    assert_eq!(more, vec![2, 3, 4]);
    assert_eq!(alloc.alloc(&mut more, 1, false).unwrap(), 0);

    assert_eq!(alloc.alloc(&mut more, 2, true).unwrap(), 2);
    assert_eq!(&more[3..], &[5, 6]);
    assert_eq!(alloc.info().end, 9);
}

#[test]
fn test_free_list_reuse() {
    let (_dir, alloc) = setup(1);
    let mut pages = Vec::new();
    alloc.alloc(&mut pages, 2, true).unwrap();
    alloc.free(&pages).unwrap();
    assert_eq!(alloc.info().free_list, 1);
    assert_eq!(alloc.free_count().unwrap(), 2);

    // The tail is exhausted, so both pages come back from the free list,
    // the list page itself last.
    let mut again = Vec::new();
    assert_eq!(alloc.alloc(&mut again, 2, true).unwrap(), 2);
    assert_eq!(again, vec![2, 1]);
    assert_eq!(alloc.info().free_list, PAGE_NONE);
    assert_eq!(alloc.info().tail, 3);
}

#[test]
fn test_free_spans_several_list_pages() {
    let (_dir, alloc) = setup(64);
    let per_page = (4096 - 16) / 4;
    let mut pages = Vec::new();
    alloc.alloc(&mut pages, per_page * 2 + 10, true).unwrap();
    alloc.free(&pages).unwrap();
    assert_eq!(alloc.free_count().unwrap(), pages.len());

    let mut list_pages = 0;
    alloc.walk_free(|_, is_list| list_pages += is_list as usize).unwrap();
    assert_eq!(list_pages, 3);
}

#[test]
fn test_free_rejects_bad_pages() {
    let (_dir, alloc) = setup(16);
    let mut pages = Vec::new();
    alloc.alloc(&mut pages, 1, true).unwrap();
    assert!(matches!(alloc.free(&[0]), Err(Error::InvalidPageNumber(0))));
    assert!(matches!(alloc.free(&[1, 500]), Err(Error::InvalidPageNumber(500))));
    // Nothing was freed by the failed calls.
    assert_eq!(alloc.free_count().unwrap(), 0);
}

#[test]
fn test_reopen_keeps_state() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("pages");
    let (info, free) = {
        let alloc = PageAlloc::open(&path, 0, &config(8)).unwrap();
        let mut pages = Vec::new();
        alloc.alloc(&mut pages, 20, true).unwrap();
        alloc.free(&pages[5..12]).unwrap();
        alloc.sync().unwrap();
        (alloc.info(), alloc.free_count().unwrap())
    };

    // A different page size is ignored for an existing file.
    let cfg = AllocConfig {
        page_size: 8192,
        ..config(8)
    };
    let alloc = PageAlloc::open(&path, 0, &cfg).unwrap();
    assert_eq!(alloc.info(), info);
    assert_eq!(alloc.page_size(), 4096);
    assert_eq!(alloc.free_count().unwrap(), free);
}

#[test]
fn test_invalid_config() {
    let dir = TempDir::new().unwrap();
    let cfg = AllocConfig {
        page_size: 1000,
        ..config(8)
    };
    assert!(matches!(
        PageAlloc::open(dir.path().join("a"), 0, &cfg),
        Err(Error::InvalidConfig(_))
    ));
    let cfg = config(8);
    assert!(matches!(
        PageAlloc::open(dir.path().join("b"), 4096, &cfg),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_meta_region() {
    let dir = TempDir::new().unwrap();
    let alloc = PageAlloc::open(dir.path().join("pages"), 64, &config(16)).unwrap();
    alloc.write_meta(8, b"hello");
    let mut out = [0u8; 5];
    alloc.read_meta(8, &mut out);
    assert_eq!(&out, b"hello");
    alloc.meta_u64(16).store(42u64.to_le(), Ordering::Release);
    assert_eq!(u64::from_le(alloc.meta_u64(16).load(Ordering::Acquire)), 42);
}
