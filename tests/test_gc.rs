use lumostore::{AllocConfig, Flags, Gc, GcRoots, PageAlloc, PageNo, PAGE_NONE};
use tempfile::TempDir;

fn setup() -> (TempDir, PageAlloc) {
    let dir = TempDir::new().unwrap();
    let config = AllocConfig {
        flags: Flags::CREATE | Flags::NOSYNC,
        ..AllocConfig::default()
    };
    let alloc = PageAlloc::open(dir.path().join("gc"), 0, &config).unwrap();
    (dir, alloc)
}

fn pages(alloc: &PageAlloc, n: usize) -> Vec<PageNo> {
    let mut out = Vec::new();
    assert_eq!(alloc.alloc(&mut out, n, true).unwrap(), n);
    out
}

#[test]
fn test_empty_gc() {
    let (_dir, alloc) = setup();
    let mut gc = Gc::new();
    let mut roots = GcRoots::default();
    gc.put(&alloc, &mut roots, 1, &[]).unwrap();
    assert_eq!(roots, GcRoots::EMPTY);
    assert_eq!(gc.run(&alloc, &mut roots, 100, 10).unwrap(), 0);
    assert_eq!(Gc::pending(&alloc, &roots).unwrap(), 0);
}

#[test]
fn test_put_then_run() {
    let (_dir, alloc) = setup();
    let mut gc = Gc::new();
    let mut roots = GcRoots::EMPTY;

    let first = pages(&alloc, 8);
    let second = pages(&alloc, 8);
    gc.put(&alloc, &mut roots, 1, &first).unwrap();
    gc.put(&alloc, &mut roots, 2, &second).unwrap();
    assert_ne!(roots.head, PAGE_NONE);
    assert_eq!(roots.head, roots.tail);
    assert_eq!(Gc::pending(&alloc, &roots).unwrap(), 16);

    assert_eq!(gc.run(&alloc, &mut roots, 1, 10).unwrap(), 0);
    assert_eq!(gc.run(&alloc, &mut roots, 2, 10).unwrap(), 8);
    assert_eq!(Gc::pending(&alloc, &roots).unwrap(), 8);
    assert_eq!(gc.run(&alloc, &mut roots, 3, 10).unwrap(), 8);
    assert_eq!(Gc::pending(&alloc, &roots).unwrap(), 0);
    assert_eq!(alloc.free_count().unwrap(), 16);

    // The emptied tail page is reused for the next generation.
    let tail = roots.tail;
    let third = pages(&alloc, 4);
    gc.put(&alloc, &mut roots, 3, &third).unwrap();
    assert_eq!(roots.tail, tail);
}

#[test]
fn test_watermark_safety() {
    let (_dir, alloc) = setup();
    let mut gc = Gc::new();
    let mut roots = GcRoots::EMPTY;
    let freed = pages(&alloc, 5);
    gc.put(&alloc, &mut roots, 7, &freed).unwrap();

    for watermark in 0..=7 {
        assert_eq!(gc.run(&alloc, &mut roots, watermark, usize::MAX).unwrap(), 0);
    }
    assert_eq!(alloc.free_count().unwrap(), 0);
    assert_eq!(gc.run(&alloc, &mut roots, 8, usize::MAX).unwrap(), 5);

    let mut on_list = Vec::new();
    alloc.walk_free(|no, _| on_list.push(no)).unwrap();
    on_list.sort_unstable();
    assert_eq!(on_list, freed);
}

#[test]
fn test_run_is_fifo() {
    let (_dir, alloc) = setup();
    let mut gc = Gc::new();
    let mut roots = GcRoots::EMPTY;
    gc.put(&alloc, &mut roots, 5, &pages(&alloc, 3)).unwrap();
    gc.put(&alloc, &mut roots, 9, &pages(&alloc, 3)).unwrap();
    gc.put(&alloc, &mut roots, 6, &pages(&alloc, 3)).unwrap();

    // Generation 6 is below the watermark but sits behind the live 9.
    assert_eq!(gc.run(&alloc, &mut roots, 8, usize::MAX).unwrap(), 3);
    assert_eq!(Gc::pending(&alloc, &roots).unwrap(), 6);
    assert_eq!(gc.run(&alloc, &mut roots, 10, usize::MAX).unwrap(), 6);
}

#[test]
fn test_run_limit() {
    let (_dir, alloc) = setup();
    let mut gc = Gc::new();
    let mut roots = GcRoots::EMPTY;
    for xid in 1..=5 {
        gc.put(&alloc, &mut roots, xid, &pages(&alloc, 2)).unwrap();
    }
    assert_eq!(gc.run(&alloc, &mut roots, 100, 2).unwrap(), 4);
    assert_eq!(gc.run(&alloc, &mut roots, 100, 2).unwrap(), 4);
    assert_eq!(gc.run(&alloc, &mut roots, 100, 2).unwrap(), 2);
    assert_eq!(gc.run(&alloc, &mut roots, 100, 2).unwrap(), 0);
}

#[test]
fn test_generation_spanning_pages() {
    let (_dir, alloc) = setup();
    let mut gc = Gc::new();
    let mut roots = GcRoots::EMPTY;
    let freed = pages(&alloc, 3000);
    gc.put(&alloc, &mut roots, 4, &freed).unwrap();
    assert_ne!(roots.head, roots.tail);

    let mut gc_pages = 0;
    Gc::walk(&alloc, &roots, |_, is_gc| gc_pages += is_gc as usize).unwrap();
    assert_eq!(gc_pages, 3);
    assert_eq!(Gc::pending(&alloc, &roots).unwrap(), 3000);

    assert_eq!(gc.run(&alloc, &mut roots, 4, 1).unwrap(), 0);
    // One generation, whatever the number of records it was split into.
    assert_eq!(gc.run(&alloc, &mut roots, 5, 1).unwrap(), 3000);
    assert_eq!(roots.head, roots.tail);
    // Two emptied gc pages went back to the allocator as well.
    assert_eq!(alloc.free_count().unwrap(), 3002);
}

#[test]
fn test_state_survives_fresh_gc() {
    let (_dir, alloc) = setup();
    let mut roots = GcRoots::EMPTY;
    {
        let mut gc = Gc::new();
        gc.put(&alloc, &mut roots, 1, &pages(&alloc, 10)).unwrap();
    }
    // Cached pages are only a shortcut; roots carry the state.
    let mut gc = Gc::new();
    gc.put(&alloc, &mut roots, 2, &pages(&alloc, 10)).unwrap();
    assert_eq!(gc.run(&alloc, &mut roots, 3, usize::MAX).unwrap(), 20);
}
