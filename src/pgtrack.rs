//! Page mapping tracker, compiled with the `page-track` feature.
//!
//! Every [`Page`](crate::page::Page) registers its mapping on creation and
//! removes it on drop. Mapping the same address twice or dropping an
//! unknown mapping is recorded as a fault. Tests call [`check`] once all
//! handles are gone.

use std::collections::HashMap;
use std::sync::Mutex;

use lazy_static::lazy_static;

use crate::types::PageNo;

#[derive(Default)]
struct Registry {
    live: HashMap<usize, (PageNo, u32)>,
    faults: Vec<String>,
}

lazy_static! {
    static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry::default());
}

fn with_registry<R>(f: impl FnOnce(&mut Registry) -> R) -> R {
    let mut reg = match REGISTRY.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    f(&mut reg)
}

pub(crate) fn track(addr: usize, no: PageNo, count: u32) {
    with_registry(|reg| {
        if let Some((old, n)) = reg.live.insert(addr, (no, count)) {
            reg.faults
                .push(format!("address {:#x} mapped twice (pages {}+{}, {}+{})", addr, old, n, no, count));
        }
    });
}

pub(crate) fn untrack(addr: usize, no: PageNo, count: u32) {
    with_registry(|reg| match reg.live.remove(&addr) {
        Some((n, c)) if n == no && c == count => {}
        Some((n, c)) => reg
            .faults
            .push(format!("unmap of {}+{} found {}+{} at {:#x}", no, count, n, c, addr)),
        None => reg
            .faults
            .push(format!("unmap of untracked pages {}+{} at {:#x}", no, count, addr)),
    });
}

/// Number of live mappings.
pub fn live() -> usize {
    with_registry(|reg| reg.live.len())
}

/// Take the recorded faults, leaving the list empty.
pub fn take_faults() -> Vec<String> {
    with_registry(|reg| std::mem::take(&mut reg.faults))
}

/// Live mappings plus faults; zero once every page handle is dropped.
pub fn check() -> usize {
    with_registry(|reg| {
        for (addr, (no, count)) in &reg.live {
            log::debug!("leaked mapping of pages {}+{} at {:#x}", no, count, addr);
        }
        reg.live.len() + reg.faults.len()
    })
}
