//! Per-CPU temporary mapping windows.
//!
//! Each CPU owns two reserved kernel pages whose page-table entries are
//! rewritten to reach an arbitrary physical page for a short while: zeroing
//! and copying pages, and flushing the cache lines of a page whose memory
//! type changes. A window is only ever valid on the CPU that set it up, so
//! installing one needs a local invalidation and nothing else.

use super::Pmap;
use crate::cache::CacheBits;
use crate::platform::{Access, Machine, Pinned, PhysMemory, TlbRequest};
use crate::pte::{PtEntry, Slot};
use crate::supplier::PageSupplier;
use core::sync::atomic::AtomicU32;
use kernel_info::memory::{NPTEPG, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::SpinMutex;

/// The windows of one CPU.
pub(crate) struct SysMaps {
    lock: SpinMutex<()>,
    cmap: [VirtualAddress; 2],
}

impl SysMaps {
    /// Windows at `base` and the page after it.
    pub(crate) fn new(base: VirtualAddress) -> Self {
        Self {
            lock: SpinMutex::new(()),
            cmap: [base, base + PAGE_SIZE],
        }
    }
}

/// A physical page reachable through a window.
pub(crate) struct Window<'a> {
    pub(crate) va: VirtualAddress,
    pub(crate) words: &'a [AtomicU32; NPTEPG],
}

/// Clears the window entries on every exit path.
struct Unmap<'a, const N: usize> {
    slots: [Slot<'a, PtEntry>; N],
}

impl<const N: usize> Drop for Unmap<'_, N> {
    fn drop(&mut self) {
        for slot in self.slots {
            slot.store(PtEntry::new());
        }
    }
}

impl<M: Machine, S: PageSupplier> Pmap<M, S> {
    /// Map up to two physical pages into the current CPU's windows while `f`
    /// runs. The thread stays pinned for the duration.
    pub(crate) fn with_windows<R, const N: usize>(
        &self,
        pages: [(PhysicalPage<Size4K>, CacheBits); N],
        f: impl FnOnce([Window<'_>; N]) -> R,
    ) -> R {
        const { assert!(N <= 2, "a CPU has two windows") };

        let _pin = Pinned::new(&self.machine);
        let sysmaps = &self.sysmaps[self.machine.current_cpu().index()];
        let _lock = sysmaps.lock.lock();

        let slots: [Slot<'_, PtEntry>; N] =
            core::array::from_fn(|i| self.kernel_pte(sysmaps.cmap[i]));
        for (i, (page, cache)) in pages.into_iter().enumerate() {
            let entry = PtEntry::new()
                .with_present(true)
                .with_writable(true)
                .with_accessed(true)
                .with_dirty(true)
                .with_page(page)
                .with_cache(cache);
            let old = slots[i].swap(entry);
            assert!(old.is_zero(), "window {} busy", sysmaps.cmap[i]);
            self.machine
                .invalidate_local(TlbRequest::Page(sysmaps.cmap[i]));
        }
        let _unmap = Unmap { slots };

        let windows = core::array::from_fn(|i| {
            let va = sysmaps.cmap[i];
            match self.machine.translate(va, Access::Write) {
                Ok(pa) => Window {
                    va,
                    words: self.machine.memory().words(pa.page()),
                },
                Err(fault) => panic!("window unusable: {fault}"),
            }
        });
        f(windows)
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::cache::CacheBits;
    use crate::cpuset::CpuId;
    use core::sync::atomic::Ordering;
    use crate::platform::Machine as _;

    #[test]
    fn window_reaches_the_physical_page() {
        let pmap = pmap_with(2, Default::default());
        let m = pmap.supplier().alloc_managed().unwrap();
        pmap.machine()
            .memory()
            .write_u32(m.pa() + 8, 0xDEAD_BEEF);
        let va = pmap.with_windows([(m.phys(), CacheBits::default())], |[w]| {
            assert_eq!(w.words[2].load(Ordering::Relaxed), 0xDEAD_BEEF);
            w.va
        });
        assert!(pmap.kernel_pte(va).load().is_zero());
    }

    #[test]
    fn each_cpu_has_its_own_windows() {
        let pmap = pmap_with(2, Default::default());
        let m = pmap.supplier().alloc_managed().unwrap();
        let a = pmap.with_windows([(m.phys(), CacheBits::default())], |[w]| w.va);
        let b = pmap.machine().run_on(CpuId::new(1), || {
            pmap.with_windows([(m.phys(), CacheBits::default())], |[w]| w.va)
        });
        assert_ne!(a, b);
    }

    #[test]
    fn window_is_cleared_after_a_panic() {
        let pmap = pmap_with(1, Default::default());
        let m = pmap.supplier().alloc_managed().unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            pmap.with_windows([(m.phys(), CacheBits::default())], |_| panic!("boom"));
        }));
        assert!(result.is_err());
        let va = pmap.with_windows([(m.phys(), CacheBits::default())], |[w]| w.va);
        assert!(pmap.kernel_pte(va).load().is_zero());
    }
}
