use crate::supplier::{AllocFlags, PageSupplier, VmPage};
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use kernel_info::memory::NPTEPG;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, Size4M};
use kernel_sync::SpinMutex;

/// Page supplier over the frames of an [`EmulatedMemory`](super::EmulatedMemory).
///
/// Frame 0 is never handed out. Allocation takes the lowest free frame, so
/// the top of memory stays free for [`alloc_superpage`](Self::alloc_superpage).
pub struct EmulatedPages {
    pages: Vec<VmPage>,
    free: SpinMutex<BTreeSet<usize>>,
    fail_next: AtomicU32,
    exhausted: AtomicBool,
}

impl EmulatedPages {
    #[must_use]
    pub fn new(page_count: usize) -> Self {
        Self {
            pages: (0..page_count)
                .map(|i| VmPage::new(PhysicalPage::from_index(i as u32), i))
                .collect(),
            free: SpinMutex::new((1..page_count).collect()),
            fail_next: AtomicU32::new(0),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Make the next `n` allocations fail. Waiting clears nothing; the
    /// failures are simply consumed.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::Release);
    }

    /// While set, every allocation fails and waiting is futile.
    pub fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::Release);
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    #[must_use]
    pub fn is_free(&self, page: PhysicalPage<Size4K>) -> bool {
        self.free.lock().contains(&(page.index() as usize))
    }

    /// Metadata of `page`.
    ///
    /// # Panics
    /// If `page` is outside emulated memory.
    #[must_use]
    pub fn vm_page(&self, page: PhysicalPage<Size4K>) -> &VmPage {
        &self.pages[page.index() as usize]
    }

    /// Allocate an ordinary managed page.
    #[must_use]
    pub fn alloc_managed(&self) -> Option<&VmPage> {
        self.alloc_page(0, AllocFlags::new())
    }

    /// Allocate 1024 physically contiguous managed pages on a 4 MiB
    /// boundary, taken from the top of memory.
    #[must_use]
    pub fn alloc_superpage(&self) -> Option<PhysicalPage<Size4M>> {
        let mut free = self.free.lock();
        let groups = self.pages.len() / NPTEPG;
        let group = (0..groups).rev().find(|g| {
            (g * NPTEPG..(g + 1) * NPTEPG).all(|i| free.contains(&i))
        })?;
        for (offset, i) in (group * NPTEPG..(group + 1) * NPTEPG).enumerate() {
            free.remove(&i);
            self.pages[i].reset(offset as u32, true, false);
        }
        Some(PhysicalPage::from_index(group as u32))
    }

    fn take_failure(&self) -> bool {
        if self.exhausted.load(Ordering::Acquire) {
            return true;
        }
        self.fail_next
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl PageSupplier for EmulatedPages {
    fn alloc_page(&self, pindex: u32, flags: AllocFlags) -> Option<&VmPage> {
        if self.take_failure() {
            return None;
        }
        let index = self.free.lock().pop_first()?;
        let page = &self.pages[index];
        page.reset(pindex, !flags.no_object(), false);
        Some(page)
    }

    fn free_page(&self, page: &VmPage) {
        assert_eq!(page.hold_count(), 0, "freeing held page {}", page.phys());
        let fresh = self.free.lock().insert(page.index());
        assert!(fresh, "double free of {}", page.phys());
    }

    fn page(&self, pa: PhysicalAddress) -> Option<&VmPage> {
        self.pages.get(pa.page::<Size4K>().index() as usize)
    }

    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn phys_end(&self) -> PhysicalAddress {
        PhysicalAddress::new((self.pages.len() as u32) << 12)
    }

    fn wait(&self) -> bool {
        !self.exhausted.load(Ordering::Acquire) && !self.free.lock().is_empty()
    }
}
