//! Unmanaged kernel mappings and whole-page operations.
//!
//! These entries carry no reverse mapping and take no lock: the caller owns
//! the kernel virtual range it maps into.

use super::Pmap;
use crate::cache::MemAttr;
use crate::platform::Machine;
use crate::pte::PtEntry;
use crate::supplier::{PageSupplier, VmPage};
use core::sync::atomic::Ordering;
use kernel_info::memory::{PAGE_SIZE, is_kernel_address};
use kernel_memory_addresses::{PhysicalAddress, Size4K, Size4M, VirtualAddress};

impl<M: Machine, S: PageSupplier> Pmap<M, S> {
    /// Map the page at `pa` read-write at kernel address `va`, write-back.
    ///
    /// No TLB invalidation is done; the caller must know `va` was unmapped
    /// or invalidate it.
    pub fn kenter(&self, va: VirtualAddress, pa: PhysicalAddress) {
        self.kenter_attr(va, pa, MemAttr::WriteBack);
    }

    /// Like [`kenter`](Self::kenter) with an explicit memory attribute.
    ///
    /// # Panics
    /// If `va` is not a kernel address covered by page tables.
    pub fn kenter_attr(&self, va: VirtualAddress, pa: PhysicalAddress, mode: MemAttr) {
        assert!(is_kernel_address(va), "kenter of non-kernel address {va}");
        let entry = PtEntry::new()
            .with_present(true)
            .with_writable(true)
            .with_global(self.pgeflag)
            .with_page(pa.page())
            .with_cache(self.pat.bits(mode));
        self.kernel_pte(va).store(entry);
    }

    /// Remove the mapping at kernel address `va`, without invalidation.
    pub fn kremove(&self, va: VirtualAddress) {
        self.kernel_pte(va).store(PtEntry::new());
    }

    /// Physical address behind kernel address `va`, either mapping size.
    #[must_use]
    pub fn kextract(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let pde = self.pde(&self.kernel, va).load();
        if !pde.present() {
            return None;
        }
        if pde.superpage() {
            return Some(pde.superpage_frame().join(va.offset::<Size4M>()));
        }
        let pte = self.kernel_pte(va).load();
        pte.present().then_some(pte.phys() + va.offset::<Size4K>())
    }

    /// Map `pages` at consecutive kernel pages from `va`, then invalidate
    /// the range once.
    pub fn qenter(&self, va: VirtualAddress, pages: &[&VmPage]) {
        let mut at = va;
        for m in pages {
            let entry = PtEntry::new()
                .with_present(true)
                .with_writable(true)
                .with_global(self.pgeflag)
                .with_page(m.phys())
                .with_cache(self.pat.bits(m.memattr()));
            self.kernel_pte(at).store(entry);
            at += PAGE_SIZE;
        }
        self.invalidate_range(&self.kernel, va, at);
    }

    /// Undo [`qenter`](Self::qenter) for `count` pages.
    pub fn qremove(&self, va: VirtualAddress, count: usize) {
        let mut at = va;
        for _ in 0..count {
            self.kremove(at);
            at += PAGE_SIZE;
        }
        self.invalidate_range(&self.kernel, va, at);
    }

    /// Fill the page with zeroes through a temporary window.
    pub fn zero_page(&self, m: &VmPage) {
        self.zero_page_area(m, 0, PAGE_SIZE);
    }

    /// Zero `size` bytes of the page from byte `offset`.
    ///
    /// # Panics
    /// If the area is not word-aligned or leaves the page.
    pub fn zero_page_area(&self, m: &VmPage, offset: u32, size: u32) {
        assert!(
            offset.is_multiple_of(4)
                && size.is_multiple_of(4)
                && offset.checked_add(size).is_some_and(|end| end <= PAGE_SIZE),
            "bad zero area {offset:#x}+{size:#x}"
        );
        let (first, last) = ((offset / 4) as usize, ((offset + size) / 4) as usize);
        self.with_windows([(m.phys(), self.pat.bits(m.memattr()))], |[w]| {
            for word in &w.words[first..last] {
                word.store(0, Ordering::Relaxed);
            }
        });
    }

    /// Copy the contents of `src` to `dst`.
    pub fn copy_page(&self, src: &VmPage, dst: &VmPage) {
        let windows = [
            (src.phys(), self.pat.bits(src.memattr())),
            (dst.phys(), self.pat.bits(dst.memattr())),
        ];
        self.with_windows(windows, |[from, to]| {
            for (s, d) in from.words.iter().zip(to.words) {
                d.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::cache::MemAttr;
    use crate::config::PmapConfig;
    use crate::platform::{Access, Machine as _};

    #[test]
    fn kenter_maps_and_kremove_unmaps() {
        let pmap = pmap_with(1, PmapConfig::default());
        let m = page(&pmap);
        let at = pmap.virtual_avail();
        pmap.kenter(at, m.pa());
        poke(&pmap, at + 4, 0x55);
        assert_eq!(pmap.machine().memory().read_u32(m.pa() + 4), 0x55);
        assert_eq!(pmap.kextract(at + 4), Some(m.pa() + 4));
        let pte = pmap.kernel_pte(at).load();
        assert!(pte.global() && !pte.managed() && !pte.user());

        pmap.kremove(at);
        pmap.invalidate_page(pmap.kernel(), at);
        assert!(faults(&pmap, at, Access::Read));
        assert_eq!(pmap.kextract(at), None);
    }

    #[test]
    fn kenter_attr_encodes_the_mode() {
        let pmap = pmap_with(1, PmapConfig::default());
        let m = page(&pmap);
        let at = pmap.virtual_avail();
        pmap.kenter_attr(at, m.pa(), MemAttr::Uncacheable);
        assert_eq!(
            pmap.kernel_pte(at).load().cache(),
            pmap.pat_layout().bits(MemAttr::Uncacheable)
        );
    }

    #[test]
    fn no_global_bit_without_pge() {
        let pmap = pmap_with(1, PmapConfig::default().with_use_global_pages(false));
        let m = page(&pmap);
        pmap.kenter(pmap.virtual_avail(), m.pa());
        assert!(!pmap.kernel_pte(pmap.virtual_avail()).load().global());
    }

    #[test]
    fn qenter_maps_consecutive_pages() {
        let pmap = pmap_with(2, PmapConfig::default());
        let pages = [page(&pmap), page(&pmap), page(&pmap)];
        let at = pmap.virtual_avail();
        pmap.qenter(at, &pages);
        for (i, m) in pages.iter().enumerate() {
            assert_eq!(pmap.kextract(at + i as u32 * 0x1000), Some(m.pa()));
        }
        pmap.qremove(at, pages.len());
        assert!(faults(&pmap, at + 0x2000, Access::Read));
    }

    #[test]
    fn zero_and_copy_pages() {
        let pmap = pmap_with(1, PmapConfig::default());
        let (a, b) = (page(&pmap), page(&pmap));
        let mem = pmap.machine().memory();
        mem.write_u32(a.pa(), 1);
        mem.write_u32(a.pa() + 0xFFC, 2);
        pmap.copy_page(a, b);
        assert_eq!(mem.read_u32(b.pa()), 1);
        assert_eq!(mem.read_u32(b.pa() + 0xFFC), 2);

        pmap.zero_page_area(b, 0x800, 0x800);
        assert_eq!(mem.read_u32(b.pa()), 1);
        assert_eq!(mem.read_u32(b.pa() + 0xFFC), 0);
        pmap.zero_page(a);
        assert_eq!(mem.read_u32(a.pa()), 0);
    }

    #[test]
    #[should_panic(expected = "bad zero area")]
    fn zero_area_must_stay_in_the_page() {
        let pmap = pmap_with(1, PmapConfig::default());
        let m = page(&pmap);
        pmap.zero_page_area(m, 0xFFC, 8);
    }
}
