//! # Page-table pages
//!
//! [`PtpIndex`] records, per address space, every physical page backing a
//! page-directory slot. An entry is either *live* (the directory slot points
//! to it and its wire count equals the number of valid entries in it) or
//! *saved* (the slot holds a superpage and the page keeps the pre-promotion
//! entries for a later demotion).
//!
//! Pages leaving an index go to a [`FreeList`] and are only returned to the
//! supplier once every TLB invalidation that could still reference them has
//! completed.

use crate::supplier::PageSupplier;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use kernel_info::memory::{NPTEPG, PAGE_SHIFT, PDRSHIFT};
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};

/// One page-table page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct PageTablePage {
    pub(crate) page: PhysicalPage<Size4K>,
    /// Valid entries in the page. Meaningless in the kernel space, whose
    /// page-table pages are never freed.
    pub(crate) wire_count: u32,
}

impl PageTablePage {
    pub(crate) const fn new(page: PhysicalPage<Size4K>, wire_count: u32) -> Self {
        Self { page, wire_count }
    }
}

/// Directory slot covering `va`.
#[inline]
#[must_use]
pub(crate) const fn pde_index(va: VirtualAddress) -> usize {
    (va.as_u32() >> PDRSHIFT) as usize
}

/// Slot within the page-table page covering `va`.
#[inline]
#[must_use]
pub(crate) const fn pte_index(va: VirtualAddress) -> usize {
    ((va.as_u32() >> PAGE_SHIFT) as usize) & (NPTEPG - 1)
}

/// Page-table pages of one address space, ordered by directory slot.
#[derive(Debug, Default)]
pub(crate) struct PtpIndex {
    pages: BTreeMap<usize, PageTablePage>,
}

impl PtpIndex {
    pub(crate) const fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
        }
    }

    pub(crate) fn lookup(&self, va: VirtualAddress) -> Option<&PageTablePage> {
        self.pages.get(&pde_index(va))
    }

    pub(crate) fn lookup_mut(&mut self, va: VirtualAddress) -> Option<&mut PageTablePage> {
        self.pages.get_mut(&pde_index(va))
    }

    /// # Panics
    /// If the slot already has a page.
    pub(crate) fn insert(&mut self, va: VirtualAddress, ptp: PageTablePage) {
        let prev = self.pages.insert(pde_index(va), ptp);
        assert!(prev.is_none(), "page-table page for {va} already indexed");
    }

    pub(crate) fn remove(&mut self, va: VirtualAddress) -> Option<PageTablePage> {
        self.pages.remove(&pde_index(va))
    }

    /// The live page-table page for `va`, with its wire count bumped.
    ///
    /// # Panics
    /// If `va`'s slot is not indexed.
    pub(crate) fn hold(&mut self, va: VirtualAddress) -> PhysicalPage<Size4K> {
        let Some(ptp) = self.lookup_mut(va) else {
            log::error!("page table for {va} is valid in the directory but not indexed");
            panic!("unindexed page-table page for {va}");
        };
        ptp.wire_count += 1;
        ptp.page
    }

    pub(crate) fn len(&self) -> usize {
        self.pages.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &PageTablePage)> {
        self.pages.iter().map(|(&pdi, ptp)| (pdi, ptp))
    }
}

/// Physical pages waiting for pending invalidations before they go back to
/// the supplier.
#[must_use = "pages on a free list leak unless released"]
#[derive(Debug, Default)]
pub(crate) struct FreeList {
    pages: Vec<PhysicalPage<Size4K>>,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self { pages: Vec::new() }
    }

    pub(crate) fn mark(&mut self, page: PhysicalPage<Size4K>) {
        self.pages.push(page);
    }

    pub(crate) fn pop(&mut self) -> Option<PhysicalPage<Size4K>> {
        self.pages.pop()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Return every page to the supplier. Call only after the invalidations
    /// covering the pages' former mappings have returned.
    pub(crate) fn release(self, supplier: &impl PageSupplier) {
        for page in self.pages {
            match supplier.page(page.base()) {
                Some(m) => {
                    m.set_zeroed(false);
                    supplier.free_page(m);
                }
                None => {
                    log::error!("freed page-table page {page} has no metadata");
                    panic!("page-table page {page} outside managed memory");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    fn page(n: u32) -> PhysicalPage<Size4K> {
        PhysicalPage::from_addr(PhysicalAddress::new(n << 12))
    }

    #[test]
    fn keyed_by_directory_slot() {
        let mut index = PtpIndex::new();
        index.insert(VirtualAddress::new(0x0040_1000), PageTablePage::new(page(7), 1));
        assert!(index.lookup(VirtualAddress::new(0x007F_F000)).is_some());
        assert!(index.lookup(VirtualAddress::new(0x0080_0000)).is_none());
        assert_eq!(index.hold(VirtualAddress::new(0x0040_0000)), page(7));
        assert_eq!(index.lookup(VirtualAddress::new(0x0040_0000)).map(|p| p.wire_count), Some(2));
        assert_eq!(index.iter().map(|(pdi, _)| pdi).collect::<Vec<_>>(), vec![1]);
        assert!(index.remove(VirtualAddress::new(0x0040_0000)).is_some());
        assert!(index.is_empty());
    }

    #[test]
    fn slot_indices_split_the_address() {
        let va = VirtualAddress::new(0xBFBF_E123);
        assert_eq!(pde_index(va), 0x2FE);
        assert_eq!(pte_index(va), 0x3FE);
    }

    #[test]
    #[should_panic(expected = "already indexed")]
    fn double_insert_panics() {
        let mut index = PtpIndex::new();
        index.insert(VirtualAddress::zero(), PageTablePage::new(page(1), 1));
        index.insert(VirtualAddress::new(0x1000), PageTablePage::new(page(2), 1));
    }

    #[test]
    fn free_list_is_lifo() {
        let mut free = FreeList::new();
        free.mark(page(1));
        free.mark(page(2));
        assert_eq!(free.pop(), Some(page(2)));
        assert!(!free.is_empty());
        assert_eq!(free.pop(), Some(page(1)));
        assert!(free.is_empty());
    }
}
