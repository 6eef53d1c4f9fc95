//! Lookups by virtual address, and page-centric queries driven by the
//! reverse-mapping lists.

use super::Pmap;
use crate::address_space::AddressSpace;
use crate::platform::{Machine, Pinned};
use crate::prot::{Mincore, Prot};
use crate::ptp::FreeList;
use crate::pte::{PdEntry, PtEntry};
use crate::pv::{ListKey, PvState};
use crate::supplier::{PageSupplier, VmPage};
use kernel_memory_addresses::{PhysicalAddress, Size4K, Size4M, VirtualAddress};

/// `ts_referenced` stops counting here.
const TS_REFERENCED_MAX: u32 = 5;

/// `page_exists_quick` looks at no more entries than this.
const EXISTS_QUICK_SCAN: usize = 16;

/// The leaf entry translating an address, at either size.
#[derive(Copy, Clone)]
enum Leaf {
    Small(PtEntry),
    Large(PdEntry),
}

impl Leaf {
    fn present(self) -> bool {
        match self {
            Self::Small(pte) => pte.present(),
            Self::Large(pde) => pde.present(),
        }
    }

    fn writable(self) -> bool {
        match self {
            Self::Small(pte) => pte.writable(),
            Self::Large(pde) => pde.writable(),
        }
    }

    fn modified(self) -> bool {
        match self {
            Self::Small(pte) => pte.dirty() && pte.writable(),
            Self::Large(pde) => pde.dirty() && pde.writable(),
        }
    }

    fn accessed(self) -> bool {
        match self {
            Self::Small(pte) => pte.accessed(),
            Self::Large(pde) => pde.accessed(),
        }
    }

    fn wired(self) -> bool {
        match self {
            Self::Small(pte) => pte.wired(),
            Self::Large(pde) => pde.wired(),
        }
    }

    fn managed(self) -> bool {
        match self {
            Self::Small(pte) => pte.managed(),
            Self::Large(pde) => pde.managed(),
        }
    }

    fn phys(self, va: VirtualAddress) -> PhysicalAddress {
        match self {
            Self::Small(pte) => pte.phys() + va.offset::<Size4K>(),
            Self::Large(pde) => pde.superpage_frame().join(va.offset::<Size4M>()),
        }
    }
}

impl<M: Machine, S: PageSupplier> Pmap<M, S> {
    /// The leaf entry for `va`, if a directory entry covers it.
    fn leaf(&self, space: &AddressSpace, va: VirtualAddress) -> Option<Leaf> {
        let pde = self.pde(space, va).load();
        if !pde.present() {
            None
        } else if pde.superpage() {
            Some(Leaf::Large(pde))
        } else {
            self.pte(space, va).map(|slot| Leaf::Small(slot.load()))
        }
    }

    /// Physical address `va` translates to in `space`.
    #[must_use]
    pub fn extract(&self, space: &AddressSpace, va: VirtualAddress) -> Option<PhysicalAddress> {
        let _state = space.state.lock();
        self.leaf(space, va)
            .filter(|leaf| leaf.present())
            .map(|leaf| leaf.phys(va))
    }

    /// The page `va` maps, held against reuse, provided the mapping allows
    /// `prot`. The caller releases it with [`VmPage::unhold`].
    #[must_use]
    pub fn extract_and_hold(&self, space: &AddressSpace, va: VirtualAddress, prot: Prot) -> Option<&VmPage> {
        let _state = space.state.lock();
        let leaf = self.leaf(space, va)?;
        if !leaf.present() || (prot.write() && !leaf.writable()) {
            return None;
        }
        let m = self.supplier.page(leaf.phys(va))?;
        m.hold();
        Some(m)
    }

    /// Whether any mapping of `m` satisfies `test`, 4 KiB mappings first.
    fn any_mapping(&self, pv: &PvState, m: &VmPage, test: impl Fn(Leaf) -> bool) -> bool {
        let small = pv.list(ListKey::page(m)).iter().any(|entry| {
            let (owner, va) = pv.entry(self.machine.memory(), entry);
            self.leaf(&self.space(owner), va).is_some_and(&test)
        });
        small
            || (!m.is_fictitious()
                && pv
                    .list(ListKey::superpage_of(m.pa()))
                    .iter()
                    .any(|entry| {
                        let (owner, va) = pv.entry(self.machine.memory(), entry);
                        self.leaf(&self.space(owner), va).is_some_and(&test)
                    }))
    }

    /// Whether some mapping of `m` has been written through since the dirty
    /// bits were last cleared.
    #[must_use]
    pub fn is_modified(&self, m: &VmPage) -> bool {
        if !m.is_managed() || !m.is_writeable() {
            return false;
        }
        let pv = self.pv.write();
        self.any_mapping(&pv, m, Leaf::modified)
    }

    /// Whether some mapping of `m` has its accessed bit set.
    #[must_use]
    pub fn is_referenced(&self, m: &VmPage) -> bool {
        if !m.is_managed() {
            return false;
        }
        let pv = self.pv.write();
        self.any_mapping(&pv, m, |leaf| leaf.present() && leaf.accessed())
    }

    /// Whether `m` has any mapping at all.
    #[must_use]
    pub fn page_is_mapped(&self, m: &VmPage) -> bool {
        if !m.is_managed() {
            return false;
        }
        let pv = self.pv.write();
        !pv.list(ListKey::page(m)).is_empty()
            || (!m.is_fictitious() && pv.superpage_mapped(m.pa()))
    }

    /// Whether `space` maps `m`, looking only at the first few reverse
    /// mappings. A `false` may be wrong; a `true` never is.
    #[must_use]
    pub fn page_exists_quick(&self, space: &AddressSpace, m: &VmPage) -> bool {
        if !m.is_managed() {
            return false;
        }
        let pv = self.pv.write();
        let small = pv.list(ListKey::page(m));
        let mut seen = 0;
        for entry in small.iter().take(EXISTS_QUICK_SCAN) {
            if pv.entry(self.machine.memory(), entry).0 == space.id() {
                return true;
            }
            seen += 1;
        }
        if seen < EXISTS_QUICK_SCAN && !m.is_fictitious() {
            let large = pv.list(ListKey::superpage_of(m.pa()));
            return large
                .iter()
                .take(EXISTS_QUICK_SCAN - seen)
                .any(|entry| pv.entry(self.machine.memory(), entry).0 == space.id());
        }
        false
    }

    /// Number of wired mappings of `m`, a wired superpage counting once.
    #[must_use]
    pub fn page_wired_mappings(&self, m: &VmPage) -> usize {
        if !m.is_managed() {
            return 0;
        }
        let pv = self.pv.write();
        let count = |key: ListKey| {
            pv.list(key)
                .iter()
                .filter(|&entry| {
                    let (owner, va) = pv.entry(self.machine.memory(), entry);
                    self.leaf(&self.space(owner), va)
                        .is_some_and(Leaf::wired)
                })
                .count()
        };
        let mut wired = count(ListKey::page(m));
        if !m.is_fictitious() {
            wired += count(ListKey::superpage_of(m.pa()));
        }
        wired
    }

    /// Count and clear the accessed bits of `m`'s mappings, stopping once
    /// five were found. The 4 KiB list is rotated so that later calls start
    /// with other mappings.
    ///
    /// A referenced, unwired superpage containing `m` is demoted and its
    /// 4 KiB piece for `m` removed, so that the next access faults and may
    /// lead to repromotion.
    pub fn ts_referenced(&self, m: &VmPage) -> u32 {
        if !m.is_managed() {
            return 0;
        }
        let mut free = FreeList::new();
        let mut pv = self.pv.write();
        let _pin = Pinned::new(&self.machine);
        let mut count = 0;

        if !m.is_fictitious() {
            for (owner, va) in pv.entries(self.machine.memory(), ListKey::superpage_of(m.pa())) {
                let space = self.space(owner);
                let mut state = space.state.lock();
                let old = self.pde(&space, va).load();
                if !old.accessed() || !self.demote_pde(&space, &mut state, &mut pv, va) {
                    continue;
                }
                if old.wired() {
                    continue;
                }
                let va = va + (m.pa() - old.superpage_frame().base());
                self.remove_page(&space, &mut state, &mut pv, va, &mut free);
                count += 1;
                if count == TS_REFERENCED_MAX {
                    break;
                }
            }
        }

        let key = ListKey::page(m);
        let mut remaining = pv.list(key).len();
        while count < TS_REFERENCED_MAX && remaining > 0 {
            remaining -= 1;
            let Some(entry) = pv.list(key).first() else {
                break;
            };
            pv.list_mut(key).rotate();
            let (owner, va) = pv.entry(self.machine.memory(), entry);
            let space = self.space(owner);
            let _state = space.state.lock();
            let Some(slot) = self.pte(&space, va) else {
                panic!("{}: superpage found in the 4 KiB list of {}", space.id(), m.phys());
            };
            if slot.load().accessed() {
                slot.clear(PtEntry::new().with_accessed(true));
                self.invalidate_page(&space, va);
                count += 1;
            }
        }
        drop(pv);
        free.release(&self.supplier);
        count
    }

    /// Clear the accessed bits of every mapping of `m`. Referenced unwired
    /// superpages are broken up as in [`ts_referenced`](Self::ts_referenced).
    pub fn clear_reference(&self, m: &VmPage) {
        if !m.is_managed() {
            return;
        }
        let mut free = FreeList::new();
        let mut pv = self.pv.write();
        let _pin = Pinned::new(&self.machine);

        if !m.is_fictitious() {
            for (owner, va) in pv.entries(self.machine.memory(), ListKey::superpage_of(m.pa())) {
                let space = self.space(owner);
                let mut state = space.state.lock();
                let old = self.pde(&space, va).load();
                if !old.accessed() || !self.demote_pde(&space, &mut state, &mut pv, va) {
                    continue;
                }
                if !old.wired() {
                    let va = va + (m.pa() - old.superpage_frame().base());
                    self.remove_page(&space, &mut state, &mut pv, va, &mut free);
                }
            }
        }

        for (owner, va) in pv.entries(self.machine.memory(), ListKey::page(m)) {
            let space = self.space(owner);
            let _state = space.state.lock();
            let Some(slot) = self.pte(&space, va) else {
                panic!("{}: superpage found in the 4 KiB list of {}", space.id(), m.phys());
            };
            if slot.load().accessed() {
                slot.clear(PtEntry::new().with_accessed(true));
                self.invalidate_page(&space, va);
            }
        }
        drop(pv);
        free.release(&self.supplier);
    }

    /// Residency of the page mapped at `va`. The `*_other` bits also
    /// reflect what the page's metadata records from other mappings.
    #[must_use]
    pub fn mincore(&self, space: &AddressSpace, va: VirtualAddress) -> Mincore {
        let _state = space.state.lock();
        let Some(leaf) = self.leaf(space, va).filter(|leaf| leaf.present()) else {
            return Mincore::new();
        };
        let mut val = Mincore::new()
            .with_incore(true)
            .with_superpage(matches!(leaf, Leaf::Large(_)));
        if leaf.modified() {
            val = val.with_modified(true).with_modified_other(true);
        }
        if leaf.accessed() {
            val = val.with_referenced(true).with_referenced_other(true);
        }
        if leaf.managed()
            && let Some(m) = self.supplier.page(leaf.phys(va))
        {
            if m.is_dirty() {
                val.set_modified_other(true);
            }
            if m.is_referenced() {
                val.set_referenced_other(true);
            }
        }
        val
    }

    /// Whether a page table covers `va` and its slot is empty, so that
    /// mapping it ahead of a fault costs no allocation.
    #[must_use]
    pub fn is_prefaultable(&self, space: &AddressSpace, va: VirtualAddress) -> bool {
        let _state = space.state.lock();
        self.pte(space, va).is_some_and(|slot| slot.load().is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::config::PmapConfig;
    use crate::prot::Prot;
    use kernel_info::memory::{NPTEPG, PAGE_SIZE};
    use alloc::vec::Vec;
    use kernel_memory_addresses::PhysicalPage;

    #[test]
    fn extract_and_hold_respects_protection() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        let m = page(&pmap);
        pmap.enter(&space, va(0x1000), m, Prot::READ, Prot::READ, false)
            .unwrap();
        assert!(pmap.extract_and_hold(&space, va(0x1000), Prot::READ_WRITE).is_none());
        let held = pmap.extract_and_hold(&space, va(0x1000), Prot::READ).unwrap();
        assert_eq!(held.pa(), m.pa());
        assert_eq!(m.hold_count(), 1);
        held.unhold();
        assert!(pmap.extract_and_hold(&space, va(0x5000), Prot::READ).is_none());
    }

    #[test]
    fn referenced_and_modified_follow_hardware_bits() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        let m = page(&pmap);
        map_rw(&pmap, &space, va(0x1000), m);
        assert!(pmap.is_referenced(m));
        assert!(!pmap.is_modified(m));

        pmap.clear_reference(m);
        assert!(!pmap.is_referenced(m));
        poke(&pmap, va(0x1000), 2);
        assert!(pmap.is_referenced(m));
        assert!(pmap.is_modified(m));
    }

    #[test]
    fn ts_referenced_counts_and_clears() {
        let pmap = pmap_with(1, PmapConfig::default());
        let a = user_space(&pmap);
        let b = pmap.create().unwrap();
        let m = page(&pmap);
        for i in 0..4 {
            map_rw(&pmap, &a, va(0x1000 * (i + 1)), m);
        }
        for i in 0..3 {
            map_rw(&pmap, &b, va(0x1000 * (i + 1)), m);
        }
        assert_eq!(pmap.ts_referenced(m), 5);
        assert_eq!(pmap.ts_referenced(m), 2);
        assert_eq!(pmap.ts_referenced(m), 0);
        assert!(!pmap.is_referenced(m));
    }

    #[test]
    fn ts_referenced_breaks_up_a_referenced_superpage() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        let frame = pmap.supplier().alloc_superpage().unwrap();
        let base = va(0x0140_0000);
        for i in 0..NPTEPG as u32 {
            let m = pmap
                .supplier()
                .vm_page(PhysicalPage::from_addr(frame.base() + i * PAGE_SIZE));
            pmap.enter(&space, base + i * PAGE_SIZE, m, Prot::READ, Prot::READ, false)
                .unwrap();
        }
        assert!(pmap.pde(&space, base).load().superpage());
        let m = pmap
            .supplier()
            .vm_page(PhysicalPage::from_addr(frame.base() + 0x2000));

        assert_eq!(pmap.ts_referenced(m), 1);
        assert!(!pmap.pde(&space, base).load().superpage());
        assert_eq!(pmap.extract(&space, base + 0x2000), None);
        assert!(!pmap.page_is_mapped(m));
        assert_eq!(space.resident_count(), NPTEPG as u32);
    }

    #[test]
    fn page_queries_see_every_mapping() {
        let pmap = pmap_with(1, PmapConfig::default());
        let a = user_space(&pmap);
        let b = pmap.create().unwrap();
        let m = page(&pmap);
        assert!(!pmap.page_is_mapped(m));
        map_rw(&pmap, &a, va(0x1000), m);
        pmap.enter(&b, va(0x2000), m, Prot::READ, Prot::READ, true)
            .unwrap();
        pmap.enter(&b, va(0x3000), m, Prot::READ, Prot::READ, true)
            .unwrap();
        assert!(pmap.page_is_mapped(m));
        assert!(pmap.page_exists_quick(&a, m));
        assert!(pmap.page_exists_quick(&b, m));
        assert_eq!(pmap.page_wired_mappings(m), 2);

        let c = pmap.create().unwrap();
        assert!(!pmap.page_exists_quick(&c, m));
    }

    #[test]
    fn page_queries_wait_for_the_exclusive_pv_lock() {
        use core::sync::atomic::{AtomicBool, Ordering};
        use std::{thread, time::Duration};

        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        let m = page(&pmap);
        map_rw(&pmap, &space, va(0x1000), m);

        let done = AtomicBool::new(false);
        let reader = pmap.pv.read();
        thread::scope(|s| {
            let query = s.spawn(|| {
                let mapped = pmap.page_is_mapped(m) && pmap.is_referenced(m);
                done.store(true, Ordering::Release);
                mapped
            });
            thread::sleep(Duration::from_millis(20));
            assert!(!done.load(Ordering::Acquire));
            drop(reader);
            assert!(query.join().unwrap());
        });
        assert!(done.load(Ordering::Acquire));
    }

    #[test]
    fn page_exists_quick_gives_up_after_sixteen() {
        let pmap = pmap_with(1, PmapConfig::default());
        let a = user_space(&pmap);
        let b = pmap.create().unwrap();
        let m = page(&pmap);
        for i in 0..16 {
            map_rw(&pmap, &a, va(0x1000 * (i + 1)), m);
        }
        map_rw(&pmap, &b, va(0x1000), m);
        assert!(!pmap.page_exists_quick(&b, m));
    }

    #[test]
    fn mincore_reports_state() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        let m = page(&pmap);
        assert!(!pmap.mincore(&space, va(0x1000)).incore());
        map_rw(&pmap, &space, va(0x1000), m);
        let report = pmap.mincore(&space, va(0x1000));
        assert!(report.incore() && report.referenced() && !report.modified());
        assert!(!report.superpage());
        poke(&pmap, va(0x1000), 1);
        assert!(pmap.mincore(&space, va(0x1000)).modified());
    }

    #[test]
    fn prefaultable_needs_a_table_and_an_empty_slot() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        assert!(!pmap.is_prefaultable(&space, va(0x2000)));
        map_rw(&pmap, &space, va(0x1000), page(&pmap));
        assert!(pmap.is_prefaultable(&space, va(0x2000)));
        assert!(!pmap.is_prefaultable(&space, va(0x1000)));
    }

    #[test]
    fn reverse_mappings_match_valid_entries() {
        let pmap = pmap_with(1, PmapConfig::default());
        let a = user_space(&pmap);
        let b = pmap.create().unwrap();
        let pages: Vec<_> = (0..6).map(|_| page(&pmap)).collect();
        for (i, m) in pages.iter().enumerate() {
            let at = va(0x1000 * (i as u32 + 1));
            map_rw(&pmap, &a, at, m);
            map_rw(&pmap, &b, at + 0x0040_0000, m);
        }
        pmap.remove(&a, va(0x2000), va(0x4000));
        pmap.remove_all(pages[5]);

        let valid = valid_entries(&pmap, &a, va(0x1000)) + valid_entries(&pmap, &b, va(0x0040_1000));
        assert_eq!(valid, 8);
        assert_eq!(pmap.pv_entry_count() as usize, valid);
        let listed: usize = pages.iter().map(|m| mappings_of(&pmap, m)).sum();
        assert_eq!(listed, valid);
    }
}
