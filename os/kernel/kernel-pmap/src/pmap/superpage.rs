//! Superpage promotion and demotion.
//!
//! A full page table whose 1024 entries map one aligned, physically
//! contiguous 4 MiB run with identical flags is replaced by a single 4 MiB
//! directory entry. The page-table page is not freed: it stays in the
//! space's index, still holding the old entries, so that demotion can put
//! it back without allocating.

use super::Pmap;
use crate::address_space::{AddressSpace, SpaceState};
use crate::platform::Machine;
use crate::ptp::{FreeList, PageTablePage, pde_index};
use crate::pte::{PageTable, PdEntry, PtEntry};
use crate::pv::{ListKey, PvState};
use crate::supplier::{AllocFlags, PageSupplier};
use kernel_info::memory::{NBPDR, NPTEPG, PAGE_SIZE, PDRMASK};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress};
use log::trace;

impl<M: Machine, S: PageSupplier> Pmap<M, S> {
    /// Try to replace the page table covering `va` with a superpage.
    /// Returns `true` on success.
    ///
    /// Writable entries that are still clean lose their write permission
    /// on the way, so that a later write cannot dirty a page behind the
    /// superpage's back.
    pub(crate) fn promote_pde(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        va: VirtualAddress,
    ) -> bool {
        let base = va.align_down::<Size4M>();
        let pde = self.pde(space, base).load();
        let table = self.table(pde.table_page());

        let Some(first) = Self::promotable_first(space, table) else {
            return self.promotion_failed(space, va);
        };
        let mut pa = first.phys() + (NBPDR - PAGE_SIZE);
        for slot in table.slots().skip(1).rev() {
            let mut pte = slot.load();
            loop {
                if !(pte.present() && pte.accessed() && pte.phys() == pa) {
                    return self.promotion_failed(space, va);
                }
                if pte.writable() && !pte.dirty() {
                    let clean = pte.with_writable(false);
                    match slot.compare_exchange(pte, clean) {
                        Ok(_) => pte = clean,
                        Err(now) => {
                            pte = now;
                            continue;
                        }
                    }
                }
                break;
            }
            if !pte.same_flags(first) {
                return self.promotion_failed(space, va);
            }
            pa = PhysicalAddress::new(pa.as_u32() - PAGE_SIZE);
        }

        if first.managed() {
            self.pv_promote(space, state, pv, base, first.phys());
        }
        let newpde = first.into_superpage();
        if self.config.workaround_erratum383() {
            self.update_pde(space, base, newpde);
        } else {
            self.store_pde(space, base, newpde);
        }
        self.stats.pde_promotions.inc();
        trace!("{}: promoted {base} to {}", space.id(), newpde.superpage_frame());
        true
    }

    /// The first entry of a promotion candidate, write-protected if it was
    /// clean, or `None` if it cannot start a superpage.
    fn promotable_first(space: &AddressSpace, table: PageTable<'_>) -> Option<PtEntry> {
        let slot = table.slot(0);
        let mut first = slot.load();
        loop {
            if !(first.present() && first.accessed() && first.phys().as_u32() & PDRMASK == 0) {
                return None;
            }
            // Kernel managed mappings would need pv entries under the kernel
            // space lock in every directory.
            if first.managed() && space.is_kernel() {
                return None;
            }
            if first.writable() && !first.dirty() {
                let clean = first.with_writable(false);
                match slot.compare_exchange(first, clean) {
                    Ok(_) => return Some(clean),
                    Err(now) => {
                        first = now;
                        continue;
                    }
                }
            }
            return Some(first);
        }
    }

    fn promotion_failed(&self, space: &AddressSpace, va: VirtualAddress) -> bool {
        self.stats.pde_p_failures.inc();
        trace!("{}: promotion failed at {va}", space.id());
        false
    }

    /// Move the reverse mappings of a promoted run to its 4 MiB list: the
    /// first page's entry is reused, the other 1023 are freed.
    fn pv_promote(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        base: VirtualAddress,
        first: PhysicalAddress,
    ) {
        let m = self.page_of(first);
        let mem = self.machine.memory();
        let Some(entry) = pv.unlink(mem, ListKey::page(m), space.id(), base) else {
            panic!("{}: no pv entry for {base} to promote", space.id());
        };
        pv.link(ListKey::superpage_of(first), entry);

        let (mut pa, mut va) = (first, base);
        for _ in 1..NPTEPG {
            pa += PAGE_SIZE;
            va += PAGE_SIZE;
            let m = self.page_of(pa);
            self.pvh_free(state, pv, ListKey::page(m), space, va);
        }
    }

    /// Break the superpage covering `va` back into 4 KiB mappings with the
    /// same translation and flags.
    ///
    /// Returns `false` if that was impossible, in which case the superpage
    /// mapping has been removed altogether: there was no saved page table
    /// and either the mapping was never accessed or no page was available,
    /// or the reverse-mapping entries could not be reserved.
    pub(crate) fn demote_pde(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        va: VirtualAddress,
    ) -> bool {
        let base = va.align_down::<Size4M>();
        let old = self.pde(space, base).load();
        assert!(old.superpage(), "{}: demotion of a page table at {base}", space.id());

        if old.managed() && !self.reserve_pv_entries(space, state, pv, NPTEPG - 1) {
            return self.demotion_failed(space, state, pv, base);
        }

        let (ptp, fresh) = match state.ptps.lookup(base) {
            Some(saved) => (saved.page, false),
            None => {
                let page = if old.accessed() {
                    self.supplier
                        .alloc_page(pde_index(base) as u32, AllocFlags::page_table())
                } else {
                    None
                };
                let Some(page) = page else {
                    return self.demotion_failed(space, state, pv, base);
                };
                let wire_count = if space.is_kernel() {
                    0
                } else {
                    state.stats.resident += 1;
                    NPTEPG as u32
                };
                state
                    .ptps
                    .insert(base, PageTablePage::new(page.phys(), wire_count));
                (page.phys(), true)
            }
        };

        let newpte = old.first_small();
        let table = self.table(ptp);
        if fresh || !table.slot(0).load().same_flags(newpte) {
            fill_ptp(table, newpte);
        }

        let newpde = PdEntry::table(ptp, old.user());
        if self.config.workaround_erratum383() {
            self.update_pde(space, base, newpde);
        } else {
            self.store_pde(space, base, newpde);
            self.invalidate_page(space, base);
        }

        if old.managed() {
            self.pv_demote(space, state, pv, base, old.superpage_frame());
        }
        self.stats.pde_demotions.inc();
        trace!("{}: demoted {base}", space.id());
        true
    }

    fn demotion_failed(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        base: VirtualAddress,
    ) -> bool {
        let mut free = FreeList::new();
        self.remove_pde(space, state, pv, base, &mut free);
        self.invalidate_page(space, base);
        free.release(&self.supplier);
        trace!("{}: demotion failed at {base}, mapping removed", space.id());
        false
    }

    /// Hand the 4 MiB entry to the first page and give every other page of
    /// the run an entry of its own, from the reserve made beforehand.
    fn pv_demote(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        base: VirtualAddress,
        frame: PhysicalPage<Size4M>,
    ) {
        let mem = self.machine.memory();
        let Some(entry) = pv.unlink(mem, ListKey::Superpage(frame), space.id(), base) else {
            panic!("{}: no pv entry for superpage {base}", space.id());
        };
        let mut pa = frame.base();
        pv.link(ListKey::page(self.page_of(pa)), entry);

        let mut va = base;
        for _ in 1..NPTEPG {
            pa += PAGE_SIZE;
            va += PAGE_SIZE;
            let Some(entry) = self.get_pv_entry(space, state, pv, va, true) else {
                panic!("{}: pv reserve exhausted while demoting {base}", space.id());
            };
            pv.link(ListKey::page(self.page_of(pa)), entry);
        }
    }
}

/// Write the 1024 entries of a superpage whose first entry is `first`.
fn fill_ptp(table: PageTable<'_>, first: PtEntry) {
    let start = first.page().index();
    for (i, slot) in table.slots().enumerate() {
        slot.store(first.with_page(PhysicalPage::<Size4K>::from_index(start + i as u32)));
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::address_space::AddressSpace;
    use crate::cache::MemAttr;
    use crate::config::PmapConfig;
    use crate::cpuset::CpuId;
    use crate::platform::{Access, Machine as _};
    use crate::prot::Prot;
    use crate::pte::PtEntry;
    use crate::pv::ListKey;
    use alloc::vec::Vec;
    use kernel_info::memory::{NBPDR, NPTEPG, PAGE_SIZE};
    use kernel_memory_addresses::{PhysicalPage, Size4K, Size4M};

    const BASE: u32 = 0x0080_0000;

    /// Map a fresh 4 MiB frame page by page at `BASE`, dirty.
    fn map_run(pmap: &TestPmap, space: &AddressSpace) -> PhysicalPage<Size4M> {
        let frame = pmap.supplier().alloc_superpage().unwrap();
        for i in 0..NPTEPG as u32 {
            let m = pmap
                .supplier()
                .vm_page(PhysicalPage::<Size4K>::from_addr(frame.base() + i * PAGE_SIZE));
            pmap.enter(
                space,
                va(BASE + i * PAGE_SIZE),
                m,
                Prot::READ_WRITE,
                Prot::READ_WRITE,
                false,
            )
            .unwrap();
        }
        frame
    }

    #[test]
    fn full_contiguous_table_is_promoted() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        let frame = map_run(&pmap, &space);

        let pde = pmap.pde(&space, va(BASE)).load();
        assert!(pde.superpage() && pde.writable() && pde.user() && pde.managed());
        assert_eq!(pde.superpage_frame(), frame);
        assert_eq!(pmap.stats().pde_promotions.get(), 1);
        assert_eq!(pmap.pv_entry_count(), 1);
        assert_eq!(space.resident_count(), NPTEPG as u32 + 1);
        assert_eq!(wire_count(&space, va(BASE)), Some(NPTEPG as u32));

        let m = pmap.supplier().vm_page(PhysicalPage::from_addr(frame.base() + 0x5000));
        assert_eq!(mappings_of(&pmap, m), 1);
        assert_eq!(
            pmap.extract(&space, va(BASE + 0x5123)),
            Some(frame.base() + 0x5123)
        );
        poke(&pmap, va(BASE + 0x3F_F000), 11);
        assert_eq!(
            pmap.machine().memory().read_u32(frame.base() + 0x3F_F000),
            11
        );
    }

    /// Map a write-protected (PAT) 4 MiB run page by page and return the
    /// 1024 entries it would have without promotion, taken just before the
    /// last page completes the table.
    fn map_pat_run(pmap: &TestPmap, space: &AddressSpace) -> (PhysicalPage<Size4M>, Vec<PtEntry>) {
        let frame = pmap.supplier().alloc_superpage().unwrap();
        let page_at = |i: u32| {
            pmap.supplier()
                .vm_page(PhysicalPage::<Size4K>::from_addr(frame.base() + i * PAGE_SIZE))
        };
        let last = NPTEPG as u32 - 1;
        for i in 0..=last {
            page_at(i).store_memattr(MemAttr::WriteProtected);
        }
        for i in 0..last {
            pmap.enter(space, va(BASE + i * PAGE_SIZE), page_at(i), Prot::READ_WRITE, Prot::READ_WRITE, false)
                .unwrap();
        }

        let table = pmap.table(pmap.pde(space, va(BASE)).load().table_page());
        let mut before: Vec<PtEntry> = table.slots().take(last as usize).map(|s| s.load()).collect();
        let first = before[0];
        assert!(first.pat() && first.accessed() && first.dirty() && first.writable());
        before.push(first.with_page(PhysicalPage::<Size4K>::from_addr(frame.base() + last * PAGE_SIZE)));

        pmap.enter(space, va(BASE + last * PAGE_SIZE), page_at(last), Prot::READ_WRITE, Prot::READ_WRITE, false)
            .unwrap();
        let pde = pmap.pde(space, va(BASE)).load();
        assert!(pde.superpage() && pde.large_pat() && pde.accessed() && pde.dirty());
        (frame, before)
    }

    fn demote_at(pmap: &TestPmap, space: &AddressSpace, at: u32) {
        let mut pv = pmap.pv.write();
        let mut state = space.state.lock();
        assert!(pmap.demote_pde(space, &mut state, &mut pv, va(at)));
    }

    fn table_entries(pmap: &TestPmap, space: &AddressSpace) -> Vec<PtEntry> {
        let pde = pmap.pde(space, va(BASE)).load();
        assert!(!pde.superpage());
        pmap.table(pde.table_page()).slots().map(|s| s.load()).collect()
    }

    #[test]
    fn demotion_restores_the_small_entries() {
        let pmap = pmap_with(1, PmapConfig::default());
        assert!(pmap.pat_layout().bits(MemAttr::WriteProtected).pat);
        let space = user_space(&pmap);
        let (frame, before) = map_pat_run(&pmap, &space);

        demote_at(&pmap, &space, BASE + 0x1234);
        assert_eq!(table_entries(&pmap, &space), before);
        assert_eq!(pmap.stats().pde_demotions.get(), 1);
        assert_eq!(pmap.pv_entry_count(), NPTEPG as u32);
        assert!(pmap.pv.read().list(ListKey::Superpage(frame)).is_empty());
        assert_eq!(space.resident_count(), NPTEPG as u32 + 1);
        assert_eq!(valid_entries(&pmap, &space, va(BASE)), NPTEPG);
    }

    #[test]
    fn demotion_rebuilds_a_stale_table_from_the_superpage() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        let (_, before) = map_pat_run(&pmap, &space);

        let saved = space.state.lock().ptps.lookup(va(BASE)).map(|p| p.page);
        let Some(saved) = saved else {
            panic!("promotion dropped the page table");
        };
        for slot in pmap.table(saved).slots() {
            slot.take();
        }

        demote_at(&pmap, &space, BASE);
        assert_eq!(table_entries(&pmap, &space), before);
        assert_eq!(
            pmap.extract(&space, va(BASE + 0x3F_F010)),
            Some(before[NPTEPG - 1].phys() + 0x10)
        );
    }

    #[test]
    fn clean_run_is_promoted_read_only() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        let frame = pmap.supplier().alloc_superpage().unwrap();
        for i in 0..NPTEPG as u32 {
            let m = pmap
                .supplier()
                .vm_page(PhysicalPage::from_addr(frame.base() + i * PAGE_SIZE));
            map_rw(&pmap, &space, va(BASE + i * PAGE_SIZE), m);
        }
        let pde = pmap.pde(&space, va(BASE)).load();
        assert!(pde.superpage() && !pde.writable() && !pde.dirty());
        assert!(faults(&pmap, va(BASE), Access::Write));
    }

    #[test]
    fn discontiguous_table_is_not_promoted() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        for i in 0..NPTEPG as u32 {
            let m = page(&pmap);
            pmap.enter(&space, va(BASE + i * PAGE_SIZE), m, Prot::READ, Prot::READ, false)
                .unwrap();
        }
        assert!(!pmap.pde(&space, va(BASE)).load().superpage());
        assert_eq!(pmap.stats().pde_promotions.get(), 0);
        assert!(pmap.stats().pde_p_failures.get() >= 1);
    }

    #[test]
    fn promotion_is_off_when_disabled() {
        let pmap = pmap_with(1, PmapConfig::default().with_superpages_enabled(false));
        let space = user_space(&pmap);
        map_run(&pmap, &space);
        assert!(!pmap.pde(&space, va(BASE)).load().superpage());
        assert_eq!(pmap.pv_entry_count(), NPTEPG as u32);
    }

    #[test]
    fn kernel_table_is_tried_only_when_full() {
        let pmap = pmap_with(1, PmapConfig::default());
        let base = pmap.kernel_vm_end();
        pmap.growkernel(base + NBPDR).unwrap();
        let frame = pmap.supplier().alloc_superpage().unwrap();
        let failures = pmap.stats().pde_p_failures.get();
        let last = NPTEPG as u32 - 1;
        for i in 0..=last {
            let m = pmap
                .supplier()
                .vm_page(PhysicalPage::<Size4K>::from_addr(frame.base() + i * PAGE_SIZE));
            m.reset(i, false, false);
            pmap.enter(pmap.kernel(), base + i * PAGE_SIZE, m, Prot::READ_WRITE, Prot::READ_WRITE, false)
                .unwrap();
            if i < last {
                assert_eq!(pmap.stats().pde_p_failures.get(), failures);
            }
        }
        assert!(pmap.pde(pmap.kernel(), base).load().superpage());
        assert_eq!(pmap.stats().pde_p_failures.get(), failures);
        assert_eq!(pmap.stats().pde_promotions.get(), 1);
    }

    #[test]
    fn whole_superpage_removal_frees_the_saved_table() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        let frame = map_run(&pmap, &space);
        let ptp = space.state.lock().ptps.lookup(va(BASE)).map(|p| p.page);

        pmap.remove(&space, va(BASE), va(BASE) + NBPDR);
        assert!(pmap.pde(&space, va(BASE)).load().is_zero());
        assert_eq!(space.resident_count(), 0);
        assert_eq!(space.page_table_pages(), 0);
        assert_eq!(pmap.pv_entry_count(), 0);
        assert!(pmap.supplier().is_free(ptp.unwrap()));
        let m = pmap.supplier().vm_page(PhysicalPage::from_addr(frame.base()));
        assert!(m.is_dirty());
        assert!(faults(&pmap, va(BASE + 0x1000), Access::Read));
    }

    #[test]
    fn partial_removal_demotes_first() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        map_run(&pmap, &space);

        pmap.remove(&space, va(BASE + 0x2000), va(BASE + 0x3000));
        assert!(!pmap.pde(&space, va(BASE)).load().superpage());
        assert_eq!(pmap.extract(&space, va(BASE + 0x2000)), None);
        assert!(pmap.extract(&space, va(BASE + 0x3000)).is_some());
        assert_eq!(pmap.pv_entry_count(), NPTEPG as u32 - 1);
        assert_eq!(space.resident_count(), NPTEPG as u32);
        assert_eq!(wire_count(&space, va(BASE)), Some(NPTEPG as u32 - 1));
        assert!(faults(&pmap, va(BASE + 0x2000), Access::Read));
    }

    #[test]
    fn remove_all_demotes_the_superpage() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        let frame = map_run(&pmap, &space);
        let m = pmap
            .supplier()
            .vm_page(PhysicalPage::from_addr(frame.base() + 0x7000));
        pmap.remove_all(m);
        assert_eq!(mappings_of(&pmap, m), 0);
        assert_eq!(pmap.extract(&space, va(BASE + 0x7000)), None);
        assert_eq!(pmap.extract(&space, va(BASE + 0x8000)), Some(frame.base() + 0x8000));
        assert_eq!(pmap.stats().pde_demotions.get(), 1);
    }

    #[test]
    fn erratum_workaround_promotes_in_a_rendezvous() {
        let pmap = pmap_with(2, PmapConfig::default().with_workaround_erratum383(true));
        let space = user_space(&pmap);
        pmap.machine().run_on(CpuId::new(1), || pmap.activate(&space));
        let before = pmap.machine().counters().rendezvous;
        map_run(&pmap, &space);
        assert!(pmap.pde(&space, va(BASE)).load().superpage());
        assert_eq!(pmap.machine().counters().rendezvous, before + 1);
        let read = pmap
            .machine()
            .run_on(CpuId::new(1), || peek(&pmap, va(BASE + 0x1000)));
        assert_eq!(read, 0);
        assert_eq!(pmap.machine().counters().size_conflicts, 0);
    }

    #[test]
    fn superpage_survives_release_teardown() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = pmap.create().unwrap();
        map_run(&pmap, &space);
        pmap.remove_pages(&space);
        assert_eq!(space.resident_count(), 0);
        assert_eq!(space.page_table_pages(), 0);
        pmap.release(space);
    }
}
