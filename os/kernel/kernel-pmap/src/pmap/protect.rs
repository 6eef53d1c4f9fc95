//! Lowering permissions: by virtual range, and page-centric through the
//! reverse mappings.

use super::{Pmap, next_pde_boundary};
use crate::address_space::AddressSpace;
use crate::platform::{Machine, Pinned};
use crate::prot::Prot;
use crate::ptp::pte_index;
use crate::pte::{PdEntry, PtEntry};
use crate::pv::ListKey;
use crate::supplier::{PageSupplier, VmPage};
use kernel_info::memory::{NPTEPG, PAGE_SIZE, PDRMASK};
use kernel_memory_addresses::VirtualAddress;

impl<M: Machine, S: PageSupplier> Pmap<M, S> {
    /// Restrict the mappings in `[sva, eva)` to `prot`.
    ///
    /// Without read access the mappings are removed. Granting write access
    /// is not done here (it happens on the next [`enter`](Self::enter)), so
    /// a `prot` that includes write leaves the range unchanged. Write
    /// permission is otherwise withdrawn, and pages written through it are
    /// marked dirty first. Superpages only partly inside the range are
    /// demoted.
    pub fn protect(&self, space: &AddressSpace, sva: VirtualAddress, eva: VirtualAddress, prot: Prot) {
        if !prot.read() {
            self.remove(space, sva, eva);
            return;
        }
        if prot.write() {
            return;
        }

        let mut anychanged = false;
        let mut pv = self.pv.write();
        let _pin = Pinned::new(&self.machine);
        let mut state = space.state.lock();
        let mut va = sva;
        while va < eva {
            let next = next_pde_boundary(va, eva);
            let pde = self.pde(space, va).load();
            if !pde.present() {
                va = next;
                continue;
            }
            if pde.superpage() {
                if va.as_u32() & PDRMASK == 0 && eva >= next {
                    anychanged |= self.protect_pde(space, va);
                    va = next;
                    continue;
                }
                if !self.demote_pde(space, &mut state, &mut pv, va) {
                    va = next;
                    continue;
                }
            }

            let end = if next < eva { next } else { eva };
            let table = self.table(self.pde(space, va).load().table_page());
            while va < end {
                let slot = table.slot(pte_index(va));
                let old = slot.load();
                if old.present() && old.writable() {
                    let old = slot.clear(PtEntry::write_bits());
                    if old.managed() && old.dirty() {
                        self.page_of(old.phys()).mark_dirty();
                    }
                    if old.global() {
                        self.invalidate_page(space, va);
                    } else {
                        anychanged = true;
                    }
                }
                va += PAGE_SIZE;
            }
            va = next;
        }
        if anychanged {
            self.invalidate_all(space);
        }
    }

    /// Write-protect the whole superpage at `va`. Returns `true` if a
    /// non-global entry changed and still needs invalidation.
    fn protect_pde(&self, space: &AddressSpace, va: VirtualAddress) -> bool {
        loop {
            let old = self.pde(space, va).load();
            if !old.writable() {
                return false;
            }
            let new = old.with_writable(false).with_dirty(false);
            if !self.compare_exchange_pde(space, va, old, new) {
                continue;
            }
            if old.managed() && old.dirty() {
                let mut pa = old.superpage_frame().base();
                for _ in 0..NPTEPG {
                    self.page_of(pa).mark_dirty();
                    pa += PAGE_SIZE;
                }
            }
            if old.global() {
                self.invalidate_page(space, va);
                return false;
            }
            return true;
        }
    }

    /// Clear the wired flag of every mapping in `[sva, eva)`. Wiring is
    /// pure bookkeeping, so no TLB entry is touched.
    ///
    /// # Panics
    /// If a valid mapping in the range is not wired.
    pub fn unwire(&self, space: &AddressSpace, sva: VirtualAddress, eva: VirtualAddress) {
        let mut pv = self.pv.write();
        let _pin = Pinned::new(&self.machine);
        let mut state = space.state.lock();
        let mut va = sva;
        while va < eva {
            let next = next_pde_boundary(va, eva);
            let pde = self.pde(space, va).load();
            if !pde.present() {
                va = next;
                continue;
            }
            if pde.superpage() {
                assert!(pde.wired(), "{}: unwire of unwired superpage at {va}", space.id());
                if va.as_u32() & PDRMASK == 0 && eva >= next {
                    let old = self.pde(space, va).clear(PdEntry::new().with_wired(true));
                    if space.is_kernel() {
                        self.store_kernel_pde(va, old.with_wired(false));
                    }
                    state.stats.wired -= NPTEPG as u32;
                    va = next;
                    continue;
                }
                assert!(
                    self.demote_pde(space, &mut state, &mut pv, va),
                    "{}: demotion failed while unwiring {va}",
                    space.id()
                );
            }

            let end = if next < eva { next } else { eva };
            let table = self.table(self.pde(space, va).load().table_page());
            while va < end {
                let slot = table.slot(pte_index(va));
                let pte = slot.load();
                if pte.present() {
                    assert!(pte.wired(), "{}: unwire of unwired mapping at {va}", space.id());
                    slot.clear(PtEntry::new().with_wired(true));
                    state.stats.wired -= 1;
                }
                va += PAGE_SIZE;
            }
            va = next;
        }
    }

    /// Withdraw write permission from every mapping of `m`, recording the
    /// page as dirty if any of them was written.
    pub fn remove_write(&self, m: &VmPage) {
        if !m.is_managed() || !m.is_writeable() {
            return;
        }
        let mut pv = self.pv.write();
        let _pin = Pinned::new(&self.machine);

        if !m.is_fictitious() {
            for (owner, va) in pv.entries(self.machine.memory(), ListKey::superpage_of(m.pa())) {
                let space = self.space(owner);
                let mut state = space.state.lock();
                if self.pde(&space, va).load().writable() {
                    self.demote_pde(&space, &mut state, &mut pv, va);
                }
            }
        }

        for (owner, va) in pv.entries(self.machine.memory(), ListKey::page(m)) {
            let space = self.space(owner);
            let _state = space.state.lock();
            let Some(slot) = self.pte(&space, va) else {
                panic!("{}: superpage found in the 4 KiB list of {}", space.id(), m.phys());
            };
            if slot.load().writable() {
                let old = slot.clear(PtEntry::write_bits());
                if old.dirty() {
                    m.mark_dirty();
                }
                self.invalidate_page(&space, va);
            }
        }
        m.clear_writeable();
    }

    /// Clear the hardware dirty bit of every mapping of `m`. The page's own
    /// dirty flag is left to the caller.
    ///
    /// A writable superpage containing `m` is demoted and the 4 KiB piece
    /// for `m` write-protected, so that the next write faults and may lead
    /// to repromotion.
    pub fn clear_modify(&self, m: &VmPage) {
        if !m.is_managed() || !m.is_writeable() {
            return;
        }
        let mut pv = self.pv.write();
        let _pin = Pinned::new(&self.machine);

        if !m.is_fictitious() {
            for (owner, va) in pv.entries(self.machine.memory(), ListKey::superpage_of(m.pa())) {
                let space = self.space(owner);
                let mut state = space.state.lock();
                let old = self.pde(&space, va).load();
                if !old.writable() || !self.demote_pde(&space, &mut state, &mut pv, va) {
                    continue;
                }
                if old.wired() {
                    continue;
                }
                let va = va + (m.pa() - old.superpage_frame().base());
                if let Some(slot) = self.pte(&space, va)
                    && slot.load().present()
                {
                    slot.clear(PtEntry::write_bits());
                    m.mark_dirty();
                    self.invalidate_page(&space, va);
                }
            }
        }

        for (owner, va) in pv.entries(self.machine.memory(), ListKey::page(m)) {
            let space = self.space(owner);
            let _state = space.state.lock();
            let Some(slot) = self.pte(&space, va) else {
                panic!("{}: superpage found in the 4 KiB list of {}", space.id(), m.phys());
            };
            let pte = slot.load();
            if pte.dirty() && pte.writable() {
                slot.clear(PtEntry::new().with_dirty(true));
                self.invalidate_page(&space, va);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::config::PmapConfig;
    use crate::cpuset::CpuId;
    use crate::platform::Access;
    use crate::prot::Prot;
    use kernel_info::memory::{NBPDR, NPTEPG, PAGE_SIZE};
    use kernel_memory_addresses::PhysicalPage;

    #[test]
    fn protect_keeps_dirty_pages_dirty() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        let (a, b) = (page(&pmap), page(&pmap));
        map_rw(&pmap, &space, va(0x1000), a);
        map_rw(&pmap, &space, va(0x2000), b);
        poke(&pmap, va(0x1000), 1);

        pmap.protect(&space, va(0x1000), va(0x3000), Prot::READ);
        assert!(a.is_dirty());
        assert!(!b.is_dirty());
        let pte = pmap.pte(&space, va(0x1000)).unwrap().load();
        assert!(!pte.writable() && !pte.dirty() && pte.present());
        assert!(faults(&pmap, va(0x1000), Access::Write));
        assert_eq!(peek(&pmap, va(0x1000)), 1);
    }

    #[test]
    fn protect_without_read_removes() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        let m = page(&pmap);
        map_rw(&pmap, &space, va(0x1000), m);
        pmap.protect(&space, va(0x1000), va(0x2000), Prot::NONE);
        assert_eq!(pmap.extract(&space, va(0x1000)), None);
        assert_eq!(space.resident_count(), 0);
    }

    #[test]
    fn protect_with_write_changes_nothing() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        let m = page(&pmap);
        pmap.enter(&space, va(0x1000), m, Prot::READ, Prot::READ, false)
            .unwrap();
        pmap.protect(&space, va(0x1000), va(0x2000), Prot::READ_WRITE);
        assert!(!pmap.pte(&space, va(0x1000)).unwrap().load().writable());
    }

    #[test]
    fn protect_reaches_the_other_core_before_returning() {
        let pmap = pmap_with(2, PmapConfig::default());
        let space = user_space(&pmap);
        let core1 = CpuId::new(1);
        pmap.machine().run_on(core1, || pmap.activate(&space));
        let m = page(&pmap);
        map_rw(&pmap, &space, va(0x1000), m);
        pmap.machine().run_on(core1, || poke(&pmap, va(0x1000), 3));

        pmap.protect(&space, va(0x1000), va(0x2000), Prot::READ);
        let denied = pmap
            .machine()
            .run_on(core1, || faults(&pmap, va(0x1000), Access::Write));
        assert!(denied);
        assert!(m.is_dirty());
    }

    #[test]
    fn protect_whole_superpage_in_place() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        let frame = pmap.supplier().alloc_superpage().unwrap();
        let base = va(0x00C0_0000);
        for i in 0..NPTEPG as u32 {
            let m = pmap
                .supplier()
                .vm_page(PhysicalPage::from_addr(frame.base() + i * PAGE_SIZE));
            pmap.enter(&space, base + i * PAGE_SIZE, m, Prot::READ_WRITE, Prot::READ_WRITE, false)
                .unwrap();
        }
        pmap.protect(&space, base, base + NBPDR, Prot::READ);
        let pde = pmap.pde(&space, base).load();
        assert!(pde.superpage() && !pde.writable() && !pde.dirty());
        let last = pmap
            .supplier()
            .vm_page(PhysicalPage::from_addr(frame.base() + (NBPDR - PAGE_SIZE)));
        assert!(last.is_dirty());
        assert_eq!(pmap.stats().pde_demotions.get(), 0);

        pmap.protect(&space, base, base + PAGE_SIZE, Prot::NONE);
        assert_eq!(pmap.stats().pde_demotions.get(), 1);
        assert_eq!(pmap.extract(&space, base), None);
    }

    #[test]
    fn unwire_clears_wired_without_invalidation() {
        let pmap = pmap_with(2, PmapConfig::default());
        let space = user_space(&pmap);
        let m = page(&pmap);
        pmap.enter(&space, va(0x4000), m, Prot::READ, Prot::READ, true)
            .unwrap();
        let shootdowns = pmap.stats().shootdowns.get();
        pmap.unwire(&space, va(0), va(0x0040_0000));
        assert_eq!(space.wired_count(), 0);
        assert!(!pmap.pte(&space, va(0x4000)).unwrap().load().wired());
        assert_eq!(pmap.stats().shootdowns.get(), shootdowns);
    }

    #[test]
    #[should_panic(expected = "unwire of unwired mapping")]
    fn unwire_of_unwired_mapping_panics() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        map_rw(&pmap, &space, va(0x4000), page(&pmap));
        pmap.unwire(&space, va(0x4000), va(0x5000));
    }

    #[test]
    fn remove_write_reaches_every_space() {
        let pmap = pmap_with(1, PmapConfig::default());
        let a = user_space(&pmap);
        let b = pmap.create().unwrap();
        let m = page(&pmap);
        map_rw(&pmap, &a, va(0x1000), m);
        pmap.enter(&b, va(0x9000), m, Prot::READ_WRITE, Prot::READ_WRITE, false)
            .unwrap();

        pmap.remove_write(m);
        assert!(m.is_dirty());
        assert!(!m.is_writeable());
        assert!(!pmap.pte(&a, va(0x1000)).unwrap().load().writable());
        assert!(!pmap.pte(&b, va(0x9000)).unwrap().load().writable());
        assert!(faults(&pmap, va(0x1000), Access::Write));
    }

    #[test]
    fn clear_modify_only_touches_hardware_bits() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        let m = page(&pmap);
        map_rw(&pmap, &space, va(0x1000), m);
        poke(&pmap, va(0x1000), 8);
        assert!(pmap.is_modified(m));

        pmap.clear_modify(m);
        assert!(!pmap.is_modified(m));
        let pte = pmap.pte(&space, va(0x1000)).unwrap().load();
        assert!(pte.writable() && !pte.dirty());
        poke(&pmap, va(0x1000), 9);
        assert!(pmap.is_modified(m));
    }

    #[test]
    fn clear_modify_splits_a_writable_superpage() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        let frame = pmap.supplier().alloc_superpage().unwrap();
        let base = va(0x00C0_0000);
        for i in 0..NPTEPG as u32 {
            let m = pmap
                .supplier()
                .vm_page(PhysicalPage::from_addr(frame.base() + i * PAGE_SIZE));
            pmap.enter(&space, base + i * PAGE_SIZE, m, Prot::READ_WRITE, Prot::READ_WRITE, false)
                .unwrap();
        }
        let m = pmap
            .supplier()
            .vm_page(PhysicalPage::from_addr(frame.base() + 0x3000));
        assert!(pmap.is_modified(m));

        pmap.clear_modify(m);
        assert!(!pmap.pde(&space, base).load().superpage());
        assert!(!pmap.is_modified(m));
        assert!(!pmap.pte(&space, base + 0x3000).unwrap().load().writable());
        assert!(pmap.pte(&space, base + 0x4000).unwrap().load().writable());
    }
}
