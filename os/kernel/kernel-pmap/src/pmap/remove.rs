//! Destroying mappings: by range, by physical page, and wholesale at exit.

use super::{Pmap, next_pde_boundary, zero_table};
use crate::address_space::{AddressSpace, SpaceState};
use crate::platform::{Machine, Pinned};
use crate::ptp::{FreeList, pte_index};
use crate::pte::{PdEntry, PtEntry, Slot};
use crate::pv::{ChunkId, ListKey, PvRef, PvState};
use crate::supplier::{PageSupplier, VmPage};
use alloc::vec::Vec;
use kernel_info::memory::{NPTEPG, PAGE_SIZE, PDRMASK, is_user_address};
use kernel_memory_addresses::VirtualAddress;
use log::trace;

impl<M: Machine, S: PageSupplier> Pmap<M, S> {
    /// Remove every mapping in `[sva, eva)` of `space`. Superpages only
    /// partly inside the range are demoted first.
    pub fn remove(&self, space: &AddressSpace, sva: VirtualAddress, eva: VirtualAddress) {
        let mut free = FreeList::new();
        let mut pv = self.pv.write();
        let _pin = Pinned::new(&self.machine);
        let mut state = space.state.lock();
        if state.stats.resident == 0 {
            return;
        }

        let mut anyvalid = false;
        let single = sva + PAGE_SIZE == eva && {
            let pde = self.pde(space, sva).load();
            pde.present() && !pde.superpage()
        };
        if single {
            self.remove_page(space, &mut state, &mut pv, sva, &mut free);
        } else {
            let mut va = sva;
            while va < eva && state.stats.resident != 0 {
                let next = next_pde_boundary(va, eva);
                let pde = self.pde(space, va).load();
                if !pde.present() {
                    va = next;
                    continue;
                }
                if pde.superpage() {
                    if va.as_u32() & PDRMASK == 0 && eva >= next {
                        if !pde.global() {
                            anyvalid = true;
                        }
                        self.remove_pde(space, &mut state, &mut pv, va, &mut free);
                        va = next;
                        continue;
                    }
                    if !self.demote_pde(space, &mut state, &mut pv, va) {
                        // The superpage was destroyed instead.
                        va = next;
                        continue;
                    }
                }

                let end = if next < eva { next } else { eva };
                let table = self.table(self.pde(space, va).load().table_page());
                while va < end {
                    let slot = table.slot(pte_index(va));
                    let pte = slot.load();
                    if !pte.is_zero() {
                        if !pte.global() {
                            anyvalid = true;
                        }
                        if self.remove_pte(space, &mut state, &mut pv, slot, va, &mut free) {
                            break;
                        }
                    }
                    va += PAGE_SIZE;
                }
                va = next;
            }
        }

        if anyvalid {
            self.invalidate_all(space);
        }
        drop(state);
        drop(pv);
        free.release(&self.supplier);
    }

    /// Remove the single 4 KiB mapping at `va`, if any, and invalidate it.
    pub(crate) fn remove_page(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        va: VirtualAddress,
        free: &mut FreeList,
    ) {
        let Some(slot) = self.pte(space, va) else {
            return;
        };
        if slot.load().is_zero() {
            return;
        }
        self.remove_pte(space, state, pv, slot, va, free);
        self.invalidate_page(space, va);
    }

    /// Clear one 4 KiB entry and account for it. Returns `true` if the page
    /// table holding it was freed. The caller invalidates `va` unless the
    /// entry was global.
    pub(crate) fn remove_pte(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        slot: Slot<'_, PtEntry>,
        va: VirtualAddress,
        free: &mut FreeList,
    ) -> bool {
        let old = slot.take();
        if old.wired() {
            state.stats.wired -= 1;
        }
        if old.global() {
            self.invalidate_page(&self.kernel, va);
        }
        state.stats.resident -= 1;
        if old.managed() {
            let m = self.page_of(old.phys());
            if old.dirty() && old.writable() {
                m.mark_dirty();
            }
            if old.accessed() {
                m.set_referenced();
            }
            self.pvh_free(state, pv, ListKey::page(m), space, va);
            self.clear_writeable_if_unmapped(pv, m);
        }
        self.unuse_pt(space, state, va, free)
    }

    /// Forget the writeable hint of `m` once nothing maps it any more.
    pub(crate) fn clear_writeable_if_unmapped(&self, pv: &PvState, m: &VmPage) {
        if pv.list(ListKey::page(m)).is_empty()
            && (m.is_fictitious() || !pv.superpage_mapped(m.pa()))
        {
            m.clear_writeable();
        }
    }

    /// Drop one reference to the user page table covering `va`, freeing it
    /// when it no longer maps anything. Returns `true` if it was freed.
    pub(crate) fn unuse_pt(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        va: VirtualAddress,
        free: &mut FreeList,
    ) -> bool {
        if !is_user_address(va) {
            return false;
        }
        let Some(ptp) = state.ptps.lookup_mut(va) else {
            panic!("{}: no page table indexed for {va}", space.id());
        };
        assert!(ptp.wire_count > 0, "{}: page table for {va} over-released", space.id());
        ptp.wire_count -= 1;
        if ptp.wire_count > 0 {
            return false;
        }
        let Some(ptp) = state.ptps.remove(va) else {
            unreachable!("page table vanished from the index");
        };
        self.pde(space, va).store(PdEntry::new());
        state.stats.resident -= 1;
        free.mark(ptp.page);
        trace!("{}: freed page table {} for {va}", space.id(), ptp.page);
        true
    }

    /// Remove the superpage mapping at `va`, which must be 4 MiB aligned.
    /// A user space's saved page table is freed; the kernel's is zeroed and
    /// put back in place.
    pub(crate) fn remove_pde(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        va: VirtualAddress,
        free: &mut FreeList,
    ) {
        let old = self.pde(space, va).take();
        assert!(old.superpage(), "{}: remove_pde on a page table at {va}", space.id());
        if old.wired() {
            state.stats.wired -= NPTEPG as u32;
        }
        if old.global() {
            self.invalidate_page(&self.kernel, va);
        }
        state.stats.resident -= NPTEPG as u32;

        if old.managed() {
            let frame = old.superpage_frame();
            self.pvh_free(state, pv, ListKey::Superpage(frame), space, va);
            let superpage_mapped = !pv.list(ListKey::Superpage(frame)).is_empty();
            let mut pa = frame.base();
            for _ in 0..NPTEPG {
                let m = self.page_of(pa);
                if old.dirty() && old.writable() {
                    m.mark_dirty();
                }
                if old.accessed() {
                    m.set_referenced();
                }
                if !superpage_mapped && pv.list(ListKey::page(m)).is_empty() {
                    m.clear_writeable();
                }
                pa += PAGE_SIZE;
            }
        }

        if space.is_kernel() {
            self.remove_kernel_pde(state, va);
        } else if let Some(ptp) = state.ptps.remove(va) {
            assert_eq!(
                ptp.wire_count, NPTEPG as u32,
                "{}: saved page table for {va} has a bad wire count",
                space.id()
            );
            state.stats.resident -= 1;
            free.mark(ptp.page);
        }
    }

    /// Put the kernel page table for `va` back, empty, after its superpage
    /// went away. Kernel page tables are never freed.
    fn remove_kernel_pde(&self, state: &SpaceState, va: VirtualAddress) {
        let Some(ptp) = state.ptps.lookup(va) else {
            panic!("no saved kernel page table for {va}");
        };
        zero_table(self.machine.memory(), ptp.page);
        let pde = PdEntry::table(ptp.page, false);
        if self.config.workaround_erratum383() {
            self.update_pde(&self.kernel, va, pde);
        } else {
            self.store_kernel_pde(va, pde);
        }
    }

    /// Remove every mapping of the managed page `m`, in all address spaces.
    ///
    /// # Panics
    /// If `m` is not managed.
    pub fn remove_all(&self, m: &VmPage) {
        assert!(m.is_managed(), "remove_all of unmanaged page {}", m.phys());
        let mut free = FreeList::new();
        let mut pv = self.pv.write();
        let _pin = Pinned::new(&self.machine);

        if !m.is_fictitious() {
            let key = ListKey::superpage_of(m.pa());
            while let Some(entry) = pv.list(key).first() {
                let (owner, va) = pv.entry(self.machine.memory(), entry);
                let space = self.space(owner);
                let mut state = space.state.lock();
                self.demote_pde(&space, &mut state, &mut pv, va);
            }
        }

        let key = ListKey::page(m);
        while let Some(entry) = pv.list(key).first() {
            let (owner, va) = pv.entry(self.machine.memory(), entry);
            let space = self.space(owner);
            let mut state = space.state.lock();
            state.stats.resident -= 1;
            let Some(slot) = self.pte(&space, va) else {
                panic!("{}: pv entry for {va} without a page table", space.id());
            };
            let old = slot.take();
            assert!(!old.is_zero(), "{}: pv entry for unmapped {va}", space.id());
            if old.wired() {
                state.stats.wired -= 1;
            }
            if old.accessed() {
                m.set_referenced();
            }
            if old.dirty() && old.writable() {
                m.mark_dirty();
            }
            self.unuse_pt(&space, &mut state, va, &mut free);
            self.invalidate_page(&space, va);
            pv.unlink_ref(key, entry);
            self.free_pv_entry(&mut state, &mut pv, entry);
        }
        m.clear_writeable();
        drop(pv);
        free.release(&self.supplier);
    }

    /// Tear down every unwired user mapping of `space` at once, walking its
    /// reverse-mapping chunks instead of its page tables. Meant for an
    /// exiting process whose space is loaded on no other CPU.
    ///
    /// # Panics
    /// If `space` is the kernel space.
    pub fn remove_pages(&self, space: &AddressSpace) {
        assert!(!space.is_kernel(), "remove_pages on the kernel address space");
        let mut free = FreeList::new();
        let mut pv = self.pv.write();
        let _pin = Pinned::new(&self.machine);
        let mut state = space.state.lock();

        let chunks: Vec<ChunkId> = state.pv_chunks.iter().copied().collect();
        for id in chunks {
            let slots: Vec<u16> = pv.in_use(self.machine.memory(), id).collect();
            for slot in slots {
                let entry = PvRef { chunk: id, slot };
                let (_, va) = pv.entry(self.machine.memory(), entry);
                let pde_slot = self.pde(space, va);
                if pde_slot.load().superpage() {
                    if pde_slot.load().wired() {
                        continue;
                    }
                    self.remove_pages_pde(space, &mut state, &mut pv, entry, va, &mut free);
                } else {
                    let Some(slot) = self.pte(space, va) else {
                        panic!("{}: pv entry for {va} without a page table", space.id());
                    };
                    if slot.load().wired() {
                        continue;
                    }
                    let old = slot.take();
                    let m = self.page_of(old.phys());
                    if old.dirty() && old.writable() {
                        m.mark_dirty();
                    }
                    state.stats.resident -= 1;
                    pv.unlink_ref(ListKey::page(m), entry);
                    self.clear_writeable_if_unmapped(&pv, m);
                    self.unuse_pt(space, &mut state, va, &mut free);
                }
                self.free_pv_entry(&mut state, &mut pv, entry);
            }
        }

        self.invalidate_all(space);
        drop(state);
        drop(pv);
        free.release(&self.supplier);
    }

    fn remove_pages_pde(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        entry: PvRef,
        va: VirtualAddress,
        free: &mut FreeList,
    ) {
        let old = self.pde(space, va).take();
        let frame = old.superpage_frame();
        state.stats.resident -= NPTEPG as u32;
        pv.unlink_ref(ListKey::Superpage(frame), entry);
        let superpage_mapped = !pv.list(ListKey::Superpage(frame)).is_empty();
        let mut pa = frame.base();
        for _ in 0..NPTEPG {
            let m = self.page_of(pa);
            if old.dirty() && old.writable() {
                m.mark_dirty();
            }
            if !superpage_mapped && pv.list(ListKey::page(m)).is_empty() {
                m.clear_writeable();
            }
            pa += PAGE_SIZE;
        }
        if let Some(ptp) = state.ptps.remove(va) {
            state.stats.resident -= 1;
            free.mark(ptp.page);
        }
    }
}
