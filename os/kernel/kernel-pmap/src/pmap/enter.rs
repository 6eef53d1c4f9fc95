//! Entering mappings.

use super::{Pmap, zero_table};
use crate::address_space::{AddressSpace, SpaceState};
use crate::error::PmapError;
use crate::platform::{Machine, Pinned};
use crate::ptp::{FreeList, PageTablePage, pde_index};
use crate::pte::{PdEntry, PtEntry};
use crate::prot::Prot;
use crate::pv::{ListKey, PvState};
use crate::supplier::{AllocFlags, PageSupplier, VmPage};
use kernel_info::memory::{NPTEPG, is_kernel_address, is_user_address};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use log::{debug, warn};

/// One mapping to establish.
#[derive(Copy, Clone)]
struct Request<'m> {
    va: VirtualAddress,
    m: &'m VmPage,
    access: Prot,
    prot: Prot,
    wired: bool,
}

enum Entered {
    Done,
    /// No page-table page was available.
    NeedPage,
}

impl<M: Machine, S: PageSupplier> Pmap<M, S> {
    /// Map page `m` at `va` in `space` with protection `prot`, replacing
    /// whatever `va` mapped before. `access` is the access that caused the
    /// call; a write access creates the entry already dirty.
    ///
    /// Sleeps in the supplier until a page-table page is available. A full,
    /// uniform page table is promoted to a superpage afterwards.
    ///
    /// # Errors
    /// [`PmapError::ResourceShortage`] if no page-table page will become
    /// available or no reverse-mapping entry could be had.
    ///
    /// # Panics
    /// If `va` lies outside the half of the address space `space` owns.
    pub fn enter(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
        m: &VmPage,
        access: Prot,
        prot: Prot,
        wired: bool,
    ) -> Result<(), PmapError> {
        let request = Request {
            va: va.align_down::<Size4K>(),
            m,
            access,
            prot,
            wired,
        };
        self.enter_request(space, request, true)
    }

    /// Like [`enter`](Self::enter), but fails instead of sleeping when no
    /// page-table page is available.
    ///
    /// # Errors
    /// [`PmapError::ResourceShortage`] as soon as a page-table page or a
    /// reverse-mapping entry is missing.
    pub fn enter_nowait(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
        m: &VmPage,
        access: Prot,
        prot: Prot,
        wired: bool,
    ) -> Result<(), PmapError> {
        let request = Request {
            va: va.align_down::<Size4K>(),
            m,
            access,
            prot,
            wired,
        };
        self.enter_request(space, request, false)
    }

    fn enter_request(
        &self,
        space: &AddressSpace,
        request: Request<'_>,
        may_block: bool,
    ) -> Result<(), PmapError> {
        let va = request.va;
        if space.is_kernel() {
            assert!(is_kernel_address(va), "kernel enter of user address {va}");
        } else {
            assert!(is_user_address(va), "{}: enter of kernel address {va}", space.id());
        }

        loop {
            {
                let mut pv = self.pv.write();
                let _pin = Pinned::new(&self.machine);
                let mut state = space.state.lock();
                if let Entered::Done = self.enter_locked(space, &mut state, &mut pv, request)? {
                    return Ok(());
                }
            }
            if !may_block || !self.supplier.wait() {
                debug!("{}: no page-table page to map {va}", space.id());
                return Err(PmapError::ResourceShortage);
            }
        }
    }

    fn enter_locked(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        request: Request<'_>,
    ) -> Result<Entered, PmapError> {
        let Request {
            va,
            m,
            access,
            prot,
            wired,
        } = request;

        let held = if space.is_kernel() {
            if self.pde(space, va).load().superpage() {
                self.demote_pde(space, state, pv, va);
            }
            false
        } else {
            if self.allocpte(space, state, pv, va).is_none() {
                return Ok(Entered::NeedPage);
            }
            true
        };
        let Some(slot) = self.pte(space, va) else {
            panic!("{}: no page table for {va}", space.id());
        };

        let pa = m.pa();
        let mut origpte = slot.load();
        let same = origpte.present() && origpte.phys() == pa;

        // Reclaiming may take the old mapping at `va` away, so the entry is
        // read again afterwards.
        let new_pv = if m.is_managed() && !same {
            let Some(entry) = self.get_pv_entry(space, state, pv, va, false) else {
                if held {
                    self.drop_pt_hold(space, state, va);
                }
                warn!("{}: no pv entry to map {va}", space.id());
                return Err(PmapError::ResourceShortage);
            };
            origpte = slot.load();
            Some(entry)
        } else {
            None
        };

        if same {
            if wired && !origpte.wired() {
                state.stats.wired += 1;
            } else if !wired && origpte.wired() {
                state.stats.wired -= 1;
            }
            if held {
                release_hold(state, va);
            }
        } else {
            if origpte.present() {
                if origpte.wired() {
                    state.stats.wired -= 1;
                }
                if held {
                    release_hold(state, va);
                }
                if origpte.managed() {
                    let om = self.page_of(origpte.phys());
                    self.pvh_free(state, pv, ListKey::page(om), space, va);
                }
            } else {
                state.stats.resident += 1;
            }
            if wired {
                state.stats.wired += 1;
            }
            if let Some(entry) = new_pv {
                pv.link(ListKey::page(m), entry);
            }
        }

        let mut newpte = PtEntry::new()
            .with_present(true)
            .with_page(m.phys())
            .with_cache(self.pat.bits(m.memattr()))
            .with_managed(m.is_managed())
            .with_wired(wired);
        if prot.write() {
            newpte.set_writable(true);
            if m.is_managed() {
                m.set_writeable();
            }
        }
        if is_user_address(va) {
            newpte.set_user(true);
        } else {
            newpte.set_global(self.pgeflag);
        }

        if origpte.with_accessed(false).with_dirty(false) != newpte {
            newpte = newpte.with_accessed(true).with_dirty(access.write());
            if origpte.present() {
                let old = slot.swap(newpte);
                self.retire_replaced(space, pv, va, old, pa, prot);
            } else {
                slot.store(newpte);
            }
        }

        // Kernel page tables keep no wire count; a table filled upwards
        // shows a hole in its last slots first.
        let full = if space.is_kernel() {
            self.table(self.pde(space, va).load().table_page())
                .slots()
                .rev()
                .all(|slot| slot.load().present())
        } else {
            state
                .ptps
                .lookup(va)
                .is_some_and(|ptp| ptp.wire_count == NPTEPG as u32)
        };
        if full && self.pg_ps_enabled && !m.is_fictitious() {
            self.promote_pde(space, state, pv, va);
        }
        Ok(Entered::Done)
    }

    /// Account for the entry `old` that a new entry for `pa` just replaced,
    /// and invalidate it if some CPU may still use it wrongly.
    fn retire_replaced(
        &self,
        space: &AddressSpace,
        pv: &PvState,
        va: VirtualAddress,
        old: PtEntry,
        pa: PhysicalAddress,
        prot: Prot,
    ) {
        let om = old.managed().then(|| self.page_of(old.phys()));
        let mut invalidate = false;
        if old.accessed() {
            if let Some(om) = om {
                om.set_referenced();
            }
            invalidate |= old.phys() != pa;
        }
        if old.dirty() && old.writable() {
            if let Some(om) = om {
                om.mark_dirty();
            }
            invalidate |= !prot.write();
        }
        if let Some(om) = om {
            self.clear_writeable_if_unmapped(pv, om);
        }
        if invalidate {
            self.invalidate_page(space, va);
        }
    }

    /// Find or create the user page table for `va`, taking a reference to
    /// it. A superpage in the way is demoted first. `None` if a new page
    /// table was needed and the supplier had none.
    fn allocpte(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        va: VirtualAddress,
    ) -> Option<PhysicalPage<Size4K>> {
        if self.pde(space, va).load().superpage() {
            // On failure the superpage is gone and a table is installed below.
            self.demote_pde(space, state, pv, va);
        }
        if self.pde(space, va).load().present() {
            return Some(state.ptps.hold(va));
        }
        self.install_ptp(space, state, va)
    }

    /// Allocate, zero and install a user page table for `va` with one
    /// reference.
    fn install_ptp(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        va: VirtualAddress,
    ) -> Option<PhysicalPage<Size4K>> {
        let page = self
            .supplier
            .alloc_page(pde_index(va) as u32, AllocFlags::page_table())?
            .phys();
        zero_table(self.machine.memory(), page);
        state.stats.resident += 1;
        state.ptps.insert(va, PageTablePage::new(page, 1));
        self.pde(space, va).store(PdEntry::table(page, true));
        Some(page)
    }

    /// Give back a page-table reference taken for a mapping that was not
    /// made after all.
    fn drop_pt_hold(&self, space: &AddressSpace, state: &mut SpaceState, va: VirtualAddress) {
        let mut free = FreeList::new();
        if self.unuse_pt(space, state, va, &mut free) {
            self.invalidate_page(space, va);
        }
        free.release(&self.supplier);
    }

    /// Map `m` read-only at `va` if that is possible right away: never
    /// sleeps, never reclaims, never replaces an existing mapping, and
    /// silently does nothing otherwise. Without PAE there is no
    /// no-execute bit, so `_prot` does not change the entry.
    pub fn enter_quick(&self, space: &AddressSpace, va: VirtualAddress, m: &VmPage, _prot: Prot) {
        let va = va.align_down::<Size4K>();
        let mut pv = self.pv.write();
        let _pin = Pinned::new(&self.machine);
        let mut state = space.state.lock();

        let user = is_user_address(va);
        if user {
            let pde = self.pde(space, va).load();
            if pde.superpage() {
                return;
            }
            if pde.present() {
                state.ptps.hold(va);
            } else if self.install_ptp(space, &mut state, va).is_none() {
                return;
            }
        }
        let Some(slot) = self.pte(space, va) else {
            return;
        };
        if slot.load().present()
            || (m.is_managed() && !self.try_insert_pv_entry(space, &mut state, &mut pv, va, m))
        {
            if user {
                self.drop_pt_hold(space, &mut state, va);
            }
            return;
        }

        state.stats.resident += 1;
        slot.store(
            PtEntry::new()
                .with_present(true)
                .with_page(m.phys())
                .with_cache(self.pat.bits(m.memattr()))
                .with_managed(m.is_managed())
                .with_user(user),
        );
    }
}

/// Undo the reference [`Pmap::allocpte`] took when the mapping at `va`
/// already existed.
fn release_hold(state: &mut SpaceState, va: VirtualAddress) {
    if let Some(ptp) = state.ptps.lookup_mut(va) {
        ptp.wire_count -= 1;
    }
}
