//! Address-space creation, release and activation, and kernel page-table
//! growth.

use super::{Pmap, zero_table};
use crate::address_space::AddressSpace;
use crate::cpuset::CpuSet;
use crate::error::PmapError;
use crate::platform::{Critical, Machine};
use crate::ptp::{PageTablePage, pde_index};
use crate::pte::PdEntry;
use crate::supplier::{AllocFlags, PageSupplier};
use alloc::sync::Arc;
use kernel_info::memory::{KPTDI, NBPDR, NKPDE, VM_MAX_KERNEL_ADDRESS};
use kernel_memory_addresses::{Size4M, VirtualAddress};
use log::{debug, info, warn};

impl<M: Machine, S: PageSupplier> Pmap<M, S> {
    /// Create an empty user address space sharing the kernel mappings.
    ///
    /// Sleeps in the supplier until a directory page is available.
    ///
    /// # Errors
    /// [`PmapError::ResourceShortage`] if the supplier reports that waiting
    /// cannot produce a page.
    pub fn create(&self) -> Result<Arc<AddressSpace>, PmapError> {
        let m = loop {
            if let Some(m) = self
                .supplier
                .alloc_page(0, AllocFlags::page_table().with_may_block(true))
            {
                break m;
            }
            if !self.supplier.wait() {
                warn!("pmap: no page for a new page directory");
                return Err(PmapError::ResourceShortage);
            }
        };
        if !m.is_zeroed() {
            self.zero_page(m);
        }

        let space = Arc::new(AddressSpace::new(
            self.next_space_id(),
            m.phys(),
            CpuSet::EMPTY,
        ));
        let kernel_dir = self.directory(&self.kernel);
        let dir = self.directory(&space);
        self.registry.insert_with(Arc::clone(&space), |_| {
            for i in KPTDI..KPTDI + NKPDE {
                dir.slot(i).store(kernel_dir.slot(i).load());
            }
        });
        debug!("{}: created, directory {}", space.id(), space.directory());
        Ok(space)
    }

    /// Release a user address space once every mapping in it is gone.
    ///
    /// # Panics
    /// If `space` is the kernel space, still has resident pages, page
    /// tables or reverse-mapping chunks, or is active on some CPU.
    pub fn release(&self, space: Arc<AddressSpace>) {
        assert!(!space.is_kernel(), "release of the kernel address space");
        {
            let state = space.state.lock();
            assert_eq!(
                state.stats.resident, 0,
                "release of {} with resident pages",
                space.id()
            );
            assert!(
                state.ptps.is_empty(),
                "release of {} with page tables",
                space.id()
            );
            assert!(
                state.pv_chunks.is_empty(),
                "release of {} with pv chunks",
                space.id()
            );
        }
        assert!(
            space.active_cpus().is_empty(),
            "release of {} active on {:?}",
            space.id(),
            space.active_cpus()
        );

        self.registry.remove(space.id());
        let m = self.page_of(space.directory().base());
        m.set_zeroed(false);
        self.supplier.free_page(m);
        debug!("{}: released", space.id());
    }

    /// Make `space` the current address space of the calling CPU.
    pub fn activate(&self, space: &Arc<AddressSpace>) {
        let _critical = Critical::new(&self.machine);
        let cpu = self.machine.current_cpu();
        let mut current = self.current[cpu.index()].lock();
        if !current.is_kernel() {
            current.active().remove(cpu);
        }
        if !space.is_kernel() {
            space.active().insert(cpu);
        }
        self.machine.load_cr3(space.directory().base());
        *current = Arc::clone(space);
    }

    /// The address space loaded on the calling CPU.
    #[must_use]
    pub fn current(&self) -> Arc<AddressSpace> {
        let _critical = Critical::new(&self.machine);
        let cpu = self.machine.current_cpu();
        Arc::clone(&self.current[cpu.index()].lock())
    }

    /// Extend the kernel page tables to cover every address below `addr`,
    /// installing each new page table in all directories.
    ///
    /// # Errors
    /// [`PmapError::ResourceShortage`] if no page-table page is available.
    /// Growth achieved before the failure is kept.
    pub fn growkernel(&self, addr: VirtualAddress) -> Result<(), PmapError> {
        let mut growth = self.growth.lock();
        let target = addr
            .align_up::<Size4M>()
            .min(VirtualAddress::new(VM_MAX_KERNEL_ADDRESS));
        while growth.vm_end < target {
            let va = growth.vm_end;
            if !self.pde(&self.kernel, va).load().present() {
                let Some(m) = self
                    .supplier
                    .alloc_page(pde_index(va) as u32, AllocFlags::page_table())
                else {
                    warn!("pmap: kernel growth stopped at {va}, no page-table page");
                    return Err(PmapError::ResourceShortage);
                };
                zero_table(self.machine.memory(), m.phys());
                self.kernel
                    .state
                    .lock()
                    .ptps
                    .insert(va, PageTablePage::new(m.phys(), 0));
                self.store_kernel_pde(va, PdEntry::table(m.phys(), false));
                growth.nkpt += 1;
            }
            growth.vm_end = va + NBPDR;
        }
        info!(
            "pmap: kernel page tables cover up to {} ({} pages)",
            growth.vm_end, growth.nkpt
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::config::PmapConfig;
    use crate::cpuset::CpuId;
    use crate::platform::Machine as _;
    use crate::prot::Prot;
    use kernel_info::memory::{KPTDI, NBPDR, NKPDE, VM_MAX_KERNEL_ADDRESS};
    use kernel_memory_addresses::VirtualAddress;

    #[test]
    fn new_space_shares_kernel_slots() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = pmap.create().unwrap();
        let kdir = pmap.directory(pmap.kernel());
        let udir = pmap.directory(&space);
        assert_eq!(udir.slot(KPTDI).load(), kdir.slot(KPTDI).load());
        assert!(udir.slot(0).load().is_zero());
        assert_eq!(space.resident_count(), 0);
        assert_eq!(pmap.space_count(), 2);
    }

    #[test]
    fn release_returns_the_directory() {
        let pmap = pmap_with(1, PmapConfig::default());
        let free = pmap.supplier().free_count();
        let space = pmap.create().unwrap();
        let dir = space.directory();
        pmap.release(space);
        assert!(pmap.supplier().is_free(dir));
        assert_eq!(pmap.supplier().free_count(), free);
        assert_eq!(pmap.space_count(), 1);
    }

    #[test]
    #[should_panic(expected = "resident pages")]
    fn release_of_populated_space_panics() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = pmap.create().unwrap();
        let m = page(&pmap);
        pmap.enter(&space, va(0x1000), m, Prot::READ, Prot::READ, false)
            .unwrap();
        pmap.release(space);
    }

    #[test]
    #[should_panic(expected = "active on")]
    fn release_of_active_space_panics() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = user_space(&pmap);
        pmap.release(space);
    }

    #[test]
    fn activate_moves_the_cpu_between_active_sets() {
        let pmap = pmap_with(2, PmapConfig::default());
        let a = pmap.create().unwrap();
        let b = pmap.create().unwrap();
        pmap.machine().run_on(CpuId::new(1), || {
            pmap.activate(&a);
            assert_eq!(pmap.current().id(), a.id());
            pmap.activate(&b);
        });
        assert!(a.active_cpus().is_empty());
        assert!(b.active_cpus().contains(CpuId::new(1)));
        assert_eq!(pmap.machine().cr3(CpuId::new(1)), b.directory().base());
        pmap.machine()
            .run_on(CpuId::new(1), || pmap.activate(pmap.kernel()));
        assert!(b.active_cpus().is_empty());
        assert_eq!(pmap.kernel().active_cpus(), pmap.machine().all_cpus());
    }

    #[test]
    fn growth_reaches_existing_and_later_spaces() {
        let pmap = pmap_with(1, PmapConfig::default());
        let early = pmap.create().unwrap();
        let end = pmap.kernel_vm_end();
        let tables = pmap.kernel_page_tables();
        pmap.growkernel(end + NBPDR + 1).unwrap();
        assert_eq!(pmap.kernel_vm_end(), end + 2 * NBPDR);
        assert_eq!(pmap.kernel_page_tables(), tables + 2);

        let late = pmap.create().unwrap();
        for space in [&early, &late] {
            let pde = pmap.pde(space, end + NBPDR).load();
            assert!(pde.present());
            assert_eq!(pde, pmap.pde(pmap.kernel(), end + NBPDR).load());
        }
    }

    #[test]
    fn growth_stops_at_the_kernel_limit() {
        let pmap = pmap_with(1, PmapConfig::default());
        pmap.growkernel(VirtualAddress::new(0xFFFF_F000)).unwrap();
        assert_eq!(pmap.kernel_vm_end().as_u32(), VM_MAX_KERNEL_ADDRESS);
        assert_eq!(pmap.kernel_page_tables(), NKPDE);
    }

    #[test]
    fn growth_failure_is_reported() {
        let pmap = pmap_with(1, PmapConfig::default());
        let end = pmap.kernel_vm_end();
        pmap.supplier().fail_next(1);
        assert!(pmap.growkernel(end + 1).is_err());
        assert_eq!(pmap.kernel_vm_end(), end);
    }

    #[test]
    fn create_waits_for_pages() {
        let pmap = pmap_with(1, PmapConfig::default());
        pmap.supplier().fail_next(3);
        assert!(pmap.create().is_ok());
        pmap.supplier().set_exhausted(true);
        assert!(pmap.create().is_err());
    }
}
