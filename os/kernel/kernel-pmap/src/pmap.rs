//! # The translation manager
//!
//! [`Pmap`] owns the kernel address space, the registry of all spaces, the
//! reverse-mapping state and the per-CPU temporary windows, and implements
//! every mapping operation on top of a [`Machine`] and a [`PageSupplier`].
//!
//! ## Locking
//!
//! Three levels, always acquired in this order:
//!
//! 1. the global reverse-mapping lock ([`Pmap::pv`], write side),
//! 2. address-space locks, by ascending [`AsId`] when more than one is held
//!    (reclamation uses `try_lock` for lower ids),
//! 3. the registry lock and the window locks, innermost.
//!
//! TLB shootdowns are issued with locks held; the emulated and real IPI
//! handlers never take any of them.
//!
//! ## Page tables
//!
//! Directories and page tables are reached through [`PhysMemory`], so the
//! manager reads exactly what the MMU reads. Kernel directory slots are
//! replicated into every directory; [`Pmap::store_kernel_pde`] applies a
//! change to all of them under the registry lock.

mod attr;
mod enter;
mod kernel;
mod lifecycle;
mod protect;
mod pv_alloc;
mod query;
mod remove;
mod superpage;
mod tlb;
mod windows;

#[cfg(test)]
mod testing;

use crate::address_space::{AddressSpace, AsId};
use crate::cache::PatLayout;
use crate::config::PmapConfig;
use crate::cpuset::CpuId;
use crate::error::PmapError;
use crate::platform::{Machine, PhysMemory};
use crate::ptp::{PageTablePage, pde_index, pte_index};
use crate::pte::{PageDirectory, PageTable, PdEntry, PtEntry, Slot, Table};
use crate::pv::{NPCPV, PvState};
use crate::registry::Registry;
use crate::stats::PmapStats;
use crate::supplier::{AllocFlags, PageSupplier, VmPage};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::memory::{KERNBASE, NBPDR, NKPT, PAGE_SIZE, PDRMASK, VM_MAX_KERNEL_ADDRESS};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::{RwSpinLock, SpinMutex};
use log::{debug, info};
use windows::SysMaps;

/// Extent of the kernel page tables.
struct KernelGrowth {
    /// End (exclusive) of the kernel range backed by page tables.
    vm_end: VirtualAddress,
    /// Kernel page-table pages installed.
    nkpt: usize,
}

/// The machine-dependent virtual memory layer.
pub struct Pmap<M: Machine, S: PageSupplier> {
    machine: M,
    supplier: S,
    config: PmapConfig,
    stats: PmapStats,
    pat: PatLayout,
    /// Superpages are both configured and supported.
    pg_ps_enabled: bool,
    /// Kernel mappings carry the global bit.
    pgeflag: bool,
    kernel: Arc<AddressSpace>,
    registry: Registry,
    pv: RwSpinLock<PvState>,
    sysmaps: Vec<SysMaps>,
    /// The address space loaded on each CPU.
    current: Vec<SpinMutex<Arc<AddressSpace>>>,
    growth: SpinMutex<KernelGrowth>,
    /// First kernel address not claimed by the manager itself.
    virtual_avail: VirtualAddress,
    next_id: AtomicU32,
}

impl<M: Machine, S: PageSupplier> Pmap<M, S> {
    /// Build the kernel address space and bring up paging on every CPU.
    ///
    /// Claims, from [`KERNBASE`] upwards, two temporary-window pages per CPU
    /// and the virtual range for reverse-mapping chunks, sized from the
    /// configured entry budget.
    ///
    /// # Errors
    /// [`PmapError::ResourceShortage`] if the supplier cannot provide the
    /// initial page directory and page tables.
    pub fn bootstrap(machine: M, supplier: S, config: PmapConfig) -> Result<Self, PmapError> {
        let features = machine.features();
        let cpus = machine.cpu_count();
        let pat = PatLayout::new(features.pat_works);

        let directory = supplier
            .alloc_page(0, AllocFlags::page_table())
            .ok_or(PmapError::ResourceShortage)?
            .phys();
        zero_table(machine.memory(), directory);
        let kernel = Arc::new(AddressSpace::new(
            AsId::KERNEL,
            directory,
            machine.all_cpus(),
        ));

        {
            let mut state = kernel.state.lock();
            let dir: PageDirectory<'_> = Table::new(machine.memory().words(directory));
            for i in 0..NKPT {
                let va = VirtualAddress::new(KERNBASE) + (i as u32) * NBPDR;
                let ptp = supplier
                    .alloc_page(pde_index(va) as u32, AllocFlags::page_table())
                    .ok_or(PmapError::ResourceShortage)?
                    .phys();
                zero_table(machine.memory(), ptp);
                dir.slot(pde_index(va)).store(PdEntry::table(ptp, false));
                state.ptps.insert(va, PageTablePage::new(ptp, 0));
            }
        }

        let window_base = VirtualAddress::new(KERNBASE);
        let sysmaps = (0..cpus)
            .map(|cpu| SysMaps::new(window_base + (2 * cpu as u32) * PAGE_SIZE))
            .collect();
        let chunk_base = window_base + (2 * cpus as u32) * PAGE_SIZE;
        let entry_max = config.pv_budget(supplier.page_count());
        let room = (VM_MAX_KERNEL_ADDRESS - chunk_base.as_u32()) / PAGE_SIZE / 2;
        let max_chunks = entry_max.div_ceil(NPCPV as u32).min(room);
        let virtual_avail = chunk_base + max_chunks * PAGE_SIZE;
        let pv = PvState::new(
            supplier.page_count(),
            supplier.phys_end(),
            chunk_base,
            max_chunks,
            entry_max,
        );

        let current = (0..cpus)
            .map(|_| SpinMutex::new(Arc::clone(&kernel)))
            .collect();

        let pmap = Self {
            pg_ps_enabled: config.superpages_enabled() && features.pse,
            pgeflag: config.use_global_pages() && features.pge,
            machine,
            supplier,
            config,
            stats: PmapStats::default(),
            pat,
            kernel: Arc::clone(&kernel),
            registry: Registry::new(),
            pv: RwSpinLock::new(pv),
            sysmaps,
            current,
            growth: SpinMutex::new(KernelGrowth {
                vm_end: VirtualAddress::new(KERNBASE) + (NKPT as u32) * NBPDR,
                nkpt: NKPT,
            }),
            virtual_avail,
            next_id: AtomicU32::new(AsId::KERNEL.as_u32() + 1),
        };
        pmap.registry.insert_with(kernel, |_| {});
        pmap.growkernel(virtual_avail + PAGE_SIZE)?;
        pmap.stats
            .pv_entry_high_water
            .add(u64::from(pmap.pv.read().high_water));

        let root = directory.base();
        let pat_value = pat.msr_value();
        let program_pat = features.pat;
        let noop = |_: CpuId| {};
        let load = |_: CpuId| {
            pmap.machine.load_cr3(root);
            if program_pat {
                pmap.machine.set_pat(pat_value);
            }
        };
        pmap.machine
            .rendezvous(pmap.machine.all_cpus(), &noop, &load, &noop);

        info!(
            "pmap: {cpus} cpus, directory at {root}, {} pv entries in {max_chunks} chunks, superpages {}",
            entry_max,
            if pmap.pg_ps_enabled { "on" } else { "off" }
        );
        debug!("pmap: chunk range at {chunk_base}, virtual_avail {virtual_avail}");
        Ok(pmap)
    }

    #[inline]
    #[must_use]
    pub const fn machine(&self) -> &M {
        &self.machine
    }

    #[inline]
    #[must_use]
    pub const fn supplier(&self) -> &S {
        &self.supplier
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &PmapConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub const fn stats(&self) -> &PmapStats {
        &self.stats
    }

    /// The kernel address space.
    #[inline]
    #[must_use]
    pub const fn kernel(&self) -> &Arc<AddressSpace> {
        &self.kernel
    }

    /// First kernel virtual address left for the rest of the kernel.
    #[inline]
    #[must_use]
    pub const fn virtual_avail(&self) -> VirtualAddress {
        self.virtual_avail
    }

    /// End of the kernel range currently backed by page tables.
    #[must_use]
    pub fn kernel_vm_end(&self) -> VirtualAddress {
        self.growth.lock().vm_end
    }

    /// Kernel page-table pages installed so far.
    #[must_use]
    pub fn kernel_page_tables(&self) -> usize {
        self.growth.lock().nkpt
    }

    /// Registered address spaces, the kernel's included.
    #[must_use]
    pub fn space_count(&self) -> usize {
        self.registry.len()
    }

    /// Live reverse-mapping entries.
    #[must_use]
    pub fn pv_entry_count(&self) -> u32 {
        self.pv.read().entry_count
    }

    /// The reverse-mapping entry budget.
    #[must_use]
    pub fn pv_entry_max(&self) -> u32 {
        self.pv.read().entry_max
    }

    /// Whether superpage promotion is in effect.
    #[inline]
    #[must_use]
    pub const fn superpages_enabled(&self) -> bool {
        self.pg_ps_enabled
    }

    /// The PAT layout used to encode memory attributes.
    #[inline]
    #[must_use]
    pub const fn pat_layout(&self) -> PatLayout {
        self.pat
    }

    fn next_space_id(&self) -> AsId {
        AsId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn directory(&self, space: &AddressSpace) -> PageDirectory<'_> {
        Table::new(self.machine.memory().words(space.directory()))
    }

    pub(crate) fn table(&self, page: PhysicalPage<Size4K>) -> PageTable<'_> {
        Table::new(self.machine.memory().words(page))
    }

    /// The directory slot covering `va`.
    pub(crate) fn pde(&self, space: &AddressSpace, va: VirtualAddress) -> Slot<'_, PdEntry> {
        self.directory(space).slot(pde_index(va))
    }

    /// The page-table slot for `va`, or `None` if no page table covers it
    /// (empty slot or superpage).
    pub(crate) fn pte(&self, space: &AddressSpace, va: VirtualAddress) -> Option<Slot<'_, PtEntry>> {
        let pde = self.pde(space, va).load();
        if !pde.present() || pde.superpage() {
            return None;
        }
        Some(self.table(pde.table_page()).slot(pte_index(va)))
    }

    /// The kernel page-table slot for `va`.
    ///
    /// # Panics
    /// If `va` is outside the kernel range backed by page tables.
    pub(crate) fn kernel_pte(&self, va: VirtualAddress) -> Slot<'_, PtEntry> {
        match self.pte(&self.kernel, va) {
            Some(slot) => slot,
            None => panic!("no kernel page table for {va}"),
        }
    }

    /// Replace the kernel directory slot for `va` in every directory.
    pub(crate) fn store_kernel_pde(&self, va: VirtualAddress, pde: PdEntry) {
        let index = pde_index(va);
        self.registry
            .for_each(|space| self.directory(space).slot(index).store(pde));
    }

    /// Store a directory entry of `space`, replicating kernel slots.
    pub(crate) fn store_pde(&self, space: &AddressSpace, va: VirtualAddress, pde: PdEntry) {
        if space.is_kernel() {
            self.store_kernel_pde(va, pde);
        } else {
            self.pde(space, va).store(pde);
        }
    }

    /// Compare-and-swap a directory entry of `space`. Kernel slots are
    /// swapped in the kernel directory and then copied everywhere.
    pub(crate) fn compare_exchange_pde(
        &self,
        space: &AddressSpace,
        va: VirtualAddress,
        current: PdEntry,
        new: PdEntry,
    ) -> bool {
        if self.pde(space, va).compare_exchange(current, new).is_err() {
            return false;
        }
        if space.is_kernel() {
            self.store_kernel_pde(va, new);
        }
        true
    }

    /// Metadata of the page at `pa`, which a managed mapping points to.
    ///
    /// # Panics
    /// If `pa` has no metadata record.
    pub(crate) fn page_of(&self, pa: PhysicalAddress) -> &VmPage {
        match self.supplier.page(pa) {
            Some(m) => m,
            None => panic!("managed mapping of {pa} without a page record"),
        }
    }

    /// A registered address space.
    ///
    /// # Panics
    /// If `id` is not registered: a reverse mapping outlived its space.
    pub(crate) fn space(&self, id: AsId) -> Arc<AddressSpace> {
        match self.registry.get(id) {
            Some(space) => space,
            None => panic!("reverse mapping names unregistered {id}"),
        }
    }
}

/// Next 4 MiB boundary above `va`, or `eva` when the address space ends
/// first.
fn next_pde_boundary(va: VirtualAddress, eva: VirtualAddress) -> VirtualAddress {
    VirtualAddress::new(va.as_u32() & !PDRMASK)
        .checked_add(NBPDR)
        .unwrap_or(eva)
}

/// Zero a page-table page directly through physical memory.
fn zero_table(memory: &impl PhysMemory, page: PhysicalPage<Size4K>) {
    for word in memory.words(page) {
        word.store(0, Ordering::Relaxed);
    }
}
