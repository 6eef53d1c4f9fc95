use super::memory::EmulatedMemory;
use crate::cpuset::{CpuId, CpuSet};
use crate::platform::{
    Access, CpuFeatures, Machine, PageFault, PhysMemory, RendezvousFn, TlbRequest,
};
use crate::pte::{PageDirectory, PageTable, PtEntry};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::cell::Cell;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use kernel_info::memory::{PAGE_SHIFT, PDRMASK, PDRSHIFT};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::SpinMutex;

std::thread_local! {
    static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
    static PIN_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// A cached translation.
#[derive(Copy, Clone, Debug)]
struct Cached {
    base: u32,
    writable: bool,
    dirty: bool,
    global: bool,
}

#[derive(Default)]
struct Tlb {
    /// Keyed by 4 KiB page number.
    small: BTreeMap<u32, Cached>,
    /// Keyed by directory slot.
    large: BTreeMap<u32, Cached>,
}

impl Tlb {
    fn has_small_in(&self, pdi: u32) -> bool {
        let first = pdi << (PDRSHIFT - PAGE_SHIFT);
        let last = first | ((1 << (PDRSHIFT - PAGE_SHIFT)) - 1);
        self.small.range(first..=last).next().is_some()
    }

    fn flush_page(&mut self, va: VirtualAddress) {
        self.small.remove(&(va.as_u32() >> PAGE_SHIFT));
        self.large.remove(&(va.as_u32() >> PDRSHIFT));
    }

    fn flush_non_global(&mut self) {
        self.small.retain(|_, c| c.global);
        self.large.retain(|_, c| c.global);
    }

    fn flush_all(&mut self) {
        self.small.clear();
        self.large.clear();
    }
}

struct EmulatedCpu {
    cr3: AtomicU32,
    pat: AtomicU64,
    tlb: SpinMutex<Tlb>,
    cache_flushes: AtomicU64,
}

/// Event counters of the emulated TLBs and interconnect.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct TlbCounters {
    /// Translations served while a 4 KiB and a 4 MiB entry covered the same
    /// region in one TLB.
    pub size_conflicts: u64,
    pub ipis: u64,
    pub rendezvous: u64,
    pub line_flushes: u64,
    pub fences: u64,
}

/// Emulated multiprocessor with paging.
pub struct EmulatedMachine {
    memory: EmulatedMemory,
    features: CpuFeatures,
    cpus: Vec<EmulatedCpu>,
    size_conflicts: AtomicU64,
    ipis: AtomicU64,
    rendezvous: AtomicU64,
    line_flushes: AtomicU64,
    fences: AtomicU64,
}

/// Restores the previous CPU identity of the host thread on drop.
struct Identity(usize);

impl Identity {
    fn enter(cpu: CpuId) -> Self {
        Self(CURRENT_CPU.with(|c| c.replace(cpu.index())))
    }
}

impl Drop for Identity {
    fn drop(&mut self) {
        CURRENT_CPU.with(|c| c.set(self.0));
    }
}

impl EmulatedMachine {
    /// A machine with `cpus` processors and `frames` pages of memory.
    #[must_use]
    pub fn new(cpus: usize, frames: usize, features: CpuFeatures) -> Self {
        assert!(cpus > 0, "a machine needs a processor");
        Self {
            memory: EmulatedMemory::new(frames),
            features,
            cpus: (0..cpus)
                .map(|_| EmulatedCpu {
                    cr3: AtomicU32::new(0),
                    pat: AtomicU64::new(0),
                    tlb: SpinMutex::new(Tlb::default()),
                    cache_flushes: AtomicU64::new(0),
                })
                .collect(),
            size_conflicts: AtomicU64::new(0),
            ipis: AtomicU64::new(0),
            rendezvous: AtomicU64::new(0),
            line_flushes: AtomicU64::new(0),
            fences: AtomicU64::new(0),
        }
    }

    /// Features of a modern processor that needs no cache flushing.
    #[must_use]
    pub const fn modern_features() -> CpuFeatures {
        CpuFeatures {
            pse: true,
            pge: true,
            pat: true,
            pat_works: true,
            self_snoop: true,
            clflush_line: Some(64),
        }
    }

    /// Run `f` as `cpu` on the calling thread.
    ///
    /// # Panics
    /// If the calling thread is pinned to its current CPU.
    pub fn run_on<R>(&self, cpu: CpuId, f: impl FnOnce() -> R) -> R {
        assert!(
            PIN_DEPTH.with(Cell::get) == 0,
            "cannot migrate a pinned thread"
        );
        assert!(cpu.index() < self.cpus.len(), "{cpu} does not exist");
        let _identity = Identity::enter(cpu);
        f()
    }

    /// Load the word at `va` through the current CPU's MMU.
    ///
    /// # Errors
    /// The page fault the access would raise.
    pub fn read_u32(&self, va: VirtualAddress) -> Result<u32, PageFault> {
        self.translate(va, Access::Read)
            .map(|pa| self.memory.read_u32(pa))
    }

    /// Store `value` at `va` through the current CPU's MMU.
    ///
    /// # Errors
    /// The page fault the access would raise.
    pub fn write_u32(&self, va: VirtualAddress, value: u32) -> Result<(), PageFault> {
        self.translate(va, Access::Write)
            .map(|pa| self.memory.write_u32(pa, value))
    }

    #[must_use]
    pub fn cr3(&self, cpu: CpuId) -> PhysicalAddress {
        PhysicalAddress::new(self.cpus[cpu.index()].cr3.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn pat(&self, cpu: CpuId) -> u64 {
        self.cpus[cpu.index()].pat.load(Ordering::Acquire)
    }

    /// Whether `cpu`'s TLB holds any translation for `va`.
    #[must_use]
    pub fn tlb_cached(&self, cpu: CpuId, va: VirtualAddress) -> bool {
        let tlb = self.cpus[cpu.index()].tlb.lock();
        tlb.small.contains_key(&(va.as_u32() >> PAGE_SHIFT))
            || tlb.large.contains_key(&(va.as_u32() >> PDRSHIFT))
    }

    /// Full cache write-back-invalidates executed by `cpu`.
    #[must_use]
    pub fn cache_flushes(&self, cpu: CpuId) -> u64 {
        self.cpus[cpu.index()].cache_flushes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn counters(&self) -> TlbCounters {
        TlbCounters {
            size_conflicts: self.size_conflicts.load(Ordering::Relaxed),
            ipis: self.ipis.load(Ordering::Relaxed),
            rendezvous: self.rendezvous.load(Ordering::Relaxed),
            line_flushes: self.line_flushes.load(Ordering::Relaxed),
            fences: self.fences.load(Ordering::Relaxed),
        }
    }

    fn cpu(&self) -> &EmulatedCpu {
        &self.cpus[self.current_cpu().index()]
    }

    /// Page walk on the current CPU, setting accessed and dirty bits.
    fn walk(&self, tlb: &mut Tlb, va: VirtualAddress, access: Access) -> Result<PhysicalAddress, PageFault> {
        let write = access == Access::Write;
        let fault = |protection| PageFault {
            va,
            access,
            protection,
        };
        let pdi = va.as_u32() >> PDRSHIFT;
        let cr3 = PhysicalAddress::new(self.cpu().cr3.load(Ordering::Acquire));
        let directory = PageDirectory::new(self.memory.words(PhysicalPage::from_addr(cr3)));
        let pde_slot = directory.slot(pdi as usize);

        loop {
            let pde = pde_slot.load();
            if !pde.present() {
                return Err(fault(false));
            }
            if !pde.superpage() {
                break;
            }
            if write && !pde.writable() {
                return Err(fault(true));
            }
            let updated = pde.with_accessed(true).with_dirty(pde.dirty() || write);
            if updated != pde && pde_slot.compare_exchange(pde, updated).is_err() {
                continue;
            }
            let base = updated.superpage_frame().base().as_u32();
            tlb.large.insert(
                pdi,
                Cached {
                    base,
                    writable: updated.writable(),
                    dirty: updated.dirty(),
                    global: updated.global(),
                },
            );
            if tlb.has_small_in(pdi) {
                self.size_conflicts.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(PhysicalAddress::new(base | (va.as_u32() & PDRMASK)));
        }

        let table: PageTable<'_> =
            PageTable::new(self.memory.words(pde_slot.load().table_page()));
        let pte_slot = table.slot(((va.as_u32() >> PAGE_SHIFT) & 0x3FF) as usize);
        loop {
            let pte: PtEntry = pte_slot.load();
            if !pte.present() {
                return Err(fault(false));
            }
            if write && !pte.writable() {
                return Err(fault(true));
            }
            let updated = pte.with_accessed(true).with_dirty(pte.dirty() || write);
            if updated != pte && pte_slot.compare_exchange(pte, updated).is_err() {
                continue;
            }
            tlb.small.insert(
                va.as_u32() >> PAGE_SHIFT,
                Cached {
                    base: updated.phys().as_u32(),
                    writable: updated.writable(),
                    dirty: updated.dirty(),
                    global: updated.global(),
                },
            );
            if tlb.large.contains_key(&pdi) {
                self.size_conflicts.fetch_add(1, Ordering::Relaxed);
            }
            return Ok(updated.phys() + va.offset::<Size4K>());
        }
    }
}

impl Machine for EmulatedMachine {
    type Memory = EmulatedMemory;

    fn memory(&self) -> &EmulatedMemory {
        &self.memory
    }

    fn features(&self) -> CpuFeatures {
        self.features
    }

    fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    fn current_cpu(&self) -> CpuId {
        CpuId::new(CURRENT_CPU.with(Cell::get))
    }

    fn sched_pin(&self) {
        PIN_DEPTH.with(|d| d.set(d.get() + 1));
    }

    fn sched_unpin(&self) {
        PIN_DEPTH.with(|d| {
            assert!(d.get() > 0, "unpin without pin");
            d.set(d.get() - 1);
        });
    }

    fn critical_enter(&self) {
        self.sched_pin();
    }

    fn critical_exit(&self) {
        self.sched_unpin();
    }

    fn load_cr3(&self, directory: PhysicalAddress) {
        let cpu = self.cpu();
        cpu.cr3.store(directory.as_u32(), Ordering::Release);
        cpu.tlb.lock().flush_non_global();
    }

    fn set_pat(&self, value: u64) {
        self.cpu().pat.store(value, Ordering::Release);
    }

    fn invalidate_local(&self, request: TlbRequest) {
        let mut tlb = self.cpu().tlb.lock();
        match request {
            TlbRequest::Page(va) => tlb.flush_page(va),
            TlbRequest::Range { start, end } => {
                let mut va = start;
                while va < end {
                    tlb.flush_page(va);
                    match va.checked_add(kernel_info::memory::PAGE_SIZE) {
                        Some(next) => va = next,
                        None => break,
                    }
                }
            }
            TlbRequest::All => tlb.flush_non_global(),
            TlbRequest::Global => tlb.flush_all(),
        }
    }

    fn ipi_invalidate(&self, targets: CpuSet, request: TlbRequest) {
        for cpu in targets.iter() {
            self.ipis.fetch_add(1, Ordering::Relaxed);
            let _identity = Identity::enter(cpu);
            self.invalidate_local(request);
        }
    }

    fn rendezvous(
        &self,
        targets: CpuSet,
        setup: RendezvousFn<'_>,
        action: RendezvousFn<'_>,
        teardown: RendezvousFn<'_>,
    ) {
        self.rendezvous.fetch_add(1, Ordering::Relaxed);
        for phase in [setup, action, teardown] {
            for cpu in targets.iter() {
                let _identity = Identity::enter(cpu);
                phase(cpu);
            }
        }
    }

    fn translate(&self, va: VirtualAddress, access: Access) -> Result<PhysicalAddress, PageFault> {
        let mut tlb = self.cpu().tlb.lock();
        let vpn = va.as_u32() >> PAGE_SHIFT;
        let pdi = va.as_u32() >> PDRSHIFT;
        let hit = tlb
            .small
            .get(&vpn)
            .map(|c| (*c, va.as_u32() & 0xFFF))
            .or_else(|| tlb.large.get(&pdi).map(|c| (*c, va.as_u32() & PDRMASK)));

        if let Some((cached, offset)) = hit {
            if tlb.small.contains_key(&vpn) && tlb.large.contains_key(&pdi) {
                self.size_conflicts.fetch_add(1, Ordering::Relaxed);
            }
            // A write through a cached dirty entry never re-walks, which is
            // how a missed shootdown becomes visible.
            if access == Access::Read || (cached.writable && cached.dirty) {
                return Ok(PhysicalAddress::new(cached.base | offset));
            }
            tlb.flush_page(va);
        }
        self.walk(&mut tlb, va, access)
    }

    fn flush_cache_line(&self, _va: VirtualAddress) {
        self.line_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn memory_fence(&self) {
        self.fences.fetch_add(1, Ordering::Relaxed);
    }

    fn flush_all_caches(&self) {
        self.cpu().cache_flushes.fetch_add(1, Ordering::Relaxed);
    }
}
