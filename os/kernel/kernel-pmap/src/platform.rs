//! # Platform boundary
//!
//! The translation manager never executes a privileged instruction itself.
//! Physical memory, the MMU and the interrupt controller are reached
//! through [`PhysMemory`] and [`Machine`], which a kernel implements on top
//! of its direct map, `invlpg`/`mov cr3`, and its IPI driver. The
//! [`emulation`](crate::emulation) module implements both in software.

use crate::cpuset::{CpuId, CpuSet};
use core::fmt;
use core::sync::atomic::AtomicU32;
use kernel_info::memory::NPTEPG;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};

/// Word-granular access to physical memory.
///
/// Page tables are read and written through this view while the MMU may
/// concurrently set accessed/dirty bits, hence atomics.
pub trait PhysMemory: Sync {
    /// The 4 KiB frame at `page` as 1024 machine words.
    ///
    /// # Panics
    /// Implementations panic if `page` is not backed by RAM.
    fn words(&self, page: PhysicalPage<Size4K>) -> &[AtomicU32; NPTEPG];
}

/// Optional CPU features the manager adapts to.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
#[allow(clippy::struct_excessive_bools)]
pub struct CpuFeatures {
    /// 4 MiB pages (`CR4.PSE`).
    pub pse: bool,
    /// Global pages (`CR4.PGE`).
    pub pge: bool,
    /// Page attribute table.
    pub pat: bool,
    /// The PAT bit in entries is honoured. Some early parts only decode the
    /// low four PAT entries.
    pub pat_works: bool,
    /// Caches snoop their own stores, so a memory type change needs no flush.
    pub self_snoop: bool,
    /// `clflush` line size in bytes, if the instruction exists.
    pub clflush_line: Option<u32>,
}

/// What a CPU attempted when it used a translation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
}

/// A translation the MMU refused.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PageFault {
    pub va: VirtualAddress,
    pub access: Access,
    /// The walk found a valid translation that forbade the access.
    pub protection: bool,
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.protection {
            "protection violation"
        } else {
            "page not present"
        };
        write!(f, "{kind} on {:?} at {}", self.access, self.va)
    }
}

/// A TLB invalidation request, executed locally or shipped by IPI.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TlbRequest {
    /// `invlpg` one page, global entries included.
    Page(VirtualAddress),
    /// `invlpg` every page in `[start, end)`.
    Range {
        start: VirtualAddress,
        end: VirtualAddress,
    },
    /// Reload CR3: every non-global entry.
    All,
    /// Toggle `CR4.PGE`: every entry.
    Global,
}

/// Phase callback of a rendezvous, run on each participating CPU.
pub type RendezvousFn<'a> = &'a (dyn Fn(CpuId) + Sync);

/// CPU-level services.
pub trait Machine: Sync {
    type Memory: PhysMemory;

    fn memory(&self) -> &Self::Memory;

    fn features(&self) -> CpuFeatures;

    /// Number of CPUs, numbered `0..cpu_count()`.
    fn cpu_count(&self) -> usize;

    fn all_cpus(&self) -> CpuSet {
        CpuSet::first(self.cpu_count())
    }

    /// The CPU executing the caller. Only stable while pinned.
    fn current_cpu(&self) -> CpuId;

    /// Keep the calling thread on its current CPU. Nests.
    fn sched_pin(&self);

    fn sched_unpin(&self);

    /// Disable preemption. Nests.
    fn critical_enter(&self);

    fn critical_exit(&self);

    /// Load the translation root of the current CPU.
    fn load_cr3(&self, directory: PhysicalAddress);

    /// Program the PAT MSR of every CPU.
    fn set_pat(&self, value: u64);

    /// Invalidate on the current CPU only.
    fn invalidate_local(&self, request: TlbRequest);

    /// Send `request` to every CPU in `targets` and wait until all of them
    /// acknowledged. `targets` never contains the calling CPU.
    fn ipi_invalidate(&self, targets: CpuSet, request: TlbRequest);

    /// Run `setup`, then `action`, then `teardown` on every CPU in `targets`
    /// (the caller included if it is a member), with a barrier between
    /// phases so no CPU starts a phase before all finished the previous one.
    fn rendezvous(
        &self,
        targets: CpuSet,
        setup: RendezvousFn<'_>,
        action: RendezvousFn<'_>,
        teardown: RendezvousFn<'_>,
    );

    /// Translate `va` on the current CPU exactly as a load or store would,
    /// including use of and fills into the TLB.
    ///
    /// # Errors
    /// The fault the access would raise.
    fn translate(&self, va: VirtualAddress, access: Access) -> Result<PhysicalAddress, PageFault>;

    /// `clflush` the line containing `va`.
    fn flush_cache_line(&self, va: VirtualAddress);

    /// `mfence`.
    fn memory_fence(&self);

    /// `wbinvd` on the current CPU.
    fn flush_all_caches(&self);
}

/// Keeps the current thread on its CPU for the guard's lifetime.
pub(crate) struct Pinned<'m, M: Machine + ?Sized>(&'m M);

impl<'m, M: Machine + ?Sized> Pinned<'m, M> {
    pub(crate) fn new(machine: &'m M) -> Self {
        machine.sched_pin();
        Self(machine)
    }
}

impl<M: Machine + ?Sized> Drop for Pinned<'_, M> {
    fn drop(&mut self) {
        self.0.sched_unpin();
    }
}

/// Preemption disabled for the guard's lifetime.
pub(crate) struct Critical<'m, M: Machine + ?Sized>(&'m M);

impl<'m, M: Machine + ?Sized> Critical<'m, M> {
    pub(crate) fn new(machine: &'m M) -> Self {
        machine.critical_enter();
        Self(machine)
    }
}

impl<M: Machine + ?Sized> Drop for Critical<'_, M> {
    fn drop(&mut self) {
        self.0.critical_exit();
    }
}
