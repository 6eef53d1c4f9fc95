//! TLB shootdown and cache maintenance.
//!
//! An invalidation reaches every CPU on which the address space may be
//! cached: all of them for the kernel space or a space active everywhere,
//! otherwise only the members of the space's active set. The calling CPU is
//! pinned while the request is built and delivered.

use super::Pmap;
use crate::address_space::AddressSpace;
use crate::cpuset::{CpuId, CpuSet};
use crate::platform::{Machine, Pinned, TlbRequest};
use crate::pte::PdEntry;
use crate::supplier::PageSupplier;
use kernel_memory_addresses::VirtualAddress;
use log::trace;

impl<M: Machine, S: PageSupplier> Pmap<M, S> {
    pub(crate) fn invalidate_page(&self, space: &AddressSpace, va: VirtualAddress) {
        self.shootdown(space, TlbRequest::Page(va));
    }

    pub(crate) fn invalidate_range(
        &self,
        space: &AddressSpace,
        start: VirtualAddress,
        end: VirtualAddress,
    ) {
        self.shootdown(space, TlbRequest::Range { start, end });
    }

    /// Drop every cached translation of `space`. For the kernel space this
    /// includes global entries.
    pub(crate) fn invalidate_all(&self, space: &AddressSpace) {
        let request = if space.is_kernel() {
            TlbRequest::Global
        } else {
            TlbRequest::All
        };
        self.shootdown(space, request);
    }

    fn shootdown(&self, space: &AddressSpace, request: TlbRequest) {
        let _pin = Pinned::new(&self.machine);
        let me = self.machine.current_cpu();
        let all = self.machine.all_cpus();
        let others = all.without(me);
        self.stats.shootdowns.inc();

        let active = space.active_cpus();
        if space.is_kernel() || active == all {
            trace!("{}: {request:?} on all cpus", space.id());
            self.machine.invalidate_local(request);
            if !others.is_empty() {
                self.machine.ipi_invalidate(others, request);
            }
            return;
        }

        if active.contains(me) {
            self.machine.invalidate_local(request);
        }
        let targets = active.intersection(others);
        trace!("{}: {request:?} local {} remote {targets:?}", space.id(), active.contains(me));
        if !targets.is_empty() {
            self.machine.ipi_invalidate(targets, request);
        }
    }

    /// Replace the directory entry for `va` so that no CPU can ever hold a
    /// 4 KiB and a 4 MiB translation for the same address at once.
    ///
    /// If other CPUs may have the space loaded, every CPU meets in a
    /// rendezvous: all first drop the old translation of `va`, then the
    /// caller stores the new entry, then the active CPUs invalidate what
    /// the new entry requires.
    pub(crate) fn update_pde(&self, space: &AddressSpace, va: VirtualAddress, pde: PdEntry) {
        let _pin = Pinned::new(&self.machine);
        let me = self.machine.current_cpu();
        let all = self.machine.all_cpus();
        let active = if space.is_kernel() {
            all
        } else {
            space.active_cpus()
        };

        if active.intersection(all.without(me)).is_empty() {
            self.store_pde(space, va, pde);
            if active.contains(me) {
                self.update_pde_invalidate(va, pde);
            }
            return;
        }

        trace!("{}: rendezvous to replace pde for {va} with {pde:?}", space.id());
        let setup = |_: CpuId| self.machine.invalidate_local(TlbRequest::Page(va));
        let action = |cpu: CpuId| {
            if cpu == me {
                self.store_pde(space, va, pde);
            }
        };
        let teardown = |cpu: CpuId| {
            if active.contains(cpu) {
                self.update_pde_invalidate(va, pde);
            }
        };
        self.machine
            .rendezvous(active.with(me), &setup, &action, &teardown);
    }

    /// Local invalidation after a directory entry for `va` became `pde`.
    fn update_pde_invalidate(&self, va: VirtualAddress, pde: PdEntry) {
        let request = if !pde.superpage() {
            // Demotion: the 4 KiB entries match the old 4 MiB one.
            TlbRequest::Page(va)
        } else if pde.global() {
            TlbRequest::Global
        } else {
            TlbRequest::All
        };
        self.machine.invalidate_local(request);
    }

    /// Write back and invalidate the cache lines of `[start, end)`, which
    /// must be mapped on the calling CPU.
    ///
    /// Nothing is done if the CPU's caches snoop their own stores. Ranges
    /// below the configured threshold are flushed line by line when the CPU
    /// supports it; anything else falls back to flushing every cache of
    /// every CPU.
    pub fn invalidate_cache_range(&self, start: VirtualAddress, end: VirtualAddress) {
        let features = self.machine.features();
        if features.self_snoop {
            return;
        }
        match features.clflush_line {
            Some(line) if end - start < self.config.clflush_threshold() => {
                let _pin = Pinned::new(&self.machine);
                self.machine.memory_fence();
                let mut va = VirtualAddress::new(start.as_u32() & !(line - 1));
                while va < end {
                    self.machine.flush_cache_line(va);
                    match va.checked_add(line) {
                        Some(next) => va = next,
                        None => break,
                    }
                }
                self.machine.memory_fence();
            }
            _ => self.invalidate_cache(),
        }
    }

    /// Write back and invalidate the caches of every CPU.
    pub fn invalidate_cache(&self) {
        let noop = |_: CpuId| {};
        let flush = |_: CpuId| self.machine.flush_all_caches();
        let all: CpuSet = self.machine.all_cpus();
        self.machine.rendezvous(all, &noop, &flush, &noop);
    }
}
