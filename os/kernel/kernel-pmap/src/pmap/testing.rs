//! Fixtures shared by the manager's tests.

pub(crate) use crate::emulation::{EmulatedMachine, EmulatedPages};

use super::Pmap;
use crate::address_space::AddressSpace;
use crate::config::PmapConfig;
use crate::platform::{Access, CpuFeatures};
use crate::prot::Prot;
use crate::pv::ListKey;
use crate::supplier::VmPage;
use alloc::sync::Arc;
use kernel_memory_addresses::VirtualAddress;

/// Emulated memory size: two 4 MiB groups, so one superpage frame stays
/// free next to the pages the tests allocate.
pub(crate) const FRAMES: usize = 2048;

pub(crate) type TestPmap = Pmap<EmulatedMachine, EmulatedPages>;

pub(crate) fn pmap_on(cpus: usize, features: CpuFeatures, config: PmapConfig) -> TestPmap {
    let machine = EmulatedMachine::new(cpus, FRAMES, features);
    let pages = EmulatedPages::new(FRAMES);
    match Pmap::bootstrap(machine, pages, config) {
        Ok(pmap) => pmap,
        Err(e) => panic!("bootstrap failed: {e}"),
    }
}

pub(crate) fn pmap_with(cpus: usize, config: PmapConfig) -> TestPmap {
    pmap_on(cpus, EmulatedMachine::modern_features(), config)
}

/// A fresh user space, activated on the calling CPU.
pub(crate) fn user_space(pmap: &TestPmap) -> Arc<AddressSpace> {
    let space = pmap.create().unwrap();
    pmap.activate(&space);
    space
}

pub(crate) fn page(pmap: &TestPmap) -> &VmPage {
    pmap.supplier().alloc_managed().unwrap()
}

pub(crate) fn va(v: u32) -> VirtualAddress {
    VirtualAddress::new(v)
}

/// Enter a read-write mapping of `m` at `at`.
pub(crate) fn map_rw(pmap: &TestPmap, space: &AddressSpace, at: VirtualAddress, m: &VmPage) {
    pmap.enter(space, at, m, Prot::READ, Prot::READ_WRITE, false)
        .unwrap();
}

/// Store through the current CPU's MMU.
pub(crate) fn poke(pmap: &TestPmap, at: VirtualAddress, value: u32) {
    pmap.machine().write_u32(at, value).unwrap();
}

pub(crate) fn peek(pmap: &TestPmap, at: VirtualAddress) -> u32 {
    pmap.machine().read_u32(at).unwrap()
}

pub(crate) fn faults(pmap: &TestPmap, at: VirtualAddress, access: Access) -> bool {
    let result = match access {
        Access::Read => pmap.machine().read_u32(at).map(drop),
        Access::Write => pmap.machine().write_u32(at, 0),
    };
    result.is_err()
}

/// Reverse-mapping entries naming `m`: 4 KiB entries of the page and 4 MiB
/// entries of its frame.
pub(crate) fn mappings_of(pmap: &TestPmap, m: &VmPage) -> usize {
    let pv = pmap.pv.read();
    pv.list(ListKey::page(m)).len() + pv.list(ListKey::superpage_of(m.pa())).len()
}

/// Valid 4 KiB entries in the page table covering `at`.
pub(crate) fn valid_entries(pmap: &TestPmap, space: &AddressSpace, at: VirtualAddress) -> usize {
    let pde = pmap.pde(space, at).load();
    assert!(pde.present() && !pde.superpage());
    pmap.table(pde.table_page())
        .slots()
        .filter(|s| s.load().present())
        .count()
}

/// Wire count the index records for the page table covering `at`.
pub(crate) fn wire_count(space: &AddressSpace, at: VirtualAddress) -> Option<u32> {
    space.state.lock().ptps.lookup(at).map(|p| p.wire_count)
}
