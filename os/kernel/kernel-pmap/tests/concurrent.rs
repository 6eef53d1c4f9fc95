use kernel_pmap::emulation::{EmulatedMachine, EmulatedPages};
use kernel_pmap::{CpuId, Pmap, PmapConfig, Prot};
use kernel_memory_addresses::VirtualAddress;
use std::sync::Barrier;
use std::thread;

const CPUS: usize = 4;
const FRAMES: usize = 4096;

fn pmap() -> Pmap<EmulatedMachine, EmulatedPages> {
    let machine = EmulatedMachine::new(CPUS, FRAMES, EmulatedMachine::modern_features());
    Pmap::bootstrap(machine, EmulatedPages::new(FRAMES), PmapConfig::default())
        .expect("bootstrap")
}

#[test]
fn spaces_on_different_cpus_share_a_page() {
    let pmap = pmap();
    let shared = pmap.supplier().alloc_managed().expect("page");
    let start = Barrier::new(CPUS - 1);
    let iters = 200u32;

    thread::scope(|s| {
        for cpu in 1..CPUS {
            let (pmap, start) = (&pmap, &start);
            s.spawn(move || {
                pmap.machine().run_on(CpuId::new(cpu), || {
                    let space = pmap.create().expect("space");
                    pmap.activate(&space);
                    start.wait();
                    for i in 0..iters {
                        let va = VirtualAddress::new(0x1000 * (i % 8 + 1));
                        pmap.enter(&space, va, shared, Prot::READ, Prot::READ_WRITE, false)
                            .expect("enter");
                        pmap.machine().write_u32(va, i).expect("mapped");
                        assert_eq!(pmap.extract(&space, va), Some(shared.pa()));
                        pmap.remove(&space, va, va + 0x1000);
                        assert!(pmap.machine().read_u32(va).is_err());
                    }
                    pmap.activate(pmap.kernel());
                    assert_eq!(space.resident_count(), 0);
                    pmap.release(space);
                });
            });
        }
    });

    assert!(!pmap.page_is_mapped(shared));
    assert!(shared.is_dirty());
    assert_eq!(pmap.pv_entry_count(), 0);
    assert_eq!(pmap.space_count(), 1);
}

#[test]
fn remove_all_races_with_entering() {
    let pmap = pmap();
    let page = pmap.supplier().alloc_managed().expect("page");
    let spaces: Vec<_> = (0..3).map(|_| pmap.create().expect("space")).collect();
    let start = Barrier::new(spaces.len() + 1);

    thread::scope(|s| {
        for (cpu, space) in spaces.iter().enumerate() {
            let (pmap, start) = (&pmap, &start);
            s.spawn(move || {
                pmap.machine().run_on(CpuId::new(cpu + 1), || {
                    pmap.activate(space);
                    start.wait();
                    for i in 0..100u32 {
                        let va = VirtualAddress::new(0x0040_0000 + 0x1000 * (i % 16));
                        pmap.enter(space, va, page, Prot::READ, Prot::READ, false)
                            .expect("enter");
                    }
                    pmap.activate(pmap.kernel());
                });
            });
        }
        start.wait();
        for _ in 0..50 {
            pmap.remove_all(page);
        }
    });

    pmap.remove_all(page);
    assert!(!pmap.page_is_mapped(page));
    for space in spaces {
        assert_eq!(space.resident_count(), 0);
        assert_eq!(space.page_table_pages(), 0);
        pmap.remove_pages(&space);
        pmap.release(space);
    }
    assert_eq!(pmap.pv_entry_count(), 0);
}
