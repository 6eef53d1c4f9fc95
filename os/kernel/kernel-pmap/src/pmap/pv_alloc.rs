//! Allocation of reverse-mapping entries.
//!
//! Entries come from the chunks of the requesting address space. A new
//! chunk needs a free slot in the chunk virtual range and a page from the
//! supplier; when either is missing, unwired 4 KiB mappings are reclaimed
//! from the least recently used chunks, in any address space, until an
//! entry or a whole chunk becomes free.

use super::Pmap;
use crate::address_space::{AddressSpace, SpaceState};
use crate::platform::Machine;
use crate::ptp::FreeList;
use crate::pv::{ChunkId, ListKey, NPCPV, PvRef, PvState};
use crate::supplier::{AllocFlags, PageSupplier, VmPage};
use alloc::vec::Vec;
use kernel_memory_addresses::{PhysicalPage, Size4K, VirtualAddress};
use log::{debug, warn};

/// What reclaiming one chunk achieved.
enum Reclaimed {
    Nothing,
    Entries(u32),
    /// Every entry of the chunk is free; the chunk has left its space.
    Chunk,
}

impl<M: Machine, S: PageSupplier> Pmap<M, S> {
    /// Allocate an entry for `va` in `space`.
    ///
    /// With `try_only`, fails instead of reclaiming. Otherwise reclaims once
    /// and fails only if that did not help either.
    pub(crate) fn get_pv_entry(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        va: VirtualAddress,
        try_only: bool,
    ) -> Option<PvRef> {
        self.stats.pv_entry_allocs.inc();
        self.stats.pv_entry_count.inc();
        pv.entry_count += 1;
        if pv.entry_count == pv.high_water + 1 {
            warn!(
                "pmap: approaching the limit on pv entries ({} of {}), consider a larger budget",
                pv.entry_count, pv.entry_max
            );
        }

        let mut reclaimed = false;
        loop {
            let mem = self.machine.memory();
            if let Some(at) = state.pv_chunks.iter().position(|&id| pv.spare_in(mem, id) > 0) {
                let id = state.pv_chunks[at];
                let Some((entry, full)) = pv.alloc_in(mem, id, va) else {
                    panic!("pv chunk {id:?} reported spare entries but had none");
                };
                state.pv_chunks.remove(at);
                if full {
                    state.pv_chunks.push_back(id);
                } else {
                    state.pv_chunks.push_front(id);
                }
                self.stats.pv_entry_spare.sub(1);
                return Some(entry);
            }

            let fresh = if pv.has_free_va() {
                self.supplier
                    .alloc_page(0, AllocFlags::page_table().with_zeroed(false))
                    .map(VmPage::phys)
            } else {
                None
            };
            let page = match fresh {
                Some(page) => page,
                None if try_only || reclaimed => {
                    self.stats.pc_chunk_tryfail.inc();
                    self.stats.pv_entry_count.sub(1);
                    pv.entry_count -= 1;
                    return None;
                }
                None => {
                    reclaimed = true;
                    match self.reclaim_pv_chunk(space, state, pv) {
                        Some(page) => page,
                        None => continue,
                    }
                }
            };

            let id = self.install_pv_chunk(space, state, pv, page);
            let Some((entry, _)) = pv.alloc_in(self.machine.memory(), id, va) else {
                panic!("fresh pv chunk {id:?} is full");
            };
            self.stats.pv_entry_spare.sub(1);
            return Some(entry);
        }
    }

    /// Take a chunk slot for `page`, map it and put it first in `space`'s
    /// chunk list.
    fn install_pv_chunk(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        page: PhysicalPage<Size4K>,
    ) -> ChunkId {
        let id = pv.install_chunk(self.machine.memory(), space.id(), page);
        self.kenter(pv.chunk_va(id), page.base());
        state.pv_chunks.push_front(id);
        self.stats.pc_chunk_count.inc();
        self.stats.pc_chunk_allocs.inc();
        self.stats.pv_entry_spare.add(NPCPV as u64);
        id
    }

    /// Return an entry to its chunk, releasing the chunk once it is empty.
    pub(crate) fn free_pv_entry(&self, state: &mut SpaceState, pv: &mut PvState, entry: PvRef) {
        self.stats.pv_entry_frees.inc();
        self.stats.pv_entry_spare.inc();
        self.stats.pv_entry_count.sub(1);
        pv.entry_count -= 1;

        let id = entry.chunk;
        let empty = pv.free_in(self.machine.memory(), entry);
        if let Some(at) = state.pv_chunks.iter().position(|&c| c == id) {
            state.pv_chunks.remove(at);
        }
        if !empty {
            state.pv_chunks.push_front(id);
            return;
        }
        let page = self.retire_pv_chunk(pv, id);
        let m = self.page_of(page.base());
        self.supplier.free_page(m);
    }

    /// Unmap an empty chunk and give up its slot, returning its page.
    fn retire_pv_chunk(&self, pv: &mut PvState, id: ChunkId) -> PhysicalPage<Size4K> {
        self.stats.pv_entry_spare.sub(NPCPV as u64);
        self.stats.pc_chunk_count.sub(1);
        self.stats.pc_chunk_frees.inc();
        let va = pv.chunk_va(id);
        let page = pv.remove_chunk(self.machine.memory(), id);
        self.kremove(va);
        self.invalidate_page(&self.kernel, va);
        page
    }

    /// Make sure `space` has `needed` free entries in its chunks without
    /// reclaiming. Chunks added for the reservation are released again if
    /// it cannot be met.
    pub(crate) fn reserve_pv_entries(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        needed: usize,
    ) -> bool {
        let mem = self.machine.memory();
        let mut spare: usize = state.pv_chunks.iter().map(|&id| pv.spare_in(mem, id)).sum();
        let mut added = Vec::new();
        while spare < needed {
            let page = if pv.has_free_va() {
                self.supplier
                    .alloc_page(0, AllocFlags::page_table().with_zeroed(false))
            } else {
                None
            };
            let Some(m) = page else {
                self.stats.pc_chunk_tryfail.inc();
                for id in added {
                    if let Some(at) = state.pv_chunks.iter().position(|&c| c == id) {
                        state.pv_chunks.remove(at);
                    }
                    let page = self.retire_pv_chunk(pv, id);
                    self.supplier.free_page(self.page_of(page.base()));
                }
                return false;
            };
            added.push(self.install_pv_chunk(space, state, pv, m.phys()));
            spare += NPCPV;
        }
        true
    }

    /// Record a managed mapping of `m` at `va`.
    pub(crate) fn insert_pv_entry(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        va: VirtualAddress,
        m: &VmPage,
    ) -> bool {
        match self.get_pv_entry(space, state, pv, va, false) {
            Some(entry) => {
                pv.link(ListKey::page(m), entry);
                true
            }
            None => false,
        }
    }

    /// Like [`insert_pv_entry`](Self::insert_pv_entry) for opportunistic
    /// callers: refuses above the high-water mark and never reclaims.
    pub(crate) fn try_insert_pv_entry(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        va: VirtualAddress,
        m: &VmPage,
    ) -> bool {
        if pv.entry_count >= pv.high_water {
            return false;
        }
        match self.get_pv_entry(space, state, pv, va, true) {
            Some(entry) => {
                pv.link(ListKey::page(m), entry);
                true
            }
            None => false,
        }
    }

    /// Remove `space`'s entry for `va` from a list and free it.
    ///
    /// # Panics
    /// If the list has no such entry.
    pub(crate) fn pvh_free(
        &self,
        state: &mut SpaceState,
        pv: &mut PvState,
        key: ListKey,
        space: &AddressSpace,
        va: VirtualAddress,
    ) {
        let Some(entry) = pv.unlink(self.machine.memory(), key, space.id(), va) else {
            panic!("no pv entry for {} at {va} in {key:?}", space.id());
        };
        self.free_pv_entry(state, pv, entry);
    }

    /// Reclaim unwired 4 KiB mappings, oldest chunks first, until either
    /// `space` got back enough of its own entries or some chunk became
    /// entirely free. Returns a page for a new chunk if one was freed: the
    /// empty chunk's own page, or a page-table page released on the way.
    ///
    /// Other address spaces are locked one at a time; those with a lower id
    /// than `space` only if that succeeds without waiting.
    fn reclaim_pv_chunk(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
    ) -> Option<PhysicalPage<Size4K>> {
        self.stats.pv_reclaims.inc();
        let mut free = FreeList::new();
        let mut skipped = Vec::new();
        let mut recycled = None;
        let mut own_freed = 0;
        let mut own_touched = false;

        while recycled.is_none() && !(pv.has_free_va() && !free.is_empty()) {
            let Some(id) = pv.lru_pop() else {
                break;
            };
            let owner = pv.chunk(id).owner();
            let outcome = if owner == space.id() {
                self.reclaim_chunk(space, state, pv, id, &mut free)
            } else {
                let Some(other) = self.registry.get(owner) else {
                    skipped.push(id);
                    continue;
                };
                let guard = if owner > space.id() {
                    Some(other.state.lock())
                } else {
                    other.state.try_lock()
                };
                let Some(mut other_state) = guard else {
                    skipped.push(id);
                    continue;
                };
                let outcome = self.reclaim_chunk(&other, &mut other_state, pv, id, &mut free);
                if !matches!(outcome, Reclaimed::Nothing) {
                    self.invalidate_all(&other);
                }
                outcome
            };

            match outcome {
                Reclaimed::Nothing => skipped.push(id),
                Reclaimed::Entries(n) => {
                    pv.lru_push(id);
                    if owner == space.id() {
                        own_touched = true;
                        own_freed += n;
                        if own_freed >= self.config.reclaim_own_entries() {
                            break;
                        }
                    }
                }
                Reclaimed::Chunk => {
                    own_touched |= owner == space.id();
                    recycled = Some(self.retire_pv_chunk(pv, id));
                }
            }
        }

        if own_touched {
            self.invalidate_all(space);
        }
        for id in skipped {
            pv.lru_push(id);
        }
        if recycled.is_none() && pv.has_free_va() {
            recycled = free.pop();
        }
        debug!(
            "{}: pv reclaim freed {own_freed} own entries, recycled page {recycled:?}",
            space.id()
        );
        free.release(&self.supplier);
        recycled
    }

    /// Destroy every unwired 4 KiB mapping recorded in chunk `id`, owned by
    /// `space`.
    fn reclaim_chunk(
        &self,
        space: &AddressSpace,
        state: &mut SpaceState,
        pv: &mut PvState,
        id: ChunkId,
        free: &mut FreeList,
    ) -> Reclaimed {
        let slots: Vec<u16> = pv.in_use(self.machine.memory(), id).collect();
        let mut freed = 0;
        for slot in slots {
            let entry = PvRef { chunk: id, slot };
            let (_, va) = pv.entry(self.machine.memory(), entry);
            if self.pde(space, va).load().superpage() {
                continue;
            }
            let Some(pte) = self.pte(space, va) else {
                panic!("{}: pv entry for {va} without a page table", space.id());
            };
            if pte.load().wired() {
                continue;
            }
            let old = pte.take();
            assert!(!old.is_zero(), "{}: pv entry for unmapped {va}", space.id());
            if old.global() {
                self.invalidate_page(space, va);
            }
            let m = self.page_of(old.phys());
            if old.dirty() && old.writable() {
                m.mark_dirty();
            }
            if old.accessed() {
                m.set_referenced();
            }
            let key = ListKey::page(m);
            pv.unlink_ref(key, entry);
            if pv.list(key).is_empty() && (m.is_fictitious() || !pv.superpage_mapped(m.pa())) {
                m.clear_writeable();
            }
            pv.free_in(self.machine.memory(), entry);
            self.unuse_pt(space, state, va, free);
            freed += 1;
        }
        if freed == 0 {
            return Reclaimed::Nothing;
        }

        state.stats.resident -= freed;
        pv.entry_count -= freed;
        self.stats.pv_entry_count.sub(u64::from(freed));
        self.stats.pv_entry_frees.add(u64::from(freed));
        self.stats.pv_entry_spare.add(u64::from(freed));
        if let Some(at) = state.pv_chunks.iter().position(|&c| c == id) {
            state.pv_chunks.remove(at);
        }
        if pv.is_chunk_free(self.machine.memory(), id) {
            Reclaimed::Chunk
        } else {
            state.pv_chunks.push_front(id);
            Reclaimed::Entries(freed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use crate::address_space::AddressSpace;
    use crate::config::PmapConfig;
    use crate::error::PmapError;
    use crate::prot::Prot;
    use crate::pv::{NPCM, NPCPV};

    /// Budget of exactly two chunks.
    fn tight() -> PmapConfig {
        PmapConfig::default().with_pv_entry_max(Some(2 * NPCPV as u32))
    }

    fn fill(pmap: &TestPmap, space: &AddressSpace, count: usize, wired: bool) {
        for i in 0..count {
            let m = page(pmap);
            pmap.enter(space, va(0x0040_0000 + i as u32 * 0x1000), m, Prot::READ, Prot::READ, wired)
                .unwrap();
        }
    }

    #[test]
    fn entries_share_chunks_and_count() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = pmap.create().unwrap();
        fill(&pmap, &space, 10, false);
        assert_eq!(pmap.pv_entry_count(), 10);
        assert_eq!(pmap.stats().pc_chunk_count.get(), 1);
        assert_eq!(pmap.stats().pv_entry_spare.get(), (NPCPV - 10) as u64);
    }

    #[test]
    fn empty_chunk_is_returned() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = pmap.create().unwrap();
        let free = pmap.supplier().free_count();
        fill(&pmap, &space, 3, false);
        pmap.remove(&space, va(0x0040_0000), va(0x0080_0000));
        assert_eq!(pmap.pv_entry_count(), 0);
        assert_eq!(pmap.stats().pc_chunk_count.get(), 0);
        assert!(space.state.lock().pv_chunks.is_empty());
        // Three data pages stay allocated; the page table and chunk are back.
        assert_eq!(pmap.supplier().free_count(), free - 3);
    }

    #[test]
    fn chunk_entries_are_stored_in_the_chunk_page() {
        let pmap = pmap_with(1, PmapConfig::default());
        let space = pmap.create().unwrap();
        fill(&pmap, &space, 3, false);

        let id = space.state.lock().pv_chunks[0];
        let (page, at) = {
            let pv = pmap.pv.write();
            (pv.chunk(id).page(), pv.chunk_va(id))
        };
        assert!(!pmap.supplier().is_free(page));
        assert_eq!(pmap.kextract(at), Some(page.base()));
        assert_eq!(peek(&pmap, at), !0b111);
        for i in 0..3u32 {
            let entry = at + (NPCM as u32 + i) * 4;
            assert_eq!(peek(&pmap, entry), 0x0040_0000 + i * 0x1000);
        }
    }

    #[test]
    fn reclaim_takes_entries_from_another_space() {
        let pmap = pmap_with(1, tight());
        let a = pmap.create().unwrap();
        let b = pmap.create().unwrap();
        fill(&pmap, &a, 2 * NPCPV, false);
        assert_eq!(a.resident_count() as usize, 2 * NPCPV + 1);

        let m = page(&pmap);
        pmap.enter(&b, va(0x1000), m, Prot::READ, Prot::READ, false)
            .unwrap();
        assert_eq!(pmap.stats().pv_reclaims.get(), 1);
        assert_eq!(b.resident_count(), 2);
        assert_eq!(a.resident_count() as usize, NPCPV + 1);
        assert_eq!(pmap.pv_entry_count() as usize, NPCPV + 1);
        assert_eq!(pmap.extract(&b, va(0x1000)), Some(m.pa()));
    }

    #[test]
    fn wired_mappings_are_never_reclaimed() {
        let pmap = pmap_with(1, tight());
        let a = pmap.create().unwrap();
        let b = pmap.create().unwrap();
        fill(&pmap, &a, 2 * NPCPV, true);
        let m = page(&pmap);
        let free = pmap.supplier().free_count();
        assert_eq!(
            pmap.enter(&b, va(0x1000), m, Prot::READ, Prot::READ, false),
            Err(PmapError::ResourceShortage)
        );
        assert_eq!(b.resident_count(), 0);
        assert_eq!(b.page_table_pages(), 0);
        assert_eq!(pmap.supplier().free_count(), free);
        assert_eq!(a.wired_count() as usize, 2 * NPCPV);
    }

    #[test]
    fn reclaim_releases_emptied_page_tables() {
        let pmap = pmap_with(1, tight());
        let a = pmap.create().unwrap();
        let b = pmap.create().unwrap();
        // One entry per page table, so reclaiming frees page tables too.
        for i in 0..4u32 {
            let m = page(&pmap);
            pmap.enter(&a, va(0x0040_0000 * (i + 2)), m, Prot::READ, Prot::READ, false)
                .unwrap();
        }
        fill(&pmap, &a, 2 * NPCPV - 4, false);
        let m = page(&pmap);
        pmap.enter(&b, va(0x1000), m, Prot::READ, Prot::READ, false)
            .unwrap();
        assert!(a.page_table_pages() < 5);
    }

    #[test]
    fn reservation_is_rolled_back_on_failure() {
        let pmap = pmap_with(1, PmapConfig::default().with_pv_entry_max(Some(NPCPV as u32)));
        let space = pmap.create().unwrap();
        let free = pmap.supplier().free_count();
        {
            let mut pv = pmap.pv.write();
            let mut state = space.state.lock();
            assert!(!pmap.reserve_pv_entries(&space, &mut state, &mut pv, NPCPV + 1));
            assert!(state.pv_chunks.is_empty());
        }
        assert_eq!(pmap.supplier().free_count(), free);
        assert_eq!(pmap.stats().pc_chunk_count.get(), 0);

        let mut pv = pmap.pv.write();
        let mut state = space.state.lock();
        assert!(pmap.reserve_pv_entries(&space, &mut state, &mut pv, NPCPV));
        assert_eq!(state.pv_chunks.len(), 1);
    }

    #[test]
    fn try_insert_refuses_above_high_water() {
        let pmap = pmap_with(1, PmapConfig::default().with_pv_entry_max(Some(10)));
        let space = pmap.create().unwrap();
        let mut pv = pmap.pv.write();
        let mut state = space.state.lock();
        let m = page(&pmap);
        pv.entry_count = pv.high_water;
        assert!(!pmap.try_insert_pv_entry(&space, &mut state, &mut pv, va(0x1000), m));
        pv.entry_count = 0;
        assert!(pmap.try_insert_pv_entry(&space, &mut state, &mut pv, va(0x1000), m));
        pmap.pvh_free(&mut state, &mut pv, crate::pv::ListKey::page(m), &space, va(0x1000));
        assert_eq!(pv.entry_count, 0);
    }
}
