//! # Reverse mappings
//!
//! Every managed mapping has one PV entry naming its `(address space,
//! virtual address)`. Entries live in fixed-size chunks, each stored in one
//! wired physical page mapped at a slot of a dedicated kernel virtual
//! range, and each owned by a single address space. Chunks are linked per
//! space (in [`SpaceState`](crate::address_space::SpaceState)) and in one
//! global least-recently-used ring scanned by reclamation.
//!
//! A chunk page holds the free bitmap followed by the entries' virtual
//! addresses; owner and page are tracked here by chunk id:
//!
//! ```text
//!   word  0..11    free bitmap, set bit = free entry
//!   word 11..347   virtual address of each entry
//! ```
//!
//! Entries are threaded onto the list of the physical page they map, or,
//! for a superpage mapping, onto the list of the physical 4 MiB frame.
//!
//! Everything here is guarded by the global reverse-mapping lock, so the
//! chunk words are accessed with relaxed ordering.

use crate::address_space::AsId;
use crate::platform::PhysMemory;
use crate::supplier::VmPage;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::memory::{NPTEPG, PAGE_SIZE};
use kernel_memory_addresses::{
    PageSize, PhysicalAddress, PhysicalPage, Size4K, Size4M, VirtualAddress,
};

/// Bitmap words per chunk.
pub(crate) const NPCM: usize = 11;

/// Entries per chunk.
pub(crate) const NPCPV: usize = 336;

/// Word offsets within a chunk page.
const PC_MAP: usize = 0;
const PC_ENTRIES: usize = PC_MAP + NPCM;

/// Free masks of a chunk with every entry free.
const PC_FREE0_9: u32 = 0xFFFF_FFFF;
const PC_FREE10: u32 = 0x0000_FFFF;

const PC_FREEMASK: [u32; NPCM] = [
    PC_FREE0_9, PC_FREE0_9, PC_FREE0_9, PC_FREE0_9, PC_FREE0_9, PC_FREE0_9, PC_FREE0_9,
    PC_FREE0_9, PC_FREE0_9, PC_FREE0_9, PC_FREE10,
];

const _: () = assert!((NPCM - 1) * 32 + PC_FREE10.count_ones() as usize == NPCPV);
const _: () = assert!(PC_ENTRIES + NPCPV <= NPTEPG);

/// Index of a chunk, equal to its page slot in the chunk virtual range.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub(crate) struct ChunkId(u32);

impl ChunkId {
    const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to one PV entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct PvRef {
    pub(crate) chunk: ChunkId,
    pub(crate) slot: u16,
}

#[derive(Copy, Clone, Debug)]
pub(crate) struct PvChunk {
    owner: AsId,
    page: PhysicalPage<Size4K>,
}

impl PvChunk {
    pub(crate) const fn owner(&self) -> AsId {
        self.owner
    }

    pub(crate) const fn page(&self) -> PhysicalPage<Size4K> {
        self.page
    }
}

/// The bitmap and entries of one chunk, in its page.
#[derive(Copy, Clone)]
struct ChunkWords<'m>(&'m [AtomicU32; NPTEPG]);

impl ChunkWords<'_> {
    fn map(self, field: usize) -> u32 {
        self.0[PC_MAP + field].load(Ordering::Relaxed)
    }

    fn set_map(self, field: usize, value: u32) {
        self.0[PC_MAP + field].store(value, Ordering::Relaxed);
    }

    fn maps(self) -> [u32; NPCM] {
        core::array::from_fn(|field| self.map(field))
    }

    fn init(self) {
        for (field, mask) in PC_FREEMASK.into_iter().enumerate() {
            self.set_map(field, mask);
        }
    }

    fn va(self, slot: u16) -> VirtualAddress {
        VirtualAddress::new(self.0[PC_ENTRIES + usize::from(slot)].load(Ordering::Relaxed))
    }

    fn set_va(self, slot: u16, va: VirtualAddress) {
        self.0[PC_ENTRIES + usize::from(slot)].store(va.as_u32(), Ordering::Relaxed);
    }

    /// Claim the lowest free entry.
    fn alloc(self) -> Option<u16> {
        let field = (0..NPCM).find(|&f| self.map(f) != 0)?;
        let word = self.map(field);
        let bit = word.trailing_zeros();
        self.set_map(field, word & !(1 << bit));
        u16::try_from(field * 32).ok().map(|base| base + bit as u16)
    }

    fn release(self, slot: u16) {
        let (field, bit) = (usize::from(slot) / 32, u32::from(slot) % 32);
        let word = self.map(field);
        assert!(word & (1 << bit) == 0, "freeing free pv entry {slot}");
        self.set_map(field, word | 1 << bit);
    }

    fn is_full(self) -> bool {
        (0..NPCM).all(|f| self.map(f) == 0)
    }

    fn is_free(self) -> bool {
        self.maps() == PC_FREEMASK
    }

    fn spare(self) -> usize {
        self.maps().iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// The entries mapping one physical page or 4 MiB frame, oldest first.
#[derive(Debug, Default)]
pub(crate) struct PvList(VecDeque<PvRef>);

impl PvList {
    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }

    pub(crate) fn first(&self) -> Option<PvRef> {
        self.0.front().copied()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = PvRef> + '_ {
        self.0.iter().copied()
    }

    pub(crate) fn push_back(&mut self, pv: PvRef) {
        self.0.push_back(pv);
    }

    /// Move the first entry to the end.
    pub(crate) fn rotate(&mut self) {
        self.0.rotate_left(1.min(self.0.len()));
    }

    fn remove_where(&mut self, f: impl Fn(PvRef) -> bool) -> Option<PvRef> {
        let at = self.0.iter().position(|&pv| f(pv))?;
        self.0.remove(at)
    }
}

/// Which reverse-mapping list an operation addresses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum ListKey {
    /// The list of the 4 KiB page with this supplier index.
    Page(usize),
    /// The list of a 4 MiB physical frame.
    Superpage(PhysicalPage<Size4M>),
}

impl ListKey {
    pub(crate) const fn page(m: &VmPage) -> Self {
        Self::Page(m.index())
    }

    pub(crate) const fn superpage_of(pa: PhysicalAddress) -> Self {
        Self::Superpage(PhysicalPage::from_addr(pa))
    }
}

/// All reverse-mapping state.
///
/// Operations on chunk contents take the physical memory the chunk pages
/// live in.
pub(crate) struct PvState {
    chunks: Vec<Option<PvChunk>>,
    /// Unused slots of the chunk virtual range.
    va_free: Vec<ChunkId>,
    /// Chunks in reclamation order.
    lru: VecDeque<ChunkId>,
    pages: Vec<PvList>,
    superpages: Vec<PvList>,
    chunk_base: VirtualAddress,
    pub(crate) entry_count: u32,
    pub(crate) entry_max: u32,
    pub(crate) high_water: u32,
}

impl PvState {
    /// State for `page_count` managed pages below `phys_end`, with
    /// `max_chunks` chunk slots starting at `chunk_base`.
    pub(crate) fn new(
        page_count: usize,
        phys_end: PhysicalAddress,
        chunk_base: VirtualAddress,
        max_chunks: u32,
        entry_max: u32,
    ) -> Self {
        let superpages = phys_end.as_u32().div_ceil(Size4M::SIZE) as usize;
        Self {
            chunks: (0..max_chunks).map(|_| None).collect(),
            va_free: (0..max_chunks).rev().map(ChunkId).collect(),
            lru: VecDeque::new(),
            pages: (0..page_count).map(|_| PvList::default()).collect(),
            superpages: (0..superpages).map(|_| PvList::default()).collect(),
            chunk_base,
            entry_count: 0,
            entry_max,
            high_water: entry_max / 10 * 9,
        }
    }

    pub(crate) fn list(&self, key: ListKey) -> &PvList {
        match key {
            ListKey::Page(i) => &self.pages[i],
            ListKey::Superpage(sp) => &self.superpages[sp.index() as usize],
        }
    }

    pub(crate) fn list_mut(&mut self, key: ListKey) -> &mut PvList {
        match key {
            ListKey::Page(i) => &mut self.pages[i],
            ListKey::Superpage(sp) => &mut self.superpages[sp.index() as usize],
        }
    }

    /// Whether some mapping of the 4 MiB frame containing `pa` exists.
    pub(crate) fn superpage_mapped(&self, pa: PhysicalAddress) -> bool {
        !self.list(ListKey::superpage_of(pa)).is_empty()
    }

    pub(crate) fn chunk(&self, id: ChunkId) -> PvChunk {
        match self.chunks[id.index()] {
            Some(c) => c,
            None => panic!("pv chunk {id:?} is not allocated"),
        }
    }

    fn words<'m, P: PhysMemory + ?Sized>(&self, mem: &'m P, id: ChunkId) -> ChunkWords<'m> {
        ChunkWords(mem.words(self.chunk(id).page))
    }

    /// Owner and virtual address of an entry.
    pub(crate) fn entry<P: PhysMemory + ?Sized>(&self, mem: &P, pv: PvRef) -> (AsId, VirtualAddress) {
        let chunk = self.chunk(pv.chunk);
        (chunk.owner, ChunkWords(mem.words(chunk.page)).va(pv.slot))
    }

    /// Slots of `id` currently holding entries, in slot order.
    pub(crate) fn in_use<P: PhysMemory + ?Sized>(
        &self,
        mem: &P,
        id: ChunkId,
    ) -> impl Iterator<Item = u16> + use<P> {
        let maps = self.words(mem, id).maps();
        maps.into_iter()
            .zip(PC_FREEMASK)
            .enumerate()
            .flat_map(|(field, (map, mask))| {
                let mut used = !map & mask;
                core::iter::from_fn(move || {
                    if used == 0 {
                        return None;
                    }
                    let bit = used.trailing_zeros();
                    used &= used - 1;
                    Some((field * 32) as u16 + bit as u16)
                })
            })
    }

    /// Virtual address of a chunk's backing page.
    pub(crate) fn chunk_va(&self, id: ChunkId) -> VirtualAddress {
        self.chunk_base + id.0 * PAGE_SIZE
    }

    pub(crate) fn has_free_va(&self) -> bool {
        !self.va_free.is_empty()
    }

    /// Install a new chunk owned by `owner` on `page`, at the tail of the
    /// reclamation ring. Whatever `page` held before is overwritten.
    ///
    /// # Panics
    /// If the chunk virtual range is exhausted; check
    /// [`has_free_va`](Self::has_free_va) first.
    pub(crate) fn install_chunk<P: PhysMemory + ?Sized>(
        &mut self,
        mem: &P,
        owner: AsId,
        page: PhysicalPage<Size4K>,
    ) -> ChunkId {
        let Some(id) = self.va_free.pop() else {
            panic!("pv chunk virtual range exhausted");
        };
        ChunkWords(mem.words(page)).init();
        self.chunks[id.index()] = Some(PvChunk { owner, page });
        self.lru.push_back(id);
        id
    }

    /// Drop a chunk whose entries are all free, returning its page.
    pub(crate) fn remove_chunk<P: PhysMemory + ?Sized>(&mut self, mem: &P, id: ChunkId) -> PhysicalPage<Size4K> {
        assert!(
            self.words(mem, id).is_free(),
            "freeing pv chunk {id:?} with live entries"
        );
        let Some(chunk) = self.chunks[id.index()].take() else {
            panic!("pv chunk {id:?} is not allocated");
        };
        if let Some(at) = self.lru.iter().position(|&c| c == id) {
            self.lru.remove(at);
        }
        self.va_free.push(id);
        chunk.page
    }

    /// Claim a slot in `id`. Returns the entry and whether the chunk is now
    /// full.
    pub(crate) fn alloc_in<P: PhysMemory + ?Sized>(
        &mut self,
        mem: &P,
        id: ChunkId,
        va: VirtualAddress,
    ) -> Option<(PvRef, bool)> {
        let words = self.words(mem, id);
        let slot = words.alloc()?;
        words.set_va(slot, va);
        Some((PvRef { chunk: id, slot }, words.is_full()))
    }

    /// Release a slot. Returns `true` if the chunk is now entirely free.
    pub(crate) fn free_in<P: PhysMemory + ?Sized>(&mut self, mem: &P, pv: PvRef) -> bool {
        let words = self.words(mem, pv.chunk);
        words.release(pv.slot);
        words.is_free()
    }

    pub(crate) fn is_chunk_free<P: PhysMemory + ?Sized>(&self, mem: &P, id: ChunkId) -> bool {
        self.words(mem, id).is_free()
    }

    /// Free slots in `id`.
    pub(crate) fn spare_in<P: PhysMemory + ?Sized>(&self, mem: &P, id: ChunkId) -> usize {
        self.words(mem, id).spare()
    }

    /// Take the least recently used chunk off the ring.
    pub(crate) fn lru_pop(&mut self) -> Option<ChunkId> {
        self.lru.pop_front()
    }

    pub(crate) fn lru_push(&mut self, id: ChunkId) {
        self.lru.push_back(id);
    }

    pub(crate) fn lru_len(&self) -> usize {
        self.lru.len()
    }

    /// Append `entry` to a list.
    pub(crate) fn link(&mut self, key: ListKey, pv: PvRef) {
        self.list_mut(key).push_back(pv);
    }

    /// Remove `owner`'s entry for `va` from a list, if present.
    pub(crate) fn unlink<P: PhysMemory + ?Sized>(
        &mut self,
        mem: &P,
        key: ListKey,
        owner: AsId,
        va: VirtualAddress,
    ) -> Option<PvRef> {
        let chunks = &self.chunks;
        let list = match key {
            ListKey::Page(i) => &mut self.pages[i],
            ListKey::Superpage(sp) => &mut self.superpages[sp.index() as usize],
        };
        list.remove_where(|pv| {
            chunks[pv.chunk.index()].is_some_and(|c| {
                c.owner == owner && ChunkWords(mem.words(c.page)).va(pv.slot) == va
            })
        })
    }

    /// Remove this exact entry from a list.
    pub(crate) fn unlink_ref(&mut self, key: ListKey, pv: PvRef) -> bool {
        self.list_mut(key).remove_where(|p| p == pv).is_some()
    }

    /// Entries of a list as `(owner, va)`, in list order.
    pub(crate) fn entries<P: PhysMemory + ?Sized>(&self, mem: &P, key: ListKey) -> Vec<(AsId, VirtualAddress)> {
        self.list(key).iter().map(|pv| self.entry(mem, pv)).collect()
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.iter().filter(|c| c.is_some()).count()
    }
}
