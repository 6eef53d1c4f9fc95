//! # Translation entries
//!
//! The 32-bit page-table and page-directory entry formats, and lock-free
//! access to entries that live in physical memory and may be updated by the
//! MMU (accessed/dirty bits) at any time.
//!
//! ### Bit layout
//!
//! | Bits  | PTE (4 KiB leaf)  | PDE (table pointer) | PDE (4 MiB leaf) |
//! |-------|-------------------|---------------------|------------------|
//! | 0     | `P` present       | `P`                 | `P`              |
//! | 1     | `RW` writable     | `RW`                | `RW`             |
//! | 2     | `US` user         | `US`                | `US`             |
//! | 3     | `PWT`             | `PWT`               | `PWT`            |
//! | 4     | `PCD`             | `PCD`               | `PCD`            |
//! | 5     | `A` accessed      | `A`                 | `A`              |
//! | 6     | `D` dirty         | ignored             | `D`              |
//! | 7     | `PAT`             | `PS` = 0            | `PS` = 1         |
//! | 8     | `G` global        | ignored             | `G`              |
//! | 9     | wired (software)  | –                   | wired            |
//! | 10    | managed (software)| –                   | managed          |
//! | 11    | available         | available           | available        |
//! | 12    | frame             | table frame         | `PAT`            |
//! | 13–21 | frame             | table frame         | reserved (0)     |
//! | 22–31 | frame             | table frame         | superpage frame  |
//!
//! Everything else in the crate manipulates entries through the typed
//! accessors below; no other module knows a bit position.

use crate::cache::CacheBits;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU32, Ordering};
use bitfield_struct::bitfield;
use kernel_info::memory::NPTEPG;
use kernel_memory_addresses::{PageSize, PhysicalAddress, PhysicalPage, Size4K, Size4M};

/// Hardware and software flag bits (0..=10) shared by both entry formats.
const FLAGS_MASK: u32 = 0x7FF;

/// Bit 12 of a superpage PDE, the PAT selector.
const PDE_PAT: u32 = 1 << 12;

/// Bit 7 of a PTE, the PAT selector.
const PTE_PAT: u32 = 1 << 7;

/// A 4 KiB page-table entry.
///
/// ### Example
/// ```rust
/// # use kernel_pmap::PtEntry;
/// # use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};
/// let page = PhysicalPage::from_addr(PhysicalAddress::new(0x0040_3000));
/// let e = PtEntry::new().with_present(true).with_writable(true).with_page(page);
/// assert!(e.present() && e.writable() && !e.dirty());
/// assert_eq!(e.page(), page);
/// ```
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PtEntry {
    /// `P`: the entry translates.
    pub present: bool,
    /// `RW`: writes are permitted.
    pub writable: bool,
    /// `US`: user mode may access the page.
    pub user: bool,
    /// `PWT`: write-through caching (PAT index bit 0).
    pub write_through: bool,
    /// `PCD`: cache disable (PAT index bit 1).
    pub cache_disable: bool,
    /// `A`: set by the MMU on any access.
    pub accessed: bool,
    /// `D`: set by the MMU on the first write.
    pub dirty: bool,
    /// `PAT`: PAT index bit 2.
    pub pat: bool,
    /// `G`: survives a CR3 reload.
    pub global: bool,
    /// Software: the mapping is wired.
    pub wired: bool,
    /// Software: the mapping has a reverse-mapping record.
    pub managed: bool,
    #[bits(1)]
    __: u8,
    #[bits(20)]
    frame: u32,
}

/// A page-directory entry: either a pointer to a page-table page or, with
/// [`superpage`](Self::superpage) set, a 4 MiB leaf.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct PdEntry {
    pub present: bool,
    pub writable: bool,
    pub user: bool,
    pub write_through: bool,
    pub cache_disable: bool,
    pub accessed: bool,
    /// `D`, only meaningful for a superpage.
    pub dirty: bool,
    /// `PS`: the entry maps a 4 MiB page directly.
    pub superpage: bool,
    /// `G`, only meaningful for a superpage.
    pub global: bool,
    pub wired: bool,
    pub managed: bool,
    #[bits(1)]
    __: u8,
    #[bits(20)]
    address: u32,
}

impl PtEntry {
    /// Physical page this entry translates to.
    #[inline]
    #[must_use]
    pub const fn page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_index(self.frame())
    }

    #[inline]
    #[must_use]
    pub const fn with_page(self, page: PhysicalPage<Size4K>) -> Self {
        self.with_frame(page.index())
    }

    #[inline]
    #[must_use]
    pub const fn phys(self) -> PhysicalAddress {
        self.page().base()
    }

    #[inline]
    #[must_use]
    pub const fn cache(self) -> CacheBits {
        CacheBits {
            pat: self.pat(),
            pcd: self.cache_disable(),
            pwt: self.write_through(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn with_cache(self, c: CacheBits) -> Self {
        self.with_pat(c.pat)
            .with_cache_disable(c.pcd)
            .with_write_through(c.pwt)
    }

    /// Flag bits only, frame cleared.
    #[inline]
    #[must_use]
    pub const fn flags(self) -> Self {
        Self::from_bits(self.into_bits() & FLAGS_MASK)
    }

    /// Whether two entries agree on every flag that must be uniform across a
    /// superpage: permissions, caching, global, wired, managed, accessed and
    /// dirty.
    #[inline]
    #[must_use]
    pub const fn same_flags(self, other: Self) -> bool {
        self.into_bits() & FLAGS_MASK == other.into_bits() & FLAGS_MASK
    }

    /// Zero is the only "absent" encoding the manager writes.
    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.into_bits() == 0
    }

    /// Entry with only `writable` and `dirty` set, for clearing both at once.
    #[inline]
    #[must_use]
    pub const fn write_bits() -> Self {
        Self::new().with_writable(true).with_dirty(true)
    }

    /// The superpage PDE equivalent of a 4 KiB mapping at the start of an
    /// aligned 4 MiB run.
    #[inline]
    #[must_use]
    pub const fn into_superpage(self) -> PdEntry {
        let mut bits = self.into_bits() & !PTE_PAT;
        if self.pat() {
            bits |= PDE_PAT;
        }
        PdEntry::from_bits(bits).with_superpage(true)
    }
}

impl PdEntry {
    /// Pointer to a page-table page. Intermediate levels get the most
    /// permissive protection; the leaves decide.
    #[inline]
    #[must_use]
    pub const fn table(page: PhysicalPage<Size4K>, user: bool) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_accessed(true)
            .with_dirty(true)
            .with_address(page.index())
    }

    /// The page-table page this entry points to. Meaningless for superpages.
    #[inline]
    #[must_use]
    pub const fn table_page(self) -> PhysicalPage<Size4K> {
        PhysicalPage::from_index(self.address())
    }

    /// The 4 MiB frame of a superpage entry.
    #[inline]
    #[must_use]
    pub const fn superpage_frame(self) -> PhysicalPage<Size4M> {
        PhysicalPage::from_addr(PhysicalAddress::new(
            self.into_bits() & !(Size4M::MASK),
        ))
    }

    #[inline]
    #[must_use]
    pub const fn with_superpage_frame(self, frame: PhysicalPage<Size4M>) -> Self {
        Self::from_bits((self.into_bits() & Size4M::MASK) | frame.base().as_u32())
    }

    /// `PAT` of a superpage entry (bit 12).
    #[inline]
    #[must_use]
    pub const fn large_pat(self) -> bool {
        self.into_bits() & PDE_PAT != 0
    }

    #[inline]
    #[must_use]
    pub const fn cache(self) -> CacheBits {
        CacheBits {
            pat: self.large_pat(),
            pcd: self.cache_disable(),
            pwt: self.write_through(),
        }
    }

    /// Set the cache bits of a superpage entry.
    #[inline]
    #[must_use]
    pub const fn with_cache(self, c: CacheBits) -> Self {
        let bits = if c.pat {
            self.into_bits() | PDE_PAT
        } else {
            self.into_bits() & !PDE_PAT
        };
        Self::from_bits(bits)
            .with_cache_disable(c.pcd)
            .with_write_through(c.pwt)
    }

    /// The 4 KiB entry for the first page of this superpage, carrying the
    /// same flags with `PS` dropped and `PAT` moved back to bit 7.
    #[inline]
    #[must_use]
    pub const fn first_small(self) -> PtEntry {
        let flags = self.into_bits() & FLAGS_MASK & !PTE_PAT;
        let pat = if self.large_pat() { PTE_PAT } else { 0 };
        PtEntry::from_bits(self.superpage_frame().base().as_u32() | flags | pat)
    }

    #[inline]
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.into_bits() == 0
    }

    /// Entry with only `writable` and `dirty` set, for clearing both at once.
    #[inline]
    #[must_use]
    pub const fn write_bits() -> Self {
        Self::new().with_writable(true).with_dirty(true)
    }
}

/// Conversion between a typed entry and the raw word in memory.
pub trait Entry: Copy {
    fn into_raw(self) -> u32;
    fn from_raw(raw: u32) -> Self;
}

impl Entry for PtEntry {
    #[inline]
    fn into_raw(self) -> u32 {
        self.into_bits()
    }

    #[inline]
    fn from_raw(raw: u32) -> Self {
        Self::from_bits(raw)
    }
}

impl Entry for PdEntry {
    #[inline]
    fn into_raw(self) -> u32 {
        self.into_bits()
    }

    #[inline]
    fn from_raw(raw: u32) -> Self {
        Self::from_bits(raw)
    }
}

/// One entry in a live page table or directory.
///
/// All updates are single aligned 32-bit atomic operations, so a concurrent
/// hardware walk sees either the old or the new entry, never a mix.
pub struct Slot<'a, E> {
    word: &'a AtomicU32,
    _entry: PhantomData<E>,
}

impl<E> Clone for Slot<'_, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for Slot<'_, E> {}

impl<'a, E: Entry> Slot<'a, E> {
    #[inline]
    #[must_use]
    pub const fn new(word: &'a AtomicU32) -> Self {
        Self {
            word,
            _entry: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub fn load(self) -> E {
        E::from_raw(self.word.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(self, e: E) {
        self.word.store(e.into_raw(), Ordering::Release);
    }

    /// Store `e`, returning the previous entry with whatever accessed/dirty
    /// bits the MMU set up to the instant of the swap.
    #[inline]
    pub fn swap(self, e: E) -> E {
        E::from_raw(self.word.swap(e.into_raw(), Ordering::AcqRel))
    }

    /// Clear the entry, returning what it held.
    #[inline]
    pub fn take(self) -> E {
        E::from_raw(self.word.swap(0, Ordering::AcqRel))
    }

    /// Replace `current` with `new` if the entry still holds `current`.
    ///
    /// # Errors
    /// Returns the entry actually found when it differs from `current`.
    #[inline]
    pub fn compare_exchange(self, current: E, new: E) -> Result<E, E> {
        self.word
            .compare_exchange(
                current.into_raw(),
                new.into_raw(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(E::from_raw)
            .map_err(E::from_raw)
    }

    /// Atomically clear every bit set in `mask`, returning the old entry.
    #[inline]
    pub fn clear(self, mask: E) -> E {
        E::from_raw(self.word.fetch_and(!mask.into_raw(), Ordering::AcqRel))
    }

    /// Atomically set every bit set in `mask`, returning the old entry.
    #[inline]
    pub fn set(self, mask: E) -> E {
        E::from_raw(self.word.fetch_or(mask.into_raw(), Ordering::AcqRel))
    }

    #[inline]
    #[must_use]
    pub fn same_as(self, other: Self) -> bool {
        core::ptr::eq(self.word, other.word)
    }
}

/// A page of entries: a page table or the page directory.
pub struct Table<'a, E> {
    words: &'a [AtomicU32; NPTEPG],
    _entry: PhantomData<E>,
}

impl<E> Clone for Table<'_, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for Table<'_, E> {}

/// A page-table page.
pub type PageTable<'a> = Table<'a, PtEntry>;

/// The page directory of an address space.
pub type PageDirectory<'a> = Table<'a, PdEntry>;

impl<'a, E: Entry> Table<'a, E> {
    #[inline]
    #[must_use]
    pub const fn new(words: &'a [AtomicU32; NPTEPG]) -> Self {
        Self {
            words,
            _entry: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub fn slot(self, index: usize) -> Slot<'a, E> {
        Slot::new(&self.words[index])
    }

    /// Iterate over every slot in index order.
    pub fn slots(self) -> impl DoubleEndedIterator<Item = Slot<'a, E>> + ExactSizeIterator {
        self.words.iter().map(Slot::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_layout_matches_hardware() {
        let page = PhysicalPage::from_addr(PhysicalAddress::new(0x1234_5000));
        let e = PtEntry::new()
            .with_present(true)
            .with_writable(true)
            .with_wired(true)
            .with_page(page);
        assert_eq!(e.into_bits(), 0x1234_5000 | 0x1 | 0x2 | 0x200);
        assert_eq!(e.phys().as_u32(), 0x1234_5000);
        assert!(!e.managed());
    }

    #[test]
    fn superpage_conversion_moves_pat() {
        let pte = PtEntry::new()
            .with_present(true)
            .with_accessed(true)
            .with_pat(true)
            .with_write_through(true)
            .with_page(PhysicalPage::from_addr(PhysicalAddress::new(0x0080_0000)));
        let pde = pte.into_superpage();
        assert!(pde.superpage());
        assert!(pde.large_pat());
        assert!(pde.write_through());
        assert_eq!(pde.superpage_frame().base().as_u32(), 0x0080_0000);
        assert_eq!(pde.first_small(), pte);
    }

    #[test]
    fn superpage_frame_ignores_pat_bit() {
        let pde = PdEntry::new()
            .with_present(true)
            .with_superpage(true)
            .with_superpage_frame(PhysicalPage::from_index(3))
            .with_cache(CacheBits {
                pat: true,
                pcd: false,
                pwt: false,
            });
        assert_eq!(pde.superpage_frame().base().as_u32(), 0x00C0_0000);
        assert!(pde.large_pat());
        let cleared = pde.with_cache(CacheBits::default());
        assert!(!cleared.large_pat());
        assert_eq!(cleared.superpage_frame(), pde.superpage_frame());
    }

    #[test]
    fn table_pointer_round_trips() {
        let page = PhysicalPage::from_addr(PhysicalAddress::new(0x0030_2000));
        let pde = PdEntry::table(page, true);
        assert!(pde.present() && pde.writable() && pde.user());
        assert!(!pde.superpage());
        assert_eq!(pde.table_page(), page);
    }

    #[test]
    fn slot_atomic_operations() {
        let word = AtomicU32::new(0);
        let slot: Slot<'_, PtEntry> = Slot::new(&word);
        let e = PtEntry::new()
            .with_present(true)
            .with_writable(true)
            .with_dirty(true);
        slot.store(e);
        let old = slot.clear(PtEntry::write_bits());
        assert_eq!(old, e);
        assert_eq!(slot.load(), PtEntry::new().with_present(true));
        assert!(slot.compare_exchange(e, PtEntry::new()).is_err());
        assert!(slot.take().present());
        assert!(slot.load().is_zero());
    }
}
