//! # Physical page supplier
//!
//! The translation manager does not own physical memory. It borrows pages
//! for page tables and reverse-mapping chunks from a [`PageSupplier`], and
//! it reads and updates the per-page metadata record ([`VmPage`]) of every
//! page it maps.

use crate::cache::MemAttr;
use bitfield_struct::bitfield;
use core::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

/// Allocation request flags.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct AllocFlags {
    /// The caller tolerates sleeping until memory is available.
    pub may_block: bool,
    /// The page must be returned zero-filled (the supplier may instead
    /// report via [`VmPage::is_zeroed`] and leave zeroing to the caller).
    pub zeroed: bool,
    /// The page is wired on return.
    pub wired: bool,
    /// The page belongs to no memory object; it is never managed.
    pub no_object: bool,
    #[bits(4)]
    __: u8,
}

impl AllocFlags {
    /// What page-table pages and chunk pages ask for.
    #[inline]
    #[must_use]
    pub const fn page_table() -> Self {
        Self::new().with_no_object(true).with_wired(true).with_zeroed(true)
    }
}

/// Lifetime flags of a page, owned by the supplier.
#[bitfield(u8)]
struct PageFlags {
    /// Known to contain only zeroes.
    zeroed: bool,
    /// Describes device memory, not RAM.
    fictitious: bool,
    /// Mappings are not tracked by reverse-mapping records.
    unmanaged: bool,
    #[bits(5)]
    __: u8,
}

/// Flags mirrored from hardware, updated atomically under no lock.
#[bitfield(u8)]
struct PageAFlags {
    /// Some mapping had its accessed bit set when torn down or cleared.
    referenced: bool,
    /// Some mapping may be writable.
    writeable: bool,
    /// Some mapping had its dirty bit set when torn down or write-protected.
    dirty: bool,
    #[bits(5)]
    __: u8,
}

/// Metadata record of one physical page.
#[derive(Debug)]
pub struct VmPage {
    phys: PhysicalPage<Size4K>,
    index: usize,
    flags: AtomicU8,
    aflags: AtomicU8,
    pat_mode: AtomicU8,
    hold_count: AtomicU32,
    pindex: AtomicU32,
}

impl VmPage {
    /// A record for `phys`, the `index`th page of its supplier.
    #[must_use]
    pub const fn new(phys: PhysicalPage<Size4K>, index: usize) -> Self {
        Self {
            phys,
            index,
            flags: AtomicU8::new(0),
            aflags: AtomicU8::new(0),
            pat_mode: AtomicU8::new(MemAttr::WriteBack as u8),
            hold_count: AtomicU32::new(0),
            pindex: AtomicU32::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub const fn phys(&self) -> PhysicalPage<Size4K> {
        self.phys
    }

    #[inline]
    #[must_use]
    pub const fn pa(&self) -> PhysicalAddress {
        self.phys.base()
    }

    /// Dense index of this record within its supplier.
    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    fn flags(&self) -> PageFlags {
        PageFlags::from_bits(self.flags.load(Ordering::Acquire))
    }

    fn update_flags(&self, f: impl Fn(PageFlags) -> PageFlags) {
        let _ = self
            .flags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(f(PageFlags::from_bits(v)).into_bits())
            });
    }

    fn aflags(&self) -> PageAFlags {
        PageAFlags::from_bits(self.aflags.load(Ordering::Acquire))
    }

    fn update_aflags(&self, f: impl Fn(PageAFlags) -> PageAFlags) {
        let _ = self
            .aflags
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(f(PageAFlags::from_bits(v)).into_bits())
            });
    }

    #[inline]
    #[must_use]
    pub fn is_managed(&self) -> bool {
        !self.flags().unmanaged()
    }

    #[inline]
    #[must_use]
    pub fn is_fictitious(&self) -> bool {
        self.flags().fictitious()
    }

    #[inline]
    #[must_use]
    pub fn is_zeroed(&self) -> bool {
        self.flags().zeroed()
    }

    /// Supplier-side: (re)initialize the record for a fresh allocation.
    pub fn reset(&self, pindex: u32, managed: bool, zeroed: bool) {
        self.flags.store(
            PageFlags::new()
                .with_unmanaged(!managed)
                .with_zeroed(zeroed)
                .into_bits(),
            Ordering::Release,
        );
        self.aflags.store(0, Ordering::Release);
        self.hold_count.store(0, Ordering::Release);
        self.pindex.store(pindex, Ordering::Release);
    }

    pub fn set_zeroed(&self, zeroed: bool) {
        self.update_flags(|f| f.with_zeroed(zeroed));
    }

    pub fn set_fictitious(&self, fictitious: bool) {
        self.update_flags(|f| f.with_fictitious(fictitious).with_unmanaged(fictitious));
    }

    #[inline]
    #[must_use]
    pub fn pindex(&self) -> u32 {
        self.pindex.load(Ordering::Acquire)
    }

    /// Record that the page contents changed behind the VM's back.
    pub fn mark_dirty(&self) {
        self.update_aflags(|f| f.with_dirty(true));
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.aflags().dirty()
    }

    pub fn clear_dirty(&self) {
        self.update_aflags(|f| f.with_dirty(false));
    }

    pub fn set_referenced(&self) {
        self.update_aflags(|f| f.with_referenced(true));
    }

    #[must_use]
    pub fn is_referenced(&self) -> bool {
        self.aflags().referenced()
    }

    pub fn clear_referenced(&self) {
        self.update_aflags(|f| f.with_referenced(false));
    }

    pub fn set_writeable(&self) {
        self.update_aflags(|f| f.with_writeable(true));
    }

    pub fn clear_writeable(&self) {
        self.update_aflags(|f| f.with_writeable(false));
    }

    /// Whether some mapping of the page may be writable. A cheap filter for
    /// the page-centric write operations.
    #[must_use]
    pub fn is_writeable(&self) -> bool {
        self.aflags().writeable()
    }

    #[must_use]
    pub fn memattr(&self) -> MemAttr {
        MemAttr::from_u8(self.pat_mode.load(Ordering::Acquire)).unwrap_or_default()
    }

    pub(crate) fn store_memattr(&self, mode: MemAttr) {
        self.pat_mode.store(mode.as_u8(), Ordering::Release);
    }

    /// Pin the page against reuse. Paired with [`unhold`](Self::unhold).
    pub fn hold(&self) {
        self.hold_count.fetch_add(1, Ordering::AcqRel);
    }

    /// # Panics
    /// If the page is not held.
    pub fn unhold(&self) {
        let prev = self.hold_count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "unhold of unheld page {}", self.phys);
    }

    #[must_use]
    pub fn hold_count(&self) -> u32 {
        self.hold_count.load(Ordering::Acquire)
    }
}

/// The physical page allocator and metadata store below the manager.
pub trait PageSupplier: Sync {
    /// Allocate one page for object offset `pindex`.
    ///
    /// Returns `None` if no page is available right now; the caller decides
    /// whether to [`wait`](Self::wait) and retry.
    fn alloc_page(&self, pindex: u32, flags: AllocFlags) -> Option<&VmPage>;

    /// Return a page obtained from [`alloc_page`](Self::alloc_page).
    fn free_page(&self, page: &VmPage);

    /// The metadata record of the page containing `pa`, or `None` for
    /// addresses outside managed RAM (device memory).
    fn page(&self, pa: PhysicalAddress) -> Option<&VmPage>;

    /// Number of pages the supplier manages.
    fn page_count(&self) -> usize;

    /// First address above all managed RAM.
    fn phys_end(&self) -> PhysicalAddress;

    /// Sleep until pages may be available. Returns `false` if waiting cannot
    /// help (nothing will ever be freed).
    fn wait(&self) -> bool;
}
