use crate::{PageSize, PhysicalAddress, VirtualAddress};
use core::fmt;
use core::marker::PhantomData;

/// Virtual page base for size `S`.
///
/// The low `S::SHIFT` bits are always zero. [`index`](Self::index) is the
/// page number, which for [`Size4M`](crate::Size4M) is the page-directory
/// slot.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualPage<S: PageSize> {
    base: u32,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> VirtualPage<S> {
    /// Page containing `va` (aligns down).
    #[inline]
    #[must_use]
    pub const fn from_addr(va: VirtualAddress) -> Self {
        Self {
            base: va.as_u32() & !S::MASK,
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self {
            base: index << S::SHIFT,
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> VirtualAddress {
        VirtualAddress::new(self.base)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.base >> S::SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: u32) -> VirtualAddress {
        VirtualAddress::new(self.base | (off & S::MASK))
    }
}

impl<S: PageSize> fmt::Display for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}/{}", self.base, S::as_str())
    }
}

impl<S: PageSize> fmt::Debug for VirtualPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualPage<{}>(0x{:08X})", S::as_str(), self.base)
    }
}

/// Physical page base for size `S`.
///
/// For [`Size4K`](crate::Size4K) the [`index`](Self::index) is the page frame
/// number; for [`Size4M`](crate::Size4M) it is the physical superpage number
/// used to find the superpage reverse-mapping head.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalPage<S: PageSize> {
    base: u32,
    _phantom: PhantomData<S>,
}

impl<S: PageSize> PhysicalPage<S> {
    /// Page containing `pa` (aligns down).
    #[inline]
    #[must_use]
    pub const fn from_addr(pa: PhysicalAddress) -> Self {
        Self {
            base: pa.as_u32() & !S::MASK,
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self {
            base: index << S::SHIFT,
            _phantom: PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress::new(self.base)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.base >> S::SHIFT
    }

    #[inline]
    #[must_use]
    pub const fn join(self, off: u32) -> PhysicalAddress {
        PhysicalAddress::new(self.base | (off & S::MASK))
    }

    /// The page immediately following this one.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Self {
        Self {
            base: self.base + S::SIZE,
            _phantom: PhantomData,
        }
    }
}

impl<S: PageSize> fmt::Display for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}/{}", self.base, S::as_str())
    }
}

impl<S: PageSize> fmt::Debug for PhysicalPage<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysicalPage<{}>(0x{:08X})", S::as_str(), self.base)
    }
}
