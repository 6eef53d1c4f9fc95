use crate::{PageSize, VirtualPage};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Virtual memory address.
///
/// Carries the *kind* of address at the type level so it cannot be handed
/// to code expecting a [`PhysicalAddress`](crate::PhysicalAddress).
///
/// ### Semantics
/// - [`page`](Self::page) / [`offset`](Self::offset) / [`split`](Self::split)
///   derive the page base and in-page offset for a concrete [`PageSize`].
/// - Arithmetic wraps like the hardware does; range loops should compare
///   against an exclusive end computed up front.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let va = VirtualAddress::new(0xBFBF_E123);
/// assert_eq!(va.page::<Size4K>().base().as_u32(), 0xBFBF_E000);
/// assert_eq!(va.offset::<Size4K>(), 0x123);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u32);

impl VirtualAddress {
    /// Base of the highest 4 KiB page in the address space.
    pub const MAX_PAGE: Self = Self(0xFFFF_F000);

    #[inline]
    #[must_use]
    pub const fn new(v: u32) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    #[inline]
    #[must_use]
    pub const fn page<S: PageSize>(self) -> VirtualPage<S> {
        VirtualPage::from_addr(self)
    }

    #[inline]
    #[must_use]
    pub const fn offset<S: PageSize>(self) -> u32 {
        self.0 & S::MASK
    }

    #[inline]
    #[must_use]
    pub const fn split<S: PageSize>(self) -> (VirtualPage<S>, u32) {
        (self.page::<S>(), self.offset::<S>())
    }

    #[inline]
    #[must_use]
    pub const fn is_aligned<S: PageSize>(self) -> bool {
        self.0 & S::MASK == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down<S: PageSize>(self) -> Self {
        Self(self.0 & !S::MASK)
    }

    /// Round up to the next boundary of `S`, saturating at the last page
    /// boundary of the address space instead of wrapping to zero.
    #[inline]
    #[must_use]
    pub const fn align_up<S: PageSize>(self) -> Self {
        match self.0.checked_add(S::MASK) {
            Some(v) => Self(v & !S::MASK),
            None => Self(u32::MAX & !S::MASK),
        }
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u32) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:08X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl fmt::LowerHex for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<u32> for VirtualAddress {
    #[inline]
    fn from(v: u32) -> Self {
        Self(v)
    }
}

impl From<VirtualAddress> for u32 {
    #[inline]
    fn from(v: VirtualAddress) -> Self {
        v.0
    }
}

impl Add<u32> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub for VirtualAddress {
    type Output = u32;
    #[inline]
    fn sub(self, rhs: Self) -> u32 {
        self.0.wrapping_sub(rhs.0)
    }
}
