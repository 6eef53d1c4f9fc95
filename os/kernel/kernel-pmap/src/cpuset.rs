//! CPU identifiers and bitmask sets of CPUs.

use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::memory::MAXCPU;

/// Index of a hardware execution context.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CpuId(u32);

impl CpuId {
    /// # Panics
    /// If `index` is not below [`MAXCPU`].
    #[inline]
    #[must_use]
    pub const fn new(index: usize) -> Self {
        assert!(index < MAXCPU, "cpu index out of range");
        Self(index as u32)
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// A set of CPUs, one bit per [`CpuId`].
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct CpuSet(u32);

impl CpuSet {
    pub const EMPTY: Self = Self(0);

    /// The first `count` CPUs.
    #[inline]
    #[must_use]
    pub const fn first(count: usize) -> Self {
        if count >= MAXCPU {
            Self(u32::MAX)
        } else {
            Self((1 << count) - 1)
        }
    }

    #[inline]
    #[must_use]
    pub const fn single(cpu: CpuId) -> Self {
        Self(1 << cpu.0)
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & (1 << cpu.0) != 0
    }

    #[inline]
    #[must_use]
    pub const fn with(self, cpu: CpuId) -> Self {
        Self(self.0 | (1 << cpu.0))
    }

    #[inline]
    #[must_use]
    pub const fn without(self, cpu: CpuId) -> Self {
        Self(self.0 & !(1 << cpu.0))
    }

    #[inline]
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        let mut rest = self.0;
        core::iter::from_fn(move || {
            if rest == 0 {
                return None;
            }
            let bit = rest.trailing_zeros();
            rest &= rest - 1;
            Some(CpuId(bit))
        })
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(CpuId::index)).finish()
    }
}

/// A [`CpuSet`] updated concurrently, such as the active set of an address
/// space.
#[derive(Default)]
pub struct AtomicCpuSet(AtomicU32);

impl AtomicCpuSet {
    #[must_use]
    pub const fn new(set: CpuSet) -> Self {
        Self(AtomicU32::new(set.0))
    }

    #[inline]
    pub fn load(&self) -> CpuSet {
        CpuSet(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn insert(&self, cpu: CpuId) {
        self.0.fetch_or(1 << cpu.0, Ordering::AcqRel);
    }

    #[inline]
    pub fn remove(&self, cpu: CpuId) {
        self.0.fetch_and(!(1 << cpu.0), Ordering::AcqRel);
    }
}

impl fmt::Debug for AtomicCpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}
