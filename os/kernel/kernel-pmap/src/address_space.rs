//! # Address spaces
//!
//! One [`AddressSpace`] per process plus the distinguished kernel space.
//! Each owns a page directory, counters, the index of its page-table pages,
//! and the list of reverse-mapping chunks holding its entries.
//!
//! The mutable part ([`SpaceState`]) sits behind the per-space lock. The
//! active-CPU set is updated atomically outside of it, by
//! [`Pmap::activate`](crate::Pmap::activate).

use crate::cpuset::{AtomicCpuSet, CpuSet};
use crate::ptp::PtpIndex;
use crate::pv::ChunkId;
use alloc::collections::VecDeque;
use core::fmt;
use kernel_memory_addresses::{PhysicalPage, Size4K};
use kernel_sync::SpinMutex;

/// Identity of an address space, stable for its lifetime.
///
/// Also the lock order between address spaces: when two must be held at
/// once, the lower id is taken first.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AsId(u32);

impl AsId {
    pub const KERNEL: Self = Self(0);

    #[inline]
    #[must_use]
    pub(crate) const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for AsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::KERNEL {
            f.write_str("as:kernel")
        } else {
            write!(f, "as:{}", self.0)
        }
    }
}

/// Page counters of an address space.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SpaceStats {
    /// Mapped 4 KiB pages, counting a superpage as 1024, plus page-table
    /// pages of user spaces.
    pub resident: u32,
    /// Wired 4 KiB mappings, counting a wired superpage as 1024.
    pub wired: u32,
}

/// State guarded by the address-space lock.
pub(crate) struct SpaceState {
    pub(crate) stats: SpaceStats,
    pub(crate) ptps: PtpIndex,
    /// Chunks owned by this space. Chunks with free slots are kept at the
    /// front.
    pub(crate) pv_chunks: VecDeque<ChunkId>,
}

pub struct AddressSpace {
    id: AsId,
    directory: PhysicalPage<Size4K>,
    active: AtomicCpuSet,
    pub(crate) state: SpinMutex<SpaceState>,
}

impl AddressSpace {
    pub(crate) fn new(id: AsId, directory: PhysicalPage<Size4K>, active: CpuSet) -> Self {
        Self {
            id,
            directory,
            active: AtomicCpuSet::new(active),
            state: SpinMutex::new(SpaceState {
                stats: SpaceStats::default(),
                ptps: PtpIndex::new(),
                pv_chunks: VecDeque::new(),
            }),
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> AsId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn is_kernel(&self) -> bool {
        self.id == AsId::KERNEL
    }

    /// Physical page of the page directory, the value loaded into CR3.
    #[inline]
    #[must_use]
    pub const fn directory(&self) -> PhysicalPage<Size4K> {
        self.directory
    }

    /// CPUs on which this space is currently loaded.
    #[inline]
    #[must_use]
    pub fn active_cpus(&self) -> CpuSet {
        self.active.load()
    }

    pub(crate) const fn active(&self) -> &AtomicCpuSet {
        &self.active
    }

    /// Snapshot of the page counters.
    #[must_use]
    pub fn stats(&self) -> SpaceStats {
        self.state.lock().stats
    }

    #[must_use]
    pub fn resident_count(&self) -> u32 {
        self.stats().resident
    }

    #[must_use]
    pub fn wired_count(&self) -> u32 {
        self.stats().wired
    }

    /// Number of page-table pages, including those held for superpages.
    #[must_use]
    pub fn page_table_pages(&self) -> usize {
        self.state.lock().ptps.len()
    }
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("id", &self.id)
            .field("directory", &self.directory)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}
