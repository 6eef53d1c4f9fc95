//! Event counters.

use core::sync::atomic::{AtomicU64, Ordering};

/// A relaxed event counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    #[inline]
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, n: u64) {
        self.0.fetch_sub(n, Ordering::Relaxed);
    }

    #[inline]
    #[must_use]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Raise the counter to `value` if it is lower.
    #[inline]
    pub fn raise(&self, value: u64) {
        self.0.fetch_max(value, Ordering::Relaxed);
    }
}

/// What the manager did, for diagnostics and tests.
#[derive(Debug, Default)]
pub struct PmapStats {
    /// 4 MiB page promotions.
    pub pde_promotions: Counter,
    /// 4 MiB page demotions.
    pub pde_demotions: Counter,
    /// Promotion attempts that found the run unsuitable.
    pub pde_p_failures: Counter,
    /// 4 MiB mappings created directly (always zero, no caller does it).
    pub pde_mappings: Counter,
    pub pv_entry_count: Counter,
    pub pv_entry_high_water: Counter,
    pub pv_entry_allocs: Counter,
    pub pv_entry_frees: Counter,
    /// Free entries in allocated chunks.
    pub pv_entry_spare: Counter,
    pub pc_chunk_count: Counter,
    pub pc_chunk_allocs: Counter,
    pub pc_chunk_frees: Counter,
    /// Chunk page allocations that failed.
    pub pc_chunk_tryfail: Counter,
    /// Times the reclaim path ran.
    pub pv_reclaims: Counter,
    pub shootdowns: Counter,
}
