//! Tunables of the translation manager.

use utils_accessors_derive::Setters;

/// Manager configuration, fixed at [`bootstrap`](crate::Pmap::bootstrap).
///
/// ```rust
/// # use kernel_pmap::PmapConfig;
/// let config = PmapConfig::default()
///     .with_superpages_enabled(false)
///     .with_max_proc(64);
/// assert!(!config.superpages_enabled());
/// assert_eq!(config.shpgperproc(), 200);
/// ```
#[derive(Copy, Clone, Debug, Eq, PartialEq, Setters)]
pub struct PmapConfig {
    /// Promote fully populated page tables to 4 MiB mappings.
    superpages_enabled: bool,
    /// Serialize page-size changes through an all-CPU rendezvous.
    workaround_erratum383: bool,
    /// Processes the reverse-mapping budget is sized for.
    max_proc: u32,
    /// Shared pages per process in the reverse-mapping budget.
    shpgperproc: u32,
    /// Absolute reverse-mapping budget; overrides the computed one.
    pv_entry_max: Option<u32>,
    /// Reclaim stops after freeing this many entries of the requesting
    /// address space (or a whole chunk, whichever comes first).
    reclaim_own_entries: u32,
    /// Ranges up to this many bytes are flushed line by line.
    clflush_threshold: u32,
    /// Give kernel mappings the global bit when the CPU supports it.
    use_global_pages: bool,
}

impl Default for PmapConfig {
    fn default() -> Self {
        Self {
            superpages_enabled: true,
            workaround_erratum383: false,
            max_proc: 1024,
            shpgperproc: 200,
            pv_entry_max: None,
            reclaim_own_entries: 1,
            clflush_threshold: 2 * 1024 * 1024,
            use_global_pages: true,
        }
    }
}

impl PmapConfig {
    /// Reverse-mapping entry budget for a machine with `page_count` pages.
    #[must_use]
    pub fn pv_budget(&self, page_count: usize) -> u32 {
        self.pv_entry_max.unwrap_or_else(|| {
            self.shpgperproc
                .saturating_mul(self.max_proc)
                .saturating_add(u32::try_from(page_count).unwrap_or(u32::MAX))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_follows_process_count() {
        let config = PmapConfig::default().with_max_proc(10).with_shpgperproc(5);
        assert_eq!(config.pv_budget(100), 150);
        assert_eq!(config.with_pv_entry_max(Some(7)).pv_budget(100), 7);
    }

    #[test]
    fn setters_chain_in_place() {
        let mut config = PmapConfig::default();
        config.set_reclaim_own_entries(4).set_use_global_pages(false);
        assert_eq!(config.reclaim_own_entries(), 4);
        assert!(!config.use_global_pages());
    }
}
