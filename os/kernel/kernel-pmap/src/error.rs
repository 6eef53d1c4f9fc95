use kernel_memory_addresses::VirtualAddress;
use thiserror::Error;

/// Recoverable failures of the translation manager.
///
/// Broken invariants (a wire count out of sync, an expected entry found
/// empty) are not represented here; they panic.
#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum PmapError {
    /// No page-table page or reverse-mapping chunk could be had, and
    /// blocking was not allowed or could not help. The caller may retry.
    #[error("out of page-table pages or reverse-mapping entries")]
    ResourceShortage,
    /// The address range is not valid for this operation.
    #[error("invalid address range starting at {0}")]
    InvalidAddress(VirtualAddress),
    /// A page in the range has no translation.
    #[error("no translation for {0}")]
    NotMapped(VirtualAddress),
    /// Splitting the superpage covering this address failed.
    #[error("could not demote the superpage at {0}")]
    DemotionFailed(VirtualAddress),
}
