//! # Memory Layout

use kernel_memory_addresses::{PageSize, Size4K, Size4M, VirtualAddress};

/// Bytes per small page.
pub const PAGE_SIZE: u32 = Size4K::SIZE;

/// log2 of [`PAGE_SIZE`].
pub const PAGE_SHIFT: u32 = Size4K::SHIFT;

/// Bytes mapped by one page-directory entry (one superpage).
pub const NBPDR: u32 = Size4M::SIZE;

/// log2 of [`NBPDR`].
pub const PDRSHIFT: u32 = Size4M::SHIFT;

/// Mask of the offset within a superpage.
pub const PDRMASK: u32 = NBPDR - 1;

/// Page-table entries per page-table page.
pub const NPTEPG: usize = (PAGE_SIZE / 4) as usize;

/// Entries in the root page directory.
pub const NPDEPTD: usize = (PAGE_SIZE / 4) as usize;

/// Start of the shared kernel range.
pub const KERNBASE: u32 = 0xC000_0000;

/// First directory slot of the kernel range.
pub const KPTDI: usize = (KERNBASE >> PDRSHIFT) as usize;

/// End (exclusive) of user space. One directory slot below [`KERNBASE`] is
/// kept out of user reach.
pub const VM_MAXUSER_ADDRESS: u32 = KERNBASE - NBPDR;

/// Lowest kernel virtual address handed out.
pub const VM_MIN_KERNEL_ADDRESS: u32 = KERNBASE;

/// End (exclusive) of the growable kernel range.
pub const VM_MAX_KERNEL_ADDRESS: u32 = 0xFFC0_0000;

/// Number of kernel page-table pages created at bootstrap.
pub const NKPT: usize = 8;

/// Upper bound for kernel page-table pages.
pub const NKPDE: usize = ((VM_MAX_KERNEL_ADDRESS - KERNBASE) >> PDRSHIFT) as usize;

/// Highest CPU count the active-set bitmasks can describe.
pub const MAXCPU: usize = 32;

/// Returns `true` if `va` lies in user space.
#[inline]
#[must_use]
pub const fn is_user_address(va: VirtualAddress) -> bool {
    va.as_u32() < VM_MAXUSER_ADDRESS
}

/// Returns `true` if `va` lies in the shared kernel range.
#[inline]
#[must_use]
pub const fn is_kernel_address(va: VirtualAddress) -> bool {
    va.as_u32() >= VM_MIN_KERNEL_ADDRESS && va.as_u32() < VM_MAX_KERNEL_ADDRESS
}

const _: () = {
    assert!(KERNBASE.is_multiple_of(NBPDR));
    assert!(VM_MAX_KERNEL_ADDRESS.is_multiple_of(NBPDR));
    assert!(VM_MAXUSER_ADDRESS < KERNBASE);
    assert!(NKPT <= NKPDE);
    assert!(KPTDI + NKPDE <= NPDEPTD);
    assert!(NPTEPG as u32 * PAGE_SIZE == NBPDR);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_consistent() {
        assert_eq!(KPTDI, 768);
        assert_eq!(NKPDE, 255);
        assert!(is_user_address(VirtualAddress::new(0x1000)));
        assert!(!is_user_address(VirtualAddress::new(VM_MAXUSER_ADDRESS)));
        assert!(is_kernel_address(VirtualAddress::new(KERNBASE)));
        assert!(!is_kernel_address(VirtualAddress::new(VM_MAX_KERNEL_ADDRESS)));
    }
}
