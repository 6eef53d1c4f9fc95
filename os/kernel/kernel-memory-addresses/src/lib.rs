//! # Virtual and Physical Memory Address Types (i386)
//!
//! Strongly typed wrappers for raw addresses and page bases on a 32-bit,
//! two-level paged machine.
//!
//! ## Overview
//!
//! The translation manager juggles three kinds of numbers that are all plain
//! `u32` at the machine level: virtual addresses, physical addresses and page
//! frame numbers. Mixing them up is the classic source of silent corruption
//! in paging code, so every one of them gets its own zero-cost type:
//!
//! | Type | Description |
//! |------|-------------|
//! | [`VirtualAddress`] | An address as seen through the MMU. |
//! | [`PhysicalAddress`] | An address on the memory bus. |
//! | [`VirtualPage<S>`] / [`PhysicalPage<S>`] | A page-aligned base for page size `S`. |
//!
//! ## Page Sizes
//!
//! Two page sizes exist without physical address extension:
//!
//! - [`Size4K`]: 4 KiB pages, the base granularity.
//! - [`Size4M`]: 4 MiB superpages, mapped directly from a directory entry.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xC040_1234);
//! let (page, off) = va.split::<Size4K>();
//! assert_eq!(page.base().as_u32(), 0xC040_1000);
//! assert_eq!(off, 0x234);
//!
//! let sp = va.page::<Size4M>();
//! assert_eq!(sp.base().as_u32(), 0xC040_0000);
//! assert_eq!(sp.index(), 0x301);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page;
mod page_size;
mod physical_address;
mod virtual_address;

pub use page::{PhysicalPage, VirtualPage};
pub use page_size::{PageSize, Size4K, Size4M};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_and_join_4k() {
        let a = VirtualAddress::new(0x1234_5678);
        let (p, o) = a.split::<Size4K>();
        assert_eq!(p.base().as_u32(), 0x1234_5000);
        assert_eq!(o, 0x678);
        assert_eq!(p.join(o), a);
    }

    #[test]
    fn split_and_join_4m() {
        let a = PhysicalAddress::new(0x0081_2345);
        let (p, o) = a.split::<Size4M>();
        assert_eq!(p.base().as_u32(), 0x0080_0000);
        assert_eq!(o, 0x1_2345);
        assert_eq!(p.join(o), a);
    }

    #[test]
    fn frame_numbers_round_trip() {
        let p = PhysicalPage::<Size4K>::from_index(0x1_2345);
        assert_eq!(p.base().as_u32(), 0x1234_5000);
        assert_eq!(p.index(), 0x1_2345);
        assert_eq!(p.next().index(), 0x1_2346);
    }

    #[test]
    fn alignment_helpers() {
        let a = VirtualAddress::new(0x12345);
        assert!(!a.is_aligned::<Size4K>());
        assert_eq!(a.align_down::<Size4K>().as_u32(), 0x12000);
        assert_eq!(a.align_up::<Size4K>().as_u32(), 0x13000);
        assert_eq!(a.align_up::<Size4M>().as_u32(), 0x40_0000);
        assert!(VirtualAddress::new(0xC000_0000).is_aligned::<Size4M>());
    }

    #[test]
    fn align_up_saturates_at_top_of_space() {
        let a = VirtualAddress::new(0xFFFF_F001);
        assert_eq!(a.align_up::<Size4K>(), VirtualAddress::MAX_PAGE);
    }
}
