//! # Kernel Memory Layout
//!
//! Authoritative constants for the i386 virtual address space and the
//! two-level translation geometry. Every component that reasons about
//! where user space ends, where the shared kernel range begins, or how many
//! entries a page table holds takes the numbers from here so they cannot
//! drift apart.
//!
//! ```text
//! Virtual Address Space Layout (32-bit, no PAE):
//!
//! 0x0000_0000           ┌─────────────────────────────────┐
//!                       │           User Space            │
//!                       │  (per address space, 767 slots) │
//! VM_MAXUSER_ADDRESS    ├─────────────────────────────────┤ 0xBFC0_0000
//!                       │   Reserved directory slot       │
//! KERNBASE              ├─────────────────────────────────┤ 0xC000_0000
//!                       │   Shared kernel range           │
//!                       │   (mirrored into every          │
//!                       │    address space directory)     │
//! VM_MAX_KERNEL_ADDRESS ├─────────────────────────────────┤ 0xFFC0_0000
//!                       │   Reserved                      │
//! 0xFFFF_FFFF           └─────────────────────────────────┘
//! ```
//!
//! The kernel range is populated at bootstrap with [`NKPT`](memory::NKPT)
//! page tables and grows upward in whole directory slots.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod memory;
