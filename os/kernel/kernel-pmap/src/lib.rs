//! # i386 translation manager
//!
//! Maintains the two-level page tables of every address space on a 32-bit
//! x86 machine without PAE: 4 KiB mappings in page tables, 4 MiB superpages
//! directly in the page directory, a shared kernel range mirrored into every
//! directory, and reverse mappings from physical pages back to the places
//! that map them.
//!
//! ```text
//!   CR3 ─► page directory (1024 × PDE)
//!            │ PS=0 ─► page table (1024 × PTE) ─► 4 KiB page
//!            │ PS=1 ──────────────────────────────► 4 MiB page
//! ```
//!
//! The entry point is [`Pmap`], created once with [`Pmap::bootstrap`] over
//! a [`Machine`] (physical memory, TLBs, IPIs) and a [`PageSupplier`]
//! (physical pages and their metadata). With the `software-emulation`
//! feature, [`emulation`] provides both in software so the whole manager
//! runs on a host.
//!
//! ## Guarantees
//! - After an operation that removes or restricts a translation returns,
//!   no CPU using the address space still holds the old translation.
//! - A page table's wire count equals its number of valid entries.
//! - Every managed mapping has exactly one reverse-mapping entry.
//! - Kernel directory slots are identical in every directory.

#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

extern crate alloc;

mod address_space;
mod cache;
mod config;
mod cpuset;
mod error;
mod platform;
mod pmap;
mod prot;
mod pte;
mod ptp;
mod pv;
mod registry;
mod stats;
mod supplier;

#[cfg(any(test, feature = "software-emulation"))]
pub mod emulation;

pub use crate::address_space::{AddressSpace, AsId, SpaceStats};
pub use crate::cache::{CacheBits, MemAttr, PatLayout};
pub use crate::config::PmapConfig;
pub use crate::cpuset::{AtomicCpuSet, CpuId, CpuSet};
pub use crate::error::PmapError;
pub use crate::platform::{Access, CpuFeatures, Machine, PageFault, PhysMemory, RendezvousFn, TlbRequest};
pub use crate::pmap::Pmap;
pub use crate::prot::{Mincore, Prot};
pub use crate::pte::{PdEntry, PtEntry};
pub use crate::stats::{Counter, PmapStats};
pub use crate::supplier::{AllocFlags, PageSupplier, VmPage};
pub use kernel_info::memory as info;
