//! # Software emulation
//!
//! A host-side "machine" for running the manager without hardware: physical
//! memory made of atomic words, per-CPU TLBs that cache translations (and
//! keep serving stale ones until invalidated), a page walker that sets
//! accessed and dirty bits like the MMU does, synchronous IPIs and
//! rendezvous, and a page supplier with failure injection.
//!
//! CPU identity is per host thread. [`EmulatedMachine::run_on`] runs a
//! closure as a given CPU; IPIs and rendezvous switch identity temporarily
//! to execute their handlers "on" the target CPUs.

mod machine;
mod memory;
mod pages;

pub use machine::{EmulatedMachine, TlbCounters};
pub use memory::EmulatedMemory;
pub use pages::EmulatedPages;
