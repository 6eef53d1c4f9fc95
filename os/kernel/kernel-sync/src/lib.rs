//! # Kernel synchronization primitives
//!
//! Busy-waiting locks for code that runs with preemption possibly disabled:
//!
//! - [`SpinMutex`]: exclusive lock with [`try_lock`](Mutex::try_lock), used for
//!   per-address-space state, per-CPU scratch windows and the registry.
//! - [`RwSpinLock`]: reader/writer lock, used for the global reverse-mapping
//!   state.
//!
//! Neither lock is reentrant. Acquiring a lock already held by the current
//! context spins forever.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod mutex;
mod raw_spin;
mod rw_lock;

pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use rw_lock::{RwSpinLock, RwSpinReadGuard, RwSpinWriteGuard};

pub type SpinMutex<T> = Mutex<T, RawSpin>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
    fn raw_is_locked(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// The caller must hold the lock.
    unsafe fn raw_unlock(&self);
}
