use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// Bit 31 marks a writer; bits 0..31 count readers.
const WRITER: u32 = 1 << 31;

/// Reader/writer spin lock.
///
/// Writers wait for all readers to drain. There is no writer preference, so
/// a steady stream of readers can starve a writer.
pub struct RwSpinLock<T> {
    state: AtomicU32,
    inner: UnsafeCell<T>,
}

// Safety: readers share &T across threads, writers get exclusive &mut T.
unsafe impl<T: Send + Sync> Sync for RwSpinLock<T> {}
unsafe impl<T: Send> Send for RwSpinLock<T> {}

impl<T> RwSpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            state: AtomicU32::new(0),
            inner: UnsafeCell::new(inner),
        }
    }

    #[inline]
    pub fn try_write(&self) -> Option<RwSpinWriteGuard<'_, T>> {
        self.state
            .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwSpinWriteGuard { lock: self })
    }

    #[inline]
    pub fn write(&self) -> RwSpinWriteGuard<'_, T> {
        loop {
            if let Some(g) = self.try_write() {
                return g;
            }
            while self.state.load(Ordering::Relaxed) != 0 {
                spin_loop();
            }
        }
    }

    #[inline]
    pub fn try_read(&self) -> Option<RwSpinReadGuard<'_, T>> {
        let s = self.state.load(Ordering::Relaxed);
        if s & WRITER != 0 {
            return None;
        }
        self.state
            .compare_exchange(s, s + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| RwSpinReadGuard { lock: self })
    }

    #[inline]
    pub fn read(&self) -> RwSpinReadGuard<'_, T> {
        loop {
            if let Some(g) = self.try_read() {
                return g;
            }
            spin_loop();
        }
    }

    /// Whether a writer currently holds the lock. Only useful for assertions.
    #[inline]
    pub fn is_write_locked(&self) -> bool {
        self.state.load(Ordering::Relaxed) & WRITER != 0
    }

    /// Mutable access when you have `&mut self` (no contention possible).
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

pub struct RwSpinReadGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for RwSpinReadGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> Drop for RwSpinReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.fetch_sub(1, Ordering::Release);
    }
}

pub struct RwSpinWriteGuard<'a, T> {
    lock: &'a RwSpinLock<T>,
}

impl<T> Deref for RwSpinWriteGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for RwSpinWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for RwSpinWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.state.store(0, Ordering::Release);
    }
}
