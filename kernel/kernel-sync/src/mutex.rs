use crate::{RawLock, RawUnlock};
use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// A generic mutex that delegates locking to a raw lock implementation.
///
/// `Mutex<T, R>` protects a value of type `T` using a raw lock `R`. The
/// mutex does not track poisoning or ownership; it acquires and releases
/// the underlying raw lock and hands out access through an RAII guard.
///
/// For state shared with interrupt handlers, use [`Mutex::lock_irq`]
/// (see [`crate::irq`]) so the critical section cannot be preempted by
/// an interrupt that takes the same lock.
pub struct Mutex<T, R> {
    /// The underlying raw lock primitive.
    raw: R,
    /// The protected value.
    cell: UnsafeCell<T>,
    /// Prevent default auto-`Send`/`Sync`; added back with bounds below.
    _no_send_sync: PhantomData<*mut ()>,
}

// Safety: mutual exclusion is delegated to `R`; data may only cross
// threads if `T: Send`.
unsafe impl<T: Send, R: Sync> Sync for Mutex<T, R> {}
unsafe impl<T: Send, R: Send> Send for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    /// Constructs a `Mutex` from a raw lock and an initial value.
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            cell: UnsafeCell::new(value),
            _no_send_sync: PhantomData,
        }
    }

    /// Returns a mutable reference to the inner value.
    ///
    /// `&mut self` proves no other reference exists, so no locking is
    /// needed.
    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }
}

/// A guard that releases a [`Mutex`] when dropped.
pub struct MutexGuard<'a, T, R>
where
    R: RawUnlock,
{
    m: &'a Mutex<T, R>,
}

impl<T, R> Deref for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &*self.m.cell.get() }
    }
}

impl<T, R> DerefMut for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard holds the lock exclusively.
        unsafe { &mut *self.m.cell.get() }
    }
}

impl<T, R> Drop for MutexGuard<'_, T, R>
where
    R: RawUnlock,
{
    fn drop(&mut self) {
        // Unlock on scope exit.
        unsafe { self.m.raw.raw_unlock() }
    }
}

impl<T, R> Mutex<T, R>
where
    R: RawLock + RawUnlock,
{
    /// Acquires the lock and returns a guard that unlocks on drop.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.raw.raw_lock();
        MutexGuard { m: self }
    }

    /// Attempts to acquire the lock without blocking.
    ///
    /// Returns `Some(guard)` on success, `None` if the lock is held.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        if self.raw.raw_try_lock() {
            Some(MutexGuard { m: self })
        } else {
            None
        }
    }

    /// Execute `f` with exclusive access to the inner value.
    #[inline]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut g = self.lock();
        f(&mut g)
    }
}
