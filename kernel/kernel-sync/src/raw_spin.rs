use crate::{RawLock, RawUnlock, current_cpu_id};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// A test-and-set spinlock with a debug owner tag.
///
/// Busy-waits with a CPU relaxation hint until the flag can be taken with
/// acquire ordering, then stamps the current CPU's LAPIC ID into the
/// owner field. The tag and the name exist only for diagnostics — they
/// carry no synchronization meaning.
///
/// Reentrancy is not supported: reacquiring a lock already held on the
/// same CPU is a programmer error and deadlocks.
pub struct RawSpin {
    /// Lock state; `true` while held.
    locked: AtomicBool,
    /// LAPIC ID of the holder, for debugging. Valid only while held.
    owner_cpu: AtomicU32,
    /// Human-readable lock name for diagnostics.
    name: &'static str,
}

impl Default for RawSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpin {
    /// Creates a new unlocked `RawSpin` with an empty name.
    #[must_use]
    pub const fn new() -> Self {
        Self::named("")
    }

    /// Creates a new unlocked `RawSpin` carrying a diagnostic name.
    #[must_use]
    pub const fn named(name: &'static str) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner_cpu: AtomicU32::new(0),
            name,
        }
    }

    /// The diagnostic name given at construction.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// LAPIC ID of the current holder. Meaningful only while the lock is
    /// observed held; used by deadlock diagnostics.
    #[must_use]
    pub fn owner_cpu(&self) -> u32 {
        self.owner_cpu.load(Ordering::Relaxed)
    }

    /// Acquires the lock, spinning until it becomes available.
    #[inline]
    pub fn lock(&self) {
        // Test-and-test-and-set: swap once, then spin on plain loads so
        // the cache line is not bounced while contended.
        while self.locked.swap(true, Ordering::Acquire) {
            while self.locked.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
        self.owner_cpu.store(current_cpu_id(), Ordering::Relaxed);
    }

    /// Attempts to acquire the lock without spinning.
    ///
    /// Returns `true` if the lock was taken.
    #[inline]
    pub fn try_lock(&self) -> bool {
        if self.locked.swap(true, Ordering::Acquire) {
            false
        } else {
            self.owner_cpu.store(current_cpu_id(), Ordering::Relaxed);
            true
        }
    }

    /// Releases the lock.
    ///
    /// # Safety
    /// Must only be called by the holder; releasing an unheld lock is
    /// undefined behavior for any other code relying on the exclusion.
    #[inline]
    pub unsafe fn unlock(&self) {
        self.owner_cpu.store(0, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
    }
}

impl RawLock for RawSpin {
    #[inline]
    fn raw_lock(&self) {
        self.lock();
    }

    #[inline]
    fn raw_try_lock(&self) -> bool {
        self.try_lock()
    }
}

impl RawUnlock for RawSpin {
    #[inline]
    unsafe fn raw_unlock(&self) {
        unsafe { self.unlock() }
    }
}
