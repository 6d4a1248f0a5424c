use crate::{Mutex, MutexGuard, RawLock, RawUnlock};

/// A mutex guard that also disables interrupts while held.
///
/// Created via [`Mutex::lock_irq`], which:
///
/// 1. saves the current interrupt state and disables interrupts, and
/// 2. acquires the underlying mutex,
///
/// releasing them in reverse order on drop. This is mandatory for any
/// structure an interrupt handler can touch; otherwise the handler could
/// preempt the critical section and spin on the same lock forever.
///
/// # Platform
///
/// Uses `cli`/`sti` and `pushfq`/`pop`, so x86/x86-64 at a privilege
/// level where those are legal.
pub struct IrqMutex<'a, T, R: RawLock + RawUnlock> {
    // Field order is drop order: the mutex is released first, then the
    // interrupt state is restored.
    _g: MutexGuard<'a, T, R>,
    _irq: IrqGuard,
}

impl<T, R: RawLock + RawUnlock> core::ops::Deref for IrqMutex<'_, T, R> {
    type Target = T;

    fn deref(&self) -> &T {
        &self._g
    }
}

impl<T, R: RawLock + RawUnlock> core::ops::DerefMut for IrqMutex<'_, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self._g
    }
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Acquires the mutex with interrupts disabled for the guard's
    /// lifetime. The prior interrupt state is restored when the guard
    /// drops, after the lock has been released.
    #[inline]
    pub fn lock_irq(&self) -> IrqMutex<'_, T, R> {
        let irq = IrqGuard::new();
        let g = self.lock();
        IrqMutex { _g: g, _irq: irq }
    }

    /// Attempts the same as [`lock_irq`](Self::lock_irq) without
    /// spinning. If the lock is unavailable the saved interrupt state is
    /// restored immediately and `None` is returned.
    #[inline]
    pub fn try_lock_irq(&self) -> Option<IrqMutex<'_, T, R>> {
        let irq = IrqGuard::new();
        self.try_lock().map(|g| IrqMutex { _g: g, _irq: irq })
    }
}

/// Disables hardware interrupts (`cli`).
///
/// Must only run in contexts where `cli` is permitted. On hosted builds
/// (unit tests) the instruction is privileged and elided; the lock
/// itself still provides the mutual exclusion the tests exercise.
#[inline]
pub fn disable_interrupts() {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
    }
}

/// Enables hardware interrupts (`sti`).
#[inline]
pub fn enable_interrupts() {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("sti", options(nomem, nostack, preserves_flags));
    }
}

/// Returns the current `RFLAGS` value (via `pushfq`/`pop`).
///
/// Bit 9 (`IF`) indicates whether interrupts are enabled.
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    let r: u64;
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
    r
}

/// Whether maskable interrupts are currently enabled.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    rflags() & (1 << 9) != 0
}

/// Disable interrupts, returning whether they were enabled before.
///
/// The return value feeds [`restore_interrupts`] so nested critical
/// sections restore exactly the state they found.
#[inline]
#[must_use]
pub fn save_and_disable() -> bool {
    let enabled = interrupts_enabled();
    if enabled {
        disable_interrupts();
    }
    enabled
}

/// Re-enable interrupts only if `were_enabled` says they were on before
/// the matching [`save_and_disable`].
#[inline]
pub fn restore_interrupts(were_enabled: bool) {
    if were_enabled {
        enable_interrupts();
    }
}

/// RAII guard that disables interrupts on creation and restores the
/// saved state on drop.
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers
    /// the state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            were_enabled: save_and_disable(),
        }
    }
}

impl Drop for IrqGuard {
    /// Restores interrupts only if they were previously enabled.
    fn drop(&mut self) {
        restore_interrupts(self.were_enabled);
    }
}
