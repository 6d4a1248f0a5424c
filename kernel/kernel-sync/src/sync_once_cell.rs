use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    mem::MaybeUninit,
    sync::atomic::{AtomicU8, Ordering},
};

const UNINIT: u8 = 0;
const INITING: u8 = 1;
const READY: u8 = 2;

/// A minimal, lock-free, spin-based `OnceCell`.
///
/// `SyncOnceCell<T>` lazily initializes a `T` at most once and then
/// provides shared access to it. The first caller to observe the
/// uninitialized state runs the initializer; all others spin until the
/// value becomes available.
///
/// Used for the write-once globals of the bring-up path (CPU info,
/// kernel address space): each is initialized exactly once before IRQs
/// are enabled and read-only afterwards.
///
/// # Concurrency
///
/// - A single initializer wins via `compare_exchange`.
/// - Readers observe readiness via `Acquire` loads after the value is
///   fully written and published with `Release`.
///
/// # Panics
///
/// If the initializer panics, the cell remains stuck in the initializing
/// state and all future calls spin forever. Initializers must not panic.
pub struct SyncOnceCell<T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> Default for SyncOnceCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SyncOnceCell<T> {
    /// Creates a new, empty `SyncOnceCell`.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// Returns `Some(&T)` if the cell has been initialized.
    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == READY {
            // SAFETY: READY guarantees the write is done.
            Some(unsafe { &*(*self.value.get()).as_ptr() })
        } else {
            None
        }
    }

    /// Initializes the cell at most once and returns `&T`.
    ///
    /// If the cell is already initialized, returns a shared reference to
    /// the existing value. While another thread is initializing, this
    /// call spins until the value becomes ready.
    pub fn get_or_init(&self, init: impl FnOnce() -> T) -> &T {
        if let Some(v) = self.get() {
            return v;
        }

        if self
            .state
            .compare_exchange(UNINIT, INITING, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            let v = init();
            unsafe {
                (*self.value.get()).write(v);
            }
            // Publish the value before marking READY.
            self.state.store(READY, Ordering::Release);
            // SAFETY: just wrote it.
            return unsafe { &*(*self.value.get()).as_ptr() };
        }

        while self.state.load(Ordering::Acquire) != READY {
            spin_loop();
        }
        // SAFETY: READY.
        unsafe { &*(*self.value.get()).as_ptr() }
    }

    /// Store a value, failing if the cell was already initialized.
    ///
    /// # Errors
    /// Returns the value back if the cell is occupied or mid-init.
    pub fn set(&self, value: T) -> Result<(), T> {
        if self
            .state
            .compare_exchange(UNINIT, INITING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return Err(value);
        }
        unsafe {
            (*self.value.get()).write(value);
        }
        self.state.store(READY, Ordering::Release);
        Ok(())
    }
}

// Safety: shared after READY; initialization is single-writer.
unsafe impl<T: Sync> Sync for SyncOnceCell<T> {}
unsafe impl<T: Send> Send for SyncOnceCell<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_before_init_is_none() {
        let cell = SyncOnceCell::<u32>::new();
        assert!(cell.get().is_none());
    }

    #[test]
    fn first_initializer_wins() {
        let cell = SyncOnceCell::new();
        let a = cell.get_or_init(|| 42);
        let b = cell.get_or_init(|| unreachable!());
        assert_eq!(a, b);
        assert_eq!(cell.get(), Some(&42));
    }

    #[test]
    fn set_rejects_second_value() {
        let cell = SyncOnceCell::new();
        assert!(cell.set(1).is_ok());
        assert_eq!(cell.set(2), Err(2));
        assert_eq!(cell.get(), Some(&1));
    }
}
