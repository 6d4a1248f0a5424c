//! # Kernel synchronization primitives
//!
//! Spin-based locking for a uniprocessor kernel where the only
//! concurrency is mainline code versus interrupt handlers. Structures
//! shared with interrupt context must be locked with [`Mutex::lock_irq`],
//! which disables interrupts for the guard's lifetime; plain
//! [`Mutex::lock`] is only for state interrupts never touch.
//!
//! ## Lock ordering
//!
//! Nesting is legal only in this fixed order (outermost first):
//! console → heap → VMM → slab → PMM. A holder of a later lock must
//! never wait on an earlier one.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
mod raw_spin;
mod sync_once_cell;

use core::sync::atomic::{AtomicU32, Ordering};

pub use irq::{IrqGuard, IrqMutex};
pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use sync_once_cell::SyncOnceCell;

pub type SpinMutex<T> = Mutex<T, RawSpin>;

impl<T> SpinMutex<T> {
    pub fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
}

pub trait RawUnlock {
    unsafe fn raw_unlock(&self);
}

/// ID of the CPU this code runs on, used purely as the debug owner tag in
/// [`RawSpin`]. Stays 0 until APIC bring-up publishes the LAPIC ID; a
/// future SMP port replaces this with a per-CPU variable.
static CURRENT_CPU_ID: AtomicU32 = AtomicU32::new(0);

/// Publish the LAPIC ID of the executing CPU.
pub fn set_current_cpu_id(id: u32) {
    CURRENT_CPU_ID.store(id, Ordering::Relaxed);
}

/// The CPU ID last published via [`set_current_cpu_id`].
#[must_use]
pub fn current_cpu_id() -> u32 {
    CURRENT_CPU_ID.load(Ordering::Relaxed)
}
