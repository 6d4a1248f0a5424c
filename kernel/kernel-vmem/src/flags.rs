//! Mapping flags and their translation to hardware bits.
//!
//! VM objects carry a small, architecture-neutral flag set; this module
//! owns the one place where it is translated into PTE bits:
//!
//! - `WRITE` → Writable
//! - `USER`  → User
//! - `MMIO`  → Write-Through + Cache-Disable
//! - absent `EXEC` → NX — but only once EFER.NXE has been switched on;
//!   otherwise the NX bit would be a reserved-bit violation and the
//!   mapping silently stays executable (reported once).

use crate::page_table::PageTableEntry;
use core::sync::atomic::{AtomicBool, Ordering};
use log::warn;

bitflags::bitflags! {
    /// Access attributes of one VM object / mapping.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct VmFlags: u32 {
        /// Writes allowed.
        const WRITE = 1 << 0;
        /// Instruction fetches allowed.
        const EXEC = 1 << 1;
        /// CPL3 may access.
        const USER = 1 << 2;
        /// Device memory: uncached, write-through, frames never owned by
        /// the PMM.
        const MMIO = 1 << 3;
    }
}

/// Whether EFER.NXE is on and the NX bit may be used. Set once during CPU
/// feature enablement, before any mapping is created.
static NX_ENABLED: AtomicBool = AtomicBool::new(false);

/// One-shot latch for the "NX unavailable" diagnostic.
static NX_UNAVAILABLE_REPORTED: AtomicBool = AtomicBool::new(false);

/// Record whether EFER.NXE was enabled.
pub fn set_nx_enabled(enabled: bool) {
    NX_ENABLED.store(enabled, Ordering::Relaxed);
}

/// Whether mappings may carry the NX bit.
#[must_use]
pub fn nx_enabled() -> bool {
    NX_ENABLED.load(Ordering::Relaxed)
}

/// Build a leaf PTE for `flags` (frame to be filled in by the caller).
#[must_use]
pub fn leaf_entry(flags: VmFlags) -> PageTableEntry {
    let mut e = PageTableEntry::new().with_present(true);
    if flags.contains(VmFlags::WRITE) {
        e = e.with_writable(true);
    }
    if flags.contains(VmFlags::USER) {
        e = e.with_user(true);
    }
    if flags.contains(VmFlags::MMIO) {
        e = e.with_write_through(true).with_cache_disable(true);
    }
    if !flags.contains(VmFlags::EXEC) {
        if nx_enabled() {
            e = e.with_nx(true);
        } else if !NX_UNAVAILABLE_REPORTED.swap(true, Ordering::Relaxed) {
            warn!("EFER.NXE is off; non-executable mappings stay executable");
        }
    }
    e
}

/// Build an interior (table) entry. Interior entries are maximally
/// permissive; the leaf decides the effective access.
#[must_use]
pub fn table_entry(flags: VmFlags) -> PageTableEntry {
    let mut e = PageTableEntry::new().with_present(true).with_writable(true);
    if flags.contains(VmFlags::USER) {
        e = e.with_user(true);
    }
    e
}

/// Recover the flag set a present leaf encodes. Inverse of
/// [`leaf_entry`] modulo the NXE gate: with NXE off nothing is NX, so
/// every mapping reads back as executable.
#[must_use]
pub fn flags_of(entry: PageTableEntry) -> VmFlags {
    let mut f = VmFlags::empty();
    if entry.writable() {
        f |= VmFlags::WRITE;
    }
    if entry.user() {
        f |= VmFlags::USER;
    }
    if entry.cache_disable() && entry.write_through() {
        f |= VmFlags::MMIO;
    }
    if !entry.nx() {
        f |= VmFlags::EXEC;
    }
    f
}

#[cfg(test)]
mod tests {
    use super::*;

    // The NXE latch is process-global; serialize the tests that read or
    // write it so parallel test threads cannot observe a foreign state.
    static NX_STATE: std::sync::Mutex<()> = std::sync::Mutex::new(());

    #[test]
    fn write_and_user_translate_directly() {
        let _serial = NX_STATE.lock().unwrap();
        set_nx_enabled(true);
        let e = leaf_entry(VmFlags::WRITE | VmFlags::USER);
        assert!(e.present() && e.writable() && e.user());
        assert!(e.nx(), "no EXEC requested, NX expected");
    }

    #[test]
    fn mmio_sets_write_through_and_cache_disable() {
        let _serial = NX_STATE.lock().unwrap();
        set_nx_enabled(true);
        let e = leaf_entry(VmFlags::MMIO | VmFlags::WRITE);
        assert!(e.write_through() && e.cache_disable());
        assert!(flags_of(e).contains(VmFlags::MMIO));
    }

    #[test]
    fn exec_clears_nx_and_round_trips() {
        let _serial = NX_STATE.lock().unwrap();
        set_nx_enabled(true);
        let e = leaf_entry(VmFlags::EXEC | VmFlags::WRITE);
        assert!(!e.nx());
        assert_eq!(flags_of(e), VmFlags::EXEC | VmFlags::WRITE);
    }

    #[test]
    fn nx_is_withheld_when_nxe_off() {
        let _serial = NX_STATE.lock().unwrap();
        set_nx_enabled(false);
        let e = leaf_entry(VmFlags::WRITE);
        assert!(!e.nx());
        set_nx_enabled(true);
    }
}
