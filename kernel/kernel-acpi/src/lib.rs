//! # ACPI Root Walk
//!
//! The early discovery slice of ACPI: RSDP validation (1.0 and 2.0+),
//! RSDT/XSDT traversal and a signature-indexed table finder, plus a MADT
//! reader for the interrupt controllers.
//!
//! Physical access goes through [`PhysMapRo`]. During bring-up the
//! kernel backs it with the PHYSMAP; once the VMM is online, ACPI
//! pointers are re-walked through MMIO mappings and released with a
//! single `vmm` free per table. Firmware data is treated as hostile:
//! every signature and checksum is verified before a byte is
//! interpreted.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod madt;
pub mod rsdp;
pub mod sdt;

pub use madt::{Madt, MadtEntry};
pub use rsdp::AcpiRoots;
pub use sdt::{SdtHeader, find_table};

/// ACPI walk failures.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AcpiError {
    #[error("missing or malformed RSDP signature")]
    BadSignature,
    #[error("checksum mismatch")]
    BadChecksum,
    #[error("structure shorter than its own header claims")]
    Truncated,
    #[error("no such table")]
    NotFound,
}

/// Map a physical region and return a read-only byte view of it.
///
/// Implementations decide the mechanism (PHYSMAP offset early, VMM MMIO
/// window later); the walker only reads.
pub trait PhysMapRo {
    /// # Safety
    /// The implementor must ensure the returned slice is valid for
    /// `len` bytes at physical `paddr` for the caller's lifetime of use.
    unsafe fn map_ro<'a>(&self, paddr: u64, len: usize) -> &'a [u8];
}

/// Byte-wise checksum; valid ACPI structures sum to zero.
fn sum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |a, &b| a.wrapping_add(b))
}
