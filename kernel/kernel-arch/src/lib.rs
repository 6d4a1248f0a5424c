//! # x86-64 Architecture Primitives
//!
//! Thin, typed wrappers around the privileged instruction set the rest of
//! the kernel needs: `cpuid`, MSR access, the control registers, `XCR0`,
//! port I/O and the TSC. Higher layers never touch inline assembly
//! directly; they go through this crate.
//!
//! The register types use [`bitfield_struct`] so that individual bits are
//! named and documented instead of being raw masks.
//!
//! ## Safety model
//!
//! Everything that executes a privileged instruction is `unsafe` and
//! requires CPL0. The pure decoding helpers (CPUID signature parsing,
//! feature classification) are safe and host-testable.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cpuid;
pub mod cr;
pub mod features;
pub mod msr;
pub mod ports;
pub mod tsc;

pub use cpuid::{CpuidResult, cpuid};
pub use cr::{Cr0, Cr4, Efer, Xcr0};
pub use features::{CpuFeatures, CpuInfo};
