//! # Control Registers and XCR0
//!
//! Typed views of CR0/CR4/EFER/XCR0 plus raw accessors for CR2 (fault
//! address) and CR3 (page-table root). Only the bits this kernel
//! manipulates are given accessors; reserved ranges are read-only.

use crate::msr::{IA32_EFER, rdmsr, wrmsr};
use bitfield_struct::bitfield;

/// CR0 — Control Register 0.
///
/// Governs protected mode, FPU delegation and the paging master switch.
#[bitfield(u64, order = Lsb)]
pub struct Cr0 {
    /// Bit 0 — PE: Protection Enable.
    pub pe: bool,
    /// Bit 1 — MP: Monitor Coprocessor. Set for SSE.
    pub mp: bool,
    /// Bit 2 — EM: x87 Emulation. Must be clear for SSE.
    pub em: bool,
    /// Bit 3 — TS: Task Switched.
    pub ts: bool,
    /// Bit 4 — ET: Extension Type (hardwired on modern CPUs).
    pub et: bool,
    /// Bit 5 — NE: Numeric Error reporting.
    pub ne: bool,
    /// Bits 6–15 — Reserved.
    #[bits(10, access = RO)]
    pub reserved0: u16,
    /// Bit 16 — WP: Write Protect (supervisor honors read-only pages).
    pub wp: bool,
    /// Bit 17 — Reserved.
    #[bits(access = RO)]
    pub reserved1: bool,
    /// Bit 18 — AM: Alignment Mask.
    pub am: bool,
    /// Bits 19–28 — Reserved.
    #[bits(10, access = RO)]
    pub reserved2: u16,
    /// Bit 29 — NW: Not Write-through.
    pub nw: bool,
    /// Bit 30 — CD: Cache Disable.
    pub cd: bool,
    /// Bit 31 — PG: Paging enable.
    pub pg: bool,
    /// Bits 32–63 — Reserved.
    #[bits(32, access = RO)]
    pub reserved3: u32,
}

impl Cr0 {
    /// Read CR0.
    ///
    /// # Safety
    /// Must run at CPL0.
    #[inline]
    #[must_use]
    pub unsafe fn load() -> Self {
        let raw: u64;
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) raw, options(nomem, preserves_flags));
        }
        Self::from_bits(raw)
    }

    /// Write CR0.
    ///
    /// # Safety
    /// Must run at CPL0. Clearing PG or PE in long mode is fatal.
    #[inline]
    pub unsafe fn store(self) {
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) self.into_bits(), options(nomem, preserves_flags));
        }
    }
}

/// CR4 — Control Register 4.
///
/// Paging and extended-state feature toggles. Only the subset this kernel
/// drives is modeled; the rest stays read-only.
#[bitfield(u64, order = Lsb)]
pub struct Cr4 {
    /// Bit 0 — VME.
    #[bits(access = RO)]
    pub vme: bool,
    /// Bit 1 — PVI.
    #[bits(access = RO)]
    pub pvi: bool,
    /// Bit 2 — TSD.
    #[bits(access = RO)]
    pub tsd: bool,
    /// Bit 3 — DE.
    #[bits(access = RO)]
    pub de: bool,
    /// Bit 4 — PSE.
    #[bits(access = RO)]
    pub pse: bool,
    /// Bit 5 — PAE: Physical Address Extension. Always set in long mode.
    pub pae: bool,
    /// Bit 6 — MCE.
    #[bits(access = RO)]
    pub mce: bool,
    /// Bit 7 — PGE: Page Global Enable.
    pub pge: bool,
    /// Bit 8 — PCE.
    #[bits(access = RO)]
    pub pce: bool,
    /// Bit 9 — OSFXSR: OS supports FXSAVE/FXRSTOR. Required for SSE.
    pub osfxsr: bool,
    /// Bit 10 — OSXMMEXCPT: OS handles unmasked SIMD FP exceptions.
    pub osxmmexcpt: bool,
    /// Bit 11 — UMIP.
    #[bits(access = RO)]
    pub umip: bool,
    /// Bit 12 — LA57.
    #[bits(access = RO)]
    pub la57: bool,
    /// Bit 13 — VMXE: VMX Enable (Intel VT-x).
    pub vmxe: bool,
    /// Bit 14 — SMXE.
    #[bits(access = RO)]
    pub smxe: bool,
    /// Bit 15 — Reserved.
    #[bits(access = RO)]
    pub reserved0: bool,
    /// Bit 16 — FSGSBASE.
    #[bits(access = RO)]
    pub fsgsbase: bool,
    /// Bit 17 — PCIDE.
    #[bits(access = RO)]
    pub pcide: bool,
    /// Bit 18 — OSXSAVE: OS uses XSAVE/XRSTOR and XCR0. Required for AVX.
    pub osxsave: bool,
    /// Bits 19–63 — Reserved / unmodeled.
    #[bits(45, access = RO)]
    pub reserved1: u64,
}

impl Cr4 {
    /// Read CR4.
    ///
    /// # Safety
    /// Must run at CPL0.
    #[inline]
    #[must_use]
    pub unsafe fn load() -> Self {
        let raw: u64;
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) raw, options(nomem, preserves_flags));
        }
        Self::from_bits(raw)
    }

    /// Write CR4.
    ///
    /// # Safety
    /// Must run at CPL0. Setting a bit the CPU does not implement
    /// raises #GP.
    #[inline]
    pub unsafe fn store(self) {
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) self.into_bits(), options(nomem, preserves_flags));
        }
    }
}

/// IA32_EFER — Extended Feature Enable Register.
#[bitfield(u64, order = Lsb)]
pub struct Efer {
    /// Bit 0 — SCE: SYSCALL enable.
    pub sce: bool,
    /// Bits 1–7 — Reserved.
    #[bits(7, access = RO)]
    pub reserved0: u8,
    /// Bit 8 — LME: Long Mode Enable.
    pub lme: bool,
    /// Bit 9 — Reserved.
    #[bits(access = RO)]
    pub reserved1: bool,
    /// Bit 10 — LMA: Long Mode Active (read-only in practice).
    pub lma: bool,
    /// Bit 11 — NXE: No-Execute Enable. Gates the NX page-table bit.
    pub nxe: bool,
    /// Bit 12 — SVME: Secure Virtual Machine Enable (AMD).
    pub svme: bool,
    /// Bits 13–63 — Reserved.
    #[bits(51, access = RO)]
    pub reserved2: u64,
}

impl Efer {
    /// Read IA32_EFER.
    ///
    /// # Safety
    /// Must run at CPL0.
    #[inline]
    #[must_use]
    pub unsafe fn load() -> Self {
        Self::from_bits(unsafe { rdmsr(IA32_EFER) })
    }

    /// Write IA32_EFER.
    ///
    /// # Safety
    /// Must run at CPL0. Toggling LME/LMA outside the mode-switch
    /// sequence is fatal.
    #[inline]
    pub unsafe fn store(self) {
        unsafe { wrmsr(IA32_EFER, self.into_bits()) }
    }
}

/// XCR0 — Extended Control Register 0.
///
/// Selects which extended-state components XSAVE manages. Writable only
/// once CR4.OSXSAVE is set.
#[bitfield(u64, order = Lsb)]
pub struct Xcr0 {
    /// Bit 0 — x87 state. Must always be set.
    pub x87: bool,
    /// Bit 1 — SSE state (XMM registers).
    pub sse: bool,
    /// Bit 2 — AVX state (YMM upper halves).
    pub avx: bool,
    /// Bits 3–63 — Unmodeled components.
    #[bits(61, access = RO)]
    pub reserved: u64,
}

impl Xcr0 {
    /// Read XCR0 via `xgetbv`.
    ///
    /// # Safety
    /// CR4.OSXSAVE must be set, otherwise `xgetbv` raises #UD.
    #[inline]
    #[must_use]
    pub unsafe fn load() -> Self {
        let lo: u32;
        let hi: u32;
        unsafe {
            core::arch::asm!(
                "xgetbv",
                in("ecx") 0u32,
                out("eax") lo,
                out("edx") hi,
                options(nomem, nostack, preserves_flags)
            );
        }
        Self::from_bits((u64::from(hi) << 32) | u64::from(lo))
    }

    /// Write XCR0 via `xsetbv`.
    ///
    /// # Safety
    /// CR4.OSXSAVE must be set and the written component bitmap must be
    /// supported, otherwise #GP.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn store(self) {
        let raw = self.into_bits();
        let lo = (raw & 0xFFFF_FFFF) as u32;
        let hi = (raw >> 32) as u32;
        unsafe {
            core::arch::asm!(
                "xsetbv",
                in("ecx") 0u32,
                in("eax") lo,
                in("edx") hi,
                options(nomem, nostack, preserves_flags)
            );
        }
    }
}

/// Read CR2, the faulting linear address of the last page fault.
///
/// # Safety
/// Must run at CPL0.
#[inline]
#[must_use]
pub unsafe fn read_cr2() -> u64 {
    let value: u64;
    unsafe {
        core::arch::asm!("mov {}, cr2", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value
}

/// Read CR3, the physical address of the active PML4 (low 12 bits are
/// flags/PCID and are masked off).
///
/// # Safety
/// Must run at CPL0.
#[inline]
#[must_use]
pub unsafe fn read_cr3() -> u64 {
    let value: u64;
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) value, options(nomem, nostack, preserves_flags));
    }
    value & !0xFFF
}

/// Load CR3, switching the active address space and flushing non-global
/// TLB entries.
///
/// # Safety
/// `root` must be the physical address of a valid PML4 whose kernel
/// mappings cover the currently executing code and stack.
#[inline]
pub unsafe fn write_cr3(root: u64) {
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root, options(nostack, preserves_flags));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cr0_bit_positions() {
        let cr0 = Cr0::new().with_mp(true).with_wp(true).with_pg(true);
        assert_eq!(cr0.into_bits(), (1 << 1) | (1 << 16) | (1 << 31));
    }

    #[test]
    fn cr4_bit_positions() {
        let cr4 = Cr4::new()
            .with_pae(true)
            .with_osfxsr(true)
            .with_osxmmexcpt(true)
            .with_osxsave(true)
            .with_vmxe(true);
        assert_eq!(
            cr4.into_bits(),
            (1 << 5) | (1 << 9) | (1 << 10) | (1 << 18) | (1 << 13)
        );
    }

    #[test]
    fn efer_bit_positions() {
        let efer = Efer::new().with_nxe(true).with_svme(true);
        assert_eq!(efer.into_bits(), (1 << 11) | (1 << 12));
    }

    #[test]
    fn xcr0_bit_positions() {
        let xcr0 = Xcr0::new().with_x87(true).with_sse(true).with_avx(true);
        assert_eq!(xcr0.into_bits(), 0b111);
    }
}
