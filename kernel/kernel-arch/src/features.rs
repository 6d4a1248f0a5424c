//! # CPU Feature Table
//!
//! [`CpuInfo`] is the process-wide description of the boot CPU: identity
//! strings, signature, core count and two feature bitsets — what the CPU
//! *detected* and what the kernel actually *enabled*. It is populated
//! once during early bring-up and read-only afterwards.

use crate::cpuid::{CpuidResult, brand_chunk, cpuid, decode_signature, vendor_bytes};
use crate::cr::{Cr0, Cr4, Efer, Xcr0};
use log::{info, warn};

bitflags::bitflags! {
    /// CPU features this kernel probes and (where it makes sense) enables.
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct CpuFeatures: u64 {
        const PAE    = 1 << 0;
        const SSE    = 1 << 1;
        const SSE2   = 1 << 2;
        const SSE3   = 1 << 3;
        const SSSE3  = 1 << 4;
        const SSE4_1 = 1 << 5;
        const SSE4_2 = 1 << 6;
        const AVX    = 1 << 7;
        const AVX2   = 1 << 8;
        const XSAVE  = 1 << 9;
        const NX     = 1 << 10;
        const VMX    = 1 << 11;
        const SVM    = 1 << 12;
    }
}

/// Identity and capability snapshot of the boot CPU.
///
/// Single instance per system; see the kernel crate for the cell that
/// owns it. No locking is needed because all writes happen before IRQs
/// are enabled.
#[derive(Debug, Clone)]
pub struct CpuInfo {
    vendor: [u8; 12],
    brand: [u8; 48],
    family: u16,
    model: u8,
    stepping: u8,
    cores: u32,
    detected: CpuFeatures,
    enabled: CpuFeatures,
}

impl CpuInfo {
    /// Probe the CPU via CPUID.
    ///
    /// # Safety
    /// Must run at CPL0 (the brand-string leaves are universally
    /// available on x86-64, the rest is gated on the reported maxima).
    #[must_use]
    pub unsafe fn detect() -> Self {
        let leaf0 = unsafe { cpuid(0, 0) };
        let max_leaf = leaf0.eax;
        let vendor = vendor_bytes(leaf0);

        let leaf1 = unsafe { cpuid(1, 0) };
        let leaf7 = if max_leaf >= 7 {
            unsafe { cpuid(7, 0) }
        } else {
            CpuidResult {
                eax: 0,
                ebx: 0,
                ecx: 0,
                edx: 0,
            }
        };

        let ext_max = unsafe { cpuid(0x8000_0000, 0) }.eax;
        let ext1 = if ext_max >= 0x8000_0001 {
            unsafe { cpuid(0x8000_0001, 0) }
        } else {
            CpuidResult {
                eax: 0,
                ebx: 0,
                ecx: 0,
                edx: 0,
            }
        };

        let mut brand = [0u8; 48];
        if ext_max >= 0x8000_0004 {
            brand_chunk(unsafe { cpuid(0x8000_0002, 0) }, &mut brand, 0);
            brand_chunk(unsafe { cpuid(0x8000_0003, 0) }, &mut brand, 16);
            brand_chunk(unsafe { cpuid(0x8000_0004, 0) }, &mut brand, 32);
        }

        let (family, model, stepping) = decode_signature(leaf1.eax);
        let cores = ((leaf1.ebx >> 16) & 0xFF).max(1);

        Self {
            vendor,
            brand,
            family,
            model,
            stepping,
            cores,
            detected: classify(leaf1, leaf7, ext1),
            enabled: CpuFeatures::empty(),
        }
    }

    /// Vendor string ("GenuineIntel", "AuthenticAMD", …).
    #[must_use]
    pub fn vendor(&self) -> &str {
        core::str::from_utf8(&self.vendor).unwrap_or("unknown")
    }

    /// Brand string, trimmed of firmware padding.
    #[must_use]
    pub fn brand(&self) -> &str {
        let end = self
            .brand
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.brand.len());
        core::str::from_utf8(&self.brand[..end])
            .unwrap_or("unknown")
            .trim()
    }

    #[must_use]
    pub const fn family(&self) -> u16 {
        self.family
    }

    #[must_use]
    pub const fn model(&self) -> u8 {
        self.model
    }

    #[must_use]
    pub const fn stepping(&self) -> u8 {
        self.stepping
    }

    /// Logical processor count reported by leaf 1. Informational only;
    /// this kernel runs the BSP exclusively.
    #[must_use]
    pub const fn cores(&self) -> u32 {
        self.cores
    }

    /// Features the CPU reports.
    #[must_use]
    pub const fn detected(&self) -> CpuFeatures {
        self.detected
    }

    /// Features the kernel switched on.
    #[must_use]
    pub const fn enabled(&self) -> CpuFeatures {
        self.enabled
    }

    #[must_use]
    pub const fn has(&self, f: CpuFeatures) -> bool {
        self.detected.contains(f)
    }

    /// Enable every detected feature the kernel knows how to drive.
    ///
    /// - SSE: clear CR0.EM, set CR0.MP, set CR4.{OSFXSR, OSXMMEXCPT}.
    /// - AVX: set CR4.OSXSAVE, then XCR0.{x87, SSE, AVX}.
    /// - NX: set EFER.NXE so the paging layer may use the NX bit.
    /// - PAE: confirmed only. Long mode already requires it; the CR4 bit
    ///   is observed, not toggled.
    /// - VMX: set CR4.VMXE. SVM: set EFER.SVME. Neither is used further;
    ///   the bits are armed so a future hypervisor layer finds them on.
    ///
    /// # Safety
    /// Must run at CPL0, once, before any code relies on the enabled
    /// state (e.g. compiler-emitted SSE moves).
    pub unsafe fn enable_features(&mut self) {
        if self.has(CpuFeatures::SSE) {
            unsafe {
                let cr0 = Cr0::load().with_em(false).with_mp(true);
                cr0.store();
                let cr4 = Cr4::load().with_osfxsr(true).with_osxmmexcpt(true);
                cr4.store();
            }
            self.enabled |= self.detected
                & (CpuFeatures::SSE
                    | CpuFeatures::SSE2
                    | CpuFeatures::SSE3
                    | CpuFeatures::SSSE3
                    | CpuFeatures::SSE4_1
                    | CpuFeatures::SSE4_2);
        }

        if self.has(CpuFeatures::XSAVE) && self.has(CpuFeatures::AVX) {
            unsafe {
                Cr4::load().with_osxsave(true).store();
                Xcr0::load()
                    .with_x87(true)
                    .with_sse(true)
                    .with_avx(true)
                    .store();
            }
            self.enabled |= CpuFeatures::XSAVE | CpuFeatures::AVX;
            if self.has(CpuFeatures::AVX2) {
                self.enabled |= CpuFeatures::AVX2;
            }
        }

        if self.has(CpuFeatures::NX) {
            unsafe { Efer::load().with_nxe(true).store() };
            self.enabled |= CpuFeatures::NX;
        } else {
            warn!("CPU does not report NX; pages will stay executable");
        }

        if self.has(CpuFeatures::PAE) {
            // Long mode cannot run without PAE; record it as enabled
            // without touching CR4.
            debug_assert!(unsafe { Cr4::load() }.pae());
            self.enabled |= CpuFeatures::PAE;
        }

        if self.has(CpuFeatures::VMX) {
            unsafe { Cr4::load().with_vmxe(true).store() };
            self.enabled |= CpuFeatures::VMX;
        }
        if self.has(CpuFeatures::SVM) {
            unsafe { Efer::load().with_svme(true).store() };
            self.enabled |= CpuFeatures::SVM;
        }

        info!(
            "cpu: {} {} fam {:#x} model {:#x} stepping {} ({} threads)",
            self.vendor(),
            self.brand(),
            self.family,
            self.model,
            self.stepping,
            self.cores,
        );
        info!("cpu features: detected {:?}", self.detected);
        info!("cpu features: enabled  {:?}", self.enabled);
    }
}

/// Map raw CPUID words to [`CpuFeatures`]. Pure, host-testable.
#[must_use]
pub fn classify(leaf1: CpuidResult, leaf7: CpuidResult, ext1: CpuidResult) -> CpuFeatures {
    let mut f = CpuFeatures::empty();
    let edx1 = leaf1.edx;
    let ecx1 = leaf1.ecx;

    if edx1 & (1 << 6) != 0 {
        f |= CpuFeatures::PAE;
    }
    if edx1 & (1 << 25) != 0 {
        f |= CpuFeatures::SSE;
    }
    if edx1 & (1 << 26) != 0 {
        f |= CpuFeatures::SSE2;
    }
    if ecx1 & (1 << 0) != 0 {
        f |= CpuFeatures::SSE3;
    }
    if ecx1 & (1 << 9) != 0 {
        f |= CpuFeatures::SSSE3;
    }
    if ecx1 & (1 << 19) != 0 {
        f |= CpuFeatures::SSE4_1;
    }
    if ecx1 & (1 << 20) != 0 {
        f |= CpuFeatures::SSE4_2;
    }
    if ecx1 & (1 << 26) != 0 {
        f |= CpuFeatures::XSAVE;
    }
    if ecx1 & (1 << 28) != 0 {
        f |= CpuFeatures::AVX;
    }
    if ecx1 & (1 << 5) != 0 {
        f |= CpuFeatures::VMX;
    }
    if leaf7.ebx & (1 << 5) != 0 {
        f |= CpuFeatures::AVX2;
    }
    if ext1.edx & (1 << 20) != 0 {
        f |= CpuFeatures::NX;
    }
    if ext1.ecx & (1 << 2) != 0 {
        f |= CpuFeatures::SVM;
    }
    f
}
