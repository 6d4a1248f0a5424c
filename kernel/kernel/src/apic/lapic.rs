//! Local APIC driver (xAPIC MMIO mode).

use crate::mm;
use kernel_arch::msr::{APIC_BASE_ADDR_MASK, APIC_BASE_ENABLE, IA32_APIC_BASE, rdmsr, wrmsr};
use kernel_vmem::PhysicalAddress;
use kernel_vmm::VmmError;
use log::info;

// Register offsets into the 4 KiB MMIO frame.
const REG_ID: u64 = 0x20;
const REG_VERSION: u64 = 0x30;
const REG_TPR: u64 = 0x80;
const REG_EOI: u64 = 0xB0;
const REG_SVR: u64 = 0xF0;
const REG_ESR: u64 = 0x280;
const REG_ICR_LO: u64 = 0x300;
const REG_ICR_HI: u64 = 0x310;
const REG_LVT_LINT0: u64 = 0x350;
const REG_LVT_LINT1: u64 = 0x360;

/// SVR bit 8: software-enable.
const SVR_ENABLE: u32 = 1 << 8;
/// ICR bit 12: delivery status (1 = send pending).
const ICR_PENDING: u32 = 1 << 12;
/// LVT delivery mode NMI (bits 8–10 = 100).
const LVT_NMI: u32 = 0b100 << 8;

/// Handle to the mapped local APIC. Copyable; all state is in the
/// device.
#[derive(Copy, Clone)]
pub struct Lapic {
    /// Virtual base of the 4 KiB register frame.
    base: u64,
}

// Safety: the register window is a fixed device mapping; volatile
// accesses are inherently racy and the single-CPU design serializes
// them.
unsafe impl Send for Lapic {}
unsafe impl Sync for Lapic {}

impl Lapic {
    /// Globally enable the LAPIC if firmware left it off, map its MMIO
    /// frame through the kernel VMM and software-enable it with the
    /// spurious vector, TPR 0.
    ///
    /// # Errors
    /// VMM failures mapping the register frame.
    ///
    /// # Safety
    /// CPL0; call once on the BSP.
    pub unsafe fn init(spurious_vector: u8) -> Result<Self, VmmError> {
        let mut base_msr = unsafe { rdmsr(IA32_APIC_BASE) };
        if base_msr & APIC_BASE_ENABLE == 0 {
            base_msr |= APIC_BASE_ENABLE;
            unsafe { wrmsr(IA32_APIC_BASE, base_msr) };
        }
        let phys = base_msr & APIC_BASE_ADDR_MASK;

        let va = mm::kernel_map_mmio(PhysicalAddress::new(phys), 4096)?;
        let lapic = Self { base: va.as_u64() };

        lapic.write(REG_SVR, SVR_ENABLE | u32::from(spurious_vector));
        lapic.write(REG_TPR, 0);
        // Clear stale error state; ESR wants a write before a read.
        lapic.write(REG_ESR, 0);

        info!(
            "lapic: id {} version {:#x} at phys {phys:#x}",
            lapic.id(),
            lapic.read(REG_VERSION) & 0xFF
        );
        Ok(lapic)
    }

    fn read(&self, reg: u64) -> u32 {
        // SAFETY: `base` maps the LAPIC frame uncached.
        unsafe { core::ptr::read_volatile((self.base + reg) as *const u32) }
    }

    fn write(&self, reg: u64, value: u32) {
        // SAFETY: as in `read`.
        unsafe { core::ptr::write_volatile((self.base + reg) as *mut u32, value) }
    }

    /// The local APIC ID of this CPU.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.read(REG_ID) >> 24
    }

    /// Signal end-of-interrupt.
    pub fn eoi(&self) {
        self.write(REG_EOI, 0);
    }

    /// Send a fixed-delivery IPI to `dest`. Waits for any previous send
    /// to drain, then writes destination (high) before command (low).
    pub fn send_ipi(&self, dest: u32, vector: u8) {
        while self.read(REG_ICR_LO) & ICR_PENDING != 0 {
            core::hint::spin_loop();
        }
        self.write(REG_ICR_HI, dest << 24);
        self.write(REG_ICR_LO, u32::from(vector));
    }

    /// Wire LINT0 or LINT1 to NMI delivery, applying the MADT polarity
    /// (bit 13) and trigger (bit 15) flags.
    pub fn set_nmi(&self, lint: u8, flags: u16) {
        let mut value = LVT_NMI;
        if flags & 0b11 == 0b11 {
            value |= 1 << 13; // active low
        }
        if (flags >> 2) & 0b11 == 0b11 {
            value |= 1 << 15; // level triggered
        }
        let reg = if lint == 0 { REG_LVT_LINT0 } else { REG_LVT_LINT1 };
        self.write(reg, value);
    }
}
