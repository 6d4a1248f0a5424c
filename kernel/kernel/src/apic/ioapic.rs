//! I/O APIC driver.
//!
//! Two MMIO registers front the whole device: an index register at +0x00
//! and a data window at +0x10. The redirection table starts at internal
//! index 0x10, two 32-bit registers per entry.

use crate::interrupts::FIRST_IRQ_VECTOR;
use crate::mm;
use kernel_vmem::PhysicalAddress;
use kernel_vmm::VmmError;
use log::{debug, info};

const REG_SELECT: u64 = 0x00;
const REG_WINDOW: u64 = 0x10;

const IDX_VERSION: u32 = 0x01;
const IDX_REDTBL: u32 = 0x10;

/// Redirection entry low-dword bit 16: masked.
const RED_MASKED: u32 = 1 << 16;

/// One I/O APIC and the GSI range it serves.
pub struct IoApic {
    base: u64,
    gsi_base: u32,
    entries: u32,
}

// Safety: see `Lapic`; single writer by design.
unsafe impl Send for IoApic {}
unsafe impl Sync for IoApic {}

impl IoApic {
    /// Map the device and mask every redirection entry with its default
    /// identity routing: GSI `n` → vector `32 + n`, destination `bsp`.
    ///
    /// # Errors
    /// VMM failures mapping the register frame.
    ///
    /// # Safety
    /// CPL0; `phys` must be the MMIO frame the MADT reported.
    pub unsafe fn init(phys: u32, gsi_base: u32, bsp_apic_id: u32) -> Result<Self, VmmError> {
        let va = mm::kernel_map_mmio(PhysicalAddress::new(u64::from(phys)), 4096)?;
        let mut ioapic = Self {
            base: va.as_u64(),
            gsi_base,
            entries: 0,
        };
        ioapic.entries = ((ioapic.read(IDX_VERSION) >> 16) & 0xFF) + 1;

        for i in 0..ioapic.entries {
            let vector = u32::from(FIRST_IRQ_VECTOR) + gsi_base + i;
            ioapic.write(IDX_REDTBL + 2 * i + 1, bsp_apic_id << 24);
            ioapic.write(IDX_REDTBL + 2 * i, RED_MASKED | vector);
        }

        info!(
            "ioapic: {} entries for GSI {gsi_base}.. at phys {phys:#x}",
            ioapic.entries
        );
        Ok(ioapic)
    }

    fn read(&self, index: u32) -> u32 {
        unsafe {
            core::ptr::write_volatile((self.base + REG_SELECT) as *mut u32, index);
            core::ptr::read_volatile((self.base + REG_WINDOW) as *const u32)
        }
    }

    fn write(&self, index: u32, value: u32) {
        unsafe {
            core::ptr::write_volatile((self.base + REG_SELECT) as *mut u32, index);
            core::ptr::write_volatile((self.base + REG_WINDOW) as *mut u32, value);
        }
    }

    /// Whether this I/O APIC serves `gsi`.
    #[must_use]
    pub const fn covers(&self, gsi: u32) -> bool {
        gsi >= self.gsi_base && gsi < self.gsi_base + self.entries
    }

    /// Apply an interrupt source override: ISA IRQ `source_irq` arrives
    /// on `gsi` with the MADT polarity (bit 13) / trigger (bit 15)
    /// flags. The entry keeps the ISA vector and stays masked until a
    /// driver unmasks it.
    pub fn apply_override(&self, source_irq: u8, gsi: u32, flags: u16) {
        if !self.covers(gsi) {
            return;
        }
        let i = gsi - self.gsi_base;
        let mut lo = RED_MASKED | (u32::from(FIRST_IRQ_VECTOR) + u32::from(source_irq));
        if flags & 0b11 == 0b11 {
            lo |= 1 << 13;
        }
        if (flags >> 2) & 0b11 == 0b11 {
            lo |= 1 << 15;
        }
        self.write(IDX_REDTBL + 2 * i, lo);
        debug!("ioapic: ISA IRQ {source_irq} -> GSI {gsi} (flags {flags:#x})");
    }

    /// Unmask the entry for `gsi`.
    pub fn unmask(&self, gsi: u32) {
        if !self.covers(gsi) {
            return;
        }
        let i = gsi - self.gsi_base;
        let lo = self.read(IDX_REDTBL + 2 * i);
        self.write(IDX_REDTBL + 2 * i, lo & !RED_MASKED);
    }

    /// Mask the entry for `gsi`.
    pub fn mask(&self, gsi: u32) {
        if !self.covers(gsi) {
            return;
        }
        let i = gsi - self.gsi_base;
        let lo = self.read(IDX_REDTBL + 2 * i);
        self.write(IDX_REDTBL + 2 * i, lo | RED_MASKED);
    }
}
