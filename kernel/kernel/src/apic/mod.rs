//! APIC bring-up from the MADT.

pub mod ioapic;
pub mod lapic;

use crate::acpi::VmmAcpiMapper;
use crate::interrupts::{self, SPURIOUS_VECTOR};
use kernel_acpi::madt::{MADT_ALL_PROCESSORS, MADT_SIGNATURE, Madt, MadtEntry};
use kernel_acpi::rsdp::AcpiRoots;
use kernel_acpi::find_table;
use kernel_sync::SyncOnceCell;
use log::{info, warn};

pub use ioapic::IoApic;
pub use lapic::Lapic;

/// The BSP's local APIC, once mapped.
static LAPIC: SyncOnceCell<Lapic> = SyncOnceCell::new();

/// The I/O APICs found in the MADT (two is already exotic).
static IOAPICS: SyncOnceCell<[Option<IoApic>; 4]> = SyncOnceCell::new();

/// The mapped LAPIC.
#[must_use]
pub fn local_apic() -> Option<&'static Lapic> {
    LAPIC.get()
}

/// Mask or unmask a GSI on whichever I/O APIC covers it.
pub fn set_gsi_masked(gsi: u32, masked: bool) {
    if let Some(ioapics) = IOAPICS.get() {
        for ioapic in ioapics.iter().flatten() {
            if ioapic.covers(gsi) {
                if masked {
                    ioapic.mask(gsi);
                } else {
                    ioapic.unmask(gsi);
                }
                return;
            }
        }
    }
    warn!("no ioapic covers GSI {gsi}");
}

fn dispatch_eoi() {
    if let Some(lapic) = LAPIC.get() {
        lapic.eoi();
    }
}

/// Bring up the local APIC and every I/O APIC the MADT describes, apply
/// the interrupt source overrides and NMI wirings, and hand the EOI path
/// to the dispatcher.
///
/// # Safety
/// CPL0, once, after the VMM is online (MMIO windows come from it).
pub unsafe fn init(roots: &AcpiRoots) {
    let mapper = VmmAcpiMapper::new();
    let Ok(madt_bytes) = (unsafe { find_table(&mapper, roots, MADT_SIGNATURE) }) else {
        warn!("MADT not found; interrupt controllers stay untouched");
        return;
    };
    let Ok(madt) = Madt::parse(madt_bytes) else {
        warn!("MADT malformed; interrupt controllers stay untouched");
        return;
    };

    let lapic = match unsafe { Lapic::init(SPURIOUS_VECTOR) } {
        Ok(l) => l,
        Err(e) => {
            warn!("LAPIC mapping failed: {e}");
            return;
        }
    };
    let bsp_id = lapic.id();
    kernel_sync::set_current_cpu_id(bsp_id);
    let _ = LAPIC.set(lapic);
    interrupts::set_eoi_handler(dispatch_eoi);

    // The MADT "processor id" of the BSP, for NMI matching.
    let bsp_processor = madt.entries().find_map(|e| match e {
        MadtEntry::LocalApic {
            processor_id,
            apic_id,
            ..
        } if u32::from(apic_id) == bsp_id => Some(processor_id),
        _ => None,
    });

    let mut ioapics: [Option<IoApic>; 4] = [const { None }; 4];
    let mut next_ioapic = 0;
    let mut cpu_count = 0;

    for entry in madt.entries() {
        match entry {
            MadtEntry::LocalApic { flags, .. } => {
                if flags & 1 != 0 {
                    cpu_count += 1;
                }
            }
            MadtEntry::IoApic { id, addr, gsi_base } => {
                match unsafe { IoApic::init(addr, gsi_base, bsp_id) } {
                    Ok(ioapic) if next_ioapic < ioapics.len() => {
                        ioapics[next_ioapic] = Some(ioapic);
                        next_ioapic += 1;
                    }
                    Ok(_) => warn!("ignoring surplus ioapic {id}"),
                    Err(e) => warn!("ioapic {id} mapping failed: {e}"),
                }
            }
            MadtEntry::LocalApicNmi {
                processor_id,
                flags,
                lint,
            } => {
                let matches_bsp = processor_id == MADT_ALL_PROCESSORS
                    || Some(processor_id) == bsp_processor;
                if matches_bsp {
                    lapic.set_nmi(lint, flags);
                    info!("lapic: LINT{lint} wired to NMI");
                }
            }
            MadtEntry::InterruptOverride { .. } | MadtEntry::Unknown { .. } => {}
        }
    }

    // Overrides second, once every I/O APIC is initialized.
    for entry in madt.entries() {
        if let MadtEntry::InterruptOverride {
            source_irq,
            gsi,
            flags,
            ..
        } = entry
        {
            for ioapic in ioapics.iter().flatten() {
                ioapic.apply_override(source_irq, gsi, flags);
            }
        }
    }

    let _ = IOAPICS.set(ioapics);
    mapper.release();
    info!("apic: online, {cpu_count} enabled CPUs reported (BSP only is used)");
}
