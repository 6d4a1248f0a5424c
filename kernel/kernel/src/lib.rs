//! # The kernel proper
//!
//! Everything above the reusable library crates: interrupt plumbing,
//! the APIC drivers, the serial log sink, the global allocator instances
//! and the bring-up sequence that wires them together in dependency
//! order:
//!
//! ```text
//! boot stub → paging (PHYSMAP, identity teardown) → IDT + PIC off
//!           → ACPI roots (direct phys) → PMM → slab → VMM → heap
//!           → APIC (LAPIC + IOAPIC via MADT) → interrupts on
//! ```
//!
//! The boot stub calls [`kmain`] exactly once on the bootstrap CPU with
//! paging already enabled (identity plus higher half) and interrupts
//! off.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod acpi;
pub mod apic;
pub mod cpu;
pub mod interrupts;
pub mod logger;
pub mod mm;
pub mod panic;
pub mod serial;

use kernel_info::boot::BootInfo;
use log::{info, warn};

/// Kernel entry point.
///
/// # Safety
/// Call once, from the boot stub, on the BSP, at CPL0, with the
/// loader's identity-plus-higher-half tables live and interrupts
/// disabled.
pub unsafe fn kmain(boot: &BootInfo) -> ! {
    logger::init(log::LevelFilter::Info);
    info!(
        "osmium: {} MiB RAM in {} regions",
        boot.total_ram() / 1024 / 1024,
        boot.memory_map.len()
    );

    unsafe {
        cpu::init();
        mm::init_paging(boot);
        interrupts::init();
    }

    let roots = acpi::early_roots(boot);
    if roots.is_none() {
        warn!("no usable ACPI root pointer; APIC setup will be skipped");
    }

    unsafe {
        mm::init_pmm(boot);
        mm::init_slab();
        mm::init_vmm();
    }
    mm::init_heap();

    if let Some(roots) = &roots {
        unsafe { apic::init(roots) };
    }

    kernel_sync::irq::enable_interrupts();
    info!("osmium core online");

    loop {
        panic::halt();
    }
}
