//! Legacy 8259 PIC shutdown.
//!
//! The APIC owns interrupt routing; the PICs are remapped away from the
//! exception vectors (so a stray edge cannot masquerade as a fault) and
//! then fully masked.

use kernel_arch::ports::{io_wait, outb};
use log::debug;

const PIC1_CMD: u16 = 0x20;
const PIC1_DATA: u16 = 0x21;
const PIC2_CMD: u16 = 0xA0;
const PIC2_DATA: u16 = 0xA1;

const ICW1_INIT_ICW4: u8 = 0x11;
const ICW4_8086: u8 = 0x01;

/// Remap the PICs to vectors 0x20/0x28 and mask every line.
///
/// # Safety
/// CPL0; run once during bring-up, before `sti`.
pub unsafe fn disable() {
    unsafe {
        // ICW1: start initialization, expect ICW4.
        outb(PIC1_CMD, ICW1_INIT_ICW4);
        io_wait();
        outb(PIC2_CMD, ICW1_INIT_ICW4);
        io_wait();
        // ICW2: vector offsets clear of the exception range.
        outb(PIC1_DATA, 0x20);
        io_wait();
        outb(PIC2_DATA, 0x28);
        io_wait();
        // ICW3: cascade wiring (slave on IRQ2).
        outb(PIC1_DATA, 4);
        io_wait();
        outb(PIC2_DATA, 2);
        io_wait();
        // ICW4: 8086 mode.
        outb(PIC1_DATA, ICW4_8086);
        io_wait();
        outb(PIC2_DATA, ICW4_8086);
        io_wait();
        // Mask everything on both PICs.
        outb(PIC1_DATA, 0xFF);
        outb(PIC2_DATA, 0xFF);
    }
    debug!("legacy PICs remapped and masked");
}
