//! # Interrupt dispatch
//!
//! 256 assembly stubs at a fixed 16-byte stride push a vector number
//! (and a zero pseudo error code where the CPU does not push one), then
//! funnel into a common entry that saves every general register and
//! calls [`dispatch`] with a pointer to the saved [`CpuContext`].
//!
//! Dispatch order:
//! 1. the spurious vector returns immediately, **without** EOI;
//! 2. a registered handler runs; vectors ≥ 32 then get exactly one EOI;
//! 3. an unhandled vector < 32 is an exception: report and panic;
//! 4. anything else is logged and acknowledged.

mod exceptions;
mod idt;
mod pic;
mod stubs;

pub use exceptions::PageFaultError;
pub use idt::Idt;

use core::sync::atomic::{AtomicU64, Ordering};
use kernel_sync::{Mutex, RawSpin, SpinMutex};
use log::warn;

/// Vector programmed into the LAPIC spurious-interrupt register. Never
/// acknowledged.
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// First vector used for hardware interrupts; everything below is a CPU
/// exception.
pub const FIRST_IRQ_VECTOR: u8 = 32;

/// Everything the stubs saved, in stack order. `vector` is 0..=255;
/// `error_code` is 0 for vectors without a hardware error code.
#[derive(Debug, Clone)]
#[repr(C)]
pub struct CpuContext {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    // Hardware-pushed IRET frame.
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

/// A registered interrupt handler, called in saved-context form.
pub type IrqHandler = fn(&mut CpuContext);

/// Process-wide handler table, one optional entry per vector.
static HANDLERS: SpinMutex<[Option<IrqHandler>; 256]> =
    Mutex::from_raw(RawSpin::named("irq-handlers"), [None; 256]);

/// How end-of-interrupt is signalled; installed by the APIC driver.
/// Until then, acknowledging is a no-op (the PIC is masked anyway).
static EOI_HANDLER: SpinMutex<Option<fn()>> =
    Mutex::from_raw(RawSpin::named("eoi"), None);

/// EOIs issued, for diagnostics and the dispatch tests.
static EOI_COUNT: AtomicU64 = AtomicU64::new(0);

/// Install the IDT (all 256 gates pointing at the stub block) and mask
/// the legacy PICs out of existence.
///
/// # Safety
/// CPL0, once, before `sti`.
pub unsafe fn init() {
    unsafe {
        idt::init();
        pic::disable();
    }
}

/// Register `handler` for `vector`, replacing any previous one. Takes
/// the table lock with interrupts disabled.
pub fn register(vector: u8, handler: IrqHandler) {
    HANDLERS.lock_irq()[vector as usize] = Some(handler);
}

/// Remove the handler for `vector`.
pub fn unregister(vector: u8) {
    HANDLERS.lock_irq()[vector as usize] = None;
}

/// Install the end-of-interrupt sink (the LAPIC EOI write).
pub fn set_eoi_handler(f: fn()) {
    *EOI_HANDLER.lock_irq() = Some(f);
}

/// Number of EOIs issued so far.
#[must_use]
pub fn eoi_count() -> u64 {
    EOI_COUNT.load(Ordering::Relaxed)
}

fn acknowledge() {
    EOI_COUNT.fetch_add(1, Ordering::Relaxed);
    let f = *EOI_HANDLER.lock();
    if let Some(f) = f {
        f();
    }
}

/// The dispatcher. Runs with interrupts disabled (interrupt gates).
///
/// Also the seam the dispatch tests drive directly with a synthetic
/// context, standing in for a software `int n`.
pub fn dispatch(ctx: &mut CpuContext) {
    let vector = (ctx.vector & 0xFF) as u8;

    if vector == SPURIOUS_VECTOR {
        // Spurious delivery must not be acknowledged.
        return;
    }

    let handler = HANDLERS.lock()[vector as usize];
    if let Some(handler) = handler {
        handler(ctx);
        if vector >= FIRST_IRQ_VECTOR {
            acknowledge();
        }
        return;
    }

    if vector < FIRST_IRQ_VECTOR {
        // Unhandled exception: report and die.
        exceptions::report_fatal(ctx);
    }

    warn!("unhandled interrupt vector {vector:#x}, masking by ignoring");
    acknowledge();
}

/// C-ABI entry the common stub calls with the saved frame.
#[unsafe(no_mangle)]
extern "C" fn interrupt_dispatch(ctx: *mut CpuContext) {
    // SAFETY: the stub passes a pointer to the frame it just built.
    dispatch(unsafe { &mut *ctx });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn context(vector: u64) -> CpuContext {
        CpuContext {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            vector,
            error_code: 0,
            rip: 0xFFFF_FF80_0000_1000,
            cs: 0x08,
            rflags: 0x202,
            rsp: 0xFFFF_FF80_0020_0000,
            ss: 0x10,
        }
    }

    static CALLS: AtomicU64 = AtomicU64::new(0);

    // The EOI counter and handler table are process-wide; run the
    // dispatch tests one at a time.
    static DISPATCH_SERIAL: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn counting_handler(ctx: &mut CpuContext) {
        assert_eq!(ctx.vector, 0x30);
        CALLS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn handler_runs_once_with_exactly_one_eoi() {
        let _serial = DISPATCH_SERIAL.lock().unwrap();
        register(0x30, counting_handler);
        let calls_before = CALLS.load(Ordering::Relaxed);
        let eoi_before = eoi_count();

        let mut ctx = context(0x30);
        dispatch(&mut ctx);

        assert_eq!(CALLS.load(Ordering::Relaxed), calls_before + 1);
        assert_eq!(eoi_count(), eoi_before + 1);
        unregister(0x30);

        // With the handler gone, the vector is "unhandled hardware
        // interrupt": still acknowledged, handler not called.
        let mut ctx = context(0x30);
        dispatch(&mut ctx);
        assert_eq!(CALLS.load(Ordering::Relaxed), calls_before + 1);
    }

    #[test]
    fn spurious_vector_short_circuits_without_eoi() {
        let _serial = DISPATCH_SERIAL.lock().unwrap();
        let eoi_before = eoi_count();
        let mut ctx = context(u64::from(SPURIOUS_VECTOR));
        dispatch(&mut ctx);
        assert_eq!(eoi_count(), eoi_before);
    }

    #[test]
    fn unhandled_hardware_interrupt_is_acknowledged() {
        let _serial = DISPATCH_SERIAL.lock().unwrap();
        let eoi_before = eoi_count();
        let mut ctx = context(0x41);
        dispatch(&mut ctx);
        assert_eq!(eoi_count(), eoi_before + 1);
    }

    #[test]
    fn context_layout_matches_the_stub_frame() {
        // 15 GPRs + vector + error code + 5-word IRET frame.
        assert_eq!(size_of::<CpuContext>(), 22 * 8);
        assert_eq!(core::mem::offset_of!(CpuContext, vector), 15 * 8);
        assert_eq!(core::mem::offset_of!(CpuContext, rip), 17 * 8);
    }
}
