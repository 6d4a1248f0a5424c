//! Exception classification and fatal reporting.

use super::CpuContext;
use bitfield_struct::bitfield;
use log::error;

/// Architectural names of the first 32 vectors.
pub const EXCEPTION_NAMES: [&str; 32] = [
    "Divide Error",
    "Debug",
    "Non-Maskable Interrupt",
    "Breakpoint",
    "Overflow",
    "BOUND Range Exceeded",
    "Invalid Opcode",
    "Device Not Available",
    "Double Fault",
    "Coprocessor Segment Overrun",
    "Invalid TSS",
    "Segment Not Present",
    "Stack-Segment Fault",
    "General Protection Fault",
    "Page Fault",
    "Reserved (15)",
    "x87 Floating-Point Error",
    "Alignment Check",
    "Machine Check",
    "SIMD Floating-Point Exception",
    "Virtualization Exception",
    "Control Protection Exception",
    "Reserved (22)",
    "Reserved (23)",
    "Reserved (24)",
    "Reserved (25)",
    "Reserved (26)",
    "Reserved (27)",
    "Hypervisor Injection Exception",
    "VMM Communication Exception",
    "Security Exception",
    "Reserved (31)",
];

/// Page-fault error code (Intel SDM Vol. 3A, §6.15).
#[bitfield(u64)]
pub struct PageFaultError {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool,
    /// 1 = write access.
    pub write: bool,
    /// 1 = fault at CPL3.
    pub user: bool,
    /// 1 = reserved bit set in a paging structure.
    pub reserved_bit: bool,
    /// 1 = instruction fetch.
    pub instruction_fetch: bool,
    /// 1 = protection-key violation.
    pub protection_key: bool,
    /// 1 = shadow-stack access.
    pub shadow_stack: bool,
    #[bits(57)]
    __: u64,
}

impl PageFaultError {
    /// One-line cause classification.
    #[must_use]
    pub fn explain(&self) -> &'static str {
        if !self.present() {
            "non-present page"
        } else if self.instruction_fetch() {
            "instruction fetch from protected page (NX)"
        } else if self.write() {
            "write to protected page"
        } else {
            "read from protected page"
        }
    }
}

/// Report an unhandled exception and halt. Page faults additionally
/// decode CR2 and the error-code bits.
pub fn report_fatal(ctx: &CpuContext) -> ! {
    let vector = (ctx.vector & 0xFF) as usize;
    let name = EXCEPTION_NAMES.get(vector).copied().unwrap_or("Unknown");

    error!("EXCEPTION: {name} (vector {vector}, error code {:#x})", ctx.error_code);
    if vector == 14 {
        let cr2 = unsafe { kernel_arch::cr::read_cr2() };
        let err = PageFaultError::from_bits(ctx.error_code);
        error!(
            "  page fault at {cr2:#018x}: {} ({}, {})",
            err.explain(),
            if err.user() { "user" } else { "kernel" },
            if err.write() { "write" } else { "read/exec" },
        );
    }
    error!(
        "  rip={:#018x} cs={:#06x} rflags={:#010x} rsp={:#018x} ss={:#06x}",
        ctx.rip, ctx.cs, ctx.rflags, ctx.rsp, ctx.ss
    );
    error!(
        "  rax={:#018x} rbx={:#018x} rcx={:#018x} rdx={:#018x}",
        ctx.rax, ctx.rbx, ctx.rcx, ctx.rdx
    );
    error!(
        "  rsi={:#018x} rdi={:#018x} rbp={:#018x}",
        ctx.rsi, ctx.rdi, ctx.rbp
    );
    error!(
        "  r8 ={:#018x} r9 ={:#018x} r10={:#018x} r11={:#018x}",
        ctx.r8, ctx.r9, ctx.r10, ctx.r11
    );
    error!(
        "  r12={:#018x} r13={:#018x} r14={:#018x} r15={:#018x}",
        ctx.r12, ctx.r13, ctx.r14, ctx.r15
    );

    panic!("unrecoverable exception: {name}");
}
