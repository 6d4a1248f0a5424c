//! The interrupt stub block.
//!
//! One `global_asm!` emits all 256 stubs at a fixed 16-byte stride from
//! the `isr_stubs` base label, so the IDT can be filled from
//! `isr_stubs + 16 * vector` without a relocation table. Each stub
//! normalizes the stack to `[vector][error code][IRET frame]` and jumps
//! to the common entry, which saves the GPRs in [`CpuContext`] order and
//! calls `interrupt_dispatch` with the frame pointer.
//!
//! [`CpuContext`]: crate::interrupts::CpuContext

use kernel_info::memory::PAGE_SIZE;

/// Distance between consecutive stubs.
pub const STUB_STRIDE: u64 = 16;

unsafe extern "C" {
    /// First byte of stub 0; stub `n` is `STUB_STRIDE * n` bytes in.
    pub static isr_stubs: u8;
}

/// Address of the stub for `vector`.
#[must_use]
pub fn stub_address(vector: u8) -> u64 {
    // SAFETY: only the address is taken, the byte is never read.
    let base = unsafe { core::ptr::addr_of!(isr_stubs) } as u64;
    base + STUB_STRIDE * u64::from(vector)
}

// `_pad_sanity`: the stride must divide the page size or the .align
// padding scheme would drift.
const _: () = assert!(PAGE_SIZE % STUB_STRIDE == 0);

core::arch::global_asm!(
    r"
.pushsection .text

// Common entry: save the GPRs in CpuContext order, hand the frame to
// the dispatcher, restore, drop vector + error code, return.
.align 16
isr_common:
    pushq %rax
    pushq %rbx
    pushq %rcx
    pushq %rdx
    pushq %rsi
    pushq %rdi
    pushq %rbp
    pushq %r8
    pushq %r9
    pushq %r10
    pushq %r11
    pushq %r12
    pushq %r13
    pushq %r14
    pushq %r15
    movq %rsp, %rdi
    cld
    call interrupt_dispatch
    popq %r15
    popq %r14
    popq %r13
    popq %r12
    popq %r11
    popq %r10
    popq %r9
    popq %r8
    popq %rbp
    popq %rdi
    popq %rsi
    popq %rdx
    popq %rcx
    popq %rbx
    popq %rax
    addq $16, %rsp
    iretq

// 256 stubs, 16 bytes apart. Vectors 8, 10-14, 17, 21, 29 and 30 come
// with a hardware error code; every other stub pushes a zero
// placeholder first so the frame layout is uniform.
.align 16
.global isr_stubs
isr_stubs:
.set vector_nr, 0
.rept 256
    .align 16
    .if ((vector_nr == 8) + (vector_nr == 10) + (vector_nr == 11) + (vector_nr == 12) + (vector_nr == 13) + (vector_nr == 14) + (vector_nr == 17) + (vector_nr == 21) + (vector_nr == 29) + (vector_nr == 30))
    .else
    pushq $0
    .endif
    pushq $vector_nr
    jmp isr_common
    .set vector_nr, vector_nr + 1
.endr

.popsection
",
    options(att_syntax)
);
