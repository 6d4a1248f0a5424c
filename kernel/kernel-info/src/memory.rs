//! # Memory Layout
//!
//! Higher-half layout constants. The kernel image and the PHYSMAP window
//! are both linear translations of physical memory; everything else in
//! the address space is managed dynamically by the VMM.

/// Size of a page frame and of every page-table leaf. The allocators only
/// ever deal in multiples of this.
pub const PAGE_SIZE: u64 = 4096;

/// End of the canonical lower half. PML4 slots at or above
/// [`KERNEL_PML4_SPLIT`] belong to the kernel and are shared by every
/// address space.
pub const KERNEL_PML4_SPLIT: usize = 256;

/// Where the kernel image executes: `V = P + KERNEL_BASE` for the image
/// range only.
///
/// # Kernel Build
/// This constant must match the linker script of the boot stub.
pub const KERNEL_BASE: u64 = 0xFFFF_FF80_0000_0000;

/// Base of the PHYSMAP window: a linear map of every byte of managed RAM.
/// Anything mapped at [`PHYSMAP_BASE`] + `pa` lets the kernel access
/// physical memory via a fixed offset.
pub const PHYSMAP_BASE: u64 = 0xFFFF_8880_0000_0000;

/// Upper bound on RAM the early PHYSMAP bring-up can cover. The boot-time
/// page-table pool inside the kernel image is sized from this.
pub const PHYSMAP_MAX_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Where the kernel VMM hands out dynamic mappings (MMIO windows, ACPI
/// table views, heap growth). Deliberately distinct from the PHYSMAP and
/// the image so a stray pointer into one range cannot alias another.
pub const KERNEL_VMM_BASE: u64 = 0xFFFF_C000_0000_0000;

/// Exclusive end of the kernel VMM allocation window.
pub const KERNEL_VMM_END: u64 = 0xFFFF_D000_0000_0000;

/// Translate a physical address into its PHYSMAP virtual alias.
#[inline]
#[must_use]
pub const fn physmap_virt(pa: u64) -> u64 {
    PHYSMAP_BASE + pa
}

const _: () = {
    assert!(PHYSMAP_BASE % PAGE_SIZE == 0);
    assert!(KERNEL_BASE > PHYSMAP_BASE);
    assert!(KERNEL_VMM_BASE > PHYSMAP_BASE + PHYSMAP_MAX_BYTES);
    assert!(KERNEL_VMM_END > KERNEL_VMM_BASE);
    assert!(KERNEL_BASE > KERNEL_VMM_END);
};
