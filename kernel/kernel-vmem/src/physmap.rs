//! # The PHYSMAP window
//!
//! A linear higher-half mapping of every byte of managed RAM at
//! [`PHYSMAP_BASE`]. Once installed, `va = PHYSMAP_BASE + pa` holds for
//! any physical frame the allocators manage, which is what lets the PMM
//! keep its free lists *inside* the free blocks and the paging layer
//! edit arbitrary page-table frames.
//!
//! Also home of the early bring-up steps that run exactly once on the
//! boot CPU: installing the window and tearing down the loader's
//! identity mapping.

use crate::address_space::AddressSpace;
use crate::addresses::{PhysicalAddress, VirtualAddress};
use crate::flags::VmFlags;
use crate::page_table::PageTable;
use crate::{FrameAlloc, PagingError, PhysMapper, align_down, align_up};
use kernel_info::boot::{MemoryRegion, RegionKind};
use kernel_info::memory::{
    KERNEL_BASE, KERNEL_PML4_SPLIT, PAGE_SIZE, PHYSMAP_BASE, PHYSMAP_MAX_BYTES, physmap_virt,
};
use log::{debug, info};

/// [`PhysMapper`] backed by the PHYSMAP window.
///
/// Zero-sized; every instance is the same window. Invalidation is a real
/// `invlpg`, because this mapper is only ever used on the live kernel
/// address space.
#[derive(Copy, Clone, Default)]
pub struct PhysmapMapper;

impl PhysMapper for PhysmapMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = physmap_virt(pa.as_u64()) as *mut T;
        // SAFETY: the PHYSMAP covers all managed RAM writable; the caller
        // guarantees `pa` is managed and matches `T`.
        unsafe { &mut *va }
    }

    fn invalidate(&self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }
}

/// Install the PHYSMAP: map every RAM region of the memory map at
/// `P + PHYSMAP_BASE`, writable, never executable, 4 KiB leaves.
///
/// Must run while the loader's identity-plus-higher-half tables are still
/// live, with `alloc` drawing from the page-table pool reserved inside
/// the kernel image.
///
/// # Errors
/// - [`PagingError::OutOfMemory`] if the pool is too small for the map.
pub fn install_physmap<M: PhysMapper>(
    aspace: &AddressSpace<M>,
    alloc: &mut impl FrameAlloc,
    memory_map: &[MemoryRegion],
) -> Result<(), PagingError> {
    for region in memory_map.iter().filter(|r| r.kind == RegionKind::Ram) {
        let start = align_down(region.start, PAGE_SIZE);
        let end = align_up(region.end(), PAGE_SIZE).min(PHYSMAP_MAX_BYTES);
        if start >= end {
            continue;
        }
        debug!("physmap: RAM {start:#x}..{end:#x}");
        let mut pa = start;
        while pa < end {
            match aspace.map_page(
                alloc,
                VirtualAddress::new(physmap_virt(pa)),
                PhysicalAddress::new(pa),
                VmFlags::WRITE,
            ) {
                // Overlapping firmware map entries are tolerated.
                Ok(()) | Err(PagingError::AlreadyMapped) => {}
                Err(e) => return Err(e),
            }
            pa += PAGE_SIZE;
        }
    }
    info!("physmap installed at {PHYSMAP_BASE:#x}");
    Ok(())
}

/// Tear down everything the loader mapped that the kernel does not need:
/// every lower-half entry (the identity window) and every upper-half
/// PML4 slot other than the PHYSMAP and the kernel image.
///
/// After this, reading any low virtual address faults; physical memory is
/// reachable only through the PHYSMAP, and the image only at
/// [`KERNEL_BASE`].
pub fn drop_boot_mappings<M: PhysMapper>(aspace: &AddressSpace<M>) {
    let physmap_slot_first = VirtualAddress::new(PHYSMAP_BASE).pml4_index();
    let physmap_slot_last =
        VirtualAddress::new(PHYSMAP_BASE + PHYSMAP_MAX_BYTES - 1).pml4_index();
    let image_slot = VirtualAddress::new(KERNEL_BASE).pml4_index();

    aspace.clear_lower_half();
    for i in KERNEL_PML4_SPLIT..PageTable::ENTRIES {
        let keep = (i >= physmap_slot_first && i <= physmap_slot_last) || i == image_slot;
        if !keep {
            aspace.clear_pml4_slot(i);
        }
    }
    info!("boot identity window dropped");
}
