//! Kernel-side ACPI access: the two mapping strategies behind the
//! walker's [`PhysMapRo`] seam.
//!
//! During bring-up, tables are read through the PHYSMAP (which aliases
//! the ACPI regions precisely for this). Once the VMM is online, every
//! pointer is re-walked through uncached MMIO windows that are unmapped
//! again with a single free per table.

use crate::mm;
use core::cell::RefCell;
use kernel_acpi::{AcpiRoots, PhysMapRo};
use kernel_info::boot::BootInfo;
use kernel_info::memory::{PAGE_SIZE, physmap_virt};
use kernel_vmem::{PhysicalAddress, VirtualAddress, align_up};
use log::{info, warn};

/// Pre-VMM mapper: firmware tables are visible through the PHYSMAP.
pub struct EarlyAcpiMapper;

impl PhysMapRo for EarlyAcpiMapper {
    unsafe fn map_ro<'a>(&self, paddr: u64, len: usize) -> &'a [u8] {
        // SAFETY: the PHYSMAP covers RAM and the ACPI regions; the
        // caller promises `len` readable bytes exist at `paddr`.
        unsafe { core::slice::from_raw_parts(physmap_virt(paddr) as *const u8, len) }
    }
}

/// Validate the RSDP the loader handed over, through the PHYSMAP.
#[must_use]
pub fn early_roots(boot: &BootInfo) -> Option<AcpiRoots> {
    let tag = boot.rsdp?;
    match unsafe { AcpiRoots::parse(&EarlyAcpiMapper, tag) } {
        Ok(roots) => {
            info!(
                "acpi: revision {} rsdp at {:#x} (xsdt: {})",
                roots.revision,
                roots.rsdp_addr,
                roots.xsdt_addr.is_some()
            );
            Some(roots)
        }
        Err(e) => {
            warn!("acpi: RSDP rejected: {e}");
            None
        }
    }
}

/// Post-VMM mapper: every `map_ro` becomes an uncached window in the
/// kernel VMM, remembered so [`release`](VmmAcpiMapper::release) can
/// hand all of them back with one `free` each.
pub struct VmmAcpiMapper {
    windows: RefCell<[Option<VirtualAddress>; MAX_WINDOWS]>,
}

const MAX_WINDOWS: usize = 16;

impl Default for VmmAcpiMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl VmmAcpiMapper {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            windows: RefCell::new([None; MAX_WINDOWS]),
        }
    }

    /// Unmap every window this mapper created.
    pub fn release(&self) {
        for slot in self.windows.borrow_mut().iter_mut() {
            if let Some(va) = slot.take() {
                let _ = mm::kernel_unmap(va);
            }
        }
    }
}

impl PhysMapRo for VmmAcpiMapper {
    unsafe fn map_ro<'a>(&self, paddr: u64, len: usize) -> &'a [u8] {
        let page = paddr & !(PAGE_SIZE - 1);
        let span = align_up(paddr + len as u64, PAGE_SIZE) - page;

        match mm::kernel_map_mmio_ro(PhysicalAddress::new(page), span) {
            Ok(va) => {
                let mut windows = self.windows.borrow_mut();
                if let Some(slot) = windows.iter_mut().find(|s| s.is_none()) {
                    *slot = Some(va);
                } else {
                    warn!("acpi: window table full, leaking mapping at {va}");
                }
                let start = (va.as_u64() + (paddr - page)) as *const u8;
                // SAFETY: just mapped `span` bytes covering the request.
                unsafe { core::slice::from_raw_parts(start, len) }
            }
            Err(e) => {
                // Last resort: the PHYSMAP alias established at bring-up.
                warn!("acpi: VMM window failed ({e}), reading via PHYSMAP");
                unsafe { EarlyAcpiMapper.map_ro(paddr, len) }
            }
        }
    }
}
