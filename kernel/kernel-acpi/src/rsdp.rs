//! # RSDP/XSDP (Root/Extended System Description Pointer)

use crate::{AcpiError, PhysMapRo, sum};
use kernel_info::boot::RsdpTag;

/// The validated entry points into the ACPI table forest.
#[derive(Debug)]
pub struct AcpiRoots {
    pub rsdp_addr: u64,
    pub revision: u8,
    pub rsdt_addr: Option<u64>,
    pub xsdt_addr: Option<u64>,
}

/// ACPI 1.0 Root System Description Pointer (RSDP).
#[derive(Clone)]
#[repr(C, packed)]
struct Rsdp {
    signature: [u8; 8], // "RSD PTR "
    checksum: u8,       // sum of first 20 bytes == 0
    oem_id: [u8; 6],
    revision: u8, // 0 for ACPI 1.0
    rsdt_addr: u32,
}

/// ACPI 2.0 Extended System Description Pointer (XSDP).
#[derive(Clone)]
#[repr(C, packed)]
struct Xsdp {
    signature: [u8; 8],
    checksum: u8,
    oem_id: [u8; 6],
    revision: u8, // >= 2
    rsdt_addr: u32,
    length: u32,
    xsdt_addr: u64,
    ext_checksum: u8, // checksum of the entire structure
    reserved: [u8; 3],
}

impl AcpiRoots {
    /// Validate the RSDP the boot loader handed over.
    ///
    /// The 1.0 form is 20 bytes checksummed in full; the 2.0+ form is
    /// additionally checksummed over its self-declared `length` and may
    /// carry a 64-bit XSDT pointer, which takes precedence when present.
    ///
    /// # Errors
    /// - [`AcpiError::BadSignature`] on a missing `"RSD PTR "`.
    /// - [`AcpiError::BadChecksum`] on either checksum failing.
    ///
    /// # Safety
    /// `tag` must point at readable physical memory through `map`.
    pub unsafe fn parse(map: &impl PhysMapRo, tag: RsdpTag) -> Result<Self, AcpiError> {
        let rsdp_addr = tag.rsdp_phys();
        if rsdp_addr == 0 {
            return Err(AcpiError::BadSignature);
        }

        let v1 = unsafe { map.map_ro(rsdp_addr, size_of::<Rsdp>()) };
        if &v1[0..8] != b"RSD PTR " {
            return Err(AcpiError::BadSignature);
        }
        if sum(&v1[0..20]) != 0 {
            return Err(AcpiError::BadChecksum);
        }

        // SAFETY: 20 validated bytes; the struct is packed and Copy-read.
        let v1p = unsafe { &*v1.as_ptr().cast::<Rsdp>() };
        let revision = v1p.revision;
        let rsdt_addr = u64::from(v1p.rsdt_addr);
        let rsdt_addr = (rsdt_addr != 0).then_some(rsdt_addr);

        if revision >= 2 && matches!(tag, RsdpTag::New { .. }) {
            let v2 = unsafe { map.map_ro(rsdp_addr, size_of::<Xsdp>()) };
            let v2p = unsafe { &*v2.as_ptr().cast::<Xsdp>() };
            let len = v2p.length as usize;
            if len < size_of::<Xsdp>() {
                return Err(AcpiError::Truncated);
            }
            let full = unsafe { map.map_ro(rsdp_addr, len) };
            if sum(full) != 0 {
                return Err(AcpiError::BadChecksum);
            }
            let xsdt = v2p.xsdt_addr;
            return Ok(Self {
                rsdp_addr,
                revision,
                rsdt_addr,
                xsdt_addr: (xsdt != 0).then_some(xsdt),
            });
        }

        Ok(Self {
            rsdp_addr,
            revision,
            rsdt_addr,
            xsdt_addr: None,
        })
    }

    /// The root table to walk: the XSDT when present, the RSDT otherwise.
    #[must_use]
    pub const fn root_table(&self) -> Option<(u64, bool)> {
        match (self.xsdt_addr, self.rsdt_addr) {
            (Some(x), _) => Some((x, true)),
            (None, Some(r)) => Some((r, false)),
            (None, None) => None,
        }
    }
}
