//! System description tables and the signature-indexed finder.

use crate::rsdp::AcpiRoots;
use crate::{AcpiError, PhysMapRo, sum};
use log::trace;

/// The 36-byte header every system description table starts with.
#[derive(Clone)]
#[repr(C, packed)]
pub struct SdtHeader {
    pub signature: [u8; 4],
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: [u8; 8],
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

const _: () = assert!(size_of::<SdtHeader>() == 36);

/// Map a full table: header first to learn `length`, then the whole
/// span, checksummed.
///
/// # Errors
/// - [`AcpiError::Truncated`] if `length` is shorter than the header.
/// - [`AcpiError::BadChecksum`] if the table does not sum to zero.
///
/// # Safety
/// `pa` must point at readable physical memory through `map`.
pub unsafe fn table_bytes<'a>(map: &impl PhysMapRo, pa: u64) -> Result<&'a [u8], AcpiError> {
    let head = unsafe { map.map_ro(pa, size_of::<SdtHeader>()) };
    // SAFETY: the slice covers the packed header.
    let header = unsafe { &*head.as_ptr().cast::<SdtHeader>() };
    let len = header.length as usize;
    if len < size_of::<SdtHeader>() {
        return Err(AcpiError::Truncated);
    }
    let full = unsafe { map.map_ro(pa, len) };
    if sum(full) != 0 {
        return Err(AcpiError::BadChecksum);
    }
    Ok(full)
}

/// Find the first table whose signature is `sig`, walking the XSDT
/// (64-bit entries) or RSDT (32-bit entries) from `roots`.
///
/// # Errors
/// - [`AcpiError::NotFound`] if no root table exists or no entry
///   matches.
/// - Propagates root-table validation failures; a corrupt *candidate*
///   entry is skipped rather than fatal.
///
/// # Safety
/// The root tables and their entries must be readable through `map`.
pub unsafe fn find_table<'a>(
    map: &impl PhysMapRo,
    roots: &AcpiRoots,
    sig: [u8; 4],
) -> Result<&'a [u8], AcpiError> {
    let (root_pa, wide) = roots.root_table().ok_or(AcpiError::NotFound)?;
    let root = unsafe { table_bytes(map, root_pa)? };

    let entries = &root[size_of::<SdtHeader>()..];
    let stride = if wide { 8 } else { 4 };

    for chunk in entries.chunks_exact(stride) {
        let pa = if wide {
            u64::from_le_bytes(chunk.try_into().unwrap())
        } else {
            u64::from(u32::from_le_bytes(chunk.try_into().unwrap()))
        };
        if pa == 0 {
            continue;
        }
        let head = unsafe { map.map_ro(pa, size_of::<SdtHeader>()) };
        if head[0..4] != sig {
            continue;
        }
        trace!(
            "acpi: {} at {pa:#x}",
            core::str::from_utf8(&sig).unwrap_or("????")
        );
        match unsafe { table_bytes(map, pa) } {
            Ok(bytes) => return Ok(bytes),
            // A table lying about itself is skipped, not fatal.
            Err(_) => continue,
        }
    }
    Err(AcpiError::NotFound)
}
