//! # MADT (Multiple APIC Description Table)
//!
//! Enumerates the interrupt controllers: local APICs, I/O APICs,
//! interrupt source overrides and local-APIC NMI wirings. The APIC
//! bring-up consumes exactly these four record kinds; everything else is
//! surfaced as [`MadtEntry::Unknown`] and skipped.

use crate::{AcpiError, SdtHeader};

/// Signature of the MADT in the root table.
pub const MADT_SIGNATURE: [u8; 4] = *b"APIC";

/// Matches any processor UID in NMI records.
pub const MADT_ALL_PROCESSORS: u8 = 0xFF;

/// Parsed view over a validated MADT byte slice.
pub struct Madt<'a> {
    /// Physical address of the local APIC MMIO block.
    pub local_apic_addr: u32,
    /// Bit 0: legacy 8259 PICs are present and must be masked.
    pub flags: u32,
    records: &'a [u8],
}

/// One MADT record, decoded.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MadtEntry {
    /// Type 0: one processor-local APIC.
    LocalApic {
        processor_id: u8,
        apic_id: u8,
        flags: u32,
    },
    /// Type 1: one I/O APIC.
    IoApic { id: u8, addr: u32, gsi_base: u32 },
    /// Type 2: ISA IRQ → GSI remap with polarity/trigger flags.
    InterruptOverride {
        bus: u8,
        source_irq: u8,
        gsi: u32,
        flags: u16,
    },
    /// Type 4: which LINT pin of which LAPIC is wired to NMI.
    LocalApicNmi {
        processor_id: u8,
        flags: u16,
        lint: u8,
    },
    /// Anything this kernel does not interpret.
    Unknown { kind: u8 },
}

impl<'a> Madt<'a> {
    /// Interpret a full MADT as returned by the table finder.
    ///
    /// # Errors
    /// - [`AcpiError::BadSignature`] for a non-MADT slice.
    /// - [`AcpiError::Truncated`] if the fixed part is incomplete.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, AcpiError> {
        const FIXED: usize = size_of::<SdtHeader>() + 8;
        if bytes.len() < FIXED {
            return Err(AcpiError::Truncated);
        }
        if bytes[0..4] != MADT_SIGNATURE {
            return Err(AcpiError::BadSignature);
        }
        let h = size_of::<SdtHeader>();
        let local_apic_addr = u32::from_le_bytes(bytes[h..h + 4].try_into().unwrap());
        let flags = u32::from_le_bytes(bytes[h + 4..h + 8].try_into().unwrap());
        Ok(Self {
            local_apic_addr,
            flags,
            records: &bytes[FIXED..],
        })
    }

    /// Whether dual 8259 PICs exist and need masking.
    #[must_use]
    pub const fn has_legacy_pics(&self) -> bool {
        self.flags & 1 != 0
    }

    /// Iterate the variable records.
    #[must_use]
    pub const fn entries(&self) -> MadtIter<'a> {
        MadtIter {
            bytes: self.records,
        }
    }
}

/// Iterator over MADT records. Malformed lengths terminate the walk
/// rather than running off the table.
pub struct MadtIter<'a> {
    bytes: &'a [u8],
}

impl Iterator for MadtIter<'_> {
    type Item = MadtEntry;

    fn next(&mut self) -> Option<MadtEntry> {
        if self.bytes.len() < 2 {
            return None;
        }
        let kind = self.bytes[0];
        let len = self.bytes[1] as usize;
        if len < 2 || len > self.bytes.len() {
            return None;
        }
        let rec = &self.bytes[..len];
        self.bytes = &self.bytes[len..];

        let entry = match (kind, len) {
            (0, 8..) => MadtEntry::LocalApic {
                processor_id: rec[2],
                apic_id: rec[3],
                flags: u32::from_le_bytes(rec[4..8].try_into().unwrap()),
            },
            (1, 12..) => MadtEntry::IoApic {
                id: rec[2],
                addr: u32::from_le_bytes(rec[4..8].try_into().unwrap()),
                gsi_base: u32::from_le_bytes(rec[8..12].try_into().unwrap()),
            },
            (2, 10..) => MadtEntry::InterruptOverride {
                bus: rec[2],
                source_irq: rec[3],
                gsi: u32::from_le_bytes(rec[4..8].try_into().unwrap()),
                flags: u16::from_le_bytes(rec[8..10].try_into().unwrap()),
            },
            (4, 6..) => MadtEntry::LocalApicNmi {
                processor_id: rec[2],
                flags: u16::from_le_bytes(rec[3..5].try_into().unwrap()),
                lint: rec[5],
            },
            _ => MadtEntry::Unknown { kind },
        };
        Some(entry)
    }
}
