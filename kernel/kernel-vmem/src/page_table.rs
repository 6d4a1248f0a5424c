//! Page tables and their entries.
//!
//! One 4 KiB-aligned table of 512 eight-byte entries, used at every level
//! of the walk. Entries are a [`bitfield_struct`] so each hardware bit is
//! named; the physical frame number lives in bits 12–51.

use crate::addresses::{PhysicalAddress, PhysicalFrame};
use bitfield_struct::bitfield;

/// One 64-bit page-table entry (any level).
///
/// For the levels this kernel uses, `page_size` must stay clear: all
/// leaves are PTEs.
#[bitfield(u64, order = Lsb)]
#[derive(PartialEq)]
pub struct PageTableEntry {
    /// Bit 0 — P: entry is valid; cleared entries fault on access.
    pub present: bool,
    /// Bit 1 — R/W: writes allowed.
    pub writable: bool,
    /// Bit 2 — U/S: accessible from CPL3.
    pub user: bool,
    /// Bit 3 — PWT: write-through caching; set for MMIO.
    pub write_through: bool,
    /// Bit 4 — PCD: cache disable; set for MMIO.
    pub cache_disable: bool,
    /// Bit 5 — A: set by hardware on access.
    pub accessed: bool,
    /// Bit 6 — D: set by hardware on write (leaves only).
    pub dirty: bool,
    /// Bit 7 — PS: large-page flag. Never set here; 4 KiB leaves only.
    pub page_size: bool,
    /// Bit 8 — G: survives CR3 reload when CR4.PGE is on.
    pub global: bool,
    /// Bits 9–11 — available to software.
    #[bits(3)]
    pub avl: u8,
    /// Bits 12–51 — physical frame number.
    #[bits(40)]
    frame_number: u64,
    /// Bits 52–62 — available to software.
    #[bits(11)]
    pub avl2: u16,
    /// Bit 63 — NX: no-execute, honored only when EFER.NXE is set.
    pub nx: bool,
}

impl PageTableEntry {
    /// The physical frame this entry points at (leaf) or the child table
    /// frame (interior).
    #[inline]
    #[must_use]
    pub const fn frame(self) -> PhysicalFrame {
        PhysicalFrame::from_base(PhysicalAddress::new(self.frame_number() << 12))
    }

    /// Point the entry at a frame, keeping all flag bits.
    #[inline]
    #[must_use]
    pub const fn with_frame(self, frame: PhysicalFrame) -> Self {
        self.with_frame_number(frame.base().as_u64() >> 12)
    }

    /// A fully cleared (non-present) entry.
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new()
    }
}

/// A 4 KiB page table: 512 entries at any level of the walk.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; 512],
}

impl PageTable {
    pub const ENTRIES: usize = 512;

    /// An all-zero table (every entry non-present).
    #[must_use]
    pub const fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::zero(); 512],
        }
    }

    /// Clear every entry.
    pub const fn zero(&mut self) {
        let mut i = 0;
        while i < Self::ENTRIES {
            self.entries[i] = PageTableEntry::zero();
            i += 1;
        }
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    /// Store an entry. Single 8-byte store, so a concurrent lock-free
    /// reader (a page walk from interrupt context) observes either the
    /// old or the new value, never a tear.
    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }

    #[inline]
    pub const fn clear(&mut self, index: usize) {
        self.entries[index] = PageTableEntry::zero();
    }

    /// Count of present entries; an interior table with zero present
    /// entries is eligible to be freed.
    #[must_use]
    pub fn present_count(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }
}

const _: () = assert!(size_of::<PageTable>() == 4096);
const _: () = assert!(size_of::<PageTableEntry>() == 8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_packs_frame_and_flags() {
        let frame = PhysicalFrame::from_base(PhysicalAddress::new(0x0030_0000));
        let e = PageTableEntry::new()
            .with_present(true)
            .with_writable(true)
            .with_nx(true)
            .with_frame(frame);
        assert_eq!(e.into_bits() & 0xFFF, 0b11);
        assert_eq!(e.into_bits() >> 63, 1);
        assert_eq!(e.frame().base().as_u64(), 0x0030_0000);
    }

    #[test]
    fn present_count_tracks_set_and_clear() {
        let mut t = PageTable::zeroed();
        assert_eq!(t.present_count(), 0);
        t.set(3, PageTableEntry::new().with_present(true));
        t.set(511, PageTableEntry::new().with_present(true));
        assert_eq!(t.present_count(), 2);
        t.clear(3);
        assert_eq!(t.present_count(), 1);
    }
}
