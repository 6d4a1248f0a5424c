//! # Address Space (x86-64, PML4-rooted)
//!
//! The 4-level walker/editor: map and unmap single pages or ranges,
//! translate, and rewrite leaf protections. One instance describes one
//! tree rooted at a PML4 frame.
//!
//! ## Design
//!
//! - Leaves are always 4 KiB PTEs; the PS bit is never set.
//! - Interior entries are created maximally permissive (present +
//!   writable, plus US for user mappings); the leaf decides access.
//! - Page-table frames come from the caller's [`FrameAlloc`]; the editor
//!   returns them as soon as a table's present count drops to zero —
//!   except the PML4 itself and any table in the kernel's shared upper
//!   half, which other address spaces alias.
//! - Every mutation of a live leaf is a single 8-byte store followed by a
//!   TLB invalidation through the [`PhysMapper`].

use crate::addresses::{PhysicalAddress, PhysicalFrame, VirtualAddress};
use crate::flags::{VmFlags, leaf_entry, table_entry};
use crate::page_table::{PageTable, PageTableEntry};
use crate::{FrameAlloc, PagingError, PhysMapper};
use kernel_info::memory::{KERNEL_PML4_SPLIT, PAGE_SIZE};

/// Handle to a single, concrete address space.
pub struct AddressSpace<M: PhysMapper> {
    /// The PML4 frame.
    root: PhysicalFrame,
    mapper: M,
}

impl<M: PhysMapper> AddressSpace<M> {
    /// Allocate and zero a fresh root table.
    ///
    /// # Errors
    /// [`PagingError::OutOfMemory`] if the allocator is exhausted.
    pub fn new(mapper: M, alloc: &mut impl FrameAlloc) -> Result<Self, PagingError> {
        let root = alloc.alloc_frame().ok_or(PagingError::OutOfMemory)?;
        let space = Self { root, mapper };
        space.table_mut(root).zero();
        Ok(space)
    }

    /// View the **currently active** address space by reading CR3.
    ///
    /// # Safety
    /// Must run at CPL0 with paging enabled; CR3 must point at a valid
    /// PML4 reachable through `mapper`.
    #[inline]
    pub unsafe fn from_current(mapper: M) -> Self {
        let root_pa = unsafe { kernel_arch::cr::read_cr3() };
        Self {
            root: PhysicalFrame::from_base(PhysicalAddress::new(root_pa)),
            mapper,
        }
    }

    /// Wrap an existing root frame.
    #[inline]
    pub const fn from_root(mapper: M, root: PhysicalFrame) -> Self {
        Self { root, mapper }
    }

    /// Physical frame of the PML4.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalFrame {
        self.root
    }

    /// Load CR3 with this address space's root.
    ///
    /// # Safety
    /// The target tree must map the currently executing code, stack and
    /// the PHYSMAP, or the CPU faults immediately after the switch.
    #[inline]
    pub unsafe fn activate(&self) {
        unsafe { kernel_arch::cr::write_cr3(self.root.base().as_u64()) }
    }

    /// Borrow a table in `frame` through the mapper.
    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, frame: PhysicalFrame) -> &mut PageTable {
        // SAFETY: page-table frames are only reached through this editor
        // while the owning lock is held; the mapper guarantees the frame
        // is mapped writable.
        unsafe { self.mapper.phys_to_mut::<PageTable>(frame.base()) }
    }

    /// Walk to the child table of `entry`, creating it if absent.
    fn ensure_child(
        &self,
        alloc: &mut impl FrameAlloc,
        parent: &mut PageTable,
        index: usize,
        flags: VmFlags,
    ) -> Result<PhysicalFrame, PagingError> {
        let entry = parent.get(index);
        if entry.present() {
            // Promote the US bit if a user mapping is routed through an
            // existing kernel-only subtree.
            if flags.contains(VmFlags::USER) && !entry.user() {
                parent.set(index, entry.with_user(true));
            }
            return Ok(entry.frame());
        }

        let frame = alloc.alloc_frame().ok_or(PagingError::OutOfMemory)?;
        self.table_mut(frame).zero();
        parent.set(index, table_entry(flags).with_frame(frame));
        Ok(frame)
    }

    /// Map **one** 4 KiB page `va → pa` with `flags`.
    ///
    /// # Errors
    /// - [`PagingError::Unaligned`] unless both addresses are page-aligned.
    /// - [`PagingError::AlreadyMapped`] if a present leaf exists.
    /// - [`PagingError::OutOfMemory`] if an interior table cannot be
    ///   allocated; any tables created earlier in this call remain (they
    ///   are empty and harmless, and the caller's unwind path prunes
    ///   them on unmap).
    pub fn map_page(
        &self,
        alloc: &mut impl FrameAlloc,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: VmFlags,
    ) -> Result<(), PagingError> {
        if !va.is_page_aligned() || !pa.is_page_aligned() {
            return Err(PagingError::Unaligned);
        }

        let pml4 = self.table_mut(self.root);
        let pdpt_f = self.ensure_child(alloc, pml4, va.pml4_index(), flags)?;
        let pdpt = self.table_mut(pdpt_f);
        let pd_f = self.ensure_child(alloc, pdpt, va.pdpt_index(), flags)?;
        let pd = self.table_mut(pd_f);
        let pt_f = self.ensure_child(alloc, pd, va.pd_index(), flags)?;
        let pt = self.table_mut(pt_f);

        if pt.get(va.pt_index()).present() {
            return Err(PagingError::AlreadyMapped);
        }
        pt.set(
            va.pt_index(),
            leaf_entry(flags).with_frame(PhysicalFrame::from_base(pa)),
        );
        self.mapper.invalidate(va);
        Ok(())
    }

    /// Unmap the 4 KiB page at `va`, returning its old leaf entry so the
    /// caller can decide what to do with the frame (MMIO frames are not
    /// the PMM's to free).
    ///
    /// Interior tables that drop to zero present entries are returned to
    /// `alloc`, except in the kernel's shared upper half.
    ///
    /// # Errors
    /// [`PagingError::NotMapped`] if no present leaf covers `va`.
    pub fn unmap_page(
        &self,
        alloc: &mut impl FrameAlloc,
        va: VirtualAddress,
    ) -> Result<PageTableEntry, PagingError> {
        let pml4 = self.table_mut(self.root);
        let e4 = pml4.get(va.pml4_index());
        if !e4.present() {
            return Err(PagingError::NotMapped);
        }
        let pdpt_f = e4.frame();
        let pdpt = self.table_mut(pdpt_f);
        let e3 = pdpt.get(va.pdpt_index());
        if !e3.present() {
            return Err(PagingError::NotMapped);
        }
        let pd_f = e3.frame();
        let pd = self.table_mut(pd_f);
        let e2 = pd.get(va.pd_index());
        if !e2.present() {
            return Err(PagingError::NotMapped);
        }
        let pt_f = e2.frame();
        let pt = self.table_mut(pt_f);
        let old = pt.get(va.pt_index());
        if !old.present() {
            return Err(PagingError::NotMapped);
        }

        pt.clear(va.pt_index());
        self.mapper.invalidate(va);

        // Prune empty interior tables bottom-up. Kernel-half subtrees are
        // shared across address spaces and must survive.
        if va.pml4_index() < KERNEL_PML4_SPLIT {
            if pt.present_count() == 0 {
                pd.clear(va.pd_index());
                alloc.free_frame(pt_f);
                if pd.present_count() == 0 {
                    pdpt.clear(va.pdpt_index());
                    alloc.free_frame(pd_f);
                    if pdpt.present_count() == 0 {
                        pml4.clear(va.pml4_index());
                        alloc.free_frame(pdpt_f);
                    }
                }
            }
        }

        Ok(old)
    }

    /// Map the contiguous range `[va, va+len)` to `[pa, pa+len)`.
    ///
    /// On failure the already-mapped prefix is left in place; the caller
    /// owns the unwind (it also owns the leaf frames).
    ///
    /// # Errors
    /// See [`map_page`](Self::map_page); additionally `Unaligned` for an
    /// unaligned `len`.
    pub fn map_range(
        &self,
        alloc: &mut impl FrameAlloc,
        va: VirtualAddress,
        pa: PhysicalAddress,
        len: u64,
        flags: VmFlags,
    ) -> Result<(), PagingError> {
        if len % PAGE_SIZE != 0 {
            return Err(PagingError::Unaligned);
        }
        let mut off = 0;
        while off < len {
            self.map_page(alloc, va.add(off), pa.add(off), flags)?;
            off += PAGE_SIZE;
        }
        Ok(())
    }

    /// Unmap every present leaf in `[va, va+len)`. Holes are skipped.
    pub fn unmap_range(&self, alloc: &mut impl FrameAlloc, va: VirtualAddress, len: u64) {
        let mut off = 0;
        while off < len {
            let _ = self.unmap_page(alloc, va.add(off));
            off += PAGE_SIZE;
        }
    }

    /// Translate `va` to the physical address it maps to, if any.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        let leaf = self.leaf(va)?;
        Some(leaf.frame().base().add(va.page_offset()))
    }

    /// The present leaf entry covering `va`, if any.
    #[must_use]
    pub fn leaf(&self, va: VirtualAddress) -> Option<PageTableEntry> {
        let pml4 = self.table_mut(self.root);
        let e4 = pml4.get(va.pml4_index());
        if !e4.present() {
            return None;
        }
        let e3 = self.table_mut(e4.frame()).get(va.pdpt_index());
        if !e3.present() {
            return None;
        }
        let e2 = self.table_mut(e3.frame()).get(va.pd_index());
        if !e2.present() {
            return None;
        }
        let e1 = self.table_mut(e2.frame()).get(va.pt_index());
        e1.present().then_some(e1)
    }

    /// Rewrite the protection bits of the leaf at `va` from `flags`,
    /// keeping the mapped frame, and invalidate the TLB entry.
    ///
    /// # Errors
    /// [`PagingError::NotMapped`] if no present leaf covers `va`.
    pub fn protect_page(&self, va: VirtualAddress, flags: VmFlags) -> Result<(), PagingError> {
        let pml4 = self.table_mut(self.root);
        let e4 = pml4.get(va.pml4_index());
        if !e4.present() {
            return Err(PagingError::NotMapped);
        }
        let e3 = self.table_mut(e4.frame()).get(va.pdpt_index());
        if !e3.present() {
            return Err(PagingError::NotMapped);
        }
        let e2 = self.table_mut(e3.frame()).get(va.pd_index());
        if !e2.present() {
            return Err(PagingError::NotMapped);
        }
        let pt = self.table_mut(e2.frame());
        let old = pt.get(va.pt_index());
        if !old.present() {
            return Err(PagingError::NotMapped);
        }
        pt.set(va.pt_index(), leaf_entry(flags).with_frame(old.frame()));
        self.mapper.invalidate(va);
        Ok(())
    }

    /// Copy the kernel upper-half PML4 entries (slots 256..512) from
    /// `src`, aliasing the same kernel subtrees. Lower levels are not
    /// touched.
    pub fn clone_upper_half_from(&self, src: &Self) {
        let dst_l4 = self.table_mut(self.root);
        let src_l4 = self.table_mut(src.root);
        for i in KERNEL_PML4_SPLIT..PageTable::ENTRIES {
            let e = src_l4.get(i);
            if e.present() {
                debug_assert!(!e.user(), "kernel PML4E must have US=0");
            }
            dst_l4.set(i, e);
        }
    }

    /// Clear every lower-half PML4 entry. Used at the end of early
    /// bring-up to tear down the boot identity window.
    pub fn clear_lower_half(&self) {
        let l4 = self.table_mut(self.root);
        for i in 0..KERNEL_PML4_SPLIT {
            l4.clear(i);
        }
    }

    /// Drop a single PML4 slot without freeing the subtree. Bring-up
    /// only: used to discard loader mappings whose frames the PMM never
    /// owned in the first place.
    pub fn clear_pml4_slot(&self, index: usize) {
        self.table_mut(self.root).clear(index);
    }

    /// Free everything reachable from the lower half: every leaf frame
    /// that is not device memory (cache-disabled), then every interior
    /// table, bottom-up. The upper half is skipped entirely, keeping the
    /// kernel-shared subtrees alive.
    ///
    /// This is the teardown cascade behind address-space destruction; the
    /// root frame itself stays with the caller.
    pub fn release_lower_half(&self, alloc: &mut impl FrameAlloc) {
        let pml4 = self.table_mut(self.root);
        for i4 in 0..KERNEL_PML4_SPLIT {
            let e4 = pml4.get(i4);
            if !e4.present() {
                continue;
            }
            let pdpt_f = e4.frame();
            let pdpt = self.table_mut(pdpt_f);
            for i3 in 0..PageTable::ENTRIES {
                let e3 = pdpt.get(i3);
                if !e3.present() {
                    continue;
                }
                let pd_f = e3.frame();
                let pd = self.table_mut(pd_f);
                for i2 in 0..PageTable::ENTRIES {
                    let e2 = pd.get(i2);
                    if !e2.present() {
                        continue;
                    }
                    let pt_f = e2.frame();
                    let pt = self.table_mut(pt_f);
                    for i1 in 0..PageTable::ENTRIES {
                        let e1 = pt.get(i1);
                        if e1.present() && !e1.cache_disable() {
                            alloc.free_frame(e1.frame());
                        }
                    }
                    pd.clear(i2);
                    alloc.free_frame(pt_f);
                }
                pdpt.clear(i3);
                alloc.free_frame(pd_f);
            }
            pml4.clear(i4);
            alloc.free_frame(pdpt_f);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory physical RAM and a bump allocator, shared by the paging
    //! tests and reused by downstream crates' dev-dependencies through
    //! copies of the same pattern.

    use super::*;
    use std::vec::Vec;

    /// A 4 KiB-aligned raw frame used as fake physical RAM.
    #[repr(align(4096))]
    pub struct Aligned4K(pub [u8; 4096]);

    /// Simulated physical memory: frame `i` is physical `i * 4096`.
    pub struct TestPhys {
        frames: Vec<Box<Aligned4K>>,
    }

    impl TestPhys {
        pub fn with_frames(n: usize) -> Self {
            let mut frames = Vec::with_capacity(n);
            for _ in 0..n {
                frames.push(Box::new(Aligned4K([0u8; 4096])));
            }
            Self { frames }
        }
    }

    impl PhysMapper for TestPhys {
        unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
            let idx = (pa.as_u64() >> 12) as usize;
            let off = (pa.as_u64() & 0xFFF) as usize;
            debug_assert_eq!(off, 0, "table access must be frame-aligned");
            let base = (&raw const self.frames[idx].0) as *mut u8;
            // SAFETY: test-only; the caller promises `T` matches the frame.
            unsafe { &mut *base.cast::<T>() }
        }

        fn invalidate(&self, _va: VirtualAddress) {
            // No TLB on the build host.
        }
    }

    /// Bump allocator over the fake RAM with a free list so tests can
    /// observe pruning.
    pub struct BumpAlloc {
        next: u64,
        end: u64,
        pub freed: Vec<u64>,
    }

    impl BumpAlloc {
        pub fn new(start: u64, end: u64) -> Self {
            Self {
                next: start,
                end,
                freed: Vec::new(),
            }
        }

        pub fn allocated(&self) -> u64 {
            self.next
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn alloc_frame(&mut self) -> Option<PhysicalFrame> {
            if let Some(pa) = self.freed.pop() {
                return Some(PhysicalFrame::from_base(PhysicalAddress::new(pa)));
            }
            if self.next + 4096 > self.end {
                return None;
            }
            let p = self.next;
            self.next += 4096;
            Some(PhysicalFrame::from_base(PhysicalAddress::new(p)))
        }

        fn free_frame(&mut self, frame: PhysicalFrame) {
            self.freed.push(frame.base().as_u64());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{BumpAlloc, TestPhys};
    use super::*;

    fn fresh(frames: usize) -> (TestPhys, BumpAlloc) {
        let phys = TestPhys::with_frames(frames);
        let alloc = BumpAlloc::new(0, (frames as u64) << 12);
        (phys, alloc)
    }

    #[test]
    fn map_one_creates_tables_and_leaf() {
        let (phys, mut alloc) = fresh(64);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0x40_0000);
        let pa = PhysicalAddress::new(0x3_0000);
        aspace
            .map_page(&mut alloc, va, pa, VmFlags::WRITE)
            .expect("map_page");

        // Root + PDPT + PD + PT.
        assert_eq!(alloc.allocated(), 4 * 4096);
        let leaf = aspace.leaf(va).expect("leaf");
        assert!(leaf.writable());
        assert!(!leaf.user());
        assert_eq!(aspace.translate(va), Some(pa));
        assert_eq!(aspace.translate(va.add(0x123)), Some(pa.add(0x123)));
    }

    #[test]
    fn double_map_is_rejected() {
        let (phys, mut alloc) = fresh(64);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0x40_0000);
        aspace
            .map_page(&mut alloc, va, PhysicalAddress::new(0x3_0000), VmFlags::WRITE)
            .unwrap();
        assert_eq!(
            aspace.map_page(&mut alloc, va, PhysicalAddress::new(0x4_0000), VmFlags::WRITE),
            Err(PagingError::AlreadyMapped)
        );
    }

    #[test]
    fn unaligned_addresses_are_rejected() {
        let (phys, mut alloc) = fresh(64);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();
        assert_eq!(
            aspace.map_page(
                &mut alloc,
                VirtualAddress::new(0x40_0010),
                PhysicalAddress::new(0x3_0000),
                VmFlags::WRITE
            ),
            Err(PagingError::Unaligned)
        );
    }

    #[test]
    fn unmap_returns_entry_and_prunes_empty_tables() {
        let (phys, mut alloc) = fresh(64);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0x40_0000);
        let pa = PhysicalAddress::new(0x3_0000);
        aspace.map_page(&mut alloc, va, pa, VmFlags::WRITE).unwrap();

        let old = aspace.unmap_page(&mut alloc, va).expect("unmap");
        assert_eq!(old.frame().base(), pa);
        assert_eq!(aspace.translate(va), None);
        // PT, PD and PDPT all dropped to zero present entries.
        assert_eq!(alloc.freed.len(), 3);
        assert_eq!(
            aspace.unmap_page(&mut alloc, va),
            Err(PagingError::NotMapped)
        );
    }

    #[test]
    fn shared_upper_half_tables_are_never_pruned() {
        let (phys, mut alloc) = fresh(64);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();

        // PML4 slot 273 — the PHYSMAP region, firmly in the kernel half.
        let va = VirtualAddress::new(0xFFFF_8880_0000_0000);
        aspace
            .map_page(&mut alloc, va, PhysicalAddress::new(0x3_0000), VmFlags::WRITE)
            .unwrap();
        aspace.unmap_page(&mut alloc, va).unwrap();
        assert!(alloc.freed.is_empty(), "kernel-half tables must stay");
    }

    #[test]
    fn range_map_and_unmap_round_trip() {
        let (phys, mut alloc) = fresh(64);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0x80_0000);
        let pa = PhysicalAddress::new(0x10_0000);
        aspace
            .map_range(&mut alloc, va, pa, 8 * 4096, VmFlags::WRITE)
            .unwrap();
        for i in 0..8u64 {
            assert_eq!(
                aspace.translate(va.add(i * 4096)),
                Some(pa.add(i * 4096)),
                "page {i}"
            );
        }
        aspace.unmap_range(&mut alloc, va, 8 * 4096);
        for i in 0..8u64 {
            assert_eq!(aspace.translate(va.add(i * 4096)), None);
        }
    }

    #[test]
    fn protect_rewrites_leaf_bits_in_place() {
        let (phys, mut alloc) = fresh(64);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();

        let va = VirtualAddress::new(0x40_0000);
        let pa = PhysicalAddress::new(0x3_0000);
        aspace.map_page(&mut alloc, va, pa, VmFlags::WRITE).unwrap();
        aspace.protect_page(va, VmFlags::empty()).unwrap();

        let leaf = aspace.leaf(va).unwrap();
        assert!(!leaf.writable());
        assert_eq!(leaf.frame().base(), pa, "frame must survive protect");
    }

    #[test]
    fn cloned_upper_half_aliases_kernel_subtrees() {
        let (phys, mut alloc) = fresh(64);
        let kernel = AddressSpace::new(&phys, &mut alloc).unwrap();
        let va = VirtualAddress::new(0xFFFF_8880_0000_0000);
        let pa = PhysicalAddress::new(0x3_0000);
        kernel.map_page(&mut alloc, va, pa, VmFlags::WRITE).unwrap();

        let user = AddressSpace::new(&phys, &mut alloc).unwrap();
        user.clone_upper_half_from(&kernel);
        assert_eq!(user.translate(va), Some(pa));

        // A later kernel mapping in the same subtree is visible through
        // the alias without re-cloning.
        let va2 = va.add(4096);
        kernel
            .map_page(&mut alloc, va2, PhysicalAddress::new(0x4_0000), VmFlags::WRITE)
            .unwrap();
        assert_eq!(user.translate(va2), Some(PhysicalAddress::new(0x4_0000)));
    }

    #[test]
    fn release_lower_half_frees_leaves_and_tables_but_keeps_mmio() {
        let (phys, mut alloc) = fresh(64);
        let aspace = AddressSpace::new(&phys, &mut alloc).unwrap();

        let ram_va = VirtualAddress::new(0x40_0000);
        let ram_pa = PhysicalAddress::new(0x3_0000);
        let mmio_va = VirtualAddress::new(0x41_0000);
        let mmio_pa = PhysicalAddress::new(0x8_0000);
        aspace
            .map_page(&mut alloc, ram_va, ram_pa, VmFlags::WRITE)
            .unwrap();
        aspace
            .map_page(&mut alloc, mmio_va, mmio_pa, VmFlags::WRITE | VmFlags::MMIO)
            .unwrap();

        alloc.freed.clear();
        aspace.release_lower_half(&mut alloc);

        assert!(alloc.freed.contains(&ram_pa.as_u64()), "RAM leaf freed");
        assert!(
            !alloc.freed.contains(&mmio_pa.as_u64()),
            "MMIO leaf must not be handed to the PMM"
        );
        // PT + PD + PDPT freed as well (both pages share one chain).
        assert_eq!(alloc.freed.len(), 4);
        assert_eq!(aspace.translate(ram_va), None);
    }
}
