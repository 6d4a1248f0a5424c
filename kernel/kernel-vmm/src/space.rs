//! One managed address space.

use crate::object::{NodeAlloc, VmObject};
use crate::VmmError;
use kernel_info::memory::PAGE_SIZE;
use kernel_vmem::{
    AddressSpace, FrameAlloc, PhysMapper, PhysicalAddress, PhysicalFrame, VirtualAddress, VmFlags,
    align_up, flags,
};
use log::trace;

/// An address space plus the VM-object list describing its mappings.
///
/// Dynamic allocations are placed inside `[alloc_base, alloc_end)`;
/// `alloc_at` may target addresses outside that window (fixed MMIO
/// windows, for instance) as long as they do not collide with anything.
pub struct VmSpace<M: PhysMapper> {
    tables: AddressSpace<M>,
    /// Head of the ascending, non-overlapping object list.
    objects: *mut VmObject,
    alloc_base: u64,
    alloc_end: u64,
}

// Safety: the raw object pointers are reachable only through &mut self /
// the lock protecting the space; nodes themselves live in slab pages.
unsafe impl<M: PhysMapper + Send> Send for VmSpace<M> {}

impl<M: PhysMapper> VmSpace<M> {
    /// Create a fresh (empty) address space with its own root table.
    ///
    /// # Errors
    /// - [`VmmError::NotAligned`] unless the window is page-aligned.
    /// - [`VmmError::NoMemory`] if the root frame cannot be allocated.
    pub fn create(
        mapper: M,
        frames: &mut impl FrameAlloc,
        alloc_base: u64,
        alloc_end: u64,
    ) -> Result<Self, VmmError> {
        if alloc_base >= alloc_end {
            return Err(VmmError::Invalid);
        }
        if alloc_base % PAGE_SIZE != 0 || alloc_end % PAGE_SIZE != 0 {
            return Err(VmmError::NotAligned);
        }
        let tables = AddressSpace::new(mapper, frames).map_err(|_| VmmError::NoMemory)?;
        Ok(Self {
            tables,
            objects: core::ptr::null_mut(),
            alloc_base,
            alloc_end,
        })
    }

    /// Create a space that shares the kernel upper half of `kernel`.
    ///
    /// # Errors
    /// See [`create`](Self::create).
    pub fn create_user(
        mapper: M,
        frames: &mut impl FrameAlloc,
        kernel: &Self,
        alloc_base: u64,
        alloc_end: u64,
    ) -> Result<Self, VmmError> {
        let space = Self::create(mapper, frames, alloc_base, alloc_end)?;
        space.tables.clone_upper_half_from(&kernel.tables);
        Ok(space)
    }

    /// Wrap the address space that is live in CR3 right now. Used once,
    /// for the kernel singleton.
    ///
    /// # Safety
    /// Must run at CPL0 with paging enabled; the PHYSMAP must already
    /// cover the page-table frames.
    pub unsafe fn from_current(mapper: M, alloc_base: u64, alloc_end: u64) -> Self {
        Self {
            tables: unsafe { AddressSpace::from_current(mapper) },
            objects: core::ptr::null_mut(),
            alloc_base,
            alloc_end,
        }
    }

    /// Load this space's root into CR3.
    ///
    /// # Safety
    /// The space must map the executing code and stack (guaranteed for
    /// spaces sharing the kernel upper half).
    pub unsafe fn switch(&self) {
        unsafe { self.tables.activate() }
    }

    /// The PML4 frame.
    #[must_use]
    pub const fn root(&self) -> PhysicalFrame {
        self.tables.root()
    }

    /// Direct access to the paging layer.
    pub const fn tables(&self) -> &AddressSpace<M> {
        &self.tables
    }

    /// Low-level: install one leaf without creating a VM object. The
    /// caller owns the frame and the bookkeeping.
    ///
    /// # Errors
    /// Paging-layer status, translated.
    pub fn map_page(
        &mut self,
        frames: &mut impl FrameAlloc,
        va: VirtualAddress,
        pa: PhysicalAddress,
        map_flags: VmFlags,
    ) -> Result<(), VmmError> {
        Ok(self.tables.map_page(frames, va, pa, map_flags)?)
    }

    /// Low-level: clear one leaf, returning the physical address it
    /// mapped. Empty interior tables go back to `frames`.
    ///
    /// # Errors
    /// [`VmmError::NotFound`] if nothing is mapped at `va`.
    pub fn unmap_page(
        &mut self,
        frames: &mut impl FrameAlloc,
        va: VirtualAddress,
    ) -> Result<PhysicalAddress, VmmError> {
        let old = self.tables.unmap_page(frames, va)?;
        Ok(old.frame().base())
    }

    /// Low-level: map a contiguous range. No unwind; see
    /// [`AddressSpace::map_range`].
    ///
    /// # Errors
    /// Paging-layer status, translated.
    pub fn map_range(
        &mut self,
        frames: &mut impl FrameAlloc,
        va: VirtualAddress,
        pa: PhysicalAddress,
        len: u64,
        map_flags: VmFlags,
    ) -> Result<(), VmmError> {
        Ok(self.tables.map_range(frames, va, pa, len, map_flags)?)
    }

    /// Low-level: unmap every present leaf in a range.
    pub fn unmap_range(&mut self, frames: &mut impl FrameAlloc, va: VirtualAddress, len: u64) {
        self.tables.unmap_range(frames, va, len);
    }

    /// Allocate `length` bytes (rounded to pages) in the window.
    ///
    /// With `MMIO` in `flags`, `phys` names the device range to map and
    /// no PMM memory is consumed; otherwise `phys` must be `None` and
    /// each leaf gets a fresh PMM frame.
    ///
    /// # Errors
    /// - [`VmmError::Invalid`] for zero length or a hint without `MMIO`.
    /// - [`VmmError::Oom`] when no gap fits.
    /// - [`VmmError::NoMemory`] when PMM frames or a node run out (any
    ///   partial mapping is unwound).
    pub fn alloc(
        &mut self,
        frames: &mut impl FrameAlloc,
        nodes: &mut impl NodeAlloc,
        length: u64,
        flags: VmFlags,
        phys: Option<PhysicalAddress>,
    ) -> Result<VirtualAddress, VmmError> {
        if length == 0 {
            return Err(VmmError::Invalid);
        }
        let length = align_up(length, PAGE_SIZE);
        let base = self.find_gap(length).ok_or(VmmError::Oom)?;
        self.install(frames, nodes, base, length, flags, phys)?;
        Ok(VirtualAddress::new(base))
    }

    /// Allocate at a caller-chosen base.
    ///
    /// # Errors
    /// - [`VmmError::NotAligned`] for an unaligned base.
    /// - [`VmmError::AlreadyMapped`] if any page intersects an existing
    ///   object or a stray leaf.
    /// - Everything [`alloc`](Self::alloc) can return.
    pub fn alloc_at(
        &mut self,
        frames: &mut impl FrameAlloc,
        nodes: &mut impl NodeAlloc,
        va: VirtualAddress,
        length: u64,
        flags: VmFlags,
        phys: Option<PhysicalAddress>,
    ) -> Result<VirtualAddress, VmmError> {
        if !va.is_page_aligned() {
            return Err(VmmError::NotAligned);
        }
        if length == 0 {
            return Err(VmmError::Invalid);
        }
        let length = align_up(length, PAGE_SIZE);

        if self.intersects_object(va.as_u64(), length) {
            return Err(VmmError::AlreadyMapped);
        }
        let mut off = 0;
        while off < length {
            if self.tables.leaf(va.add(off)).is_some() {
                return Err(VmmError::AlreadyMapped);
            }
            off += PAGE_SIZE;
        }

        self.install(frames, nodes, va.as_u64(), length, flags, phys)?;
        Ok(va)
    }

    /// Free the object covering `va`: unmap every leaf, release the PMM
    /// frames (unless the object is MMIO), release interior tables that
    /// emptied, drop the node.
    ///
    /// # Errors
    /// - [`VmmError::NotFound`] if no object covers `va`.
    pub fn free(
        &mut self,
        frames: &mut impl FrameAlloc,
        nodes: &mut impl NodeAlloc,
        va: VirtualAddress,
    ) -> Result<(), VmmError> {
        let node = self.take_node(va).ok_or(VmmError::NotFound)?;
        // SAFETY: node came off our list and is no longer linked.
        let (base, length, obj_flags) = unsafe { ((*node).base, (*node).length, (*node).flags) };

        self.unmap_leaves(frames, base, length, obj_flags);

        unsafe { nodes.free_node(node) };
        trace!("vmm: freed object {base:#x}+{length:#x}");
        Ok(())
    }

    /// Shrink or grow the object covering `va` to `new_length` (rounded
    /// to pages).
    ///
    /// # Errors
    /// - [`VmmError::NotFound`] / [`VmmError::Invalid`] (zero length or
    ///   MMIO growth).
    /// - [`VmmError::Oom`] if grown pages would collide with another
    ///   mapping or leave the window.
    /// - [`VmmError::NoMemory`] if the PMM runs dry (growth unwound).
    pub fn resize(
        &mut self,
        frames: &mut impl FrameAlloc,
        va: VirtualAddress,
        new_length: u64,
    ) -> Result<(), VmmError> {
        if new_length == 0 {
            return Err(VmmError::Invalid);
        }
        let new_length = align_up(new_length, PAGE_SIZE);
        let node = self.find_node(va).ok_or(VmmError::NotFound)?;
        let (base, length, obj_flags) = unsafe { ((*node).base, (*node).length, (*node).flags) };

        if new_length == length {
            return Ok(());
        }

        if new_length < length {
            // Unmap the tail.
            self.unmap_leaves(frames, base + new_length, length - new_length, obj_flags);
            unsafe { (*node).length = new_length };
            return Ok(());
        }

        // Growth.
        if obj_flags.contains(VmFlags::MMIO) {
            return Err(VmmError::Invalid);
        }
        if base + new_length > self.alloc_end {
            return Err(VmmError::Oom);
        }
        if self.intersects_object_except(base + length, new_length - length, node) {
            return Err(VmmError::Oom);
        }
        let mut off = length;
        while off < new_length {
            if self.tables.leaf(VirtualAddress::new(base + off)).is_some() {
                return Err(VmmError::Oom);
            }
            off += PAGE_SIZE;
        }

        self.map_fresh(frames, base + length, new_length - length, obj_flags)?;
        unsafe { (*node).length = new_length };
        Ok(())
    }

    /// Rewrite the protection of the object covering `va` to `new_flags`,
    /// walking every leaf and invalidating its TLB entry.
    ///
    /// Only WRITE/EXEC/USER are protection bits; the MMIO attribute is a
    /// property of the object and survives any protection change.
    ///
    /// # Errors
    /// - [`VmmError::NotFound`].
    pub fn protect(&mut self, va: VirtualAddress, new_flags: VmFlags) -> Result<(), VmmError> {
        let node = self.find_node(va).ok_or(VmmError::NotFound)?;
        let (base, length, old_flags) = unsafe { ((*node).base, (*node).length, (*node).flags) };
        let effective = (new_flags & (VmFlags::WRITE | VmFlags::EXEC | VmFlags::USER))
            | (old_flags & VmFlags::MMIO);
        let mut off = 0;
        while off < length {
            self.tables
                .protect_page(VirtualAddress::new(base + off), effective)?;
            off += PAGE_SIZE;
        }
        unsafe { (*node).flags = effective };
        Ok(())
    }

    /// Physical address behind `va`, if mapped.
    #[must_use]
    pub fn get_physical(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.tables.translate(va)
    }

    /// The object covering `va`, if any.
    #[must_use]
    pub fn find_mapped_object(&self, va: VirtualAddress) -> Option<&VmObject> {
        let node = self.find_node(va)?;
        // SAFETY: nodes on the list live until removed under &mut self.
        Some(unsafe { &*node })
    }

    /// Whether the leaf behind `va` carries (at least) `flags`.
    #[must_use]
    pub fn check_flags(&self, va: VirtualAddress, want: VmFlags) -> bool {
        self.tables
            .leaf(va)
            .is_some_and(|leaf| flags::flags_of(leaf).contains(want))
    }

    /// Visit every object in ascending order.
    pub fn for_each_object(&self, mut f: impl FnMut(&VmObject)) {
        let mut cur = self.objects;
        while !cur.is_null() {
            // SAFETY: list nodes are valid while the space lives.
            let obj = unsafe { &*cur };
            f(obj);
            cur = obj.next;
        }
    }

    /// Number of live objects.
    #[must_use]
    pub fn object_count(&self) -> usize {
        let mut n = 0;
        self.for_each_object(|_| n += 1);
        n
    }

    /// Destroy a non-kernel space: free every leaf frame that is not
    /// MMIO, every interior table unique to this space, every node, and
    /// finally the root. The shared kernel half is left untouched.
    pub fn destroy(mut self, frames: &mut impl FrameAlloc, nodes: &mut impl NodeAlloc) {
        // Leaf-to-root cascade over the lower half.
        self.tables.release_lower_half(frames);

        let mut cur = self.objects;
        while !cur.is_null() {
            let next = unsafe { (*cur).next };
            unsafe { nodes.free_node(cur) };
            cur = next;
        }
        self.objects = core::ptr::null_mut();

        frames.free_frame(self.tables.root());
    }

    // ----- internals -------------------------------------------------

    /// Map `[base, base+length)` and insert the describing node. Unwinds
    /// fully on failure.
    fn install(
        &mut self,
        frames: &mut impl FrameAlloc,
        nodes: &mut impl NodeAlloc,
        base: u64,
        length: u64,
        obj_flags: VmFlags,
        phys: Option<PhysicalAddress>,
    ) -> Result<(), VmmError> {
        if obj_flags.contains(VmFlags::MMIO) {
            let pa = phys.ok_or(VmmError::Invalid)?;
            if !pa.is_page_aligned() {
                return Err(VmmError::NotAligned);
            }
            let mut off = 0;
            while off < length {
                if let Err(e) = self.tables.map_page(
                    frames,
                    VirtualAddress::new(base + off),
                    pa.add(off),
                    obj_flags,
                ) {
                    self.unwind_mmio(frames, base, off);
                    return Err(e.into());
                }
                off += PAGE_SIZE;
            }
        } else {
            if phys.is_some() {
                return Err(VmmError::Invalid);
            }
            self.map_fresh(frames, base, length, obj_flags)?;
        }

        let Some(node) = nodes.alloc_node() else {
            if obj_flags.contains(VmFlags::MMIO) {
                self.unwind_mmio(frames, base, length);
            } else {
                self.unmap_leaves(frames, base, length, obj_flags);
            }
            return Err(VmmError::NoMemory);
        };
        unsafe {
            (*node).base = base;
            (*node).length = length;
            (*node).flags = obj_flags;
            self.insert_node(node);
        }
        trace!("vmm: object {base:#x}+{length:#x} {obj_flags:?}");
        Ok(())
    }

    /// Back `[base, base+length)` with fresh PMM frames. On failure every
    /// page mapped by this call is unwound and its frame returned.
    fn map_fresh(
        &mut self,
        frames: &mut impl FrameAlloc,
        base: u64,
        length: u64,
        obj_flags: VmFlags,
    ) -> Result<(), VmmError> {
        let mut off = 0;
        while off < length {
            let Some(frame) = frames.alloc_frame() else {
                self.unmap_leaves(frames, base, off, obj_flags);
                return Err(VmmError::NoMemory);
            };
            if let Err(e) =
                self.tables
                    .map_page(frames, VirtualAddress::new(base + off), frame.base(), obj_flags)
            {
                frames.free_frame(frame);
                self.unmap_leaves(frames, base, off, obj_flags);
                return Err(e.into());
            }
            off += PAGE_SIZE;
        }
        Ok(())
    }

    /// Unmap `[base, base+length)`, returning leaf frames to the PMM for
    /// non-MMIO objects.
    fn unmap_leaves(
        &mut self,
        frames: &mut impl FrameAlloc,
        base: u64,
        length: u64,
        obj_flags: VmFlags,
    ) {
        let mut off = 0;
        while off < length {
            if let Ok(old) = self.tables.unmap_page(frames, VirtualAddress::new(base + off)) {
                if !obj_flags.contains(VmFlags::MMIO) {
                    frames.free_frame(old.frame());
                }
            }
            off += PAGE_SIZE;
        }
    }

    /// Unmap an MMIO prefix without touching any frames.
    fn unwind_mmio(&mut self, frames: &mut impl FrameAlloc, base: u64, length: u64) {
        let mut off = 0;
        while off < length {
            let _ = self.tables.unmap_page(frames, VirtualAddress::new(base + off));
            off += PAGE_SIZE;
        }
    }

    /// Lowest gap of `length` bytes at or above `alloc_base`.
    fn find_gap(&self, length: u64) -> Option<u64> {
        let mut candidate = self.alloc_base;
        let mut cur = self.objects;
        while !cur.is_null() {
            let obj = unsafe { &*cur };
            if obj.end() <= candidate {
                cur = obj.next;
                continue;
            }
            if obj.base >= candidate + length {
                break;
            }
            candidate = obj.end();
            cur = obj.next;
        }
        (candidate + length <= self.alloc_end).then_some(candidate)
    }

    fn intersects_object(&self, base: u64, length: u64) -> bool {
        self.intersects_object_except(base, length, core::ptr::null_mut())
    }

    fn intersects_object_except(&self, base: u64, length: u64, skip: *mut VmObject) -> bool {
        let mut cur = self.objects;
        while !cur.is_null() {
            let obj = unsafe { &*cur };
            if !core::ptr::eq(cur, skip) && base < obj.end() && obj.base < base + length {
                return true;
            }
            cur = obj.next;
        }
        false
    }

    fn find_node(&self, va: VirtualAddress) -> Option<*mut VmObject> {
        let mut cur = self.objects;
        while !cur.is_null() {
            let obj = unsafe { &*cur };
            if obj.contains(va) {
                return Some(cur);
            }
            if obj.base > va.as_u64() {
                return None;
            }
            cur = obj.next;
        }
        None
    }

    /// Unlink and return the node covering `va`.
    fn take_node(&mut self, va: VirtualAddress) -> Option<*mut VmObject> {
        let mut link: *mut *mut VmObject = &raw mut self.objects;
        unsafe {
            while !(*link).is_null() {
                let node = *link;
                if (*node).contains(va) {
                    *link = (*node).next;
                    (*node).next = core::ptr::null_mut();
                    return Some(node);
                }
                if (*node).base > va.as_u64() {
                    return None;
                }
                link = &raw mut (*node).next;
            }
        }
        None
    }

    /// Insert a node keeping ascending base order.
    unsafe fn insert_node(&mut self, node: *mut VmObject) {
        unsafe {
            let base = (*node).base;
            let mut link: *mut *mut VmObject = &raw mut self.objects;
            while !(*link).is_null() && (**link).base < base {
                link = &raw mut (**link).next;
            }
            (*node).next = *link;
            *link = node;
        }
    }
}
