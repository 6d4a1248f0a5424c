//! VM objects and the node pools they are allocated from.

use kernel_slab::{SlabCache, SlabError};
use kernel_vmem::{FrameAlloc, PhysMapper, VirtualAddress, VmFlags};
use log::error;

/// One contiguous virtual range with uniform permissions.
///
/// Lives in an intrusive singly-linked list per address space, sorted by
/// ascending base and non-overlapping. The node memory itself comes from
/// a [`NodeAlloc`].
#[repr(C)]
pub struct VmObject {
    /// Page-aligned first byte.
    pub base: u64,
    /// Page-multiple length.
    pub length: u64,
    /// Access attributes of every leaf in the range.
    pub flags: VmFlags,
    /// Next object in ascending order; null terminates.
    pub next: *mut VmObject,
}

impl VmObject {
    /// Exclusive end of the range.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.base + self.length
    }

    /// Whether `va` lies inside the object.
    #[inline]
    #[must_use]
    pub const fn contains(&self, va: VirtualAddress) -> bool {
        va.as_u64() >= self.base && va.as_u64() < self.end()
    }
}

/// Source of [`VmObject`] nodes.
///
/// The kernel backs this with the "vm-object" slab cache; tests use a
/// heap-backed pool. Either way the VMM itself never allocates.
pub trait NodeAlloc {
    /// A zeroed node, or `None` when the backing allocator is exhausted.
    fn alloc_node(&mut self) -> Option<*mut VmObject>;

    /// Return a node.
    ///
    /// # Safety
    /// `node` must originate from `alloc_node` on the same pool and must
    /// not be referenced afterwards.
    unsafe fn free_node(&mut self, node: *mut VmObject);
}

/// [`NodeAlloc`] over a slab cache, converting the cache's physical
/// object addresses into pointers through a linear mapping with base
/// `virt_base` (the PHYSMAP in the kernel).
pub struct SlabNodePool<'s, M: PhysMapper, F: FrameAlloc> {
    pub cache: &'s mut SlabCache,
    pub mapper: M,
    pub frames: &'s mut F,
    /// Virtual address at which physical 0 is mapped.
    pub virt_base: u64,
}

impl<M: PhysMapper, F: FrameAlloc> NodeAlloc for SlabNodePool<'_, M, F> {
    fn alloc_node(&mut self) -> Option<*mut VmObject> {
        let pa = self.cache.alloc(&self.mapper, self.frames).ok()?;
        // SAFETY: the slab object is at least VmObject-sized (enforced at
        // cache creation) and exclusively ours.
        let node: &mut VmObject = unsafe { self.mapper.phys_to_mut(pa) };
        node.base = 0;
        node.length = 0;
        node.flags = VmFlags::empty();
        node.next = core::ptr::null_mut();
        Some(core::ptr::from_mut(node))
    }

    unsafe fn free_node(&mut self, node: *mut VmObject) {
        let pa = kernel_vmem::PhysicalAddress::new(node as u64 - self.virt_base);
        if let Err(e) = self.cache.free(&self.mapper, self.frames, pa) {
            error!("vmm: node free rejected by slab: {e}");
            debug_assert!(!matches!(e, SlabError::Invalid | SlabError::NotFound));
        }
    }
}
