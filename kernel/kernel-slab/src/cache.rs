//! One named object cache and its slab pages.

use crate::SlabError;
use kernel_info::memory::PAGE_SIZE;
use kernel_vmem::{FrameAlloc, PhysMapper, PhysicalAddress, PhysicalFrame, align_up};
use log::error;

/// Magic stamped into every slab-page header.
pub const SLAB_MAGIC: u32 = 0x51AB_0C0A;

/// Sentinel index terminating a slab's embedded freelist.
const NO_OBJECT: u32 = u32::MAX;

/// Header at the start of every slab page.
///
/// `next`/`prev` link the page into one of its cache's three state lists
/// (physical addresses, 0 = end). `free_head` indexes the first free
/// object; each free object stores the index of the next free one in its
/// first four bytes.
#[repr(C)]
struct SlabHeader {
    magic: u32,
    cache_id: u32,
    next: u64,
    prev: u64,
    free_head: u32,
    free_count: u32,
}

/// A named cache of fixed-size objects.
pub struct SlabCache {
    name: &'static str,
    id: u32,
    obj_size: u32,
    stride: u32,
    /// Offset of the first object from the page base.
    obj_base: u32,
    /// Objects per slab page.
    capacity: u32,
    /// Heads of the three state lists (physical page addresses).
    full: u64,
    partial: u64,
    empty: u64,
    /// Live objects, for diagnostics and destroy checks.
    live: u64,
}

impl SlabCache {
    /// Build a cache layout for `obj_size`-byte objects at `align`.
    ///
    /// # Errors
    /// - [`SlabError::BadSize`] if `obj_size` exceeds `PAGE_SIZE / 8`
    ///   (callers that big should go to the PMM directly).
    /// - [`SlabError::Invalid`] for a zero size or a non-power-of-two
    ///   alignment.
    pub fn new(
        name: &'static str,
        id: u32,
        obj_size: u32,
        align: u32,
    ) -> Result<Self, SlabError> {
        if obj_size == 0 || !align.is_power_of_two() || u64::from(align) > PAGE_SIZE / 8 {
            return Err(SlabError::Invalid);
        }
        if u64::from(obj_size) > PAGE_SIZE / 8 {
            return Err(SlabError::BadSize);
        }

        // Objects must hold the freelist index and respect the caller's
        // alignment.
        let align = align.max(4);
        let stride = align_up(u64::from(obj_size), u64::from(align)) as u32;
        let obj_base = align_up(size_of::<SlabHeader>() as u64, u64::from(align)) as u32;
        let capacity = (PAGE_SIZE as u32 - obj_base) / stride;
        debug_assert!(capacity > 0, "size cap guarantees at least one object");

        Ok(Self {
            name,
            id,
            obj_size,
            stride,
            obj_base,
            capacity,
            full: 0,
            partial: 0,
            empty: 0,
            live: 0,
        })
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn object_size(&self) -> u32 {
        self.obj_size
    }

    #[must_use]
    pub const fn objects_per_slab(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub const fn live_objects(&self) -> u64 {
        self.live
    }

    #[allow(clippy::mut_from_ref)]
    fn header<M: PhysMapper>(mapper: &M, page: u64) -> &mut SlabHeader {
        // SAFETY: slab pages are owned by this cache; the mapper covers
        // them writable.
        unsafe { mapper.phys_to_mut::<SlabHeader>(PhysicalAddress::new(page)) }
    }

    #[allow(clippy::mut_from_ref)]
    fn slot<M: PhysMapper>(mapper: &M, obj_pa: u64) -> &mut u32 {
        // SAFETY: free objects belong to the allocator; their first four
        // bytes hold the freelist index.
        unsafe { mapper.phys_to_mut::<u32>(PhysicalAddress::new(obj_pa)) }
    }

    /// Unlink `page` from the list whose head is `*head`.
    fn unlink<M: PhysMapper>(mapper: &M, head: &mut u64, page: u64) {
        let (next, prev) = {
            let h = Self::header(mapper, page);
            (h.next, h.prev)
        };
        if prev == 0 {
            *head = next;
        } else {
            Self::header(mapper, prev).next = next;
        }
        if next != 0 {
            Self::header(mapper, next).prev = prev;
        }
        let h = Self::header(mapper, page);
        h.next = 0;
        h.prev = 0;
    }

    /// Push `page` onto the front of the list whose head is `*head`.
    fn push<M: PhysMapper>(mapper: &M, head: &mut u64, page: u64) {
        let old = *head;
        {
            let h = Self::header(mapper, page);
            h.next = old;
            h.prev = 0;
        }
        if old != 0 {
            Self::header(mapper, old).prev = page;
        }
        *head = page;
    }

    /// Take a fresh page from `frames` and format it as an empty slab.
    fn grow<M: PhysMapper>(
        &mut self,
        mapper: &M,
        frames: &mut impl FrameAlloc,
    ) -> Result<u64, SlabError> {
        let frame = frames.alloc_frame().ok_or(SlabError::NoMemory)?;
        let page = frame.base().as_u64();

        {
            let h = Self::header(mapper, page);
            h.magic = SLAB_MAGIC;
            h.cache_id = self.id;
            h.next = 0;
            h.prev = 0;
            h.free_head = 0;
            h.free_count = self.capacity;
        }
        // Chain every object to its successor.
        for i in 0..self.capacity {
            let obj = page + u64::from(self.obj_base) + u64::from(i) * u64::from(self.stride);
            *Self::slot(mapper, obj) = if i + 1 == self.capacity {
                NO_OBJECT
            } else {
                i + 1
            };
        }
        Ok(page)
    }

    /// Allocate one object.
    ///
    /// Preference order: a Partial slab, then a cached Empty slab, then a
    /// new page from `frames`.
    ///
    /// # Errors
    /// - [`SlabError::NoMemory`] if a new slab page cannot be allocated.
    pub fn alloc<M: PhysMapper>(
        &mut self,
        mapper: &M,
        frames: &mut impl FrameAlloc,
    ) -> Result<PhysicalAddress, SlabError> {
        let page = if self.partial != 0 {
            self.partial
        } else if self.empty != 0 {
            let page = self.empty;
            let mut head = self.empty;
            Self::unlink(mapper, &mut head, page);
            self.empty = head;
            let mut phead = self.partial;
            Self::push(mapper, &mut phead, page);
            self.partial = phead;
            page
        } else {
            let page = self.grow(mapper, frames)?;
            let mut phead = self.partial;
            Self::push(mapper, &mut phead, page);
            self.partial = phead;
            page
        };

        let (idx, now_full) = {
            let h = Self::header(mapper, page);
            if h.magic != SLAB_MAGIC || h.free_head == NO_OBJECT {
                error!("slab '{}': corrupt header on page {page:#x}", self.name);
                return Err(SlabError::Corruption);
            }
            let idx = h.free_head;
            let obj = page + u64::from(self.obj_base) + u64::from(idx) * u64::from(self.stride);
            let next = *Self::slot(mapper, obj);
            h.free_head = next;
            h.free_count -= 1;
            (idx, h.free_count == 0)
        };

        if now_full {
            let mut phead = self.partial;
            Self::unlink(mapper, &mut phead, page);
            self.partial = phead;
            let mut fhead = self.full;
            Self::push(mapper, &mut fhead, page);
            self.full = fhead;
        }

        self.live += 1;
        Ok(PhysicalAddress::new(
            page + u64::from(self.obj_base) + u64::from(idx) * u64::from(self.stride),
        ))
    }

    /// Return an object to its originating slab, found by masking the
    /// address to the page base.
    ///
    /// # Errors
    /// - [`SlabError::Corruption`] if the page header magic is gone.
    /// - [`SlabError::NotFound`] if the page belongs to another cache.
    /// - [`SlabError::Invalid`] if the address is not an object boundary.
    pub fn free<M: PhysMapper>(
        &mut self,
        mapper: &M,
        frames: &mut impl FrameAlloc,
        obj: PhysicalAddress,
    ) -> Result<(), SlabError> {
        let page = obj.as_u64() & !(PAGE_SIZE - 1);
        let off = obj.as_u64() - page;

        if off < u64::from(self.obj_base)
            || (off - u64::from(self.obj_base)) % u64::from(self.stride) != 0
        {
            return Err(SlabError::Invalid);
        }
        #[allow(clippy::cast_possible_truncation)]
        let idx = ((off - u64::from(self.obj_base)) / u64::from(self.stride)) as u32;
        if idx >= self.capacity {
            return Err(SlabError::Invalid);
        }

        let (was_full, now_empty) = {
            let h = Self::header(mapper, page);
            if h.magic != SLAB_MAGIC {
                error!("slab '{}': bad magic freeing {obj}", self.name);
                return Err(SlabError::Corruption);
            }
            if h.cache_id != self.id {
                return Err(SlabError::NotFound);
            }
            let was_full = h.free_count == 0;
            *Self::slot(mapper, obj.as_u64()) = h.free_head;
            h.free_head = idx;
            h.free_count += 1;
            (was_full, h.free_count == self.capacity)
        };

        if was_full {
            let mut fhead = self.full;
            Self::unlink(mapper, &mut fhead, page);
            self.full = fhead;
            let mut phead = self.partial;
            Self::push(mapper, &mut phead, page);
            self.partial = phead;
        }

        if now_empty {
            let mut phead = self.partial;
            Self::unlink(mapper, &mut phead, page);
            self.partial = phead;
            if self.empty == 0 {
                // Keep one empty slab warm for the next burst.
                let mut ehead = self.empty;
                Self::push(mapper, &mut ehead, page);
                self.empty = ehead;
            } else {
                frames.free_frame(PhysicalFrame::containing(PhysicalAddress::new(page)));
            }
        }

        self.live -= 1;
        Ok(())
    }

    /// Release every slab page back to `frames`.
    ///
    /// # Errors
    /// - [`SlabError::Invalid`] while objects are still live; a cache
    ///   cannot be torn down under its users.
    pub fn destroy<M: PhysMapper>(
        &mut self,
        mapper: &M,
        frames: &mut impl FrameAlloc,
    ) -> Result<(), SlabError> {
        if self.live != 0 {
            return Err(SlabError::Invalid);
        }
        debug_assert_eq!(self.full, 0);
        debug_assert_eq!(self.partial, 0);
        let mut page = self.empty;
        while page != 0 {
            let next = Self::header(mapper, page).next;
            frames.free_frame(PhysicalFrame::containing(PhysicalAddress::new(page)));
            page = next;
        }
        self.empty = 0;
        Ok(())
    }
}
