//! The allocator implementation.

use crate::{HEAP_MIN_ALIGN, HEAP_MIN_SIZE, HeapBacking, HeapError};
use core::ptr::{self, null_mut};
use log::error;

const HEADER_MAGIC: u64 = 0x4845_4150_4845_4144; // "HEAPHEAD"
const FOOTER_MAGIC: u64 = 0x4845_4150_464F_4F54; // "HEAPFOOT"
const REGION_MAGIC: u64 = 0x4845_4150_5245_4749; // "HEAPREGI"

/// Bytes of guard pattern on each side of the payload.
const REDZONE: u64 = 16;
const REDZONE_BYTE: u8 = 0x5A;

/// Header at the start of every block.
///
/// `prev_free`/`next_free` are meaningful only while the block is free;
/// an allocated block's list links are dead weight kept for layout
/// stability.
#[repr(C)]
struct BlockHeader {
    magic: u64,
    /// Total block size, header through footer.
    size: u64,
    allocated: u64,
    prev_free: *mut BlockHeader,
    next_free: *mut BlockHeader,
}

/// Footer at the end of every block, mirroring the size so the previous
/// neighbor can be found from a header.
#[repr(C)]
struct BlockFooter {
    size: u64,
    magic: u64,
}

/// Header of one region obtained from the backing.
#[repr(C)]
struct RegionHeader {
    magic: u64,
    /// Region length including this header.
    size: u64,
    next: *mut RegionHeader,
    _pad: u64,
}

/// Offset of the payload from the block start: aligned header + redzone.
const PAYLOAD_OFFSET: u64 = align16(size_of::<BlockHeader>() as u64) + REDZONE;
/// Fixed per-block overhead around the payload.
const OVERHEAD: u64 = PAYLOAD_OFFSET + REDZONE + align16(size_of::<BlockFooter>() as u64);
/// Blocks smaller than this are not worth splitting off.
const MIN_SPLIT: u64 = OVERHEAD + HEAP_MIN_ALIGN;
const REGION_HEADER_SIZE: u64 = align16(size_of::<RegionHeader>() as u64);

const fn align16(x: u64) -> u64 {
    (x + 15) & !15
}

const _: () = {
    assert!(PAYLOAD_OFFSET % HEAP_MIN_ALIGN == 0);
    assert!(OVERHEAD % HEAP_MIN_ALIGN == 0);
    assert!(REGION_HEADER_SIZE % HEAP_MIN_ALIGN == 0);
};

/// Statistics counters, read-only to callers.
#[derive(Debug, Clone, Default)]
pub struct HeapStats {
    pub allocations: u64,
    pub frees: u64,
    pub grows: u64,
    pub coalesces: u64,
    pub corruption_events: u64,
}

/// One heap instance.
///
/// The kernel heap is a process-wide singleton behind a spinlock;
/// user-space heaps are further instances layered on their own VMM.
pub struct Heap {
    /// Free list, ascending by block size.
    free_head: *mut BlockHeader,
    /// All regions ever obtained from the backing.
    regions: *mut RegionHeader,
    stats: HeapStats,
}

// Safety: all pointers reference backing memory owned by this heap; the
// owner serializes access (spinlock in the kernel).
unsafe impl Send for Heap {}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    /// An empty heap; the first allocation grows it.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            free_head: null_mut(),
            regions: null_mut(),
            stats: HeapStats {
                allocations: 0,
                frees: 0,
                grows: 0,
                coalesces: 0,
                corruption_events: 0,
            },
        }
    }

    #[must_use]
    pub const fn stats(&self) -> &HeapStats {
        &self.stats
    }

    /// Number of blocks currently on the free list.
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        let mut n = 0;
        let mut cur = self.free_head;
        while !cur.is_null() {
            n += 1;
            cur = unsafe { (*cur).next_free };
        }
        n
    }

    /// Allocate `size` payload bytes, aligned to [`HEAP_MIN_ALIGN`].
    ///
    /// # Errors
    /// - [`HeapError::Invalid`] for a zero size.
    /// - [`HeapError::VmmFail`] / [`HeapError::Oom`] when the backing
    ///   cannot satisfy a growth request.
    pub fn malloc(
        &mut self,
        backing: &mut impl HeapBacking,
        size: u64,
    ) -> Result<*mut u8, HeapError> {
        if size == 0 {
            return Err(HeapError::Invalid);
        }
        let payload = align16(size);
        let total = payload + OVERHEAD;

        let block = match self.take_best_fit(total) {
            Some(b) => b,
            None => {
                self.grow(backing, total)?;
                self.take_best_fit(total).ok_or(HeapError::Oom)?
            }
        };

        unsafe {
            self.split(block, total);
            (*block).allocated = 1;
            self.paint_redzones(block);
        }
        self.stats.allocations += 1;
        Ok(unsafe { payload_of(block) })
    }

    /// [`malloc`](Self::malloc) for kernel-critical paths: panics instead
    /// of failing when the heap cannot grow.
    ///
    /// # Panics
    /// On allocation failure.
    pub fn malloc_urgent(&mut self, backing: &mut impl HeapBacking, size: u64) -> *mut u8 {
        match self.malloc(backing, size) {
            Ok(p) => p,
            Err(e) => panic!("urgent heap allocation of {size} bytes failed: {e}"),
        }
    }

    /// Allocate a zeroed array of `n` elements of `size` bytes.
    ///
    /// # Errors
    /// - [`HeapError::Invalid`] on multiplication overflow or zero size.
    /// - Everything [`malloc`](Self::malloc) returns.
    pub fn calloc(
        &mut self,
        backing: &mut impl HeapBacking,
        n: u64,
        size: u64,
    ) -> Result<*mut u8, HeapError> {
        let bytes = n.checked_mul(size).ok_or(HeapError::Invalid)?;
        let p = self.malloc(backing, bytes)?;
        unsafe { ptr::write_bytes(p, 0, bytes as usize) };
        Ok(p)
    }

    /// Free a pointer returned by one of the allocation calls.
    ///
    /// The block is coalesced with free neighbors on both sides before it
    /// returns to the free list.
    ///
    /// # Errors
    /// - [`HeapError::NotFound`] if `ptr` is not inside any region.
    /// - [`HeapError::Corrupted`] on magic/redzone damage (counted).
    /// - [`HeapError::DoubleFree`] if the block is already free.
    pub fn free(&mut self, ptr: *mut u8) -> Result<(), HeapError> {
        if ptr.is_null() {
            return Err(HeapError::Invalid);
        }
        let region = self.region_containing(ptr).ok_or(HeapError::NotFound)?;
        let block = unsafe { header_of(ptr) };

        unsafe {
            if (*block).magic != HEADER_MAGIC || !self.footer_ok(block) {
                error!("heap: corrupt block header freeing {ptr:p}");
                self.stats.corruption_events += 1;
                return Err(HeapError::Corrupted);
            }
            if (*block).allocated == 0 {
                return Err(HeapError::DoubleFree);
            }
            if !redzones_ok(block) {
                error!("heap: redzone overwritten in block {block:p}");
                self.stats.corruption_events += 1;
                return Err(HeapError::Corrupted);
            }

            (*block).allocated = 0;
            let merged = self.coalesce(region, block);
            self.insert_free(merged);
        }
        self.stats.frees += 1;
        Ok(())
    }

    /// POSIX-style resize: `realloc(null, n)` allocates, `realloc(p, 0)`
    /// frees and returns null, anything else moves the payload.
    ///
    /// # Errors
    /// See [`malloc`](Self::malloc) and [`free`](Self::free).
    pub fn realloc(
        &mut self,
        backing: &mut impl HeapBacking,
        ptr: *mut u8,
        size: u64,
    ) -> Result<*mut u8, HeapError> {
        if ptr.is_null() {
            return self.malloc(backing, size);
        }
        if size == 0 {
            self.free(ptr)?;
            return Ok(null_mut());
        }

        let block = unsafe { header_of(ptr) };
        unsafe {
            if (*block).magic != HEADER_MAGIC || (*block).allocated == 0 {
                return Err(HeapError::Corrupted);
            }
        }
        let old_payload = unsafe { (*block).size - OVERHEAD };
        let new_ptr = self.malloc(backing, size)?;
        unsafe {
            ptr::copy_nonoverlapping(ptr, new_ptr, old_payload.min(size) as usize);
        }
        self.free(ptr)?;
        Ok(new_ptr)
    }

    /// Walk every region block-by-block and the free list end-to-end,
    /// verifying magics, sizes, boundary tags, redzones of allocated
    /// blocks and list linkage.
    ///
    /// # Errors
    /// - [`HeapError::Corrupted`] on the first inconsistency (counted).
    pub fn check_integrity(&mut self) -> Result<(), HeapError> {
        unsafe {
            // Pass 1: address-ordered walk of every region.
            let mut region = self.regions;
            while !region.is_null() {
                if (*region).magic != REGION_MAGIC {
                    return self.corrupt("region header magic");
                }
                let end = (region as u64) + (*region).size;
                let mut block = (region as u64 + REGION_HEADER_SIZE) as *mut BlockHeader;
                while (block as u64) < end {
                    if (*block).magic != HEADER_MAGIC {
                        return self.corrupt("block header magic");
                    }
                    let size = (*block).size;
                    if size < OVERHEAD || block as u64 + size > end {
                        return self.corrupt("block size out of bounds");
                    }
                    if !self.footer_ok(block) {
                        return self.corrupt("footer mismatch");
                    }
                    if (*block).allocated == 1 && !redzones_ok(block) {
                        return self.corrupt("redzone damaged");
                    }
                    block = (block as u64 + size) as *mut BlockHeader;
                }
                if block as u64 != end {
                    return self.corrupt("region does not tile exactly");
                }
                region = (*region).next;
            }

            // Pass 2: the free list is sorted by size with sane links.
            let mut prev: *mut BlockHeader = null_mut();
            let mut cur = self.free_head;
            while !cur.is_null() {
                if (*cur).magic != HEADER_MAGIC || (*cur).allocated != 0 {
                    return self.corrupt("free list node state");
                }
                if (*cur).prev_free != prev {
                    return self.corrupt("free list back link");
                }
                if !prev.is_null() && (*prev).size > (*cur).size {
                    return self.corrupt("free list size order");
                }
                if self.region_containing(cur.cast::<u8>()).is_none() {
                    return self.corrupt("free node outside all regions");
                }
                prev = cur;
                cur = (*cur).next_free;
            }
        }
        Ok(())
    }

    /// Release every region back to the backing, consuming the heap.
    pub fn destroy(mut self, backing: &mut impl HeapBacking) {
        let mut region = self.regions;
        while !region.is_null() {
            let next = unsafe { (*region).next };
            let len = unsafe { (*region).size };
            unsafe { backing.release(region.cast::<u8>(), len) };
            region = next;
        }
        self.regions = null_mut();
        self.free_head = null_mut();
    }

    // ----- internals -------------------------------------------------

    fn corrupt(&mut self, what: &str) -> Result<(), HeapError> {
        error!("heap: integrity check failed: {what}");
        self.stats.corruption_events += 1;
        Err(HeapError::Corrupted)
    }

    /// Ask the backing for more memory and add it as one free block.
    fn grow(&mut self, backing: &mut impl HeapBacking, need: u64) -> Result<(), HeapError> {
        let want = (need + REGION_HEADER_SIZE).max(HEAP_MIN_SIZE);
        let (base, len) = backing.grow(want)?;
        if base.is_null() || len < want {
            return Err(HeapError::VmmFail);
        }
        // Regions must be 16-aligned; the VMM hands out pages.
        debug_assert_eq!(base as u64 % HEAP_MIN_ALIGN, 0);

        let region = base.cast::<RegionHeader>();
        unsafe {
            (*region).magic = REGION_MAGIC;
            (*region).size = len;
            (*region).next = self.regions;
            (*region)._pad = 0;
            self.regions = region;

            let block = base.add(REGION_HEADER_SIZE as usize).cast::<BlockHeader>();
            init_block(block, len - REGION_HEADER_SIZE);
            self.insert_free(block);
        }
        self.stats.grows += 1;
        Ok(())
    }

    /// Best fit: smallest free block whose size covers `total`. The list
    /// is size-ordered, so the first fit is the best one. The block is
    /// unlinked before being returned.
    fn take_best_fit(&mut self, total: u64) -> Option<*mut BlockHeader> {
        let mut cur = self.free_head;
        unsafe {
            while !cur.is_null() {
                if (*cur).magic != HEADER_MAGIC {
                    error!("heap: corrupt free block {cur:p}, dropping list tail");
                    self.stats.corruption_events += 1;
                    return None;
                }
                if (*cur).size >= total {
                    self.unlink_free(cur);
                    return Some(cur);
                }
                cur = (*cur).next_free;
            }
        }
        None
    }

    /// Cut `block` down to `total` bytes if the remainder is worth
    /// keeping; the tail goes back on the free list.
    unsafe fn split(&mut self, block: *mut BlockHeader, total: u64) {
        unsafe {
            let remainder = (*block).size - total;
            if remainder < MIN_SPLIT {
                // Keep the whole block; the footer already matches.
                return;
            }
            init_block(block.cast::<u8>().add(total as usize).cast(), remainder);
            self.insert_free(block.cast::<u8>().add(total as usize).cast());
            (*block).size = total;
            write_footer(block);
        }
    }

    /// Merge `block` with free neighbors on both sides. Returns the
    /// merged block (not yet on the free list).
    unsafe fn coalesce(
        &mut self,
        region: *mut RegionHeader,
        mut block: *mut BlockHeader,
    ) -> *mut BlockHeader {
        let region_first = region as u64 + REGION_HEADER_SIZE;
        let region_end = region as u64 + unsafe { (*region).size };

        unsafe {
            // Preceding neighbor, found through its footer, which ends
            // exactly where this block starts.
            if block as u64 > region_first {
                let prev_footer = block
                    .cast::<u8>()
                    .sub(align16(size_of::<BlockFooter>() as u64) as usize)
                    .cast::<BlockFooter>();
                if (*prev_footer).magic == FOOTER_MAGIC {
                    let prev = (block as u64 - (*prev_footer).size) as *mut BlockHeader;
                    if prev as u64 >= region_first
                        && (*prev).magic == HEADER_MAGIC
                        && (*prev).allocated == 0
                    {
                        self.unlink_free(prev);
                        (*prev).size += (*block).size;
                        write_footer(prev);
                        block = prev;
                        self.stats.coalesces += 1;
                    }
                }
            }

            // Following neighbor.
            let next = (block as u64 + (*block).size) as *mut BlockHeader;
            if (next as u64) < region_end
                && (*next).magic == HEADER_MAGIC
                && (*next).allocated == 0
            {
                self.unlink_free(next);
                (*block).size += (*next).size;
                write_footer(block);
                self.stats.coalesces += 1;
            }
        }
        block
    }

    /// Insert into the size-ordered free list.
    unsafe fn insert_free(&mut self, block: *mut BlockHeader) {
        unsafe {
            (*block).allocated = 0;
            let size = (*block).size;
            let mut prev: *mut BlockHeader = null_mut();
            let mut cur = self.free_head;
            while !cur.is_null() && (*cur).size < size {
                prev = cur;
                cur = (*cur).next_free;
            }
            (*block).prev_free = prev;
            (*block).next_free = cur;
            if prev.is_null() {
                self.free_head = block;
            } else {
                (*prev).next_free = block;
            }
            if !cur.is_null() {
                (*cur).prev_free = block;
            }
        }
    }

    unsafe fn unlink_free(&mut self, block: *mut BlockHeader) {
        unsafe {
            let prev = (*block).prev_free;
            let next = (*block).next_free;
            if prev.is_null() {
                self.free_head = next;
            } else {
                (*prev).next_free = next;
            }
            if !next.is_null() {
                (*next).prev_free = prev;
            }
            (*block).prev_free = null_mut();
            (*block).next_free = null_mut();
        }
    }

    unsafe fn paint_redzones(&self, block: *mut BlockHeader) {
        unsafe {
            let front = block.cast::<u8>().add((PAYLOAD_OFFSET - REDZONE) as usize);
            ptr::write_bytes(front, REDZONE_BYTE, REDZONE as usize);
            let payload_len = (*block).size - OVERHEAD;
            let back = block
                .cast::<u8>()
                .add((PAYLOAD_OFFSET + payload_len) as usize);
            ptr::write_bytes(back, REDZONE_BYTE, REDZONE as usize);
        }
    }

    fn footer_ok(&self, block: *mut BlockHeader) -> bool {
        unsafe {
            let f = footer_of(block);
            (*f).magic == FOOTER_MAGIC && (*f).size == (*block).size
        }
    }

    fn region_containing(&self, ptr: *mut u8) -> Option<*mut RegionHeader> {
        let mut region = self.regions;
        while !region.is_null() {
            let start = region as u64;
            let end = start + unsafe { (*region).size };
            let p = ptr as u64;
            if p > start && p < end {
                return Some(region);
            }
            region = unsafe { (*region).next };
        }
        None
    }
}

/// Format a fresh free block of `size` bytes at `block`.
unsafe fn init_block(block: *mut BlockHeader, size: u64) {
    unsafe {
        (*block).magic = HEADER_MAGIC;
        (*block).size = size;
        (*block).allocated = 0;
        (*block).prev_free = null_mut();
        (*block).next_free = null_mut();
        write_footer(block);
    }
}

unsafe fn write_footer(block: *mut BlockHeader) {
    unsafe {
        let f = footer_of(block);
        (*f).size = (*block).size;
        (*f).magic = FOOTER_MAGIC;
    }
}

unsafe fn footer_of(block: *mut BlockHeader) -> *mut BlockFooter {
    unsafe {
        let end = block.cast::<u8>().add((*block).size as usize);
        end.sub(align16(size_of::<BlockFooter>() as u64) as usize)
            .cast::<BlockFooter>()
    }
}

unsafe fn payload_of(block: *mut BlockHeader) -> *mut u8 {
    unsafe { block.cast::<u8>().add(PAYLOAD_OFFSET as usize) }
}

unsafe fn header_of(ptr: *mut u8) -> *mut BlockHeader {
    unsafe { ptr.sub(PAYLOAD_OFFSET as usize).cast::<BlockHeader>() }
}

unsafe fn redzones_ok(block: *mut BlockHeader) -> bool {
    unsafe {
        let front = block.cast::<u8>().add((PAYLOAD_OFFSET - REDZONE) as usize);
        let payload_len = (*block).size - OVERHEAD;
        let back = block
            .cast::<u8>()
            .add((PAYLOAD_OFFSET + payload_len) as usize);
        for i in 0..REDZONE as usize {
            if *front.add(i) != REDZONE_BYTE || *back.add(i) != REDZONE_BYTE {
                return false;
            }
        }
        true
    }
}
