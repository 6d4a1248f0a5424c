//! The buddy allocator proper.

use crate::PmmError;
use kernel_info::memory::PAGE_SIZE;
use kernel_vmem::{FrameAlloc, PhysMapper, PhysicalAddress, PhysicalFrame};
use log::{error, warn};

/// Magic constant stamped into every free-block header.
pub const FREE_MAGIC: u32 = 0xF4EE_B10C;

/// Upper bound on the number of buddy orders. With a 4 KiB minimum block
/// this covers 2^39 × 4 KiB, far beyond any physical range we manage.
pub const MAX_ORDERS: usize = 40;

/// Header written into the first bytes of every **free** block.
///
/// `next` is the physical address of the next free block of the same
/// order, `0` terminating the list. Magic and order exist so pops and
/// coalesces can detect stray writes into free memory.
#[repr(C)]
struct FreeBlock {
    next: u64,
    magic: u32,
    order: u32,
}

const _: () = assert!(size_of::<FreeBlock>() == 16);

/// Read-only statistics counters.
#[derive(Debug, Clone)]
pub struct PmmStats {
    pub allocations: u64,
    pub frees: u64,
    pub coalesces: u64,
    pub corruption_events: u64,
    /// Free blocks currently on each order's list.
    pub free_blocks: [u64; MAX_ORDERS],
}

impl PmmStats {
    const fn new() -> Self {
        Self {
            allocations: 0,
            frees: 0,
            coalesces: 0,
            corruption_events: 0,
            free_blocks: [0; MAX_ORDERS],
        }
    }
}

/// Buddy allocator over one contiguous physical range.
///
/// Construct with [`BuddyPmm::new`] (a const fn, so the kernel instance
/// can live in a static behind a spinlock), then call
/// [`init`](BuddyPmm::init) exactly once.
pub struct BuddyPmm<M: PhysMapper> {
    mapper: M,
    base: u64,
    end: u64,
    min_block: u64,
    order_count: usize,
    /// Physical address of the first free block per order; 0 = empty.
    heads: [u64; MAX_ORDERS],
    stats: PmmStats,
    initialized: bool,
}

impl<M: PhysMapper> BuddyPmm<M> {
    /// An uninitialized allocator. Every operation except
    /// [`init`](Self::init) fails with [`PmmError::NotInit`].
    pub const fn new(mapper: M) -> Self {
        Self {
            mapper,
            base: 0,
            end: 0,
            min_block: 0,
            order_count: 0,
            heads: [0; MAX_ORDERS],
            stats: PmmStats::new(),
            initialized: false,
        }
    }

    /// Take ownership of `[range_start, range_end)`, rounded inward to
    /// multiples of `min_block`, and seed the free lists with the largest
    /// naturally-aligned blocks that tile it.
    ///
    /// # Errors
    /// - [`PmmError::AlreadyInit`] on a second call.
    /// - [`PmmError::Invalid`] if `min_block` is not a power of two, is
    ///   smaller than the free-block header, or the rounded range is
    ///   empty.
    pub fn init(
        &mut self,
        range_start: u64,
        range_end: u64,
        min_block: u64,
    ) -> Result<(), PmmError> {
        if self.initialized {
            return Err(PmmError::AlreadyInit);
        }
        if !min_block.is_power_of_two() || min_block < size_of::<FreeBlock>() as u64 {
            return Err(PmmError::Invalid);
        }
        let base = range_start.next_multiple_of(min_block);
        let end = range_end & !(min_block - 1);
        if base >= end {
            return Err(PmmError::Invalid);
        }

        self.base = base;
        self.end = end;
        self.min_block = min_block;
        let span_blocks = (end - base) / min_block;
        self.order_count = ((u64::BITS - span_blocks.leading_zeros()) as usize).min(MAX_ORDERS);
        self.initialized = true;

        self.insert_range(base, end);
        Ok(())
    }

    /// First byte of the managed range.
    #[must_use]
    pub const fn managed_base(&self) -> u64 {
        self.base
    }

    /// One past the last managed byte.
    #[must_use]
    pub const fn managed_end(&self) -> u64 {
        self.end
    }

    /// Smallest allocation unit.
    #[must_use]
    pub const fn min_block(&self) -> u64 {
        self.min_block
    }

    /// The statistics counters.
    #[must_use]
    pub const fn stats(&self) -> &PmmStats {
        &self.stats
    }

    const fn block_size(&self, order: usize) -> u64 {
        self.min_block << order
    }

    /// Smallest order whose block size covers `bytes`.
    fn order_for(&self, bytes: u64) -> usize {
        let blocks = bytes.div_ceil(self.min_block);
        (u64::BITS - (blocks - 1).leading_zeros()) as usize
    }

    /// Allocate `bytes` (rounded up to `min_block`) of physically
    /// contiguous memory.
    ///
    /// # Errors
    /// - [`PmmError::NotInit`] before `init`.
    /// - [`PmmError::Invalid`] for a zero-sized request.
    /// - [`PmmError::Oom`] if no order at or above the request has a free
    ///   block.
    pub fn alloc(&mut self, bytes: u64) -> Result<PhysicalAddress, PmmError> {
        if !self.initialized {
            return Err(PmmError::NotInit);
        }
        if bytes == 0 || bytes > self.end - self.base {
            return Err(PmmError::Invalid);
        }

        let want = self.order_for(bytes);
        if want >= self.order_count {
            return Err(PmmError::Oom);
        }

        // Smallest non-empty order at or above the request.
        let from = (want..self.order_count)
            .find(|&o| self.heads[o] != 0)
            .ok_or(PmmError::Oom)?;

        let addr = self.pop(from).ok_or(PmmError::Oom)?;

        // Split down, pushing each upper half onto the next-lower list.
        let mut order = from;
        while order > want {
            order -= 1;
            self.push(order, addr + self.block_size(order));
        }

        self.stats.allocations += 1;
        Ok(PhysicalAddress::new(addr))
    }

    /// Return the block at `pa` spanning `bytes` (rounded exactly as the
    /// matching [`alloc`](Self::alloc) rounded), coalescing with free
    /// buddies as far as possible.
    ///
    /// # Errors
    /// - [`PmmError::NotInit`], [`PmmError::Invalid`] as for `alloc`.
    /// - [`PmmError::OutOfRange`] if the block lies outside the managed
    ///   range.
    /// - [`PmmError::NotAligned`] if `pa` is not aligned to the order of
    ///   the rounded size.
    pub fn free(&mut self, pa: PhysicalAddress, bytes: u64) -> Result<(), PmmError> {
        if !self.initialized {
            return Err(PmmError::NotInit);
        }
        if bytes == 0 {
            return Err(PmmError::Invalid);
        }
        let mut addr = pa.as_u64();
        let mut order = self.order_for(bytes);
        if order >= self.order_count {
            return Err(PmmError::Invalid);
        }
        if addr < self.base || addr + self.block_size(order) > self.end {
            return Err(PmmError::OutOfRange);
        }
        if (addr - self.base) % self.block_size(order) != 0 {
            return Err(PmmError::NotAligned);
        }

        // Coalesce upward while the buddy is free at the same order and
        // inside the managed range.
        while order + 1 < self.order_count {
            let size = self.block_size(order);
            let buddy = ((addr - self.base) ^ size) + self.base;
            if buddy + size > self.end {
                break;
            }
            if !self.remove(order, buddy) {
                break;
            }
            addr = addr.min(buddy);
            order += 1;
            self.stats.coalesces += 1;
        }

        self.push(order, addr);
        self.stats.frees += 1;
        Ok(())
    }

    /// Give a range back to the allocator, e.g. memory that was reserved
    /// during bring-up. Rounded inward to `min_block`.
    ///
    /// # Errors
    /// - [`PmmError::NotInit`] / [`PmmError::OutOfRange`].
    pub fn mark_free(&mut self, start: u64, end: u64) -> Result<(), PmmError> {
        if !self.initialized {
            return Err(PmmError::NotInit);
        }
        let start = start.next_multiple_of(self.min_block);
        let end = end & !(self.min_block - 1);
        if start >= end {
            return Ok(());
        }
        if start < self.base || end > self.end {
            return Err(PmmError::OutOfRange);
        }
        self.insert_range(start, end);
        Ok(())
    }

    /// Carve `[start, end)` out of the free lists. Free blocks straddling
    /// the boundary are split: their non-overlapping prefix and suffix
    /// are re-inserted.
    ///
    /// # Errors
    /// - [`PmmError::NotInit`].
    pub fn mark_reserved(&mut self, start: u64, end: u64) -> Result<(), PmmError> {
        if !self.initialized {
            return Err(PmmError::NotInit);
        }
        let res_start = start & !(self.min_block - 1);
        let res_end = end.next_multiple_of(self.min_block);

        for order in 0..self.order_count {
            let size = self.block_size(order);
            // Collect overlapping blocks first; list surgery while
            // walking would skip entries.
            let mut cursor = self.heads[order];
            let mut overlapping: [u64; 64] = [0; 64];
            let mut count;
            loop {
                count = 0;
                while cursor != 0 {
                    let header = self.header(cursor);
                    let next = header.next;
                    if cursor < res_end && cursor + size > res_start {
                        if count == overlapping.len() {
                            break;
                        }
                        overlapping[count] = cursor;
                        count += 1;
                    }
                    cursor = next;
                }
                for &blk in &overlapping[..count] {
                    if self.remove(order, blk) {
                        if blk < res_start {
                            self.insert_range(blk, res_start);
                        }
                        if blk + size > res_end {
                            self.insert_range(res_end, blk + size);
                        }
                    }
                }
                if count < overlapping.len() {
                    break;
                }
                // Batch was full; rescan from the head.
                cursor = self.heads[order];
            }
        }
        Ok(())
    }

    /// Walk every free list, validating magic, order and alignment of
    /// each block. Mismatches are counted in
    /// [`PmmStats::corruption_events`].
    ///
    /// # Errors
    /// - [`PmmError::NotInit`].
    /// - [`PmmError::Invalid`] if any corruption was found.
    pub fn verify_integrity(&mut self) -> Result<(), PmmError> {
        if !self.initialized {
            return Err(PmmError::NotInit);
        }
        let mut bad = 0u64;
        for order in 0..self.order_count {
            let size = self.block_size(order);
            let mut cursor = self.heads[order];
            let mut seen = 0u64;
            while cursor != 0 {
                let header = self.header(cursor);
                #[allow(clippy::cast_possible_truncation)]
                let ok = header.magic == FREE_MAGIC
                    && header.order == order as u32
                    && cursor >= self.base
                    && cursor + size <= self.end
                    && (cursor - self.base) % size == 0;
                if !ok {
                    error!(
                        "pmm: corrupt free block {cursor:#x} on order {order} \
                         (magic {:#x}, tagged order {})",
                        header.magic, header.order
                    );
                    bad += 1;
                    break;
                }
                seen += 1;
                if seen > self.stats.free_blocks[order] {
                    error!("pmm: free list cycle on order {order}");
                    bad += 1;
                    break;
                }
                cursor = header.next;
            }
        }
        self.stats.corruption_events += bad;
        if bad == 0 { Ok(()) } else { Err(PmmError::Invalid) }
    }

    /// Total bytes currently on the free lists.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        (0..self.order_count)
            .map(|o| self.stats.free_blocks[o] * self.block_size(o))
            .sum()
    }

    /// Decompose `[start, end)` greedily into the largest naturally
    /// aligned power-of-two blocks that fit, pushing each onto its
    /// order's list.
    fn insert_range(&mut self, mut start: u64, end: u64) {
        while start < end {
            let mut order = self.order_count - 1;
            loop {
                let size = self.block_size(order);
                if (start - self.base) % size == 0 && start + size <= end {
                    break;
                }
                order -= 1;
            }
            self.push(order, start);
            start += self.block_size(order);
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn header(&self, pa: u64) -> &mut FreeBlock {
        // SAFETY: `pa` lies in the managed range which the PHYSMAP (or
        // the test arena) covers writable; free blocks are exclusively
        // owned by the allocator while on a list.
        unsafe { self.mapper.phys_to_mut::<FreeBlock>(PhysicalAddress::new(pa)) }
    }

    /// Push a block onto the head of its order's list (LIFO).
    #[allow(clippy::cast_possible_truncation)]
    fn push(&mut self, order: usize, pa: u64) {
        let head = self.heads[order];
        let block = self.header(pa);
        block.next = head;
        block.magic = FREE_MAGIC;
        block.order = order as u32;
        self.heads[order] = pa;
        self.stats.free_blocks[order] += 1;
    }

    /// Pop the head block of `order`, validating its header.
    fn pop(&mut self, order: usize) -> Option<u64> {
        let pa = self.heads[order];
        if pa == 0 {
            return None;
        }
        let (next, magic, tagged) = {
            let block = self.header(pa);
            (block.next, block.magic, block.order)
        };
        self.check_header(order, pa, magic, tagged);
        self.heads[order] = next;
        self.stats.free_blocks[order] -= 1;
        Some(pa)
    }

    /// Unlink the block at `target` from `order`'s list if present.
    fn remove(&mut self, order: usize, target: u64) -> bool {
        let mut cursor = self.heads[order];
        let mut prev: u64 = 0;
        while cursor != 0 {
            let (next, magic, tagged) = {
                let h = self.header(cursor);
                (h.next, h.magic, h.order)
            };
            if cursor == target {
                self.check_header(order, cursor, magic, tagged);
                if prev == 0 {
                    self.heads[order] = next;
                } else {
                    self.header(prev).next = next;
                }
                self.stats.free_blocks[order] -= 1;
                return true;
            }
            prev = cursor;
            cursor = next;
        }
        false
    }

    #[allow(clippy::cast_possible_truncation)]
    fn check_header(&mut self, order: usize, pa: u64, magic: u32, tagged: u32) {
        if magic != FREE_MAGIC || tagged != order as u32 {
            warn!(
                "pmm: header mismatch at {pa:#x}: magic {magic:#x}, \
                 tagged order {tagged}, expected order {order}"
            );
            self.stats.corruption_events += 1;
        }
    }
}

/// Page-frame view of the buddy allocator, used by the paging layer and
/// the slab allocator.
impl<M: PhysMapper> FrameAlloc for BuddyPmm<M> {
    fn alloc_frame(&mut self) -> Option<PhysicalFrame> {
        self.alloc(PAGE_SIZE)
            .ok()
            .map(PhysicalFrame::from_base)
    }

    fn free_frame(&mut self, frame: PhysicalFrame) {
        if let Err(e) = self.free(frame.base(), PAGE_SIZE) {
            error!("pmm: dropping bad frame free {:?}: {e}", frame);
        }
    }
}
