//! Property and scenario tests for the buddy allocator, run against an
//! in-memory arena standing in for physical RAM.

use kernel_pmm::{BuddyPmm, PmmError};
use kernel_vmem::{FrameAlloc, PhysMapper, PhysicalAddress, VirtualAddress};

/// Fake physical RAM: `pa` maps to `buf[pa - base]`. Backed by `u64`s so
/// the free-block headers are naturally aligned.
struct ArenaRam {
    words: Vec<u64>,
    base: u64,
}

impl ArenaRam {
    fn new(base: u64, len: u64) -> Self {
        assert_eq!(base % 8, 0);
        Self {
            words: vec![0u64; (len / 8) as usize],
            base,
        }
    }
}

impl PhysMapper for ArenaRam {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let off = (pa.as_u64() - self.base) as usize;
        assert!(off + size_of::<T>() <= self.words.len() * 8, "oob {pa}");
        let base = self.words.as_ptr() as *mut u8;
        unsafe { &mut *base.add(off).cast::<T>() }
    }

    fn invalidate(&self, _va: VirtualAddress) {}
}

fn pmm_over(base: u64, end: u64, min_block: u64) -> BuddyPmm<ArenaRam> {
    let mut pmm = BuddyPmm::new(ArenaRam::new(base, end - base));
    pmm.init(base, end, min_block).expect("init");
    pmm
}

#[test]
fn operations_before_init_fail() {
    let mut pmm = BuddyPmm::new(ArenaRam::new(0, 0x1000));
    assert_eq!(pmm.alloc(0x1000).unwrap_err(), PmmError::NotInit);
    assert_eq!(
        pmm.free(PhysicalAddress::new(0), 0x1000).unwrap_err(),
        PmmError::NotInit
    );
    assert_eq!(pmm.verify_integrity().unwrap_err(), PmmError::NotInit);
}

#[test]
fn double_init_is_rejected() {
    let mut pmm = pmm_over(0x10_0000, 0x20_0000, 0x1000);
    assert_eq!(
        pmm.init(0x10_0000, 0x20_0000, 0x1000).unwrap_err(),
        PmmError::AlreadyInit
    );
}

#[test]
fn bad_min_block_is_rejected() {
    let mut pmm = BuddyPmm::new(ArenaRam::new(0x10_0000, 0x10_0000));
    assert_eq!(
        pmm.init(0x10_0000, 0x20_0000, 24).unwrap_err(),
        PmmError::Invalid
    );
    assert_eq!(
        pmm.init(0x10_0000, 0x20_0000, 8).unwrap_err(),
        PmmError::Invalid,
        "smaller than the in-block header"
    );
}

/// The canonical split/coalesce walk over a 1 MiB range.
#[test]
fn split_and_coalesce_walk() {
    let mut pmm = pmm_over(0x10_0000, 0x20_0000, 0x1000);

    // First allocation carves the single top block down to order 0 and
    // returns the bottom of the range.
    let a = pmm.alloc(0x1000).unwrap();
    assert_eq!(a.as_u64(), 0x10_0000);

    // The next aligned order-1 block sits right above the two split
    // remnants at 0x101000.
    let b = pmm.alloc(0x2000).unwrap();
    assert_eq!(b.as_u64(), 0x10_2000);

    // Free in reverse: first the pair, then the single page. Everything
    // coalesces back into one block covering the whole range.
    pmm.free(b, 0x2000).unwrap();
    pmm.free(a, 0x1000).unwrap();
    pmm.verify_integrity().unwrap();

    let top_order = 8; // 256 pages
    assert_eq!(pmm.stats().free_blocks[top_order], 1);
    for (order, &count) in pmm.stats().free_blocks.iter().enumerate() {
        if order != top_order {
            assert_eq!(count, 0, "unexpected block at order {order}");
        }
    }
    // And the whole span can be allocated as a single block from the base.
    let whole = pmm.alloc(0x10_0000).unwrap();
    assert_eq!(whole.as_u64(), 0x10_0000);
}

#[test]
fn allocations_are_aligned_in_range_and_disjoint() {
    let mut pmm = pmm_over(0x10_0000, 0x50_0000, 0x1000);
    let sizes = [0x1000u64, 0x3000, 0x1000, 0x8000, 0x2000, 0x5000, 0x1000];
    let mut live: Vec<(u64, u64)> = Vec::new();

    for &s in &sizes {
        let a = pmm.alloc(s).unwrap().as_u64();
        let rounded = s.next_multiple_of(0x1000).next_power_of_two();
        assert_eq!((a - 0x10_0000) % rounded, 0, "alignment of {s:#x}");
        assert!(a >= 0x10_0000 && a + s <= 0x50_0000, "range of {s:#x}");
        for &(oa, os) in &live {
            assert!(a + rounded <= oa || oa + os <= a, "overlap");
        }
        live.push((a, rounded));
    }

    for &(a, s) in &live {
        pmm.free(PhysicalAddress::new(a), s).unwrap();
        pmm.verify_integrity().unwrap();
    }
}

#[test]
fn no_leak_accounting() {
    let mut pmm = pmm_over(0x10_0000, 0x30_0000, 0x1000);
    let managed = 0x20_0000;
    assert_eq!(pmm.free_bytes(), managed);

    let a = pmm.alloc(0x3000).unwrap();
    let b = pmm.alloc(0x1000).unwrap();
    // 0x3000 rounds to an order-2 block (0x4000).
    assert_eq!(pmm.free_bytes(), managed - 0x4000 - 0x1000);

    pmm.free(a, 0x3000).unwrap();
    pmm.free(b, 0x1000).unwrap();
    assert_eq!(pmm.free_bytes(), managed);
}

#[test]
fn free_then_alloc_same_size_returns_same_address() {
    let mut pmm = pmm_over(0x10_0000, 0x20_0000, 0x1000);
    let a = pmm.alloc(0x4000).unwrap();
    pmm.free(a, 0x4000).unwrap();
    let b = pmm.alloc(0x4000).unwrap();
    assert_eq!(a, b);
}

#[test]
fn boundary_allocations() {
    let mut pmm = pmm_over(0x10_0000, 0x20_0000, 0x1000);

    assert_eq!(pmm.alloc(0).unwrap_err(), PmmError::Invalid);

    // The minimum block comes from order 0 at the managed base.
    let small = pmm.alloc(0x1000).unwrap();
    assert_eq!(small.as_u64(), 0x10_0000);
    pmm.free(small, 0x1000).unwrap();

    // The full span is a single top-order block at the base.
    let all = pmm.alloc(0x10_0000).unwrap();
    assert_eq!(all.as_u64(), 0x10_0000);
    assert_eq!(pmm.alloc(0x1000).unwrap_err(), PmmError::Oom);
    pmm.free(all, 0x10_0000).unwrap();
}

#[test]
fn free_rejects_bad_blocks() {
    let mut pmm = pmm_over(0x10_0000, 0x20_0000, 0x1000);

    assert_eq!(
        pmm.free(PhysicalAddress::new(0x9_0000), 0x1000).unwrap_err(),
        PmmError::OutOfRange
    );
    assert_eq!(
        pmm.free(PhysicalAddress::new(0x20_0000), 0x1000).unwrap_err(),
        PmmError::OutOfRange
    );
    // 0x2000-sized block must sit on an even page boundary relative to
    // the base.
    assert_eq!(
        pmm.free(PhysicalAddress::new(0x10_1000), 0x2000).unwrap_err(),
        PmmError::NotAligned
    );
}

#[test]
fn mark_reserved_splits_straddling_blocks() {
    let mut pmm = pmm_over(0x10_0000, 0x20_0000, 0x1000);

    // Reserve a window in the middle of the (single) top block.
    pmm.mark_reserved(0x14_0000, 0x15_0000).unwrap();
    pmm.verify_integrity().unwrap();
    assert_eq!(pmm.free_bytes(), 0x10_0000 - 0x1_0000);

    // Nothing handed out may intersect the window.
    let mut live = Vec::new();
    while let Ok(a) = pmm.alloc(0x1000) {
        let a = a.as_u64();
        assert!(a + 0x1000 <= 0x14_0000 || a >= 0x15_0000, "{a:#x}");
        live.push(a);
    }
    assert_eq!(live.len(), (0x10_0000 - 0x1_0000) / 0x1000);

    // Give the window back and drain again; now the whole range shows up.
    for a in live {
        pmm.free(PhysicalAddress::new(a), 0x1000).unwrap();
    }
    pmm.mark_free(0x14_0000, 0x15_0000).unwrap();
    pmm.verify_integrity().unwrap();
    assert_eq!(pmm.free_bytes(), 0x10_0000);
}

#[test]
fn corruption_is_detected_and_counted() {
    // Borrowed arena so the test can scribble into "physical" memory
    // behind the allocator's back.
    let arena = ArenaRam::new(0x10_0000, 0x10_0000);
    let mut pmm = BuddyPmm::new(&arena);
    pmm.init(0x10_0000, 0x20_0000, 0x1000).unwrap();

    let a = pmm.alloc(0x1000).unwrap();
    // The order-0 buddy at 0x101000 is free; smash its header.
    let header: &mut [u64; 2] =
        unsafe { arena.phys_to_mut(PhysicalAddress::new(0x10_1000)) };
    header[0] = 0xDEAD_DEAD_DEAD_DEAD;
    header[1] = 0xDEAD_DEAD_DEAD_DEAD;

    assert_eq!(pmm.verify_integrity().unwrap_err(), PmmError::Invalid);
    assert!(pmm.stats().corruption_events > 0);
    let _ = a;
}

#[test]
fn frame_alloc_round_trip() {
    let mut pmm = pmm_over(0x10_0000, 0x20_0000, 0x1000);
    let before = pmm.free_bytes();
    let f = pmm.alloc_frame().expect("frame");
    assert_eq!(f.base().as_u64() % 0x1000, 0);
    pmm.free_frame(f);
    assert_eq!(pmm.free_bytes(), before);
}
