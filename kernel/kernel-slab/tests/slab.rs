//! Slab allocator behavior against an in-memory page arena.

use kernel_slab::{MAX_CACHES, SlabError, SlabRegistry};
use kernel_vmem::{FrameAlloc, PhysMapper, PhysicalAddress, PhysicalFrame, VirtualAddress};

/// Fake physical RAM plus a page allocator over it.
struct Arena {
    words: Vec<u64>,
    base: u64,
}

impl Arena {
    fn new(base: u64, pages: usize) -> Self {
        Self {
            words: vec![0u64; pages * 512],
            base,
        }
    }
}

impl PhysMapper for Arena {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let off = (pa.as_u64() - self.base) as usize;
        assert!(off + size_of::<T>() <= self.words.len() * 8);
        let base = self.words.as_ptr() as *mut u8;
        unsafe { &mut *base.add(off).cast::<T>() }
    }

    fn invalidate(&self, _va: VirtualAddress) {}
}

struct PageSource {
    next: u64,
    end: u64,
    freed: Vec<u64>,
    handed_out: usize,
}

impl PageSource {
    fn new(base: u64, pages: u64) -> Self {
        Self {
            next: base,
            end: base + pages * 4096,
            freed: Vec::new(),
            handed_out: 0,
        }
    }
}

impl FrameAlloc for PageSource {
    fn alloc_frame(&mut self) -> Option<PhysicalFrame> {
        if let Some(pa) = self.freed.pop() {
            self.handed_out += 1;
            return Some(PhysicalFrame::from_base(PhysicalAddress::new(pa)));
        }
        if self.next + 4096 > self.end {
            return None;
        }
        let pa = self.next;
        self.next += 4096;
        self.handed_out += 1;
        Some(PhysicalFrame::from_base(PhysicalAddress::new(pa)))
    }

    fn free_frame(&mut self, frame: PhysicalFrame) {
        self.handed_out -= 1;
        self.freed.push(frame.base().as_u64());
    }
}

const BASE: u64 = 0x10_0000;

fn setup(pages: usize) -> (Arena, PageSource, SlabRegistry) {
    (
        Arena::new(BASE, pages),
        PageSource::new(BASE, pages as u64),
        SlabRegistry::new(),
    )
}

#[test]
fn create_find_and_destroy() {
    let (arena, mut frames, mut reg) = setup(8);
    let id = reg.create("vm-object", 48, 8).unwrap();
    assert_eq!(reg.find("vm-object"), Some(id));
    assert_eq!(reg.find("nope"), None);
    assert_eq!(reg.create("vm-object", 48, 8), Err(SlabError::AlreadyInit));
    reg.destroy(id, &arena, &mut frames).unwrap();
    assert_eq!(reg.find("vm-object"), None);
}

#[test]
fn oversized_objects_are_refused() {
    let (_arena, _frames, mut reg) = setup(1);
    assert_eq!(reg.create("huge", 513, 8), Err(SlabError::BadSize));
    assert_eq!(reg.create("zero", 0, 8), Err(SlabError::Invalid));
    assert_eq!(reg.create("weird", 64, 3), Err(SlabError::Invalid));
}

#[test]
fn registry_capacity_is_sixteen() {
    let (_arena, _frames, mut reg) = setup(1);
    let names: [&'static str; 17] = [
        "c0", "c1", "c2", "c3", "c4", "c5", "c6", "c7", "c8", "c9", "c10", "c11", "c12", "c13",
        "c14", "c15", "c16",
    ];
    for name in &names[..MAX_CACHES] {
        reg.create(name, 32, 8).unwrap();
    }
    assert_eq!(reg.create(names[16], 32, 8), Err(SlabError::CacheFull));
}

#[test]
fn objects_are_distinct_and_aligned() {
    let (arena, mut frames, mut reg) = setup(8);
    let id = reg.create("obj64", 64, 16).unwrap();
    let cache = reg.get_mut(id).unwrap();

    let mut seen = Vec::new();
    for _ in 0..100 {
        let pa = cache.alloc(&arena, &mut frames).unwrap();
        assert_eq!(pa.as_u64() % 16, 0, "alignment");
        assert!(!seen.contains(&pa.as_u64()), "duplicate object");
        seen.push(pa.as_u64());
    }
    assert_eq!(cache.live_objects(), 100);

    for &pa in &seen {
        cache
            .free(&arena, &mut frames, PhysicalAddress::new(pa))
            .unwrap();
    }
    assert_eq!(cache.live_objects(), 0);
}

#[test]
fn freed_objects_return_to_their_slab() {
    let (arena, mut frames, mut reg) = setup(8);
    let id = reg.create("node", 64, 8).unwrap();
    let cache = reg.get_mut(id).unwrap();
    let per_slab = cache.objects_per_slab() as usize;

    // Fill the first slab completely.
    let mut first: Vec<u64> = Vec::new();
    for _ in 0..per_slab {
        first.push(cache.alloc(&arena, &mut frames).unwrap().as_u64());
    }
    let page_of = |pa: u64| pa & !0xFFF;
    let first_page = page_of(first[0]);
    assert!(first.iter().all(|&p| page_of(p) == first_page));

    // The next allocation opens a second slab.
    let second = cache.alloc(&arena, &mut frames).unwrap().as_u64();
    assert_ne!(page_of(second), first_page);

    // Freeing one object of the (full) first slab makes it Partial, and
    // Partial is preferred for the next allocation.
    cache
        .free(&arena, &mut frames, PhysicalAddress::new(first[3]))
        .unwrap();
    let replacement = cache.alloc(&arena, &mut frames).unwrap().as_u64();
    assert_eq!(page_of(replacement), first_page);
    assert_eq!(replacement, first[3], "LIFO within the slab");
}

#[test]
fn empty_slabs_are_released_to_the_frame_source() {
    let (arena, mut frames, mut reg) = setup(16);
    let id = reg.create("burst", 128, 8).unwrap();
    let cache = reg.get_mut(id).unwrap();
    let per_slab = cache.objects_per_slab() as usize;

    // Allocate four slabs' worth, then free everything.
    let mut objs = Vec::new();
    for _ in 0..per_slab * 4 {
        objs.push(cache.alloc(&arena, &mut frames).unwrap());
    }
    assert_eq!(frames.handed_out, 4);
    for pa in objs {
        cache.free(&arena, &mut frames, pa).unwrap();
    }
    // One warm empty slab is kept, the rest went back.
    assert_eq!(frames.handed_out, 1);

    reg.destroy(id, &arena, &mut frames).unwrap();
    assert_eq!(frames.handed_out, 0);
}

#[test]
fn destroy_refuses_while_objects_live() {
    let (arena, mut frames, mut reg) = setup(4);
    let id = reg.create("sticky", 32, 8).unwrap();
    let pa = reg
        .get_mut(id)
        .unwrap()
        .alloc(&arena, &mut frames)
        .unwrap();
    assert_eq!(
        reg.destroy(id, &arena, &mut frames),
        Err(SlabError::Invalid)
    );
    reg.get_mut(id)
        .unwrap()
        .free(&arena, &mut frames, pa)
        .unwrap();
    reg.destroy(id, &arena, &mut frames).unwrap();
}

#[test]
fn free_detects_corruption_and_foreign_pointers() {
    let (arena, mut frames, mut reg) = setup(4);
    let id = reg.create("guarded", 64, 8).unwrap();
    let cache = reg.get_mut(id).unwrap();
    let pa = cache.alloc(&arena, &mut frames).unwrap();

    // Misaligned interior pointer.
    assert_eq!(
        cache.free(&arena, &mut frames, PhysicalAddress::new(pa.as_u64() + 1)),
        Err(SlabError::Invalid)
    );

    // Smash the page magic: the free must be refused, not crash.
    let page = pa.as_u64() & !0xFFF;
    let magic: &mut u32 = unsafe { arena.phys_to_mut(PhysicalAddress::new(page)) };
    *magic = 0;
    assert_eq!(
        cache.free(&arena, &mut frames, pa),
        Err(SlabError::Corruption)
    );
}
