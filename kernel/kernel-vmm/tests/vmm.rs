//! VMM behavior against fake physical memory: object bookkeeping,
//! MMIO windows, protection changes, growth, and the destruction
//! cascade.

use kernel_vmm::{NodeAlloc, VmObject, VmSpace, VmmError};
use kernel_vmem::{
    FrameAlloc, PhysMapper, PhysicalAddress, PhysicalFrame, VirtualAddress, VmFlags, flags,
};

/// A page-aligned 4 KiB frame (plain `[u8; 4096]` has no alignment
/// guarantee beyond 1, which breaks `phys_to_mut`'s alignment checks).
#[repr(align(4096))]
struct Frame([u8; 4096]);

/// Fake physical RAM; frame `i` is physical `i * 4096`.
struct TestPhys {
    frames: Vec<Box<Frame>>,
}

impl TestPhys {
    fn with_frames(n: usize) -> Self {
        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            frames.push(Box::new(Frame([0u8; 4096])));
        }
        Self { frames }
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let idx = (pa.as_u64() >> 12) as usize;
        let off = (pa.as_u64() & 0xFFF) as usize;
        let base = (&raw const self.frames[idx].0[off]) as *mut u8;
        unsafe { &mut *base.cast::<T>() }
    }

    fn invalidate(&self, _va: VirtualAddress) {}
}

/// Frame source with exact outstanding-count accounting.
struct Frames {
    next: u64,
    end: u64,
    freed: Vec<u64>,
    outstanding: i64,
}

impl Frames {
    fn new(pages: u64) -> Self {
        Self {
            next: 0,
            end: pages * 4096,
            freed: Vec::new(),
            outstanding: 0,
        }
    }
}

impl FrameAlloc for Frames {
    fn alloc_frame(&mut self) -> Option<PhysicalFrame> {
        self.outstanding += 1;
        if let Some(pa) = self.freed.pop() {
            return Some(PhysicalFrame::from_base(PhysicalAddress::new(pa)));
        }
        if self.next + 4096 > self.end {
            self.outstanding -= 1;
            return None;
        }
        let pa = self.next;
        self.next += 4096;
        Some(PhysicalFrame::from_base(PhysicalAddress::new(pa)))
    }

    fn free_frame(&mut self, frame: PhysicalFrame) {
        self.outstanding -= 1;
        assert!(
            !self.freed.contains(&frame.base().as_u64()),
            "double frame free {:?}",
            frame
        );
        self.freed.push(frame.base().as_u64());
    }
}

/// Heap-backed node pool standing in for the slab cache.
#[derive(Default)]
struct BoxNodes {
    live: usize,
}

impl NodeAlloc for BoxNodes {
    fn alloc_node(&mut self) -> Option<*mut VmObject> {
        self.live += 1;
        Some(Box::into_raw(Box::new(VmObject {
            base: 0,
            length: 0,
            flags: VmFlags::empty(),
            next: core::ptr::null_mut(),
        })))
    }

    unsafe fn free_node(&mut self, node: *mut VmObject) {
        self.live -= 1;
        drop(unsafe { Box::from_raw(node) });
    }
}

const WINDOW_BASE: u64 = 0x40_0000;
const WINDOW_END: u64 = 0x80_0000;

fn setup(pages: usize) -> (TestPhys, Frames, BoxNodes) {
    kernel_vmem::flags::set_nx_enabled(true);
    (
        TestPhys::with_frames(pages),
        Frames::new(pages as u64),
        BoxNodes::default(),
    )
}

fn space(phys: &TestPhys, frames: &mut Frames) -> VmSpace<&'static TestPhys> {
    // The tests keep `phys` alive for the whole test body; stretch the
    // borrow so the space type does not carry the local lifetime.
    let phys: &'static TestPhys = unsafe { &*std::ptr::from_ref(phys) };
    VmSpace::create(phys, frames, WINDOW_BASE, WINDOW_END).unwrap()
}

#[test]
fn objects_stay_sorted_aligned_and_disjoint() {
    let (phys, mut frames, mut nodes) = setup(128);
    let mut vm = space(&phys, &mut frames);

    let a = vm
        .alloc(&mut frames, &mut nodes, 3 * 4096, VmFlags::WRITE, None)
        .unwrap();
    let b = vm
        .alloc(&mut frames, &mut nodes, 4096, VmFlags::WRITE, None)
        .unwrap();
    let c = vm
        .alloc(&mut frames, &mut nodes, 2 * 4096, VmFlags::WRITE, None)
        .unwrap();
    assert!(a.as_u64() < b.as_u64() && b.as_u64() < c.as_u64());

    let mut prev_end = 0;
    let mut count = 0;
    vm.for_each_object(|obj| {
        assert_eq!(obj.base % 4096, 0);
        assert_eq!(obj.length % 4096, 0);
        assert!(obj.base >= prev_end, "sorted and non-overlapping");
        prev_end = obj.end();
        count += 1;
    });
    assert_eq!(count, 3);

    // The middle object freed and reallocated lands back in the gap.
    vm.free(&mut frames, &mut nodes, b).unwrap();
    let b2 = vm
        .alloc(&mut frames, &mut nodes, 4096, VmFlags::WRITE, None)
        .unwrap();
    assert_eq!(b2, b);
}

#[test]
fn sixteen_page_pool_exhausts_on_the_seventeenth() {
    // 64 KiB worth of frames for leaves; a few more for page tables.
    let (phys, mut frames, mut nodes) = setup(16 + 8);
    let mut vm = {
        let phys_ref: &'static TestPhys = unsafe { &*std::ptr::from_ref(&phys) };
        // Window of exactly 16 pages.
        VmSpace::create(phys_ref, &mut frames, 0x40_0000, 0x41_0000).unwrap()
    };

    let mut got = Vec::new();
    for i in 0..16 {
        got.push(
            vm.alloc(&mut frames, &mut nodes, 4096, VmFlags::WRITE, None)
                .unwrap_or_else(|e| panic!("alloc {i}: {e}")),
        );
    }
    assert_eq!(
        vm.alloc(&mut frames, &mut nodes, 4096, VmFlags::WRITE, None)
            .unwrap_err(),
        VmmError::Oom
    );
    for va in got {
        vm.free(&mut frames, &mut nodes, va).unwrap();
    }
}

#[test]
fn alloc_at_rejects_unaligned_and_overlapping() {
    let (phys, mut frames, mut nodes) = setup(64);
    let mut vm = space(&phys, &mut frames);

    assert_eq!(
        vm.alloc_at(
            &mut frames,
            &mut nodes,
            VirtualAddress::new(WINDOW_BASE + 0x10),
            4096,
            VmFlags::WRITE,
            None
        )
        .unwrap_err(),
        VmmError::NotAligned
    );

    let va = VirtualAddress::new(WINDOW_BASE + 0x10_000);
    vm.alloc_at(&mut frames, &mut nodes, va, 4 * 4096, VmFlags::WRITE, None)
        .unwrap();

    // Any page overlap is refused, including partial ones.
    assert_eq!(
        vm.alloc_at(
            &mut frames,
            &mut nodes,
            VirtualAddress::new(WINDOW_BASE + 0x12_000),
            4 * 4096,
            VmFlags::WRITE,
            None
        )
        .unwrap_err(),
        VmmError::AlreadyMapped
    );
}

#[test]
fn mmio_round_trip_and_protect() {
    let (phys, mut frames, mut nodes) = setup(64);
    let mut vm = space(&phys, &mut frames);

    // "Device" frame at a fixed physical address inside the arena.
    let device = PhysicalAddress::new(0x3_0000);
    let va = VirtualAddress::new(WINDOW_BASE + 0x20_000);
    let outstanding_before = frames.outstanding;
    vm.alloc_at(
        &mut frames,
        &mut nodes,
        va,
        4096,
        VmFlags::MMIO | VmFlags::WRITE,
        Some(device),
    )
    .unwrap();

    // Only page-table frames were consumed, no leaf frames.
    assert!(frames.outstanding - outstanding_before <= 3);
    assert_eq!(vm.get_physical(va), Some(device));
    assert!(vm.check_flags(va, VmFlags::WRITE));

    vm.protect(va, VmFlags::empty()).unwrap();
    assert!(!vm.check_flags(va, VmFlags::WRITE));

    // Freeing the window must not hand the device frame to the PMM.
    vm.free(&mut frames, &mut nodes, va).unwrap();
    assert!(!frames.freed.contains(&device.as_u64()));
}

#[test]
fn mmio_requires_a_physical_hint_and_vice_versa() {
    let (phys, mut frames, mut nodes) = setup(64);
    let mut vm = space(&phys, &mut frames);

    assert_eq!(
        vm.alloc(&mut frames, &mut nodes, 4096, VmFlags::MMIO, None)
            .unwrap_err(),
        VmmError::Invalid
    );
    assert_eq!(
        vm.alloc(
            &mut frames,
            &mut nodes,
            4096,
            VmFlags::WRITE,
            Some(PhysicalAddress::new(0x3000))
        )
        .unwrap_err(),
        VmmError::Invalid
    );
}

#[test]
fn free_removes_object_and_leaves() {
    let (phys, mut frames, mut nodes) = setup(64);
    let mut vm = space(&phys, &mut frames);

    let va = vm
        .alloc(&mut frames, &mut nodes, 3 * 4096, VmFlags::WRITE, None)
        .unwrap();
    assert!(vm.get_physical(va).is_some());

    vm.free(&mut frames, &mut nodes, va).unwrap();
    assert_eq!(vm.object_count(), 0);
    for i in 0..3u64 {
        assert_eq!(vm.get_physical(va.add(i * 4096)), None, "leaf {i} gone");
    }
    assert_eq!(
        vm.free(&mut frames, &mut nodes, va).unwrap_err(),
        VmmError::NotFound
    );
}

#[test]
fn resize_shrinks_and_grows() {
    let (phys, mut frames, mut nodes) = setup(64);
    let mut vm = space(&phys, &mut frames);

    let va = vm
        .alloc(&mut frames, &mut nodes, 4 * 4096, VmFlags::WRITE, None)
        .unwrap();

    vm.resize(&mut frames, va, 2 * 4096).unwrap();
    assert!(vm.get_physical(va.add(4096)).is_some());
    assert_eq!(vm.get_physical(va.add(2 * 4096)), None);

    vm.resize(&mut frames, va, 3 * 4096).unwrap();
    assert!(vm.get_physical(va.add(2 * 4096)).is_some());

    // A neighbor directly above blocks growth.
    vm.alloc_at(
        &mut frames,
        &mut nodes,
        va.add(3 * 4096),
        4096,
        VmFlags::WRITE,
        None,
    )
    .unwrap();
    assert_eq!(vm.resize(&mut frames, va, 4 * 4096).unwrap_err(), VmmError::Oom);
}

#[test]
fn growth_beyond_the_window_is_oom() {
    let (phys, mut frames, mut nodes) = setup(64);
    let mut vm = {
        let phys_ref: &'static TestPhys = unsafe { &*std::ptr::from_ref(&phys) };
        VmSpace::create(phys_ref, &mut frames, 0x40_0000, 0x40_4000).unwrap()
    };
    let va = vm
        .alloc(&mut frames, &mut nodes, 2 * 4096, VmFlags::WRITE, None)
        .unwrap();
    assert_eq!(
        vm.resize(&mut frames, va, 8 * 4096).unwrap_err(),
        VmmError::Oom
    );
}

#[test]
fn protect_round_trip_holds_for_every_leaf() {
    let (phys, mut frames, mut nodes) = setup(64);
    let mut vm = space(&phys, &mut frames);

    let va = vm
        .alloc(&mut frames, &mut nodes, 4 * 4096, VmFlags::WRITE, None)
        .unwrap();
    vm.protect(va, VmFlags::WRITE | VmFlags::EXEC).unwrap();
    for i in 0..4u64 {
        assert!(vm.check_flags(va.add(i * 4096), VmFlags::WRITE | VmFlags::EXEC));
    }
    let obj = vm.find_mapped_object(va).unwrap();
    assert_eq!(obj.flags, VmFlags::WRITE | VmFlags::EXEC);
}

#[test]
fn destroy_releases_everything_but_the_kernel_half() {
    let (phys, mut frames, mut nodes) = setup(128);

    // "Kernel" space with an upper-half mapping.
    let phys_ref: &'static TestPhys = unsafe { &*std::ptr::from_ref(&phys) };
    let kernel = VmSpace::create(phys_ref, &mut frames, WINDOW_BASE, WINDOW_END).unwrap();
    let kva = VirtualAddress::new(0xFFFF_8880_0000_0000);
    kernel
        .tables()
        .map_page(&mut frames, kva, PhysicalAddress::new(0x7000), VmFlags::WRITE)
        .unwrap();

    let baseline = frames.outstanding;
    let mut user =
        VmSpace::create_user(phys_ref, &mut frames, &kernel, WINDOW_BASE, WINDOW_END).unwrap();
    assert_eq!(user.get_physical(kva), Some(PhysicalAddress::new(0x7000)));

    user.alloc(&mut frames, &mut nodes, 5 * 4096, VmFlags::WRITE, None)
        .unwrap();
    user.alloc(&mut frames, &mut nodes, 2 * 4096, VmFlags::WRITE | VmFlags::EXEC, None)
        .unwrap();
    assert!(frames.outstanding > baseline);

    user.destroy(&mut frames, &mut nodes);
    assert_eq!(
        frames.outstanding, baseline,
        "every frame unique to the space must come back"
    );
    assert_eq!(nodes.live, 0, "every node must come back");

    // The kernel mapping is untouched.
    assert_eq!(kernel.get_physical(kva), Some(PhysicalAddress::new(0x7000)));
}

#[test]
fn flag_translation_matches_leaf_bits() {
    let (phys, mut frames, mut nodes) = setup(64);
    let mut vm = space(&phys, &mut frames);

    let va = vm
        .alloc(
            &mut frames,
            &mut nodes,
            4096,
            VmFlags::WRITE | VmFlags::USER,
            None,
        )
        .unwrap();
    let leaf = vm.tables().leaf(va).unwrap();
    assert!(leaf.writable() && leaf.user());
    assert_eq!(
        flags::flags_of(leaf),
        VmFlags::WRITE | VmFlags::USER,
        "NX on, so no implicit EXEC"
    );
}
