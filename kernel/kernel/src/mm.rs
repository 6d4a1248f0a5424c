//! Memory-manager instances and the glue between them.
//!
//! The library crates are policy-free; this module owns the actual
//! kernel singletons — buddy PMM, slab registry, kernel address space,
//! kernel heap — their spinlocks, and the adapters that let each layer
//! draw from the one below while respecting the lock order
//! console → heap → VMM → slab → PMM.
//!
//! Logging from inside an allocator critical section technically
//! acquires the console lock out of order; on the single BSP with
//! interrupts disabled inside every `lock_irq` section the two contexts
//! cannot interleave, so this cannot deadlock. An SMP port must revisit
//! it.

use core::ptr::null_mut;
use kernel_heap::{Heap, HeapBacking, HeapError};
use kernel_info::boot::{BootInfo, MemoryRegion, RegionKind};
use kernel_info::memory::{
    KERNEL_VMM_BASE, KERNEL_VMM_END, PAGE_SIZE, PHYSMAP_BASE, PHYSMAP_MAX_BYTES, physmap_virt,
};
use kernel_pmm::BuddyPmm;
use kernel_slab::SlabRegistry;
use kernel_sync::{Mutex, RawSpin, SpinMutex, SyncOnceCell};
use kernel_vmem::physmap::{drop_boot_mappings, install_physmap};
use kernel_vmem::{
    AddressSpace, FrameAlloc, PhysMapper, PhysicalAddress, PhysicalFrame, PhysmapMapper,
    VirtualAddress, VmFlags, align_up,
};
use kernel_vmm::{NodeAlloc, SlabNodePool, VmObject, VmSpace, VmmError};
use log::{info, warn};

/// The buddy allocator over all managed RAM.
pub static PMM: SpinMutex<BuddyPmm<PhysmapMapper>> =
    Mutex::from_raw(RawSpin::named("pmm"), BuddyPmm::new(PhysmapMapper));

/// The slab cache registry.
pub static SLABS: SpinMutex<SlabRegistry> =
    Mutex::from_raw(RawSpin::named("slab"), SlabRegistry::new());

/// The kernel address space, wrapped once the PHYSMAP is live.
static KERNEL_SPACE: SyncOnceCell<SpinMutex<VmSpace<PhysmapMapper>>> = SyncOnceCell::new();

/// The kernel heap.
pub static KERNEL_HEAP: SpinMutex<Heap> = Mutex::from_raw(RawSpin::named("heap"), Heap::new());

/// Slab cache id for VM-object nodes.
static VM_NODE_CACHE: SyncOnceCell<u32> = SyncOnceCell::new();

// ----- bootstrap ------------------------------------------------------

/// Page-table frames for the PHYSMAP bring-up, reserved inside the
/// kernel image (BSS) and sized for [`PHYSMAP_MAX_BYTES`] of RAM at
/// 4 KiB leaves: one PT per 2 MiB, one PD per 1 GiB, plus slack for the
/// PDPT and intermediate odds and ends.
const BOOT_POOL_FRAMES: usize =
    (PHYSMAP_MAX_BYTES / (512 * 4096)) as usize + (PHYSMAP_MAX_BYTES / (512 * 512 * 4096)) as usize + 8;

#[repr(C, align(4096))]
struct BootPool([[u8; 4096]; BOOT_POOL_FRAMES]);

static mut BOOT_POOL: BootPool = BootPool([[0; 4096]; BOOT_POOL_FRAMES]);

/// Bump allocator over [`BOOT_POOL`]. Never frees; once the PMM is up
/// the pool is dead weight accounted to the kernel image.
struct BootstrapFrameAlloc {
    next: usize,
}

impl BootstrapFrameAlloc {
    const fn new() -> Self {
        Self { next: 0 }
    }
}

impl FrameAlloc for BootstrapFrameAlloc {
    fn alloc_frame(&mut self) -> Option<PhysicalFrame> {
        if self.next >= BOOT_POOL_FRAMES {
            return None;
        }
        let va = unsafe { (&raw mut BOOT_POOL.0[self.next]) as u64 };
        self.next += 1;
        let pa = va - kernel_info::memory::KERNEL_BASE;
        Some(PhysicalFrame::from_base(PhysicalAddress::new(pa)))
    }

    fn free_frame(&mut self, _frame: PhysicalFrame) {
        // Bump-only; bring-up never unmaps.
    }
}

/// Maps physical addresses through the kernel image window, valid for
/// frames inside the image — exactly the boot pool and the loader's
/// boot tables. Only usable before the PHYSMAP exists.
#[derive(Copy, Clone)]
struct ImageMapper;

impl PhysMapper for ImageMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let va = (kernel_info::memory::KERNEL_BASE + pa.as_u64()) as *mut T;
        unsafe { &mut *va }
    }

    fn invalidate(&self, va: VirtualAddress) {
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
        }
    }
}

/// Install the PHYSMAP over all reported RAM (and the ACPI regions, so
/// the table walk survives the teardown), then drop the loader's
/// identity window and every stray mapping.
///
/// # Safety
/// CPL0, once, right after CPU feature setup, on the loader's tables.
pub unsafe fn init_paging(boot: &BootInfo) {
    let tables = unsafe { AddressSpace::from_current(ImageMapper) };
    let mut pool = BootstrapFrameAlloc::new();

    install_physmap(&tables, &mut pool, boot.memory_map)
        .expect("boot page-table pool exhausted during PHYSMAP bring-up");

    // ACPI tables usually live in reclaimable/NVS regions outside the
    // RAM map; alias them into the PHYSMAP too so the root walk works
    // after the teardown.
    for region in boot
        .memory_map
        .iter()
        .filter(|r| matches!(r.kind, RegionKind::AcpiReclaimable | RegionKind::AcpiNvs))
    {
        let start = region.start & !(PAGE_SIZE - 1);
        let end = align_up(region.end(), PAGE_SIZE).min(PHYSMAP_MAX_BYTES);
        let mut pa = start;
        while pa < end {
            let _ = tables.map_page(
                &mut pool,
                VirtualAddress::new(physmap_virt(pa)),
                PhysicalAddress::new(pa),
                VmFlags::empty(),
            );
            pa += PAGE_SIZE;
        }
    }

    drop_boot_mappings(&tables);
    info!(
        "paging: PHYSMAP live, {}/{} bootstrap frames used",
        pool.next, BOOT_POOL_FRAMES
    );
}

// ----- PMM ------------------------------------------------------------

/// Initialize the buddy allocator over the RAM span and carve out
/// everything that is not free: non-RAM holes, the kernel image (which
/// includes the bootstrap pool) and the boot information.
///
/// # Safety
/// Requires the PHYSMAP (free-list headers live inside the free blocks).
pub unsafe fn init_pmm(boot: &BootInfo) {
    // Sorted copy of the RAM regions.
    let mut ram: [Option<MemoryRegion>; 64] = [None; 64];
    let mut count = 0;
    for region in boot.memory_map.iter().filter(|r| r.kind == RegionKind::Ram) {
        if count == ram.len() {
            warn!("pmm: more than {} RAM regions, ignoring the rest", ram.len());
            break;
        }
        let mut i = count;
        while i > 0 && ram[i - 1].is_some_and(|r| r.start > region.start) {
            ram[i] = ram[i - 1];
            i -= 1;
        }
        ram[i] = Some(*region);
        count += 1;
    }
    assert!(count > 0, "no usable RAM reported");

    // Frame 0 is never managed; a next-pointer of 0 terminates the
    // buddy free lists.
    let base = ram[0].unwrap().start.max(PAGE_SIZE).next_multiple_of(PAGE_SIZE);
    let end = boot.highest_ram().min(PHYSMAP_MAX_BYTES) & !(PAGE_SIZE - 1);

    let mut pmm = PMM.lock_irq();
    pmm.init(base, end, PAGE_SIZE).expect("pmm init");

    // Reserve the holes between RAM regions.
    let mut prev_end = base;
    for region in ram[..count].iter().flatten() {
        if region.start > prev_end {
            pmm.mark_reserved(prev_end, region.start).expect("pmm hole");
        }
        prev_end = prev_end.max(region.end());
    }
    if prev_end < end {
        pmm.mark_reserved(prev_end, end).expect("pmm tail hole");
    }

    // Kernel image (with the boot pool inside) plus the legacy low MiB.
    pmm.mark_reserved(0, boot.kernel_phys_end.max(0x10_0000))
        .expect("pmm image reserve");
    // The loader-owned boot information.
    pmm.mark_reserved(boot.info_start, boot.info_end)
        .expect("pmm bootinfo reserve");

    info!(
        "pmm: managing {base:#x}..{end:#x}, {} KiB free",
        pmm.free_bytes() / 1024
    );
}

/// Frame source that locks the global PMM per call.
pub struct PmmFrames;

impl FrameAlloc for PmmFrames {
    fn alloc_frame(&mut self) -> Option<PhysicalFrame> {
        PMM.lock_irq().alloc_frame()
    }

    fn free_frame(&mut self, frame: PhysicalFrame) {
        PMM.lock_irq().free_frame(frame);
    }
}

// ----- slab -----------------------------------------------------------

/// Create the caches the core needs; currently just the VM-object node
/// cache.
///
/// # Safety
/// Requires the PMM.
pub unsafe fn init_slab() {
    let id = SLABS
        .lock_irq()
        .create("vm-object", size_of::<VmObject>() as u32, 8)
        .expect("vm-object cache");
    VM_NODE_CACHE.set(id).expect("init_slab called twice");
}

/// VM-object node source backed by the "vm-object" slab cache.
pub struct KernelNodes;

impl NodeAlloc for KernelNodes {
    fn alloc_node(&mut self) -> Option<*mut VmObject> {
        let id = *VM_NODE_CACHE.get()?;
        let mut registry = SLABS.lock_irq();
        let cache = registry.get_mut(id)?;
        let mut frames = PmmFrames;
        let mut pool = SlabNodePool {
            cache,
            mapper: PhysmapMapper,
            frames: &mut frames,
            virt_base: PHYSMAP_BASE,
        };
        pool.alloc_node()
    }

    unsafe fn free_node(&mut self, node: *mut VmObject) {
        let Some(&id) = VM_NODE_CACHE.get() else {
            return;
        };
        let mut registry = SLABS.lock_irq();
        let Some(cache) = registry.get_mut(id) else {
            return;
        };
        let mut frames = PmmFrames;
        let mut pool = SlabNodePool {
            cache,
            mapper: PhysmapMapper,
            frames: &mut frames,
            virt_base: PHYSMAP_BASE,
        };
        unsafe { pool.free_node(node) };
    }
}

// ----- VMM ------------------------------------------------------------

/// Wrap the live address space as the kernel singleton, allocating
/// dynamic mappings from the dedicated kernel VMM window.
///
/// # Safety
/// Requires the PHYSMAP; call once.
pub unsafe fn init_vmm() {
    let space = unsafe { VmSpace::from_current(PhysmapMapper, KERNEL_VMM_BASE, KERNEL_VMM_END) };
    KERNEL_SPACE
        .set(Mutex::from_raw(RawSpin::named("vmm"), space))
        .unwrap_or_else(|_| panic!("init_vmm called twice"));
    info!("vmm: kernel window {KERNEL_VMM_BASE:#x}..{KERNEL_VMM_END:#x}");
}

/// The kernel address space.
///
/// # Panics
/// Before [`init_vmm`].
pub fn kernel_space() -> &'static SpinMutex<VmSpace<PhysmapMapper>> {
    KERNEL_SPACE.get().expect("vmm not initialized")
}

/// Map `len` bytes of device memory at `pa` into the kernel window,
/// uncached, writable.
///
/// # Errors
/// VMM status on window exhaustion or collisions.
pub fn kernel_map_mmio(pa: PhysicalAddress, len: u64) -> Result<VirtualAddress, VmmError> {
    let mut frames = PmmFrames;
    let mut nodes = KernelNodes;
    kernel_space()
        .lock_irq()
        .alloc(&mut frames, &mut nodes, len, VmFlags::MMIO | VmFlags::WRITE, Some(pa))
}

/// Read-only variant of [`kernel_map_mmio`] for firmware tables.
///
/// # Errors
/// See [`kernel_map_mmio`].
pub fn kernel_map_mmio_ro(pa: PhysicalAddress, len: u64) -> Result<VirtualAddress, VmmError> {
    let mut frames = PmmFrames;
    let mut nodes = KernelNodes;
    kernel_space()
        .lock_irq()
        .alloc(&mut frames, &mut nodes, len, VmFlags::MMIO, Some(pa))
}

/// Release a kernel-window mapping created by the helpers above.
///
/// # Errors
/// [`VmmError::NotFound`] if `va` maps no object.
pub fn kernel_unmap(va: VirtualAddress) -> Result<(), VmmError> {
    let mut frames = PmmFrames;
    let mut nodes = KernelNodes;
    kernel_space().lock_irq().free(&mut frames, &mut nodes, va)
}

// ----- heap -----------------------------------------------------------

/// Backing that grows the kernel heap out of the kernel VMM window.
pub struct KernelHeapBacking;

impl HeapBacking for KernelHeapBacking {
    fn grow(&mut self, min_bytes: u64) -> Result<(*mut u8, u64), HeapError> {
        if KERNEL_SPACE.get().is_none() {
            return Err(HeapError::NotInit);
        }
        let len = align_up(min_bytes, PAGE_SIZE);
        let mut frames = PmmFrames;
        let mut nodes = KernelNodes;
        let va = kernel_space()
            .lock_irq()
            .alloc(&mut frames, &mut nodes, len, VmFlags::WRITE, None)
            .map_err(|_| HeapError::VmmFail)?;
        Ok((va.as_u64() as *mut u8, len))
    }

    unsafe fn release(&mut self, base: *mut u8, _len: u64) {
        let _ = kernel_unmap(VirtualAddress::new(base as u64));
    }
}

/// Nothing to allocate up front; the heap grows on first use. Kept as an
/// explicit step so the bring-up order stays visible in `kmain`.
pub fn init_heap() {
    info!("heap: online (lazy growth, {} B quantum)", kernel_heap::HEAP_MIN_SIZE);
}

/// Allocate from the kernel heap; null on failure (log the status).
#[must_use]
pub fn kmalloc(size: u64) -> *mut u8 {
    KERNEL_HEAP
        .lock_irq()
        .malloc(&mut KernelHeapBacking, size)
        .unwrap_or_else(|e| {
            warn!("kmalloc({size}) failed: {e}");
            null_mut()
        })
}

/// Allocate or die; for allocations the kernel cannot survive without.
#[must_use]
pub fn kmalloc_urgent(size: u64) -> *mut u8 {
    KERNEL_HEAP.lock_irq().malloc_urgent(&mut KernelHeapBacking, size)
}

/// Zeroed array allocation; null on failure.
#[must_use]
pub fn kcalloc(n: u64, size: u64) -> *mut u8 {
    KERNEL_HEAP
        .lock_irq()
        .calloc(&mut KernelHeapBacking, n, size)
        .unwrap_or(null_mut())
}

/// Resize per the usual realloc contract.
#[must_use]
pub fn krealloc(ptr: *mut u8, size: u64) -> *mut u8 {
    KERNEL_HEAP
        .lock_irq()
        .realloc(&mut KernelHeapBacking, ptr, size)
        .unwrap_or(null_mut())
}

/// Free a kernel heap pointer; failures are logged, not fatal.
pub fn kfree(ptr: *mut u8) {
    if let Err(e) = KERNEL_HEAP.lock_irq().free(ptr) {
        warn!("kfree({ptr:p}) rejected: {e}");
    }
}

/// The kernel heap singleton, for callers that need more than the
/// convenience wrappers (integrity walks, stats).
pub fn kernel_heap() -> &'static SpinMutex<Heap> {
    &KERNEL_HEAP
}

// ----- global allocator ----------------------------------------------

/// `GlobalAlloc` adapter over the kernel heap, for the rare `alloc`
/// users in the kernel.
pub struct KernelAllocator;

// SAFETY: delegates to the locked kernel heap.
unsafe impl core::alloc::GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        if layout.align() as u64 > kernel_heap::HEAP_MIN_ALIGN {
            return null_mut();
        }
        kmalloc(layout.size() as u64)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        kfree(ptr);
    }
}

#[cfg(not(any(test, doctest)))]
#[global_allocator]
static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;
