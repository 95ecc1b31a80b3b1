//! One-shot construction of the kernel address space.
//!
//! [`init`] runs exactly once on the boot processor, while translation is
//! still off and the watermark allocator is the only source of memory. It
//! builds the kernel window, verifies the result with the checks in
//! [`crate::check`], walks the processor through the paging-enable
//! transition and only then populates the frame registry and free list.
//!
//! The transition itself is the delicate part: the boot segments bias every
//! address by `-KERNBASE`, so the instant paging turns on the processor
//! fetches from *low* linear addresses. Root slot 0 temporarily aliases the
//! kernel window to keep those fetches translating until flat segments are
//! loaded, and is retracted afterwards.

use crate::check;
use crate::layout::{
    jumbo_offset, page_offset, pdx, phys_to_kernel, VirtAddr, EXT_PHYS_MEM, IO_PHYS_MEM, JPG_SIZE,
    KERNBASE, KSTACKTOP, KSTK_SIZE, PT_SIZE, UPAGES, UPROCS, UVPT, VPT,
};
use crate::mmu::Mmu;
use crate::proc::{Process, NPROCS};
use crate::table::{Entry, EntryFlags, EntrySlot};
use crate::walk::{walk, BootFrameSource, CreateMode};
use core::mem::size_of;
use frames::{
    page_number, page_round_up, BootAllocator, FrameAllocator, FrameDescriptor, PhysAddr,
    PhysMemory, Pfn, PAGE_SIZE,
};

/// What the boot loader hands over: the detected machine configuration.
#[derive(Debug, Copy, Clone)]
pub struct BootParams {
    /// Bytes of usable physical memory, a whole number of frames.
    pub memory_size: usize,
    /// First free physical address above the loaded kernel image.
    pub kernel_end: PhysAddr,
    /// Whether the processor can translate large pages.
    pub pse_supported: bool,
}

/// Where the boot-carved structures ended up, kept for the consistency
/// checks and for later introspection.
#[derive(Debug, Copy, Clone)]
pub struct BootRecord {
    pub root: Pfn,
    pub stack_pa: PhysAddr,
    pub registry_pa: PhysAddr,
    /// Bytes of the registry visible in the `UPAGES` window.
    pub registry_mapped: usize,
    pub procs_pa: PhysAddr,
    /// Bytes of the process table visible in the `UPROCS` window.
    pub procs_mapped: usize,
}

/// The fully initialized memory subsystem.
pub struct KernelVm<'mem> {
    pub mmu: Mmu,
    pub root: Pfn,
    pub frames: FrameAllocator<'mem>,
    pub record: BootRecord,
}

/// Map the physical range `[pa, pa + len)` at `[va, va + len)` with `flags`,
/// drawing any needed leaf tables from the watermark allocator.
///
/// Passing [`EntryFlags::LARGE`] maps the range with one root-level entry
/// per large-page span; the start addresses must then be large-page
/// aligned, anything else is a caller bug. Small-page requests are more
/// forgiving: an unaligned start is truncated to its page boundary with a
/// warning and the length extended so the tail stays covered, and a range
/// reaching past installed memory is mapped anyway with a warning.
pub fn map_segment(
    mem: &mut PhysMemory,
    boot: &mut BootAllocator,
    root: Pfn,
    va: VirtAddr,
    len: usize,
    pa: PhysAddr,
    flags: EntryFlags,
) {
    let mut va = va;
    let mut pa = pa;
    let mut len = len;
    if page_offset(va) != 0 {
        log::warn!("segment start {va:#010x} not page aligned, mapping the whole page");
        len += page_offset(va);
        va &= !(PAGE_SIZE as u32 - 1);
        pa &= !(PAGE_SIZE as u32 - 1);
    }
    if pa as usize + len > boot.ceiling() as usize {
        log::warn!("segment {va:#010x} maps physical memory beyond the detected ceiling");
    }

    let mut source = BootFrameSource { alloc: boot };
    if flags.contains(EntryFlags::LARGE) {
        assert!(
            jumbo_offset(va) == 0 && pa as usize % JPG_SIZE == 0,
            "large-page segment at unaligned address {va:#010x} -> {pa:#010x}"
        );
        let mut off = 0usize;
        while off < len {
            let cur_va = va.wrapping_add(off as u32);
            let slot = walk(mem, root, cur_va, CreateMode::CreateJumbo, &mut source)
                .expect("watermark-backed walk does not fail")
                .expect("jumbo-mode walk always yields a slot");
            assert_eq!(
                slot.table(),
                root,
                "large mapping at {cur_va:#010x} overlaps an existing leaf table"
            );
            slot.store(
                mem,
                Entry::new(page_number(pa + off as u32), flags | EntryFlags::PRESENT),
            );
            off += JPG_SIZE;
        }
    } else {
        let mut off = 0usize;
        while off < len {
            let cur_va = va.wrapping_add(off as u32);
            let slot = walk(mem, root, cur_va, CreateMode::Create, &mut source)
                .expect("watermark-backed walk does not fail")
                .expect("create-mode walk cannot miss");
            slot.store(
                mem,
                Entry::new(page_number(pa + off as u32), flags | EntryFlags::PRESENT),
            );
            off += PAGE_SIZE;
        }
    }
}

fn clamp_window(what: &str, bytes: usize) -> usize {
    let rounded = page_round_up(bytes);
    if rounded > PT_SIZE {
        log::warn!(
            "{what} ({bytes} bytes) does not fit its {PT_SIZE}-byte user window, \
             truncating the user-visible part"
        );
        PT_SIZE
    } else {
        rounded
    }
}

/// Build the kernel address space, switch the processor onto it and hand
/// the remaining physical memory to the frame allocator.
pub fn init<'mem>(mem: &mut PhysMemory<'mem>, params: BootParams) -> KernelVm<'mem> {
    assert!(
        params.memory_size <= mem.size(),
        "detected memory exceeds the installed memory"
    );
    assert!(
        params.kernel_end >= EXT_PHYS_MEM,
        "kernel image must load above the IO hole"
    );
    let npages = params.memory_size / PAGE_SIZE;

    let mut mmu = Mmu::new(params.pse_supported);
    if mmu.pse_supported() {
        mmu.enable_pse();
    }
    let mut boot = BootAllocator::new(params.kernel_end, params.memory_size);

    let root_pa = boot.alloc(PAGE_SIZE, PAGE_SIZE);
    mem.zero_range(root_pa, PAGE_SIZE);
    let root = page_number(root_pa);

    // Recursive self-maps: the table hierarchy appears as data at VPT for
    // the kernel and read-only at UVPT for user code.
    EntrySlot::new(root, pdx(VPT)).store(
        mem,
        Entry::new(root, EntryFlags::PRESENT | EntryFlags::WRITABLE),
    );
    EntrySlot::new(root, pdx(UVPT)).store(
        mem,
        Entry::new(root, EntryFlags::PRESENT | EntryFlags::USER),
    );

    // Kernel stack just below KSTACKTOP. Only the top of the window is
    // backed, the rest faults as a guard.
    let stack_pa = boot.alloc(KSTK_SIZE, PAGE_SIZE);
    map_segment(
        mem,
        &mut boot,
        root,
        KSTACKTOP.wrapping_sub(KSTK_SIZE as u32),
        KSTK_SIZE,
        stack_pa,
        EntryFlags::WRITABLE,
    );

    // All detected physical memory, linearly at KERNBASE. Mapping only what
    // is there saves a leaf table per span when large pages are absent.
    let linear_flags = if mmu.pse_enabled() {
        EntryFlags::WRITABLE | EntryFlags::LARGE
    } else {
        EntryFlags::WRITABLE
    };
    map_segment(
        mem,
        &mut boot,
        root,
        KERNBASE,
        params.memory_size,
        0,
        linear_flags,
    );

    // Frame registry, user-readable in the UPAGES window.
    let registry_bytes = npages * size_of::<FrameDescriptor>();
    let registry_pa = boot.alloc(registry_bytes, PAGE_SIZE);
    mem.zero_range(registry_pa, registry_bytes);
    let registry_mapped = clamp_window("frame registry", registry_bytes);
    map_segment(
        mem,
        &mut boot,
        root,
        UPAGES,
        registry_mapped,
        registry_pa,
        EntryFlags::USER,
    );

    // Process table, user-readable in the UPROCS window.
    let procs_bytes = NPROCS * size_of::<Process>();
    let procs_pa = boot.alloc(procs_bytes, PAGE_SIZE);
    mem.zero_range(procs_pa, procs_bytes);
    let procs_mapped = clamp_window("process table", procs_bytes);
    map_segment(
        mem,
        &mut boot,
        root,
        UPROCS,
        procs_mapped,
        procs_pa,
        EntryFlags::USER,
    );

    let record = BootRecord {
        root,
        stack_pa,
        registry_pa,
        registry_mapped,
        procs_pa,
        procs_mapped,
    };
    check::check_kernel_tables(mem, &record, params.memory_size);

    // Switch the processor onto the new tables. Execution continues on the
    // old -KERNBASE segments for a moment, so the low linear span must stay
    // translatable until the flat selectors are in place.
    let low = EntrySlot::new(root, 0);
    low.store(mem, EntrySlot::new(root, pdx(KERNBASE)).load(mem));
    mmu.load_root(root);
    mmu.enable_paging();
    assert_eq!(
        mmu.translate(mem, phys_to_kernel(root_pa)),
        Some(root_pa),
        "lost translation between paging-on and segment reload"
    );
    mmu.reload_segments();
    assert_eq!(
        mmu.translate(mem, phys_to_kernel(root_pa)),
        Some(root_pa),
        "lost translation after segment reload"
    );
    low.store(mem, Entry::empty());
    mmu.flush_tlb();
    assert_eq!(
        mmu.translate(mem, phys_to_kernel(root_pa)),
        Some(root_pa),
        "lost translation after retracting the low alias"
    );

    log::info!("paging enabled, kernel tables live in frame {root}");

    // Populate the registry and hand out everything that is not spoken
    // for: frame 0 holds firmware structures, the IO hole belongs to
    // devices, and everything from the kernel image up to the watermark
    // is the kernel itself plus the tables built above.
    let descriptors: &'mem mut [FrameDescriptor] = unsafe { mem.carve_slice(registry_pa, npages) };
    let watermark = page_round_up(boot.watermark() as usize) as PhysAddr;
    let reserved = [
        0..1,
        page_number(IO_PHYS_MEM)..page_number(EXT_PHYS_MEM),
        page_number(EXT_PHYS_MEM)..page_number(watermark),
    ];
    let frames = FrameAllocator::new(descriptors, &reserved);
    log::info!(
        "{} of {} frames free after boot",
        frames.free_frames(),
        frames.total_frames()
    );

    check::exercise_frame_ops(mem, &mut mmu, &frames, root);

    KernelVm {
        mmu,
        root,
        frames,
        record,
    }
}
