//! The fixed virtual memory layout.
//!
//! # Virtual Address Regions
//!
//! The 32-bit virtual address space is partitioned by a handful of
//! compile-time watermarks:
//!
//! | VAddr Start  | VAddr End    | Size   | Usage |
//! | :----------- | :----------- | :----: | ----- |
//! | `0x00000000` | `0xBEBFFFFF` | ~3 GB  | user read/write memory |
//! | | | | **User read-only kernel structures** |
//! | `0xBEC00000` | `0xBEFFFFFF` | 4 MB   | process table (`UPROCS`) |
//! | `0xBF000000` | `0xBF3FFFFF` | 4 MB   | frame registry (`UPAGES`) |
//! | `0xBF400000` | `0xBF7FFFFF` | 4 MB   | read-only reflective window (`UVPT`) |
//! | | | | **Kernel-only memory** |
//! | `0xBF800000` | `0xBFBFFFFF` | 4 MB   | read-write reflective window (`VPT`) |
//! | `0xBFFF8000` | `0xBFFFFFFF` | 32 KB  | kernel stack |
//! | `0xC0000000` | end of RAM   |        | all physical memory, offset by `KERNBASE` |
//!
//! ## Reasoning
//!
//! - Exposing the frame registry and process table read-only below `ULIM`
//!   lets user code inspect them without a system call.
//! - The two reflective windows map the root table into itself so that any
//!   table entry is addressable as ordinary memory; the kernel gets a
//!   writable window, user code a read-only one.
//! - Everything at or above `ULIM` is reachable by the kernel alone.

use frames::{PhysAddr, PAGE_SHIFT, PAGE_SIZE};

/// A virtual (post-segmentation: linear) address.
pub type VirtAddr = u32;

/// Number of entries in a root or leaf table.
pub const TABLE_ENTRIES: usize = 1024;

/// Bytes of virtual address space translated by one leaf table (and by one
/// large-page entry).
pub const PT_SIZE: usize = TABLE_ENTRIES * PAGE_SIZE;

/// Size of a large ("jumbo") page.
pub const JPG_SIZE: usize = PT_SIZE;

/// All physical memory is mapped at this offset for the kernel.
pub const KERNBASE: VirtAddr = 0xC000_0000;

/// Top of the kernel stack mapping.
pub const KSTACKTOP: VirtAddr = KERNBASE;

/// Bytes of kernel stack that are backed by frames; the rest of the stack's
/// leaf-table window stays unmapped and faults on overflow.
pub const KSTK_SIZE: usize = 8 * PAGE_SIZE;

/// Read-write reflective window: the root slot `pdx(VPT)` maps the root
/// table itself.
pub const VPT: VirtAddr = 0xBF80_0000;

/// User code may not access any address at or above this.
pub const ULIM: VirtAddr = VPT;

/// Read-only reflective window (same self-map, user-readable).
pub const UVPT: VirtAddr = 0xBF40_0000;

/// User-read-only mapping of the frame registry.
pub const UPAGES: VirtAddr = 0xBF00_0000;

/// User-read-only mapping of the process table.
pub const UPROCS: VirtAddr = 0xBEC0_0000;

/// Top of the user-writable address space.
pub const UTOP: VirtAddr = UPROCS;

/// Physical address of the legacy IO hole; frames from here up to
/// [`EXT_PHYS_MEM`] are never allocatable.
pub const IO_PHYS_MEM: PhysAddr = 0x000A_0000;

/// Physical address where extended memory (and the kernel image) begins.
pub const EXT_PHYS_MEM: PhysAddr = 0x0010_0000;

/// Index into the root table for virtual address `va`.
pub const fn pdx(va: VirtAddr) -> usize {
    (va as usize >> (PAGE_SHIFT + 10)) & (TABLE_ENTRIES - 1)
}

/// Index into a leaf table for virtual address `va`.
pub const fn ptx(va: VirtAddr) -> usize {
    (va as usize >> PAGE_SHIFT) & (TABLE_ENTRIES - 1)
}

/// Offset of `va` within its page.
pub const fn page_offset(va: VirtAddr) -> usize {
    va as usize & (PAGE_SIZE - 1)
}

/// Offset of `va` within its large page.
pub const fn jumbo_offset(va: VirtAddr) -> usize {
    va as usize & (JPG_SIZE - 1)
}

/// Translate a physical address into its kernel-mapped virtual alias.
pub const fn phys_to_kernel(pa: PhysAddr) -> VirtAddr {
    pa.wrapping_add(KERNBASE)
}

/// Translate a kernel-mapped virtual address back to its physical address.
pub const fn kernel_to_phys(va: VirtAddr) -> PhysAddr {
    va.wrapping_sub(KERNBASE)
}
