//! Boot-time self checks.
//!
//! [`check_kernel_tables`] re-derives every translation the bootstrap is
//! supposed to have established, using its own from-scratch walk rather
//! than the production one, and panics on the first mismatch. It gates the
//! paging-enable transition: a bad table is a fatal bring-up bug, not a
//! recoverable condition.
//!
//! [`exercise_frame_ops`] drives the frame allocator and the mapping
//! primitives through their edge cases on the live address space, with the
//! free list temporarily stolen so exhaustion paths actually fire.

use crate::boot::BootRecord;
use crate::layout::{
    jumbo_offset, page_offset, pdx, ptx, VirtAddr, KERNBASE, KSTACKTOP, KSTK_SIZE, TABLE_ENTRIES,
    ULIM, UPAGES, UPROCS, UTOP, UVPT, VPT,
};
use crate::map::{map, unmap};
use crate::mmu::Mmu;
use crate::table::{Entry, EntryFlags, EntrySlot};
use frames::{page_addr, FrameAllocError, FrameAllocator, PhysAddr, PhysMemory, Pfn, PAGE_SIZE};

/// Independent re-derivation of the physical address `va` translates to,
/// or `None` when it does not translate.
fn va2pa(mem: &PhysMemory, root: Pfn, va: VirtAddr) -> Option<PhysAddr> {
    let pde = EntrySlot::new(root, pdx(va)).load(mem);
    if !pde.is_present() {
        return None;
    }
    if pde.is_large() {
        return Some(pde.addr() + jumbo_offset(va) as PhysAddr);
    }
    let pte = EntrySlot::new(pde.pfn(), ptx(va)).load(mem);
    if !pte.is_present() {
        return None;
    }
    Some(pte.addr() + page_offset(va) as PhysAddr)
}

/// Effective access permissions at `va`, combining both table levels.
///
/// For a two-level translation the access bits are the conjunction of the
/// levels, while the large-page bit survives from either one. The latter
/// matters when a table is viewed as data through a self-map and its
/// entries reappear at the leaf level.
fn va_perms(mem: &PhysMemory, root: Pfn, va: VirtAddr) -> Option<EntryFlags> {
    let pde = EntrySlot::new(root, pdx(va)).load(mem);
    if !pde.is_present() {
        return None;
    }
    if pde.is_large() {
        return Some(pde.flags());
    }
    let pte = EntrySlot::new(pde.pfn(), ptx(va)).load(mem);
    if !pte.is_present() {
        return None;
    }
    Some((pde.flags() & pte.flags()) | ((pde.flags() | pte.flags()) & EntryFlags::LARGE))
}

/// Verify the freshly built kernel tables against everything the bootstrap
/// promises. `maxpa` is the amount of physical memory the linear kernel
/// window must reach.
pub fn check_kernel_tables(mem: &PhysMemory, record: &BootRecord, maxpa: usize) {
    let root = record.root;
    let root_pa = page_addr(root);

    // Both self-maps point back at the root, writable for the kernel and
    // read-only for user code respectively.
    let vpt = EntrySlot::new(root, pdx(VPT)).load(mem);
    assert_eq!(vpt.addr(), root_pa, "VPT self-map does not target the root");
    assert!(vpt.flags().contains(EntryFlags::PRESENT | EntryFlags::WRITABLE));
    assert!(!vpt.flags().contains(EntryFlags::USER));
    let uvpt = EntrySlot::new(root, pdx(UVPT)).load(mem);
    assert_eq!(uvpt.addr(), root_pa, "UVPT self-map does not target the root");
    assert!(uvpt.flags().contains(EntryFlags::PRESENT | EntryFlags::USER));
    assert!(!uvpt.flags().contains(EntryFlags::WRITABLE));

    // The user-visible windows map their backing arrays contiguously.
    for off in (0..record.registry_mapped).step_by(PAGE_SIZE) {
        assert_eq!(
            va2pa(mem, root, UPAGES + off as u32),
            Some(record.registry_pa + off as u32),
            "frame registry window broken at offset {off:#x}"
        );
    }
    for off in (0..record.procs_mapped).step_by(PAGE_SIZE) {
        assert_eq!(
            va2pa(mem, root, UPROCS + off as u32),
            Some(record.procs_pa + off as u32),
            "process table window broken at offset {off:#x}"
        );
    }

    // The linear kernel window reaches every frame of physical memory.
    for off in (0..maxpa).step_by(PAGE_SIZE) {
        assert_eq!(
            va2pa(mem, root, KERNBASE.wrapping_add(off as u32)),
            Some(off as PhysAddr),
            "kernel window broken at offset {off:#x}"
        );
    }

    // The stack is backed at the top of its window, with a guard below.
    let stack_base = KSTACKTOP.wrapping_sub(KSTK_SIZE as u32);
    for off in (0..KSTK_SIZE).step_by(PAGE_SIZE) {
        assert_eq!(
            va2pa(mem, root, stack_base.wrapping_add(off as u32)),
            Some(record.stack_pa + off as u32),
            "kernel stack broken at offset {off:#x}"
        );
    }
    assert_eq!(
        va2pa(mem, root, stack_base.wrapping_sub(PAGE_SIZE as u32)),
        None,
        "stack guard page is mapped"
    );

    // Every root slot is accounted for: the five fixed windows, the linear
    // span covering detected memory, nothing else.
    let last_linear_slot = pdx(KERNBASE.wrapping_add(maxpa as u32 - 1));
    for i in 0..TABLE_ENTRIES {
        let present = EntrySlot::new(root, i).load(mem).is_present();
        let expected = i == pdx(VPT)
            || i == pdx(UVPT)
            || i == pdx(UPAGES)
            || i == pdx(UPROCS)
            || i == pdx(KSTACKTOP.wrapping_sub(1))
            || (i >= pdx(KERNBASE) && i <= last_linear_slot);
        assert_eq!(present, expected, "unexpected state of root slot {i:#x}");
    }

    // Permission sweep. Two addresses are special: each self-map window
    // contains one page that views the *other* self-map's root entry, whose
    // combined permissions grant neither user access nor writes.
    let uvpt_view_of_vpt = UVPT + (pdx(VPT) * PAGE_SIZE) as u32;
    let vpt_view_of_uvpt = VPT.wrapping_add((pdx(UVPT) * PAGE_SIZE) as u32);

    for page in (UTOP as u64..ULIM as u64).step_by(PAGE_SIZE) {
        let va = page as VirtAddr;
        let Some(perm) = va_perms(mem, root, va) else {
            continue;
        };
        if perm.contains(EntryFlags::LARGE) || va == uvpt_view_of_vpt {
            assert!(
                !perm.contains(EntryFlags::USER) && !perm.contains(EntryFlags::WRITABLE),
                "kernel-only view leaked to user at {va:#010x}"
            );
        } else {
            assert!(perm.contains(EntryFlags::USER), "user window page not user-visible at {va:#010x}");
            assert!(!perm.contains(EntryFlags::WRITABLE), "user-writable page at {va:#010x}");
        }
    }
    for page in (ULIM as u64..KERNBASE as u64 + maxpa as u64).step_by(PAGE_SIZE) {
        let va = page as VirtAddr;
        let Some(perm) = va_perms(mem, root, va) else {
            continue;
        };
        if va == vpt_view_of_uvpt {
            assert!(
                !perm.contains(EntryFlags::USER) && !perm.contains(EntryFlags::WRITABLE),
                "self-map cross view mispermissioned at {va:#010x}"
            );
        } else {
            assert!(!perm.contains(EntryFlags::USER), "user-visible kernel page at {va:#010x}");
            assert!(perm.contains(EntryFlags::WRITABLE), "read-only kernel page at {va:#010x}");
        }
    }

    log::info!("kernel table check passed");
}

/// Drive allocator and mapping edge cases against the live address space.
///
/// Needs at least three free frames. The free list is stolen for the
/// duration so that exhaustion behavior is actually exercised, and every
/// frame is returned before the function ends.
pub fn exercise_frame_ops(
    mem: &mut PhysMemory,
    mmu: &mut Mmu,
    frames: &FrameAllocator,
    root: Pfn,
) {
    let free_before = frames.free_frames();
    let low_va: VirtAddr = 0;
    let next_va: VirtAddr = PAGE_SIZE as u32;

    let pp0 = frames.alloc().expect("self-test needs three free frames");
    let pp1 = frames.alloc().expect("self-test needs three free frames");
    let pp2 = frames.alloc().expect("self-test needs three free frames");
    assert!(pp0 != pp1 && pp1 != pp2 && pp0 != pp2);

    let stash = frames.take_free_list();
    assert_eq!(frames.alloc(), Err(FrameAllocError::OutOfFrames));

    // No leaf table covers the low window and no frame is free to build
    // one, so mapping must fail without side effects.
    assert!(map(mem, frames, mmu, root, pp1, low_va, EntryFlags::empty()).is_err());
    assert_eq!(frames.ref_count(pp1), 0);

    // Freeing pp0 hands the walk exactly one frame for the leaf table.
    frames.free(pp0);
    map(mem, frames, mmu, root, pp1, low_va, EntryFlags::empty())
        .expect("freed frame must serve as the leaf table");
    assert_eq!(va2pa(mem, root, low_va), Some(page_addr(pp1)));
    assert_eq!(frames.ref_count(pp0), 1);
    assert_eq!(frames.ref_count(pp1), 1);

    map(mem, frames, mmu, root, pp2, next_va, EntryFlags::empty())
        .expect("second page shares the leaf table");
    assert_eq!(va2pa(mem, root, next_va), Some(page_addr(pp2)));
    assert_eq!(frames.ref_count(pp2), 1);
    assert_eq!(frames.alloc(), Err(FrameAllocError::OutOfFrames));

    // Remapping a frame onto the address it already occupies must not
    // release it through a transient zero count.
    map(mem, frames, mmu, root, pp2, next_va, EntryFlags::empty())
        .expect("in-place remap");
    assert_eq!(frames.ref_count(pp2), 1);
    assert_eq!(frames.alloc(), Err(FrameAllocError::OutOfFrames));

    // Replacing pp2 drops its last reference and recycles it.
    map(mem, frames, mmu, root, pp1, next_va, EntryFlags::empty())
        .expect("replacement map");
    assert_eq!(va2pa(mem, root, low_va), Some(page_addr(pp1)));
    assert_eq!(va2pa(mem, root, next_va), Some(page_addr(pp1)));
    assert_eq!(frames.ref_count(pp1), 2);
    assert_eq!(frames.ref_count(pp2), 0);
    assert_eq!(frames.alloc(), Ok(pp2));

    unmap(mem, frames, mmu, root, low_va);
    assert_eq!(va2pa(mem, root, low_va), None);
    assert_eq!(va2pa(mem, root, next_va), Some(page_addr(pp1)));
    assert_eq!(frames.ref_count(pp1), 1);

    unmap(mem, frames, mmu, root, next_va);
    assert_eq!(va2pa(mem, root, next_va), None);
    assert_eq!(frames.ref_count(pp1), 0);

    // Retire the leaf table that was built from pp0.
    let low_slot = EntrySlot::new(root, pdx(low_va));
    assert_eq!(low_slot.load(mem).pfn(), pp0);
    low_slot.store(mem, Entry::empty());
    frames.decref(pp0);

    // Drain what the battery freed, then put the real list back.
    let a = frames.alloc().expect("first recycled frame");
    let b = frames.alloc().expect("second recycled frame");
    assert_eq!(frames.alloc(), Err(FrameAllocError::OutOfFrames));
    assert!((a == pp0 && b == pp1) || (a == pp1 && b == pp0));
    frames.restore_free_list(stash);
    frames.free(a);
    frames.free(b);
    frames.free(pp2);
    assert_eq!(frames.free_frames(), free_before);

    log::info!("frame op self-test passed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::{init, BootParams};
    use frames::{page_number, MemoryPage};

    #[test]
    fn va2pa_resolves_both_mapping_sizes() {
        let mut backing = std::vec![MemoryPage::default(); 8];
        let mut mem = PhysMemory::new(&mut backing);
        let small_va: VirtAddr = 0x40_2000;
        let large_va: VirtAddr = 0x80_0000;
        EntrySlot::new(0, pdx(small_va)).store(&mut mem, Entry::new(1, EntryFlags::PRESENT));
        EntrySlot::new(1, ptx(small_va)).store(&mut mem, Entry::new(3, EntryFlags::PRESENT));
        EntrySlot::new(0, pdx(large_va)).store(
            &mut mem,
            Entry::new(0, EntryFlags::PRESENT | EntryFlags::LARGE),
        );

        assert_eq!(va2pa(&mem, 0, small_va + 0x42), Some(0x3042));
        assert_eq!(va2pa(&mem, 0, large_va + 0x5042), Some(0x5042));
        assert_eq!(va2pa(&mem, 0, 0xC00_0000), None);
    }

    #[test]
    fn va_perms_combines_both_levels() {
        let mut backing = std::vec![MemoryPage::default(); 8];
        let mut mem = PhysMemory::new(&mut backing);
        let va: VirtAddr = 0x40_0000;
        EntrySlot::new(0, pdx(va)).store(
            &mut mem,
            Entry::new(1, EntryFlags::PRESENT | EntryFlags::USER),
        );
        // Writable at the leaf only: the conjunction denies the write.
        EntrySlot::new(1, ptx(va)).store(
            &mut mem,
            Entry::new(
                3,
                EntryFlags::PRESENT | EntryFlags::USER | EntryFlags::WRITABLE,
            ),
        );

        let perm = va_perms(&mem, 0, va).unwrap();
        assert!(perm.contains(EntryFlags::USER));
        assert!(!perm.contains(EntryFlags::WRITABLE));
    }

    #[test]
    fn va_perms_keeps_the_large_bit_from_either_level() {
        let mut backing = std::vec![MemoryPage::default(); 8];
        let mut mem = PhysMemory::new(&mut backing);
        let va: VirtAddr = 0x40_0000;
        // A self-map style view: the leaf entry is itself a large entry.
        EntrySlot::new(0, pdx(va)).store(
            &mut mem,
            Entry::new(1, EntryFlags::PRESENT | EntryFlags::USER),
        );
        EntrySlot::new(1, ptx(va)).store(
            &mut mem,
            Entry::new(
                0x400,
                EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::LARGE,
            ),
        );

        let perm = va_perms(&mem, 0, va).unwrap();
        assert!(perm.contains(EntryFlags::LARGE));
        assert!(!perm.contains(EntryFlags::USER));
        assert!(!perm.contains(EntryFlags::WRITABLE));
    }

    #[test]
    #[should_panic(expected = "leaked to user")]
    fn checker_rejects_user_visible_kernel_memory() {
        let memory = 4 * 1024 * 1024;
        let mut backing = std::vec![MemoryPage::default(); memory / PAGE_SIZE];
        let mut mem = PhysMemory::new(&mut backing);
        let vm = init(
            &mut mem,
            BootParams {
                memory_size: memory,
                kernel_end: 0x0011_0000,
                pse_supported: true,
            },
        );

        // Grant user access to one large kernel entry behind the checker's
        // back, then re-run it.
        let slot = EntrySlot::new(vm.root, pdx(KERNBASE));
        let entry = slot.load(&mem);
        slot.store(
            &mut mem,
            Entry::new(
                page_number(entry.addr()),
                entry.flags() | EntryFlags::USER,
            ),
        );
        check_kernel_tables(&mem, &vm.record, memory);
    }
}
