//! Per-page mapping operations on an address space.
//!
//! These are the steady-state primitives: frames come from the
//! [`FrameAllocator`] free list, every present leaf entry holds one
//! reference on its target frame, and any mutation of the active address
//! space shoots down the affected translation.

use crate::layout::VirtAddr;
use crate::mmu::Mmu;
use crate::table::{Entry, EntryFlags, EntrySlot};
use crate::walk::{find_slot, walk, CreateMode, RuntimeFrameSource};
use crate::MapError;
use frames::{FrameAllocator, PhysMemory, Pfn};

/// Shoot down the cached translation for `va`, but only when the mutated
/// tables are the ones the processor is actually using.
pub fn invalidate(mmu: &mut Mmu, root: Pfn, va: VirtAddr) {
    if mmu.active_root() == Some(root) {
        mmu.invalidate(va);
    }
}

/// Map the frame `pfn` at `va` with `flags`, replacing whatever mapping was
/// there before.
///
/// On success the entry is present with the requested flags and the frame
/// carries one additional reference for it. Fails only when a missing leaf
/// table cannot be allocated, in which case the address space is unchanged.
pub fn map(
    mem: &mut PhysMemory,
    frames: &FrameAllocator,
    mmu: &mut Mmu,
    root: Pfn,
    pfn: Pfn,
    va: VirtAddr,
    flags: EntryFlags,
) -> Result<(), MapError> {
    let mut source = RuntimeFrameSource { frames };
    let slot = walk(mem, root, va, CreateMode::Create, &mut source)?
        .expect("create-mode walk cannot miss");
    let old = slot.load(mem);
    assert!(
        !old.is_large(),
        "mapping a page inside a large mapping at {va:#010x}"
    );

    // Take the new reference before tearing down the old mapping, so that
    // remapping a frame onto the address it already occupies does not
    // bounce its count through zero and release it mid-operation.
    frames.incref(pfn);
    if old.is_present() {
        unmap(mem, frames, mmu, root, va);
    }
    slot.store(mem, Entry::new(pfn, flags | EntryFlags::PRESENT));
    Ok(())
}

/// Remove the mapping at `va`, if any, dropping the mapped frame's
/// reference and shooting down the translation.
pub fn unmap(
    mem: &mut PhysMemory,
    frames: &FrameAllocator,
    mmu: &mut Mmu,
    root: Pfn,
    va: VirtAddr,
) {
    let Some(slot) = find_slot(mem, root, va) else {
        return;
    };
    let entry = slot.load(mem);
    if !entry.is_present() {
        return;
    }
    assert!(
        !entry.is_large(),
        "unmapping a page inside a large mapping at {va:#010x}"
    );
    frames.decref(entry.pfn());
    slot.store(mem, Entry::empty());
    invalidate(mmu, root, va);
}

/// The frame mapped at `va` together with the flags granting access to it,
/// or `None` when nothing is mapped there.
///
/// For an address inside a large mapping this reports the first frame of
/// the span; [`Mmu::translate`] is the place for per-address resolution.
pub fn lookup(mem: &PhysMemory, root: Pfn, va: VirtAddr) -> Option<(Pfn, EntryFlags)> {
    let slot = find_slot(mem, root, va)?;
    let entry = slot.load(mem);
    if !entry.is_present() {
        return None;
    }
    Some((entry.pfn(), entry.flags()))
}

/// Check that a user-supplied buffer `[va, va + len)` may be accessed with
/// `perm`.
///
/// TODO: walk the tables and fault on missing permissions once user fault
/// handling lands; until then every range is accepted.
pub fn check_user_access(
    _mem: &PhysMemory,
    _root: Pfn,
    _va: VirtAddr,
    _len: usize,
    _perm: EntryFlags,
) -> Result<(), MapError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{pdx, JPG_SIZE};
    use frames::{FrameDescriptor, MemoryPage, PAGE_SIZE};

    struct Fixture {
        backing: std::vec::Vec<MemoryPage>,
        descriptors: std::vec::Vec<FrameDescriptor>,
    }

    impl Fixture {
        fn new(frames: usize) -> Self {
            Self {
                backing: std::vec![MemoryPage::default(); frames],
                descriptors: (0..frames).map(|_| FrameDescriptor::default()).collect(),
            }
        }
    }

    const ROOT: Pfn = 1;

    #[test]
    fn map_then_lookup_round_trips() {
        let mut fx = Fixture::new(8);
        let mut mem = PhysMemory::new(&mut fx.backing);
        let frames = FrameAllocator::new(&mut fx.descriptors, &[0..2]);
        let mut mmu = Mmu::new(false);

        let pfn = frames.alloc().unwrap();
        map(
            &mut mem,
            &frames,
            &mut mmu,
            ROOT,
            pfn,
            0x1000,
            EntryFlags::WRITABLE,
        )
        .unwrap();

        let (found, flags) = lookup(&mem, ROOT, 0x1000).unwrap();
        assert_eq!(found, pfn);
        assert!(flags.contains(EntryFlags::PRESENT | EntryFlags::WRITABLE));
        assert!(!flags.contains(EntryFlags::USER));
        assert_eq!(frames.ref_count(pfn), 1);
        assert!(lookup(&mem, ROOT, 0x2000).is_none());
    }

    #[test]
    fn remapping_the_same_frame_in_place_keeps_it_alive() {
        let mut fx = Fixture::new(8);
        let mut mem = PhysMemory::new(&mut fx.backing);
        let frames = FrameAllocator::new(&mut fx.descriptors, &[0..2]);
        let mut mmu = Mmu::new(false);

        let pfn = frames.alloc().unwrap();
        map(&mut mem, &frames, &mut mmu, ROOT, pfn, 0x1000, EntryFlags::empty()).unwrap();
        map(
            &mut mem,
            &frames,
            &mut mmu,
            ROOT,
            pfn,
            0x1000,
            EntryFlags::USER,
        )
        .unwrap();

        assert_eq!(frames.ref_count(pfn), 1);
        let (_, flags) = lookup(&mem, ROOT, 0x1000).unwrap();
        assert!(flags.contains(EntryFlags::USER));
    }

    #[test]
    fn mapping_over_an_existing_page_releases_it() {
        let mut fx = Fixture::new(8);
        let mut mem = PhysMemory::new(&mut fx.backing);
        let frames = FrameAllocator::new(&mut fx.descriptors, &[0..2]);
        let mut mmu = Mmu::new(false);

        let first = frames.alloc().unwrap();
        let second = frames.alloc().unwrap();
        map(&mut mem, &frames, &mut mmu, ROOT, first, 0x1000, EntryFlags::empty()).unwrap();
        map(&mut mem, &frames, &mut mmu, ROOT, second, 0x1000, EntryFlags::empty()).unwrap();

        assert_eq!(frames.ref_count(first), 0);
        assert_eq!(frames.ref_count(second), 1);
        assert_eq!(lookup(&mem, ROOT, 0x1000).unwrap().0, second);
    }

    #[test]
    fn unmap_drops_the_reference_and_clears_the_slot() {
        let mut fx = Fixture::new(8);
        let mut mem = PhysMemory::new(&mut fx.backing);
        let frames = FrameAllocator::new(&mut fx.descriptors, &[0..2]);
        let mut mmu = Mmu::new(false);

        let pfn = frames.alloc().unwrap();
        let free_before = frames.free_frames();
        map(&mut mem, &frames, &mut mmu, ROOT, pfn, 0x1000, EntryFlags::empty()).unwrap();
        unmap(&mut mem, &frames, &mut mmu, ROOT, 0x1000);

        assert!(lookup(&mem, ROOT, 0x1000).is_none());
        assert_eq!(frames.ref_count(pfn), 0);
        // The frame went back on the free list, the leaf table stayed.
        assert_eq!(frames.free_frames(), free_before);
        // Unmapping an unmapped address is a no-op.
        unmap(&mut mem, &frames, &mut mmu, ROOT, 0x1000);
        unmap(&mut mem, &frames, &mut mmu, ROOT, 0x7000_0000);
    }

    #[test]
    fn lookup_reports_the_first_frame_of_a_large_mapping() {
        let mut fx = Fixture::new(8);
        let mut mem = PhysMemory::new(&mut fx.backing);
        let va = JPG_SIZE as VirtAddr;
        let span_start: Pfn = (JPG_SIZE / PAGE_SIZE) as Pfn;
        EntrySlot::new(ROOT, pdx(va)).store(
            &mut mem,
            Entry::new(
                span_start,
                EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::LARGE,
            ),
        );

        // Anywhere in the span resolves to the span itself.
        let (pfn, flags) = lookup(&mem, ROOT, va + 5 * PAGE_SIZE as u32).unwrap();
        assert_eq!(pfn, span_start);
        assert!(flags.contains(EntryFlags::LARGE));
        assert_eq!(lookup(&mem, ROOT, va).unwrap().0, span_start);
    }

    #[test]
    fn mutations_only_shoot_down_the_active_address_space() {
        let mut fx = Fixture::new(8);
        let mut mem = PhysMemory::new(&mut fx.backing);
        let frames = FrameAllocator::new(&mut fx.descriptors, &[0..2]);
        let mut mmu = Mmu::new(false);
        mmu.reload_segments();

        let pfn = frames.alloc().unwrap();
        map(&mut mem, &frames, &mut mmu, ROOT, pfn, 0x1000, EntryFlags::empty()).unwrap();
        mmu.load_root(ROOT);
        mmu.enable_paging();

        let pa = mmu.translate(&mem, 0x1000).unwrap();

        // Tearing down a *different* root must leave our TLB alone.
        let other: Pfn = frames.alloc().unwrap();
        unmap(&mut mem, &frames, &mut mmu, other, 0x1000);
        assert_eq!(mmu.translate(&mem, 0x1000), Some(pa));

        // Tearing down the active root shoots the translation down.
        unmap(&mut mem, &frames, &mut mmu, ROOT, 0x1000);
        assert_eq!(mmu.translate(&mem, 0x1000), None);
    }
}
