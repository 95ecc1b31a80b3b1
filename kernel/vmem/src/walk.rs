//! The two-level table walk.
//!
//! Every mapping operation funnels through [`walk`], which descends from a
//! root table to the slot governing a virtual address. Missing intermediate
//! tables are conjured on demand from a [`TableFrameSource`], so the same
//! walk serves both the early-boot watermark phase and the steady state
//! where table frames come off the free list with live reference counts.

use crate::layout::{jumbo_offset, pdx, ptx, VirtAddr};
use crate::table::{Entry, EntryFlags, EntrySlot};
use crate::MapError;
use frames::{page_addr, page_number, BootAllocator, FrameAllocator, PhysMemory, Pfn, PAGE_SIZE};

/// What [`walk`] is allowed to do when the root slot for an address is empty.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CreateMode {
    /// Report the miss instead of touching the tables.
    NoCreate,
    /// Allocate and wire up a zeroed leaf table.
    Create,
    /// Reserve the root slot for a large mapping covering the whole span.
    CreateJumbo,
}

/// Where the walk gets frames for new leaf tables from.
///
/// Implementors hand back the frame number of a page that is zeroed and
/// dedicated to table use, with whatever bookkeeping their phase requires
/// already done.
pub trait TableFrameSource {
    fn alloc_table_frame(&mut self, mem: &mut PhysMemory) -> Result<Pfn, MapError>;
}

/// Boot-phase source backed by the watermark allocator.
///
/// Exhaustion during boot is unrecoverable, so this source never returns
/// an error; it panics inside [`BootAllocator::alloc`] instead.
pub struct BootFrameSource<'a> {
    pub alloc: &'a mut BootAllocator,
}

impl TableFrameSource for BootFrameSource<'_> {
    fn alloc_table_frame(&mut self, mem: &mut PhysMemory) -> Result<Pfn, MapError> {
        let pa = self.alloc.alloc(PAGE_SIZE, PAGE_SIZE);
        mem.zero_range(pa, PAGE_SIZE);
        Ok(page_number(pa))
    }
}

/// Steady-state source backed by the frame allocator's free list.
///
/// Table frames are pinned with one reference for the slot in the root
/// table that points at them.
pub struct RuntimeFrameSource<'a, 'mem> {
    pub frames: &'a FrameAllocator<'mem>,
}

impl TableFrameSource for RuntimeFrameSource<'_, '_> {
    fn alloc_table_frame(&mut self, mem: &mut PhysMemory) -> Result<Pfn, MapError> {
        let pfn = self.frames.alloc()?;
        self.frames.incref(pfn);
        mem.zero_range(page_addr(pfn), PAGE_SIZE);
        Ok(pfn)
    }
}

/// Read-only descent: the slot governing `va`, if the table hierarchy for
/// it already exists.
///
/// A present large entry terminates the descent at the root level and the
/// root slot itself is returned. Otherwise the result addresses the leaf
/// slot, which may or may not hold a present entry.
pub fn find_slot(mem: &PhysMemory, root: Pfn, va: VirtAddr) -> Option<EntrySlot> {
    let root_slot = EntrySlot::new(root, pdx(va));
    let pde = root_slot.load(mem);
    if !pde.is_present() {
        return None;
    }
    if pde.is_large() {
        return Some(root_slot);
    }
    Some(EntrySlot::new(pde.pfn(), ptx(va)))
}

/// Descend from `root` to the entry slot that governs `va`, materializing
/// missing intermediate state according to `mode`.
///
/// `Ok(None)` is only possible with [`CreateMode::NoCreate`]. Creating a
/// jumbo slot at an address that is not aligned to the span a root slot
/// covers is a bug in the caller and panics.
pub fn walk<S: TableFrameSource>(
    mem: &mut PhysMemory,
    root: Pfn,
    va: VirtAddr,
    mode: CreateMode,
    source: &mut S,
) -> Result<Option<EntrySlot>, MapError> {
    if let Some(slot) = find_slot(mem, root, va) {
        return Ok(Some(slot));
    }

    let root_slot = EntrySlot::new(root, pdx(va));
    match mode {
        CreateMode::NoCreate => Ok(None),
        CreateMode::CreateJumbo => {
            assert_eq!(
                jumbo_offset(va),
                0,
                "large mapping requested at unaligned address {va:#010x}"
            );
            root_slot.store(mem, Entry::large_marker());
            Ok(Some(root_slot))
        }
        CreateMode::Create => {
            let table = source.alloc_table_frame(mem)?;
            root_slot.store(
                mem,
                Entry::new(
                    table,
                    EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::USER,
                ),
            );
            Ok(Some(EntrySlot::new(table, ptx(va))))
        }
    }
}
