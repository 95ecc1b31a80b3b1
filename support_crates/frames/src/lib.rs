//! Tracking and allocation of physical page frames.
//!
//! This crate owns everything below the page-table layer: the model of
//! physical memory itself ([`PhysMemory`]), the watermark allocator that
//! carves boot-time tables out of it ([`BootAllocator`]), and the
//! steady-state free-list allocator over the per-frame registry
//! ([`FrameAllocator`]).
//!
//! The two allocators are strictly phased: [`BootAllocator`] may only be
//! used before [`FrameAllocator::new`] has populated the free list, because
//! the registry classifies every frame below the final watermark as
//! permanently reserved. Using the watermark afterwards would hand out
//! frames the free list already owns.
#![no_std]

#[cfg(test)]
extern crate std;

mod alloc;
mod boot;
mod phys;
mod registry;

pub use alloc::{DetachedFreeList, FrameAllocError, FrameAllocator};
pub use boot::BootAllocator;
pub use phys::{MemoryPage, PhysMemory, PAGE_SHIFT, PAGE_SIZE};
pub use registry::FrameDescriptor;

/// A physical address.
pub type PhysAddr = u32;

/// A physical page frame number (`PhysAddr >> PAGE_SHIFT`).
pub type Pfn = u32;

/// The frame number containing the physical address `pa`.
pub const fn page_number(pa: PhysAddr) -> Pfn {
    pa >> PAGE_SHIFT
}

/// The base physical address of frame `pfn`.
pub const fn page_addr(pfn: Pfn) -> PhysAddr {
    pfn << PAGE_SHIFT
}

/// `len` rounded up to the next whole-frame boundary.
pub const fn page_round_up(len: usize) -> usize {
    (len + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}
