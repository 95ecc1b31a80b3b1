//! The kernel's virtual-memory core.
//!
//! This crate builds and maintains the two-level page tables that define
//! the kernel's address space: the boot-time construction of the kernel
//! window ([`boot`]), the per-page mapping primitives used afterwards
//! ([`map`]), the walk they all share ([`walk`]), and the self-checks that
//! gate turning the tables on ([`check`]).
//!
//! Hardware is represented by the [`mmu::Mmu`] model, which translates
//! addresses exactly the way the processor would (segmentation, table
//! walks, a stale-by-design TLB), so the whole bring-up sequence runs and
//! is tested without privileged instructions.
#![no_std]

#[cfg(test)]
extern crate std;

pub mod boot;
pub mod check;
pub mod layout;
pub mod map;
pub mod mmu;
pub mod proc;
pub mod table;
pub mod walk;

use thiserror_no_std::Error;

/// The error surfaced by mapping operations.
///
/// Mapping can only fail for one reason: a leaf table had to be created
/// and no frame was free to hold it. The address space is left unchanged
/// in that case.
#[derive(Debug, Error)]
pub enum MapError {
    #[error("no free frame to hold a page table")]
    OutOfFrames(#[from] frames::FrameAllocError),
}
