//! The fixed process table.
//!
//! The memory subsystem only cares about this array's existence: it is
//! carved out of physical memory during bootstrap and mapped read-only for
//! user code in the [`UPROCS`](crate::layout::UPROCS) window, so the
//! structure has a stable layout from day one even though most fields are
//! still unused.

use frames::Pfn;

/// Fixed capacity of the process table.
pub const NPROCS: usize = 1024;

#[repr(u32)]
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum ProcState {
    #[default]
    Free,
    Runnable,
    Running,
    Zombie,
}

/// One slot of the process table.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone)]
pub struct Process {
    pub id: u32,
    pub state: ProcState,
    /// Frame holding this process' root page table.
    pub root_table: Pfn,
}
