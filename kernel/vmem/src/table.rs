//! Page-table entries and the arena-indexed entry locations the rest of the
//! crate traffics in.
//!
//! A table — root or leaf — is one page frame holding
//! [`TABLE_ENTRIES`](crate::layout::TABLE_ENTRIES) packed 32-bit entries.
//! Tables are never touched through pointers; an entry is addressed by its
//! table's frame number plus its slot index ([`EntrySlot`]) and loaded or
//! stored through [`PhysMemory`].

use crate::layout::TABLE_ENTRIES;
use bitflags::bitflags;
use frames::{MemoryPage, PhysAddr, PhysMemory, Pfn, PAGE_SHIFT};
use static_assertions::{assert_eq_align, assert_eq_size};

bitflags! {
    /// The permission and type bits packed into the low bits of an [`Entry`].
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct EntryFlags: u32 {
        /// The entry translates something; clear means the slot is empty and
        /// every other bit is ignored.
        const PRESENT = 1 << 0;
        /// Writes through this translation are allowed.
        const WRITABLE = 1 << 1;
        /// User-mode accesses through this translation are allowed.
        const USER = 1 << 2;
        /// In a root slot: the entry directly translates a whole
        /// [`JPG_SIZE`](crate::layout::JPG_SIZE) span instead of pointing at
        /// a leaf table.
        const LARGE = 1 << 7;
    }
}

/// One packed root- or leaf-table slot: a frame number plus [`EntryFlags`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct Entry(u32);

assert_eq_size!([Entry; TABLE_ENTRIES], MemoryPage);
assert_eq_align!(Entry, u32);

impl Entry {
    /// An empty, non-present slot.
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(pfn: Pfn, flags: EntryFlags) -> Self {
        debug_assert!(pfn < (1 << 20), "frame number {pfn} does not fit an entry");
        Self((pfn << PAGE_SHIFT) | flags.bits())
    }

    /// The placeholder a create-large walk installs; the caller fills in the
    /// target frame afterwards.
    pub const fn large_marker() -> Self {
        Self(EntryFlags::LARGE.bits() | EntryFlags::PRESENT.bits())
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(EntryFlags::PRESENT)
    }

    pub fn is_large(self) -> bool {
        self.flags().contains(EntryFlags::LARGE)
    }

    pub fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0)
    }

    /// The frame this entry translates to (for large entries: the first
    /// frame of the span).
    pub fn pfn(self) -> Pfn {
        self.0 >> PAGE_SHIFT
    }

    /// Physical base address the entry translates to.
    pub fn addr(self) -> PhysAddr {
        self.0 & !((1 << PAGE_SHIFT) - 1)
    }
}

/// The location of one table entry: which table frame it lives in and which
/// slot it occupies.
///
/// This is what a walk returns and what mapping operations mutate. It stays
/// valid for as long as the table frame itself does.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct EntrySlot {
    table: Pfn,
    index: usize,
}

impl EntrySlot {
    pub fn new(table: Pfn, index: usize) -> Self {
        debug_assert!(index < TABLE_ENTRIES);
        Self { table, index }
    }

    /// Frame number of the table this slot belongs to.
    pub fn table(self) -> Pfn {
        self.table
    }

    pub fn index(self) -> usize {
        self.index
    }

    /// Physical address of the entry itself.
    pub fn entry_addr(self) -> PhysAddr {
        frames::page_addr(self.table) + (self.index * core::mem::size_of::<Entry>()) as PhysAddr
    }

    pub fn load(self, mem: &PhysMemory) -> Entry {
        Entry(mem.read_u32(self.entry_addr()))
    }

    pub fn store(self, mem: &mut PhysMemory, entry: Entry) {
        mem.write_u32(self.entry_addr(), entry.raw());
    }
}
