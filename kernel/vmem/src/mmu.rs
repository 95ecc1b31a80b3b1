//! Model of the processor's translation machinery: segmentation base,
//! control state and the translation cache (TLB).
//!
//! Address translation happens in two stages, `virtual -> linear` through
//! the segment base and `linear -> physical` through the page tables once
//! paging is on. The boot GDT biases every segment by `-KERNBASE`, which is
//! what lets the kernel run at its link address before any table exists;
//! [`Mmu::reload_segments`] models the far jump that replaces those
//! selectors with flat ones.
//!
//! The TLB caches completed walks and is deliberately *not* kept coherent
//! with table mutations — exactly like hardware, a changed entry keeps
//! being served until [`Mmu::invalidate`] or [`Mmu::flush_tlb`] purges it.

use crate::layout::{page_offset, pdx, ptx, VirtAddr, KERNBASE};
use crate::table::EntrySlot;
use frames::{page_addr, PhysAddr, PhysMemory, Pfn};

const TLB_ENTRIES: usize = 16;

#[derive(Debug, Copy, Clone)]
struct TlbEntry {
    /// Linear page number the cached walk started from.
    vpn: u32,
    pfn: Pfn,
}

/// A small fixed-capacity translation cache with round-robin replacement.
#[derive(Debug)]
struct Tlb {
    entries: [Option<TlbEntry>; TLB_ENTRIES],
    victim: usize,
}

impl Tlb {
    const fn new() -> Self {
        Self {
            entries: [None; TLB_ENTRIES],
            victim: 0,
        }
    }

    fn lookup(&self, vpn: u32) -> Option<Pfn> {
        self.entries
            .iter()
            .flatten()
            .find(|cached| cached.vpn == vpn)
            .map(|cached| cached.pfn)
    }

    fn insert(&mut self, vpn: u32, pfn: Pfn) {
        self.entries[self.victim] = Some(TlbEntry { vpn, pfn });
        self.victim = (self.victim + 1) % TLB_ENTRIES;
    }

    fn invalidate(&mut self, vpn: u32) {
        for slot in self.entries.iter_mut() {
            if slot.is_some_and(|cached| cached.vpn == vpn) {
                *slot = None;
            }
        }
    }

    fn flush(&mut self) {
        self.entries = [None; TLB_ENTRIES];
    }
}

/// The processor's translation state for one hardware context.
#[derive(Debug)]
pub struct Mmu {
    pse_supported: bool,
    pse_enabled: bool,
    paging_enabled: bool,
    write_protect: bool,
    seg_base: u32,
    root: Option<Pfn>,
    tlb: Tlb,
}

impl Mmu {
    /// A processor fresh out of the boot loader: paging off, segments biased
    /// by `-KERNBASE`. Large-page support is a hardware property reported by
    /// the CPU feature detection glue.
    pub fn new(pse_supported: bool) -> Self {
        Self {
            pse_supported,
            pse_enabled: false,
            paging_enabled: false,
            write_protect: false,
            seg_base: KERNBASE.wrapping_neg(),
            root: None,
            tlb: Tlb::new(),
        }
    }

    pub fn pse_supported(&self) -> bool {
        self.pse_supported
    }

    /// Turn on large-page translation (CR4.PSE).
    pub fn enable_pse(&mut self) {
        assert!(self.pse_supported, "enabling PSE on hardware without it");
        self.pse_enabled = true;
    }

    pub fn pse_enabled(&self) -> bool {
        self.pse_enabled
    }

    /// Install `root` as the active table (CR3 load). Like the hardware,
    /// this flushes the whole translation cache.
    pub fn load_root(&mut self, root: Pfn) {
        self.root = Some(root);
        self.tlb.flush();
    }

    pub fn active_root(&self) -> Option<Pfn> {
        self.root
    }

    /// Turn on paging and supervisor write-protection enforcement
    /// (CR0.PG | CR0.WP).
    pub fn enable_paging(&mut self) {
        assert!(
            self.root.is_some(),
            "enabling paging without an active root table"
        );
        self.paging_enabled = true;
        self.write_protect = true;
    }

    pub fn paging_enabled(&self) -> bool {
        self.paging_enabled
    }

    pub fn write_protect(&self) -> bool {
        self.write_protect
    }

    /// Reload all segment selectors with flat (zero-base) descriptors,
    /// including the code segment via a far jump.
    pub fn reload_segments(&mut self) {
        self.seg_base = 0;
    }

    /// Purge any cached translation for the page containing `va`.
    pub fn invalidate(&mut self, va: VirtAddr) {
        self.tlb.invalidate(self.linear(va) >> frames::PAGE_SHIFT);
    }

    pub fn flush_tlb(&mut self) {
        self.tlb.flush();
    }

    fn linear(&self, va: VirtAddr) -> u32 {
        va.wrapping_add(self.seg_base)
    }

    /// Translate `va` the way the hardware would: segmentation first, then —
    /// with paging on — the TLB or a two-level table walk whose result is
    /// cached.
    pub fn translate(&mut self, mem: &PhysMemory, va: VirtAddr) -> Option<PhysAddr> {
        let la = self.linear(va);
        if !self.paging_enabled {
            return Some(la);
        }

        let vpn = la >> frames::PAGE_SHIFT;
        let pfn = match self.tlb.lookup(vpn) {
            Some(pfn) => pfn,
            None => {
                let root = self.root.expect("paging enabled without a root table");
                let pfn = hardware_walk(mem, root, la)?;
                self.tlb.insert(vpn, pfn);
                pfn
            }
        };
        Some(page_addr(pfn) + page_offset(la) as PhysAddr)
    }
}

/// The MMU's own two-level dereference. Large entries terminate the walk at
/// the root level, translating a whole leaf-table-sized span at once.
fn hardware_walk(mem: &PhysMemory, root: Pfn, la: u32) -> Option<Pfn> {
    let pde = EntrySlot::new(root, pdx(la)).load(mem);
    if !pde.is_present() {
        return None;
    }
    if pde.is_large() {
        return Some(pde.pfn() + ptx(la) as Pfn);
    }
    let pte = EntrySlot::new(pde.pfn(), ptx(la)).load(mem);
    if !pte.is_present() {
        return None;
    }
    Some(pte.pfn())
}
