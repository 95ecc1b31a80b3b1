use crate::{page_number, PhysAddr};
use core::ops::{Deref, DerefMut};

/// Number of address bits covered by the in-page offset.
pub const PAGE_SHIFT: usize = 12;

/// How large each physical page frame is.
///
/// This affects the alignment and size of every structure that occupies a
/// whole frame, most importantly the page tables.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// A slice of bytes that is exactly one page frame large and aligned to it
/// as well.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(C, align(4096))]
pub struct MemoryPage([u8; PAGE_SIZE]);

impl Deref for MemoryPage {
    type Target = [u8; PAGE_SIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for MemoryPage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Default for MemoryPage {
    fn default() -> Self {
        Self([0u8; PAGE_SIZE])
    }
}

/// The machine's physical memory, addressed by [`PhysAddr`] and divided into
/// page frames.
///
/// Every consumer of physical memory goes through this one object: the
/// page-table layer reads and writes table entries through the word
/// accessors, the boot path zeroes freshly carved ranges through
/// [`zero_range`](PhysMemory::zero_range), and the fixed kernel arrays
/// (frame registry, process table) are carved out once via
/// [`carve_slice`](PhysMemory::carve_slice). Keeping all access keyed by
/// physical address avoids any raw-pointer walking of the table hierarchy.
#[derive(Debug)]
pub struct PhysMemory<'mem> {
    backing: &'mem mut [MemoryPage],
}

impl<'mem> PhysMemory<'mem> {
    pub fn new(backing: &'mem mut [MemoryPage]) -> Self {
        Self { backing }
    }

    /// Number of page frames this memory contains.
    pub fn frames(&self) -> usize {
        self.backing.len()
    }

    /// Detected memory size in bytes (one past the highest physical address).
    pub fn size(&self) -> usize {
        self.backing.len() * PAGE_SIZE
    }

    /// Whether `[pa, pa + len)` lies entirely inside physical memory.
    pub fn contains(&self, pa: PhysAddr, len: usize) -> bool {
        (pa as usize).checked_add(len).is_some_and(|end| end <= self.size())
    }

    fn split(&self, pa: PhysAddr) -> (usize, usize) {
        assert!(
            self.contains(pa, 1),
            "physical address {pa:#x} is beyond the end of memory ({:#x})",
            self.size()
        );
        (page_number(pa) as usize, pa as usize & (PAGE_SIZE - 1))
    }

    pub fn read_u32(&self, pa: PhysAddr) -> u32 {
        assert_eq!(pa % 4, 0, "unaligned word read at {pa:#x}");
        let (frame, offset) = self.split(pa);
        let b = &self.backing[frame][offset..offset + 4];
        u32::from_ne_bytes([b[0], b[1], b[2], b[3]])
    }

    pub fn write_u32(&mut self, pa: PhysAddr, value: u32) {
        assert_eq!(pa % 4, 0, "unaligned word write at {pa:#x}");
        let (frame, offset) = self.split(pa);
        self.backing[frame][offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    pub fn read_u8(&self, pa: PhysAddr) -> u8 {
        let (frame, offset) = self.split(pa);
        self.backing[frame][offset]
    }

    pub fn write_u8(&mut self, pa: PhysAddr, value: u8) {
        let (frame, offset) = self.split(pa);
        self.backing[frame][offset] = value;
    }

    /// Zero the byte range `[pa, pa + len)`.
    pub fn zero_range(&mut self, pa: PhysAddr, len: usize) {
        assert!(self.contains(pa, len));
        let mut remaining = len;
        let mut cursor = pa;
        while remaining > 0 {
            let (frame, offset) = self.split(cursor);
            let chunk = remaining.min(PAGE_SIZE - offset);
            self.backing[frame][offset..offset + chunk].fill(0);
            cursor += chunk as PhysAddr;
            remaining -= chunk;
        }
    }

    /// Reinterpret the byte range starting at `pa` as a slice of `len`
    /// values of `T`, borrowed for the whole lifetime of the backing memory.
    ///
    /// This is how the boot path turns the raw pages it carved with the
    /// watermark allocator into the typed kernel arrays (frame registry,
    /// process table).
    ///
    /// # Safety
    /// Rust aliasing rules allow only one mutable view of the backing
    /// memory, but this hands out a second one. The caller must guarantee
    /// that the carved range is dedicated to the returned slice from now on
    /// and is never again accessed through the [`PhysMemory`] accessors,
    /// that the range holds a valid bit pattern for `T` (zeroed via
    /// [`zero_range`](PhysMemory::zero_range) beforehand, for the types used
    /// here), and that `pa` is aligned for `T`.
    pub unsafe fn carve_slice<T>(&mut self, pa: PhysAddr, len: usize) -> &'mem mut [T] {
        assert!(self.contains(pa, len * core::mem::size_of::<T>()));
        assert_eq!(pa as usize % core::mem::align_of::<T>(), 0);
        let base = self.backing.as_mut_ptr().cast::<u8>().add(pa as usize);
        core::slice::from_raw_parts_mut(base.cast::<T>(), len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;

    fn memory_of(frames: usize) -> std::vec::Vec<MemoryPage> {
        vec![MemoryPage::default(); frames]
    }

    #[test]
    fn word_accessors_round_trip() {
        let mut backing = memory_of(2);
        let mut mem = PhysMemory::new(&mut backing);
        mem.write_u32(0x1ffc, 0xdead_beef);
        assert_eq!(mem.read_u32(0x1ffc), 0xdead_beef);
        assert_eq!(mem.read_u8(0x1ffc), 0xdead_beef_u32.to_ne_bytes()[0]);
    }

    #[test]
    fn zero_range_spans_frames() {
        let mut backing = memory_of(3);
        let mut mem = PhysMemory::new(&mut backing);
        for pa in (0..mem.size() as PhysAddr).step_by(4) {
            mem.write_u32(pa, u32::MAX);
        }
        mem.zero_range(0x0ffc, 0x1008);
        assert_eq!(mem.read_u32(0x0ff8), u32::MAX);
        assert_eq!(mem.read_u32(0x0ffc), 0);
        assert_eq!(mem.read_u32(0x2000), 0);
        assert_eq!(mem.read_u32(0x2004), u32::MAX);
    }

    #[test]
    fn memory_is_debug_printable() {
        let mut backing = memory_of(1);
        let mem = PhysMemory::new(&mut backing);
        assert!(std::format!("{mem:?}").starts_with("PhysMemory"));
    }

    #[test]
    #[should_panic(expected = "beyond the end of memory")]
    fn out_of_range_access_is_fatal() {
        let mut backing = memory_of(1);
        let mem = PhysMemory::new(&mut backing);
        mem.read_u32(PAGE_SIZE as PhysAddr);
    }

    #[test]
    fn carved_slice_sees_writes_made_before_the_carve() {
        let mut backing = memory_of(2);
        let mut mem = PhysMemory::new(&mut backing);
        mem.zero_range(0x1000, PAGE_SIZE);
        mem.write_u32(0x1000, 7);
        let words: &mut [u32] = unsafe { mem.carve_slice(0x1000, 4) };
        assert_eq!(words, &[7, 0, 0, 0]);
    }
}
