use crate::PhysAddr;

/// The watermark allocator that hands out physical memory before the frame
/// registry and free list exist.
///
/// It only ever advances a pointer starting at the end of the kernel image
/// and never frees. It is used to carve out the initial page tables, the
/// frame registry itself and the other fixed kernel arrays; afterwards
/// [`FrameAllocator::new`](crate::FrameAllocator::new) takes over and the
/// watermark must not be touched again. That ordering is a convention, not a
/// runtime check: the registry treats everything below the final
/// [`watermark`](BootAllocator::watermark) as permanently reserved, so a
/// late watermark allocation would collide with free-list frames.
///
/// Returned memory is not initialized; callers zero it themselves.
#[derive(Debug)]
pub struct BootAllocator {
    next: PhysAddr,
    limit: PhysAddr,
}

impl BootAllocator {
    /// `kernel_end` is the first physical address past the kernel image,
    /// `memory_size` the detected amount of physical memory in bytes.
    pub fn new(kernel_end: PhysAddr, memory_size: usize) -> Self {
        Self {
            next: kernel_end,
            limit: memory_size as PhysAddr,
        }
    }

    /// Allocate `n` bytes aligned to an `align`-byte boundary and return
    /// their physical address.
    ///
    /// Running past the end of physical memory this early is unrecoverable
    /// and panics.
    pub fn alloc(&mut self, n: usize, align: usize) -> PhysAddr {
        assert!(align.is_power_of_two(), "alignment must be a power of two");

        let aligned = (self.next + (align as PhysAddr - 1)) & !(align as PhysAddr - 1);
        let end = aligned
            .checked_add(n as PhysAddr)
            .filter(|&end| end <= self.limit)
            .unwrap_or_else(|| {
                panic!(
                    "out of physical memory in early boot: {n:#x} bytes requested at {aligned:#x}, memory ends at {:#x}",
                    self.limit
                )
            });

        self.next = end;
        log::trace!("boot-allocated {n:#x} bytes at {aligned:#x}");
        aligned
    }

    /// First physical address not yet handed out.
    pub fn watermark(&self) -> PhysAddr {
        self.next
    }

    /// One past the highest physical address detected at boot.
    pub fn ceiling(&self) -> PhysAddr {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PAGE_SIZE;

    #[test]
    fn watermark_advances_monotonically_with_alignment() {
        let mut boot = BootAllocator::new(0x10_1234, 4 * 1024 * 1024);
        let a = boot.alloc(16, 4);
        assert_eq!(a, 0x10_1234);
        let b = boot.alloc(PAGE_SIZE, PAGE_SIZE);
        assert_eq!(b, 0x10_2000);
        let c = boot.alloc(1, 1);
        assert_eq!(c, 0x10_3000);
        assert_eq!(boot.watermark(), 0x10_3001);
    }

    #[test]
    #[should_panic(expected = "out of physical memory in early boot")]
    fn exhaustion_is_fatal() {
        let mut boot = BootAllocator::new(0, 2 * PAGE_SIZE);
        boot.alloc(PAGE_SIZE, PAGE_SIZE);
        boot.alloc(2 * PAGE_SIZE, PAGE_SIZE);
    }
}
