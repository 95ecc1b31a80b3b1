use crate::registry::FrameDescriptor;
use crate::Pfn;
use core::num::NonZeroU32;
use core::ops::Range;
use spin::Mutex;
use thiserror_no_std::Error;

/// The error returned when no free frame is left to allocate.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum FrameAllocError {
    #[error("all physical frames are in use")]
    OutOfFrames,
}

/// A free list temporarily detached from the allocator.
///
/// Used by the boot-time exerciser to run allocation edge cases against a
/// known, tiny pool and put everything back afterwards.
#[derive(Debug)]
pub struct DetachedFreeList {
    head: Option<NonZeroU32>,
    count: usize,
}

/// The steady-state physical frame allocator: an intrusive singly-linked
/// free list threaded through the frame registry.
///
/// `alloc`, `free`, `incref` and `decref` are the only legal mutators of
/// descriptor state once boot is over. The whole state sits behind one
/// allocator-wide lock so mapping operations may run from multiple
/// execution contexts.
#[derive(Debug)]
pub struct FrameAllocator<'mem> {
    state: Mutex<AllocState<'mem>>,
}

#[derive(Debug)]
struct AllocState<'mem> {
    descriptors: &'mem mut [FrameDescriptor],
    free_head: Option<NonZeroU32>,
    free_count: usize,
}

impl<'mem> FrameAllocator<'mem> {
    /// Build the allocator over the zeroed descriptor array and populate the
    /// free list.
    ///
    /// Frames inside any of the `reserved` ranges are marked with one
    /// bookkeeping reference and never enter the free list; everything else
    /// becomes allocatable. Frame 0 must be reserved by the caller (it backs
    /// real-mode firmware structures and serves as the free-list
    /// terminator).
    pub fn new(descriptors: &'mem mut [FrameDescriptor], reserved: &[Range<Pfn>]) -> Self {
        assert!(
            reserved.iter().any(|r| r.contains(&0)),
            "frame 0 must be reserved"
        );

        let mut state = AllocState {
            descriptors,
            free_head: None,
            free_count: 0,
        };
        let mut usable = 0;
        for pfn in 0..state.descriptors.len() as Pfn {
            if reserved.iter().any(|r| r.contains(&pfn)) {
                state.descriptors[pfn as usize].ref_count = 1;
            } else {
                state.push_free(pfn);
                usable += 1;
            }
        }
        log::debug!(
            "frame registry initialized: {} frames total, {} usable",
            state.descriptors.len(),
            usable
        );

        Self {
            state: Mutex::new(state),
        }
    }

    /// Pop a frame off the free list and return ownership of it.
    ///
    /// The returned frame's descriptor is reset (no references, no list
    /// linkage); the caller is responsible for taking a reference before the
    /// frame is reachable by anyone else.
    pub fn alloc(&self) -> Result<Pfn, FrameAllocError> {
        let mut state = self.state.lock();
        let pfn = state.free_head.ok_or(FrameAllocError::OutOfFrames)?.get();
        let next = state.descriptors[pfn as usize].free_link.take();
        state.descriptors[pfn as usize].ref_count = 0;
        state.free_head = next;
        state.free_count -= 1;
        log::trace!("allocated frame {pfn}");
        Ok(pfn)
    }

    /// Return a frame to the free list.
    ///
    /// May only be called once the frame's reference count has reached zero;
    /// anything else is a use-after-free in the making and panics.
    pub fn free(&self, pfn: Pfn) {
        self.state.lock().free_frame(pfn);
    }

    /// Record one more live reference to `pfn`.
    pub fn incref(&self, pfn: Pfn) {
        self.state.lock().descriptors[pfn as usize].ref_count += 1;
    }

    /// Drop one live reference to `pfn`, returning the frame to the free
    /// list when the last one goes away.
    pub fn decref(&self, pfn: Pfn) {
        let mut state = self.state.lock();
        let desc = &mut state.descriptors[pfn as usize];
        desc.ref_count = desc
            .ref_count
            .checked_sub(1)
            .unwrap_or_else(|| panic!("dropping a reference to frame {pfn} which has none"));
        if desc.ref_count == 0 {
            state.free_frame(pfn);
        }
    }

    pub fn ref_count(&self, pfn: Pfn) -> u32 {
        self.state.lock().descriptors[pfn as usize].ref_count
    }

    /// Number of frames currently on the free list.
    pub fn free_frames(&self) -> usize {
        self.state.lock().free_count
    }

    /// Total number of frames tracked by the registry.
    pub fn total_frames(&self) -> usize {
        self.state.lock().descriptors.len()
    }

    /// Number of frames with at least one live reference.
    pub fn referenced_frames(&self) -> usize {
        let state = self.state.lock();
        state
            .descriptors
            .iter()
            .filter(|desc| desc.ref_count > 0)
            .count()
    }

    /// Detach the whole free list, leaving the allocator empty.
    pub fn take_free_list(&self) -> DetachedFreeList {
        let mut state = self.state.lock();
        DetachedFreeList {
            head: state.free_head.take(),
            count: core::mem::replace(&mut state.free_count, 0),
        }
    }

    /// Reattach a previously detached free list.
    ///
    /// The interim list must have been drained back to empty, otherwise its
    /// frames would leak.
    pub fn restore_free_list(&self, list: DetachedFreeList) {
        let mut state = self.state.lock();
        assert!(
            state.free_head.is_none(),
            "restoring a free list over a non-empty one"
        );
        state.free_head = list.head;
        state.free_count = list.count;
    }
}

impl AllocState<'_> {
    fn push_free(&mut self, pfn: Pfn) {
        let pfn = NonZeroU32::new(pfn).expect("frame 0 is permanently reserved");
        self.descriptors[pfn.get() as usize].free_link = self.free_head;
        self.free_head = Some(pfn);
        self.free_count += 1;
    }

    fn free_frame(&mut self, pfn: Pfn) {
        let refs = self.descriptors[pfn as usize].ref_count;
        assert!(
            refs == 0,
            "freeing frame {pfn} which still has {refs} live references"
        );
        self.push_free(pfn);
        log::trace!("freed frame {pfn}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec;
    use std::vec::Vec;

    // 8 frames, frames 0..4 reserved: 4 usable.
    fn small_allocator(descriptors: &mut [FrameDescriptor]) -> FrameAllocator<'_> {
        FrameAllocator::new(descriptors, &[0..4])
    }

    fn descriptors(n: usize) -> Vec<FrameDescriptor> {
        let mut v = Vec::new();
        v.resize_with(n, FrameDescriptor::default);
        v
    }

    #[test]
    fn allocates_every_usable_frame_exactly_once() {
        let mut descs = descriptors(8);
        let alloc = small_allocator(&mut descs);
        assert_eq!(alloc.free_frames(), 4);

        let mut seen = vec![];
        for _ in 0..4 {
            let pfn = alloc.alloc().unwrap();
            assert_eq!(alloc.ref_count(pfn), 0);
            assert!(!seen.contains(&pfn), "frame {pfn} issued twice");
            assert!((4..8).contains(&pfn), "reserved frame {pfn} issued");
            seen.push(pfn);
        }
        assert_eq!(alloc.alloc(), Err(FrameAllocError::OutOfFrames));
    }

    #[test]
    fn freed_frames_are_reissued() {
        let mut descs = descriptors(8);
        let alloc = small_allocator(&mut descs);
        for _ in 0..4 {
            alloc.alloc().unwrap();
        }

        alloc.free(5);
        // LIFO reuse: the most recently freed frame comes back first.
        assert_eq!(alloc.alloc(), Ok(5));
        assert_eq!(alloc.alloc(), Err(FrameAllocError::OutOfFrames));
    }

    #[test]
    fn decref_frees_at_zero() {
        let mut descs = descriptors(8);
        let alloc = small_allocator(&mut descs);
        let pfn = alloc.alloc().unwrap();
        alloc.incref(pfn);
        alloc.incref(pfn);
        assert_eq!(alloc.ref_count(pfn), 2);

        alloc.decref(pfn);
        assert_eq!(alloc.ref_count(pfn), 1);
        assert_eq!(alloc.free_frames(), 3);

        alloc.decref(pfn);
        assert_eq!(alloc.free_frames(), 4);
    }

    #[test]
    #[should_panic(expected = "live references")]
    fn freeing_a_referenced_frame_is_fatal() {
        let mut descs = descriptors(8);
        let alloc = small_allocator(&mut descs);
        let pfn = alloc.alloc().unwrap();
        alloc.incref(pfn);
        alloc.free(pfn);
    }

    #[test]
    #[should_panic(expected = "which has none")]
    fn refcount_underflow_is_fatal() {
        let mut descs = descriptors(8);
        let alloc = small_allocator(&mut descs);
        let pfn = alloc.alloc().unwrap();
        alloc.decref(pfn);
    }

    #[test]
    fn every_frame_is_either_referenced_or_free() {
        let mut descs = descriptors(8);
        let alloc = small_allocator(&mut descs);
        let a = alloc.alloc().unwrap();
        alloc.incref(a);
        let b = alloc.alloc().unwrap();
        alloc.incref(b);

        assert_eq!(
            alloc.referenced_frames() + alloc.free_frames(),
            alloc.total_frames()
        );

        alloc.decref(b);
        assert_eq!(
            alloc.referenced_frames() + alloc.free_frames(),
            alloc.total_frames()
        );
    }

    #[test]
    fn detached_free_list_empties_and_restores_the_pool() {
        let mut descs = descriptors(8);
        let alloc = small_allocator(&mut descs);
        let list = alloc.take_free_list();
        assert_eq!(alloc.alloc(), Err(FrameAllocError::OutOfFrames));
        assert_eq!(alloc.free_frames(), 0);

        alloc.restore_free_list(list);
        assert_eq!(alloc.free_frames(), 4);
        assert!(alloc.alloc().is_ok());
    }
}
