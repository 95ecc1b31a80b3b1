use core::num::NonZeroU32;

/// Bookkeeping for one physical page frame, indexed by frame number.
///
/// The whole descriptor array is carved out of physical memory once at boot,
/// zero-initialized, and never resized. All-zero bytes are deliberately a
/// valid descriptor: an unreferenced frame that is not linked onto the free
/// list yet.
///
/// Invariant: a frame is on the free list iff `ref_count == 0`; a frame with
/// live references is never on the list and never handed out again.
#[derive(Debug, Default)]
#[repr(C)]
pub struct FrameDescriptor {
    /// Number of live translations (plus boot-time reservations) pointing at
    /// this frame.
    pub(crate) ref_count: u32,
    /// Next frame on the free list while this one is resident there.
    ///
    /// Frame 0 is permanently reserved and never free, so frame number 0
    /// doubles as the list terminator niche.
    pub(crate) free_link: Option<NonZeroU32>,
}

impl FrameDescriptor {
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }
}
