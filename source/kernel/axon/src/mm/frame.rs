// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame source and the global frame reference-count table
//! OWNERS: @kernel-mm-team
//! PUBLIC API: FrameAllocator, HeapFrames, Frames::{alloc_zeroed, free, refs, drop_ref}, RefTable
//! DEPENDS_ON: alloc::alloc (frame source), sync::SpinLock
//! INVARIANTS: A tracked frame's count equals the leaf PTEs mapping it; the frame is freed exactly once, when the count reaches zero
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::alloc::{alloc, dealloc, Layout};
use alloc::collections::BTreeMap;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::mm::layout::PAGE_SIZE;
use crate::sync::{SpinLock, SpinLockGuard};

/// Source of raw physical frames.
///
/// Implementations must be callable while the caller holds unrelated
/// kernel locks; they never call back into the VM engine.
pub trait FrameAllocator: Sync {
    /// Returns the physical address of an unused, page-aligned frame.
    fn alloc_page(&self) -> Option<usize>;
    /// Returns a frame previously handed out by `alloc_page`.
    fn free_page(&self, pa: usize);
}

/// Frame source carved out of the kernel heap.
///
/// The kernel runs identity mapped, so a page-aligned heap block is a
/// physical frame. `limit` caps the number of live frames so exhaustion
/// paths can be exercised.
pub struct HeapFrames {
    live: AtomicUsize,
    limit: usize,
}

impl HeapFrames {
    pub const fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    pub const fn with_limit(limit: usize) -> Self {
        Self { live: AtomicUsize::new(0), limit }
    }

    /// Frames currently handed out.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn layout() -> Layout {
        match Layout::from_size_align(PAGE_SIZE, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("frame layout"),
        }
    }
}

impl Default for HeapFrames {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for HeapFrames {
    fn alloc_page(&self) -> Option<usize> {
        let limit = self.limit;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                if live < limit {
                    Some(live + 1)
                } else {
                    None
                }
            })
            .ok()?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc(Self::layout()) };
        if ptr.is_null() {
            self.live.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(ptr as usize)
    }

    fn free_page(&self, pa: usize) {
        if pa % PAGE_SIZE != 0 || pa == 0 {
            panic!("free_page: bad frame {:#x}", pa);
        }
        // SAFETY: `pa` came from `alloc_page` with the same layout.
        unsafe { dealloc(pa as *mut u8, Self::layout()) };
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Reference counts of frames mapped into user address spaces.
#[derive(Debug, Default)]
pub struct RefTable {
    counts: BTreeMap<usize, usize>,
}

impl RefTable {
    pub const fn new() -> Self {
        Self { counts: BTreeMap::new() }
    }

    /// Mapping references to `pa`; zero when untracked.
    pub fn count(&self, pa: usize) -> usize {
        self.counts.get(&pa).copied().unwrap_or(0)
    }

    /// Starts tracking a freshly mapped frame with one reference.
    pub fn track_new(&mut self, pa: usize) {
        if self.counts.insert(pa, 1).is_some() {
            panic!("refcount: frame {:#x} already tracked", pa);
        }
    }

    /// Adds a reference for an additional mapping of `pa`.
    pub fn share(&mut self, pa: usize) {
        match self.counts.get_mut(&pa) {
            Some(count) => *count += 1,
            None => panic!("refcount: share of untracked frame {:#x}", pa),
        }
    }

    /// Drops one reference; returns `true` when it was the last one and the
    /// entry is gone.
    #[must_use]
    pub fn release(&mut self, pa: usize) -> bool {
        let Some(count) = self.counts.get_mut(&pa) else {
            panic!("refcount: release of untracked frame {:#x}", pa);
        };
        *count -= 1;
        if *count == 0 {
            self.counts.remove(&pa);
            true
        } else {
            false
        }
    }

    /// Number of tracked frames.
    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// Frame source plus the global reference-count table.
pub struct Frames<'a> {
    source: &'a dyn FrameAllocator,
    refs: SpinLock<RefTable>,
}

impl<'a> Frames<'a> {
    pub const fn new(source: &'a dyn FrameAllocator) -> Self {
        Self { source, refs: SpinLock::new("frame_refs", RefTable::new()) }
    }

    /// Allocates a frame and fills it with zeroes.
    pub fn alloc_zeroed(&self) -> Option<usize> {
        let pa = self.source.alloc_page()?;
        // SAFETY: the frame is identity mapped, page sized and unused.
        unsafe { core::ptr::write_bytes(pa as *mut u8, 0, PAGE_SIZE) };
        Some(pa)
    }

    /// Releases a frame that is not reference counted (page-table pages,
    /// trapframes).
    pub fn free(&self, pa: usize) {
        self.source.free_page(pa);
    }

    /// Locks the reference-count table.
    pub fn refs(&self) -> SpinLockGuard<'_, RefTable> {
        self.refs.lock()
    }

    /// Drops one mapping reference and frees the frame with the last one.
    pub fn drop_ref(&self, refs: &mut RefTable, pa: usize) {
        if refs.release(pa) {
            self.source.free_page(pa);
        }
    }

    /// Snapshot of one frame's count.
    pub fn ref_count(&self, pa: usize) -> usize {
        self.refs.lock().count(pa)
    }

    /// Snapshot of the number of tracked frames.
    pub fn tracked(&self) -> usize {
        self.refs.lock().len()
    }
}

/// Copies one page of frame contents.
pub fn copy_frame(dst: usize, src: usize) {
    // SAFETY: both frames are identity mapped, page sized and distinct.
    unsafe { core::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, PAGE_SIZE) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_frames_are_page_aligned_and_counted() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let a = frames.alloc_zeroed().unwrap();
        let b = frames.alloc_zeroed().unwrap();
        assert_eq!(a % PAGE_SIZE, 0);
        assert_ne!(a, b);
        assert_eq!(heap.live(), 2);
        frames.free(a);
        frames.free(b);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn limit_reports_exhaustion() {
        let heap = HeapFrames::with_limit(1);
        let frames = Frames::new(&heap);
        let a = frames.alloc_zeroed().unwrap();
        assert!(frames.alloc_zeroed().is_none());
        frames.free(a);
        assert!(frames.alloc_zeroed().map(|pa| frames.free(pa)).is_some());
    }

    #[test]
    fn last_reference_frees_the_frame() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let pa = frames.alloc_zeroed().unwrap();
        {
            let mut refs = frames.refs();
            refs.track_new(pa);
            refs.share(pa);
            assert_eq!(refs.count(pa), 2);
            frames.drop_ref(&mut refs, pa);
            assert_eq!(heap.live(), 1);
            frames.drop_ref(&mut refs, pa);
        }
        assert_eq!(heap.live(), 0);
        assert_eq!(frames.ref_count(pa), 0);
        assert_eq!(frames.tracked(), 0);
    }

    #[test]
    #[should_panic(expected = "untracked")]
    fn releasing_an_untracked_frame_is_fatal() {
        let mut refs = RefTable::new();
        let _ = refs.release(0x8000_0000);
    }

    #[test]
    fn zeroed_frames_are_zero() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let pa = frames.alloc_zeroed().unwrap();
        // SAFETY: test owns the frame.
        let bytes = unsafe { core::slice::from_raw_parts(pa as *const u8, PAGE_SIZE) };
        assert!(bytes.iter().all(|&b| b == 0));
        frames.free(pa);
    }
}
