// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual memory: Sv39 tables, frame reference counts, VMAs and the COW address-space engine
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Host unit + property tests (refcounts vs. leaf entries), boot selftests (COW)
//! PUBLIC API: FRAMES, AddressSpace, PageTable, Frames, mmap(), munmap(), handle_page_fault()
//! DEPENDS_ON: sync::SpinLock, sched::with_current (current-task entry points)
//! INVARIANTS: Every user leaf is counted exactly once in FRAMES; kernel tables and trap pages are never counted
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod address_space;
pub mod frame;
pub mod kernel;
pub mod layout;
pub mod page_table;
pub mod vma;

pub use address_space::{AddressSpace, FaultError, FaultOutcome, VmError};
pub use frame::{FrameAllocator, Frames, HeapFrames};
pub use layout::PAGE_SIZE;
pub use page_table::{MapError, PageFlags, PageTable};
pub use vma::{Access, MapFlags, Perm};

use crate::sched;

static KERNEL_FRAMES: HeapFrames = HeapFrames::new();

/// Frame source and reference-count table shared by every address space.
pub static FRAMES: Frames<'static> = Frames::new(&KERNEL_FRAMES);

/// Maps a region into the current task's address space.
pub fn mmap(addr: usize, size: usize, perm: Perm, flags: MapFlags, populate: bool) -> Result<usize, VmError> {
    sched::with_current(|_, data| match data.space.as_mut() {
        Some(space) => space.mmap(&FRAMES, addr, size, perm, flags, populate),
        None => Err(VmError::BadAddress),
    })
}

/// Unmaps the region of the current task starting at `addr`.
pub fn munmap(addr: usize) -> Result<(), VmError> {
    sched::with_current(|_, data| match data.space.as_mut() {
        Some(space) => space.munmap(&FRAMES, addr),
        None => Err(VmError::NotMapped),
    })
}

/// Resolves a user page fault of the current task.
pub fn handle_page_fault(va: usize, access: Access) -> Result<FaultOutcome, FaultError> {
    sched::with_current(|_, data| match data.space.as_mut() {
        Some(space) => space.handle_fault(&FRAMES, va, access),
        None => Err(FaultError::NoVma),
    })
}
