// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-task address space: mmap/munmap, demand paging, copy-on-write, fork clone
//! OWNERS: @kernel-mm-team
//! PUBLIC API: AddressSpace::{new, mmap, munmap, handle_fault, clone_for_fork, release, copy_in, copy_out, copy_in_str}
//! DEPENDS_ON: mm::page_table, mm::vma, mm::frame (refcount table)
//! INVARIANTS: Every user leaf maps a tracked frame; COW decisions, copies and PTE rewrites run under the refcount lock
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use crate::arch::riscv::flush_tlb;
use crate::mm::frame::{copy_frame, Frames, RefTable};
use crate::mm::layout::{page_round_down, page_round_up, PAGE_SIZE, TRAMPOLINE, TRAPFRAME, VA_ANONYMOUS};
use crate::mm::page_table::{MapError, PageFlags, PageTable, Pte};
use crate::mm::vma::{Access, MapFlags, Perm, Vma, VmaSet};

/// Errors surfaced by address-space operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmError {
    /// Zero length, or neither private nor shared requested.
    InvalidArgs,
    /// Both private and shared were requested.
    ConflictingFlags,
    /// The range wraps or reaches the trapframe page.
    OutOfRange,
    /// The range overlaps an existing VMA.
    Overlap,
    /// No VMA starts at the given address.
    NotMapped,
    /// A user pointer does not name accessible memory.
    BadAddress,
    /// Frame or page-table allocation failed.
    OutOfMemory,
    /// Page-table invariant violated.
    Map(MapError),
}

impl From<MapError> for VmError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfMemory => VmError::OutOfMemory,
            other => VmError::Map(other),
        }
    }
}

/// Errors from page-fault resolution. The trap boundary treats all of them
/// as fatal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultError {
    /// No VMA covers the address.
    NoVma,
    /// The VMA (or a shared read-only page) does not allow the access.
    AccessDenied,
    /// No frame for demand allocation or COW duplication.
    OutOfMemory,
    /// Page-table invariant violated while installing the page.
    Map(MapError),
}

impl From<MapError> for FaultError {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfMemory => FaultError::OutOfMemory,
            other => FaultError::Map(other),
        }
    }
}

/// How a fault was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// A zeroed frame was mapped for a never-touched page.
    Demand,
    /// The sole owner of a COW frame had write enabled in place.
    CowInPlace,
    /// A shared COW frame was duplicated into a private one.
    CowCopied,
    /// The entry already allowed the access (another fault won the race).
    AlreadyResolved,
}

/// One task's user address space.
pub struct AddressSpace {
    table: PageTable,
    vmas: VmaSet,
    anon_next: usize,
}

impl AddressSpace {
    /// Creates an empty address space.
    pub fn new(frames: &Frames<'_>) -> Result<Self, VmError> {
        Ok(Self { table: PageTable::new(frames)?, vmas: VmaSet::new(), anon_next: 0 })
    }

    pub fn page_table(&self) -> &PageTable {
        &self.table
    }

    pub fn vmas(&self) -> &VmaSet {
        &self.vmas
    }

    pub fn satp(&self) -> usize {
        self.table.satp()
    }

    /// Maps the trap trampoline and the task's trapframe page. Neither is
    /// user accessible nor reference counted.
    pub fn map_trap_pages(
        &mut self,
        frames: &Frames<'_>,
        trampoline_pa: usize,
        trapframe_pa: usize,
    ) -> Result<(), VmError> {
        self.table.map(TRAMPOLINE, trampoline_pa, PageFlags::READ | PageFlags::EXECUTE, false, frames)?;
        self.table.map(TRAPFRAME, trapframe_pa, PageFlags::READ | PageFlags::WRITE, false, frames)?;
        Ok(())
    }

    /// Creates a VMA and returns its start address.
    ///
    /// `addr` is rounded down and the covered length up to whole pages.
    /// With `addr == 0` and no `FIXED` flag the kernel picks the next free
    /// slot of the anonymous region. `populate` backs every page eagerly.
    pub fn mmap(
        &mut self,
        frames: &Frames<'_>,
        addr: usize,
        size: usize,
        perm: Perm,
        flags: MapFlags,
        populate: bool,
    ) -> Result<usize, VmError> {
        if flags.contains(MapFlags::PRIVATE | MapFlags::SHARED) {
            return Err(VmError::ConflictingFlags);
        }
        if !flags.intersects(MapFlags::PRIVATE | MapFlags::SHARED) || size == 0 {
            return Err(VmError::InvalidArgs);
        }
        let start = page_round_down(addr);
        let end = addr.checked_add(size).ok_or(VmError::OutOfRange)?;
        if end > TRAPFRAME {
            return Err(VmError::OutOfRange);
        }
        let size = page_round_up(end) - start;
        let kernel_chosen = addr == 0 && !flags.contains(MapFlags::FIXED);
        let start = if kernel_chosen { self.place_anonymous(size)? } else { start };

        let vma = Vma { start, size, perm, flags };
        self.vmas.insert(vma).map_err(|_| VmError::Overlap)?;
        if kernel_chosen {
            self.anon_next = vma.end() - VA_ANONYMOUS;
        }
        if populate {
            if let Err(err) = self.populate(frames, &vma) {
                let mut refs = frames.refs();
                self.release_range(frames, &mut refs, &vma);
                drop(refs);
                self.vmas.remove(vma.start);
                return Err(err);
            }
        }
        Ok(start)
    }

    /// First gap of `size` bytes at or above the anonymous high-water mark,
    /// stepping over areas mapped there with `FIXED`.
    fn place_anonymous(&self, size: usize) -> Result<usize, VmError> {
        let mut chosen = VA_ANONYMOUS + self.anon_next;
        loop {
            let end = chosen.checked_add(size).filter(|&end| end <= TRAPFRAME).ok_or(VmError::OutOfRange)?;
            match self.vmas.first_overlap(chosen, end) {
                Some(blocker) => chosen = blocker.end(),
                None => return Ok(chosen),
            }
        }
    }

    fn populate(&mut self, frames: &Frames<'_>, vma: &Vma) -> Result<(), VmError> {
        let mut refs = frames.refs();
        for va in vma.pages() {
            let pa = frames.alloc_zeroed().ok_or(VmError::OutOfMemory)?;
            if let Err(err) = self.table.map(va, pa, vma.pte_flags(), false, frames) {
                frames.free(pa);
                return Err(err.into());
            }
            refs.track_new(pa);
        }
        Ok(())
    }

    /// Removes the VMA starting at `addr` and drops every page it backs.
    pub fn munmap(&mut self, frames: &Frames<'_>, addr: usize) -> Result<(), VmError> {
        let vma = *self.vmas.get(addr).ok_or(VmError::NotMapped)?;
        let mut refs = frames.refs();
        self.release_range(frames, &mut refs, &vma);
        drop(refs);
        self.vmas.remove(vma.start);
        flush_tlb();
        Ok(())
    }

    fn release_range(&mut self, frames: &Frames<'_>, refs: &mut RefTable, vma: &Vma) {
        for va in vma.pages() {
            if self.table.entry(va).is_none() {
                continue;
            }
            match self.table.unmap(va) {
                Ok(pa) => frames.drop_ref(refs, pa),
                Err(err) => panic!("munmap: unmap {:#x} failed: {:?}", va, err),
            }
        }
    }

    /// Resolves a fault at `va` for `access`.
    pub fn handle_fault(
        &mut self,
        frames: &Frames<'_>,
        va: usize,
        access: Access,
    ) -> Result<FaultOutcome, FaultError> {
        let page = page_round_down(va);
        let vma = *self.vmas.find(page).ok_or(FaultError::NoVma)?;
        if !vma.permits(access) {
            return Err(FaultError::AccessDenied);
        }

        let mut refs = frames.refs();
        let Some(pte) = self.table.entry(page) else {
            let pa = frames.alloc_zeroed().ok_or(FaultError::OutOfMemory)?;
            if let Err(err) = self.table.map(page, pa, vma.pte_flags(), false, frames) {
                frames.free(pa);
                return Err(err.into());
            }
            refs.track_new(pa);
            return Ok(FaultOutcome::Demand);
        };

        if pte_permits(pte, access) {
            return Ok(FaultOutcome::AlreadyResolved);
        }
        if access != Access::Write || pte.flags().contains(PageFlags::WRITE) {
            return Err(FaultError::AccessDenied);
        }

        let old = pte.pa();
        let flags = pte.flags() | PageFlags::WRITE;
        let outcome = if refs.count(old) == 1 {
            self.table.map(page, old, flags, true, frames)?;
            FaultOutcome::CowInPlace
        } else {
            let new = frames.alloc_zeroed().ok_or(FaultError::OutOfMemory)?;
            copy_frame(new, old);
            if let Err(err) = self.table.map(page, new, flags, true, frames) {
                frames.free(new);
                return Err(err.into());
            }
            frames.drop_ref(&mut refs, old);
            refs.track_new(new);
            FaultOutcome::CowCopied
        };
        drop(refs);
        flush_tlb();
        Ok(outcome)
    }

    /// Builds the child address space for `fork`.
    ///
    /// Every present page is shared with the child. Private VMAs lose write
    /// permission on both sides so the first write takes a COW fault;
    /// shared VMAs keep it.
    pub fn clone_for_fork(&mut self, frames: &Frames<'_>) -> Result<AddressSpace, VmError> {
        let mut child = AddressSpace::new(frames)?;
        child.anon_next = self.anon_next;
        let mut refs = frames.refs();
        let shared = self.share_into(&mut child, frames, &mut refs);
        drop(refs);
        flush_tlb();
        match shared {
            Ok(()) => Ok(child),
            Err(err) => {
                child.release(frames);
                Err(err)
            }
        }
    }

    fn share_into(
        &mut self,
        child: &mut AddressSpace,
        frames: &Frames<'_>,
        refs: &mut RefTable,
    ) -> Result<(), VmError> {
        for vma in self.vmas.iter() {
            child.vmas.insert(*vma).map_err(|_| VmError::Overlap)?;
            for va in vma.pages() {
                let Some(pte) = self.table.entry(va) else {
                    continue;
                };
                let mut flags = pte.flags();
                if !vma.is_shared() && flags.contains(PageFlags::WRITE) {
                    flags.remove(PageFlags::WRITE);
                    self.table.map(va, pte.pa(), flags, true, frames)?;
                }
                child.table.map(va, pte.pa(), flags, false, frames)?;
                refs.share(pte.pa());
            }
        }
        Ok(())
    }

    /// Tears the address space down: drops every mapped page through the
    /// refcount table, then frees the page-table pages themselves.
    pub fn release(mut self, frames: &Frames<'_>) {
        for va in [TRAMPOLINE, TRAPFRAME] {
            if self.table.entry(va).is_some() {
                if let Err(err) = self.table.unmap(va) {
                    panic!("release: trap page {:#x} mapped but not removable: {:?}", va, err);
                }
            }
        }
        let mut refs = frames.refs();
        let vmas: alloc::vec::Vec<Vma> = self.vmas.iter().copied().collect();
        for vma in &vmas {
            self.release_range(frames, &mut refs, vma);
        }
        drop(refs);
        self.table.free(frames, false);
    }

    /// Copies `src` to user memory at `dst_va`, resolving demand and COW
    /// faults inside writable VMAs first.
    pub fn copy_out(&mut self, frames: &Frames<'_>, dst_va: usize, src: &[u8]) -> Result<(), VmError> {
        self.prepare(frames, dst_va, src.len(), Access::Write)?;
        self.table.copy_out(dst_va, src).map_err(|_| VmError::BadAddress)
    }

    /// Copies user memory at `src_va` into `dst`.
    pub fn copy_in(&mut self, frames: &Frames<'_>, dst: &mut [u8], src_va: usize) -> Result<(), VmError> {
        self.prepare(frames, src_va, dst.len(), Access::Read)?;
        self.table.copy_in(dst, src_va).map_err(|_| VmError::BadAddress)
    }

    /// Copies a NUL-terminated string from `src_va`; returns its length
    /// without the terminator.
    pub fn copy_in_str(&mut self, frames: &Frames<'_>, dst: &mut [u8], src_va: usize) -> Result<usize, VmError> {
        let mut copied = 0;
        while copied < dst.len() {
            let cursor = src_va.checked_add(copied).ok_or(VmError::BadAddress)?;
            let chunk = core::cmp::min(PAGE_SIZE - (cursor - page_round_down(cursor)), dst.len() - copied);
            self.copy_in(frames, &mut dst[copied..copied + chunk], cursor)?;
            if let Some(nul) = dst[copied..copied + chunk].iter().position(|&b| b == 0) {
                return Ok(copied + nul);
            }
            copied += chunk;
        }
        Err(VmError::InvalidArgs)
    }

    /// Kernel-privileged store into pages that are already mapped.
    pub fn store(&self, dst_va: usize, src: &[u8]) -> Result<(), VmError> {
        self.table.store(dst_va, src).map_err(|_| VmError::BadAddress)
    }

    /// Valid leaf mapping `va`, if any.
    pub fn entry(&self, va: usize) -> Option<Pte> {
        self.table.entry(page_round_down(va))
    }

    fn prepare(&mut self, frames: &Frames<'_>, va: usize, len: usize, access: Access) -> Result<(), VmError> {
        if len == 0 {
            return Ok(());
        }
        let end = va.checked_add(len).ok_or(VmError::BadAddress)?;
        let mut page = page_round_down(va);
        while page < end {
            let ready = self.table.entry(page).is_some_and(|pte| {
                pte.flags().contains(PageFlags::USER) && pte_permits(pte, access)
            });
            if !ready {
                self.handle_fault(frames, page, access).map_err(|_| VmError::BadAddress)?;
            }
            page += PAGE_SIZE;
        }
        Ok(())
    }
}

fn pte_permits(pte: Pte, access: Access) -> bool {
    let needed = match access {
        Access::Read => PageFlags::READ,
        Access::Write => PageFlags::WRITE,
        Access::Exec => PageFlags::EXECUTE,
    };
    pte.flags().contains(needed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::HeapFrames;
    use proptest::prelude::*;

    const RW: Perm = Perm::READ.union(Perm::WRITE);
    const ANON_PRIVATE: MapFlags = MapFlags::PRIVATE.union(MapFlags::ANONYMOUS);

    fn read_byte(space: &mut AddressSpace, frames: &Frames<'_>, va: usize) -> u8 {
        let mut byte = [0u8; 1];
        space.copy_in(frames, &mut byte, va).unwrap();
        byte[0]
    }

    fn write_byte(space: &mut AddressSpace, frames: &Frames<'_>, va: usize, value: u8) {
        space.copy_out(frames, va, &[value]).unwrap();
    }

    #[test]
    fn anonymous_mappings_are_placed_in_the_anonymous_region() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let mut space = AddressSpace::new(&frames).unwrap();
        let a = space.mmap(&frames, 0, 2 * PAGE_SIZE, RW, ANON_PRIVATE, false).unwrap();
        let b = space.mmap(&frames, 0, 100, RW, ANON_PRIVATE, false).unwrap();
        assert_eq!(a, VA_ANONYMOUS);
        assert_eq!(b, VA_ANONYMOUS + 2 * PAGE_SIZE);
        assert_eq!(space.vmas().get(b).map(|v| v.size), Some(PAGE_SIZE));
        space.release(&frames);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn kernel_placement_steps_over_fixed_areas() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let mut space = AddressSpace::new(&frames).unwrap();
        let fixed = ANON_PRIVATE | MapFlags::FIXED;
        assert_eq!(space.mmap(&frames, VA_ANONYMOUS, 2 * PAGE_SIZE, RW, fixed, false), Ok(VA_ANONYMOUS));
        assert_eq!(
            space.mmap(&frames, VA_ANONYMOUS + 4 * PAGE_SIZE, PAGE_SIZE, RW, fixed, false),
            Ok(VA_ANONYMOUS + 4 * PAGE_SIZE)
        );

        // Two pages fit below the second fixed area; three do not.
        let a = space.mmap(&frames, 0, 2 * PAGE_SIZE, RW, ANON_PRIVATE, false).unwrap();
        assert_eq!(a, VA_ANONYMOUS + 2 * PAGE_SIZE);
        let b = space.mmap(&frames, 0, 3 * PAGE_SIZE, RW, ANON_PRIVATE, false).unwrap();
        assert_eq!(b, VA_ANONYMOUS + 5 * PAGE_SIZE);
        let c = space.mmap(&frames, 0, PAGE_SIZE, RW, ANON_PRIVATE, false).unwrap();
        assert_eq!(c, VA_ANONYMOUS + 8 * PAGE_SIZE);
        assert_eq!(space.vmas().len(), 5);
        space.release(&frames);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn fixed_zero_address_is_honoured() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let mut space = AddressSpace::new(&frames).unwrap();
        let flags = ANON_PRIVATE | MapFlags::FIXED;
        assert_eq!(space.mmap(&frames, 0, PAGE_SIZE, Perm::READ | Perm::EXEC, flags, true), Ok(0));
        assert_eq!(frames.tracked(), 1);
        space.release(&frames);
        assert_eq!(frames.tracked(), 0);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn mmap_rejects_bad_requests() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let mut space = AddressSpace::new(&frames).unwrap();
        let both = MapFlags::PRIVATE | MapFlags::SHARED;
        assert_eq!(space.mmap(&frames, 0x1000, PAGE_SIZE, RW, both, false), Err(VmError::ConflictingFlags));
        assert_eq!(space.mmap(&frames, 0x1000, PAGE_SIZE, RW, MapFlags::ANONYMOUS, false), Err(VmError::InvalidArgs));
        assert_eq!(space.mmap(&frames, 0x1000, 0, RW, ANON_PRIVATE, false), Err(VmError::InvalidArgs));
        assert_eq!(space.mmap(&frames, TRAPFRAME, PAGE_SIZE, RW, ANON_PRIVATE, false), Err(VmError::OutOfRange));
        space.mmap(&frames, 0x1000, 2 * PAGE_SIZE, RW, ANON_PRIVATE, false).unwrap();
        assert_eq!(space.mmap(&frames, 0x2000, PAGE_SIZE, RW, ANON_PRIVATE, false), Err(VmError::Overlap));
        space.release(&frames);
    }

    #[test]
    fn unaligned_request_covers_whole_pages() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let mut space = AddressSpace::new(&frames).unwrap();
        let start = space.mmap(&frames, 0x1800, 0x1000, RW, ANON_PRIVATE, false).unwrap();
        assert_eq!(start, 0x1000);
        assert_eq!(space.vmas().get(0x1000).map(|v| v.size), Some(2 * PAGE_SIZE));
        space.release(&frames);
    }

    #[test]
    fn populate_failure_rolls_back() {
        // Root table plus two intermediate tables leave room for one data frame.
        let heap = HeapFrames::with_limit(4);
        let frames = Frames::new(&heap);
        let mut space = AddressSpace::new(&frames).unwrap();
        let result = space.mmap(&frames, 0x1000, 4 * PAGE_SIZE, RW, ANON_PRIVATE, true);
        assert_eq!(result, Err(VmError::OutOfMemory));
        assert!(space.vmas().is_empty());
        assert_eq!(frames.tracked(), 0);
        space.release(&frames);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn demand_fault_then_sole_owner_write() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let mut space = AddressSpace::new(&frames).unwrap();
        let va = space.mmap(&frames, 0, 2 * PAGE_SIZE, RW, ANON_PRIVATE, false).unwrap();
        assert_eq!(space.handle_fault(&frames, va + 8, Access::Read), Ok(FaultOutcome::Demand));
        let pa = space.entry(va).unwrap().pa();
        assert_eq!(frames.ref_count(pa), 1);
        assert_eq!(space.handle_fault(&frames, va, Access::Write), Ok(FaultOutcome::AlreadyResolved));
        assert_eq!(space.entry(va).unwrap().pa(), pa);
        space.release(&frames);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn faults_outside_vmas_or_permissions_fail() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let mut space = AddressSpace::new(&frames).unwrap();
        let va = space.mmap(&frames, 0, PAGE_SIZE, Perm::READ, ANON_PRIVATE, false).unwrap();
        assert_eq!(space.handle_fault(&frames, va + PAGE_SIZE, Access::Read), Err(FaultError::NoVma));
        assert_eq!(space.handle_fault(&frames, va, Access::Write), Err(FaultError::AccessDenied));
        assert_eq!(space.handle_fault(&frames, va, Access::Exec), Err(FaultError::AccessDenied));
        space.release(&frames);
    }

    #[test]
    fn fork_scenario_isolates_parent_and_child() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let mut parent = AddressSpace::new(&frames).unwrap();
        let va = parent.mmap(&frames, 0, 2 * PAGE_SIZE, RW, ANON_PRIVATE, false).unwrap();

        assert_eq!(read_byte(&mut parent, &frames, va), 0);
        let frame = parent.entry(va).unwrap().pa();
        assert_eq!(frames.ref_count(frame), 1);
        write_byte(&mut parent, &frames, va, 0x5a);
        assert_eq!(parent.entry(va).unwrap().pa(), frame);

        let mut child = parent.clone_for_fork(&frames).unwrap();
        assert_eq!(frames.ref_count(frame), 2);
        assert!(!parent.entry(va).unwrap().flags().contains(PageFlags::WRITE));
        assert!(!child.entry(va).unwrap().flags().contains(PageFlags::WRITE));
        assert_eq!(read_byte(&mut child, &frames, va), 0x5a);

        assert_eq!(child.handle_fault(&frames, va, Access::Write), Ok(FaultOutcome::CowCopied));
        write_byte(&mut child, &frames, va, 0xa5);
        let child_frame = child.entry(va).unwrap().pa();
        assert_ne!(child_frame, frame);
        assert_eq!(frames.ref_count(frame), 1);
        assert_eq!(frames.ref_count(child_frame), 1);
        assert_eq!(read_byte(&mut parent, &frames, va), 0x5a);

        assert_eq!(parent.handle_fault(&frames, va, Access::Write), Ok(FaultOutcome::CowInPlace));
        assert_eq!(parent.entry(va).unwrap().pa(), frame);

        child.release(&frames);
        parent.release(&frames);
        assert_eq!(frames.tracked(), 0);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn shared_vmas_keep_write_and_alias() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let mut parent = AddressSpace::new(&frames).unwrap();
        let flags = MapFlags::SHARED | MapFlags::ANONYMOUS;
        let va = parent.mmap(&frames, 0, PAGE_SIZE, RW, flags, true).unwrap();
        let mut child = parent.clone_for_fork(&frames).unwrap();
        assert!(child.entry(va).unwrap().flags().contains(PageFlags::WRITE));
        write_byte(&mut child, &frames, va, 7);
        assert_eq!(read_byte(&mut parent, &frames, va), 7);
        child.release(&frames);
        parent.release(&frames);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn munmap_of_untouched_range_leaves_refcounts_alone() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let mut space = AddressSpace::new(&frames).unwrap();
        let keep = space.mmap(&frames, 0, PAGE_SIZE, RW, ANON_PRIVATE, true).unwrap();
        let lazy = space.mmap(&frames, 0, 4 * PAGE_SIZE, RW, ANON_PRIVATE, false).unwrap();
        assert_eq!(frames.tracked(), 1);
        space.munmap(&frames, lazy).unwrap();
        assert_eq!(frames.tracked(), 1);
        assert!(space.vmas().get(lazy).is_none());
        assert_eq!(space.munmap(&frames, lazy), Err(VmError::NotMapped));
        space.munmap(&frames, keep).unwrap();
        assert_eq!(frames.tracked(), 0);
        space.release(&frames);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn munmap_drops_shared_frames_once() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let mut parent = AddressSpace::new(&frames).unwrap();
        let va = parent.mmap(&frames, 0, PAGE_SIZE, RW, ANON_PRIVATE, true).unwrap();
        let frame = parent.entry(va).unwrap().pa();
        let mut child = parent.clone_for_fork(&frames).unwrap();
        parent.munmap(&frames, va).unwrap();
        assert_eq!(frames.ref_count(frame), 1);
        assert_eq!(read_byte(&mut child, &frames, va), 0);
        child.munmap(&frames, va).unwrap();
        assert_eq!(frames.ref_count(frame), 0);
        child.release(&frames);
        parent.release(&frames);
        assert_eq!(heap.live(), 0);
    }

    #[test]
    fn copy_helpers_reject_unmapped_user_pointers() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let mut space = AddressSpace::new(&frames).unwrap();
        let va = space.mmap(&frames, 0, PAGE_SIZE, Perm::READ, ANON_PRIVATE, false).unwrap();
        assert_eq!(space.copy_out(&frames, va, b"nope"), Err(VmError::BadAddress));
        assert_eq!(space.copy_out(&frames, 0x10_0000, b"nope"), Err(VmError::BadAddress));
        let mut buf = [1u8; 4];
        space.copy_in(&frames, &mut buf, va).unwrap();
        assert_eq!(buf, [0; 4]);
        space.release(&frames);
    }

    #[test]
    fn copy_in_str_stops_at_terminator() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let mut space = AddressSpace::new(&frames).unwrap();
        let va = space.mmap(&frames, 0, 2 * PAGE_SIZE, RW, ANON_PRIVATE, false).unwrap();
        let at = va + PAGE_SIZE - 3;
        space.copy_out(&frames, at, b"init\0").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(space.copy_in_str(&frames, &mut buf, at), Ok(4));
        assert_eq!(&buf[..4], b"init");
        let mut short = [0u8; 2];
        assert_eq!(space.copy_in_str(&frames, &mut short, at), Err(VmError::InvalidArgs));
        space.release(&frames);
    }

    #[test]
    fn trap_pages_are_not_reference_counted() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let mut space = AddressSpace::new(&frames).unwrap();
        let trapframe = frames.alloc_zeroed().unwrap();
        space.map_trap_pages(&frames, 0x8020_0000, trapframe).unwrap();
        assert!(space.entry(TRAMPOLINE).is_some());
        assert!(space.page_table().translate(TRAPFRAME).is_none());
        space.release(&frames);
        assert_eq!(frames.tracked(), 0);
        frames.free(trapframe);
        assert_eq!(heap.live(), 0);
    }

    fn leaf_references(spaces: &[&AddressSpace], frame: usize) -> usize {
        spaces
            .iter()
            .map(|space| {
                space
                    .vmas()
                    .iter()
                    .flat_map(|vma| vma.pages())
                    .filter(|&va| space.entry(va).is_some_and(|pte| pte.pa() == frame))
                    .count()
            })
            .sum()
    }

    #[derive(Clone, Debug)]
    enum Op {
        Touch { parent: bool, page: usize, write: bool },
        Fork,
        DropChild,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (any::<bool>(), 0usize..4, any::<bool>())
                .prop_map(|(parent, page, write)| Op::Touch { parent, page, write }),
            Just(Op::Fork),
            Just(Op::DropChild),
        ]
    }

    proptest! {
        #[test]
        fn refcounts_match_leaf_entries(ops in proptest::collection::vec(op(), 1..40)) {
            let heap = HeapFrames::new();
            let frames = Frames::new(&heap);
            let mut parent = AddressSpace::new(&frames).unwrap();
            let base = parent.mmap(&frames, 0, 4 * PAGE_SIZE, RW, ANON_PRIVATE, false).unwrap();
            let mut child: Option<AddressSpace> = None;

            for op in ops {
                match op {
                    Op::Touch { parent: on_parent, page, write } => {
                        let space = if on_parent { Some(&mut parent) } else { child.as_mut() };
                        if let Some(space) = space {
                            let va = base + page * PAGE_SIZE;
                            if write {
                                space.copy_out(&frames, va, &[page as u8]).unwrap();
                            } else {
                                let mut b = [0u8; 1];
                                space.copy_in(&frames, &mut b, va).unwrap();
                            }
                        }
                    }
                    Op::Fork => {
                        if let Some(old) = child.take() {
                            old.release(&frames);
                        }
                        child = Some(parent.clone_for_fork(&frames).unwrap());
                    }
                    Op::DropChild => {
                        if let Some(old) = child.take() {
                            old.release(&frames);
                        }
                    }
                }

                let mut spaces: alloc::vec::Vec<&AddressSpace> = alloc::vec![&parent];
                if let Some(c) = child.as_ref() {
                    spaces.push(c);
                }
                for space in &spaces {
                    for va in (0..4).map(|p| base + p * PAGE_SIZE) {
                        if let Some(pte) = space.entry(va) {
                            prop_assert_eq!(frames.ref_count(pte.pa()), leaf_references(&spaces, pte.pa()));
                        }
                    }
                }
            }

            if let Some(c) = child.take() {
                c.release(&frames);
            }
            parent.release(&frames);
            prop_assert_eq!(frames.tracked(), 0);
            prop_assert_eq!(heap.live(), 0);
        }
    }
}
