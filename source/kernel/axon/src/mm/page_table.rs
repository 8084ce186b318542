// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page-table implementation with lazy allocation of intermediate levels.
//!
//! Table pages and mapped frames are identity mapped, so a physical address
//! doubles as a kernel pointer. Every table page comes from [`Frames`] and is
//! returned there by [`PageTable::free`].

use bitflags::bitflags;

use crate::arch::riscv::make_satp;
use crate::mm::frame::Frames;
use crate::mm::layout::{is_page_aligned, page_round_down, MAXVA, PAGE_SHIFT, PAGE_SIZE};

/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
    }
}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    Unaligned,
    /// Address lies at or above `MAXVA`.
    OutOfRange,
    /// Flags do not describe a valid leaf entry.
    InvalidFlags,
    /// A valid leaf already exists and remapping was not requested.
    AlreadyMapped,
    /// No valid leaf covers the address.
    NotMapped,
    /// The leaf lacks a permission the access needs.
    PermissionDenied,
    /// No frame was available for an intermediate table.
    OutOfMemory,
}

/// One Sv39 page-table entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(usize);

impl Pte {
    pub const fn new(pa: usize, flags: PageFlags) -> Self {
        Self(((pa >> PAGE_SHIFT) << 10) | flags.bits())
    }

    pub const fn bits(self) -> usize {
        self.0
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & 0xff)
    }

    /// Physical address of the frame or next-level table.
    pub const fn pa(self) -> usize {
        (self.0 >> 10) << PAGE_SHIFT
    }

    pub fn is_valid(self) -> bool {
        self.flags().contains(PageFlags::VALID)
    }

    /// Intermediate entries are valid with no R/W/X bit.
    pub fn is_leaf(self) -> bool {
        self.is_valid() && self.flags().intersects(LEAF_PERMS)
    }
}

/// Three-level Sv39 page table.
pub struct PageTable {
    root: usize,
}

impl PageTable {
    /// Creates an empty table with a fresh root page.
    pub fn new(frames: &Frames<'_>) -> Result<Self, MapError> {
        let root = frames.alloc_zeroed().ok_or(MapError::OutOfMemory)?;
        Ok(Self { root })
    }

    /// Physical address of the root page.
    pub fn root_pa(&self) -> usize {
        self.root
    }

    /// `satp` value activating this table.
    pub fn satp(&self) -> usize {
        make_satp(self.root)
    }

    /// Returns the leaf slot for `va`, allocating intermediate tables from
    /// `alloc` when given.
    pub fn walk(&mut self, va: usize, alloc: Option<&Frames<'_>>) -> Result<&mut Pte, MapError> {
        if va >= MAXVA {
            return Err(MapError::OutOfRange);
        }
        let mut table = self.root;
        for level in [2, 1] {
            // SAFETY: `table` is a live table page owned by this page table.
            let slot = unsafe { &mut *slot_ptr(table, vpn(va, level)) };
            if slot.is_valid() {
                if slot.is_leaf() {
                    // Superpages are never created by this kernel.
                    return Err(MapError::InvalidFlags);
                }
                table = slot.pa();
                continue;
            }
            let frames = alloc.ok_or(MapError::NotMapped)?;
            let page = frames.alloc_zeroed().ok_or(MapError::OutOfMemory)?;
            *slot = Pte::new(page, PageFlags::VALID);
            table = page;
        }
        // SAFETY: `table` is the live level-0 page for `va`.
        Ok(unsafe { &mut *slot_ptr(table, vpn(va, 0)) })
    }

    /// Returns the valid leaf mapping `va`, if any.
    pub fn entry(&self, va: usize) -> Option<Pte> {
        if va >= MAXVA {
            return None;
        }
        let mut table = self.root;
        for level in [2, 1] {
            // SAFETY: `table` is a live table page owned by this page table.
            let pte = unsafe { *slot_ptr(table, vpn(va, level)) };
            if !pte.is_valid() || pte.is_leaf() {
                return None;
            }
            table = pte.pa();
        }
        // SAFETY: `table` is the live level-0 page for `va`.
        let pte = unsafe { *slot_ptr(table, vpn(va, 0)) };
        pte.is_leaf().then_some(pte)
    }

    /// Installs a leaf mapping `va -> pa`. A valid entry is only replaced
    /// when `remap` is set.
    pub fn map(
        &mut self,
        va: usize,
        pa: usize,
        flags: PageFlags,
        remap: bool,
        frames: &Frames<'_>,
    ) -> Result<(), MapError> {
        if !is_page_aligned(va) || !is_page_aligned(pa) {
            return Err(MapError::Unaligned);
        }
        if !flags.intersects(LEAF_PERMS)
            || (flags.contains(PageFlags::WRITE) && !flags.contains(PageFlags::READ))
        {
            return Err(MapError::InvalidFlags);
        }
        let slot = self.walk(va, Some(frames))?;
        if slot.is_valid() && !remap {
            return Err(MapError::AlreadyMapped);
        }
        *slot = Pte::new(pa, flags | PageFlags::VALID);
        Ok(())
    }

    /// Maps `size` bytes starting at `va` to the contiguous range at `pa`.
    pub fn map_range(
        &mut self,
        va: usize,
        pa: usize,
        size: usize,
        flags: PageFlags,
        frames: &Frames<'_>,
    ) -> Result<(), MapError> {
        if !is_page_aligned(va) || !is_page_aligned(pa) || !is_page_aligned(size) {
            return Err(MapError::Unaligned);
        }
        for offset in (0..size).step_by(PAGE_SIZE) {
            self.map(va + offset, pa + offset, flags, false, frames)?;
        }
        Ok(())
    }

    /// Clears the leaf mapping `va` and returns the frame it pointed at.
    pub fn unmap(&mut self, va: usize) -> Result<usize, MapError> {
        if !is_page_aligned(va) {
            return Err(MapError::Unaligned);
        }
        let slot = self.walk(va, None)?;
        if !slot.is_leaf() {
            return Err(MapError::NotMapped);
        }
        let pa = slot.pa();
        *slot = Pte(0);
        Ok(pa)
    }

    /// Translates a user virtual address; kernel-only pages do not resolve.
    pub fn translate(&self, va: usize) -> Option<usize> {
        let pte = self.entry(page_round_down(va))?;
        if !pte.flags().contains(PageFlags::USER) {
            return None;
        }
        Some(pte.pa() + (va - page_round_down(va)))
    }

    /// Frees every table page; leaf frames too when `do_free_frames`.
    pub fn free(self, frames: &Frames<'_>, do_free_frames: bool) {
        free_level(self.root, 2, frames, do_free_frames);
    }

    /// Copies `src` to user virtual address `dst_va`. Every page touched
    /// must be a valid user-writable leaf.
    pub fn copy_out(&self, dst_va: usize, src: &[u8]) -> Result<(), MapError> {
        self.transfer(dst_va, src.len(), PageFlags::USER | PageFlags::WRITE, |pa, done, n| {
            // SAFETY: `pa..pa + n` lies inside one identity-mapped user frame.
            unsafe { core::ptr::copy_nonoverlapping(src[done..].as_ptr(), pa as *mut u8, n) };
        })
    }

    /// Copies from user virtual address `src_va` into `dst`. Every page
    /// touched must be a valid user-readable leaf.
    pub fn copy_in(&self, dst: &mut [u8], src_va: usize) -> Result<(), MapError> {
        let len = dst.len();
        self.transfer(src_va, len, PageFlags::USER | PageFlags::READ, |pa, done, n| {
            // SAFETY: `pa..pa + n` lies inside one identity-mapped user frame.
            unsafe { core::ptr::copy_nonoverlapping(pa as *const u8, dst[done..].as_mut_ptr(), n) };
        })
    }

    /// Kernel-privileged store used while building an image: only requires
    /// valid leaves, ignoring user permissions.
    pub fn store(&self, dst_va: usize, src: &[u8]) -> Result<(), MapError> {
        self.transfer(dst_va, src.len(), PageFlags::VALID, |pa, done, n| {
            // SAFETY: `pa..pa + n` lies inside one identity-mapped frame.
            unsafe { core::ptr::copy_nonoverlapping(src[done..].as_ptr(), pa as *mut u8, n) };
        })
    }

    fn transfer(
        &self,
        va: usize,
        len: usize,
        required: PageFlags,
        mut chunk: impl FnMut(usize, usize, usize),
    ) -> Result<(), MapError> {
        let mut done = 0;
        while done < len {
            let cursor = va.checked_add(done).ok_or(MapError::OutOfRange)?;
            let page = page_round_down(cursor);
            let pte = self.entry(page).ok_or(MapError::NotMapped)?;
            if !pte.flags().contains(required) {
                return Err(MapError::PermissionDenied);
            }
            let offset = cursor - page;
            let n = core::cmp::min(PAGE_SIZE - offset, len - done);
            chunk(pte.pa() + offset, done, n);
            done += n;
        }
        Ok(())
    }
}

fn free_level(table: usize, level: usize, frames: &Frames<'_>, do_free_frames: bool) {
    for index in 0..PT_ENTRIES {
        // SAFETY: `table` is a live table page owned by the table being freed.
        let pte = unsafe { *slot_ptr(table, index) };
        if !pte.is_valid() {
            continue;
        }
        if pte.is_leaf() {
            if do_free_frames {
                frames.free(pte.pa());
            }
        } else if level > 0 {
            free_level(pte.pa(), level - 1, frames, do_free_frames);
        }
    }
    frames.free(table);
}

#[inline]
fn vpn(va: usize, level: usize) -> usize {
    (va >> (PAGE_SHIFT + 9 * level)) & (PT_ENTRIES - 1)
}

#[inline]
fn slot_ptr(table: usize, index: usize) -> *mut Pte {
    (table as *mut Pte).wrapping_add(index)
}
