// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual memory areas and the per-address-space ordered VMA set
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Perm, MapFlags, Vma, VmaSet::{insert, get, find, remove, iter}
//! DEPENDS_ON: bitflags, alloc::collections::BTreeMap
//! INVARIANTS: VMAs are page aligned, non-empty and pairwise disjoint; keyed by start
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::collections::BTreeMap;

use bitflags::bitflags;

use crate::mm::layout::PAGE_SIZE;
use crate::mm::page_table::PageFlags;

bitflags! {
    /// Access permissions requested by `mmap`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Perm: usize {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags! {
    /// Mapping flags accepted by `mmap`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapFlags: usize {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        /// Use `addr` verbatim, even when it is zero.
        const FIXED = 0x10;
        const ANONYMOUS = 0x20;
    }
}

/// Kind of access that caused a fault or that a copy needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Exec,
}

/// One contiguous mapped range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Vma {
    pub start: usize,
    pub size: usize,
    pub perm: Perm,
    pub flags: MapFlags,
}

impl Vma {
    pub fn end(&self) -> usize {
        self.start + self.size
    }

    pub fn contains(&self, va: usize) -> bool {
        self.start <= va && va < self.end()
    }

    pub fn is_shared(&self) -> bool {
        self.flags.contains(MapFlags::SHARED)
    }

    pub fn permits(&self, access: Access) -> bool {
        match access {
            Access::Read => self.perm.contains(Perm::READ),
            Access::Write => self.perm.contains(Perm::WRITE),
            Access::Exec => self.perm.contains(Perm::EXEC),
        }
    }

    /// Leaf flags for pages of this VMA. Write implies read in Sv39.
    pub fn pte_flags(&self) -> PageFlags {
        let mut flags = PageFlags::USER;
        if self.perm.intersects(Perm::READ | Perm::WRITE) {
            flags |= PageFlags::READ;
        }
        if self.perm.contains(Perm::WRITE) {
            flags |= PageFlags::WRITE;
        }
        if self.perm.contains(Perm::EXEC) {
            flags |= PageFlags::EXECUTE;
        }
        flags
    }

    /// Page-aligned addresses covered by the VMA.
    pub fn pages(&self) -> impl Iterator<Item = usize> {
        (self.start..self.end()).step_by(PAGE_SIZE)
    }
}

/// The requested range overlaps an existing VMA.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Overlap;

/// Ordered, non-overlapping VMAs keyed by start address.
#[derive(Debug, Default)]
pub struct VmaSet {
    map: BTreeMap<usize, Vma>,
}

impl VmaSet {
    pub const fn new() -> Self {
        Self { map: BTreeMap::new() }
    }

    /// Inserts `vma` unless it overlaps an existing area.
    pub fn insert(&mut self, vma: Vma) -> Result<(), Overlap> {
        if let Some((_, below)) = self.map.range(..vma.end()).next_back() {
            if below.end() > vma.start {
                return Err(Overlap);
            }
        }
        self.map.insert(vma.start, vma);
        Ok(())
    }

    /// VMA starting exactly at `start`.
    pub fn get(&self, start: usize) -> Option<&Vma> {
        self.map.get(&start)
    }

    /// VMA covering `va`: the predecessor of the upper bound of `va`.
    pub fn find(&self, va: usize) -> Option<&Vma> {
        self.map.range(..=va).next_back().map(|(_, vma)| vma).filter(|vma| vma.contains(va))
    }

    /// Lowest VMA intersecting `[start, end)`.
    pub fn first_overlap(&self, start: usize, end: usize) -> Option<&Vma> {
        if let Some(below) = self.find(start) {
            return Some(below);
        }
        self.map.range(start..end).next().map(|(_, vma)| vma)
    }

    pub fn remove(&mut self, start: usize) -> Option<Vma> {
        self.map.remove(&start)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Vma> {
        self.map.values()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn anon(start: usize, pages: usize) -> Vma {
        Vma {
            start,
            size: pages * PAGE_SIZE,
            perm: Perm::READ | Perm::WRITE,
            flags: MapFlags::PRIVATE | MapFlags::ANONYMOUS,
        }
    }

    #[test]
    fn find_uses_predecessor_of_upper_bound() {
        let mut set = VmaSet::new();
        set.insert(anon(0x1000, 2)).unwrap();
        set.insert(anon(0x8000, 1)).unwrap();
        assert_eq!(set.find(0x2fff).map(|v| v.start), Some(0x1000));
        assert!(set.find(0x3000).is_none());
        assert!(set.find(0x0fff).is_none());
        assert_eq!(set.find(0x8000).map(|v| v.start), Some(0x8000));
    }

    #[test]
    fn overlapping_insert_is_rejected() {
        let mut set = VmaSet::new();
        set.insert(anon(0x4000, 4)).unwrap();
        assert_eq!(set.insert(anon(0x3000, 2)), Err(Overlap));
        assert_eq!(set.insert(anon(0x7000, 1)), Err(Overlap));
        assert_eq!(set.insert(anon(0x5000, 1)), Err(Overlap));
        set.insert(anon(0x8000, 1)).unwrap();
        set.insert(anon(0x3000, 1)).unwrap();
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn first_overlap_reports_lowest_intersecting_area() {
        let mut set = VmaSet::new();
        set.insert(anon(0x2000, 2)).unwrap();
        set.insert(anon(0x6000, 1)).unwrap();
        assert_eq!(set.first_overlap(0x3000, 0x7000).map(|v| v.start), Some(0x2000));
        assert_eq!(set.first_overlap(0x4000, 0x7000).map(|v| v.start), Some(0x6000));
        assert!(set.first_overlap(0x4000, 0x6000).is_none());
        assert!(set.first_overlap(0x0, 0x2000).is_none());
    }

    #[test]
    fn write_permission_implies_read_in_ptes() {
        let vma = Vma {
            start: 0,
            size: PAGE_SIZE,
            perm: Perm::WRITE,
            flags: MapFlags::SHARED,
        };
        assert!(vma.pte_flags().contains(PageFlags::READ | PageFlags::WRITE | PageFlags::USER));
        assert!(vma.is_shared());
    }

    proptest! {
        #[test]
        fn accepted_vmas_stay_disjoint(spans in proptest::collection::vec((0usize..64, 1usize..8), 1..24)) {
            let mut set = VmaSet::new();
            for (page, len) in spans {
                let _ = set.insert(anon(page * PAGE_SIZE, len));
            }
            let vmas: alloc::vec::Vec<Vma> = set.iter().copied().collect();
            for pair in vmas.windows(2) {
                prop_assert!(pair[0].end() <= pair[1].start);
            }
            for vma in &vmas {
                prop_assert_eq!(set.find(vma.start).map(|v| v.start), Some(vma.start));
                prop_assert_eq!(set.find(vma.end() - 1).map(|v| v.start), Some(vma.start));
            }
        }
    }
}
