// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel-wide newtypes for task identity and sleep channels
//! OWNERS: @kernel-team
//! PUBLIC API: Pid, Channel
//! DEPENDS_ON: core only
//! INVARIANTS: Pid equals the task-table slot index; Channel is an opaque rendezvous key
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::fmt;

/// Task identifier.
///
/// **Ownership**: Only `TaskTable` hands out PIDs; a PID names a table slot
/// and is reused once the slot has been reaped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn from_index(index: usize) -> Self {
        Self(index as u32)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the PID as an index into the task table.
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque key used by the broadcast `sleep`/`wakeup` pair.
///
/// Channels are usually derived from the address of the object a sleeper is
/// waiting on; the kernel never dereferences them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Channel(usize);

impl Channel {
    #[inline]
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    /// Derives a channel from the address of `object`.
    #[inline]
    pub fn of<T: ?Sized>(object: &T) -> Self {
        Self(object as *const T as *const u8 as usize)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }
}
