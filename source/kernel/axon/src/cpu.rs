// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-hart state: current task, scheduler context, interrupt nesting
//! OWNERS: @kernel-team
//! PUBLIC API: cpu_id(), this_cpu(), push_off(), pop_off(), current_pid()
//! DEPENDS_ON: arch::riscv (tp, sstatus.SIE)
//! INVARIANTS: Interrupts stay off while noff > 0; intena is restored when noff returns to 0
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::arch::riscv::{self, switch::Context};
use crate::param::NCPU;
use crate::types::Pid;

const NO_TASK: usize = usize::MAX;

/// State owned by one hart.
pub struct Cpu {
    current: AtomicUsize,
    noff: AtomicUsize,
    intena: AtomicBool,
    scheduler: UnsafeCell<Context>,
}

// SAFETY: `scheduler` is only touched by the owning hart with interrupts off.
unsafe impl Sync for Cpu {}

impl Cpu {
    const fn new() -> Self {
        Self {
            current: AtomicUsize::new(NO_TASK),
            noff: AtomicUsize::new(0),
            intena: AtomicBool::new(false),
            scheduler: UnsafeCell::new(Context::zeroed()),
        }
    }

    /// Task currently running on this hart, if any.
    pub fn current(&self) -> Option<Pid> {
        match self.current.load(Ordering::Acquire) {
            NO_TASK => None,
            raw => Some(Pid::from_index(raw)),
        }
    }

    pub fn set_current(&self, pid: Option<Pid>) {
        let raw = pid.map_or(NO_TASK, Pid::as_index);
        self.current.store(raw, Ordering::Release);
    }

    /// Depth of `push_off` nesting.
    pub fn noff(&self) -> usize {
        self.noff.load(Ordering::Relaxed)
    }

    /// Whether interrupts were enabled before the outermost `push_off`.
    pub fn intena(&self) -> bool {
        self.intena.load(Ordering::Relaxed)
    }

    pub fn set_intena(&self, enabled: bool) {
        self.intena.store(enabled, Ordering::Relaxed);
    }

    /// Records one `push_off` level; `was_enabled` is the interrupt state
    /// observed before masking.
    fn enter(&self, was_enabled: bool) {
        if self.noff.load(Ordering::Relaxed) == 0 {
            self.intena.store(was_enabled, Ordering::Relaxed);
        }
        self.noff.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops one level; returns whether interrupts must be re-enabled.
    fn leave(&self) -> bool {
        match self
            .noff
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |depth| depth.checked_sub(1))
        {
            Ok(previous) => previous == 1 && self.intena.load(Ordering::Relaxed),
            Err(_) => panic!("pop_off: not pushed"),
        }
    }

    /// Scheduler context this hart switches back into.
    pub fn scheduler_context(&self) -> *mut Context {
        self.scheduler.get()
    }
}

static CPUS: [Cpu; NCPU] = [const { Cpu::new() }; NCPU];

/// Identifier of the executing hart.
///
/// The value is only stable while interrupts are disabled or the caller
/// does not switch away.
#[inline]
pub fn cpu_id() -> usize {
    riscv::hart_id()
}

/// Per-hart state of the executing hart.
#[inline]
pub fn this_cpu() -> &'static Cpu {
    let id = cpu_id();
    match CPUS.get(id) {
        Some(cpu) => cpu,
        None => panic!("cpu: hart {} beyond NCPU", id),
    }
}

/// Disables interrupts and bumps the nesting depth.
pub fn push_off() {
    let old = riscv::intr_get();
    riscv::intr_off();
    this_cpu().enter(old);
}

/// Drops one nesting level and re-enables interrupts at depth zero if they
/// were enabled before the outermost `push_off`.
pub fn pop_off() {
    if riscv::intr_get() {
        panic!("pop_off: interrupts enabled");
    }
    if this_cpu().leave() {
        riscv::intr_on();
    }
}

/// Task running on the executing hart.
pub fn current_pid() -> Option<Pid> {
    push_off();
    let pid = this_cpu().current();
    pop_off();
    pid
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outermost_level_restores_interrupts() {
        let cpu = Cpu::new();
        cpu.enter(true);
        cpu.enter(false);
        assert_eq!(cpu.noff(), 2);
        assert!(!cpu.leave());
        assert!(cpu.leave());
        assert_eq!(cpu.noff(), 0);
    }

    #[test]
    fn masked_outer_level_keeps_interrupts_off() {
        let cpu = Cpu::new();
        cpu.enter(false);
        cpu.enter(true);
        assert!(!cpu.leave());
        assert!(!cpu.leave());
    }

    #[test]
    #[should_panic(expected = "pop_off: not pushed")]
    fn unbalanced_pop_is_fatal() {
        let cpu = Cpu::new();
        cpu.leave();
    }

    #[test]
    fn current_round_trips_through_sentinel() {
        let cpu = Cpu::new();
        assert_eq!(cpu.current(), None);
        cpu.set_current(Some(Pid::from_index(5)));
        assert_eq!(cpu.current(), Some(Pid::from_index(5)));
        cpu.set_current(None);
        assert_eq!(cpu.current(), None);
    }
}
