// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: AXON kernel library: tasks, scheduling, locks and the COW virtual memory engine
//! OWNERS: @kernel-team
//! PUBLIC API: kmain(), secondary_main(), sync, mm, task, sched, trap, syscall, exec
//! DEPENDS_ON: spin, bitflags, riscv, sbi-rt (target), linked_list_allocator (target heap)
//! INVARIANTS: Host builds exercise all state machines; hardware paths gated on riscv64-none
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

extern crate alloc;

pub mod arch;
pub mod cpu;
pub mod diag;
pub mod exec;
pub mod heap;
pub mod kmain;
pub mod mm;
pub mod panic;
pub mod param;
pub mod sched;
pub mod selftest;
pub mod sync;
pub mod syscall;
pub mod task;
pub mod trap;
pub mod types;
pub mod uart;

pub use diag::log;
pub use kmain::{kmain, secondary_main, BootInfo};
