// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Compile-time kernel limits shared across subsystems.

/// Maximum number of harts the kernel brings up.
pub const NCPU: usize = 8;

/// Capacity of the task table.
pub const NTASK: usize = 64;

/// Open file handles per task.
pub const NOFILE: usize = 16;

/// Maximum number of `exec` arguments.
pub const MAXARG: usize = 32;

/// Maximum length of a path passed to `exec`, including the terminator.
pub const MAXPATH: usize = 128;

/// Kernel stack size for every task.
pub const KSTACK_SIZE: usize = 16 * 1024;

/// Boot stack size per hart; must match the boot crate's stack reservation.
pub const BOOT_STACK_SIZE: usize = 16 * 1024;

/// Timer quantum in `time` CSR cycles (10 ms for the 10 MHz QEMU virt clock).
pub const TICK_CYCLES: u64 = 100_000;

/// Length of the diagnostic task name.
pub const TASK_NAME_LEN: usize = 16;
