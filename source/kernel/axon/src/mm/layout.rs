// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical and virtual memory layout of the QEMU `virt` machine.
//!
//! User virtual address space, top down:
//!
//! ```text
//! MAXVA        ---------------------------
//! TRAMPOLINE   trap entry/exit code (shared with the kernel)
//! TRAPFRAME    per-task saved user registers
//!              ...
//! VA_ANONYMOUS kernel-chosen anonymous mmap region grows upwards
//! VA_USERSTACK two-page user stack used by exec
//!              program image (ELF segments, or the init image at 0)
//! 0            ---------------------------
//! ```

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: usize = 12;

/// One past the highest user virtual address; avoids Sv39 sign extension.
pub const MAXVA: usize = 1 << 38;

pub const TRAMPOLINE: usize = MAXVA - PAGE_SIZE;
pub const TRAPFRAME: usize = TRAMPOLINE - PAGE_SIZE;

/// Base of the region used when `mmap` is asked to pick an address.
pub const VA_ANONYMOUS: usize = MAXVA >> 1;

pub const USER_STACK_PAGES: usize = 2;
pub const VA_USERSTACK: usize = VA_ANONYMOUS - USER_STACK_PAGES * PAGE_SIZE;

/// Polled console UART.
pub const UART0: usize = 0x1000_0000;

pub const RAM_BASE: usize = 0x8000_0000;
/// Load address of the kernel image (the SBI firmware owns the RAM below).
pub const KERNBASE: usize = 0x8020_0000;
pub const PHYSTOP: usize = RAM_BASE + 128 * 1024 * 1024;

#[inline]
pub const fn page_round_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn page_round_up(addr: usize) -> usize {
    (addr + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}
