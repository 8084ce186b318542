// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel page table: identity map of the UART, kernel text and RAM, plus
//! the trap trampoline at the top of the address space.

use crate::arch::riscv;
use crate::mm::frame::Frames;
use crate::mm::layout::{page_round_up, PAGE_SIZE, TRAMPOLINE, UART0};
use crate::mm::page_table::{MapError, PageFlags, PageTable};

/// Physical extents the kernel table covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelLayout {
    pub text_start: usize,
    /// End of the executable image; rounded up to a page.
    pub text_end: usize,
    pub ram_end: usize,
    pub trampoline: usize,
}

/// Builds the kernel table. On failure every table page is returned.
pub fn build(frames: &Frames<'_>, layout: &KernelLayout) -> Result<PageTable, MapError> {
    let rw = PageFlags::READ | PageFlags::WRITE;
    let rx = PageFlags::READ | PageFlags::EXECUTE;
    let text_end = page_round_up(layout.text_end);
    if text_end < layout.text_start || layout.ram_end < text_end {
        return Err(MapError::OutOfRange);
    }

    let mut table = PageTable::new(frames)?;
    let mapped = table
        .map_range(UART0, UART0, PAGE_SIZE, rw, frames)
        .and_then(|()| table.map_range(layout.text_start, layout.text_start, text_end - layout.text_start, rx, frames))
        .and_then(|()| table.map_range(text_end, text_end, layout.ram_end - text_end, rw, frames))
        .and_then(|()| table.map(TRAMPOLINE, layout.trampoline, rx, false, frames));
    match mapped {
        Ok(()) => Ok(table),
        Err(err) => {
            table.free(frames, false);
            Err(err)
        }
    }
}

static KERNEL_TABLE: spin::Once<PageTable> = spin::Once::new();

/// Builds the kernel table once; later calls keep the first table.
pub fn init(frames: &Frames<'_>, layout: &KernelLayout) -> Result<(), MapError> {
    if KERNEL_TABLE.get().is_none() {
        let table = build(frames, layout)?;
        KERNEL_TABLE.call_once(|| table);
    }
    Ok(())
}

/// `satp` of the kernel table, once built.
pub fn satp() -> Option<usize> {
    KERNEL_TABLE.get().map(PageTable::satp)
}

/// Switches this hart onto the kernel table.
pub fn init_hart() {
    let Some(satp) = satp() else {
        panic!("kernel page table used before init");
    };
    // SAFETY: the kernel table identity maps the running image and all RAM.
    unsafe { riscv::write_satp(satp) };
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
extern "C" {
    static __text_start: u8;
    static __text_end: u8;
}

/// Layout of the running image, from linker symbols.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn image_layout() -> KernelLayout {
    // SAFETY: only symbol addresses are taken.
    let (text_start, text_end) =
        unsafe { (core::ptr::addr_of!(__text_start) as usize, core::ptr::addr_of!(__text_end) as usize) };
    KernelLayout {
        text_start,
        text_end,
        ram_end: crate::mm::layout::PHYSTOP,
        trampoline: crate::arch::riscv::trampoline::trampoline_pa(),
    }
}

/// Host builds have no linked image; one text page at `KERNBASE` stands in.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn image_layout() -> KernelLayout {
    KernelLayout {
        text_start: crate::mm::layout::KERNBASE,
        text_end: crate::mm::layout::KERNBASE + PAGE_SIZE,
        ram_end: crate::mm::layout::PHYSTOP,
        trampoline: crate::arch::riscv::trampoline::trampoline_pa(),
    }
}
