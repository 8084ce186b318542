// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel main routines: boot-hart bring-up and secondary-hart entry.

use crate::arch::riscv::{self, trampoline};
use crate::mm::{self, FRAMES};
use crate::param::{NCPU, NTASK};
use crate::{exec, log_info, log_warn, sched, selftest, task, trap};

/// What the boot crate hands to [`kmain`].
#[derive(Clone, Copy, Debug)]
pub struct BootInfo {
    /// Hart that won the boot race.
    pub hartid: usize,
    /// Flat image of the first user program, loaded at address zero.
    pub init_code: &'static [u8],
    /// Physical address secondary harts start at; they arrive with their
    /// hart id in `a0` and call [`secondary_main`].
    pub secondary_entry: usize,
}

fn banner() {
    log_info!(target: "boot", "   __ ___ _____  ___");
    log_info!(target: "boot", "  / _` \\ \\/ / _ \\| '_ \\");
    log_info!(target: "boot", " | (_| |>  < (_) | | | |");
    log_info!(target: "boot", "  \\__,_/_/\\_\\___/|_| |_|");
    log_info!(target: "boot", "axon vers. 0.1.0 - Sv39, {} harts max", NCPU);
}

/// Brings the kernel up on the boot hart and enters the scheduler.
pub fn kmain(boot: BootInfo) -> ! {
    // SAFETY: first code on this hart; nothing has read `tp` yet.
    unsafe { riscv::set_hart_id(boot.hartid) };
    crate::heap::init();
    if cfg!(feature = "boot_banner") {
        banner();
    }

    if let Err(err) = mm::kernel::init(&FRAMES, &mm::kernel::image_layout()) {
        panic!("kernel page table: {:?}", err);
    }
    mm::kernel::init_hart();
    trap::init_hart();
    log_info!(target: "boot", "hart {}: paging and traps on", boot.hartid);

    let tasks = task::init(NTASK, trampoline::trampoline_pa());
    let image = match exec::load_flat(&FRAMES, boot.init_code) {
        Ok(image) => image,
        Err(err) => panic!("init image: {:?}", err),
    };
    let root = match tasks.spawn_user(&FRAMES, "init", image.space, image.entry, image.sp) {
        Ok(pid) => pid,
        Err(err) => panic!("init task: {:?}", err),
    };
    tasks.set_root(root);
    log_info!(target: "boot", "root task {} ready", root);

    for hart in (0..NCPU).filter(|&hart| hart != boot.hartid) {
        if riscv::start_hart(hart, boot.secondary_entry, 0) {
            log_info!(target: "boot", "hart {} started", hart);
        } else {
            log_warn!(target: "boot", "hart {} not started", hart);
        }
    }

    selftest::spawn();
    sched::scheduler()
}

/// Entry for every hart other than the boot hart.
pub fn secondary_main(hartid: usize) -> ! {
    // SAFETY: first code on this hart.
    unsafe { riscv::set_hart_id(hartid) };
    mm::kernel::init_hart();
    trap::init_hart();
    sched::scheduler()
}
