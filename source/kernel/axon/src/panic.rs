// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel panic handler emitting diagnostics over the raw UART
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std)
//! DEPENDS_ON: uart::raw_writer(), cpu (hart id, running task)
//! INVARIANTS: No allocation and no kernel locks; the hart parks with interrupts off
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

#[cfg(all(not(test), target_os = "none"))]
use core::{fmt::Write, panic::PanicInfo};

#[cfg(all(not(test), target_os = "none"))]
use crate::{arch::riscv, cpu, uart};

/// Prints the message, location, hart and running task, then parks the hart.
#[cfg(all(not(test), target_os = "none"))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    riscv::intr_off();
    let mut w = uart::raw_writer();
    let _ = write!(w, "\nPANIC hart {}", riscv::hart_id());
    if let Some(pid) = cpu::current_pid() {
        let _ = write!(w, " task {}", pid);
    }
    if let Some(location) = info.location() {
        let _ = write!(w, " at {}:{}", location.file(), location.line());
    }
    let _ = writeln!(w, ": {}", info.message());
    riscv::halt()
}
