// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel context switch between a task and its hart's scheduler
//! OWNERS: @kernel-arch-team
//! PUBLIC API: Context, swtch(old, new)
//! DEPENDS_ON: global_asm (riscv64-none only)
//! INVARIANTS: Only callee-saved state crosses a switch; caller holds exactly one task lock
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use static_assertions::const_assert_eq;

/// Callee-saved register file saved by [`swtch`].
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,
    /// `s0` through `s11`.
    pub s: [usize; 12],
}

const_assert_eq!(core::mem::size_of::<Context>(), 14 * 8);

impl Context {
    pub const fn zeroed() -> Self {
        Self { ra: 0, sp: 0, s: [0; 12] }
    }

    /// Context that starts executing `entry` on a fresh stack ending at `stack_top`.
    pub const fn entering(entry: usize, stack_top: usize) -> Self {
        Self { ra: entry, sp: stack_top, s: [0; 12] }
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    r#"
    .section .text.axon_swtch, "ax", @progbits
    .globl axon_swtch
    .align 4
axon_swtch:
    sd ra, 0(a0)
    sd sp, 8(a0)
    sd s0, 16(a0)
    sd s1, 24(a0)
    sd s2, 32(a0)
    sd s3, 40(a0)
    sd s4, 48(a0)
    sd s5, 56(a0)
    sd s6, 64(a0)
    sd s7, 72(a0)
    sd s8, 80(a0)
    sd s9, 88(a0)
    sd s10, 96(a0)
    sd s11, 104(a0)

    ld ra, 0(a1)
    ld sp, 8(a1)
    ld s0, 16(a1)
    ld s1, 24(a1)
    ld s2, 32(a1)
    ld s3, 40(a1)
    ld s4, 48(a1)
    ld s5, 56(a1)
    ld s6, 64(a1)
    ld s7, 72(a1)
    ld s8, 80(a1)
    ld s9, 88(a1)
    ld s10, 96(a1)
    ld s11, 104(a1)
    ret
"#
);

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
extern "C" {
    fn axon_swtch(old: *mut Context, new: *const Context);
}

/// Saves the current callee-saved registers into `old` and resumes `new`.
///
/// # Safety
///
/// Both pointers must stay valid until the switch comes back. The caller
/// must hold the lock of the task being switched away from (or to) and no
/// other lock, with interrupts disabled.
#[inline]
pub unsafe fn swtch(old: *mut Context, new: *const Context) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: upheld by the caller.
    unsafe {
        axon_swtch(old, new);
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (old, new);
        panic!("swtch: context switches require the riscv64 target");
    }
}
