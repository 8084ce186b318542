// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: User trap entry/exit trampoline and the supervisor trap vector
//! OWNERS: @kernel-arch-team
//! PUBLIC API: trampoline_pa(), uservec_va(), userret_va(), kernelvec()
//! DEPENDS_ON: trap::TrapFrame layout (offsets checked there), linker section .text.trampoline
//! INVARIANTS: The trampoline page is mapped at TRAMPOLINE in every address space and the kernel
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use crate::mm::layout::TRAMPOLINE;

// Trapframe offsets: kernel_satp 0, kernel_sp 8, kernel_trap 16,
// kernel_hartid 24, epc 32, x1..x31 at 40 + 8 * n.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    r#"
    .section .text.trampoline, "ax", @progbits
    .globl axon_trampoline
    .globl axon_uservec
    .globl axon_userret
    .balign 4096
axon_trampoline:
axon_uservec:
    csrw sscratch, a0
    li a0, {trapframe}

    sd ra, 48(a0)
    sd sp, 56(a0)
    sd gp, 64(a0)
    sd tp, 72(a0)
    sd t0, 80(a0)
    sd t1, 88(a0)
    sd t2, 96(a0)
    sd s0, 104(a0)
    sd s1, 112(a0)
    sd a1, 128(a0)
    sd a2, 136(a0)
    sd a3, 144(a0)
    sd a4, 152(a0)
    sd a5, 160(a0)
    sd a6, 168(a0)
    sd a7, 176(a0)
    sd s2, 184(a0)
    sd s3, 192(a0)
    sd s4, 200(a0)
    sd s5, 208(a0)
    sd s6, 216(a0)
    sd s7, 224(a0)
    sd s8, 232(a0)
    sd s9, 240(a0)
    sd s10, 248(a0)
    sd s11, 256(a0)
    sd t3, 264(a0)
    sd t4, 272(a0)
    sd t5, 280(a0)
    sd t6, 288(a0)
    csrr t0, sscratch
    sd t0, 120(a0)

    ld sp, 8(a0)
    ld tp, 24(a0)
    ld t0, 16(a0)
    ld t1, 0(a0)
    sfence.vma zero, zero
    csrw satp, t1
    sfence.vma zero, zero
    jr t0

axon_userret:
    sfence.vma zero, zero
    csrw satp, a0
    sfence.vma zero, zero
    li a0, {trapframe}

    ld ra, 48(a0)
    ld sp, 56(a0)
    ld gp, 64(a0)
    ld tp, 72(a0)
    ld t0, 80(a0)
    ld t1, 88(a0)
    ld t2, 96(a0)
    ld s0, 104(a0)
    ld s1, 112(a0)
    ld a1, 128(a0)
    ld a2, 136(a0)
    ld a3, 144(a0)
    ld a4, 152(a0)
    ld a5, 160(a0)
    ld a6, 168(a0)
    ld a7, 176(a0)
    ld s2, 184(a0)
    ld s3, 192(a0)
    ld s4, 200(a0)
    ld s5, 208(a0)
    ld s6, 216(a0)
    ld s7, 224(a0)
    ld s8, 232(a0)
    ld s9, 240(a0)
    ld s10, 248(a0)
    ld s11, 256(a0)
    ld t3, 264(a0)
    ld t4, 272(a0)
    ld t5, 280(a0)
    ld t6, 288(a0)
    ld a0, 120(a0)
    sret
    .balign 4096
"#,
    trapframe = const crate::mm::layout::TRAPFRAME,
);

// Supervisor traps taken while running kernel code. Caller-saved
// registers go on the interrupted stack; `kernel_trap` preserves the rest.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    r#"
    .section .text.axon_kernelvec, "ax", @progbits
    .globl axon_kernelvec
    .balign 4
axon_kernelvec:
    addi sp, sp, -256
    sd ra, 0(sp)
    sd gp, 16(sp)
    sd tp, 24(sp)
    sd t0, 32(sp)
    sd t1, 40(sp)
    sd t2, 48(sp)
    sd a0, 72(sp)
    sd a1, 80(sp)
    sd a2, 88(sp)
    sd a3, 96(sp)
    sd a4, 104(sp)
    sd a5, 112(sp)
    sd a6, 120(sp)
    sd a7, 128(sp)
    sd t3, 216(sp)
    sd t4, 224(sp)
    sd t5, 232(sp)
    sd t6, 240(sp)

    call axon_kernel_trap

    ld ra, 0(sp)
    ld gp, 16(sp)
    ld t0, 32(sp)
    ld t1, 40(sp)
    ld t2, 48(sp)
    ld a0, 72(sp)
    ld a1, 80(sp)
    ld a2, 88(sp)
    ld a3, 96(sp)
    ld a4, 104(sp)
    ld a5, 112(sp)
    ld a6, 120(sp)
    ld a7, 128(sp)
    ld t3, 216(sp)
    ld t4, 224(sp)
    ld t5, 232(sp)
    ld t6, 240(sp)
    addi sp, sp, 256
    sret
"#
);

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
extern "C" {
    static axon_trampoline: u8;
    static axon_uservec: u8;
    static axon_userret: u8;
    static axon_kernelvec: u8;
}

/// Physical (identity-mapped) address of the trampoline page.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn trampoline_pa() -> usize {
    // SAFETY: only the symbol address is taken.
    unsafe { core::ptr::addr_of!(axon_trampoline) as usize }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn offset_of_symbol(symbol: *const u8) -> usize {
    symbol as usize - trampoline_pa()
}

/// Virtual address of the user trap entry, valid in every address space.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn uservec_va() -> usize {
    // SAFETY: only the symbol address is taken.
    TRAMPOLINE + offset_of_symbol(unsafe { core::ptr::addr_of!(axon_uservec) })
}

/// Virtual address of the return-to-user path; takes the user `satp` in a0.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn userret_va() -> usize {
    // SAFETY: only the symbol address is taken.
    TRAMPOLINE + offset_of_symbol(unsafe { core::ptr::addr_of!(axon_userret) })
}

/// Supervisor trap vector for traps taken in kernel mode.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn kernelvec() -> usize {
    // SAFETY: only the symbol address is taken.
    unsafe { core::ptr::addr_of!(axon_kernelvec) as usize }
}

// Host builds have no trampoline; these stand-ins keep the mapping code
// testable and are never jumped to.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn trampoline_pa() -> usize {
    crate::mm::layout::KERNBASE
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn uservec_va() -> usize {
    TRAMPOLINE
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn userret_va() -> usize {
    TRAMPOLINE
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn kernelvec() -> usize {
    0
}
