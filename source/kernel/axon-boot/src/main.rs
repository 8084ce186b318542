// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Boot wrapper for the AXON kernel. Provides `_start` for the boot hart and
//! the SBI HSM entry for the others, sets up per-hart stacks, and carries
//! the first user program before handing over to `axon::kmain()`.
#![cfg_attr(target_os = "none", no_std)]
#![cfg_attr(target_os = "none", no_main)]

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod boot {
    use axon::param::BOOT_STACK_SIZE;
    use axon::syscall::{SYSCALL_EXIT, SYSCALL_FORK, SYSCALL_PUTC, SYSCALL_SLEEP, SYSCALL_WAIT};
    use axon::BootInfo;

    // Both entries arrive with the hart id in a0 and take the stack slot
    // `__boot_stack_top - hartid * BOOT_STACK_SIZE`.
    core::arch::global_asm!(
        r#"
    .section .text._start, "ax", @progbits
    .globl _start
    .globl axon_secondary_start
    .align 4
_start:
    la   t1, axon_boot_main
    j    1f
axon_secondary_start:
    la   t1, axon_secondary_main
1:
    csrw sie, zero
    li   t0, {stack_size}
    mul  t0, t0, a0
    la   sp, __boot_stack_top
    sub  sp, sp, t0
    .option push
    .option norelax
    la   gp, __global_pointer$
    .option pop
    jr   t1
"#,
        stack_size = const BOOT_STACK_SIZE,
    );

    // First user program, loaded flat at address zero. Prints a greeting,
    // forks a child that exits at once, then reaps children forever.
    core::arch::global_asm!(
        r#"
    .section .rodata.axon_initcode, "a", @progbits
    .globl axon_initcode_start
    .globl axon_initcode_end
    .balign 8
    .option push
    .option norelax
axon_initcode_start:
    la   s0, 9f
1:
    lbu  a0, 0(s0)
    beqz a0, 2f
    li   a7, {putc}
    ecall
    addi s0, s0, 1
    j    1b
2:
    li   a7, {fork}
    ecall
    beqz a0, 4f
3:
    li   a0, 0
    li   a7, {wait}
    ecall
    bgez a0, 3b
    li   a0, 10
    li   a7, {sleep}
    ecall
    j    3b
4:
    li   a0, 0
    li   a7, {exit}
    ecall
    j    4b
9:
    .asciz "init: starting\n"
    .option pop
    .balign 8
axon_initcode_end:
"#,
        putc = const SYSCALL_PUTC,
        fork = const SYSCALL_FORK,
        wait = const SYSCALL_WAIT,
        sleep = const SYSCALL_SLEEP,
        exit = const SYSCALL_EXIT,
    );

    extern "C" {
        fn axon_secondary_start();
        static axon_initcode_start: u8;
        static axon_initcode_end: u8;
        static mut __bss_start: u8;
        static mut __bss_end: u8;
    }

    fn init_code() -> &'static [u8] {
        // SAFETY: the linker places both symbols around the read-only
        // init image, which lives for the whole run.
        unsafe {
            let start = core::ptr::addr_of!(axon_initcode_start);
            let end = core::ptr::addr_of!(axon_initcode_end) as usize;
            core::slice::from_raw_parts(start, end - start as usize)
        }
    }

    /// # Safety
    ///
    /// Boot hart only, before any Rust static is read.
    unsafe fn zero_bss() {
        // SAFETY: forwarded from the caller; the range comes from the linker.
        unsafe {
            let start = core::ptr::addr_of_mut!(__bss_start);
            let end = core::ptr::addr_of_mut!(__bss_end) as usize;
            core::ptr::write_bytes(start, 0, end - start as usize);
        }
    }

    #[no_mangle]
    extern "C" fn axon_boot_main(hartid: usize) -> ! {
        // SAFETY: only the boot hart runs `_start`; the others are parked
        // by the firmware until `kmain` starts them.
        unsafe { zero_bss() };
        axon::kmain(BootInfo { hartid, init_code: init_code(), secondary_entry: axon_secondary_start as usize })
    }

    #[no_mangle]
    extern "C" fn axon_secondary_main(hartid: usize) -> ! {
        axon::secondary_main(hartid)
    }
}

// Host builds only type-check the wrapper.
#[cfg(not(target_os = "none"))]
fn main() {}
