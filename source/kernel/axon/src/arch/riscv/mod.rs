// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! RISC-V specific helpers used across the AXON kernel.
//!
//! The implementation follows the Sv39 privileged specification and is
//! written such that host builds can still exercise high level logic via
//! the lightweight `#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]`
//! stubs. The assembly boundary (context switch, trap vectors) lives in the
//! `switch` and `trampoline` submodules.

pub mod switch;
pub mod trampoline;

/// `sstatus.SIE`: supervisor interrupts enabled.
pub const SSTATUS_SIE: usize = 1 << 1;
/// `sstatus.SPIE`: interrupt enable restored by `sret`.
pub const SSTATUS_SPIE: usize = 1 << 5;
/// `sstatus.SPP`: previous privilege was supervisor.
pub const SSTATUS_SPP: usize = 1 << 8;

/// Sv39 translation mode in `satp`.
pub const SATP_SV39: usize = 8 << 60;

/// Builds the `satp` value for a root table at physical address `root_pa`.
#[inline]
pub const fn make_satp(root_pa: usize) -> usize {
    SATP_SV39 | (root_pa >> 12)
}

/// Returns the id of the executing hart (kept in `tp` while in the kernel).
#[inline]
pub fn hart_id() -> usize {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let id: usize;
        // SAFETY: reading `tp` has no side effects.
        unsafe { core::arch::asm!("mv {0}, tp", out(reg) id, options(nomem, nostack, preserves_flags)) };
        id
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        0
    }
}

/// Records the hart id in `tp`.
///
/// # Safety
///
/// Must only be called by boot code before any per-hart state is used.
#[inline]
pub unsafe fn set_hart_id(id: usize) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: caller guarantees `tp` is not otherwise in use.
    unsafe {
        core::arch::asm!("mv tp, {0}", in(reg) id, options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = id;
    }
}

/// Enables supervisor interrupts on this hart.
#[inline]
pub fn intr_on() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: toggling SIE only affects interrupt delivery on this hart.
    unsafe {
        riscv::register::sstatus::set_sie();
    }
}

/// Disables supervisor interrupts on this hart.
#[inline]
pub fn intr_off() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: toggling SIE only affects interrupt delivery on this hart.
    unsafe {
        riscv::register::sstatus::clear_sie();
    }
}

/// Returns whether supervisor interrupts are enabled on this hart.
#[inline]
pub fn intr_get() -> bool {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        riscv::register::sstatus::read().sie()
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        false
    }
}

/// Parks the hart until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: `wfi` is a hint and has no memory effects.
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack));
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    core::hint::spin_loop();
}

/// Flushes every TLB entry of this hart.
#[inline]
pub fn flush_tlb() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: `sfence.vma` only invalidates cached translations.
    unsafe {
        core::arch::asm!("sfence.vma zero, zero", options(nostack));
    }
}

/// Installs `satp` and flushes stale translations.
///
/// # Safety
///
/// The new table must map the currently executing code and stack.
#[inline]
pub unsafe fn write_satp(satp: usize) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: caller guarantees the kernel stays mapped under `satp`.
    unsafe {
        core::arch::asm!(
            "sfence.vma zero, zero",
            "csrw satp, {0}",
            "sfence.vma zero, zero",
            in(reg) satp,
            options(nostack)
        );
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = satp;
    }
}

#[inline]
pub fn read_satp() -> usize {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        riscv::register::satp::read().bits()
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        0
    }
}

/// Reads the `time` CSR (10 MHz on QEMU virt).
#[inline]
pub fn read_time() -> u64 {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        riscv::register::time::read() as u64
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        0
    }
}

/// Arms the supervisor timer `delta` cycles from now via SBI.
#[inline]
pub fn timer_arm(delta: u64) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let now = read_time();
        let _ = sbi_rt::set_timer(now.wrapping_add(delta));
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = delta;
    }
}

/// Unmasks the supervisor timer interrupt source.
#[inline]
pub fn enable_timer_interrupts() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: only changes which interrupt sources may trap on this hart.
    unsafe {
        riscv::register::sie::set_stimer();
    }
}

/// Installs `vector` as the supervisor trap vector (direct mode).
#[inline]
pub fn write_stvec(vector: usize) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: `vector` points at one of the kernel's trap entry routines.
    unsafe {
        riscv::register::stvec::write(vector, riscv::register::mtvec::TrapMode::Direct);
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = vector;
    }
}

#[inline]
pub fn read_scause() -> usize {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        riscv::register::scause::read().bits()
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        0
    }
}

#[inline]
pub fn read_stval() -> usize {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        riscv::register::stval::read()
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        0
    }
}

#[inline]
pub fn read_sepc() -> usize {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        riscv::register::sepc::read()
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        0
    }
}

#[inline]
pub fn write_sepc(value: usize) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: `sepc` only takes effect on the next `sret`.
    unsafe {
        core::arch::asm!("csrw sepc, {0}", in(reg) value, options(nomem, nostack));
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = value;
    }
}

#[inline]
pub fn read_sstatus() -> usize {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let value: usize;
        // SAFETY: reading a CSR has no side effects.
        unsafe { core::arch::asm!("csrr {0}, sstatus", out(reg) value, options(nomem, nostack)) };
        value
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        0
    }
}

#[inline]
pub fn write_sstatus(value: usize) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: callers only change SPP/SPIE/SIE on the current hart.
    unsafe {
        core::arch::asm!("csrw sstatus, {0}", in(reg) value, options(nomem, nostack));
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = value;
    }
}

/// Asks the SBI firmware to start `hart` at `entry` with `opaque` in `a1`.
///
/// Returns `false` when the hart does not exist or is already running.
pub fn start_hart(hart: usize, entry: usize, opaque: usize) -> bool {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        sbi_rt::hart_start(hart, entry, opaque).error == 0
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (hart, entry, opaque);
        false
    }
}

/// Parks the hart forever with interrupts masked.
pub fn halt() -> ! {
    loop {
        intr_off();
        wait_for_interrupt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satp_encodes_sv39_mode_and_ppn() {
        let satp = make_satp(0x8020_3000);
        assert_eq!(satp >> 60, 8);
        assert_eq!(satp & ((1 << 44) - 1), 0x8020_3000 >> 12);
    }
}
