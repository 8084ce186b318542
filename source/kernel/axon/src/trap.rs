// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Trap handling: trapframe layout, cause decoding, user and kernel trap
//! routing, the tick clock and the return-to-user path.
//!
//! User traps enter through the trampoline (`arch::riscv::trampoline`),
//! which saves the user registers into the task's trapframe page and jumps
//! to [`user_trap`] on the task's kernel stack. Traps taken in supervisor
//! mode go through `kernelvec` to [`kernel_trap`].

use core::fmt::{self, Write};
use core::mem::{offset_of, size_of};
use core::sync::atomic::{AtomicU64, Ordering};

use static_assertions::{const_assert, const_assert_eq};

use crate::arch::riscv::{self, trampoline, SSTATUS_SPIE, SSTATUS_SPP};
use crate::mm::layout::PAGE_SIZE;
use crate::mm::{self, vma::Access};
use crate::param::TICK_CYCLES;
use crate::types::Channel;
use crate::{cpu, sched, syscall};
use crate::{log_debug, log_warn};

/// Saved user state, one page per task, mapped at `TRAPFRAME`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// Kernel page table, restored on entry.
    pub kernel_satp: usize,
    /// Top of the task's kernel stack.
    pub kernel_sp: usize,
    /// Address of [`user_trap`].
    pub kernel_trap: usize,
    /// Hart id, restored into `tp`.
    pub kernel_hartid: usize,
    /// User program counter.
    pub epc: usize,
    /// General-purpose registers `x0`..`x31`; `x0` is unused.
    pub x: [usize; 32],
}

const_assert_eq!(offset_of!(TrapFrame, kernel_satp), 0);
const_assert_eq!(offset_of!(TrapFrame, kernel_sp), 8);
const_assert_eq!(offset_of!(TrapFrame, kernel_trap), 16);
const_assert_eq!(offset_of!(TrapFrame, kernel_hartid), 24);
const_assert_eq!(offset_of!(TrapFrame, epc), 32);
const_assert_eq!(offset_of!(TrapFrame, x), 40);
const_assert!(size_of::<TrapFrame>() <= PAGE_SIZE);

const REG_SP: usize = 2;
const REG_A0: usize = 10;

impl TrapFrame {
    /// Syscall argument `n` (`a0`..`a5`).
    pub fn arg(&self, n: usize) -> usize {
        self.x[REG_A0 + n]
    }

    /// Syscall number (`a7`).
    pub fn syscall_number(&self) -> usize {
        self.x[REG_A0 + 7]
    }

    pub fn a0(&self) -> usize {
        self.x[REG_A0]
    }

    pub fn set_a0(&mut self, value: usize) {
        self.x[REG_A0] = value;
    }

    pub fn set_a1(&mut self, value: usize) {
        self.x[REG_A0 + 1] = value;
    }

    pub fn sp(&self) -> usize {
        self.x[REG_SP]
    }

    pub fn set_sp(&mut self, value: usize) {
        self.x[REG_SP] = value;
    }
}

const INTERRUPT_FLAG: usize = usize::MAX - (usize::MAX >> 1);
const IRQ_S_TIMER: usize = 5;
const EXC_ECALL_U: usize = 8;
const EXC_INSTRUCTION_PAGE_FAULT: usize = 12;
const EXC_LOAD_PAGE_FAULT: usize = 13;
const EXC_STORE_PAGE_FAULT: usize = 15;

/// Decoded `scause`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cause {
    Syscall,
    PageFault(Access),
    Timer,
    OtherInterrupt(usize),
    OtherException(usize),
}

#[inline]
pub fn is_interrupt(scause: usize) -> bool {
    scause & INTERRUPT_FLAG != 0
}

pub fn decode(scause: usize) -> Cause {
    let code = scause & !INTERRUPT_FLAG;
    if is_interrupt(scause) {
        return match code {
            IRQ_S_TIMER => Cause::Timer,
            other => Cause::OtherInterrupt(other),
        };
    }
    match code {
        EXC_ECALL_U => Cause::Syscall,
        EXC_INSTRUCTION_PAGE_FAULT => Cause::PageFault(Access::Exec),
        EXC_LOAD_PAGE_FAULT => Cause::PageFault(Access::Read),
        EXC_STORE_PAGE_FAULT => Cause::PageFault(Access::Write),
        other => Cause::OtherException(other),
    }
}

pub fn describe_cause(scause: usize) -> &'static str {
    let code = scause & !INTERRUPT_FLAG;
    if is_interrupt(scause) {
        match code {
            1 => "SupervisorSoftInt",
            5 => "SupervisorTimerInt",
            9 => "SupervisorExternalInt",
            _ => "Interrupt",
        }
    } else {
        match code {
            0 => "InstructionAddressMisaligned",
            1 => "InstructionAccessFault",
            2 => "IllegalInstruction",
            3 => "Breakpoint",
            4 => "LoadAddressMisaligned",
            5 => "LoadAccessFault",
            6 => "StoreAMOAddressMisaligned",
            7 => "StoreAMOAccessFault",
            8 => "EnvironmentCallFromUMode",
            9 => "EnvironmentCallFromSMode",
            12 => "InstructionPageFault",
            13 => "LoadPageFault",
            15 => "StoreAMOPageFault",
            _ => "Exception",
        }
    }
}

pub fn fmt_trap<W: Write>(frame: &TrapFrame, scause: usize, stval: usize, f: &mut W) -> fmt::Result {
    writeln!(f, " sepc=0x{:016x}", frame.epc)?;
    writeln!(f, " scause=0x{:016x} ({})", scause, describe_cause(scause))?;
    writeln!(f, " stval=0x{:016x}", stval)?;
    writeln!(f, " a0..a7 = {:016x?}", &frame.x[10..=17])
}

// tick clock

static TICKS: AtomicU64 = AtomicU64::new(0);

/// Timer ticks since boot.
pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

/// Channel woken on every tick; `sleep(n)` waits on it.
pub fn tick_channel() -> Channel {
    Channel::of(&TICKS)
}

fn clock_tick() {
    if cpu::cpu_id() == 0 {
        let guard = sched::tick_lock().lock();
        TICKS.fetch_add(1, Ordering::AcqRel);
        sched::wakeup(tick_channel());
        drop(guard);
    }
    riscv::timer_arm(TICK_CYCLES);
}

/// Installs the kernel trap vector on this hart and arms its timer.
pub fn init_hart() {
    riscv::write_stvec(trampoline::kernelvec());
    if cfg!(feature = "timer_irq") {
        riscv::timer_arm(TICK_CYCLES);
        riscv::enable_timer_interrupts();
    }
}

// user traps

/// Handles a trap from user mode; entered from the trampoline on the
/// task's kernel stack with the kernel page table active.
#[no_mangle]
pub extern "C" fn axon_user_trap() -> ! {
    user_trap()
}

pub fn user_trap() -> ! {
    if riscv::read_sstatus() & SSTATUS_SPP != 0 {
        panic!("user_trap: not from user mode");
    }
    riscv::write_stvec(trampoline::kernelvec());

    let scause = riscv::read_scause();
    let sepc = riscv::read_sepc();
    sched::with_current(|_, data| {
        if let Some(tf) = data.trapframe() {
            tf.epc = sepc;
        }
    });

    match decode(scause) {
        Cause::Syscall => {
            sched::exit_if_killed();
            let (number, args) = sched::with_current(|_, data| match data.trapframe() {
                Some(tf) => {
                    tf.epc += 4;
                    (tf.syscall_number(), syscall::Args::from_frame(tf))
                }
                None => panic!("user_trap: task without trapframe"),
            });
            riscv::intr_on();
            let ret = syscall::dispatch_current(number, &args);
            sched::with_current(|_, data| {
                if let Some(tf) = data.trapframe() {
                    tf.set_a0(ret);
                }
            });
        }
        Cause::PageFault(access) => {
            let va = riscv::read_stval();
            match mm::handle_page_fault(va, access) {
                Ok(resolved) => {
                    log_debug!(target: "trap", "fault va={:#x} {:?} -> {:?}", va, access, resolved);
                }
                Err(err) => {
                    let pid = sched::with_current(|pid, data| {
                        if let Some(tf) = data.trapframe() {
                            let _ = fmt_trap(tf, scause, va, &mut crate::uart::raw_writer());
                        }
                        pid
                    });
                    panic!("page fault: task {} {:?} va={:#x} sepc={:#x}: {:?}", pid, access, va, sepc, err)
                }
            }
        }
        Cause::Timer => {
            clock_tick();
            sched::yield_now();
        }
        other => {
            let pid = sched::with_current(|pid, _| pid);
            log_warn!(
                target: "trap",
                "task {}: {} ({:?}) sepc={:#x} stval={:#x}",
                pid,
                describe_cause(scause),
                other,
                sepc,
                riscv::read_stval()
            );
            sched::kill_current();
        }
    }

    sched::exit_if_killed();
    user_return()
}

/// Returns to user mode in the current task.
pub fn user_return() -> ! {
    riscv::intr_off();
    riscv::write_stvec(trampoline::uservec_va());

    let satp = sched::with_current(|pid, data| {
        let kernel_sp = data.kstack.as_ref().map_or(0, |stack| stack.top());
        let satp = match data.space.as_ref() {
            Some(space) => space.satp(),
            None => panic!("user_return: task {} has no address space", pid),
        };
        let Some(tf) = data.trapframe() else {
            panic!("user_return: task {} has no trapframe", pid);
        };
        tf.kernel_satp = riscv::read_satp();
        tf.kernel_sp = kernel_sp;
        tf.kernel_trap = axon_user_trap as usize;
        tf.kernel_hartid = cpu::cpu_id();
        riscv::write_sepc(tf.epc);
        satp
    });

    let sstatus = (riscv::read_sstatus() & !SSTATUS_SPP) | SSTATUS_SPIE;
    riscv::write_sstatus(sstatus);
    enter_user(satp)
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn enter_user(satp: usize) -> ! {
    // SAFETY: `userret` lives in the trampoline page mapped at the same
    // address in the kernel and in the user table it switches to.
    let userret: extern "C" fn(usize) -> ! = unsafe { core::mem::transmute(trampoline::userret_va()) };
    userret(satp)
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn enter_user(_satp: usize) -> ! {
    panic!("enter_user: no user mode on the host");
}

// kernel traps

#[no_mangle]
pub extern "C" fn axon_kernel_trap() {
    kernel_trap();
}

/// Handles a trap taken in supervisor mode. Only timer interrupts are
/// expected; everything else is a kernel bug.
pub fn kernel_trap() {
    let sepc = riscv::read_sepc();
    let sstatus = riscv::read_sstatus();
    let scause = riscv::read_scause();
    if sstatus & SSTATUS_SPP == 0 {
        panic!("kernel_trap: not from supervisor mode");
    }
    if riscv::intr_get() {
        panic!("kernel_trap: interrupts enabled");
    }

    match decode(scause) {
        Cause::Timer => {
            clock_tick();
            if sched::running() {
                sched::yield_now();
            }
        }
        _ => {
            let mut out = crate::uart::raw_writer();
            let _ = writeln!(out, "kernel trap: {}", describe_cause(scause));
            panic!(
                "kernel_trap: scause={:#x} sepc={:#x} stval={:#x}",
                scause,
                sepc,
                riscv::read_stval()
            );
        }
    }

    // The yield may have taken other traps; restore this one's state.
    riscv::write_sepc(sepc);
    riscv::write_sstatus(sstatus);
}
