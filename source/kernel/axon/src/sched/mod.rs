// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-hart round-robin scheduler and the blocking primitives built on it
//! OWNERS: @kernel-sched-team
//! PUBLIC API: scheduler(), sched(), yield_now(), sleep(), wakeup(), sem_down(), create_task(), fork(), exit(), wait(), kill()
//! DEPENDS_ON: task::TaskTable, cpu (per-hart state), arch::riscv::switch::swtch, trap (tick clock, user return)
//! INVARIANTS: A task leaves the CPU only via sched() holding exactly its own task lock with interrupts off
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use crate::arch::riscv::{self, switch::swtch};
use crate::cpu::{self, this_cpu};
use crate::mm::FRAMES;
use crate::sync::{Down, Semaphore, SpinLock, SpinLockGuard};
use crate::task::{self, KillError, Task, TaskData, TaskError, TaskInner, TaskState, WaitError};
use crate::trap;
use crate::types::{Channel, Pid};
use crate::{log_debug, log_info};

/// Exit status recorded for tasks terminated through `kill`.
pub const KILLED_STATUS: i32 = -1;

/// Runs forever on each hart, switching into runnable tasks in table order.
pub fn scheduler() -> ! {
    let cpu = this_cpu();
    cpu.set_current(None);
    let tasks = task::table();
    log_info!(target: "sched", "hart {} entering scheduler", cpu::cpu_id());
    loop {
        // Devices and the timer must be able to interrupt an idle pass.
        riscv::intr_on();
        let mut ran = false;
        for task in tasks.iter() {
            let mut ctl = task.lock();
            if ctl.state == TaskState::Runnable {
                ctl.state = TaskState::Running;
                cpu.set_current(Some(task.pid()));
                // SAFETY: the task lock is held, the task is not running
                // anywhere else and both contexts outlive the switch.
                unsafe { swtch(cpu.scheduler_context(), task.context_ptr()) };
                cpu.set_current(None);
                ran = true;
            }
            drop(ctl);
        }
        if !ran && cfg!(feature = "timer_irq") {
            riscv::wait_for_interrupt();
        }
    }
}

/// Switches from the current task back to this hart's scheduler.
///
/// The caller holds exactly its own task lock and has already moved the
/// task out of `Running`. The lock is held again when this returns.
pub fn sched(guard: SpinLockGuard<'_, TaskInner>) -> SpinLockGuard<'_, TaskInner> {
    let cpu = this_cpu();
    let Some(me) = cpu.current() else {
        panic!("sched: no current task");
    };
    if !SpinLockGuard::lock_ref(&guard).holding() {
        panic!("sched: task {} lock not held", me);
    }
    if cpu.noff() != 1 {
        panic!("sched: task {} holds {} locks", me, cpu.noff());
    }
    if guard.state == TaskState::Running {
        panic!("sched: task {} still running", me);
    }
    if riscv::intr_get() {
        panic!("sched: interruptible");
    }

    let intena = cpu.intena();
    let task = current_task();
    // SAFETY: preconditions checked above; the scheduler context belongs
    // to this hart.
    unsafe { swtch(task.context_ptr(), cpu.scheduler_context()) };
    // The task may resume on another hart.
    this_cpu().set_intena(intena);
    guard
}

/// Gives up the CPU for one scheduling round.
pub fn yield_now() {
    let task = current_task();
    let mut ctl = task.lock();
    ctl.state = TaskState::Runnable;
    drop(sched(ctl));
}

/// Atomically releases `guard` and sleeps on `chan`; re-acquires the
/// caller's lock before returning.
pub fn sleep<'a, T>(chan: Channel, guard: SpinLockGuard<'a, T>) -> SpinLockGuard<'a, T> {
    let (ctl, lock) = task::table().sleep_on(current(), chan, guard);
    let mut ctl = sched(ctl);
    ctl.chan = None;
    drop(ctl);
    lock.lock()
}

/// Wakes every other task sleeping on `chan`.
pub fn wakeup(chan: Channel) {
    if let Some(tasks) = task::try_table() {
        tasks.wakeup(chan, cpu::current_pid());
    }
}

/// Blocking P on `sem` for the current task.
pub fn sem_down(sem: &Semaphore) {
    let me = current();
    if let Down::Blocked(ctl) = sem.down(task::table(), me) {
        drop(sched(ctl));
    }
}

/// V on `sem`; returns the task it woke.
pub fn sem_up(sem: &Semaphore) -> Option<Pid> {
    sem.up(task::table())
}

static TICK_LOCK: SpinLock<()> = SpinLock::new("ticks", ());

/// Lock held while the tick counter advances, pairing with `sleep_ticks`.
pub fn tick_lock() -> &'static SpinLock<()> {
    &TICK_LOCK
}

/// Sleeps for `n` timer ticks, or until the task is killed.
pub fn sleep_ticks(n: u64) {
    let me = current();
    let mut guard = TICK_LOCK.lock();
    let start = trap::ticks();
    while trap::ticks().wrapping_sub(start) < n {
        if task::table().killed(me) {
            break;
        }
        guard = sleep(trap::tick_channel(), guard);
    }
    drop(guard);
}

/// Creates a kernel helper task; it becomes a child of the caller (or of
/// the root task when called outside any task).
pub fn create_task(name: &str, entry: fn(usize), arg: usize) -> Result<Pid, TaskError> {
    let tasks = task::table();
    let parent = cpu::current_pid().or_else(|| tasks.root());
    let pid = tasks.create_kernel_task(&FRAMES, parent, name, entry, arg)?;
    log_debug!(target: "sched", "created kernel task {} ({})", pid, name);
    Ok(pid)
}

/// Forks the current task.
pub fn fork() -> Result<Pid, TaskError> {
    task::table().fork(current(), &FRAMES)
}

/// Terminates the current task.
pub fn exit(status: i32) -> ! {
    let me = current();
    let ctl = task::table().exit(me, status);
    log_debug!(target: "sched", "task {} exited with {}", me, status);
    drop(sched(ctl));
    panic!("exit: zombie task {} was rescheduled", me);
}

/// Waits for a child to exit and returns its id. The status is copied to
/// `status_ptr` in the caller's address space unless it is zero.
pub fn wait(status_ptr: usize) -> Result<Pid, WaitError> {
    let tasks = task::table();
    let me = current();
    if !tasks.has_children(me) {
        return Err(WaitError::NoChildren);
    }
    let sem = current_task().child_sem();
    loop {
        sem_down(sem);
        let reaped = tasks.reap(me, &FRAMES, |_, status| {
            status_ptr == 0
                || with_current(|_, data| {
                    data.space
                        .as_mut()
                        .is_some_and(|space| space.copy_out(&FRAMES, status_ptr, &status.to_ne_bytes()).is_ok())
                })
        });
        match reaped {
            Ok(Some((pid, _))) => return Ok(pid),
            // A reparenting signal meant for an earlier zombie; look again.
            Ok(None) => continue,
            Err(err) => {
                // Hand the consumed signal back; the zombie is still there.
                let _ = sem_up(sem);
                return Err(err);
            }
        }
    }
}

/// Marks `pid` killed; killing oneself exits immediately.
pub fn kill(pid: Pid) -> Result<(), KillError> {
    task::table().kill(pid)?;
    if cpu::current_pid() == Some(pid) {
        exit(KILLED_STATUS);
    }
    Ok(())
}

/// Marks the current task killed without switching away.
pub fn kill_current() {
    task::table().set_killed(current());
}

/// Exits the current task if it has been killed.
pub fn exit_if_killed() {
    if task::table().killed(current()) {
        exit(KILLED_STATUS);
    }
}

/// Whether a task is running on this hart.
pub fn running() -> bool {
    match cpu::current_pid() {
        Some(pid) => task::table().state(pid) == TaskState::Running,
        None => false,
    }
}

/// Id of the task running on this hart.
pub fn current() -> Pid {
    match cpu::current_pid() {
        Some(pid) => pid,
        None => panic!("no current task on hart {}", cpu::cpu_id()),
    }
}

fn current_task() -> &'static Task {
    let pid = current();
    match task::table().task(pid) {
        Some(task) => task,
        None => panic!("current task {} not in table", pid),
    }
}

/// Runs `f` on the current task's owner-only fields.
///
/// `f` must not switch away or call `with_current` again.
pub fn with_current<R>(f: impl FnOnce(Pid, &mut TaskData) -> R) -> R {
    let task = current_task();
    // SAFETY: only the running task touches its own data, and the borrow
    // ends before the task can switch away.
    f(task.pid(), unsafe { task.data() })
}

/// First code a forked or spawned user task runs.
pub extern "C" fn fork_return() -> ! {
    let task = current_task();
    // SAFETY: the scheduler acquired this lock before switching here; its
    // guard stays on the scheduler stack and is released on the way back.
    unsafe { task.ctl().force_unlock() };
    trap::user_return()
}

/// First code a kernel helper task runs.
pub extern "C" fn kernel_task_entry() -> ! {
    let task = current_task();
    // SAFETY: as in `fork_return`.
    unsafe { task.ctl().force_unlock() };
    if let Some((entry, arg)) = with_current(|_, data| data.entry.take()) {
        entry(arg);
    }
    exit(0)
}
