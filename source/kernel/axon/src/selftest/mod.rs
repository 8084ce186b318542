// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-kernel selftests run as a kernel task once the scheduler is up.
//!
//! Host unit tests cover each state machine in isolation; these scenarios
//! exercise the real frame table, the real scheduler and several harts.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::mm::{Access, AddressSpace, FaultOutcome, MapFlags, Perm, FRAMES, PAGE_SIZE};
use crate::sync::{Semaphore, SleepLock};
use crate::types::Pid;
use crate::{sched, st_assert, st_expect_eq, st_expect_err, uart};

pub mod assert;

/// Starts the selftest task; a no-op unless the `selftest` feature is on.
pub fn spawn() {
    if !cfg!(feature = "selftest") {
        return;
    }
    if let Err(err) = sched::create_task("selftest", run, 0) {
        assert::report_failure_fmt(format_args!("spawn selftest task: {:?}", err));
    }
}

fn run(_: usize) {
    uart::write_line("SELFTEST: begin");
    test_cow();
    uart::write_line("SELFTEST: cow ok");
    test_semaphore_fifo();
    uart::write_line("SELFTEST: semaphore ok");
    test_sleeplock();
    uart::write_line("SELFTEST: sleeplock ok");
    uart::write_line("SELFTEST: end");
}

fn test_cow() {
    let baseline = FRAMES.tracked();
    let mut parent = match AddressSpace::new(&FRAMES) {
        Ok(space) => space,
        Err(err) => assert::report_failure_fmt(format_args!("address space: {:?}", err)),
    };
    let rw = Perm::READ | Perm::WRITE;
    let private = parent.mmap(&FRAMES, 0, PAGE_SIZE, rw, MapFlags::PRIVATE | MapFlags::ANONYMOUS, true);
    let shared = parent.mmap(&FRAMES, 0, PAGE_SIZE, rw, MapFlags::SHARED | MapFlags::ANONYMOUS, true);
    let (Ok(private), Ok(shared)) = (private, shared) else {
        assert::report_failure("mmap of the test regions failed");
    };
    st_assert!(parent.copy_out(&FRAMES, private, b"parent").is_ok());

    let mut child = match parent.clone_for_fork(&FRAMES) {
        Ok(space) => space,
        Err(err) => assert::report_failure_fmt(format_args!("fork clone: {:?}", err)),
    };
    let frame = parent.entry(private).map(|pte| pte.pa());
    st_expect_eq!(frame, child.entry(private).map(|pte| pte.pa()));
    st_expect_eq!(frame.map(|pa| FRAMES.ref_count(pa)), Some(2));

    // First write from the child copies; the parent then owns its frame alone.
    st_expect_eq!(child.handle_fault(&FRAMES, private, Access::Write), Ok(FaultOutcome::CowCopied));
    st_assert!(child.copy_out(&FRAMES, private, b"child!").is_ok());
    st_expect_eq!(parent.handle_fault(&FRAMES, private, Access::Write), Ok(FaultOutcome::CowInPlace));
    let mut seen = [0u8; 6];
    st_assert!(parent.copy_in(&FRAMES, &mut seen, private).is_ok());
    st_expect_eq!(&seen, b"parent");

    // Shared pages stay one frame and writable on both sides.
    st_assert!(child.copy_out(&FRAMES, shared, b"both").is_ok());
    let mut both = [0u8; 4];
    st_assert!(parent.copy_in(&FRAMES, &mut both, shared).is_ok());
    st_expect_eq!(&both, b"both");

    st_expect_err!(child.munmap(&FRAMES, private + 1), crate::mm::VmError::NotMapped);
    child.release(&FRAMES);
    parent.release(&FRAMES);
    st_expect_eq!(FRAMES.tracked(), baseline);
}

const WAITERS: usize = 3;

static FIFO_SEM: Semaphore = Semaphore::new("selftest_fifo", 0);
static FIFO_WOKEN: AtomicUsize = AtomicUsize::new(0);

fn fifo_waiter(_: usize) {
    sched::sem_down(&FIFO_SEM);
    FIFO_WOKEN.fetch_add(1, Ordering::AcqRel);
}

fn test_semaphore_fifo() {
    let mut spawned: Vec<Pid> = Vec::new();
    for queued in 1..=WAITERS {
        match sched::create_task("fifo", fifo_waiter, 0) {
            Ok(pid) => spawned.push(pid),
            Err(err) => assert::report_failure_fmt(format_args!("spawn waiter: {:?}", err)),
        }
        // Queue each waiter before starting the next one.
        while FIFO_SEM.waiting() < queued {
            sched::yield_now();
        }
    }
    st_expect_eq!(FIFO_SEM.count(), -(WAITERS as isize));

    let mut woken = Vec::new();
    for released in 1..=WAITERS {
        woken.push(sched::sem_up(&FIFO_SEM));
        while FIFO_WOKEN.load(Ordering::Acquire) < released {
            sched::yield_now();
        }
    }
    let expected: Vec<Option<Pid>> = spawned.iter().copied().map(Some).collect();
    st_expect_eq!(woken, expected);
    for _ in 0..WAITERS {
        st_assert!(sched::wait(0).is_ok());
    }
    st_expect_eq!(FIFO_SEM.count(), 0);
}

const ROUNDS: usize = 50;

static COUNTER: SleepLock<usize> = SleepLock::new("selftest_counter", 0);

fn bump(_: usize) {
    for _ in 0..ROUNDS {
        let mut count = COUNTER.lock();
        let seen = *count;
        // Hold the lock across a switch so the other task has to sleep on it.
        sched::yield_now();
        *count = seen + 1;
    }
}

fn test_sleeplock() {
    for _ in 0..2 {
        if let Err(err) = sched::create_task("bump", bump, 0) {
            assert::report_failure_fmt(format_args!("spawn bump: {:?}", err));
        }
    }
    for _ in 0..2 {
        st_assert!(sched::wait(0).is_ok());
    }
    st_expect_eq!(*COUNTER.lock(), 2 * ROUNDS);
    st_expect_err!(sched::wait(0), crate::task::WaitError::NoChildren);
}
