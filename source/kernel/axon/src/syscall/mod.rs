// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall dispatcher and error handling
//! OWNERS: @kernel-team
//! PUBLIC API: SyscallTable, Args, Error, Handler, SYSCALL_* IDs, dispatch_current()
//! DEPENDS_ON: exec, mm, task, sched, syscall::api
//! INVARIANTS: Fixed MAX_SYSCALL window; stable IDs; failures return a negated errno in a0
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod api;

use core::fmt;

use crate::exec::ExecError;
use crate::mm::address_space::VmError;
use crate::mm::page_table::MapError;
use crate::mm::FRAMES;
use crate::task::{self, FileError, KillError, TaskError, WaitError};
use crate::trap::TrapFrame;
use crate::{log_debug, sched};

/// Maximum number of syscalls supported by this increment.
const MAX_SYSCALL: usize = 32;

/// Result type used by syscall handlers.
pub type SysResult<T> = Result<T, Error>;

/// Syscall arguments passed in registers a0-a5.
#[derive(Default, Clone, Copy, Debug)]
pub struct Args {
    regs: [usize; 6],
}

impl Args {
    /// Creates a new argument pack from the provided registers.
    pub const fn new(regs: [usize; 6]) -> Self {
        Self { regs }
    }

    /// Reads a0-a5 from a saved user frame.
    pub fn from_frame(frame: &TrapFrame) -> Self {
        let mut regs = [0; 6];
        for (index, reg) in regs.iter_mut().enumerate() {
            *reg = frame.arg(index);
        }
        Self { regs }
    }

    /// Returns the raw register at `index`.
    pub fn get(&self, index: usize) -> usize {
        self.regs[index]
    }
}

/// Public syscall numbers.
pub const SYSCALL_PUTC: usize = 1;
pub const SYSCALL_EXIT: usize = 2;
pub const SYSCALL_FORK: usize = 3;
pub const SYSCALL_WAIT: usize = 4;
pub const SYSCALL_MMAP: usize = 5;
pub const SYSCALL_MUNMAP: usize = 6;
pub const SYSCALL_WRITE: usize = 7;
pub const SYSCALL_READ: usize = 8;
pub const SYSCALL_GETPID: usize = 9;
pub const SYSCALL_KILL: usize = 10;
pub const SYSCALL_EXEC: usize = 11;
/// Filesystem surface; answered with `ENOSYS` by the core.
pub const SYSCALL_OPEN: usize = 12;
pub const SYSCALL_CHDIR: usize = 13;
pub const SYSCALL_IOCTL: usize = 14;
pub const SYSCALL_CLOSE: usize = 15;
/// Sleeps for a0 timer ticks.
pub const SYSCALL_SLEEP: usize = 16;
pub const SYSCALL_YIELD: usize = 17;

/// errno values returned (negated) to user space.
pub mod errno {
    pub const EPERM: usize = 1;
    pub const ENOENT: usize = 2;
    pub const ESRCH: usize = 3;
    pub const ENOEXEC: usize = 8;
    pub const EBADF: usize = 9;
    pub const ECHILD: usize = 10;
    pub const ENOMEM: usize = 12;
    pub const EFAULT: usize = 14;
    pub const EEXIST: usize = 17;
    pub const EINVAL: usize = 22;
    pub const EMFILE: usize = 24;
    pub const ENOSYS: usize = 38;
}

/// Error returned by the dispatcher and handler stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Syscall number not present in the dispatch table.
    InvalidSyscall,
    /// Implemented by the filesystem layer, not by the core.
    NotSupported,
    /// Malformed argument register.
    InvalidArgument,
    /// User pointer not backed by a permitting mapping.
    BadAddress,
    /// Address-space operation failed.
    AddressSpace(VmError),
    /// Task creation failed.
    Task(TaskError),
    Wait(WaitError),
    Kill(KillError),
    File(FileError),
    Exec(ExecError),
}

impl From<VmError> for Error {
    fn from(value: VmError) -> Self {
        Self::AddressSpace(value)
    }
}

impl From<TaskError> for Error {
    fn from(value: TaskError) -> Self {
        Self::Task(value)
    }
}

impl From<WaitError> for Error {
    fn from(value: WaitError) -> Self {
        Self::Wait(value)
    }
}

impl From<KillError> for Error {
    fn from(value: KillError) -> Self {
        Self::Kill(value)
    }
}

impl From<FileError> for Error {
    fn from(value: FileError) -> Self {
        Self::File(value)
    }
}

impl From<ExecError> for Error {
    fn from(value: ExecError) -> Self {
        Self::Exec(value)
    }
}

fn vm_errno(err: VmError) -> usize {
    match err {
        VmError::Overlap | VmError::Map(MapError::AlreadyMapped) => errno::EEXIST,
        VmError::OutOfMemory | VmError::Map(MapError::OutOfMemory) => errno::ENOMEM,
        VmError::BadAddress => errno::EFAULT,
        VmError::InvalidArgs
        | VmError::ConflictingFlags
        | VmError::OutOfRange
        | VmError::NotMapped
        | VmError::Map(_) => errno::EINVAL,
    }
}

impl Error {
    /// Positive errno code for this error.
    pub fn code(self) -> usize {
        match self {
            Self::InvalidSyscall | Self::NotSupported => errno::ENOSYS,
            Self::InvalidArgument => errno::EINVAL,
            Self::BadAddress => errno::EFAULT,
            Self::AddressSpace(err) => vm_errno(err),
            Self::Task(TaskError::NoFreeSlot | TaskError::OutOfMemory) => errno::ENOMEM,
            Self::Task(TaskError::NoAddressSpace) => errno::EPERM,
            Self::Task(TaskError::Vm(err)) => vm_errno(err),
            Self::Wait(WaitError::NoChildren) => errno::ECHILD,
            Self::Wait(WaitError::BadAddress) => errno::EFAULT,
            Self::Kill(KillError::NotFound) => errno::ESRCH,
            Self::File(FileError::TooManyOpen) => errno::EMFILE,
            Self::File(_) => errno::EBADF,
            Self::Exec(ExecError::NotFound) => errno::ENOENT,
            Self::Exec(ExecError::TooManyArgs | ExecError::ArgsTooLarge) => errno::EINVAL,
            Self::Exec(ExecError::Vm(err)) => vm_errno(err),
            Self::Exec(_) => errno::ENOEXEC,
        }
    }

    /// Value placed in a0: the negated errno.
    pub fn to_return(self) -> usize {
        errno_return(self.code())
    }
}

/// Two's complement encoding of `-code`.
pub const fn errno_return(code: usize) -> usize {
    (-(code as isize)) as usize
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} (errno {})", self, self.code())
    }
}

/// Type alias for a syscall handler.
pub type Handler = fn(&mut api::Context<'_>, &Args) -> SysResult<usize>;

/// Dispatch table storing handlers by syscall number.
pub struct SyscallTable {
    handlers: [Option<Handler>; MAX_SYSCALL],
}

impl SyscallTable {
    /// Creates an empty dispatch table.
    pub const fn new() -> Self {
        const NONE: Option<Handler> = None;
        Self { handlers: [NONE; MAX_SYSCALL] }
    }

    /// Registers a handler.
    pub fn register(&mut self, number: usize, handler: Handler) {
        if number < MAX_SYSCALL {
            self.handlers[number] = Some(handler);
        }
    }

    /// Executes the handler referenced by `number`.
    #[must_use]
    pub fn dispatch(&self, number: usize, ctx: &mut api::Context<'_>, args: &Args) -> SysResult<usize> {
        self.handlers
            .get(number)
            .and_then(|entry| *entry)
            .ok_or(Error::InvalidSyscall)
            .and_then(|handler| handler(ctx, args))
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

static TABLE: spin::Once<SyscallTable> = spin::Once::new();

fn table() -> &'static SyscallTable {
    TABLE.call_once(|| {
        let mut table = SyscallTable::new();
        api::install_handlers(&mut table);
        table
    })
}

/// Runs syscall `number` for the task on this hart and returns the value
/// for a0.
pub fn dispatch_current(number: usize, args: &Args) -> usize {
    let pid = sched::current();
    // SAFETY: `pid` is the task running on this hart.
    let mut ctx = unsafe { api::Context::new(task::table(), &FRAMES, pid) };
    match table().dispatch(number, &mut ctx, args) {
        Ok(value) => value,
        Err(err) => {
            log_debug!(target: "sys", "task {} syscall {} failed: {}", pid, number, err);
            err.to_return()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_negated_errno() {
        assert_eq!(Error::InvalidSyscall.to_return(), usize::MAX - 37);
        assert_eq!(Error::from(WaitError::NoChildren).code(), errno::ECHILD);
        assert_eq!(Error::from(VmError::Overlap).code(), errno::EEXIST);
        assert_eq!(Error::from(TaskError::NoFreeSlot).code(), errno::ENOMEM);
        assert_eq!(Error::from(ExecError::Vm(VmError::OutOfMemory)).code(), errno::ENOMEM);
        assert_eq!(Error::from(ExecError::WrongMachine).code(), errno::ENOEXEC);
        assert_eq!(Error::from(FileError::TooManyOpen).code(), errno::EMFILE);
        assert_eq!(Error::from(KillError::NotFound).code(), errno::ESRCH);
        assert_eq!(errno_return(errno::EFAULT) as isize, -14);
    }

    #[test]
    fn args_come_from_a0_to_a5() {
        let mut frame = TrapFrame::default();
        for (offset, reg) in frame.x[10..16].iter_mut().enumerate() {
            *reg = 100 + offset;
        }
        frame.x[17] = SYSCALL_GETPID;
        let args = Args::from_frame(&frame);
        assert_eq!((args.get(0), args.get(5)), (100, 105));
        assert_eq!(frame.syscall_number(), SYSCALL_GETPID);
    }

    #[test]
    fn out_of_window_registration_is_ignored() {
        fn nop(_: &mut api::Context<'_>, _: &Args) -> SysResult<usize> {
            Ok(0)
        }
        let mut table = SyscallTable::new();
        table.register(MAX_SYSCALL, nop);
        assert!(table.handlers.iter().all(Option::is_none));
    }
}
