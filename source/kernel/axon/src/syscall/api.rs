// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: sched, task::TaskTable, mm::AddressSpace, exec
//! INVARIANTS: Stable syscall IDs; Decode→Check→Execute pattern; user memory is touched only through the caller's address space
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::vec;
use alloc::vec::Vec;
use core::cmp;

use super::{
    Args, Error, SysResult, SyscallTable, SYSCALL_CHDIR, SYSCALL_CLOSE, SYSCALL_EXEC, SYSCALL_EXIT,
    SYSCALL_FORK, SYSCALL_GETPID, SYSCALL_IOCTL, SYSCALL_KILL, SYSCALL_MMAP, SYSCALL_MUNMAP,
    SYSCALL_OPEN, SYSCALL_PUTC, SYSCALL_READ, SYSCALL_SLEEP, SYSCALL_WAIT, SYSCALL_WRITE,
    SYSCALL_YIELD,
};
use crate::exec::{self, ExecError};
use crate::mm::address_space::AddressSpace;
use crate::mm::frame::Frames;
use crate::mm::layout::PAGE_SIZE;
use crate::mm::vma::{MapFlags, Perm};
use crate::param::{MAXARG, MAXPATH};
use crate::task::{TaskData, TaskTable};
use crate::types::Pid;
use crate::{log_debug, sched, uart};

/// Bytes moved between user memory and a file per step.
const IO_CHUNK: usize = 128;

/// Execution context of one syscall.
pub struct Context<'a> {
    tasks: &'a TaskTable,
    frames: &'a Frames<'a>,
    pid: Pid,
}

impl<'a> Context<'a> {
    /// Creates a context acting on behalf of `pid`.
    ///
    /// # Safety
    ///
    /// `pid` must be the task running on this hart, or a slot the caller
    /// otherwise owns, for as long as the context is used.
    pub unsafe fn new(tasks: &'a TaskTable, frames: &'a Frames<'a>, pid: Pid) -> Self {
        Self { tasks, frames, pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Owner-only fields of the calling task.
    pub fn task_data(&mut self) -> &mut TaskData {
        match self.tasks.task(self.pid) {
            // SAFETY: upheld by the caller of `Context::new`.
            Some(task) => unsafe { task.data() },
            None => panic!("syscall context for unknown task {}", self.pid),
        }
    }

    fn space(&mut self) -> SysResult<&mut AddressSpace> {
        self.task_data().space.as_mut().ok_or(Error::BadAddress)
    }
}

// Typed decoders for Decode→Check→Execute

#[derive(Copy, Clone, Debug)]
struct MmapArgsTyped {
    addr: usize,
    len: usize,
    perm: Perm,
    flags: MapFlags,
    populate: bool,
}

impl MmapArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Result<Self, Error> {
        Ok(Self {
            addr: args.get(0),
            len: args.get(1),
            perm: Perm::from_bits(args.get(2)).ok_or(Error::InvalidArgument)?,
            flags: MapFlags::from_bits(args.get(3)).ok_or(Error::InvalidArgument)?,
            populate: args.get(4) != 0,
        })
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        // Sv39 has no write-only or permission-less leaves.
        if !self.perm.contains(Perm::READ) {
            return Err(Error::InvalidArgument);
        }
        Ok(())
    }
}

#[derive(Copy, Clone, Debug)]
struct IoArgsTyped {
    fd: usize,
    buf: usize,
    len: usize,
}

impl IoArgsTyped {
    #[inline]
    fn decode(args: &Args) -> Self {
        Self { fd: args.get(0), buf: args.get(1), len: args.get(2) }
    }

    #[inline]
    fn check(&self) -> Result<(), Error> {
        self.buf.checked_add(self.len).ok_or(Error::BadAddress)?;
        Ok(())
    }
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(SYSCALL_PUTC, sys_putc);
    table.register(SYSCALL_EXIT, sys_exit);
    table.register(SYSCALL_FORK, sys_fork);
    table.register(SYSCALL_WAIT, sys_wait);
    table.register(SYSCALL_MMAP, sys_mmap);
    table.register(SYSCALL_MUNMAP, sys_munmap);
    table.register(SYSCALL_WRITE, sys_write);
    table.register(SYSCALL_READ, sys_read);
    table.register(SYSCALL_GETPID, sys_getpid);
    table.register(SYSCALL_KILL, sys_kill);
    table.register(SYSCALL_EXEC, sys_exec);
    table.register(SYSCALL_OPEN, sys_not_supported);
    table.register(SYSCALL_CHDIR, sys_not_supported);
    table.register(SYSCALL_IOCTL, sys_not_supported);
    table.register(SYSCALL_CLOSE, sys_close);
    table.register(SYSCALL_SLEEP, sys_sleep);
    table.register(SYSCALL_YIELD, sys_yield);
}

/// Debug console write of the byte in a0; no descriptor needed.
fn sys_putc(_ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let byte = (args.get(0) & 0xff) as u8;
    uart::write_bytes(&[byte]);
    Ok(byte as usize)
}

fn sys_exit(_ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    sched::exit(args.get(0) as i32)
}

fn sys_fork(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let child = ctx.tasks.fork(ctx.pid, ctx.frames)?;
    log_debug!(target: "sys", "fork: {} -> {}", ctx.pid, child);
    Ok(child.as_raw() as usize)
}

fn sys_wait(_ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let child = sched::wait(args.get(0))?;
    Ok(child.as_raw() as usize)
}

fn sys_mmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = MmapArgsTyped::decode(args)?;
    typed.check()?;
    let frames = ctx.frames;
    let start = ctx.space()?.mmap(frames, typed.addr, typed.len, typed.perm, typed.flags, typed.populate)?;
    Ok(start)
}

fn sys_munmap(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let frames = ctx.frames;
    ctx.space()?.munmap(frames, args.get(0))?;
    Ok(0)
}

fn sys_write(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = IoArgsTyped::decode(args);
    typed.check()?;
    let file = ctx.task_data().files.get(typed.fd)?;
    let frames = ctx.frames;
    let mut chunk = [0u8; IO_CHUNK];
    let mut done = 0;
    while done < typed.len {
        let n = cmp::min(IO_CHUNK, typed.len - done);
        ctx.space()?.copy_in(frames, &mut chunk[..n], typed.buf + done)?;
        let written = file.write(&chunk[..n])?;
        done += written;
        if written < n {
            break;
        }
    }
    Ok(done)
}

/// Reads at most one chunk; short reads are normal.
fn sys_read(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let typed = IoArgsTyped::decode(args);
    typed.check()?;
    let file = ctx.task_data().files.get(typed.fd)?;
    let frames = ctx.frames;
    let mut chunk = [0u8; IO_CHUNK];
    let n = cmp::min(IO_CHUNK, typed.len);
    let got = file.read(&mut chunk[..n])?;
    ctx.space()?.copy_out(frames, typed.buf, &chunk[..got])?;
    Ok(got)
}

fn sys_getpid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.pid.as_raw() as usize)
}

fn sys_kill(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let raw = u32::try_from(args.get(0)).map_err(|_| Error::from(crate::task::KillError::NotFound))?;
    let target = Pid::from_raw(raw);
    ctx.tasks.kill(target)?;
    if target == ctx.pid {
        sched::exit(sched::KILLED_STATUS);
    }
    Ok(0)
}

fn sys_exec(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let frames = ctx.frames;
    let mut raw_path = [0u8; MAXPATH];
    let len = ctx.space()?.copy_in_str(frames, &mut raw_path, args.get(0))?;
    let path = core::str::from_utf8(&raw_path[..len]).map_err(|_| Error::InvalidArgument)?;
    let source = exec::PROGRAMS.lookup(path).ok_or(ExecError::NotFound)?;

    let argv = fetch_argv(ctx, args.get(1))?;
    let views: Vec<&[u8]> = argv.iter().map(Vec::as_slice).collect();
    let image = exec::load_elf(frames, source, &views)?;
    let trampoline = ctx.tasks.trampoline();
    let argc = exec::commit(frames, trampoline, ctx.task_data(), path, image)?;
    log_debug!(target: "sys", "exec: task {} -> {} argc={}", ctx.pid, path, argc);
    Ok(argc)
}

/// Copies the NULL-terminated argv array at `uargv` (which may be null).
fn fetch_argv(ctx: &mut Context<'_>, uargv: usize) -> SysResult<Vec<Vec<u8>>> {
    let frames = ctx.frames;
    let mut argv = Vec::new();
    if uargv == 0 {
        return Ok(argv);
    }
    loop {
        let at = argv
            .len()
            .checked_mul(core::mem::size_of::<usize>())
            .and_then(|offset| uargv.checked_add(offset))
            .ok_or(Error::BadAddress)?;
        let mut raw = [0u8; core::mem::size_of::<usize>()];
        ctx.space()?.copy_in(frames, &mut raw, at)?;
        let pointer = usize::from_le_bytes(raw);
        if pointer == 0 {
            return Ok(argv);
        }
        if argv.len() == MAXARG {
            return Err(ExecError::TooManyArgs.into());
        }
        let mut arg = vec![0u8; PAGE_SIZE];
        let len = ctx.space()?.copy_in_str(frames, &mut arg, pointer)?;
        arg.truncate(len);
        argv.push(arg);
    }
}

/// open, chdir and ioctl belong to the filesystem layer.
fn sys_not_supported(_ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Err(Error::NotSupported)
}

fn sys_close(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    ctx.task_data().files.close(args.get(0))?;
    Ok(0)
}

fn sys_sleep(_ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    sched::sleep_ticks(args.get(0) as u64);
    Ok(0)
}

fn sys_yield(_ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    sched::yield_now();
    Ok(0)
}
