// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Task table and lifecycle: claim, fork, exit, reap, kill, reparenting
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Host unit tests (fork/exit/wait/reparent/kill), boot selftests
//! PUBLIC API: TaskTable, Task, TaskState, TaskInner, TaskData, TaskError, WaitError, KillError
//! DEPENDS_ON: mm::AddressSpace, sync::{SpinLock, Semaphore}, trap::TrapFrame, task::file
//! INVARIANTS: Pid == slot index; lock order parents -> child semaphore -> task -> frame refs
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

pub mod file;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr;

use crate::arch::riscv::switch::Context;
use crate::mm::address_space::{AddressSpace, VmError};
use crate::mm::frame::Frames;
use crate::param::{KSTACK_SIZE, TASK_NAME_LEN};
use crate::sched;
use crate::sync::{Parking, Semaphore, SpinLock, SpinLockGuard};
use crate::trap::TrapFrame;
use crate::types::{Channel, Pid};

pub use file::{Console, FileError, FileObject, FileRef, FileTable};

/// Scheduling state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Unused,
    /// Claimed and being set up; never scheduled.
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// Errors returned when creating tasks.
#[must_use = "task creation errors must be handled"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    NoFreeSlot,
    OutOfMemory,
    /// The caller has no user address space to clone.
    NoAddressSpace,
    Vm(VmError),
}

impl From<VmError> for TaskError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::OutOfMemory => TaskError::OutOfMemory,
            other => TaskError::Vm(other),
        }
    }
}

/// Errors returned when waiting for children.
#[must_use = "wait errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The caller has no children to reap.
    NoChildren,
    /// The exit status could not be delivered; the child stays a zombie.
    BadAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillError {
    NotFound,
}

/// Fields guarded by the per-task lock.
#[derive(Debug)]
pub struct TaskInner {
    pub state: TaskState,
    pub chan: Option<Channel>,
    /// Set by `kill`; acted upon at the next user/kernel crossing.
    pub killed: bool,
    pub xstate: i32,
}

impl TaskInner {
    const fn new() -> Self {
        Self { state: TaskState::Unused, chan: None, killed: false, xstate: 0 }
    }
}

/// Heap-backed kernel stack.
pub struct KernelStack {
    mem: Box<[u8]>,
}

impl KernelStack {
    pub fn new() -> Option<Self> {
        let mut mem = Vec::new();
        mem.try_reserve_exact(KSTACK_SIZE).ok()?;
        mem.resize(KSTACK_SIZE, 0);
        Some(Self { mem: mem.into_boxed_slice() })
    }

    /// Initial stack pointer, 16-byte aligned.
    pub fn top(&self) -> usize {
        (self.mem.as_ptr() as usize + self.mem.len()) & !0xf
    }
}

/// Kernel task body and its argument.
pub type KernelEntry = (fn(usize), usize);

/// Fields owned by whoever currently owns the slot: the running task
/// itself, or the creator/reaper while the slot is `Used`/`Zombie`.
pub struct TaskData {
    pub context: Context,
    pub kstack: Option<KernelStack>,
    /// Physical address of the trapframe page; zero when absent.
    pub trapframe: usize,
    pub space: Option<AddressSpace>,
    pub files: FileTable,
    /// Current directory; owned by the external filesystem.
    pub cwd: Option<FileRef>,
    pub name: [u8; TASK_NAME_LEN],
    pub entry: Option<KernelEntry>,
}

impl TaskData {
    const fn new() -> Self {
        Self {
            context: Context::zeroed(),
            kstack: None,
            trapframe: 0,
            space: None,
            files: FileTable::new(),
            cwd: None,
            name: [0; TASK_NAME_LEN],
            entry: None,
        }
    }

    pub fn trapframe(&mut self) -> Option<&mut TrapFrame> {
        if self.trapframe == 0 {
            return None;
        }
        // SAFETY: a non-zero `trapframe` is a zeroed, page-sized frame owned by
        // this slot; `TrapFrame` fits in a page and is valid for all bit patterns.
        Some(unsafe { &mut *(self.trapframe as *mut TrapFrame) })
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = [0; TASK_NAME_LEN];
        let len = core::cmp::min(name.len(), TASK_NAME_LEN);
        self.name[..len].copy_from_slice(&name.as_bytes()[..len]);
    }

    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(TASK_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    fn release(&mut self, frames: &Frames<'_>) {
        if let Some(space) = self.space.take() {
            space.release(frames);
        }
        if self.trapframe != 0 {
            frames.free(self.trapframe);
        }
        self.files.close_all();
        *self = TaskData::new();
    }
}

/// One slot of the task table.
pub struct Task {
    pid: Pid,
    ctl: SpinLock<TaskInner>,
    data: UnsafeCell<TaskData>,
    child_sem: Semaphore,
}

// SAFETY: `ctl` and `child_sem` synchronise themselves; `data` follows the
// ownership rule documented on `TaskData`.
unsafe impl Sync for Task {}

impl Task {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            ctl: SpinLock::new("task", TaskInner::new()),
            data: UnsafeCell::new(TaskData::new()),
            child_sem: Semaphore::new("child_wait", 0),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn lock(&self) -> SpinLockGuard<'_, TaskInner> {
        self.ctl.lock()
    }

    pub fn ctl(&self) -> &SpinLock<TaskInner> {
        &self.ctl
    }

    /// Signalled once per exiting child.
    pub fn child_sem(&self) -> &Semaphore {
        &self.child_sem
    }

    /// Mutable access to the owner-only fields.
    ///
    /// # Safety
    ///
    /// The caller must own the slot as described on [`TaskData`] and must
    /// not hold another reference obtained from this method.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data(&self) -> &mut TaskData {
        // SAFETY: upheld by the caller.
        unsafe { &mut *self.data.get() }
    }

    /// Location of the saved context, for `swtch`.
    pub fn context_ptr(&self) -> *mut Context {
        // SAFETY: no reference is created; the pointer stays valid for the
        // lifetime of the table.
        unsafe { ptr::addr_of_mut!((*self.data.get()).context) }
    }
}

/// Availability bitmap of task slots.
struct SlotMap {
    words: Vec<u64>,
    capacity: usize,
}

impl SlotMap {
    fn new(capacity: usize) -> Self {
        Self { words: alloc::vec![0; capacity.div_ceil(64)], capacity }
    }

    fn claim(&mut self) -> Option<usize> {
        for (word_index, word) in self.words.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let index = word_index * 64 + bit;
            if index >= self.capacity {
                return None;
            }
            *word |= 1 << bit;
            return Some(index);
        }
        None
    }

    fn release(&mut self, index: usize) {
        let (word, bit) = (index / 64, index % 64);
        if self.words[word] & (1 << bit) == 0 {
            panic!("task slot {} released twice", index);
        }
        self.words[word] &= !(1 << bit);
    }
}

/// Fixed-capacity table of every task in the system.
pub struct TaskTable {
    tasks: Box<[Task]>,
    slots: SpinLock<SlotMap>,
    /// Parent links, indexed by child slot. Also serialises exit/wait.
    parents: SpinLock<Vec<Option<Pid>>>,
    root: spin::Once<Pid>,
    trampoline: usize,
}

impl TaskTable {
    /// Creates a table with `capacity` slots. `trampoline` is the physical
    /// page holding the trap entry code, mapped into every user space.
    pub fn new(capacity: usize, trampoline: usize) -> Self {
        Self {
            tasks: (0..capacity).map(|index| Task::new(Pid::from_index(index))).collect(),
            slots: SpinLock::new("task_slots", SlotMap::new(capacity)),
            parents: SpinLock::new("parents", alloc::vec![None; capacity]),
            root: spin::Once::new(),
            trampoline,
        }
    }

    pub fn capacity(&self) -> usize {
        self.tasks.len()
    }

    /// Physical page holding the trap trampoline.
    pub fn trampoline(&self) -> usize {
        self.trampoline
    }

    pub fn task(&self, pid: Pid) -> Option<&Task> {
        self.tasks.get(pid.as_index())
    }

    fn slot(&self, pid: Pid) -> &Task {
        match self.tasks.get(pid.as_index()) {
            Some(task) => task,
            None => panic!("task table: pid {} out of range", pid),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Designates the task that inherits orphans.
    pub fn set_root(&self, pid: Pid) {
        self.root.call_once(|| pid);
    }

    pub fn root(&self) -> Option<Pid> {
        self.root.get().copied()
    }

    pub fn parent_of(&self, pid: Pid) -> Option<Pid> {
        self.parents.lock().get(pid.as_index()).copied().flatten()
    }

    /// Snapshot of a slot's state.
    pub fn state(&self, pid: Pid) -> TaskState {
        self.slot(pid).lock().state
    }

    pub fn killed(&self, pid: Pid) -> bool {
        self.slot(pid).lock().killed
    }

    pub fn set_killed(&self, pid: Pid) {
        self.slot(pid).lock().killed = true;
    }

    /// Claims a slot with a kernel stack and a trapframe page.
    fn claim(&self, frames: &Frames<'_>) -> Result<Pid, TaskError> {
        let index = self.slots.lock().claim().ok_or(TaskError::NoFreeSlot)?;
        let pid = Pid::from_index(index);
        self.slot(pid).child_sem().reset();
        let kstack = KernelStack::new();
        let trapframe = frames.alloc_zeroed();
        let (Some(kstack), Some(trapframe)) = (kstack, trapframe) else {
            if let Some(pa) = trapframe {
                frames.free(pa);
            }
            self.slots.lock().release(index);
            return Err(TaskError::OutOfMemory);
        };
        let task = self.slot(pid);
        {
            let mut ctl = task.lock();
            *ctl = TaskInner::new();
            ctl.state = TaskState::Used;
        }
        // SAFETY: the slot was just claimed and is not schedulable.
        let data = unsafe { task.data() };
        data.kstack = Some(kstack);
        data.trapframe = trapframe;
        Ok(pid)
    }

    /// Returns a claimed slot and everything it owns.
    fn discard(&self, pid: Pid, frames: &Frames<'_>) {
        let task = self.slot(pid);
        let mut ctl = task.lock();
        // SAFETY: the slot is `Used` or `Zombie` and owned by the caller.
        unsafe { task.data() }.release(frames);
        *ctl = TaskInner::new();
        self.slots.lock().release(pid.as_index());
    }

    fn make_runnable(&self, pid: Pid, parent: Option<Pid>) {
        self.parents.lock()[pid.as_index()] = parent;
        self.slot(pid).lock().state = TaskState::Runnable;
    }

    /// Creates a kernel helper task that runs `entry(arg)` and then exits.
    pub fn create_kernel_task(
        &self,
        frames: &Frames<'_>,
        parent: Option<Pid>,
        name: &str,
        entry: fn(usize),
        arg: usize,
    ) -> Result<Pid, TaskError> {
        let pid = self.claim(frames)?;
        // SAFETY: freshly claimed slot.
        let data = unsafe { self.slot(pid).data() };
        data.entry = Some((entry, arg));
        data.set_name(name);
        let top = data.kstack.as_ref().map_or(0, KernelStack::top);
        data.context = Context::entering(sched::kernel_task_entry as usize, top);
        self.make_runnable(pid, parent);
        Ok(pid)
    }

    /// Creates a user task around a prepared address space. The task starts
    /// at `entry` with stack pointer `sp` and the console on fds 0-2.
    pub fn spawn_user(
        &self,
        frames: &Frames<'_>,
        name: &str,
        mut space: AddressSpace,
        entry: usize,
        sp: usize,
    ) -> Result<Pid, TaskError> {
        let pid = match self.claim(frames) {
            Ok(pid) => pid,
            Err(err) => {
                space.release(frames);
                return Err(err);
            }
        };
        // SAFETY: freshly claimed slot.
        let data = unsafe { self.slot(pid).data() };
        if let Err(err) = space.map_trap_pages(frames, self.trampoline, data.trapframe) {
            space.release(frames);
            self.discard(pid, frames);
            return Err(err.into());
        }
        data.space = Some(space);
        if let Some(tf) = data.trapframe() {
            tf.epc = entry;
            tf.set_sp(sp);
        }
        data.files = FileTable::with_console();
        data.set_name(name);
        let top = data.kstack.as_ref().map_or(0, KernelStack::top);
        data.context = Context::entering(sched::fork_return as usize, top);
        self.make_runnable(pid, None);
        Ok(pid)
    }

    /// Duplicates `parent` into a new runnable child and returns its id.
    ///
    /// On failure every partially built piece of the child is released.
    pub fn fork(&self, parent: Pid, frames: &Frames<'_>) -> Result<Pid, TaskError> {
        let child = self.claim(frames)?;
        if let Err(err) = self.fork_into(parent, child, frames) {
            self.discard(child, frames);
            return Err(err);
        }
        self.make_runnable(child, Some(parent));
        Ok(child)
    }

    fn fork_into(&self, parent: Pid, child: Pid, frames: &Frames<'_>) -> Result<(), TaskError> {
        // SAFETY: `parent` is the calling task and `child` was just claimed;
        // the slots are distinct.
        let (from, to) = unsafe { (self.slot(parent).data(), self.slot(child).data()) };
        let space = from.space.as_mut().ok_or(TaskError::NoAddressSpace)?;
        let mut cloned = space.clone_for_fork(frames)?;
        if let Err(err) = cloned.map_trap_pages(frames, self.trampoline, to.trapframe) {
            cloned.release(frames);
            return Err(err.into());
        }
        to.space = Some(cloned);

        let saved = from.trapframe().map(|tf| *tf);
        if let (Some(saved), Some(tf)) = (saved, to.trapframe()) {
            *tf = saved;
            tf.set_a0(0);
        }
        to.files = from.files.duplicate();
        to.cwd = from.cwd.clone();
        to.name = from.name;
        let top = to.kstack.as_ref().map_or(0, KernelStack::top);
        to.context = Context::entering(sched::fork_return as usize, top);
        Ok(())
    }

    /// Turns `me` into a zombie carrying `status`.
    ///
    /// Closes files, hands children to the root task and signals the
    /// parent. Returns the task's own lock, held, for the final switch.
    pub fn exit(&self, me: Pid, status: i32) -> SpinLockGuard<'_, TaskInner> {
        let root = self.root();
        if root == Some(me) {
            panic!("exit: root task {} exiting with status {}", me, status);
        }
        let task = self.slot(me);
        // SAFETY: `me` is the calling task.
        let data = unsafe { task.data() };
        data.files.close_all();
        data.cwd = None;

        let mut parents = self.parents.lock();
        for index in 0..parents.len() {
            if parents[index] != Some(me) {
                continue;
            }
            parents[index] = root;
            let zombie = self.tasks[index].lock().state == TaskState::Zombie;
            if let (true, Some(root)) = (zombie, root) {
                let _ = self.slot(root).child_sem().up(self);
            }
        }
        if let Some(parent) = parents[me.as_index()] {
            let _ = self.slot(parent).child_sem().up(self);
        }

        let mut ctl = task.lock();
        ctl.state = TaskState::Zombie;
        ctl.xstate = status;
        drop(parents);
        ctl
    }

    /// Whether any slot names `me` as its parent.
    pub fn has_children(&self, me: Pid) -> bool {
        self.parents.lock().iter().any(|parent| *parent == Some(me))
    }

    /// Reaps one zombie child of `me`.
    ///
    /// `deliver` receives the child's id and status before anything is
    /// freed; returning `false` leaves the zombie in place. `Ok(None)` means
    /// children exist but none has exited yet.
    pub fn reap(
        &self,
        me: Pid,
        frames: &Frames<'_>,
        deliver: impl FnOnce(Pid, i32) -> bool,
    ) -> Result<Option<(Pid, i32)>, WaitError> {
        let mut parents = self.parents.lock();
        let mut has_children = false;
        for (index, task) in self.tasks.iter().enumerate() {
            if parents[index] != Some(me) {
                continue;
            }
            has_children = true;
            let mut ctl = task.lock();
            if ctl.state != TaskState::Zombie {
                continue;
            }
            let status = ctl.xstate;
            if !deliver(task.pid(), status) {
                return Err(WaitError::BadAddress);
            }
            parents[index] = None;
            // SAFETY: a zombie never runs again and its lock is held.
            unsafe { task.data() }.release(frames);
            *ctl = TaskInner::new();
            self.slots.lock().release(index);
            return Ok(Some((task.pid(), status)));
        }
        if has_children {
            Ok(None)
        } else {
            Err(WaitError::NoChildren)
        }
    }

    /// Marks `pid` killed. The target acts on it at its next user/kernel
    /// crossing; a blocked target stays blocked.
    pub fn kill(&self, pid: Pid) -> Result<(), KillError> {
        let task = self.task(pid).ok_or(KillError::NotFound)?;
        let mut ctl = task.lock();
        if ctl.state == TaskState::Unused {
            return Err(KillError::NotFound);
        }
        ctl.killed = true;
        Ok(())
    }

    /// Marks `me` sleeping on `chan` under its own task lock, then releases
    /// the caller's `guard`. Returns the task lock for `sched` and the
    /// released lock for re-acquisition.
    ///
    /// `wakeup` needs the task lock, so a wakeup issued after `guard` is
    /// released waits until the sleeper has switched away and then finds it
    /// sleeping.
    pub fn sleep_on<'a, 'g, T>(
        &'a self,
        me: Pid,
        chan: Channel,
        guard: SpinLockGuard<'g, T>,
    ) -> (SpinLockGuard<'a, TaskInner>, &'g SpinLock<T>) {
        let mut ctl = self.slot(me).lock();
        let lock = SpinLockGuard::unlock(guard);
        ctl.chan = Some(chan);
        ctl.state = TaskState::Sleeping;
        (ctl, lock)
    }

    /// Wakes every task other than `except` sleeping on `chan`; returns how
    /// many were woken.
    pub fn wakeup(&self, chan: Channel, except: Option<Pid>) -> usize {
        let mut woken = 0;
        for task in self.tasks.iter().filter(|task| Some(task.pid()) != except) {
            let mut ctl = task.lock();
            if ctl.state == TaskState::Sleeping && ctl.chan == Some(chan) {
                ctl.state = TaskState::Runnable;
                woken += 1;
            }
        }
        woken
    }
}

impl Parking for TaskTable {
    type Token<'a> = SpinLockGuard<'a, TaskInner>;

    fn park(&self, pid: Pid) -> SpinLockGuard<'_, TaskInner> {
        let mut ctl = self.slot(pid).lock();
        ctl.state = TaskState::Sleeping;
        ctl.chan = None;
        ctl
    }

    fn unpark(&self, pid: Pid) {
        let mut ctl = self.slot(pid).lock();
        if ctl.state != TaskState::Sleeping {
            panic!("semaphore: waking task {} in state {:?}", pid, ctl.state);
        }
        ctl.state = TaskState::Runnable;
    }
}

static TASKS: spin::Once<TaskTable> = spin::Once::new();

/// Installs the global task table.
pub fn init(capacity: usize, trampoline: usize) -> &'static TaskTable {
    TASKS.call_once(|| TaskTable::new(capacity, trampoline))
}

/// The global task table.
pub fn table() -> &'static TaskTable {
    match TASKS.get() {
        Some(table) => table,
        None => panic!("task table used before init"),
    }
}

/// The global task table, if it has been installed.
pub fn try_table() -> Option<&'static TaskTable> {
    TASKS.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::HeapFrames;
    use crate::mm::layout::{PAGE_SIZE, VA_USERSTACK};
    use crate::mm::vma::{MapFlags, Perm};
    use crate::sync::Down;

    const TRAMPOLINE_PA: usize = 0x8020_0000;

    fn nop(_: usize) {}

    fn user_space(frames: &Frames<'_>) -> AddressSpace {
        let mut space = AddressSpace::new(frames).unwrap();
        let flags = MapFlags::PRIVATE | MapFlags::ANONYMOUS | MapFlags::FIXED;
        space.mmap(frames, 0, PAGE_SIZE, Perm::READ | Perm::WRITE | Perm::EXEC, flags, true).unwrap();
        space
    }

    fn spawn_root(table: &TaskTable, frames: &Frames<'_>) -> Pid {
        let root = table.spawn_user(frames, "init", user_space(frames), 0, VA_USERSTACK).unwrap();
        table.set_root(root);
        root
    }

    fn data(table: &TaskTable, pid: Pid) -> &mut TaskData {
        // SAFETY: tests own every slot they touch.
        unsafe { table.task(pid).unwrap().data() }
    }

    #[test]
    fn slots_are_handed_out_lowest_first_until_full() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let table = TaskTable::new(2, TRAMPOLINE_PA);
        let a = table.create_kernel_task(&frames, None, "a", nop, 0).unwrap();
        let b = table.create_kernel_task(&frames, None, "b", nop, 0).unwrap();
        assert_eq!((a.as_index(), b.as_index()), (0, 1));
        assert_eq!(table.create_kernel_task(&frames, None, "c", nop, 0), Err(TaskError::NoFreeSlot));
        assert_eq!(table.state(a), TaskState::Runnable);
        assert_eq!(data(&table, a).name(), "a");
        assert_eq!(data(&table, a).entry.map(|(_, arg)| arg), Some(0));
    }

    #[test]
    fn fork_shares_memory_and_zeroes_child_a0() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let table = TaskTable::new(4, TRAMPOLINE_PA);
        let root = spawn_root(&table, &frames);
        data(&table, root).trapframe().unwrap().set_a0(41);

        let child = table.fork(root, &frames).unwrap();
        assert_eq!(table.state(child), TaskState::Runnable);
        assert_eq!(table.parent_of(child), Some(root));
        assert!(table.has_children(root));

        let child_data = data(&table, child);
        let tf = child_data.trapframe().unwrap();
        assert_eq!(tf.a0(), 0);
        assert_eq!(tf.sp(), VA_USERSTACK);
        assert_eq!(child_data.files.open_count(), 3);
        assert_eq!(child_data.name(), "init");

        let child_pte = child_data.space.as_ref().unwrap().entry(0).unwrap();
        let root_pte = data(&table, root).space.as_ref().unwrap().entry(0).unwrap();
        assert_eq!(child_pte.pa(), root_pte.pa());
        assert_eq!(frames.ref_count(root_pte.pa()), 2);
    }

    #[test]
    fn failed_fork_leaves_nothing_behind() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let table = TaskTable::new(4, TRAMPOLINE_PA);
        let helper = table.create_kernel_task(&frames, None, "helper", nop, 0).unwrap();
        let live = heap.live();
        assert_eq!(table.fork(helper, &frames), Err(TaskError::NoAddressSpace));
        assert_eq!(heap.live(), live);
        assert_eq!(table.state(Pid::from_index(1)), TaskState::Unused);
        assert!(!table.has_children(helper));

        let full = TaskTable::new(1, TRAMPOLINE_PA);
        let only = spawn_root(&full, &frames);
        assert_eq!(full.fork(only, &frames), Err(TaskError::NoFreeSlot));
    }

    #[test]
    fn fork_out_of_memory_rolls_back() {
        // Root: table root, one data page and its two tables, the trapframe,
        // and the two tables under the trap pages. A fork needs six more.
        let heap = HeapFrames::with_limit(16);
        let frames = Frames::new(&heap);
        let table = TaskTable::new(4, TRAMPOLINE_PA);
        let root = spawn_root(&table, &frames);
        assert_eq!(heap.live(), 7);
        let child = table.fork(root, &frames).unwrap();
        assert_eq!(heap.live(), 13);

        assert_eq!(table.fork(root, &frames), Err(TaskError::OutOfMemory));
        assert_eq!(heap.live(), 13);
        assert_eq!(frames.tracked(), 1);
        let root_pte = data(&table, root).space.as_ref().unwrap().entry(0).unwrap();
        assert_eq!(frames.ref_count(root_pte.pa()), 2);
        assert_eq!(table.state(Pid::from_index(2)), TaskState::Unused);
        assert_eq!(table.parent_of(child), Some(root));
    }

    #[test]
    fn exit_then_reap_returns_status_once() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let table = TaskTable::new(4, TRAMPOLINE_PA);
        let root = spawn_root(&table, &frames);
        let baseline = heap.live();
        let child = table.fork(root, &frames).unwrap();

        assert_eq!(table.reap(root, &frames, |_, _| true), Ok(None));
        drop(table.exit(child, 7));
        assert_eq!(table.state(child), TaskState::Zombie);
        assert_eq!(data(&table, child).files.open_count(), 0);
        assert_eq!(table.task(root).unwrap().child_sem().count(), 1);
        assert!(matches!(table.task(root).unwrap().child_sem().down(&table, root), Down::Acquired));

        let mut seen = None;
        let reaped = table.reap(root, &frames, |pid, status| {
            seen = Some((pid, status));
            true
        });
        assert_eq!(reaped, Ok(Some((child, 7))));
        assert_eq!(seen, Some((child, 7)));
        assert_eq!(table.state(child), TaskState::Unused);
        assert_eq!(heap.live(), baseline);
        assert_eq!(table.reap(root, &frames, |_, _| true), Err(WaitError::NoChildren));
    }

    #[test]
    fn undeliverable_status_keeps_the_zombie() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let table = TaskTable::new(4, TRAMPOLINE_PA);
        let root = spawn_root(&table, &frames);
        let child = table.fork(root, &frames).unwrap();
        drop(table.exit(child, 3));
        assert_eq!(table.reap(root, &frames, |_, _| false), Err(WaitError::BadAddress));
        assert_eq!(table.state(child), TaskState::Zombie);
        assert_eq!(table.reap(root, &frames, |_, _| true), Ok(Some((child, 3))));
    }

    #[test]
    fn orphans_are_handed_to_root() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let table = TaskTable::new(4, TRAMPOLINE_PA);
        let root = spawn_root(&table, &frames);
        let middle = table.fork(root, &frames).unwrap();
        let dead = table.fork(middle, &frames).unwrap();
        let alive = table.fork(middle, &frames).unwrap();

        drop(table.exit(dead, 1));
        drop(table.exit(middle, 2));
        assert_eq!(table.parent_of(dead), Some(root));
        assert_eq!(table.parent_of(alive), Some(root));
        // One signal for the already-dead orphan, one for `middle` itself.
        assert_eq!(table.task(root).unwrap().child_sem().count(), 2);

        let mut reaped = Vec::new();
        while let Ok(Some((pid, _))) = table.reap(root, &frames, |_, _| true) {
            reaped.push(pid);
        }
        reaped.sort();
        assert_eq!(reaped, [middle, dead]);
        drop(table.exit(alive, 0));
        assert_eq!(table.reap(root, &frames, |_, _| true), Ok(Some((alive, 0))));
        assert_eq!(frames.tracked(), 1);
    }

    #[test]
    #[should_panic(expected = "root task")]
    fn root_exit_is_fatal() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let table = TaskTable::new(2, TRAMPOLINE_PA);
        let root = spawn_root(&table, &frames);
        drop(table.exit(root, 0));
    }

    #[test]
    fn kill_marks_live_tasks_only() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let table = TaskTable::new(3, TRAMPOLINE_PA);
        let pid = table.create_kernel_task(&frames, None, "victim", nop, 0).unwrap();
        assert_eq!(table.kill(Pid::from_index(2)), Err(KillError::NotFound));
        assert_eq!(table.kill(Pid::from_index(9)), Err(KillError::NotFound));
        assert!(!table.killed(pid));
        table.kill(pid).unwrap();
        assert!(table.killed(pid));
        assert_eq!(table.state(pid), TaskState::Runnable);
    }

    #[test]
    fn wakeup_targets_matching_sleepers_except_caller() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let table = TaskTable::new(4, TRAMPOLINE_PA);
        let pids: Vec<Pid> =
            (0..3).map(|_| table.create_kernel_task(&frames, None, "s", nop, 0).unwrap()).collect();
        let chan = Channel::from_raw(0x1000);
        for (pid, raw) in pids.iter().zip([0x1000, 0x2000, 0x1000]) {
            let mut ctl = table.task(*pid).unwrap().lock();
            ctl.state = TaskState::Sleeping;
            ctl.chan = Some(Channel::from_raw(raw));
        }
        assert_eq!(table.wakeup(chan, Some(pids[2])), 1);
        assert_eq!(table.state(pids[0]), TaskState::Runnable);
        assert_eq!(table.state(pids[1]), TaskState::Sleeping);
        assert_eq!(table.state(pids[2]), TaskState::Sleeping);
    }

    #[test]
    fn wakeup_after_sleeper_releases_caller_lock_is_not_lost() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let table = TaskTable::new(2, TRAMPOLINE_PA);
        let sleeper = table.create_kernel_task(&frames, None, "sleeper", nop, 0).unwrap();
        let condition = SpinLock::new("condition", false);
        let chan = Channel::of(&condition);

        let (ctl, lock) = table.sleep_on(sleeper, chan, condition.lock());
        // The caller's lock is free again while the sleeper still holds its
        // task lock, so a waker can flip the condition now.
        *lock.lock() = true;
        assert!(table.task(sleeper).unwrap().ctl().holding());
        assert_eq!(ctl.state, TaskState::Sleeping);
        assert_eq!(ctl.chan, Some(chan));

        // Switching away releases the task lock; the pending wakeup lands.
        drop(ctl);
        assert_eq!(table.wakeup(chan, None), 1);
        assert_eq!(table.state(sleeper), TaskState::Runnable);
        assert_eq!(table.wakeup(chan, None), 0);
    }

    #[test]
    fn semaphore_parks_through_the_table() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let table = TaskTable::new(2, TRAMPOLINE_PA);
        let waiter = table.create_kernel_task(&frames, None, "w", nop, 0).unwrap();
        let sem = Semaphore::new("test", 0);
        match sem.down(&table, waiter) {
            Down::Blocked(guard) => assert_eq!(guard.state, TaskState::Sleeping),
            Down::Acquired => panic!("empty semaphore acquired"),
        }
        assert_eq!(sem.up(&table), Some(waiter));
        assert_eq!(table.state(waiter), TaskState::Runnable);
    }
}
