// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Long-term lock whose waiters sleep instead of spinning.
//!
//! Contended acquirers block through `sched::sleep` on the lock's address
//! and are woken in bulk on release. Only tasks may contend; uncontended
//! acquisition also works before the scheduler runs.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use crate::cpu;
use crate::sched;
use crate::sync::SpinLock;
use crate::types::{Channel, Pid};

/// Ownership record guarded by the inner spinlock.
#[derive(Debug)]
struct Owner {
    locked: bool,
    holder: Option<Pid>,
}

impl Owner {
    const fn new() -> Self {
        Self { locked: false, holder: None }
    }

    /// Takes the lock for `me` if it is free.
    fn try_take(&mut self, me: Option<Pid>) -> bool {
        if self.locked {
            return false;
        }
        self.locked = true;
        self.holder = me;
        true
    }

    /// Whether the lock is held by the task `me`. Contexts without a task
    /// never count as holders.
    fn held_by(&self, me: Option<Pid>) -> bool {
        self.locked && self.holder.is_some() && self.holder == me
    }

    /// Frees the lock; returns the previous holder.
    fn release(&mut self, name: &str) -> Option<Pid> {
        if !self.locked {
            panic!("sleeplock {}: release while unlocked", name);
        }
        self.locked = false;
        self.holder.take()
    }
}

pub struct SleepLock<T> {
    owner: SpinLock<Owner>,
    data: UnsafeCell<T>,
}

// SAFETY: `data` is only reachable through a guard, and guards are handed
// out to one owner at a time under `owner`.
unsafe impl<T: Send> Sync for SleepLock<T> {}
unsafe impl<T: Send> Send for SleepLock<T> {}

impl<T> SleepLock<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self { owner: SpinLock::new(name, Owner::new()), data: UnsafeCell::new(value) }
    }

    fn channel(&self) -> Channel {
        Channel::of(self)
    }

    /// Acquires the lock, sleeping while another task holds it.
    ///
    /// Panics if the calling task already holds it.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        self.lock_as(cpu::current_pid())
    }

    fn lock_as(&self, me: Option<Pid>) -> SleepLockGuard<'_, T> {
        let mut owner = self.owner.lock();
        if owner.held_by(me) {
            let name = self.owner.name();
            drop(owner);
            panic!("sleeplock {}: already held by task {:?}", name, me);
        }
        while !owner.try_take(me) {
            owner = sched::sleep(self.channel(), owner);
        }
        drop(owner);
        SleepLockGuard { lock: self }
    }

    /// Whether the calling task holds the lock.
    pub fn holding(&self) -> bool {
        self.owner.lock().held_by(cpu::current_pid())
    }

    fn unlock(&self) {
        self.unlock_with(sched::wakeup);
    }

    /// Frees the lock and wakes its sleepers through `wake` while the
    /// ownership record is still locked.
    fn unlock_with(&self, wake: impl FnOnce(Channel)) {
        let mut owner = self.owner.lock();
        owner.release(self.owner.name());
        wake(self.channel());
    }
}

pub struct SleepLockGuard<'a, T> {
    lock: &'a SleepLock<T>,
}

impl<T> Deref for SleepLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SleepLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::{Frames, HeapFrames};
    use crate::task::{TaskState, TaskTable};

    const TRAMPOLINE_PA: usize = 0x8020_0000;

    fn nop(_: usize) {}

    fn pid(n: usize) -> Pid {
        Pid::from_index(n)
    }

    #[test]
    fn uncontended_lock_records_holder() {
        let lock = SleepLock::new("buf", [0u8; 4]);
        {
            let mut data = lock.lock_as(Some(pid(2)));
            data[0] = 9;
            assert_eq!(lock.owner.lock().holder, Some(pid(2)));
        }
        assert!(!lock.owner.lock().locked);
        assert_eq!(lock.lock()[0], 9);
    }

    #[test]
    fn busy_lock_refuses_others_until_released() {
        let mut owner = Owner::new();
        assert!(owner.try_take(Some(pid(1))));
        assert!(!owner.try_take(Some(pid(2))));
        assert!(owner.held_by(Some(pid(1))));
        assert!(!owner.held_by(Some(pid(2))));

        assert_eq!(owner.release("buf"), Some(pid(1)));
        assert!(!owner.held_by(Some(pid(1))));
        assert!(owner.try_take(Some(pid(2))));
        assert_eq!(owner.holder, Some(pid(2)));
    }

    #[test]
    fn taskless_context_never_holds() {
        let mut owner = Owner::new();
        assert!(owner.try_take(None));
        assert!(!owner.held_by(None));

        let lock = SleepLock::new("early", ());
        let _guard = lock.lock_as(None);
        assert!(!lock.holding());
    }

    #[test]
    #[should_panic(expected = "release while unlocked")]
    fn release_of_free_lock_is_fatal() {
        Owner::new().release("buf");
    }

    #[test]
    #[should_panic(expected = "already held")]
    fn relocking_from_the_holder_is_fatal() {
        let lock = SleepLock::new("buf", 0u32);
        let _first = lock.lock_as(Some(pid(3)));
        let _second = lock.lock_as(Some(pid(3)));
    }

    #[test]
    fn release_wakes_sleepers_and_next_taker_records_itself() {
        let heap = HeapFrames::new();
        let frames = Frames::new(&heap);
        let table = TaskTable::new(4, TRAMPOLINE_PA);
        let holder = table.create_kernel_task(&frames, None, "holder", nop, 0).unwrap();
        let waiter = table.create_kernel_task(&frames, None, "waiter", nop, 0).unwrap();
        let bystander = table.create_kernel_task(&frames, None, "other", nop, 0).unwrap();

        let lock = SleepLock::new("buf", 0u32);
        assert!(lock.owner.lock().try_take(Some(holder)));

        // The waiter found the lock busy and went to sleep on it.
        let parked = SpinLock::new("caller", ());
        let (ctl, _) = table.sleep_on(waiter, lock.channel(), parked.lock());
        drop(ctl);
        {
            let mut ctl = table.task(bystander).unwrap().lock();
            ctl.state = TaskState::Sleeping;
            ctl.chan = Some(Channel::from_raw(0x40));
        }

        let mut woken = 0;
        lock.unlock_with(|chan| woken = table.wakeup(chan, Some(holder)));
        assert_eq!(woken, 1);
        assert_eq!(table.state(waiter), TaskState::Runnable);
        assert_eq!(table.state(bystander), TaskState::Sleeping);

        let owner = lock.owner.lock();
        assert!(!owner.locked);
        assert_eq!(owner.holder, None);
        drop(owner);

        let guard = lock.lock_as(Some(waiter));
        assert!(lock.owner.lock().held_by(Some(waiter)));
        drop(guard);
    }
}
