// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Interrupt-masking spinlock with holder tracking
//! OWNERS: @kernel-sync-team
//! PUBLIC API: SpinLock::new(), lock(), holding(), force_unlock(); SpinLockGuard::unlock()
//! DEPENDS_ON: spin::Mutex, cpu::{push_off, pop_off, cpu_id}
//! INVARIANTS: A hart never re-acquires a lock it holds; release requires the lock held by this hart
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use core::marker::PhantomData;
use core::mem::ManuallyDrop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::cpu;

const NO_HOLDER: usize = usize::MAX;

/// Mutual exclusion between harts.
///
/// Interrupts stay masked on the holding hart for as long as any guard is
/// alive, so an interrupt handler can never spin on a lock its own hart
/// holds.
pub struct SpinLock<T> {
    name: &'static str,
    holder: AtomicUsize,
    inner: spin::Mutex<T>,
}

impl<T> SpinLock<T> {
    pub const fn new(name: &'static str, value: T) -> Self {
        Self { name, holder: AtomicUsize::new(NO_HOLDER), inner: spin::Mutex::new(value) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Acquires the lock, spinning until it becomes available.
    ///
    /// Panics if the executing hart already holds it.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        cpu::push_off();
        if self.holding() {
            panic!("acquire {}: already held by hart {}", self.name, cpu::cpu_id());
        }
        let guard = self.inner.lock();
        fence(Ordering::SeqCst);
        self.holder.store(cpu::cpu_id(), Ordering::Relaxed);
        SpinLockGuard { lock: self, guard: ManuallyDrop::new(guard), _not_send: PhantomData }
    }

    /// Whether the executing hart holds the lock. Interrupts must be off.
    pub fn holding(&self) -> bool {
        self.inner.is_locked() && self.holder.load(Ordering::Relaxed) == cpu::cpu_id()
    }

    /// Releases a lock whose guard was left behind on another stack.
    ///
    /// A freshly created task starts running with its own task lock held by
    /// the scheduler that switched to it; the task calls this to drop that
    /// lock before it first runs.
    ///
    /// # Safety
    ///
    /// The lock must be held by the executing hart and the guard that
    /// acquired it must never be dropped.
    pub unsafe fn force_unlock(&self) {
        if !self.holding() {
            panic!("release {}: not held", self.name);
        }
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        // SAFETY: upheld by the caller.
        unsafe { self.inner.force_unlock() };
        cpu::pop_off();
    }

    /// Mutable access without locking, for exclusive owners.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

/// RAII guard returned by [`SpinLock::lock`].
///
/// The guard stands for this hart's `push_off` level and never moves to
/// another thread of execution by value.
pub struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
    guard: ManuallyDrop<spin::MutexGuard<'a, T>>,
    _not_send: PhantomData<*mut ()>,
}

static_assertions::assert_not_impl_any!(SpinLockGuard<'static, ()>: Send);

impl<'a, T> SpinLockGuard<'a, T> {
    /// Releases the lock and hands back the lock itself so it can be
    /// re-acquired later (used by `sleep`).
    pub fn unlock(guard: Self) -> &'a SpinLock<T> {
        let lock = guard.lock;
        drop(guard);
        lock
    }

    /// The lock this guard belongs to.
    pub fn lock_ref(guard: &Self) -> &'a SpinLock<T> {
        guard.lock
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        if !self.lock.holding() {
            panic!("release {}: not held", self.lock.name);
        }
        self.lock.holder.store(NO_HOLDER, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        // SAFETY: the inner guard is dropped exactly once, here.
        unsafe { ManuallyDrop::drop(&mut self.guard) };
        cpu::pop_off();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_grants_exclusive_access() {
        let lock = SpinLock::new("counter", 0u32);
        {
            let mut value = lock.lock();
            *value += 1;
            assert!(lock.holding());
        }
        assert!(!lock.holding());
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    #[should_panic(expected = "already held")]
    fn nested_acquire_is_fatal() {
        let lock = SpinLock::new("nested", ());
        let _outer = lock.lock();
        let _inner = lock.lock();
    }

    #[test]
    fn unlock_returns_the_lock_for_reacquire() {
        let lock = SpinLock::new("sleep", 7u8);
        let guard = lock.lock();
        let again = SpinLockGuard::unlock(guard);
        assert!(!again.holding());
        assert_eq!(*again.lock(), 7);
    }

    #[test]
    fn force_unlock_releases_a_forgotten_guard() {
        let lock = SpinLock::new("handoff", ());
        core::mem::forget(lock.lock());
        assert!(lock.holding());
        // SAFETY: the guard above was forgotten and this hart holds the lock.
        unsafe { lock.force_unlock() };
        assert!(!lock.holding());
        drop(lock.lock());
    }
}
