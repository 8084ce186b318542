// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Counting semaphore with an explicit FIFO wait queue
//! OWNERS: @kernel-sync-team
//! PUBLIC API: Semaphore::{new, down, up, count, waiting}, Parking, Down
//! DEPENDS_ON: sync::SpinLock, alloc::collections::VecDeque
//! INVARIANTS: count < 0 iff exactly -count waiters are queued; waiters wake in arrival order
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use alloc::collections::VecDeque;

use crate::sync::SpinLock;
use crate::types::Pid;

/// Blocks and unblocks tasks on behalf of a semaphore.
///
/// `park` runs while the semaphore lock is held and must leave the task
/// marked as sleeping before it returns, so a concurrent `up` that takes the
/// semaphore lock next always finds it parked.
pub trait Parking {
    /// Proof that the caller is parked; handed to the scheduler to switch away.
    type Token<'a>
    where
        Self: 'a;

    fn park(&self, pid: Pid) -> Self::Token<'_>;
    fn unpark(&self, pid: Pid);
}

/// Outcome of [`Semaphore::down`].
#[must_use = "a blocked caller has to switch away"]
pub enum Down<T> {
    Acquired,
    Blocked(T),
}

struct State {
    count: isize,
    waiters: VecDeque<Pid>,
}

pub struct Semaphore {
    state: SpinLock<State>,
}

impl Semaphore {
    pub const fn new(name: &'static str, count: isize) -> Self {
        Self { state: SpinLock::new(name, State { count, waiters: VecDeque::new() }) }
    }

    /// P: takes one unit or queues `me` at the tail and parks it.
    pub fn down<'p, P: Parking>(&self, parking: &'p P, me: Pid) -> Down<P::Token<'p>> {
        let mut state = self.state.lock();
        state.count -= 1;
        if state.count >= 0 {
            return Down::Acquired;
        }
        state.waiters.push_back(me);
        let token = parking.park(me);
        drop(state);
        Down::Blocked(token)
    }

    /// V: returns one unit; wakes and returns the oldest waiter if any.
    pub fn up<P: Parking>(&self, parking: &P) -> Option<Pid> {
        let mut state = self.state.lock();
        state.count += 1;
        if state.count > 0 {
            return None;
        }
        let Some(pid) = state.waiters.pop_front() else {
            panic!("semaphore {}: count {} with no waiter", self.state.name(), state.count);
        };
        parking.unpark(pid);
        Some(pid)
    }

    /// Drops stale signals; used when the owner is recycled.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if !state.waiters.is_empty() {
            panic!("semaphore {}: reset with waiters", self.state.name());
        }
        state.count = 0;
    }

    pub fn count(&self) -> isize {
        self.state.lock().count
    }

    /// Number of queued waiters.
    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }
}
