// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel synchronisation primitives.

pub mod semaphore;
pub mod sleeplock;
pub mod spinlock;

pub use semaphore::{Down, Parking, Semaphore};
pub use sleeplock::{SleepLock, SleepLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
