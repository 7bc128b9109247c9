// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Priority inheritance mutexes.
//!
//! An [`RtMutex`] bounds priority inversion: while a task is blocked on the
//! lock, the owner runs at least at the blocked task's priority. Boosts are
//! transitive: if the owner is itself blocked on another lock, the boost is
//! passed down the chain of owners until it reaches a running task, and a
//! chain that closes into a cycle can be reported as a deadlock.
//!
//! Threads take part as [`Task`]s. The thread's task is created on first use
//! at the default priority, or set up explicitly with [`spawn`] or
//! [`adopt`]:
//!
//! ```
//! use std::sync::Arc;
//! use rtmutex::{current, spawn, RtMutex, SchedAttr};
//!
//! let lock = Arc::new(RtMutex::new());
//! lock.lock().unwrap();
//!
//! let l = lock.clone();
//! let (waiter, handle) = spawn("urgent", SchedAttr::fifo(90), move || {
//!     l.lock().unwrap();
//!     l.unlock();
//! });
//!
//! // Once `waiter` is queued we run at its priority.
//! while !current().is_boosted() {
//!     std::thread::yield_now();
//! }
//! assert_eq!(current().prio(), waiter.prio());
//! assert!(waiter.is_blocked());
//!
//! lock.unlock();
//! handle.join().unwrap();
//! assert!(!current().is_boosted());
//! ```
//!
//! The lock has an uncontended fast path of a single compare-and-swap; all
//! bookkeeping happens on the slow paths under two internal spin locks.

mod chain;
pub mod config;
mod error;
mod mutex;
mod owner;
mod proxy;
mod rtmutex;
pub mod sched;
mod spinlock;
mod stats;
mod task;
mod waiter;

pub use crate::config::{ChainWalk, LockConfig, StealMode};
pub use crate::error::{Error, Result};
pub use crate::mutex::{Mutex, MutexGuard};
pub use crate::owner::Owner;
pub use crate::proxy::{ProxyLock, ProxyWaiter};
pub use crate::rtmutex::RtMutex;
pub use crate::sched::{Prio, SchedAttr};
pub use crate::stats::LockStats;
pub use crate::task::{adopt, current, spawn, Signal, Task, TaskId, TaskRef};
