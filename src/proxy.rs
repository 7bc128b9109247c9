// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Locking on behalf of another task.
//!
//! A futex style layer keeps its sleepers in its own wait queues and only
//! moves them onto an [`RtMutex`] when it requeues them. These entry points
//! let such a layer enqueue a task it does not run as
//! ([`RtMutex::start_proxy_lock`]), let the task itself wait for the handoff
//! later ([`RtMutex::finish_proxy_lock`]) and back out when that wait fails
//! ([`RtMutex::cleanup_proxy_lock`]).
//!
//! While a task is between two wait queues the layer marks it with
//! [`Task::set_wakeup_in_progress`](crate::Task::set_wakeup_in_progress);
//! starting a proxy lock for it then fails with [`Error::Again`].

use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace};

use crate::config::ChainWalk;
use crate::error::{Error, Result};
use crate::owner::Owner;
use crate::rtmutex::{remove_waiter, task_blocks_on, wait_for_lock, RtMutex};
use crate::stats::Event;
use crate::task::{self, SleepState, Task, TaskRef, WaitPoint};
use crate::waiter::{Waiter, WaiterRef};

/// A task queued on a lock by [`RtMutex::start_proxy_lock`].
pub struct ProxyWaiter {
    waiter: WaiterRef,
}

impl ProxyWaiter {
    /// The task that was enqueued.
    pub fn task(&self) -> &TaskRef {
        self.waiter.task()
    }
}

/// Outcome of [`RtMutex::start_proxy_lock`].
pub enum ProxyLock {
    /// The lock was free, the task owns it now.
    Acquired,
    /// The task is queued and boosts the owner.
    Blocked(ProxyWaiter),
}

impl RtMutex {
    /// Make `owner` the owner of this free lock without it running.
    pub fn init_proxy_locked(&self, owner: &Task) -> Result<()> {
        let waiters = self.base.lock_waiters();
        if self.base.owner.owner().is_some() {
            return Err(Error::ContractViolation);
        }
        self.base
            .owner
            .set(Owner::new(Some(owner.id()), !waiters.is_empty()));
        Ok(())
    }

    /// Release a lock held on behalf of `owner`. Nobody is woken, so this is
    /// meant for locks that never got waiters.
    pub fn proxy_unlock(&self, owner: &Task) {
        let waiters = self.base.lock_waiters();
        debug_assert_eq!(self.base.owner.owner(), Some(owner.id()));
        self.base.owner.set(Owner::new(None, !waiters.is_empty()));
    }

    /// Take the lock for `task` or queue it as a waiter.
    ///
    /// The chain walk runs in full, so [`Error::Deadlock`] is reported if the
    /// enqueue closes a cycle. On error nothing stays queued.
    pub fn start_proxy_lock(&self, task: &TaskRef) -> Result<ProxyLock> {
        let base = &self.base;
        let mut waiters = base.lock_waiters();

        if base.try_to_take(&mut waiters, task, None) {
            return Ok(ProxyLock::Acquired);
        }

        let free = {
            let mut pi = task.pi.lock();
            let free = matches!(pi.pi_blocked_on, WaitPoint::None);
            if free {
                pi.pi_blocked_on = WaitPoint::RequeueInProgress;
            }
            free
        };
        if !free {
            base.fixup_waiters(&waiters);
            trace!("{}: wake-up in progress, not requeued", task);
            return Err(Error::Again);
        }

        let waiter = Waiter::new(task.clone(), base.clone());
        let (mut res, w) = task_blocks_on(base, waiters, &waiter, task, ChainWalk::Full);
        waiters = w;

        // The owner may have released the lock during the walk, the waiter
        // then gets it on its own.
        if res.is_err() && base.owner.owner().is_none() {
            res = Ok(());
        }

        if let Err(e) = res {
            {
                let mut pi = task.pi.lock();
                if let WaitPoint::RequeueInProgress = pi.pi_blocked_on {
                    pi.pi_blocked_on = WaitPoint::None;
                }
            }
            if !waiters.is_empty() {
                waiters = remove_waiter(base, waiters, &waiter);
            }
            base.fixup_waiters(&waiters);
            debug!("{}: proxy lock failed: {}", task, e);
            return Err(e);
        }

        Ok(ProxyLock::Blocked(ProxyWaiter { waiter }))
    }

    /// Wait, as the enqueued task, until the lock is handed over.
    ///
    /// The wait is interruptible and gives up at `deadline`. After an error
    /// the waiter is still queued, see [`RtMutex::cleanup_proxy_lock`].
    pub fn finish_proxy_lock(&self, pw: &ProxyWaiter, deadline: Option<Instant>) -> Result<()> {
        debug_assert!(
            Arc::ptr_eq(&task::current(), pw.task()),
            "proxy wait by a task other than the enqueued one"
        );

        let base = &self.base;
        let waiters = base.lock_waiters();
        let (res, waiters) = wait_for_lock(base, waiters, &pw.waiter, SleepState::Interruptible, deadline);
        base.fixup_waiters(&waiters);
        res
    }

    /// Clean up after a failed [`RtMutex::finish_proxy_lock`].
    ///
    /// The lock may have been handed over since the wait failed, in which
    /// case the task takes it. Returns true if the task did not get the lock
    /// and was dequeued instead.
    pub fn cleanup_proxy_lock(&self, pw: &ProxyWaiter) -> bool {
        let base = &self.base;
        let task = pw.task();
        let mut waiters = base.lock_waiters();

        if waiters.contains(&pw.waiter) {
            base.try_to_take(&mut waiters, task, Some(&pw.waiter));
        }

        let mut cleanup = false;
        if base.owner.owner() != Some(task.id()) {
            waiters = remove_waiter(base, waiters, &pw.waiter);
            cleanup = true;
        }
        base.fixup_waiters(&waiters);
        cleanup
    }

    /// The task the lock goes to next.
    pub fn next_owner(&self) -> Option<TaskRef> {
        self.base.lock_waiters().first().map(|w| w.task().clone())
    }

    /// Trylock that skips the fast path.
    pub fn futex_trylock(&self) -> bool {
        self.base.slowtrylock(&task::current())
    }

    /// Release the lock from the futex layer. Returns true if a waiter was
    /// woken to take it.
    pub fn futex_unlock(&self) -> bool {
        let base = &self.base;
        let me = task::current();
        debug_assert_eq!(base.owner.owner(), Some(me.id()));
        base.record(Event::SlowRelease);

        let next = {
            let waiters = base.lock_waiters();
            if waiters.is_empty() {
                base.owner.set(Owner::Free);
                None
            } else {
                base.mark_wakeup_next_waiter(&waiters, &me)
            }
        };

        match next {
            Some(t) => {
                t.wake_up();
                true
            }
            None => false,
        }
    }
}
