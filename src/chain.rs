// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Priority propagation along the chain of blocked tasks.
//!
//! A task blocked on a lock may make the lock's owner run at its priority,
//! and if that owner is itself blocked the boost travels on to the next
//! owner, and so on:
//!
//! ```text
//! task -> lock -> owner -> lock -> owner -> ... -> running owner
//! ```
//!
//! The walk holds at most two spin locks at a time: the `pi_lock` of the task
//! it is looking at and the `wait_lock` of the lock that task is blocked on.
//! The `wait_lock` is only ever *tried* while a `pi_lock` is held, other paths
//! take them in the opposite order. Between hops nothing is held, so every
//! hop revalidates what the previous one saw; tasks stay alive across the gap
//! because the walk holds a [`TaskRef`].

use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::Backoff;
use log::{debug, trace, warn};

use crate::config::{self, ChainWalk};
use crate::error::{Error, Result};
use crate::rtmutex::RtMutexBase;
use crate::task::{PiState, Task, TaskRef};
use crate::waiter::WaiterRef;

/// Limit the last depth warning was printed for.
static PREV_MAX_DEPTH: AtomicUsize = AtomicUsize::new(0);

/// Does this walk have to look for cycles?
pub(crate) fn cond_detect_deadlock(has_waiter: bool, chwalk: ChainWalk) -> bool {
    if cfg!(feature = "debug-rt-mutexes") {
        return has_waiter;
    }
    chwalk == ChainWalk::Full
}

/// Pin the current owner of `lock`.
pub(crate) fn lock_owner(lock: &RtMutexBase) -> Option<TaskRef> {
    lock.owner.owner().and_then(Task::lookup)
}

fn same(a: Option<&WaiterRef>, b: Option<&WaiterRef>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.is(b),
        (None, None) => true,
        _ => false,
    }
}

/// Recompute the effective priority of `task` from its own priority and the
/// top of its `pi_waiters`. Caller holds `task`'s `pi_lock`.
pub(crate) fn adjust_prio(task: &Task, pi: &mut PiState) {
    let own = pi.normal_key();
    let eff = match pi.top_pi_waiter() {
        Some(top) if top.key().less(&own) => top.key(),
        _ => own,
    };

    if eff != pi.key() {
        if eff.less(&pi.key()) {
            debug!("{}: boosted from {:?} to {:?}", task, pi.key(), eff);
        } else {
            debug!("{}: deboosted from {:?} to {:?}", task, pi.key(), eff);
        }
        pi.prio = eff.prio;
        pi.pi_deadline = eff.deadline;
        task.publish_prio(eff.prio);
    }
}

/// Walk the chain starting at `task`, which is blocked on `next_lock`.
///
/// `orig_lock`/`orig_waiter` describe the new waiter that caused the walk
/// (both `None` for a plain priority change), `top_task` is the task on whose
/// behalf we walk. `task` is pinned by the caller and released here.
///
/// Returns [`Error::Deadlock`] if the chain leads back to `orig_lock` or to
/// `top_task`, or if it is longer than [`config::max_lock_depth`].
pub(crate) fn adjust_prio_chain(
    mut task: TaskRef,
    chwalk: ChainWalk,
    orig_lock: Option<&Arc<RtMutexBase>>,
    mut next_lock: Option<Arc<RtMutexBase>>,
    orig_waiter: Option<&WaiterRef>,
    top_task: &TaskRef,
) -> Result<()> {
    let detect_deadlock = cond_detect_deadlock(orig_waiter.is_some(), chwalk);
    let mut top_waiter = orig_waiter.cloned();
    let mut requeue = true;
    let mut depth = 0;

    loop {
        depth += 1;
        let max = config::max_lock_depth();
        if depth > max {
            if PREV_MAX_DEPTH.swap(max, Ordering::Relaxed) != max {
                warn!("maximum lock depth {} reached task: {}", max, top_task);
            }
            return Err(Error::Deadlock);
        }

        let backoff = Backoff::new();
        loop {
            let pi = task.pi.lock();

            // Nothing was held since the last hop, the task may have been
            // woken, got the lock or moved on to a different lock.
            let waiter = match pi.pi_blocked_on.real() {
                Some(w) => w.clone(),
                None => return Ok(()),
            };

            // The lock the walk started at was released, whoever got it will
            // redo the accounting.
            if orig_waiter.is_some() && orig_lock.map_or(false, |l| l.owner.owner().is_none()) {
                return Ok(());
            }

            match &next_lock {
                Some(l) if Arc::ptr_eq(l, waiter.lock()) => {}
                _ => return Ok(()),
            }

            // The waiter we came from no longer is the reason for this
            // task's boost.
            if let Some(tw) = &top_waiter {
                match pi.top_pi_waiter() {
                    None => return Ok(()),
                    Some(first) if !first.is(tw) => {
                        if !detect_deadlock {
                            return Ok(());
                        }
                        requeue = false;
                    }
                    Some(_) => {}
                }
            }

            // The waiter already carries the task's priority.
            if waiter.key().equal(&pi.key()) {
                if !detect_deadlock {
                    return Ok(());
                }
                requeue = false;
            }

            let lock = waiter.lock().clone();
            let mut waiters = match lock.try_lock_waiters() {
                Some(g) => g,
                None => {
                    drop(pi);
                    backoff.spin();
                    continue;
                }
            };

            if orig_lock.map_or(false, |l| Arc::ptr_eq(l, &lock))
                || lock.owner.owner() == Some(top_task.id())
            {
                debug!(
                    "{}: deadlock, chain leads back through {} after {} hops",
                    top_task, task, depth
                );
                return Err(Error::Deadlock);
            }

            if !requeue {
                // Only looking for cycles, move to the owner untouched.
                drop(pi);
                let owner = match lock_owner(&lock) {
                    Some(o) => o,
                    None => return Ok(()),
                };
                {
                    let opi = owner.pi.lock();
                    next_lock = opi.blocked_on_lock();
                    top_waiter = waiters.first().cloned();
                }
                drop(waiters);
                task = owner;
                if next_lock.is_none() {
                    return Ok(());
                }
                break;
            }

            // Requeue the waiter under the task's current priority.
            let prerequeue_top = waiters.first().cloned();
            waiters.dequeue(&waiter);
            waiter.set_key(pi.key());
            waiters.enqueue(&waiter);
            trace!("{}: requeued {:?} at hop {}", task, waiter, depth);
            drop(pi);

            let owner = match lock_owner(&lock) {
                Some(o) => o,
                None => {
                    // Released meanwhile, end of chain. If the requeue changed
                    // the top waiter, the new one has to go for the lock.
                    if let Some(top) = waiters.first() {
                        if !same(prerequeue_top.as_ref(), Some(top)) {
                            top.task().wake_up();
                        }
                    }
                    return Ok(());
                }
            };

            let mut waiter = waiter;
            {
                let mut opi = owner.pi.lock();
                let top = waiters.first().cloned();
                if same(top.as_ref(), Some(&waiter)) {
                    // The waiter became (or stayed) top, it replaces the old
                    // top in the owner's tree.
                    if let Some(prev) = &prerequeue_top {
                        opi.pi_waiters.dequeue(prev);
                    }
                    opi.pi_waiters.enqueue(&waiter);
                    adjust_prio(&owner, &mut opi);
                } else if same(prerequeue_top.as_ref(), Some(&waiter)) {
                    // It was top and got deboosted below someone else.
                    opi.pi_waiters.dequeue(&waiter);
                    if let Some(top) = top {
                        waiter = top;
                        opi.pi_waiters.enqueue(&waiter);
                    }
                    adjust_prio(&owner, &mut opi);
                }

                next_lock = opi.blocked_on_lock();
                top_waiter = waiters.first().cloned();
            }
            drop(waiters);
            task = owner;

            if next_lock.is_none() {
                return Ok(());
            }

            // The owner's priority only matters further down if the waiter is
            // still the one boosting it.
            if !detect_deadlock && !same(Some(&waiter), top_waiter.as_ref()) {
                return Ok(());
            }
            break;
        }
    }
}

/// Propagate a priority change of `task` if it is blocked on a lock.
pub(crate) fn adjust_pi(task: &TaskRef) {
    let next_lock = {
        let pi = task.pi.lock();
        match pi.pi_blocked_on.real() {
            Some(w) if !w.key().equal(&pi.key()) => w.lock().clone(),
            _ => return,
        }
    };

    next_lock.record_chain_walk();
    if let Err(e) = adjust_prio_chain(
        task.clone(),
        ChainWalk::Min,
        None,
        Some(next_lock),
        None,
        task,
    ) {
        debug!("{}: priority change walk stopped: {}", task, e);
    }
}
