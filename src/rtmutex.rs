// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The priority inheritance mutex.
//!
//! An uncontended acquire or release is one compare-and-swap on the
//! ownership word. As soon as a task has to wait, the "has waiters" flag
//! forces every party onto the slow paths, which serialize on the lock's
//! `wait_lock`:
//!
//! - a blocking acquire queues a [`Waiter`], boosts the owner and walks the
//!   chain (see [`crate::chain`]) before it sleeps,
//! - a release hands the lock to the top waiter by leaving it free with the
//!   flag set and waking the waiter, which then takes it.
//!
//! Locks are always taken `wait_lock` first, then the `pi_lock` of a task.

use core::fmt;
use std::sync::Arc;
use std::time::Instant;

use log::{error, trace};

use crate::chain;
use crate::config::{ChainWalk, LockConfig};
use crate::error::{Error, Result};
use crate::owner::{Owner, OwnerWord};
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::stats::{Counters, Event, LockStats};
use crate::task::{self, SleepState, TaskId, TaskRef, WaitPoint};
use crate::waiter::{Waiter, WaiterRef, WaiterTree};

pub(crate) type WaitersGuard<'a> = SpinLockGuard<'a, WaiterTree>;

/// The shared part of an [`RtMutex`], referenced by its waiters.
pub(crate) struct RtMutexBase {
    pub(crate) owner: OwnerWord,
    wait_lock: SpinLock<WaiterTree>,
    pub(crate) config: LockConfig,
    stats: Counters,
}

impl RtMutexBase {
    pub(crate) fn new(config: LockConfig) -> Arc<RtMutexBase> {
        Arc::new(RtMutexBase {
            owner: OwnerWord::new(Owner::Free),
            wait_lock: SpinLock::new(WaiterTree::new()),
            config,
            stats: Counters::default(),
        })
    }

    pub(crate) fn lock_waiters(&self) -> WaitersGuard<'_> {
        self.stats.record(Event::WaitLock);
        self.wait_lock.lock()
    }

    pub(crate) fn try_lock_waiters(&self) -> Option<WaitersGuard<'_>> {
        let g = self.wait_lock.try_lock();
        if g.is_some() {
            self.stats.record(Event::WaitLock);
        }
        g
    }

    #[inline]
    pub(crate) fn record(&self, ev: Event) {
        self.stats.record(ev);
    }

    pub(crate) fn record_chain_walk(&self) {
        self.stats.record(Event::ChainWalk);
    }

    /// Drop a stale waiters flag. Caller holds `wait_lock`.
    pub(crate) fn fixup_waiters(&self, waiters: &WaiterTree) {
        debug_assert!(self.wait_lock.is_locked());
        if waiters.is_empty() && self.owner.load().has_waiters() {
            self.owner.clear_waiters();
        }
    }

    /// Try to make `task` the owner.
    ///
    /// With `waiter` the task is queued and only gets the lock as the top
    /// waiter or by out-prioritizing it; without, it is a fresh contender
    /// and has to beat the top waiter under the lock's steal policy.
    pub(crate) fn try_to_take(
        &self,
        waiters: &mut WaiterTree,
        task: &TaskRef,
        waiter: Option<&WaiterRef>,
    ) -> bool {
        // Set the flag before looking at the owner so a concurrent fast path
        // release cannot slip through unnoticed.
        self.owner.mark_waiters();
        if self.owner.owner().is_some() {
            return false;
        }

        let steal = self.config.steal;
        match waiter {
            Some(w) => {
                if let Some(top) = waiters.first() {
                    if !top.is(w) && !w.key().may_steal(&top.key(), steal) {
                        return false;
                    }
                }
                waiters.dequeue(w);
            }
            None => match waiters.first() {
                Some(top) => {
                    let key = task.pi.lock().key();
                    if !key.may_steal(&top.key(), steal) {
                        return false;
                    }
                }
                None => {
                    self.owner.set(Owner::Owned(task.id()));
                    trace!("{}: took free lock", task);
                    return true;
                }
            },
        }

        {
            let mut pi = task.pi.lock();
            if waiter.is_some() {
                pi.pi_blocked_on = WaitPoint::None;
            }
            if let Some(top) = waiters.first() {
                pi.pi_waiters.enqueue(top);
                chain::adjust_prio(task, &mut pi);
            }
        }

        self.owner
            .set(Owner::new(Some(task.id()), !waiters.is_empty()));
        trace!("{}: took lock, {} waiters left", task, waiters.len());
        true
    }

    /// Trylock without the fast path.
    pub(crate) fn slowtrylock(&self, task: &TaskRef) -> bool {
        self.record(Event::SlowAcquire);

        // Owned, no point in taking `wait_lock`.
        if self.owner.owner().is_some() {
            return false;
        }

        let mut waiters = self.lock_waiters();
        let taken = self.try_to_take(&mut waiters, task, None);
        self.fixup_waiters(&waiters);
        taken
    }

    /// Remove the top waiter from `owner`'s tree, deboost `owner` and leave
    /// the lock free for the waiter to take. Returns the task to wake once
    /// `wait_lock` is dropped.
    pub(crate) fn mark_wakeup_next_waiter(
        &self,
        waiters: &WaiterTree,
        owner: &TaskRef,
    ) -> Option<TaskRef> {
        let top = waiters.first()?.clone();
        {
            let mut pi = owner.pi.lock();
            pi.pi_waiters.dequeue(&top);
            chain::adjust_prio(owner, &mut pi);
        }
        // The flag stays set: the woken waiter is still queued.
        self.owner.set(Owner::FreeWithWaiters);
        trace!("{}: handing lock to {}", owner, top.task());
        Some(top.task().clone())
    }

    fn slowunlock(&self, owner: &TaskRef) -> Option<TaskRef> {
        self.record(Event::SlowRelease);
        let mut waiters = self.lock_waiters();

        // The flag was set but nobody is queued (anymore). Clear it and try
        // the release again, a new waiter may race in meanwhile.
        while waiters.is_empty() {
            self.owner.clear_waiters();
            drop(waiters);
            if self.owner.try_release(owner.id()) {
                return None;
            }
            waiters = self.lock_waiters();
        }

        self.mark_wakeup_next_waiter(&waiters, owner)
    }
}

/// Queue `waiter` for `task` on `lock` and propagate the boost.
///
/// `wait_lock` is dropped for the chain walk and held again on return.
pub(crate) fn task_blocks_on<'a>(
    lock: &'a Arc<RtMutexBase>,
    mut waiters: WaitersGuard<'a>,
    waiter: &WaiterRef,
    task: &TaskRef,
    chwalk: ChainWalk,
) -> (Result<()>, WaitersGuard<'a>) {
    if lock.owner.owner() == Some(task.id()) {
        return (Err(Error::Deadlock), waiters);
    }

    let prev_top = waiters.first().cloned();
    {
        let mut pi = task.pi.lock();
        match pi.pi_blocked_on {
            WaitPoint::WakeupInProgress => return (Err(Error::Again), waiters),
            WaitPoint::Real(ref w) => {
                debug_assert!(false, "{} already blocked through {:?}", task, w)
            }
            WaitPoint::None | WaitPoint::RequeueInProgress => {}
        }
        waiter.set_key(pi.key());
        waiters.enqueue(waiter);
        pi.pi_blocked_on = WaitPoint::Real(waiter.clone());
    }

    if lock.owner.owner().is_none() {
        return (Ok(()), waiters);
    }
    let owner = match chain::lock_owner(lock) {
        Some(o) => o,
        None => return (Ok(()), waiters),
    };

    let mut chain_walk = false;
    let next_lock = {
        let mut opi = owner.pi.lock();
        if waiters.first().map_or(false, |t| t.is(waiter)) {
            if let Some(prev) = &prev_top {
                opi.pi_waiters.dequeue(prev);
            }
            opi.pi_waiters.enqueue(waiter);
            chain::adjust_prio(&owner, &mut opi);
            if opi.pi_blocked_on.real().is_some() {
                chain_walk = true;
            }
        } else if chain::cond_detect_deadlock(true, chwalk) {
            chain_walk = true;
        }
        opi.blocked_on_lock()
    };

    let next_lock = match next_lock {
        Some(l) if chain_walk => l,
        _ => return (Ok(()), waiters),
    };

    drop(waiters);
    lock.record_chain_walk();
    let res = chain::adjust_prio_chain(
        owner,
        chwalk,
        Some(lock),
        Some(next_lock),
        Some(waiter),
        task,
    );
    (res, lock.lock_waiters())
}

/// Dequeue a waiter that gave up and undo its boost of the owner.
///
/// `wait_lock` is dropped for the chain walk and held again on return.
pub(crate) fn remove_waiter<'a>(
    lock: &'a Arc<RtMutexBase>,
    mut waiters: WaitersGuard<'a>,
    waiter: &WaiterRef,
) -> WaitersGuard<'a> {
    let is_top = waiters.first().map_or(false, |t| t.is(waiter));
    let task = waiter.task();
    {
        let mut pi = task.pi.lock();
        waiters.dequeue(waiter);
        if pi.pi_blocked_on.real().map_or(false, |w| w.is(waiter)) {
            pi.pi_blocked_on = WaitPoint::None;
        }
    }

    if !is_top || lock.owner.owner().is_none() {
        return waiters;
    }
    let owner = match chain::lock_owner(lock) {
        Some(o) => o,
        None => return waiters,
    };

    let next_lock = {
        let mut opi = owner.pi.lock();
        opi.pi_waiters.dequeue(waiter);
        if let Some(top) = waiters.first() {
            opi.pi_waiters.enqueue(top);
        }
        chain::adjust_prio(&owner, &mut opi);
        opi.blocked_on_lock()
    };

    let next_lock = match next_lock {
        Some(l) => l,
        None => return waiters,
    };

    drop(waiters);
    lock.record_chain_walk();
    if let Err(e) = chain::adjust_prio_chain(
        owner,
        ChainWalk::Min,
        Some(lock),
        Some(next_lock),
        None,
        task,
    ) {
        trace!("{}: deboost walk stopped: {}", task, e);
    }
    lock.lock_waiters()
}

/// Sleep until `waiter` gets the lock, a signal `state` reacts to arrives or
/// `deadline` passes. Called by the waiter's own task with `wait_lock` held.
pub(crate) fn wait_for_lock<'a>(
    lock: &'a Arc<RtMutexBase>,
    mut waiters: WaitersGuard<'a>,
    waiter: &WaiterRef,
    state: SleepState,
    deadline: Option<Instant>,
) -> (Result<()>, WaitersGuard<'a>) {
    let task = waiter.task();
    loop {
        if lock.try_to_take(&mut waiters, task, Some(waiter)) {
            return (Ok(()), waiters);
        }
        if deadline.map_or(false, |d| Instant::now() >= d) {
            return (Err(Error::TimedOut), waiters);
        }
        if task.signal_pending_state(state) {
            return (Err(Error::Interrupted), waiters);
        }

        drop(waiters);
        trace!("{}: sleeping as {:?}", task, waiter);
        task.schedule(deadline);
        waiters = lock.lock_waiters();
    }
}

/// A deadlock the caller did not ask to be told about.
fn handle_deadlock(err: Error, chwalk: ChainWalk, waiter: &Waiter) {
    if err != Error::Deadlock || chwalk == ChainWalk::Full {
        return;
    }

    #[cfg(feature = "debug-rt-mutexes")]
    {
        error!(
            "{}: deadlock detected acquiring {:p}, stopping task",
            waiter.task(),
            Arc::as_ptr(waiter.lock())
        );
        loop {
            waiter.task().schedule(None);
        }
    }

    #[cfg(not(feature = "debug-rt-mutexes"))]
    error!("{}: deadlock detected, lock not taken", waiter.task());
}

fn slowlock(
    lock: &Arc<RtMutexBase>,
    task: &TaskRef,
    state: SleepState,
    deadline: Option<Instant>,
    chwalk: ChainWalk,
) -> Result<()> {
    lock.record(Event::SlowAcquire);
    let mut waiters = lock.lock_waiters();

    if lock.try_to_take(&mut waiters, task, None) {
        return Ok(());
    }

    let waiter = Waiter::new(task.clone(), lock.clone());
    let (mut res, w) = task_blocks_on(lock, waiters, &waiter, task, chwalk);
    waiters = w;

    // A walk cut off after the owner released may have been handed the
    // lock; the waiter takes it instead of leaving it free with waiters.
    if res == Err(Error::Deadlock) && waiters.contains(&waiter) && lock.owner.owner().is_none() {
        res = Ok(());
    }

    if res.is_ok() {
        let (r, w) = wait_for_lock(lock, waiters, &waiter, state, deadline);
        res = r;
        waiters = w;
    }

    if let Err(e) = res {
        waiters = remove_waiter(lock, waiters, &waiter);
        lock.fixup_waiters(&waiters);
        drop(waiters);
        trace!("{}: gave up waiting: {}", task, e);
        handle_deadlock(e, chwalk, &waiter);
        return Err(e);
    }

    lock.fixup_waiters(&waiters);
    Ok(())
}

/// A mutual exclusion lock with priority inheritance.
///
/// While a task waits for the lock, the owner runs at the waiter's priority
/// if that is more urgent, transitively through chains of blocked owners.
/// Ownership belongs to the [`Task`](crate::Task) of the calling thread
/// (see [`current`](crate::current)); only the owner may unlock.
///
/// # Example
/// ```
/// use rtmutex::RtMutex;
///
/// let m = RtMutex::new();
/// m.lock().unwrap();
/// assert!(m.is_locked());
/// m.unlock();
/// assert!(m.try_lock().is_ok());
/// m.unlock();
/// ```
pub struct RtMutex {
    pub(crate) base: Arc<RtMutexBase>,
}

impl RtMutex {
    pub fn new() -> RtMutex {
        RtMutex::with_config(LockConfig::default())
    }

    pub fn with_config(config: LockConfig) -> RtMutex {
        RtMutex {
            base: RtMutexBase::new(config),
        }
    }

    pub fn config(&self) -> LockConfig {
        self.base.config
    }

    fn acquire(&self, state: SleepState, deadline: Option<Instant>, chwalk: ChainWalk) -> Result<()> {
        let task = task::current();
        if chwalk == ChainWalk::Min && self.base.owner.try_acquire(task.id()) {
            self.base.record(Event::FastAcquire);
            return Ok(());
        }
        slowlock(&self.base, &task, state, deadline, chwalk)
    }

    /// Block until the lock is acquired. Signals are ignored.
    ///
    /// Fails only with [`Error::Deadlock`]: the caller already owns the lock,
    /// or the chain walk ran into a cycle or the depth limit.
    pub fn lock(&self) -> Result<()> {
        self.acquire(SleepState::Uninterruptible, None, self.base.config.chain_walk)
    }

    /// Like [`RtMutex::lock`], but any pending [`Signal`](crate::Signal)
    /// aborts the wait with [`Error::Interrupted`].
    pub fn lock_interruptible(&self) -> Result<()> {
        self.acquire(SleepState::Interruptible, None, self.base.config.chain_walk)
    }

    /// Like [`RtMutex::lock`], but [`Signal::Kill`](crate::Signal::Kill)
    /// aborts the wait.
    pub fn lock_killable(&self) -> Result<()> {
        self.acquire(SleepState::Killable, None, self.base.config.chain_walk)
    }

    /// Interruptible acquire that gives up with [`Error::TimedOut`] once
    /// `deadline` has passed.
    pub fn timed_lock(&self, deadline: Instant) -> Result<()> {
        self.acquire(
            SleepState::Interruptible,
            Some(deadline),
            self.base.config.chain_walk,
        )
    }

    /// Interruptible acquire that walks the whole chain and reports cycles
    /// as [`Error::Deadlock`].
    pub fn lock_detect_deadlock(&self) -> Result<()> {
        self.acquire(SleepState::Interruptible, None, ChainWalk::Full)
    }

    /// Take the lock if that is possible without waiting.
    ///
    /// Fails with [`Error::WouldBlock`]; an owned lock is not touched beyond
    /// reading its ownership word.
    pub fn try_lock(&self) -> Result<()> {
        let task = task::current();
        if self.base.owner.try_acquire(task.id()) {
            self.base.record(Event::FastAcquire);
            return Ok(());
        }
        if self.base.slowtrylock(&task) {
            Ok(())
        } else {
            Err(Error::WouldBlock)
        }
    }

    /// Release the lock and hand it to the top waiter, if any.
    ///
    /// # Panics
    /// If the calling task does not own the lock.
    pub fn unlock(&self) {
        let task = task::current();
        let owner = self.base.owner.owner();
        if owner != Some(task.id()) {
            panic!("{} unlocking rt-mutex owned by {:?}", task, owner);
        }

        if self.base.owner.try_release(task.id()) {
            self.base.record(Event::FastRelease);
            return;
        }

        if let Some(next) = self.base.slowunlock(&task) {
            next.wake_up();
        }
    }

    /// Tear the lock down.
    ///
    /// Destroying a held lock is a contract violation: it is reported as
    /// [`Error::ContractViolation`], or panics with the `debug-rt-mutexes`
    /// feature.
    pub fn destroy(self) -> Result<()> {
        if let Some(owner) = self.base.owner.owner() {
            if cfg!(feature = "debug-rt-mutexes") {
                panic!("destroying rt-mutex held by task {}", owner);
            }
            error!("destroying rt-mutex held by task {}", owner);
            return Err(Error::ContractViolation);
        }
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.base.owner.owner().is_some()
    }

    pub fn owner(&self) -> Option<TaskId> {
        self.base.owner.owner()
    }

    /// Raw state of the ownership word.
    pub fn state(&self) -> Owner {
        self.base.owner.load()
    }

    /// Whether tasks are queued on the lock.
    pub fn has_waiters(&self) -> bool {
        !self.base.wait_lock.lock().is_empty()
    }

    pub fn stats(&self) -> LockStats {
        self.base.stats.snapshot()
    }
}

impl Default for RtMutex {
    fn default() -> RtMutex {
        RtMutex::new()
    }
}

impl fmt::Debug for RtMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtMutex")
            .field("state", &self.state())
            .field("config", &self.base.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::SchedAttr;
    use crate::task::spawn;
    use std::time::Duration;

    #[test]
    fn uncontended_round_trip() {
        let m = RtMutex::new();
        assert_eq!(m.state(), Owner::Free);

        m.lock().unwrap();
        assert_eq!(m.owner(), Some(task::current().id()));
        m.unlock();

        assert_eq!(m.state(), Owner::Free);
        assert!(!m.has_waiters());
        assert!(m.destroy().is_ok());
    }

    #[test]
    #[cfg(not(feature = "debug-rt-mutexes"))]
    fn relock_is_deadlock() {
        let m = RtMutex::new();
        m.lock().unwrap();
        assert_eq!(m.lock(), Err(Error::Deadlock));
        assert_eq!(m.try_lock(), Err(Error::WouldBlock));
        // Still ours, nothing queued.
        assert_eq!(m.state(), Owner::Owned(task::current().id()));
        m.unlock();
    }

    #[test]
    #[should_panic(expected = "unlocking rt-mutex")]
    fn unlock_by_non_owner_panics() {
        let m = RtMutex::new();
        m.unlock();
    }

    #[test]
    #[cfg(not(feature = "debug-rt-mutexes"))]
    fn destroy_locked() {
        let m = RtMutex::new();
        m.lock().unwrap();
        assert_eq!(m.destroy(), Err(Error::ContractViolation));
    }

    #[test]
    fn slowtrylock_clears_stale_flag() {
        let m = RtMutex::new();
        let t = task::current();
        m.base.owner.set(Owner::FreeWithWaiters);
        assert!(m.base.slowtrylock(&t));
        assert_eq!(m.state(), Owner::Owned(t.id()));
        m.unlock();
        assert_eq!(m.state(), Owner::Free);
    }

    #[test]
    fn handoff_to_waiter() {
        let m = Arc::new(RtMutex::new());
        m.lock().unwrap();

        let m2 = m.clone();
        let (t, h) = spawn("waiter", SchedAttr::default(), move || {
            m2.lock().unwrap();
            let me = task::current().id();
            m2.unlock();
            me
        });

        while !t.is_blocked() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(m.has_waiters());
        assert_eq!(m.state(), Owner::OwnedWithWaiters(task::current().id()));

        m.unlock();
        assert_eq!(h.join().unwrap(), t.id());
        assert_eq!(m.state(), Owner::Free);
        assert!(!m.has_waiters());
    }
}
