// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Waiter nodes and the ordered trees they are queued in.

use core::fmt;
use core::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::collections::BTreeMap;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::rtmutex::RtMutexBase;
use crate::sched::{dl_prio, PrioKey, Prio};
use crate::task::TaskRef;

pub(crate) type WaiterRef = Arc<Waiter>;

static NEXT_WAITER_ID: AtomicU64 = AtomicU64::new(1);

/// A task blocked on a lock.
///
/// The node sits in the lock's waiter tree for as long as the task is
/// blocked and additionally in the owner's `pi_waiters` tree while it is the
/// lock's top waiter. Its sort key is a snapshot of the task's priority; it
/// is only changed while the node is out of the lock's tree, with both the
/// task's `pi_lock` and the lock's `wait_lock` held.
pub(crate) struct Waiter {
    id: u64,
    task: TaskRef,
    lock: Arc<RtMutexBase>,
    prio: AtomicI32,
    deadline: AtomicU64,
}

impl Waiter {
    pub(crate) fn new(task: TaskRef, lock: Arc<RtMutexBase>) -> WaiterRef {
        let key = task.pi.lock().key();
        Arc::new(Waiter {
            id: NEXT_WAITER_ID.fetch_add(1, Ordering::Relaxed),
            task,
            lock,
            prio: AtomicI32::new(key.prio),
            deadline: AtomicU64::new(key.deadline),
        })
    }

    pub(crate) fn task(&self) -> &TaskRef {
        &self.task
    }

    pub(crate) fn lock(&self) -> &Arc<RtMutexBase> {
        &self.lock
    }

    pub(crate) fn key(&self) -> PrioKey {
        PrioKey::new(
            self.prio.load(Ordering::Relaxed),
            self.deadline.load(Ordering::Relaxed),
        )
    }

    pub(crate) fn set_key(&self, key: PrioKey) {
        self.prio.store(key.prio, Ordering::Relaxed);
        self.deadline.store(key.deadline, Ordering::Relaxed);
    }

    /// Same node?
    #[inline]
    pub(crate) fn is(&self, other: &Waiter) -> bool {
        self.id == other.id
    }
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "waiter {} of {} ({:?})", self.id, self.task, self.key())
    }
}

/// Position of a node in a [`WaiterTree`].
///
/// Deadlines only order deadline-class entries; `seq` keeps equal keys in
/// insertion order, so a requeued node goes behind its equals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TreeKey {
    prio: Prio,
    deadline: u64,
    seq: u64,
}

/// Ordered multiset of waiters with remove-arbitrary and a cached minimum.
pub(crate) struct WaiterTree {
    entries: BTreeMap<TreeKey, WaiterRef>,
    index: HashMap<u64, TreeKey>,
    leftmost: Option<WaiterRef>,
    seq: u64,
}

impl WaiterTree {
    pub(crate) fn new() -> WaiterTree {
        WaiterTree {
            entries: BTreeMap::new(),
            index: HashMap::new(),
            leftmost: None,
            seq: 0,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// The most urgent waiter.
    #[inline]
    pub(crate) fn first(&self) -> Option<&WaiterRef> {
        self.leftmost.as_ref()
    }

    pub(crate) fn contains(&self, waiter: &Waiter) -> bool {
        self.index.contains_key(&waiter.id)
    }

    /// Insert `waiter` under its current key.
    pub(crate) fn enqueue(&mut self, waiter: &WaiterRef) {
        debug_assert!(!self.contains(waiter), "{:?} queued twice", waiter);

        let key = waiter.key();
        self.seq += 1;
        let tk = TreeKey {
            prio: key.prio,
            deadline: if dl_prio(key.prio) { key.deadline } else { 0 },
            seq: self.seq,
        };

        let new_leftmost = match &self.leftmost {
            Some(first) => tk < self.index[&first.id],
            None => true,
        };

        self.entries.insert(tk, waiter.clone());
        self.index.insert(waiter.id, tk);
        if new_leftmost {
            self.leftmost = Some(waiter.clone());
        }
    }

    /// Remove `waiter` wherever it sits. Returns false if it was not queued.
    pub(crate) fn dequeue(&mut self, waiter: &Waiter) -> bool {
        let tk = match self.index.remove(&waiter.id) {
            Some(tk) => tk,
            None => return false,
        };
        self.entries.remove(&tk);

        if self.leftmost.as_ref().map_or(false, |w| w.is(waiter)) {
            self.leftmost = self.entries.values().next().cloned();
        }
        true
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &WaiterRef> {
        self.entries.values()
    }
}
