// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The lock ownership word.
//!
//! Owner and "has waiters" flag share one atomic so the uncontended
//! acquire and release are a single compare-and-swap. The flag is set
//! whenever the lock's waiter tree is non-empty and may be set spuriously;
//! it is never clear while waiters exist. Whenever it is set the fast paths
//! fail and the slow paths, which serialize on `wait_lock`, take over.

use core::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use static_assertions::{assert_eq_size, const_assert_eq};

use crate::task::TaskId;

const HAS_WAITERS: u64 = 1;
const ID_SHIFT: u32 = 1;

assert_eq_size!(TaskId, u64);
const_assert_eq!(HAS_WAITERS >> ID_SHIFT, 0);

/// Decoded value of the ownership word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Free,
    /// Released with waiters queued, the handoff is in flight.
    FreeWithWaiters,
    Owned(TaskId),
    OwnedWithWaiters(TaskId),
}

impl Owner {
    pub fn new(task: Option<TaskId>, has_waiters: bool) -> Owner {
        match (task, has_waiters) {
            (None, false) => Owner::Free,
            (None, true) => Owner::FreeWithWaiters,
            (Some(t), false) => Owner::Owned(t),
            (Some(t), true) => Owner::OwnedWithWaiters(t),
        }
    }

    pub fn task(self) -> Option<TaskId> {
        match self {
            Owner::Free | Owner::FreeWithWaiters => None,
            Owner::Owned(t) | Owner::OwnedWithWaiters(t) => Some(t),
        }
    }

    pub fn has_waiters(self) -> bool {
        matches!(self, Owner::FreeWithWaiters | Owner::OwnedWithWaiters(_))
    }

    fn encode(self) -> u64 {
        let id = self.task().map_or(0, |t| t.as_u64() << ID_SHIFT);
        id | if self.has_waiters() { HAS_WAITERS } else { 0 }
    }

    fn decode(word: u64) -> Owner {
        Owner::new(
            TaskId::from_u64(word >> ID_SHIFT),
            word & HAS_WAITERS != 0,
        )
    }
}

pub(crate) struct OwnerWord {
    word: CachePadded<AtomicU64>,
}

impl OwnerWord {
    pub(crate) fn new(owner: Owner) -> OwnerWord {
        OwnerWord {
            word: CachePadded::new(AtomicU64::new(owner.encode())),
        }
    }

    #[inline]
    pub(crate) fn load(&self) -> Owner {
        Owner::decode(self.word.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn owner(&self) -> Option<TaskId> {
        self.load().task()
    }

    #[inline]
    fn cmpxchg(&self, old: Owner, new: Owner, success: Ordering) -> bool {
        self.word
            .compare_exchange(old.encode(), new.encode(), success, Ordering::Relaxed)
            .is_ok()
    }

    /// Fast path acquire: Free -> Owned(task).
    #[inline]
    pub(crate) fn try_acquire(&self, task: TaskId) -> bool {
        self.cmpxchg(Owner::Free, Owner::Owned(task), Ordering::Acquire)
    }

    /// Fast path release: Owned(task) -> Free. Fails once the waiters flag
    /// is set.
    #[inline]
    pub(crate) fn try_release(&self, task: TaskId) -> bool {
        self.cmpxchg(Owner::Owned(task), Owner::Free, Ordering::Release)
    }

    /// Store a new owner. Caller holds `wait_lock`.
    #[inline]
    pub(crate) fn set(&self, owner: Owner) {
        self.word.store(owner.encode(), Ordering::Release);
    }

    /// Force concurrent fast path releases into the slow path. Caller holds
    /// `wait_lock`.
    #[inline]
    pub(crate) fn mark_waiters(&self) {
        self.word.fetch_or(HAS_WAITERS, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn clear_waiters(&self) {
        self.word.fetch_and(!HAS_WAITERS, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u64) -> TaskId {
        TaskId::from_u64(v).unwrap()
    }

    #[test]
    fn encoding() {
        for o in [
            Owner::Free,
            Owner::FreeWithWaiters,
            Owner::Owned(id(7)),
            Owner::OwnedWithWaiters(id(1 << 40)),
        ] {
            assert_eq!(Owner::decode(o.encode()), o);
        }
        assert_eq!(Owner::Free.encode(), 0);
    }

    #[test]
    fn fast_paths_fail_with_waiters() {
        let w = OwnerWord::new(Owner::Free);
        assert!(w.try_acquire(id(3)));
        assert!(!w.try_acquire(id(4)));
        assert_eq!(w.owner(), Some(id(3)));

        w.mark_waiters();
        assert_eq!(w.load(), Owner::OwnedWithWaiters(id(3)));
        assert!(!w.try_release(id(3)));

        w.clear_waiters();
        assert!(w.try_release(id(3)));
        assert_eq!(w.load(), Owner::Free);

        w.mark_waiters();
        assert!(!w.try_acquire(id(3)));
    }
}
