// Copyright © 2019 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Low-level spin locks backing a task's `pi_lock` and a lock's `wait_lock`.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crossbeam_utils::Backoff;

/// A spin lock that uses a TAS lock with an MCS queue in front of it.
///
/// `try_lock` and the uncontended `lock` only touch the top level flag.
/// Contending spinners line up in the MCS queue so only the queue head
/// polls `toplock`. The lock is not recursive.
pub(crate) struct RawSpinLock {
    /// The top level lock: test-and-set lock
    toplock: AtomicBool,

    /// The MCS tail
    qtail: AtomicPtr<QNode>,
}

/// A queue node representing a spinning thread in the MCS queue.
#[repr(align(64))]
struct QNode {
    /// next points to the successor for passing the queue head.
    next: AtomicPtr<QNode>,

    /// status notifies whether a spinner became the queue head.
    status: AtomicBool,
}

impl Default for QNode {
    fn default() -> QNode {
        QNode {
            next: AtomicPtr::new(ptr::null_mut()),
            status: AtomicBool::new(false),
        }
    }
}

impl RawSpinLock {
    pub(crate) const fn new() -> RawSpinLock {
        RawSpinLock {
            toplock: AtomicBool::new(false),
            qtail: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Single attempt on the top level lock, never queues.
    #[inline]
    pub(crate) fn try_lock(&self) -> bool {
        self.toplock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn lock(&self) {
        // Fast path: Try to steal the lock
        if self.try_lock() {
            return;
        }

        // Slow path: queue up behind the other spinners.
        let qnode = QNode::default();
        let me = &qnode as *const QNode as *mut QNode;

        let prev = self.qtail.swap(me, Ordering::AcqRel);
        if !prev.is_null() {
            let prev = unsafe { &*prev };
            prev.next.store(me, Ordering::Release);
            let backoff = Backoff::new();
            while !qnode.status.load(Ordering::Acquire) {
                backoff.snooze();
            }
        }

        // We are the queue head, spin on the top level lock.
        let backoff = Backoff::new();
        while !self.try_lock() {
            backoff.snooze();
        }

        // Got the top level lock. Pass the queue head on before `qnode`
        // goes out of scope.
        let mut next = qnode.next.load(Ordering::Acquire);
        if next.is_null() {
            if self
                .qtail
                .compare_exchange(me, ptr::null_mut(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }

            // Someone is being added to the queue; wait for the link.
            let backoff = Backoff::new();
            while next.is_null() {
                backoff.spin();
                next = qnode.next.load(Ordering::Acquire);
            }
        }
        let next = unsafe { &*next };
        next.status.store(true, Ordering::Release);
    }

    pub(crate) fn unlock(&self) {
        if self
            .toplock
            .compare_exchange(true, false, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            panic!("unlock() called without acquiring the lock");
        }
    }

    #[inline(always)]
    pub(crate) fn is_locked(&self) -> bool {
        self.toplock.load(Ordering::Relaxed)
    }
}

/// A [`RawSpinLock`] protecting a value.
pub(crate) struct SpinLock<T> {
    raw: RawSpinLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for SpinLock<T> {}
unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub(crate) const fn new(data: T) -> SpinLock<T> {
        SpinLock {
            raw: RawSpinLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    pub(crate) fn lock(&self) -> SpinLockGuard<'_, T> {
        self.raw.lock();
        SpinLockGuard { lock: self }
    }

    pub(crate) fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(SpinLockGuard { lock: self })
        } else {
            None
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

/// Releases the [`SpinLock`] when dropped.
pub(crate) struct SpinLockGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for SpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.unlock();
    }
}
