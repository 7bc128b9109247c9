// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-lock instrumentation counters.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Snapshot of a lock's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockStats {
    /// Acquires that completed with the single compare-and-swap.
    pub fast_acquires: usize,
    /// Acquire attempts (blocking or trylock) that entered the slow path.
    pub slow_acquires: usize,
    pub fast_releases: usize,
    pub slow_releases: usize,
    /// Times this lock's `wait_lock` was taken, by any path.
    pub wait_lock_acquisitions: usize,
    /// Chain walks started on behalf of a waiter of this lock.
    pub chain_walks: usize,
}

#[derive(Default)]
pub(crate) struct Counters {
    fast_acquires: AtomicUsize,
    slow_acquires: AtomicUsize,
    fast_releases: AtomicUsize,
    slow_releases: AtomicUsize,
    wait_lock_acquisitions: AtomicUsize,
    chain_walks: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Event {
    FastAcquire,
    SlowAcquire,
    FastRelease,
    SlowRelease,
    WaitLock,
    ChainWalk,
}

impl Counters {
    #[inline]
    pub(crate) fn record(&self, ev: Event) {
        let c = match ev {
            Event::FastAcquire => &self.fast_acquires,
            Event::SlowAcquire => &self.slow_acquires,
            Event::FastRelease => &self.fast_releases,
            Event::SlowRelease => &self.slow_releases,
            Event::WaitLock => &self.wait_lock_acquisitions,
            Event::ChainWalk => &self.chain_walks,
        };
        c.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> LockStats {
        LockStats {
            fast_acquires: self.fast_acquires.load(Ordering::Relaxed),
            slow_acquires: self.slow_acquires.load(Ordering::Relaxed),
            fast_releases: self.fast_releases.load(Ordering::Relaxed),
            slow_releases: self.slow_releases.load(Ordering::Relaxed),
            wait_lock_acquisitions: self.wait_lock_acquisitions.load(Ordering::Relaxed),
            chain_walks: self.chain_walks.load(Ordering::Relaxed),
        }
    }
}
