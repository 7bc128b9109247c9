// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runtime knobs of the rt-mutex.

use core::sync::atomic::{AtomicUsize, Ordering};

/// Default bound on the number of hops a single chain walk may take.
pub const DEFAULT_MAX_LOCK_DEPTH: usize = 1024;

static MAX_LOCK_DEPTH: AtomicUsize = AtomicUsize::new(DEFAULT_MAX_LOCK_DEPTH);

/// The current maximum chain-walk depth.
pub fn max_lock_depth() -> usize {
    MAX_LOCK_DEPTH.load(Ordering::Relaxed)
}

/// Change the maximum chain-walk depth for all locks.
///
/// A walk that would need more hops than this stops and reports
/// [`Error::Deadlock`](crate::Error::Deadlock) even if the chain has no cycle,
/// so very deep but legitimate nesting needs a larger value.
pub fn set_max_lock_depth(depth: usize) {
    MAX_LOCK_DEPTH.store(depth, Ordering::Relaxed);
}

/// How far a chain walk goes.
///
/// With the `debug-rt-mutexes` feature every walk on behalf of a new waiter
/// detects deadlocks, but only callers that asked for [`ChainWalk::Full`] get
/// the error back; the others are parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainWalk {
    /// Stop as soon as no further task's priority can change.
    Min,
    /// Walk the whole chain to find cycles, requeueing only where needed.
    Full,
}

/// Who may take a contended lock ahead of the top waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StealMode {
    /// Only a strictly more urgent task.
    Normal,
    /// Equal priority non real-time tasks too.
    Lateral,
}

/// Per-lock configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockConfig {
    pub steal: StealMode,
    /// Chain-walk mode of the plain blocking acquires.
    pub chain_walk: ChainWalk,
}

impl LockConfig {
    pub fn lateral_steal(mut self) -> LockConfig {
        self.steal = StealMode::Lateral;
        self
    }

    pub fn detect_deadlock(mut self) -> LockConfig {
        self.chain_walk = ChainWalk::Full;
        self
    }
}

impl Default for LockConfig {
    fn default() -> LockConfig {
        LockConfig {
            steal: StealMode::Normal,
            chain_walk: ChainWalk::Min,
        }
    }
}
