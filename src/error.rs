// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error types returned by the rt-mutex.

use core::fmt;

/// Outcomes of a lock operation that did not acquire the lock.
///
/// None of these leave the lock or any task's priority inconsistent: every
/// abort path dequeues the waiter and undoes its boost before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The lock is owned by someone else.
    WouldBlock,
    /// A pending signal aborted an interruptible or killable wait.
    Interrupted,
    /// The deadline passed before the lock was handed over.
    TimedOut,
    /// The chain walk found a cycle back to the caller, or ran deeper than
    /// the configured maximum lock depth.
    Deadlock,
    /// The task's blocking state is being changed by the proxy layer, retry.
    Again,
    /// The lock was used in a way its contract forbids (e.g. destroyed while
    /// held).
    ContractViolation,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WouldBlock => write!(f, "lock is owned by another task"),
            Self::Interrupted => write!(f, "wait interrupted by a signal"),
            Self::TimedOut => write!(f, "wait timed out"),
            Self::Deadlock => write!(f, "deadlock detected"),
            Self::Again => write!(f, "blocking state in transition, try again"),
            Self::ContractViolation => write!(f, "lock contract violated"),
        }
    }
}

impl std::error::Error for Error {}
