// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The scheduler contract the rt-mutex relies on.
//!
//! Priorities follow the usual kernel convention: a lower number is more
//! urgent. Deadline tasks all share [`DL_PRIO`] and are ordered amongst each
//! other by their absolute deadline, real-time (FIFO) tasks live below
//! [`MAX_RT_PRIO`] and normal tasks fill the range up to [`MAX_PRIO`].

use core::fmt;

use crate::config::StealMode;

/// A scheduling priority, lower is more urgent.
pub type Prio = i32;

/// First priority above the deadline class.
pub const MAX_DL_PRIO: Prio = 0;

/// The priority every deadline task runs at.
pub const DL_PRIO: Prio = MAX_DL_PRIO - 1;

/// First priority that is not real-time.
pub const MAX_RT_PRIO: Prio = 100;

/// One past the least urgent priority.
pub const MAX_PRIO: Prio = MAX_RT_PRIO + 40;

/// Priority of a freshly registered task (nice 0).
pub const DEFAULT_PRIO: Prio = MAX_RT_PRIO + 20;

#[inline]
pub fn dl_prio(prio: Prio) -> bool {
    prio < MAX_DL_PRIO
}

/// True for real-time and deadline priorities.
#[inline]
pub fn rt_prio(prio: Prio) -> bool {
    prio < MAX_RT_PRIO
}

/// "a is earlier than b" for absolute deadlines.
///
/// Deadlines are absolute and do not wrap. Waiter trees order deadline
/// entries by the plain `u64`, so this must stay the same total order.
#[inline]
pub fn dl_time_before(a: u64, b: u64) -> bool {
    a < b
}

/// The scheduling class a priority belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Normal,
    Fifo,
    Deadline,
}

impl Policy {
    pub fn of(prio: Prio) -> Policy {
        if dl_prio(prio) {
            Policy::Deadline
        } else if rt_prio(prio) {
            Policy::Fifo
        } else {
            Policy::Normal
        }
    }
}

/// Scheduling attributes of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedAttr {
    pub prio: Prio,
    /// Absolute deadline, only meaningful for the deadline class.
    pub deadline: u64,
}

impl SchedAttr {
    /// A normal task with the given nice value (-20..=19).
    pub fn normal(nice: i32) -> SchedAttr {
        let nice = nice.max(-20).min(19);
        SchedAttr {
            prio: DEFAULT_PRIO + nice,
            deadline: 0,
        }
    }

    /// A FIFO task with a user visible real-time priority (1..=99, higher is
    /// more urgent), mapped onto the internal scale.
    pub fn fifo(rt_priority: u32) -> SchedAttr {
        let rt_priority = rt_priority.max(1).min(99) as Prio;
        SchedAttr {
            prio: MAX_RT_PRIO - 1 - rt_priority,
            deadline: 0,
        }
    }

    /// Deadline class with an absolute, non-wrapping `deadline`; earlier is
    /// more urgent.
    pub fn deadline(deadline: u64) -> SchedAttr {
        SchedAttr {
            prio: DL_PRIO,
            deadline,
        }
    }

    /// Raw internal priority, clamped to the valid range.
    pub fn prio(prio: Prio) -> SchedAttr {
        SchedAttr {
            prio: prio.max(DL_PRIO).min(MAX_PRIO - 1),
            deadline: 0,
        }
    }

    pub fn policy(&self) -> Policy {
        Policy::of(self.prio)
    }
}

impl Default for SchedAttr {
    fn default() -> SchedAttr {
        SchedAttr::normal(0)
    }
}

/// The sort key of a waiter in both the lock's and the owner's tree.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PrioKey {
    pub prio: Prio,
    pub deadline: u64,
}

impl PrioKey {
    pub fn new(prio: Prio, deadline: u64) -> PrioKey {
        PrioKey { prio, deadline }
    }

    /// Strictly more urgent than `other`.
    pub fn less(&self, other: &PrioKey) -> bool {
        if self.prio < other.prio {
            return true;
        }

        // Equal deadline-class priorities are ordered by deadline. Only
        // the prio needs checking, other is the same class then.
        if self.prio == other.prio && dl_prio(self.prio) {
            return dl_time_before(self.deadline, other.deadline);
        }

        false
    }

    pub fn equal(&self, other: &PrioKey) -> bool {
        if self.prio != other.prio {
            return false;
        }

        if dl_prio(self.prio) {
            return self.deadline == other.deadline;
        }

        true
    }

    /// May a contender keyed `self` take the lock ahead of `top`?
    ///
    /// Lateral steals among equals are only granted to non real-time tasks so
    /// their latency stays bounded.
    pub fn may_steal(&self, top: &PrioKey, mode: StealMode) -> bool {
        if self.less(top) {
            return true;
        }

        if mode == StealMode::Normal || rt_prio(self.prio) {
            return false;
        }

        self.equal(top)
    }
}

impl fmt::Debug for PrioKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if dl_prio(self.prio) {
            write!(f, "prio {} dl {}", self.prio, self.deadline)
        } else {
            write!(f, "prio {}", self.prio)
        }
    }
}
