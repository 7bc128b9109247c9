// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Tasks: the threads that own and wait for rt-mutexes.
//!
//! Every thread that touches an [`RtMutex`](crate::RtMutex) is represented by
//! a [`Task`]. A task carries its own scheduling priority, the priority it
//! currently runs at (possibly boosted), the tree of top waiters of all the
//! locks it owns and the single wait point it is blocked on. Those fields
//! live behind the task's `pi_lock`.
//!
//! Tasks are shared through [`TaskRef`] handles. The ownership word of a
//! lock only stores a [`TaskId`]; the registry maps it back to a handle,
//! which pins the task for as long as the handle is held.

use core::fmt;
use core::num::NonZeroU64;
use core::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::cell::RefCell;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Instant;

use hashbrown::HashMap;
use lazy_static::lazy_static;
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::chain;
use crate::rtmutex::RtMutexBase;
use crate::sched::{PrioKey, Prio, SchedAttr};
use crate::spinlock::SpinLock;
use crate::waiter::{WaiterRef, WaiterTree};

/// A shared, pinning handle to a [`Task`].
pub type TaskRef = Arc<Task>;

/// Identity of a task, never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(NonZeroU64);

impl TaskId {
    pub fn as_u64(self) -> u64 {
        self.0.get()
    }

    pub(crate) fn from_u64(id: u64) -> Option<TaskId> {
        NonZeroU64::new(id).map(TaskId)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

lazy_static! {
    /// All live tasks, keyed by id.
    static ref TASKS: RwLock<HashMap<TaskId, Weak<Task>>> = RwLock::new(HashMap::new());
}

thread_local! {
    static CURRENT: RefCell<Option<TaskRef>> = RefCell::new(None);
}

/// What a task is blocked through.
pub(crate) enum WaitPoint {
    None,
    Real(WaiterRef),
    /// The proxy layer is waking the task, it must not be enqueued.
    WakeupInProgress,
    /// The proxy layer is enqueueing the task on a lock.
    RequeueInProgress,
}

impl WaitPoint {
    /// The waiter, if this is a real blocking relationship.
    pub(crate) fn real(&self) -> Option<&WaiterRef> {
        match self {
            WaitPoint::Real(w) => Some(w),
            _ => None,
        }
    }
}

/// Priority inheritance state of a task, protected by `pi_lock`.
pub(crate) struct PiState {
    /// Own priority, unaffected by boosting.
    pub(crate) normal_prio: Prio,
    pub(crate) deadline: u64,
    /// Effective priority.
    pub(crate) prio: Prio,
    /// Effective deadline, inherited from a deadline waiter while boosted.
    pub(crate) pi_deadline: u64,
    /// Top waiters of all locks this task owns.
    pub(crate) pi_waiters: WaiterTree,
    pub(crate) pi_blocked_on: WaitPoint,
}

impl PiState {
    fn new(attr: SchedAttr) -> PiState {
        PiState {
            normal_prio: attr.prio,
            deadline: attr.deadline,
            prio: attr.prio,
            pi_deadline: attr.deadline,
            pi_waiters: WaiterTree::new(),
            pi_blocked_on: WaitPoint::None,
        }
    }

    /// The key this task would be queued with right now.
    pub(crate) fn key(&self) -> PrioKey {
        PrioKey::new(self.prio, self.pi_deadline)
    }

    pub(crate) fn normal_key(&self) -> PrioKey {
        PrioKey::new(self.normal_prio, self.deadline)
    }

    pub(crate) fn top_pi_waiter(&self) -> Option<&WaiterRef> {
        self.pi_waiters.first()
    }

    /// The lock this task is really blocked on, if any.
    pub(crate) fn blocked_on_lock(&self) -> Option<Arc<RtMutexBase>> {
        self.pi_blocked_on.real().map(|w| w.lock().clone())
    }
}

/// Signals that may abort a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Aborts interruptible waits.
    Interrupt,
    /// Aborts interruptible and killable waits.
    Kill,
}

impl Signal {
    fn bit(self) -> u8 {
        match self {
            Signal::Interrupt => 1,
            Signal::Kill => 2,
        }
    }
}

/// How a blocked task reacts to signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SleepState {
    Uninterruptible,
    Interruptible,
    Killable,
}

/// Sleep/wake-up primitive of a task. A wake-up that arrives before the
/// task goes to sleep is not lost.
struct Parker {
    woken: Mutex<bool>,
    cv: Condvar,
}

impl Parker {
    fn new() -> Parker {
        Parker {
            woken: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn unpark(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.cv.notify_one();
    }

    fn park(&self, deadline: Option<Instant>) {
        let mut woken = self.woken.lock();
        while !*woken {
            match deadline {
                Some(d) => {
                    if self.cv.wait_until(&mut woken, d).timed_out() {
                        break;
                    }
                }
                None => self.cv.wait(&mut woken),
            }
        }
        *woken = false;
    }
}

pub struct Task {
    id: TaskId,
    name: String,
    /// The `pi_lock`.
    pub(crate) pi: SpinLock<PiState>,
    /// Mirror of `PiState::prio` for lock-free readers.
    prio: AtomicI32,
    signals: AtomicU8,
    parker: Parker,
}

impl Task {
    /// Create and register a task. It is not bound to any thread, see
    /// [`spawn`] and [`adopt`].
    pub fn new(name: &str, attr: SchedAttr) -> TaskRef {
        let id = TaskId::from_u64(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
            .expect("task ids start at one");
        let task = Arc::new(Task {
            id,
            name: name.to_string(),
            pi: SpinLock::new(PiState::new(attr)),
            prio: AtomicI32::new(attr.prio),
            signals: AtomicU8::new(0),
            parker: Parker::new(),
        });
        TASKS.write().insert(id, Arc::downgrade(&task));
        trace!("registered task {} at prio {}", task, attr.prio);
        task
    }

    /// Pin a live task by id.
    pub fn lookup(id: TaskId) -> Option<TaskRef> {
        let task = TASKS.read().get(&id).and_then(Weak::upgrade);
        if task.is_none() {
            warn!("task {} is gone but still referenced", id);
        }
        task
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Effective, possibly boosted, priority.
    pub fn prio(&self) -> Prio {
        self.prio.load(Ordering::Acquire)
    }

    pub fn normal_prio(&self) -> Prio {
        self.pi.lock().normal_prio
    }

    pub fn is_boosted(&self) -> bool {
        let pi = self.pi.lock();
        pi.prio != pi.normal_prio || pi.pi_deadline != pi.deadline
    }

    /// Whether the task is blocked on an rt-mutex.
    pub fn is_blocked(&self) -> bool {
        self.pi.lock().pi_blocked_on.real().is_some()
    }

    /// Number of owned locks that currently have waiters.
    pub fn pi_waiter_count(&self) -> usize {
        self.pi.lock().pi_waiters.len()
    }

    /// Change the task's own scheduling attributes.
    ///
    /// The effective priority is recomputed against the inherited one and, if
    /// the task is blocked, the change is propagated down its chain.
    pub fn set_scheduler(self: &Arc<Self>, attr: SchedAttr) {
        {
            let mut pi = self.pi.lock();
            debug!(
                "{}: set scheduler prio {} -> {}",
                self, pi.normal_prio, attr.prio
            );
            pi.normal_prio = attr.prio;
            pi.deadline = attr.deadline;
            chain::adjust_prio(self, &mut pi);
        }
        chain::adjust_pi(self);
    }

    pub fn send_signal(&self, sig: Signal) {
        self.signals.fetch_or(sig.bit(), Ordering::AcqRel);
        self.wake_up();
    }

    pub fn clear_signals(&self) {
        self.signals.store(0, Ordering::Release);
    }

    pub fn signal_pending(&self) -> bool {
        self.signals.load(Ordering::Acquire) != 0
    }

    pub(crate) fn signal_pending_state(&self, state: SleepState) -> bool {
        let pending = self.signals.load(Ordering::Acquire);
        match state {
            SleepState::Uninterruptible => false,
            SleepState::Interruptible => pending != 0,
            SleepState::Killable => pending & Signal::Kill.bit() != 0,
        }
    }

    /// Mark the task as being woken by the proxy layer so no lock can enqueue
    /// it meanwhile. Fails if the task already has a wait point, i.e. it was
    /// requeued onto a lock first.
    pub fn set_wakeup_in_progress(&self) -> bool {
        let mut pi = self.pi.lock();
        if !matches!(pi.pi_blocked_on, WaitPoint::None) {
            return false;
        }
        pi.pi_blocked_on = WaitPoint::WakeupInProgress;
        true
    }

    pub fn clear_wakeup_in_progress(&self) {
        let mut pi = self.pi.lock();
        if let WaitPoint::WakeupInProgress = pi.pi_blocked_on {
            pi.pi_blocked_on = WaitPoint::None;
        }
    }

    /// Store a new effective priority, `pi_lock` held.
    pub(crate) fn publish_prio(&self, prio: Prio) {
        self.prio.store(prio, Ordering::Release);
    }

    pub(crate) fn wake_up(&self) {
        self.parker.unpark();
    }

    /// Sleep until woken or `deadline` passes. Must not be called with any
    /// spin lock held.
    pub(crate) fn schedule(&self, deadline: Option<Instant>) {
        self.parker.park(deadline);
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.id)
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("prio", &self.prio())
            .finish()
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        TASKS.write().remove(&self.id);
    }
}

/// The task of the calling thread, registered at default priority on first
/// use unless one was [`adopt`]ed.
pub fn current() -> TaskRef {
    CURRENT.with(|c| {
        c.borrow_mut()
            .get_or_insert_with(|| {
                let name = thread::current().name().unwrap_or("task").to_string();
                Task::new(&name, SchedAttr::default())
            })
            .clone()
    })
}

/// Bind `task` to the calling thread.
///
/// # Panics
/// If the thread already has a task.
pub fn adopt(task: TaskRef) {
    CURRENT.with(|c| {
        let mut c = c.borrow_mut();
        assert!(c.is_none(), "thread already runs task {}", c.as_ref().unwrap());
        *c = Some(task);
    })
}

/// Spawn a thread running as a new task with the given attributes.
pub fn spawn<F, T>(name: &str, attr: SchedAttr, f: F) -> (TaskRef, thread::JoinHandle<T>)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let task = Task::new(name, attr);
    let t = task.clone();
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            adopt(t);
            f()
        })
        .expect("failed to spawn task thread");
    (task, handle)
}
