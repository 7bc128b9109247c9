// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cycles in the chain of blocked tasks.

use std::sync::mpsc;
use std::sync::{Arc, Barrier};

use rtmutex::{current, spawn, Error, LockConfig, Owner, RtMutex, SchedAttr};

mod common;
use common::wait_for;

/// T1 holds A and waits for B, T2 holds B and asks for A.
fn ab_ba(t1_attr: SchedAttr, t2_attr: SchedAttr, detect: bool) -> (Result<(), Error>, Result<(), Error>) {
    let a = Arc::new(RtMutex::new());
    let b = Arc::new(RtMutex::new());
    let held = Arc::new(Barrier::new(3));
    let (go, go_rx) = mpsc::channel::<()>();

    let acquire = move |m: &RtMutex| {
        if detect {
            m.lock_detect_deadlock()
        } else {
            m.lock()
        }
    };

    let (t1, t1_h) = {
        let (a, b, held) = (a.clone(), b.clone(), held.clone());
        spawn("T1", t1_attr, move || {
            a.lock().unwrap();
            held.wait();
            let r = acquire(&b);
            if r.is_ok() {
                b.unlock();
            }
            a.unlock();
            r
        })
    };

    let (_t2, t2_h) = {
        let (a, b, held) = (a.clone(), b.clone(), held.clone());
        spawn("T2", t2_attr, move || {
            b.lock().unwrap();
            held.wait();
            go_rx.recv().unwrap();
            let r = acquire(&a);

            // The failed attempt left A as it was.
            assert_eq!(a.owner(), Some(t1.id()));
            assert!(!a.has_waiters());
            assert!(!current().is_blocked());

            b.unlock();
            r
        })
    };

    held.wait();
    wait_for("T1 to block on B", || b.has_waiters());
    go.send(()).unwrap();

    let r2 = t2_h.join().unwrap();
    let r1 = t1_h.join().unwrap();
    assert_eq!(a.state(), Owner::Free);
    assert_eq!(b.state(), Owner::Free);
    (r1, r2)
}

#[test]
fn ab_ba_detected() {
    let _r = env_logger::try_init();
    let (r1, r2) = ab_ba(SchedAttr::default(), SchedAttr::default(), true);
    assert_eq!(r2, Err(Error::Deadlock));
    assert_eq!(r1, Ok(()));
}

/// Without detection a cycle still surfaces when the boost runs into it.
#[test]
#[cfg(not(feature = "debug-rt-mutexes"))]
fn boost_runs_into_cycle() {
    let _r = env_logger::try_init();
    let (r1, r2) = ab_ba(SchedAttr::prio(50), SchedAttr::prio(10), false);
    assert_eq!(r2, Err(Error::Deadlock));
    assert_eq!(r1, Ok(()));
}

#[test]
fn self_deadlock_detected() {
    let _r = env_logger::try_init();
    let m = RtMutex::with_config(LockConfig::default().detect_deadlock());
    m.lock().unwrap();
    assert_eq!(m.lock(), Err(Error::Deadlock));
    assert_eq!(m.lock_detect_deadlock(), Err(Error::Deadlock));
    assert_eq!(m.state(), Owner::Owned(current().id()));
    m.unlock();
    assert_eq!(m.state(), Owner::Free);
}

/// A cycle of three tasks is found from the task that closes it.
#[test]
fn three_way_cycle() {
    let _r = env_logger::try_init();
    let locks: Vec<_> = (0..3).map(|_| Arc::new(RtMutex::new())).collect();
    let held = Arc::new(Barrier::new(4));
    let (go, go_rx) = mpsc::channel::<()>();
    let mut go_rx = Some(go_rx);

    let mut handles = Vec::new();
    for i in 0..3 {
        let mine = locks[i].clone();
        let next = locks[(i + 1) % 3].clone();
        let held = held.clone();
        let go_rx = if i == 2 { go_rx.take() } else { None };
        let (_t, h) = spawn(&format!("cycle{}", i), SchedAttr::default(), move || {
            mine.lock().unwrap();
            held.wait();
            if let Some(rx) = go_rx {
                rx.recv().unwrap();
            }
            let r = next.lock_detect_deadlock();
            if r.is_ok() {
                next.unlock();
            }
            mine.unlock();
            r
        });
        handles.push(h);
    }

    held.wait();
    wait_for("two tasks to block", || locks[1].has_waiters() && locks[2].has_waiters());
    go.send(()).unwrap();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(results[2], Err(Error::Deadlock));
    assert_eq!(results[0], Ok(()));
    assert_eq!(results[1], Ok(()));
    for l in locks.iter() {
        assert_eq!(l.state(), Owner::Free);
    }
}
