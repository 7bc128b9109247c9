// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The chain walk depth limit. The limit is global, so this file holds a
//! single test.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rtmutex::config::{max_lock_depth, set_max_lock_depth, DEFAULT_MAX_LOCK_DEPTH};
use rtmutex::{current, spawn, Error, Owner, RtMutex, SchedAttr};

mod common;
use common::wait_for;

/// `BLOCKED` owners in a row: reaching the running task at the end of the
/// chain takes exactly that many hops.
const BLOCKED: usize = 5;

#[test]
fn depth_limit() {
    let _r = env_logger::try_init();
    assert_eq!(max_lock_depth(), DEFAULT_MAX_LOCK_DEPTH);

    walk_depth_boundary();
    cut_off_walks_keep_handoffs();

    set_max_lock_depth(DEFAULT_MAX_LOCK_DEPTH);
}

fn walk_depth_boundary() {

    // Task i owns lock i and, except for the last, waits for lock i + 1.
    let locks: Vec<_> = (0..=BLOCKED + 1).map(|_| Arc::new(RtMutex::new())).collect();
    let (release, release_rx) = mpsc::channel::<()>();

    let mut chain = Vec::new();
    let last = {
        let l = locks[BLOCKED + 1].clone();
        spawn("tail", SchedAttr::prio(100), move || {
            l.lock().unwrap();
            release_rx.recv().unwrap();
            l.unlock();
        })
    };
    wait_for("tail", || locks[BLOCKED + 1].is_locked());

    for i in (1..=BLOCKED).rev() {
        let mine = locks[i].clone();
        let next = locks[i + 1].clone();
        let (t, h) = spawn(&format!("link{}", i), SchedAttr::prio(100), move || {
            mine.lock().unwrap();
            next.lock().unwrap();
            next.unlock();
            mine.unlock();
        });
        wait_for("link to block", || t.is_blocked() && locks[i].is_locked());
        chain.push((t, h));
    }

    // One hop short: the walk gives up and everything is undone.
    set_max_lock_depth(BLOCKED - 1);
    let (head, h) = {
        let l = locks[1].clone();
        spawn("head", SchedAttr::prio(1), move || l.lock_detect_deadlock())
    };
    assert_eq!(h.join().unwrap(), Err(Error::Deadlock));
    assert!(!head.is_blocked());
    assert!(!last.0.is_boosted());
    for (t, _) in chain.iter() {
        assert!(!t.is_boosted(), "{} still boosted", t);
    }

    // Exactly enough hops.
    set_max_lock_depth(BLOCKED);
    let (head, h) = {
        let l = locks[1].clone();
        spawn("head", SchedAttr::prio(1), move || {
            let r = l.lock_detect_deadlock();
            if r.is_ok() {
                l.unlock();
            }
            r
        })
    };
    wait_for("boost to reach the tail", || last.0.prio() == 1);
    for (t, _) in chain.iter() {
        assert_eq!(t.prio(), 1);
    }
    assert!(head.is_blocked());

    release.send(()).unwrap();
    assert_eq!(h.join().unwrap(), Ok(()));
    for (t, h) in chain {
        h.join().unwrap();
        assert!(!t.is_boosted());
    }
    last.1.join().unwrap();
}

/// Every walk through a blocked owner is cut off while that owner keeps
/// releasing the lock. A contender whose walk fails after it was handed the
/// lock must take it, or the waiters behind it are never woken.
fn cut_off_walks_keep_handoffs() {
    set_max_lock_depth(0);
    let l = Arc::new(RtMutex::new());
    let m = Arc::new(RtMutex::new());
    let done = Arc::new(AtomicUsize::new(0));
    let stop = Instant::now() + Duration::from_millis(500);
    let mut handles = Vec::new();

    // Owns `l` while blocking on `m`.
    {
        let (l, m, done) = (l.clone(), m.clone(), done.clone());
        handles.push(spawn("holder", SchedAttr::normal(0), move || {
            while Instant::now() < stop {
                l.lock().unwrap();
                m.lock().unwrap();
                m.unlock();
                l.unlock();
            }
            done.fetch_add(1, Ordering::Relaxed);
        }));
    }
    {
        let (m, done) = (m.clone(), done.clone());
        handles.push(spawn("toggler", SchedAttr::normal(0), move || {
            while Instant::now() < stop {
                m.lock().unwrap();
                thread::yield_now();
                m.unlock();
            }
            done.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for (name, attr) in [("rt", SchedAttr::fifo(10)), ("normal", SchedAttr::normal(5))].iter() {
        let (l, done) = (l.clone(), done.clone());
        handles.push(spawn(name, *attr, move || {
            while Instant::now() < stop {
                match l.lock_detect_deadlock() {
                    Ok(()) => l.unlock(),
                    Err(e) => {
                        assert_eq!(e, Error::Deadlock);
                        assert!(!current().is_blocked());
                    }
                }
            }
            done.fetch_add(1, Ordering::Relaxed);
        }));
    }

    wait_for("all tasks to finish", || done.load(Ordering::Relaxed) == 4);
    set_max_lock_depth(DEFAULT_MAX_LOCK_DEPTH);
    for (t, h) in handles {
        h.join().unwrap();
        assert!(!t.is_boosted(), "{} left boosted", t);
        assert!(!t.is_blocked());
    }
    assert_eq!(l.state(), Owner::Free);
    assert_eq!(m.state(), Owner::Free);
}
