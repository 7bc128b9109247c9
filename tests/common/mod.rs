// Copyright © 2019-2020 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Helpers shared by the integration tests.

use std::thread;
use std::time::{Duration, Instant};

/// Poll `cond` until it holds, failing the test after ten seconds.
pub fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    let start = Instant::now();
    while !cond() {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "timed out waiting for {}",
            what
        );
        thread::sleep(Duration::from_millis(1));
    }
}
