// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::spindle::{
    CoroPoolSettings,
    Fail,
    ProcessorSettings,
    Runtime,
    RuntimeSettings,
};
use ::std::{
    thread,
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// Upper bound on how long any single test waits for an expected event.
#[allow(dead_code)]
pub const TEST_PATIENCE: Duration = Duration::from_secs(5);

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Spins until `condition` holds, panicking if it does not within [`TEST_PATIENCE`].
#[allow(dead_code)]
pub fn spin_until<F: Fn() -> bool>(condition: F, what: &str) {
    let started: Instant = Instant::now();
    while !condition() {
        assert!(started.elapsed() < TEST_PATIENCE, "timed out waiting for {}", what);
        thread::yield_now();
    }
}

/// Builds a runtime with one task processor running `workers` worker threads and no overload limits.
#[allow(dead_code)]
pub fn runtime_with_workers(workers: usize) -> Result<Runtime, Fail> {
    Runtime::from_settings(RuntimeSettings {
        processors: vec![ProcessorSettings {
            worker_threads: workers,
            ..Default::default()
        }],
        ..Default::default()
    })
}

/// Builds a single-processor runtime with explicit overload limits.
#[allow(dead_code)]
pub fn runtime_with_limits(
    workers: usize,
    queue_length_limit: Option<usize>,
    queue_wait_limit: Option<Duration>,
) -> Result<Runtime, Fail> {
    Runtime::from_settings(RuntimeSettings {
        processors: vec![ProcessorSettings {
            worker_threads: workers,
            queue_length_limit,
            queue_wait_limit,
            ..Default::default()
        }],
        ..Default::default()
    })
}

/// Builds a single-processor runtime whose coroutine pool holds at most `max_size` tasks.
#[allow(dead_code)]
pub fn runtime_with_pool(workers: usize, max_size: usize) -> Result<Runtime, Fail> {
    Runtime::from_settings(RuntimeSettings {
        coro_pool: CoroPoolSettings { max_size },
        processors: vec![ProcessorSettings {
            worker_threads: workers,
            ..Default::default()
        }],
    })
}
