// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::spindle::{
    CancellationReason,
    Fail,
    Importance,
    Runtime,
    TaskHandle,
};
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    thread,
    time::Duration,
};

use crate::common::spin_until;

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Parks a spinning task on the processor so its single worker stays busy until `release` turns true.
/// Returns once the blocker is running.
fn occupy_worker(runtime: &Runtime, release: &Arc<AtomicBool>) -> Result<TaskHandle<()>, Fail> {
    let started: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let blocker: TaskHandle<()> = {
        let started = started.clone();
        let release = release.clone();
        runtime.spawn(async move {
            started.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                thread::yield_now();
            }
        })?
    };
    spin_until(|| started.load(Ordering::SeqCst), "the blocker to occupy the worker");
    Ok(blocker)
}

//======================================================================================================================
// Queue Length Shedding
//======================================================================================================================

/// Tests that once the run queue is at its length limit, further Normal tasks are shed while a Critical task
/// is still admitted.
#[test]
fn queue_length_limit_sheds_normal_tasks() -> Result<()> {
    const LIMIT: usize = 4;
    const SPAWNED: usize = 10;

    let runtime: Runtime = common::runtime_with_limits(1, Some(LIMIT), None)?;
    let release: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let blocker: TaskHandle<()> = occupy_worker(&runtime, &release)?;

    // The worker is pinned, so every spawn below piles up in the queue.
    let mut victims: Vec<TaskHandle<u32>> = Vec::new();
    for i in 0..SPAWNED {
        victims.push(runtime.spawn(async move { i as u32 })?);
    }
    let critical: TaskHandle<u32> = runtime.spawn_with(async { 777 }, Importance::Critical)?;

    release.store(true, Ordering::SeqCst);
    blocker.wait()?;

    let mut admitted: usize = 0;
    let mut shed: usize = 0;
    for victim in victims {
        match victim.wait() {
            Ok(_) => admitted += 1,
            Err(fail) => {
                spindle::ensure_eq!(fail.errno, libc::ECANCELED);
                spindle::ensure_eq!(victim.cancellation_reason(), Some(CancellationReason::Overload));
                shed += 1;
            },
        }
    }
    spindle::ensure_eq!(admitted, LIMIT);
    spindle::ensure_eq!(shed, SPAWNED - LIMIT);

    // Critical tasks are exempt from overload control.
    spindle::ensure_eq!(critical.wait()?, 777);

    let stats = runtime.stats();
    spindle::ensure_eq!(stats[0].shed_overload, (SPAWNED - LIMIT) as u64);

    runtime.shutdown();
    Ok(())
}

//======================================================================================================================
// Queue Wait Shedding
//======================================================================================================================

/// Tests that a Normal task that sat in the queue past the wait limit is shed at dequeue, while a Critical
/// one runs regardless.
#[test]
fn queue_wait_limit_sheds_stale_tasks() -> Result<()> {
    let runtime: Runtime = common::runtime_with_limits(1, None, Some(Duration::from_millis(50)))?;

    // Pin the worker long enough for queued tasks to overstay the wait limit.
    let started: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let blocker: TaskHandle<()> = {
        let started = started.clone();
        runtime.spawn(async move {
            started.store(true, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(200));
        })?
    };
    spin_until(|| started.load(Ordering::SeqCst), "the blocker to occupy the worker");

    let victim: TaskHandle<u32> = runtime.spawn(async { 1 })?;
    let critical: TaskHandle<u32> = runtime.spawn_with(async { 2 }, Importance::Critical)?;

    blocker.wait()?;
    let fail: Fail = victim.wait().expect_err("the victim overstayed the wait limit");
    spindle::ensure_eq!(fail.errno, libc::ECANCELED);
    spindle::ensure_eq!(victim.cancellation_reason(), Some(CancellationReason::Overload));
    spindle::ensure_eq!(critical.wait()?, 2);

    let stats = runtime.stats();
    spindle::ensure_eq!(stats[0].shed_overload, 1);

    runtime.shutdown();
    Ok(())
}

//======================================================================================================================
// Shutdown
//======================================================================================================================

/// Tests that spawning on a stopped runtime fails instead of losing the task silently.
#[test]
fn spawn_after_shutdown_fails() -> Result<()> {
    let runtime: Runtime = common::runtime_with_workers(1)?;
    runtime.shutdown();

    let fail: Fail = match runtime.spawn(async {}) {
        Err(fail) => fail,
        Ok(handle) => {
            handle.detach();
            anyhow::bail!("spawn on a stopped runtime should fail");
        },
    };
    spindle::ensure_eq!(fail.errno, libc::ESHUTDOWN);

    Ok(())
}

/// Tests that shutdown cancels parked tasks and drains them to terminal before returning.
#[test]
fn shutdown_drains_parked_tasks() -> Result<()> {
    let runtime: Runtime = common::runtime_with_workers(2)?;

    let mut sleepers: Vec<TaskHandle<Result<(), Fail>>> = Vec::new();
    for _ in 0..2 {
        sleepers.push(runtime.spawn(async { spindle::sleep_for(Duration::from_secs(60)).await })?);
    }
    // Let both park before pulling the plug.
    thread::sleep(Duration::from_millis(50));
    runtime.shutdown();

    for sleeper in sleepers {
        spindle::ensure_eq!(sleeper.is_finished(), true);
        let fail: Fail = sleeper.wait().expect_err("shutdown cancelled the sleeper");
        spindle::ensure_eq!(fail.errno, libc::ECANCELED);
        spindle::ensure_eq!(sleeper.cancellation_reason(), Some(CancellationReason::Shutdown));
    }

    Ok(())
}

//======================================================================================================================
// Pool Exhaustion
//======================================================================================================================

/// Tests that a full coroutine pool refuses further spawns with EAGAIN until a slot frees up.
#[test]
fn pool_exhaustion_rejects_spawn() -> Result<()> {
    let runtime: Runtime = common::runtime_with_pool(2, 2)?;

    let first: TaskHandle<Result<(), Fail>> =
        runtime.spawn(async { spindle::sleep_for(Duration::from_secs(60)).await })?;
    let second: TaskHandle<Result<(), Fail>> =
        runtime.spawn(async { spindle::sleep_for(Duration::from_secs(60)).await })?;

    let fail: Fail = runtime
        .spawn(async {})
        .err()
        .ok_or_else(|| anyhow::anyhow!("the pool holds two tasks already"))?;
    spindle::ensure_eq!(fail.errno, libc::EAGAIN);

    // Retiring a task returns its slot.
    first.request_cancel();
    let _ = first.wait();
    let third: TaskHandle<u32> = runtime.spawn(async { 3 })?;
    spindle::ensure_eq!(third.wait()?, 3);

    second.request_cancel();
    let _ = second.wait();
    runtime.shutdown();
    Ok(())
}
