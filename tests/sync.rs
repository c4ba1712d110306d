// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod common;

//======================================================================================================================
// Imports
//======================================================================================================================

use ::anyhow::Result;
use ::spindle::{
    Condvar,
    CvStatus,
    Deadline,
    Fail,
    Mutex,
    Runtime,
    Semaphore,
    SemaphoreLock,
    TaskHandle,
};
use ::std::{
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    thread,
    time::Duration,
};

use crate::common::spin_until;

//======================================================================================================================
// Mutex
//======================================================================================================================

/// Tests that the mutex serializes read-modify-write sequences that span a suspension point.
#[test]
fn mutex_serializes_read_modify_write() -> Result<()> {
    const TASKS: u64 = 8;
    const ROUNDS: u64 = 25;

    let runtime: Runtime = common::runtime_with_workers(4)?;
    let lock: Mutex = Mutex::new();
    let value: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));

    let mut handles: Vec<TaskHandle<Result<(), Fail>>> = Vec::new();
    for _ in 0..TASKS {
        let lock: Mutex = lock.clone();
        let value: Arc<AtomicU64> = value.clone();
        handles.push(runtime.spawn(async move {
            for _ in 0..ROUNDS {
                let guard = lock.lock(Deadline::never()).await?;
                // A non-atomic increment: without the lock, the yield would let another task interleave
                // between the read and the write and updates would be lost.
                let read: u64 = value.load(Ordering::SeqCst);
                spindle::yield_now().await;
                value.store(read + 1, Ordering::SeqCst);
                drop(guard);
            }
            Ok(())
        })?);
    }
    for handle in handles {
        handle.wait()??;
    }
    spindle::ensure_eq!(value.load(Ordering::SeqCst), TASKS * ROUNDS);

    runtime.shutdown();
    Ok(())
}

/// Tests that a bounded lock attempt on a held mutex times out with the mutex still held.
#[test]
fn mutex_lock_times_out() -> Result<()> {
    let runtime: Runtime = common::runtime_with_workers(2)?;
    let lock: Mutex = Mutex::new();

    let holding: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let release: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let holder: TaskHandle<Result<(), Fail>> = {
        let lock = lock.clone();
        let holding = holding.clone();
        let release = release.clone();
        runtime.spawn(async move {
            let guard = lock.lock(Deadline::never()).await?;
            holding.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                spindle::yield_now().await;
            }
            drop(guard);
            Ok(())
        })?
    };
    spin_until(|| holding.load(Ordering::SeqCst), "the holder to take the mutex");

    let contender: TaskHandle<Result<(), Fail>> = {
        let lock = lock.clone();
        runtime.spawn(async move {
            lock.lock(Deadline::from_duration(Duration::from_millis(50))).await?;
            Ok(())
        })?
    };
    let fail: Fail = contender.wait()?.expect_err("the mutex was held past the deadline");
    spindle::ensure_eq!(fail.errno, libc::ETIMEDOUT);

    // The holder still owns the mutex; barging in is impossible until it lets go.
    spindle::ensure_eq!(lock.try_lock().is_none(), true);
    release.store(true, Ordering::SeqCst);
    holder.wait()??;
    spindle::ensure_eq!(lock.try_lock().is_some(), true);

    runtime.shutdown();
    Ok(())
}

/// Tests that cancelling a task parked on a mutex resolves its lock attempt with ECANCELED.
#[test]
fn cancel_interrupts_mutex_wait() -> Result<()> {
    let runtime: Runtime = common::runtime_with_workers(2)?;
    let lock: Mutex = Mutex::new();

    let holding: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let release: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let holder: TaskHandle<Result<(), Fail>> = {
        let lock = lock.clone();
        let holding = holding.clone();
        let release = release.clone();
        runtime.spawn(async move {
            let _guard = lock.lock(Deadline::never()).await?;
            holding.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                spindle::yield_now().await;
            }
            Ok(())
        })?
    };
    spin_until(|| holding.load(Ordering::SeqCst), "the holder to take the mutex");

    let contender: TaskHandle<Result<(), Fail>> = {
        let lock = lock.clone();
        runtime.spawn(async move {
            lock.lock(Deadline::never()).await?;
            Ok(())
        })?
    };
    thread::sleep(Duration::from_millis(50));

    contender.request_cancel();
    let fail: Fail = contender.wait().expect_err("the contender was cancelled while parked");
    spindle::ensure_eq!(fail.errno, libc::ECANCELED);

    release.store(true, Ordering::SeqCst);
    holder.wait()??;

    runtime.shutdown();
    Ok(())
}

//======================================================================================================================
// Semaphore
//======================================================================================================================

/// Tests that a semaphore of capacity two never admits a third task into the guarded section.
#[test]
fn semaphore_bounds_concurrency() -> Result<()> {
    const TASKS: u64 = 8;

    let runtime: Runtime = common::runtime_with_workers(4)?;
    let semaphore: Semaphore = Semaphore::new(2);
    let inside: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));
    let peak: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));

    let mut handles: Vec<TaskHandle<Result<(), Fail>>> = Vec::new();
    for _ in 0..TASKS {
        let semaphore: Semaphore = semaphore.clone();
        let inside: Arc<AtomicU64> = inside.clone();
        let peak: Arc<AtomicU64> = peak.clone();
        handles.push(runtime.spawn(async move {
            let unit = semaphore.acquire(Deadline::never()).await?;
            let now: u64 = inside.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            spindle::sleep_for(Duration::from_millis(10)).await?;
            inside.fetch_sub(1, Ordering::SeqCst);
            unit.release();
            Ok(())
        })?);
    }
    for handle in handles {
        handle.wait()??;
    }

    spindle::ensure_eq!(inside.load(Ordering::SeqCst), 0);
    if peak.load(Ordering::SeqCst) > 2 {
        anyhow::bail!("semaphore admitted {} tasks at once", peak.load(Ordering::SeqCst));
    }
    spindle::ensure_eq!(semaphore.available(), 2);

    runtime.shutdown();
    Ok(())
}

/// Tests contended acquisition: try_acquire refuses, a short deadline times out, and a wait long enough to
/// span the holder's release succeeds.
#[test]
fn semaphore_waits_out_a_holder() -> Result<()> {
    let runtime: Runtime = common::runtime_with_workers(2)?;
    let semaphore: Semaphore = Semaphore::new(1);

    let holding: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let release: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let holder: TaskHandle<Result<(), Fail>> = {
        let semaphore = semaphore.clone();
        let holding = holding.clone();
        let release = release.clone();
        runtime.spawn(async move {
            let unit = semaphore.acquire(Deadline::never()).await?;
            holding.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                spindle::yield_now().await;
            }
            unit.release();
            Ok(())
        })?
    };
    spin_until(|| holding.load(Ordering::SeqCst), "the holder to take the unit");

    // No unit to hand out while the holder sits on it.
    spindle::ensure_eq!(semaphore.try_acquire().is_none(), true);
    let hurried: TaskHandle<Result<(), Fail>> = {
        let semaphore = semaphore.clone();
        runtime.spawn(async move {
            semaphore.acquire(Deadline::from_duration(Duration::from_millis(50))).await?;
            Ok(())
        })?
    };
    let fail: Fail = hurried.wait()?.expect_err("no unit frees up within 50ms");
    spindle::ensure_eq!(fail.errno, libc::ETIMEDOUT);

    // A patient waiter parks until the holder releases.
    let patient: TaskHandle<Result<bool, Fail>> = {
        let semaphore = semaphore.clone();
        runtime.spawn(async move {
            let unit = semaphore.acquire(Deadline::from_duration(Duration::from_secs(5))).await?;
            Ok(unit.owns())
        })?
    };
    thread::sleep(Duration::from_millis(50));
    release.store(true, Ordering::SeqCst);
    holder.wait()??;

    spindle::ensure_eq!(patient.wait()??, true);
    spindle::ensure_eq!(semaphore.available(), 1);

    runtime.shutdown();
    Ok(())
}

/// Tests a multi-unit grant under contention: the waiter takes all of its units at once, surviving a partial
/// release that cannot satisfy it.
#[test]
fn semaphore_grants_multiple_units_atomically() -> Result<()> {
    let runtime: Runtime = common::runtime_with_workers(2)?;
    let semaphore: Semaphore = Semaphore::new(3);

    // Drain the semaphore so the waiter has to park for its units.
    spindle::ensure_eq!(semaphore.try_acquire_count(3), true);
    spindle::ensure_eq!(semaphore.available(), 0);

    let granted: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let waiter: TaskHandle<Result<usize, Fail>> = {
        let semaphore = semaphore.clone();
        let granted = granted.clone();
        runtime.spawn(async move {
            let lock: SemaphoreLock =
                SemaphoreLock::acquire(&semaphore, 2, Deadline::from_duration(Duration::from_secs(5))).await?;
            granted.store(true, Ordering::SeqCst);
            let held: usize = lock.count();
            lock.release();
            Ok(held)
        })?
    };

    // One unit back is not enough for a two-unit grant; the waiter wakes, comes up short, and parks again.
    thread::sleep(Duration::from_millis(50));
    semaphore.release_count(1)?;
    thread::sleep(Duration::from_millis(50));
    spindle::ensure_eq!(granted.load(Ordering::SeqCst), false);
    spindle::ensure_eq!(semaphore.available(), 1);

    // The remaining units complete the grant.
    semaphore.release_count(2)?;
    spindle::ensure_eq!(waiter.wait()??, 2);
    spindle::ensure_eq!(semaphore.available(), 3);

    runtime.shutdown();
    Ok(())
}

/// Tests that asking for more units than the semaphore could ever hold is refused outright.
#[test]
fn semaphore_refuses_oversized_request() -> Result<()> {
    let runtime: Runtime = common::runtime_with_workers(2)?;
    let semaphore: Semaphore = Semaphore::new(2);

    let handle: TaskHandle<Result<(), Fail>> = {
        let semaphore = semaphore.clone();
        runtime.spawn(async move {
            semaphore.acquire_count(3, Deadline::never()).await?;
            Ok(())
        })?
    };
    let fail: Fail = handle.wait()?.expect_err("three units can never be granted by a semaphore of two");
    spindle::ensure_eq!(fail.errno, libc::EINVAL);
    spindle::ensure_eq!(semaphore.available(), 2);

    runtime.shutdown();
    Ok(())
}

//======================================================================================================================
// Condition Variable
//======================================================================================================================

/// Tests the monitor protocol: a waiter parked on a predicate resumes once a signaler flips it under the mutex.
#[test]
fn condvar_wakes_on_signal() -> Result<()> {
    let runtime: Runtime = common::runtime_with_workers(2)?;
    let lock: Mutex = Mutex::new();
    let condvar: Condvar = Condvar::new();
    let ready: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

    let waiter: TaskHandle<Result<u32, Fail>> = {
        let lock = lock.clone();
        let condvar = condvar.clone();
        let ready = ready.clone();
        runtime.spawn(async move {
            let mut guard = lock.lock(Deadline::never()).await?;
            while !ready.load(Ordering::SeqCst) {
                guard = condvar.wait(guard).await?;
            }
            drop(guard);
            Ok(99)
        })?
    };

    let signaler: TaskHandle<Result<(), Fail>> = {
        let lock = lock.clone();
        let condvar = condvar.clone();
        let ready = ready.clone();
        runtime.spawn(async move {
            spindle::sleep_for(Duration::from_millis(20)).await?;
            let guard = lock.lock(Deadline::never()).await?;
            ready.store(true, Ordering::SeqCst);
            drop(guard);
            condvar.notify_one();
            Ok(())
        })?
    };

    spindle::ensure_eq!(waiter.wait()??, 99);
    signaler.wait()??;

    runtime.shutdown();
    Ok(())
}

/// Tests that a bounded wait whose predicate never turns reports a timeout and hands the mutex back.
#[test]
fn condvar_wait_for_times_out() -> Result<()> {
    let runtime: Runtime = common::runtime_with_workers(2)?;
    let lock: Mutex = Mutex::new();
    let condvar: Condvar = Condvar::new();

    let handle: TaskHandle<Result<CvStatus, Fail>> = {
        let lock = lock.clone();
        let condvar = condvar.clone();
        runtime.spawn(async move {
            let guard = lock.lock(Deadline::never()).await?;
            let (guard, status) = condvar.wait_for(guard, Duration::from_millis(50), || false).await?;
            // The guard is live again after the timeout.
            drop(guard);
            Ok(status)
        })?
    };
    spindle::ensure_eq!(handle.wait()??, CvStatus::TimedOut);

    // Nobody is left holding the mutex.
    spindle::ensure_eq!(lock.try_lock().is_some(), true);

    runtime.shutdown();
    Ok(())
}

/// Tests the boolean predicate wait: a deadline that beats the predicate reports false, a later wait that
/// spans the signal reports true, and the mutex is held again both times.
#[test]
fn condvar_wait_while_reports_predicate() -> Result<()> {
    let runtime: Runtime = common::runtime_with_workers(2)?;
    let lock: Mutex = Mutex::new();
    let condvar: Condvar = Condvar::new();
    let ready: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));

    let waiter: TaskHandle<Result<(bool, bool), Fail>> = {
        let lock = lock.clone();
        let condvar = condvar.clone();
        let ready = ready.clone();
        runtime.spawn(async move {
            let guard = lock.lock(Deadline::never()).await?;
            let (guard, early) = condvar
                .wait_while(guard, Deadline::from_duration(Duration::from_millis(50)), || {
                    ready.load(Ordering::SeqCst)
                })
                .await?;
            let (guard, later) = condvar
                .wait_while(guard, Deadline::from_duration(Duration::from_secs(5)), || {
                    ready.load(Ordering::SeqCst)
                })
                .await?;
            drop(guard);
            Ok((early, later))
        })?
    };

    let signaler: TaskHandle<Result<(), Fail>> = {
        let lock = lock.clone();
        let condvar = condvar.clone();
        let ready = ready.clone();
        runtime.spawn(async move {
            spindle::sleep_for(Duration::from_millis(300)).await?;
            let guard = lock.lock(Deadline::never()).await?;
            ready.store(true, Ordering::SeqCst);
            drop(guard);
            condvar.notify_one();
            Ok(())
        })?
    };

    let (early, later) = waiter.wait()??;
    spindle::ensure_eq!(early, false);
    spindle::ensure_eq!(later, true);
    signaler.wait()??;

    // Nobody is left holding the mutex.
    spindle::ensure_eq!(lock.try_lock().is_some(), true);

    runtime.shutdown();
    Ok(())
}

/// Tests that notify_all releases every parked waiter.
#[test]
fn condvar_notify_all_wakes_everyone() -> Result<()> {
    const WAITERS: u64 = 4;

    let runtime: Runtime = common::runtime_with_workers(4)?;
    let lock: Mutex = Mutex::new();
    let condvar: Condvar = Condvar::new();
    let go: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let woken: Arc<AtomicU64> = Arc::new(AtomicU64::new(0));

    let mut handles: Vec<TaskHandle<Result<(), Fail>>> = Vec::new();
    for _ in 0..WAITERS {
        let lock: Mutex = lock.clone();
        let condvar: Condvar = condvar.clone();
        let go: Arc<AtomicBool> = go.clone();
        let woken: Arc<AtomicU64> = woken.clone();
        handles.push(runtime.spawn(async move {
            let mut guard = lock.lock(Deadline::never()).await?;
            while !go.load(Ordering::SeqCst) {
                guard = condvar.wait(guard).await?;
            }
            drop(guard);
            woken.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })?);
    }

    let signaler: TaskHandle<Result<(), Fail>> = {
        let lock = lock.clone();
        let condvar = condvar.clone();
        let go = go.clone();
        runtime.spawn(async move {
            // Give the waiters a moment to park.
            spindle::sleep_for(Duration::from_millis(50)).await?;
            let guard = lock.lock(Deadline::never()).await?;
            go.store(true, Ordering::SeqCst);
            drop(guard);
            condvar.notify_all();
            Ok(())
        })?
    };

    for handle in handles {
        handle.wait()??;
    }
    signaler.wait()??;
    spindle::ensure_eq!(woken.load(Ordering::SeqCst), WAITERS);

    runtime.shutdown();
    Ok(())
}
