// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    deadline::Deadline,
    fail::Fail,
    sleep::{
        arm_wake_timer,
        cancelled_fail,
        current_task_or_fail,
        Park,
        ParkResult,
    },
    task::{
        state::WakeSource,
        TaskContext,
    },
    wait_list::WaitList,
};
use ::std::sync::{
    Arc,
    Mutex as StdMutex,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A task-aware mutual exclusion lock. Carries no data of its own; it guards whatever the caller associates with
/// it. Clones share the same lock.
///
/// Fairness is relaxed: unlock wakes the longest-waiting task, but a concurrently arriving [`Self::try_lock`] may
/// still win the race. The woken task re-queues behind nobody and tries again.
#[derive(Clone)]
pub struct Mutex {
    inner: Arc<MutexInner>,
}

struct MutexInner {
    state: StdMutex<MutexState>,
}

struct MutexState {
    locked: bool,
    waiters: WaitList,
}

/// Proof of holding a [`Mutex`]. Unlocks on drop.
pub struct MutexGuard {
    mutex: Mutex,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Mutex {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MutexInner {
                state: StdMutex::new(MutexState {
                    locked: false,
                    waiters: WaitList::new(),
                }),
            }),
        }
    }

    /// Acquires the lock, suspending the calling task while somebody else holds it. Fails with `ETIMEDOUT` once
    /// the deadline passes and with `ECANCELED` when the task is cancelled while waiting.
    pub async fn lock(&self, deadline: Deadline) -> Result<MutexGuard, Fail> {
        let ctx: Arc<TaskContext> = current_task_or_fail("lock")?;
        loop {
            if ctx.should_cancel() {
                return Err(cancelled_fail(&ctx, "lock"));
            }
            let park: Park = Park::new(ctx.clone());
            {
                let mut state = self.inner.state.lock().unwrap();
                if !state.locked {
                    state.locked = true;
                    return Ok(MutexGuard { mutex: self.clone() });
                }
                if deadline.is_reached() {
                    return Err(Fail::timed_out("lock: mutex still held past the deadline"));
                }
                state.waiters.append(ctx.clone(), park.token());
            }
            arm_wake_timer(&ctx, deadline, park.token());
            let _: ParkResult = park.await;
            self.inner.state.lock().unwrap().waiters.remove(ctx.id());
        }
    }

    /// Acquires the lock only if nobody holds it. Never suspends; usable from any thread.
    pub fn try_lock(&self) -> Option<MutexGuard> {
        let mut state = self.inner.state.lock().unwrap();
        if state.locked {
            return None;
        }
        state.locked = true;
        Some(MutexGuard { mutex: self.clone() })
    }

    fn unlock(&self) {
        let mut state = self.inner.state.lock().unwrap();
        debug_assert!(state.locked);
        state.locked = false;
        state.waiters.wake_one(WakeSource::WaitList);
    }
}

impl MutexGuard {
    /// The mutex this guard holds.
    pub fn source(&self) -> &Mutex {
        &self.mutex
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Default Trait Implementation for Mutexes
impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop Trait Implementation for Mutex Guards
impl Drop for MutexGuard {
    fn drop(&mut self) {
        self.mutex.unlock();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
