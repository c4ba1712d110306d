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

/// A task-aware counting semaphore. Clones share the same units.
///
/// Connection pools use one of these to bound checked-out resources, often with a second one bounding concurrent
/// creation of new resources.
#[derive(Clone)]
pub struct Semaphore {
    inner: Arc<SemaphoreInner>,
}

struct SemaphoreInner {
    state: StdMutex<SemaphoreState>,
    capacity: usize,
}

struct SemaphoreState {
    available: usize,
    waiters: WaitList,
}

/// A scoped semaphore acquisition. Holds a fixed number of units; gives them back on drop unless released early.
pub struct SemaphoreLock {
    sem: Option<Semaphore>,
    count: usize,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Semaphore {
    /// Creates a semaphore with this many units, all available.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(SemaphoreInner {
                state: StdMutex::new(SemaphoreState {
                    available: capacity,
                    waiters: WaitList::new(),
                }),
                capacity,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Units not currently held. Advisory: it may change before the caller acts on it.
    pub fn available(&self) -> usize {
        self.inner.state.lock().unwrap().available
    }

    /// Takes one unit, suspending the calling task while none is available. Fails with `ETIMEDOUT` once the
    /// deadline passes and with `ECANCELED` when the task is cancelled while waiting.
    pub async fn acquire(&self, deadline: Deadline) -> Result<SemaphoreLock, Fail> {
        SemaphoreLock::acquire(self, 1, deadline).await
    }

    /// Takes `count` units as a single grant, suspending the calling task while fewer are available. Asking for
    /// more units than the semaphore holds at full capacity fails with `EINVAL` instead of waiting forever.
    pub async fn acquire_count(&self, count: usize, deadline: Deadline) -> Result<(), Fail> {
        if count > self.inner.capacity {
            let cause: String = format!(
                "acquire_count: {} units requested from a semaphore of capacity {}",
                count, self.inner.capacity
            );
            return Err(Fail::new(libc::EINVAL, &cause));
        }
        let ctx: Arc<TaskContext> = current_task_or_fail("acquire_count")?;
        // After losing a race for released units, the waiter goes back to the front of the line.
        let mut keep_place: bool = false;
        loop {
            if ctx.should_cancel() {
                return Err(cancelled_fail(&ctx, "acquire_count"));
            }
            let park: Park = Park::new(ctx.clone());
            {
                let mut state = self.inner.state.lock().unwrap();
                if state.available >= count {
                    state.available -= count;
                    return Ok(());
                }
                if deadline.is_reached() {
                    return Err(Fail::timed_out("acquire_count: not enough semaphore units before the deadline"));
                }
                if keep_place {
                    state.waiters.append_front(ctx.clone(), park.token());
                } else {
                    state.waiters.append(ctx.clone(), park.token());
                }
            }
            arm_wake_timer(&ctx, deadline, park.token());
            let _: ParkResult = park.await;
            self.inner.state.lock().unwrap().waiters.remove(ctx.id());
            keep_place = true;
        }
    }

    /// Takes one unit only if one is available right now. Never suspends; usable from any thread.
    pub fn try_acquire(&self) -> Option<SemaphoreLock> {
        if self.try_acquire_count(1) {
            Some(SemaphoreLock {
                sem: Some(self.clone()),
                count: 1,
            })
        } else {
            None
        }
    }

    /// Takes `count` units only if all of them are available right now. All or nothing; never suspends.
    pub fn try_acquire_count(&self, count: usize) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        if state.available < count {
            return false;
        }
        state.available -= count;
        true
    }

    /// Gives back one unit taken with [`Self::acquire_count`] or [`Self::try_acquire_count`].
    pub fn release(&self) -> Result<(), Fail> {
        self.release_count(1)
    }

    /// Gives back `count` units. Returning more units than were taken is a contract violation: it asserts in
    /// debug builds and fails with `EPERM` in release builds, leaving the count untouched.
    pub fn release_count(&self, count: usize) -> Result<(), Fail> {
        let mut state = self.inner.state.lock().unwrap();
        debug_assert!(
            count <= self.inner.capacity - state.available,
            "release_count: more units returned than taken"
        );
        if count > self.inner.capacity - state.available {
            let cause: String = format!(
                "release_count: returning {} units would exceed the capacity of {}",
                count, self.inner.capacity
            );
            error!("release_count(): {}", &cause);
            return Err(Fail::new(libc::EPERM, &cause));
        }
        state.available += count;
        // One wakeup per returned unit. A waiter needing more than what is there re-queues at the front.
        let mut wakeups: usize = count;
        while wakeups > 0 && state.waiters.wake_one(WakeSource::WaitList) {
            wakeups -= 1;
        }
        Ok(())
    }
}

impl SemaphoreLock {
    /// Takes `count` units as one scoped grant. Same waiting behavior as [`Semaphore::acquire_count`].
    pub async fn acquire(sem: &Semaphore, count: usize, deadline: Deadline) -> Result<SemaphoreLock, Fail> {
        sem.acquire_count(count, deadline).await?;
        Ok(SemaphoreLock {
            sem: Some(sem.clone()),
            count,
        })
    }

    /// How many units this lock holds.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Whether this lock still holds its units.
    pub fn owns(&self) -> bool {
        self.sem.is_some()
    }

    /// Gives the units back now instead of at drop.
    pub fn release(mut self) {
        self.release_units();
    }

    fn release_units(&mut self) {
        if let Some(sem) = self.sem.take() {
            // Units held by this lock were taken from the same semaphore, so they can never overflow it.
            let _ = sem.release_count(self.count);
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Drop Trait Implementation for Semaphore Locks
impl Drop for SemaphoreLock {
    fn drop(&mut self) {
        self.release_units();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
