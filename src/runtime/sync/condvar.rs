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
        CancellationBlocker,
        Park,
        ParkResult,
    },
    sync::mutex::{
        Mutex,
        MutexGuard,
    },
    task::{
        state::WakeSource,
        TaskContext,
    },
    wait_list::{
        WaitList,
        WakeBatch,
    },
};
use ::std::{
    sync::{
        Arc,
        Mutex as StdMutex,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Outcome of a bounded condition wait.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CvStatus {
    /// The wait ended because the condition was signaled (for the predicate forms, because the predicate held).
    Signaled,
    /// The deadline passed first.
    TimedOut,
}

/// A task-aware condition variable with monitor semantics: waiting atomically releases a [`Mutex`] and suspends,
/// and the mutex is held again by the time the wait returns. Clones share the same wait list.
#[derive(Clone)]
pub struct Condvar {
    inner: Arc<CondvarInner>,
}

struct CondvarInner {
    waiters: StdMutex<WaitList>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Condvar {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CondvarInner {
                waiters: StdMutex::new(WaitList::new()),
            }),
        }
    }

    /// Releases the mutex behind `guard`, suspends until notified, then reacquires it. Spurious resumes are
    /// possible, so callers re-check their predicate in a loop or use [`Self::wait_until`].
    ///
    /// On `ECANCELED` the mutex is no longer held.
    pub async fn wait(&self, guard: MutexGuard) -> Result<MutexGuard, Fail> {
        let (guard, _status) = self.wait_inner(guard, Deadline::never()).await?;
        Ok(guard)
    }

    /// Waits until `condition` returns true or `timeout` elapses. See [`Self::wait_until`].
    pub async fn wait_for<F: FnMut() -> bool>(
        &self,
        guard: MutexGuard,
        timeout: Duration,
        condition: F,
    ) -> Result<(MutexGuard, CvStatus), Fail> {
        self.wait_until(guard, Deadline::from_duration(timeout), condition).await
    }

    /// Waits until `condition` returns true or the deadline passes, whichever comes first. The condition is
    /// evaluated with the mutex held, including one final time after a timeout, so a signal that lands together
    /// with the deadline still counts as [`CvStatus::Signaled`].
    ///
    /// On `ECANCELED` the mutex is no longer held.
    pub async fn wait_until<F: FnMut() -> bool>(
        &self,
        guard: MutexGuard,
        deadline: Deadline,
        mut condition: F,
    ) -> Result<(MutexGuard, CvStatus), Fail> {
        let mut guard: MutexGuard = guard;
        loop {
            if condition() {
                return Ok((guard, CvStatus::Signaled));
            }
            let (reacquired, status) = self.wait_inner(guard, deadline).await?;
            guard = reacquired;
            if status == CvStatus::TimedOut {
                let status: CvStatus = if condition() { CvStatus::Signaled } else { CvStatus::TimedOut };
                return Ok((guard, status));
            }
        }
    }

    /// Boolean form of [`Self::wait_until`]: waits until `condition` returns true or the deadline passes, and
    /// reports with a flag whether the condition held by the end of the wait.
    pub async fn wait_while<F: FnMut() -> bool>(
        &self,
        guard: MutexGuard,
        deadline: Deadline,
        condition: F,
    ) -> Result<(MutexGuard, bool), Fail> {
        let (guard, status) = self.wait_until(guard, deadline, condition).await?;
        Ok((guard, status == CvStatus::Signaled))
    }

    /// One release-suspend-reacquire round. The wait list entry is added before the mutex is released, so a
    /// notifier that observes the unlocked mutex always finds this task in the list.
    async fn wait_inner(&self, guard: MutexGuard, deadline: Deadline) -> Result<(MutexGuard, CvStatus), Fail> {
        if deadline.is_reached() {
            return Ok((guard, CvStatus::TimedOut));
        }
        let ctx: Arc<TaskContext> = current_task_or_fail("wait")?;
        let mutex: Mutex = guard.source().clone();
        let park: Park = Park::new(ctx.clone());
        {
            let mut waiters = self.inner.waiters.lock().unwrap();
            waiters.append(ctx.clone(), park.token());
            drop(guard);
        }
        arm_wake_timer(&ctx, deadline, park.token());
        let _: ParkResult = park.await;
        self.inner.waiters.lock().unwrap().remove(ctx.id());
        if ctx.should_cancel() {
            return Err(cancelled_fail(&ctx, "wait"));
        }
        let status: CvStatus = if deadline.is_reachable() && deadline.is_reached() {
            CvStatus::TimedOut
        } else {
            CvStatus::Signaled
        };
        // Reacquisition must not be interrupted: a caller seeing Ok relies on holding the mutex again.
        let _blocker: CancellationBlocker = CancellationBlocker::new();
        let guard: MutexGuard = mutex.lock(Deadline::never()).await?;
        Ok((guard, status))
    }

    /// Wakes the longest-waiting task, if any.
    pub fn notify_one(&self) {
        self.inner.waiters.lock().unwrap().wake_one(WakeSource::WaitList);
    }

    /// Wakes every waiting task. Wakeups are issued in bounded batches outside the internal lock, so a large wait
    /// list does not stall concurrent waiters for its whole length.
    pub fn notify_all(&self) {
        let mut batch: WakeBatch = WakeBatch::new();
        loop {
            let more: bool = self.inner.waiters.lock().unwrap().fill_batch(&mut batch);
            batch.wake_all(WakeSource::WaitList);
            if !more {
                break;
            }
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Default Trait Implementation for Condition Variables
impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::Condvar;
    use crate::runtime::task::{
        local::LocalStorage,
        state::{
            SleepToken,
            TaskState,
        },
        Importance,
        TaskContext,
        TaskId,
    };
    use ::anyhow::Result;
    use ::std::sync::{
        Arc,
        Weak,
    };

    fn parked_task(id: u64) -> (Arc<TaskContext>, SleepToken) {
        let ctx: Arc<TaskContext> = Arc::new(TaskContext::new(
            TaskId::from_raw(id),
            Importance::Normal,
            0,
            Weak::new(),
            LocalStorage::default(),
        ));
        ctx.state().enqueue_new();
        ctx.state().begin_run();
        let token: SleepToken = ctx.state().prepare_sleep();
        ctx.state().commit_sleep();
        (ctx, token)
    }

    #[test]
    fn test_condvar_notify_without_waiters_is_inert() -> Result<()> {
        let cv: Condvar = Condvar::new();
        cv.notify_one();
        cv.notify_all();
        crate::ensure_eq!(cv.inner.waiters.lock().unwrap().is_empty(), true);
        Ok(())
    }

    #[test]
    fn test_condvar_notify_one_wakes_in_order() -> Result<()> {
        let cv: Condvar = Condvar::new();
        let (first, first_token) = parked_task(1);
        let (second, second_token) = parked_task(2);
        {
            let mut waiters = cv.inner.waiters.lock().unwrap();
            waiters.append(first.clone(), first_token);
            waiters.append(second.clone(), second_token);
        }

        cv.notify_one();
        crate::ensure_eq!(first.task_state(), TaskState::Queued);
        crate::ensure_eq!(second.task_state(), TaskState::Suspended);

        cv.notify_all();
        crate::ensure_eq!(second.task_state(), TaskState::Queued);
        crate::ensure_eq!(cv.inner.waiters.lock().unwrap().is_empty(), true);

        Ok(())
    }
}
