// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::task::{
    state::{
        SleepToken,
        WakeOutcome,
        WakeSource,
    },
    TaskContext,
    TaskId,
};
use ::arrayvec::ArrayVec;
use ::std::{
    collections::VecDeque,
    sync::Arc,
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// How many waiters a wake batch carries out of the owning lock at a time.
pub const WAKE_BATCH_SIZE: usize = 32;

//======================================================================================================================
// Structures
//======================================================================================================================

/// One parked task, remembered with the token of the sleep cycle it parked under.
pub struct Waiter {
    task: Arc<TaskContext>,
    token: SleepToken,
}

/// FIFO list of tasks parked on one synchronization object. The list itself is not thread-safe; the owning primitive
/// guards it with its own lock.
#[derive(Default)]
pub struct WaitList {
    waiters: VecDeque<Waiter>,
}

/// A bounded set of waiters carried out of the owning lock, to be woken after it is released. Waking a whole list
/// happens in batches of [`WAKE_BATCH_SIZE`], re-acquiring the lock between batches.
pub struct WakeBatch {
    waiters: ArrayVec<Waiter, WAKE_BATCH_SIZE>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Waiter {
    /// Delivers the wakeup this waiter parked for. Bounced deliveries report themselves in the outcome.
    pub(crate) fn wake(self, source: WakeSource) -> WakeOutcome {
        self.task.wake(self.token, source)
    }

    pub(crate) fn task_id(&self) -> TaskId {
        self.task.id()
    }
}

impl WaitList {
    pub fn new() -> Self {
        Self {
            waiters: VecDeque::new(),
        }
    }

    /// Parks a task at the back of the list.
    pub fn append(&mut self, task: Arc<TaskContext>, token: SleepToken) {
        self.waiters.push_back(Waiter { task, token });
    }

    /// Parks a task at the front of the list, ahead of everybody already waiting.
    pub fn append_front(&mut self, task: Arc<TaskContext>, token: SleepToken) {
        self.waiters.push_front(Waiter { task, token });
    }

    /// Removes a task from the list, if present. Safe to call again after the task was already removed or woken.
    pub fn remove(&mut self, id: TaskId) {
        self.waiters.retain(|waiter| waiter.task_id() != id);
    }

    /// Wakes the first waiter whose delivery lands. Waiters whose sleep cycle was already consumed, or whose task
    /// already finished, are discarded along the way so a wakeup is never swallowed by a dead entry. Returns whether
    /// a delivery landed.
    ///
    /// Deliveries happen while the caller still holds the lock guarding this list; the outcome has to be observed
    /// under the lock, otherwise a bounced delivery would strand the remaining waiters.
    pub fn wake_one(&mut self, source: WakeSource) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.wake(source) {
                WakeOutcome::Scheduled | WakeOutcome::Recorded => return true,
                WakeOutcome::Stale | WakeOutcome::Terminal => continue,
            }
        }
        false
    }

    /// Takes every waiter out of the list. The caller wakes them after releasing its lock.
    pub fn take_all(self) -> VecDeque<Waiter> {
        self.waiters
    }

    /// Moves up to one batch worth of waiters into `batch`. Returns whether the list still holds more.
    pub fn fill_batch(&mut self, batch: &mut WakeBatch) -> bool {
        while batch.has_room() {
            match self.waiters.pop_front() {
                Some(waiter) => batch.push(waiter),
                None => return false,
            }
        }
        !self.waiters.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }
}

impl WakeBatch {
    pub fn new() -> Self {
        Self {
            waiters: ArrayVec::new(),
        }
    }

    fn has_room(&self) -> bool {
        !self.waiters.is_full()
    }

    fn push(&mut self, waiter: Waiter) {
        self.waiters.push(waiter);
    }

    /// Delivers wakeups to everything in the batch. Bounced deliveries are fine here: a woken-everybody pass leaves
    /// nobody behind to strand.
    pub fn wake_all(&mut self, source: WakeSource) {
        for waiter in self.waiters.drain(..) {
            let _: WakeOutcome = waiter.wake(source);
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Default Trait Implementation for Wake Batches
impl Default for WakeBatch {
    fn default() -> Self {
        Self::new()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        WaitList,
        WakeBatch,
    };
    use crate::runtime::task::{
        local::LocalStorage,
        state::{
            SleepToken,
            WakeSource,
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

    /// Builds a parked task the way a worker would leave it, returning the context and its sleep token.
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
    fn test_wait_list_wake_one_is_fifo() -> Result<()> {
        let (first, first_token) = parked_task(1);
        let (second, second_token) = parked_task(2);

        let mut list: WaitList = WaitList::new();
        list.append(first.clone(), first_token);
        list.append(second.clone(), second_token);

        crate::ensure_eq!(list.wake_one(WakeSource::WaitList), true);
        crate::ensure_eq!(list.len(), 1);

        // The first task left the sleeping state; the second did not.
        crate::ensure_eq!(first.state().is_terminal(), false);
        crate::ensure_eq!(
            first.task_state(),
            crate::runtime::task::state::TaskState::Queued
        );
        crate::ensure_eq!(
            second.task_state(),
            crate::runtime::task::state::TaskState::Suspended
        );

        Ok(())
    }

    #[test]
    fn test_wait_list_wake_one_skips_stale_entries() -> Result<()> {
        let (first, first_token) = parked_task(1);
        let (second, second_token) = parked_task(2);

        let mut list: WaitList = WaitList::new();
        list.append(first.clone(), first_token);
        list.append(second.clone(), second_token);

        // The first task is woken by something else (say, its deadline timer) and consumes its cycle before this
        // list gets to it. Its stale entry must not swallow the wakeup.
        first.wake(first_token, WakeSource::Timer);
        first.state().begin_run();
        first.state().finish_sleep(first_token);

        crate::ensure_eq!(list.wake_one(WakeSource::WaitList), true);
        crate::ensure_eq!(
            second.task_state(),
            crate::runtime::task::state::TaskState::Queued
        );
        crate::ensure_eq!(list.is_empty(), true);

        Ok(())
    }

    #[test]
    fn test_wait_list_remove_is_idempotent() -> Result<()> {
        let (first, first_token) = parked_task(1);

        let mut list: WaitList = WaitList::new();
        list.append(first.clone(), first_token);
        list.remove(first.id());
        list.remove(first.id());

        crate::ensure_eq!(list.is_empty(), true);
        crate::ensure_eq!(list.wake_one(WakeSource::WaitList), false);

        Ok(())
    }

    #[test]
    fn test_wait_list_batched_wakeup_drains_everything() -> Result<()> {
        let mut list: WaitList = WaitList::new();
        let mut parked: Vec<Arc<TaskContext>> = Vec::new();
        for id in 1..=(super::WAKE_BATCH_SIZE as u64 + 5) {
            let (ctx, token) = parked_task(id);
            list.append(ctx.clone(), token);
            parked.push(ctx);
        }

        let mut more: bool = true;
        while more {
            let mut batch: WakeBatch = WakeBatch::new();
            more = list.fill_batch(&mut batch);
            batch.wake_all(WakeSource::WaitList);
        }

        crate::ensure_eq!(list.is_empty(), true);
        for ctx in parked {
            crate::ensure_eq!(
                ctx.task_state(),
                crate::runtime::task::state::TaskState::Queued
            );
        }

        Ok(())
    }
}
