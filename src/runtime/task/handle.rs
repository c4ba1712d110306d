// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    deadline::Deadline,
    fail::Fail,
    processor::worker,
    sleep::{
        arm_wake_timer,
        cancelled_fail,
        current_task_or_fail,
        Park,
        ParkResult,
    },
    task::{
        CancellationReason,
        TaskContext,
        TaskId,
        TaskState,
    },
};
use ::std::{
    any::Any,
    panic::resume_unwind,
    sync::{
        Arc,
        Mutex,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Slot the task's wrapper future parks the user result in. Filled exactly once, before the task's terminal
/// transition.
pub(crate) struct ResultCell<R> {
    value: Mutex<Option<R>>,
}

/// Owning handle of one task.
///
/// Dropping a live task's handle abandons it: the task is cancelled with reason
/// [`CancellationReason::Abandoned`] and, when the drop happens off-task, the drop blocks until the task is gone.
/// Call [`Self::detach`] to let the task run free instead.
pub struct TaskHandle<R> {
    ctx: Arc<TaskContext>,
    cell: Arc<ResultCell<R>>,
    /// Raised once ownership moved elsewhere. A defused handle does nothing on drop.
    defused: bool,
}

/// Cloneable handle of one task, for results that many waiters read. Unlike [`TaskHandle`], dropping shared
/// handles never cancels the task.
pub struct SharedTaskHandle<R: Clone> {
    ctx: Arc<TaskContext>,
    cell: Arc<ResultCell<R>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl<R> ResultCell<R> {
    pub(crate) fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    pub(crate) fn set(&self, value: R) {
        *self.value.lock().unwrap() = Some(value);
    }

    fn take(&self) -> Option<R> {
        self.value.lock().unwrap().take()
    }
}

impl<R: Clone> ResultCell<R> {
    fn clone_value(&self) -> Option<R> {
        self.value.lock().unwrap().clone()
    }
}

impl<R> TaskHandle<R> {
    pub(crate) fn new(ctx: Arc<TaskContext>, cell: Arc<ResultCell<R>>) -> Self {
        Self {
            ctx,
            cell,
            defused: false,
        }
    }

    pub fn id(&self) -> TaskId {
        self.ctx.id()
    }

    pub fn task_state(&self) -> TaskState {
        self.ctx.task_state()
    }

    /// Asks the task to cancel with reason [`CancellationReason::UserRequest`]. Returns whether this request was
    /// the first one.
    pub fn request_cancel(&self) -> bool {
        self.ctx.request_cancel(CancellationReason::UserRequest)
    }

    /// Arms a deadline past which the task is cancelled with reason [`CancellationReason::Deadline`].
    pub fn set_cancel_deadline(&self, deadline: Deadline) {
        self.ctx.set_cancel_deadline(deadline);
    }

    /// Why the task is being cancelled, if a cancellation has been requested.
    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        self.ctx.cancel_reason()
    }

    /// Whether the task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.ctx.state().is_terminal()
    }

    /// Releases the task to run to completion on its own. Dropping what remains of the handle does not cancel it.
    pub fn detach(mut self) {
        self.ctx.detach();
        self.defused = true;
    }

    /// Converts this handle into a cloneable one.
    pub fn into_shared(mut self) -> SharedTaskHandle<R>
    where
        R: Clone,
    {
        self.defused = true;
        SharedTaskHandle {
            ctx: self.ctx.clone(),
            cell: self.cell.clone(),
        }
    }

    /// Blocks the calling thread until the task finishes, then returns its result. Must not be called from a
    /// task; tasks use [`Self::join`].
    pub fn wait(&self) -> Result<R, Fail> {
        self.wait_until(Deadline::never())
    }

    /// Bounded [`Self::wait`]. Fails with `ETIMEDOUT` when the task outlives the timeout.
    pub fn wait_for(&self, timeout: Duration) -> Result<R, Fail> {
        self.wait_until(Deadline::from_duration(timeout))
    }

    /// Bounded [`Self::wait`]. Fails with `ETIMEDOUT` when the task outlives the deadline.
    pub fn wait_until(&self, deadline: Deadline) -> Result<R, Fail> {
        wait_target(&self.ctx, deadline)?;
        self.collect()
    }

    /// Suspends the calling task until this task finishes, then returns its result.
    pub async fn join(&self) -> Result<R, Fail> {
        self.join_until(Deadline::never()).await
    }

    /// Bounded [`Self::join`]. Fails with `ETIMEDOUT` when the task outlives the deadline.
    pub async fn join_until(&self, deadline: Deadline) -> Result<R, Fail> {
        join_target(&self.ctx, deadline).await?;
        self.collect()
    }

    /// Turns the terminal state into the caller-visible outcome. A panic inside the task resumes unwinding here.
    fn collect(&self) -> Result<R, Fail> {
        let payload: Option<Box<dyn Any + Send>> = self.ctx.panic_slot.lock().unwrap().take();
        if let Some(payload) = payload {
            resume_unwind(payload);
        }
        match self.ctx.task_state() {
            TaskState::Cancelled => Err(cancelled_error(&self.ctx)),
            TaskState::Completed => match self.cell.take() {
                Some(value) => Ok(value),
                None => {
                    let cause: String = format!("result of task {} was already taken", self.ctx.id());
                    Err(Fail::new(libc::EINVAL, &cause))
                },
            },
            state => unreachable!("finished task {} reported state {:?}", self.ctx.id(), state),
        }
    }
}

impl<R: Clone> SharedTaskHandle<R> {
    pub fn id(&self) -> TaskId {
        self.ctx.id()
    }

    pub fn task_state(&self) -> TaskState {
        self.ctx.task_state()
    }

    /// Asks the task to cancel with reason [`CancellationReason::UserRequest`].
    pub fn request_cancel(&self) -> bool {
        self.ctx.request_cancel(CancellationReason::UserRequest)
    }

    /// Why the task is being cancelled, if a cancellation has been requested.
    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        self.ctx.cancel_reason()
    }

    /// Whether the task reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.ctx.state().is_terminal()
    }

    /// Blocks the calling thread until the task finishes, then returns a clone of its result. Must not be called
    /// from a task; tasks use [`Self::join`].
    pub fn wait(&self) -> Result<R, Fail> {
        self.wait_until(Deadline::never())
    }

    /// Bounded [`Self::wait`]. Fails with `ETIMEDOUT` when the task outlives the timeout.
    pub fn wait_for(&self, timeout: Duration) -> Result<R, Fail> {
        self.wait_until(Deadline::from_duration(timeout))
    }

    /// Bounded [`Self::wait`]. Fails with `ETIMEDOUT` when the task outlives the deadline.
    pub fn wait_until(&self, deadline: Deadline) -> Result<R, Fail> {
        wait_target(&self.ctx, deadline)?;
        self.collect_shared()
    }

    /// Suspends the calling task until this task finishes, then returns a clone of its result.
    pub async fn join(&self) -> Result<R, Fail> {
        self.join_until(Deadline::never()).await
    }

    /// Bounded [`Self::join`]. Fails with `ETIMEDOUT` when the task outlives the deadline.
    pub async fn join_until(&self, deadline: Deadline) -> Result<R, Fail> {
        join_target(&self.ctx, deadline).await?;
        self.collect_shared()
    }

    /// Like [`TaskHandle::collect`], but leaves the result and any panic in place so every clone sees them. A panic
    /// is rethrown by message, since its payload cannot be cloned.
    fn collect_shared(&self) -> Result<R, Fail> {
        let message: Option<String> = {
            let slot = self.ctx.panic_slot.lock().unwrap();
            slot.as_ref().map(|payload| panic_message(payload.as_ref()))
        };
        if let Some(message) = message {
            panic!("{}", message);
        }
        match self.ctx.task_state() {
            TaskState::Cancelled => Err(cancelled_error(&self.ctx)),
            TaskState::Completed => match self.cell.clone_value() {
                Some(value) => Ok(value),
                None => unreachable!("completed task {} left no result", self.ctx.id()),
            },
            state => unreachable!("finished task {} reported state {:?}", self.ctx.id(), state),
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Blocks the calling thread until `target` finishes or the deadline passes.
fn wait_target(target: &TaskContext, deadline: Deadline) -> Result<(), Fail> {
    if worker::try_current_task().is_some() {
        panic!("wait() must not be called from inside a task; join() suspends instead of blocking a worker");
    }

    let mut finished = target.join_sync.finished.lock().unwrap();
    while !*finished {
        match deadline.time_left() {
            None => finished = target.join_sync.cond.wait(finished).unwrap(),
            Some(left) if left.is_zero() => {
                let cause: String = format!("wait: task {} still live past the deadline", target.id());
                return Err(Fail::timed_out(&cause));
            },
            Some(left) => {
                let (guard, _) = target.join_sync.cond.wait_timeout(finished, left).unwrap();
                finished = guard;
            },
        }
    }
    Ok(())
}

/// Suspends the calling task until `target` finishes or the deadline passes.
async fn join_target(target: &Arc<TaskContext>, deadline: Deadline) -> Result<(), Fail> {
    let caller: Arc<TaskContext> = current_task_or_fail("join")?;
    loop {
        if caller.should_cancel() {
            return Err(cancelled_fail(&caller, "join"));
        }
        let park: Park = Park::new(caller.clone());
        {
            let mut joiners = target.joiners.lock().unwrap();
            // Terminal check under the joiners lock: the terminal transition happens before the final sweep of
            // this list, so either this check sees it or the sweep finds the waiter.
            if target.state().is_terminal() {
                return Ok(());
            }
            if deadline.is_reached() {
                let cause: String = format!("join: task {} still live past the deadline", target.id());
                return Err(Fail::timed_out(&cause));
            }
            joiners.append(caller.clone(), park.token());
        }
        arm_wake_timer(&caller, deadline, park.token());
        let _: ParkResult = park.await;
        target.joiners.lock().unwrap().remove(caller.id());
    }
}

fn cancelled_error(ctx: &TaskContext) -> Fail {
    let reason: &str = match ctx.cancel_reason() {
        Some(reason) => reason.as_str(),
        None => "unknown",
    };
    let cause: String = format!("task {} was cancelled ({})", ctx.id(), reason);
    Fail::cancelled(&cause)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "task panicked".to_string()
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Default Trait Implementation for Result Cells
impl<R> Default for ResultCell<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Clone Trait Implementation for Shared Task Handles
impl<R: Clone> Clone for SharedTaskHandle<R> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            cell: self.cell.clone(),
        }
    }
}

/// Drop Trait Implementation for Task Handles
impl<R> Drop for TaskHandle<R> {
    fn drop(&mut self) {
        if self.defused || self.ctx.is_detached() || self.ctx.state().is_terminal() {
            return;
        }
        // Abandoned while live: cancel, and wait off-task so the task's resources are gone when drop returns.
        self.ctx.request_cancel(CancellationReason::Abandoned);
        if worker::try_current_task().is_some() {
            // A task cannot block its worker on another task's exit.
            warn!("drop(): abandoning task {} without waiting for it", self.ctx.id());
            return;
        }
        let mut finished = self.ctx.join_sync.finished.lock().unwrap();
        while !*finished {
            finished = self.ctx.join_sync.cond.wait(finished).unwrap();
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        panic_message,
        ResultCell,
        TaskHandle,
    };
    use crate::runtime::task::{
        local::LocalStorage,
        Importance,
        TaskContext,
        TaskId,
    };
    use ::anyhow::Result;
    use ::std::sync::{
        Arc,
        Weak,
    };

    fn orphan_handle() -> TaskHandle<u32> {
        let ctx: Arc<TaskContext> = Arc::new(TaskContext::new(
            TaskId::from_raw(11),
            Importance::Normal,
            0,
            Weak::new(),
            LocalStorage::default(),
        ));
        TaskHandle::new(ctx, Arc::new(ResultCell::new()))
    }

    #[test]
    fn test_handle_result_cell_take_is_once() -> Result<()> {
        let cell: ResultCell<u32> = ResultCell::new();
        cell.set(99);
        crate::ensure_eq!(cell.clone_value(), Some(99));
        crate::ensure_eq!(cell.take(), Some(99));
        crate::ensure_eq!(cell.take(), None);

        Ok(())
    }

    #[test]
    fn test_handle_panic_message_extraction() -> Result<()> {
        let as_str: Box<dyn std::any::Any + Send> = Box::new("boom");
        let as_string: Box<dyn std::any::Any + Send> = Box::new(String::from("kaboom"));
        let opaque: Box<dyn std::any::Any + Send> = Box::new(17u8);

        crate::ensure_eq!(panic_message(as_str.as_ref()), "boom");
        crate::ensure_eq!(panic_message(as_string.as_ref()), "kaboom");
        crate::ensure_eq!(panic_message(opaque.as_ref()), "task panicked");

        Ok(())
    }

    #[test]
    fn test_handle_detach_defuses_abandon() -> Result<()> {
        let handle: TaskHandle<u32> = orphan_handle();
        let ctx: Arc<TaskContext> = handle.ctx.clone();

        handle.detach();
        // No Abandoned cancellation was requested on drop.
        crate::ensure_eq!(ctx.cancel_reason(), None);

        Ok(())
    }

    #[test]
    fn test_handle_into_shared_defuses_abandon() -> Result<()> {
        let handle: TaskHandle<u32> = orphan_handle();
        let ctx: Arc<TaskContext> = handle.ctx.clone();

        let shared = handle.into_shared();
        let second = shared.clone();
        drop(shared);
        drop(second);
        crate::ensure_eq!(ctx.cancel_reason(), None);

        Ok(())
    }
}
