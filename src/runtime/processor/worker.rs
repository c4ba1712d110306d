// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    coro::TaskFuture,
    processor::{
        ProcessorInner,
        RunItem,
    },
    task::{
        state::CommitOutcome,
        CancellationReason,
        Importance,
        TaskContext,
    },
};
use ::futures::task::waker_ref;
use ::std::{
    cell::RefCell,
    panic::{
        catch_unwind,
        AssertUnwindSafe,
    },
    sync::Arc,
    task::{
        Context,
        Poll,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Thread Local Storage
//======================================================================================================================

thread_local! {
    /// The task a worker thread is currently polling.
    static CURRENT_TASK: RefCell<Option<Arc<TaskContext>>> = RefCell::new(None);
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scope during which [`CURRENT_TASK`] points at a task. Cleared on drop, so a panicking poll does not leave the
/// thread-local dangling.
struct CurrentTaskScope;

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl CurrentTaskScope {
    fn enter(task: Arc<TaskContext>) -> Self {
        CURRENT_TASK.with(|current| {
            let previous: Option<Arc<TaskContext>> = current.borrow_mut().replace(task);
            debug_assert!(previous.is_none(), "workers do not nest tasks");
        });
        Self
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// The task executing on the calling thread, if the caller is inside a task.
pub(crate) fn try_current_task() -> Option<Arc<TaskContext>> {
    CURRENT_TASK.with(|current| current.borrow().clone())
}

/// Body of one worker thread. Runs until a stop item arrives or the run queue is torn down.
pub(super) fn worker_main(processor: Arc<ProcessorInner>) {
    loop {
        match processor.recv_item() {
            Some(RunItem::Task(task, queued_at)) => run_one(&processor, task, queued_at),
            Some(RunItem::Stop) | None => break,
        }
    }
    trace!("worker_main(): worker of processor {} exiting", processor.name());
}

/// Runs one dequeued task through a single poll.
fn run_one(processor: &Arc<ProcessorInner>, task: Arc<TaskContext>, queued_at: Instant) {
    processor.note_dequeued();
    let waited: Duration = queued_at.elapsed();
    processor.stats().record_queue_wait(waited);

    // Queue-wait shedding. Only Normal tasks that never ran are eligible.
    if !task.has_started() && task.importance() == Importance::Normal {
        if let Some(limit) = processor.queue_wait_limit() {
            if waited >= limit {
                task.request_cancel(CancellationReason::Overload);
            }
        }
    }

    // A task shed under overload or caught by shutdown before its first run goes straight to terminal, without
    // polling. Any other cancellation reason still grants the first run, so the task observes it cooperatively.
    if !task.has_started() {
        if let Some(reason) = task.cancel_reason() {
            let eager: bool = matches!(reason, CancellationReason::Overload | CancellationReason::Shutdown);
            if eager && task.state().cancel_queued() {
                debug!("run_one(): task {} cancelled before first run ({})", task.id(), reason.as_str());
                if reason == CancellationReason::Overload {
                    processor.stats().count_shed_overload();
                }
                processor.retire_task(&task, true);
                return;
            }
        }
    }

    task.state().begin_run();
    if !task.has_started() {
        task.mark_started();
        processor.stats().count_started();
    }

    let mut future: TaskFuture = processor.pool().take(task.slot());
    let poll_result: ::std::thread::Result<Poll<()>> = {
        let _scope: CurrentTaskScope = CurrentTaskScope::enter(task.clone());
        let waker = waker_ref(&task);
        let mut poll_ctx: Context<'_> = Context::from_waker(&waker);
        catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut poll_ctx)))
    };

    match poll_result {
        Ok(Poll::Pending) => {
            // The future goes back into its cell before the sleep commits: the moment the task is visibly
            // Sleeping, another worker may dequeue it and check the cell out again.
            processor.pool().put_back(task.slot(), future);
            match task.state().commit_sleep() {
                CommitOutcome::Parked => {},
                CommitOutcome::Requeue => processor.enqueue(task),
            }
        },
        Ok(Poll::Ready(())) => {
            drop(future);
            let cancelled: bool = task.cancel_reason().is_some() && task.cancel_observed();
            task.state().complete(cancelled);
            processor.retire_task(&task, cancelled);
        },
        Err(payload) => {
            // Unwinding already dropped the future's guts; dropping the shell retires any sleep it prepared.
            drop(future);
            error!("run_one(): task {} panicked", task.id());
            processor.stats().count_panicked();
            // Waiters read the panic slot after seeing the terminal state, so the payload lands first.
            *task.panic_slot.lock().unwrap() = Some(payload);
            task.state().complete(false);
            processor.retire_task(&task, false);
        },
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for CurrentTaskScope {
    fn drop(&mut self) {
        CURRENT_TASK.with(|current| {
            let _: Option<Arc<TaskContext>> = current.borrow_mut().take();
        });
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
