// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Suspension building blocks for task code.
//!
//! [`Park`] is the one-shot future every native waiting primitive is built from: announce the suspension, publish the
//! sleep token to whoever will deliver the wakeup, return `Pending` once, and consume the cycle on resume. Waiting
//! loops recheck their condition, the cancellation request, and their deadline after every resume, so a wakeup
//! reported for the wrong reason is never more than a spurious iteration.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    deadline::Deadline,
    fail::Fail,
    processor::worker::try_current_task,
    reactor::timer::TimerTarget,
    task::{
        state::{
            SleepToken,
            WakeSource,
        },
        TaskContext,
    },
};
use ::std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{
        Context,
        Poll,
    },
    time::Duration,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// One suspension of the current task. Created inside the task, awaited at most once. Dropping it before completion
/// retires the announced suspension so a later wakeup holding its token bounces as stale.
pub(crate) struct Park {
    ctx: Arc<TaskContext>,
    token: SleepToken,
    phase: ParkPhase,
}

enum ParkPhase {
    Init,
    Yielded,
    Done,
}

/// How a [`Park`] ended.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ParkResult {
    /// A wakeup landed; `WakeSource` is the primary recorded source. Advisory: waiting loops verify their actual
    /// condition, cancellation, and deadline themselves.
    Woken(WakeSource),
    /// Another branch of the same task consumed the sleep cycle first. Treat as spurious.
    StaleCycle,
}

/// Scope guard that defers acting on cancellation requests. While at least one blocker is alive, the task's
/// cancellation points report nothing; a request landing meanwhile still wakes the task, which then treats the
/// resume as spurious. The sticky reason takes effect once the last blocker drops.
pub struct CancellationBlocker {
    ctx: Option<Arc<TaskContext>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Park {
    /// Announces a suspension of `ctx` and captures its sleep token.
    pub(crate) fn new(ctx: Arc<TaskContext>) -> Self {
        let token: SleepToken = ctx.state().prepare_sleep();
        Self {
            ctx,
            token,
            phase: ParkPhase::Init,
        }
    }

    /// The token identifying this sleep cycle. Hand it to whoever delivers the wakeup.
    pub(crate) fn token(&self) -> SleepToken {
        self.token
    }
}

impl CancellationBlocker {
    /// Starts deferring cancellation for the current task. Outside a task this is inert.
    pub fn new() -> Self {
        let ctx: Option<Arc<TaskContext>> = try_current_task();
        if let Some(ctx) = &ctx {
            ctx.block_cancel();
        }
        Self { ctx }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Reschedules the current task to the back of its run queue, letting everything already queued run first. Outside
/// a task this is a no-op.
pub async fn yield_now() {
    let ctx: Arc<TaskContext> = match try_current_task() {
        Some(ctx) => ctx,
        None => return,
    };
    let park: Park = Park::new(ctx.clone());
    // Pre-deliver the wakeup so the suspension turns into a requeue instead of a park.
    ctx.wake(park.token(), WakeSource::Yield);
    let _: ParkResult = park.await;
}

/// Suspends the current task until `deadline` passes. An unreachable deadline parks the task until it is cancelled.
/// Fails with ECANCELED if cancellation fires first.
pub async fn sleep_until(deadline: Deadline) -> Result<(), Fail> {
    let ctx: Arc<TaskContext> = current_task_or_fail("sleep_until")?;
    loop {
        if ctx.should_cancel() {
            return Err(cancelled_fail(&ctx, "sleep_until"));
        }
        if deadline.is_reached() {
            return Ok(());
        }
        let park: Park = Park::new(ctx.clone());
        arm_wake_timer(&ctx, deadline, park.token());
        let _: ParkResult = park.await;
    }
}

/// Suspends the current task for `timeout`. Fails with ECANCELED if cancellation fires first.
pub async fn sleep_for(timeout: Duration) -> Result<(), Fail> {
    sleep_until(Deadline::from_duration(timeout)).await
}

/// Reports a pending cancellation request of the current task as ECANCELED, acknowledging it. Ok outside a task,
/// while a [`CancellationBlocker`] is alive, or when no cancellation was requested.
pub fn cancellation_point() -> Result<(), Fail> {
    if let Some(ctx) = try_current_task() {
        if ctx.should_cancel() {
            return Err(cancelled_fail(&ctx, "cancellation_point"));
        }
    }
    Ok(())
}

/// Builds the ECANCELED failure for a task bailing out on cancellation, acknowledging the request so the task counts
/// as cancelled when it finishes.
pub(crate) fn cancelled_fail(ctx: &TaskContext, what: &str) -> Fail {
    ctx.note_cancel_observed();
    let reason: &str = match ctx.cancel_reason() {
        Some(reason) => reason.as_str(),
        None => "unknown",
    };
    let cause: String = format!("{}: task cancelled ({})", what, reason);
    debug!("task {}: {}", ctx.id(), &cause);
    Fail::cancelled(&cause)
}

/// Arms a one-shot timer that wakes `ctx` out of the sleep cycle `token` once `deadline` passes. Unreachable
/// deadlines arm nothing.
pub(crate) fn arm_wake_timer(ctx: &Arc<TaskContext>, deadline: Deadline, token: SleepToken) {
    if let Some(when) = deadline.instant() {
        if let Some(processor) = ctx.processor() {
            processor.event_loop().arm_timer(when, TimerTarget::Wake {
                task: Arc::downgrade(ctx),
                token,
            });
        }
    }
}

/// The current task, or EPERM for callers outside any task.
pub(crate) fn current_task_or_fail(what: &str) -> Result<Arc<TaskContext>, Fail> {
    match try_current_task() {
        Some(ctx) => Ok(ctx),
        None => {
            let cause: String = format!("{}(): not called from a task", what);
            error!("{}", &cause);
            Err(Fail::new(libc::EPERM, &cause))
        },
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Future Trait Implementation for Parks
impl Future for Park {
    type Output = ParkResult;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<ParkResult> {
        match self.phase {
            ParkPhase::Init => {
                self.phase = ParkPhase::Yielded;
                Poll::Pending
            },
            ParkPhase::Yielded => {
                self.phase = ParkPhase::Done;
                match self.ctx.state().finish_sleep(self.token) {
                    Some(source) => Poll::Ready(ParkResult::Woken(source)),
                    None => Poll::Ready(ParkResult::StaleCycle),
                }
            },
            ParkPhase::Done => unreachable!("Park polled after completion"),
        }
    }
}

/// Drop Trait Implementation for Parks
impl Drop for Park {
    fn drop(&mut self) {
        if !matches!(self.phase, ParkPhase::Done) {
            self.ctx.state().abort_sleep(self.token);
        }
    }
}

/// Default Trait Implementation for Cancellation Blockers
impl Default for CancellationBlocker {
    fn default() -> Self {
        Self::new()
    }
}

/// Drop Trait Implementation for Cancellation Blockers
impl Drop for CancellationBlocker {
    fn drop(&mut self) {
        if let Some(ctx) = &self.ctx {
            ctx.unblock_cancel();
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
