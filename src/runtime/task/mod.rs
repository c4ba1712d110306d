// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod handle;
pub mod local;
pub mod state;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    deadline::Deadline,
    processor::ProcessorInner,
    reactor::timer::TimerTarget,
    task::{
        local::LocalStorage,
        state::{
            SleepState,
            SleepToken,
            TaskState,
            WakeOutcome,
            WakeSource,
        },
    },
    wait_list::WaitList,
};
use ::futures::task::ArcWake;
use ::std::{
    any::Any,
    fmt,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU32,
            AtomicU8,
            Ordering,
        },
        Arc,
        Condvar,
        Mutex,
        Weak,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Runtime-unique task identifier. Zero is reserved and never assigned.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(u64);

/// Importance class of a task. Critical tasks are exempt from overload control.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Importance {
    #[default]
    Normal,
    Critical,
}

/// Why a task was asked to cancel. The first reason sticks; later requests are ignored.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CancellationReason {
    /// Somebody called `request_cancel` on a handle.
    UserRequest,
    /// The task's cancellation deadline passed.
    Deadline,
    /// The processor shed the task under overload.
    Overload,
    /// The last handle was dropped without detaching.
    Abandoned,
    /// The runtime is shutting down.
    Shutdown,
}

/// Blocking-side completion signal, for waiters that are not tasks themselves.
pub(crate) struct JoinSync {
    pub(crate) finished: Mutex<bool>,
    pub(crate) cond: Condvar,
}

/// Shared per-task bookkeeping. One `Arc<TaskContext>` is held by the run queue while the task is queued, by wait
/// lists while it sleeps on them, and by its handle until joined or detached.
pub struct TaskContext {
    /// Identifier.
    id: TaskId,
    /// Importance class for overload control.
    importance: Importance,
    /// Sleep state machine.
    state: SleepState,
    /// Slot occupied by this task's future in the coroutine pool.
    slot: usize,
    /// Processor whose run queue the task belongs to.
    processor: Weak<ProcessorInner>,
    /// Set-once cancellation reason, 0 meaning none.
    cancel_reason: AtomicU8,
    /// Number of live cancellation blockers.
    cancel_blocks: AtomicU32,
    /// Whether task code acknowledged the cancellation request.
    cancel_observed: AtomicBool,
    /// Whether the task ever started running.
    started: AtomicBool,
    /// Whether the task was detached from its handle.
    detached: AtomicBool,
    /// Tasks parked until this task finishes.
    pub(crate) joiners: Mutex<WaitList>,
    /// Completion signal for blocking (non-task) waiters.
    pub(crate) join_sync: JoinSync,
    /// Panic payload carried from the worker to the handle holder.
    pub(crate) panic_slot: Mutex<Option<Box<dyn Any + Send>>>,
    /// Task-local storage.
    pub(crate) locals: Mutex<LocalStorage>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TaskId {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl CancellationReason {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => None,
            1 => Some(CancellationReason::UserRequest),
            2 => Some(CancellationReason::Deadline),
            3 => Some(CancellationReason::Overload),
            4 => Some(CancellationReason::Abandoned),
            5 => Some(CancellationReason::Shutdown),
            _ => unreachable!(),
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            CancellationReason::UserRequest => 1,
            CancellationReason::Deadline => 2,
            CancellationReason::Overload => 3,
            CancellationReason::Abandoned => 4,
            CancellationReason::Shutdown => 5,
        }
    }

    /// Short human-readable form for log lines and failure causes.
    pub fn as_str(self) -> &'static str {
        match self {
            CancellationReason::UserRequest => "user request",
            CancellationReason::Deadline => "deadline",
            CancellationReason::Overload => "overload",
            CancellationReason::Abandoned => "abandoned",
            CancellationReason::Shutdown => "shutdown",
        }
    }
}

impl TaskContext {
    /// Creates the bookkeeping for one task. `inherited` is the snapshot of inheritable task-locals taken from the
    /// spawning task, if any.
    pub(crate) fn new(
        id: TaskId,
        importance: Importance,
        slot: usize,
        processor: Weak<ProcessorInner>,
        locals: LocalStorage,
    ) -> Self {
        Self {
            id,
            importance,
            state: SleepState::new(),
            slot,
            processor,
            cancel_reason: AtomicU8::new(0),
            cancel_blocks: AtomicU32::new(0),
            cancel_observed: AtomicBool::new(false),
            started: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            joiners: Mutex::new(WaitList::new()),
            join_sync: JoinSync {
                finished: Mutex::new(false),
                cond: Condvar::new(),
            },
            panic_slot: Mutex::new(None),
            locals: Mutex::new(locals),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn importance(&self) -> Importance {
        self.importance
    }

    /// Coarse state for handle holders.
    pub fn task_state(&self) -> TaskState {
        self.state.public_state()
    }

    pub(crate) fn state(&self) -> &SleepState {
        &self.state
    }

    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn processor(&self) -> Option<Arc<ProcessorInner>> {
        self.processor.upgrade()
    }

    //==================================================================================================================
    // Wakeups
    //==================================================================================================================

    /// Delivers an epoch-checked wakeup, scheduling the task if it was sleeping. Stale deliveries are counted on the
    /// owning processor and dropped.
    pub(crate) fn wake(self: &Arc<Self>, token: SleepToken, source: WakeSource) -> WakeOutcome {
        let outcome: WakeOutcome = self.state.wake(token, source);
        self.after_wake(outcome);
        outcome
    }

    /// Delivers an epoch-ignoring wakeup. Used by foreign wakers and cancellation.
    pub(crate) fn wake_ignoring_epoch(self: &Arc<Self>, source: WakeSource) -> WakeOutcome {
        let outcome: WakeOutcome = self.state.wake_ignoring_epoch(source);
        self.after_wake(outcome);
        outcome
    }

    fn after_wake(self: &Arc<Self>, outcome: WakeOutcome) {
        match outcome {
            WakeOutcome::Scheduled => {
                if let Some(processor) = self.processor.upgrade() {
                    processor.enqueue(self.clone());
                } else {
                    warn!("after_wake(): dropping wakeup for task {} without a processor", self.id);
                }
            },
            WakeOutcome::Stale => {
                if let Some(processor) = self.processor.upgrade() {
                    processor.stats().count_stale_wakeup();
                }
            },
            WakeOutcome::Recorded | WakeOutcome::Terminal => {},
        }
    }

    //==================================================================================================================
    // Cancellation
    //==================================================================================================================

    /// Requests cancellation with the given reason. The first request sticks and wakes the task; later ones are
    /// no-ops. Returns whether this call set the reason.
    ///
    /// The wake is delivered even while a [`crate::runtime::sleep::CancellationBlocker`] is live. Blockers mask the
    /// observation of the request, not its delivery; a blocked task that resumes spuriously just parks again.
    pub fn request_cancel(self: &Arc<Self>, reason: CancellationReason) -> bool {
        let newly_set: bool = self
            .cancel_reason
            .compare_exchange(0, reason.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if newly_set {
            self.wake_ignoring_epoch(WakeSource::Cancel);
        }
        newly_set
    }

    /// The sticky cancellation reason, if one was requested.
    pub fn cancel_reason(&self) -> Option<CancellationReason> {
        CancellationReason::from_u8(self.cancel_reason.load(Ordering::Acquire))
    }

    /// Whether task code should act on a pending cancellation right now.
    pub fn should_cancel(&self) -> bool {
        self.cancel_reason.load(Ordering::Acquire) != 0 && self.cancel_blocks.load(Ordering::Acquire) == 0
    }

    pub(crate) fn block_cancel(&self) {
        self.cancel_blocks.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unblock_cancel(&self) {
        let previous: u32 = self.cancel_blocks.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
    }

    /// Records that task code acknowledged the cancellation request. A task that finishes after acknowledging counts
    /// as cancelled; one that recovers and finishes normally does not.
    pub(crate) fn note_cancel_observed(&self) {
        self.cancel_observed.store(true, Ordering::Release);
    }

    pub(crate) fn cancel_observed(&self) -> bool {
        self.cancel_observed.load(Ordering::Acquire)
    }

    /// Arms a timer that requests cancellation with [`CancellationReason::Deadline`] once `deadline` passes.
    pub fn set_cancel_deadline(self: &Arc<Self>, deadline: Deadline) {
        if let Some(when) = deadline.instant() {
            if let Some(processor) = self.processor.upgrade() {
                processor.event_loop().arm_timer(when, TimerTarget::Cancel {
                    task: Arc::downgrade(self),
                });
            }
        }
    }

    //==================================================================================================================
    // Lifecycle
    //==================================================================================================================

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub(crate) fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Wakes everything waiting for this task to finish. Worker-side, after the terminal state is set.
    pub(crate) fn notify_finished(&self) {
        let woken: WaitList = {
            let mut joiners = self.joiners.lock().unwrap();
            ::std::mem::take(&mut *joiners)
        };
        for waiter in woken.take_all() {
            waiter.wake(WakeSource::WaitList);
        }

        let mut finished = self.join_sync.finished.lock().unwrap();
        *finished = true;
        self.join_sync.cond.notify_all();
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Waker Trait Implementation for Task Contexts. A waker cloned out of a task's poll context is the foreign wakeup
/// path: it carries no sleep token, so it ignores the epoch check.
impl ArcWake for TaskContext {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.wake_ignoring_epoch(WakeSource::Foreign);
    }
}

/// Display Trait Implementation for Task Identifiers
impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Conversion Trait Implementation for Task Identifiers
impl From<u64> for TaskId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Conversion Trait Implementation for Task Identifiers
impl From<TaskId> for u64 {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
