// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::task::{
    state::{
        SleepToken,
        WakeSource,
    },
    CancellationReason,
    TaskContext,
};
use ::std::{
    cmp::{
        Ordering,
        Reverse,
    },
    collections::BinaryHeap,
    sync::Weak,
    time::Instant,
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// What a fired timer does. Targets hold weak task references, so a finished task costs nothing but its dead heap
/// entry.
pub enum TimerTarget {
    /// Wake the task out of the sleep cycle identified by `token`. Bounces as stale if the cycle was consumed.
    Wake { task: Weak<TaskContext>, token: SleepToken },
    /// Request cancellation of the task with [`CancellationReason::Deadline`].
    Cancel { task: Weak<TaskContext> },
}

struct TimerEntry {
    when: Instant,
    /// Arming order, for stable expiry order among ties.
    seq: u64,
    target: TimerTarget,
}

/// Min-heap of armed timers, owned by the reactor thread. Entries stay until expiry; a wakeup that became obsolete
/// earlier is discarded by the sleep epoch check when the timer finally fires.
pub struct TimerHeap {
    entries: BinaryHeap<Reverse<TimerEntry>>,
    next_seq: u64,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            entries: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Arms a one-shot timer.
    pub fn arm(&mut self, when: Instant, target: TimerTarget) {
        let seq: u64 = self.next_seq;
        self.next_seq += 1;
        self.entries.push(Reverse(TimerEntry { when, seq, target }));
    }

    /// The earliest expiry among armed timers, if any.
    pub fn next_expiry(&self) -> Option<Instant> {
        self.entries.peek().map(|Reverse(entry)| entry.when)
    }

    /// Fires every timer that expired by `now`, in expiry order. Returns how many fired.
    pub fn fire_expired(&mut self, now: Instant) -> usize {
        let mut fired: usize = 0;
        loop {
            match self.entries.peek() {
                Some(Reverse(entry)) if entry.when <= now => {},
                _ => break,
            }
            if let Some(Reverse(entry)) = self.entries.pop() {
                entry.target.fire();
                fired += 1;
            }
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TimerTarget {
    fn fire(self) {
        match self {
            TimerTarget::Wake { task, token } => {
                if let Some(ctx) = task.upgrade() {
                    ctx.wake(token, WakeSource::Timer);
                }
            },
            TimerTarget::Cancel { task } => {
                if let Some(ctx) = task.upgrade() {
                    ctx.request_cancel(CancellationReason::Deadline);
                }
            },
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Default Trait Implementation for Timer Heaps
impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

// Heap order considers expiry and arming order only.
impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.when.cmp(&other.when).then(self.seq.cmp(&other.seq))
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        TimerHeap,
        TimerTarget,
    };
    use crate::runtime::task::{
        local::LocalStorage,
        state::{
            SleepToken,
            TaskState,
        },
        CancellationReason,
        Importance,
        TaskContext,
        TaskId,
    };
    use ::anyhow::Result;
    use ::std::{
        sync::{
            Arc,
            Weak,
        },
        time::{
            Duration,
            Instant,
        },
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
    fn test_timer_heap_fires_in_expiry_order() -> Result<()> {
        let now: Instant = Instant::now();
        let (early, early_token) = parked_task(1);
        let (late, late_token) = parked_task(2);

        let mut heap: TimerHeap = TimerHeap::new();
        heap.arm(now + Duration::from_millis(50), TimerTarget::Wake {
            task: Arc::downgrade(&late),
            token: late_token,
        });
        heap.arm(now + Duration::from_millis(10), TimerTarget::Wake {
            task: Arc::downgrade(&early),
            token: early_token,
        });

        crate::ensure_eq!(heap.next_expiry(), Some(now + Duration::from_millis(10)));

        // Only the earlier timer has expired at +20ms.
        crate::ensure_eq!(heap.fire_expired(now + Duration::from_millis(20)), 1);
        crate::ensure_eq!(early.task_state(), TaskState::Queued);
        crate::ensure_eq!(late.task_state(), TaskState::Suspended);

        crate::ensure_eq!(heap.fire_expired(now + Duration::from_millis(60)), 1);
        crate::ensure_eq!(late.task_state(), TaskState::Queued);
        crate::ensure_eq!(heap.is_empty(), true);

        Ok(())
    }

    #[test]
    fn test_timer_obsolete_wakeup_bounces() -> Result<()> {
        let now: Instant = Instant::now();
        let (ctx, token) = parked_task(1);

        let mut heap: TimerHeap = TimerHeap::new();
        heap.arm(now, TimerTarget::Wake {
            task: Arc::downgrade(&ctx),
            token,
        });

        // The task is woken by something else and consumes the cycle before the timer fires.
        ctx.wake(token, crate::runtime::task::state::WakeSource::WaitList);
        ctx.state().begin_run();
        ctx.state().finish_sleep(token);

        crate::ensure_eq!(heap.fire_expired(now), 1);
        crate::ensure_eq!(ctx.task_state(), TaskState::Running);

        Ok(())
    }

    #[test]
    fn test_timer_cancel_target_sets_deadline_reason() -> Result<()> {
        let now: Instant = Instant::now();
        let (ctx, _token) = parked_task(1);

        let mut heap: TimerHeap = TimerHeap::new();
        heap.arm(now, TimerTarget::Cancel {
            task: Arc::downgrade(&ctx),
        });
        heap.fire_expired(now);

        crate::ensure_eq!(ctx.cancel_reason(), Some(CancellationReason::Deadline));
        // The cancellation wakeup ignores the sleep epoch, so the parked task got scheduled.
        crate::ensure_eq!(ctx.task_state(), TaskState::Queued);

        Ok(())
    }

    #[test]
    fn test_timer_dead_task_is_ignored() -> Result<()> {
        let now: Instant = Instant::now();
        let mut heap: TimerHeap = TimerHeap::new();
        {
            let (ctx, token) = parked_task(1);
            heap.arm(now, TimerTarget::Wake {
                task: Arc::downgrade(&ctx),
                token,
            });
        }

        crate::ensure_eq!(heap.fire_expired(now), 1);
        crate::ensure_eq!(heap.is_empty(), true);

        Ok(())
    }
}
