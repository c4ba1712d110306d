// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Lock-free sleep state machine for tasks.
//!
//! Every task carries one atomic 64-bit word encoding its run state, the set of wakeup sources recorded for the
//! current sleep cycle, and a sleep epoch:
//!
//! ```text
//! | 63 .. 9 |  8 .. 3  | 2 .. 0    |
//! |  epoch  |  flags   | run state |
//! ```
//!
//! The epoch disambiguates wakeups across sleep cycles. Preparing a sleep advances the epoch and hands out a
//! [`SleepToken`] carrying it; finishing or aborting the sleep advances the epoch again, so any wakeup still holding
//! the old token compares unequal and is discarded as stale. Wakeups delivered through a foreign [`std::task::Waker`]
//! bypass the epoch check, since that contract has no notion of cycles; they are recorded as their own source and
//! surviving loops treat them as spurious.

//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::sync::atomic::{
    AtomicU64,
    Ordering,
};

//======================================================================================================================
// Constants
//======================================================================================================================

const RUN_STATE_BITS: u64 = 0b111;

const FLAG_WAIT_LIST: u64 = 1 << 3;
const FLAG_IO: u64 = 1 << 4;
const FLAG_TIMER: u64 = 1 << 5;
const FLAG_YIELD: u64 = 1 << 6;
const FLAG_FOREIGN: u64 = 1 << 7;
const FLAG_CANCEL: u64 = 1 << 8;
const FLAG_BITS: u64 = FLAG_WAIT_LIST | FLAG_IO | FLAG_TIMER | FLAG_YIELD | FLAG_FOREIGN | FLAG_CANCEL;

const EPOCH_SHIFT: u32 = 9;
const EPOCH_ONE: u64 = 1 << EPOCH_SHIFT;
const EPOCH_MASK: u64 = !(RUN_STATE_BITS | FLAG_BITS);

//======================================================================================================================
// Structures
//======================================================================================================================

/// The packed sleep state word of one task.
pub struct SleepState {
    word: AtomicU64,
}

/// Epoch ticket for one sleep cycle. Handed out by [`SleepState::prepare_sleep`] and consumed by
/// [`SleepState::finish_sleep`] or [`SleepState::abort_sleep`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SleepToken(u64);

/// Fine-grained run state of a task, as encoded in the low bits of the state word.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u64)]
pub enum RunState {
    /// Created, never enqueued.
    New = 0,
    /// In some worker run queue.
    Queued = 1,
    /// Being polled by a worker.
    Running = 2,
    /// Announced an upcoming suspension but still being polled.
    SleepPrepared = 3,
    /// Suspended, runnable only through a wakeup.
    Sleeping = 4,
    /// Woken up between sleep preparation and suspension.
    Notified = 5,
    /// Finished.
    Completed = 6,
    /// Finished through cancellation.
    Cancelled = 7,
}

/// Coarse task state reported to handle holders.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TaskState {
    New,
    Queued,
    Running,
    Suspended,
    Completed,
    Cancelled,
}

/// The reason a wakeup was delivered. Ordered by priority: when several sources fire within one sleep cycle, the
/// highest one is reported as primary.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum WakeSource {
    /// A foreign [`std::task::Waker`] fired.
    Foreign,
    /// The task asked to be rescheduled without waiting for anything.
    Yield,
    /// A timer expired.
    Timer,
    /// An I/O event arrived.
    Io,
    /// A wait list woke the task.
    WaitList,
    /// Cancellation was requested.
    Cancel,
}

/// What a wakeup did to the task.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum WakeOutcome {
    /// The task left [`RunState::Sleeping`]. The caller now owns scheduling it onto a run queue.
    Scheduled,
    /// The source was recorded; the task was not sleeping, so somebody else schedules it.
    Recorded,
    /// The token did not match the current epoch. The wakeup was discarded.
    Stale,
    /// The task already finished. The wakeup was discarded.
    Terminal,
}

/// What a worker does with a task whose poll returned `Pending`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CommitOutcome {
    /// The task is now [`RunState::Sleeping`]. Drop it until a wakeup schedules it.
    Parked,
    /// A wakeup raced with the suspension. Put the task straight back on the run queue.
    Requeue,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl WakeSource {
    /// Flag bit recording this source in the state word.
    const fn flag(self) -> u64 {
        match self {
            WakeSource::Foreign => FLAG_FOREIGN,
            WakeSource::Yield => FLAG_YIELD,
            WakeSource::Timer => FLAG_TIMER,
            WakeSource::Io => FLAG_IO,
            WakeSource::WaitList => FLAG_WAIT_LIST,
            WakeSource::Cancel => FLAG_CANCEL,
        }
    }

    /// Highest-priority source recorded in `flags`, if any.
    fn primary(flags: u64) -> Option<WakeSource> {
        // Priority descending.
        const ORDERED: [WakeSource; 6] = [
            WakeSource::Cancel,
            WakeSource::WaitList,
            WakeSource::Io,
            WakeSource::Timer,
            WakeSource::Yield,
            WakeSource::Foreign,
        ];
        ORDERED.into_iter().find(|source| flags & source.flag() != 0)
    }
}

impl RunState {
    fn from_word(word: u64) -> Self {
        match word & RUN_STATE_BITS {
            0 => RunState::New,
            1 => RunState::Queued,
            2 => RunState::Running,
            3 => RunState::SleepPrepared,
            4 => RunState::Sleeping,
            5 => RunState::Notified,
            6 => RunState::Completed,
            7 => RunState::Cancelled,
            _ => unreachable!(),
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, RunState::Completed | RunState::Cancelled)
    }
}

impl SleepState {
    pub fn new() -> Self {
        Self {
            word: AtomicU64::new(RunState::New as u64),
        }
    }

    /// Current run state.
    pub fn run_state(&self) -> RunState {
        RunState::from_word(self.word.load(Ordering::Acquire))
    }

    /// Whether the task already finished.
    pub fn is_terminal(&self) -> bool {
        self.run_state().is_terminal()
    }

    /// Coarse state for handle holders.
    pub fn public_state(&self) -> TaskState {
        match self.run_state() {
            RunState::New => TaskState::New,
            RunState::Queued | RunState::Notified => TaskState::Queued,
            RunState::Running | RunState::SleepPrepared => TaskState::Running,
            RunState::Sleeping => TaskState::Suspended,
            RunState::Completed => TaskState::Completed,
            RunState::Cancelled => TaskState::Cancelled,
        }
    }

    /// Marks a freshly created task as queued. Called exactly once, before the first enqueue.
    pub fn enqueue_new(&self) {
        let old: u64 = RunState::New as u64;
        let new: u64 = RunState::Queued as u64;
        if self.word.compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire).is_err() {
            unreachable!("enqueue_new() on a task that already ran");
        }
    }

    /// Transitions a dequeued task to [`RunState::Running`]. Pending wakeup flags and the epoch are preserved.
    pub fn begin_run(&self) {
        let mut word: u64 = self.word.load(Ordering::Acquire);
        loop {
            if RunState::from_word(word) != RunState::Queued {
                unreachable!("begin_run() on a task that is not queued");
            }
            let new: u64 = (word & !RUN_STATE_BITS) | RunState::Running as u64;
            match self.word.compare_exchange(word, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => word = actual,
            }
        }
    }

    /// Cancels a queued task without running it. Returns false if the task is not currently queued.
    pub fn cancel_queued(&self) -> bool {
        let mut word: u64 = self.word.load(Ordering::Acquire);
        loop {
            if RunState::from_word(word) != RunState::Queued {
                return false;
            }
            let new: u64 = pack(RunState::Cancelled, 0, (word & EPOCH_MASK).wrapping_add(EPOCH_ONE));
            match self.word.compare_exchange(word, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return true,
                Err(actual) => word = actual,
            }
        }
    }

    /// Transitions a running task to its terminal state once its future returned `Ready`.
    pub fn complete(&self, cancelled: bool) {
        let terminal: RunState = if cancelled { RunState::Cancelled } else { RunState::Completed };
        let mut word: u64 = self.word.load(Ordering::Acquire);
        loop {
            if RunState::from_word(word) != RunState::Running {
                unreachable!("complete() on a task that is not running");
            }
            let new: u64 = pack(terminal, 0, (word & EPOCH_MASK).wrapping_add(EPOCH_ONE));
            match self.word.compare_exchange(word, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => word = actual,
            }
        }
    }

    /// Announces an upcoming suspension and returns the token for this sleep cycle. Idempotent within one poll pass:
    /// if a suspension was already announced and not yet consumed, the existing token is returned, so several waiting
    /// branches of one task share the cycle.
    pub fn prepare_sleep(&self) -> SleepToken {
        let mut word: u64 = self.word.load(Ordering::Acquire);
        loop {
            match RunState::from_word(word) {
                RunState::SleepPrepared | RunState::Notified => return SleepToken(word & EPOCH_MASK),
                RunState::Running => {
                    let epoch: u64 = (word & EPOCH_MASK).wrapping_add(EPOCH_ONE);
                    let new: u64 = pack(RunState::SleepPrepared, word & FLAG_BITS, epoch);
                    match self.word.compare_exchange(word, new, Ordering::AcqRel, Ordering::Acquire) {
                        Ok(_) => return SleepToken(epoch),
                        Err(actual) => word = actual,
                    }
                },
                state => unreachable!("prepare_sleep() in state {:?}", state),
            }
        }
    }

    /// Commits or rejects the suspension after the task's future returned `Pending`. Worker-side. A task that
    /// returned `Pending` without announcing a suspension is waiting on a foreign waker; it parks under the current
    /// epoch, so only epoch-ignoring wakeups can reach it. Sources recorded while no suspension was announced have no
    /// sleep cycle to consume them, so a requeue for those discards the flags; keeping them would requeue the task
    /// forever.
    pub fn commit_sleep(&self) -> CommitOutcome {
        let mut word: u64 = self.word.load(Ordering::Acquire);
        loop {
            let flags: u64 = word & FLAG_BITS;
            let epoch: u64 = word & EPOCH_MASK;
            let (new, outcome): (u64, CommitOutcome) = match RunState::from_word(word) {
                RunState::SleepPrepared | RunState::Running if flags == 0 => {
                    (pack(RunState::Sleeping, 0, epoch), CommitOutcome::Parked)
                },
                RunState::SleepPrepared | RunState::Notified => {
                    (pack(RunState::Queued, flags, epoch), CommitOutcome::Requeue)
                },
                RunState::Running => (pack(RunState::Queued, 0, epoch), CommitOutcome::Requeue),
                state => unreachable!("commit_sleep() in state {:?}", state),
            };
            match self.word.compare_exchange(word, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return outcome,
                Err(actual) => word = actual,
            }
        }
    }

    /// Delivers a wakeup for the sleep cycle identified by `token`. A token from a consumed cycle is discarded as
    /// stale. On [`WakeOutcome::Scheduled`] the caller owns putting the task back on its run queue; every other
    /// outcome only records the source, at most.
    pub fn wake(&self, token: SleepToken, source: WakeSource) -> WakeOutcome {
        let mut word: u64 = self.word.load(Ordering::Acquire);
        loop {
            let state: RunState = RunState::from_word(word);
            if state.is_terminal() {
                return WakeOutcome::Terminal;
            }
            if word & EPOCH_MASK != token.0 {
                return WakeOutcome::Stale;
            }
            let (new, outcome): (u64, WakeOutcome) = match state {
                RunState::Sleeping => (
                    pack(RunState::Queued, (word & FLAG_BITS) | source.flag(), token.0),
                    WakeOutcome::Scheduled,
                ),
                RunState::SleepPrepared => (
                    pack(RunState::Notified, (word & FLAG_BITS) | source.flag(), token.0),
                    WakeOutcome::Recorded,
                ),
                RunState::Running | RunState::Queued | RunState::Notified => {
                    if word & source.flag() != 0 {
                        return WakeOutcome::Recorded;
                    }
                    (word | source.flag(), WakeOutcome::Recorded)
                },
                RunState::New => return WakeOutcome::Stale,
                RunState::Completed | RunState::Cancelled => unreachable!(),
            };
            match self.word.compare_exchange(word, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return outcome,
                Err(actual) => word = actual,
            }
        }
    }

    /// Delivers a wakeup without an epoch check. Used for foreign wakers, whose contract has no cycles, and for
    /// cancellation, which targets the task rather than one sleep cycle.
    pub fn wake_ignoring_epoch(&self, source: WakeSource) -> WakeOutcome {
        let mut word: u64 = self.word.load(Ordering::Acquire);
        loop {
            let state: RunState = RunState::from_word(word);
            if state.is_terminal() {
                return WakeOutcome::Terminal;
            }
            let epoch: u64 = word & EPOCH_MASK;
            let (new, outcome): (u64, WakeOutcome) = match state {
                RunState::Sleeping => (
                    pack(RunState::Queued, (word & FLAG_BITS) | source.flag(), epoch),
                    WakeOutcome::Scheduled,
                ),
                RunState::SleepPrepared => (
                    pack(RunState::Notified, (word & FLAG_BITS) | source.flag(), epoch),
                    WakeOutcome::Recorded,
                ),
                RunState::New | RunState::Running | RunState::Queued | RunState::Notified => {
                    if word & source.flag() != 0 {
                        return WakeOutcome::Recorded;
                    }
                    (word | source.flag(), WakeOutcome::Recorded)
                },
                RunState::Completed | RunState::Cancelled => unreachable!(),
            };
            match self.word.compare_exchange(word, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return outcome,
                Err(actual) => word = actual,
            }
        }
    }

    /// Consumes the sleep cycle identified by `token` and reports the primary wakeup source. Task-side, called on
    /// resume. Returns [`None`] if the cycle was already consumed by another branch of the same task; the caller
    /// treats that as a spurious wakeup.
    pub fn finish_sleep(&self, token: SleepToken) -> Option<WakeSource> {
        let mut word: u64 = self.word.load(Ordering::Acquire);
        loop {
            if word & EPOCH_MASK != token.0 {
                return None;
            }
            if RunState::from_word(word) != RunState::Running {
                unreachable!("finish_sleep() in state {:?}", RunState::from_word(word));
            }
            let flags: u64 = word & FLAG_BITS;
            let new: u64 = pack(RunState::Running, 0, token.0.wrapping_add(EPOCH_ONE));
            match self.word.compare_exchange(word, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Some(WakeSource::primary(flags).unwrap_or(WakeSource::Foreign)),
                Err(actual) => word = actual,
            }
        }
    }

    /// Retires an announced suspension that will not happen, consuming `token`. Task-side, called when a waiting
    /// branch is dropped before its wakeup arrives. A token from a consumed cycle makes this a no-op.
    pub fn abort_sleep(&self, token: SleepToken) {
        let mut word: u64 = self.word.load(Ordering::Acquire);
        loop {
            if word & EPOCH_MASK != token.0 {
                return;
            }
            match RunState::from_word(word) {
                RunState::SleepPrepared | RunState::Notified | RunState::Running => {},
                state => unreachable!("abort_sleep() in state {:?}", state),
            }
            let new: u64 = pack(RunState::Running, 0, token.0.wrapping_add(EPOCH_ONE));
            match self.word.compare_exchange(word, new, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return,
                Err(actual) => word = actual,
            }
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

const fn pack(state: RunState, flags: u64, epoch_bits: u64) -> u64 {
    state as u64 | flags | epoch_bits
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Default Trait Implementation for Sleep States
impl Default for SleepState {
    fn default() -> Self {
        Self::new()
    }
}

/// Debug Trait Implementation for Sleep States
impl ::std::fmt::Debug for SleepState {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        let word: u64 = self.word.load(Ordering::Relaxed);
        f.debug_struct("SleepState")
            .field("run_state", &RunState::from_word(word))
            .field("flags", &format_args!("{:#b}", (word & FLAG_BITS) >> 3))
            .field("epoch", &(word >> EPOCH_SHIFT))
            .finish()
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
