// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Readiness I/O for tasks.
//!
//! A runtime runs one reactor thread ([`event_loop::SharedEventLoop`]) owning the epoll instance and the timer heap.
//! Tasks consume readiness through a [`Poller`]: descriptors are armed one-shot, events land in the poller's queue,
//! and `next_event` parks the task until something arrives.
//!
//! Stale events are fenced twice. The reactor remembers the arming epoch of every watched descriptor and hands it
//! back with the event; the poller compares it against its own per-descriptor epoch, which `add` advances on every
//! re-arm. An event that raced with a re-arm or a removal thus identifies itself and is dropped, and `remove` blocks
//! until the reactor acknowledged the disarm, after which closing the descriptor cannot race with the reactor.

pub mod event_loop;
pub mod timer;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    deadline::Deadline,
    fail::Fail,
    reactor::event_loop::SharedEventLoop,
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
use ::libc::{
    EPOLLERR,
    EPOLLHUP,
    EPOLLIN,
    EPOLLOUT,
    EPOLLPRI,
    EPOLLRDHUP,
};
use ::std::{
    collections::{
        HashMap,
        VecDeque,
    },
    ops::{
        BitOr,
        BitOrAssign,
    },
    os::fd::RawFd,
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
        Mutex,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// Readiness classes a descriptor can be watched for, and the classes reported back with an event.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct EventFlags(u32);

/// One readiness event delivered to a poller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PollerEvent {
    pub fd: RawFd,
    pub flags: EventFlags,
}

/// What a wait for events produced.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PollStatus {
    /// An event arrived.
    Event(PollerEvent),
    /// The deadline passed with nothing to report.
    NoEvents,
    /// [`Poller::interrupt`] was called.
    Interrupted,
}

/// Per-descriptor registration on the consumer side.
struct FdInterest {
    /// Advanced on every re-arm; events armed under an older value are stale.
    coro_epoch: u64,
}

struct EventQueue {
    events: VecDeque<PollerEvent>,
    interrupted: bool,
    waiters: WaitList,
}

/// State shared between a [`Poller`] and the reactor thread, which holds it weakly.
pub(crate) struct PollerShared {
    event_loop: SharedEventLoop,
    regs: Mutex<HashMap<RawFd, FdInterest>>,
    queue: Mutex<EventQueue>,
    stale_events: AtomicU64,
}

/// Single-consumer readiness queue over a set of descriptors. Descriptors are watched one event at a time: every
/// delivery disarms the watch, and the consumer re-arms with [`Poller::add`] once it wants the next one.
pub struct Poller {
    shared: Arc<PollerShared>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl EventFlags {
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const ERROR: Self = Self(1 << 2);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub(crate) fn to_epoll(self) -> u32 {
        let mut events: u32 = 0;
        if self.contains(Self::READ) {
            events |= (EPOLLIN | EPOLLRDHUP) as u32;
        }
        if self.contains(Self::WRITE) {
            events |= EPOLLOUT as u32;
        }
        events
    }

    pub(crate) fn from_epoll(events: u32) -> Self {
        let mut flags: Self = Self::empty();
        if events & (EPOLLIN | EPOLLPRI | EPOLLRDHUP) as u32 != 0 {
            flags |= Self::READ;
        }
        if events & EPOLLOUT as u32 != 0 {
            flags |= Self::WRITE;
        }
        if events & (EPOLLERR | EPOLLHUP) as u32 != 0 {
            flags |= Self::ERROR;
        }
        flags
    }
}

impl PollerShared {
    fn new(event_loop: SharedEventLoop) -> Self {
        Self {
            event_loop,
            regs: Mutex::new(HashMap::new()),
            queue: Mutex::new(EventQueue {
                events: VecDeque::new(),
                interrupted: false,
                waiters: WaitList::new(),
            }),
            stale_events: AtomicU64::new(0),
        }
    }

    /// Takes one event in from the reactor thread. `armed_epoch` is the poller-side epoch the watch was armed
    /// under; a mismatch against the current registration means the event raced with a re-arm or a removal.
    pub(crate) fn deliver(&self, fd: RawFd, flags: EventFlags, armed_epoch: u64) {
        let fresh: bool = match self.regs.lock().unwrap().get(&fd) {
            Some(interest) => interest.coro_epoch == armed_epoch,
            None => false,
        };
        if !fresh {
            self.stale_events.fetch_add(1, Ordering::Relaxed);
            debug!("deliver(): dropping stale event for descriptor {}", fd);
            return;
        }
        let mut queue = self.queue.lock().unwrap();
        queue.events.push_back(PollerEvent { fd, flags });
        queue.waiters.wake_one(WakeSource::Io);
    }
}

impl Poller {
    /// Creates a poller bound to the reactor of the current task's runtime.
    pub fn new() -> Result<Self, Fail> {
        let ctx: Arc<TaskContext> = current_task_or_fail("poller_new")?;
        let processor = match ctx.processor() {
            Some(processor) => processor,
            None => {
                let cause: String = "poller_new(): task processor is gone".to_string();
                error!("{}", &cause);
                return Err(Fail::shutting_down(&cause));
            },
        };
        Ok(Self::with_event_loop(processor.event_loop().clone()))
    }

    pub(crate) fn with_event_loop(event_loop: SharedEventLoop) -> Self {
        Self {
            shared: Arc::new(PollerShared::new(event_loop)),
        }
    }

    /// Arms a one-shot watch for `events` on `fd`. Re-adding a descriptor supersedes its previous arming: events
    /// from the old arming are dropped as stale.
    pub fn add(&self, fd: RawFd, events: EventFlags) -> Result<(), Fail> {
        if fd < 0 {
            let cause: String = format!("invalid descriptor: {}", fd);
            error!("add(): {}", &cause);
            return Err(Fail::new(libc::EBADF, &cause));
        }
        let epoch: u64 = {
            let mut regs = self.shared.regs.lock().unwrap();
            let interest: &mut FdInterest = regs.entry(fd).or_insert(FdInterest { coro_epoch: 0 });
            interest.coro_epoch += 1;
            interest.coro_epoch
        };
        self.shared
            .event_loop
            .arm_fd(fd, events, epoch, Arc::downgrade(&self.shared));
        Ok(())
    }

    /// Stops watching `fd` and discards its undelivered events. Blocks until the reactor acknowledged, so the caller
    /// may close the descriptor immediately afterwards.
    pub fn remove(&self, fd: RawFd) {
        let present: bool = self.shared.regs.lock().unwrap().remove(&fd).is_some();
        if present {
            self.shared.event_loop.disarm_fd(fd);
            self.shared.queue.lock().unwrap().events.retain(|event| event.fd != fd);
        }
    }

    /// Waits for the next event until `deadline`. Returns [`PollStatus::NoEvents`] on deadline expiry and fails
    /// with ECANCELED if the task is cancelled while waiting.
    pub async fn next_event(&self, deadline: Deadline) -> Result<PollStatus, Fail> {
        let ctx: Arc<TaskContext> = current_task_or_fail("next_event")?;
        loop {
            if ctx.should_cancel() {
                return Err(cancelled_fail(&ctx, "next_event"));
            }
            let park: Park = {
                let mut queue = self.shared.queue.lock().unwrap();
                if queue.interrupted {
                    queue.interrupted = false;
                    return Ok(PollStatus::Interrupted);
                }
                if let Some(event) = queue.events.pop_front() {
                    return Ok(PollStatus::Event(event));
                }
                if deadline.is_reached() {
                    return Ok(PollStatus::NoEvents);
                }
                let park: Park = Park::new(ctx.clone());
                queue.waiters.append(ctx.clone(), park.token());
                park
            };
            arm_wake_timer(&ctx, deadline, park.token());
            let _: ParkResult = park.await;
            self.shared.queue.lock().unwrap().waiters.remove(ctx.id());
        }
    }

    /// Takes the next event without waiting.
    pub fn next_event_noblock(&self) -> PollStatus {
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.interrupted {
            queue.interrupted = false;
            return PollStatus::Interrupted;
        }
        match queue.events.pop_front() {
            Some(event) => PollStatus::Event(event),
            None => PollStatus::NoEvents,
        }
    }

    /// Makes the pending or next wait return [`PollStatus::Interrupted`].
    pub fn interrupt(&self) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.interrupted = true;
        queue.waiters.wake_one(WakeSource::Io);
    }

    /// How many stale events this poller has dropped.
    pub fn stale_events(&self) -> u64 {
        self.shared.stale_events.load(Ordering::Relaxed)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Bitwise Or Trait Implementation for Event Flags
impl BitOr for EventFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Bitwise Or Trait Implementation for Event Flags
impl BitOrAssign for EventFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

/// Drop Trait Implementation for Pollers
impl Drop for Poller {
    fn drop(&mut self) {
        let fds: Vec<RawFd> = self.shared.regs.lock().unwrap().keys().copied().collect();
        for fd in fds {
            self.remove(fd);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
