// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::{
    fail::Fail,
    reactor::{
        timer::{
            TimerHeap,
            TimerTarget,
        },
        EventFlags,
        PollerShared,
    },
};
use ::crossbeam_channel::{
    Receiver,
    Sender,
};
use ::libc::{
    epoll_create1,
    epoll_ctl,
    epoll_event,
    epoll_wait,
    eventfd,
    EFD_CLOEXEC,
    EFD_NONBLOCK,
    EINTR,
    ENOENT,
    EPOLLIN,
    EPOLLONESHOT,
    EPOLL_CLOEXEC,
    EPOLL_CTL_ADD,
    EPOLL_CTL_DEL,
    EPOLL_CTL_MOD,
};
use ::std::{
    collections::HashMap,
    os::fd::RawFd,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
        Mutex,
        Weak,
    },
    thread::{
        self,
        JoinHandle,
    },
    time::{
        Duration,
        Instant,
    },
};

//======================================================================================================================
// Constants
//======================================================================================================================

/// How many kernel events one `epoll_wait` call may return.
const MAX_EVENTS: usize = 1024;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Commands sent to the reactor thread. Any command may be followed by a nudge of its eventfd so a blocked
/// `epoll_wait` notices it.
pub(crate) enum ReactorCmd {
    /// Watch a descriptor for one event delivery.
    ArmFd {
        fd: RawFd,
        events: EventFlags,
        epoch: u64,
        target: Weak<PollerShared>,
    },
    /// Stop watching a descriptor. `ack` fires once the reactor will no longer touch it, which makes closing the
    /// descriptor safe.
    DisarmFd { fd: RawFd, ack: Sender<()> },
    /// Arm a one-shot timer.
    ArmTimer { when: Instant, target: TimerTarget },
    /// Exit the event loop.
    Stop,
}

/// One watched descriptor, remembered with the epoch it was armed under.
struct Watch {
    epoch: u64,
    target: Weak<PollerShared>,
}

struct EventLoopInner {
    tx: Sender<ReactorCmd>,
    nudge_fd: RawFd,
    thread: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

/// Handle to the reactor thread of a runtime. One reactor serves every task processor: it owns the epoll instance,
/// the timer heap, and nothing else, so it never blocks on anything but `epoll_wait`.
#[derive(Clone)]
pub struct SharedEventLoop(Arc<EventLoopInner>);

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl SharedEventLoop {
    /// Creates the epoll instance and the nudge eventfd and starts the reactor thread.
    pub fn new() -> Result<Self, Fail> {
        let epoll_fd: RawFd = match unsafe { epoll_create1(EPOLL_CLOEXEC) } {
            fd if fd >= 0 => fd,
            _ => {
                let errno: libc::c_int = unsafe { *libc::__errno_location() };
                let cause: String = format!("could not create epoll instance: {:?}", errno);
                error!("new(): {}", &cause);
                return Err(Fail::new(errno, &cause));
            },
        };
        let nudge_fd: RawFd = match unsafe { eventfd(0, EFD_CLOEXEC | EFD_NONBLOCK) } {
            fd if fd >= 0 => fd,
            _ => {
                let errno: libc::c_int = unsafe { *libc::__errno_location() };
                let cause: String = format!("could not create nudge eventfd: {:?}", errno);
                error!("new(): {}", &cause);
                unsafe { libc::close(epoll_fd) };
                return Err(Fail::new(errno, &cause));
            },
        };
        let mut ev: epoll_event = epoll_event {
            events: EPOLLIN as u32,
            u64: nudge_fd as u64,
        };
        if unsafe { epoll_ctl(epoll_fd, EPOLL_CTL_ADD, nudge_fd, &mut ev) } != 0 {
            let errno: libc::c_int = unsafe { *libc::__errno_location() };
            let cause: String = format!("could not register nudge eventfd: {:?}", errno);
            error!("new(): {}", &cause);
            unsafe { libc::close(nudge_fd) };
            unsafe { libc::close(epoll_fd) };
            return Err(Fail::new(errno, &cause));
        }

        let (tx, rx): (Sender<ReactorCmd>, Receiver<ReactorCmd>) = ::crossbeam_channel::unbounded();
        let thread: JoinHandle<()> = match thread::Builder::new()
            .name("spindle-reactor".to_string())
            .spawn(move || event_loop(epoll_fd, nudge_fd, rx))
        {
            Ok(thread) => thread,
            Err(e) => {
                unsafe { libc::close(nudge_fd) };
                unsafe { libc::close(epoll_fd) };
                return Err(e.into());
            },
        };

        Ok(Self(Arc::new(EventLoopInner {
            tx,
            nudge_fd,
            thread: Mutex::new(Some(thread)),
            stopped: AtomicBool::new(false),
        })))
    }

    /// Arms a one-shot timer.
    pub fn arm_timer(&self, when: Instant, target: TimerTarget) {
        self.send(ReactorCmd::ArmTimer { when, target });
    }

    /// Watches `fd` for one event delivery to `target`, tagged with the poller-side epoch it was armed under.
    pub(crate) fn arm_fd(&self, fd: RawFd, events: EventFlags, epoch: u64, target: Weak<PollerShared>) {
        self.send(ReactorCmd::ArmFd {
            fd,
            events,
            epoch,
            target,
        });
    }

    /// Stops watching `fd` and blocks until the reactor acknowledged. After this returns, closing the descriptor
    /// cannot race with the reactor. A stopped reactor drops the command, which releases the ack as well.
    pub(crate) fn disarm_fd(&self, fd: RawFd) {
        let (ack_tx, ack_rx): (Sender<()>, Receiver<()>) = ::crossbeam_channel::bounded(1);
        self.send(ReactorCmd::DisarmFd { fd, ack: ack_tx });
        let _ = ack_rx.recv();
    }

    /// Stops the reactor thread and joins it. Idempotent.
    pub fn stop(&self) {
        if self.0.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.0.tx.send(ReactorCmd::Stop).is_ok() {
            self.0.nudge();
        }
        let handle: Option<JoinHandle<()>> = self.0.thread.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("stop(): reactor thread panicked");
            }
        }
    }

    fn send(&self, cmd: ReactorCmd) {
        if self.0.stopped.load(Ordering::Acquire) {
            return;
        }
        if self.0.tx.send(cmd).is_ok() {
            self.0.nudge();
        }
    }
}

impl EventLoopInner {
    /// Pokes the eventfd so a blocked `epoll_wait` returns. A full counter means the reactor is already nudged.
    fn nudge(&self) {
        let value: u64 = 1;
        let _ = unsafe { libc::write(self.nudge_fd, &value as *const u64 as *const libc::c_void, 8) };
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// Body of the reactor thread.
fn event_loop(epoll_fd: RawFd, nudge_fd: RawFd, rx: Receiver<ReactorCmd>) {
    let mut timers: TimerHeap = TimerHeap::new();
    let mut watches: HashMap<RawFd, Watch> = HashMap::new();
    let mut events: Vec<epoll_event> = vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

    'outer: loop {
        // Commands first, so a disarm is honored before its descriptor is touched again.
        while let Ok(cmd) = rx.try_recv() {
            match cmd {
                ReactorCmd::ArmFd {
                    fd,
                    events: interest,
                    epoch,
                    target,
                } => arm_watch(epoll_fd, &mut watches, fd, interest, epoch, target),
                ReactorCmd::DisarmFd { fd, ack } => {
                    if watches.remove(&fd).is_some() {
                        epoll_del(epoll_fd, fd);
                    }
                    let _ = ack.send(());
                },
                ReactorCmd::ArmTimer { when, target } => timers.arm(when, target),
                ReactorCmd::Stop => break 'outer,
            }
        }

        timers.fire_expired(Instant::now());

        let timeout_ms: libc::c_int = match timers.next_expiry() {
            Some(when) => {
                let left: Duration = when.saturating_duration_since(Instant::now());
                // Round up so a timer due in under a millisecond does not turn the wait into a spin.
                let ms: u128 = left.as_micros().div_ceil(1000);
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            },
            None => -1,
        };

        let ready: usize = match unsafe { epoll_wait(epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms) } {
            n if n >= 0 => n as usize,
            _ => {
                let errno: libc::c_int = unsafe { *libc::__errno_location() };
                if errno == EINTR {
                    continue;
                }
                error!("event_loop(): epoll_wait failed: {:?}", errno);
                break;
            },
        };

        for event in &events[..ready] {
            let fd: RawFd = event.u64 as RawFd;
            if fd == nudge_fd {
                drain_nudge(nudge_fd);
                continue;
            }
            // One event per arming: the kernel disabled the one-shot watch, so detach the descriptor until the
            // consumer arms it again.
            if let Some(watch) = watches.remove(&fd) {
                epoll_del(epoll_fd, fd);
                if let Some(poller) = watch.target.upgrade() {
                    poller.deliver(fd, EventFlags::from_epoll(event.events), watch.epoch);
                }
            }
        }
    }

    if unsafe { libc::close(epoll_fd) } != 0 {
        let errno: libc::c_int = unsafe { *libc::__errno_location() };
        warn!("event_loop(): could not close epoll instance: {:?}", errno);
    }
}

fn arm_watch(
    epoll_fd: RawFd,
    watches: &mut HashMap<RawFd, Watch>,
    fd: RawFd,
    interest: EventFlags,
    epoch: u64,
    target: Weak<PollerShared>,
) {
    let op: libc::c_int = if watches.contains_key(&fd) { EPOLL_CTL_MOD } else { EPOLL_CTL_ADD };
    let mut ev: epoll_event = epoll_event {
        events: interest.to_epoll() | EPOLLONESHOT as u32,
        u64: fd as u64,
    };
    match unsafe { epoll_ctl(epoll_fd, op, fd, &mut ev) } {
        0 => {
            watches.insert(fd, Watch { epoch, target });
        },
        _ => {
            let errno: libc::c_int = unsafe { *libc::__errno_location() };
            error!("arm_watch(): could not watch descriptor {}: {:?}", fd, errno);
            // Surface the failure as an error event, otherwise the consumer would wait for a delivery that can
            // never come.
            if let Some(poller) = target.upgrade() {
                poller.deliver(fd, EventFlags::ERROR, epoch);
            }
        },
    }
}

fn epoll_del(epoll_fd: RawFd, fd: RawFd) {
    let mut ev: epoll_event = epoll_event { events: 0, u64: fd as u64 };
    if unsafe { epoll_ctl(epoll_fd, EPOLL_CTL_DEL, fd, &mut ev) } != 0 {
        let errno: libc::c_int = unsafe { *libc::__errno_location() };
        if errno != ENOENT {
            warn!("epoll_del(): could not remove descriptor {}: {:?}", fd, errno);
        }
    }
}

fn drain_nudge(nudge_fd: RawFd) {
    let mut value: u64 = 0;
    let _ = unsafe { libc::read(nudge_fd, &mut value as *mut u64 as *mut libc::c_void, 8) };
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Drop Trait Implementation for the Event Loop
impl Drop for EventLoopInner {
    fn drop(&mut self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            if self.tx.send(ReactorCmd::Stop).is_ok() {
                self.nudge();
            }
            let handle: Option<JoinHandle<()>> = self.thread.lock().unwrap().take();
            if let Some(handle) = handle {
                if handle.join().is_err() {
                    error!("drop(): reactor thread panicked");
                }
            }
        }
        if unsafe { libc::close(self.nudge_fd) } != 0 {
            let errno: libc::c_int = unsafe { *libc::__errno_location() };
            warn!("drop(): could not close nudge eventfd: {:?}", errno);
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::SharedEventLoop;
    use crate::runtime::{
        reactor::timer::TimerTarget,
        task::{
            local::LocalStorage,
            state::{
                SleepToken,
                TaskState,
            },
            Importance,
            TaskContext,
            TaskId,
        },
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

    fn parked_task() -> (Arc<TaskContext>, SleepToken) {
        let ctx: Arc<TaskContext> = Arc::new(TaskContext::new(
            TaskId::from_raw(1),
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
    fn test_event_loop_fires_armed_timer() -> Result<()> {
        let event_loop: SharedEventLoop = SharedEventLoop::new().map_err(|e| anyhow::anyhow!(e))?;
        let (ctx, token) = parked_task();

        event_loop.arm_timer(Instant::now() + Duration::from_millis(10), TimerTarget::Wake {
            task: Arc::downgrade(&ctx),
            token,
        });

        let waited: Instant = Instant::now();
        while ctx.task_state() != TaskState::Queued {
            anyhow::ensure!(waited.elapsed() < Duration::from_secs(5), "timer never fired");
            ::std::thread::sleep(Duration::from_millis(1));
        }

        event_loop.stop();
        Ok(())
    }

    #[test]
    fn test_event_loop_stop_is_idempotent() -> Result<()> {
        let event_loop: SharedEventLoop = SharedEventLoop::new().map_err(|e| anyhow::anyhow!(e))?;
        event_loop.stop();
        event_loop.stop();

        // Commands after stop are dropped, including the blocking disarm.
        event_loop.disarm_fd(0);
        Ok(())
    }
}
