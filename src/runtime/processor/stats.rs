// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::histogram::Histogram;
use ::std::{
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Mutex,
    },
    time::Duration,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Histogram sizing: 7 bits of grouping precision over the full u64 range of microsecond values.
const HISTOGRAM_GROUPING_POWER: u8 = 7;
const HISTOGRAM_MAX_VALUE_POWER: u8 = 64;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Counters of one task processor. All counters are approximate: they are updated with relaxed atomics and read
/// without any snapshot barrier.
pub struct ProcessorStats {
    /// Tasks admitted by spawn.
    created: AtomicU64,
    /// Tasks that ran at least once.
    started: AtomicU64,
    /// Tasks that reached a terminal state, including cancelled ones.
    finished: AtomicU64,
    /// Tasks whose terminal state was cancelled.
    cancelled: AtomicU64,
    /// Tasks shed by overload control before running.
    shed_overload: AtomicU64,
    /// Wakeups that bounced off a consumed sleep cycle.
    stale_wakeups: AtomicU64,
    /// Tasks that finished by panicking.
    panicked: AtomicU64,
    /// Time tasks spent in the run queue, in microseconds.
    queue_wait: Mutex<Histogram>,
}

/// Point-in-time view of a processor's counters.
#[derive(Clone, Debug)]
pub struct StatsSnapshot {
    pub name: String,
    pub created: u64,
    pub started: u64,
    pub finished: u64,
    pub cancelled: u64,
    pub shed_overload: u64,
    pub stale_wakeups: u64,
    pub panicked: u64,
    /// Approximate run queue depth at snapshot time.
    pub queue_depth: usize,
    /// Tasks spawned on this processor that have not finished.
    pub live_tasks: usize,
    pub queue_wait_p50_us: Option<u64>,
    pub queue_wait_p99_us: Option<u64>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ProcessorStats {
    pub(crate) fn new() -> Result<Self, Fail> {
        let queue_wait: Histogram = match Histogram::new(HISTOGRAM_GROUPING_POWER, HISTOGRAM_MAX_VALUE_POWER) {
            Ok(histogram) => histogram,
            Err(e) => {
                let cause: String = format!("could not create queue wait histogram: {:?}", e);
                error!("new(): {}", &cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        Ok(Self {
            created: AtomicU64::new(0),
            started: AtomicU64::new(0),
            finished: AtomicU64::new(0),
            cancelled: AtomicU64::new(0),
            shed_overload: AtomicU64::new(0),
            stale_wakeups: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            queue_wait: Mutex::new(queue_wait),
        })
    }

    pub(crate) fn count_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_finished(&self, cancelled: bool) {
        self.finished.fetch_add(1, Ordering::Relaxed);
        if cancelled {
            self.cancelled.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn count_shed_overload(&self) {
        self.shed_overload.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_stale_wakeup(&self) {
        self.stale_wakeups.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_panicked(&self) {
        self.panicked.fetch_add(1, Ordering::Relaxed);
    }

    /// Records how long a dequeued task sat in the run queue.
    pub(crate) fn record_queue_wait(&self, wait: Duration) {
        let micros: u64 = wait.as_micros().min(u64::MAX as u128) as u64;
        // Recording errors only mean the value fell outside the histogram range.
        let _ = self.queue_wait.lock().unwrap().increment(micros);
    }

    pub(crate) fn snapshot(&self, name: &str, queue_depth: usize, live_tasks: usize) -> StatsSnapshot {
        let (p50, p99): (Option<u64>, Option<u64>) = {
            let queue_wait = self.queue_wait.lock().unwrap();
            // A percentile comes back empty until the first sample lands.
            (
                queue_wait.percentile(50.0).ok().flatten().map(|bucket| bucket.start()),
                queue_wait.percentile(99.0).ok().flatten().map(|bucket| bucket.start()),
            )
        };
        StatsSnapshot {
            name: name.to_string(),
            created: self.created.load(Ordering::Relaxed),
            started: self.started.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            shed_overload: self.shed_overload.load(Ordering::Relaxed),
            stale_wakeups: self.stale_wakeups.load(Ordering::Relaxed),
            panicked: self.panicked.load(Ordering::Relaxed),
            queue_depth,
            live_tasks,
            queue_wait_p50_us: p50,
            queue_wait_p99_us: p99,
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
