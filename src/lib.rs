// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Spindle is a cooperative task-scheduling runtime for building
//! high-throughput network services: a fixed pool of worker threads runs many
//! lightweight logical tasks that suspend on I/O, timers, or synchronization
//! primitives instead of blocking a worker thread.

#![cfg_attr(feature = "strict", deny(warnings))]
#![deny(clippy::all)]

#[macro_use]
extern crate log;

use ::mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

::cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("spindle requires epoll and eventfd and only builds on linux");
    }
}

pub mod collections;
pub mod config;
pub mod runtime;

pub use crate::{
    config::{
        Config,
        CoroPoolSettings,
        ProcessorSettings,
        RuntimeSettings,
    },
    runtime::{
        deadline::Deadline,
        fail::Fail,
        network::{
            pipe::Pipe,
            socket::{
                Listener,
                Socket,
            },
        },
        processor::stats::StatsSnapshot,
        reactor::{
            EventFlags,
            PollStatus,
            Poller,
            PollerEvent,
        },
        sleep::{
            cancellation_point,
            sleep_for,
            sleep_until,
            yield_now,
            CancellationBlocker,
        },
        sync::{
            condvar::{
                Condvar,
                CvStatus,
            },
            mutex::{
                Mutex,
                MutexGuard,
            },
            semaphore::{
                Semaphore,
                SemaphoreLock,
            },
        },
        task::{
            handle::{
                SharedTaskHandle,
                TaskHandle,
            },
            local::{
                InheritedTaskLocal,
                TaskLocal,
            },
            state::TaskState,
            CancellationReason,
            Importance,
            TaskId,
        },
        current_processor,
        current_task_id,
        Runtime,
        SharedTaskProcessor,
    },
};

/// Ensures that two expressions are equal, bailing out of the calling
/// function with an error otherwise.
#[macro_export]
macro_rules! ensure_eq {
    ($left:expr, $right:expr) => {{
        let left = $left;
        let right = $right;
        ::anyhow::ensure!(
            left == right,
            "ensure_eq!({}, {}) failed, left: {:?}, right: {:?}",
            stringify!($left),
            stringify!($right),
            left,
            right,
        );
    }};
}

/// Ensures that two expressions are not equal, bailing out of the calling
/// function with an error otherwise.
#[macro_export]
macro_rules! ensure_neq {
    ($left:expr, $right:expr) => {{
        let left = $left;
        let right = $right;
        ::anyhow::ensure!(
            left != right,
            "ensure_neq!({}, {}) failed, both: {:?}",
            stringify!($left),
            stringify!($right),
            left,
        );
    }};
}
