// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Runtime assembly.
//!
//! A [`Runtime`] owns the pieces every task shares: one reactor thread, one coroutine pool, and one or more task
//! processors with their worker threads. Code inside a task rarely touches it; it reaches its own processor through
//! the current-task context instead.

pub mod coro;
pub mod deadline;
pub mod fail;
pub mod logging;
pub mod network;
pub mod processor;
pub mod reactor;
pub mod sleep;
pub mod sync;
pub mod task;
pub mod wait_list;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    config::{
        Config,
        RuntimeSettings,
    },
    runtime::{
        coro::CoroPool,
        fail::Fail,
        processor::{
            stats::StatsSnapshot,
            worker::try_current_task,
        },
        reactor::event_loop::SharedEventLoop,
        sleep::current_task_or_fail,
        task::{
            handle::TaskHandle,
            Importance,
            TaskContext,
            TaskId,
        },
    },
};
use ::futures::Future;
use ::std::sync::{
    atomic::{
        AtomicBool,
        Ordering,
    },
    Arc,
};

pub use crate::runtime::processor::SharedTaskProcessor;

//======================================================================================================================
// Structures
//======================================================================================================================

/// One assembled runtime instance. Dropping it shuts it down.
pub struct Runtime {
    event_loop: SharedEventLoop,
    processors: Vec<SharedTaskProcessor>,
    /// Raised by the first shutdown; later ones return immediately.
    stopped: AtomicBool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Runtime {
    /// Builds a runtime from a parsed configuration document.
    pub fn new(config: &Config) -> Result<Self, Fail> {
        Self::from_settings(config.runtime_settings()?)
    }

    /// Builds a runtime with default settings: one task processor named "main" and no overload limits.
    pub fn with_defaults() -> Result<Self, Fail> {
        Self::from_settings(RuntimeSettings::default())
    }

    /// Builds a runtime from resolved settings.
    pub fn from_settings(settings: RuntimeSettings) -> Result<Self, Fail> {
        logging::initialize();
        if settings.processors.is_empty() {
            let cause: &str = "a runtime needs at least one task processor";
            error!("from_settings(): {}", cause);
            return Err(Fail::new(libc::EINVAL, cause));
        }
        let event_loop: SharedEventLoop = SharedEventLoop::new()?;
        let pool: Arc<CoroPool> = Arc::new(CoroPool::new(settings.coro_pool.max_size));
        let mut processors: Vec<SharedTaskProcessor> = Vec::with_capacity(settings.processors.len());
        for processor_settings in settings.processors {
            match SharedTaskProcessor::new(processor_settings, pool.clone(), event_loop.clone()) {
                Ok(processor) => processors.push(processor),
                Err(e) => {
                    for processor in &processors {
                        processor.shutdown();
                    }
                    event_loop.stop();
                    return Err(e);
                },
            }
        }
        info!(
            "from_settings(): runtime up with {} task processors and {} coroutine slots",
            processors.len(),
            pool.capacity()
        );
        Ok(Self {
            event_loop,
            processors,
            stopped: AtomicBool::new(false),
        })
    }

    /// Looks a task processor up by name.
    pub fn processor(&self, name: &str) -> Result<SharedTaskProcessor, Fail> {
        match self.processors.iter().find(|processor| processor.name() == name) {
            Some(processor) => Ok(processor.clone()),
            None => {
                let cause: String = format!("no task processor named \"{}\"", name);
                error!("processor(): {}", &cause);
                Err(Fail::new(libc::ENOENT, &cause))
            },
        }
    }

    /// The first-configured processor, which the spawn conveniences below go to.
    pub fn default_processor(&self) -> &SharedTaskProcessor {
        &self.processors[0]
    }

    /// Spawns a future as a Normal task on the default processor.
    pub fn spawn<F>(&self, future: F) -> Result<TaskHandle<F::Output>, Fail>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.processors[0].spawn(future)
    }

    /// Spawns a future on the default processor with an explicit importance class.
    pub fn spawn_with<F>(&self, future: F, importance: Importance) -> Result<TaskHandle<F::Output>, Fail>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.processors[0].spawn_with(future, importance)
    }

    /// Stats snapshots of every processor.
    pub fn stats(&self) -> Vec<StatsSnapshot> {
        self.processors.iter().map(|processor| processor.stats()).collect()
    }

    /// Stops the runtime: cancels and drains every processor, joins their workers, then stops the reactor thread.
    /// Idempotent. Must not be called from a task.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for processor in &self.processors {
            processor.shutdown();
        }
        self.event_loop.stop();
        info!("shutdown(): runtime down");
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// The id of the task the caller runs on, if any.
pub fn current_task_id() -> Option<TaskId> {
    try_current_task().map(|ctx| ctx.id())
}

/// The processor servicing the task the caller runs on.
pub fn current_processor() -> Result<SharedTaskProcessor, Fail> {
    let ctx: Arc<TaskContext> = current_task_or_fail("current_processor")?;
    match ctx.processor() {
        Some(inner) => Ok(SharedTaskProcessor::from_inner(inner)),
        None => Err(Fail::shutting_down("current_processor(): task processor is gone")),
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

/// Drop Trait Implementation for Runtimes
impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        current_task_id,
        Runtime,
    };
    use crate::{
        config::{
            ProcessorSettings,
            RuntimeSettings,
        },
        runtime::task::handle::TaskHandle,
    };
    use ::anyhow::Result;

    #[test]
    fn test_runtime_spawn_and_wait() -> Result<()> {
        let runtime: Runtime = Runtime::with_defaults()?;
        let handle: TaskHandle<i32> = runtime.spawn(async { 40 + 2 })?;
        crate::ensure_eq!(handle.wait()?, 42);
        runtime.shutdown();
        Ok(())
    }

    #[test]
    fn test_runtime_processor_lookup() -> Result<()> {
        let settings: RuntimeSettings = RuntimeSettings {
            processors: vec![ProcessorSettings {
                name: "laser".to_string(),
                worker_threads: 1,
                ..Default::default()
            }],
            ..Default::default()
        };
        let runtime: Runtime = Runtime::from_settings(settings)?;

        crate::ensure_eq!(runtime.processor("laser").is_ok(), true);
        let fail = runtime
            .processor("missing")
            .err()
            .expect("unknown processor names should not resolve");
        crate::ensure_eq!(fail.errno, libc::ENOENT);

        runtime.shutdown();
        Ok(())
    }

    #[test]
    fn test_current_task_id_outside_task() -> Result<()> {
        crate::ensure_eq!(current_task_id(), None);
        Ok(())
    }
}
