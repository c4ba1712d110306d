// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

pub mod stats;
pub mod worker;

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    collections::id_map::IdMap,
    config::ProcessorSettings,
    runtime::{
        coro::CoroPool,
        fail::Fail,
        processor::stats::{
            ProcessorStats,
            StatsSnapshot,
        },
        reactor::event_loop::SharedEventLoop,
        task::{
            handle::{
                ResultCell,
                TaskHandle,
            },
            local::LocalStorage,
            CancellationReason,
            Importance,
            TaskContext,
            TaskId,
        },
    },
};
use ::crossbeam_channel::{
    unbounded,
    Receiver,
    Sender,
};
use ::std::{
    future::Future,
    sync::{
        atomic::{
            AtomicBool,
            AtomicUsize,
            Ordering,
        },
        Arc,
        Condvar,
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

/// How often shutdown re-sweeps the registry while draining. The re-sweep catches tasks whose spawn raced with the
/// stopping flag.
const SHUTDOWN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

//======================================================================================================================
// Structures
//======================================================================================================================

/// One entry of the run queue.
pub(crate) enum RunItem {
    /// A runnable task, stamped with its enqueue time.
    Task(Arc<TaskContext>, Instant),
    /// Tells exactly one worker to exit.
    Stop,
}

/// Shared innards of one task processor.
pub(crate) struct ProcessorInner {
    /// Name, unique within the runtime.
    name: String,
    /// Settings the processor was built from.
    settings: ProcessorSettings,
    /// Producer side of the run queue.
    queue_tx: Sender<RunItem>,
    /// Consumer side of the run queue, shared by all workers.
    queue_rx: Receiver<RunItem>,
    /// Approximate number of task items in the run queue.
    queue_len: AtomicUsize,
    /// Live tasks spawned on this processor.
    registry: Mutex<IdMap<TaskId, Weak<TaskContext>>>,
    /// Signaled by [`Self::retire_task`] when the registry drains to empty.
    drained: Condvar,
    /// Counters.
    stats: ProcessorStats,
    /// Reactor shared by every processor of the runtime.
    event_loop: SharedEventLoop,
    /// Coroutine pool shared by every processor of the runtime.
    pool: Arc<CoroPool>,
    /// Worker thread handles, taken by shutdown.
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Raised when shutdown begins. Spawns fail afterwards.
    stopping: AtomicBool,
}

/// Handle on one task processor. Cheap to clone; all clones drive the same worker pool.
#[derive(Clone)]
pub struct SharedTaskProcessor {
    inner: Arc<ProcessorInner>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl ProcessorInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn stats(&self) -> &ProcessorStats {
        &self.stats
    }

    pub(crate) fn event_loop(&self) -> &SharedEventLoop {
        &self.event_loop
    }

    pub(super) fn pool(&self) -> &CoroPool {
        &self.pool
    }

    pub(super) fn queue_wait_limit(&self) -> Option<Duration> {
        self.settings.queue_wait_limit
    }

    /// Blocks until a run item arrives. `None` means the queue is gone.
    pub(super) fn recv_item(&self) -> Option<RunItem> {
        self.queue_rx.recv().ok()
    }

    pub(super) fn note_dequeued(&self) {
        self.queue_len.fetch_sub(1, Ordering::Relaxed);
    }

    fn queue_depth(&self) -> usize {
        self.queue_len.load(Ordering::Relaxed)
    }

    fn live_tasks(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Puts a runnable task on the run queue.
    pub(crate) fn enqueue(&self, task: Arc<TaskContext>) {
        self.queue_len.fetch_add(1, Ordering::Relaxed);
        // Both channel ends live in this struct, so the send only fails when the processor itself is being torn
        // down. A task lost here is terminal or about to be.
        if self.queue_tx.send(RunItem::Task(task, Instant::now())).is_err() {
            self.queue_len.fetch_sub(1, Ordering::Relaxed);
            warn!("enqueue(): run queue of processor {} is gone", self.name);
        }
    }

    /// Releases the bookkeeping of a task whose state machine the caller already moved to terminal. Anything the
    /// task's waiters read, the result cell and the panic slot included, must be in place before that transition.
    pub(super) fn retire_task(&self, task: &Arc<TaskContext>, cancelled: bool) {
        self.pool.release(task.slot());
        {
            let mut registry = self.registry.lock().unwrap();
            registry.remove(&task.id());
            if registry.is_empty() {
                self.drained.notify_all();
            }
        }
        self.stats.count_finished(cancelled);
        task.notify_finished();
    }
}

impl SharedTaskProcessor {
    /// Builds a processor and starts its worker threads.
    pub(crate) fn new(
        settings: ProcessorSettings,
        pool: Arc<CoroPool>,
        event_loop: SharedEventLoop,
    ) -> Result<Self, Fail> {
        let (queue_tx, queue_rx): (Sender<RunItem>, Receiver<RunItem>) = unbounded();
        let inner: Arc<ProcessorInner> = Arc::new(ProcessorInner {
            name: settings.name.clone(),
            queue_tx,
            queue_rx,
            queue_len: AtomicUsize::new(0),
            registry: Mutex::new(IdMap::default()),
            drained: Condvar::new(),
            stats: ProcessorStats::new()?,
            event_loop,
            pool,
            workers: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
            settings,
        });

        let mut workers: Vec<JoinHandle<()>> = Vec::with_capacity(inner.settings.worker_threads);
        for index in 0..inner.settings.worker_threads {
            let worker_inner: Arc<ProcessorInner> = inner.clone();
            let builder: thread::Builder = thread::Builder::new().name(format!("{}-{}", inner.name, index));
            match builder.spawn(move || worker::worker_main(worker_inner)) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    // Unwind the workers launched so far before reporting the failure.
                    for _ in 0..workers.len() {
                        let _ = inner.queue_tx.send(RunItem::Stop);
                    }
                    for handle in workers {
                        let _ = handle.join();
                    }
                    let cause: String = format!("could not spawn worker thread for processor {}: {}", inner.name, e);
                    error!("new(): {}", &cause);
                    return Err(Fail::new(libc::EAGAIN, &cause));
                },
            }
        }
        *inner.workers.lock().unwrap() = workers;

        Ok(Self { inner })
    }

    pub(crate) fn from_inner(inner: Arc<ProcessorInner>) -> Self {
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Spawns a future as a Normal task on this processor.
    pub fn spawn<F>(&self, future: F) -> Result<TaskHandle<F::Output>, Fail>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.spawn_with(future, Importance::Normal)
    }

    /// Spawns a future as a task with an explicit importance class.
    ///
    /// Fails with `EAGAIN` when the coroutine pool is exhausted and with `ESHUTDOWN` once the processor is
    /// stopping. The task may still be shed with reason [`CancellationReason::Overload`] after a successful spawn;
    /// that outcome is reported through the handle, never silently.
    pub fn spawn_with<F>(&self, future: F, importance: Importance) -> Result<TaskHandle<F::Output>, Fail>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if self.inner.stopping.load(Ordering::Acquire) {
            let cause: String = format!("processor {} is shutting down", self.inner.name);
            warn!("spawn_with(): {}", &cause);
            return Err(Fail::new(libc::ESHUTDOWN, &cause));
        }

        let slot: usize = self.inner.pool.reserve()?;

        // Inheritable task-locals flow from the spawning task, when there is one.
        let locals: LocalStorage = match worker::try_current_task() {
            Some(parent) => parent.locals.lock().unwrap().snapshot_inherited(),
            None => LocalStorage::default(),
        };

        let cell: Arc<ResultCell<F::Output>> = Arc::new(ResultCell::new());
        let ctx: Arc<TaskContext> = {
            let mut registry = self.inner.registry.lock().unwrap();
            let id: TaskId = registry.insert_with_new_id(Weak::new());
            let ctx: Arc<TaskContext> = Arc::new(TaskContext::new(
                id,
                importance,
                slot,
                Arc::downgrade(&self.inner),
                locals,
            ));
            registry.insert(id, Arc::downgrade(&ctx));
            ctx
        };

        let result_cell: Arc<ResultCell<F::Output>> = cell.clone();
        self.inner.pool.install(
            slot,
            Box::pin(async move {
                result_cell.set(future.await);
            }),
        );

        self.inner.stats.count_created();
        ctx.state().enqueue_new();

        // Admission overload check.
        if let Some(limit) = self.inner.settings.queue_length_limit {
            if importance == Importance::Normal && self.inner.queue_depth() >= limit {
                ctx.request_cancel(CancellationReason::Overload);
            }
        }

        self.inner.enqueue(ctx.clone());
        Ok(TaskHandle::new(ctx, cell))
    }

    /// Stops the processor: live tasks are cancelled with reason [`CancellationReason::Shutdown`], the queue drains
    /// until every task is terminal, then the workers exit and are joined. Idempotent; later calls return at once.
    pub fn shutdown(&self) {
        if worker::try_current_task().is_some() {
            panic!("shutdown() must not be called from inside a task");
        }
        if self.inner.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("shutdown(): draining processor {}", self.inner.name);

        // Drain: cancel everything live, then wait for the workers to run each task to terminal. The sweep repeats
        // so tasks whose spawn raced with the stopping flag are cancelled too.
        let mut registry = self.inner.registry.lock().unwrap();
        while !registry.is_empty() {
            let live: Vec<Weak<TaskContext>> = registry.values().cloned().collect();
            drop(registry);
            for task in live.iter().filter_map(Weak::upgrade) {
                task.request_cancel(CancellationReason::Shutdown);
            }
            registry = self.inner.registry.lock().unwrap();
            if registry.is_empty() {
                break;
            }
            let (guard, _) = self
                .inner
                .drained
                .wait_timeout(registry, SHUTDOWN_SWEEP_INTERVAL)
                .unwrap();
            registry = guard;
        }
        drop(registry);

        // Stop and join the workers. One sentinel per worker; each consumes exactly one.
        let workers: Vec<JoinHandle<()>> = ::std::mem::take(&mut *self.inner.workers.lock().unwrap());
        for _ in 0..workers.len() {
            let _ = self.inner.queue_tx.send(RunItem::Stop);
        }
        for handle in workers {
            if handle.join().is_err() {
                error!("shutdown(): worker of processor {} panicked", self.inner.name);
            }
        }
        debug!("shutdown(): processor {} stopped", self.inner.name);
    }

    /// Point-in-time counters of this processor.
    pub fn stats(&self) -> StatsSnapshot {
        self.inner
            .stats
            .snapshot(&self.inner.name, self.inner.queue_depth(), self.inner.live_tasks())
    }
}
