//! Admission and scheduling of [`PriorityTask`]s onto a bounded worker pool.
//!
//! A queue owns one shared priority-ordered ready list and a pool of worker
//! threads pulling from it. Among tasks that have not started, the worker
//! pool always dispatches the lowest `(priority, sequence)` pair next; a
//! newly added higher-priority task overtakes queued lower-priority work but
//! never preempts a task that is already executing.

mod ready;
mod worker;

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::error::{Error, Result};
use crate::task::{ErasedTask, PriorityTask, TaskId, TaskInner};

use self::ready::ReadyEntry;

#[derive(Default)]
pub(crate) struct ReadyState {
    heap: BinaryHeap<ReadyEntry>,
    /// Workers currently blocked waiting for work.
    idle: usize,
    /// Workers alive (idle or executing).
    live: usize,
    next_worker: usize,
}

#[derive(Default)]
struct ActiveSet {
    /// Every admitted task, queued or executing. The authoritative set for
    /// bulk cancellation and shutdown accounting. Frozen once the queue is
    /// shut down.
    tasks: HashMap<TaskId, Arc<dyn ErasedTask>>,
}

pub(crate) struct QueueCore {
    pub(crate) config: QueueConfig,
    pub(crate) ready: Mutex<ReadyState>,
    pub(crate) available: Condvar,
    active: Mutex<ActiveSet>,
    /// One-way flag. Written only with the `active` lock held so admission
    /// and shutdown enumeration cannot interleave.
    shutdown: AtomicBool,
}

impl QueueCore {
    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Registers an admitted task and hands it to the pool. Called with the
    /// task's lock held (task lock, then queue locks is the fixed order).
    pub(crate) fn register(
        this: &Arc<Self>,
        task: Arc<dyn ErasedTask>,
        priority: i32,
        sequence: u64,
    ) -> Result<()> {
        let task_id = task.id();
        {
            let mut active = this.active.lock();
            if this.is_shut_down() {
                return Err(Error::ShutDown);
            }
            active.tasks.insert(task_id, Arc::clone(&task));
        }

        let mut ready = this.ready.lock();
        ready.heap.push(ReadyEntry::new(priority, sequence, task));
        if ready.idle == 0 && ready.live < this.config.max_size {
            if let Err(err) = worker::spawn_worker(this, &mut ready) {
                if ready.live == 0 {
                    // nobody could ever claim the entry; undo the admission
                    ready.heap.retain(|e| e.task_id() != task_id);
                    drop(ready);
                    this.active.lock().tasks.remove(&task_id);
                    return Err(err);
                }
                warn!(%err, "could not grow worker pool, task stays queued");
            }
        }
        this.available.notify_one();
        Ok(())
    }

    /// Best-effort removal from the ready list. True if the entry was still
    /// there (no worker had claimed it).
    pub(crate) fn unqueue(&self, id: TaskId) -> bool {
        let found = {
            let mut ready = self.ready.lock();
            let before = ready.heap.len();
            ready.heap.retain(|e| e.task_id() != id);
            ready.heap.len() != before
        };
        if found {
            let mut active = self.active.lock();
            if !self.is_shut_down() {
                active.tasks.remove(&id);
            }
        }
        found
    }

    /// Deregisters a task that canceled itself before starting.
    pub(crate) fn remove_canceled(&self, id: TaskId) {
        {
            let mut active = self.active.lock();
            if !self.is_shut_down() {
                active.tasks.remove(&id);
            }
        }
        self.ready.lock().heap.retain(|e| e.task_id() != id);
    }

    /// Post-execution bookkeeping, called by the worker that ran the task.
    pub(crate) fn after_execute(&self, id: TaskId) {
        let mut active = self.active.lock();
        if !self.is_shut_down() {
            active.tasks.remove(&id);
        }
    }

    fn initiate_shutdown(&self) {
        {
            let _active = self.active.lock();
            self.shutdown.store(true, Ordering::Release);
        }
        self.wake_workers();
        debug!("queue shut down");
    }

    fn initiate_shutdown_now(&self) {
        // snapshot under the bookkeeping lock, cancel outside it: cancelling
        // takes each task's own lock, and the fixed lock order is task lock
        // before queue lock, never the reverse
        let snapshot: Vec<Arc<dyn ErasedTask>> = {
            let active = self.active.lock();
            self.shutdown.store(true, Ordering::Release);
            active.tasks.values().cloned().collect()
        };
        let canceled = snapshot.len();
        for task in snapshot {
            ErasedTask::request_cancel(task);
        }
        self.wake_workers();
        debug!(tasks = canceled, "queue shut down, cancellation requested for active tasks");
    }

    /// Wakes every worker so it re-checks the shutdown flag. Taking the
    /// ready lock first means no worker is between its check and its wait.
    fn wake_workers(&self) {
        drop(self.ready.lock());
        self.available.notify_all();
    }
}

/// A bounded pool of worker threads executing [`PriorityTask`]s in
/// `(priority, sequence)` order.
///
/// The queue accepts tasks until [`shutdown`](Self::shutdown) (graceful: the
/// admitted tasks still run) or [`shutdown_now`](Self::shutdown_now) (also
/// requests cancellation of everything admitted). Dropping the queue without
/// an explicit shutdown performs the graceful one as a safety net.
pub struct PriorityTaskQueue {
    core: Arc<QueueCore>,
}

impl PriorityTaskQueue {
    /// Creates a queue with a fixed pool of `size` workers.
    pub fn fixed(size: usize) -> Result<Self> {
        Self::with_config(QueueConfig::fixed(size))
    }

    /// Creates a queue with a dynamic pool: `core_size` resident workers,
    /// growth up to `max_size` under load, surplus workers retired after
    /// `keep_alive` of idleness.
    pub fn with_config(config: QueueConfig) -> Result<Self> {
        config.validate()?;
        let core = Arc::new(QueueCore {
            config,
            ready: Mutex::new(ReadyState::default()),
            available: Condvar::new(),
            active: Mutex::new(ActiveSet::default()),
            shutdown: AtomicBool::new(false),
        });

        {
            let mut ready = core.ready.lock();
            for _ in 0..core.config.core_size {
                if let Err(err) = worker::spawn_worker(&core, &mut ready) {
                    drop(ready);
                    core.initiate_shutdown();
                    return Err(err);
                }
            }
        }
        Ok(Self { core })
    }

    /// Admits a task: INITIAL -> QUEUED, assigns its sequence number and
    /// hands it to the pool.
    ///
    /// Returns `Ok(false)` if the task had already been canceled. A task in
    /// any other non-INITIAL state is a programming error
    /// (`Error::IllegalState`), and admission after shutdown fails loudly
    /// with `Error::ShutDown`.
    pub fn add<T: Send + Sync + 'static>(&self, task: &PriorityTask<T>) -> Result<bool> {
        TaskInner::admit_to(&task.inner, &self.core)
    }

    /// Best-effort removal of a task that has not started executing. On
    /// success the task is back in INITIAL and may be re-admitted, here or
    /// elsewhere. Has no effect on an executing task; use
    /// [`PriorityTask::request_cancel`] for that.
    pub fn remove<T: Send + Sync + 'static>(&self, task: &PriorityTask<T>) -> bool {
        task.inner.remove_from(&self.core)
    }

    /// Stops admitting tasks. Already-admitted tasks, queued or executing,
    /// run to completion. One-way; does not block.
    pub fn shutdown(&self) {
        self.core.initiate_shutdown();
    }

    /// Stops admitting tasks and requests cancellation of every active one.
    /// Does not block waiting for the cancellations to land: await each
    /// task's terminal state if you need a rendezvous.
    pub fn shutdown_now(&self) {
        self.core.initiate_shutdown_now();
    }

    pub fn is_shut_down(&self) -> bool {
        self.core.is_shut_down()
    }

    /// Number of admitted tasks that have not finished. Frozen once the
    /// queue is shut down.
    pub fn active_len(&self) -> usize {
        self.core.active.lock().tasks.len()
    }
}

impl std::fmt::Debug for PriorityTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ready = self.core.ready.lock();
        f.debug_struct("PriorityTaskQueue")
            .field("queued", &ready.heap.len())
            .field("live_workers", &ready.live)
            .field("idle_workers", &ready.idle)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Drop for PriorityTaskQueue {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            self.core.initiate_shutdown();
        }
    }
}
