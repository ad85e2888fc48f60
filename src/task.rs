//! Cancelable, priority-ordered units of work.
//!
//! A [`PriorityTask`] moves through an explicit lifecycle:
//!
//! ```text
//! INITIAL   -> QUEUED, CANCELED
//! QUEUED    -> INITIAL, EXECUTING, CANCELED
//! EXECUTING -> COMPLETE, CANCELING, ERROR
//! CANCELING -> CANCELED
//! ```
//!
//! COMPLETE, CANCELED and ERROR are terminal. A task fires exactly one batch
//! of terminal callbacks, in registration order, after the terminal transition
//! has been committed. Cancellation of a running task is cooperative: the work
//! body is expected to poll [`TaskContext::cancel_requested`] (or call
//! [`TaskContext::checkpoint`]) and exit promptly once it returns true.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::queue::QueueCore;

/// Global task ID counter
static TASK_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Global admission counter, shared by every queue in the process. Breaks
/// priority ties first-in-first-out, even across queues.
static SEQUENCE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Default scheduling priority.
pub const PRIORITY_DEFAULT: i32 = 0;
/// Runs before default-priority work. Lower value means earlier dispatch.
pub const PRIORITY_FOREGROUND: i32 = -10;
/// Runs after default-priority work.
pub const PRIORITY_BACKGROUND: i32 = 10;

/// Unique identifier for a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        TaskId(TASK_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

fn next_sequence() -> u64 {
    SEQUENCE_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Lifecycle state of a [`PriorityTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Not yet submitted; priority and callbacks are still mutable.
    Initial,
    /// Admitted to a queue, waiting for a worker.
    Queued,
    /// A worker is running the body.
    Executing,
    /// Cancellation requested while executing; waiting for the body to exit.
    Canceling,
    /// Terminal: the task was canceled.
    Canceled,
    /// Terminal: the body failed or panicked.
    Error,
    /// Terminal: the body returned a result.
    Complete,
}

impl State {
    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Canceled | State::Error | State::Complete)
    }
}

/// The work body of a task.
///
/// `execute` runs on a worker thread. Long-running bodies must poll the
/// context at reasonable granularity and bail out once cancellation has been
/// requested; returning `Err(Error::Canceled)` (what `checkpoint` produces)
/// terminates the task as canceled rather than failed.
pub trait TaskBody: Send + 'static {
    type Output: Send + Sync + 'static;

    fn execute(&mut self, ctx: &TaskContext) -> Result<Self::Output>;

    /// Frees a result produced after cancellation was requested. Such a
    /// result is never delivered; it is routed here instead.
    fn discard(&mut self, result: Self::Output) {
        let _ = result;
    }
}

/// Cooperative-cancellation handle passed to the work body.
#[derive(Clone)]
pub struct TaskContext {
    probe: Arc<dyn CancelProbe + Send + Sync>,
}

impl TaskContext {
    /// True once cancellation has been requested for the running task.
    pub fn cancel_requested(&self) -> bool {
        self.probe.cancel_requested()
    }

    /// `Err(Error::Canceled)` once cancellation has been requested, for
    /// `?`-style early exit from the body.
    pub fn checkpoint(&self) -> Result<()> {
        if self.cancel_requested() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("cancel_requested", &self.cancel_requested())
            .finish()
    }
}

trait CancelProbe {
    fn cancel_requested(&self) -> bool;
}

/// Terminal-state listener. All methods default to no-ops; implement the ones
/// you care about. A panicking callback is caught and logged and never stops
/// delivery to the callbacks registered after it.
pub trait Callback<T>: Send {
    fn on_result_available(&self, task: &PriorityTask<T>, result: &T) {
        let _ = (task, result);
    }

    fn on_fail(&self, task: &PriorityTask<T>, error: &Error) {
        let _ = (task, error);
    }

    fn on_canceled(&self, task: &PriorityTask<T>) {
        let _ = task;
    }
}

/// Handle returned by [`PriorityTask::add_callback`], used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

struct Shared<T> {
    state: State,
    priority: i32,
    sequence: u64,
    /// Back-reference to the owning queue, used only to deregister. Weak so
    /// a task handle never keeps a queue alive.
    queue: Weak<QueueCore>,
    /// Executing worker, kept only to deliver a best-effort wake on cancel.
    worker: Option<Thread>,
    result: Option<Arc<T>>,
    error: Option<Error>,
    callbacks: Vec<(CallbackId, Box<dyn Callback<T>>)>,
    next_callback_id: u64,
}

pub(crate) struct TaskInner<T> {
    id: TaskId,
    shared: Mutex<Shared<T>>,
    done: Condvar,
    body: Mutex<Option<Box<dyn TaskBody<Output = T>>>>,
}

/// A cancelable unit of work with a scheduling priority.
///
/// Construct one from a [`TaskBody`] (or a closure via [`from_fn`]), register
/// callbacks, then submit it to a [`PriorityTaskQueue`]. The handle is cheap
/// to clone; all clones observe the same task.
///
/// Results are shared between the completing worker, callbacks and every
/// `get` caller, hence the `T: Send + Sync` bound. Wrap heavyweight payloads
/// in `Arc` if cloning them out of `get` is too expensive.
///
/// [`from_fn`]: PriorityTask::from_fn
/// [`PriorityTaskQueue`]: crate::PriorityTaskQueue
pub struct PriorityTask<T> {
    pub(crate) inner: Arc<TaskInner<T>>,
}

impl<T> Clone for PriorityTask<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for PriorityTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.inner.shared.lock();
        f.debug_struct("PriorityTask")
            .field("id", &self.inner.id)
            .field("state", &st.state)
            .field("priority", &st.priority)
            .finish()
    }
}

impl<T: Send + Sync + 'static> PriorityTask<T> {
    pub fn new<B>(body: B) -> Self
    where
        B: TaskBody<Output = T>,
    {
        Self::with_priority(body, PRIORITY_DEFAULT)
    }

    pub fn with_priority<B>(body: B, priority: i32) -> Self
    where
        B: TaskBody<Output = T>,
    {
        Self {
            inner: Arc::new(TaskInner {
                id: TaskId::next(),
                shared: Mutex::new(Shared {
                    state: State::Initial,
                    priority,
                    sequence: 0,
                    queue: Weak::new(),
                    worker: None,
                    result: None,
                    error: None,
                    callbacks: Vec::new(),
                    next_callback_id: 0,
                }),
                done: Condvar::new(),
                body: Mutex::new(Some(Box::new(body))),
            }),
        }
    }

    /// Builds a task from a closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
    {
        Self::new(FnBody(Some(f), PhantomData))
    }

    pub fn id(&self) -> TaskId {
        self.inner.id
    }

    pub fn state(&self) -> State {
        self.inner.shared.lock().state
    }

    pub fn priority(&self) -> i32 {
        self.inner.shared.lock().priority
    }

    /// Changes the scheduling priority. Only allowed before the task is
    /// queued: once ordering has been established, priority is immutable.
    pub fn set_priority(&self, priority: i32) -> Result<()> {
        let mut st = self.inner.shared.lock();
        if st.state != State::Initial {
            return Err(Error::IllegalState(
                "priority is immutable once the task has been queued",
            ));
        }
        st.priority = priority;
        Ok(())
    }

    /// Registers a terminal-state listener. Only allowed before submission,
    /// which keeps registration race-free against in-flight notification.
    pub fn add_callback<C>(&self, callback: C) -> Result<CallbackId>
    where
        C: Callback<T> + 'static,
    {
        let mut st = self.inner.shared.lock();
        if st.state != State::Initial {
            return Err(Error::IllegalState(
                "callbacks can only be registered before submission",
            ));
        }
        let id = CallbackId(st.next_callback_id);
        st.next_callback_id += 1;
        st.callbacks.push((id, Box::new(callback)));
        Ok(id)
    }

    /// Deregisters a listener. Only allowed before submission. Returns
    /// whether the callback was still registered.
    pub fn remove_callback(&self, id: CallbackId) -> Result<bool> {
        let mut st = self.inner.shared.lock();
        if st.state != State::Initial {
            return Err(Error::IllegalState(
                "callbacks can only be removed before submission",
            ));
        }
        let before = st.callbacks.len();
        st.callbacks.retain(|(cb_id, _)| *cb_id != id);
        Ok(st.callbacks.len() != before)
    }

    /// Requests cancellation.
    ///
    /// Returns true if the request changed the task's trajectory: a task not
    /// yet executing becomes CANCELED on the spot (with immediate callback
    /// dispatch and queue deregistration); an executing task moves to
    /// CANCELING and finishes asynchronously once its body notices. Returns
    /// false if the task already reached a terminal state. Idempotent and
    /// safe to call concurrently with natural completion.
    pub fn request_cancel(&self) -> bool {
        TaskInner::request_cancel_inner(&self.inner)
    }

    /// Blocks until the task reaches a terminal state, then returns the
    /// result, or the cancellation/failure signal.
    pub fn get(&self) -> Result<T>
    where
        T: Clone,
    {
        let mut st = self.inner.shared.lock();
        while !st.state.is_terminal() {
            self.inner.done.wait(&mut st);
        }
        TaskInner::terminal_result(&st)
    }

    /// Bounded [`get`](Self::get). Timing out does not affect the task; it
    /// only stops this caller from waiting.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T>
    where
        T: Clone,
    {
        let deadline = Instant::now().checked_add(timeout);
        let mut st = self.inner.shared.lock();
        while !st.state.is_terminal() {
            match deadline {
                Some(deadline) => {
                    if self.inner.done.wait_until(&mut st, deadline).timed_out() {
                        if st.state.is_terminal() {
                            break;
                        }
                        return Err(Error::Timeout);
                    }
                }
                None => self.inner.done.wait(&mut st),
            }
        }
        TaskInner::terminal_result(&st)
    }

    /// Waits up to `timeout` for the task to reach a terminal state. Returns
    /// whether it did.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut st = self.inner.shared.lock();
        while !st.state.is_terminal() {
            match deadline {
                Some(deadline) => {
                    if self.inner.done.wait_until(&mut st, deadline).timed_out() {
                        return st.state.is_terminal();
                    }
                }
                None => self.inner.done.wait(&mut st),
            }
        }
        true
    }
}

struct FnBody<F, T>(Option<F>, PhantomData<fn() -> T>);

impl<T, F> TaskBody for FnBody<F, T>
where
    T: Send + Sync + 'static,
    F: FnOnce(&TaskContext) -> Result<T> + Send + 'static,
{
    type Output = T;

    fn execute(&mut self, ctx: &TaskContext) -> Result<T> {
        match self.0.take() {
            Some(f) => f(ctx),
            None => Err(Error::IllegalState("task body invoked twice")),
        }
    }
}

/// Type-erased view of a task, as held by the queue and its workers.
pub(crate) trait ErasedTask: Send + Sync {
    fn id(&self) -> TaskId;
    fn run(self: Arc<Self>);
    fn request_cancel(self: Arc<Self>) -> bool;
}

impl<T: Send + Sync + 'static> ErasedTask for TaskInner<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn run(self: Arc<Self>) {
        TaskInner::run_task(&self);
    }

    fn request_cancel(self: Arc<Self>) -> bool {
        TaskInner::request_cancel_inner(&self)
    }
}

impl<T: Send + Sync + 'static> CancelProbe for TaskInner<T> {
    fn cancel_requested(&self) -> bool {
        self.shared.lock().state == State::Canceling
    }
}

enum Disposition<T> {
    Complete(Arc<T>),
    Canceled(Option<T>),
    Failed(Error),
}

impl<T: Send + Sync + 'static> TaskInner<T> {
    /// Admits the task to `core`: INITIAL -> QUEUED, assigning the global
    /// admission sequence. Returns false for a task canceled before
    /// admission. The queue's locks nest inside the task lock here, which is
    /// the fixed order every cross-component operation uses.
    pub(crate) fn admit_to(this: &Arc<Self>, core: &Arc<QueueCore>) -> Result<bool> {
        let mut st = this.shared.lock();
        match st.state {
            State::Canceled => Ok(false),
            State::Initial => {
                let sequence = next_sequence();
                let erased: Arc<dyn ErasedTask> = Arc::clone(this) as Arc<dyn ErasedTask>;
                QueueCore::register(core, erased, st.priority, sequence)?;
                st.state = State::Queued;
                st.sequence = sequence;
                st.queue = Arc::downgrade(core);
                Ok(true)
            }
            _ => Err(Error::IllegalState("task was already submitted to a queue")),
        }
    }

    /// Best-effort de-queue of a still-QUEUED task: on success the task goes
    /// back to INITIAL and can be re-admitted anywhere. Fails once a worker
    /// has claimed the task (or if `core` is not the owning queue).
    pub(crate) fn remove_from(&self, core: &Arc<QueueCore>) -> bool {
        let mut st = self.shared.lock();
        if st.state != State::Queued {
            return false;
        }
        let owned = match st.queue.upgrade() {
            Some(owner) => Arc::ptr_eq(&owner, core),
            None => false,
        };
        if !owned || !core.unqueue(self.id) {
            return false;
        }
        st.state = State::Initial;
        st.sequence = 0;
        st.queue = Weak::new();
        true
    }

    fn request_cancel_inner(this: &Arc<Self>) -> bool {
        let mut st = this.shared.lock();
        match st.state {
            State::Executing | State::Canceling => {
                st.state = State::Canceling;
                // best-effort wake for bodies blocked in park; cancellation
                // stays cooperative either way
                if let Some(worker) = st.worker.as_ref() {
                    worker.unpark();
                }
                true
            }
            State::Initial | State::Queued => {
                st.state = State::Canceled;
                let queue = mem::take(&mut st.queue);
                let callbacks = mem::take(&mut st.callbacks);
                this.done.notify_all();
                drop(st);
                if let Some(core) = queue.upgrade() {
                    core.remove_canceled(this.id);
                }
                let task = PriorityTask {
                    inner: Arc::clone(this),
                };
                fire_canceled(&task, &callbacks);
                *this.body.lock() = None;
                true
            }
            State::Complete | State::Error | State::Canceled => false,
        }
    }

    fn terminal_result(st: &Shared<T>) -> Result<T>
    where
        T: Clone,
    {
        match st.state {
            State::Canceled => Err(Error::Canceled),
            State::Error => Err(st
                .error
                .clone()
                .unwrap_or(Error::IllegalState("failed task lost its error"))),
            State::Complete => match st.result.as_deref() {
                Some(result) => Ok(result.clone()),
                None => Err(Error::IllegalState("completed task lost its result")),
            },
            _ => Err(Error::IllegalState("task has not terminated")),
        }
    }

    /// Drives QUEUED -> EXECUTING -> terminal. Invoked exactly once, by the
    /// worker that claimed the task.
    pub(crate) fn run_task(this: &Arc<Self>) {
        {
            let mut st = this.shared.lock();
            match st.state {
                // canceled after being claimed but before starting; the
                // cancel path already fired callbacks and deregistered
                State::Canceled => return,
                State::Queued => {
                    st.state = State::Executing;
                    st.worker = Some(thread::current());
                }
                state => {
                    error!(task = ?this.id, ?state, "task claimed by a worker outside the QUEUED state");
                    return;
                }
            }
        }

        let ctx = TaskContext {
            probe: Arc::clone(this) as Arc<dyn CancelProbe + Send + Sync>,
        };
        let executed = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut body = this.body.lock();
            match body.as_mut() {
                Some(body) => body.execute(&ctx),
                None => Err(Error::IllegalState("task body is missing")),
            }
        }));

        let mut st = this.shared.lock();
        let canceling = st.state == State::Canceling;
        st.worker = None;
        st.queue = Weak::new();
        let callbacks = mem::take(&mut st.callbacks);
        let disposition = match executed {
            Ok(Ok(result)) => {
                if canceling {
                    st.state = State::Canceled;
                    Disposition::Canceled(Some(result))
                } else {
                    let result = Arc::new(result);
                    st.state = State::Complete;
                    st.result = Some(Arc::clone(&result));
                    Disposition::Complete(result)
                }
            }
            Ok(Err(Error::Canceled)) => {
                st.state = State::Canceled;
                Disposition::Canceled(None)
            }
            Ok(Err(err)) => {
                if canceling {
                    warn!(task = ?this.id, error = %err, "error discarded, task was already canceling");
                    st.state = State::Canceled;
                    Disposition::Canceled(None)
                } else {
                    st.state = State::Error;
                    st.error = Some(err.clone());
                    Disposition::Failed(err)
                }
            }
            Err(payload) => {
                let message = panic_message(payload);
                if canceling {
                    warn!(task = ?this.id, panic = %message, "panic discarded, task was already canceling");
                    st.state = State::Canceled;
                    Disposition::Canceled(None)
                } else {
                    let err = Error::panicked(message);
                    st.state = State::Error;
                    st.error = Some(err.clone());
                    Disposition::Failed(err)
                }
            }
        };
        this.done.notify_all();
        drop(st);

        let task = PriorityTask {
            inner: Arc::clone(this),
        };
        match disposition {
            Disposition::Complete(result) => {
                fire_result_available(&task, &callbacks, &result);
            }
            Disposition::Canceled(result) => {
                if let Some(result) = result {
                    // result produced after the cancel request: never
                    // delivered, routed through the disposal hook
                    if let Some(body) = this.body.lock().as_mut() {
                        body.discard(result);
                    }
                }
                fire_canceled(&task, &callbacks);
            }
            Disposition::Failed(err) => {
                fire_fail(&task, &callbacks, &err);
            }
        }
        *this.body.lock() = None;
    }
}

type Callbacks<T> = [(CallbackId, Box<dyn Callback<T>>)];

fn fire_result_available<T>(task: &PriorityTask<T>, callbacks: &Callbacks<T>, result: &T) {
    for (id, callback) in callbacks {
        let fired = panic::catch_unwind(AssertUnwindSafe(|| {
            callback.on_result_available(task, result);
        }));
        log_callback_panic(*id, fired);
    }
}

fn fire_fail<T>(task: &PriorityTask<T>, callbacks: &Callbacks<T>, err: &Error) {
    for (id, callback) in callbacks {
        let fired = panic::catch_unwind(AssertUnwindSafe(|| {
            callback.on_fail(task, err);
        }));
        log_callback_panic(*id, fired);
    }
}

fn fire_canceled<T>(task: &PriorityTask<T>, callbacks: &Callbacks<T>) {
    for (id, callback) in callbacks {
        let fired = panic::catch_unwind(AssertUnwindSafe(|| {
            callback.on_canceled(task);
        }));
        log_callback_panic(*id, fired);
    }
}

fn log_callback_panic(id: CallbackId, fired: thread::Result<()>) {
    if let Err(payload) = fired {
        error!(callback = ?id, panic = %panic_message(payload), "ignoring panic in task callback");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never_runs() -> PriorityTask<i32> {
        PriorityTask::from_fn(|_| Ok(0))
    }

    #[test]
    fn test_new_task_is_initial() {
        let task = never_runs();
        assert_eq!(task.state(), State::Initial);
        assert_eq!(task.priority(), PRIORITY_DEFAULT);
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = never_runs();
        let b = never_runs();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_set_priority_on_initial() {
        let task = never_runs();
        task.set_priority(PRIORITY_FOREGROUND).unwrap();
        assert_eq!(task.priority(), PRIORITY_FOREGROUND);
    }

    #[test]
    fn test_set_priority_rejected_once_terminal() {
        let task = never_runs();
        assert!(task.request_cancel());
        assert!(matches!(
            task.set_priority(1),
            Err(Error::IllegalState(_))
        ));
    }

    #[test]
    fn test_cancel_before_submission() {
        let task = never_runs();
        assert!(task.request_cancel());
        assert_eq!(task.state(), State::Canceled);
        // second request is a no-op on an already-terminal task
        assert!(!task.request_cancel());
        // never blocks: the task is already terminal
        assert!(matches!(task.get(), Err(Error::Canceled)));
    }

    #[test]
    fn test_callback_registration_rejected_once_terminal() {
        struct Nop;
        impl Callback<i32> for Nop {}

        let task = never_runs();
        let id = task.add_callback(Nop).unwrap();
        assert!(task.remove_callback(id).unwrap());
        assert!(!task.remove_callback(id).unwrap());

        task.request_cancel();
        assert!(task.add_callback(Nop).is_err());
        assert!(task.remove_callback(id).is_err());
    }

    #[test]
    fn test_wait_timeout_on_terminal_task() {
        let task = never_runs();
        task.request_cancel();
        assert!(task.wait_timeout(Duration::ZERO));
    }

    #[test]
    fn test_get_timeout_on_unsubmitted_task() {
        let task = never_runs();
        assert!(matches!(
            task.get_timeout(Duration::from_millis(10)),
            Err(Error::Timeout)
        ));
        // timing out never changes task state
        assert_eq!(task.state(), State::Initial);
    }
}
