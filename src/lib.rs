//! Cancelable, priority-ordered task execution on a bounded worker pool.
//!
//! A [`PriorityTask`] is a unit of work with an explicit lifecycle state
//! machine, a signed scheduling priority and terminal-state callbacks. A
//! [`PriorityTaskQueue`] admits tasks onto a pool of worker threads that
//! always dispatch the lowest `(priority, sequence)` pair next, so a
//! higher-priority task overtakes queued work but never preempts a running
//! body. Cancellation is cooperative: bodies poll their [`TaskContext`] and
//! exit early once a cancel has been requested.
//!
//! # Quick Start
//!
//! ```
//! use priotask::{PriorityTask, PriorityTaskQueue, PRIORITY_FOREGROUND};
//!
//! let queue = PriorityTaskQueue::fixed(2).unwrap();
//!
//! let task = PriorityTask::from_fn(|_ctx| Ok(21 * 2));
//! task.set_priority(PRIORITY_FOREGROUND).unwrap();
//!
//! assert!(queue.add(&task).unwrap());
//! assert_eq!(task.get().unwrap(), 42);
//!
//! queue.shutdown();
//! ```

#![warn(missing_docs, missing_debug_implementations)]
#![allow(dead_code)]

pub mod config;
pub mod error;
pub mod queue;
pub mod task;

pub use config::{QueueConfig, QueueConfigBuilder};
pub use error::{Error, Result};
pub use queue::PriorityTaskQueue;
pub use task::{
    Callback, CallbackId, PriorityTask, State, TaskBody, TaskContext, TaskId, PRIORITY_BACKGROUND,
    PRIORITY_DEFAULT, PRIORITY_FOREGROUND,
};
