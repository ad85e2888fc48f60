// worker thread lifecycle
use super::{QueueCore, ReadyState};
use crate::error::{Error, Result};
use crate::task::ErasedTask;
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::trace;

/// Spawns one worker. Called with the ready lock held; the new thread blocks
/// on that same lock until the caller releases it.
pub(crate) fn spawn_worker(core: &Arc<QueueCore>, ready: &mut ReadyState) -> Result<()> {
    let id = ready.next_worker;
    ready.next_worker += 1;

    let name = format!("{}-{}", core.config.thread_name_prefix, id);
    let mut builder = thread::Builder::new().name(name);
    if let Some(stack_size) = core.config.stack_size {
        builder = builder.stack_size(stack_size);
    }

    let core = Arc::clone(core);
    builder
        .spawn(move || run_worker(core, id))
        .map_err(|e| Error::Spawn(e.to_string()))?;
    ready.live += 1;
    Ok(())
}

fn run_worker(core: Arc<QueueCore>, id: usize) {
    trace!(worker = id, "worker started");
    loop {
        let entry = {
            let mut ready = core.ready.lock();
            loop {
                if let Some(entry) = ready.heap.pop() {
                    break Some(entry);
                }
                if core.is_shut_down() {
                    // drained; exit. The decrement happens under the lock so
                    // admissions never count a worker that is already gone.
                    ready.live -= 1;
                    break None;
                }

                ready.idle += 1;
                let timed_out = if ready.live > core.config.core_size {
                    // surplus worker: bounded wait, retire when it expires
                    match Instant::now().checked_add(core.config.keep_alive) {
                        Some(deadline) => {
                            core.available.wait_until(&mut ready, deadline).timed_out()
                        }
                        None => {
                            core.available.wait(&mut ready);
                            false
                        }
                    }
                } else {
                    core.available.wait(&mut ready);
                    false
                };
                ready.idle -= 1;

                if timed_out && ready.heap.is_empty() && ready.live > core.config.core_size {
                    ready.live -= 1;
                    break None;
                }
            }
        };

        match entry {
            Some(entry) => {
                let task = entry.task;
                let task_id = task.id();
                // panics inside the body are caught and turned into the
                // task's failure state, never unwound into this thread
                ErasedTask::run(task);
                core.after_execute(task_id);
            }
            None => {
                trace!(worker = id, "worker exiting");
                break;
            }
        }
    }
}
