use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use crate::types::{GraphError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Queued {
    name: &'static str,
    job: Job,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<Queued>,
    stopped: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<QueueState>,
    available: Condvar,
}

struct Slot<T> {
    result: Mutex<Option<Result<T>>>,
    ready: Condvar,
}

impl<T> Slot<T> {
    fn complete(&self, value: Result<T>) {
        let mut result = self.result.lock();
        if result.is_none() {
            *result = Some(value);
        }
        self.ready.notify_all();
    }
}

/// Completes its slot with an error if the job is dropped before running.
struct Completer<T> {
    slot: Arc<Slot<T>>,
    done: bool,
}

impl<T> Completer<T> {
    fn finish(mut self, value: T) {
        self.done = true;
        self.slot.complete(Ok(value));
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if !self.done {
            self.slot
                .complete(Err(GraphError::Shutdown("task did not complete")));
        }
    }
}

/// Handle to the result of a submitted task.
pub struct TaskHandle<T> {
    slot: Arc<Slot<T>>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task ran, or was cancelled.
    pub fn wait(self) -> Result<T> {
        let mut result = self.slot.result.lock();
        loop {
            if let Some(value) = result.take() {
                return value;
            }
            self.slot.ready.wait(&mut result);
        }
    }
}

/// Fixed pool of worker threads draining a FIFO task queue.
pub struct TaskScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskScheduler {
    /// Spawns `threads` workers (at least one).
    pub fn new(threads: usize) -> Result<Self> {
        let threads = threads.max(1);
        let shared = Arc::new(Shared::default());
        let mut workers = Vec::with_capacity(threads);
        for idx in 0..threads {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("lsmgraph-worker-{idx}"))
                .spawn(move || worker_loop(shared))?;
            workers.push(handle);
        }
        debug!(threads, "scheduler.start");
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Queues `task`; fails with `Shutdown` once the scheduler was cancelled.
    pub fn submit<F, T>(&self, name: &'static str, task: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::new(Slot {
            result: Mutex::new(None),
            ready: Condvar::new(),
        });
        let completer = Completer {
            slot: Arc::clone(&slot),
            done: false,
        };
        let job: Job = Box::new(move || completer.finish(task()));
        {
            let mut queue = self.shared.queue.lock();
            if queue.stopped {
                return Err(GraphError::Shutdown("task scheduler stopped"));
            }
            queue.jobs.push_back(Queued { name, job });
        }
        self.shared.available.notify_one();
        trace!(task = name, "scheduler.submit");
        Ok(TaskHandle { slot })
    }

    /// Drops every queued task and stops accepting new ones. Tasks already
    /// running finish normally. Returns the number of tasks dropped.
    pub fn cancel_all_tasks(&self) -> usize {
        let dropped: Vec<Queued> = {
            let mut queue = self.shared.queue.lock();
            queue.stopped = true;
            queue.jobs.drain(..).collect()
        };
        self.shared.available.notify_all();
        let count = dropped.len();
        drop(dropped);
        if count > 0 {
            debug!(dropped = count, "scheduler.cancel");
        }
        count
    }

    /// Cancels queued work and joins every worker.
    pub fn shutdown(&self) {
        self.cancel_all_tasks();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                error!("scheduler.worker_panicked");
            }
        }
    }

    /// True once [`TaskScheduler::cancel_all_tasks`] ran.
    pub fn is_stopped(&self) -> bool {
        self.shared.queue.lock().stopped
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Worker count used when none is configured.
pub fn default_parallelism() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let next = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(next) = queue.jobs.pop_front() {
                    break next;
                }
                if queue.stopped {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };
        let name = next.name;
        if panic::catch_unwind(AssertUnwindSafe(next.job)).is_err() {
            error!(task = name, "scheduler.task_panicked");
        }
    }
}
