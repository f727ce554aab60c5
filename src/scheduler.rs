//! Cooperative task scheduler
//!
//! The waypoint never owns a thread. It posts its poll turn to a
//! [`Scheduler`], and whatever drives that scheduler decides which thread the
//! turn runs on. [`TaskQueue`] is a plain FIFO that can be pumped by hand
//! (tests do this to control interleavings). [`SchedulerThread`] pumps one
//! on a dedicated OS thread.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Unit of work accepted by a scheduler
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs posted tasks later, in posting order
pub trait Scheduler: Send + Sync {
    /// Enqueue `task`. Must not run it inline.
    fn post(&self, task: Task);
}

// ─────────────────────────────────────────────────────────────────
// Task Queue
// ─────────────────────────────────────────────────────────────────

/// FIFO of posted tasks
pub struct TaskQueue {
    tasks: Mutex<VecDeque<Task>>,
    available: Condvar,
    stopped: AtomicBool,
}

impl TaskQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Run the oldest queued task. Returns false if the queue was empty.
    pub fn run_one(&self) -> bool {
        let task = self.tasks.lock().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Run the tasks queued at the time of the call.
    ///
    /// Tasks posted while these run wait for the next pass, so a task that
    /// reposts itself runs once per pass. Returns the number run.
    pub fn run_pending(&self) -> usize {
        let batch = self.tasks.lock().len();
        let mut ran = 0;
        while ran < batch && self.run_one() {
            ran += 1;
        }
        ran
    }

    /// Block until a task is queued, the queue is stopped, or `timeout`
    pub fn wait(&self, timeout: Duration) {
        let mut tasks = self.tasks.lock();
        if tasks.is_empty() && !self.is_stopped() {
            self.available.wait_for(&mut tasks, timeout);
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further tasks and drop the queued ones
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        // Dropped outside the lock: a task's captures may post on drop.
        let dropped = std::mem::take(&mut *self.tasks.lock());
        drop(dropped);
        self.available.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl Scheduler for TaskQueue {
    fn post(&self, task: Task) {
        if self.is_stopped() {
            return;
        }
        self.tasks.lock().push_back(task);
        self.available.notify_one();
    }
}

// ─────────────────────────────────────────────────────────────────
// Driver Thread
// ─────────────────────────────────────────────────────────────────

/// Dedicated OS thread pumping a [`TaskQueue`]
pub struct SchedulerThread {
    queue: Arc<TaskQueue>,
    handle: Option<JoinHandle<()>>,
}

impl SchedulerThread {
    /// Start a driver thread named `name`.
    ///
    /// Between passes the thread sleeps for `idle_sleep` (or just yields
    /// when it is zero), so a self-reposting poll loop does not spin a core.
    pub fn spawn(name: impl Into<String>, idle_sleep: Duration) -> Result<Self> {
        let name = name.into();
        let queue = TaskQueue::new();
        let worker = Arc::clone(&queue);

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                debug!(thread = %std::thread::current().name().unwrap_or("?"), "Scheduler thread started");
                while !worker.is_stopped() {
                    if worker.run_pending() == 0 {
                        worker.wait(Duration::from_millis(50));
                    } else if idle_sleep.is_zero() {
                        std::thread::yield_now();
                    } else {
                        std::thread::sleep(idle_sleep);
                    }
                }
                debug!("Scheduler thread exiting");
            })
            .map_err(|e| Error::Internal(format!("Failed to spawn scheduler thread '{}': {}", name, e)))?;

        info!(thread = %name, ?idle_sleep, "Scheduler thread spawned");

        Ok(Self {
            queue,
            handle: Some(handle),
        })
    }

    /// Scheduler handle for posting tasks to this thread
    pub fn scheduler(&self) -> Arc<dyn Scheduler> {
        self.queue.clone()
    }

    /// Stop the thread and wait for it to exit
    pub fn shutdown(&mut self) {
        self.queue.stop();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for SchedulerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
