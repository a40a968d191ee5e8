//! Task queues used to run callbacks and transport writes off the I/O thread.

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Unit of work accepted by a [`TaskQueue`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Ordered, asynchronous execution of tasks.
///
/// Implementations must run tasks in submission order.
pub trait TaskQueue: Send + Sync {
    fn submit(&self, task: Task);

    /// Run `task` once `delay` has elapsed. Tasks due at the same instant
    /// run in submission order.
    fn submit_after(&self, delay: Duration, task: Task);
}

/// Runs every task on the submitting thread.
///
/// Useful in tests and for hosts whose transport already calls the engine
/// from a thread it is happy to block.
#[derive(Clone, Copy, Debug, Default)]
pub struct InlineQueue;

impl TaskQueue for InlineQueue {
    fn submit(&self, task: Task) {
        task();
    }

    /// Blocks the submitting thread for `delay`.
    fn submit_after(&self, delay: Duration, task: Task) {
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        task();
    }
}

enum Job {
    Now(Task),
    At(Instant, Task),
}

fn run_guarded(queue: &str, task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        warn!(%queue, "task panicked");
    }
}

/// Worker loop: immediate jobs run as they arrive, timed jobs wait in a
/// deadline-ordered map. Timed jobs still waiting at shutdown are dropped.
fn run_worker(name: &str, receiver: crossbeam_channel::Receiver<Job>) {
    let mut timers: BTreeMap<(Instant, u64), Task> = BTreeMap::new();
    let mut order = 0u64;

    loop {
        let next = match timers.keys().next() {
            Some(&(deadline, _)) => receiver.recv_deadline(deadline),
            None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match next {
            Ok(Job::Now(task)) => run_guarded(name, task),
            Ok(Job::At(deadline, task)) => {
                timers.insert((deadline, order), task);
                order += 1;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        while let Some(entry) = timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            run_guarded(name, entry.remove());
        }
    }

    if !timers.is_empty() {
        debug!(queue = %name, dropped = timers.len(), "dropping delayed tasks");
    }
}

/// A single named worker thread draining an unbounded channel.
pub struct WorkerQueue {
    name: String,
    sender: Mutex<Option<Sender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerQueue {
    /// Spawn the worker thread.
    pub fn spawn(name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let (sender, receiver) = unbounded::<Job>();

        let thread_name = name.clone();
        let worker = thread::Builder::new().name(name.clone()).spawn(move || {
            run_worker(&thread_name, receiver);
            debug!(queue = %thread_name, "worker exiting");
        })?;

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop accepting tasks, let queued ones finish, and join the worker.
    /// Delayed tasks not yet due are dropped.
    ///
    /// Called from the worker itself this only closes the channel.
    pub fn shutdown(&self) {
        self.sender.lock().take();

        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                warn!(queue = %self.name, "worker thread panicked");
            }
        }
    }
}

impl WorkerQueue {
    fn send(&self, job: Job) {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                if sender.send(job).is_err() {
                    warn!(queue = %self.name, "worker gone, task dropped");
                }
            }
            None => warn!(queue = %self.name, "queue shut down, task dropped"),
        }
    }
}

impl TaskQueue for WorkerQueue {
    fn submit(&self, task: Task) {
        self.send(Job::Now(task));
    }

    fn submit_after(&self, delay: Duration, task: Task) {
        self.send(Job::At(Instant::now() + delay, task));
    }
}

impl Drop for WorkerQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
