//! Submission Queue
//!
//! The only path from application threads into an event loop. Producers
//! push under a mutex and notify; the loop wakes, takes the queue length at
//! that moment and drains exactly that many jobs. Jobs pushed while it
//! drains (including by executables running on the loop) wait for the next
//! wakeup.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

use crate::command::Command;
use crate::error::ClientError;
use crate::event::event_loop::LoopContext;

/// A closure run once on the loop thread.
pub type Executable = Box<dyn FnOnce(&LoopContext) + Send>;

/// Work handed to a loop.
pub enum Job {
    Execute(Executable),
    Command(Box<Command>),
    Stop,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Execute(_) => f.write_str("Job::Execute"),
            Job::Command(cmd) => f.debug_tuple("Job::Command").field(&cmd.id()).finish(),
            Job::Stop => f.write_str("Job::Stop"),
        }
    }
}

/// A job the queue refused, handed back with the reason.
#[derive(Debug)]
pub struct Rejected {
    pub job: Job,
    pub error: ClientError,
}

/// Mutex-guarded job queue plus the loop's wakeup signal.
#[derive(Debug)]
pub struct SubmissionQueue {
    jobs: Mutex<VecDeque<Job>>,
    wakeup: Notify,
    closed: AtomicBool,
    max_size: usize,
}

impl SubmissionQueue {
    /// Creates a queue holding at most `max_size` jobs (0 = unbounded).
    pub fn new(max_size: usize) -> Self {
        Self {
            jobs: Mutex::new(VecDeque::new()),
            wakeup: Notify::new(),
            closed: AtomicBool::new(false),
            max_size,
        }
    }

    /// Enqueues `job` and wakes the loop.
    pub fn push(&self, job: Job) -> Result<(), Rejected> {
        let mut jobs = self.jobs.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(Rejected {
                job,
                error: ClientError::closed("Event loop closed"),
            });
        }
        if self.max_size > 0 && jobs.len() >= self.max_size {
            return Err(Rejected {
                job,
                error: ClientError::queue_full(self.max_size),
            });
        }
        jobs.push_back(job);
        drop(jobs);

        self.wakeup.notify_one();
        Ok(())
    }

    /// Closes the queue to new jobs and enqueues the stop signal, ignoring
    /// the size bound. Returns false if the queue was already closed.
    pub fn push_stop(&self) -> bool {
        let mut jobs = self.jobs.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        jobs.push_back(Job::Stop);
        drop(jobs);

        self.wakeup.notify_one();
        true
    }

    pub fn pop(&self) -> Option<Job> {
        self.jobs.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Waits for the next push. A push with no waiter leaves a permit, so a
    /// wakeup is never lost.
    pub async fn notified(&self) {
        self.wakeup.notified().await;
    }
}
