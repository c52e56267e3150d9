//! Per-plugin delayed-job scheduler.
//!
//! Each plugin owns one scheduler thread fed through a channel. Jobs run in
//! submission order on that thread.

use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread::{self, ThreadId};
use std::time::Duration;

use tracing::debug;

use crate::{LuaCordError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A single dedicated scheduler thread.
pub struct Scheduler {
    plugin: String,
    jobs: Mutex<Option<Sender<Job>>>,
    thread_id: ThreadId,
}

impl Scheduler {
    /// Spawn the scheduler thread for `plugin`.
    pub fn start(plugin: &str) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Job>();
        let name = format!("luacord-scheduler-{plugin}");
        let handle = thread::Builder::new().name(name).spawn(move || {
            // Ends once every sender is dropped.
            for job in rx {
                job();
            }
        })?;

        debug!(plugin, "Scheduler started");
        Ok(Self {
            plugin: plugin.to_string(),
            jobs: Mutex::new(Some(tx)),
            thread_id: handle.thread().id(),
        })
    }

    /// Run `job` on the scheduler thread after `delay` and block until it
    /// has finished, returning its result.
    ///
    /// # Deadlock
    ///
    /// The calling thread waits for the scheduler thread. Calling this from
    /// a job already running on the same scheduler never returns, since the
    /// scheduler cannot start the new job until the current one finishes.
    pub fn run_delayed<T, F>(&self, delay: Duration, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (done_tx, done_rx) = mpsc::channel();
        let wrapped: Job = Box::new(move || {
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            let _ = done_tx.send(job());
        });

        {
            let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
            let sender = jobs.as_ref().ok_or_else(|| {
                LuaCordError::Scheduler(format!("scheduler of {} is shut down", self.plugin))
            })?;
            sender.send(wrapped).map_err(|_| {
                LuaCordError::Scheduler(format!("scheduler of {} has stopped", self.plugin))
            })?;
        }

        done_rx.recv().map_err(|_| {
            LuaCordError::Scheduler(format!("delayed job of {} did not complete", self.plugin))
        })
    }

    /// Whether the current thread is this scheduler's thread.
    pub fn is_scheduler_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    pub fn is_running(&self) -> bool {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Stop accepting jobs. Queued jobs still run; the thread exits after
    /// the last one.
    pub fn shutdown(&self) {
        let sender = self.jobs.lock().unwrap_or_else(|e| e.into_inner()).take();
        if sender.is_some() {
            debug!(plugin = %self.plugin, "Scheduler shut down");
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
