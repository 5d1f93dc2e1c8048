//! Task schedulers that run pipeline compiles off the calling thread.

use std::io;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread::{self, JoinHandle};

use super::signal::CompletionSignal;
use crate::settings::PipelineCacheSettings;

/// A unit of work handed to a scheduler.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs work on an arbitrary thread and exposes its completion.
pub trait TaskScheduler: Send + Sync {
    /// Queues `job` and returns the signal fired once it has run.
    ///
    /// Implementations must fire the signal even if the job panics.
    fn run_async(&self, job: Job) -> CompletionSignal;
}

/// Completes the signal when dropped, including during unwinding.
struct CompleteOnDrop(CompletionSignal);

impl Drop for CompleteOnDrop {
    fn drop(&mut self) {
        self.0.complete();
    }
}

fn run_job(job: Job, signal: CompletionSignal) {
    let _complete = CompleteOnDrop(signal);
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        log::error!("Pipeline compile job panicked");
    }
}

/// Runs every job immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineScheduler;

impl TaskScheduler for InlineScheduler {
    fn run_async(&self, job: Job) -> CompletionSignal {
        let signal = CompletionSignal::new();
        run_job(job, signal.clone());
        signal
    }
}

/// Fixed pool of named worker threads fed through a `flume` channel.
///
/// Dropping the pool closes the channel; workers finish the queued jobs and
/// are joined.
pub struct WorkerPool {
    sender: Option<flume::Sender<(Job, CompletionSignal)>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(thread_count: usize) -> io::Result<Self> {
        let thread_count = thread_count.max(1);
        let (sender, receiver) = flume::unbounded::<(Job, CompletionSignal)>();

        let mut workers = Vec::with_capacity(thread_count);
        for index in 0..thread_count {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("pso-compile-{index}"))
                .spawn(move || {
                    while let Ok((job, signal)) = receiver.recv() {
                        run_job(job, signal);
                    }
                })?;
            workers.push(handle);
        }

        log::info!("Pipeline compile pool started with {thread_count} worker(s)");
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub fn from_settings(settings: &PipelineCacheSettings) -> io::Result<Self> {
        Self::new(settings.resolved_worker_threads())
    }

    #[inline]
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.workers.len()
    }

    /// Jobs queued but not yet picked up by a worker.
    #[must_use]
    pub fn queued_jobs(&self) -> usize {
        self.sender.as_ref().map_or(0, flume::Sender::len)
    }
}

impl TaskScheduler for WorkerPool {
    fn run_async(&self, job: Job) -> CompletionSignal {
        let signal = CompletionSignal::new();
        let Some(sender) = &self.sender else {
            run_job(job, signal.clone());
            return signal;
        };
        if let Err(flume::SendError((job, signal))) = sender.send((job, signal.clone())) {
            log::warn!("Pipeline compile pool is shut down, compiling inline");
            run_job(job, signal);
        }
        signal
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Pipeline compile worker terminated abnormally");
            }
        }
        log::info!("Pipeline compile pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn inline_scheduler_completes_before_returning() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let signal = InlineScheduler.run_async(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(signal.is_complete());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn worker_pool_runs_all_jobs() {
        let pool = WorkerPool::new(2).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let signals: Vec<_> = (0..16)
            .map(|_| {
                let counter = Arc::clone(&ran);
                pool.run_async(Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }))
            })
            .collect();
        for signal in &signals {
            signal.wait();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn queued_jobs_counts_work_waiting_for_a_worker() {
        let pool = WorkerPool::new(1).unwrap();
        let (started_tx, started_rx) = flume::bounded::<()>(1);
        let (release_tx, release_rx) = flume::bounded::<()>(1);

        let blocker = pool.run_async(Box::new(move || {
            started_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }));
        started_rx.recv().unwrap();

        let queued: Vec<_> = (0..3).map(|_| pool.run_async(Box::new(|| {}))).collect();
        assert_eq!(pool.queued_jobs(), 3);

        release_tx.send(()).unwrap();
        blocker.wait();
        for signal in &queued {
            signal.wait();
        }
        assert_eq!(pool.queued_jobs(), 0);
    }

    #[test]
    fn panicking_job_still_completes_signal() {
        let pool = WorkerPool::new(1).unwrap();
        let signal = pool.run_async(Box::new(|| panic!("boom")));
        signal.wait();
        // The worker survives and keeps serving jobs.
        let next = pool.run_async(Box::new(|| {}));
        next.wait();
        assert!(next.is_complete());
    }
}
