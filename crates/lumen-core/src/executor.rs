//! Worker thread for deferred request completion
//!
//! Handlers that answer later queue a job here instead of completing on the
//! dispatching thread. At shutdown `force_completion` runs whatever is still
//! queued so that no request is left waiting.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Queue {
    jobs: VecDeque<Job>,
    running: usize,
    shutdown: bool,
}

#[derive(Default)]
struct Shared {
    queue: Mutex<Queue>,
    /// Signalled when a job is queued or shutdown is requested
    work: Condvar,
    /// Signalled when a job finishes
    idle: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn run_job(job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".into());
        error!(panic = %message, "Deferred job panicked");
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = shared.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    queue.running += 1;
                    break job;
                }
                if queue.shutdown {
                    return;
                }
                queue = shared
                    .work
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        run_job(job);

        shared.lock().running -= 1;
        shared.idle.notify_all();
    }
}

/// Single worker thread running deferred completions in submission order
pub struct BufferExecutor {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl BufferExecutor {
    pub fn new() -> std::io::Result<Self> {
        let shared = Arc::new(Shared::default());
        let worker = std::thread::Builder::new()
            .name("lumen-buffers".into())
            .spawn({
                let shared = shared.clone();
                move || worker_loop(shared)
            })?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue `job`. After shutdown it runs on the calling thread instead.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        let job: Job = Box::new(job);
        {
            let mut queue = self.shared.lock();
            if !queue.shutdown {
                queue.jobs.push_back(job);
                drop(queue);
                self.shared.work.notify_one();
                return;
            }
        }
        run_job(job);
    }

    /// Jobs queued but not yet started
    pub fn pending(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    /// Run every queued job now on the calling thread and wait for the one
    /// the worker is running, if any
    pub fn force_completion(&self) {
        let drained: Vec<Job> = self.shared.lock().jobs.drain(..).collect();
        if !drained.is_empty() {
            debug!(jobs = drained.len(), "Forcing deferred completions");
        }
        for job in drained {
            run_job(job);
        }

        let mut queue = self.shared.lock();
        while queue.running > 0 {
            queue = self
                .shared
                .idle
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Finish queued work and stop the worker thread. Idempotent.
    pub fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.shared.work.notify_all();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("Buffer executor thread panicked");
            }
        }
    }
}

impl Drop for BufferExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn jobs_run_off_the_calling_thread() {
        let executor = BufferExecutor::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let caller = std::thread::current().id();
        executor.spawn(move || tx.send(std::thread::current().id()).unwrap());

        let worker = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_ne!(worker, caller);
    }

    #[test]
    fn jobs_run_in_submission_order() {
        let executor = BufferExecutor::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = order.clone();
            executor.spawn(move || order.lock().unwrap().push(i));
        }
        executor.force_completion();
        executor.shutdown();
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn force_completion_leaves_nothing_pending() {
        let executor = BufferExecutor::new().unwrap();
        let (release, gate) = mpsc::channel::<()>();
        let done = Arc::new(AtomicUsize::new(0));

        // Park the worker so later jobs stay queued
        executor.spawn(move || {
            let _ = gate.recv_timeout(Duration::from_millis(200));
        });
        for _ in 0..5 {
            let done = done.clone();
            executor.spawn(move || {
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        executor.force_completion();
        drop(release);
        assert_eq!(done.load(Ordering::SeqCst), 5);
        assert_eq!(executor.pending(), 0);
    }

    #[test]
    fn panicking_job_does_not_kill_the_worker() {
        let executor = BufferExecutor::new().unwrap();
        executor.spawn(|| panic!("boom"));
        let (tx, rx) = mpsc::channel();
        executor.spawn(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn spawn_after_shutdown_runs_inline() {
        let executor = BufferExecutor::new().unwrap();
        executor.shutdown();
        executor.shutdown();

        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        executor.spawn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
