//! Single-worker priority job queue.
//!
//! A [`Scheduler`] owns one background thread and a context value `C` that
//! only that thread ever touches. Callers hand it closures over `&mut C`;
//! the worker runs them one at a time, lowest [`SchedSpeed`] first, ties in
//! submission order. This is how the client keeps its repository handle and
//! state cache single-threaded without any locking of its own.

use std::any::Any;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use thiserror::Error;
use tracing::{debug, warn};

/// Job priority; lower runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchedSpeed {
    /// Latency-sensitive reads (UI lookups).
    Fast = 1,
    Average = 2,
    /// Background repository traffic.
    Slow = 3,
}

/// Why a waited-on job produced no value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FailedJob {
    #[error("job did not finish within {0:?}")]
    Timeout(Duration),
    #[error("job panicked: {0}")]
    Panicked(String),
    #[error("scheduler worker is not running")]
    WorkerGone,
}

type Task<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

struct Queued<C> {
    speed: SchedSpeed,
    seq: u64,
    task: Task<C>,
}

impl<C> PartialEq for Queued<C> {
    fn eq(&self, other: &Self) -> bool {
        (self.speed, self.seq) == (other.speed, other.seq)
    }
}

impl<C> Eq for Queued<C> {}

impl<C> PartialOrd for Queued<C> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for Queued<C> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.speed, self.seq).cmp(&(other.speed, other.seq))
    }
}

struct Queue<C> {
    heap: BinaryHeap<Reverse<Queued<C>>>,
    next_seq: u64,
    shutdown: bool,
}

struct Shared<C> {
    queue: Mutex<Queue<C>>,
    ready: Condvar,
}

impl<C> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, Queue<C>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Scheduler<C: Send + 'static> {
    shared: Arc<Shared<C>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<C: Send + 'static> Scheduler<C> {
    /// Spawn the worker thread, moving `context` onto it.
    pub fn start(name: &str, context: C) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue { heap: BinaryHeap::new(), next_seq: 0, shutdown: false }),
            ready: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(&worker_shared, context))?;
        Ok(Self { shared, worker: Mutex::new(Some(handle)) })
    }

    fn enqueue(&self, task: Task<C>, speed: SchedSpeed) -> bool {
        let mut queue = self.shared.lock();
        if queue.shutdown {
            return false;
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Reverse(Queued { speed, seq, task }));
        drop(queue);
        self.shared.ready.notify_one();
        true
    }

    /// Enqueue `job` without waiting. Returns false once the scheduler is
    /// shutting down.
    pub fn schedule<F>(&self, job: F, speed: SchedSpeed) -> bool
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.enqueue(Box::new(job), speed)
    }

    /// Enqueue `job` and block until it finishes or `timeout` elapses.
    ///
    /// A timed-out job still runs to completion on the worker; only its
    /// result is dropped.
    pub fn schedule_and_wait<F, R>(
        &self,
        job: F,
        speed: SchedSpeed,
        timeout: Duration,
    ) -> Result<R, FailedJob>
    where
        F: FnOnce(&mut C) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let task: Task<C> = Box::new(move |ctx: &mut C| {
            let outcome = catch_unwind(AssertUnwindSafe(|| job(ctx))).map_err(panic_message);
            let _ = tx.send(outcome);
        });
        if !self.enqueue(task, speed) {
            return Err(FailedJob::WorkerGone);
        }
        match rx.recv_timeout(timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(message)) => Err(FailedJob::Panicked(message)),
            Err(RecvTimeoutError::Timeout) => Err(FailedJob::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(FailedJob::WorkerGone),
        }
    }

    /// Number of jobs waiting to run.
    pub fn pending(&self) -> usize {
        self.shared.lock().heap.len()
    }

    /// Stop accepting jobs, let the worker drain the queue, and join it.
    pub fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.shared.ready.notify_all();
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            // Dropping the last owner from inside a job must not self-join.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("scheduler worker exited with a panic");
            }
        }
    }
}

impl<C: Send + 'static> Drop for Scheduler<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop<C>(shared: &Shared<C>, mut context: C) {
    loop {
        let next = {
            let mut queue = shared.lock();
            while queue.heap.is_empty() && !queue.shutdown {
                queue = shared.ready.wait(queue).unwrap_or_else(PoisonError::into_inner);
            }
            queue.heap.pop()
        };
        let Some(Reverse(job)) = next else {
            debug!("scheduler queue drained, worker exiting");
            return;
        };
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (job.task)(&mut context))) {
            warn!(speed = ?job.speed, error = %panic_message(payload), "scheduled job panicked");
        }
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
    use std::time::Instant;

    #[test]
    fn jobs_run_by_speed_then_submission_order() {
        let scheduler = Scheduler::start("test-sched", Vec::<&'static str>::new()).unwrap();
        let (gate_tx, gate_rx) = bounded::<()>(0);
        // Hold the worker so everything below queues up behind it.
        scheduler.schedule(
            move |_| {
                let _ = gate_rx.recv();
            },
            SchedSpeed::Fast,
        );

        scheduler.schedule(|log| log.push("slow"), SchedSpeed::Slow);
        scheduler.schedule(|log| log.push("avg-1"), SchedSpeed::Average);
        scheduler.schedule(|log| log.push("fast"), SchedSpeed::Fast);
        scheduler.schedule(|log| log.push("avg-2"), SchedSpeed::Average);
        gate_tx.send(()).unwrap();

        let log = scheduler
            .schedule_and_wait(|log| log.clone(), SchedSpeed::Slow, Duration::from_secs(5))
            .unwrap();
        assert_eq!(log, ["fast", "avg-1", "avg-2", "slow"]);
    }

    #[test]
    fn panicking_job_reports_failure_and_worker_survives() {
        let scheduler = Scheduler::start("test-sched", 0u32).unwrap();
        let failed = scheduler.schedule_and_wait(
            |_: &mut u32| -> u32 { panic!("boom") },
            SchedSpeed::Fast,
            Duration::from_secs(5),
        );
        assert_eq!(failed, Err(FailedJob::Panicked("boom".to_string())));

        let value = scheduler
            .schedule_and_wait(|n| { *n += 1; *n }, SchedSpeed::Fast, Duration::from_secs(5));
        assert_eq!(value, Ok(1));
    }

    #[test]
    fn waiting_on_slow_job_times_out_promptly() {
        let scheduler = Scheduler::start("test-sched", ()).unwrap();
        let started = Instant::now();
        let result = scheduler.schedule_and_wait(
            |_| thread::sleep(Duration::from_secs(5)),
            SchedSpeed::Average,
            Duration::from_secs(1),
        );
        let waited = started.elapsed();
        assert_eq!(result, Err(FailedJob::Timeout(Duration::from_secs(1))));
        assert!(waited < Duration::from_secs(3), "waited {waited:?}");
    }

    #[test]
    fn shutdown_rejects_new_jobs() {
        let scheduler = Scheduler::start("test-sched", ()).unwrap();
        scheduler.shutdown();
        assert!(!scheduler.schedule(|_| {}, SchedSpeed::Fast));
        assert_eq!(
            scheduler.schedule_and_wait(|_| 1, SchedSpeed::Fast, Duration::from_millis(50)),
            Err(FailedJob::WorkerGone)
        );
    }
}
