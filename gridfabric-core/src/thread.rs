//! Named thread factory and the shared worker pool.
//!
//! Pool threads outlive individual submissions; shutdown is graceful and
//! drains jobs already queued. With a bounded queue the saturation policy
//! decides whether an over-capacity submission errors or is dropped.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Sender, TrySendError, bounded, unbounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, trace};

/// What happens to a submission when a bounded queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaturationPolicy {
    /// Reject the submission with [`PoolError::Saturated`].
    #[default]
    Abort,
    /// Silently drop the submission.
    Discard,
}

/// Worker pool submission failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// Bounded queue is full and the policy is [`SaturationPolicy::Abort`].
    #[error("worker pool queue is full (capacity {0})")]
    Saturated(usize),
    /// The pool has been shut down.
    #[error("worker pool is shut down")]
    Shutdown,
}

/// Produces consistently named threads: `<grid>-<pool>-#<n>`.
#[derive(Debug)]
pub struct ThreadFactory {
    prefix: String,
    counter: AtomicUsize,
}

impl ThreadFactory {
    /// Creates a factory for the given grid and pool names.
    #[must_use]
    pub fn new(grid_name: Option<&str>, pool_name: &str) -> Self {
        let prefix = match grid_name {
            Some(grid) => format!("{grid}-{pool_name}"),
            None => pool_name.to_owned(),
        };
        Self {
            prefix,
            counter: AtomicUsize::new(0),
        }
    }

    /// Spawns a named thread.
    pub fn spawn<F>(&self, f: F) -> io::Result<JoinHandle<()>>
    where
        F: FnOnce() + Send + 'static,
    {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        std::thread::Builder::new()
            .name(format!("{}-#{n}", self.prefix))
            .spawn(f)
    }
}

type Job = Box<dyn FnOnce() + Send>;

enum PoolMsg {
    Run(Job),
    Exit,
}

/// Fixed-size worker pool fed through a bounded or unbounded queue.
pub struct WorkerPool {
    tx: Sender<PoolMsg>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    capacity: Option<usize>,
    policy: SaturationPolicy,
}

impl WorkerPool {
    /// Spawns `core_size` workers. `queue_capacity: None` means unbounded.
    pub fn new(
        factory: &ThreadFactory,
        core_size: usize,
        queue_capacity: Option<usize>,
        policy: SaturationPolicy,
    ) -> io::Result<Self> {
        let core_size = core_size.max(1);
        let (tx, rx) = match queue_capacity {
            Some(capacity) => bounded(capacity.max(1)),
            None => unbounded(),
        };

        let mut workers = Vec::with_capacity(core_size);
        for _ in 0..core_size {
            let rx = rx.clone();
            workers.push(factory.spawn(move || {
                loop {
                    match rx.recv() {
                        Ok(PoolMsg::Run(job)) => job(),
                        Ok(PoolMsg::Exit) | Err(_) => break,
                    }
                }
                trace!("pool worker exiting");
            })?);
        }

        Ok(Self {
            tx,
            workers: Mutex::new(workers),
            closed: AtomicBool::new(false),
            capacity: queue_capacity.map(|capacity| capacity.max(1)),
            policy,
        })
    }

    /// Submits a job for execution on a pool thread.
    pub fn execute<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return Err(PoolError::Shutdown);
        }
        let msg = PoolMsg::Run(Box::new(job));
        match self.capacity {
            None => self.tx.send(msg).map_err(|_| PoolError::Shutdown),
            Some(capacity) => match self.tx.try_send(msg) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => match self.policy {
                    SaturationPolicy::Abort => Err(PoolError::Saturated(capacity)),
                    SaturationPolicy::Discard => {
                        debug!(capacity, "worker pool saturated, discarding job");
                        Ok(())
                    }
                },
                Err(TrySendError::Disconnected(_)) => Err(PoolError::Shutdown),
            },
        }
    }

    /// Stops accepting work, drains queued jobs and joins every worker.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for _ in 0..workers.len() {
            if self.tx.send(PoolMsg::Exit).is_err() {
                break;
            }
        }
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("capacity", &self.capacity)
            .field("policy", &self.policy)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn factory_names_threads_sequentially() {
        let factory = ThreadFactory::new(Some("grid"), "utility");
        let handle = factory
            .spawn(|| {
                assert_eq!(
                    std::thread::current().name(),
                    Some("grid-utility-#0"),
                    "first thread name"
                );
            })
            .expect("spawn");
        handle.join().expect("join");
    }

    #[test]
    fn submitted_jobs_run() {
        let factory = ThreadFactory::new(None, "pool");
        let pool = WorkerPool::new(&factory, 4, None, SaturationPolicy::Abort).expect("pool");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .expect("submit");
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 32);
    }

    #[test]
    fn abort_policy_rejects_when_saturated() {
        let factory = ThreadFactory::new(None, "tight");
        let pool = WorkerPool::new(&factory, 1, Some(1), SaturationPolicy::Abort).expect("pool");

        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        pool.execute(move || {
            let _ = gate_rx.recv();
        })
        .expect("blocker");
        // Give the worker a moment to pick the blocker up.
        std::thread::sleep(Duration::from_millis(20));
        pool.execute(|| {}).expect("queued");

        let err = pool.execute(|| {}).unwrap_err();
        assert_eq!(err, PoolError::Saturated(1));

        gate_tx.send(()).expect("release");
        pool.shutdown();
    }

    #[test]
    fn discard_policy_drops_silently() {
        let factory = ThreadFactory::new(None, "lossy");
        let pool = WorkerPool::new(&factory, 1, Some(1), SaturationPolicy::Discard).expect("pool");

        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        pool.execute(move || {
            let _ = gate_rx.recv();
        })
        .expect("blocker");
        std::thread::sleep(Duration::from_millis(20));
        pool.execute(|| {}).expect("queued");
        pool.execute(|| {}).expect("discarded");

        gate_tx.send(()).expect("release");
        pool.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent_and_rejects_new_work() {
        let factory = ThreadFactory::new(None, "done");
        let pool = WorkerPool::new(&factory, 2, None, SaturationPolicy::Abort).expect("pool");
        pool.shutdown();
        pool.shutdown();
        assert_eq!(pool.execute(|| {}).unwrap_err(), PoolError::Shutdown);
    }
}
