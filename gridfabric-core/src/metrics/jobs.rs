//! Aggregation of job execution samples into the heartbeat metrics.
//!
//! Samples are written by executor threads on every job state change, so the
//! tracker stripes its queues across `jobs_metrics_concurrency_level` buckets
//! and each writer touches only the bucket its thread hashes to.

use std::collections::VecDeque;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// One job-activity sample. Rejected/cancelled/finished counters are deltas
/// since the previous sample taken by the same executor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// When the sample was taken.
    pub timestamp: DateTime<Utc>,
    /// Jobs executing at sample time.
    pub active_jobs: usize,
    /// Jobs queued at sample time.
    pub waiting_jobs: usize,
    /// Jobs finished since the previous sample.
    pub finished_jobs: u64,
    /// Jobs rejected since the previous sample.
    pub rejected_jobs: usize,
    /// Jobs cancelled since the previous sample.
    pub cancelled_jobs: usize,
    /// Accumulated wait time of jobs started since the previous sample.
    #[serde(with = "humantime_serde")]
    pub wait_time: Duration,
    /// Accumulated execution time of jobs finished since the previous sample.
    #[serde(with = "humantime_serde")]
    pub execute_time: Duration,
    /// CPU load at sample time, `[0, 1]`.
    pub cpu_load: f64,
}

impl Default for JobSnapshot {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            active_jobs: 0,
            waiting_jobs: 0,
            finished_jobs: 0,
            rejected_jobs: 0,
            cancelled_jobs: 0,
            wait_time: Duration::ZERO,
            execute_time: Duration::ZERO,
            cpu_load: 0.0,
        }
    }
}

/// Aggregate produced by reducing the retained samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobMetrics {
    /// Highest active-job count across retained samples.
    pub max_active_jobs: usize,
    /// Active jobs in the most recent sample.
    pub cur_active_jobs: usize,
    /// Mean active-job count across retained samples.
    pub avg_active_jobs: f64,
    /// Highest waiting-job count across retained samples.
    pub max_waiting_jobs: usize,
    /// Waiting jobs in the most recent sample.
    pub cur_waiting_jobs: usize,
    /// Mean waiting-job count across retained samples.
    pub avg_waiting_jobs: f64,
    /// Highest per-sample rejection count.
    pub max_rejected_jobs: usize,
    /// Rejections in the most recent sample.
    pub cur_rejected_jobs: usize,
    /// Mean per-sample rejection count.
    pub avg_rejected_jobs: f64,
    /// Highest per-sample cancellation count.
    pub max_cancelled_jobs: usize,
    /// Cancellations in the most recent sample.
    pub cur_cancelled_jobs: usize,
    /// Mean per-sample cancellation count.
    pub avg_cancelled_jobs: f64,
    /// Jobs finished over the tracker lifetime.
    pub total_executed_jobs: u64,
    /// Jobs rejected over the tracker lifetime.
    pub total_rejected_jobs: u64,
    /// Jobs cancelled over the tracker lifetime.
    pub total_cancelled_jobs: u64,
    /// Longest per-sample wait time.
    pub max_job_wait_time: Duration,
    /// Wait time of the most recent sample.
    pub cur_job_wait_time: Duration,
    /// Mean per-sample wait time.
    pub avg_job_wait_time: Duration,
    /// Longest per-sample execution time.
    pub max_job_execute_time: Duration,
    /// Execution time of the most recent sample.
    pub cur_job_execute_time: Duration,
    /// Mean per-sample execution time.
    pub avg_job_execute_time: Duration,
    /// Idle time accumulated since the tracker started.
    pub total_idle_time: Duration,
    /// Length of the current idle stretch, zero while busy.
    pub cur_idle_time: Duration,
    /// Mean CPU load across retained samples.
    pub avg_cpu_load: f64,
}

struct IdleState {
    idle: bool,
    since: Instant,
    total: Duration,
}

struct Totals {
    executed: u64,
    rejected: u64,
    cancelled: u64,
}

/// Striped collector of [`JobSnapshot`]s with bounded, expiring history.
pub struct JobMetricsTracker {
    queues: Vec<CachePadded<Mutex<VecDeque<JobSnapshot>>>>,
    history_size: usize,
    expire_time: Duration,
    idle: Mutex<IdleState>,
    totals: Mutex<Totals>,
}

impl JobMetricsTracker {
    /// Creates a tracker with `concurrency` stripes, each retaining up to
    /// `history_size` samples no older than `expire_time`.
    #[must_use]
    pub fn new(concurrency: usize, history_size: usize, expire_time: Duration) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            queues: (0..concurrency)
                .map(|_| CachePadded::new(Mutex::new(VecDeque::new())))
                .collect(),
            history_size: history_size.max(1),
            expire_time,
            idle: Mutex::new(IdleState {
                idle: true,
                since: Instant::now(),
                total: Duration::ZERO,
            }),
            totals: Mutex::new(Totals {
                executed: 0,
                rejected: 0,
                cancelled: 0,
            }),
        }
    }

    /// Records a sample into the stripe owned by the calling thread.
    pub fn add_snapshot(&self, snapshot: JobSnapshot) {
        {
            let mut totals = self.totals.lock();
            totals.executed += snapshot.finished_jobs;
            totals.rejected += snapshot.rejected_jobs as u64;
            totals.cancelled += snapshot.cancelled_jobs as u64;
        }

        self.track_idle(&snapshot);

        let mut queue = self.queues[self.stripe()].lock();
        if queue.len() == self.history_size {
            queue.pop_front();
        }
        queue.push_back(snapshot);
    }

    /// Reduces the retained samples into an aggregate.
    #[must_use]
    pub fn job_metrics(&self) -> JobMetrics {
        let mut metrics = JobMetrics::default();
        let cutoff = chrono::Duration::from_std(self.expire_time)
            .ok()
            .and_then(|expire| Utc::now().checked_sub_signed(expire));

        let mut samples = 0_usize;
        let mut sum_active = 0_usize;
        let mut sum_waiting = 0_usize;
        let mut sum_rejected = 0_usize;
        let mut sum_cancelled = 0_usize;
        let mut sum_wait = Duration::ZERO;
        let mut sum_exec = Duration::ZERO;
        let mut sum_cpu = 0.0_f64;
        let mut latest: Option<JobSnapshot> = None;

        for queue in &self.queues {
            let mut queue = queue.lock();
            if let Some(cutoff) = cutoff {
                queue.retain(|snapshot| snapshot.timestamp >= cutoff);
            }

            for snapshot in queue.iter() {
                samples += 1;
                sum_active += snapshot.active_jobs;
                sum_waiting += snapshot.waiting_jobs;
                sum_rejected += snapshot.rejected_jobs;
                sum_cancelled += snapshot.cancelled_jobs;
                sum_wait += snapshot.wait_time;
                sum_exec += snapshot.execute_time;
                sum_cpu += snapshot.cpu_load;

                metrics.max_active_jobs = metrics.max_active_jobs.max(snapshot.active_jobs);
                metrics.max_waiting_jobs = metrics.max_waiting_jobs.max(snapshot.waiting_jobs);
                metrics.max_rejected_jobs = metrics.max_rejected_jobs.max(snapshot.rejected_jobs);
                metrics.max_cancelled_jobs =
                    metrics.max_cancelled_jobs.max(snapshot.cancelled_jobs);
                metrics.max_job_wait_time = metrics.max_job_wait_time.max(snapshot.wait_time);
                metrics.max_job_execute_time =
                    metrics.max_job_execute_time.max(snapshot.execute_time);

                if latest.is_none_or(|cur| snapshot.timestamp > cur.timestamp) {
                    latest = Some(*snapshot);
                }
            }
        }

        if let Some(last) = latest {
            metrics.cur_active_jobs = last.active_jobs;
            metrics.cur_waiting_jobs = last.waiting_jobs;
            metrics.cur_rejected_jobs = last.rejected_jobs;
            metrics.cur_cancelled_jobs = last.cancelled_jobs;
            metrics.cur_job_wait_time = last.wait_time;
            metrics.cur_job_execute_time = last.execute_time;
        }

        if samples > 0 {
            let n = samples as f64;
            metrics.avg_active_jobs = sum_active as f64 / n;
            metrics.avg_waiting_jobs = sum_waiting as f64 / n;
            metrics.avg_rejected_jobs = sum_rejected as f64 / n;
            metrics.avg_cancelled_jobs = sum_cancelled as f64 / n;
            metrics.avg_job_wait_time = sum_wait / samples as u32;
            metrics.avg_job_execute_time = sum_exec / samples as u32;
            metrics.avg_cpu_load = sum_cpu / n;
        }

        {
            let totals = self.totals.lock();
            metrics.total_executed_jobs = totals.executed;
            metrics.total_rejected_jobs = totals.rejected;
            metrics.total_cancelled_jobs = totals.cancelled;
        }

        let idle = self.idle.lock();
        metrics.total_idle_time = idle.total;
        metrics.cur_idle_time = if idle.idle {
            idle.since.elapsed()
        } else {
            Duration::ZERO
        };

        metrics
    }

    /// Discards all retained samples and idle accounting.
    pub fn reset(&self) {
        for queue in &self.queues {
            queue.lock().clear();
        }
        let mut idle = self.idle.lock();
        idle.idle = true;
        idle.since = Instant::now();
        idle.total = Duration::ZERO;
        drop(idle);
        let mut totals = self.totals.lock();
        totals.executed = 0;
        totals.rejected = 0;
        totals.cancelled = 0;
    }

    fn track_idle(&self, snapshot: &JobSnapshot) {
        let busy = snapshot.active_jobs + snapshot.waiting_jobs > 0;
        let mut idle = self.idle.lock();
        if busy && idle.idle {
            let elapsed = idle.since.elapsed();
            idle.total += elapsed;
            idle.idle = false;
        } else if !busy && !idle.idle {
            idle.idle = true;
            idle.since = Instant::now();
        }
    }

    fn stripe(&self) -> usize {
        let mut hasher = DefaultHasher::new();
        std::thread::current().id().hash(&mut hasher);
        (hasher.finish() as usize) % self.queues.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn snapshot(active: usize, waiting: usize, finished: u64) -> JobSnapshot {
        JobSnapshot {
            active_jobs: active,
            waiting_jobs: waiting,
            finished_jobs: finished,
            ..JobSnapshot::default()
        }
    }

    #[test]
    fn reducer_tracks_max_current_and_average() {
        let tracker = JobMetricsTracker::new(4, 16, Duration::from_secs(60));
        tracker.add_snapshot(snapshot(2, 1, 0));
        tracker.add_snapshot(snapshot(6, 0, 3));
        tracker.add_snapshot(snapshot(4, 2, 1));

        let metrics = tracker.job_metrics();
        assert_eq!(metrics.max_active_jobs, 6);
        assert_eq!(metrics.cur_active_jobs, 4);
        assert_eq!(metrics.total_executed_jobs, 4);
        assert!((metrics.avg_active_jobs - 4.0).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshots_from_many_threads_all_reduce() {
        let tracker = Arc::new(JobMetricsTracker::new(8, 64, Duration::from_secs(60)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..10 {
                        tracker.add_snapshot(snapshot(1, 0, 1));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        assert_eq!(tracker.job_metrics().total_executed_jobs, 80);
    }

    #[test]
    fn expired_samples_are_pruned() {
        let tracker = JobMetricsTracker::new(1, 16, Duration::ZERO);
        tracker.add_snapshot(snapshot(5, 5, 0));
        std::thread::sleep(Duration::from_millis(5));

        let metrics = tracker.job_metrics();
        assert_eq!(metrics.max_active_jobs, 0);
        // Totals are lifetime counters and survive pruning.
        assert_eq!(metrics.total_executed_jobs, 0);
    }

    #[test]
    fn history_is_bounded_per_stripe() {
        let tracker = JobMetricsTracker::new(1, 2, Duration::from_secs(60));
        tracker.add_snapshot(snapshot(1, 0, 0));
        tracker.add_snapshot(snapshot(2, 0, 0));
        tracker.add_snapshot(snapshot(9, 0, 0));

        let metrics = tracker.job_metrics();
        // Eldest sample fell off; max reflects the retained window.
        assert_eq!(metrics.max_active_jobs, 9);
        assert!((metrics.avg_active_jobs - 5.5).abs() < f64::EPSILON);
    }

    #[test]
    fn idle_time_accumulates_between_busy_periods() {
        let tracker = JobMetricsTracker::new(1, 16, Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(10));
        tracker.add_snapshot(snapshot(1, 0, 0));

        let metrics = tracker.job_metrics();
        assert!(metrics.total_idle_time >= Duration::from_millis(10));
        assert_eq!(metrics.cur_idle_time, Duration::ZERO);
    }

    #[test]
    fn reset_clears_samples_and_totals() {
        let tracker = JobMetricsTracker::new(2, 16, Duration::from_secs(60));
        tracker.add_snapshot(snapshot(3, 1, 7));
        tracker.reset();

        let metrics = tracker.job_metrics();
        assert_eq!(metrics, JobMetrics {
            cur_idle_time: metrics.cur_idle_time,
            ..JobMetrics::default()
        });
    }
}
