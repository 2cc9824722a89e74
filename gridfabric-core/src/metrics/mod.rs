//! Per-node runtime metrics included in discovery heartbeats.

/// Striped job-metrics tracker with an aggregating reducer.
pub mod jobs;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use jobs::{JobMetrics, JobMetricsTracker, JobSnapshot};

/// Snapshot of local job, process and IO counters supplied to the discovery
/// transport for inclusion in heartbeats.
///
/// All counters are point-in-time values sampled by a [`MetricsProvider`];
/// remote nodes observe them through `NODE_METRICS_UPDATED` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeMetrics {
    /// Timestamp of the sample.
    pub last_update: DateTime<Utc>,
    /// When the local node process started.
    pub node_start_time: DateTime<Utc>,
    /// How long the node has been up.
    #[serde(with = "humantime_serde")]
    pub up_time: Duration,
    /// Logical CPUs available to the process.
    pub cpus: usize,
    /// Instantaneous CPU load in `[0, 1]`.
    pub cur_cpu_load: f64,
    /// Average CPU load over the metrics history window.
    pub avg_cpu_load: f64,
    /// Bytes of grid heap currently in use.
    pub heap_used: u64,
    /// Bytes of grid heap configured for the process.
    pub heap_total: u64,
    /// Live threads in the process.
    pub thread_count: usize,
    /// Peak live-thread count observed.
    pub peak_thread_count: usize,

    /// Highest concurrently-active job count observed.
    pub max_active_jobs: usize,
    /// Jobs executing right now.
    pub cur_active_jobs: usize,
    /// Average concurrently-active job count.
    pub avg_active_jobs: f64,
    /// Highest queued-job count observed.
    pub max_waiting_jobs: usize,
    /// Jobs queued right now.
    pub cur_waiting_jobs: usize,
    /// Average queued-job count.
    pub avg_waiting_jobs: f64,
    /// Highest per-interval rejected-job count observed.
    pub max_rejected_jobs: usize,
    /// Jobs rejected in the most recent interval.
    pub cur_rejected_jobs: usize,
    /// Average rejected-job count per interval.
    pub avg_rejected_jobs: f64,
    /// Highest per-interval cancelled-job count observed.
    pub max_cancelled_jobs: usize,
    /// Jobs cancelled in the most recent interval.
    pub cur_cancelled_jobs: usize,
    /// Average cancelled-job count per interval.
    pub avg_cancelled_jobs: f64,
    /// Jobs finished since start.
    pub total_executed_jobs: u64,
    /// Jobs rejected since start.
    pub total_rejected_jobs: u64,
    /// Jobs cancelled since start.
    pub total_cancelled_jobs: u64,
    /// Tasks finished since start.
    pub total_executed_tasks: u64,
    /// Longest observed job wait time.
    #[serde(with = "humantime_serde")]
    pub max_job_wait_time: Duration,
    /// Wait time of the most recent interval.
    #[serde(with = "humantime_serde")]
    pub cur_job_wait_time: Duration,
    /// Average job wait time.
    #[serde(with = "humantime_serde")]
    pub avg_job_wait_time: Duration,
    /// Longest observed job execution time.
    #[serde(with = "humantime_serde")]
    pub max_job_execute_time: Duration,
    /// Execution time of the most recent interval.
    #[serde(with = "humantime_serde")]
    pub cur_job_execute_time: Duration,
    /// Average job execution time.
    #[serde(with = "humantime_serde")]
    pub avg_job_execute_time: Duration,
    /// Time spent idle since the last job finished, zero while busy.
    #[serde(with = "humantime_serde")]
    pub cur_idle_time: Duration,
    /// Total time the node has spent without any job activity.
    #[serde(with = "humantime_serde")]
    pub total_idle_time: Duration,

    /// Messages sent by the IO layer.
    pub sent_messages: u64,
    /// Bytes sent by the IO layer.
    pub sent_bytes: u64,
    /// Messages received by the IO layer.
    pub received_messages: u64,
    /// Bytes received by the IO layer.
    pub received_bytes: u64,
    /// Version of the most recent cache data mutation.
    pub last_data_version: u64,
}

impl Default for NodeMetrics {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            last_update: now,
            node_start_time: now,
            up_time: Duration::ZERO,
            cpus: 0,
            cur_cpu_load: 0.0,
            avg_cpu_load: 0.0,
            heap_used: 0,
            heap_total: 0,
            thread_count: 0,
            peak_thread_count: 0,
            max_active_jobs: 0,
            cur_active_jobs: 0,
            avg_active_jobs: 0.0,
            max_waiting_jobs: 0,
            cur_waiting_jobs: 0,
            avg_waiting_jobs: 0.0,
            max_rejected_jobs: 0,
            cur_rejected_jobs: 0,
            avg_rejected_jobs: 0.0,
            max_cancelled_jobs: 0,
            cur_cancelled_jobs: 0,
            avg_cancelled_jobs: 0.0,
            total_executed_jobs: 0,
            total_rejected_jobs: 0,
            total_cancelled_jobs: 0,
            total_executed_tasks: 0,
            max_job_wait_time: Duration::ZERO,
            cur_job_wait_time: Duration::ZERO,
            avg_job_wait_time: Duration::ZERO,
            max_job_execute_time: Duration::ZERO,
            cur_job_execute_time: Duration::ZERO,
            avg_job_execute_time: Duration::ZERO,
            cur_idle_time: Duration::ZERO,
            total_idle_time: Duration::ZERO,
            sent_messages: 0,
            sent_bytes: 0,
            received_messages: 0,
            received_bytes: 0,
            last_data_version: 0,
        }
    }
}

impl NodeMetrics {
    /// Jobs currently occupying the node, queued or running.
    #[must_use]
    pub const fn current_load(&self) -> usize {
        self.cur_active_jobs + self.cur_waiting_jobs
    }
}

/// Assembles the heartbeat snapshot handed to the discovery transport.
pub trait MetricsProvider: Send + Sync {
    /// Returns a fresh metrics snapshot.
    fn metrics(&self) -> NodeMetrics;
}

/// Source of process-level counters (CPU, memory, threads).
pub trait VmMetricsSource: Send + Sync {
    /// Samples the process counters.
    fn sample(&self) -> VmSample;
}

/// Point-in-time process counters.
#[derive(Debug, Clone, Copy)]
pub struct VmSample {
    /// Logical CPUs available to the process.
    pub cpus: usize,
    /// Instantaneous CPU load in `[0, 1]`.
    pub cur_cpu_load: f64,
    /// Bytes of grid heap currently in use.
    pub heap_used: u64,
    /// Bytes of grid heap configured for the process.
    pub heap_total: u64,
    /// Live threads in the process.
    pub thread_count: usize,
    /// Peak live-thread count observed.
    pub peak_thread_count: usize,
}

/// Source of IO-layer counters.
pub trait IoMetricsSource: Send + Sync {
    /// Samples the IO counters.
    fn sample(&self) -> IoSample;
}

/// Point-in-time IO counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoSample {
    /// Messages sent.
    pub sent_messages: u64,
    /// Bytes sent.
    pub sent_bytes: u64,
    /// Messages received.
    pub received_messages: u64,
    /// Bytes received.
    pub received_bytes: u64,
}

/// Default process sampler. Heap counters are reported by the cache plane
/// through a dedicated source; this one only knows what the OS exposes.
#[derive(Debug)]
pub struct ProcessMetricsSource;

impl VmMetricsSource for ProcessMetricsSource {
    fn sample(&self) -> VmSample {
        VmSample {
            cpus: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            cur_cpu_load: 0.0,
            heap_used: 0,
            heap_total: 0,
            thread_count: 0,
            peak_thread_count: 0,
        }
    }
}

/// IO source reporting nothing; used until the IO manager registers its own.
#[derive(Debug, Default)]
pub struct NullIoMetrics;

impl IoMetricsSource for NullIoMetrics {
    fn sample(&self) -> IoSample {
        IoSample::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_snapshot_is_zeroed() {
        let metrics = NodeMetrics::default();
        assert_eq!(metrics.current_load(), 0);
        assert_eq!(metrics.total_executed_jobs, 0);
        assert_eq!(metrics.up_time, Duration::ZERO);
    }

    #[test]
    fn snapshot_round_trips_through_serde() {
        let mut metrics = NodeMetrics::default();
        metrics.cur_active_jobs = 3;
        metrics.cur_waiting_jobs = 2;
        metrics.avg_cpu_load = 0.25;

        let json = serde_json::to_string(&metrics).expect("serialize");
        let back: NodeMetrics = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.current_load(), 5);
        assert!((back.avg_cpu_load - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn process_source_reports_cpus() {
        let sample = ProcessMetricsSource.sample();
        assert!(sample.cpus >= 1);
    }
}
