//! Cluster configuration shared by the discovery, segmentation and
//! deployment subsystems.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cluster::error::ClusterError;
use crate::cluster::segmentation::SegmentationResolver;
use crate::deployment::DeploymentMode;
use crate::event::EventType;
use crate::thread::SaturationPolicy;

/// Top-level configuration for a grid node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Optional grid name, used in thread names and log lines.
    pub grid_name: Option<String>,
    /// Whether the local node is a daemon, excluded from normal topology
    /// views while still participating in the transport.
    pub daemon: bool,
    /// Deployment mode; must match across all non-daemon nodes.
    pub deployment_mode: DeploymentMode,
    /// Whether peer class loading is enabled; must match across all
    /// non-daemon nodes.
    pub peer_class_loading: bool,
    /// Data center the node belongs to; must match between non-daemon
    /// nodes.
    pub data_center_id: Option<u8>,
    /// Retained topology snapshots, LRU-evicted.
    pub discovery_history_size: usize,
    /// Non-discovery event types retained in the recent-event buffer.
    /// `None` retains all.
    pub recordable_events: Option<Vec<EventType>>,
    /// Capacity of the recent-event buffer.
    pub recent_event_capacity: usize,
    /// Segmentation detection and policy settings.
    pub segmentation: SegmentationConfig,
    /// Metrics collection settings.
    pub metrics: MetricsConfig,
    /// Shared worker pool settings.
    pub worker_pool: WorkerPoolConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            grid_name: None,
            daemon: false,
            deployment_mode: DeploymentMode::default(),
            peer_class_loading: false,
            data_center_id: None,
            discovery_history_size: default_discovery_history_size(),
            recordable_events: None,
            recent_event_capacity: default_recent_event_capacity(),
            segmentation: SegmentationConfig::default(),
            metrics: MetricsConfig::default(),
            worker_pool: WorkerPoolConfig::default(),
        }
    }
}

const fn default_discovery_history_size() -> usize {
    100
}

const fn default_recent_event_capacity() -> usize {
    10_000
}

impl ClusterConfig {
    /// Rejects out-of-range settings. Called once at manager start.
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.discovery_history_size == 0 {
            return Err(ClusterError::Configuration(
                "discovery_history_size must be positive".to_owned(),
            ));
        }
        if self.metrics.history_size == 0 {
            return Err(ClusterError::Configuration(
                "metrics.history_size must be positive".to_owned(),
            ));
        }
        if self.metrics.expire_time.is_zero() {
            return Err(ClusterError::Configuration(
                "metrics.expire_time must be positive".to_owned(),
            ));
        }
        if self.metrics.jobs_concurrency_level == 0 {
            return Err(ClusterError::Configuration(
                "metrics.jobs_concurrency_level must be at least 1".to_owned(),
            ));
        }
        if self.worker_pool.core_size == 0 {
            return Err(ClusterError::Configuration(
                "worker_pool.core_size must be at least 1".to_owned(),
            ));
        }
        let freq = self.segmentation.check_frequency;
        if !self.segmentation.resolvers.is_empty()
            && !freq.is_zero()
            && freq < Duration::from_secs(2)
        {
            warn!(
                frequency_ms = freq.as_millis() as u64,
                "segment check frequency is very low, at least 2000 ms is recommended"
            );
        }
        Ok(())
    }
}

/// Segmentation detection and reaction settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    /// Reaction applied when the local node loses its segment.
    pub policy: SegmentationPolicy,
    /// Cadence of periodic segment checks; zero disables the periodic
    /// check, leaving only on-demand checks after node failures.
    #[serde(with = "humantime_serde")]
    pub check_frequency: Duration,
    /// Whether start blocks, retrying every 2 s, until the segment is
    /// valid, instead of failing fast.
    pub wait_on_start: bool,
    /// Resolvers consulted on every check. Empty disables segmentation
    /// entirely.
    #[serde(skip)]
    pub resolvers: Vec<Arc<dyn SegmentationResolver>>,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            policy: SegmentationPolicy::default(),
            check_frequency: default_segment_check_frequency(),
            wait_on_start: false,
            resolvers: Vec::new(),
        }
    }
}

const fn default_segment_check_frequency() -> Duration {
    Duration::from_secs(10)
}

/// Reaction to a lost network segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentationPolicy {
    /// Log and carry on.
    Noop,
    /// Disconnect the transport and stop the local node.
    #[default]
    Stop,
    /// Disconnect the transport and ask the host process to restart.
    RestartProcess,
    /// Disconnect, clear discovery history and rejoin the topology.
    Reconnect,
}

/// Metrics collection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Job samples retained per stripe.
    pub history_size: usize,
    /// Samples older than this are discarded at reduce time.
    #[serde(with = "humantime_serde")]
    pub expire_time: Duration,
    /// Number of stripes job samples are sharded over.
    pub jobs_concurrency_level: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            history_size: default_metrics_history_size(),
            expire_time: default_metrics_expire_time(),
            jobs_concurrency_level: default_jobs_concurrency_level(),
        }
    }
}

const fn default_metrics_history_size() -> usize {
    10_000
}

const fn default_metrics_expire_time() -> Duration {
    Duration::from_secs(600)
}

const fn default_jobs_concurrency_level() -> usize {
    64
}

/// Shared worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of pool threads.
    pub core_size: usize,
    /// Queue capacity; `None` is unbounded.
    pub queue_capacity: Option<usize>,
    /// What happens when a bounded queue is full.
    pub saturation: SaturationPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            core_size: default_pool_core_size(),
            queue_capacity: None,
            saturation: SaturationPolicy::Abort,
        }
    }
}

const fn default_pool_core_size() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = ClusterConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.discovery_history_size, 100);
        assert_eq!(config.metrics.jobs_concurrency_level, 64);
        assert_eq!(config.worker_pool.core_size, 100);
    }

    #[test]
    fn zero_metrics_history_is_rejected() {
        let config = ClusterConfig {
            metrics: MetricsConfig {
                history_size: 0,
                ..MetricsConfig::default()
            },
            ..ClusterConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ClusterError::Configuration(_))
        ));
    }

    #[test]
    fn config_round_trips_without_resolvers() {
        let config = ClusterConfig {
            grid_name: Some("test-grid".to_owned()),
            ..ClusterConfig::default()
        };
        let json = serde_json::to_string(&config).expect("serialize");
        let back: ClusterConfig = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back.grid_name.as_deref(), Some("test-grid"));
        assert!(back.segmentation.resolvers.is_empty());
    }
}
