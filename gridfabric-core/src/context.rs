//! Shared component context.
//!
//! The discovery manager and the deployment store both hold the context
//! and reach each other's collaborators (event bus, metrics, worker pool)
//! through it, so neither component owns the other.

use std::sync::Arc;

use crossbeam_utils::atomic::AtomicCell;
use parking_lot::RwLock;

use crate::cluster::config::ClusterConfig;
use crate::cluster::error::ClusterError;
use crate::cluster::node::{Node, NodeId};
use crate::cluster::segmentation::{LoggingLifecycle, NodeLifecycle};
use crate::deployment::loader::{LocalResourceLoader, ResourceLoader};
use crate::event::EventBus;
use crate::metrics::JobMetricsTracker;
use crate::thread::{ThreadFactory, WorkerPool};

/// A grid component that piggybacks data on the discovery join handshake
/// and observes membership changes.
pub trait DiscoveryDataParticipant: Send + Sync {
    /// Payload to send to a joining node. `Null` means nothing to send.
    fn collect_join_data(&self, _joining: NodeId) -> serde_json::Value {
        serde_json::Value::Null
    }

    /// Applies the payload this component's counterpart collected.
    fn on_join_data(&self, _data: serde_json::Value) {}

    /// Observes a node that joined the topology.
    fn on_node_joined(&self, _node: &Arc<Node>) {}

    /// Observes a node that left or failed.
    fn on_node_left(&self, _node: &Arc<Node>) {}
}

/// Builder for [`GridContext`].
pub struct GridContextBuilder {
    config: ClusterConfig,
    lifecycle: Arc<dyn NodeLifecycle>,
    system_loader: Arc<dyn ResourceLoader>,
}

impl GridContextBuilder {
    /// Installs lifecycle hooks for the segmentation policy engine.
    #[must_use]
    pub fn lifecycle(mut self, lifecycle: Arc<dyn NodeLifecycle>) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Installs the loader used for auto-deployment when a caller supplies
    /// none.
    #[must_use]
    pub fn system_loader(mut self, loader: Arc<dyn ResourceLoader>) -> Self {
        self.system_loader = loader;
        self
    }

    /// Validates the configuration and assembles the context.
    pub fn build(self) -> Result<Arc<GridContext>, ClusterError> {
        self.config.validate()?;

        let factory = ThreadFactory::new(self.config.grid_name.as_deref(), "pub-pool");
        let pool = WorkerPool::new(
            &factory,
            self.config.worker_pool.core_size,
            self.config.worker_pool.queue_capacity,
            self.config.worker_pool.saturation,
        )
        .map_err(|err| {
            ClusterError::Configuration(format!("failed to start worker pool: {err}"))
        })?;

        let events = EventBus::new(
            self.config.recordable_events.as_deref(),
            self.config.recent_event_capacity,
        );
        let job_metrics = JobMetricsTracker::new(
            self.config.metrics.jobs_concurrency_level,
            self.config.metrics.history_size,
            self.config.metrics.expire_time,
        );

        Ok(Arc::new(GridContext {
            config: self.config,
            events: Arc::new(events),
            job_metrics: Arc::new(job_metrics),
            pool: Arc::new(pool),
            lifecycle: self.lifecycle,
            system_loader: self.system_loader,
            participants: RwLock::new(Vec::new()),
            local_node_id: AtomicCell::new(None),
        }))
    }
}

/// Shared state and collaborators of one grid node.
pub struct GridContext {
    config: ClusterConfig,
    events: Arc<EventBus>,
    job_metrics: Arc<JobMetricsTracker>,
    pool: Arc<WorkerPool>,
    lifecycle: Arc<dyn NodeLifecycle>,
    system_loader: Arc<dyn ResourceLoader>,
    participants: RwLock<Vec<Arc<dyn DiscoveryDataParticipant>>>,
    local_node_id: AtomicCell<Option<NodeId>>,
}

impl GridContext {
    /// Starts building a context around a configuration.
    #[must_use]
    pub fn builder(config: ClusterConfig) -> GridContextBuilder {
        GridContextBuilder {
            config,
            lifecycle: Arc::new(LoggingLifecycle),
            system_loader: Arc::new(LocalResourceLoader::default()),
        }
    }

    /// Builds a context with default lifecycle hooks and system loader.
    pub fn new(config: ClusterConfig) -> Result<Arc<Self>, ClusterError> {
        Self::builder(config).build()
    }

    /// Node configuration.
    #[must_use]
    pub const fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Local event bus.
    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Job metrics tracker fed by the compute plane.
    #[must_use]
    pub fn job_metrics(&self) -> &Arc<JobMetricsTracker> {
        &self.job_metrics
    }

    /// Shared worker pool.
    #[must_use]
    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Lifecycle hooks for stop/restart actions.
    #[must_use]
    pub fn lifecycle(&self) -> &Arc<dyn NodeLifecycle> {
        &self.lifecycle
    }

    /// Loader used for auto-deployment when a caller supplies none.
    #[must_use]
    pub fn system_loader(&self) -> &Arc<dyn ResourceLoader> {
        &self.system_loader
    }

    /// Thread factory for a named subsystem worker.
    #[must_use]
    pub fn thread_factory(&self, name: &str) -> ThreadFactory {
        ThreadFactory::new(self.config.grid_name.as_deref(), name)
    }

    /// Registers a component participating in the join handshake.
    pub fn register_participant(&self, participant: Arc<dyn DiscoveryDataParticipant>) {
        self.participants.write().push(participant);
    }

    /// Current participants, in registration order.
    #[must_use]
    pub fn participants(&self) -> Vec<Arc<dyn DiscoveryDataParticipant>> {
        self.participants.read().clone()
    }

    /// Id of the local node, available once discovery has started.
    #[must_use]
    pub fn local_node_id(&self) -> Option<NodeId> {
        self.local_node_id.load()
    }

    pub(crate) fn set_local_node_id(&self, id: NodeId) {
        self.local_node_id.store(Some(id));
    }

    /// Releases pooled resources. Safe to call more than once.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

impl std::fmt::Debug for GridContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridContext")
            .field("grid_name", &self.config.grid_name)
            .field("local_node_id", &self.local_node_id.load())
            .finish()
    }
}
