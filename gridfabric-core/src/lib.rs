//! Cluster membership and topology core of the gridfabric in-memory data
//! grid.
//!
//! A pluggable [`cluster::DiscoveryTransport`] delivers raw membership
//! events; the [`cluster::DiscoveryManager`] turns them into a monotone
//! topology-version timeline of immutable [`cluster::TopologySnapshot`]s,
//! watches for network segmentation and applies the configured reaction,
//! and the [`deployment::LocalDeploymentStore`] keys code resources into
//! that topology for the compute plane.

/// Cluster membership, topology snapshots and segmentation.
pub mod cluster;
/// Shared component context.
pub mod context;
/// Local deployment store and resource loaders.
pub mod deployment;
/// Grid event model and the local event bus.
pub mod event;
/// Single-shot asynchronous result carriers.
pub mod future;
/// Node, job and IO metrics.
pub mod metrics;
/// Named thread factory and the shared worker pool.
pub mod thread;

pub use cluster::{
    CacheName, ClusterConfig, ClusterError, DiscoveryManager, DiscoveryTransport, Node, NodeId,
    SegmentationPolicy, SegmentationResolver, TopologySnapshot,
};
pub use context::{DiscoveryDataParticipant, GridContext, GridContextBuilder};
pub use deployment::{
    Deployment, DeploymentMetadata, DeploymentMode, LocalDeploymentStore, ResourceDef,
    ResourceLoader,
};
pub use event::{Event, EventBus, EventType};
pub use future::{FutureError, GridFuture};
pub use metrics::{MetricsProvider, NodeMetrics};
