//! Cluster membership and topology: discovery manager, versioned
//! snapshots, segmentation handling.

/// Balanced-node selection for job dispatch.
pub mod balancer;
/// Configuration surface shared by the cluster subsystems.
pub mod config;
/// Error types surfaced by the cluster subsystems.
pub mod error;
/// Bounded, version-keyed snapshot history.
pub mod history;
/// Discovery manager and its workers.
pub mod manager;
/// Node identity and typed attributes.
pub mod node;
/// Segmentation resolvers, check state and lifecycle hooks.
pub mod segmentation;
/// Immutable per-version topology snapshot.
pub mod snapshot;
/// Pluggable discovery transport boundary.
pub mod transport;

pub use balancer::balanced_node;
pub use config::{
    ClusterConfig, MetricsConfig, SegmentationConfig, SegmentationPolicy, WorkerPoolConfig,
};
pub use error::ClusterError;
pub use history::TopologyHistory;
pub use manager::{DiscoveryManager, topology_hash};
pub use node::{
    AttributeValue, CacheAttributes, CacheName, Node, NodeAttributes, NodeId, NodeView,
    ProductVersion,
};
pub use segmentation::{LoggingLifecycle, NodeLifecycle, SegmentationResolver};
pub use snapshot::TopologySnapshot;
pub use transport::{
    DiscoveryCallback, DiscoveryTransport, JoinDataExchange, TopologyDelivery,
    TransportCapabilities, TransportError,
};
