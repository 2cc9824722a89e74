//! Boundary contract of the pluggable discovery transport.
//!
//! The transport is the only cluster-wide collaborator: it assigns node
//! orders, stamps topology versions and delivers raw membership events.
//! Everything above it is local to the node.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cluster::node::{Node, NodeId};
use crate::event::EventType;
use crate::metrics::MetricsProvider;

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying network I/O failure.
    #[error("transport i/o failure: {0}")]
    Io(#[from] std::io::Error),
    /// The transport refused to start or rejoin.
    #[error("transport connect failed: {0}")]
    Connect(String),
    /// The transport is disconnected.
    #[error("transport is disconnected")]
    Disconnected,
}

/// Optional capabilities a transport declares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportCapabilities {
    /// Guarantees unique monotone node orders and `top_version ==
    /// node.order()` on join events.
    pub ordered: bool,
    /// Supplies raw per-version topology snapshots alongside events.
    pub history: bool,
}

/// One raw membership event pushed by the transport. Delivered inline on
/// the transport thread; the receiving callback must stay short and
/// non-blocking.
pub struct TopologyDelivery {
    /// Membership event type; always one of the discovery types.
    pub kind: EventType,
    /// Topology version stamped on the event. Metrics updates carry the
    /// current version and never advance it.
    pub top_version: u64,
    /// The node the event is about.
    pub node: Arc<Node>,
    /// Full topology as of this event, local node included.
    pub snapshot: Vec<Arc<Node>>,
    /// Raw per-version snapshots, present only on transports declaring the
    /// history capability.
    pub history: Option<BTreeMap<u64, Vec<Arc<Node>>>>,
}

/// Callback the discovery manager installs to receive raw events.
pub type DiscoveryCallback = Box<dyn Fn(TopologyDelivery) + Send + Sync>;

/// Piggybacks per-component payloads on the join handshake. `collect` runs
/// on the coordinator side once per joining node; `on_exchange` runs on
/// the joining side with the collected payloads in the same order.
pub trait JoinDataExchange: Send + Sync {
    /// Collects component payloads for a joining node.
    fn collect(&self, joining: NodeId) -> Vec<serde_json::Value>;
    /// Applies payloads collected by the coordinator.
    fn on_exchange(&self, payloads: Vec<serde_json::Value>);
}

/// The pluggable discovery transport.
pub trait DiscoveryTransport: Send + Sync {
    /// Capabilities this transport declares.
    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities::default()
    }

    /// Installs or clears the raw-event callback.
    fn set_listener(&self, callback: Option<DiscoveryCallback>);

    /// Installs or clears the join-data exchange hooks.
    fn set_data_exchange(&self, exchange: Option<Arc<dyn JoinDataExchange>>);

    /// Installs the provider sampled for heartbeat metrics.
    fn set_metrics_provider(&self, provider: Arc<dyn MetricsProvider>);

    /// Joins the topology. Called once from manager start.
    fn start(&self) -> Result<(), TransportError>;

    /// Leaves the topology and releases resources. Idempotent.
    fn stop(&self) -> Result<(), TransportError>;

    /// The local node. Stable between reconnects.
    fn local_node(&self) -> Arc<Node>;

    /// All remote nodes currently known, daemons included.
    fn remote_nodes(&self) -> Vec<Arc<Node>>;

    /// Looks a node up by id; `None` means the transport considers it dead.
    fn node(&self, id: NodeId) -> Option<Arc<Node>>;

    /// Actively pings a node.
    fn ping(&self, id: NodeId) -> bool;

    /// Start time of the eldest node in the grid.
    fn grid_start_time(&self) -> DateTime<Utc>;

    /// Detaches from the topology without releasing local resources, in
    /// preparation for a stop or a reconnect.
    fn disconnect(&self) -> Result<(), TransportError>;

    /// Rejoins the topology after a disconnect, acquiring a fresh order.
    fn reconnect(&self) -> Result<(), TransportError>;
}
