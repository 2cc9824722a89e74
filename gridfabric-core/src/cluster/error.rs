//! Error types surfaced by the cluster subsystems.

use thiserror::Error;

use crate::cluster::node::{CacheName, NodeId};
use crate::cluster::transport::TransportError;
use crate::thread::PoolError;

/// Errors raised by the discovery manager and its workers.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// The manager was started twice.
    #[error("discovery manager is already started")]
    AlreadyStarted,
    /// An operation requires a started manager.
    #[error("discovery manager is not started")]
    NotStarted,
    /// A joining or remote node carries attributes incompatible with the
    /// local node. Fatal at join time.
    #[error("attribute mismatch with node {remote}: {detail}")]
    AttributeMismatch {
        /// The incompatible remote node.
        remote: NodeId,
        /// What differed.
        detail: String,
    },
    /// A topology query could not be served: the requested version is gone
    /// and no history entry remains to fall back to.
    #[error("failed to resolve topology [cache={cache}, requested={requested:?}]")]
    TopologyResolve {
        /// Cache the query was about.
        cache: CacheName,
        /// Requested topology version, `None` for current.
        requested: Option<u64>,
    },
    /// Raw snapshot history was requested from a transport that does not
    /// provide it.
    #[error("discovery transport does not support topology snapshot history")]
    HistoryUnsupported,
    /// The local node is not in a valid network segment.
    #[error("local node is not in a valid network segment")]
    InvalidSegment,
    /// The discovery transport failed.
    #[error("discovery transport error: {0}")]
    Transport(#[from] TransportError),
    /// The shared worker pool rejected a submission.
    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),
}
