//! Node identity: stable id, cluster order, typed attributes.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::deployment::DeploymentMode;
use crate::metrics::NodeMetrics;

/// Stable cluster-wide node identifier.
pub type NodeId = Uuid;

/// Well-known attribute keys recognized at join time.
pub mod attr {
    /// Deployment mode the node runs with; must match across the cluster.
    pub const DEPLOYMENT_MODE: &str = "grid.deployment.mode";
    /// Whether peer class loading is enabled; must match across the cluster.
    pub const PEER_CLASS_LOADING: &str = "grid.peer.class.loading";
    /// Data center the node belongs to; must match between non-daemon nodes.
    pub const DATA_CENTER_ID: &str = "grid.data.center.id";
    /// Libraries on the node's path, for drift warnings.
    pub const LIBRARIES: &str = "grid.libraries";
    /// Caches the node participates in.
    pub const CACHES: &str = "grid.caches";
    /// MAC addresses of the host, for physical-host deduplication.
    pub const MACS: &str = "grid.macs";
    /// IPv4-preference flag; mismatches are warned about.
    pub const PREFER_IPV4: &str = "net.prefer.ipv4";
    /// Account the node process runs under.
    pub const USER_NAME: &str = "grid.user.name";
    /// Host operating system name.
    pub const OS_NAME: &str = "os.name";
    /// Host architecture.
    pub const OS_ARCH: &str = "os.arch";
    /// Host operating system version.
    pub const OS_VERSION: &str = "os.version";
}

/// Cache name used as a map key. The default (unnamed) cache is a distinct
/// variant rather than a magic sentinel string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum CacheName {
    /// The default cache.
    Default,
    /// A named cache.
    Named(String),
}

impl From<Option<String>> for CacheName {
    fn from(name: Option<String>) -> Self {
        name.map_or(Self::Default, Self::Named)
    }
}

impl From<CacheName> for Option<String> {
    fn from(name: CacheName) -> Self {
        match name {
            CacheName::Default => None,
            CacheName::Named(name) => Some(name),
        }
    }
}

impl From<&str> for CacheName {
    fn from(name: &str) -> Self {
        Self::Named(name.to_owned())
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("<default>"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

/// Per-cache participation advertised by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheAttributes {
    /// Cache this entry describes.
    pub name: CacheName,
    /// Whether the node holds partitions for the cache.
    pub affinity_node: bool,
    /// Whether the node keeps a near cache of remote entries.
    pub near_cache_enabled: bool,
}

impl CacheAttributes {
    /// An affinity-holding entry without a near cache.
    #[must_use]
    pub fn affinity(name: impl Into<CacheName>) -> Self {
        Self {
            name: name.into(),
            affinity_node: true,
            near_cache_enabled: false,
        }
    }
}

/// Error parsing a product version string.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid product version '{0}', expected 'major.minor.maintenance'")]
pub struct VersionParseError(String);

/// Product version in `major.minor.maintenance` form, ordered numerically.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ProductVersion {
    /// Major version.
    pub major: u16,
    /// Minor version.
    pub minor: u16,
    /// Maintenance version.
    pub maintenance: u16,
}

impl ProductVersion {
    /// Creates a version from its components.
    #[must_use]
    pub const fn new(major: u16, minor: u16, maintenance: u16) -> Self {
        Self {
            major,
            minor,
            maintenance,
        }
    }
}

impl fmt::Display for ProductVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.maintenance)
    }
}

impl FromStr for ProductVersion {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let mut next = || {
            parts
                .next()
                .and_then(|part| part.parse::<u16>().ok())
                .ok_or_else(|| VersionParseError(s.to_owned()))
        };
        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err(VersionParseError(s.to_owned()));
        }
        Ok(version)
    }
}

/// A single typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeValue {
    /// Boolean flag.
    Bool(bool),
    /// Integer value.
    Int(i64),
    /// String value.
    Str(String),
    /// List of strings.
    StrList(Vec<String>),
    /// Cache participation entries.
    Caches(Vec<CacheAttributes>),
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<Vec<String>> for AttributeValue {
    fn from(value: Vec<String>) -> Self {
        Self::StrList(value)
    }
}

impl From<Vec<CacheAttributes>> for AttributeValue {
    fn from(value: Vec<CacheAttributes>) -> Self {
        Self::Caches(value)
    }
}

/// Immutable node attribute map with typed accessors. Unknown keys and
/// mistyped values read as absent, never as errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeAttributes {
    values: HashMap<String, AttributeValue>,
}

impl NodeAttributes {
    /// Creates an empty attribute map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an attribute, consuming and returning the map.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// Raw lookup.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.values.get(key)
    }

    /// String attribute, absent when missing or differently typed.
    #[must_use]
    pub fn str_value(&self, key: &str) -> Option<&str> {
        match self.values.get(key)? {
            AttributeValue::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Boolean attribute.
    #[must_use]
    pub fn bool_value(&self, key: &str) -> Option<bool> {
        match self.values.get(key)? {
            AttributeValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Integer attribute.
    #[must_use]
    pub fn int_value(&self, key: &str) -> Option<i64> {
        match self.values.get(key)? {
            AttributeValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// String-list attribute.
    #[must_use]
    pub fn str_list(&self, key: &str) -> Option<&[String]> {
        match self.values.get(key)? {
            AttributeValue::StrList(values) => Some(values),
            _ => None,
        }
    }

    /// Deployment mode the node advertises.
    #[must_use]
    pub fn deployment_mode(&self) -> Option<DeploymentMode> {
        self.str_value(attr::DEPLOYMENT_MODE)?.parse().ok()
    }

    /// Peer-class-loading flag the node advertises.
    #[must_use]
    pub fn peer_class_loading(&self) -> Option<bool> {
        self.bool_value(attr::PEER_CLASS_LOADING)
    }

    /// Data center the node belongs to.
    #[must_use]
    pub fn data_center_id(&self) -> Option<u8> {
        u8::try_from(self.int_value(attr::DATA_CENTER_ID)?).ok()
    }

    /// IPv4-preference flag.
    #[must_use]
    pub fn prefer_ipv4(&self) -> Option<bool> {
        self.bool_value(attr::PREFER_IPV4)
    }

    /// Libraries on the node's path.
    #[must_use]
    pub fn libraries(&self) -> Option<&[String]> {
        self.str_list(attr::LIBRARIES)
    }

    /// MAC addresses of the host.
    #[must_use]
    pub fn macs(&self) -> Option<&[String]> {
        self.str_list(attr::MACS)
    }

    /// Cache participation entries.
    #[must_use]
    pub fn caches(&self) -> Option<&[CacheAttributes]> {
        match self.values.get(attr::CACHES)? {
            AttributeValue::Caches(caches) => Some(caches),
            _ => None,
        }
    }
}

/// A cluster member as observed through discovery.
///
/// Identity, order and attributes are immutable for the lifetime of the
/// cluster incarnation; only the metrics cell is refreshed, on every
/// `NODE_METRICS_UPDATED` heartbeat.
#[derive(Debug, Serialize, Deserialize)]
pub struct Node {
    id: NodeId,
    order: u64,
    addresses: Vec<SocketAddr>,
    daemon: bool,
    version: ProductVersion,
    attributes: NodeAttributes,
    #[serde(skip)]
    metrics: RwLock<NodeMetrics>,
}

impl Node {
    /// Creates a node record.
    #[must_use]
    pub fn new(
        id: NodeId,
        order: u64,
        addresses: Vec<SocketAddr>,
        daemon: bool,
        version: ProductVersion,
        attributes: NodeAttributes,
    ) -> Self {
        Self {
            id,
            order,
            addresses,
            daemon,
            version,
            attributes,
            metrics: RwLock::new(NodeMetrics::default()),
        }
    }

    /// Stable node id.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Monotone per-cluster join order. Never reused.
    #[must_use]
    pub const fn order(&self) -> u64 {
        self.order
    }

    /// Addresses the node is reachable at.
    #[must_use]
    pub fn addresses(&self) -> &[SocketAddr] {
        &self.addresses
    }

    /// Whether the node is a daemon, excluded from normal topology views.
    #[must_use]
    pub const fn is_daemon(&self) -> bool {
        self.daemon
    }

    /// Product version the node runs.
    #[must_use]
    pub const fn version(&self) -> ProductVersion {
        self.version
    }

    /// Attribute map.
    #[must_use]
    pub const fn attributes(&self) -> &NodeAttributes {
        &self.attributes
    }

    /// Latest metrics heartbeat observed for the node.
    #[must_use]
    pub fn metrics(&self) -> NodeMetrics {
        self.metrics.read().clone()
    }

    /// Replaces the metrics cell with a fresh heartbeat.
    pub fn update_metrics(&self, metrics: NodeMetrics) {
        *self.metrics.write() = metrics;
    }

    /// Names of all caches the node advertises.
    #[must_use]
    pub fn cache_names(&self) -> Vec<CacheName> {
        self.attributes
            .caches()
            .unwrap_or_default()
            .iter()
            .map(|cache| cache.name.clone())
            .collect()
    }

    /// Plain value view used in event payloads.
    #[must_use]
    pub fn view(&self) -> NodeView {
        NodeView {
            id: self.id,
            order: self.order,
            daemon: self.daemon,
            addresses: self.addresses.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl std::hash::Hash for Node {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Node [id={}, order={}, daemon={}]",
            self.id, self.order, self.daemon
        )
    }
}

/// Detached value snapshot of a node, carried inside event payloads so that
/// consumers never hold live topology references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    /// Stable node id.
    pub id: NodeId,
    /// Join order of the node.
    pub order: u64,
    /// Daemon flag.
    pub daemon: bool,
    /// Addresses the node is reachable at.
    pub addresses: Vec<SocketAddr>,
    /// Attribute map at observation time.
    pub attributes: NodeAttributes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_attribute_reads_as_absent() {
        let attrs = NodeAttributes::new().with(attr::USER_NAME, "grid");
        assert_eq!(attrs.str_value(attr::USER_NAME), Some("grid"));
        assert_eq!(attrs.str_value("no.such.key"), None);
        assert_eq!(attrs.bool_value(attr::USER_NAME), None);
        assert_eq!(attrs.deployment_mode(), None);
    }

    #[test]
    fn data_center_id_rejects_out_of_range() {
        let attrs = NodeAttributes::new().with(attr::DATA_CENTER_ID, 300_i64);
        assert_eq!(attrs.data_center_id(), None);

        let attrs = NodeAttributes::new().with(attr::DATA_CENTER_ID, 7_i64);
        assert_eq!(attrs.data_center_id(), Some(7));
    }

    #[test]
    fn version_parses_and_orders() {
        let old: ProductVersion = "6.1.9".parse().expect("parse");
        let new: ProductVersion = "6.2.0".parse().expect("parse");
        assert!(old < new);
        assert_eq!(new.to_string(), "6.2.0");
        assert!("6.2".parse::<ProductVersion>().is_err());
        assert!("6.2.0.1".parse::<ProductVersion>().is_err());
    }

    #[test]
    fn nodes_compare_by_id() {
        let id = Uuid::new_v4();
        let a = Node::new(
            id,
            1,
            Vec::new(),
            false,
            ProductVersion::default(),
            NodeAttributes::new(),
        );
        let b = Node::new(
            id,
            1,
            Vec::new(),
            false,
            ProductVersion::default(),
            NodeAttributes::new(),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn default_cache_name_is_not_a_sentinel_string() {
        let default: CacheName = None::<String>.into();
        let named = CacheName::from("partitioned");
        assert_eq!(default, CacheName::Default);
        assert_ne!(default, named);
        assert_eq!(Option::<String>::from(default), None);
    }
}
