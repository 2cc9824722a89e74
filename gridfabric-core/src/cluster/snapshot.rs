//! Immutable topology snapshot taken at a single topology version.
//!
//! Everything except the alive sets is frozen at construction. The alive
//! sets start as the alive subset at build time and are only ever pruned,
//! from the transport callback, as later leave/fail events arrive; they
//! answer "who of this topology can still be talked to", not "who was
//! alive at this version".

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;

use crate::cluster::node::{CacheName, Node, NodeId, ProductVersion};

/// Topology view at one version: membership lists, per-cache node sets,
/// version-indexed views and the mutable alive subsets.
pub struct TopologySnapshot {
    local: Arc<Node>,
    all: Vec<Arc<Node>>,
    remote: Vec<Arc<Node>>,
    daemons: Vec<Arc<Node>>,
    all_cache_nodes: HashMap<CacheName, Vec<Arc<Node>>>,
    remote_cache_nodes: HashMap<CacheName, Vec<Arc<Node>>>,
    affinity_cache_nodes: HashMap<CacheName, Vec<Arc<Node>>>,
    near_enabled_caches: HashSet<CacheName>,
    nodes_by_version: BTreeMap<ProductVersion, Vec<Arc<Node>>>,
    alive_cache_nodes: DashMap<CacheName, Vec<Arc<Node>>>,
    alive_remote_cache_nodes: DashMap<CacheName, Vec<Arc<Node>>>,
    node_map: HashMap<NodeId, Arc<Node>>,
    max_order: u64,
}

impl TopologySnapshot {
    /// Builds a snapshot from the local node and the remote nodes of one
    /// transport-delivered topology. `alive` is consulted per node while
    /// building the alive subsets.
    pub fn new<F>(local: Arc<Node>, remotes: Vec<Arc<Node>>, alive: F) -> Self
    where
        F: Fn(NodeId) -> bool,
    {
        let remote: Vec<Arc<Node>> = remotes
            .iter()
            .filter(|node| !node.is_daemon() && node.id() != local.id())
            .cloned()
            .collect();

        let mut all = Vec::with_capacity(remote.len() + 1);
        if !local.is_daemon() {
            all.push(Arc::clone(&local));
        }
        all.extend(remote.iter().cloned());

        let mut all_cache_nodes: HashMap<CacheName, Vec<Arc<Node>>> = HashMap::new();
        let mut remote_cache_nodes: HashMap<CacheName, Vec<Arc<Node>>> = HashMap::new();
        let mut affinity_cache_nodes: HashMap<CacheName, Vec<Arc<Node>>> = HashMap::new();
        let mut near_enabled_caches: HashSet<CacheName> = HashSet::new();
        let mut nodes_by_version: BTreeMap<ProductVersion, Vec<Arc<Node>>> = BTreeMap::new();
        let alive_cache_nodes: DashMap<CacheName, Vec<Arc<Node>>> = DashMap::new();
        let alive_remote_cache_nodes: DashMap<CacheName, Vec<Arc<Node>>> = DashMap::new();

        let mut max_order = 0;

        for node in &all {
            max_order = max_order.max(node.order());

            if let Some(caches) = node.attributes().caches() {
                let node_alive = alive(node.id());
                for cache in caches {
                    push_to(&mut all_cache_nodes, &cache.name, node);
                    if node_alive {
                        alive_cache_nodes
                            .entry(cache.name.clone())
                            .or_default()
                            .push(Arc::clone(node));
                    }
                    if cache.affinity_node {
                        push_to(&mut affinity_cache_nodes, &cache.name, node);
                    }
                    if cache.near_cache_enabled {
                        near_enabled_caches.insert(cache.name.clone());
                    }
                    if node.id() != local.id() {
                        push_to(&mut remote_cache_nodes, &cache.name, node);
                        if node_alive {
                            alive_remote_cache_nodes
                                .entry(cache.name.clone())
                                .or_default()
                                .push(Arc::clone(node));
                        }
                    }
                }
            }

            nodes_by_version
                .entry(node.version())
                .or_default()
                .push(Arc::clone(node));
        }

        // Second pass: a node must appear in every version bucket strictly
        // below its own, so "nodes with version >= v" queries are inclusive.
        for node in &all {
            let version = node.version();
            for (_, bucket) in nodes_by_version.range_mut(..version) {
                bucket.push(Arc::clone(node));
            }
        }

        let mut daemons: Vec<Arc<Node>> = Vec::new();
        if local.is_daemon() {
            daemons.push(Arc::clone(&local));
        }
        daemons.extend(
            remotes
                .iter()
                .filter(|node| node.is_daemon() && node.id() != local.id())
                .cloned(),
        );

        let mut node_map = HashMap::with_capacity(all.len() + daemons.len());
        for node in all.iter().chain(daemons.iter()) {
            node_map.insert(node.id(), Arc::clone(node));
        }

        Self {
            local,
            all,
            remote,
            daemons,
            all_cache_nodes,
            remote_cache_nodes,
            affinity_cache_nodes,
            near_enabled_caches,
            nodes_by_version,
            alive_cache_nodes,
            alive_remote_cache_nodes,
            node_map,
            max_order,
        }
    }

    /// The local node.
    #[must_use]
    pub fn local_node(&self) -> &Arc<Node> {
        &self.local
    }

    /// All non-daemon nodes, insertion-stable, local node first.
    #[must_use]
    pub fn all_nodes(&self) -> &[Arc<Node>] {
        &self.all
    }

    /// All non-daemon remote nodes.
    #[must_use]
    pub fn remote_nodes(&self) -> &[Arc<Node>] {
        &self.remote
    }

    /// All daemon nodes, local node included when it is a daemon.
    #[must_use]
    pub fn daemon_nodes(&self) -> &[Arc<Node>] {
        &self.daemons
    }

    /// Node lookup by id, daemons included.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Arc<Node>> {
        self.node_map.get(&id)
    }

    /// Highest node order present.
    #[must_use]
    pub const fn max_order(&self) -> u64 {
        self.max_order
    }

    /// Non-daemon topology size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.all.len()
    }

    /// Nodes advertising the cache, bounded by `top_version`.
    #[must_use]
    pub fn cache_nodes(&self, name: &CacheName, top_version: Option<u64>) -> Vec<Arc<Node>> {
        self.bounded(top_version, self.all_cache_nodes.get(name))
    }

    /// Remote nodes advertising the cache, bounded by `top_version`.
    #[must_use]
    pub fn remote_cache_nodes(&self, name: &CacheName, top_version: Option<u64>) -> Vec<Arc<Node>> {
        self.bounded(top_version, self.remote_cache_nodes.get(name))
    }

    /// Nodes participating in affinity for the cache, bounded by
    /// `top_version`. Near-only nodes are excluded.
    #[must_use]
    pub fn cache_affinity_nodes(
        &self,
        name: &CacheName,
        top_version: Option<u64>,
    ) -> Vec<Arc<Node>> {
        self.bounded(top_version, self.affinity_cache_nodes.get(name))
    }

    /// Still-reachable nodes advertising the cache, bounded by
    /// `top_version`.
    #[must_use]
    pub fn alive_cache_nodes(&self, name: &CacheName, top_version: Option<u64>) -> Vec<Arc<Node>> {
        let nodes = self.alive_cache_nodes.get(name).map(|entry| entry.clone());
        self.bounded(top_version, nodes.as_ref())
    }

    /// Still-reachable remote nodes advertising the cache, bounded by
    /// `top_version`.
    #[must_use]
    pub fn alive_remote_cache_nodes(
        &self,
        name: &CacheName,
        top_version: Option<u64>,
    ) -> Vec<Arc<Node>> {
        let nodes = self
            .alive_remote_cache_nodes
            .get(name)
            .map(|entry| entry.clone());
        self.bounded(top_version, nodes.as_ref())
    }

    /// Whether at least one node advertises a near cache for the name.
    #[must_use]
    pub fn has_near_cache(&self, name: &CacheName) -> bool {
        self.near_enabled_caches.contains(name)
    }

    /// Nodes with product version greater than or equal to `version`.
    #[must_use]
    pub fn elder_nodes(&self, version: ProductVersion) -> Vec<Arc<Node>> {
        self.nodes_by_version
            .range(version..)
            .next()
            .map(|(_, nodes)| nodes.clone())
            .unwrap_or_default()
    }

    /// Topology grouped by product version.
    #[must_use]
    pub const fn versions_map(&self) -> &BTreeMap<ProductVersion, Vec<Arc<Node>>> {
        &self.nodes_by_version
    }

    /// Drops a departed node from the alive sets. Called from the
    /// transport callback for this and every other retained snapshot when
    /// a leave/fail event arrives.
    pub fn update_alives(&self, departed: &Node) {
        if departed.order() > self.max_order {
            return;
        }
        for name in departed.cache_names() {
            prune(&self.alive_cache_nodes, &name, departed.id());
            prune(&self.alive_remote_cache_nodes, &name, departed.id());
        }
    }

    fn bounded(&self, top_version: Option<u64>, nodes: Option<&Vec<Arc<Node>>>) -> Vec<Arc<Node>> {
        let Some(nodes) = nodes else {
            return Vec::new();
        };
        match top_version {
            Some(version) if version < self.max_order => nodes
                .iter()
                .filter(|node| node.order() <= version)
                .cloned()
                .collect(),
            _ => nodes.clone(),
        }
    }
}

fn push_to(map: &mut HashMap<CacheName, Vec<Arc<Node>>>, name: &CacheName, node: &Arc<Node>) {
    map.entry(name.clone()).or_default().push(Arc::clone(node));
}

fn prune(map: &DashMap<CacheName, Vec<Arc<Node>>>, name: &CacheName, id: NodeId) {
    if let Some(mut entry) = map.get_mut(name) {
        entry.retain(|node| node.id() != id);
    }
}

impl std::fmt::Debug for TopologySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologySnapshot")
            .field("local", &self.local.id())
            .field("nodes", &self.all.len())
            .field("daemons", &self.daemons.len())
            .field("max_order", &self.max_order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::{CacheAttributes, NodeAttributes, attr};
    use proptest::prelude::*;
    use uuid::Uuid;

    fn cache_node(order: u64, caches: Vec<CacheAttributes>) -> Arc<Node> {
        Arc::new(Node::new(
            Uuid::new_v4(),
            order,
            Vec::new(),
            false,
            ProductVersion::new(1, 0, 0),
            NodeAttributes::new().with(attr::CACHES, caches),
        ))
    }

    fn versioned_node(order: u64, version: ProductVersion) -> Arc<Node> {
        Arc::new(Node::new(
            Uuid::new_v4(),
            order,
            Vec::new(),
            false,
            version,
            NodeAttributes::new(),
        ))
    }

    fn daemon_node(order: u64) -> Arc<Node> {
        Arc::new(Node::new(
            Uuid::new_v4(),
            order,
            Vec::new(),
            true,
            ProductVersion::new(1, 0, 0),
            NodeAttributes::new(),
        ))
    }

    fn plain(name: &str) -> CacheAttributes {
        CacheAttributes {
            name: name.into(),
            affinity_node: false,
            near_cache_enabled: false,
        }
    }

    #[test]
    fn daemons_are_excluded_from_normal_views() {
        let local = cache_node(1, vec![plain("c")]);
        let daemon = daemon_node(2);
        let remote = cache_node(3, vec![plain("c")]);
        let snapshot = TopologySnapshot::new(
            Arc::clone(&local),
            vec![Arc::clone(&daemon), Arc::clone(&remote)],
            |_| true,
        );

        assert_eq!(snapshot.all_nodes().len(), 2);
        assert_eq!(snapshot.remote_nodes(), &[Arc::clone(&remote)]);
        assert_eq!(snapshot.daemon_nodes(), &[Arc::clone(&daemon)]);
        // Daemons stay reachable through the id lookup.
        assert!(snapshot.node(daemon.id()).is_some());
        assert_eq!(snapshot.max_order(), 3);
    }

    #[test]
    fn version_bound_filters_by_node_order() {
        let name = CacheName::from("c");
        let n1 = cache_node(1, vec![plain("c")]);
        let n2 = cache_node(2, vec![plain("c")]);
        let n3 = cache_node(3, vec![plain("c")]);
        let snapshot = TopologySnapshot::new(
            Arc::clone(&n1),
            vec![Arc::clone(&n2), Arc::clone(&n3)],
            |_| true,
        );

        assert_eq!(snapshot.cache_nodes(&name, Some(2)).len(), 2);
        assert_eq!(snapshot.cache_nodes(&name, Some(3)).len(), 3);
        // At or past max order the stored list comes back whole.
        assert_eq!(snapshot.cache_nodes(&name, Some(100)).len(), 3);
        assert_eq!(snapshot.cache_nodes(&name, None).len(), 3);
        assert!(snapshot.cache_nodes(&CacheName::Default, None).is_empty());
    }

    #[test]
    fn affinity_and_near_flags_are_independent() {
        let near_only = CacheAttributes {
            name: "c".into(),
            affinity_node: false,
            near_cache_enabled: true,
        };
        let local = cache_node(1, vec![CacheAttributes::affinity("c")]);
        let remote = cache_node(2, vec![near_only]);
        let snapshot = TopologySnapshot::new(Arc::clone(&local), vec![remote], |_| true);

        let name = CacheName::from("c");
        assert_eq!(snapshot.cache_nodes(&name, None).len(), 2);
        assert_eq!(snapshot.cache_affinity_nodes(&name, None), vec![local]);
        assert!(snapshot.has_near_cache(&name));
        assert!(!snapshot.has_near_cache(&CacheName::from("other")));
    }

    #[test]
    fn departed_node_is_pruned_from_alive_sets_only() {
        let name = CacheName::from("c");
        let local = cache_node(1, vec![plain("c")]);
        let remote = cache_node(2, vec![plain("c")]);
        let snapshot = TopologySnapshot::new(
            Arc::clone(&local),
            vec![Arc::clone(&remote)],
            |_| true,
        );

        assert_eq!(snapshot.alive_cache_nodes(&name, None).len(), 2);
        assert_eq!(snapshot.alive_remote_cache_nodes(&name, None).len(), 1);

        snapshot.update_alives(&remote);
        assert_eq!(snapshot.alive_cache_nodes(&name, None), vec![Arc::clone(&local)]);
        assert!(snapshot.alive_remote_cache_nodes(&name, None).is_empty());
        // Historical views keep the full membership.
        assert_eq!(snapshot.cache_nodes(&name, None).len(), 2);
    }

    #[test]
    fn departure_of_a_later_joiner_does_not_touch_alive_sets() {
        let name = CacheName::from("c");
        let local = cache_node(1, vec![plain("c")]);
        let snapshot = TopologySnapshot::new(Arc::clone(&local), Vec::new(), |_| true);

        // Joined after this snapshot was taken, so its order exceeds
        // max_order and the prune is a no-op.
        let later = cache_node(9, vec![plain("c")]);
        snapshot.update_alives(&later);
        assert_eq!(snapshot.alive_cache_nodes(&name, None).len(), 1);
    }

    #[test]
    fn dead_at_build_time_is_excluded_from_alive_sets() {
        let name = CacheName::from("c");
        let local = cache_node(1, vec![plain("c")]);
        let dead = cache_node(2, vec![plain("c")]);
        let dead_id = dead.id();
        let snapshot = TopologySnapshot::new(Arc::clone(&local), vec![dead], move |id| {
            id != dead_id
        });

        assert_eq!(snapshot.cache_nodes(&name, None).len(), 2);
        assert_eq!(snapshot.alive_cache_nodes(&name, None).len(), 1);
    }

    #[test]
    fn elder_nodes_returns_inclusive_version_bucket() {
        let v1 = ProductVersion::new(1, 0, 0);
        let v2 = ProductVersion::new(1, 2, 0);
        let v3 = ProductVersion::new(2, 0, 0);
        let local = versioned_node(1, v1);
        let snapshot = TopologySnapshot::new(
            local,
            vec![versioned_node(2, v2), versioned_node(3, v3)],
            |_| true,
        );

        assert_eq!(snapshot.elder_nodes(v1).len(), 3);
        assert_eq!(snapshot.elder_nodes(v2).len(), 2);
        assert_eq!(snapshot.elder_nodes(v3).len(), 1);
        assert!(snapshot.elder_nodes(ProductVersion::new(9, 0, 0)).is_empty());
    }

    proptest! {
        #[test]
        fn version_buckets_hold_every_node_at_or_above_the_key(
            versions in proptest::collection::vec((1_u16..5, 0_u16..5, 0_u16..5), 1..12)
        ) {
            let mut order = 0_u64;
            let mut nodes = versions.iter().map(|(major, minor, maintenance)| {
                order += 1;
                versioned_node(order, ProductVersion::new(*major, *minor, *maintenance))
            });
            let local = nodes.next().expect("at least one node");
            let remotes: Vec<_> = nodes.collect();
            let snapshot = TopologySnapshot::new(Arc::clone(&local), remotes, |_| true);

            for (version, bucket) in snapshot.versions_map() {
                let expected: HashSet<NodeId> = snapshot
                    .all_nodes()
                    .iter()
                    .filter(|node| node.version() >= *version)
                    .map(|node| node.id())
                    .collect();
                let actual: HashSet<NodeId> = bucket.iter().map(|node| node.id()).collect();
                prop_assert_eq!(actual, expected);
            }
        }
    }
}
