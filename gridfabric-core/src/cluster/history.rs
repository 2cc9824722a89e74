//! Bounded history of topology snapshots, keyed by topology version.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cluster::snapshot::TopologySnapshot;

/// Version-ordered snapshot history. Bounded: inserting past capacity
/// evicts the eldest version. Written from the transport callback, read
/// from every topology query.
pub struct TopologyHistory {
    entries: RwLock<BTreeMap<u64, Arc<TopologySnapshot>>>,
    capacity: usize,
}

impl TopologyHistory {
    /// Creates a history retaining at most `capacity` snapshots.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Stores a snapshot, evicting the eldest entry when full. Replaying
    /// an already-present version replaces it in place.
    pub fn insert(&self, version: u64, snapshot: Arc<TopologySnapshot>) {
        let mut entries = self.entries.write();
        entries.insert(version, snapshot);
        while entries.len() > self.capacity {
            entries.pop_first();
        }
    }

    /// Snapshot stored for exactly this version.
    #[must_use]
    pub fn get(&self, version: u64) -> Option<Arc<TopologySnapshot>> {
        self.entries.read().get(&version).cloned()
    }

    /// Eldest retained entry, if any.
    #[must_use]
    pub fn eldest(&self) -> Option<(u64, Arc<TopologySnapshot>)> {
        self.entries
            .read()
            .first_key_value()
            .map(|(version, snapshot)| (*version, Arc::clone(snapshot)))
    }

    /// All retained snapshots, eldest first.
    #[must_use]
    pub fn snapshots(&self) -> Vec<Arc<TopologySnapshot>> {
        self.entries.read().values().cloned().collect()
    }

    /// Retained versions, for diagnostics.
    #[must_use]
    pub fn versions(&self) -> Vec<u64> {
        self.entries.read().keys().copied().collect()
    }

    /// Drops every entry. Used when the node leaves the topology on
    /// segmentation.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl std::fmt::Debug for TopologyHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyHistory")
            .field("capacity", &self.capacity)
            .field("versions", &self.versions())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::node::{Node, NodeAttributes, ProductVersion};
    use uuid::Uuid;

    fn snapshot(order: u64) -> Arc<TopologySnapshot> {
        let local = Arc::new(Node::new(
            Uuid::new_v4(),
            order,
            Vec::new(),
            false,
            ProductVersion::default(),
            NodeAttributes::new(),
        ));
        Arc::new(TopologySnapshot::new(local, Vec::new(), |_| true))
    }

    #[test]
    fn eldest_entry_is_evicted_past_capacity() {
        let history = TopologyHistory::new(3);
        for version in 1..=5 {
            history.insert(version, snapshot(version));
        }

        assert_eq!(history.len(), 3);
        assert_eq!(history.versions(), vec![3, 4, 5]);
        assert!(history.get(1).is_none());
        assert_eq!(history.eldest().map(|(version, _)| version), Some(3));
    }

    #[test]
    fn replayed_version_replaces_in_place() {
        let history = TopologyHistory::new(3);
        history.insert(1, snapshot(1));
        let replacement = snapshot(1);
        history.insert(1, Arc::clone(&replacement));

        assert_eq!(history.len(), 1);
        assert!(Arc::ptr_eq(&history.get(1).expect("present"), &replacement));
    }

    #[test]
    fn clear_empties_the_history() {
        let history = TopologyHistory::new(4);
        history.insert(1, snapshot(1));
        history.insert(2, snapshot(2));
        history.clear();
        assert!(history.is_empty());
        assert!(history.eldest().is_none());
    }
}
