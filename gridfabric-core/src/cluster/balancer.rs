//! Balanced-node selection for job dispatch.

use std::sync::Arc;

use rand::seq::SliceRandom;

use crate::cluster::node::Node;

/// Picks the least-loaded candidate, judged by queued plus running jobs
/// from the latest metrics heartbeat. Ties are broken uniformly at random
/// so equally idle nodes share the work.
#[must_use]
pub fn balanced_node(candidates: &[Arc<Node>]) -> Option<Arc<Node>> {
    let min_load = candidates
        .iter()
        .map(|node| node.metrics().current_load())
        .min()?;
    let leanest: Vec<&Arc<Node>> = candidates
        .iter()
        .filter(|node| node.metrics().current_load() == min_load)
        .collect();
    leanest
        .choose(&mut rand::thread_rng())
        .map(|node| Arc::clone(node))
}
