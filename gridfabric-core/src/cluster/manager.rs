//! Discovery manager: owns the transport, serializes membership events
//! onto a single worker and maintains the versioned topology timeline.
//!
//! The transport callback runs inline on the transport thread and only
//! updates state: it rewinds alive sets, installs the new snapshot,
//! advances the topology version and enqueues the event. Everything that
//! may block (attribute validation, listener dispatch, segmentation
//! hand-off) happens on the discovery worker.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cluster::balancer;
use crate::cluster::config::SegmentationPolicy;
use crate::cluster::error::ClusterError;
use crate::cluster::history::TopologyHistory;
use crate::cluster::node::{CacheName, Node, NodeId, ProductVersion};
use crate::cluster::segmentation::{SEGMENT_RETRY_INTERVAL, SegmentationState};
use crate::cluster::snapshot::TopologySnapshot;
use crate::cluster::transport::{DiscoveryTransport, JoinDataExchange, TopologyDelivery};
use crate::context::GridContext;
use crate::event::{Event, EventPayload, EventType, TOPOLOGY_CHANGE_EVENTS};
use crate::future::GridFuture;
use crate::metrics::{
    IoMetricsSource, MetricsProvider, NodeMetrics, NullIoMetrics, ProcessMetricsSource,
    VmMetricsSource,
};

/// CRC32 hash over the sorted node id strings. Stable across the cluster;
/// used to recognize an unchanged topology.
#[must_use]
pub fn topology_hash(nodes: &[Arc<Node>]) -> u64 {
    if nodes.is_empty() {
        return 0;
    }
    let mut ids: Vec<String> = nodes.iter().map(|node| node.id().to_string()).collect();
    ids.sort_unstable();
    let mut hasher = crc32fast::Hasher::new();
    for id in &ids {
        hasher.update(id.as_bytes());
    }
    u64::from(hasher.finalize())
}

enum WorkerMsg {
    Event(RawEvent),
    Cancel,
}

struct RawEvent {
    kind: EventType,
    top_version: u64,
    node: Arc<Node>,
    snapshot: Vec<Arc<Node>>,
}

/// Cluster membership and topology manager.
pub struct DiscoveryManager {
    inner: Arc<Inner>,
}

struct Inner {
    ctx: Arc<GridContext>,
    transport: Arc<dyn DiscoveryTransport>,
    seg: SegmentationState,
    top_version: AtomicU64,
    current: ArcSwapOption<TopologySnapshot>,
    history: TopologyHistory,
    raw_history: RwLock<BTreeMap<u64, Vec<Arc<Node>>>>,
    local: ArcSwapOption<Node>,
    local_join: Mutex<Option<Event>>,
    last_acked: AtomicU64,
    events_tx: Sender<WorkerMsg>,
    events_rx: Mutex<Option<Receiver<WorkerMsg>>>,
    seg_check_tx: Sender<()>,
    seg_check_rx: Mutex<Option<Receiver<()>>>,
    recon_tx: Sender<()>,
    recon_rx: Mutex<Option<Receiver<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
    stopping: AtomicBool,
    vm_source: Arc<dyn VmMetricsSource>,
    io_source: Arc<dyn IoMetricsSource>,
    start_time: DateTime<Utc>,
}

impl DiscoveryManager {
    /// Creates a manager around a transport. Nothing runs until
    /// [`Self::start`].
    #[must_use]
    pub fn new(ctx: Arc<GridContext>, transport: Arc<dyn DiscoveryTransport>) -> Self {
        let resolvers = ctx.config().segmentation.resolvers.clone();
        let history_size = ctx.config().discovery_history_size;
        let (events_tx, events_rx) = unbounded();
        let (seg_check_tx, seg_check_rx) = unbounded();
        let (recon_tx, recon_rx) = unbounded();

        Self {
            inner: Arc::new(Inner {
                ctx,
                transport,
                seg: SegmentationState::new(resolvers),
                top_version: AtomicU64::new(0),
                current: ArcSwapOption::empty(),
                history: TopologyHistory::new(history_size),
                raw_history: RwLock::new(BTreeMap::new()),
                local: ArcSwapOption::empty(),
                local_join: Mutex::new(None),
                last_acked: AtomicU64::new(0),
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                seg_check_tx,
                seg_check_rx: Mutex::new(Some(seg_check_rx)),
                recon_tx,
                recon_rx: Mutex::new(Some(recon_rx)),
                threads: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                stopping: AtomicBool::new(false),
                vm_source: Arc::new(ProcessMetricsSource),
                io_source: Arc::new(NullIoMetrics),
                start_time: Utc::now(),
            }),
        }
    }

    /// Acquires the transport, installs hooks, runs the pre-join segment
    /// check and starts the workers. On error the caller must still call
    /// [`Self::stop`] to release transport resources.
    pub fn start(&self) -> Result<(), ClusterError> {
        let inner = &self.inner;
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(ClusterError::AlreadyStarted);
        }

        let config = inner.ctx.config();

        if inner.seg.has_resolvers() {
            inner.seg.check_blocking(config.segmentation.wait_on_start)?;
        }

        inner
            .transport
            .set_metrics_provider(Arc::new(CtxMetricsProvider {
                ctx: Arc::clone(&inner.ctx),
                vm: Arc::clone(&inner.vm_source),
                io: Arc::clone(&inner.io_source),
                start_time: inner.start_time,
            }));

        // The reconnect worker starts ahead of the listener so a
        // segmentation observed during join can already be handled.
        if config.segmentation.policy == SegmentationPolicy::Reconnect {
            let worker = Arc::clone(inner);
            let rx = inner
                .recon_rx
                .lock()
                .take()
                .ok_or(ClusterError::AlreadyStarted)?;
            let handle = inner
                .ctx
                .thread_factory("disco-recon-worker")
                .spawn(move || worker.reconnect_loop(&rx))
                .map_err(spawn_error)?;
            inner.threads.lock().push(handle);
        }

        {
            let callback = Arc::clone(inner);
            inner
                .transport
                .set_listener(Some(Box::new(move |delivery| {
                    callback.on_raw_event(delivery);
                })));
        }
        inner
            .transport
            .set_data_exchange(Some(Arc::new(CtxExchange {
                ctx: Arc::clone(&inner.ctx),
            })));

        inner.transport.start()?;

        if inner.seg.has_resolvers() && !config.segmentation.check_frequency.is_zero() {
            let worker = Arc::clone(inner);
            let rx = inner
                .seg_check_rx
                .lock()
                .take()
                .ok_or(ClusterError::AlreadyStarted)?;
            let handle = inner
                .ctx
                .thread_factory("disco-net-seg-chk-worker")
                .spawn(move || worker.segment_check_loop(&rx))
                .map_err(spawn_error)?;
            inner.threads.lock().push(handle);
        }

        let snapshot = inner.snapshot();
        if let Err(err) = inner.check_attributes(snapshot.remote_nodes()) {
            // Nothing observed under this failed join may linger.
            inner.transport.set_listener(None);
            inner.history.clear();
            inner.current.store(None);
            return Err(err);
        }

        let local = inner.transport.local_node();
        inner.ctx.set_local_node_id(local.id());
        inner.top_version.fetch_max(local.order(), Ordering::SeqCst);
        inner.local.store(Some(local));

        let rx = inner
            .events_rx
            .lock()
            .take()
            .ok_or(ClusterError::AlreadyStarted)?;
        let worker = Arc::clone(inner);
        let handle = inner
            .ctx
            .thread_factory("disco-event-worker")
            .spawn(move || worker.discovery_worker_loop(&rx))
            .map_err(spawn_error)?;
        inner.threads.lock().push(handle);

        debug!(version = self.topology_version(), "discovery manager started");
        Ok(())
    }

    /// Detaches the listener, cancels the workers and shuts the transport
    /// down. Idempotent, and safe during segmentation-induced shutdown.
    pub fn stop(&self) -> Result<(), ClusterError> {
        let inner = &self.inner;
        if !inner.started.load(Ordering::SeqCst) || inner.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        inner.transport.set_listener(None);
        inner.stopping.store(true, Ordering::SeqCst);
        let _ = inner.events_tx.send(WorkerMsg::Cancel);
        let _ = inner.seg_check_tx.send(());
        let _ = inner.recon_tx.send(());
        for handle in std::mem::take(&mut *inner.threads.lock()) {
            let _ = handle.join();
        }

        inner.transport.stop()?;
        debug!("discovery manager stopped");
        Ok(())
    }

    /// Current topology version.
    #[must_use]
    pub fn topology_version(&self) -> u64 {
        self.inner.top_version.load(Ordering::SeqCst)
    }

    /// The local node.
    #[must_use]
    pub fn local_node(&self) -> Arc<Node> {
        self.inner.local_node_or_transport()
    }

    /// Event recorded for the local node's own join. Not forwarded to
    /// listeners.
    #[must_use]
    pub fn local_join_event(&self) -> Option<Event> {
        self.inner.local_join.lock().clone()
    }

    /// Node lookup in the current topology, daemons included.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.inner.snapshot().node(id).cloned()
    }

    /// Whether the node is alive, judged by the transport directly. A dead
    /// answer invalidates the cached snapshot so stale reads cannot
    /// outlive the answer.
    #[must_use]
    pub fn alive(&self, id: NodeId) -> bool {
        let alive = self.inner.transport.node(id).is_some();
        if !alive {
            self.inner.current.rcu(|current| match current {
                Some(snapshot) if snapshot.node(id).is_some() => None,
                other => other.clone(),
            });
        }
        alive
    }

    /// Whether at least one of the ids belongs to an alive node.
    #[must_use]
    pub fn alive_any(&self, ids: &[NodeId]) -> bool {
        ids.iter().any(|id| self.alive(*id))
    }

    /// Whether every id belongs to an alive node.
    #[must_use]
    pub fn alive_all(&self, ids: &[NodeId]) -> bool {
        !ids.is_empty() && ids.iter().all(|id| self.alive(*id))
    }

    /// Actively pings a node through the transport.
    #[must_use]
    pub fn ping(&self, id: NodeId) -> bool {
        self.inner.transport.ping(id)
    }

    /// All non-daemon nodes of the current topology.
    #[must_use]
    pub fn all_nodes(&self) -> Vec<Arc<Node>> {
        self.inner.snapshot().all_nodes().to_vec()
    }

    /// All non-daemon remote nodes of the current topology.
    #[must_use]
    pub fn remote_nodes(&self) -> Vec<Arc<Node>> {
        self.inner.snapshot().remote_nodes().to_vec()
    }

    /// All daemon nodes of the current topology.
    #[must_use]
    pub fn daemon_nodes(&self) -> Vec<Arc<Node>> {
        self.inner.snapshot().daemon_nodes().to_vec()
    }

    /// Non-daemon topology size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.inner.snapshot().size()
    }

    /// Current nodes with the given ids, skipping unknown ones.
    #[must_use]
    pub fn nodes_for(&self, ids: &[NodeId]) -> Vec<Arc<Node>> {
        let snapshot = self.inner.snapshot();
        ids.iter()
            .filter_map(|id| snapshot.node(*id).cloned())
            .collect()
    }

    /// Subset of `nodes` the transport still considers alive.
    #[must_use]
    pub fn alive_nodes(&self, nodes: &[Arc<Node>]) -> Vec<Arc<Node>> {
        nodes
            .iter()
            .filter(|node| self.node(node.id()).is_some())
            .cloned()
            .collect()
    }

    /// Nodes with product version at or above `version`.
    #[must_use]
    pub fn elder_nodes(&self, version: ProductVersion) -> Vec<Arc<Node>> {
        self.inner.snapshot().elder_nodes(version)
    }

    /// Current topology grouped by product version.
    #[must_use]
    pub fn topology_version_map(&self) -> BTreeMap<ProductVersion, Vec<Arc<Node>>> {
        self.inner.snapshot().versions_map().clone()
    }

    /// All nodes at the given topology version.
    pub fn nodes(&self, top_version: Option<u64>) -> Result<Vec<Arc<Node>>, ClusterError> {
        Ok(self
            .inner
            .resolve_snapshot(&CacheName::Default, top_version)?
            .all_nodes()
            .to_vec())
    }

    /// Nodes advertising the cache at the given topology version.
    pub fn cache_nodes(
        &self,
        name: &CacheName,
        top_version: Option<u64>,
    ) -> Result<Vec<Arc<Node>>, ClusterError> {
        Ok(self
            .inner
            .resolve_snapshot(name, top_version)?
            .cache_nodes(name, top_version))
    }

    /// Remote nodes advertising the cache at the given topology version.
    pub fn remote_cache_nodes(
        &self,
        name: &CacheName,
        top_version: Option<u64>,
    ) -> Result<Vec<Arc<Node>>, ClusterError> {
        Ok(self
            .inner
            .resolve_snapshot(name, top_version)?
            .remote_cache_nodes(name, top_version))
    }

    /// Still-reachable nodes advertising the cache at the given topology
    /// version.
    pub fn alive_cache_nodes(
        &self,
        name: &CacheName,
        top_version: Option<u64>,
    ) -> Result<Vec<Arc<Node>>, ClusterError> {
        Ok(self
            .inner
            .resolve_snapshot(name, top_version)?
            .alive_cache_nodes(name, top_version))
    }

    /// Still-reachable remote nodes advertising the cache at the given
    /// topology version.
    pub fn alive_remote_cache_nodes(
        &self,
        name: &CacheName,
        top_version: Option<u64>,
    ) -> Result<Vec<Arc<Node>>, ClusterError> {
        Ok(self
            .inner
            .resolve_snapshot(name, top_version)?
            .alive_remote_cache_nodes(name, top_version))
    }

    /// Affinity participants for the cache at the given topology version.
    pub fn cache_affinity_nodes(
        &self,
        name: &CacheName,
        top_version: Option<u64>,
    ) -> Result<Vec<Arc<Node>>, ClusterError> {
        Ok(self
            .inner
            .resolve_snapshot(name, top_version)?
            .cache_affinity_nodes(name, top_version))
    }

    /// Whether the cache has a near-enabled node at the given version.
    pub fn has_near_cache(
        &self,
        name: &CacheName,
        top_version: Option<u64>,
    ) -> Result<bool, ClusterError> {
        Ok(self
            .inner
            .resolve_snapshot(name, top_version)?
            .has_near_cache(name))
    }

    /// Raw transport snapshot at a version, for transports declaring the
    /// history capability.
    pub fn topology(&self, top_version: u64) -> Result<Option<Vec<Arc<Node>>>, ClusterError> {
        if !self.inner.transport.capabilities().history {
            return Err(ClusterError::HistoryUnsupported);
        }
        Ok(self.inner.raw_history.read().get(&top_version).cloned())
    }

    /// Future completing once the topology version reaches `await_version`.
    /// Completes exactly once, with the first version at or above the
    /// awaited one.
    #[must_use]
    pub fn topology_future(&self, await_version: u64) -> GridFuture<u64> {
        let current = self.topology_version();
        if current >= await_version {
            return GridFuture::completed(current);
        }

        let fut = GridFuture::new();
        let bus = Arc::clone(self.inner.ctx.events());
        let listener_fut = fut.clone();
        let sub = bus.subscribe(
            &[
                EventType::NodeJoined,
                EventType::NodeLeft,
                EventType::NodeFailed,
            ],
            move |event| {
                if let Some(version) = event.top_version()
                    && version >= await_version
                {
                    listener_fut.complete(version);
                }
            },
        );

        // Close the window between the version probe and the subscription.
        let current = self.topology_version();
        if current >= await_version {
            fut.complete(current);
        }

        let cleanup = Arc::clone(self.inner.ctx.events());
        fut.listen(move |_| {
            cleanup.unsubscribe(sub);
        });
        fut
    }

    /// Start time of the eldest node in the grid.
    #[must_use]
    pub fn grid_start_time(&self) -> DateTime<Utc> {
        self.inner.transport.grid_start_time()
    }

    /// Least-loaded node of the current topology, for job dispatch.
    #[must_use]
    pub fn balanced_node(&self) -> Option<Arc<Node>> {
        balancer::balanced_node(self.inner.snapshot().all_nodes())
    }

    /// Logs the current topology snapshot line, unthrottled.
    pub fn ack_topology(&self) {
        self.inner.ack_topology(self.topology_version(), false);
    }

    #[cfg(test)]
    pub(crate) fn request_segment_check(&self) {
        let _ = self.inner.seg_check_tx.send(());
    }
}

impl std::fmt::Debug for DiscoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveryManager")
            .field("top_version", &self.topology_version())
            .field("history", &self.inner.history)
            .finish()
    }
}

fn spawn_error(err: std::io::Error) -> ClusterError {
    ClusterError::Configuration(format!("failed to spawn worker thread: {err}"))
}

impl Inner {
    fn local_node_or_transport(&self) -> Arc<Node> {
        self.local
            .load_full()
            .unwrap_or_else(|| self.transport.local_node())
    }

    /// Raw transport callback. Runs inline on the transport thread: state
    /// updates only, no listener dispatch, nothing blocking.
    fn on_raw_event(&self, delivery: TopologyDelivery) {
        let local = self.local_node_or_transport();

        if let Some(history) = delivery.history {
            *self.raw_history.write() = history;
        }

        if matches!(delivery.kind, EventType::NodeLeft | EventType::NodeFailed) {
            for snapshot in self.history.snapshots() {
                snapshot.update_alives(&delivery.node);
            }
        }

        if delivery.kind != EventType::NodeMetricsUpdated {
            let remotes: Vec<Arc<Node>> = delivery
                .snapshot
                .iter()
                .filter(|node| node.id() != local.id())
                .cloned()
                .collect();
            let transport = Arc::clone(&self.transport);
            let snapshot = Arc::new(TopologySnapshot::new(local.clone(), remotes, move |id| {
                transport.node(id).is_some()
            }));
            self.history.insert(delivery.top_version, Arc::clone(&snapshot));
            self.current.store(Some(snapshot));
        }

        // The local join is observed but never forwarded; it is exposed
        // separately through local_join_event().
        if delivery.kind == EventType::NodeJoined && delivery.node.id() == local.id() {
            let event = self.make_discovery_event(
                EventType::NodeJoined,
                delivery.top_version,
                &delivery.node,
                &delivery.snapshot,
                format!("Node joined: {}", delivery.node),
            );
            *self.local_join.lock() = Some(event);
            return;
        }

        if delivery.top_version > 0 && TOPOLOGY_CHANGE_EVENTS.contains(&delivery.kind) {
            self.top_version
                .fetch_max(delivery.top_version, Ordering::SeqCst);
        }

        let _ = self.events_tx.send(WorkerMsg::Event(RawEvent {
            kind: delivery.kind,
            top_version: delivery.top_version,
            node: delivery.node,
            snapshot: delivery.snapshot,
        }));
    }

    fn discovery_worker_loop(&self, rx: &Receiver<WorkerMsg>) {
        let mut node_seg_fired = false;
        loop {
            match rx.recv() {
                Ok(WorkerMsg::Event(event)) => self.process_event(event, &mut node_seg_fired),
                Ok(WorkerMsg::Cancel) | Err(_) => break,
            }
        }
        debug!("discovery worker stopped");
    }

    fn process_event(&self, event: RawEvent, node_seg_fired: &mut bool) {
        let node = Arc::clone(&event.node);
        let daemon = node.is_daemon();
        let local_daemon = self.ctx.config().daemon;
        let ordered = self.transport.capabilities().ordered;
        let mut segmented = false;

        match event.kind {
            EventType::NodeJoined => {
                debug_assert!(
                    !ordered || event.top_version == node.order(),
                    "ordered transport delivered join with top_version != node order"
                );
                if let Err(err) = self.check_attributes(std::slice::from_ref(&node)) {
                    warn!(%err, "joining node carries inconsistent attributes");
                }
                for participant in self.ctx.participants() {
                    participant.on_node_joined(&node);
                }
                if !daemon && !local_daemon {
                    info!(%node, "added new node to topology");
                    self.ack_topology(event.top_version, true);
                } else {
                    debug!(%node, "added new daemon node to topology");
                }
            }
            EventType::NodeLeft => {
                if self.seg.has_resolvers() {
                    let _ = self.seg_check_tx.send(());
                }
                for participant in self.ctx.participants() {
                    participant.on_node_left(&node);
                }
                if !daemon && !local_daemon {
                    info!(%node, "node left topology");
                    self.ack_topology(event.top_version, true);
                } else {
                    debug!(%node, "daemon node left topology");
                }
            }
            EventType::NodeFailed => {
                if self.seg.has_resolvers() {
                    let _ = self.seg_check_tx.send(());
                }
                for participant in self.ctx.participants() {
                    participant.on_node_left(&node);
                }
                if !daemon && !local_daemon {
                    warn!(%node, "node FAILED");
                    self.ack_topology(event.top_version, true);
                } else {
                    debug!(%node, "daemon node FAILED");
                }
            }
            EventType::NodeSegmented => {
                if *node_seg_fired {
                    debug!(%node, "ignored repeated segmentation event");
                    return;
                }
                // Suppress further segmentation events until a reconnect
                // re-arms them.
                *node_seg_fired = true;
                self.last_acked.store(0, Ordering::SeqCst);
                segmented = true;
                warn!(%node, "local node SEGMENTED");
            }
            EventType::NodeReconnected => {
                debug_assert!(
                    !ordered || event.top_version == node.order(),
                    "ordered transport delivered reconnect with top_version != node order"
                );
                *node_seg_fired = false;
                self.seg.set_last_valid(true);
                if !local_daemon {
                    info!(%node, "local node RECONNECTED");
                    self.ack_topology(event.top_version, true);
                }
            }
            // Not logged to avoid flooding; recorded below.
            EventType::NodeMetricsUpdated => {}
            other => {
                debug_assert!(false, "non-discovery event {other:?} on the discovery worker");
                return;
            }
        }

        self.record_event(event.kind, event.top_version, &node, &event.snapshot);

        if segmented {
            self.on_segmentation();
        }
    }

    fn on_segmentation(&self) {
        match self.ctx.config().segmentation.policy {
            SegmentationPolicy::Reconnect => match self.transport.disconnect() {
                Ok(()) => {
                    self.history.clear();
                    let _ = self.recon_tx.send(());
                }
                Err(err) => {
                    error!(%err, "failed to disconnect transport, stopping node");
                    self.stop_node();
                }
            },
            SegmentationPolicy::RestartProcess => {
                if let Err(err) = self.transport.disconnect() {
                    error!(%err, "failed to disconnect transport");
                }
                warn!("restarting process according to configured segmentation policy");
                self.restart_process();
            }
            SegmentationPolicy::Stop => {
                if let Err(err) = self.transport.disconnect() {
                    error!(%err, "failed to disconnect transport");
                }
                warn!("stopping local node according to configured segmentation policy");
                self.stop_node();
            }
            SegmentationPolicy::Noop => {
                warn!("segmentation policy is noop, local node stays detached from topology");
            }
        }
    }

    /// Stop and restart actions never run on the discovery worker; a
    /// pool thread avoids the deadlock with transport shutdown.
    fn stop_node(&self) {
        let lifecycle = Arc::clone(self.ctx.lifecycle());
        if let Err(err) = self
            .ctx
            .worker_pool()
            .execute(move || lifecycle.stop_node())
        {
            warn!(%err, "worker pool rejected stop action, spawning a dedicated thread");
            let lifecycle = Arc::clone(self.ctx.lifecycle());
            if self
                .ctx
                .thread_factory("disco-stop")
                .spawn(move || lifecycle.stop_node())
                .is_err()
            {
                error!("failed to spawn node stop thread");
            }
        }
    }

    fn restart_process(&self) {
        let lifecycle = Arc::clone(self.ctx.lifecycle());
        if let Err(err) = self
            .ctx
            .worker_pool()
            .execute(move || lifecycle.restart_process())
        {
            warn!(%err, "worker pool rejected restart action, spawning a dedicated thread");
            let lifecycle = Arc::clone(self.ctx.lifecycle());
            if self
                .ctx
                .thread_factory("disco-restart")
                .spawn(move || lifecycle.restart_process())
                .is_err()
            {
                error!("failed to spawn process restart thread");
            }
        }
    }

    fn segment_check_loop(&self, rx: &Receiver<()>) {
        let frequency = self.ctx.config().segmentation.check_frequency;
        let mut last_check: Option<Instant> = None;

        while !self.stopping.load(Ordering::Acquire) {
            let requested = match rx.recv_timeout(SEGMENT_RETRY_INTERVAL) {
                Ok(()) => true,
                Err(RecvTimeoutError::Timeout) => false,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if self.stopping.load(Ordering::Acquire) {
                break;
            }
            if !requested
                && (frequency.is_zero()
                    || last_check.is_some_and(|at| at.elapsed() < frequency))
            {
                continue;
            }

            // Coalesce queued requests into this check.
            while rx.try_recv().is_ok() {}

            if self.seg.last_valid() {
                let valid = self.seg.is_valid_segment();
                last_check = Some(Instant::now());
                if !valid {
                    self.seg.set_last_valid(false);
                    let _ = self.events_tx.send(WorkerMsg::Event(RawEvent {
                        kind: EventType::NodeSegmented,
                        top_version: 0,
                        node: self.transport.local_node(),
                        snapshot: Vec::new(),
                    }));
                }
                debug!(requested, valid, "segment checked");
            }
        }
        debug!("segment check worker stopped");
    }

    fn reconnect_loop(&self, rx: &Receiver<()>) {
        while !self.stopping.load(Ordering::Acquire) {
            if rx.recv().is_err() {
                break;
            }
            if self.stopping.load(Ordering::Acquire) {
                break;
            }

            warn!("reconnecting discovery transport to topology per segmentation policy");

            if self.seg.has_resolvers()
                && let Err(err) = self
                    .seg
                    .check_blocking(self.ctx.config().segmentation.wait_on_start)
            {
                error!(%err, "segment is still invalid, stopping node");
                self.stop_node();
                continue;
            }

            self.top_version.store(0, Ordering::SeqCst);

            match self.transport.reconnect() {
                Ok(()) => {
                    self.local.store(Some(self.transport.local_node()));
                }
                Err(err) => {
                    error!(%err, "failed to reconnect discovery transport, stopping node");
                    self.stop_node();
                }
            }
        }
        debug!("reconnect worker stopped");
    }

    /// Current snapshot, building one from live transport state when the
    /// cached reference was invalidated.
    fn snapshot(&self) -> Arc<TopologySnapshot> {
        loop {
            if let Some(snapshot) = self.current.load_full() {
                return snapshot;
            }
            let local = self.local_node_or_transport();
            let remotes = self.transport.remote_nodes();
            let transport = Arc::clone(&self.transport);
            let built = Arc::new(TopologySnapshot::new(local, remotes, move |id| {
                transport.node(id).is_some()
            }));
            self.current.rcu(|current| match current {
                Some(existing) => Some(Arc::clone(existing)),
                None => Some(Arc::clone(&built)),
            });
        }
    }

    /// Resolves the snapshot serving a query: the current one for `None`
    /// or the current version, a history entry otherwise. A version older
    /// than all retained history falls back to the eldest entry.
    fn resolve_snapshot(
        &self,
        cache: &CacheName,
        top_version: Option<u64>,
    ) -> Result<Arc<TopologySnapshot>, ClusterError> {
        match top_version {
            None => Ok(self.snapshot()),
            Some(version) if version == self.top_version.load(Ordering::SeqCst) => {
                Ok(self.snapshot())
            }
            Some(version) => {
                if let Some(snapshot) = self.history.get(version) {
                    return Ok(snapshot);
                }
                if let Some((eldest, snapshot)) = self.history.eldest()
                    && version < eldest
                {
                    return Ok(snapshot);
                }
                warn!(
                    requested = version,
                    history = ?self.history.versions(),
                    "failed to resolve topology version"
                );
                Err(ClusterError::TopologyResolve {
                    cache: cache.clone(),
                    requested: top_version,
                })
            }
        }
    }

    /// Join-time attribute consistency: deployment mode, peer class
    /// loading and data-center id must match (fatal), IPv4 preference and
    /// library drift only warn. Daemons may deploy differently, and the
    /// data-center check binds only non-daemon pairs, so a mixed-daemon
    /// cluster may legitimately contain cross-DC daemons.
    fn check_attributes(&self, nodes: &[Arc<Node>]) -> Result<(), ClusterError> {
        let local = self.local_node_or_transport();
        let local_attrs = local.attributes();
        let local_prefer_ipv4 = local_attrs.prefer_ipv4();
        let local_mode = local_attrs.deployment_mode();
        let local_p2p = local_attrs.peer_class_loading();
        let local_dc = local_attrs.data_center_id();
        let local_libs = local_attrs.libraries().unwrap_or_default();
        let local_daemon = local.is_daemon();

        let mut warned = false;
        for node in nodes {
            if node.id() == local.id() {
                continue;
            }
            let attrs = node.attributes();

            if attrs.prefer_ipv4() != local_prefer_ipv4 {
                if !warned {
                    warn!(
                        remote = %node.id(),
                        local_prefer_ipv4 = ?local_prefer_ipv4,
                        remote_prefer_ipv4 = ?attrs.prefer_ipv4(),
                        "IPv4-preference flag differs between nodes, \
                         all nodes in topology should have an identical value"
                    );
                }
                warned = true;
            }

            if !local_daemon && !node.is_daemon() {
                if attrs.data_center_id() != local_dc {
                    return Err(ClusterError::AttributeMismatch {
                        remote: node.id(),
                        detail: format!(
                            "data center id {:?} differs from local {:?}",
                            attrs.data_center_id(),
                            local_dc
                        ),
                    });
                }
                if attrs.deployment_mode() != local_mode {
                    return Err(ClusterError::AttributeMismatch {
                        remote: node.id(),
                        detail: format!(
                            "deployment mode {:?} differs from local {:?}",
                            attrs.deployment_mode(),
                            local_mode
                        ),
                    });
                }
                if attrs.peer_class_loading() != local_p2p {
                    return Err(ClusterError::AttributeMismatch {
                        remote: node.id(),
                        detail: format!(
                            "peer class loading flag {:?} differs from local {:?}",
                            attrs.peer_class_loading(),
                            local_p2p
                        ),
                    });
                }
            }

            let drift = library_drift(local_libs, attrs.libraries().unwrap_or_default());
            if !drift.is_empty() {
                warn!(
                    remote = %node.id(),
                    ?drift,
                    "library list differs from remote node's, \
                     this may cause incompatibilities (ignore if on purpose)"
                );
            }
        }
        Ok(())
    }

    fn record_event(
        &self,
        kind: EventType,
        top_version: u64,
        node: &Arc<Node>,
        snapshot: &[Arc<Node>],
    ) {
        if !self.ctx.events().is_recordable(kind) {
            return;
        }
        let message = match kind {
            EventType::NodeJoined => format!("Node joined: {node}"),
            EventType::NodeLeft => format!("Node left: {node}"),
            EventType::NodeFailed => format!("Node failed: {node}"),
            EventType::NodeMetricsUpdated => format!("Metrics were updated: {node}"),
            EventType::NodeSegmented => format!("Node segmented: {node}"),
            EventType::NodeReconnected => format!("Node reconnected: {node}"),
            _ => return,
        };
        let event = self.make_discovery_event(kind, top_version, node, snapshot, message);
        self.ctx.events().publish(&event);
    }

    fn make_discovery_event(
        &self,
        kind: EventType,
        top_version: u64,
        node: &Arc<Node>,
        snapshot: &[Arc<Node>],
        message: String,
    ) -> Event {
        let views: Vec<_> = snapshot
            .iter()
            .filter(|member| !member.is_daemon())
            .map(|member| member.view())
            .collect();
        Event {
            kind,
            local_node: self.ctx.local_node_id().unwrap_or_else(Uuid::nil),
            timestamp: Utc::now(),
            message,
            payload: EventPayload::Discovery {
                node: node.view(),
                top_version,
                snapshot: Arc::new(views),
            },
        }
    }

    /// One-line topology summary, throttled by topology hash so an
    /// unchanged node set is never acked twice.
    fn ack_topology(&self, top_version: u64, throttle: bool) {
        if self.ctx.config().daemon {
            return;
        }
        let snapshot = self.snapshot();
        let hash = topology_hash(snapshot.all_nodes());
        if throttle && self.last_acked.swap(hash, Ordering::SeqCst) == hash {
            return;
        }

        let cpus = total_cpus(snapshot.all_nodes());
        let heap = total_heap_bytes(snapshot.all_nodes()) as f64 / f64::from(1 << 30);
        let heap_gb = format!("{heap:.1}");
        let hash_hex = format!("{hash:#x}");
        info!(
            version = top_version,
            nodes = snapshot.size(),
            cpus,
            heap_gb = %heap_gb,
            hash = %hash_hex,
            "topology snapshot"
        );
    }
}

/// Libraries present on exactly one side. Hosts sharing a MAC list are
/// counted once in `total_cpus` since they share the physical machine.
fn library_drift(local: &[String], remote: &[String]) -> Vec<String> {
    let local_set: HashSet<&String> = local.iter().collect();
    let remote_set: HashSet<&String> = remote.iter().collect();
    local_set
        .symmetric_difference(&remote_set)
        .map(|lib| (*lib).clone())
        .collect()
}

fn total_cpus(nodes: &[Arc<Node>]) -> usize {
    let mut seen = HashSet::new();
    let mut cpus = 0;
    for node in nodes {
        let macs = node.attributes().macs().map(|macs| macs.join(","));
        if seen.insert(macs) {
            cpus += node.metrics().cpus;
        }
    }
    cpus
}

fn total_heap_bytes(nodes: &[Arc<Node>]) -> u64 {
    nodes.iter().map(|node| node.metrics().heap_total).sum()
}

struct CtxMetricsProvider {
    ctx: Arc<GridContext>,
    vm: Arc<dyn VmMetricsSource>,
    io: Arc<dyn IoMetricsSource>,
    start_time: DateTime<Utc>,
}

impl MetricsProvider for CtxMetricsProvider {
    fn metrics(&self) -> NodeMetrics {
        let jobs = self.ctx.job_metrics().job_metrics();
        let vm = self.vm.sample();
        let io = self.io.sample();
        let now = Utc::now();

        NodeMetrics {
            last_update: now,
            node_start_time: self.start_time,
            up_time: (now - self.start_time).to_std().unwrap_or_default(),
            cpus: vm.cpus,
            cur_cpu_load: vm.cur_cpu_load,
            avg_cpu_load: jobs.avg_cpu_load,
            heap_used: vm.heap_used,
            heap_total: vm.heap_total,
            thread_count: vm.thread_count,
            peak_thread_count: vm.peak_thread_count,
            max_active_jobs: jobs.max_active_jobs,
            cur_active_jobs: jobs.cur_active_jobs,
            avg_active_jobs: jobs.avg_active_jobs,
            max_waiting_jobs: jobs.max_waiting_jobs,
            cur_waiting_jobs: jobs.cur_waiting_jobs,
            avg_waiting_jobs: jobs.avg_waiting_jobs,
            max_rejected_jobs: jobs.max_rejected_jobs,
            cur_rejected_jobs: jobs.cur_rejected_jobs,
            avg_rejected_jobs: jobs.avg_rejected_jobs,
            max_cancelled_jobs: jobs.max_cancelled_jobs,
            cur_cancelled_jobs: jobs.cur_cancelled_jobs,
            avg_cancelled_jobs: jobs.avg_cancelled_jobs,
            total_executed_jobs: jobs.total_executed_jobs,
            total_rejected_jobs: jobs.total_rejected_jobs,
            total_cancelled_jobs: jobs.total_cancelled_jobs,
            total_executed_tasks: jobs.total_executed_jobs,
            max_job_wait_time: jobs.max_job_wait_time,
            cur_job_wait_time: jobs.cur_job_wait_time,
            avg_job_wait_time: jobs.avg_job_wait_time,
            max_job_execute_time: jobs.max_job_execute_time,
            cur_job_execute_time: jobs.cur_job_execute_time,
            avg_job_execute_time: jobs.avg_job_execute_time,
            cur_idle_time: jobs.cur_idle_time,
            total_idle_time: jobs.total_idle_time,
            sent_messages: io.sent_messages,
            sent_bytes: io.sent_bytes,
            received_messages: io.received_messages,
            received_bytes: io.received_bytes,
            last_data_version: 0,
        }
    }
}

struct CtxExchange {
    ctx: Arc<GridContext>,
}

impl JoinDataExchange for CtxExchange {
    fn collect(&self, joining: NodeId) -> Vec<serde_json::Value> {
        self.ctx
            .participants()
            .iter()
            .map(|participant| participant.collect_join_data(joining))
            .collect()
    }

    fn on_exchange(&self, payloads: Vec<serde_json::Value>) {
        for (participant, payload) in self.ctx.participants().into_iter().zip(payloads) {
            participant.on_join_data(payload);
        }
    }
}
