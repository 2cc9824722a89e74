//! Grid event model and the local event bus.
//!
//! Event type codes are part of the wire contract and stable across the
//! cluster; never renumber them. Subscribers are held in a copy-on-write
//! slice so publishing never takes a lock, and a subscriber may
//! unsubscribe (itself included) from inside its own callback.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cluster::node::{NodeId, NodeView};

/// Grid event types with their stable integer codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum EventType {
    /// A node joined the topology.
    NodeJoined = 10,
    /// A node left the topology gracefully.
    NodeLeft = 11,
    /// A node was detected as failed.
    NodeFailed = 12,
    /// A node's metrics heartbeat was refreshed.
    NodeMetricsUpdated = 13,
    /// The local node lost its network segment.
    NodeSegmented = 14,
    /// The local node rejoined after segmentation.
    NodeReconnected = 15,
    /// A compute task resource was deployed locally.
    TaskDeployed = 16,
    /// A compute task resource was undeployed locally.
    TaskUndeployed = 17,
    /// Deploying a compute task resource failed.
    TaskDeployFailed = 18,
    /// A non-task resource was deployed locally.
    ClassDeployed = 19,
    /// A non-task resource was undeployed locally.
    ClassUndeployed = 20,
    /// Deploying a non-task resource failed.
    ClassDeployFailed = 21,
}

/// Membership events delivered by the discovery transport.
pub const DISCOVERY_EVENTS: [EventType; 6] = [
    EventType::NodeJoined,
    EventType::NodeLeft,
    EventType::NodeFailed,
    EventType::NodeMetricsUpdated,
    EventType::NodeSegmented,
    EventType::NodeReconnected,
];

/// Events that advance the topology version.
pub const TOPOLOGY_CHANGE_EVENTS: [EventType; 4] = [
    EventType::NodeJoined,
    EventType::NodeLeft,
    EventType::NodeFailed,
    EventType::NodeReconnected,
];

impl EventType {
    /// Stable wire code of the event type.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Resolves a wire code back to an event type.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            10 => Some(Self::NodeJoined),
            11 => Some(Self::NodeLeft),
            12 => Some(Self::NodeFailed),
            13 => Some(Self::NodeMetricsUpdated),
            14 => Some(Self::NodeSegmented),
            15 => Some(Self::NodeReconnected),
            16 => Some(Self::TaskDeployed),
            17 => Some(Self::TaskUndeployed),
            18 => Some(Self::TaskDeployFailed),
            19 => Some(Self::ClassDeployed),
            20 => Some(Self::ClassUndeployed),
            21 => Some(Self::ClassDeployFailed),
            _ => None,
        }
    }

    /// Upper-case wire name, matching the code table.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::NodeJoined => "NODE_JOINED",
            Self::NodeLeft => "NODE_LEFT",
            Self::NodeFailed => "NODE_FAILED",
            Self::NodeMetricsUpdated => "NODE_METRICS_UPDATED",
            Self::NodeSegmented => "NODE_SEGMENTED",
            Self::NodeReconnected => "NODE_RECONNECTED",
            Self::TaskDeployed => "TASK_DEPLOYED",
            Self::TaskUndeployed => "TASK_UNDEPLOYED",
            Self::TaskDeployFailed => "TASK_DEPLOY_FAILED",
            Self::ClassDeployed => "CLASS_DEPLOYED",
            Self::ClassUndeployed => "CLASS_UNDEPLOYED",
            Self::ClassDeployFailed => "CLASS_DEPLOY_FAILED",
        }
    }

    /// Whether this is a discovery (membership) event.
    #[must_use]
    pub const fn is_discovery(self) -> bool {
        self.code() <= Self::NodeReconnected.code()
    }
}

/// Payload specific to the event family.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// Membership change observed through discovery.
    Discovery {
        /// The node the event is about.
        node: NodeView,
        /// Topology version stamped on the event.
        top_version: u64,
        /// Non-daemon topology as of the event.
        snapshot: Arc<Vec<NodeView>>,
    },
    /// Local deployment store change.
    Deployment {
        /// Alias of the affected resource.
        alias: String,
    },
}

/// A recorded grid event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Type of the event.
    pub kind: EventType,
    /// Local node that recorded the event.
    pub local_node: NodeId,
    /// When the event was recorded locally.
    pub timestamp: DateTime<Utc>,
    /// Human-readable description.
    pub message: String,
    /// Family-specific payload.
    pub payload: EventPayload,
}

impl Event {
    /// Topology version for discovery events, absent for deployment events.
    #[must_use]
    pub fn top_version(&self) -> Option<u64> {
        match &self.payload {
            EventPayload::Discovery { top_version, .. } => Some(*top_version),
            EventPayload::Deployment { .. } => None,
        }
    }

    /// The node a discovery event is about.
    #[must_use]
    pub fn event_node(&self) -> Option<&NodeView> {
        match &self.payload {
            EventPayload::Discovery { node, .. } => Some(node),
            EventPayload::Deployment { .. } => None,
        }
    }
}

/// Bitmask over the event-code range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct EventMask(u32);

impl EventMask {
    const ALL: Self = Self(u32::MAX);

    fn of(types: &[EventType]) -> Self {
        let mut mask = 0;
        for kind in types {
            mask |= Self::bit(*kind);
        }
        Self(mask)
    }

    const fn bit(kind: EventType) -> u32 {
        1 << (kind.code() - EventType::NodeJoined.code())
    }

    const fn contains(self, kind: EventType) -> bool {
        self.0 & Self::bit(kind) != 0
    }
}

/// Handle for removing an event subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    interested: EventMask,
    handler: Box<dyn Fn(&Event) + Send + Sync>,
}

/// Local event bus: typed subscriptions plus a bounded buffer of recently
/// recorded events for diagnostics.
pub struct EventBus {
    subs: ArcSwap<Vec<Arc<Subscription>>>,
    write_lock: Mutex<()>,
    next_id: AtomicU64,
    recordable: EventMask,
    recent: Mutex<VecDeque<Event>>,
    recent_capacity: usize,
}

impl EventBus {
    /// Creates a bus. `recordable` limits which non-discovery event types
    /// are retained in the recent-event buffer (`None` retains all);
    /// discovery events are always recordable. Subscribers are notified of
    /// every published event regardless.
    #[must_use]
    pub fn new(recordable: Option<&[EventType]>, recent_capacity: usize) -> Self {
        Self {
            subs: ArcSwap::from_pointee(Vec::new()),
            write_lock: Mutex::new(()),
            next_id: AtomicU64::new(0),
            recordable: recordable.map_or(EventMask::ALL, EventMask::of),
            recent: Mutex::new(VecDeque::new()),
            recent_capacity,
        }
    }

    /// Whether events of this type are retained when recorded.
    #[must_use]
    pub fn is_recordable(&self, kind: EventType) -> bool {
        kind.is_discovery() || self.recordable.contains(kind)
    }

    /// Registers a handler for the given event types.
    pub fn subscribe<F>(&self, types: &[EventType], handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let sub = Arc::new(Subscription {
            id,
            interested: EventMask::of(types),
            handler: Box::new(handler),
        });

        let _guard = self.write_lock.lock();
        let mut subs = self.subs.load().as_ref().clone();
        subs.push(sub);
        self.subs.store(Arc::new(subs));
        id
    }

    /// Removes a subscription. Returns whether it was present.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let _guard = self.write_lock.lock();
        let mut subs = self.subs.load().as_ref().clone();
        let before = subs.len();
        subs.retain(|sub| sub.id != id);
        let removed = subs.len() != before;
        if removed {
            self.subs.store(Arc::new(subs));
        }
        removed
    }

    /// Records an event: stores it in the recent buffer (when recordable)
    /// and notifies every interested subscriber, in registration order.
    ///
    /// Handlers run on the publishing thread (for membership events, the
    /// discovery worker) and must neither block nor panic; a handler is
    /// responsible for its own isolation.
    pub fn publish(&self, event: &Event) {
        if self.is_recordable(event.kind) {
            let mut recent = self.recent.lock();
            while recent.len() >= self.recent_capacity.max(1) {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }

        let subs = self.subs.load();
        for sub in subs.iter() {
            if sub.interested.contains(event.kind) {
                (sub.handler)(event);
            }
        }
    }

    /// Recently recorded events, oldest first.
    #[must_use]
    pub fn recent_events(&self) -> Vec<Event> {
        self.recent.lock().iter().cloned().collect()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subs.load().len())
            .field("recent", &self.recent.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    fn discovery_event(kind: EventType, top_version: u64) -> Event {
        Event {
            kind,
            local_node: Uuid::nil(),
            timestamp: Utc::now(),
            message: kind.name().to_owned(),
            payload: EventPayload::Discovery {
                node: NodeView {
                    id: Uuid::nil(),
                    order: top_version,
                    daemon: false,
                    addresses: Vec::new(),
                    attributes: crate::cluster::node::NodeAttributes::new(),
                },
                top_version,
                snapshot: Arc::new(Vec::new()),
            },
        }
    }

    #[test]
    fn codes_round_trip() {
        for kind in [
            EventType::NodeJoined,
            EventType::NodeSegmented,
            EventType::TaskDeployed,
            EventType::ClassDeployFailed,
        ] {
            assert_eq!(EventType::from_code(kind.code()), Some(kind));
        }
        assert_eq!(EventType::from_code(9), None);
        assert_eq!(EventType::NodeJoined.code(), 10);
        assert_eq!(EventType::ClassDeployFailed.code(), 21);
    }

    #[test]
    fn subscribers_only_see_interesting_types() {
        let bus = EventBus::new(None, 16);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        bus.subscribe(&[EventType::NodeLeft], move |event| {
            assert_eq!(event.kind, EventType::NodeLeft);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&discovery_event(EventType::NodeJoined, 1));
        bus.publish(&discovery_event(EventType::NodeLeft, 2));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribed_handler_stops_firing() {
        let bus = EventBus::new(None, 16);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let id = bus.subscribe(&DISCOVERY_EVENTS, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(&discovery_event(EventType::NodeJoined, 1));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&discovery_event(EventType::NodeJoined, 2));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn recent_buffer_is_bounded() {
        let bus = EventBus::new(None, 2);
        for version in 1..=5 {
            bus.publish(&discovery_event(EventType::NodeJoined, version));
        }
        let recent = bus.recent_events();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].top_version(), Some(4));
        assert_eq!(recent[1].top_version(), Some(5));
    }

    #[test]
    fn discovery_events_are_always_recordable() {
        let bus = EventBus::new(Some(&[EventType::TaskDeployed]), 16);
        assert!(bus.is_recordable(EventType::NodeFailed));
        assert!(bus.is_recordable(EventType::TaskDeployed));
        assert!(!bus.is_recordable(EventType::ClassDeployed));
    }

    #[test]
    fn handler_may_unsubscribe_itself() {
        let bus = Arc::new(EventBus::new(None, 16));
        let seen = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));

        let bus2 = Arc::clone(&bus);
        let slot2 = Arc::clone(&slot);
        let counter = Arc::clone(&seen);
        let id = bus.subscribe(&[EventType::NodeJoined], move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            if let Some(id) = *slot2.lock() {
                bus2.unsubscribe(id);
            }
        });
        *slot.lock() = Some(id);

        bus.publish(&discovery_event(EventType::NodeJoined, 1));
        bus.publish(&discovery_event(EventType::NodeJoined, 2));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
