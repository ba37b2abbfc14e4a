//! Subscription registry: event-type key → ordered consumers.
//!
//! The active-key set is derived from the consumer map itself. An entry is
//! removed in the same locked operation that removes its last consumer, so
//! there is never an observable key that is active but has no consumers.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use anyhow::Context;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Notify;

use dispatch_protocol::{ConnectionData, ConnectionStatus, Envelope, EventKind};

/// What a consumer returns. An `Err` is logged with the event type and
/// never reaches other consumers.
pub type ConsumerResult = anyhow::Result<()>;

pub(crate) type DataConsumer = Arc<dyn Fn(&Value) -> ConsumerResult + Send + Sync>;
pub(crate) type EnvelopeConsumer = Arc<dyn Fn(&Envelope) -> ConsumerResult + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Consumer {
    /// Receives the envelope's `data` (exact-type subscriptions)
    Data(DataConsumer),
    /// Receives the whole envelope (wildcard subscriptions)
    Envelope(EnvelopeConsumer),
}

/// Key a consumer subscribes under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKey {
    /// Exact envelope `type`
    Kind(String),
    /// Every raw message received from the peer
    AllMessages,
}

impl EventKey {
    pub fn kind(kind: impl Into<String>) -> Self {
        EventKey::Kind(kind.into())
    }

    /// Name announced to the peer, if the peer should know about this key.
    ///
    /// The wildcard and the local `connection` key never leave the client.
    pub fn wire_name(&self) -> Option<&str> {
        match self {
            EventKey::Kind(kind) if kind != EventKind::CONNECTION => Some(kind),
            _ => None,
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKey::Kind(kind) => f.write_str(kind),
            EventKey::AllMessages => f.write_str("*"),
        }
    }
}

struct Registered {
    id: u64,
    consumer: Consumer,
}

#[derive(Default)]
struct RegistryState {
    consumers: HashMap<EventKey, Vec<Registered>>,
    next_id: u64,
}

pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
    interest_changed: Notify,
}

impl SubscriptionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(RegistryState::default()),
            interest_changed: Notify::new(),
        })
    }

    /// Subscribe to the `data` of every envelope of type `kind`.
    pub fn subscribe<F>(self: &Arc<Self>, kind: &str, consumer: F) -> Subscription
    where
        F: Fn(&Value) -> ConsumerResult + Send + Sync + 'static,
    {
        self.insert(EventKey::kind(kind), Consumer::Data(Arc::new(consumer)))
    }

    /// Subscribe to `kind` with the payload decoded into `T`.
    ///
    /// A payload that does not decode counts as a failure of this consumer.
    pub fn subscribe_as<T, F>(self: &Arc<Self>, kind: &str, consumer: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> ConsumerResult + Send + Sync + 'static,
    {
        let kind_name = kind.to_string();
        self.subscribe(kind, move |data| {
            let payload = T::deserialize(data).with_context(|| {
                format!(
                    "`{}` payload does not decode as {}",
                    kind_name,
                    std::any::type_name::<T>()
                )
            })?;
            consumer(payload)
        })
    }

    /// Subscribe to every raw message from the peer, as full envelopes.
    pub fn subscribe_all<F>(self: &Arc<Self>, consumer: F) -> Subscription
    where
        F: Fn(&Envelope) -> ConsumerResult + Send + Sync + 'static,
    {
        self.insert(EventKey::AllMessages, Consumer::Envelope(Arc::new(consumer)))
    }

    /// Subscribe to local connectivity changes.
    pub fn on_connection<F>(self: &Arc<Self>, consumer: F) -> Subscription
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.subscribe(EventKind::CONNECTION, move |data| {
            let ConnectionData { status } = ConnectionData::deserialize(data)?;
            consumer(status);
            Ok(())
        })
    }

    pub(crate) fn insert(self: &Arc<Self>, key: EventKey, consumer: Consumer) -> Subscription {
        let (id, activated) = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            let entry = state.consumers.entry(key.clone()).or_default();
            let activated = entry.is_empty();
            entry.push(Registered { id, consumer });
            (id, activated)
        };

        if activated {
            tracing::debug!(key = %key, "event key became active");
            self.interest_changed.notify_one();
        }

        Subscription {
            registry: Arc::downgrade(self),
            key,
            id,
            active: AtomicBool::new(true),
        }
    }

    /// Remove one consumer. Returns whether it was still registered.
    fn remove(&self, key: &EventKey, id: u64) -> bool {
        let (removed, deactivated) = {
            let mut state = self.state.lock();
            let Some(entry) = state.consumers.get_mut(key) else {
                return false;
            };
            let before = entry.len();
            entry.retain(|registered| registered.id != id);
            let removed = entry.len() != before;
            let deactivated = entry.is_empty();
            if deactivated {
                state.consumers.remove(key);
            }
            (removed, deactivated)
        };

        if deactivated {
            tracing::debug!(key = %key, "event key became inactive");
            self.interest_changed.notify_one();
        }
        removed
    }

    /// Consumers for `key` in insertion order, copied out of the lock.
    pub(crate) fn snapshot(&self, key: &EventKey) -> Vec<Consumer> {
        let state = self.state.lock();
        state
            .consumers
            .get(key)
            .map(|entry| entry.iter().map(|r| r.consumer.clone()).collect())
            .unwrap_or_default()
    }

    /// Keys with at least one consumer.
    pub fn active_keys(&self) -> BTreeSet<EventKey> {
        self.state.lock().consumers.keys().cloned().collect()
    }

    /// Active keys the peer should push.
    pub fn wire_keys(&self) -> BTreeSet<String> {
        self.state
            .lock()
            .consumers
            .keys()
            .filter_map(|key| key.wire_name().map(str::to_string))
            .collect()
    }

    pub fn is_active(&self, key: &EventKey) -> bool {
        self.state.lock().consumers.contains_key(key)
    }

    pub fn consumer_count(&self, key: &EventKey) -> usize {
        self.state
            .lock()
            .consumers
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Resolves once the active-key set changed since the last call.
    pub(crate) async fn interest_changed(&self) {
        self.interest_changed.notified().await;
    }
}

/// Owned handle to one registered consumer.
///
/// Dropping the handle unsubscribes. Call [`Subscription::detach`] to keep
/// the consumer for as long as the registry lives.
#[must_use = "dropping a Subscription unsubscribes its consumer"]
pub struct Subscription {
    registry: Weak<SubscriptionRegistry>,
    key: EventKey,
    id: u64,
    active: AtomicBool,
}

impl Subscription {
    pub fn key(&self) -> &EventKey {
        &self.key
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Remove this consumer. Further calls are no-ops.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.key, self.id);
        }
    }

    /// Give up the handle without unsubscribing.
    pub fn detach(self) {
        self.active.store(false, Ordering::Release);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn noop(_: &Value) -> ConsumerResult {
        Ok(())
    }

    fn keys(registry: &SubscriptionRegistry) -> Vec<String> {
        registry.active_keys().iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_active_keys_track_live_consumers() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.active_keys().is_empty());

        let a = registry.subscribe("incident_status", noop);
        let b = registry.subscribe("incident_status", noop);
        let c = registry.subscribe("traffic_update", noop);
        assert_eq!(keys(&registry), vec!["incident_status", "traffic_update"]);
        assert_eq!(registry.consumer_count(&EventKey::kind("incident_status")), 2);

        a.unsubscribe();
        assert_eq!(keys(&registry), vec!["incident_status", "traffic_update"]);
        assert_eq!(registry.consumer_count(&EventKey::kind("incident_status")), 1);

        b.unsubscribe();
        assert_eq!(keys(&registry), vec!["traffic_update"]);
        assert!(!registry.is_active(&EventKey::kind("incident_status")));

        drop(c);
        assert!(registry.active_keys().is_empty());
    }

    #[test]
    fn test_unsubscribe_twice_is_noop() {
        let registry = SubscriptionRegistry::new();
        let first = registry.subscribe("vehicle_location", noop);
        let _second = registry.subscribe("vehicle_location", noop);

        first.unsubscribe();
        first.unsubscribe();
        assert!(!first.is_active());
        assert_eq!(registry.consumer_count(&EventKey::kind("vehicle_location")), 1);
    }

    #[test]
    fn test_detach_keeps_consumer() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("new_notification", noop).detach();
        assert!(registry.is_active(&EventKey::kind("new_notification")));
    }

    #[test]
    fn test_wire_keys_exclude_local_keys() {
        let registry = SubscriptionRegistry::new();
        let _a = registry.subscribe("incident_status", noop);
        let _b = registry.on_connection(|_| {});
        let _c = registry.subscribe_all(|_| Ok(()));

        assert_eq!(registry.active_keys().len(), 3);
        assert_eq!(
            registry.wire_keys().into_iter().collect::<Vec<_>>(),
            vec!["incident_status".to_string()]
        );
    }

    #[test]
    fn test_handle_outliving_registry() {
        let registry = SubscriptionRegistry::new();
        let subscription = registry.subscribe("traffic_update", noop);
        drop(registry);
        subscription.unsubscribe();
        assert!(!subscription.is_active());
    }

    #[test]
    fn test_active_keys_match_model_under_random_operations() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        const KINDS: [&str; 4] = [
            "vehicle_location",
            "incident_status",
            "traffic_update",
            "new_notification",
        ];

        let mut rng = StdRng::seed_from_u64(7);
        let registry = SubscriptionRegistry::new();
        let mut handles: Vec<Subscription> = Vec::new();
        // Live consumers per key, detached ones included.
        let mut model: HashMap<EventKey, usize> = HashMap::new();

        for step in 0..2000 {
            let pick = (!handles.is_empty()).then(|| rng.gen_range(0..handles.len()));
            match (rng.gen_range(0..10), pick) {
                (0..=3, _) | (_, None) => {
                    let kind = KINDS[rng.gen_range(0..KINDS.len())];
                    handles.push(registry.subscribe(kind, noop));
                    *model.entry(EventKey::kind(kind)).or_default() += 1;
                }
                (4..=5, Some(index)) => {
                    let handle = &handles[index];
                    if handle.is_active() {
                        *model.entry(handle.key().clone()).or_default() -= 1;
                    }
                    handle.unsubscribe();
                    handle.unsubscribe();
                }
                (6..=7, Some(index)) => {
                    let handle = handles.swap_remove(index);
                    if handle.is_active() {
                        *model.entry(handle.key().clone()).or_default() -= 1;
                    }
                    drop(handle);
                }
                (_, Some(index)) => {
                    handles.swap_remove(index).detach();
                }
            }

            let expected: BTreeSet<EventKey> = model
                .iter()
                .filter(|(_, count)| **count > 0)
                .map(|(key, _)| key.clone())
                .collect();
            assert_eq!(registry.active_keys(), expected, "step {}", step);
            for (key, count) in &model {
                assert_eq!(registry.consumer_count(key), *count, "step {}", step);
            }
        }
    }

    #[tokio::test]
    async fn test_interest_change_is_signalled() {
        let registry = SubscriptionRegistry::new();
        let subscription = registry.subscribe("traffic_update", noop);
        tokio::time::timeout(Duration::from_secs(1), registry.interest_changed())
            .await
            .expect("activation should notify");

        // A second consumer for an already active key changes nothing.
        let _other = registry.subscribe("traffic_update", noop);
        drop(subscription);
        let pending =
            tokio::time::timeout(Duration::from_millis(50), registry.interest_changed()).await;
        assert!(pending.is_err());
    }
}
