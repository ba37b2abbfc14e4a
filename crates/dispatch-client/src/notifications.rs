//! Bounded, newest-first notification log fed by dispatch events.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use uuid::Uuid;

use dispatch_protocol::{
    ConnectionStatus, EventKind, NewNotificationData, NotificationPriority, NotificationType,
    RouteOptimizationData, TrafficUpdateData,
};

use crate::client::DispatchClient;
use crate::registry::{Subscription, SubscriptionRegistry};

const DEFAULT_MESSAGE: &str = "System notification received";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub priority: NotificationPriority,
    pub read: bool,
}

/// A notification before it enters the log.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationDraft {
    /// Preferred id; replaced when missing or already taken
    pub id: Option<String>,
    pub kind: NotificationType,
    pub message: String,
    pub priority: NotificationPriority,
}

impl NotificationDraft {
    pub fn new(
        kind: NotificationType,
        message: impl Into<String>,
        priority: NotificationPriority,
    ) -> Self {
        Self {
            id: None,
            kind,
            message: message.into(),
            priority,
        }
    }

    pub fn from_new_notification(data: &NewNotificationData) -> Self {
        let kind = match data.kind.as_deref() {
            Some(kind) => NotificationType::parse(kind).unwrap_or_else(|| {
                tracing::debug!(kind = %kind, "unknown notification type, using system-alert");
                NotificationType::SystemAlert
            }),
            None => NotificationType::SystemAlert,
        };
        Self {
            id: data.id.clone(),
            kind,
            message: data
                .message
                .clone()
                .unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
            priority: data.priority.unwrap_or(NotificationPriority::Medium),
        }
    }

    pub fn from_route_optimization(data: &RouteOptimizationData) -> Self {
        Self::new(
            NotificationType::RouteUpdate,
            format!("Route optimized for {} - ETA: {}", data.vehicle_id, data.new_eta),
            NotificationPriority::High,
        )
    }

    pub fn from_traffic_update(data: &TrafficUpdateData) -> Self {
        Self::new(
            NotificationType::TrafficAlert,
            format!("Traffic update: {} in {}", data.description, data.area),
            NotificationPriority::Medium,
        )
    }
}

/// The log itself. Every mutation adjusts `unread` together with the
/// entries it touches.
#[derive(Debug, Clone)]
pub struct NotificationLog {
    entries: VecDeque<Notification>,
    capacity: usize,
    unread: usize,
}

impl NotificationLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            unread: 0,
        }
    }

    /// Insert at the head, evicting from the tail past capacity. Returns the
    /// id the notification was stored under.
    pub fn insert(&mut self, draft: NotificationDraft) -> String {
        let id = match draft.id {
            Some(id) if !self.contains(&id) => id,
            _ => Uuid::new_v4().to_string(),
        };

        self.entries.push_front(Notification {
            id: id.clone(),
            kind: draft.kind,
            message: draft.message,
            timestamp: Utc::now(),
            priority: draft.priority,
            read: false,
        });
        self.unread += 1;

        while self.entries.len() > self.capacity {
            if let Some(evicted) = self.entries.pop_back() {
                if !evicted.read {
                    self.unread -= 1;
                }
                tracing::debug!(id = %evicted.id, "evicted oldest notification");
            }
        }

        tracing::debug!(
            id = %id,
            kind = draft.kind.as_str(),
            priority = draft.priority.as_str(),
            "notification added"
        );
        id
    }

    pub fn dismiss(&mut self, id: &str) -> bool {
        let Some(index) = self.position(id) else {
            return false;
        };
        if let Some(removed) = self.entries.remove(index) {
            if !removed.read {
                self.unread -= 1;
            }
        }
        true
    }

    /// Returns whether the entry was unread.
    pub fn mark_read(&mut self, id: &str) -> bool {
        match self.entries.iter_mut().find(|n| n.id == id) {
            Some(entry) if !entry.read => {
                entry.read = true;
                self.unread -= 1;
                true
            }
            _ => false,
        }
    }

    /// Returns how many entries changed.
    pub fn mark_all_read(&mut self) -> usize {
        let mut changed = 0;
        for entry in self.entries.iter_mut().filter(|n| !n.read) {
            entry.read = true;
            changed += 1;
        }
        self.unread = 0;
        changed
    }

    pub fn clear_all(&mut self) {
        self.entries.clear();
        self.unread = 0;
    }

    pub fn unread_count(&self) -> usize {
        self.unread
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn get(&self, id: &str) -> Option<&Notification> {
        self.entries.iter().find(|n| n.id == id)
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter()
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|n| n.id == id)
    }
}

/// Notification log wired to a client's event stream.
///
/// Feeds on `new_notification`, `route_optimization` and `traffic_update`,
/// and tracks connectivity for a status indicator. Dropping the center
/// unsubscribes it.
pub struct NotificationCenter {
    log: Arc<Mutex<NotificationLog>>,
    connected: Arc<AtomicBool>,
    _subscriptions: Vec<Subscription>,
}

impl NotificationCenter {
    pub fn attach(client: &DispatchClient, capacity: usize) -> Self {
        Self::attach_to(client.registry(), capacity)
    }

    pub fn attach_to(registry: &Arc<SubscriptionRegistry>, capacity: usize) -> Self {
        let log = Arc::new(Mutex::new(NotificationLog::new(capacity)));
        let connected = Arc::new(AtomicBool::new(false));

        let sink = log.clone();
        let notifications = registry.subscribe_as::<NewNotificationData, _>(
            EventKind::NEW_NOTIFICATION,
            move |data| {
                sink.lock().insert(NotificationDraft::from_new_notification(&data));
                Ok(())
            },
        );

        let sink = log.clone();
        let routes = registry.subscribe_as::<RouteOptimizationData, _>(
            EventKind::ROUTE_OPTIMIZATION,
            move |data| {
                sink.lock().insert(NotificationDraft::from_route_optimization(&data));
                Ok(())
            },
        );

        let sink = log.clone();
        let traffic = registry.subscribe_as::<TrafficUpdateData, _>(
            EventKind::TRAFFIC_UPDATE,
            move |data| {
                sink.lock().insert(NotificationDraft::from_traffic_update(&data));
                Ok(())
            },
        );

        let flag = connected.clone();
        let connection = registry.on_connection(move |status| {
            flag.store(status == ConnectionStatus::Connected, Ordering::Release);
        });

        Self {
            log,
            connected,
            _subscriptions: vec![notifications, routes, traffic, connection],
        }
    }

    /// Add a notification from a local action.
    pub fn create(&self, draft: NotificationDraft) -> String {
        self.log.lock().insert(draft)
    }

    pub fn dismiss(&self, id: &str) -> bool {
        self.log.lock().dismiss(id)
    }

    pub fn mark_read(&self, id: &str) -> bool {
        self.log.lock().mark_read(id)
    }

    pub fn mark_all_read(&self) -> usize {
        self.log.lock().mark_all_read()
    }

    pub fn clear_all(&self) {
        self.log.lock().clear_all();
    }

    pub fn unread_count(&self) -> usize {
        self.log.lock().unread_count()
    }

    pub fn len(&self) -> usize {
        self.log.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.log.lock().is_empty()
    }

    /// Newest-first copy of the log.
    pub fn snapshot(&self) -> Vec<Notification> {
        self.log.lock().iter().cloned().collect()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}
