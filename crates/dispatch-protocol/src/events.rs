//! Event kinds and payload contracts.
//!
//! Field names are camelCase on the wire. The backend historically emitted
//! snake_case names for the same fields, so those are accepted as aliases.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{Envelope, ProtocolError};

// ============================================================================
// Event Kind Constants
// ============================================================================

pub struct EventKind;

impl EventKind {
    // Local control (never sent over the wire by the client)
    pub const CONNECTION: &str = "connection";

    // Domain events (Peer → Client)
    pub const VEHICLE_LOCATION: &str = "vehicle_location";
    pub const ROUTE_OPTIMIZATION: &str = "route_optimization";
    pub const INCIDENT_STATUS: &str = "incident_status";
    pub const TRAFFIC_UPDATE: &str = "traffic_update";
    pub const NEW_NOTIFICATION: &str = "new_notification";

    // Peer control
    pub const PONG: &str = "pong";
    pub const SUBSCRIPTION_CONFIRMED: &str = "subscription_confirmed";
    pub const ERROR: &str = "error";

    // Client control (Client → Peer)
    pub const SUBSCRIBE: &str = "subscribe";
    pub const UNSUBSCRIBE: &str = "unsubscribe";
    pub const PING: &str = "ping";
    pub const REQUEST_UPDATE: &str = "request_update";

    /// The closed set of domain event types.
    pub const DOMAIN: [&str; 5] = [
        Self::VEHICLE_LOCATION,
        Self::ROUTE_OPTIMIZATION,
        Self::INCIDENT_STATUS,
        Self::TRAFFIC_UPDATE,
        Self::NEW_NOTIFICATION,
    ];
}

// ============================================================================
// Connection Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Failed => "failed",
        }
    }
}

/// Data for the local `connection` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionData {
    pub status: ConnectionStatus,
}

// ============================================================================
// Vehicle / Route / Incident / Traffic
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleLocation {
    /// `[lat, lng]`
    pub coordinates: [f64; 2],
    /// Degrees clockwise from north.
    pub heading: f64,
    pub speed: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleLocationData {
    #[serde(alias = "vehicle_id")]
    pub vehicle_id: String,
    pub location: VehicleLocation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteOptimizationData {
    #[serde(alias = "incident_id")]
    pub incident_id: String,
    #[serde(alias = "vehicle_id")]
    pub vehicle_id: String,
    /// Human-readable ETA, e.g. `"4 min"`.
    #[serde(alias = "new_eta")]
    pub new_eta: String,
    /// Seconds saved by the new route. Absent on manual recalculations.
    #[serde(default, alias = "time_saved")]
    pub time_saved: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IncidentStatus {
    Active,
    Dispatched,
    OnScene,
    Resolved,
    Cancelled,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Active => "active",
            IncidentStatus::Dispatched => "dispatched",
            IncidentStatus::OnScene => "on-scene",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncidentStatusData {
    #[serde(alias = "incident_id")]
    pub incident_id: String,
    pub status: IncidentStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficSeverity {
    Light,
    Moderate,
    Heavy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficUpdateData {
    pub area: String,
    pub severity: TrafficSeverity,
    pub description: String,
}

// ============================================================================
// Notifications
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationType {
    RouteUpdate,
    TrafficAlert,
    SystemAlert,
    VehicleStatus,
    IncidentUpdate,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::RouteUpdate => "route-update",
            NotificationType::TrafficAlert => "traffic-alert",
            NotificationType::SystemAlert => "system-alert",
            NotificationType::VehicleStatus => "vehicle-status",
            NotificationType::IncidentUpdate => "incident-update",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "route-update" => Some(NotificationType::RouteUpdate),
            "traffic-alert" => Some(NotificationType::TrafficAlert),
            "system-alert" => Some(NotificationType::SystemAlert),
            "vehicle-status" => Some(NotificationType::VehicleStatus),
            "incident-update" => Some(NotificationType::IncidentUpdate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationPriority {
    Low,
    Medium,
    High,
}

impl NotificationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationPriority::Low => "low",
            NotificationPriority::Medium => "medium",
            NotificationPriority::High => "high",
        }
    }
}

/// Data for `new_notification`.
///
/// Every field is optional on the wire; the notification materializer fills
/// in defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NewNotificationData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Notification type as sent, e.g. `"traffic-alert"`. Unknown values are
    /// kept verbatim so the receiver can decide how to degrade.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Values outside the priority enum read as absent.
    #[serde(
        default,
        deserialize_with = "lenient_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub priority: Option<NotificationPriority>,
}

fn lenient_option<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|value| serde_json::from_value(value).ok()))
}

// ============================================================================
// Domain Event
// ============================================================================

/// All domain events the dashboard consumes.
///
/// Serialized with `#[serde(tag = "type", content = "data")]`, which is the
/// envelope shape minus the timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DomainEvent {
    VehicleLocation(VehicleLocationData),
    RouteOptimization(RouteOptimizationData),
    IncidentStatus(IncidentStatusData),
    TrafficUpdate(TrafficUpdateData),
    NewNotification(NewNotificationData),
}

impl DomainEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DomainEvent::VehicleLocation(_) => EventKind::VEHICLE_LOCATION,
            DomainEvent::RouteOptimization(_) => EventKind::ROUTE_OPTIMIZATION,
            DomainEvent::IncidentStatus(_) => EventKind::INCIDENT_STATUS,
            DomainEvent::TrafficUpdate(_) => EventKind::TRAFFIC_UPDATE,
            DomainEvent::NewNotification(_) => EventKind::NEW_NOTIFICATION,
        }
    }

    /// Decode the domain event carried by an envelope.
    ///
    /// Returns `Ok(None)` for envelope types outside the domain set.
    pub fn from_envelope(envelope: &Envelope) -> Result<Option<Self>, ProtocolError> {
        let event = match envelope.kind() {
            EventKind::VEHICLE_LOCATION => DomainEvent::VehicleLocation(envelope.decode_data()?),
            EventKind::ROUTE_OPTIMIZATION => {
                DomainEvent::RouteOptimization(envelope.decode_data()?)
            }
            EventKind::INCIDENT_STATUS => DomainEvent::IncidentStatus(envelope.decode_data()?),
            EventKind::TRAFFIC_UPDATE => DomainEvent::TrafficUpdate(envelope.decode_data()?),
            EventKind::NEW_NOTIFICATION => DomainEvent::NewNotification(envelope.decode_data()?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Extract the payload as JSON.
    pub fn data(&self) -> Value {
        // Serialize to get the tagged form, then pick the content field.
        let value = serde_json::to_value(self).unwrap_or_default();
        value.get("data").cloned().unwrap_or(Value::Null)
    }

    /// Wrap the event in an envelope stamped with the current time.
    pub fn into_envelope(self) -> Envelope {
        Envelope::new(self.kind(), self.data())
    }
}
