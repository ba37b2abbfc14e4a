//! Shared protocol definitions for the dispatch event stream.
//!
//! The peer pushes [`Envelope`]s (`{type, data, timestamp}`); the client
//! answers with [`ClientMessage`] control frames. Payload contracts for the
//! domain events live in [`events`].

pub mod envelope;
pub mod events;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use envelope::Envelope;
pub use events::{
    ConnectionData, ConnectionStatus, DomainEvent, EventKind, IncidentStatus, IncidentStatusData,
    NewNotificationData, NotificationPriority, NotificationType, RouteOptimizationData,
    TrafficSeverity, TrafficUpdateData, VehicleLocation, VehicleLocationData,
};

/// WebSocket close code for an intentional, clean shutdown.
pub const CLEAN_CLOSE_CODE: u16 = 1000;

/// Close code reported when the connection drops without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("message is not a json object")]
    NotAnObject,
    #[error("message has no string `type` field")]
    MissingType,
    #[error("payload for `{kind}` does not match its contract: {source}")]
    Payload {
        kind: String,
        source: serde_json::Error,
    },
}

// ============================================================================
// Protocol: Client -> Peer
// ============================================================================

/// Control messages sent from the client to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Declare interest in event types
    Subscribe { events: Vec<String> },
    /// Withdraw interest in event types
    Unsubscribe { events: Vec<String> },
    /// Keep-alive, no acknowledgement required
    Ping,
    /// Ask the peer to push the current state of something
    RequestUpdate {
        update_type: String,
        #[serde(flatten)]
        params: Map<String, Value>,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Subscribe { .. } => EventKind::SUBSCRIBE,
            ClientMessage::Unsubscribe { .. } => EventKind::UNSUBSCRIBE,
            ClientMessage::Ping => EventKind::PING,
            ClientMessage::RequestUpdate { .. } => EventKind::REQUEST_UPDATE,
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Protocol: Peer -> Client
// ============================================================================

/// Handshake sent by the peer right after it accepts a connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeData {
    #[serde(default)]
    pub status: Option<ConnectionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Acknowledgement of a `subscribe` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionConfirmedData {
    #[serde(default)]
    pub events: Vec<String>,
}

/// Error reported by the peer (for example, after it failed to parse a frame).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerErrorData {
    #[serde(default)]
    pub message: String,
}

/// Classified inbound message.
///
/// Every envelope received from the peer maps to exactly one variant, so the
/// session can handle control and data messages in one exhaustive match.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A domain event with a well-formed payload
    Event(DomainEvent),
    /// Connection confirmation carrying the peer-assigned client id
    Handshake(HandshakeData),
    /// Answer to a ping
    Pong,
    SubscriptionConfirmed(SubscriptionConfirmedData),
    PeerError(PeerErrorData),
    /// A type this client has no contract for; still fanned out raw
    Unrecognized,
}

impl Inbound {
    /// Classify an envelope.
    ///
    /// Fails only when the envelope carries a known type whose `data` does
    /// not satisfy that type's contract.
    pub fn classify(envelope: &Envelope) -> Result<Self, ProtocolError> {
        if let Some(event) = DomainEvent::from_envelope(envelope)? {
            return Ok(Inbound::Event(event));
        }

        let inbound = match envelope.kind() {
            EventKind::CONNECTION => Inbound::Handshake(envelope.decode_data()?),
            EventKind::PONG => Inbound::Pong,
            EventKind::SUBSCRIPTION_CONFIRMED => {
                Inbound::SubscriptionConfirmed(envelope.decode_data()?)
            }
            EventKind::ERROR => Inbound::PeerError(envelope.decode_data()?),
            _ => Inbound::Unrecognized,
        };
        Ok(inbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialize_subscribe() {
        let msg = ClientMessage::Subscribe {
            events: vec!["incident_status".to_string(), "traffic_update".to_string()],
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "subscribe", "events": ["incident_status", "traffic_update"]})
        );
    }

    #[test]
    fn test_serialize_ping() {
        let json = ClientMessage::Ping.to_json().unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_serialize_request_update_flattens_params() {
        let mut params = Map::new();
        params.insert("vehicle_id".to_string(), json!("FD-ENGINE-54"));
        let msg = ClientMessage::RequestUpdate {
            update_type: "vehicle_location".to_string(),
            params,
        };
        let value: Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "request_update",
                "update_type": "vehicle_location",
                "vehicle_id": "FD-ENGINE-54"
            })
        );
        assert_eq!(msg.kind(), "request_update");
    }

    #[test]
    fn test_classify_handshake() {
        let envelope = Envelope::parse(
            r#"{"type":"connection","status":"connected","client_id":"abc","timestamp":"2025-01-01T00:00:00"}"#,
        )
        .unwrap();
        match Inbound::classify(&envelope).unwrap() {
            Inbound::Handshake(data) => {
                assert_eq!(data.client_id.as_deref(), Some("abc"));
                assert_eq!(data.status, Some(ConnectionStatus::Connected));
            }
            other => panic!("Expected Handshake, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_domain_event() {
        let envelope = Envelope::new(
            EventKind::INCIDENT_STATUS,
            json!({"incidentId": "INC-1", "status": "on-scene"}),
        );
        match Inbound::classify(&envelope).unwrap() {
            Inbound::Event(DomainEvent::IncidentStatus(data)) => {
                assert_eq!(data.incident_id, "INC-1");
                assert_eq!(data.status, IncidentStatus::OnScene);
            }
            other => panic!("Expected IncidentStatus, got {:?}", other),
        }
    }

    #[test]
    fn test_classify_contract_violation() {
        let envelope = Envelope::new(EventKind::TRAFFIC_UPDATE, json!({"area": "Midtown"}));
        let err = Inbound::classify(&envelope).unwrap_err();
        assert!(matches!(err, ProtocolError::Payload { ref kind, .. } if kind == "traffic_update"));
    }

    #[test]
    fn test_classify_control_and_unknown() {
        let pong = Envelope::parse(r#"{"type":"pong","timestamp":"2025-01-01T00:00:00"}"#).unwrap();
        assert_eq!(Inbound::classify(&pong).unwrap(), Inbound::Pong);

        let error = Envelope::parse(r#"{"type":"error","message":"Invalid JSON format"}"#).unwrap();
        assert_eq!(
            Inbound::classify(&error).unwrap(),
            Inbound::PeerError(PeerErrorData {
                message: "Invalid JSON format".to_string()
            })
        );

        let custom = Envelope::new("weather_alert", json!({"level": 2}));
        assert_eq!(Inbound::classify(&custom).unwrap(), Inbound::Unrecognized);
    }
}
