//! The wire-level message shape: `{ "type", "data", "timestamp" }`.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ProtocolError;

/// One message exchanged over the live connection.
///
/// Envelopes are immutable once built: fields are private and only exposed
/// through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawEnvelope")]
pub struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    data: Value,
    timestamp: String,
}

/// Lenient decoding shape.
///
/// Control messages from the peer put their fields next to `type` instead
/// of under `data`; those leftover fields become the envelope data.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl From<RawEnvelope> for Envelope {
    fn from(raw: RawEnvelope) -> Self {
        let data = match raw.data {
            Some(data) if !data.is_null() => data,
            _ => Value::Object(raw.rest),
        };
        Self {
            kind: raw.kind,
            data,
            timestamp: raw.timestamp.unwrap_or_else(now_timestamp),
        }
    }
}

impl Envelope {
    /// Build an envelope stamped with the current time.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self::with_timestamp(kind, data, now_timestamp())
    }

    pub fn with_timestamp(kind: impl Into<String>, data: Value, timestamp: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            data,
            timestamp: timestamp.into(),
        }
    }

    /// Parse one text frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let object = value.as_object().ok_or(ProtocolError::NotAnObject)?;
        if !object.get("type").is_some_and(Value::is_string) {
            return Err(ProtocolError::MissingType);
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// Timestamp exactly as received (ISO-8601).
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Timestamp as an instant.
    ///
    /// Accepts RFC 3339 as well as offset-less ISO-8601, which is read as UTC.
    pub fn parsed_timestamp(&self) -> Option<DateTime<Utc>> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(&self.timestamp) {
            return Some(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&self.timestamp, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|ts| ts.and_utc())
    }

    /// Decode `data` into a payload type.
    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.data.clone()).map_err(|source| ProtocolError::Payload {
            kind: self.kind.clone(),
            source,
        })
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn into_parts(self) -> (String, Value, String) {
        (self.kind, self.data, self.timestamp)
    }
}

/// Current time in the browser `toISOString` form, e.g. `2025-01-01T12:00:00.000Z`.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
