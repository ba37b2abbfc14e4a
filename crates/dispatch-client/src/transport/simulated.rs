//! In-process peer that synthesizes a plausible dispatch event stream.
//!
//! Timing runs on the tokio clock, so tests with paused time drive the
//! stream deterministically. With a fixed seed the payload sequence is
//! reproducible too.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, RngCore, SeedableRng};
use serde_json::{json, Value};
use tokio::time::Instant;

use dispatch_protocol::{
    ClientMessage, DomainEvent, Envelope, EventKind, IncidentStatus, IncidentStatusData,
    NewNotificationData, NotificationPriority, NotificationType, RouteOptimizationData,
    TrafficSeverity, TrafficUpdateData, VehicleLocation, VehicleLocationData, CLEAN_CLOSE_CODE,
};

use super::{ConnectContext, Connector, Transport, TransportError, TransportEvent};
use crate::config::SimulationSettings;

const VEHICLES: [&str; 3] = ["FD-ENGINE-54", "FD-LADDER-27", "EMS-AMB-15"];
const INCIDENTS: [&str; 4] = ["INC-2025-001", "INC-2025-002", "INC-2025-003", "INC-2025-004"];
const INCIDENT_STATUSES: [IncidentStatus; 4] = [
    IncidentStatus::Active,
    IncidentStatus::Dispatched,
    IncidentStatus::OnScene,
    IncidentStatus::Resolved,
];
const SEVERITIES: [TrafficSeverity; 3] = [
    TrafficSeverity::Light,
    TrafficSeverity::Moderate,
    TrafficSeverity::Heavy,
];
const NOTIFICATION_TYPES: [NotificationType; 3] = [
    NotificationType::RouteUpdate,
    NotificationType::TrafficAlert,
    NotificationType::SystemAlert,
];
const PRIORITIES: [NotificationPriority; 3] = [
    NotificationPriority::Low,
    NotificationPriority::Medium,
    NotificationPriority::High,
];

/// Half-width of the coordinate box around the reference point, in degrees
const COORDINATE_SPREAD: f64 = 0.005;

pub struct SimulatedConnector {
    settings: SimulationSettings,
    seeds: Mutex<StdRng>,
}

impl SimulatedConnector {
    pub fn new(settings: SimulationSettings) -> Self {
        let seeds = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            settings,
            seeds: Mutex::new(seeds),
        }
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn connect(&self, context: ConnectContext) -> Result<Box<dyn Transport>, TransportError> {
        tokio::time::sleep(self.settings.handshake_delay()).await;

        let seed = self.seeds.lock().next_u64();
        let client_id = context
            .client_id
            .unwrap_or_else(|| format!("sim-{:016x}", seed));

        tracing::info!(client_id = %client_id, "simulated peer accepted connection");
        Ok(Box::new(SimulatedTransport::new(
            self.settings.clone(),
            seed,
            client_id,
        )))
    }

    fn endpoint(&self) -> String {
        "simulation".to_string()
    }
}

pub struct SimulatedTransport {
    settings: SimulationSettings,
    rng: StdRng,
    /// Frames queued ahead of the timed stream (handshake, replies)
    pending: VecDeque<String>,
    next_emit: Instant,
    sequence: u64,
    closed: bool,
}

impl SimulatedTransport {
    fn new(settings: SimulationSettings, seed: u64, client_id: String) -> Self {
        let mut transport = Self {
            settings,
            rng: StdRng::seed_from_u64(seed),
            pending: VecDeque::new(),
            next_emit: Instant::now(),
            sequence: 0,
            closed: false,
        };
        transport.next_emit = Instant::now() + transport.draw_interval();
        transport.queue(Envelope::new(
            EventKind::CONNECTION,
            json!({ "status": "connected", "client_id": client_id }),
        ));
        transport
    }

    fn draw_interval(&mut self) -> Duration {
        let min = self.settings.min_interval();
        let max = self.settings.max_interval();
        if min >= max {
            return min;
        }
        self.rng.gen_range(min..=max)
    }

    fn queue(&mut self, envelope: Envelope) {
        match envelope.to_json() {
            Ok(text) => self.pending.push_back(text),
            Err(e) => tracing::error!(error = %e, "failed to encode simulated envelope"),
        }
    }

    fn random_event(&mut self) -> DomainEvent {
        let kind = EventKind::DOMAIN
            .choose(&mut self.rng)
            .copied()
            .unwrap_or(EventKind::VEHICLE_LOCATION);
        self.event(kind)
    }

    fn event(&mut self, kind: &str) -> DomainEvent {
        match kind {
            EventKind::ROUTE_OPTIMIZATION => DomainEvent::RouteOptimization(RouteOptimizationData {
                incident_id: INCIDENTS[0].to_string(),
                vehicle_id: VEHICLES[0].to_string(),
                new_eta: format!("{} min", self.rng.gen_range(1..=9)),
                time_saved: f64::from(self.rng.gen_range(0..120u32)),
            }),
            EventKind::INCIDENT_STATUS => DomainEvent::IncidentStatus(IncidentStatusData {
                incident_id: self.pick(&INCIDENTS).to_string(),
                status: *self.pick(&INCIDENT_STATUSES),
            }),
            EventKind::TRAFFIC_UPDATE => DomainEvent::TrafficUpdate(TrafficUpdateData {
                area: "Manhattan Midtown".to_string(),
                severity: *self.pick(&SEVERITIES),
                description: "Traffic conditions updated based on live feeds".to_string(),
            }),
            EventKind::NEW_NOTIFICATION => {
                self.sequence += 1;
                DomainEvent::NewNotification(NewNotificationData {
                    id: Some(format!("N{}-{}", Utc::now().timestamp_millis(), self.sequence)),
                    kind: Some(self.pick(&NOTIFICATION_TYPES).as_str().to_string()),
                    message: Some(
                        "System generated notification from WebSocket simulation".to_string(),
                    ),
                    priority: Some(*self.pick(&PRIORITIES)),
                })
            }
            _ => self.vehicle_location(None),
        }
    }

    fn vehicle_location(&mut self, vehicle_id: Option<String>) -> DomainEvent {
        let vehicle_id = vehicle_id.unwrap_or_else(|| self.pick(&VEHICLES).to_string());
        let lat = self.settings.reference_lat
            + self.rng.gen_range(-COORDINATE_SPREAD..COORDINATE_SPREAD);
        let lng = self.settings.reference_lng
            + self.rng.gen_range(-COORDINATE_SPREAD..COORDINATE_SPREAD);
        DomainEvent::VehicleLocation(VehicleLocationData {
            vehicle_id,
            location: VehicleLocation {
                coordinates: [lat, lng],
                heading: f64::from(self.rng.gen_range(0..360u32)),
                speed: f64::from(self.rng.gen_range(0..50u32)),
            },
        })
    }

    fn pick<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        &items[self.rng.gen_range(0..items.len())]
    }

    fn handle_client_message(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Ping => self.queue(Envelope::new(EventKind::PONG, json!({}))),
            ClientMessage::RequestUpdate {
                update_type,
                params,
            } if update_type == EventKind::VEHICLE_LOCATION => {
                let vehicle_id = params
                    .get("vehicle_id")
                    .or_else(|| params.get("vehicleId"))
                    .and_then(Value::as_str)
                    .map(str::to_string);
                let event = self.vehicle_location(vehicle_id);
                self.queue(event.into_envelope());
            }
            ClientMessage::RequestUpdate { update_type, .. } => {
                tracing::debug!(update_type = %update_type, "simulation has no update of this type");
            }
            // Interest is accepted and ignored; the simulation always emits
            // the full domain set.
            ClientMessage::Subscribe { events } | ClientMessage::Unsubscribe { events } => {
                tracing::debug!(events = ?events, "simulation ignoring interest change");
            }
        }
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn recv(&mut self) -> TransportEvent {
        if self.closed {
            return TransportEvent::Closed {
                code: CLEAN_CLOSE_CODE,
                reason: "simulation stopped".to_string(),
            };
        }
        if let Some(text) = self.pending.pop_front() {
            return TransportEvent::Message(text);
        }

        // The deadline lives in `self`, so a cancelled wait resumes it.
        tokio::time::sleep_until(self.next_emit).await;
        self.next_emit = Instant::now() + self.draw_interval();

        let event = self.random_event();
        tracing::debug!(event_type = event.kind(), "simulated event");
        match event.into_envelope().to_json() {
            Ok(text) => TransportEvent::Message(text),
            Err(e) => TransportEvent::Error(e.to_string()),
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => self.handle_client_message(message),
            Err(e) => tracing::debug!(error = %e, "simulation ignoring unknown client message"),
        }
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if self.closed {
            return;
        }
        tracing::debug!(code, reason = %reason, "simulation stopped");
        self.closed = true;
        self.pending.clear();
    }
}
