//! Connection session state machine.
//!
//! One driver task owns the transport, the back-off timer and the keep-alive
//! timer, and performs every dispatch. Handles talk to it over a command
//! channel and observe it through a `watch` snapshot.

use std::collections::BTreeSet;
use std::fmt;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use dispatch_protocol::{
    ClientMessage, ConnectionStatus, Envelope, EventKind, Inbound, CLEAN_CLOSE_CODE,
};

use crate::backoff::Backoff;
use crate::dispatcher::Dispatcher;
use crate::registry::SubscriptionRegistry;
use crate::transport::{ConnectContext, Connector, Transport, TransportError, TransportEvent};

const DISCONNECT_REASON: &str = "Client disconnect";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closed,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable session state, republished on every change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub reconnect_attempts: u32,
    pub client_id: Option<String>,
}

impl Default for SessionSnapshot {
    fn default() -> Self {
        Self {
            state: SessionState::Idle,
            reconnect_attempts: 0,
            client_id: None,
        }
    }
}

pub(crate) enum Command {
    Connect { ack: oneshot::Sender<()> },
    Disconnect { ack: oneshot::Sender<()> },
    Send(ClientMessage),
    /// Pre-encoded envelope of any type
    SendEnvelope { kind: String, text: String },
    Shutdown { ack: oneshot::Sender<()> },
}

#[derive(Debug, Clone)]
pub(crate) struct SessionOptions {
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub keepalive: Option<Duration>,
}

type PendingConnect = BoxFuture<'static, Result<Box<dyn Transport>, TransportError>>;

/// What woke the driver.
enum Step {
    Command(Option<Command>),
    Connected(Result<Box<dyn Transport>, TransportError>),
    Transport(TransportEvent),
    ReconnectDue,
    KeepaliveDue,
    InterestChanged,
}

pub(crate) struct SessionDriver {
    connector: Arc<dyn Connector>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshot: watch::Sender<SessionSnapshot>,

    state: SessionState,
    backoff: Backoff,
    keepalive: Option<Duration>,
    client_id: Option<String>,

    transport: Option<Box<dyn Transport>>,
    pending_connect: Option<PendingConnect>,
    reconnect_at: Option<Instant>,
    next_keepalive: Option<Instant>,
    /// Wire keys the peer was last told about
    announced: BTreeSet<String>,
}

impl SessionDriver {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        registry: Arc<SubscriptionRegistry>,
        commands: mpsc::UnboundedReceiver<Command>,
        snapshot: watch::Sender<SessionSnapshot>,
        options: SessionOptions,
    ) -> Self {
        Self {
            connector,
            dispatcher: Dispatcher::new(registry.clone()),
            registry,
            commands,
            snapshot,
            state: SessionState::Idle,
            backoff: Backoff::new(options.base_delay, options.max_attempts),
            keepalive: options.keepalive,
            client_id: None,
            transport: None,
            pending_connect: None,
            reconnect_at: None,
            next_keepalive: None,
            announced: BTreeSet::new(),
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::debug!(endpoint = %self.connector.endpoint(), "session driver started");

        loop {
            let step = tokio::select! {
                biased;
                command = self.commands.recv() => Step::Command(command),
                result = wait_connect(&mut self.pending_connect) => Step::Connected(result),
                event = wait_transport(&mut self.transport) => Step::Transport(event),
                _ = wait_deadline(self.reconnect_at) => Step::ReconnectDue,
                _ = wait_deadline(self.next_keepalive) => Step::KeepaliveDue,
                _ = self.registry.interest_changed() => Step::InterestChanged,
            };

            match step {
                Step::Command(Some(Command::Connect { ack })) => {
                    self.connect();
                    let _ = ack.send(());
                }
                Step::Command(Some(Command::Disconnect { ack })) => {
                    self.disconnect().await;
                    let _ = ack.send(());
                }
                Step::Command(Some(Command::Send(message))) => self.send(message).await,
                Step::Command(Some(Command::SendEnvelope { kind, text })) => {
                    self.send_text(&kind, text).await;
                }
                Step::Command(Some(Command::Shutdown { ack })) => {
                    self.disconnect().await;
                    let _ = ack.send(());
                    break;
                }
                Step::Command(None) => {
                    tracing::debug!("all client handles dropped");
                    self.disconnect().await;
                    break;
                }
                Step::Connected(result) => {
                    self.pending_connect = None;
                    match result {
                        Ok(transport) => self.on_open(transport).await,
                        Err(e) => {
                            tracing::warn!(error = %e, "connection attempt failed");
                            self.on_connection_lost();
                        }
                    }
                }
                Step::Transport(event) => self.on_transport_event(event),
                Step::ReconnectDue => {
                    self.reconnect_at = None;
                    self.backoff.record_attempt();
                    self.begin_connect();
                }
                Step::KeepaliveDue => {
                    self.next_keepalive = self.keepalive.map(|interval| Instant::now() + interval);
                    self.write(ClientMessage::Ping).await;
                }
                Step::InterestChanged => self.sync_interest().await,
            }
        }

        tracing::debug!("session driver stopped");
    }

    /// Explicit connect: no-op while connecting or open, otherwise starts a
    /// fresh attempt with a reset back-off.
    fn connect(&mut self) {
        match self.state {
            SessionState::Connecting | SessionState::Open => {
                tracing::debug!(state = %self.state, "connect ignored");
            }
            SessionState::Idle | SessionState::Closed | SessionState::Failed => {
                self.reconnect_at = None;
                self.backoff.reset();
                self.begin_connect();
            }
        }
    }

    fn begin_connect(&mut self) {
        let connector = self.connector.clone();
        let context = ConnectContext {
            client_id: self.client_id.clone(),
        };

        tracing::info!(
            endpoint = %connector.endpoint(),
            attempt = self.backoff.attempts(),
            "connecting"
        );
        self.pending_connect = Some(Box::pin(async move { connector.connect(context).await }));
        self.set_state(SessionState::Connecting);
    }

    async fn on_open(&mut self, transport: Box<dyn Transport>) {
        self.transport = Some(transport);
        self.backoff.reset();
        self.announced.clear();
        self.next_keepalive = self.keepalive.map(|interval| Instant::now() + interval);
        self.set_state(SessionState::Open);
        tracing::info!(endpoint = %self.connector.endpoint(), "session open");

        self.sync_interest().await;
        self.dispatcher.dispatch_status(ConnectionStatus::Connected);
    }

    /// Connect failure or abnormal close.
    fn on_connection_lost(&mut self) {
        self.transport = None;
        self.next_keepalive = None;
        self.set_state(SessionState::Closed);
        self.dispatcher.dispatch_status(ConnectionStatus::Disconnected);

        match self.backoff.next_delay() {
            Some(delay) => {
                tracing::info!(
                    delay_ms = delay.as_millis() as u64,
                    attempt = self.backoff.attempts() + 1,
                    max_attempts = self.backoff.max_attempts(),
                    "scheduling reconnect"
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }
            None => {
                tracing::error!(
                    attempts = self.backoff.attempts(),
                    "reconnect attempts exhausted, giving up"
                );
                self.set_state(SessionState::Failed);
                self.dispatcher.dispatch_status(ConnectionStatus::Failed);
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(text) => self.on_message(&text),
            // The close that follows is what moves the state.
            TransportEvent::Error(message) => {
                tracing::warn!(error = %message, "transport error");
            }
            TransportEvent::Closed { code, reason } if code == CLEAN_CLOSE_CODE => {
                tracing::info!(reason = %reason, "peer closed the connection cleanly");
                self.transport = None;
                self.next_keepalive = None;
                self.set_state(SessionState::Closed);
                self.dispatcher.dispatch_status(ConnectionStatus::Disconnected);
            }
            TransportEvent::Closed { code, reason } => {
                tracing::warn!(code, reason = %reason, "connection lost");
                self.on_connection_lost();
            }
        }
    }

    fn on_message(&mut self, text: &str) {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed message");
                return;
            }
        };

        // `data` stays opaque for fan-out; typed consumers reject what they
        // cannot decode on their own.
        let inbound = match Inbound::classify(&envelope) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::warn!(event_type = %envelope.kind(), error = %e, "payload does not match its contract");
                if envelope.kind() == EventKind::CONNECTION {
                    self.dispatcher.dispatch_raw(&envelope);
                } else {
                    self.dispatcher.dispatch(&envelope);
                }
                return;
            }
        };

        match inbound {
            Inbound::Handshake(handshake) => {
                if let Some(client_id) = handshake.client_id {
                    if self.client_id.is_none() {
                        tracing::info!(client_id = %client_id, "client id assigned");
                        self.client_id = Some(client_id);
                        self.publish();
                    } else if self.client_id.as_deref() != Some(client_id.as_str()) {
                        tracing::debug!(
                            current = ?self.client_id,
                            offered = %client_id,
                            "keeping existing client id"
                        );
                    }
                }
                // Shares the `connection` type with local status events,
                // so only raw consumers see it.
                self.dispatcher.dispatch_raw(&envelope);
                return;
            }
            Inbound::Event(event) => {
                tracing::debug!(event_type = event.kind(), "received event");
            }
            Inbound::Pong => tracing::debug!("received pong"),
            Inbound::SubscriptionConfirmed(confirmed) => {
                tracing::debug!(events = ?confirmed.events, "subscription confirmed");
            }
            Inbound::PeerError(error) => {
                tracing::warn!(error = %error.message, "peer reported an error");
            }
            Inbound::Unrecognized => {
                tracing::debug!(event_type = %envelope.kind(), "received unrecognized message type");
            }
        }

        self.dispatcher.dispatch(&envelope);
    }

    async fn disconnect(&mut self) {
        let was_active = matches!(self.state, SessionState::Connecting | SessionState::Open);

        self.pending_connect = None;
        self.reconnect_at = None;
        self.next_keepalive = None;
        self.announced.clear();
        if let Some(mut transport) = self.transport.take() {
            transport.close(CLEAN_CLOSE_CODE, DISCONNECT_REASON).await;
        }
        self.client_id = None;

        match self.state {
            // Terminal until an explicit connect; idle never had a session.
            SessionState::Idle | SessionState::Failed => self.publish(),
            SessionState::Connecting | SessionState::Open | SessionState::Closed => {
                self.set_state(SessionState::Closed);
            }
        }

        if was_active {
            tracing::info!("disconnected");
            self.dispatcher.dispatch_status(ConnectionStatus::Disconnected);
        } else {
            tracing::debug!(state = %self.state, "disconnect while not connected");
        }
    }

    async fn send(&mut self, message: ClientMessage) {
        if !self.accepts_sends(message.kind()) {
            return;
        }
        self.write(message).await;
    }

    async fn send_text(&mut self, kind: &str, text: String) {
        if !self.accepts_sends(kind) {
            return;
        }
        self.write_text(kind, text).await;
    }

    fn accepts_sends(&self, message_type: &str) -> bool {
        if self.state != SessionState::Open {
            tracing::warn!(
                message_type = %message_type,
                state = %self.state,
                "session not open, dropping message"
            );
            return false;
        }
        true
    }

    /// Tell the peer about keys that became active or inactive.
    async fn sync_interest(&mut self) {
        if self.state != SessionState::Open {
            return;
        }

        let wanted = self.registry.wire_keys();
        let added: Vec<String> = wanted.difference(&self.announced).cloned().collect();
        let removed: Vec<String> = self.announced.difference(&wanted).cloned().collect();

        if !added.is_empty() {
            self.write(ClientMessage::Subscribe { events: added }).await;
        }
        if !removed.is_empty() {
            self.write(ClientMessage::Unsubscribe { events: removed }).await;
        }
        self.announced = wanted;
    }

    async fn write(&mut self, message: ClientMessage) -> bool {
        match message.to_json() {
            Ok(text) => self.write_text(message.kind(), text).await,
            Err(e) => {
                tracing::error!(message_type = message.kind(), error = %e, "failed to encode message");
                false
            }
        }
    }

    async fn write_text(&mut self, message_type: &str, text: String) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            tracing::warn!(message_type = %message_type, "no transport, dropping message");
            return false;
        };

        match transport.send(text).await {
            Ok(()) => {
                tracing::debug!(message_type = %message_type, "sent message");
                true
            }
            Err(e) => {
                tracing::warn!(message_type = %message_type, error = %e, "failed to send message");
                false
            }
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!(from = %self.state, to = %state, "session state changed");
        }
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            state: self.state,
            reconnect_attempts: self.backoff.attempts(),
            client_id: self.client_id.clone(),
        });
    }
}

async fn wait_connect(pending_connect: &mut Option<PendingConnect>) -> Result<Box<dyn Transport>, TransportError> {
    match pending_connect {
        Some(attempt) => attempt.await,
        None => pending().await,
    }
}

async fn wait_transport(transport: &mut Option<Box<dyn Transport>>) -> TransportEvent {
    match transport {
        Some(transport) => transport.recv().await,
        None => pending().await,
    }
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}
