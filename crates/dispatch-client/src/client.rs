use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use dispatch_protocol::{ClientMessage, ConnectionStatus, Envelope};

use crate::config::ClientConfig;
use crate::registry::{ConsumerResult, EventKey, Subscription, SubscriptionRegistry};
use crate::session::{Command, SessionDriver, SessionOptions, SessionSnapshot, SessionState};
use crate::transport::{Connector, SimulatedConnector, TransportError, WebSocketConnector};

/// Result of [`DispatchClient::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the session for delivery
    Queued,
    /// Discarded because the session is not open
    Dropped,
}

/// Connection summary for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStats {
    pub state: SessionState,
    pub connected: bool,
    pub client_id: Option<String>,
    pub subscriptions: Vec<String>,
    pub reconnect_attempts: u32,
    pub endpoint: String,
}

/// Handle to one live event session and its subscription registry.
///
/// Cheap to clone. The session runs on a background task started by
/// [`DispatchClient::start`]; it disconnects and stops once
/// [`DispatchClient::shutdown`] is called or every handle is dropped.
#[derive(Clone)]
pub struct DispatchClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    commands: mpsc::UnboundedSender<Command>,
    registry: Arc<SubscriptionRegistry>,
    snapshot: watch::Receiver<SessionSnapshot>,
    endpoint: String,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchClient {
    /// Spawn the session driver. Must be called inside a tokio runtime.
    pub fn start(config: &ClientConfig, connector: Arc<dyn Connector>) -> Self {
        let registry = SubscriptionRegistry::new();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());

        let options = SessionOptions {
            base_delay: config.reconnect_base_delay(),
            max_attempts: config.reconnect.max_attempts,
            keepalive: config.keepalive_interval(),
        };
        let endpoint = connector.endpoint();
        let driver = SessionDriver::new(connector, registry.clone(), commands_rx, snapshot_tx, options);
        let handle = tokio::spawn(driver.run());

        Self {
            inner: Arc::new(ClientInner {
                commands: commands_tx,
                registry,
                snapshot: snapshot_rx,
                endpoint,
                driver: Mutex::new(Some(handle)),
            }),
        }
    }

    /// Start with the transport the config selects: WebSocket when a server
    /// URL is set, the simulated peer otherwise.
    pub fn from_config(config: &ClientConfig) -> Result<Self, TransportError> {
        let connector: Arc<dyn Connector> = match config.server_url() {
            Some(url) => Arc::new(WebSocketConnector::new(url)?),
            None => Arc::new(SimulatedConnector::new(config.simulation.clone())),
        };
        Ok(Self::start(config, connector))
    }

    /// Ask the session to connect. Returns once the request is accepted,
    /// not once the connection is open; watch [`DispatchClient::watch_state`]
    /// or subscribe with [`DispatchClient::on_connection`] for that.
    pub async fn connect(&self) {
        self.request(|ack| Command::Connect { ack }).await;
    }

    /// Close the session cleanly. When this returns, no further envelopes
    /// are dispatched and no reconnect is pending.
    pub async fn disconnect(&self) {
        self.request(|ack| Command::Disconnect { ack }).await;
    }

    /// Disconnect and stop the driver task.
    pub async fn shutdown(&self) {
        self.request(|ack| Command::Shutdown { ack }).await;
        let handle = self.inner.driver.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "session driver task failed");
            }
        }
    }

    async fn request<F>(&self, command: F)
    where
        F: FnOnce(oneshot::Sender<()>) -> Command,
    {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.inner.commands.send(command(ack_tx)).is_err() {
            tracing::debug!("session driver already stopped");
            return;
        }
        let _ = ack_rx.await;
    }

    /// Send a control message to the peer.
    ///
    /// Never fails: while the session is not open the message is discarded
    /// with a warning and `Dropped` is returned.
    pub fn send(&self, message: ClientMessage) -> SendOutcome {
        if !self.accepts_sends(message.kind()) {
            return SendOutcome::Dropped;
        }
        self.enqueue(Command::Send(message))
    }

    /// Send an arbitrary envelope, for message types outside
    /// [`ClientMessage`]. Same discard-with-warning rule as
    /// [`DispatchClient::send`].
    pub fn send_envelope(&self, envelope: &Envelope) -> SendOutcome {
        if !self.accepts_sends(envelope.kind()) {
            return SendOutcome::Dropped;
        }
        match envelope.to_json() {
            Ok(text) => self.enqueue(Command::SendEnvelope {
                kind: envelope.kind().to_string(),
                text,
            }),
            Err(e) => {
                tracing::warn!(message_type = %envelope.kind(), error = %e, "failed to encode envelope");
                SendOutcome::Dropped
            }
        }
    }

    fn accepts_sends(&self, message_type: &str) -> bool {
        let state = self.state();
        if state != SessionState::Open {
            tracing::warn!(
                message_type = %message_type,
                state = %state,
                "session not open, dropping message"
            );
            return false;
        }
        true
    }

    fn enqueue(&self, command: Command) -> SendOutcome {
        match self.inner.commands.send(command) {
            Ok(()) => SendOutcome::Queued,
            Err(_) => {
                tracing::warn!("session driver stopped, dropping message");
                SendOutcome::Dropped
            }
        }
    }

    pub fn ping(&self) -> SendOutcome {
        self.send(ClientMessage::Ping)
    }

    /// Ask the peer to push fresh state, e.g. `vehicle_location` for one
    /// vehicle.
    pub fn request_update(&self, update_type: &str, params: Map<String, Value>) -> SendOutcome {
        self.send(ClientMessage::RequestUpdate {
            update_type: update_type.to_string(),
            params,
        })
    }

    pub fn subscribe<F>(&self, kind: &str, consumer: F) -> Subscription
    where
        F: Fn(&Value) -> ConsumerResult + Send + Sync + 'static,
    {
        self.inner.registry.subscribe(kind, consumer)
    }

    pub fn subscribe_as<T, F>(&self, kind: &str, consumer: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) -> ConsumerResult + Send + Sync + 'static,
    {
        self.inner.registry.subscribe_as(kind, consumer)
    }

    pub fn subscribe_all<F>(&self, consumer: F) -> Subscription
    where
        F: Fn(&Envelope) -> ConsumerResult + Send + Sync + 'static,
    {
        self.inner.registry.subscribe_all(consumer)
    }

    pub fn on_connection<F>(&self, consumer: F) -> Subscription
    where
        F: Fn(ConnectionStatus) + Send + Sync + 'static,
    {
        self.inner.registry.on_connection(consumer)
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    pub fn state(&self) -> SessionState {
        self.inner.snapshot.borrow().state
    }

    pub fn client_id(&self) -> Option<String> {
        self.inner.snapshot.borrow().client_id.clone()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.snapshot.borrow().reconnect_attempts
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Open, with a driver task still running.
    pub fn is_healthy(&self) -> bool {
        let driver_running = self
            .inner
            .driver
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished());
        driver_running && self.is_connected()
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    /// Active subscription keys, including local ones.
    pub fn active_keys(&self) -> Vec<EventKey> {
        self.inner.registry.active_keys().into_iter().collect()
    }

    pub fn stats(&self) -> ClientStats {
        let snapshot = self.inner.snapshot.borrow().clone();
        ClientStats {
            state: snapshot.state,
            connected: snapshot.state == SessionState::Open,
            client_id: snapshot.client_id,
            subscriptions: self
                .inner
                .registry
                .active_keys()
                .iter()
                .map(ToString::to_string)
                .collect(),
            reconnect_attempts: snapshot.reconnect_attempts,
            endpoint: self.inner.endpoint.clone(),
        }
    }

    /// Wait until the session reaches `target`. Returns `false` if the
    /// driver stops first.
    pub async fn wait_for_state(&self, target: SessionState) -> bool {
        let mut rx = self.watch_state();
        loop {
            if rx.borrow_and_update().state == target {
                return true;
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Receiver that yields every published session snapshot.
    pub fn watch_state(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.clone()
    }
}
