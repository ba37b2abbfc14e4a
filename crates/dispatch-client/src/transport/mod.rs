//! Physical connection to the peer.
//!
//! The session only sees [`Connector`] and [`Transport`]. A live WebSocket
//! peer and the in-process generator are interchangeable behind them.

pub mod simulated;
pub mod websocket;

use async_trait::async_trait;

pub use simulated::SimulatedConnector;
pub use websocket::WebSocketConnector;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("transport is closed")]
    Closed,
}

/// What a transport yields while waiting for input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame, expected to hold an envelope
    Message(String),
    /// A transport-level error. Never closes the session by itself; the
    /// following `Closed` does.
    Error(String),
    /// The connection ended. `code` is the WebSocket close code.
    Closed { code: u16, reason: String },
}

/// Parameters for one connection attempt.
#[derive(Debug, Clone, Default)]
pub struct ConnectContext {
    /// Identity assigned by an earlier handshake, if any
    pub client_id: Option<String>,
}

/// An open connection.
///
/// `recv` must be cancel-safe: the session polls it inside `select!` and
/// drops the future whenever another branch wins.
#[async_trait]
pub trait Transport: Send {
    async fn recv(&mut self) -> TransportEvent;

    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    /// Close with the given code. Safe to call more than once.
    async fn close(&mut self, code: u16, reason: &str);
}

/// Opens transports.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, context: ConnectContext) -> Result<Box<dyn Transport>, TransportError>;

    /// Human-readable endpoint, for logs.
    fn endpoint(&self) -> String;
}
