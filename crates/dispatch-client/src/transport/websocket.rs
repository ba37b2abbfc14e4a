use std::borrow::Cow;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use dispatch_protocol::ABNORMAL_CLOSE_CODE;

use super::{ConnectContext, Connector, Transport, TransportError, TransportEvent};

/// Close frame without a status code.
const NO_STATUS_CODE: u16 = 1005;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connects to a live dispatch server over `ws://` or `wss://`.
pub struct WebSocketConnector {
    url: Url,
}

impl WebSocketConnector {
    pub fn new(url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url)?;
        match url.scheme() {
            "ws" | "wss" => Ok(Self { url }),
            scheme => Err(TransportError::Connect {
                endpoint: url.to_string(),
                message: format!("unsupported scheme `{}`", scheme),
            }),
        }
    }

    /// URL for one attempt. A known client id is offered back to the server
    /// so it can resume the same identity.
    fn attempt_url(&self, context: &ConnectContext) -> Url {
        let mut url = self.url.clone();
        if let Some(client_id) = &context.client_id {
            url.query_pairs_mut().append_pair("client_id", client_id);
        }
        url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, context: ConnectContext) -> Result<Box<dyn Transport>, TransportError> {
        let url = self.attempt_url(&context);
        tracing::info!(url = %url, "connecting to dispatch server");

        let (stream, _) =
            connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::Connect {
                    endpoint: self.url.to_string(),
                    message: e.to_string(),
                })?;

        tracing::info!("connected to dispatch server");
        Ok(Box::new(WebSocketTransport {
            stream,
            pending_close: None,
            closing: false,
        }))
    }

    fn endpoint(&self) -> String {
        self.url.to_string()
    }
}

pub struct WebSocketTransport {
    stream: WsStream,
    /// Close reported after a stream error has been surfaced
    pending_close: Option<TransportEvent>,
    closing: bool,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn recv(&mut self) -> TransportEvent {
        if let Some(closed) = self.pending_close.take() {
            return closed;
        }

        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return TransportEvent::Message(text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return TransportEvent::Message(text),
                    Err(_) => {
                        tracing::debug!("ignoring non-utf8 binary frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                        None => (NO_STATUS_CODE, String::new()),
                    };
                    tracing::info!(code, reason = %reason, "server closed connection");
                    return TransportEvent::Closed { code, reason };
                }
                // Pings are answered by tungstenite on the next read
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    let message = e.to_string();
                    self.pending_close = Some(TransportEvent::Closed {
                        code: ABNORMAL_CLOSE_CODE,
                        reason: message.clone(),
                    });
                    return TransportEvent::Error(message);
                }
                None => {
                    return TransportEvent::Closed {
                        code: ABNORMAL_CLOSE_CODE,
                        reason: "stream ended".to_string(),
                    };
                }
            }
        }
    }

    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        if self.closing {
            return Err(TransportError::Closed);
        }
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if self.closing {
            return;
        }
        self.closing = true;

        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        };
        if let Err(e) = self.stream.close(Some(frame)).await {
            tracing::debug!(error = %e, "error while closing websocket");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_websocket_scheme() {
        assert!(WebSocketConnector::new("http://localhost:8001/api/ws").is_err());
        assert!(WebSocketConnector::new("not a url").is_err());
        assert!(WebSocketConnector::new("wss://dispatch.example/api/ws").is_ok());
    }

    #[test]
    fn test_client_id_is_offered_on_reconnect() {
        let connector = WebSocketConnector::new("ws://localhost:8001/api/ws").unwrap();

        let fresh = connector.attempt_url(&ConnectContext::default());
        assert_eq!(fresh.as_str(), "ws://localhost:8001/api/ws");

        let resumed = connector.attempt_url(&ConnectContext {
            client_id: Some("client-7".to_string()),
        });
        assert_eq!(resumed.as_str(), "ws://localhost:8001/api/ws?client_id=client-7");
    }
}
