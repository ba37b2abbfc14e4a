//! Fan-out of inbound envelopes to registered consumers.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde_json::json;

use dispatch_protocol::{ConnectionStatus, Envelope, EventKind};

use crate::registry::{Consumer, EventKey, SubscriptionRegistry};

/// Outcome of one dispatch pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

impl DispatchReport {
    pub fn invoked(&self) -> usize {
        self.delivered + self.failed
    }
}

/// Invokes consumers for one envelope at a time.
///
/// Consumers for a key are snapshotted when that key's pass starts, so a
/// consumer that subscribes or unsubscribes during its own invocation only
/// affects later envelopes. A failing or panicking consumer is logged and
/// skipped.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<SubscriptionRegistry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver `data` to exact-type consumers, then the envelope to wildcard
    /// consumers.
    pub fn dispatch(&self, envelope: &Envelope) -> DispatchReport {
        let mut report = DispatchReport::default();
        self.deliver(&EventKey::kind(envelope.kind()), envelope, &mut report);
        self.deliver(&EventKey::AllMessages, envelope, &mut report);
        report
    }

    /// Deliver to wildcard consumers only.
    ///
    /// Used for the peer's `connection` handshake, which shares its type
    /// with the local status event but not its meaning.
    pub fn dispatch_raw(&self, envelope: &Envelope) -> DispatchReport {
        let mut report = DispatchReport::default();
        self.deliver(&EventKey::AllMessages, envelope, &mut report);
        report
    }

    /// Emit a local `connection` status event to its exact-key consumers.
    pub fn dispatch_status(&self, status: ConnectionStatus) -> DispatchReport {
        tracing::debug!(status = status.as_str(), "dispatching connection status");
        let envelope = Envelope::new(EventKind::CONNECTION, json!({ "status": status }));
        let mut report = DispatchReport::default();
        self.deliver(&EventKey::kind(EventKind::CONNECTION), &envelope, &mut report);
        report
    }

    fn deliver(&self, key: &EventKey, envelope: &Envelope, report: &mut DispatchReport) {
        for consumer in self.registry.snapshot(key) {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| match &consumer {
                Consumer::Data(consumer) => consumer(envelope.data()),
                Consumer::Envelope(consumer) => consumer(envelope),
            }));

            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    let error = format!("{:#}", e);
                    tracing::error!(
                        event_type = %envelope.kind(),
                        key = %key,
                        error = %error,
                        "event consumer failed"
                    );
                }
                Err(payload) => {
                    report.failed += 1;
                    tracing::error!(
                        event_type = %envelope.kind(),
                        key = %key,
                        panic = %panic_message(payload.as_ref()),
                        "event consumer panicked"
                    );
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
