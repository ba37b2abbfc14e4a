//! Real-time event client for the dispatch dashboard.
//!
//! A [`DispatchClient`] keeps one live session to the dispatch server (or to
//! the in-process simulated peer), multiplexes event subscriptions over it
//! and fans inbound envelopes out to consumers. [`NotificationCenter`]
//! turns selected events into a bounded notification log.

pub mod backoff;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod notifications;
pub mod registry;
pub mod session;
pub mod transport;

pub use client::{ClientStats, DispatchClient, SendOutcome};
pub use config::ClientConfig;
pub use dispatcher::{DispatchReport, Dispatcher};
pub use notifications::{Notification, NotificationCenter, NotificationDraft, NotificationLog};
pub use registry::{ConsumerResult, EventKey, Subscription, SubscriptionRegistry};
pub use session::{SessionSnapshot, SessionState};
