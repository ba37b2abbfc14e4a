//! End-to-end tests of a client running against the simulated peer.
//!
//! Time is paused, so the simulated stream advances only as the runtime
//! auto-advances the clock.
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use dispatch_client::{ClientConfig, DispatchClient, NotificationCenter, SessionState};
use dispatch_protocol::{ConnectionStatus, DomainEvent, EventKind};

fn seeded_config(seed: u64) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.simulation.seed = Some(seed);
    config.keepalive.interval_secs = 0;
    config
}

/// Collect the kinds of every domain event the client dispatches.
fn record_kinds(client: &DispatchClient) -> (Arc<Mutex<Vec<&'static str>>>, dispatch_client::Subscription) {
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = kinds.clone();
    let subscription = client.subscribe_all(move |envelope| {
        if let Some(event) = DomainEvent::from_envelope(envelope)? {
            sink.lock().push(event.kind());
        }
        Ok(())
    });
    (kinds, subscription)
}

#[tokio::test(start_paused = true)]
async fn test_simulated_session_streams_events() {
    let config = seeded_config(42);
    let client = DispatchClient::from_config(&config).expect("simulation needs no url");
    let notifications = NotificationCenter::attach(&client, config.notifications.capacity);
    let (kinds, _all) = record_kinds(&client);

    assert_eq!(client.endpoint(), "simulation");
    client.connect().await;
    assert_eq!(client.state(), SessionState::Connecting);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert_eq!(client.state(), SessionState::Open);
    let client_id = client.client_id().expect("handshake assigns a client id");
    assert!(client_id.starts_with("sim-"), "got {}", client_id);
    assert!(notifications.is_connected());

    tokio::time::sleep(Duration::from_secs(300)).await;
    let seen = kinds.lock().clone();
    // Intervals are drawn from 3..=8 seconds.
    assert!(seen.len() >= 30, "only {} events in 300s", seen.len());
    assert!(seen.len() <= 101, "{} events in 300s", seen.len());
    assert!(seen.iter().all(|kind| EventKind::DOMAIN.contains(kind)));
    assert!(notifications.len() <= 20);
    assert!(notifications.unread_count() <= notifications.len());

    client.disconnect().await;
    assert_eq!(client.state(), SessionState::Closed);
    assert!(!notifications.is_connected());
    let count = kinds.lock().len();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(kinds.lock().len(), count, "stream continued after disconnect");

    client.shutdown().await;
    println!("✓ simulated session streams {} events", count);
}

#[tokio::test(start_paused = true)]
async fn test_same_seed_same_stream() {
    async fn run(seed: u64) -> Vec<&'static str> {
        let client = DispatchClient::from_config(&seeded_config(seed)).expect("simulation");
        let (kinds, _all) = record_kinds(&client);
        client.connect().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        client.shutdown().await;
        kinds.lock().clone()
    }

    let first = run(7).await;
    let second = run(7).await;
    assert!(!first.is_empty());
    assert_eq!(first, second);

    println!("✓ seeded simulation is reproducible");
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_connecting_cancels() {
    let client = DispatchClient::from_config(&seeded_config(3)).expect("simulation");
    let (kinds, _all) = record_kinds(&client);
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = statuses.clone();
    let _status = client.on_connection(move |status| sink.lock().push(status));

    client.connect().await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.state(), SessionState::Connecting);

    client.disconnect().await;
    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(client.state(), SessionState::Closed);
    assert_eq!(client.client_id(), None);
    assert!(kinds.lock().is_empty());
    assert!(!statuses.lock().contains(&ConnectionStatus::Connected));

    println!("✓ disconnect cancels a pending connect");
}
