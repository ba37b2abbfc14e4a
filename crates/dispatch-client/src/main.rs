use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dispatch_client::config::{ClientConfig, ENV_SERVER_URL, ENV_SIMULATION_SEED};
use dispatch_client::{DispatchClient, NotificationCenter, SessionState};
use dispatch_protocol::{
    DomainEvent, Envelope, EventKind, IncidentStatusData, VehicleLocationData,
};

#[derive(Debug, Parser)]
#[command(name = "dispatch-client", about = "Stream live dispatch events")]
struct Args {
    /// Config file (default: ~/.dispatch-client/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket URL of the dispatch server; omit to run the simulation
    #[arg(long, env = ENV_SERVER_URL)]
    url: Option<String>,

    /// Seed for a reproducible simulated stream
    #[arg(long, env = ENV_SIMULATION_SEED)]
    seed: Option<u64>,

    /// Maximum reconnect attempts before giving up
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Notification log capacity
    #[arg(long)]
    capacity: Option<usize>,
}

impl Args {
    fn apply(&self, config: &mut ClientConfig) {
        if let Some(url) = &self.url {
            let url = url.trim();
            config.server.url = (!url.is_empty()).then(|| url.to_string());
        }
        if let Some(seed) = self.seed {
            config.simulation.seed = Some(seed);
        }
        if let Some(max_attempts) = self.max_attempts {
            config.reconnect.max_attempts = max_attempts;
        }
        if let Some(capacity) = self.capacity {
            config.notifications.capacity = capacity;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let mut config = ClientConfig::load(args.config.as_deref())?;
    args.apply(&mut config);
    config.validate()?;

    tracing::info!(
        endpoint = config.server_url().unwrap_or("simulation"),
        max_attempts = config.reconnect.max_attempts,
        capacity = config.notifications.capacity,
        "dispatch-client starting"
    );

    let client = DispatchClient::from_config(&config)?;
    let notifications = NotificationCenter::attach(&client, config.notifications.capacity);

    let _status = client.on_connection(|status| {
        tracing::info!(status = status.as_str(), "connection status");
    });
    let _vehicles = client.subscribe_as::<VehicleLocationData, _>(
        EventKind::VEHICLE_LOCATION,
        |data| {
            let [lat, lng] = data.location.coordinates;
            tracing::info!(
                vehicle_id = %data.vehicle_id,
                lat,
                lng,
                speed = data.location.speed,
                "vehicle moved"
            );
            Ok(())
        },
    );
    let _incidents = client.subscribe_as::<IncidentStatusData, _>(
        EventKind::INCIDENT_STATUS,
        |data| {
            tracing::info!(
                incident_id = %data.incident_id,
                status = data.status.as_str(),
                "incident status"
            );
            Ok(())
        },
    );
    let _raw = client.subscribe_all(log_envelope);

    client.connect().await;

    let mut state = client.watch_state();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let failed = client.wait_for_state(SessionState::Failed);
    tokio::pin!(failed);

    let mut gave_up = false;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("interrupted, disconnecting");
                break;
            }
            reached = &mut failed => {
                gave_up = reached;
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = state.borrow_and_update().clone();
                tracing::info!(
                    state = %snapshot.state,
                    attempts = snapshot.reconnect_attempts,
                    client_id = ?snapshot.client_id,
                    unread = notifications.unread_count(),
                    "session update"
                );
            }
        }
    }

    let attempts = client.reconnect_attempts();
    client.shutdown().await;

    for notification in notifications.snapshot() {
        tracing::info!(
            kind = notification.kind.as_str(),
            priority = notification.priority.as_str(),
            read = notification.read,
            "{}",
            notification.message
        );
    }
    tracing::info!(unread = notifications.unread_count(), "dispatch-client stopped");

    if gave_up {
        anyhow::bail!(
            "connection to {} failed after {} reconnect attempts",
            client.endpoint(),
            attempts
        );
    }
    Ok(())
}

fn log_envelope(envelope: &Envelope) -> anyhow::Result<()> {
    match DomainEvent::from_envelope(envelope) {
        Ok(Some(event)) => tracing::debug!(
            event_type = event.kind(),
            timestamp = %envelope.timestamp(),
            "domain event"
        ),
        Ok(None) => tracing::debug!(event_type = %envelope.kind(), "control message"),
        Err(e) => tracing::debug!(
            event_type = %envelope.kind(),
            error = %e,
            "event outside its payload contract"
        ),
    }
    Ok(())
}
