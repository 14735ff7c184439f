//! Example: Following row changes on two tables
//!
//! Subscribes to `public:todos` and `public:users` over one shared
//! connection and logs every change.
//!
//! Run with: REALTIME_URL=https://... REALTIME_API_KEY=... cargo run --example table_changes

use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ws_realtime::{
    Callback, ChangePayload, EventHandler, EventType, HandlerError, RealtimeClient,
    RealtimeConfig, SessionToken,
};

/// Logs every change it receives under the registration that fired it
struct ChangeLogger {
    table: &'static str,
}

impl EventHandler for ChangeLogger {
    fn receive(&self, event: EventType, payload: &ChangePayload) -> Result<(), HandlerError> {
        if payload.table != self.table {
            return Err(format!("unexpected table {}", payload.table).into());
        }
        info!(
            "[{}] {} via {} handler at {}",
            self.table, payload.event_type, event, payload.commit_timestamp
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let url = std::env::var("REALTIME_URL").unwrap_or_else(|_| "http://localhost:4000".into());
    let mut builder = RealtimeConfig::builder(url);
    if let Ok(key) = std::env::var("REALTIME_API_KEY") {
        builder = builder.api_key(key);
    }
    let config = builder.build()?;

    // The session can be refreshed later; reconnects pick up the new token
    let session = SessionToken::new();
    if let Ok(token) = std::env::var("REALTIME_TOKEN") {
        session.set(token);
    }

    let client = RealtimeClient::with_token_provider(config, session.clone())?;

    let todos = client.channel("public:todos");
    todos
        .on(
            EventType::Insert,
            Callback::new(|change: &ChangePayload| {
                info!("New todo: {:?}", change.new);
            }),
        )
        .on(
            EventType::Delete,
            Callback::new(|change: &ChangePayload| {
                info!("Todo removed: {:?}", change.old);
            }),
        )
        .on(EventType::All, Callback::new(ChangeLogger { table: "todos" }))
        .subscribe();

    client
        .channel("public:users")
        .on(EventType::All, Callback::new(ChangeLogger { table: "users" }))
        .subscribe();

    // Follow connection state in the background
    let mut changes = client.state_changes();
    tokio::spawn(async move {
        while changes.changed().await.is_ok() {
            let state = *changes.borrow_and_update();
            if state.is_connected() {
                info!("Connection up");
            } else {
                warn!("Connection {}", state);
            }
        }
    });

    info!("Running... Press Ctrl+C to stop");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tokio::time::sleep(Duration::from_secs(300)) => {}
    }

    let snapshot = client.metrics_snapshot();
    info!("Final metrics:");
    info!("  Connections: {}", snapshot.connections_total);
    info!("  Reconnects scheduled: {}", snapshot.reconnects_scheduled_total);
    info!("  Frames received: {}", snapshot.frames_received_total);
    info!("  Handler failures: {}", snapshot.handler_failures_total);

    // Dropping the last channel closes the connection
    todos.unsubscribe();
    client.channel("public:users").unsubscribe();
    info!("Stopped in state {}", client.connection_state());

    Ok(())
}
