//! # ws-realtime
//!
//! Client-side realtime connection manager: many named channels multiplexed
//! over one WebSocket connection.
//!
//! ## Features
//!
//! - **Single shared connection**, opened lazily by the first subscription
//!   and closed when the last channel goes away
//! - **Auto-reconnection** with exponential backoff and optional full jitter
//! - **Resubscription** of every active channel after a reconnect
//! - **Outbound queue** that holds control frames while the socket is down
//! - **Heartbeats** while connected
//! - **Per-event-type handlers** with a wildcard, isolated from each other
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use ws_realtime::{Callback, ChangePayload, EventType, RealtimeClient, RealtimeConfig};
//!
//! let config = RealtimeConfig::builder("https://project.example.com")
//!     .api_key("anon-key")
//!     .build()?;
//!
//! let client = RealtimeClient::new(config)?;
//!
//! client
//!     .channel("public:todos")
//!     .on(EventType::Insert, Callback::new(|change: &ChangePayload| {
//!         println!("new todo: {:?}", change.new);
//!     }))
//!     .subscribe();
//! ```

mod auth;
mod channel;
mod config;
mod error;
mod handler;
mod manager;
mod message;
mod metrics;
mod queue;
mod state;
mod timer;
mod transport;

pub use auth::{NoToken, SessionToken, TokenProvider};
pub use channel::Channel;
pub use config::{BackoffConfig, ConfigError, RealtimeConfig, RealtimeConfigBuilder, TransportConfig};
pub use error::{Error, ErrorKind};
pub use handler::{Callback, EventHandler, HandlerError};
pub use manager::RealtimeClient;
pub use message::{ChangePayload, ClientMessage, EventType, Record, ServerMessage};
pub use metrics::{Metrics, MetricsSnapshot};
pub use state::ConnectionState;
pub use transport::{InboundFrame, Peer, Socket, Transport, TungsteniteTransport};

// Re-export http types for TransportConfig::headers
pub use http::{HeaderName, HeaderValue};

/// Result type for ws-realtime operations
pub type Result<T> = std::result::Result<T, Error>;
