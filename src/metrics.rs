use crate::state::ConnectionState;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics for observability
///
/// Counters are cumulative for the lifetime of the client. Use `snapshot()`
/// on the client to get a point-in-time view including the connection state.
///
/// # Example
/// ```ignore
/// let metrics = client.metrics();
///
/// println!("Connections: {}", metrics.connections());
/// println!("Frames received: {}", metrics.frames_received());
///
/// let snapshot = client.metrics_snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    connections_total: AtomicU64,
    reconnects_scheduled_total: AtomicU64,
    frames_sent_total: AtomicU64,
    frames_queued_total: AtomicU64,
    frames_received_total: AtomicU64,
    decode_failures_total: AtomicU64,
    handler_failures_total: AtomicU64,
    heartbeats_sent_total: AtomicU64,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total connections established
    pub fn connections(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    /// Get total reconnect attempts scheduled
    pub fn reconnects_scheduled(&self) -> u64 {
        self.reconnects_scheduled_total.load(Ordering::Relaxed)
    }

    /// Get total frames written to the socket
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent_total.load(Ordering::Relaxed)
    }

    /// Get total frames parked in the outbound queue
    pub fn frames_queued(&self) -> u64 {
        self.frames_queued_total.load(Ordering::Relaxed)
    }

    /// Get total frames received
    pub fn frames_received(&self) -> u64 {
        self.frames_received_total.load(Ordering::Relaxed)
    }

    /// Get total inbound frames that failed to decode
    pub fn decode_failures(&self) -> u64 {
        self.decode_failures_total.load(Ordering::Relaxed)
    }

    /// Get total handler invocations that errored or panicked
    pub fn handler_failures(&self) -> u64 {
        self.handler_failures_total.load(Ordering::Relaxed)
    }

    /// Get total heartbeats sent or queued
    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeats_sent_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    pub(crate) fn record_connection(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reconnect_scheduled(&self) {
        self.reconnects_scheduled_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_sent(&self) {
        self.frames_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_queued(&self) {
        self.frames_queued_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frame_received(&self) {
        self.frames_received_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_decode_failure(&self) {
        self.decode_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_failure(&self) {
        self.handler_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heartbeat(&self) {
        self.heartbeats_sent_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Capture all counters together with the given live values
    pub(crate) fn snapshot(
        &self,
        state: ConnectionState,
        channels: usize,
        subscribed_channels: usize,
        queued_frames: usize,
    ) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Acquire),
            reconnects_scheduled_total: self.reconnects_scheduled_total.load(Ordering::Acquire),
            frames_sent_total: self.frames_sent_total.load(Ordering::Acquire),
            frames_queued_total: self.frames_queued_total.load(Ordering::Acquire),
            frames_received_total: self.frames_received_total.load(Ordering::Acquire),
            decode_failures_total: self.decode_failures_total.load(Ordering::Acquire),
            handler_failures_total: self.handler_failures_total.load(Ordering::Acquire),
            heartbeats_sent_total: self.heartbeats_sent_total.load(Ordering::Acquire),
            state,
            channels,
            subscribed_channels,
            queued_frames,
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub reconnects_scheduled_total: u64,
    pub frames_sent_total: u64,
    pub frames_queued_total: u64,
    pub frames_received_total: u64,
    pub decode_failures_total: u64,
    pub handler_failures_total: u64,
    pub heartbeats_sent_total: u64,
    pub state: ConnectionState,
    pub channels: usize,
    pub subscribed_channels: usize,
    pub queued_frames: usize,
}
