use crate::auth::{NoToken, TokenProvider};
use crate::channel::{Channel, ChannelOwner, ChannelShared};
use crate::config::RealtimeConfig;
use crate::error::Error;
use crate::message::{ClientMessage, ServerMessage};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::queue::OutboundQueue;
use crate::state::{ConnectionState, Transition};
use crate::timer::ScheduledTask;
use crate::transport::{redact_target, InboundFrame, Socket, Transport, TungsteniteTransport};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use url::Url;

/// Client owning one realtime connection shared by every channel.
///
/// The connection is opened lazily by the first `subscribe()`, reopened with
/// exponential backoff when it drops, and closed once the last channel is
/// unsubscribed. Frames sent while the socket is down are queued and flushed
/// in order on reconnect, after which every subscribed channel is
/// resubscribed.
///
/// # Thread Safety
///
/// `RealtimeClient` is `Send + Sync` and cheap to clone; clones share the same
/// connection. All connection state sits behind one `parking_lot::Mutex`, so
/// operations and transport events never interleave. Handlers run outside
/// that lock and may call back into the client.
///
/// Background tasks hold only weak references: dropping the last clone
/// aborts timers and closes the socket.
pub struct RealtimeClient<T: Transport = TungsteniteTransport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for RealtimeClient<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<T: Transport> {
    config: RealtimeConfig,
    transport: Arc<T>,
    tokens: Box<dyn TokenProvider>,
    metrics: Arc<Metrics>,
    runtime: Handle,
    state_tx: watch::Sender<ConnectionState>,
    state: Mutex<ManagerState>,
    self_ref: Weak<Inner<T>>,
}

struct ManagerState {
    connection: ConnectionState,
    /// Bumped on every connect and disconnect; transport events carrying an
    /// older value are ignored
    epoch: u64,
    socket: Option<mpsc::UnboundedSender<String>>,
    channels: HashMap<String, Arc<ChannelShared>>,
    outbound: OutboundQueue,
    reconnect_attempt: u32,
    reconnect_timer: Option<ScheduledTask>,
    heartbeat_timer: Option<ScheduledTask>,
}

impl Default for ManagerState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            epoch: 0,
            socket: None,
            channels: HashMap::new(),
            outbound: OutboundQueue::new(),
            reconnect_attempt: 0,
            reconnect_timer: None,
            heartbeat_timer: None,
        }
    }
}

impl RealtimeClient<TungsteniteTransport> {
    /// Create an anonymous client over the WebSocket transport.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(config: RealtimeConfig) -> Result<Self, Error> {
        Self::with_token_provider(config, NoToken)
    }

    /// Create a client that reads its access token from `tokens` on every
    /// connection attempt
    pub fn with_token_provider(
        config: RealtimeConfig,
        tokens: impl TokenProvider,
    ) -> Result<Self, Error> {
        let transport = TungsteniteTransport::new(config.transport.clone());
        Self::with_transport(config, transport, tokens)
    }
}

impl<T: Transport> RealtimeClient<T> {
    /// Create a client over a custom transport
    pub fn with_transport(
        config: RealtimeConfig,
        transport: T,
        tokens: impl TokenProvider,
    ) -> Result<Self, Error> {
        let runtime = Handle::try_current().map_err(|e| Error::NoRuntime(e.to_string()))?;
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        let inner = Arc::new_cyclic(|self_ref| Inner {
            config,
            transport: Arc::new(transport),
            tokens: Box::new(tokens),
            metrics: Arc::new(Metrics::new()),
            runtime,
            state_tx,
            state: Mutex::new(ManagerState::default()),
            self_ref: self_ref.clone(),
        });

        Ok(Self { inner })
    }

    /// Get the channel registered under `name`, creating it if needed.
    ///
    /// Returns the same channel for the same name until it is unsubscribed
    /// or the client disconnects. Never opens the connection by itself.
    pub fn channel(&self, name: impl Into<String>) -> Channel {
        let shared = {
            let mut state = self.inner.state.lock();
            state
                .channels
                .entry(name.into())
                .or_insert_with_key(|name| {
                    debug!("[CHANNEL-{}] Registered", name);
                    ChannelShared::new(name.clone())
                })
                .clone()
        };
        Channel::new(shared, self.inner.owner())
    }

    /// All registered channels, subscribed or not
    pub fn channels(&self) -> Vec<Channel> {
        let shared: Vec<Arc<ChannelShared>> =
            self.inner.state.lock().channels.values().cloned().collect();
        shared
            .into_iter()
            .map(|channel| Channel::new(channel, self.inner.owner()))
            .collect()
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().connection
    }

    /// Watch connection state changes
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Open the connection now instead of waiting for a subscribe.
    /// Does nothing while connecting or connected.
    pub fn connect(&self) {
        let mut state = self.inner.state.lock();
        self.inner.connect_locked(&mut state);
    }

    /// Close the connection and forget every channel.
    ///
    /// Pending reconnects and queued frames are discarded. Existing channel
    /// handles become inert; request fresh ones with [`channel`](Self::channel).
    pub fn disconnect(&self) {
        let mut state = self.inner.state.lock();
        self.inner.disconnect_locked(&mut state);
    }

    /// Get the metrics for this client
    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    /// Get a point-in-time snapshot of all metrics
    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        let state = self.inner.state.lock();
        let subscribed = state
            .channels
            .values()
            .filter(|channel| channel.is_subscribed())
            .count();
        self.inner.metrics.snapshot(
            state.connection,
            state.channels.len(),
            subscribed,
            state.outbound.len(),
        )
    }

    /// Get the client configuration
    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }
}

impl<T: Transport> fmt::Debug for RealtimeClient<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RealtimeClient")
            .field("state", &state.connection)
            .field("channels", &state.channels.len())
            .field("queued_frames", &state.outbound.len())
            .finish()
    }
}

/// Build the socket URL: base URL with a socket scheme, the realtime path
/// appended, and credentials as query parameters.
pub(crate) fn connection_target(
    config: &RealtimeConfig,
    token: Option<String>,
) -> Result<Url, Error> {
    let mut url = config.url.clone();

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => return Err(Error::UnsupportedScheme(other.to_string())),
    };
    url.set_scheme(scheme)
        .map_err(|_| Error::UnsupportedScheme(url.scheme().to_string()))?;

    let path = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        config.realtime_path.trim_start_matches('/')
    );
    url.set_path(&path);

    let mut params = Vec::new();
    if let Some(key) = &config.api_key {
        params.push(("apikey", key.clone()));
    }
    if let Some(token) = token {
        params.push(("token", token));
    }
    if !params.is_empty() {
        url.query_pairs_mut().extend_pairs(params);
    }

    Ok(url)
}

impl<T: Transport> Inner<T> {
    fn owner(&self) -> Weak<dyn ChannelOwner> {
        let owner: Weak<dyn ChannelOwner> = self.self_ref.clone();
        owner
    }

    fn apply(&self, state: &mut ManagerState, transition: Transition) {
        let next = state.connection.next(transition);
        if next != state.connection {
            debug!(
                "[CONN-{}] {} -> {}",
                state.epoch, state.connection, next
            );
            state.connection = next;
            self.state_tx.send_replace(next);
        }
    }

    fn connect_locked(&self, state: &mut ManagerState) {
        if matches!(
            state.connection,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            trace!("Connect ignored, already {}", state.connection);
            return;
        }

        // A pending reconnect belongs to the superseded epoch
        state.reconnect_timer = None;
        state.epoch += 1;
        let epoch = state.epoch;
        self.apply(state, Transition::Connect);

        let target = match connection_target(&self.config, self.tokens.access_token()) {
            Ok(target) => target,
            Err(e) => {
                warn!("[CONN-{}] Cannot build connection target: {}", epoch, e);
                self.handle_loss_locked(state);
                return;
            }
        };

        info!("[CONN-{}] Connecting to {}", epoch, redact_target(&target));
        self.runtime.spawn(run_connection(
            self.self_ref.clone(),
            self.transport.clone(),
            target,
            epoch,
        ));
    }

    fn disconnect_locked(&self, state: &mut ManagerState) {
        state.epoch += 1;
        state.heartbeat_timer = None;
        state.reconnect_timer = None;
        if state.socket.take().is_some() {
            info!("[CONN-{}] Closing connection", state.epoch);
        }
        self.apply(state, Transition::Disconnect);

        for channel in state.channels.values() {
            channel.reset();
        }
        state.channels.clear();
        state.outbound.clear();
        state.reconnect_attempt = 0;
    }

    /// Write a frame if connected, otherwise queue it for the next open
    fn send_locked(&self, state: &mut ManagerState, frame: ClientMessage) {
        if state.connection.is_connected() {
            if let Some(socket) = &state.socket {
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        let e = Error::from(e);
                        warn!(
                            "[CONN-{}] Dropping frame ({:?}): {}",
                            state.epoch,
                            e.kind(),
                            e
                        );
                        return;
                    }
                };
                if socket.send(text).is_ok() {
                    self.metrics.record_frame_sent();
                    trace!("[CONN-{}] Sent {:?}", state.epoch, frame);
                    return;
                }
                debug!("[CONN-{}] Socket closed, queueing {:?}", state.epoch, frame);
            }
        }

        state.outbound.push(frame);
        self.metrics.record_frame_queued();
    }

    fn handle_open(&self, epoch: u64, socket: Socket) -> Option<mpsc::Receiver<InboundFrame>> {
        let mut state = self.state.lock();
        if state.epoch != epoch || state.connection != ConnectionState::Connecting {
            debug!("[CONN-{}] Stale connection opened, dropping it", epoch);
            return None;
        }

        let (outbound, inbound) = socket.into_parts();
        state.socket = Some(outbound);
        self.apply(&mut state, Transition::Opened);
        state.reconnect_attempt = 0;
        self.metrics.record_connection();
        info!(
            "[CONN-{}] Connected with {} channels, {} queued frames",
            epoch,
            state.channels.len(),
            state.outbound.len()
        );

        self.start_heartbeat_locked(&mut state, epoch);

        // Queued frames first, in order. A channel whose subscribe was just
        // flushed needs no second subscribe.
        if !state.outbound.is_empty() {
            debug!("[CONN-{}] Flushing {} queued frames", epoch, state.outbound.len());
        }
        let pending = state.outbound.drain();
        let mut flushed = HashSet::new();
        for frame in pending {
            if let ClientMessage::Subscribe { channel } = &frame {
                flushed.insert(channel.clone());
            }
            self.send_locked(&mut state, frame);
        }

        let resubscribe: Vec<String> = state
            .channels
            .values()
            .filter(|channel| channel.is_subscribed() && !flushed.contains(channel.name()))
            .map(|channel| channel.name().to_string())
            .collect();
        for channel in resubscribe {
            debug!("[CHANNEL-{}] Resubscribing", channel);
            self.send_locked(&mut state, ClientMessage::Subscribe { channel });
        }

        Some(inbound)
    }

    /// Returns false once the connection is no longer current
    fn handle_frame(&self, epoch: u64, text: &str) -> bool {
        let decoded = ServerMessage::decode(text);

        let target = {
            let state = self.state.lock();
            if state.epoch != epoch {
                return false;
            }
            self.metrics.record_frame_received();

            match decoded {
                Ok(ServerMessage::Event { channel, payload }) => {
                    match state.channels.get(&channel) {
                        Some(shared) => Some((shared.clone(), payload)),
                        None => {
                            trace!("[CHANNEL-{}] Event for unknown channel", channel);
                            None
                        }
                    }
                }
                Ok(ServerMessage::Other) => {
                    trace!("[CONN-{}] Ignoring non-event frame", epoch);
                    None
                }
                Err(e) => {
                    self.metrics.record_decode_failure();
                    debug!("[CONN-{}] Dropping undecodable frame: {}", epoch, e);
                    None
                }
            }
        };

        if let Some((channel, payload)) = target {
            let failures = channel.dispatch(&payload);
            for _ in 0..failures {
                self.metrics.record_handler_failure();
            }
        }
        true
    }

    fn handle_close(&self, epoch: u64, error: Option<Error>) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            debug!("[CONN-{}] Stale close ignored", epoch);
            return;
        }

        match error {
            Some(e) => warn!("[CONN-{}] Connection lost ({:?}): {}", epoch, e.kind(), e),
            None => info!("[CONN-{}] Connection closed by server", epoch),
        }
        self.handle_loss_locked(&mut state);
    }

    fn handle_loss_locked(&self, state: &mut ManagerState) {
        state.heartbeat_timer = None;
        state.socket = None;
        if state.connection == ConnectionState::Disconnected {
            return;
        }
        self.apply(state, Transition::Lost);
        self.schedule_reconnect_locked(state);
    }

    fn schedule_reconnect_locked(&self, state: &mut ManagerState) {
        if state.reconnect_timer.is_some() {
            trace!("[CONN-{}] Reconnect already pending", state.epoch);
            return;
        }

        let epoch = state.epoch;
        let delay = self.config.backoff.delay_for_attempt(state.reconnect_attempt);
        info!(
            "[CONN-{}] Reconnecting in {:?} (attempt {})",
            epoch,
            delay,
            state.reconnect_attempt + 1
        );
        self.metrics.record_reconnect_scheduled();

        let weak = self.self_ref.clone();
        state.reconnect_timer = Some(ScheduledTask::spawn(&self.runtime, async move {
            sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire_reconnect(epoch);
            }
        }));
    }

    fn fire_reconnect(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch != epoch || state.connection != ConnectionState::Recovering {
            debug!("[CONN-{}] Stale reconnect timer", epoch);
            return;
        }

        // Runs on the timer task itself; the abort on drop lands after it returns
        state.reconnect_timer = None;
        state.reconnect_attempt = state.reconnect_attempt.saturating_add(1);
        self.connect_locked(&mut state);
    }

    fn start_heartbeat_locked(&self, state: &mut ManagerState, epoch: u64) {
        let period = self.config.heartbeat_interval;
        let weak = self.self_ref.clone();

        state.heartbeat_timer = Some(ScheduledTask::spawn(&self.runtime, async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if !inner.send_heartbeat(epoch) {
                    return;
                }
            }
        }));
    }

    fn send_heartbeat(&self, epoch: u64) -> bool {
        let mut state = self.state.lock();
        if state.epoch != epoch || !state.connection.is_connected() {
            return false;
        }
        trace!("[CONN-{}] Heartbeat", epoch);
        self.send_locked(&mut state, ClientMessage::Heartbeat);
        self.metrics.record_heartbeat();
        true
    }
}

impl<T: Transport> ChannelOwner for Inner<T> {
    fn subscribe_channel(&self, channel: &Arc<ChannelShared>) {
        let mut state = self.state.lock();

        let registered = state
            .channels
            .get(channel.name())
            .is_some_and(|current| Arc::ptr_eq(current, channel));
        if !registered {
            debug!(
                "[CHANNEL-{}] Handle no longer registered, ignoring subscribe",
                channel.name()
            );
            return;
        }

        if !channel.mark_subscribed() {
            trace!("[CHANNEL-{}] Already subscribed", channel.name());
            return;
        }

        info!("[CHANNEL-{}] Subscribing", channel.name());
        self.send_locked(
            &mut state,
            ClientMessage::Subscribe {
                channel: channel.name().to_string(),
            },
        );

        if state.connection == ConnectionState::Disconnected {
            self.connect_locked(&mut state);
        }
    }

    fn unsubscribe_channel(&self, channel: &Arc<ChannelShared>) {
        let mut state = self.state.lock();

        if !channel.mark_unsubscribed() {
            trace!("[CHANNEL-{}] Not subscribed", channel.name());
            return;
        }

        info!("[CHANNEL-{}] Unsubscribing", channel.name());
        self.send_locked(
            &mut state,
            ClientMessage::Unsubscribe {
                channel: channel.name().to_string(),
            },
        );

        let registered = state
            .channels
            .get(channel.name())
            .is_some_and(|current| Arc::ptr_eq(current, channel));
        if registered {
            state.channels.remove(channel.name());
        }

        if state.channels.is_empty() {
            info!("No channels left, disconnecting");
            self.disconnect_locked(&mut state);
        }
    }
}

/// Drive one connection attempt and its inbound frames
async fn run_connection<T: Transport>(
    inner: Weak<Inner<T>>,
    transport: Arc<T>,
    target: Url,
    epoch: u64,
) {
    let result = transport.connect(target).await;

    let mut inbound = {
        let Some(client) = inner.upgrade() else {
            return;
        };
        match result {
            Ok(socket) => match client.handle_open(epoch, socket) {
                Some(inbound) => inbound,
                None => return,
            },
            Err(e) => {
                client.handle_close(epoch, Some(e));
                return;
            }
        }
    };

    while let Some(frame) = inbound.recv().await {
        let Some(client) = inner.upgrade() else {
            return;
        };
        match frame {
            Ok(text) => {
                if !client.handle_frame(epoch, &text) {
                    debug!("[CONN-{}] Reader retired", epoch);
                    return;
                }
            }
            Err(e) => {
                client.handle_close(epoch, Some(e));
                return;
            }
        }
    }

    if let Some(client) = inner.upgrade() {
        client.handle_close(epoch, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SessionToken;
    use crate::config::BackoffConfig;
    use crate::handler::Callback;
    use crate::message::{ChangePayload, EventType};
    use crate::transport::testing::{Plan, ScriptHandle, ScriptedTransport};
    use crate::transport::Peer;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    fn test_config() -> RealtimeConfig {
        RealtimeConfig::builder("https://api.example.com")
            .api_key("anon")
            .backoff(BackoffConfig {
                initial_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
                multiplier: 2.0,
                jitter: false,
            })
            .build()
            .unwrap()
    }

    fn client_with(
        config: RealtimeConfig,
        plans: Vec<Plan>,
        fallback: Plan,
    ) -> (RealtimeClient<ScriptedTransport>, ScriptHandle) {
        let (transport, script) = ScriptedTransport::new(plans, fallback);
        let client = RealtimeClient::with_transport(config, transport, NoToken).unwrap();
        (client, script)
    }

    async fn wait_for_state(client: &RealtimeClient<ScriptedTransport>, expected: ConnectionState) {
        let mut changes = client.state_changes();
        tokio::time::timeout(Duration::from_secs(60), changes.wait_for(|s| *s == expected))
            .await
            .expect("timed out waiting for state")
            .map(|_| ())
            .expect("client dropped");
    }

    fn event(channel: &str, event_type: &str) -> serde_json::Value {
        json!({
            "type": "event",
            "channel": channel,
            "payload": {
                "type": event_type,
                "table": "todos",
                "schema": "public",
                "commit_timestamp": "2024-01-01T00:00:00Z",
                "new": {"id": 1}
            }
        })
    }

    fn counting(hits: &Arc<AtomicUsize>) -> Callback {
        let hits = hits.clone();
        Callback::new(move |_: &ChangePayload| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    /// Subscribe a channel whose handler signals `Notify`, so a test can tell
    /// when every earlier frame has been dispatched
    fn sentinel(client: &RealtimeClient<ScriptedTransport>) -> Arc<Notify> {
        let seen = Arc::new(Notify::new());
        let signal = seen.clone();
        client
            .channel("sentinel")
            .on(
                EventType::All,
                Callback::new(move |_: &ChangePayload| signal.notify_one()),
            )
            .subscribe();
        seen
    }

    async fn flush_through(peer: &Peer, seen: &Notify) {
        peer.push(event("sentinel", "INSERT")).await;
        tokio::time::timeout(Duration::from_secs(60), seen.notified())
            .await
            .expect("sentinel event not dispatched");
    }

    #[test]
    fn test_connection_target_maps_scheme_and_appends_credentials() {
        let config = RealtimeConfig::builder("https://api.example.com")
            .api_key("anon")
            .build()
            .unwrap();
        let target = connection_target(&config, Some("jwt".to_string())).unwrap();
        assert_eq!(
            target.as_str(),
            "wss://api.example.com/realtime?apikey=anon&token=jwt"
        );

        let config = RealtimeConfig::builder("http://localhost:4000/v1/")
            .build()
            .unwrap();
        let target = connection_target(&config, None).unwrap();
        assert_eq!(target.as_str(), "ws://localhost:4000/v1/realtime");

        let config = RealtimeConfig::builder("wss://rt.example.com")
            .realtime_path("socket")
            .build()
            .unwrap();
        let target = connection_target(&config, None).unwrap();
        assert_eq!(target.as_str(), "wss://rt.example.com/socket");
    }

    #[test]
    fn test_connection_target_rejects_unknown_scheme() {
        let mut config = RealtimeConfig::builder("https://api.example.com")
            .build()
            .unwrap();
        config.url = Url::parse("ftp://files.example.com").unwrap();
        assert!(matches!(
            connection_target(&config, None),
            Err(Error::UnsupportedScheme(_))
        ));
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let config = test_config();
        let result = RealtimeClient::new(config);
        assert!(matches!(result, Err(Error::NoRuntime(_))));
    }

    #[tokio::test]
    async fn test_channel_lookup_is_memoized_and_lazy() {
        let (client, script) = client_with(test_config(), vec![], Plan::Accept);

        let first = client.channel("todos");
        let second = client.channel("todos");
        first.on(EventType::Insert, Callback::new(|_: &ChangePayload| {}));

        assert_eq!(first, second);
        assert_ne!(first, client.channel("other"));
        assert_eq!(client.channels().len(), 2);

        tokio::task::yield_now().await;
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(script.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_connects_and_sends_once() {
        let (client, mut script) = client_with(test_config(), vec![], Plan::Accept);

        let channel = client.channel("todos");
        channel.subscribe();
        assert_eq!(client.connection_state(), ConnectionState::Connecting);

        let mut peer = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;

        assert_eq!(
            peer.next_frame().await,
            json!({"type": "subscribe", "channel": "todos"})
        );

        channel.subscribe();
        client.channel("todos").subscribe();
        assert!(peer.from_client.try_recv().is_err());

        let target = &script.attempts()[0].target;
        assert_eq!(target.scheme(), "wss");
        assert_eq!(target.path(), "/realtime");
        assert_eq!(client.metrics().connections(), 1);
    }

    #[tokio::test]
    async fn test_queued_frames_flush_in_order() {
        let release = Arc::new(Notify::new());
        let (client, mut script) =
            client_with(test_config(), vec![Plan::Hold(release.clone())], Plan::Accept);

        let a = client.channel("a");
        let b = client.channel("b");
        a.subscribe();
        b.subscribe();
        a.unsubscribe();
        assert_eq!(client.metrics_snapshot().queued_frames, 3);

        release.notify_one();
        let mut peer = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;

        assert_eq!(peer.next_frame().await, json!({"type": "subscribe", "channel": "a"}));
        assert_eq!(peer.next_frame().await, json!({"type": "subscribe", "channel": "b"}));
        assert_eq!(peer.next_frame().await, json!({"type": "unsubscribe", "channel": "a"}));
        assert!(peer.from_client.try_recv().is_err());
        assert_eq!(client.metrics_snapshot().queued_frames, 0);
    }

    #[tokio::test]
    async fn test_resubscribes_after_connection_loss() {
        let (client, mut script) = client_with(test_config(), vec![], Plan::Accept);

        client.channel("a").subscribe();
        client.channel("b").subscribe();
        client
            .channel("idle")
            .on(EventType::Insert, Callback::new(|_: &ChangePayload| {}));

        let mut first = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;
        first.next_frame().await;
        first.next_frame().await;

        drop(first);
        let mut second = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;

        let mut resubscribed = vec![second.next_frame().await, second.next_frame().await];
        resubscribed.sort_by_key(|frame| frame["channel"].as_str().map(str::to_string));
        assert_eq!(
            resubscribed,
            vec![
                json!({"type": "subscribe", "channel": "a"}),
                json!({"type": "subscribe", "channel": "b"}),
            ]
        );
        assert!(second.from_client.try_recv().is_err());
        assert_eq!(script.attempts().len(), 2);
        assert_eq!(client.metrics().reconnects_scheduled(), 1);
    }

    #[tokio::test]
    async fn test_at_most_one_connection() {
        let (client, mut script) = client_with(test_config(), vec![], Plan::Accept);

        let a = client.channel("a");
        a.subscribe();
        client.connect();
        client.channel("b").subscribe();
        client.connect();

        let mut first = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;
        client.connect();
        assert_eq!(script.attempts().len(), 1);

        a.unsubscribe();
        client.channel("b").unsubscribe();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(first.closed_by_client().await);

        client.channel("c").subscribe();
        let _second = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;
        assert_eq!(script.attempts().len(), 2);
    }

    #[tokio::test]
    async fn test_events_dispatched_by_type() {
        let (client, mut script) = client_with(test_config(), vec![], Plan::Accept);

        let inserts = Arc::new(AtomicUsize::new(0));
        let updates = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));
        client
            .channel("todos")
            .on(EventType::Insert, counting(&inserts))
            .on(EventType::Update, counting(&updates))
            .on(EventType::All, counting(&all))
            .subscribe();
        let seen = sentinel(&client);

        let peer = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;

        peer.push(event("todos", "UPDATE")).await;
        peer.push(event("elsewhere", "INSERT")).await;
        peer.push(json!({"type": "heartbeat_ack"})).await;
        peer.to_client
            .send(Ok("not json".to_string()))
            .await
            .unwrap();
        flush_through(&peer, &seen).await;

        assert_eq!(inserts.load(Ordering::SeqCst), 0);
        assert_eq!(updates.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 1);
        assert_eq!(client.metrics().decode_failures(), 1);
        assert_eq!(client.metrics().frames_received(), 5);
        assert_eq!(client.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_delivery() {
        let (client, mut script) = client_with(test_config(), vec![], Plan::Accept);

        let second = Arc::new(AtomicUsize::new(0));
        let wildcard = Arc::new(AtomicUsize::new(0));
        client
            .channel("todos")
            .on(
                EventType::Insert,
                Callback::new(|_: &ChangePayload| panic!("handler bug")),
            )
            .on(EventType::Insert, counting(&second))
            .on(EventType::All, counting(&wildcard))
            .subscribe();
        let seen = sentinel(&client);

        let peer = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;

        peer.push(event("todos", "INSERT")).await;
        peer.push(event("todos", "INSERT")).await;
        flush_through(&peer, &seen).await;

        assert_eq!(second.load(Ordering::SeqCst), 2);
        assert_eq!(wildcard.load(Ordering::SeqCst), 2);
        assert_eq!(client.metrics().handler_failures(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (client, mut script) = client_with(test_config(), vec![], Plan::Accept);

        let hits = Arc::new(AtomicUsize::new(0));
        let todos = client.channel("todos");
        todos.on(EventType::All, counting(&hits)).subscribe();
        let seen = sentinel(&client);

        let mut peer = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;
        peer.next_frame().await;
        peer.next_frame().await;

        todos.unsubscribe();
        assert_eq!(
            peer.next_frame().await,
            json!({"type": "unsubscribe", "channel": "todos"})
        );
        assert!(!todos.is_subscribed());

        peer.push(event("todos", "INSERT")).await;
        flush_through(&peer, &seen).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        // The name is free again and yields a fresh channel
        let fresh = client.channel("todos");
        assert_ne!(fresh, todos);
        todos.subscribe();
        assert!(!todos.is_subscribed());
    }

    #[tokio::test]
    async fn test_last_unsubscribe_tears_down() {
        let (client, mut script) = client_with(test_config(), vec![], Plan::Accept);

        let todos = client.channel("todos");
        todos.subscribe();
        let mut peer = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;
        peer.next_frame().await;

        todos.unsubscribe();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert_eq!(
            peer.next_frame().await,
            json!({"type": "unsubscribe", "channel": "todos"})
        );
        assert!(peer.closed_by_client().await);
        assert!(client.channels().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting_discards_late_socket() {
        let release = Arc::new(Notify::new());
        let (client, mut script) =
            client_with(test_config(), vec![Plan::Hold(release.clone())], Plan::Accept);

        let todos = client.channel("todos");
        todos.subscribe();
        assert_eq!(client.connection_state(), ConnectionState::Connecting);

        client.disconnect();
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert!(!todos.is_subscribed());

        release.notify_one();
        let mut late = script.next_peer().await;
        assert!(late.closed_by_client().await);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert_eq!(client.metrics().connections(), 0);
    }

    #[tokio::test]
    async fn test_failed_send_is_queued_for_next_connection() {
        let (client, mut script) = client_with(test_config(), vec![], Plan::Accept);

        client.channel("a").subscribe();
        let first = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;

        // Writes now fail but the close has not been observed yet
        let Peer {
            from_client,
            to_client,
        } = first;
        drop(from_client);
        client.channel("b").subscribe();
        assert_eq!(client.metrics_snapshot().queued_frames, 1);

        drop(to_client);
        let mut second = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;

        assert_eq!(second.next_frame().await, json!({"type": "subscribe", "channel": "b"}));
        assert_eq!(second.next_frame().await, json!({"type": "subscribe", "channel": "a"}));
        assert!(second.from_client.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_token_read_on_every_connect() {
        let session = SessionToken::with_token("first");
        let (transport, mut script) = ScriptedTransport::new(vec![], Plan::Accept);
        let client =
            RealtimeClient::with_transport(test_config(), transport, session.clone()).unwrap();

        client.channel("todos").subscribe();
        let peer = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;

        session.set("second");
        drop(peer);
        let _peer = script.next_peer().await;

        let attempts = script.attempts();
        let token = |i: usize| {
            attempts[i]
                .target
                .query_pairs()
                .find(|(k, _)| k == "token")
                .map(|(_, v)| v.into_owned())
        };
        assert_eq!(token(0).as_deref(), Some("first"));
        assert_eq!(token(1).as_deref(), Some("second"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_spacing() {
        let config = RealtimeConfig::builder("https://api.example.com")
            .build()
            .unwrap();
        let (client, script) = client_with(config, vec![], Plan::Refuse);

        client.channel("todos").subscribe();
        sleep(Duration::from_secs(70)).await;
        assert_eq!(client.connection_state(), ConnectionState::Recovering);

        let attempts = script.attempts();
        assert!(attempts.len() >= 7, "only {} attempts", attempts.len());

        let expected = [1_000, 2_000, 4_000, 8_000, 16_000, 30_000];
        for (i, millis) in expected.iter().enumerate() {
            let gap = attempts[i + 1].at - attempts[i].at;
            let want = Duration::from_millis(*millis);
            assert!(
                gap >= want && gap < want + Duration::from_millis(10),
                "gap {} was {:?}, expected {:?}",
                i,
                gap,
                want
            );
        }

        client.disconnect();
        let count = script.attempts().len();
        sleep(Duration::from_secs(120)).await;
        assert_eq!(script.attempts().len(), count);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_successful_open() {
        let config = RealtimeConfig::builder("https://api.example.com")
            .build()
            .unwrap();
        let (client, mut script) =
            client_with(config, vec![Plan::Refuse, Plan::Refuse], Plan::Accept);

        client.channel("todos").subscribe();
        let peer = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;
        drop(peer);

        let _peer = script.next_peer().await;
        let attempts = script.attempts();
        assert_eq!(attempts.len(), 4);

        // 1s then 2s while failing, back to 1s after the open
        let gap = attempts[3].at - attempts[2].at;
        assert!(gap >= Duration::from_secs(1) && gap < Duration::from_millis(1_010));
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_while_connected() {
        let config = RealtimeConfig::builder("https://api.example.com")
            .heartbeat_interval(Duration::from_secs(30))
            .build()
            .unwrap();
        let (client, mut script) = client_with(config, vec![], Plan::Accept);

        client.channel("todos").subscribe();
        let mut peer = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;
        peer.next_frame().await;

        sleep(Duration::from_secs(29)).await;
        assert!(peer.from_client.try_recv().is_err());

        assert_eq!(peer.next_frame().await, json!({"type": "heartbeat"}));
        assert_eq!(peer.next_frame().await, json!({"type": "heartbeat"}));
        assert_eq!(client.metrics().heartbeats_sent(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_stops_on_disconnect() {
        let (client, mut script) = client_with(test_config(), vec![], Plan::Accept);

        client.connect();
        let mut peer = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;

        client.disconnect();
        sleep(Duration::from_secs(120)).await;
        assert!(peer.closed_by_client().await);
        assert_eq!(client.metrics().heartbeats_sent(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_connect_while_recovering_keeps_retry_loop() {
        let config = RealtimeConfig::builder("https://api.example.com")
            .build()
            .unwrap();
        let (client, mut script) = client_with(config, vec![], Plan::Accept);

        client.channel("todos").subscribe();
        let first = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;

        drop(first);
        wait_for_state(&client, ConnectionState::Recovering).await;

        // Skip the pending backoff delay
        client.connect();
        let second = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;

        // The superseded timer must neither reconnect nor block later retries
        sleep(Duration::from_secs(5)).await;
        assert_eq!(script.attempts().len(), 2);

        drop(second);
        let _third = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;
        assert_eq!(script.attempts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbuildable_target_enters_backoff() {
        let mut config = RealtimeConfig::builder("https://api.example.com")
            .build()
            .unwrap();
        config.url = Url::parse("ftp://files.example.com").unwrap();
        let (client, script) = client_with(config, vec![], Plan::Accept);

        let todos = client.channel("todos");
        todos.subscribe();
        assert_eq!(client.connection_state(), ConnectionState::Recovering);

        // Retries at 1s, 3s and 7s, each scheduling the next
        sleep(Duration::from_secs(10)).await;
        assert_eq!(client.connection_state(), ConnectionState::Recovering);
        assert_eq!(client.metrics().reconnects_scheduled(), 4);
        assert!(script.attempts().is_empty());
        assert!(todos.is_subscribed());
    }

    #[tokio::test]
    async fn test_dropping_client_closes_socket() {
        let (client, mut script) = client_with(test_config(), vec![], Plan::Accept);

        client.channel("todos").subscribe();
        let mut peer = script.next_peer().await;
        wait_for_state(&client, ConnectionState::Connected).await;
        peer.next_frame().await;

        drop(client);
        assert!(peer.closed_by_client().await);
    }
}
