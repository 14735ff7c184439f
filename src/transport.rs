use crate::config::TransportConfig;
use crate::error::Error;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};
use url::Url;

/// Default channel buffer size for inbound frames
const DEFAULT_CHANNEL_SIZE: usize = 100;

/// An inbound frame, or the error that ended the connection
pub type InboundFrame = Result<String, Error>;

/// Opens physical connections for the client.
///
/// The client calls `connect` at most once at a time and owns the returned
/// [`Socket`] exclusively. Implement this to run the client over something
/// other than the built-in WebSocket transport.
///
/// Frames accepted by `Socket` are handed off; a frame the transport fails
/// to write, and any still buffered behind it, is lost with the connection.
/// The client recovers subscriptions through resubscribe-on-open, not by
/// replaying those frames.
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `target`. Timeouts, if any, are the
    /// transport's concern.
    fn connect(&self, target: Url) -> impl Future<Output = Result<Socket, Error>> + Send;
}

/// Client side of an open connection.
///
/// Frames pushed into `outbound` are written in order. The connection is
/// considered closed when `inbound` ends; dropping the socket closes it.
#[derive(Debug)]
pub struct Socket {
    outbound: mpsc::UnboundedSender<String>,
    inbound: mpsc::Receiver<InboundFrame>,
}

/// Network side of a [`Socket`], driven by a transport implementation.
#[derive(Debug)]
pub struct Peer {
    /// Frames written by the client, in order. Ends when the client closes.
    pub from_client: mpsc::UnboundedReceiver<String>,
    /// Frames for the client. Send an `Err` or drop to signal closure.
    pub to_client: mpsc::Sender<InboundFrame>,
}

impl Socket {
    /// Create a connected socket/peer pair
    pub fn pair() -> (Socket, Peer) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(DEFAULT_CHANNEL_SIZE);
        (
            Socket {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            Peer {
                from_client: outbound_rx,
                to_client: inbound_tx,
            },
        )
    }

    pub(crate) fn into_parts(
        self,
    ) -> (mpsc::UnboundedSender<String>, mpsc::Receiver<InboundFrame>) {
        (self.outbound, self.inbound)
    }
}

/// Hide credential values in a connection target for logging.
pub(crate) fn redact_target(target: &Url) -> String {
    let mut redacted = target.clone();
    if target.query().is_some() {
        let keys: Vec<String> = target.query_pairs().map(|(k, _)| k.into_owned()).collect();
        redacted.set_query(None);
        let mut pairs = redacted.query_pairs_mut();
        for key in keys {
            pairs.append_pair(&key, "***");
        }
    }
    redacted.to_string()
}

/// WebSocket transport built on tokio-tungstenite
#[derive(Debug, Clone, Default)]
pub struct TungsteniteTransport {
    config: TransportConfig,
}

impl TungsteniteTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

impl Transport for TungsteniteTransport {
    async fn connect(&self, target: Url) -> Result<Socket, Error> {
        let ws_stream = match timeout(
            self.config.connect_timeout,
            connect_with_options(&target, &self.config),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                return Err(Error::ConnectionFailed(format!(
                    "Connection timeout after {:?}",
                    self.config.connect_timeout
                )))
            }
        };

        let (socket, peer) = Socket::pair();
        tokio::spawn(pump(ws_stream, peer));
        Ok(socket)
    }
}

/// Type alias for WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Move frames between the WebSocket and the client until either side closes
async fn pump(ws_stream: WsStream, mut peer: Peer) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => {
                        // Non-UTF-8 payloads fall through to a decode failure upstream
                        String::from_utf8_lossy(&data).into_owned()
                    }
                    Some(Ok(Message::Ping(data))) => {
                        trace!("Received ping, sending pong");
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            let _ = peer.to_client.send(Err(Error::WebSocket(e))).await;
                            return;
                        }
                        continue;
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => continue,
                    Some(Ok(Message::Close(frame))) => {
                        info!("Received close frame: {:?}", frame);
                        // Flush the close reply tungstenite queued on read
                        let _ = write.close().await;
                        return;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        let _ = peer.to_client.send(Err(Error::WebSocket(e))).await;
                        return;
                    }
                    None => {
                        info!("WebSocket stream ended");
                        return;
                    }
                };

                if peer.to_client.send(Ok(text)).await.is_err() {
                    debug!("Client released the socket, closing");
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
            }

            frame = peer.from_client.recv() => {
                match frame {
                    Some(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!("Failed to send frame: {}", e);
                            let _ = peer.to_client.send(Err(Error::WebSocket(e))).await;
                            return;
                        }
                    }
                    None => {
                        debug!("Client closed the socket");
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Connect to a WebSocket target with the configured headers.
async fn connect_with_options(target: &Url, config: &TransportConfig) -> Result<WsStream, Error> {
    let host = target
        .host_str()
        .ok_or_else(|| Error::ConnectionFailed("No host in URL".to_string()))?;

    let is_tls = match target.scheme() {
        "wss" => true,
        "ws" => false,
        other => return Err(Error::UnsupportedScheme(other.to_string())),
    };
    let port = target.port().unwrap_or(if is_tls { 443 } else { 80 });

    // Build the WebSocket request
    let mut request = target.as_str().into_client_request()?;

    for (name, value) in &config.headers {
        request.headers_mut().insert(name.clone(), value.clone());
    }

    let tcp_stream = connect_direct(host, port).await?;

    set_tcp_options(&tcp_stream, config.tcp_nodelay);

    // TLS connector (if needed)
    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new()
            .map_err(|e| Error::ConnectionFailed(format!("TLS error: {}", e)))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    // WebSocket handshake
    let (ws_stream, _response) =
        client_async_tls_with_config(request, tcp_stream, None, connector).await?;

    Ok(ws_stream)
}

/// Resolve and open a TCP connection
async fn connect_direct(host: &str, port: u16) -> Result<tokio::net::TcpStream, Error> {
    // IPv6 literals come bracketed from the URL
    let dest_str = format!("{}:{}", host, port);
    let dest_addr: SocketAddr = tokio::net::lookup_host(&dest_str)
        .await
        .map_err(|e| Error::ConnectionFailed(format!("DNS lookup failed: {}", e)))?
        .next()
        .ok_or_else(|| Error::ConnectionFailed(format!("No addresses found for {}", host)))?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::ConnectionFailed(format!("Failed to create socket: {}", e)))?;

    socket.connect(dest_addr).await.map_err(|e| {
        Error::ConnectionFailed(format!("TCP connect to {} failed: {}", dest_addr, e))
    })
}

/// Set TCP options for a long-lived, low-traffic connection
fn set_tcp_options(stream: &tokio::net::TcpStream, nodelay: bool) {
    let sock2 = socket2::SockRef::from(stream);

    if nodelay {
        let _ = sock2.set_nodelay(true);
    }

    // OS-level keepalive catches half-open sockets the heartbeat cannot
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}
