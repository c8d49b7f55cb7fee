//! WebSocket gateway.
//!
//! Architecture:
//! ```text
//!            handshake (path, identity, version, friendlyName, channels)
//! Client ──► accept_hdr_async ──► Connection ──► Hub::attach (Setup queued)
//!                                    │
//!                     ┌──────────────┴──────────────┐
//!                     ▼                             ▼
//!               receive loop                  sender task
//!        decode → channel check → dispatch    owns the sink, drains the
//!        (4101 on violation, 1002 on          bounded outbound queue,
//!         protocol error)                     sends Close on cancel
//! ```
//!
//! Every connection owns a child of the server's cancellation token. Closing
//! for any reason cancels that token; both tasks observe it, and the receive
//! task deregisters the connection exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::hub::Hub;
use crate::protocol::{
    decode, Channel, ChannelSet, ClientRequest, Command, PingReport, ServerEvent,
    POLICY_VIOLATION_BY_CLIENT, PROTOCOL_VERSION,
};
use crate::registry::{Connection, Outbound};

/// Close code for malformed or unexpected frames.
pub const PROTOCOL_ERROR: u16 = 1002;

/// Close code sent to every connection on shutdown.
pub const GOING_AWAY: u16 = 1001;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Upgrade path
    pub path: String,
    /// Per-connection outbound queue length; a full queue closes the connection
    pub outbound_queue_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Time allowed for a single frame to be written
    pub send_timeout_secs: u64,
    /// Time connections get to close on shutdown
    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            path: "/ws".to_string(),
            outbound_queue_capacity: 256,
            heartbeat_interval_secs: 30,
            send_timeout_secs: 10,
            shutdown_grace_secs: 5,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_handshakes: u64,
    pub frames_received: u64,
    pub policy_violations: u64,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_handshakes: AtomicU64,
    frames_received: AtomicU64,
    policy_violations: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_handshakes: self.rejected_handshakes.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            policy_violations: self.policy_violations.load(Ordering::Relaxed),
        }
    }
}

/// Decides whether an upgrade request comes from an authenticated caller.
pub trait IdentityProvider: Send + Sync {
    fn authenticate(&self, request: &Request) -> bool;
}

/// Accepts every caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl IdentityProvider for AllowAll {
    fn authenticate(&self, _request: &Request) -> bool {
        true
    }
}

/// Requires `Authorization: Bearer <token>`.
#[derive(Debug, Clone)]
pub struct BearerToken {
    token: String,
}

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

impl IdentityProvider for BearerToken {
    fn authenticate(&self, request: &Request) -> bool {
        request
            .headers()
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim() == self.token)
            .unwrap_or(false)
    }
}

/// Reasons an upgrade request is refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("No endpoint at {0}")]
    NotFound(String),

    #[error("Not authenticated")]
    Unauthorized,

    #[error("Unsupported protocol version {0:?}")]
    UnsupportedVersion(Option<String>),

    #[error("Missing query parameter '{0}'")]
    MissingParameter(&'static str),

    #[error("Invalid value for '{name}': {value}")]
    InvalidParameter { name: &'static str, value: String },
}

impl HandshakeError {
    pub fn status(&self) -> StatusCode {
        match self {
            HandshakeError::NotFound(_) => StatusCode::NOT_FOUND,
            HandshakeError::Unauthorized => StatusCode::UNAUTHORIZED,
            HandshakeError::UnsupportedVersion(_) => StatusCode::NOT_ACCEPTABLE,
            HandshakeError::MissingParameter(_) | HandshakeError::InvalidParameter { .. } => {
                StatusCode::BAD_REQUEST
            }
        }
    }

    fn to_response(&self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.to_string()));
        *response.status_mut() = self.status();
        response
    }
}

/// Parameters of an accepted upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub friendly_name: String,
    /// Requested channels plus [`Channel::General`]
    pub channels: ChannelSet,
}

/// Validate an upgrade request. Checks run in order: path, identity,
/// version, then the remaining query parameters.
pub fn parse_handshake(
    request: &Request,
    path: &str,
    identity: &dyn IdentityProvider,
) -> Result<Handshake, HandshakeError> {
    let uri = request.uri();
    if uri.path() != path {
        return Err(HandshakeError::NotFound(uri.path().to_string()));
    }
    if !identity.authenticate(request) {
        return Err(HandshakeError::Unauthorized);
    }

    let mut friendly_name = None;
    let mut channels = None;
    let mut version = None;
    let query = uri.query().unwrap_or("");
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "friendlyName" => friendly_name = Some(value.into_owned()),
            "channels" => channels = Some(value.into_owned()),
            "version" => version = Some(value.into_owned()),
            _ => {}
        }
    }

    match version.as_deref().map(str::parse::<u32>) {
        Some(Ok(v)) if v == PROTOCOL_VERSION => {}
        _ => return Err(HandshakeError::UnsupportedVersion(version)),
    }

    let friendly_name = friendly_name.ok_or(HandshakeError::MissingParameter("friendlyName"))?;
    let friendly_name = friendly_name.trim().to_string();
    if friendly_name.is_empty() {
        return Err(HandshakeError::InvalidParameter {
            name: "friendlyName",
            value: friendly_name,
        });
    }

    let list = channels.ok_or(HandshakeError::MissingParameter("channels"))?;
    let channels = ChannelSet::parse_list(&list).ok_or(HandshakeError::InvalidParameter {
        name: "channels",
        value: list,
    })?;

    Ok(Handshake {
        friendly_name,
        channels: channels.with(Channel::General),
    })
}

/// A request to close a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CloseRequest {
    code: u16,
    reason: String,
}

impl CloseRequest {
    fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// State shared by the accept loop and every connection task.
struct Shared {
    config: ServerConfig,
    hub: Arc<Hub>,
    identity: Arc<dyn IdentityProvider>,
    stats: AtomicServerStats,
    started: Instant,
    /// Set by pongs; the heartbeat publishes the Clients list once per tick
    latency_dirty: AtomicBool,
}

/// The sync server.
pub struct SyncServer {
    shared: Arc<Shared>,
}

impl SyncServer {
    /// Create a new sync server that accepts every caller.
    pub fn new(config: ServerConfig, hub: Arc<Hub>) -> Self {
        Self::with_identity(config, hub, Arc::new(AllowAll))
    }

    pub fn with_identity(
        config: ServerConfig,
        hub: Arc<Hub>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                hub,
                identity,
                stats: AtomicServerStats::default(),
                started: Instant::now(),
                latency_dirty: AtomicBool::new(false),
            }),
        }
    }

    /// Bind and serve until `cancel` fires.
    pub async fn run(
        &self,
        cancel: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        log::info!("Sync server listening on {}", listener.local_addr()?);
        self.serve(listener, cancel).await
    }

    /// Serve connections from an already bound listener until `cancel` fires.
    pub async fn serve(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let mut connections = JoinSet::new();
        let heartbeat = tokio::spawn(heartbeat(self.shared.clone(), cancel.clone()));

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            log::warn!("Failed to accept connection: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");
                    connections.spawn(handle_connection(
                        stream,
                        addr,
                        self.shared.clone(),
                        cancel.child_token(),
                    ));
                }
            }
        }

        log::info!("Sync server shutting down");
        self.shared
            .hub
            .registry()
            .close_all(GOING_AWAY, "server shutting down");
        let grace = Duration::from_secs(self.shared.config.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!("Aborting {} connections after grace period", connections.len());
            connections.abort_all();
        }
        let _ = heartbeat.await;
        Ok(())
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.stats.snapshot()
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.shared.hub
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }
}

/// Handle a single WebSocket connection.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    let mut accepted = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match parse_handshake(request, &shared.config.path, shared.identity.as_ref()) {
            Ok(handshake) => {
                accepted = Some(handshake);
                Ok(response)
            }
            Err(e) => {
                log::info!("Rejected upgrade from {addr}: {e}");
                Err(e.to_response())
            }
        }
    };
    let upgraded = tokio_tungstenite::accept_hdr_async(stream, callback).await;
    let ws = match upgraded {
        Ok(ws) => ws,
        Err(e) => {
            shared.stats.rejected_handshakes.fetch_add(1, Ordering::Relaxed);
            log::debug!("WebSocket handshake with {addr} failed: {e}");
            return;
        }
    };
    let Some(handshake) = accepted else {
        return;
    };

    shared.stats.total_connections.fetch_add(1, Ordering::Relaxed);
    shared.stats.active_connections.fetch_add(1, Ordering::Relaxed);

    let (sink, stream) = ws.split();
    let (tx, rx) = mpsc::channel(shared.config.outbound_queue_capacity.max(1));
    let connection = Arc::new(Connection::new(
        handshake.friendly_name,
        addr,
        handshake.channels,
        tx,
        cancel,
    ));
    let send_timeout = Duration::from_secs(shared.config.send_timeout_secs.max(1));
    let writer = tokio::spawn(write_loop(sink, rx, connection.clone(), send_timeout));

    match shared.hub.attach(connection.clone()) {
        Ok(()) => read_loop(stream, &connection, &shared).await,
        Err(e) => {
            log::error!("Failed to build setup for {}: {e}", connection.id());
            connection.close(1011, "setup failed");
        }
    }

    shared.hub.detach(&connection.id());
    // Every other exit path has already recorded its code
    connection.close(GOING_AWAY, "server shutting down");
    if let Err(e) = writer.await {
        log::error!("Sender task for {} failed: {e}", connection.id());
    }
    shared.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
}

async fn read_loop(
    mut stream: SplitStream<WebSocketStream<TcpStream>>,
    connection: &Arc<Connection>,
    shared: &Shared,
) {
    let cancel = connection.cancel_token().clone();
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Binary(data))) => {
                shared.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                if let Err(close) = handle_frame(&data, connection, shared) {
                    connection.close(close.code, close.reason);
                    break;
                }
            }
            Some(Ok(Message::Text(_))) => {
                shared.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                connection.close(PROTOCOL_ERROR, "text frames are not supported");
                break;
            }
            Some(Ok(Message::Pong(payload))) => handle_pong(&payload, connection, shared),
            Some(Ok(Message::Close(frame))) => {
                log::debug!("Connection {} closed by peer: {frame:?}", connection.id());
                connection.close(1000, "closed by peer");
                break;
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
            Some(Err(e)) => {
                log::debug!("WebSocket error on {}: {e}", connection.id());
                connection.close(1006, "transport error");
                break;
            }
            None => {
                connection.close(1006, "connection dropped");
                break;
            }
        }
    }
}

/// Decode, authorize and dispatch one inbound frame.
fn handle_frame(
    data: &[u8],
    connection: &Connection,
    shared: &Shared,
) -> Result<(), CloseRequest> {
    let frame = decode(data).map_err(|e| CloseRequest::new(PROTOCOL_ERROR, e.to_string()))?;
    let command = Command::from_code(frame.command).ok_or_else(|| {
        CloseRequest::new(PROTOCOL_ERROR, format!("unknown command {}", frame.command))
    })?;
    if !command.is_client_command() {
        return Err(CloseRequest::new(
            PROTOCOL_ERROR,
            format!("{command:?} is not a client command"),
        ));
    }
    let channel = command.channel();
    if !connection.subscribes(channel) {
        shared.stats.policy_violations.fetch_add(1, Ordering::Relaxed);
        log::warn!(
            "Connection {} ({}) sent {command:?} on unsubscribed channel {channel:?}",
            connection.id(),
            connection.friendly_name()
        );
        return Err(CloseRequest::new(
            POLICY_VIOLATION_BY_CLIENT,
            format!("not subscribed to {channel:?}"),
        ));
    }

    let request = ClientRequest::from_frame(command, frame)
        .map_err(|e| CloseRequest::new(PROTOCOL_ERROR, e.to_string()))?;
    if let Err(e) = shared.hub.dispatch(request) {
        log::info!("{command:?} from {} failed: {e}", connection.id());
        match ServerEvent::error(e.to_string()).encode() {
            Ok(frame) => {
                connection.enqueue(Bytes::from(frame));
            }
            Err(e) => log::error!("Failed to encode error reply: {e}"),
        }
    }
    Ok(())
}

fn handle_pong(payload: &[u8], connection: &Connection, shared: &Shared) {
    let Ok(sent) = <[u8; 8]>::try_from(payload) else {
        return;
    };
    let sent = Duration::from_micros(u64::from_be_bytes(sent));
    let Some(rtt) = shared.started.elapsed().checked_sub(sent) else {
        return;
    };
    connection.record_latency(rtt);
    let reply = ServerEvent::Ping(PingReport {
        latency_ms: rtt.as_millis() as u64,
    });
    match reply.encode() {
        Ok(frame) => {
            connection.enqueue(Bytes::from(frame));
        }
        Err(e) => log::error!("Failed to encode ping: {e}"),
    }
    shared.latency_dirty.store(true, Ordering::Release);
}

/// Publish the Clients list if any latency changed since the last call.
fn publish_latencies(shared: &Shared) -> bool {
    if !shared.latency_dirty.swap(false, Ordering::AcqRel) {
        return false;
    }
    shared.hub.broadcast_clients();
    true
}

/// Sole owner of the sink. Drains the outbound queue until the connection is
/// cancelled, then sends the recorded close code.
async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbound: mpsc::Receiver<Outbound>,
    connection: Arc<Connection>,
    send_timeout: Duration,
) {
    let cancel = connection.cancel_token().clone();
    let healthy = loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break true,
            item = outbound.recv() => item,
        };
        let message = match item {
            Some(Outbound::Frame(bytes)) => Message::Binary(bytes),
            Some(Outbound::Ping(payload)) => Message::Ping(payload),
            None => break true,
        };
        match tokio::time::timeout(send_timeout, sink.send(message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::debug!("Send to {} failed: {e}", connection.id());
                connection.close(1006, "send failed");
                break false;
            }
            Err(_) => {
                log::warn!("Send to {} timed out", connection.id());
                connection.close(1006, "send timed out");
                break false;
            }
        }
    };

    if healthy {
        let (code, reason) = connection
            .close_reason()
            .unwrap_or_else(|| (GOING_AWAY, "server shutting down".to_string()));
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        };
        let _ = tokio::time::timeout(send_timeout, sink.send(Message::Close(Some(frame)))).await;
    }
    let _ = sink.close().await;
}

/// Periodically ping every connection with the send time as payload.
async fn heartbeat(shared: Arc<Shared>, cancel: CancellationToken) {
    let period = Duration::from_secs(shared.config.heartbeat_interval_secs.max(1));
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                publish_latencies(&shared);
                let stamp = shared.started.elapsed().as_micros() as u64;
                let payload = Bytes::copy_from_slice(&stamp.to_be_bytes());
                for connection in shared.hub.registry().snapshot() {
                    connection.enqueue_ping(payload.clone());
                }
            }
        }
    }
}
