//! WebSocket sync client for connecting to the sync server.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect after a fixed delay, shutdown)
//! - Typed requests out, typed events in
//! - Exactly one `Closed` notification per successfully opened connection
//!
//! The link state is a pure machine ([`LinkMachine`]) so the notification
//! rules can be checked without a socket.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::protocol::{
    ChannelSet, ClientRequest, ProtocolError, ServerEvent, SetupSnapshot, CLOSED_BY_CLIENT,
    POLICY_VIOLATION_BY_CLIENT, PROTOCOL_VERSION,
};

/// Close code reported when the transport dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid authorization token")]
    InvalidToken,

    #[error("Client is shut down")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Upgrade endpoint, e.g. `ws://127.0.0.1:9090/ws`
    pub url: String,
    pub friendly_name: String,
    pub channels: ChannelSet,
    /// Sent as `Authorization: Bearer <token>` when present
    pub token: Option<String>,
    /// Wait before each reconnection attempt
    pub reconnect_delay_ms: u64,
    /// Capacity of the request and event queues
    pub queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090/ws".to_string(),
            friendly_name: "skiff client".to_string(),
            channels: ChannelSet::all(),
            token: None,
            reconnect_delay_ms: 3000,
            queue_capacity: 256,
        }
    }
}

/// Link state as seen by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Transport created but nothing received yet
    NeverOpened,
    /// At least one message received
    Open,
    /// Closed after having been open; the application was notified
    ClosedAfterOpen,
}

/// Pure link state machine.
///
/// A close is only reported if the link had been opened, and only once.
#[derive(Debug)]
pub struct LinkMachine {
    state: LinkState,
}

impl LinkMachine {
    pub fn new() -> Self {
        Self {
            state: LinkState::NeverOpened,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Record an inbound message. Returns true for the first one.
    pub fn on_message(&mut self) -> bool {
        if self.state == LinkState::NeverOpened {
            self.state = LinkState::Open;
            return true;
        }
        false
    }

    /// Record a close. Returns true when the application must be notified.
    pub fn on_close(&mut self) -> bool {
        match self.state {
            LinkState::Open => {
                self.state = LinkState::ClosedAfterOpen;
                true
            }
            LinkState::NeverOpened | LinkState::ClosedAfterOpen => false,
        }
    }

    /// A new transport is about to be created.
    pub fn on_reconnect(&mut self) {
        self.state = LinkState::NeverOpened;
    }
}

impl Default for LinkMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable text for a close code.
pub fn close_text(code: u16) -> &'static str {
    match code {
        1000 => "Connection closed",
        1001 => "Server is shutting down",
        1002 => "Protocol error",
        1006 => "Connection lost",
        1008 => "Policy violation",
        1011 => "Internal server error",
        1013 => "Server overloaded, try again later",
        CLOSED_BY_CLIENT => "Closed by client",
        POLICY_VIOLATION_BY_CLIENT => "Not subscribed to the requested channel",
        _ => "Connection closed unexpectedly",
    }
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// First message of a connection: the full state snapshot
    Opened(Box<SetupSnapshot>),
    /// Any later server event
    Event(ServerEvent),
    /// An opened connection closed
    Closed { code: u16, text: &'static str },
    /// A reconnection attempt is scheduled
    Reconnecting { delay: Duration },
}

/// How one connection attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ended {
    code: u16,
    by_user: bool,
}

/// The sync client.
///
/// Requests made while disconnected are dropped when the next connection
/// opens; a reconnecting client resynchronizes from the Setup snapshot.
pub struct SyncClient {
    config: ClientConfig,
    machine: parking_lot::Mutex<LinkMachine>,
    outgoing_tx: mpsc::Sender<ClientRequest>,
    outgoing_rx: Mutex<mpsc::Receiver<ClientRequest>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: parking_lot::Mutex<Option<mpsc::Receiver<ClientEvent>>>,
}

impl SyncClient {
    pub fn new(config: ClientConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        Self {
            config,
            machine: parking_lot::Mutex::new(LinkMachine::new()),
            outgoing_tx,
            outgoing_rx: Mutex::new(outgoing_rx),
            event_tx,
            event_rx: parking_lot::Mutex::new(Some(event_rx)),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.lock().take()
    }

    pub fn state(&self) -> LinkState {
        self.machine.lock().state()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Queue a request for the current connection.
    pub async fn send(&self, request: ClientRequest) -> Result<(), ClientError> {
        self.outgoing_tx
            .send(request)
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Upgrade request with query parameters and credentials.
    pub fn request(&self) -> Result<Request, ClientError> {
        let mut url =
            Url::parse(&self.config.url).map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("friendlyName", &self.config.friendly_name)
            .append_pair("channels", &self.config.channels.to_list())
            .append_pair("version", &PROTOCOL_VERSION.to_string());
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?;
        if let Some(token) = &self.config.token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| ClientError::InvalidToken)?;
            request.headers_mut().insert("Authorization", value);
        }
        Ok(request)
    }

    /// Connect, and reconnect after every close, until `cancel` fires.
    /// Cancelling closes the current connection with [`CLOSED_BY_CLIENT`].
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), ClientError> {
        let mut outgoing = self.outgoing_rx.lock().await;
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);

        loop {
            self.machine.lock().on_reconnect();
            let ended = self.connect_once(&mut outgoing, &cancel).await?;

            let notify = self.machine.lock().on_close();
            if notify {
                let closed = ClientEvent::Closed {
                    code: ended.code,
                    text: close_text(ended.code),
                };
                if !self.emit(closed, &cancel).await {
                    break;
                }
            } else {
                log::debug!("Connection closed before opening (code {})", ended.code);
            }

            if ended.by_user || cancel.is_cancelled() {
                break;
            }
            if !self.emit(ClientEvent::Reconnecting { delay }, &cancel).await {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(())
    }

    async fn connect_once(
        &self,
        outgoing: &mut mpsc::Receiver<ClientRequest>,
        cancel: &CancellationToken,
    ) -> Result<Ended, ClientError> {
        let request = self.request()?;
        let connected = tokio::select! {
            _ = cancel.cancelled() => {
                return Ok(Ended { code: CLOSED_BY_CLIENT, by_user: true });
            }
            connected = tokio_tungstenite::connect_async(request) => connected,
        };
        let ws = match connected {
            Ok((ws, _response)) => ws,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.config.url);
                return Ok(Ended {
                    code: ABNORMAL_CLOSURE,
                    by_user: false,
                });
            }
        };
        log::info!("Connected to {}", self.config.url);

        let mut dropped = 0;
        while outgoing.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::debug!("Dropped {dropped} requests queued while disconnected");
        }

        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(close_by_user(&mut sink).await),
                request = outgoing.recv() => {
                    let Some(request) = request else {
                        return Ok(Ended { code: CLOSED_BY_CLIENT, by_user: true });
                    };
                    let frame = request.encode()?;
                    if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                        log::debug!("Send failed: {e}");
                        return Ok(Ended { code: ABNORMAL_CLOSURE, by_user: false });
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Binary(data))) => {
                        if !self.handle_frame(&data, cancel).await {
                            return Ok(close_by_user(&mut sink).await);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code)).unwrap_or(1000);
                        return Ok(Ended { code, by_user: false });
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("Connection error: {e}");
                        return Ok(Ended { code: ABNORMAL_CLOSURE, by_user: false });
                    }
                    None => return Ok(Ended { code: ABNORMAL_CLOSURE, by_user: false }),
                },
            }
        }
    }

    /// Returns false when `cancel` fired before the event was delivered.
    async fn handle_frame(&self, data: &[u8], cancel: &CancellationToken) -> bool {
        // Any inbound message opens the link, even one we cannot decode
        let first = self.machine.lock().on_message();
        let event = match ServerEvent::decode(data) {
            Ok(event) => event,
            Err(e) => {
                log::warn!("Ignoring malformed frame from server: {e}");
                return true;
            }
        };
        let event = match event {
            ServerEvent::Setup(snapshot) => ClientEvent::Opened(snapshot),
            other => {
                if first {
                    log::warn!("First frame was {:?}, expected Setup", other.command());
                }
                ClientEvent::Event(other)
            }
        };
        self.emit(event, cancel).await
    }

    /// Deliver an event to the application. Returns false when `cancel`
    /// fired while the event queue was full.
    async fn emit(&self, event: ClientEvent, cancel: &CancellationToken) -> bool {
        let event = match self.event_tx.try_send(event) {
            // A dropped receiver means nobody is listening anymore
            Ok(()) | Err(TrySendError::Closed(_)) => return true,
            Err(TrySendError::Full(event)) => event,
        };
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = self.event_tx.send(event) => true,
        }
    }
}

/// Send the client's close frame and shut the sink.
async fn close_by_user<S>(sink: &mut S) -> Ended
where
    S: futures_util::Sink<Message> + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::from(CLOSED_BY_CLIENT),
        reason: "closed by client".into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    let _ = sink.close().await;
    Ended {
        code: CLOSED_BY_CLIENT,
        by_user: true,
    }
}
