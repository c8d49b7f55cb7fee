//! Binary frame codec and the typed command set.
//!
//! Wire format:
//! ```text
//! ┌─────────┬───────────┬──────────────────────────────┐
//! │ command │ parameter │ payload (UTF-8 JSON, optional)│
//! │ 1 byte  │ 1 byte    │ frame length - 2 bytes        │
//! └─────────┴───────────┴──────────────────────────────┘
//! ```
//!
//! There is no length prefix: the transport delimits frames, so a frame of
//! exactly two bytes carries no payload at all (which is distinct from a
//! payload of `null` or `{}`).
//!
//! Above the raw [`Frame`] sit two closed enums, [`ServerEvent`] and
//! [`ClientRequest`]. Every variant has its own payload type and is turned
//! into JSON only when it crosses the wire.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::buffers::{LogRecord, LogSnapshot};

/// Parameter value for commands that do not address a single item.
pub const NO_PARAMETER: u8 = 255;

/// The only protocol version this server speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Application close code: the client closed on purpose.
pub const CLOSED_BY_CLIENT: u16 = 4100;

/// Application close code: the client used a channel it did not subscribe to.
pub const POLICY_VIOLATION_BY_CLIENT: u16 = 4101;

/// Size of the `[command, parameter]` header.
pub const HEADER_LEN: usize = 2;

/// Broadcast topics a connection subscribes to at handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Channel {
    /// Setup, Error and Ping; granted to every connection
    General = 0,
    Downloads = 1,
    Disk = 2,
    Bandwidth = 3,
    Links = 4,
    Clients = 5,
    Log = 6,
}

impl Channel {
    pub const ALL: [Channel; 7] = [
        Channel::General,
        Channel::Downloads,
        Channel::Disk,
        Channel::Bandwidth,
        Channel::Links,
        Channel::Clients,
        Channel::Log,
    ];

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.get(id as usize).copied()
    }

    pub fn id(self) -> u8 {
        self as u8
    }
}

/// Immutable set of channels, stored as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct ChannelSet(u8);

impl ChannelSet {
    pub fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Channel::ALL.into_iter().collect()
    }

    pub fn with(self, channel: Channel) -> Self {
        Self(self.0 | (1 << channel.id()))
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.0 & (1 << channel.id()) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Channel> {
        let set = *self;
        Channel::ALL.into_iter().filter(move |c| set.contains(*c))
    }

    /// Parse a comma-separated list of channel ids such as `"1,2,5"`.
    ///
    /// Returns `None` for an empty list, an unknown id, or a non-numeric
    /// entry.
    pub fn parse_list(list: &str) -> Option<Self> {
        let mut set = Self::empty();
        for part in list.split(',') {
            let id: u8 = part.trim().parse().ok()?;
            set = set.with(Channel::from_id(id)?);
        }
        if set.is_empty() {
            None
        } else {
            Some(set)
        }
    }

    /// Comma-separated ids, the inverse of [`ChannelSet::parse_list`].
    pub fn to_list(&self) -> String {
        self.iter()
            .map(|c| c.id().to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl FromIterator<Channel> for ChannelSet {
    fn from_iter<I: IntoIterator<Item = Channel>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), |set, c| set.with(c))
    }
}

/// Command codes. Codes below 32 flow server → client, the rest client → server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Command {
    Error = 0,
    DownloadAdded = 1,
    DownloadRemoved = 2,
    DownloadChanged = 3,
    Setup = 4,
    Disk = 5,
    Bandwidth = 6,
    Links = 7,
    Ping = 8,
    Clients = 9,
    Log = 10,

    Start = 32,
    Stop = 33,
    Delete = 34,
    StartAll = 35,
    StopAll = 36,
    Upload = 37,
    ClearLog = 38,
}

impl Command {
    pub fn from_code(code: u8) -> Option<Self> {
        let command = match code {
            0 => Command::Error,
            1 => Command::DownloadAdded,
            2 => Command::DownloadRemoved,
            3 => Command::DownloadChanged,
            4 => Command::Setup,
            5 => Command::Disk,
            6 => Command::Bandwidth,
            7 => Command::Links,
            8 => Command::Ping,
            9 => Command::Clients,
            10 => Command::Log,
            32 => Command::Start,
            33 => Command::Stop,
            34 => Command::Delete,
            35 => Command::StartAll,
            36 => Command::StopAll,
            37 => Command::Upload,
            38 => Command::ClearLog,
            _ => return None,
        };
        Some(command)
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    /// The channel this command travels on.
    pub fn channel(self) -> Channel {
        match self {
            Command::Error | Command::Setup | Command::Ping => Channel::General,
            Command::DownloadAdded
            | Command::DownloadRemoved
            | Command::DownloadChanged
            | Command::Start
            | Command::Stop
            | Command::Delete
            | Command::StartAll
            | Command::StopAll
            | Command::Upload => Channel::Downloads,
            Command::Disk => Channel::Disk,
            Command::Bandwidth => Channel::Bandwidth,
            Command::Links => Channel::Links,
            Command::Clients => Channel::Clients,
            Command::Log | Command::ClearLog => Channel::Log,
        }
    }

    /// Whether a client may send this command.
    pub fn is_client_command(self) -> bool {
        self.code() >= 32
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Unknown command code {0}")]
    UnknownCommand(u8),

    #[error("Command {0:?} is not accepted in this direction")]
    UnexpectedCommand(Command),

    #[error("Command {0:?} requires a payload")]
    MissingPayload(Command),

    #[error("Invalid payload for {command:?}: {reason}")]
    InvalidPayload { command: Command, reason: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// One decoded frame: header plus optional JSON payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: u8,
    pub parameter: u8,
    pub payload: Option<Value>,
}

impl Frame {
    pub fn new(command: u8, parameter: u8, payload: Option<Value>) -> Self {
        Self {
            command,
            parameter,
            payload,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        encode(self.command, self.parameter, self.payload.as_ref())
    }

    /// Parse wire bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        decode(bytes)
    }
}

/// Encode `[command, parameter]` followed by the JSON text of `payload`.
pub fn encode(command: u8, parameter: u8, payload: Option<&Value>) -> Vec<u8> {
    let mut out = vec![command, parameter];
    if let Some(value) = payload {
        out.extend_from_slice(value.to_string().as_bytes());
    }
    out
}

/// Decode a frame produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    if bytes.len() < HEADER_LEN {
        return Err(ProtocolError::FrameTooShort(bytes.len()));
    }
    let payload = if bytes.len() > HEADER_LEN {
        let text = std::str::from_utf8(&bytes[HEADER_LEN..])?;
        let value = serde_json::from_str(text)
            .map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        Some(value)
    } else {
        None
    };
    Ok(Frame::new(bytes[0], bytes[1], payload))
}

// ───────────────────────────────────────────────────────────────────
// Payload schemas
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Queued,
    Running,
    Stopped,
    Finished,
    Failed,
}

/// Scheduler view of one batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub name: String,
    pub state: DownloadState,
    pub links: u32,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Unknown,
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkInfo {
    pub url: String,
    pub hoster: String,
    pub status: LinkStatus,
}

/// One entry of the Clients list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub id: Uuid,
    pub friendly_name: String,
    pub address: String,
    pub connected_since_ms: u64,
    pub latency_ms: Option<u64>,
}

/// Disk usage update. Offline reports carry no figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskReport {
    pub online: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_bytes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_bytes: Option<u64>,
}

impl DiskReport {
    pub fn online(percent: u64, free_bytes: u64, total_bytes: u64) -> Self {
        Self {
            online: true,
            percent: Some(percent),
            free_bytes: Some(free_bytes),
            total_bytes: Some(total_bytes),
        }
    }

    pub fn offline() -> Self {
        Self {
            online: false,
            percent: None,
            free_bytes: None,
            total_bytes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandwidthReport {
    pub bytes_per_sec: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingReport {
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSnapshot {
    pub online: bool,
    pub history: Vec<u64>,
}

/// Full state sent once, right after the handshake.
///
/// Only the sections for subscribed channels are present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetupSnapshot {
    pub connection_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downloads: Option<Vec<DownloadInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk: Option<DiskSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth: Option<Vec<u64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links: Option<Vec<LinkInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<Vec<ClientInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogSnapshot>,
}

impl SetupSnapshot {
    pub fn empty(connection_id: Uuid) -> Self {
        Self {
            connection_id,
            downloads: None,
            disk: None,
            bandwidth: None,
            links: None,
            clients: None,
            log: None,
        }
    }
}

/// A batch of links submitted by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub name: String,
    pub links: Vec<String>,
    #[serde(default)]
    pub autostart: bool,
}

// ───────────────────────────────────────────────────────────────────
// Typed messages
// ───────────────────────────────────────────────────────────────────

/// Everything the server sends.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Error(ErrorReport),
    DownloadAdded { index: u8, info: DownloadInfo },
    DownloadRemoved { index: u8 },
    DownloadChanged { index: u8, info: DownloadInfo },
    Setup(Box<SetupSnapshot>),
    Disk(DiskReport),
    Bandwidth(BandwidthReport),
    Links(Vec<LinkInfo>),
    Ping(PingReport),
    Clients(Vec<ClientInfo>),
    Log(LogRecord),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error(ErrorReport {
            message: message.into(),
        })
    }

    pub fn command(&self) -> Command {
        match self {
            ServerEvent::Error(_) => Command::Error,
            ServerEvent::DownloadAdded { .. } => Command::DownloadAdded,
            ServerEvent::DownloadRemoved { .. } => Command::DownloadRemoved,
            ServerEvent::DownloadChanged { .. } => Command::DownloadChanged,
            ServerEvent::Setup(_) => Command::Setup,
            ServerEvent::Disk(_) => Command::Disk,
            ServerEvent::Bandwidth(_) => Command::Bandwidth,
            ServerEvent::Links(_) => Command::Links,
            ServerEvent::Ping(_) => Command::Ping,
            ServerEvent::Clients(_) => Command::Clients,
            ServerEvent::Log(_) => Command::Log,
        }
    }

    pub fn channel(&self) -> Channel {
        self.command().channel()
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let (parameter, payload) = match self {
            ServerEvent::Error(report) => (NO_PARAMETER, Some(to_value(report)?)),
            ServerEvent::DownloadAdded { index, info }
            | ServerEvent::DownloadChanged { index, info } => (*index, Some(to_value(info)?)),
            ServerEvent::DownloadRemoved { index } => (*index, None),
            ServerEvent::Setup(snapshot) => (NO_PARAMETER, Some(to_value(snapshot)?)),
            ServerEvent::Disk(report) => (NO_PARAMETER, Some(to_value(report)?)),
            ServerEvent::Bandwidth(report) => (NO_PARAMETER, Some(to_value(report)?)),
            ServerEvent::Links(links) => (NO_PARAMETER, Some(to_value(links)?)),
            ServerEvent::Ping(report) => (NO_PARAMETER, Some(to_value(report)?)),
            ServerEvent::Clients(clients) => (NO_PARAMETER, Some(to_value(clients)?)),
            ServerEvent::Log(record) => (NO_PARAMETER, Some(to_value(record)?)),
        };
        Ok(Frame::new(self.command().code(), parameter, payload))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.to_frame()?.encode())
    }

    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        let command = Command::from_code(frame.command)
            .ok_or(ProtocolError::UnknownCommand(frame.command))?;
        if command.is_client_command() {
            return Err(ProtocolError::UnexpectedCommand(command));
        }
        let index = frame.parameter;
        let payload = frame.payload;
        let event = match command {
            Command::Error => ServerEvent::Error(from_payload(command, payload)?),
            Command::DownloadAdded => ServerEvent::DownloadAdded {
                index,
                info: from_payload(command, payload)?,
            },
            Command::DownloadRemoved => ServerEvent::DownloadRemoved { index },
            Command::DownloadChanged => ServerEvent::DownloadChanged {
                index,
                info: from_payload(command, payload)?,
            },
            Command::Setup => ServerEvent::Setup(Box::new(from_payload(command, payload)?)),
            Command::Disk => ServerEvent::Disk(from_payload(command, payload)?),
            Command::Bandwidth => ServerEvent::Bandwidth(from_payload(command, payload)?),
            Command::Links => ServerEvent::Links(from_payload(command, payload)?),
            Command::Ping => ServerEvent::Ping(from_payload(command, payload)?),
            Command::Clients => ServerEvent::Clients(from_payload(command, payload)?),
            Command::Log => ServerEvent::Log(from_payload(command, payload)?),
            _ => return Err(ProtocolError::UnexpectedCommand(command)),
        };
        Ok(event)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_frame(decode(bytes)?)
    }
}

/// Everything a client may send.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    Start { index: u8 },
    Stop { index: u8 },
    Delete { index: u8 },
    StartAll,
    StopAll,
    Upload(UploadRequest),
    ClearLog,
}

impl ClientRequest {
    pub fn command(&self) -> Command {
        match self {
            ClientRequest::Start { .. } => Command::Start,
            ClientRequest::Stop { .. } => Command::Stop,
            ClientRequest::Delete { .. } => Command::Delete,
            ClientRequest::StartAll => Command::StartAll,
            ClientRequest::StopAll => Command::StopAll,
            ClientRequest::Upload(_) => Command::Upload,
            ClientRequest::ClearLog => Command::ClearLog,
        }
    }

    pub fn channel(&self) -> Channel {
        self.command().channel()
    }

    pub fn to_frame(&self) -> Result<Frame, ProtocolError> {
        let (parameter, payload) = match self {
            ClientRequest::Start { index }
            | ClientRequest::Stop { index }
            | ClientRequest::Delete { index } => (*index, None),
            ClientRequest::StartAll | ClientRequest::StopAll | ClientRequest::ClearLog => {
                (NO_PARAMETER, None)
            }
            ClientRequest::Upload(upload) => (NO_PARAMETER, Some(to_value(upload)?)),
        };
        Ok(Frame::new(self.command().code(), parameter, payload))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(self.to_frame()?.encode())
    }

    /// Build a request from a frame whose command is already resolved.
    pub fn from_frame(command: Command, frame: Frame) -> Result<Self, ProtocolError> {
        let index = frame.parameter;
        let request = match command {
            Command::Start => ClientRequest::Start { index },
            Command::Stop => ClientRequest::Stop { index },
            Command::Delete => ClientRequest::Delete { index },
            Command::StartAll => ClientRequest::StartAll,
            Command::StopAll => ClientRequest::StopAll,
            Command::Upload => ClientRequest::Upload(from_payload(command, frame.payload)?),
            Command::ClearLog => ClientRequest::ClearLog,
            other => return Err(ProtocolError::UnexpectedCommand(other)),
        };
        Ok(request)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let frame = decode(bytes)?;
        let command = Command::from_code(frame.command)
            .ok_or(ProtocolError::UnknownCommand(frame.command))?;
        Self::from_frame(command, frame)
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ProtocolError> {
    serde_json::to_value(value).map_err(|e| ProtocolError::SerializationError(e.to_string()))
}

fn from_payload<T: DeserializeOwned>(
    command: Command,
    payload: Option<Value>,
) -> Result<T, ProtocolError> {
    let value = payload.ok_or(ProtocolError::MissingPayload(command))?;
    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
        command,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::Severity;
    use serde_json::json;

    fn sample_download() -> DownloadInfo {
        DownloadInfo {
            name: "season-1".to_string(),
            state: DownloadState::Running,
            links: 12,
            bytes_done: 1024,
            bytes_total: 4096,
        }
    }

    #[test]
    fn test_encode_without_payload_is_header_only() {
        let bytes = encode(Command::StartAll.code(), NO_PARAMETER, None);
        assert_eq!(bytes, vec![35, 255]);
    }

    #[test]
    fn test_encode_empty_object_length() {
        let value = json!({});
        let bytes = encode(1, 2, Some(&value));
        assert_eq!(bytes.len(), 2 + "{}".len());
        assert_eq!(&bytes[2..], b"{}");
    }

    #[test]
    fn test_frame_roundtrip() {
        let cases = vec![
            Frame::new(0, NO_PARAMETER, Some(json!({"message": "boom"}))),
            Frame::new(3, 7, Some(json!({"nested": [1, 2, {"a": null}]}))),
            Frame::new(37, 0, None),
            Frame::new(9, 1, Some(json!("text with ünïcode"))),
            Frame::new(4, 4, Some(Value::Null)),
        ];
        for frame in cases {
            let decoded = Frame::decode(&frame.encode()).unwrap();
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn test_decode_absent_vs_null_payload() {
        assert_eq!(decode(&[8, 1]).unwrap().payload, None);
        assert_eq!(decode(b"\x08\x01null").unwrap().payload, Some(Value::Null));
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(decode(&[]), Err(ProtocolError::FrameTooShort(0)));
        assert_eq!(decode(&[4]), Err(ProtocolError::FrameTooShort(1)));
    }

    #[test]
    fn test_decode_invalid_utf8() {
        let err = decode(&[4, 255, 0xFF, 0xFE]).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidUtf8(_)));
    }

    #[test]
    fn test_decode_invalid_json() {
        let err = decode(b"\x04\xff{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson(_)));
    }

    #[test]
    fn test_command_codes_roundtrip() {
        for code in 0..=u8::MAX {
            if let Some(command) = Command::from_code(code) {
                assert_eq!(command.code(), code);
            }
        }
        assert_eq!(Command::from_code(11), None);
        assert_eq!(Command::from_code(NO_PARAMETER), None);
    }

    #[test]
    fn test_command_directions() {
        assert!(!Command::Setup.is_client_command());
        assert!(!Command::Log.is_client_command());
        assert!(Command::Start.is_client_command());
        assert!(Command::ClearLog.is_client_command());
    }

    #[test]
    fn test_command_channels() {
        assert_eq!(Command::Disk.channel(), Channel::Disk);
        assert_eq!(Command::Upload.channel(), Channel::Downloads);
        assert_eq!(Command::Setup.channel(), Channel::General);
        assert_eq!(Command::ClearLog.channel(), Channel::Log);
        assert_eq!(Command::Clients.channel(), Channel::Clients);
    }

    #[test]
    fn test_channel_set_parse() {
        let set = ChannelSet::parse_list("1, 2,5").unwrap();
        assert!(set.contains(Channel::Downloads));
        assert!(set.contains(Channel::Disk));
        assert!(set.contains(Channel::Clients));
        assert!(!set.contains(Channel::Log));
        assert_eq!(set.to_list(), "1,2,5");

        assert!(ChannelSet::parse_list("").is_none());
        assert!(ChannelSet::parse_list("1,x").is_none());
        assert!(ChannelSet::parse_list("1,99").is_none());
        assert!(ChannelSet::parse_list("1,,2").is_none());
    }

    #[test]
    fn test_server_event_roundtrip() {
        let events = vec![
            ServerEvent::error("hoster unreachable"),
            ServerEvent::DownloadAdded { index: 3, info: sample_download() },
            ServerEvent::DownloadRemoved { index: 4 },
            ServerEvent::DownloadChanged { index: 0, info: sample_download() },
            ServerEvent::Disk(DiskReport::online(42, 100, 200)),
            ServerEvent::Disk(DiskReport::offline()),
            ServerEvent::Bandwidth(BandwidthReport { bytes_per_sec: 9000 }),
            ServerEvent::Ping(PingReport { latency_ms: 12 }),
            ServerEvent::Log(LogRecord {
                index: 7,
                timestamp_ms: 1,
                severity: Severity::Warning,
                message: "disk almost full".to_string(),
            }),
        ];
        for event in events {
            let bytes = event.encode().unwrap();
            assert_eq!(bytes[0], event.command().code());
            assert_eq!(ServerEvent::decode(&bytes).unwrap(), event);
        }
    }

    #[test]
    fn test_download_removed_has_no_payload() {
        let bytes = ServerEvent::DownloadRemoved { index: 9 }.encode().unwrap();
        assert_eq!(bytes, vec![Command::DownloadRemoved.code(), 9]);
    }

    #[test]
    fn test_setup_snapshot_omits_unsubscribed_sections() {
        let mut snapshot = SetupSnapshot::empty(Uuid::new_v4());
        snapshot.bandwidth = Some(vec![1, 2, 3]);
        let frame = ServerEvent::Setup(Box::new(snapshot.clone())).to_frame().unwrap();

        let payload = frame.payload.unwrap();
        assert!(payload.get("bandwidth").is_some());
        assert!(payload.get("downloads").is_none());
        assert!(payload.get("log").is_none());
        assert_eq!(frame.parameter, NO_PARAMETER);
    }

    #[test]
    fn test_offline_disk_report_has_no_figures() {
        let value = serde_json::to_value(DiskReport::offline()).unwrap();
        assert_eq!(value, json!({"online": false}));
    }

    #[test]
    fn test_client_request_roundtrip() {
        let requests = vec![
            ClientRequest::Start { index: 1 },
            ClientRequest::Stop { index: 2 },
            ClientRequest::Delete { index: 3 },
            ClientRequest::StartAll,
            ClientRequest::StopAll,
            ClientRequest::ClearLog,
            ClientRequest::Upload(UploadRequest {
                name: "batch".to_string(),
                links: vec!["https://host/a".to_string()],
                autostart: true,
            }),
        ];
        for request in requests {
            let bytes = request.encode().unwrap();
            assert_eq!(ClientRequest::decode(&bytes).unwrap(), request);
        }
    }

    #[test]
    fn test_upload_missing_payload() {
        let bytes = encode(Command::Upload.code(), NO_PARAMETER, None);
        assert_eq!(
            ClientRequest::decode(&bytes),
            Err(ProtocolError::MissingPayload(Command::Upload))
        );
    }

    #[test]
    fn test_upload_wrong_schema() {
        let bytes = encode(Command::Upload.code(), NO_PARAMETER, Some(&json!({"name": 5})));
        let err = ClientRequest::decode(&bytes).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { command: Command::Upload, .. }));
    }

    #[test]
    fn test_direction_mismatch_rejected() {
        let server_bytes = ServerEvent::DownloadRemoved { index: 1 }.encode().unwrap();
        assert_eq!(
            ClientRequest::decode(&server_bytes),
            Err(ProtocolError::UnexpectedCommand(Command::DownloadRemoved))
        );

        let client_bytes = ClientRequest::StartAll.encode().unwrap();
        assert_eq!(
            ServerEvent::decode(&client_bytes),
            Err(ProtocolError::UnexpectedCommand(Command::StartAll))
        );
    }

    #[test]
    fn test_unknown_command() {
        assert_eq!(
            ServerEvent::decode(&[200, 0]),
            Err(ProtocolError::UnknownCommand(200))
        );
    }
}
