//! Shared state of the sync subsystem and its external collaborators.
//!
//! [`Hub`] owns the connection registry, the broadcaster and the history
//! buffers, and holds the scheduler and link store behind traits. Producers
//! (scheduler events, the storage monitor, the bandwidth sampler) publish
//! through it; the gateway uses it to attach connections and dispatch
//! client requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::{BroadcastReport, Broadcaster};
use crate::buffers::{LogBuffer, LogRecord, RollingBuffer, Severity};
use crate::protocol::{
    BandwidthReport, Channel, ClientRequest, DiskSnapshot, DownloadInfo, LinkInfo,
    ProtocolError, ServerEvent, SetupSnapshot,
};
use crate::registry::{client_list, Connection, ConnectionRegistry};

/// Failures reported by the scheduler or the hoster layer behind it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchedulerError {
    #[error("No download at index {0}")]
    NoSuchDownload(u8),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Hoster {hoster} failed: {reason}")]
    Hoster { hoster: String, reason: String },
}

/// The download scheduler, consumed as a black box.
///
/// Downloads are addressed by their position in [`Scheduler::downloads`].
pub trait Scheduler: Send + Sync {
    fn downloads(&self) -> Vec<DownloadInfo>;
    fn create_batch(
        &self,
        name: &str,
        links: Vec<String>,
        autostart: bool,
    ) -> Result<(), SchedulerError>;
    fn start(&self, index: u8) -> Result<(), SchedulerError>;
    fn stop(&self, index: u8) -> Result<(), SchedulerError>;
    fn delete(&self, index: u8) -> Result<(), SchedulerError>;
    fn start_all(&self) -> Result<(), SchedulerError>;
    fn stop_all(&self) -> Result<(), SchedulerError>;
    /// Current transfer rate across all downloads.
    fn bandwidth(&self) -> u64;
}

/// Source of the Links list.
pub trait LinkStore: Send + Sync {
    fn links(&self) -> Vec<LinkInfo>;
}

/// Change notifications emitted by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    Added { index: u8, info: DownloadInfo },
    Removed { index: u8 },
    Changed { index: u8, info: DownloadInfo },
    LinksChanged(Vec<LinkInfo>),
    /// A failure not tied to any client request, e.g. a hoster going down
    Failed(SchedulerError),
}

impl From<SchedulerEvent> for ServerEvent {
    fn from(event: SchedulerEvent) -> Self {
        match event {
            SchedulerEvent::Added { index, info } => ServerEvent::DownloadAdded { index, info },
            SchedulerEvent::Removed { index } => ServerEvent::DownloadRemoved { index },
            SchedulerEvent::Changed { index, info } => ServerEvent::DownloadChanged { index, info },
            SchedulerEvent::LinksChanged(links) => ServerEvent::Links(links),
            SchedulerEvent::Failed(e) => ServerEvent::error(e.to_string()),
        }
    }
}

/// Central state shared by the gateway and all producers.
pub struct Hub {
    registry: Arc<ConnectionRegistry>,
    broadcaster: Broadcaster,
    disk: RollingBuffer,
    disk_online: AtomicBool,
    bandwidth: RollingBuffer,
    logs: LogBuffer,
    scheduler: Arc<dyn Scheduler>,
    links: Arc<dyn LinkStore>,
}

impl Hub {
    pub fn new(scheduler: Arc<dyn Scheduler>, links: Arc<dyn LinkStore>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            broadcaster: Broadcaster::new(registry.clone()),
            registry,
            disk: RollingBuffer::new(),
            disk_online: AtomicBool::new(false),
            bandwidth: RollingBuffer::new(),
            logs: LogBuffer::new(),
            scheduler,
            links,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    pub fn disk(&self) -> &RollingBuffer {
        &self.disk
    }

    pub fn bandwidth(&self) -> &RollingBuffer {
        &self.bandwidth
    }

    pub fn logs(&self) -> &LogBuffer {
        &self.logs
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn disk_online(&self) -> bool {
        self.disk_online.load(Ordering::Acquire)
    }

    pub fn set_disk_online(&self, online: bool) {
        self.disk_online.store(online, Ordering::Release);
    }

    /// Broadcast a typed event. Encoding failures are logged and dropped.
    pub fn publish(&self, event: &ServerEvent) -> BroadcastReport {
        match self.broadcaster.send(event) {
            Ok(report) => report,
            Err(e) => {
                log::error!("Failed to encode {:?} event: {e}", event.command());
                BroadcastReport::default()
            }
        }
    }

    pub fn forward(&self, event: SchedulerEvent) -> BroadcastReport {
        match event {
            SchedulerEvent::Failed(e) => self.report_error(e.to_string()),
            other => self.publish(&other.into()),
        }
    }

    /// Surface a scheduler or hoster failure to every client and keep it in
    /// the log buffer.
    pub fn report_error(&self, message: impl Into<String>) -> BroadcastReport {
        let message = message.into();
        log::warn!("{message}");
        self.log(Severity::Error, message.clone());
        self.publish(&ServerEvent::error(message))
    }

    pub fn record_bandwidth(&self, bytes_per_sec: u64) -> BroadcastReport {
        self.bandwidth.push(bytes_per_sec);
        self.publish(&ServerEvent::Bandwidth(BandwidthReport { bytes_per_sec }))
    }

    /// Append to the log buffer and broadcast the record.
    pub fn log(&self, severity: Severity, message: impl Into<String>) -> LogRecord {
        let record = self.logs.push(severity, message);
        self.publish(&ServerEvent::Log(record.clone()));
        record
    }

    pub fn clear_log(&self) {
        self.logs.clear();
    }

    pub fn broadcast_clients(&self) -> BroadcastReport {
        self.publish(&ServerEvent::Clients(self.registry.clients()))
    }

    /// Assemble the Setup snapshot for `connection`, restricted to its channels.
    pub fn setup_snapshot(
        &self,
        connection: &Connection,
        connections: &HashMap<Uuid, Arc<Connection>>,
    ) -> SetupSnapshot {
        let mut snapshot = SetupSnapshot::empty(connection.id());
        for channel in connection.channels().iter() {
            match channel {
                Channel::General => {}
                Channel::Downloads => snapshot.downloads = Some(self.scheduler.downloads()),
                Channel::Disk => {
                    snapshot.disk = Some(DiskSnapshot {
                        online: self.disk_online(),
                        history: self.disk.snapshot(),
                    })
                }
                Channel::Bandwidth => snapshot.bandwidth = Some(self.bandwidth.snapshot()),
                Channel::Links => snapshot.links = Some(self.links.links()),
                Channel::Clients => snapshot.clients = Some(client_list(connections)),
                Channel::Log => snapshot.log = Some(self.logs.snapshot()),
            }
        }
        snapshot
    }

    /// Register a connection with its Setup frame already queued.
    ///
    /// The snapshot is built and enqueued under the registry write lock, so
    /// Setup is always the first frame and no concurrent delta is lost.
    pub fn attach(&self, connection: Arc<Connection>) -> Result<(), ProtocolError> {
        let target = connection.clone();
        self.registry.register_with(connection, |connections| {
            let snapshot = self.setup_snapshot(&target, connections);
            let frame = ServerEvent::Setup(Box::new(snapshot)).encode()?;
            target.enqueue(Bytes::from(frame));
            Ok::<(), ProtocolError>(())
        })?;
        log::info!(
            "Client {} ({}) attached from {} on channels [{}]",
            target.friendly_name(),
            target.id(),
            target.remote_addr(),
            target.channels().to_list()
        );
        self.broadcast_clients();
        Ok(())
    }

    /// Deregister a connection. Only the first call has an effect.
    pub fn detach(&self, id: &Uuid) -> Option<Arc<Connection>> {
        let removed = self.registry.remove(id)?;
        log::info!("Client {} ({}) detached", removed.friendly_name(), removed.id());
        self.broadcast_clients();
        Some(removed)
    }

    /// Execute a client request.
    pub fn dispatch(&self, request: ClientRequest) -> Result<(), SchedulerError> {
        match request {
            ClientRequest::Start { index } => self.scheduler.start(index),
            ClientRequest::Stop { index } => self.scheduler.stop(index),
            ClientRequest::Delete { index } => self.scheduler.delete(index),
            ClientRequest::StartAll => self.scheduler.start_all(),
            ClientRequest::StopAll => self.scheduler.stop_all(),
            ClientRequest::Upload(upload) => {
                if upload.links.is_empty() {
                    return Err(SchedulerError::Rejected(format!(
                        "batch '{}' contains no links",
                        upload.name
                    )));
                }
                self.scheduler
                    .create_batch(&upload.name, upload.links, upload.autostart)
            }
            ClientRequest::ClearLog => {
                self.clear_log();
                Ok(())
            }
        }
    }

    /// Forward scheduler events until the channel closes or `cancel` fires.
    pub async fn forward_events(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SchedulerEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => {
                        self.forward(event);
                    }
                    None => break,
                },
            }
        }
    }

    /// Sample the scheduler's transfer rate every `interval`.
    pub async fn sample_bandwidth(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let rate = self.scheduler.bandwidth();
                    self.record_bandwidth(rate);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryLinkStore, MemoryScheduler};
    use crate::protocol::{ChannelSet, DownloadState, LinkStatus, UploadRequest};
    use crate::registry::Outbound;
    use std::net::SocketAddr;

    fn hub() -> (Arc<Hub>, Arc<MemoryScheduler>, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (scheduler, events) = MemoryScheduler::new();
        let scheduler = Arc::new(scheduler);
        let links = Arc::new(MemoryLinkStore::new(vec![LinkInfo {
            url: "https://host.example/file".to_string(),
            hoster: "host.example".to_string(),
            status: LinkStatus::Online,
        }]));
        (Arc::new(Hub::new(scheduler.clone(), links)), scheduler, events)
    }

    fn connection(channels: ChannelSet) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(32);
        let addr: SocketAddr = "10.0.0.2:7000".parse().unwrap();
        (
            Arc::new(Connection::new("Tester", addr, channels, tx, CancellationToken::new())),
            rx,
        )
    }

    fn next_event(rx: &mut mpsc::Receiver<Outbound>) -> ServerEvent {
        match rx.try_recv().unwrap() {
            Outbound::Frame(bytes) => ServerEvent::decode(&bytes).unwrap(),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[test]
    fn test_attach_sends_setup_first() {
        let (hub, _scheduler, _events) = hub();
        hub.disk().push(55);
        hub.logs().push(Severity::Warning, "low space");

        let channels = ChannelSet::empty()
            .with(Channel::General)
            .with(Channel::Disk)
            .with(Channel::Clients);
        let (conn, mut rx) = connection(channels);
        hub.attach(conn.clone()).unwrap();

        match next_event(&mut rx) {
            ServerEvent::Setup(snapshot) => {
                assert_eq!(snapshot.connection_id, conn.id());
                let disk = snapshot.disk.unwrap();
                assert_eq!(disk.history.len(), 31);
                assert_eq!(snapshot.clients.unwrap().len(), 1);
                assert!(snapshot.downloads.is_none());
                assert!(snapshot.log.is_none());
                assert!(snapshot.links.is_none());
            }
            other => panic!("expected Setup, got {other:?}"),
        }
        // Clients list follows because the connection subscribed to it
        assert!(matches!(next_event(&mut rx), ServerEvent::Clients(list) if list.len() == 1));
    }

    #[test]
    fn test_setup_includes_log_and_links() {
        let (hub, _scheduler, _events) = hub();
        hub.logs().push(Severity::Error, "hoster down");

        let channels = ChannelSet::empty().with(Channel::Log).with(Channel::Links);
        let (conn, mut rx) = connection(channels);
        hub.attach(conn).unwrap();

        match next_event(&mut rx) {
            ServerEvent::Setup(snapshot) => {
                let log = snapshot.log.unwrap();
                assert_eq!(log.records.len(), 1);
                assert_eq!(log.watermark, Some(Severity::Error));
                assert_eq!(snapshot.links.unwrap().len(), 1);
            }
            other => panic!("expected Setup, got {other:?}"),
        }
    }

    #[test]
    fn test_detach_once() {
        let (hub, _scheduler, _events) = hub();
        let (conn, _rx) = connection(ChannelSet::all());
        let id = conn.id();
        hub.attach(conn).unwrap();

        assert!(hub.detach(&id).is_some());
        assert!(hub.detach(&id).is_none());
        assert!(hub.registry().is_empty());
    }

    #[test]
    fn test_dispatch_upload_and_errors() {
        let (hub, scheduler, _events) = hub();

        hub.dispatch(ClientRequest::Upload(UploadRequest {
            name: "set".to_string(),
            links: vec!["a".to_string(), "b".to_string()],
            autostart: true,
        }))
        .unwrap();
        let downloads = scheduler.downloads();
        assert_eq!(downloads.len(), 1);
        assert_eq!(downloads[0].state, DownloadState::Running);

        assert_eq!(
            hub.dispatch(ClientRequest::Start { index: 9 }),
            Err(SchedulerError::NoSuchDownload(9))
        );
        assert!(matches!(
            hub.dispatch(ClientRequest::Upload(UploadRequest {
                name: "empty".to_string(),
                links: vec![],
                autostart: false,
            })),
            Err(SchedulerError::Rejected(_))
        ));
    }

    #[test]
    fn test_dispatch_clear_log() {
        let (hub, _scheduler, _events) = hub();
        hub.log(Severity::Error, "boom");
        hub.dispatch(ClientRequest::ClearLog).unwrap();
        assert!(hub.logs().is_empty());
        assert_eq!(hub.logs().watermark(), None);
    }

    #[test]
    fn test_record_bandwidth_broadcasts() {
        let (hub, _scheduler, _events) = hub();
        let (conn, mut rx) = connection(ChannelSet::empty().with(Channel::Bandwidth));
        hub.registry().register(conn);

        hub.record_bandwidth(2048);
        assert_eq!(hub.bandwidth().latest(), Some(2048));
        assert_eq!(
            next_event(&mut rx),
            ServerEvent::Bandwidth(BandwidthReport { bytes_per_sec: 2048 })
        );
    }

    #[test]
    fn test_report_error_reaches_every_connection() {
        let (hub, _scheduler, _events) = hub();
        let (general, mut general_rx) = connection(ChannelSet::empty().with(Channel::General));
        let log_only = ChannelSet::empty().with(Channel::General).with(Channel::Log);
        let (logger, mut logger_rx) = connection(log_only);
        hub.registry().register(general);
        hub.registry().register(logger);

        let report = hub.report_error("host.example: quota exceeded");
        assert_eq!(report.delivered(), 2);

        assert!(matches!(
            next_event(&mut general_rx),
            ServerEvent::Error(e) if e.message.contains("quota exceeded")
        ));
        assert!(general_rx.try_recv().is_err());

        // Log subscribers also get the record, ahead of the Error
        assert!(matches!(
            next_event(&mut logger_rx),
            ServerEvent::Log(record) if record.severity == Severity::Error
        ));
        assert!(matches!(next_event(&mut logger_rx), ServerEvent::Error(_)));
        assert_eq!(hub.logs().watermark(), Some(Severity::Error));
    }

    #[tokio::test]
    async fn test_links_and_failures_are_forwarded() {
        let (scheduler, events) = MemoryScheduler::new();
        let scheduler = Arc::new(scheduler);
        let links = Arc::new(scheduler.link_store(Vec::new()));
        let hub = Arc::new(Hub::new(scheduler.clone(), links.clone()));

        let (linked, mut linked_rx) = connection(ChannelSet::empty().with(Channel::Links));
        let (general, mut general_rx) = connection(ChannelSet::empty().with(Channel::General));
        hub.registry().register(linked);
        hub.registry().register(general);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(hub.clone().forward_events(events, cancel.clone()));

        links.replace(vec![LinkInfo {
            url: "https://host.example/a".to_string(),
            hoster: "host.example".to_string(),
            status: LinkStatus::Offline,
        }]);
        scheduler.report_hoster_failure("host.example", "503 from API");

        let first = tokio::time::timeout(Duration::from_secs(1), linked_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match first {
            Outbound::Frame(bytes) => match ServerEvent::decode(&bytes).unwrap() {
                ServerEvent::Links(list) => assert_eq!(list[0].status, LinkStatus::Offline),
                other => panic!("expected Links, got {other:?}"),
            },
            other => panic!("expected frame, got {other:?}"),
        }

        // The General-only connection never sees Links, only the failure
        let failure = tokio::time::timeout(Duration::from_secs(1), general_rx.recv())
            .await
            .unwrap()
            .unwrap();
        match failure {
            Outbound::Frame(bytes) => match ServerEvent::decode(&bytes).unwrap() {
                ServerEvent::Error(e) => assert!(e.message.contains("503 from API")),
                other => panic!("expected Error, got {other:?}"),
            },
            other => panic!("expected frame, got {other:?}"),
        }

        cancel.cancel();
        task.await.unwrap();
        assert!(general_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_forward_events_until_cancelled() {
        let (hub, scheduler, events) = hub();
        let (conn, mut rx) = connection(ChannelSet::empty().with(Channel::Downloads));
        hub.registry().register(conn);

        let cancel = CancellationToken::new();
        let task = tokio::spawn(hub.clone().forward_events(events, cancel.clone()));

        scheduler.create_batch("movies", vec!["x".to_string()], false).unwrap();
        let outbound = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match outbound {
            Outbound::Frame(bytes) => assert!(matches!(
                ServerEvent::decode(&bytes).unwrap(),
                ServerEvent::DownloadAdded { index: 0, .. }
            )),
            other => panic!("expected frame, got {other:?}"),
        }

        cancel.cancel();
        task.await.unwrap();
    }
}
