//! Storage availability monitoring.
//!
//! [`DiskMachine`] is a pure two-state machine (Offline / Online) that turns
//! availability signals and periodic ticks into [`StorageEffect`]s. The async
//! [`StorageMonitor`] drives it: it polls the configured directory, owns the
//! `notify` watcher, and applies the effects to the [`Hub`] (disk history,
//! `Disk` broadcasts, batch ingestion).
//!
//! ```text
//!            PathAvailable (probe ok)
//!   Offline ───────────────────────────► Online ──┐
//!      ▲    StartWatcher, InitialScan,     │  ▲   │ Tick
//!      │    Record                         │  └───┘ Record
//!      └───────────────────────────────────┘
//!         PathUnavailable / probe failure
//!         StopWatcher, ClearHistory, ReportOffline
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::buffers::Severity;
use crate::hub::Hub;
use crate::ingest::{self, LinkFileFilter};
use crate::protocol::{DiskReport, ServerEvent};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to query volume of {path}: {source}")]
    Probe {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Volume of {0} reports zero capacity")]
    EmptyVolume(PathBuf),

    #[error("Directory watcher failed: {0}")]
    Watch(#[from] notify::Error),

    #[error("Storage monitor is already running")]
    AlreadyRunning,
}

/// Storage monitor configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Directory watched for batch files and measured for free space
    pub path: PathBuf,
    /// Extension of batch files
    pub extension: String,
    pub poll_interval_secs: u64,
    pub update_interval_secs: u64,
    /// Quiet period before a changed file is read
    pub settle_millis: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("downloads"),
            extension: "txt".to_string(),
            poll_interval_secs: 5,
            update_interval_secs: 60,
            settle_millis: 500,
        }
    }
}

/// Free and total bytes of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeUsage {
    pub free: u64,
    pub total: u64,
}

impl VolumeUsage {
    /// Used space as a whole percentage, rounded towards full.
    ///
    /// `100 - (100 * free / total)` with integer division, so 0.5% free
    /// reads as 100% used.
    pub fn percent_used(&self) -> u64 {
        if self.total == 0 {
            return 100;
        }
        let free = self.free.min(self.total) as u128;
        let free_percent = (100 * free / self.total as u128) as u64;
        100 - free_percent
    }
}

/// Source of availability and usage of the watched directory.
pub trait VolumeProbe: Send + Sync {
    fn is_available(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn usage(&self, path: &Path) -> Result<VolumeUsage, StorageError>;
}

/// Probe backed by the operating system through `fs4`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProbe;

impl VolumeProbe for FsProbe {
    fn usage(&self, path: &Path) -> Result<VolumeUsage, StorageError> {
        let probe_err = |source| StorageError::Probe {
            path: path.to_path_buf(),
            source,
        };
        let free = fs4::available_space(path).map_err(probe_err)?;
        let total = fs4::total_space(path).map_err(probe_err)?;
        if total == 0 {
            return Err(StorageError::EmptyVolume(path.to_path_buf()));
        }
        Ok(VolumeUsage { free, total })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskState {
    Offline,
    Online,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageSignal {
    PathAvailable,
    PathUnavailable,
    Tick,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEffect {
    /// Start watching the directory, tagging events with `generation`
    StartWatcher { generation: u64 },
    StopWatcher,
    /// Ingest files already present, without autostart
    InitialScan,
    /// Push a usage sample and broadcast it
    Record { percent: u64, usage: VolumeUsage },
    ClearHistory,
    /// Broadcast that the storage went away
    ReportOffline,
}

/// Pure availability state machine.
#[derive(Debug)]
pub struct DiskMachine {
    state: DiskState,
    generation: u64,
    /// The path exists but could not be measured on the last attempt
    unmeasurable: bool,
}

impl DiskMachine {
    pub fn new() -> Self {
        Self {
            state: DiskState::Offline,
            generation: 0,
            unmeasurable: false,
        }
    }

    pub fn is_unmeasurable(&self) -> bool {
        self.unmeasurable
    }

    pub fn state(&self) -> DiskState {
        self.state
    }

    pub fn is_online(&self) -> bool {
        self.state == DiskState::Online
    }

    /// Generation of the current watcher. Events from older watchers must
    /// be ignored.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Advance the machine. `probe` is only called when a sample is needed.
    pub fn apply<F>(&mut self, signal: StorageSignal, probe: F) -> Vec<StorageEffect>
    where
        F: FnOnce() -> Result<VolumeUsage, StorageError>,
    {
        match (self.state, signal) {
            (DiskState::Offline, StorageSignal::PathAvailable) => match probe() {
                Ok(usage) => {
                    self.unmeasurable = false;
                    self.state = DiskState::Online;
                    self.generation += 1;
                    vec![
                        StorageEffect::StartWatcher {
                            generation: self.generation,
                        },
                        StorageEffect::InitialScan,
                        StorageEffect::Record {
                            percent: usage.percent_used(),
                            usage,
                        },
                    ]
                }
                Err(e) => {
                    if self.unmeasurable {
                        log::debug!("Storage still not measurable: {e}");
                    } else {
                        log::warn!("Storage present but not measurable: {e}");
                    }
                    self.unmeasurable = true;
                    Vec::new()
                }
            },
            (DiskState::Online, StorageSignal::Tick) => match probe() {
                Ok(usage) => vec![StorageEffect::Record {
                    percent: usage.percent_used(),
                    usage,
                }],
                Err(e) => {
                    log::warn!("Storage probe failed, going offline: {e}");
                    self.go_offline()
                }
            },
            (DiskState::Online, StorageSignal::PathUnavailable) => self.go_offline(),
            (DiskState::Offline, StorageSignal::PathUnavailable) => {
                self.unmeasurable = false;
                Vec::new()
            }
            (DiskState::Offline, StorageSignal::Tick)
            | (DiskState::Online, StorageSignal::PathAvailable) => Vec::new(),
        }
    }

    /// Return to Offline and invalidate the current watcher generation.
    pub fn reset(&mut self) -> Vec<StorageEffect> {
        let effects = if self.is_online() {
            self.go_offline()
        } else {
            Vec::new()
        };
        self.generation += 1;
        effects
    }

    fn go_offline(&mut self) -> Vec<StorageEffect> {
        self.state = DiskState::Offline;
        vec![
            StorageEffect::StopWatcher,
            StorageEffect::ClearHistory,
            StorageEffect::ReportOffline,
        ]
    }
}

impl Default for DiskMachine {
    fn default() -> Self {
        Self::new()
    }
}

/// A filesystem change reported by a watcher of a given generation.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WatchEvent {
    generation: u64,
    path: PathBuf,
}

struct MonitorState {
    path: PathBuf,
    machine: DiskMachine,
    watcher: Option<RecommendedWatcher>,
}

/// Drives [`DiskMachine`] against the real filesystem.
pub struct StorageMonitor {
    hub: Arc<Hub>,
    probe: Arc<dyn VolumeProbe>,
    filter: LinkFileFilter,
    poll_interval: Duration,
    update_interval: Duration,
    settle: Duration,
    // Held across teardown and rebuild so reconfiguration is atomic with
    // respect to polls, ticks and ingestion.
    state: Mutex<MonitorState>,
    changes_tx: mpsc::UnboundedSender<WatchEvent>,
    changes_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<WatchEvent>>>,
}

impl StorageMonitor {
    pub fn new(hub: Arc<Hub>, config: StorageConfig, probe: Arc<dyn VolumeProbe>) -> Self {
        let (changes_tx, changes_rx) = mpsc::unbounded_channel();
        Self {
            hub,
            probe,
            filter: LinkFileFilter::new(config.extension),
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            update_interval: Duration::from_secs(config.update_interval_secs.max(1)),
            settle: Duration::from_millis(config.settle_millis),
            state: Mutex::new(MonitorState {
                path: config.path,
                machine: DiskMachine::new(),
                watcher: None,
            }),
            changes_tx,
            changes_rx: parking_lot::Mutex::new(Some(changes_rx)),
        }
    }

    pub async fn path(&self) -> PathBuf {
        self.state.lock().await.path.clone()
    }

    pub async fn state(&self) -> DiskState {
        self.state.lock().await.machine.state()
    }

    /// Check whether the directory exists and feed the result to the machine.
    pub async fn check_availability(&self) {
        let mut state = self.state.lock().await;
        let signal = if self.probe.is_available(&state.path) {
            StorageSignal::PathAvailable
        } else {
            StorageSignal::PathUnavailable
        };
        self.step(&mut state, signal).await;
    }

    /// Take a usage sample if online.
    pub async fn update(&self) {
        let mut state = self.state.lock().await;
        self.step(&mut state, StorageSignal::Tick).await;
    }

    /// Switch to a new directory. The old watcher is stopped and the history
    /// cleared before the lock is released; the next poll brings the new
    /// path online.
    pub async fn reconfigure(&self, path: impl Into<PathBuf>) {
        let mut state = self.state.lock().await;
        let effects = state.machine.reset();
        self.apply_effects(&mut state, effects).await;
        state.watcher = None;
        state.path = path.into();
        log::info!("Storage path set to {}", state.path.display());
    }

    /// Poll, sample and ingest until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), StorageError> {
        let mut changes = self
            .changes_rx
            .lock()
            .take()
            .ok_or(StorageError::AlreadyRunning)?;

        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut update = tokio::time::interval_at(
            tokio::time::Instant::now() + self.update_interval,
            self.update_interval,
        );
        update.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut settle = tokio::time::interval(self.settle.max(Duration::from_millis(50)));
        settle.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        // Changed paths waiting for their writes to settle
        let mut pending: HashMap<PathBuf, (u64, Instant)> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = poll.tick() => self.check_availability().await,
                _ = update.tick() => self.update().await,
                Some(change) = changes.recv() => {
                    pending.insert(change.path, (change.generation, Instant::now()));
                }
                _ = settle.tick(), if !pending.is_empty() => {
                    let now = Instant::now();
                    let ready: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, (_, seen))| now.duration_since(*seen) >= self.settle)
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in ready {
                        if let Some((generation, _)) = pending.remove(&path) {
                            self.ingest_change(WatchEvent { generation, path }).await;
                        }
                    }
                }
            }
        }

        let mut state = self.state.lock().await;
        state.watcher = None;
        log::debug!("Storage monitor stopped");
        Ok(())
    }

    async fn step(&self, state: &mut MonitorState, signal: StorageSignal) {
        let path = state.path.clone();
        let probe = self.probe.clone();
        let effects = state.machine.apply(signal, || probe.usage(&path));
        self.apply_effects(state, effects).await;
    }

    async fn apply_effects(&self, state: &mut MonitorState, effects: Vec<StorageEffect>) {
        let mut queue: std::collections::VecDeque<StorageEffect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                StorageEffect::StartWatcher { generation } => {
                    match self.start_watcher(&state.path, generation) {
                        Ok(watcher) => state.watcher = Some(watcher),
                        Err(e) => {
                            log::error!("Cannot watch {}: {e}", state.path.display());
                            self.hub
                                .log(Severity::Error, format!("Cannot watch storage: {e}"));
                            // Anything queued after StartWatcher belongs to an
                            // Online state that never materialised.
                            queue.clear();
                            let path = state.path.clone();
                            queue.extend(state.machine.apply(StorageSignal::PathUnavailable, || {
                                Err(StorageError::EmptyVolume(path))
                            }));
                        }
                    }
                }
                StorageEffect::StopWatcher => {
                    state.watcher = None;
                }
                StorageEffect::InitialScan => {
                    let scheduler = self.hub.scheduler().as_ref();
                    match ingest::scan_directory(&state.path, &self.filter, scheduler).await {
                        Ok(0) => {}
                        Ok(created) => {
                            self.hub.log(
                                Severity::Info,
                                format!("Queued {created} batches found in storage"),
                            );
                        }
                        Err(e) => log::warn!("Initial scan failed: {e}"),
                    }
                }
                StorageEffect::Record { percent, usage } => {
                    self.hub.disk().push(percent);
                    self.hub.set_disk_online(true);
                    self.hub.publish(&ServerEvent::Disk(DiskReport::online(
                        percent,
                        usage.free,
                        usage.total,
                    )));
                }
                StorageEffect::ClearHistory => self.hub.disk().clear(),
                StorageEffect::ReportOffline => {
                    self.hub.set_disk_online(false);
                    self.hub.publish(&ServerEvent::Disk(DiskReport::offline()));
                    self.hub.log(
                        Severity::Warning,
                        format!("Storage {} is offline", state.path.display()),
                    );
                }
            }
        }
    }

    fn start_watcher(
        &self,
        path: &Path,
        generation: u64,
    ) -> Result<RecommendedWatcher, StorageError> {
        let tx = self.changes_tx.clone();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths {
                            // The monitor may already be gone during shutdown
                            let _ = tx.send(WatchEvent { generation, path });
                        }
                    }
                }
                Err(e) => log::warn!("Watcher error: {e}"),
            }
        })?;
        watcher.watch(path, RecursiveMode::NonRecursive)?;
        log::info!("Watching {} (generation {generation})", path.display());
        Ok(watcher)
    }

    async fn ingest_change(&self, change: WatchEvent) {
        let state = self.state.lock().await;
        if change.generation != state.machine.generation() || !state.machine.is_online() {
            log::debug!(
                "Ignoring stale change {} from generation {}",
                change.path.display(),
                change.generation
            );
            return;
        }
        if !self.filter.matches(&change.path) || !change.path.is_file() {
            return;
        }
        let scheduler = self.hub.scheduler().as_ref();
        match ingest::ingest_file(&change.path, scheduler, true).await {
            Ok(Some(batch)) => {
                self.hub.log(
                    Severity::Info,
                    format!("Queued batch '{}' ({} links)", batch.name, batch.links.len()),
                );
            }
            Ok(None) => {}
            Err(e) => {
                log::warn!("Failed to ingest {}: {e}", change.path.display());
                self.hub.log(Severity::Warning, format!("Failed to ingest batch: {e}"));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryLinkStore, MemoryScheduler};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn usage(free: u64, total: u64) -> impl FnOnce() -> Result<VolumeUsage, StorageError> {
        move || Ok(VolumeUsage { free, total })
    }

    fn failing() -> impl FnOnce() -> Result<VolumeUsage, StorageError> {
        || Err(StorageError::EmptyVolume(PathBuf::from("/gone")))
    }

    #[test]
    fn test_percent_used_floor_division() {
        assert_eq!(VolumeUsage { free: 60, total: 100 }.percent_used(), 40);
        // 100*1/3 = 33 free, so 67 used
        assert_eq!(VolumeUsage { free: 1, total: 3 }.percent_used(), 67);
        assert_eq!(VolumeUsage { free: 1, total: 1000 }.percent_used(), 100);
        assert_eq!(VolumeUsage { free: 1000, total: 1000 }.percent_used(), 0);
        assert_eq!(VolumeUsage { free: 5, total: 0 }.percent_used(), 100);
        assert_eq!(
            VolumeUsage { free: u64::MAX / 2, total: u64::MAX }.percent_used(),
            51
        );
    }

    #[test]
    fn test_offline_to_online() {
        let mut machine = DiskMachine::new();
        let effects = machine.apply(StorageSignal::PathAvailable, usage(25, 100));
        assert_eq!(machine.state(), DiskState::Online);
        assert_eq!(
            effects,
            vec![
                StorageEffect::StartWatcher { generation: 1 },
                StorageEffect::InitialScan,
                StorageEffect::Record {
                    percent: 75,
                    usage: VolumeUsage { free: 25, total: 100 }
                },
            ]
        );

        // Already online: nothing happens
        assert!(machine.apply(StorageSignal::PathAvailable, usage(25, 100)).is_empty());
    }

    #[test]
    fn test_tick_samples_only_when_online() {
        let mut machine = DiskMachine::new();
        assert!(machine.apply(StorageSignal::Tick, usage(1, 2)).is_empty());

        machine.apply(StorageSignal::PathAvailable, usage(50, 100));
        let effects = machine.apply(StorageSignal::Tick, usage(10, 100));
        assert!(matches!(effects.as_slice(), [StorageEffect::Record { percent: 90, .. }]));
    }

    #[test]
    fn test_unavailable_goes_offline() {
        let mut machine = DiskMachine::new();
        machine.apply(StorageSignal::PathAvailable, usage(50, 100));
        let effects = machine.apply(StorageSignal::PathUnavailable, failing());
        assert_eq!(machine.state(), DiskState::Offline);
        assert_eq!(
            effects,
            vec![
                StorageEffect::StopWatcher,
                StorageEffect::ClearHistory,
                StorageEffect::ReportOffline
            ]
        );
        assert!(machine.apply(StorageSignal::PathUnavailable, failing()).is_empty());
    }

    #[test]
    fn test_probe_failure_while_online() {
        let mut machine = DiskMachine::new();
        machine.apply(StorageSignal::PathAvailable, usage(50, 100));
        let effects = machine.apply(StorageSignal::Tick, failing());
        assert_eq!(machine.state(), DiskState::Offline);
        assert_eq!(effects[0], StorageEffect::StopWatcher);
    }

    #[test]
    fn test_probe_failure_keeps_offline() {
        let mut machine = DiskMachine::new();
        assert!(machine.apply(StorageSignal::PathAvailable, failing()).is_empty());
        assert_eq!(machine.state(), DiskState::Offline);
        assert_eq!(machine.generation(), 0);
    }

    #[test]
    fn test_unmeasurable_path_is_tracked_until_it_changes() {
        let mut machine = DiskMachine::new();
        assert!(!machine.is_unmeasurable());

        machine.apply(StorageSignal::PathAvailable, failing());
        machine.apply(StorageSignal::PathAvailable, failing());
        assert!(machine.is_unmeasurable());

        // Disappearing clears it, so the next failure is reported again
        machine.apply(StorageSignal::PathUnavailable, failing());
        assert!(!machine.is_unmeasurable());

        machine.apply(StorageSignal::PathAvailable, failing());
        assert!(machine.is_unmeasurable());
        machine.apply(StorageSignal::PathAvailable, usage(40, 100));
        assert!(!machine.is_unmeasurable());
        assert!(machine.is_online());
    }

    #[test]
    fn test_reset_bumps_generation() {
        let mut machine = DiskMachine::new();
        machine.apply(StorageSignal::PathAvailable, usage(50, 100));
        assert_eq!(machine.generation(), 1);

        let effects = machine.reset();
        assert_eq!(effects.len(), 3);
        assert_eq!(machine.generation(), 2);
        assert!(machine.reset().is_empty());
        assert_eq!(machine.generation(), 3);

        let effects = machine.apply(StorageSignal::PathAvailable, usage(50, 100));
        assert_eq!(effects[0], StorageEffect::StartWatcher { generation: 4 });
    }

    struct FakeProbe {
        available: AtomicBool,
        usage: VolumeUsage,
    }

    impl VolumeProbe for FakeProbe {
        fn is_available(&self, path: &Path) -> bool {
            self.available.load(Ordering::SeqCst) && path.is_dir()
        }

        fn usage(&self, _path: &Path) -> Result<VolumeUsage, StorageError> {
            Ok(self.usage)
        }
    }

    type Fixture = (Arc<StorageMonitor>, Arc<Hub>, Arc<MemoryScheduler>, Arc<FakeProbe>);

    fn monitor(dir: &Path) -> Fixture {
        let (scheduler, _events) = MemoryScheduler::new();
        let scheduler = Arc::new(scheduler);
        let hub = Arc::new(Hub::new(scheduler.clone(), Arc::new(MemoryLinkStore::default())));
        let probe = Arc::new(FakeProbe {
            available: AtomicBool::new(true),
            usage: VolumeUsage { free: 30, total: 100 },
        });
        let config = StorageConfig {
            path: dir.to_path_buf(),
            poll_interval_secs: 1,
            update_interval_secs: 60,
            settle_millis: 100,
            ..StorageConfig::default()
        };
        let monitor = Arc::new(StorageMonitor::new(hub.clone(), config, probe.clone()));
        (monitor, hub, scheduler, probe)
    }

    #[tokio::test]
    async fn test_monitor_comes_online_and_scans() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("batch1.txt"), "a\nb\nc\n").unwrap();
        let (monitor, hub, scheduler, probe) = monitor(dir.path());

        monitor.check_availability().await;
        assert_eq!(monitor.state().await, DiskState::Online);
        assert!(hub.disk_online());
        assert_eq!(hub.disk().snapshot(), vec![70; 31]);

        let submitted = scheduler.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].name, "batch1");
        assert!(!submitted[0].autostart);

        monitor.update().await;
        assert_eq!(hub.disk().len(), 31);

        probe.available.store(false, Ordering::SeqCst);
        monitor.check_availability().await;
        assert_eq!(monitor.state().await, DiskState::Offline);
        assert!(!hub.disk_online());
        assert!(hub.disk().is_empty());
    }

    #[tokio::test]
    async fn test_reconfigure_ignores_stale_events() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        let (monitor, hub, scheduler, _probe) = monitor(first.path());

        monitor.check_availability().await;
        let old_generation = monitor.state.lock().await.machine.generation();

        monitor.reconfigure(second.path()).await;
        assert_eq!(monitor.path().await, second.path());
        assert_eq!(monitor.state().await, DiskState::Offline);
        assert!(hub.disk().is_empty());

        monitor.check_availability().await;
        assert_eq!(monitor.state().await, DiskState::Online);

        let late = first.path().join("late.txt");
        std::fs::write(&late, "x\n").unwrap();
        monitor
            .ingest_change(WatchEvent {
                generation: old_generation,
                path: late,
            })
            .await;
        assert!(scheduler.submitted().is_empty());

        let current = monitor.state.lock().await.machine.generation();
        let fresh = second.path().join("fresh.txt");
        std::fs::write(&fresh, "y\nz\n").unwrap();
        monitor
            .ingest_change(WatchEvent {
                generation: current,
                path: fresh,
            })
            .await;
        let submitted = scheduler.submitted();
        assert_eq!(submitted.len(), 1);
        assert!(submitted[0].autostart);
    }

    #[tokio::test]
    async fn test_watcher_ingests_new_file_with_autostart() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("batch1.txt"), "l1\nl2\nl3\n").unwrap();
        let (monitor, _hub, scheduler, _probe) = monitor(dir.path());

        let cancel = CancellationToken::new();
        let task = tokio::spawn(monitor.clone().run(cancel.clone()));

        // Initial scan happens on the first poll
        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.submitted().is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(scheduler.submitted().len(), 1);

        std::fs::write(dir.path().join("later.txt"), "m1\nm2\n").unwrap();
        std::fs::write(dir.path().join("empty.txt"), "").unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.submitted().len() < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        // Let any duplicate events settle before counting
        tokio::time::sleep(Duration::from_millis(300)).await;

        let submitted = scheduler.submitted();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].name, "batch1");
        assert!(!submitted[0].autostart);
        assert_eq!(submitted[1].name, "later");
        assert_eq!(submitted[1].links, vec!["m1", "m2"]);
        assert!(submitted[1].autostart);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, _hub, _scheduler, _probe) = monitor(dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();
        monitor.clone().run(cancel.clone()).await.unwrap();
        assert!(matches!(
            monitor.run(cancel).await,
            Err(StorageError::AlreadyRunning)
        ));
    }
}
