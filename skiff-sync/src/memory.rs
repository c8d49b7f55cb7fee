//! In-memory scheduler and link store.
//!
//! Used by the daemon when no real scheduler is wired in, and by tests.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::hub::{LinkStore, Scheduler, SchedulerError, SchedulerEvent};
use crate::protocol::{DownloadInfo, DownloadState, LinkInfo, NO_PARAMETER};

/// A batch submitted through [`Scheduler::create_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct SubmittedBatch {
    pub name: String,
    pub links: Vec<String>,
    pub autostart: bool,
}

/// Keeps downloads in a list and reports every change on a channel.
pub struct MemoryScheduler {
    downloads: Mutex<Vec<DownloadInfo>>,
    submitted: Mutex<Vec<SubmittedBatch>>,
    bandwidth: AtomicU64,
    events: mpsc::UnboundedSender<SchedulerEvent>,
}

impl MemoryScheduler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let scheduler = Self {
            downloads: Mutex::new(Vec::new()),
            submitted: Mutex::new(Vec::new()),
            bandwidth: AtomicU64::new(0),
            events,
        };
        (scheduler, rx)
    }

    /// Every batch ever submitted, in order.
    pub fn submitted(&self) -> Vec<SubmittedBatch> {
        self.submitted.lock().clone()
    }

    pub fn set_bandwidth(&self, bytes_per_sec: u64) {
        self.bandwidth.store(bytes_per_sec, Ordering::Relaxed);
    }

    /// A link store whose changes are reported on this scheduler's channel.
    pub fn link_store(&self, links: Vec<LinkInfo>) -> MemoryLinkStore {
        MemoryLinkStore {
            links: Mutex::new(links),
            events: Some(self.events.clone()),
        }
    }

    /// Report a hoster failure that no client request caused.
    pub fn report_hoster_failure(&self, hoster: &str, reason: &str) {
        self.emit(SchedulerEvent::Failed(SchedulerError::Hoster {
            hoster: hoster.to_string(),
            reason: reason.to_string(),
        }));
    }

    fn emit(&self, event: SchedulerEvent) {
        // A closed receiver only means nobody is listening anymore.
        let _ = self.events.send(event);
    }

    fn set_state(&self, index: u8, state: DownloadState) -> Result<(), SchedulerError> {
        let info = {
            let mut downloads = self.downloads.lock();
            let download = downloads
                .get_mut(index as usize)
                .ok_or(SchedulerError::NoSuchDownload(index))?;
            download.state = state;
            download.clone()
        };
        self.emit(SchedulerEvent::Changed { index, info });
        Ok(())
    }

    fn set_all(&self, state: DownloadState) {
        let changed: Vec<(u8, DownloadInfo)> = {
            let mut downloads = self.downloads.lock();
            downloads
                .iter_mut()
                .enumerate()
                .filter(|(_, d)| d.state != DownloadState::Finished && d.state != state)
                .map(|(i, d)| {
                    d.state = state;
                    (i as u8, d.clone())
                })
                .collect()
        };
        for (index, info) in changed {
            self.emit(SchedulerEvent::Changed { index, info });
        }
    }
}

impl Scheduler for MemoryScheduler {
    fn downloads(&self) -> Vec<DownloadInfo> {
        self.downloads.lock().clone()
    }

    fn create_batch(
        &self,
        name: &str,
        links: Vec<String>,
        autostart: bool,
    ) -> Result<(), SchedulerError> {
        let (index, info) = {
            let mut downloads = self.downloads.lock();
            // NO_PARAMETER is reserved and cannot address a download.
            if downloads.len() >= NO_PARAMETER as usize {
                return Err(SchedulerError::Rejected("download list is full".to_string()));
            }
            let info = DownloadInfo {
                name: name.to_string(),
                state: if autostart {
                    DownloadState::Running
                } else {
                    DownloadState::Queued
                },
                links: links.len() as u32,
                bytes_done: 0,
                bytes_total: 0,
            };
            downloads.push(info.clone());
            ((downloads.len() - 1) as u8, info)
        };
        self.submitted.lock().push(SubmittedBatch {
            name: name.to_string(),
            links,
            autostart,
        });
        self.emit(SchedulerEvent::Added { index, info });
        Ok(())
    }

    fn start(&self, index: u8) -> Result<(), SchedulerError> {
        self.set_state(index, DownloadState::Running)
    }

    fn stop(&self, index: u8) -> Result<(), SchedulerError> {
        self.set_state(index, DownloadState::Stopped)
    }

    fn delete(&self, index: u8) -> Result<(), SchedulerError> {
        {
            let mut downloads = self.downloads.lock();
            if index as usize >= downloads.len() {
                return Err(SchedulerError::NoSuchDownload(index));
            }
            downloads.remove(index as usize);
        }
        self.emit(SchedulerEvent::Removed { index });
        Ok(())
    }

    fn start_all(&self) -> Result<(), SchedulerError> {
        self.set_all(DownloadState::Running);
        Ok(())
    }

    fn stop_all(&self) -> Result<(), SchedulerError> {
        self.set_all(DownloadState::Stopped);
        Ok(())
    }

    fn bandwidth(&self) -> u64 {
        self.bandwidth.load(Ordering::Relaxed)
    }
}

/// List of links, optionally announcing every replacement.
pub struct MemoryLinkStore {
    links: Mutex<Vec<LinkInfo>>,
    events: Option<mpsc::UnboundedSender<SchedulerEvent>>,
}

impl MemoryLinkStore {
    pub fn new(links: Vec<LinkInfo>) -> Self {
        Self {
            links: Mutex::new(links),
            events: None,
        }
    }

    pub fn replace(&self, links: Vec<LinkInfo>) {
        *self.links.lock() = links.clone();
        if let Some(events) = &self.events {
            let _ = events.send(SchedulerEvent::LinksChanged(links));
        }
    }
}

impl Default for MemoryLinkStore {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl LinkStore for MemoryLinkStore {
    fn links(&self) -> Vec<LinkInfo> {
        self.links.lock().clone()
    }
}
