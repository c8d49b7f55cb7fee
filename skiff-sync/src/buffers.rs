//! Fixed-memory history buffers.
//!
//! Two kinds of history seed the Setup snapshot of a new connection:
//!
//! ```text
//! RollingBuffer (disk %, bandwidth)       LogBuffer (severity-tagged text)
//! ┌────┬────┬─────┬────┐                  ┌──────┬──────┬─────┬──────┐
//! │ s0 │ s1 │ ... │ s30│  K = 31          │ #n-4999 │ ... │ #n   │  cap 5000
//! └────┴────┴─────┴────┘                  └──────┴──────┴─────┴──────┘
//!  oldest        newest                    watermark = max severity since clear
//! ```
//!
//! Each buffer carries its own lock so that monitor updates never contend
//! with the connection registry or with each other.

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Samples held by a rolling buffer: the current value plus 30 of history.
pub const HISTORY_CAPACITY: usize = 31;

/// Maximum number of retained log records.
pub const LOG_CAPACITY: usize = 5000;

/// Fixed-capacity sample history with oldest-first eviction.
///
/// The first sample pre-fills every slot, so an initialized buffer always
/// holds exactly `capacity` samples and a chart never ramps up from zero.
pub struct RollingBuffer {
    capacity: usize,
    samples: Mutex<VecDeque<u64>>,
}

impl RollingBuffer {
    /// Create a buffer holding [`HISTORY_CAPACITY`] samples.
    pub fn new() -> Self {
        Self::with_capacity(HISTORY_CAPACITY)
    }

    /// Create a buffer with a custom capacity (minimum 1).
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a sample, evicting the oldest one.
    pub fn push(&self, sample: u64) {
        let mut samples = self.samples.lock();
        if samples.is_empty() {
            samples.extend(std::iter::repeat(sample).take(self.capacity));
            return;
        }
        samples.pop_front();
        samples.push_back(sample);
    }

    /// Most recent sample, if initialized.
    pub fn latest(&self) -> Option<u64> {
        self.samples.lock().back().copied()
    }

    /// Copy of the history, oldest first.
    pub fn snapshot(&self) -> Vec<u64> {
        self.samples.lock().iter().copied().collect()
    }

    /// Drop all samples; the next push pre-fills again.
    pub fn clear(&self) {
        self.samples.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for RollingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Trace,
    Debug,
    Info,
    Warning,
    Error,
}

/// One immutable log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Strictly increasing, never reused
    pub index: u64,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub severity: Severity,
    pub message: String,
}

/// Retained records plus the watermark, as sent in the Setup snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSnapshot {
    pub records: Vec<LogRecord>,
    pub watermark: Option<Severity>,
}

struct LogState {
    records: VecDeque<LogRecord>,
    next_index: u64,
    watermark: Option<Severity>,
}

/// Capped FIFO of log records with a severity watermark.
pub struct LogBuffer {
    capacity: usize,
    state: Mutex<LogState>,
}

impl LogBuffer {
    /// Create a buffer holding up to [`LOG_CAPACITY`] records.
    pub fn new() -> Self {
        Self::with_capacity(LOG_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LogState {
                records: VecDeque::new(),
                next_index: 1,
                watermark: None,
            }),
        }
    }

    /// Append a record and return a copy of it.
    pub fn push(&self, severity: Severity, message: impl Into<String>) -> LogRecord {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        let mut state = self.state.lock();
        let record = LogRecord {
            index: state.next_index,
            timestamp_ms,
            severity,
            message: message.into(),
        };
        state.next_index += 1;
        state.watermark = Some(match state.watermark {
            Some(current) => current.max(severity),
            None => severity,
        });
        state.records.push_back(record.clone());
        while state.records.len() > self.capacity {
            state.records.pop_front();
        }
        record
    }

    /// Empty the buffer and reset the watermark. Indices keep counting.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.records.clear();
        state.watermark = None;
    }

    pub fn snapshot(&self) -> LogSnapshot {
        let state = self.state.lock();
        LogSnapshot {
            records: state.records.iter().cloned().collect(),
            watermark: state.watermark,
        }
    }

    /// Highest severity appended since the last clear.
    pub fn watermark(&self) -> Option<Severity> {
        self.state.lock().watermark
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_rolling_first_sample_prefills() {
        let buffer = RollingBuffer::new();
        assert!(buffer.is_empty());

        buffer.push(17);
        assert_eq!(buffer.len(), HISTORY_CAPACITY);
        assert!(buffer.snapshot().iter().all(|s| *s == 17));
        assert_eq!(buffer.latest(), Some(17));
    }

    #[test]
    fn test_rolling_keeps_last_samples_oldest_first() {
        let buffer = RollingBuffer::new();
        buffer.push(1000);
        for sample in 0..40u64 {
            buffer.push(sample);
        }

        let expected: Vec<u64> = (9..40).collect();
        assert_eq!(buffer.len(), 31);
        assert_eq!(buffer.snapshot(), expected);
    }

    #[test]
    fn test_rolling_partial_fill_keeps_prefill() {
        let buffer = RollingBuffer::with_capacity(4);
        buffer.push(5);
        buffer.push(6);
        assert_eq!(buffer.snapshot(), vec![5, 5, 5, 6]);
    }

    #[test]
    fn test_rolling_clear_resets_prefill() {
        let buffer = RollingBuffer::with_capacity(3);
        buffer.push(1);
        buffer.push(2);
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.latest(), None);

        buffer.push(9);
        assert_eq!(buffer.snapshot(), vec![9, 9, 9]);
    }

    #[test]
    fn test_rolling_concurrent_pushes_keep_capacity() {
        let buffer = Arc::new(RollingBuffer::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let buffer = buffer.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        buffer.push(t * 100 + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(buffer.len(), HISTORY_CAPACITY);
    }

    #[test]
    fn test_log_eviction_keeps_indices() {
        let logs = LogBuffer::new();
        for i in 0..5001 {
            logs.push(Severity::Info, format!("line {i}"));
        }

        let snapshot = logs.snapshot();
        assert_eq!(snapshot.records.len(), 5000);
        assert_eq!(snapshot.records.first().map(|r| r.index), Some(2));
        assert_eq!(snapshot.records.last().map(|r| r.index), Some(5001));
    }

    #[test]
    fn test_log_watermark_tracks_max() {
        let logs = LogBuffer::new();
        assert_eq!(logs.watermark(), None);

        logs.push(Severity::Info, "a");
        logs.push(Severity::Error, "b");
        logs.push(Severity::Debug, "c");
        assert_eq!(logs.watermark(), Some(Severity::Error));
    }

    #[test]
    fn test_log_clear_resets_watermark_not_index() {
        let logs = LogBuffer::new();
        logs.push(Severity::Warning, "a");
        logs.push(Severity::Error, "b");

        logs.clear();
        assert_eq!(logs.len(), 0);
        assert_eq!(logs.watermark(), None);

        let next = logs.push(Severity::Info, "c");
        assert_eq!(next.index, 3);
        assert_eq!(logs.watermark(), Some(Severity::Info));
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Trace < Severity::Info);
    }
}
