//! Sequence-keyed buffer of recent log entries.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::store::RingStore;

/// Severity of a [LogEntry].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Per-cycle diagnostics.
    Debug,
    /// Normal operational events.
    Info,
    /// Degraded but recoverable conditions.
    Warn,
    /// Failed operations.
    Error,
}

/// One observable log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the entry was recorded.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
}

/// Bounded log history keyed by a monotonically increasing sequence number.
///
/// The sequence is the sole ordering key for retrieval. Every record is also
/// forwarded to `tracing` at the matching level, so embedders get structured
/// output without consuming the ring.
#[derive(Debug)]
pub(crate) struct EventLog {
    seq: AtomicU64,
    entries: Mutex<RingStore<u64, LogEntry>>,
}

impl EventLog {
    pub(crate) fn new(max_entries: usize) -> Self {
        Self {
            seq: AtomicU64::new(0),
            entries: Mutex::new(RingStore::new(max_entries)),
        }
    }

    pub(crate) fn record(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Debug => tracing::debug!(target: "autortt", "{message}"),
            LogLevel::Info => tracing::info!(target: "autortt", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "autortt", "{message}"),
            LogLevel::Error => tracing::error!(target: "autortt", "{message}"),
        }

        // Sequence assignment and admission happen under one lock so ring
        // order always matches sequence order.
        let mut entries = self.entries.lock();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        entries.put(
            seq,
            LogEntry {
                timestamp: Utc::now(),
                level,
                message,
            },
        );
    }

    /// Recent entries, sequence-ordered.
    pub(crate) fn recent(&self) -> Vec<LogEntry> {
        self.entries.lock().snapshot()
    }
}
