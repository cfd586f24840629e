#![forbid(unsafe_code)]

//! In-memory progress tracking for downloads.
//!
//! The store is the single source of truth polled by clients. It is kept
//! behind the [`ProgressStore`] trait so the orchestrator never cares whether
//! records live in a process-local map or an external cache.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Lifecycle of a single download. Transitions are one-directional:
/// `Downloading` into either terminal state, never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Downloading,
    Completed,
    Error,
}

/// Snapshot of one in-flight or finished download, serialized camelCase for
/// the polling endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRecord {
    pub id: String,
    pub filename: String,
    /// 0-100. Held at 99 while bytes are still arriving; 100 only once the
    /// stream has truly ended.
    pub progress: u8,
    pub downloaded_bytes: u64,
    /// 0 until the extraction stream reports a content length.
    pub total_bytes: u64,
    pub speed: String,
    pub status: DownloadStatus,
    pub started_at: DateTime<Utc>,
}

impl DownloadRecord {
    pub fn new(id: String, filename: String) -> Self {
        Self {
            id,
            filename,
            progress: 0,
            downloaded_bytes: 0,
            total_bytes: 0,
            speed: zero_speed(),
            status: DownloadStatus::Downloading,
            started_at: Utc::now(),
        }
    }
}

/// The label used whenever no transfer is in flight.
pub fn zero_speed() -> String {
    "0 B/s".to_string()
}

/// Renders a transfer rate the way the progress widget displays it.
pub fn format_transfer_rate(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= 1024.0 * 1024.0 {
        format!("{:.1} MB/s", bytes_per_sec / (1024.0 * 1024.0))
    } else if bytes_per_sec >= 1024.0 {
        format!("{:.1} KB/s", bytes_per_sec / 1024.0)
    } else if bytes_per_sec > 0.0 {
        format!("{:.0} B/s", bytes_per_sec)
    } else {
        zero_speed()
    }
}

/// Keyed collection of [`DownloadRecord`]s.
///
/// `put` is a full overwrite, never a merge; `delete` is idempotent. The
/// orchestrator is the only writer for a given id, so readers either see the
/// previous snapshot or the new one, never a partial update.
pub trait ProgressStore: Send + Sync + 'static {
    fn put(&self, record: DownloadRecord);
    fn get(&self, id: &str) -> Option<DownloadRecord>;
    fn delete(&self, id: &str);
}

/// Default process-local store. All state is lost on restart, which is fine:
/// staged files from a previous run are swept at startup anyway.
#[derive(Default)]
pub struct MemoryProgressStore {
    records: RwLock<HashMap<String, DownloadRecord>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for MemoryProgressStore {
    fn put(&self, record: DownloadRecord) {
        self.records.write().insert(record.id.clone(), record);
    }

    fn get(&self, id: &str) -> Option<DownloadRecord> {
        self.records.read().get(id).cloned()
    }

    fn delete(&self, id: &str) {
        self.records.write().remove(id);
    }
}
