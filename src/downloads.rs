#![forbid(unsafe_code)]

//! Download orchestration: allocates identifiers, pumps extraction streams
//! into staged files, and translates stream events into progress-store
//! updates.
//!
//! One async pump task per download is the sole writer of that download's
//! record. Terminal states are reached exactly once; after a fixed delay the
//! staged file and the record are removed and the identifier is never reused.

use std::path::{Path, PathBuf};
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use crate::extract::{Extractor, FormatSelection, StreamEvent};
use crate::metadata::extract_video_id;
use crate::progress::{
    DownloadRecord, DownloadStatus, ProgressStore, format_transfer_rate, zero_speed,
};

/// Public quality/format enumeration accepted by the download endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadFormat {
    #[serde(rename = "mp4-1080p")]
    Mp4_1080p,
    #[serde(rename = "mp4-720p")]
    Mp4_720p,
    #[serde(rename = "mp4-480p")]
    Mp4_480p,
    #[serde(rename = "mp3")]
    Mp3,
}

impl DownloadFormat {
    /// Extraction hint: audio-only for mp3, otherwise a max-height filter.
    pub fn selection(self) -> FormatSelection {
        match self {
            Self::Mp4_1080p => FormatSelection::video(1080),
            Self::Mp4_720p => FormatSelection::video(720),
            Self::Mp4_480p => FormatSelection::video(480),
            Self::Mp3 => FormatSelection::audio(),
        }
    }

    /// Container extension of the staged output file.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp3 => "mp3",
            _ => "mp4",
        }
    }

    fn slug(self) -> &'static str {
        match self {
            Self::Mp4_1080p => "1080p",
            Self::Mp4_720p => "720p",
            Self::Mp4_480p => "480p",
            Self::Mp3 => "mp3",
        }
    }
}

/// Body of `POST /api/download`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    pub url: String,
    pub format: DownloadFormat,
    #[serde(default)]
    pub video_id: Option<String>,
}

#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<DownloadManagerInner>,
}

struct DownloadManagerInner {
    store: Arc<dyn ProgressStore>,
    extractor: Arc<dyn Extractor>,
    staging_root: PathBuf,
    cleanup_delay: Duration,
    counter: AtomicUsize,
}

impl DownloadManager {
    pub fn new(
        store: Arc<dyn ProgressStore>,
        extractor: Arc<dyn Extractor>,
        staging_root: PathBuf,
        cleanup_delay: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DownloadManagerInner {
                store,
                extractor,
                staging_root,
                cleanup_delay,
                counter: AtomicUsize::new(1),
            }),
        }
    }

    pub fn staged_path(&self, filename: &str) -> PathBuf {
        self.inner.staging_root.join(filename)
    }

    /// Creates the progress record, spawns the pump task, and returns the new
    /// download identifier immediately.
    pub fn start_download(&self, request: DownloadRequest) -> Result<String> {
        let id = self.next_download_id();

        let video_id = request
            .video_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_owned)
            .or_else(|| extract_video_id(&request.url))
            .map(|value| sanitize_filename_component(&value))
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| "video".to_string());

        // The id in the filename keeps concurrent downloads of the same
        // video/format pair from clobbering each other's staged file.
        let filename = format!(
            "{video_id}_{}_{id}.{}",
            request.format.slug(),
            request.format.extension()
        );

        std::fs::create_dir_all(&self.inner.staging_root).with_context(|| {
            format!("creating {}", self.inner.staging_root.display())
        })?;

        self.inner
            .store
            .put(DownloadRecord::new(id.clone(), filename.clone()));

        let inner = self.inner.clone();
        let path = self.staged_path(&filename);
        let task_id = id.clone();
        let selection = request.format.selection();
        tokio::spawn(async move {
            run_download(inner, task_id, request.url, selection, path).await;
        });

        Ok(id)
    }

    /// Fire-and-forget removal of the staged file and record after the fixed
    /// delay. Both deletes are idempotent, so scheduling twice (completion
    /// plus delivery) is harmless.
    pub fn schedule_cleanup(&self, id: &str, filename: &str) {
        schedule_cleanup(&self.inner, id, &self.staged_path(filename));
    }

    fn next_download_id(&self) -> String {
        let id = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        format!("download-{id}")
    }
}

fn schedule_cleanup(inner: &Arc<DownloadManagerInner>, id: &str, path: &Path) {
    let inner = inner.clone();
    let id = id.to_string();
    let path = path.to_path_buf();
    tokio::spawn(async move {
        tokio::time::sleep(inner.cleanup_delay).await;
        remove_staged_file(&path).await;
        inner.store.delete(&id);
    });
}

async fn remove_staged_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => eprintln!("Failed to remove staged file {}: {err}", path.display()),
    }
}

/// Pump task: consumes the extraction stream and mirrors it into the store.
async fn run_download(
    inner: Arc<DownloadManagerInner>,
    id: String,
    url: String,
    selection: FormatSelection,
    path: PathBuf,
) {
    let extractor = inner.extractor.clone();
    let stream_url = url.clone();
    let opened = tokio::task::spawn_blocking(move || {
        extractor.open_stream(&stream_url, &selection)
    })
    .await;

    let mut handle = match opened {
        Ok(Ok(handle)) => handle,
        Ok(Err(err)) => {
            fail_download(&inner, &id, &path, &err.to_string()).await;
            return;
        }
        Err(err) => {
            fail_download(&inner, &id, &path, &err.to_string()).await;
            return;
        }
    };

    let mut file = match tokio::fs::File::create(&path).await {
        Ok(file) => file,
        Err(err) => {
            fail_download(&inner, &id, &path, &err.to_string()).await;
            return;
        }
    };

    let Some(mut record) = inner.store.get(&id) else {
        return;
    };

    let started = Instant::now();
    let mut downloaded: u64 = 0;
    let mut total: u64 = 0;

    loop {
        match handle.events.recv().await {
            Some(StreamEvent::Info { total_bytes }) => {
                total = total_bytes.unwrap_or(0);
                record.total_bytes = total;
                inner.store.put(record.clone());
            }
            Some(StreamEvent::Chunk(chunk)) => {
                if let Err(err) = file.write_all(&chunk).await {
                    fail_download(&inner, &id, &path, &err.to_string()).await;
                    return;
                }
                downloaded += chunk.len() as u64;
                if total > 0 {
                    // A lying content length must not push us past 100%.
                    downloaded = downloaded.min(total);
                }
                record.downloaded_bytes = downloaded;
                record.progress = displayed_progress(downloaded, total);
                record.speed = current_rate(downloaded, started.elapsed());
                inner.store.put(record.clone());
            }
            Some(StreamEvent::End) => {
                if let Err(err) = file.flush().await {
                    fail_download(&inner, &id, &path, &err.to_string()).await;
                    return;
                }
                let final_total = if total > 0 { total } else { downloaded };
                record.total_bytes = final_total;
                record.downloaded_bytes = final_total;
                record.progress = 100;
                record.speed = zero_speed();
                record.status = DownloadStatus::Completed;
                inner.store.put(record.clone());
                schedule_cleanup(&inner, &id, &path);
                return;
            }
            Some(StreamEvent::Error(message)) => {
                fail_download(&inner, &id, &path, &message).await;
                return;
            }
            // Producer vanished without a terminal event.
            None => {
                fail_download(&inner, &id, &path, "extraction stream ended unexpectedly").await;
                return;
            }
        }
    }
}

/// Progress shown while bytes are still arriving: 0 when the total is
/// unknown, otherwise rounded percent capped at 99 so clients never see a
/// premature "done".
fn displayed_progress(downloaded: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let percent = ((downloaded as f64 / total as f64) * 100.0).round() as u8;
    percent.min(99)
}

fn current_rate(downloaded: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return zero_speed();
    }
    format_transfer_rate(downloaded as f64 / secs)
}

/// Terminal error transition: counters reset to zero, partial file removed,
/// record removal scheduled after the usual delay.
async fn fail_download(inner: &Arc<DownloadManagerInner>, id: &str, path: &Path, message: &str) {
    eprintln!("Download {id} failed: {message}");
    // File first: by the time pollers see the error status the partial
    // artifact is already gone.
    remove_staged_file(path).await;
    if let Some(mut record) = inner.store.get(id) {
        record.status = DownloadStatus::Error;
        record.progress = 0;
        record.downloaded_bytes = 0;
        record.total_bytes = 0;
        record.speed = zero_speed();
        inner.store.put(record);
    }
    schedule_cleanup(inner, id, path);
}

/// The video id is caller-supplied; anything that could escape the staging
/// directory or upset a filesystem is flattened to underscores.
fn sanitize_filename_component(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// Removes leftover staged files from a previous process. The progress store
/// is volatile, so anything still on disk at startup is unreachable.
pub fn sweep_staging_root(staging_root: &Path) -> Result<usize> {
    if !staging_root.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in WalkDir::new(staging_root).min_depth(1).max_depth(1) {
        let entry = entry.context("scanning staging root")?;
        if entry.file_type().is_file() {
            std::fs::remove_file(entry.path())
                .with_context(|| format!("removing {}", entry.path().display()))?;
            removed += 1;
        }
    }
    Ok(removed)
}
