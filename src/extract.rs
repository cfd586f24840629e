#![forbid(unsafe_code)]

//! Extraction seam between the orchestrator and whatever actually produces
//! the media bytes.
//!
//! Production uses [`YtDlpExtractor`], which shells out to `yt-dlp`: video
//! formats are relayed straight from the tool's stdout, audio is converted
//! in a scratch directory and relayed from disk. Tests plug in scripted
//! extractors, so everything above this module stays independent of the
//! real tool.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::metadata::{self, MediaInfo};

/// Quality requested from the extractor, already mapped from the public
/// format enumeration by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSelection {
    /// Maximum video height, `None` for audio-only downloads.
    pub max_height: Option<u32>,
    pub audio_only: bool,
}

impl FormatSelection {
    pub fn video(max_height: u32) -> Self {
        Self {
            max_height: Some(max_height),
            audio_only: false,
        }
    }

    pub fn audio() -> Self {
        Self {
            max_height: None,
            audio_only: true,
        }
    }
}

/// Lifecycle events of one extraction stream, in arrival order: one `Info`,
/// any number of `Chunk`s, then exactly one of `End` or `Error`.
#[derive(Debug)]
pub enum StreamEvent {
    Info { total_bytes: Option<u64> },
    Chunk(Vec<u8>),
    End,
    Error(String),
}

/// Receiving half of an open extraction stream. Dropping it tears the
/// producer down.
pub struct StreamHandle {
    pub events: mpsc::Receiver<StreamEvent>,
}

/// Capability interface for metadata lookups and byte streams.
///
/// Both calls may block (process spawns, network); callers run them under
/// `spawn_blocking`.
pub trait Extractor: Send + Sync + 'static {
    fn fetch_info(&self, url: &str) -> Result<MediaInfo>;
    fn open_stream(&self, url: &str, selection: &FormatSelection) -> Result<StreamHandle>;
}

/// Chunk size for relaying stdout; 64 KiB keeps progress updates frequent
/// without drowning the store in writes.
const RELAY_CHUNK_BYTES: usize = 64 * 1024;

/// Buffered events between the reader thread and the async pump task.
const EVENT_CHANNEL_CAPACITY: usize = 32;

pub struct YtDlpExtractor {
    command: PathBuf,
}

impl Default for YtDlpExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl YtDlpExtractor {
    pub fn new() -> Self {
        Self {
            command: PathBuf::from("yt-dlp"),
        }
    }

    /// Points the extractor at a different executable. Used by tests that
    /// substitute a stub script for the real binary.
    pub fn with_command(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
        }
    }

    fn dump_json(&self, url: &str, flat_playlist: bool) -> Result<Value> {
        let mut command = Command::new(&self.command);
        command
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings");
        if flat_playlist {
            command.arg("--flat-playlist");
        }
        let output = command
            .arg(url)
            .output()
            .with_context(|| format!("launching {}", self.command.display()))?;
        if !output.status.success() {
            bail!(
                "yt-dlp metadata fetch failed for {url} (status {})",
                output.status
            );
        }
        serde_json::from_slice(&output.stdout).context("parsing yt-dlp metadata")
    }

    /// Audio cannot stream from stdout: the mp3 conversion needs a seekable
    /// output file. Run the tool to completion against a scratch directory,
    /// then relay the converted file from disk. The total is unknown until
    /// the conversion finishes, so `Info` carries `None`.
    fn open_audio_stream(&self, url: &str) -> Result<StreamHandle> {
        let workdir = tempfile::tempdir().context("creating audio scratch directory")?;
        let template = workdir.path().join("audio.%(ext)s");

        let child = Command::new(&self.command)
            .arg("-f")
            .arg(format_selector(&FormatSelection::audio()))
            .arg("--extract-audio")
            .arg("--audio-format")
            .arg("mp3")
            .arg("--no-part")
            .arg("--quiet")
            .arg("--no-warnings")
            .arg("-o")
            .arg(&template)
            .arg(url)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("launching {}", self.command.display()))?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        thread::spawn(move || {
            if tx
                .blocking_send(StreamEvent::Info { total_bytes: None })
                .is_err()
            {
                return;
            }

            let output = match child.wait_with_output() {
                Ok(output) => output,
                Err(err) => {
                    let _ = tx.blocking_send(StreamEvent::Error(err.to_string()));
                    return;
                }
            };
            if !output.status.success() {
                let stderr_text = String::from_utf8_lossy(&output.stderr);
                let _ = tx.blocking_send(StreamEvent::Error(format!(
                    "yt-dlp exited with {}: {}",
                    output.status,
                    stderr_text.trim()
                )));
                return;
            }

            let converted = workdir.path().join("audio.mp3");
            let mut file = match std::fs::File::open(&converted) {
                Ok(file) => file,
                Err(err) => {
                    let _ = tx.blocking_send(StreamEvent::Error(format!(
                        "converted audio missing: {err}"
                    )));
                    return;
                }
            };

            let mut buf = vec![0u8; RELAY_CHUNK_BYTES];
            loop {
                match file.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(StreamEvent::Chunk(buf[..n].to_vec())).is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = tx.blocking_send(StreamEvent::Error(err.to_string()));
                        return;
                    }
                }
            }
            let _ = tx.blocking_send(StreamEvent::End);
            // workdir drops here, removing the converted file.
        });

        Ok(StreamHandle { events: rx })
    }
}

impl Extractor for YtDlpExtractor {
    fn fetch_info(&self, url: &str) -> Result<MediaInfo> {
        let playlist = metadata::is_playlist_url(url);
        let raw = self.dump_json(url, playlist)?;
        if playlist || raw.get("_type").and_then(Value::as_str) == Some("playlist") {
            Ok(MediaInfo::Playlist(metadata::playlist_info_from_ytdlp(
                &raw, url,
            )?))
        } else {
            Ok(MediaInfo::Video(metadata::video_info_from_ytdlp(&raw, url)?))
        }
    }

    fn open_stream(&self, url: &str, selection: &FormatSelection) -> Result<StreamHandle> {
        if selection.audio_only {
            return self.open_audio_stream(url);
        }

        // Probe the content length up front so the first event can carry it;
        // yt-dlp does not emit a usable length once it streams to stdout.
        let total_bytes = match self.dump_json(url, false) {
            Ok(raw) => probe_total_bytes(&raw),
            Err(_) => None,
        };

        let mut command = Command::new(&self.command);
        command
            .arg("-f")
            .arg(format_selector(selection))
            .arg("--no-part")
            .arg("--quiet")
            .arg("--no-warnings");
        let mut child = command
            .arg("-o")
            .arg("-")
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("launching {}", self.command.display()))?;

        let mut stdout = child
            .stdout
            .take()
            .context("capturing yt-dlp stdout")?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        thread::spawn(move || {
            if tx
                .blocking_send(StreamEvent::Info { total_bytes })
                .is_err()
            {
                let _ = child.kill();
                return;
            }

            let mut buf = vec![0u8; RELAY_CHUNK_BYTES];
            loop {
                match stdout.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(StreamEvent::Chunk(buf[..n].to_vec())).is_err() {
                            // Consumer is gone; stop the producer as well.
                            let _ = child.kill();
                            let _ = child.wait();
                            return;
                        }
                    }
                    Err(err) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = tx.blocking_send(StreamEvent::Error(err.to_string()));
                        return;
                    }
                }
            }

            let mut stderr_text = String::new();
            if let Some(mut stderr) = child.stderr.take() {
                let _ = stderr.read_to_string(&mut stderr_text);
            }

            let event = match child.wait() {
                Ok(status) if status.success() => StreamEvent::End,
                Ok(status) => StreamEvent::Error(format!(
                    "yt-dlp exited with {status}: {}",
                    stderr_text.trim()
                )),
                Err(err) => StreamEvent::Error(err.to_string()),
            };
            let _ = tx.blocking_send(event);
        });

        Ok(StreamHandle { events: rx })
    }
}

/// yt-dlp format expression for the requested selection.
fn format_selector(selection: &FormatSelection) -> String {
    if selection.audio_only {
        return "bestaudio[ext=m4a]/bestaudio/best".to_string();
    }
    match selection.max_height {
        Some(height) => {
            format!("best[height<={height}][ext=mp4]/best[height<={height}]/best")
        }
        None => "best".to_string(),
    }
}

fn probe_total_bytes(raw: &Value) -> Option<u64> {
    raw.get("filesize")
        .and_then(Value::as_u64)
        .or_else(|| raw.get("filesize_approx").and_then(Value::as_u64))
}
