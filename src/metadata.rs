#![forbid(unsafe_code)]

//! Wire-format metadata for the fetch-info endpoint.
//!
//! The structs here mirror the JSON the web client consumes: a `video` or
//! `playlist` envelope with camelCase fields. The module also owns YouTube
//! URL classification and the normalization of raw yt-dlp JSON into those
//! structs.

use anyhow::{Result, anyhow};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata for a single video as shown in the preview card.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub thumbnail: String,
    pub duration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_date: Option<String>,
    pub url: String,
}

/// One row of a playlist preview. Lighter than [`VideoInfo`] because the
/// client only renders title, thumbnail and duration per entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistEntry {
    pub id: String,
    pub title: String,
    pub thumbnail: String,
    pub duration: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub video_count: usize,
    pub total_duration: String,
    pub videos: Vec<PlaylistEntry>,
}

/// Envelope returned by `POST /api/fetch-info`: `{"type": "video", "data":
/// {...}}` or the playlist equivalent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum MediaInfo {
    Video(VideoInfo),
    Playlist(PlaylistInfo),
}

/// Accepts `youtube.com` (any subdomain) and `youtu.be` links over http(s).
pub fn is_youtube_url(url: &str) -> bool {
    let rest = match url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
    {
        Some(rest) => rest,
        None => return false,
    };
    let host = rest.split(['/', '?', '#']).next().unwrap_or("");
    let host = host.split('@').next_back().unwrap_or("");
    let host = host.split(':').next().unwrap_or("");
    host == "youtube.com" || host.ends_with(".youtube.com") || host == "youtu.be"
}

/// A URL carrying a `list=` query parameter is treated as a playlist.
pub fn is_playlist_url(url: &str) -> bool {
    url.split_once('?')
        .map(|(_, query)| {
            query
                .split('&')
                .any(|pair| pair.starts_with("list=") && pair.len() > "list=".len())
        })
        .unwrap_or(false)
}

/// Pulls the video id out of `watch?v=` and `youtu.be/` style links.
pub fn extract_video_id(url: &str) -> Option<String> {
    let candidate = if let Some((_, rest)) = url.split_once("watch?v=") {
        rest
    } else if let Some((_, rest)) = url.split_once("youtu.be/") {
        rest
    } else {
        return None;
    };
    let id: String = candidate
        .chars()
        .take_while(|c| !matches!(c, '&' | '?' | '#' | '/'))
        .collect();
    if id.is_empty() { None } else { Some(id) }
}

pub fn extract_playlist_id(url: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("list=")
            && !value.is_empty()
        {
            return Some(value.to_string());
        }
    }
    None
}

/// Renders durations as `H:MM:SS` or `M:SS` for short clips.
pub fn format_duration(duration: i64) -> String {
    let hours = duration / 3600;
    let minutes = (duration % 3600) / 60;
    let seconds = duration % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

/// Compact view-count labels in the style YouTube itself uses.
pub fn format_view_count(views: i64) -> String {
    let views = views.max(0) as f64;
    if views >= 1e9 {
        format!("{:.1}B views", views / 1e9)
    } else if views >= 1e6 {
        format!("{:.1}M views", views / 1e6)
    } else if views >= 1e3 {
        format!("{:.1}K views", views / 1e3)
    } else {
        format!("{views} views")
    }
}

/// Builds a [`VideoInfo`] from a yt-dlp `--dump-single-json` payload.
pub fn video_info_from_ytdlp(info: &Value, url: &str) -> Result<VideoInfo> {
    let id = info
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| extract_video_id(url))
        .ok_or_else(|| anyhow!("video id missing from metadata"))?;

    let title = string_field(info, "fulltitle")
        .or_else(|| string_field(info, "title"))
        .unwrap_or_else(|| id.clone());

    let thumbnail = string_field(info, "thumbnail")
        .unwrap_or_else(|| format!("https://i.ytimg.com/vi/{id}/maxresdefault.jpg"));

    let duration = info
        .get("duration")
        .and_then(Value::as_f64)
        .map(|secs| format_duration(secs as i64))
        .unwrap_or_else(|| "0:00".to_string());

    let view_count = info
        .get("view_count")
        .and_then(Value::as_i64)
        .map(format_view_count);

    let publish_date = string_field(info, "upload_date")
        .as_deref()
        .and_then(upload_date_to_iso);

    Ok(VideoInfo {
        id,
        title,
        description: string_field(info, "description").filter(|d| !d.is_empty()),
        thumbnail,
        duration,
        view_count,
        publish_date,
        url: url.to_string(),
    })
}

/// Builds a [`PlaylistInfo`] from a yt-dlp flat-playlist dump. Entries with
/// no id are skipped rather than failing the whole listing.
pub fn playlist_info_from_ytdlp(info: &Value, url: &str) -> Result<PlaylistInfo> {
    let id = info
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| extract_playlist_id(url))
        .ok_or_else(|| anyhow!("playlist id missing from metadata"))?;

    let title = string_field(info, "title").unwrap_or_else(|| id.clone());

    let mut videos = Vec::new();
    let mut total_secs = 0i64;
    if let Some(entries) = info.get("entries").and_then(Value::as_array) {
        for entry in entries {
            let Some(entry_id) = entry.get("id").and_then(Value::as_str) else {
                continue;
            };
            let secs = entry.get("duration").and_then(Value::as_f64).unwrap_or(0.0) as i64;
            total_secs += secs;
            videos.push(PlaylistEntry {
                id: entry_id.to_string(),
                title: string_field(entry, "title").unwrap_or_else(|| entry_id.to_string()),
                thumbnail: string_field(entry, "thumbnail").unwrap_or_else(|| {
                    format!("https://i.ytimg.com/vi/{entry_id}/maxresdefault.jpg")
                }),
                duration: format_duration(secs),
                url: format!("https://youtube.com/watch?v={entry_id}"),
            });
        }
    }

    Ok(PlaylistInfo {
        id,
        title,
        description: string_field(info, "description").filter(|d| !d.is_empty()),
        video_count: videos.len(),
        total_duration: format_duration(total_secs),
        videos,
    })
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_owned)
}

/// yt-dlp reports upload dates as `YYYYMMDD`.
fn upload_date_to_iso(raw: &str) -> Option<String> {
    let date = NaiveDate::parse_from_str(raw.trim(), "%Y%m%d").ok()?;
    Some(date.format("%Y-%m-%d").to_string())
}
