#![forbid(unsafe_code)]

//! Axum backend for tubegrab.
//!
//! Four JSON endpoints drive the whole flow: fetch-info resolves metadata for
//! a pasted URL, download starts an extraction into the staging directory,
//! progress exposes the polled record, and file delivers the finished bytes.
//! Everything else served from here is the static web client.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, State},
    http::{HeaderMap, Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mime_guess::MimeGuess;
use serde::{Deserialize, Serialize};
use tokio::{fs::File, signal};
use tokio_util::io::ReaderStream;
use tubegrab::config::{ConfigOverrides, resolve_runtime_config};
use tubegrab::downloads::{DownloadManager, DownloadRequest, sweep_staging_root};
use tubegrab::extract::{Extractor, YtDlpExtractor};
use tubegrab::metadata::{MediaInfo, is_youtube_url};
use tubegrab::progress::{DownloadRecord, DownloadStatus, MemoryProgressStore, ProgressStore};
use tubegrab::security::ensure_not_root;

#[derive(Debug, Clone)]
struct BackendArgs {
    staging_root: PathBuf,
    www_root: PathBuf,
    port: u16,
    listen_host: IpAddr,
    cleanup_delay: Duration,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut staging_root_override: Option<PathBuf> = None;
        let mut www_root_override: Option<PathBuf> = None;
        let mut port_override: Option<u16> = None;
        let mut host_override: Option<IpAddr> = None;
        let mut cleanup_override: Option<u64> = None;
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--staging-root=") {
                staging_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--www-root=") {
                www_root_override = Some(PathBuf::from(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                port_override = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--host=") {
                host_override = Some(parse_host_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--cleanup-delay=") {
                cleanup_override = Some(parse_delay_arg(value)?);
                continue;
            }

            match arg.as_str() {
                "--staging-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--staging-root requires a value"))?;
                    staging_root_override = Some(PathBuf::from(value));
                }
                "--www-root" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--www-root requires a value"))?;
                    www_root_override = Some(PathBuf::from(value));
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    port_override = Some(parse_port_arg(&value)?);
                }
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    host_override = Some(parse_host_arg(&value)?);
                }
                "--cleanup-delay" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--cleanup-delay requires a value"))?;
                    cleanup_override = Some(parse_delay_arg(&value)?);
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }

        let runtime = resolve_runtime_config(ConfigOverrides {
            staging_root: staging_root_override,
            www_root: www_root_override,
            port: port_override,
            host: None,
            cleanup_delay_secs: cleanup_override,
            env_path: None,
        })?;
        let listen_host = match host_override {
            Some(host) => host,
            None => parse_host_arg(&runtime.host)?,
        };

        Ok(Self {
            staging_root: runtime.staging_root,
            www_root: runtime.www_root,
            port: runtime.port,
            listen_host,
            cleanup_delay: Duration::from_secs(runtime.cleanup_delay_secs),
        })
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBEGRAB_HOST")
}

fn parse_delay_arg(value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .context("expected a number of seconds for --cleanup-delay")
}

/// Shared state injected into every Axum handler.
///
/// * `store` is polled directly by the progress endpoint.
/// * `downloads` owns staged files and the per-download pump tasks.
/// * `extractor` resolves metadata; it may block, so handlers call it via
///   `spawn_blocking`.
#[derive(Clone)]
struct AppState {
    store: Arc<dyn ProgressStore>,
    downloads: DownloadManager,
    extractor: Arc<dyn Extractor>,
    www_root: Arc<PathBuf>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, "application/json".parse().unwrap());
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, headers, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let BackendArgs {
        staging_root,
        www_root,
        port,
        listen_host,
        cleanup_delay,
    } = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    // Progress state is volatile, so staged files from a previous run can
    // never be delivered again; drop them before accepting requests.
    let swept = sweep_staging_root(&staging_root)
        .with_context(|| format!("sweeping {}", staging_root.display()))?;
    if swept > 0 {
        println!("Removed {swept} stale staged file(s) from previous run");
    }

    let store: Arc<dyn ProgressStore> = Arc::new(MemoryProgressStore::new());
    let extractor: Arc<dyn Extractor> = Arc::new(YtDlpExtractor::new());
    let downloads = DownloadManager::new(
        store.clone(),
        extractor.clone(),
        staging_root,
        cleanup_delay,
    );

    let state = AppState {
        store,
        downloads,
        extractor,
        www_root: Arc::new(www_root),
    };

    let app = router(state);

    let addr = SocketAddr::new(listen_host, port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    println!("API server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/fetch-info", post(fetch_info))
        .route("/api/download", post(start_download))
        .route("/api/download/{id}/progress", get(get_download_progress))
        .route("/api/download/{id}/file", get(download_file))
        .fallback(static_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    // Graceful shutdown listens for Ctrl+C only; if the handler cannot be
    // installed the server just runs until killed.
    if let Err(err) = signal::ctrl_c().await {
        eprintln!("Ctrl+C handler unavailable: {err}");
    }
}

#[derive(Deserialize)]
struct FetchInfoRequest {
    url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DownloadStarted {
    download_id: String,
    message: String,
}

async fn fetch_info(
    State(state): State<AppState>,
    Json(payload): Json<FetchInfoRequest>,
) -> ApiResult<Json<MediaInfo>> {
    let url = payload.url.trim().to_string();
    if !is_youtube_url(&url) {
        return Err(ApiError::bad_request("please enter a valid YouTube URL"));
    }

    let extractor = state.extractor.clone();
    let info = tokio::task::spawn_blocking(move || extractor.fetch_info(&url))
        .await
        .map_err(|err| ApiError::internal(err.to_string()))?
        .map_err(|err| ApiError::bad_request(err.to_string()))?;

    Ok(Json(info))
}

async fn start_download(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult<Json<DownloadStarted>> {
    // Deserialized by hand: a bad shape (unknown format, missing field) must
    // come back as a 400 with the JSON error body, not the extractor's 422.
    let request: DownloadRequest = serde_json::from_value(payload)
        .map_err(|err| ApiError::bad_request(format!("invalid download request: {err}")))?;

    if !is_youtube_url(request.url.trim()) {
        return Err(ApiError::bad_request("please enter a valid YouTube URL"));
    }

    let download_id = state
        .downloads
        .start_download(request)
        .map_err(|err| ApiError::internal(err.to_string()))?;

    Ok(Json(DownloadStarted {
        download_id,
        message: "Download started".to_string(),
    }))
}

async fn get_download_progress(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Json<DownloadRecord>> {
    state
        .store
        .get(&id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found("download not found"))
}

/// Streams a completed download. Preconditions are checked in order: record,
/// terminal success, file still on disk; the delayed cleanup is scheduled
/// without gating the response.
async fn download_file(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<Response> {
    let record = state
        .store
        .get(&id)
        .ok_or_else(|| ApiError::not_found("download not found"))?;

    if record.status != DownloadStatus::Completed {
        return Err(ApiError::bad_request("download not ready"));
    }

    let path = state.downloads.staged_path(&record.filename);
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    let disposition = format!("attachment; filename=\"{}\"", record.filename);
    if let Ok(value) = disposition.parse() {
        response
            .headers_mut()
            .insert(header::CONTENT_DISPOSITION, value);
    }

    state.downloads.schedule_cleanup(&id, &record.filename);

    Ok(response)
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path();
    if path == "/api" || path.starts_with("/api/") {
        return ApiError::not_found("endpoint not found").into_response();
    }

    match serve_www_path(&state.www_root, path).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_www_path(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_www_path(root, request_path)?;
    let metadata = tokio::fs::metadata(&target).await;

    match metadata {
        Ok(meta) if meta.is_dir() => stream_www_file(root.join("index.html")).await,
        Ok(_) => stream_www_file(target).await,
        Err(_) => {
            // Extension-less paths are client-side routes; everything else is
            // a genuinely missing asset.
            if should_fallback_to_index(request_path) {
                stream_www_file(root.join("index.html")).await
            } else {
                Err(ApiError::not_found("file not found"))
            }
        }
    }
}

fn resolve_www_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

fn should_fallback_to_index(request_path: &str) -> bool {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return true;
    }
    Path::new(trimmed).extension().is_none()
}

async fn stream_www_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;
    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use axum::{body::to_bytes, extract::State as AxumState};
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::sync::Mutex as StdMutex;
    use std::{env, time::Duration};
    use tempfile::{TempDir, tempdir};
    use tokio::sync::mpsc;
    use tubegrab::extract::{FormatSelection, StreamEvent, StreamHandle};
    use tubegrab::metadata::VideoInfo;

    static ENV_LOCK: StdMutex<()> = StdMutex::new(());

    fn with_env_file(vars: &[(&str, &str)], f: impl FnOnce()) {
        let _lock = ENV_LOCK.lock().unwrap();
        let dir = tempdir().unwrap();
        let mut contents = String::new();
        for (key, value) in vars {
            contents.push_str(&format!("{key}=\"{value}\"\n"));
        }
        std::fs::write(dir.path().join(".env"), contents).unwrap();
        let cwd = env::current_dir().unwrap();
        env::set_current_dir(dir.path()).unwrap();
        f();
        env::set_current_dir(cwd).unwrap();
    }

    fn parse_backend_args(env_values: &[(&str, &str)], extra: &[&str]) -> BackendArgs {
        let argv = extra
            .iter()
            .map(|value| value.to_string())
            .collect::<Vec<_>>();
        let mut parsed = None;
        with_env_file(env_values, || {
            parsed = Some(BackendArgs::from_iter(argv.clone()).expect("parsed args"));
        });
        parsed.expect("args set")
    }

    fn base_env() -> Vec<(&'static str, &'static str)> {
        vec![
            ("TUBEGRAB_STAGING_ROOT", "/stage/test"),
            ("TUBEGRAB_WWW_ROOT", "/www/test"),
            ("TUBEGRAB_PORT", "4242"),
            ("TUBEGRAB_HOST", "127.0.0.1"),
        ]
    }

    /// Extractor stub: canned metadata plus at most one scripted stream.
    struct StubExtractor {
        events: Mutex<Option<Vec<StreamEvent>>>,
    }

    impl StubExtractor {
        fn with_stream(events: Vec<StreamEvent>) -> Self {
            Self {
                events: Mutex::new(Some(events)),
            }
        }

        fn metadata_only() -> Self {
            Self {
                events: Mutex::new(None),
            }
        }
    }

    impl Extractor for StubExtractor {
        fn fetch_info(&self, url: &str) -> Result<MediaInfo> {
            Ok(MediaInfo::Video(VideoInfo {
                id: "abc123".into(),
                title: "Stub Video".into(),
                description: None,
                thumbnail: "https://i.ytimg.com/vi/abc123/maxresdefault.jpg".into(),
                duration: "10:30".into(),
                view_count: Some("1.2M views".into()),
                publish_date: None,
                url: url.to_string(),
            }))
        }

        fn open_stream(&self, _url: &str, _selection: &FormatSelection) -> Result<StreamHandle> {
            let Some(events) = self.events.lock().take() else {
                bail!("no scripted stream configured");
            };
            let (tx, rx) = mpsc::channel(64);
            std::thread::spawn(move || {
                for event in events {
                    if tx.blocking_send(event).is_err() {
                        return;
                    }
                }
            });
            Ok(StreamHandle { events: rx })
        }
    }

    struct BackendTestContext {
        _temp: TempDir,
        staging_root: PathBuf,
        state: AppState,
    }

    impl BackendTestContext {
        fn new(extractor: StubExtractor) -> Self {
            Self::with_cleanup_delay(extractor, Duration::from_secs(60))
        }

        fn with_cleanup_delay(extractor: StubExtractor, cleanup_delay: Duration) -> Self {
            let temp = tempdir().unwrap();
            let staging_root = temp.path().join("staging");
            let www_root = temp.path().join("www");
            std::fs::create_dir_all(&www_root).unwrap();

            let store: Arc<dyn ProgressStore> = Arc::new(MemoryProgressStore::new());
            let extractor: Arc<dyn Extractor> = Arc::new(extractor);
            let downloads = DownloadManager::new(
                store.clone(),
                extractor.clone(),
                staging_root.clone(),
                cleanup_delay,
            );

            Self {
                state: AppState {
                    store,
                    downloads,
                    extractor,
                    www_root: Arc::new(www_root),
                },
                staging_root,
                _temp: temp,
            }
        }

        /// Seeds a record directly, bypassing the orchestrator.
        fn seed_record(&self, record: DownloadRecord) {
            self.state.store.put(record);
        }

        async fn poll_until_completed(&self, id: &str) -> DownloadRecord {
            for _ in 0..200 {
                let Json(record) =
                    get_download_progress(AxumState(self.state.clone()), AxumPath(id.to_string()))
                        .await
                        .unwrap();
                match record.status {
                    DownloadStatus::Completed => return record,
                    DownloadStatus::Error => panic!("download errored: {record:?}"),
                    DownloadStatus::Downloading => {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
            panic!("download never completed");
        }
    }

    fn mp3_body(url: &str) -> Json<Value> {
        Json(serde_json::json!({ "url": url, "format": "mp3" }))
    }

    #[test]
    fn backend_args_read_env_file() {
        let args = parse_backend_args(&base_env(), &[]);
        assert_eq!(args.staging_root, PathBuf::from("/stage/test"));
        assert_eq!(args.www_root, PathBuf::from("/www/test"));
        assert_eq!(args.port, 4242);
        assert_eq!(args.cleanup_delay, Duration::from_secs(30));
    }

    #[test]
    fn backend_args_override_staging_root() {
        let args = parse_backend_args(&base_env(), &["--staging-root", "/custom/stage"]);
        assert_eq!(args.staging_root, PathBuf::from("/custom/stage"));
    }

    #[test]
    fn backend_args_override_port_and_host() {
        let args = parse_backend_args(&base_env(), &["--port=9000", "--host", "0.0.0.0"]);
        assert_eq!(args.port, 9000);
        assert_eq!(args.listen_host, "0.0.0.0".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn backend_args_override_cleanup_delay() {
        let args = parse_backend_args(&base_env(), &["--cleanup-delay", "5"]);
        assert_eq!(args.cleanup_delay, Duration::from_secs(5));
    }

    #[test]
    fn backend_args_reject_unknown_flags() {
        let mut failed = false;
        with_env_file(&base_env(), || {
            failed = BackendArgs::from_iter(vec!["--bogus".to_string()]).is_err();
        });
        assert!(failed);
    }

    #[tokio::test]
    async fn fetch_info_rejects_non_youtube_urls() {
        let ctx = BackendTestContext::new(StubExtractor::metadata_only());
        let err = fetch_info(
            AxumState(ctx.state.clone()),
            Json(FetchInfoRequest {
                url: "https://vimeo.com/123".into(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn fetch_info_returns_video_envelope() {
        let ctx = BackendTestContext::new(StubExtractor::metadata_only());
        let Json(info) = fetch_info(
            AxumState(ctx.state.clone()),
            Json(FetchInfoRequest {
                url: "https://youtu.be/abc123".into(),
            }),
        )
        .await
        .unwrap();
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["type"], "video");
        assert_eq!(value["data"]["id"], "abc123");
    }

    #[tokio::test]
    async fn start_download_rejects_non_youtube_urls() {
        let ctx = BackendTestContext::new(StubExtractor::metadata_only());
        let err = start_download(
            AxumState(ctx.state.clone()),
            mp3_body("https://example.com/file"),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn start_download_rejects_unknown_formats_with_bad_request() {
        let ctx = BackendTestContext::new(StubExtractor::metadata_only());
        let err = start_download(
            AxumState(ctx.state.clone()),
            Json(serde_json::json!({ "url": "https://youtu.be/abc123", "format": "flac" })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("invalid download request"));
    }

    #[tokio::test]
    async fn start_download_rejects_missing_fields_with_bad_request() {
        let ctx = BackendTestContext::new(StubExtractor::metadata_only());
        let err = start_download(
            AxumState(ctx.state.clone()),
            Json(serde_json::json!({ "url": "https://youtu.be/abc123" })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn progress_unknown_id_returns_not_found() {
        let ctx = BackendTestContext::new(StubExtractor::metadata_only());
        let err = get_download_progress(AxumState(ctx.state.clone()), AxumPath("ghost".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn file_fetch_unknown_id_returns_not_found() {
        let ctx = BackendTestContext::new(StubExtractor::metadata_only());
        let err = download_file(AxumState(ctx.state.clone()), AxumPath("ghost".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn file_fetch_while_downloading_is_not_ready() {
        let ctx = BackendTestContext::new(StubExtractor::metadata_only());
        ctx.seed_record(DownloadRecord::new(
            "download-7".into(),
            "abc_mp3_download-7.mp3".into(),
        ));

        let err = download_file(AxumState(ctx.state.clone()), AxumPath("download-7".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn file_fetch_after_cleanup_is_not_found() {
        let ctx = BackendTestContext::new(StubExtractor::metadata_only());
        let mut record = DownloadRecord::new("download-7".into(), "abc_mp3_download-7.mp3".into());
        record.status = DownloadStatus::Completed;
        record.progress = 100;
        ctx.seed_record(record);
        // No staged file on disk: the cleanup already removed it.

        let err = download_file(AxumState(ctx.state.clone()), AxumPath("download-7".into()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn mp3_download_lifecycle_delivers_audio() {
        let ctx = BackendTestContext::new(StubExtractor::with_stream(vec![
            StreamEvent::Info {
                total_bytes: Some(4),
            },
            StreamEvent::Chunk(b"ID3\0".to_vec()),
            StreamEvent::End,
        ]));

        let Json(started) = start_download(
            AxumState(ctx.state.clone()),
            mp3_body("https://youtu.be/abc123"),
        )
        .await
        .unwrap();

        let record = ctx.poll_until_completed(&started.download_id).await;
        assert_eq!(record.progress, 100);
        assert!(record.filename.ends_with(".mp3"));

        let response = download_file(
            AxumState(ctx.state.clone()),
            AxumPath(started.download_id.clone()),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "audio/mpeg"
        );
        let disposition = response
            .headers()
            .get(header::CONTENT_DISPOSITION)
            .unwrap()
            .to_str()
            .unwrap();
        assert!(disposition.starts_with("attachment"));
        assert!(disposition.contains(&record.filename));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"ID3\0");
    }

    #[tokio::test]
    async fn delivery_schedules_cleanup_of_file_and_record() {
        let ctx = BackendTestContext::with_cleanup_delay(
            StubExtractor::metadata_only(),
            Duration::from_millis(50),
        );
        std::fs::create_dir_all(&ctx.staging_root).unwrap();
        let staged = ctx.staging_root.join("abc_mp3_download-7.mp3");
        std::fs::write(&staged, b"bytes").unwrap();
        let mut record = DownloadRecord::new("download-7".into(), "abc_mp3_download-7.mp3".into());
        record.status = DownloadStatus::Completed;
        record.progress = 100;
        ctx.seed_record(record);

        let response = download_file(AxumState(ctx.state.clone()), AxumPath("download-7".into()))
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"bytes");

        for _ in 0..200 {
            if ctx.state.store.get("download-7").is_none() && !staged.exists() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("cleanup never ran");
    }

    #[tokio::test]
    async fn errored_download_reports_error_then_file_is_unavailable() {
        let ctx = BackendTestContext::new(StubExtractor::with_stream(vec![
            StreamEvent::Info {
                total_bytes: Some(100),
            },
            StreamEvent::Chunk(vec![0u8; 40]),
            StreamEvent::Error("source unavailable".into()),
        ]));

        let Json(started) = start_download(
            AxumState(ctx.state.clone()),
            mp3_body("https://youtu.be/abc123"),
        )
        .await
        .unwrap();

        let mut errored = None;
        for _ in 0..200 {
            let Json(record) = get_download_progress(
                AxumState(ctx.state.clone()),
                AxumPath(started.download_id.clone()),
            )
            .await
            .unwrap();
            if record.status == DownloadStatus::Error {
                errored = Some(record);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let record = errored.expect("error status observed");
        assert_eq!(record.progress, 0);
        assert_eq!(record.downloaded_bytes, 0);

        let err = download_file(
            AxumState(ctx.state.clone()),
            AxumPath(started.download_id.clone()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn static_fallback_serves_index_for_routes() {
        let ctx = BackendTestContext::new(StubExtractor::metadata_only());
        std::fs::write(ctx.state.www_root.join("index.html"), "<html></html>").unwrap();

        let response = serve_www_path(&ctx.state.www_root, "/history").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), b"<html></html>");
    }

    #[tokio::test]
    async fn static_paths_cannot_escape_the_www_root() {
        let ctx = BackendTestContext::new(StubExtractor::metadata_only());
        let err = resolve_www_path(&ctx.state.www_root, "/../secret.txt").unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn api_error_serializes_json() {
        let response = ApiError::not_found("missing").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["error"], "missing");
    }
}
