use std::path::{Path as FsPath, PathBuf};

use axum::body::Body;
use axum::extract::{Extension, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use redub_core::JobId;
use redub_policy::EndpointClass;

use crate::error::ApiError;
use crate::extract::RequireIdentity;
use crate::middleware::ClientIp;
use crate::AppState;

/// Read size per iteration while streaming a range from disk; bounds how
/// far past the requested range a read can ever go.
const STREAM_CHUNK: usize = 64 * 1024;

/// `GET /files/{*path}`: canonical resolution, containment, owner
/// mapping, then (range) streaming.
pub async fn serve(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(path): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.rate(Some(&identity), ip, EndpointClass::Read)?;
    let canonical = state.access.require_file_access(&identity, &path).await?;
    serve_file(&canonical, &headers).await
}

/// `GET /video/{id}`: convenience alias for the job's primary video
/// output.
pub async fn video_alias(
    State(state): State<AppState>,
    RequireIdentity(identity): RequireIdentity,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.rate(Some(&identity), ip, EndpointClass::Read)?;

    let job = state
        .meta
        .get_job(&JobId::from(id.as_str()))
        .await
        .map_err(|_| ApiError::not_found())?;
    state.access.require_job_access(&identity, &job, true)?;

    let work_dir = state
        .layout
        .resolve(&job.id)
        .await?
        .ok_or_else(ApiError::not_found)?;

    let video = find_primary_video(&work_dir)
        .await
        .ok_or_else(ApiError::not_found)?;
    serve_file(&video, &headers).await
}

async fn find_primary_video(work_dir: &FsPath) -> Option<PathBuf> {
    const VIDEO_EXTS: &[&str] = &["mkv", "mp4", "webm", "mov"];
    let mut entries = tokio::fs::read_dir(work_dir).await.ok()?;
    let mut fallback = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if VIDEO_EXTS.contains(&ext.to_ascii_lowercase().as_str()) => {
                return Some(path);
            }
            Some("out") if path.file_name().is_some_and(|n| n == "mux.out") => {
                fallback = Some(path);
            }
            _ => {}
        }
    }
    fallback
}

/// One parsed byte range, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ByteRange {
    start: u64,
    end: u64,
}

enum RangeOutcome {
    Whole,
    Partial(ByteRange),
    Unsatisfiable,
}

/// Single ranges (`bytes=a-b`, `bytes=a-`) and suffix ranges
/// (`bytes=-n`). Multi-range requests fall back to the whole file.
fn parse_range(header: Option<&HeaderValue>, size: u64) -> RangeOutcome {
    let Some(raw) = header.and_then(|v| v.to_str().ok()) else {
        return RangeOutcome::Whole;
    };
    let Some(spec) = raw.trim().strip_prefix("bytes=") else {
        return RangeOutcome::Whole;
    };
    if spec.contains(',') || size == 0 {
        return RangeOutcome::Whole;
    }

    let Some((start_raw, end_raw)) = spec.split_once('-') else {
        return RangeOutcome::Whole;
    };

    if start_raw.is_empty() {
        // Suffix range: the final n bytes.
        let Ok(suffix) = end_raw.parse::<u64>() else {
            return RangeOutcome::Unsatisfiable;
        };
        if suffix == 0 {
            return RangeOutcome::Unsatisfiable;
        }
        let len = suffix.min(size);
        return RangeOutcome::Partial(ByteRange {
            start: size - len,
            end: size - 1,
        });
    }

    let Ok(start) = start_raw.parse::<u64>() else {
        return RangeOutcome::Unsatisfiable;
    };
    if start >= size {
        return RangeOutcome::Unsatisfiable;
    }
    let end = if end_raw.is_empty() {
        size - 1
    } else {
        match end_raw.parse::<u64>() {
            Ok(end) => end.min(size - 1),
            Err(_) => return RangeOutcome::Unsatisfiable,
        }
    };
    if end < start {
        return RangeOutcome::Unsatisfiable;
    }
    RangeOutcome::Partial(ByteRange { start, end })
}

fn content_type_for(path: &FsPath) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("mkv") => "video/x-matroska",
        Some("mp4") => "video/mp4",
        Some("webm") => "video/webm",
        Some("mov") => "video/quicktime",
        Some("flac") => "audio/flac",
        Some("wav") => "audio/wav",
        Some("mp3") => "audio/mpeg",
        Some("srt") => "application/x-subrip",
        Some("vtt") => "text/vtt",
        Some("json") => "application/json",
        Some("txt") | Some("log") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}

/// Stream `[start, start+len)` of a file in bounded chunks; never reads
/// more than the requested window from disk.
fn file_stream(path: PathBuf, start: u64, len: u64) -> Body {
    let stream = async_stream::stream! {
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) => {
                yield Err(err);
                return;
            }
        };
        if let Err(err) = file.seek(std::io::SeekFrom::Start(start)).await {
            yield Err(err);
            return;
        }

        let mut remaining = len;
        while remaining > 0 {
            let take = remaining.min(STREAM_CHUNK as u64) as usize;
            let mut buf = vec![0u8; take];
            match file.read_exact(&mut buf).await {
                Ok(_) => {
                    remaining -= take as u64;
                    yield Ok(axum::body::Bytes::from(buf));
                }
                Err(err) => {
                    yield Err(err);
                    return;
                }
            }
        }
    };
    Body::from_stream(stream)
}

async fn serve_file(path: &FsPath, headers: &HeaderMap) -> Result<Response, ApiError> {
    let meta = tokio::fs::metadata(path)
        .await
        .map_err(|_| ApiError::not_found())?;
    if !meta.is_file() {
        return Err(ApiError::not_found());
    }
    let size = meta.len();
    let content_type = content_type_for(path);

    match parse_range(headers.get(header::RANGE), size) {
        RangeOutcome::Unsatisfiable => {
            let mut response = StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                response
                    .headers_mut()
                    .insert(header::CONTENT_RANGE, value);
            }
            Ok(response)
        }
        RangeOutcome::Whole => {
            let body = file_stream(path.to_path_buf(), 0, size);
            let mut response = (StatusCode::OK, body).into_response();
            decorate(response.headers_mut(), content_type, size, None);
            Ok(response)
        }
        RangeOutcome::Partial(range) => {
            let len = range.end - range.start + 1;
            let body = file_stream(path.to_path_buf(), range.start, len);
            let mut response = (StatusCode::PARTIAL_CONTENT, body).into_response();
            decorate(
                response.headers_mut(),
                content_type,
                len,
                Some((range, size)),
            );
            Ok(response)
        }
    }
}

fn decorate(
    headers: &mut HeaderMap,
    content_type: &'static str,
    content_length: u64,
    range: Option<(ByteRange, u64)>,
) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if let Ok(value) = HeaderValue::from_str(&content_length.to_string()) {
        headers.insert(header::CONTENT_LENGTH, value);
    }
    if let Some((range, size)) = range {
        if let Ok(value) =
            HeaderValue::from_str(&format!("bytes {}-{}/{size}", range.start, range.end))
        {
            headers.insert(header::CONTENT_RANGE, value);
        }
    }
}
