//! Path-safe serving of per-session track files.
//!
//! Layout under `TRACKS_STORAGE_PATH`:
//! `{sessionId}/{meta.json,index.json,seg-*.jsonl[.gz|.zst]}`. Every lookup
//! validates the session id before it ever touches the filesystem; the
//! resolved path must stay inside the storage root.

use std::path::{Component, Path, PathBuf};

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::Response;
use tokio_util::io::ReaderStream;

use crate::store::error::{Result, StoreError};

/// Cache header for immutable, closed content.
pub const CACHE_IMMUTABLE: &str = "public, max-age=31536000, immutable";

/// Cache header for content that may still change.
pub const CACHE_SHORT: &str = "public, max-age=30";

/// Reject anything that could escape the storage root: empty ids, dot
/// entries, separators, or non-filename characters.
pub fn validate_session_id(id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." {
        return Err(StoreError::InvalidSessionId);
    }
    let ok = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok || id.contains("..") {
        return Err(StoreError::InvalidSessionId);
    }
    Ok(())
}

/// Resolve the directory for one session, guaranteed inside `root`.
pub fn session_dir(root: &Path, session_id: &str) -> Result<PathBuf> {
    validate_session_id(session_id)?;
    let dir = root.join(session_id);
    // Defense in depth: the join of a validated id cannot traverse, but a
    // malformed root could still surprise us
    if dir
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(StoreError::InvalidSessionId);
    }
    Ok(dir)
}

/// Locate a segment file, trying plain, gzip and zstd extensions in order.
/// Returns the path and the `Content-Encoding` to advertise.
pub fn find_segment(dir: &Path, index: u32) -> Option<(PathBuf, Option<&'static str>)> {
    let candidates = [
        (format!("seg-{index}.jsonl"), None),
        (format!("seg-{index}.jsonl.gz"), Some("gzip")),
        (format!("seg-{index}.jsonl.zst"), Some("zstd")),
    ];
    for (name, encoding) in candidates {
        let path = dir.join(name);
        if path.is_file() {
            return Some((path, encoding));
        }
    }
    None
}

/// Whether `index.json` flags segment `i` as closed. Missing or malformed
/// indexes count as open, which only costs cacheability.
pub async fn segment_is_closed(dir: &Path, index: u32) -> bool {
    let Ok(contents) = tokio::fs::read_to_string(dir.join("index.json")).await else {
        return false;
    };
    let Ok(parsed) = serde_json::from_str::<serde_json::Value>(&contents) else {
        return false;
    };
    parsed["segments"]
        .get(index as usize)
        .map(|seg| seg["closed"].as_bool().unwrap_or(false))
        .unwrap_or(false)
}

/// Stream a file with the given content type and cache policy.
pub async fn stream_file(
    path: &Path,
    content_type: &'static str,
    content_encoding: Option<&'static str>,
    cache_control: &'static str,
) -> Result<Response> {
    let file = tokio::fs::File::open(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StoreError::NotFound
        } else {
            StoreError::Io(e)
        }
    })?;
    let stream = ReaderStream::new(file);

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, cache_control);
    if let Some(encoding) = content_encoding {
        builder = builder.header(
            header::CONTENT_ENCODING,
            HeaderValue::from_static(encoding),
        );
    }
    builder
        .body(Body::from_stream(stream))
        .map_err(|e| StoreError::Invalid(e.to_string()))
}
