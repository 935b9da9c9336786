//! HTTP surface of the session store.

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{SecondsFormat, TimeZone, Utc};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

use crate::ai::cache::epoch_ms;
use crate::config::StoreSection;
use crate::store::catalog::{Catalog, DetectionUpsert, MediaHook, NewSession, SessionRecord};
use crate::store::error::{Result, StoreError};
use crate::store::segments::{
    find_segment, segment_is_closed, session_dir, stream_file, validate_session_id,
    CACHE_IMMUTABLE, CACHE_SHORT,
};

/// Shared state behind every handler.
#[derive(Clone)]
pub struct StoreApp {
    pub catalog: Arc<Catalog>,
    pub config: StoreSection,
}

pub fn router(app: StoreApp) -> Router {
    Router::new()
        .route("/sessions/open", post(open_session))
        .route("/sessions/close", post(close_session))
        .route("/sessions", get(list_sessions))
        .route("/sessions/range", get(list_range))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/meta", get(get_meta))
        .route("/sessions/{id}/index", get(get_index))
        .route("/sessions/{id}/segment/{i}", get(get_segment))
        .route("/sessions/{id}/clip", get(get_clip))
        .route("/detections", post(post_detections))
        .route("/ingest", post(post_ingest))
        .route("/hooks/mediamtx/publish", post(hook_publish))
        .route("/hooks/mediamtx/record/segment/start", post(hook_segment_start))
        .route(
            "/hooks/mediamtx/record/segment/complete",
            post(hook_segment_complete),
        )
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .layer(CorsLayer::permissive())
        .with_state(app)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenBody {
    session_id: String,
    dev_id: String,
    start_ts: i64,
    path: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloseBody {
    session_id: String,
    end_ts: i64,
    #[serde(default)]
    postroll_sec: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct BBoxIn {
    x: f64,
    y: f64,
    w: f64,
    h: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectionIn {
    #[serde(default)]
    track_id: Option<String>,
    cls: String,
    conf: f64,
    bbox: BBoxIn,
    #[serde(default)]
    url_frame: Option<String>,
}

impl DetectionIn {
    fn into_upsert(self, url_frame: Option<String>) -> Option<DetectionUpsert> {
        let track_id = self.track_id.filter(|t| !t.is_empty())?;
        Some(DetectionUpsert {
            track_id,
            cls: self.cls,
            conf: self.conf,
            bbox: (self.bbox.x, self.bbox.y, self.bbox.w, self.bbox.h),
            url_frame: url_frame.or(self.url_frame),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectionsBody {
    session_id: String,
    detections: Vec<DetectionIn>,
    #[serde(default)]
    ts: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct RangeQuery {
    from: i64,
    to: i64,
    limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ClipQuery {
    format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HookBody {
    path: String,
    #[serde(default)]
    ts: Option<i64>,
}

fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(50).min(500)
}

async fn open_session(
    State(app): State<StoreApp>,
    Json(body): Json<OpenBody>,
) -> Result<(StatusCode, Json<SessionRecord>)> {
    validate_session_id(&body.session_id)?;
    if body.path.is_empty() {
        return Err(StoreError::Invalid("path is empty".into()));
    }
    let created = app.catalog.open_session(&NewSession {
        session_id: body.session_id.clone(),
        device_id: body.dev_id,
        path: body.path,
        start_ts: body.start_ts,
        reason: body.reason,
    })?;
    let record = app
        .catalog
        .get_session(&body.session_id)?
        .ok_or(StoreError::NotFound)?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(record)))
}

async fn close_session(
    State(app): State<StoreApp>,
    Json(body): Json<CloseBody>,
) -> Result<Json<SessionRecord>> {
    app.catalog
        .close_session(&body.session_id, body.end_ts, body.postroll_sec)?;
    let record = app
        .catalog
        .get_session(&body.session_id)?
        .ok_or(StoreError::NotFound)?;
    Ok(Json(record))
}

async fn list_sessions(
    State(app): State<StoreApp>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<SessionRecord>>> {
    Ok(Json(app.catalog.list_sessions(clamp_limit(query.limit))?))
}

async fn list_range(
    State(app): State<StoreApp>,
    Query(query): Query<RangeQuery>,
) -> Result<Json<Vec<SessionRecord>>> {
    Ok(Json(app.catalog.list_range(
        query.from,
        query.to,
        clamp_limit(query.limit),
    )?))
}

async fn get_session(
    State(app): State<StoreApp>,
    Path(id): Path<String>,
) -> Result<Json<SessionRecord>> {
    validate_session_id(&id)?;
    let record = app.catalog.get_session(&id)?.ok_or(StoreError::NotFound)?;
    Ok(Json(record))
}

async fn get_meta(State(app): State<StoreApp>, Path(id): Path<String>) -> Result<Response> {
    serve_session_file(&app, &id, "meta.json").await
}

async fn get_index(State(app): State<StoreApp>, Path(id): Path<String>) -> Result<Response> {
    serve_session_file(&app, &id, "index.json").await
}

/// Serve meta/index with cacheability derived from session status.
async fn serve_session_file(app: &StoreApp, id: &str, name: &str) -> Result<Response> {
    let dir = session_dir(&app.config.tracks_storage_path, id)?;
    let record = app.catalog.get_session(id)?.ok_or(StoreError::NotFound)?;
    let cache = if record.is_open() {
        CACHE_SHORT
    } else {
        CACHE_IMMUTABLE
    };
    stream_file(&dir.join(name), "application/json", None, cache).await
}

async fn get_segment(
    State(app): State<StoreApp>,
    Path((id, index)): Path<(String, u32)>,
) -> Result<Response> {
    let dir = session_dir(&app.config.tracks_storage_path, &id)?;
    let (path, encoding) = find_segment(&dir, index).ok_or(StoreError::NotFound)?;
    let cache = if segment_is_closed(&dir, index).await {
        CACHE_IMMUTABLE
    } else {
        CACHE_SHORT
    };
    stream_file(&path, "application/x-ndjson", encoding, cache).await
}

async fn get_clip(
    State(app): State<StoreApp>,
    Path(id): Path<String>,
    Query(query): Query<ClipQuery>,
) -> Result<Json<serde_json::Value>> {
    validate_session_id(&id)?;
    let record = app.catalog.get_session(&id)?.ok_or(StoreError::NotFound)?;
    if record.is_open() {
        return Err(StoreError::Conflict("session is still open".into()));
    }
    let end_ts = record.end_ts.ok_or_else(|| {
        StoreError::Invalid("closed session without end_ts".into())
    })?;

    let start_ms = record.start_ts + app.config.playback_start_offset_ms;
    let start = Utc
        .timestamp_millis_opt(start_ms)
        .single()
        .ok_or_else(|| StoreError::Invalid("start_ts out of range".into()))?
        .to_rfc3339_opts(SecondsFormat::Millis, true);
    let base_secs = (end_ts - record.start_ts).max(0) / 1000;
    let extra = app
        .config
        .playback_extra_seconds
        .max(record.postroll_sec.unwrap_or(0));
    let duration = base_secs + extra;
    let format = query.format.unwrap_or_else(|| "mp4".to_string());

    let url = format!(
        "{}/get?path={}&start={}&duration={}s&format={}",
        self::trim_trailing_slash(&app.config.media_base_url),
        record.path,
        start,
        duration,
        format
    );
    Ok(Json(serde_json::json!({ "url": url })))
}

fn trim_trailing_slash(url: &str) -> &str {
    url.trim_end_matches('/')
}

async fn post_detections(
    State(app): State<StoreApp>,
    Json(body): Json<DetectionsBody>,
) -> Result<Json<serde_json::Value>> {
    validate_session_id(&body.session_id)?;
    let ts = body.ts.unwrap_or_else(|| epoch_ms() as i64);
    let upserts: Vec<DetectionUpsert> = body
        .detections
        .into_iter()
        .filter_map(|d| d.into_upsert(None))
        .collect();
    let (inserted, total) = app.catalog.upsert_detections(&body.session_id, &upserts, ts)?;
    Ok(Json(serde_json::json!({ "inserted": inserted, "total": total })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IngestMetaIn {
    session_id: String,
    seq_no: u64,
    capture_ts: i64,
    #[serde(default)]
    detections: Vec<DetectionIn>,
}

async fn post_ingest(
    State(app): State<StoreApp>,
    mut multipart: Multipart,
) -> Result<Json<serde_json::Value>> {
    let mut meta: Option<IngestMetaIn> = None;
    let mut frame: Option<Vec<u8>> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| StoreError::Invalid(e.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("meta") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| StoreError::Invalid(e.to_string()))?;
                meta = Some(
                    serde_json::from_str(&text)
                        .map_err(|e| StoreError::Invalid(format!("bad meta: {e}")))?,
                );
            }
            Some("frame") => {
                frame = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| StoreError::Invalid(e.to_string()))?
                        .to_vec(),
                );
            }
            _ => {}
        }
    }

    let meta = meta.ok_or_else(|| StoreError::Invalid("missing meta field".into()))?;
    let frame = frame.ok_or_else(|| StoreError::Invalid("missing frame field".into()))?;
    validate_session_id(&meta.session_id)?;
    if app.catalog.get_session(&meta.session_id)?.is_none() {
        return Err(StoreError::NotFound);
    }

    let dir = session_dir(&app.config.tracks_storage_path, &meta.session_id)?.join("frames");
    tokio::fs::create_dir_all(&dir).await?;
    let file_name = format!("seq-{}.bin", meta.seq_no);
    tokio::fs::write(dir.join(&file_name), &frame).await?;

    let url_frame = format!("frames/{file_name}");
    let upserts: Vec<DetectionUpsert> = meta
        .detections
        .into_iter()
        .filter_map(|d| d.into_upsert(Some(url_frame.clone())))
        .collect();
    let (inserted, total) =
        app.catalog
            .upsert_detections(&meta.session_id, &upserts, meta.capture_ts)?;
    Ok(Json(serde_json::json!({
        "ok": true,
        "inserted": inserted,
        "total": total,
    })))
}

async fn hook_publish(
    State(app): State<StoreApp>,
    headers: HeaderMap,
    Json(body): Json<HookBody>,
) -> Response {
    apply_hook(&app, &headers, &body, MediaHook::Publish)
}

async fn hook_segment_start(
    State(app): State<StoreApp>,
    headers: HeaderMap,
    Json(body): Json<HookBody>,
) -> Response {
    apply_hook(&app, &headers, &body, MediaHook::SegmentStart)
}

async fn hook_segment_complete(
    State(app): State<StoreApp>,
    headers: HeaderMap,
    Json(body): Json<HookBody>,
) -> Response {
    apply_hook(&app, &headers, &body, MediaHook::SegmentComplete)
}

fn apply_hook(app: &StoreApp, headers: &HeaderMap, body: &HookBody, hook: MediaHook) -> Response {
    if !app.config.hook_token.is_empty() {
        let presented = headers
            .get("x-hook-token")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if presented != app.config.hook_token {
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": "bad hook token" })),
            )
                .into_response();
        }
    }
    let ts = body.ts.unwrap_or_else(|| epoch_ms() as i64);
    match app.catalog.apply_media_hook(&body.path, hook, ts) {
        Ok(updated) => Json(serde_json::json!({ "updated": updated })).into_response(),
        Err(e) => e.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct TestStore {
        base: String,
        app: StoreApp,
        _tracks: TempDir,
        client: reqwest::Client,
    }

    async fn spawn_store() -> TestStore {
        spawn_store_with(|_| {}).await
    }

    async fn spawn_store_with(tweak: impl FnOnce(&mut StoreSection)) -> TestStore {
        let tracks = TempDir::new().unwrap();
        let mut config = StoreSection {
            tracks_storage_path: tracks.path().to_path_buf(),
            ..StoreSection::default()
        };
        tweak(&mut config);
        let app = StoreApp {
            catalog: Arc::new(Catalog::open_in_memory().unwrap()),
            config,
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = router(app.clone());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        TestStore {
            base: format!("http://{addr}"),
            app,
            _tracks: tracks,
            client: reqwest::Client::new(),
        }
    }

    async fn open(store: &TestStore, id: &str, start_ts: i64) -> reqwest::Response {
        store
            .client
            .post(format!("{}/sessions/open", store.base))
            .json(&serde_json::json!({
                "sessionId": id,
                "devId": "edge-01",
                "startTs": start_ts,
                "path": "cam1",
                "reason": "detection",
            }))
            .send()
            .await
            .unwrap()
    }

    async fn close(store: &TestStore, id: &str, end_ts: i64) -> reqwest::Response {
        store
            .client
            .post(format!("{}/sessions/close", store.base))
            .json(&serde_json::json!({
                "sessionId": id,
                "endTs": end_ts,
                "postrollSec": 3,
            }))
            .send()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn open_is_idempotent_over_http() {
        let store = spawn_store().await;

        let first = open(&store, "sess-1", 100).await;
        assert_eq!(first.status(), 201);
        let first_body: serde_json::Value = first.json().await.unwrap();

        let second = open(&store, "sess-1", 100).await;
        assert_eq!(second.status(), 200);
        let second_body: serde_json::Value = second.json().await.unwrap();
        assert_eq!(first_body, second_body);

        let listed: Vec<serde_json::Value> = store
            .client
            .get(format!("{}/sessions?limit=10", store.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn close_unknown_session_is_404() {
        let store = spawn_store().await;
        let resp = close(&store, "ghost", 100).await;
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn sessions_list_orders_start_desc() {
        let store = spawn_store().await;
        open(&store, "a", 100).await;
        open(&store, "b", 300).await;
        open(&store, "c", 200).await;

        let listed: Vec<serde_json::Value> = store
            .client
            .get(format!("{}/sessions", store.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let ids: Vec<&str> = listed.iter().map(|s| s["sessionId"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
    }

    #[tokio::test]
    async fn detections_endpoint_reports_counts() {
        let store = spawn_store().await;
        open(&store, "sess-1", 100).await;

        let body: serde_json::Value = store
            .client
            .post(format!("{}/detections", store.base))
            .json(&serde_json::json!({
                "sessionId": "sess-1",
                "ts": 1000,
                "detections": [
                    {"trackId": "t1", "cls": "person", "conf": 0.9,
                     "bbox": {"x": 1.0, "y": 2.0, "w": 3.0, "h": 4.0}},
                    {"trackId": "", "cls": "person", "conf": 0.8,
                     "bbox": {"x": 0.0, "y": 0.0, "w": 1.0, "h": 1.0}},
                ],
            }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();

        // The empty track id was skipped
        assert_eq!(body["inserted"], 1);
        assert_eq!(body["total"], 1);
    }

    #[tokio::test]
    async fn clip_of_open_session_conflicts() {
        let store = spawn_store().await;
        open(&store, "sess-1", 1_700_000_000_000).await;

        let resp = store
            .client
            .get(format!("{}/sessions/sess-1/clip?format=mp4", store.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 409);
    }

    #[tokio::test]
    async fn clip_builds_playback_url() {
        let store = spawn_store().await;
        open(&store, "sess-1", 1_700_000_000_000).await;
        close(&store, "sess-1", 1_700_000_010_000).await;

        let body: serde_json::Value = store
            .client
            .get(format!("{}/sessions/sess-1/clip", store.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let url = body["url"].as_str().unwrap();
        assert!(url.contains("/get?path=cam1&start="), "got {url}");
        // 10s session + max(extra=5, postroll=3) = 15s
        assert!(url.contains("&duration=15s"), "got {url}");
        assert!(url.contains("&format=mp4"), "got {url}");
        // Start is offset by 200ms from start_ts
        assert!(url.contains("start=2023-11-14T22:13:20.200Z"), "got {url}");
    }

    #[tokio::test]
    async fn traversal_session_ids_are_rejected() {
        let store = spawn_store().await;
        for id in ["a..b", "%2e%2e", "..%2Fother"] {
            let resp = store
                .client
                .get(format!("{}/sessions/{id}/index", store.base))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 400, "id {id:?} must be rejected");
        }
    }

    #[tokio::test]
    async fn segment_serves_with_cache_headers() {
        let store = spawn_store().await;
        open(&store, "sess-1", 100).await;

        let dir = store.app.config.tracks_storage_path.join("sess-1");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("seg-0.jsonl"), "{\"t\":1}\n").unwrap();
        std::fs::write(
            dir.join("index.json"),
            r#"{"segments":[{"closed":true}]}"#,
        )
        .unwrap();

        let resp = store
            .client
            .get(format!("{}/sessions/sess-1/segment/0", store.base))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(
            resp.headers()["content-type"].to_str().unwrap(),
            "application/x-ndjson"
        );
        assert_eq!(
            resp.headers()["cache-control"].to_str().unwrap(),
            CACHE_IMMUTABLE
        );
        assert_eq!(resp.headers()["accept-ranges"].to_str().unwrap(), "bytes");

        let missing = store
            .client
            .get(format!("{}/sessions/sess-1/segment/7", store.base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);
    }

    #[tokio::test]
    async fn ingest_stores_frame_and_detections() {
        let store = spawn_store().await;
        open(&store, "sess-1", 100).await;

        let meta = serde_json::json!({
            "sessionId": "sess-1",
            "seqNo": 0,
            "captureTs": 12345,
            "detections": [
                {"trackId": "t1", "cls": "person", "conf": 0.9,
                 "bbox": {"x": 1.0, "y": 2.0, "w": 3.0, "h": 4.0}},
            ],
        });
        let form = reqwest::multipart::Form::new()
            .text("meta", meta.to_string())
            .part(
                "frame",
                reqwest::multipart::Part::bytes(vec![9u8; 128]).file_name("frame.bin"),
            );

        let resp = store
            .client
            .post(format!("{}/ingest", store.base))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        // Frame landed on disk
        let frame_path = store
            .app
            .config
            .tracks_storage_path
            .join("sess-1/frames/seq-0.bin");
        assert!(frame_path.is_file());
        assert_eq!(std::fs::read(&frame_path).unwrap().len(), 128);

        // Detection row carries the frame url
        let rows = store.app.catalog.list_detections("sess-1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].url_frame.as_deref(), Some("frames/seq-0.bin"));
    }

    #[tokio::test]
    async fn ingest_for_unknown_session_is_404() {
        let store = spawn_store().await;
        let meta = serde_json::json!({
            "sessionId": "ghost",
            "seqNo": 0,
            "captureTs": 1,
            "detections": [],
        });
        let form = reqwest::multipart::Form::new()
            .text("meta", meta.to_string())
            .part("frame", reqwest::multipart::Part::bytes(vec![1u8]));

        let resp = store
            .client
            .post(format!("{}/ingest", store.base))
            .multipart(form)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    }

    #[tokio::test]
    async fn hooks_update_media_timestamps() {
        let store = spawn_store().await;
        open(&store, "sess-1", 100).await;

        for (route, ts) in [
            ("publish", 1_000),
            ("record/segment/start", 2_000),
            ("record/segment/complete", 3_000),
        ] {
            let resp = store
                .client
                .post(format!("{}/hooks/mediamtx/{route}", store.base))
                .json(&serde_json::json!({ "path": "cam1", "ts": ts }))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), 200);
        }

        let record = store.app.catalog.get_session("sess-1").unwrap().unwrap();
        assert_eq!(record.media_connect_ts, Some(1_000));
        assert_eq!(record.media_start_ts, Some(2_000));
        assert_eq!(record.media_end_ts, Some(3_000));
        assert_eq!(record.recommended_start_offset_ms, Some(200));
    }

    #[tokio::test]
    async fn hook_token_is_enforced_when_configured() {
        let store = spawn_store_with(|config| {
            config.hook_token = "secret".to_string();
        })
        .await;
        open(&store, "sess-1", 100).await;

        let denied = store
            .client
            .post(format!("{}/hooks/mediamtx/publish", store.base))
            .json(&serde_json::json!({ "path": "cam1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(denied.status(), 401);

        let allowed = store
            .client
            .post(format!("{}/hooks/mediamtx/publish", store.base))
            .header("X-Hook-Token", "secret")
            .json(&serde_json::json!({ "path": "cam1" }))
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status(), 200);
    }

    #[tokio::test]
    async fn range_filters_over_http() {
        let store = spawn_store().await;
        open(&store, "a", 100).await;
        close(&store, "a", 200).await;
        open(&store, "b", 1_000).await;

        let listed: Vec<serde_json::Value> = store
            .client
            .get(format!("{}/sessions/range?from=50&to=500", store.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["sessionId"], "a");
    }
}
