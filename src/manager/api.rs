//! Operator-facing control API for the agent manager.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::config::CLASS_CATALOG;
use crate::manager::overrides::{OverridesError, OverridesStore};
use crate::manager::supervisor::{Supervisor, WaitPredicate};

/// Cadence at which wait predicates are re-evaluated.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(250);

const DEFAULT_WAIT_TIMEOUT_MS: u64 = 10_000;

#[derive(Clone)]
pub struct ManagerApi {
    pub supervisor: Supervisor,
    pub overrides: Arc<OverridesStore>,
    pub default_classes: Vec<String>,
}

pub fn router(api: ManagerApi) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/status", get(status))
        .route("/control/start", post(control_start))
        .route("/control/stop", post(control_stop))
        .route("/config/classes", get(get_classes).put(put_classes))
        .route("/config/classes/catalog", get(get_catalog))
        .with_state(api)
}

async fn root(State(api): State<ManagerApi>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "vigil-manager",
        "manager": api.supervisor.snapshot(),
    }))
}

async fn status(State(api): State<ManagerApi>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "manager": api.supervisor.snapshot(),
        "agent": api.supervisor.agent_status(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartQuery {
    wait: Option<String>,
    timeout_ms: Option<u64>,
}

async fn control_start(
    State(api): State<ManagerApi>,
    Query(query): Query<StartQuery>,
) -> Response {
    let predicate = match query.wait.as_deref() {
        None => None,
        Some(name) => match WaitPredicate::parse(name) {
            Some(p) => Some(p),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": format!("unknown wait predicate: {name}") })),
                )
                    .into_response();
            }
        },
    };

    let Some(predicate) = predicate else {
        // Fire and forget: the spawn itself reports through /status
        let supervisor = api.supervisor.clone();
        tokio::spawn(async move {
            if let Err(e) = supervisor.start().await {
                tracing::error!("async start failed: {e}");
            }
        });
        return (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({ "accepted": true })),
        )
            .into_response();
    };

    if let Err(e) = api.supervisor.start().await {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response();
    }

    let timeout = Duration::from_millis(query.timeout_ms.unwrap_or(DEFAULT_WAIT_TIMEOUT_MS));
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if api.supervisor.is_ready(predicate) {
            return (
                StatusCode::OK,
                Json(serde_json::json!({ "ready": true })),
            )
                .into_response();
        }
        if tokio::time::Instant::now() >= deadline {
            return (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({ "ready": false })),
            )
                .into_response();
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}

async fn control_stop(State(api): State<ManagerApi>) -> (StatusCode, Json<serde_json::Value>) {
    let supervisor = api.supervisor.clone();
    tokio::spawn(async move {
        supervisor.stop().await;
    });
    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "accepted": true })),
    )
}

async fn get_classes(State(api): State<ManagerApi>) -> Json<serde_json::Value> {
    let overrides = api.overrides.current().map(|o| o.classes_filter);
    let effective = api.overrides.effective(&api.default_classes);
    Json(serde_json::json!({
        "overrides": overrides,
        "effective": effective,
        "defaults": api.default_classes,
    }))
}

#[derive(Debug, Deserialize)]
struct PutClassesBody {
    classes: Vec<String>,
}

async fn put_classes(
    State(api): State<ManagerApi>,
    Json(body): Json<PutClassesBody>,
) -> Response {
    match api.overrides.update(body.classes) {
        Ok(overrides) => Json(serde_json::json!({
            "classesFilter": overrides.classes_filter,
        }))
        .into_response(),
        Err(OverridesError::UnknownClasses(unknown)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "unknown classes",
                "unknown": unknown,
            })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn get_catalog() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "classes": CLASS_CATALOG }))
}
