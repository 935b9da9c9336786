//! Child agent status: shared telemetry state plus the HTTP endpoint the
//! supervisor polls.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Serialize;

use crate::ai::cache::epoch_ms;
use crate::ai::feeder::FeederSnapshot;
use crate::bus::{topic, Event, EventBus};

/// Source of feeder counters, wired in by the bootstrap.
type FeederStatsSource = Box<dyn Fn() -> FeederSnapshot + Send + Sync>;

/// Stream state as reported by `/status`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatus {
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_stopped_at: Option<u64>,
}

/// Detection counters as reported by `/status`.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStatus {
    pub total: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_detection_ts: Option<u64>,
}

/// Session info as reported by `/status`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_change_ts: Option<u64>,
}

/// Full status payload returned to the supervisor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatus {
    pub online: bool,
    pub timestamp: u64,
    pub started_at: u64,
    pub uptime_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_ts: Option<u64>,
    pub detections: DetectionStatus,
    pub session: SessionStatus,
    pub streams: Streams,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feeder: Option<FeederSnapshot>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Streams {
    pub live: StreamStatus,
    pub record: StreamStatus,
}

#[derive(Default)]
struct StatusInner {
    started_at: u64,
    heartbeat_ts: Option<u64>,
    detections: DetectionStatus,
    session: SessionStatus,
    live: StreamStatus,
    record: StreamStatus,
}

/// Shared mutable status, written by the bus listener and read by the
/// endpoint. Cheap to clone.
#[derive(Clone, Default)]
pub struct StatusState {
    inner: Arc<Mutex<StatusInner>>,
    feeder_stats: Arc<Mutex<Option<FeederStatsSource>>>,
}

impl StatusState {
    pub fn new() -> Self {
        let state = Self::default();
        state.inner.lock().started_at = epoch_ms();
        state
    }

    /// Wire the feeder's counters into the status payload.
    pub fn set_feeder_stats(&self, source: FeederStatsSource) {
        *self.feeder_stats.lock() = Some(source);
    }

    pub fn mark_live_started(&self) {
        let mut inner = self.inner.lock();
        inner.live.running = true;
        inner.live.started_at = Some(epoch_ms());
    }

    pub fn apply(&self, event: &Event) {
        let now = epoch_ms();
        let mut inner = self.inner.lock();
        match event {
            Event::AiDetection { .. } => {
                inner.heartbeat_ts = Some(now);
                inner.detections.total += 1;
                inner.detections.last_detection_ts = Some(now);
            }
            Event::AiKeepalive { .. } => {
                inner.heartbeat_ts = Some(now);
            }
            Event::SessionOpen { session_id } => {
                inner.session.active = true;
                inner.session.current_session_id = Some(session_id.clone());
                inner.session.last_change_ts = Some(now);
            }
            Event::SessionClose { session_id } => {
                inner.session.active = false;
                inner.session.current_session_id = None;
                inner.session.last_session_id = Some(session_id.clone());
                inner.session.last_change_ts = Some(now);
            }
            Event::PublisherStarted => {
                inner.record.running = true;
                inner.record.started_at = Some(now);
            }
            Event::PublisherStopped => {
                inner.record.running = false;
                inner.record.last_stopped_at = Some(now);
            }
            _ => {}
        }
    }

    pub fn snapshot(&self) -> AgentStatus {
        let now = epoch_ms();
        let feeder = self.feeder_stats.lock().as_ref().map(|source| source());
        let inner = self.inner.lock();
        AgentStatus {
            online: true,
            timestamp: now,
            started_at: inner.started_at,
            uptime_ms: now.saturating_sub(inner.started_at),
            heartbeat_ts: inner.heartbeat_ts,
            detections: inner.detections,
            session: inner.session.clone(),
            streams: Streams {
                live: inner.live,
                record: inner.record,
            },
            feeder,
        }
    }

    /// Subscribe to the bus and keep this status current. The subscription
    /// must exist before any publisher starts.
    pub fn spawn_listener(&self, bus: &EventBus) -> Result<tokio::task::JoinHandle<()>, crate::bus::BusError> {
        let subscription = bus.subscribe(
            "status",
            &[
                topic::AI_DETECTION,
                topic::AI_KEEPALIVE,
                topic::SESSION_OPEN,
                topic::SESSION_CLOSE,
                topic::PUBLISHER_STARTED,
                topic::PUBLISHER_STOPPED,
            ],
        )?;
        let state = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                state.apply(&event);
            }
        }))
    }
}

async fn status_handler(State(state): State<StatusState>) -> Json<AgentStatus> {
    Json(state.snapshot())
}

/// Router exposing `GET /status`.
pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .with_state(state)
}
