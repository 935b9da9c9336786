//! Active-session bookkeeping and ingestion dispatch.

use std::collections::BTreeSet;

use parking_lot::Mutex;

use crate::ai::cache::{epoch_ms, FrameCache};
use crate::ai::types::Detection;
use crate::orchestrator::ingester::{FrameIngester, IngestJob};

#[derive(Default)]
struct SessionState {
    session_id: Option<String>,
    seq_no: u64,
    detected_classes: BTreeSet<String>,
    last_session_id: Option<String>,
    last_change_ms: Option<u64>,
}

/// Tracks the active session id and its frame sequence, and hands frames to
/// the ingester. The sequence resets to 0 on open and increases strictly in
/// dispatch order.
pub struct SessionManager {
    cache: FrameCache,
    ingester: FrameIngester,
    state: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(cache: FrameCache, ingester: FrameIngester) -> Self {
        Self {
            cache,
            ingester,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Mark a session open: sequence back to 0, class set cleared.
    pub fn open(&self, session_id: impl Into<String>) {
        let mut state = self.state.lock();
        state.session_id = Some(session_id.into());
        state.seq_no = 0;
        state.detected_classes.clear();
        state.last_change_ms = Some(epoch_ms());
    }

    /// Clear the active session, remembering it as the last one.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if let Some(id) = state.session_id.take() {
            state.last_session_id = Some(id);
            state.last_change_ms = Some(epoch_ms());
        }
    }

    pub fn active_session(&self) -> Option<String> {
        self.state.lock().session_id.clone()
    }

    pub fn last_session(&self) -> Option<String> {
        self.state.lock().last_session_id.clone()
    }

    pub fn last_change_ms(&self) -> Option<u64> {
        self.state.lock().last_change_ms
    }

    /// Record classes observed during the active session. Returns the ones
    /// not seen before (used for store enrichment logging).
    pub fn note_classes<'a>(&self, classes: impl Iterator<Item = &'a str>) -> Vec<String> {
        let mut state = self.state.lock();
        let mut fresh = Vec::new();
        for cls in classes {
            if state.detected_classes.insert(cls.to_string()) {
                fresh.push(cls.to_string());
            }
        }
        fresh
    }

    pub fn detected_classes(&self) -> Vec<String> {
        self.state.lock().detected_classes.iter().cloned().collect()
    }

    /// Dispatch one frame to the ingester. Returns false when there is no
    /// active session, the cached frame already expired, or the ingester is
    /// shut down — all non-fatal.
    pub async fn ingest_frame(&self, frame_id: u64, detections: Vec<Detection>) -> bool {
        let Some(session_id) = self.active_session() else {
            return false;
        };
        let Some(cached) = self.cache.get(frame_id) else {
            tracing::debug!(frame_id, "frame expired before ingestion, skipping");
            return false;
        };
        let seq_no = {
            let mut state = self.state.lock();
            // The session may have closed between the lookup and here
            if state.session_id.as_deref() != Some(session_id.as_str()) {
                return false;
            }
            let seq = state.seq_no;
            state.seq_no += 1;
            seq
        };
        self.ingester.submit(IngestJob {
            session_id,
            seq_no,
            capture_ts_ns: cached.frame.capture_ts_ns,
            detections,
            frame: cached.frame,
        })
    }
}
