//! SQLite-backed session and detection catalog.
//!
//! The schema is created on open. All statements go through one connection
//! behind a mutex; every operation is short and synchronous.

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::config::CLASS_CATALOG;
use crate::store::error::{Result, StoreError};

/// One session row.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub device_id: String,
    pub path: String,
    pub start_ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postroll_sec: Option<i64>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub detected_classes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_connect_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_start_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_end_ts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommended_start_offset_ms: Option<i64>,
}

impl SessionRecord {
    pub fn is_open(&self) -> bool {
        self.status == "open"
    }
}

/// Input for a new or refreshed session row.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub session_id: String,
    pub device_id: String,
    pub path: String,
    pub start_ts: i64,
    pub reason: Option<String>,
}

/// One detection upsert.
#[derive(Debug, Clone)]
pub struct DetectionUpsert {
    pub track_id: String,
    pub cls: String,
    pub conf: f64,
    pub bbox: (f64, f64, f64, f64),
    pub url_frame: Option<String>,
}

/// One stored detection row.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DetectionRecord {
    pub session_id: String,
    pub track_id: String,
    pub cls: String,
    pub conf: f64,
    pub bbox: (f64, f64, f64, f64),
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_frame: Option<String>,
    pub first_ts: i64,
    pub last_ts: i64,
}

/// Media hook kinds (MediaMTX webhooks).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaHook {
    Publish,
    SegmentStart,
    SegmentComplete,
}

/// Applied when a hook touches a session whose offset is still NULL.
const DEFAULT_START_OFFSET_MS: i64 = 200;

/// The catalog. Cheap to share behind an `Arc`.
pub struct Catalog {
    conn: Mutex<Connection>,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                device_id TEXT NOT NULL,
                path TEXT NOT NULL,
                start_ts INTEGER NOT NULL,
                end_ts INTEGER,
                postroll_sec INTEGER,
                status TEXT NOT NULL DEFAULT 'open',
                reason TEXT,
                detected_classes TEXT NOT NULL DEFAULT '[]',
                media_connect_ts INTEGER,
                media_start_ts INTEGER,
                media_end_ts INTEGER,
                recommended_start_offset_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_path ON sessions(path, status);
            CREATE INDEX IF NOT EXISTS idx_sessions_start ON sessions(start_ts);
            CREATE TABLE IF NOT EXISTS detections (
                session_id TEXT NOT NULL,
                track_id TEXT NOT NULL,
                cls TEXT NOT NULL,
                conf REAL NOT NULL,
                bbox_x REAL NOT NULL,
                bbox_y REAL NOT NULL,
                bbox_w REAL NOT NULL,
                bbox_h REAL NOT NULL,
                url_frame TEXT,
                first_ts INTEGER NOT NULL,
                last_ts INTEGER NOT NULL,
                PRIMARY KEY (session_id, track_id)
            );
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Close sessions left `open` by a previous run. Called at startup.
    pub fn close_stale_sessions(&self, now_ts: i64) -> Result<usize> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE sessions SET status = 'closed', end_ts = MAX(start_ts, ?1)
             WHERE status = 'open'",
            params![now_ts],
        )?;
        if changed > 0 {
            tracing::warn!(count = changed, "closed stale sessions from previous run");
        }
        Ok(changed)
    }

    /// Idempotent open. Returns true when the row was created, false when it
    /// already existed. Keeps the one-open-session-per-path invariant by
    /// closing any other session still open on the same path.
    pub fn open_session(&self, new: &NewSession) -> Result<bool> {
        let conn = self.conn.lock();
        let displaced = conn.execute(
            "UPDATE sessions SET status = 'closed', end_ts = MAX(start_ts, ?1)
             WHERE path = ?2 AND status = 'open' AND session_id != ?3",
            params![new.start_ts, new.path, new.session_id],
        )?;
        if displaced > 0 {
            tracing::warn!(
                path = %new.path,
                displaced,
                "closed lingering open session on the same path"
            );
        }
        let created = conn.execute(
            "INSERT INTO sessions (session_id, device_id, path, start_ts, status, reason)
             VALUES (?1, ?2, ?3, ?4, 'open', ?5)
             ON CONFLICT (session_id) DO NOTHING",
            params![
                new.session_id,
                new.device_id,
                new.path,
                new.start_ts,
                new.reason
            ],
        )?;
        Ok(created > 0)
    }

    /// Close a session. `NotFound` for unknown ids; closing an already
    /// closed session is accepted and overwrites `end_ts`.
    pub fn close_session(
        &self,
        session_id: &str,
        end_ts: i64,
        postroll_sec: Option<i64>,
    ) -> Result<()> {
        let conn = self.conn.lock();
        let start_ts: Option<i64> = conn
            .query_row(
                "SELECT start_ts FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(start_ts) = start_ts else {
            return Err(StoreError::NotFound);
        };
        if end_ts < start_ts {
            return Err(StoreError::Invalid(format!(
                "end_ts {end_ts} precedes start_ts {start_ts}"
            )));
        }
        conn.execute(
            "UPDATE sessions SET status = 'closed', end_ts = ?2, postroll_sec = ?3
             WHERE session_id = ?1",
            params![session_id, end_ts, postroll_sec],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("{SESSION_SELECT} WHERE session_id = ?1"),
            params![session_id],
            row_to_session,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Latest sessions, `start_ts DESC`.
    pub fn list_sessions(&self, limit: u32) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare(&format!("{SESSION_SELECT} ORDER BY start_ts DESC LIMIT ?1"))?;
        let rows = stmt.query_map(params![limit], row_to_session)?;
        rows.collect::<rusqlite::Result<_>>().map_err(StoreError::from)
    }

    /// Sessions overlapping `[from, to]`, `start_ts DESC`.
    pub fn list_range(&self, from: i64, to: i64, limit: u32) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{SESSION_SELECT}
             WHERE start_ts <= ?2 AND COALESCE(end_ts, ?2) >= ?1
             ORDER BY start_ts DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(params![from, to, limit], row_to_session)?;
        rows.collect::<rusqlite::Result<_>>().map_err(StoreError::from)
    }

    /// Batch upsert with `(session_id, track_id)` uniqueness. A higher
    /// confidence replaces the stored snapshot; `first_ts`/`last_ts` extend
    /// in both directions so out-of-order batches are accepted.
    pub fn upsert_detections(
        &self,
        session_id: &str,
        detections: &[DetectionUpsert],
        ts: i64,
    ) -> Result<(usize, usize)> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let exists: Option<String> = tx
            .query_row(
                "SELECT detected_classes FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(classes_json) = exists else {
            return Err(StoreError::NotFound);
        };

        let count_before: usize = tx.query_row(
            "SELECT COUNT(*) FROM detections WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        for det in detections {
            tx.execute(
                "INSERT INTO detections
                     (session_id, track_id, cls, conf, bbox_x, bbox_y, bbox_w, bbox_h,
                      url_frame, first_ts, last_ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                 ON CONFLICT (session_id, track_id) DO UPDATE SET
                     cls = CASE WHEN excluded.conf > conf THEN excluded.cls ELSE cls END,
                     bbox_x = CASE WHEN excluded.conf > conf THEN excluded.bbox_x ELSE bbox_x END,
                     bbox_y = CASE WHEN excluded.conf > conf THEN excluded.bbox_y ELSE bbox_y END,
                     bbox_w = CASE WHEN excluded.conf > conf THEN excluded.bbox_w ELSE bbox_w END,
                     bbox_h = CASE WHEN excluded.conf > conf THEN excluded.bbox_h ELSE bbox_h END,
                     url_frame = CASE WHEN excluded.conf > conf THEN excluded.url_frame ELSE url_frame END,
                     conf = CASE WHEN excluded.conf > conf THEN excluded.conf ELSE conf END,
                     first_ts = MIN(first_ts, excluded.first_ts),
                     last_ts = MAX(last_ts, excluded.last_ts)",
                params![
                    session_id,
                    det.track_id,
                    det.cls,
                    det.conf,
                    det.bbox.0,
                    det.bbox.1,
                    det.bbox.2,
                    det.bbox.3,
                    det.url_frame,
                    ts
                ],
            )?;
        }

        // Enrich detected_classes, bounded by the class catalog
        let mut classes: Vec<String> = serde_json::from_str(&classes_json).unwrap_or_default();
        let mut enriched = false;
        for det in detections {
            if CLASS_CATALOG.contains(&det.cls.as_str()) && !classes.contains(&det.cls) {
                classes.push(det.cls.clone());
                enriched = true;
            }
        }
        if enriched {
            classes.sort();
            tx.execute(
                "UPDATE sessions SET detected_classes = ?2 WHERE session_id = ?1",
                params![session_id, serde_json::to_string(&classes).unwrap_or_default()],
            )?;
        }

        let total: usize = tx.query_row(
            "SELECT COUNT(*) FROM detections WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok((total - count_before, total))
    }

    pub fn list_detections(&self, session_id: &str) -> Result<Vec<DetectionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT session_id, track_id, cls, conf, bbox_x, bbox_y, bbox_w, bbox_h,
                    url_frame, first_ts, last_ts
             FROM detections WHERE session_id = ?1 ORDER BY first_ts, track_id",
        )?;
        let rows = stmt.query_map(params![session_id], |row| {
            Ok(DetectionRecord {
                session_id: row.get(0)?,
                track_id: row.get(1)?,
                cls: row.get(2)?,
                conf: row.get(3)?,
                bbox: (row.get(4)?, row.get(5)?, row.get(6)?, row.get(7)?),
                url_frame: row.get(8)?,
                first_ts: row.get(9)?,
                last_ts: row.get(10)?,
            })
        })?;
        rows.collect::<rusqlite::Result<_>>().map_err(StoreError::from)
    }

    /// Apply a media hook to the session currently open on `path`, falling
    /// back to the most recent session for that path. Returns false when no
    /// session matches.
    pub fn apply_media_hook(&self, path: &str, hook: MediaHook, ts: i64) -> Result<bool> {
        let conn = self.conn.lock();
        let session_id: Option<String> = conn
            .query_row(
                "SELECT session_id FROM sessions WHERE path = ?1
                 ORDER BY (status = 'open') DESC, start_ts DESC LIMIT 1",
                params![path],
                |row| row.get(0),
            )
            .optional()?;
        let Some(session_id) = session_id else {
            tracing::debug!(path, "media hook for unknown path ignored");
            return Ok(false);
        };

        let column_update = match hook {
            // First-seen only: later publishes must not move the timestamps
            MediaHook::Publish => "media_connect_ts = COALESCE(media_connect_ts, ?2)",
            MediaHook::SegmentStart => "media_start_ts = COALESCE(media_start_ts, ?2)",
            // Monotonic nondecreasing
            MediaHook::SegmentComplete => "media_end_ts = MAX(COALESCE(media_end_ts, 0), ?2)",
        };
        conn.execute(
            &format!(
                "UPDATE sessions SET {column_update},
                     recommended_start_offset_ms =
                         COALESCE(recommended_start_offset_ms, {DEFAULT_START_OFFSET_MS})
                 WHERE session_id = ?1"
            ),
            params![session_id, ts],
        )?;
        Ok(true)
    }
}

const SESSION_SELECT: &str = "SELECT session_id, device_id, path, start_ts, end_ts, postroll_sec,
        status, reason, detected_classes, media_connect_ts, media_start_ts,
        media_end_ts, recommended_start_offset_ms
 FROM sessions";

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
    let classes_json: String = row.get(8)?;
    Ok(SessionRecord {
        session_id: row.get(0)?,
        device_id: row.get(1)?,
        path: row.get(2)?,
        start_ts: row.get(3)?,
        end_ts: row.get(4)?,
        postroll_sec: row.get(5)?,
        status: row.get(6)?,
        reason: row.get(7)?,
        detected_classes: serde_json::from_str(&classes_json).unwrap_or_default(),
        media_connect_ts: row.get(9)?,
        media_start_ts: row.get(10)?,
        media_end_ts: row.get(11)?,
        recommended_start_offset_ms: row.get(12)?,
    })
}
