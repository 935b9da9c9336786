use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Track ids carrying this prefix are detector placeholders, not stable
/// tracker assignments, and are never ingested.
pub const PLACEHOLDER_TRACK_PREFIX: &str = "det-";

/// A single sampled frame from the capture pipeline.
///
/// Immutable after creation; shared as `Arc<Frame>` so the cache and the
/// in-flight path never copy pixel buffers.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic capture timestamp in nanoseconds.
    pub capture_ts_ns: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: String,
    pub data: Vec<u8>,
}

/// Pixel-space bounding box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x: f32,
    pub y: f32,
    pub w: f32,
    pub h: f32,
}

/// A single detection reported by the inference worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Detection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_id: Option<String>,
    pub cls: String,
    pub conf: f32,
    pub bbox: BBox,
}

impl Detection {
    /// A track is stable when the tracker assigned it a real id: non-empty
    /// and not a `det-` placeholder. Only stable tracks are ingested.
    pub fn has_stable_track(&self) -> bool {
        matches!(
            &self.track_id,
            Some(id) if !id.is_empty() && !id.starts_with(PLACEHOLDER_TRACK_PREFIX)
        )
    }
}

/// Frame metadata attached to detection/keepalive events.
///
/// Sourced from the frame cache when the entry is still live; synthesized
/// from wall-clock and configured dimensions after eviction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameMeta {
    pub frame_id: u64,
    /// Wall-clock timestamp in epoch milliseconds.
    pub ts_ms: u64,
    pub width: u32,
    pub height: u32,
    /// False when the cache entry had already expired and `ts_ms` was
    /// synthesized.
    pub from_cache: bool,
}

/// What to do when the in-flight window is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Drop the oldest pending request, window and cache entry both.
    LatestWins,
    /// Drop the oldest pending request but keep its cache entry so a late
    /// result can still correlate until TTL.
    DropOldest,
    /// Suspend the capture pull loop until a result frees a slot.
    Block,
}

/// Feeder configuration. Set once via `AiFeeder::init`.
#[derive(Debug, Clone, PartialEq)]
pub struct AiConfig {
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub max_inflight: usize,
    pub classes_filter: Vec<String>,
    pub confidence_threshold: f32,
    pub policy: OverflowPolicy,
    pub preferred_format: String,
    pub fps_idle: f64,
    pub fps_active: f64,
}

impl AiConfig {
    /// True when the detection passes the class filter and the confidence
    /// threshold.
    pub fn is_relevant(&self, detection: &Detection) -> bool {
        detection.conf >= self.confidence_threshold
            && self.classes_filter.iter().any(|c| *c == detection.cls)
    }
}

/// Cheap shared handle to a frame plus the id the feeder assigned it.
pub type SharedFrame = Arc<Frame>;

#[cfg(test)]
mod tests {
    use super::*;

    fn det(track_id: Option<&str>, cls: &str, conf: f32) -> Detection {
        Detection {
            track_id: track_id.map(str::to_string),
            cls: cls.to_string(),
            conf,
            bbox: BBox {
                x: 0.0,
                y: 0.0,
                w: 10.0,
                h: 10.0,
            },
        }
    }

    fn config() -> AiConfig {
        AiConfig {
            model: "m".into(),
            width: 640,
            height: 384,
            max_inflight: 4,
            classes_filter: vec!["person".into(), "car".into()],
            confidence_threshold: 0.5,
            policy: OverflowPolicy::LatestWins,
            preferred_format: "rgb".into(),
            fps_idle: 2.0,
            fps_active: 6.0,
        }
    }

    #[test]
    fn stable_track_requires_non_empty_id() {
        assert!(det(Some("t1"), "person", 0.9).has_stable_track());
        assert!(!det(Some(""), "person", 0.9).has_stable_track());
        assert!(!det(None, "person", 0.9).has_stable_track());
    }

    #[test]
    fn placeholder_track_is_not_stable() {
        assert!(!det(Some("det-17"), "person", 0.9).has_stable_track());
        // Prefix must match exactly at the start
        assert!(det(Some("cadet-17"), "person", 0.9).has_stable_track());
    }

    #[test]
    fn relevance_requires_class_and_confidence() {
        let cfg = config();
        assert!(cfg.is_relevant(&det(None, "person", 0.5)));
        assert!(cfg.is_relevant(&det(None, "car", 0.99)));
        assert!(!cfg.is_relevant(&det(None, "person", 0.49)));
        assert!(!cfg.is_relevant(&det(None, "unicorn", 0.99)));
    }

    #[test]
    fn detection_serialises_to_camel_case() {
        let d = det(Some("t1"), "person", 0.75);
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["trackId"], "t1");
        assert_eq!(json["cls"], "person");
        assert!(json.get("track_id").is_none());
    }

    #[test]
    fn detection_without_track_omits_field() {
        let d = det(None, "person", 0.75);
        let json = serde_json::to_value(&d).unwrap();
        assert!(json.get("trackId").is_none());
    }

    #[test]
    fn overflow_policy_parses_from_snake_case() {
        let p: OverflowPolicy = serde_json::from_str("\"latest_wins\"").unwrap();
        assert_eq!(p, OverflowPolicy::LatestWins);
        let p: OverflowPolicy = serde_json::from_str("\"drop_oldest\"").unwrap();
        assert_eq!(p, OverflowPolicy::DropOldest);
        let p: OverflowPolicy = serde_json::from_str("\"block\"").unwrap();
        assert_eq!(p, OverflowPolicy::Block);
    }
}
