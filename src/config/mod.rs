//! Configuration loading and validation.
//!
//! Settings come from a TOML file (`vigil.toml` by default) with environment
//! variables as a fallback for values the file omits. The file wins when both
//! are present. Validation failures are fatal: binaries exit with code 1
//! before binding any network resource.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ai::types::OverflowPolicy;

/// Fixed catalog of classes the detector can report. Override validation
/// and `detected_classes` enrichment are both bounded by this list.
pub const CLASS_CATALOG: &[&str] = &[
    "person",
    "car",
    "truck",
    "bus",
    "bicycle",
    "motorcycle",
    "dog",
    "cat",
];

/// Configuration errors. All of these are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Identity of the agent and the stream it watches.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    pub device_id: String,
    /// Media-server path of the stream; correlates recordings with sessions.
    pub path: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            device_id: "edge-01".to_string(),
            path: "cam1".to_string(),
        }
    }
}

/// Inference worker connection and filtering settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AiSection {
    pub worker_addr: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub max_inflight: usize,
    pub classes_filter: Vec<String>,
    pub confidence_threshold: f32,
    pub policy: OverflowPolicy,
    pub preferred_format: String,
}

impl Default for AiSection {
    fn default() -> Self {
        Self {
            worker_addr: "127.0.0.1:8600".to_string(),
            model: "yolov8n".to_string(),
            width: 640,
            height: 384,
            max_inflight: 4,
            classes_filter: vec!["person".to_string(), "car".to_string()],
            confidence_threshold: 0.5,
            policy: OverflowPolicy::LatestWins,
            preferred_format: "rgb".to_string(),
        }
    }
}

/// Sampling rates per FSM phase.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FpsSection {
    pub idle: f64,
    pub active: f64,
}

impl Default for FpsSection {
    fn default() -> Self {
        Self {
            idle: 2.0,
            active: 6.0,
        }
    }
}

/// Session lifecycle timer durations in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimersSection {
    pub dwell_ms: u64,
    pub silence_ms: u64,
    pub postroll_ms: u64,
}

impl Default for TimersSection {
    fn default() -> Self {
        Self {
            dwell_ms: 2000,
            silence_ms: 5000,
            postroll_ms: 3000,
        }
    }
}

impl TimersSection {
    pub fn dwell(&self) -> Duration {
        Duration::from_millis(self.dwell_ms)
    }

    pub fn silence(&self) -> Duration {
        Duration::from_millis(self.silence_ms)
    }

    pub fn postroll(&self) -> Duration {
        Duration::from_millis(self.postroll_ms)
    }
}

/// Session store settings, shared between the agent (client side) and the
/// `vigil-store` binary (server side).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreSection {
    pub base_url: String,
    pub listen: String,
    pub tracks_storage_path: PathBuf,
    pub db_path: PathBuf,
    pub media_base_url: String,
    pub playback_start_offset_ms: i64,
    pub playback_extra_seconds: i64,
    /// Shared secret expected in `X-Hook-Token`; empty disables the check.
    pub hook_token: String,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7070".to_string(),
            listen: "127.0.0.1:7070".to_string(),
            tracks_storage_path: PathBuf::from("./tracks"),
            db_path: PathBuf::from("./vigil-store.db"),
            media_base_url: "http://127.0.0.1:9996".to_string(),
            playback_start_offset_ms: 200,
            playback_extra_seconds: 5,
            hook_token: String::new(),
        }
    }
}

/// Manager / status ports.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StatusSection {
    pub port: u16,
}

impl Default for StatusSection {
    fn default() -> Self {
        Self { port: 7080 }
    }
}

/// Top-level configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub agent: AgentSection,
    pub ai: AiSection,
    pub fps: FpsSection,
    pub timers: TimersSection,
    pub store: StoreSection,
    pub status: StatusSection,
}

impl Config {
    /// Load from a TOML file, returning defaults when the file is missing.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            let mut config = Self::default();
            config.apply_env();
            config.validate()?;
            return Ok(config);
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Fill gaps from environment variables. The TOML file wins: only values
    /// still at their defaults are overridden here.
    fn apply_env(&mut self) {
        if self.status.port == StatusSection::default().port {
            if let Some(port) = env_port("EDGE_AGENT_STATUS_PORT") {
                self.status.port = port;
            }
        }
        if self.ai.classes_filter == AiSection::default().classes_filter {
            if let Ok(csv) = std::env::var("EDGE_AGENT_CLASSES_FILTER") {
                let classes: Vec<String> = csv
                    .split(',')
                    .map(|c| c.trim().to_string())
                    .filter(|c| !c.is_empty())
                    .collect();
                if !classes.is_empty() {
                    self.ai.classes_filter = classes;
                }
            }
        }
    }

    /// Validate startup invariants.
    pub fn validate(&self) -> Result<()> {
        if self.agent.device_id.is_empty() {
            return Err(ConfigError::Invalid("agent.device_id is empty".into()));
        }
        if self.agent.path.is_empty() {
            return Err(ConfigError::Invalid("agent.path is empty".into()));
        }
        if self.ai.max_inflight == 0 {
            return Err(ConfigError::Invalid("ai.max_inflight must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&self.ai.confidence_threshold) {
            return Err(ConfigError::Invalid(
                "ai.confidence_threshold must be within [0, 1]".into(),
            ));
        }
        if self.fps.idle <= 0.0 || self.fps.active <= 0.0 {
            return Err(ConfigError::Invalid("fps rates must be positive".into()));
        }
        if self.timers.dwell_ms == 0 || self.timers.silence_ms == 0 || self.timers.postroll_ms == 0
        {
            return Err(ConfigError::Invalid("timer durations must be non-zero".into()));
        }
        Ok(())
    }
}

/// Parse a port from an environment variable, ignoring unset or invalid values.
fn env_port(name: &str) -> Option<u16> {
    std::env::var(name).ok()?.parse().ok()
}
