// Capture and publishing collaborators — the GStreamer side of the system
// lives behind these traits and is out of scope here.

pub mod sim;

use thiserror::Error;

use crate::ai::types::SharedFrame;

/// Capture subsystem errors.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("capture start failed: {0}")]
    Start(String),

    #[error("publisher start failed: {0}")]
    Publish(String),
}

/// Convenience Result alias.
pub type Result<T> = std::result::Result<T, CaptureError>;

/// Frame source capability. Implementations run their pipeline outside the
/// agent event loop (threads, GStreamer) and expose the most recent sample
/// through a shared buffer.
pub trait Capture: Send + Sync {
    fn start(&self) -> Result<()>;

    /// Stop the pipeline. Idempotent.
    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Adjust the sampling rate. Takes effect on the next frame.
    fn set_fps(&self, fps: f64);

    /// Latest sampled frame with its monotonically increasing sequence
    /// number. The sequence lets pollers skip frames they already consumed.
    fn latest_frame(&self) -> Option<(u64, SharedFrame)>;
}

/// Stream publisher capability (live feed or recording feed towards the
/// media server).
pub trait Publisher: Send + Sync {
    fn start(&self) -> Result<()>;

    /// Stop publishing. Idempotent.
    fn stop(&self);

    fn is_running(&self) -> bool;
}
