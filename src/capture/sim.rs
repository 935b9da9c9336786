//! Simulated capture and publisher backends.
//!
//! Let the agent run end-to-end without camera hardware or a media server,
//! and double as the capture fakes in tests. Frame contents are a synthetic
//! gradient; timing comes from the configured FPS.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::ai::types::{Frame, SharedFrame};
use crate::capture::{Capture, Publisher, Result};

/// Synthetic frame source producing frames at the configured rate.
pub struct SimCapture {
    width: u32,
    height: u32,
    fps: Arc<Mutex<f64>>,
    running: Arc<AtomicBool>,
    sequence: Arc<AtomicU64>,
    latest: Arc<Mutex<Option<(u64, SharedFrame)>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SimCapture {
    pub fn new(width: u32, height: u32, fps: f64) -> Self {
        Self {
            width,
            height,
            fps: Arc::new(Mutex::new(fps)),
            running: Arc::new(AtomicBool::new(false)),
            sequence: Arc::new(AtomicU64::new(0)),
            latest: Arc::new(Mutex::new(None)),
            task: Mutex::new(None),
        }
    }

    fn synth_frame(width: u32, height: u32, seq: u64) -> Frame {
        // Tiny gradient payload; enough to exercise the byte path without
        // allocating real video-sized buffers in tests.
        let len = (width as usize * height as usize).min(4096);
        let data = (0..len).map(|i| ((i as u64 + seq) & 0xff) as u8).collect();
        Frame {
            capture_ts_ns: monotonic_ns(),
            width,
            height,
            pixel_format: "rgb".to_string(),
            data,
        }
    }
}

impl Capture for SimCapture {
    fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let width = self.width;
        let height = self.height;
        let fps = Arc::clone(&self.fps);
        let running = Arc::clone(&self.running);
        let sequence = Arc::clone(&self.sequence);
        let latest = Arc::clone(&self.latest);

        let task = tokio::spawn(async move {
            while running.load(Ordering::Acquire) {
                let seq = sequence.fetch_add(1, Ordering::Relaxed) + 1;
                let frame = Arc::new(SimCapture::synth_frame(width, height, seq));
                *latest.lock() = Some((seq, frame));

                let rate = *fps.lock();
                let period = Duration::from_secs_f64(1.0 / rate.max(0.1));
                tokio::time::sleep(period).await;
            }
        });
        *self.task.lock() = Some(task);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn set_fps(&self, fps: f64) {
        *self.fps.lock() = fps;
    }

    fn latest_frame(&self) -> Option<(u64, SharedFrame)> {
        self.latest.lock().clone()
    }
}

/// Publisher stand-in: tracks running state, publishes nothing.
#[derive(Default)]
pub struct SimPublisher {
    running: AtomicBool,
}

impl SimPublisher {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Publisher for SimPublisher {
    fn start(&self) -> Result<()> {
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Monotonic clock reading in nanoseconds since an arbitrary epoch.
pub fn monotonic_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}
