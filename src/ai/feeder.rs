//! The AI feeder: couples the capture pipeline to the inference worker.
//!
//! One logical producer pulls the latest captured frame at the FSM-dictated
//! rate, stamps it with a monotonic frame id, caches it for correlation, and
//! sends it to the worker without awaiting the response. Results come back
//! through the transport event channel, are matched by frame id, filtered by
//! class and confidence, and fan out three ways: ingestion (stable tracks
//! during a session), the event bus (`ai.detection` / `ai.keepalive`), and
//! the observer callbacks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, Notify};

use crate::ai::cache::{epoch_ms, FrameCache};
use crate::ai::error::{AiError, Result};
use crate::ai::transport::{TransportEvent, WorkerLink, WorkerTransport};
use crate::ai::types::{AiConfig, Detection, FrameMeta, OverflowPolicy, SharedFrame};
use crate::ai::wire::WorkerMessage;
use crate::bus::{Event, EventBus};
use crate::capture::Capture;
use crate::orchestrator::session::SessionManager;

/// Observer callbacks. All of them run on the feeder's task and must
/// return promptly; heavier work belongs behind the bus.
#[derive(Default)]
pub struct FeederCallbacks {
    pub on_ready: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_result: Option<Box<dyn Fn(u64, &[Detection]) + Send + Sync>>,
    pub on_error: Option<Box<dyn Fn(&AiError) + Send + Sync>>,
}

/// Cumulative feeder counters.
#[derive(Default)]
struct FeederStats {
    submitted: AtomicU64,
    delivered: AtomicU64,
    dropped_window: AtomicU64,
    correlation_misses: AtomicU64,
    send_errors: AtomicU64,
}

/// Counter snapshot for the status endpoint.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeederSnapshot {
    pub submitted: u64,
    pub delivered: u64,
    pub dropped_window: u64,
    pub correlation_misses: u64,
    pub send_errors: u64,
    pub in_flight: usize,
}

struct FeederState {
    running: bool,
    ready: bool,
    session_id: Option<String>,
    next_frame_id: u64,
    in_flight: BTreeMap<u64, Instant>,
    last_capture_seq: u64,
    current_fps: f64,
    outage_reported: bool,
}

impl Default for FeederState {
    fn default() -> Self {
        Self {
            running: false,
            ready: false,
            session_id: None,
            next_frame_id: 1,
            in_flight: BTreeMap::new(),
            last_capture_seq: 0,
            current_fps: 1.0,
            outage_reported: false,
        }
    }
}

struct FeederInner {
    config: Mutex<Option<AiConfig>>,
    cache: FrameCache,
    link: Arc<dyn WorkerLink>,
    capture: Arc<dyn Capture>,
    bus: EventBus,
    session: Arc<SessionManager>,
    callbacks: Mutex<FeederCallbacks>,
    state: Mutex<FeederState>,
    window_free: Notify,
    stats: FeederStats,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

/// The feeder. Cheap to clone.
#[derive(Clone)]
pub struct AiFeeder {
    inner: Arc<FeederInner>,
}

impl AiFeeder {
    pub fn new(
        cache: FrameCache,
        link: Arc<dyn WorkerLink>,
        capture: Arc<dyn Capture>,
        bus: EventBus,
        session: Arc<SessionManager>,
    ) -> Self {
        Self {
            inner: Arc::new(FeederInner {
                config: Mutex::new(None),
                cache,
                link,
                capture,
                bus,
                session,
                callbacks: Mutex::new(FeederCallbacks::default()),
                state: Mutex::new(FeederState::default()),
                window_free: Notify::new(),
                stats: FeederStats::default(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Set the configuration exactly once.
    pub fn init(&self, config: AiConfig) -> Result<()> {
        let mut slot = self.inner.config.lock();
        if slot.is_some() {
            return Err(AiError::AlreadyInitialized);
        }
        self.inner.state.lock().current_fps = config.fps_idle;
        *slot = Some(config);
        Ok(())
    }

    pub fn set_callbacks(&self, callbacks: FeederCallbacks) {
        *self.inner.callbacks.lock() = callbacks;
    }

    /// Second construction phase: wire the transport's event channel into
    /// this feeder and spawn the event loop.
    pub fn connect_transport(&self, transport: &WorkerTransport) {
        let (tx, rx) = mpsc::channel(256);
        transport.set_sink(tx);
        self.spawn_event_loop(rx);
    }

    /// Consume transport events from `rx`. Exposed separately from
    /// [`Self::connect_transport`] so tests can drive the channel directly.
    pub fn spawn_event_loop(&self, mut rx: mpsc::Receiver<TransportEvent>) {
        let feeder = self.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                feeder.handle_transport_event(event).await;
            }
        });
        self.inner.tasks.lock().push(task);
    }

    /// Begin pulling frames. Idempotent once running.
    pub fn start(&self) -> Result<()> {
        let config = self
            .inner
            .config
            .lock()
            .clone()
            .ok_or(AiError::NotInitialized)?;
        {
            let mut state = self.inner.state.lock();
            if state.running {
                return Ok(());
            }
            state.running = true;
        }
        self.inner
            .capture
            .start()
            .map_err(|e| AiError::Capture(e.to_string()))?;

        let feeder = self.clone();
        let task = tokio::spawn(async move {
            feeder.run_producer(config).await;
        });
        self.inner.tasks.lock().push(task);
        Ok(())
    }

    /// Stop pulling and drain in-flight requests. Idempotent.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if !state.running {
                return;
            }
            state.running = false;
        }
        self.inner.window_free.notify_waiters();

        // Give outstanding requests a moment to correlate before giving up.
        let deadline = Instant::now() + Duration::from_secs(1);
        while Instant::now() < deadline {
            if self.inner.state.lock().in_flight.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.inner.state.lock().in_flight.clear();
    }

    /// Update pacing; propagated to the capture collaborator.
    pub fn set_fps(&self, fps: f64) {
        self.inner.state.lock().current_fps = fps;
        self.inner.capture.set_fps(fps);
    }

    /// Tag subsequent worker requests with this session id; `None` clears.
    pub fn set_session_id(&self, session_id: Option<String>) {
        self.inner.state.lock().session_id = session_id;
    }

    /// Advisory end-of-session signal to the worker.
    pub fn send_end(&self, session_id: &str) {
        if let Err(e) = self.inner.link.send(WorkerMessage::End {
            session_id: session_id.to_string(),
        }) {
            tracing::debug!("end-of-session signal not sent: {e}");
        }
    }

    /// The shared frame cache (read by the session manager).
    pub fn frame_cache(&self) -> FrameCache {
        self.inner.cache.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.state.lock().ready
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.state.lock().in_flight.len()
    }

    pub fn snapshot(&self) -> FeederSnapshot {
        FeederSnapshot {
            submitted: self.inner.stats.submitted.load(Ordering::Relaxed),
            delivered: self.inner.stats.delivered.load(Ordering::Relaxed),
            dropped_window: self.inner.stats.dropped_window.load(Ordering::Relaxed),
            correlation_misses: self.inner.stats.correlation_misses.load(Ordering::Relaxed),
            send_errors: self.inner.stats.send_errors.load(Ordering::Relaxed),
            in_flight: self.in_flight_len(),
        }
    }

    /// Abort background tasks. Part of agent shutdown, after `stop`.
    pub fn teardown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }

    async fn run_producer(&self, config: AiConfig) {
        loop {
            let (running, fps) = {
                let state = self.inner.state.lock();
                (state.running, state.current_fps)
            };
            if !running {
                break;
            }
            let period = Duration::from_secs_f64(1.0 / fps.max(0.1));
            tokio::time::sleep(period).await;

            let (ready, last_seq) = {
                let state = self.inner.state.lock();
                (state.ready, state.last_capture_seq)
            };
            if !ready {
                continue;
            }
            let Some((seq, frame)) = self.inner.capture.latest_frame() else {
                continue;
            };
            if seq == last_seq {
                continue;
            }
            self.submit_frame(&config, seq, frame).await;
        }
    }

    /// Admit one frame through the sliding window and send it. Returns true
    /// when the frame went out.
    pub(crate) async fn submit_frame(
        &self,
        config: &AiConfig,
        capture_seq: u64,
        frame: SharedFrame,
    ) -> bool {
        enum Step {
            Admit(u64, Option<String>),
            Evicted(Option<u64>),
            Block,
            Stop,
        }

        let (frame_id, session_id) = loop {
            let notified = self.inner.window_free.notified();
            let step = {
                let mut state = self.inner.state.lock();
                if !state.running || !state.ready {
                    Step::Stop
                } else if state.in_flight.len() < config.max_inflight {
                    let id = state.next_frame_id;
                    state.next_frame_id += 1;
                    state.in_flight.insert(id, Instant::now());
                    state.last_capture_seq = capture_seq;
                    Step::Admit(id, state.session_id.clone())
                } else {
                    match config.policy {
                        OverflowPolicy::LatestWins | OverflowPolicy::DropOldest => {
                            let oldest = state.in_flight.keys().next().copied();
                            if let Some(oldest) = oldest {
                                state.in_flight.remove(&oldest);
                            }
                            // LatestWins also evicts the cache entry so the
                            // late result becomes a correlation miss
                            let evict_cache = (config.policy == OverflowPolicy::LatestWins)
                                .then_some(oldest)
                                .flatten();
                            Step::Evicted(evict_cache)
                        }
                        OverflowPolicy::Block => Step::Block,
                    }
                }
            };
            match step {
                Step::Admit(id, session) => break (id, session),
                Step::Evicted(evict_cache) => {
                    if let Some(id) = evict_cache {
                        self.inner.cache.remove(id);
                    }
                    self.inner.stats.dropped_window.fetch_add(1, Ordering::Relaxed);
                }
                Step::Block => notified.await,
                Step::Stop => return false,
            }
        };

        self.inner.cache.put(frame_id, Arc::clone(&frame));
        let message = WorkerMessage::Frame {
            frame_id,
            session_id,
            width: frame.width,
            height: frame.height,
            capture_ts_ns: frame.capture_ts_ns,
            data: Bytes::from(frame.data.clone()),
        };
        match self.inner.link.send(message) {
            Ok(()) => {
                self.inner.stats.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.inner.state.lock().in_flight.remove(&frame_id);
                self.inner.cache.remove(frame_id);
                self.inner.stats.send_errors.fetch_add(1, Ordering::Relaxed);
                self.inner.window_free.notify_one();
                self.emit_error(&e);
                false
            }
        }
    }

    pub(crate) async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Ready => {
                let running = {
                    let mut state = self.inner.state.lock();
                    state.ready = true;
                    state.outage_reported = false;
                    state.running
                };
                // Degradation recovery: if capture was torn down while the
                // worker was away, bring it back before frames are expected
                if running && !self.inner.capture.is_running() {
                    if let Err(e) = self.inner.capture.start() {
                        self.emit_error(&AiError::Capture(e.to_string()));
                    }
                }
                let callbacks = self.inner.callbacks.lock();
                if let Some(on_ready) = &callbacks.on_ready {
                    on_ready();
                }
            }
            TransportEvent::Disconnected => {
                let report = {
                    let mut state = self.inner.state.lock();
                    state.ready = false;
                    state.in_flight.clear();
                    let report = !state.outage_reported;
                    state.outage_reported = true;
                    report
                };
                self.inner.window_free.notify_waiters();
                if report {
                    self.emit_error(&AiError::WorkerUnavailable(
                        "transport disconnected".into(),
                    ));
                }
            }
            TransportEvent::Error(e) => self.emit_error(&e),
            TransportEvent::Result {
                frame_id,
                detections,
            } => {
                let config = self.inner.config.lock().clone();
                if let Some(config) = config {
                    self.handle_result(&config, frame_id, detections).await;
                }
            }
        }
    }

    pub(crate) async fn handle_result(
        &self,
        config: &AiConfig,
        frame_id: u64,
        detections: Vec<Detection>,
    ) {
        let was_in_flight = {
            self.inner
                .state
                .lock()
                .in_flight
                .remove(&frame_id)
                .is_some()
        };
        if was_in_flight {
            self.inner.window_free.notify_one();
        }

        let cached = self.inner.cache.get(frame_id);
        if !was_in_flight && cached.is_none() {
            // Evicted under LatestWins, or long gone: discard the result
            self.inner
                .stats
                .correlation_misses
                .fetch_add(1, Ordering::Relaxed);
            return;
        }

        let relevant: Vec<Detection> = detections
            .iter()
            .filter(|d| config.is_relevant(d))
            .cloned()
            .collect();
        let stable: Vec<Detection> = relevant
            .iter()
            .filter(|d| d.has_stable_track())
            .cloned()
            .collect();
        self.inner.stats.delivered.fetch_add(1, Ordering::Relaxed);

        // Placeholder-only frames are intentionally not ingested: unstable
        // ids would pollute the per-session detection unique key
        if !stable.is_empty() {
            let _ = self.inner.session.ingest_frame(frame_id, stable).await;
        }

        let meta = match &cached {
            Some(entry) => FrameMeta {
                frame_id,
                ts_ms: entry.inserted_ts_ms,
                width: entry.frame.width,
                height: entry.frame.height,
                from_cache: true,
            },
            None => FrameMeta {
                frame_id,
                ts_ms: epoch_ms(),
                width: config.width,
                height: config.height,
                from_cache: false,
            },
        };

        if relevant.is_empty() {
            self.inner.bus.publish(Event::AiKeepalive { meta });
        } else {
            self.inner.bus.publish(Event::AiDetection {
                meta,
                detections: relevant.clone(),
            });
        }

        let callbacks = self.inner.callbacks.lock();
        if let Some(on_result) = &callbacks.on_result {
            on_result(frame_id, &relevant);
        }
        drop(callbacks);

        // Correlation complete; no reason to keep the bytes around
        self.inner.cache.remove(frame_id);
    }

    fn emit_error(&self, error: &AiError) {
        tracing::warn!("ai feeder: {error}");
        let callbacks = self.inner.callbacks.lock();
        if let Some(on_error) = &callbacks.on_error {
            on_error(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::types::{BBox, Frame};
    use crate::bus::topic;
    use crate::capture::{Capture, CaptureError};
    use crate::orchestrator::ingester::{FrameIngester, IngesterConfig};
    use std::sync::atomic::AtomicBool;

    /// Capture fake: frames are pushed explicitly.
    #[derive(Default)]
    struct ManualCapture {
        running: AtomicBool,
        latest: Mutex<Option<(u64, SharedFrame)>>,
    }

    impl ManualCapture {
        fn push(&self, seq: u64) {
            *self.latest.lock() = Some((
                seq,
                Arc::new(Frame {
                    capture_ts_ns: seq * 1_000,
                    width: 64,
                    height: 48,
                    pixel_format: "rgb".into(),
                    data: vec![1; 32],
                }),
            ));
        }
    }

    impl Capture for ManualCapture {
        fn start(&self) -> std::result::Result<(), CaptureError> {
            self.running.store(true, Ordering::Release);
            Ok(())
        }
        fn stop(&self) {
            self.running.store(false, Ordering::Release);
        }
        fn is_running(&self) -> bool {
            self.running.load(Ordering::Acquire)
        }
        fn set_fps(&self, _fps: f64) {}
        fn latest_frame(&self) -> Option<(u64, SharedFrame)> {
            self.latest.lock().clone()
        }
    }

    /// Worker link fake that records every message.
    #[derive(Default)]
    struct RecordingLink {
        sent: Mutex<Vec<WorkerMessage>>,
        fail: AtomicBool,
    }

    impl RecordingLink {
        fn sent_frames(&self) -> Vec<u64> {
            self.sent
                .lock()
                .iter()
                .filter_map(|m| match m {
                    WorkerMessage::Frame { frame_id, .. } => Some(*frame_id),
                    _ => None,
                })
                .collect()
        }
    }

    impl WorkerLink for RecordingLink {
        fn send(&self, msg: WorkerMessage) -> Result<()> {
            if self.fail.load(Ordering::Acquire) {
                return Err(AiError::FrameSend("simulated".into()));
            }
            self.sent.lock().push(msg);
            Ok(())
        }
    }

    struct Harness {
        feeder: AiFeeder,
        link: Arc<RecordingLink>,
        capture: Arc<ManualCapture>,
        bus: EventBus,
        session: Arc<SessionManager>,
        ingester: FrameIngester,
        config: AiConfig,
    }

    fn harness(policy: OverflowPolicy, max_inflight: usize) -> Harness {
        let cache = FrameCache::with_defaults();
        let link = Arc::new(RecordingLink::default());
        let capture = Arc::new(ManualCapture::default());
        let bus = EventBus::new();
        let ingester = FrameIngester::new(IngesterConfig::new("http://127.0.0.1:1/ingest", 4));
        let session = Arc::new(SessionManager::new(cache.clone(), ingester.clone()));
        let feeder = AiFeeder::new(
            cache,
            Arc::clone(&link) as Arc<dyn WorkerLink>,
            Arc::clone(&capture) as Arc<dyn Capture>,
            bus.clone(),
            Arc::clone(&session),
        );
        let config = AiConfig {
            model: "m".into(),
            width: 64,
            height: 48,
            max_inflight,
            classes_filter: vec!["person".into(), "car".into()],
            confidence_threshold: 0.5,
            policy,
            preferred_format: "rgb".into(),
            fps_idle: 2.0,
            fps_active: 6.0,
        };
        feeder.init(config.clone()).unwrap();
        Harness {
            feeder,
            link,
            capture,
            bus,
            session,
            ingester,
            config,
        }
    }

    /// Mark running+ready without spawning the producer loop.
    fn force_ready(h: &Harness) {
        let mut state = h.feeder.inner.state.lock();
        state.running = true;
        state.ready = true;
    }

    fn frame(seq: u64) -> SharedFrame {
        Arc::new(Frame {
            capture_ts_ns: seq * 1_000,
            width: 64,
            height: 48,
            pixel_format: "rgb".into(),
            data: vec![2; 32],
        })
    }

    fn det(track: Option<&str>, cls: &str, conf: f32) -> Detection {
        Detection {
            track_id: track.map(str::to_string),
            cls: cls.to_string(),
            conf,
            bbox: BBox {
                x: 0.0,
                y: 0.0,
                w: 4.0,
                h: 4.0,
            },
        }
    }

    #[test]
    fn init_twice_fails() {
        let h = harness(OverflowPolicy::LatestWins, 2);
        assert!(matches!(
            h.feeder.init(h.config.clone()),
            Err(AiError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn start_without_init_fails() {
        let cache = FrameCache::with_defaults();
        let link = Arc::new(RecordingLink::default());
        let capture = Arc::new(ManualCapture::default());
        let bus = EventBus::new();
        let ingester = FrameIngester::new(IngesterConfig::new("http://127.0.0.1:1/ingest", 4));
        let session = Arc::new(SessionManager::new(cache.clone(), ingester));
        let feeder = AiFeeder::new(cache, link, capture, bus, session);
        assert!(matches!(feeder.start(), Err(AiError::NotInitialized)));
    }

    #[tokio::test]
    async fn no_frames_sent_before_ready() {
        let h = harness(OverflowPolicy::LatestWins, 2);
        h.feeder.inner.state.lock().running = true;
        assert!(!h.feeder.submit_frame(&h.config, 1, frame(1)).await);
        assert!(h.link.sent_frames().is_empty());
    }

    #[tokio::test]
    async fn latest_wins_evicts_oldest_and_cache() {
        let h = harness(OverflowPolicy::LatestWins, 2);
        force_ready(&h);
        for seq in 1..=5 {
            assert!(h.feeder.submit_frame(&h.config, seq, frame(seq)).await);
            assert!(h.feeder.in_flight_len() <= 2);
        }
        // All five frames were sent; three oldest got evicted from the window
        assert_eq!(h.link.sent_frames(), vec![1, 2, 3, 4, 5]);
        assert_eq!(h.feeder.in_flight_len(), 2);
        assert_eq!(h.feeder.snapshot().dropped_window, 3);
        // Evicted entries are gone from the cache
        let cache = h.feeder.frame_cache();
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_none());
        assert!(cache.get(3).is_none());
        assert!(cache.get(4).is_some());
        assert!(cache.get(5).is_some());
    }

    #[tokio::test]
    async fn drop_oldest_keeps_cache_for_late_correlation() {
        let h = harness(OverflowPolicy::DropOldest, 2);
        force_ready(&h);
        for seq in 1..=3 {
            assert!(h.feeder.submit_frame(&h.config, seq, frame(seq)).await);
        }
        assert_eq!(h.feeder.in_flight_len(), 2);
        assert_eq!(h.feeder.snapshot().dropped_window, 1);
        // Frame 1 left the window but its cache entry remains until TTL
        assert!(h.feeder.frame_cache().get(1).is_some());

        // A late result for frame 1 still correlates through the cache
        let sub = h.bus.subscribe("test", &[topic::AI_KEEPALIVE]).unwrap();
        h.feeder.handle_result(&h.config, 1, vec![]).await;
        assert!(matches!(sub.recv().await, Some(Event::AiKeepalive { meta }) if meta.frame_id == 1));
        assert_eq!(h.feeder.snapshot().correlation_misses, 0);
    }

    #[tokio::test]
    async fn block_policy_suspends_until_result() {
        let h = harness(OverflowPolicy::Block, 2);
        force_ready(&h);
        assert!(h.feeder.submit_frame(&h.config, 1, frame(1)).await);
        assert!(h.feeder.submit_frame(&h.config, 2, frame(2)).await);

        let feeder = h.feeder.clone();
        let config = h.config.clone();
        let blocked = tokio::spawn(async move { feeder.submit_frame(&config, 3, frame(3)).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!blocked.is_finished(), "third frame should be blocked");

        // A result frees a slot and the blocked submission proceeds
        h.feeder.handle_result(&h.config, 1, vec![]).await;
        assert!(tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap());
        assert_eq!(h.link.sent_frames(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn latest_wins_conserves_every_frame() {
        let h = harness(OverflowPolicy::LatestWins, 2);
        force_ready(&h);
        let total = 100u64;
        for seq in 1..=total {
            assert!(h.feeder.submit_frame(&h.config, seq, frame(seq)).await);
        }
        // Worker answers every request it received
        for frame_id in h.link.sent_frames() {
            h.feeder.handle_result(&h.config, frame_id, vec![]).await;
        }
        let snap = h.feeder.snapshot();
        assert_eq!(snap.delivered + snap.dropped_window, total);
        assert_eq!(snap.delivered, 2);
        assert_eq!(snap.correlation_misses, total - 2);
        assert_eq!(snap.in_flight, 0);
    }

    #[tokio::test]
    async fn irrelevant_results_publish_keepalive() {
        let h = harness(OverflowPolicy::LatestWins, 2);
        force_ready(&h);
        let sub = h
            .bus
            .subscribe("test", &[topic::AI_DETECTION, topic::AI_KEEPALIVE])
            .unwrap();

        h.feeder.submit_frame(&h.config, 1, frame(1)).await;
        // Wrong class and low confidence: both filtered out
        h.feeder
            .handle_result(
                &h.config,
                1,
                vec![det(Some("t1"), "unicorn", 0.9), det(Some("t2"), "person", 0.2)],
            )
            .await;

        match sub.recv().await {
            Some(Event::AiKeepalive { meta }) => {
                assert_eq!(meta.frame_id, 1);
                assert!(meta.from_cache);
            }
            other => panic!("expected keepalive, got {other:?}"),
        }
        assert_eq!(h.ingester.pending(), 0);
    }

    #[tokio::test]
    async fn unstable_tracks_publish_but_do_not_ingest() {
        let h = harness(OverflowPolicy::LatestWins, 2);
        force_ready(&h);
        h.session.open("sess-1");
        let sub = h.bus.subscribe("test", &[topic::AI_DETECTION]).unwrap();

        h.feeder.submit_frame(&h.config, 1, frame(1)).await;
        h.feeder
            .handle_result(
                &h.config,
                1,
                vec![det(Some(""), "person", 0.9), det(Some("det-4"), "person", 0.8)],
            )
            .await;

        match sub.recv().await {
            Some(Event::AiDetection { detections, .. }) => assert_eq!(detections.len(), 2),
            other => panic!("expected detection event, got {other:?}"),
        }
        // FSM gets driven, but nothing reaches the ingest queue
        assert_eq!(h.ingester.pending(), 0);
    }

    #[tokio::test]
    async fn stable_tracks_are_ingested_during_session() {
        let h = harness(OverflowPolicy::LatestWins, 2);
        force_ready(&h);
        h.session.open("sess-1");

        h.feeder.submit_frame(&h.config, 1, frame(1)).await;
        h.feeder
            .handle_result(
                &h.config,
                1,
                vec![det(Some("t1"), "person", 0.9), det(Some(""), "person", 0.8)],
            )
            .await;

        let jobs = h.ingester.take_pending();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].session_id, "sess-1");
        assert_eq!(jobs[0].seq_no, 0);
        // Only the stable track made it into the upload
        assert_eq!(jobs[0].detections.len(), 1);
        assert_eq!(jobs[0].detections[0].track_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn expired_cache_synthesizes_meta() {
        let h = harness(OverflowPolicy::LatestWins, 2);
        force_ready(&h);
        let sub = h.bus.subscribe("test", &[topic::AI_KEEPALIVE]).unwrap();

        h.feeder.submit_frame(&h.config, 1, frame(1)).await;
        // Simulate TTL expiry between send and result
        h.feeder.frame_cache().remove(1);
        h.feeder.handle_result(&h.config, 1, vec![]).await;

        match sub.recv().await {
            Some(Event::AiKeepalive { meta }) => {
                assert!(!meta.from_cache);
                assert_eq!(meta.width, 64);
                assert_eq!(meta.height, 48);
                assert!(meta.ts_ms > 0);
            }
            other => panic!("expected keepalive, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_clears_window_and_reports_once() {
        let h = harness(OverflowPolicy::LatestWins, 4);
        force_ready(&h);
        let errors = Arc::new(AtomicU64::new(0));
        let errors_cb = Arc::clone(&errors);
        h.feeder.set_callbacks(FeederCallbacks {
            on_error: Some(Box::new(move |e| {
                if matches!(e, AiError::WorkerUnavailable(_)) {
                    errors_cb.fetch_add(1, Ordering::Relaxed);
                }
            })),
            ..FeederCallbacks::default()
        });

        h.feeder.submit_frame(&h.config, 1, frame(1)).await;
        h.feeder.submit_frame(&h.config, 2, frame(2)).await;
        assert_eq!(h.feeder.in_flight_len(), 2);

        h.feeder
            .handle_transport_event(TransportEvent::Disconnected)
            .await;
        h.feeder
            .handle_transport_event(TransportEvent::Disconnected)
            .await;

        assert_eq!(h.feeder.in_flight_len(), 0);
        assert!(!h.feeder.is_ready());
        // Reported once per outage, not per disconnect event
        assert_eq!(errors.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn ready_restarts_capture_after_teardown() {
        let h = harness(OverflowPolicy::LatestWins, 2);
        h.feeder.inner.state.lock().running = true;
        h.capture.stop();
        assert!(!h.capture.is_running());

        let ready_calls = Arc::new(AtomicU64::new(0));
        let ready_cb = Arc::clone(&ready_calls);
        h.feeder.set_callbacks(FeederCallbacks {
            on_ready: Some(Box::new(move || {
                ready_cb.fetch_add(1, Ordering::Relaxed);
            })),
            ..FeederCallbacks::default()
        });

        h.feeder.handle_transport_event(TransportEvent::Ready).await;
        assert!(h.capture.is_running());
        assert!(h.feeder.is_ready());
        assert_eq!(ready_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn send_failure_evicts_and_counts() {
        let h = harness(OverflowPolicy::LatestWins, 2);
        force_ready(&h);
        h.link.fail.store(true, Ordering::Release);

        assert!(!h.feeder.submit_frame(&h.config, 1, frame(1)).await);
        assert_eq!(h.feeder.in_flight_len(), 0);
        assert!(h.feeder.frame_cache().get(1).is_none());
        assert_eq!(h.feeder.snapshot().send_errors, 1);
    }

    #[tokio::test]
    async fn session_id_tags_outgoing_frames() {
        let h = harness(OverflowPolicy::LatestWins, 2);
        force_ready(&h);

        h.feeder.submit_frame(&h.config, 1, frame(1)).await;
        h.feeder.set_session_id(Some("sess-7".into()));
        h.feeder.submit_frame(&h.config, 2, frame(2)).await;
        h.feeder.set_session_id(None);
        h.feeder.submit_frame(&h.config, 3, frame(3)).await;

        let sent = h.link.sent.lock();
        let sessions: Vec<Option<String>> = sent
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Frame { session_id, .. } => Some(session_id.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(sessions, vec![None, Some("sess-7".to_string()), None]);
    }
}
