//! Session lifecycle state machine.
//!
//! Drives IDLE → DWELL → ACTIVE → CLOSING from bus events and talks to its
//! collaborators through capability traits only: the recording publisher,
//! the AI feeder, and the session store. All events — detections, keepalives
//! and timer expiries — arrive through one bus subscription, so state is
//! mutated from a single task and never needs a lock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::ai::cache::epoch_ms;
use crate::ai::feeder::AiFeeder;
use crate::bus::{Event, EventBus, Subscription};
use crate::capture::Publisher;
use crate::orchestrator::session::SessionManager;
use crate::orchestrator::store_client::{
    CloseSessionRequest, OpenSessionRequest, SessionStoreClient,
};
use crate::orchestrator::timers::TimerManager;

/// Orchestrator states. One instance per agent process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    Idle,
    Dwell,
    Active,
    Closing,
}

/// Capability the orchestrator uses to steer the AI feeder.
pub trait AiControl: Send + Sync {
    fn set_session_id(&self, session_id: Option<String>);
    fn send_end(&self, session_id: &str);
    fn set_fps(&self, fps: f64);
}

impl AiControl for AiFeeder {
    fn set_session_id(&self, session_id: Option<String>) {
        AiFeeder::set_session_id(self, session_id);
    }

    fn send_end(&self, session_id: &str) {
        AiFeeder::send_end(self, session_id);
    }

    fn set_fps(&self, fps: f64) {
        AiFeeder::set_fps(self, fps);
    }
}

/// Wall-clock source, injectable for timer-sensitive tests.
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

#[derive(Clone)]
pub struct OrchestratorConfig {
    pub device_id: String,
    pub path: String,
    pub fps_idle: f64,
    pub fps_active: f64,
    pub postroll_sec: u64,
    pub close_retry_initial: Duration,
    /// Total time spent retrying a failed close before marking the session
    /// closed locally.
    pub close_retry_window: Duration,
    pub clock: Clock,
}

impl OrchestratorConfig {
    pub fn new(device_id: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            path: path.into(),
            fps_idle: 2.0,
            fps_active: 6.0,
            postroll_sec: 3,
            close_retry_initial: Duration::from_millis(500),
            close_retry_window: Duration::from_secs(30),
            clock: Arc::new(epoch_ms),
        }
    }
}

/// The orchestrator. Owns the FSM state and the timer manager.
pub struct Orchestrator {
    config: OrchestratorConfig,
    state: FsmState,
    /// Whether a relevant detection arrived since entering DWELL — the
    /// initial trigger does not count towards sustained presence.
    dwell_seen: bool,
    timers: TimerManager,
    bus: EventBus,
    ai: Arc<dyn AiControl>,
    record: Arc<dyn Publisher>,
    store: Arc<dyn SessionStoreClient>,
    session: Arc<SessionManager>,
    state_tx: watch::Sender<FsmState>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: OrchestratorConfig,
        timers: TimerManager,
        bus: EventBus,
        ai: Arc<dyn AiControl>,
        record: Arc<dyn Publisher>,
        store: Arc<dyn SessionStoreClient>,
        session: Arc<SessionManager>,
    ) -> Self {
        let (state_tx, _) = watch::channel(FsmState::Idle);
        Self {
            config,
            state: FsmState::Idle,
            dwell_seen: false,
            timers,
            bus,
            ai,
            record,
            store,
            session,
            state_tx,
        }
    }

    pub fn state(&self) -> FsmState {
        self.state
    }

    /// Observe state changes from outside the event loop.
    pub fn state_watch(&self) -> watch::Receiver<FsmState> {
        self.state_tx.subscribe()
    }

    /// Consume bus events until the bus shuts down, then run the exit path.
    pub async fn run(mut self, subscription: Subscription) {
        while let Some(event) = subscription.recv().await {
            self.handle_event(event).await;
        }
        self.shutdown().await;
    }

    /// One FSM step. Unmatched (state, event) pairs — including duplicate
    /// timer firings — are no-ops.
    pub async fn handle_event(&mut self, event: Event) {
        let previous = self.state;
        let handled = match (previous, &event) {
            (FsmState::Idle, Event::AiDetection { .. }) => {
                self.state = FsmState::Dwell;
                self.dwell_seen = false;
                tracing::info!("relevant detection, entering dwell");
                true
            }
            (FsmState::Dwell, Event::AiDetection { .. }) => {
                self.dwell_seen = true;
                true
            }
            (FsmState::Dwell, Event::DwellElapsed) => {
                if self.dwell_seen {
                    self.activate().await;
                } else {
                    tracing::info!("presence not sustained through dwell, back to idle");
                    self.state = FsmState::Idle;
                }
                true
            }
            (FsmState::Active, Event::AiDetection { detections, .. }) => {
                let fresh = self
                    .session
                    .note_classes(detections.iter().map(|d| d.cls.as_str()));
                if !fresh.is_empty() {
                    tracing::debug!(?fresh, "session classes enriched");
                }
                true
            }
            // Keepalives confirm the worker is alive but never extend a session
            (FsmState::Active, Event::AiKeepalive { .. }) => true,
            (FsmState::Active, Event::SilenceElapsed) => {
                tracing::info!("silence window elapsed, entering post-roll");
                self.state = FsmState::Closing;
                true
            }
            (FsmState::Closing, Event::AiDetection { detections, .. }) => {
                tracing::info!("detection during post-roll, back to active");
                self.state = FsmState::Active;
                self.session
                    .note_classes(detections.iter().map(|d| d.cls.as_str()));
                true
            }
            (FsmState::Closing, Event::PostrollElapsed) => {
                self.deactivate().await;
                true
            }
            _ => {
                tracing::trace!(state = ?previous, event = event.topic(), "event ignored");
                false
            }
        };

        if handled {
            self.timers.manage_timers(self.state, previous, &event);
        }
        if self.state != previous {
            let _ = self.state_tx.send(self.state);
        }
    }

    /// DWELL → ACTIVE: open the session, arm the recording path.
    async fn activate(&mut self) {
        let session_id = format!("{}-{}", self.config.path, Uuid::new_v4());
        let start_ts = (self.config.clock)();
        let request = OpenSessionRequest {
            session_id: session_id.clone(),
            dev_id: self.config.device_id.clone(),
            start_ts,
            path: self.config.path.clone(),
            reason: Some("detection".to_string()),
        };

        if let Err(e) = self.store.open_session(&request).await {
            tracing::error!("session open failed, aborting activation: {e}");
            self.state = FsmState::Idle;
            self.bus.publish(Event::SessionOpenError {
                reason: e.to_string(),
            });
            return;
        }

        self.session.open(&session_id);
        // Propagate the id immediately: frames submitted from here on are
        // tagged, even while the rest of the activation is still running
        self.ai.set_session_id(Some(session_id.clone()));
        match self.record.start() {
            Ok(()) => self.bus.publish(Event::PublisherStarted),
            Err(e) => tracing::error!("recording publisher failed to start: {e}"),
        }
        self.ai.set_fps(self.config.fps_active);
        self.state = FsmState::Active;
        tracing::info!(session = %session_id, "session open");
        self.bus.publish(Event::SessionOpen { session_id });
    }

    /// CLOSING → IDLE: stop recording, close the session, unwind the feeder.
    async fn deactivate(&mut self) {
        self.record.stop();
        self.bus.publish(Event::PublisherStopped);

        let session_id = self.session.active_session();
        self.session.close();
        self.ai.set_session_id(None);
        self.ai.set_fps(self.config.fps_idle);
        self.state = FsmState::Idle;

        if let Some(session_id) = session_id {
            self.ai.send_end(&session_id);
            let end_ts = (self.config.clock)();
            tracing::info!(session = %session_id, "session close");
            self.bus.publish(Event::SessionClose {
                session_id: session_id.clone(),
            });
            spawn_close_retry(
                Arc::clone(&self.store),
                self.bus.clone(),
                CloseSessionRequest {
                    session_id,
                    end_ts,
                    postroll_sec: Some(self.config.postroll_sec),
                },
                self.config.close_retry_initial,
                self.config.close_retry_window,
            );
        }
    }

    /// Exit path: a session still open at shutdown gets one close attempt,
    /// and every timer is cleared.
    pub async fn shutdown(&mut self) {
        self.timers.clear_all();
        if matches!(self.state, FsmState::Active | FsmState::Closing) {
            self.record.stop();
            if let Some(session_id) = self.session.active_session() {
                self.session.close();
                self.ai.send_end(&session_id);
                let request = CloseSessionRequest {
                    session_id: session_id.clone(),
                    end_ts: (self.config.clock)(),
                    postroll_sec: Some(self.config.postroll_sec),
                };
                if let Err(e) = self.store.close_session(&request).await {
                    tracing::warn!(session = %session_id, "close on shutdown failed: {e}");
                }
            }
            self.state = FsmState::Idle;
        }
    }
}

/// Retry a failed close with exponential backoff for up to `window`, then
/// give up and record the session as closed locally.
fn spawn_close_retry(
    store: Arc<dyn SessionStoreClient>,
    bus: EventBus,
    request: CloseSessionRequest,
    initial: Duration,
    window: Duration,
) {
    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + window;
        let mut delay = initial;
        loop {
            match store.close_session(&request).await {
                Ok(()) => return,
                Err(e) if !e.is_retryable() => {
                    tracing::error!(session = %request.session_id, "session close rejected: {e}");
                    bus.publish(Event::SessionCloseError {
                        session_id: request.session_id.clone(),
                        reason: e.to_string(),
                    });
                    return;
                }
                Err(e) => {
                    if tokio::time::Instant::now() + delay >= deadline {
                        tracing::error!(
                            session = %request.session_id,
                            "session close retries exhausted, marking closed locally: {e}"
                        );
                        bus.publish(Event::SessionCloseError {
                            session_id: request.session_id.clone(),
                            reason: e.to_string(),
                        });
                        return;
                    }
                    tracing::warn!(session = %request.session_id, "session close failed, retrying: {e}");
                }
            }
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(5));
        }
    });
}
