//! The three session-lifecycle timers.
//!
//! DWELL and POST-ROLL are fixed one-shots: started on state entry and never
//! reset while their state holds. SILENCE is resettable, but only by a
//! relevant detection — keepalives deliberately do not touch it. Expiry is
//! announced on the bus, never delivered synchronously, so timer handling is
//! serialized with every other orchestrator event.

use std::time::Duration;

use crate::bus::{Event, EventBus};
use crate::orchestrator::fsm::FsmState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Dwell,
    Silence,
    Postroll,
}

impl TimerKind {
    fn expiry_event(self) -> Event {
        match self {
            TimerKind::Dwell => Event::DwellElapsed,
            TimerKind::Silence => Event::SilenceElapsed,
            TimerKind::Postroll => Event::PostrollElapsed,
        }
    }
}

/// Owns the one-shot timer tasks and the start/clear rules around FSM
/// transitions.
pub struct TimerManager {
    bus: EventBus,
    dwell: Duration,
    silence: Duration,
    postroll: Duration,
    handles: [Option<tokio::task::JoinHandle<()>>; 3],
}

impl TimerManager {
    pub fn new(bus: EventBus, dwell: Duration, silence: Duration, postroll: Duration) -> Self {
        Self {
            bus,
            dwell,
            silence,
            postroll,
            handles: [None, None, None],
        }
    }

    /// Apply the timer rules after an FSM step.
    pub fn manage_timers(&mut self, current: FsmState, previous: FsmState, event: &Event) {
        // Exit-cleanup: whatever state was left behind loses its timer
        if previous != current {
            match previous {
                FsmState::Dwell => self.clear(TimerKind::Dwell),
                FsmState::Active => self.clear(TimerKind::Silence),
                FsmState::Closing => self.clear(TimerKind::Postroll),
                FsmState::Idle => {}
            }
        }

        match (previous, current) {
            // Entering DWELL arms the fixed confirmation window
            (FsmState::Idle, FsmState::Dwell) => self.start(TimerKind::Dwell),
            // Activation and re-activation both arm SILENCE
            (FsmState::Dwell, FsmState::Active) | (FsmState::Closing, FsmState::Active) => {
                self.start(TimerKind::Silence)
            }
            // A relevant detection while ACTIVE resets SILENCE; keepalives
            // fall through and leave it running
            (FsmState::Active, FsmState::Active) => {
                if matches!(event, Event::AiDetection { .. }) {
                    self.start(TimerKind::Silence);
                }
            }
            (FsmState::Active, FsmState::Closing) => self.start(TimerKind::Postroll),
            _ => {}
        }

        if current == FsmState::Idle {
            self.clear_all();
        }
    }

    /// Arm (or re-arm) one timer.
    pub fn start(&mut self, kind: TimerKind) {
        self.clear(kind);
        let duration = match kind {
            TimerKind::Dwell => self.dwell,
            TimerKind::Silence => self.silence,
            TimerKind::Postroll => self.postroll,
        };
        let bus = self.bus.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            bus.publish(kind.expiry_event());
        });
        self.handles[kind as usize] = Some(handle);
    }

    pub fn clear(&mut self, kind: TimerKind) {
        if let Some(handle) = self.handles[kind as usize].take() {
            handle.abort();
        }
    }

    /// Shutdown path: no timer survives.
    pub fn clear_all(&mut self) {
        self.clear(TimerKind::Dwell);
        self.clear(TimerKind::Silence);
        self.clear(TimerKind::Postroll);
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.handles[kind as usize]
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl Drop for TimerManager {
    fn drop(&mut self) {
        self.clear_all();
    }
}
