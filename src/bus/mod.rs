//! In-process typed pub/sub.
//!
//! Publishing never blocks: each subscription owns a bounded queue and
//! overflow drops the oldest queued event on that subscriber only, recorded
//! in a counter. A subscription may span several topics and is drained by a
//! single task, so one subscriber's handler is never run concurrently with
//! itself — the orchestrator relies on this for FSM serialization.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;

use crate::ai::types::{Detection, FrameMeta};

/// Default per-subscriber queue bound.
pub const QUEUE_CAPACITY: usize = 1024;

/// Well-known topic names.
pub mod topic {
    pub const AI_DETECTION: &str = "ai.detection";
    pub const AI_KEEPALIVE: &str = "ai.keepalive";
    pub const FSM_DWELL_OK: &str = "fsm.t.dwell.ok";
    pub const FSM_SILENCE_OK: &str = "fsm.t.silence.ok";
    pub const FSM_POSTROLL_OK: &str = "fsm.t.postroll.ok";
    pub const SESSION_OPEN: &str = "session.open";
    pub const SESSION_CLOSE: &str = "session.close";
    pub const SESSION_OPEN_ERROR: &str = "session.open.error";
    pub const SESSION_CLOSE_ERROR: &str = "session.close.error";
    pub const PUBLISHER_STARTED: &str = "publisher.started";
    pub const PUBLISHER_STOPPED: &str = "publisher.stopped";
}

/// Tagged-variant events carried on the bus.
#[derive(Debug, Clone)]
pub enum Event {
    /// Relevant detections for one frame. Never published with an empty set.
    AiDetection {
        meta: FrameMeta,
        detections: Vec<Detection>,
    },
    /// Worker responded but nothing relevant was detected.
    AiKeepalive { meta: FrameMeta },
    DwellElapsed,
    SilenceElapsed,
    PostrollElapsed,
    SessionOpen { session_id: String },
    SessionClose { session_id: String },
    SessionOpenError { reason: String },
    SessionCloseError { session_id: String, reason: String },
    PublisherStarted,
    PublisherStopped,
}

impl Event {
    /// Topic this event is published under.
    pub fn topic(&self) -> &'static str {
        match self {
            Event::AiDetection { .. } => topic::AI_DETECTION,
            Event::AiKeepalive { .. } => topic::AI_KEEPALIVE,
            Event::DwellElapsed => topic::FSM_DWELL_OK,
            Event::SilenceElapsed => topic::FSM_SILENCE_OK,
            Event::PostrollElapsed => topic::FSM_POSTROLL_OK,
            Event::SessionOpen { .. } => topic::SESSION_OPEN,
            Event::SessionClose { .. } => topic::SESSION_CLOSE,
            Event::SessionOpenError { .. } => topic::SESSION_OPEN_ERROR,
            Event::SessionCloseError { .. } => topic::SESSION_CLOSE_ERROR,
            Event::PublisherStarted => topic::PUBLISHER_STARTED,
            Event::PublisherStopped => topic::PUBLISHER_STOPPED,
        }
    }
}

/// Bus errors.
#[derive(Debug, Clone, Error)]
pub enum BusError {
    #[error("bus is shut down")]
    ClosedBus,
}

struct SubscriberQueue {
    name: String,
    topics: Vec<&'static str>,
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
    capacity: usize,
}

struct BusInner {
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    closed: AtomicBool,
}

/// Process-wide event bus. Cheap to clone; passed as an explicit
/// collaborator so tests can run components against a private instance.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Register a subscription over the given topics.
    ///
    /// Fails with [`BusError::ClosedBus`] after shutdown.
    pub fn subscribe(
        &self,
        name: impl Into<String>,
        topics: &[&'static str],
    ) -> Result<Subscription, BusError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(BusError::ClosedBus);
        }
        let queue = Arc::new(SubscriberQueue {
            name: name.into(),
            topics: topics.to_vec(),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            capacity: QUEUE_CAPACITY,
        });
        self.inner.subscribers.lock().push(Arc::clone(&queue));
        Ok(Subscription {
            queue,
            bus: Arc::clone(&self.inner),
        })
    }

    /// Deliver an event to every subscription of its topic. Never blocks;
    /// overflow drops the oldest queued event on the offending subscriber.
    pub fn publish(&self, event: Event) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        let topic = event.topic();
        let subscribers = self.inner.subscribers.lock();
        for sub in subscribers.iter() {
            if !sub.topics.contains(&topic) {
                continue;
            }
            {
                let mut queue = sub.queue.lock();
                queue.push_back(event.clone());
                if queue.len() > sub.capacity {
                    queue.pop_front();
                    let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        subscriber = %sub.name,
                        dropped,
                        "subscriber queue overflow, dropping oldest event"
                    );
                }
            }
            sub.notify.notify_one();
        }
    }

    /// Close the bus. In-flight queues may still be drained; further
    /// subscribe calls fail and further publishes are discarded.
    pub fn shutdown(&self) {
        self.inner.closed.store(true, Ordering::Release);
        for sub in self.inner.subscribers.lock().iter() {
            sub.notify.notify_waiters();
        }
    }
}

/// Receiving half of one subscription. Drain from a single task to keep
/// per-subscriber FIFO.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
    bus: Arc<BusInner>,
}

impl Subscription {
    /// Receive the next event in publication order. Returns `None` once the
    /// bus is shut down and the queue is drained.
    pub async fn recv(&self) -> Option<Event> {
        loop {
            // Register for notification before checking the queue so an
            // event pushed between the check and the await is not missed.
            let notified = self.queue.notify.notified();
            if let Some(event) = self.queue.queue.lock().pop_front() {
                return Some(event);
            }
            if self.bus.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Pop without waiting.
    pub fn try_recv(&self) -> Option<Event> {
        self.queue.queue.lock().pop_front()
    }

    /// Events dropped on this subscription due to overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::types::BBox;

    fn meta(frame_id: u64) -> FrameMeta {
        FrameMeta {
            frame_id,
            ts_ms: 1_000,
            width: 640,
            height: 384,
            from_cache: true,
        }
    }

    fn detection_event(frame_id: u64) -> Event {
        Event::AiDetection {
            meta: meta(frame_id),
            detections: vec![Detection {
                track_id: Some("t1".into()),
                cls: "person".into(),
                conf: 0.9,
                bbox: BBox {
                    x: 0.0,
                    y: 0.0,
                    w: 1.0,
                    h: 1.0,
                },
            }],
        }
    }

    #[tokio::test]
    async fn delivers_in_publication_order() {
        let bus = EventBus::new();
        let sub = bus.subscribe("test", &[topic::AI_DETECTION]).unwrap();

        for i in 0..5 {
            bus.publish(detection_event(i));
        }
        for i in 0..5 {
            match sub.recv().await {
                Some(Event::AiDetection { meta, .. }) => assert_eq!(meta.frame_id, i),
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn only_matching_topics_are_delivered() {
        let bus = EventBus::new();
        let sub = bus.subscribe("keepalives", &[topic::AI_KEEPALIVE]).unwrap();

        bus.publish(detection_event(1));
        bus.publish(Event::AiKeepalive { meta: meta(2) });

        match sub.recv().await {
            Some(Event::AiKeepalive { meta }) => assert_eq!(meta.frame_id, 2),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn subscription_spans_multiple_topics_fifo() {
        let bus = EventBus::new();
        let sub = bus
            .subscribe("fsm", &[topic::AI_DETECTION, topic::FSM_DWELL_OK])
            .unwrap();

        bus.publish(detection_event(1));
        bus.publish(Event::DwellElapsed);
        bus.publish(detection_event(2));

        assert!(matches!(sub.recv().await, Some(Event::AiDetection { .. })));
        assert!(matches!(sub.recv().await, Some(Event::DwellElapsed)));
        assert!(matches!(sub.recv().await, Some(Event::AiDetection { .. })));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let bus = EventBus::new();
        let sub = bus.subscribe("slow", &[topic::AI_DETECTION]).unwrap();

        for i in 0..(QUEUE_CAPACITY as u64 + 3) {
            bus.publish(detection_event(i));
        }

        assert_eq!(sub.dropped(), 3);
        // Oldest three were dropped, so the head is frame 3
        match sub.recv().await {
            Some(Event::AiDetection { meta, .. }) => assert_eq!(meta.frame_id, 3),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscribe_after_shutdown_fails() {
        let bus = EventBus::new();
        bus.shutdown();
        assert!(matches!(
            bus.subscribe("late", &[topic::AI_DETECTION]),
            Err(BusError::ClosedBus)
        ));
    }

    #[tokio::test]
    async fn recv_returns_none_after_shutdown_drain() {
        let bus = EventBus::new();
        let sub = bus.subscribe("test", &[topic::AI_DETECTION]).unwrap();
        bus.publish(detection_event(1));
        bus.shutdown();

        assert!(matches!(sub.recv().await, Some(Event::AiDetection { .. })));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_wakes_on_late_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe("test", &[topic::SESSION_OPEN]).unwrap();

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                bus.publish(Event::SessionOpen {
                    session_id: "s1".into(),
                });
            })
        };

        match sub.recv().await {
            Some(Event::SessionOpen { session_id }) => assert_eq!(session_id, "s1"),
            other => panic!("unexpected event: {other:?}"),
        }
        publisher.await.unwrap();
    }

    #[test]
    fn every_event_maps_to_a_topic() {
        assert_eq!(detection_event(1).topic(), "ai.detection");
        assert_eq!(Event::DwellElapsed.topic(), "fsm.t.dwell.ok");
        assert_eq!(Event::SilenceElapsed.topic(), "fsm.t.silence.ok");
        assert_eq!(Event::PostrollElapsed.topic(), "fsm.t.postroll.ok");
        assert_eq!(Event::PublisherStarted.topic(), "publisher.started");
        assert_eq!(Event::PublisherStopped.topic(), "publisher.stopped");
        assert_eq!(
            Event::SessionCloseError {
                session_id: "s".into(),
                reason: "r".into()
            }
            .topic(),
            "session.close.error"
        );
    }
}
