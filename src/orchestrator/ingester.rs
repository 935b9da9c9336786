//! Frame ingestion uploader.
//!
//! Uploads `(frame + detections)` pairs to the store `/ingest` endpoint as
//! multipart bodies. Concurrency is bounded by a fixed worker pool sized to
//! the feeder's in-flight window; excess jobs queue, and when the queue
//! exceeds twice the window the oldest pending job is dropped and counted.
//! Upload failures are never fatal to the agent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;

use crate::ai::types::{Detection, SharedFrame};

/// One pending upload.
#[derive(Clone)]
pub struct IngestJob {
    pub session_id: String,
    pub seq_no: u64,
    pub capture_ts_ns: u64,
    pub detections: Vec<Detection>,
    pub frame: SharedFrame,
}

/// The `meta` multipart field.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct IngestMeta<'a> {
    session_id: &'a str,
    seq_no: u64,
    capture_ts: u64,
    detections: &'a [Detection],
}

#[derive(Debug, Clone)]
pub struct IngesterConfig {
    pub ingest_url: String,
    /// Worker count; equals the feeder's in-flight window.
    pub workers: usize,
    pub max_body_bytes: usize,
    pub retry_initial: Duration,
    pub retry_cap: Duration,
    pub max_attempts: u32,
}

impl IngesterConfig {
    pub fn new(ingest_url: impl Into<String>, workers: usize) -> Self {
        Self {
            ingest_url: ingest_url.into(),
            workers: workers.max(1),
            max_body_bytes: 2 * 1024 * 1024,
            retry_initial: Duration::from_millis(250),
            retry_cap: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

struct IngesterInner {
    config: IngesterConfig,
    client: reqwest::Client,
    queue: Mutex<VecDeque<IngestJob>>,
    notify: Notify,
    queue_cap: usize,
    dropped: AtomicU64,
    uploaded: AtomicU64,
    failed: AtomicU64,
    shutdown: AtomicBool,
}

/// Bounded-concurrency multipart uploader. Cheap to clone.
#[derive(Clone)]
pub struct FrameIngester {
    inner: Arc<IngesterInner>,
    workers: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl FrameIngester {
    pub fn new(config: IngesterConfig) -> Self {
        let queue_cap = config.workers * 2;
        Self {
            inner: Arc::new(IngesterInner {
                config,
                client: reqwest::Client::new(),
                queue: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                queue_cap,
                dropped: AtomicU64::new(0),
                uploaded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                shutdown: AtomicBool::new(false),
            }),
            workers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Spawn the upload workers. Idempotent.
    pub fn start(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }
        for _ in 0..self.inner.config.workers {
            let inner = Arc::clone(&self.inner);
            workers.push(tokio::spawn(async move {
                worker_loop(inner).await;
            }));
        }
    }

    /// Queue a job. Returns false only after shutdown. Overflow drops the
    /// OLDEST pending job and bumps the counter.
    pub fn submit(&self, job: IngestJob) -> bool {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return false;
        }
        {
            let mut queue = self.inner.queue.lock();
            queue.push_back(job);
            if queue.len() > self.inner.queue_cap {
                queue.pop_front();
                let dropped = self.inner.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(dropped, "ingest queue overflow, dropping oldest upload");
            }
        }
        self.inner.notify.notify_one();
        true
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.inner.uploaded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }

    /// Stop accepting work and wait for the workers to drain.
    pub async fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
    }

    #[cfg(test)]
    pub(crate) fn take_pending(&self) -> Vec<IngestJob> {
        self.inner.queue.lock().drain(..).collect()
    }
}

async fn worker_loop(inner: Arc<IngesterInner>) {
    loop {
        // Register for wakeup before checking state so a notify_waiters
        // between the check and the await is not lost.
        let notified = inner.notify.notified();
        let job = inner.queue.lock().pop_front();
        match job {
            Some(job) => upload(&inner, job).await,
            None => {
                if inner.shutdown.load(Ordering::Acquire) {
                    return;
                }
                notified.await;
            }
        }
    }
}

async fn upload(inner: &IngesterInner, job: IngestJob) {
    let meta = IngestMeta {
        session_id: &job.session_id,
        seq_no: job.seq_no,
        capture_ts: job.capture_ts_ns,
        detections: &job.detections,
    };
    let meta_json = match serde_json::to_string(&meta) {
        Ok(json) => json,
        Err(e) => {
            tracing::warn!("ingest meta serialization failed: {e}");
            inner.failed.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    if job.frame.data.len() + meta_json.len() > inner.config.max_body_bytes {
        tracing::warn!(
            session = %job.session_id,
            seq = job.seq_no,
            bytes = job.frame.data.len(),
            "ingest body exceeds limit, skipping frame"
        );
        inner.failed.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let mut delay = inner.config.retry_initial;
    for attempt in 1..=inner.config.max_attempts {
        let form = reqwest::multipart::Form::new()
            .text("meta", meta_json.clone())
            .part(
                "frame",
                reqwest::multipart::Part::bytes(job.frame.data.clone()).file_name("frame.bin"),
            );

        match inner
            .client
            .post(&inner.config.ingest_url)
            .multipart(form)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => {
                inner.uploaded.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(resp) if resp.status().is_client_error() => {
                tracing::warn!(
                    status = resp.status().as_u16(),
                    session = %job.session_id,
                    seq = job.seq_no,
                    "ingest rejected, not retrying"
                );
                inner.failed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Ok(resp) => {
                tracing::debug!(
                    status = resp.status().as_u16(),
                    attempt,
                    "ingest upstream error, will retry"
                );
            }
            Err(e) => {
                tracing::debug!(attempt, "ingest transport error: {e}");
            }
        }

        if attempt == inner.config.max_attempts {
            break;
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(inner.config.retry_cap);
    }

    tracing::warn!(
        session = %job.session_id,
        seq = job.seq_no,
        "ingest gave up after {} attempts",
        inner.config.max_attempts
    );
    inner.failed.fetch_add(1, Ordering::Relaxed);
}
