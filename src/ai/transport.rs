//! Persistent TCP link to the inference worker.
//!
//! Owns the socket lifecycle: connect with jittered exponential backoff,
//! `Init`/`InitOk` handshake, bidirectional heartbeats, and reconnection
//! when the peer goes quiet. Inbound results are forwarded to the feeder
//! through an event channel wired in a second construction phase — neither
//! side owns the other; the bootstrap owns both.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::ai::error::AiError;
use crate::ai::types::Detection;
use crate::ai::wire::{try_read_payload, WorkerMessage};

/// Transport configuration. Defaults match the worker protocol contract.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub addr: String,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    /// Consecutive missed peer heartbeats that trigger reconnection.
    pub heartbeat_misses: u32,
    pub backoff_initial: Duration,
    pub backoff_cap: Duration,
}

impl TransportConfig {
    pub fn new(addr: impl Into<String>, model: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            addr: addr.into(),
            model: model.into(),
            width,
            height,
            format: "rgb".to_string(),
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_misses: 3,
            backoff_initial: Duration::from_millis(200),
            backoff_cap: Duration::from_secs(5),
        }
    }
}

/// Events the transport delivers to the feeder.
#[derive(Debug)]
pub enum TransportEvent {
    /// Handshake completed; frame flow may begin.
    Ready,
    /// A correlated inference result.
    Result {
        frame_id: u64,
        detections: Vec<Detection>,
    },
    /// Connection lost; the feeder must stop sending until the next `Ready`.
    Disconnected,
    /// Non-fatal transport-level error worth surfacing.
    Error(AiError),
}

enum Command {
    Send(WorkerMessage),
    Shutdown,
}

/// Sending capability towards the worker. The feeder depends on this trait
/// so tests can substitute a recording fake.
pub trait WorkerLink: Send + Sync {
    /// Queue a message for the worker without awaiting.
    fn send(&self, msg: WorkerMessage) -> Result<(), AiError>;
}

/// Cloneable sending capability handed to the feeder.
#[derive(Clone)]
pub struct TransportHandle {
    cmd_tx: mpsc::Sender<Command>,
}

impl WorkerLink for TransportHandle {
    /// Fails when the outbound queue is full or the transport task is gone.
    fn send(&self, msg: WorkerMessage) -> Result<(), AiError> {
        self.cmd_tx
            .try_send(Command::Send(msg))
            .map_err(|e| AiError::FrameSend(e.to_string()))
    }
}

/// The worker transport. Construct, then `set_sink`, then `start`.
pub struct WorkerTransport {
    config: TransportConfig,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: Mutex<Option<mpsc::Receiver<Command>>>,
    sink: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WorkerTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        Self {
            config,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            sink: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Second construction phase: wire the feeder's event channel.
    pub fn set_sink(&self, sink: mpsc::Sender<TransportEvent>) {
        *self.sink.lock() = Some(sink);
    }

    /// Sending capability for the feeder.
    pub fn handle(&self) -> TransportHandle {
        TransportHandle {
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    /// Spawn the connection task. Panics if `set_sink` was not called or
    /// `start` runs twice — both are bootstrap ordering bugs.
    pub fn start(&self) {
        let sink = self.sink.lock().clone().expect("set_sink before start");
        let cmd_rx = self
            .cmd_rx
            .lock()
            .take()
            .expect("transport started twice");
        let config = self.config.clone();
        let task = tokio::spawn(run_connection(config, cmd_rx, sink));
        *self.task.lock() = Some(task);
    }

    /// Graceful shutdown: closes the connection and stops the task.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(Command::Shutdown).await;
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Full-jitter backoff delay: uniform in [0, current].
fn jittered(current: Duration) -> Duration {
    let cap_ms = current.as_millis().max(1) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms))
}

async fn run_connection(
    config: TransportConfig,
    mut cmd_rx: mpsc::Receiver<Command>,
    sink: mpsc::Sender<TransportEvent>,
) {
    let mut backoff = config.backoff_initial;
    loop {
        let stream = match TcpStream::connect(&config.addr).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::debug!(addr = %config.addr, "worker connect failed: {e}");
                if wait_or_shutdown(&mut cmd_rx, jittered(backoff)).await {
                    return;
                }
                backoff = (backoff * 2).min(config.backoff_cap);
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let (mut rd, mut wr) = stream.into_split();

        match handshake(&config, &mut rd, &mut wr).await {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(addr = %config.addr, "worker handshake failed: {e}");
                let _ = sink.send(TransportEvent::Error(e)).await;
                if wait_or_shutdown(&mut cmd_rx, jittered(backoff)).await {
                    return;
                }
                backoff = (backoff * 2).min(config.backoff_cap);
                continue;
            }
        }

        backoff = config.backoff_initial;
        tracing::info!(addr = %config.addr, "worker connection ready");
        if sink.send(TransportEvent::Ready).await.is_err() {
            return;
        }

        let shutdown = serve_connection(&config, &mut cmd_rx, &sink, rd, wr).await;
        let _ = sink.send(TransportEvent::Disconnected).await;
        if shutdown {
            return;
        }
    }
}

/// Sleep for `delay`, returning true if a shutdown command arrived first.
/// Frame sends queued while disconnected are discarded.
async fn wait_or_shutdown(cmd_rx: &mut mpsc::Receiver<Command>, delay: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + delay;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return false,
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Shutdown) | None => return true,
                Some(Command::Send(_)) => {}
            },
        }
    }
}

async fn handshake(
    config: &TransportConfig,
    rd: &mut OwnedReadHalf,
    wr: &mut OwnedWriteHalf,
) -> Result<(), AiError> {
    let mut out = BytesMut::new();
    WorkerMessage::Init {
        model: config.model.clone(),
        width: config.width,
        height: config.height,
        format: config.format.clone(),
    }
    .encode(&mut out);
    wr.write_all(&out)
        .await
        .map_err(|e| AiError::Disconnected(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(256);
    let deadline = tokio::time::Instant::now() + config.handshake_timeout;
    loop {
        if let Some(mut payload) =
            try_read_payload(&mut buf).map_err(|e| AiError::Protocol(e.to_string()))?
        {
            return match WorkerMessage::decode(&mut payload) {
                Ok(WorkerMessage::InitOk) => Ok(()),
                Ok(other) => Err(AiError::Handshake(format!(
                    "expected InitOk, got {other:?}"
                ))),
                Err(e) => Err(AiError::Protocol(e.to_string())),
            };
        }
        let read = tokio::time::timeout_at(deadline, rd.read_buf(&mut buf));
        match read.await {
            Ok(Ok(0)) => return Err(AiError::Disconnected("closed during handshake".into())),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(AiError::Disconnected(e.to_string())),
            Err(_) => return Err(AiError::Handshake("InitOk timeout".into())),
        }
    }
}

/// Serve one established connection until it drops. Returns true on shutdown.
async fn serve_connection(
    config: &TransportConfig,
    cmd_rx: &mut mpsc::Receiver<Command>,
    sink: &mpsc::Sender<TransportEvent>,
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
) -> bool {
    let mut buf = BytesMut::with_capacity(8 * 1024);
    let mut out = BytesMut::new();
    let mut last_inbound = Instant::now();
    let quiet_limit = config.heartbeat_interval * config.heartbeat_misses;
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat.reset();

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Send(msg)) => {
                    out.clear();
                    msg.encode(&mut out);
                    if let Err(e) = wr.write_all(&out).await {
                        tracing::warn!("worker write failed: {e}");
                        return false;
                    }
                }
                Some(Command::Shutdown) | None => return true,
            },
            read = rd.read_buf(&mut buf) => match read {
                Ok(0) => {
                    tracing::info!("worker closed the connection");
                    return false;
                }
                Ok(_) => {
                    last_inbound = Instant::now();
                    if !drain_inbound(&mut buf, sink).await {
                        return false;
                    }
                }
                Err(e) => {
                    tracing::warn!("worker read failed: {e}");
                    return false;
                }
            },
            _ = heartbeat.tick() => {
                if last_inbound.elapsed() > quiet_limit {
                    tracing::warn!(
                        quiet_ms = last_inbound.elapsed().as_millis() as u64,
                        "worker heartbeats missed, reconnecting"
                    );
                    return false;
                }
                out.clear();
                WorkerMessage::Heartbeat.encode(&mut out);
                if let Err(e) = wr.write_all(&out).await {
                    tracing::warn!("heartbeat write failed: {e}");
                    return false;
                }
            }
        }
    }
}

/// Decode every complete payload in `buf`. Returns false when a protocol
/// error requires resetting the connection.
async fn drain_inbound(buf: &mut BytesMut, sink: &mpsc::Sender<TransportEvent>) -> bool {
    loop {
        match try_read_payload(buf) {
            Ok(Some(mut payload)) => match WorkerMessage::decode(&mut payload) {
                Ok(WorkerMessage::Result {
                    frame_id,
                    detections,
                }) => {
                    let _ = sink
                        .send(TransportEvent::Result {
                            frame_id,
                            detections,
                        })
                        .await;
                }
                Ok(WorkerMessage::Heartbeat) | Ok(WorkerMessage::InitOk) => {}
                Ok(other) => {
                    tracing::debug!("ignoring unexpected worker message {other:?}");
                }
                Err(e) => {
                    let _ = sink
                        .send(TransportEvent::Error(AiError::ResultParse(e.to_string())))
                        .await;
                    return false;
                }
            },
            Ok(None) => return true,
            Err(e) => {
                let _ = sink
                    .send(TransportEvent::Error(AiError::Protocol(e.to_string())))
                    .await;
                return false;
            }
        }
    }
}
