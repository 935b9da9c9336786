//! Agent bootstrap and shutdown.
//!
//! Construction order is load-bearing: every bus subscriber (status
//! listener, orchestrator) is registered before the transport starts, so no
//! detection event can be published into the void. The feeder and transport
//! are built independently and wired in a second phase — the bootstrap owns
//! both.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::ai::cache::FrameCache;
use crate::ai::error::AiError;
use crate::ai::feeder::{AiFeeder, FeederCallbacks};
use crate::ai::transport::{TransportConfig, WorkerTransport};
use crate::ai::types::AiConfig;
use crate::bus::{topic, EventBus};
use crate::capture::sim::{SimCapture, SimPublisher};
use crate::capture::{Capture, CaptureError, Publisher};
use crate::config::Config;
use crate::orchestrator::fsm::{AiControl, Orchestrator, OrchestratorConfig};
use crate::orchestrator::ingester::{FrameIngester, IngesterConfig};
use crate::orchestrator::session::SessionManager;
use crate::orchestrator::store_client::{HttpStoreClient, SessionStoreClient};
use crate::orchestrator::timers::TimerManager;
use crate::status::StatusState;

/// How long cooperative shutdown may take before the process exits nonzero.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Ai(#[from] AiError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("bus error: {0}")]
    Bus(#[from] crate::bus::BusError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shutdown exceeded {SHUTDOWN_DEADLINE:?}")]
    ShutdownTimeout,
}

/// Run the agent until `shutdown` resolves, then unwind within the deadline.
pub async fn run(
    config: Config,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<(), AgentError> {
    let bus = EventBus::new();

    // Status listener first: it must see every lifecycle event
    let status = StatusState::new();
    let status_task = status.spawn_listener(&bus)?;

    let cache = FrameCache::with_defaults();
    let sweeper = cache.spawn_sweeper();

    let ingester = FrameIngester::new(IngesterConfig::new(
        format!("{}/ingest", config.store.base_url),
        config.ai.max_inflight,
    ));
    ingester.start();
    let session = Arc::new(SessionManager::new(cache.clone(), ingester.clone()));

    let transport = WorkerTransport::new(TransportConfig {
        format: config.ai.preferred_format.clone(),
        ..TransportConfig::new(
            config.ai.worker_addr.clone(),
            config.ai.model.clone(),
            config.ai.width,
            config.ai.height,
        )
    });

    let capture: Arc<dyn Capture> = Arc::new(SimCapture::new(
        config.ai.width,
        config.ai.height,
        config.fps.idle,
    ));
    let live: Arc<dyn Publisher> = Arc::new(SimPublisher::new());
    let record: Arc<dyn Publisher> = Arc::new(SimPublisher::new());

    let feeder = AiFeeder::new(
        cache,
        Arc::new(transport.handle()),
        Arc::clone(&capture),
        bus.clone(),
        Arc::clone(&session),
    );
    feeder.init(AiConfig {
        model: config.ai.model.clone(),
        width: config.ai.width,
        height: config.ai.height,
        max_inflight: config.ai.max_inflight,
        classes_filter: config.ai.classes_filter.clone(),
        confidence_threshold: config.ai.confidence_threshold,
        policy: config.ai.policy,
        preferred_format: config.ai.preferred_format.clone(),
        fps_idle: config.fps.idle,
        fps_active: config.fps.active,
    })?;
    feeder.set_callbacks(FeederCallbacks {
        on_ready: Some(Box::new(|| tracing::info!("inference worker ready"))),
        ..FeederCallbacks::default()
    });
    feeder.connect_transport(&transport);
    let stats_feeder = feeder.clone();
    status.set_feeder_stats(Box::new(move || stats_feeder.snapshot()));

    let timers = TimerManager::new(
        bus.clone(),
        config.timers.dwell(),
        config.timers.silence(),
        config.timers.postroll(),
    );
    let store_client: Arc<dyn SessionStoreClient> =
        Arc::new(HttpStoreClient::new(config.store.base_url.clone()));
    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            fps_idle: config.fps.idle,
            fps_active: config.fps.active,
            postroll_sec: config.timers.postroll_ms.div_ceil(1000),
            ..OrchestratorConfig::new(config.agent.device_id.clone(), config.agent.path.clone())
        },
        timers,
        bus.clone(),
        Arc::new(feeder.clone()) as Arc<dyn AiControl>,
        Arc::clone(&record),
        store_client,
        Arc::clone(&session),
    );

    // The orchestrator subscribes before the transport may produce events
    let subscription = bus.subscribe(
        "orchestrator",
        &[
            topic::AI_DETECTION,
            topic::AI_KEEPALIVE,
            topic::FSM_DWELL_OK,
            topic::FSM_SILENCE_OK,
            topic::FSM_POSTROLL_OK,
        ],
    )?;
    let orchestrator_task = tokio::spawn(orchestrator.run(subscription));

    // Child status endpoint for the supervisor
    let status_listen: SocketAddr = ([127, 0, 0, 1], config.status.port).into();
    let status_listener = tokio::net::TcpListener::bind(status_listen).await?;
    tracing::info!(listen = %status_listener.local_addr()?, "status endpoint up");
    let status_server = tokio::spawn(axum::serve(status_listener, crate::status::router(status.clone())).into_future());

    live.start()?;
    status.mark_live_started();
    transport.start();
    feeder.start()?;
    tracing::info!(
        device = %config.agent.device_id,
        path = %config.agent.path,
        worker = %config.ai.worker_addr,
        "agent running"
    );

    shutdown.await;
    tracing::info!("shutdown requested");

    let unwind = async {
        // Closing the bus ends the orchestrator loop, which closes any open
        // session and stops the recording publisher on its way out
        bus.shutdown();
        let _ = orchestrator_task.await;
        feeder.stop().await;
        transport.shutdown().await;
        feeder.teardown();
        capture.stop();
        live.stop();
        ingester.shutdown().await;
        status_server.abort();
        status_task.abort();
        sweeper.abort();
    };
    tokio::time::timeout(SHUTDOWN_DEADLINE, unwind)
        .await
        .map_err(|_| AgentError::ShutdownTimeout)?;
    tracing::info!("agent stopped");
    Ok(())
}
