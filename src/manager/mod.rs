// Agent manager domain — child supervision, overrides, and the control API.

pub mod api;
pub mod overrides;
pub mod supervisor;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::manager::api::{router, ManagerApi};
use crate::manager::overrides::{OverridesStore, OVERRIDES_FILE};
use crate::manager::supervisor::{Supervisor, SupervisorConfig};

/// Run the manager until shutdown is signalled. Autostarts the child when
/// `EDGE_AGENT_AUTOSTART=1`.
pub async fn run(
    config: Config,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let overrides = Arc::new(OverridesStore::new(PathBuf::from(OVERRIDES_FILE)));
    let supervisor = Supervisor::new(SupervisorConfig::from_env(), Arc::clone(&overrides));

    if std::env::var("EDGE_AGENT_AUTOSTART").as_deref() == Ok("1") {
        if let Err(e) = supervisor.start().await {
            tracing::error!("autostart failed: {e}");
        }
    }

    let api = ManagerApi {
        supervisor: supervisor.clone(),
        overrides,
        default_classes: config.ai.classes_filter.clone(),
    };
    let listen: SocketAddr = ([127, 0, 0, 1], config.status.port).into();
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(%listen, "manager control API listening");
    axum::serve(listener, router(api))
        .with_graceful_shutdown(shutdown)
        .await?;

    supervisor.stop().await;
    Ok(())
}
