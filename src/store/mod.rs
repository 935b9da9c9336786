// Session store domain — catalog, ingestion, and the UI-facing API.

pub mod catalog;
pub mod error;
pub mod routes;
pub mod segments;

use std::net::SocketAddr;
use std::sync::Arc;

use crate::ai::cache::epoch_ms;
use crate::config::StoreSection;
use crate::store::catalog::Catalog;
use crate::store::error::Result;
use crate::store::routes::{router, StoreApp};

/// Run the store until shutdown is signalled. Binds, cleans up stale
/// sessions, then serves.
pub async fn run(
    config: StoreSection,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let catalog = Arc::new(Catalog::open(&config.db_path)?);
    catalog.close_stale_sessions(epoch_ms() as i64)?;
    tokio::fs::create_dir_all(&config.tracks_storage_path).await?;

    let listen: SocketAddr = config
        .listen
        .parse()
        .map_err(|e| error::StoreError::Invalid(format!("bad listen address: {e}")))?;
    let app = StoreApp { catalog, config };
    let listener = tokio::net::TcpListener::bind(listen).await?;
    tracing::info!(%listen, "session store listening");
    axum::serve(listener, router(app))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
