pub mod agent;
pub mod ai;
pub mod bus;
pub mod capture;
pub mod config;
pub mod manager;
pub mod orchestrator;
pub mod status;
pub mod store;

use std::path::PathBuf;

/// Default configuration file, next to the working directory.
pub const CONFIG_FILE: &str = "vigil.toml";

/// Resolve the config path from the first CLI argument, falling back to
/// [`CONFIG_FILE`].
pub fn config_path_from_args() -> PathBuf {
    std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILE))
}

/// Install the tracing subscriber for a binary. `RUST_LOG` wins; the
/// default level is `info`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
