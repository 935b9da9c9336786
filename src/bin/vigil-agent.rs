use vigil::config::Config;

#[tokio::main]
async fn main() {
    vigil::init_tracing();

    let path = vigil::config_path_from_args();
    let config = match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("fatal: {e}");
            std::process::exit(1);
        }
    };

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    if let Err(e) = vigil::agent::run(config, shutdown).await {
        tracing::error!("agent failed: {e}");
        std::process::exit(1);
    }
}
