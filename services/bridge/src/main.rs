use std::env;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .init();

    let config_path = env::args()
        .nth(1)
        .or_else(|| env::var("BRIDGE_CONFIG").ok())
        .unwrap_or_else(|| "/etc/fluxbridge/bridge.toml".to_owned());

    let config = match fb_core::config::load_config_from_path(&PathBuf::from(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load config from '{config_path}': {e}");
            std::process::exit(2);
        }
    };

    if let Err(e) = bridge::supervisor::run(config).await {
        eprintln!("bridge failed: {e}");
        std::process::exit(1);
    }
}
