use dotenvy::dotenv;
use log::{error, info};
use tracing_subscriber::EnvFilter;

use postserver::core::config::AppConfig;
use postserver::main_module::{bootstrap, run_axum_server};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Always)
        .init();

    // Request spans from the HTTP trace layer go through tracing; everything else through log.
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tower_http=info")))
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        error!("Failed to install tracing subscriber: {}", e);
    }

    let config = AppConfig::from_env().map_err(|e| {
        error!("Invalid configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;

    info!("Starting postserver {}", env!("CARGO_PKG_VERSION"));
    let runtime = bootstrap(config).await.map_err(|e| {
        error!("Bootstrap failed: {:#}", e);
        std::io::Error::other(e.to_string())
    })?;

    let result = run_axum_server(runtime.state.clone()).await;
    runtime.stop().await;
    result
}
