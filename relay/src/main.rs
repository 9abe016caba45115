//! Ferry Relay binary: tracing, configuration, and the axum server.

use std::sync::Arc;

use ferry_relay::config::Config;
use ferry_relay::dataset::DatasetHub;
use ferry_relay::{app, AppState};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::from_env()?;
    let hub = DatasetHub::new(config.data_dir.clone())?;

    let addr = config.listen_addr();
    let state = AppState {
        config: Arc::new(config),
        hub: Arc::new(hub),
    };

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "ferry relay listening");
    axum::serve(listener, app(state)).await?;

    Ok(())
}
