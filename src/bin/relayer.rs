//! Forward Relayer binary.

use forward_relayer::{create_router, AppState, Config};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Forward Relayer");

    let config: Config = config::Config::builder()
        .add_source(config::File::with_name("relayer").required(false))
        .add_source(config::Environment::with_prefix("RELAYER").separator("__"))
        .build()?
        .try_deserialize()?;

    info!(
        networks = config.networks.len(),
        bind = %config.bind_address,
        "Configuration loaded"
    );

    let bind_address = config.bind_address.clone();
    let state = Arc::new(AppState::new(config).await?);

    // Background workers: confirmation tracker and policy rule reloads.
    let tracker = Arc::new(state.tracker());
    tokio::spawn(tracker.run());
    let policy = Arc::clone(&state.policy);
    let reload_interval = state.config.policy_reload_interval();
    tokio::spawn(policy.run_reload_loop(reload_interval));

    let app = create_router(state);

    info!(address = %bind_address, "Listening");

    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
