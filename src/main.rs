use std::sync::Arc;

use mcp_endpoint_relay::{
    auth::StaticTokenValidator,
    build_app,
    config::Config,
    logging,
    relay::{Dispatcher, RelayConfig},
    AppState,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;
    let bind_socket = config.bind_socket()?;

    let dispatcher = Dispatcher::new(RelayConfig {
        request_timeout: config.request_timeout,
    });
    let validator = Arc::new(StaticTokenValidator::new(
        config.server_key.clone(),
        config.agent_id.clone(),
    ));
    let state = AppState::new(
        dispatcher.clone(),
        validator,
        config.provider_path.clone(),
        config.caller_path.clone(),
    );
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(bind_socket).await?;

    info!(
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        provider_path = %config.provider_path,
        caller_path = %config.caller_path,
        request_timeout_secs = config.request_timeout.as_secs(),
        "relay starting"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal(dispatcher))
        .await?;

    info!("relay stopped");
    Ok(())
}

async fn shutdown_signal(dispatcher: Dispatcher) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }

    info!("shutdown signal received");
    dispatcher.shutdown();
}
