use std::time::Instant;

use axum::{
    extract::Request,
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// One summary line per HTTP exchange. For sockets this covers the upgrade
/// handshake only; frame traffic is logged by the relay.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let websocket = request.headers().contains_key(header::UPGRADE);
    let started_at = Instant::now();

    let response = next.run(request).await;
    let status = response.status();
    let elapsed_ms = started_at.elapsed().as_millis();

    info!(
        method = %method,
        path = %path,
        status = status.as_u16(),
        websocket,
        duration_ms = elapsed_ms,
        "request summary"
    );

    if websocket && status != StatusCode::SWITCHING_PROTOCOLS {
        warn!(method = %method, path = %path, status = status.as_u16(), "websocket upgrade refused");
    }

    response
}
