use std::sync::Arc;

use axum::{middleware, routing::get, Router};

pub mod auth;
pub mod config;
pub mod errors;
pub mod http;
pub mod logging;
pub mod mcp;
pub mod relay;

use auth::TokenValidator;
use relay::Dispatcher;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Dispatcher,
    pub token_validator: Arc<dyn TokenValidator>,
    pub provider_path: Arc<str>,
    pub caller_path: Arc<str>,
}

impl AppState {
    pub fn new(
        dispatcher: Dispatcher,
        token_validator: Arc<dyn TokenValidator>,
        provider_path: String,
        caller_path: String,
    ) -> Self {
        Self {
            dispatcher,
            token_validator,
            provider_path: Arc::<str>::from(provider_path),
            caller_path: Arc::<str>::from(caller_path),
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    let provider_path = Arc::clone(&state.provider_path);
    let caller_path = Arc::clone(&state.caller_path);

    Router::new()
        .route("/health", get(http::handlers::health))
        .route("/.well-known/mcp", get(http::handlers::discovery))
        .route(&provider_path, get(http::handlers::provider_socket))
        .route(&caller_path, get(http::handlers::caller_socket))
        .layer(middleware::from_fn(logging::request_logging_middleware))
        .with_state(state)
}
