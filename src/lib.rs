//! Service gateway: a registry of callable services plus a policy-enforcing,
//! rate-limited invocation gateway with streaming sessions.
//!
//! The binary (`svcgw`) is a thin shell over this library; integration tests
//! in `tests/` drive it directly.

pub mod api;
pub mod config;
pub mod errors;
pub mod jobs;
pub mod middleware;
pub mod migrations;
pub mod models;
pub mod proxy;
pub mod rotation;
pub mod store;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

use proxy::gateway::InvocationGateway;
use store::RegistryStore;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub config: config::Config,
    pub store: Arc<dyn RegistryStore>,
    pub gateway: InvocationGateway,
}

impl AppState {
    pub fn new(config: config::Config, gateway: InvocationGateway) -> Self {
        Self {
            config,
            store: gateway.store().clone(),
            gateway,
        }
    }
}

/// Full HTTP surface: invocation, sessions, admin API and health probes.
pub fn app_router(state: Arc<AppState>) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/v1/invoke", post(proxy::handler::invoke_handler))
        .route("/v1/sessions/:id/events", get(proxy::handler::session_events))
        .route("/v1/sessions/:id/cancel", post(proxy::handler::cancel_session))
        .nest("/api/v1", api::api_router(state.clone()))
        .with_state(state)
        .layer(DefaultBodyLimit::max(4 * 1024 * 1024))
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::new(x_request_id.clone()))
        .layer(SetRequestIdLayer::new(x_request_id, MakeRequestUuid))
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::predicate(|origin, _| {
                    let origin = origin.to_str().unwrap_or("");
                    origin.starts_with("http://localhost:") || origin.starts_with("http://127.0.0.1:")
                }))
                .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::OPTIONS])
                .allow_headers([
                    HeaderName::from_static("content-type"),
                    HeaderName::from_static("authorization"),
                    HeaderName::from_static("x-admin-key"),
                    HeaderName::from_static("x-request-id"),
                ]),
        )
}
