//! API route definitions.

use axum::http::{HeaderValue, Method, header};
use axum::{
    Router, middleware,
    routing::{get, post},
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::auth::auth_middleware;
use crate::chat::ws_handler;

use super::handlers;
use super::state::AppState;

/// Local origins always allowed in dev mode.
const DEV_ORIGINS: [&str; 4] = [
    "http://localhost:3000",
    "http://localhost:3001",
    "http://127.0.0.1:3000",
    "http://127.0.0.1:3001",
];

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer(&state);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let verifier = state.verifier.clone();

    // Everything under /api/chat requires a verified credential.
    let chat_routes = Router::new()
        .route("/ws", get(ws_handler))
        .route("/online", get(handlers::online))
        .route("/history/{peer_id}", get(handlers::history_with))
        .route(
            "/history/{user_a}/{user_b}",
            get(handlers::history_between),
        )
        .route("/direct/{recipient_id}", post(handlers::direct_message))
        .layer(middleware::from_fn_with_state(verifier, auth_middleware));

    let public_routes = Router::new().route("/health", get(handlers::health));

    Router::new()
        .merge(public_routes)
        .nest("/api/chat", chat_routes)
        .with_state(state)
        .layer(cors)
        .layer(trace_layer)
}

/// Build the CORS layer based on configuration.
///
/// Configured origins are always allowed; dev mode adds local origins.
/// With nothing usable, cross-origin requests are denied.
fn build_cors_layer(state: &AppState) -> CorsLayer {
    let dev_mode = state.auth.is_dev_mode();

    let mut origins: Vec<HeaderValue> = state
        .auth
        .allowed_origins()
        .iter()
        .filter_map(|origin| {
            origin.parse::<HeaderValue>().ok().or_else(|| {
                tracing::warn!("CORS: Invalid origin in config: {}", origin);
                None
            })
        })
        .collect();

    if dev_mode {
        for origin in DEV_ORIGINS {
            let value = HeaderValue::from_static(origin);
            if !origins.contains(&value) {
                origins.push(value);
            }
        }
    }

    if origins.is_empty() {
        tracing::warn!("CORS: No usable origins configured, denying cross-origin requests");
        return CorsLayer::new().allow_origin(AllowOrigin::exact(HeaderValue::from_static("null")));
    }

    tracing::info!("CORS: Allowing {} origin(s)", origins.len());
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
            header::COOKIE,
        ])
        .allow_credentials(true)
}
