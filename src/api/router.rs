use axum::{
    extract::{DefaultBodyLimit, Request},
    middleware::{self, Next},
    response::Response,
    routing::{delete, get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::{health, providers, webhooks};
use crate::AppState;

/// Simple request logger middleware
async fn log_middleware(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    tracing::info!(">>> {} {}", method, uri);
    let res = next.run(req).await;
    tracing::info!("<<< {} {} -> {}", method, uri, res.status());
    res
}

pub fn build_router(state: AppState) -> Router {
    // Provider callbacks stay outside CORS; nothing in a browser calls them.
    let webhook_router = Router::new()
        .route("/webhooks/outlook", post(webhooks::outlook))
        .route("/webhooks/gmail", post(webhooks::gmail))
        .layer(DefaultBodyLimit::max(4 * 1024 * 1024));

    let api_router = Router::new()
        .route("/health", get(health::health))
        .route("/providers", post(providers::connect))
        .route("/providers/:id", delete(providers::disconnect))
        .route("/providers/:id/sync", post(providers::trigger_sync))
        .route(
            "/providers/:id/folders/sync",
            post(providers::trigger_folder_sync),
        )
        .layer(CorsLayer::permissive())
        .layer(DefaultBodyLimit::max(64 * 1024));

    webhook_router
        .merge(api_router)
        .layer(middleware::from_fn(log_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
