//! HTTP API server for kvmgr.
//!
//! This module exposes VM lifecycle, snapshots and disk exports over HTTP.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! kvmgr serve --listen 127.0.0.1:8080
//!
//! # Export a VM as OVA
//! curl -X POST http://localhost:8080/api/v1/vms/web/export \
//!   -H "Content-Type: application/json" \
//!   -d '{"format": "ova"}'
//! ```

pub mod error;
pub mod handlers;
pub mod state;
pub mod types;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use state::ApiState;

/// Create the API router with all endpoints.
pub fn create_router(state: Arc<ApiState>, request_timeout: Duration) -> Router {
    let health_route = Router::new().route("/health", get(handlers::health::health));

    let vm_routes = Router::new()
        .route(
            "/",
            get(handlers::vms::list_vms).post(handlers::vms::create_vm),
        )
        .route(
            "/:name",
            get(handlers::vms::get_vm).delete(handlers::vms::delete_vm),
        )
        .route("/:name/start", post(handlers::vms::start_vm))
        .route("/:name/stop", post(handlers::vms::stop_vm))
        .route("/:name/restart", post(handlers::vms::restart_vm))
        // Snapshot routes
        .route(
            "/:name/snapshots",
            get(handlers::vms::list_snapshots).post(handlers::vms::create_snapshot),
        )
        .route(
            "/:name/snapshots/:snapshot",
            get(handlers::vms::get_snapshot).delete(handlers::vms::delete_snapshot),
        )
        .route(
            "/:name/snapshots/:snapshot/revert",
            post(handlers::vms::revert_snapshot),
        )
        // Export routes
        .route("/:name/export", post(handlers::exports::create_export));

    let export_routes = Router::new()
        .route("/", get(handlers::exports::list_exports))
        .route(
            "/:id",
            get(handlers::exports::get_export).delete(handlers::exports::cancel_export),
        );

    let api_v1 = Router::new()
        .nest("/vms", vm_routes)
        .nest("/exports", export_routes)
        .layer(TimeoutLayer::new(request_timeout));

    // CORS: localhost origins only.
    let cors = CorsLayer::new()
        .allow_origin([
            HeaderValue::from_static("http://localhost:8080"),
            HeaderValue::from_static("http://127.0.0.1:8080"),
            HeaderValue::from_static("http://localhost:3000"),
            HeaderValue::from_static("http://127.0.0.1:3000"),
        ])
        .allow_methods([Method::GET, Method::POST, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .merge(health_route)
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
