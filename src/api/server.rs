//! HTTP server setup: router and API routes.

use super::state::ApiState;
use super::{commands, fleet, projects};

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::{get, post};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Build the application router. Every route lives under `/api`.
pub fn router(state: Arc<ApiState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/commands", post(commands::send_command))
        .route("/dead-letters", get(commands::list_dead_letters))
        .route("/projects", post(projects::register_project))
        .route("/projects/{project_id}", get(projects::get_project))
        .route("/projects/{project_id}/indexes", get(projects::list_indexes))
        .route("/slots/{index_class}", get(fleet::list_slots))
        .route("/route/{index_class}/{routing_key}", get(fleet::route));

    Router::new()
        .nest("/api", api_routes)
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server on the given address.
///
/// Returns a handle that resolves when the server shuts down. The caller
/// passes a `tokio::sync::watch::Receiver<bool>` for graceful shutdown.
pub async fn start_http_server(
    bind: SocketAddr,
    state: Arc<ApiState>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "HTTP server listening");

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|v| *v).await;
            })
            .await
        {
            tracing::error!(%error, "HTTP server exited with error");
        }
    });

    Ok(handle)
}

// -- API handlers --

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let uptime = state.started_at.elapsed();
    let slots: serde_json::Map<String, serde_json::Value> = crate::model::IndexClass::ALL
        .iter()
        .map(|class| {
            (
                class.as_str().to_string(),
                serde_json::json!(state.fleet.slot_count(*class)),
            )
        })
        .collect();

    Json(serde_json::json!({
        "status": "running",
        "pid": std::process::id(),
        "uptime_seconds": uptime.as_secs(),
        "queue": state.queue.stats(),
        "dispatch": state.dispatcher.stats(),
        "jobs": state.orchestrator.jobs(),
        "in_flight_vcpus": state.orchestrator.in_flight_vcpus(),
        "slots": slots,
    }))
}
