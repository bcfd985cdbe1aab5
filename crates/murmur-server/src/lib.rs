//! Murmur relay server library logic.
//!
//! Exposes the axum application: the relay WebSocket (`/chat`), the
//! identity-platform webhook endpoint (`/api/webhooks`), and the health
//! probe (`/health`), all sharing one [`AppState`].

pub mod api_ws;
pub mod config;
pub mod registry;
pub mod webhooks;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use murmur_identity::IdentityProvider;
use murmur_store::TableStore;
use murmur_voice::VoiceProvider;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use registry::ConnectionRegistry;
use webhooks::ProcessedWebhookIds;

/// Application state shared across all request handlers.
pub struct AppState {
    /// The local-first table store (single source of truth for reads).
    pub store: Arc<TableStore>,
    /// Live relay connections keyed by user.
    pub registry: ConnectionRegistry,
    /// Processed webhook delivery ids.
    pub webhook_ids: ProcessedWebhookIds,
    /// Identity provider client (token verification, metadata writes).
    pub identity: Arc<dyn IdentityProvider>,
    /// Voice provider client (configuration provisioning).
    pub voice: Arc<dyn VoiceProvider>,
    /// Webhook signing secret (`whsec_...`).
    pub webhook_secret: String,
}

/// Health check handler.
///
/// Returns `200 OK` with server status and the current time in epoch
/// milliseconds. Used by load balancers, monitoring, and CI.
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

/// Builds the application router with all routes.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/chat", get(api_ws::chat_handler))
        .route("/api/webhooks", post(webhooks::webhook_handler))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}
