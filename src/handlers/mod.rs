//! Inbound HTTP surface. Only gateway callbacks are served here; everything
//! else is reached through the services directly.

pub mod webhooks;

use axum::{routing::post, Router};
use tower_http::trace::TraceLayer;

pub use webhooks::WebhookState;

pub fn webhook_routes(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/:gateway", post(webhooks::gateway_webhook))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
