//! Broker process: accepts websocket upgrades, instantiates a hub and a
//! server-side session protocol per connection, and loops reading frames
//! into `process_message` (`SPEC_FULL.md` §2.6).

use std::sync::Arc;

use axum::extract::ws::{Message as AxumMessage, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::http::Method;
use axum::routing::get;
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::hub::transport::WebSocketTransport;
use crate::hub::Hub;

use super::registry::Registry;
use super::protocol::SessionProtocol;

/// Builds the broker's axum router: a websocket upgrade at `/` (accepts
/// all origins, matching the permissive `CorsLayer` below) and a
/// `/health` endpoint for operational checks.
pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(registry)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET])
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(registry): State<Registry>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, registry))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "signalhub",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Runs for the lifetime of one websocket connection: wraps it in a
/// [`Hub`], registers a [`SessionProtocol`] on it, and feeds every
/// inbound frame to `process_message` until the socket closes.
async fn handle_connection(socket: WebSocket, registry: Registry) {
    let (sink, mut stream) = socket.split();
    let transport = Arc::new(WebSocketTransport::new(sink));
    let hub = Hub::new(transport);
    let session = SessionProtocol::new(Arc::clone(&hub), registry);

    tracing::debug!(hub_id = %hub.id, "websocket connection accepted");

    loop {
        match stream.next().await {
            Some(Ok(AxumMessage::Text(text))) => {
                if let Err(err) = hub.process_message(text.as_bytes()).await {
                    tracing::warn!(hub_id = %hub.id, error = %err, "protocol error, dropping connection");
                    break;
                }
            }
            Some(Ok(AxumMessage::Binary(bytes))) => {
                if let Err(err) = hub.process_message(&bytes).await {
                    tracing::warn!(hub_id = %hub.id, error = %err, "protocol error, dropping connection");
                    break;
                }
            }
            Some(Ok(AxumMessage::Close(_))) | None => break,
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                tracing::warn!(hub_id = %hub.id, error = %err, "websocket read error");
                break;
            }
        }
    }

    session.done().await;
}
