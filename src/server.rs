//! HTTP surface: WebSocket upgrades, NIP-11 relay info and health checks.

use anyhow::Result;
use axum::{
    extract::{State, WebSocketUpgrade},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::{future::Future, net::SocketAddr, sync::Arc};
use tracing::info;

use crate::{relay::Relay, ws::run_session};

/// Response body for the `/healthz` endpoint.
#[derive(Serialize, Deserialize)]
struct Health {
    /// Always "ok" when the server is running.
    status: String,
}

/// Routes served on the relay's single listen address.
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .with_state(relay)
}

/// Bind `addr` and serve until `shutdown` resolves.
pub async fn serve(
    addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %listener.local_addr()?, url = %relay.authenticator().relay_url(), "relay listening");
    axum::serve(listener, router(relay).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// `/` speaks WebSocket to relay clients, NIP-11 to info requests and
/// plain text to browsers.
async fn root(
    State(relay): State<Arc<Relay>>,
    ws: Option<WebSocketUpgrade>,
    headers: HeaderMap,
) -> Response {
    if let Some(ws) = ws {
        return ws
            .max_message_size(relay.options().max_message_bytes)
            .on_upgrade(move |socket| run_session(relay, socket))
            .into_response();
    }
    if wants_relay_info(&headers) {
        return (
            [
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
                (header::CONTENT_TYPE, "application/nostr+json"),
            ],
            Json(relay.options().info.clone()),
        )
            .into_response();
    }
    "Please use a Nostr client to connect.".into_response()
}

fn wants_relay_info(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/nostr+json"))
}

/// Health check endpoint.
async fn healthz() -> Json<Health> {
    Json(Health {
        status: "ok".to_string(),
    })
}
