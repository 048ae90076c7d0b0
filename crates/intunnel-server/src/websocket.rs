//! WebSocket pairing handshake
//!
//! A client connects with the pairing token and an optional name and device
//! id. Accepted clients stay in the device registry for as long as the socket
//! is open. The terminal session transport runs over its own channel.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use intunnel_auth::Device;
use intunnel_core::Error;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::state::AppState;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Query parameters for the pairing socket
#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    /// Pairing token from the connection descriptor
    #[serde(default)]
    pub token: Option<String>,
    /// Human-readable device name
    #[serde(default)]
    pub name: Option<String>,
    /// Stable client-chosen id; reconnecting with it replaces the old entry
    #[serde(default)]
    pub device_id: Option<String>,
}

/// Messages sent to a paired client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Handshake accepted
    #[serde(rename_all = "camelCase")]
    Paired { device_id: String, version: String },
    /// The host disconnected this device
    Disconnected,
}

/// Extract token from query or Authorization header
pub(crate) fn extract_token(query_token: Option<&str>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = query_token {
        return Some(token.to_string());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|auth| auth.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Pairing handshake endpoint
pub async fn pairing_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = extract_token(query.token.as_deref(), &headers) else {
        warn!("Pairing connection from {} rejected: no token provided", remote);
        return (StatusCode::UNAUTHORIZED, "Authentication required").into_response();
    };

    // Subscribe first so a reconnect landing before the upgrade is still seen
    let devices = state.registry.subscribe();
    let device = match state.admit(
        &token,
        query.name.as_deref(),
        query.device_id.as_deref(),
        remote,
    ) {
        Ok(device) => device,
        Err(Error::AuthenticationFailed) => {
            return (StatusCode::UNAUTHORIZED, "Invalid token").into_response();
        }
        Err(e @ Error::RegistryFull(_)) => {
            warn!("Pairing connection from {} rejected: {}", remote, e);
            return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
        }
        Err(e) => {
            warn!("Pairing connection from {} failed: {}", remote, e);
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    };

    let failed_state = state.clone();
    let failed_device = device.clone();
    ws.on_failed_upgrade(move |e| {
        warn!("WebSocket upgrade for {} failed: {}", failed_device.id, e);
        release(&failed_state, &failed_device);
    })
    .on_upgrade(move |socket| handle_device_socket(socket, state, device, devices))
}

/// Serve one paired device until either side disconnects
///
/// The registry entry is tied to this connection: a reconnect under the same
/// id replaces it, which closes this socket without removing the new entry.
/// `devices` must be subscribed before `device` was registered.
pub async fn handle_device_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    device: Device,
    mut devices: watch::Receiver<Vec<Device>>,
) {
    let (mut sender, mut receiver) = socket.split();
    let id = device.id.clone();

    let paired = ServerMessage::Paired {
        device_id: id.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    };
    if let Ok(json) = serde_json::to_string(&paired) {
        if sender.send(Message::Text(json)).await.is_err() {
            warn!("Failed to send pairing confirmation to {}", id);
            release(&state, &device);
            return;
        }
    }

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await;

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(data))) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Text(text))) => {
                    debug!("Message from {}: {}", id, text);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("WebSocket receive error from {}: {}", id, e);
                    break;
                }
            },
            changed = devices.changed() => {
                let still_registered = changed.is_ok()
                    && devices.borrow_and_update().iter().any(|d| d.same_connection(&device));
                if !still_registered {
                    if let Ok(json) = serde_json::to_string(&ServerMessage::Disconnected) {
                        let _ = sender.send(Message::Text(json)).await;
                    }
                    let _ = sender.send(Message::Close(None)).await;
                    info!("Device {} disconnected by host", id);
                    return;
                }
            }
            _ = keepalive.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    release(&state, &device);
}

/// Unregister `device` unless a newer connection took over its id
fn release(state: &AppState, device: &Device) {
    if state
        .registry
        .unregister_if(&device.id, |entry| entry.same_connection(device))
    {
        info!("Device disconnected: {}", device.id);
    }
}
