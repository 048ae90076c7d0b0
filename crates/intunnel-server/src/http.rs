//! HTTP request handlers
//!
//! Public endpoints serve server info and, with the pairing token, the device
//! list. The QR and exposure control endpoints only answer requests made
//! directly from this machine, never through a tunnel.

use axum::{
    extract::{ConnectInfo, Query, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use intunnel_auth::DeviceInfo;
use intunnel_core::{ExposureMode, ExposureState};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, warn};

use crate::qr;
use crate::state::AppState;
use crate::websocket::{extract_token, pairing_ws_handler};

/// Headers added by reverse proxies and browsers; their presence means the
/// request did not come from a local tool even if the peer is loopback
const FORWARDING_HEADERS: [&str; 5] = [
    "forwarded",
    "x-forwarded-for",
    "cf-connecting-ip",
    "tailscale-user-login",
    "origin",
];

const MIN_QR_SIZE: u32 = 64;
const MAX_QR_SIZE: u32 = 2048;

/// Create the main application router
///
/// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`; the
/// handshake and the local-only guard need the peer address.
pub fn create_router(state: Arc<AppState>) -> Router {
    let control: Router<Arc<AppState>> = Router::new()
        .route("/api/qr", get(qr_handler))
        .route("/api/exposure", get(exposure_handler))
        .route("/api/exposure/mode", post(set_mode_handler))
        .route("/api/exposure/start", post(start_handler))
        .route("/api/exposure/stop", post(stop_handler))
        .route_layer(middleware::from_fn(local_only));

    let public: Router<Arc<AppState>> = Router::new()
        .route("/api/info", get(server_info_handler))
        .route("/api/devices", get(list_devices_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET])
                .allow_headers([header::AUTHORIZATION]),
        );

    Router::new()
        .route("/ws", get(pairing_ws_handler))
        .merge(public)
        .merge(control)
        .with_state(state)
}

// ============================================================================
// Access control
// ============================================================================

async fn local_only(
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !is_local_request(remote, request.headers()) {
        warn!(
            "Refused {} {} from {}: control endpoints are local only",
            request.method(),
            request.uri().path(),
            remote
        );
        return (
            StatusCode::FORBIDDEN,
            "Control endpoints are only available on this machine",
        )
            .into_response();
    }
    next.run(request).await
}

fn is_local_request(remote: SocketAddr, headers: &HeaderMap) -> bool {
    let loopback = match remote.ip() {
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or(v6.is_loopback(), |v4| v4.is_loopback()),
        ip => ip.is_loopback(),
    };
    loopback && !FORWARDING_HEADERS.iter().any(|h| headers.contains_key(*h))
}

// ============================================================================
// Server Info
// ============================================================================

/// Server information response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    /// Server version
    pub version: String,
    /// Host name of this machine
    pub hostname: String,
    /// URL of this server on the local network
    pub local_url: String,
    /// Current exposure state
    pub exposure: ExposureState,
    /// Number of connected devices
    pub connected_devices: usize,
}

impl ServerInfo {
    pub fn collect(state: &AppState) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            hostname,
            local_url: state.local_url.clone(),
            exposure: state.exposure(),
            connected_devices: state.registry.len(),
        }
    }
}

/// Get server information
async fn server_info_handler(State(state): State<Arc<AppState>>) -> Json<ServerInfo> {
    Json(ServerInfo::collect(&state))
}

// ============================================================================
// Devices
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    token: Option<String>,
}

/// List connected devices
async fn list_devices_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<DeviceInfo>>, (StatusCode, String)> {
    let token = extract_token(query.token.as_deref(), &headers).ok_or((
        StatusCode::UNAUTHORIZED,
        "Authentication required".to_string(),
    ))?;
    state
        .issuer
        .verify(&token)
        .map_err(|e| (StatusCode::UNAUTHORIZED, e.to_string()))?;

    let devices = state.registry.list();
    Ok(Json(devices.iter().map(DeviceInfo::from).collect()))
}

// ============================================================================
// QR code
// ============================================================================

/// Query parameters for QR code generation
#[derive(Debug, Deserialize)]
pub struct QrQuery {
    /// QR code size in pixels (defaults to the configured size)
    #[serde(default)]
    size: Option<u32>,
}

/// PNG of the current connection descriptor
async fn qr_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<QrQuery>,
) -> Result<Response, (StatusCode, String)> {
    let size = query
        .size
        .unwrap_or(state.config.qr_size)
        .clamp(MIN_QR_SIZE, MAX_QR_SIZE);
    let descriptor = state.descriptor();
    debug!("Rendering {}px QR for {}", size, descriptor.base_url);

    let png = qr::encode_with_fallback(&descriptor, size)
        .and_then(|image| qr::to_png(&image))
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "image/png"),
            (header::CACHE_CONTROL, "no-store"),
        ],
        png,
    )
        .into_response())
}

// ============================================================================
// Exposure control
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ModeRequest {
    pub mode: ExposureMode,
}

/// Result of a start request
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    /// Whether a new tunnel attempt was initiated
    pub started: bool,
    pub exposure: ExposureState,
}

async fn exposure_handler(State(state): State<Arc<AppState>>) -> Json<ExposureState> {
    Json(state.exposure())
}

async fn set_mode_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ModeRequest>,
) -> Json<ExposureState> {
    state.set_mode(request.mode);
    Json(state.exposure())
}

async fn start_handler(State(state): State<Arc<AppState>>) -> Json<StartResponse> {
    let started = state.controller.start();
    Json(StartResponse {
        started,
        exposure: state.exposure(),
    })
}

async fn stop_handler(State(state): State<Arc<AppState>>) -> Json<ExposureState> {
    state.controller.stop();
    Json(state.exposure())
}
