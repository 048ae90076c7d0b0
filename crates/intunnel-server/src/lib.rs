//! intunnel Server - Pairing server and control plane
//!
//! Serves the pairing handshake and the local control API over axum, renders
//! connection descriptors as QR codes, and ties everything together in the
//! [`ControlPlane`] facade.

pub mod control;
pub mod http;
pub mod qr;
pub mod state;
pub mod websocket;

pub use control::{ControlPlane, LocalServer};
pub use http::{create_router, ServerInfo};
pub use qr::{encode, encode_with_fallback, render_terminal, to_png, EcLevel, QrError};
pub use state::AppState;
pub use websocket::{handle_device_socket, pairing_ws_handler};
