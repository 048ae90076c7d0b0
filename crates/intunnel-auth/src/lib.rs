//! intunnel Auth - Pairing token and connected devices
//!
//! Provides the per-server-lifetime pairing token and the registry of
//! currently connected mobile clients.
//!
//! # Pairing Flow
//!
//! 1. Server start creates a `TokenIssuer` with a fresh random token
//! 2. The token is shared with the device through the connection descriptor (QR code)
//! 3. The device connects presenting the token; `TokenIssuer::verify` checks it
//! 4. Accepted connections are added to the `DeviceRegistry` until they disconnect
//!
//! # Example
//!
//! ```no_run
//! use intunnel_auth::{Device, DeviceRegistry, TokenIssuer};
//!
//! let issuer = TokenIssuer::new();
//! let registry = DeviceRegistry::new(None);
//!
//! // Later, when a device connects
//! let presented = "..."; // From the client
//! if issuer.verify(presented).is_ok() {
//!     let device = Device::new("Pixel 8", "192.168.1.40:51234");
//!     registry.register(device).unwrap();
//! }
//! ```

pub mod device;
pub mod registry;
pub mod token;

pub use device::{Device, DeviceId, DeviceInfo};
pub use registry::{DeviceRegistry, RegistryError};
pub use token::{AuthError, TokenIssuer, TOKEN_BYTES};
