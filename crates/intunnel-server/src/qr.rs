//! QR code rendering of connection descriptors
//!
//! Everything here is a pure function of its input. The QR version is picked
//! by the encoder to fit the payload; only the error correction level is up
//! to the caller.

use image::{GrayImage, ImageFormat, Luma};
use intunnel_core::ConnectionDescriptor;
use qrcode::types::QrError as CodeError;
use qrcode::QrCode;
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

pub use qrcode::EcLevel;

/// Levels tried by [`encode_with_fallback`], most robust first
pub const FALLBACK_LEVELS: [EcLevel; 4] = [EcLevel::H, EcLevel::Q, EcLevel::M, EcLevel::L];

/// QR rendering errors
#[derive(Debug, Error)]
pub enum QrError {
    #[error("payload of {len} bytes exceeds QR capacity at {level:?} error correction")]
    TooLong { len: usize, level: EcLevel },

    #[error("QR encoding failed: {0}")]
    Encoding(String),

    #[error("PNG encoding failed: {0}")]
    Png(#[from] image::ImageError),
}

impl From<QrError> for intunnel_core::Error {
    fn from(e: QrError) -> Self {
        intunnel_core::Error::Encoding(e.to_string())
    }
}

/// Render `descriptor` as a square bitmap at least `pixel_size` pixels wide
pub fn encode(
    descriptor: &ConnectionDescriptor,
    pixel_size: u32,
    level: EcLevel,
) -> Result<GrayImage, QrError> {
    let code = build(&descriptor.payload(), level)?;
    Ok(code
        .render::<Luma<u8>>()
        .quiet_zone(true)
        .min_dimensions(pixel_size, pixel_size)
        .build())
}

/// [`encode`] at the highest error correction level that fits the payload
pub fn encode_with_fallback(
    descriptor: &ConnectionDescriptor,
    pixel_size: u32,
) -> Result<GrayImage, QrError> {
    for level in FALLBACK_LEVELS {
        match encode(descriptor, pixel_size, level) {
            Err(QrError::TooLong { len, .. }) if level != EcLevel::L => {
                debug!("{} byte payload too long at {:?}, lowering", len, level);
            }
            result => return result,
        }
    }
    encode(descriptor, pixel_size, EcLevel::L)
}

/// Serialize a rendered bitmap as PNG
pub fn to_png(image: &GrayImage) -> Result<Vec<u8>, QrError> {
    let mut buffer = Cursor::new(Vec::new());
    image.write_to(&mut buffer, ImageFormat::Png)?;
    Ok(buffer.into_inner())
}

/// Render `data` as Unicode blocks for terminal display
pub fn render_terminal(data: &str) -> Result<String, QrError> {
    let code = build(data, EcLevel::M).or_else(|_| build(data, EcLevel::L))?;
    Ok(code
        .render::<char>()
        .quiet_zone(true)
        .module_dimensions(2, 1)
        .build())
}

fn build(payload: &str, level: EcLevel) -> Result<QrCode, QrError> {
    QrCode::with_error_correction_level(payload.as_bytes(), level).map_err(|e| match e {
        CodeError::DataTooLong => QrError::TooLong {
            len: payload.len(),
            level,
        },
        other => QrError::Encoding(other.to_string()),
    })
}
