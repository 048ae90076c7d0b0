//! Connection descriptor shared with mobile clients via QR code

use serde::{Deserialize, Serialize};
use std::fmt;

/// The address and credential a mobile client needs to open a session
///
/// Rendered as `{base_url}?token={token}`, both in the QR code and as plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub base_url: String,
    pub token: String,
}

impl ConnectionDescriptor {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    /// The payload string encoded into the QR bitmap
    pub fn payload(&self) -> String {
        let separator = if self.base_url.contains('?') { '&' } else { '?' };
        format!("{}{}token={}", self.base_url, separator, self.token)
    }

    /// Parse a payload back into its parts, as the mobile client does
    pub fn parse(payload: &str) -> Option<Self> {
        let (head, token) = payload.rsplit_once("token=")?;
        let base_url = head.strip_suffix('?').or_else(|| head.strip_suffix('&'))?;
        if base_url.is_empty() || token.is_empty() {
            return None;
        }
        Some(Self::new(base_url, token))
    }
}

impl fmt::Display for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.payload())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_format() {
        let descriptor = ConnectionDescriptor::new("http://192.168.1.20:8765", "abc_DEF-123");
        assert_eq!(
            descriptor.payload(),
            "http://192.168.1.20:8765?token=abc_DEF-123"
        );
        assert_eq!(descriptor.to_string(), descriptor.payload());
    }

    #[test]
    fn test_payload_with_existing_query() {
        let descriptor = ConnectionDescriptor::new("https://host.example/ws?v=2", "t0k");
        assert_eq!(descriptor.payload(), "https://host.example/ws?v=2&token=t0k");
    }

    #[test]
    fn test_parse() {
        let descriptor = ConnectionDescriptor::new("https://quick-fox.trycloudflare.com", "tok");
        assert_eq!(
            ConnectionDescriptor::parse(&descriptor.payload()),
            Some(descriptor)
        );
        assert_eq!(ConnectionDescriptor::parse("https://no-token.example"), None);
        assert_eq!(ConnectionDescriptor::parse("https://x.example?token="), None);
    }
}
