//! Connection endpoint validation.
//!
//! Setup-time checks are fail-fast: an unsupported scheme or access mode is a
//! permanent, logged-out class error surfaced before any transport connect
//! attempt.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::core::SessionError;

/// The only scheme the secured socket layer accepts.
const SECURE_SCHEME: &str = "wss";

/// Query parameter carrying the routing blob.
const ROUTING_PARAM: &str = "ED";

/// Client access mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientMode {
    /// The supported multi-device access mode.
    #[default]
    Standard,
    /// The retired direct-mobile access mode. Rejected at setup.
    LegacyMobile,
}

/// A validated connection endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: String,
}

impl Endpoint {
    /// Parse and validate an endpoint URL for the given access mode,
    /// appending the routing parameter when routing info is present.
    ///
    /// # Errors
    /// `SessionError::Config` when the scheme is not `wss` or the mode is no
    /// longer supported. Never retried.
    pub fn parse(
        url: &str,
        mode: ClientMode,
        routing_info: Option<&[u8]>,
    ) -> Result<Self, SessionError> {
        if mode == ClientMode::LegacyMobile {
            return Err(SessionError::Config(
                "legacy mobile access mode is no longer supported".into(),
            ));
        }

        let scheme = url
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| SessionError::Config(format!("malformed endpoint url: {url}")))?;
        if scheme != SECURE_SCHEME {
            return Err(SessionError::Config(format!(
                "unsupported endpoint scheme: {scheme}"
            )));
        }

        let url = match routing_info {
            Some(blob) => {
                let encoded = URL_SAFE_NO_PAD.encode(blob);
                let sep = if url.contains('?') { '&' } else { '?' };
                format!("{url}{sep}{ROUTING_PARAM}={encoded}")
            }
            None => url.to_string(),
        };

        Ok(Self { url })
    }

    /// The full URL, including the routing parameter if any.
    pub fn as_str(&self) -> &str {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_secure_scheme() {
        let ep = Endpoint::parse("wss://gateway.example.net/ws", ClientMode::Standard, None)
            .unwrap();
        assert_eq!(ep.as_str(), "wss://gateway.example.net/ws");
    }

    #[test]
    fn test_rejects_insecure_scheme() {
        let err = Endpoint::parse("ws://gateway.example.net/ws", ClientMode::Standard, None)
            .unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn test_rejects_malformed_url() {
        assert!(Endpoint::parse("not a url", ClientMode::Standard, None).is_err());
    }

    #[test]
    fn test_rejects_legacy_mode_before_scheme_check() {
        // Mode rejection fires even for an otherwise valid URL.
        let err = Endpoint::parse(
            "wss://gateway.example.net/ws",
            ClientMode::LegacyMobile,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
    }

    #[test]
    fn test_routing_param_is_base64url() {
        let ep = Endpoint::parse(
            "wss://gateway.example.net/ws",
            ClientMode::Standard,
            Some(&[0xfb, 0xff, 0x01]),
        )
        .unwrap();
        assert_eq!(ep.as_str(), "wss://gateway.example.net/ws?ED=-_8B");
    }

    #[test]
    fn test_routing_param_appended_to_existing_query() {
        let ep = Endpoint::parse(
            "wss://gateway.example.net/ws?v=2",
            ClientMode::Standard,
            Some(b"r1"),
        )
        .unwrap();
        assert!(ep.as_str().starts_with("wss://gateway.example.net/ws?v=2&ED="));
    }
}
