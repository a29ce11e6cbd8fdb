//! Bearer token extraction from HTTP headers and WebSocket subprotocols
//!
//! Clients present their OpenShift bearer token base64url-encoded so that
//! opaque cluster tokens (which may contain `+`, `/`, or `=`) travel intact
//! inside the `Authorization` header and the `Sec-WebSocket-Protocol`
//! grammar. Extraction failure means "no token", which validation folds to
//! `false` without a cluster call; it is deliberately distinct from an
//! invalid token, which the cluster rejects.

use std::sync::LazyLock;

use base64::alphabet;
use base64::engine::{self, Engine};
use regex::Regex;

/// Accepts both padded and unpadded base64url input.
const BASE64_URL_LENIENT: engine::GeneralPurpose = engine::GeneralPurpose::new(
    &alphabet::URL_SAFE,
    engine::GeneralPurposeConfig::new()
        .with_decode_padding_mode(engine::DecodePaddingMode::Indifferent),
);

static BEARER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Bearer\s+(.*)$").expect("bearer pattern is valid"));

static SUBPROTOCOL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^base64url\.bearer\.authorization\.cryostat\.(\S+)$")
        .expect("subprotocol pattern is valid")
});

/// Extract the bearer token from an HTTP `Authorization` header value
///
/// The header must use the `Bearer` scheme; the remainder is base64url
/// decoded as UTF-8 and trimmed. Anything else (blank header, other scheme,
/// undecodable payload) yields `None`.
pub fn from_http_header(header: &str) -> Option<String> {
    let captures = BEARER_PATTERN.captures(header.trim())?;
    decode_base64url(&captures[1])
}

/// Extract the bearer token from a WebSocket subprotocol string
///
/// The subprotocol must match `base64url.bearer.authorization.cryostat.*`
/// (case-insensitive); the suffix is base64url decoded as UTF-8 and trimmed.
pub fn from_websocket_subprotocol(subprotocol: &str) -> Option<String> {
    let captures = SUBPROTOCOL_PATTERN.captures(subprotocol.trim())?;
    decode_base64url(&captures[1])
}

/// Encode a raw token for transport in either carrier
pub fn encode(token: &str) -> String {
    BASE64_URL_LENIENT.encode(token.as_bytes())
}

fn decode_base64url(encoded: &str) -> Option<String> {
    let bytes = BASE64_URL_LENIENT.decode(encoded).ok()?;
    let decoded = String::from_utf8(bytes).ok()?;
    Some(decoded.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_with_bearer_scheme_decodes() {
        // "QUJD" is base64url for "ABC"
        assert_eq!(from_http_header("Bearer QUJD").as_deref(), Some("ABC"));
    }

    #[test]
    fn header_round_trips_arbitrary_tokens() {
        for token in ["abc", "sha256~x_y-z", "tok/en+with=symbols", "a"] {
            let header = format!("Bearer {}", encode(token));
            assert_eq!(from_http_header(&header).as_deref(), Some(token));
        }
    }

    #[test]
    fn header_accepts_padded_encoding() {
        // Older clients pad to a multiple of four; "QQ==" is "A".
        assert_eq!(from_http_header("Bearer QQ==").as_deref(), Some("A"));
    }

    #[test]
    fn header_without_bearer_scheme_yields_no_token() {
        for header in [
            "",
            "   ",
            "Basic dXNlcjpwYXNz",
            "bearer QUJD",
            "BearerQUJD",
            "Token QUJD",
        ] {
            assert_eq!(from_http_header(header), None, "header {header:?}");
        }
    }

    #[test]
    fn header_with_undecodable_payload_yields_no_token() {
        assert_eq!(from_http_header("Bearer not!base64url"), None);
    }

    #[test]
    fn subprotocol_with_matching_prefix_decodes() {
        assert_eq!(
            from_websocket_subprotocol("base64url.bearer.authorization.cryostat.QUJD").as_deref(),
            Some("ABC")
        );
    }

    #[test]
    fn subprotocol_prefix_is_case_insensitive() {
        assert_eq!(
            from_websocket_subprotocol("Base64Url.Bearer.Authorization.Cryostat.QUJD").as_deref(),
            Some("ABC")
        );
    }

    #[test]
    fn subprotocol_without_matching_prefix_yields_no_token() {
        for subprotocol in [
            "",
            "base64url.bearer.authorization.QUJD",
            "bearer.authorization.cryostat.QUJD",
            "base64url.bearer.authorization.cryostat.",
        ] {
            assert_eq!(
                from_websocket_subprotocol(subprotocol),
                None,
                "subprotocol {subprotocol:?}"
            );
        }
    }

    #[test]
    fn decoded_tokens_are_trimmed() {
        let header = format!("Bearer {}", encode("  spaced-token \n"));
        assert_eq!(from_http_header(&header).as_deref(), Some("spaced-token"));
    }
}
