//! Device identifiers: MAC addresses, streaming endpoint URLs, agent ids.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

use crate::error::{GatewayError, Result};

static MAC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})$").expect("static regex")
});

/// A raw device identifier as presented by a caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum DeviceId {
    /// Lower-case, colon separated.
    Mac(String),
    /// Used verbatim as the unique key.
    Endpoint(String),
    /// Extracted from an endpoint's token at bind time. Lookup only.
    Agent(i64),
}

impl DeviceId {
    /// Validate and normalize a MAC address. `-` separators are accepted.
    pub fn mac(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if !MAC_PATTERN.is_match(raw) {
            return Err(GatewayError::Validation(format!(
                "invalid MAC address {raw:?}, expected XX:XX:XX:XX:XX:XX"
            )));
        }
        Ok(Self::Mac(raw.replace('-', ":").to_lowercase()))
    }

    /// Validate an endpoint URL: http, https, ws, or wss with a host.
    pub fn endpoint(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let parsed = url::Url::parse(raw)
            .map_err(|e| GatewayError::Validation(format!("invalid endpoint URL {raw:?}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https" | "ws" | "wss") {
            return Err(GatewayError::Validation(format!(
                "endpoint URL must use http, https, ws or wss, got {}",
                parsed.scheme()
            )));
        }
        if parsed.host_str().map_or(true, str::is_empty) {
            return Err(GatewayError::Validation(format!("endpoint URL {raw:?} has no host")));
        }
        Ok(Self::Endpoint(raw.to_string()))
    }

    /// Parse any identifier form: MAC if it looks like one, `agent:<n>`, else URL.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(GatewayError::Validation("device identifier is empty".into()));
        }
        if MAC_PATTERN.is_match(raw) {
            return Self::mac(raw);
        }
        if let Some(n) = raw.strip_prefix("agent:") {
            return n
                .parse()
                .map(Self::Agent)
                .map_err(|_| GatewayError::Validation(format!("invalid agent id {n:?}")));
        }
        Self::endpoint(raw)
    }

    /// The string stored in `applications.device_id`.
    pub fn key(&self) -> String {
        match self {
            Self::Mac(mac) => mac.clone(),
            Self::Endpoint(url) => url.clone(),
            Self::Agent(id) => format!("agent:{id}"),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Mac(_) => "mac",
            Self::Endpoint(_) => "endpoint",
            Self::Agent(_) => "agent",
        }
    }

    /// Agent id carried by an endpoint URL, if any.
    pub fn agent_id(&self) -> Option<i64> {
        match self {
            Self::Agent(id) => Some(*id),
            Self::Endpoint(url) => agent_id_from_endpoint(url),
            Self::Mac(_) => None,
        }
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

impl std::str::FromStr for DeviceId {
    type Err = GatewayError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Read `agentId` from the payload of the JWT in an endpoint's `token` query
/// parameter. The signature is not checked; the id is only a lookup key.
pub fn agent_id_from_endpoint(endpoint: &str) -> Option<i64> {
    let parsed = url::Url::parse(endpoint).ok()?;
    let token = parsed
        .query_pairs()
        .find(|(k, _)| k == "token")
        .map(|(_, v)| v.into_owned())?;
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    match claims.get("agentId")? {
        serde_json::Value::Number(n) => n.as_i64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt_with(payload: &str) -> String {
        format!(
            "{}.{}.sig",
            URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256"}"#),
            URL_SAFE_NO_PAD.encode(payload)
        )
    }

    #[test]
    fn mac_is_normalized() {
        assert_eq!(
            DeviceId::mac("AA-BB-CC-DD-EE-FF").unwrap(),
            DeviceId::Mac("aa:bb:cc:dd:ee:ff".into())
        );
        assert_eq!(
            DeviceId::parse("AA:BB:CC:DD:EE:FF").unwrap().key(),
            "aa:bb:cc:dd:ee:ff"
        );
    }

    #[test]
    fn malformed_mac_is_rejected() {
        for bad in ["AA:BB:CC:DD:EE", "GG:BB:CC:DD:EE:FF", "AABBCCDDEEFF", ""] {
            assert!(DeviceId::mac(bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn endpoint_requires_known_scheme_and_host() {
        assert!(DeviceId::endpoint("wss://api.example.com/ws?x=1").is_ok());
        assert!(DeviceId::endpoint("ftp://example.com").is_err());
        assert!(DeviceId::endpoint("not a url").is_err());
        // Used verbatim, not normalized
        let raw = "wss://API.example.com/ws?Token=abc";
        assert_eq!(DeviceId::endpoint(raw).unwrap().key(), raw);
    }

    #[test]
    fn parse_dispatches_on_shape() {
        assert_eq!(DeviceId::parse("agent:42").unwrap(), DeviceId::Agent(42));
        assert_eq!(DeviceId::parse("ws://host/x").unwrap().kind(), "endpoint");
        assert!(DeviceId::parse("agent:abc").is_err());
    }

    #[test]
    fn agent_id_extracted_from_token() {
        let url = format!("wss://api.example.com/ws?token={}", jwt_with(r#"{"agentId":1234}"#));
        assert_eq!(agent_id_from_endpoint(&url), Some(1234));

        let url = format!("wss://api.example.com/ws?token={}", jwt_with(r#"{"agentId":"77"}"#));
        assert_eq!(DeviceId::endpoint(&url).unwrap().agent_id(), Some(77));

        assert_eq!(agent_id_from_endpoint("wss://api.example.com/ws"), None);
        assert_eq!(agent_id_from_endpoint("wss://api.example.com/ws?token=garbage"), None);
    }
}
