//! Normalized relay identity.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

/// A relay address in canonical form.
///
/// Scheme, host and path are lowercased, default ports are dropped, a bare
/// `/` path and any fragment are removed. Two spellings of the same relay
/// compare equal and hash the same.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelayUrl(Arc<str>);

impl RelayUrl {
    /// Parse and normalize a `ws://` or `wss://` URL.
    pub fn parse(input: &str) -> Result<Self> {
        let mut url = Url::parse(input.trim())
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", input, e)))?;

        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(ClientError::InvalidUrl(format!("{}: missing host", input)));
        }

        url.set_fragment(None);
        let path = url.path().to_ascii_lowercase();
        url.set_path(&path);
        let mut normalized = url.to_string();
        if url.path() == "/" && url.query().is_none() {
            normalized.pop();
        }
        Ok(Self(normalized.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayUrl({})", self.0)
    }
}

impl AsRef<str> for RelayUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for RelayUrl {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for RelayUrl {
    type Error = ClientError;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl Serialize for RelayUrl {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for RelayUrl {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        RelayUrl::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Parse a list of relay addresses, failing on the first invalid one.
pub(crate) fn parse_relays<I, S>(relays: I) -> Result<Vec<RelayUrl>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<RelayUrl> = Vec::new();
    for relay in relays {
        let url = RelayUrl::parse(relay.as_ref())?;
        if !out.contains(&url) {
            out.push(url);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_case_and_default_port() {
        let a = RelayUrl::parse("WSS://Relay.Damus.IO:443/").unwrap();
        let b = RelayUrl::parse("wss://relay.damus.io").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "wss://relay.damus.io");
    }

    #[test]
    fn test_keeps_path_and_custom_port() {
        let url = RelayUrl::parse("ws://localhost:7000/nostr").unwrap();
        assert_eq!(url.as_str(), "ws://localhost:7000/nostr");
        assert_ne!(url, RelayUrl::parse("ws://localhost:7000").unwrap());
    }

    #[test]
    fn test_path_is_case_insensitive() {
        let upper = RelayUrl::parse("ws://relay.example/Nostr").unwrap();
        let lower = RelayUrl::parse("ws://relay.example/nostr").unwrap();
        assert_eq!(upper, lower);
        assert_eq!(upper.as_str(), "ws://relay.example/nostr");
        let relays = parse_relays(["ws://relay.example/NOSTR", "ws://relay.example/nostr"]);
        assert_eq!(relays.unwrap().len(), 1);
    }

    #[test]
    fn test_drops_fragment() {
        let url = RelayUrl::parse("wss://nos.lol/#main").unwrap();
        assert_eq!(url.as_str(), "wss://nos.lol");
    }

    #[test]
    fn test_rejects_non_websocket_schemes() {
        assert!(matches!(
            RelayUrl::parse("https://relay.damus.io"),
            Err(ClientError::InvalidUrl(_))
        ));
        assert!(RelayUrl::parse("not a url").is_err());
    }

    #[test]
    fn test_parse_relays_dedups() {
        let relays = parse_relays(["wss://nos.lol", "WSS://NOS.LOL/", "wss://relay.damus.io"]).unwrap();
        assert_eq!(relays.len(), 2);
        assert!(parse_relays(["wss://nos.lol", "ftp://x"]).is_err());
    }

    #[test]
    fn test_serde_uses_normalized_string() {
        let url: RelayUrl = serde_json::from_str("\"wss://Nos.lol/\"").unwrap();
        assert_eq!(serde_json::to_string(&url).unwrap(), "\"wss://nos.lol\"");
    }
}
