//! Canonical relay URLs.
//!
//! Every relay is identified by its normalized URL: scheme and host lowercased,
//! trailing slash stripped. Two spellings of the same relay therefore map to one
//! connection in the pool.

use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Normalized WebSocket URL of a relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelayUrl(String);

impl RelayUrl {
    /// Parse and normalize a relay URL. Only `ws://` and `wss://` are accepted.
    pub fn parse(input: &str) -> Result<Self> {
        let url = Url::parse(input.trim())?;

        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(ClientError::InvalidUrl(format!(
                "URL must use ws:// or wss:// scheme, got: {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(ClientError::InvalidUrl(format!("URL has no host: {input}")));
        }

        // `Url` already lowercases scheme and host; it also appends "/" to an empty path.
        let mut normalized = url.to_string();
        while normalized.ends_with('/') {
            normalized.pop();
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host part, used for short log lines.
    pub fn host(&self) -> &str {
        self.0
            .split_once("://")
            .map(|(_, rest)| rest.split(['/', '?', ':']).next().unwrap_or(rest))
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for RelayUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RelayUrl {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RelayUrl {
    type Error = ClientError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for RelayUrl {
    type Error = ClientError;

    fn try_from(value: &str) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<RelayUrl> for String {
    fn from(url: RelayUrl) -> Self {
        url.0
    }
}

impl AsRef<str> for RelayUrl {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for RelayUrl {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_slash_stripped() {
        let url = RelayUrl::parse("wss://relay.damus.io/").unwrap();
        assert_eq!(url.as_str(), "wss://relay.damus.io");
    }

    #[test]
    fn test_scheme_and_host_lowercased() {
        let url = RelayUrl::parse("WSS://Relay.Example.COM").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com");
    }

    #[test]
    fn test_same_relay_different_spelling() {
        let a = RelayUrl::parse("wss://nos.lol").unwrap();
        let b = RelayUrl::parse("  WSS://NOS.LOL/ ").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_path_kept() {
        let url = RelayUrl::parse("wss://relay.example.com/inbox/").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com/inbox");
        assert_eq!(url.host(), "relay.example.com");
    }

    #[test]
    fn test_invalid_scheme() {
        match RelayUrl::parse("https://relay.example.com") {
            Err(ClientError::InvalidUrl(_)) => {}
            other => panic!("Expected InvalidUrl error, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(matches!(
            RelayUrl::parse("not a url"),
            Err(ClientError::UrlParse(_))
        ));
    }

    #[test]
    fn test_deserialize_normalizes() {
        let url: RelayUrl = serde_json::from_str("\"wss://Relay.Example.com/\"").unwrap();
        assert_eq!(url.as_str(), "wss://relay.example.com");
    }
}
