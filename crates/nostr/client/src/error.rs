//! Client error types

use crate::message::DecodeError;
use thiserror::Error;

/// Client error type
#[derive(Error, Debug)]
pub enum ClientError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parse error
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// A live subscription already uses this id
    #[error("Duplicate subscription: {0}")]
    DuplicateSubscription(String),

    /// Not connected
    #[error("Not connected to relay")]
    NotConnected,

    /// Relay payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// The signing oracle refused or failed
    #[error("Signing error: {0}")]
    Signing(String),

    /// The persistent store failed
    #[error("Store error: {0}")]
    Store(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A background service (backlog, importer) is no longer running
    #[error("Service stopped")]
    ServiceStopped,
}

/// Client result type
pub type Result<T> = std::result::Result<T, ClientError>;
