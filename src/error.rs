//! Error types for coap-gateway

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::message::MessageCode;

/// Main error type for gateway operations
///
/// Protocol-level failures on the server side (bad metric names, handler
/// faults) are never represented here: they travel back to the peer as
/// response codes. These variants are local to the caller.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Wire bytes could not be parsed or encoded (logged and dropped, never sent to a peer)
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// No matching reply arrived before the exchange deadline
    #[error("No response from {peer} within {timeout:?}")]
    NoResponse { peer: SocketAddr, timeout: Duration },

    /// The peer rejected the request with a Reset message
    #[error("Request reset by {peer}")]
    Reset { peer: SocketAddr },

    /// The response payload did not parse as the expected value type
    #[error("Invalid response format: {0}")]
    InvalidResponseFormat(String),

    /// A response arrived but carried a non-success code
    #[error("Remote error {code}: {message}")]
    RemoteError { code: MessageCode, message: String },

    /// A resource path was registered twice
    #[error("Duplicate resource path: {0}")]
    DuplicateResource(String),

    /// A resource path could not be used as a Uri-Path
    #[error("Invalid resource path: {0}")]
    InvalidPath(String),

    /// A sensor value fell outside its physical range
    #[error("Value {value} out of range for {metric}")]
    OutOfRange { metric: String, value: f64 },

    /// No CoAP server address has been configured yet
    #[error("CoAP server configuration is not set")]
    NotConfigured,

    /// Reads were attempted while the gateway is disconnected
    #[error("CoAP server is not connected")]
    NotConnected,

    /// No configuration entry with the given id
    #[error("Configuration not found: {0}")]
    ConfigNotFound(u64),

    /// Configuration value rejected during validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error (sockets, files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing/serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CBOR encoding error
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// CBOR decoding error
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
}

impl GatewayError {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage(reason.into())
    }

    /// Whether the caller may reasonably retry the same request
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoResponse { .. } | Self::Reset { .. })
    }
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;
