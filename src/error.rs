//! Crate-wide error type.
//!
//! Every fallible public operation returns [`HostError`]. Variants map
//! directly onto the error kinds named by the runtime's design: bounded
//! waits that elapse, transport that isn't open, schema mismatches, and so
//! on. A handler's own `Err(HostError)` return is turned into a `FAILURE`
//! envelope by the transaction manager rather than propagating further.

use thiserror::Error;

/// Errors produced by the host runtime.
#[derive(Debug, Error)]
pub enum HostError {
    /// A bounded wait (connect, send, ping, or RPC round trip) elapsed.
    #[error("operation timed out")]
    Timeout,
    /// An operation was attempted on a socket that is not open.
    #[error("socket is not connected")]
    NotConnected,
    /// The orchestrator rejected a `SEND_IO_CALL`.
    #[error("render error: {0}")]
    RenderError(String),
    /// The orchestrator or user aborted the transaction.
    #[error("transaction canceled")]
    Canceled,
    /// I/O was attempted on a transaction or page after it closed.
    #[error("transaction closed")]
    TransactionClosed,
    /// An RPC payload failed schema validation.
    #[error("schema validation failed: {0}")]
    SchemaInvalid(String),
    /// The peer called a method this side does not implement.
    #[error("unknown RPC method: {0}")]
    MethodUnknown(String),
    /// The retry budget for an operation was exhausted.
    #[error("maximum retry attempts exhausted")]
    MaxRetries,
    /// An unrecoverable configuration or handshake failure.
    #[error("fatal: {0}")]
    Fatal(String),
    /// The underlying websocket transport reported an error.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    /// A payload could not be serialized or deserialized as JSON.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// An outbound HTTP request (single-shot declare) failed.
    #[cfg(feature = "http")]
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Convenience alias for results returned by this crate.
pub type Result<T> = std::result::Result<T, HostError>;
