//! Error and result types.
//!
//! [`TsrpcError`] is the wire-visible error of the protocol: whichever peer
//! detects a failure constructs one, and after crossing the wire it is
//! reconstructed verbatim on the receiver. The `kind` discriminant tells the
//! caller *where* the failure happened (its own stack, the transport, the
//! remote handler, ...), while `code` is a machine-readable refinement.

use std::error::Error as StdError;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TsrpcError>;

/// Where an error was produced, and who is at fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    /// Domain-level failure raised by an API handler; reaches the caller
    /// verbatim.
    ApiError,
    /// Transport failure: timeout, refused connection, disconnect mid-call.
    NetworkError,
    /// The remote handler failed or overran its time budget.
    ServerError,
    /// This side failed before anything reached the wire (client endpoint).
    ClientError,
    /// The peer sent a malformed frame.
    RemoteError,
    /// This side failed to process a well-formed exchange (decode, parse).
    LocalError,
}

/// Reserved `code` values on the wire.
pub mod codes {
    /// The handler failed unexpectedly; details may ride in `innerErr`.
    pub const INTERNAL_ERR: &str = "INTERNAL_ERR";
    /// The handler overran the server's execution budget.
    pub const SERVER_TIMEOUT: &str = "SERVER_TIMEOUT";
    /// No handler is registered (or loadable) for the called API.
    pub const NOT_IMPLEMENTED: &str = "NOT_IMPLEMENTED";
    /// The caller's own timeout elapsed before a response arrived.
    pub const TIMEOUT: &str = "TIMEOUT";
    /// The transport could not reach the peer.
    pub const ECONNREFUSED: &str = "ECONNREFUSED";
}

/// The protocol's error value.
///
/// Serializes to the wire shape
/// `{"message", "code"?, "type", "info"?, "innerErr"?}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TsrpcError {
    /// Human-readable description.
    pub message: String,
    /// Where the failure happened, and who is at fault.
    #[serde(rename = "type")]
    pub kind: ErrorType,
    /// Machine-readable refinement, reserved or user-defined.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Structured context attached by whoever raised the error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
    /// The underlying cause, carried only when the origin permits it.
    #[serde(rename = "innerErr", default, skip_serializing_if = "Option::is_none")]
    pub inner_err: Option<Value>,
}

impl TsrpcError {
    /// Creates an error of the given kind.
    pub fn new(kind: ErrorType, message: impl Into<String>) -> TsrpcError {
        TsrpcError {
            message: message.into(),
            kind,
            code: None,
            info: None,
            inner_err: None,
        }
    }

    /// Shorthand for an [`ErrorType::ApiError`].
    pub fn api(message: impl Into<String>) -> TsrpcError {
        TsrpcError::new(ErrorType::ApiError, message)
    }

    /// Shorthand for an [`ErrorType::NetworkError`].
    pub fn network(message: impl Into<String>) -> TsrpcError {
        TsrpcError::new(ErrorType::NetworkError, message)
    }

    /// Shorthand for an [`ErrorType::ServerError`].
    pub fn server(message: impl Into<String>) -> TsrpcError {
        TsrpcError::new(ErrorType::ServerError, message)
    }

    /// Shorthand for an [`ErrorType::ClientError`].
    pub fn client(message: impl Into<String>) -> TsrpcError {
        TsrpcError::new(ErrorType::ClientError, message)
    }

    /// Shorthand for an [`ErrorType::RemoteError`].
    pub fn remote(message: impl Into<String>) -> TsrpcError {
        TsrpcError::new(ErrorType::RemoteError, message)
    }

    /// Shorthand for an [`ErrorType::LocalError`].
    pub fn local(message: impl Into<String>) -> TsrpcError {
        TsrpcError::new(ErrorType::LocalError, message)
    }

    /// Sets `code`.
    pub fn with_code(mut self, code: impl Into<String>) -> TsrpcError {
        self.code = Some(code.into());
        self
    }

    /// Sets `info`.
    pub fn with_info(mut self, info: Value) -> TsrpcError {
        self.info = Some(info);
        self
    }

    /// Sets `innerErr`.
    pub fn with_inner(mut self, inner: impl Into<Value>) -> TsrpcError {
        self.inner_err = Some(inner.into());
        self
    }

    /// Whether `code` equals the given reserved or user-defined value.
    pub fn is_code(&self, code: &str) -> bool {
        self.code.as_deref() == Some(code)
    }
}

impl fmt::Display for TsrpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(ref code) => write!(f, "[{:?}] [{}] {}", self.kind, code, self.message),
            None => write!(f, "[{:?}] {}", self.kind, self.message),
        }
    }
}

impl StdError for TsrpcError {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_shape() {
        let err = TsrpcError::api("Test TsrpcError")
            .with_code("CODE_TEST")
            .with_info(json!("ErrInfo Test"));
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(
            v,
            json!({
                "message": "Test TsrpcError",
                "type": "ApiError",
                "code": "CODE_TEST",
                "info": "ErrInfo Test",
            })
        );
    }

    #[test]
    fn absent_fields_stay_off_the_wire() {
        let err = TsrpcError::network("Request Timeout").with_code(codes::TIMEOUT);
        let v = serde_json::to_value(&err).unwrap();
        assert_eq!(
            v,
            json!({"message": "Request Timeout", "type": "NetworkError", "code": "TIMEOUT"})
        );
    }

    #[test]
    fn reconstructed_verbatim() {
        let err = TsrpcError::server("Internal Server Error")
            .with_code(codes::INTERNAL_ERR)
            .with_inner("Test InnerError");
        let s = serde_json::to_string(&err).unwrap();
        let back: TsrpcError = serde_json::from_str(&s).unwrap();
        assert_eq!(back, err);
    }
}
