//! Error types for the client.

use thiserror::Error;

use crate::protocol::{ER_NO_SUCH_USER, ER_PASSWORD_MISMATCH};

/// Main error type for all client operations.
///
/// Transport-level failures (`Io`, decode errors) are handled inside the
/// connection lifecycle and never reach a caller waiting on a request:
/// in-flight requests observe them as `ConnectionClosed` or
/// `ConnectionNotReady` instead.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on the underlying socket.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// MsgPack serialization error while encoding a request body.
    #[error("msgpack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error while decoding typed data.
    #[error("msgpack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed frame or envelope (bad tag byte, zero length, truncated map).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection is permanently closed; no further requests are possible.
    #[error("connection closed: {0}")]
    ConnectionClosed(&'static str),

    /// Connection is between reconnect attempts; the request was not sent.
    #[error("client connection is not ready")]
    ConnectionNotReady,

    /// The per-request deadline elapsed before a response arrived.
    #[error("client timeout for request {0}")]
    Timeout(u32),

    /// Error reported by the server in a response envelope.
    ///
    /// The high error-flag bit is already masked off `code`.
    #[error("server error {code:#x}: {message}")]
    Server { code: u32, message: String },
}

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Authentication failures are never retried by the reconnect loop.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Error::Server { code, .. } if *code == ER_NO_SUCH_USER || *code == ER_PASSWORD_MISMATCH
        )
    }
}

impl From<rmp::encode::ValueWriteError> for Error {
    fn from(e: rmp::encode::ValueWriteError) -> Self {
        match e {
            rmp::encode::ValueWriteError::InvalidMarkerWrite(e)
            | rmp::encode::ValueWriteError::InvalidDataWrite(e) => Error::Io(e),
        }
    }
}

impl From<rmp::decode::ValueReadError> for Error {
    fn from(e: rmp::decode::ValueReadError) -> Self {
        Error::Protocol(format!("invalid msgpack value: {e}"))
    }
}

impl From<rmp::decode::NumValueReadError> for Error {
    fn from(e: rmp::decode::NumValueReadError) -> Self {
        Error::Protocol(format!("invalid msgpack number: {e}"))
    }
}

impl From<rmpv::decode::Error> for Error {
    fn from(e: rmpv::decode::Error) -> Self {
        Error::Protocol(format!("invalid msgpack value: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_failure_detection() {
        let no_user = Error::Server {
            code: ER_NO_SUCH_USER,
            message: "user not found".into(),
        };
        let bad_pass = Error::Server {
            code: ER_PASSWORD_MISMATCH,
            message: "incorrect password".into(),
        };
        let other = Error::Server {
            code: 0x12,
            message: "something else".into(),
        };

        assert!(no_user.is_auth_failure());
        assert!(bad_pass.is_auth_failure());
        assert!(!other.is_auth_failure());
        assert!(!Error::ConnectionNotReady.is_auth_failure());
    }

    #[test]
    fn test_timeout_message_carries_sync() {
        let err = Error::Timeout(42);
        assert!(err.to_string().contains("42"));
    }
}
