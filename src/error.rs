//! Error taxonomy for the connection front-end.
//!
//! [`ReportableError`] carries enough detail for our own logs,
//! [`UserFacingError`] renders the subset that's safe to hand back to a
//! driver over the wire.

use std::{fmt, io};
use thiserror::Error;

/// Coarse classification used for metrics labels and log levels.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// Bad handshake, unsupported version, malformed frame, wrong key.
    Protocol,
    /// SCRAM or legacy-key authentication failure.
    Auth,
    /// Failure inside the crypto primitives themselves.
    Crypto,
    /// TLS handshake failed before any protocol bytes were read.
    Tls,
    /// The peer went away; not actionable.
    PeerClosed,
    /// We are draining or were cancelled.
    Interrupted,
    /// The external query handler raised.
    Handler,
}

impl ErrorKind {
    pub fn to_metric_label(self) -> &'static str {
        match self {
            ErrorKind::Protocol => "protocol",
            ErrorKind::Auth => "auth",
            ErrorKind::Crypto => "crypto",
            ErrorKind::Tls => "tls",
            ErrorKind::PeerClosed => "peer_closed",
            ErrorKind::Interrupted => "interrupted",
            ErrorKind::Handler => "handler",
        }
    }
}

/// Marks errors that may be shown to a client; formatting must strip
/// anything sensitive. Do not implement this for [`anyhow::Error`].
pub trait UserFacingError: ReportableError {
    fn to_string_client(&self) -> String {
        self.to_string()
    }
}

pub trait ReportableError: fmt::Display + Send + Sync + 'static {
    fn get_error_kind(&self) -> ErrorKind;
}

/// The wire-visible `(code, message)` pair a driver can match on. `None` for
/// errors that never reach a driver (e.g. a silent TLS failure).
pub trait ClientErrorCode {
    fn client_code(&self) -> Option<i32>;
}

/// A connection-level error: anything that aborts the handshake, the
/// framing layer, or the whole connection loop and must be reported to the
/// dispatcher for the final error-frame write.
#[derive(Debug, Error)]
pub enum ConnError {
    #[error("{0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Auth(#[from] crate::auth::AuthenticationError),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("openssl error: {0}")]
    OpensslLike(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("peer closed the connection")]
    PeerClosed,

    #[error("interrupted")]
    Interrupted,

    #[error("query handler error: {0}")]
    Handler(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ReportableError for ConnError {
    fn get_error_kind(&self) -> ErrorKind {
        match self {
            ConnError::Protocol(_) => ErrorKind::Protocol,
            ConnError::Auth(_) => ErrorKind::Auth,
            ConnError::Crypto(_) | ConnError::OpensslLike(_) => ErrorKind::Crypto,
            ConnError::Tls(_) => ErrorKind::Tls,
            ConnError::PeerClosed => ErrorKind::PeerClosed,
            ConnError::Interrupted => ErrorKind::Interrupted,
            ConnError::Handler(_) => ErrorKind::Handler,
            ConnError::Io(_) => ErrorKind::PeerClosed,
        }
    }
}

impl UserFacingError for ConnError {
    fn to_string_client(&self) -> String {
        match self {
            ConnError::Protocol(e) => e.to_string(),
            ConnError::Auth(_) => "Incorrect authorization key.".to_string(),
            ConnError::Crypto(_) | ConnError::OpensslLike(_) => self.to_string(),
            ConnError::Io(_) | ConnError::PeerClosed => "Client closed the connection.".to_string(),
            ConnError::Interrupted => "Server is shutting down.".to_string(),
            ConnError::Handler(msg) => format!("Fatal error on another query: {msg}"),
            ConnError::Tls(_) => "internal error".to_string(),
        }
    }
}

impl ClientErrorCode for ConnError {
    fn client_code(&self) -> Option<i32> {
        match self {
            ConnError::Protocol(e) => Some(e.code()),
            ConnError::Auth(e) => Some(e.code),
            ConnError::Crypto(_) => Some(21),
            ConnError::OpensslLike(_) => Some(22),
            _ => None,
        }
    }
}

/// Errors that can surface during handshake/framing.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Received an unsupported protocol version. This port is for document \
        database queries. Does your client driver version not match the server?")]
    UnsupportedMagic,

    #[error("The PROTOBUF client protocol is no longer supported")]
    ProtobufRetired,

    #[error("Client provided an authorization key that is too long.")]
    AuthKeyTooLong,

    #[error("Unrecognized protocol specified: '{0}'")]
    UnrecognizedWireProtocol(i32),

    #[error("Limited read buffer size.")]
    ReadBufferExceeded,

    #[error("Invalid JSON object.")]
    InvalidJson,

    #[error("Failed to convert JSON to datum.")]
    JsonToDatumFailed,

    #[error("Expected a number for `protocol_version`.")]
    BadProtocolVersionType,

    #[error("Unsupported `protocol_version`.")]
    UnsupportedProtocolVersion,

    #[error("Expected a string for `authentication_method`.")]
    BadAuthMethodType,

    #[error("Unsupported `authentication_method`.")]
    UnsupportedAuthMethod,

    #[error("Expected a string for `authentication`.")]
    BadAuthenticationType,

    #[error("malformed query frame")]
    MalformedQueryFrame,
}

impl ProtocolError {
    /// Client-visible error code for this protocol error.
    pub fn code(&self) -> i32 {
        match self {
            ProtocolError::UnsupportedMagic
            | ProtocolError::ProtobufRetired
            | ProtocolError::AuthKeyTooLong
            | ProtocolError::UnrecognizedWireProtocol(_) => -1,
            ProtocolError::BadProtocolVersionType => 1,
            ProtocolError::UnsupportedProtocolVersion => 2,
            ProtocolError::BadAuthMethodType => 3,
            ProtocolError::UnsupportedAuthMethod => 4,
            ProtocolError::BadAuthenticationType => 5,
            ProtocolError::ReadBufferExceeded => 7,
            ProtocolError::InvalidJson => 8,
            ProtocolError::JsonToDatumFailed => 9,
            ProtocolError::MalformedQueryFrame => -1,
        }
    }
}
