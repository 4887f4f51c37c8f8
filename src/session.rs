//! The state owned by one accepted connection, and the query/response
//! shapes that flow through it.

use std::net::SocketAddr;

use crate::auth::AuthenticatedUser;

/// PROTOBUF is terminal and rejected during handshake, so the only value
/// that ever survives into a live session is `Json`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WireProtocol {
    Json,
}

/// Return-empty iff the negotiated version is below 4.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EmptyBatchPolicy {
    ReturnEmpty,
    SuppressEmpty,
}

impl EmptyBatchPolicy {
    pub fn for_version(version: u8) -> Self {
        if version < 4 {
            EmptyBatchPolicy::ReturnEmpty
        } else {
            EmptyBatchPolicy::SuppressEmpty
        }
    }
}

/// The small set of protocol versions a magic word can map to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ProtocolVersion(pub u8);

impl ProtocolVersion {
    pub fn max_in_flight(self) -> usize {
        if self.0 < 4 {
            1
        } else {
            1024
        }
    }

    pub fn is_scram(self) -> bool {
        self.0 == 10
    }
}

/// Owned by the handler task for one accepted socket.
pub struct ConnectionSession {
    pub peer_address: SocketAddr,
    pub protocol_version: ProtocolVersion,
    pub wire_protocol: WireProtocol,
    pub authenticated_user: AuthenticatedUser,
    pub max_in_flight: usize,
    pub empty_batch_policy: EmptyBatchPolicy,
}

/// Error kind tag for a synthesized error [`Response`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResponseErrorKind {
    RuntimeError,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Indeterminacy {
    OpIndeterminate,
}

/// Opaque structure the query handler fills, or that the connection loop
/// synthesizes when reporting an error.
#[derive(Clone, Debug)]
pub enum Response {
    Success(serde_json::Value),
    Error {
        kind: ResponseErrorKind,
        indeterminacy: Indeterminacy,
        message: String,
    },
}

impl Response {
    pub fn synthesize_error(message: impl Into<String>) -> Self {
        Response::Error {
            kind: ResponseErrorKind::RuntimeError,
            indeterminacy: Indeterminacy::OpIndeterminate,
            message: message.into(),
        }
    }

    /// Render to the wire JSON shape consumed by `write_response_frame`.
    /// Kept deliberately small: real backtraces are always empty.
    pub fn to_wire(&self) -> serde_json::Value {
        match self {
            Response::Success(value) => value.clone(),
            Response::Error {
                message, ..
            } => serde_json::json!({
                "t": "RUNTIME_ERROR",
                "e": "OP_INDETERMINATE",
                "r": [message],
                "b": [],
            }),
        }
    }
}
