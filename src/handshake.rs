//! The handshake engine. Dispatches on a 4-byte magic word to either the
//! legacy plaintext path (versions 3-4) or the SCRAM-SHA-256 path (version
//! 10); versions before 3 and any unrecognized magic are rejected outright.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::auth::{AuthWatchable, Authenticator};
use crate::error::{ConnError, ProtocolError};
use crate::framing;
use crate::session::{ConnectionSession, EmptyBatchPolicy, ProtocolVersion, WireProtocol};

/// Exact numeric values are part of the driver contract and are preserved
/// from the wire protocol's original definition.
mod magic {
    pub const V0_1: u32 = 0x3f61_ba36;
    pub const V0_2: u32 = 0x7230_81e1;
    pub const V0_3: u32 = 0x5f75_e83e;
    pub const V0_4: u32 = 0x400c_2d20;
    pub const V1_0: u32 = 0x34c2_bdc3;
}

const WIRE_JSON: i32 = 0x7e6970c7u32 as i32;
const WIRE_PROTOBUF: i32 = 0x271ffc41;

/// Crate version string reported in the SCRAM server-hello; distinct from
/// the magic words, purely informational.
const SERVER_VERSION: &str = concat!("docdb-connfront ", env!("CARGO_PKG_VERSION"));

/// Run the handshake to completion, returning the authenticated session.
/// `stream` is whatever's left after TLS (if any) completed.
///
/// On failure, also returns the protocol version the magic word resolved
/// to (if any), needed so the caller can pick the right error-frame shape
/// even when the failure happened partway through a SCRAM exchange, before
/// a `ConnectionSession` existed to carry it.
pub async fn run_handshake<S>(
    stream: &mut S,
    peer_address: SocketAddr,
    watchable: Arc<dyn AuthWatchable>,
) -> Result<ConnectionSession, (Option<u8>, ConnError)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let client_magic = framing::read_u32_le(stream).await.map_err(|e| (None, e.into()))?;

    let version = match client_magic {
        magic::V0_1 => return Err((None, reject(ProtocolError::ProtobufRetired))),
        magic::V0_2 => return Err((None, reject(ProtocolError::ProtobufRetired))),
        magic::V0_3 => 3u8,
        magic::V0_4 => 4u8,
        magic::V1_0 => 10u8,
        _ => return Err((None, reject(ProtocolError::UnsupportedMagic))),
    };

    let result = if version < 10 {
        legacy_handshake(stream, peer_address, version, watchable).await
    } else {
        scram_handshake(stream, peer_address, version, watchable).await
    };
    result.map_err(|e| (Some(version), e))
}

fn reject(e: ProtocolError) -> ConnError {
    ConnError::Protocol(e)
}

async fn legacy_handshake<S>(
    stream: &mut S,
    peer_address: SocketAddr,
    version: u8,
    watchable: Arc<dyn AuthWatchable>,
) -> Result<ConnectionSession, ConnError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let auth_key_size = framing::read_u32_le(stream).await?;
    if auth_key_size > 2048 {
        return Err(reject(ProtocolError::AuthKeyTooLong));
    }
    let auth_key_bytes = framing::read_exact_bytes(stream, auth_key_size as usize).await?;
    let auth_key = String::from_utf8_lossy(&auth_key_bytes).into_owned();

    let mut authenticator = Authenticator::plaintext(watchable);
    // Note: this exact message is contractual -- do not reword it, drivers
    // match it verbatim.
    authenticator
        .next_message(&auth_key)
        .await
        .map_err(ConnError::Auth)?;

    let wire_protocol = framing::read_i32_le(stream).await?;
    match wire_protocol {
        WIRE_JSON => {}
        WIRE_PROTOBUF => return Err(reject(ProtocolError::ProtobufRetired)),
        other => return Err(reject(ProtocolError::UnrecognizedWireProtocol(other))),
    }

    framing::write_ascii_line(stream, "SUCCESS").await?;

    let authenticated_user = authenticator
        .authenticated_user()
        .expect("authenticator reached Done on the success path above");

    Ok(ConnectionSession {
        peer_address,
        protocol_version: ProtocolVersion(version),
        wire_protocol: WireProtocol::Json,
        authenticated_user,
        max_in_flight: ProtocolVersion(version).max_in_flight(),
        empty_batch_policy: EmptyBatchPolicy::for_version(version),
    })
}

async fn scram_handshake<S>(
    stream: &mut S,
    peer_address: SocketAddr,
    version: u8,
    watchable: Arc<dyn AuthWatchable>,
) -> Result<ConnectionSession, ConnError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framing::write_datum(
        stream,
        &json!({
            "success": true,
            "max_protocol_version": 0,
            "min_protocol_version": 0,
            "server_version": SERVER_VERSION,
        }),
    )
    .await?;

    let client_first = framing::read_datum(stream).await?;
    let protocol_version = client_first
        .get("protocol_version")
        .ok_or(ProtocolError::BadProtocolVersionType)
        .map_err(reject)?;
    let protocol_version = protocol_version
        .as_f64()
        .ok_or(ProtocolError::BadProtocolVersionType)
        .map_err(reject)?;
    if protocol_version != 0.0 {
        return Err(reject(ProtocolError::UnsupportedProtocolVersion));
    }

    let auth_method = client_first
        .get("authentication_method")
        .and_then(|v| v.as_str())
        .ok_or(ProtocolError::BadAuthMethodType)
        .map_err(reject)?;
    if auth_method != "SCRAM-SHA-256" {
        return Err(reject(ProtocolError::UnsupportedAuthMethod));
    }

    let client_first_payload = client_first
        .get("authentication")
        .and_then(|v| v.as_str())
        .ok_or(ProtocolError::BadAuthenticationType)
        .map_err(reject)?;

    let mut authenticator = Authenticator::scram(watchable);
    let server_first = authenticator
        .next_message(client_first_payload)
        .await
        .map_err(ConnError::Auth)?;

    framing::write_datum(
        stream,
        &json!({"success": true, "authentication": server_first}),
    )
    .await?;

    let client_final = framing::read_datum(stream).await?;
    let client_final_payload = client_final
        .get("authentication")
        .and_then(|v| v.as_str())
        .ok_or(ProtocolError::BadAuthenticationType)
        .map_err(reject)?;

    let server_final = authenticator
        .next_message(client_final_payload)
        .await
        .map_err(ConnError::Auth)?;

    framing::write_datum(
        stream,
        &json!({"success": true, "authentication": server_final}),
    )
    .await?;

    let authenticated_user = authenticator
        .authenticated_user()
        .expect("authenticator reached Done on the success path above");

    Ok(ConnectionSession {
        peer_address,
        protocol_version: ProtocolVersion(version),
        wire_protocol: WireProtocol::Json,
        authenticated_user,
        max_in_flight: ProtocolVersion(version).max_in_flight(),
        empty_batch_policy: EmptyBatchPolicy::for_version(version),
    })
}

/// Write the single final error frame in the shape that matches whatever
/// protocol stage negotiation reached. `version` is `None` when the magic
/// word itself was never resolved, which uses the legacy plain-text shape,
/// since no JSON framing has been agreed upon yet.
pub async fn write_final_error<S>(
    stream: &mut S,
    version: Option<u8>,
    code: i32,
    message: &str,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    match version {
        Some(v) if v >= 10 => {
            framing::write_datum(
                stream,
                &json!({"success": false, "error": message, "error_code": code}),
            )
            .await
        }
        _ => framing::write_ascii_line(stream, &format!("ERROR: {message}\n")).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StoredCredential;
    use async_trait::async_trait;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    struct FixedKey(Vec<u8>);

    #[async_trait]
    impl AuthWatchable for FixedKey {
        async fn lookup(&self, _user: &str) -> Option<StoredCredential> {
            None
        }
        async fn check_legacy_key(&self, presented: &[u8]) -> bool {
            presented == self.0.as_slice()
        }
    }

    #[tokio::test]
    async fn legacy_handshake_rejects_version_1_with_protobuf_message() {
        let (mut client, mut server) = duplex(4096);
        let watchable: Arc<dyn AuthWatchable> = Arc::new(FixedKey(b"hunter2".to_vec()));

        client
            .write_all(&magic::V0_1.to_le_bytes())
            .await
            .unwrap();

        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (version, err) = run_handshake(&mut server, peer, watchable).await.unwrap_err();
        assert_eq!(version, None);
        assert_eq!(err.to_string(), "The PROTOBUF client protocol is no longer supported");

        let _ = &mut client; // keep alive through the write above
    }

    #[tokio::test]
    async fn legacy_handshake_succeeds_with_the_right_key() {
        let (mut client, mut server) = duplex(4096);
        let watchable: Arc<dyn AuthWatchable> = Arc::new(FixedKey(b"hunter2".to_vec()));

        let key = b"hunter2";
        client.write_all(&magic::V0_4.to_le_bytes()).await.unwrap();
        client
            .write_all(&(key.len() as i32).to_le_bytes())
            .await
            .unwrap();
        client.write_all(key).await.unwrap();
        client.write_all(&WIRE_JSON.to_le_bytes()).await.unwrap();

        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let handle = tokio::spawn(async move { run_handshake(&mut server, peer, watchable).await });

        let mut banner = [0u8; 8];
        client.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"SUCCESS\0");

        let session = handle.await.unwrap().unwrap();
        assert_eq!(session.protocol_version.0, 4);
        assert_eq!(session.max_in_flight, 1024);
    }

    #[tokio::test]
    async fn legacy_handshake_rejects_an_auth_key_over_2048_bytes() {
        let (mut client, mut server) = duplex(8192);
        let watchable: Arc<dyn AuthWatchable> = Arc::new(FixedKey(b"hunter2".to_vec()));

        client.write_all(&magic::V0_4.to_le_bytes()).await.unwrap();
        client.write_all(&2049i32.to_le_bytes()).await.unwrap();

        let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let (version, err) = run_handshake(&mut server, peer, watchable).await.unwrap_err();
        assert_eq!(version, Some(4));
        assert!(matches!(err, ConnError::Protocol(ProtocolError::AuthKeyTooLong)));
        let _ = &mut client;
    }
}
