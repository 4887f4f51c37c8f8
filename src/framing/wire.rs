//! The post-handshake, length-prefixed JSON wire protocol.
//!
//! Distinct from the handshake's NUL-terminated framing: a query frame is
//! `[8B token LE][4B length LE][length bytes JSON]`, and a response frame
//! has the identical shape. No terminators.

use crate::error::ProtocolError;
use byteorder::{ByteOrder, LittleEndian};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Guards against a client claiming an absurd frame length and stalling the
/// reader on a multi-gigabyte allocation; not part of the wire contract,
/// just a sanity bound on what a single query frame can legitimately be.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// `{token, noreply, parsed_payload}` produced by parsing one inbound frame.
/// The semaphore permit that throttles concurrent queries is layered on by
/// the connection loop, not by the codec.
#[derive(Debug)]
pub struct QueryFrame {
    pub token: i64,
    pub payload: Value,
}

impl QueryFrame {
    /// `noreply` is a property of the parsed query payload, mirroring the
    /// original wire format where it rides inside the query array itself
    /// (global optargs). We look it up the same way the query cache would.
    pub fn noreply(&self) -> bool {
        self.payload
            .get(2)
            .and_then(|optargs| optargs.get("noreply"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Read one `[token][length][json]` frame. Returns `Ok(None)` on a clean
/// EOF at a frame boundary (the client closed the socket between queries,
/// not mid-frame); an EOF mid-frame is a malformed-frame error.
pub async fn read_query_frame<S>(stream: &mut S) -> std::io::Result<Option<QueryFrame>>
where
    S: AsyncRead + Unpin,
{
    let mut token_buf = [0u8; 8];
    match stream.read_exact(&mut token_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let token = LittleEndian::read_i64(&token_buf);

    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = LittleEndian::read_u32(&len_buf);
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            ProtocolError::MalformedQueryFrame,
        ));
    }

    let mut payload_buf = vec![0u8; len as usize];
    stream.read_exact(&mut payload_buf).await?;
    let payload: Value = serde_json::from_slice(&payload_buf).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, ProtocolError::MalformedQueryFrame)
    })?;

    Ok(Some(QueryFrame { token, payload }))
}

/// Write a `[token][length][json]` response frame as one logical write.
pub async fn write_response_frame<S>(
    stream: &mut S,
    token: i64,
    payload: &Value,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(payload).expect("Value serialization is infallible");
    let mut frame = Vec::with_capacity(8 + 4 + body.len());
    let mut token_buf = [0u8; 8];
    LittleEndian::write_i64(&mut token_buf, token);
    frame.extend_from_slice(&token_buf);
    let mut len_buf = [0u8; 4];
    LittleEndian::write_u32(&mut len_buf, body.len() as u32);
    frame.extend_from_slice(&len_buf);
    frame.extend_from_slice(&body);
    stream.write_all(&frame).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trips_a_query_frame() {
        let mut buf = Vec::new();
        write_response_frame(&mut buf, 42, &json!([1, [], {}])).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_query_frame(&mut cursor).await.unwrap().unwrap();
        assert_eq!(frame.token, 42);
        assert_eq!(frame.payload, json!([1, [], {}]));
    }

    #[tokio::test]
    async fn clean_eof_at_a_frame_boundary_is_not_an_error() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let frame = read_query_frame(&mut cursor).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn noreply_is_read_from_the_optargs_slot() {
        let frame = QueryFrame {
            token: 1,
            payload: json!([1, [], {"noreply": true}]),
        };
        assert!(frame.noreply());

        let frame = QueryFrame {
            token: 1,
            payload: json!([1, [], {}]),
        };
        assert!(!frame.noreply());
    }
}
