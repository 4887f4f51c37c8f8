//! The NUL-terminated JSON framer used during handshake, and the
//! length-prefixed query/response codec used once a connection is
//! authenticated. These are distinct wire shapes that happen to share a
//! module because both speak JSON.

pub mod wire;

use crate::error::ProtocolError;
use byteorder::{ByteOrder, LittleEndian};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Hard cap on a single NUL-terminated handshake document. Production SCRAM
/// payloads are assumed to fit comfortably under this.
pub const READ_BUFFER_CAP: usize = 2048;

/// Read one NUL-terminated JSON document from `stream`, one byte at a time,
/// so short reads and partial writes on the wire are handled identically
/// regardless of how the underlying transport buffers bytes.
pub async fn read_datum<S>(stream: &mut S) -> Result<Value, ProtocolError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUFFER_CAP];
    let mut offset = 0usize;
    loop {
        if offset >= READ_BUFFER_CAP {
            return Err(ProtocolError::ReadBufferExceeded);
        }
        let mut byte = [0u8; 1];
        stream
            .read_exact(&mut byte)
            .await
            .map_err(|_| ProtocolError::ReadBufferExceeded)?;
        buf[offset] = byte[0];
        offset += 1;
        if byte[0] == 0 {
            break;
        }
    }
    let text = &buf[..offset - 1];
    serde_json::from_slice(text).map_err(|_| ProtocolError::InvalidJson)
}

/// Read one NUL-terminated document, preserving the underlying I/O error
/// instead of collapsing it into [`ProtocolError::ReadBufferExceeded`]. Used
/// where the caller needs to tell "peer closed" apart from "buffer full".
pub async fn try_read_datum<S>(stream: &mut S) -> std::io::Result<Result<Value, ProtocolError>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUFFER_CAP];
    let mut offset = 0usize;
    loop {
        if offset >= READ_BUFFER_CAP {
            return Ok(Err(ProtocolError::ReadBufferExceeded));
        }
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await?;
        buf[offset] = byte[0];
        offset += 1;
        if byte[0] == 0 {
            break;
        }
    }
    let text = &buf[..offset - 1];
    Ok(serde_json::from_slice(text).map_err(|_| ProtocolError::InvalidJson))
}

/// Serialize `value` to JSON, append a single NUL terminator, and write it
/// to `stream` as one logical write.
pub async fn write_datum<S>(stream: &mut S, value: &Value) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut bytes = serde_json::to_vec(value).expect("Value serialization is infallible");
    bytes.push(0);
    stream.write_all(&bytes).await?;
    stream.flush().await
}

/// Write a raw NUL-terminated ASCII line (the legacy `"SUCCESS"` banner and
/// the legacy `"ERROR: ..."` line both use this, not JSON framing).
pub async fn write_ascii_line<S>(stream: &mut S, line: &str) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut bytes = line.as_bytes().to_vec();
    bytes.push(0);
    stream.write_all(&bytes).await?;
    stream.flush().await
}

/// Read a 4-byte little-endian signed integer, as the handshake's
/// `auth_key_size` and `wire_protocol` fields are framed.
pub async fn read_i32_le<S>(stream: &mut S) -> std::io::Result<i32>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    Ok(LittleEndian::read_i32(&buf))
}

/// Read a 4-byte little-endian unsigned magic word (the protocol version tag).
pub async fn read_u32_le<S>(stream: &mut S) -> std::io::Result<u32>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await?;
    Ok(LittleEndian::read_u32(&buf))
}

/// Read exactly `len` bytes, used for the legacy auth key payload.
pub async fn read_exact_bytes<S>(stream: &mut S, len: usize) -> std::io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trips_a_json_datum() {
        let mut buf = Vec::new();
        let value = json!({"a": 1, "b": [1, 2, 3], "c": null});
        write_datum(&mut buf, &value).await.unwrap();
        assert_eq!(*buf.last().unwrap(), 0);

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = read_datum(&mut cursor).await.unwrap();
        assert_eq!(read_back, value);
    }

    #[tokio::test]
    async fn rejects_a_document_without_terminator_within_the_cap() {
        let mut payload = vec![b'1'; READ_BUFFER_CAP];
        let mut cursor = std::io::Cursor::new(&mut payload);
        let err = read_datum(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ReadBufferExceeded));
    }

    #[tokio::test]
    async fn rejects_malformed_json() {
        let mut buf = b"{not json}\0".to_vec();
        let mut cursor = std::io::Cursor::new(&mut buf);
        let err = read_datum(&mut cursor).await.unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidJson));
    }
}
