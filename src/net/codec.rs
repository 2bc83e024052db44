//! Peer protocol framing
//!
//! Frame format: [MAGIC "HRD1"][LEN u32 le][BODY bincode][CRC32 le].
//! A frame whose checksum does not verify is `Corrupt` and is discarded
//! by the receiver, never applied.

use crate::common::{crc32, Error, Result};
use crate::net::message::PeerMessage;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_MAGIC: [u8; 4] = [0x48, 0x52, 0x44, 0x31]; // "HRD1"

/// Upper bound on a single frame; covers a full snapshot chunk plus
/// envelope overhead.
pub const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

/// Encode a message into a framed byte buffer.
pub fn encode_frame(msg: &PeerMessage) -> Result<BytesMut> {
    let body =
        bincode::serialize(msg).map_err(|e| Error::Internal(format!("encode frame: {}", e)))?;
    if body.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(Error::Internal(format!(
            "frame too large: {} bytes",
            body.len()
        )));
    }

    let mut buf = BytesMut::with_capacity(body.len() + 12);
    buf.put_slice(&FRAME_MAGIC);
    buf.put_u32_le(body.len() as u32);
    buf.put_slice(&body);
    buf.put_u32_le(crc32(&body));
    Ok(buf)
}

/// Decode one framed message from raw bytes (must contain exactly one frame).
pub fn decode_frame(bytes: &[u8]) -> Result<PeerMessage> {
    if bytes.len() < 12 {
        return Err(Error::Corrupt("short frame".into()));
    }
    if bytes[0..4] != FRAME_MAGIC {
        return Err(Error::Corrupt("bad frame magic".into()));
    }
    let len = u32::from_le_bytes(bytes[4..8].try_into().unwrap()) as usize;
    if bytes.len() != len + 12 {
        return Err(Error::Corrupt("frame length mismatch".into()));
    }
    let body = &bytes[8..8 + len];
    let stored = u32::from_le_bytes(bytes[8 + len..12 + len].try_into().unwrap());
    if crc32(body) != stored {
        return Err(Error::Corrupt("frame checksum mismatch".into()));
    }
    bincode::deserialize(body).map_err(|e| Error::Corrupt(format!("decode frame: {}", e)))
}

/// Write one framed message to an async stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &PeerMessage) -> Result<()> {
    let buf = encode_frame(msg)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message from an async stream. Returns `Ok(None)` on a
/// clean EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<PeerMessage>> {
    let mut magic = [0u8; 4];
    match reader.read_exact(&mut magic).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    if magic != FRAME_MAGIC {
        return Err(Error::Corrupt("bad frame magic".into()));
    }

    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_FRAME_BYTES {
        return Err(Error::Corrupt(format!("frame too large: {} bytes", len)));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;

    let mut crc_bytes = [0u8; 4];
    reader.read_exact(&mut crc_bytes).await?;
    if crc32(&body) != u32::from_le_bytes(crc_bytes) {
        return Err(Error::Corrupt("frame checksum mismatch".into()));
    }

    let msg =
        bincode::deserialize(&body).map_err(|e| Error::Corrupt(format!("decode frame: {}", e)))?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let msg = PeerMessage::Ping {
            from: "node-1".into(),
            seq: 42,
            updates: vec![],
        };
        let buf = encode_frame(&msg).unwrap();
        let back = decode_frame(&buf).unwrap();
        match back {
            PeerMessage::Ping { from, seq, .. } => {
                assert_eq!(from, "node-1");
                assert_eq!(seq, 42);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_body_detected() {
        let msg = PeerMessage::MetaRead;
        let mut buf = encode_frame(&msg).unwrap();
        let mid = buf.len() / 2;
        buf[mid] ^= 0xFF;
        assert!(matches!(decode_frame(&buf), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_bad_magic_detected() {
        let msg = PeerMessage::MetaRead;
        let mut buf = encode_frame(&msg).unwrap();
        buf[0] = 0x00;
        assert!(matches!(decode_frame(&buf), Err(Error::Corrupt(_))));
    }

    #[test]
    fn test_async_stream_roundtrip() {
        tokio_test::block_on(async {
            let msg = PeerMessage::CommitNotice {
                partition: 3,
                term: 2,
                commit_offset: 17,
            };
            let mut buf = Vec::new();
            write_frame(&mut buf, &msg).await.unwrap();

            let mut reader = std::io::Cursor::new(buf);
            let back = read_frame(&mut reader).await.unwrap().unwrap();
            match back {
                PeerMessage::CommitNotice { commit_offset, .. } => assert_eq!(commit_offset, 17),
                other => panic!("unexpected: {:?}", other),
            }

            // clean EOF after the frame
            assert!(read_frame(&mut reader).await.unwrap().is_none());
        });
    }
}
