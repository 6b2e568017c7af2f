//! Wire codec: length-prefixed framing and the little-endian primitives message
//! bodies and payloads are built from.
//!
//! Every `send_message` becomes exactly one framed write; `send_message_with_payload`
//! becomes two independent framed writes (body, then payload). The receiving side
//! mirrors this one length-then-bytes read at a time.

use crate::error::{BrokerError, Result};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Ceiling on a single frame (header+body). Generous relative to any message this
/// protocol defines; exists so a corrupt or hostile length prefix can't trigger an
/// unbounded allocation.
pub const MAX_FRAME_LEN: u32 = 1024;

/// Ceiling on a payload frame (the `WorkerList`/`UpdateWorkerInfo` second frame).
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// Ceiling on any single length-prefixed string inside a payload.
pub const MAX_STRING_LEN: u32 = 4096;

/// Write a length-prefixed frame: a 4-byte little-endian length, then `bytes`.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(w: &mut W, bytes: &[u8]) -> Result<()> {
    w.write_u32_le(bytes.len() as u32).await?;
    w.write_all(bytes).await?;
    Ok(())
}

/// Read a length-prefixed frame, rejecting lengths over `max_len`.
pub async fn read_frame<R: AsyncReadExt + Unpin>(r: &mut R, max_len: u32) -> Result<Vec<u8>> {
    let len = r.read_u32_le().await?;
    if len > max_len {
        return Err(BrokerError::CorruptFrame {
            peer: None,
            reason: format!("frame length {len} exceeds ceiling {max_len}"),
        });
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Append a length-prefixed string (`u32` length + raw UTF-8 bytes, no NUL) to `out`.
pub fn write_string(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

/// Read a length-prefixed string from `cursor`, advancing it past the bytes consumed.
pub fn read_string(cursor: &mut &[u8]) -> Result<String> {
    let len = read_u32(cursor)?;
    if len > MAX_STRING_LEN {
        return Err(BrokerError::CorruptFrame {
            peer: None,
            reason: format!("string length {len} exceeds ceiling {MAX_STRING_LEN}"),
        });
    }
    let len = len as usize;
    if cursor.len() < len {
        return Err(BrokerError::CorruptFrame {
            peer: None,
            reason: "string length runs past end of payload".into(),
        });
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    String::from_utf8(head.to_vec()).map_err(|e| BrokerError::CorruptFrame {
        peer: None,
        reason: format!("invalid UTF-8 in string: {e}"),
    })
}

pub fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

pub fn read_u32(cursor: &mut &[u8]) -> Result<u32> {
    if cursor.len() < 4 {
        return Err(BrokerError::CorruptFrame {
            peer: None,
            reason: "payload truncated reading u32".into(),
        });
    }
    let (head, tail) = cursor.split_at(4);
    *cursor = tail;
    Ok(u32::from_le_bytes(head.try_into().unwrap()))
}

pub fn write_u8(out: &mut Vec<u8>, v: u8) {
    out.push(v);
}

pub fn read_u8(cursor: &mut &[u8]) -> Result<u8> {
    if cursor.is_empty() {
        return Err(BrokerError::CorruptFrame {
            peer: None,
            reason: "payload truncated reading u8".into(),
        });
    }
    let v = cursor[0];
    *cursor = &cursor[1..];
    Ok(v)
}

pub fn write_bool(out: &mut Vec<u8>, v: bool) {
    out.push(v as u8);
}

pub fn read_bool(cursor: &mut &[u8]) -> Result<bool> {
    Ok(read_u8(cursor)? != 0)
}
