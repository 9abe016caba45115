//! Binary wire envelope.
//!
//! One WebSocket binary message carries one frame; the first byte selects
//! the kind. `changes` frames are used for upload, catch-up, and broadcast
//! alike. Each entry inside a `changes` frame carries its own length
//! prefix, so a single malformed entry is dropped (and logged) without
//! losing the rest of the batch or the connection.
//!
//! Entry layout: global id (16 bytes) | table name (u16 length + UTF-8) |
//! op (1 byte) | target id (16 bytes) | fields (u32 length + JSON) |
//! timestamp (f64, big-endian seconds since epoch). Replica-local row ids
//! never appear on the wire.

use crate::{ChangeEntry, Error, FieldMap, GlobalId, Op, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

const FRAME_CHANGES: u8 = 0x01;
const FRAME_ACK: u8 = 0x02;

/// One protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A batch of change entries
    Changes(Vec<ChangeEntry>),
    /// Durable-receipt acknowledgment for specific entries
    Ack(Vec<GlobalId>),
}

/// Encode a frame into a single wire message.
pub fn encode(frame: &Frame) -> Bytes {
    let mut buf = BytesMut::new();
    match frame {
        Frame::Changes(entries) => {
            buf.put_u8(FRAME_CHANGES);
            buf.put_u32(entries.len() as u32);
            for entry in entries {
                let body = encode_entry(entry);
                buf.put_u32(body.len() as u32);
                buf.put_slice(&body);
            }
        }
        Frame::Ack(ids) => {
            buf.put_u8(FRAME_ACK);
            buf.put_u32(ids.len() as u32);
            for id in ids {
                buf.put_slice(id.as_bytes());
            }
        }
    }
    buf.freeze()
}

/// Decode one wire message.
///
/// A malformed entry inside a `changes` frame is dropped with a warning;
/// a malformed frame header or a truncated message is an error.
pub fn decode(mut buf: &[u8]) -> Result<Frame> {
    if buf.is_empty() {
        return Err(Error::Decode("empty frame".into()));
    }
    let kind = buf.get_u8();

    match kind {
        FRAME_CHANGES => {
            if buf.remaining() < 4 {
                return Err(Error::Decode("truncated changes frame".into()));
            }
            let count = buf.get_u32() as usize;
            // Each entry costs at least its 4-byte length prefix, which
            // bounds how much a lying count can make us reserve.
            let mut entries = Vec::with_capacity(count.min(buf.remaining() / 4));
            for _ in 0..count {
                if buf.remaining() < 4 {
                    return Err(Error::Decode("truncated entry length".into()));
                }
                let len = buf.get_u32() as usize;
                if buf.remaining() < len {
                    return Err(Error::Decode("truncated entry body".into()));
                }
                let body = &buf[..len];
                buf.advance(len);
                match decode_entry(body) {
                    Ok(entry) => entries.push(entry),
                    Err(e) => {
                        tracing::warn!("dropping malformed entry: {e}");
                    }
                }
            }
            Ok(Frame::Changes(entries))
        }
        FRAME_ACK => {
            if buf.remaining() < 4 {
                return Err(Error::Decode("truncated ack frame".into()));
            }
            let count = buf.get_u32() as usize;
            let mut ids = Vec::with_capacity(count.min(buf.remaining() / 16));
            for _ in 0..count {
                ids.push(take_id(&mut buf)?);
            }
            Ok(Frame::Ack(ids))
        }
        other => Err(Error::Decode(format!("unknown frame kind {other:#04x}"))),
    }
}

fn encode_entry(entry: &ChangeEntry) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_slice(entry.global_id.as_bytes());

    let table = entry.table.as_bytes();
    buf.put_u16(table.len() as u16);
    buf.put_slice(table);

    buf.put_u8(entry.op.code());
    buf.put_slice(entry.target.as_bytes());

    let fields = serde_json::Value::Object(entry.fields.clone()).to_string();
    buf.put_u32(fields.len() as u32);
    buf.put_slice(fields.as_bytes());

    buf.put_f64(entry.timestamp);
    buf
}

fn decode_entry(mut buf: &[u8]) -> Result<ChangeEntry> {
    let global_id = take_id(&mut buf)?;

    if buf.remaining() < 2 {
        return Err(Error::Decode("truncated table name length".into()));
    }
    let table_len = buf.get_u16() as usize;
    if buf.remaining() < table_len {
        return Err(Error::Decode("truncated table name".into()));
    }
    let table = std::str::from_utf8(&buf[..table_len])
        .map_err(|_| Error::Decode("table name is not UTF-8".into()))?
        .to_string();
    buf.advance(table_len);

    if buf.remaining() < 1 {
        return Err(Error::Decode("missing op".into()));
    }
    let op_code = buf.get_u8();
    let op = Op::from_code(op_code)
        .ok_or_else(|| Error::Decode(format!("unknown op code {op_code}")))?;

    let target = take_id(&mut buf)?;

    if buf.remaining() < 4 {
        return Err(Error::Decode("truncated fields length".into()));
    }
    let fields_len = buf.get_u32() as usize;
    if buf.remaining() < fields_len {
        return Err(Error::Decode("truncated fields".into()));
    }
    let fields: FieldMap = serde_json::from_slice(&buf[..fields_len])
        .map_err(|e| Error::Decode(format!("bad field map: {e}")))?;
    buf.advance(fields_len);

    if buf.remaining() < 8 {
        return Err(Error::Decode("truncated timestamp".into()));
    }
    let timestamp = buf.get_f64();

    Ok(ChangeEntry {
        global_id,
        table,
        op,
        target,
        // Local key never crosses the wire; received entries are tagged
        // synced because they come from or through the relay.
        row_id: None,
        fields,
        timestamp,
        synced: true,
    })
}

fn take_id(buf: &mut &[u8]) -> Result<GlobalId> {
    if buf.remaining() < 16 {
        return Err(Error::Decode("truncated global id".into()));
    }
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&buf[..16]);
    buf.advance(16);
    Ok(GlobalId::from_bytes(raw))
}
