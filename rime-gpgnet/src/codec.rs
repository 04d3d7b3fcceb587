//! Binary framing for GPGNet messages.
//!
//! All integers are little-endian. A message is laid out as
//!
//! ```text
//! u32 header_len, header bytes (UTF-8),
//! u32 chunk_count,
//! per chunk: u8 tag (0 = i32, 1 = string), then i32 value or u32 len + bytes
//! ```

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::{Chunk, GpgNetMessage};

/// Upper bound on any length field; larger values mean a corrupt stream.
const MAX_FIELD_LEN: u32 = 64 * 1024;

const TAG_INT: u8 = 0;
const TAG_STRING: u8 = 1;

#[derive(Debug, Default)]
pub struct GpgNetCodec;

fn corrupt(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("gpgnet frame: {what}"))
}

/// Cursor-style readers over a byte slice. Returning `None` means the frame
/// is not complete yet.
fn read_u32(buf: &[u8], at: &mut usize) -> Option<u32> {
    let bytes = buf.get(*at..*at + 4)?;
    *at += 4;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u8(buf: &[u8], at: &mut usize) -> Option<u8> {
    let byte = buf.get(*at).copied()?;
    *at += 1;
    Some(byte)
}

fn read_string(buf: &[u8], at: &mut usize) -> io::Result<Option<String>> {
    let Some(len) = read_u32(buf, at) else {
        return Ok(None);
    };
    if len > MAX_FIELD_LEN {
        return Err(corrupt("string length out of range"));
    }
    let Some(bytes) = buf.get(*at..*at + len as usize) else {
        return Ok(None);
    };
    *at += len as usize;
    String::from_utf8(bytes.to_vec())
        .map(Some)
        .map_err(|_| corrupt("string is not valid utf-8"))
}

/// Try to parse one message from the front of `buf`; `Ok(None)` means more
/// bytes are needed. On success, returns the message and consumed byte count.
fn try_parse(buf: &[u8]) -> io::Result<Option<(GpgNetMessage, usize)>> {
    let mut at = 0;
    let Some(header) = read_string(buf, &mut at)? else {
        return Ok(None);
    };
    let Some(count) = read_u32(buf, &mut at) else {
        return Ok(None);
    };
    if count > MAX_FIELD_LEN {
        return Err(corrupt("chunk count out of range"));
    }
    let mut chunks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let Some(tag) = read_u8(buf, &mut at) else {
            return Ok(None);
        };
        match tag {
            TAG_INT => {
                let Some(raw) = read_u32(buf, &mut at) else {
                    return Ok(None);
                };
                chunks.push(Chunk::Int(raw as i32));
            }
            TAG_STRING => {
                let Some(s) = read_string(buf, &mut at)? else {
                    return Ok(None);
                };
                chunks.push(Chunk::Str(s));
            }
            other => return Err(corrupt(&format!("unknown chunk tag {other}"))),
        }
    }
    Ok(Some((GpgNetMessage { header, chunks }, at)))
}

impl Decoder for GpgNetCodec {
    type Item = GpgNetMessage;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<GpgNetMessage>> {
        match try_parse(src)? {
            Some((msg, consumed)) => {
                src.advance(consumed);
                Ok(Some(msg))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<GpgNetMessage> for GpgNetCodec {
    type Error = io::Error;

    fn encode(&mut self, msg: GpgNetMessage, dst: &mut BytesMut) -> io::Result<()> {
        put_string(dst, &msg.header)?;
        dst.put_u32_le(msg.chunks.len() as u32);
        for chunk in &msg.chunks {
            match chunk {
                Chunk::Int(v) => {
                    dst.put_u8(TAG_INT);
                    dst.put_u32_le(*v as u32);
                }
                Chunk::Str(s) => {
                    dst.put_u8(TAG_STRING);
                    put_string(dst, s)?;
                }
            }
        }
        Ok(())
    }
}

fn put_string(dst: &mut BytesMut, s: &str) -> io::Result<()> {
    if s.len() as u32 > MAX_FIELD_LEN {
        return Err(corrupt("string too long to encode"));
    }
    dst.put_u32_le(s.len() as u32);
    dst.put_slice(s.as_bytes());
    Ok(())
}
