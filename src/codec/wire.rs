//! Bounds-checked wire primitives.
//!
//! All multi-byte integers are big-endian. Strings carry a 16-bit length
//! prefix, blobs a 32-bit one. Positions travel as three fixed-point i32
//! values scaled by [`POS_SCALE`](crate::config::POS_SCALE), avoiding
//! floating-point drift across the wire.
//!
//! Every reader checks remaining length before touching the buffer and
//! reports truncation as `MalformedPacket`; readers never panic on hostile
//! input.

use crate::config::POS_SCALE;
use crate::error::{ProtocolError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

fn need(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(ProtocolError::MalformedPacket(format!(
            "truncated {what}: need {n} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}

pub fn get_u8(buf: &mut Bytes) -> Result<u8> {
    need(buf, 1, "u8")?;
    Ok(buf.get_u8())
}

pub fn get_u16(buf: &mut Bytes) -> Result<u16> {
    need(buf, 2, "u16")?;
    Ok(buf.get_u16())
}

pub fn get_u32(buf: &mut Bytes) -> Result<u32> {
    need(buf, 4, "u32")?;
    Ok(buf.get_u32())
}

pub fn get_u64(buf: &mut Bytes) -> Result<u64> {
    need(buf, 8, "u64")?;
    Ok(buf.get_u64())
}

pub fn get_i16(buf: &mut Bytes) -> Result<i16> {
    need(buf, 2, "i16")?;
    Ok(buf.get_i16())
}

pub fn get_i32(buf: &mut Bytes) -> Result<i32> {
    need(buf, 4, "i32")?;
    Ok(buf.get_i32())
}

/// 16-bit length-prefixed UTF-8 string
pub fn get_string(buf: &mut Bytes) -> Result<String> {
    let len = get_u16(buf)? as usize;
    need(buf, len, "string body")?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| ProtocolError::MalformedPacket("string is not valid UTF-8".into()))
}

/// 32-bit length-prefixed raw bytes
pub fn get_blob(buf: &mut Bytes) -> Result<Vec<u8>> {
    let len = get_u32(buf)? as usize;
    need(buf, len, "blob body")?;
    Ok(buf.split_to(len).to_vec())
}

/// Fixed-point world position
pub fn get_pos(buf: &mut Bytes) -> Result<[f32; 3]> {
    let x = get_i32(buf)?;
    let y = get_i32(buf)?;
    let z = get_i32(buf)?;
    Ok([
        x as f32 / POS_SCALE,
        y as f32 / POS_SCALE,
        z as f32 / POS_SCALE,
    ])
}

pub fn put_string(buf: &mut BytesMut, s: &str, field: &'static str) -> Result<()> {
    if s.len() > u16::MAX as usize {
        return Err(ProtocolError::FieldOutOfRange { field });
    }
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
    Ok(())
}

pub fn put_blob(buf: &mut BytesMut, b: &[u8], field: &'static str) -> Result<()> {
    if b.len() > u32::MAX as usize {
        return Err(ProtocolError::FieldOutOfRange { field });
    }
    buf.put_u32(b.len() as u32);
    buf.put_slice(b);
    Ok(())
}

pub fn put_pos(buf: &mut BytesMut, pos: [f32; 3], field: &'static str) -> Result<()> {
    for c in pos {
        let scaled = (c * POS_SCALE).round();
        if !scaled.is_finite() || scaled < i32::MIN as f32 || scaled > i32::MAX as f32 {
            return Err(ProtocolError::FieldOutOfRange { field });
        }
        buf.put_i32(scaled as i32);
    }
    Ok(())
}
