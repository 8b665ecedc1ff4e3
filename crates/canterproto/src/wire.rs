//! Byte-level primitives shared by the command codecs.
//!
//! Everything is little-endian. Strings are null-terminated byte sequences;
//! the codepage conversion happens above this layer, so here they are plain
//! UTF-8 (lossy on decode).

use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;

use crate::ProtoError;

fn need(buf: &Bytes, n: usize) -> Result<(), ProtoError> {
    if buf.remaining() < n {
        return Err(ProtoError::TooShort {
            need: n,
            got: buf.remaining(),
        });
    }
    Ok(())
}

pub fn get_u8(buf: &mut Bytes) -> Result<u8, ProtoError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_bool(buf: &mut Bytes) -> Result<bool, ProtoError> {
    Ok(get_u8(buf)? != 0)
}

pub fn get_u16(buf: &mut Bytes) -> Result<u16, ProtoError> {
    need(buf, 2)?;
    Ok(buf.get_u16_le())
}

pub fn get_u32(buf: &mut Bytes) -> Result<u32, ProtoError> {
    need(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn get_u64(buf: &mut Bytes) -> Result<u64, ProtoError> {
    need(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub fn get_f32(buf: &mut Bytes) -> Result<f32, ProtoError> {
    need(buf, 4)?;
    Ok(buf.get_f32_le())
}

pub fn get_vec3(buf: &mut Bytes) -> Result<[f32; 3], ProtoError> {
    Ok([get_f32(buf)?, get_f32(buf)?, get_f32(buf)?])
}

/// Reads a null-terminated string.
pub fn get_string(buf: &mut Bytes) -> Result<String, ProtoError> {
    let Some(nul) = buf.iter().position(|b| *b == 0) else {
        return Err(ProtoError::Malformed("unterminated string"));
    };
    let raw = buf.split_to(nul);
    buf.advance(1);
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Reads `n` raw trailing bytes.
pub fn get_bytes(buf: &mut Bytes, n: usize) -> Result<Bytes, ProtoError> {
    need(buf, n)?;
    Ok(buf.split_to(n))
}

pub fn put_u8(out: &mut BytesMut, v: u8) {
    out.put_u8(v);
}

pub fn put_bool(out: &mut BytesMut, v: bool) {
    out.put_u8(u8::from(v));
}

pub fn put_u16(out: &mut BytesMut, v: u16) {
    out.put_u16_le(v);
}

pub fn put_u32(out: &mut BytesMut, v: u32) {
    out.put_u32_le(v);
}

pub fn put_u64(out: &mut BytesMut, v: u64) {
    out.put_u64_le(v);
}

pub fn put_i32(out: &mut BytesMut, v: i32) {
    out.put_i32_le(v);
}

pub fn put_f32(out: &mut BytesMut, v: f32) {
    out.put_f32_le(v);
}

pub fn put_vec3(out: &mut BytesMut, v: [f32; 3]) {
    for c in v {
        out.put_f32_le(c);
    }
}

pub fn put_vec4(out: &mut BytesMut, v: [f32; 4]) {
    for c in v {
        out.put_f32_le(c);
    }
}

/// Writes a null-terminated string. Interior NULs are dropped rather than
/// truncating the tail of the frame.
pub fn put_string(out: &mut BytesMut, s: &str) {
    for b in s.bytes() {
        if b != 0 {
            out.put_u8(b);
        }
    }
    out.put_u8(0);
}

/// Writes a `u8`-counted list, capping at 255 entries.
pub fn put_list<T>(out: &mut BytesMut, items: &[T], mut each: impl FnMut(&mut BytesMut, &T)) {
    let count = items.len().min(255);
    out.put_u8(count as u8);
    for item in &items[..count] {
        each(out, item);
    }
}

/// Reads a `u8`-counted list.
pub fn get_list<T>(
    buf: &mut Bytes,
    mut each: impl FnMut(&mut Bytes) -> Result<T, ProtoError>,
) -> Result<Vec<T>, ProtoError> {
    let count = get_u8(buf)? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(each(buf)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_round_trip() {
        let mut out = BytesMut::new();
        put_string(&mut out, "alice");
        put_string(&mut out, "");
        put_u32(&mut out, 7);

        let mut buf = out.freeze();
        assert_eq!(get_string(&mut buf).unwrap(), "alice");
        assert_eq!(get_string(&mut buf).unwrap(), "");
        assert_eq!(get_u32(&mut buf).unwrap(), 7);
        assert!(buf.is_empty());
    }

    #[test]
    fn unterminated_string_is_malformed() {
        let mut buf = Bytes::from_static(b"abc");
        assert!(matches!(
            get_string(&mut buf),
            Err(ProtoError::Malformed(_))
        ));
    }

    #[test]
    fn short_reads_report_need() {
        let mut buf = Bytes::from_static(&[1, 2]);
        match get_u32(&mut buf) {
            Err(ProtoError::TooShort { need, got }) => {
                assert_eq!(need, 4);
                assert_eq!(got, 2);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn interior_nul_dropped() {
        let mut out = BytesMut::new();
        put_string(&mut out, "a\0b");
        let mut buf = out.freeze();
        assert_eq!(get_string(&mut buf).unwrap(), "ab");
    }

    #[test]
    fn counted_list_round_trip() {
        let mut out = BytesMut::new();
        put_list(&mut out, &[10u32, 20, 30], |o, v| put_u32(o, *v));

        let mut buf = out.freeze();
        let back = get_list(&mut buf, get_u32).unwrap();
        assert_eq!(back, vec![10, 20, 30]);
    }
}
