//! Binary session encoding, shared by temp-dir persistence and cluster
//! transfer.
//!
//! ```text
//! u8   format version (1)
//! utf  session id
//! i64  creation time (ms)
//! i64  last accessed time (ms)
//! i32  max inactive interval (s)
//! u8   is new
//! u8   distributable
//! u32  attribute count
//! per attribute:
//!   utf  name
//!   u32  value length, then the value as postcard
//! ```
//!
//! `utf` is a u16 big-endian byte length followed by UTF-8. All integers
//! are big-endian.
//!
//! Data arrives from disk and from peers, so decoding checks it before
//! trusting it: session ids must use the id alphabet, and attribute values
//! may nest lists at most [`MAX_VALUE_DEPTH`] deep.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, SessionError};
use crate::value::StoredValue;

/// Current encoding version.
pub const FORMAT_VERSION: u8 = 1;

/// Deepest list nesting accepted in an attribute value.
pub const MAX_VALUE_DEPTH: usize = 64;

const MAX_SESSION_ID_LEN: usize = 128;

/// True if `id` could have been issued by a session store: 1 to 128 ASCII
/// letters, digits, `-` or `_`. Such an id is always a safe file name.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// A session detached from any store, in its transferable form.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionData {
    pub id: String,
    pub created: i64,
    pub last_accessed: i64,
    pub max_inactive_secs: i32,
    pub is_new: bool,
    pub distributable: bool,
    pub(crate) attributes: Vec<(String, StoredValue)>,
}

impl SessionData {
    /// Number of attributes carried.
    pub fn attribute_count(&self) -> usize {
        self.attributes.len()
    }

    /// Names of the attributes carried, in encoding order.
    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attributes.iter().map(|(name, _)| name.as_str())
    }

    /// True if the session had expired by `now_millis`.
    pub fn is_expired_at(&self, now_millis: i64) -> bool {
        crate::session::is_expired(self.last_accessed, self.max_inactive_secs, now_millis)
    }

    /// Encodes the session.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(FORMAT_VERSION);
        put_utf(&mut buf, &self.id)?;
        buf.put_i64(self.created);
        buf.put_i64(self.last_accessed);
        buf.put_i32(self.max_inactive_secs);
        buf.put_u8(u8::from(self.is_new));
        buf.put_u8(u8::from(self.distributable));

        let count = u32::try_from(self.attributes.len())
            .map_err(|_| SessionError::Decode("too many attributes".into()))?;
        buf.put_u32(count);
        for (name, value) in &self.attributes {
            put_utf(&mut buf, name)?;
            let encoded = postcard::to_allocvec(value)
                .map_err(|e| SessionError::Decode(format!("attribute {name}: {e}")))?;
            let len = u32::try_from(encoded.len())
                .map_err(|_| SessionError::Decode(format!("attribute {name} too large")))?;
            buf.put_u32(len);
            buf.put_slice(&encoded);
        }
        Ok(buf.freeze())
    }

    /// Decodes a session written by [`encode`](Self::encode).
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let version = get_u8(&mut buf)?;
        if version != FORMAT_VERSION {
            return Err(SessionError::UnsupportedVersion(version));
        }

        let id = get_utf(&mut buf)?;
        if !is_valid_session_id(&id) {
            return Err(SessionError::Decode(format!("invalid session id {id:?}")));
        }
        need(&buf, 8 + 8 + 4 + 1 + 1 + 4)?;
        let created = buf.get_i64();
        let last_accessed = buf.get_i64();
        let max_inactive_secs = buf.get_i32();
        let is_new = buf.get_u8() != 0;
        let distributable = buf.get_u8() != 0;
        let count = buf.get_u32() as usize;

        // Each attribute takes at least six bytes; reject absurd counts
        // before allocating.
        if count > buf.remaining() / 6 {
            return Err(SessionError::Decode(format!("attribute count {count} exceeds data")));
        }
        let mut attributes = Vec::with_capacity(count);
        for _ in 0..count {
            let name = get_utf(&mut buf)?;
            need(&buf, 4)?;
            let len = buf.get_u32() as usize;
            need(&buf, len)?;
            check_value_depth(&buf[..len])
                .map_err(|e| SessionError::Decode(format!("attribute {name}: {e}")))?;
            let value = postcard::from_bytes(&buf[..len])
                .map_err(|e| SessionError::Decode(format!("attribute {name}: {e}")))?;
            buf.advance(len);
            attributes.push((name, value));
        }

        if buf.has_remaining() {
            return Err(SessionError::Decode(format!(
                "{} trailing bytes",
                buf.remaining()
            )));
        }

        Ok(Self {
            id,
            created,
            last_accessed,
            max_inactive_secs,
            is_new,
            distributable,
            attributes,
        })
    }
}

/// Walks one postcard-encoded [`StoredValue`] without recursion and rejects
/// lists nested deeper than [`MAX_VALUE_DEPTH`]. postcard itself decodes
/// recursively, so this must run first.
///
/// Postcard layout: a varint variant index, then `Str`/`Bytes` as a varint
/// length and bytes, `Int` as a zigzag varint, `Float` as 8 bytes, `Bool`
/// as 1 byte, `List` as a varint count followed by the items.
fn check_value_depth(mut buf: &[u8]) -> std::result::Result<(), String> {
    // Items left to read at each open level; the bottom entry is the value.
    let mut pending: Vec<u64> = vec![1];
    while let Some(left) = pending.last_mut() {
        if *left == 0 {
            pending.pop();
            continue;
        }
        *left -= 1;
        match get_varint(&mut buf)? {
            // Str, Bytes
            0 | 4 => {
                let len = get_varint(&mut buf)?;
                skip(&mut buf, len)?;
            }
            // Int
            1 => {
                get_varint(&mut buf)?;
            }
            // Float
            2 => skip(&mut buf, 8)?,
            // Bool
            3 => skip(&mut buf, 1)?,
            // List
            5 => {
                if pending.len() > MAX_VALUE_DEPTH {
                    return Err(format!("lists nested deeper than {MAX_VALUE_DEPTH}"));
                }
                pending.push(get_varint(&mut buf)?);
            }
            tag => return Err(format!("unknown value tag {tag}")),
        }
    }
    Ok(())
}

fn get_varint(buf: &mut &[u8]) -> std::result::Result<u64, String> {
    let mut value = 0_u64;
    for shift in (0..70).step_by(7) {
        let Some((&byte, rest)) = buf.split_first() else {
            return Err("truncated varint".into());
        };
        *buf = rest;
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err("varint too long".into())
}

fn skip(buf: &mut &[u8], len: u64) -> std::result::Result<(), String> {
    let len = usize::try_from(len).map_err(|_| "length overflow".to_owned())?;
    if buf.len() < len {
        return Err(format!("truncated: need {len} bytes, have {}", buf.len()));
    }
    *buf = &buf[len..];
    Ok(())
}

fn put_utf(buf: &mut BytesMut, s: &str) -> Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| SessionError::Decode(format!("string of {} bytes too long", s.len())))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_utf(buf: &mut &[u8]) -> Result<String> {
    need(buf, 2)?;
    let len = buf.get_u16() as usize;
    need(buf, len)?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|e| SessionError::Decode(e.to_string()))?
        .to_owned();
    buf.advance(len);
    Ok(s)
}

fn get_u8(buf: &mut &[u8]) -> Result<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn need(buf: &[u8], n: usize) -> Result<()> {
    if buf.len() < n {
        return Err(SessionError::Decode(format!(
            "truncated: need {n} bytes, have {}",
            buf.len()
        )));
    }
    Ok(())
}
