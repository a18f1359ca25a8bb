//! Control-port wire primitives.
//!
//! Every request starts with a single type byte. Integers are 4-byte
//! big-endian; strings are a u16 big-endian byte length followed by UTF-8.

use std::io::{self, Read, Write};

/// Stop the server.
pub const SHUTDOWN_TYPE: u8 = b'0';
/// Ask a peer for a session it holds.
pub const SESSION_CHECK_TYPE: u8 = b'1';
/// Download a peer's node list.
pub const NODE_LIST_TYPE: u8 = b'2';
/// Announce this node is alive.
pub const NODE_HEARTBEAT_TYPE: u8 = b'3';
/// Reload one web application.
pub const RELOAD_TYPE: u8 = b'4';

/// Session-check status: the session follows.
pub const FOUND: &str = "found";
/// Session-check status: no such session.
pub const NOT_FOUND: &str = "not-found";
/// Acknowledgement of a received session.
pub const ACK: &str = "ok";

/// Largest encoded session accepted from a peer.
pub const MAX_SESSION_BYTES: u32 = 16 * 1024 * 1024;

pub fn read_u8(r: &mut impl Read) -> io::Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn write_i32(w: &mut impl Write, n: i32) -> io::Result<()> {
    w.write_all(&n.to_be_bytes())
}

pub fn read_i32(r: &mut impl Read) -> io::Result<i32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(i32::from_be_bytes(buf))
}

pub fn write_utf(w: &mut impl Write, s: &str) -> io::Result<()> {
    let len = u16::try_from(s.len()).map_err(|_| {
        io::Error::new(io::ErrorKind::InvalidInput, "string longer than 65535 bytes")
    })?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(s.as_bytes())
}

pub fn read_utf(r: &mut impl Read) -> io::Result<String> {
    let mut len = [0u8; 2];
    r.read_exact(&mut len)?;
    let mut buf = vec![0u8; usize::from(u16::from_be_bytes(len))];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Writes a length-prefixed byte frame.
pub fn write_frame(w: &mut impl Write, bytes: &[u8]) -> io::Result<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "frame too large"))?;
    w.write_all(&len.to_be_bytes())?;
    w.write_all(bytes)
}

/// Reads a length-prefixed byte frame of at most `max` bytes.
pub fn read_frame(r: &mut impl Read, max: u32) -> io::Result<Vec<u8>> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len);
    if len > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit of {max}"),
        ));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(buf)
}
