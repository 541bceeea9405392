//! Wire framing: a 32-bit little-endian header carrying kind and length.

use tern_error::{ErrorKind, Result, TernError};

use super::pipe::Conn;

/// Largest frame payload: the length field is 24 bits.
pub const MAX_PAYLOAD: usize = (1 << 24) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// client→server: one serialized plan fragment.
    Start,
    /// server→client: one chunk of query output.
    Data,
    /// server→client: UTF-8 error text.
    Err,
    /// server→client: binary-encoded execution stats; ends the query.
    Fin,
}

impl FrameKind {
    fn code(self) -> u8 {
        match self {
            FrameKind::Start => 0,
            FrameKind::Data => 1,
            FrameKind::Err => 2,
            FrameKind::Fin => 3,
        }
    }

    fn from_code(code: u8) -> Result<FrameKind> {
        Ok(match code {
            0 => FrameKind::Start,
            1 => FrameKind::Data,
            2 => FrameKind::Err,
            3 => FrameKind::Fin,
            other => {
                return Err(TernError::with_kind(
                    ErrorKind::Protocol,
                    format!("unknown frame kind {other}"),
                ))
            }
        })
    }
}

/// Write one frame as a single send: header then payload.
pub fn write_frame(conn: &dyn Conn, kind: FrameKind, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(TernError::with_kind(
            ErrorKind::Protocol,
            format!("frame payload of {} bytes exceeds maximum", payload.len()),
        ));
    }
    let header = (u32::from(kind.code()) << 24) | payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&header.to_le_bytes());
    buf.extend_from_slice(payload);
    conn.send(&buf)?;
    Ok(())
}

/// Read one frame. EOF at a frame boundary surfaces as an EOF-kind error.
pub fn read_frame(conn: &dyn Conn) -> Result<(FrameKind, Vec<u8>)> {
    let mut header = [0u8; 4];
    read_full(conn, &mut header)?;
    let word = u32::from_le_bytes(header);
    let kind = FrameKind::from_code((word >> 24) as u8)?;
    let len = (word & 0x00FF_FFFF) as usize;
    let mut payload = vec![0u8; len];
    read_full(conn, &mut payload)?;
    Ok((kind, payload))
}

fn read_full(conn: &dyn Conn, buf: &mut [u8]) -> Result<()> {
    let mut read = 0;
    while read < buf.len() {
        let n = conn.recv(&mut buf[read..])?;
        if n == 0 {
            return Err(TernError::eof());
        }
        read += n;
    }
    Ok(())
}
