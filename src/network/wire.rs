//! Frame codec for stream media (DirectWiFi, Bluetooth)
//!
//! Each side opens with [`WIRE_MAGIC`]. After that every message is
//! `[kind: u8][len: u32 big-endian][body]`.

use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Magic bytes each side sends first
pub const WIRE_MAGIC: &[u8; 8] = b"ZIMWIRE1";

/// Largest body a frame may carry (1 MiB)
pub const MAX_FRAME_BODY: usize = 1024 * 1024;

/// Largest payload slice sent in one Data frame (64 KiB)
pub const MAX_DATA_FRAME: usize = 64 * 1024;

/// Frame header length
pub const FRAME_HEADER_LEN: usize = 5;

/// Frame kinds
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Manifest payload follows; body is [`ManifestHeader`] JSON
    ManifestHeader = 1,
    /// Item payload follows; body is `TransferMetadata` JSON
    ItemHeader = 2,
    /// Payload bytes
    Data = 3,
    /// Payload complete
    End = 4,
    /// Receiver has spooled the payload
    Ack = 5,
    /// Discard the current payload; body is a UTF-8 reason
    Abort = 6,
    Ping = 7,
    Pong = 8,
    /// Peer is shutting down
    Close = 9,
}

impl FrameKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ManifestHeader),
            2 => Some(Self::ItemHeader),
            3 => Some(Self::Data),
            4 => Some(Self::End),
            5 => Some(Self::Ack),
            6 => Some(Self::Abort),
            7 => Some(Self::Ping),
            8 => Some(Self::Pong),
            9 => Some(Self::Close),
            _ => None,
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub body: Vec<u8>,
}

impl Frame {
    pub fn empty(kind: FrameKind) -> Self {
        Self {
            kind,
            body: Vec::new(),
        }
    }

    /// Body as text, for Abort reasons
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Transforms the sender applied to the manifest payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ManifestHeader {
    pub compressed: bool,
    pub encrypted: bool,
}

/// Encode a frame into a single buffer
pub fn encode_frame(kind: FrameKind, body: &[u8]) -> Result<Vec<u8>> {
    if body.len() > MAX_FRAME_BODY {
        return Err(TransportError::protocol(format!(
            "{:?} frame body of {} bytes exceeds {} byte limit",
            kind,
            body.len(),
            MAX_FRAME_BODY
        )));
    }
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.push(kind as u8);
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Write one frame and flush
pub fn write_frame<W: Write + ?Sized>(writer: &mut W, kind: FrameKind, body: &[u8]) -> Result<()> {
    let buf = encode_frame(kind, body)?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame.
///
/// A clean EOF before the first header byte is reported as a connection
/// error; EOF inside a frame, an unknown kind, or an oversized body is a
/// protocol error.
pub fn read_frame<R: Read + ?Sized>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => {
                return Err(TransportError::connection("peer", "connection closed by peer"));
            }
            Ok(0) => return Err(TransportError::protocol("truncated frame header")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let kind = FrameKind::from_u8(header[0])
        .ok_or_else(|| TransportError::protocol(format!("unknown frame kind {}", header[0])))?;
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_BODY {
        return Err(TransportError::protocol(format!(
            "frame body of {} bytes exceeds {} byte limit",
            len, MAX_FRAME_BODY
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            TransportError::protocol(format!("truncated {:?} frame", kind))
        } else {
            e.into()
        }
    })?;

    Ok(Frame { kind, body })
}

/// Send the opening magic
pub fn write_magic<W: Write + ?Sized>(writer: &mut W) -> Result<()> {
    writer.write_all(WIRE_MAGIC)?;
    writer.flush()?;
    Ok(())
}

/// Read and verify the peer's opening magic
pub fn read_magic<R: Read + ?Sized>(reader: &mut R) -> Result<()> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic).map_err(|e| {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            TransportError::protocol("peer closed before sending protocol magic")
        } else {
            e.into()
        }
    })?;
    if &magic != WIRE_MAGIC {
        return Err(TransportError::protocol(format!(
            "invalid protocol magic {:02x?}",
            magic
        )));
    }
    Ok(())
}
