//! Length-prefixed frame codec.
//!
//! # Wire format
//!
//! ```text
//! [4 bytes BE: service_name_len]
//! [service_name_len bytes: service name UTF-8]
//! [1 byte: kind]
//! [4 bytes BE: payload_len]
//! [payload_len bytes: payload]
//! ```
//!
//! A `Connection` frame has an empty service name and a 4-byte BE client id
//! as its payload. Declared lengths are checked against
//! [`MAX_SERVICE_NAME_LEN`] and [`MAX_FRAME_PAYLOAD`] as soon as they are
//! readable, so a corrupt header is rejected before any allocation.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ProtocolError;
use crate::constants::{MAX_FRAME_PAYLOAD, MAX_SERVICE_NAME_LEN, READ_BUFFER_SIZE};

/// Message kind carried in every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Handshake carrying the client id assigned by the listener.
    Connection,
    /// Orderly shutdown of the connection.
    Close,
    /// UTF-8 text.
    String,
    /// Opaque bytes.
    Binary,
    /// UTF-8 JSON document.
    Json,
}

impl FrameKind {
    /// Wire representation of this kind.
    pub fn as_u8(self) -> u8 {
        match self {
            FrameKind::Connection => 0,
            FrameKind::Close => 1,
            FrameKind::String => 2,
            FrameKind::Binary => 3,
            FrameKind::Json => 4,
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::Connection),
            1 => Ok(FrameKind::Close),
            2 => Ok(FrameKind::String),
            3 => Ok(FrameKind::Binary),
            4 => Ok(FrameKind::Json),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// One unit of wire transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub service: String,
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(service: impl Into<String>, kind: FrameKind, payload: Vec<u8>) -> Self {
        Self {
            service: service.into(),
            kind,
            payload,
        }
    }

    /// Builds the handshake frame announcing `client_id`.
    pub fn connection(client_id: u32) -> Self {
        Self::new(
            String::new(),
            FrameKind::Connection,
            client_id.to_be_bytes().to_vec(),
        )
    }

    /// Builds a close frame.
    pub fn close() -> Self {
        Self::new(String::new(), FrameKind::Close, Vec::new())
    }

    pub fn string(service: impl Into<String>, text: &str) -> Self {
        Self::new(service, FrameKind::String, text.as_bytes().to_vec())
    }

    pub fn binary(service: impl Into<String>, data: Vec<u8>) -> Self {
        Self::new(service, FrameKind::Binary, data)
    }

    /// Serializes `value` as the payload of a JSON frame.
    pub fn json<T: Serialize>(service: impl Into<String>, value: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(service, FrameKind::Json, serde_json::to_vec(value)?))
    }

    /// Extracts the client id from a `Connection` frame.
    pub fn connection_id(&self) -> Result<u32, ProtocolError> {
        if self.kind != FrameKind::Connection {
            return Err(ProtocolError::Malformed(format!(
                "expected connection frame, got {:?}",
                self.kind
            )));
        }
        be_u32(&self.payload, 0)
            .filter(|_| self.payload.len() == 4)
            .ok_or_else(|| {
                ProtocolError::Malformed(format!(
                    "connection frame payload must be 4 bytes, got {}",
                    self.payload.len()
                ))
            })
    }

    /// Borrows the payload as UTF-8 text.
    pub fn text(&self) -> Result<&str, ProtocolError> {
        std::str::from_utf8(&self.payload).map_err(|_| ProtocolError::InvalidUtf8("payload"))
    }

    /// Deserializes the payload as JSON.
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Size of this frame on the wire.
    pub fn encoded_len(&self) -> usize {
        4 + self.service.len() + 1 + 4 + self.payload.len()
    }
}

fn be_u32(bytes: &[u8], at: usize) -> Option<u32> {
    let b = bytes.get(at..at + 4)?;
    Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

/// Encodes a frame into a fresh buffer.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, ProtocolError> {
    let name = frame.service.as_bytes();
    if name.len() > MAX_SERVICE_NAME_LEN {
        return Err(ProtocolError::ServiceNameTooLong {
            len: name.len(),
            max: MAX_SERVICE_NAME_LEN,
        });
    }
    if frame.payload.len() > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge {
            len: frame.payload.len(),
            max: MAX_FRAME_PAYLOAD,
        });
    }

    let mut buf = Vec::with_capacity(frame.encoded_len());
    buf.extend_from_slice(&(name.len() as u32).to_be_bytes());
    buf.extend_from_slice(name);
    buf.push(frame.kind.as_u8());
    buf.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    Ok(buf)
}

/// Decodes one frame from the front of `buf`.
///
/// Returns the frame and the number of bytes it occupied, or `None` when
/// `buf` holds less than one complete frame. Callers keep the unconsumed
/// bytes and retry once more data arrives.
pub fn decode_frame(buf: &[u8]) -> Result<Option<(Frame, usize)>, ProtocolError> {
    let Some(name_len) = be_u32(buf, 0) else {
        return Ok(None);
    };
    let name_len = name_len as usize;
    if name_len > MAX_SERVICE_NAME_LEN {
        return Err(ProtocolError::ServiceNameTooLong {
            len: name_len,
            max: MAX_SERVICE_NAME_LEN,
        });
    }

    let kind_at = 4 + name_len;
    let Some(&kind_byte) = buf.get(kind_at) else {
        return Ok(None);
    };
    let kind = FrameKind::try_from(kind_byte)?;

    let Some(payload_len) = be_u32(buf, kind_at + 1) else {
        return Ok(None);
    };
    let payload_len = payload_len as usize;
    if payload_len > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge {
            len: payload_len,
            max: MAX_FRAME_PAYLOAD,
        });
    }

    let payload_at = kind_at + 5;
    let total = payload_at + payload_len;
    if buf.len() < total {
        return Ok(None);
    }

    let service = std::str::from_utf8(&buf[4..kind_at])
        .map_err(|_| ProtocolError::InvalidUtf8("service name"))?
        .to_owned();

    Ok(Some((
        Frame {
            service,
            kind,
            payload: buf[payload_at..total].to_vec(),
        },
        total,
    )))
}

/// Accumulates stream bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        match decode_frame(&self.buf)? {
            Some((frame, used)) => {
                self.buf.drain(..used);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Bytes held that do not yet form a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Reads frames from an async byte stream.
///
/// [`read_frame`](Self::read_frame) is cancel-safe: partial data stays in
/// the internal decoder across calls.
pub struct FrameReader<R> {
    inner: R,
    decoder: FrameDecoder,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            chunk: vec![0u8; READ_BUFFER_SIZE],
        }
    }

    /// Reads the next frame.
    ///
    /// Returns `None` when the peer closed the stream on a frame boundary.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(Some(frame));
            }

            let n = self.inner.read(&mut self.chunk).await?;
            if n == 0 {
                if self.decoder.buffered() == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::UnexpectedEof);
            }
            self.decoder.extend(&self.chunk[..n]);
        }
    }
}

/// Encodes and writes one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), ProtocolError> {
    let bytes = encode_frame(frame)?;
    writer.write_all(&bytes).await?;
    Ok(())
}
