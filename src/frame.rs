//! Protocol frames and their wire codec.
//!
//! Every frame travels as a `u32` big-endian body length, a one-byte kind
//! tag, and a kind-specific body. Decoding is incremental: partial input
//! yields `None` and leaves the buffer untouched until a whole frame has
//! arrived.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

const KIND_REQUEST: u8 = 0x01;
const KIND_RESPONSE: u8 = 0x02;
const KIND_PUSH: u8 = 0x03;
const KIND_PING: u8 = 0x04;
const KIND_PONG: u8 = 0x05;
const KIND_HELLO: u8 = 0x06;
const KIND_GOAWAY: u8 = 0x07;
const KIND_SELECT_ENCODING: u8 = 0x08;

/// A single protocol unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    /// A call expecting a [`Frame::Response`] with the same sequence.
    Request {
        /// Correlates the eventual response.
        seq: u32,
        /// Encoded request payload.
        payload: Bytes,
    },
    /// The reply to a [`Frame::Request`].
    Response {
        /// The sequence of the request being answered.
        seq: u32,
        /// Encoded response payload.
        payload: Bytes,
    },
    /// A one-way message expecting no reply.
    Push {
        /// Encoded push payload.
        payload: Bytes,
    },
    /// Liveness probe; answered transparently with a [`Frame::Pong`].
    Ping {
        /// Correlates the pong.
        seq: u32,
    },
    /// Answer to a [`Frame::Ping`].
    Pong {
        /// The sequence of the ping being answered.
        seq: u32,
    },
    /// Opens the conversation: the client's liveness cadence and its
    /// encoder names in preference order.
    Hello {
        /// Interval between the client's pings, in milliseconds.
        ping_interval_ms: u32,
        /// Encoder names, most preferred first.
        encodings: Vec<String>,
    },
    /// Announces that the sender is going down.
    GoAway {
        /// Wire-stable close-reason code.
        reason: u32,
    },
    /// The server's pick from the client's advertised encodings.
    SelectEncoding {
        /// The chosen encoder name.
        name: String,
    },
}

impl Frame {
    /// Human-readable kind label, used in diagnostics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::Response { .. } => "response",
            Self::Push { .. } => "push",
            Self::Ping { .. } => "ping",
            Self::Pong { .. } => "pong",
            Self::Hello { .. } => "hello",
            Self::GoAway { .. } => "goaway",
            Self::SelectEncoding { .. } => "select-encoding",
        }
    }
}

/// Errors raised while reading or writing frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// A frame body exceeded [`MAX_FRAME_LEN`].
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN}-byte limit")]
    TooLarge(usize),
    /// A frame body ended before its fields did.
    #[error("truncated frame body")]
    Truncated,
    /// The kind tag is not one this version understands.
    #[error("unknown frame kind {0:#04x}")]
    UnknownKind(u8),
    /// An encoding name was not valid UTF-8.
    #[error("encoding name is not valid UTF-8")]
    InvalidName,
    /// A `Hello` held more encodings, or a longer name, than the wire
    /// format can carry.
    #[error("hello advertises more encodings than the wire format can carry")]
    InvalidHello,
}

/// Append `frame` to `dst` in wire format.
///
/// # Errors
///
/// Returns [`FrameError::TooLarge`] for oversized payloads and
/// [`FrameError::InvalidHello`] when a `Hello` cannot be represented.
pub fn encode(frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
    let body_len = body_len(frame)?;
    if body_len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(body_len));
    }
    let len = u32::try_from(body_len).map_err(|_| FrameError::TooLarge(body_len))?;

    dst.reserve(LEN_PREFIX + body_len);
    dst.put_u32(len);
    match frame {
        Frame::Request { seq, payload } => {
            dst.put_u8(KIND_REQUEST);
            dst.put_u32(*seq);
            dst.put_slice(payload);
        }
        Frame::Response { seq, payload } => {
            dst.put_u8(KIND_RESPONSE);
            dst.put_u32(*seq);
            dst.put_slice(payload);
        }
        Frame::Push { payload } => {
            dst.put_u8(KIND_PUSH);
            dst.put_slice(payload);
        }
        Frame::Ping { seq } => {
            dst.put_u8(KIND_PING);
            dst.put_u32(*seq);
        }
        Frame::Pong { seq } => {
            dst.put_u8(KIND_PONG);
            dst.put_u32(*seq);
        }
        Frame::Hello {
            ping_interval_ms,
            encodings,
        } => {
            dst.put_u8(KIND_HELLO);
            dst.put_u32(*ping_interval_ms);
            // body_len() already validated count and name lengths
            dst.put_u8(encodings.len() as u8);
            for name in encodings {
                dst.put_u8(name.len() as u8);
                dst.put_slice(name.as_bytes());
            }
        }
        Frame::GoAway { reason } => {
            dst.put_u8(KIND_GOAWAY);
            dst.put_u32(*reason);
        }
        Frame::SelectEncoding { name } => {
            dst.put_u8(KIND_SELECT_ENCODING);
            dst.put_slice(name.as_bytes());
        }
    }
    Ok(())
}

/// Attempt to decode the next frame from `src`.
///
/// Consumes nothing until a complete frame is buffered.
///
/// # Errors
///
/// Returns a [`FrameError`] when the buffered bytes cannot form a valid
/// frame; the stream is unrecoverable afterwards.
pub fn decode(src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
    if src.len() < LEN_PREFIX {
        return Ok(None);
    }
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    if src.len() < LEN_PREFIX + len {
        return Ok(None);
    }
    src.advance(LEN_PREFIX);
    let mut body = src.split_to(len);
    if body.is_empty() {
        return Err(FrameError::Truncated);
    }
    let kind = body.get_u8();
    match kind {
        KIND_REQUEST => {
            let seq = take_u32(&mut body)?;
            Ok(Some(Frame::Request {
                seq,
                payload: body.freeze(),
            }))
        }
        KIND_RESPONSE => {
            let seq = take_u32(&mut body)?;
            Ok(Some(Frame::Response {
                seq,
                payload: body.freeze(),
            }))
        }
        KIND_PUSH => Ok(Some(Frame::Push {
            payload: body.freeze(),
        })),
        KIND_PING => Ok(Some(Frame::Ping {
            seq: take_u32(&mut body)?,
        })),
        KIND_PONG => Ok(Some(Frame::Pong {
            seq: take_u32(&mut body)?,
        })),
        KIND_HELLO => {
            let ping_interval_ms = take_u32(&mut body)?;
            if body.is_empty() {
                return Err(FrameError::Truncated);
            }
            let count = body.get_u8();
            let mut encodings = Vec::with_capacity(usize::from(count));
            for _ in 0..count {
                encodings.push(take_name(&mut body)?);
            }
            Ok(Some(Frame::Hello {
                ping_interval_ms,
                encodings,
            }))
        }
        KIND_GOAWAY => Ok(Some(Frame::GoAway {
            reason: take_u32(&mut body)?,
        })),
        KIND_SELECT_ENCODING => {
            let name =
                String::from_utf8(body.to_vec()).map_err(|_| FrameError::InvalidName)?;
            Ok(Some(Frame::SelectEncoding { name }))
        }
        other => Err(FrameError::UnknownKind(other)),
    }
}

fn body_len(frame: &Frame) -> Result<usize, FrameError> {
    Ok(match frame {
        Frame::Request { payload, .. } | Frame::Response { payload, .. } => 5 + payload.len(),
        Frame::Push { payload } => 1 + payload.len(),
        Frame::Ping { .. } | Frame::Pong { .. } | Frame::GoAway { .. } => 5,
        Frame::Hello { encodings, .. } => {
            if encodings.len() > usize::from(u8::MAX) {
                return Err(FrameError::InvalidHello);
            }
            let mut len = 6;
            for name in encodings {
                if name.len() > usize::from(u8::MAX) {
                    return Err(FrameError::InvalidHello);
                }
                len += 1 + name.len();
            }
            len
        }
        Frame::SelectEncoding { name } => 1 + name.len(),
    })
}

fn take_u32(body: &mut BytesMut) -> Result<u32, FrameError> {
    if body.len() < 4 {
        return Err(FrameError::Truncated);
    }
    Ok(body.get_u32())
}

fn take_name(body: &mut BytesMut) -> Result<String, FrameError> {
    if body.is_empty() {
        return Err(FrameError::Truncated);
    }
    let len = usize::from(body.get_u8());
    if body.len() < len {
        return Err(FrameError::Truncated);
    }
    String::from_utf8(body.split_to(len).to_vec()).map_err(|_| FrameError::InvalidName)
}
