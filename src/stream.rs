//! The stream handler: byte stream in, typed frames out, and back.
//!
//! The handler owns frame demultiplexing, outbound sequence allocation, and
//! the unbounded outbound wire queue. Pings are answered here, invisibly to
//! the session: decoding a ping queues the matching pong before the event
//! is even surfaced.

use bytes::{Bytes, BytesMut};
use log::trace;

use crate::{
    config::Role,
    frame::{self, Frame, FrameError},
};

/// Byte⇄frame codec bound to one session.
///
/// Sequence numbers are unique per direction: client handlers allocate odd
/// values, server handlers even ones, so one inflight table can hold both
/// directions without key collisions.
pub(crate) struct StreamHandler {
    next_seq: u32,
    decode_buf: BytesMut,
    out: BytesMut,
}

impl StreamHandler {
    pub fn new(role: Role) -> Self {
        Self {
            next_seq: match role {
                Role::Client => 1,
                Role::Server => 2,
            },
            decode_buf: BytesMut::new(),
            out: BytesMut::new(),
        }
    }

    fn alloc_seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(2);
        seq
    }

    /// Feed received bytes; returns every frame they complete.
    ///
    /// Inbound pings are acknowledged transparently: the pong is queued on
    /// the outbound buffer and the ping is still surfaced as an event.
    pub fn on_bytes(&mut self, data: &[u8]) -> Result<Vec<Frame>, FrameError> {
        self.decode_buf.extend_from_slice(data);
        let mut events = Vec::new();
        while let Some(event) = frame::decode(&mut self.decode_buf)? {
            trace!("received {} frame", event.kind());
            if let Frame::Ping { seq } = event {
                self.enqueue(&Frame::Pong { seq })?;
            }
            events.push(event);
        }
        Ok(events)
    }

    /// Queue a request frame; returns its freshly allocated sequence.
    pub fn send_request(&mut self, payload: Bytes) -> Result<u32, FrameError> {
        let seq = self.alloc_seq();
        self.enqueue(&Frame::Request { seq, payload })?;
        Ok(seq)
    }

    /// Queue a push frame.
    pub fn send_push(&mut self, payload: Bytes) -> Result<(), FrameError> {
        self.enqueue(&Frame::Push { payload })
    }

    /// Queue a response to the inbound request `seq`.
    pub fn send_response(&mut self, seq: u32, payload: Bytes) -> Result<(), FrameError> {
        self.enqueue(&Frame::Response { seq, payload })
    }

    /// Queue a ping; returns the sequence its pong will carry.
    pub fn send_ping(&mut self) -> Result<u32, FrameError> {
        let seq = self.alloc_seq();
        self.enqueue(&Frame::Ping { seq })?;
        Ok(seq)
    }

    /// Queue the opening `Hello`.
    pub fn send_hello(
        &mut self,
        ping_interval_ms: u32,
        encodings: Vec<String>,
    ) -> Result<(), FrameError> {
        self.enqueue(&Frame::Hello {
            ping_interval_ms,
            encodings,
        })
    }

    /// Queue the server's encoding selection.
    pub fn send_select_encoding(&mut self, name: &str) -> Result<(), FrameError> {
        self.enqueue(&Frame::SelectEncoding {
            name: name.to_owned(),
        })
    }

    /// Queue a goaway carrying a close-reason code.
    pub fn send_goaway(&mut self, reason: u32) -> Result<(), FrameError> {
        self.enqueue(&Frame::GoAway { reason })
    }

    /// Bytes of wire output currently queued.
    pub fn write_buffer_len(&self) -> usize { self.out.len() }

    /// Drain up to `n` bytes of wire output.
    pub fn write_buffer_take(&mut self, n: usize) -> BytesMut {
        let n = n.min(self.out.len());
        self.out.split_to(n)
    }

    fn enqueue(&mut self, frame: &Frame) -> Result<(), FrameError> {
        trace!("queueing {} frame", frame.kind());
        frame::encode(frame, &mut self.out)
    }
}
