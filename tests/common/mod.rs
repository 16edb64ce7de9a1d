//! Shared helpers for fourwire integration tests.
//!
//! Scenarios run over an in-memory duplex pipe. The "raw peer" helpers let
//! a test play the other side of the wire by hand, which is how misbehaving
//! peers (silent, out-of-order, protocol-violating) are staged.
#![allow(dead_code)]

use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use bytes::BytesMut;
use fourwire::{
    InboundRequest, RawEncoder, Role, Session, SessionBuilder, SessionHooks,
    frame::{self, Frame},
};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf, duplex,
};

/// The identity encoder name used across scenarios.
pub const TEST_ENCODING: &str = "identity";

/// Generous upper bound on any await in a scenario.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A client builder with the identity encoder registered.
pub fn client_builder() -> SessionBuilder {
    Session::builder(Role::Client).encoder(TEST_ENCODING, RawEncoder)
}

/// A server builder with the identity encoder registered.
pub fn server_builder() -> SessionBuilder {
    Session::builder(Role::Server).encoder(TEST_ENCODING, RawEncoder)
}

/// Spawn a connected client/server pair over an in-memory pipe.
pub fn pair(client: SessionBuilder, server: SessionBuilder) -> (Session, Session) {
    let (near, far) = duplex(64 * 1024);
    (client.spawn(near), server.spawn(far))
}

/// Read the next frame from the raw side of a pipe.
///
/// Panics if the stream ends first; a test expecting EOF should read the
/// stream directly.
pub async fn read_frame(stream: &mut DuplexStream, buf: &mut BytesMut) -> Frame {
    loop {
        if let Some(frame) = frame::decode(buf).expect("decode frame") {
            return frame;
        }
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.expect("read from pipe");
        assert!(n > 0, "stream closed while awaiting a frame");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Write one frame to the raw side of a pipe.
pub async fn write_frame(stream: &mut DuplexStream, frame: &Frame) {
    let mut out = BytesMut::new();
    frame::encode(frame, &mut out).expect("encode frame");
    stream.write_all(&out).await.expect("write to pipe");
}

/// Play the server half of the handshake by hand: consume the client's
/// `Hello` and select `name`.
pub async fn handshake_as_server(stream: &mut DuplexStream, buf: &mut BytesMut, name: &str) {
    let hello = read_frame(stream, buf).await;
    assert!(
        matches!(hello, Frame::Hello { .. }),
        "expected hello, got {hello:?}"
    );
    write_frame(
        stream,
        &Frame::SelectEncoding {
            name: name.to_owned(),
        },
    )
    .await;
}

/// Server hooks answering every request with its own payload.
pub struct EchoHooks;

#[async_trait]
impl SessionHooks for EchoHooks {
    async fn on_request(&self, request: InboundRequest) -> Option<Vec<u8>> {
        Some(request.payload.to_vec())
    }
}

/// Stream wrapper whose writes accept at most `limit` bytes per call.
pub struct ThrottledWriter<S> {
    inner: S,
    limit: usize,
}

impl<S> ThrottledWriter<S> {
    pub fn new(inner: S, limit: usize) -> Self {
        assert!(limit > 0, "a zero-byte write limit would stall forever");
        Self { inner, limit }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ThrottledWriter<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ThrottledWriter<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = buf.len().min(self.limit);
        Pin::new(&mut self.inner).poll_write(cx, &buf[..n])
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
