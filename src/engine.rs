//! The session I/O engine: the single reader and writer of the stream.
//!
//! One task multiplexes four sources with a biased `select!`: the stop
//! flag, the command inbox, socket readability, and socket writability.
//! Inbound bytes flow through the stream handler into typed dispatch;
//! outbound frames sit in the handler's unbounded queue and are moved into
//! a staging buffer capped at [`OUTBUF_MAX`] before hitting the socket, so
//! a slow peer can never balloon the write path.

use std::{io, sync::Arc};

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, info, trace, warn};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::mpsc,
    time::{Duration, timeout},
};

use crate::{
    config::Role,
    encoding::{CodecError, Encoder, EncoderRegistry},
    error::{CloseReason, SessionError},
    frame::Frame,
    hooks::{InboundRequest, SessionHooks},
    inflight::CallWaiter,
    session::{Command, Shared},
    stream::StreamHandler,
};

/// Cap on the outbound staging buffer between the stream handler's queue
/// and the socket.
pub const OUTBUF_MAX: usize = 65_536;

/// Bound on a single socket read.
const READ_CHUNK: usize = 65_536;

/// How long a handshake-failure goaway may spend flushing.
const FLUSH_GRACE: Duration = Duration::from_secs(1);

/// Outbound staging buffer bounded by a fixed capacity.
///
/// Ordering is preserved: bytes leave in the order the handler queued them.
pub(crate) struct StagingBuffer {
    buf: BytesMut,
    cap: usize,
}

impl StagingBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            cap,
        }
    }

    pub fn is_empty(&self) -> bool { self.buf.is_empty() }

    pub fn len(&self) -> usize { self.buf.len() }

    pub fn as_slice(&self) -> &[u8] { &self.buf }

    /// Discard the written prefix.
    pub fn consume(&mut self, n: usize) { self.buf.advance(n); }

    /// Move queued handler bytes in while space permits.
    pub fn refill(&mut self, handler: &mut StreamHandler) {
        while handler.write_buffer_len() > 0 && self.buf.len() < self.cap {
            let room = self.cap - self.buf.len();
            let chunk = handler.write_buffer_take(room);
            self.buf.extend_from_slice(&chunk);
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Awaiting the handshake; only negotiation frames act.
    Opening,
    /// Encoder agreed; application frames flow.
    Ready,
}

/// The I/O task behind one session.
pub(crate) struct Engine<S> {
    reader: ReadHalf<S>,
    writer: WriteHalf<S>,
    handler: StreamHandler,
    staging: StagingBuffer,
    read_buf: BytesMut,
    registry: EncoderRegistry,
    hooks: Arc<dyn SessionHooks>,
    shared: Arc<Shared>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    cmd_open: bool,
    phase: Phase,
    encoder: Option<Arc<dyn Encoder>>,
    role: Role,
}

impl<S> Engine<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        stream: S,
        registry: EncoderRegistry,
        hooks: Arc<dyn SessionHooks>,
        shared: Arc<Shared>,
        cmd_rx: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let role = shared.role();
        Self {
            reader,
            writer,
            handler: StreamHandler::new(role),
            staging: StagingBuffer::new(OUTBUF_MAX),
            read_buf: BytesMut::with_capacity(READ_CHUNK),
            registry,
            hooks,
            shared,
            cmd_rx,
            cmd_open: true,
            phase: Phase::Opening,
            encoder: None,
            role,
        }
    }

    /// Drive the session until teardown, then clean up.
    pub async fn run(mut self) {
        if self.role == Role::Client {
            self.open_conversation();
        }
        if !self.shared.is_stopped() {
            self.drive().await;
        }

        // Whatever ended the loop, make the close path converge: record a
        // reason, wake gated senders, arm the terminator.
        self.shared.begin_close(CloseReason::Normal);
        let inflight = self.shared.inflight();
        if !inflight.is_empty() {
            debug!("failing exchanges left inflight at teardown");
        }
        inflight.drain_failing(self.shared.drain_error());
        info!(
            "session closed: role={:?} reason={:?}",
            self.role,
            self.shared.close_reason()
        );
        // release the stream before announcing completion
        drop(self.reader);
        drop(self.writer);
        self.shared.set_close_done();
    }

    /// Queue the opening `Hello` with our cadence and encoder preferences.
    fn open_conversation(&mut self) {
        let interval =
            u32::try_from(self.shared.ping_interval().as_millis()).unwrap_or(u32::MAX);
        let names = self.registry.names();
        if let Err(err) = self.handler.send_hello(interval, names) {
            warn!("failed to queue hello: {err}");
            self.shared.begin_close(CloseReason::Normal);
            return;
        }
        self.staging.refill(&mut self.handler);
    }

    async fn drive(&mut self) {
        loop {
            tokio::select! {
                biased;

                () = self.shared.stopped() => return,

                cmd = self.cmd_rx.recv(), if self.cmd_open => match cmd {
                    Some(cmd) => self.process_command(cmd),
                    None => self.cmd_open = false,
                },

                read = read_some(&mut self.reader, &mut self.read_buf) => {
                    if !self.process_read(read).await {
                        return;
                    }
                }

                written = self.writer.write(self.staging.as_slice()),
                    if !self.staging.is_empty() =>
                {
                    if !self.process_write(written) {
                        return;
                    }
                }
            }
        }
    }

    /// Turn a handle command into queued wire bytes.
    fn process_command(&mut self, command: Command) {
        match command {
            Command::Request { payload, reply } => {
                match self.handler.send_request(payload) {
                    Ok(seq) => self.shared.inflight().insert_call(seq, reply),
                    Err(err) => {
                        let _ = reply.send(Err(SessionError::Frame(err)));
                    }
                }
            }
            Command::Push { payload } => {
                if let Err(err) = self.handler.send_push(payload) {
                    warn!("dropping push: {err}");
                }
            }
            Command::Response { seq, payload } => {
                if let Err(err) = self.handler.send_response(seq, payload) {
                    warn!("dropping response for {seq}: {err}");
                }
            }
            Command::Ping { reply } => match self.handler.send_ping() {
                Ok(seq) => self.shared.inflight().insert_call(seq, reply),
                Err(err) => {
                    let _ = reply.send(Err(SessionError::Frame(err)));
                }
            },
        }
        self.staging.refill(&mut self.handler);
    }

    /// Handle one read completion. Returns `false` when the loop must exit.
    async fn process_read(&mut self, read: io::Result<usize>) -> bool {
        match read {
            Ok(0) => {
                debug!("peer closed the stream");
                self.shared.begin_close(CloseReason::Normal);
                false
            }
            Ok(_) => {
                let events = match self.handler.on_bytes(&self.read_buf) {
                    Ok(events) => events,
                    Err(err) => {
                        warn!("unreadable frame: {err}");
                        self.shared.begin_close(CloseReason::Normal);
                        return false;
                    }
                };
                self.read_buf.clear();
                for event in events {
                    if let Err(reason) = self.dispatch(event).await {
                        self.flush_outbound().await;
                        self.shared.begin_close(reason);
                        return false;
                    }
                }
                self.staging.refill(&mut self.handler);
                true
            }
            Err(err) => {
                debug!("socket read failed: {err}");
                self.shared.begin_close(CloseReason::Normal);
                false
            }
        }
    }

    /// Handle one write completion. Returns `false` when the loop must exit.
    fn process_write(&mut self, written: io::Result<usize>) -> bool {
        match written {
            Ok(0) => {
                debug!("socket write returned zero");
                self.shared.begin_close(CloseReason::Normal);
                false
            }
            Ok(n) => {
                self.staging.consume(n);
                self.staging.refill(&mut self.handler);
                trace!("wrote {n} bytes, {} still staged", self.staging.len());
                true
            }
            Err(err) => {
                debug!("socket write failed: {err}");
                self.shared.begin_close(CloseReason::Normal);
                false
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Result<(), CloseReason> {
        match self.phase {
            Phase::Opening => self.dispatch_opening(frame),
            Phase::Ready => {
                self.dispatch_ready(frame).await;
                Ok(())
            }
        }
    }

    /// Handshake dispatch. An `Err` carries the close reason to record
    /// after the pending goaway has been flushed.
    fn dispatch_opening(&mut self, frame: Frame) -> Result<(), CloseReason> {
        match frame {
            Frame::Hello {
                ping_interval_ms,
                encodings,
            } if self.role == Role::Server => {
                self.shared.set_ping_interval_ms(u64::from(ping_interval_ms));
                match self.registry.pick(encodings.iter().map(String::as_str)) {
                    Some((name, encoder)) => {
                        if let Err(err) = self.handler.send_select_encoding(&name) {
                            warn!("failed to queue encoding selection: {err}");
                            return Err(CloseReason::Normal);
                        }
                        self.adopt(name, encoder);
                        Ok(())
                    }
                    None => {
                        debug!("no mutual encoder among {encodings:?}");
                        let _ = self
                            .handler
                            .send_goaway(CloseReason::NoMutualEncoders.code());
                        Err(CloseReason::NoMutualEncoders)
                    }
                }
            }
            Frame::SelectEncoding { name } if self.role == Role::Client => {
                match self.registry.get(&name) {
                    Some(encoder) => {
                        self.adopt(name, encoder);
                        Ok(())
                    }
                    None => {
                        debug!("peer selected unregistered encoder {name:?}");
                        let _ = self.handler.send_goaway(CloseReason::UnknownEncoder.code());
                        Err(CloseReason::UnknownEncoder)
                    }
                }
            }
            Frame::GoAway { reason } => Err(CloseReason::from_code(reason)),
            other => {
                debug!("ignoring {} frame before negotiation", other.kind());
                Ok(())
            }
        }
    }

    fn adopt(&mut self, name: String, encoder: Arc<dyn Encoder>) {
        debug!("negotiated encoding {name:?}");
        self.encoder = Some(Arc::clone(&encoder));
        self.shared.adopt_encoder(name, encoder);
        self.phase = Phase::Ready;
    }

    async fn dispatch_ready(&mut self, frame: Frame) {
        match frame {
            Frame::Request { seq, payload } => self.on_request(seq, &payload).await,
            Frame::Response { seq, payload } => self.on_response(seq, &payload),
            Frame::Push { payload } => self.on_push(&payload).await,
            // the stream handler already queued the pong
            Frame::Ping { seq } => trace!("ping {seq} acknowledged"),
            Frame::Pong { seq } => self.on_pong(seq),
            // reserved: no graceful drain in this version
            Frame::GoAway { reason } => debug!("goaway (reason {reason}) ignored"),
            other => debug!("unexpected {} frame after negotiation", other.kind()),
        }
    }

    async fn on_request(&mut self, seq: u32, payload: &[u8]) {
        let decoded = match self.decode(payload) {
            Ok(decoded) => Bytes::from(decoded),
            Err(err) => {
                warn!("dropping undecodable request {seq}: {err}");
                return;
            }
        };
        self.shared.inflight().insert_served(seq, decoded.clone());
        let reply = self
            .hooks
            .on_request(InboundRequest {
                seq,
                payload: decoded,
            })
            .await;
        if let Some(value) = reply {
            // already answered out-of-band? then the hook's reply is stale
            if !self.shared.inflight().complete_served(seq) {
                return;
            }
            match self.encode(&value) {
                Ok(encoded) => {
                    if let Err(err) = self.handler.send_response(seq, Bytes::from(encoded)) {
                        warn!("dropping reply for {seq}: {err}");
                    }
                }
                Err(err) => warn!("failed to encode reply for {seq}: {err}"),
            }
        }
    }

    fn on_response(&mut self, seq: u32, payload: &[u8]) {
        let Some(waiter) = self.shared.inflight().take_call(seq) else {
            // late response after shutdown raced the request away
            trace!("response for unknown sequence {seq} dropped");
            return;
        };
        let result = match self.decode(payload) {
            Ok(decoded) => Ok(Bytes::from(decoded)),
            Err(err) => {
                warn!("undecodable response for {seq}");
                Err(SessionError::Decode(err))
            }
        };
        complete(waiter, result);
    }

    async fn on_push(&mut self, payload: &[u8]) {
        match self.decode(payload) {
            Ok(decoded) => self.hooks.on_push(Bytes::from(decoded)).await,
            Err(err) => warn!("dropping undecodable push: {err}"),
        }
    }

    fn on_pong(&mut self, seq: u32) {
        if let Some(waiter) = self.shared.inflight().take_call(seq) {
            complete(waiter, Ok(Bytes::new()));
        } else {
            trace!("pong for unknown sequence {seq} dropped");
        }
    }

    fn encode(&self, value: &[u8]) -> Result<Vec<u8>, CodecError> {
        let Some(encoder) = &self.encoder else {
            return Err("no encoder negotiated".into());
        };
        encoder.encode(value)
    }

    fn decode(&self, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        let Some(encoder) = &self.encoder else {
            return Err("no encoder negotiated".into());
        };
        encoder.decode(payload)
    }

    /// Best-effort drain of queued output, bounded by [`FLUSH_GRACE`].
    ///
    /// Used before a handshake-failure close so the goaway reaches the
    /// peer; errors are irrelevant because the session is going down.
    async fn flush_outbound(&mut self) {
        let drain = async {
            loop {
                self.staging.refill(&mut self.handler);
                if self.staging.is_empty() {
                    break;
                }
                match self.writer.write(self.staging.as_slice()).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => self.staging.consume(n),
                }
            }
            let _ = self.writer.flush().await;
        };
        let _ = timeout(FLUSH_GRACE, drain).await;
    }
}

fn complete(waiter: CallWaiter, result: Result<Bytes, SessionError>) {
    // the caller may have given up on the awaitable; that is not an error
    let _ = waiter.send(result);
}

async fn read_some<R>(reader: &mut R, buf: &mut BytesMut) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    buf.reserve(READ_CHUNK);
    reader.read_buf(buf).await
}
