//! Session handle, builder, and the shutdown path.
//!
//! A [`Session`] is a cloneable handle onto one established conversation.
//! The actual I/O lives in the engine task (`engine` module); handles talk
//! to it through an unbounded command inbox, and lifecycle state flows back
//! through three one-shot flags: `ready` (negotiation complete), `stop`
//! (teardown requested), and `close_done` (teardown finished).

use std::{
    io,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use leaky_bucket::RateLimiter;
use log::debug;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpStream, ToSocketAddrs},
    sync::{mpsc, oneshot},
    task::AbortHandle,
    time::timeout,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{Role, SessionConfig},
    encoding::{Encoder, EncoderRegistry},
    engine::Engine,
    error::{CloseReason, ConnectionError, SessionError},
    hooks::{NoopHooks, SessionHooks},
    inflight::{CallWaiter, InflightTable},
    ping,
};

/// Instructions a handle sends to the engine task.
pub(crate) enum Command {
    /// Allocate a sequence, register the waiter, queue a request frame.
    Request {
        payload: Bytes,
        reply: CallWaiter,
    },
    /// Queue a push frame.
    Push { payload: Bytes },
    /// Queue a response to an inbound request.
    Response { seq: u32, payload: Bytes },
    /// Allocate a sequence, register the waiter, queue a ping frame.
    Ping { reply: CallWaiter },
}

/// State shared between handles, the engine, the ping loop, and the
/// shutdown terminator.
pub(crate) struct Shared {
    role: Role,
    ready: CancellationToken,
    stop: CancellationToken,
    close_done: CancellationToken,
    close_reason: OnceLock<CloseReason>,
    encoder: OnceLock<Arc<dyn Encoder>>,
    encoding_name: OnceLock<String>,
    ping_interval_ms: AtomicU64,
    terminating: AtomicBool,
    inflight: InflightTable,
    engine_abort: OnceLock<AbortHandle>,
}

impl Shared {
    fn new(role: Role, config: &SessionConfig) -> Self {
        Self {
            role,
            ready: CancellationToken::new(),
            stop: CancellationToken::new(),
            close_done: CancellationToken::new(),
            close_reason: OnceLock::new(),
            encoder: OnceLock::new(),
            encoding_name: OnceLock::new(),
            ping_interval_ms: AtomicU64::new(config.ping_interval_ms),
            terminating: AtomicBool::new(false),
            inflight: InflightTable::default(),
            engine_abort: OnceLock::new(),
        }
    }

    pub fn role(&self) -> Role { self.role }

    pub fn inflight(&self) -> &InflightTable { &self.inflight }

    /// Adopt the negotiated encoder and open the session for traffic.
    pub fn adopt_encoder(&self, name: String, encoder: Arc<dyn Encoder>) {
        let _ = self.encoder.set(encoder);
        let _ = self.encoding_name.set(name);
        self.ready.cancel();
    }

    pub fn encoder(&self) -> Option<Arc<dyn Encoder>> { self.encoder.get().map(Arc::clone) }

    pub fn encoding_name(&self) -> Option<&str> { self.encoding_name.get().map(String::as_str) }

    pub async fn ready_wait(&self) { self.ready.cancelled().await }

    pub async fn stopped(&self) { self.stop.cancelled().await }

    pub fn is_stopped(&self) -> bool { self.stop.is_cancelled() }

    pub async fn close_done_wait(&self) { self.close_done.cancelled().await }

    pub fn is_closed(&self) -> bool { self.close_done.is_cancelled() }

    pub fn set_close_done(&self) { self.close_done.cancel() }

    pub fn close_reason(&self) -> Option<CloseReason> { self.close_reason.get().copied() }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms.load(Ordering::Acquire))
    }

    pub fn set_ping_interval_ms(&self, interval_ms: u64) {
        self.ping_interval_ms.store(interval_ms, Ordering::Release);
    }

    pub fn set_engine_abort(&self, handle: AbortHandle) { let _ = self.engine_abort.set(handle); }

    /// The error pending awaitables are failed with at shutdown.
    pub fn drain_error(&self) -> ConnectionError {
        match self.close_reason() {
            Some(CloseReason::PingTimeout) => ConnectionError::PingTimeout,
            _ => ConnectionError::Terminated,
        }
    }

    /// Begin teardown. Idempotent: the first reason wins, the terminator is
    /// spawned at most once.
    ///
    /// Setting `ready` here unblocks any task still gated on negotiation;
    /// its next step observes `stop` and fails cleanly.
    pub fn begin_close(self: &Arc<Self>, reason: CloseReason) {
        let _ = self.close_reason.set(reason);
        self.ready.cancel();
        self.stop.cancel();
        if !self.terminating.swap(true, Ordering::AcqRel) {
            tokio::spawn(terminate(Arc::clone(self)));
        }
    }
}

/// Grace period watchdog behind every close.
///
/// The engine normally observes `stop` within one loop turn and finishes
/// teardown itself. If it does not — a user hook wedged the dispatch loop —
/// force the cleanup: fail every inflight call, abort the engine so the
/// stream is dropped, and signal completion.
async fn terminate(shared: Arc<Shared>) {
    let grace = shared.ping_interval();
    if timeout(grace, shared.close_done_wait()).await.is_err() {
        debug!("engine did not exit within {grace:?}; forcing cleanup");
        shared.inflight.drain_failing(shared.drain_error());
        if let Some(handle) = shared.engine_abort.get() {
            handle.abort();
        }
        shared.close_done.cancel();
    }
}

/// One established RPC conversation bound to one duplex byte stream.
///
/// Handles are cheap to clone and safe to use from any task. Dropping every
/// handle does not close the session; call [`Session::close`].
///
/// # Examples
///
/// ```no_run
/// use fourwire::{RawEncoder, Role, Session};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), fourwire::SessionError> {
/// let session = Session::builder(Role::Client)
///     .encoder("raw", RawEncoder)
///     .connect("127.0.0.1:9000")
///     .await
///     .expect("connect");
/// let reply = session.send_request(b"hello").await?;
/// println!("{reply:?}");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
    push_limiter: Option<Arc<RateLimiter>>,
}

impl Session {
    /// Start building a session for `role`.
    #[must_use]
    pub fn builder(role: Role) -> SessionBuilder { SessionBuilder::new(role) }

    /// This session's role.
    #[must_use]
    pub fn role(&self) -> Role { self.shared.role() }

    /// Wait until encoding negotiation has completed.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectionError`] if the session closes before (or
    /// after) becoming ready.
    pub async fn ready(&self) -> Result<(), SessionError> { self.await_ready().await }

    /// Issue a request and await the peer's response. Client role only.
    ///
    /// Suspends until negotiation completes, then until the response
    /// arrives. Responses are delivered in peer order, which need not match
    /// request order.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Role`] for servers, [`SessionError::Encode`]
    /// if the payload cannot be encoded, and a [`ConnectionError`] if the
    /// session closes before the response arrives.
    pub async fn send_request(&self, value: &[u8]) -> Result<Bytes, SessionError> {
        self.require(Role::Client, "send_request")?;
        self.await_ready().await?;
        let payload = self.encode(value)?;
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::Request { payload, reply: tx })?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Terminated.into()),
        }
    }

    /// Send a one-way push. Client role only.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Role`] for servers, [`SessionError::Encode`]
    /// on codec failure, and a [`ConnectionError`] once the session closes.
    pub async fn send_push(&self, value: &[u8]) -> Result<(), SessionError> {
        self.require(Role::Client, "send_push")?;
        self.await_ready().await?;
        if let Some(limiter) = &self.push_limiter {
            limiter.acquire(1).await;
        }
        let payload = self.encode(value)?;
        self.send_command(Command::Push { payload })
    }

    /// Answer the inbound request `seq`. Server role only.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Role`] for clients and
    /// [`SessionError::UnknownSequence`] when `seq` does not name an open
    /// inbound exchange.
    pub async fn send_response(&self, seq: u32, value: &[u8]) -> Result<(), SessionError> {
        self.require(Role::Server, "send_response")?;
        self.await_ready().await?;
        let payload = self.encode(value)?;
        if !self.shared.inflight().complete_served(seq) {
            return Err(SessionError::UnknownSequence(seq));
        }
        self.send_command(Command::Response { seq, payload })
    }

    /// Ping the peer and await its pong.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectionError`] if the session closes before the pong
    /// arrives.
    pub async fn send_ping(&self) -> Result<(), SessionError> {
        self.await_ready().await?;
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::Ping { reply: tx })?;
        match rx.await {
            Ok(result) => result.map(|_pong| ()),
            Err(_) => Err(ConnectionError::Terminated.into()),
        }
    }

    /// Begin teardown without waiting for it to finish. Idempotent; the
    /// first reason wins.
    pub fn shutdown(&self, reason: CloseReason) { self.shared.begin_close(reason); }

    /// Begin teardown and wait until the stream is released and every
    /// pending awaitable has been completed.
    pub async fn close(&self, reason: CloseReason) {
        self.shutdown(reason);
        self.closed().await;
    }

    /// Wait for teardown to finish, without requesting it.
    pub async fn closed(&self) { self.shared.close_done_wait().await; }

    /// Whether teardown has finished.
    #[must_use]
    pub fn is_closed(&self) -> bool { self.shared.is_closed() }

    /// The reason recorded when the session began closing, if it has.
    #[must_use]
    pub fn close_reason(&self) -> Option<CloseReason> { self.shared.close_reason() }

    /// The encoding name agreed during the handshake, once there is one.
    #[must_use]
    pub fn negotiated_encoding(&self) -> Option<String> {
        self.shared.encoding_name().map(ToOwned::to_owned)
    }

    fn require(&self, role: Role, operation: &'static str) -> Result<(), SessionError> {
        if self.shared.role() == role {
            Ok(())
        } else {
            Err(SessionError::Role {
                role: self.shared.role(),
                operation,
            })
        }
    }

    async fn await_ready(&self) -> Result<(), SessionError> {
        self.shared.ready_wait().await;
        if self.shared.is_stopped() {
            return Err(SessionError::Connection(self.shared.drain_error()));
        }
        Ok(())
    }

    fn encode(&self, value: &[u8]) -> Result<Bytes, SessionError> {
        let encoder = self.shared.encoder().ok_or(SessionError::NoEncoder)?;
        encoder
            .encode(value)
            .map(Bytes::from)
            .map_err(SessionError::Encode)
    }

    fn send_command(&self, command: Command) -> Result<(), SessionError> {
        self.cmd_tx
            .send(command)
            .map_err(|_| ConnectionError::Terminated.into())
    }
}

/// Configures and launches a [`Session`].
///
/// Encoders must be registered here, before the session exists: the
/// handshake advertises exactly the names registered, in registration
/// order, and later registration cannot affect a running session.
pub struct SessionBuilder {
    role: Role,
    config: SessionConfig,
    registry: EncoderRegistry,
    hooks: Arc<dyn SessionHooks>,
}

impl SessionBuilder {
    fn new(role: Role) -> Self {
        Self {
            role,
            config: SessionConfig::default(),
            registry: EncoderRegistry::default(),
            hooks: Arc::new(NoopHooks),
        }
    }

    /// Replace the whole configuration.
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the ping interval.
    #[must_use]
    pub fn ping_interval(mut self, interval: Duration) -> Self {
        self.config = self.config.with_ping_interval(interval);
        self
    }

    /// Bound outbound pushes to `per_second` per second.
    #[must_use]
    pub fn push_rate(mut self, per_second: usize) -> Self {
        self.config = self.config.with_push_rate(per_second);
        self
    }

    /// Register a named encoder. Order of registration is preference order.
    #[must_use]
    pub fn encoder(mut self, name: impl Into<String>, encoder: impl Encoder) -> Self {
        self.registry.register(name, encoder);
        self
    }

    /// Install the callbacks invoked for inbound requests and pushes.
    #[must_use]
    pub fn hooks(mut self, hooks: impl SessionHooks + 'static) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    /// Launch the session over an established duplex stream.
    ///
    /// Spawns the I/O engine and the ping loop; the returned handle is
    /// usable immediately, with operations suspending until the handshake
    /// completes.
    pub fn spawn<S>(self, stream: S) -> Session
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let shared = Arc::new(Shared::new(self.role, &self.config));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let engine = Engine::new(stream, self.registry, self.hooks, Arc::clone(&shared), cmd_rx);
        let engine_task = tokio::spawn(engine.run());
        shared.set_engine_abort(engine_task.abort_handle());
        tokio::spawn(ping::ping_loop(Arc::clone(&shared), cmd_tx.clone()));

        let push_limiter = self.config.push_rate.map(|rate| {
            Arc::new(
                RateLimiter::builder()
                    .initial(rate)
                    .refill(rate)
                    .interval(Duration::from_secs(1))
                    .max(rate)
                    .build(),
            )
        });

        Session {
            shared,
            cmd_tx,
            push_limiter,
        }
    }

    /// Connect a TCP stream to `addr` and launch the session over it.
    ///
    /// # Errors
    ///
    /// Returns the connect or socket-option error, if any.
    pub async fn connect(self, addr: impl ToSocketAddrs) -> io::Result<Session> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(self.spawn(stream))
    }
}
