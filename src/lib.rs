#![doc(html_root_url = "https://docs.rs/fourwire/latest")]
//! Bidirectional framed RPC over a single duplex byte stream.
//!
//! `fourwire` multiplexes four interaction patterns onto one connection:
//! request/response, one-way push, liveness ping/pong, and a short
//! encoding-negotiation handshake. A session owns the stream's I/O engine,
//! keeps outbound buffering bounded, correlates replies through an inflight
//! table, and detects dead peers with a ping loop.
//!
//! Build a [`Session`] for each side of an established stream, register
//! encoders by name, and exchange payloads once the handshake settles:
//!
//! ```no_run
//! use fourwire::{RawEncoder, Role, Session};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), fourwire::SessionError> {
//! let client = Session::builder(Role::Client)
//!     .encoder("raw", RawEncoder)
//!     .connect("127.0.0.1:9000")
//!     .await
//!     .expect("connect");
//! let reply = client.send_request(b"hello").await?;
//! # drop(reply);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod encoding;
mod engine;
pub mod error;
pub mod frame;
pub mod hooks;
mod inflight;
mod ping;
pub mod session;
mod stream;

pub use config::{Role, SessionConfig};
pub use encoding::{BincodeEncoder, Encoder, EncoderRegistry, RawEncoder};
pub use engine::OUTBUF_MAX;
pub use error::{CloseReason, ConnectionError, SessionError};
pub use hooks::{InboundRequest, SessionHooks};
pub use session::{Session, SessionBuilder};
