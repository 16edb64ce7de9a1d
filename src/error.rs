//! Error and close-reason types.
//!
//! Session operations surface [`SessionError`]; awaitables pending at
//! shutdown are failed with a [`ConnectionError`]. [`CloseReason`] records
//! why a session went down, with numeric codes that are wire-stable.

use thiserror::Error;

use crate::{config::Role, frame::FrameError};

/// Failure of the underlying connection.
///
/// Used to fail pending request and ping awaitables when the session is
/// torn down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The session was torn down before the exchange completed.
    #[error("connection terminated")]
    Terminated,
    /// The peer stopped answering pings.
    #[error("connection closed after ping timeout")]
    PingTimeout,
}

/// Errors surfaced by session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The operation is not permitted for this session's role.
    ///
    /// Role violations are programmer errors: they are reported before any
    /// state is touched and nothing reaches the wire.
    #[error("{operation} is not permitted for the {role:?} role")]
    Role {
        /// The session's actual role.
        role: Role,
        /// The rejected operation.
        operation: &'static str,
    },
    /// `send_response` named a sequence with no inbound request under
    /// service.
    #[error("no inbound request with sequence {0}")]
    UnknownSequence(u32),
    /// No encoder is available: negotiation has not completed, or it failed.
    #[error("no encoder available")]
    NoEncoder,
    /// The negotiated encoder rejected an outbound payload.
    #[error("failed to encode payload")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The negotiated encoder rejected an inbound payload.
    #[error("failed to decode payload")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// A frame could not be laid out on the wire.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// The connection failed or was closed.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Why a session closed. The numeric codes are wire-stable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Orderly close requested locally or peer hangup.
    Normal,
    /// The peer stopped answering pings.
    PingTimeout,
    /// The peer selected an encoder this side never registered.
    UnknownEncoder,
    /// The peer advertised no encoder this side knows.
    NoMutualEncoders,
    /// A reason code this version does not know. Tolerated, never rejected.
    Other(u32),
}

impl CloseReason {
    /// The wire-stable numeric code for this reason.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Normal => 0,
            Self::PingTimeout => 1,
            Self::UnknownEncoder => 2,
            Self::NoMutualEncoders => 3,
            Self::Other(code) => code,
        }
    }

    /// Interpret a numeric code, mapping unknown values to [`Self::Other`].
    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Normal,
            1 => Self::PingTimeout,
            2 => Self::UnknownEncoder,
            3 => Self::NoMutualEncoders,
            other => Self::Other(other),
        }
    }
}
