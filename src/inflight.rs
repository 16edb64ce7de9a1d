//! The inflight exchange table.
//!
//! One map, keyed by sequence number, holds both directions of traffic: a
//! sequence is either an outbound call awaiting the peer's reply or an
//! inbound request retained until a response is sent — never both. Client
//! handlers allocate odd sequences and server handlers even ones, so the
//! two directions cannot collide on a key.

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::{ConnectionError, SessionError};

/// Completes an awaitable held by the caller of `send_request` or
/// `send_ping`.
pub(crate) type CallWaiter = oneshot::Sender<Result<Bytes, SessionError>>;

enum Entry {
    /// Outbound request or ping pending the peer's reply.
    Call(CallWaiter),
    /// Inbound request retained until `send_response` names it.
    Served(Bytes),
}

/// Concurrent table of open exchanges.
#[derive(Default)]
pub(crate) struct InflightTable {
    entries: DashMap<u32, Entry>,
}

impl InflightTable {
    /// Register an outbound call waiter under a freshly allocated sequence.
    pub fn insert_call(&self, seq: u32, waiter: CallWaiter) {
        let previous = self.entries.insert(seq, Entry::Call(waiter));
        debug_assert!(previous.is_none(), "sequence {seq} was already inflight");
    }

    /// Retain an inbound request until it is answered.
    pub fn insert_served(&self, seq: u32, payload: Bytes) {
        let previous = self.entries.insert(seq, Entry::Served(payload));
        debug_assert!(previous.is_none(), "sequence {seq} was already inflight");
    }

    /// Remove and return the call waiter for `seq`, if that is what `seq`
    /// holds. An inbound request under the same key is left untouched.
    pub fn take_call(&self, seq: u32) -> Option<CallWaiter> {
        self.entries
            .remove_if(&seq, |_, entry| matches!(entry, Entry::Call(_)))
            .and_then(|(_, entry)| match entry {
                Entry::Call(waiter) => Some(waiter),
                Entry::Served(_) => None,
            })
    }

    /// Remove the retained inbound request for `seq`. Returns `false` when
    /// `seq` is unknown or holds an outbound call.
    pub fn complete_served(&self, seq: u32) -> bool {
        self.entries
            .remove_if(&seq, |_, entry| matches!(entry, Entry::Served(_)))
            .is_some()
    }

    /// Remove every entry, failing each call waiter with `error`.
    ///
    /// Drain order is unspecified.
    pub fn drain_failing(&self, error: ConnectionError) {
        let seqs: Vec<u32> = self.entries.iter().map(|entry| *entry.key()).collect();
        for seq in seqs {
            if let Some((_, Entry::Call(waiter))) = self.entries.remove(&seq) {
                let _ = waiter.send(Err(SessionError::Connection(error)));
            }
        }
    }

    /// Whether no exchange is open.
    pub fn is_empty(&self) -> bool { self.entries.is_empty() }
}
