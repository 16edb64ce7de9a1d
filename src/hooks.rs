//! User callbacks invoked by the session engine.

use async_trait::async_trait;
use bytes::Bytes;

/// An inbound request delivered to [`SessionHooks::on_request`].
#[derive(Clone, Debug)]
pub struct InboundRequest {
    /// The sequence number of the exchange. Pass it to
    /// [`Session::send_response`](crate::Session::send_response) when
    /// answering later instead of from the hook.
    pub seq: u32,
    /// The decoded request payload.
    pub payload: Bytes,
}

/// Callbacks a session invokes for inbound traffic.
///
/// Invocations are serialized: one callback completes before the next
/// inbound event is dispatched. A hook that never returns therefore stalls
/// the session until the shutdown terminator forces teardown.
#[async_trait]
pub trait SessionHooks: Send + Sync {
    /// Handle an inbound request.
    ///
    /// Return `Some(reply)` to answer immediately; the session encodes the
    /// reply and completes the exchange. Return `None` to answer later via
    /// [`Session::send_response`](crate::Session::send_response).
    async fn on_request(&self, request: InboundRequest) -> Option<Vec<u8>> {
        let _ = request;
        None
    }

    /// Handle an inbound push.
    async fn on_push(&self, payload: Bytes) { let _ = payload; }
}

/// Hooks that ignore every inbound event; the default when a session is
/// built without any.
pub(crate) struct NoopHooks;

#[async_trait]
impl SessionHooks for NoopHooks {}
