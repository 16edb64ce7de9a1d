//! Peer liveness enforcement.
//!
//! One task per session. Once the handshake completes it pings on the
//! negotiated cadence and insists each pong lands before the next ping is
//! due; a silent peer takes the whole session down with `PING_TIMEOUT`.

use std::sync::Arc;

use log::warn;
use tokio::{
    sync::{mpsc, oneshot},
    time::timeout,
};

use crate::{
    error::CloseReason,
    session::{Command, Shared},
};

pub(crate) async fn ping_loop(shared: Arc<Shared>, cmd_tx: mpsc::UnboundedSender<Command>) {
    // pings only flow on a ready session; a close also releases this wait
    shared.ready_wait().await;

    loop {
        if shared.is_stopped() {
            return;
        }

        let (tx, mut rx) = oneshot::channel();
        if cmd_tx.send(Command::Ping { reply: tx }).is_err() {
            return;
        }

        let interval = shared.ping_interval();
        if timeout(interval, shared.stopped()).await.is_ok() {
            return;
        }

        match rx.try_recv() {
            // pong arrived, or the waiter was failed by a close already in
            // progress; the next turn observes the stop flag either way
            Ok(_) => {}
            Err(oneshot::error::TryRecvError::Empty) => {
                warn!("no pong within {interval:?}; closing session");
                shared.begin_close(CloseReason::PingTimeout);
                return;
            }
            Err(oneshot::error::TryRecvError::Closed) => return,
        }
    }
}
