//! Session teardown: peer EOF, inflight drain, idempotent close, and
//! unblocking senders still gated on the handshake.

mod common;

use bytes::BytesMut;
use common::{TEST_ENCODING, TEST_TIMEOUT, client_builder, handshake_as_server, pair, read_frame, server_builder};
use fourwire::{CloseReason, ConnectionError, SessionError, frame::Frame};
use tokio::{io::duplex, time::timeout};

#[tokio::test]
async fn peer_eof_fails_outstanding_and_signals_close_once() {
    let (near, mut far) = duplex(64 * 1024);
    let client = client_builder().spawn(near);
    let mut buf = BytesMut::new();
    handshake_as_server(&mut far, &mut buf, TEST_ENCODING).await;

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.send_request(b"orphan").await }
    });

    // make sure the request is truly outstanding before hanging up
    loop {
        if matches!(read_frame(&mut far, &mut buf).await, Frame::Request { .. }) {
            break;
        }
    }
    drop(far);

    let result = timeout(TEST_TIMEOUT, pending)
        .await
        .expect("request never completed")
        .expect("request task panicked");
    assert!(matches!(
        result,
        Err(SessionError::Connection(ConnectionError::Terminated))
    ));

    timeout(TEST_TIMEOUT, client.closed())
        .await
        .expect("close_done never signalled");

    // a second close is a no-op: the first reason stands
    let reason = client.close_reason();
    client.close(CloseReason::Other(99)).await;
    assert_eq!(client.close_reason(), reason);
}

#[tokio::test]
async fn close_completes_every_pending_awaitable() {
    let (near, mut far) = duplex(64 * 1024);
    let client = client_builder().spawn(near);
    let mut buf = BytesMut::new();
    handshake_as_server(&mut far, &mut buf, TEST_ENCODING).await;

    let requests: Vec<_> = (0..3)
        .map(|n| {
            tokio::spawn({
                let client = client.clone();
                async move { client.send_request(&[n]).await }
            })
        })
        .collect();
    let ping = tokio::spawn({
        let client = client.clone();
        async move { client.send_ping().await }
    });

    // all four frames on the wire, none answered
    let mut outstanding = 0;
    while outstanding < 4 {
        match read_frame(&mut far, &mut buf).await {
            Frame::Request { .. } | Frame::Ping { .. } => outstanding += 1,
            other => panic!("unexpected frame {other:?}"),
        }
    }

    client.close(CloseReason::Normal).await;

    for request in requests {
        let result = timeout(TEST_TIMEOUT, request)
            .await
            .expect("request left pending by close")
            .expect("request task panicked");
        assert!(matches!(
            result,
            Err(SessionError::Connection(ConnectionError::Terminated))
        ));
    }
    let result = timeout(TEST_TIMEOUT, ping)
        .await
        .expect("ping left pending by close")
        .expect("ping task panicked");
    assert!(matches!(
        result,
        Err(SessionError::Connection(ConnectionError::Terminated))
    ));
}

#[tokio::test]
async fn close_unblocks_senders_gated_on_negotiation() {
    // the peer never answers the hello, so the session never becomes ready
    let (near, _far) = duplex(64 * 1024);
    let client = client_builder().spawn(near);

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.send_request(b"stuck").await }
    });

    client.shutdown(CloseReason::Normal);

    let result = timeout(TEST_TIMEOUT, pending)
        .await
        .expect("gated request never unblocked")
        .expect("request task panicked");
    assert!(matches!(
        result,
        Err(SessionError::Connection(ConnectionError::Terminated))
    ));
    timeout(TEST_TIMEOUT, client.closed())
        .await
        .expect("close never finished");
}

#[tokio::test]
async fn repeated_shutdown_keeps_the_first_reason() {
    let (client, server) = pair(client_builder(), server_builder());
    timeout(TEST_TIMEOUT, client.ready())
        .await
        .expect("handshake timed out")
        .expect("handshake failed");

    client.shutdown(CloseReason::Other(7));
    for _ in 0..4 {
        client.shutdown(CloseReason::Normal);
    }
    client.close(CloseReason::Other(99)).await;
    client.close(CloseReason::Other(100)).await;

    assert_eq!(client.close_reason(), Some(CloseReason::Other(7)));
    timeout(TEST_TIMEOUT, server.closed())
        .await
        .expect("server should observe the hangup");
}
