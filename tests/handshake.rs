//! Encoding negotiation: the happy path, preference order, and both
//! failure modes.

mod common;

use async_trait::async_trait;
use bytes::BytesMut;
use common::{TEST_ENCODING, TEST_TIMEOUT, client_builder, pair, read_frame, server_builder};
use fourwire::{
    BincodeEncoder, CloseReason, ConnectionError, InboundRequest, RawEncoder, Role, Session,
    SessionError, SessionHooks,
    frame::Frame,
};
use rstest::rstest;
use tokio::{io::duplex, time::timeout};

struct HelloWorldHooks;

#[async_trait]
impl SessionHooks for HelloWorldHooks {
    async fn on_request(&self, request: InboundRequest) -> Option<Vec<u8>> {
        assert_eq!(&request.payload[..], b"hello");
        Some(b"world".to_vec())
    }
}

#[tokio::test]
async fn round_trip_request_response() {
    let (client, server) = pair(client_builder(), server_builder().hooks(HelloWorldHooks));

    let reply = timeout(TEST_TIMEOUT, client.send_request(b"hello"))
        .await
        .expect("request timed out")
        .expect("request failed");

    assert_eq!(&reply[..], b"world");
    assert_eq!(client.negotiated_encoding().as_deref(), Some(TEST_ENCODING));
    assert_eq!(server.negotiated_encoding().as_deref(), Some(TEST_ENCODING));
}

#[tokio::test]
async fn negotiation_honours_client_preference_order() {
    let client = Session::builder(Role::Client)
        .encoder("bincode", BincodeEncoder)
        .encoder(TEST_ENCODING, RawEncoder);
    let server = Session::builder(Role::Server)
        .encoder(TEST_ENCODING, RawEncoder)
        .encoder("bincode", BincodeEncoder)
        .hooks(common::EchoHooks);
    let (client, server) = pair(client, server);

    let reply = timeout(TEST_TIMEOUT, client.send_request(b"data"))
        .await
        .expect("request timed out")
        .expect("request failed");

    assert_eq!(&reply[..], b"data");
    // the client's first preference wins, not the server's
    assert_eq!(client.negotiated_encoding().as_deref(), Some("bincode"));
    assert_eq!(server.negotiated_encoding().as_deref(), Some("bincode"));
}

#[rstest]
#[case(&["a", "b"], &["b", "a"], "a")]
#[case(&["b"], &["a", "b"], "b")]
#[case(&["c", "b", "a"], &["a", "b"], "b")]
#[tokio::test]
async fn negotiation_selects_the_first_mutual_name(
    #[case] client_names: &[&str],
    #[case] server_names: &[&str],
    #[case] expected: &str,
) {
    let mut client = Session::builder(Role::Client);
    for name in client_names {
        client = client.encoder(*name, RawEncoder);
    }
    let mut server = Session::builder(Role::Server);
    for name in server_names {
        server = server.encoder(*name, RawEncoder);
    }
    let (client, server) = pair(client, server);

    timeout(TEST_TIMEOUT, client.ready())
        .await
        .expect("handshake timed out")
        .expect("handshake failed");

    assert_eq!(client.negotiated_encoding().as_deref(), Some(expected));
    timeout(TEST_TIMEOUT, server.ready())
        .await
        .expect("server handshake timed out")
        .expect("server handshake failed");
    assert_eq!(server.negotiated_encoding().as_deref(), Some(expected));
}

#[tokio::test]
async fn no_mutual_encoder_closes_both_sides() {
    let (client, server) = pair(
        Session::builder(Role::Client).encoder("a", RawEncoder),
        Session::builder(Role::Server).encoder("b", RawEncoder),
    );

    let pending = tokio::spawn({
        let client = client.clone();
        async move { client.send_request(b"doomed").await }
    });

    timeout(TEST_TIMEOUT, client.closed())
        .await
        .expect("client never closed");
    timeout(TEST_TIMEOUT, server.closed())
        .await
        .expect("server never closed");

    assert_eq!(client.close_reason(), Some(CloseReason::NoMutualEncoders));
    assert_eq!(server.close_reason(), Some(CloseReason::NoMutualEncoders));

    let result = pending.await.expect("request task panicked");
    assert!(
        matches!(
            result,
            Err(SessionError::Connection(ConnectionError::Terminated))
        ),
        "pending request should fail with a termination error, got {result:?}"
    );
}

#[tokio::test]
async fn unregistered_selection_closes_with_unknown_encoder() {
    let (near, mut far) = duplex(64 * 1024);
    let client = client_builder().spawn(near);
    let mut buf = BytesMut::new();

    // misbehaving peer: select a name the client never advertised
    common::handshake_as_server(&mut far, &mut buf, "nonexistent").await;

    timeout(TEST_TIMEOUT, client.closed())
        .await
        .expect("client never closed");
    assert_eq!(client.close_reason(), Some(CloseReason::UnknownEncoder));

    // the client tells the peer why before hanging up
    let frame = read_frame(&mut far, &mut buf).await;
    assert_eq!(
        frame,
        Frame::GoAway {
            reason: CloseReason::UnknownEncoder.code()
        }
    );
}
