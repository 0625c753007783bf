//! Loopback tests of the quiche engine: handshake, streams, datagrams,
//! flow control and close delivery.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{sleep, timeout};

use quicmux_core::constants::APP_ERROR_HANDSHAKE_REFUSED;
use quicmux_core::constants::MAX_DATAGRAM_FRAME_SIZE;
use quicmux_core::transport::{connect, connect_with_users, listen, listen_with_users};
use quicmux_core::{
    ConnectionState, Error, QuicConnection, QuicServer, StreamState, TransportConfig,
};
use quicmux_test_utils::{Event, RecordingHandler, TEST_TIMEOUT, TestCerts};

const ALPN: &str = "quicmux-test/1";

struct Pair {
    _certs: TestCerts,
    server: QuicServer,
    server_events: Arc<RecordingHandler>,
    client: QuicConnection,
    client_events: Arc<RecordingHandler>,
}

async fn pair_with(
    server_handler: Arc<RecordingHandler>,
    server_cfg: impl FnOnce(TransportConfig) -> TransportConfig,
    client_cfg: impl FnOnce(TransportConfig) -> TransportConfig,
) -> Pair {
    let certs = TestCerts::new();
    let server = listen_with_users(
        server_cfg(certs.server_config(&[ALPN])),
        vec![server_handler.handler()],
    )
    .await
    .expect("listen");

    let client_events = RecordingHandler::new();
    let client = connect_with_users(
        client_cfg(TestCerts::client_config(server.local_addr().to_string(), ALPN)),
        vec![client_events.handler()],
    )
    .await
    .expect("connect");

    Pair {
        _certs: certs,
        server,
        server_events: server_handler,
        client,
        client_events,
    }
}

async fn pair() -> Pair {
    pair_with(RecordingHandler::new(), |c| c, |c| c).await
}

async fn established(pair: &Pair) -> QuicConnection {
    timeout(TEST_TIMEOUT, pair.client.wait_established())
        .await
        .expect("handshake timed out")
        .expect("handshake failed");
    let server_conn = pair.server_events.wait_connection().await;
    timeout(TEST_TIMEOUT, server_conn.wait_established())
        .await
        .expect("server handshake timed out")
        .expect("server handshake failed");
    server_conn
}

/// Wait until `len` bytes arrived on `stream_id`.
async fn wait_stream_len(handler: &RecordingHandler, stream_id: u64, len: usize) -> Vec<u8> {
    timeout(TEST_TIMEOUT, async {
        loop {
            let bytes = handler.stream_bytes(stream_id).await;
            if bytes.len() >= len {
                return bytes;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for stream bytes")
}

fn assert_contiguous(metas: &[quicmux_core::StreamMeta]) {
    let mut expected = 0;
    for meta in metas {
        assert_eq!(meta.offset, expected, "gap or overlap at {:?}", meta);
        expected = meta.end();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_reports_both_sides() {
    let pair = pair().await;
    let server_conn = established(&pair).await;

    assert_eq!(pair.client.state(), ConnectionState::Open);
    assert_eq!(pair.client.alpn().as_deref(), Some(ALPN));
    assert_eq!(server_conn.alpn().as_deref(), Some(ALPN));
    assert_eq!(pair.server.connections().len(), 1);

    pair.client_events
        .wait_for(|e| matches!(e, Event::HandshakeComplete { .. }))
        .await;
    let events = pair.server_events.events().await;
    assert!(matches!(events[0], Event::NewConnection { .. }));
}

#[tokio::test(flavor = "multi_thread")]
async fn single_bidi_stream_delivers_payload() {
    let pair = pair().await;
    established(&pair).await;

    let stream_id = pair.client.open_stream(true).await.unwrap();
    assert_eq!(stream_id, 0);

    let payload: Vec<u8> = (0..1000u32).map(|i| i as u8).collect();
    let sent = pair
        .client
        .send_stream(stream_id, Bytes::from(payload.clone()), false)
        .await
        .unwrap();
    assert_eq!(sent, 1000);

    let received = wait_stream_len(&pair.server_events, 0, 1000).await;
    assert_eq!(received, payload);

    let metas = pair.server_events.stream_metas(0).await;
    assert_eq!(metas[0].offset, 0);
    assert_contiguous(&metas);
    assert_eq!(metas.iter().map(|m| m.length).sum::<u64>(), 1000);

    pair.server_events
        .wait_for(|e| matches!(e, Event::StreamOpened { stream_id: 0, .. }))
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_close_sends_final_and_retires() {
    let pair = pair().await;
    let server_conn = established(&pair).await;

    let stream_id = pair.client.open_stream(true).await.unwrap();
    pair.client
        .send_stream(stream_id, Bytes::from_static(b"hello"), false)
        .await
        .unwrap();
    pair.client.close_stream(stream_id, 0).await.unwrap();

    pair.server_events
        .wait_for(|e| matches!(e, Event::StreamData { meta, .. } if meta.is_final))
        .await;
    assert_eq!(pair.server_events.stream_bytes(0).await, b"hello");

    assert!(
        pair.client
            .stream_state(stream_id)
            .await
            .contains(StreamState::CLOSED_SENDING)
    );
    assert!(pair.client.send_stream(stream_id, Bytes::from_static(b"x"), false).await.is_err());

    // Finish the other direction so both sides retire the stream.
    server_conn.close_stream(stream_id, 0).await.unwrap();
    pair.client_events
        .wait_for(|e| matches!(e, Event::StreamClosed { stream_id: 0, .. }))
        .await;

    let acked: Vec<u8> = pair
        .client_events
        .events()
        .await
        .into_iter()
        .filter_map(|e| match e {
            Event::StreamAckd { stream_id: 0, data, .. } => Some(data),
            _ => None,
        })
        .flat_map(|d| d.to_vec())
        .collect();
    assert_eq!(acked, b"hello");
    assert!(!pair.client.stream_ids().contains(&stream_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn datagram_round_trip() {
    let pair = pair_with(
        RecordingHandler::new(),
        |c| c.with_datagrams(true),
        |c| c.with_datagrams(true),
    )
    .await;
    let server_conn = established(&pair).await;
    assert!(pair.client.datagrams_supported());
    assert_eq!(
        pair.client.remote_params().unwrap().max_datagram_frame_size,
        server_conn.local_params().max_datagram_frame_size
    );
    assert_eq!(
        server_conn.local_params().max_datagram_frame_size,
        MAX_DATAGRAM_FRAME_SIZE
    );

    let ticket = pair
        .client
        .send_datagram(Bytes::from_static(b"ping"))
        .await
        .unwrap();
    assert_eq!(ticket.id, 0);
    assert!(ticket.accepted);

    let event = pair
        .server_events
        .wait_for(|e| matches!(e, Event::Datagram { .. }))
        .await;
    let Event::Datagram { data, .. } = event else {
        unreachable!();
    };
    assert_eq!(&data[..], b"ping");

    pair.client_events
        .wait_for(|e| matches!(e, Event::DatagramAckd { ticket: 0, .. }))
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn datagram_without_extension_fails() {
    let pair = pair().await;
    established(&pair).await;
    let err = pair
        .client
        .send_datagram(Bytes::from_static(b"ping"))
        .await
        .unwrap_err();
    assert!(matches!(err, quicmux_core::Error::ExtensionNotSupported));
}

#[tokio::test(flavor = "multi_thread")]
async fn small_stream_window_still_delivers_everything() {
    let pair = pair_with(
        RecordingHandler::new(),
        |c| c.with_max_stream_data_bidi_remote(100),
        |c| c,
    )
    .await;
    let server_conn = established(&pair).await;
    assert_eq!(
        pair.client.remote_params().unwrap().max_stream_data_bidi_remote,
        100
    );
    assert_eq!(server_conn.local_params().max_stream_data_bidi_remote, 100);

    let stream_id = pair.client.open_stream(true).await.unwrap();
    let payload = Bytes::from(vec![0x5a; 500]);
    let mut rest = payload.clone();
    while !rest.is_empty() {
        match pair.client.send_stream(stream_id, rest.clone(), false).await {
            Ok(n) => rest = rest.slice(n..),
            Err(e) if e.is_retryable() => continue,
            Err(e) => panic!("send failed: {e}"),
        }
    }

    let received = wait_stream_len(&pair.server_events, stream_id, 500).await;
    assert_eq!(received, payload.to_vec());
    assert_contiguous(&pair.server_events.stream_metas(stream_id).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn stream_limit_blocks_open() {
    let pair = pair_with(RecordingHandler::new(), |c| c.with_max_streams_bidi(1), |c| c).await;
    established(&pair).await;

    assert_eq!(pair.client.can_open_stream(true).await, StreamState::OPEN);
    pair.client.open_stream(true).await.unwrap();
    assert_eq!(
        pair.client.can_open_stream(true).await,
        StreamState::MAX_STREAMS_REACHED
    );
    let err = pair.client.open_stream(true).await.unwrap_err();
    assert!(matches!(err, quicmux_core::Error::StreamIdBlocked));
}

#[tokio::test(flavor = "multi_thread")]
async fn open_before_handshake_fails() {
    let pair = pair().await;
    if pair.client.state() < ConnectionState::Open {
        let err = pair.client.open_stream(true).await.unwrap_err();
        assert!(matches!(
            err,
            quicmux_core::Error::HandshakeIncomplete | quicmux_core::Error::StreamIdBlocked
        ));
    }
    established(&pair).await;
    assert_eq!(pair.client.open_stream(true).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_notifies_each_side_once() {
    let pair = pair().await;
    established(&pair).await;

    pair.client.disconnect(true, 0).await.unwrap();
    assert!(pair.client.state().is_closing());

    pair.client_events
        .wait_for(|e| matches!(e, Event::ConnectionClosed { .. }))
        .await;
    let closed = pair
        .server_events
        .wait_for(|e| matches!(e, Event::ConnectionClosed { .. }))
        .await;
    let Event::ConnectionClosed { reason, .. } = closed else {
        unreachable!();
    };
    let reason = reason.expect("peer close carries a reason");
    assert!(reason.remote);
    assert!(reason.is_app);
    assert_eq!(reason.error_code, 0);

    timeout(TEST_TIMEOUT, pair.client.wait_closed())
        .await
        .expect("client never closed");
    sleep(Duration::from_millis(100)).await;

    let is_close = |e: &Event| matches!(e, Event::ConnectionClosed { .. });
    assert_eq!(pair.client_events.count(is_close).await, 1);
    assert_eq!(pair.server_events.count(is_close).await, 1);
    let last = pair.client_events.events().await.pop().unwrap();
    assert!(is_close(&last));

    // Closing again is a no-op.
    pair.client.disconnect(true, 0).await.unwrap();
    assert!(pair.client.open_stream(true).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_handshake_closes_connection() {
    let pair = pair_with(RecordingHandler::refusing(), |c| c, |c| c).await;

    let closed = pair
        .client_events
        .wait_for(|e| matches!(e, Event::ConnectionClosed { .. }))
        .await;
    let Event::ConnectionClosed { reason, .. } = closed else {
        unreachable!();
    };
    let reason = reason.expect("refusal carries a reason");
    assert!(reason.remote);
    assert!(reason.is_app);
    assert_eq!(reason.error_code, APP_ERROR_HANDSHAKE_REFUSED);
}

#[tokio::test(flavor = "multi_thread")]
async fn stateless_retry_still_connects() {
    let pair = pair_with(
        RecordingHandler::new(),
        |c| c.with_stateless_retry(true),
        |c| c,
    )
    .await;
    established(&pair).await;

    let stream_id = pair.client.open_stream(false).await.unwrap();
    assert_eq!(stream_id, 2);
    pair.client
        .send_stream(stream_id, Bytes::from_static(b"uni"), true)
        .await
        .unwrap();
    assert_eq!(wait_stream_len(&pair.server_events, 2, 3).await, b"uni");
}

#[tokio::test(flavor = "multi_thread")]
async fn server_close_ends_connections() {
    let pair = pair().await;
    established(&pair).await;

    pair.server.close().await;
    assert!(pair.server.is_closed());
    pair.client_events
        .wait_for(|e| matches!(e, Event::ConnectionClosed { .. }))
        .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retired_stream_acks_slices_in_offset_order() {
    let pair = pair().await;
    let server_conn = established(&pair).await;

    let stream_id = pair.client.open_stream(true).await.unwrap();
    for chunk in [&b"aa"[..], b"bbb", b"cccc"] {
        let sent = pair
            .client
            .send_stream(stream_id, Bytes::from_static(chunk), false)
            .await
            .unwrap();
        assert_eq!(sent, chunk.len());
    }
    pair.client.close_stream(stream_id, 0).await.unwrap();

    pair.server_events
        .wait_for(|e| matches!(e, Event::StreamData { meta, .. } if meta.is_final))
        .await;
    server_conn.close_stream(stream_id, 0).await.unwrap();
    pair.client_events
        .wait_for(|e| matches!(e, Event::StreamClosed { stream_id: 0, .. }))
        .await;

    let acks: Vec<(u64, Bytes)> = pair
        .client_events
        .events()
        .await
        .into_iter()
        .filter_map(|e| match e {
            Event::StreamAckd { stream_id: 0, offset, data, .. } => Some((offset, data)),
            _ => None,
        })
        .collect();
    let offsets: Vec<u64> = acks.iter().map(|(offset, _)| *offset).collect();
    assert_eq!(offsets, vec![0, 2, 5]);
    let data: Vec<u8> = acks.iter().flat_map(|(_, d)| d.to_vec()).collect();
    assert_eq!(data, b"aabbbcccc");
}

#[tokio::test(flavor = "multi_thread")]
async fn endpoints_reject_the_wrong_role() {
    let err = connect(TransportConfig::server("127.0.0.1:4433"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Config { .. }), "{err}");

    let err = listen(TransportConfig::client("127.0.0.1:0")).await.unwrap_err();
    assert!(matches!(err, Error::Config { .. }), "{err}");
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_version_gets_version_negotiation() {
    let certs = TestCerts::new();
    let server = listen(certs.server_config(&[ALPN])).await.expect("listen");

    let dcid = [0x11u8; 8];
    let scid = [0x22u8; 8];
    let mut initial = vec![0xc0];
    initial.extend_from_slice(&0x1a2a_3a4a_u32.to_be_bytes());
    initial.push(dcid.len() as u8);
    initial.extend_from_slice(&dcid);
    initial.push(scid.len() as u8);
    initial.extend_from_slice(&scid);
    // Empty token, then padding up to the minimum Initial size.
    initial.resize(1200, 0);

    let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.send_to(&initial, server.local_addr()).await.unwrap();

    let mut reply = vec![0u8; 1500];
    let (len, from) = timeout(TEST_TIMEOUT, socket.recv_from(&mut reply))
        .await
        .expect("no version negotiation reply")
        .unwrap();
    assert_eq!(from, server.local_addr());

    let hdr = quiche::Header::from_slice(&mut reply[..len], scid.len()).unwrap();
    assert_eq!(hdr.ty, quiche::Type::VersionNegotiation);
    assert_eq!(&hdr.dcid[..], &scid[..]);
    assert_eq!(&hdr.scid[..], &dcid[..]);
    let versions = hdr.versions.expect("supported versions listed");
    assert!(versions.contains(&quiche::PROTOCOL_VERSION));
    assert!(server.connections().is_empty());

    server.close().await;
}
