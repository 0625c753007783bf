//! The send path against the serve peer over loopback.

use std::sync::Arc;
use std::time::Duration;

use quicmux_cli::send::{AckWaiter, DATAGRAM_CHUNK, generated_payload, send_on};
use quicmux_cli::serve::ReportingPeer;
use quicmux_core::transport::{connect_with_users, listen_with_users};
use quicmux_core::{ChannelRequest, ConnectionHandler, Demultiplexer, QuicServer};
use quicmux_test_utils::TestCerts;

const ALPN: &str = "quicmux-test/1";
const WAIT: Duration = Duration::from_secs(10);

async fn serve(certs: &TestCerts) -> QuicServer {
    let demux = Demultiplexer::new();
    demux.add_peer(ReportingPeer::new(None)).await;
    listen_with_users(
        certs.server_config(&[ALPN]).with_datagrams(true),
        vec![demux as Arc<dyn ConnectionHandler>],
    )
    .await
    .unwrap()
}

async fn send(server: &QuicServer, request: ChannelRequest, len: usize) -> serde_json::Value {
    let waiter = AckWaiter::new();
    let conn = connect_with_users(
        TestCerts::client_config(server.local_addr().to_string(), ALPN).with_datagrams(true),
        vec![Arc::clone(&waiter) as Arc<dyn ConnectionHandler>],
    )
    .await
    .unwrap();
    let report = send_on(&conn, &waiter, request, generated_payload(len), WAIT)
        .await
        .unwrap();
    conn.disconnect(true, 0).await.unwrap();
    report
}

#[tokio::test(flavor = "multi_thread")]
async fn bidi_send_is_retired_after_serve_finishes() {
    let certs = TestCerts::new();
    let server = serve(&certs).await;

    let report = send(&server, ChannelRequest::bidi(0), 200_000).await;
    assert_eq!(report["kind"], "bidi");
    assert_eq!(report["stream_id"], 0);
    assert_eq!(report["bytes"], 200_000);
    assert_eq!(report["delivered"], true);
}

#[tokio::test(flavor = "multi_thread")]
async fn uni_send_is_retired_once_acked() {
    let certs = TestCerts::new();
    let server = serve(&certs).await;

    let report = send(&server, ChannelRequest::uni(0), 1000).await;
    assert_eq!(report["kind"], "uni");
    assert_eq!(report["stream_id"], 2);
    assert_eq!(report["delivered"], true);
}

#[tokio::test(flavor = "multi_thread")]
async fn datagram_send_is_chunked() {
    let certs = TestCerts::new();
    let server = serve(&certs).await;

    let len = DATAGRAM_CHUNK * 2 + 10;
    let report = send(&server, ChannelRequest::datagram(0), len).await;
    assert_eq!(report["kind"], "datagram");
    assert!(report["stream_id"].is_null());
    assert_eq!(report["chunks"], 3);
    assert_eq!(report["bytes"], len as u64);
    assert_eq!(report["delivered"], true);
}
