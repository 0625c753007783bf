//! `quicmux send`: write a payload on one multiplexer channel.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use quicmux_core::{
    ChannelKind, ChannelRequest, ConnectionHandler, Error, Multiplexer, QuicConnection, Registry,
    Result, TransportContext,
};

use crate::cli::SendArgs;

/// Largest payload put in a single datagram.
pub const DATAGRAM_CHUNK: usize = 1200;

/// Largest buffer handed to a stream channel at once.
const STREAM_CHUNK: usize = 64 * 1024;

#[derive(Default)]
struct AckState {
    closed_streams: HashSet<u64>,
    datagrams_ackd: u64,
    connection_closed: bool,
}

/// Tracks stream retirement and datagram acknowledgements.
#[derive(Default)]
pub struct AckWaiter {
    state: Mutex<AckState>,
    changed: Notify,
}

impl AckWaiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait until `stream_id` retired or the connection closed.
    /// Returns true if the stream retired.
    pub async fn stream_done(&self, stream_id: u64) -> bool {
        self.wait(|s| s.closed_streams.contains(&stream_id))
            .await
            .closed_streams
            .contains(&stream_id)
    }

    /// Wait until `count` datagrams were acknowledged or the connection
    /// closed. Returns the number acknowledged.
    pub async fn datagrams_done(&self, count: u64) -> u64 {
        self.wait(|s| s.datagrams_ackd >= count).await.datagrams_ackd
    }

    async fn wait(&self, done: impl Fn(&AckState) -> bool) -> AckSnapshot {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock().await;
                if done(&state) || state.connection_closed {
                    return AckSnapshot {
                        closed_streams: state.closed_streams.clone(),
                        datagrams_ackd: state.datagrams_ackd,
                    };
                }
            }
            notified.await;
        }
    }

    async fn update(&self, f: impl FnOnce(&mut AckState)) {
        f(&mut *self.state.lock().await);
        self.changed.notify_waiters();
    }
}

struct AckSnapshot {
    closed_streams: HashSet<u64>,
    datagrams_ackd: u64,
}

#[async_trait]
impl ConnectionHandler for AckWaiter {
    async fn datagram_ackd(&self, _conn: &QuicConnection, ticket: u64, _data: Bytes) {
        debug!(ticket, "datagram acknowledged");
        self.update(|s| s.datagrams_ackd += 1).await;
    }

    async fn stream_closed(&self, _conn: &QuicConnection, stream_id: u64) {
        debug!(stream_id, "stream retired");
        self.update(|s| {
            s.closed_streams.insert(stream_id);
        })
        .await;
    }

    async fn connection_closed(
        &self,
        _conn: &QuicConnection,
        peer: std::net::SocketAddr,
        reason: Option<quicmux_core::transport::CloseReason>,
    ) {
        match &reason {
            Some(reason) if !reason.is_graceful() => warn!(%peer, %reason, "connection closed"),
            _ => debug!(%peer, "connection closed"),
        }
        self.update(|s| s.connection_closed = true).await;
    }
}

/// Payload to send: the file contents or `n` generated bytes.
pub async fn load_payload(args: &SendArgs) -> Result<Bytes> {
    match &args.file {
        Some(path) => Ok(Bytes::from(tokio::fs::read(path).await?)),
        None => Ok(generated_payload(args.bytes)),
    }
}

/// `len` bytes counting up from zero, wrapping at 256.
pub fn generated_payload(len: usize) -> Bytes {
    (0..len).map(|i| i as u8).collect::<Vec<u8>>().into()
}

fn request_for(args: &SendArgs) -> ChannelRequest {
    if args.datagram {
        ChannelRequest::datagram(0)
    } else if args.uni {
        ChannelRequest::uni(0)
    } else {
        ChannelRequest::bidi(0)
    }
}

fn timed_out(what: &str) -> Error {
    Error::Generic {
        message: format!("timed out waiting for {what}"),
    }
}

pub async fn run(args: &SendArgs) -> Result<()> {
    let payload = load_payload(args).await?;
    let config = args.config()?;
    let timeout = args.timeout();

    let waiter = AckWaiter::new();
    let user: Arc<dyn ConnectionHandler> = waiter.clone();
    let conn = Registry::global()
        .get_or_create_client(Arc::clone(&user), config)
        .await?;

    let result = send_on(&conn, &waiter, request_for(args), payload, timeout).await;

    Registry::global()
        .release(&TransportContext::Client(conn), &user)
        .await;

    let report = result?;
    println!("{report}");
    Ok(())
}

/// Send `payload` on a fresh channel of `conn` and wait for delivery.
///
/// Returns a JSON summary of the transfer.
pub async fn send_on(
    conn: &QuicConnection,
    waiter: &AckWaiter,
    request: ChannelRequest,
    payload: Bytes,
    timeout: Duration,
) -> Result<serde_json::Value> {
    let started = Instant::now();
    let mux = Multiplexer::attach(conn);
    let result = async {
        let channel = mux.request_channel(request).await?;
        let stream_id = tokio::time::timeout(timeout, channel.ready())
            .await
            .map_err(|_| timed_out("the channel to open"))??;
        info!(conn = conn.id(), kind = %channel.kind(), ?stream_id, len = payload.len(), "sending");

        let (chunks, delivered) = if channel.kind() == ChannelKind::Datagram {
            // Datagram channels are usable at once but the extension is only
            // negotiated by the handshake.
            tokio::time::timeout(timeout, conn.wait_established())
                .await
                .map_err(|_| timed_out("the handshake"))??;
            let mut sent = 0u64;
            for chunk in payload.chunks(DATAGRAM_CHUNK) {
                channel.write_bytes(payload.slice_ref(chunk)).await?;
                sent += 1;
            }
            let ackd = tokio::time::timeout(timeout, waiter.datagrams_done(sent))
                .await
                .map_err(|_| timed_out("datagram acknowledgements"))?;
            (sent, ackd == sent)
        } else {
            let mut sent = 0u64;
            for chunk in payload.chunks(STREAM_CHUNK) {
                channel.write_bytes(payload.slice_ref(chunk)).await?;
                sent += 1;
            }
            channel.finish().await?;
            let retired = match stream_id {
                Some(id) => tokio::time::timeout(timeout, waiter.stream_done(id))
                    .await
                    .map_err(|_| timed_out("the stream to retire"))?,
                None => false,
            };
            (sent, retired)
        };

        Ok(json!({
            "conn": conn.id(),
            "peer": conn.peer_addr().to_string(),
            "alpn": conn.alpn(),
            "kind": channel.kind().to_string(),
            "stream_id": stream_id,
            "bytes": channel.offset(),
            "chunks": chunks,
            "delivered": delivered,
            "elapsed_ms": started.elapsed().as_millis() as u64,
        }))
    }
    .await;
    mux.detach();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Command};
    use clap::Parser;

    fn send_args(argv: &[&str]) -> SendArgs {
        let mut full = vec!["quicmux", "send", "-l", "127.0.0.1:4433"];
        full.extend_from_slice(argv);
        match Cli::parse_from(full).command {
            Command::Send(args) => args,
            Command::Serve(_) => panic!("expected send"),
        }
    }

    #[test]
    fn generated_payload_wraps() {
        let payload = generated_payload(300);
        assert_eq!(payload.len(), 300);
        assert_eq!(payload[255], 255);
        assert_eq!(payload[256], 0);
    }

    #[test]
    fn request_kind_follows_flags() {
        assert_eq!(request_for(&send_args(&[])).kind, ChannelKind::Bidi);
        assert_eq!(request_for(&send_args(&["--uni"])).kind, ChannelKind::Uni);
        assert_eq!(
            request_for(&send_args(&["--datagram"])).kind,
            ChannelKind::Datagram
        );
    }

    #[tokio::test]
    async fn payload_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, b"hello quic").await.unwrap();
        let args = send_args(&["--file", path.to_str().unwrap()]);
        assert_eq!(&load_payload(&args).await.unwrap()[..], b"hello quic");
    }

    #[tokio::test]
    async fn waiter_returns_on_connection_close() {
        let waiter = AckWaiter::new();
        let wait = {
            let waiter = Arc::clone(&waiter);
            tokio::spawn(async move { waiter.stream_done(0).await })
        };
        waiter.update(|s| s.connection_closed = true).await;
        assert!(!wait.await.unwrap());
    }

    #[tokio::test]
    async fn waiter_sees_datagram_acks() {
        let waiter = AckWaiter::new();
        waiter.update(|s| s.datagrams_ackd += 2).await;
        assert_eq!(waiter.datagrams_done(2).await, 2);
    }
}
