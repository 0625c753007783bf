//! Connection handler recording every event for assertions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, Notify};

use quicmux_core::transport::CloseReason;
use quicmux_core::{ConnectionHandler, MetaBuffer, QuicConnection, StreamMeta};

use crate::TEST_TIMEOUT;

/// One recorded callback.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    NewConnection { conn: u64 },
    HandshakeComplete { conn: u64 },
    StreamOpened { conn: u64, stream_id: u64 },
    StreamData { conn: u64, meta: StreamMeta, data: Bytes },
    Datagram { conn: u64, data: Bytes },
    StreamAckd { conn: u64, stream_id: u64, offset: u64, data: Bytes },
    DatagramAckd { conn: u64, ticket: u64, data: Bytes },
    StreamClosed { conn: u64, stream_id: u64 },
    StreamsAvailable { conn: u64, bidi: bool },
    ConnectionClosed { conn: u64, peer: SocketAddr, reason: Option<CloseReason> },
}

/// Records events in delivery order and lets tests wait for them.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
    connections: Mutex<Vec<QuicConnection>>,
    changed: Notify,
    refuse: AtomicBool,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A handler that refuses every handshake.
    pub fn refusing() -> Arc<Self> {
        let handler = Self::default();
        handler.refuse.store(true, Ordering::SeqCst);
        Arc::new(handler)
    }

    pub fn handler(self: &Arc<Self>) -> Arc<dyn ConnectionHandler> {
        Arc::clone(self) as Arc<dyn ConnectionHandler>
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Connections seen through `new_connection` or `handshake_complete`.
    pub async fn connections(&self) -> Vec<QuicConnection> {
        self.connections.lock().await.clone()
    }

    /// Count events matching `pred`.
    pub async fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().await.iter().filter(|e| pred(e)).count()
    }

    /// Wait until `n` events match `pred` and return them.
    ///
    /// Panics after [`TEST_TIMEOUT`].
    pub async fn wait_for_n(&self, n: usize, pred: impl Fn(&Event) -> bool) -> Vec<Event> {
        let wait = async {
            loop {
                let notified = self.changed.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let events = self.events.lock().await;
                    let matched: Vec<Event> =
                        events.iter().filter(|e| pred(e)).cloned().collect();
                    if matched.len() >= n {
                        return matched;
                    }
                }
                notified.await;
            }
        };
        tokio::time::timeout(TEST_TIMEOUT, wait)
            .await
            .expect("timed out waiting for events")
    }

    /// Wait for the first event matching `pred`.
    pub async fn wait_for(&self, pred: impl Fn(&Event) -> bool) -> Event {
        self.wait_for_n(1, pred).await.remove(0)
    }

    /// Wait for a connection to appear and return it.
    pub async fn wait_connection(&self) -> QuicConnection {
        self.wait_for(|e| {
            matches!(
                e,
                Event::NewConnection { .. } | Event::HandshakeComplete { .. }
            )
        })
        .await;
        self.connections.lock().await[0].clone()
    }

    /// Concatenated payload received on `stream_id`.
    pub async fn stream_bytes(&self, stream_id: u64) -> Vec<u8> {
        let mut out = Vec::new();
        for event in self.events.lock().await.iter() {
            if let Event::StreamData { meta, data, .. } = event
                && meta.stream_id == stream_id
            {
                out.extend_from_slice(data);
            }
        }
        out
    }

    /// Stream metadata received on `stream_id`, in order.
    pub async fn stream_metas(&self, stream_id: u64) -> Vec<StreamMeta> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|e| match e {
                Event::StreamData { meta, .. } if meta.stream_id == stream_id => Some(*meta),
                _ => None,
            })
            .collect()
    }

    async fn record(&self, event: Event) {
        self.events.lock().await.push(event);
        self.changed.notify_waiters();
    }

    async fn remember(&self, conn: &QuicConnection) {
        let mut connections = self.connections.lock().await;
        if !connections.contains(conn) {
            connections.push(conn.clone());
        }
    }
}

#[async_trait]
impl ConnectionHandler for RecordingHandler {
    async fn new_connection(&self, conn: &QuicConnection) {
        self.remember(conn).await;
        self.record(Event::NewConnection { conn: conn.id() }).await;
    }

    async fn handshake_complete(&self, conn: &QuicConnection) -> bool {
        self.remember(conn).await;
        self.record(Event::HandshakeComplete { conn: conn.id() }).await;
        !self.refuse.load(Ordering::SeqCst)
    }

    async fn stream_opened(&self, conn: &QuicConnection, stream_id: u64) {
        self.record(Event::StreamOpened {
            conn: conn.id(),
            stream_id,
        })
        .await;
    }

    async fn stream_data(&self, conn: &QuicConnection, buf: MetaBuffer) {
        let Some(meta) = buf.stream_meta().copied() else {
            return;
        };
        self.record(Event::StreamData {
            conn: conn.id(),
            meta,
            data: buf.data,
        })
        .await;
    }

    async fn datagram_received(&self, conn: &QuicConnection, buf: MetaBuffer) {
        self.record(Event::Datagram {
            conn: conn.id(),
            data: buf.data,
        })
        .await;
    }

    async fn stream_ackd(&self, conn: &QuicConnection, stream_id: u64, offset: u64, data: Bytes) {
        self.record(Event::StreamAckd {
            conn: conn.id(),
            stream_id,
            offset,
            data,
        })
        .await;
    }

    async fn datagram_ackd(&self, conn: &QuicConnection, ticket: u64, data: Bytes) {
        self.record(Event::DatagramAckd {
            conn: conn.id(),
            ticket,
            data,
        })
        .await;
    }

    async fn stream_closed(&self, conn: &QuicConnection, stream_id: u64) {
        self.record(Event::StreamClosed {
            conn: conn.id(),
            stream_id,
        })
        .await;
    }

    async fn streams_available(&self, conn: &QuicConnection, bidi: bool) {
        self.record(Event::StreamsAvailable {
            conn: conn.id(),
            bidi,
        })
        .await;
    }

    async fn connection_closed(
        &self,
        conn: &QuicConnection,
        peer: SocketAddr,
        reason: Option<CloseReason>,
    ) {
        self.record(Event::ConnectionClosed {
            conn: conn.id(),
            peer,
            reason,
        })
        .await;
    }
}
