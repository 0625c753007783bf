//! Inbound fan-out of stream and datagram buffers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, trace, warn};

use crate::meta::MetaBuffer;
use crate::transport::{CloseReason, ConnectionHandler, QuicConnection};

use super::probe::{ChannelKind, StreamOpenQuery};

/// A consumer of inbound channels.
#[async_trait]
pub trait DemuxPeer: Send + Sync {
    /// Whether this peer wants the channel described by `query`.
    async fn probe(&self, query: &StreamOpenQuery) -> bool;

    /// Hand over a channel this peer accepted.
    async fn link(&self, channel: InboundChannel);
}

fn same_peer(a: &Arc<dyn DemuxPeer>, b: &Arc<dyn DemuxPeer>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Receiving end of one stream, or of a connection's datagrams.
///
/// Ends after the buffer carrying the end-of-stream flag, or when the
/// stream or connection goes away.
#[derive(Debug)]
pub struct InboundChannel {
    conn: QuicConnection,
    kind: ChannelKind,
    stream_id: Option<u64>,
    rx: mpsc::UnboundedReceiver<MetaBuffer>,
}

impl InboundChannel {
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Stream ID; `None` for the datagram channel.
    pub fn stream_id(&self) -> Option<u64> {
        self.stream_id
    }

    pub fn connection(&self) -> &QuicConnection {
        &self.conn
    }

    /// Next buffer, or `None` once the channel ended.
    pub async fn recv(&mut self) -> Option<MetaBuffer> {
        self.rx.recv().await
    }

    /// Drain the channel into one byte vector.
    pub async fn read_to_end(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(buf) = self.recv().await {
            out.extend_from_slice(&buf.data);
        }
        out
    }
}

enum Route {
    Linked(mpsc::UnboundedSender<MetaBuffer>),
    /// No peer wanted it; buffers are dropped.
    Rejected,
}

#[derive(Default)]
struct DemuxState {
    /// In first-seen order.
    peers: Vec<Arc<dyn DemuxPeer>>,
    /// Keyed by (connection id, stream id).
    streams: HashMap<(u64, u64), Route>,
    /// Keyed by connection id.
    datagrams: HashMap<u64, Route>,
    /// Channels created before any peer registered.
    parked: Vec<InboundChannel>,
}

/// Inbound demultiplexer.
///
/// Register it as a [`ConnectionHandler`] on a connection or server;
/// every stream and the datagram flow of each connection become one
/// [`InboundChannel`] handed to the first peer accepting the probe.
pub struct Demultiplexer {
    state: Mutex<DemuxState>,
    /// Error code used to reset streams no peer accepted.
    reset_code: Option<u64>,
}

impl Default for Demultiplexer {
    fn default() -> Self {
        Self {
            state: Mutex::new(DemuxState::default()),
            reset_code: None,
        }
    }
}

impl Demultiplexer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reset rejected streams with `code` instead of silently dropping them.
    pub fn with_reset_rejected(code: u64) -> Arc<Self> {
        Arc::new(Self {
            reset_code: Some(code),
            ..Self::default()
        })
    }

    /// Register a peer. Returns false if it was already registered.
    ///
    /// The first peer registered also receives every channel opened while
    /// no peer was present.
    pub async fn add_peer(&self, peer: Arc<dyn DemuxPeer>) -> bool {
        let parked = {
            let mut state = self.state.lock().await;
            if state.peers.iter().any(|p| same_peer(p, &peer)) {
                return false;
            }
            state.peers.push(Arc::clone(&peer));
            std::mem::take(&mut state.parked)
        };

        for channel in parked {
            debug!(stream_id = ?channel.stream_id, "linking parked channel to first peer");
            peer.link(channel).await;
        }
        true
    }

    /// Unregister a peer. Returns false if it was not registered.
    pub async fn remove_peer(&self, peer: &Arc<dyn DemuxPeer>) -> bool {
        let mut state = self.state.lock().await;
        let before = state.peers.len();
        state.peers.retain(|p| !same_peer(p, peer));
        state.peers.len() != before
    }

    pub async fn peer_count(&self) -> usize {
        self.state.lock().await.peers.len()
    }

    /// Streams currently routed, accepted or rejected.
    pub async fn stream_count(&self) -> usize {
        self.state.lock().await.streams.len()
    }

    /// Find a consumer for a new channel by probing peers in order.
    async fn open_channel(&self, conn: &QuicConnection, query: StreamOpenQuery) -> Route {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = InboundChannel {
            conn: conn.clone(),
            kind: query.kind,
            stream_id: query.stream_id,
            rx,
        };

        let peers = {
            let mut state = self.state.lock().await;
            if state.peers.is_empty() {
                debug!(conn = conn.id(), stream_id = ?query.stream_id, "no peers yet, parking channel");
                state.parked.push(channel);
                return Route::Linked(tx);
            }
            state.peers.clone()
        };

        for (idx, peer) in peers.iter().enumerate() {
            if peer.probe(&query).await {
                debug!(
                    conn = conn.id(),
                    stream_id = ?query.stream_id,
                    kind = %query.kind,
                    uni_stream_type = ?query.uni_stream_type,
                    peer = idx,
                    "peer accepted channel"
                );
                peer.link(channel).await;
                return Route::Linked(tx);
            }
        }

        info!(
            conn = conn.id(),
            stream_id = ?query.stream_id,
            kind = %query.kind,
            "no peer accepted channel, dropping"
        );
        if let (Some(stream_id), Some(code)) = (query.stream_id, self.reset_code)
            && let Err(e) = conn.close_stream(stream_id, code).await
        {
            debug!(conn = conn.id(), stream_id, error = %e, "failed to reset rejected stream");
        }
        Route::Rejected
    }
}

#[async_trait]
impl ConnectionHandler for Demultiplexer {
    async fn stream_data(&self, conn: &QuicConnection, buf: MetaBuffer) {
        let Some(meta) = buf.stream_meta().copied() else {
            warn!(conn = conn.id(), "stream buffer without metadata");
            return;
        };
        let key = (conn.id(), meta.stream_id);

        {
            let mut state = self.state.lock().await;
            if let Some(route) = state.streams.get(&key) {
                match route {
                    Route::Linked(tx) => {
                        if tx.send(buf).is_err() {
                            trace!(stream_id = meta.stream_id, "channel receiver gone");
                        }
                    }
                    Route::Rejected => {
                        trace!(stream_id = meta.stream_id, len = meta.length, "dropping rejected stream data");
                    }
                }
                if meta.is_final {
                    state.streams.remove(&key);
                }
                return;
            }
        }

        if buf.is_empty() && meta.is_final {
            trace!(conn = conn.id(), stream_id = meta.stream_id, "dropping empty terminator");
            return;
        }

        let query = StreamOpenQuery::for_stream(meta.stream_id, buf.data.clone());
        let route = self.open_channel(conn, query).await;
        if let Route::Linked(tx) = &route {
            let _ = tx.send(buf);
        }
        if !meta.is_final {
            self.state.lock().await.streams.insert(key, route);
        }
    }

    async fn datagram_received(&self, conn: &QuicConnection, buf: MetaBuffer) {
        let key = conn.id();
        {
            let state = self.state.lock().await;
            match state.datagrams.get(&key) {
                Some(Route::Linked(tx)) => {
                    let _ = tx.send(buf);
                    return;
                }
                Some(Route::Rejected) => return,
                None => {}
            }
        }

        let query = StreamOpenQuery::for_datagram(buf.data.clone());
        let route = self.open_channel(conn, query).await;
        if let Route::Linked(tx) = &route {
            let _ = tx.send(buf);
        }
        self.state.lock().await.datagrams.insert(key, route);
    }

    async fn stream_closed(&self, conn: &QuicConnection, stream_id: u64) {
        if self
            .state
            .lock()
            .await
            .streams
            .remove(&(conn.id(), stream_id))
            .is_some()
        {
            trace!(conn = conn.id(), stream_id, "stream retired, channel ended");
        }
    }

    async fn connection_closed(
        &self,
        conn: &QuicConnection,
        _peer: SocketAddr,
        _reason: Option<CloseReason>,
    ) {
        let mut state = self.state.lock().await;
        let id = conn.id();
        state.streams.retain(|(c, _), _| *c != id);
        state.datagrams.remove(&id);
    }
}
