//! Outbound fan-in: per-channel writers onto QUIC streams and datagrams.

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{Mutex, watch};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::meta::{MetaBuffer, StreamMeta};
use crate::transport::events::lock;
use crate::transport::{CloseReason, ConnectionHandler, QuicConnection, StreamState};

use super::probe::ChannelKind;

// =============================================================================
// Channel requests
// =============================================================================

/// Request for an outbound channel, e.g. `sink_bidi_local_0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRequest {
    pub kind: ChannelKind,
    pub index: u32,
    /// Attach to this existing stream instead of opening one.
    pub stream_id: Option<u64>,
}

impl ChannelRequest {
    pub fn bidi(index: u32) -> Self {
        Self {
            kind: ChannelKind::Bidi,
            index,
            stream_id: None,
        }
    }

    pub fn uni(index: u32) -> Self {
        Self {
            kind: ChannelKind::Uni,
            index,
            stream_id: None,
        }
    }

    pub fn datagram(index: u32) -> Self {
        Self {
            kind: ChannelKind::Datagram,
            index,
            stream_id: None,
        }
    }

    pub fn with_stream_id(mut self, stream_id: u64) -> Self {
        self.stream_id = Some(stream_id);
        self
    }
}

impl FromStr for ChannelRequest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.strip_prefix("sink_").unwrap_or(s);
        let (kind, index) = if let Some(index) = name.strip_prefix("bidi_local_") {
            (ChannelKind::Bidi, index)
        } else if let Some(index) = name.strip_prefix("uni_local_") {
            (ChannelKind::Uni, index)
        } else if let Some(index) = name.strip_prefix("datagram_") {
            (ChannelKind::Datagram, index)
        } else {
            return Err(Error::Channel {
                message: format!("unknown channel name {:?}", s),
            });
        };
        let index = index.parse().map_err(|_| Error::Channel {
            message: format!("bad channel index in {:?}", s),
        })?;
        Ok(Self {
            kind,
            index,
            stream_id: None,
        })
    }
}

// =============================================================================
// Outbound channels
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    /// Stream open deferred until handshake or stream credit.
    Waiting,
    Assigned(u64),
    Datagram,
    Failed(String),
    Closed,
}

struct ChannelShared {
    kind: ChannelKind,
    index: u32,
    slot: watch::Sender<Slot>,
    /// Bytes accepted by the engine so far; the offset of the next buffer.
    offset: StdMutex<u64>,
    /// Held for the whole of one write so clones never interleave.
    writer: Mutex<()>,
}

impl ChannelShared {
    fn set(&self, slot: Slot) {
        self.slot.send_replace(slot);
    }

    fn current(&self) -> Slot {
        self.slot.borrow().clone()
    }
}

/// Writing end of one outbound stream or of the datagram flow.
#[derive(Clone)]
pub struct OutboundChannel {
    conn: QuicConnection,
    shared: Arc<ChannelShared>,
    mux: Weak<Multiplexer>,
}

impl std::fmt::Debug for OutboundChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundChannel")
            .field("kind", &self.shared.kind)
            .field("index", &self.shared.index)
            .field("slot", &self.shared.current())
            .finish()
    }
}

impl OutboundChannel {
    pub fn kind(&self) -> ChannelKind {
        self.shared.kind
    }

    pub fn index(&self) -> u32 {
        self.shared.index
    }

    /// Assigned stream ID, if any yet.
    pub fn stream_id(&self) -> Option<u64> {
        match self.shared.current() {
            Slot::Assigned(id) => Some(id),
            _ => None,
        }
    }

    /// True while the stream open is deferred.
    pub fn is_waiting(&self) -> bool {
        self.shared.current() == Slot::Waiting
    }

    /// Bytes the engine accepted on this channel so far.
    pub fn offset(&self) -> u64 {
        *lock(&self.shared.offset)
    }

    /// Wait until the channel is usable.
    ///
    /// Returns the stream ID, or `None` for a datagram channel.
    pub async fn ready(&self) -> Result<Option<u64>> {
        let mut rx = self.shared.slot.subscribe();
        let slot = rx
            .wait_for(|s| *s != Slot::Waiting)
            .await
            .map_err(|_| Error::internal("channel state dropped"))?
            .clone();
        match slot {
            Slot::Assigned(id) => Ok(Some(id)),
            Slot::Datagram => Ok(None),
            Slot::Failed(message) => Err(Error::Channel { message }),
            Slot::Closed => Err(Error::Channel {
                message: "channel closed".to_string(),
            }),
            Slot::Waiting => Err(Error::internal("channel still waiting")),
        }
    }

    /// Write one buffer, waiting for the stream to be opened first.
    ///
    /// A buffer without stream metadata gets one attached at the channel's
    /// current offset, final if the buffer is flagged `last`. A buffer
    /// carrying metadata must match this channel's stream and offset.
    /// Concurrent writes through clones of the channel are applied one
    /// after the other.
    pub async fn write(&self, buf: MetaBuffer) -> Result<()> {
        let stream_id = self.ready().await?;
        let _writer = self.shared.writer.lock().await;
        let Some(stream_id) = stream_id else {
            return self.write_datagram(buf.data).await;
        };

        let offset = self.offset();
        let len = buf.len() as u64;
        let meta = match buf.stream_meta() {
            Some(meta) => {
                check_meta(meta, stream_id, offset, len)?;
                *meta
            }
            None => StreamMeta::new(stream_id, offset, len, buf.last)?,
        };
        trace!(
            stream_id,
            offset = meta.offset,
            len = meta.length,
            fin = meta.is_final,
            "channel write"
        );

        self.send_all(stream_id, buf.data, meta.is_final).await
    }

    /// Write the bytes without an end-of-stream flag.
    pub async fn write_bytes(&self, data: impl Into<Bytes>) -> Result<()> {
        self.write(MetaBuffer::new(data)).await
    }

    /// End the stream after everything written so far.
    pub async fn finish(&self) -> Result<()> {
        self.write(MetaBuffer::last(Bytes::new())).await
    }

    /// Detach the channel, resetting its stream with `code` if one is
    /// mapped. Code 0 ends the stream gracefully.
    pub async fn close(&self, code: u64) -> Result<()> {
        let previous = self.shared.slot.send_replace(Slot::Closed);
        if let Some(mux) = self.mux.upgrade() {
            mux.unstash(&self.shared).await;
        }

        match previous {
            Slot::Assigned(stream_id) => {
                debug!(stream_id, code, "closing channel stream");
                match self.conn.close_stream(stream_id, code).await {
                    Ok(()) | Err(Error::StreamClosed(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            _ => Ok(()),
        }
    }

    /// Push `data` until the engine accepted all of it, advancing the
    /// channel offset by what each call took. Caller holds the writer lock.
    async fn send_all(&self, stream_id: u64, mut data: Bytes, fin: bool) -> Result<()> {
        loop {
            match self.conn.send_stream(stream_id, data.clone(), fin).await {
                Ok(n) => {
                    *lock(&self.shared.offset) += n as u64;
                    if n == data.len() {
                        return Ok(());
                    }
                    data = data.slice(n..);
                }
                Err(e) if e.is_retryable() => {
                    trace!(stream_id, remaining = data.len(), error = %e, "stream blocked, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn write_datagram(&self, data: Bytes) -> Result<()> {
        let len = data.len();
        let ticket = self.conn.send_datagram(data).await?;
        if !ticket.accepted {
            debug!(ticket = ticket.id, len, "datagram dropped, send queue full");
        }
        *lock(&self.shared.offset) += len as u64;
        Ok(())
    }
}

/// Metadata supplied with a buffer must continue this channel's stream.
fn check_meta(meta: &StreamMeta, stream_id: u64, offset: u64, len: u64) -> Result<()> {
    if meta.stream_id != stream_id {
        return Err(Error::Channel {
            message: format!(
                "buffer for stream {} written to channel on stream {}",
                meta.stream_id, stream_id
            ),
        });
    }
    if meta.offset != offset {
        return Err(Error::Channel {
            message: format!(
                "buffer at offset {} does not follow channel offset {}",
                meta.offset, offset
            ),
        });
    }
    if meta.length != len {
        return Err(Error::Channel {
            message: format!("metadata length {} for a buffer of {} bytes", meta.length, len),
        });
    }
    Ok(())
}

// =============================================================================
// Multiplexer
// =============================================================================

/// Outbound multiplexer for one connection.
///
/// Stream opens requested before the handshake completes, or while the
/// peer's stream limit is exhausted, are stashed and retried in request
/// order when the handshake completes or the peer grants more streams.
pub struct Multiplexer {
    conn: QuicConnection,
    /// Deferred opens in request order.
    stash: Mutex<Vec<Arc<ChannelShared>>>,
    this: Weak<Multiplexer>,
}

impl Multiplexer {
    /// Create a multiplexer and register it on `conn`.
    pub fn attach(conn: &QuicConnection) -> Arc<Self> {
        let mux = Arc::new_cyclic(|this| Multiplexer {
            conn: conn.clone(),
            stash: Mutex::new(Vec::new()),
            this: this.clone(),
        });
        conn.add_user(Arc::clone(&mux) as Arc<dyn ConnectionHandler>);
        mux
    }

    /// Unregister from the connection.
    pub fn detach(self: &Arc<Self>) {
        let user: Arc<dyn ConnectionHandler> = Arc::clone(self) as Arc<dyn ConnectionHandler>;
        self.conn.remove_user(&user);
    }

    pub fn connection(&self) -> &QuicConnection {
        &self.conn
    }

    /// Number of deferred stream opens.
    pub async fn stashed(&self) -> usize {
        self.stash.lock().await.len()
    }

    /// Parse `name` (e.g. `sink_uni_local_1`) and request that channel.
    pub async fn request_named(&self, name: &str) -> Result<OutboundChannel> {
        self.request_channel(name.parse()?).await
    }

    /// Create an outbound channel.
    ///
    /// The channel is returned even if its stream cannot be opened yet;
    /// writes then wait until the deferred open succeeds.
    pub async fn request_channel(&self, request: ChannelRequest) -> Result<OutboundChannel> {
        let (slot, _) = watch::channel(Slot::Waiting);
        let shared = Arc::new(ChannelShared {
            kind: request.kind,
            index: request.index,
            slot,
            offset: StdMutex::new(0),
            writer: Mutex::new(()),
        });
        let channel = OutboundChannel {
            conn: self.conn.clone(),
            shared: Arc::clone(&shared),
            mux: self.this.clone(),
        };

        if request.kind == ChannelKind::Datagram {
            shared.set(Slot::Datagram);
            return Ok(channel);
        }

        if let Some(stream_id) = request.stream_id {
            let state = self.conn.stream_state(stream_id).await;
            if !state.contains(StreamState::OPEN) || state.contains(StreamState::CLOSED_SENDING) {
                return Err(Error::Channel {
                    message: format!("stream {} is not writable ({})", stream_id, state),
                });
            }
            debug!(stream_id, "channel attached to existing stream");
            shared.set(Slot::Assigned(stream_id));
            return Ok(channel);
        }

        let mut stash = self.stash.lock().await;
        let bidi = request.kind == ChannelKind::Bidi;
        if !stash.is_empty() {
            // Keep request order behind earlier deferred opens.
            debug!(kind = %request.kind, index = request.index, "deferring stream open behind stash");
            stash.push(shared);
            return Ok(channel);
        }
        match self.conn.open_stream(bidi).await {
            Ok(stream_id) => {
                debug!(stream_id, kind = %request.kind, index = request.index, "channel opened stream");
                shared.set(Slot::Assigned(stream_id));
            }
            Err(Error::StreamIdBlocked | Error::HandshakeIncomplete) => {
                debug!(kind = %request.kind, index = request.index, "deferring stream open");
                stash.push(shared);
            }
            Err(e) => return Err(e),
        }
        Ok(channel)
    }

    /// Retry deferred opens in order until one is blocked again.
    async fn retry_stash(&self) {
        let mut stash = self.stash.lock().await;
        while let Some(shared) = stash.first().cloned() {
            if shared.current() != Slot::Waiting {
                stash.remove(0);
                continue;
            }
            match self.conn.open_stream(shared.kind == ChannelKind::Bidi).await {
                Ok(stream_id) => {
                    debug!(stream_id, index = shared.index, "deferred stream open resolved");
                    shared.set(Slot::Assigned(stream_id));
                    stash.remove(0);
                }
                Err(Error::StreamIdBlocked | Error::HandshakeIncomplete) => {
                    trace!(pending = stash.len(), "deferred opens still blocked");
                    break;
                }
                Err(e) => {
                    warn!(index = shared.index, error = %e, "deferred stream open failed");
                    shared.set(Slot::Failed(e.to_string()));
                    stash.remove(0);
                }
            }
        }
    }

    async fn unstash(&self, shared: &Arc<ChannelShared>) {
        let mut stash = self.stash.lock().await;
        if let Some(pos) = stash.iter().position(|s| Arc::ptr_eq(s, shared)) {
            stash.remove(pos);
        }
    }

    async fn fail_stash(&self, message: &str) {
        let mut stash = self.stash.lock().await;
        for shared in stash.drain(..) {
            shared.set(Slot::Failed(message.to_string()));
        }
    }
}

#[async_trait]
impl ConnectionHandler for Multiplexer {
    async fn handshake_complete(&self, _conn: &QuicConnection) -> bool {
        self.retry_stash().await;
        true
    }

    async fn streams_available(&self, _conn: &QuicConnection, _bidi: bool) {
        self.retry_stash().await;
    }

    async fn connection_closed(
        &self,
        _conn: &QuicConnection,
        _peer: SocketAddr,
        _reason: Option<CloseReason>,
    ) {
        self.fail_stash("connection closed").await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_channel_names() {
        let req: ChannelRequest = "sink_bidi_local_0".parse().unwrap();
        assert_eq!(req, ChannelRequest::bidi(0));

        let req: ChannelRequest = "uni_local_7".parse().unwrap();
        assert_eq!(req, ChannelRequest::uni(7));

        let req: ChannelRequest = "sink_datagram_2".parse().unwrap();
        assert_eq!(req, ChannelRequest::datagram(2));
    }

    #[test]
    fn rejects_bad_channel_names() {
        assert!("sink_bidi_remote_0".parse::<ChannelRequest>().is_err());
        assert!("sink_bidi_local_x".parse::<ChannelRequest>().is_err());
        assert!("".parse::<ChannelRequest>().is_err());
    }

    #[test]
    fn supplied_meta_must_continue_the_channel() {
        let meta = StreamMeta::new(4, 10, 5, false).unwrap();
        assert!(check_meta(&meta, 4, 10, 5).is_ok());

        let wrong_stream = check_meta(&meta, 0, 10, 5).unwrap_err();
        assert!(matches!(wrong_stream, Error::Channel { .. }), "{wrong_stream}");

        let gap = check_meta(&meta, 4, 7, 5).unwrap_err();
        assert!(matches!(gap, Error::Channel { .. }), "{gap}");

        let short = check_meta(&meta, 4, 10, 3).unwrap_err();
        assert!(matches!(short, Error::Channel { .. }), "{short}");
    }

    #[test]
    fn stream_id_override() {
        let req = ChannelRequest::bidi(1).with_stream_id(5);
        assert_eq!(req.stream_id, Some(5));
        assert_eq!(req.kind, ChannelKind::Bidi);
    }
}
