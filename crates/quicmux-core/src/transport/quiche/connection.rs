//! QUIC connection engine for the quiche backend.
//!
//! This module provides:
//! - ConnectionInner: shared connection state (library handle, streams,
//!   datagram tickets, consumers)
//! - QuicConnection: the cloneable public handle
//! - The driver task that feeds packets and timers to quiche and turns its
//!   state into consumer notifications

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{Mutex, Notify, mpsc, watch};
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::constants::{
    CRYPTO_ERROR_BASE, DEFAULT_MAX_ACK_DELAY, DEFAULT_STREAM_URGENCY, DRAIN_PTO_MULTIPLIER,
    INITIAL_RTT, MAX_UDP_PACKET, SEND_CREDIT_WAIT, STREAM_READ_CHUNK, TIMER_GRANULARITY,
};
use crate::error::{Error, Result};
use crate::meta::{MetaBuffer, StreamMeta, StreamType};
use crate::transport::ack::{AckTracker, DatagramTracker};
use crate::transport::common::is_icmp_error;
use crate::transport::events::{
    CloseReason, ConnectionHandler, HandlerList, Notification, lock, run_notifier,
};
use crate::transport::stats::ConnectionStats;
use crate::transport::{
    ConnectionState, DatagramTicket, EndpointRole, StreamState, TransportConfig, TransportParams,
};

use super::server::ServerInner;
use super::socket::{InboundPacket, QuicSocket};

/// Maximum packets fed to quiche per driver wakeup.
const RECV_BATCH: usize = 64;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

// =============================================================================
// Error mapping
// =============================================================================

/// Map a quiche error on `stream_id` to the engine's error taxonomy.
pub(crate) fn map_quiche_error(e: quiche::Error, stream_id: u64) -> Error {
    match e {
        quiche::Error::StreamLimit => Error::StreamIdBlocked,
        quiche::Error::FlowControl => Error::StreamDataBlocked(stream_id),
        quiche::Error::InvalidStreamState(id) => Error::StreamClosed(id),
        quiche::Error::StreamStopped(_)
        | quiche::Error::StreamReset(_)
        | quiche::Error::FinalSize => Error::StreamClosed(stream_id),
        quiche::Error::CryptoFail | quiche::Error::TlsFail => Error::Tls {
            message: e.to_string(),
        },
        other => Error::Transport {
            message: other.to_string(),
        },
    }
}

// =============================================================================
// Stream context
// =============================================================================

#[derive(Debug)]
struct StreamCtx {
    state: StreamState,
    /// Bytes handed to quiche so far.
    send_offset: u64,
    /// Bytes delivered to consumers so far.
    recv_offset: u64,
    in_flight: AckTracker,
    /// Set once the send side was reset; in-flight data is never acknowledged.
    reset: bool,
}

impl StreamCtx {
    fn new(stream_id: u64, role: EndpointRole) -> Self {
        let stream_type = StreamType::from_id(stream_id);
        let mut state = StreamState::OPEN;
        if stream_type.is_uni() {
            if stream_type.is_local(role) {
                state |= StreamState::CLOSED_READING;
            } else {
                state |= StreamState::CLOSED_SENDING;
            }
        }
        Self {
            state,
            send_offset: 0,
            recv_offset: 0,
            in_flight: AckTracker::new(),
            reset: false,
        }
    }
}

// =============================================================================
// ConnectionInner
// =============================================================================

/// quiche handle plus the scratch buffers used under the same lock.
pub(crate) struct QuicState {
    pub(crate) quic: quiche::Connection,
    out: Vec<u8>,
    scratch: Vec<u8>,
}

impl QuicState {
    pub(crate) fn new(quic: quiche::Connection) -> Self {
        Self {
            quic,
            out: vec![0u8; MAX_UDP_PACKET],
            scratch: vec![0u8; STREAM_READ_CHUNK.max(MAX_UDP_PACKET)],
        }
    }
}

/// Everything needed to create a connection engine.
pub(crate) struct ConnectionParts {
    pub role: EndpointRole,
    pub location: String,
    pub quic: quiche::Connection,
    pub socket: Arc<QuicSocket>,
    pub peer_addr: SocketAddr,
    pub config: TransportConfig,
    pub cids: Vec<Vec<u8>>,
    pub initial_state: ConnectionState,
    pub server: Option<Weak<ServerInner>>,
}

/// Shared connection state.
pub(crate) struct ConnectionInner {
    serial: u64,
    role: EndpointRole,
    location: String,
    state: watch::Sender<ConnectionState>,
    /// The quiche connection; the only async lock on the connection.
    quic: Mutex<QuicState>,
    socket: Arc<QuicSocket>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    local_params: TransportParams,
    datagrams_enabled: bool,
    remote_params: StdMutex<Option<TransportParams>>,
    alpn: StdMutex<Option<String>>,
    cids: StdMutex<Vec<Vec<u8>>>,
    streams: StdMutex<BTreeMap<u64, StreamCtx>>,
    next_bidi: AtomicU64,
    next_uni: AtomicU64,
    /// Last seen (bidi, uni) peer stream credit.
    streams_left: StdMutex<(u64, u64)>,
    datagrams: StdMutex<DatagramTracker>,
    users: HandlerList,
    notify_tx: mpsc::UnboundedSender<Notification>,
    /// Signalled whenever send credit may have grown.
    send_credit: Notify,
    /// Wakes the driver after a caller queued work.
    wake: Notify,
    closed_notified: AtomicBool,
    drain_deadline: StdMutex<Option<Instant>>,
    stats: ConnectionStats,
    reader: StdMutex<Option<AbortHandle>>,
    server: Option<Weak<ServerInner>>,
}

impl ConnectionInner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Move to `next` if that is a forward transition.
    fn set_state(&self, next: ConnectionState) -> bool {
        let changed = self.state.send_if_modified(|current| {
            if *current != next && current.can_advance_to(next) {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed {
            debug!(conn = self.serial, state = %next, "connection state");
        }
        changed
    }

    fn dispatch(&self, notes: Vec<Notification>) {
        for note in notes {
            // The notifier only goes away after Shutdown.
            let _ = self.notify_tx.send(note);
        }
    }

    /// Send every packet quiche has ready.
    ///
    /// Datagrams leaving the library's send queue are reported as
    /// delivered through the returned notifications.
    async fn flush(&self, st: &mut QuicState) -> Vec<Notification> {
        let queued_before = st.quic.dgram_send_queue_len();

        loop {
            let (written, send_info) = match st.quic.send(&mut st.out) {
                Ok(v) => v,
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    debug!(conn = self.serial, error = %e, "quiche send failed");
                    break;
                }
            };

            match self.socket.send_to(&st.out[..written], send_info.to).await {
                Ok(_) => self.stats.record_send(written, Instant::now()),
                Err(e) if is_icmp_error(&e) => {
                    debug!(conn = self.serial, error = %e, "ICMP error on send");
                }
                Err(e) => {
                    warn!(conn = self.serial, error = %e, to = %send_info.to, "udp send failed");
                    break;
                }
            }
        }

        let sent = queued_before.saturating_sub(st.quic.dgram_send_queue_len());
        if sent == 0 {
            return Vec::new();
        }
        lock(&self.datagrams)
            .release_oldest(sent)
            .into_iter()
            .map(|(ticket, data)| Notification::DatagramAckd { ticket, data })
            .collect()
    }

    /// Probe timeout of the active path.
    fn pto(quic: &quiche::Connection) -> Duration {
        let active = quic
            .path_stats()
            .find(|p| p.active)
            .or_else(|| quic.path_stats().next());
        match active {
            Some(path) => {
                path.rtt + (path.rttvar * 4).max(TIMER_GRANULARITY) + DEFAULT_MAX_ACK_DELAY
            }
            None => INITIAL_RTT + INITIAL_RTT * 2 + DEFAULT_MAX_ACK_DELAY,
        }
    }

    /// Enter half-closed and arm the drain timer.
    fn begin_close(&self, quic: &quiche::Connection, drain: Option<Duration>) {
        if self.set_state(ConnectionState::HalfClosed) {
            let drain = drain.unwrap_or_else(|| Self::pto(quic) * DRAIN_PTO_MULTIPLIER);
            *lock(&self.drain_deadline) = Some(Instant::now() + drain);
            debug!(conn = self.serial, drain_ms = drain.as_millis() as u64, "draining");
        }
        self.send_credit.notify_waiters();
    }

    fn close_reason(quic: &quiche::Connection) -> Option<CloseReason> {
        if let Some(e) = quic.peer_error() {
            Some(CloseReason::from_quiche(e, true))
        } else if let Some(e) = quic.local_error() {
            Some(CloseReason::from_quiche(e, false))
        } else if quic.is_timed_out() {
            Some(CloseReason::idle_timeout())
        } else {
            None
        }
    }

    fn notify_closed(&self, quic: &quiche::Connection, notes: &mut Vec<Notification>) {
        if self.closed_notified.swap(true, Ordering::SeqCst) {
            return;
        }

        let reason = Self::close_reason(quic);
        for (idx, path) in quic.path_stats().enumerate() {
            self.stats.record_path(path.rtt, path.cwnd, path.lost);
            debug!(
                conn = self.serial,
                path_index = idx,
                peer_addr = %path.peer_addr,
                rtt_ms = path.rtt.as_millis() as u64,
                cwnd = path.cwnd,
                sent = path.sent,
                recv = path.recv,
                lost = path.lost,
                "path stats at close"
            );
        }
        info!(
            conn = self.serial,
            peer = %self.peer_addr,
            reason = reason.as_ref().map(|r| r.to_string()).unwrap_or_default(),
            "connection closed"
        );
        notes.push(Notification::ConnectionClosed {
            peer: self.peer_addr,
            reason,
        });
    }

    /// Initial send window the peer granted for `stream_id`.
    fn peer_stream_window(&self, stream_id: u64) -> u64 {
        let Some(remote) = *lock(&self.remote_params) else {
            return 0;
        };
        let stream_type = StreamType::from_id(stream_id);
        match (stream_type.is_bidi(), stream_type.is_local(self.role)) {
            (true, true) => remote.max_stream_data_bidi_remote,
            (true, false) => remote.max_stream_data_bidi_local,
            (false, _) => remote.max_stream_data_uni,
        }
    }

    /// Which credit a stream with zero capacity is waiting for.
    fn blocked_flag(&self, stream_id: u64, send_offset: u64) -> StreamState {
        if send_offset >= self.peer_stream_window(stream_id) {
            StreamState::DATA_BLOCKED
        } else {
            StreamState::CONN_BLOCKED
        }
    }

    fn blocked_error(&self, stream_id: u64) -> Error {
        let send_offset = lock(&self.streams)
            .get(&stream_id)
            .map(|ctx| ctx.send_offset)
            .unwrap_or(0);
        if self.blocked_flag(stream_id, send_offset) == StreamState::DATA_BLOCKED {
            Error::StreamDataBlocked(stream_id)
        } else {
            Error::ConnDataBlocked
        }
    }

    // -------------------------------------------------------------------------
    // Driver steps
    // -------------------------------------------------------------------------

    fn feed(&self, st: &mut QuicState, mut pkt: InboundPacket) {
        let recv_info = quiche::RecvInfo {
            from: pkt.from,
            to: self.local_addr,
        };
        let len = pkt.data.len();
        match st.quic.recv(&mut pkt.data, recv_info) {
            Ok(_) => {
                self.stats.record_recv(len, pkt.at);
                trace!(conn = self.serial, len, ecn = ?pkt.ecn, "packet processed");
            }
            Err(quiche::Error::Done) => {}
            Err(e @ (quiche::Error::CryptoFail | quiche::Error::TlsFail)) => {
                warn!(conn = self.serial, error = %e, "TLS failure");
                if st.quic.local_error().is_none() {
                    let _ = st.quic.close(false, CRYPTO_ERROR_BASE, b"tls failure");
                }
            }
            Err(e) => {
                debug!(conn = self.serial, error = %e, len, "dropping packet");
            }
        }

        if self.state() == ConnectionState::Initial && !st.quic.is_established() {
            self.set_state(ConnectionState::Handshake);
        }
    }

    fn check_established(&self, st: &mut QuicState, notes: &mut Vec<Notification>) {
        if self.state() >= ConnectionState::Open || !st.quic.is_established() {
            return;
        }

        let remote = st.quic.peer_transport_params().map(TransportParams::from);
        *lock(&self.remote_params) = remote;
        let alpn = String::from_utf8_lossy(st.quic.application_proto()).into_owned();
        *lock(&self.alpn) = Some(alpn.clone());
        *lock(&self.streams_left) = (
            st.quic.peer_streams_left_bidi(),
            st.quic.peer_streams_left_uni(),
        );

        if self.set_state(ConnectionState::Open) {
            info!(
                conn = self.serial,
                peer = %self.peer_addr,
                alpn = %alpn,
                datagrams = remote.is_some_and(|tp| tp.supports_datagrams()),
                "handshake complete"
            );
            notes.push(Notification::HandshakeComplete);
        }
    }

    fn read_streams(&self, st: &mut QuicState, notes: &mut Vec<Notification>) {
        let QuicState { quic, scratch, .. } = st;
        let readable: Vec<u64> = quic.readable().collect();
        let mut streams = lock(&self.streams);

        for stream_id in readable {
            if !streams.contains_key(&stream_id) {
                if StreamType::from_id(stream_id).is_local(self.role) {
                    trace!(conn = self.serial, stream_id, "data on retired local stream");
                } else {
                    streams.insert(stream_id, StreamCtx::new(stream_id, self.role));
                    debug!(conn = self.serial, stream_id, "peer opened stream");
                    notes.push(Notification::StreamOpened(stream_id));
                }
            }

            loop {
                let (read, fin) = match quic.stream_recv(stream_id, scratch) {
                    Ok(v) => v,
                    Err(quiche::Error::Done) => break,
                    Err(quiche::Error::StreamReset(code)) => {
                        if let Some(ctx) = streams.get_mut(&stream_id)
                            && !ctx.state.contains(StreamState::CLOSED_READING)
                        {
                            ctx.state.insert(StreamState::CLOSED_READING);
                            debug!(conn = self.serial, stream_id, code, "stream reset by peer");
                            if let Ok(meta) = StreamMeta::new(stream_id, ctx.recv_offset, 0, true) {
                                notes.push(Notification::StreamData(MetaBuffer::stream(
                                    Bytes::new(),
                                    meta,
                                )));
                            }
                        }
                        break;
                    }
                    Err(e) => {
                        debug!(conn = self.serial, stream_id, error = %e, "stream recv failed");
                        break;
                    }
                };

                let Some(ctx) = streams.get_mut(&stream_id) else {
                    continue;
                };
                if ctx.state.contains(StreamState::CLOSED_READING) {
                    trace!(conn = self.serial, stream_id, read, "dropping data after close");
                    continue;
                }
                let Ok(meta) = StreamMeta::new(stream_id, ctx.recv_offset, read as u64, fin)
                else {
                    break;
                };
                ctx.recv_offset += read as u64;
                if fin {
                    ctx.state.insert(StreamState::CLOSED_READING);
                }
                trace!(
                    conn = self.serial,
                    stream_id,
                    offset = meta.offset,
                    len = read,
                    fin,
                    "stream data"
                );
                notes.push(Notification::StreamData(MetaBuffer::stream(
                    Bytes::copy_from_slice(&scratch[..read]),
                    meta,
                )));
                if fin {
                    break;
                }
            }
        }
    }

    fn read_datagrams(&self, st: &mut QuicState, notes: &mut Vec<Notification>) {
        let QuicState { quic, scratch, .. } = st;
        loop {
            match quic.dgram_recv(scratch) {
                Ok(len) => {
                    trace!(conn = self.serial, len, "datagram received");
                    notes.push(Notification::Datagram(MetaBuffer::datagram(
                        Bytes::copy_from_slice(&scratch[..len]),
                    )));
                }
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    debug!(conn = self.serial, error = %e, "datagram recv failed");
                    break;
                }
            }
        }
    }

    fn check_streams_left(&self, st: &mut QuicState, notes: &mut Vec<Notification>) {
        if self.state() != ConnectionState::Open {
            return;
        }
        let bidi = st.quic.peer_streams_left_bidi();
        let uni = st.quic.peer_streams_left_uni();
        let mut left = lock(&self.streams_left);
        if bidi > left.0 {
            debug!(conn = self.serial, bidi_left = bidi, "more bidi streams available");
            notes.push(Notification::StreamsAvailable { bidi: true });
        }
        if uni > left.1 {
            debug!(conn = self.serial, uni_left = uni, "more uni streams available");
            notes.push(Notification::StreamsAvailable { bidi: false });
        }
        *left = (bidi, uni);
    }

    /// Release acknowledged data of streams quiche has retired.
    fn retire_streams(&self, st: &mut QuicState, notes: &mut Vec<Notification>) {
        let mut streams = lock(&self.streams);
        let mut retired = Vec::new();

        for (&stream_id, ctx) in streams.iter_mut() {
            match st.quic.stream_capacity(stream_id) {
                Ok(_) => {}
                Err(quiche::Error::StreamStopped(code)) => {
                    if !ctx.reset {
                        debug!(conn = self.serial, stream_id, code, "peer stopped stream");
                        ctx.reset = true;
                        ctx.state.insert(StreamState::CLOSED_SENDING);
                    }
                }
                Err(_) => retired.push(stream_id),
            }
        }

        for stream_id in retired {
            let Some(mut ctx) = streams.remove(&stream_id) else {
                continue;
            };
            if ctx.reset {
                ctx.in_flight.discard();
            } else {
                for slice in ctx.in_flight.release_all() {
                    notes.push(Notification::StreamAckd {
                        stream_id,
                        offset: slice.offset,
                        data: slice.data,
                    });
                }
            }
            debug!(conn = self.serial, stream_id, "stream retired");
            notes.push(Notification::StreamClosed(stream_id));
        }
    }

    fn check_closing(&self, st: &mut QuicState, notes: &mut Vec<Notification>) {
        if !self.state().is_closing() && (st.quic.is_closed() || st.quic.is_draining()) {
            self.begin_close(&st.quic, None);
        }
        if self.state().is_closing() {
            self.notify_closed(&st.quic, notes);
        }
    }

    /// Run every post-event step and hand the notifications over.
    async fn process(&self, st: &mut QuicState) {
        let mut notes = Vec::new();
        self.check_established(st, &mut notes);
        self.read_streams(st, &mut notes);
        self.read_datagrams(st, &mut notes);
        self.check_streams_left(st, &mut notes);
        notes.extend(self.flush(st).await);
        self.retire_streams(st, &mut notes);
        self.check_closing(st, &mut notes);
        self.dispatch(notes);
        self.send_credit.notify_waiters();
    }

    /// Earliest of quiche's timer and the drain deadline.
    fn next_deadline(&self, quic: &quiche::Connection) -> Option<Instant> {
        let quic_deadline = quic.timeout().map(|t| Instant::now() + t);
        let drain = *lock(&self.drain_deadline);
        match (quic_deadline, drain) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn drain_expired(&self) -> bool {
        lock(&self.drain_deadline).is_some_and(|d| Instant::now() >= d)
    }

    /// Tear down after the drain period.
    async fn finish(&self) {
        let mut notes = Vec::new();
        {
            let st = self.quic.lock().await;
            // Closed without passing through half-closed (socket loss).
            self.notify_closed(&st.quic, &mut notes);
        }
        self.set_state(ConnectionState::Closed);

        let dropped: usize = lock(&self.streams)
            .values_mut()
            .map(|ctx| ctx.in_flight.discard())
            .sum();
        let dropped_dgrams = lock(&self.datagrams).clear();
        if dropped > 0 || dropped_dgrams > 0 {
            debug!(
                conn = self.serial,
                stream_slices = dropped,
                datagrams = dropped_dgrams,
                "discarding unacknowledged data"
            );
        }

        if let Some(reader) = lock(&self.reader).take() {
            reader.abort();
        }
        if let Some(server) = self.server.as_ref().and_then(Weak::upgrade) {
            server.forget(self.serial, &lock(&self.cids));
        }

        notes.push(Notification::Shutdown);
        self.dispatch(notes);
        self.send_credit.notify_waiters();
    }
}

// =============================================================================
// QuicConnection - public handle
// =============================================================================

/// Handle to one QUIC connection. Cheap to clone.
#[derive(Clone)]
pub struct QuicConnection {
    pub(crate) inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for QuicConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicConnection")
            .field("id", &self.inner.serial)
            .field("role", &self.inner.role)
            .field("peer", &self.inner.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl PartialEq for QuicConnection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for QuicConnection {}

impl QuicConnection {
    /// Create the engine and start its driver and notifier tasks.
    pub(crate) fn spawn(
        parts: ConnectionParts,
        packets: mpsc::Receiver<InboundPacket>,
        users: Vec<Arc<dyn ConnectionHandler>>,
    ) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(parts.initial_state);
        let local_addr = parts.socket.local_addr();

        let inner = Arc::new(ConnectionInner {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            role: parts.role,
            location: parts.location,
            state,
            quic: Mutex::new(QuicState::new(parts.quic)),
            socket: parts.socket,
            local_addr,
            peer_addr: parts.peer_addr,
            local_params: parts.config.local_params(),
            datagrams_enabled: parts.config.datagrams_enabled(),
            remote_params: StdMutex::new(None),
            alpn: StdMutex::new(None),
            cids: StdMutex::new(parts.cids),
            streams: StdMutex::new(BTreeMap::new()),
            next_bidi: AtomicU64::new(0),
            next_uni: AtomicU64::new(0),
            streams_left: StdMutex::new((0, 0)),
            datagrams: StdMutex::new(DatagramTracker::new()),
            users: HandlerList::default(),
            notify_tx,
            send_credit: Notify::new(),
            wake: Notify::new(),
            closed_notified: AtomicBool::new(false),
            drain_deadline: StdMutex::new(None),
            stats: ConnectionStats::new(parts.config.stats_enabled()),
            reader: StdMutex::new(None),
            server: parts.server,
        });
        for user in users {
            inner.users.add(user);
        }

        let conn = QuicConnection { inner };
        tokio::spawn(run_notifier(conn.clone(), notify_rx));
        tokio::spawn(run_driver(conn.clone(), packets));
        conn
    }

    pub(crate) fn set_reader(&self, handle: AbortHandle) {
        *lock(&self.inner.reader) = Some(handle);
    }

    pub(crate) fn queue(&self, note: Notification) {
        self.inner.dispatch(vec![note]);
    }

    /// Flush whatever quiche has queued (first flight, handshake replies).
    pub(crate) async fn kick(&self) {
        let mut st = self.inner.quic.lock().await;
        let notes = self.inner.flush(&mut st).await;
        drop(st);
        self.inner.dispatch(notes);
    }

    /// Process-unique identifier of this connection.
    pub fn id(&self) -> u64 {
        self.inner.serial
    }

    pub fn role(&self) -> EndpointRole {
        self.inner.role
    }

    /// Location string this connection was created for.
    pub fn location(&self) -> &str {
        &self.inner.location
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_closed(&self) -> bool {
        self.state().is_closing()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Negotiated ALPN, once the handshake completed.
    pub fn alpn(&self) -> Option<String> {
        lock(&self.inner.alpn).clone()
    }

    /// Transport parameters this side advertised.
    pub fn local_params(&self) -> TransportParams {
        self.inner.local_params
    }

    /// Transport parameters the peer advertised, once known.
    pub fn remote_params(&self) -> Option<TransportParams> {
        *lock(&self.inner.remote_params)
    }

    /// True if both sides negotiated the DATAGRAM extension.
    pub fn datagrams_supported(&self) -> bool {
        self.inner.datagrams_enabled
            && self
                .remote_params()
                .is_some_and(|tp| tp.supports_datagrams())
    }

    /// Connection IDs routed to this connection.
    pub fn cids(&self) -> Vec<Vec<u8>> {
        lock(&self.inner.cids).clone()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.inner.stats
    }

    /// Register a consumer. Returns false if it was already registered.
    pub fn add_user(&self, user: Arc<dyn ConnectionHandler>) -> bool {
        self.inner.users.add(user)
    }

    /// Unregister a consumer. Returns false if it was not registered.
    pub fn remove_user(&self, user: &Arc<dyn ConnectionHandler>) -> bool {
        self.inner.users.remove(user)
    }

    pub fn user_count(&self) -> usize {
        self.inner.users.len()
    }

    pub(crate) fn users(&self) -> Vec<Arc<dyn ConnectionHandler>> {
        self.inner.users.snapshot()
    }

    /// Streams currently tracked by the engine.
    pub fn stream_ids(&self) -> Vec<u64> {
        lock(&self.inner.streams).keys().copied().collect()
    }

    /// Wait until the handshake completes.
    ///
    /// Fails with `ConnClosed` if the connection closes first.
    pub async fn wait_established(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let state = *rx
            .wait_for(|s| *s >= ConnectionState::Open)
            .await
            .map_err(|_| Error::ConnClosed)?;
        if state.is_closing() {
            return Err(Error::ConnClosed);
        }
        Ok(())
    }

    /// Wait until the connection reached [`ConnectionState::Closed`].
    pub async fn wait_closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Whether a stream of the given direction could be opened right now.
    ///
    /// Returns `OPEN`, or one of the transient codes
    /// `MAX_STREAMS_REACHED`, `CONNECTION_IN_INITIAL`, `CONNECTION_CLOSED`.
    pub async fn can_open_stream(&self, bidi: bool) -> StreamState {
        let st = self.inner.quic.lock().await;
        let state = self.state();
        if state.is_closing() {
            StreamState::CONNECTION_CLOSED
        } else if state < ConnectionState::Open {
            StreamState::CONNECTION_IN_INITIAL
        } else if (bidi && st.quic.peer_streams_left_bidi() == 0)
            || (!bidi && st.quic.peer_streams_left_uni() == 0)
        {
            StreamState::MAX_STREAMS_REACHED
        } else {
            StreamState::OPEN
        }
    }

    /// Open a new locally initiated stream.
    ///
    /// Never waits: fails with `HandshakeIncomplete` before the handshake
    /// and `StreamIdBlocked` when the peer's stream limit is reached.
    pub async fn open_stream(&self, bidi: bool) -> Result<u64> {
        let inner = &self.inner;
        let mut st = inner.quic.lock().await;

        let state = self.state();
        if state.is_closing() || st.quic.is_closed() {
            return Err(Error::ConnClosed);
        }
        if state < ConnectionState::Open || !st.quic.is_established() {
            return Err(Error::HandshakeIncomplete);
        }

        let left = if bidi {
            st.quic.peer_streams_left_bidi()
        } else {
            st.quic.peer_streams_left_uni()
        };
        if left == 0 {
            debug!(conn = inner.serial, bidi, "stream limit reached");
            return Err(Error::StreamIdBlocked);
        }

        let counter = if bidi { &inner.next_bidi } else { &inner.next_uni };
        let n = counter.load(Ordering::SeqCst);
        let stream_id = StreamType::for_local(inner.role, bidi).nth_id(n);

        st.quic
            .stream_priority(stream_id, DEFAULT_STREAM_URGENCY, true)
            .map_err(|e| map_quiche_error(e, stream_id))?;
        counter.store(n + 1, Ordering::SeqCst);

        lock(&inner.streams).insert(stream_id, StreamCtx::new(stream_id, inner.role));
        *lock(&inner.streams_left) = (
            st.quic.peer_streams_left_bidi(),
            st.quic.peer_streams_left_uni(),
        );

        debug!(conn = inner.serial, stream_id, bidi, "opened stream");
        Ok(stream_id)
    }

    /// Close a stream.
    ///
    /// A unidirectional stream, or any stream with a non-zero `code`, is
    /// reset immediately. A bidirectional stream with code 0 gets an
    /// end-of-stream after its pending bytes.
    pub async fn close_stream(&self, stream_id: u64, code: u64) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.quic.lock().await;

        let stream_type = StreamType::from_id(stream_id);
        {
            let mut streams = lock(&inner.streams);
            let ctx = streams
                .get_mut(&stream_id)
                .ok_or(Error::StreamClosed(stream_id))?;

            if stream_type.is_uni() || code != 0 {
                if stream_type.is_uni() && !stream_type.is_local(inner.role) {
                    // Receive-only stream: ask the peer to stop.
                    match st.quic.stream_shutdown(stream_id, quiche::Shutdown::Read, code) {
                        Ok(()) | Err(quiche::Error::Done) => {}
                        Err(e) => return Err(map_quiche_error(e, stream_id)),
                    }
                    ctx.state.insert(StreamState::CLOSED_READING);
                } else {
                    match st.quic.stream_shutdown(stream_id, quiche::Shutdown::Write, code) {
                        Ok(()) | Err(quiche::Error::Done) => {}
                        Err(e) => return Err(map_quiche_error(e, stream_id)),
                    }
                    ctx.reset = true;
                    ctx.state.insert(StreamState::CLOSED_SENDING);
                }
                debug!(conn = inner.serial, stream_id, code, "stream reset");
            } else {
                if ctx.state.contains(StreamState::CLOSED_SENDING) {
                    return Err(Error::StreamClosed(stream_id));
                }
                st.quic
                    .stream_send(stream_id, &[], true)
                    .map_err(|e| map_quiche_error(e, stream_id))?;
                ctx.state.insert(StreamState::CLOSED_SENDING);
                debug!(conn = inner.serial, stream_id, "stream finished");
            }
        }

        let notes = inner.flush(&mut st).await;
        drop(st);
        inner.dispatch(notes);
        inner.wake.notify_one();
        Ok(())
    }

    /// Send bytes on a stream, with end-of-stream when `fin` is set.
    ///
    /// Returns the number of bytes accepted. While no credit is available
    /// the call waits up to 100 ms at a time for the window to grow; if a
    /// wait passes without progress it returns the partial count, or
    /// `StreamDataBlocked`/`ConnDataBlocked` if nothing was accepted.
    ///
    /// Accepted slices stay referenced until the stream retires, when each
    /// is handed back through `stream_ackd`. A long-lived stream therefore
    /// holds everything written on it in memory.
    pub async fn send_stream(&self, stream_id: u64, data: Bytes, fin: bool) -> Result<usize> {
        let inner = &self.inner;
        let mut written = 0usize;
        let mut waited_without_progress = false;

        loop {
            let credit = inner.send_credit.notified();
            tokio::pin!(credit);
            credit.as_mut().enable();

            let progressed;
            let done;
            {
                let mut st = inner.quic.lock().await;
                if self.state().is_closing() || st.quic.is_closed() {
                    return Err(Error::ConnClosed);
                }

                let offset = {
                    let streams = lock(&inner.streams);
                    let ctx = streams
                        .get(&stream_id)
                        .ok_or(Error::StreamClosed(stream_id))?;
                    if !ctx.state.is_writable() {
                        return Err(Error::StreamClosed(stream_id));
                    }
                    ctx.send_offset
                };

                let remaining = &data[written..];
                match st.quic.stream_send(stream_id, remaining, fin) {
                    Ok(n) => {
                        let mut streams = lock(&inner.streams);
                        if let Some(ctx) = streams.get_mut(&stream_id) {
                            ctx.in_flight
                                .push(offset, data.slice(written..written + n));
                            ctx.send_offset += n as u64;
                            if fin && n == remaining.len() {
                                ctx.state.insert(StreamState::CLOSED_SENDING);
                            }
                        }
                        written += n;
                        progressed = n > 0;
                        done = written == data.len();
                    }
                    Err(quiche::Error::Done) => {
                        progressed = false;
                        done = false;
                    }
                    Err(e) => {
                        let err = map_quiche_error(e, stream_id);
                        if written > 0 && err.is_retryable() {
                            return Ok(written);
                        }
                        return Err(err);
                    }
                }

                let notes = inner.flush(&mut st).await;
                drop(st);
                inner.dispatch(notes);
            }

            if done {
                trace!(conn = inner.serial, stream_id, written, fin, "stream send complete");
                return Ok(written);
            }
            if progressed {
                waited_without_progress = false;
                continue;
            }
            if waited_without_progress {
                if written > 0 {
                    return Ok(written);
                }
                return Err(inner.blocked_error(stream_id));
            }

            trace!(conn = inner.serial, stream_id, written, "waiting for send credit");
            if tokio::time::timeout(SEND_CREDIT_WAIT, credit).await.is_err() {
                waited_without_progress = true;
            }
        }
    }

    /// Queue a datagram.
    ///
    /// The returned ticket is acknowledged through `datagram_ackd` once the
    /// datagram has been sent, unless `accepted` is false.
    pub async fn send_datagram(&self, data: Bytes) -> Result<DatagramTicket> {
        let inner = &self.inner;
        let mut st = inner.quic.lock().await;

        if self.state().is_closing() || st.quic.is_closed() {
            return Err(Error::ConnClosed);
        }
        if !inner.datagrams_enabled {
            return Err(Error::ExtensionNotSupported);
        }
        let Some(max_len) = st.quic.dgram_max_writable_len() else {
            if st.quic.is_established() {
                return Err(Error::ExtensionNotSupported);
            }
            return Err(Error::HandshakeIncomplete);
        };
        if data.len() > max_len {
            return Err(Error::Generic {
                message: format!("datagram of {} bytes exceeds limit {}", data.len(), max_len),
            });
        }

        let ticket = lock(&inner.datagrams).next_ticket();
        let accepted = match st.quic.dgram_send(&data) {
            Ok(()) => {
                lock(&inner.datagrams).stash(ticket, data);
                true
            }
            Err(quiche::Error::Done) => false,
            Err(quiche::Error::InvalidState) => return Err(Error::ExtensionNotSupported),
            Err(e) => return Err(map_quiche_error(e, 0)),
        };
        trace!(conn = inner.serial, ticket, accepted, "datagram queued");

        let notes = inner.flush(&mut st).await;
        drop(st);
        inner.dispatch(notes);
        Ok(DatagramTicket {
            id: ticket,
            accepted,
        })
    }

    /// Current state set of a stream.
    ///
    /// Unknown streams report an empty set. While the connection is not
    /// open the transient codes are returned instead.
    pub async fn stream_state(&self, stream_id: u64) -> StreamState {
        let inner = &self.inner;
        let mut st = inner.quic.lock().await;

        let state = self.state();
        if state.is_closing() {
            return StreamState::CONNECTION_CLOSED;
        }
        if state < ConnectionState::Open {
            return StreamState::CONNECTION_IN_INITIAL;
        }

        let (mut flags, send_offset) = match lock(&inner.streams).get(&stream_id) {
            Some(ctx) => (ctx.state, ctx.send_offset),
            None => return StreamState::empty(),
        };
        if flags.is_writable() {
            match st.quic.stream_capacity(stream_id) {
                Ok(0) => flags |= inner.blocked_flag(stream_id, send_offset),
                Ok(_) => {}
                Err(quiche::Error::StreamStopped(_)) => flags |= StreamState::CLOSED_SENDING,
                Err(_) => {}
            }
        }
        flags
    }

    /// Close the connection.
    ///
    /// Sends CONNECTION_CLOSE and keeps the connection half-closed for
    /// three PTOs before it becomes closed. Calling it again is a no-op.
    pub async fn disconnect(&self, app: bool, code: u64) -> Result<()> {
        let inner = &self.inner;
        let mut st = inner.quic.lock().await;
        if self.state().is_closing() {
            return Ok(());
        }

        match st.quic.close(app, code, b"") {
            Ok(()) | Err(quiche::Error::Done) => {}
            Err(e) => {
                return Err(Error::Transport {
                    message: format!("close failed: {}", e),
                });
            }
        }
        info!(conn = inner.serial, app, code, "disconnecting");

        let mut notes = inner.flush(&mut st).await;
        inner.begin_close(&st.quic, None);
        inner.notify_closed(&st.quic, &mut notes);
        drop(st);
        inner.dispatch(notes);
        inner.wake.notify_one();
        Ok(())
    }
}

// =============================================================================
// Driver task
// =============================================================================

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// Feed packets and timers to quiche until the drain period ends.
async fn run_driver(conn: QuicConnection, mut packets: mpsc::Receiver<InboundPacket>) {
    let inner = &conn.inner;
    let mut socket_open = true;
    debug!(conn = inner.serial, peer = %inner.peer_addr, role = %inner.role, "driver started");

    {
        let mut st = inner.quic.lock().await;
        inner.process(&mut st).await;
    }

    loop {
        let deadline = {
            let st = inner.quic.lock().await;
            inner.next_deadline(&st.quic)
        };

        tokio::select! {
            pkt = packets.recv(), if socket_open => {
                let mut st = inner.quic.lock().await;
                match pkt {
                    Some(pkt) => {
                        inner.feed(&mut st, pkt);
                        for _ in 1..RECV_BATCH {
                            match packets.try_recv() {
                                Ok(pkt) => inner.feed(&mut st, pkt),
                                Err(_) => break,
                            }
                        }
                    }
                    None => {
                        socket_open = false;
                        warn!(conn = inner.serial, "socket reader stopped");
                        let _ = st.quic.close(false, 0, b"");
                        inner.begin_close(&st.quic, Some(Duration::ZERO));
                    }
                }
                inner.process(&mut st).await;
            }
            _ = sleep_until(deadline) => {
                let mut st = inner.quic.lock().await;
                if !inner.drain_expired() {
                    st.quic.on_timeout();
                }
                inner.process(&mut st).await;
            }
            _ = inner.wake.notified() => {
                let mut st = inner.quic.lock().await;
                inner.process(&mut st).await;
            }
        }

        if inner.drain_expired() {
            break;
        }
    }

    inner.finish().await;
    debug!(conn = inner.serial, "driver finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiche_error_mapping() {
        assert!(matches!(
            map_quiche_error(quiche::Error::StreamLimit, 4),
            Error::StreamIdBlocked
        ));
        assert!(matches!(
            map_quiche_error(quiche::Error::FlowControl, 4),
            Error::StreamDataBlocked(4)
        ));
        assert!(matches!(
            map_quiche_error(quiche::Error::InvalidStreamState(8), 8),
            Error::StreamClosed(8)
        ));
        assert!(matches!(
            map_quiche_error(quiche::Error::TlsFail, 0),
            Error::Tls { .. }
        ));
        assert!(matches!(
            map_quiche_error(quiche::Error::InvalidPacket, 0),
            Error::Transport { .. }
        ));
    }

    #[test]
    fn uni_streams_closed_on_one_side_from_birth() {
        let local_uni = StreamCtx::new(2, EndpointRole::Client);
        assert!(local_uni.state.contains(StreamState::CLOSED_READING));
        assert!(local_uni.state.is_writable());

        let remote_uni = StreamCtx::new(3, EndpointRole::Client);
        assert!(remote_uni.state.contains(StreamState::CLOSED_SENDING));
        assert!(!remote_uni.state.is_writable());

        let bidi = StreamCtx::new(1, EndpointRole::Client);
        assert_eq!(bidi.state, StreamState::OPEN);
    }
}
