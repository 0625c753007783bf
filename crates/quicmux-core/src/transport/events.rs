//! Consumer callbacks and their delivery task.
//!
//! The driver task never calls consumers directly. It queues
//! [`Notification`]s which the per-connection notifier task delivers to
//! every registered [`ConnectionHandler`], so consumer code never runs with
//! the connection lock held and never re-enters the driver.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::constants::APP_ERROR_HANDSHAKE_REFUSED;
use crate::meta::MetaBuffer;

use super::quiche::QuicConnection;

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// True if the close was sent by the peer.
    pub remote: bool,
    /// True for an application close, false for a transport close.
    pub is_app: bool,
    pub error_code: u64,
    pub reason: Vec<u8>,
    /// True if the idle timer expired instead of an explicit close.
    pub timed_out: bool,
}

impl CloseReason {
    pub(crate) fn from_quiche(err: &quiche::ConnectionError, remote: bool) -> Self {
        Self {
            remote,
            is_app: err.is_app,
            error_code: err.error_code,
            reason: err.reason.clone(),
            timed_out: false,
        }
    }

    pub(crate) fn idle_timeout() -> Self {
        Self {
            remote: false,
            is_app: false,
            error_code: 0,
            reason: Vec::new(),
            timed_out: true,
        }
    }

    /// Code 0 with no timeout.
    pub fn is_graceful(&self) -> bool {
        self.error_code == 0 && !self.timed_out
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.timed_out {
            return f.write_str("idle timeout");
        }
        write!(
            f,
            "{} {} error {:#x}",
            if self.remote { "peer" } else { "local" },
            if self.is_app { "application" } else { "transport" },
            self.error_code
        )?;
        if !self.reason.is_empty() {
            write!(f, " ({})", String::from_utf8_lossy(&self.reason))?;
        }
        Ok(())
    }
}

/// Consumer of connection events.
///
/// Every method has a no-op default so consumers implement only what
/// they need. Methods are awaited one at a time per connection, in
/// registration order of the handlers.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    /// A server accepted a new connection carrying this handler.
    async fn new_connection(&self, _conn: &QuicConnection) {}

    /// The handshake completed. Returning false refuses the connection,
    /// which is then closed with an application error.
    async fn handshake_complete(&self, _conn: &QuicConnection) -> bool {
        true
    }

    /// The peer opened a stream.
    async fn stream_opened(&self, _conn: &QuicConnection, _stream_id: u64) {}

    /// Inbound stream data, tagged with stream metadata.
    async fn stream_data(&self, _conn: &QuicConnection, _buf: MetaBuffer) {}

    /// Inbound datagram, tagged with datagram metadata.
    async fn datagram_received(&self, _conn: &QuicConnection, _buf: MetaBuffer) {}

    /// A previously sent slice of a stream was acknowledged.
    async fn stream_ackd(&self, _conn: &QuicConnection, _stream_id: u64, _offset: u64, _data: Bytes) {}

    /// A previously queued datagram was delivered.
    async fn datagram_ackd(&self, _conn: &QuicConnection, _ticket: u64, _data: Bytes) {}

    /// The stream finished in both directions and was retired.
    async fn stream_closed(&self, _conn: &QuicConnection, _stream_id: u64) {}

    /// The peer granted more streams of the given direction.
    async fn streams_available(&self, _conn: &QuicConnection, _bidi: bool) {}

    /// The connection is closing. Delivered exactly once and always last.
    async fn connection_closed(
        &self,
        _conn: &QuicConnection,
        _peer: SocketAddr,
        _reason: Option<CloseReason>,
    ) {
    }
}

/// Event queued by the driver for the notifier task.
#[derive(Debug)]
pub(crate) enum Notification {
    NewConnection,
    HandshakeComplete,
    StreamOpened(u64),
    StreamData(MetaBuffer),
    Datagram(MetaBuffer),
    StreamAckd { stream_id: u64, offset: u64, data: Bytes },
    DatagramAckd { ticket: u64, data: Bytes },
    StreamClosed(u64),
    StreamsAvailable { bidi: bool },
    ConnectionClosed { peer: SocketAddr, reason: Option<CloseReason> },
    Shutdown,
}

impl Notification {
    fn name(&self) -> &'static str {
        match self {
            Notification::NewConnection => "new_connection",
            Notification::HandshakeComplete => "handshake_complete",
            Notification::StreamOpened(_) => "stream_opened",
            Notification::StreamData(_) => "stream_data",
            Notification::Datagram(_) => "datagram_received",
            Notification::StreamAckd { .. } => "stream_ackd",
            Notification::DatagramAckd { .. } => "datagram_ackd",
            Notification::StreamClosed(_) => "stream_closed",
            Notification::StreamsAvailable { .. } => "streams_available",
            Notification::ConnectionClosed { .. } => "connection_closed",
            Notification::Shutdown => "shutdown",
        }
    }
}

/// Deliver queued notifications until shutdown.
///
/// After `connection_closed` has been delivered every other notification
/// is discarded.
pub(crate) async fn run_notifier(
    conn: QuicConnection,
    mut rx: mpsc::UnboundedReceiver<Notification>,
) {
    let mut closed = false;

    while let Some(note) = rx.recv().await {
        if matches!(note, Notification::Shutdown) {
            break;
        }
        if closed {
            trace!(event = note.name(), "dropping event after connection_closed");
            continue;
        }

        let users = conn.users();
        trace!(event = note.name(), users = users.len(), "delivering event");

        match note {
            Notification::NewConnection => {
                for user in &users {
                    user.new_connection(&conn).await;
                }
            }
            Notification::HandshakeComplete => {
                let mut accepted = true;
                for user in &users {
                    if !user.handshake_complete(&conn).await {
                        accepted = false;
                        break;
                    }
                }
                if !accepted {
                    info!(peer = %conn.peer_addr(), "consumer refused handshake, closing");
                    if let Err(e) = conn.disconnect(true, APP_ERROR_HANDSHAKE_REFUSED).await {
                        warn!(error = %e, "failed to close refused connection");
                    }
                }
            }
            Notification::StreamOpened(stream_id) => {
                for user in &users {
                    user.stream_opened(&conn, stream_id).await;
                }
            }
            Notification::StreamData(buf) => {
                for user in &users {
                    user.stream_data(&conn, buf.clone()).await;
                }
            }
            Notification::Datagram(buf) => {
                for user in &users {
                    user.datagram_received(&conn, buf.clone()).await;
                }
            }
            Notification::StreamAckd {
                stream_id,
                offset,
                data,
            } => {
                for user in &users {
                    user.stream_ackd(&conn, stream_id, offset, data.clone()).await;
                }
            }
            Notification::DatagramAckd { ticket, data } => {
                for user in &users {
                    user.datagram_ackd(&conn, ticket, data.clone()).await;
                }
            }
            Notification::StreamClosed(stream_id) => {
                for user in &users {
                    user.stream_closed(&conn, stream_id).await;
                }
            }
            Notification::StreamsAvailable { bidi } => {
                for user in &users {
                    user.streams_available(&conn, bidi).await;
                }
            }
            Notification::ConnectionClosed { peer, reason } => {
                closed = true;
                for user in &users {
                    user.connection_closed(&conn, peer, reason.clone()).await;
                }
            }
            Notification::Shutdown => {}
        }
    }

    debug!(peer = %conn.peer_addr(), "notifier finished");
}

/// Handler list shared by a connection or a listening server.
#[derive(Default)]
pub(crate) struct HandlerList {
    users: std::sync::Mutex<Vec<Arc<dyn ConnectionHandler>>>,
}

impl HandlerList {
    /// Add `user` unless it is already present. Returns true if added.
    pub(crate) fn add(&self, user: Arc<dyn ConnectionHandler>) -> bool {
        let mut users = lock(&self.users);
        if users.iter().any(|u| same_handler(u, &user)) {
            return false;
        }
        users.push(user);
        true
    }

    /// Remove `user`. Returns true if it was present.
    pub(crate) fn remove(&self, user: &Arc<dyn ConnectionHandler>) -> bool {
        let mut users = lock(&self.users);
        let before = users.len();
        users.retain(|u| !same_handler(u, user));
        users.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<dyn ConnectionHandler>> {
        lock(&self.users).clone()
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.users).len()
    }
}

/// Identity comparison of two handler handles.
pub fn same_handler(a: &Arc<dyn ConnectionHandler>, b: &Arc<dyn ConnectionHandler>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    #[async_trait]
    impl ConnectionHandler for Nop {}

    #[test]
    fn handler_list_is_idempotent() {
        let list = HandlerList::default();
        let a: Arc<dyn ConnectionHandler> = Arc::new(Nop);
        let b: Arc<dyn ConnectionHandler> = Arc::new(Nop);

        assert!(list.add(a.clone()));
        assert!(!list.add(a.clone()));
        assert!(list.add(b.clone()));
        assert_eq!(list.len(), 2);

        assert!(list.remove(&a));
        assert!(!list.remove(&a));
        assert_eq!(list.len(), 1);
        assert!(same_handler(&list.snapshot()[0], &b));
    }

    #[test]
    fn close_reason_display() {
        let reason = CloseReason {
            remote: true,
            is_app: true,
            error_code: 0x10,
            reason: b"bye".to_vec(),
            timed_out: false,
        };
        assert_eq!(reason.to_string(), "peer application error 0x10 (bye)");
        assert!(!reason.is_graceful());
        assert_eq!(CloseReason::idle_timeout().to_string(), "idle timeout");
    }
}
