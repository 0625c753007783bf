//! QUIC server for the quiche backend.
//!
//! One UDP socket is shared by every connection. A reader task parses the
//! header of each inbound packet and routes it by destination connection
//! ID to the owning connection's driver. Unknown Initial packets create
//! new connections, optionally after a stateless retry.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex as StdMutex};

use rand::RngCore;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};

use crate::constants::{
    INBOUND_QUEUE_DEPTH, MAX_UDP_PACKET, RETRY_TOKEN_PREFIX, SERVER_SCID_LEN,
};
use crate::error::{Error, Result};
use crate::transport::common::is_icmp_error;
use crate::transport::config::resolve_location;
use crate::transport::events::{HandlerList, Notification, lock};
use crate::transport::{ConnectionHandler, ConnectionState, EndpointRole, TransportConfig};

use super::connection::{ConnectionParts, QuicConnection};
use super::keylog::attach_keylog;
use super::socket::{InboundPacket, QuicSocket};

// =============================================================================
// Retry tokens
// =============================================================================

/// Token bound to the client's address and its original destination CID.
fn mint_token(odcid: &[u8], from: &SocketAddr) -> Vec<u8> {
    let mut token = RETRY_TOKEN_PREFIX.to_vec();
    match from.ip() {
        IpAddr::V4(ip) => token.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => token.extend_from_slice(&ip.octets()),
    }
    token.extend_from_slice(odcid);
    token
}

/// Original destination CID carried by a valid token.
fn validate_token<'a>(token: &'a [u8], from: &SocketAddr) -> Option<&'a [u8]> {
    let rest = token.strip_prefix(RETRY_TOKEN_PREFIX)?;
    let rest = match from.ip() {
        IpAddr::V4(ip) => rest.strip_prefix(&ip.octets()[..])?,
        IpAddr::V6(ip) => rest.strip_prefix(&ip.octets()[..])?,
    };
    if rest.is_empty() || rest.len() > quiche::MAX_CONN_ID_LEN {
        return None;
    }
    Some(rest)
}

fn random_cid() -> [u8; SERVER_SCID_LEN] {
    let mut cid = [0u8; SERVER_SCID_LEN];
    rand::rng().fill_bytes(&mut cid);
    cid
}

// =============================================================================
// ServerInner
// =============================================================================

pub(crate) struct ServerInner {
    socket: Arc<QuicSocket>,
    config: TransportConfig,
    quiche_config: StdMutex<quiche::Config>,
    routes: StdMutex<HashMap<Vec<u8>, mpsc::Sender<InboundPacket>>>,
    connections: StdMutex<Vec<QuicConnection>>,
    users: HandlerList,
    state: watch::Sender<ConnectionState>,
    reader: StdMutex<Option<AbortHandle>>,
}

impl ServerInner {
    /// Drop the routes and bookkeeping of a finished connection.
    pub(crate) fn forget(&self, serial: u64, cids: &[Vec<u8>]) {
        {
            let mut routes = lock(&self.routes);
            for cid in cids {
                routes.remove(cid);
            }
        }
        lock(&self.connections).retain(|c| c.id() != serial);
        debug!(conn = serial, "connection forgotten");
    }

    async fn route(self: &Arc<Self>, mut pkt: InboundPacket, out: &mut [u8]) {
        let (ty, version, dcid, scid, token) =
            match quiche::Header::from_slice(&mut pkt.data, SERVER_SCID_LEN) {
                Ok(hdr) => (
                    hdr.ty,
                    hdr.version,
                    hdr.dcid.to_vec(),
                    hdr.scid.to_vec(),
                    hdr.token.clone(),
                ),
                Err(e) => {
                    trace!(from = %pkt.from, error = %e, "unparseable packet");
                    return;
                }
            };

        let route = lock(&self.routes).get(&dcid).cloned();
        if let Some(tx) = route {
            match tx.try_send(pkt) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => trace!("connection queue full, dropping packet"),
                Err(TrySendError::Closed(_)) => trace!("connection gone, dropping packet"),
            }
            return;
        }

        if ty != quiche::Type::Initial {
            trace!(from = %pkt.from, ?ty, "packet for unknown connection");
            return;
        }

        if !quiche::version_is_supported(version) {
            debug!(from = %pkt.from, version, "negotiating version");
            let scid_ref = quiche::ConnectionId::from_ref(&scid);
            let dcid_ref = quiche::ConnectionId::from_ref(&dcid);
            match quiche::negotiate_version(&scid_ref, &dcid_ref, out) {
                Ok(len) => self.reply(&out[..len], pkt.from).await,
                Err(e) => debug!(error = %e, "version negotiation failed"),
            }
            return;
        }

        let (conn_scid, odcid) = if self.config.stateless_retry() {
            match token.as_deref() {
                None | Some([]) => {
                    let new_scid = random_cid();
                    let token = mint_token(&dcid, &pkt.from);
                    let written = quiche::retry(
                        &quiche::ConnectionId::from_ref(&scid),
                        &quiche::ConnectionId::from_ref(&dcid),
                        &quiche::ConnectionId::from_ref(&new_scid),
                        &token,
                        version,
                        out,
                    );
                    match written {
                        Ok(len) => {
                            debug!(from = %pkt.from, "sending retry");
                            self.reply(&out[..len], pkt.from).await;
                        }
                        Err(e) => debug!(error = %e, "retry failed"),
                    }
                    return;
                }
                Some(token) => match validate_token(token, &pkt.from) {
                    Some(odcid) => (dcid.clone(), Some(odcid.to_vec())),
                    None => {
                        debug!(from = %pkt.from, "invalid retry token");
                        return;
                    }
                },
            }
        } else {
            (random_cid().to_vec(), None)
        };

        let quic = {
            let mut cfg = lock(&self.quiche_config);
            let scid_ref = quiche::ConnectionId::from_ref(&conn_scid);
            let odcid_ref = odcid.as_deref().map(quiche::ConnectionId::from_ref);
            quiche::accept(
                &scid_ref,
                odcid_ref.as_ref(),
                self.socket.local_addr(),
                pkt.from,
                &mut cfg,
            )
        };
        let mut quic = match quic {
            Ok(quic) => quic,
            Err(e) => {
                warn!(from = %pkt.from, error = %e, "failed to accept connection");
                return;
            }
        };

        if let Some(dir) = self.config.tls_export_dir() {
            attach_keylog(&mut quic, dir, &conn_scid);
        }

        let mut cids = vec![conn_scid.clone()];
        if dcid != conn_scid {
            cids.push(dcid.clone());
        }

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let peer = pkt.from;
        let conn = QuicConnection::spawn(
            ConnectionParts {
                role: EndpointRole::Server,
                location: self.config.location().to_string(),
                quic,
                socket: Arc::clone(&self.socket),
                peer_addr: peer,
                config: self.config.clone(),
                cids: cids.clone(),
                initial_state: ConnectionState::Initial,
                server: Some(Arc::downgrade(self)),
            },
            rx,
            self.users.snapshot(),
        );

        {
            let mut routes = lock(&self.routes);
            for cid in cids {
                routes.insert(cid, tx.clone());
            }
        }
        lock(&self.connections).push(conn.clone());
        info!(conn = conn.id(), peer = %peer, "accepted connection");

        conn.queue(Notification::NewConnection);
        if tx.try_send(pkt).is_err() {
            trace!(conn = conn.id(), "dropping first packet");
        }
    }

    async fn reply(&self, data: &[u8], to: SocketAddr) {
        if let Err(e) = self.socket.send_to(data, to).await {
            debug!(to = %to, error = %e, "failed to send reply");
        }
    }
}

async fn run_reader(server: Arc<ServerInner>) {
    let mut buf = vec![0u8; MAX_UDP_PACKET];
    let mut out = vec![0u8; MAX_UDP_PACKET];
    loop {
        let packets = match server.socket.recv(&mut buf).await {
            Ok(packets) => packets,
            Err(e) if is_icmp_error(&e) => {
                debug!(error = %e, "ICMP error received");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "server socket recv failed");
                break;
            }
        };
        for pkt in packets {
            server.route(pkt, &mut out).await;
        }
    }
    server.routes_closed();
}

impl ServerInner {
    /// Dropping the senders makes every driver treat the socket as lost.
    fn routes_closed(&self) {
        lock(&self.routes).clear();
    }
}

// =============================================================================
// QuicServer - public handle
// =============================================================================

/// A listening QUIC server. Cheap to clone.
#[derive(Clone)]
pub struct QuicServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for QuicServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicServer")
            .field("local_addr", &self.local_addr())
            .field("connections", &lock(&self.inner.connections).len())
            .finish()
    }
}

impl PartialEq for QuicServer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for QuicServer {}

/// Bind a server socket at `config.location()` and start accepting.
pub async fn listen(config: TransportConfig) -> Result<QuicServer> {
    listen_with_users(config, Vec::new()).await
}

/// Like [`listen`], registering `users` before any connection arrives.
pub async fn listen_with_users(
    config: TransportConfig,
    users: Vec<Arc<dyn ConnectionHandler>>,
) -> Result<QuicServer> {
    if config.role() != EndpointRole::Server {
        return Err(Error::config("listen requires a server configuration"));
    }
    let quiche_config = config.build_quiche_config()?;
    let addr = resolve_location(config.location()).await?;
    let socket = Arc::new(QuicSocket::bind(addr).await?);

    let (state, _) = watch::channel(ConnectionState::Listening);
    let inner = Arc::new(ServerInner {
        socket,
        config,
        quiche_config: StdMutex::new(quiche_config),
        routes: StdMutex::new(HashMap::new()),
        connections: StdMutex::new(Vec::new()),
        users: HandlerList::default(),
        state,
        reader: StdMutex::new(None),
    });
    for user in users {
        inner.users.add(user);
    }

    let reader = tokio::spawn(run_reader(Arc::clone(&inner)));
    *lock(&inner.reader) = Some(reader.abort_handle());

    info!(
        addr = %inner.socket.local_addr(),
        alpn = ?inner.config.alpn(),
        retry = inner.config.stateless_retry(),
        "listening"
    );
    Ok(QuicServer { inner })
}

impl QuicServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.socket.local_addr()
    }

    /// ALPN identifiers this server accepts.
    pub fn alpns(&self) -> &[String] {
        self.inner.config.alpn()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Connections accepted and not yet finished.
    pub fn connections(&self) -> Vec<QuicConnection> {
        lock(&self.inner.connections).clone()
    }

    /// Register a consumer for current and future connections.
    ///
    /// Returns false if it was already registered.
    pub fn add_user(&self, user: Arc<dyn ConnectionHandler>) -> bool {
        if !self.inner.users.add(Arc::clone(&user)) {
            return false;
        }
        for conn in self.connections() {
            conn.add_user(Arc::clone(&user));
        }
        true
    }

    /// Unregister a consumer from the server and its connections.
    pub fn remove_user(&self, user: &Arc<dyn ConnectionHandler>) -> bool {
        if !self.inner.users.remove(user) {
            return false;
        }
        for conn in self.connections() {
            conn.remove_user(user);
        }
        true
    }

    pub fn user_count(&self) -> usize {
        self.inner.users.len()
    }

    /// Stop accepting and close every connection.
    pub async fn close(&self) {
        if let Some(reader) = lock(&self.inner.reader).take() {
            reader.abort();
        }
        let connections = self.connections();
        for conn in &connections {
            if let Err(e) = conn.disconnect(true, 0).await {
                debug!(conn = conn.id(), error = %e, "disconnect failed");
            }
        }
        self.inner.state.send_replace(ConnectionState::Closed);
        info!(addr = %self.local_addr(), connections = connections.len(), "server closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_round_trip_binds_address() {
        let from: SocketAddr = "192.0.2.7:5000".parse().unwrap();
        let odcid = [9u8; 20];
        let token = mint_token(&odcid, &from);
        assert!(token.starts_with(RETRY_TOKEN_PREFIX));
        assert_eq!(validate_token(&token, &from), Some(&odcid[..]));

        let other: SocketAddr = "192.0.2.8:5000".parse().unwrap();
        assert_eq!(validate_token(&token, &other), None);
    }

    #[test]
    fn token_rejects_garbage() {
        let from: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        assert_eq!(validate_token(b"nope", &from), None);
        let empty_cid = mint_token(&[], &from);
        assert_eq!(validate_token(&empty_cid, &from), None);
    }

    #[test]
    fn server_cids_have_fixed_length() {
        assert_eq!(random_cid().len(), SERVER_SCID_LEN);
        assert_ne!(random_cid(), random_cid());
    }
}
