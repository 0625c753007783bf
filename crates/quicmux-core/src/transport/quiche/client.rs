//! QUIC client connection establishment for the quiche backend.

use std::net::SocketAddr;
use std::sync::Arc;

use rand::RngCore;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::constants::{INBOUND_QUEUE_DEPTH, MAX_UDP_PACKET};
use crate::error::{Error, Result};
use crate::transport::common::is_icmp_error;
use crate::transport::config::resolve_location;
use crate::transport::{ConnectionHandler, ConnectionState, EndpointRole, TransportConfig};

use super::connection::{ConnectionParts, QuicConnection};
use super::keylog::attach_keylog;
use super::socket::{InboundPacket, QuicSocket};

// =============================================================================
// connect - Client Connection Establishment
// =============================================================================

/// Start a client connection to `config.location()`.
///
/// Returns as soon as the first flight is sent; use
/// [`QuicConnection::wait_established`] or a handler's
/// `handshake_complete` to learn when the handshake finishes.
pub async fn connect(config: TransportConfig) -> Result<QuicConnection> {
    connect_with_users(config, Vec::new()).await
}

/// Like [`connect`], registering `users` before any event is delivered.
pub async fn connect_with_users(
    config: TransportConfig,
    users: Vec<Arc<dyn ConnectionHandler>>,
) -> Result<QuicConnection> {
    if config.role() != EndpointRole::Client {
        return Err(Error::config("connect requires a client configuration"));
    }
    let peer_addr = resolve_location(config.location()).await?;

    let bind_addr: SocketAddr = if peer_addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = Arc::new(QuicSocket::bind(bind_addr).await?);
    let local_addr = socket.local_addr();

    let mut quiche_config = config.build_quiche_config()?;

    let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
    rand::rng().fill_bytes(&mut scid);
    let scid_ref = quiche::ConnectionId::from_ref(&scid);

    let sni = config.sni();
    let mut quic = quiche::connect(
        sni.as_deref(),
        &scid_ref,
        local_addr,
        peer_addr,
        &mut quiche_config,
    )
    .map_err(|e| Error::Transport {
        message: format!("failed to create connection: {}", e),
    })?;

    if let Some(dir) = config.tls_export_dir() {
        attach_keylog(&mut quic, dir, &scid);
    }

    info!(
        location = config.location(),
        peer = %peer_addr,
        local = %local_addr,
        sni = sni.as_deref().unwrap_or(""),
        "connecting"
    );

    let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
    let conn = QuicConnection::spawn(
        ConnectionParts {
            role: EndpointRole::Client,
            location: config.location().to_string(),
            quic,
            socket: Arc::clone(&socket),
            peer_addr,
            config,
            cids: vec![scid.to_vec()],
            initial_state: ConnectionState::Initial,
            server: None,
        },
        rx,
        users,
    );

    let reader = tokio::spawn(run_reader(socket, tx));
    conn.set_reader(reader.abort_handle());
    conn.kick().await;

    Ok(conn)
}

/// Forward packets from the client socket to the driver.
///
/// Ends when the socket fails or the driver goes away; the driver treats
/// the closed channel as loss of the socket.
async fn run_reader(socket: Arc<QuicSocket>, tx: mpsc::Sender<InboundPacket>) {
    let mut buf = vec![0u8; MAX_UDP_PACKET];
    loop {
        let packets = match socket.recv(&mut buf).await {
            Ok(packets) => packets,
            Err(e) if is_icmp_error(&e) => {
                debug!(error = %e, "ICMP error received");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "client socket recv failed");
                return;
            }
        };
        for pkt in packets {
            if tx.send(pkt).await.is_err() {
                return;
            }
        }
    }
}
