//! UDP socket with ancillary receive metadata.
//!
//! Receives go through `quinn-udp`, which reports the ECN codepoint and
//! destination address of each datagram and may coalesce several
//! datagrams into one read (GRO). Receive timestamps are taken when the
//! read completes.

use std::io::{self, IoSliceMut};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use quinn_udp::{RecvMeta, UdpSocketState};
use tokio::io::Interest;
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use crate::error::Result;
use crate::transport::common::{classify_io_error, enable_error_queue};

/// One received UDP datagram.
#[derive(Debug)]
pub struct InboundPacket {
    pub data: Vec<u8>,
    pub from: SocketAddr,
    /// Destination IP reported by the kernel, if available.
    pub dst_ip: Option<IpAddr>,
    /// Two-bit ECN codepoint, if available.
    pub ecn: Option<u8>,
    pub at: Instant,
}

/// Tokio UDP socket plus quinn-udp receive state.
pub struct QuicSocket {
    io: UdpSocket,
    state: UdpSocketState,
    local_addr: SocketAddr,
}

impl QuicSocket {
    /// Bind a socket to `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let io = UdpSocket::bind(addr).await.map_err(classify_io_error)?;
        Self::from_tokio(io)
    }

    /// Wrap an already bound socket.
    pub fn from_tokio(io: UdpSocket) -> Result<Self> {
        let state = UdpSocketState::new((&io).into()).map_err(classify_io_error)?;
        let local_addr = io.local_addr().map_err(classify_io_error)?;

        if let Err(e) = enable_error_queue(&io) {
            debug!(error = %e, "failed to enable IP_RECVERR (non-fatal)");
        }

        Ok(Self {
            io,
            state,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Receive the next batch of datagrams.
    ///
    /// `buf` must be large enough for one coalesced read; the returned
    /// packets own copies of their bytes.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<Vec<InboundPacket>> {
        let mut meta = [RecvMeta::default()];
        let count = loop {
            self.io.readable().await?;
            let mut bufs = [IoSliceMut::new(buf)];
            match self.io.try_io(Interest::READABLE, || {
                self.state.recv((&self.io).into(), &mut bufs, &mut meta)
            }) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        };

        let at = Instant::now();
        let mut packets = Vec::new();
        for m in meta.iter().take(count) {
            let stride = m.stride.max(1);
            for segment in buf[..m.len].chunks(stride) {
                packets.push(InboundPacket {
                    data: segment.to_vec(),
                    from: m.addr,
                    dst_ip: m.dst_ip,
                    ecn: m.ecn.map(|e| e as u8),
                    at,
                });
            }
            trace!(
                from = %m.addr,
                len = m.len,
                stride,
                ecn = ?m.ecn,
                dst_ip = ?m.dst_ip,
                "udp recv"
            );
        }
        Ok(packets)
    }

    /// Send one datagram.
    pub async fn send_to(&self, data: &[u8], to: SocketAddr) -> io::Result<usize> {
        self.io.send_to(data, to).await
    }
}
