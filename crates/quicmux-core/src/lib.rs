//! quicmux-core: QUIC stream and datagram multiplexing.
//!
//! This crate provides:
//! - QUIC variable-length integer codec
//! - Stream/datagram metadata carried alongside buffers
//! - A per-connection transport engine driving quiche
//! - A process-wide registry sharing connections between consumers
//! - The demultiplexer (inbound fan-out) and multiplexer (outbound fan-in)
//! - Logging setup

pub mod channel;
pub mod constants;
pub mod error;
pub mod logging;
pub mod meta;
pub mod registry;
pub mod transport;
pub mod varint;

pub use channel::{
    ChannelKind, ChannelRequest, DemuxPeer, Demultiplexer, InboundChannel, Multiplexer,
    OutboundChannel, StreamOpenQuery,
};
pub use error::{Error, Result};
pub use logging::{LogFormat, init_logging};
pub use meta::{DatagramMeta, Meta, MetaBuffer, StreamMeta, StreamType};
pub use registry::{Registry, TransportContext};
pub use transport::{
    ConnectionHandler, ConnectionState, DatagramTicket, EndpointRole, QuicConnection, QuicServer,
    StreamState, TransportConfig,
};
