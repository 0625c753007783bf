//! Stream and datagram channels on top of a connection.
//!
//! This module provides:
//! - [`Demultiplexer`]: fans inbound stream and datagram buffers out to
//!   per-stream [`InboundChannel`]s, choosing a consumer by probing
//!   registered [`DemuxPeer`]s
//! - [`Multiplexer`]: opens streams on demand for [`OutboundChannel`]s and
//!   tags their buffers with stream metadata
//! - [`StreamOpenQuery`]: the capability probe exchanged between them

mod demux;
mod mux;
mod probe;

pub use demux::{DemuxPeer, Demultiplexer, InboundChannel};
pub use mux::{ChannelRequest, Multiplexer, OutboundChannel};
pub use probe::{ChannelKind, StreamOpenQuery};
