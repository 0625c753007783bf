//! quiche-backed QUIC engine.
//!
//! This module provides:
//! - [`connect`]: client connection establishment
//! - [`listen`]: a server sharing one socket between its connections
//! - [`QuicConnection`]: the per-connection engine handle
//! - UDP socket and TLS key-log helpers

mod client;
mod connection;
mod keylog;
mod server;
mod socket;

pub use client::{connect, connect_with_users};
pub use connection::QuicConnection;
pub use keylog::{keylog_file_name, open_keylog};
pub use server::{QuicServer, listen, listen_with_users};
pub use socket::{InboundPacket, QuicSocket};
