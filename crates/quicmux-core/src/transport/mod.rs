//! QUIC transport engine.
//!
//! This module provides:
//! - Library-agnostic configuration ([`TransportConfig`])
//! - Connection and stream state types
//! - The consumer callback interface ([`ConnectionHandler`])
//! - ACK bookkeeping and statistics
//! - The quiche-backed engine ([`QuicConnection`], [`QuicServer`])

pub mod ack;
pub mod common;
pub mod config;
pub mod events;
pub mod quiche;
pub mod stats;

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

pub use config::{TlsCredentials, TransportConfig, parse_alpn_list, resolve_location};
pub use events::{CloseReason, ConnectionHandler};
pub use self::quiche::{
    QuicConnection, QuicServer, connect, connect_with_users, listen, listen_with_users,
};
pub use stats::{ConnectionStats, StatsSnapshot};

/// Role of the QUIC endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointRole {
    /// Client endpoint.
    Client,
    /// Server endpoint.
    Server,
}

impl fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointRole::Client => f.write_str("client"),
            EndpointRole::Server => f.write_str("server"),
        }
    }
}

impl std::str::FromStr for EndpointRole {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "client" => Ok(EndpointRole::Client),
            "server" => Ok(EndpointRole::Server),
            other => Err(crate::Error::config(format!("unknown mode: {other}"))),
        }
    }
}

/// Connection lifecycle state.
///
/// Transitions only move forward, except that any state may jump to
/// [`ConnectionState::Closed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ConnectionState {
    #[default]
    None,
    Listening,
    Initial,
    Handshake,
    Open,
    HalfClosed,
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is allowed.
    pub fn can_advance_to(self, next: ConnectionState) -> bool {
        next == ConnectionState::Closed || next > self
    }

    /// True once the connection is closing or closed.
    pub fn is_closing(self) -> bool {
        self >= ConnectionState::HalfClosed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::None => "none",
            ConnectionState::Listening => "listening",
            ConnectionState::Initial => "initial",
            ConnectionState::Handshake => "handshake",
            ConnectionState::Open => "open",
            ConnectionState::HalfClosed => "half-closed",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-stream state bitset.
///
/// Values at or above [`StreamState::ERROR_BASE`] are not flag sets but
/// transient conditions of the connection itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamState(u32);

impl StreamState {
    pub const OPEN: StreamState = StreamState(0x01);
    pub const DATA_BLOCKED: StreamState = StreamState(0x02);
    pub const CONN_BLOCKED: StreamState = StreamState(0x04);
    pub const CLOSED_SENDING: StreamState = StreamState(0x10);
    pub const CLOSED_READING: StreamState = StreamState(0x20);
    pub const CLOSED_BOTH: StreamState = StreamState(0x30);

    pub const ERROR_BASE: u32 = 0x100;
    pub const MAX_STREAMS_REACHED: StreamState = StreamState(0x100);
    pub const CONNECTION_IN_INITIAL: StreamState = StreamState(0x101);
    pub const CONNECTION_CLOSED: StreamState = StreamState(0x102);

    pub const fn empty() -> Self {
        StreamState(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        StreamState(bits)
    }

    /// True if every flag in `other` is set.
    pub fn contains(self, other: StreamState) -> bool {
        !self.is_error() && self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: StreamState) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: StreamState) {
        self.0 &= !other.0;
    }

    /// True for the transient connection-level codes.
    pub fn is_error(self) -> bool {
        self.0 >= Self::ERROR_BASE
    }

    /// Open and still accepting outbound bytes.
    pub fn is_writable(self) -> bool {
        self.contains(Self::OPEN) && !self.contains(Self::CLOSED_SENDING)
    }
}

impl BitOr for StreamState {
    type Output = StreamState;

    fn bitor(self, rhs: StreamState) -> StreamState {
        StreamState(self.0 | rhs.0)
    }
}

impl BitOrAssign for StreamState {
    fn bitor_assign(&mut self, rhs: StreamState) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for StreamState {
    type Output = StreamState;

    fn bitand(self, rhs: StreamState) -> StreamState {
        StreamState(self.0 & rhs.0)
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::MAX_STREAMS_REACHED => return f.write_str("max-streams-reached"),
            Self::CONNECTION_IN_INITIAL => return f.write_str("connection-in-initial"),
            Self::CONNECTION_CLOSED => return f.write_str("connection-closed"),
            s if s.is_error() => return write!(f, "error({:#x})", s.0),
            _ => {}
        }

        let names = [
            (Self::OPEN, "open"),
            (Self::DATA_BLOCKED, "data-blocked"),
            (Self::CONN_BLOCKED, "conn-blocked"),
            (Self::CLOSED_SENDING, "closed-sending"),
            (Self::CLOSED_READING, "closed-reading"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}

/// Transport parameters advertised by one side of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportParams {
    pub max_idle_timeout_ms: u64,
    pub max_udp_payload_size: u64,
    pub max_data: u64,
    pub max_stream_data_bidi_local: u64,
    pub max_stream_data_bidi_remote: u64,
    pub max_stream_data_uni: u64,
    pub max_streams_bidi: u64,
    pub max_streams_uni: u64,
    /// Zero when the DATAGRAM extension is not supported.
    pub max_datagram_frame_size: u64,
}

impl TransportParams {
    pub fn supports_datagrams(&self) -> bool {
        self.max_datagram_frame_size > 0
    }
}

impl From<&::quiche::TransportParams> for TransportParams {
    fn from(tp: &::quiche::TransportParams) -> Self {
        Self {
            max_idle_timeout_ms: tp.max_idle_timeout,
            max_udp_payload_size: tp.max_udp_payload_size,
            max_data: tp.initial_max_data,
            max_stream_data_bidi_local: tp.initial_max_stream_data_bidi_local,
            max_stream_data_bidi_remote: tp.initial_max_stream_data_bidi_remote,
            max_stream_data_uni: tp.initial_max_stream_data_uni,
            max_streams_bidi: tp.initial_max_streams_bidi,
            max_streams_uni: tp.initial_max_streams_uni,
            max_datagram_frame_size: tp.max_datagram_frame_size.unwrap_or(0),
        }
    }
}

/// Result of queueing a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramTicket {
    /// Monotonically increasing per connection, starting at 0.
    pub id: u64,
    /// False if the library refused the payload (queue full); the ticket
    /// will never be acknowledged.
    pub accepted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_moves_forward() {
        use ConnectionState::*;
        assert!(None.can_advance_to(Initial));
        assert!(Initial.can_advance_to(Handshake));
        assert!(Handshake.can_advance_to(Open));
        assert!(Open.can_advance_to(HalfClosed));
        assert!(!Open.can_advance_to(Handshake));
        assert!(!Open.can_advance_to(Open));
    }

    #[test]
    fn any_state_can_close() {
        use ConnectionState::*;
        for state in [None, Listening, Initial, Handshake, Open, HalfClosed, Closed] {
            assert!(state.can_advance_to(Closed));
        }
        assert!(HalfClosed.is_closing());
        assert!(!Open.is_closing());
    }

    #[test]
    fn stream_state_flags() {
        let mut state = StreamState::OPEN;
        assert!(state.is_writable());
        state |= StreamState::CLOSED_SENDING;
        assert!(!state.is_writable());
        state.insert(StreamState::CLOSED_READING);
        assert!(state.contains(StreamState::CLOSED_BOTH));
        state.remove(StreamState::CLOSED_SENDING);
        assert!(!state.contains(StreamState::CLOSED_BOTH));
    }

    #[test]
    fn stream_state_error_codes() {
        assert!(StreamState::CONNECTION_CLOSED.is_error());
        assert!(!StreamState::CONNECTION_CLOSED.contains(StreamState::OPEN));
        assert!(!StreamState::CONNECTION_IN_INITIAL.is_writable());
        assert!(!StreamState::CLOSED_BOTH.is_error());
    }

    #[test]
    fn stream_state_display() {
        assert_eq!(StreamState::empty().to_string(), "none");
        assert_eq!(
            (StreamState::OPEN | StreamState::DATA_BLOCKED).to_string(),
            "open|data-blocked"
        );
        assert_eq!(
            StreamState::MAX_STREAMS_REACHED.to_string(),
            "max-streams-reached"
        );
    }

    #[test]
    fn endpoint_role_parse() {
        assert_eq!(
            "client".parse::<EndpointRole>().unwrap(),
            EndpointRole::Client
        );
        assert!("peer".parse::<EndpointRole>().is_err());
    }

    #[test]
    fn transport_params_datagram_support() {
        let mut tp = TransportParams::default();
        assert!(!tp.supports_datagrams());
        tp.max_datagram_frame_size = 65535;
        assert!(tp.supports_datagrams());
    }
}
