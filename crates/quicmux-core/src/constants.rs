//! Protocol and engine constants for quicmux.

use std::time::Duration;

// =============================================================================
// Transport Defaults
// =============================================================================

/// Default ALPN used when none is configured.
pub const DEFAULT_ALPN: &str = "quicmux/1";

/// QUIC idle timeout.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default initial_max_data transport parameter.
pub const DEFAULT_MAX_DATA: u64 = 10_000_000;

/// Default initial_max_stream_data_bidi_local transport parameter.
pub const DEFAULT_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 1_000_000;

/// Default initial_max_stream_data_bidi_remote transport parameter.
pub const DEFAULT_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 1_000_000;

/// Default initial_max_stream_data_uni transport parameter.
pub const DEFAULT_MAX_STREAM_DATA_UNI: u64 = 1_000_000;

/// Default initial_max_streams_bidi transport parameter.
pub const DEFAULT_MAX_STREAMS_BIDI: u64 = 100;

/// Default initial_max_streams_uni transport parameter.
pub const DEFAULT_MAX_STREAMS_UNI: u64 = 100;

/// Default max receive UDP payload size.
pub const DEFAULT_MAX_RECV_UDP_PAYLOAD_SIZE: usize = 65535;

/// Default max send UDP payload size.
pub const DEFAULT_MAX_SEND_UDP_PAYLOAD_SIZE: usize = 1350;

/// max_datagram_frame_size quiche advertises once `enable_dgram` is set.
pub const MAX_DATAGRAM_FRAME_SIZE: u64 = 65536;

/// Depth of the library's datagram receive and send queues.
pub const DATAGRAM_QUEUE_LEN: usize = 1024;

// =============================================================================
// Engine Constants
// =============================================================================

/// Length of server-chosen source connection IDs.
pub const SERVER_SCID_LEN: usize = 18;

/// Upper bound on a single wait for congestion/flow-control credit.
pub const SEND_CREDIT_WAIT: Duration = Duration::from_millis(100);

/// Number of PTOs a closing connection lingers in the draining state.
pub const DRAIN_PTO_MULTIPLIER: u32 = 3;

/// max_ack_delay assumed when computing the PTO.
pub const DEFAULT_MAX_ACK_DELAY: Duration = Duration::from_millis(25);

/// Lower bound for the PTO variance term (RFC 9002 kGranularity).
pub const TIMER_GRANULARITY: Duration = Duration::from_millis(1);

/// PTO used before any RTT sample exists (RFC 9002 initial RTT of 333ms).
pub const INITIAL_RTT: Duration = Duration::from_millis(333);

/// Size of the UDP receive and send buffers.
pub const MAX_UDP_PACKET: usize = 65535;

/// Largest chunk read from a stream in one library call.
pub const STREAM_READ_CHUNK: usize = 64 * 1024;

/// Urgency given to streams opened by the engine.
pub const DEFAULT_STREAM_URGENCY: u8 = 127;

/// Depth of each connection's inbound packet queue.
pub const INBOUND_QUEUE_DEPTH: usize = 1024;

/// Application error code used when a consumer refuses a handshake.
pub const APP_ERROR_HANDSHAKE_REFUSED: u64 = 0x1;

/// Base of the CRYPTO_ERROR range (RFC 9000 section 20.1).
pub const CRYPTO_ERROR_BASE: u64 = 0x100;

// =============================================================================
// Interface Constants
// =============================================================================

/// Name carried by the capability probe for a new inbound stream.
pub const STREAM_OPEN_QUERY_NAME: &str = "quic-stream-open";

/// Environment variable naming the TLS key-log export directory.
pub const TLS_EXPORT_DIR_ENV: &str = "GST_QUICLIB_TLS_EXPORT_DIR";

/// Prefix identifying stateless retry tokens minted by this endpoint.
pub const RETRY_TOKEN_PREFIX: &[u8] = b"quicmux";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_frame_size_fits_a_udp_payload() {
        assert_eq!(MAX_DATAGRAM_FRAME_SIZE, 65536);
        assert!(DEFAULT_MAX_SEND_UDP_PAYLOAD_SIZE <= MAX_UDP_PACKET);
    }

    #[test]
    fn server_cid_fits_quiche_limit() {
        assert!(SERVER_SCID_LEN <= quiche::MAX_CONN_ID_LEN);
    }

    #[test]
    fn crypto_error_range() {
        // TLS alerts are carried in the low byte.
        assert_eq!(CRYPTO_ERROR_BASE | 0x2a, 0x12a);
    }
}
