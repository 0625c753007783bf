//! quicmux-test-utils: Test infrastructure for quicmux.
//!
//! Provides:
//! - TestCerts: self-signed TLS material in a temporary directory
//! - RecordingHandler: a connection handler that records every event
//! - ScriptedPeer: a demultiplexer peer with a fixed probe answer

mod recording;
mod scripted_peer;
mod test_certs;

pub use recording::{Event, RecordingHandler};
pub use scripted_peer::ScriptedPeer;
pub use test_certs::TestCerts;

use std::time::Duration;

/// Upper bound for any single wait in loopback tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);
