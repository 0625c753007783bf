//! Helpers shared by the client and server sides of the engine.

pub mod cert;
pub mod error;

pub use cert::{generate_self_signed_cert, write_self_signed_cert};
pub use error::{classify_io_error, enable_error_queue, is_icmp_error};
