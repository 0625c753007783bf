//! quicmux-cli: command-line driver for quicmux.
//!
//! Provides:
//! - `serve`: a listener that accepts every inbound stream and reports it
//! - `send`: a client that writes a payload on one multiplexer channel

pub mod cli;
pub mod send;
pub mod serve;

pub use cli::{Cli, CliLogFormat, Command, SendArgs, ServeArgs, TransportArgs};
