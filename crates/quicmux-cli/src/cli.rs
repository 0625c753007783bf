//! Command-line argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use quicmux_core::constants::DEFAULT_ALPN;
use quicmux_core::{Result, TransportConfig};

/// Log output format for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum CliLogFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// Structured JSON output.
    Json,
}

impl From<CliLogFormat> for quicmux_core::LogFormat {
    fn from(fmt: CliLogFormat) -> Self {
        match fmt {
            CliLogFormat::Text => quicmux_core::LogFormat::Text,
            CliLogFormat::Json => quicmux_core::LogFormat::Json,
        }
    }
}

/// quicmux - QUIC stream and datagram multiplexing.
#[derive(Debug, Parser)]
#[command(
    name = "quicmux",
    version,
    about = "quicmux - QUIC stream and datagram multiplexing"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Increase verbosity (can be repeated: -v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log to file instead of stderr
    #[arg(long = "log-file", value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    /// Log output format
    #[arg(long = "log-format", default_value = "text", global = true)]
    pub log_format: CliLogFormat,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Listen and report every inbound stream and datagram
    Serve(ServeArgs),
    /// Connect and send a payload on one stream or as datagrams
    Send(SendArgs),
}

/// Transport parameters shared by both commands.
#[derive(Debug, Clone, Default, Args)]
pub struct TransportArgs {
    /// Streams of each kind the peer may open (initial_max_streams_bidi)
    #[arg(long = "max-streams-bidi-remote", value_name = "N")]
    pub max_streams_bidi_remote: Option<u64>,

    /// Unidirectional streams the peer may open
    #[arg(long = "max-streams-uni-remote", value_name = "N")]
    pub max_streams_uni_remote: Option<u64>,

    /// Per-stream receive window for peer-opened bidirectional streams
    #[arg(long = "max-stream-data-bidi-remote", value_name = "BYTES")]
    pub max_stream_data_bidi_remote: Option<u64>,

    /// Per-stream receive window for unidirectional streams
    #[arg(long = "max-stream-data-uni-remote", value_name = "BYTES")]
    pub max_stream_data_uni_remote: Option<u64>,

    /// Connection receive window
    #[arg(long = "max-data-remote", value_name = "BYTES")]
    pub max_data_remote: Option<u64>,

    /// Negotiate the DATAGRAM extension
    #[arg(long = "enable-datagram")]
    pub enable_datagram: bool,

    /// Record packet statistics
    #[arg(long = "enable-stats")]
    pub enable_stats: bool,

    /// Idle timeout in milliseconds
    #[arg(long = "idle-timeout", value_name = "MS")]
    pub idle_timeout_ms: Option<u64>,

    /// Directory for TLS key logs (overrides GST_QUICLIB_TLS_EXPORT_DIR)
    #[arg(long = "tls-export-dir", value_name = "DIR")]
    pub tls_export_dir: Option<PathBuf>,
}

impl TransportArgs {
    /// Apply the given flags on top of `config`.
    pub fn apply(&self, mut config: TransportConfig) -> Result<TransportConfig> {
        let numeric = [
            ("max-streams-bidi-remote", self.max_streams_bidi_remote),
            ("max-streams-uni-remote", self.max_streams_uni_remote),
            ("max-stream-data-bidi-remote", self.max_stream_data_bidi_remote),
            ("max-stream-data-uni-remote", self.max_stream_data_uni_remote),
            ("max-data-remote", self.max_data_remote),
            ("idle-timeout", self.idle_timeout_ms),
        ];
        for (name, value) in numeric {
            if let Some(value) = value {
                config.set_option(name, &value.to_string())?;
            }
        }
        config = config
            .with_datagrams(self.enable_datagram)
            .with_stats(self.enable_stats);
        if let Some(dir) = &self.tls_export_dir {
            config = config.with_tls_export_dir(Some(dir.clone()));
        }
        Ok(config)
    }
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(short = 'l', long = "location", default_value = "0.0.0.0:4433")]
    pub location: String,

    /// Accepted ALPN identifiers, comma-separated
    #[arg(long = "alpn", default_value = DEFAULT_ALPN)]
    pub alpn: String,

    /// TLS certificate file (PEM format)
    #[arg(short = 'c', long = "cert", value_name = "FILE")]
    pub cert: PathBuf,

    /// TLS private key file (PEM format)
    #[arg(short = 'k', long = "key", value_name = "FILE")]
    pub key: PathBuf,

    /// Server name
    #[arg(long = "sni")]
    pub sni: Option<String>,

    /// Validate client addresses with a RETRY round trip
    #[arg(long = "stateless-retry")]
    pub stateless_retry: bool,

    /// Reset streams with this code after reading them instead of finishing
    #[arg(long = "reset-code", value_name = "CODE")]
    pub reset_code: Option<u64>,

    #[command(flatten)]
    pub transport: TransportArgs,
}

impl ServeArgs {
    pub fn config(&self) -> Result<TransportConfig> {
        let mut config = TransportConfig::server(self.location.clone());
        config.set_option("alpn", &self.alpn)?;
        config.set_option("cert", &self.cert.to_string_lossy())?;
        config.set_option("privkey", &self.key.to_string_lossy())?;
        if let Some(sni) = &self.sni {
            config.set_option("sni", sni)?;
        }
        let config = config.with_stateless_retry(self.stateless_retry);
        self.transport.apply(config)
    }
}

#[derive(Debug, Args)]
pub struct SendArgs {
    /// Server address (host:port or quic://host:port)
    #[arg(short = 'l', long = "location")]
    pub location: String,

    /// ALPN identifier to request
    #[arg(long = "alpn", default_value = DEFAULT_ALPN)]
    pub alpn: String,

    /// Send on a unidirectional stream
    #[arg(long = "uni", conflicts_with = "datagram")]
    pub uni: bool,

    /// Send the payload as datagrams
    #[arg(long = "datagram")]
    pub datagram: bool,

    /// File to send
    #[arg(short = 'f', long = "file", value_name = "FILE", conflicts_with = "bytes")]
    pub file: Option<PathBuf>,

    /// Send this many generated bytes
    #[arg(short = 'n', long = "bytes", value_name = "N", default_value = "1000")]
    pub bytes: usize,

    /// Server name for TLS (defaults to the location host)
    #[arg(long = "sni")]
    pub sni: Option<String>,

    /// Skip certificate verification
    #[arg(short = 'k', long = "insecure")]
    pub insecure: bool,

    /// Seconds to wait for the handshake and for acknowledgement
    #[arg(long = "timeout", default_value = "10", value_name = "SECONDS")]
    pub timeout_secs: u64,

    #[command(flatten)]
    pub transport: TransportArgs,
}

impl SendArgs {
    pub fn config(&self) -> Result<TransportConfig> {
        let mut config = TransportConfig::client(self.location.clone())
            .with_alpn(self.alpn.trim())
            .verify_peer(!self.insecure);
        if let Some(sni) = &self.sni {
            config.set_option("sni", sni)?;
        }
        let transport = TransportArgs {
            enable_datagram: self.transport.enable_datagram || self.datagram,
            ..self.transport.clone()
        };
        transport.apply(config)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quicmux_core::EndpointRole;

    #[test]
    fn parse_serve() {
        let cli = Cli::parse_from([
            "quicmux",
            "-vv",
            "serve",
            "--location",
            "127.0.0.1:4433",
            "--alpn",
            "a/1,b/1",
            "--cert",
            "cert.pem",
            "--key",
            "key.pem",
            "--max-stream-data-bidi-remote",
            "100",
            "--enable-datagram",
        ]);
        assert_eq!(cli.verbose, 2);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.config().unwrap();
        assert_eq!(config.role(), EndpointRole::Server);
        assert_eq!(config.alpn(), &["a/1".to_string(), "b/1".to_string()]);
        assert_eq!(config.max_stream_data_bidi_remote(), 100);
        assert!(config.datagrams_enabled());
    }

    #[test]
    fn parse_send_defaults() {
        let cli = Cli::parse_from(["quicmux", "send", "-l", "localhost:4433", "--insecure"]);
        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert_eq!(args.bytes, 1000);
        assert_eq!(args.timeout(), Duration::from_secs(10));
        let config = args.config().unwrap();
        assert!(!config.should_verify_peer());
        assert_eq!(config.alpn(), &[DEFAULT_ALPN.to_string()]);
        assert!(!config.datagrams_enabled());
    }

    #[test]
    fn datagram_send_enables_extension() {
        let cli = Cli::parse_from(["quicmux", "send", "-l", "127.0.0.1:1", "--datagram"]);
        let Command::Send(args) = cli.command else {
            panic!("expected send");
        };
        assert!(args.config().unwrap().datagrams_enabled());
    }

    #[test]
    fn uni_conflicts_with_datagram() {
        let result =
            Cli::try_parse_from(["quicmux", "send", "-l", "x:1", "--uni", "--datagram"]);
        assert!(result.is_err());
    }

    #[test]
    fn log_format_json() {
        let cli = Cli::parse_from([
            "quicmux",
            "send",
            "-l",
            "x:1",
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.log_format, CliLogFormat::Json);
    }
}
