//! `quicmux serve`: accept every inbound stream and report it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use quicmux_core::{
    ChannelKind, ConnectionHandler, DemuxPeer, Demultiplexer, InboundChannel, Registry, Result,
    StreamOpenQuery, TransportContext,
};

use crate::cli::ServeArgs;

/// Totals for one finished inbound channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelReport {
    pub conn: u64,
    pub kind: ChannelKind,
    pub stream_id: Option<u64>,
    pub buffers: u64,
    pub bytes: u64,
    pub fin: bool,
}

impl ChannelReport {
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "conn": self.conn,
            "kind": self.kind.to_string(),
            "stream_id": self.stream_id,
            "buffers": self.buffers,
            "bytes": self.bytes,
            "fin": self.fin,
        })
    }
}

/// Demultiplexer peer that accepts everything and reports each channel.
pub struct ReportingPeer {
    reset_code: Option<u64>,
}

impl ReportingPeer {
    pub fn new(reset_code: Option<u64>) -> Arc<Self> {
        Arc::new(Self { reset_code })
    }
}

/// Read `channel` to its end and summarize it.
pub async fn drain_channel(mut channel: InboundChannel) -> ChannelReport {
    let mut report = ChannelReport {
        conn: channel.connection().id(),
        kind: channel.kind(),
        stream_id: channel.stream_id(),
        buffers: 0,
        bytes: 0,
        fin: false,
    };
    while let Some(buf) = channel.recv().await {
        report.buffers += 1;
        report.bytes += buf.len() as u64;
        report.fin |= buf.is_final();
        debug!(
            stream_id = ?report.stream_id,
            len = buf.len(),
            total = report.bytes,
            "received buffer"
        );
    }
    report
}

#[async_trait]
impl DemuxPeer for ReportingPeer {
    async fn probe(&self, query: &StreamOpenQuery) -> bool {
        info!(
            stream_id = ?query.stream_id,
            kind = %query.kind,
            uni_stream_type = ?query.uni_stream_type,
            peek_len = query.peek.len(),
            "new inbound channel"
        );
        true
    }

    async fn link(&self, channel: InboundChannel) {
        let reset_code = self.reset_code;
        tokio::spawn(async move {
            let conn = channel.connection().clone();
            let report = drain_channel(channel).await;
            info!(
                conn = report.conn,
                stream_id = ?report.stream_id,
                bytes = report.bytes,
                fin = report.fin,
                "channel finished"
            );
            println!("{}", report.to_json());

            // Finish our side of bidi streams so they can be retired.
            if report.kind == ChannelKind::Bidi
                && let Some(stream_id) = report.stream_id
                && let Err(e) = conn.close_stream(stream_id, reset_code.unwrap_or(0)).await
            {
                debug!(stream_id, error = %e, "failed to close stream");
            }
        });
    }
}

pub async fn run(args: &ServeArgs) -> Result<()> {
    let config = args.config()?;
    let demux = Demultiplexer::new();
    demux.add_peer(ReportingPeer::new(args.reset_code)).await;

    let user: Arc<dyn ConnectionHandler> = demux;
    let server = Registry::global()
        .get_or_create_server(Arc::clone(&user), config)
        .await?;
    info!(addr = %server.local_addr(), alpn = ?server.alpns(), "serving");
    eprintln!("quicmux: listening on {}", server.local_addr());

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to wait for ctrl-c");
    }

    info!("shutting down");
    Registry::global()
        .release(&TransportContext::Server(server), &user)
        .await;
    Ok(())
}
