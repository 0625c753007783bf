//! Capability probe sent to demultiplexer peers.

use std::fmt;

use bytes::Bytes;

use crate::constants::STREAM_OPEN_QUERY_NAME;
use crate::meta::StreamType;
use crate::varint;

/// What a channel carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Bidi,
    Uni,
    Datagram,
}

impl ChannelKind {
    pub fn for_stream(stream_id: u64) -> Self {
        if StreamType::from_id(stream_id).is_bidi() {
            ChannelKind::Bidi
        } else {
            ChannelKind::Uni
        }
    }

    pub fn is_stream(self) -> bool {
        self != ChannelKind::Datagram
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Bidi => f.write_str("bidi"),
            ChannelKind::Uni => f.write_str("uni"),
            ChannelKind::Datagram => f.write_str("datagram"),
        }
    }
}

/// Asks a peer whether it wants the channel for a new stream or for the
/// connection's datagrams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpenQuery {
    /// Always `quic-stream-open`.
    pub name: &'static str,
    pub kind: ChannelKind,
    /// Stream ID; `None` for datagrams.
    pub stream_id: Option<u64>,
    pub stream_type: Option<StreamType>,
    /// First buffer received on the stream or the first datagram.
    pub peek: Bytes,
    /// Leading varint of a unidirectional stream, if the peek holds one.
    pub uni_stream_type: Option<u64>,
}

impl StreamOpenQuery {
    pub fn for_stream(stream_id: u64, peek: Bytes) -> Self {
        let stream_type = StreamType::from_id(stream_id);
        let uni_stream_type = if stream_type.is_uni() {
            varint::decode(&peek).ok().map(|(value, _)| value)
        } else {
            None
        };
        Self {
            name: STREAM_OPEN_QUERY_NAME,
            kind: ChannelKind::for_stream(stream_id),
            stream_id: Some(stream_id),
            stream_type: Some(stream_type),
            peek,
            uni_stream_type,
        }
    }

    pub fn for_datagram(peek: Bytes) -> Self {
        Self {
            name: STREAM_OPEN_QUERY_NAME,
            kind: ChannelKind::Datagram,
            stream_id: None,
            stream_type: None,
            peek,
            uni_stream_type: None,
        }
    }

    pub fn is_datagram(&self) -> bool {
        self.kind == ChannelKind::Datagram
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uni_query_reads_stream_type() {
        let query = StreamOpenQuery::for_stream(3, Bytes::from_static(&[0x40, 0x42, 0xff]));
        assert_eq!(query.name, "quic-stream-open");
        assert_eq!(query.kind, ChannelKind::Uni);
        assert_eq!(query.stream_type, Some(StreamType::ServerUni));
        assert_eq!(query.uni_stream_type, Some(0x42));
    }

    #[test]
    fn bidi_query_has_no_stream_type() {
        let query = StreamOpenQuery::for_stream(0, Bytes::from_static(&[0x42]));
        assert_eq!(query.kind, ChannelKind::Bidi);
        assert_eq!(query.uni_stream_type, None);
    }

    #[test]
    fn truncated_uni_varint_is_ignored() {
        let query = StreamOpenQuery::for_stream(2, Bytes::from_static(&[0x80, 0x01]));
        assert_eq!(query.uni_stream_type, None);
    }

    #[test]
    fn datagram_query() {
        let query = StreamOpenQuery::for_datagram(Bytes::from_static(b"x"));
        assert!(query.is_datagram());
        assert_eq!(query.stream_id, None);
        assert!(!query.kind.is_stream());
    }
}
