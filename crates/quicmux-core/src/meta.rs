//! Side-band metadata carried alongside stream and datagram buffers.
//!
//! Every buffer crossing the demultiplexer or multiplexer carries at most
//! one of [`StreamMeta`] or [`DatagramMeta`].

use std::fmt;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::transport::EndpointRole;
use crate::varint;

/// QUIC stream type, the two low bits of a stream ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum StreamType {
    /// Client-initiated bidirectional.
    ClientBidi = 0,
    /// Server-initiated bidirectional.
    ServerBidi = 1,
    /// Client-initiated unidirectional.
    ClientUni = 2,
    /// Server-initiated unidirectional.
    ServerUni = 3,
}

impl StreamType {
    /// Derive the type from a stream ID.
    pub fn from_id(stream_id: u64) -> Self {
        match stream_id & 0x3 {
            0 => StreamType::ClientBidi,
            1 => StreamType::ServerBidi,
            2 => StreamType::ClientUni,
            _ => StreamType::ServerUni,
        }
    }

    /// Stream type for streams opened by `role`.
    pub fn for_local(role: EndpointRole, bidi: bool) -> Self {
        match (role, bidi) {
            (EndpointRole::Client, true) => StreamType::ClientBidi,
            (EndpointRole::Server, true) => StreamType::ServerBidi,
            (EndpointRole::Client, false) => StreamType::ClientUni,
            (EndpointRole::Server, false) => StreamType::ServerUni,
        }
    }

    /// Raw two-bit value.
    pub fn bits(self) -> u64 {
        self as u64
    }

    pub fn is_bidi(self) -> bool {
        self.bits() & 0x2 == 0
    }

    pub fn is_uni(self) -> bool {
        !self.is_bidi()
    }

    /// Whether a client opened streams of this type.
    pub fn is_client_initiated(self) -> bool {
        self.bits() & 0x1 == 0
    }

    /// Whether `role` opened streams of this type.
    pub fn is_local(self, role: EndpointRole) -> bool {
        self.is_client_initiated() == (role == EndpointRole::Client)
    }

    /// The `n`-th stream ID of this type (0, 4, 8, ... plus the type bits).
    pub fn nth_id(self, n: u64) -> u64 {
        (n << 2) | self.bits()
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamType::ClientBidi => "client-bidi",
            StreamType::ServerBidi => "server-bidi",
            StreamType::ClientUni => "client-uni",
            StreamType::ServerUni => "server-uni",
        };
        f.write_str(name)
    }
}

/// Metadata for one buffer of stream data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamMeta {
    pub stream_id: u64,
    pub stream_type: StreamType,
    /// Byte offset of this buffer within the stream.
    pub offset: u64,
    pub length: u64,
    /// Set on the last buffer of the stream.
    pub is_final: bool,
}

impl StreamMeta {
    /// Build and validate stream metadata.
    ///
    /// The stream type is derived from the ID. Fails with `OutOfRange` if
    /// the ID or `offset + length` do not fit in 62 bits.
    pub fn new(stream_id: u64, offset: u64, length: u64, is_final: bool) -> Result<Self> {
        if stream_id > varint::MAX {
            return Err(Error::OutOfRange { value: stream_id });
        }
        if offset
            .checked_add(length)
            .is_none_or(|end| end > varint::MAX)
        {
            return Err(Error::OutOfRange {
                value: offset.saturating_add(length),
            });
        }

        Ok(Self {
            stream_id,
            stream_type: StreamType::from_id(stream_id),
            offset,
            length,
            is_final,
        })
    }

    /// Offset just past this buffer.
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    /// Metadata for the buffer that immediately follows this one.
    pub fn next(&self, length: u64, is_final: bool) -> Result<Self> {
        Self::new(self.stream_id, self.end(), length, is_final)
    }

    /// True when `self` continues `prev` on the same stream without gap or overlap.
    pub fn follows(&self, prev: &StreamMeta) -> bool {
        self.stream_id == prev.stream_id && self.offset == prev.end()
    }
}

/// Metadata for one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatagramMeta {
    pub length: u64,
}

/// Either kind of metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Meta {
    Stream(StreamMeta),
    Datagram(DatagramMeta),
}

/// A buffer plus its optional metadata.
///
/// `last` is the producer-side end-of-stream marker used when no
/// [`StreamMeta`] has been attached yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaBuffer {
    pub data: Bytes,
    pub meta: Option<Meta>,
    pub last: bool,
}

impl MetaBuffer {
    /// A bare buffer without metadata.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            meta: None,
            last: false,
        }
    }

    /// A bare buffer flagged as the producer's last one.
    pub fn last(data: impl Into<Bytes>) -> Self {
        Self {
            last: true,
            ..Self::new(data)
        }
    }

    /// A buffer tagged with stream metadata.
    pub fn stream(data: impl Into<Bytes>, meta: StreamMeta) -> Self {
        Self {
            data: data.into(),
            last: meta.is_final,
            meta: Some(Meta::Stream(meta)),
        }
    }

    /// A buffer tagged with datagram metadata.
    pub fn datagram(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            meta: Some(Meta::Datagram(DatagramMeta {
                length: data.len() as u64,
            })),
            data,
            last: false,
        }
    }

    pub fn stream_meta(&self) -> Option<&StreamMeta> {
        match &self.meta {
            Some(Meta::Stream(m)) => Some(m),
            _ => None,
        }
    }

    pub fn datagram_meta(&self) -> Option<&DatagramMeta> {
        match &self.meta {
            Some(Meta::Datagram(m)) => Some(m),
            _ => None,
        }
    }

    /// True if this buffer ends its stream.
    pub fn is_final(&self) -> bool {
        self.stream_meta().map(|m| m.is_final).unwrap_or(self.last)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn stream_type_from_id() {
        assert_eq!(StreamType::from_id(0), StreamType::ClientBidi);
        assert_eq!(StreamType::from_id(1), StreamType::ServerBidi);
        assert_eq!(StreamType::from_id(2), StreamType::ClientUni);
        assert_eq!(StreamType::from_id(3), StreamType::ServerUni);
        assert_eq!(StreamType::from_id(7), StreamType::ServerUni);
        assert_eq!(StreamType::from_id(8), StreamType::ClientBidi);
    }

    #[test]
    fn stream_type_direction_and_initiator() {
        assert!(StreamType::ClientBidi.is_bidi());
        assert!(StreamType::ServerUni.is_uni());
        assert!(StreamType::ClientUni.is_client_initiated());
        assert!(!StreamType::ServerBidi.is_client_initiated());

        assert!(StreamType::ClientBidi.is_local(EndpointRole::Client));
        assert!(!StreamType::ClientBidi.is_local(EndpointRole::Server));
        assert!(StreamType::ServerUni.is_local(EndpointRole::Server));
    }

    #[test]
    fn stream_type_for_local() {
        assert_eq!(
            StreamType::for_local(EndpointRole::Client, true),
            StreamType::ClientBidi
        );
        assert_eq!(
            StreamType::for_local(EndpointRole::Server, false),
            StreamType::ServerUni
        );
        assert_eq!(StreamType::ServerUni.nth_id(0), 3);
        assert_eq!(StreamType::ClientBidi.nth_id(2), 8);
    }

    #[test]
    fn stream_meta_validates_range() {
        assert!(StreamMeta::new(0, 0, 10, false).is_ok());
        assert!(matches!(
            StreamMeta::new(1 << 62, 0, 0, false),
            Err(Error::OutOfRange { .. })
        ));
        assert!(matches!(
            StreamMeta::new(0, varint::MAX, 1, false),
            Err(Error::OutOfRange { .. })
        ));
        assert!(StreamMeta::new(0, varint::MAX - 5, 5, true).is_ok());
    }

    #[test]
    fn stream_meta_derives_type() {
        let meta = StreamMeta::new(3, 0, 1, false).unwrap();
        assert_eq!(meta.stream_type, StreamType::ServerUni);
    }

    #[test]
    fn meta_buffer_final_flag() {
        let bare = MetaBuffer::last(vec![1, 2]);
        assert!(bare.is_final());
        assert!(bare.stream_meta().is_none());

        let tagged = MetaBuffer::stream(Bytes::new(), StreamMeta::new(0, 5, 0, true).unwrap());
        assert!(tagged.is_final());
        assert!(tagged.is_empty());

        let dgram = MetaBuffer::datagram(vec![1, 2, 3]);
        assert_eq!(dgram.datagram_meta().unwrap().length, 3);
        assert!(!dgram.is_final());
    }

    proptest! {
        #[test]
        fn successive_offsets_are_contiguous(lengths in proptest::collection::vec(0u64..100_000, 1..64)) {
            let mut prev = StreamMeta::new(4, 0, lengths[0], false).unwrap();
            let mut total = lengths[0];
            for len in &lengths[1..] {
                let next = prev.next(*len, false).unwrap();
                prop_assert!(next.follows(&prev));
                prop_assert_eq!(next.offset, total);
                total += len;
                prev = next;
            }
            prop_assert_eq!(prev.end(), total);
        }
    }
}
