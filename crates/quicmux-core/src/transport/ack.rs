//! Bookkeeping of sent data awaiting acknowledgement.
//!
//! quiche reports no per-frame acknowledgements, so each stream keeps every
//! slice it sent, in offset order, until the stream retires; retirement
//! releases them all at once. Datagrams are tracked by ticket in the order
//! they were queued and released oldest first as they leave the send queue.

use std::collections::VecDeque;

use bytes::Bytes;

/// A sent region of a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentSlice {
    pub offset: u64,
    pub data: Bytes,
}

impl SentSlice {
    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// In-flight slices of one stream, ordered by offset.
#[derive(Debug, Default)]
pub struct AckTracker {
    slices: VecDeque<SentSlice>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sent slice. Empty slices are ignored.
    pub fn push(&mut self, offset: u64, data: Bytes) {
        if data.is_empty() {
            return;
        }
        debug_assert!(self.slices.back().is_none_or(|s| s.end() <= offset));
        self.slices.push_back(SentSlice { offset, data });
    }

    /// Release everything still outstanding.
    pub fn release_all(&mut self) -> Vec<SentSlice> {
        self.slices.drain(..).collect()
    }

    /// Drop everything without acknowledging it.
    pub fn discard(&mut self) -> usize {
        let n = self.slices.len();
        self.slices.clear();
        n
    }

    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// Bytes sent but not yet acknowledged.
    pub fn outstanding_bytes(&self) -> u64 {
        self.slices.iter().map(|s| s.data.len() as u64).sum()
    }
}

/// Queued datagrams awaiting delivery, keyed by ticket.
#[derive(Debug, Default)]
pub struct DatagramTracker {
    next_ticket: u64,
    pending: VecDeque<(u64, Bytes)>,
}

impl DatagramTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next ticket. Tickets increase by one from 0 and are
    /// consumed even if the payload is later refused.
    pub fn next_ticket(&mut self) -> u64 {
        let ticket = self.next_ticket;
        self.next_ticket += 1;
        ticket
    }

    /// Remember an accepted payload under `ticket`.
    pub fn stash(&mut self, ticket: u64, data: Bytes) {
        self.pending.push_back((ticket, data));
    }

    /// Release the `count` oldest tickets.
    pub fn release_oldest(&mut self, count: usize) -> Vec<(u64, Bytes)> {
        let count = count.min(self.pending.len());
        self.pending.drain(..count).collect()
    }

    /// Forget everything outstanding.
    pub fn clear(&mut self) -> usize {
        let n = self.pending.len();
        self.pending.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
