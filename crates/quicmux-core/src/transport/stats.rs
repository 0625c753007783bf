//! Per-connection traffic statistics.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use super::events::lock;

// =============================================================================
// Connection Statistics
// =============================================================================

#[derive(Debug, Default, Clone, Copy)]
struct Window {
    first: Option<Instant>,
    last: Option<Instant>,
}

impl Window {
    fn mark(&mut self, at: Instant) {
        self.first.get_or_insert(at);
        self.last = Some(at);
    }

    fn span(&self) -> Option<Duration> {
        match (self.first, self.last) {
            (Some(first), Some(last)) => Some(last.saturating_duration_since(first)),
            _ => None,
        }
    }
}

/// Counters updated by the driver, readable from any task.
///
/// Packet and byte counters are always kept. Receive/send timestamps, and
/// therefore rates, are only recorded when stats are enabled.
#[derive(Debug, Default)]
pub struct ConnectionStats {
    enabled: AtomicBool,
    packets_recv: AtomicU64,
    bytes_recv: AtomicU64,
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    packets_lost: AtomicU64,
    rtt_us: AtomicU64,
    cwnd: AtomicU64,
    recv_window: Mutex<Window>,
    send_window: Mutex<Window>,
}

impl ConnectionStats {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn record_recv(&self, bytes: usize, at: Instant) {
        self.packets_recv.fetch_add(1, Ordering::Relaxed);
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
        if self.is_enabled() {
            lock(&self.recv_window).mark(at);
        }
    }

    pub(crate) fn record_send(&self, bytes: usize, at: Instant) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        if self.is_enabled() {
            lock(&self.send_window).mark(at);
        }
    }

    pub(crate) fn record_path(&self, rtt: Duration, cwnd: usize, lost: usize) {
        self.rtt_us.store(rtt.as_micros() as u64, Ordering::Relaxed);
        self.cwnd.store(cwnd as u64, Ordering::Relaxed);
        self.packets_lost.store(lost as u64, Ordering::Relaxed);
    }

    pub fn packets_recv(&self) -> u64 {
        self.packets_recv.load(Ordering::Relaxed)
    }

    pub fn bytes_recv(&self) -> u64 {
        self.bytes_recv.load(Ordering::Relaxed)
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Smoothed RTT reported by the library at the last update.
    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.rtt_us.load(Ordering::Relaxed))
    }

    /// Receive rate in bytes per second between the first and last packet.
    pub fn recv_rate(&self) -> Option<f64> {
        rate(self.bytes_recv(), lock(&self.recv_window).span())
    }

    /// Send rate in bytes per second between the first and last packet.
    pub fn send_rate(&self) -> Option<f64> {
        rate(self.bytes_sent(), lock(&self.send_window).span())
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets_recv: self.packets_recv(),
            bytes_recv: self.bytes_recv(),
            packets_sent: self.packets_sent(),
            bytes_sent: self.bytes_sent(),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
            rtt_us: self.rtt_us.load(Ordering::Relaxed),
            cwnd: self.cwnd.load(Ordering::Relaxed),
            recv_rate_bps: self.recv_rate(),
            send_rate_bps: self.send_rate(),
        }
    }
}

fn rate(bytes: u64, span: Option<Duration>) -> Option<f64> {
    let secs = span?.as_secs_f64();
    if secs <= 0.0 {
        return None;
    }
    Some(bytes as f64 / secs)
}

/// Point-in-time copy of [`ConnectionStats`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub packets_recv: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_lost: u64,
    pub rtt_us: u64,
    pub cwnd: u64,
    pub recv_rate_bps: Option<f64>,
    pub send_rate_bps: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_always_recorded() {
        let stats = ConnectionStats::new(false);
        let now = Instant::now();
        stats.record_recv(100, now);
        stats.record_send(40, now);
        stats.record_send(60, now);

        assert_eq!(stats.packets_recv(), 1);
        assert_eq!(stats.bytes_recv(), 100);
        assert_eq!(stats.packets_sent(), 2);
        assert_eq!(stats.bytes_sent(), 100);
        assert_eq!(stats.recv_rate(), None);
    }

    #[test]
    fn rates_need_enabled_stats_and_a_time_span() {
        let stats = ConnectionStats::new(true);
        let start = Instant::now();
        stats.record_recv(500, start);
        assert_eq!(stats.recv_rate(), None);

        stats.record_recv(500, start + Duration::from_millis(500));
        let rate = stats.recv_rate().unwrap();
        assert!((rate - 2000.0).abs() < 1e-6);
    }

    #[test]
    fn snapshot_serializes() {
        let stats = ConnectionStats::new(true);
        stats.record_path(Duration::from_millis(12), 14_000, 2);
        let snap = stats.snapshot();
        assert_eq!(snap.rtt_us, 12_000);
        assert_eq!(snap.cwnd, 14_000);
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"packets_lost\":2"));
    }
}
