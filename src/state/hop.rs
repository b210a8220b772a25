use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// One observed identity for a hop, appended when the responding address changes.
/// The history is append-only so route changes can be audited after the fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressChange {
    pub address: IpAddr,
    pub first_seen: DateTime<Utc>,
}

/// Rolling statistics for a single hop.
///
/// Latency uses Welford's online algorithm over the lifetime of the run.
/// Jitter is the lifetime mean absolute difference between consecutive
/// received RTTs, so samples of 10, 20 and 30 ms yield a jitter of 10 ms.
#[derive(Debug, Clone, Default)]
pub struct HopStats {
    pub sent: u64,
    pub received: u64,
    pub last_rtt: Option<Duration>,
    min_rtt: Option<Duration>,
    max_rtt: Option<Duration>,
    mean_rtt: f64, // microseconds
    m2: f64,       // for stddev calculation
    jitter_sum: f64,
}

impl HopStats {
    /// Record that a probe was dispatched for this hop
    pub fn record_sent(&mut self) {
        self.sent += 1;
    }

    /// Update stats with a new RTT sample
    pub fn record_reply(&mut self, rtt: Duration) {
        self.received += 1;

        let rtt_micros = rtt.as_micros() as f64;

        if self.min_rtt.is_none_or(|min| rtt < min) {
            self.min_rtt = Some(rtt);
        }
        if self.max_rtt.is_none_or(|max| rtt > max) {
            self.max_rtt = Some(rtt);
        }

        // Welford's online algorithm for mean and variance
        let delta = rtt_micros - self.mean_rtt;
        self.mean_rtt += delta / self.received as f64;
        self.m2 += delta * (rtt_micros - self.mean_rtt);

        if let Some(last) = self.last_rtt {
            self.jitter_sum += (rtt_micros - last.as_micros() as f64).abs();
        }
        self.last_rtt = Some(rtt);
    }

    /// Loss percentage: 100 * (sent - received) / sent, 0 when nothing was sent
    pub fn loss_pct(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            100.0 * (self.sent - self.received) as f64 / self.sent as f64
        }
    }

    /// Best (lowest) RTT seen so far
    pub fn best_rtt(&self) -> Option<Duration> {
        self.min_rtt
    }

    /// Worst (highest) RTT seen so far
    pub fn worst_rtt(&self) -> Option<Duration> {
        self.max_rtt
    }

    /// Lifetime running mean RTT
    pub fn avg_rtt(&self) -> Option<Duration> {
        (self.received > 0).then(|| Duration::from_micros(self.mean_rtt as u64))
    }

    /// Population standard deviation; needs at least two samples
    pub fn stddev(&self) -> Option<Duration> {
        if self.received < 2 {
            return None;
        }
        let variance = self.m2 / self.received as f64;
        Some(Duration::from_micros(variance.sqrt() as u64))
    }

    /// Mean absolute difference between consecutive received RTTs
    pub fn jitter(&self) -> Option<Duration> {
        if self.received < 2 {
            return None;
        }
        let mean = self.jitter_sum / (self.received - 1) as f64;
        Some(Duration::from_micros(mean as u64))
    }
}

/// A single hop (TTL level) in the path
#[derive(Debug, Clone)]
pub struct HopRecord {
    pub ttl: u8,
    /// Responder currently associated with this TTL, None while unresolved
    pub current_address: Option<IpAddr>,
    address_history: Vec<AddressChange>,
    pub stats: HopStats,
}

impl HopRecord {
    pub fn new(ttl: u8) -> Self {
        Self {
            ttl,
            current_address: None,
            address_history: Vec::new(),
            stats: HopStats::default(),
        }
    }

    /// Record the responder for this hop. A changed address is appended to the
    /// history, never overwriting prior entries; unchanged addresses are a no-op.
    /// Returns true if the hop's identity changed.
    pub fn record_address(&mut self, address: IpAddr) -> bool {
        if self.current_address == Some(address) {
            return false;
        }
        self.address_history.push(AddressChange {
            address,
            first_seen: Utc::now(),
        });
        self.current_address = Some(address);
        true
    }

    /// All identities this hop has held, in observation order
    pub fn address_history(&self) -> &[AddressChange] {
        &self.address_history
    }
}
