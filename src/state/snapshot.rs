use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

use crate::resolve::RdnsCache;
use crate::state::hop::{AddressChange, HopRecord};
use crate::state::table::HopTable;

/// Consumer-facing view of one hop, with statistics flattened to durations.
/// Part of a Snapshot; treat as read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopReport {
    pub ttl: u8,
    pub address: Option<IpAddr>,
    /// Reverse DNS name for the current address, when already cached
    pub hostname: Option<String>,
    pub sent: u64,
    pub received: u64,
    pub loss_pct: f64,
    #[serde(with = "opt_duration_serde")]
    pub last_rtt: Option<Duration>,
    #[serde(with = "opt_duration_serde")]
    pub best_rtt: Option<Duration>,
    #[serde(with = "opt_duration_serde")]
    pub worst_rtt: Option<Duration>,
    #[serde(with = "opt_duration_serde")]
    pub avg_rtt: Option<Duration>,
    #[serde(with = "opt_duration_serde")]
    pub stddev: Option<Duration>,
    #[serde(with = "opt_duration_serde")]
    pub jitter: Option<Duration>,
    /// Every identity this hop has held, in observation order
    pub address_history: Vec<AddressChange>,
}

impl HopReport {
    fn from_record(record: &HopRecord, rdns: Option<&RdnsCache>) -> Self {
        let hostname = record
            .current_address
            .and_then(|addr| rdns.and_then(|cache| cache.cached(addr)))
            .flatten();
        Self {
            ttl: record.ttl,
            address: record.current_address,
            hostname,
            sent: record.stats.sent,
            received: record.stats.received,
            loss_pct: record.stats.loss_pct(),
            last_rtt: record.stats.last_rtt,
            best_rtt: record.stats.best_rtt(),
            worst_rtt: record.stats.worst_rtt(),
            avg_rtt: record.stats.avg_rtt(),
            stddev: record.stats.stddev(),
            jitter: record.stats.jitter(),
            address_history: record.address_history().to_vec(),
        }
    }
}

/// One cycle's consistent view of the whole path, emitted to feed subscribers.
/// Hops are ordered strictly by TTL ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub cycle: u64,
    pub hops: Vec<HopReport>,
    pub reached_destination: bool,
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    /// Capture the table's current state. Called once per cycle, after the
    /// aggregation step, so the view is never partially updated.
    pub(crate) fn capture(
        cycle: u64,
        table: &HopTable,
        reached_destination: bool,
        rdns: Option<&RdnsCache>,
    ) -> Self {
        Self {
            cycle,
            hops: table
                .records()
                .iter()
                .map(|record| HopReport::from_record(record, rdns))
                .collect(),
            reached_destination,
            timestamp: Utc::now(),
        }
    }
}

/// Serde helper for Option<Duration>, serialized as integer microseconds
mod opt_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_micros() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let micros = Option::<u64>::deserialize(deserializer)?;
        Ok(micros.map(Duration::from_micros))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 0, 2, last))
    }

    fn populated_table() -> HopTable {
        let mut table = HopTable::new(addr(50), 10);
        for ttl in 1..=3u8 {
            let record = table.entry(ttl).unwrap();
            record.stats.record_sent();
            record.record_address(addr(ttl));
            record.stats.record_reply(Duration::from_millis(ttl as u64 * 10));
        }
        table
    }

    #[test]
    fn test_capture_orders_hops_by_ttl() {
        let table = populated_table();
        let snapshot = Snapshot::capture(7, &table, false, None);

        assert_eq!(snapshot.cycle, 7);
        assert!(!snapshot.reached_destination);
        let ttls: Vec<u8> = snapshot.hops.iter().map(|h| h.ttl).collect();
        assert_eq!(ttls, vec![1, 2, 3]);
    }

    #[test]
    fn test_report_carries_derived_stats() {
        let table = populated_table();
        let snapshot = Snapshot::capture(1, &table, false, None);

        let hop = &snapshot.hops[1];
        assert_eq!(hop.address, Some(addr(2)));
        assert_eq!(hop.sent, 1);
        assert_eq!(hop.received, 1);
        assert_eq!(hop.loss_pct, 0.0);
        assert_eq!(hop.avg_rtt, Some(Duration::from_millis(20)));
        assert_eq!(hop.address_history.len(), 1);
    }

    #[test]
    fn test_snapshot_serialization_roundtrip() {
        let table = populated_table();
        let snapshot = Snapshot::capture(3, &table, true, None);

        let json = serde_json::to_string(&snapshot).unwrap();
        let restored: Snapshot = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.cycle, 3);
        assert!(restored.reached_destination);
        assert_eq!(restored.hops.len(), 3);
        assert_eq!(restored.hops[0].avg_rtt, Some(Duration::from_millis(10)));
    }
}
