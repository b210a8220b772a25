use std::net::IpAddr;

use crate::state::hop::HopRecord;

/// TTL-indexed table of discovered hops for one engine run.
///
/// Records are created zero-initialized on first access and kept contiguous:
/// requesting TTL n materializes every record up to n, so the table never has
/// gaps below the highest observed TTL. Size is bounded by `max_hops`.
#[derive(Debug)]
pub struct HopTable {
    destination: IpAddr,
    max_hops: u8,
    records: Vec<HopRecord>,
}

impl HopTable {
    pub fn new(destination: IpAddr, max_hops: u8) -> Self {
        Self {
            destination,
            max_hops,
            records: Vec::with_capacity(max_hops as usize),
        }
    }

    pub fn destination(&self) -> IpAddr {
        self.destination
    }

    /// Get hop by TTL (1-indexed), if it has been materialized
    pub fn get(&self, ttl: u8) -> Option<&HopRecord> {
        if ttl == 0 || ttl as usize > self.records.len() {
            None
        } else {
            Some(&self.records[ttl as usize - 1])
        }
    }

    /// Get or create the record for a TTL, materializing intermediate records.
    /// Returns None for TTL 0 or TTLs beyond `max_hops`.
    pub fn entry(&mut self, ttl: u8) -> Option<&mut HopRecord> {
        if ttl == 0 || ttl > self.max_hops {
            return None;
        }
        while self.records.len() < ttl as usize {
            let next_ttl = self.records.len() as u8 + 1;
            self.records.push(HopRecord::new(next_ttl));
        }
        Some(&mut self.records[ttl as usize - 1])
    }

    /// Record the responder observed at a TTL (append-on-change, see HopRecord)
    pub fn record_address(&mut self, ttl: u8, address: IpAddr) -> bool {
        self.entry(ttl)
            .map(|record| record.record_address(address))
            .unwrap_or(false)
    }

    /// TTL of the first hop whose current identity is the destination itself.
    ///
    /// Recomputed from current identities rather than latched, so a route
    /// change at the destination-bearing hop re-opens the TTLs beyond it.
    pub fn destination_ttl(&self) -> Option<u8> {
        self.records
            .iter()
            .find(|r| r.current_address == Some(self.destination))
            .map(|r| r.ttl)
    }

    /// All materialized records, ordered by TTL ascending
    pub fn records(&self) -> &[HopRecord] {
        &self.records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn table() -> HopTable {
        HopTable::new(addr(99), 30)
    }

    #[test]
    fn test_entry_materializes_contiguously() {
        let mut table = table();

        assert!(table.get(1).is_none());
        table.entry(5).unwrap();

        // No gaps below the highest observed TTL
        assert_eq!(table.records().len(), 5);
        for ttl in 1..=5u8 {
            assert_eq!(table.get(ttl).unwrap().ttl, ttl);
        }
    }

    #[test]
    fn test_entry_bounds() {
        let mut table = table();

        assert!(table.entry(0).is_none());
        assert!(table.entry(31).is_none());
        assert!(table.entry(30).is_some());
        assert_eq!(table.records().len(), 30);
    }

    #[test]
    fn test_destination_ttl_tracks_current_identity() {
        let mut table = table();

        table.record_address(1, addr(1));
        table.record_address(2, addr(2));
        assert_eq!(table.destination_ttl(), None);

        table.record_address(3, addr(99));
        assert_eq!(table.destination_ttl(), Some(3));

        // Route change at the destination-bearing hop re-opens the path
        table.record_address(3, addr(3));
        assert_eq!(table.destination_ttl(), None);

        table.record_address(5, addr(99));
        assert_eq!(table.destination_ttl(), Some(5));
    }

    #[test]
    fn test_record_address_out_of_range_is_ignored() {
        let mut table = table();
        assert!(!table.record_address(0, addr(1)));
        assert!(!table.record_address(200, addr(1)));
        assert!(table.records().is_empty());
    }
}
