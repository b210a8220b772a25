//! The cycle scheduler: one concurrent measurement round per cycle.
//!
//! Each cycle fans out one probe task per TTL, fans them back in under a
//! cycle deadline, aggregates the batch, and publishes a snapshot. A stop
//! request is only observed between cycles, so in-flight probes always
//! complete or time out naturally and the closing cycle still publishes.

use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::feed::FeedHub;
use crate::probe::{ProbeResult, Prober};
use crate::resolve::RdnsCache;
use crate::state::snapshot::Snapshot;
use crate::state::table::HopTable;
use crate::trace::aggregate;

pub(crate) struct CycleScheduler {
    prober: Arc<dyn Prober>,
    table: HopTable,
    config: EngineConfig,
    rdns: Option<Arc<RdnsCache>>,
    cancel: CancellationToken,
    feed: Arc<FeedHub>,
}

impl CycleScheduler {
    pub(crate) fn new(
        prober: Arc<dyn Prober>,
        table: HopTable,
        config: EngineConfig,
        rdns: Option<Arc<RdnsCache>>,
        cancel: CancellationToken,
        feed: Arc<FeedHub>,
    ) -> Self {
        Self {
            prober,
            table,
            config,
            rdns,
            cancel,
            feed,
        }
    }

    /// Run cycles until cancelled. Consumes the scheduler; the prober (and
    /// with it the receiver thread) is released when the loop exits.
    pub(crate) async fn run(mut self) {
        let mut cycle: u64 = 0;

        while !self.cancel.is_cancelled() {
            cycle += 1;
            let snapshot = self.run_cycle(cycle).await;
            self.prefetch_hostnames();
            self.feed.publish(snapshot);

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.cycle_interval) => {}
            }
        }

        debug!(cycles = cycle, "scheduler loop finished");
    }

    /// One cycle: fan out a probe per TTL, fan in under the cycle deadline,
    /// aggregate, capture a snapshot.
    async fn run_cycle(&mut self, cycle: u64) -> Snapshot {
        let seq = (cycle & 0xFF) as u8;
        // Stop at the destination hop once it is known; the full range
        // re-opens automatically if its address changes
        let limit = self
            .table
            .destination_ttl()
            .unwrap_or(self.config.max_hops)
            .min(self.config.max_hops);

        let mut tasks = JoinSet::new();
        for ttl in 1..=limit {
            let prober = Arc::clone(&self.prober);
            let timeout = self.config.probe_timeout;
            tasks.spawn(async move { prober.probe(ttl, seq, timeout).await });
        }

        let mut results = self.collect(&mut tasks, limit as usize).await;

        // Synthesize timeouts for TTLs the deadline cut off, so sent counts
        // and loss never drift from what was actually dispatched
        for ttl in 1..=limit {
            if !results.iter().any(|r| r.ttl == ttl) {
                results.push(ProbeResult::timeout(ttl, seq));
            }
        }
        results.sort_by_key(|r| r.ttl);

        let destination_ttl = aggregate::apply_cycle(&mut self.table, &results);
        Snapshot::capture(
            cycle,
            &self.table,
            destination_ttl.is_some(),
            self.rdns.as_deref(),
        )
    }

    /// Join all probe tasks, aborting stragglers at the cycle deadline.
    /// Aborted probes leave pending entries behind; the receiver sweep
    /// reclaims those.
    async fn collect(
        &self,
        tasks: &mut JoinSet<ProbeResult>,
        capacity: usize,
    ) -> Vec<ProbeResult> {
        let deadline =
            tokio::time::Instant::now() + self.config.effective_cycle_deadline();
        let mut results = Vec::with_capacity(capacity);

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(result))) => results.push(result),
                Ok(Some(Err(join_err))) => {
                    warn!(error = %join_err, "probe task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    let outstanding = tasks.len();
                    warn!(outstanding, "cycle deadline elapsed, aborting stragglers");
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        results
    }

    /// Kick reverse lookups for addresses not yet in the cache. Runs off the
    /// probe path; results show up in later snapshots.
    fn prefetch_hostnames(&self) {
        let Some(rdns) = &self.rdns else {
            return;
        };

        let missing: Vec<_> = self
            .table
            .records()
            .iter()
            .filter_map(|r| r.current_address)
            .filter(|addr| rdns.cached(*addr).is_none())
            .collect();
        if missing.is_empty() {
            return;
        }

        let rdns = Arc::clone(rdns);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            for addr in missing {
                if cancel.is_cancelled() {
                    break;
                }
                rdns.reverse_lookup(addr).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    fn addr(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    /// Replies instantly for TTLs below `dest_ttl`, confirms the destination
    /// at `dest_ttl`, and hangs past the deadline above it
    struct ScriptedProber {
        dest_ttl: u8,
        dest: IpAddr,
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, ttl: u8, seq: u8, timeout: Duration) -> ProbeResult {
            if ttl < self.dest_ttl {
                ProbeResult::reply(ttl, seq, addr(ttl), Duration::from_millis(ttl as u64), false)
            } else if ttl == self.dest_ttl {
                ProbeResult::reply(ttl, seq, self.dest, Duration::from_millis(30), true)
            } else {
                tokio::time::sleep(timeout * 10).await;
                ProbeResult::timeout(ttl, seq)
            }
        }
    }

    fn scheduler(dest_ttl: u8, max_hops: u8) -> CycleScheduler {
        let dest = addr(99);
        let config = EngineConfig {
            max_hops,
            probe_timeout: Duration::from_millis(50),
            cycle_interval: Duration::ZERO,
            cycle_deadline: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        CycleScheduler::new(
            Arc::new(ScriptedProber { dest_ttl, dest }),
            HopTable::new(dest, max_hops),
            config,
            None,
            CancellationToken::new(),
            Arc::new(FeedHub::new()),
        )
    }

    #[tokio::test]
    async fn test_cycle_orders_hops_and_synthesizes_timeouts() {
        let mut scheduler = scheduler(3, 5);
        let snapshot = scheduler.run_cycle(1).await;

        // TTLs 4 and 5 hung past the deadline and were recorded as timeouts
        assert_eq!(snapshot.hops.len(), 5);
        let ttls: Vec<u8> = snapshot.hops.iter().map(|h| h.ttl).collect();
        assert_eq!(ttls, vec![1, 2, 3, 4, 5]);
        assert_eq!(snapshot.hops[3].sent, 1);
        assert_eq!(snapshot.hops[3].received, 0);
        assert!(snapshot.reached_destination);
    }

    #[tokio::test]
    async fn test_next_cycle_stops_at_destination_ttl() {
        let mut scheduler = scheduler(3, 5);
        scheduler.run_cycle(1).await;
        let snapshot = scheduler.run_cycle(2).await;

        // Hops beyond the confirmed destination were not probed again
        assert_eq!(snapshot.hops[3].sent, 1);
        assert_eq!(snapshot.hops[2].sent, 2);
        assert_eq!(snapshot.cycle, 2);
    }
}
