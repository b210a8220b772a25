//! End-of-cycle statistics aggregation.
//!
//! The hop table has exactly one writer: the scheduler calls `apply_cycle`
//! once per cycle with the full batch of results, so snapshot capture always
//! sees a fully-updated table, never a partial one.

use tracing::debug;

use crate::probe::{ProbeOutcome, ProbeResult};
use crate::state::table::HopTable;

/// Apply one cycle's batch of probe results to the hop table.
///
/// Every result increments `sent` for its hop. Replies additionally update
/// the hop's identity and latency statistics; timeouts and errors contribute
/// only loss. Returns the TTL at which the destination is currently
/// confirmed, if any.
pub(crate) fn apply_cycle(table: &mut HopTable, results: &[ProbeResult]) -> Option<u8> {
    for result in results {
        let Some(record) = table.entry(result.ttl) else {
            continue;
        };
        record.stats.record_sent();

        match &result.outcome {
            ProbeOutcome::Reply {
                responder,
                rtt,
                is_destination,
            } => {
                record.stats.record_reply(*rtt);
                if record.record_address(*responder) {
                    debug!(ttl = result.ttl, responder = %responder, "hop identity changed");
                }
                if *is_destination {
                    debug!(ttl = result.ttl, "destination confirmed");
                }
            }
            ProbeOutcome::Timeout => {}
            ProbeOutcome::Error(reason) => {
                debug!(ttl = result.ttl, %reason, "probe error counted as loss");
            }
        }
    }

    table.destination_ttl()
}
