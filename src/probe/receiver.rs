use anyhow::Result;
use std::mem::MaybeUninit;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::probe::correlate::{self, Correlation};
use crate::probe::pending::{MatchedReply, PendingTable};
use crate::probe::socket::{self, SocketInfo};

/// Maximum consecutive receive errors before the receiver gives up
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

/// How often the pending table is swept for orphaned entries
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// The receiver listens for ICMP replies and resolves pending probes.
/// It runs on a dedicated OS thread because the receive socket is a blocking
/// raw socket polled with a short read timeout.
pub(crate) struct Receiver {
    socket_info: SocketInfo,
    pending: PendingTable,
    cancel: CancellationToken,
    identifier: u16,
    udp_port_base: Option<u16>,
    /// Entries older than this are orphans (their probe task is gone)
    sweep_horizon: Duration,
}

impl Receiver {
    fn run(self) -> Result<()> {
        let is_dgram = self.socket_info.is_dgram;
        let socket = &self.socket_info.socket;

        let mut buffer = [MaybeUninit::<u8>::uninit(); 1500];
        let mut consecutive_errors: u32 = 0;
        let mut last_sweep = Instant::now();

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match socket::recv_reply(socket, &mut buffer) {
                Ok((len, source)) => {
                    consecutive_errors = 0;
                    let data = socket::filled(&buffer, len);

                    if let Some(parsed) = correlate::parse_reply(
                        data,
                        source,
                        self.identifier,
                        self.udp_port_base,
                        is_dgram,
                    ) {
                        let entry = match parsed.correlation {
                            Correlation::Sequence(seq) => self.pending.remove(seq),
                            Correlation::UdpTtl(ttl) => self.pending.remove_by_ttl(ttl),
                        };

                        match entry {
                            Some(probe) => {
                                let reply = MatchedReply {
                                    responder: parsed.responder,
                                    kind: parsed.kind,
                                    rtt: probe.sent_at.elapsed(),
                                };
                                // Failure means the probe task already timed out
                                if probe.reply_tx.send(reply).is_err() {
                                    trace!(responder = %parsed.responder, "probe task gone before reply delivery");
                                }
                            }
                            None => {
                                // Late or duplicate reply; its sequence is already final
                                trace!(responder = %parsed.responder, "discarding unmatched reply");
                            }
                        }
                    }
                }
                Err(e) => {
                    let is_poll_timeout = e.downcast_ref::<std::io::Error>().is_some_and(|io| {
                        matches!(
                            io.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        )
                    });

                    if is_poll_timeout {
                        consecutive_errors = 0;
                    } else {
                        consecutive_errors += 1;
                        warn!(
                            error = %e,
                            consecutive_errors,
                            "receive error"
                        );
                        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                            return Err(anyhow::anyhow!(
                                "receiver stopped after {consecutive_errors} consecutive errors (last: {e})"
                            ));
                        }
                    }
                }
            }

            if last_sweep.elapsed() >= SWEEP_INTERVAL {
                let evicted = self.pending.sweep(self.sweep_horizon);
                if evicted > 0 {
                    trace!(evicted, "swept orphaned pending probes");
                }
                last_sweep = Instant::now();
            }
        }

        Ok(())
    }
}

/// Spawn the receiver on a dedicated OS thread
pub(crate) fn spawn_receiver(
    socket_info: SocketInfo,
    pending: PendingTable,
    cancel: CancellationToken,
    identifier: u16,
    udp_port_base: Option<u16>,
    sweep_horizon: Duration,
) -> std::thread::JoinHandle<Result<()>> {
    std::thread::spawn(move || {
        let receiver = Receiver {
            socket_info,
            pending,
            cancel,
            identifier,
            udp_port_base,
            sweep_horizon,
        };

        match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| receiver.run())) {
            Ok(result) => result,
            Err(panic_payload) => {
                let msg = if let Some(s) = panic_payload.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic_payload.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                Err(anyhow::anyhow!("receiver panicked: {msg}"))
            }
        }
    })
}
