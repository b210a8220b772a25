pub mod correlate;
pub mod icmp;
pub mod pending;
pub(crate) mod receiver;
pub mod socket;
pub mod tcp;
pub mod udp;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use socket2::Socket;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{EngineConfig, Protocol};
use crate::error::EngineError;
use crate::probe::correlate::ReplyKind;
use crate::probe::pending::{MatchedReply, PendingTable};

/// Identifies a probe within a run, packed into the 16-bit wire sequence field
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct ProbeId {
    pub ttl: u8,
    pub seq: u8,
}

impl ProbeId {
    pub fn new(ttl: u8, seq: u8) -> Self {
        Self { ttl, seq }
    }

    /// Encode TTL and cycle sequence into a 16-bit wire sequence
    pub fn to_sequence(&self) -> u16 {
        ((self.ttl as u16) << 8) | (self.seq as u16)
    }

    /// Decode from a 16-bit wire sequence
    pub fn from_sequence(seq: u16) -> Self {
        Self {
            ttl: (seq >> 8) as u8,
            seq: (seq & 0xFF) as u8,
        }
    }
}

/// Identifier embedded in outbound probes, distinct per engine run so a late
/// reply from an earlier run never matches a new run's pending table.
pub fn run_identifier() -> u16 {
    static RUN_COUNTER: AtomicU16 = AtomicU16::new(0);
    let run = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
    (std::process::id() as u16).wrapping_add(run.wrapping_mul(0x9E37))
}

/// Outcome of a single probe
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// A matching reply arrived within the timeout
    Reply {
        responder: IpAddr,
        rtt: Duration,
        /// Whether this reply confirms the destination itself. Normalized per
        /// protocol: an echo reply for ICMP probes, a destination-unreachable
        /// from the target address for UDP/TCP probes.
        is_destination: bool,
    },
    /// No matching reply within the timeout; final for this sequence id
    Timeout,
    /// The probe could not be sent
    Error(String),
}

/// Result of a single probe, terminal once recorded
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub ttl: u8,
    pub seq: u8,
    pub outcome: ProbeOutcome,
    pub observed_at: DateTime<Utc>,
}

impl ProbeResult {
    pub fn reply(ttl: u8, seq: u8, responder: IpAddr, rtt: Duration, is_destination: bool) -> Self {
        Self::new(
            ttl,
            seq,
            ProbeOutcome::Reply {
                responder,
                rtt,
                is_destination,
            },
        )
    }

    pub fn timeout(ttl: u8, seq: u8) -> Self {
        Self::new(ttl, seq, ProbeOutcome::Timeout)
    }

    pub fn error(ttl: u8, seq: u8, reason: impl Into<String>) -> Self {
        Self::new(ttl, seq, ProbeOutcome::Error(reason.into()))
    }

    fn new(ttl: u8, seq: u8, outcome: ProbeOutcome) -> Self {
        Self {
            ttl,
            seq,
            outcome,
            observed_at: Utc::now(),
        }
    }
}

/// Transport seam between the cycle scheduler and the wire.
///
/// Sends one probe at the given TTL and waits up to `timeout` for the
/// matching reply. Implementations must support concurrent calls: probes for
/// different TTLs are dispatched in parallel within a cycle.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, ttl: u8, seq: u8, timeout: Duration) -> ProbeResult;
}

/// Extra time an orphaned pending entry may outlive its probe timeout before
/// the receiver sweep reclaims it
const SWEEP_GRACE: Duration = Duration::from_secs(2);

enum SendTransport {
    Icmp {
        socket: Socket,
    },
    Udp {
        socket: Socket,
        port_base: u16,
    },
    Tcp {
        socket: Socket,
        src_ip: IpAddr,
        src_port: u16,
        port: u16,
    },
}

/// Production prober: real ICMP/UDP/TCP probes over raw sockets, replies
/// correlated by the receiver thread through the pending table.
pub struct SocketProber {
    target: IpAddr,
    protocol: Protocol,
    identifier: u16,
    ipv6: bool,
    // The TTL is a socket option, so option set and send happen under one lock
    send: Mutex<SendTransport>,
    pending: PendingTable,
    cancel: CancellationToken,
}

impl SocketProber {
    /// Acquire sockets and spawn the receiver thread.
    /// Failures here are fatal to `Engine::start()`.
    pub fn new(target: IpAddr, config: &EngineConfig) -> Result<Self, EngineError> {
        let ipv6 = target.is_ipv6();
        let identifier = run_identifier();

        let recv_socket = socket::create_icmp_recv_socket(ipv6).map_err(EngineError::Socket)?;

        let send = match config.protocol {
            Protocol::Icmp => SendTransport::Icmp {
                socket: socket::create_icmp_send_socket(ipv6)
                    .map_err(EngineError::Socket)?
                    .socket,
            },
            Protocol::Udp => SendTransport::Udp {
                socket: socket::create_udp_send_socket(ipv6).map_err(EngineError::Socket)?,
                port_base: config.effective_port(),
            },
            Protocol::Tcp => SendTransport::Tcp {
                socket: socket::create_tcp_send_socket(ipv6).map_err(EngineError::Socket)?,
                src_ip: tcp::local_source_addr(target),
                src_port: 50000,
                port: config.effective_port(),
            },
        };

        let udp_port_base = match &send {
            SendTransport::Udp { port_base, .. } => Some(*port_base),
            _ => None,
        };

        let pending = PendingTable::new();
        let cancel = CancellationToken::new();
        receiver::spawn_receiver(
            recv_socket,
            pending.clone(),
            cancel.child_token(),
            identifier,
            udp_port_base,
            config.probe_timeout + SWEEP_GRACE,
        );

        Ok(Self {
            target,
            protocol: config.protocol,
            identifier,
            ipv6,
            send: Mutex::new(send),
            pending,
            cancel,
        })
    }

    fn dispatch(&self, id: ProbeId) -> anyhow::Result<()> {
        let transport = self.send.lock();
        match &*transport {
            SendTransport::Icmp { socket } => {
                let packet =
                    icmp::build_echo_request(self.identifier, id.to_sequence(), self.ipv6);
                socket::set_hops(socket, id.ttl, self.ipv6)?;
                socket::send_probe(socket, &packet, self.target, 0)?;
            }
            SendTransport::Udp { socket, port_base } => {
                let payload = udp::build_probe_payload(id);
                socket::set_hops(socket, id.ttl, self.ipv6)?;
                // Destination port encodes the TTL for quote-poor routers
                socket::send_probe(socket, &payload, self.target, port_base + id.ttl as u16)?;
            }
            SendTransport::Tcp {
                socket,
                src_ip,
                src_port,
                port,
            } => {
                let packet = tcp::build_syn(id, *src_port, *port, *src_ip, self.target);
                socket::set_hops(socket, id.ttl, self.ipv6)?;
                socket::send_probe(socket, &packet, self.target, *port)?;
            }
        }
        Ok(())
    }

    /// Per-protocol normalization of "destination reached"
    fn confirms_destination(&self, reply: &MatchedReply) -> bool {
        if reply.responder != self.target {
            return false;
        }
        match (self.protocol, reply.kind) {
            (Protocol::Icmp, ReplyKind::EchoReply) => true,
            (Protocol::Udp | Protocol::Tcp, ReplyKind::DestinationUnreachable(_)) => true,
            _ => false,
        }
    }
}

#[async_trait]
impl Prober for SocketProber {
    async fn probe(&self, ttl: u8, seq: u8, timeout: Duration) -> ProbeResult {
        let id = ProbeId::new(ttl, seq);
        let sequence = id.to_sequence();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.pending.register(sequence, reply_tx);

        if let Err(e) = self.dispatch(id) {
            self.pending.remove(sequence);
            debug!(ttl, seq, error = %e, "probe send failed");
            return ProbeResult::error(ttl, seq, e.to_string());
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => {
                let is_destination = self.confirms_destination(&reply);
                ProbeResult::reply(ttl, seq, reply.responder, reply.rtt, is_destination)
            }
            // Sender dropped: the entry was swept, equivalent to a timeout
            Ok(Err(_)) => ProbeResult::timeout(ttl, seq),
            Err(_) => {
                // Timeout is final: removing the entry discards any late reply
                self.pending.remove(sequence);
                ProbeResult::timeout(ttl, seq)
            }
        }
    }
}

impl Drop for SocketProber {
    fn drop(&mut self) {
        // The receiver thread observes this within its poll timeout and exits
        self.cancel.cancel();
    }
}
