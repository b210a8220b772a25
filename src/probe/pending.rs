//! Shared pending-probe tracking.
//!
//! Probe tasks insert an entry keyed by the 16-bit wire sequence before
//! sending, then await the paired oneshot. The receiver removes the entry
//! when a matching reply arrives; the probe task removes it when the timeout
//! expires, which makes timeouts final — a late reply finds no entry and is
//! discarded. A periodic sweep reclaims entries orphaned by aborted tasks.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::probe::correlate::ReplyKind;

/// Reply delivered from the receiver to the awaiting probe task
#[derive(Debug)]
pub struct MatchedReply {
    pub responder: IpAddr,
    pub kind: ReplyKind,
    pub rtt: Duration,
}

/// A probe that has been sent and is awaiting a reply
#[derive(Debug)]
pub struct PendingProbe {
    pub sent_at: Instant,
    pub reply_tx: oneshot::Sender<MatchedReply>,
}

/// Thread-safe table of in-flight probes keyed by wire sequence
#[derive(Clone, Default)]
pub struct PendingTable {
    inner: Arc<Mutex<HashMap<u16, PendingProbe>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a probe about to be sent. Registration happens before the
    /// send so a fast reply cannot race the entry.
    pub fn register(&self, sequence: u16, reply_tx: oneshot::Sender<MatchedReply>) {
        self.inner.lock().insert(
            sequence,
            PendingProbe {
                sent_at: Instant::now(),
                reply_tx,
            },
        );
    }

    /// Remove and return the entry for a sequence, if still pending
    pub fn remove(&self, sequence: u16) -> Option<PendingProbe> {
        self.inner.lock().remove(&sequence)
    }

    /// Remove the entry for a TTL regardless of its cycle sequence.
    /// Used for UDP replies where only the destination port survived the quote;
    /// at most one probe per TTL is in flight at a time.
    pub fn remove_by_ttl(&self, ttl: u8) -> Option<PendingProbe> {
        let mut inner = self.inner.lock();
        let key = inner.keys().find(|seq| (*seq >> 8) as u8 == ttl).copied()?;
        inner.remove(&key)
    }

    /// Evict entries older than `horizon`, dropping their senders so any
    /// still-awaiting task observes a timeout. Returns the eviction count.
    pub fn sweep(&self, horizon: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.len();
        inner.retain(|_, probe| now.duration_since(probe.sent_at) <= horizon);
        before - inner.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}
