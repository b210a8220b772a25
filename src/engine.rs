//! The engine: top-level controller over the cycle scheduler and hop table.
//!
//! Lifecycle is `Idle → Running → Stopping → Stopped`. Illegal transitions
//! are rejected with `EngineError::InvalidState` instead of being silently
//! ignored. A stopped engine is not restartable; sequence identifiers are
//! per-run, so a fresh engine is the way to measure again.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::feed::{FeedHub, Subscription, SubscriptionId};
use crate::probe::{Prober, SocketProber};
use crate::resolve::{self, RdnsCache, Target};
use crate::state::table::HopTable;
use crate::trace::cycle::CycleScheduler;

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Target configured, no probing
    Idle,
    /// Cycles running, snapshots flowing to subscribers
    Running,
    /// Stop requested; the in-flight cycle is draining
    Stopping,
    /// No further snapshots will be emitted
    Stopped,
}

struct EngineInner {
    host: String,
    config: EngineConfig,
    /// Alternate transport (simulations, tests); None means real sockets
    transport: Option<Arc<dyn Prober>>,
    /// Pre-resolved address when a transport is injected
    fixed_address: Option<IpAddr>,
    state: Mutex<EngineState>,
    /// Guards against concurrent start() while resolution is in flight
    starting: AtomicBool,
    cancel: CancellationToken,
    /// Cancelled by the scheduler task once the engine is fully Stopped
    finished: CancellationToken,
    feed: Arc<FeedHub>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
}

/// MTR-style path analysis engine.
///
/// Cheap to clone; clones share the same run.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Configure an engine for a destination host (hostname or IP literal).
    /// Resolution happens at `start()`.
    pub fn new(host: impl Into<String>, config: EngineConfig) -> Result<Self, EngineError> {
        Self::build(host.into(), config, None, None)
    }

    /// Configure an engine with an injected transport in place of the raw
    /// socket prober. The address stands in for resolution.
    pub fn with_prober(
        host: impl Into<String>,
        address: IpAddr,
        config: EngineConfig,
        prober: Arc<dyn Prober>,
    ) -> Result<Self, EngineError> {
        Self::build(host.into(), config, Some(prober), Some(address))
    }

    fn build(
        host: String,
        config: EngineConfig,
        transport: Option<Arc<dyn Prober>>,
        fixed_address: Option<IpAddr>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                host,
                config,
                transport,
                fixed_address,
                state: Mutex::new(EngineState::Idle),
                starting: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                finished: CancellationToken::new(),
                feed: Arc::new(FeedHub::new()),
                scheduler: Mutex::new(None),
            }),
        })
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        *self.inner.state.lock()
    }

    /// Resolve the target, acquire probe sockets and begin cycling.
    ///
    /// Fails with `Resolution`/`Socket` (engine stays Idle) or
    /// `InvalidState` when the engine is not Idle.
    pub async fn start(&self) -> Result<(), EngineError> {
        {
            let state = self.inner.state.lock();
            if *state != EngineState::Idle || self.inner.starting.swap(true, Ordering::AcqRel) {
                return Err(EngineError::InvalidState {
                    operation: "start",
                    state: *state,
                });
            }
        }

        match self.start_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Engine stays Idle and may be started again after the caller
                // fixes the failure
                self.inner.starting.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<(), EngineError> {
        let inner = &self.inner;

        let target = match inner.fixed_address {
            Some(address) => Target {
                host: inner.host.clone(),
                address,
            },
            None => resolve::resolve_target(&inner.host, inner.config.ip_family).await?,
        };

        let prober: Arc<dyn Prober> = match &inner.transport {
            Some(prober) => Arc::clone(prober),
            None => Arc::new(SocketProber::new(target.address, &inner.config)?),
        };

        let rdns = inner.config.dns_enabled.then(|| Arc::new(RdnsCache::new()));

        let scheduler = CycleScheduler::new(
            prober,
            HopTable::new(target.address, inner.config.max_hops),
            inner.config.clone(),
            rdns,
            inner.cancel.child_token(),
            Arc::clone(&inner.feed),
        );

        info!(host = %target.host, address = %target.address, "engine starting");
        *inner.state.lock() = EngineState::Running;

        let run_inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            scheduler.run().await;
            *run_inner.state.lock() = EngineState::Stopped;
            run_inner.feed.close();
            run_inner.finished.cancel();
            debug!("engine stopped");
        });
        *inner.scheduler.lock() = Some(handle);

        Ok(())
    }

    /// Stop the engine: no new probes are dispatched, in-flight probes
    /// complete or time out, the closing cycle's snapshot is still emitted,
    /// then the feed closes. Returns once the engine is Stopped.
    ///
    /// Legal from Running or Stopping (a second stop waits with the first);
    /// anything else is an `InvalidState` error.
    pub async fn stop(&self) -> Result<(), EngineError> {
        let handle = {
            let mut state = self.inner.state.lock();
            match *state {
                EngineState::Running => {
                    *state = EngineState::Stopping;
                    self.inner.cancel.cancel();
                    self.inner.scheduler.lock().take()
                }
                EngineState::Stopping => None,
                other => {
                    return Err(EngineError::InvalidState {
                        operation: "stop",
                        state: other,
                    });
                }
            }
        };

        match handle {
            Some(handle) => {
                // Scheduler task sets Stopped and closes the feed on its way out
                let _ = handle.await;
            }
            None => self.inner.finished.cancelled().await,
        }

        Ok(())
    }

    /// Subscribe to the snapshot feed. Works in any state without
    /// disrupting in-flight cycles; after Stopped the handle yields None.
    pub fn subscribe(&self) -> Subscription {
        self.inner.feed.subscribe()
    }

    /// Detach a subscriber. Returns false for unknown ids.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.feed.unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_engine_is_idle() {
        let engine = Engine::new("192.0.2.1", EngineConfig::default()).unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_construction() {
        let config = EngineConfig {
            max_hops: 0,
            ..Default::default()
        };
        assert!(matches!(
            Engine::new("192.0.2.1", config),
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_while_idle_is_invalid() {
        let engine = Engine::new("192.0.2.1", EngineConfig::default()).unwrap();
        let err = engine.stop().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidState {
                operation: "stop",
                state: EngineState::Idle,
            }
        ));
        assert_eq!(engine.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn test_resolution_failure_keeps_engine_idle() {
        let config = EngineConfig {
            dns_enabled: false,
            ..Default::default()
        };
        let engine = Engine::new("host.invalid", config).unwrap();

        let err = engine.start().await.unwrap_err();
        assert!(matches!(err, EngineError::Resolution { .. }));
        assert_eq!(engine.state(), EngineState::Idle);
    }
}
