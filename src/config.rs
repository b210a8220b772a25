use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::EngineError;

/// Probe protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Protocol {
    #[default]
    Icmp,
    Udp,
    Tcp,
}

/// Address family preference for target resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IpFamily {
    /// Prefer IPv4 when both families resolve
    #[default]
    Auto,
    V4,
    V6,
}

/// Grace added to the probe timeout when no explicit cycle deadline is set
const CYCLE_DEADLINE_GRACE: Duration = Duration::from_secs(1);

/// Engine configuration, immutable for the lifetime of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Probe protocol
    pub protocol: Protocol,
    /// Maximum TTL probed per cycle
    pub max_hops: u8,
    /// Per-probe reply timeout
    #[serde(with = "duration_serde")]
    pub probe_timeout: Duration,
    /// Sleep between cycles
    #[serde(with = "duration_serde")]
    pub cycle_interval: Duration,
    /// Hard deadline for closing a cycle; probe_timeout plus a fixed grace when unset
    #[serde(default, with = "opt_duration_serde")]
    pub cycle_deadline: Option<Duration>,
    /// Destination port base for UDP/TCP probes
    pub port: Option<u16>,
    /// Address family preference for target resolution
    pub ip_family: IpFamily,
    /// Annotate hop addresses with reverse DNS names
    pub dns_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Icmp,
            max_hops: 30,
            probe_timeout: Duration::from_secs(3),
            cycle_interval: Duration::from_secs(1),
            cycle_deadline: None,
            port: None,
            ip_family: IpFamily::Auto,
            dns_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_hops == 0 {
            return Err(EngineError::Config("max_hops must be at least 1".into()));
        }
        if self.probe_timeout.is_zero() {
            return Err(EngineError::Config("probe_timeout must be positive".into()));
        }
        if let Some(deadline) = self.cycle_deadline
            && deadline < self.probe_timeout
        {
            return Err(EngineError::Config(
                "cycle_deadline must not be shorter than probe_timeout".into(),
            ));
        }
        Ok(())
    }

    /// Destination port base for UDP/TCP probes
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(match self.protocol {
            Protocol::Udp => 33434,
            Protocol::Tcp => 80,
            Protocol::Icmp => 0,
        })
    }

    /// Deadline after which a cycle is closed with stragglers counted as timeouts
    pub(crate) fn effective_cycle_deadline(&self) -> Duration {
        self.cycle_deadline
            .unwrap_or(self.probe_timeout + CYCLE_DEADLINE_GRACE)
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Serde helper for Option<Duration>
mod opt_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs_f64))
    }
}
