// Public API - engine, configuration, feed and data types
pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod probe;
pub mod resolve;
pub mod state;

// Internal implementation - not part of public API
pub(crate) mod trace;

pub use config::{EngineConfig, IpFamily, Protocol};
pub use engine::{Engine, EngineState};
pub use error::EngineError;
pub use feed::{Subscription, SubscriptionId};
pub use state::snapshot::{HopReport, Snapshot};
