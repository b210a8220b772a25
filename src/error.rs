use thiserror::Error;

use crate::engine::EngineState;

/// Errors surfaced by the engine's public API.
///
/// Per-probe send failures are not represented here: they are recorded in the
/// affected probe's result and never escalate to cycle or engine level.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The target could not be resolved; `start()` fails and the engine stays Idle
    #[error("failed to resolve target '{host}'")]
    Resolution {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    /// Probe socket acquisition failed; `start()` fails and the engine stays Idle
    #[error("failed to set up probe sockets")]
    Socket(#[source] anyhow::Error),

    /// An operation was requested in a state that does not allow it
    #[error("cannot {operation} while engine is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },

    /// The configuration was rejected before the engine ran
    #[error("invalid configuration: {0}")]
    Config(String),
}
