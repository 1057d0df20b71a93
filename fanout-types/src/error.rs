//! Error types for fanout value objects.

use thiserror::Error;

/// A textual value could not be parsed into one of the harness enums.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// Unknown stream kind
    #[error("unknown stream kind: {0}")]
    StreamKind(String),

    /// Unknown protocol environment
    #[error("unknown environment: {0}")]
    Env(String),

    /// Unknown consent state
    #[error("unknown consent state: {0}")]
    ConsentState(String),

    /// Unknown chaos level
    #[error("unknown chaos level: {0}")]
    ChaosLevel(String),
}

/// A network condition profile is out of range.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConditionsError {
    /// A probability field is outside 0..=1
    #[error("{field} must be within 0..=1, got {value}")]
    Probability {
        /// Field name
        field: &'static str,
        /// Offending value
        value: f64,
    },

    /// A bandwidth cap of zero would stall every call
    #[error("bandwidth limit must be greater than zero")]
    ZeroBandwidth,

    /// Disconnect probability set without a window length
    #[error("disconnect probability requires disconnect_duration_ms")]
    MissingDisconnectDuration,
}
