use std::io;

use thiserror::Error;

/// Errors surfaced by the engine's internal operations.
///
/// Command-level failures are reported to clients as `{"error": "..."}`
/// JSON objects (see [`crate::dispatch`]); this type is the Rust-side
/// carrier for those messages plus the handful of fatal startup paths
/// that abort the process before the poll loop starts.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("label '{0}' already registered")]
    DuplicateLabel(String),

    #[error("no participant registered under label '{0}'")]
    UnknownLabel(String),

    #[error("device open failed: {0}")]
    DeviceOpen(String),

    #[error("hardware rate {hw_rate} is not an integer multiple of requested rate {rate}")]
    RateNotDivisible { hw_rate: u32, rate: u32 },

    #[error("plugin rejected: {0}")]
    PluginRejected(String),

    #[error("plugin output '{0}' not found")]
    UnknownOutput(String),

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Render as the single-line JSON object every failing command reply uses.
    pub fn to_json_reply(&self) -> serde_json::Value {
        serde_json::json!({ "error": self.to_string() })
    }
}
