use crate::types::SensorKind;
use thiserror::Error;

/// Fusion engine error types
///
/// Bad measurements never surface here from the numerical filters; those are
/// skipped in place. These variants cover lifecycle misuse, data-integrity
/// faults detected at the buffer boundary, and I/O.
#[derive(Error, Debug)]
pub enum FusionError {
    #[error("Invalid {kind} measurement: {reason}")]
    InvalidMeasurement { kind: SensorKind, reason: String },

    #[error("Non-monotonic {stream} timestamp: {current} after {previous}")]
    NonMonotonicTimestamp {
        stream: String,
        previous: u64,
        current: u64,
    },

    #[error("Invalid GPS fix: {0}")]
    InvalidFix(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Session already recording")]
    AlreadyRecording,

    #[error("Session not recording")]
    NotRecording,

    #[error("Batch recomputation cancelled")]
    Cancelled,

    #[error("Fusion channel closed")]
    ChannelClosed,

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("Parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for fusion operations
pub type FusionResult<T> = Result<T, FusionError>;
