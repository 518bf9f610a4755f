//! Error types for AuraBridge

use crate::types::{CalibrationState, SignalKind};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("a collection session is already active")]
    AlreadyActive,

    #[error("settings cannot change while a session is active")]
    SessionActive,

    #[error("worker already running: {name}")]
    AlreadyRunning { name: String },

    #[error("calibration already in progress (state: {state})")]
    AlreadyCalibrating { state: CalibrationState },

    #[error("eye gaze not calibrated (state: {state})")]
    NotCalibrated { state: CalibrationState },

    #[error("worker not found: {name}")]
    NotFound { name: String },

    #[error("capture device unavailable: {reason}")]
    DeviceUnavailable { reason: String },

    #[error("{signal} source failure: {message}")]
    SourceFailure { signal: SignalKind, message: String },

    #[error("workers did not stop in time: {}", names.join(", "))]
    ShutdownTimeout { names: Vec<String> },

    #[error("failed to start {signal}: {source}")]
    SignalStartFailed {
        signal: SignalKind,
        #[source]
        source: Box<Error>,
    },

    #[error("model training failed: {0}")]
    TrainingFailed(String),

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("invalid params for {command}: {message}")]
    InvalidParams { command: String, message: String },

    #[error("sink error: {0}")]
    Sink(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn already_running(name: impl Into<String>) -> Self {
        Self::AlreadyRunning { name: name.into() }
    }

    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    pub fn device_unavailable(reason: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            reason: reason.into(),
        }
    }

    pub fn source_failure(signal: SignalKind, message: impl Into<String>) -> Self {
        Self::SourceFailure {
            signal,
            message: message.into(),
        }
    }

    pub fn invalid_params(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParams {
            command: command.into(),
            message: message.into(),
        }
    }

    pub fn signal_start_failed(signal: SignalKind, source: Error) -> Self {
        Self::SignalStartFailed {
            signal,
            source: Box::new(source),
        }
    }

    /// Stable machine-readable tag carried in error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyActive => "already_active",
            Self::SessionActive => "session_active",
            Self::AlreadyRunning { .. } => "already_running",
            Self::AlreadyCalibrating { .. } => "already_calibrating",
            Self::NotCalibrated { .. } => "not_calibrated",
            Self::NotFound { .. } => "not_found",
            Self::DeviceUnavailable { .. } => "device_unavailable",
            Self::SourceFailure { .. } => "source_failure",
            Self::ShutdownTimeout { .. } => "shutdown_timeout",
            Self::SignalStartFailed { .. } => "signal_start_failed",
            Self::TrainingFailed(_) => "training_failed",
            Self::UnknownCommand(_) => "unknown_command",
            Self::InvalidParams { .. } => "invalid_params",
            Self::Sink(_) => "sink",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Internal(_) => "internal",
        }
    }

    /// The signal this error is attributed to, if any.
    pub fn signal(&self) -> Option<SignalKind> {
        match self {
            Self::SourceFailure { signal, .. } | Self::SignalStartFailed { signal, .. } => {
                Some(*signal)
            }
            _ => None,
        }
    }
}
