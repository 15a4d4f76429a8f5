//! Error types for rota.

use std::path::PathBuf;

use crate::worker::state::ExitReason;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Unknown account key {0}")]
    UnknownAccount(String),

    #[error("Unknown resource {0}")]
    UnknownResource(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the on-disk state records.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Record at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the shared accounting counter and its IPC transport.
#[derive(Debug, thiserror::Error)]
pub enum CounterError {
    #[error("Accounting service unreachable at {path}: {reason}")]
    Unreachable { path: PathBuf, reason: String },

    #[error("Accounting service closed the connection")]
    Disconnected,

    #[error("Unexpected reply from accounting service: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures reported by the external session driver.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("Driver failed to start: {0}")]
    Spawn(String),

    #[error("Driver operation {op} failed: {reason}")]
    OperationFailed { op: String, reason: String },

    #[error("Driver exited unexpectedly")]
    Exited,

    #[error("Malformed driver reply to {op}: {reason}")]
    BadReply { op: String, reason: String },

    #[error("IO error talking to driver: {0}")]
    Io(#[from] std::io::Error),
}

impl DriverError {
    pub fn failed(op: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::OperationFailed {
            op: op.into(),
            reason: reason.into(),
        }
    }
}

/// Failures inside a worker session. Never crosses the worker boundary; each
/// variant is folded into an [`ExitReason`].
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Target alias {alias} not offered by account (available: {available})")]
    TargetNotFound { alias: String, available: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Counter(#[from] CounterError),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

impl WorkerError {
    /// Classify this failure as a terminal exit reason.
    pub fn exit_reason(&self) -> ExitReason {
        match self {
            Self::Driver(_) => ExitReason::DriverError,
            _ => ExitReason::Unknown,
        }
    }
}

/// Errors spawning a worker.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Could not locate the rota executable: {0}")]
    Executable(std::io::Error),

    #[error("Cannot bind worker: {0}")]
    Binding(#[from] ConfigError),

    #[error("Failed to spawn worker {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}
