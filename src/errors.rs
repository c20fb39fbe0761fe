use std::io;

use thiserror::Error;

use crate::runner::CommandResult;

#[derive(Debug, Error)]
pub enum OxvisorError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("cannot run {command}: {reason}")]
    ProcessError { command: String, reason: String },
    #[error("{command} timed out after {timeout_secs} seconds")]
    ProcessTimedOut { command: String, timeout_secs: u64 },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("pidfile {path}: {reason}")]
    Pidfile { path: String, reason: String },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid configuration file: {0}")]
    Toml(#[from] toml::de::Error),
}

impl OxvisorError {
    pub fn config(message: impl Into<String>) -> Self {
        OxvisorError::Configuration(message.into())
    }
}

/// A service transition that was never confirmed.
///
/// Carries the last result observed so the caller can report it.
#[derive(Debug, Clone, Error)]
#[error("service {service} could not be {action}: {result}")]
pub struct ServiceError {
    pub service: String,
    pub action: &'static str,
    pub result: CommandResult,
}
