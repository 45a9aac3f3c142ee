//! Error types for the cStor pool manager
//!
//! Provides structured error types for the pool engine client, the
//! reconcilers and the resource store, together with the retry
//! classification the work queue applies to them.

use std::time::Duration;
use thiserror::Error;

/// Error type for the pool manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Resource version conflict: {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Resource {key} has not been available yet")]
    NotReady { key: String },

    // =========================================================================
    // Specification Errors
    // =========================================================================
    #[error("Invalid specification: {0}")]
    InvalidSpec(String),

    // =========================================================================
    // Pool Engine Errors
    // =========================================================================
    #[error("{tool} {args} failed: {output}")]
    CommandFailed {
        tool: String,
        args: String,
        output: String,
    },

    #[error("Malformed output from `{command}`: {reason}")]
    MalformedOutput { command: String, reason: String },

    #[error("Capacity of pool {pool} is missing {field}")]
    MissingCapacityField { pool: String, field: String },

    #[error("Pool {pool} exists, but failed to import")]
    PoolExistsNotImported { pool: String },

    #[error("Pool {pool} imported but status confirmation failed: {reason}")]
    ImportConfirmation { pool: String, reason: String },

    #[error("Pool {pool} could not be imported: {reason}")]
    ImportFailed { pool: String, reason: String },

    #[error("Unable to clear labels on block devices: {}", devices.join(", "))]
    LabelClear { devices: Vec<String> },

    #[error("Pool {pool} is not imported yet")]
    PoolPending { pool: String },

    #[error("Pool {pool} is no longer present on the node")]
    PoolLost { pool: String },

    #[error("Pool {pool} is {health}")]
    PoolUnavailable { pool: String, health: String },

    #[error("Pool engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Pool engine lost its pools: {0}")]
    EngineLost(String),

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    #[error("JSON error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Terminal: operator intervention required
            Error::InvalidSpec(_)
            | Error::PoolExistsNotImported { .. }
            | Error::PoolLost { .. }
            | Error::Configuration(_) => ErrorAction::NoRequeue,

            // Waiting on another reconciler
            Error::NotReady { .. } | Error::PoolPending { .. } => {
                ErrorAction::RequeueAfter(Duration::from_secs(5))
            }

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error means the output of the external tool no longer
    /// matches what the parsers expect
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Error::MalformedOutput { .. } | Error::MissingCapacityField { .. }
        )
    }

    /// Combined output of a failed command, if any
    pub fn command_output(&self) -> Option<&str> {
        match self {
            Error::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// Result type alias for the pool manager
pub type Result<T> = std::result::Result<T, Error>;
