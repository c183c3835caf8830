//! Error types for Collab

use thiserror::Error;

/// Core Collab errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CollabError {
    // Validation errors
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Invalid command {0}")]
    InvalidCommand(String),

    #[error("Cannot parse run ID")]
    MissingRunId,

    #[error("Invalid portfolio: {0}")]
    InvalidPortfolio(String),

    #[error("Invalid asset: {0}")]
    InvalidAsset(String),

    #[error("Invalid issuer: {0}")]
    InvalidIssuer(String),

    #[error("Invalid factor: {0}")]
    InvalidFactor(String),

    #[error("Invalid distributions: {0}")]
    InvalidDistributions(String),

    #[error("Invalid progress: {0}")]
    InvalidProgress(String),

    #[error("Invalid logger: {0}")]
    InvalidLogger(String),

    // Wire errors
    #[error("Invalid wire format: {0}")]
    InvalidWireFormat(String),

    // Simulation errors
    #[error("Unknown simulator: {0}")]
    UnknownSimulator(String),

    #[error("Simulation failed: {0}")]
    SimulationFailed(String),

    // Transport errors
    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Node {node} is not allowed to publish to {channel}")]
    NotPublisher { node: String, channel: String },

    #[error("Publish to {channel} failed: {reason}")]
    PublishFailed { channel: String, reason: String },

    // Scheduling errors
    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("Scheduler is shut down")]
    SchedulerShutdown,

    // Admin errors
    #[error("Command error: {0}")]
    CommandError(String),
}

impl CollabError {
    /// Validation errors are recoverable and always reported through the logger
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            CollabError::InvalidParameters(_)
                | CollabError::InvalidCommand(_)
                | CollabError::MissingRunId
                | CollabError::InvalidPortfolio(_)
                | CollabError::InvalidAsset(_)
                | CollabError::InvalidIssuer(_)
                | CollabError::InvalidFactor(_)
                | CollabError::InvalidDistributions(_)
                | CollabError::InvalidProgress(_)
                | CollabError::InvalidLogger(_)
                | CollabError::InvalidWireFormat(_)
        )
    }
}

/// Result type for Collab operations
pub type CollabResult<T> = Result<T, CollabError>;
