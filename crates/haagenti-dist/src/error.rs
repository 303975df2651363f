//! Error types for distributed computation

use thiserror::Error;

/// Boxed error returned by user worker functions
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Distributed computation errors
#[derive(Debug, Error)]
pub enum DistError {
    /// Backend tag not provided by any registered computation model
    #[error("Backend should be one of {available:?}, got '{backend}'")]
    UnknownBackend {
        backend: String,
        available: Vec<&'static str>,
    },

    /// Reduction operator not supported
    #[error("Unsupported reduction operation '{op}', expected one of SUM, PRODUCT, MIN, MAX, AND, OR")]
    UnsupportedOp { op: String },

    /// Invalid launch or model configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An active context was found but could not be adopted
    #[error("Context detection failed: {0}")]
    ContextDetection(String),

    /// A process group or pod core is already active
    #[error("{0} is already initialized")]
    AlreadyInitialized(String),

    /// No process group or pod core is active
    #[error("{0} is not initialized")]
    NotInitialized(String),

    /// Rendezvous could not complete
    #[error("Rendezvous with {address} failed: {reason}")]
    Rendezvous { address: String, reason: String },

    /// Collective communication failed
    #[error("Communication error: {0}")]
    Comm(String),

    /// Buffers of participating ranks do not agree
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// A spawned worker returned an error
    #[error("Worker {local_rank} failed: {reason}")]
    WorkerFailed { local_rank: usize, reason: String },

    /// A spawned worker panicked
    #[error("Worker {local_rank} panicked: {message}")]
    WorkerPanicked { local_rank: usize, message: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for DistError {
    fn from(err: bincode::Error) -> Self {
        DistError::Serialization(err.to_string())
    }
}

/// Result type for distributed operations
pub type Result<T> = std::result::Result<T, DistError>;
