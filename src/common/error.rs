//! Error types for shardring

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === KV transport errors ===
    #[error("KV store error: {0}")]
    Kv(String),

    #[error("CAS aborted: {0}")]
    CasAborted(String),

    // === Quorum errors ===
    #[error("too many unhealthy instances in the ring")]
    TooManyUnhealthy,

    #[error("at least {required} live replicas required, could only find {found}")]
    NotEnoughHealthyInstances { required: usize, found: usize },

    #[error("at least {required} live replicas required across different availability zones, could only find {found}")]
    NotEnoughHealthyZones { required: usize, found: usize },

    #[error("the ring is empty")]
    EmptyRing,

    #[error("no active partition found in the ring")]
    NoActivePartition,

    // === Invariant violations ===
    #[error("inconsistent ring tokens information: token {0} has no owner")]
    InconsistentTokensInfo(u32),

    // === State transition violations ===
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("partition {0} state change is locked")]
    PartitionStateChangeLocked(i32),

    // === Lookup errors ===
    #[error("instance {0} not found in the ring")]
    InstanceNotFound(String),

    #[error("partition {0} not found in the ring")]
    PartitionNotFound(i32),

    // === Token generation ===
    #[error("token generation failed: {0}")]
    TokenGeneration(String),

    // === Config errors ===
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // === I/O and serialization ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    // === Generic ===
    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Only KV transport failures are retryable; quorum and state-machine
    /// errors must be handled by the caller's own policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Kv(_) | Error::CasAborted(_))
    }

    /// Is this an error the client caused (as opposed to a server fault)?
    ///
    /// Used by the batch executor's default error classifier.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig(_) | Error::InvalidStateTransition { .. }
        )
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
