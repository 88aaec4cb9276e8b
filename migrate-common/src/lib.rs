//! Common types shared between the migration agent and its tests: the
//! crate-wide error type and the migration data model (request/status).

pub mod migration;

/// Crate-wide error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("system error: {0}")]
    System(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer host agent unreachable: {0}")]
    PeerUnreachable(String),

    #[error("peer host agent refused the request: {0}")]
    PeerRefused(String),
}

pub type Result<T> = std::result::Result<T, Error>;
