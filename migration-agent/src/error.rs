//! Error types specific to driving a migration, layered on top of
//! `migrate_common::Error`.
//!
//! Keeps the hypervisor abort signal (the `operation aborted` libvirt error
//! the driver must distinguish from every other failure) as a first-class
//! variant instead of string-matching.

use crate::migration::collaborators::DomainError;

/// Error surfaced while a migration is being driven. Distinguishes a
/// user-requested abort (mapped to `StatusCode::MigCancelErr`) from any
/// other failure (mapped to `StatusCode::MigrateErr`).
#[derive(Debug)]
pub enum MigrationError {
    /// The hypervisor reported the job was aborted by `abortJob`.
    Aborted,
    /// Any other failure, already rendered to a message.
    Failed(String),
}

impl std::fmt::Display for MigrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationError::Aborted => write!(f, "migration canceled"),
            MigrationError::Failed(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for MigrationError {}

impl From<DomainError> for MigrationError {
    fn from(err: DomainError) -> Self {
        if err.is_operation_aborted() {
            MigrationError::Aborted
        } else {
            MigrationError::Failed(err.to_string())
        }
    }
}

impl From<migrate_common::Error> for MigrationError {
    fn from(err: migrate_common::Error) -> Self {
        MigrationError::Failed(err.to_string())
    }
}
