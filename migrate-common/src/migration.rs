//! Migration data model: the request that starts a migration and the
//! mutable status object observed through `getStat()`-equivalent polling.

use serde::{Deserialize, Serialize};

/// Whether the VM moves to a peer host or is serialized to a local file.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MigrationMode {
    Remote,
    File,
}

/// Whether the guest keeps running for the duration of the transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MigrationMethod {
    Online,
    Offline,
}

/// A migration request, immutable once built. Constructed by the host-agent
/// API layer and bound to a target VM before being submitted to the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRequest {
    /// Peer host identifier, or empty when `mode == File`.
    pub destination: String,
    pub mode: MigrationMode,
    pub method: MigrationMethod,
    /// Opaque path/params for the `File` mode output.
    pub destination_params: String,
    /// Request encrypted tunnelled transport from the hypervisor.
    pub tunneled: bool,
    /// Instruct the hypervisor to abort on first I/O error.
    pub abort_on_error: bool,
    /// Optional direct data-plane address; the peer's control address is
    /// reused when absent.
    pub destination_qemu_address: Option<String>,
    /// Upper bound, in milliseconds, for the final stop-the-world pause.
    pub target_downtime: u64,
}

impl MigrationRequest {
    /// A remote (peer host) migration request with no tunnelling/abort
    /// overrides.
    pub fn remote(destination: impl Into<String>, method: MigrationMethod, target_downtime: u64) -> Self {
        Self {
            destination: destination.into(),
            mode: MigrationMode::Remote,
            method,
            destination_params: String::new(),
            tunneled: false,
            abort_on_error: false,
            destination_qemu_address: None,
            target_downtime,
        }
    }

    /// A save-to-file request; `destination` is unused in this mode.
    pub fn to_file(destination_params: impl Into<String>, target_downtime: u64) -> Self {
        Self {
            destination: String::new(),
            mode: MigrationMode::File,
            method: MigrationMethod::Offline,
            destination_params: destination_params.into(),
            tunneled: false,
            abort_on_error: false,
            destination_qemu_address: None,
            target_downtime,
        }
    }
}

/// Terminal status codes a migration can land on. `InProgress` (code 0 in
/// the source protocol) is not terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StatusCode {
    InProgress,
    /// The peer already has the VM.
    Exist,
    /// The peer is unreachable.
    NoConPeer,
    /// Generic failure during transfer.
    MigrateErr,
    /// User-initiated cancellation surfaced via hypervisor abort code.
    MigCancelErr,
}

impl StatusCode {
    pub fn is_terminal(self) -> bool {
        !matches!(self, StatusCode::InProgress)
    }
}

/// Mutable migration status, observed concurrently with the driver run via
/// `getStat`-equivalent polling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationStatus {
    pub code: StatusCode,
    pub message: String,
    /// 0-100. Monotonically non-decreasing while `code == InProgress`.
    pub progress: u8,
}

impl MigrationStatus {
    pub fn in_progress() -> Self {
        Self {
            code: StatusCode::InProgress,
            message: "Migration in progress".to_string(),
            progress: 0,
        }
    }

    pub fn set_terminal(&mut self, code: StatusCode, message: impl Into<String>) {
        self.code = code;
        self.message = message.into();
    }
}

impl Default for MigrationStatus {
    fn default() -> Self {
        Self::in_progress()
    }
}
