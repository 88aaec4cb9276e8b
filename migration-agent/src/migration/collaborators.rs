//! Collaborator seams (§6): the hypervisor domain connection, the peer
//! host-agent RPC client, the VM handle, and the lifecycle hook dispatcher.
//!
//! All four are out of scope for this crate (hypervisor internals, the RPC
//! transport, volume provisioning, destination-side logic) — they are
//! modeled as async traits so the driver, ramp, and monitor can be exercised
//! against the deterministic fakes in [`crate::migration::mock`] without a
//! real libvirt connection or peer agent.

use async_trait::async_trait;
use bitflags::bitflags;
use serde_json::{Map, Value};

bitflags! {
    /// Mirrors the libvirt `VIR_MIGRATE_*` flags `migrateToURI` accepts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MigrateFlags: u32 {
        const LIVE           = 0b0001;
        const PEER2PEER      = 0b0010;
        const TUNNELLED      = 0b0100;
        const ABORT_ON_ERROR = 0b1000;
    }
}

/// A hypervisor-semantic error. `code`/`domain`/`level` mirror the fields a
/// libvirt error carries; the driver only ever inspects `code` to recognize
/// the operation-aborted signal raised after `stop()`/`abortJob`.
#[derive(Debug, Clone)]
pub struct DomainError {
    pub code: String,
    pub domain: String,
    pub message: String,
    pub level: String,
}

impl DomainError {
    /// The Abort signal of §4.1.b: `abortJob` (or a cancel observed right
    /// before `migrateToURI`) surfaces as this exact shape.
    pub fn operation_aborted() -> Self {
        Self {
            code: "operation aborted".to_string(),
            domain: "qemu".to_string(),
            message: "operation aborted".to_string(),
            level: "warning".to_string(),
        }
    }

    pub fn other(domain: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: "error".to_string(),
            domain: domain.into(),
            message: message.into(),
            level: "error".to_string(),
        }
    }

    pub fn is_operation_aborted(&self) -> bool {
        self.code == "operation aborted"
    }
}

impl std::fmt::Display for DomainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}: {}", self.domain, self.level, self.message)
    }
}

impl std::error::Error for DomainError {}

/// A single sample of `jobInfo()`. `data_remaining` includes both memory and
/// file progress, per §6.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobInfo {
    /// 0 means no job is active yet (a stale sample); the monitor skips it.
    pub job_type: u32,
    pub time_elapsed_ms: u64,
    pub data_total: u64,
    pub data_processed: u64,
    pub data_remaining: u64,
    pub mem_total: u64,
    pub mem_processed: u64,
    pub mem_remaining: u64,
    pub file_total: u64,
    pub file_processed: u64,
}

/// The hypervisor connection object (§1, §6): `describeDomain`,
/// `saveToFile`, `migrateToURI`, `abortJob`, `jobInfo`, `setMaxDowntime`.
#[async_trait]
pub trait HypervisorDomain: Send + Sync {
    async fn describe_domain(&self) -> Result<String, DomainError>;
    async fn save_to_file(&self, path: &str) -> Result<(), DomainError>;
    async fn migrate_to_uri(
        &self,
        dest_uri: &str,
        mig_uri: &str,
        max_bandwidth_mib: u64,
        flags: MigrateFlags,
    ) -> Result<(), DomainError>;
    async fn abort_job(&self) -> Result<(), DomainError>;
    async fn job_info(&self) -> Result<JobInfo, DomainError>;
    async fn set_max_downtime(&self, ms: u64) -> Result<(), DomainError>;
}

/// The peer host agent's response shape for `getVmStats`/`migrationCreate`:
/// `{status:{code,message}}`. Preserved verbatim rather than re-mapped, per
/// the Design Notes' "peer RPC coupling" guidance.
#[derive(Debug, Clone, Default)]
pub struct PeerStatus {
    pub code: i32,
    pub message: String,
}

/// The peer host-agent RPC client (§1, §6): `getVmStats`, `migrationCreate`,
/// `destroy`. An `Err` return models an RPC-level failure (peer
/// unreachable); an `Ok(PeerStatus)` with a non-zero `code` models a
/// peer-level refusal.
#[async_trait]
pub trait PeerAgentClient: Send + Sync {
    async fn get_vm_stats(&self, vm_id: &str) -> Result<PeerStatus, migrate_common::Error>;
    async fn migration_create(
        &self,
        params: Map<String, Value>,
    ) -> Result<PeerStatus, migrate_common::Error>;
    /// Best-effort teardown invoked during recovery; callers ignore the
    /// error, so implementations may return one to be logged but never
    /// propagated.
    async fn destroy(&self, vm_id: &str) -> Result<(), migrate_common::Error>;
}

/// A custom device attached to the VM, enumerated for
/// `before_device_migrate_source` hook dispatch.
#[derive(Debug, Clone)]
pub struct CustomDevice {
    pub device_xml: String,
    pub custom: Map<String, Value>,
}

/// The VM object (§1, §6): status, stats, pause/continue, guest-agent lock,
/// custom-device enumeration, and a persisted-config map.
#[async_trait]
pub trait VmHandle: Send + Sync {
    fn vm_id(&self) -> &str;

    /// Snapshot of the VM's current status map (phase 2's basis).
    async fn status(&self) -> Map<String, Value>;
    /// Live stats, used to selectively copy `username`/`guestIPs`/`guestFQDN`.
    async fn live_stats(&self) -> Map<String, Value>;

    /// Seconds since the VM started, for `elapsedTimeOffset`.
    fn elapsed_since_start_secs(&self) -> u64;
    /// Guest memory size, MiB — drives the downtime-ramp window and the
    /// monitor's wall-clock budget.
    fn mem_mib(&self) -> u64;

    fn display_type(&self) -> Option<String>;
    fn client_ip(&self) -> Option<String>;

    async fn pause(&self, reason: &str);
    async fn cont(&self);
    async fn set_last_status(&self, status: &str);
    async fn set_down_status(&self, reason: &str, message: &str);

    fn custom_devices(&self) -> Vec<CustomDevice>;

    async fn guest_agent_responsive(&self) -> bool;
    async fn guest_agent_desktop_lock(&self);
    /// Guest session status as reported by the agent: `"Locked"`,
    /// `"LoggedOff"`, or anything else while still unlocked.
    async fn guest_session_status(&self) -> String;

    /// Sets or clears `_migrationParams` on the persisted config map.
    async fn set_migration_params(&self, params: Option<Map<String, Value>>);
    async fn save_state(&self);

    async fn pause_stats_collector(&self);
    async fn resume_stats_collector(&self);

    /// SPICE ticket handover for `qxl` displays mid-transfer (§4.1.c step 7).
    async fn refresh_display_ticket(&self, handover_secs: u64);

    async fn prepare_volume_path(&self, raw_params: &str) -> String;
    async fn teardown_volume_path(&self, raw_params: &str);

    /// Writes the finalized save-state payload to the prepared volume path.
    /// Kept behind the VM handle seam alongside `prepare_volume_path` so the
    /// driver never touches storage directly (§6's volume-provisioning
    /// Non-goal).
    async fn write_save_state(
        &self,
        path: &str,
        payload: &[u8],
    ) -> Result<(), migrate_common::Error>;
}

/// Lifecycle hook dispatcher (§1, §6): pre-hibernate, pre-device-migrate,
/// pre-migrate.
#[async_trait]
pub trait HookDispatcher: Send + Sync {
    async fn before_vm_hibernate(&self, domain_xml: &str, conf: &Map<String, Value>);
    async fn before_device_migrate_source(
        &self,
        device_xml: &str,
        conf: &Map<String, Value>,
        custom: &Map<String, Value>,
    );
    async fn before_vm_migrate_source(&self, domain_xml: &str, conf: &Map<String, Value>);
}
