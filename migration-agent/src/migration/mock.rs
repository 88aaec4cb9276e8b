//! Deterministic in-memory fakes for the four collaborator traits (§6).
//!
//! The crate ships no concrete libvirt/RPC binding — these mocks are the
//! only way the driver, ramp, and monitor can be exercised, in unit tests
//! alongside each module and in the integration suite under `tests/`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::collaborators::{
    CustomDevice, DomainError, HookDispatcher, HypervisorDomain, JobInfo, MigrateFlags,
    PeerAgentClient, PeerStatus, VmHandle,
};

/// A scripted sequence of `jobInfo()` samples. Once exhausted, the last
/// entry repeats indefinitely (mirrors a transfer that has reached a
/// steady state).
pub struct MockHypervisorDomain {
    job_infos: Vec<JobInfo>,
    job_info_idx: AtomicUsize,
    downtime_calls: Mutex<Vec<u64>>,
    abort_calls: AtomicUsize,
    migrate_calls: Mutex<Vec<(String, String, u64, MigrateFlags)>>,
    save_calls: Mutex<Vec<String>>,
    migrate_result: Mutex<Option<DomainError>>,
    save_result: Mutex<Option<DomainError>>,
    describe_xml: String,
    /// When set, `migrate_to_uri` blocks (polling, not sleeping the whole
    /// test) until `abort_job` has been called at least once, then returns
    /// `migrate_result` (defaulting to the aborted-operation error). Models
    /// a real hypervisor's blocking `migrateToURI` surfacing the abort the
    /// progress monitor triggered.
    block_migrate_until_abort: bool,
}

impl MockHypervisorDomain {
    pub fn new() -> Self {
        Self {
            job_infos: Vec::new(),
            job_info_idx: AtomicUsize::new(0),
            downtime_calls: Mutex::new(Vec::new()),
            abort_calls: AtomicUsize::new(0),
            migrate_calls: Mutex::new(Vec::new()),
            save_calls: Mutex::new(Vec::new()),
            migrate_result: Mutex::new(None),
            save_result: Mutex::new(None),
            describe_xml: "<domain/>".to_string(),
            block_migrate_until_abort: false,
        }
    }

    /// Makes `migrate_to_uri` block until `abort_job` is observed, then
    /// return the aborted-operation error (or `migrate_result` if one was
    /// also configured).
    pub fn with_migrate_blocks_until_abort(mut self) -> Self {
        self.block_migrate_until_abort = true;
        self
    }

    pub fn with_job_infos(job_infos: Vec<JobInfo>) -> Self {
        Self {
            job_infos,
            ..Self::new()
        }
    }

    /// Makes `migrate_to_uri` fail with the given error instead of
    /// succeeding.
    pub fn with_migrate_failure(self, err: DomainError) -> Self {
        *self.migrate_result.lock().unwrap() = Some(err);
        self
    }

    pub fn downtime_calls(&self) -> Vec<u64> {
        self.downtime_calls.lock().unwrap().clone()
    }

    pub fn abort_calls(&self) -> usize {
        self.abort_calls.load(Ordering::SeqCst)
    }

    pub fn migrate_calls(&self) -> Vec<(String, String, u64, MigrateFlags)> {
        self.migrate_calls.lock().unwrap().clone()
    }

    pub fn save_calls(&self) -> Vec<String> {
        self.save_calls.lock().unwrap().clone()
    }
}

impl Default for MockHypervisorDomain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HypervisorDomain for MockHypervisorDomain {
    async fn describe_domain(&self) -> Result<String, DomainError> {
        Ok(self.describe_xml.clone())
    }

    async fn save_to_file(&self, path: &str) -> Result<(), DomainError> {
        self.save_calls.lock().unwrap().push(path.to_string());
        match self.save_result.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn migrate_to_uri(
        &self,
        dest_uri: &str,
        mig_uri: &str,
        max_bandwidth_mib: u64,
        flags: MigrateFlags,
    ) -> Result<(), DomainError> {
        self.migrate_calls.lock().unwrap().push((
            dest_uri.to_string(),
            mig_uri.to_string(),
            max_bandwidth_mib,
            flags,
        ));

        if self.block_migrate_until_abort {
            while self.abort_calls() == 0 {
                tokio::time::sleep(std::time::Duration::from_millis(1)).await;
            }
            return match self.migrate_result.lock().unwrap().clone() {
                Some(err) => Err(err),
                None => Err(DomainError::operation_aborted()),
            };
        }

        match self.migrate_result.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn abort_job(&self) -> Result<(), DomainError> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn job_info(&self) -> Result<JobInfo, DomainError> {
        if self.job_infos.is_empty() {
            return Ok(JobInfo::default());
        }
        let idx = self.job_info_idx.fetch_add(1, Ordering::SeqCst);
        Ok(self.job_infos[idx.min(self.job_infos.len() - 1)])
    }

    async fn set_max_downtime(&self, ms: u64) -> Result<(), DomainError> {
        self.downtime_calls.lock().unwrap().push(ms);
        Ok(())
    }
}

/// Scripted peer-agent behavior for `getVmStats`/`migrationCreate`/`destroy`.
pub struct MockPeerAgentClient {
    probe: ProbeOutcome,
    create: CreateOutcome,
    create_calls: Mutex<Vec<Map<String, Value>>>,
    destroy_calls: AtomicUsize,
    destroy_fails: bool,
}

#[derive(Clone)]
pub enum ProbeOutcome {
    /// `getVmStats` returns a non-zero code: the VM isn't on the peer yet.
    NotPresent,
    /// `getVmStats` returns a zero code: the VM already exists there.
    AlreadyExists,
    /// The RPC call itself fails.
    Unreachable,
}

#[derive(Clone)]
pub enum CreateOutcome {
    Accepted,
    Refused(String),
}

impl MockPeerAgentClient {
    pub fn new(probe: ProbeOutcome, create: CreateOutcome) -> Self {
        Self {
            probe,
            create,
            create_calls: Mutex::new(Vec::new()),
            destroy_calls: AtomicUsize::new(0),
            destroy_fails: false,
        }
    }

    pub fn reachable_and_absent() -> Self {
        Self::new(ProbeOutcome::NotPresent, CreateOutcome::Accepted)
    }

    pub fn with_destroy_failure(mut self) -> Self {
        self.destroy_fails = true;
        self
    }

    pub fn create_calls(&self) -> Vec<Map<String, Value>> {
        self.create_calls.lock().unwrap().clone()
    }

    pub fn destroy_calls(&self) -> usize {
        self.destroy_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerAgentClient for MockPeerAgentClient {
    async fn get_vm_stats(&self, _vm_id: &str) -> Result<PeerStatus, migrate_common::Error> {
        match self.probe {
            ProbeOutcome::NotPresent => Ok(PeerStatus {
                code: 1,
                message: "not found".to_string(),
            }),
            ProbeOutcome::AlreadyExists => Ok(PeerStatus {
                code: 0,
                message: "VM already exists".to_string(),
            }),
            ProbeOutcome::Unreachable => Err(migrate_common::Error::PeerUnreachable(
                "connection refused".to_string(),
            )),
        }
    }

    async fn migration_create(
        &self,
        params: Map<String, Value>,
    ) -> Result<PeerStatus, migrate_common::Error> {
        self.create_calls.lock().unwrap().push(params);
        match &self.create {
            CreateOutcome::Accepted => Ok(PeerStatus {
                code: 0,
                message: "accepted".to_string(),
            }),
            CreateOutcome::Refused(msg) => Ok(PeerStatus {
                code: 1,
                message: msg.clone(),
            }),
        }
    }

    async fn destroy(&self, _vm_id: &str) -> Result<(), migrate_common::Error> {
        self.destroy_calls.fetch_add(1, Ordering::SeqCst);
        if self.destroy_fails {
            Err(migrate_common::Error::System("destroy refused".to_string()))
        } else {
            Ok(())
        }
    }
}

/// In-memory VM state: status/stats maps, pause/continue, guest-agent lock
/// progression, custom devices, and the persisted `_migrationParams` slot.
pub struct MockVmHandle {
    vm_id: String,
    status: Mutex<Map<String, Value>>,
    live_stats: Map<String, Value>,
    mem_mib: u64,
    elapsed_secs: u64,
    display_type: Option<String>,
    client_ip: Option<String>,
    paused: Mutex<Option<String>>,
    last_status: Mutex<String>,
    down_status: Mutex<Option<(String, String)>>,
    custom_devices: Vec<CustomDevice>,
    guest_agent_responsive: bool,
    guest_session_status: String,
    migration_params: Mutex<Option<Map<String, Value>>>,
    save_state_calls: AtomicUsize,
    stats_collector_paused: Mutex<bool>,
    display_ticket_calls: AtomicUsize,
    volume_paths: Mutex<Vec<String>>,
    saved_state: Mutex<Option<(String, Vec<u8>)>>,
}

impl MockVmHandle {
    pub fn new(vm_id: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
            status: Mutex::new(Map::new()),
            live_stats: Map::new(),
            mem_mib: 4096,
            elapsed_secs: 120,
            display_type: None,
            client_ip: None,
            paused: Mutex::new(None),
            last_status: Mutex::new("Up".to_string()),
            down_status: Mutex::new(None),
            custom_devices: Vec::new(),
            guest_agent_responsive: true,
            guest_session_status: "Locked".to_string(),
            migration_params: Mutex::new(None),
            save_state_calls: AtomicUsize::new(0),
            stats_collector_paused: Mutex::new(false),
            display_ticket_calls: AtomicUsize::new(0),
            volume_paths: Mutex::new(Vec::new()),
            saved_state: Mutex::new(None),
        }
    }

    pub fn with_mem_mib(mut self, mem_mib: u64) -> Self {
        self.mem_mib = mem_mib;
        self
    }

    pub fn with_display(mut self, display_type: &str, client_ip: &str) -> Self {
        self.display_type = Some(display_type.to_string());
        self.client_ip = Some(client_ip.to_string());
        self
    }

    pub fn with_guest_agent_unresponsive(mut self) -> Self {
        self.guest_agent_responsive = false;
        self
    }

    pub fn with_custom_devices(mut self, devices: Vec<CustomDevice>) -> Self {
        self.custom_devices = devices;
        self
    }

    pub fn is_paused(&self) -> bool {
        self.paused.lock().unwrap().is_some()
    }

    pub fn last_status(&self) -> String {
        self.last_status.lock().unwrap().clone()
    }

    pub fn down_status(&self) -> Option<(String, String)> {
        self.down_status.lock().unwrap().clone()
    }

    pub fn migration_params(&self) -> Option<Map<String, Value>> {
        self.migration_params.lock().unwrap().clone()
    }

    pub fn save_state_calls(&self) -> usize {
        self.save_state_calls.load(Ordering::SeqCst)
    }

    pub fn display_ticket_calls(&self) -> usize {
        self.display_ticket_calls.load(Ordering::SeqCst)
    }

    pub fn stats_collector_paused(&self) -> bool {
        *self.stats_collector_paused.lock().unwrap()
    }

    /// The last save-state payload written, decoded back to a JSON map for
    /// assertions (e.g. that `displayIp`/`display`/`pid` were stripped).
    pub fn saved_state(&self) -> Option<(String, Map<String, Value>)> {
        self.saved_state.lock().unwrap().clone().map(|(path, bytes)| {
            let value: Map<String, Value> =
                serde_json::from_slice(&bytes).expect("save-state payload is valid JSON");
            (path, value)
        })
    }
}

#[async_trait]
impl VmHandle for MockVmHandle {
    fn vm_id(&self) -> &str {
        &self.vm_id
    }

    async fn status(&self) -> Map<String, Value> {
        self.status.lock().unwrap().clone()
    }

    async fn live_stats(&self) -> Map<String, Value> {
        self.live_stats.clone()
    }

    fn elapsed_since_start_secs(&self) -> u64 {
        self.elapsed_secs
    }

    fn mem_mib(&self) -> u64 {
        self.mem_mib
    }

    fn display_type(&self) -> Option<String> {
        self.display_type.clone()
    }

    fn client_ip(&self) -> Option<String> {
        self.client_ip.clone()
    }

    async fn pause(&self, reason: &str) {
        *self.paused.lock().unwrap() = Some(reason.to_string());
    }

    async fn cont(&self) {
        *self.paused.lock().unwrap() = None;
    }

    async fn set_last_status(&self, status: &str) {
        *self.last_status.lock().unwrap() = status.to_string();
    }

    async fn set_down_status(&self, reason: &str, message: &str) {
        *self.down_status.lock().unwrap() = Some((reason.to_string(), message.to_string()));
        *self.last_status.lock().unwrap() = "Down".to_string();
    }

    fn custom_devices(&self) -> Vec<CustomDevice> {
        self.custom_devices.clone()
    }

    async fn guest_agent_responsive(&self) -> bool {
        self.guest_agent_responsive
    }

    async fn guest_agent_desktop_lock(&self) {}

    async fn guest_session_status(&self) -> String {
        self.guest_session_status.clone()
    }

    async fn set_migration_params(&self, params: Option<Map<String, Value>>) {
        *self.migration_params.lock().unwrap() = params;
    }

    async fn save_state(&self) {
        self.save_state_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn pause_stats_collector(&self) {
        *self.stats_collector_paused.lock().unwrap() = true;
    }

    async fn resume_stats_collector(&self) {
        *self.stats_collector_paused.lock().unwrap() = false;
    }

    async fn refresh_display_ticket(&self, _handover_secs: u64) {
        self.display_ticket_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn prepare_volume_path(&self, raw_params: &str) -> String {
        let path = format!("/var/lib/migrate/{raw_params}");
        self.volume_paths.lock().unwrap().push(path.clone());
        path
    }

    async fn teardown_volume_path(&self, _raw_params: &str) {}

    async fn write_save_state(
        &self,
        path: &str,
        payload: &[u8],
    ) -> Result<(), migrate_common::Error> {
        *self.saved_state.lock().unwrap() = Some((path.to_string(), payload.to_vec()));
        Ok(())
    }
}

/// Records every hook dispatch for assertion; dispatches nothing itself.
#[derive(Default)]
pub struct MockHookDispatcher {
    hibernate_calls: AtomicUsize,
    device_migrate_calls: AtomicUsize,
    migrate_source_calls: AtomicUsize,
}

impl MockHookDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hibernate_calls(&self) -> usize {
        self.hibernate_calls.load(Ordering::SeqCst)
    }

    pub fn device_migrate_calls(&self) -> usize {
        self.device_migrate_calls.load(Ordering::SeqCst)
    }

    pub fn migrate_source_calls(&self) -> usize {
        self.migrate_source_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HookDispatcher for MockHookDispatcher {
    async fn before_vm_hibernate(&self, _domain_xml: &str, _conf: &Map<String, Value>) {
        self.hibernate_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn before_device_migrate_source(
        &self,
        _device_xml: &str,
        _conf: &Map<String, Value>,
        _custom: &Map<String, Value>,
    ) {
        self.device_migrate_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn before_vm_migrate_source(&self, _domain_xml: &str, _conf: &Map<String, Value>) {
        self.migrate_source_calls.fetch_add(1, Ordering::SeqCst);
    }
}
