//! §4.1: the migration driver. Owns the phased lifecycle of a single
//! outbound migration: peer handshake, guest preparation, the global slot,
//! the underlying transfer (with the downtime ramp and progress monitor
//! running alongside it), finalization, and the all-paths cleanup.
//!
//! One [`MigrationDriver`] drives exactly one [`MigrationRequest`]. The
//! caller spawns `run` as a task and polls `get_stat`/calls `stop` from
//! wherever the surrounding agent tracks in-flight jobs — that bookkeeping
//! is out of scope here (§6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use migrate_common::migration::{MigrationMethod, MigrationMode, MigrationRequest, MigrationStatus, StatusCode};

use crate::config::MigrationConfig;
use crate::error::MigrationError;

use super::collaborators::{DomainError, HookDispatcher, HypervisorDomain, MigrateFlags, PeerAgentClient, VmHandle};
use super::downtime_ramp;
use super::legacy;
use super::progress_monitor::{self, ProgressMonitorHandle};
use super::slot::MigrationSlot;

/// Drives a single migration from start to terminal status. Never panics
/// and never propagates an error out of `run` — every failure is folded
/// into the status the caller observes through `get_stat`.
pub struct MigrationDriver {
    domain: Arc<dyn HypervisorDomain>,
    peer: Option<Arc<dyn PeerAgentClient>>,
    vm: Arc<dyn VmHandle>,
    hooks: Arc<dyn HookDispatcher>,
    config: MigrationConfig,
    request: MigrationRequest,

    status: RwLock<MigrationStatus>,
    monitor: Mutex<Option<ProgressMonitorHandle>>,

    /// Observed at the checkpoint right before the global slot is acquired
    /// and again right before the hypervisor transfer call (§4.1.b).
    checkpoint_cancel: CancellationToken,
    /// Shared by the downtime ramp and the progress monitor (§5 Ordering #1).
    worker_cancel: CancellationToken,
    /// Gates whether a `stop()` call still counts as "before the
    /// hypervisor call returned" (§4.1.b: aborting after that point is a
    /// no-op from the caller's perspective, the transfer runs to
    /// completion or fails on its own).
    preparing_migration: AtomicBool,
}

impl MigrationDriver {
    pub fn new(
        domain: Arc<dyn HypervisorDomain>,
        peer: Option<Arc<dyn PeerAgentClient>>,
        vm: Arc<dyn VmHandle>,
        hooks: Arc<dyn HookDispatcher>,
        config: MigrationConfig,
        request: MigrationRequest,
    ) -> Self {
        Self {
            domain,
            peer,
            vm,
            hooks,
            config,
            request,
            status: RwLock::new(MigrationStatus::in_progress()),
            monitor: Mutex::new(None),
            checkpoint_cancel: CancellationToken::new(),
            worker_cancel: CancellationToken::new(),
            preparing_migration: AtomicBool::new(true),
        }
    }

    /// Requests cancellation (§5 "Cancellation semantics"). Sets the
    /// checkpoint flag the driver observes post-slot-acquire and right
    /// before `migrateToURI`, then best-effort aborts the hypervisor job.
    /// If `abortJob` fails after the driver has already passed the
    /// preparing-migration checkpoint, the failure propagates to the
    /// caller; before that checkpoint there is no job to abort yet, so it's
    /// swallowed. Idempotent and safe to call at any time after `run`
    /// starts; never blocks on the driver itself.
    pub async fn stop(&self) -> Result<(), DomainError> {
        self.checkpoint_cancel.cancel();
        let still_preparing = self.preparing_migration.load(Ordering::SeqCst);
        match self.domain.abort_job().await {
            Ok(()) => Ok(()),
            Err(err) if still_preparing => {
                debug!(%err, "abortJob had nothing to abort yet, ignoring");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// The current status. While the progress monitor is running, its
    /// shared counter wins over whatever value the driver last wrote;
    /// once the monitor is torn down, `get_stat` keeps returning the last
    /// value the driver captured from it at teardown (§10: "monitor may
    /// not exist for a job's whole lifetime").
    pub async fn get_stat(&self) -> MigrationStatus {
        let mut status = self.status.read().await.clone();
        if let Some(handle) = self.monitor.lock().await.as_ref() {
            status.progress = handle.progress();
        }
        status
    }

    /// Drives the migration to a terminal status. Intended to be spawned as
    /// its own task; does not return a value because every outcome is
    /// recorded in `status` rather than propagated.
    pub async fn run(&self) {
        match self.try_migrate().await {
            Ok(()) => {}
            Err(err) => {
                let message = err.to_string();
                if matches!(err, MigrationError::Aborted) {
                    self.set_terminal_if_unset(StatusCode::MigCancelErr, "Migration canceled")
                        .await;
                }
                self.recover(message).await;
            }
        }
    }

    /// Phases 1-8 of §4.1. `Ok(())` covers both a genuine success and the
    /// early "VM already exists on destination" exit — in neither case does
    /// the caller run recovery. Any `Err` is something `run` hands to
    /// `recover`.
    async fn try_migrate(&self) -> Result<(), MigrationError> {
        let start_time = Instant::now();

        // Phase 1: peer connect (remote mode only). Kept alive past this
        // block so phase 6 doesn't need to re-derive it from `self.peer`.
        let mut remote_peer: Option<Arc<dyn PeerAgentClient>> = None;
        if self.request.mode == MigrationMode::Remote {
            let peer = self.peer.clone().ok_or_else(|| {
                MigrationError::Failed("remote migration requires a peer agent client".to_string())
            })?;

            match peer.get_vm_stats(self.vm.vm_id()).await {
                Ok(peer_status) if peer_status.code == 0 => {
                    debug!("destination already has this VM, aborting before acquiring a slot");
                    self.set_terminal_if_unset(StatusCode::Exist, "VM already exists on destination")
                        .await;
                    return Ok(());
                }
                Ok(_) => {
                    remote_peer = Some(peer);
                }
                Err(err) => {
                    warn!(%err, "cannot connect to destination host agent");
                    self.set_terminal_if_unset(StatusCode::NoConPeer, "could not connect to destination")
                        .await;
                    return Err(MigrationError::Failed(format!(
                        "cannot connect to destination: {err}"
                    )));
                }
            }
        }

        // Phase 2: snapshot machine params, legacy-patch them.
        let mut params = self.vm.status().await;
        params.insert(
            "elapsedTimeOffset".to_string(),
            json!(self.vm.elapsed_since_start_secs()),
        );
        let live_stats = self.vm.live_stats().await;
        for key in ["username", "guestIPs", "guestFQDN"] {
            if let Some(value) = live_stats.get(key) {
                params.insert(key.to_string(), value.clone());
            }
        }
        params.remove("_migrationParams");
        params.remove("pid");
        if self.request.mode != MigrationMode::File {
            params.insert("migrationDest".to_string(), json!("libvirt"));
        }
        let domain_xml = self
            .domain
            .describe_domain()
            .await
            .map_err(MigrationError::from)?;
        params.insert("_srcDomXML".to_string(), json!(domain_xml));
        legacy::apply_legacy_patch(&mut params);

        // Phase 3: prepare the guest.
        self.prepare_guest().await;

        // Phase 4: acquire the global slot, then re-check cancellation.
        let permit = MigrationSlot::acquire().await;
        if self.checkpoint_cancel.is_cancelled() {
            return Err(MigrationError::Aborted);
        }

        // Phase 5: record and persist migration params.
        let migration_record = json!({
            "destination": self.request.destination,
            "mode": match self.request.mode {
                MigrationMode::Remote => "remote",
                MigrationMode::File => "file",
            },
            "method": match self.request.method {
                MigrationMethod::Online => "online",
                MigrationMethod::Offline => "offline",
            },
            "dstparams": self.request.destination_params,
            "dstqemu": self.request.destination_qemu_address,
        });
        self.vm
            .set_migration_params(migration_record.as_object().cloned())
            .await;
        self.vm.save_state().await;

        // Phase 6: invoke the underlying transfer.
        let transfer_result = match self.request.mode {
            MigrationMode::File => self.transfer_to_file(&params).await,
            MigrationMode::Remote => {
                self.transfer_to_remote(&params, start_time, remote_peer.clone()).await
            }
        };

        // Phase 7: finalize on success only.
        let outcome = match transfer_result {
            Ok(()) => {
                self.finalize(&mut params).await;
                Ok(())
            }
            Err(err) => Err(err),
        };

        // Phase 8: always clean up, regardless of outcome.
        self.vm.set_migration_params(None).await;
        drop(permit);

        outcome
    }

    async fn prepare_guest(&self) {
        match self.request.mode {
            MigrationMode::File => {
                debug!("hibernating guest for save-to-file migration");
                self.vm.guest_agent_desktop_lock().await;
                if self.vm.guest_agent_responsive().await {
                    let mut waited = 0u32;
                    loop {
                        let session = self.vm.guest_session_status().await;
                        if session == "Locked" || session == "LoggedOff" {
                            break;
                        }
                        if waited >= 30 {
                            warn!("guest agent desktop lock wait timed out after 30s");
                            break;
                        }
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        waited += 1;
                    }
                } else {
                    warn!("guest agent unresponsive, hibernating without a desktop lock");
                }
                self.vm.pause("Saving State").await;
            }
            MigrationMode::Remote => {
                self.vm.set_last_status("Migration Source").await;
            }
        }
    }

    /// §4.1.c, file mode: prepare the volume path, `saveToFile`, tear down
    /// the path on every exit, and resume the statistics collector (not the
    /// VM itself — Open Question 2, preserved from the source) on failure.
    async fn transfer_to_file(&self, params: &Map<String, Value>) -> Result<(), MigrationError> {
        let domain_xml = self
            .domain
            .describe_domain()
            .await
            .map_err(MigrationError::from)?;
        self.hooks.before_vm_hibernate(&domain_xml, params).await;
        self.vm.pause_stats_collector().await;

        let path = self.vm.prepare_volume_path(&self.request.destination_params).await;
        let save_result = self.domain.save_to_file(&path).await;
        self.vm.teardown_volume_path(&self.request.destination_params).await;

        match save_result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.vm.resume_stats_collector().await;
                Err(MigrationError::from(err))
            }
        }
    }

    /// §4.1.c, remote mode: device/VM hooks, `migrationCreate`, spawn the
    /// ramp and monitor, hand over a SPICE ticket if needed, check
    /// cancellation one last time, then `migrateToURI`.
    async fn transfer_to_remote(
        &self,
        params: &Map<String, Value>,
        start_time: Instant,
        peer: Option<Arc<dyn PeerAgentClient>>,
    ) -> Result<(), MigrationError> {
        for device in self.vm.custom_devices() {
            self.hooks
                .before_device_migrate_source(&device.device_xml, params, &device.custom)
                .await;
        }
        let domain_xml = self
            .domain
            .describe_domain()
            .await
            .map_err(MigrationError::from)?;
        self.hooks.before_vm_migrate_source(&domain_xml, params).await;

        let peer = peer.ok_or_else(|| {
            MigrationError::Failed("remote migration requires a peer agent client".to_string())
        })?;
        let create_status = peer
            .migration_create(params.clone())
            .await
            .map_err(MigrationError::from)?;
        if create_status.code != 0 {
            // The typed `StatusCode` enum has no slot for the peer's numeric
            // code, so only its message is adopted verbatim here rather than
            // the full `{status:{code,message}}` shape (§4.1.c step 3).
            self.set_terminal_if_unset(StatusCode::MigrateErr, create_status.message.clone())
                .await;
            return Err(MigrationError::Failed(format!(
                "destination refused migrationCreate: {}",
                create_status.message
            )));
        }

        let (remote_host, _) = canonicalize_host_port(&self.request.destination, self.config.control_port);
        let transport = if self.config.ssl { "tls" } else { "tcp" };
        let dest_uri = format!("qemu+{transport}://{remote_host}/system");
        let mig_uri = match self.request.destination_qemu_address.as_deref() {
            Some(addr) if !addr.is_empty() => format!("tcp://{addr}"),
            _ => format!("tcp://{remote_host}"),
        };

        let target_downtime = self.target_downtime();
        let ramp = downtime_ramp::spawn(
            self.domain.clone(),
            target_downtime,
            self.config.downtime_steps,
            self.config.downtime_delay_ms_per_gib,
            self.vm.mem_mib(),
            self.worker_cancel.clone(),
        );

        if self.config.monitor_interval > Duration::ZERO {
            let handle = progress_monitor::spawn(
                self.domain.clone(),
                self.config.monitor_interval,
                start_time,
                self.vm.mem_mib(),
                self.config.max_time_per_gib_mem_secs,
                self.config.progress_timeout,
                self.worker_cancel.clone(),
            );
            *self.monitor.lock().await = Some(handle);
        }

        if let (Some(display_type), Some(client_ip)) = (self.vm.display_type(), self.vm.client_ip()) {
            if display_type == "qxl" && !client_ip.is_empty() {
                self.vm.refresh_display_ticket(120).await;
            }
        }

        self.preparing_migration.store(false, Ordering::SeqCst);

        let migrate_result = if self.checkpoint_cancel.is_cancelled() {
            Err(DomainError::operation_aborted())
        } else {
            let mut flags = MigrateFlags::LIVE | MigrateFlags::PEER2PEER;
            if self.request.tunneled {
                flags |= MigrateFlags::TUNNELLED;
            }
            if self.request.abort_on_error {
                flags |= MigrateFlags::ABORT_ON_ERROR;
            }
            self.domain
                .migrate_to_uri(&dest_uri, &mig_uri, self.config.max_bandwidth_mib, flags)
                .await
        };

        // Step 9: release-on-all-paths for the ramp and monitor.
        self.worker_cancel.cancel();
        drop(ramp);
        if let Some(handle) = self.monitor.lock().await.take() {
            self.status.write().await.progress = handle.progress();
            handle.stop();
        }

        migrate_result.map_err(MigrationError::from)
    }

    /// §4.1 phase 7, success only: mark the VM down on the source side and
    /// record a 100% terminal status. File mode also strips transient
    /// fields and persists the params map through the save-state payload.
    async fn finalize(&self, params: &mut Map<String, Value>) {
        match self.request.mode {
            MigrationMode::Remote => {
                self.vm
                    .set_down_status("MIGRATION_SUCCEEDED", "Migration done")
                    .await;
                let mut status = self.status.write().await;
                status.progress = 100;
                status.message = "Migration done".to_string();
            }
            MigrationMode::File => {
                for key in ["displayIp", "display", "pid"] {
                    params.remove(key);
                }
                let path = self.vm.prepare_volume_path(&self.request.destination_params).await;
                let payload = serde_json::to_vec(params).unwrap_or_default();
                let write_result = self.vm.write_save_state(&path, &payload).await;
                self.vm.teardown_volume_path(&self.request.destination_params).await;
                if let Err(err) = write_result {
                    warn!(%err, %path, "failed to persist save-state payload");
                }
                self.vm
                    .set_down_status("SAVE_STATE_SUCCEEDED", "SaveState done")
                    .await;
                let mut status = self.status.write().await;
                status.progress = 100;
                status.message = "SaveState done".to_string();
            }
        }
    }

    /// §4.1 Recovery. Runs for every failure `try_migrate` surfaces except
    /// the early "already exists" exit (that one never touches the guest).
    async fn recover(&self, message: String) {
        {
            let mut status = self.status.write().await;
            if status.code == StatusCode::InProgress {
                status.code = StatusCode::MigrateErr;
                status.message = message.clone();
            }
        }
        error!(%message, "migration failed, recovering");

        if self.request.mode == MigrationMode::Remote {
            if let Some(peer) = &self.peer {
                if let Err(err) = peer.destroy(self.vm.vm_id()).await {
                    warn!(%err, "failed to destroy VM on destination during recovery");
                }
            }
        }

        if self.request.mode == MigrationMode::File || self.request.method == MigrationMethod::Offline {
            self.vm.cont().await;
        }
        self.vm.set_last_status("Up").await;
    }

    fn target_downtime(&self) -> u64 {
        if self.request.target_downtime > 0 {
            self.request.target_downtime
        } else {
            self.config.downtime_ms
        }
    }

    async fn set_terminal_if_unset(&self, code: StatusCode, message: impl Into<String>) {
        let mut status = self.status.write().await;
        if status.code == StatusCode::InProgress {
            status.set_terminal(code, message.into());
        }
    }
}

/// Splits a `host:port` destination string, falling back to the configured
/// control port when no port is present or it doesn't parse.
fn canonicalize_host_port(destination: &str, control_port: u16) -> (String, u16) {
    if let Some((host, port_str)) = destination.rsplit_once(':') {
        if let Ok(port) = port_str.parse::<u16>() {
            return (host.to_string(), port);
        }
    }
    (destination.to_string(), control_port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::mock::{
        CreateOutcome, MockHookDispatcher, MockHypervisorDomain, MockPeerAgentClient, MockVmHandle,
        ProbeOutcome,
    };
    use migrate_common::migration::MigrationRequest;

    fn test_config() -> MigrationConfig {
        let mut config = MigrationConfig::default();
        config.monitor_interval = Duration::from_millis(5);
        config.downtime_steps = 2;
        config.downtime_delay_ms_per_gib = 1;
        config
    }

    #[tokio::test]
    async fn peer_already_has_vm_sets_exist_without_touching_guest() {
        let domain = Arc::new(MockHypervisorDomain::new());
        let peer: Arc<dyn PeerAgentClient> = Arc::new(MockPeerAgentClient::new(
            ProbeOutcome::AlreadyExists,
            CreateOutcome::Accepted,
        ));
        let vm = Arc::new(MockVmHandle::new("vm-1"));
        let hooks = Arc::new(MockHookDispatcher::new());
        let request = MigrationRequest::remote(
            "dest.example.com",
            migrate_common::migration::MigrationMethod::Online,
            500,
        );

        let driver = MigrationDriver::new(domain, Some(peer), vm.clone(), hooks, test_config(), request);
        driver.run().await;

        let status = driver.get_stat().await;
        assert_eq!(status.code, StatusCode::Exist);
        assert_eq!(vm.last_status(), "Up");
        assert!(!vm.is_paused());
    }

    #[tokio::test]
    async fn peer_unreachable_sets_no_con_peer_and_recovers() {
        let domain = Arc::new(MockHypervisorDomain::new());
        let peer: Arc<dyn PeerAgentClient> = Arc::new(MockPeerAgentClient::new(
            ProbeOutcome::Unreachable,
            CreateOutcome::Accepted,
        ));
        let vm = Arc::new(MockVmHandle::new("vm-1"));
        let hooks = Arc::new(MockHookDispatcher::new());
        let request = MigrationRequest::remote(
            "dest.example.com",
            migrate_common::migration::MigrationMethod::Online,
            500,
        );

        let driver = MigrationDriver::new(domain, Some(peer), vm.clone(), hooks, test_config(), request);
        driver.run().await;

        let status = driver.get_stat().await;
        assert_eq!(status.code, StatusCode::NoConPeer);
        assert_eq!(vm.last_status(), "Up");
    }

    #[tokio::test]
    async fn successful_remote_migration_reaches_full_progress() {
        let domain = Arc::new(MockHypervisorDomain::new());
        let peer: Arc<dyn PeerAgentClient> = Arc::new(MockPeerAgentClient::reachable_and_absent());
        let vm = Arc::new(MockVmHandle::new("vm-1"));
        let hooks = Arc::new(MockHookDispatcher::new());
        let request = MigrationRequest::remote(
            "dest.example.com:54321",
            migrate_common::migration::MigrationMethod::Online,
            500,
        );

        let driver = MigrationDriver::new(domain.clone(), Some(peer), vm.clone(), hooks, test_config(), request);
        driver.run().await;

        let status = driver.get_stat().await;
        assert_eq!(status.progress, 100);
        assert_eq!(status.code, StatusCode::InProgress);
        assert_eq!(vm.down_status(), Some(("MIGRATION_SUCCEEDED".to_string(), "Migration done".to_string())));
        assert_eq!(domain.migrate_calls().len(), 1);
    }

    #[tokio::test]
    async fn file_mode_with_unresponsive_guest_agent_pauses_and_saves() {
        let domain = Arc::new(MockHypervisorDomain::new());
        let vm = Arc::new(MockVmHandle::new("vm-1").with_guest_agent_unresponsive());
        let hooks = Arc::new(MockHookDispatcher::new());
        let request = MigrationRequest::to_file("vm-1-save", 500);

        let driver = MigrationDriver::new(domain.clone(), None, vm.clone(), hooks, test_config(), request);
        driver.run().await;

        assert_eq!(domain.save_calls().len(), 1);
        let (_, saved) = vm.saved_state().expect("save-state payload recorded");
        assert!(!saved.contains_key("displayIp"));
        assert!(!saved.contains_key("display"));
        assert!(!saved.contains_key("pid"));
        let status = driver.get_stat().await;
        assert_eq!(status.progress, 100);
    }

    #[tokio::test]
    async fn stop_before_hypervisor_call_cancels_without_migrating() {
        let domain = Arc::new(MockHypervisorDomain::new());
        let peer: Arc<dyn PeerAgentClient> = Arc::new(MockPeerAgentClient::reachable_and_absent());
        let vm = Arc::new(MockVmHandle::new("vm-1"));
        let hooks = Arc::new(MockHookDispatcher::new());
        let request = MigrationRequest::remote(
            "dest.example.com",
            migrate_common::migration::MigrationMethod::Online,
            500,
        );

        let driver = Arc::new(MigrationDriver::new(
            domain.clone(),
            Some(peer),
            vm.clone(),
            hooks,
            test_config(),
            request,
        ));
        driver.stop().await.expect("abortJob has nothing to abort yet");
        driver.run().await;

        let status = driver.get_stat().await;
        assert_eq!(status.code, StatusCode::MigCancelErr);
        assert!(domain.migrate_calls().is_empty());
    }

    #[test]
    fn canonicalizes_host_and_port() {
        assert_eq!(
            canonicalize_host_port("host.example.com:1234", 54321),
            ("host.example.com".to_string(), 1234)
        );
        assert_eq!(
            canonicalize_host_port("host.example.com", 54321),
            ("host.example.com".to_string(), 54321)
        );
    }
}
